//! Snapshot-swapped cache of enrolled identities.
//!
//! Readers clone an `Arc` to the current snapshot and never hold a lock while
//! matching. A reload builds a complete new snapshot off to the side and
//! swaps the pointer; a failed reload leaves the previous snapshot in place.

use crate::clock::Clock;
use crate::retry;
use crate::store::{IdentityStore, StoreError};
use crate::sync::{lock, read, write};
use crate::types::IdentityRecord;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, TryLockError};
use thiserror::Error;

pub const DEFAULT_STALENESS_SECS: i64 = 300;
/// Minimum gap between automatic reload attempts after a failure.
pub const DEFAULT_RETRY_INTERVAL_SECS: i64 = 5;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("identity store: {0}")]
    Store(#[from] StoreError),
    #[error("malformed encoding for identity {id}: {reason}")]
    MalformedEncoding { id: String, reason: String },
    #[error("identity {id} has a {found}-dim encoding, expected {expected}")]
    InconsistentDimensions {
        id: String,
        expected: usize,
        found: usize,
    },
}

impl CacheError {
    /// Corruption that retrying will not fix and an operator has to look at.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CacheError::InconsistentDimensions { .. })
    }
}

/// Immutable view of the full identity set at one point in time.
#[derive(Debug, Clone)]
pub struct IdentityCacheSnapshot {
    identities: Vec<IdentityRecord>,
    loaded_at: Option<DateTime<Utc>>,
    staleness: TimeDelta,
}

impl IdentityCacheSnapshot {
    /// The placeholder served before the first successful load. Always stale.
    pub fn unloaded(staleness: TimeDelta) -> Self {
        Self {
            identities: Vec::new(),
            loaded_at: None,
            staleness,
        }
    }

    pub fn new(
        identities: Vec<IdentityRecord>,
        loaded_at: DateTime<Utc>,
        staleness: TimeDelta,
    ) -> Self {
        Self {
            identities,
            loaded_at: Some(loaded_at),
            staleness,
        }
    }

    /// Identities in store order. This order breaks matcher ties.
    pub fn identities(&self) -> &[IdentityRecord] {
        &self.identities
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Encoding dimension shared by every identity, if any are loaded.
    pub fn dimension(&self) -> Option<usize> {
        self.identities.first().map(|r| r.encoding.dim())
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.loaded_at {
            None => true,
            Some(at) => now - at > self.staleness,
        }
    }
}

/// Check every encoding before it can reach the matcher.
fn validate(identities: &[IdentityRecord], expected_dim: Option<usize>) -> Result<(), CacheError> {
    let mut dim = expected_dim;
    for record in identities {
        if record.encoding.values.is_empty() {
            return Err(CacheError::MalformedEncoding {
                id: record.id.to_string(),
                reason: "empty encoding".into(),
            });
        }
        if !record.encoding.is_finite() {
            return Err(CacheError::MalformedEncoding {
                id: record.id.to_string(),
                reason: "non-finite component".into(),
            });
        }
        match dim {
            None => dim = Some(record.encoding.dim()),
            Some(expected) if expected != record.encoding.dim() => {
                return Err(CacheError::InconsistentDimensions {
                    id: record.id.to_string(),
                    expected,
                    found: record.encoding.dim(),
                });
            }
            Some(_) => {}
        }
    }
    Ok(())
}

pub struct IdentityCache {
    store: Arc<dyn IdentityStore>,
    clock: Arc<dyn Clock>,
    staleness: TimeDelta,
    reload_attempts: u32,
    expected_dim: Option<usize>,
    retry_interval: TimeDelta,
    last_failure: Mutex<Option<DateTime<Utc>>>,
    current: RwLock<Arc<IdentityCacheSnapshot>>,
    invalidated: AtomicBool,
    /// Serializes reloads. Never held by readers.
    reloading: Mutex<()>,
    corruption_reported: AtomicBool,
}

impl IdentityCache {
    pub fn new(store: Arc<dyn IdentityStore>, clock: Arc<dyn Clock>, staleness: TimeDelta) -> Self {
        Self {
            store,
            clock,
            staleness,
            reload_attempts: 1,
            expected_dim: None,
            retry_interval: TimeDelta::seconds(DEFAULT_RETRY_INTERVAL_SECS),
            last_failure: Mutex::new(None),
            current: RwLock::new(Arc::new(IdentityCacheSnapshot::unloaded(staleness))),
            invalidated: AtomicBool::new(false),
            reloading: Mutex::new(()),
            corruption_reported: AtomicBool::new(false),
        }
    }

    /// Attempts per reload against the store before giving up until the next check.
    pub fn with_reload_attempts(mut self, attempts: u32) -> Self {
        self.reload_attempts = attempts.max(1);
        self
    }

    /// Require every encoding to have exactly this dimension.
    pub fn with_expected_dim(mut self, dim: usize) -> Self {
        self.expected_dim = Some(dim);
        self
    }

    /// How long automatic refreshes back off after a failed reload.
    /// Invalidation bypasses the back-off.
    pub fn with_retry_interval(mut self, interval: TimeDelta) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn current_snapshot(&self) -> Arc<IdentityCacheSnapshot> {
        Arc::clone(&read(&self.current))
    }

    /// Force the next staleness check to reload regardless of age.
    pub fn invalidate(&self) {
        tracing::debug!("identity cache invalidated");
        self.invalidated.store(true, Ordering::SeqCst);
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    pub fn needs_reload(&self) -> bool {
        if self.is_invalidated() {
            return true;
        }
        let now = self.clock.now();
        if let Some(failed_at) = *lock(&self.last_failure) {
            if now - failed_at <= self.retry_interval {
                return false;
            }
        }
        self.current_snapshot().is_stale(now)
    }

    /// Fetch the full identity set and swap in a new snapshot.
    ///
    /// Waits for any reload already in flight. On failure the previous
    /// snapshot stays current and the error is returned.
    pub fn reload(&self) -> Result<Arc<IdentityCacheSnapshot>, CacheError> {
        let _guard = lock(&self.reloading);
        self.reload_locked()
    }

    /// Reload only when stale or invalidated, and only if no other reload is running.
    ///
    /// Returns `None` when nothing was attempted.
    pub fn refresh_if_needed(&self) -> Option<Result<Arc<IdentityCacheSnapshot>, CacheError>> {
        if !self.needs_reload() {
            return None;
        }
        let _guard = match self.reloading.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        // Another reload may have completed between the check and the lock.
        if !self.needs_reload() {
            return None;
        }
        Some(self.reload_locked())
    }

    fn reload_locked(&self) -> Result<Arc<IdentityCacheSnapshot>, CacheError> {
        let was_invalidated = self.invalidated.swap(false, Ordering::SeqCst);

        let result = retry::with_attempts(self.reload_attempts, "list_identities", || {
            self.store.list_identities()
        })
        .map_err(CacheError::from)
        .and_then(|identities| {
            validate(&identities, self.expected_dim)?;
            Ok(identities)
        });

        match result {
            Ok(identities) => {
                let snapshot = Arc::new(IdentityCacheSnapshot::new(
                    identities,
                    self.clock.now(),
                    self.staleness,
                ));
                *write(&self.current) = Arc::clone(&snapshot);
                *lock(&self.last_failure) = None;
                self.corruption_reported.store(false, Ordering::SeqCst);
                tracing::info!(
                    identities = snapshot.len(),
                    dim = ?snapshot.dimension(),
                    "identity cache reloaded"
                );
                Ok(snapshot)
            }
            Err(err) => {
                *lock(&self.last_failure) = Some(self.clock.now());
                if was_invalidated {
                    self.invalidated.store(true, Ordering::SeqCst);
                }
                if err.is_fatal() {
                    if !self.corruption_reported.swap(true, Ordering::SeqCst) {
                        tracing::error!(
                            error = %err,
                            "identity store is corrupt; serving previous snapshot"
                        );
                    }
                } else {
                    tracing::warn!(
                        error = %err,
                        "identity cache reload failed; serving previous snapshot"
                    );
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::store::NewIdentity;
    use crate::types::{Embedding, IdentityId};
    use std::sync::atomic::AtomicU32;
    use std::sync::Barrier;

    #[derive(Default)]
    struct FakeStore {
        identities: Mutex<Vec<IdentityRecord>>,
        offline: AtomicBool,
        list_calls: AtomicU32,
        /// When set, a listing waits on the barrier once on entry and once before returning.
        gate: Mutex<Option<Arc<Barrier>>>,
    }

    impl FakeStore {
        fn put(&self, id: &str, values: Vec<f32>) {
            self.identities.lock().unwrap().push(IdentityRecord {
                id: IdentityId::from(id),
                display_name: id.to_uppercase(),
                roll_number: format!("R{id}"),
                department: "Physics".into(),
                role: crate::enrollment::Role::Student,
                encoding: Embedding::new(values),
            });
        }
    }

    impl IdentityStore for FakeStore {
        fn list_identities(&self) -> Result<Vec<IdentityRecord>, StoreError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            let gate = self.gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.wait();
                gate.wait();
            }
            if self.offline.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection refused".into()));
            }
            Ok(self.identities.lock().unwrap().clone())
        }

        fn insert_identity(&self, _: &NewIdentity) -> Result<IdentityId, StoreError> {
            unimplemented!()
        }

        fn remove_identity(&self, _: &IdentityId) -> Result<bool, StoreError> {
            unimplemented!()
        }

        fn insert_attendance(&self, _: &IdentityId, _: DateTime<Utc>) -> Result<(), StoreError> {
            unimplemented!()
        }
    }

    fn setup() -> (Arc<FakeStore>, Arc<ManualClock>, IdentityCache) {
        let store = Arc::new(FakeStore::default());
        let clock = Arc::new(ManualClock::new());
        let cache = IdentityCache::new(store.clone(), clock.clone(), TimeDelta::seconds(60));
        (store, clock, cache)
    }

    #[test]
    fn test_initial_snapshot_is_empty_and_stale() {
        let (_, clock, cache) = setup();
        let snap = cache.current_snapshot();
        assert!(snap.is_empty());
        assert!(snap.is_stale(clock.now()));
        assert!(cache.needs_reload());
    }

    #[test]
    fn test_empty_identity_set_is_valid() {
        let (_, _, cache) = setup();
        let snap = cache.reload().unwrap();
        assert!(snap.is_empty());
        assert!(snap.loaded_at().is_some());
        assert!(!cache.needs_reload());
    }

    #[test]
    fn test_reload_failure_keeps_previous_snapshot() {
        let (store, _, cache) = setup();
        store.put("a", vec![0.1, 0.2]);
        let good = cache.reload().unwrap();

        store.offline.store(true, Ordering::SeqCst);
        let err = cache.reload().unwrap_err();
        assert!(matches!(err, CacheError::Store(StoreError::Unavailable(_))));
        assert!(!err.is_fatal());

        let current = cache.current_snapshot();
        assert!(Arc::ptr_eq(&good, &current));
        assert_eq!(current.len(), 1);
    }

    #[test]
    fn test_reload_swaps_without_touching_old_snapshot() {
        let (store, _, cache) = setup();
        store.put("a", vec![0.1, 0.2]);
        let first = cache.reload().unwrap();

        store.put("b", vec![0.3, 0.4]);
        let second = cache.reload().unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 2);
        assert!(Arc::ptr_eq(&second, &cache.current_snapshot()));
    }

    #[test]
    fn test_readers_not_blocked_during_reload() {
        let (store, clock, cache) = setup();
        store.put("a", vec![0.1, 0.2]);
        let previous = cache.reload().unwrap();

        store.put("b", vec![0.3, 0.4]);
        let gate = Arc::new(Barrier::new(2));
        *store.gate.lock().unwrap() = Some(gate.clone());
        clock.set(61);

        std::thread::scope(|s| {
            let reload = s.spawn(|| cache.reload());
            // The reload is now inside list_identities holding the reload lock.
            gate.wait();
            assert!(Arc::ptr_eq(&previous, &cache.current_snapshot()));
            assert!(cache.needs_reload());
            assert!(cache.refresh_if_needed().is_none());
            gate.wait();

            let fresh = reload.join().unwrap().unwrap();
            assert_eq!(fresh.len(), 2);
            assert!(Arc::ptr_eq(&fresh, &cache.current_snapshot()));
        });
        assert_eq!(store.list_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_staleness_triggers_refresh() {
        let (store, clock, cache) = setup();
        cache.reload().unwrap();
        assert!(cache.refresh_if_needed().is_none());

        store.put("a", vec![0.1, 0.2]);
        clock.set(60);
        assert!(cache.refresh_if_needed().is_none());

        clock.set(61);
        let snap = cache.refresh_if_needed().unwrap().unwrap();
        assert_eq!(snap.len(), 1);
    }

    #[test]
    fn test_invalidate_forces_immediate_reload() {
        let (store, _, cache) = setup();
        cache.reload().unwrap();
        store.put("new", vec![0.5, 0.5]);

        cache.invalidate();
        let snap = cache.refresh_if_needed().unwrap().unwrap();
        assert_eq!(snap.len(), 1);
        assert!(!cache.is_invalidated());
    }

    #[test]
    fn test_failed_reload_keeps_invalidation_pending() {
        let (store, _, cache) = setup();
        cache.reload().unwrap();
        store.offline.store(true, Ordering::SeqCst);

        cache.invalidate();
        assert!(cache.refresh_if_needed().unwrap().is_err());
        assert!(cache.is_invalidated());

        store.offline.store(false, Ordering::SeqCst);
        assert!(cache.refresh_if_needed().unwrap().is_ok());
        assert!(!cache.is_invalidated());
    }

    #[test]
    fn test_failed_refresh_backs_off() {
        let (store, clock, cache) = setup();
        store.offline.store(true, Ordering::SeqCst);

        assert!(cache.refresh_if_needed().unwrap().is_err());
        clock.set(3);
        assert!(cache.refresh_if_needed().is_none());

        store.offline.store(false, Ordering::SeqCst);
        clock.set(6);
        assert!(cache.refresh_if_needed().unwrap().is_ok());
    }

    #[test]
    fn test_reload_retries_are_bounded() {
        let store = Arc::new(FakeStore::default());
        store.offline.store(true, Ordering::SeqCst);
        let clock = Arc::new(ManualClock::new());
        let cache = IdentityCache::new(store.clone(), clock, TimeDelta::seconds(60))
            .with_reload_attempts(3);

        assert!(cache.reload().is_err());
        assert_eq!(store.list_calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_inconsistent_dimensions_is_fatal() {
        let (store, _, cache) = setup();
        store.put("a", vec![0.1, 0.2]);
        store.put("b", vec![0.1, 0.2, 0.3]);

        let err = cache.reload().unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            CacheError::InconsistentDimensions { expected: 2, found: 3, .. }
        ));
        assert!(cache.current_snapshot().loaded_at().is_none());
    }

    #[test]
    fn test_expected_dimension_enforced() {
        let store = Arc::new(FakeStore::default());
        store.put("a", vec![0.1, 0.2]);
        let cache = IdentityCache::new(store, Arc::new(ManualClock::new()), TimeDelta::seconds(60))
            .with_expected_dim(128);
        assert!(cache.reload().unwrap_err().is_fatal());
    }

    #[test]
    fn test_non_finite_encoding_is_malformed() {
        let (store, _, cache) = setup();
        store.put("a", vec![0.1, f32::NAN]);
        let err = cache.reload().unwrap_err();
        assert!(matches!(err, CacheError::MalformedEncoding { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_snapshot_preserves_store_order() {
        let (store, _, cache) = setup();
        store.put("z", vec![0.0, 0.0]);
        store.put("a", vec![0.0, 0.0]);
        let snap = cache.reload().unwrap();
        let ids: Vec<&str> = snap.identities().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["z", "a"]);
    }
}
