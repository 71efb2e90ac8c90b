//! Who is currently in frame.
//!
//! An identity is Present from its first sighting until a sweep finds it
//! unseen for longer than the expiry window. Presence is informational only;
//! it never gates attendance writes or notifications.

use crate::sync::lock;
use crate::types::IdentityId;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// Default absence after which a Present identity is considered departed.
pub const DEFAULT_PRESENCE_EXPIRY_SECS: i64 = 30;

#[derive(Debug, Default)]
pub struct PresenceTracker {
    last_seen: Mutex<HashMap<IdentityId, DateTime<Utc>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sighting. Returns true when the identity was Absent before.
    pub fn mark_seen(&self, id: &IdentityId, now: DateTime<Utc>) -> bool {
        lock(&self.last_seen).insert(id.clone(), now).is_none()
    }

    /// Remove every identity unseen for strictly longer than `expiry`.
    ///
    /// Runs over the whole Present set, so identities that silently left the
    /// frame are caught even when nobody is detected. An identity marked seen
    /// at `now` is never removed by a sweep at the same `now`.
    /// Departures are returned oldest sighting first.
    pub fn sweep_expired(&self, now: DateTime<Utc>, expiry: TimeDelta) -> Vec<IdentityId> {
        self.take_expired(now, expiry)
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    /// Like [`sweep_expired`](Self::sweep_expired), keeping each departure's last sighting.
    pub fn take_expired(
        &self,
        now: DateTime<Utc>,
        expiry: TimeDelta,
    ) -> Vec<(IdentityId, DateTime<Utc>)> {
        let mut map = lock(&self.last_seen);
        let mut expired: Vec<(DateTime<Utc>, IdentityId)> = map
            .iter()
            .filter(|(_, seen)| now - **seen > expiry)
            .map(|(id, seen)| (*seen, id.clone()))
            .collect();
        expired.sort();
        for (_, id) in &expired {
            map.remove(id);
        }
        expired.into_iter().map(|(seen, id)| (id, seen)).collect()
    }

    /// Put swept entries back so a later sweep reports them again.
    /// An identity seen again since the sweep keeps its newer sighting.
    pub fn restore(&self, entries: impl IntoIterator<Item = (IdentityId, DateTime<Utc>)>) {
        let mut map = lock(&self.last_seen);
        for (id, seen) in entries {
            map.entry(id).or_insert(seen);
        }
    }

    pub fn is_present(&self, id: &IdentityId) -> bool {
        lock(&self.last_seen).contains_key(id)
    }

    pub fn last_seen(&self, id: &IdentityId) -> Option<DateTime<Utc>> {
        lock(&self.last_seen).get(id).copied()
    }

    /// Identities currently Present, in id order.
    pub fn present(&self) -> Vec<IdentityId> {
        let mut ids: Vec<IdentityId> = lock(&self.last_seen).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        lock(&self.last_seen).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.last_seen).clear();
    }
}
