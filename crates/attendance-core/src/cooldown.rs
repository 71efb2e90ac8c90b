//! Per-identity cooldowns for attendance writes and notifications.
//!
//! The two windows are tracked in separate maps and never influence each
//! other. Neither is touched by presence expiry, so someone stepping out and
//! back in within a window gets no duplicate row or notification.

use crate::sync::lock;
use crate::types::IdentityId;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

pub const DEFAULT_ATTENDANCE_COOLDOWN_SECS: i64 = 60;
pub const DEFAULT_NOTIFICATION_COOLDOWN_SECS: i64 = 300;

/// Minimum elapsed time before each action may repeat for the same identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownPolicy {
    pub attendance: TimeDelta,
    pub notification: TimeDelta,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self {
            attendance: TimeDelta::seconds(DEFAULT_ATTENDANCE_COOLDOWN_SECS),
            notification: TimeDelta::seconds(DEFAULT_NOTIFICATION_COOLDOWN_SECS),
        }
    }
}

#[derive(Debug)]
pub struct CooldownController {
    policy: CooldownPolicy,
    last_attendance: Timestamps,
    last_notification: Timestamps,
}

type Timestamps = Mutex<HashMap<IdentityId, DateTime<Utc>>>;

fn is_due(map: &Timestamps, id: &IdentityId, now: DateTime<Utc>, window: TimeDelta) -> bool {
    match lock(map).get(id) {
        None => true,
        Some(&last) => now - last > window,
    }
}

impl CooldownController {
    pub fn new(policy: CooldownPolicy) -> Self {
        Self {
            policy,
            last_attendance: Mutex::new(HashMap::new()),
            last_notification: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> CooldownPolicy {
        self.policy
    }

    /// True when no write was ever recorded for `id`, or the last one is older than the window.
    ///
    /// Does not advance the window: call [`record_written`](Self::record_written)
    /// once the write has actually succeeded.
    pub fn should_record_attendance(&self, id: &IdentityId, now: DateTime<Utc>) -> bool {
        is_due(&self.last_attendance, id, now, self.policy.attendance)
    }

    pub fn record_written(&self, id: &IdentityId, now: DateTime<Utc>) {
        lock(&self.last_attendance).insert(id.clone(), now);
    }

    /// True when no notification was ever emitted for `id`, or the last one
    /// is older than the window.
    pub fn should_emit_notification(&self, id: &IdentityId, now: DateTime<Utc>) -> bool {
        is_due(&self.last_notification, id, now, self.policy.notification)
    }

    pub fn record_notified(&self, id: &IdentityId, now: DateTime<Utc>) {
        lock(&self.last_notification).insert(id.clone(), now);
    }

    pub fn last_attendance(&self, id: &IdentityId) -> Option<DateTime<Utc>> {
        lock(&self.last_attendance).get(id).copied()
    }

    pub fn last_notification(&self, id: &IdentityId) -> Option<DateTime<Utc>> {
        lock(&self.last_notification).get(id).copied()
    }

    /// Forget notification history. Attendance history is kept so a session
    /// restart cannot produce duplicate rows.
    pub fn clear_notifications(&self) {
        lock(&self.last_notification).clear();
    }
}

impl Default for CooldownController {
    fn default() -> Self {
        Self::new(CooldownPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;

    /// Mimics the pipeline: decide, perform, then advance the window.
    fn attend(c: &CooldownController, id: &IdentityId, now: DateTime<Utc>) -> bool {
        let due = c.should_record_attendance(id, now);
        if due {
            c.record_written(id, now);
        }
        due
    }

    fn notify(c: &CooldownController, id: &IdentityId, now: DateTime<Utc>) -> bool {
        let due = c.should_emit_notification(id, now);
        if due {
            c.record_notified(id, now);
        }
        due
    }

    #[test]
    fn test_attendance_cooldown_window() {
        let clock = ManualClock::new();
        let c = CooldownController::default();
        let id = IdentityId::from("7");

        assert!(attend(&c, &id, clock.at(0)));
        assert!(!attend(&c, &id, clock.at(30)));
        assert!(!attend(&c, &id, clock.at(60)));
        assert!(attend(&c, &id, clock.at(61)));
    }

    #[test]
    fn test_window_not_advanced_without_record() {
        let clock = ManualClock::new();
        let c = CooldownController::default();
        let id = IdentityId::from("7");

        // A failed write never calls record_written, so the next frame retries.
        assert!(c.should_record_attendance(&id, clock.at(0)));
        assert!(c.should_record_attendance(&id, clock.at(1)));
        c.record_written(&id, clock.at(1));
        assert!(!c.should_record_attendance(&id, clock.at(2)));
    }

    #[test]
    fn test_notification_independent_of_attendance() {
        let clock = ManualClock::new();
        let c = CooldownController::default();
        let id = IdentityId::from("7");

        assert!(attend(&c, &id, clock.at(0)));
        assert!(notify(&c, &id, clock.at(0)));

        assert!(attend(&c, &id, clock.at(90)));
        assert!(!notify(&c, &id, clock.at(90)));

        assert!(!notify(&c, &id, clock.at(300)));
        assert!(notify(&c, &id, clock.at(301)));
    }

    #[test]
    fn test_identities_do_not_share_windows() {
        let clock = ManualClock::new();
        let c = CooldownController::default();
        let a = IdentityId::from("a");
        let b = IdentityId::from("b");

        assert!(attend(&c, &a, clock.at(0)));
        assert!(attend(&c, &b, clock.at(1)));
        assert!(!attend(&c, &a, clock.at(2)));
    }

    #[test]
    fn test_clear_notifications_keeps_attendance() {
        let clock = ManualClock::new();
        let c = CooldownController::default();
        let id = IdentityId::from("7");

        assert!(attend(&c, &id, clock.at(0)));
        assert!(notify(&c, &id, clock.at(0)));

        c.clear_notifications();

        assert!(c.last_notification(&id).is_none());
        assert_eq!(c.last_attendance(&id), Some(clock.at(0)));
        assert!(notify(&c, &id, clock.at(5)));
        assert!(!attend(&c, &id, clock.at(5)));
    }

    #[test]
    fn test_custom_policy() {
        let clock = ManualClock::new();
        let c = CooldownController::new(CooldownPolicy {
            attendance: TimeDelta::seconds(10),
            notification: TimeDelta::seconds(20),
        });
        let id = IdentityId::from("7");

        assert!(attend(&c, &id, clock.at(0)));
        assert!(attend(&c, &id, clock.at(11)));
        assert!(notify(&c, &id, clock.at(0)));
        assert!(!notify(&c, &id, clock.at(11)));
        assert!(notify(&c, &id, clock.at(21)));
    }
}
