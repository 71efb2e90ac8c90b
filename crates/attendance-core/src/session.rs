//! Attendance session control.
//!
//! Starting or stopping a session clears presence and notification history
//! but keeps attendance history, so a quick stop/start cannot write a second
//! row for someone still inside the attendance window.
//!
//! Frame cycles and control actions share one lock: a control action waits
//! for the in-flight frame to finish, and the next frame sees its effect
//! before it begins.

use crate::cooldown::CooldownController;
use crate::presence::PresenceTracker;
use crate::sync::lock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub struct SessionControl {
    running: AtomicBool,
    cycle: Mutex<()>,
    presence: Arc<PresenceTracker>,
    cooldowns: Arc<CooldownController>,
}

/// Held for the duration of one frame cycle.
pub struct CycleGuard<'a> {
    _cycle: MutexGuard<'a, ()>,
}

impl SessionControl {
    pub fn new(presence: Arc<PresenceTracker>, cooldowns: Arc<CooldownController>) -> Self {
        Self {
            running: AtomicBool::new(false),
            cycle: Mutex::new(()),
            presence,
            cooldowns,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Begin a session. Returns false if one was already running (state is still reset).
    pub fn start_session(&self) -> bool {
        let _cycle = lock(&self.cycle);
        self.reset();
        let was_running = self.running.swap(true, Ordering::SeqCst);
        tracing::info!(was_running, "attendance session started");
        !was_running
    }

    /// End the session. Returns false if none was running.
    pub fn stop_session(&self) -> bool {
        let _cycle = lock(&self.cycle);
        let was_running = self.running.swap(false, Ordering::SeqCst);
        self.reset();
        tracing::info!(was_running, "attendance session stopped");
        was_running
    }

    fn reset(&self) {
        self.presence.clear();
        self.cooldowns.clear_notifications();
    }

    /// Enter a frame cycle if a session is running.
    ///
    /// Blocks while a control action is in progress.
    pub fn begin_cycle(&self) -> Option<CycleGuard<'_>> {
        let guard = lock(&self.cycle);
        if !self.is_running() {
            return None;
        }
        Some(CycleGuard { _cycle: guard })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::types::IdentityId;

    fn setup() -> (Arc<PresenceTracker>, Arc<CooldownController>, SessionControl) {
        let presence = Arc::new(PresenceTracker::new());
        let cooldowns = Arc::new(CooldownController::default());
        let session = SessionControl::new(presence.clone(), cooldowns.clone());
        (presence, cooldowns, session)
    }

    #[test]
    fn test_no_cycles_without_session() {
        let (_, _, session) = setup();
        assert!(!session.is_running());
        assert!(session.begin_cycle().is_none());

        assert!(session.start_session());
        assert!(session.begin_cycle().is_some());
        assert!(!session.start_session());

        assert!(session.stop_session());
        assert!(session.begin_cycle().is_none());
        assert!(!session.stop_session());
    }

    #[test]
    fn test_stop_start_preserves_attendance_cooldown_only() {
        let clock = ManualClock::new();
        let (presence, cooldowns, session) = setup();
        let id = IdentityId::from("9");

        session.start_session();
        presence.mark_seen(&id, clock.at(0));
        cooldowns.record_written(&id, clock.at(0));
        cooldowns.record_notified(&id, clock.at(0));

        session.stop_session();
        session.start_session();

        assert!(!presence.is_present(&id));
        assert!(cooldowns.should_emit_notification(&id, clock.at(1)));
        assert!(!cooldowns.should_record_attendance(&id, clock.at(1)));
    }

    #[test]
    fn test_control_waits_for_in_flight_cycle() {
        let (_, _, session) = setup();
        let session = Arc::new(session);
        session.start_session();

        let cycle = session.begin_cycle().unwrap();
        let stopper = {
            let session = Arc::clone(&session);
            std::thread::spawn(move || session.stop_session())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(session.is_running());
        drop(cycle);

        assert!(stopper.join().unwrap());
        assert!(!session.is_running());
    }
}
