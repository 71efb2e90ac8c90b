use crate::store::SqliteStore;
use attendance_core::{EmitError, Event, EventSink, IdentityStore};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Event sink for the daemon.
///
/// Attendance events are written to the database first; every event is then
/// broadcast to the D-Bus signal forwarder.
pub struct DaemonSink {
    store: Arc<SqliteStore>,
    tx: broadcast::Sender<Event>,
}

impl DaemonSink {
    pub fn new(store: Arc<SqliteStore>, tx: broadcast::Sender<Event>) -> Self {
        Self { store, tx }
    }
}

impl EventSink for DaemonSink {
    fn publish(&self, event: &Event) -> Result<(), EmitError> {
        if let Event::AttendanceRecorded { identity_id, at, .. } = event {
            self.store.insert_attendance(identity_id, *at)?;
        }
        match self.tx.send(event.clone()) {
            Ok(_) => Ok(()),
            // The row is already written; a missing listener must not roll that back.
            Err(_) if matches!(event, Event::AttendanceRecorded { .. }) => {
                tracing::debug!("attendance recorded with no signal listener");
                Ok(())
            }
            Err(_) => Err(EmitError::Delivery(format!("no listener for {}", event.kind()))),
        }
    }
}
