use crate::frame::EncodedFrameDecoder;
use attendance_core::{
    Clock, EventSink, FrameOutcome, FramePipeline, FrameSlot, PipelineSettings, PipelineState,
};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine is shutting down")]
    Closed,
    #[error("engine thread panicked")]
    Panicked,
}

/// Clone-safe handle to the engine thread.
///
/// Frames go through a single-entry slot: submitting never blocks, and a
/// frame still waiting when a newer one arrives is dropped.
#[derive(Clone)]
pub struct EngineHandle {
    slot: Arc<FrameSlot<String>>,
}

impl EngineHandle {
    /// Hand a frame to the engine. Returns its sequence number.
    pub fn submit(&self, payload: String) -> Result<u64, EngineError> {
        self.slot.submit(payload).ok_or(EngineError::Closed)
    }

    /// Frames replaced before the engine got to them.
    pub fn dropped(&self) -> u64 {
        self.slot.dropped()
    }

    pub fn latest_seq(&self) -> u64 {
        self.slot.latest_seq()
    }
}

/// Owns the engine thread; dropping it without [`shutdown`](Self::shutdown) detaches the thread.
pub struct Engine {
    handle: EngineHandle,
    thread: JoinHandle<()>,
}

impl Engine {
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Refuse further frames, let the in-flight frame finish, then join the thread.
    pub fn shutdown(self) -> Result<(), EngineError> {
        self.handle.slot.close();
        self.thread.join().map_err(|_| EngineError::Panicked)
    }
}

/// Spawn the frame pipeline on a dedicated OS thread.
///
/// The thread takes the newest pending frame, runs one full cycle, and
/// repeats until the slot is closed.
pub fn spawn_engine(
    state: Arc<PipelineState>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    settings: PipelineSettings,
) -> Result<Engine, EngineError> {
    let slot: Arc<FrameSlot<String>> = Arc::new(FrameSlot::new());
    let mut pipeline = FramePipeline::new(EncodedFrameDecoder, state, sink, clock, settings);

    let thread = {
        let slot = Arc::clone(&slot);
        std::thread::Builder::new()
            .name("attendance-engine".into())
            .spawn(move || {
                tracing::info!("engine thread started");
                while let Some((frame, ticket)) = slot.take() {
                    match pipeline.process_frame(&frame, &ticket) {
                        Ok(FrameOutcome::Idle) => {
                            tracing::trace!(
                                seq = ticket.seq(),
                                "no session running; frame ignored"
                            );
                        }
                        Ok(FrameOutcome::Superseded) => {
                            tracing::debug!(seq = ticket.seq(), "frame superseded");
                        }
                        Ok(FrameOutcome::Processed(report)) => {
                            for warning in &report.warnings {
                                tracing::warn!(
                                    seq = ticket.seq(),
                                    error = %warning,
                                    "frame completed with errors"
                                );
                            }
                            tracing::debug!(
                                seq = ticket.seq(),
                                faces = report.faces,
                                recognized = report.recognized.len(),
                                attendance = report.attendance_written.len(),
                                departed = report.departed.len(),
                                "frame processed"
                            );
                        }
                        Err(err) => {
                            tracing::warn!(seq = ticket.seq(), error = %err, "frame failed");
                        }
                    }
                }
                tracing::info!("engine thread exiting");
            })?
    };

    Ok(Engine {
        handle: EngineHandle { slot },
        thread,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::DaemonSink;
    use crate::store::SqliteStore;
    use attendance_core::{
        CooldownPolicy, Embedding, Event, IdentityCache, IdentityStore, NewIdentity, Role,
        SystemClock,
    };
    use chrono::TimeDelta;
    use std::time::Duration;
    use tokio::sync::broadcast;

    #[test]
    fn test_submitted_frame_records_attendance() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let id = store
            .insert_identity(&NewIdentity {
                display_name: "Ada".into(),
                roll_number: "CS-1".into(),
                department: "Computing".into(),
                role: Role::Student,
                encoding: Embedding::new(vec![0.0, 0.0, 0.0]),
            })
            .unwrap();

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let staleness = TimeDelta::seconds(300);
        let cache = Arc::new(IdentityCache::new(store.clone(), clock.clone(), staleness));
        let state = Arc::new(PipelineState::new(cache, CooldownPolicy::default()));
        let (tx, mut rx) = broadcast::channel(16);
        let sink = Arc::new(DaemonSink::new(store.clone(), tx));

        let engine = spawn_engine(state.clone(), sink, clock, PipelineSettings::default()).unwrap();
        state.start_session();
        let handle = engine.handle();
        handle
            .submit(r#"{"faces":[{"encoding":[0.1,0.0,0.0]}]}"#.to_string())
            .unwrap();

        let mut kinds = Vec::new();
        for _ in 0..50 {
            while let Ok(event) = rx.try_recv() {
                kinds.push(event.kind());
                if let Event::RecognitionStatus { .. } = event {
                    break;
                }
            }
            if kinds.contains(&"recognition_status") {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(kinds, vec!["attendance_recorded", "user_recognized", "recognition_status"]);
        assert_eq!(store.attendance_rows(&id).len(), 1);

        engine.shutdown().unwrap();
        assert!(matches!(handle.submit("{}".into()), Err(EngineError::Closed)));
    }
}
