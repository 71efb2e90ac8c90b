use crate::engine::EngineHandle;
use crate::frame::EncodedFrameDecoder;
use crate::store::SqliteStore;
use attendance_core::{
    select_enrollment_face, EnrollmentRequest, Event, FaceEncoder, IdentityId, IdentityStore,
    PipelineState,
};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use zbus::object_server::SignalEmitter;
use zbus::{interface, Connection};

pub const BUS_NAME: &str = "org.attendance.Recognition1";
pub const OBJECT_PATH: &str = "/org/attendance/Recognition1";

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.attendance.Recognition1
/// Object path: /org/attendance/Recognition1
pub struct AttendanceService {
    state: Arc<PipelineState>,
    store: Arc<SqliteStore>,
    engine: EngineHandle,
    encoding_dim: usize,
}

impl AttendanceService {
    pub fn new(
        state: Arc<PipelineState>,
        store: Arc<SqliteStore>,
        engine: EngineHandle,
        encoding_dim: usize,
    ) -> Self {
        Self {
            state,
            store,
            engine,
            encoding_dim,
        }
    }
}

fn failed(err: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(err.to_string())
}

fn invalid_args(err: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::InvalidArgs(err.to_string())
}

/// Accept either a bare encoding array or an encoded frame holding exactly one face.
fn enrollment_encoding(json: &str) -> zbus::fdo::Result<Vec<f32>> {
    if let Ok(values) = serde_json::from_str::<Vec<f32>>(json) {
        return Ok(values);
    }
    let faces = EncodedFrameDecoder
        .detect_and_encode(&json.to_string())
        .map_err(|e| invalid_args(format!("expected an encoding array or an encoded frame: {e}")))?;
    let face = select_enrollment_face(faces).map_err(invalid_args)?;
    Ok(face.encoding.values)
}

/// Run lock-taking or database work off the async executor.
async fn blocking<T, F>(work: F) -> zbus::fdo::Result<T>
where
    F: FnOnce() -> zbus::fdo::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| failed(format!("worker task failed: {e}")))?
}

#[interface(name = "org.attendance.Recognition1")]
impl AttendanceService {
    /// Begin an attendance session. Returns false if one was already running.
    async fn start_session(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("start_session requested");
        let state = Arc::clone(&self.state);
        blocking(move || Ok(state.start_session())).await
    }

    /// End the running session. Returns false if none was running.
    async fn stop_session(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("stop_session requested");
        let state = Arc::clone(&self.state);
        blocking(move || Ok(state.stop_session())).await
    }

    /// Force the next frame to reload identities from the database.
    async fn invalidate_identity_cache(&self) -> zbus::fdo::Result<()> {
        tracing::info!("identity cache invalidation requested");
        self.state.invalidate_identity_cache();
        Ok(())
    }

    /// Queue one encoded frame. Never waits for the engine; returns the frame's sequence number.
    async fn submit_frame(&self, payload: String) -> zbus::fdo::Result<u64> {
        self.engine.submit(payload).map_err(failed)
    }

    /// Validate and store a new identity, then invalidate the cache.
    async fn enroll(
        &self,
        name: String,
        roll_number: String,
        department: String,
        role: String,
        encoding_json: String,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(name = %name, roll_number = %roll_number, "enroll requested");
        let encoding = enrollment_encoding(&encoding_json)?;
        let identity = EnrollmentRequest {
            display_name: name,
            roll_number,
            department,
            role,
            encoding,
        }
        .validate(Some(self.encoding_dim))
        .map_err(invalid_args)?;

        let store = Arc::clone(&self.store);
        let id = blocking(move || store.insert_identity(&identity).map_err(failed)).await?;
        self.state.invalidate_identity_cache();
        Ok(id.to_string())
    }

    /// Delete an identity and its attendance rows. Returns false if it did not exist.
    async fn remove_identity(&self, id: String) -> zbus::fdo::Result<bool> {
        tracing::info!(id = %id, "remove_identity requested");
        let store = Arc::clone(&self.store);
        let removed =
            blocking(move || store.remove_identity(&IdentityId(id)).map_err(failed)).await?;
        if removed {
            self.state.invalidate_identity_cache();
        }
        Ok(removed)
    }

    /// Enrolled identities as a JSON array, in enrollment order.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let store = Arc::clone(&self.store);
        let summaries = blocking(move || store.list_summaries().map_err(failed)).await?;
        serde_json::to_string(&summaries).map_err(failed)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let snapshot = self.state.cache.current_snapshot();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "session_running": self.state.session.is_running(),
            "identities": snapshot.len(),
            "encoding_dim": snapshot.dimension().unwrap_or(self.encoding_dim),
            "cache_loaded_at": snapshot.loaded_at().map(|t| t.to_rfc3339()),
            "cache_invalidated": self.state.cache.is_invalidated(),
            "present": self.state.presence.present(),
            "frames_submitted": self.engine.latest_seq(),
            "frames_dropped": self.engine.dropped(),
        })
        .to_string())
    }

    #[zbus(signal)]
    async fn attendance_recorded(emitter: &SignalEmitter<'_>, payload: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn user_recognized(emitter: &SignalEmitter<'_>, payload: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn recognition_status(emitter: &SignalEmitter<'_>, payload: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn user_departed(emitter: &SignalEmitter<'_>, payload: &str) -> zbus::Result<()>;
}

async fn emit_signal(emitter: &SignalEmitter<'_>, event: &Event) -> zbus::Result<()> {
    let payload = event.to_json();
    match event {
        Event::AttendanceRecorded { .. } => {
            AttendanceService::attendance_recorded(emitter, &payload).await
        }
        Event::UserRecognized { .. } => {
            AttendanceService::user_recognized(emitter, &payload).await
        }
        Event::RecognitionStatus { .. } => {
            AttendanceService::recognition_status(emitter, &payload).await
        }
        Event::UserDeparted { .. } => AttendanceService::user_departed(emitter, &payload).await,
    }
}

/// Relay pipeline events to D-Bus signals until the sender side is gone.
pub async fn forward_events(conn: Connection, mut rx: broadcast::Receiver<Event>) {
    let emitter = match SignalEmitter::new(&conn, OBJECT_PATH) {
        Ok(emitter) => emitter,
        Err(err) => {
            tracing::error!(
                error = %err,
                "cannot create signal emitter; events will not be signalled"
            );
            return;
        }
    };
    loop {
        match rx.recv().await {
            Ok(event) => {
                if let Err(err) = emit_signal(&emitter, &event).await {
                    tracing::warn!(kind = event.kind(), error = %err, "signal emission failed");
                }
            }
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "signal forwarder lagged; events skipped");
            }
            Err(RecvError::Closed) => break,
        }
    }
    tracing::debug!("signal forwarder exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use crate::sink::DaemonSink;
    use attendance_core::{Clock, CooldownPolicy, IdentityCache, PipelineSettings, SystemClock};
    use chrono::TimeDelta;

    fn service() -> (AttendanceService, crate::engine::Engine) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let staleness = TimeDelta::seconds(300);
        let cache = Arc::new(IdentityCache::new(store.clone(), clock.clone(), staleness));
        let state = Arc::new(PipelineState::new(cache, CooldownPolicy::default()));
        let (tx, _rx) = broadcast::channel(16);
        let sink = Arc::new(DaemonSink::new(store.clone(), tx));
        let engine = spawn_engine(state.clone(), sink, clock, PipelineSettings::default()).unwrap();
        let service = AttendanceService::new(state, store, engine.handle(), 3);
        (service, engine)
    }

    #[tokio::test]
    async fn test_enroll_list_remove() {
        let (service, engine) = service();
        let id = service
            .enroll(
                "Ada".into(),
                "CS-1".into(),
                "Computing".into(),
                "Teacher".into(),
                "[0.1, 0.2, 0.3]".into(),
            )
            .await
            .unwrap();
        assert!(service.state.cache.is_invalidated());

        let listed = service.list_identities().await.unwrap();
        let listed: serde_json::Value = serde_json::from_str(&listed).unwrap();
        assert_eq!(listed[0]["id"], id.as_str());
        assert_eq!(listed[0]["role"], "Teacher");
        assert!(listed[0].get("face_encoding").is_none());

        assert!(service.remove_identity(id.clone()).await.unwrap());
        assert!(!service.remove_identity(id).await.unwrap());
        engine.shutdown().unwrap();
    }

    async fn enroll_ada(
        service: &AttendanceService,
        role: &str,
        encoding: &str,
    ) -> zbus::fdo::Result<String> {
        service
            .enroll(
                "Ada".into(),
                "CS-1".into(),
                "Computing".into(),
                role.into(),
                encoding.into(),
            )
            .await
    }

    #[tokio::test]
    async fn test_enroll_rejects_bad_input() {
        let (service, engine) = service();
        let bad_role = enroll_ada(&service, "Admin", "[0,0,0]").await;
        assert!(matches!(bad_role, Err(zbus::fdo::Error::InvalidArgs(_))));

        let wrong_dim = enroll_ada(&service, "Student", "[0,0]").await;
        assert!(matches!(wrong_dim, Err(zbus::fdo::Error::InvalidArgs(_))));

        let not_json = enroll_ada(&service, "Student", "zeros").await;
        assert!(matches!(not_json, Err(zbus::fdo::Error::InvalidArgs(_))));
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_enrollment_encoding_from_frame() {
        assert_eq!(enrollment_encoding("[1, 2, 3]").unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(
            enrollment_encoding(r#"{"faces":[{"encoding":[0.5,0.5,0.5]}]}"#).unwrap(),
            vec![0.5, 0.5, 0.5]
        );
        assert!(matches!(
            enrollment_encoding(r#"{"faces":[]}"#),
            Err(zbus::fdo::Error::InvalidArgs(msg)) if msg.contains("no face")
        ));
        assert!(matches!(
            enrollment_encoding(r#"{"faces":[{"encoding":[0.0]},{"encoding":[1.0]}]}"#),
            Err(zbus::fdo::Error::InvalidArgs(msg)) if msg.contains("multiple faces")
        ));
    }

    #[tokio::test]
    async fn test_session_control_and_status() {
        let (service, engine) = service();
        assert!(service.start_session().await.unwrap());
        assert!(!service.start_session().await.unwrap());

        let seq = service.submit_frame(r#"{"faces":[]}"#.into()).await.unwrap();
        assert_eq!(seq, 1);

        let status = service.status().await.unwrap();
        let status: serde_json::Value = serde_json::from_str(&status).unwrap();
        assert_eq!(status["session_running"], true);
        assert_eq!(status["frames_submitted"], 1);

        assert!(service.stop_session().await.unwrap());
        engine.shutdown().unwrap();
    }
}
