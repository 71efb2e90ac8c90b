//! Per-frame orchestration: detect, match, track presence, gate and emit.

use crate::cache::{CacheError, IdentityCache};
use crate::clock::Clock;
use crate::cooldown::{CooldownController, CooldownPolicy};
use crate::detector::{DetectionError, FaceEncoder};
use crate::events::{EmitError, Event, EventSink, RecognitionStatus};
use crate::matcher::{EuclideanMatcher, Matcher, DEFAULT_MATCH_THRESHOLD};
use crate::presence::{PresenceTracker, DEFAULT_PRESENCE_EXPIRY_SECS};
use crate::retry;
use crate::session::SessionControl;
use crate::slot::FrameTicket;
use crate::types::{DetectedFace, IdentityId};
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("detection: {0}")]
    Detection(#[from] DetectionError),
    #[error("identity cache: {0}")]
    Cache(#[from] CacheError),
    #[error("emitter: {0}")]
    Emit(#[from] EmitError),
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    /// Maximum (exclusive) Euclidean distance accepted as a match.
    pub match_threshold: f32,
    pub presence_expiry: TimeDelta,
    /// Attempts per sink publish before the side effect is given up for this frame.
    pub emit_attempts: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            presence_expiry: TimeDelta::seconds(DEFAULT_PRESENCE_EXPIRY_SECS),
            emit_attempts: 1,
        }
    }
}

/// State shared between the frame path and the control surface.
pub struct PipelineState {
    pub cache: Arc<IdentityCache>,
    pub presence: Arc<PresenceTracker>,
    pub cooldowns: Arc<CooldownController>,
    pub session: Arc<SessionControl>,
}

impl PipelineState {
    pub fn new(cache: Arc<IdentityCache>, policy: CooldownPolicy) -> Self {
        let presence = Arc::new(PresenceTracker::new());
        let cooldowns = Arc::new(CooldownController::new(policy));
        let session = Arc::new(SessionControl::new(presence.clone(), cooldowns.clone()));
        Self {
            cache,
            presence,
            cooldowns,
            session,
        }
    }

    pub fn start_session(&self) -> bool {
        self.session.start_session()
    }

    pub fn stop_session(&self) -> bool {
        self.session.stop_session()
    }

    pub fn invalidate_identity_cache(&self) {
        self.cache.invalidate();
    }
}

/// What one frame cycle did.
#[derive(Debug, Default)]
pub struct FrameReport {
    pub faces: usize,
    pub status: Option<RecognitionStatus>,
    pub recognized: Vec<IdentityId>,
    pub attendance_written: Vec<IdentityId>,
    pub notified: Vec<IdentityId>,
    pub departed: Vec<IdentityId>,
    /// Recovered failures: reload errors and emitter errors.
    pub warnings: Vec<PipelineError>,
}

#[derive(Debug)]
pub enum FrameOutcome {
    /// No session is running; the frame was ignored.
    Idle,
    /// A newer frame was accepted mid-cycle; the rest of this frame was abandoned.
    Superseded,
    Processed(FrameReport),
}

enum Delivery {
    Delivered,
    Failed(EmitError),
    Superseded,
}

/// Bail out of the frame as soon as a newer frame has been accepted.
macro_rules! deliver {
    ($self:ident, $event:expr, $ticket:expr, $report:expr) => {
        match $self.emit(&$event, $ticket) {
            Delivery::Delivered => true,
            Delivery::Failed(err) => {
                $report.warnings.push(err.into());
                false
            }
            Delivery::Superseded => return Ok(FrameOutcome::Superseded),
        }
    };
}

pub struct FramePipeline<E, M = EuclideanMatcher> {
    encoder: E,
    matcher: M,
    state: Arc<PipelineState>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    settings: PipelineSettings,
}

impl<E> FramePipeline<E, EuclideanMatcher> {
    pub fn new(
        encoder: E,
        state: Arc<PipelineState>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            encoder,
            matcher: EuclideanMatcher,
            state,
            sink,
            clock,
            settings,
        }
    }
}

impl<E, M: Matcher> FramePipeline<E, M> {
    pub fn with_matcher<M2: Matcher>(self, matcher: M2) -> FramePipeline<E, M2> {
        FramePipeline {
            encoder: self.encoder,
            matcher,
            state: self.state,
            sink: self.sink,
            clock: self.clock,
            settings: self.settings,
        }
    }

    pub fn state(&self) -> &Arc<PipelineState> {
        &self.state
    }

    /// Run one full frame cycle.
    ///
    /// `Err` means the frame was skipped because detection failed. Reload and
    /// emitter failures are recovered and listed in the report.
    pub fn process_frame<F>(
        &mut self,
        frame: &F,
        ticket: &FrameTicket,
    ) -> Result<FrameOutcome, PipelineError>
    where
        E: FaceEncoder<F>,
    {
        let state = Arc::clone(&self.state);
        let Some(_cycle) = state.session.begin_cycle() else {
            return Ok(FrameOutcome::Idle);
        };
        if ticket.is_superseded() {
            return Ok(FrameOutcome::Superseded);
        }

        // One timestamp per cycle: sightings and the departure sweep must agree.
        let now = self.clock.now();
        let mut report = FrameReport::default();

        if let Some(Err(err)) = state.cache.refresh_if_needed() {
            report.warnings.push(err.into());
        }
        let snapshot = state.cache.current_snapshot();

        if snapshot.is_empty() {
            let message = if snapshot.loaded_at().is_none() {
                tracing::debug!(seq = ticket.seq(), "identities not loaded; skipping recognition");
                "Identity database unavailable - retrying"
            } else {
                tracing::debug!(seq = ticket.seq(), "no known identities; skipping recognition");
                "No known identities - register users first"
            };
            deliver!(self, Event::status(RecognitionStatus::Error, message), ticket, report);
            report.status = Some(RecognitionStatus::Error);
            return self.finish(report, ticket, now);
        }

        let faces = match self.detect(frame, snapshot.dimension()) {
            Ok(faces) => faces,
            Err(err) => {
                tracing::warn!(seq = ticket.seq(), error = %err, "frame skipped");
                let event = Event::status(RecognitionStatus::Error, "Frame could not be processed");
                // The frame is already lost; a failed status publish is only logged.
                if let Delivery::Superseded = self.emit(&event, ticket) {
                    return Ok(FrameOutcome::Superseded);
                }
                return Err(err.into());
            }
        };
        report.faces = faces.len();

        if faces.is_empty() {
            let event = Event::status(
                RecognitionStatus::NoFace,
                "No face detected - Please position your face in the frame",
            );
            deliver!(self, event, ticket, report);
            report.status = Some(RecognitionStatus::NoFace);
            return self.finish(report, ticket, now);
        }

        let mut last_name: Option<String> = None;

        for face in &faces {
            let result = self.matcher.compare(
                &face.encoding,
                snapshot.identities(),
                self.settings.match_threshold,
            );
            let Some(identity) = result.index.and_then(|i| snapshot.identities().get(i)) else {
                tracing::debug!(distance = result.distance, "face not recognized");
                continue;
            };
            let id = &identity.id;
            tracing::debug!(identity = %id, distance = result.distance, "face matched");

            if state.presence.mark_seen(id, now) {
                tracing::info!(identity = %id, name = %identity.display_name, "identity arrived");
            }
            if !report.recognized.contains(id) {
                report.recognized.push(id.clone());
            }
            last_name = Some(identity.display_name.clone());

            if state.cooldowns.should_record_attendance(id, now) {
                let event = Event::AttendanceRecorded {
                    identity_id: id.clone(),
                    display_name: identity.display_name.clone(),
                    roll_number: identity.roll_number.clone(),
                    at: now,
                };
                if deliver!(self, event, ticket, report) {
                    state.cooldowns.record_written(id, now);
                    report.attendance_written.push(id.clone());
                    tracing::info!(
                        identity = %id,
                        name = %identity.display_name,
                        "attendance recorded"
                    );
                }
            }

            if state.cooldowns.should_emit_notification(id, now) {
                let event = Event::UserRecognized {
                    identity_id: id.clone(),
                    display_name: identity.display_name.clone(),
                    roll_number: identity.roll_number.clone(),
                    department: identity.department.clone(),
                    role: identity.role,
                    distance: result.distance,
                    at: now,
                };
                if deliver!(self, event, ticket, report) {
                    state.cooldowns.record_notified(id, now);
                    report.notified.push(id.clone());
                }
            }
        }

        let (status, message) = match last_name {
            Some(name) => (
                RecognitionStatus::FaceRecognized,
                format!("Face recognized - Welcome {name}"),
            ),
            None => (
                RecognitionStatus::FaceDetected,
                "Face detected but not recognized - Please register first".to_string(),
            ),
        };
        deliver!(self, Event::status(status, message), ticket, report);
        report.status = Some(status);

        self.finish(report, ticket, now)
    }

    /// Run the encoder and reject faces the current snapshot cannot be compared against.
    fn detect<F>(
        &mut self,
        frame: &F,
        dim: Option<usize>,
    ) -> Result<Vec<DetectedFace>, DetectionError>
    where
        E: FaceEncoder<F>,
    {
        let faces = self.encoder.detect_and_encode(frame)?;
        if let Some(expected) = dim {
            if let Some((index, face)) = faces
                .iter()
                .enumerate()
                .find(|(_, f)| f.encoding.dim() != expected)
            {
                return Err(DetectionError::DimensionMismatch {
                    index,
                    expected,
                    found: face.encoding.dim(),
                });
            }
        }
        Ok(faces)
    }

    /// Sweep presence and announce departures. Runs on every processed frame,
    /// including frames with no faces.
    ///
    /// If a newer frame arrives mid-sweep, the departures not yet announced are
    /// restored to the tracker so the next frame's sweep reports them.
    fn finish(
        &self,
        mut report: FrameReport,
        ticket: &FrameTicket,
        now: DateTime<Utc>,
    ) -> Result<FrameOutcome, PipelineError> {
        if ticket.is_superseded() {
            return Ok(FrameOutcome::Superseded);
        }
        let presence = &self.state.presence;
        let mut expired = presence
            .take_expired(now, self.settings.presence_expiry)
            .into_iter();
        while let Some((id, last_seen)) = expired.next() {
            let event = Event::UserDeparted {
                identity_id: id.clone(),
                at: now,
            };
            match self.emit(&event, ticket) {
                Delivery::Delivered => {}
                Delivery::Failed(err) => report.warnings.push(err.into()),
                Delivery::Superseded => {
                    presence.restore(std::iter::once((id, last_seen)).chain(expired));
                    return Ok(FrameOutcome::Superseded);
                }
            }
            tracing::info!(identity = %id, "identity departed");
            report.departed.push(id);
        }
        Ok(FrameOutcome::Processed(report))
    }

    fn emit(&self, event: &Event, ticket: &FrameTicket) -> Delivery {
        if ticket.is_superseded() {
            tracing::debug!(
                seq = ticket.seq(),
                kind = event.kind(),
                "frame superseded; dropping event"
            );
            return Delivery::Superseded;
        }
        let attempts = self.settings.emit_attempts;
        match retry::with_attempts(attempts, event.kind(), || self.sink.publish(event)) {
            Ok(()) => Delivery::Delivered,
            Err(err) => {
                tracing::warn!(kind = event.kind(), error = %err, "event not delivered");
                Delivery::Failed(err)
            }
        }
    }
}
