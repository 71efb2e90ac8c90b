//! attendance-core: recognition-event pipeline for live attendance.
//!
//! Matches detected face encodings against a snapshot of enrolled identities,
//! tracks who is currently in frame, and gates attendance writes and
//! notifications behind independent per-identity cooldowns.

pub mod cache;
pub mod clock;
pub mod cooldown;
pub mod detector;
pub mod enrollment;
pub mod events;
pub mod matcher;
pub mod pipeline;
pub mod presence;
pub mod retry;
pub mod session;
pub mod slot;
pub mod store;
mod sync;
pub mod types;

pub use cache::{CacheError, IdentityCache, IdentityCacheSnapshot};
pub use clock::{Clock, SystemClock};
pub use cooldown::{CooldownController, CooldownPolicy};
pub use detector::{DetectionError, FaceEncoder};
pub use enrollment::{select_enrollment_face, EnrollmentError, EnrollmentRequest, Role};
pub use events::{EmitError, Event, EventSink, RecognitionStatus};
pub use matcher::{EuclideanMatcher, Matcher, DEFAULT_MATCH_THRESHOLD};
pub use pipeline::{
    FrameOutcome, FramePipeline, FrameReport, PipelineError, PipelineSettings, PipelineState,
};
pub use presence::PresenceTracker;
pub use session::SessionControl;
pub use slot::{FrameSlot, FrameTicket};
pub use store::{IdentityStore, NewIdentity, StoreError};
pub use types::{BoundingBox, DetectedFace, Embedding, IdentityId, IdentityRecord, MatchResult};
