//! Decisions leaving the pipeline.

use crate::enrollment::Role;
use crate::store::StoreError;
use crate::types::IdentityId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmitError {
    #[error("attendance write failed: {0}")]
    Storage(#[from] StoreError),
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Coarse per-frame state shown to whoever is watching the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecognitionStatus {
    NoFace,
    FaceDetected,
    FaceRecognized,
    Error,
}

impl RecognitionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecognitionStatus::NoFace => "no-face",
            RecognitionStatus::FaceDetected => "face-detected",
            RecognitionStatus::FaceRecognized => "face-recognized",
            RecognitionStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    /// Request to persist one attendance row. Publishing succeeds only once the row is written.
    AttendanceRecorded {
        identity_id: IdentityId,
        display_name: String,
        roll_number: String,
        at: DateTime<Utc>,
    },
    UserRecognized {
        identity_id: IdentityId,
        display_name: String,
        roll_number: String,
        department: String,
        role: Role,
        distance: f32,
        at: DateTime<Utc>,
    },
    RecognitionStatus {
        status: RecognitionStatus,
        message: String,
    },
    /// Informational; no cooldown applies.
    UserDeparted {
        identity_id: IdentityId,
        at: DateTime<Utc>,
    },
}

impl Event {
    pub fn status(status: RecognitionStatus, message: impl Into<String>) -> Self {
        Event::RecognitionStatus {
            status,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::AttendanceRecorded { .. } => "attendance_recorded",
            Event::UserRecognized { .. } => "user_recognized",
            Event::RecognitionStatus { .. } => "recognition_status",
            Event::UserDeparted { .. } => "user_departed",
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!(r#"{{"kind":"{}"}}"#, self.kind()))
    }
}

/// Where pipeline decisions go.
///
/// Delivery is at-most-once from the pipeline's point of view: an `Err`
/// means the side effect did not happen and the matching cooldown is not
/// advanced.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &Event) -> Result<(), EmitError>;
}
