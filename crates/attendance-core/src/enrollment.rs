//! Enrollment validation. Bad requests are rejected here, before anything
//! reaches the store or the recognition pipeline.

use crate::store::NewIdentity;
use crate::types::{DetectedFace, Embedding};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum EnrollmentError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid role: {0:?} (expected Teacher or Student)")]
    InvalidRole(String),
    #[error("encoding is empty")]
    EmptyEncoding,
    #[error("encoding contains non-finite values")]
    NonFiniteEncoding,
    #[error("encoding has {found} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("no face detected in enrollment image")]
    NoFaceDetected,
    #[error("multiple faces detected ({0}); exactly one is required")]
    MultipleFaces(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Teacher,
    Student,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Teacher => "Teacher",
            Role::Student => "Student",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = EnrollmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Teacher" => Ok(Role::Teacher),
            "Student" => Ok(Role::Student),
            other => Err(EnrollmentError::InvalidRole(other.to_string())),
        }
    }
}

/// Raw enrollment input as received from an operator-facing surface.
#[derive(Debug, Clone, Default)]
pub struct EnrollmentRequest {
    pub display_name: String,
    pub roll_number: String,
    pub department: String,
    pub role: String,
    pub encoding: Vec<f32>,
}

fn required(value: &str, field: &'static str) -> Result<String, EnrollmentError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EnrollmentError::MissingField(field));
    }
    Ok(trimmed.to_string())
}

impl EnrollmentRequest {
    /// Validate every field and produce an identity ready for insertion.
    ///
    /// With `expected_dim` set, the encoding must have exactly that many components.
    pub fn validate(self, expected_dim: Option<usize>) -> Result<NewIdentity, EnrollmentError> {
        let display_name = required(&self.display_name, "name")?;
        let roll_number = required(&self.roll_number, "roll_number")?;
        let department = required(&self.department, "department")?;
        let role: Role = required(&self.role, "role")?.parse()?;

        if self.encoding.is_empty() {
            return Err(EnrollmentError::EmptyEncoding);
        }
        let encoding = Embedding::new(self.encoding);
        if !encoding.is_finite() {
            return Err(EnrollmentError::NonFiniteEncoding);
        }
        if let Some(expected) = expected_dim {
            if encoding.dim() != expected {
                return Err(EnrollmentError::DimensionMismatch {
                    expected,
                    found: encoding.dim(),
                });
            }
        }

        Ok(NewIdentity {
            display_name,
            roll_number,
            department,
            role,
            encoding,
        })
    }
}

/// Pick the single face an enrollment image must contain.
pub fn select_enrollment_face(faces: Vec<DetectedFace>) -> Result<DetectedFace, EnrollmentError> {
    let count = faces.len();
    match (faces.into_iter().next(), count) {
        (None, _) => Err(EnrollmentError::NoFaceDetected),
        (Some(face), 1) => Ok(face),
        (Some(_), n) => Err(EnrollmentError::MultipleFaces(n)),
    }
}
