use crate::enrollment::Role;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Region of the frame a face was detected in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    #[serde(default)]
    pub confidence: f32,
}

/// Fixed-length face encoding produced by the external encoder (typically 128-dimensional).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// True when every component is a finite number.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Callers are expected to compare embeddings of equal dimension; extra
    /// trailing components of the longer vector are ignored.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Opaque identifier of an enrolled identity, as assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub String);

impl IdentityId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for IdentityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// An enrolled identity as loaded into the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: IdentityId,
    pub display_name: String,
    pub roll_number: String,
    pub department: String,
    pub role: Role,
    pub encoding: Embedding,
}

/// A face found in one frame. Never outlives the frame cycle that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedFace {
    #[serde(default)]
    pub region: BoundingBox,
    pub encoding: Embedding,
}

/// Result of matching one detected face against the identity snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Euclidean distance to the closest identity; infinite when there was nothing to compare.
    pub distance: f32,
    /// ID of the matched identity (if any).
    pub identity_id: Option<IdentityId>,
    /// Snapshot index of the matched identity (if any).
    pub index: Option<usize>,
}

impl MatchResult {
    pub fn unknown(distance: f32) -> Self {
        Self {
            matched: false,
            distance,
            identity_id: None,
            index: None,
        }
    }
}
