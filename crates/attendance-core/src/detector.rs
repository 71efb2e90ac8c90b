//! Detection/encoding collaborator contract.
//!
//! The face detector and encoder run outside this crate. The pipeline only
//! sees their output: zero or more faces, each with a fixed-length encoding.

use crate::types::DetectedFace;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("face {index} has a {found}-dim encoding, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },
    #[error("detector failed: {0}")]
    Failed(String),
}

/// Turns one frame into the faces it contains.
///
/// An empty list means "no faces"; an `Err` means the frame could not be
/// processed at all.
pub trait FaceEncoder<F>: Send {
    fn detect_and_encode(&mut self, frame: &F) -> Result<Vec<DetectedFace>, DetectionError>;
}
