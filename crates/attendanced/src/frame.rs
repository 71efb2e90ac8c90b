use attendance_core::{DetectedFace, DetectionError, FaceEncoder};
use serde::Deserialize;

/// Wire form of one submitted frame: faces already detected and encoded upstream.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EncodedFrame {
    faces: Vec<DetectedFace>,
}

/// Decodes JSON frames of the form `{"faces":[{"region":{..},"encoding":[..]}]}`.
#[derive(Debug, Default)]
pub struct EncodedFrameDecoder;

impl FaceEncoder<String> for EncodedFrameDecoder {
    fn detect_and_encode(&mut self, frame: &String) -> Result<Vec<DetectedFace>, DetectionError> {
        let parsed: EncodedFrame =
            serde_json::from_str(frame).map_err(|e| DetectionError::MalformedFrame(e.to_string()))?;
        for (i, face) in parsed.faces.iter().enumerate() {
            if face.encoding.dim() == 0 {
                return Err(DetectionError::MalformedFrame(format!(
                    "face {i} has an empty encoding"
                )));
            }
            if !face.encoding.is_finite() {
                return Err(DetectionError::MalformedFrame(format!(
                    "face {i} has non-finite encoding values"
                )));
            }
        }
        Ok(parsed.faces)
    }
}
