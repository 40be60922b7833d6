//! Collaborator traits for face detection/embedding and per-face attribute
//! analysis. Implementations live outside this crate; frames are passed as
//! 8-bit grayscale `width * height` slices.

use crate::types::{BoundingBox, Embedding};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("embedder unavailable: {0}")]
    Unavailable(String),
    #[error("embedder call timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid frame: expected {expected} bytes, got {actual}")]
    InvalidFrame { expected: usize, actual: usize },
    #[error("malformed embedder response: {0}")]
    Malformed(String),
    #[error("embedder failed: {0}")]
    Failed(String),
}

/// One face found by the external detector, with its embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// Detects faces in a frame and embeds each of them.
pub trait FaceEmbedder: Send + Sync {
    fn detect_and_embed(
        &self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<Detection>, EmbedderError>;
}

/// Optional per-face attributes estimated by an external model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceAttributes {
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub emotion: Option<String>,
}

impl FaceAttributes {
    pub fn is_empty(&self) -> bool {
        self.age.is_none() && self.emotion.is_none()
    }
}

/// Age / emotion estimation for one face.
pub trait AttributeAnalyzer: Send + Sync {
    fn analyze(
        &self,
        frame: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Result<FaceAttributes, EmbedderError>;
}

/// Outcome of a presentation-attack check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpoofVerdict {
    pub is_spoof: bool,
    pub score: f32,
}

/// Presentation-attack check for one face. `None` means "no opinion"
/// (face box unusable, check disabled, ...).
pub trait SpoofCheck: Send + Sync {
    fn check(&self, frame: &[u8], width: u32, height: u32, face: &BoundingBox)
        -> Option<SpoofVerdict>;
}

/// Copy the face region out of a grayscale frame.
///
/// Returns `(pixels, crop_width, crop_height)`, or `None` if the box does not
/// overlap the frame or the frame is shorter than `width * height`.
pub fn crop_gray(
    frame: &[u8],
    width: u32,
    height: u32,
    face: &BoundingBox,
) -> Option<(Vec<u8>, u32, u32)> {
    if frame.len() < (width as usize) * (height as usize) {
        return None;
    }
    let (left, top, right, bottom) = face.clip(width, height)?;
    let cw = (right - left) as usize;
    let ch = (bottom - top) as usize;
    let w = width as usize;

    let mut out = Vec::with_capacity(cw * ch);
    for y in top as usize..bottom as usize {
        let row = y * w;
        out.extend_from_slice(&frame[row + left as usize..row + right as usize]);
    }
    Some((out, cw as u32, ch as u32))
}
