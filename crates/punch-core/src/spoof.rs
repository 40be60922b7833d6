//! Texture-based presentation-attack heuristic.
//!
//! Printed photos and screens held up to the camera tend to be blurrier than
//! a live face at the same distance. The variance of the Laplacian over the
//! face crop is used as a sharpness score; low variance flags a spoof.

use crate::analysis::{crop_gray, SpoofCheck, SpoofVerdict};
use crate::types::BoundingBox;

pub const DEFAULT_SHARPNESS_THRESHOLD: f32 = 18.0;

/// Flags faces whose Laplacian variance falls below `threshold`.
#[derive(Debug, Clone, Copy)]
pub struct SharpnessSpoofCheck {
    pub threshold: f32,
}

impl Default for SharpnessSpoofCheck {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SHARPNESS_THRESHOLD,
        }
    }
}

impl SpoofCheck for SharpnessSpoofCheck {
    fn check(
        &self,
        frame: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Option<SpoofVerdict> {
        let (crop, cw, ch) = crop_gray(frame, width, height, face)?;
        let score = laplacian_variance(&crop, cw, ch)?;
        Some(SpoofVerdict {
            is_spoof: score < self.threshold,
            score: (score * 100.0).round() / 100.0,
        })
    }
}

/// Variance of the 4-neighbour Laplacian over the interior pixels.
///
/// Returns `None` for images smaller than 3x3.
pub fn laplacian_variance(gray: &[u8], width: u32, height: u32) -> Option<f32> {
    let w = width as usize;
    let h = height as usize;
    if w < 3 || h < 3 || gray.len() < w * h {
        return None;
    }

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut n = 0usize;

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let c = gray[y * w + x] as f64;
            let lap = gray[(y - 1) * w + x] as f64
                + gray[(y + 1) * w + x] as f64
                + gray[y * w + x - 1] as f64
                + gray[y * w + x + 1] as f64
                - 4.0 * c;
            sum += lap;
            sum_sq += lap * lap;
            n += 1;
        }
    }

    let mean = sum / n as f64;
    Some((sum_sq / n as f64 - mean * mean).max(0.0) as f32)
}
