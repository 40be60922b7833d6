use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector confidence, not the match confidence.
    #[serde(default)]
    pub confidence: f32,
}

impl BoundingBox {
    /// Linearly rescale into another coordinate space.
    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self {
            x: self.x * sx,
            y: self.y * sy,
            width: self.width * sx,
            height: self.height * sy,
            confidence: self.confidence,
        }
    }

    /// Clip to a `width` x `height` frame, returning integer pixel bounds
    /// `(left, top, right, bottom)`, or `None` if nothing is left.
    pub fn clip(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let left = self.x.max(0.0).floor() as u32;
        let top = self.y.max(0.0).floor() as u32;
        let right = ((self.x + self.width).max(0.0).ceil() as u32).min(width);
        let bottom = ((self.y + self.height).max(0.0).ceil() as u32).min(height);
        if right <= left || bottom <= top {
            return None;
        }
        Some((left, top, right, bottom))
    }
}

/// Face embedding vector produced by an external model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Euclidean distance between two embeddings. Smaller = more similar.
    ///
    /// Embeddings of different dimension, or with non-finite components,
    /// are infinitely far apart.
    pub fn distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        let d = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt();
        if d.is_finite() {
            d
        } else {
            f32::INFINITY
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }
}

/// One enrolled reference embedding. An identity with several reference
/// embeddings has several entries sharing the same `identity`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterEntry {
    pub identity: String,
    pub embedding: Embedding,
}

impl RosterEntry {
    pub fn new(identity: impl Into<String>, values: Vec<f32>) -> Self {
        Self {
            identity: identity.into(),
            embedding: Embedding::new(values),
        }
    }
}

/// Who a face was matched to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Identity {
    Known(String),
    Unknown,
}

impl Identity {
    pub fn name(&self) -> Option<&str> {
        match self {
            Identity::Known(name) => Some(name),
            Identity::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Identity::Known(_))
    }

    /// Display label, `"Unknown"` for unmatched faces.
    pub fn label(&self) -> &str {
        self.name().unwrap_or("Unknown")
    }
}

/// Why a probe was not accepted as a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    EmptyRoster,
    Tolerance,
    Margin,
}

/// Result of matching one probe embedding against the roster.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub identity: Identity,
    /// Distance to the nearest roster entry; `None` with an empty roster.
    pub distance: Option<f32>,
    /// `1 - distance`, reported even when the match is rejected.
    pub confidence_raw: Option<f32>,
    /// Gap to the nearest entry of a different identity, if there is one.
    pub margin: Option<f32>,
    pub rejection: Option<Rejection>,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        self.identity.is_known()
    }
}
