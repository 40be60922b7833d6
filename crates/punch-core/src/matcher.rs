//! Nearest-neighbour roster matching with a runner-up margin.
//!
//! A probe is accepted only when its nearest reference embedding is within
//! tolerance AND the nearest entry of any *other* identity is at least
//! `margin` further away. Ambiguous probes come back as `Unknown`.

use crate::types::{Embedding, Identity, MatchResult, Rejection, RosterEntry};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use thiserror::Error;

pub const DEFAULT_TOLERANCE: f32 = 0.6;
pub const DEFAULT_MARGIN: f32 = 0.06;
/// Empirical maximum raw confidence of the embedding model.
pub const DEFAULT_CONFIDENCE_SCALE: f32 = 0.6;

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("roster parse failed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("roster entry {index} for {identity:?} has an empty embedding")]
    EmptyEmbedding { index: usize, identity: String },
    #[error("roster entry {index} for {identity:?} has {actual} dimensions, expected {expected}")]
    DimensionMismatch {
        index: usize,
        identity: String,
        expected: usize,
        actual: usize,
    },
}

/// Thresholds for the match decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchPolicy {
    /// Maximum accepted distance to the best entry.
    pub tolerance: f32,
    /// Minimum gap between the best and the best different-identity distance.
    pub margin: f32,
    /// Raw confidence that maps to 100% on the display scale.
    pub confidence_scale: f32,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            margin: DEFAULT_MARGIN,
            confidence_scale: DEFAULT_CONFIDENCE_SCALE,
        }
    }
}

impl MatchPolicy {
    /// Rescale a raw confidence onto [0, 1] for display.
    pub fn display_confidence(&self, raw: Option<f32>) -> f32 {
        normalize_confidence(raw, self.confidence_scale)
    }
}

/// Map a raw model confidence (typically 0–0.6) onto a 0–1 display scale.
///
/// Undefined, non-finite or negative inputs map to 0; the result never exceeds 1.
pub fn normalize_confidence(raw: Option<f32>, scale: f32) -> f32 {
    match raw {
        Some(r) if r.is_finite() && scale > 0.0 => (r / scale).clamp(0.0, 1.0),
        _ => 0.0,
    }
}

/// An immutable set of enrolled reference embeddings.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    entries: Vec<RosterEntry>,
}

impl Roster {
    pub fn new(entries: Vec<RosterEntry>) -> Self {
        Self { entries }
    }

    /// Build a roster, rejecting empty embeddings and entries whose
    /// dimension differs from the first one.
    pub fn try_new(entries: Vec<RosterEntry>) -> Result<Self, RosterError> {
        let expected = entries.first().map_or(0, |e| e.embedding.dim());
        for (index, entry) in entries.iter().enumerate() {
            let actual = entry.embedding.dim();
            if actual == 0 {
                return Err(RosterError::EmptyEmbedding {
                    index,
                    identity: entry.identity.clone(),
                });
            }
            if actual != expected {
                return Err(RosterError::DimensionMismatch {
                    index,
                    identity: entry.identity.clone(),
                    expected,
                    actual,
                });
            }
        }
        Ok(Self::new(entries))
    }

    /// Parse and validate a JSON array of roster entries.
    pub fn from_json(json: &str) -> Result<Self, RosterError> {
        Self::try_new(serde_json::from_str(json)?)
    }

    /// Embedding dimension of the entries, `None` when empty.
    pub fn dim(&self) -> Option<usize> {
        self.entries.first().map(|e| e.embedding.dim())
    }

    pub fn entries(&self) -> &[RosterEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct identities.
    pub fn identity_count(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.identity.as_str())
            .collect::<HashSet<_>>()
            .len()
    }
}

/// Shared, atomically replaceable roster.
///
/// Readers take an `Arc` snapshot and keep it for the whole cycle, so a
/// concurrent reload is seen either entirely or not at all.
#[derive(Debug, Default)]
pub struct RosterHandle {
    current: RwLock<Arc<Roster>>,
}

impl RosterHandle {
    pub fn new(roster: Roster) -> Self {
        Self {
            current: RwLock::new(Arc::new(roster)),
        }
    }

    pub fn snapshot(&self) -> Arc<Roster> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Swap in a new roster, returning the previous one.
    pub fn replace(&self, roster: Roster) -> Arc<Roster> {
        let next = Arc::new(roster);
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, next)
    }
}

/// Strategy for deciding which roster identity (if any) a probe belongs to.
pub trait Matcher: Send + Sync {
    fn decide(&self, probe: &Embedding, roster: &Roster) -> MatchResult;
}

/// Margin-based nearest-neighbour matcher.
///
/// Visits every roster entry regardless of where the best match sits.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarginMatcher {
    pub policy: MatchPolicy,
}

impl MarginMatcher {
    pub fn new(policy: MatchPolicy) -> Self {
        Self { policy }
    }
}

impl Matcher for MarginMatcher {
    fn decide(&self, probe: &Embedding, roster: &Roster) -> MatchResult {
        let entries = roster.entries();

        let mut best: Option<(usize, f32)> = None;
        for (i, entry) in entries.iter().enumerate() {
            let d = probe.distance(&entry.embedding);
            if best.map_or(true, |(_, bd)| d < bd) {
                best = Some((i, d));
            }
        }

        let Some((best_idx, best_dist)) = best else {
            return MatchResult {
                identity: Identity::Unknown,
                distance: None,
                confidence_raw: None,
                margin: None,
                rejection: Some(Rejection::EmptyRoster),
            };
        };

        let owner = &entries[best_idx].identity;
        let runner_up = entries
            .iter()
            .filter(|e| &e.identity != owner)
            .map(|e| probe.distance(&e.embedding))
            .fold(None, |acc: Option<f32>, d| Some(acc.map_or(d, |a| a.min(d))));
        let margin = runner_up.map(|second| second - best_dist);

        // distance() maps dimension mismatches and NaN to infinity
        let rejection = if !best_dist.is_finite() || best_dist > self.policy.tolerance {
            Some(Rejection::Tolerance)
        } else if margin.is_some_and(|m| m < self.policy.margin) {
            Some(Rejection::Margin)
        } else {
            None
        };

        let identity = match rejection {
            None => Identity::Known(owner.clone()),
            Some(reason) => {
                tracing::trace!(
                    best = %owner,
                    distance = best_dist,
                    ?margin,
                    ?reason,
                    "probe rejected"
                );
                Identity::Unknown
            }
        };

        let distance = Some(best_dist).filter(|d| d.is_finite());
        MatchResult {
            identity,
            distance,
            confidence_raw: distance.map(|d| 1.0 - d),
            margin: margin.filter(|m| m.is_finite()),
            rejection,
        }
    }
}
