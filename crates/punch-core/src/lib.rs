//! punch-core: Roster matching and face collaborator contracts.
//!
//! Decides which enrolled identity a face embedding belongs to (nearest
//! neighbour within tolerance, with a runner-up margin), normalizes match
//! confidence for display, and defines the traits the recognition daemon
//! uses to reach the external detector and attribute analyzers.

pub mod analysis;
pub mod matcher;
pub mod spoof;
pub mod throttle;
pub mod types;

pub use analysis::{
    AttributeAnalyzer, Detection, EmbedderError, FaceAttributes, FaceEmbedder, SpoofCheck,
    SpoofVerdict,
};
pub use matcher::{
    normalize_confidence, MarginMatcher, MatchPolicy, Matcher, Roster, RosterError, RosterHandle,
};
pub use spoof::SharpnessSpoofCheck;
pub use throttle::{KeyedThrottle, Throttle};
pub use types::{BoundingBox, Embedding, Identity, MatchResult, Rejection, RosterEntry};
