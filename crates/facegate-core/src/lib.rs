//! facegate-core — Face gallery and identity matching.
//!
//! Holds the enrolled gallery of labeled embeddings, the majority-vote
//! matcher, and the interface to the external vision library that turns
//! images into face embeddings.

pub mod gallery;
pub mod matcher;
pub mod provider;
pub mod types;

pub use gallery::{Gallery, GalleryError};
pub use matcher::{identify, Matcher, VoteMatcher};
pub use provider::{CommandProvider, EmbeddingProvider, ProviderError};
pub use types::{BoundingBox, DetectedFace, Embedding, GalleryEntry, MatchResult};
