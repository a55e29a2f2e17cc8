//! Entity matching: name normalization, similarity scoring and the batch
//! matcher that proposes or auto-applies canonical links.

mod matcher;
pub mod normalize;
mod similarity;

pub use matcher::{EntityMatcher, MatchingSummary, DEFAULT_AUTO_LINK_THRESHOLD};
pub use normalize::NameNormalizer;
pub use similarity::{levenshtein_distance, similarity};
