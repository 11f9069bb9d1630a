//! Closed-form geometry used to bootstrap bundle adjustment.

pub mod similarity;
pub mod triangulation;

pub use similarity::{fit_similarity, Similarity};
pub use triangulation::triangulate_rays;
