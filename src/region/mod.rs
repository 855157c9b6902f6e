//! Trust region around the anchor: per-parameter radii, projection, and the
//! nested loop that learns the radii.

pub mod adaptation;
pub mod constraint;

pub use adaptation::{AdaptStrategy, CyclicLoader, RegionConfig, TrustRegionTrainer};
pub use constraint::{ConstraintSet, NormMode, ProjectionScope};
