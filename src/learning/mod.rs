//! Gradient-free optimisation.
//!
//! - **perturbation**: seeded Gaussian directions, regenerated instead of stored
//! - **zeroth_order**: two-point estimator and parameter update
//! - **radius_optim**: Adam over the trust-region radii

pub mod perturbation;
pub mod radius_optim;
pub mod zeroth_order;
