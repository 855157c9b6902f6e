//! # zotune
//!
//! **Zeroth-order fine-tuning with a learned trust region.**
//!
//! Models are tuned from forward passes alone: every step evaluates the loss
//! at `θ ± ε·z` for a seeded Gaussian direction `z` and moves along `z` by
//! the finite difference.  Only the seed and one scalar survive between the
//! estimate and the update, so no gradient-sized buffer is ever held.
//!
//! Optionally, fine-tuned weights are kept within a trust region around the
//! frozen starting point.  Each tracked parameter has a radius; every few
//! steps a nested loop learns the radii (zeroth- or first-order) and the
//! deviation from the anchor is rescaled onto them.
//!
//! ## Layout
//!
//! - `core`: parameter model, role tagging, anchor, objectives, checkpoints
//! - `learning`: perturbation stream, zeroth-order estimator, radius optimiser
//! - `region`: trust-region constraint and its adaptation strategies
//! - `runtime`: outer training loop, schedules, loss health

pub mod core;
pub mod learning;
pub mod region;
pub mod runtime;

/// Default hyperparameters.
pub mod config {
    /// Perturbation scale ε of the zeroth-order estimator.
    pub const DEFAULT_ZO_EPS: f32 = 1e-3;

    /// Base learning rate of the zeroth-order update.
    pub const DEFAULT_ZO_LR: f32 = 1e-6;

    /// Stabiliser added to every norm in a projection ratio.
    pub const RATIO_EPSILON: f32 = 1e-8;

    /// Global steps between trust-region adaptation cycles.
    pub const DEFAULT_ADAPT_INTERVAL: u64 = 50;

    /// Inner iterations per adaptation cycle.
    pub const DEFAULT_INNER_ITERS: usize = 10;

    /// Radii stay within `(1 ± τ)` of their base.
    pub const DEFAULT_TOLERANCE: f32 = 0.2;

    /// Probe scale of the zeroth-order radius update.
    pub const DEFAULT_PROBE_SCALE: f32 = 0.2;

    /// Step size of the zeroth-order radius update.
    pub const DEFAULT_ZO_RADIUS_LR: f32 = 10.0;

    /// Adam learning rate of the first-order radius update.
    pub const DEFAULT_FO_RADIUS_LR: f32 = 0.1;

    /// Weight of the `Σ|r|` penalty in the first-order radius loss.
    pub const DEFAULT_L1_PENALTY: f32 = 1e-3;

    pub const DEFAULT_LOG_EVERY: u64 = 50;

    pub const DEFAULT_EVAL_EVERY: u64 = 200;
}
