//! Runtime module: the outer training loop and its bookkeeping.
//!
//! - Orchestrator (zeroth-order steps, trust-region cadence, evaluation)
//! - Learning-rate schedules
//! - Loss health tracking

pub mod health;
pub mod orchestrator;
pub mod schedule;
