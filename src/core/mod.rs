//! Core module: parameter model, loss boundary, and checkpoints.

pub mod checkpoint;
pub mod objective;
pub mod params;
