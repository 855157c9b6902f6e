//! Learning-rate schedules for the outer loop.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LrSchedule {
    #[default]
    Constant,
    /// `lr·(1 − step / (2·max_steps))`: decays linearly to half the base
    /// rate by the last step.
    LinearHalfDecay,
}

impl LrSchedule {
    pub fn lr_at(&self, base_lr: f32, step: u64, max_steps: u64) -> f32 {
        match self {
            LrSchedule::Constant => base_lr,
            LrSchedule::LinearHalfDecay => {
                if max_steps == 0 {
                    return base_lr;
                }
                let progress = step.min(max_steps) as f32 / (2.0 * max_steps as f32);
                base_lr * (1.0 - progress)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant() {
        assert_eq!(LrSchedule::Constant.lr_at(0.1, 500, 1000), 0.1);
    }

    #[test]
    fn test_linear_half_decay() {
        let s = LrSchedule::LinearHalfDecay;
        assert!((s.lr_at(1.0, 0, 100) - 1.0).abs() < 1e-6);
        assert!((s.lr_at(1.0, 50, 100) - 0.75).abs() < 1e-6);
        assert!((s.lr_at(1.0, 100, 100) - 0.5).abs() < 1e-6);
        assert!((s.lr_at(1.0, 400, 100) - 0.5).abs() < 1e-6);
    }
}
