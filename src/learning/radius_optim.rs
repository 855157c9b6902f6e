//! Adam over a flat vector of trust-region radii.
//!
//! State survives across adaptation cycles, so moment estimates carry over
//! from one invocation to the next.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdamConfig {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: crate::config::DEFAULT_FO_RADIUS_LR,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RadiusAdam {
    pub config: AdamConfig,
    m: Vec<f32>,
    v: Vec<f32>,
    t: u32,
}

impl RadiusAdam {
    pub fn new(config: AdamConfig) -> Self {
        Self {
            config,
            m: Vec::new(),
            v: Vec::new(),
            t: 0,
        }
    }

    /// Number of steps taken so far.
    pub fn steps(&self) -> u32 {
        self.t
    }

    /// One bias-corrected Adam step.  Moment buffers grow to fit on first use.
    pub fn step(&mut self, params: &mut [f32], grads: &[f32]) {
        debug_assert_eq!(params.len(), grads.len());
        if self.m.len() != params.len() {
            self.m.resize(params.len(), 0.0);
            self.v.resize(params.len(), 0.0);
        }
        self.t += 1;

        let AdamConfig {
            lr,
            beta1,
            beta2,
            epsilon,
        } = self.config;
        let bc1 = 1.0 - beta1.powi(self.t as i32);
        let bc2 = 1.0 - beta2.powi(self.t as i32);

        for (i, (p, &g)) in params.iter_mut().zip(grads.iter()).enumerate() {
            if !g.is_finite() {
                continue;
            }
            self.m[i] = beta1 * self.m[i] + (1.0 - beta1) * g;
            self.v[i] = beta2 * self.v[i] + (1.0 - beta2) * g * g;
            let m_hat = self.m[i] / bc1;
            let v_hat = self.v[i] / bc2;
            *p -= lr * m_hat / (v_hat.sqrt() + epsilon);
        }
    }

    pub fn reset(&mut self) {
        self.m.clear();
        self.v.clear();
        self.t = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_step_moves_by_lr() {
        let mut opt = RadiusAdam::new(AdamConfig {
            lr: 0.1,
            ..Default::default()
        });
        let mut r = vec![1.0f32, 1.0];
        opt.step(&mut r, &[0.5, -2.0]);

        // Bias-corrected first step is lr·sign(g).
        assert!((r[0] - 0.9).abs() < 1e-4);
        assert!((r[1] - 1.1).abs() < 1e-4);
        assert_eq!(opt.steps(), 1);
    }

    #[test]
    fn test_minimises_quadratic() {
        let mut opt = RadiusAdam::new(AdamConfig {
            lr: 0.05,
            ..Default::default()
        });
        let mut r = vec![3.0f32];
        for _ in 0..500 {
            let g = vec![2.0 * (r[0] - 1.0)];
            opt.step(&mut r, &g);
        }
        assert!((r[0] - 1.0).abs() < 0.05, "r = {}", r[0]);
    }

    #[test]
    fn test_non_finite_gradient_ignored() {
        let mut opt = RadiusAdam::new(AdamConfig::default());
        let mut r = vec![1.0f32, 1.0];
        opt.step(&mut r, &[f32::NAN, 1.0]);
        assert_eq!(r[0], 1.0);
        assert!(r[1] < 1.0);

        opt.reset();
        assert_eq!(opt.steps(), 0);
    }
}
