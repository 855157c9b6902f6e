//! Zeroth-order (two-point) gradient estimation and update.
//!
//! Each step perturbs every trainable tensor along a seeded Gaussian
//! direction `z`, evaluates the loss at `θ + εz` and `θ − εz`, and restores
//! `θ`.  The finite difference gives a single scalar
//!
//!   g = (L(θ + εz) − L(θ − εz)) / 2ε  ≈  z·∇L
//!
//! The update later regenerates `z` from the stored seed and applies
//! `θ ← θ − lr·(g·z + wd·θ)`.  Between the two phases only the seed and `g`
//! are kept; no gradient-shaped buffer ever exists.

use anyhow::bail;
use serde::{Deserialize, Serialize};

use super::perturbation::{perturb_parameters, PerturbationSeed, PerturbationStream, SeedSource};
use crate::core::objective::Objective;
use crate::core::params::{ParamRole, ParameterSet};

/// Estimator configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZoConfig {
    /// Perturbation scale ε.
    pub eps: f32,

    /// Base learning rate.
    pub lr: f32,

    /// Weight decay applied to `ParamRole::Weight` tensors.
    pub weight_decay: f32,

    /// Micro-batches per update.  Only 1 is supported.
    pub grad_accumulation: usize,
}

impl Default for ZoConfig {
    fn default() -> Self {
        Self {
            eps: crate::config::DEFAULT_ZO_EPS,
            lr: crate::config::DEFAULT_ZO_LR,
            weight_decay: 0.0,
            grad_accumulation: 1,
        }
    }
}

impl ZoConfig {
    /// Reject configurations the estimator cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.eps.is_finite() || self.eps <= 0.0 {
            bail!("zeroth-order eps must be finite and > 0, got {}", self.eps);
        }
        if !self.lr.is_finite() || self.lr < 0.0 {
            bail!("learning rate must be finite and >= 0, got {}", self.lr);
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            bail!("weight decay must be finite and >= 0, got {}", self.weight_decay);
        }
        if self.grad_accumulation != 1 {
            bail!(
                "gradient accumulation is not supported by the zeroth-order estimator (got {} micro-batches)",
                self.grad_accumulation
            );
        }
        Ok(())
    }
}

/// Everything the update phase needs from the estimate phase.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepEstimate {
    /// Seed that regenerates this step's direction.
    pub seed: PerturbationSeed,

    /// Directional-derivative estimate `g`.  Zero when the step is unusable.
    pub projected_grad: f32,

    /// Loss at `θ + εz`; the reported step loss.
    pub loss: f32,

    /// Loss at `θ − εz`.
    pub loss_minus: f32,
}

impl StepEstimate {
    /// Both evaluations were finite.
    pub fn is_usable(&self) -> bool {
        self.loss.is_finite() && self.loss_minus.is_finite()
    }
}

/// Running counters.
#[derive(Clone, Debug, Default)]
pub struct EstimatorStats {
    pub steps: u64,
    pub forward_evals: u64,
    pub updates: u64,
    pub skipped_updates: u64,
    /// EMA of |g|.
    pub avg_abs_grad: f32,
}

/// Two-point zeroth-order optimiser.
pub struct ZeroOrderEstimator {
    pub config: ZoConfig,
    pub stats: EstimatorStats,
    seeds: SeedSource,
}

impl ZeroOrderEstimator {
    pub fn new(config: ZoConfig, master_seed: u64) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            stats: EstimatorStats::default(),
            seeds: SeedSource::new(master_seed),
        })
    }

    /// Estimate phase: two forward passes, parameters restored on return.
    ///
    /// The perturb → evaluate → perturb → evaluate → restore order is fixed;
    /// swapping the evaluations flips the sign of `g`.
    pub fn step<O: Objective>(
        &mut self,
        params: &mut ParameterSet,
        objective: &O,
        batch: &O::Batch,
    ) -> anyhow::Result<StepEstimate> {
        if params.trainable_count() == 0 {
            bail!("zeroth-order step needs at least one trainable parameter");
        }

        let seed = self.seeds.next_seed();
        let eps = self.config.eps;

        perturb_parameters(params, seed, eps);
        let loss = objective.loss(params, batch);

        perturb_parameters(params, seed, -2.0 * eps);
        let loss_minus = objective.loss(params, batch);

        perturb_parameters(params, seed, eps);

        self.stats.steps += 1;
        self.stats.forward_evals += 2;

        let mut estimate = StepEstimate {
            seed,
            projected_grad: (loss - loss_minus) / (2.0 * eps),
            loss,
            loss_minus,
        };
        if !estimate.is_usable() || !estimate.projected_grad.is_finite() {
            tracing::warn!(
                seed = seed.0,
                loss,
                loss_minus,
                "non-finite loss in zeroth-order step; update will be skipped"
            );
            estimate.projected_grad = 0.0;
        } else {
            let alpha = 0.01;
            self.stats.avg_abs_grad =
                self.stats.avg_abs_grad * (1.0 - alpha) + estimate.projected_grad.abs() * alpha;
        }
        Ok(estimate)
    }

    /// Update phase: regenerate `z` from the estimate's seed and step.
    ///
    /// Weights get `θ ← θ − lr·(g·z + wd·θ)`; biases and norm scales skip the
    /// decay term.
    pub fn update(&mut self, params: &mut ParameterSet, estimate: &StepEstimate, lr: f32) {
        if !estimate.is_usable() {
            self.stats.skipped_updates += 1;
            tracing::warn!(seed = estimate.seed.0, "skipping update for unusable estimate");
            return;
        }

        let g = estimate.projected_grad;
        let wd = self.config.weight_decay;
        let mut stream = PerturbationStream::new(estimate.seed);

        for entry in params.trainable_mut() {
            let z = stream.next_tensor(entry.value.shape());
            match entry.tag.role {
                ParamRole::Weight => entry
                    .value
                    .zip_mut_with(&z, |t, &zi| *t -= lr * (g * zi + wd * *t)),
                ParamRole::BiasOrNorm => entry.value.zip_mut_with(&z, |t, &zi| *t -= lr * g * zi),
            }
        }
        self.stats.updates += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::objective::QuadraticObjective;
    use crate::core::params::{Tensor, TaggingRules};
    use ndarray::arr1;

    struct Quartic;

    impl Objective for Quartic {
        type Batch = ();
        fn loss(&self, params: &ParameterSet, _: &()) -> f32 {
            params
                .entries()
                .iter()
                .map(|e| e.value.iter().map(|v| v.powi(4)).sum::<f32>())
                .sum()
        }
    }

    struct AlwaysNan;

    impl Objective for AlwaysNan {
        type Batch = ();
        fn loss(&self, _: &ParameterSet, _: &()) -> f32 {
            f32::NAN
        }
    }

    fn theta(values: &[f32]) -> ParameterSet {
        let mut p = ParameterSet::new();
        p.insert("theta", arr1(values).into_dyn()).unwrap();
        p
    }

    #[test]
    fn test_config_validation() {
        assert!(ZoConfig::default().validate().is_ok());

        for eps in [0.0, -1e-3, f32::NAN] {
            let cfg = ZoConfig {
                eps,
                ..Default::default()
            };
            let err = ZeroOrderEstimator::new(cfg, 0).err().expect("invalid eps accepted");
            assert!(err.to_string().contains("eps"));
        }

        let cfg = ZoConfig {
            grad_accumulation: 4,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("accumulation"));
    }

    #[test]
    fn test_empty_trainable_set_rejected() {
        let mut est = ZeroOrderEstimator::new(ZoConfig::default(), 0).unwrap();
        let mut p = ParameterSet::new();
        p.insert_with("frozen", arr1(&[1.0f32]).into_dyn(), false).unwrap();
        let err = est.step(&mut p, &Quartic, &()).unwrap_err();
        assert!(err.to_string().contains("trainable"));
    }

    #[test]
    fn test_step_restores_parameters() {
        let mut est = ZeroOrderEstimator::new(ZoConfig::default(), 11).unwrap();
        let mut p = theta(&[0.3, -0.7, 1.1]);
        let before = p.get("theta").unwrap().clone();

        est.step(&mut p, &Quartic, &()).unwrap();

        let after = p.get("theta").unwrap();
        for (a, b) in before.iter().zip(after.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
        assert_eq!(est.stats.forward_evals, 2);
    }

    #[test]
    fn test_quadratic_estimate_is_directional_derivative() {
        let target = arr1(&[1.0f32, -2.0, 0.5]).into_dyn();
        let obj = QuadraticObjective::new(vec![("theta".to_string(), target.clone())]);
        let mut est = ZeroOrderEstimator::new(ZoConfig::default(), 5).unwrap();
        let mut p = theta(&[0.0, 0.0, 0.0]);

        let e = est.step(&mut p, &obj, &()).unwrap();
        let z = PerturbationStream::draw(e.seed, &[&[3]]);
        let grad: Tensor = (p.get("theta").unwrap() - &target) * 2.0;
        let exact: f32 = z[0].iter().zip(grad.iter()).map(|(a, b)| a * b).sum();

        assert!(
            (e.projected_grad - exact).abs() < 1e-2 * exact.abs().max(1.0),
            "estimate {} vs exact {}",
            e.projected_grad,
            exact
        );
    }

    #[test]
    fn test_estimate_converges_as_eps_shrinks() {
        // For Σθ⁴ the central difference is exactly z·∇L + 4ε²·Σθz³.
        let errors: Vec<f32> = [1e-1f32, 1e-2]
            .iter()
            .map(|&eps| {
                let cfg = ZoConfig {
                    eps,
                    ..Default::default()
                };
                let mut est = ZeroOrderEstimator::new(cfg, 21).unwrap();
                let mut p = theta(&[0.8, -0.6, 1.2]);
                let e = est.step(&mut p, &Quartic, &()).unwrap();
                let z = PerturbationStream::draw(e.seed, &[&[3]]);
                let t = p.get("theta").unwrap();
                let exact: f32 = z[0].iter().zip(t.iter()).map(|(zi, ti)| zi * 4.0 * ti.powi(3)).sum();
                let bias: f32 = z[0].iter().zip(t.iter()).map(|(zi, ti)| 4.0 * eps * eps * ti * zi.powi(3)).sum();

                assert!(
                    (e.projected_grad - exact - bias).abs() < 1e-2,
                    "eps {}: estimate {} exact {} bias {}",
                    eps,
                    e.projected_grad,
                    exact,
                    bias
                );
                (e.projected_grad - exact).abs()
            })
            .collect();

        assert!(errors[1] <= errors[0] + 1e-2, "errors = {:?}", errors);
        assert!(errors[1] < 5e-2, "errors = {:?}", errors);
    }

    #[test]
    fn test_update_rule_per_role() {
        let cfg = ZoConfig {
            lr: 0.1,
            weight_decay: 0.5,
            ..Default::default()
        };
        let mut est = ZeroOrderEstimator::new(cfg, 0).unwrap();
        let mut p = ParameterSet::new();
        p.insert("fc.weight", arr1(&[1.0f32, 2.0]).into_dyn()).unwrap();
        p.insert("fc.bias", arr1(&[1.0f32, 2.0]).into_dyn()).unwrap();
        p.apply_tags(&TaggingRules::default());
        let w0 = p.get("fc.weight").unwrap().clone();
        let b0 = p.get("fc.bias").unwrap().clone();

        let estimate = StepEstimate {
            seed: PerturbationSeed(77),
            projected_grad: 0.3,
            loss: 1.0,
            loss_minus: 0.9,
        };
        est.update(&mut p, &estimate, 0.1);

        let z = PerturbationStream::draw(PerturbationSeed(77), &[&[2], &[2]]);
        let w1 = p.get("fc.weight").unwrap();
        let b1 = p.get("fc.bias").unwrap();
        for i in 0..2 {
            let expected_w = -0.1 * (0.3 * z[0][[i]] + 0.5 * w0[[i]]);
            let expected_b = -0.1 * 0.3 * z[1][[i]];
            assert!((w1[[i]] - w0[[i]] - expected_w).abs() < 1e-6);
            assert!((b1[[i]] - b0[[i]] - expected_b).abs() < 1e-6);
        }
        assert_eq!(est.stats.updates, 1);
    }

    #[test]
    fn test_non_finite_loss_skips_update() {
        let mut est = ZeroOrderEstimator::new(ZoConfig::default(), 3).unwrap();
        let mut p = theta(&[1.0, 2.0]);
        let before = p.get("theta").unwrap().clone();

        let e = est.step(&mut p, &AlwaysNan, &()).unwrap();
        assert!(!e.is_usable());
        assert_eq!(e.projected_grad, 0.0);

        est.update(&mut p, &e, 1.0);
        assert_eq!(est.stats.skipped_updates, 1);
        let after = p.get("theta").unwrap();
        for (a, b) in before.iter().zip(after.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }
}
