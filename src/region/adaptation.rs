//! Learning the trust-region radii.
//!
//! The trainer is invoked periodically by the outer loop.  Each invocation
//! runs `K` inner iterations of one radius strategy on batches from its own
//! cyclic loader, then commits the projection onto the live model:
//!
//!   Idle → InnerLoop(0..K) → Commit → Idle
//!
//! There is no early exit on loss; the commit always happens.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use super::constraint::{radius_sensitivity, ConstraintSet, NormMode, RadiusProbe};
use crate::core::objective::Objective;
use crate::core::params::{AnchorSnapshot, ParameterSet};
use crate::learning::perturbation::SeedSource;
use crate::learning::radius_optim::{AdamConfig, RadiusAdam};

/// Which radius strategy a trainer runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdaptStrategy {
    /// Two-point probe over the radii themselves.
    #[default]
    Zeroth,
    /// Gradient of the projected loss with respect to the radii.
    First,
}

/// Trust-region settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub strategy: AdaptStrategy,

    pub norm_mode: NormMode,

    /// Inner iterations per invocation (`K`).
    pub inner_iters: usize,

    /// Step size of the zeroth-order radius update.
    pub zo_radius_lr: f32,

    /// Adam learning rate of the first-order radius update.
    pub fo_radius_lr: f32,

    /// Probe scale of the zeroth-order radius update.
    pub probe_scale: f32,

    /// Radii stay within `[(1 − τ)·r0, (1 + τ)·r0]`.
    pub tolerance: f32,

    /// Weight of the `Σ|r|` penalty in the first-order loss.
    pub l1_penalty: f32,
}

impl Default for RegionConfig {
    fn default() -> Self {
        use crate::config::*;
        Self {
            strategy: AdaptStrategy::Zeroth,
            norm_mode: NormMode::L2,
            inner_iters: DEFAULT_INNER_ITERS,
            zo_radius_lr: DEFAULT_ZO_RADIUS_LR,
            fo_radius_lr: DEFAULT_FO_RADIUS_LR,
            probe_scale: DEFAULT_PROBE_SCALE,
            tolerance: DEFAULT_TOLERANCE,
            l1_penalty: DEFAULT_L1_PENALTY,
        }
    }
}

impl RegionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.inner_iters == 0 {
            bail!("trust-region inner iterations must be >= 1");
        }
        if !(0.0..1.0).contains(&self.tolerance) {
            bail!("trust-region tolerance must be in [0, 1), got {}", self.tolerance);
        }
        if !self.probe_scale.is_finite() || self.probe_scale <= 0.0 {
            bail!("radius probe scale must be finite and > 0, got {}", self.probe_scale);
        }
        for (what, v) in [
            ("zeroth-order radius lr", self.zo_radius_lr),
            ("first-order radius lr", self.fo_radius_lr),
            ("l1 penalty", self.l1_penalty),
        ] {
            if !v.is_finite() || v < 0.0 {
                bail!("{} must be finite and >= 0, got {}", what, v);
            }
        }
        Ok(())
    }
}

/// Batches served round-robin, restarting on exhaustion.
pub struct CyclicLoader<B> {
    batches: Vec<B>,
    cursor: usize,
    restarts: usize,
}

impl<B> CyclicLoader<B> {
    pub fn new(batches: Vec<B>) -> anyhow::Result<Self> {
        if batches.is_empty() {
            bail!("cyclic loader needs at least one batch");
        }
        Ok(Self {
            batches,
            cursor: 0,
            restarts: 0,
        })
    }

    pub fn next_batch(&mut self) -> &B {
        if self.cursor == self.batches.len() {
            self.cursor = 0;
            self.restarts += 1;
        }
        let idx = self.cursor;
        self.cursor += 1;
        &self.batches[idx]
    }

    /// Times the loader wrapped around.
    pub fn restarts(&self) -> usize {
        self.restarts
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

/// Result of one inner iteration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IterationOutcome {
    /// Task loss seen by the iteration (`L+` for the zeroth-order strategy).
    pub loss: f32,
    /// The radius update was skipped on a non-finite loss.
    pub skipped: bool,
}

/// A radius-learning strategy.
pub trait RadiusAdapter<O: Objective> {
    fn name(&self) -> &'static str;

    /// Called once at the start of every invocation.
    fn begin(
        &mut self,
        region: &mut ConstraintSet,
        params: &ParameterSet,
        anchor: &AnchorSnapshot,
    ) -> anyhow::Result<()>;

    /// One inner iteration.  `params` must be unchanged on return.
    fn iterate(
        &mut self,
        region: &mut ConstraintSet,
        params: &mut ParameterSet,
        anchor: &AnchorSnapshot,
        objective: &O,
        batch: &O::Batch,
    ) -> anyhow::Result<IterationOutcome>;
}

/// Zeroth-order radius adaptation.
///
/// Radii are reset to the current deviation sizes at the start of every
/// invocation, then refined by a probe `z_i = r0_i·N(0,1)`:
///
///   g = (L(r + s·z) − L(r − s·z)) / 2s,   r ← clip(r − lr·g·z)
pub struct ZerothOrderAdapter {
    pub probe_scale: f32,
    pub radius_lr: f32,
    pub tolerance: f32,
    seeds: SeedSource,
}

impl ZerothOrderAdapter {
    pub fn new(config: &RegionConfig, seed: u64) -> Self {
        Self {
            probe_scale: config.probe_scale,
            radius_lr: config.zo_radius_lr,
            tolerance: config.tolerance,
            seeds: SeedSource::new(seed),
        }
    }

    fn probed_loss<O: Objective>(
        region: &ConstraintSet,
        params: &mut ParameterSet,
        anchor: &AnchorSnapshot,
        objective: &O,
        batch: &O::Batch,
    ) -> anyhow::Result<f32> {
        let scope = region.apply(params, anchor)?;
        let loss = objective.loss(params, batch);
        region.reverse(params, anchor, scope)?;
        Ok(loss)
    }
}

impl<O: Objective> RadiusAdapter<O> for ZerothOrderAdapter {
    fn name(&self) -> &'static str {
        "zeroth-order"
    }

    fn begin(
        &mut self,
        region: &mut ConstraintSet,
        params: &ParameterSet,
        anchor: &AnchorSnapshot,
    ) -> anyhow::Result<()> {
        let deviations = region.deviations(params, anchor)?;
        region.reset_bases(&deviations);
        Ok(())
    }

    fn iterate(
        &mut self,
        region: &mut ConstraintSet,
        params: &mut ParameterSet,
        anchor: &AnchorSnapshot,
        objective: &O,
        batch: &O::Batch,
    ) -> anyhow::Result<IterationOutcome> {
        let baseline = region.radii();
        let probe = RadiusProbe::draw(self.seeds.next_seed(), &region.bases(), self.probe_scale);

        region.perturb_radii(1.0, &probe);
        let loss_plus = Self::probed_loss(region, params, anchor, objective, batch)?;

        region.set_radii(&baseline);
        region.perturb_radii(-1.0, &probe);
        let loss_minus = Self::probed_loss(region, params, anchor, objective, batch)?;

        region.set_radii(&baseline);

        if !loss_plus.is_finite() || !loss_minus.is_finite() {
            tracing::warn!(loss_plus, loss_minus, "non-finite probe loss; radii left unchanged");
            return Ok(IterationOutcome {
                loss: loss_plus,
                skipped: true,
            });
        }

        let grad = (loss_plus - loss_minus) / (2.0 * self.probe_scale);
        let updated: Vec<f32> = baseline
            .iter()
            .zip(&probe.z)
            .map(|(r, z)| r - self.radius_lr * grad * z)
            .collect();
        region.set_radii(&updated);
        region.clip_to_bases(self.tolerance);

        Ok(IterationOutcome {
            loss: loss_plus,
            skipped: false,
        })
    }
}

/// First-order radius adaptation.
///
/// Minimises `L(project(θ)) + λ·Σ|r|` over the radii with Adam, using the
/// objective's analytic gradient on a projected copy of the model.  Radii
/// are initialised once and keep their optimiser state across invocations;
/// only the bases are refreshed.
pub struct FirstOrderAdapter {
    pub l1_penalty: f32,
    pub tolerance: f32,
    optimizer: RadiusAdam,
}

impl FirstOrderAdapter {
    pub fn new(config: &RegionConfig) -> Self {
        Self {
            l1_penalty: config.l1_penalty,
            tolerance: config.tolerance,
            optimizer: RadiusAdam::new(AdamConfig {
                lr: config.fo_radius_lr,
                ..Default::default()
            }),
        }
    }

    pub fn optimizer(&self) -> &RadiusAdam {
        &self.optimizer
    }
}

impl<O: Objective> RadiusAdapter<O> for FirstOrderAdapter {
    fn name(&self) -> &'static str {
        "first-order"
    }

    fn begin(
        &mut self,
        region: &mut ConstraintSet,
        params: &ParameterSet,
        anchor: &AnchorSnapshot,
    ) -> anyhow::Result<()> {
        let deviations = region.deviations(params, anchor)?;
        if region.is_initialized() {
            region.rebase(&deviations);
            region.clip_to_bases(self.tolerance);
        } else {
            region.reset_bases(&deviations);
        }
        Ok(())
    }

    fn iterate(
        &mut self,
        region: &mut ConstraintSet,
        params: &mut ParameterSet,
        anchor: &AnchorSnapshot,
        objective: &O,
        batch: &O::Batch,
    ) -> anyhow::Result<IterationOutcome> {
        let mut projected = params.clone();
        region.commit(&mut projected, anchor)?;

        let (task_loss, grads) = objective
            .loss_and_grad(&projected, batch)
            .context("first-order radius adaptation needs an objective with gradients")?;
        if grads.len() != params.len() {
            bail!(
                "objective returned {} gradients for {} parameters",
                grads.len(),
                params.len()
            );
        }

        let mut radii = region.radii();
        let penalty: f32 = radii.iter().map(|r| r.abs()).sum::<f32>() * self.l1_penalty;
        let loss = task_loss + penalty;
        if !loss.is_finite() {
            tracing::warn!(task_loss, "non-finite projected loss; radii left unchanged");
            return Ok(IterationOutcome { loss, skipped: true });
        }

        let mut radius_grads = Vec::with_capacity(radii.len());
        for (tracked, r) in region.entries().iter().zip(&radii) {
            let current = &params.entry(tracked.index).value;
            let a = anchor
                .get(&tracked.name)
                .with_context(|| format!("anchor has no entry for '{}'", tracked.name))?;
            let g = radius_sensitivity(current, a, &grads[tracked.index], region.mode());
            radius_grads.push(g + self.l1_penalty * r.signum());
        }

        self.optimizer.step(&mut radii, &radius_grads);
        region.set_radii(&radii);
        region.clip_to_bases(self.tolerance);

        Ok(IterationOutcome { loss, skipped: false })
    }
}

/// Where the trainer is within an invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrainerPhase {
    Idle,
    InnerLoop { count: usize },
    Commit,
}

/// Summary of one invocation.
#[derive(Clone, Debug)]
pub struct AdaptReport {
    pub strategy: &'static str,
    pub iterations: usize,
    pub skipped: usize,
    /// Mean finite inner-loop loss, NaN if none was finite.
    pub mean_loss: f32,
    pub radii: Vec<f32>,
}

/// Owns the radii and drives one adaptation cycle per `run`.
pub struct TrustRegionTrainer<O: Objective> {
    region: ConstraintSet,
    adapter: Box<dyn RadiusAdapter<O>>,
    loader: CyclicLoader<O::Batch>,
    inner_iters: usize,
    phase: TrainerPhase,
    invocations: u64,
}

impl<O: Objective> TrustRegionTrainer<O> {
    pub fn new(
        region: ConstraintSet,
        config: &RegionConfig,
        loader: CyclicLoader<O::Batch>,
        seed: u64,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        if region.is_empty() {
            bail!("trust region tracks no parameters");
        }
        let adapter: Box<dyn RadiusAdapter<O>> = match config.strategy {
            AdaptStrategy::Zeroth => Box::new(ZerothOrderAdapter::new(config, seed)),
            AdaptStrategy::First => Box::new(FirstOrderAdapter::new(config)),
        };
        Ok(Self {
            region,
            adapter,
            loader,
            inner_iters: config.inner_iters,
            phase: TrainerPhase::Idle,
            invocations: 0,
        })
    }

    pub fn region(&self) -> &ConstraintSet {
        &self.region
    }

    pub fn phase(&self) -> TrainerPhase {
        self.phase
    }

    pub fn invocations(&self) -> u64 {
        self.invocations
    }

    pub fn loader(&self) -> &CyclicLoader<O::Batch> {
        &self.loader
    }

    pub fn strategy_name(&self) -> &'static str {
        self.adapter.name()
    }

    /// One full adaptation cycle, ending with the projection committed onto
    /// `params`.
    pub fn run(
        &mut self,
        params: &mut ParameterSet,
        anchor: &AnchorSnapshot,
        objective: &O,
    ) -> anyhow::Result<AdaptReport> {
        let result = self.run_cycle(params, anchor, objective);
        self.phase = TrainerPhase::Idle;
        result
    }

    fn run_cycle(
        &mut self,
        params: &mut ParameterSet,
        anchor: &AnchorSnapshot,
        objective: &O,
    ) -> anyhow::Result<AdaptReport> {
        self.phase = TrainerPhase::InnerLoop { count: 0 };
        self.adapter.begin(&mut self.region, params, anchor)?;

        let mut skipped = 0;
        let mut loss_sum = 0.0f32;
        let mut finite = 0usize;
        for count in 0..self.inner_iters {
            let batch = self.loader.next_batch();
            let outcome = self
                .adapter
                .iterate(&mut self.region, params, anchor, objective, batch)?;
            if outcome.skipped {
                skipped += 1;
            }
            if outcome.loss.is_finite() {
                loss_sum += outcome.loss;
                finite += 1;
            }
            self.phase = TrainerPhase::InnerLoop { count: count + 1 };
        }

        self.phase = TrainerPhase::Commit;
        self.region.commit(params, anchor)?;
        self.invocations += 1;

        let report = AdaptReport {
            strategy: self.adapter.name(),
            iterations: self.inner_iters,
            skipped,
            mean_loss: if finite > 0 {
                loss_sum / finite as f32
            } else {
                f32::NAN
            },
            radii: self.region.radii(),
        };
        tracing::debug!(
            invocation = self.invocations,
            strategy = report.strategy,
            mean_loss = report.mean_loss,
            skipped = report.skipped,
            "trust region committed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::objective::QuadraticObjective;
    use crate::core::params::{l2_norm, Tensor};
    use ndarray::arr1;

    struct LossOnly;

    impl Objective for LossOnly {
        type Batch = ();
        fn loss(&self, params: &ParameterSet, _: &()) -> f32 {
            params.entries().iter().map(|e| e.value.sum()).sum()
        }
    }

    fn drifted() -> (ParameterSet, AnchorSnapshot) {
        let mut p = ParameterSet::new();
        p.insert("a", arr1(&[0.0f32, 0.0, 0.0]).into_dyn()).unwrap();
        p.insert("b", arr1(&[1.0f32, 1.0]).into_dyn()).unwrap();
        let anchor = AnchorSnapshot::capture(&p);
        *p.get_mut("a").unwrap() = arr1(&[2.0f32, -1.0, 0.5]).into_dyn();
        *p.get_mut("b").unwrap() = arr1(&[1.5f32, 0.0]).into_dyn();
        (p, anchor)
    }

    fn quadratic() -> QuadraticObjective {
        QuadraticObjective::new(vec![
            ("a".to_string(), arr1(&[0.5f32, -0.2, 0.1]).into_dyn()),
            ("b".to_string(), arr1(&[1.0f32, 1.0]).into_dyn()),
        ])
    }

    fn trainer(strategy: AdaptStrategy, p: &ParameterSet, anchor: &AnchorSnapshot) -> TrustRegionTrainer<QuadraticObjective> {
        let config = RegionConfig {
            strategy,
            ..Default::default()
        };
        let region = ConstraintSet::new(p, anchor, config.norm_mode).unwrap();
        TrustRegionTrainer::new(region, &config, CyclicLoader::new(vec![(), ()]).unwrap(), 17).unwrap()
    }

    #[test]
    fn test_cyclic_loader_restarts() {
        let mut loader = CyclicLoader::new(vec![1, 2, 3]).unwrap();
        let seen: Vec<i32> = (0..7).map(|_| *loader.next_batch()).collect();
        assert_eq!(seen, vec![1, 2, 3, 1, 2, 3, 1]);
        assert_eq!(loader.restarts(), 2);

        assert!(CyclicLoader::<i32>::new(Vec::new()).is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(RegionConfig::default().validate().is_ok());
        let bad = RegionConfig {
            tolerance: 1.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = RegionConfig {
            inner_iters: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_zeroth_order_radii_stay_bounded() {
        let (mut p, anchor) = drifted();
        let mut t = trainer(AdaptStrategy::Zeroth, &p, &anchor);
        let obj = quadratic();

        for _ in 0..5 {
            t.run(&mut p, &anchor, &obj).unwrap();
            let region = t.region();
            for (r, b) in region.radii().iter().zip(region.bases()) {
                assert!(*r >= 0.8 * b - 1e-5 && *r <= 1.2 * b + 1e-5, "r {} base {}", r, b);
            }
        }
        assert_eq!(t.invocations(), 5);
        assert_eq!(t.phase(), TrainerPhase::Idle);
        assert_eq!(t.loader().restarts(), 24);
    }

    #[test]
    fn test_commit_projects_live_model() {
        let (mut p, anchor) = drifted();
        let mut t = trainer(AdaptStrategy::Zeroth, &p, &anchor);
        let report = t.run(&mut p, &anchor, &quadratic()).unwrap();

        assert_eq!(report.iterations, RegionConfig::default().inner_iters);
        assert_eq!(report.strategy, "zeroth-order");
        for (name, r) in ["a", "b"].iter().zip(&report.radii) {
            let delta: Tensor = p.get(name).unwrap() - anchor.get(name).unwrap();
            assert!((l2_norm(&delta) - r).abs() < 1e-4, "{}: {} vs {}", name, l2_norm(&delta), r);
        }
    }

    #[test]
    fn test_zeroth_order_probe_leaves_params_and_radii() {
        let (mut p, anchor) = drifted();
        let before = p.clone();
        let config = RegionConfig::default();
        let mut region = ConstraintSet::new(&p, &anchor, NormMode::L2).unwrap();
        let mut adapter = ZerothOrderAdapter::new(&config, 3);
        RadiusAdapter::<QuadraticObjective>::begin(&mut adapter, &mut region, &p, &anchor).unwrap();
        let bases = region.bases();
        assert!((bases[0] - 5.25f32.sqrt()).abs() < 1e-5);

        RadiusAdapter::<QuadraticObjective>::iterate(&mut adapter, &mut region, &mut p, &anchor, &quadratic(), &())
            .unwrap();
        for (x, y) in before.entries().iter().zip(p.entries()) {
            for (u, v) in x.value.iter().zip(y.value.iter()) {
                assert!((u - v).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_first_order_needs_gradients() {
        let (mut p, anchor) = drifted();
        let config = RegionConfig {
            strategy: AdaptStrategy::First,
            ..Default::default()
        };
        let region = ConstraintSet::new(&p, &anchor, NormMode::L2).unwrap();
        let mut t: TrustRegionTrainer<LossOnly> =
            TrustRegionTrainer::new(region, &config, CyclicLoader::new(vec![()]).unwrap(), 0).unwrap();

        let err = t.run(&mut p, &anchor, &LossOnly).unwrap_err();
        assert!(err.to_string().contains("gradients"));
        assert_eq!(t.phase(), TrainerPhase::Idle);
        assert_eq!(t.invocations(), 0);
    }

    #[test]
    fn test_first_order_shrinks_radius_toward_target() {
        // Target sits inside the current deviation, so the loss wants a smaller radius.
        let mut p = ParameterSet::new();
        p.insert("w", arr1(&[0.0f32, 0.0]).into_dyn()).unwrap();
        let anchor = AnchorSnapshot::capture(&p);
        *p.get_mut("w").unwrap() = arr1(&[2.0f32, 0.0]).into_dyn();
        let obj = QuadraticObjective::new(vec![("w".to_string(), arr1(&[1.0f32, 0.0]).into_dyn())]);
        let loss_before = obj.loss(&p, &());

        let mut t = trainer(AdaptStrategy::First, &p, &anchor);
        let report = t.run(&mut p, &anchor, &obj).unwrap();

        let r = report.radii[0];
        assert!(r < 2.0 && r >= 1.6 - 1e-5, "r = {}", r);
        assert!(obj.loss(&p, &()) < loss_before);
        assert_eq!(t.strategy_name(), "first-order");
    }
}
