//! The outer training loop.
//!
//! Each global step runs one zeroth-order estimate and update on the next
//! training batch.  When a trust region is configured, every
//! `adapt_interval` steps one adaptation cycle runs between two zeroth-order
//! steps (never interleaved with one).  Evaluation and best-checkpoint
//! selection run on their own cadence.

use anyhow::bail;
use serde::{Deserialize, Serialize};

use super::health::{HealthStatus, LossTracker};
use super::schedule::LrSchedule;
use crate::core::checkpoint::Checkpoint;
use crate::core::objective::Objective;
use crate::core::params::{AnchorSnapshot, ParameterSet, TaggingRules};
use crate::learning::zeroth_order::{ZeroOrderEstimator, ZoConfig};
use crate::region::adaptation::{CyclicLoader, RegionConfig, TrustRegionTrainer};
use crate::region::constraint::ConstraintSet;

/// Training configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainConfig {
    pub zo: ZoConfig,

    /// Trust-region settings; `None` trains with the plain estimator.
    pub region: Option<RegionConfig>,

    pub max_steps: u64,

    /// Steps between trust-region adaptation cycles.
    pub adapt_interval: u64,

    pub log_every: u64,

    pub eval_every: u64,

    pub schedule: LrSchedule,

    /// Master seed for every random stream in the run.
    pub seed: u64,

    pub tagging: TaggingRules,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            zo: ZoConfig::default(),
            region: None,
            max_steps: 1000,
            adapt_interval: crate::config::DEFAULT_ADAPT_INTERVAL,
            log_every: crate::config::DEFAULT_LOG_EVERY,
            eval_every: crate::config::DEFAULT_EVAL_EVERY,
            schedule: LrSchedule::Constant,
            seed: 42,
            tagging: TaggingRules::default(),
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.zo.validate()?;
        if let Some(region) = &self.region {
            region.validate()?;
        }
        for (what, v) in [
            ("adapt_interval", self.adapt_interval),
            ("log_every", self.log_every),
            ("eval_every", self.eval_every),
        ] {
            if v == 0 {
                bail!("{} must be >= 1", what);
            }
        }
        Ok(())
    }
}

/// Scores a model; higher is better.
pub trait Evaluator {
    fn evaluate(&mut self, params: &ParameterSet) -> f32;
}

impl<F> Evaluator for F
where
    F: FnMut(&ParameterSet) -> f32,
{
    fn evaluate(&mut self, params: &ParameterSet) -> f32 {
        self(params)
    }
}

/// What one global step did.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepReport {
    /// Step index (0-based) this report belongs to.
    pub step: u64,
    /// Reported loss: `L(θ + εz)`, or the running average if non-finite.
    pub loss: f32,
    pub lr: f32,
    pub updated: bool,
    pub adapted: bool,
}

/// Outcome of a full run.
#[derive(Clone, Debug)]
pub struct TrainSummary {
    pub steps: u64,
    pub final_loss: f32,
    pub loss_history: Vec<f32>,
    pub adaptations: u64,
    pub skipped_updates: u64,
    pub best: Option<Checkpoint>,
    /// Radii after the last adaptation cycle.
    pub radii: Option<Vec<f32>>,
}

/// Drives zeroth-order training with optional trust-region adaptation.
pub struct TrainingOrchestrator<O: Objective> {
    config: TrainConfig,
    objective: O,
    estimator: ZeroOrderEstimator,
    trainer: Option<TrustRegionTrainer<O>>,
    anchor: AnchorSnapshot,
    train: CyclicLoader<O::Batch>,
    losses: LossTracker,
    history: Vec<f32>,
    global_step: u64,
    adaptations: u64,
    best: Option<Checkpoint>,
}

impl<O: Objective> TrainingOrchestrator<O> {
    /// Tag `params`, capture the anchor and build every component.
    ///
    /// `region_batches` feed the trust-region inner loop and are only used
    /// when `config.region` is set.
    pub fn new(
        config: TrainConfig,
        params: &mut ParameterSet,
        objective: O,
        train_batches: Vec<O::Batch>,
        region_batches: Vec<O::Batch>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        params.apply_tags(&config.tagging);
        if params.trainable_count() == 0 {
            bail!("no trainable parameters after tagging");
        }

        let anchor = AnchorSnapshot::capture(params);
        let estimator = ZeroOrderEstimator::new(config.zo.clone(), config.seed)?;
        let train = CyclicLoader::new(train_batches)?;

        let trainer = match &config.region {
            Some(region_config) => {
                let region = ConstraintSet::new(params, &anchor, region_config.norm_mode)?;
                let loader = CyclicLoader::new(region_batches)?;
                Some(TrustRegionTrainer::new(
                    region,
                    region_config,
                    loader,
                    config.seed.wrapping_add(1),
                )?)
            }
            None => None,
        };

        tracing::info!(
            params = params.len(),
            trainable = params.trainable_count(),
            numel = params.numel(),
            tracked = trainer.as_ref().map_or(0, |t| t.region().len()),
            "training set up"
        );

        Ok(Self {
            config,
            objective,
            estimator,
            trainer,
            anchor,
            train,
            losses: LossTracker::default(),
            history: Vec::new(),
            global_step: 0,
            adaptations: 0,
            best: None,
        })
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn anchor(&self) -> &AnchorSnapshot {
        &self.anchor
    }

    pub fn losses(&self) -> &LossTracker {
        &self.losses
    }

    pub fn estimator(&self) -> &ZeroOrderEstimator {
        &self.estimator
    }

    pub fn trainer(&self) -> Option<&TrustRegionTrainer<O>> {
        self.trainer.as_ref()
    }

    pub fn best(&self) -> Option<&Checkpoint> {
        self.best.as_ref()
    }

    /// One global step.
    pub fn step(&mut self, params: &mut ParameterSet) -> anyhow::Result<StepReport> {
        let step = self.global_step;
        let batch = self.train.next_batch();
        let estimate = self.estimator.step(params, &self.objective, batch)?;

        let raw = if estimate.is_usable() { estimate.loss } else { f32::NAN };
        let loss = self.losses.record(raw);
        self.history.push(loss);

        let lr = self
            .config
            .schedule
            .lr_at(self.config.zo.lr, step, self.config.max_steps);
        self.estimator.update(params, &estimate, lr);

        let mut adapted = false;
        if let Some(trainer) = self.trainer.as_mut() {
            if (step + 1) % self.config.adapt_interval == 0 {
                let report = trainer.run(params, &self.anchor, &self.objective)?;
                self.adaptations += 1;
                adapted = true;
                tracing::info!(
                    step,
                    strategy = report.strategy,
                    mean_loss = report.mean_loss,
                    skipped = report.skipped,
                    "trust region adapted"
                );
            }
        }

        self.global_step += 1;
        if self.global_step % self.config.log_every == 0 {
            tracing::info!(
                step = self.global_step,
                loss,
                avg_loss = self.losses.mean(),
                lr,
                grad = estimate.projected_grad,
                "train"
            );
            if let status @ (HealthStatus::Degraded(_) | HealthStatus::Critical(_)) = self.losses.status() {
                tracing::warn!(?status, "loss health");
            }
        }

        Ok(StepReport {
            step,
            loss,
            lr,
            updated: estimate.is_usable(),
            adapted,
        })
    }

    /// Run evaluation and keep the checkpoint if it is at least as good as
    /// the best so far.
    pub fn evaluate(&mut self, params: &ParameterSet, evaluator: &mut dyn Evaluator) -> f32 {
        let metric = evaluator.evaluate(params);
        if !metric.is_finite() {
            tracing::warn!(step = self.global_step, "non-finite evaluation metric ignored");
            return metric;
        }
        let improved = self.best.as_ref().map_or(true, |b| metric >= b.metric);
        if improved {
            self.best = Some(Checkpoint::capture(params, self.global_step, metric));
        }
        tracing::info!(step = self.global_step, metric, improved, "eval");
        metric
    }

    /// Run to `max_steps` without evaluation.
    pub fn train(&mut self, params: &mut ParameterSet) -> anyhow::Result<TrainSummary> {
        self.run(params, None)
    }

    /// Run to `max_steps`, evaluating every `eval_every` steps.
    pub fn train_with_eval(
        &mut self,
        params: &mut ParameterSet,
        evaluator: &mut dyn Evaluator,
    ) -> anyhow::Result<TrainSummary> {
        self.run(params, Some(evaluator))
    }

    fn run(
        &mut self,
        params: &mut ParameterSet,
        mut evaluator: Option<&mut dyn Evaluator>,
    ) -> anyhow::Result<TrainSummary> {
        while self.global_step < self.config.max_steps {
            self.step(params)?;
            if self.global_step % self.config.eval_every == 0 {
                if let Some(ev) = evaluator.as_deref_mut() {
                    self.evaluate(params, ev);
                }
            }
        }

        let summary = TrainSummary {
            steps: self.global_step,
            final_loss: self.losses.latest().unwrap_or(0.0),
            loss_history: self.history.clone(),
            adaptations: self.adaptations,
            skipped_updates: self.estimator.stats.skipped_updates,
            best: self.best.clone(),
            radii: self.trainer.as_ref().map(|t| t.region().radii()),
        };
        tracing::info!(
            steps = summary.steps,
            final_loss = summary.final_loss,
            adaptations = summary.adaptations,
            skipped = summary.skipped_updates,
            "training finished"
        );
        Ok(summary)
    }
}
