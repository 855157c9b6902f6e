//! zotune: zeroth-order fine-tuning with a learned trust region.
//!
//! CLI entry point: trains a seeded synthetic linear-regression model.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use ndarray::{Array1, Array2};
use zotune::core::objective::{synthetic_regression, LinearRegression, Objective, RegressionBatch};
use zotune::core::params::ParameterSet;
use zotune::learning::zeroth_order::ZoConfig;
use zotune::region::adaptation::{AdaptStrategy, RegionConfig};
use zotune::region::constraint::NormMode;
use zotune::runtime::orchestrator::{TrainConfig, TrainingOrchestrator};
use zotune::runtime::schedule::LrSchedule;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Enhanced {
    /// Plain zeroth-order training.
    None,
    /// Trust region with zeroth-order radius adaptation.
    Zo,
    /// Trust region with first-order radius adaptation.
    Fo,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Norm {
    L2,
    RowL1,
}

/// zotune training CLI.
#[derive(Parser, Debug)]
#[command(
    name = "zotune",
    about = "Zeroth-order fine-tuning with a learned trust region",
    version
)]
struct Cli {
    /// Number of zeroth-order steps.
    #[arg(long, default_value_t = 2000)]
    steps: u64,

    /// Perturbation scale.
    #[arg(long, default_value_t = zotune::config::DEFAULT_ZO_EPS)]
    eps: f32,

    /// Learning rate.
    #[arg(long, default_value_t = 0.01)]
    lr: f32,

    #[arg(long, default_value_t = 0.0)]
    weight_decay: f32,

    /// Trust-region mode.
    #[arg(long, value_enum, default_value_t = Enhanced::None)]
    enhanced: Enhanced,

    /// Steps between adaptation cycles.
    #[arg(long, default_value_t = zotune::config::DEFAULT_ADAPT_INTERVAL)]
    interval: u64,

    /// Inner iterations per adaptation cycle.
    #[arg(long, default_value_t = zotune::config::DEFAULT_INNER_ITERS)]
    inner_iters: usize,

    #[arg(long, value_enum, default_value_t = Norm::L2)]
    norm: Norm,

    /// Radius tolerance τ.
    #[arg(long, default_value_t = zotune::config::DEFAULT_TOLERANCE)]
    tolerance: f32,

    /// Decay the learning rate linearly to half over the run.
    #[arg(long, default_value_t = false)]
    decay: bool,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Input dimension of the synthetic model.
    #[arg(long, default_value_t = 8)]
    dim: usize,

    /// Where to write the best checkpoint.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

const OUTPUTS: usize = 2;
const TRAIN_BATCHES: usize = 32;
const REGION_BATCHES: usize = 4;
const EVAL_BATCHES: usize = 4;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    tracing::info!("zotune v{}", env!("CARGO_PKG_VERSION"));

    let data = synthetic_regression(
        cli.dim,
        OUTPUTS,
        TRAIN_BATCHES + REGION_BATCHES + EVAL_BATCHES,
        16,
        0.1,
        cli.seed,
    );
    let mut batches = data.batches;
    let eval_batches: Vec<RegressionBatch> = batches.split_off(TRAIN_BATCHES + REGION_BATCHES);
    let region_batches = batches.split_off(TRAIN_BATCHES);

    let mut params = ParameterSet::new();
    params.insert("linear.weight", Array2::<f32>::zeros((OUTPUTS, cli.dim)).into_dyn())?;
    params.insert("linear.bias", Array1::<f32>::zeros(OUTPUTS).into_dyn())?;

    let region = match cli.enhanced {
        Enhanced::None => None,
        Enhanced::Zo | Enhanced::Fo => Some(RegionConfig {
            strategy: if matches!(cli.enhanced, Enhanced::Fo) {
                AdaptStrategy::First
            } else {
                AdaptStrategy::Zeroth
            },
            norm_mode: match cli.norm {
                Norm::L2 => NormMode::L2,
                Norm::RowL1 => NormMode::RowL1,
            },
            inner_iters: cli.inner_iters,
            tolerance: cli.tolerance,
            ..Default::default()
        }),
    };

    let config = TrainConfig {
        zo: ZoConfig {
            eps: cli.eps,
            lr: cli.lr,
            weight_decay: cli.weight_decay,
            grad_accumulation: 1,
        },
        region,
        max_steps: cli.steps,
        adapt_interval: cli.interval,
        schedule: if cli.decay {
            LrSchedule::LinearHalfDecay
        } else {
            LrSchedule::Constant
        },
        seed: cli.seed,
        ..Default::default()
    };

    tracing::info!(
        "Config: {} steps, eps={}, lr={}, enhanced={:?}, norm={:?}",
        cli.steps,
        cli.eps,
        cli.lr,
        cli.enhanced,
        cli.norm,
    );

    let objective = LinearRegression::default();
    let eval_objective = objective.clone();
    let mut orchestrator =
        TrainingOrchestrator::new(config, &mut params, objective, batches, region_batches)?;

    let mut evaluator = |p: &ParameterSet| {
        let mse: f32 = eval_batches
            .iter()
            .map(|b| eval_objective.loss(p, b))
            .sum::<f32>()
            / eval_batches.len() as f32;
        -mse
    };
    let summary = orchestrator.train_with_eval(&mut params, &mut evaluator)?;

    tracing::info!(
        "Finished {} steps: final loss {:.5}, {} adaptations, {} skipped updates",
        summary.steps,
        summary.final_loss,
        summary.adaptations,
        summary.skipped_updates,
    );
    if let Some(radii) = &summary.radii {
        tracing::info!("Radii: {:?}", radii);
    }

    match (&summary.best, &cli.output) {
        (Some(best), Some(path)) => {
            best.save(path)
                .with_context(|| format!("saving best checkpoint (step {})", best.step))?;
            tracing::info!(
                "Best checkpoint (step {}, eval mse {:.5}) written to {}",
                best.step,
                -best.metric,
                path.display()
            );
        }
        (None, Some(_)) => tracing::warn!("No evaluation ran; nothing to save."),
        _ => {}
    }

    tracing::info!("Done.");
    Ok(())
}
