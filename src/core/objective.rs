//! The loss boundary between the optimisers and the model being tuned.
//!
//! The optimisers never look inside a model: they hand a `ParameterSet` and a
//! batch to an `Objective` and get a scalar back.  Objectives that can also
//! produce exact gradients unlock the first-order radius strategy.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Ix1, Ix2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, StandardNormal};

use super::params::{ParameterSet, Tensor};

/// A scalar loss over a parameter set.
pub trait Objective {
    type Batch;

    /// Forward-only loss.  Must be deterministic for a given parameter state
    /// and batch (no dropout or other sampling).
    fn loss(&self, params: &ParameterSet, batch: &Self::Batch) -> f32;

    /// Loss plus one gradient tensor per parameter, in enumeration order.
    fn loss_and_grad(&self, _params: &ParameterSet, _batch: &Self::Batch) -> Option<(f32, Vec<Tensor>)> {
        None
    }
}

/// `L(θ) = Σ_p ‖θ_p − θ*_p‖²` over the named targets.
#[derive(Clone, Debug)]
pub struct QuadraticObjective {
    pub targets: Vec<(String, Tensor)>,
}

impl QuadraticObjective {
    pub fn new(targets: Vec<(String, Tensor)>) -> Self {
        Self { targets }
    }

    fn target(&self, name: &str) -> Option<&Tensor> {
        self.targets.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }
}

impl Objective for QuadraticObjective {
    type Batch = ();

    fn loss(&self, params: &ParameterSet, _batch: &()) -> f32 {
        self.targets
            .iter()
            .map(|(name, target)| match params.get(name) {
                Some(theta) if theta.shape() == target.shape() => theta
                    .iter()
                    .zip(target.iter())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum::<f32>(),
                _ => f32::NAN,
            })
            .sum()
    }

    fn loss_and_grad(&self, params: &ParameterSet, batch: &()) -> Option<(f32, Vec<Tensor>)> {
        let grads = params
            .entries()
            .iter()
            .map(|e| match self.target(&e.name) {
                Some(target) => (&e.value - target) * 2.0,
                None => Tensor::zeros(e.value.raw_dim()),
            })
            .collect();
        Some((self.loss(params, batch), grads))
    }
}

/// One mini-batch for `LinearRegression`.
#[derive(Clone, Debug)]
pub struct RegressionBatch {
    /// Inputs `[n, d_in]`.
    pub inputs: Array2<f32>,

    /// Targets `[n, d_out]`.
    pub targets: Array2<f32>,
}

/// Mean squared error of `y = x·Wᵀ + b`.
#[derive(Clone, Debug)]
pub struct LinearRegression {
    pub weight: String,
    pub bias: String,
}

impl Default for LinearRegression {
    fn default() -> Self {
        Self {
            weight: "linear.weight".to_string(),
            bias: "linear.bias".to_string(),
        }
    }
}

impl LinearRegression {
    fn views<'a>(&self, params: &'a ParameterSet) -> Option<(ArrayView2<'a, f32>, ArrayView1<'a, f32>)> {
        let w = params.get(&self.weight)?.view().into_dimensionality::<Ix2>().ok()?;
        let b = params.get(&self.bias)?.view().into_dimensionality::<Ix1>().ok()?;
        Some((w, b))
    }

    /// Residuals `x·Wᵀ + b − y`, or `None` when shapes do not line up.
    fn residuals(&self, params: &ParameterSet, batch: &RegressionBatch) -> Option<Array2<f32>> {
        let (w, b) = self.views(params)?;
        if w.ncols() != batch.inputs.ncols()
            || w.nrows() != batch.targets.ncols()
            || b.len() != w.nrows()
        {
            return None;
        }
        let pred = batch.inputs.dot(&w.t()) + &b;
        Some(pred - &batch.targets)
    }
}

impl Objective for LinearRegression {
    type Batch = RegressionBatch;

    fn loss(&self, params: &ParameterSet, batch: &RegressionBatch) -> f32 {
        match self.residuals(params, batch) {
            Some(err) if !err.is_empty() => err.mapv(|v| v * v).sum() / err.len() as f32,
            _ => f32::NAN,
        }
    }

    fn loss_and_grad(&self, params: &ParameterSet, batch: &RegressionBatch) -> Option<(f32, Vec<Tensor>)> {
        let err = self.residuals(params, batch)?;
        if err.is_empty() {
            return None;
        }
        let scale = 2.0 / err.len() as f32;
        let loss = err.mapv(|v| v * v).sum() / err.len() as f32;
        let grad_w = err.t().dot(&batch.inputs) * scale;
        let grad_b = err.sum_axis(Axis(0)) * scale;

        let grads = params
            .entries()
            .iter()
            .map(|e| {
                if e.name == self.weight {
                    grad_w.clone().into_dyn()
                } else if e.name == self.bias {
                    grad_b.clone().into_dyn()
                } else {
                    Tensor::zeros(e.value.raw_dim())
                }
            })
            .collect();
        Some((loss, grads))
    }
}

/// Ground truth and batches of a seeded synthetic regression task.
pub struct SyntheticRegression {
    pub true_weight: Array2<f32>,
    pub true_bias: Array1<f32>,
    pub batches: Vec<RegressionBatch>,
}

/// Sample `W*`, `b*` and `n_batches` noisy batches of `y = x·W*ᵀ + b* + ε`.
pub fn synthetic_regression(
    d_in: usize,
    d_out: usize,
    n_batches: usize,
    batch_size: usize,
    noise_std: f32,
    seed: u64,
) -> SyntheticRegression {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = if noise_std.is_finite() && noise_std > 0.0 {
        Normal::new(0.0f32, noise_std).ok()
    } else {
        None
    };

    let true_weight: Array2<f32> = Array2::from_shape_fn((d_out, d_in), |_| StandardNormal.sample(&mut rng));
    let true_bias: Array1<f32> = Array1::from_shape_fn(d_out, |_| StandardNormal.sample(&mut rng));

    let batches = (0..n_batches)
        .map(|_| {
            let inputs: Array2<f32> =
                Array2::from_shape_fn((batch_size, d_in), |_| StandardNormal.sample(&mut rng));
            let mut targets = inputs.dot(&true_weight.t()) + &true_bias;
            if let Some(ref dist) = noise {
                targets.mapv_inplace(|v| v + dist.sample(&mut rng));
            }
            RegressionBatch { inputs, targets }
        })
        .collect();

    SyntheticRegression {
        true_weight,
        true_bias,
        batches,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    fn regression_params(w: Array2<f32>, b: Array1<f32>) -> ParameterSet {
        let mut p = ParameterSet::new();
        p.insert("linear.weight", w.into_dyn()).unwrap();
        p.insert("linear.bias", b.into_dyn()).unwrap();
        p
    }

    #[test]
    fn test_quadratic_loss_and_grad() {
        let obj = QuadraticObjective::new(vec![("theta".to_string(), arr1(&[1.0f32, -2.0]).into_dyn())]);
        let mut p = ParameterSet::new();
        p.insert("theta", arr1(&[0.0f32, 0.0]).into_dyn()).unwrap();

        assert!((obj.loss(&p, &()) - 5.0).abs() < 1e-6);
        let (_, grads) = obj.loss_and_grad(&p, &()).unwrap();
        assert!((grads[0][[0]] + 2.0).abs() < 1e-6);
        assert!((grads[0][[1]] - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_quadratic_missing_param_is_nan() {
        let obj = QuadraticObjective::new(vec![("missing".to_string(), arr1(&[1.0f32]).into_dyn())]);
        let p = ParameterSet::new();
        assert!(obj.loss(&p, &()).is_nan());
    }

    #[test]
    fn test_regression_zero_at_truth() {
        let data = synthetic_regression(3, 2, 1, 8, 0.0, 7);
        let p = regression_params(data.true_weight.clone(), data.true_bias.clone());
        let loss = LinearRegression::default().loss(&p, &data.batches[0]);
        assert!(loss < 1e-8, "loss = {}", loss);
    }

    #[test]
    fn test_regression_gradient_matches_finite_difference() {
        let batch = RegressionBatch {
            inputs: arr2(&[[1.0f32, 2.0], [0.5, -1.0], [3.0, 0.0]]),
            targets: arr2(&[[1.0f32], [0.0], [2.0]]),
        };
        let obj = LinearRegression::default();
        let mut p = regression_params(arr2(&[[0.3f32, -0.2]]), arr1(&[0.1f32]));

        let (_, grads) = obj.loss_and_grad(&p, &batch).unwrap();
        let h = 1e-3f32;
        let w = p.get_mut("linear.weight").unwrap();
        w[[0, 0]] += h;
        let up = obj.loss(&p, &batch);
        p.get_mut("linear.weight").unwrap()[[0, 0]] -= 2.0 * h;
        let down = obj.loss(&p, &batch);
        let fd = (up - down) / (2.0 * h);

        assert!((grads[0][[0, 0]] - fd).abs() < 1e-2, "analytic {} vs fd {}", grads[0][[0, 0]], fd);
    }

    #[test]
    fn test_regression_shape_mismatch_is_nan() {
        let batch = RegressionBatch {
            inputs: Array2::zeros((2, 3)),
            targets: Array2::zeros((2, 1)),
        };
        let p = regression_params(Array2::zeros((1, 2)), Array1::zeros(1));
        assert!(LinearRegression::default().loss(&p, &batch).is_nan());
    }
}
