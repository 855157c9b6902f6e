//! Loss health tracking for the training loop.
//!
//! Keeps the running average of every finite loss seen so far, which is the
//! value a non-finite loss is replaced with, plus a rolling window for
//! reporting and divergence checks.

use std::collections::VecDeque;

/// Health status levels.
#[derive(Clone, Debug, PartialEq)]
pub enum HealthStatus {
    Healthy,
    /// Latest loss is an outlier against the window.
    Degraded(String),
    /// Most of the window was non-finite.
    Critical(String),
}

#[derive(Clone, Copy, Debug)]
struct LossSample {
    step: u64,
    value: f32,
    finite: bool,
}

/// Running and windowed loss statistics.
#[derive(Clone, Debug)]
pub struct LossTracker {
    sum: f64,
    count: u64,
    non_finite: u64,
    steps: u64,
    window: VecDeque<LossSample>,
    max_window: usize,
}

impl LossTracker {
    pub fn new(max_window: usize) -> Self {
        Self {
            sum: 0.0,
            count: 0,
            non_finite: 0,
            steps: 0,
            window: VecDeque::with_capacity(max_window),
            max_window: max_window.max(1),
        }
    }

    /// Record one step loss and return the value to report.
    ///
    /// A non-finite loss is not added to the average; the running average of
    /// the prior finite losses is returned instead (0 before any).
    pub fn record(&mut self, loss: f32) -> f32 {
        let finite = loss.is_finite();
        let reported = if finite {
            self.sum += loss as f64;
            self.count += 1;
            loss
        } else {
            self.non_finite += 1;
            self.mean()
        };

        if self.window.len() >= self.max_window {
            self.window.pop_front();
        }
        self.window.push_back(LossSample {
            step: self.steps,
            value: reported,
            finite,
        });
        self.steps += 1;
        reported
    }

    /// Running average of every finite loss recorded.
    pub fn mean(&self) -> f32 {
        if self.count == 0 {
            0.0
        } else {
            (self.sum / self.count as f64) as f32
        }
    }

    /// Last reported value.
    pub fn latest(&self) -> Option<f32> {
        self.window.back().map(|s| s.value)
    }

    /// Step index of the last recorded loss.
    pub fn latest_step(&self) -> Option<u64> {
        self.window.back().map(|s| s.step)
    }

    /// Mean of the reported values in the window.
    pub fn window_mean(&self) -> f32 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().map(|s| s.value).sum::<f32>() / self.window.len() as f32
    }

    fn window_std(&self) -> f32 {
        if self.window.len() < 2 {
            return 0.0;
        }
        let mean = self.window_mean();
        let var = self
            .window
            .iter()
            .map(|s| (s.value - mean).powi(2))
            .sum::<f32>()
            / (self.window.len() - 1) as f32;
        var.sqrt()
    }

    pub fn non_finite_count(&self) -> u64 {
        self.non_finite
    }

    pub fn recorded(&self) -> u64 {
        self.steps
    }

    pub fn status(&self) -> HealthStatus {
        let bad = self.window.iter().filter(|s| !s.finite).count();
        if !self.window.is_empty() && bad * 2 > self.window.len() {
            return HealthStatus::Critical(format!(
                "{} of the last {} losses were non-finite",
                bad,
                self.window.len()
            ));
        }
        if let Some(val) = self.latest() {
            let std = self.window_std();
            if std > 1e-8 && ((val - self.window_mean()) / std).abs() > 3.0 {
                return HealthStatus::Degraded(format!(
                    "loss {:.4} is an outlier (window mean {:.4})",
                    val,
                    self.window_mean()
                ));
            }
        }
        HealthStatus::Healthy
    }
}

impl Default for LossTracker {
    fn default() -> Self {
        Self::new(100)
    }
}
