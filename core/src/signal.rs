//! Signal utilities shared by the motion and measurement models.
//!
//! This module contains the small numerical building blocks the filter stages are assembled from:
//! a bounded rolling window used for every per-cycle history, sample statistics, exponential
//! smoothing, three-point derivative kernels, and the dynamic time warping (DTW) distance used by
//! the sliding-window measurement models.
use std::collections::VecDeque;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Bounded first-in-first-out window of recent samples.
///
/// Pushing onto a full window evicts the oldest sample, so the window never holds more than
/// `capacity` entries regardless of how the caller uses it.
#[derive(Clone, Debug, PartialEq)]
pub struct RollingWindow {
    values: VecDeque<f64>,
    capacity: usize,
}
impl RollingWindow {
    /// Create an empty window holding at most `capacity` samples (a capacity of zero is raised to one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        RollingWindow {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }
    /// Append a sample, evicting the oldest one if the window is full.
    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }
    /// Append several samples in order, keeping only the most recent `capacity` entries.
    pub fn extend<I: IntoIterator<Item = f64>>(&mut self, values: I) {
        for value in values {
            self.push(value);
        }
    }
    pub fn clear(&mut self) {
        self.values.clear();
    }
    pub fn len(&self) -> usize {
        self.values.len()
    }
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
    pub fn capacity(&self) -> usize {
        self.capacity
    }
    /// Most recently pushed sample, if any.
    pub fn last(&self) -> Option<f64> {
        self.values.back().copied()
    }
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().copied()
    }
    /// Copy the window contents, oldest first.
    pub fn to_vec(&self) -> Vec<f64> {
        self.values.iter().copied().collect()
    }
}

/// Arithmetic mean of a series, `None` for an empty series.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation (one degree of freedom removed). Undefined below two samples.
pub fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let mu = mean(values)?;
    let variance =
        values.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / (values.len() as f64 - 1.0);
    Some(variance.sqrt())
}

/// Standard error of the mean, `s / sqrt(n)`. Undefined below two samples.
pub fn standard_error(values: &[f64]) -> Option<f64> {
    sample_std(values).map(|s| s / (values.len() as f64).sqrt())
}

/// Exponentially smooth a series: `s_0 = x_0`, `s_i = a * x_i + (1 - a) * s_{i-1}`.
pub fn exponential_smoothing(values: &[f64], smoothing_factor: f64) -> Vec<f64> {
    let mut smoothed = Vec::with_capacity(values.len());
    let mut previous: Option<f64> = None;
    for &value in values {
        let next = match previous {
            None => value,
            Some(s) => smoothing_factor * value + (1.0 - smoothing_factor) * s,
        };
        smoothed.push(next);
        previous = Some(next);
    }
    smoothed
}

/// Fixed three-point finite-difference kernels used to turn a window into a rate-of-change series.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DerivativeKernel {
    /// Trailing kernel `[0.25, 0.5, -0.75]`.
    #[default]
    Trailing,
    /// Symmetric central difference `[-0.5, 0.0, 0.5]`.
    Central,
}
impl DerivativeKernel {
    pub fn coefficients(&self) -> [f64; 3] {
        match self {
            DerivativeKernel::Trailing => [0.25, 0.5, -0.75],
            DerivativeKernel::Central => [-0.5, 0.0, 0.5],
        }
    }
    /// Apply the kernel over every full three-sample stencil ("valid" correlation).
    ///
    /// The output is two samples shorter than the input and empty for inputs shorter than three;
    /// output sample `i` is aligned with input sample `i + 2`.
    pub fn apply(&self, values: &[f64]) -> Vec<f64> {
        let [k0, k1, k2] = self.coefficients();
        values
            .windows(3)
            .map(|w| k0 * w[0] + k1 * w[1] + k2 * w[2])
            .collect()
    }
}

/// Dynamic time warping distance between two series.
///
/// Uses the squared pointwise difference as the local cost and returns the square root of the
/// accumulated cost along the optimal warping path, so two identical series have distance zero and
/// two single-sample series have distance `|a - b|`. An empty series has nothing to align against
/// and yields zero.
pub fn dtw_distance(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let (n, m) = (a.len(), b.len());
    let mut cost = DMatrix::<f64>::from_element(n + 1, m + 1, f64::INFINITY);
    cost[(0, 0)] = 0.0;
    for i in 1..=n {
        for j in 1..=m {
            let local = (a[i - 1] - b[j - 1]).powi(2);
            let best = cost[(i - 1, j)]
                .min(cost[(i, j - 1)])
                .min(cost[(i - 1, j - 1)]);
            cost[(i, j)] = local + best;
        }
    }
    cost[(n, m)].sqrt()
}
