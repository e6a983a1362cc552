//! Convergence diagnostics and moment helpers shared by both samplers.

use nalgebra::{DMatrix, DVector};
use ndarray::prelude::*;
use ndarray_stats::QuantileExt;

/// Streaming per-parameter mean and mean-of-squares for one chain.
///
/// Chains feed every visited point into this between block boundaries; the
/// sampler aggregates the per-chain moments into R-values without keeping the
/// full history around.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningMoments {
    n: u64,
    mean: Array1<f64>,
    mean_sq: Array1<f64>,
}

impl RunningMoments {
    pub fn new(n_params: usize) -> Self {
        Self {
            n: 0,
            mean: Array1::zeros(n_params),
            mean_sq: Array1::zeros(n_params),
        }
    }

    pub fn step(&mut self, x: &[f64]) {
        self.n += 1;
        let n = self.n as f64;
        let x_arr = ArrayView1::from(x);
        self.mean = (&self.mean * (n - 1.0) + &x_arr) / n;
        if self.n == 1 {
            self.mean_sq = x_arr.mapv(|v| v * v);
        } else {
            self.mean_sq = (&self.mean_sq * (n - 1.0) + &x_arr.mapv(|v| v * v)) / n;
        }
    }

    pub fn count(&self) -> u64 {
        self.n
    }

    pub fn mean(&self) -> Array1<f64> {
        self.mean.clone()
    }

    /// Unbiased per-parameter sample variance.
    pub fn variance(&self) -> Array1<f64> {
        let n = self.n as f64;
        (&self.mean_sq - &self.mean.mapv(|m| m * m)) * (n / (n - 1.0))
    }

    pub fn reset(&mut self) {
        self.n = 0;
        self.mean.fill(0.0);
        self.mean_sq.fill(0.0);
    }
}

/// Gelman-Rubin potential scale reduction per parameter.
///
/// `means` and `variances` are chains x params; `n` is the per-chain sample
/// count. The relaxed variant is the textbook ratio
/// `sqrt((((n-1)/n) W + B/n) / W)`; the strict variant additionally charges
/// the numerator with the sampling variability of the chain means, `B/(m n)`.
pub fn potential_scale_reduction(
    means: &Array2<f64>,
    variances: &Array2<f64>,
    n: f64,
    strict: bool,
) -> Array1<f64> {
    let m = means.nrows() as f64;
    let within = variances
        .mean_axis(Axis(0))
        .expect("at least one chain required");
    let grand = means
        .mean_axis(Axis(0))
        .expect("at least one chain required");
    let between = (means - &grand.broadcast(means.raw_dim()).unwrap())
        .mapv(|d| d * d)
        .sum_axis(Axis(0))
        * (n / (m - 1.0));

    let mut var_estimate = &within * ((n - 1.0) / n) + &between / n;
    if strict {
        var_estimate = var_estimate + &between / (m * n);
    }
    // Chains that have not moved yet have zero within-chain variance; report
    // R = 1 there instead of a 0/0.
    ndarray::Zip::from(&var_estimate)
        .and(&within)
        .map_collect(|&v, &w| if w > 0.0 { (v / w).sqrt() } else { 1.0 })
}

pub fn max_scale_reduction(r_values: &Array1<f64>) -> f64 {
    *r_values.max().expect("non-empty R-values")
}

/// Effective sample size `1 / sum(w^2)` of normalized importance weights.
pub fn effective_sample_size(weights: &[f64]) -> f64 {
    let sum_sq: f64 = weights.iter().map(|w| w * w).sum();
    if sum_sq > 0.0 {
        1.0 / sum_sq
    } else {
        0.0
    }
}

/// Normalized perplexity `exp(-sum(w ln w)) / N` of importance weights.
///
/// This is the dispersion statistic whose relative standard deviation the PMC
/// sampler monitors for stabilization: 1 for uniform weights, 1/N when a
/// single draw carries all the weight.
pub fn perplexity(weights: &[f64]) -> f64 {
    if weights.is_empty() {
        return 0.0;
    }
    let entropy: f64 = weights
        .iter()
        .filter(|w| **w > 0.0)
        .map(|w| -w * w.ln())
        .sum();
    entropy.exp() / weights.len() as f64
}

/// Mean vector and unbiased covariance matrix of a set of points.
pub fn sample_moments(points: &[Vec<f64>]) -> (DVector<f64>, DMatrix<f64>) {
    let n = points.len();
    let dim = points[0].len();
    let mut mean = DVector::zeros(dim);
    for point in points {
        mean += DVector::from_column_slice(point);
    }
    mean /= n as f64;

    let mut cov = DMatrix::zeros(dim, dim);
    for point in points {
        let diff = DVector::from_column_slice(point) - &mean;
        cov += &diff * diff.transpose();
    }
    cov /= (n - 1).max(1) as f64;
    (mean, cov)
}

/// Moments of a set of points under normalized weights.
pub fn weighted_moments(points: &[Vec<f64>], weights: &[f64]) -> (DVector<f64>, DMatrix<f64>) {
    let dim = points[0].len();
    let mut mean = DVector::zeros(dim);
    for (point, &w) in points.iter().zip(weights) {
        mean += DVector::from_column_slice(point) * w;
    }
    let mut cov = DMatrix::zeros(dim, dim);
    for (point, &w) in points.iter().zip(weights) {
        let diff = DVector::from_column_slice(point) - &mean;
        cov += &diff * diff.transpose() * w;
    }
    (mean, cov)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn running_moments_match_direct_computation() {
        let data = [[1.0, 4.0], [2.0, 2.0], [3.0, 0.0], [6.0, 2.0]];
        let mut moments = RunningMoments::new(2);
        for x in &data {
            moments.step(x);
        }
        assert_eq!(moments.count(), 4);
        assert_abs_diff_eq!(moments.mean()[0], 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(moments.mean()[1], 2.0, epsilon = 1e-12);
        // Unbiased variances: var([1,2,3,6]) = 14/3, var([4,2,0,2]) = 8/3.
        assert_abs_diff_eq!(moments.variance()[0], 14.0 / 3.0, epsilon = 1e-9);
        assert_abs_diff_eq!(moments.variance()[1], 8.0 / 3.0, epsilon = 1e-9);
    }

    #[test]
    fn identical_chains_give_r_near_one() {
        let means = arr2(&[[0.5, -1.0], [0.5, -1.0], [0.5, -1.0]]);
        let vars = arr2(&[[1.0, 2.0], [1.0, 2.0], [1.0, 2.0]]);
        for strict in [false, true] {
            let r = potential_scale_reduction(&means, &vars, 1000.0, strict);
            for &value in r.iter() {
                assert_abs_diff_eq!(value, 1.0, epsilon = 0.01);
            }
        }
    }

    #[test]
    fn disjoint_chain_raises_r() {
        let means = arr2(&[[0.0], [0.0], [5.0]]);
        let vars = arr2(&[[1.0], [1.0], [1.0]]);
        let r = potential_scale_reduction(&means, &vars, 500.0, false);
        assert!(
            r[0] > 2.0,
            "expected large R for disjoint chains, got {}",
            r[0]
        );
    }

    #[test]
    fn strict_r_dominates_relaxed_r() {
        let means = arr2(&[[0.0], [0.3], [0.7]]);
        let vars = arr2(&[[1.0], [1.2], [0.9]]);
        let relaxed = potential_scale_reduction(&means, &vars, 200.0, false);
        let strict = potential_scale_reduction(&means, &vars, 200.0, true);
        assert!(strict[0] > relaxed[0]);
    }

    #[test]
    fn ess_and_perplexity_bounds() {
        let uniform = vec![0.25; 4];
        assert_abs_diff_eq!(effective_sample_size(&uniform), 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(perplexity(&uniform), 1.0, epsilon = 1e-12);

        let degenerate = vec![1.0, 0.0, 0.0, 0.0];
        assert_abs_diff_eq!(effective_sample_size(&degenerate), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(perplexity(&degenerate), 0.25, epsilon = 1e-12);
    }

    #[test]
    fn weighted_moments_recover_shifted_mean() {
        let points = vec![vec![0.0], vec![2.0]];
        let weights = vec![0.25, 0.75];
        let (mean, cov) = weighted_moments(&points, &weights);
        assert_abs_diff_eq!(mean[0], 1.5, epsilon = 1e-12);
        // E[(x - 1.5)^2] = 0.25 * 2.25 + 0.75 * 0.25 = 0.75
        assert_abs_diff_eq!(cov[(0, 0)], 0.75, epsilon = 1e-12);
    }
}
