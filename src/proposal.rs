/*!
Random-walk proposal densities for the Metropolis-Hastings chains.

A proposal is centered on the current point and draws from a multivariate
Gaussian or multivariate Student-t with a per-chain covariance matrix. The
covariance is retuned between pre-run blocks from the chain's recent history;
[`RandomWalkProposal::set_covariance`] therefore has to survive numerically
indefinite inputs without aborting the chain.

The zero-mean elliptical sampling and density helpers live here and are shared
with the PMC mixture components, which use the same Gaussian/Student-t family
around their own means.
*/

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use rand::Rng;
use rand_distr::{ChiSquared, Distribution, StandardNormal};
use statrs::function::gamma::ln_gamma;

use crate::error::{Error, Result};

/// Proposal family selected in the sampler configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProposalFamily {
    /// Symmetric Gaussian random walk.
    Gaussian,
    /// Multivariate Student-t random walk; heavier tails help escape
    /// mis-tuned covariances early in the pre-run.
    StudentT { degrees_of_freedom: f64 },
}

impl ProposalFamily {
    pub(crate) fn validate(&self) -> Result<()> {
        if let ProposalFamily::StudentT { degrees_of_freedom } = self {
            if !(*degrees_of_freedom > 0.0) {
                return Err(Error::Configuration(format!(
                    "student-t proposal needs positive degrees of freedom, got {degrees_of_freedom}"
                )));
            }
        }
        Ok(())
    }

    fn degrees_of_freedom(&self) -> Option<f64> {
        match self {
            ProposalFamily::Gaussian => None,
            ProposalFamily::StudentT { degrees_of_freedom } => Some(*degrees_of_freedom),
        }
    }
}

/// Cholesky-factorizes a covariance estimate, retrying with diagonal jitter
/// growing from a tiny fraction of the mean diagonal element.
pub(crate) fn factorize(covariance: &DMatrix<f64>) -> Option<Cholesky<f64, Dyn>> {
    if let Some(factor) = Cholesky::new(covariance.clone()) {
        return Some(factor);
    }
    let dim = covariance.nrows();
    let mean_diag = covariance.diagonal().iter().map(|d| d.abs()).sum::<f64>() / dim as f64;
    let mut jitter = 1e-10 * mean_diag.max(1e-300);
    for _ in 0..8 {
        let patched = covariance + DMatrix::identity(dim, dim) * jitter;
        if let Some(factor) = Cholesky::new(patched) {
            return Some(factor);
        }
        jitter *= 10.0;
    }
    None
}

/// Zero-mean draw from the elliptical family defined by a Cholesky factor and
/// optional Student-t degrees of freedom (`None` for the Gaussian limit).
pub(crate) fn elliptical_step<R: Rng>(
    factor: &Cholesky<f64, Dyn>,
    degrees_of_freedom: Option<f64>,
    rng: &mut R,
) -> DVector<f64> {
    let dim = factor.l_dirty().nrows();
    let z = DVector::from_iterator(dim, (0..dim).map(|_| rng.sample(StandardNormal)));
    let mut step = factor.l() * z;
    if let Some(dof) = degrees_of_freedom {
        let chi2 = ChiSquared::new(dof)
            .expect("validated degrees of freedom")
            .sample(rng);
        step *= (dof / chi2).sqrt();
    }
    step
}

/// Log density of the same elliptical family at displacement `diff`.
pub(crate) fn elliptical_log_density(
    factor: &Cholesky<f64, Dyn>,
    degrees_of_freedom: Option<f64>,
    diff: &DVector<f64>,
) -> f64 {
    let dim = diff.len() as f64;
    let mahalanobis = diff.dot(&factor.solve(diff));
    let log_det = 2.0 * factor.l_dirty().diagonal().iter().map(|d| d.ln()).sum::<f64>();
    match degrees_of_freedom {
        None => -0.5 * (dim * (2.0 * std::f64::consts::PI).ln() + log_det + mahalanobis),
        Some(dof) => {
            ln_gamma(0.5 * (dof + dim)) - ln_gamma(0.5 * dof)
                - 0.5 * dim * (dof * std::f64::consts::PI).ln()
                - 0.5 * log_det
                - 0.5 * (dof + dim) * (mahalanobis / dof).ln_1p()
        }
    }
}

/// Random-walk proposal with an adaptive covariance matrix.
#[derive(Clone)]
pub struct RandomWalkProposal {
    covariance: DMatrix<f64>,
    factor: Cholesky<f64, Dyn>,
    degrees_of_freedom: Option<f64>,
}

impl RandomWalkProposal {
    /// Builds a proposal from an initial covariance.
    pub fn new(family: ProposalFamily, covariance: DMatrix<f64>) -> Result<Self> {
        family.validate()?;
        let factor = factorize(&covariance).ok_or_else(|| {
            Error::Configuration("initial proposal covariance is not positive definite".to_string())
        })?;
        Ok(Self {
            covariance,
            factor,
            degrees_of_freedom: family.degrees_of_freedom(),
        })
    }

    pub fn dimension(&self) -> usize {
        self.covariance.nrows()
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    /// Replaces the covariance. An estimate that stays indefinite even after
    /// jitter is discarded and the previous factor kept, so adaptation never
    /// kills a chain.
    pub fn set_covariance(&mut self, covariance: DMatrix<f64>) {
        if let Some(factor) = factorize(&covariance) {
            self.covariance = covariance;
            self.factor = factor;
        }
    }

    /// Draws a candidate centered on `current`.
    pub fn sample<R: Rng>(&self, rng: &mut R, current: &[f64]) -> Vec<f64> {
        let step = elliptical_step(&self.factor, self.degrees_of_freedom, rng);
        current.iter().zip(step.iter()).map(|(x, s)| x + s).collect()
    }

    /// Log proposal density q(to | from).
    pub fn log_density(&self, from: &[f64], to: &[f64]) -> f64 {
        let diff = DVector::from_iterator(to.len(), to.iter().zip(from).map(|(t, f)| t - f));
        elliptical_log_density(&self.factor, self.degrees_of_freedom, &diff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn gaussian_log_density_matches_univariate_formula() {
        let proposal = RandomWalkProposal::new(
            ProposalFamily::Gaussian,
            DMatrix::from_diagonal_element(1, 1, 4.0),
        )
        .unwrap();
        let expected =
            |d: f64| -0.5 * (2.0 * std::f64::consts::PI * 4.0).ln() - 0.5 * d * d / 4.0;
        assert_abs_diff_eq!(
            proposal.log_density(&[0.0], &[1.0]),
            expected(1.0),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            proposal.log_density(&[2.0], &[-1.0]),
            expected(3.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn log_density_is_symmetric() {
        let cov = DMatrix::from_row_slice(2, 2, &[2.0, 0.5, 0.5, 1.0]);
        for family in [
            ProposalFamily::Gaussian,
            ProposalFamily::StudentT {
                degrees_of_freedom: 3.0,
            },
        ] {
            let proposal = RandomWalkProposal::new(family, cov.clone()).unwrap();
            let a = [0.3, -1.2];
            let b = [1.1, 0.4];
            assert_abs_diff_eq!(
                proposal.log_density(&a, &b),
                proposal.log_density(&b, &a),
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn non_positive_dof_is_a_configuration_error() {
        let result = RandomWalkProposal::new(
            ProposalFamily::StudentT {
                degrees_of_freedom: 0.0,
            },
            DMatrix::identity(1, 1),
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn indefinite_covariance_keeps_previous_factor() {
        let mut proposal =
            RandomWalkProposal::new(ProposalFamily::Gaussian, DMatrix::identity(2, 2)).unwrap();
        let bad = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        proposal.set_covariance(bad);
        let mut rng = SmallRng::seed_from_u64(1);
        let candidate = proposal.sample(&mut rng, &[0.0, 0.0]);
        assert!(candidate.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn samples_track_the_covariance_scale() {
        let proposal = RandomWalkProposal::new(
            ProposalFamily::Gaussian,
            DMatrix::from_diagonal_element(1, 1, 0.25),
        )
        .unwrap();
        let mut rng = SmallRng::seed_from_u64(42);
        let n = 20_000;
        let mut sum_sq = 0.0;
        for _ in 0..n {
            let step = proposal.sample(&mut rng, &[0.0])[0];
            sum_sq += step * step;
        }
        // Empirical variance close to 0.25.
        assert_abs_diff_eq!(sum_sq / n as f64, 0.25, epsilon = 0.02);
    }
}
