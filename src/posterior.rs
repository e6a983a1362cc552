/*!
The target adapter: priors plus an opaque scoring function.

The physics (or otherwise model-specific) likelihood enters the samplers only
through the [`Scorer`] trait; the engine treats it as a black-box real-valued
function of a parameter vector. [`LogPosterior`] wraps the scorer with the
registered priors and hard range checks and is the single target density both
samplers evaluate.

Cloning a `LogPosterior` is cheap: the prior table and the scorer are shared
read-only behind `Arc`, so each worker gets an independent handle without a
deep copy. The prior table is mutable only while the adapter is still sole
owner, i.e. before the first clone is handed to a worker.
*/

use std::sync::Arc;

use rand::Rng;

use crate::error::{Error, Result};
use crate::prior::{LogPrior, ParameterRange, PriorKind};

/// The opaque scoring function: log-likelihood of a parameter point.
///
/// Implementations must tolerate any in-range point; a non-finite return is
/// recovered by the caller as a zero-acceptance outcome, never as an error.
pub trait Scorer: Send + Sync {
    fn log_likelihood(&self, point: &[f64]) -> f64;
}

impl<F> Scorer for F
where
    F: Fn(&[f64]) -> f64 + Send + Sync,
{
    fn log_likelihood(&self, point: &[f64]) -> f64 {
        self(point)
    }
}

/// Public description of one registered parameter, in registration order.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDescription {
    pub name: String,
    pub range: ParameterRange,
    pub prior: PriorKind,
    pub nuisance: bool,
}

#[derive(Debug, Clone)]
struct PriorEntry {
    name: String,
    prior: LogPrior,
    nuisance: bool,
}

/// Priors and likelihood combined into one log-posterior density.
#[derive(Clone)]
pub struct LogPosterior {
    scorer: Arc<dyn Scorer>,
    priors: Arc<Vec<PriorEntry>>,
}

impl LogPosterior {
    pub fn new(scorer: Arc<dyn Scorer>) -> Self {
        Self {
            scorer,
            priors: Arc::new(Vec::new()),
        }
    }

    /// Registers a prior for a named parameter. Returns `false` without any
    /// mutation if the name already carries a prior, or if the prior table is
    /// already shared with workers.
    pub fn add(&mut self, name: &str, prior: LogPrior, nuisance: bool) -> bool {
        let entries = match Arc::get_mut(&mut self.priors) {
            Some(entries) => entries,
            None => return false,
        };
        if entries.iter().any(|e| e.name == name) {
            return false;
        }
        entries.push(PriorEntry {
            name: name.to_string(),
            prior,
            nuisance,
        });
        true
    }

    /// Number of registered parameters (scan + nuisance).
    pub fn dimension(&self) -> usize {
        self.priors.len()
    }

    /// Descriptions in registration order; that order fixes the layout of
    /// every parameter point.
    pub fn parameter_descriptions(&self) -> Vec<ParameterDescription> {
        self.priors
            .iter()
            .map(|e| ParameterDescription {
                name: e.name.clone(),
                range: e.prior.range(),
                prior: e.prior.kind(),
                nuisance: e.nuisance,
            })
            .collect()
    }

    /// Indices of nuisance parameters, used when grouping decisions exclude
    /// nuisance dimensions.
    pub fn nuisance_indices(&self) -> Vec<usize> {
        self.priors
            .iter()
            .enumerate()
            .filter(|(_, e)| e.nuisance)
            .map(|(i, _)| i)
            .collect()
    }

    /// Log-posterior at `point`: sum of prior log-densities and the score.
    ///
    /// Never fails: any coordinate outside its hard range, a dimension
    /// mismatch, or a non-finite score all yield negative infinity.
    pub fn evaluate(&self, point: &[f64]) -> f64 {
        if point.len() != self.priors.len() {
            return f64::NEG_INFINITY;
        }
        let mut log_prior = 0.0;
        for (entry, &x) in self.priors.iter().zip(point) {
            if !entry.prior.range().contains(x) {
                return f64::NEG_INFINITY;
            }
            log_prior += entry.prior.log_density(x);
        }
        let log_likelihood = self.scorer.log_likelihood(point);
        let log_posterior = log_prior + log_likelihood;
        if log_posterior.is_finite() {
            log_posterior
        } else {
            f64::NEG_INFINITY
        }
    }

    /// Samples a starting point from the priors, one coordinate per
    /// registered parameter.
    pub fn sample_initial_point<R: Rng>(&self, rng: &mut R) -> Result<Vec<f64>> {
        if self.priors.is_empty() {
            return Err(Error::Configuration(
                "no parameters registered, cannot sample a starting point".to_string(),
            ));
        }
        Ok(self.priors.iter().map(|e| e.prior.sample(rng)).collect())
    }
}
