/*!
A single Metropolis-Hastings Markov chain.

Each chain owns a worker clone of the target adapter, its proposal, a private
`SmallRng` and its acceptance counters; chains share nothing mutable and are
stepped independently between block boundaries. A chain exists only for the
lifetime of its sampler; what survives are the records it wrote.
*/

use nalgebra::DMatrix;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::io::SampleRecord;
use crate::posterior::LogPosterior;
use crate::proposal::RandomWalkProposal;
use crate::stats::{sample_moments, RunningMoments};

/// Scaling of the adapted covariance, the classic `2.38^2 / d` random-walk
/// optimum.
fn adaptive_scale(dimension: usize) -> f64 {
    2.38 * 2.38 / dimension as f64
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptanceCounter {
    pub accepted: u64,
    pub rejected: u64,
}

impl AcceptanceCounter {
    pub fn rate(&self) -> f64 {
        let total = self.accepted + self.rejected;
        if total == 0 {
            0.0
        } else {
            self.accepted as f64 / total as f64
        }
    }
}

pub struct MarkovChain {
    id: u32,
    posterior: LogPosterior,
    proposal: RandomWalkProposal,
    current: Vec<f64>,
    current_log_posterior: f64,
    rng: SmallRng,
    iteration: u64,
    counter: AcceptanceCounter,
    /// Points visited since the last proposal adaptation.
    adaptation_history: Vec<Vec<f64>>,
    /// Streaming moments over the whole pre-run, input to the R-values.
    moments: RunningMoments,
}

impl MarkovChain {
    pub fn new(
        id: u32,
        posterior: LogPosterior,
        proposal: RandomWalkProposal,
        start: Vec<f64>,
        seed: u64,
    ) -> Self {
        let current_log_posterior = posterior.evaluate(&start);
        let dimension = start.len();
        Self {
            id,
            posterior,
            proposal,
            current: start,
            current_log_posterior,
            rng: SmallRng::seed_from_u64(seed),
            iteration: 0,
            counter: AcceptanceCounter::default(),
            adaptation_history: Vec::new(),
            moments: RunningMoments::new(dimension),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn current_point(&self) -> &[f64] {
        &self.current
    }

    pub fn acceptance(&self) -> AcceptanceCounter {
        self.counter
    }

    pub fn moments(&self) -> &RunningMoments {
        &self.moments
    }

    /// One Metropolis-Hastings step. A rejected proposal re-emits the
    /// previous point; a non-finite posterior at the candidate is a plain
    /// rejection, never an error.
    pub fn step(&mut self) -> SampleRecord {
        let candidate = self.proposal.sample(&mut self.rng, &self.current);
        let candidate_log_posterior = self.posterior.evaluate(&candidate);

        if candidate_log_posterior.is_finite() {
            let log_forward = self.proposal.log_density(&self.current, &candidate);
            let log_backward = self.proposal.log_density(&candidate, &self.current);
            let log_accept_ratio = (candidate_log_posterior + log_backward)
                - (self.current_log_posterior + log_forward);
            let u: f64 = self.rng.gen();
            if log_accept_ratio > u.ln() {
                self.current = candidate;
                self.current_log_posterior = candidate_log_posterior;
                self.counter.accepted += 1;
            } else {
                self.counter.rejected += 1;
            }
        } else {
            self.counter.rejected += 1;
        }

        self.iteration += 1;
        self.adaptation_history.push(self.current.clone());
        self.moments.step(&self.current);

        SampleRecord {
            chain: self.id,
            iteration: self.iteration,
            point: self.current.clone(),
            log_posterior: self.current_log_posterior,
            weight: 1.0,
        }
    }

    /// Runs one block of steps, returning the visited records in order.
    pub fn run_block(&mut self, steps: usize) -> Vec<SampleRecord> {
        (0..steps).map(|_| self.step()).collect()
    }

    /// Recomputes the proposal covariance from the history gathered since the
    /// last adaptation, scaled by `2.38^2 / d` over the configured reduction
    /// factor, then clears that history.
    pub fn adapt_proposal(&mut self, scale_reduction: f64) {
        if self.adaptation_history.len() < 2 {
            return;
        }
        let (_, cov) = sample_moments(&self.adaptation_history);
        let scale = adaptive_scale(self.current.len()) / scale_reduction;
        let scaled: DMatrix<f64> = cov * scale;
        self.proposal.set_covariance(scaled);
        self.adaptation_history.clear();
    }

    /// Hands out the history gathered since the last adaptation without
    /// clearing it; used when seeding the PMC mixture from pre-run output.
    pub fn recent_history(&self) -> &[Vec<f64>] {
        &self.adaptation_history
    }
}
