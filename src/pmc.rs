/*!
# Population Monte Carlo

Adaptive importance sampling on top of the mixture proposal. Each update step
draws a population from the current mixture, computes normalized importance
weights against the target adapter, checks convergence, and refits the
mixture with one Rao-Blackwellized E-step. Once the proposal is frozen, a
final weighted population is drawn and persisted together with the component
stream.

The mixture is usually seeded from MCMC pre-run output via
[`PopulationMonteCarloSampler::from_prerun`]: chain histories are grouped by
R-value proximity (or taken as one pool), each group contributes one
component, and the mixture is resized to the requested component count.
*/

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::io::{read_records, write_components, SampleRecord, SampleStore};
use crate::mixture::{group_chains, ChainHistory, MixtureModel};
use crate::posterior::LogPosterior;
use crate::stats::{effective_sample_size, perplexity, weighted_moments};

/// Complete, immutable configuration of one PMC run.
#[derive(Debug, Clone)]
pub struct PmcConfig {
    /// Component count the seeded mixture is resized to.
    pub target_ncomponents: usize,
    /// Cap on the per-chain history length used for seeding; only the last
    /// `patch_length` retained samples of each chain enter the moments.
    pub patch_length: usize,
    /// Fraction of each chain history dropped from the front before seeding.
    pub skip_initial: f64,
    /// Student-t degrees of freedom of the seeded components; `<= 0` selects
    /// the Gaussian limit.
    pub degrees_of_freedom: f64,
    /// Chain groups excluded from seeding, by group index.
    pub ignore_groups: Vec<usize>,
    /// Group chains by R-value proximity; `false` pools all chains into one
    /// group.
    pub group_by_r_value: Option<f64>,
    /// Exclude nuisance dimensions from the grouping decision.
    pub r_value_no_nuisance: bool,
    pub use_strict_rvalue_definition: bool,
    /// Size of the final frozen-mixture population.
    pub final_samples: usize,
    /// Draws per live component in each update step.
    pub samples_per_component: usize,
    /// Rescale the population to the live component count after deaths.
    pub adjust_sample_size: bool,
    /// Clamp this many of the largest raw weights to the next-largest value.
    pub crop_highest_weights: usize,
    /// Relative effective-sample-size bound for the convergence check.
    pub minimum_eff_sample_size: f64,
    pub ignore_eff_sample_size: bool,
    /// Update steps entering the perplexity stabilization window.
    pub minimum_steps: usize,
    /// Perplexity relative standard deviation below which the window counts
    /// as stabilized.
    pub maximum_relative_std_deviation: f64,
    /// Update steps after which the run ends as exhausted.
    pub max_updates: usize,
    pub seed: Option<u64>,
    pub parallelize: bool,
    pub output_directory: PathBuf,
}

impl Default for PmcConfig {
    fn default() -> Self {
        Self {
            target_ncomponents: 4,
            patch_length: 1000,
            skip_initial: 0.2,
            degrees_of_freedom: 5.0,
            ignore_groups: Vec::new(),
            group_by_r_value: Some(1.5),
            r_value_no_nuisance: false,
            use_strict_rvalue_definition: true,
            final_samples: 10_000,
            samples_per_component: 1000,
            adjust_sample_size: false,
            crop_highest_weights: 0,
            minimum_eff_sample_size: 0.9,
            ignore_eff_sample_size: false,
            minimum_steps: 3,
            maximum_relative_std_deviation: 0.05,
            max_updates: 20,
            seed: None,
            parallelize: false,
            output_directory: PathBuf::from("pmc_output"),
        }
    }
}

impl PmcConfig {
    fn validate(&self) -> Result<()> {
        if self.target_ncomponents == 0 {
            return Err(Error::Configuration(
                "target_ncomponents must be positive".to_string(),
            ));
        }
        if self.samples_per_component == 0 || self.final_samples == 0 {
            return Err(Error::Configuration(
                "samples_per_component and final_samples must be positive".to_string(),
            ));
        }
        if self.patch_length == 0 {
            return Err(Error::Configuration(
                "patch_length must be positive".to_string(),
            ));
        }
        if self.max_updates == 0 {
            return Err(Error::Configuration(
                "max_updates must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.skip_initial) {
            return Err(Error::Configuration(
                "skip_initial must lie in [0, 1)".to_string(),
            ));
        }
        if !self.ignore_eff_sample_size
            && !(0.0 < self.minimum_eff_sample_size && self.minimum_eff_sample_size <= 1.0)
        {
            return Err(Error::Configuration(
                "minimum_eff_sample_size must lie in (0, 1]".to_string(),
            ));
        }
        if self.minimum_steps < 2 {
            return Err(Error::Configuration(
                "minimum_steps must be at least 2".to_string(),
            ));
        }
        if !(self.maximum_relative_std_deviation > 0.0) {
            return Err(Error::Configuration(
                "maximum_relative_std_deviation must be positive".to_string(),
            ));
        }
        if let Some(threshold) = self.group_by_r_value {
            if !(threshold >= 1.0) {
                return Err(Error::Configuration(
                    "group_by_r_value threshold must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Lifecycle of one PMC run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmcState {
    Uninitialized,
    Sampling,
    Updating,
    Converged,
    /// `max_updates` reached without the proposal stabilizing.
    Exhausted,
}

/// Rolling outcome of a run; statistical warnings land here.
#[derive(Debug, Clone)]
pub struct PmcStatus {
    pub state: PmcState,
    pub updates: usize,
    /// Relative effective sample size of the last population.
    pub eff_sample_size: f64,
    /// Normalized perplexity of the last population.
    pub perplexity: f64,
    /// Chain grouping used for seeding, when seeded from a pre-run.
    pub groups: Vec<Vec<usize>>,
    pub warnings: Vec<String>,
    converged_override: bool,
}

impl Default for PmcStatus {
    fn default() -> Self {
        Self {
            state: PmcState::Uninitialized,
            updates: 0,
            eff_sample_size: 0.0,
            perplexity: 0.0,
            groups: Vec::new(),
            warnings: Vec::new(),
            converged_override: false,
        }
    }
}

impl PmcStatus {
    pub fn converged(&self) -> bool {
        self.state == PmcState::Converged
    }

    /// Manual override: while set, the next convergence check passes
    /// unconditionally; `false` clears a previously set override.
    pub fn set_converged(&mut self, converged: bool) {
        self.converged_override = converged;
    }
}

pub struct PopulationMonteCarloSampler {
    config: PmcConfig,
    posterior: LogPosterior,
    mixture: MixtureModel,
    rng: SmallRng,
    seed: u64,
    status: PmcStatus,
    perplexity_history: Vec<f64>,
    final_records: Vec<SampleRecord>,
}

impl PopulationMonteCarloSampler {
    /// Starts from an explicitly constructed mixture.
    pub fn new(posterior: LogPosterior, mixture: MixtureModel, config: PmcConfig) -> Result<Self> {
        config.validate()?;
        if mixture.dimension() != posterior.dimension() {
            return Err(Error::Configuration(format!(
                "mixture has {} dimensions but {} parameters are registered",
                mixture.dimension(),
                posterior.dimension()
            )));
        }
        let seed = config.seed.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        });
        Ok(Self {
            config,
            posterior,
            mixture,
            rng: SmallRng::seed_from_u64(seed),
            seed,
            status: PmcStatus::default(),
            perplexity_history: Vec::new(),
            final_records: Vec::new(),
        })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Seeds the mixture from MCMC chain histories. The front `skip_initial`
    /// fraction of every history is dropped, the remainder capped at
    /// `patch_length` samples per chain, then chains are grouped and each
    /// surviving group contributes one component.
    pub fn from_prerun(
        posterior: LogPosterior,
        chains: &[ChainHistory],
        config: PmcConfig,
    ) -> Result<Self> {
        config.validate()?;
        if chains.is_empty() || chains.iter().any(|c| c.samples.is_empty()) {
            return Err(Error::Configuration(
                "cannot seed the mixture from empty chain histories".to_string(),
            ));
        }

        let trimmed: Vec<ChainHistory> = chains
            .iter()
            .map(|chain| {
                let skip = (chain.samples.len() as f64 * config.skip_initial) as usize;
                let kept = &chain.samples[skip.min(chain.samples.len())..];
                let start = kept.len().saturating_sub(config.patch_length);
                ChainHistory {
                    id: chain.id,
                    samples: kept[start..].to_vec(),
                }
            })
            .collect();

        let skip_dims = if config.r_value_no_nuisance {
            posterior.nuisance_indices()
        } else {
            Vec::new()
        };
        let groups = match config.group_by_r_value {
            Some(threshold) => group_chains(
                &trimmed,
                threshold,
                &skip_dims,
                config.use_strict_rvalue_definition,
            ),
            None => vec![(0..trimmed.len()).collect()],
        };

        let mixture = MixtureModel::from_chain_groups(
            &trimmed,
            &groups,
            &config.ignore_groups,
            config.degrees_of_freedom,
            config.target_ncomponents,
        )?;

        let mut sampler = Self::new(posterior, mixture, config)?;
        sampler.status.groups = groups;
        Ok(sampler)
    }

    pub fn mixture(&self) -> &MixtureModel {
        &self.mixture
    }

    pub fn status(&self) -> &PmcStatus {
        &self.status
    }

    pub fn status_mut(&mut self) -> &mut PmcStatus {
        &mut self.status
    }

    /// Final frozen-mixture population, available after [`run`](Self::run).
    pub fn final_records(&self) -> &[SampleRecord] {
        &self.final_records
    }

    fn population_size(&self) -> usize {
        let components = if self.config.adjust_sample_size {
            self.mixture.live_components().len()
        } else {
            self.mixture.components().len()
        };
        self.config.samples_per_component * components.max(1)
    }

    /// Draws one population from the current mixture. Draws are sequential
    /// on the sampler RNG so a fixed seed reproduces the run; only the
    /// posterior evaluations fan out to worker threads.
    pub fn draw_samples(&mut self, count: usize) -> Vec<(Vec<f64>, f64)> {
        // Converged and Exhausted are terminal; the final frozen-mixture
        // population must not reset them.
        if !matches!(
            self.status.state,
            PmcState::Converged | PmcState::Exhausted
        ) {
            self.status.state = PmcState::Sampling;
        }
        let points: Vec<Vec<f64>> = {
            let weights: Vec<f64> = self.mixture.components().iter().map(|c| c.weight).collect();
            (0..count)
                .map(|_| {
                    let index = pick_component(&weights, &mut self.rng);
                    self.mixture.components()[index].sample(&mut self.rng)
                })
                .collect()
        };
        let posterior = &self.posterior;
        if self.config.parallelize {
            points
                .into_par_iter()
                .map(|p| {
                    let lp = posterior.evaluate(&p);
                    (p, lp)
                })
                .collect()
        } else {
            points
                .into_iter()
                .map(|p| {
                    let lp = posterior.evaluate(&p);
                    (p, lp)
                })
                .collect()
        }
    }

    /// Normalized importance weights of a population against the current
    /// mixture. Weights are formed in log space around the maximum; the
    /// `crop_highest_weights` largest raw weights are clamped to the next
    /// largest value before normalization.
    pub fn calculate_weights(&self, samples: &[(Vec<f64>, f64)]) -> Vec<f64> {
        let log_weights: Vec<f64> = if self.config.parallelize {
            samples
                .par_iter()
                .map(|(point, lp)| lp - self.mixture.log_density(point))
                .collect()
        } else {
            samples
                .iter()
                .map(|(point, lp)| lp - self.mixture.log_density(point))
                .collect()
        };

        let max = log_weights
            .iter()
            .cloned()
            .fold(f64::NEG_INFINITY, f64::max);
        if !max.is_finite() {
            return vec![0.0; samples.len()];
        }
        let mut weights: Vec<f64> = log_weights.iter().map(|lw| (lw - max).exp()).collect();

        let crop = self.config.crop_highest_weights;
        if crop > 0 && crop < weights.len() {
            let mut sorted = weights.clone();
            sorted.sort_by(|a, b| b.total_cmp(a));
            let ceiling = sorted[crop];
            for w in &mut weights {
                if *w > ceiling {
                    *w = ceiling;
                }
            }
        }

        let total: f64 = weights.iter().sum();
        if total > 0.0 {
            for w in &mut weights {
                *w /= total;
            }
        }
        weights
    }

    /// Reweights records `[min, max)` of a persisted stream against the
    /// current mixture, using the stored log-posterior values.
    pub fn calculate_weights_from_store(
        &self,
        path: impl AsRef<Path>,
        min: usize,
        max: Option<usize>,
    ) -> Result<(Vec<SampleRecord>, Vec<f64>)> {
        let records = read_records(path, min, max)?;
        let samples: Vec<(Vec<f64>, f64)> = records
            .iter()
            .map(|r| (r.point.clone(), r.log_posterior))
            .collect();
        let weights = self.calculate_weights(&samples);
        Ok((records, weights))
    }

    /// One Rao-Blackwellized mixture update from a weighted population.
    /// Components whose responsibility mass collapses are set to zero weight
    /// and take no further part in the run.
    pub fn update(&mut self, samples: &[(Vec<f64>, f64)], weights: &[f64]) -> Result<()> {
        self.status.state = PmcState::Updating;
        let n_components = self.mixture.components().len();
        let dim = self.mixture.dimension();

        // Responsibilities rho[i][c] = w_c q_c(x_i) / q(x_i).
        let responsibilities: Vec<Vec<f64>> = samples
            .iter()
            .map(|(point, _)| {
                let terms: Vec<f64> = self
                    .mixture
                    .components()
                    .iter()
                    .map(|c| {
                        if c.weight > 0.0 {
                            c.weight.ln() + c.log_density(point)
                        } else {
                            f64::NEG_INFINITY
                        }
                    })
                    .collect();
                let max = terms.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                if !max.is_finite() {
                    return vec![0.0; n_components];
                }
                let unnormalized: Vec<f64> = terms.iter().map(|t| (t - max).exp()).collect();
                let total: f64 = unnormalized.iter().sum();
                unnormalized.iter().map(|u| u / total).collect()
            })
            .collect();

        let masses: Vec<f64> = (0..n_components)
            .map(|component_index| {
                weights
                    .iter()
                    .zip(&responsibilities)
                    .map(|(w, rho)| w * rho[component_index])
                    .sum()
            })
            .collect();
        if masses.iter().all(|&m| m <= 1e-10) {
            // Degenerate population: no component collected any weight. The
            // mixture is left as it is and the run ends.
            self.status.state = PmcState::Exhausted;
            self.status.warnings.push(
                "all mixture components lost their weight during the update; \
                 proposal left unchanged"
                    .to_string(),
            );
            return Ok(());
        }

        for (component_index, &mass) in masses.iter().enumerate() {
            let component = &mut self.mixture.components_mut()[component_index];
            if mass <= 1e-10 {
                component.weight = 0.0;
                continue;
            }
            let conditional: Vec<f64> = weights
                .iter()
                .zip(&responsibilities)
                .map(|(w, rho)| w * rho[component_index] / mass)
                .collect();
            let points: Vec<Vec<f64>> = samples.iter().map(|(p, _)| p.clone()).collect();
            let (mean, cov) = weighted_moments(&points, &conditional);
            debug_assert_eq!(mean.len(), dim);
            component.weight = mass;
            component.set_moments(mean, cov);
        }

        self.mixture.normalize();
        self.status.updates += 1;
        Ok(())
    }

    /// Convergence decision after one population. Checks, in order: the
    /// manual override, the relative effective-sample-size bound (unless
    /// ignored) and the perplexity stabilization window.
    pub fn check_convergence(&mut self, weights: &[f64]) -> bool {
        let rel_ess = effective_sample_size(weights) / weights.len().max(1) as f64;
        let perp = perplexity(weights);
        self.status.eff_sample_size = rel_ess;
        self.status.perplexity = perp;
        self.perplexity_history.push(perp);

        if self.status.converged_override {
            return true;
        }
        if !self.config.ignore_eff_sample_size && rel_ess >= self.config.minimum_eff_sample_size {
            return true;
        }
        let window = self.config.minimum_steps;
        if self.perplexity_history.len() >= window {
            let recent = &self.perplexity_history[self.perplexity_history.len() - window..];
            let mean = recent.iter().sum::<f64>() / window as f64;
            if mean > 0.0 {
                let var = recent.iter().map(|p| (p - mean) * (p - mean)).sum::<f64>()
                    / (window - 1) as f64;
                if var.sqrt() / mean < self.config.maximum_relative_std_deviation {
                    return true;
                }
            }
        }
        false
    }

    /// Runs update steps until convergence or exhaustion, then draws the
    /// final population from the frozen mixture and persists both streams.
    pub fn run(&mut self) -> Result<PmcStatus> {
        let pb = ProgressBar::new(self.config.max_updates as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                .expect("valid progress template")
                .progress_chars("##-"),
        );
        pb.set_prefix("pmc");

        loop {
            let population = self.draw_samples(self.population_size());
            let weights = self.calculate_weights(&population);
            if self.check_convergence(&weights) {
                self.status.state = PmcState::Converged;
                break;
            }
            if self.status.updates >= self.config.max_updates {
                self.status.state = PmcState::Exhausted;
                self.status.warnings.push(format!(
                    "proposal did not stabilize within {} updates \
                     (relative ESS {:.3}, perplexity {:.3})",
                    self.config.max_updates,
                    self.status.eff_sample_size,
                    self.status.perplexity
                ));
                break;
            }
            self.update(&population, &weights)?;
            if self.status.state == PmcState::Exhausted {
                break;
            }
            pb.set_position(self.status.updates as u64);
            pb.set_message(format!(
                "ESS {:.3} perplexity {:.3}",
                self.status.eff_sample_size, self.status.perplexity
            ));
        }
        pb.finish_with_message(match self.status.state {
            PmcState::Converged => "converged",
            _ => "exhausted",
        });

        // Final population from the frozen proposal.
        let population = self.draw_samples(self.config.final_samples);
        let weights = self.calculate_weights(&population);
        self.status.eff_sample_size =
            effective_sample_size(&weights) / weights.len().max(1) as f64;
        self.status.perplexity = perplexity(&weights);

        self.final_records = population
            .into_iter()
            .zip(&weights)
            .enumerate()
            .map(|(index, ((point, log_posterior), &weight))| SampleRecord {
                chain: 0,
                iteration: index as u64 + 1,
                point,
                log_posterior,
                weight,
            })
            .collect();

        std::fs::create_dir_all(&self.config.output_directory)
            .map_err(|e| Error::store(&self.config.output_directory, e))?;
        let mut store = SampleStore::create(
            self.config.output_directory.join("pmc_samples.csv"),
            self.mixture.dimension(),
        )?;
        store.append_chunk(&self.final_records)?;
        write_components(
            self.config.output_directory.join("pmc_components.csv"),
            &self.mixture,
        )?;

        Ok(self.status.clone())
    }
}

/// Draws a component index proportional to the weights.
fn pick_component<R: rand::Rng>(weights: &[f64], rng: &mut R) -> usize {
    let u: f64 = rng.gen();
    let mut acc = 0.0;
    for (index, &w) in weights.iter().enumerate() {
        acc += w;
        if u < acc {
            return index;
        }
    }
    // Rounding can leave u just above the cumulative sum; fall back to the
    // last component that carries weight.
    weights
        .iter()
        .rposition(|&w| w > 0.0)
        .unwrap_or(weights.len() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixture::MixtureComponent;
    use crate::posterior::Scorer;
    use crate::prior::{LogPrior, ParameterRange};
    use approx::assert_abs_diff_eq;
    use nalgebra::{DMatrix, DVector};
    use std::sync::Arc;

    fn gaussian_posterior() -> LogPosterior {
        let scorer: Arc<dyn Scorer> = Arc::new(|p: &[f64]| -0.5 * p[0] * p[0]);
        let mut posterior = LogPosterior::new(scorer);
        let range = ParameterRange::new(-10.0, 10.0).unwrap();
        assert!(posterior.add("mu", LogPrior::flat(range), false));
        posterior
    }

    fn single_component_mixture(mean: f64, var: f64) -> MixtureModel {
        MixtureModel::new(vec![MixtureComponent::new(
            DVector::from_element(1, mean),
            DMatrix::from_element(1, 1, var),
            1.0,
            0.0,
        )
        .unwrap()])
        .unwrap()
    }

    fn test_config(dir: &Path) -> PmcConfig {
        PmcConfig {
            target_ncomponents: 1,
            samples_per_component: 2000,
            final_samples: 5000,
            seed: Some(17),
            output_directory: dir.join("pmc"),
            ..PmcConfig::default()
        }
    }

    #[test]
    fn matched_mixture_converges_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let mut sampler = PopulationMonteCarloSampler::new(
            gaussian_posterior(),
            single_component_mixture(0.0, 1.0),
            test_config(dir.path()),
        )
        .unwrap();
        let population = sampler.draw_samples(2000);
        let weights = sampler.calculate_weights(&population);
        // The proposal equals the target up to the flat-prior constant, so
        // the weights are uniform.
        assert!(sampler.check_convergence(&weights));
        assert!(sampler.status().eff_sample_size > 0.99);
    }

    #[test]
    fn mismatched_mixture_converges_within_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut sampler = PopulationMonteCarloSampler::new(
            gaussian_posterior(),
            single_component_mixture(2.0, 4.0),
            test_config(dir.path()),
        )
        .unwrap();
        let status = sampler.run().unwrap();
        assert_eq!(status.state, PmcState::Converged);
        assert!(status.converged());
        assert!(sampler.status().converged());
        assert!(status.updates <= 20);

        let records = sampler.final_records();
        let weighted_mean: f64 = records.iter().map(|r| r.weight * r.point[0]).sum();
        assert_abs_diff_eq!(weighted_mean, 0.0, epsilon = 0.05);
    }

    #[test]
    fn cropping_cannot_raise_the_largest_weight() {
        let dir = tempfile::tempdir().unwrap();
        let mut cropped_config = test_config(dir.path());
        cropped_config.crop_highest_weights = 10;
        let plain = PopulationMonteCarloSampler::new(
            gaussian_posterior(),
            single_component_mixture(3.0, 0.5),
            test_config(dir.path()),
        )
        .unwrap();
        let cropped = PopulationMonteCarloSampler::new(
            gaussian_posterior(),
            single_component_mixture(3.0, 0.5),
            cropped_config,
        )
        .unwrap();

        let mut source = PopulationMonteCarloSampler::new(
            gaussian_posterior(),
            single_component_mixture(3.0, 0.5),
            test_config(dir.path()),
        )
        .unwrap();
        let population = source.draw_samples(1000);

        let plain_weights = plain.calculate_weights(&population);
        let cropped_weights = cropped.calculate_weights(&population);
        let max = |w: &[f64]| w.iter().cloned().fold(0.0, f64::max);
        assert!(max(&cropped_weights) <= max(&plain_weights) + 1e-12);
        assert!(
            effective_sample_size(&cropped_weights) >= effective_sample_size(&plain_weights) - 1e-9
        );
    }

    #[test]
    fn manual_override_short_circuits_convergence() {
        let dir = tempfile::tempdir().unwrap();
        let mut sampler = PopulationMonteCarloSampler::new(
            gaussian_posterior(),
            single_component_mixture(5.0, 0.1),
            test_config(dir.path()),
        )
        .unwrap();
        sampler.status_mut().set_converged(true);
        let weights = vec![1.0, 0.0, 0.0];
        assert!(sampler.check_convergence(&weights));
        // Clearing the override restores the regular checks.
        sampler.status_mut().set_converged(false);
        assert!(!sampler.check_convergence(&weights));
    }

    #[test]
    fn final_draw_keeps_the_terminal_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut sampler = PopulationMonteCarloSampler::new(
            gaussian_posterior(),
            single_component_mixture(0.0, 1.0),
            test_config(dir.path()),
        )
        .unwrap();
        for state in [PmcState::Converged, PmcState::Exhausted] {
            sampler.status_mut().state = state;
            sampler.draw_samples(10);
            assert_eq!(sampler.status().state, state);
        }
    }

    #[test]
    fn degenerate_population_exhausts_without_touching_the_mixture() {
        let dir = tempfile::tempdir().unwrap();
        let mut sampler = PopulationMonteCarloSampler::new(
            gaussian_posterior(),
            single_component_mixture(2.0, 4.0),
            test_config(dir.path()),
        )
        .unwrap();
        let population = sampler.draw_samples(100);
        let before = sampler.mixture().components()[0].clone();
        sampler.update(&population, &vec![0.0; 100]).unwrap();
        assert_eq!(sampler.status().state, PmcState::Exhausted);
        assert!(!sampler.status().warnings.is_empty());
        assert_eq!(sampler.status().updates, 0);
        let after = &sampler.mixture().components()[0];
        assert_abs_diff_eq!(after.mean[0], before.mean[0], epsilon = 0.0);
        assert_abs_diff_eq!(after.weight, before.weight, epsilon = 0.0);
    }

    #[test]
    fn unseeded_runs_derive_a_wall_clock_seed() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.seed = None;
        let sampler = PopulationMonteCarloSampler::new(
            gaussian_posterior(),
            single_component_mixture(0.0, 1.0),
            config,
        )
        .unwrap();
        assert!(sampler.seed() > 0);
    }

    #[test]
    fn update_pulls_the_component_toward_the_target() {
        let dir = tempfile::tempdir().unwrap();
        let mut sampler = PopulationMonteCarloSampler::new(
            gaussian_posterior(),
            single_component_mixture(2.0, 4.0),
            test_config(dir.path()),
        )
        .unwrap();
        let population = sampler.draw_samples(4000);
        let weights = sampler.calculate_weights(&population);
        sampler.update(&population, &weights).unwrap();
        let component = &sampler.mixture().components()[0];
        assert!(component.mean[0].abs() < 1.0);
        assert!(component.cov[(0, 0)] < 3.0);
        assert_eq!(sampler.status().updates, 1);
    }

    #[test]
    fn dimension_mismatch_is_a_configuration_error() {
        let mixture = MixtureModel::new(vec![MixtureComponent::new(
            DVector::from_element(2, 0.0),
            DMatrix::identity(2, 2),
            1.0,
            0.0,
        )
        .unwrap()])
        .unwrap();
        let result =
            PopulationMonteCarloSampler::new(gaussian_posterior(), mixture, PmcConfig::default());
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn seeding_from_empty_histories_fails() {
        let chains = vec![ChainHistory {
            id: 0,
            samples: Vec::new(),
        }];
        let result = PopulationMonteCarloSampler::from_prerun(
            gaussian_posterior(),
            &chains,
            PmcConfig::default(),
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
