/*!
# Multi-chain Metropolis-Hastings sampler

Runs `number_of_chains` independent chains against one target adapter through
three phases:

- *Initializing*: configuration validation, seed derivation, starting points
  (explicit or sampled from the priors).
- *PreRun* (optional): blocks of `prerun_iterations_update` steps, after each
  of which every chain retunes its proposal covariance and the Gelman-Rubin
  R-values are aggregated across chains. The pre-run ends when the largest
  R-value passes the threshold, or with a non-fatal warning when the
  iteration cap is hit.
- *MainRun* (optional): `chunks` blocks of `chunk_size` records per chain,
  each block committed to the chain's stream as one durable chunk.

Chains are independent workers: stepped in parallel with rayon when
requested, synchronized only at block boundaries. Chunk commits always happen
sequentially on the coordinating thread, so a stream never sees interleaved
partial records. A store failure removes only the affected chain; the rest of
the run continues and the failure is recorded in the report.

All per-chain seeds derive from one top-level seed (`seed + chain index`), so
a sequential run with a fixed seed is bit-reproducible.
*/

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use indicatif::{ProgressBar, ProgressStyle};
use nalgebra::DMatrix;
use ndarray::prelude::*;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::chain::MarkovChain;
use crate::error::{Error, Result};
use crate::io::{SampleRecord, SampleStore};
use crate::mixture::ChainHistory;
use crate::posterior::LogPosterior;
use crate::proposal::{ProposalFamily, RandomWalkProposal};
use crate::stats::{max_scale_reduction, potential_scale_reduction};

/// Complete, immutable configuration of one MCMC run. How this value is
/// produced (CLI, file, test fixture) is the driving layer's concern.
#[derive(Debug, Clone)]
pub struct McmcConfig {
    pub number_of_chains: usize,
    /// Records per durable chunk in the main run.
    pub chunk_size: usize,
    /// Number of main-run chunks per chain.
    pub chunks: usize,
    pub need_prerun: bool,
    pub store_prerun: bool,
    pub need_main_run: bool,
    pub prerun_iterations_min: usize,
    pub prerun_iterations_max: usize,
    /// Steps per pre-run block, between adaptations.
    pub prerun_iterations_update: usize,
    pub proposal: ProposalFamily,
    /// Pre-run passes once max R drops below this.
    pub rvalue_threshold: f64,
    pub use_strict_rvalue_definition: bool,
    /// Divides the `2.38^2 / d` adaptation scale.
    pub scale_reduction: f64,
    /// `None` derives the seed from wall-clock time.
    pub seed: Option<u64>,
    pub parallelize: bool,
    /// Starting point for all chains; sampled from the priors when absent.
    pub starting_point: Option<Vec<f64>>,
    pub output_directory: PathBuf,
}

impl Default for McmcConfig {
    fn default() -> Self {
        Self {
            number_of_chains: 4,
            chunk_size: 1000,
            chunks: 10,
            need_prerun: true,
            store_prerun: false,
            need_main_run: true,
            prerun_iterations_min: 1000,
            prerun_iterations_max: 10_000,
            prerun_iterations_update: 500,
            proposal: ProposalFamily::StudentT {
                degrees_of_freedom: 5.0,
            },
            rvalue_threshold: 1.1,
            use_strict_rvalue_definition: true,
            scale_reduction: 1.0,
            seed: None,
            parallelize: false,
            starting_point: None,
            output_directory: PathBuf::from("mcmc_output"),
        }
    }
}

impl McmcConfig {
    fn validate(&self, dimension: usize) -> Result<()> {
        if dimension == 0 {
            return Err(Error::Configuration(
                "no parameters registered with the target adapter".to_string(),
            ));
        }
        if self.number_of_chains == 0 {
            return Err(Error::Configuration(
                "number_of_chains must be positive".to_string(),
            ));
        }
        if self.need_main_run && (self.chunk_size == 0 || self.chunks == 0) {
            return Err(Error::Configuration(
                "main run needs positive chunk_size and chunks".to_string(),
            ));
        }
        if self.need_prerun {
            if self.prerun_iterations_update == 0 {
                return Err(Error::Configuration(
                    "prerun_iterations_update must be positive".to_string(),
                ));
            }
            if self.prerun_iterations_min > self.prerun_iterations_max {
                return Err(Error::Configuration(format!(
                    "prerun_iterations_min {} exceeds prerun_iterations_max {}",
                    self.prerun_iterations_min, self.prerun_iterations_max
                )));
            }
        }
        if !(self.scale_reduction > 0.0) {
            return Err(Error::Configuration(
                "scale_reduction must be positive".to_string(),
            ));
        }
        self.proposal.validate()?;
        if let Some(point) = &self.starting_point {
            if point.len() != dimension {
                return Err(Error::Configuration(format!(
                    "starting point has {} coordinates but {} parameters are registered",
                    point.len(),
                    dimension
                )));
            }
        }
        Ok(())
    }
}

/// Outcome of one run; statistical warnings land here, never only on stderr.
#[derive(Debug, Clone, Default)]
pub struct McmcReport {
    pub prerun_converged: bool,
    pub prerun_iterations: usize,
    /// Per-parameter R-values from the last pre-run block.
    pub r_values: Vec<f64>,
    pub acceptance_rates: Vec<f64>,
    pub warnings: Vec<String>,
    /// Chains removed by store failures, with the failure message.
    pub failed_chains: Vec<(u32, String)>,
}

pub struct MarkovChainSampler {
    config: McmcConfig,
    chains: Vec<MarkovChain>,
    seed: u64,
    histories: Vec<ChainHistory>,
}

impl MarkovChainSampler {
    /// Validates the configuration and prepares the chains. All
    /// configuration errors surface here, before any sampling work.
    pub fn new(posterior: LogPosterior, config: McmcConfig) -> Result<Self> {
        let dimension = posterior.dimension();
        config.validate(dimension)?;

        let seed = config.seed.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        });

        // Initial proposal covariance: independent coordinates with the
        // variance of a uniform draw over each hard range, under the same
        // scaling the adaptation applies later.
        let descriptions = posterior.parameter_descriptions();
        let scale = 2.38 * 2.38 / dimension as f64 / config.scale_reduction;
        let initial_covariance = DMatrix::from_diagonal(&nalgebra::DVector::from_iterator(
            dimension,
            descriptions
                .iter()
                .map(|d| d.range.width() * d.range.width() / 12.0 * scale),
        ));

        let mut start_rng = SmallRng::seed_from_u64(seed);
        let mut chains = Vec::with_capacity(config.number_of_chains);
        for index in 0..config.number_of_chains {
            let start = match &config.starting_point {
                Some(point) => point.clone(),
                None => posterior.sample_initial_point(&mut start_rng)?,
            };
            let proposal = RandomWalkProposal::new(config.proposal, initial_covariance.clone())?;
            chains.push(MarkovChain::new(
                index as u32,
                posterior.clone(),
                proposal,
                start,
                seed.wrapping_add(index as u64),
            ));
        }

        let histories = (0..config.number_of_chains)
            .map(|id| ChainHistory {
                id,
                samples: Vec::new(),
            })
            .collect();

        Ok(Self {
            config,
            chains,
            seed,
            histories,
        })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Per-chain sample histories accumulated so far; input for seeding the
    /// PMC mixture.
    pub fn chain_histories(&self) -> &[ChainHistory] {
        &self.histories
    }

    /// Runs the configured phases and reports the outcome. Convergence
    /// failures are warnings, not errors; only configuration and whole-run
    /// store failures abort.
    pub fn run(&mut self) -> Result<McmcReport> {
        let mut report = McmcReport::default();
        if self.config.need_prerun {
            self.prerun(&mut report)?;
        } else {
            report.prerun_converged = true;
        }
        if self.config.need_main_run {
            self.main_run(&mut report)?;
        }
        report.acceptance_rates = self.chains.iter().map(|c| c.acceptance().rate()).collect();
        Ok(report)
    }

    fn step_block(chains: &mut [MarkovChain], steps: usize, parallel: bool) -> Vec<Vec<SampleRecord>> {
        if parallel {
            chains.par_iter_mut().map(|c| c.run_block(steps)).collect()
        } else {
            chains.iter_mut().map(|c| c.run_block(steps)).collect()
        }
    }

    fn prerun(&mut self, report: &mut McmcReport) -> Result<()> {
        let config = &self.config;
        let pb = ProgressBar::new(config.prerun_iterations_max as u64);
        pb.set_style(progress_style());
        pb.set_prefix("pre-run");

        let mut stores = if config.store_prerun {
            std::fs::create_dir_all(&config.output_directory)
                .map_err(|e| Error::store(&config.output_directory, e))?;
            // A chain whose stream cannot be created keeps sampling; only
            // its persistent record is lost.
            let mut stores = Vec::new();
            for chain in &self.chains {
                let path = config
                    .output_directory
                    .join(format!("prerun_{}.csv", chain.id()));
                match SampleStore::create(path, self.dimension()) {
                    Ok(store) => stores.push(Some(store)),
                    Err(err) => {
                        report.failed_chains.push((chain.id(), err.to_string()));
                        stores.push(None);
                    }
                }
            }
            if stores.iter().all(|s| s.is_none()) {
                return Err(Error::store(
                    &config.output_directory,
                    "no pre-run stream could be created",
                ));
            }
            stores
        } else {
            Vec::new()
        };

        let mut iterations = 0;
        loop {
            let blocks = Self::step_block(
                &mut self.chains,
                config.prerun_iterations_update,
                config.parallelize,
            );
            iterations += config.prerun_iterations_update;
            pb.set_position(iterations.min(config.prerun_iterations_max) as u64);

            for (chain_index, block) in blocks.iter().enumerate() {
                self.histories[chain_index]
                    .samples
                    .extend(block.iter().map(|r| r.point.clone()));
            }
            if config.store_prerun {
                for (chain_index, block) in blocks.iter().enumerate() {
                    if let Some(store) = stores[chain_index].as_mut() {
                        if let Err(err) = store.append_chunk(block) {
                            report
                                .failed_chains
                                .push((chain_index as u32, err.to_string()));
                            stores[chain_index] = None;
                        }
                    }
                }
            }

            for chain in &mut self.chains {
                chain.adapt_proposal(config.scale_reduction);
            }

            let r_values = self.current_r_values();
            let max_r = max_scale_reduction(&r_values);
            report.r_values = r_values.to_vec();
            pb.set_message(format!("max R = {max_r:.4}"));

            if iterations >= config.prerun_iterations_min && max_r < config.rvalue_threshold {
                report.prerun_converged = true;
                break;
            }
            if iterations >= config.prerun_iterations_max {
                report.warnings.push(format!(
                    "pre-run hit the iteration cap ({iterations}) with max R = {max_r:.4}; \
                     continuing without convergence"
                ));
                break;
            }
        }
        report.prerun_iterations = iterations;
        pb.finish_with_message(if report.prerun_converged {
            "converged"
        } else {
            "not converged"
        });

        Ok(())
    }

    fn current_r_values(&self) -> Array1<f64> {
        let rows: Vec<Array1<f64>> = self.chains.iter().map(|c| c.moments().mean()).collect();
        let mean_views: Vec<ArrayView1<f64>> = rows.iter().map(|r| r.view()).collect();
        let means = ndarray::stack(Axis(0), &mean_views).expect("equal-length chain means");
        let var_rows: Vec<Array1<f64>> =
            self.chains.iter().map(|c| c.moments().variance()).collect();
        let var_views: Vec<ArrayView1<f64>> = var_rows.iter().map(|r| r.view()).collect();
        let vars = ndarray::stack(Axis(0), &var_views).expect("equal-length chain variances");
        let n = self.chains[0].moments().count() as f64;
        potential_scale_reduction(
            &means,
            &vars,
            n,
            self.config.use_strict_rvalue_definition,
        )
    }

    fn main_run(&mut self, report: &mut McmcReport) -> Result<()> {
        let config = &self.config;
        std::fs::create_dir_all(&config.output_directory)
            .map_err(|e| Error::store(&config.output_directory, e))?;

        let mut stores: Vec<Option<SampleStore>> = Vec::new();
        for chain in &self.chains {
            let path = config
                .output_directory
                .join(format!("chain_{}.csv", chain.id()));
            match SampleStore::create(path, self.dimension()) {
                Ok(store) => stores.push(Some(store)),
                Err(err) => {
                    report.failed_chains.push((chain.id(), err.to_string()));
                    stores.push(None);
                }
            }
        }
        if stores.iter().all(|s| s.is_none()) {
            return Err(Error::store(
                &config.output_directory,
                "no chain stream could be created",
            ));
        }

        let pb = ProgressBar::new(config.chunks as u64);
        pb.set_style(progress_style());
        pb.set_prefix("main run");

        for _ in 0..config.chunks {
            // Step only chains that still own a live stream.
            let mut active: Vec<(usize, &mut MarkovChain)> = self
                .chains
                .iter_mut()
                .enumerate()
                .filter(|(i, _)| stores[*i].is_some())
                .collect();

            let blocks: Vec<(usize, Vec<SampleRecord>)> = if config.parallelize {
                active
                    .par_iter_mut()
                    .map(|(i, chain)| (*i, chain.run_block(config.chunk_size)))
                    .collect()
            } else {
                active
                    .iter_mut()
                    .map(|(i, chain)| (*i, chain.run_block(config.chunk_size)))
                    .collect()
            };

            // Chunk commits are serialized here, one stream at a time.
            for (chain_index, block) in blocks {
                self.histories[chain_index]
                    .samples
                    .extend(block.iter().map(|r| r.point.clone()));
                if let Some(store) = stores[chain_index].as_mut() {
                    if let Err(err) = store.append_chunk(&block) {
                        report
                            .failed_chains
                            .push((chain_index as u32, err.to_string()));
                        stores[chain_index] = None;
                    }
                }
            }
            pb.inc(1);
        }
        pb.finish_with_message("done");

        if !report.failed_chains.is_empty() {
            report.warnings.push(format!(
                "{} chain(s) dropped by store failures",
                report.failed_chains.len()
            ));
        }
        Ok(())
    }

    fn dimension(&self) -> usize {
        self.chains[0].current_point().len()
    }
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .expect("valid progress template")
        .progress_chars("##-")
}
