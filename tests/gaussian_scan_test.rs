use std::sync::Arc;

use approx::assert_abs_diff_eq;
use bayescan::io::read_records;
use bayescan::mcmc::{MarkovChainSampler, McmcConfig};
use bayescan::posterior::{LogPosterior, Scorer};
use bayescan::prior::{LogPrior, ParameterRange};
use bayescan::proposal::ProposalFamily;

fn standard_gaussian() -> LogPosterior {
    let scorer: Arc<dyn Scorer> = Arc::new(|p: &[f64]| -0.5 * p[0] * p[0]);
    let mut posterior = LogPosterior::new(scorer);
    let range = ParameterRange::new(-10.0, 10.0).unwrap();
    assert!(posterior.add("mu", LogPrior::flat(range), false));
    posterior
}

fn scan_config(output: std::path::PathBuf, seed: u64) -> McmcConfig {
    McmcConfig {
        number_of_chains: 4,
        chunk_size: 1000,
        chunks: 5,
        need_prerun: true,
        store_prerun: false,
        need_main_run: true,
        prerun_iterations_min: 1000,
        prerun_iterations_max: 10_000,
        prerun_iterations_update: 500,
        proposal: ProposalFamily::Gaussian,
        rvalue_threshold: 1.1,
        use_strict_rvalue_definition: true,
        scale_reduction: 1.0,
        seed: Some(seed),
        parallelize: false,
        starting_point: None,
        output_directory: output,
    }
}

#[test]
fn gaussian_scan_recovers_mean_and_std() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("scan");
    let mut sampler =
        MarkovChainSampler::new(standard_gaussian(), scan_config(output.clone(), 271)).unwrap();
    let report = sampler.run().unwrap();

    assert!(report.prerun_converged, "pre-run should pass R < 1.1");
    assert!(report.failed_chains.is_empty());
    assert_eq!(report.r_values.len(), 1);
    assert!(report.r_values[0] < 1.1);
    for rate in &report.acceptance_rates {
        assert!(*rate > 0.05 && *rate < 0.95, "degenerate acceptance {rate}");
    }

    let mut pooled = Vec::new();
    for id in 0..4 {
        let records = read_records(output.join(format!("chain_{id}.csv")), 0, None).unwrap();
        assert_eq!(records.len(), 5000);
        pooled.extend(records.into_iter().map(|r| r.point[0]));
    }
    let n = pooled.len() as f64;
    let mean = pooled.iter().sum::<f64>() / n;
    let var = pooled.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / (n - 1.0);
    assert_abs_diff_eq!(mean, 0.0, epsilon = 0.1);
    assert_abs_diff_eq!(var.sqrt(), 1.0, epsilon = 0.1);
}

#[test]
fn sequential_runs_with_one_seed_are_bit_identical() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first");
    let second = dir.path().join("second");
    for output in [&first, &second] {
        let mut sampler =
            MarkovChainSampler::new(standard_gaussian(), scan_config(output.clone(), 99)).unwrap();
        sampler.run().unwrap();
    }
    for id in 0..4 {
        let name = format!("chain_{id}.csv");
        let a = std::fs::read(first.join(&name)).unwrap();
        let b = std::fs::read(second.join(&name)).unwrap();
        assert_eq!(a, b, "chain {id} streams differ between identical runs");
    }
}

#[test]
fn stored_prerun_streams_exist_per_chain() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("scan");
    let mut config = scan_config(output.clone(), 7);
    config.store_prerun = true;
    config.need_main_run = false;
    let mut sampler = MarkovChainSampler::new(standard_gaussian(), config).unwrap();
    let report = sampler.run().unwrap();

    for id in 0..4 {
        let records = read_records(output.join(format!("prerun_{id}.csv")), 0, None).unwrap();
        assert_eq!(records.len(), report.prerun_iterations);
        assert!(records.iter().all(|r| r.weight == 1.0));
    }
}
