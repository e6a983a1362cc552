/*!
The PMC proposal: a weighted mixture of heavy-tailed elliptical components.

A component is a (mean, covariance, weight, degrees-of-freedom) unit; a
non-positive degrees-of-freedom value selects the Gaussian limit. The model
keeps its weights normalized to one at all times.

The initial mixture is seeded from MCMC output: chains are partitioned into
groups, either explicitly or by proximity of their Gelman-Rubin R-values, and
each surviving group contributes one component built from its pooled samples.
*/

use nalgebra::{Cholesky, DMatrix, DVector, Dyn, SymmetricEigen};
use ndarray::prelude::*;
use rand::Rng;

use crate::error::{Error, Result};
use crate::proposal::{elliptical_log_density, elliptical_step, factorize};
use crate::stats::{max_scale_reduction, potential_scale_reduction, sample_moments, RunningMoments};

/// One mixture component.
#[derive(Clone)]
pub struct MixtureComponent {
    pub mean: DVector<f64>,
    pub cov: DMatrix<f64>,
    pub weight: f64,
    /// Student-t degrees of freedom; `<= 0` selects the Gaussian limit.
    pub dof: f64,
    factor: Cholesky<f64, Dyn>,
}

impl MixtureComponent {
    pub fn new(mean: DVector<f64>, cov: DMatrix<f64>, weight: f64, dof: f64) -> Result<Self> {
        let factor = factorize(&cov).ok_or_else(|| {
            Error::Configuration("mixture component covariance is not positive definite".to_string())
        })?;
        Ok(Self {
            mean,
            cov,
            weight,
            dof,
            factor,
        })
    }

    fn degrees_of_freedom(&self) -> Option<f64> {
        (self.dof > 0.0).then_some(self.dof)
    }

    pub fn dimension(&self) -> usize {
        self.mean.len()
    }

    pub fn log_density(&self, x: &[f64]) -> f64 {
        let diff = DVector::from_iterator(
            x.len(),
            x.iter().zip(self.mean.iter()).map(|(xi, mi)| xi - mi),
        );
        elliptical_log_density(&self.factor, self.degrees_of_freedom(), &diff)
    }

    pub fn sample<R: Rng>(&self, rng: &mut R) -> Vec<f64> {
        let step = elliptical_step(&self.factor, self.degrees_of_freedom(), rng);
        self.mean.iter().zip(step.iter()).map(|(m, s)| m + s).collect()
    }

    /// Replaces mean and covariance in place, keeping weight and dof. The
    /// previous factor survives an indefinite estimate, mirroring the chain
    /// proposal adaptation.
    pub fn set_moments(&mut self, mean: DVector<f64>, cov: DMatrix<f64>) {
        self.mean = mean;
        if let Some(factor) = factorize(&cov) {
            self.cov = cov;
            self.factor = factor;
        }
    }
}

/// Ordered list of components with weights summing to one.
#[derive(Clone)]
pub struct MixtureModel {
    components: Vec<MixtureComponent>,
}

impl MixtureModel {
    pub fn new(components: Vec<MixtureComponent>) -> Result<Self> {
        if components.is_empty() {
            return Err(Error::Configuration(
                "mixture model needs at least one component".to_string(),
            ));
        }
        let dim = components[0].dimension();
        if components.iter().any(|c| c.dimension() != dim) {
            return Err(Error::Configuration(
                "mixture components disagree on dimension".to_string(),
            ));
        }
        let mut model = Self { components };
        model.normalize();
        Ok(model)
    }

    pub fn components(&self) -> &[MixtureComponent] {
        &self.components
    }

    pub fn components_mut(&mut self) -> &mut [MixtureComponent] {
        &mut self.components
    }

    pub fn dimension(&self) -> usize {
        self.components[0].dimension()
    }

    /// Indices of components that still carry weight.
    pub fn live_components(&self) -> Vec<usize> {
        self.components
            .iter()
            .enumerate()
            .filter(|(_, c)| c.weight > 0.0)
            .map(|(i, _)| i)
            .collect()
    }

    /// Restores the weights-sum-to-one invariant.
    pub fn normalize(&mut self) {
        let total: f64 = self.components.iter().map(|c| c.weight).sum();
        if total > 0.0 {
            for component in &mut self.components {
                component.weight /= total;
            }
        } else {
            let uniform = 1.0 / self.components.len() as f64;
            for component in &mut self.components {
                component.weight = uniform;
            }
        }
    }

    /// Mixture log-density, log-sum-exp over the weighted components.
    pub fn log_density(&self, x: &[f64]) -> f64 {
        let terms: Vec<f64> = self
            .components
            .iter()
            .filter(|c| c.weight > 0.0)
            .map(|c| c.weight.ln() + c.log_density(x))
            .collect();
        let max = terms.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if !max.is_finite() {
            return f64::NEG_INFINITY;
        }
        max + terms.iter().map(|t| (t - max).exp()).sum::<f64>().ln()
    }

    /// Adjusts the component count to `target`: surplus components are
    /// removed lowest-weight first, each one merged into its nearest
    /// neighbour; a deficit is filled by splitting the heaviest component
    /// along its principal axis.
    pub fn resize(&mut self, target: usize) -> Result<()> {
        if target == 0 {
            return Err(Error::Configuration(
                "target component count must be positive".to_string(),
            ));
        }
        while self.components.len() > target {
            let lowest = self
                .components
                .iter()
                .enumerate()
                .min_by(|a, b| a.1.weight.total_cmp(&b.1.weight))
                .map(|(i, _)| i)
                .expect("non-empty");
            let removed = self.components.remove(lowest);
            let nearest = self
                .components
                .iter()
                .enumerate()
                .min_by(|a, b| {
                    let da = (&a.1.mean - &removed.mean).norm();
                    let db = (&b.1.mean - &removed.mean).norm();
                    da.total_cmp(&db)
                })
                .map(|(i, _)| i)
                .expect("non-empty");
            merge_into(&mut self.components[nearest], &removed);
        }
        while self.components.len() < target {
            let heaviest = self
                .components
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.weight.total_cmp(&b.1.weight))
                .map(|(i, _)| i)
                .expect("non-empty");
            let split = split_component(&self.components[heaviest])?;
            self.components[heaviest] = split.0;
            self.components.push(split.1);
        }
        self.normalize();
        Ok(())
    }
}

/// Moment-matching merge of `source` into `target`.
fn merge_into(target: &mut MixtureComponent, source: &MixtureComponent) {
    let total = target.weight + source.weight;
    if total <= 0.0 {
        return;
    }
    let wa = target.weight / total;
    let wb = source.weight / total;
    let mean = &target.mean * wa + &source.mean * wb;
    let da = &target.mean - &mean;
    let db = &source.mean - &mean;
    let cov = (&target.cov + &da * da.transpose()) * wa + (&source.cov + &db * db.transpose()) * wb;
    target.weight = total;
    target.set_moments(mean, cov);
}

/// Splits a component into two along its principal axis, halving the weight.
fn split_component(
    component: &MixtureComponent,
) -> Result<(MixtureComponent, MixtureComponent)> {
    let eigen = SymmetricEigen::new(component.cov.clone());
    let (max_idx, max_eigenvalue) = eigen
        .eigenvalues
        .iter()
        .cloned()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .expect("non-empty eigenvalues");
    let axis = eigen.eigenvectors.column(max_idx).into_owned();
    let shift = axis * max_eigenvalue.max(0.0).sqrt() * 0.5;
    let half = component.weight / 2.0;
    Ok((
        MixtureComponent::new(
            &component.mean + &shift,
            component.cov.clone(),
            half,
            component.dof,
        )?,
        MixtureComponent::new(
            &component.mean - &shift,
            component.cov.clone(),
            half,
            component.dof,
        )?,
    ))
}

/// Per-chain sample history handed over from the MCMC sampler when seeding
/// the mixture.
#[derive(Debug, Clone)]
pub struct ChainHistory {
    pub id: usize,
    pub samples: Vec<Vec<f64>>,
}

/// Partitions chains into groups by R-value proximity: a chain joins the
/// first group whose pooled potential scale reduction stays below
/// `threshold`, otherwise it opens a new group. Dimensions listed in
/// `skip_dims` (typically the nuisance parameters) are excluded from the
/// decision.
pub fn group_chains(
    chains: &[ChainHistory],
    threshold: f64,
    skip_dims: &[usize],
    strict: bool,
) -> Vec<Vec<usize>> {
    let kept_dims: Vec<usize> = (0..chains[0].samples[0].len())
        .filter(|d| !skip_dims.contains(d))
        .collect();

    let moments: Vec<RunningMoments> = chains
        .iter()
        .map(|chain| {
            let mut m = RunningMoments::new(kept_dims.len());
            let mut buffer = Vec::with_capacity(kept_dims.len());
            for sample in &chain.samples {
                buffer.clear();
                buffer.extend(kept_dims.iter().map(|&d| sample[d]));
                m.step(&buffer);
            }
            m
        })
        .collect();

    let mut groups: Vec<Vec<usize>> = Vec::new();
    'chains: for index in 0..chains.len() {
        for group in &mut groups {
            let members: Vec<usize> = group.iter().copied().chain([index]).collect();
            let means = stack_moments(&members, &moments, |m| m.mean());
            let vars = stack_moments(&members, &moments, |m| m.variance());
            let n = members
                .iter()
                .map(|&i| chains[i].samples.len())
                .min()
                .unwrap_or(0) as f64;
            let r = potential_scale_reduction(&means, &vars, n, strict);
            if max_scale_reduction(&r) < threshold {
                group.push(index);
                continue 'chains;
            }
        }
        groups.push(vec![index]);
    }
    groups
}

fn stack_moments<F>(members: &[usize], moments: &[RunningMoments], select: F) -> Array2<f64>
where
    F: Fn(&RunningMoments) -> Array1<f64>,
{
    let rows: Vec<Array1<f64>> = members.iter().map(|&i| select(&moments[i])).collect();
    let views: Vec<ArrayView1<f64>> = rows.iter().map(|r| r.view()).collect();
    ndarray::stack(Axis(0), &views).expect("equal-length moment rows")
}

impl MixtureModel {
    /// Seeds a mixture from grouped chain output: one component per group
    /// that is not listed in `ignore_groups`, weighted by the group's pooled
    /// sample count, then resized to `target_ncomponents`.
    pub fn from_chain_groups(
        chains: &[ChainHistory],
        groups: &[Vec<usize>],
        ignore_groups: &[usize],
        degrees_of_freedom: f64,
        target_ncomponents: usize,
    ) -> Result<Self> {
        let mut components = Vec::new();
        for (group_index, members) in groups.iter().enumerate() {
            if ignore_groups.contains(&group_index) || members.is_empty() {
                continue;
            }
            let pooled: Vec<Vec<f64>> = members
                .iter()
                .flat_map(|&i| chains[i].samples.iter().cloned())
                .collect();
            if pooled.len() < 2 {
                continue;
            }
            let (mean, cov) = sample_moments(&pooled);
            components.push(MixtureComponent::new(
                mean,
                cov,
                pooled.len() as f64,
                degrees_of_freedom,
            )?);
        }
        if components.is_empty() {
            return Err(Error::Configuration(
                "no chain groups left to seed the mixture from".to_string(),
            ));
        }
        let mut model = MixtureModel::new(components)?;
        model.resize(target_ncomponents)?;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn unit_gaussian_component(mean: f64, weight: f64) -> MixtureComponent {
        MixtureComponent::new(
            DVector::from_element(1, mean),
            DMatrix::identity(1, 1),
            weight,
            0.0,
        )
        .unwrap()
    }

    #[test]
    fn weights_are_normalized_on_construction() {
        let model = MixtureModel::new(vec![
            unit_gaussian_component(0.0, 3.0),
            unit_gaussian_component(5.0, 1.0),
        ])
        .unwrap();
        let total: f64 = model.components().iter().map(|c| c.weight).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(model.components()[0].weight, 0.75, epsilon = 1e-12);
    }

    #[test]
    fn single_gaussian_log_density_is_exact() {
        let model = MixtureModel::new(vec![unit_gaussian_component(0.0, 1.0)]).unwrap();
        let expected = -0.5 * (2.0 * std::f64::consts::PI).ln() - 0.5;
        assert_abs_diff_eq!(model.log_density(&[1.0]), expected, epsilon = 1e-12);
    }

    #[test]
    fn resize_prunes_lowest_weight_first() {
        let mut model = MixtureModel::new(vec![
            unit_gaussian_component(0.0, 0.6),
            unit_gaussian_component(10.0, 0.3),
            unit_gaussian_component(10.5, 0.1),
        ])
        .unwrap();
        model.resize(2).unwrap();
        assert_eq!(model.components().len(), 2);
        // The pruned 0.1 component merged into the nearby 0.3 one.
        let total: f64 = model.components().iter().map(|c| c.weight).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(model.components()[1].weight, 0.4, epsilon = 1e-12);
        assert!(model.components()[1].mean[0] > 10.0);
    }

    #[test]
    fn resize_splits_heaviest_component() {
        let mut model = MixtureModel::new(vec![
            unit_gaussian_component(0.0, 0.9),
            unit_gaussian_component(4.0, 0.1),
        ])
        .unwrap();
        model.resize(3).unwrap();
        assert_eq!(model.components().len(), 3);
        let total: f64 = model.components().iter().map(|c| c.weight).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn grouping_separates_disjoint_chains() {
        let mut rng = SmallRng::seed_from_u64(11);
        let noise = |rng: &mut SmallRng| {
            let z: f64 = rand::Rng::sample(rng, rand_distr::StandardNormal);
            z * 0.1
        };
        let near_zero = |rng: &mut SmallRng| vec![noise(rng)];
        let near_five = |rng: &mut SmallRng| vec![5.0 + noise(rng)];
        let chains = vec![
            ChainHistory {
                id: 0,
                samples: (0..200).map(|_| near_zero(&mut rng)).collect(),
            },
            ChainHistory {
                id: 1,
                samples: (0..200).map(|_| near_zero(&mut rng)).collect(),
            },
            ChainHistory {
                id: 2,
                samples: (0..200).map(|_| near_five(&mut rng)).collect(),
            },
        ];
        let groups = group_chains(&chains, 1.2, &[], true);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], vec![0, 1]);
        assert_eq!(groups[1], vec![2]);
    }

    #[test]
    fn mixture_from_groups_has_one_component_per_group() {
        let mut rng = SmallRng::seed_from_u64(13);
        let sample = |rng: &mut SmallRng, center: f64| {
            let z: f64 = rand::Rng::sample(rng, rand_distr::StandardNormal);
            vec![center + z]
        };
        let chains = vec![
            ChainHistory {
                id: 0,
                samples: (0..500).map(|_| sample(&mut rng, 0.0)).collect(),
            },
            ChainHistory {
                id: 1,
                samples: (0..500).map(|_| sample(&mut rng, 20.0)).collect(),
            },
        ];
        let groups = vec![vec![0], vec![1]];
        let model = MixtureModel::from_chain_groups(&chains, &groups, &[], 5.0, 2).unwrap();
        assert_eq!(model.components().len(), 2);
        assert!(model.components()[0].mean[0].abs() < 0.5);
        assert_abs_diff_eq!(model.components()[1].mean[0], 20.0, epsilon = 0.5);
    }
}
