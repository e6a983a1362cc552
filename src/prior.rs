/*!
Parameter priors.

A prior is a tagged variant with a pure log-density per case: flat over a hard
range, or an asymmetric (split) Gaussian with different widths below and above
the central value. New prior kinds are added as new variants, not through
trait objects.

Every prior carries the hard range of its parameter; outside that range the
log-density is negative infinity regardless of the variant.
*/

use std::f64::consts::PI;

use rand::Rng;

use crate::error::{Error, Result};

/// Hard range of one scan or nuisance parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterRange {
    pub min: f64,
    pub max: f64,
}

impl ParameterRange {
    pub fn new(min: f64, max: f64) -> Result<Self> {
        if !(min.is_finite() && max.is_finite() && min < max) {
            return Err(Error::Configuration(format!(
                "invalid parameter range [{min}, {max}]"
            )));
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, x: f64) -> bool {
        self.min <= x && x <= self.max
    }

    pub fn width(&self) -> f64 {
        self.max - self.min
    }
}

/// Which prior variant a parameter uses; part of its public description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorKind {
    Flat,
    Gauss,
}

/// Log-prior over a single parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum LogPrior {
    /// Uniform over the hard range.
    Flat { range: ParameterRange },
    /// Split Gaussian: width `central - lower` below the central value,
    /// `upper - central` above it, continuous at the center.
    Gauss {
        range: ParameterRange,
        lower: f64,
        central: f64,
        upper: f64,
    },
}

impl LogPrior {
    pub fn flat(range: ParameterRange) -> Self {
        LogPrior::Flat { range }
    }

    /// Builds a split-Gaussian prior from the 68% interval `[lower, upper]`
    /// around `central`.
    pub fn gauss(range: ParameterRange, lower: f64, central: f64, upper: f64) -> Result<Self> {
        if !(lower < central && central < upper) {
            return Err(Error::Configuration(format!(
                "gaussian prior needs lower < central < upper, got ({lower}, {central}, {upper})"
            )));
        }
        if !range.contains(central) {
            return Err(Error::Configuration(format!(
                "gaussian prior central value {central} outside range [{}, {}]",
                range.min, range.max
            )));
        }
        Ok(LogPrior::Gauss {
            range,
            lower,
            central,
            upper,
        })
    }

    pub fn range(&self) -> ParameterRange {
        match self {
            LogPrior::Flat { range } | LogPrior::Gauss { range, .. } => *range,
        }
    }

    pub fn kind(&self) -> PriorKind {
        match self {
            LogPrior::Flat { .. } => PriorKind::Flat,
            LogPrior::Gauss { .. } => PriorKind::Gauss,
        }
    }

    /// Log-density at `x`; negative infinity outside the hard range.
    pub fn log_density(&self, x: f64) -> f64 {
        match self {
            LogPrior::Flat { range } => {
                if range.contains(x) {
                    -range.width().ln()
                } else {
                    f64::NEG_INFINITY
                }
            }
            LogPrior::Gauss {
                range,
                lower,
                central,
                upper,
            } => {
                if !range.contains(x) {
                    return f64::NEG_INFINITY;
                }
                let sigma_below = central - lower;
                let sigma_above = upper - central;
                let sigma = if x < *central { sigma_below } else { sigma_above };
                let z = (x - central) / sigma;
                // Common normalization of the split normal density.
                (2.0 / PI).sqrt().ln() - (sigma_below + sigma_above).ln() - 0.5 * z * z
            }
        }
    }

    /// Draws one value from the prior, used to seed chains without an
    /// explicit starting point. Rejection keeps the draw inside the hard
    /// range.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> f64 {
        match self {
            LogPrior::Flat { range } => rng.gen_range(range.min..range.max),
            LogPrior::Gauss {
                range,
                lower,
                central,
                upper,
            } => {
                let sigma_below = central - lower;
                let sigma_above = upper - central;
                let p_below = sigma_below / (sigma_below + sigma_above);
                loop {
                    let z: f64 = rng.sample(rand_distr::StandardNormal);
                    let x = if rng.gen::<f64>() < p_below {
                        central - z.abs() * sigma_below
                    } else {
                        central + z.abs() * sigma_above
                    };
                    if range.contains(x) {
                        return x;
                    }
                }
            }
        }
    }
}
