/*!
Bayesian parameter inference by adaptive sampling.

The crate drives an opaque log-likelihood (the [`posterior::Scorer`] trait)
through two cooperating samplers: a multi-chain Metropolis-Hastings scan
([`mcmc`]) whose pre-run output seeds a mixture proposal, and a Population
Monte Carlo refinement ([`pmc`]) that turns the mixture into weighted
posterior samples. Both write chunked, durable CSV streams ([`io`]).
*/

pub mod chain;
pub mod error;
pub mod io;
pub mod mcmc;
pub mod mixture;
pub mod pmc;
pub mod posterior;
pub mod prior;
pub mod proposal;
pub mod stats;

pub use error::{Error, Result};
pub use mcmc::{MarkovChainSampler, McmcConfig, McmcReport};
pub use pmc::{PmcConfig, PmcState, PmcStatus, PopulationMonteCarloSampler};
pub use posterior::{LogPosterior, Scorer};
pub use prior::{LogPrior, ParameterRange};
