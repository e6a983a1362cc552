//! Error types shared across the samplers.
//!
//! Two failure classes are fatal: configuration problems (reported before any
//! sampling work starts) and store problems (fatal for the affected chain or
//! run only). Everything else is recovered locally: a non-finite score becomes
//! a zero-acceptance step, and hitting an iteration cap becomes a warning in
//! the run report.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or inconsistent sampler configuration. Raised before sampling.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The persistent sample store is unreachable or holds a partial chunk.
    #[error("store error for {path}: {message}")]
    Store { path: PathBuf, message: String },
}

impl Error {
    pub(crate) fn store(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Error::Store {
            path: path.into(),
            message: message.to_string(),
        }
    }
}
