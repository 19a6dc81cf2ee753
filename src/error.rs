//! Harness error taxonomy.
//!
//! Case failures are data ([`CaseStatus`](crate::exec::CaseStatus)), not
//! errors: a failing test body must never abort the harness. `HarnessError`
//! covers the conditions that do abort a run or reject bad input up front.

use std::io;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// Caller passed something unusable at a call site: an unrecognized
    /// placemark name, a negative or non-finite weight, selection from an
    /// empty weighted set.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Run configuration rejected before any case ran.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Failure-store persistence I/O.
    #[error("failure store {path}: {source}")]
    Store {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The worker pool could not make progress: spawn failure, every worker
    /// dead, or internal plumbing torn down.
    #[error("worker pool: {0}")]
    Pool(String),

    /// A run summary converted into a hard failure via
    /// [`RunSummary::into_result`](crate::run::RunSummary::into_result).
    #[error("randomized case failed: {0}")]
    CaseFailed(String),
}

impl HarnessError {
    pub(crate) fn store(path: &Path, source: io::Error) -> Self {
        HarnessError::Store {
            path: path.display().to_string(),
            source,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        HarnessError::InvalidArgument(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        HarnessError::Config(msg.into())
    }
}
