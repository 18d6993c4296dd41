use std::path::PathBuf;

use heapwrap_core::PrefixError;
use thiserror::Error;

/// Failures surfaced by the harness CLI.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialize: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Prefix(#[from] PrefixError),
    #[error("{failed} of {total} self-check scenarios failed")]
    SelfCheckFailed { failed: usize, total: usize },
    #[error("{path}: {errors} invalid log lines out of {lines}")]
    InvalidLog {
        path: PathBuf,
        errors: usize,
        lines: usize,
    },
}

impl HarnessError {
    pub fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}
