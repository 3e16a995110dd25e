use crate::config::ConfigError;
use crate::loader::sink::{InsertError, SinkSetupError};
use crate::loader::source::SourceError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("source error: {0}")]
    Source(#[from] SourceError),
    #[error("sink setup failed: {0}")]
    Setup(#[from] SinkSetupError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("worker {worker} aborted the run: {source}")]
    Aborted {
        worker: usize,
        #[source]
        source: InsertError,
    },
    #[error("failed to write rejected record: {0}")]
    DeadLetter(#[from] csv::Error),
    #[error("task failed: {0}")]
    Panicked(String),
    #[error("invalid load options: {0}")]
    InvalidOptions(String),
    #[error("load cancelled")]
    Cancelled,
}

impl LoadError {
    /// Whether the run stopped because someone asked it to.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LoadError::Cancelled)
    }
}

impl From<tokio::task::JoinError> for LoadError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            LoadError::Cancelled
        } else {
            LoadError::Panicked(err.to_string())
        }
    }
}
