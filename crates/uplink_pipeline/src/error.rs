//! Pipeline-level errors.
//!
//! Per-packet failures (validation, store errors) are not errors here: they
//! are outcomes recorded in the ledger. These are the failures that stop a
//! worker or the pipeline itself.

use thiserror::Error;
use uplink_ledger::LedgerError;
use uplink_protocol::ConfigError;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// `start` called twice, `shutdown` before `start`, ...
    #[error("Invalid pipeline state: {0}")]
    InvalidState(String),
}
