//! Error types for nzbprobe

use std::io;
use thiserror::Error;

use crate::nntp::NntpError;

/// Probe error type
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Failed to load NZB file: {0}")]
    ManifestLoad(String),

    #[error("NNTP error: {0}")]
    Nntp(#[from] NntpError),

    #[error("{failed}/{total} segments missing ({failure_rate:.1}% > {allowed_percent}%)")]
    BudgetExceeded {
        /// Article id of the fetch that crossed the budget, when known.
        segment_id: Option<String>,
        failed: u64,
        total: u64,
        failure_rate: f64,
        allowed_percent: u8,
    },

    #[error("Cancelled")]
    Cancelled,
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ProbeError>;
