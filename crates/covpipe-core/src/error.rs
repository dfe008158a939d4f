//! Error types for covpipe-core

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while configuring or executing a pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Pipeline file could not be parsed
    #[error("Failed to parse pipeline file {path}: {message}")]
    ConfigParse { path: PathBuf, message: String },

    /// Pipeline file parsed but is not runnable
    #[error("Invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    /// Command had nothing to execute
    #[error("Empty command for {0}")]
    EmptyCommand(String),

    /// Command could not be started
    #[error("Failed to spawn '{program}': {message}")]
    Spawn { program: String, message: String },

    /// Command exceeded its timeout
    #[error("'{program}' timed out after {timeout_secs} seconds")]
    Timeout { program: String, timeout_secs: u64 },

    /// Reporting helper could not be acquired
    #[error("Failed to fetch reporting helper from {source_desc}: {message}")]
    HelperFetch { source_desc: String, message: String },

    /// Reporting helper returned a non-zero exit code
    #[error("Reporting helper '{command}' exited with code {exit_code}")]
    Reporter { command: String, exit_code: i32 },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        let source_desc = err
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "remote".to_string());
        PipelineError::HelperFetch {
            source_desc,
            message: err.to_string(),
        }
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
