// Error taxonomy for provisioning and lifecycle operations.
//
// Every step either completes, is skipped as already satisfied, or returns one of these.
// Nothing here is retried automatically; `is_retryable` only tells the operator whether a
// plain re-run (after inspecting the host) can succeed or whether the configuration must change.

use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::BackupFormat;

pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Invalid or incomplete configuration (missing installer, missing password, bad identifier...).
    #[error("configuration error: {0}")]
    Config(String),

    /// Restore target already exists. Callers may treat this as an expected outcome.
    #[error("Database already exists: {0}")]
    DatabaseAlreadyExists(String),

    /// Parallel dumps are only supported by the directory archive format.
    #[error(
        "Parallel dumps are only supported for the directory archive format (parallelism={parallelism}, backup_format={format})"
    )]
    UnsupportedParallelism { parallelism: u32, format: BackupFormat },

    /// An external tool ran but its captured output did not match the expected success marker.
    #[error("{operation} failed: {command} (exit_code={exit_code:?}, stdout='{stdout}', stderr='{stderr}')")]
    ToolFailure {
        operation: String,
        /// Command line with secrets redacted.
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// Process launch failure or filesystem create/delete/move failure.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command timed out after {timeout_ms}ms: {command}")]
    Timeout { command: String, timeout_ms: u128 },
}

impl ProvisionError {
    pub fn config(msg: impl Into<String>) -> Self {
        ProvisionError::Config(msg.into())
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ProvisionError::Io {
            context: context.into(),
            source,
        }
    }

    /// Convenience for filesystem failures that name the path involved.
    pub fn fs(action: &str, path: &Path, source: std::io::Error) -> Self {
        ProvisionError::io(format!("{} failed: {:?}", action, path), source)
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ProvisionError::DatabaseAlreadyExists(_))
    }

    /// True when re-running the same operation after fixing the host can succeed.
    /// Configuration problems need a config change first.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProvisionError::ToolFailure { .. }
                | ProvisionError::Io { .. }
                | ProvisionError::Timeout { .. }
        )
    }
}

/// Extension for attaching path context to `std::io::Result` values.
pub trait IoResultExt<T> {
    fn with_path(self, action: &str, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, action: &str, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| ProvisionError::fs(action, &path.into(), e))
    }
}
