//! Error taxonomy shared by every vmci component.
//!
//! Variants follow the pipeline stages that produce them so a failure can be
//! attributed to a single stage from the error alone.

use thiserror::Error;

/// Result alias used throughout vmci.
pub type VmciResult<T> = Result<T, VmciError>;

#[derive(Debug, Error)]
pub enum VmciError {
    /// Invalid or incomplete configuration (config file, scenario, CLI flags).
    #[error("configuration error: {0}")]
    Config(String),

    /// Baseline bundle could not be retrieved.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// Named entity (bundle, version tag, expectation) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Stored content failed integrity checks.
    #[error("corrupt artifact: {0}")]
    Corrupt(String),

    /// VM started but never became ready.
    #[error("boot error: {reason}")]
    Boot {
        reason: String,
        /// Console output captured up to the failure.
        console_log: String,
    },

    /// The VM process itself could not be launched or controlled.
    #[error("engine error: {0}")]
    Engine(String),

    /// Console capture failed; the primary debug signal is gone.
    #[error("console capture error: {0}")]
    Console(String),

    /// A provisioning command exited non-zero or a smoke check failed.
    #[error("provisioning command failed: {command}")]
    Provision { command: String, output: String },

    /// A guest-side operation failed to run (as opposed to producing a wrong result).
    #[error("execution error: {0}")]
    Execution(String),

    /// One or more operations did not match their expected results.
    #[error("assertion failures: {0}")]
    Assertion(String),

    /// The guest command channel is unusable.
    #[error("guest channel error: {0}")]
    Channel(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VmciError {
    /// Whether this error halts forward progress of a run.
    ///
    /// Execution errors and assertion failures are recorded per operation and
    /// only fail the verdict; publish errors surface as warnings. Everything
    /// else stops the pipeline.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            VmciError::Execution(_) | VmciError::Assertion(_) | VmciError::Publish(_)
        )
    }

    /// Diagnostic text attached to a failure report, if the error carries any.
    pub fn diagnostic_log(&self) -> Option<&str> {
        match self {
            VmciError::Boot { console_log, .. } => Some(console_log),
            VmciError::Provision { output, .. } => Some(output),
            _ => None,
        }
    }
}
