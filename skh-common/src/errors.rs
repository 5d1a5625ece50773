//! Error taxonomy for the E2E harness.
//!
//! | Variant              | Meaning                                               |
//! |----------------------|-------------------------------------------------------|
//! | `ExecutionTimeout`   | Invocation exceeded its time budget (child was killed) |
//! | `ExecutionFailure`   | The process could not be launched or talked to         |
//! | `ExecutableNotFound` | No skill-hub binary resolved at runner construction    |
//! | `ValidationMismatch` | A strict assertion failed                              |
//! | `EnvironmentSetup`   | Sandbox directories or metadata could not be prepared  |
//! | `Parse`              | YAML/JSON content could not be loaded                  |
//!
//! A non-zero exit of the tested program is not an error; it is reported
//! through [`crate::e2e::InvocationResult`].

use std::path::PathBuf;
use std::time::Duration;

/// Error type for harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Command timed out after {timeout:?}: {command}")]
    ExecutionTimeout { command: String, timeout: Duration },

    #[error("Command failed to execute: {command}: {source}")]
    ExecutionFailure {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("skill-hub executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("Validation failed: {0}")]
    ValidationMismatch(String),

    #[error("Environment setup failed: {0}")]
    EnvironmentSetup(String),

    #[error("Failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Stable kind label used in failure reports and artifacts.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExecutionTimeout { .. } => "ExecutionTimeout",
            Self::ExecutionFailure { .. } => "ExecutionFailure",
            Self::ExecutableNotFound(_) => "ExecutableNotFound",
            Self::ValidationMismatch(_) => "ValidationMismatch",
            Self::EnvironmentSetup(_) => "EnvironmentSetupError",
            Self::Parse { .. } => "ParseError",
            Self::Io(_) => "IoError",
        }
    }

    /// Infrastructure failures mean the harness itself is broken.
    pub fn is_infrastructure(&self) -> bool {
        !matches!(self, Self::ValidationMismatch(_))
    }
}

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;
