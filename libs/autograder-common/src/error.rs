use thiserror::Error;

/// Error taxonomy shared by the autograder crates.
///
/// Orchestration code propagates `anyhow::Error`; these variants are raised
/// where a caller needs to tell the kinds apart (via `downcast_ref`).
#[derive(Error, Debug)]
pub enum AutograderError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Tool error: {message}")]
    Tool {
        message: String,
        stdout: String,
        stderr: String,
    },

    #[error("Timed out after {secs} seconds")]
    Timeout { secs: u64 },

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("System error: {0}")]
    System(String),
}

impl AutograderError {
    pub fn validation(message: impl Into<String>) -> Self {
        AutograderError::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        AutograderError::NotFound(message.into())
    }

    pub fn tool(message: impl Into<String>, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        AutograderError::Tool {
            message: message.into(),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Cancellation is reported through this type but is not a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AutograderError::Cancelled)
    }
}

/// Check whether an `anyhow` chain carries a specific taxonomy entry.
pub fn is_validation_error(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<AutograderError>(), Some(AutograderError::Validation(_)))
}

pub fn is_not_found_error(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<AutograderError>(), Some(AutograderError::NotFound(_)))
}
