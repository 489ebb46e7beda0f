//! Error types for configuration backends

use thiserror::Error;

/// Result type alias for backend operations
pub type Result<T> = std::result::Result<T, SysConfError>;

/// Errors raised by a config store or adapter backend
#[derive(Debug, Error)]
pub enum SysConfError {
    /// A system tool could not be launched at all
    #[error("Failed to run {tool}: {source}")]
    Command {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// A system tool ran but reported failure
    #[error("{tool} failed: {stderr}")]
    ToolFailed { tool: &'static str, stderr: String },

    /// The named adapter or value does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Tool output could not be interpreted
    #[error("Parse error: {0}")]
    Parse(String),

    /// Injected or backend-specific write refusal
    #[error("Write rejected for {0}")]
    WriteRejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SysConfError {
    /// Check whether the error means "nothing there" rather than a failure
    pub fn is_not_found(&self) -> bool {
        matches!(self, SysConfError::NotFound(_))
    }
}
