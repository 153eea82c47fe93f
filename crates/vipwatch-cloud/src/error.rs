//! Error types for cloud provider calls.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for cloud provider operations.
pub type CloudResult<T> = Result<T, CloudError>;

/// Errors that can occur while talking to the cloud provider.
#[derive(Debug, Error)]
pub enum CloudError {
    /// The referenced resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The provider rejected the call.
    #[error("{code}: {message}")]
    Api { code: String, message: String },

    /// The provider client could not be started.
    #[error("failed to launch provider command: {0}")]
    Launch(#[from] std::io::Error),

    /// The provider client failed without a recognizable error code.
    #[error("provider command failed ({status}): {stderr}")]
    Command { status: String, stderr: String },

    #[error("unexpected provider response: {0}")]
    Parse(String),

    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    /// A wait ended because the resource reached a state it can never leave.
    #[error("wait aborted: {0}")]
    Wait(String),
}

impl CloudError {
    /// Whether this error means the resource is absent (an expected outcome
    /// for lookups and route deletion).
    pub fn is_not_found(&self) -> bool {
        match self {
            CloudError::NotFound(_) => true,
            CloudError::Api { code, .. } => code.ends_with("NotFound"),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for CloudError {
    fn from(e: serde_json::Error) -> Self {
        CloudError::Parse(e.to_string())
    }
}
