//! Relay error types.
//!
//! Defines error variants for relay operations including upstream connection,
//! scanning, catalog lookup, and cache failures.

use thiserror::Error;

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Upstream not found: {0}")]
    UpstreamNotFound(String),

    #[error("Upstream not ready: {0}")]
    UpstreamNotReady(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Tool call timed out on upstream '{upstream}' after {seconds}s")]
    CallTimeout { upstream: String, seconds: u64 },

    #[error("Scan failed: {0}")]
    Scan(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RelayError::ToolNotFound("read_file".to_string());
        assert_eq!(err.to_string(), "Tool not found: read_file");

        let err = RelayError::CallTimeout {
            upstream: "files".to_string(),
            seconds: 30,
        };
        assert_eq!(
            err.to_string(),
            "Tool call timed out on upstream 'files' after 30s"
        );
    }
}
