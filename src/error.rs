//! Error types for configuration loading and connection handling.
//!
//! Only `ConfigError` is fatal. Connection-level failures are handled inside
//! the runtime and end up as counters in the run summary.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse config file '{path}': {source}")]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid configuration: '{key}' should be a non-negative integer, got '{value}'")]
    InvalidInteger { key: String, value: String },
    #[error("Invalid configuration: '{key}' on line {line} has no value")]
    MissingValue { key: String, line: usize },
    #[error("Invalid configuration: 'echo_string' must not be empty")]
    EmptyPayload,
}

/// Failure to establish a connection to the server under test.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to resolve '{host}:{port}': {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("'{host}:{port}' resolved to no addresses")]
    NoAddress { host: String, port: u16 },
    #[error("failed to connect: {0}")]
    Connect(#[source] io::Error),
}

/// Why a connection ended in the `Failed` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FailReason {
    #[error("timeout")]
    Timeout,
    #[error("peer closed early")]
    PeerClosedEarly,
    #[error("socket error: {0}")]
    Socket(io::ErrorKind),
}

impl FailReason {
    /// Whether this failure counts against the connection's drop counter.
    pub fn is_drop(&self) -> bool {
        !matches!(self, FailReason::PeerClosedEarly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_reason_display() {
        assert_eq!(FailReason::Timeout.to_string(), "timeout");
        assert_eq!(FailReason::PeerClosedEarly.to_string(), "peer closed early");
        assert!(FailReason::Socket(io::ErrorKind::ConnectionReset)
            .to_string()
            .starts_with("socket error"));
    }

    #[test]
    fn test_drop_classification() {
        assert!(FailReason::Timeout.is_drop());
        assert!(FailReason::Socket(io::ErrorKind::BrokenPipe).is_drop());
        assert!(!FailReason::PeerClosedEarly.is_drop());
    }
}
