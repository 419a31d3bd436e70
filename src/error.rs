//! Error types for the streaming client.
//!
//! Every failure in this crate is recoverable from the point of view of the
//! embedding application: connection problems are retried by the reader
//! worker, decode problems skip a single frame and protocol problems tear down
//! the current connection so that a fresh one can be opened.
//!
//! ## Error Categories
//!
//! - **Connection Errors**: connect or channel handshake failures
//! - **Transport Errors**: read/write failures on an open connection, including
//!   the distinguished "connection reset" condition
//! - **Protocol Errors**: malformed HTTP headers or JPP-stream messages
//! - **Codec Errors**: failures reported by the JPEG 2000 engine
//! - **Parameter Desync**: decoded buffer no longer matches the requested region
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use jpipflow::StreamError;
//!
//! let error = StreamError::connection_failed("server refused the channel");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for streaming operations.
pub type Result<T, E = StreamError> = std::result::Result<T, E>;

/// Main error type for streaming operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StreamError {
    #[error("Failed to connect to JPIP server: {reason}")]
    Connection {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Transport failure during {operation}")]
    TransportIo {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Protocol error in {context}: {details}")]
    Protocol { context: String, details: String },

    #[error("Codec failure while decoding frame {frame}: {details}")]
    Codec { frame: u32, details: String },

    #[error("Decoded buffer holds {actual} pixels but region needs {expected}")]
    ParameterDesync { expected: usize, actual: usize },

    #[error("Connection is closed")]
    Closed,

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Configuration file error: {path}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StreamError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            StreamError::Connection { .. } => true,
            StreamError::TransportIo { .. } => true,
            StreamError::Protocol { .. } => true,
            StreamError::Codec { .. } => true,
            StreamError::ParameterDesync { .. } => true,
            StreamError::Timeout { .. } => true,
            StreamError::Closed => false,
            StreamError::Config { .. } => false,
            StreamError::ConfigFile { .. } => false,
        }
    }

    /// Returns whether this is the distinguished "connection reset mid-transfer" failure.
    ///
    /// Servers drop channels this way when too many movies with too many frames
    /// are streamed at once, so it is reported to the user instead of being retried
    /// silently.
    pub fn is_connection_reset(&self) -> bool {
        match self {
            StreamError::TransportIo { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            StreamError::Connection { .. } => vec![
                "Check that the JPIP server is reachable",
                "Verify the endpoint host, port and target path",
                "Wait for the reader to retry the connection",
            ],
            StreamError::TransportIo { .. } if self.is_connection_reset() => vec![
                "Remove some of the currently streamed movies",
                "Load shorter movies or select a larger cadence",
                "Playback continues with degraded speed",
            ],
            StreamError::TransportIo { .. } => vec![
                "Check network connectivity",
                "Wait for the reader to reconnect",
            ],
            StreamError::Protocol { .. } => vec![
                "Verify the server speaks JPIP over HTTP",
                "Check for proxies rewriting the response",
            ],
            StreamError::Codec { .. } => vec![
                "The frame is skipped and retried on the next wake-up",
                "Verify the cached data-bins are not corrupted",
            ],
            StreamError::ParameterDesync { .. } => vec![
                "The frame is skipped; the next frame uses fresh parameters",
            ],
            StreamError::Closed => vec![
                "Open a new session; closed connections are not reused",
            ],
            StreamError::Timeout { .. } => vec![
                "Increase the teardown join timeout",
                "Check system load",
            ],
            StreamError::Config { .. } => vec![
                "Check the configuration values against their documented ranges",
            ],
            StreamError::ConfigFile { .. } => vec![
                "Check the configuration file exists and is readable",
                "Verify the YAML syntax",
            ],
        }
    }

    /// Helper constructor for connection errors.
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        StreamError::Connection { reason: reason.into(), source: None }
    }

    /// Helper constructor for connection errors with source.
    pub fn connection_failed_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        StreamError::Connection { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for transport failures.
    pub fn transport(operation: impl Into<String>, source: std::io::Error) -> Self {
        StreamError::TransportIo { operation: operation.into(), source }
    }

    /// Helper constructor for protocol errors.
    pub fn protocol(context: impl Into<String>, details: impl Into<String>) -> Self {
        StreamError::Protocol { context: context.into(), details: details.into() }
    }

    /// Helper constructor for codec errors.
    pub fn codec(frame: u32, details: impl Into<String>) -> Self {
        StreamError::Codec { frame, details: details.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        StreamError::Config { reason: reason.into() }
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::TransportIo { operation: "<unknown>".to_string(), source: err }
    }
}

impl From<serde_yaml_ng::Error> for StreamError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        StreamError::Config { reason: err.to_string() }
    }
}
