//! Error taxonomy for the exporter.
//!
//! Two failure classes matter to a scrape:
//!
//! - [`TransportError`] is *hard*: the build client could not be reached, an
//!   RPC failed, or the scrape was cancelled. Any hard failure turns
//!   `buildkit_up` to 0.
//! - [`ParseError`] (and the other [`ScrapeWarning`](crate::scrape::ScrapeWarning)
//!   kinds) are *soft*: they are collected, joined once per scrape, and never
//!   block emission of unrelated series.

use std::path::PathBuf;

use thiserror::Error;

// ============================================================================
// SECTION 1: TOP-LEVEL ERROR
// ============================================================================

/// The main error type for the exporter.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Metrics sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExporterError {
    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            ExporterError::Config(_) => "config",
            ExporterError::Transport(e) => e.category(),
            ExporterError::Sink(_) => "sink",
            ExporterError::Io(_) => "io",
            ExporterError::Internal(_) => "internal",
        }
    }
}

/// Result type for exporter operations
pub type ExporterResult<T> = Result<T, ExporterError>;

// ============================================================================
// SECTION 2: TRANSPORT ERRORS (hard)
// ============================================================================

/// Failures talking to the build client. Any of these fails the scrape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Buildkit at '{endpoint}' is unreachable: {message}")]
    Unavailable { endpoint: String, message: String },

    #[error("Buildkit RPC '{operation}' failed ({code}): {message}")]
    Rpc {
        operation: &'static str,
        code: String,
        message: String,
    },

    #[error("Scrape cancelled before the build client answered")]
    Cancelled,

    #[error("Invalid Buildkit address '{address}': {message}")]
    InvalidAddress { address: String, message: String },
}

impl TransportError {
    pub fn unavailable(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        TransportError::Unavailable {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    pub fn invalid_address(address: impl Into<String>, message: impl Into<String>) -> Self {
        TransportError::InvalidAddress {
            address: address.into(),
            message: message.into(),
        }
    }

    /// True when the failure came from the caller's cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }

    pub fn category(&self) -> &'static str {
        match self {
            TransportError::Unavailable { .. } => "unavailable",
            TransportError::Rpc { .. } => "rpc",
            TransportError::Cancelled => "cancelled",
            TransportError::InvalidAddress { .. } => "address",
        }
    }
}

// ============================================================================
// SECTION 3: PARSE ERRORS (soft)
// ============================================================================

/// A malformed image reference found in build history.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid image FQN: {fqn}")]
    InvalidImageFqn { fqn: String },

    #[error("Unsupported image FQN '{fqn}': {reason}")]
    UnsupportedImageFqn { fqn: String, reason: &'static str },
}

impl ParseError {
    /// The offending reference.
    pub fn fqn(&self) -> &str {
        match self {
            ParseError::InvalidImageFqn { fqn } | ParseError::UnsupportedImageFqn { fqn, .. } => fqn,
        }
    }
}

// ============================================================================
// SECTION 4: CONFIGURATION ERRORS
// ============================================================================

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ============================================================================
// SECTION 5: SINK ERRORS
// ============================================================================

/// Errors raised while handing samples to a metrics sink.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Metric '{metric}' was never registered with the sink")]
    Unregistered { metric: String },

    #[error("Metric '{metric}' expects {expected} label values, got {got}")]
    LabelMismatch {
        metric: String,
        expected: usize,
        got: usize,
    },

    #[error("Counter '{metric}' cannot take negative value {value}")]
    NegativeCounter { metric: String, value: f64 },

    #[error("Metric '{metric}' does not accept {operation}")]
    WrongKind {
        metric: String,
        operation: &'static str,
    },

    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Failed to encode exposition: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_categories() {
        assert_eq!(TransportError::Cancelled.category(), "cancelled");
        assert!(TransportError::Cancelled.is_cancelled());

        let err = TransportError::unavailable("unix:///run/buildkit/buildkitd.sock", "connection refused");
        assert_eq!(err.category(), "unavailable");
        assert!(!err.is_cancelled());
        assert_eq!(ExporterError::from(err).category(), "unavailable");
    }

    #[test]
    fn test_parse_error_fqn() {
        let err = ParseError::UnsupportedImageFqn {
            fqn: "a:b:c".into(),
            reason: "more than one tag separator",
        };
        assert_eq!(err.fqn(), "a:b:c");
        assert_eq!(
            err.to_string(),
            "Unsupported image FQN 'a:b:c': more than one tag separator"
        );
    }
}
