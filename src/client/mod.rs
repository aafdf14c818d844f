//! Build client abstraction.
//!
//! The scrape engine only needs two things from BuildKit: a disk-usage
//! snapshot and a drainable history stream. Both calls take the caller's
//! cancellation token explicitly; the client handle itself carries no
//! request-scoped context.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;

#[cfg(feature = "grpc")]
pub mod grpc;

#[cfg(feature = "grpc")]
pub use grpc::GrpcBuildClient;

// ============================================================================
// SECTION 1: DOMAIN RECORDS
// ============================================================================

/// Cache record type as reported by BuildKit (`regular`, `source.local`,
/// `exec.cachemount`, ...). Treated as opaque.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UsageRecordType(String);

impl UsageRecordType {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UsageRecordType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry of the disk-usage snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskUsageRecord {
    pub id: String,
    pub record_type: UsageRecordType,
    pub size_bytes: i64,
}

/// A build-engine exporter target attached to a build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExporterTarget {
    /// Exporter type (`image`, `docker`, `local`, ...)
    pub kind: String,
    pub attrs: HashMap<String, String>,
}

impl ExporterTarget {
    /// The `name` attribute, i.e. the pushed image FQN; empty when unset.
    pub fn image_name(&self) -> &str {
        self.attrs.get("name").map(String::as_str).unwrap_or("")
    }
}

/// One build-history record from the history stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildHistoryEvent {
    pub record_id: String,
    /// Only the first exporter is consulted.
    pub exporters: Vec<ExporterTarget>,
    pub frontend_attrs: HashMap<String, String>,
    pub num_total_steps: i32,
    pub num_completed_steps: i32,
    pub num_cached_steps: i32,
    pub created_at: Option<DateTime<Utc>>,
    /// Unset while the build is still running.
    pub completed_at: Option<DateTime<Utc>>,
    pub terminal_error: Option<String>,
}

impl BuildHistoryEvent {
    pub fn primary_exporter(&self) -> Option<&ExporterTarget> {
        self.exporters.first()
    }

    pub fn failed(&self) -> bool {
        self.terminal_error.is_some()
    }
}

/// Stream of history events, terminated by end-of-stream.
pub type HistoryStream = BoxStream<'static, Result<BuildHistoryEvent, TransportError>>;

// ============================================================================
// SECTION 2: CLIENT TRAIT
// ============================================================================

/// Read-only view of a BuildKit daemon.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BuildClient: Send + Sync {
    /// Fetch the current disk-usage snapshot.
    async fn disk_usage(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<DiskUsageRecord>, TransportError>;

    /// Open the build-history stream. With `early_exit` the stream ends once
    /// all currently known records were sent.
    async fn stream_history(
        &self,
        cancel: &CancellationToken,
        early_exit: bool,
    ) -> Result<HistoryStream, TransportError>;

    /// Address used in logs.
    fn endpoint(&self) -> String;
}

// ============================================================================
// SECTION 3: ADDRESSES
// ============================================================================

/// A BuildKit control-API address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildkitAddress {
    /// `unix:///run/buildkit/buildkitd.sock`
    Unix(PathBuf),
    /// `tcp://host:port`
    Tcp(String),
}

impl BuildkitAddress {
    pub fn parse(address: &str) -> Result<Self, TransportError> {
        if let Some(path) = address.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(TransportError::invalid_address(address, "empty socket path"));
            }
            return Ok(BuildkitAddress::Unix(PathBuf::from(path)));
        }
        if let Some(authority) = address.strip_prefix("tcp://") {
            if authority.is_empty() || authority.contains('/') {
                return Err(TransportError::invalid_address(address, "expected tcp://host:port"));
            }
            return Ok(BuildkitAddress::Tcp(authority.to_string()));
        }
        Err(TransportError::invalid_address(
            address,
            "only unix:// and tcp:// addresses are supported",
        ))
    }
}

impl Display for BuildkitAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BuildkitAddress::Unix(path) => write!(f, "unix://{}", path.display()),
            BuildkitAddress::Tcp(authority) => write!(f, "tcp://{}", authority),
        }
    }
}
