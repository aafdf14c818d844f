//! BuildKit control API over gRPC.
//!
//! Only the two calls the exporter needs are wired: `DiskUsage` and
//! `ListenBuildHistory` on `moby.buildkit.v1.Control`. The message types
//! below carry the subset of fields we read, with the tags of the upstream
//! `control.proto`; unknown fields are skipped by the decoder.

use std::fmt::{self, Debug, Formatter};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{future, StreamExt};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, trace};

use super::{
    BuildClient, BuildkitAddress, DiskUsageRecord, ExporterTarget, HistoryStream, UsageRecordType,
};
use crate::config::BuildkitConfig;
use crate::error::TransportError;
use crate::logging::TARGET_CLIENT;

const DISK_USAGE_PATH: &str = "/moby.buildkit.v1.Control/DiskUsage";
const LISTEN_BUILD_HISTORY_PATH: &str = "/moby.buildkit.v1.Control/ListenBuildHistory";

// ============================================================================
// SECTION 1: WIRE MESSAGES
// ============================================================================

pub mod proto {
    use std::collections::HashMap;

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DiskUsageRequest {
        #[prost(string, repeated, tag = "1")]
        pub filter: Vec<String>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DiskUsageResponse {
        #[prost(message, repeated, tag = "1")]
        pub record: Vec<UsageRecord>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct UsageRecord {
        #[prost(string, tag = "1")]
        pub id: String,
        #[prost(int64, tag = "4")]
        pub size: i64,
        #[prost(string, tag = "10")]
        pub record_type: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct BuildHistoryRequest {
        #[prost(bool, tag = "1")]
        pub active_only: bool,
        #[prost(string, tag = "2")]
        pub r#ref: String,
        #[prost(bool, tag = "3")]
        pub early_exit: bool,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum BuildHistoryEventType {
        Started = 0,
        Complete = 1,
        Deleted = 2,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct BuildHistoryEvent {
        #[prost(enumeration = "BuildHistoryEventType", tag = "1")]
        pub r#type: i32,
        #[prost(message, optional, tag = "2")]
        pub record: Option<BuildHistoryRecord>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct BuildHistoryRecord {
        #[prost(string, tag = "1")]
        pub r#ref: String,
        #[prost(map = "string, string", tag = "3")]
        pub frontend_attrs: HashMap<String, String>,
        #[prost(message, repeated, tag = "4")]
        pub exporters: Vec<Exporter>,
        #[prost(message, optional, tag = "5")]
        pub error: Option<RpcStatus>,
        #[prost(message, optional, tag = "6")]
        pub created_at: Option<Timestamp>,
        #[prost(message, optional, tag = "7")]
        pub completed_at: Option<Timestamp>,
        #[prost(int32, tag = "15")]
        pub num_cached_steps: i32,
        #[prost(int32, tag = "16")]
        pub num_total_steps: i32,
        #[prost(int32, tag = "17")]
        pub num_completed_steps: i32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Exporter {
        #[prost(string, tag = "1")]
        pub r#type: String,
        #[prost(map = "string, string", tag = "2")]
        pub attrs: HashMap<String, String>,
    }

    /// `google.rpc.Status`
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct RpcStatus {
        #[prost(int32, tag = "1")]
        pub code: i32,
        #[prost(string, tag = "2")]
        pub message: String,
    }

    /// `google.protobuf.Timestamp`
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Timestamp {
        #[prost(int64, tag = "1")]
        pub seconds: i64,
        #[prost(int32, tag = "2")]
        pub nanos: i32,
    }
}

// ----------------------------------------------------------------------------
// 1.1 Conversions into domain records
// ----------------------------------------------------------------------------

fn timestamp(ts: Option<&proto::Timestamp>) -> Option<DateTime<Utc>> {
    let ts = ts?;
    DateTime::from_timestamp(ts.seconds, u32::try_from(ts.nanos).ok()?)
}

impl From<proto::UsageRecord> for DiskUsageRecord {
    fn from(record: proto::UsageRecord) -> Self {
        DiskUsageRecord {
            id: record.id,
            record_type: UsageRecordType::new(record.record_type),
            size_bytes: record.size,
        }
    }
}

impl From<proto::BuildHistoryRecord> for super::BuildHistoryEvent {
    fn from(record: proto::BuildHistoryRecord) -> Self {
        super::BuildHistoryEvent {
            created_at: timestamp(record.created_at.as_ref()),
            completed_at: timestamp(record.completed_at.as_ref()),
            record_id: record.r#ref,
            exporters: record
                .exporters
                .into_iter()
                .map(|e| ExporterTarget {
                    kind: e.r#type,
                    attrs: e.attrs,
                })
                .collect(),
            frontend_attrs: record.frontend_attrs,
            num_total_steps: record.num_total_steps,
            num_completed_steps: record.num_completed_steps,
            num_cached_steps: record.num_cached_steps,
            terminal_error: record.error.map(|status| status.message),
        }
    }
}

fn rpc_error(operation: &'static str, status: tonic::Status) -> TransportError {
    match status.code() {
        tonic::Code::Cancelled => TransportError::Cancelled,
        code => TransportError::Rpc {
            operation,
            code: format!("{:?}", code),
            message: status.message().to_string(),
        },
    }
}

// ============================================================================
// SECTION 2: CLIENT
// ============================================================================

/// gRPC client for a BuildKit daemon.
///
/// The underlying channel connects lazily, so construction succeeds even
/// while the daemon is down; the first scrape then reports the failure.
#[derive(Clone)]
pub struct GrpcBuildClient {
    channel: Channel,
    address: BuildkitAddress,
}

impl GrpcBuildClient {
    /// Build a lazily-connecting client from configuration.
    pub fn connect_lazy(config: &BuildkitConfig) -> Result<Self, TransportError> {
        let address = BuildkitAddress::parse(&config.address)?;
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);

        let channel = match &address {
            BuildkitAddress::Unix(path) => {
                let path = path.clone();
                // The authority is ignored; the connector dials the socket.
                Endpoint::try_from("http://[::]:50051")
                    .map_err(|e| TransportError::invalid_address(&config.address, e.to_string()))?
                    .connect_timeout(connect_timeout)
                    .connect_with_connector_lazy(service_fn(move |_: Uri| {
                        let path = path.clone();
                        async move { UnixStream::connect(path).await }
                    }))
            }
            BuildkitAddress::Tcp(authority) => Endpoint::from_shared(format!("http://{}", authority))
                .map_err(|e| TransportError::invalid_address(&config.address, e.to_string()))?
                .connect_timeout(connect_timeout)
                .connect_lazy(),
        };

        debug!(target: TARGET_CLIENT, address = %address, "Buildkit client created");
        Ok(Self { channel, address })
    }

    async fn ready(&self) -> Result<Grpc<Channel>, TransportError> {
        let mut grpc = Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| TransportError::unavailable(self.address.to_string(), e.to_string()))?;
        Ok(grpc)
    }
}

impl Debug for GrpcBuildClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrpcBuildClient")
            .field("address", &self.address)
            .finish()
    }
}

#[async_trait]
impl BuildClient for GrpcBuildClient {
    async fn disk_usage(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<DiskUsageRecord>, TransportError> {
        let mut grpc = self.ready().await?;
        let codec: ProstCodec<proto::DiskUsageRequest, proto::DiskUsageResponse> =
            ProstCodec::default();
        let call = grpc.unary(
            tonic::Request::new(proto::DiskUsageRequest::default()),
            PathAndQuery::from_static(DISK_USAGE_PATH),
            codec,
        );

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            response = call => response.map_err(|s| rpc_error("DiskUsage", s))?,
        };

        let records: Vec<DiskUsageRecord> = response
            .into_inner()
            .record
            .into_iter()
            .map(DiskUsageRecord::from)
            .collect();
        trace!(target: TARGET_CLIENT, records = records.len(), "Disk usage fetched");
        Ok(records)
    }

    async fn stream_history(
        &self,
        cancel: &CancellationToken,
        early_exit: bool,
    ) -> Result<HistoryStream, TransportError> {
        let mut grpc = self.ready().await?;
        let codec: ProstCodec<proto::BuildHistoryRequest, proto::BuildHistoryEvent> =
            ProstCodec::default();
        let request = proto::BuildHistoryRequest {
            early_exit,
            ..Default::default()
        };
        let call = grpc.server_streaming(
            tonic::Request::new(request),
            PathAndQuery::from_static(LISTEN_BUILD_HISTORY_PATH),
            codec,
        );

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            response = call => response.map_err(|s| rpc_error("ListenBuildHistory", s))?,
        };

        let stream = response.into_inner().filter_map(|item| {
            future::ready(match item {
                Ok(event) => event.record.map(|record| Ok(record.into())),
                Err(status) => Some(Err(rpc_error("ListenBuildHistory", status))),
            })
        });
        Ok(Box::pin(stream))
    }

    fn endpoint(&self) -> String {
        self.address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::BuildHistoryEvent;
    use prost::Message;
    use std::collections::HashMap;

    fn record() -> proto::BuildHistoryRecord {
        proto::BuildHistoryRecord {
            r#ref: "k3v9x".into(),
            frontend_attrs: HashMap::from([("label:team".to_string(), "infra".to_string())]),
            exporters: vec![proto::Exporter {
                r#type: "image".into(),
                attrs: HashMap::from([("name".to_string(), "docker.io/library/app:v1".to_string())]),
            }],
            error: None,
            created_at: Some(proto::Timestamp { seconds: 1_700_000_000, nanos: 0 }),
            completed_at: Some(proto::Timestamp { seconds: 1_700_000_090, nanos: 500_000_000 }),
            num_cached_steps: 3,
            num_total_steps: 10,
            num_completed_steps: 9,
        }
    }

    #[test]
    fn test_history_record_conversion() {
        let event: BuildHistoryEvent = record().into();
        assert_eq!(event.record_id, "k3v9x");
        assert_eq!(event.exporters.len(), 1);
        assert_eq!(event.exporters[0].kind, "image");
        assert_eq!(event.exporters[0].image_name(), "docker.io/library/app:v1");
        assert_eq!(event.num_total_steps, 10);
        assert!(!event.failed());

        let elapsed = event.completed_at.unwrap() - event.created_at.unwrap();
        assert_eq!(elapsed.num_milliseconds(), 90_500);
    }

    #[test]
    fn test_error_status_marks_failure() {
        let mut rec = record();
        rec.error = Some(proto::RpcStatus { code: 2, message: "process did not complete".into() });
        rec.completed_at = None;

        let event: BuildHistoryEvent = rec.into();
        assert!(event.failed());
        assert_eq!(event.terminal_error.as_deref(), Some("process did not complete"));
        assert!(event.completed_at.is_none());
    }

    #[test]
    fn test_wire_roundtrip_keeps_tags() {
        let event = proto::BuildHistoryEvent {
            r#type: proto::BuildHistoryEventType::Complete as i32,
            record: Some(record()),
        };
        let bytes = event.encode_to_vec();
        let decoded = proto::BuildHistoryEvent::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_cancelled_status_maps_to_cancelled() {
        let err = rpc_error("DiskUsage", tonic::Status::cancelled("client went away"));
        assert!(err.is_cancelled());

        let err = rpc_error("DiskUsage", tonic::Status::unavailable("connection refused"));
        assert_eq!(err.category(), "rpc");
    }

    #[tokio::test]
    async fn test_lazy_client_reports_unreachable_socket() {
        let dir = tempfile::tempdir().unwrap();
        let config = BuildkitConfig {
            address: format!("unix://{}", dir.path().join("missing.sock").display()),
            connect_timeout_secs: 1,
            early_exit: true,
        };
        let client = GrpcBuildClient::connect_lazy(&config).unwrap();
        let result = client.disk_usage(&CancellationToken::new()).await;
        assert!(result.is_err());
    }
}
