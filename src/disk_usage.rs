//! Disk-Usage Aggregator.

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::{BuildClient, DiskUsageRecord, UsageRecordType};
use crate::error::TransportError;
use crate::logging::TARGET_CLIENT;

/// Byte sums and object counts per cache record type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskUsageTallies {
    pub size_by_type: BTreeMap<UsageRecordType, i64>,
    pub count_by_type: BTreeMap<UsageRecordType, u64>,
}

impl DiskUsageTallies {
    pub fn aggregate(records: &[DiskUsageRecord]) -> Self {
        let mut tallies = DiskUsageTallies::default();
        for record in records {
            *tallies
                .size_by_type
                .entry(record.record_type.clone())
                .or_insert(0) += record.size_bytes;
            *tallies
                .count_by_type
                .entry(record.record_type.clone())
                .or_insert(0) += 1;
        }
        tallies
    }
}

/// Fetch the snapshot and group it. Cancellation is honored even when the
/// client itself does not watch the token.
pub async fn collect(
    client: &dyn BuildClient,
    cancel: &CancellationToken,
) -> Result<DiskUsageTallies, TransportError> {
    let records = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(TransportError::Cancelled),
        records = client.disk_usage(cancel) => records?,
    };

    debug!(
        target: TARGET_CLIENT,
        endpoint = %client.endpoint(),
        records = records.len(),
        "Disk usage fetched"
    );
    Ok(DiskUsageTallies::aggregate(&records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockBuildClient;

    fn record(id: &str, kind: &str, size: i64) -> DiskUsageRecord {
        DiskUsageRecord {
            id: id.into(),
            record_type: UsageRecordType::new(kind),
            size_bytes: size,
        }
    }

    #[test]
    fn test_groups_by_record_type() {
        let tallies = DiskUsageTallies::aggregate(&[
            record("a", "regular", 100),
            record("b", "regular", 50),
            record("c", "exec.cachemount", 7),
            record("d", "source.local", 0),
        ]);

        let regular = UsageRecordType::new("regular");
        assert_eq!(tallies.size_by_type[&regular], 150);
        assert_eq!(tallies.count_by_type[&regular], 2);
        assert_eq!(tallies.count_by_type[&UsageRecordType::new("source.local")], 1);
        assert_eq!(tallies.size_by_type.len(), 3);
    }

    #[test]
    fn test_empty_snapshot() {
        assert_eq!(DiskUsageTallies::aggregate(&[]), DiskUsageTallies::default());
    }

    #[tokio::test]
    async fn test_collect_propagates_transport_error() {
        let mut client = MockBuildClient::new();
        client
            .expect_disk_usage()
            .returning(|_| Err(TransportError::unavailable("tcp://buildkitd:1234", "refused")));

        let err = collect(&client, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.category(), "unavailable");
    }

    #[tokio::test]
    async fn test_collect_cancelled() {
        let mut client = MockBuildClient::new();
        client.expect_disk_usage().returning(|_| Ok(vec![]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = collect(&client, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
