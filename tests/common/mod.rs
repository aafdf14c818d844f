//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::{stream, StreamExt};
use tokio_util::sync::CancellationToken;

use buildkit_exporter::client::{
    BuildClient, BuildHistoryEvent, DiskUsageRecord, ExporterTarget, HistoryStream,
    UsageRecordType,
};
use buildkit_exporter::TransportError;

#[derive(Debug, Default)]
struct Activity {
    active: AtomicUsize,
    max_active: AtomicUsize,
    disk_calls: AtomicUsize,
    history_calls: AtomicUsize,
}

impl Activity {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Marks a scrape as finished when the history stream is dropped.
struct LeaveOnDrop(Arc<Activity>);

impl Drop for LeaveOnDrop {
    fn drop(&mut self) {
        self.0.leave();
    }
}

/// In-process build client serving canned data.
///
/// A scrape counts as active from its `disk_usage` call until the history
/// stream it opened is dropped, so overlapping scrapes show up in
/// [`FakeBuildClient::max_active`].
#[derive(Debug, Default)]
pub struct FakeBuildClient {
    pub disk: Vec<DiskUsageRecord>,
    pub disk_error: Option<TransportError>,
    pub history: Vec<BuildHistoryEvent>,
    /// Fail the history stream after this many events.
    pub history_error_after: Option<usize>,
    pub delay: Duration,
    activity: Arc<Activity>,
}

impl FakeBuildClient {
    pub fn new(disk: Vec<DiskUsageRecord>, history: Vec<BuildHistoryEvent>) -> Self {
        Self {
            disk,
            history,
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_disk_error(mut self, err: TransportError) -> Self {
        self.disk_error = Some(err);
        self
    }

    pub fn with_history_error_after(mut self, events: usize) -> Self {
        self.history_error_after = Some(events);
        self
    }

    pub fn max_active(&self) -> usize {
        self.activity.max_active.load(Ordering::SeqCst)
    }

    pub fn disk_calls(&self) -> usize {
        self.activity.disk_calls.load(Ordering::SeqCst)
    }

    pub fn history_calls(&self) -> usize {
        self.activity.history_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuildClient for FakeBuildClient {
    async fn disk_usage(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<Vec<DiskUsageRecord>, TransportError> {
        self.activity.enter();
        self.activity.disk_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        tokio::task::yield_now().await;
        match &self.disk_error {
            Some(err) => Err(err.clone()),
            None => Ok(self.disk.clone()),
        }
    }

    async fn stream_history(
        &self,
        _cancel: &CancellationToken,
        _early_exit: bool,
    ) -> Result<HistoryStream, TransportError> {
        self.activity.history_calls.fetch_add(1, Ordering::SeqCst);
        let guard = LeaveOnDrop(self.activity.clone());

        let mut items: Vec<Result<BuildHistoryEvent, TransportError>> =
            self.history.iter().cloned().map(Ok).collect();
        if let Some(after) = self.history_error_after {
            items.truncate(after);
            items.push(Err(TransportError::unavailable(
                "unix:///run/buildkit/buildkitd.sock",
                "stream reset",
            )));
        }

        Ok(stream::iter(items)
            .map(move |item| {
                let _active = &guard;
                item
            })
            .boxed())
    }

    fn endpoint(&self) -> String {
        "fake://buildkit".to_string()
    }
}

// ----------------------------------------------------------------------------
// Builders
// ----------------------------------------------------------------------------

pub fn usage(id: &str, kind: &str, size_bytes: i64) -> DiskUsageRecord {
    DiskUsageRecord {
        id: id.to_string(),
        record_type: UsageRecordType::new(kind),
        size_bytes,
    }
}

/// A finished build pushed with an `image` exporter.
pub fn pushed_build(id: &str, image: &str, steps: (i32, i32, i32)) -> BuildHistoryEvent {
    let mut exporter = ExporterTarget {
        kind: "image".to_string(),
        ..Default::default()
    };
    exporter.attrs.insert("name".to_string(), image.to_string());
    BuildHistoryEvent {
        record_id: id.to_string(),
        exporters: vec![exporter],
        num_total_steps: steps.0,
        num_completed_steps: steps.1,
        num_cached_steps: steps.2,
        created_at: Some(Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()),
        completed_at: Some(Utc.with_ymd_and_hms(2024, 6, 1, 8, 2, 0).unwrap()),
        ..Default::default()
    }
}

/// A build with no exporter at all.
pub fn cache_only_build(id: &str) -> BuildHistoryEvent {
    BuildHistoryEvent {
        record_id: id.to_string(),
        num_total_steps: 2,
        num_completed_steps: 2,
        num_cached_steps: 2,
        ..Default::default()
    }
}
