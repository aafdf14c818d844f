//! History Aggregator.
//!
//! Drains the build-history stream once per scrape and groups the records
//! into three tallies: build counts, step counts and build durations. Image
//! references are decomposed here, so every tally key already carries the
//! label values it will be emitted with.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display, Formatter};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::client::{BuildClient, BuildHistoryEvent};
use crate::error::{ParseError, TransportError};
use crate::image::ImageRef;
use crate::logging::{TARGET_CLIENT, TARGET_SCRAPE};

/// Exporter type used for builds that pushed nowhere.
pub const CACHE_ONLY_EXPORTER: &str = "cache-only";

/// Image reference used for builds that pushed nowhere.
pub const UNDEFINED_IMAGE: &str = "undefined";

/// Frontend attribute prefix carrying user build labels.
pub const FRONTEND_LABEL_PREFIX: &str = "label:";

/// Decomposed image labels in `registry, path, name, tag` order.
pub type ImageLabels = [String; 4];

// ============================================================================
// SECTION 1: STREAM DRAIN
// ============================================================================

/// Consume the history stream to its end.
///
/// Nothing is returned until end-of-stream, so callers never see a partially
/// drained snapshot. Cancellation or a transport error discards everything
/// read so far.
pub async fn drain(
    client: &dyn BuildClient,
    cancel: &CancellationToken,
    early_exit: bool,
) -> Result<Vec<BuildHistoryEvent>, TransportError> {
    let mut stream = client.stream_history(cancel, early_exit).await?;
    let mut events = Vec::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            next = stream.next() => match next {
                Some(event) => events.push(event?),
                None => break,
            },
        }
    }

    debug!(
        target: TARGET_CLIENT,
        endpoint = %client.endpoint(),
        events = events.len(),
        "History stream drained"
    );
    Ok(events)
}

// ============================================================================
// SECTION 2: STEP COUNTS
// ============================================================================

/// Step bucket reported by `buildkit_build_steps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StepBucket {
    Cached,
    Completed,
    Total,
    Uncached,
    Failed,
}

impl StepBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepBucket::Cached => "cached",
            StepBucket::Completed => "completed",
            StepBucket::Total => "total",
            StepBucket::Uncached => "uncached",
            StepBucket::Failed => "failed",
        }
    }
}

/// Raw step counters of one build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepCounts {
    pub total: i64,
    pub completed: i64,
    pub cached: i64,
}

impl StepCounts {
    pub fn from_event(event: &BuildHistoryEvent) -> Self {
        Self {
            total: i64::from(event.num_total_steps),
            completed: i64::from(event.num_completed_steps),
            cached: i64::from(event.num_cached_steps),
        }
    }

    /// `total >= completed >= cached >= 0`
    pub fn is_consistent(&self) -> bool {
        self.total >= self.completed && self.completed >= self.cached && self.cached >= 0
    }

    pub fn failed(&self) -> i64 {
        self.total - self.completed
    }

    pub fn uncached(&self) -> i64 {
        self.total - self.failed() - self.cached
    }

    /// Per-bucket values, or `None` when the counters contradict each other.
    pub fn buckets(&self) -> Option<[(StepBucket, i64); 5]> {
        if !self.is_consistent() {
            return None;
        }
        Some([
            (StepBucket::Cached, self.cached),
            (StepBucket::Completed, self.completed),
            (StepBucket::Total, self.total),
            (StepBucket::Uncached, self.uncached()),
            (StepBucket::Failed, self.failed()),
        ])
    }
}

/// A build whose step counters failed the consistency check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepInconsistency {
    pub record_id: String,
    pub counts: StepCounts,
}

impl Display for StepInconsistency {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Inconsistent step counts for build '{}': total={} completed={} cached={}",
            self.record_id, self.counts.total, self.counts.completed, self.counts.cached
        )
    }
}

// ============================================================================
// SECTION 3: TALLIES
// ============================================================================

/// Outcome of a finished build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BuildStatus {
    Success,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Success => "success",
            BuildStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CountKey {
    pub exporter_type: String,
    pub image: ImageLabels,
    /// Include-label values in configuration order.
    pub extra: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StepKey {
    pub bucket: StepBucket,
    pub image: ImageLabels,
    pub extra: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DurationObservation {
    pub image: ImageLabels,
    pub exporter_type: String,
    pub status: BuildStatus,
    pub extra: Vec<String>,
    pub seconds: f64,
}

/// Everything one scrape learns from the history stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryTallies {
    pub counts: BTreeMap<CountKey, u64>,
    pub steps: BTreeMap<StepKey, i64>,
    pub durations: Vec<DurationObservation>,
    /// One entry per distinct malformed image reference.
    pub parse_errors: Vec<ParseError>,
    pub inconsistencies: Vec<StepInconsistency>,
}

impl HistoryTallies {
    /// Group a fully drained history snapshot.
    ///
    /// Builds whose image reference fails to parse are left out of every
    /// tally; the failure is recorded once per distinct reference.
    pub fn aggregate(events: &[BuildHistoryEvent], include_labels: &[String]) -> Self {
        let mut tallies = HistoryTallies::default();
        let mut images: HashMap<&str, Option<ImageLabels>> = HashMap::new();

        for event in events {
            let extra = include_values(event, include_labels);

            let Some(exporter) = event.primary_exporter() else {
                let image = tallies.image_labels(&mut images, UNDEFINED_IMAGE);
                if let Some(image) = image {
                    *tallies
                        .counts
                        .entry(CountKey {
                            exporter_type: CACHE_ONLY_EXPORTER.to_string(),
                            image,
                            extra,
                        })
                        .or_insert(0) += 1;
                }
                continue;
            };

            let Some(image) = tallies.image_labels(&mut images, exporter.image_name()) else {
                continue;
            };

            *tallies
                .counts
                .entry(CountKey {
                    exporter_type: exporter.kind.clone(),
                    image: image.clone(),
                    extra: extra.clone(),
                })
                .or_insert(0) += 1;

            let counts = StepCounts::from_event(event);
            match counts.buckets() {
                Some(buckets) => {
                    for (bucket, value) in buckets {
                        *tallies
                            .steps
                            .entry(StepKey {
                                bucket,
                                image: image.clone(),
                                extra: extra.clone(),
                            })
                            .or_insert(0) += value;
                    }
                }
                None => tallies.inconsistencies.push(StepInconsistency {
                    record_id: event.record_id.clone(),
                    counts,
                }),
            }

            if let Some(seconds) = elapsed_seconds(event) {
                tallies.durations.push(DurationObservation {
                    image,
                    exporter_type: exporter.kind.clone(),
                    status: if event.failed() {
                        BuildStatus::Failed
                    } else {
                        BuildStatus::Success
                    },
                    extra,
                    seconds,
                });
            }
        }

        trace!(
            target: TARGET_SCRAPE,
            counts = tallies.counts.len(),
            steps = tallies.steps.len(),
            durations = tallies.durations.len(),
            "History aggregated"
        );
        tallies
    }

    /// Parse `fqn` once per snapshot. `None` means the reference is
    /// malformed and its builds are skipped.
    fn image_labels<'a>(
        &mut self,
        cache: &mut HashMap<&'a str, Option<ImageLabels>>,
        fqn: &'a str,
    ) -> Option<ImageLabels> {
        if let Some(cached) = cache.get(fqn) {
            return cached.clone();
        }
        let labels = match ImageRef::parse(fqn) {
            Ok(image) => Some(ImageRef::values_or_empty(image.as_ref())),
            Err(err) => {
                self.parse_errors.push(err);
                None
            }
        };
        cache.insert(fqn, labels.clone());
        labels
    }
}

/// Values of the configured `label:<name>` frontend attributes; missing
/// attributes yield an empty value.
pub fn include_values(event: &BuildHistoryEvent, include_labels: &[String]) -> Vec<String> {
    include_labels
        .iter()
        .map(|name| {
            event
                .frontend_attrs
                .get(&format!("{}{}", FRONTEND_LABEL_PREFIX, name))
                .cloned()
                .unwrap_or_default()
        })
        .collect()
}

/// Wall-clock build time; `None` while running or when the clock went
/// backwards.
fn elapsed_seconds(event: &BuildHistoryEvent) -> Option<f64> {
    let (created, completed) = (event.created_at?, event.completed_at?);
    let millis = (completed - created).num_milliseconds();
    (millis >= 0).then(|| millis as f64 / 1000.0)
}
