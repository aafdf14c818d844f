//! Scrape Coordinator and metric emission.
//!
//! One scrape = one exclusive pass: bump the scrape counter, fetch disk
//! usage, drain history, run every catalog entry against the tally it reads,
//! then report `buildkit_up` and the exporter's own counters.
//!
//! Sources fail independently. A transport failure in one source suppresses
//! only the entries fed by that source, but any failure turns `up` to 0.

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, warn, Instrument};

use crate::catalog::{Aggregation, Catalog, LabeledValue, MetricDescriptor, MetricKind};
use crate::client::BuildClient;
use crate::disk_usage::{self, DiskUsageTallies};
use crate::error::{ParseError, SinkError, TransportError};
use crate::history::{self, HistoryTallies, StepInconsistency};
use crate::logging::TARGET_SCRAPE;
use crate::sink::MetricsSink;
use crate::EXPORTER_VERSION;

// ============================================================================
// SECTION 1: WARNINGS & OUTCOME
// ============================================================================

/// A soft problem found during a scrape. Never affects `up`.
#[derive(Debug)]
pub enum ScrapeWarning {
    Parse(ParseError),
    StepCounts(StepInconsistency),
    Sink(SinkError),
}

impl Display for ScrapeWarning {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ScrapeWarning::Parse(e) => e.fmt(f),
            ScrapeWarning::StepCounts(e) => e.fmt(f),
            ScrapeWarning::Sink(e) => e.fmt(f),
        }
    }
}

/// All warnings of one scrape, surfaced as a single error value.
#[derive(Debug, Default)]
pub struct ScrapeWarnings(Vec<ScrapeWarning>);

impl ScrapeWarnings {
    pub fn push(&mut self, warning: ScrapeWarning) {
        self.0.push(warning);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScrapeWarning> {
        self.0.iter()
    }
}

impl Display for ScrapeWarnings {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (i, warning) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            warning.fmt(f)?;
        }
        Ok(())
    }
}

impl std::error::Error for ScrapeWarnings {}

/// Where a hard failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    DiskUsage,
    History,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::DiskUsage => "disk_usage",
            Source::History => "history",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    pub source: Source,
    pub error: TransportError,
}

/// Result of one [`ScrapeCoordinator::execute_scrape`] call.
#[derive(Debug)]
pub struct ScrapeOutcome {
    pub up: bool,
    /// Scrape counter value including this scrape.
    pub total_scrape_count: u64,
    pub warnings: ScrapeWarnings,
    pub failures: Vec<SourceFailure>,
}

impl ScrapeOutcome {
    /// Joined warnings, or `None` for a clean scrape.
    pub fn warnings_error(&self) -> Option<&ScrapeWarnings> {
        (!self.warnings.is_empty()).then_some(&self.warnings)
    }
}

// ============================================================================
// SECTION 2: COORDINATOR
// ============================================================================

#[derive(Debug, Default)]
struct ScrapeCounters {
    total_scrapes: u64,
    warnings_total: u64,
}

/// Serializes scrapes against one build client.
pub struct ScrapeCoordinator {
    client: Arc<dyn BuildClient>,
    catalog: Arc<Catalog>,
    early_exit: bool,
    counters: Mutex<ScrapeCounters>,
}

impl fmt::Debug for ScrapeCoordinator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScrapeCoordinator")
            .field("endpoint", &self.client.endpoint())
            .field("early_exit", &self.early_exit)
            .finish()
    }
}

impl ScrapeCoordinator {
    pub fn new(client: Arc<dyn BuildClient>, catalog: Arc<Catalog>, early_exit: bool) -> Self {
        Self {
            client,
            catalog,
            early_exit,
            counters: Mutex::new(ScrapeCounters::default()),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Run one scrape into `sink`. Concurrent callers wait for the running
    /// scrape to finish; the counter is bumped before any fetch, so it
    /// advances on failures too.
    pub async fn execute_scrape(
        &self,
        cancel: &CancellationToken,
        sink: &mut dyn MetricsSink,
    ) -> ScrapeOutcome {
        let mut counters = self.counters.lock().await;
        counters.total_scrapes += 1;
        let scrape = counters.total_scrapes;

        async move {
            let started = Instant::now();
            let mut failures = Vec::new();
            let mut warnings = ScrapeWarnings::default();

            let disk = match disk_usage::collect(self.client.as_ref(), cancel).await {
                Ok(tallies) => Some(tallies),
                Err(error) => {
                    failures.push(SourceFailure {
                        source: Source::DiskUsage,
                        error,
                    });
                    None
                }
            };

            let history =
                match history::drain(self.client.as_ref(), cancel, self.early_exit).await {
                    Ok(events) => Some(HistoryTallies::aggregate(
                        &events,
                        self.catalog.include_labels(),
                    )),
                    Err(error) => {
                        failures.push(SourceFailure {
                            source: Source::History,
                            error,
                        });
                        None
                    }
                };

            // A cancelled scrape emits no tallies, not even from a source
            // that finished before the cancel.
            let cancelled = failures.iter().any(|f| f.error.is_cancelled());
            if cancelled {
                debug!(
                    target: TARGET_SCRAPE,
                    "Scrape cancelled, discarding collected tallies"
                );
            } else {
                if let Some(tallies) = &history {
                    for err in &tallies.parse_errors {
                        warnings.push(ScrapeWarning::Parse(err.clone()));
                    }
                    for inconsistency in &tallies.inconsistencies {
                        warnings.push(ScrapeWarning::StepCounts(inconsistency.clone()));
                    }
                }
                self.emit_entries(sink, disk.as_ref(), history.as_ref(), &mut warnings);
            }

            for failure in &failures {
                error!(
                    target: TARGET_SCRAPE,
                    source = failure.source.as_str(),
                    category = failure.error.category(),
                    error = %failure.error,
                    "Error fetching metrics from Buildkit"
                );
            }

            let up = failures.is_empty();
            let catalog = &self.catalog;
            let version = [EXPORTER_VERSION.to_string()];
            for (descriptor, value, labels) in [
                (&catalog.up, if up { 1.0 } else { 0.0 }, &[][..]),
                (&catalog.scrapes_total, scrape as f64, &[][..]),
                (&catalog.build_info, 1.0, &version[..]),
            ] {
                if let Err(e) = sink.emit(descriptor, value, labels) {
                    warnings.push(ScrapeWarning::Sink(e));
                }
            }

            counters.warnings_total += warnings.len() as u64;
            if let Err(e) = sink.emit(
                &catalog.scrape_warnings_total,
                counters.warnings_total as f64,
                &[],
            ) {
                warnings.push(ScrapeWarning::Sink(e));
            }

            if !warnings.is_empty() {
                warn!(
                    target: TARGET_SCRAPE,
                    count = warnings.len(),
                    "Scrape completed with warnings:\n{}",
                    warnings
                );
            }
            debug!(
                target: TARGET_SCRAPE,
                up,
                duration_ms = started.elapsed().as_millis() as u64,
                "Scrape finished"
            );

            ScrapeOutcome {
                up,
                total_scrape_count: scrape,
                warnings,
                failures,
            }
        }
        .instrument(info_span!(target: TARGET_SCRAPE, "scrape", scrape))
        .await
    }

    /// Hand every catalog entry whose source succeeded to the sink.
    fn emit_entries(
        &self,
        sink: &mut dyn MetricsSink,
        disk: Option<&DiskUsageTallies>,
        history: Option<&HistoryTallies>,
        warnings: &mut ScrapeWarnings,
    ) {
        for entry in self.catalog.entries() {
            let values = match entry.aggregation {
                Aggregation::DiskUsage(aggregate) => disk.map(aggregate),
                Aggregation::History(aggregate) => history.map(aggregate),
            };
            let Some(values) = values else {
                continue;
            };
            for value in values {
                if let Err(e) = emit_value(sink, &entry.descriptor, &value) {
                    warnings.push(ScrapeWarning::Sink(e));
                }
            }
        }
    }
}

fn emit_value(
    sink: &mut dyn MetricsSink,
    descriptor: &MetricDescriptor,
    value: &LabeledValue,
) -> Result<(), SinkError> {
    match descriptor.kind {
        MetricKind::Histogram => sink.observe(descriptor, value.value, &value.label_values),
        MetricKind::Gauge | MetricKind::Counter => {
            sink.emit(descriptor, value.value, &value.label_values)
        }
    }
}
