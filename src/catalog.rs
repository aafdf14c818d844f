//! Metric Catalog.
//!
//! A fixed table pairing each metric's descriptor with the tally it is
//! computed from. The catalog is built once at startup from
//! [`MetricsConfig`] and shared immutably with the scrape coordinator.
//!
//! Label order in every descriptor is part of the exported contract: the
//! aggregation functions below emit label values in exactly that order.

use crate::config::MetricsConfig;
use crate::disk_usage::DiskUsageTallies;
use crate::error::{ConfigError, SinkError};
use crate::history::HistoryTallies;
use crate::image::IMAGE_LABELS;
use crate::sink::MetricsSink;

/// Prefix for labels copied from frontend attributes.
pub const INCLUDE_LABEL_PREFIX: &str = "label_";

// ============================================================================
// SECTION 1: DESCRIPTORS
// ============================================================================

/// Metrics computed from build-engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricId {
    BuildHistories,
    BuildSteps,
    CacheObjectSizeBytes,
    CacheObjectCount,
    BuildDuration,
}

impl MetricId {
    pub const ALL: [MetricId; 5] = [
        MetricId::BuildHistories,
        MetricId::BuildSteps,
        MetricId::CacheObjectSizeBytes,
        MetricId::CacheObjectCount,
        MetricId::BuildDuration,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Gauge,
    Counter,
    Histogram,
}

/// Name, help text, kind and ordered label schema of one metric.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDescriptor {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub label_names: Vec<String>,
    /// Histogram bucket bounds; empty for other kinds.
    pub buckets: Vec<f64>,
}

impl MetricDescriptor {
    fn new(name: &str, help: &str, kind: MetricKind, label_names: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            kind,
            label_names,
            buckets: Vec::new(),
        }
    }
}

/// Map an arbitrary frontend label name onto the Prometheus label charset.
pub fn sanitize_label_name(raw: &str) -> String {
    let mut sanitized: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if sanitized.starts_with(|c: char| c.is_ascii_digit()) {
        sanitized.insert(0, '_');
    }
    sanitized
}

// ============================================================================
// SECTION 2: DISPATCH TABLE
// ============================================================================

/// One labeled value produced by an aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledValue {
    pub label_values: Vec<String>,
    pub value: f64,
}

/// The tally an entry reads and the function that turns it into samples.
#[derive(Debug, Clone, Copy)]
pub enum Aggregation {
    DiskUsage(fn(&DiskUsageTallies) -> Vec<LabeledValue>),
    History(fn(&HistoryTallies) -> Vec<LabeledValue>),
}

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub id: MetricId,
    pub descriptor: MetricDescriptor,
    pub aggregation: Aggregation,
}

/// Immutable metric table plus the coordinator's own descriptors.
#[derive(Debug, Clone)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
    include_labels: Vec<String>,
    pub up: MetricDescriptor,
    pub scrapes_total: MetricDescriptor,
    pub scrape_warnings_total: MetricDescriptor,
    pub build_info: MetricDescriptor,
}

impl Catalog {
    pub fn new(config: &MetricsConfig) -> Result<Self, ConfigError> {
        let mut extra: Vec<String> = Vec::with_capacity(config.include_labels.len());
        for raw in &config.include_labels {
            let label = format!("{}{}", INCLUDE_LABEL_PREFIX, sanitize_label_name(raw));
            if extra.contains(&label) {
                return Err(ConfigError::invalid_value(
                    "metrics.include_labels",
                    format!("'{}' maps to duplicate label '{}'", raw, label),
                ));
            }
            extra.push(label);
        }

        let image_and = |fixed: &[&str]| -> Vec<String> {
            IMAGE_LABELS
                .iter()
                .chain(fixed)
                .map(|l| l.to_string())
                .chain(extra.iter().cloned())
                .collect()
        };

        let mut duration = MetricDescriptor::new(
            "buildkit_build_duration_seconds",
            "Time taken to complete an image build.",
            MetricKind::Histogram,
            image_and(&["exporter_type", "status"]),
        );
        duration.buckets = config.duration_buckets.clone();

        let entries = vec![
            CatalogEntry {
                id: MetricId::BuildHistories,
                descriptor: MetricDescriptor::new(
                    "buildkit_build_histories",
                    "Count of build histories that have not yet been pruned.",
                    MetricKind::Gauge,
                    image_and(&["exporter_type"]),
                ),
                aggregation: Aggregation::History(build_histories),
            },
            CatalogEntry {
                id: MetricId::BuildSteps,
                descriptor: MetricDescriptor::new(
                    "buildkit_build_steps",
                    "Count of per-image build steps in histories that have not yet been pruned.",
                    MetricKind::Gauge,
                    image_and(&["count"]),
                ),
                aggregation: Aggregation::History(build_steps),
            },
            CatalogEntry {
                id: MetricId::CacheObjectSizeBytes,
                descriptor: MetricDescriptor::new(
                    "buildkit_cache_objects_size_bytes",
                    "Total bytes used by cache objects of each type that have not yet been pruned.",
                    MetricKind::Gauge,
                    vec!["type".to_string()],
                ),
                aggregation: Aggregation::DiskUsage(cache_object_sizes),
            },
            CatalogEntry {
                id: MetricId::CacheObjectCount,
                descriptor: MetricDescriptor::new(
                    "buildkit_cache_objects_count",
                    "Count of cache objects of each type that have not yet been pruned.",
                    MetricKind::Gauge,
                    vec!["type".to_string()],
                ),
                aggregation: Aggregation::DiskUsage(cache_object_counts),
            },
            CatalogEntry {
                id: MetricId::BuildDuration,
                descriptor: duration,
                aggregation: Aggregation::History(build_durations),
            },
        ];

        Ok(Self {
            entries,
            include_labels: config.include_labels.clone(),
            up: MetricDescriptor::new(
                "buildkit_up",
                "Was the last scrape of Buildkit successful.",
                MetricKind::Gauge,
                Vec::new(),
            ),
            scrapes_total: MetricDescriptor::new(
                "buildkit_exporter_scrapes_total",
                "Current total Buildkit scrapes.",
                MetricKind::Counter,
                Vec::new(),
            ),
            scrape_warnings_total: MetricDescriptor::new(
                "buildkit_exporter_scrape_warnings_total",
                "Soft warnings (malformed image references, inconsistent step counts) raised by scrapes.",
                MetricKind::Counter,
                Vec::new(),
            ),
            build_info: MetricDescriptor::new(
                "buildkit_exporter_build_info",
                "Buildkit exporter build information.",
                MetricKind::Gauge,
                vec!["version".to_string()],
            ),
        })
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// Frontend label names copied onto history metrics, as configured.
    pub fn include_labels(&self) -> &[String] {
        &self.include_labels
    }

    pub fn entry(&self, id: MetricId) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Every descriptor the exporter can emit.
    pub fn descriptors(&self) -> impl Iterator<Item = &MetricDescriptor> {
        self.entries.iter().map(|e| &e.descriptor).chain([
            &self.up,
            &self.scrapes_total,
            &self.scrape_warnings_total,
            &self.build_info,
        ])
    }

    pub fn register_all(&self, sink: &mut dyn MetricsSink) -> Result<(), SinkError> {
        for descriptor in self.descriptors() {
            sink.register(descriptor)?;
        }
        Ok(())
    }
}

// ============================================================================
// SECTION 3: AGGREGATION FUNCTIONS
// ============================================================================

fn labels<'a>(parts: impl IntoIterator<Item = &'a str>, extra: &[String]) -> Vec<String> {
    parts
        .into_iter()
        .map(str::to_string)
        .chain(extra.iter().cloned())
        .collect()
}

fn build_histories(tallies: &HistoryTallies) -> Vec<LabeledValue> {
    tallies
        .counts
        .iter()
        .map(|(key, count)| LabeledValue {
            label_values: labels(
                key.image.iter().map(String::as_str).chain([key.exporter_type.as_str()]),
                &key.extra,
            ),
            value: *count as f64,
        })
        .collect()
}

fn build_steps(tallies: &HistoryTallies) -> Vec<LabeledValue> {
    tallies
        .steps
        .iter()
        .map(|(key, total)| LabeledValue {
            label_values: labels(
                key.image.iter().map(String::as_str).chain([key.bucket.as_str()]),
                &key.extra,
            ),
            value: *total as f64,
        })
        .collect()
}

fn build_durations(tallies: &HistoryTallies) -> Vec<LabeledValue> {
    tallies
        .durations
        .iter()
        .map(|obs| LabeledValue {
            label_values: labels(
                obs.image
                    .iter()
                    .map(String::as_str)
                    .chain([obs.exporter_type.as_str(), obs.status.as_str()]),
                &obs.extra,
            ),
            value: obs.seconds,
        })
        .collect()
}

fn cache_object_sizes(tallies: &DiskUsageTallies) -> Vec<LabeledValue> {
    tallies
        .size_by_type
        .iter()
        .map(|(kind, size)| LabeledValue {
            label_values: vec![kind.to_string()],
            value: *size as f64,
        })
        .collect()
}

fn cache_object_counts(tallies: &DiskUsageTallies) -> Vec<LabeledValue> {
    tallies
        .count_by_type
        .iter()
        .map(|(kind, count)| LabeledValue {
            label_values: vec![kind.to_string()],
            value: *count as f64,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{DiskUsageRecord, UsageRecordType};
    use crate::history::{CountKey, StepBucket, StepKey};
    use crate::sink::MemorySink;
    use pretty_assertions::assert_eq;

    fn names(descriptor: &MetricDescriptor) -> Vec<&str> {
        descriptor.label_names.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_label_schemas() {
        let catalog = Catalog::new(&MetricsConfig::default()).unwrap();

        let schema = |id| names(&catalog.entry(id).unwrap().descriptor);
        assert_eq!(
            schema(MetricId::BuildHistories),
            ["registry", "path", "name", "tag", "exporter_type"]
        );
        assert_eq!(schema(MetricId::BuildSteps), ["registry", "path", "name", "tag", "count"]);
        assert_eq!(schema(MetricId::CacheObjectSizeBytes), ["type"]);
        assert_eq!(schema(MetricId::CacheObjectCount), ["type"]);
        assert_eq!(
            schema(MetricId::BuildDuration),
            ["registry", "path", "name", "tag", "exporter_type", "status"]
        );
        assert_eq!(catalog.entries().len(), MetricId::ALL.len());
        assert_eq!(
            catalog.entry(MetricId::BuildDuration).unwrap().descriptor.buckets.len(),
            13
        );
    }

    #[test]
    fn test_include_labels_appended() {
        let config = MetricsConfig {
            include_labels: vec!["team".into(), "git.sha".into()],
            ..Default::default()
        };
        let catalog = Catalog::new(&config).unwrap();

        for id in [MetricId::BuildHistories, MetricId::BuildSteps, MetricId::BuildDuration] {
            let schema = names(&catalog.entry(id).unwrap().descriptor);
            assert_eq!(&schema[schema.len() - 2..], ["label_team", "label_git_sha"]);
        }
        assert_eq!(names(&catalog.entry(MetricId::CacheObjectCount).unwrap().descriptor), ["type"]);
    }

    #[test]
    fn test_duplicate_include_labels_rejected() {
        let config = MetricsConfig {
            include_labels: vec!["a-b".into(), "a.b".into()],
            ..Default::default()
        };
        assert!(Catalog::new(&config).is_err());
    }

    #[test]
    fn test_sanitize_label_name() {
        assert_eq!(sanitize_label_name("team"), "team");
        assert_eq!(sanitize_label_name("org.opencontainers.image/source"), "org_opencontainers_image_source");
        assert_eq!(sanitize_label_name("1st"), "_1st");
    }

    #[test]
    fn test_values_follow_schema_order() {
        let mut tallies = HistoryTallies::default();
        let image = ["docker.io", "library", "alpine", "3.18"].map(String::from);
        tallies.counts.insert(
            CountKey {
                exporter_type: "image".into(),
                image: image.clone(),
                extra: vec!["platform".into()],
            },
            3,
        );
        tallies.steps.insert(
            StepKey {
                bucket: StepBucket::Uncached,
                image,
                extra: vec!["platform".into()],
            },
            4,
        );

        assert_eq!(
            build_histories(&tallies),
            vec![LabeledValue {
                label_values: ["docker.io", "library", "alpine", "3.18", "image", "platform"]
                    .map(String::from)
                    .to_vec(),
                value: 3.0,
            }]
        );
        assert_eq!(
            build_steps(&tallies)[0].label_values,
            ["docker.io", "library", "alpine", "3.18", "uncached", "platform"].map(String::from)
        );
    }

    #[test]
    fn test_disk_usage_functions() {
        let tallies = DiskUsageTallies::aggregate(&[
            DiskUsageRecord {
                id: "a".into(),
                record_type: UsageRecordType::new("regular"),
                size_bytes: 2048,
            },
            DiskUsageRecord {
                id: "b".into(),
                record_type: UsageRecordType::new("regular"),
                size_bytes: 1024,
            },
        ]);
        assert_eq!(cache_object_sizes(&tallies)[0].value, 3072.0);
        assert_eq!(cache_object_counts(&tallies)[0].value, 2.0);
    }

    #[test]
    fn test_register_all() {
        let catalog = Catalog::new(&MetricsConfig::default()).unwrap();
        let mut sink = MemorySink::new();
        catalog.register_all(&mut sink).unwrap();

        for name in [
            "buildkit_build_histories",
            "buildkit_build_steps",
            "buildkit_cache_objects_size_bytes",
            "buildkit_cache_objects_count",
            "buildkit_build_duration_seconds",
            "buildkit_up",
            "buildkit_exporter_scrapes_total",
            "buildkit_exporter_scrape_warnings_total",
            "buildkit_exporter_build_info",
        ] {
            assert!(sink.is_registered(name), "{name}");
        }
    }
}
