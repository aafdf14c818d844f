//! Metrics sinks.
//!
//! A sink accepts descriptor registrations and then point samples whose
//! label values line up with the registered label names. Two sinks ship with
//! the crate:
//!
//! - [`PrometheusSink`]: a per-scrape `prometheus` registry rendered in the
//!   text exposition format.
//! - [`MemorySink`]: records samples in memory for tests and debugging.

use std::collections::HashMap;

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};

use crate::catalog::{MetricDescriptor, MetricKind};
use crate::error::SinkError;

/// Destination for scrape output.
///
/// Counter values are absolute: a sink lives for one scrape, so emitting a
/// counter reports its current total.
pub trait MetricsSink: Send {
    /// Declare a metric before any sample for it is emitted.
    fn register(&mut self, descriptor: &MetricDescriptor) -> Result<(), SinkError>;

    /// Record a gauge or counter value.
    fn emit(
        &mut self,
        descriptor: &MetricDescriptor,
        value: f64,
        label_values: &[String],
    ) -> Result<(), SinkError>;

    /// Record one histogram observation.
    fn observe(
        &mut self,
        descriptor: &MetricDescriptor,
        value: f64,
        label_values: &[String],
    ) -> Result<(), SinkError>;
}

fn check_labels(descriptor: &MetricDescriptor, label_values: &[String]) -> Result<(), SinkError> {
    if descriptor.label_names.len() != label_values.len() {
        return Err(SinkError::LabelMismatch {
            metric: descriptor.name.clone(),
            expected: descriptor.label_names.len(),
            got: label_values.len(),
        });
    }
    Ok(())
}

// ============================================================================
// SECTION 1: PROMETHEUS SINK
// ============================================================================

enum Collector {
    Gauge(Gauge),
    GaugeVec(GaugeVec),
    Counter(Counter),
    CounterVec(CounterVec),
    Histogram(Histogram),
    HistogramVec(HistogramVec),
}

/// Sink backed by a fresh `prometheus::Registry`.
pub struct PrometheusSink {
    registry: Registry,
    collectors: HashMap<String, Collector>,
}

impl std::fmt::Debug for PrometheusSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusSink")
            .field("metrics", &self.collectors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PrometheusSink {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            collectors: HashMap::new(),
        }
    }

    fn collector(&self, descriptor: &MetricDescriptor) -> Result<&Collector, SinkError> {
        self.collectors
            .get(&descriptor.name)
            .ok_or_else(|| SinkError::Unregistered {
                metric: descriptor.name.clone(),
            })
    }

    /// Render everything registered in the text exposition format.
    pub fn render(&self) -> Result<String, SinkError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| SinkError::Encode(e.to_string()))
    }
}

impl Default for PrometheusSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for PrometheusSink {
    fn register(&mut self, descriptor: &MetricDescriptor) -> Result<(), SinkError> {
        let names: Vec<&str> = descriptor.label_names.iter().map(String::as_str).collect();
        let opts = Opts::new(descriptor.name.as_str(), descriptor.help.as_str());

        let collector = match (descriptor.kind, names.is_empty()) {
            (MetricKind::Gauge, true) => {
                let gauge = Gauge::with_opts(opts)?;
                self.registry.register(Box::new(gauge.clone()))?;
                Collector::Gauge(gauge)
            }
            (MetricKind::Gauge, false) => {
                let gauge = GaugeVec::new(opts, &names)?;
                self.registry.register(Box::new(gauge.clone()))?;
                Collector::GaugeVec(gauge)
            }
            (MetricKind::Counter, true) => {
                let counter = Counter::with_opts(opts)?;
                self.registry.register(Box::new(counter.clone()))?;
                Collector::Counter(counter)
            }
            (MetricKind::Counter, false) => {
                let counter = CounterVec::new(opts, &names)?;
                self.registry.register(Box::new(counter.clone()))?;
                Collector::CounterVec(counter)
            }
            (MetricKind::Histogram, empty) => {
                let opts = HistogramOpts::new(descriptor.name.as_str(), descriptor.help.as_str())
                    .buckets(descriptor.buckets.clone());
                if empty {
                    let histogram = Histogram::with_opts(opts)?;
                    self.registry.register(Box::new(histogram.clone()))?;
                    Collector::Histogram(histogram)
                } else {
                    let histogram = HistogramVec::new(opts, &names)?;
                    self.registry.register(Box::new(histogram.clone()))?;
                    Collector::HistogramVec(histogram)
                }
            }
        };

        self.collectors.insert(descriptor.name.clone(), collector);
        Ok(())
    }

    fn emit(
        &mut self,
        descriptor: &MetricDescriptor,
        value: f64,
        label_values: &[String],
    ) -> Result<(), SinkError> {
        check_labels(descriptor, label_values)?;
        let values: Vec<&str> = label_values.iter().map(String::as_str).collect();

        match self.collector(descriptor)? {
            Collector::Gauge(gauge) => gauge.set(value),
            Collector::GaugeVec(gauge) => gauge.get_metric_with_label_values(&values)?.set(value),
            Collector::Counter(_) | Collector::CounterVec(_) if value < 0.0 => {
                return Err(SinkError::NegativeCounter {
                    metric: descriptor.name.clone(),
                    value,
                })
            }
            Collector::Counter(counter) => counter.inc_by(value),
            Collector::CounterVec(counter) => {
                counter.get_metric_with_label_values(&values)?.inc_by(value)
            }
            Collector::Histogram(_) | Collector::HistogramVec(_) => {
                return Err(SinkError::WrongKind {
                    metric: descriptor.name.clone(),
                    operation: "emit",
                })
            }
        }
        Ok(())
    }

    fn observe(
        &mut self,
        descriptor: &MetricDescriptor,
        value: f64,
        label_values: &[String],
    ) -> Result<(), SinkError> {
        check_labels(descriptor, label_values)?;
        let values: Vec<&str> = label_values.iter().map(String::as_str).collect();

        match self.collector(descriptor)? {
            Collector::Histogram(histogram) => histogram.observe(value),
            Collector::HistogramVec(histogram) => {
                histogram.get_metric_with_label_values(&values)?.observe(value)
            }
            _ => {
                return Err(SinkError::WrongKind {
                    metric: descriptor.name.clone(),
                    operation: "observe",
                })
            }
        }
        Ok(())
    }
}

// ============================================================================
// SECTION 2: IN-MEMORY SINK
// ============================================================================

/// How a sample was handed to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    Gauge,
    Counter,
    HistogramObservation,
}

/// One recorded point.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub metric_name: String,
    pub label_values: Vec<String>,
    pub value: f64,
    pub kind: SampleKind,
}

/// Records every sample in emission order.
#[derive(Debug, Default)]
pub struct MemorySink {
    registered: HashMap<String, MetricDescriptor>,
    samples: Vec<MetricSample>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> &[MetricSample] {
        &self.samples
    }

    pub fn samples_for(&self, metric_name: &str) -> Vec<&MetricSample> {
        self.samples
            .iter()
            .filter(|s| s.metric_name == metric_name)
            .collect()
    }

    /// Last value recorded for an exact label set.
    pub fn value(&self, metric_name: &str, label_values: &[&str]) -> Option<f64> {
        self.samples
            .iter()
            .rev()
            .find(|s| {
                s.metric_name == metric_name
                    && s.label_values.iter().map(String::as_str).eq(label_values.iter().copied())
            })
            .map(|s| s.value)
    }

    pub fn is_registered(&self, metric_name: &str) -> bool {
        self.registered.contains_key(metric_name)
    }

    fn record(
        &mut self,
        descriptor: &MetricDescriptor,
        value: f64,
        label_values: &[String],
        kind: SampleKind,
    ) -> Result<(), SinkError> {
        if !self.registered.contains_key(&descriptor.name) {
            return Err(SinkError::Unregistered {
                metric: descriptor.name.clone(),
            });
        }
        check_labels(descriptor, label_values)?;
        self.samples.push(MetricSample {
            metric_name: descriptor.name.clone(),
            label_values: label_values.to_vec(),
            value,
            kind,
        });
        Ok(())
    }
}

impl MetricsSink for MemorySink {
    fn register(&mut self, descriptor: &MetricDescriptor) -> Result<(), SinkError> {
        self.registered
            .insert(descriptor.name.clone(), descriptor.clone());
        Ok(())
    }

    fn emit(
        &mut self,
        descriptor: &MetricDescriptor,
        value: f64,
        label_values: &[String],
    ) -> Result<(), SinkError> {
        let kind = match descriptor.kind {
            MetricKind::Gauge => SampleKind::Gauge,
            MetricKind::Counter if value < 0.0 => {
                return Err(SinkError::NegativeCounter {
                    metric: descriptor.name.clone(),
                    value,
                })
            }
            MetricKind::Counter => SampleKind::Counter,
            MetricKind::Histogram => {
                return Err(SinkError::WrongKind {
                    metric: descriptor.name.clone(),
                    operation: "emit",
                })
            }
        };
        self.record(descriptor, value, label_values, kind)
    }

    fn observe(
        &mut self,
        descriptor: &MetricDescriptor,
        value: f64,
        label_values: &[String],
    ) -> Result<(), SinkError> {
        if descriptor.kind != MetricKind::Histogram {
            return Err(SinkError::WrongKind {
                metric: descriptor.name.clone(),
                operation: "observe",
            });
        }
        self.record(descriptor, value, label_values, SampleKind::HistogramObservation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, kind: MetricKind, labels: &[&str]) -> MetricDescriptor {
        MetricDescriptor {
            name: name.into(),
            help: format!("{} help", name),
            kind,
            label_names: labels.iter().map(|l| l.to_string()).collect(),
            buckets: vec![1.0, 5.0],
        }
    }

    fn values(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_prometheus_render() {
        let gauge = descriptor("buildkit_cache_objects_count", MetricKind::Gauge, &["type"]);
        let counter = descriptor("buildkit_exporter_scrapes_total", MetricKind::Counter, &[]);
        let histogram = descriptor("buildkit_build_duration_seconds", MetricKind::Histogram, &["status"]);

        let mut sink = PrometheusSink::new();
        for d in [&gauge, &counter, &histogram] {
            sink.register(d).unwrap();
        }
        sink.emit(&gauge, 3.0, &values(&["regular"])).unwrap();
        sink.emit(&counter, 7.0, &[]).unwrap();
        sink.observe(&histogram, 2.5, &values(&["success"])).unwrap();

        let text = sink.render().unwrap();
        assert!(text.contains("# TYPE buildkit_cache_objects_count gauge"));
        assert!(text.contains("buildkit_cache_objects_count{type=\"regular\"} 3"));
        assert!(text.contains("buildkit_exporter_scrapes_total 7"));
        assert!(text.contains("buildkit_build_duration_seconds_bucket{status=\"success\",le=\"5\"} 1"));
        assert!(text.contains("buildkit_build_duration_seconds_count{status=\"success\"} 1"));
    }

    #[test]
    fn test_prometheus_rejects_bad_samples() {
        let gauge = descriptor("g", MetricKind::Gauge, &["type"]);
        let counter = descriptor("c", MetricKind::Counter, &[]);
        let mut sink = PrometheusSink::new();

        assert!(matches!(
            sink.emit(&gauge, 1.0, &values(&["x"])),
            Err(SinkError::Unregistered { .. })
        ));

        sink.register(&gauge).unwrap();
        sink.register(&counter).unwrap();
        assert!(matches!(
            sink.emit(&gauge, 1.0, &[]),
            Err(SinkError::LabelMismatch { expected: 1, got: 0, .. })
        ));
        assert!(matches!(
            sink.emit(&counter, -1.0, &[]),
            Err(SinkError::NegativeCounter { .. })
        ));
        assert!(matches!(
            sink.observe(&gauge, 1.0, &values(&["x"])),
            Err(SinkError::WrongKind { .. })
        ));
    }

    #[test]
    fn test_memory_sink_records_in_order() {
        let gauge = descriptor("buildkit_up", MetricKind::Gauge, &[]);
        let histogram = descriptor("h", MetricKind::Histogram, &["status"]);
        let mut sink = MemorySink::new();
        sink.register(&gauge).unwrap();
        sink.register(&histogram).unwrap();

        sink.emit(&gauge, 0.0, &[]).unwrap();
        sink.emit(&gauge, 1.0, &[]).unwrap();
        sink.observe(&histogram, 12.0, &values(&["failed"])).unwrap();

        assert_eq!(sink.samples().len(), 3);
        assert_eq!(sink.value("buildkit_up", &[]), Some(1.0));
        assert_eq!(sink.value("h", &["failed"]), Some(12.0));
        assert_eq!(sink.samples_for("h")[0].kind, SampleKind::HistogramObservation);
        assert!(sink.emit(&histogram, 1.0, &values(&["x"])).is_err());
    }
}
