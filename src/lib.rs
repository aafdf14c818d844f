//! # Buildkit Exporter
//!
//! Polls a BuildKit daemon's control API and turns its disk-usage and
//! build-history state into Prometheus metrics.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  HTTP GET /metrics → SCRAPE COORDINATOR (one at a time)               │
//! │     ├─ disk usage  → DiskUsageTallies ─┐                              │
//! │     └─ history     → HistoryTallies  ──┼→ CATALOG → METRICS SINK      │
//! │                       (image parser)   ┘                              │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every scrape is a full snapshot-and-recompute; nothing is carried between
//! scrapes except the scrape and warning counters.

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

pub mod catalog;
pub mod cli;
pub mod client;
pub mod config;
pub mod disk_usage;
pub mod error;
pub mod history;
pub mod image;
pub mod logging;
pub mod scrape;
pub mod server;
pub mod sink;

/// Exporter version
pub const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exporter name used in logs and version output
pub const EXPORTER_NAME: &str = "buildkit_exporter";

pub use catalog::{Catalog, MetricDescriptor, MetricId, MetricKind};
pub use client::{BuildClient, BuildHistoryEvent, DiskUsageRecord};
pub use config::ExporterConfig;
pub use error::{ExporterError, ExporterResult, ParseError, TransportError};
pub use image::ImageRef;
pub use scrape::{ScrapeCoordinator, ScrapeOutcome, ScrapeWarnings};
pub use sink::{MemorySink, MetricsSink, PrometheusSink};
