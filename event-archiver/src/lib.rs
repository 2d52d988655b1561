//! Event archiver: consumes JSON events from Kafka, batches them and writes
//! each batch as one immutable Parquet object to S3, committing offsets only
//! after the write succeeded (at-least-once).
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types with a cause chain, use formats that
//! include the full chain so root causes are visible in logs:
//!
//! - **Inline format:** `{e:#}` gives the full chain on one line (`outer: middle: root cause`).
//! - **Structured field:** `error = ?e` gives the full chain with `Caused by:` sections (Debug).
//!
//! When constructing errors, use `.context()` / `.with_context()` so the underlying error remains
//! the source.

pub mod accumulator;
pub mod config;
pub mod error;
pub mod ingestion;
pub mod kafka;
pub mod metrics_consts;
pub mod offset_tracker;
pub mod record;
pub mod service;
pub mod sink;
pub mod source;
pub mod test_utils;

pub use accumulator::{Batch, BatchAccumulator, BatchPolicy};
pub use ingestion::{IngestionConfig, IngestionLoop, IngestionReport, LoopState};
pub use offset_tracker::OffsetTracker;
pub use sink::StorageSink;
pub use source::{RecordSource, SourceMessage};
