//! The ingestion loop: queue → accumulator → storage sink → offset commit.
//!
//! Everything runs on one task. Polling, the flush timer and the shutdown
//! signal are branches of a single `select!`, and a flush is awaited before
//! the next poll, so commits always follow queue order and offsets only move
//! after the covering object is durably written.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use health::{ComponentStatus, HealthHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::accumulator::{BatchAccumulator, BatchPolicy};
use crate::error::{IngestionError, SinkError};
use crate::kafka::types::Partition;
use crate::metrics_consts::{
    BATCHES_FLUSHED, BATCH_AGE, BATCH_SIZE, BUFFERED_RECORDS, LOOP_STATE, MESSAGES_DROPPED,
    MESSAGES_RECEIVED, OFFSET_COMMITS,
};
use crate::offset_tracker::OffsetTracker;
use crate::record::Record;
use crate::sink::{ObjectPath, StorageSink};
use crate::source::{RecordSource, SourceMessage};

const MAX_POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Starting,
    Running,
    Draining,
    Stopped,
    Failed,
}

impl LoopState {
    fn as_gauge(self) -> f64 {
        match self {
            LoopState::Starting => 0.0,
            LoopState::Running => 1.0,
            LoopState::Draining => 2.0,
            LoopState::Stopped => 3.0,
            LoopState::Failed => 4.0,
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Starting => "starting",
            LoopState::Running => "running",
            LoopState::Draining => "draining",
            LoopState::Stopped => "stopped",
            LoopState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushTrigger {
    Size,
    Age,
    Shutdown,
}

impl FlushTrigger {
    /// Why a buffer that reports ready should be flushed. Size wins when both hold.
    fn for_ready(accumulator: &BatchAccumulator) -> Self {
        if accumulator.is_full() {
            FlushTrigger::Size
        } else {
            FlushTrigger::Age
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Age => "age",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IngestionConfig {
    pub batch_policy: BatchPolicy,
    pub poll_timeout: Duration,
    pub flush_check_interval: Duration,
}

/// What a loop did before it stopped cleanly.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestionReport {
    pub objects: Vec<ObjectPath>,
    pub records_written: usize,
    pub records_dropped: usize,
    /// Positions last acknowledged to the queue, per partition
    pub committed: HashMap<Partition, i64>,
}

pub struct IngestionLoop<S: RecordSource> {
    source: S,
    sink: StorageSink,
    config: IngestionConfig,
    accumulator: BatchAccumulator,
    tracker: OffsetTracker,
    /// Positions not yet acknowledged by the queue
    unacked: HashMap<Partition, i64>,
    state: LoopState,
    shutdown: CancellationToken,
    liveness: Option<HealthHandle>,
    report: IngestionReport,
}

impl<S: RecordSource> IngestionLoop<S> {
    pub fn new(
        source: S,
        sink: StorageSink,
        config: IngestionConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source,
            sink,
            accumulator: BatchAccumulator::new(config.batch_policy),
            config,
            tracker: OffsetTracker::new(),
            unacked: HashMap::new(),
            state: LoopState::Starting,
            shutdown,
            liveness: None,
            report: IngestionReport::default(),
        }
    }

    /// Report healthy on every poll cycle, unhealthy once the loop ends.
    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Runs until the shutdown token is cancelled (then drains) or a fatal
    /// error occurs. Consumes the loop, so the queue and storage clients are
    /// released when it returns.
    pub async fn run(mut self) -> Result<IngestionReport, IngestionError> {
        let result = self.run_inner().await;

        if let Err(e) = &result {
            self.transition(LoopState::Failed);
            error!(error = ?e, "Ingestion loop failed, offsets past the last written batch stay uncommitted");
        }
        if let Some(liveness) = &self.liveness {
            liveness.report_status(ComponentStatus::Unhealthy);
        }
        self.source.close().await;

        result.map(|_| self.report)
    }

    async fn run_inner(&mut self) -> Result<(), IngestionError> {
        self.transition(LoopState::Starting);
        let positions = self.source.start().await?;
        for (partition, position) in &positions {
            self.tracker.seed(partition, *position);
        }
        info!(
            partitions = positions.len(),
            max_batch_size = self.config.batch_policy.max_batch_size,
            max_batch_age_ms = self.config.batch_policy.max_batch_age.as_millis() as u64,
            "Ingestion loop started"
        );

        self.transition(LoopState::Running);
        self.consume().await?;

        self.transition(LoopState::Draining);
        self.drain().await?;

        self.transition(LoopState::Stopped);
        info!(
            objects = self.report.objects.len(),
            records = self.report.records_written,
            dropped = self.report.records_dropped,
            "Ingestion loop stopped"
        );
        Ok(())
    }

    async fn consume(&mut self) -> Result<(), IngestionError> {
        let mut flush_timer = tokio::time::interval(self.config.flush_check_interval);
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_errors: u32 = 0;

        loop {
            if let Some(liveness) = &self.liveness {
                liveness.report_healthy();
            }

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested, draining");
                    return Ok(());
                }

                _ = flush_timer.tick() => {
                    if self.accumulator.is_due() {
                        self.flush(FlushTrigger::Age).await?;
                    }
                }

                polled = self.source.poll(self.config.poll_timeout) => {
                    // rebalance callbacks run inside the poll
                    self.release_revoked();
                    match polled {
                        Ok(Some(message)) => {
                            consecutive_errors = 0;
                            if let Some(trigger) = self.ingest(message) {
                                self.flush(trigger).await?;
                            }
                        }
                        Ok(None) => {
                            consecutive_errors = 0;
                        }
                        Err(e) if e.is_fatal() => return Err(e.into()),
                        Err(e) => {
                            consecutive_errors = consecutive_errors.saturating_add(1);
                            let backoff = Duration::from_millis(100)
                                .saturating_mul(consecutive_errors)
                                .min(MAX_POLL_ERROR_BACKOFF);
                            warn!(
                                consecutive_errors = consecutive_errors,
                                backoff_ms = backoff.as_millis() as u64,
                                "Poll failed: {e}"
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(backoff) => {}
                                _ = self.shutdown.cancelled() => {}
                            }
                        }
                    }
                }
            }
        }
    }

    /// Parses a message into the accumulator. Returns the trigger when the
    /// buffer became ready.
    fn ingest(&mut self, message: SourceMessage) -> Option<FlushTrigger> {
        metrics::counter!(MESSAGES_RECEIVED).increment(1);
        // malformed records still move the committed offset past them
        self.tracker.mark_pending(&message.partition, message.offset);

        match Record::from_message(&message) {
            Ok(record) => {
                let ready = self.accumulator.add(record);
                metrics::gauge!(BUFFERED_RECORDS).set(self.accumulator.len() as f64);
                ready.then(|| FlushTrigger::for_ready(&self.accumulator))
            }
            Err(e) => {
                warn!(
                    topic = message.partition.topic(),
                    partition = message.partition.partition_number(),
                    offset = message.offset,
                    reason = e.reason(),
                    "Dropping malformed record: {e}"
                );
                metrics::counter!(MESSAGES_DROPPED, "reason" => e.reason()).increment(1);
                self.report.records_dropped += 1;
                None
            }
        }
    }

    async fn flush(&mut self, trigger: FlushTrigger) -> Result<(), IngestionError> {
        let age = self.accumulator.age();
        let batch = self.accumulator.drain();
        metrics::gauge!(BUFFERED_RECORDS).set(0.0);
        if batch.is_empty() {
            return Ok(());
        }

        debug!(
            trigger = trigger.as_str(),
            records = batch.len(),
            "Flushing batch"
        );

        match self.sink.flush(&batch, &self.shutdown).await {
            Ok(path) => {
                metrics::counter!(BATCHES_FLUSHED, "trigger" => trigger.as_str()).increment(1);
                metrics::histogram!(BATCH_SIZE).record(batch.len() as f64);
                if let Some(age) = age {
                    metrics::histogram!(BATCH_AGE).record(age.as_secs_f64());
                }
                self.report.records_written += batch.len();
                self.report.objects.extend(path);
                self.commit().await;
                Ok(())
            }
            Err(SinkError::Cancelled) => {
                info!(
                    records = batch.len(),
                    "Flush interrupted by shutdown, batch kept for the drain"
                );
                self.accumulator.restore(batch);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Flush what is left with a full retry budget, then commit.
    async fn drain(&mut self) -> Result<(), IngestionError> {
        self.release_revoked();
        let batch = self.accumulator.drain();
        metrics::gauge!(BUFFERED_RECORDS).set(0.0);

        if !batch.is_empty() {
            info!(records = batch.len(), "Flushing remaining records");
            // the loop's token is already cancelled, the drain must not give up in backoff
            let uncancelled = CancellationToken::new();
            let path = self.sink.flush(&batch, &uncancelled).await?;
            metrics::counter!(BATCHES_FLUSHED, "trigger" => FlushTrigger::Shutdown.as_str())
                .increment(1);
            metrics::histogram!(BATCH_SIZE).record(batch.len() as f64);
            self.report.records_written += batch.len();
            self.report.objects.extend(path);
        }

        self.commit().await;
        Ok(())
    }

    /// Moves the tracker past everything written so far and acknowledges it to
    /// the queue. Must only run after a successful sink write.
    async fn commit(&mut self) {
        self.unacked.extend(self.tracker.commit_all());
        if self.unacked.is_empty() {
            return;
        }

        match self.source.commit(&self.unacked).await {
            Ok(()) => {
                metrics::counter!(OFFSET_COMMITS, "outcome" => "success").increment(1);
                debug!(partitions = self.unacked.len(), "Committed offsets");
                self.report.committed.extend(self.unacked.drain());
            }
            Err(e) => {
                // the data is written; the positions are sent again with the next commit
                metrics::counter!(OFFSET_COMMITS, "outcome" => "failure").increment(1);
                warn!(
                    partitions = self.unacked.len(),
                    "Failed to commit offsets, retrying with the next commit: {e}"
                );
            }
        }
    }

    /// Forgets partitions the queue assigned elsewhere: their buffered records,
    /// pending offsets and unacknowledged positions. The new owner reads the
    /// dropped records again from the group's committed position, which this
    /// loop never touches for those partitions again.
    fn release_revoked(&mut self) {
        let revoked = self.source.take_revoked();
        if revoked.is_empty() {
            return;
        }

        let dropped = self.accumulator.discard_partitions(&revoked);
        for partition in &revoked {
            self.tracker.release(partition);
            self.unacked.remove(partition);
        }
        metrics::gauge!(BUFFERED_RECORDS).set(self.accumulator.len() as f64);

        info!(
            partitions = ?revoked.iter().map(ToString::to_string).collect::<Vec<_>>(),
            dropped_records = dropped,
            "Released revoked partitions"
        );
    }

    fn transition(&mut self, next: LoopState) {
        if self.state != next {
            info!(from = %self.state, to = %next, "Ingestion loop state change");
        }
        self.state = next;
        metrics::gauge!(LOOP_STATE).set(next.as_gauge());
    }
}
