//! Storage sink: one immutable parquet object per flushed batch.

pub mod encode;
pub mod path;
pub mod retry;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use common_s3::{S3Client, S3Error};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::accumulator::Batch;
use crate::error::SinkError;
use crate::metrics_consts::{
    ENCODE_DURATION, FLUSH_DURATION, OBJECTS_WRITTEN, OBJECT_BYTES_WRITTEN, ROWS_WRITTEN,
    WRITE_ATTEMPT_FAILURES,
};

pub use encode::ParquetCompression;
pub use path::{ObjectKeyTemplate, ObjectPath};
pub use retry::RetryPolicy;

const PARQUET_CONTENT_TYPE: &str = "application/vnd.apache.parquet";

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub bucket: String,
    pub key_prefix: String,
    pub compression: ParquetCompression,
    pub retry_policy: RetryPolicy,
    /// Upper bound for a single PutObject attempt
    pub attempt_timeout: Duration,
}

pub struct StorageSink {
    client: Arc<dyn S3Client>,
    bucket: String,
    keys: ObjectKeyTemplate,
    compression: ParquetCompression,
    retry_policy: RetryPolicy,
    attempt_timeout: Duration,
}

impl StorageSink {
    pub fn new(client: Arc<dyn S3Client>, config: SinkConfig) -> Self {
        Self {
            client,
            keys: ObjectKeyTemplate::new(&config.key_prefix),
            bucket: config.bucket,
            compression: config.compression,
            retry_policy: config.retry_policy,
            attempt_timeout: config.attempt_timeout,
        }
    }

    /// Writes `batch` as a single object under a fresh key.
    ///
    /// Returns `Ok(None)` without touching storage for an empty batch. Transient
    /// storage errors are retried with backoff; `cancel` is only observed while
    /// waiting between attempts, in which case `SinkError::Cancelled` is returned
    /// and the batch may or may not have been written.
    pub async fn flush(
        &self,
        batch: &Batch,
        cancel: &CancellationToken,
    ) -> Result<Option<ObjectPath>, SinkError> {
        if batch.is_empty() {
            debug!("Skipping flush of empty batch");
            return Ok(None);
        }

        let flush_start = Instant::now();

        let encode_start = Instant::now();
        let encoded = encode::encode_batch(batch, self.compression).map_err(|e| {
            error!(records = batch.len(), error = ?e, "Failed to encode batch");
            SinkError::Encode(e)
        })?;
        metrics::histogram!(ENCODE_DURATION).record(encode_start.elapsed().as_secs_f64());

        let path = ObjectPath::new(self.bucket.as_str(), self.keys.key_for(Utc::now()));
        let size = encoded.body.len();

        let mut attempt = 0;
        loop {
            match self.put_attempt(&path, &encoded.body).await {
                Ok(()) => break,
                // keys are unique per flush, so a taken key on a later attempt is an
                // earlier attempt of this flush that landed after we gave up on it
                Err(S3Error::AlreadyExists(_)) if attempt > 0 => {
                    info!(path = %path, attempt = attempt, "Object from an earlier attempt already written");
                    break;
                }
                Err(S3Error::AlreadyExists(msg)) => {
                    error!(path = %path, "Object path already taken: {msg}");
                    return Err(SinkError::PathCollision(path.to_string()));
                }
                Err(e) => {
                    metrics::counter!(WRITE_ATTEMPT_FAILURES, "reason" => e.reason()).increment(1);

                    if !e.is_retryable() {
                        error!(path = %path, attempt = attempt, error = ?e, "Storage write failed");
                        return Err(SinkError::Storage(e));
                    }
                    if !self.retry_policy.should_retry(attempt) {
                        error!(
                            path = %path,
                            attempts = attempt + 1,
                            error = ?e,
                            "Storage write failed, retry budget exhausted"
                        );
                        return Err(SinkError::RetriesExhausted {
                            attempts: attempt + 1,
                            source: e,
                        });
                    }

                    let backoff = self.retry_policy.time_until_next_retry(attempt);
                    warn!(
                        path = %path,
                        attempt = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = ?e,
                        "Storage write failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => {
                            warn!(path = %path, attempt = attempt, "Flush cancelled during backoff");
                            return Err(SinkError::Cancelled);
                        }
                    }
                    attempt += 1;
                }
            }
        }

        metrics::counter!(OBJECTS_WRITTEN).increment(1);
        metrics::counter!(OBJECT_BYTES_WRITTEN).increment(size as u64);
        metrics::counter!(ROWS_WRITTEN).increment(encoded.rows as u64);
        metrics::histogram!(FLUSH_DURATION).record(flush_start.elapsed().as_secs_f64());

        info!(
            path = %path,
            rows = encoded.rows,
            columns = encoded.columns,
            bytes = size,
            attempts = attempt + 1,
            "Wrote batch to storage"
        );

        Ok(Some(path))
    }

    async fn put_attempt(&self, path: &ObjectPath, body: &bytes::Bytes) -> Result<(), S3Error> {
        let put = self.client.put_object(
            path.bucket(),
            path.key(),
            body.clone(),
            PARQUET_CONTENT_TYPE,
            true,
        );

        match tokio::time::timeout(self.attempt_timeout, put).await {
            Ok(result) => result,
            Err(_) => Err(S3Error::Timeout(format!(
                "put {path} exceeded {}ms",
                self.attempt_timeout.as_millis()
            ))),
        }
    }
}
