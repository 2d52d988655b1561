use arrow::error::ArrowError;
use common_s3::S3Error;
use parquet::errors::ParquetError;
use thiserror::Error;

use crate::source::SourceError;

/// Errors turning a batch into a parquet object. Never retried.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("cannot encode an empty batch")]
    EmptyBatch,
    #[error("failed to build arrow record batch: {0}")]
    Arrow(#[from] ArrowError),
    #[error("failed to write parquet: {0}")]
    Parquet(#[from] ParquetError),
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to encode batch")]
    Encode(#[from] EncodeError),
    #[error("object path already taken: {0}")]
    PathCollision(String),
    #[error("storage write failed")]
    Storage(#[source] S3Error),
    #[error("storage write failed after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: S3Error,
    },
    #[error("flush abandoned during retry backoff")]
    Cancelled,
}

impl SinkError {
    /// Label used for metrics and logs
    pub fn reason(&self) -> &'static str {
        match self {
            SinkError::Encode(_) => "encode",
            SinkError::PathCollision(_) => "path_collision",
            SinkError::Storage(e) => e.reason(),
            SinkError::RetriesExhausted { .. } => "retries_exhausted",
            SinkError::Cancelled => "cancelled",
        }
    }
}

/// Reasons the ingestion loop ended in the failed state.
#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("queue source failed")]
    Source(#[from] SourceError),
    #[error("storage sink failed")]
    Sink(#[from] SinkError),
}
