//! Queue-agnostic view of the record stream consumed by the ingestion loop.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::kafka::types::Partition;

/// A raw message as read from the queue, before any parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceMessage {
    pub partition: Partition,
    pub offset: i64,
    pub payload: Option<Vec<u8>>,
}

impl SourceMessage {
    pub fn new(partition: Partition, offset: i64, payload: Option<Vec<u8>>) -> Self {
        Self {
            partition,
            offset,
            payload,
        }
    }
}

#[derive(Error, Debug)]
pub enum SourceError {
    /// The next poll cycle may succeed (broker unavailable, timeouts, EOF)
    #[error("transient queue error: {0}")]
    Transient(String),
    /// The consumer cannot continue (authentication, fatal consumption error)
    #[error("fatal queue error: {0}")]
    Fatal(String),
    #[error("failed to start consuming: {0}")]
    Start(String),
    #[error("failed to commit offsets: {0}")]
    Commit(String),
}

impl SourceError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Fatal(_) | SourceError::Start(_))
    }
}

/// The queue side of the ingestion loop.
///
/// Positions passed to and returned from a source are queue positions: the
/// offset of the next record to consume, i.e. the last persisted offset + 1.
#[async_trait]
pub trait RecordSource: Send {
    /// Subscribes or assigns partitions and returns the committed positions the
    /// queue knows about at startup.
    async fn start(&mut self) -> Result<HashMap<Partition, i64>, SourceError>;

    /// Waits up to `timeout` for the next message. `Ok(None)` means no message
    /// arrived in time.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<SourceMessage>, SourceError>;

    /// Synchronously acknowledges positions through the queue's own offset store.
    async fn commit(&mut self, positions: &HashMap<Partition, i64>) -> Result<(), SourceError>;

    /// Partitions taken away from this consumer since the last call. Nothing
    /// may be committed for them afterwards.
    fn take_revoked(&mut self) -> Vec<Partition> {
        Vec::new()
    }

    /// Releases the partitions held by this source.
    async fn close(&mut self) {}
}
