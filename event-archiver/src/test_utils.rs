//! Shared test utilities: an in-memory queue with consumer-group state, and
//! helpers to build a sink over `MockS3Client` and read its objects back.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use bytes::Bytes;
use common_s3::MockS3Client;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tokio::sync::watch;

use crate::accumulator::BatchPolicy;
use crate::ingestion::IngestionConfig;
use crate::kafka::types::Partition;
use crate::sink::{ParquetCompression, RetryPolicy, SinkConfig, StorageSink};
use crate::source::{RecordSource, SourceError, SourceMessage};

#[derive(Default)]
struct LogState {
    partitions: BTreeMap<i32, Vec<Option<Vec<u8>>>>,
    committed: HashMap<i32, i64>,
    commit_calls: Vec<HashMap<Partition, i64>>,
    fail_commits: bool,
    poll_failures: VecDeque<SourceError>,
    revocations: Vec<i32>,
}

/// A topic held in memory. Sources created from it resume from the positions
/// committed by earlier sources, like members of one consumer group.
#[derive(Clone)]
pub struct MemoryLog {
    topic: String,
    state: Arc<Mutex<LogState>>,
    caught_up: Arc<watch::Sender<bool>>,
}

impl MemoryLog {
    pub fn new(topic: &str) -> Self {
        let (caught_up, _) = watch::channel(false);
        Self {
            topic: topic.to_string(),
            state: Default::default(),
            caught_up: Arc::new(caught_up),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self, partition: i32) -> Partition {
        Partition::new(self.topic.as_str(), partition)
    }

    /// Appends a raw payload and returns its offset.
    pub fn push_raw(&self, partition: i32, payload: Option<Vec<u8>>) -> i64 {
        let mut state = self.lock();
        let messages = state.partitions.entry(partition).or_default();
        messages.push(payload);
        self.caught_up.send_replace(false);
        messages.len() as i64 - 1
    }

    pub fn push_json(&self, partition: i32, value: &serde_json::Value) -> i64 {
        self.push_raw(partition, Some(value.to_string().into_bytes()))
    }

    /// Appends `count` records `{"seq": n, ...}` and returns the last offset.
    pub fn push_sequence(&self, partition: i32, count: usize) -> i64 {
        let mut last = -1;
        for seq in 0..count {
            last = self.push_json(
                partition,
                &serde_json::json!({"seq": seq, "partition": partition, "payload": {"kind": "test"}}),
            );
        }
        last
    }

    pub fn committed(&self, partition: i32) -> Option<i64> {
        self.lock().committed.get(&partition).copied()
    }

    pub fn commit_calls(&self) -> Vec<HashMap<Partition, i64>> {
        self.lock().commit_calls.clone()
    }

    pub fn fail_commits(&self, fail: bool) {
        self.lock().fail_commits = fail;
    }

    pub fn fail_next_poll(&self, error: SourceError) {
        self.lock().poll_failures.push_back(error);
    }

    /// Takes a partition away from the current consumer at its next poll, as a
    /// group rebalance would. It stops reading the partition and may no longer
    /// commit it.
    pub fn revoke(&self, partition: i32) {
        self.lock().revocations.push(partition);
    }

    /// A new consumer of this log. It has not caught up until it polled the
    /// end of the log itself.
    pub fn source(&self) -> MemorySource {
        self.caught_up.send_replace(false);
        MemorySource {
            log: self.clone(),
            positions: HashMap::new(),
            revoked: HashSet::new(),
            newly_revoked: Vec::new(),
        }
    }

    /// Resolves once a source polled and found nothing left to read, meaning
    /// every earlier message went through the loop, flush included.
    pub async fn wait_until_consumed(&self) {
        let mut caught_up = self.caught_up.subscribe();
        // the sender lives in self, so this cannot fail
        let _consumed = caught_up.wait_for(|consumed| *consumed).await;
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct MemorySource {
    log: MemoryLog,
    /// Next offset to read per partition
    positions: HashMap<i32, i64>,
    revoked: HashSet<i32>,
    newly_revoked: Vec<Partition>,
}

#[async_trait]
impl RecordSource for MemorySource {
    async fn start(&mut self) -> Result<HashMap<Partition, i64>, SourceError> {
        let state = self.log.lock();
        self.positions = state.committed.clone();
        Ok(state
            .committed
            .iter()
            .map(|(partition, position)| (self.log.partition(*partition), *position))
            .collect())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<SourceMessage>, SourceError> {
        let next = {
            let mut state = self.log.lock();
            for partition in std::mem::take(&mut state.revocations) {
                if self.revoked.insert(partition) {
                    self.newly_revoked.push(self.log.partition(partition));
                }
            }
            if let Some(error) = state.poll_failures.pop_front() {
                return Err(error);
            }

            let mut next = None;
            for (partition, messages) in &state.partitions {
                if self.revoked.contains(partition) {
                    continue;
                }
                let position = self.positions.entry(*partition).or_insert(0);
                if let Some(payload) = messages.get(*position as usize) {
                    next = Some(SourceMessage::new(
                        self.log.partition(*partition),
                        *position,
                        payload.clone(),
                    ));
                    *position += 1;
                    break;
                }
            }
            if next.is_none() {
                self.log.caught_up.send_replace(true);
            }
            next
        };

        if next.is_none() {
            tokio::time::sleep(timeout).await;
        }
        Ok(next)
    }

    async fn commit(&mut self, positions: &HashMap<Partition, i64>) -> Result<(), SourceError> {
        let mut state = self.log.lock();
        if state.fail_commits {
            return Err(SourceError::Commit("injected commit failure".to_string()));
        }
        if let Some(partition) = positions
            .keys()
            .find(|partition| self.revoked.contains(&partition.partition_number()))
        {
            return Err(SourceError::Commit(format!("{partition} is not owned")));
        }
        for (partition, position) in positions {
            state
                .committed
                .insert(partition.partition_number(), *position);
        }
        state.commit_calls.push(positions.clone());
        Ok(())
    }

    fn take_revoked(&mut self) -> Vec<Partition> {
        std::mem::take(&mut self.newly_revoked)
    }
}

pub const TEST_BUCKET: &str = "archive";

pub fn test_ingestion_config(max_batch_size: usize, max_batch_age: Duration) -> IngestionConfig {
    IngestionConfig {
        batch_policy: BatchPolicy {
            max_batch_size,
            max_batch_age,
        },
        poll_timeout: Duration::from_millis(50),
        flush_check_interval: Duration::from_millis(100),
    }
}

/// A sink over `client` writing to `TEST_BUCKET` with millisecond backoffs.
pub fn test_sink(client: &MockS3Client, max_attempts: u32) -> StorageSink {
    StorageSink::new(
        Arc::new(client.clone()),
        SinkConfig {
            bucket: TEST_BUCKET.to_string(),
            key_prefix: "events".to_string(),
            compression: ParquetCompression::Snappy,
            retry_policy: RetryPolicy::new(
                max_attempts,
                2,
                Duration::from_millis(10),
                Duration::from_millis(100),
            ),
            attempt_timeout: Duration::from_secs(5),
        },
    )
}

/// Decodes a whole parquet object into one record batch.
pub fn read_parquet(body: Bytes) -> RecordBatch {
    let reader = ParquetRecordBatchReaderBuilder::try_new(body)
        .expect("valid parquet footer")
        .build()
        .expect("parquet reader");
    let batches: Vec<RecordBatch> = reader
        .collect::<Result<_, _>>()
        .expect("readable row groups");
    let schema = batches.first().expect("at least one row group").schema();
    arrow::compute::concat_batches(&schema, &batches).expect("batches share a schema")
}

/// Every object in `TEST_BUCKET`, in key order (uuid v7 keys sort by write time).
pub fn read_objects(client: &MockS3Client) -> Vec<RecordBatch> {
    client
        .keys(TEST_BUCKET)
        .iter()
        .filter_map(|key| client.get(TEST_BUCKET, key))
        .map(read_parquet)
        .collect()
}
