#![allow(dead_code)]

use std::time::Duration;

use arrow::array::AsArray;
use arrow::datatypes::Int64Type;
use arrow::record_batch::RecordBatch;
use common_s3::MockS3Client;
use event_archiver::error::IngestionError;
use event_archiver::test_utils::{test_sink, MemoryLog, TEST_BUCKET};
use event_archiver::{IngestionConfig, IngestionLoop, IngestionReport};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct RunningLoop {
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<Result<IngestionReport, IngestionError>>,
}

impl RunningLoop {
    /// Signal shutdown and wait for the drain.
    pub async fn stop(self) -> Result<IngestionReport, IngestionError> {
        self.shutdown.cancel();
        self.join().await
    }

    pub async fn join(self) -> Result<IngestionReport, IngestionError> {
        tokio::time::timeout(Duration::from_secs(30), self.handle)
            .await
            .expect("loop finished in time")
            .expect("loop task did not panic")
    }
}

pub fn spawn_loop(
    log: &MemoryLog,
    client: &MockS3Client,
    config: IngestionConfig,
    max_attempts: u32,
) -> RunningLoop {
    let shutdown = CancellationToken::new();
    let ingestion = IngestionLoop::new(
        log.source(),
        test_sink(client, max_attempts),
        config,
        shutdown.clone(),
    );

    RunningLoop {
        shutdown,
        handle: tokio::spawn(ingestion.run()),
    }
}

pub async fn wait_until_consumed(log: &MemoryLog) {
    tokio::time::timeout(Duration::from_secs(30), log.wait_until_consumed())
        .await
        .expect("log consumed in time");
}

pub fn mock_s3() -> MockS3Client {
    MockS3Client::new().with_bucket(TEST_BUCKET)
}

pub fn column_i64(batch: &RecordBatch, name: &str) -> Vec<i64> {
    batch
        .column_by_name(name)
        .unwrap_or_else(|| panic!("missing column {name}"))
        .as_primitive::<Int64Type>()
        .values()
        .to_vec()
}
