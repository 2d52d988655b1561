use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use common_s3::{S3Client, S3Impl};
use health::HealthRegistry;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::error::IngestionError;
use crate::ingestion::{IngestionLoop, IngestionReport};
use crate::kafka::{ConsumerConfigBuilder, KafkaSource};
use crate::sink::StorageSink;
use crate::source::RecordSource;

const LIVENESS_COMPONENT: &str = "ingestion_loop";

/// Owns the configuration and wires the queue, the storage client and the
/// ingestion loop together.
pub struct ArchiverService {
    config: Config,
    liveness: HealthRegistry,
}

impl ArchiverService {
    pub fn new(config: Config, liveness: HealthRegistry) -> Self {
        Self { config, liveness }
    }

    /// Connect to S3 and Kafka, then run until `shutdown` is cancelled and the
    /// loop drained, or until the loop fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<IngestionReport> {
        let s3 = S3Impl::from_config(&self.config.s3_config()).await;
        self.check_bucket(&s3).await?;
        let sink = StorageSink::new(Arc::new(s3), self.config.sink_config());

        let kafka_config = ConsumerConfigBuilder::new(
            &self.config.kafka_hosts,
            &self.config.kafka_consumer_group,
        )
        .with_tls(self.config.kafka_tls)
        .with_offset_reset(self.config.offset_reset())
        .with_max_poll_interval_ms(self.config.kafka_max_poll_interval_ms)
        .build();

        let start = self
            .config
            .start_position()
            .context("Invalid Kafka start position")?;
        let source = KafkaSource::new(&kafka_config, &self.config.kafka_consumer_topic, start)
            .context("Failed to create Kafka consumer")?;

        self.run_with(source, sink, shutdown).await
    }

    /// Fail fast on a missing bucket or rejected credentials instead of on the
    /// first flush.
    async fn check_bucket(&self, s3: &dyn S3Client) -> Result<()> {
        let bucket = &self.config.s3_bucket;
        tokio::time::timeout(self.config.s3_timeout.0, s3.head_bucket(bucket))
            .await
            .map_err(|_| anyhow!("Timed out checking access to bucket {bucket}"))?
            .with_context(|| format!("Cannot access bucket {bucket}"))?;

        info!(bucket = bucket, "Verified bucket access");
        Ok(())
    }

    /// Run the ingestion loop over any source and sink. On shutdown the loop
    /// gets `SHUTDOWN_TIMEOUT_SECS` to drain before it is aborted.
    pub async fn run_with<S>(
        &self,
        source: S,
        sink: StorageSink,
        shutdown: CancellationToken,
    ) -> Result<IngestionReport>
    where
        S: RecordSource + 'static,
    {
        let liveness = self
            .liveness
            .register(LIVENESS_COMPONENT, self.config.liveness_deadline());

        let ingestion = IngestionLoop::new(
            source,
            sink,
            self.config.ingestion_config(),
            shutdown.clone(),
        )
        .with_liveness(liveness);

        info!(
            topic = self.config.kafka_consumer_topic,
            bucket = self.config.s3_bucket,
            "Starting event archiver"
        );
        let mut task = tokio::spawn(ingestion.run());

        tokio::select! {
            joined = &mut task => return loop_result(joined),
            _ = shutdown.cancelled() => {}
        }

        info!("Received shutdown signal, waiting for the ingestion loop to drain");
        let timeout = self.config.shutdown_timeout();
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(joined) => loop_result(joined),
            Err(_) => {
                task.abort();
                error!("Ingestion loop did not drain within {:?}", timeout);
                Err(anyhow!(
                    "Ingestion loop did not drain within {timeout:?}, buffered records were not committed"
                ))
            }
        }
    }
}

fn loop_result(
    joined: Result<Result<IngestionReport, IngestionError>, JoinError>,
) -> Result<IngestionReport> {
    let report = joined
        .context("Ingestion loop task panicked")?
        .context("Ingestion loop failed")?;

    info!(
        objects = report.objects.len(),
        records = report.records_written,
        "Event archiver stopped"
    );
    Ok(report)
}
