use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use tracing::{error, info, warn};

use crate::kafka::context::{ArchiverConsumerContext, RevokedReceiver};
use crate::kafka::types::{Partition, StartPosition};
use crate::metrics_consts::POLL_ERRORS;
use crate::source::{RecordSource, SourceError, SourceMessage};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// `RecordSource` over a single Kafka topic.
///
/// In subscribe mode the consumer group assigns partitions and positions come
/// from the group's committed offsets. In assign mode the listed partitions
/// are consumed from the explicit offsets, and commits still go to the group.
pub struct KafkaSource {
    consumer: StreamConsumer<ArchiverConsumerContext>,
    topic: String,
    start: StartPosition,
    revoked_rx: RevokedReceiver,
}

impl KafkaSource {
    pub fn new(
        config: &ClientConfig,
        topic: &str,
        start: StartPosition,
    ) -> Result<Self, KafkaError> {
        let (context, revoked_rx) = ArchiverConsumerContext::new();
        let consumer: StreamConsumer<ArchiverConsumerContext> =
            config.create_with_context(context)?;

        Ok(Self {
            consumer,
            topic: topic.to_string(),
            start,
            revoked_rx,
        })
    }

    fn partition_ids(&self) -> Result<Vec<i32>, SourceError> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(&self.topic), METADATA_TIMEOUT)
            .map_err(|e| SourceError::Start(format!("metadata for {}: {e}", self.topic)))?;

        let topic = metadata
            .topics()
            .iter()
            .find(|t| t.name() == self.topic)
            .ok_or_else(|| SourceError::Start(format!("topic {} not found", self.topic)))?;

        if let Some(err) = topic.error() {
            return Err(SourceError::Start(format!(
                "topic {}: {:?}",
                self.topic,
                RDKafkaErrorCode::from(err)
            )));
        }

        let ids: Vec<i32> = topic.partitions().iter().map(|p| p.id()).collect();
        if ids.is_empty() {
            return Err(SourceError::Start(format!(
                "topic {} has no partitions",
                self.topic
            )));
        }
        Ok(ids)
    }

    /// Positions the consumer group committed for every partition of the topic.
    fn committed_positions(&self, ids: &[i32]) -> KafkaResult<HashMap<Partition, i64>> {
        let mut tpl = TopicPartitionList::new();
        for id in ids {
            tpl.add_partition(&self.topic, *id);
        }

        let committed = self.consumer.committed_offsets(tpl, METADATA_TIMEOUT)?;
        Ok(committed
            .elements()
            .into_iter()
            .filter_map(|elem| match elem.offset() {
                Offset::Offset(position) => Some((Partition::from(elem), position)),
                _ => None,
            })
            .collect())
    }
}

#[async_trait]
impl RecordSource for KafkaSource {
    async fn start(&mut self) -> Result<HashMap<Partition, i64>, SourceError> {
        let ids = self.partition_ids()?;
        let committed = self
            .committed_positions(&ids)
            .map_err(|e| SourceError::Start(format!("committed offsets: {e}")))?;

        match &self.start {
            StartPosition::Subscribe(reset) => {
                self.consumer
                    .subscribe(&[self.topic.as_str()])
                    .map_err(|e| SourceError::Start(format!("subscribe to {}: {e}", self.topic)))?;
                info!(
                    topic = self.topic,
                    offset_reset = reset.as_str(),
                    committed_partitions = committed.len(),
                    "Subscribed to topic"
                );
                Ok(committed)
            }
            StartPosition::Assign(offsets) => {
                let mut tpl = TopicPartitionList::new();
                let mut positions = HashMap::new();
                for id in ids {
                    let Some(offset) = offsets.for_partition(id) else {
                        continue;
                    };
                    tpl.add_partition_offset(&self.topic, id, Offset::Offset(offset))
                        .map_err(|e| SourceError::Start(format!("partition {id}: {e}")))?;
                    positions.insert(Partition::new(self.topic.as_str(), id), offset);
                }

                if positions.is_empty() {
                    return Err(SourceError::Start(format!(
                        "no listed partition exists in topic {}",
                        self.topic
                    )));
                }

                self.consumer
                    .assign(&tpl)
                    .map_err(|e| SourceError::Start(format!("assign {}: {e}", self.topic)))?;
                info!(
                    topic = self.topic,
                    partitions = positions.len(),
                    "Assigned partitions at explicit offsets"
                );
                // anything below the explicit offsets is treated as already archived
                Ok(positions)
            }
        }
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<SourceMessage>, SourceError> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(message)) => Ok(Some(SourceMessage::new(
                Partition::new(message.topic(), message.partition()),
                message.offset(),
                message.payload().map(<[u8]>::to_vec),
            ))),
            Ok(Err(e)) => Err(classify_kafka_error(e)),
        }
    }

    async fn commit(&mut self, positions: &HashMap<Partition, i64>) -> Result<(), SourceError> {
        let mut tpl = TopicPartitionList::new();
        for (partition, position) in positions {
            tpl.add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(*position),
            )
            .map_err(|e| SourceError::Commit(format!("{partition}: {e}")))?;
        }

        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| SourceError::Commit(e.to_string()))
    }

    fn take_revoked(&mut self) -> Vec<Partition> {
        let mut revoked = Vec::new();
        while let Ok(partitions) = self.revoked_rx.try_recv() {
            revoked.extend(partitions);
        }
        revoked
    }

    async fn close(&mut self) {
        match &self.start {
            StartPosition::Subscribe(_) => self.consumer.unsubscribe(),
            StartPosition::Assign(_) => {
                if let Err(e) = self.consumer.unassign() {
                    warn!("Failed to unassign partitions: {}", e);
                }
            }
        }
        info!(topic = self.topic, "Released partitions");
    }
}

/// Splits consumer errors into ones the next poll can recover from and ones
/// that end the loop.
pub fn classify_kafka_error(e: KafkaError) -> SourceError {
    let (level, kind) = match &e {
        KafkaError::MessageConsumption(RDKafkaErrorCode::PartitionEOF) => ("info", "partition_eof"),
        KafkaError::MessageConsumption(RDKafkaErrorCode::OperationTimedOut) => {
            ("info", "op_timed_out")
        }
        KafkaError::MessageConsumption(RDKafkaErrorCode::OffsetOutOfRange) => {
            // auto.offset.reset moves the partition to the configured end
            ("info", "offset_out_of_range")
        }
        KafkaError::MessageConsumption(_) => ("warn", "consumer"),
        KafkaError::MessageConsumptionFatal(_) => ("fatal", "consumer"),
        KafkaError::Global(RDKafkaErrorCode::AllBrokersDown) => ("warn", "all_brokers_down"),
        KafkaError::Global(RDKafkaErrorCode::BrokerTransportFailure) => {
            ("warn", "broker_transport")
        }
        KafkaError::Global(RDKafkaErrorCode::Authentication) => ("fatal", "authentication"),
        KafkaError::Global(_) => ("warn", "global"),
        KafkaError::Canceled => ("fatal", "canceled"),
        _ => ("warn", "unexpected"),
    };

    metrics::counter!(POLL_ERRORS, &[("level", level), ("error", kind)]).increment(1);

    if level == "fatal" {
        error!(error = kind, "Fatal Kafka consumer error: {e}");
        SourceError::Fatal(format!("{kind}: {e}"))
    } else {
        SourceError::Transient(format!("{kind}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        for e in [
            KafkaError::MessageConsumption(RDKafkaErrorCode::PartitionEOF),
            KafkaError::MessageConsumption(RDKafkaErrorCode::OperationTimedOut),
            KafkaError::MessageConsumption(RDKafkaErrorCode::OffsetOutOfRange),
            KafkaError::Global(RDKafkaErrorCode::AllBrokersDown),
            KafkaError::Global(RDKafkaErrorCode::BrokerTransportFailure),
        ] {
            let classified = classify_kafka_error(e);
            assert!(!classified.is_fatal(), "{classified} should be transient");
        }
    }

    #[test]
    fn test_fatal_errors() {
        for e in [
            KafkaError::MessageConsumptionFatal(RDKafkaErrorCode::Fatal),
            KafkaError::Global(RDKafkaErrorCode::Authentication),
            KafkaError::Canceled,
        ] {
            let classified = classify_kafka_error(e);
            assert!(classified.is_fatal(), "{classified} should be fatal");
        }
    }
}
