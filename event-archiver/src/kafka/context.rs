use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::{ClientContext, TopicPartitionList};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::kafka::types::Partition;
use crate::metrics_consts::REBALANCE_EVENTS;

/// Receives the partitions revoked from this consumer, one message per revoke.
pub type RevokedReceiver = mpsc::UnboundedReceiver<Vec<Partition>>;

/// Logs consumer group activity and forwards revoked partitions to the
/// source, which hands them to the ingestion loop after the poll that ran
/// the callback.
pub struct ArchiverConsumerContext {
    revoked_tx: mpsc::UnboundedSender<Vec<Partition>>,
}

impl ArchiverConsumerContext {
    pub fn new() -> (Self, RevokedReceiver) {
        let (revoked_tx, revoked_rx) = mpsc::unbounded_channel();
        (Self { revoked_tx }, revoked_rx)
    }
}

impl ClientContext for ArchiverConsumerContext {}

impl ConsumerContext for ArchiverConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                if partitions.count() == 0 {
                    debug!("Skipping empty revoke rebalance");
                    return;
                }
                let revoked = revoked_partitions(partitions);
                info!(
                    partitions = ?revoked.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "Revoking partitions"
                );
                metrics::counter!(REBALANCE_EVENTS, "event_type" => "revoke").increment(1);
                if self.revoked_tx.send(revoked).is_err() {
                    warn!("Revoked partitions dropped, source is gone");
                }
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => {
                error!("Pre-rebalance error: {}", e);
                metrics::counter!(REBALANCE_EVENTS, "event_type" => "error").increment(1);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                if partitions.count() == 0 {
                    debug!("Skipping empty assign rebalance");
                    return;
                }
                info!(
                    partitions = ?partition_names(partitions),
                    "Assigned partitions"
                );
                metrics::counter!(REBALANCE_EVENTS, "event_type" => "assign").increment(1);
            }
            Rebalance::Revoke(_) => {
                info!("Post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!("Post-rebalance error: {}", e);
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => debug!("Committed offsets for {} partitions", offsets.count()),
            Err(e) => warn!("Failed to commit offsets: {}", e),
        }
    }
}

fn revoked_partitions(partitions: &TopicPartitionList) -> Vec<Partition> {
    partitions.elements().into_iter().map(Partition::from).collect()
}

fn partition_names(partitions: &TopicPartitionList) -> Vec<String> {
    partitions
        .elements()
        .into_iter()
        .map(|elem| Partition::from(elem).to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revoked_partitions_from_list() {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition("events", 0);
        tpl.add_partition("events", 3);

        assert_eq!(
            revoked_partitions(&tpl),
            vec![Partition::new("events", 0), Partition::new("events", 3)]
        );
    }

    #[test]
    fn test_revokes_reach_the_receiver() {
        let (context, mut revoked_rx) = ArchiverConsumerContext::new();
        context
            .revoked_tx
            .send(vec![Partition::new("events", 1)])
            .unwrap();
        drop(context);

        assert_eq!(
            revoked_rx.try_recv().unwrap(),
            vec![Partition::new("events", 1)]
        );
        assert!(revoked_rx.try_recv().is_err());
    }
}
