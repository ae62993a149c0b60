//! Consumer context that seeks to policy-resolved offsets on
//! partition assignment.

use metrics::counter;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::{ClientContext, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::metrics_const::ASSIGNMENTS_RESOLVED;
use crate::offset_resolver::OffsetResolver;
use crate::types::{Partition, PartitionOffset};

/// rdkafka consumer context owning the offset-resolution policy.
///
/// On every (re)assignment it logs the incoming partition list, resolves
/// each partition's starting offset through the [`OffsetResolver`], logs
/// the decision, and seeks the consumer there. A resolution failure
/// aborts the callback without seeking; rdkafka's own rebalance retry
/// loop governs recovery.
pub struct AssignmentContext {
    resolver: OffsetResolver,
}

impl AssignmentContext {
    pub fn new(resolver: OffsetResolver) -> Self {
        Self { resolver }
    }

    fn handle_assignment(&self, consumer: &BaseConsumer<Self>, partitions: &TopicPartitionList) {
        let targets: Vec<Partition> = partitions
            .elements()
            .into_iter()
            .map(Partition::from)
            .collect();

        info!(
            partitions = ?targets.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "Resolving offsets for assigned partitions"
        );

        let resolved = match self.resolver.resolve(consumer, &targets) {
            Ok(resolved) => resolved,
            Err(e) => {
                error!(
                    error = %e,
                    error_type = e.error_type(),
                    "Offset resolution failed, aborting assignment callback"
                );
                counter!(ASSIGNMENTS_RESOLVED, "status" => "failed").increment(1);
                return;
            }
        };

        info!(
            offsets = ?offsets_summary(&resolved),
            "Partition offsets assigned"
        );

        match resolved_to_tpl(&resolved) {
            Ok(tpl) => {
                if let Err(e) = consumer.seek_partitions(tpl, self.resolver.timeout()) {
                    error!(error = %e, "Failed to seek to resolved offsets");
                    counter!(ASSIGNMENTS_RESOLVED, "status" => "seek_failed").increment(1);
                    return;
                }
                counter!(ASSIGNMENTS_RESOLVED, "status" => "ok").increment(1);
            }
            Err(e) => {
                error!(error = %e, "Failed to build resolved partition list");
                counter!(ASSIGNMENTS_RESOLVED, "status" => "failed").increment(1);
            }
        }
    }
}

/// Build the seek target list from resolved offsets.
fn resolved_to_tpl(resolved: &[PartitionOffset]) -> KafkaResult<TopicPartitionList> {
    let mut tpl = TopicPartitionList::new();
    for entry in resolved {
        tpl.add_partition_offset(entry.topic(), entry.partition_number(), entry.offset())?;
    }
    Ok(tpl)
}

fn offsets_summary(resolved: &[PartitionOffset]) -> Vec<String> {
    resolved
        .iter()
        .map(|entry| format!("{}@{:?}", entry.partition(), entry.offset()))
        .collect()
}

impl ClientContext for AssignmentContext {}

impl ConsumerContext for AssignmentContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                info!("Revoking {} partitions", partitions.count());
            }
            Rebalance::Assign(partitions) => {
                debug!(
                    "Pre-rebalance assign event for {} partitions",
                    partitions.count()
                );
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                // Cooperative-sticky sends empty assignments whenever group
                // membership changes; nothing to resolve for those.
                if partitions.count() == 0 {
                    debug!("Skipping empty assign rebalance");
                    return;
                }
                self.handle_assignment(base_consumer, partitions);
            }
            Rebalance::Revoke(_) => {
                debug!("Post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!("Post-rebalance error: {}", e);
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => {
                debug!(
                    "Successfully committed offsets for {} partitions",
                    offsets.count()
                );
            }
            Err(e) => {
                warn!("Failed to commit offsets: {}", e);
            }
        }
    }
}
