//! Policy-driven starting-offset resolution for assigned partitions.
//!
//! Maps a `SubscriptionPolicy` plus per-partition watermark/committed
//! facts into the authoritative starting offset for every partition of
//! an assignment. Watermark and committed-offset lookups are computed
//! at most once per partition per assignment event to bound broker
//! round-trips.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext};
use rdkafka::{Offset, TopicPartitionList};
use tracing::warn;

use crate::config::{OffsetMode, SubscriptionPolicy};
use crate::error::AssignmentError;
use crate::types::{Partition, PartitionOffset, Watermark};

/// Broker queries the resolver needs. Implemented for rdkafka consumers;
/// faked in tests.
pub trait BrokerOffsets {
    fn watermarks(
        &self,
        partition: &Partition,
        timeout: Duration,
    ) -> Result<Watermark, AssignmentError>;

    /// The group's committed offset for a partition, `None` when unset.
    fn committed(
        &self,
        partition: &Partition,
        timeout: Duration,
    ) -> Result<Option<i64>, AssignmentError>;

    /// One batched lookup of the earliest offsets at or after `timestamp`.
    /// The broker performs its own clamping on this path.
    fn offsets_for_timestamp(
        &self,
        partitions: &[Partition],
        timestamp: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<Vec<PartitionOffset>, AssignmentError>;
}

impl<C: ConsumerContext> BrokerOffsets for BaseConsumer<C> {
    fn watermarks(
        &self,
        partition: &Partition,
        timeout: Duration,
    ) -> Result<Watermark, AssignmentError> {
        let (low, high) = self
            .fetch_watermarks(partition.topic(), partition.partition_number(), timeout)
            .map_err(|e| {
                AssignmentError::from_kafka("fetch_watermarks", partition.partition_number(), e)
            })?;
        Ok(Watermark::new(low, high))
    }

    fn committed(
        &self,
        partition: &Partition,
        timeout: Duration,
    ) -> Result<Option<i64>, AssignmentError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(partition.topic(), partition.partition_number());

        let committed = self.committed_offsets(tpl, timeout).map_err(|e| {
            AssignmentError::from_kafka("committed_offsets", partition.partition_number(), e)
        })?;

        Ok(committed.elements().first().and_then(|elem| {
            match elem.offset() {
                Offset::Offset(v) => Some(v),
                // Offset::Invalid means no offset stored for the group
                _ => None,
            }
        }))
    }

    fn offsets_for_timestamp(
        &self,
        partitions: &[Partition],
        timestamp: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<Vec<PartitionOffset>, AssignmentError> {
        let mut tpl = TopicPartitionList::new();
        for partition in partitions {
            tpl.add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(timestamp.timestamp_millis()),
            )
            .map_err(|e| {
                AssignmentError::from_kafka("offsets_for_times", partition.partition_number(), e)
            })?;
        }

        let resolved = self
            .offsets_for_times(tpl, timeout)
            .map_err(|e| AssignmentError::from_kafka("offsets_for_times", -1, e))?;

        Ok(resolved
            .elements()
            .into_iter()
            .map(|elem| {
                PartitionOffset::new(
                    Partition::new(elem.topic().to_string(), elem.partition()),
                    elem.offset(),
                )
            })
            .collect())
    }
}

/// Lazily fetched, memoized per-partition facts. Lives for the duration
/// of one assignment event so each fact is queried at most once.
struct PartitionFacts<'a, B: BrokerOffsets> {
    client: &'a B,
    partition: &'a Partition,
    timeout: Duration,
    watermark: Option<Watermark>,
    committed: Option<Option<i64>>,
}

impl<'a, B: BrokerOffsets> PartitionFacts<'a, B> {
    fn new(client: &'a B, partition: &'a Partition, timeout: Duration) -> Self {
        Self {
            client,
            partition,
            timeout,
            watermark: None,
            committed: None,
        }
    }

    fn watermark(&mut self) -> Result<Watermark, AssignmentError> {
        if let Some(range) = self.watermark {
            return Ok(range);
        }
        let range = self.client.watermarks(self.partition, self.timeout)?;
        self.watermark = Some(range);
        Ok(range)
    }

    /// The committed offset, falling back to the low watermark when the
    /// group has nothing stored.
    fn committed_or_low(&mut self) -> Result<i64, AssignmentError> {
        let committed = match self.committed {
            Some(cached) => cached,
            None => {
                let fetched = self.client.committed(self.partition, self.timeout)?;
                self.committed = Some(fetched);
                fetched
            }
        };
        match committed {
            Some(offset) => Ok(offset),
            None => Ok(self.watermark()?.low),
        }
    }
}

/// Resolves the starting offset for each partition of an assignment.
pub struct OffsetResolver {
    policy: SubscriptionPolicy,
    timeout: Duration,
}

impl OffsetResolver {
    pub fn new(policy: SubscriptionPolicy, timeout: Duration) -> Self {
        Self { policy, timeout }
    }

    pub fn policy(&self) -> &SubscriptionPolicy {
        &self.policy
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Produce the authoritative starting offset for every target
    /// partition. Any broker failure aborts the whole batch; the broker
    /// client's rebalance retry loop governs recovery.
    pub fn resolve<B: BrokerOffsets>(
        &self,
        client: &B,
        partitions: &[Partition],
    ) -> Result<Vec<PartitionOffset>, AssignmentError> {
        if self.policy.is_timestamp_based() {
            if self.policy.bias != 0 {
                warn!(
                    bias = self.policy.bias,
                    "Offset bias is ignored for timestamp-based resolution"
                );
            }
            let timestamp = self.policy.base_timestamp(Utc::now());
            return client.offsets_for_timestamp(partitions, timestamp, self.timeout);
        }

        partitions
            .iter()
            .map(|partition| {
                let mut facts = PartitionFacts::new(client, partition, self.timeout);
                let offset = self.resolve_partition(&mut facts)?;
                Ok(PartitionOffset::new(partition.clone(), offset))
            })
            .collect()
    }

    fn resolve_partition<B: BrokerOffsets>(
        &self,
        facts: &mut PartitionFacts<'_, B>,
    ) -> Result<Offset, AssignmentError> {
        let bias = self.policy.bias;

        let offset = match self.policy.offset_mode {
            OffsetMode::Begin => {
                if bias == 0 {
                    Offset::Beginning
                } else {
                    let range = facts.watermark()?;
                    Offset::Offset(range.clamp(range.low.saturating_add(bias)))
                }
            }
            OffsetMode::End => {
                if bias == 0 {
                    Offset::End
                } else {
                    let range = facts.watermark()?;
                    Offset::Offset(range.clamp(range.high.saturating_add(bias)))
                }
            }
            OffsetMode::Stored => {
                let current = facts.committed_or_low()?;
                if bias == 0 {
                    Offset::Offset(current)
                } else {
                    let range = facts.watermark()?;
                    Offset::Offset(range.clamp(current.saturating_add(bias)))
                }
            }
        };

        Ok(offset)
    }
}
