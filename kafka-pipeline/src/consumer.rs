//! Broker poll loop feeding a pipeline.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use metrics::counter;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::assignment::AssignmentContext;
use crate::config::Config;
use crate::message::{CommitFn, CommittableMessage};
use crate::metrics_const::{MESSAGES_CONSUMED, PARSE_FAILURES};
use crate::offset_resolver::OffsetResolver;

/// Owns the subscribed stream consumer and pumps records into a
/// pipeline feed, suspending on the feed channel when the pipeline is
/// full. That suspension is the backpressure path all the way back to
/// the broker.
pub struct PipelineConsumer {
    consumer: Arc<StreamConsumer<AssignmentContext>>,
    poll_timeout: Duration,
    shutdown_rx: oneshot::Receiver<()>,
}

impl PipelineConsumer {
    /// Build the consumer from environment config: offset policy into an
    /// [`AssignmentContext`], auto commit/store disabled, subscribed to
    /// the configured topic.
    pub fn from_config(config: &Config, shutdown_rx: oneshot::Receiver<()>) -> Result<Self> {
        let policy = config
            .subscription_policy()
            .context("Invalid subscription policy")?;
        let resolver = OffsetResolver::new(policy, config.query_timeout());

        let consumer: StreamConsumer<AssignmentContext> = config
            .client_config()
            .create_with_context(AssignmentContext::new(resolver))
            .context("Failed to create Kafka consumer")?;

        consumer
            .subscribe(&[&config.kafka_consumer_topic])
            .with_context(|| format!("Failed to subscribe to {}", config.kafka_consumer_topic))?;

        Ok(Self {
            consumer: Arc::new(consumer),
            poll_timeout: config.poll_timeout(),
            shutdown_rx,
        })
    }

    /// Consume until shutdown, wrapping every record into a
    /// [`CommittableMessage`] and sending it into the pipeline feed.
    /// Records whose payload fails to hydrate are logged and skipped.
    pub async fn run<T>(mut self, feed: mpsc::Sender<CommittableMessage<T>>) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
    {
        info!("Starting pipeline consumption");

        loop {
            tokio::select! {
                _ = &mut self.shutdown_rx => {
                    info!("Shutdown signal received, stopping consumption");
                    break;
                }

                msg_result = timeout(self.poll_timeout, self.consumer.recv()) => {
                    match msg_result {
                        Ok(Ok(msg)) => {
                            let wrapped = match hydrate::<T, _>(
                                &msg,
                                commit_fn(
                                    self.consumer.clone(),
                                    msg.topic().to_string(),
                                    msg.partition(),
                                    msg.offset(),
                                ),
                            ) {
                                Ok(wrapped) => wrapped,
                                Err(e) => {
                                    warn!(
                                        topic = msg.topic(),
                                        partition = msg.partition(),
                                        offset = msg.offset(),
                                        error = ?e,
                                        "Skipping message that failed to hydrate"
                                    );
                                    counter!(PARSE_FAILURES).increment(1);
                                    continue;
                                }
                            };

                            counter!(MESSAGES_CONSUMED).increment(1);

                            // Blocks while the pipeline is full
                            if feed.send(wrapped).await.is_err() {
                                warn!("Pipeline feed closed, stopping consumption");
                                break;
                            }
                        }
                        Ok(Err(e)) => {
                            error!("Error receiving message: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                        Err(_) => {
                            // Poll timeout, keep looping to observe shutdown
                            debug!("Consumer poll timeout");
                        }
                    }
                }
            }
        }

        info!("Pipeline consumption stopped");
        Ok(())
    }

    /// The underlying consumer (for advanced usage)
    pub fn inner_consumer(&self) -> &StreamConsumer<AssignmentContext> {
        &self.consumer
    }
}

/// Memoizable commit action for one record: commits `offset + 1`
/// synchronously so the returned bool reflects the broker outcome.
fn commit_fn(
    consumer: Arc<StreamConsumer<AssignmentContext>>,
    topic: String,
    partition: i32,
    offset: i64,
) -> CommitFn {
    Arc::new(move || {
        let mut tpl = TopicPartitionList::new();
        if let Err(e) = tpl.add_partition_offset(&topic, partition, Offset::Offset(offset + 1)) {
            warn!(topic = %topic, partition, offset, error = %e, "Failed to build commit list");
            return false;
        }
        match consumer.commit(&tpl, CommitMode::Sync) {
            Ok(()) => true,
            Err(e) => {
                warn!(topic = %topic, partition, offset, error = %e, "Broker commit failed");
                false
            }
        }
    })
}

/// Hydrate a raw record into a committable message: JSON payload into
/// `T`, key as UTF-8.
fn hydrate<T, M>(msg: &M, commit_fn: CommitFn) -> Result<CommittableMessage<T>>
where
    T: DeserializeOwned,
    M: Message,
{
    let payload = msg.payload().ok_or_else(|| anyhow!("No payload in message"))?;
    let value: T = serde_json::from_slice(payload)
        .map_err(|e| anyhow!("Failed to deserialize message: {e}"))?;

    let key = msg
        .key()
        .map(|k| String::from_utf8_lossy(k).into_owned());

    Ok(CommittableMessage::new(
        value,
        msg.topic().to_string(),
        msg.partition(),
        msg.offset(),
        key,
        commit_fn,
    ))
}
