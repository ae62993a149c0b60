//! Ordered, bounded, backpressure-aware stage chain.
//!
//! Each stage runs as one spawned task, connected to the next by a
//! bounded mpsc channel. Every stage preserves arrival order, and a
//! full downstream channel suspends the upstream sender, propagating
//! slowness all the way back to the broker poll loop. That bounded
//! buffering is the only throttling mechanism.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::batch::MessageBatch;
use crate::error::ConfigError;
use crate::message::{CommittableMessage, MessageOffset};
use crate::metrics_const::{BATCHES_EMITTED, COMMITS, HANDLER_FAILURES};

/// A user action applied to every item passing the stage. Failures are
/// logged and never abort the stream.
pub type ActionHandler<T> =
    Arc<dyn for<'a> Fn(&'a mut T) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure into an [`ActionHandler`].
pub fn action_handler<T, F>(f: F) -> ActionHandler<T>
where
    F: for<'a> Fn(&'a mut T) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A partially built pipeline: the output receiver of the last stage
/// plus the tasks spawned so far. Stages are appended by chaining calls
/// and the chain is finished with [`PipelineBuilder::run`].
pub struct PipelineBuilder<T> {
    rx: mpsc::Receiver<T>,
    handles: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> PipelineBuilder<T> {
    /// Entry point for a consumer-fed pipeline: returns the feed sender
    /// and the builder for the stage chain. Capacity must be at least 1.
    pub fn channel(capacity: usize) -> Result<(mpsc::Sender<T>, Self), ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::ChannelCapacity(capacity));
        }
        let (tx, rx) = mpsc::channel(capacity);
        Ok((tx, Self::from_receiver(rx)))
    }

    pub fn from_receiver(rx: mpsc::Receiver<T>) -> Self {
        Self {
            rx,
            handles: Vec::new(),
        }
    }

    /// Pass-through stage decoupling producer and consumer rates,
    /// absorbing bursts of up to `size` items.
    pub fn buffer(self, size: usize) -> Result<Self, ConfigError> {
        if size <= 1 {
            return Err(ConfigError::BufferSize(size));
        }

        Ok(self.stage(size, |mut rx, tx| async move {
            while let Some(item) = rx.recv().await {
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        }))
    }

    /// Apply each handler sequentially to every item, in strict arrival
    /// order, one item in flight at a time. A handler error is logged
    /// and the item still flows on to the next stage.
    pub fn action(self, handlers: Vec<ActionHandler<T>>) -> Self {
        self.stage(1, move |mut rx, tx| async move {
            while let Some(mut item) = rx.recv().await {
                for handler in &handlers {
                    if let Err(e) = handler(&mut item).await {
                        error!(error = ?e, "Message handler failure");
                        counter!(HANDLER_FAILURES).increment(1);
                    }
                }
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        })
    }

    /// Finish the chain: drain whatever the last stage emits and hand
    /// back a teardown handle.
    pub fn run(self) -> RunningPipeline {
        let mut rx = self.rx;
        let mut handles = self.handles;
        handles.push(tokio::spawn(async move {
            while rx.recv().await.is_some() {}
            debug!("Pipeline drained, terminal stage exiting");
        }));

        RunningPipeline { handles }
    }

    /// Tear off the builder into its raw parts. Used by tests and by
    /// callers that want to consume the stage output themselves.
    pub fn into_receiver(self) -> (mpsc::Receiver<T>, Vec<JoinHandle<()>>) {
        (self.rx, self.handles)
    }

    /// Spawn one stage task reading from the current tail and writing
    /// into a new bounded channel.
    fn stage<U, F, Fut>(self, capacity: usize, body: F) -> PipelineBuilder<U>
    where
        U: Send + 'static,
        F: FnOnce(mpsc::Receiver<T>, mpsc::Sender<U>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (tx, out_rx) = mpsc::channel(capacity);
        let mut handles = self.handles;
        handles.push(tokio::spawn(body(self.rx, tx)));

        PipelineBuilder {
            rx: out_rx,
            handles,
        }
    }
}

impl<T: Send + 'static> PipelineBuilder<CommittableMessage<T>> {
    /// Group messages into ordered batches of up to `size` items. A
    /// non-full batch is force-emitted when `time` has elapsed since the
    /// last emission; `time` of zero disables the timer and only
    /// size-based emission applies.
    ///
    /// A single task owns the accumulator, so a timer flush and a
    /// size flush can never race: the flush deadline is re-armed only
    /// after the group has been captured and handed downstream.
    pub fn batch(
        self,
        size: usize,
        time: Duration,
    ) -> Result<PipelineBuilder<MessageBatch<T>>, ConfigError> {
        if size <= 1 {
            return Err(ConfigError::BatchSize(size));
        }

        // The aggregator admits up to `size` completed groups before
        // suspending, matching the bound on its own accumulator.
        Ok(self.stage(size, move |mut rx, tx| async move {
            let mut acc: Vec<CommittableMessage<T>> = Vec::with_capacity(size);
            let use_timer = !time.is_zero();
            // With the timer disabled the sleep is parked far in the
            // future and the select arm below never fires.
            let flush = tokio::time::sleep(if use_timer {
                time
            } else {
                Duration::from_secs(86400)
            });
            tokio::pin!(flush);

            loop {
                tokio::select! {
                    item = rx.recv() => match item {
                        Some(message) => {
                            acc.push(message);
                            if acc.len() >= size {
                                let group = std::mem::replace(&mut acc, Vec::with_capacity(size));
                                if tx.send(MessageBatch::new(group)).await.is_err() {
                                    return;
                                }
                                counter!(BATCHES_EMITTED, "trigger" => "size").increment(1);
                                if use_timer {
                                    flush.as_mut().reset(tokio::time::Instant::now() + time);
                                }
                            }
                        }
                        None => break,
                    },
                    _ = &mut flush, if use_timer => {
                        if !acc.is_empty() {
                            let group = std::mem::replace(&mut acc, Vec::with_capacity(size));
                            if tx.send(MessageBatch::new(group)).await.is_err() {
                                return;
                            }
                            counter!(BATCHES_EMITTED, "trigger" => "time").increment(1);
                        }
                        flush.as_mut().reset(tokio::time::Instant::now() + time);
                    }
                }
            }

            // Upstream completed: flush the partial group
            if !acc.is_empty() {
                if tx.send(MessageBatch::new(acc)).await.is_err() {
                    debug!("Downstream gone during final batch flush");
                }
            }
        }))
    }
}

impl<T: MessageOffset + Send + 'static> PipelineBuilder<T> {
    /// Terminal acknowledgment stage: force-commit every item in strict
    /// order, one at a time, and forward it unchanged. Failures are
    /// logged and counted, never retried here.
    pub fn commit(self) -> Self {
        self.stage(1, |mut rx, tx| async move {
            while let Some(mut item) = rx.recv().await {
                let status = if item.commit(true) { "ok" } else { "failed" };
                counter!(COMMITS, "status" => status).increment(1);
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        })
    }
}

/// Handle to a running pipeline's stage tasks.
pub struct RunningPipeline {
    handles: Vec<JoinHandle<()>>,
}

impl RunningPipeline {
    /// Wait for the chain to drain. Resolves once the feed sender has
    /// been dropped and every stage has flushed and exited.
    pub async fn wait(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(error = ?e, "Pipeline stage task panicked");
                }
            }
        }
    }

    /// Abort every stage immediately. Cancels pending flush timers and
    /// drops in-flight items and batches without committing them.
    pub fn shutdown(self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::{sleep, timeout};

    fn message(offset: i64) -> CommittableMessage<i64> {
        CommittableMessage::new(
            offset,
            "events".to_string(),
            0,
            offset,
            None,
            Arc::new(|| true),
        )
    }

    fn recording_message(offset: i64, log: Arc<Mutex<Vec<i64>>>) -> CommittableMessage<i64> {
        CommittableMessage::new(
            offset,
            "events".to_string(),
            0,
            offset,
            None,
            Arc::new(move || {
                log.lock().unwrap().push(offset);
                true
            }),
        )
    }

    #[test]
    fn test_buffer_and_batch_size_validation() {
        let (_tx, builder) = PipelineBuilder::<CommittableMessage<i64>>::channel(4).unwrap();
        assert!(matches!(
            builder.buffer(1),
            Err(ConfigError::BufferSize(1))
        ));

        let (_tx, builder) = PipelineBuilder::<CommittableMessage<i64>>::channel(4).unwrap();
        assert!(matches!(
            builder.batch(0, Duration::ZERO),
            Err(ConfigError::BatchSize(0))
        ));
    }

    #[test]
    fn test_channel_rejects_zero_capacity() {
        assert!(matches!(
            PipelineBuilder::<CommittableMessage<i64>>::channel(0),
            Err(ConfigError::ChannelCapacity(0))
        ));
    }

    #[tokio::test]
    async fn test_batch_size_only_emission() {
        let (tx, builder) = PipelineBuilder::channel(8).unwrap();
        let (mut out, _handles) = builder.batch(3, Duration::ZERO).unwrap().into_receiver();

        for offset in 0..7 {
            tx.send(message(offset)).await.unwrap();
        }

        let first = timeout(Duration::from_secs(1), out.recv())
            .await
            .unwrap()
            .unwrap();
        let second = timeout(Duration::from_secs(1), out.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 3);

        // The seventh item stays buffered: no timer, no partial emission
        assert!(timeout(Duration::from_millis(100), out.recv())
            .await
            .is_err());

        // Dropping the feed flushes the remainder
        drop(tx);
        let tail = timeout(Duration::from_secs(1), out.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tail.len(), 1);
    }

    #[tokio::test]
    async fn test_batch_timer_flushes_partial_batch() {
        let (tx, builder) = PipelineBuilder::channel(8).unwrap();
        let (mut out, _handles) = builder
            .batch(10, Duration::from_millis(200))
            .unwrap()
            .into_receiver();

        for offset in 0..3 {
            tx.send(message(offset)).await.unwrap();
        }

        // Nothing before the timer fires
        assert!(timeout(Duration::from_millis(100), out.recv())
            .await
            .is_err());

        let flushed = timeout(Duration::from_millis(300), out.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(flushed.len(), 3);
        let offsets: Vec<i64> = flushed.iter().map(|m| m.offset()).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_batch_timer_rearms_after_size_emission() {
        let (tx, builder) = PipelineBuilder::channel(8).unwrap();
        let (mut out, _handles) = builder
            .batch(2, Duration::from_millis(150))
            .unwrap()
            .into_receiver();

        // Full batch just before the initial deadline would fire
        sleep(Duration::from_millis(100)).await;
        tx.send(message(0)).await.unwrap();
        tx.send(message(1)).await.unwrap();
        let full = timeout(Duration::from_millis(100), out.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(full.len(), 2);

        // One more item: flushed by the re-armed timer, not the stale one
        tx.send(message(2)).await.unwrap();
        assert!(timeout(Duration::from_millis(100), out.recv())
            .await
            .is_err());
        let flushed = timeout(Duration::from_millis(200), out.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(flushed.len(), 1);
    }

    #[tokio::test]
    async fn test_action_failure_does_not_abort_stream() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_handler = seen.clone();

        let failing: ActionHandler<CommittableMessage<i64>> =
            Arc::new(|_item| Box::pin(async { Err(anyhow::anyhow!("handler bug")) }));
        let counting: ActionHandler<CommittableMessage<i64>> = Arc::new(move |_item| {
            let seen = seen_in_handler.clone();
            Box::pin(async move {
                seen.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            })
        });

        let (tx, builder) = PipelineBuilder::channel(4).unwrap();
        let (mut out, _handles) = builder.action(vec![failing, counting]).into_receiver();

        for offset in 0..3 {
            tx.send(message(offset)).await.unwrap();
        }
        drop(tx);

        let mut received = 0;
        while let Some(item) = out.recv().await {
            assert_eq!(item.offset(), received);
            received += 1;
        }
        assert_eq!(received, 3);
        // The second handler still ran after the first one failed
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_commit_stage_force_commits_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let (tx, builder) = PipelineBuilder::channel(4).unwrap();
        let (mut out, _handles) = builder.commit().into_receiver();

        for offset in 0..5 {
            tx.send(recording_message(offset, log.clone())).await.unwrap();
        }
        drop(tx);

        let mut forwarded = 0;
        while out.recv().await.is_some() {
            forwarded += 1;
        }
        assert_eq!(forwarded, 5);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_full_chain_preserves_push_order() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let noop = action_handler(|_batch: &mut MessageBatch<i64>| {
            let fut: BoxFuture<'_, anyhow::Result<()>> = Box::pin(async { anyhow::Ok(()) });
            fut
        });

        let (tx, builder) = PipelineBuilder::channel(2).unwrap();
        let pipeline = builder
            .buffer(4)
            .unwrap()
            .batch(2, Duration::from_millis(50))
            .unwrap()
            .action(vec![noop])
            .commit()
            .run();

        for offset in 0..9 {
            tx.send(recording_message(offset, log.clone())).await.unwrap();
        }
        drop(tx);
        pipeline.wait().await;

        // Commit order at the terminal stage equals push order
        assert_eq!(*log.lock().unwrap(), (0..9).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_backpressure_bounds_the_feed() {
        // No stage consumes: a bounded feed channel must reject pushes
        // beyond its capacity instead of buffering them.
        let (tx, _builder) = PipelineBuilder::<CommittableMessage<i64>>::channel(2).unwrap();

        tx.try_send(message(0)).unwrap();
        tx.try_send(message(1)).unwrap();
        assert!(tx.try_send(message(2)).is_err());
    }

    #[tokio::test]
    async fn test_batch_stage_admits_up_to_size_batches() {
        let (tx, builder) = PipelineBuilder::channel(1).unwrap();
        let (mut out, _handles) = builder.batch(2, Duration::ZERO).unwrap().into_receiver();

        // With nothing draining the output: two full batches fit in the
        // stage's bounded output, a third suspends the aggregator
        // mid-send, and one more item fits the feed channel.
        for offset in 0..7 {
            timeout(Duration::from_millis(500), tx.send(message(offset)))
                .await
                .expect("send suspended before the stage bound was reached")
                .unwrap();
        }
        assert!(timeout(Duration::from_millis(100), tx.send(message(7)))
            .await
            .is_err());

        // Draining one batch unblocks the chain
        let first = timeout(Duration::from_secs(1), out.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.len(), 2);
        timeout(Duration::from_secs(1), tx.send(message(7)))
            .await
            .expect("send should proceed once a batch was drained")
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drops_in_flight_batch() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let (tx, builder) = PipelineBuilder::channel(4).unwrap();
        let pipeline = builder
            .batch(10, Duration::from_secs(30))
            .unwrap()
            .commit()
            .run();

        for offset in 0..3 {
            tx.send(recording_message(offset, log.clone())).await.unwrap();
        }
        sleep(Duration::from_millis(50)).await;

        // Abort while the batch is still accumulating
        pipeline.shutdown();
        sleep(Duration::from_millis(50)).await;
        assert!(log.lock().unwrap().is_empty());
    }
}
