//! DeadLetterQueue: split successes from failures, dropping under backpressure (§4.11).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug_span, Instrument};

use crate::clock::Clock;
use crate::concurrency::{spawn_tracked, ActiveTaskCounter, CancelToken};
use crate::processor::{output_channel, Inbox};

/// Splits a `Result<T>` stream into a successes channel and a failures
/// channel. A single distributor task attempts to forward each item to the
/// appropriate channel, racing the send against a short timeout; if the
/// consumer on that side is absent or blocked past the timeout the item is
/// dropped and [`DeadLetterQueue::dropped_count`] is incremented. This is
/// an explicit at-most-once, deadlock-avoidance policy, not a bug: a slow
/// or missing consumer on one side must never stall the other.
pub struct DeadLetterQueue {
    name: String,
    drop_timeout: Duration,
    clock: Clock,
    buffer_size: usize,
    dropped_count: Arc<AtomicU64>,
    task_counter: Option<ActiveTaskCounter>,
}

impl DeadLetterQueue {
    /// A DLQ with the default 50ms drop timeout.
    pub fn new(clock: Clock) -> Self {
        Self {
            name: "dead_letter_queue".to_string(),
            drop_timeout: Duration::from_millis(50),
            clock,
            buffer_size: 0,
            dropped_count: Arc::new(AtomicU64::new(0)),
            task_counter: None,
        }
    }

    /// Override how long the distributor waits for a slow consumer before
    /// dropping an item.
    pub fn with_drop_timeout(mut self, timeout: Duration) -> Self {
        self.drop_timeout = timeout;
        self
    }

    /// Override the name used in spans and log lines.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Override both output channels' buffer size.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Route this processor's owning task through a shared
    /// [`ActiveTaskCounter`] instead of a bare `tokio::spawn`.
    pub fn with_task_counter(mut self, counter: ActiveTaskCounter) -> Self {
        self.task_counter = Some(counter);
        self
    }

    /// This DLQ's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total items dropped so far due to a blocked or absent consumer.
    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::SeqCst)
    }

    /// Spawn the distributor task and return `(successes, failures)`.
    pub fn process<T>(self: Arc<Self>, ctx: CancelToken, mut input: Inbox<T>) -> (Inbox<T>, Inbox<T>)
    where
        T: Send + 'static,
    {
        let (success_tx, success_rx) = output_channel(self.buffer_size);
        let (failure_tx, failure_rx) = output_channel(self.buffer_size);
        let name = self.name.clone();
        let task_counter = self.task_counter.clone();

        spawn_tracked(
            task_counter.as_ref(),
            async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = ctx.cancelled() => break,
                        item = input.recv() => {
                            match item {
                                None => break,
                                Some(item) => {
                                    let kind = if item.is_success() { "success" } else { "failure" };
                                    let send_fut = if item.is_success() {
                                        success_tx.send(item)
                                    } else {
                                        failure_tx.send(item)
                                    };
                                    tokio::select! {
                                        biased;
                                        _ = ctx.cancelled() => break,
                                        result = send_fut => {
                                            if result.is_err() {
                                                break;
                                            }
                                        }
                                        _ = self.clock.sleep(self.drop_timeout) => {
                                            let dropped_count = self.dropped_count.fetch_add(1, Ordering::SeqCst) + 1;
                                            tracing::warn!(kind, dropped_count, "dead letter dropped");
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
            .instrument(debug_span!("dead_letter_queue", name = %name)),
        );

        (success_rx, failure_rx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::processor::output_channel;
    use crate::result::Result as StreamItem;

    #[tokio::test]
    async fn unconsumed_failures_are_dropped_without_deadlock() {
        let (clock, fake) = Clock::fake();
        let (tx, input) = output_channel::<i32>(8);
        let dlq = Arc::new(
            DeadLetterQueue::new(clock)
                .with_drop_timeout(Duration::from_millis(10))
                .with_buffer_size(1),
        );
        let (mut successes, _failures) = dlq.clone().process(CancelToken::new(), input);

        tx.send(StreamItem::new_success(1)).await.unwrap();
        // The failure channel has room for exactly one buffered item and no
        // consumer ever drains it; the second failure has nowhere to go and
        // must be dropped once the drop timeout elapses.
        tx.send(StreamItem::new_error(Some(2), crate::result::Message::new("boom"), "src"))
            .await
            .unwrap();
        tx.send(StreamItem::new_error(Some(3), crate::result::Message::new("boom"), "src"))
            .await
            .unwrap();
        drop(tx);

        let first = successes.recv().await.unwrap();
        assert_eq!(*first.value(), 1);

        fake.advance(Duration::from_millis(10));
        fake.block_until_ready().await;

        assert!(dlq.dropped_count() > 0);
    }
}
