//! Buffer: a fixed-capacity decoupling queue (§4.3).

use std::sync::Arc;
use tracing::{debug_span, Instrument};

use crate::concurrency::{spawn_tracked, ActiveTaskCounter, CancelToken};
use crate::processor::{output_channel, Inbox};

/// A fixed-capacity queue that decouples a producer from a consumer.
/// Forwards items (successes and errors alike) in arrival order. On
/// cancellation it exits promptly; an item already being sent may be
/// dropped rather than blocking forever for a slow or absent consumer.
pub struct Buffer {
    name: String,
    capacity: usize,
    task_counter: Option<ActiveTaskCounter>,
}

impl Buffer {
    /// A buffer with the given capacity. `0` is clamped to `1`.
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            tracing::warn!(requested = capacity, "buffer capacity clamped to 1");
            1
        } else {
            capacity
        };
        Self {
            name: "buffer".to_string(),
            capacity,
            task_counter: None,
        }
    }

    /// Override the name used in spans.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Route this processor's owning task through a shared
    /// [`ActiveTaskCounter`] instead of a bare `tokio::spawn`, so tests can
    /// assert the pipeline's active-task count returns to baseline after
    /// drain.
    pub fn with_task_counter(mut self, counter: ActiveTaskCounter) -> Self {
        self.task_counter = Some(counter);
        self
    }

    /// This buffer's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the owning task and return the output channel.
    pub fn process<T>(self: Arc<Self>, ctx: CancelToken, mut input: Inbox<T>) -> Inbox<T>
    where
        T: Send + 'static,
    {
        let (tx, rx) = output_channel(self.capacity);
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
                                    tokio::select! {
                                        biased;
                                        _ = ctx.cancelled() => break,
                                        _ = tx.send(item) => {}
                                    }
                                }
                            }
                        }
                    }
                }
            }
            .instrument(debug_span!("buffer", name = %name)),
        );

        rx
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::processor::output_channel;
    use crate::result::Result as StreamItem;

    #[tokio::test]
    async fn forwards_items_in_arrival_order() {
        let (tx, input) = output_channel::<i32>(8);
        for v in [1, 2, 3] {
            tx.send(StreamItem::new_success(v)).await.unwrap();
        }
        drop(tx);

        let buffer = Arc::new(Buffer::new(4));
        let mut out = buffer.process(CancelToken::new(), input);

        let mut values = Vec::new();
        while let Some(item) = out.recv().await {
            values.push(*item.value());
        }
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn zero_capacity_is_clamped_to_one() {
        let buffer = Buffer::new(0);
        assert_eq!(buffer.capacity, 1);
    }
}
