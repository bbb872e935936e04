//! Fan-in: merge N input channels into one (§4.2).

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug_span;
use tracing::Instrument;

use crate::concurrency::{spawn_tracked, ActiveTaskCounter, CancelToken};
use crate::processor::{output_channel, Inbox};
use crate::result::Result as StreamItem;

/// Merges several input channels into a single output channel, preserving
/// per-input order. Cross-input interleaving is unspecified.
pub struct FanIn {
    name: String,
    buffer_size: usize,
    task_counter: Option<ActiveTaskCounter>,
}

impl FanIn {
    /// A fan-in with the default output buffer size.
    pub fn new() -> Self {
        Self {
            name: "fan_in".to_string(),
            buffer_size: 0,
            task_counter: None,
        }
    }

    /// Override the name used in spans.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Override the output channel's buffer size.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Route this processor's owning task and its per-input reader tasks
    /// through a shared [`ActiveTaskCounter`] instead of a bare
    /// `tokio::spawn`.
    pub fn with_task_counter(mut self, counter: ActiveTaskCounter) -> Self {
        self.task_counter = Some(counter);
        self
    }

    /// Reader's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn one reader task per input plus a joining task, merging every
    /// input into a single output. The output closes once every input has
    /// closed or `ctx` is cancelled.
    pub fn process<T>(self: Arc<Self>, ctx: CancelToken, inputs: Vec<Inbox<T>>) -> Inbox<T>
    where
        T: Send + 'static,
    {
        let (tx, rx) = output_channel(self.buffer_size);
        let name = self.name.clone();
        let task_counter = self.task_counter.clone();

        spawn_tracked(
            task_counter.as_ref(),
            async move {
                let mut readers = Vec::with_capacity(inputs.len());
                for mut input in inputs {
                    let tx = tx.clone();
                    let ctx = ctx.clone();
                    let task_counter = task_counter.clone();
                    readers.push(spawn_tracked(task_counter.as_ref(), async move {
                        loop {
                            tokio::select! {
                                biased;
                                _ = ctx.cancelled() => break,
                                item = input.recv() => {
                                    match item {
                                        Some(item) => {
                                            tokio::select! {
                                                biased;
                                                _ = ctx.cancelled() => break,
                                                send = tx.send(item) => { if send.is_err() { break; } }
                                            }
                                        }
                                        None => break,
                                    }
                                }
                            }
                        }
                    }));
                }
                drop(tx);
                for reader in readers {
                    let _ = reader.await;
                }
            }
            .instrument(debug_span!("fan_in", name = %name)),
        );

        rx
    }
}

impl Default for FanIn {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::processor::output_channel;

    #[tokio::test]
    async fn preserves_per_source_order_and_merges_all() {
        let (tx_a, rx_a) = output_channel::<i32>(8);
        let (tx_b, rx_b) = output_channel::<i32>(8);

        tx_a.send(StreamItem::new_success(1)).await.unwrap();
        tx_a.send(StreamItem::new_success(2)).await.unwrap();
        drop(tx_a);
        tx_b.send(StreamItem::new_success(10)).await.unwrap();
        tx_b.send(StreamItem::new_success(20)).await.unwrap();
        drop(tx_b);

        let ctx = CancelToken::new();
        let fan_in = Arc::new(FanIn::new());
        let mut out = fan_in.process(ctx, vec![rx_a, rx_b]);

        let mut from_a = Vec::new();
        let mut from_b = Vec::new();
        let mut total = 0;
        while let Some(item) = out.recv().await {
            total += 1;
            let v = *item.value();
            if v < 10 {
                from_a.push(v);
            } else {
                from_b.push(v);
            }
        }
        assert_eq!(total, 4);
        assert_eq!(from_a, vec![1, 2]);
        assert_eq!(from_b, vec![10, 20]);
    }

    #[tokio::test]
    async fn closes_promptly_on_cancellation() {
        let (_tx, rx) = output_channel::<i32>(8);
        let ctx = CancelToken::new();
        let fan_in = Arc::new(FanIn::new());
        let mut out = fan_in.process(ctx.clone(), vec![rx]);
        ctx.cancel();
        let drained = tokio::time::timeout(std::time::Duration::from_millis(200), out.recv()).await;
        assert!(drained.is_ok());
    }
}
