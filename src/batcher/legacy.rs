//! Legacy `T -> Vec<T>` batcher form, kept as a thin wrapper over the
//! canonical `Result<T> -> Result<Vec<T>>` [`super::Batcher`] (§9, open
//! questions).

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::batcher::Batcher;
use crate::clock::Clock;
use crate::concurrency::CancelToken;
use crate::processor::{output_channel, DEFAULT_CHANNEL_CAPACITY};
use crate::result::Result as StreamItem;

fn adapt_raw_input<T: Send + 'static>(mut raw: mpsc::Receiver<T>) -> crate::processor::Inbox<T> {
    let (tx, rx) = output_channel(DEFAULT_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        while let Some(v) = raw.recv().await {
            if tx.send(StreamItem::new_success(v)).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// Legacy batcher: `T -> Vec<T>`, no `Result` envelope either side. Since
/// the legacy form never had anywhere to carry a failed item, any error
/// batch the underlying [`Batcher`] would have produced is silently
/// dropped rather than surfaced.
pub struct LegacyBatcher {
    max_size: usize,
    max_latency: Duration,
    clock: Clock,
}

impl LegacyBatcher {
    /// `max_size == 0` is clamped to `1`, same as the canonical batcher.
    pub fn new(max_size: usize, max_latency: Duration, clock: Clock) -> Self {
        Self {
            max_size,
            max_latency,
            clock,
        }
    }

    /// Run the batcher over a plain (non-`Result`) input channel.
    pub fn process<T>(self, ctx: CancelToken, raw: mpsc::Receiver<T>) -> mpsc::Receiver<Vec<T>>
    where
        T: Send + 'static,
    {
        let tagged = adapt_raw_input(raw);
        let mut batched = Arc::new(Batcher::new(self.max_size, self.max_latency, self.clock)).process(ctx, tagged);
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(item) = batched.recv().await {
                if item.is_error() {
                    continue;
                }
                if tx.send(item.into_value()).await.is_err() {
                    break;
                }
            }
        });
        rx
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn legacy_batcher_batches_plain_values() {
        let (clock, fake) = Clock::fake();
        let (tx, raw) = mpsc::channel::<i32>(8);
        let legacy = LegacyBatcher::new(3, Duration::from_millis(100), clock);
        let mut out = legacy.process(CancelToken::new(), raw);

        for v in [1, 2, 3, 4, 5] {
            tx.send(v).await.unwrap();
        }
        let first = out.recv().await.unwrap();
        assert_eq!(first, vec![1, 2, 3]);

        fake.advance(Duration::from_millis(100));
        fake.block_until_ready().await;
        let second = out.recv().await.unwrap();
        assert_eq!(second, vec![4, 5]);

        drop(tx);
        assert!(out.recv().await.is_none());
    }
}
