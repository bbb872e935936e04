//! Batcher: size-OR-latency batching via the two-phase select (§4.4).

// `timer.as_mut().unwrap()` in the select below is guarded by `if timer.is_some()`.
#![allow(clippy::unwrap_used)]

pub mod legacy;

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug_span, Instrument};

use crate::clock::{Clock, Timer};
use crate::concurrency::{spawn_tracked, ActiveTaskCounter, CancelToken};
use crate::processor::{output_channel, Inbox};
use crate::result::Result as StreamItem;

/// Collects successful items into batches, emitting a batch when `max_size`
/// is reached, when `max_latency` elapses since the first item of a fresh
/// batch, or when the input closes with a non-empty pending batch. Errors
/// bypass batching and are forwarded immediately, re-typed from
/// `Result<T>` to `Result<Vec<T>>`.
pub struct Batcher {
    name: String,
    max_size: usize,
    max_latency: Duration,
    buffer_size: usize,
    clock: Clock,
    task_counter: Option<ActiveTaskCounter>,
}

impl Batcher {
    /// `max_size == 0` is clamped to `1`. `max_latency == 0` disables the
    /// time trigger entirely (size-only batching).
    pub fn new(max_size: usize, max_latency: Duration, clock: Clock) -> Self {
        let max_size = if max_size == 0 {
            tracing::warn!("batcher max_size clamped to 1");
            1
        } else {
            max_size
        };
        Self {
            name: "batcher".to_string(),
            max_size,
            max_latency,
            buffer_size: 0,
            clock,
            task_counter: None,
        }
    }

    /// Override the name used in spans and error Results.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Override the output channel's buffer size.
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

    /// This batcher's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the owning task and return the output channel of batches.
    pub fn process<T>(self: Arc<Self>, ctx: CancelToken, mut input: Inbox<T>) -> Inbox<Vec<T>>
    where
        T: Send + 'static,
    {
        let (tx, rx) = output_channel(self.buffer_size);
        let name = self.name.clone();
        let task_counter = self.task_counter.clone();

        spawn_tracked(
            task_counter.as_ref(),
            async move {
                let mut pending: Vec<T> = Vec::new();
                let mut timer: Option<Timer> = None;

                loop {
                    // Phase one: non-blocking check so a timer that already
                    // expired is observed before we consider new input.
                    if let Some(t) = timer.as_ref() {
                        if t.is_ready() {
                            timer = None;
                            if !pending.is_empty() {
                                let batch = std::mem::take(&mut pending);
                                if tx.send(StreamItem::new_success(batch)).await.is_err() {
                                    break;
                                }
                            }
                            continue;
                        }
                    }

                    tokio::select! {
                        biased;
                        _ = ctx.cancelled() => break,
                        _ = timer.as_mut().unwrap().recv(), if timer.is_some() => {
                            timer = None;
                            if !pending.is_empty() {
                                let batch = std::mem::take(&mut pending);
                                if tx.send(StreamItem::new_success(batch)).await.is_err() {
                                    break;
                                }
                            }
                        }
                        item = input.recv() => {
                            match item {
                                None => {
                                    if !pending.is_empty() {
                                        let batch = std::mem::take(&mut pending);
                                        let _ = tx.send(StreamItem::new_success(batch)).await;
                                    }
                                    break;
                                }
                                Some(item) => {
                                    if item.is_error() {
                                        let converted = item.map(|v| vec![v]);
                                        if tx.send(converted).await.is_err() {
                                            break;
                                        }
                                        continue;
                                    }
                                    if pending.is_empty() && !self.max_latency.is_zero() {
                                        timer = Some(self.clock.new_timer(self.max_latency));
                                    }
                                    pending.push(item.into_value());
                                    if pending.len() >= self.max_size {
                                        timer = None;
                                        let batch = std::mem::take(&mut pending);
                                        if tx.send(StreamItem::new_success(batch)).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
            .instrument(debug_span!("batcher", name = %name)),
        );

        rx
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::processor::output_channel;

    #[tokio::test]
    async fn emits_size_or_time_or_flush() {
        let (clock, fake) = Clock::fake();
        let (tx, input) = output_channel::<i32>(16);
        let batcher = Arc::new(Batcher::new(3, Duration::from_millis(100), clock));
        let mut out = batcher.clone().process(CancelToken::new(), input);

        for v in [1, 2, 3, 4, 5] {
            tx.send(StreamItem::new_success(v)).await.unwrap();
        }
        let first = out.recv().await.unwrap();
        assert_eq!(*first.value(), vec![1, 2, 3]);

        fake.advance(Duration::from_millis(100));
        fake.block_until_ready().await;
        let second = out.recv().await.unwrap();
        assert_eq!(*second.value(), vec![4, 5]);

        tx.send(StreamItem::new_success(6)).await.unwrap();
        tx.send(StreamItem::new_success(7)).await.unwrap();
        drop(tx);
        let third = out.recv().await.unwrap();
        assert_eq!(*third.value(), vec![6, 7]);
        assert!(out.recv().await.is_none());
    }

    #[tokio::test]
    async fn errors_forward_immediately() {
        let (clock, _fake) = Clock::fake();
        let (tx, input) = output_channel::<i32>(16);
        let batcher = Arc::new(Batcher::new(10, Duration::from_secs(1), clock));
        let mut out = batcher.process(CancelToken::new(), input);

        tx.send(StreamItem::new_error(Some(1), crate::result::Message::new("boom"), "src"))
            .await
            .unwrap();
        drop(tx);

        let forwarded = out.recv().await.unwrap();
        assert!(forwarded.is_error());
        assert!(out.recv().await.is_none());
    }

    #[test]
    fn zero_max_size_is_clamped_to_one() {
        let (clock, _fake) = Clock::fake();
        let batcher = Batcher::new(0, Duration::from_millis(1), clock);
        assert_eq!(batcher.max_size, 1);
    }
}
