//! Debounce: trailing-edge coalescing (§4.7).

// `timer.as_mut().unwrap()` in the select below is guarded by `if timer.is_some()`.
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug_span, Instrument};

use crate::clock::{Clock, Timer};
use crate::concurrency::{spawn_tracked, ActiveTaskCounter, CancelToken};
use crate::processor::{output_channel, Inbox};
use crate::result::Result as StreamItem;

/// Emits only the most recently received successful item, and only after
/// `interval` of inactivity since it arrived. Errors always pass through
/// immediately. Cancellation stops the pending timer and exits without
/// flushing whatever item was waiting.
pub struct Debounce {
    name: String,
    interval: Duration,
    buffer_size: usize,
    clock: Clock,
    task_counter: Option<ActiveTaskCounter>,
}

impl Debounce {
    /// A debounce emitting the latest successful item after `interval` of
    /// silence.
    pub fn new(interval: Duration, clock: Clock) -> Self {
        Self {
            name: "debounce".to_string(),
            interval,
            buffer_size: 0,
            clock,
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

    /// Route this processor's owning task through a shared
    /// [`ActiveTaskCounter`] instead of a bare `tokio::spawn`.
    pub fn with_task_counter(mut self, counter: ActiveTaskCounter) -> Self {
        self.task_counter = Some(counter);
        self
    }

    /// This debounce's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the owning task and return the output channel.
    pub fn process<T>(self: Arc<Self>, ctx: CancelToken, mut input: Inbox<T>) -> Inbox<T>
    where
        T: Send + 'static,
    {
        let (tx, rx) = output_channel(self.buffer_size);
        let name = self.name.clone();
        let task_counter = self.task_counter.clone();

        spawn_tracked(
            task_counter.as_ref(),
            async move {
                let mut pending: Option<StreamItem<T>> = None;
                let mut timer: Option<Timer> = None;

                loop {
                    if let Some(t) = timer.as_ref() {
                        if t.is_ready() {
                            timer = None;
                            if let Some(item) = pending.take() {
                                if tx.send(item).await.is_err() {
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
                            if let Some(item) = pending.take() {
                                if tx.send(item).await.is_err() {
                                    break;
                                }
                            }
                        }
                        item = input.recv() => {
                            match item {
                                None => {
                                    if let Some(item) = pending.take() {
                                        let _ = tx.send(item).await;
                                    }
                                    break;
                                }
                                Some(item) => {
                                    if item.is_error() {
                                        if tx.send(item).await.is_err() {
                                            break;
                                        }
                                    } else {
                                        pending = Some(item);
                                        timer = Some(self.clock.new_timer(self.interval));
                                    }
                                }
                            }
                        }
                    }
                }
            }
            .instrument(debug_span!("debounce", name = %name)),
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
    async fn emits_only_the_latest_item_after_silence() {
        let (clock, fake) = Clock::fake();
        let (tx, input) = output_channel::<i32>(16);
        let debounce = Arc::new(Debounce::new(Duration::from_millis(10), clock));
        let mut out = debounce.process(CancelToken::new(), input);

        tx.send(StreamItem::new_success(1)).await.unwrap();
        tokio::task::yield_now().await;
        tx.send(StreamItem::new_success(2)).await.unwrap();
        tokio::task::yield_now().await;
        tx.send(StreamItem::new_success(3)).await.unwrap();

        fake.advance(Duration::from_millis(10));
        fake.block_until_ready().await;
        drop(tx);

        let emitted = out.recv().await.unwrap();
        assert_eq!(*emitted.value(), 3);
        assert!(out.recv().await.is_none());
    }
}
