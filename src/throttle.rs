//! Throttle: at most one successful item per interval (§4.7).

// `blocked_until.as_mut().unwrap()` in the select below is guarded by
// `if blocked_until.is_some()`.
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug_span, Instrument};

use crate::clock::{Clock, Timer};
use crate::concurrency::{spawn_tracked, ActiveTaskCounter, CancelToken};
use crate::processor::{output_channel, Inbox};

/// Forwards at most one successful item per `interval`; intervening
/// successes are dropped. Errors always pass through. Uses the same
/// two-phase select idiom as [`crate::batcher::Batcher`] for deterministic
/// behavior under a fake clock.
pub struct Throttle {
    name: String,
    interval: Duration,
    buffer_size: usize,
    clock: Clock,
    task_counter: Option<ActiveTaskCounter>,
}

impl Throttle {
    /// A throttle admitting at most one successful item per `interval`.
    pub fn new(interval: Duration, clock: Clock) -> Self {
        Self {
            name: "throttle".to_string(),
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

    /// This throttle's name.
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
                let mut blocked_until: Option<Timer> = None;

                loop {
                    if let Some(t) = blocked_until.as_ref() {
                        if t.is_ready() {
                            blocked_until = None;
                            continue;
                        }
                    }

                    tokio::select! {
                        biased;
                        _ = ctx.cancelled() => break,
                        _ = blocked_until.as_mut().unwrap().recv(), if blocked_until.is_some() => {
                            blocked_until = None;
                        }
                        item = input.recv() => {
                            match item {
                                None => break,
                                Some(item) => {
                                    if item.is_error() || blocked_until.is_none() {
                                        if !item.is_error() {
                                            blocked_until = Some(self.clock.new_timer(self.interval));
                                        }
                                        if tx.send(item).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
            .instrument(debug_span!("throttle", name = %name)),
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
    async fn drops_intervening_successes() {
        let (clock, fake) = Clock::fake();
        let (tx, input) = output_channel::<i32>(16);
        let throttle = Arc::new(Throttle::new(Duration::from_millis(10), clock));
        let mut out = throttle.process(CancelToken::new(), input);

        tx.send(StreamItem::new_success(1)).await.unwrap();
        tx.send(StreamItem::new_success(2)).await.unwrap();
        tx.send(StreamItem::new_success(3)).await.unwrap();

        let first = out.recv().await.unwrap();
        assert_eq!(*first.value(), 1);

        fake.advance(Duration::from_millis(10));
        fake.block_until_ready().await;

        tx.send(StreamItem::new_success(4)).await.unwrap();
        drop(tx);

        let second = out.recv().await.unwrap();
        assert_eq!(*second.value(), 4);
        assert!(out.recv().await.is_none());
    }
}
