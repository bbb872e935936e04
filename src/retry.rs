//! Retry: bounded retries with exponential backoff and classification (§4.9).

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug_span, Instrument};

use crate::clock::Clock;
use crate::concurrency::{spawn_tracked, ActiveTaskCounter, CancelToken};
use crate::error::StreamError;
use crate::processor::{output_channel, Inbox, Processor};
use crate::result::Result as StreamItem;

/// Decide whether a failed attempt should be retried. Receives the error
/// message and the (zero-based) attempt number that just failed.
pub type ShouldRetry = Arc<dyn Fn(&str, u32) -> bool + Send + Sync>;

/// Default classification: transient-looking causes (timeout, connection,
/// network, rate limit) are retryable; auth/not-found/invalid-input look
/// permanent and are not; anything else unrecognized is retried, since a
/// false negative (giving up on something transient) is worse than a false
/// positive (one extra wasted attempt).
pub fn default_should_retry(message: &str, _attempt: u32) -> bool {
    let lower = message.to_lowercase();
    const NON_RETRYABLE: &[&str] = &["auth", "unauthorized", "not found", "invalid input", "invalid argument"];
    if NON_RETRYABLE.iter().any(|needle| lower.contains(needle)) {
        return false;
    }
    true
}

/// Wraps an inner [`Processor`], retrying each item against it up to
/// `max_attempts` times with exponential backoff (`base_delay * 2^attempt`,
/// capped at `max_delay`, with optional 50%-100% jitter) before giving up.
pub struct Retry<In, Out> {
    name: String,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    with_jitter: bool,
    call_timeout: Duration,
    should_retry: ShouldRetry,
    clock: Clock,
    inner: Arc<dyn Processor<In, Out>>,
    buffer_size: usize,
    task_counter: Option<ActiveTaskCounter>,
}

impl<In, Out> Retry<In, Out>
where
    In: Clone + Send + 'static,
    Out: Send + 'static,
{
    /// Wrap `inner`, retrying up to `max_attempts` times (clamped to at
    /// least 1) with the given backoff parameters.
    pub fn new(
        inner: Arc<dyn Processor<In, Out>>,
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        clock: Clock,
    ) -> Self {
        let max_attempts = max_attempts.max(1);
        Self {
            name: "retry".to_string(),
            max_attempts,
            base_delay,
            max_delay,
            with_jitter: true,
            call_timeout: Duration::from_secs(30),
            should_retry: Arc::new(default_should_retry),
            clock,
            inner,
            buffer_size: 0,
            task_counter: None,
        }
    }

    /// Enable or disable 50%-100% jitter on the computed backoff.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.with_jitter = enabled;
        self
    }

    /// Per-attempt timeout waiting on the inner processor.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Override the retry classification function.
    pub fn with_should_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, u32) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(f);
        self
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

    /// This retry wrapper's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = 2u64.saturating_pow(attempt);
        let base = self.base_delay.as_millis() as u64;
        let uncapped = base.saturating_mul(exp);
        let capped = uncapped.min(self.max_delay.as_millis() as u64);
        let millis = if self.with_jitter && capped > 0 {
            let floor = capped / 2;
            floor + fastrand::u64(0..=(capped - floor))
        } else {
            capped
        };
        Duration::from_millis(millis)
    }

    async fn call_inner(&self, ctx: &CancelToken, value: In) -> Option<StreamItem<Out>> {
        let (tx, rx) = output_channel::<In>(1);
        let _ = tx.send(StreamItem::new_success(value)).await;
        drop(tx);

        let child_ctx = ctx.child_token();
        let mut inner_out = Arc::clone(&self.inner).process(child_ctx, rx);

        tokio::select! {
            biased;
            _ = ctx.cancelled() => None,
            _ = self.clock.sleep(self.call_timeout) => None,
            result = inner_out.recv() => result,
        }
    }

    /// Spawn the owning task and return the output channel.
    pub fn process(self: Arc<Self>, ctx: CancelToken, mut input: Inbox<In>) -> Inbox<Out> {
        let (tx, rx) = output_channel(self.buffer_size);
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
                                    if item.is_error() {
                                        if tx.send(item.map(|_: In| -> Out { unreachable!() })).await.is_err() {
                                            break;
                                        }
                                        continue;
                                    }
                                    let value = item.into_value();
                                    if self.run_with_retries(&ctx, &tx, value).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
            }
            .instrument(debug_span!("retry", name = %name)),
        );

        rx
    }

    async fn run_with_retries(
        &self,
        ctx: &CancelToken,
        tx: &tokio::sync::mpsc::Sender<StreamItem<Out>>,
        value: In,
    ) -> Result<(), ()> {
        let mut attempt = 0u32;
        loop {
            match self.call_inner(ctx, value.clone()).await {
                Some(result) if result.is_success() => {
                    return tx.send(result).await.map_err(|_| ());
                }
                Some(result) => {
                    let message = result
                        .error()
                        .map(|e| e.cause.to_string())
                        .unwrap_or_default();
                    if !self.give_up_or_wait(ctx, &message, &mut attempt).await {
                        return Ok(());
                    }
                }
                None => {
                    let message = StreamError::Timeout(self.call_timeout).to_string();
                    if !self.give_up_or_wait(ctx, &message, &mut attempt).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Returns `true` if the caller should retry again, `false` if the
    /// item has been given up on (either non-retryable or attempts exhausted).
    async fn give_up_or_wait(&self, ctx: &CancelToken, message: &str, attempt: &mut u32) -> bool {
        if !(self.should_retry)(message, *attempt) || *attempt + 1 >= self.max_attempts {
            tracing::debug!(attempt, message, "retry giving up");
            return false;
        }
        let delay = self.backoff_for(*attempt);
        tracing::debug!(attempt, ?delay, message, "retry scheduling backoff");
        *attempt += 1;
        tokio::select! {
            biased;
            _ = ctx.cancelled() => false,
            _ = self.clock.sleep(delay) => true,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::processor::output_channel;
    use futures::FutureExt;

    struct AlwaysFails;
    impl Processor<i32, i32> for AlwaysFails {
        fn name(&self) -> &str {
            "always_fails"
        }
        fn process(self: Arc<Self>, ctx: CancelToken, mut input: Inbox<i32>) -> Inbox<i32> {
            let (tx, rx) = output_channel(1);
            tokio::spawn(async move {
                while let Some(_item) = input.recv().await {
                    if ctx.is_cancelled() {
                        break;
                    }
                    let _ = tx
                        .send(StreamItem::new_error(None, crate::result::Message::new("boom"), "always_fails"))
                        .await;
                }
            });
            rx
        }
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let (clock, fake) = Clock::fake();
        let inner: Arc<dyn Processor<i32, i32>> = Arc::new(AlwaysFails);
        let retry = Arc::new(
            Retry::new(inner, 3, Duration::from_millis(1), Duration::from_millis(10), clock.clone())
                .with_jitter(false),
        );

        let (tx, input) = output_channel::<i32>(4);
        tx.send(StreamItem::new_success(1)).await.unwrap();
        drop(tx);

        let ctx = CancelToken::new();
        let mut out = retry.process(ctx, input);

        // Drain in the background while driving the fake clock forward so
        // the backoff sleeps resolve.
        let handle = tokio::spawn(async move { out.recv().await });
        for _ in 0..5 {
            tokio::task::yield_now().await;
            fake.advance(Duration::from_millis(10));
            fake.block_until_ready().await;
        }
        let result = handle.now_or_never();
        // The item exhausted its retries and was dropped (§4.9): the
        // output channel closes with no Result ever sent for it, so
        // `recv()` resolves to `None`, not a final error Result.
        assert!(result.unwrap().unwrap().is_none());
    }
}
