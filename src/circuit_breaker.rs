//! CircuitBreaker: Closed/Open/HalfOpen state machine (§4.10).

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug_span, Instrument};

use crate::atomic_time::AtomicTime;
use crate::clock::Clock;
use crate::concurrency::{spawn_tracked, ActiveTaskCounter, CancelToken};
use crate::processor::{output_channel, Inbox, Processor};
use crate::result::Result as StreamItem;

/// The circuit breaker's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Requests pass through to the inner processor.
    Closed,
    /// Requests are rejected without reaching the inner processor.
    Open,
    /// A limited number of probe requests are admitted to test recovery.
    HalfOpen,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => State::Closed,
            1 => State::Open,
            _ => State::HalfOpen,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            State::Closed => 0,
            State::Open => 1,
            State::HalfOpen => 2,
        }
    }
}

/// A point-in-time snapshot of the breaker's counters, passed to
/// [`CircuitBreaker::on_open`] callbacks.
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    /// Requests observed since the last state transition.
    pub requests: u64,
    /// Failures observed since the last state transition.
    pub failures: u64,
}

type StateChangeCallback = Arc<dyn Fn(State, State) + Send + Sync>;
type OpenCallback = Arc<dyn Fn(Stats) + Send + Sync>;

/// Protects a wrapped [`Processor`] with a Closed/Open/HalfOpen state
/// machine. See §4.10 for the transition rules.
pub struct CircuitBreaker<In, Out> {
    name: String,
    failure_threshold: f64,
    min_requests: u64,
    recovery_timeout: Duration,
    half_open_requests: u32,
    call_timeout: Duration,
    clock: Clock,
    inner: Arc<dyn Processor<In, Out>>,
    buffer_size: usize,
    task_counter: Option<ActiveTaskCounter>,

    state: AtomicU8,
    requests: AtomicU64,
    failures: AtomicU64,
    half_open_admitted: AtomicU32,
    last_state_change: AtomicTime,
    last_failure_time: AtomicTime,

    on_state_change: Option<StateChangeCallback>,
    on_open: Option<OpenCallback>,
}

impl<In, Out> CircuitBreaker<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// A breaker over `inner`. `failure_threshold` is clamped to `[0, 1]`;
    /// `min_requests` and `half_open_requests` are clamped to at least 1.
    pub fn new(
        inner: Arc<dyn Processor<In, Out>>,
        failure_threshold: f64,
        min_requests: u64,
        recovery_timeout: Duration,
        clock: Clock,
    ) -> Self {
        let failure_threshold = failure_threshold.clamp(0.0, 1.0);
        let min_requests = min_requests.max(1);
        Self {
            name: "circuit_breaker".to_string(),
            failure_threshold,
            min_requests,
            recovery_timeout,
            half_open_requests: 1,
            call_timeout: Duration::from_secs(30),
            clock,
            inner,
            buffer_size: 0,
            task_counter: None,
            state: AtomicU8::new(State::Closed.as_u8()),
            requests: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            half_open_admitted: AtomicU32::new(0),
            last_state_change: AtomicTime::never(),
            last_failure_time: AtomicTime::never(),
            on_state_change: None,
            on_open: None,
        }
    }

    /// Number of probe requests admitted while HalfOpen. Clamped to at
    /// least 1.
    pub fn with_half_open_requests(mut self, n: u32) -> Self {
        self.half_open_requests = n.max(1);
        self
    }

    /// Per-request timeout waiting on the inner processor.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Callback fired whenever the state transitions.
    pub fn on_state_change<F>(mut self, f: F) -> Self
    where
        F: Fn(State, State) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(f));
        self
    }

    /// Callback fired when the breaker opens, with the stats that caused it.
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(Stats) + Send + Sync + 'static,
    {
        self.on_open = Some(Arc::new(f));
        self
    }

    /// Override the name used in spans and log lines.
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

    /// This breaker's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, for observability.
    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: State, to: State) {
        self.state.store(to.as_u8(), Ordering::SeqCst);
        self.last_state_change.store(self.clock.now());
        if to == State::Closed {
            self.requests.store(0, Ordering::SeqCst);
            self.failures.store(0, Ordering::SeqCst);
        }
        if to == State::HalfOpen {
            self.half_open_admitted.store(0, Ordering::SeqCst);
        }
        tracing::info!(name = %self.name, ?from, ?to, "circuit breaker state transition");
        if let Some(cb) = &self.on_state_change {
            cb(from, to);
        }
        if to == State::Open {
            let stats = Stats {
                requests: self.requests.load(Ordering::SeqCst),
                failures: self.failures.load(Ordering::SeqCst),
            };
            if let Some(cb) = &self.on_open {
                cb(stats);
            }
        }
    }

    /// `true` if a request may proceed to the inner processor right now.
    /// Has the side effect of flipping Open -> HalfOpen once the recovery
    /// timeout has elapsed, and of admitting (or rejecting) HalfOpen probes.
    pub fn allow_request(&self) -> bool {
        match self.state() {
            State::Closed => true,
            State::Open => {
                let recovery = chrono::Duration::from_std(self.recovery_timeout).unwrap_or_else(|_| chrono::Duration::zero());
                let elapsed = self
                    .last_state_change
                    .load()
                    .map(|last| self.clock.now() - last >= recovery)
                    .unwrap_or(true);
                if elapsed {
                    self.transition(State::Open, State::HalfOpen);
                    self.half_open_admitted.fetch_add(1, Ordering::SeqCst) < self.half_open_requests
                } else {
                    false
                }
            }
            State::HalfOpen => {
                let admitted = self.half_open_admitted.fetch_add(1, Ordering::SeqCst);
                if admitted < self.half_open_requests {
                    true
                } else {
                    self.half_open_admitted.fetch_sub(1, Ordering::SeqCst);
                    false
                }
            }
        }
    }

    fn record_result(&self, success: bool) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if !success {
            self.failures.fetch_add(1, Ordering::SeqCst);
            self.last_failure_time.store(self.clock.now());
        }

        match self.state() {
            State::Closed => {
                let requests = self.requests.load(Ordering::SeqCst);
                let failures = self.failures.load(Ordering::SeqCst);
                if requests >= self.min_requests
                    && (failures as f64 / requests as f64) >= self.failure_threshold
                {
                    self.transition(State::Closed, State::Open);
                }
            }
            State::HalfOpen => {
                if !success {
                    self.transition(State::HalfOpen, State::Open);
                } else {
                    let admitted = self.half_open_admitted.load(Ordering::SeqCst);
                    if admitted >= self.half_open_requests {
                        self.transition(State::HalfOpen, State::Closed);
                    }
                }
            }
            State::Open => {}
        }
    }

    /// Spawn the owning task and return the output channel. Items arriving
    /// while the breaker is Open produce no output at all (they are simply
    /// not admitted, per §4.10).
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
                                    if !self.allow_request() {
                                        continue;
                                    }
                                    let value = item.into_value();
                                    let (call_tx, call_rx) = output_channel::<In>(1);
                                    let _ = call_tx.send(StreamItem::new_success(value)).await;
                                    drop(call_tx);

                                    let child_ctx = ctx.child_token();
                                    let mut inner_out = Arc::clone(&self.inner).process(child_ctx, call_rx);
                                    let outcome = tokio::select! {
                                        biased;
                                        _ = ctx.cancelled() => None,
                                        _ = self.clock.sleep(self.call_timeout) => None,
                                        result = inner_out.recv() => result,
                                    };

                                    match outcome {
                                        Some(result) => {
                                            self.record_result(result.is_success());
                                            if tx.send(result).await.is_err() {
                                                break;
                                            }
                                        }
                                        None => {
                                            self.record_result(false);
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
            .instrument(debug_span!("circuit_breaker", name = %name)),
        );

        rx
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::processor::output_channel;

    struct AlwaysFails;
    impl Processor<i32, i32> for AlwaysFails {
        fn name(&self) -> &str {
            "always_fails"
        }
        fn process(self: Arc<Self>, _ctx: CancelToken, mut input: Inbox<i32>) -> Inbox<i32> {
            let (tx, rx) = output_channel(1);
            tokio::spawn(async move {
                while let Some(_item) = input.recv().await {
                    let _ = tx
                        .send(StreamItem::new_error(None, crate::result::Message::new("boom"), "always_fails"))
                        .await;
                }
            });
            rx
        }
    }

    #[tokio::test]
    async fn opens_after_threshold_and_rejects_further_requests() {
        let (clock, fake) = Clock::fake();
        let inner: Arc<dyn Processor<i32, i32>> = Arc::new(AlwaysFails);
        let breaker = Arc::new(CircuitBreaker::new(inner, 0.5, 2, Duration::from_millis(50), clock));

        let (tx, input) = output_channel::<i32>(8);
        for v in 0..5 {
            tx.send(StreamItem::new_success(v)).await.unwrap();
        }
        drop(tx);

        let ctx = CancelToken::new();
        let mut out = breaker.clone().process(ctx, input);

        let mut received = 0;
        while let Some(_item) = out.recv().await {
            received += 1;
        }
        // Only the first two requests reach the always-failing inner
        // processor before the breaker opens; the rest produce no output.
        assert_eq!(received, 2);
        assert_eq!(breaker.state(), State::Open);
        let _ = fake;
    }
}
