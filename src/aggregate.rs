//! Aggregate: stateful fold with count/time triggers (§4.6).

// The two-phase select below only reaches `timer.as_mut().unwrap()` inside
// the `if timer.is_some()` select guard, so the unwrap never fires on `None`.
#![allow(clippy::unwrap_used)]

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug_span, Instrument};

use crate::clock::Clock;
use crate::concurrency::{spawn_tracked, ActiveTaskCounter, CancelToken};
use crate::processor::{output_channel, Inbox};
use crate::result::Result as StreamItem;

/// A completed (or partial, on close) aggregation window.
#[derive(Debug, Clone)]
pub struct WindowRecord<S> {
    /// The folded state at emission time.
    pub result: S,
    /// Wall-clock time of the previous emission (or construction).
    pub start: chrono::DateTime<chrono::Utc>,
    /// Wall-clock time of this emission.
    pub end: chrono::DateTime<chrono::Utc>,
    /// Number of successful items folded into this window.
    pub count: usize,
}

/// Stateful fold over successful items, triggered by a count threshold, a
/// time interval, or both (whichever fires first). Errors bypass the fold
/// and are forwarded unchanged.
pub struct Aggregate<S, F> {
    name: String,
    initial: S,
    fold: F,
    count_window: Option<usize>,
    time_window: Option<Duration>,
    empty_windows: bool,
    clock: Clock,
    buffer_size: usize,
    state: Arc<Mutex<S>>,
    task_counter: Option<ActiveTaskCounter>,
}

impl<S, F, T> Aggregate<S, F>
where
    S: Clone + Send + Sync + 'static,
    F: Fn(S, T) -> S + Send + Sync + 'static,
    T: Send + 'static,
{
    /// An aggregate folding with `fold`, starting from `initial`. Neither
    /// trigger is configured yet; at least one of
    /// [`Aggregate::with_count_window`] / [`Aggregate::with_time_window`]
    /// should be set, or the window will only ever emit on input close.
    pub fn new(initial: S, fold: F, clock: Clock) -> Self {
        Self {
            name: "aggregate".to_string(),
            state: Arc::new(Mutex::new(initial.clone())),
            initial,
            fold,
            count_window: None,
            time_window: None,
            empty_windows: false,
            clock,
            buffer_size: 0,
            task_counter: None,
        }
    }

    /// Emit every `n` successful items.
    pub fn with_count_window(mut self, n: usize) -> Self {
        self.count_window = Some(n.max(1));
        self
    }

    /// Emit every `d` of elapsed time.
    pub fn with_time_window(mut self, d: Duration) -> Self {
        self.time_window = Some(d);
        self
    }

    /// Allow time-triggered emission of empty windows (count == 0).
    pub fn with_empty_windows(mut self, enabled: bool) -> Self {
        self.empty_windows = enabled;
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

    /// This aggregate's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A read-only snapshot of the current, in-progress state.
    pub fn current_state(&self) -> S {
        self.state.lock().clone()
    }

    /// Spawn the owning task and return the output channel of
    /// [`WindowRecord`]s.
    pub fn process(self: Arc<Self>, ctx: CancelToken, mut input: Inbox<T>) -> Inbox<WindowRecord<S>> {
        let (tx, rx) = output_channel(self.buffer_size);
        let name = self.name.clone();
        let task_counter = self.task_counter.clone();

        spawn_tracked(
            task_counter.as_ref(),
            async move {
                let time_window = self.time_window;
                let mut state = self.initial.clone();
                let mut count = 0usize;
                let mut window_start = self.clock.now();
                let mut timer = time_window.map(|d| self.clock.new_timer(d));

                loop {
                    if let Some(t) = timer.as_ref() {
                        if t.is_ready() {
                            let now = self.clock.now();
                            if count > 0 || self.empty_windows {
                                if self.emit(&tx, &mut state, &mut count, window_start, now).await.is_err() {
                                    break;
                                }
                                window_start = now;
                            }
                            timer = time_window.map(|d| self.clock.new_timer(d));
                            continue;
                        }
                    }

                    tokio::select! {
                        biased;
                        _ = ctx.cancelled() => break,
                        _ = timer.as_mut().unwrap().recv(), if timer.is_some() => {
                            let now = self.clock.now();
                            if count > 0 || self.empty_windows {
                                if self.emit(&tx, &mut state, &mut count, window_start, now).await.is_err() {
                                    break;
                                }
                                window_start = now;
                            }
                            timer = time_window.map(|d| self.clock.new_timer(d));
                        }
                        item = input.recv() => {
                            match item {
                                None => {
                                    let now = self.clock.now();
                                    if count > 0 {
                                        let _ = self.emit(&tx, &mut state, &mut count, window_start, now).await;
                                    }
                                    break;
                                }
                                Some(item) => {
                                    if item.is_error() {
                                        let converted = item.map(|_| WindowRecord {
                                            result: state.clone(),
                                            start: window_start,
                                            end: self.clock.now(),
                                            count,
                                        });
                                        if tx.send(converted).await.is_err() {
                                            break;
                                        }
                                        continue;
                                    }
                                    state = (self.fold)(state, item.into_value());
                                    count += 1;
                                    *self.state.lock() = state.clone();

                                    if let Some(n) = self.count_window {
                                        if count >= n {
                                            let now = self.clock.now();
                                            if self.emit(&tx, &mut state, &mut count, window_start, now).await.is_err() {
                                                break;
                                            }
                                            window_start = now;
                                            if let Some(d) = time_window {
                                                timer = Some(self.clock.new_timer(d));
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
            .instrument(debug_span!("aggregate", name = %name)),
        );

        rx
    }

    async fn emit(
        &self,
        tx: &tokio::sync::mpsc::Sender<StreamItem<WindowRecord<S>>>,
        state: &mut S,
        count: &mut usize,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), ()> {
        let record = WindowRecord {
            result: state.clone(),
            start,
            end,
            count: *count,
        };
        *state = self.initial.clone();
        *self.state.lock() = state.clone();
        *count = 0;
        tx.send(StreamItem::new_success(record)).await.map_err(|_| ())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::processor::output_channel;

    #[tokio::test]
    async fn sums_every_three_items() {
        let (clock, _fake) = Clock::fake();
        let (tx, input) = output_channel::<i32>(16);
        let aggregate = Arc::new(Aggregate::new(0i32, |s, v| s + v, clock).with_count_window(3));
        let mut out = aggregate.process(CancelToken::new(), input);

        for v in 1..=9 {
            tx.send(StreamItem::new_success(v)).await.unwrap();
        }
        drop(tx);

        let mut sums = Vec::new();
        while let Some(item) = out.recv().await {
            sums.push(item.value().result);
        }
        assert_eq!(sums, vec![6, 15, 24]);
    }

    #[tokio::test]
    async fn partial_window_emitted_on_close() {
        let (clock, _fake) = Clock::fake();
        let (tx, input) = output_channel::<i32>(16);
        let aggregate = Arc::new(Aggregate::new(0i32, |s, v| s + v, clock).with_count_window(10));
        let mut out = aggregate.process(CancelToken::new(), input);

        tx.send(StreamItem::new_success(1)).await.unwrap();
        tx.send(StreamItem::new_success(2)).await.unwrap();
        drop(tx);

        let record = out.recv().await.unwrap();
        assert_eq!(record.value().result, 3);
        assert_eq!(record.value().count, 2);
    }
}
