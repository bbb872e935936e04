//! Tumbling windows: disjoint, fixed-size (§4.5).

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug_span, Instrument};

use crate::clock::Clock;
use crate::concurrency::{spawn_tracked, ActiveTaskCounter, CancelToken};
use crate::metadata::{WindowMetadata, WindowType};
use crate::processor::{output_channel, Inbox};
use crate::result::Result as StreamItem;

/// Disjoint, fixed-size windows `[T0, T0+size), [T0+size, T0+2*size), ...`.
/// A ticker at `size` closes the current window and opens the next one.
pub struct Tumbling {
    name: String,
    size: Duration,
    clock: Clock,
    buffer_size: usize,
    task_counter: Option<ActiveTaskCounter>,
}

impl Tumbling {
    /// A tumbling windower of the given size, driven by `clock`.
    pub fn new(size: Duration, clock: Clock) -> Self {
        Self {
            name: "tumbling_window".to_string(),
            size,
            clock,
            buffer_size: 0,
            task_counter: None,
        }
    }

    /// Override the name used in spans and window metadata.
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

    /// This windower's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the owning task and return the output channel of
    /// window-tagged Results.
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
                let mut ticker = self.clock.new_ticker(self.size);
                let mut window_start = self.clock.now();
                let mut pending: Vec<StreamItem<T>> = Vec::new();

                loop {
                    if ticker.is_ready() {
                        let fired = ticker.tick().await;
                        if emit(&tx, &mut pending, window_start, fired, self.size).await.is_err() {
                            break;
                        }
                        window_start = fired;
                        continue;
                    }

                    tokio::select! {
                        biased;
                        _ = ctx.cancelled() => break,
                        fired = ticker.tick() => {
                            if emit(&tx, &mut pending, window_start, fired, self.size).await.is_err() {
                                break;
                            }
                            window_start = fired;
                        }
                        item = input.recv() => {
                            match item {
                                None => {
                                    let now = self.clock.now();
                                    let _ = emit(&tx, &mut pending, window_start, now, self.size).await;
                                    break;
                                }
                                Some(item) => pending.push(item),
                            }
                        }
                    }
                }
            }
            .instrument(debug_span!("tumbling_window", name = %name)),
        );

        rx
    }
}

async fn emit<T: Send + 'static>(
    tx: &tokio::sync::mpsc::Sender<StreamItem<T>>,
    pending: &mut Vec<StreamItem<T>>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    size: Duration,
) -> Result<(), ()> {
    if pending.is_empty() {
        return Ok(());
    }
    let window = WindowMetadata {
        start,
        end,
        window_type: WindowType::Tumbling,
        size,
        slide: None,
        gap: None,
        session_key: None,
    };
    for item in pending.drain(..) {
        let metadata = window.apply(item.metadata());
        let tagged = item.with_full_metadata(metadata);
        if tx.send(tagged).await.is_err() {
            return Err(());
        }
    }
    Ok(())
}
