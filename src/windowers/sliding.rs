//! Sliding windows: overlapping, fixed-size, advancing by a slide interval (§4.5).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug_span, Instrument};

use crate::clock::Clock;
use crate::concurrency::{spawn_tracked, ActiveTaskCounter, CancelToken};
use crate::metadata::{WindowMetadata, WindowType};
use crate::processor::{output_channel, Inbox};
use crate::result::Result as StreamItem;

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::zero())
}

/// Overlapping, fixed-size windows advancing by `slide`. At most
/// `ceil(size/slide)` windows are active at once. Because an item can
/// belong to several overlapping windows simultaneously, each window holds
/// its own clone of the item's `Result`; `T` must be `Clone`.
pub struct Sliding {
    name: String,
    size: Duration,
    slide: Duration,
    clock: Clock,
    buffer_size: usize,
    task_counter: Option<ActiveTaskCounter>,
}

struct ActiveWindow<T> {
    start: DateTime<Utc>,
    items: Vec<StreamItem<T>>,
}

impl Sliding {
    /// A sliding windower of `size`, advancing every `slide`. When
    /// `slide == size` this degrades to the same behavior as
    /// [`super::tumbling::Tumbling`].
    pub fn new(size: Duration, slide: Duration, clock: Clock) -> Self {
        Self {
            name: "sliding_window".to_string(),
            size,
            slide,
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
        T: Clone + Send + 'static,
    {
        let (tx, rx) = output_channel(self.buffer_size);
        let name = self.name.clone();
        let task_counter = self.task_counter.clone();

        spawn_tracked(
            task_counter.as_ref(),
            async move {
                let mut ticker = self.clock.new_ticker(self.slide);
                let mut active: Vec<ActiveWindow<T>> = Vec::new();
                let mut seeded = false;

                loop {
                    if ticker.is_ready() {
                        let fired = ticker.tick().await;
                        if self.on_tick(&tx, &mut active, fired).await.is_err() {
                            break;
                        }
                        continue;
                    }

                    tokio::select! {
                        biased;
                        _ = ctx.cancelled() => break,
                        fired = ticker.tick() => {
                            if self.on_tick(&tx, &mut active, fired).await.is_err() {
                                break;
                            }
                        }
                        item = input.recv() => {
                            match item {
                                None => {
                                    let now = self.clock.now();
                                    let _ = self.flush_all(&tx, &mut active, now).await;
                                    break;
                                }
                                Some(item) => {
                                    let now = self.clock.now();
                                    if !seeded {
                                        active.push(ActiveWindow { start: now, items: Vec::new() });
                                        seeded = true;
                                    }
                                    let size = to_chrono(self.size);
                                    let mut covered = false;
                                    for window in active.iter_mut() {
                                        if now >= window.start && now < window.start + size {
                                            window.items.push(item.clone());
                                            covered = true;
                                        }
                                    }
                                    if !covered {
                                        active.push(ActiveWindow { start: now, items: vec![item] });
                                    }
                                }
                            }
                        }
                    }
                }
            }
            .instrument(debug_span!("sliding_window", name = %name)),
        );

        rx
    }

    async fn on_tick<T: Send + 'static>(
        &self,
        tx: &tokio::sync::mpsc::Sender<StreamItem<T>>,
        active: &mut Vec<ActiveWindow<T>>,
        fired: DateTime<Utc>,
    ) -> Result<(), ()> {
        active.push(ActiveWindow {
            start: fired,
            items: Vec::new(),
        });

        let size = to_chrono(self.size);
        let mut i = 0;
        while i < active.len() {
            if active[i].start + size <= fired {
                let window = active.remove(i);
                self.emit_window(tx, window, fired).await?;
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    async fn flush_all<T: Send + 'static>(
        &self,
        tx: &tokio::sync::mpsc::Sender<StreamItem<T>>,
        active: &mut Vec<ActiveWindow<T>>,
        now: DateTime<Utc>,
    ) -> Result<(), ()> {
        for window in active.drain(..) {
            self.emit_window(tx, window, now).await?;
        }
        Ok(())
    }

    async fn emit_window<T: Send + 'static>(
        &self,
        tx: &tokio::sync::mpsc::Sender<StreamItem<T>>,
        window: ActiveWindow<T>,
        end: DateTime<Utc>,
    ) -> Result<(), ()> {
        if window.items.is_empty() {
            return Ok(());
        }
        let metadata = WindowMetadata {
            start: window.start,
            end,
            window_type: WindowType::Sliding,
            size: self.size,
            slide: Some(self.slide),
            gap: None,
            session_key: None,
        };
        for item in window.items {
            let tagged_metadata = metadata.apply(item.metadata());
            let tagged = item.with_full_metadata(tagged_metadata);
            if tx.send(tagged).await.is_err() {
                return Err(());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::processor::output_channel;

    #[tokio::test]
    async fn items_can_belong_to_multiple_windows() {
        let (clock, fake) = Clock::fake();
        let (tx, input) = output_channel::<i32>(64);
        let sliding = Arc::new(Sliding::new(Duration::from_millis(5), Duration::from_millis(2), clock));
        let mut out = sliding.process(CancelToken::new(), input);

        for v in 0..5 {
            tx.send(StreamItem::new_success(v)).await.unwrap();
            fake.advance(Duration::from_millis(1));
            fake.block_until_ready().await;
        }
        drop(tx);

        let mut total = 0;
        while out.recv().await.is_some() {
            total += 1;
        }
        // Each of the 5 items lands in at least one window; with
        // overlapping windows the total emitted count exceeds the input
        // count.
        assert!(total >= 5);
    }
}
