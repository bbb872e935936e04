//! Legacy `T -> Window<T>` windower forms, kept as thin wrappers over the
//! canonical `Result<T> -> Result<T>` windowers plus
//! [`crate::window_collector::WindowCollector`] (§9, open questions).

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::clock::Clock;
use crate::concurrency::CancelToken;
use crate::processor::{output_channel, DEFAULT_CHANNEL_CAPACITY};
use crate::result::Result as StreamItem;
use crate::window_collector::WindowCollector;
use crate::windowers::session::Session;
use crate::windowers::sliding::Sliding;
use crate::windowers::tumbling::Tumbling;

/// A completed window in the legacy, struct-collecting shape: successful
/// values only, in arrival order. Errors observed by the underlying modern
/// windower are silently excluded, matching the legacy form's `T`-only
/// signature (it never had a Result envelope to carry them in).
#[derive(Debug, Clone)]
pub struct Window<T> {
    /// Window start.
    pub start: DateTime<Utc>,
    /// Window end.
    pub end: DateTime<Utc>,
    /// Collected values, in arrival order.
    pub items: Vec<T>,
}

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

fn collect_to_legacy<T: Send + 'static>(
    ctx: CancelToken,
    tagged: crate::processor::Inbox<T>,
) -> mpsc::Receiver<Window<T>> {
    let mut collections = Arc::new(WindowCollector::new()).process(ctx, tagged);
    let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        while let Some(item) = collections.recv().await {
            if item.is_error() {
                continue;
            }
            let collection = item.into_value();
            let window = Window {
                start: collection.start,
                end: collection.end,
                items: collection.values().into_iter().cloned().collect(),
            };
            if tx.send(window).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// Legacy tumbling windower: `T -> Window<T>`.
pub struct LegacyTumbling {
    size: Duration,
    clock: Clock,
}

impl LegacyTumbling {
    /// A legacy tumbling windower of the given size.
    pub fn new(size: Duration, clock: Clock) -> Self {
        Self { size, clock }
    }

    /// Run the windower over a plain (non-`Result`) input channel.
    pub fn process<T>(self, ctx: CancelToken, raw: mpsc::Receiver<T>) -> mpsc::Receiver<Window<T>>
    where
        T: Clone + Send + 'static,
    {
        let tagged = adapt_raw_input(raw);
        let windowed = Arc::new(Tumbling::new(self.size, self.clock)).process(ctx.clone(), tagged);
        collect_to_legacy(ctx, windowed)
    }
}

/// Legacy sliding windower: `T -> Window<T>`.
pub struct LegacySliding {
    size: Duration,
    slide: Duration,
    clock: Clock,
}

impl LegacySliding {
    /// A legacy sliding windower of `size` advancing by `slide`.
    pub fn new(size: Duration, slide: Duration, clock: Clock) -> Self {
        Self { size, slide, clock }
    }

    /// Run the windower over a plain (non-`Result`) input channel.
    pub fn process<T>(self, ctx: CancelToken, raw: mpsc::Receiver<T>) -> mpsc::Receiver<Window<T>>
    where
        T: Clone + Send + 'static,
    {
        let tagged = adapt_raw_input(raw);
        let windowed = Arc::new(Sliding::new(self.size, self.slide, self.clock)).process(ctx.clone(), tagged);
        collect_to_legacy(ctx, windowed)
    }
}

/// Legacy session windower: `T -> Window<T>`.
pub struct LegacySession<T> {
    gap: Duration,
    key_fn: Arc<dyn Fn(&T) -> String + Send + Sync>,
    clock: Clock,
}

impl<T> LegacySession<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A legacy session windower with the given inactivity gap and key
    /// function over raw values (rather than `Result`s, as the modern
    /// [`Session`] takes).
    pub fn new<F>(gap: Duration, key_fn: F, clock: Clock) -> Self
    where
        F: Fn(&T) -> String + Send + Sync + 'static,
    {
        Self {
            gap,
            key_fn: Arc::new(key_fn),
            clock,
        }
    }

    /// Run the windower over a plain (non-`Result`) input channel.
    pub fn process(self, ctx: CancelToken, raw: mpsc::Receiver<T>) -> mpsc::Receiver<Window<T>>
    where
        T: Clone + Send + 'static,
    {
        let tagged = adapt_raw_input(raw);
        let key_fn = self.key_fn;
        let windowed = Arc::new(Session::new(
            self.gap,
            move |item: &StreamItem<T>| key_fn(item.value()),
            self.clock,
        ))
        .process(ctx.clone(), tagged);
        collect_to_legacy(ctx, windowed)
    }
}
