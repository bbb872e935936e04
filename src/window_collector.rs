//! WindowCollector: group window-tagged Results by window key (§4.13, §3).

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug_span, Instrument};

use crate::concurrency::{spawn_tracked, ActiveTaskCounter, CancelToken};
use crate::metadata::{get_window_metadata, Metadata, WindowKey};
use crate::processor::{output_channel, Inbox};
use crate::result::{ErrorRecord, Result as StreamItem};

/// Every Result sharing a window key ([`WindowKey`]), in arrival order.
#[derive(Debug)]
pub struct WindowCollection<T> {
    /// Window start.
    pub start: DateTime<Utc>,
    /// Window end.
    pub end: DateTime<Utc>,
    /// The window metadata shared by every item in this collection.
    pub metadata: Metadata,
    /// Every Result observed for this window, in arrival order.
    pub items: Vec<StreamItem<T>>,
}

impl<T> WindowCollection<T> {
    /// Successful values only, in arrival order.
    pub fn values(&self) -> Vec<&T> {
        self.items.iter().filter_map(StreamItem::try_value).collect()
    }

    /// Error records only, in arrival order.
    pub fn errors(&self) -> Vec<&ErrorRecord<T>> {
        self.items.iter().filter_map(StreamItem::error).collect()
    }

    /// Total number of items (successes and errors).
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// `true` if this collection holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Groups a stream of window-tagged Results by their struct-valued window
/// key, emitting one [`WindowCollection`] per group once the input closes
/// or cancellation fires. Does not close windows by time itself — it only
/// aggregates what an upstream windower already emitted.
pub struct WindowCollector {
    name: String,
    buffer_size: usize,
    task_counter: Option<ActiveTaskCounter>,
}

impl WindowCollector {
    /// A collector with the default output buffer size.
    pub fn new() -> Self {
        Self {
            name: "window_collector".to_string(),
            buffer_size: 0,
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

    /// This collector's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the owning task and return the output channel of
    /// [`WindowCollection`]s.
    pub fn process<T>(self: Arc<Self>, ctx: CancelToken, mut input: Inbox<T>) -> Inbox<WindowCollection<T>>
    where
        T: Send + 'static,
    {
        let (tx, rx) = output_channel(self.buffer_size);
        let name = self.name.clone();
        let task_counter = self.task_counter.clone();

        spawn_tracked(
            task_counter.as_ref(),
            async move {
                let mut groups: HashMap<WindowKey, WindowCollection<T>> = HashMap::new();

                loop {
                    tokio::select! {
                        biased;
                        _ = ctx.cancelled() => break,
                        item = input.recv() => {
                            match item {
                                None => break,
                                Some(item) => {
                                    let window = match get_window_metadata(item.metadata()) {
                                        Ok(w) => w,
                                        Err(_) => {
                                            tracing::debug!(name = %self.name, "item missing window metadata, skipped");
                                            continue;
                                        }
                                    };
                                    let key = window.key();
                                    let entry = groups.entry(key).or_insert_with(|| WindowCollection {
                                        start: window.start,
                                        end: window.end,
                                        metadata: item.metadata().clone(),
                                        items: Vec::new(),
                                    });
                                    entry.items.push(item);
                                }
                            }
                        }
                    }
                }

                for (_, collection) in groups {
                    if tx.send(StreamItem::new_success(collection)).await.is_err() {
                        break;
                    }
                }
            }
            .instrument(debug_span!("window_collector", name = %name)),
        );

        rx
    }
}

impl Default for WindowCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::metadata::{WindowMetadata, WindowType};
    use crate::processor::output_channel;
    use std::time::Duration;

    #[tokio::test]
    async fn groups_by_window_key_and_skips_untagged_items() {
        let (tx, input) = output_channel::<i32>(16);
        let now = Utc::now();
        let window = WindowMetadata {
            start: now,
            end: now + chrono::Duration::seconds(1),
            window_type: WindowType::Tumbling,
            size: Duration::from_secs(1),
            slide: None,
            gap: None,
            session_key: None,
        };

        let tagged_1 = StreamItem::new_success(1).with_full_metadata(window.apply(&Metadata::empty()));
        let tagged_2 = StreamItem::new_success(2).with_full_metadata(window.apply(&Metadata::empty()));
        let untagged = StreamItem::new_success(3);

        tx.send(tagged_1).await.unwrap();
        tx.send(tagged_2).await.unwrap();
        tx.send(untagged).await.unwrap();
        drop(tx);

        let collector = Arc::new(WindowCollector::new());
        let mut out = collector.process(CancelToken::new(), input);

        let collection = out.recv().await.unwrap();
        assert_eq!(collection.value().len(), 2);
        assert_eq!(collection.value().values(), vec![&1, &2]);
        assert!(out.recv().await.is_none());
    }
}
