//! Session windows: activity-gap-bounded, partitioned by key (§4.5).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug_span, Instrument};

use crate::clock::Clock;
use crate::concurrency::{spawn_tracked, ActiveTaskCounter, CancelToken};
use crate::error::StreamError;
use crate::metadata::{WindowMetadata, WindowType};
use crate::processor::{output_channel, Inbox};
use crate::result::Result as StreamItem;

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::zero())
}

struct SessionState<T> {
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    items: Vec<StreamItem<T>>,
}

/// Partitions items by `key_fn(result)`, grouping each key's items into a
/// session that closes once `gap` has elapsed since its last item. Checked
/// every `gap` via a ticker, so close detection has up to `gap` of latency
/// under its own schedule; closing on input shutdown is immediate for every
/// still-open session regardless of the ticker.
pub struct Session<T> {
    name: String,
    gap: Duration,
    key_fn: Arc<dyn Fn(&StreamItem<T>) -> String + Send + Sync>,
    clock: Clock,
    buffer_size: usize,
    task_counter: Option<ActiveTaskCounter>,
}

impl<T> Session<T> {
    /// A session windower with the given inactivity gap and key function.
    pub fn new<F>(gap: Duration, key_fn: F, clock: Clock) -> Self
    where
        F: Fn(&StreamItem<T>) -> String + Send + Sync + 'static,
    {
        Self {
            name: "session_window".to_string(),
            gap,
            key_fn: Arc::new(key_fn),
            clock,
            buffer_size: 0,
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

    /// This windower's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the owning task and return the output channel of
    /// window-tagged Results.
    pub fn process(self: Arc<Self>, ctx: CancelToken, mut input: Inbox<T>) -> Inbox<T>
    where
        T: Send + 'static,
    {
        let (tx, rx) = output_channel(self.buffer_size);
        let name = self.name.clone();
        let task_counter = self.task_counter.clone();

        spawn_tracked(
            task_counter.as_ref(),
            async move {
                let mut ticker = self.clock.new_ticker(self.gap);
                let mut sessions: HashMap<String, SessionState<T>> = HashMap::new();

                loop {
                    if ticker.is_ready() {
                        let fired = ticker.tick().await;
                        if self.expire_stale(&tx, &mut sessions, fired).await.is_err() {
                            break;
                        }
                        continue;
                    }

                    tokio::select! {
                        biased;
                        _ = ctx.cancelled() => break,
                        fired = ticker.tick() => {
                            if self.expire_stale(&tx, &mut sessions, fired).await.is_err() {
                                break;
                            }
                        }
                        item = input.recv() => {
                            match item {
                                None => {
                                    let _ = self.flush_all(&tx, &mut sessions).await;
                                    break;
                                }
                                Some(item) => {
                                    if self.handle_item(&tx, &mut sessions, item).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
            }
            .instrument(debug_span!("session_window", name = %name)),
        );

        rx
    }

    async fn handle_item(
        &self,
        tx: &tokio::sync::mpsc::Sender<StreamItem<T>>,
        sessions: &mut HashMap<String, SessionState<T>>,
        item: StreamItem<T>,
    ) -> Result<(), ()>
    where
        T: Send + 'static,
    {
        let key_fn = self.key_fn.clone();
        let keyed = catch_unwind(AssertUnwindSafe(|| key_fn(&item)));
        let now = self.clock.now();
        match keyed {
            Ok(key) => {
                let session = sessions.entry(key).or_insert_with(|| SessionState {
                    first_seen: now,
                    last_seen: now,
                    items: Vec::new(),
                });
                session.last_seen = now;
                session.items.push(item);
                Ok(())
            }
            Err(payload) => {
                let error = StreamError::from_panic(self.name.clone(), payload);
                let error_item: StreamItem<T> =
                    StreamItem::new_error(None, crate::result::Message::new(error.to_string()), self.name.clone());
                let metadata = WindowMetadata {
                    start: now,
                    end: now,
                    window_type: WindowType::Session,
                    size: self.gap,
                    slide: None,
                    gap: Some(self.gap),
                    session_key: Some("<key_fn panic>".to_string()),
                }
                .apply(error_item.metadata());
                let tagged = error_item.with_full_metadata(metadata);
                tx.send(tagged).await.map_err(|_| ())
            }
        }
    }

    async fn expire_stale(
        &self,
        tx: &tokio::sync::mpsc::Sender<StreamItem<T>>,
        sessions: &mut HashMap<String, SessionState<T>>,
        now: DateTime<Utc>,
    ) -> Result<(), ()>
    where
        T: Send + 'static,
    {
        let gap = to_chrono(self.gap);
        let stale_keys: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| now - s.last_seen >= gap)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale_keys {
            if let Some(session) = sessions.remove(&key) {
                self.emit_session(tx, key, session).await?;
            }
        }
        Ok(())
    }

    async fn flush_all(
        &self,
        tx: &tokio::sync::mpsc::Sender<StreamItem<T>>,
        sessions: &mut HashMap<String, SessionState<T>>,
    ) -> Result<(), ()>
    where
        T: Send + 'static,
    {
        for (key, session) in sessions.drain() {
            self.emit_session(tx, key, session).await?;
        }
        Ok(())
    }

    async fn emit_session(
        &self,
        tx: &tokio::sync::mpsc::Sender<StreamItem<T>>,
        key: String,
        session: SessionState<T>,
    ) -> Result<(), ()>
    where
        T: Send + 'static,
    {
        let metadata = WindowMetadata {
            start: session.first_seen,
            end: session.last_seen,
            window_type: WindowType::Session,
            size: self.gap,
            slide: None,
            gap: Some(self.gap),
            session_key: Some(key),
        };
        for item in session.items {
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
    async fn splits_into_two_sessions_by_gap() {
        let (clock, fake) = Clock::fake();
        let (tx, input) = output_channel::<&'static str>(16);
        let session = Arc::new(Session::new(Duration::from_millis(100), |_: &StreamItem<&'static str>| "k".to_string(), clock));
        let mut out = session.process(CancelToken::new(), input);

        for v in ["a", "b", "c"] {
            tx.send(StreamItem::new_success(v)).await.unwrap();
        }
        fake.advance(Duration::from_millis(150));
        fake.block_until_ready().await;

        let mut first_session = Vec::new();
        for _ in 0..3 {
            first_session.push(*out.recv().await.unwrap().value());
        }
        assert_eq!(first_session, vec!["a", "b", "c"]);

        for v in ["d", "e"] {
            tx.send(StreamItem::new_success(v)).await.unwrap();
        }
        drop(tx);

        let mut second_session = Vec::new();
        while let Some(item) = out.recv().await {
            second_session.push(*item.value());
        }
        assert_eq!(second_session, vec!["d", "e"]);
    }
}
