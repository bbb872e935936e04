//! Switch: key-function content routing (§4.12).

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::concurrency::{spawn_tracked, ActiveTaskCounter, CancelToken};
use crate::error::StreamError;
use crate::processor::{output_channel, Inbox};

/// Routes successful items to a channel selected by `key_fn(value)`.
/// Errors bypass the key function entirely and go to a dedicated error
/// channel; a key-function panic is caught and the offending item is
/// re-emitted there as an error Result instead.
pub struct Switch<T, K> {
    name: String,
    key_fn: Arc<dyn Fn(&T) -> K + Send + Sync>,
    default_key: Option<K>,
    buffer_size: usize,
    routes: Arc<RwLock<HashMap<K, tokio::sync::mpsc::Sender<crate::result::Result<T>>>>>,
    task_counter: Option<ActiveTaskCounter>,
}

impl<T, K> Switch<T, K>
where
    T: Send + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// A switch keying successful items with `key_fn`. Routes are added
    /// with [`Switch::add_route`] before or while `process` is running.
    pub fn new<F>(key_fn: F) -> Self
    where
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        Self {
            name: "switch".to_string(),
            key_fn: Arc::new(key_fn),
            default_key: None,
            buffer_size: 0,
            routes: Arc::new(RwLock::new(HashMap::new())),
            task_counter: None,
        }
    }

    /// Route unrecognized keys to the route registered under `key` instead
    /// of dropping them.
    pub fn with_default_key(mut self, key: K) -> Self {
        self.default_key = Some(key);
        self
    }

    /// Override every route channel's buffer size.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Override the name used in error Results.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Route this processor's owning task through a shared
    /// [`ActiveTaskCounter`] instead of a bare `tokio::spawn`.
    pub fn with_task_counter(mut self, counter: ActiveTaskCounter) -> Self {
        self.task_counter = Some(counter);
        self
    }

    /// This switch's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a route for `key`, returning its input channel. Replaces
    /// any existing route under the same key.
    pub fn add_route(&self, key: K) -> Inbox<T> {
        let (tx, rx) = output_channel(self.buffer_size);
        self.routes.write().insert(key, tx);
        rx
    }

    /// Remove a route. Returns `true` if one existed.
    pub fn remove_route(&self, key: &K) -> bool {
        self.routes.write().remove(key).is_some()
    }

    /// `true` if a route is registered for `key`.
    pub fn has_route(&self, key: &K) -> bool {
        self.routes.read().contains_key(key)
    }

    /// Currently registered route keys.
    pub fn route_keys(&self) -> Vec<K> {
        self.routes.read().keys().cloned().collect()
    }

    /// Spawn the distributor task and return the dedicated error channel.
    pub fn process(self: Arc<Self>, ctx: CancelToken, mut input: Inbox<T>) -> Inbox<T> {
        let (error_tx, error_rx) = output_channel(self.buffer_size);
        let task_counter = self.task_counter.clone();

        spawn_tracked(task_counter.as_ref(), async move {
            loop {
                tokio::select! {
                    biased;
                    _ = ctx.cancelled() => break,
                    item = input.recv() => {
                        match item {
                            None => break,
                            Some(item) => {
                                if item.is_error() {
                                    if error_tx.send(item).await.is_err() {
                                        break;
                                    }
                                    continue;
                                }
                                let key_fn = self.key_fn.clone();
                                let keyed = catch_unwind(AssertUnwindSafe(|| key_fn(item.value())));
                                match keyed {
                                    Err(payload) => {
                                        let err = StreamError::from_panic(self.name.clone(), payload);
                                        let error_item = crate::result::Result::new_error(
                                            None,
                                            crate::result::Message::new(err.to_string()),
                                            self.name.clone(),
                                        );
                                        if error_tx.send(error_item).await.is_err() {
                                            break;
                                        }
                                    }
                                    Ok(key) => {
                                        let route = {
                                            let routes = self.routes.read();
                                            routes
                                                .get(&key)
                                                .or_else(|| self.default_key.as_ref().and_then(|k| routes.get(k)))
                                                .cloned()
                                        };
                                        if let Some(route) = route {
                                            if route.send(item).await.is_err() {
                                                tracing::debug!(name = %self.name, "switch route closed, item dropped");
                                            }
                                        } else {
                                            tracing::debug!(name = %self.name, "switch: no route and no default, item dropped");
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        });

        error_rx
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::processor::output_channel;
    use crate::result::Result as StreamItem;

    #[tokio::test]
    async fn routes_by_key_and_isolates_errors() {
        let switch = Arc::new(Switch::new(|v: &i32| if v % 2 == 0 { "even" } else { "odd" }.to_string()));
        let mut evens = switch.add_route("even".to_string());
        let mut odds = switch.add_route("odd".to_string());

        let (tx, input) = output_channel::<i32>(8);
        let mut errors = switch.process(CancelToken::new(), input);

        tx.send(StreamItem::new_success(2)).await.unwrap();
        tx.send(StreamItem::new_success(3)).await.unwrap();
        tx.send(StreamItem::new_error(Some(0), crate::result::Message::new("boom"), "src"))
            .await
            .unwrap();
        drop(tx);

        assert_eq!(*evens.recv().await.unwrap().value(), 2);
        assert_eq!(*odds.recv().await.unwrap().value(), 3);
        assert!(errors.recv().await.unwrap().is_error());
    }
}
