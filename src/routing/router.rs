//! Router: ordered predicate-list content routing (§4.12).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::concurrency::{spawn_tracked, ActiveTaskCounter, CancelToken};
use crate::error::StreamError;
use crate::fan_in::FanIn;
use crate::processor::{output_channel, Inbox, Processor};

struct Route<T, U> {
    name: String,
    predicate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
    processor: Arc<dyn Processor<T, U>>,
}

/// Evaluates an ordered list of `(name, predicate, processor)` routes
/// against each successful item. In first-match mode (the default) the
/// item goes to the first route whose predicate returns `true`; in
/// all-matches mode it goes to every matching route (requires `T: Clone`).
/// Unmatched items go to an optional default processor. Errors bypass
/// every predicate and are forwarded directly into the merged output,
/// re-typed the same way [`crate::batcher::Batcher`] forwards errors
/// across a type change.
pub struct Router<T, U> {
    name: String,
    routes: Vec<Route<T, U>>,
    default: Option<Arc<dyn Processor<T, U>>>,
    all_matches: bool,
    buffer_size: usize,
    task_counter: Option<ActiveTaskCounter>,
}

impl<T, U> Router<T, U>
where
    T: Clone + Send + 'static,
    U: Send + 'static,
{
    /// An empty router. Add routes with [`Router::add_route`].
    pub fn new() -> Self {
        Self {
            name: "router".to_string(),
            routes: Vec::new(),
            default: None,
            all_matches: false,
            buffer_size: 0,
            task_counter: None,
        }
    }

    /// Append a named route.
    pub fn add_route<F>(mut self, name: impl Into<String>, predicate: F, processor: Arc<dyn Processor<T, U>>) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.routes.push(Route {
            name: name.into(),
            predicate: Arc::new(predicate),
            processor,
        });
        self
    }

    /// Process items matched by no route through `processor`.
    pub fn with_default(mut self, processor: Arc<dyn Processor<T, U>>) -> Self {
        self.default = Some(processor);
        self
    }

    /// Route to every matching predicate instead of only the first.
    pub fn with_all_matches(mut self, enabled: bool) -> Self {
        self.all_matches = enabled;
        self
    }

    /// Override the name used in spans and error Results.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Override each route's input channel buffer size.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Route this processor's dispatch task and its internal merging
    /// [`FanIn`] through a shared [`ActiveTaskCounter`] instead of a bare
    /// `tokio::spawn`. Per-route processors supplied via [`Router::add_route`]
    /// spawn their own tasks independently and are not covered.
    pub fn with_task_counter(mut self, counter: ActiveTaskCounter) -> Self {
        self.task_counter = Some(counter);
        self
    }

    /// This router's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn every route's processor, the distributor task, and a merging
    /// [`FanIn`], returning the single merged output channel.
    pub fn process(self: Arc<Self>, ctx: CancelToken, mut input: Inbox<T>) -> Inbox<U> {
        let mut route_inputs = Vec::with_capacity(self.routes.len());
        let mut merge_inputs = Vec::with_capacity(self.routes.len() + 2);

        for route in &self.routes {
            let (tx, rx) = output_channel(self.buffer_size);
            let out = Arc::clone(&route.processor).process(ctx.child_token(), rx);
            route_inputs.push(tx);
            merge_inputs.push(out);
        }

        let default_tx = self.default.as_ref().map(|processor| {
            let (tx, rx) = output_channel(self.buffer_size);
            let out = Arc::clone(processor).process(ctx.child_token(), rx);
            merge_inputs.push(out);
            tx
        });

        let (bypass_tx, bypass_rx) = output_channel(self.buffer_size);
        merge_inputs.push(bypass_rx);

        let name = self.name.clone();
        let merge_name = name.clone();
        let all_matches = self.all_matches;
        let dispatch_ctx = ctx.child_token();
        let task_counter = self.task_counter.clone();
        let merge_task_counter = task_counter.clone();
        spawn_tracked(task_counter.as_ref(), async move {
            loop {
                tokio::select! {
                    biased;
                    _ = dispatch_ctx.cancelled() => break,
                    item = input.recv() => {
                        match item {
                            None => break,
                            Some(item) => {
                                if item.is_error() {
                                    let converted = item.map(|_: T| -> U { unreachable!() });
                                    if bypass_tx.send(converted).await.is_err() {
                                        break;
                                    }
                                    continue;
                                }

                                let value = item.value().clone();
                                let predicate_results: Vec<bool> = self
                                    .routes
                                    .iter()
                                    .map(|route| {
                                        catch_unwind(AssertUnwindSafe(|| (route.predicate)(&value))).unwrap_or(false)
                                    })
                                    .collect();

                                let matched_any = predicate_results.iter().any(|m| *m);

                                if !matched_any {
                                    if let Some(tx) = &default_tx {
                                        let _ = tx.send(item).await;
                                    } else {
                                        tracing::debug!(name = %name, "router: no matching route, item dropped");
                                    }
                                    continue;
                                }

                                if all_matches {
                                    for (idx, matched) in predicate_results.iter().enumerate() {
                                        if *matched {
                                            let _ = route_inputs[idx].send(item.clone()).await;
                                        }
                                    }
                                } else if let Some(idx) = predicate_results.iter().position(|m| *m) {
                                    let _ = route_inputs[idx].send(item).await;
                                }
                            }
                        }
                    }
                }
            }
        });

        let mut merge_fan_in = FanIn::new().with_name(format!("{merge_name}_merge"));
        if let Some(counter) = merge_task_counter {
            merge_fan_in = merge_fan_in.with_task_counter(counter);
        }
        Arc::new(merge_fan_in).process(ctx, merge_inputs)
    }
}

impl<T, U> Default for Router<T, U>
where
    T: Clone + Send + 'static,
    U: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::processor::output_channel;
    use crate::result::Result as StreamItem;

    struct Double;
    impl Processor<i32, i32> for Double {
        fn name(&self) -> &str {
            "double"
        }
        fn process(self: Arc<Self>, _ctx: CancelToken, mut input: Inbox<i32>) -> Inbox<i32> {
            let (tx, rx) = output_channel(4);
            tokio::spawn(async move {
                while let Some(item) = input.recv().await {
                    if item.is_success() {
                        let v = *item.value();
                        let _ = tx.send(StreamItem::new_success(v * 2)).await;
                    } else {
                        let _ = tx.send(item).await;
                    }
                }
            });
            rx
        }
    }

    #[tokio::test]
    async fn first_match_routes_to_first_matching_predicate() {
        let router = Arc::new(
            Router::new().add_route("evens", |v: &i32| v % 2 == 0, Arc::new(Double) as Arc<dyn Processor<i32, i32>>),
        );

        let (tx, input) = output_channel::<i32>(8);
        let mut out = router.process(CancelToken::new(), input);

        tx.send(StreamItem::new_success(4)).await.unwrap();
        drop(tx);

        let result = out.recv().await.unwrap();
        assert_eq!(*result.value(), 8);
    }
}
