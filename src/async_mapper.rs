//! AsyncMapper: worker-pool transform with optional ordered emission (§4.8).

// `acquire_owned()` only errors once the `Semaphore` is closed, and this
// module never calls `Semaphore::close`.
#![allow(clippy::expect_used)]

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug_span, Instrument};

use crate::concurrency::{spawn_tracked, ActiveTaskCounter, CancelToken};
use crate::error::StreamError;
use crate::processor::{output_channel, Inbox};
use crate::result::Result as StreamItem;

/// A user mapping function: given a (possibly child) cancellation token and
/// an input value, produces the transformed value or an error asynchronously.
pub type MapFn<In, Out> = Arc<dyn Fn(CancelToken, In) -> BoxFuture<'static, Result<Out, StreamError>> + Send + Sync>;

/// Transforms items through a bounded pool of concurrent workers. In
/// `ordered` mode, output preserves input order at the cost of a small
/// out-of-order reassembly buffer; in unordered mode (the default),
/// workers write results as soon as they complete.
pub struct AsyncMapper<In, Out> {
    name: String,
    workers: usize,
    ordered: bool,
    buffer_size: usize,
    map_fn: MapFn<In, Out>,
    task_counter: Option<ActiveTaskCounter>,
}

impl<In, Out> AsyncMapper<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// An unordered mapper with one worker, using `map_fn`.
    pub fn new<F>(map_fn: F) -> Self
    where
        F: Fn(CancelToken, In) -> BoxFuture<'static, Result<Out, StreamError>> + Send + Sync + 'static,
    {
        Self {
            name: "async_mapper".to_string(),
            workers: 1,
            ordered: false,
            buffer_size: 0,
            map_fn: Arc::new(map_fn),
            task_counter: None,
        }
    }

    /// Legacy construction form, kept as a thin wrapper over
    /// [`AsyncMapper::new`] plus [`AsyncMapper::with_workers`].
    pub fn with_worker_count<F>(workers: usize, map_fn: F) -> Self
    where
        F: Fn(CancelToken, In) -> BoxFuture<'static, Result<Out, StreamError>> + Send + Sync + 'static,
    {
        Self::new(map_fn).with_workers(workers)
    }

    /// Number of concurrent workers. `0` is clamped to `1`.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = if workers == 0 {
            tracing::warn!("async_mapper worker count clamped to 1");
            1
        } else {
            workers
        };
        self
    }

    /// Enable order-preserving emission.
    pub fn with_ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
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

    /// Route this processor's dispatcher, reorder, and worker tasks through
    /// a shared [`ActiveTaskCounter`] instead of a bare `tokio::spawn`.
    pub fn with_task_counter(mut self, counter: ActiveTaskCounter) -> Self {
        self.task_counter = Some(counter);
        self
    }

    /// This mapper's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the dispatcher, worker pool, and (if ordered) reorder task,
    /// returning the output channel.
    pub fn process(self: Arc<Self>, ctx: CancelToken, mut input: Inbox<In>) -> Inbox<Out> {
        let (tx, rx) = output_channel(self.buffer_size);
        let name = self.name.clone();
        let (seq_tx, mut seq_rx) = mpsc::channel::<(u64, StreamItem<Out>)>(self.buffer_size.max(1) * self.workers.max(1));
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let ordered = self.ordered;
        let task_counter = self.task_counter.clone();

        // Reorder / forward task.
        let reorder_tx = tx.clone();
        let reorder_ctx = ctx.clone();
        let reorder_ordered_name = name.clone();
        spawn_tracked(
            task_counter.as_ref(),
            async move {
                if !ordered {
                    loop {
                        tokio::select! {
                            biased;
                            _ = reorder_ctx.cancelled() => break,
                            item = seq_rx.recv() => {
                                match item {
                                    None => break,
                                    Some((_, result)) => {
                                        if reorder_tx.send(result).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                        }
                    }
                } else {
                    let mut next_expected = 0u64;
                    let mut pending: HashMap<u64, StreamItem<Out>> = HashMap::new();
                    loop {
                        tokio::select! {
                            biased;
                            _ = reorder_ctx.cancelled() => break,
                            item = seq_rx.recv() => {
                                match item {
                                    None => break,
                                    Some((seq, result)) => {
                                        pending.insert(seq, result);
                                        while let Some(next) = pending.remove(&next_expected) {
                                            if reorder_tx.send(next).await.is_err() {
                                                return;
                                            }
                                            next_expected += 1;
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
            .instrument(debug_span!("async_mapper_reorder", name = %reorder_ordered_name)),
        );

        let dispatch_task_counter = task_counter.clone();
        spawn_tracked(
            dispatch_task_counter.as_ref(),
            async move {
                let mut seq = 0u64;
                let mut workers = Vec::new();

                loop {
                    tokio::select! {
                        biased;
                        _ = ctx.cancelled() => break,
                        item = input.recv() => {
                            match item {
                                None => break,
                                Some(item) => {
                                    let permit = tokio::select! {
                                        biased;
                                        _ = ctx.cancelled() => break,
                                        permit = semaphore.clone().acquire_owned() => permit.expect("semaphore never closed"),
                                    };
                                    let this_seq = seq;
                                    seq += 1;
                                    let seq_tx = seq_tx.clone();
                                    let map_fn = self.map_fn.clone();
                                    let child_ctx = ctx.child_token();
                                    let processor_name = self.name.clone();
                                    let worker_task_counter = task_counter.clone();

                                    workers.push(spawn_tracked(worker_task_counter.as_ref(), async move {
                                        let _permit = permit;
                                        let result = if item.is_error() {
                                            item.map(|_: In| -> Out { unreachable!("map never invoked on the error branch") })
                                        } else {
                                            let value = item.into_value();
                                            match map_fn(child_ctx, value).await {
                                                Ok(out) => StreamItem::new_success(out),
                                                Err(err) => StreamItem::new_error(
                                                    None,
                                                    crate::result::Message::new(err.to_string()),
                                                    processor_name,
                                                ),
                                            }
                                        };
                                        let _ = seq_tx.send((this_seq, result)).await;
                                    }));
                                }
                            }
                        }
                    }
                }

                for worker in workers {
                    let _ = worker.await;
                }
            }
            .instrument(debug_span!("async_mapper", name = %name)),
        );

        rx
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::processor::output_channel;
    use std::time::Duration;

    #[tokio::test]
    async fn ordered_mode_preserves_input_order_despite_variable_latency() {
        let mapper = Arc::new(
            AsyncMapper::new(|_ctx, v: u64| {
                Box::pin(async move {
                    let delay = 10u64.saturating_sub(v);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Ok(format!("item-{v}"))
                }) as BoxFuture<'static, Result<String, StreamError>>
            })
            .with_workers(3)
            .with_ordered(true),
        );

        let (tx, input) = output_channel::<u64>(16);
        let mut out = mapper.process(CancelToken::new(), input);
        for v in 0..9 {
            tx.send(StreamItem::new_success(v)).await.unwrap();
        }
        drop(tx);

        let mut results = Vec::new();
        while let Some(item) = out.recv().await {
            results.push(item.value().clone());
        }
        let expected: Vec<String> = (0..9).map(|v| format!("item-{v}")).collect();
        assert_eq!(results, expected);
    }

    #[tokio::test]
    async fn errors_bypass_the_user_function() {
        let mapper = Arc::new(AsyncMapper::new(|_ctx, v: i32| {
            Box::pin(async move { Ok(v * 2) }) as BoxFuture<'static, Result<i32, StreamError>>
        }));

        let (tx, input) = output_channel::<i32>(16);
        let mut out = mapper.process(CancelToken::new(), input);
        tx.send(StreamItem::new_error(Some(1), crate::result::Message::new("boom"), "src"))
            .await
            .unwrap();
        drop(tx);

        let forwarded = out.recv().await.unwrap();
        assert!(forwarded.is_error());
    }
}
