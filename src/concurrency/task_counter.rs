//! Active-task introspection used by the leak-free property (§8, property 4).
//!
//! Every processor accepts an optional [`ActiveTaskCounter`] via
//! `with_task_counter` and spawns its task(s) through [`spawn_tracked`]
//! instead of a bare `tokio::spawn`. A pipeline wired with one shared
//! counter across every stage can therefore drain fully and assert
//! `counter.active()` has returned to its pre-pipeline baseline, rather than
//! relying on an informal "no hang" check. Processors built without a
//! counter fall back to a plain `tokio::spawn`, so this is opt-in and has no
//! effect unless a caller wires it up.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A shared counter of currently-running tasks spawned through it.
#[derive(Clone, Default)]
pub struct ActiveTaskCounter {
    count: Arc<AtomicUsize>,
}

impl ActiveTaskCounter {
    /// A counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks spawned through this counter that have not yet
    /// finished.
    pub fn active(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Spawn `future`, incrementing the counter on entry and decrementing
    /// it when the task finishes (including on panic).
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let count = self.count.clone();
        count.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let guard = DecrementOnDrop(count);
            let result = future.await;
            drop(guard);
            result
        })
    }
}

struct DecrementOnDrop(Arc<AtomicUsize>);

impl Drop for DecrementOnDrop {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Spawn `future` through `counter` when a processor was given one (via
/// `with_task_counter`), falling back to a plain `tokio::spawn` otherwise.
/// Every processor's owning task (and the inner worker/reader tasks it
/// fans out to) goes through this, so a pipeline wired with a shared
/// counter can assert `counter.active() == 0` once fully drained (§8,
/// property 4).
pub fn spawn_tracked<F>(counter: Option<&ActiveTaskCounter>, future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match counter {
        Some(counter) => counter.spawn(future),
        None => tokio::spawn(future),
    }
}
