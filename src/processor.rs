//! The processor contract (§4.1).
//!
//! Every processor in this crate — Batcher, the windowers, Aggregate,
//! Throttle, Debounce, AsyncMapper, Retry, CircuitBreaker, and the routing
//! family — is a value with a `name()` and a `process(ctx, input) -> output`
//! method. `process` is synchronous: it spawns exactly one task that owns
//! the output [`mpsc::Sender`], reads `input` until it closes or `ctx` is
//! cancelled, and closes its output when it returns.
//!
//! [`Processor`] is the trait object form of this contract, used wherever a
//! processor wraps another generically (Retry and CircuitBreaker wrap an
//! arbitrary inner processor; Router dispatches to a named list of them).
//! Most call sites use a concrete struct's own `process` method directly and
//! never need the trait.

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::concurrency::CancelToken;
use crate::result::Result as StreamItem;

/// Bounded receiver of a stream's items, used as both a processor's input
/// and output type throughout this crate.
pub type Inbox<T> = mpsc::Receiver<StreamItem<T>>;
/// Bounded sender half of a stream channel.
pub type Outbox<T> = mpsc::Sender<StreamItem<T>>;

/// Default channel capacity used where a processor doesn't expose its own
/// `buffer_size` knob.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// A uniform `process(ctx, in) -> out` processor, usable as a trait object
/// so that Retry, CircuitBreaker, and Router can wrap or dispatch to an
/// arbitrary inner processor without knowing its concrete type.
pub trait Processor<In, Out>: Send + Sync + 'static
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// Name used in error Results, log lines, and metrics.
    fn name(&self) -> &str;

    /// Spawn this processor's owning task and return its output channel.
    /// Safe to call once per instance unless documented otherwise by the
    /// implementer.
    fn process(self: Arc<Self>, ctx: CancelToken, input: Inbox<In>) -> Inbox<Out>;
}

/// Create a bounded channel pair sized for a processor's output, given an
/// optional explicit capacity (`0` or unset falls back to
/// [`DEFAULT_CHANNEL_CAPACITY`]).
pub fn output_channel<T>(capacity: usize) -> (Outbox<T>, Inbox<T>) {
    let capacity = if capacity == 0 {
        DEFAULT_CHANNEL_CAPACITY
    } else {
        capacity
    };
    mpsc::channel(capacity)
}
