//! Typed, composable stream-processing primitives.
//!
//! A pipeline is built from [`Processor`]s wired together over bounded
//! `tokio::sync::mpsc` channels. Every channel carries [`result::Result`],
//! a success/error envelope with an immutable, copy-on-write [`Metadata`]
//! map rather than raw values — this is how window boundaries, partition
//! assignment, and error causes travel alongside the data without a
//! separate side channel. Cancellation is cooperative and hierarchical via
//! [`CancelToken`]; every processor's `process` takes one and a clock
//! ([`Clock`]) it can be driven against deterministically in tests.
//!
//! # Layout
//!
//! - Core contract: [`processor`], [`result`], [`metadata`], [`error`]
//! - Concurrency: [`concurrency`], [`clock`], [`atomic_time`]
//! - Processors: [`fan_in`], [`buffer`], [`batcher`], [`windowers`],
//!   [`aggregate`], [`throttle`], [`debounce`], [`async_mapper`], [`retry`],
//!   [`circuit_breaker`], [`dead_letter_queue`], [`routing`],
//!   [`window_collector`]

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod aggregate;
pub mod async_mapper;
pub mod atomic_time;
pub mod batcher;
pub mod buffer;
pub mod circuit_breaker;
pub mod clock;
pub mod concurrency;
pub mod dead_letter_queue;
pub mod debounce;
pub mod error;
pub mod fan_in;
pub mod metadata;
pub mod processor;
pub mod result;
pub mod retry;
pub mod routing;
pub mod throttle;
pub mod window_collector;
pub mod windowers;

pub use aggregate::{Aggregate, WindowRecord};
pub use async_mapper::AsyncMapper;
pub use atomic_time::AtomicTime;
pub use batcher::Batcher;
pub use buffer::Buffer;
pub use circuit_breaker::CircuitBreaker;
pub use clock::{Clock, FakeClock, Ticker, Timer};
pub use concurrency::{ActiveTaskCounter, CancelScope, CancelToken};
pub use dead_letter_queue::DeadLetterQueue;
pub use debounce::Debounce;
pub use error::{StreamError, StreamResult};
pub use fan_in::FanIn;
pub use metadata::{Metadata, MetadataValue, WindowKey, WindowMetadata, WindowType};
pub use processor::{Inbox, Outbox, Processor};
pub use result::{Cause, ErrorRecord, Result};
pub use retry::Retry;
pub use routing::{Partition, PartitionStrategy, Router, Switch};
pub use throttle::Throttle;
pub use window_collector::{WindowCollection, WindowCollector};
pub use windowers::{Session, Sliding, Tumbling};
