//! Time-based windowing (§4.5): tumbling, sliding, and session windows.
//!
//! Each windower tags every `Result` it forwards with window metadata
//! (§3, "Window metadata") and does not otherwise touch the payload —
//! grouping the tagged stream into [`crate::window_collector::WindowCollection`]s
//! is [`crate::window_collector::WindowCollector`]'s job, not this module's.
//!
//! A legacy, struct-collecting form of each windower also existed upstream
//! (`T -> Window<T>` rather than `Result<T> -> Result<T>` with metadata).
//! The [`legacy`] submodule offers thin wrappers with that shape, built on
//! top of the modern windowers plus [`crate::window_collector::WindowCollector`]
//! rather than duplicating the windowing logic.

pub mod session;
pub mod sliding;
pub mod tumbling;

pub mod legacy;

pub use session::Session;
pub use sliding::Sliding;
pub use tumbling::Tumbling;
