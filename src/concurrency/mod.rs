//! Cooperative-concurrency primitives shared by every processor.
//!
//! Ground truth for this module is a workflow engine's
//! `concurrency::{cancel_token, nursery}` pair, generalized here into the
//! stream-processing contract's cancellation (`ctx`) and task-leak
//! introspection machinery.

pub mod cancel_token;
pub mod task_counter;

pub use cancel_token::{CancelScope, CancelToken};
pub use task_counter::{spawn_tracked, ActiveTaskCounter};
