//! Content-based routing (§4.12): Switch, Router, and Partition.

pub mod partition;
pub mod router;
pub mod switch;

pub use partition::{Partition, PartitionStrategy};
pub use router::Router;
pub use switch::Switch;
