//! Lock-free nanosecond-precision time storage for hot paths.
//!
//! [`CircuitBreaker`](crate::circuit_breaker::CircuitBreaker) and
//! [`DeadLetterQueue`](crate::dead_letter_queue::DeadLetterQueue) read and
//! write `last_state_change` / `last_failure_time` from multiple tasks at a
//! high rate; routing them through a `Mutex<DateTime<Utc>>` would be the
//! only lock on an otherwise lock-free request path. `AtomicTime` stores
//! nanoseconds-since-epoch in a single `AtomicI64` instead.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// The sentinel representing "never". `i64::MIN` rather than `0` so that a
/// real timestamp of the Unix epoch — which is exactly where `FakeClock`
/// starts (see `clock.rs`) — is never confused with an unset cell.
const NEVER: i64 = i64::MIN;

/// A lock-free `Option<DateTime<Utc>>` cell.
pub struct AtomicTime {
    nanos: AtomicI64,
}

impl AtomicTime {
    /// A cell initialized to "never".
    pub fn never() -> Self {
        Self {
            nanos: AtomicI64::new(NEVER),
        }
    }

    /// A cell initialized to `t`.
    pub fn new(t: DateTime<Utc>) -> Self {
        Self {
            nanos: AtomicI64::new(t.timestamp_nanos_opt().unwrap_or(NEVER)),
        }
    }

    /// Store `t`.
    pub fn store(&self, t: DateTime<Utc>) {
        self.nanos
            .store(t.timestamp_nanos_opt().unwrap_or(NEVER), Ordering::SeqCst);
    }

    /// Clear the cell back to "never".
    pub fn clear(&self) {
        self.nanos.store(NEVER, Ordering::SeqCst);
    }

    /// Load the current value, or `None` if the cell is "never".
    pub fn load(&self) -> Option<DateTime<Utc>> {
        let nanos = self.nanos.load(Ordering::SeqCst);
        if nanos == NEVER {
            return None;
        }
        Some(Utc.timestamp_nanos(nanos))
    }
}

impl Default for AtomicTime {
    fn default() -> Self {
        Self::never()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn starts_as_never() {
        let t = AtomicTime::never();
        assert!(t.load().is_none());
    }

    #[test]
    fn round_trips_a_timestamp() {
        let now = Utc::now();
        let t = AtomicTime::new(now);
        let loaded = t.load().unwrap();
        // nanosecond round-trip through i64 may lose sub-nanosecond
        // precision that chrono doesn't carry anyway; compare directly.
        assert_eq!(loaded.timestamp_nanos_opt(), now.timestamp_nanos_opt());
    }

    #[test]
    fn clear_resets_to_never() {
        let t = AtomicTime::new(Utc::now());
        t.clear();
        assert!(t.load().is_none());
    }
}
