//! Crate-wide error types.
//!
//! `StreamError` covers construction-time misconfiguration and internal
//! plumbing failures. It is deliberately distinct from the per-item
//! [`crate::result::Result`] envelope: a processor never returns a Rust-level
//! `Err` for a failed *item* — that is encoded as `Result::Error { .. }` and
//! flows down the success channel like any other value. `StreamError` is only
//! seen by callers who construct a processor incorrectly, or internally when
//! a user function needs to be converted into an error Result.

use thiserror::Error;

/// Result type for fallible construction and internal plumbing.
pub type StreamResult<T> = Result<T, StreamError>;

/// Crate-wide error taxonomy.
#[derive(Debug, Error, Clone)]
pub enum StreamError {
    /// A processor was constructed with a parameter that cannot be clamped
    /// to a valid range (e.g. a `None` key-extractor, a zero partition count).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The user-supplied function returned an error.
    #[error("user function failed: {0}")]
    UserFunction(String),

    /// A predicate or key-function panicked and was caught at the boundary.
    #[error("panic caught in {processor}: {message}")]
    PanicCaught {
        /// Name of the processor that caught the panic.
        processor: String,
        /// Panic payload, downcast to a string where possible.
        message: String,
    },

    /// The wrapped processor (Retry, CircuitBreaker, DLQ) timed out.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The circuit breaker is open and rejecting requests.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// Window metadata was missing or had the wrong type.
    #[error("missing or malformed window metadata: {0}")]
    MissingWindowMetadata(String),

    /// Catch-all for wrapped causes that don't fit the above.
    #[error("{0}")]
    Other(String),
}

impl StreamError {
    /// Build a [`StreamError::PanicCaught`] from a `catch_unwind` payload.
    pub fn from_panic(processor: impl Into<String>, payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        StreamError::PanicCaught {
            processor: processor.into(),
            message,
        }
    }
}
