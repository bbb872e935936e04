//! The universal stream envelope.
//!
//! Every processor in this crate consumes and produces `Result<T>` rather
//! than raw `T`: a value is either a success or an error, never both, and
//! carries an immutable [`Metadata`] map that accumulates context (most
//! visibly window metadata) as it flows through a pipeline. This mirrors
//! the source library's `Result[T]`, not Rust's `std::result::Result` — the
//! two are deliberately distinct types, so processors import this one
//! explicitly rather than shadowing the prelude's `Result`.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

use crate::metadata::Metadata;

/// A type-erased, cloneable error cause, shared (not copied) across clones
/// of the `Result` that carries it.
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// The error half of a [`Result`]: the offending item (if still available),
/// the underlying cause, the processor that raised it, and when.
#[derive(Clone)]
pub struct ErrorRecord<T> {
    /// The item that failed, when the processor still had it at hand.
    /// `None` when the transformation that failed could not produce a
    /// value of this `Result`'s type (see [`Result::map`]).
    pub item: Option<T>,
    /// The underlying cause.
    pub cause: Cause,
    /// Name of the processor that raised this error.
    pub processor: String,
    /// When the error was raised.
    pub timestamp: DateTime<Utc>,
}

impl<T: fmt::Debug> fmt::Debug for ErrorRecord<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorRecord")
            .field("item", &self.item)
            .field("cause", &self.cause.to_string())
            .field("processor", &self.processor)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

enum Inner<T> {
    Success(T),
    Error(ErrorRecord<T>),
}

/// The success/error envelope carried on every channel. See the module
/// documentation for why this is not `std::result::Result`.
pub struct Result<T> {
    inner: Inner<T>,
    metadata: Metadata,
}

impl<T> Result<T> {
    /// Wrap a successful value with empty metadata.
    pub fn new_success(value: T) -> Self {
        Result {
            inner: Inner::Success(value),
            metadata: Metadata::empty(),
        }
    }

    /// Wrap an error. `item` is the offending value if the caller still
    /// has it; `processor` should be the raising processor's `name()`.
    pub fn new_error(
        item: Option<T>,
        cause: impl std::error::Error + Send + Sync + 'static,
        processor: impl Into<String>,
    ) -> Self {
        Result {
            inner: Inner::Error(ErrorRecord {
                item,
                cause: Arc::new(cause),
                processor: processor.into(),
                timestamp: Utc::now(),
            }),
            metadata: Metadata::empty(),
        }
    }

    /// Build directly from an already-built [`ErrorRecord`] (used by
    /// processors forwarding an error produced upstream, e.g. Batcher
    /// converting `Result<T>::Error` into `Result<Vec<T>>::Error`).
    pub fn from_error_record(record: ErrorRecord<T>) -> Self {
        Result {
            inner: Inner::Error(record),
            metadata: Metadata::empty(),
        }
    }

    /// `true` if this is a success value.
    pub fn is_success(&self) -> bool {
        matches!(self.inner, Inner::Success(_))
    }

    /// `true` if this is an error.
    pub fn is_error(&self) -> bool {
        matches!(self.inner, Inner::Error(_))
    }

    /// Borrow the success value, panicking if this is an error.
    ///
    /// # Panics
    /// Panics if `self.is_error()`. Use [`Result::try_value`] or
    /// [`Result::value_or`] when the envelope might be an error.
    pub fn value(&self) -> &T {
        match &self.inner {
            Inner::Success(v) => v,
            Inner::Error(_) => panic!("Result::value called on an error Result"),
        }
    }

    /// Consume and return the success value, panicking if this is an error.
    ///
    /// # Panics
    /// Panics if `self.is_error()`.
    pub fn into_value(self) -> T {
        match self.inner {
            Inner::Success(v) => v,
            Inner::Error(_) => panic!("Result::into_value called on an error Result"),
        }
    }

    /// Borrow the success value, or `None` if this is an error.
    pub fn try_value(&self) -> Option<&T> {
        match &self.inner {
            Inner::Success(v) => Some(v),
            Inner::Error(_) => None,
        }
    }

    /// Consume and return the success value, or `fallback` if this is an
    /// error.
    pub fn value_or(self, fallback: T) -> T {
        match self.inner {
            Inner::Success(v) => v,
            Inner::Error(_) => fallback,
        }
    }

    /// Borrow the error record, or `None` if this is a success.
    pub fn error(&self) -> Option<&ErrorRecord<T>> {
        match &self.inner {
            Inner::Success(_) => None,
            Inner::Error(e) => Some(e),
        }
    }

    /// This `Result`'s metadata map.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Return a copy of this `Result` with `key` set to `value` in its
    /// metadata. Shares the underlying value/error, not the metadata map.
    pub fn with_metadata(self, key: impl Into<String>, value: impl Into<crate::metadata::MetadataValue>) -> Self {
        let metadata = self.metadata.with(key, value);
        Result {
            inner: self.inner,
            metadata,
        }
    }

    /// Replace this `Result`'s metadata map wholesale.
    pub fn with_full_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Transform a success value with `f`; errors pass through unchanged
    /// except that the offending item can no longer be represented in the
    /// target type and becomes `None`. Metadata is preserved either way.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Result<U> {
        let metadata = self.metadata.clone();
        let inner = match self.inner {
            Inner::Success(v) => Inner::Success(f(v)),
            Inner::Error(e) => Inner::Error(ErrorRecord {
                item: None,
                cause: e.cause,
                processor: e.processor,
                timestamp: e.timestamp,
            }),
        };
        Result { inner, metadata }
    }

    /// Transform the error cause with `f`, leaving a success value (and
    /// its metadata) untouched.
    pub fn map_error(self, f: impl FnOnce(Cause) -> Cause) -> Self {
        let metadata = self.metadata.clone();
        let inner = match self.inner {
            Inner::Success(v) => Inner::Success(v),
            Inner::Error(e) => Inner::Error(ErrorRecord {
                item: e.item,
                cause: f(e.cause),
                processor: e.processor,
                timestamp: e.timestamp,
            }),
        };
        Result { inner, metadata }
    }
}

impl<T: Clone> Clone for Result<T> {
    fn clone(&self) -> Self {
        let inner = match &self.inner {
            Inner::Success(v) => Inner::Success(v.clone()),
            Inner::Error(e) => Inner::Error(e.clone()),
        };
        Result {
            inner,
            metadata: self.metadata.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Result<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Inner::Success(v) => f.debug_tuple("Success").field(v).finish(),
            Inner::Error(e) => f.debug_tuple("Error").field(e).finish(),
        }
    }
}

/// A plain string-message error, used where a processor needs to wrap a
/// `String` as the [`Cause`] of an error `Result` (e.g. a caught panic).
#[derive(Debug, Clone)]
pub struct Message(pub String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for Message {}

impl Message {
    /// Build a [`Message`] cause from anything `Display`.
    pub fn new(s: impl fmt::Display) -> Self {
        Message(s.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn success_round_trips() {
        let r = Result::new_success(42);
        assert!(r.is_success());
        assert_eq!(*r.value(), 42);
    }

    #[test]
    fn error_carries_item_and_processor() {
        let r: Result<i32> = Result::new_error(Some(7), Message::new("boom"), "mapper");
        assert!(r.is_error());
        let err = r.error().unwrap();
        assert_eq!(err.item, Some(7));
        assert_eq!(err.processor, "mapper");
    }

    #[test]
    #[should_panic]
    fn value_panics_on_error() {
        let r: Result<i32> = Result::new_error(None, Message::new("boom"), "mapper");
        let _ = r.value();
    }

    #[test]
    fn value_or_falls_back_on_error() {
        let r: Result<i32> = Result::new_error(None, Message::new("boom"), "mapper");
        assert_eq!(r.value_or(99), 99);
    }

    #[test]
    fn map_preserves_metadata() {
        let r = Result::new_success(2).with_metadata("k", "v");
        let mapped = r.map(|v| v * 10);
        assert_eq!(*mapped.value(), 20);
        assert_eq!(mapped.metadata().get_as::<String>("k").map(String::as_str), Some("v"));
    }

    #[test]
    fn map_error_preserves_item_and_metadata() {
        let r: Result<i32> = Result::new_error(Some(5), Message::new("boom"), "p").with_metadata("k", "v");
        let mapped = r.map_error(|_| Arc::new(Message::new("wrapped")) as Cause);
        assert_eq!(mapped.error().unwrap().item, Some(5));
        assert_eq!(mapped.metadata().get_as::<String>("k").map(String::as_str), Some("v"));
        assert_eq!(mapped.error().unwrap().cause.to_string(), "wrapped");
    }
}
