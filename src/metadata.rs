//! Immutable, copy-on-write metadata attached to every [`crate::result::Result`].
//!
//! A [`Metadata`] map never mutates in place: [`Metadata::with`] returns a
//! fresh map, so concurrent readers of an existing `Result` never need to
//! lock. Values are opaque (`Arc<dyn Any + Send + Sync>`, mirroring the
//! Go source's `interface{}`) — windowers and [`crate::routing::partition`]
//! store typed values and downstream code downcasts them back with
//! [`MetadataValue::downcast_ref`].

use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::StreamError;

/// An opaque metadata value. Construct with [`MetadataValue::new`] and
/// retrieve the concrete type with [`MetadataValue::downcast_ref`].
#[derive(Clone)]
pub struct MetadataValue(Arc<dyn Any + Send + Sync>);

impl MetadataValue {
    /// Wrap any `'static` value as an opaque metadata value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        MetadataValue(Arc::new(value))
    }

    /// Attempt to view the value as `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.downcast_ref::<String>() {
            return write!(f, "{:?}", s);
        }
        if let Some(s) = self.downcast_ref::<&str>() {
            return write!(f, "{:?}", s);
        }
        if let Some(d) = self.downcast_ref::<DateTime<Utc>>() {
            return write!(f, "{}", d);
        }
        if let Some(d) = self.downcast_ref::<Duration>() {
            return write!(f, "{:?}", d);
        }
        if let Some(i) = self.downcast_ref::<i64>() {
            return write!(f, "{}", i);
        }
        if let Some(i) = self.downcast_ref::<usize>() {
            return write!(f, "{}", i);
        }
        write!(f, "<opaque metadata value>")
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        MetadataValue::new(v)
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        MetadataValue::new(v.to_string())
    }
}

impl From<DateTime<Utc>> for MetadataValue {
    fn from(v: DateTime<Utc>) -> Self {
        MetadataValue::new(v)
    }
}

impl From<Duration> for MetadataValue {
    fn from(v: Duration) -> Self {
        MetadataValue::new(v)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        MetadataValue::new(v)
    }
}

impl From<usize> for MetadataValue {
    fn from(v: usize) -> Self {
        MetadataValue::new(v)
    }
}

/// Immutable, copy-on-write string-keyed metadata map.
#[derive(Clone, Debug, Default)]
pub struct Metadata(Arc<HashMap<String, MetadataValue>>);

impl Metadata {
    /// An empty metadata map. Cheap: shares a single empty `Arc`.
    pub fn empty() -> Self {
        Metadata(Arc::new(HashMap::new()))
    }

    /// Return a new map with `key` set to `value`. The empty key is
    /// ignored (the returned map is unchanged) to avoid silently
    /// introducing an unaddressable entry.
    pub fn with(&self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        let key = key.into();
        if key.is_empty() {
            return self.clone();
        }
        let mut map = (*self.0).clone();
        map.insert(key, value.into());
        Metadata(Arc::new(map))
    }

    /// Look up a value by key.
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.0.get(key)
    }

    /// Look up and downcast a value in one step.
    pub fn get_as<T: Any>(&self, key: &str) -> Option<&T> {
        self.get(key).and_then(MetadataValue::downcast_ref::<T>)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The window shape a [`WindowMetadata`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowType {
    /// Disjoint, fixed-size windows.
    Tumbling,
    /// Overlapping, fixed-size windows advancing by a slide interval.
    Sliding,
    /// Activity-gap-bounded windows, one per key.
    Session,
}

impl WindowType {
    fn as_str(&self) -> &'static str {
        match self {
            WindowType::Tumbling => "tumbling",
            WindowType::Sliding => "sliding",
            WindowType::Session => "session",
        }
    }
}

/// Standardized metadata keys attached by windowers.
pub mod keys {
    /// Window start timestamp (`DateTime<Utc>`).
    pub const WINDOW_START: &str = "window_start";
    /// Window end timestamp (`DateTime<Utc>`).
    pub const WINDOW_END: &str = "window_end";
    /// Window shape (`"tumbling" | "sliding" | "session"`, `String`).
    pub const WINDOW_TYPE: &str = "window_type";
    /// Window size (`Duration`).
    pub const WINDOW_SIZE: &str = "window_size";
    /// Slide interval, sliding windows only (`Duration`).
    pub const WINDOW_SLIDE: &str = "window_slide";
    /// Inactivity gap, session windows only (`Duration`).
    pub const WINDOW_GAP: &str = "window_gap";
    /// Session partition key, session windows only (`String`).
    pub const SESSION_KEY: &str = "session_key";
    /// Index of the partition an item was routed to (`usize`).
    pub const PARTITION_INDEX: &str = "partition_index";
    /// Total number of partitions (`usize`).
    pub const PARTITION_TOTAL: &str = "partition_total";
    /// Name of the partition strategy used (`String`).
    pub const PARTITION_STRATEGY: &str = "partition_strategy";
}

/// A typed view over the window metadata attached to a `Result`, produced
/// by [`get_window_metadata`] and attached by [`add_window_metadata`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowMetadata {
    /// Inclusive start of the window.
    pub start: DateTime<Utc>,
    /// Exclusive end of the window.
    pub end: DateTime<Utc>,
    /// Window shape.
    pub window_type: WindowType,
    /// Configured window size.
    pub size: Duration,
    /// Configured slide interval (sliding windows only).
    pub slide: Option<Duration>,
    /// Configured inactivity gap (session windows only).
    pub gap: Option<Duration>,
    /// Session partition key (session windows only).
    pub session_key: Option<String>,
}

/// Struct-valued key for grouping window-tagged results without string
/// formatting on the hot path (§9: "WindowCollector struct-key").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowKey {
    /// Window start, nanoseconds since the Unix epoch.
    pub start_nanos: i64,
    /// Window end, nanoseconds since the Unix epoch.
    pub end_nanos: i64,
}

impl WindowMetadata {
    /// The struct-valued key for this window.
    pub fn key(&self) -> WindowKey {
        WindowKey {
            start_nanos: self.start.timestamp_nanos_opt().unwrap_or(i64::MIN),
            end_nanos: self.end.timestamp_nanos_opt().unwrap_or(i64::MAX),
        }
    }

    /// Attach this window's keys onto a metadata map.
    pub fn apply(&self, metadata: &Metadata) -> Metadata {
        let mut m = metadata.with(keys::WINDOW_START, self.start);
        m = m.with(keys::WINDOW_END, self.end);
        m = m.with(keys::WINDOW_TYPE, self.window_type.as_str());
        m = m.with(keys::WINDOW_SIZE, self.size);
        if let Some(slide) = self.slide {
            m = m.with(keys::WINDOW_SLIDE, slide);
        }
        if let Some(gap) = self.gap {
            m = m.with(keys::WINDOW_GAP, gap);
        }
        if let Some(ref key) = self.session_key {
            m = m.with(keys::SESSION_KEY, key.as_str());
        }
        m
    }
}

/// Extract a typed [`WindowMetadata`] from a metadata map, failing if any
/// required key is missing or has the wrong type.
pub fn get_window_metadata(metadata: &Metadata) -> Result<WindowMetadata, StreamError> {
    let start = *metadata
        .get_as::<DateTime<Utc>>(keys::WINDOW_START)
        .ok_or_else(|| StreamError::MissingWindowMetadata(keys::WINDOW_START.to_string()))?;
    let end = *metadata
        .get_as::<DateTime<Utc>>(keys::WINDOW_END)
        .ok_or_else(|| StreamError::MissingWindowMetadata(keys::WINDOW_END.to_string()))?;
    let window_type_str = metadata
        .get_as::<String>(keys::WINDOW_TYPE)
        .ok_or_else(|| StreamError::MissingWindowMetadata(keys::WINDOW_TYPE.to_string()))?;
    let window_type = match window_type_str.as_str() {
        "tumbling" => WindowType::Tumbling,
        "sliding" => WindowType::Sliding,
        "session" => WindowType::Session,
        other => {
            return Err(StreamError::MissingWindowMetadata(format!(
                "unknown window_type {other:?}"
            )))
        }
    };
    let size = *metadata
        .get_as::<Duration>(keys::WINDOW_SIZE)
        .ok_or_else(|| StreamError::MissingWindowMetadata(keys::WINDOW_SIZE.to_string()))?;
    let slide = metadata.get_as::<Duration>(keys::WINDOW_SLIDE).copied();
    let gap = metadata.get_as::<Duration>(keys::WINDOW_GAP).copied();
    let session_key = metadata.get_as::<String>(keys::SESSION_KEY).cloned();

    Ok(WindowMetadata {
        start,
        end,
        window_type,
        size,
        slide,
        gap,
        session_key,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn with_is_copy_on_write() {
        let base = Metadata::empty();
        let a = base.with("k", "v1");
        let b = a.with("k", "v2");

        assert_eq!(a.get_as::<String>("k").map(String::as_str), Some("v1"));
        assert_eq!(b.get_as::<String>("k").map(String::as_str), Some("v2"));
    }

    #[test]
    fn empty_key_is_ignored() {
        let base = Metadata::empty();
        let after = base.with("", "v");
        assert!(after.is_empty());
    }

    #[test]
    fn window_metadata_round_trips() {
        let now = Utc::now();
        let wm = WindowMetadata {
            start: now,
            end: now + chrono::Duration::seconds(5),
            window_type: WindowType::Tumbling,
            size: Duration::from_secs(5),
            slide: None,
            gap: None,
            session_key: None,
        };
        let metadata = wm.apply(&Metadata::empty());
        let round_tripped = get_window_metadata(&metadata).unwrap();
        assert_eq!(round_tripped, wm);
    }

    #[test]
    fn missing_window_metadata_fails() {
        let metadata = Metadata::empty();
        assert!(get_window_metadata(&metadata).is_err());
    }
}
