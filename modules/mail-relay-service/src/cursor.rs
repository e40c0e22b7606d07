//! History cursor and the store that persists it.

use crate::error::StorageError;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::fmt;

/// Opaque position in the Gmail history log.
///
/// Gmail history ids are decimal strings. Two decimal cursors compare
/// numerically; anything else compares as text and sorts after every
/// decimal cursor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(value: impl Into<String>) -> Self {
        Cursor(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Significant digits of a decimal cursor, without leading zeros
    fn digits(&self) -> Option<&str> {
        if self.0.is_empty() || !self.0.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(self.0.trim_start_matches('0'))
    }

    /// The later of two cursors
    pub fn max(self, other: Cursor) -> Cursor {
        if other > self { other } else { self }
    }
}

impl Ord for Cursor {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.digits(), other.digits()) {
            // Numeric order of arbitrary length decimals: more digits is larger
            (Some(a), Some(b)) => a
                .len()
                .cmp(&b.len())
                .then_with(|| a.cmp(b))
                .then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for Cursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Cursor {
    fn from(s: &str) -> Self {
        Cursor(s.to_string())
    }
}

/// Upstream subscription bookkeeping, owned by the watch manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionState {
    pub is_active: bool,
    pub renewal_deadline: Option<DateTime<Utc>>,
    /// Scheduler id of the pending renewal, if one is armed
    pub renewal_task_id: Option<String>,
}

/// Durable home of the history cursor and the listening flag.
///
/// Implementations never retry internally; storage failures go back to the caller.
pub trait CursorStore: Send + Sync {
    fn get_cursor(&self) -> Result<Option<Cursor>, StorageError>;

    /// Advance the cursor to `max(current, cursor)` atomically and return
    /// what is stored afterwards. A stale cursor never moves progress back.
    fn set_cursor(&self, cursor: &Cursor) -> Result<Cursor, StorageError>;

    fn clear_cursor(&self) -> Result<(), StorageError>;

    fn get_listening(&self) -> Result<bool, StorageError>;

    fn set_listening(&self, listening: bool) -> Result<(), StorageError>;

    fn get_subscription(&self) -> Result<SubscriptionState, StorageError>;

    fn set_subscription(&self, state: &SubscriptionState) -> Result<(), StorageError>;
}
