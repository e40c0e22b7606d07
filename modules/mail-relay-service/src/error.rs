//! Error taxonomy for the relay.
//!
//! Only listing, storage and sink-write failures abort a run. Per-item
//! resolve failures and notifier failures are logged and swallowed by the
//! components that produce them.

use std::fmt;
use thiserror::Error;

/// Failure reported by an upstream HTTP collaborator (Gmail, Sheets, Telegram, Slack)
#[derive(Debug, Clone)]
pub struct ApiError {
    pub message: String,
    /// HTTP status code if the request reached the server
    pub status: Option<u16>,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        ApiError {
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(message: impl Into<String>, status: u16) -> Self {
        ApiError {
            message: message.into(),
            status: Some(status),
        }
    }

    /// The referenced resource no longer exists (deleted or evicted)
    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == Some(401)
    }

    /// A 4xx answer that repeating the same request cannot change.
    /// 401 (token refresh), 408 and 429 are excluded.
    pub fn is_permanent(&self) -> bool {
        matches!(self.status, Some(code) if (400..500).contains(&code) && !matches!(code, 401 | 408 | 429))
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.status {
            write!(f, "[HTTP {}] {}", code, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("history listing failed: {0}")]
    ListingFailed(#[source] ApiError),
    /// The start cursor fell out of Gmail's history retention window
    #[error("history cursor {cursor} is no longer available upstream: {source}")]
    CursorExpired {
        cursor: String,
        #[source]
        source: ApiError,
    },
}

#[derive(Debug, Error)]
#[error("failed to resolve message {message_id}: {source}")]
pub struct ItemResolveError {
    pub message_id: String,
    #[source]
    pub source: ApiError,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt value stored under '{key}': {value}")]
    Corrupt { key: String, value: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(String),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: String, value: String },
    #[error("invalid column reference '{0}'")]
    InvalidColumn(String),
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("sink api error: {0}")]
    Api(#[from] ApiError),
    #[error("sink storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("sink layout error: {0}")]
    Layout(#[from] ConfigError),
}

#[derive(Debug, Error)]
#[error("notifier {target} failed: {source}")]
pub struct NotifyError {
    pub target: String,
    #[source]
    pub source: ApiError,
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("schedule storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch registration failed: {0}")]
    Subscribe(#[source] ApiError),
    #[error("watch teardown failed: {0}")]
    Unsubscribe(#[source] ApiError),
    #[error("watch response carried an invalid expiration: {0}")]
    InvalidExpiration(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// Unrecoverable failure of a relay run
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error("relay run timed out after {0}s")]
    TimedOut(u64),
}

impl RelayError {
    /// Whether redelivering the same notification could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            RelayError::Decode(_) => false,
            RelayError::Fetch(FetchError::CursorExpired { .. }) => false,
            RelayError::Fetch(FetchError::ListingFailed(e)) => !e.is_permanent(),
            _ => true,
        }
    }

    /// Stored cursor can no longer be listed; only a watch restart recovers
    pub fn is_cursor_expired(&self) -> bool {
        matches!(self, RelayError::Fetch(FetchError::CursorExpired { .. }))
    }

    /// Generic text that is safe to return to the caller
    pub fn public_message(&self) -> &'static str {
        match self {
            RelayError::Decode(_) => "Invalid notification payload",
            RelayError::Fetch(FetchError::CursorExpired { .. }) => {
                "History cursor expired; restart the watch"
            }
            RelayError::Fetch(_) => "Failed to fetch mailbox changes",
            RelayError::Storage(_) => "Relay state unavailable",
            RelayError::Write(_) => "Failed to write rows",
            RelayError::TimedOut(_) => "Relay run timed out",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_display() {
        assert_eq!(
            ApiError::with_status("gone", 404).to_string(),
            "[HTTP 404] gone"
        );
        assert_eq!(ApiError::new("timeout").to_string(), "timeout");
        assert!(ApiError::with_status("gone", 404).is_not_found());
        assert!(!ApiError::new("timeout").is_not_found());
    }

    #[test]
    fn test_public_message_hides_details() {
        let err = RelayError::Fetch(FetchError::ListingFailed(ApiError::with_status(
            "token abc expired",
            401,
        )));
        assert!(!err.public_message().contains("abc"));
        assert!(err.is_transient());

        let err = RelayError::Decode(DecodeError::InvalidPayload("missing cursor".into()));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_permanent_listing_errors_are_not_transient() {
        let listing = |status| {
            RelayError::Fetch(FetchError::ListingFailed(ApiError::with_status("x", status)))
        };
        assert!(!listing(400).is_transient());
        assert!(!listing(403).is_transient());
        assert!(listing(401).is_transient());
        assert!(listing(408).is_transient());
        assert!(listing(429).is_transient());
        assert!(listing(503).is_transient());
        assert!(RelayError::Fetch(FetchError::ListingFailed(ApiError::new("reset"))).is_transient());

        let expired = RelayError::Fetch(FetchError::CursorExpired {
            cursor: "100".to_string(),
            source: ApiError::with_status("Requested entity was not found.", 404),
        });
        assert!(!expired.is_transient());
        assert!(expired.is_cursor_expired());
        assert!(!listing(503).is_cursor_expired());
    }
}
