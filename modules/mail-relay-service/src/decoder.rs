//! Decoding of inbound change notifications.
//!
//! Pure functions: no I/O, no state.

use crate::cursor::Cursor;
use crate::error::DecodeError;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use mail_relay_types::PubSubPushEnvelope;
use serde::Deserialize;
use serde_json::Value;

/// A validated change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Mailbox that changed
    pub origin_identity: String,
    /// History position claimed by the notification
    pub cursor: Cursor,
}

#[derive(Deserialize)]
struct RawNotification {
    #[serde(rename = "emailAddress", alias = "originIdentity")]
    email_address: Option<Value>,
    #[serde(rename = "historyId", alias = "cursor")]
    history_id: Option<Value>,
}

/// Decode a notification body (`{"emailAddress": .., "historyId": ..}`).
///
/// `historyId` may be a string or a non-negative integer; Gmail's Pub/Sub
/// payload uses the latter.
pub fn decode(raw: &[u8]) -> Result<Notification, DecodeError> {
    let parsed: RawNotification = serde_json::from_slice(raw)
        .map_err(|e| DecodeError::InvalidPayload(format!("not a JSON object: {}", e)))?;

    let origin_identity = match parsed.email_address {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(_) => {
            return Err(DecodeError::InvalidPayload(
                "emailAddress must be a non-empty string".to_string(),
            ));
        }
        None => return Err(DecodeError::InvalidPayload("missing emailAddress".to_string())),
    };

    let cursor = match parsed.history_id {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) if n.is_u64() => n.to_string(),
        Some(_) => {
            return Err(DecodeError::InvalidPayload(
                "historyId must be a non-empty string or a non-negative integer".to_string(),
            ));
        }
        None => return Err(DecodeError::InvalidPayload("missing historyId".to_string())),
    };

    Ok(Notification {
        origin_identity,
        cursor: Cursor::new(cursor),
    })
}

/// Extract the raw notification bytes from a Pub/Sub push envelope
pub fn unwrap_push_envelope(envelope: &PubSubPushEnvelope) -> Result<Vec<u8>, DecodeError> {
    if envelope.message.data.is_empty() {
        return Err(DecodeError::InvalidPayload(
            "push message carries no data".to_string(),
        ));
    }
    BASE64
        .decode(envelope.message.data.trim())
        .map_err(|e| DecodeError::InvalidPayload(format!("push data is not base64: {}", e)))
}
