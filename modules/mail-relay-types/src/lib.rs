//! Shared types for the mail relay service and its RPC clients.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// =====================================================
// Inbound Trigger
// =====================================================

/// Task name that relays a Gmail change notification.
pub const TASK_PROCESS_NEW_EMAILS: &str = "processNewEmails";
/// Task name that (re)registers the Gmail watch.
pub const TASK_START_WATCH: &str = "startWatch";
/// Task name that tears the Gmail watch down.
pub const TASK_STOP_WATCH: &str = "stopWatch";
/// Task name that reports service status.
pub const TASK_STATUS: &str = "status";

/// Request body accepted by `POST /exec`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    pub api_key: String,
    pub task: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Response body for every trigger task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub success: bool,
    pub message: String,
}

impl TriggerResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

// =====================================================
// Gmail Push Payloads
// =====================================================

/// Pub/Sub push envelope as delivered to the push endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubSubPushEnvelope {
    pub message: PubSubMessage,
    #[serde(default)]
    pub subscription: String,
}

/// Pub/Sub message wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubSubMessage {
    /// Base64-encoded message data
    #[serde(default)]
    pub data: String,
    #[serde(rename = "messageId", default)]
    pub message_id: String,
    #[serde(rename = "publishTime")]
    pub publish_time: Option<String>,
    pub attributes: Option<HashMap<String, String>>,
}

// =====================================================
// Run Log
// =====================================================

/// Terminal outcome of a relay run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Aborted,
    /// The stored history cursor is past Gmail's retention window
    CursorExpired,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Aborted => "aborted",
            RunOutcome::CursorExpired => "cursor_expired",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(RunOutcome::Completed),
            "aborted" => Some(RunOutcome::Aborted),
            "cursor_expired" => Some(RunOutcome::CursorExpired),
            _ => None,
        }
    }
}

/// One recorded relay run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRun {
    pub id: i64,
    pub origin: Option<String>,
    pub from_cursor: Option<String>,
    pub new_cursor: Option<String>,
    pub records: i64,
    pub rows_written: i64,
    pub outcome: RunOutcome,
    /// Stage at which an aborted run stopped
    pub stage: Option<String>,
    pub message: String,
    pub started_at: String,
    pub finished_at: String,
}

// =====================================================
// RPC Types
// =====================================================

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RecentRunsQuery {
    pub limit: Option<usize>,
}

/// Subscription state as reported over RPC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchStatus {
    pub listening: bool,
    pub renewal_deadline: Option<String>,
    pub renewal_task_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> RpcResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

// =====================================================
// Service Status
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub uptime_secs: u64,
    pub watch: WatchStatus,
    pub cursor: Option<String>,
    /// The stored cursor can no longer be listed; stop and start the watch
    pub cursor_expired: bool,
    pub sink: String,
    pub notifiers: Vec<String>,
    pub last_run: Option<RelayRun>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_request_camel_case() {
        let req: TriggerRequest = serde_json::from_str(
            r#"{"apiKey":"k","task":"processNewEmails","data":{"emailAddress":"a@b.c","historyId":"1"}}"#,
        )
        .unwrap();
        assert_eq!(req.api_key, "k");
        assert_eq!(req.task, TASK_PROCESS_NEW_EMAILS);
        assert_eq!(req.data["historyId"], "1");
    }

    #[test]
    fn test_trigger_request_without_data() {
        let req: TriggerRequest =
            serde_json::from_str(r#"{"apiKey":"k","task":"status"}"#).unwrap();
        assert!(req.data.is_null());
    }

    #[test]
    fn test_trigger_response_shape() {
        let json = serde_json::to_value(TriggerResponse::fail("nope")).unwrap();
        assert_eq!(json, serde_json::json!({"success": false, "message": "nope"}));
    }

    #[test]
    fn test_run_outcome_names() {
        assert_eq!(RunOutcome::from_str("aborted"), Some(RunOutcome::Aborted));
        assert_eq!(RunOutcome::Completed.as_str(), "completed");
        assert_eq!(RunOutcome::from_str("other"), None);
        assert_eq!(
            RunOutcome::from_str(RunOutcome::CursorExpired.as_str()),
            Some(RunOutcome::CursorExpired)
        );
        assert_eq!(
            serde_json::to_value(RunOutcome::CursorExpired).unwrap(),
            serde_json::json!("cursor_expired")
        );
    }
}
