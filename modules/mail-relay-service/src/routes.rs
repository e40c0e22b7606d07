//! Axum route handlers: the trigger endpoint, the Pub/Sub push endpoint and
//! the RPC API.

use crate::cursor::CursorStore;
use crate::db::Db;
use crate::decoder;
use crate::relay::RelayProcessor;
use crate::secrets::{self, SecretStore};
use crate::watch::WatchLifecycleManager;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use mail_relay_types::*;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;

const DEFAULT_RUNS_LIMIT: usize = 20;
const MAX_RUNS_LIMIT: usize = 200;

pub struct AppState {
    pub relay: Arc<RelayProcessor>,
    pub watch: Arc<WatchLifecycleManager>,
    pub db: Arc<Db>,
    pub secrets: Arc<dyn SecretStore>,
    /// Token the push endpoint expects in `?token=`
    pub push_token: Option<String>,
    pub start_time: Instant,
}

impl AppState {
    fn key_accepted(&self, presented: Option<&str>) -> bool {
        match (presented, self.secrets.get(secrets::API_KEY)) {
            (Some(presented), Some(expected)) => secrets::keys_match(presented, &expected),
            _ => false,
        }
    }
}

// =====================================================
// Trigger Endpoint
// =====================================================

// POST /exec
pub async fn exec(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> (StatusCode, Json<TriggerResponse>) {
    let req: TriggerRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            log::warn!("[MAIL_RELAY] Unparseable trigger request: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(TriggerResponse::fail("Invalid request")),
            );
        }
    };

    if !state.key_accepted(Some(req.api_key.as_str())) {
        log::warn!("[MAIL_RELAY] Trigger rejected: bad API key (task {})", req.task);
        return (
            StatusCode::UNAUTHORIZED,
            Json(TriggerResponse::fail("Unauthorized")),
        );
    }

    let response = match req.task.as_str() {
        TASK_PROCESS_NEW_EMAILS => {
            let raw = serde_json::to_vec(&req.data).unwrap_or_default();
            state.relay.process(&raw).await.response()
        }
        TASK_START_WATCH => match state.watch.start(None).await {
            Ok(started) => {
                log::info!(
                    "[MAIL_RELAY] startWatch at history {} ({}), renewal task {}",
                    started.history_id,
                    if started.seeded_cursor { "cursor seeded" } else { "cursor kept" },
                    started.renewal_task_id
                );
                TriggerResponse::ok(format!(
                    "Watch started until {}; renewal scheduled for {}",
                    started.expires_at.to_rfc3339(),
                    started.renewal_deadline.to_rfc3339()
                ))
            }
            Err(e) => {
                log::error!("[MAIL_RELAY] startWatch failed: {}", e);
                TriggerResponse::fail("Failed to start watch")
            }
        },
        TASK_STOP_WATCH => match state.watch.stop().await {
            Ok(()) => TriggerResponse::ok("Watch stopped"),
            Err(e) => {
                log::error!("[MAIL_RELAY] stopWatch failed: {}", e);
                TriggerResponse::fail("Failed to stop watch")
            }
        },
        TASK_STATUS => match state.watch.status() {
            Ok(status) if status.listening => TriggerResponse::ok("Listening"),
            Ok(_) => TriggerResponse::ok("Stopped"),
            Err(e) => {
                log::error!("[MAIL_RELAY] status failed: {}", e);
                TriggerResponse::fail("Status unavailable")
            }
        },
        other => {
            log::warn!("[MAIL_RELAY] Unknown trigger task '{}'", other);
            TriggerResponse::fail("Unknown task")
        }
    };

    (StatusCode::OK, Json(response))
}

// =====================================================
// Pub/Sub Push Endpoint
// =====================================================

#[derive(Debug, Default, Deserialize)]
pub struct PushQuery {
    pub token: Option<String>,
}

// POST /pubsub/push
//
// Pub/Sub redelivers on any non-2xx answer, so only failures a retry could
// fix are answered with 503.
pub async fn pubsub_push(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PushQuery>,
    body: Bytes,
) -> (StatusCode, Json<TriggerResponse>) {
    if let Some(expected) = state.push_token.as_deref() {
        let presented = query.token.as_deref().unwrap_or_default();
        if !secrets::keys_match(presented, expected) {
            log::warn!("[MAIL_RELAY] Push rejected: bad token");
            return (
                StatusCode::FORBIDDEN,
                Json(TriggerResponse::fail("Forbidden")),
            );
        }
    }

    let envelope: PubSubPushEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            log::warn!("[MAIL_RELAY] Dropping malformed push envelope: {}", e);
            return (
                StatusCode::OK,
                Json(TriggerResponse::fail("Invalid notification payload")),
            );
        }
    };

    let raw = match decoder::unwrap_push_envelope(&envelope) {
        Ok(raw) => raw,
        Err(e) => {
            log::warn!(
                "[MAIL_RELAY] Dropping push message {}: {}",
                envelope.message.message_id,
                e
            );
            return (
                StatusCode::OK,
                Json(TriggerResponse::fail("Invalid notification payload")),
            );
        }
    };

    let report = state.relay.process(&raw).await;
    let status = if report.should_redeliver() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        if !report.is_success() {
            log::warn!(
                "[MAIL_RELAY] Acknowledging failed push message {} without redelivery",
                envelope.message.message_id
            );
        }
        StatusCode::OK
    };
    (status, Json(report.response()))
}

// =====================================================
// RPC Endpoints
// =====================================================

// GET /rpc/status
pub async fn status(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<ServiceStatus>>) {
    let watch = match state.watch.status() {
        Ok(w) => w,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(RpcResponse::err(format!("Failed to read watch state: {}", e))),
            )
        }
    };
    let cursor = match state.db.get_cursor() {
        Ok(c) => c.map(|c| c.to_string()),
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(RpcResponse::err(format!("Failed to read cursor: {}", e))),
            )
        }
    };
    let last_run = state.db.last_run().unwrap_or_else(|e| {
        log::warn!("[MAIL_RELAY] Failed to read last run: {}", e);
        None
    });
    // Only meaningful while the expired cursor is still the stored one
    let cursor_expired = match state.db.last_fetch_run() {
        Ok(Some(run)) => run.outcome == RunOutcome::CursorExpired && run.from_cursor == cursor,
        Ok(None) => false,
        Err(e) => {
            log::warn!("[MAIL_RELAY] Failed to read last fetch run: {}", e);
            false
        }
    };

    (
        StatusCode::OK,
        Json(RpcResponse::ok(ServiceStatus {
            running: true,
            uptime_secs: state.start_time.elapsed().as_secs(),
            watch,
            cursor,
            cursor_expired,
            sink: state.relay.sink_id().to_string(),
            notifiers: state.relay.notifier_names(),
            last_run,
        })),
    )
}

// GET /rpc/runs/recent
pub async fn runs_recent(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentRunsQuery>,
) -> (StatusCode, Json<RpcResponse<Vec<RelayRun>>>) {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RUNS_LIMIT)
        .clamp(1, MAX_RUNS_LIMIT);
    match state.db.recent_runs(limit) {
        Ok(runs) => (StatusCode::OK, Json(RpcResponse::ok(runs))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(format!("Failed to list runs: {}", e))),
        ),
    }
}

fn header_key(headers: &HeaderMap) -> Option<&str> {
    headers.get("x-api-key").and_then(|v| v.to_str().ok())
}

// POST /rpc/watch/start
pub async fn watch_start(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> (StatusCode, Json<RpcResponse<WatchStatus>>) {
    if !state.key_accepted(header_key(&headers)) {
        return (StatusCode::UNAUTHORIZED, Json(RpcResponse::err("Unauthorized")));
    }
    if let Err(e) = state.watch.start(None).await {
        log::error!("[MAIL_RELAY] Watch start failed: {}", e);
        return (
            StatusCode::BAD_GATEWAY,
            Json(RpcResponse::err("Failed to start watch")),
        );
    }
    watch_status_response(&state)
}

// POST /rpc/watch/stop
pub async fn watch_stop(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> (StatusCode, Json<RpcResponse<WatchStatus>>) {
    if !state.key_accepted(header_key(&headers)) {
        return (StatusCode::UNAUTHORIZED, Json(RpcResponse::err("Unauthorized")));
    }
    if let Err(e) = state.watch.stop().await {
        log::error!("[MAIL_RELAY] Watch stop failed: {}", e);
        return (
            StatusCode::BAD_GATEWAY,
            Json(RpcResponse::err("Failed to stop watch")),
        );
    }
    watch_status_response(&state)
}

fn watch_status_response(state: &AppState) -> (StatusCode, Json<RpcResponse<WatchStatus>>) {
    match state.watch.status() {
        Ok(status) => (StatusCode::OK, Json(RpcResponse::ok(status))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(format!("Failed to read watch state: {}", e))),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::cursor::Cursor;
    use crate::fetcher::ChangeFetcher;
    use crate::notifier::Notifier;
    use crate::secrets::StaticSecretStore;
    use crate::sink::SqliteSheet;
    use crate::testing::{FakeMailApi, FakeScheduler, RecordingNotifier, page};
    use base64::Engine;
    use chrono::{Duration, Utc};

    struct Harness {
        api: Arc<FakeMailApi>,
        db: Arc<Db>,
        state: Arc<AppState>,
    }

    fn harness(push_token: Option<&str>) -> Harness {
        let api = Arc::new(FakeMailApi::new());
        let db = Arc::new(Db::open(":memory:").unwrap());
        let config = RelayConfig::from_lookup(|key| match key {
            "MAIL_RELAY_TOPIC" => Some("projects/p/topics/gmail".to_string()),
            _ => None,
        })
        .unwrap();

        let relay = RelayProcessor::new(
            db.clone(),
            ChangeFetcher::new(api.clone()),
            Arc::new(SqliteSheet::new(db.clone(), &config.sheet.name)),
            &config,
        )
        .with_notifiers(vec![Arc::new(RecordingNotifier::new("telegram")) as Arc<dyn Notifier>])
        .with_run_log(db.clone());
        let watch = WatchLifecycleManager::new(
            api.clone(),
            db.clone(),
            Arc::new(FakeScheduler::new()),
            config.topic.clone(),
            config.labels.clone(),
            config.renew_margin,
        );

        let state = Arc::new(AppState {
            relay: Arc::new(relay),
            watch: Arc::new(watch),
            db: db.clone(),
            secrets: Arc::new(StaticSecretStore::from_pairs(&[(secrets::API_KEY, "sekrit")])),
            push_token: push_token.map(str::to_string),
            start_time: Instant::now(),
        });
        Harness { api, db, state }
    }

    fn trigger(api_key: &str, task: &str, data: serde_json::Value) -> Bytes {
        Bytes::from(
            serde_json::to_vec(&serde_json::json!({
                "apiKey": api_key,
                "task": task,
                "data": data,
            }))
            .unwrap(),
        )
    }

    fn push_body(notification: &serde_json::Value) -> Bytes {
        let data = base64::engine::general_purpose::STANDARD
            .encode(serde_json::to_vec(notification).unwrap());
        Bytes::from(
            serde_json::to_vec(&serde_json::json!({
                "message": {"data": data, "messageId": "42", "publishTime": "2025-10-09T08:53:20Z"},
                "subscription": "projects/p/subscriptions/relay"
            }))
            .unwrap(),
        )
    }

    fn with_key(key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", key.parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn test_exec_rejects_bad_key() {
        let h = harness(None);
        let (status, Json(resp)) = exec(
            State(h.state.clone()),
            trigger("wrong", TASK_PROCESS_NEW_EMAILS, serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(!resp.success);
        assert_eq!(h.api.listing_calls(), 0);
    }

    #[tokio::test]
    async fn test_exec_rejects_garbage_body() {
        let h = harness(None);
        let (status, Json(resp)) = exec(State(h.state.clone()), Bytes::from_static(b"not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!resp.success);
    }

    #[tokio::test]
    async fn test_exec_process_new_emails() {
        let h = harness(None);
        h.api.add_message("m1", "a@x.com", "First", 1_760_000_000_000);
        h.api.push_page(page(&[("101", "m1")], Some("115"), None));

        let (status, Json(resp)) = exec(
            State(h.state.clone()),
            trigger(
                "sekrit",
                TASK_PROCESS_NEW_EMAILS,
                serde_json::json!({"emailAddress": "user@x.com", "historyId": "100"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp, TriggerResponse::ok("Processed 1 new email"));
        assert_eq!(h.db.get_cursor().unwrap(), Some(Cursor::from("115")));
    }

    #[tokio::test]
    async fn test_exec_invalid_notification_is_generic_failure() {
        let h = harness(None);
        let (status, Json(resp)) = exec(
            State(h.state.clone()),
            trigger("sekrit", TASK_PROCESS_NEW_EMAILS, serde_json::json!({"emailAddress": "user@x.com"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp, TriggerResponse::fail("Invalid notification payload"));
    }

    #[tokio::test]
    async fn test_exec_unknown_task() {
        let h = harness(None);
        let (_, Json(resp)) = exec(
            State(h.state.clone()),
            trigger("sekrit", "launchRockets", serde_json::Value::Null),
        )
        .await;
        assert_eq!(resp, TriggerResponse::fail("Unknown task"));
    }

    #[tokio::test]
    async fn test_exec_watch_tasks() {
        let h = harness(None);
        h.api.set_watch_response("500", Utc::now() + Duration::days(7));

        let (_, Json(resp)) = exec(
            State(h.state.clone()),
            trigger("sekrit", TASK_START_WATCH, serde_json::Value::Null),
        )
        .await;
        assert!(resp.success);

        let (_, Json(resp)) = exec(
            State(h.state.clone()),
            trigger("sekrit", TASK_STATUS, serde_json::Value::Null),
        )
        .await;
        assert_eq!(resp, TriggerResponse::ok("Listening"));

        let (_, Json(resp)) = exec(
            State(h.state.clone()),
            trigger("sekrit", TASK_STOP_WATCH, serde_json::Value::Null),
        )
        .await;
        assert_eq!(resp, TriggerResponse::ok("Watch stopped"));
        assert_eq!(h.db.get_cursor().unwrap(), None);
    }

    #[tokio::test]
    async fn test_push_processes_numeric_history_id() {
        let h = harness(Some("push-token"));
        h.api.push_page(page(&[], Some("130"), None));

        let (status, Json(resp)) = pubsub_push(
            State(h.state.clone()),
            Query(PushQuery {
                token: Some("push-token".to_string()),
            }),
            push_body(&serde_json::json!({"emailAddress": "user@x.com", "historyId": 120})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(resp.success);
        assert_eq!(h.api.start_cursors_requested(), vec![Cursor::from("120")]);
        assert_eq!(h.db.get_cursor().unwrap(), Some(Cursor::from("130")));
    }

    #[tokio::test]
    async fn test_push_rejects_bad_token() {
        let h = harness(Some("push-token"));
        let (status, _) = pubsub_push(
            State(h.state.clone()),
            Query(PushQuery::default()),
            push_body(&serde_json::json!({"emailAddress": "user@x.com", "historyId": 120})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(h.api.listing_calls(), 0);
    }

    #[tokio::test]
    async fn test_push_acknowledges_poison_message() {
        let h = harness(None);
        let (status, Json(resp)) = pubsub_push(
            State(h.state.clone()),
            Query(PushQuery::default()),
            push_body(&serde_json::json!({"historyId": 120})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!resp.success);

        let (status, _) = pubsub_push(
            State(h.state.clone()),
            Query(PushQuery::default()),
            Bytes::from_static(b"{\"message\":{\"data\":\"%%%\"}}"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(h.api.listing_calls(), 0);
    }

    #[tokio::test]
    async fn test_push_asks_for_redelivery_on_listing_failure() {
        let h = harness(None);
        h.api.fail_listing_after(0);
        let (status, Json(resp)) = pubsub_push(
            State(h.state.clone()),
            Query(PushQuery::default()),
            push_body(&serde_json::json!({"emailAddress": "user@x.com", "historyId": "120"})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.message, "Failed to fetch mailbox changes");
        assert_eq!(h.db.get_cursor().unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_cursor_is_acknowledged_and_reported_until_restart() {
        let h = harness(None);
        h.db.set_cursor(&Cursor::from("100")).unwrap();
        h.api.expire_history();

        let (status, Json(resp)) = pubsub_push(
            State(h.state.clone()),
            Query(PushQuery::default()),
            push_body(&serde_json::json!({"emailAddress": "user@x.com", "historyId": 5000})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!resp.success);
        assert_eq!(h.db.get_cursor().unwrap(), Some(Cursor::from("100")));

        let (_, Json(resp)) = super::status(State(h.state.clone())).await;
        let data = resp.data.unwrap();
        assert!(data.cursor_expired);
        assert_eq!(data.last_run.unwrap().outcome, RunOutcome::CursorExpired);

        // stop + start replaces the cursor, which clears the flag
        h.api.set_watch_response("9000", Utc::now() + Duration::days(7));
        let (status, _) = watch_stop(State(h.state.clone()), with_key("sekrit")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = watch_start(State(h.state.clone()), with_key("sekrit")).await;
        assert_eq!(status, StatusCode::OK);

        let (_, Json(resp)) = super::status(State(h.state.clone())).await;
        let data = resp.data.unwrap();
        assert_eq!(data.cursor.as_deref(), Some("9000"));
        assert!(!data.cursor_expired);
    }

    #[tokio::test]
    async fn test_status_and_runs() {
        let h = harness(None);
        h.api.push_page(page(&[], Some("130"), None));
        h.state
            .relay
            .process(br#"{"emailAddress":"user@x.com","historyId":"120"}"#)
            .await;

        let (status, Json(resp)) = super::status(State(h.state.clone())).await;
        assert_eq!(status, StatusCode::OK);
        let data = resp.data.unwrap();
        assert_eq!(data.cursor.as_deref(), Some("130"));
        assert_eq!(data.sink, "Emails");
        assert_eq!(data.notifiers, vec!["telegram".to_string()]);
        assert!(!data.watch.listening);
        assert!(!data.cursor_expired);
        assert_eq!(data.last_run.unwrap().outcome, RunOutcome::Completed);

        let (_, Json(resp)) = runs_recent(
            State(h.state.clone()),
            Query(RecentRunsQuery { limit: Some(0) }),
        )
        .await;
        assert_eq!(resp.data.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_watch_rpc_requires_key() {
        let h = harness(None);
        h.api.set_watch_response("500", Utc::now() + Duration::days(7));

        let (status, _) = watch_start(State(h.state.clone()), HeaderMap::new()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(h.api.watch_calls().is_empty());

        let (status, Json(resp)) = watch_start(State(h.state.clone()), with_key("sekrit")).await;
        assert_eq!(status, StatusCode::OK);
        let watch = resp.data.unwrap();
        assert!(watch.listening);
        assert!(watch.renewal_task_id.is_some());

        let (status, Json(resp)) = watch_stop(State(h.state.clone()), with_key("sekrit")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!resp.data.unwrap().listening);
    }
}
