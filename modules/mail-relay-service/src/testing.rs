//! In-process fakes for the relay's collaborators.

use crate::cursor::{Cursor, CursorStore, SubscriptionState};
use crate::db::Db;
use crate::error::{ApiError, NotifyError, ScheduleError, StorageError, WriteError};
use crate::gmail::{
    GmailHeader, GmailMessage, GmailMessagePayload, HistoryPage, HistoryRecord, MailApi,
    MessageAdded, MessageRef, WatchResponse,
};
use crate::notifier::Notifier;
use crate::scheduler::{ScheduledTask, Scheduler};
use crate::sink::Sink;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Build a history page from (history id, message id) pairs
pub fn page(
    entries: &[(&str, &str)],
    history_id: Option<&str>,
    next_page_token: Option<&str>,
) -> HistoryPage {
    let history = entries
        .iter()
        .map(|(id, message_id)| HistoryRecord {
            id: id.to_string(),
            messages_added: Some(vec![MessageAdded {
                message: MessageRef {
                    id: message_id.to_string(),
                },
            }]),
        })
        .collect();
    HistoryPage {
        history: Some(history),
        history_id: history_id.map(str::to_string),
        next_page_token: next_page_token.map(str::to_string),
    }
}

// =====================================================
// Mail API
// =====================================================

/// Scripted mailbox. Pages are served in push order; once they run out the
/// listing returns an empty page with no history id.
#[derive(Default)]
pub struct FakeMailApi {
    pages: Mutex<VecDeque<HistoryPage>>,
    messages: Mutex<HashMap<String, GmailMessage>>,
    listing_calls: AtomicUsize,
    fail_listing_after: Mutex<Option<usize>>,
    history_expired: AtomicBool,
    page_tokens: Mutex<Vec<Option<String>>>,
    start_cursors: Mutex<Vec<Cursor>>,
    message_calls: AtomicUsize,
    watch_response: Mutex<Option<WatchResponse>>,
    watch_calls: Mutex<Vec<(String, Vec<String>)>>,
    stop_calls: AtomicUsize,
    fail_stop: AtomicBool,
}

impl FakeMailApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_page(&self, page: HistoryPage) {
        self.pages.lock().push_back(page);
    }

    pub fn add_message(&self, id: &str, from: &str, subject: &str, internal_ms: i64) {
        self.add_labeled_message(id, from, subject, internal_ms, &["INBOX"]);
    }

    pub fn add_labeled_message(
        &self,
        id: &str,
        from: &str,
        subject: &str,
        internal_ms: i64,
        labels: &[&str],
    ) {
        let header = |name: &str, value: &str| GmailHeader {
            name: name.to_string(),
            value: value.to_string(),
        };
        let message = GmailMessage {
            id: id.to_string(),
            thread_id: format!("t-{}", id),
            label_ids: Some(labels.iter().map(|l| l.to_string()).collect()),
            snippet: Some(format!("snippet of {}", subject)),
            payload: Some(GmailMessagePayload {
                headers: Some(vec![header("From", from), header("Subject", subject)]),
                parts: None,
                body: None,
                mime_type: Some("text/plain".to_string()),
            }),
            internal_date: Some(internal_ms.to_string()),
        };
        self.messages.lock().insert(id.to_string(), message);
    }

    /// Let `n` listing calls succeed, then fail every later one
    pub fn fail_listing_after(&self, n: usize) {
        *self.fail_listing_after.lock() = Some(n);
    }

    /// Answer every listing with 404, as Gmail does for a start id past retention
    pub fn expire_history(&self) {
        self.history_expired.store(true, Ordering::SeqCst);
    }

    pub fn listing_calls(&self) -> usize {
        self.listing_calls.load(Ordering::SeqCst)
    }

    pub fn page_tokens_requested(&self) -> Vec<Option<String>> {
        self.page_tokens.lock().clone()
    }

    pub fn start_cursors_requested(&self) -> Vec<Cursor> {
        self.start_cursors.lock().clone()
    }

    pub fn messages_requested(&self) -> usize {
        self.message_calls.load(Ordering::SeqCst)
    }

    pub fn set_watch_response(&self, history_id: &str, expires_at: DateTime<Utc>) {
        *self.watch_response.lock() = Some(WatchResponse {
            history_id: history_id.to_string(),
            expiration: expires_at.timestamp_millis().to_string(),
        });
    }

    pub fn set_raw_watch_response(&self, history_id: &str, expiration: &str) {
        *self.watch_response.lock() = Some(WatchResponse {
            history_id: history_id.to_string(),
            expiration: expiration.to_string(),
        });
    }

    pub fn watch_calls(&self) -> Vec<(String, Vec<String>)> {
        self.watch_calls.lock().clone()
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn fail_stop(&self) {
        self.fail_stop.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MailApi for FakeMailApi {
    async fn list_history(
        &self,
        start: &Cursor,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, ApiError> {
        let call = self.listing_calls.fetch_add(1, Ordering::SeqCst);
        self.page_tokens.lock().push(page_token.map(str::to_string));
        self.start_cursors.lock().push(start.clone());

        if self.history_expired.load(Ordering::SeqCst) {
            return Err(ApiError::with_status("Requested entity was not found.", 404));
        }
        if let Some(limit) = *self.fail_listing_after.lock() {
            if call >= limit {
                return Err(ApiError::with_status("backend unavailable", 503));
            }
        }
        Ok(self.pages.lock().pop_front().unwrap_or_default())
    }

    async fn get_message(&self, message_id: &str) -> Result<GmailMessage, ApiError> {
        self.message_calls.fetch_add(1, Ordering::SeqCst);
        self.messages
            .lock()
            .get(message_id)
            .cloned()
            .ok_or_else(|| ApiError::with_status("Requested entity was not found.", 404))
    }

    async fn watch(&self, topic_name: &str, label_ids: &[String]) -> Result<WatchResponse, ApiError> {
        self.watch_calls
            .lock()
            .push((topic_name.to_string(), label_ids.to_vec()));
        self.watch_response
            .lock()
            .clone()
            .ok_or_else(|| ApiError::with_status("topic not found", 404))
    }

    async fn stop(&self) -> Result<(), ApiError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(ApiError::with_status("internal", 500));
        }
        Ok(())
    }
}

// =====================================================
// Cursor Store
// =====================================================

/// SQLite store that counts cursor reads and can be told to fail them or
/// to report a stale cursor
pub struct CountingStore {
    inner: Db,
    cursor_reads: AtomicUsize,
    fail_reads: AtomicBool,
    stale_read: Mutex<Option<Cursor>>,
}

impl CountingStore {
    pub fn new() -> Self {
        Self {
            inner: Db::open(":memory:").unwrap(),
            cursor_reads: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
            stale_read: Mutex::new(None),
        }
    }

    pub fn cursor_reads(&self) -> usize {
        self.cursor_reads.load(Ordering::SeqCst)
    }

    pub fn fail_reads(&self) {
        self.fail_reads.store(true, Ordering::SeqCst);
    }

    /// Answer cursor reads with `cursor`, as a run that read before a
    /// concurrent run advanced the store would see
    pub fn read_stale(&self, cursor: &str) {
        *self.stale_read.lock() = Some(Cursor::from(cursor));
    }

    /// What is really stored, bypassing any stale answer
    pub fn inner_cursor(&self) -> Option<Cursor> {
        self.inner.get_cursor().unwrap()
    }
}

impl CursorStore for CountingStore {
    fn get_cursor(&self) -> Result<Option<Cursor>, StorageError> {
        self.cursor_reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Corrupt {
                key: "history_cursor".to_string(),
                value: "<unreadable>".to_string(),
            });
        }
        if let Some(stale) = self.stale_read.lock().clone() {
            return Ok(Some(stale));
        }
        self.inner.get_cursor()
    }

    fn set_cursor(&self, cursor: &Cursor) -> Result<Cursor, StorageError> {
        self.inner.set_cursor(cursor)
    }

    fn clear_cursor(&self) -> Result<(), StorageError> {
        self.inner.clear_cursor()
    }

    fn get_listening(&self) -> Result<bool, StorageError> {
        self.inner.get_listening()
    }

    fn set_listening(&self, listening: bool) -> Result<(), StorageError> {
        self.inner.set_listening(listening)
    }

    fn get_subscription(&self) -> Result<SubscriptionState, StorageError> {
        self.inner.get_subscription()
    }

    fn set_subscription(&self, state: &SubscriptionState) -> Result<(), StorageError> {
        self.inner.set_subscription(state)
    }
}

// =====================================================
// Notifier
// =====================================================

pub struct RecordingNotifier {
    name: String,
    fail: bool,
    sent: Mutex<Vec<String>>,
    attempts: AtomicUsize,
}

impl RecordingNotifier {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fail: false,
            sent: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(name)
        }
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(NotifyError {
                target: self.name.clone(),
                source: ApiError::with_status("chat not found", 400),
            });
        }
        self.sent.lock().push(text.to_string());
        Ok(())
    }
}

// =====================================================
// Scheduler
// =====================================================

/// Scheduler that only records what it is asked to do
#[derive(Default)]
pub struct FakeScheduler {
    live: Mutex<HashSet<String>>,
    scheduled: Mutex<Vec<(DateTime<Utc>, String, ScheduledTask)>>,
    cancelled: Mutex<Vec<String>>,
}

impl FakeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend an entry already exists, as if left by an earlier schedule
    pub fn seed(&self, task_id: &str) {
        self.live.lock().insert(task_id.to_string());
    }

    pub fn scheduled(&self) -> Vec<(DateTime<Utc>, String, ScheduledTask)> {
        self.scheduled.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }

    pub fn live(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.live.lock().iter().cloned().collect();
        ids.sort();
        ids
    }
}

impl Scheduler for FakeScheduler {
    fn schedule_at(
        &self,
        run_at: DateTime<Utc>,
        task_id: &str,
        task: ScheduledTask,
    ) -> Result<(), ScheduleError> {
        self.live.lock().insert(task_id.to_string());
        self.scheduled
            .lock()
            .push((run_at, task_id.to_string(), task));
        Ok(())
    }

    fn cancel(&self, task_id: &str) -> Result<bool, ScheduleError> {
        self.cancelled.lock().push(task_id.to_string());
        Ok(self.live.lock().remove(task_id))
    }
}

// =====================================================
// Sink
// =====================================================

/// Sink whose writes always fail upstream
#[derive(Default)]
pub struct FailingSink {
    writes: AtomicUsize,
}

impl FailingSink {
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for FailingSink {
    fn id(&self) -> &str {
        "failing"
    }

    async fn last_row(&self) -> Result<u32, WriteError> {
        Ok(0)
    }

    async fn write_rows(&self, _start_row: u32, _rows: &[Vec<String>]) -> Result<(), WriteError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(WriteError::Api(ApiError::with_status("quota exceeded", 429)))
    }
}
