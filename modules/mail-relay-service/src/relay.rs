//! The relay run: one notification in, at most one sink append, best-effort
//! chat notifications and exactly one cursor update out.
//!
//! The cursor is written last. A run that dies before that point (error,
//! timeout, crash) leaves the cursor where it was and the next delivery
//! covers the same range again. That may append duplicate rows after a
//! failure between the sink write and the cursor update, but never skips
//! a message.

use crate::config::{RelayConfig, SheetConfig};
use crate::cursor::{Cursor, CursorStore};
use crate::db::{Db, RunRecord};
use crate::decoder;
use crate::error::{RelayError, WriteError};
use crate::fetcher::ChangeFetcher;
use crate::gmail::MailRecord;
use crate::layout::{LayoutCache, LayoutMap};
use crate::notifier::{Notifier, fan_out};
use crate::sink::{Sink, SinkAppender};
use chrono::{DateTime, Utc};
use mail_relay_types::{RunOutcome, TriggerResponse};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayStage {
    #[default]
    Idle,
    Decoding,
    ResolvingCursor,
    Fetching,
    Projecting,
    Writing,
    Notifying,
    Advancing,
    Aborted,
}

impl RelayStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayStage::Idle => "idle",
            RelayStage::Decoding => "decoding",
            RelayStage::ResolvingCursor => "resolving_cursor",
            RelayStage::Fetching => "fetching",
            RelayStage::Projecting => "projecting",
            RelayStage::Writing => "writing",
            RelayStage::Notifying => "notifying",
            RelayStage::Advancing => "advancing",
            RelayStage::Aborted => "aborted",
        }
    }
}

impl fmt::Display for RelayStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a run did, filled in as it progresses
#[derive(Debug, Clone, Default)]
pub struct RunTrace {
    /// Last stage entered; `Idle` after a completed run, `Aborted` after a failed one
    pub stage: RelayStage,
    pub origin: Option<String>,
    pub from_cursor: Option<Cursor>,
    /// Cursor stored at the end of the run, or the fetched one if the run aborted after fetching
    pub new_cursor: Option<Cursor>,
    pub records: usize,
    pub skipped: usize,
    /// Resolved messages outside the configured labels
    pub filtered: usize,
    pub pages: usize,
    pub rows_written: usize,
    pub first_row: Option<u32>,
    pub notified: usize,
}

/// Why and where a run stopped
#[derive(Debug)]
pub struct RelayAbort {
    pub stage: RelayStage,
    pub error: RelayError,
}

impl fmt::Display for RelayAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "aborted while {}: {}", self.stage, self.error)
    }
}

#[derive(Debug)]
pub struct RelayReport {
    pub trace: RunTrace,
    pub abort: Option<RelayAbort>,
}

impl RelayReport {
    pub fn is_success(&self) -> bool {
        self.abort.is_none()
    }

    /// Whether the transport should redeliver the notification
    pub fn should_redeliver(&self) -> bool {
        self.abort
            .as_ref()
            .map(|a| a.error.is_transient())
            .unwrap_or(false)
    }

    /// Caller-facing result. Internal error text stays in the log.
    pub fn response(&self) -> TriggerResponse {
        match &self.abort {
            None if self.trace.records == 0 => TriggerResponse::ok("No new emails"),
            None => TriggerResponse::ok(format!(
                "Processed {} new email{}",
                self.trace.records,
                if self.trace.records == 1 { "" } else { "s" }
            )),
            Some(abort) => TriggerResponse::fail(abort.error.public_message()),
        }
    }
}

pub struct RelayProcessor {
    store: Arc<dyn CursorStore>,
    fetcher: ChangeFetcher,
    sink: Arc<dyn Sink>,
    appender: SinkAppender,
    layouts: LayoutCache,
    sheet: SheetConfig,
    notifiers: Vec<Arc<dyn Notifier>>,
    notify_header: String,
    run_timeout: Duration,
    run_log: Option<Arc<Db>>,
}

impl RelayProcessor {
    pub fn new(
        store: Arc<dyn CursorStore>,
        fetcher: ChangeFetcher,
        sink: Arc<dyn Sink>,
        config: &RelayConfig,
    ) -> Self {
        Self {
            store,
            fetcher,
            sink,
            appender: SinkAppender::new(),
            layouts: LayoutCache::new(),
            sheet: config.sheet.clone(),
            notifiers: Vec::new(),
            notify_header: config.notify_header.clone(),
            run_timeout: config.run_timeout,
            run_log: None,
        }
    }

    pub fn with_notifiers(mut self, notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        self.notifiers = notifiers;
        self
    }

    /// Record every run in the `relay_runs` table
    pub fn with_run_log(mut self, db: Arc<Db>) -> Self {
        self.run_log = Some(db);
        self
    }

    pub fn sink_id(&self) -> &str {
        self.sink.id()
    }

    pub fn notifier_names(&self) -> Vec<String> {
        self.notifiers.iter().map(|n| n.name().to_string()).collect()
    }

    /// Run one notification to completion. Never panics or returns an error;
    /// failures are reported in the [`RelayReport`].
    pub async fn process(&self, raw: &[u8]) -> RelayReport {
        let started_at = Utc::now();
        let mut trace = RunTrace::default();

        let result = match tokio::time::timeout(self.run_timeout, self.run(raw, &mut trace)).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::TimedOut(self.run_timeout.as_secs())),
        };

        let abort = match result {
            Ok(()) => {
                trace.stage = RelayStage::Idle;
                log::info!(
                    "[MAIL_RELAY] Run for {} complete: {} records ({} skipped, {} filtered) from {} pages, {} rows, {} notified, cursor {}",
                    trace.origin.as_deref().unwrap_or("-"),
                    trace.records,
                    trace.skipped,
                    trace.filtered,
                    trace.pages,
                    trace.rows_written,
                    trace.notified,
                    display_cursor(&trace.new_cursor)
                );
                None
            }
            Err(error) => {
                let abort = RelayAbort {
                    stage: trace.stage,
                    error,
                };
                trace.stage = RelayStage::Aborted;
                match &abort.error {
                    RelayError::Decode(_) => log::warn!("[MAIL_RELAY] Rejected notification: {}", abort),
                    e if e.is_cursor_expired() => log::error!(
                        "[MAIL_RELAY] Run for {} {}; stop and start the watch to resync from a fresh cursor",
                        trace.origin.as_deref().unwrap_or("-"),
                        abort
                    ),
                    _ => log::error!(
                        "[MAIL_RELAY] Run for {} {}; cursor left at {}",
                        trace.origin.as_deref().unwrap_or("-"),
                        abort,
                        display_cursor(&trace.from_cursor)
                    ),
                }
                Some(abort)
            }
        };

        let report = RelayReport { trace, abort };
        self.record_run(&report, started_at);
        report
    }

    async fn run(&self, raw: &[u8], trace: &mut RunTrace) -> Result<(), RelayError> {
        trace.stage = RelayStage::Decoding;
        let notification = decoder::decode(raw)?;
        trace.origin = Some(notification.origin_identity.clone());

        // Our own last position beats whatever the notification claims
        trace.stage = RelayStage::ResolvingCursor;
        let from = match self.store.get_cursor()? {
            Some(persisted) => persisted,
            None => notification.cursor,
        };
        trace.from_cursor = Some(from.clone());

        trace.stage = RelayStage::Fetching;
        let fetched = self.fetcher.fetch(&from).await?;
        trace.records = fetched.records.len();
        trace.skipped = fetched.skipped;
        trace.filtered = fetched.filtered;
        trace.pages = fetched.pages;
        trace.new_cursor = Some(fetched.new_cursor.clone());

        if !fetched.records.is_empty() {
            trace.stage = RelayStage::Projecting;
            let layout = self
                .layouts
                .get_or_build(&self.sheet)
                .map_err(WriteError::Layout)?;
            let rows = fetched
                .records
                .iter()
                .map(|record| project(&layout, record))
                .collect::<Result<Vec<_>, _>>()
                .map_err(WriteError::Layout)?;

            trace.stage = RelayStage::Writing;
            let first_row = match self.appender.append(self.sink.as_ref(), &rows).await {
                Ok(first_row) => first_row,
                Err(e) => {
                    log::error!(
                        "[MAIL_RELAY] Sink {} rejected {} rows for cursor range {}..{}; \
                         a partial write may need manual reconciliation: {}",
                        self.sink.id(),
                        rows.len(),
                        from,
                        fetched.new_cursor,
                        e
                    );
                    return Err(e.into());
                }
            };
            trace.first_row = Some(first_row);
            trace.rows_written = rows.len();

            trace.stage = RelayStage::Notifying;
            if !self.notifiers.is_empty() {
                let text = format_digest(&self.notify_header, &fetched.records);
                trace.notified = fan_out(&self.notifiers, &text).await;
            }
        }

        trace.stage = RelayStage::Advancing;
        let stored = self.store.set_cursor(&fetched.new_cursor)?;
        if stored != fetched.new_cursor {
            log::info!(
                "[MAIL_RELAY] Cursor already at {}; not moving back to {}",
                stored,
                fetched.new_cursor
            );
        }
        trace.new_cursor = Some(stored);
        Ok(())
    }

    fn record_run(&self, report: &RelayReport, started_at: DateTime<Utc>) {
        let Some(db) = &self.run_log else {
            return;
        };
        let trace = &report.trace;
        let (outcome, stage, message) = match &report.abort {
            None => (RunOutcome::Completed, None, report.response().message),
            Some(abort) => (
                if abort.error.is_cursor_expired() {
                    RunOutcome::CursorExpired
                } else {
                    RunOutcome::Aborted
                },
                Some(abort.stage.as_str().to_string()),
                abort.error.to_string(),
            ),
        };
        let run = RunRecord {
            origin: trace.origin.clone(),
            from_cursor: trace.from_cursor.as_ref().map(|c| c.to_string()),
            new_cursor: trace.new_cursor.as_ref().map(|c| c.to_string()),
            records: trace.records as i64,
            rows_written: trace.rows_written as i64,
            outcome,
            stage,
            message,
            started_at,
        };
        if let Err(e) = db.insert_run(&run) {
            log::warn!("[MAIL_RELAY] Failed to record run: {}", e);
        }
    }
}

fn display_cursor(cursor: &Option<Cursor>) -> String {
    cursor
        .as_ref()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Receipt time as shown in the sheet, falling back to the raw Date header
fn timestamp_of(record: &MailRecord) -> String {
    match record.received_at {
        Some(at) => at.format(TIMESTAMP_FORMAT).to_string(),
        None => record.date_header.clone().unwrap_or_default(),
    }
}

/// Map a record onto the sheet layout. Fields the layout has no column for are dropped.
pub fn project(layout: &LayoutMap, record: &MailRecord) -> Result<Vec<String>, crate::error::ConfigError> {
    let fields = [
        ("timestamp", timestamp_of(record)),
        ("from", record.from.clone()),
        ("to", record.to.clone()),
        ("subject", record.subject.clone()),
        ("snippet", record.snippet.clone()),
        ("message_id", record.message_id.clone()),
        ("thread_id", record.thread_id.clone()),
    ];
    let placed: Vec<(&str, String)> = fields
        .into_iter()
        .filter(|(name, _)| layout.column(name).is_some())
        .collect();
    layout.place(&placed)
}

/// One aggregated chat message for a batch of records
pub fn format_digest(header: &str, records: &[MailRecord]) -> String {
    let mut text = format!("{} ({})", header, records.len());
    for record in records {
        text.push('\n');
        text.push_str(&format!(
            "• {} | {} | {}",
            timestamp_of(record),
            record.from,
            if record.subject.is_empty() { "(no subject)" } else { record.subject.as_str() }
        ));
    }
    text
}
