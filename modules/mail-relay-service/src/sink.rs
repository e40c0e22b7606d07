//! Tabular destinations for projected rows.
//!
//! A sink only knows how long it is and how to write a block of rows at a
//! position. Appending is "read the last row, write below it", which is not
//! atomic, so every append to the same sink goes through [`SinkAppender`].

use crate::db::Db;
use crate::error::{ApiError, WriteError};
use crate::google_auth::GoogleAuth;
use crate::http::truncate_error;
use crate::layout::{column_index, column_letters};
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::{Client, Url};
use serde_json::json;
use std::sync::Arc;

const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";

#[async_trait]
pub trait Sink: Send + Sync {
    /// Identity used to serialize appends
    fn id(&self) -> &str;

    /// 1-based index of the last row holding data, 0 when empty
    async fn last_row(&self) -> Result<u32, WriteError>;

    /// Write `rows` as a contiguous block starting at `start_row`
    async fn write_rows(&self, start_row: u32, rows: &[Vec<String>]) -> Result<(), WriteError>;
}

/// Serializes appends per sink identity
#[derive(Default)]
pub struct SinkAppender {
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl SinkAppender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append rows after the sink's current last row; returns the first row written.
    ///
    /// The per-sink lock is held across both upstream calls.
    pub async fn append(&self, sink: &dyn Sink, rows: &[Vec<String>]) -> Result<u32, WriteError> {
        let lock = self
            .locks
            .entry(sink.id().to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        let start_row = sink.last_row().await? + 1;
        if !rows.is_empty() {
            sink.write_rows(start_row, rows).await?;
        }
        Ok(start_row)
    }
}

// =====================================================
// Local SQLite Sheet
// =====================================================

/// Sheet stored in the service database
pub struct SqliteSheet {
    db: Arc<Db>,
    name: String,
}

impl SqliteSheet {
    pub fn new(db: Arc<Db>, name: &str) -> Self {
        Self {
            db,
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Sink for SqliteSheet {
    fn id(&self) -> &str {
        &self.name
    }

    async fn last_row(&self) -> Result<u32, WriteError> {
        Ok(self.db.sheet_last_row(&self.name)?)
    }

    async fn write_rows(&self, start_row: u32, rows: &[Vec<String>]) -> Result<(), WriteError> {
        Ok(self.db.sheet_write_rows(&self.name, start_row, rows)?)
    }
}

// =====================================================
// Google Sheets
// =====================================================

/// Sheet in a Google spreadsheet, written through the Sheets v4 values API
pub struct GoogleSheet {
    http: Client,
    auth: Arc<GoogleAuth>,
    spreadsheet_id: String,
    sheet_name: String,
    /// Rightmost layout column; rows are written from column A up to it
    last_column: String,
    id: String,
}

/// Body of a values `GET`. Trailing empty rows are omitted upstream; empty
/// rows before the last filled one come back as empty arrays.
#[derive(Debug, Default, serde::Deserialize)]
struct ValueRange {
    values: Option<Vec<Vec<serde_json::Value>>>,
}

impl ValueRange {
    /// Last row with any non-empty cell, counting from row 1
    fn last_row(&self) -> u32 {
        self.values.as_ref().map(|v| v.len() as u32).unwrap_or(0)
    }
}

impl GoogleSheet {
    pub fn new(
        http: Client,
        auth: Arc<GoogleAuth>,
        spreadsheet_id: &str,
        sheet_name: &str,
        last_column: &str,
    ) -> Result<Self, WriteError> {
        column_index(last_column)?;
        Ok(Self {
            http,
            auth,
            spreadsheet_id: spreadsheet_id.to_string(),
            sheet_name: sheet_name.to_string(),
            last_column: last_column.trim().to_ascii_uppercase(),
            id: format!("{}/{}", spreadsheet_id, sheet_name),
        })
    }

    fn quoted_sheet(&self) -> String {
        format!("'{}'", self.sheet_name.replace('\'', "''"))
    }

    /// Every layout column, so a row counts as filled if any of its cells is
    fn length_range(&self) -> String {
        format!("{}!A1:{}", self.quoted_sheet(), self.last_column)
    }

    fn values_url(&self, range: &str) -> Result<Url, ApiError> {
        let mut url = Url::parse(SHEETS_API_BASE)
            .map_err(|e| ApiError::new(format!("Invalid Sheets base url: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| ApiError::new("Sheets base url cannot carry a path"))?
            .push(&self.spreadsheet_id)
            .push("values")
            .push(range);
        Ok(url)
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response, ApiError> {
        let token = self.auth.access_token().await?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ApiError::new(format!("Failed to {}: {}", what, e)))?;
        let status = response.status();
        if !status.is_success() {
            let error = response.text().await.unwrap_or_default();
            let error = ApiError::with_status(
                format!("Sheets API error while trying to {}: {}", what, truncate_error(&error)),
                status.as_u16(),
            );
            if error.is_unauthorized() {
                self.auth.invalidate();
            }
            return Err(error);
        }
        Ok(response)
    }
}

/// Range covering `rows` written at `start_row`, e.g. `'Emails'!A5:C6`
pub fn block_range(sheet: &str, start_row: u32, rows: &[Vec<String>]) -> String {
    let width = rows.iter().map(|r| r.len()).max().unwrap_or(1).max(1) as u32;
    let end_row = start_row + rows.len().max(1) as u32 - 1;
    format!(
        "{}!A{}:{}{}",
        sheet,
        start_row,
        column_letters(width),
        end_row
    )
}

#[async_trait]
impl Sink for GoogleSheet {
    fn id(&self) -> &str {
        &self.id
    }

    async fn last_row(&self) -> Result<u32, WriteError> {
        let url = self.values_url(&self.length_range())?;
        let request = self
            .http
            .get(url)
            .query(&[("majorDimension", "ROWS")]);
        let response = self.send(request, "read sheet length").await?;

        let body: ValueRange = response
            .json()
            .await
            .map_err(|e| ApiError::new(format!("Failed to parse sheet values: {}", e)))?;
        Ok(body.last_row())
    }

    async fn write_rows(&self, start_row: u32, rows: &[Vec<String>]) -> Result<(), WriteError> {
        let range = block_range(&self.quoted_sheet(), start_row, rows);
        let url = self.values_url(&range)?;
        let body = json!({
            "range": range,
            "majorDimension": "ROWS",
            "values": rows,
        });
        let request = self
            .http
            .put(url)
            .query(&[("valueInputOption", "USER_ENTERED")])
            .json(&body);
        self.send(request, "write rows").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn row(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_block_range() {
        let rows = vec![row(&["a", "b", "c"]), row(&["d", "e", "f"])];
        assert_eq!(block_range("'Emails'", 5, &rows), "'Emails'!A5:C6");
        let wide = vec![vec![String::new(); 27]];
        assert_eq!(block_range("S", 1, &wide), "S!A1:AA1");
    }

    #[test]
    fn test_google_sheet_url_encoding() {
        let auth = Arc::new(GoogleAuth::new(Client::new(), Some("t".to_string()), None));
        let sheet = GoogleSheet::new(Client::new(), auth, "sheet-id", "My Emails", "a").unwrap();
        assert_eq!(sheet.id(), "sheet-id/My Emails");
        let url = sheet.values_url("'My Emails'!A:A").unwrap();
        assert!(url.as_str().starts_with(
            "https://sheets.googleapis.com/v4/spreadsheets/sheet-id/values/"
        ));
        assert!(!url.as_str().contains(' '));
    }

    #[test]
    fn test_google_sheet_rejects_bad_last_column() {
        let auth = Arc::new(GoogleAuth::new(Client::new(), Some("t".to_string()), None));
        assert!(GoogleSheet::new(Client::new(), auth, "id", "S", "1").is_err());
    }

    #[test]
    fn test_length_range_spans_layout_width() {
        let auth = Arc::new(GoogleAuth::new(Client::new(), Some("t".to_string()), None));
        let sheet = GoogleSheet::new(Client::new(), auth, "id", "Emails", "c").unwrap();
        assert_eq!(sheet.length_range(), "'Emails'!A1:C");
    }

    #[test]
    fn test_row_with_blank_first_cell_counts_toward_length() {
        // Row 5 was written as ["", "a@x.com", ""]; row 3 is empty
        let body: ValueRange = serde_json::from_value(json!({
            "range": "'Emails'!A1:C1000",
            "majorDimension": "ROWS",
            "values": [
                ["t1", "a", "s1"],
                ["t2", "b", "s2"],
                [],
                ["t4", "d", "s4"],
                ["", "a@x.com"]
            ]
        }))
        .unwrap();
        assert_eq!(body.last_row(), 5);

        // The next block starts below it instead of overwriting row 5
        let next = vec![row(&["t6", "e", "s6"])];
        assert_eq!(block_range("'Emails'", body.last_row() + 1, &next), "'Emails'!A6:C6");

        let empty: ValueRange = serde_json::from_value(json!({"range": "'Emails'!A1:C1000"})).unwrap();
        assert_eq!(empty.last_row(), 0);
    }

    #[tokio::test]
    async fn test_sqlite_sheet_appends_below_existing_rows() {
        let db = Arc::new(Db::open(":memory:").unwrap());
        let sheet = SqliteSheet::new(db.clone(), "Emails");
        let appender = SinkAppender::new();

        let first = appender
            .append(&sheet, &[row(&["t1", "a", "s1"]), row(&["t2", "b", "s2"])])
            .await
            .unwrap();
        let second = appender.append(&sheet, &[row(&["t3", "c", "s3"])]).await.unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 3);
        assert_eq!(db.sheet_rows("Emails").unwrap().len(), 3);
    }

    /// Sink that yields between reading its length and writing, widening the race window
    struct SlowSink {
        db: Arc<Db>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl Sink for SlowSink {
        fn id(&self) -> &str {
            "slow"
        }

        async fn last_row(&self) -> Result<u32, WriteError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let last = self.db.sheet_last_row("slow")?;
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(last)
        }

        async fn write_rows(&self, start_row: u32, rows: &[Vec<String>]) -> Result<(), WriteError> {
            self.db.sheet_write_rows("slow", start_row, rows)?;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_do_not_clobber() {
        let db = Arc::new(Db::open(":memory:").unwrap());
        let sink = Arc::new(SlowSink {
            db: db.clone(),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        let appender = Arc::new(SinkAppender::new());

        let mut handles = Vec::new();
        for i in 0..5 {
            let sink = sink.clone();
            let appender = appender.clone();
            handles.push(tokio::spawn(async move {
                let rows = vec![
                    row(&[format!("run{}-a", i).as_str()]),
                    row(&[format!("run{}-b", i).as_str()]),
                ];
                appender.append(sink.as_ref(), &rows).await.unwrap()
            }));
        }
        let mut starts = Vec::new();
        for handle in handles {
            starts.push(handle.await.unwrap());
        }
        starts.sort();

        assert_eq!(starts, vec![1, 3, 5, 7, 9]);
        assert_eq!(db.sheet_rows("slow").unwrap().len(), 10);
        assert_eq!(sink.max_in_flight.load(Ordering::SeqCst), 1);
    }
}
