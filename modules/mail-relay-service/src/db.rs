//! SQLite database operations for the mail relay service.

use crate::cursor::{Cursor, CursorStore, SubscriptionState};
use crate::error::StorageError;
use chrono::{DateTime, Utc};
use mail_relay_types::{RelayRun, RunOutcome};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};

const KEY_CURSOR: &str = "history_cursor";
const KEY_LISTENING: &str = "listening";
const KEY_SUBSCRIPTION_ACTIVE: &str = "subscription_active";
const KEY_RENEWAL_DEADLINE: &str = "renewal_deadline";
const KEY_RENEWAL_TASK: &str = "renewal_task_id";

pub struct Db {
    conn: Mutex<Connection>,
}

/// A one-shot task waiting in the schedule table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTask {
    pub task_id: String,
    pub run_at: DateTime<Utc>,
    pub payload: String,
}

/// Fields of a finished relay run, as written to the run log
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub origin: Option<String>,
    pub from_cursor: Option<String>,
    pub new_cursor: Option<String>,
    pub records: i64,
    pub rows_written: i64,
    pub outcome: RunOutcome,
    pub stage: Option<String>,
    pub message: String,
    pub started_at: DateTime<Utc>,
}

impl Db {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.create_tables()?;
        Ok(db)
    }

    fn create_tables(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS relay_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS scheduled_tasks (
                task_id TEXT PRIMARY KEY,
                run_at TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sheet_cells (
                sheet TEXT NOT NULL,
                row_index INTEGER NOT NULL,
                col_index INTEGER NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (sheet, row_index, col_index)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS relay_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                origin TEXT,
                from_cursor TEXT,
                new_cursor TEXT,
                records INTEGER NOT NULL DEFAULT 0,
                rows_written INTEGER NOT NULL DEFAULT 0,
                outcome TEXT NOT NULL,
                stage TEXT,
                message TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_runs_started ON relay_runs(started_at DESC)",
            [],
        )?;

        Ok(())
    }

    // =====================================================
    // Scheduled Tasks
    // =====================================================

    pub fn upsert_scheduled_task(&self, task: &StoredTask) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO scheduled_tasks (task_id, run_at, payload) VALUES (?1, ?2, ?3)
             ON CONFLICT(task_id) DO UPDATE SET run_at = excluded.run_at, payload = excluded.payload",
            rusqlite::params![task.task_id, task.run_at.to_rfc3339(), task.payload],
        )?;
        Ok(())
    }

    pub fn delete_scheduled_task(&self, task_id: &str) -> Result<bool, StorageError> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM scheduled_tasks WHERE task_id = ?1", [task_id])?;
        Ok(rows > 0)
    }

    pub fn list_scheduled_tasks(&self) -> Result<Vec<StoredTask>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT task_id, run_at, payload FROM scheduled_tasks ORDER BY run_at ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(task_id, run_at, payload)| {
                let run_at = parse_timestamp(&task_id, &run_at)?;
                Ok(StoredTask {
                    task_id,
                    run_at,
                    payload,
                })
            })
            .collect()
    }

    // =====================================================
    // Local Sheet
    // =====================================================

    /// Index of the last row holding data in a sheet (0 when empty)
    pub fn sheet_last_row(&self, sheet: &str) -> Result<u32, StorageError> {
        let conn = self.conn.lock();
        let last: Option<i64> = conn.query_row(
            "SELECT MAX(row_index) FROM sheet_cells WHERE sheet = ?1",
            [sheet],
            |row| row.get(0),
        )?;
        Ok(last.unwrap_or(0) as u32)
    }

    /// Write a block of rows starting at `start_row`, overwriting what is there
    pub fn sheet_write_rows(
        &self,
        sheet: &str,
        start_row: u32,
        rows: &[Vec<String>],
    ) -> Result<(), StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO sheet_cells (sheet, row_index, col_index, value) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(sheet, row_index, col_index) DO UPDATE SET value = excluded.value",
            )?;
            for (offset, row) in rows.iter().enumerate() {
                let row_index = start_row as i64 + offset as i64;
                for (col, value) in row.iter().enumerate() {
                    stmt.execute(rusqlite::params![sheet, row_index, col as i64 + 1, value])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// All rows of a sheet in row order, each as (row index, cells)
    #[cfg(test)]
    pub fn sheet_rows(&self, sheet: &str) -> Result<Vec<(u32, Vec<String>)>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT row_index, col_index, value FROM sheet_cells
             WHERE sheet = ?1 ORDER BY row_index ASC, col_index ASC",
        )?;
        let cells = stmt
            .query_map([sheet], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut rows: Vec<(u32, Vec<String>)> = Vec::new();
        for (row_index, col_index, value) in cells {
            let row_index = row_index as u32;
            if rows.last().map(|(r, _)| *r) != Some(row_index) {
                rows.push((row_index, Vec::new()));
            }
            if let Some((_, cells)) = rows.last_mut() {
                let col = col_index as usize;
                if cells.len() < col {
                    cells.resize(col, String::new());
                }
                cells[col - 1] = value;
            }
        }
        Ok(rows)
    }

    // =====================================================
    // Run Log
    // =====================================================

    pub fn insert_run(&self, run: &RunRecord) -> Result<i64, StorageError> {
        let conn = self.conn.lock();
        let finished_at = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO relay_runs (origin, from_cursor, new_cursor, records, rows_written,
                                     outcome, stage, message, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                run.origin,
                run.from_cursor,
                run.new_cursor,
                run.records,
                run.rows_written,
                run.outcome.as_str(),
                run.stage,
                run.message,
                run.started_at.to_rfc3339(),
                finished_at
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RelayRun>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, origin, from_cursor, new_cursor, records, rows_written,
                    outcome, stage, message, started_at, finished_at
             FROM relay_runs ORDER BY id DESC LIMIT ?1",
        )?;
        let runs = stmt
            .query_map([limit as i64], |row| row_to_run(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    pub fn last_run(&self) -> Result<Option<RelayRun>, StorageError> {
        Ok(self.recent_runs(1)?.into_iter().next())
    }

    /// Latest run that got as far as reading a start cursor
    pub fn last_fetch_run(&self) -> Result<Option<RelayRun>, StorageError> {
        let conn = self.conn.lock();
        let run = conn
            .query_row(
                "SELECT id, origin, from_cursor, new_cursor, records, rows_written,
                        outcome, stage, message, started_at, finished_at
                 FROM relay_runs WHERE from_cursor IS NOT NULL ORDER BY id DESC LIMIT 1",
                [],
                |row| row_to_run(row),
            )
            .optional()?;
        Ok(run)
    }
}

// =====================================================
// Relay State
// =====================================================

impl CursorStore for Db {
    fn get_cursor(&self) -> Result<Option<Cursor>, StorageError> {
        let conn = self.conn.lock();
        Ok(get_state(&conn, KEY_CURSOR)?.map(Cursor::new))
    }

    fn set_cursor(&self, cursor: &Cursor) -> Result<Cursor, StorageError> {
        let mut conn = self.conn.lock();
        // IMMEDIATE takes the write lock up front so a second process cannot
        // interleave between the read and the write.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stored = match get_state(&tx, KEY_CURSOR)?.map(Cursor::new) {
            Some(current) if current >= *cursor => current,
            _ => {
                put_state(&tx, KEY_CURSOR, cursor.as_str())?;
                cursor.clone()
            }
        };
        tx.commit()?;
        Ok(stored)
    }

    fn clear_cursor(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        delete_state(&conn, KEY_CURSOR)
    }

    fn get_listening(&self) -> Result<bool, StorageError> {
        let conn = self.conn.lock();
        parse_flag(KEY_LISTENING, get_state(&conn, KEY_LISTENING)?)
    }

    fn set_listening(&self, listening: bool) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        put_state(&conn, KEY_LISTENING, if listening { "true" } else { "false" })
    }

    fn get_subscription(&self) -> Result<SubscriptionState, StorageError> {
        let conn = self.conn.lock();
        let is_active = parse_flag(
            KEY_SUBSCRIPTION_ACTIVE,
            get_state(&conn, KEY_SUBSCRIPTION_ACTIVE)?,
        )?;
        let renewal_deadline = get_state(&conn, KEY_RENEWAL_DEADLINE)?
            .map(|raw| parse_timestamp(KEY_RENEWAL_DEADLINE, &raw))
            .transpose()?;
        let renewal_task_id = get_state(&conn, KEY_RENEWAL_TASK)?;
        Ok(SubscriptionState {
            is_active,
            renewal_deadline,
            renewal_task_id,
        })
    }

    fn set_subscription(&self, state: &SubscriptionState) -> Result<(), StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        put_state(
            &tx,
            KEY_SUBSCRIPTION_ACTIVE,
            if state.is_active { "true" } else { "false" },
        )?;
        match state.renewal_deadline {
            Some(deadline) => put_state(&tx, KEY_RENEWAL_DEADLINE, &deadline.to_rfc3339())?,
            None => delete_state(&tx, KEY_RENEWAL_DEADLINE)?,
        }
        match &state.renewal_task_id {
            Some(task_id) => put_state(&tx, KEY_RENEWAL_TASK, task_id)?,
            None => delete_state(&tx, KEY_RENEWAL_TASK)?,
        }
        tx.commit()?;
        Ok(())
    }
}

fn get_state(conn: &Connection, key: &str) -> Result<Option<String>, StorageError> {
    Ok(conn
        .query_row(
            "SELECT value FROM relay_state WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?)
}

fn put_state(conn: &Connection, key: &str, value: &str) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO relay_state (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        rusqlite::params![key, value],
    )?;
    Ok(())
}

fn delete_state(conn: &Connection, key: &str) -> Result<(), StorageError> {
    conn.execute("DELETE FROM relay_state WHERE key = ?1", [key])?;
    Ok(())
}

fn parse_flag(key: &str, raw: Option<String>) -> Result<bool, StorageError> {
    match raw.as_deref() {
        None | Some("false") => Ok(false),
        Some("true") => Ok(true),
        Some(other) => Err(StorageError::Corrupt {
            key: key.to_string(),
            value: other.to_string(),
        }),
    }
}

fn parse_timestamp(key: &str, raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StorageError::Corrupt {
            key: key.to_string(),
            value: raw.to_string(),
        })
}

fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<RelayRun> {
    let outcome: String = row.get(6)?;
    Ok(RelayRun {
        id: row.get(0)?,
        origin: row.get(1)?,
        from_cursor: row.get(2)?,
        new_cursor: row.get(3)?,
        records: row.get(4)?,
        rows_written: row.get(5)?,
        outcome: RunOutcome::from_str(&outcome).unwrap_or(RunOutcome::Aborted),
        stage: row.get(7)?,
        message: row.get(8)?,
        started_at: row.get(9)?,
        finished_at: row.get(10)?,
    })
}
