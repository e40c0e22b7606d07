//! One-shot scheduled tasks.
//!
//! Each task is written to the `scheduled_tasks` table before its timer is
//! armed, so pending work survives a restart. A fired task keeps its row
//! until whoever handles it calls [`Scheduler::cancel`] with its id.

use crate::db::{Db, StoredTask};
use crate::error::ScheduleError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledTask {
    /// Re-register the Gmail watch before it expires
    RenewWatch,
}

impl ScheduledTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduledTask::RenewWatch => "renew_watch",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "renew_watch" => Some(ScheduledTask::RenewWatch),
            _ => None,
        }
    }
}

/// A task whose time has come
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredTask {
    pub task_id: String,
    pub task: ScheduledTask,
}

pub trait Scheduler: Send + Sync {
    /// Arm `task` to fire at `run_at`; an existing entry with the same id is replaced
    fn schedule_at(
        &self,
        run_at: DateTime<Utc>,
        task_id: &str,
        task: ScheduledTask,
    ) -> Result<(), ScheduleError>;

    /// Drop a pending or fired entry. Returns false when no entry had this id.
    fn cancel(&self, task_id: &str) -> Result<bool, ScheduleError>;
}

/// Tokio timers backed by the SQLite schedule table
pub struct TokioScheduler {
    db: Arc<Db>,
    pending: Arc<DashMap<String, CancellationToken>>,
    fired_tx: mpsc::UnboundedSender<FiredTask>,
}

impl TokioScheduler {
    /// Create the scheduler and the channel fired tasks are delivered on
    pub fn new(db: Arc<Db>) -> (Arc<Self>, mpsc::UnboundedReceiver<FiredTask>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            db,
            pending: Arc::new(DashMap::new()),
            fired_tx,
        });
        (scheduler, fired_rx)
    }

    /// Re-arm every persisted task. Overdue tasks fire immediately.
    pub fn restore(&self) -> Result<usize, ScheduleError> {
        let mut restored = 0usize;
        for stored in self.db.list_scheduled_tasks()? {
            match ScheduledTask::from_str(&stored.payload) {
                Some(task) => {
                    self.arm(stored.task_id, stored.run_at, task);
                    restored += 1;
                }
                None => {
                    log::warn!(
                        "[MAIL_RELAY] Dropping scheduled task {} with unknown payload '{}'",
                        stored.task_id,
                        stored.payload
                    );
                    self.db.delete_scheduled_task(&stored.task_id)?;
                }
            }
        }
        Ok(restored)
    }

    fn arm(&self, task_id: String, run_at: DateTime<Utc>, task: ScheduledTask) {
        let token = CancellationToken::new();
        if let Some(previous) = self.pending.insert(task_id.clone(), token.clone()) {
            previous.cancel();
        }

        let delay = (run_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let pending = self.pending.clone();
        let fired_tx = self.fired_tx.clone();

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    pending.remove(&task_id);
                    log::debug!("[MAIL_RELAY] Scheduled task {} ({}) fired", task_id, task.as_str());
                    if fired_tx.send(FiredTask { task_id, task }).is_err() {
                        log::warn!("[MAIL_RELAY] No dispatcher for fired task");
                    }
                }
            }
        });
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_at(
        &self,
        run_at: DateTime<Utc>,
        task_id: &str,
        task: ScheduledTask,
    ) -> Result<(), ScheduleError> {
        self.db.upsert_scheduled_task(&StoredTask {
            task_id: task_id.to_string(),
            run_at,
            payload: task.as_str().to_string(),
        })?;
        self.arm(task_id.to_string(), run_at, task);
        log::info!(
            "[MAIL_RELAY] Scheduled {} at {} (task {})",
            task.as_str(),
            run_at.to_rfc3339(),
            task_id
        );
        Ok(())
    }

    fn cancel(&self, task_id: &str) -> Result<bool, ScheduleError> {
        if let Some((_, token)) = self.pending.remove(task_id) {
            token.cancel();
        }
        Ok(self.db.delete_scheduled_task(task_id)?)
    }
}
