//! Gmail watch (push subscription) lifecycle.
//!
//! `start` registers the watch and arms a one-shot renewal ahead of its
//! expiry; the renewal calls `start` again with its own task id, so a
//! listening relay keeps itself subscribed. `stop` tears everything down and
//! forgets the cursor.

use crate::cursor::{Cursor, CursorStore, SubscriptionState};
use crate::error::{ConfigError, WatchError};
use crate::gmail::MailApi;
use crate::scheduler::{FiredTask, ScheduledTask, Scheduler};
use chrono::{DateTime, Duration, Utc};
use mail_relay_types::WatchStatus;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Earliest a renewal may be scheduled, measured from now
const MIN_RENEWAL_DELAY_SECS: i64 = 60;
/// Delay before retrying a renewal that failed
const RENEWAL_RETRY_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct WatchStarted {
    pub history_id: String,
    pub expires_at: DateTime<Utc>,
    pub renewal_deadline: DateTime<Utc>,
    pub renewal_task_id: String,
    /// The cursor was empty and got seeded from the watch response
    pub seeded_cursor: bool,
}

pub struct WatchLifecycleManager {
    api: Arc<dyn MailApi>,
    store: Arc<dyn CursorStore>,
    scheduler: Arc<dyn Scheduler>,
    topic: Option<String>,
    labels: Vec<String>,
    renew_margin: Duration,
}

impl WatchLifecycleManager {
    pub fn new(
        api: Arc<dyn MailApi>,
        store: Arc<dyn CursorStore>,
        scheduler: Arc<dyn Scheduler>,
        topic: Option<String>,
        labels: Vec<String>,
        renew_margin: std::time::Duration,
    ) -> Self {
        Self {
            api,
            store,
            scheduler,
            topic,
            labels,
            renew_margin: Duration::seconds(renew_margin.as_secs() as i64),
        }
    }

    /// Register the watch and arm its renewal.
    ///
    /// `trigger_task_id` is the scheduler id of the renewal that caused this
    /// call; manual starts pass `None`.
    pub async fn start(&self, trigger_task_id: Option<&str>) -> Result<WatchStarted, WatchError> {
        let topic = self
            .topic
            .as_deref()
            .ok_or_else(|| ConfigError::Missing("MAIL_RELAY_TOPIC".to_string()))?;

        let response = self
            .api
            .watch(topic, &self.labels)
            .await
            .map_err(WatchError::Subscribe)?;
        let expires_at = response
            .expires_at()
            .ok_or_else(|| WatchError::InvalidExpiration(response.expiration.clone()))?;

        let renewal_deadline = self.renewal_deadline(expires_at, Utc::now());
        let renewal_task_id = uuid::Uuid::new_v4().to_string();
        self.scheduler
            .schedule_at(renewal_deadline, &renewal_task_id, ScheduledTask::RenewWatch)?;

        if let Some(trigger) = trigger_task_id {
            if !self.scheduler.cancel(trigger)? {
                log::debug!("[MAIL_RELAY] Trigger task {} had no schedule entry", trigger);
            }
        }
        let previous = self.store.get_subscription()?;
        if let Some(old) = previous.renewal_task_id.as_deref() {
            if Some(old) != trigger_task_id {
                self.scheduler.cancel(old)?;
            }
        }

        let seeded_cursor = match self.store.get_cursor()? {
            Some(_) => false,
            None => {
                self.store.set_cursor(&Cursor::new(response.history_id.clone()))?;
                true
            }
        };

        self.store.set_subscription(&SubscriptionState {
            is_active: true,
            renewal_deadline: Some(renewal_deadline),
            renewal_task_id: Some(renewal_task_id.clone()),
        })?;
        self.store.set_listening(true)?;

        log::info!(
            "[MAIL_RELAY] Watch active on {} until {}; renewal at {}",
            topic,
            expires_at.to_rfc3339(),
            renewal_deadline.to_rfc3339()
        );

        Ok(WatchStarted {
            history_id: response.history_id,
            expires_at,
            renewal_deadline,
            renewal_task_id,
            seeded_cursor,
        })
    }

    /// Deregister the watch, cancel the pending renewal and reset local state
    pub async fn stop(&self) -> Result<(), WatchError> {
        self.api.stop().await.map_err(WatchError::Unsubscribe)?;

        let subscription = self.store.get_subscription()?;
        if let Some(task_id) = subscription.renewal_task_id.as_deref() {
            self.scheduler.cancel(task_id)?;
        }

        self.store.set_listening(false)?;
        self.store.clear_cursor()?;
        self.store.set_subscription(&SubscriptionState {
            is_active: false,
            renewal_deadline: None,
            renewal_task_id: None,
        })?;

        log::info!("[MAIL_RELAY] Watch stopped; cursor cleared");
        Ok(())
    }

    pub fn status(&self) -> Result<WatchStatus, WatchError> {
        let listening = self.store.get_listening()?;
        let subscription = self.store.get_subscription()?;
        Ok(WatchStatus {
            listening,
            renewal_deadline: subscription.renewal_deadline.map(|d| d.to_rfc3339()),
            renewal_task_id: subscription.renewal_task_id,
        })
    }

    /// Handle a fired renewal. A relay that was stopped in the meantime
    /// just drops the entry; a failed renewal is retried later.
    pub async fn renew(&self, task_id: &str) -> Result<(), WatchError> {
        if !self.store.get_listening()? {
            log::info!("[MAIL_RELAY] Not listening; dropping renewal {}", task_id);
            self.scheduler.cancel(task_id)?;
            return Ok(());
        }

        match self.start(Some(task_id)).await {
            Ok(_) => Ok(()),
            Err(e) => {
                log::error!("[MAIL_RELAY] Watch renewal failed: {}", e);
                let retry_id = uuid::Uuid::new_v4().to_string();
                let retry_at = Utc::now() + Duration::seconds(RENEWAL_RETRY_SECS);
                self.scheduler
                    .schedule_at(retry_at, &retry_id, ScheduledTask::RenewWatch)?;
                self.scheduler.cancel(task_id)?;

                let mut subscription = self.store.get_subscription()?;
                subscription.renewal_task_id = Some(retry_id);
                self.store.set_subscription(&subscription)?;
                Err(e)
            }
        }
    }

    fn renewal_deadline(&self, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        let earliest = now + Duration::seconds(MIN_RENEWAL_DELAY_SECS);
        (expires_at - self.renew_margin).max(earliest)
    }
}

/// Dispatch fired scheduler tasks until the channel closes
pub async fn run_renewals(watch: Arc<WatchLifecycleManager>, mut fired: mpsc::UnboundedReceiver<FiredTask>) {
    log::info!("[MAIL_RELAY] Renewal dispatcher started");
    while let Some(task) = fired.recv().await {
        match task.task {
            ScheduledTask::RenewWatch => {
                if let Err(e) = watch.renew(&task.task_id).await {
                    log::error!("[MAIL_RELAY] Renewal task {} failed: {}", task.task_id, e);
                }
            }
        }
    }
    log::warn!("[MAIL_RELAY] Renewal dispatcher stopped");
}
