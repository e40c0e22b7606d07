//! Incremental pull of "message added" changes from a history cursor.
//!
//! All history pages are listed first, then each referenced message is
//! resolved. A listing failure aborts the whole fetch with no cursor; a
//! message that can no longer be resolved is logged and skipped.
//!
//! The history listing can only be narrowed to a single label, so resolved
//! messages are checked against the full configured label set.

use crate::cursor::Cursor;
use crate::error::{FetchError, ItemResolveError};
use crate::gmail::{MailApi, MailRecord, MessageRef};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct FetchResult {
    /// Resolved records in history order
    pub records: Vec<MailRecord>,
    /// Highest cursor reported upstream, never below the starting cursor
    pub new_cursor: Cursor,
    /// References that could not be resolved
    pub skipped: usize,
    /// Resolved messages dropped for carrying none of the configured labels
    pub filtered: usize,
    pub pages: usize,
}

pub struct ChangeFetcher {
    api: Arc<dyn MailApi>,
    labels: Vec<String>,
}

impl ChangeFetcher {
    pub fn new(api: Arc<dyn MailApi>) -> Self {
        Self {
            api,
            labels: Vec::new(),
        }
    }

    /// Keep only messages carrying at least one of `labels`. Empty keeps everything.
    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    fn wanted(&self, record: &MailRecord) -> bool {
        self.labels.is_empty() || record.labels.iter().any(|l| self.labels.contains(l))
    }

    pub async fn fetch(&self, from: &Cursor) -> Result<FetchResult, FetchError> {
        let (refs, new_cursor, pages) = self.list_added(from).await?;

        let mut records = Vec::with_capacity(refs.len());
        let mut skipped = 0usize;
        let mut filtered = 0usize;
        for message in &refs {
            match self.resolve(message).await {
                Ok(record) if self.wanted(&record) => records.push(record),
                Ok(record) => {
                    filtered += 1;
                    log::debug!(
                        "[MAIL_RELAY] Message {} has labels {:?}; not relayed",
                        record.message_id,
                        record.labels
                    );
                }
                Err(e) => {
                    skipped += 1;
                    if e.source.is_not_found() {
                        log::info!("[MAIL_RELAY] Message {} no longer exists; skipped", e.message_id);
                    } else {
                        log::warn!("[MAIL_RELAY] Skipping message: {}", e);
                    }
                }
            }
        }

        log::debug!(
            "[MAIL_RELAY] Fetched {} records ({} skipped, {} filtered) over {} pages from cursor {} to {}",
            records.len(),
            skipped,
            filtered,
            pages,
            from,
            new_cursor
        );

        Ok(FetchResult {
            records,
            new_cursor,
            skipped,
            filtered,
            pages,
        })
    }

    /// Walk every history page, collecting added-message references in order.
    /// A message listed more than once is kept at its first position.
    async fn list_added(
        &self,
        from: &Cursor,
    ) -> Result<(Vec<MessageRef>, Cursor, usize), FetchError> {
        let mut refs = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut seen_tokens: HashSet<String> = HashSet::new();
        let mut highest = from.clone();
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = self
                .api
                .list_history(from, page_token.as_deref())
                .await
                .map_err(|source| {
                    // Gmail answers 404 for a startHistoryId past its retention window
                    if source.is_not_found() {
                        FetchError::CursorExpired {
                            cursor: from.to_string(),
                            source,
                        }
                    } else {
                        FetchError::ListingFailed(source)
                    }
                })?;
            pages += 1;

            if let Some(history_id) = page.history_id {
                highest = highest.max(Cursor::new(history_id));
            }

            for record in page.history.unwrap_or_default() {
                highest = highest.max(Cursor::new(record.id));
                for added in record.messages_added.unwrap_or_default() {
                    if seen.insert(added.message.id.clone()) {
                        refs.push(added.message);
                    }
                }
            }

            match page.next_page_token {
                Some(token) if !token.is_empty() => {
                    if !seen_tokens.insert(token.clone()) {
                        return Err(FetchError::ListingFailed(crate::error::ApiError::new(
                            format!("history listing repeated page token {}", token),
                        )));
                    }
                    page_token = Some(token);
                }
                _ => break,
            }
        }

        Ok((refs, highest, pages))
    }

    async fn resolve(&self, message: &MessageRef) -> Result<MailRecord, ItemResolveError> {
        self.api
            .get_message(&message.id)
            .await
            .map(|m| m.to_record())
            .map_err(|source| ItemResolveError {
                message_id: message.id.clone(),
                source,
            })
    }
}
