//! Schedule service: the operator-facing entry points
//!
//! Creation, cancellation, requeue and status queries. Publishing itself is
//! the scheduler's job; nothing here talks to a platform.

use crate::error::{PolycastError, Result};
use crate::types::{EntryStatus, ScheduleEntry, ScheduleStatus, ScheduleTransition};
use crate::Database;

/// Schedule service
#[derive(Clone)]
pub struct ScheduleService {
    db: Database,
}

impl ScheduleService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// One pending entry per channel, sharing a group id.
    ///
    /// Re-submitting the same (content, channel, time) returns the entries
    /// already stored.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an empty channel list, `NotFound` when the content
    /// item or a channel doesn't exist.
    pub async fn create(
        &self,
        content_item_id: &str,
        channel_ids: &[String],
        scheduled_for: i64,
    ) -> Result<Vec<ScheduleEntry>> {
        let entries = self
            .db
            .create_schedule_entries(
                content_item_id,
                channel_ids,
                scheduled_for,
                chrono::Utc::now().timestamp(),
            )
            .await?;

        if let Some(first) = entries.first() {
            tracing::info!(
                group = %first.group_id,
                content = content_item_id,
                channels = entries.len(),
                scheduled_for,
                "Scheduled content"
            );
        }
        Ok(entries)
    }

    /// Cancel a pending entry
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, `Conflict` when the entry has already
    /// left `pending`.
    pub async fn cancel(&self, entry_id: &str) -> Result<()> {
        if self
            .db
            .cancel_entry(entry_id, chrono::Utc::now().timestamp())
            .await?
        {
            tracing::info!(entry = entry_id, "Entry cancelled");
            return Ok(());
        }
        Err(self.explain_refusal(entry_id, "cancel", ScheduleStatus::Pending).await)
    }

    /// Give a failed entry a fresh retry budget
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, `Conflict` unless the entry is `failed`.
    pub async fn requeue(&self, entry_id: &str) -> Result<()> {
        if self
            .db
            .requeue_entry(entry_id, chrono::Utc::now().timestamp())
            .await?
        {
            tracing::info!(entry = entry_id, "Entry requeued");
            return Ok(());
        }
        Err(self.explain_refusal(entry_id, "requeue", ScheduleStatus::Failed).await)
    }

    pub async fn get_status(&self, entry_id: &str) -> Result<EntryStatus> {
        self.db
            .get_entry_status(entry_id)
            .await?
            .ok_or_else(|| PolycastError::NotFound(format!("schedule entry {}", entry_id)))
    }

    /// Per-channel outcomes of one request, never rolled up
    pub async fn group_status(&self, group_id: &str) -> Result<Vec<EntryStatus>> {
        let statuses = self.db.group_statuses(group_id).await?;
        if statuses.is_empty() {
            return Err(PolycastError::NotFound(format!("schedule group {}", group_id)));
        }
        Ok(statuses)
    }

    pub async fn list(
        &self,
        status: Option<ScheduleStatus>,
        limit: usize,
    ) -> Result<Vec<EntryStatus>> {
        self.db.list_statuses(status, limit).await
    }

    /// Status changes recorded for the entry, oldest first
    pub async fn history(&self, entry_id: &str) -> Result<Vec<ScheduleTransition>> {
        let transitions = self.db.transitions(entry_id).await?;
        if transitions.is_empty() {
            return Err(PolycastError::NotFound(format!("schedule entry {}", entry_id)));
        }
        Ok(transitions)
    }

    async fn explain_refusal(
        &self,
        entry_id: &str,
        action: &str,
        required: ScheduleStatus,
    ) -> PolycastError {
        match self.db.get_entry(entry_id).await {
            Ok(Some(entry)) => PolycastError::Conflict(format!(
                "cannot {} entry {}: it is {}, not {}",
                action, entry_id, entry.status, required
            )),
            Ok(None) => PolycastError::NotFound(format!("schedule entry {}", entry_id)),
            Err(e) => e,
        }
    }
}
