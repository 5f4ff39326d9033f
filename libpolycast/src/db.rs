//! Database operations for Polycast
//!
//! Every status change is a single conditional `UPDATE` whose `WHERE` clause
//! names the status (and, after the claim, the owning worker) the caller
//! expects. A `false` return means another process got there first.

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use std::path::Path;
use std::time::Duration;

use crate::error::{DbError, ErrorKind, PolycastError, Result};
use crate::scheduling::idempotency_key;
use crate::types::{
    Channel, ChannelSettings, ContentItem, EngagementUpdate, EntryStatus, ExternalReference,
    Organization, Platform, RemoteStatus, ScheduleEntry, ScheduleStatus, ScheduleTransition,
    WebhookEvent,
};

const ENTRY_FIELDS: [&str; 15] = [
    "id",
    "group_id",
    "content_item_id",
    "channel_id",
    "scheduled_for",
    "status",
    "attempt_count",
    "last_error",
    "last_error_kind",
    "idempotency_key",
    "claimed_by",
    "claimed_at",
    "not_before",
    "created_at",
    "updated_at",
];

const STATUS_SELECT: &str = r#"
    SELECT e.id, e.group_id, e.channel_id, c.platform, e.status, e.scheduled_for,
           e.attempt_count, e.last_error, e.last_error_kind, e.not_before,
           x.external_post_id, x.external_url
    FROM schedule_entries e
    JOIN channels c ON c.id = e.channel_id
    LEFT JOIN external_references x ON x.schedule_entry_id = e.id
"#;

fn entry_columns(prefix: &str) -> String {
    ENTRY_FIELDS
        .iter()
        .map(|f| format!("{}{}", prefix, f))
        .collect::<Vec<_>>()
        .join(", ")
}

/// A leased schedule entry together with its channel's platform
#[derive(Debug, Clone)]
pub struct LeasedEntry {
    pub entry: ScheduleEntry,
    pub platform: Platform,
}

/// Result of persisting an inbound webhook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First delivery; `applied` external references were updated
    Processed { applied: usize, unmatched: usize },
    /// The dedup key was already recorded; nothing changed
    Duplicate,
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        // Expand path and create parent directories
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
            }
        }

        // WAL lets pollers read while a worker writes; the busy timeout makes
        // concurrent writers queue instead of failing with SQLITE_BUSY.
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ========================================================================
    // Collaborator records
    // ========================================================================

    pub async fn upsert_organization(&self, org: &Organization) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO organizations (id, name, enabled) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET name = excluded.name, enabled = excluded.enabled
            "#,
        )
        .bind(&org.id)
        .bind(&org.name)
        .bind(org.enabled)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_organization(&self, id: &str) -> Result<Option<Organization>> {
        let row = sqlx::query("SELECT id, name, enabled FROM organizations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| Organization {
            id: r.get("id"),
            name: r.get("name"),
            enabled: r.get::<i64, _>("enabled") != 0,
        }))
    }

    pub async fn upsert_content_item(&self, item: &ContentItem) -> Result<()> {
        let media = serde_json::to_string(&item.media).map_err(|e| DbError::Corrupt {
            column: "media",
            reason: e.to_string(),
        })?;
        let hashtags = serde_json::to_string(&item.hashtags).map_err(|e| DbError::Corrupt {
            column: "hashtags",
            reason: e.to_string(),
        })?;

        sqlx::query(
            r#"
            INSERT INTO content_items (id, title, caption, media, hashtags, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                caption = excluded.caption,
                media = excluded.media,
                hashtags = excluded.hashtags
            "#,
        )
        .bind(&item.id)
        .bind(&item.title)
        .bind(&item.caption)
        .bind(media)
        .bind(hashtags)
        .bind(item.created_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_content_item(&self, id: &str) -> Result<Option<ContentItem>> {
        let row = sqlx::query(
            "SELECT id, title, caption, media, hashtags, created_at FROM content_items WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let Some(r) = row else {
            return Ok(None);
        };

        let media: String = r.get("media");
        let hashtags: String = r.get("hashtags");
        Ok(Some(ContentItem {
            id: r.get("id"),
            title: r.get("title"),
            caption: r.get("caption"),
            media: serde_json::from_str(&media).map_err(|e| DbError::Corrupt {
                column: "media",
                reason: e.to_string(),
            })?,
            hashtags: serde_json::from_str(&hashtags).map_err(|e| DbError::Corrupt {
                column: "hashtags",
                reason: e.to_string(),
            })?,
            created_at: r.get("created_at"),
        }))
    }

    pub async fn upsert_channel(&self, channel: &Channel) -> Result<()> {
        use secrecy::ExposeSecret;

        let settings = serde_json::to_string(&channel.settings).map_err(|e| DbError::Corrupt {
            column: "settings",
            reason: e.to_string(),
        })?;

        sqlx::query(
            r#"
            INSERT INTO channels (id, organization_id, platform, account_ref, credential, settings, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                organization_id = excluded.organization_id,
                platform = excluded.platform,
                account_ref = excluded.account_ref,
                credential = excluded.credential,
                settings = excluded.settings
            "#,
        )
        .bind(&channel.id)
        .bind(&channel.organization_id)
        .bind(channel.platform.as_str())
        .bind(&channel.account_ref)
        .bind(channel.credential.expose_secret())
        .bind(settings)
        .bind(channel.created_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_channel(&self, id: &str) -> Result<Option<Channel>> {
        let row = sqlx::query(
            r#"
            SELECT id, organization_id, platform, account_ref, credential, settings, created_at
            FROM channels WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let Some(r) = row else {
            return Ok(None);
        };

        let settings: String = r.get("settings");
        let credential: String = r.get("credential");
        Ok(Some(Channel {
            id: r.get("id"),
            organization_id: r.get("organization_id"),
            platform: parse_platform(&r.get::<String, _>("platform"))?,
            account_ref: r.get("account_ref"),
            credential: credential.into(),
            settings: serde_json::from_str::<ChannelSettings>(&settings).map_err(|e| {
                DbError::Corrupt {
                    column: "settings",
                    reason: e.to_string(),
                }
            })?,
            created_at: r.get("created_at"),
        }))
    }

    // ========================================================================
    // Schedule entries
    // ========================================================================

    /// Create one pending entry per channel, all sharing a new group id.
    ///
    /// Re-submitting an existing (content, channel, time) triple returns the
    /// entry already stored under its idempotency key.
    pub async fn create_schedule_entries(
        &self,
        content_item_id: &str,
        channel_ids: &[String],
        scheduled_for: i64,
        now: i64,
    ) -> Result<Vec<ScheduleEntry>> {
        if channel_ids.is_empty() {
            return Err(PolycastError::InvalidInput(
                "At least one channel is required".to_string(),
            ));
        }

        if self.get_content_item(content_item_id).await?.is_none() {
            return Err(PolycastError::NotFound(format!(
                "content item {}",
                content_item_id
            )));
        }

        let mut unique_channels: Vec<&String> = Vec::with_capacity(channel_ids.len());
        for channel_id in channel_ids {
            if unique_channels.contains(&channel_id) {
                continue;
            }
            if self.get_channel(channel_id).await?.is_none() {
                return Err(PolycastError::NotFound(format!("channel {}", channel_id)));
            }
            unique_channels.push(channel_id);
        }

        let group_id = uuid::Uuid::new_v4().to_string();
        let select = format!(
            "SELECT {} FROM schedule_entries WHERE idempotency_key = ?",
            entry_columns("")
        );

        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;
        let mut entries = Vec::with_capacity(unique_channels.len());

        for channel_id in unique_channels {
            let key = idempotency_key(content_item_id, channel_id, scheduled_for);

            sqlx::query(
                r#"
                INSERT INTO schedule_entries
                    (id, group_id, content_item_id, channel_id, scheduled_for, status,
                     attempt_count, idempotency_key, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?)
                ON CONFLICT(idempotency_key) DO NOTHING
                "#,
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(&group_id)
            .bind(content_item_id)
            .bind(channel_id)
            .bind(scheduled_for)
            .bind(&key)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

            let row = sqlx::query(&select)
                .bind(&key)
                .fetch_one(&mut *tx)
                .await
                .map_err(DbError::SqlxError)?;
            entries.push(entry_from_row(&row)?);
        }

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(entries)
    }

    pub async fn get_entry(&self, id: &str) -> Result<Option<ScheduleEntry>> {
        let query = format!(
            "SELECT {} FROM schedule_entries WHERE id = ?",
            entry_columns("")
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(entry_from_row).transpose()
    }

    pub async fn get_entry_status(&self, id: &str) -> Result<Option<EntryStatus>> {
        let query = format!("{} WHERE e.id = ?", STATUS_SELECT);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(status_from_row).transpose()
    }

    /// Per-channel status of every entry created by one request
    pub async fn group_statuses(&self, group_id: &str) -> Result<Vec<EntryStatus>> {
        let query = format!(
            "{} WHERE e.group_id = ? ORDER BY c.platform, e.channel_id",
            STATUS_SELECT
        );
        let rows = sqlx::query(&query)
            .bind(group_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(status_from_row).collect()
    }

    pub async fn list_statuses(
        &self,
        status: Option<ScheduleStatus>,
        limit: usize,
    ) -> Result<Vec<EntryStatus>> {
        let rows = match status {
            Some(status) => {
                let query = format!(
                    "{} WHERE e.status = ? ORDER BY e.scheduled_for ASC LIMIT ?",
                    STATUS_SELECT
                );
                sqlx::query(&query)
                    .bind(status.as_str())
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                let query = format!("{} ORDER BY e.scheduled_for ASC LIMIT ?", STATUS_SELECT);
                sqlx::query(&query)
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(DbError::SqlxError)?;

        rows.iter().map(status_from_row).collect()
    }

    /// Ids of pending entries that are due at `now`, oldest first
    pub async fn due_entry_ids(&self, now: i64, limit: u32) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM schedule_entries
            WHERE status = 'pending'
              AND scheduled_for <= ?
              AND (not_before IS NULL OR not_before <= ?)
            ORDER BY scheduled_for ASC, created_at ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    /// Compare-and-swap claim: succeeds only if the entry is still pending
    /// and due at the moment of the write.
    pub async fn claim_entry(&self, id: &str, worker_id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE schedule_entries
            SET status = 'claimed', claimed_by = ?, claimed_at = ?, updated_at = ?
            WHERE id = ?
              AND status = 'pending'
              AND scheduled_for <= ?
              AND (not_before IS NULL OR not_before <= ?)
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// `claimed → publishing` for the worker holding the lease.
    ///
    /// Renews the lease so the publish call gets a full lease timeout.
    pub async fn begin_publishing(&self, id: &str, worker_id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE schedule_entries
            SET status = 'publishing', claimed_at = ?, updated_at = ?
            WHERE id = ? AND status = 'claimed' AND claimed_by = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Give the lease back without counting an attempt (rate-limit deferral)
    pub async fn release_entry(
        &self,
        id: &str,
        worker_id: &str,
        not_before: i64,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE schedule_entries
            SET status = 'pending', claimed_by = NULL, claimed_at = NULL,
                not_before = ?, updated_at = ?
            WHERE id = ? AND status = 'claimed' AND claimed_by = ?
            "#,
        )
        .bind(not_before)
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Record a retryable failure and hand the entry back to the poller
    #[allow(clippy::too_many_arguments)]
    pub async fn retry_entry(
        &self,
        id: &str,
        worker_id: &str,
        attempt_count: u32,
        not_before: i64,
        error: &str,
        kind: ErrorKind,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE schedule_entries
            SET status = 'pending', claimed_by = NULL, claimed_at = NULL,
                attempt_count = ?, not_before = ?, last_error = ?, last_error_kind = ?,
                updated_at = ?
            WHERE id = ? AND status IN ('claimed', 'publishing') AND claimed_by = ?
            "#,
        )
        .bind(attempt_count as i64)
        .bind(not_before)
        .bind(error)
        .bind(kind.as_str())
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Move the entry to `failed`; no further automatic retries
    pub async fn fail_entry(
        &self,
        id: &str,
        worker_id: &str,
        attempt_count: u32,
        error: &str,
        kind: ErrorKind,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE schedule_entries
            SET status = 'failed', attempt_count = ?, last_error = ?, last_error_kind = ?,
                updated_at = ?
            WHERE id = ? AND status IN ('claimed', 'publishing') AND claimed_by = ?
            "#,
        )
        .bind(attempt_count as i64)
        .bind(error)
        .bind(kind.as_str())
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Write the external reference and mark the entry posted.
    ///
    /// The reference is committed even when the status update loses the
    /// lease race, so the next owner's pre-check finds it instead of
    /// publishing a duplicate. Returns whether the status moved to `posted`.
    pub async fn complete_entry(
        &self,
        worker_id: &str,
        reference: &ExternalReference,
        now: i64,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        sqlx::query(
            r#"
            INSERT INTO external_references
                (schedule_entry_id, platform, external_post_id, external_url, posted_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(schedule_entry_id) DO NOTHING
            "#,
        )
        .bind(&reference.schedule_entry_id)
        .bind(reference.platform.as_str())
        .bind(&reference.external_post_id)
        .bind(&reference.external_url)
        .bind(reference.posted_at)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        let result = sqlx::query(
            r#"
            UPDATE schedule_entries SET status = 'posted', updated_at = ?
            WHERE id = ? AND status = 'publishing' AND claimed_by = ?
            "#,
        )
        .bind(now)
        .bind(&reference.schedule_entry_id)
        .bind(worker_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(result.rows_affected() == 1)
    }

    /// Operator cancel; only pending entries can be cancelled
    pub async fn cancel_entry(&self, id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE schedule_entries SET status = 'cancelled', updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Operator requeue of a failed entry with a fresh retry budget
    pub async fn requeue_entry(&self, id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE schedule_entries
            SET status = 'pending', attempt_count = 0, not_before = NULL,
                claimed_by = NULL, claimed_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'failed'
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Entries stuck in `claimed`/`publishing` since before `cutoff`
    pub async fn expired_leases(&self, cutoff: i64, limit: u32) -> Result<Vec<LeasedEntry>> {
        let query = format!(
            r#"
            SELECT {}, c.platform AS platform
            FROM schedule_entries e
            JOIN channels c ON c.id = e.channel_id
            WHERE e.status IN ('claimed', 'publishing') AND e.claimed_at <= ?
            ORDER BY e.claimed_at ASC
            LIMIT ?
            "#,
            entry_columns("e.")
        );
        let rows = sqlx::query(&query)
            .bind(cutoff)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|r| {
                Ok(LeasedEntry {
                    entry: entry_from_row(r)?,
                    platform: parse_platform(&r.get::<String, _>("platform"))?,
                })
            })
            .collect()
    }

    /// Take back an expired lease, guarded on the exact lease observed.
    ///
    /// `next` is `Pending` (retry later) or `Failed` (ceiling reached).
    #[allow(clippy::too_many_arguments)]
    pub async fn reap_entry(
        &self,
        entry: &ScheduleEntry,
        next: ScheduleStatus,
        attempt_count: u32,
        error: &str,
        kind: ErrorKind,
        now: i64,
    ) -> Result<bool> {
        let (claimed_by, claimed_at) = if next == ScheduleStatus::Pending {
            (None, None)
        } else {
            (entry.claimed_by.clone(), entry.claimed_at)
        };

        let result = sqlx::query(
            r#"
            UPDATE schedule_entries
            SET status = ?, claimed_by = ?, claimed_at = ?, not_before = NULL,
                attempt_count = ?, last_error = ?, last_error_kind = ?, updated_at = ?
            WHERE id = ? AND status = ? AND claimed_by IS ? AND claimed_at IS ?
            "#,
        )
        .bind(next.as_str())
        .bind(claimed_by)
        .bind(claimed_at)
        .bind(attempt_count as i64)
        .bind(error)
        .bind(kind.as_str())
        .bind(now)
        .bind(&entry.id)
        .bind(entry.status.as_str())
        .bind(&entry.claimed_by)
        .bind(entry.claimed_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Status history recorded by the audit trigger, oldest first
    pub async fn transitions(&self, entry_id: &str) -> Result<Vec<ScheduleTransition>> {
        let rows = sqlx::query(
            r#"
            SELECT entry_id, from_status, to_status, worker_id, at
            FROM schedule_transitions WHERE entry_id = ? ORDER BY id ASC
            "#,
        )
        .bind(entry_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|r| {
                let from: Option<String> = r.get("from_status");
                Ok(ScheduleTransition {
                    entry_id: r.get("entry_id"),
                    from_status: from.as_deref().map(parse_status).transpose()?,
                    to_status: parse_status(&r.get::<String, _>("to_status"))?,
                    worker_id: r.get("worker_id"),
                    at: r.get("at"),
                })
            })
            .collect()
    }

    // ========================================================================
    // External references
    // ========================================================================

    pub async fn get_external_reference(
        &self,
        schedule_entry_id: &str,
    ) -> Result<Option<ExternalReference>> {
        let row = sqlx::query(
            r#"
            SELECT id, schedule_entry_id, platform, external_post_id, external_url, posted_at,
                   likes, comments, shares, remote_status, engagement_updated_at
            FROM external_references WHERE schedule_entry_id = ?
            "#,
        )
        .bind(schedule_entry_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(reference_from_row).transpose()
    }

    pub async fn find_external_reference(
        &self,
        platform: Platform,
        external_post_id: &str,
    ) -> Result<Option<ExternalReference>> {
        let row = sqlx::query(
            r#"
            SELECT id, schedule_entry_id, platform, external_post_id, external_url, posted_at,
                   likes, comments, shares, remote_status, engagement_updated_at
            FROM external_references WHERE platform = ? AND external_post_id = ?
            "#,
        )
        .bind(platform.as_str())
        .bind(external_post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(reference_from_row).transpose()
    }

    // ========================================================================
    // Webhook events
    // ========================================================================

    /// Insert-if-absent the event and, on first delivery only, apply its
    /// updates in the same transaction.
    pub async fn ingest_webhook(
        &self,
        event: &WebhookEvent,
        updates: &[EngagementUpdate],
    ) -> Result<IngestOutcome> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO webhook_events (platform, dedup_key, payload, signature, received_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(dedup_key) DO NOTHING
            "#,
        )
        .bind(event.platform.as_str())
        .bind(&event.dedup_key)
        .bind(&event.payload)
        .bind(&event.signature)
        .bind(event.received_at)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await.map_err(DbError::SqlxError)?;
            return Ok(IngestOutcome::Duplicate);
        }

        let platform = event.platform.as_str();
        let now = event.received_at;
        let mut applied = 0;
        let mut unmatched = 0;

        for update in updates {
            let result = match update {
                EngagementUpdate::Delta {
                    external_post_id,
                    metric,
                    delta,
                } => {
                    let column = metric.column();
                    let query = format!(
                        r#"
                        UPDATE external_references
                        SET {column} = MAX(0, {column} + ?), engagement_updated_at = ?
                        WHERE platform = ? AND external_post_id = ?
                        "#,
                        column = column
                    );
                    sqlx::query(&query)
                        .bind(delta)
                        .bind(now)
                        .bind(platform)
                        .bind(external_post_id)
                        .execute(&mut *tx)
                        .await
                }
                EngagementUpdate::Snapshot {
                    external_post_id,
                    likes,
                    comments,
                    shares,
                } => {
                    sqlx::query(
                        r#"
                        UPDATE external_references
                        SET likes = COALESCE(?, likes),
                            comments = COALESCE(?, comments),
                            shares = COALESCE(?, shares),
                            engagement_updated_at = ?
                        WHERE platform = ? AND external_post_id = ?
                        "#,
                    )
                    .bind(likes)
                    .bind(comments)
                    .bind(shares)
                    .bind(now)
                    .bind(platform)
                    .bind(external_post_id)
                    .execute(&mut *tx)
                    .await
                }
                EngagementUpdate::Removed { external_post_id } => {
                    sqlx::query(
                        r#"
                        UPDATE external_references
                        SET remote_status = 'removed', engagement_updated_at = ?
                        WHERE platform = ? AND external_post_id = ?
                        "#,
                    )
                    .bind(now)
                    .bind(platform)
                    .bind(external_post_id)
                    .execute(&mut *tx)
                    .await
                }
            }
            .map_err(DbError::SqlxError)?;

            if result.rows_affected() > 0 {
                applied += 1;
            } else {
                unmatched += 1;
            }
        }

        sqlx::query("UPDATE webhook_events SET processed_at = ? WHERE dedup_key = ?")
            .bind(now)
            .bind(&event.dedup_key)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(IngestOutcome::Processed { applied, unmatched })
    }

    pub async fn get_webhook_event(&self, dedup_key: &str) -> Result<Option<WebhookEvent>> {
        let row = sqlx::query(
            r#"
            SELECT id, platform, dedup_key, payload, signature, received_at, processed_at
            FROM webhook_events WHERE dedup_key = ?
            "#,
        )
        .bind(dedup_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let Some(r) = row else {
            return Ok(None);
        };

        Ok(Some(WebhookEvent {
            id: r.get("id"),
            platform: parse_platform(&r.get::<String, _>("platform"))?,
            dedup_key: r.get("dedup_key"),
            payload: r.get("payload"),
            signature: r.get("signature"),
            received_at: r.get("received_at"),
            processed_at: r.get("processed_at"),
        }))
    }

    pub async fn count_webhook_events(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM webhook_events")
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(row.get("n"))
    }
}

fn parse_status(s: &str) -> Result<ScheduleStatus> {
    ScheduleStatus::parse(s).ok_or_else(|| {
        DbError::Corrupt {
            column: "status",
            reason: format!("unknown status '{}'", s),
        }
        .into()
    })
}

fn parse_platform(s: &str) -> Result<Platform> {
    s.parse::<Platform>().map_err(|reason| {
        DbError::Corrupt {
            column: "platform",
            reason,
        }
        .into()
    })
}

fn parse_error_kind(s: Option<String>) -> Option<ErrorKind> {
    s.as_deref().and_then(ErrorKind::parse)
}

fn entry_from_row(r: &SqliteRow) -> Result<ScheduleEntry> {
    Ok(ScheduleEntry {
        id: r.get("id"),
        group_id: r.get("group_id"),
        content_item_id: r.get("content_item_id"),
        channel_id: r.get("channel_id"),
        scheduled_for: r.get("scheduled_for"),
        status: parse_status(&r.get::<String, _>("status"))?,
        attempt_count: r.get::<i64, _>("attempt_count") as u32,
        last_error: r.get("last_error"),
        last_error_kind: parse_error_kind(r.get("last_error_kind")),
        idempotency_key: r.get("idempotency_key"),
        claimed_by: r.get("claimed_by"),
        claimed_at: r.get("claimed_at"),
        not_before: r.get("not_before"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn status_from_row(r: &SqliteRow) -> Result<EntryStatus> {
    Ok(EntryStatus {
        entry_id: r.get("id"),
        group_id: r.get("group_id"),
        channel_id: r.get("channel_id"),
        platform: parse_platform(&r.get::<String, _>("platform"))?,
        status: parse_status(&r.get::<String, _>("status"))?,
        scheduled_for: r.get("scheduled_for"),
        attempt_count: r.get::<i64, _>("attempt_count") as u32,
        last_error: r.get("last_error"),
        last_error_kind: parse_error_kind(r.get("last_error_kind")),
        not_before: r.get("not_before"),
        external_post_id: r.get("external_post_id"),
        external_url: r.get("external_url"),
    })
}

fn reference_from_row(r: &SqliteRow) -> Result<ExternalReference> {
    let remote_status = match r.get::<String, _>("remote_status").as_str() {
        "removed" => RemoteStatus::Removed,
        _ => RemoteStatus::Live,
    };
    Ok(ExternalReference {
        id: r.get("id"),
        schedule_entry_id: r.get("schedule_entry_id"),
        platform: parse_platform(&r.get::<String, _>("platform"))?,
        external_post_id: r.get("external_post_id"),
        external_url: r.get("external_url"),
        posted_at: r.get("posted_at"),
        likes: r.get("likes"),
        comments: r.get("comments"),
        shares: r.get("shares"),
        remote_status,
        engagement_updated_at: r.get("engagement_updated_at"),
    })
}
