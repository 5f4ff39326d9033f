//! Poller and lease reaper
//!
//! Each tick claims due entries with the store's compare-and-swap and runs
//! the claimed ones through the [`DispatchWorker`] with bounded concurrency.
//! Any number of schedulers may share one database; the claim is the only
//! point where they contend.

use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::config::SchedulerConfig;
use crate::error::{ErrorKind, Result};
use crate::service::events::Event;
use crate::types::ScheduleStatus;
use crate::worker::{DispatchOutcome, DispatchWorker};

/// What one poll tick did
#[derive(Debug, Default)]
pub struct TickReport {
    /// Entries the query found due
    pub due: usize,
    /// Entries this scheduler won the claim on
    pub claimed: usize,
    pub outcomes: Vec<(String, DispatchOutcome)>,
    /// Dispatches that hit a store error
    pub errors: usize,
}

impl TickReport {
    pub fn posted(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, DispatchOutcome::Posted { .. }))
            .count()
    }
}

/// What one reaper pass did
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub requeued: usize,
    pub failed: usize,
    /// Leases that changed hands between the scan and the update
    pub skipped: usize,
    pub pruned_buckets: u64,
}

pub struct Scheduler {
    worker: Arc<DispatchWorker>,
    batch_size: u32,
    concurrency: usize,
    poll_interval: Duration,
    reap_interval: Duration,
    lease_timeout: Duration,
}

impl Scheduler {
    pub fn new(worker: Arc<DispatchWorker>, config: &SchedulerConfig) -> Self {
        Self {
            worker,
            batch_size: config.batch_size.max(1),
            concurrency: config.concurrency.max(1),
            poll_interval: config.poll_interval(),
            reap_interval: config.reap_interval(),
            lease_timeout: config.lease_timeout(),
        }
    }

    pub fn worker(&self) -> &DispatchWorker {
        &self.worker
    }

    /// Claim and dispatch everything due right now.
    ///
    /// An entry is claimed only once a dispatch slot is free for it, so a
    /// lease never ages while the entry waits behind the rest of the batch.
    pub async fn tick(&self) -> Result<TickReport> {
        let db = self.worker.database();
        let due = db
            .due_entry_ids(chrono::Utc::now().timestamp(), self.batch_size)
            .await?;
        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        tracing::info!(due = report.due, "Dispatching due entries");

        let results: Vec<_> = stream::iter(due)
            .map(|id| async move {
                let outcome = self.claim_and_dispatch(&id).await;
                (id, outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (id, outcome) in results {
            match outcome {
                Ok(Some(outcome)) => {
                    report.claimed += 1;
                    report.outcomes.push((id, outcome));
                }
                Ok(None) => {}
                Err(e) => {
                    // The entry keeps its lease; the reaper will recover it
                    tracing::error!(entry = %id, "Dispatch aborted: {}", e);
                    report.errors += 1;
                }
            }
        }

        tracing::info!(
            due = report.due,
            claimed = report.claimed,
            posted = report.posted(),
            "Tick finished"
        );
        Ok(report)
    }

    /// `None` when another scheduler won the claim
    async fn claim_and_dispatch(&self, id: &str) -> Result<Option<DispatchOutcome>> {
        let worker_id = self.worker.worker_id();
        let now = chrono::Utc::now().timestamp();
        if !self.worker.database().claim_entry(id, worker_id, now).await? {
            tracing::debug!(entry = %id, "Claim lost to another scheduler");
            return Ok(None);
        }
        self.worker.events().emit(Event::EntryClaimed {
            entry_id: id.to_string(),
            worker_id: worker_id.to_string(),
        });
        self.worker.dispatch(id).await.map(Some)
    }

    /// Take back leases older than the lease timeout.
    ///
    /// Counts an attempt for each. Entries reaped from `publishing` are
    /// marked ambiguous so the next owner checks for an existing post first.
    pub async fn reap(&self) -> Result<ReapReport> {
        let db = self.worker.database();
        let policy = self.worker.policy();
        let now = chrono::Utc::now().timestamp();
        let cutoff = now - self.lease_timeout.as_secs() as i64;

        let mut report = ReapReport::default();
        for leased in db.expired_leases(cutoff, self.batch_size).await? {
            let entry = &leased.entry;
            let kind = if entry.status == ScheduleStatus::Publishing
                || entry.last_error_kind == Some(ErrorKind::Ambiguous)
            {
                ErrorKind::Ambiguous
            } else {
                ErrorKind::LeaseExpired
            };
            let attempt_count = entry.attempt_count + 1;
            let next = if policy.exhausted(leased.platform, kind, attempt_count) {
                ScheduleStatus::Failed
            } else {
                ScheduleStatus::Pending
            };
            let error = format!(
                "lease held by {} expired while {}",
                entry.claimed_by.as_deref().unwrap_or("unknown worker"),
                entry.status
            );

            if !db
                .reap_entry(entry, next, attempt_count, &error, kind, now)
                .await?
            {
                report.skipped += 1;
                continue;
            }

            tracing::warn!(
                entry = %entry.id,
                previous_owner = entry.claimed_by.as_deref().unwrap_or("-"),
                from = %entry.status,
                to = %next,
                attempt = attempt_count,
                "Reaped expired lease"
            );
            self.worker.events().emit(Event::LeaseReaped {
                entry_id: entry.id.clone(),
                previous_owner: entry.claimed_by.clone(),
                failed: next == ScheduleStatus::Failed,
            });
            if next == ScheduleStatus::Failed {
                report.failed += 1;
            } else {
                report.requeued += 1;
            }
        }

        report.pruned_buckets = self
            .worker
            .rate_limiter()
            .prune_idle(chrono::Utc::now().timestamp_millis())
            .await?;

        Ok(report)
    }

    /// Poll until `shutdown` is set. The in-flight batch always finishes.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) -> Result<()> {
        tracing::info!(
            worker = self.worker.worker_id(),
            poll_secs = self.poll_interval.as_secs(),
            reap_secs = self.reap_interval.as_secs(),
            "Scheduler started"
        );

        let mut last_reap: Option<Instant> = None;
        loop {
            if shutdown.load(Ordering::Relaxed) {
                tracing::info!("Shutdown requested, stopping scheduler loop");
                break;
            }

            if last_reap.map_or(true, |at| at.elapsed() >= self.reap_interval) {
                match self.reap().await {
                    Ok(report) if report.requeued + report.failed > 0 => {
                        tracing::info!(
                            requeued = report.requeued,
                            failed = report.failed,
                            "Reaper pass finished"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("Reaper pass failed: {}", e),
                }
                last_reap = Some(Instant::now());
            }

            if let Err(e) = self.tick().await {
                tracing::error!("Error polling due entries: {}", e);
            }

            // Sleep in short slices so a signal is noticed promptly
            let wake_at = Instant::now() + self.poll_interval;
            while Instant::now() < wake_at {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let slice = wake_at
                    .saturating_duration_since(Instant::now())
                    .min(Duration::from_millis(250));
                sleep(slice).await;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::error::PublishError;
    use crate::platforms::mock::{MockOutcome, MockPublisher};
    use crate::platforms::registry::PublisherRegistry;
    use crate::rate_limiter::RateLimiter;
    use crate::types::{Channel, ChannelSettings, ContentItem, Organization, Platform};
    use secrecy::SecretString;
    use std::collections::HashMap;
    use tempfile::TempDir;

    async fn setup_test_db() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
        (temp_dir, db)
    }

    async fn seed(db: &Database, scheduled_for: i64) -> Vec<String> {
        seed_channels(db, scheduled_for, 3).await
    }

    async fn seed_channels(db: &Database, scheduled_for: i64, count: usize) -> Vec<String> {
        db.upsert_organization(&Organization {
            id: "org-1".into(),
            name: "Acme".into(),
            enabled: true,
        })
        .await
        .unwrap();
        let item = ContentItem::new("Weekly update");
        db.upsert_content_item(&item).await.unwrap();

        let mut channels = Vec::new();
        for i in 0..count {
            let id = format!("ch-{}", i);
            db.upsert_channel(&Channel {
                id: id.clone(),
                organization_id: "org-1".into(),
                platform: Platform::Meta,
                account_ref: format!("page-{}", i),
                credential: SecretString::from("token".to_string()),
                settings: ChannelSettings::default(),
                created_at: 0,
            })
            .await
            .unwrap();
            channels.push(id);
        }

        let now = chrono::Utc::now().timestamp();
        db.create_schedule_entries(&item.id, &channels, scheduled_for, now)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect()
    }

    fn scheduler(db: &Database, publisher: Arc<MockPublisher>, worker_id: &str) -> Scheduler {
        let config = SchedulerConfig {
            lease_timeout_secs: 0,
            ..SchedulerConfig::default()
        };
        scheduler_with(db, publisher, worker_id, &config)
    }

    fn scheduler_with(
        db: &Database,
        publisher: Arc<MockPublisher>,
        worker_id: &str,
        config: &SchedulerConfig,
    ) -> Scheduler {
        let mut registry = PublisherRegistry::new();
        registry.register(publisher);
        let worker = DispatchWorker::new(
            db.clone(),
            registry,
            Arc::new(RateLimiter::in_memory(HashMap::new())),
            worker_id,
        );
        Scheduler::new(Arc::new(worker), config)
    }

    #[tokio::test]
    async fn test_tick_dispatches_due_entries() {
        let (_temp, db) = setup_test_db().await;
        let now = chrono::Utc::now().timestamp();
        let ids = seed(&db, now - 5).await;
        let publisher = Arc::new(MockPublisher::new(Platform::Meta));
        let scheduler = scheduler(&db, publisher.clone(), "w1");

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.due, 3);
        assert_eq!(report.claimed, 3);
        assert_eq!(report.posted(), 3);
        assert_eq!(publisher.publish_calls(), 3);

        for id in ids {
            assert_eq!(
                db.get_entry(&id).await.unwrap().unwrap().status,
                ScheduleStatus::Posted
            );
        }

        let second = scheduler.tick().await.unwrap();
        assert_eq!(second.due, 0);
    }

    #[tokio::test]
    async fn test_tick_ignores_future_entries() {
        let (_temp, db) = setup_test_db().await;
        let now = chrono::Utc::now().timestamp();
        seed(&db, now + 3600).await;
        let publisher = Arc::new(MockPublisher::new(Platform::Meta));
        let scheduler = scheduler(&db, publisher.clone(), "w1");

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.due, 0);
        assert_eq!(publisher.publish_calls(), 0);
    }

    #[tokio::test]
    async fn test_one_channel_failing_does_not_block_others() {
        let (_temp, db) = setup_test_db().await;
        let now = chrono::Utc::now().timestamp();
        seed(&db, now - 5).await;
        let publisher = Arc::new(MockPublisher::new(Platform::Meta).with_script([
            MockOutcome::Fail(PublishError::ContentPolicy("spam".into())),
        ]));
        let scheduler = scheduler(&db, publisher, "w1");

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.posted(), 2);
        assert_eq!(
            report
                .outcomes
                .iter()
                .filter(|(_, o)| matches!(o, DispatchOutcome::Failed { .. }))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_queued_batch_outlives_lease_timeout_without_reaping() {
        let (_temp, db) = setup_test_db().await;
        let now = chrono::Utc::now().timestamp();
        let ids = seed_channels(&db, now - 5, 8).await;

        // Eight half-second publishes one at a time take four seconds,
        // twice the lease timeout
        let config = SchedulerConfig {
            batch_size: 8,
            concurrency: 1,
            lease_timeout_secs: 2,
            ..SchedulerConfig::default()
        };
        let publisher =
            Arc::new(MockPublisher::new(Platform::Meta).with_delay(Duration::from_millis(500)));
        let busy = scheduler_with(&db, publisher.clone(), "busy", &config);
        let reaper = scheduler_with(
            &db,
            Arc::new(MockPublisher::new(Platform::Meta)),
            "reaper",
            &config,
        );

        let done = AtomicBool::new(false);
        let (report, reaped) = tokio::join!(
            async {
                let report = busy.tick().await.unwrap();
                done.store(true, Ordering::Relaxed);
                report
            },
            async {
                let mut reaped = 0;
                while !done.load(Ordering::Relaxed) {
                    let pass = reaper.reap().await.unwrap();
                    reaped += pass.requeued + pass.failed;
                    sleep(Duration::from_millis(200)).await;
                }
                reaped
            }
        );

        assert_eq!(reaped, 0);
        assert_eq!(report.claimed, 8);
        assert_eq!(report.posted(), 8);
        assert_eq!(publisher.publish_calls(), 8);
        for id in ids {
            let entry = db.get_entry(&id).await.unwrap().unwrap();
            assert_eq!(entry.status, ScheduleStatus::Posted);
            assert_eq!(entry.attempt_count, 0);
        }
    }

    #[tokio::test]
    async fn test_reaper_requeues_claimed_and_marks_publishing_ambiguous() {
        let (_temp, db) = setup_test_db().await;
        let now = chrono::Utc::now().timestamp();
        let ids = seed(&db, now - 1000).await;

        // A worker that died: one entry claimed, one mid-publish
        assert!(db.claim_entry(&ids[0], "dead", now - 600).await.unwrap());
        assert!(db.claim_entry(&ids[1], "dead", now - 600).await.unwrap());
        assert!(db.begin_publishing(&ids[1], "dead", now - 600).await.unwrap());

        let publisher = Arc::new(MockPublisher::new(Platform::Meta));
        let scheduler = scheduler(&db, publisher, "w1");
        let report = scheduler.reap().await.unwrap();
        assert_eq!(report.requeued, 2);
        assert_eq!(report.failed, 0);

        let claimed = db.get_entry(&ids[0]).await.unwrap().unwrap();
        assert_eq!(claimed.status, ScheduleStatus::Pending);
        assert_eq!(claimed.attempt_count, 1);
        assert_eq!(claimed.last_error_kind, Some(ErrorKind::LeaseExpired));
        assert_eq!(claimed.claimed_by, None);

        let publishing = db.get_entry(&ids[1]).await.unwrap().unwrap();
        assert_eq!(publishing.status, ScheduleStatus::Pending);
        assert_eq!(publishing.last_error_kind, Some(ErrorKind::Ambiguous));

        // Untouched entry stays pending with no attempt counted
        let untouched = db.get_entry(&ids[2]).await.unwrap().unwrap();
        assert_eq!(untouched.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_reaper_fails_at_ambiguous_ceiling() {
        let (_temp, db) = setup_test_db().await;
        let now = chrono::Utc::now().timestamp();
        let ids = seed(&db, now - 1000).await;

        // Two ambiguous attempts already used up
        assert!(db.claim_entry(&ids[0], "w0", now).await.unwrap());
        assert!(db.begin_publishing(&ids[0], "w0", now).await.unwrap());
        assert!(db
            .retry_entry(&ids[0], "w0", 2, now - 1000, "lost", ErrorKind::Ambiguous, now)
            .await
            .unwrap());

        assert!(db.claim_entry(&ids[0], "dead", now - 600).await.unwrap());
        assert!(db.begin_publishing(&ids[0], "dead", now - 600).await.unwrap());

        let scheduler = scheduler(&db, Arc::new(MockPublisher::new(Platform::Meta)), "w1");
        let report = scheduler.reap().await.unwrap();
        assert_eq!(report.failed, 1);

        let entry = db.get_entry(&ids[0]).await.unwrap().unwrap();
        assert_eq!(entry.status, ScheduleStatus::Failed);
        assert_eq!(entry.attempt_count, 3);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_temp, db) = setup_test_db().await;
        let now = chrono::Utc::now().timestamp();
        seed(&db, now - 5).await;
        let publisher = Arc::new(MockPublisher::new(Platform::Meta));
        let scheduler = scheduler(&db, publisher.clone(), "w1");

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(300)).await;
            flag.store(true, Ordering::Relaxed);
        });

        tokio::time::timeout(Duration::from_secs(5), scheduler.run(shutdown))
            .await
            .expect("scheduler should stop after shutdown")
            .unwrap();
        assert_eq!(publisher.publish_calls(), 3);
    }
}
