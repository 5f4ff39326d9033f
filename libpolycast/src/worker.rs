//! Dispatch worker
//!
//! Takes one claimed schedule entry through a publish attempt:
//!
//! 1. load the content item, channel and organization
//! 2. pick the adapter and run pre-flight validation
//! 3. wait (briefly) for a rate-limit token, or give the entry back
//! 4. resolve the credential and move the entry to `publishing`
//! 5. on a previously ambiguous attempt, check whether the post already exists
//! 6. publish, classify the outcome and record the decision
//!
//! Every write is guarded on the lease, so a worker that was reaped while it
//! was busy finds out at its next write and stops.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::credentials::{CredentialResolver, StoredCredentialResolver};
use crate::db::Database;
use crate::error::{ErrorKind, PublishError, Result};
use crate::platforms::registry::PublisherRegistry;
use crate::platforms::{PublishRequest, PublishResult, PublishedPost, Publisher};
use crate::rate_limiter::{Admission, RateLimiter};
use crate::retry::{decide, Decision, RetryPolicy};
use crate::service::events::{Event, EventBus};
use crate::types::{
    Channel, ContentItem, ExternalReference, Platform, ScheduleEntry, ScheduleStatus,
};

/// How a dispatch attempt ended, from this worker's point of view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Posted {
        external_post_id: String,
        /// The post already existed; nothing new was published
        recovered: bool,
    },
    Retrying {
        attempt_count: u32,
        not_before: i64,
    },
    /// Released without an attempt
    Deferred { not_before: i64 },
    Failed { kind: ErrorKind, attempt_count: u32 },
    /// Another worker or the reaper owns the entry now
    LeaseLost,
}

struct DispatchContext {
    entry: ScheduleEntry,
    content: ContentItem,
    channel: Channel,
    publisher: Arc<dyn Publisher>,
}

pub struct DispatchWorker {
    db: Database,
    registry: PublisherRegistry,
    rate_limiter: Arc<RateLimiter>,
    credentials: Arc<dyn CredentialResolver>,
    policy: RetryPolicy,
    events: EventBus,
    worker_id: String,
    rate_limit_deadline: Duration,
    publish_timeout: Duration,
}

impl DispatchWorker {
    pub fn new(
        db: Database,
        registry: PublisherRegistry,
        rate_limiter: Arc<RateLimiter>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            db,
            registry,
            rate_limiter,
            credentials: Arc::new(StoredCredentialResolver),
            policy: RetryPolicy::default(),
            events: EventBus::default(),
            worker_id: worker_id.into(),
            rate_limit_deadline: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(20),
        }
    }

    /// Worker with retry, timeout and identity settings taken from `config`
    pub fn from_config(
        config: &Config,
        db: Database,
        registry: PublisherRegistry,
        rate_limiter: Arc<RateLimiter>,
        events: EventBus,
    ) -> Self {
        Self::new(db, registry, rate_limiter, config.scheduler.resolve_worker_id())
            .with_policy(RetryPolicy::from_config(config))
            .with_events(events)
            .with_rate_limit_deadline(config.scheduler.rate_limit_deadline())
            .with_publish_timeout(config.scheduler.publish_timeout())
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialResolver>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_rate_limit_deadline(mut self, deadline: Duration) -> Self {
        self.rate_limit_deadline = deadline;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run one attempt for an entry this worker has claimed.
    ///
    /// Errors are store failures only; every publish outcome is recorded on
    /// the entry and reported through [`DispatchOutcome`].
    pub async fn dispatch(&self, entry_id: &str) -> Result<DispatchOutcome> {
        let Some(entry) = self.db.get_entry(entry_id).await? else {
            tracing::warn!(entry = entry_id, "Claimed entry vanished");
            return Ok(DispatchOutcome::LeaseLost);
        };
        if entry.status != ScheduleStatus::Claimed
            || entry.claimed_by.as_deref() != Some(self.worker_id.as_str())
        {
            return Ok(DispatchOutcome::LeaseLost);
        }

        let ctx = match self.load_context(entry).await? {
            Ok(ctx) => ctx,
            Err((entry, reason)) => {
                return self
                    .fail_without_attempt(&entry, ErrorKind::Precondition, &reason)
                    .await
            }
        };
        let platform = ctx.channel.platform;

        tracing::info!(
            entry = %ctx.entry.id,
            platform = %platform,
            channel = %ctx.channel.id,
            attempt = ctx.entry.attempt_count + 1,
            "Dispatching entry"
        );

        // A previous owner may have posted and recorded the reference before
        // losing its lease
        if let Some(reference) = self.db.get_external_reference(&ctx.entry.id).await? {
            if !self.db.begin_publishing(&ctx.entry.id, &self.worker_id, now()).await? {
                return Ok(DispatchOutcome::LeaseLost);
            }
            let post = PublishedPost {
                external_post_id: reference.external_post_id,
                external_url: reference.external_url,
            };
            return self.complete(&ctx.entry, platform, post, true).await;
        }

        let validation = ctx.publisher.validate(&ctx.content);
        for warning in &validation.warnings {
            tracing::warn!(entry = %ctx.entry.id, platform = %platform, "{}", warning);
        }
        if let Err(error) = validation.into_result() {
            return self
                .fail_without_attempt(&ctx.entry, ErrorKind::Validation, &error.to_string())
                .await;
        }

        let admission = self
            .rate_limiter
            .acquire_blocking(platform, &ctx.channel.account_ref, self.rate_limit_deadline)
            .await?;
        if let Admission::Denied { retry_after } = admission {
            return self.defer(&ctx.entry, retry_after).await;
        }

        let credential = match self.credentials.resolve(&ctx.channel).await {
            Ok(credential) => credential,
            Err(e) => {
                let result = PublishResult::from(Err::<PublishedPost, _>(PublishError::from(e)));
                return self.record(&ctx.entry, platform, result).await;
            }
        };

        if !self.db.begin_publishing(&ctx.entry.id, &self.worker_id, now()).await? {
            return Ok(DispatchOutcome::LeaseLost);
        }

        let request = PublishRequest {
            entry_id: ctx.entry.id.clone(),
            idempotency_key: ctx.entry.idempotency_key.clone(),
            content: ctx.content.clone(),
            account_ref: ctx.channel.account_ref.clone(),
            settings: ctx.channel.settings.clone(),
            credential,
        };

        if ctx.entry.last_error_kind == Some(ErrorKind::Ambiguous)
            && ctx.publisher.supports_lookup()
        {
            match self.lookup(&ctx, &request).await {
                Ok(Some(post)) => return self.complete(&ctx.entry, platform, post, true).await,
                Ok(None) => {
                    tracing::debug!(entry = %ctx.entry.id, "No earlier post found; publishing");
                }
                Err(e) => {
                    // Still unknown whether the earlier attempt landed
                    let result = PublishResult::Ambiguous(PublishError::Ambiguous(format!(
                        "post lookup failed: {}",
                        e
                    )));
                    return self.record(&ctx.entry, platform, result).await;
                }
            }
        }

        let publish = ctx.publisher.publish(&request);
        let result = match tokio::time::timeout(self.publish_timeout, publish).await {
            Ok(result) => result,
            Err(_) => PublishResult::Ambiguous(PublishError::Ambiguous(format!(
                "{} publish timed out after {}s",
                platform.display_name(),
                self.publish_timeout.as_secs()
            ))),
        };

        self.record(&ctx.entry, platform, result).await
    }

    /// Load collaborators; the error side carries the entry and the reason
    /// it cannot be dispatched
    async fn load_context(
        &self,
        entry: ScheduleEntry,
    ) -> Result<std::result::Result<DispatchContext, (ScheduleEntry, String)>> {
        let Some(content) = self.db.get_content_item(&entry.content_item_id).await? else {
            let reason = format!("content item {} not found", entry.content_item_id);
            return Ok(Err((entry, reason)));
        };
        let Some(channel) = self.db.get_channel(&entry.channel_id).await? else {
            let reason = format!("channel {} not found", entry.channel_id);
            return Ok(Err((entry, reason)));
        };

        match self.db.get_organization(&channel.organization_id).await? {
            Some(org) if org.enabled => {}
            Some(org) => {
                let reason = format!("organization {} is disabled", org.id);
                return Ok(Err((entry, reason)));
            }
            None => {
                let reason = format!("organization {} not found", channel.organization_id);
                return Ok(Err((entry, reason)));
            }
        }

        let Some(publisher) = self.registry.get(channel.platform) else {
            let reason = format!("no publisher enabled for {}", channel.platform.display_name());
            return Ok(Err((entry, reason)));
        };

        Ok(Ok(DispatchContext {
            entry,
            content,
            channel,
            publisher,
        }))
    }

    async fn lookup(
        &self,
        ctx: &DispatchContext,
        request: &PublishRequest,
    ) -> std::result::Result<Option<PublishedPost>, PublishError> {
        tracing::info!(
            entry = %ctx.entry.id,
            platform = %ctx.channel.platform,
            "Previous attempt was ambiguous; checking for an existing post"
        );
        let lookup = ctx.publisher.find_existing(request);
        match tokio::time::timeout(self.publish_timeout, lookup).await {
            Ok(found) => found,
            Err(_) => Err(PublishError::Network("post lookup timed out".to_string())),
        }
    }

    async fn record(
        &self,
        entry: &ScheduleEntry,
        platform: Platform,
        result: PublishResult,
    ) -> Result<DispatchOutcome> {
        let decision = {
            let mut rng = rand::thread_rng();
            decide(result, platform, entry.attempt_count, &self.policy, &mut rng)
        };

        match decision {
            Decision::Posted(post) => self.complete(entry, platform, post, false).await,
            Decision::Retry {
                attempt_count,
                delay,
                error,
            } => {
                let now = now();
                let not_before = now + ceil_secs(delay);
                let kind = error.kind();
                let moved = self
                    .db
                    .retry_entry(
                        &entry.id,
                        &self.worker_id,
                        attempt_count,
                        not_before,
                        &error.to_string(),
                        kind,
                        now,
                    )
                    .await?;
                if !moved {
                    return Ok(DispatchOutcome::LeaseLost);
                }

                tracing::warn!(
                    entry = %entry.id,
                    platform = %platform,
                    attempt = attempt_count,
                    kind = kind.as_str(),
                    retry_in_secs = delay.as_secs(),
                    "Publish failed, will retry: {}",
                    error
                );
                self.events.emit(Event::EntryRetrying {
                    entry_id: entry.id.clone(),
                    attempt_count,
                    error_kind: kind.as_str().to_string(),
                    not_before,
                });
                Ok(DispatchOutcome::Retrying {
                    attempt_count,
                    not_before,
                })
            }
            Decision::Fail {
                attempt_count,
                error,
            } => {
                self.fail(entry, attempt_count, error.kind(), &error.to_string())
                    .await
            }
        }
    }

    async fn complete(
        &self,
        entry: &ScheduleEntry,
        platform: Platform,
        post: PublishedPost,
        recovered: bool,
    ) -> Result<DispatchOutcome> {
        let now = now();
        let reference = ExternalReference::new(
            entry.id.clone(),
            platform,
            post.external_post_id.clone(),
            post.external_url,
            now,
        );

        if !self.db.complete_entry(&self.worker_id, &reference, now).await? {
            tracing::warn!(
                entry = %entry.id,
                post = %post.external_post_id,
                "Posted but the lease was lost; reference kept for the next owner"
            );
            return Ok(DispatchOutcome::LeaseLost);
        }

        tracing::info!(
            entry = %entry.id,
            platform = %platform,
            post = %post.external_post_id,
            recovered,
            "Entry posted"
        );
        self.events.emit(Event::EntryPosted {
            entry_id: entry.id.clone(),
            platform: platform.as_str().to_string(),
            external_post_id: post.external_post_id.clone(),
            recovered,
        });
        Ok(DispatchOutcome::Posted {
            external_post_id: post.external_post_id,
            recovered,
        })
    }

    async fn defer(&self, entry: &ScheduleEntry, retry_after: Duration) -> Result<DispatchOutcome> {
        let now = now();
        let not_before = now + ceil_secs(retry_after);
        if !self
            .db
            .release_entry(&entry.id, &self.worker_id, not_before, now)
            .await?
        {
            return Ok(DispatchOutcome::LeaseLost);
        }

        tracing::info!(
            entry = %entry.id,
            retry_after_ms = retry_after.as_millis() as u64,
            "Rate limited; entry deferred"
        );
        self.events.emit(Event::EntryDeferred {
            entry_id: entry.id.clone(),
            not_before,
            reason: "rate limited".to_string(),
        });
        Ok(DispatchOutcome::Deferred { not_before })
    }

    /// Pre-flight failures never reached the platform and don't use up an attempt
    async fn fail_without_attempt(
        &self,
        entry: &ScheduleEntry,
        kind: ErrorKind,
        reason: &str,
    ) -> Result<DispatchOutcome> {
        self.fail(entry, entry.attempt_count, kind, reason).await
    }

    async fn fail(
        &self,
        entry: &ScheduleEntry,
        attempt_count: u32,
        kind: ErrorKind,
        reason: &str,
    ) -> Result<DispatchOutcome> {
        if !self
            .db
            .fail_entry(&entry.id, &self.worker_id, attempt_count, reason, kind, now())
            .await?
        {
            return Ok(DispatchOutcome::LeaseLost);
        }

        tracing::error!(
            entry = %entry.id,
            attempt = attempt_count,
            kind = kind.as_str(),
            "Entry failed: {}",
            reason
        );
        self.events.emit(Event::EntryFailed {
            entry_id: entry.id.clone(),
            attempt_count,
            error_kind: kind.as_str().to_string(),
            error: reason.to_string(),
        });
        Ok(DispatchOutcome::Failed {
            kind,
            attempt_count,
        })
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn ceil_secs(delay: Duration) -> i64 {
    let secs = delay.as_secs() as i64;
    if delay.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}
