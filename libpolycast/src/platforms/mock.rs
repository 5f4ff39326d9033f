//! Mock publisher for testing
//!
//! Plays back a script of outcomes, one per `publish` call, then succeeds.
//! Successful posts (and "posted but the response was lost" outcomes) are
//! remembered so `find_existing` can find them, like a real platform would.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::error::PublishError;
use crate::platforms::{
    ContentConstraints, PublishRequest, PublishResult, PublishedPost, Publisher,
};
use crate::types::Platform;

/// One scripted `publish` outcome
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Success,
    /// Classified like a real adapter error
    Fail(PublishError),
    /// The post is created remotely but the caller sees an ambiguous error
    PostedButLost,
}

/// A post the mock "platform" holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockPost {
    pub external_post_id: String,
    pub text: String,
    pub idempotency_key: String,
}

pub struct MockPublisher {
    platform: Platform,
    constraints: ContentConstraints,
    script: Mutex<VecDeque<MockOutcome>>,
    supports_lookup: bool,
    delay: Duration,
    publish_calls: AtomicUsize,
    lookup_calls: AtomicUsize,
    posts: Mutex<Vec<MockPost>>,
}

impl MockPublisher {
    /// A mock that always succeeds, with the platform's default constraints
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            constraints: ContentConstraints::for_platform(platform),
            script: Mutex::new(VecDeque::new()),
            supports_lookup: false,
            delay: Duration::ZERO,
            publish_calls: AtomicUsize::new(0),
            lookup_calls: AtomicUsize::new(0),
            posts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_script(mut self, outcomes: impl IntoIterator<Item = MockOutcome>) -> Self {
        self.script = Mutex::new(outcomes.into_iter().collect());
        self
    }

    /// Script `n` consecutive failures with the same error
    pub fn failing(platform: Platform, error: PublishError, n: usize) -> Self {
        Self::new(platform).with_script(std::iter::repeat(MockOutcome::Fail(error)).take(n))
    }

    pub fn with_constraints(mut self, constraints: ContentConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_lookup(mut self) -> Self {
        self.supports_lookup = true;
        self
    }

    /// Simulated network latency for every publish
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub async fn push_outcome(&self, outcome: MockOutcome) {
        self.script.lock().await.push_back(outcome);
    }

    pub fn publish_calls(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }

    pub fn lookup_calls(&self) -> usize {
        self.lookup_calls.load(Ordering::SeqCst)
    }

    /// Posts that exist on the mock platform
    pub async fn posts(&self) -> Vec<MockPost> {
        self.posts.lock().await.clone()
    }

    async fn record_post(&self, request: &PublishRequest) -> PublishedPost {
        let mut posts = self.posts.lock().await;
        let id = format!("{}-mock-{}", self.platform.as_str(), posts.len() + 1);
        posts.push(MockPost {
            external_post_id: id.clone(),
            text: request.text(),
            idempotency_key: request.idempotency_key.clone(),
        });
        PublishedPost {
            external_url: Some(format!("https://mock.invalid/{}", id)),
            external_post_id: id,
        }
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn constraints(&self) -> &ContentConstraints {
        &self.constraints
    }

    async fn publish(&self, request: &PublishRequest) -> PublishResult {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        let outcome = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or(MockOutcome::Success);

        match outcome {
            MockOutcome::Success => PublishResult::Success(self.record_post(request).await),
            MockOutcome::Fail(error) => PublishResult::from(Err::<PublishedPost, _>(error)),
            MockOutcome::PostedButLost => {
                self.record_post(request).await;
                PublishResult::Ambiguous(PublishError::Ambiguous(
                    "Mock response lost after post was created".to_string(),
                ))
            }
        }
    }

    fn supports_lookup(&self) -> bool {
        self.supports_lookup
    }

    async fn find_existing(
        &self,
        request: &PublishRequest,
    ) -> Result<Option<PublishedPost>, PublishError> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        if !self.supports_lookup {
            return Ok(None);
        }

        let text = request.text();
        Ok(self
            .posts
            .lock()
            .await
            .iter()
            .find(|p| p.text == text)
            .map(|p| PublishedPost {
                external_post_id: p.external_post_id.clone(),
                external_url: Some(format!("https://mock.invalid/{}", p.external_post_id)),
            }))
    }
}
