//! Retry policy and the post-publish decision
//!
//! [`decide`] is a pure function of the publish outcome, the attempt count
//! and the policy; the worker only carries out what it returns.

use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;

use crate::config::Config;
use crate::error::{ErrorKind, PublishError};
use crate::platforms::{PublishResult, PublishedPost};
use crate::types::Platform;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    /// Upper bound of the uniform random delay added to every backoff
    pub jitter: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    pub max_ambiguous_retries: u32,
    platform_max_retries: HashMap<Platform, u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        let retry = &config.retry;
        let platform_max_retries = Platform::ALL
            .into_iter()
            .filter_map(|p| config.platform(p).max_retries.map(|n| (p, n)))
            .collect();

        Self {
            base_delay: Duration::from_secs(retry.base_delay_secs),
            jitter: Duration::from_secs(retry.jitter_secs),
            max_delay: Duration::from_secs(retry.max_delay_secs),
            max_retries: retry.max_retries,
            max_ambiguous_retries: retry.max_ambiguous_retries,
            platform_max_retries,
        }
    }

    pub fn with_platform_max_retries(mut self, platform: Platform, max_retries: u32) -> Self {
        self.platform_max_retries.insert(platform, max_retries);
        self
    }

    /// Attempts allowed for `kind` failures on `platform`
    pub fn ceiling(&self, platform: Platform, kind: ErrorKind) -> u32 {
        let platform_max = self
            .platform_max_retries
            .get(&platform)
            .copied()
            .unwrap_or(self.max_retries);
        if kind == ErrorKind::Ambiguous {
            platform_max.min(self.max_ambiguous_retries)
        } else {
            platform_max
        }
    }

    /// Whether `attempt_count` (already including the failed attempt) has
    /// used up the budget
    pub fn exhausted(&self, platform: Platform, kind: ErrorKind, attempt_count: u32) -> bool {
        kind.is_permanent() || attempt_count >= self.ceiling(platform, kind)
    }

    /// `base * 2^(attempt_count - 1) + random(0, jitter)`, at least
    /// `retry_after` when the platform gave one, capped at `max_delay`
    /// unless the platform asked for longer.
    pub fn backoff<R: Rng + ?Sized>(
        &self,
        attempt_count: u32,
        retry_after: Option<Duration>,
        rng: &mut R,
    ) -> Duration {
        let exponent = attempt_count.saturating_sub(1).min(31);
        let exponential = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay);

        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.gen_range(0..=jitter_ms))
        };

        let delay = exponential.saturating_add(jitter).min(self.max_delay);
        match retry_after {
            Some(wait) => delay.max(wait),
            None => delay,
        }
    }
}

/// What the worker does with an entry after a publish attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Posted(PublishedPost),
    Retry {
        attempt_count: u32,
        delay: Duration,
        error: PublishError,
    },
    Fail {
        attempt_count: u32,
        error: PublishError,
    },
}

/// Decide the next state from a publish outcome.
///
/// `attempt_count` is the count stored on the entry before this attempt.
pub fn decide<R: Rng + ?Sized>(
    result: PublishResult,
    platform: Platform,
    attempt_count: u32,
    policy: &RetryPolicy,
    rng: &mut R,
) -> Decision {
    let attempt_count = attempt_count.saturating_add(1);

    let error = match result {
        PublishResult::Success(post) => return Decision::Posted(post),
        PublishResult::Permanent(error) => {
            return Decision::Fail {
                attempt_count,
                error,
            }
        }
        PublishResult::Transient(error) | PublishResult::Ambiguous(error) => error,
    };

    // The variant, not the error, decides which ceiling applies
    let kind = error.kind();
    if policy.exhausted(platform, kind, attempt_count) {
        return Decision::Fail {
            attempt_count,
            error,
        };
    }

    Decision::Retry {
        attempt_count,
        delay: policy.backoff(attempt_count, error.retry_after(), rng),
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn policy(jitter_secs: u64) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(2),
            jitter: Duration::from_secs(jitter_secs),
            max_delay: Duration::from_secs(3600),
            max_retries: 5,
            max_ambiguous_retries: 3,
            platform_max_retries: HashMap::new(),
        }
    }

    fn network() -> PublishResult {
        PublishResult::Transient(PublishError::Network("503".into()))
    }

    #[test]
    fn test_backoff_doubles_without_jitter() {
        let policy = policy(0);
        let mut rng = StdRng::seed_from_u64(1);
        let delays: Vec<u64> = (1..=5)
            .map(|n| policy.backoff(n, None, &mut rng).as_secs())
            .collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32]);
    }

    #[test]
    fn test_backoff_bounded_by_exponential_plus_jitter() {
        let policy = policy(5);
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..=5u32 {
            for _ in 0..200 {
                let delay = policy.backoff(attempt, None, &mut rng);
                let floor = Duration::from_secs(2 * 2u64.pow(attempt - 1));
                let bound = Duration::from_secs(2 * 2u64.pow(attempt) + 5);
                assert!(delay >= floor, "attempt {}: {:?} < {:?}", attempt, delay, floor);
                assert!(delay <= bound, "attempt {}: {:?} > {:?}", attempt, delay, bound);
            }
        }
    }

    #[test]
    fn test_backoff_non_decreasing_in_expectation() {
        let policy = policy(5);
        let mut rng = StdRng::seed_from_u64(42);
        let mean = |attempt: u32, rng: &mut StdRng| {
            let total: u128 = (0..500)
                .map(|_| policy.backoff(attempt, None, rng).as_millis())
                .sum();
            total / 500
        };
        let means: Vec<u128> = (1..=5).map(|a| mean(a, &mut rng)).collect();
        assert!(means.windows(2).all(|w| w[0] <= w[1]), "{:?}", means);
    }

    #[test]
    fn test_backoff_honours_retry_after_and_cap() {
        let mut policy = policy(0);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            policy.backoff(1, Some(Duration::from_secs(90)), &mut rng),
            Duration::from_secs(90)
        );

        policy.max_delay = Duration::from_secs(10);
        assert_eq!(policy.backoff(30, None, &mut rng), Duration::from_secs(10));
        assert_eq!(policy.backoff(200, None, &mut rng), Duration::from_secs(10));
    }

    #[test]
    fn test_decide_success() {
        let post = PublishedPost {
            external_post_id: "1".into(),
            external_url: None,
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            decide(PublishResult::Success(post.clone()), Platform::Meta, 0, &policy(5), &mut rng),
            Decision::Posted(post)
        );
    }

    #[test]
    fn test_decide_permanent_fails_immediately() {
        let mut rng = StdRng::seed_from_u64(1);
        let decision = decide(
            PublishResult::Permanent(PublishError::Authentication("revoked".into())),
            Platform::Meta,
            0,
            &policy(5),
            &mut rng,
        );
        assert!(matches!(decision, Decision::Fail { attempt_count: 1, .. }));
    }

    #[test]
    fn test_decide_transient_until_ceiling() {
        let policy = policy(5);
        let mut rng = StdRng::seed_from_u64(1);

        for previous in 0..4 {
            let decision = decide(network(), Platform::Meta, previous, &policy, &mut rng);
            let expected = previous + 1;
            assert!(
                matches!(decision, Decision::Retry { attempt_count: n, .. } if n == expected),
                "attempt {} should retry",
                expected
            );
        }

        let decision = decide(network(), Platform::Meta, 4, &policy, &mut rng);
        assert!(matches!(decision, Decision::Fail { attempt_count: 5, .. }));
    }

    #[test]
    fn test_decide_ambiguous_has_lower_ceiling() {
        let policy = policy(0);
        let mut rng = StdRng::seed_from_u64(1);
        let ambiguous = || PublishResult::Ambiguous(PublishError::Ambiguous("lost".into()));

        assert!(matches!(
            decide(ambiguous(), Platform::Meta, 1, &policy, &mut rng),
            Decision::Retry { attempt_count: 2, .. }
        ));
        assert!(matches!(
            decide(ambiguous(), Platform::Meta, 2, &policy, &mut rng),
            Decision::Fail { attempt_count: 3, .. }
        ));
    }

    #[test]
    fn test_decide_rate_limit_uses_retry_after() {
        let mut rng = StdRng::seed_from_u64(1);
        let decision = decide(
            PublishResult::Transient(PublishError::RateLimit {
                message: "429".into(),
                retry_after: Some(Duration::from_secs(600)),
            }),
            Platform::LinkedIn,
            0,
            &policy(5),
            &mut rng,
        );
        match decision {
            Decision::Retry { delay, .. } => assert_eq!(delay, Duration::from_secs(600)),
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn test_platform_ceiling_override() {
        let policy = policy(0).with_platform_max_retries(Platform::GoogleBusiness, 2);
        assert_eq!(policy.ceiling(Platform::GoogleBusiness, ErrorKind::Network), 2);
        assert_eq!(policy.ceiling(Platform::Meta, ErrorKind::Network), 5);
        assert_eq!(policy.ceiling(Platform::GoogleBusiness, ErrorKind::Ambiguous), 2);
        assert!(policy.exhausted(Platform::Meta, ErrorKind::Auth, 0));
    }

    #[test]
    fn test_from_config() {
        let config = Config::from_toml(
            r#"
            [retry]
            base_delay_secs = 3
            max_retries = 7

            [platforms.linkedin]
            max_retries = 2
            "#,
        )
        .unwrap();
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.base_delay, Duration::from_secs(3));
        assert_eq!(policy.ceiling(Platform::Meta, ErrorKind::Network), 7);
        assert_eq!(policy.ceiling(Platform::LinkedIn, ErrorKind::RateLimit), 2);
    }
}
