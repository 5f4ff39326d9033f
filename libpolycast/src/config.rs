//! Configuration management for Polycast
//!
//! Configuration is read from a TOML file. Every field has a default, so a
//! missing file yields a runnable configuration (no webhook secrets, though,
//! which `poly-hooks` refuses to start without).
//!
//! ```toml
//! [database]
//! path = "~/.local/share/polycast/polycast.db"
//!
//! [scheduler]
//! poll_interval_secs = 15
//! lease_timeout_secs = 300
//!
//! [retry]
//! base_delay_secs = 2
//! jitter_secs = 5
//! max_retries = 5
//!
//! [platforms.meta]
//! webhook_secret = "..."
//! verify_token = "..."
//! rate_limit = { capacity = 200, per_secs = 3600 }
//! ```

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::types::Platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub webhooks: WebhookConfig,
    pub platforms: PlatformsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "~/.local/share/polycast/polycast.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between polls for due entries
    pub poll_interval_secs: u64,
    /// Seconds between lease reaper passes
    pub reap_interval_secs: u64,
    /// Seconds a claim is honoured before the reaper takes it back
    pub lease_timeout_secs: u64,
    /// Maximum entries claimed per tick
    pub batch_size: u32,
    /// Maximum entries dispatched concurrently by one process
    pub concurrency: usize,
    /// Identifier written to `claimed_by`; generated when unset
    pub worker_id: Option<String>,
    /// How long a worker waits for a rate-limit token before deferring
    pub rate_limit_deadline_secs: u64,
    /// Per-call timeout for the outbound publish request
    pub publish_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 15,
            reap_interval_secs: 60,
            lease_timeout_secs: 300,
            batch_size: 50,
            concurrency: 4,
            worker_id: None,
            rate_limit_deadline_secs: 5,
            publish_timeout_secs: 20,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    pub fn rate_limit_deadline(&self) -> Duration {
        Duration::from_secs(self.rate_limit_deadline_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs.max(1))
    }

    /// Configured worker id, or one unique to this process
    pub fn resolve_worker_id(&self) -> String {
        match &self.worker_id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => {
                let suffix = uuid::Uuid::new_v4().simple().to_string();
                format!("worker-{}-{}", std::process::id(), &suffix[..8])
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_secs: u64,
    pub jitter_secs: u64,
    pub max_delay_secs: u64,
    pub max_retries: u32,
    pub max_ambiguous_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 2,
            jitter_secs: 5,
            max_delay_secs: 3600,
            max_retries: 5,
            max_ambiguous_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Socket address the webhook server listens on
    pub bind: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformsConfig {
    pub meta: PlatformConfig,
    pub linkedin: PlatformConfig,
    pub google_business: PlatformConfig,
}

/// Per-platform settings. Unset values fall back to the platform defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub enabled: bool,
    pub api_base: Option<String>,
    #[serde(skip_serializing)]
    pub webhook_secret: Option<SecretString>,
    /// Meta subscription handshake token
    #[serde(skip_serializing)]
    pub verify_token: Option<SecretString>,
    pub rate_limit: Option<RateLimitConfig>,
    pub max_chars: Option<usize>,
    pub max_media: Option<usize>,
    pub hashtag_warning: Option<usize>,
    pub max_retries: Option<u32>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_base: None,
            webhook_secret: None,
            verify_token: None,
            rate_limit: None,
            max_chars: None,
            max_media: None,
            hashtag_warning: None,
            max_retries: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Bucket size (maximum burst)
    pub capacity: u32,
    /// Seconds to refill the whole bucket
    pub per_secs: u64,
}

impl RateLimitConfig {
    /// Published API budgets used when nothing is configured
    pub fn default_for(platform: Platform) -> Self {
        let capacity = match platform {
            Platform::Meta => 200,
            Platform::LinkedIn => 100,
            Platform::GoogleBusiness => 1000,
        };
        Self {
            capacity,
            per_secs: 3600,
        }
    }
}

impl Config {
    /// Load configuration from the default location
    ///
    /// A missing file is not an error: defaults are returned instead.
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        if !config_path.exists() {
            tracing::debug!(
                path = %config_path.display(),
                "No configuration file found, using defaults"
            );
            return Ok(Self::default());
        }
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.scheduler.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.concurrency".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        if self.scheduler.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.batch_size".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        for platform in Platform::ALL {
            if let Some(limit) = self.platform(platform).rate_limit {
                if limit.capacity == 0 || limit.per_secs == 0 {
                    return Err(ConfigError::InvalidValue {
                        field: format!("platforms.{}.rate_limit", platform),
                        reason: "capacity and per_secs must be positive".to_string(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    pub fn platform(&self, platform: Platform) -> &PlatformConfig {
        match platform {
            Platform::Meta => &self.platforms.meta,
            Platform::LinkedIn => &self.platforms.linkedin,
            Platform::GoogleBusiness => &self.platforms.google_business,
        }
    }

    pub fn enabled_platforms(&self) -> Vec<Platform> {
        Platform::ALL
            .into_iter()
            .filter(|p| self.platform(*p).enabled)
            .collect()
    }

    /// Effective token-bucket settings for every platform
    pub fn rate_limits(&self) -> HashMap<Platform, RateLimitConfig> {
        Platform::ALL
            .into_iter()
            .map(|p| {
                let limit = self
                    .platform(p)
                    .rate_limit
                    .unwrap_or_else(|| RateLimitConfig::default_for(p));
                (p, limit)
            })
            .collect()
    }

    /// Webhook secrets for the platforms that have one configured
    pub fn webhook_secrets(&self) -> HashMap<Platform, SecretString> {
        Platform::ALL
            .into_iter()
            .filter_map(|p| {
                self.platform(p)
                    .webhook_secret
                    .as_ref()
                    .filter(|s| !s.expose_secret().is_empty())
                    .map(|s| (p, s.clone()))
            })
            .collect()
    }
}

/// Resolve the configuration file path (XDG config directory by default)
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("POLYCAST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("polycast").join("config.toml"))
}

/// Resolve the database path
///
/// Precedence: `POLYCAST_DB_PATH`, then the configured path, then the XDG
/// data directory.
pub fn resolve_db_path(configured: Option<&str>) -> Result<PathBuf> {
    if let Ok(path) = std::env::var("POLYCAST_DB_PATH") {
        if !path.is_empty() {
            return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
        }
    }

    if let Some(path) = configured {
        return Ok(PathBuf::from(shellexpand::tilde(path).to_string()));
    }

    let data_dir = dirs::data_dir()
        .ok_or_else(|| ConfigError::MissingField("data directory".to_string()))?;

    Ok(data_dir.join("polycast").join("polycast.db"))
}
