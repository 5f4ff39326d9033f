//! Adapter lookup by platform

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{ConfigError, Result};
use crate::platforms::google_business::GoogleBusinessPublisher;
use crate::platforms::http::build_client;
use crate::platforms::linkedin::LinkedInPublisher;
use crate::platforms::meta::MetaPublisher;
use crate::platforms::{ContentConstraints, Publisher};
use crate::types::Platform;

/// Publishers keyed by the closed platform set, built once at startup
#[derive(Clone, Default)]
pub struct PublisherRegistry {
    publishers: HashMap<Platform, Arc<dyn Publisher>>,
}

impl PublisherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One HTTP adapter per enabled platform, sharing a single client
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = build_client(config.scheduler.publish_timeout()).map_err(|e| {
            ConfigError::InvalidValue {
                field: "scheduler.publish_timeout_secs".to_string(),
                reason: format!("could not build HTTP client: {}", e),
            }
        })?;

        let mut registry = Self::new();
        for platform in config.enabled_platforms() {
            let platform_config = config.platform(platform);
            let constraints =
                ContentConstraints::for_platform(platform).with_overrides(platform_config);
            let api_base = platform_config.api_base.clone();

            let publisher: Arc<dyn Publisher> = match platform {
                Platform::Meta => {
                    Arc::new(MetaPublisher::new(client.clone(), api_base, constraints))
                }
                Platform::LinkedIn => {
                    Arc::new(LinkedInPublisher::new(client.clone(), api_base, constraints))
                }
                Platform::GoogleBusiness => Arc::new(GoogleBusinessPublisher::new(
                    client.clone(),
                    api_base,
                    constraints,
                )),
            };
            registry.register(publisher);
        }

        tracing::debug!(
            platforms = ?registry.platforms(),
            "Publisher registry built"
        );
        Ok(registry)
    }

    /// Add or replace the publisher for its platform
    pub fn register(&mut self, publisher: Arc<dyn Publisher>) {
        self.publishers.insert(publisher.platform(), publisher);
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn Publisher>> {
        self.publishers.get(&platform).cloned()
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<_> = self.publishers.keys().copied().collect();
        platforms.sort();
        platforms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::mock::MockPublisher;

    #[test]
    fn test_from_config_registers_enabled_platforms() {
        let mut config = Config::default();
        config.platforms.linkedin.enabled = false;
        config.platforms.google_business.max_chars = Some(1000);

        let registry = PublisherRegistry::from_config(&config).unwrap();
        assert_eq!(
            registry.platforms(),
            vec![Platform::Meta, Platform::GoogleBusiness]
        );
        assert!(registry.get(Platform::LinkedIn).is_none());

        let google = registry.get(Platform::GoogleBusiness).unwrap();
        assert_eq!(google.constraints().max_chars, 1000);
        assert!(google.supports_lookup());
    }

    #[test]
    fn test_register_replaces_existing() {
        let mut registry = PublisherRegistry::from_config(&Config::default()).unwrap();
        registry.register(Arc::new(MockPublisher::new(Platform::Meta)));

        let meta = registry.get(Platform::Meta).unwrap();
        assert!(!meta.supports_lookup(), "mock replaced the Graph API adapter");
        assert_eq!(registry.platforms().len(), 3);
    }
}
