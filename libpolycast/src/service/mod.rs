//! Service layer for Polycast
//!
//! `PolycastService` is the single entry point the binaries build on. It
//! owns the shared resources (database, configuration, publisher registry,
//! rate limiter, event bus) and hands out the pieces that use them:
//!
//! - [`ScheduleService`]: create, cancel, requeue and inspect entries
//! - [`DispatchWorker`] and [`Scheduler`]: the publishing side
//! - [`EventBus`]: dispatch and reconciliation events
//!
//! # Example
//!
//! ```no_run
//! use libpolycast::service::PolycastService;
//!
//! # async fn example() -> libpolycast::Result<()> {
//! let service = PolycastService::new().await?;
//!
//! let channels = vec!["ch-meta".to_string(), "ch-linkedin".to_string()];
//! let entries = service
//!     .schedule()
//!     .create("content-1", &channels, chrono::Utc::now().timestamp() + 3600)
//!     .await?;
//! println!("Scheduled {} entries", entries.len());
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod schedule;

pub use events::{Event, EventBus, EventReceiver};
pub use schedule::ScheduleService;

use std::sync::Arc;

use crate::error::{ConfigError, PolycastError};
use crate::platforms::registry::PublisherRegistry;
use crate::platforms::RenderedContent;
use crate::rate_limiter::RateLimiter;
use crate::scheduler::Scheduler;
use crate::worker::DispatchWorker;
use crate::{Config, Database, Result};

/// Main service facade
pub struct PolycastService {
    db: Database,
    config: Arc<Config>,
    registry: PublisherRegistry,
    rate_limiter: Arc<RateLimiter>,
    schedule: ScheduleService,
    event_bus: EventBus,
}

impl PolycastService {
    /// Load configuration from the default location and open the database
    pub async fn new() -> Result<Self> {
        let config = Config::load()?;
        Self::from_config(config).await
    }

    /// Open the configured database (honouring `POLYCAST_DB_PATH`)
    pub async fn from_config(config: Config) -> Result<Self> {
        let db_path = crate::config::resolve_db_path(Some(&config.database.path))?;
        let db_path_str = db_path.to_str().ok_or_else(|| {
            PolycastError::Config(ConfigError::InvalidValue {
                field: "database.path".to_string(),
                reason: "path is not valid UTF-8".to_string(),
            })
        })?;
        let db = Database::new(db_path_str).await?;
        Self::with_database(config, db)
    }

    /// Build on an already opened database, with adapters from `config`
    pub fn with_database(config: Config, db: Database) -> Result<Self> {
        let registry = PublisherRegistry::from_config(&config)?;
        Ok(Self::with_registry(config, db, registry))
    }

    /// Build with an explicit publisher registry (tests use mock adapters)
    pub fn with_registry(config: Config, db: Database, registry: PublisherRegistry) -> Self {
        let rate_limiter = Arc::new(RateLimiter::sqlite(db.clone(), config.rate_limits()));
        Self {
            schedule: ScheduleService::new(db.clone()),
            db,
            config: Arc::new(config),
            registry,
            rate_limiter,
            event_bus: EventBus::new(256),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &PublisherRegistry {
        &self.registry
    }

    pub fn schedule(&self) -> &ScheduleService {
        &self.schedule
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.event_bus.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.event_bus
    }

    /// A dispatch worker sharing this service's resources
    pub fn dispatch_worker(&self) -> DispatchWorker {
        DispatchWorker::from_config(
            &self.config,
            self.db.clone(),
            self.registry.clone(),
            Arc::clone(&self.rate_limiter),
            self.event_bus.clone(),
        )
    }

    /// A scheduler driving a fresh dispatch worker
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(Arc::new(self.dispatch_worker()), &self.config.scheduler)
    }

    /// Render a content item as it would appear on a channel
    pub async fn preview(
        &self,
        content_item_id: &str,
        channel_id: &str,
    ) -> Result<RenderedContent> {
        let content = self
            .db
            .get_content_item(content_item_id)
            .await?
            .ok_or_else(|| PolycastError::NotFound(format!("content item {}", content_item_id)))?;
        let channel = self
            .db
            .get_channel(channel_id)
            .await?
            .ok_or_else(|| PolycastError::NotFound(format!("channel {}", channel_id)))?;
        let publisher = self.registry.get(channel.platform).ok_or_else(|| {
            PolycastError::InvalidInput(format!(
                "{} is not enabled",
                channel.platform.display_name()
            ))
        })?;

        Ok(publisher.preview(&content, &channel.settings))
    }
}
