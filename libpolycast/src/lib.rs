//! Polycast - scheduling and dispatch engine for social and business platforms
//!
//! Queued content is published to Meta, LinkedIn and Google Business at its
//! scheduled time, through a shared rate limiter, with classified retries
//! and webhook-driven engagement reconciliation.

pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod logging;
pub mod platforms;
pub mod rate_limiter;
pub mod retry;
pub mod scheduler;
pub mod scheduling;
pub mod service;
pub mod types;
pub mod webhooks;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use error::{ErrorKind, PolycastError, PublishError, Result};
pub use types::{
    Channel, ContentItem, EntryStatus, ExternalReference, Organization, Platform, ScheduleEntry,
    ScheduleStatus,
};
