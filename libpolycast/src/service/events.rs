//! Event system for dispatch progress
//!
//! An in-process broadcast bus. The dispatch worker, the reaper and the
//! webhook ingestor emit events; the CLI and tests subscribe. Emitting never
//! blocks, and events are dropped when nobody is listening.
//!
//! # Example
//!
//! ```no_run
//! use libpolycast::service::events::{Event, EventBus};
//!
//! # async fn example() {
//! let event_bus = EventBus::new(100);
//! let mut receiver = event_bus.subscribe();
//!
//! event_bus.emit(Event::EntryClaimed {
//!     entry_id: "abc123".to_string(),
//!     worker_id: "worker-1".to_string(),
//! });
//!
//! if let Ok(event) = receiver.recv().await {
//!     println!("Received: {:?}", event);
//! }
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub type EventReceiver = broadcast::Receiver<Event>;

/// Broadcast bus for dispatch events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}

impl EventBus {
    /// `capacity` is how many events a lagging subscriber may fall behind
    /// before the oldest are dropped
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        // Err only means there are no receivers
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A worker won the claim on an entry
    EntryClaimed { entry_id: String, worker_id: String },

    /// The entry is on the platform
    EntryPosted {
        entry_id: String,
        platform: String,
        external_post_id: String,
        /// Found by the idempotency check rather than a fresh publish
        recovered: bool,
    },

    /// A failed attempt was scheduled for another try
    EntryRetrying {
        entry_id: String,
        attempt_count: u32,
        error_kind: String,
        not_before: i64,
    },

    /// Released without an attempt, usually for rate limiting
    EntryDeferred {
        entry_id: String,
        not_before: i64,
        reason: String,
    },

    /// No more automatic retries
    EntryFailed {
        entry_id: String,
        attempt_count: u32,
        error_kind: String,
        error: String,
    },

    /// The reaper took back an expired lease
    LeaseReaped {
        entry_id: String,
        previous_owner: Option<String>,
        failed: bool,
    },

    /// A first-delivery webhook was applied
    WebhookReconciled {
        platform: String,
        dedup_key: String,
        applied: usize,
    },
}

impl Event {
    /// The schedule entry the event is about, if any
    pub fn entry_id(&self) -> Option<&str> {
        match self {
            Event::EntryClaimed { entry_id, .. }
            | Event::EntryPosted { entry_id, .. }
            | Event::EntryRetrying { entry_id, .. }
            | Event::EntryDeferred { entry_id, .. }
            | Event::EntryFailed { entry_id, .. }
            | Event::LeaseReaped { entry_id, .. } => Some(entry_id),
            Event::WebhookReconciled { .. } => None,
        }
    }
}
