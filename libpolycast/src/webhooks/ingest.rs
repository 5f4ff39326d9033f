//! Verify → parse → insert-if-absent → reconcile

use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;

use crate::db::{Database, IngestOutcome};
use crate::service::events::{Event, EventBus};
use crate::types::{Platform, WebhookEvent};
use crate::webhooks::parser::parse_webhook;
use crate::webhooks::signature::verify_signature;
use crate::webhooks::WebhookError;

#[derive(Clone)]
pub struct WebhookIngestor {
    db: Database,
    secrets: HashMap<Platform, SecretString>,
    events: EventBus,
}

impl WebhookIngestor {
    pub fn new(db: Database, secrets: HashMap<Platform, SecretString>, events: EventBus) -> Self {
        Self { db, secrets, events }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Handle one delivery. Nothing is persisted unless the signature
    /// verifies and the body parses.
    pub async fn ingest(
        &self,
        platform: Platform,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<IngestOutcome, WebhookError> {
        let secret = self
            .secrets
            .get(&platform)
            .ok_or(WebhookError::NotConfigured(platform))?;
        let signature = signature.ok_or(WebhookError::MissingSignature)?;

        if !verify_signature(platform, body, signature, secret.expose_secret().as_bytes()) {
            tracing::warn!(platform = %platform, "Invalid webhook signature");
            return Err(WebhookError::InvalidSignature);
        }

        let parsed = parse_webhook(platform, body)?;
        let payload = String::from_utf8(body.to_vec())
            .map_err(|_| WebhookError::InvalidPayload("body is not UTF-8".to_string()))?;

        let event = WebhookEvent {
            id: None,
            platform,
            dedup_key: parsed.dedup_key,
            payload,
            signature: signature.to_string(),
            received_at: chrono::Utc::now().timestamp(),
            processed_at: None,
        };

        let outcome = self.db.ingest_webhook(&event, &parsed.updates).await?;
        match outcome {
            IngestOutcome::Processed { applied, unmatched } => {
                tracing::info!(
                    platform = %platform,
                    dedup_key = %event.dedup_key,
                    applied,
                    unmatched,
                    "Webhook reconciled"
                );
                self.events.emit(Event::WebhookReconciled {
                    platform: platform.as_str().to_string(),
                    dedup_key: event.dedup_key,
                    applied,
                });
            }
            IngestOutcome::Duplicate => {
                tracing::debug!(
                    platform = %platform,
                    dedup_key = %event.dedup_key,
                    "Duplicate webhook delivery"
                );
            }
        }
        Ok(outcome)
    }
}
