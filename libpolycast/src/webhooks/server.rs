//! HTTP endpoints for platform callbacks
//!
//! - `POST /webhooks/{platform}`: signed delivery; 200 when processed or
//!   already seen, 401 for missing or bad signatures, 400 for a body that
//!   fails to parse, 404 for an unknown platform
//! - `GET /webhooks/meta`: Meta's subscription verification handshake
//! - `GET /health`

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::db::IngestOutcome;
use crate::types::Platform;
use crate::webhooks::signature::signature_header;
use crate::webhooks::{WebhookError, WebhookIngestor};

/// Shared state for the webhook handlers
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    ingestor: WebhookIngestor,
    /// Token echoed back during Meta's subscription handshake
    meta_verify_token: Option<SecretString>,
}

impl AppState {
    pub fn new(ingestor: WebhookIngestor, meta_verify_token: Option<SecretString>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                ingestor,
                meta_verify_token,
            }),
        }
    }

    pub fn ingestor(&self) -> &WebhookIngestor {
        &self.inner.ingestor
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/webhooks/{platform}",
            get(meta_challenge_handler).post(webhook_handler),
        )
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn webhook_handler(
    State(state): State<AppState>,
    Path(platform): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), WebhookError> {
    let platform: Platform = platform
        .parse()
        .map_err(|_| WebhookError::UnknownPlatform(platform.clone()))?;

    let signature = headers
        .get(signature_header(platform))
        .and_then(|v| v.to_str().ok());

    let outcome = state.ingestor().ingest(platform, &body, signature).await?;
    let body = match outcome {
        IngestOutcome::Processed { applied, unmatched } => json!({
            "status": "processed",
            "applied": applied,
            "unmatched": unmatched,
        }),
        IngestOutcome::Duplicate => json!({ "status": "duplicate" }),
    };
    Ok((StatusCode::OK, Json(body)))
}

#[derive(Debug, Deserialize)]
struct HubChallenge {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

/// Echo `hub.challenge` when the mode and token match the configuration.
/// Only Meta performs this handshake.
async fn meta_challenge_handler(
    State(state): State<AppState>,
    Path(platform): Path<String>,
    Query(params): Query<HubChallenge>,
) -> Result<String, WebhookError> {
    if platform.parse::<Platform>() != Ok(Platform::Meta) {
        return Err(WebhookError::UnknownPlatform(platform));
    }

    let expected = state
        .inner
        .meta_verify_token
        .as_ref()
        .map(|t| t.expose_secret())
        .ok_or(WebhookError::VerificationFailed)?;

    match (params.mode.as_deref(), params.verify_token.as_deref(), params.challenge) {
        (Some("subscribe"), Some(token), Some(challenge)) if token == expected => {
            tracing::info!("Meta webhook subscription verified");
            Ok(challenge)
        }
        _ => {
            tracing::warn!("Rejected Meta webhook verification request");
            Err(WebhookError::VerificationFailed)
        }
    }
}

async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.ingestor().database().count_webhook_events().await {
        Ok(events) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "webhook_events": events })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "error": e.to_string() })),
        ),
    }
}
