//! Webhook ingestion
//!
//! Platforms call back with engagement changes for posts we published.
//! Each delivery is verified, deduplicated and reconciled against the
//! matching external reference in one transaction.

pub mod ingest;
pub mod parser;
pub mod server;
pub mod signature;

pub use ingest::WebhookIngestor;
pub use server::{build_router, AppState};
pub use signature::{compute_signature, format_signature_header, verify_signature};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::error::PolycastError;
use crate::types::Platform;
use parser::ParseError;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("unknown platform: {0}")]
    UnknownPlatform(String),

    #[error("no webhook secret configured for {0}")]
    NotConfigured(Platform),

    #[error("missing signature header")]
    MissingSignature,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid JSON body: {0}")]
    InvalidJson(serde_json::Error),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("verification failed")]
    VerificationFailed,

    #[error("store error: {0}")]
    Store(#[from] PolycastError),
}

impl From<ParseError> for WebhookError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::Json(e) => WebhookError::InvalidJson(e),
            ParseError::Invalid(msg) => WebhookError::InvalidPayload(msg),
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::UnknownPlatform(_) => StatusCode::NOT_FOUND,
            // Unverifiable deliveries are rejected the same way as bad ones
            WebhookError::NotConfigured(_)
            | WebhookError::MissingSignature
            | WebhookError::InvalidSignature => StatusCode::UNAUTHORIZED,
            WebhookError::InvalidJson(_) | WebhookError::InvalidPayload(_) => {
                StatusCode::BAD_REQUEST
            }
            WebhookError::VerificationFailed => StatusCode::FORBIDDEN,
            WebhookError::Store(e) => {
                tracing::error!("Webhook store failure: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, self.to_string()).into_response()
    }
}
