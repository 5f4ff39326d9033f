//! HTTP plumbing shared by the REST adapters
//!
//! Maps transport failures and HTTP statuses onto [`PublishError`] so every
//! adapter classifies the same way.

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use std::time::Duration;

use crate::error::PublishError;
use crate::types::Platform;

const MAX_ERROR_BODY: usize = 300;

/// Build the client shared by every adapter
pub fn build_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .user_agent(concat!("polycast/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Classify an error raised while sending a request.
///
/// A refused or failed connection never reached the platform. Anything later
/// (timeouts, resets, unreadable bodies) may have been processed.
pub fn classify_send_error(
    platform: Platform,
    context: &str,
    err: reqwest::Error,
) -> PublishError {
    if err.is_connect() || err.is_builder() {
        return PublishError::Network(format!(
            "{} {} failed to connect: {}",
            platform.display_name(),
            context,
            err
        ));
    }

    PublishError::Ambiguous(format!(
        "{} {} outcome unknown: {}",
        platform.display_name(),
        context,
        err
    ))
}

/// Seconds or an HTTP date, per RFC 9110
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let secs = (at.timestamp() - chrono::Utc::now().timestamp()).max(0) as u64;
    Some(Duration::from_secs(secs))
}

fn truncate(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX_ERROR_BODY {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(MAX_ERROR_BODY).collect();
    format!("{}…", cut)
}

/// Map a non-success status onto the error taxonomy
pub fn classify_status(
    platform: Platform,
    context: &str,
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
) -> PublishError {
    let message = format!(
        "{} {} returned {}: {}",
        platform.display_name(),
        context,
        status,
        truncate(body)
    );

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PublishError::Authentication(message),
        StatusCode::TOO_MANY_REQUESTS => PublishError::RateLimit {
            message,
            retry_after: parse_retry_after(headers),
        },
        StatusCode::REQUEST_TIMEOUT => PublishError::Network(message),
        s if s.is_server_error() => PublishError::Network(message),
        _ => {
            let lower = body.to_lowercase();
            if lower.contains("policy") || lower.contains("spam") || lower.contains("abusive") {
                PublishError::ContentPolicy(message)
            } else {
                PublishError::Validation(message)
            }
        }
    }
}

/// Pass a successful response through; classify anything else
pub async fn check_response(
    platform: Platform,
    context: &str,
    response: Response,
) -> Result<Response, PublishError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(platform, context, status, &headers, &body))
}

/// Read a JSON body from a response whose request already succeeded.
///
/// A success status with an unreadable body means the platform acted but we
/// cannot tell on what, so the result is ambiguous.
pub async fn success_json(
    platform: Platform,
    context: &str,
    response: Response,
) -> Result<serde_json::Value, PublishError> {
    response.json().await.map_err(|e| {
        PublishError::Ambiguous(format!(
            "{} {} succeeded but the response could not be read: {}",
            platform.display_name(),
            context,
            e
        ))
    })
}

/// Read a JSON body from a read-only call (lookups); failures are transient
pub async fn lookup_json(
    platform: Platform,
    context: &str,
    response: Response,
) -> Result<serde_json::Value, PublishError> {
    response.json().await.map_err(|e| {
        PublishError::Network(format!(
            "{} {} response could not be read: {}",
            platform.display_name(),
            context,
            e
        ))
    })
}
