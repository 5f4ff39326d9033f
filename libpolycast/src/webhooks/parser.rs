//! Platform webhook payloads → dedup key + engagement updates
//!
//! Dedup keys are prefixed with the platform so ids from different
//! platforms can never collide:
//!
//! - Meta sends no delivery id, so the key is the SHA-256 of the raw body.
//! - LinkedIn uses `notificationId`.
//! - Google Business arrives as a Pub/Sub push; the key is
//!   `message.messageId` and the notification is the base64 `message.data`.
//!
//! Events that carry nothing the engine tracks parse to an empty update
//! list. They are still recorded so redeliveries stay deduplicated.

use base64::Engine;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::{EngagementMetric, EngagementUpdate, Platform};

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid payload: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedWebhook {
    pub dedup_key: String,
    pub updates: Vec<EngagementUpdate>,
}

pub fn parse_webhook(platform: Platform, body: &[u8]) -> Result<ParsedWebhook, ParseError> {
    let value: Value = serde_json::from_slice(body)?;
    match platform {
        Platform::Meta => Ok(ParsedWebhook {
            dedup_key: format!("meta:{}", hex::encode(Sha256::digest(body))),
            updates: meta_updates(&value),
        }),
        Platform::LinkedIn => parse_linkedin(&value),
        Platform::GoogleBusiness => parse_google(&value),
    }
}

/// Ids arrive as strings or numbers depending on the platform
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn delta(external_post_id: &str, metric: EngagementMetric, delta: i64) -> EngagementUpdate {
    EngagementUpdate::Delta {
        external_post_id: external_post_id.to_string(),
        metric,
        delta,
    }
}

/// Page feed changes: `entry[].changes[]` with `field == "feed"`
fn meta_updates(value: &Value) -> Vec<EngagementUpdate> {
    let mut updates = Vec::new();

    let changes = value["entry"]
        .as_array()
        .into_iter()
        .flatten()
        .flat_map(|entry| entry["changes"].as_array().into_iter().flatten())
        .filter(|change| change["field"].as_str() == Some("feed"));

    for change in changes {
        let v = &change["value"];
        let Some(post_id) = v["post_id"].as_str() else {
            continue;
        };
        let sign = match v["verb"].as_str() {
            Some("add") => 1,
            Some("remove") => -1,
            _ => 0,
        };

        match (v["item"].as_str(), sign) {
            (Some("reaction") | Some("like"), s) if s != 0 => {
                updates.push(delta(post_id, EngagementMetric::Likes, s))
            }
            (Some("comment"), s) if s != 0 => {
                updates.push(delta(post_id, EngagementMetric::Comments, s))
            }
            (Some("share"), s) if s != 0 => {
                updates.push(delta(post_id, EngagementMetric::Shares, s))
            }
            (Some("status") | Some("post") | Some("photo") | Some("video"), -1) => {
                updates.push(EngagementUpdate::Removed {
                    external_post_id: post_id.to_string(),
                })
            }
            _ => {}
        }
    }

    updates
}

/// Organization social action notification
fn parse_linkedin(value: &Value) -> Result<ParsedWebhook, ParseError> {
    let id = id_string(&value["notificationId"])
        .ok_or_else(|| ParseError::Invalid("missing notificationId".to_string()))?;

    let mut updates = Vec::new();
    if let Some(post) = value["sourcePost"].as_str() {
        let action = value["action"]
            .as_str()
            .or_else(|| value["type"].as_str())
            .unwrap_or_default();
        match action {
            "LIKE" => updates.push(delta(post, EngagementMetric::Likes, 1)),
            "UNLIKE" => updates.push(delta(post, EngagementMetric::Likes, -1)),
            "COMMENT" | "ADMIN_COMMENT" => updates.push(delta(post, EngagementMetric::Comments, 1)),
            "COMMENT_DELETE" => updates.push(delta(post, EngagementMetric::Comments, -1)),
            "SHARE" | "SHARE_MENTION" => updates.push(delta(post, EngagementMetric::Shares, 1)),
            "SHARE_DELETE" | "POST_DELETE" => updates.push(EngagementUpdate::Removed {
                external_post_id: post.to_string(),
            }),
            _ => {}
        }
    }

    Ok(ParsedWebhook {
        dedup_key: format!("linkedin:{}", id),
        updates,
    })
}

/// Pub/Sub push envelope around a Business Profile notification
fn parse_google(value: &Value) -> Result<ParsedWebhook, ParseError> {
    let message = &value["message"];
    let id = id_string(&message["messageId"])
        .or_else(|| id_string(&message["message_id"]))
        .ok_or_else(|| ParseError::Invalid("missing message.messageId".to_string()))?;

    let mut updates = Vec::new();
    if let Some(data) = message["data"].as_str() {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| ParseError::Invalid(format!("message.data is not base64: {}", e)))?;
        let notification: Value = serde_json::from_slice(&decoded)?;

        if let Some(post) = notification["localPost"].as_str() {
            match notification["notificationType"].as_str() {
                Some("LOCAL_POST_METRICS") => {
                    let metrics = &notification["metrics"];
                    updates.push(EngagementUpdate::Snapshot {
                        external_post_id: post.to_string(),
                        likes: metrics["likes"].as_i64(),
                        comments: metrics["comments"].as_i64(),
                        shares: metrics["shares"].as_i64(),
                    });
                }
                Some("LOCAL_POST_DELETED") => updates.push(EngagementUpdate::Removed {
                    external_post_id: post.to_string(),
                }),
                _ => {}
            }
        }
    }

    Ok(ParsedWebhook {
        dedup_key: format!("google_business:{}", id),
        updates,
    })
}
