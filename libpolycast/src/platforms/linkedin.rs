//! LinkedIn adapter using the versioned Posts API
//!
//! Media must already be uploaded: each media ref carries an
//! `urn:li:image:…` or `urn:li:video:…` URN in its `url`.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::json;

use crate::error::PublishError;
use crate::platforms::http::{check_response, classify_send_error};
use crate::platforms::{
    validate_content, ContentConstraints, PublishRequest, PublishResult, PublishedPost, Publisher,
    ValidationResult,
};
use crate::types::{ContentItem, MediaKind, Platform};

pub const DEFAULT_API_BASE: &str = "https://api.linkedin.com";
pub const API_VERSION: &str = "202409";

pub struct LinkedInPublisher {
    client: reqwest::Client,
    api_base: String,
    constraints: ContentConstraints,
}

impl LinkedInPublisher {
    pub fn new(
        client: reqwest::Client,
        api_base: Option<String>,
        constraints: ContentConstraints,
    ) -> Self {
        Self {
            client,
            api_base: api_base
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            constraints,
        }
    }

    /// `settings.author_urn`, else the account ref as an organization
    fn author(request: &PublishRequest) -> String {
        match request.settings.get_str("author_urn") {
            Some(urn) => urn.to_string(),
            None if request.account_ref.starts_with("urn:li:") => request.account_ref.clone(),
            None => format!("urn:li:organization:{}", request.account_ref),
        }
    }

    fn body(request: &PublishRequest) -> serde_json::Value {
        let mut body = json!({
            "author": Self::author(request),
            "commentary": request.text(),
            "visibility": request.settings.get_str("visibility").unwrap_or("PUBLIC"),
            "distribution": {
                "feedDistribution": "MAIN_FEED",
                "targetEntities": [],
                "thirdPartyDistributionChannels": []
            },
            "lifecycleState": "PUBLISHED",
            "isReshareDisabledByAuthor": false
        });

        let media = &request.content.media;
        match media.as_slice() {
            [] => {}
            [single] => {
                let mut entry = json!({ "id": single.url });
                if let Some(alt) = &single.alt_text {
                    entry["altText"] = json!(alt);
                }
                body["content"] = json!({ "media": entry });
            }
            many => {
                let images: Vec<_> = many
                    .iter()
                    .map(|m| {
                        let mut image = json!({ "id": m.url });
                        if let Some(alt) = &m.alt_text {
                            image["altText"] = json!(alt);
                        }
                        image
                    })
                    .collect();
                body["content"] = json!({ "multiImage": { "images": images } });
            }
        }

        body
    }

    async fn try_publish(&self, request: &PublishRequest) -> Result<PublishedPost, PublishError> {
        let response = self
            .client
            .post(format!("{}/rest/posts", self.api_base))
            .bearer_auth(request.credential.expose_secret())
            .header("LinkedIn-Version", API_VERSION)
            .header("X-Restli-Protocol-Version", "2.0.0")
            .json(&Self::body(request))
            .send()
            .await
            .map_err(|e| classify_send_error(Platform::LinkedIn, "publish", e))?;
        let response = check_response(Platform::LinkedIn, "publish", response).await?;

        let id = response
            .headers()
            .get("x-restli-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                PublishError::Ambiguous("LinkedIn publish returned no x-restli-id".to_string())
            })?
            .to_string();

        tracing::debug!(post_urn = %id, "Published to LinkedIn");
        Ok(PublishedPost {
            external_url: Some(format!("https://www.linkedin.com/feed/update/{}", id)),
            external_post_id: id,
        })
    }
}

#[async_trait]
impl Publisher for LinkedInPublisher {
    fn platform(&self) -> Platform {
        Platform::LinkedIn
    }

    fn constraints(&self) -> &ContentConstraints {
        &self.constraints
    }

    fn validate(&self, content: &ContentItem) -> ValidationResult {
        let mut result = validate_content(content, &self.constraints);

        for media in &content.media {
            if !media.url.starts_with("urn:li:") {
                result.errors.push(format!(
                    "LinkedIn media must be an uploaded asset URN, got '{}'",
                    media.url
                ));
            }
        }
        if content.media.len() > 1 && content.media.iter().any(|m| m.kind == MediaKind::Video) {
            result
                .errors
                .push("LinkedIn posts support a single video or several images".to_string());
        }

        result
    }

    async fn publish(&self, request: &PublishRequest) -> PublishResult {
        self.try_publish(request).await.into()
    }
}
