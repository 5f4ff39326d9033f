//! Google Business Profile adapter (local posts)
//!
//! Channel settings: `account_id` (required) and `location_id` (defaults to
//! the channel's account ref). Optional `cta_url` and `cta_type` add a call
//! to action button.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::json;

use crate::error::PublishError;
use crate::platforms::http::{check_response, classify_send_error, lookup_json, success_json};
use crate::platforms::{
    ContentConstraints, PublishRequest, PublishResult, PublishedPost, Publisher,
};
use crate::types::Platform;

pub const DEFAULT_API_BASE: &str = "https://mybusiness.googleapis.com/v4";

const LOOKUP_PAGE_SIZE: u32 = 20;

pub struct GoogleBusinessPublisher {
    client: reqwest::Client,
    api_base: String,
    constraints: ContentConstraints,
}

impl GoogleBusinessPublisher {
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

    fn local_posts_url(&self, request: &PublishRequest) -> Result<String, PublishError> {
        let account = request.settings.get_str("account_id").ok_or_else(|| {
            PublishError::Validation(
                "Google Business channel is missing the account_id setting".to_string(),
            )
        })?;
        let location = request
            .settings
            .get_str("location_id")
            .unwrap_or(&request.account_ref);

        Ok(format!(
            "{}/accounts/{}/locations/{}/localPosts",
            self.api_base, account, location
        ))
    }

    fn body(request: &PublishRequest) -> serde_json::Value {
        let mut body = json!({
            "languageCode": request.settings.get_str("language").unwrap_or("en"),
            "summary": request.text(),
            "topicType": "STANDARD",
        });

        if !request.content.media.is_empty() {
            let media: Vec<_> = request
                .content
                .media
                .iter()
                .map(|m| json!({ "mediaFormat": "PHOTO", "sourceUrl": m.url }))
                .collect();
            body["media"] = json!(media);
        }

        if let Some(url) = request.settings.get_str("cta_url") {
            body["callToAction"] = json!({
                "actionType": request.settings.get_str("cta_type").unwrap_or("LEARN_MORE"),
                "url": url,
            });
        }

        body
    }

    fn post_from(value: &serde_json::Value) -> Option<PublishedPost> {
        let name = value["name"].as_str()?;
        Some(PublishedPost {
            external_post_id: name.to_string(),
            external_url: value["searchUrl"].as_str().map(str::to_string),
        })
    }

    async fn try_publish(&self, request: &PublishRequest) -> Result<PublishedPost, PublishError> {
        let url = self.local_posts_url(request)?;

        let response = self
            .client
            .post(url)
            .bearer_auth(request.credential.expose_secret())
            .json(&Self::body(request))
            .send()
            .await
            .map_err(|e| classify_send_error(Platform::GoogleBusiness, "publish", e))?;
        let response = check_response(Platform::GoogleBusiness, "publish", response).await?;
        let value = success_json(Platform::GoogleBusiness, "publish", response).await?;

        let post = Self::post_from(&value).ok_or_else(|| {
            PublishError::Ambiguous("Google Business publish returned no post name".to_string())
        })?;

        tracing::debug!(post = %post.external_post_id, "Published to Google Business");
        Ok(post)
    }
}

#[async_trait]
impl Publisher for GoogleBusinessPublisher {
    fn platform(&self) -> Platform {
        Platform::GoogleBusiness
    }

    fn constraints(&self) -> &ContentConstraints {
        &self.constraints
    }

    async fn publish(&self, request: &PublishRequest) -> PublishResult {
        self.try_publish(request).await.into()
    }

    fn supports_lookup(&self) -> bool {
        true
    }

    /// Match the location's recent local posts on their summary
    async fn find_existing(
        &self,
        request: &PublishRequest,
    ) -> Result<Option<PublishedPost>, PublishError> {
        let url = self.local_posts_url(request)?;
        let text = request.text();

        let response = self
            .client
            .get(url)
            .bearer_auth(request.credential.expose_secret())
            .query(&[("pageSize", LOOKUP_PAGE_SIZE)])
            .send()
            .await
            .map_err(|e| {
                PublishError::Network(format!("Google Business post lookup failed: {}", e))
            })?;
        let response = check_response(Platform::GoogleBusiness, "post lookup", response).await?;
        let value = lookup_json(Platform::GoogleBusiness, "post lookup", response).await?;

        Ok(value["localPosts"]
            .as_array()
            .into_iter()
            .flatten()
            .filter(|post| post["summary"].as_str() == Some(text.as_str()))
            .find_map(Self::post_from))
    }
}
