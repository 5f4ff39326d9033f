//! Meta (Facebook Pages) adapter using the Graph API
//!
//! Text posts go to `/{page_id}/feed`. Photos are uploaded unpublished first
//! and attached by id; a single video is posted through `/{page_id}/videos`.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::json;

use crate::error::PublishError;
use crate::platforms::http::{check_response, classify_send_error, lookup_json, success_json};
use crate::platforms::{
    validate_content, ContentConstraints, PublishRequest, PublishResult, PublishedPost, Publisher,
    ValidationResult,
};
use crate::types::{ContentItem, MediaKind, MediaRef, Platform};

pub const DEFAULT_API_BASE: &str = "https://graph.facebook.com/v21.0";

/// How many recent page posts the duplicate lookup inspects
const LOOKUP_WINDOW: u32 = 25;

pub struct MetaPublisher {
    client: reqwest::Client,
    api_base: String,
    constraints: ContentConstraints,
}

impl MetaPublisher {
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

    /// `settings.page_id`, falling back to the channel's account ref
    fn page_id<'a>(&self, request: &'a PublishRequest) -> &'a str {
        request
            .settings
            .get_str("page_id")
            .unwrap_or(&request.account_ref)
    }

    fn post_url(id: &str) -> String {
        format!("https://www.facebook.com/{}", id)
    }

    async fn upload_photo(
        &self,
        page_id: &str,
        token: &str,
        media: &MediaRef,
    ) -> Result<String, PublishError> {
        let mut body = json!({ "url": media.url, "published": false });
        if let Some(alt) = &media.alt_text {
            body["alt_text_custom"] = json!(alt);
        }

        let response = self
            .client
            .post(format!("{}/{}/photos", self.api_base, page_id))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_send_error(Platform::Meta, "photo upload", e))?;
        let response = check_response(Platform::Meta, "photo upload", response).await?;

        // An unpublished photo nobody references is harmless, so an unreadable
        // upload response is a plain transient failure.
        let value: serde_json::Value = response.json().await.map_err(|e| {
            PublishError::Network(format!("Meta photo upload response unreadable: {}", e))
        })?;
        value["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| PublishError::Network("Meta photo upload returned no id".to_string()))
    }

    async fn post_video(
        &self,
        page_id: &str,
        token: &str,
        video: &MediaRef,
        text: &str,
    ) -> Result<PublishedPost, PublishError> {
        let response = self
            .client
            .post(format!("{}/{}/videos", self.api_base, page_id))
            .bearer_auth(token)
            .json(&json!({ "file_url": video.url, "description": text }))
            .send()
            .await
            .map_err(|e| classify_send_error(Platform::Meta, "video publish", e))?;
        let response = check_response(Platform::Meta, "video publish", response).await?;
        let value = success_json(Platform::Meta, "video publish", response).await?;

        let id = value["id"].as_str().ok_or_else(|| {
            PublishError::Ambiguous("Meta video publish returned no id".to_string())
        })?;
        Ok(PublishedPost {
            external_post_id: id.to_string(),
            external_url: Some(Self::post_url(id)),
        })
    }

    async fn try_publish(&self, request: &PublishRequest) -> Result<PublishedPost, PublishError> {
        let page_id = self.page_id(request);
        let token = request.credential.expose_secret();
        let text = request.text();

        if let [video] = request.content.media.as_slice() {
            if video.kind == MediaKind::Video {
                return self.post_video(page_id, token, video, &text).await;
            }
        }

        let mut attached = Vec::with_capacity(request.content.media.len());
        for media in &request.content.media {
            let photo_id = self.upload_photo(page_id, token, media).await?;
            attached.push(json!({ "media_fbid": photo_id }));
        }

        let mut body = json!({ "message": text });
        if !attached.is_empty() {
            body["attached_media"] = json!(attached);
        }
        if let Some(link) = request.settings.get_str("link") {
            body["link"] = json!(link);
        }

        let response = self
            .client
            .post(format!("{}/{}/feed", self.api_base, page_id))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_send_error(Platform::Meta, "publish", e))?;
        let response = check_response(Platform::Meta, "publish", response).await?;
        let value = success_json(Platform::Meta, "publish", response).await?;

        let id = value["id"]
            .as_str()
            .ok_or_else(|| PublishError::Ambiguous("Meta publish returned no id".to_string()))?;

        tracing::debug!(page_id = page_id, post_id = id, "Published to Meta");
        Ok(PublishedPost {
            external_post_id: id.to_string(),
            external_url: Some(Self::post_url(id)),
        })
    }
}

#[async_trait]
impl Publisher for MetaPublisher {
    fn platform(&self) -> Platform {
        Platform::Meta
    }

    fn constraints(&self) -> &ContentConstraints {
        &self.constraints
    }

    fn validate(&self, content: &ContentItem) -> ValidationResult {
        let mut result = validate_content(content, &self.constraints);
        let has_video = content.media.iter().any(|m| m.kind == MediaKind::Video);
        if has_video && content.media.len() > 1 {
            result
                .errors
                .push("A video must be the only attachment on a Meta post".to_string());
        }
        result
    }

    async fn publish(&self, request: &PublishRequest) -> PublishResult {
        self.try_publish(request).await.into()
    }

    fn supports_lookup(&self) -> bool {
        true
    }

    /// Match recent page posts on their exact message text
    async fn find_existing(
        &self,
        request: &PublishRequest,
    ) -> Result<Option<PublishedPost>, PublishError> {
        let page_id = self.page_id(request);
        let text = request.text();

        let response = self
            .client
            .get(format!("{}/{}/posts", self.api_base, page_id))
            .bearer_auth(request.credential.expose_secret())
            .query(&[
                ("fields", "id,message,permalink_url".to_string()),
                ("limit", LOOKUP_WINDOW.to_string()),
            ])
            .send()
            .await
            .map_err(|e| PublishError::Network(format!("Meta post lookup failed: {}", e)))?;
        let response = check_response(Platform::Meta, "post lookup", response).await?;
        let value = lookup_json(Platform::Meta, "post lookup", response).await?;

        let found = value["data"]
            .as_array()
            .into_iter()
            .flatten()
            .find(|post| post["message"].as_str() == Some(text.as_str()))
            .and_then(|post| {
                let id = post["id"].as_str()?;
                Some(PublishedPost {
                    external_post_id: id.to_string(),
                    external_url: post["permalink_url"]
                        .as_str()
                        .map(str::to_string)
                        .or_else(|| Some(Self::post_url(id))),
                })
            });

        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publisher() -> MetaPublisher {
        MetaPublisher::new(
            reqwest::Client::new(),
            Some("http://127.0.0.1:9/".to_string()),
            ContentConstraints::for_platform(Platform::Meta),
        )
    }

    #[test]
    fn test_api_base_trailing_slash_is_trimmed() {
        assert_eq!(publisher().api_base, "http://127.0.0.1:9");
    }

    #[test]
    fn test_video_must_be_alone() {
        let mut content = ContentItem::new("Clip");
        content.media = vec![
            MediaRef {
                url: "https://cdn.example.com/v.mp4".into(),
                kind: MediaKind::Video,
                alt_text: None,
            },
            MediaRef {
                url: "https://cdn.example.com/a.jpg".into(),
                kind: MediaKind::Image,
                alt_text: None,
            },
        ];
        let result = publisher().validate(&content);
        assert!(!result.is_valid());
        assert!(result.errors[0].contains("only attachment"));
    }

    #[test]
    fn test_supports_lookup() {
        assert!(publisher().supports_lookup());
        assert_eq!(publisher().platform(), Platform::Meta);
    }
}
