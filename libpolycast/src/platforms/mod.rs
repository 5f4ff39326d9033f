//! Publisher adapters
//!
//! One [`Publisher`] per [`Platform`]. Adapters are stateless apart from their
//! HTTP client and constraints, and are resolved through the
//! [`PublisherRegistry`](registry::PublisherRegistry) built at startup.
//!
//! Every adapter call ends in a [`PublishResult`]: the worker never inspects
//! error strings, only the variant.
//!
//! ```no_run
//! use libpolycast::platforms::{registry::PublisherRegistry, Publisher};
//! use libpolycast::types::{ChannelSettings, ContentItem, Platform};
//! use libpolycast::Config;
//!
//! # fn example() -> libpolycast::Result<()> {
//! let registry = PublisherRegistry::from_config(&Config::default())?;
//! if let Some(meta) = registry.get(Platform::Meta) {
//!     let rendered = meta.preview(&ContentItem::new("Hello"), &ChannelSettings::default());
//!     println!("{} ({} chars)", rendered.text, rendered.char_count);
//! }
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use secrecy::SecretString;

use crate::config::PlatformConfig;
use crate::error::{ErrorKind, PublishError};
use crate::types::{ChannelSettings, ContentItem, MediaKind, MediaRef, Platform};

pub mod google_business;
pub mod http;
pub mod linkedin;
pub mod meta;
pub mod registry;

// Available in all builds so integration tests can script outcomes
pub mod mock;

/// Pre-flight limits an adapter enforces before any network call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentConstraints {
    pub max_chars: usize,
    pub max_media: usize,
    /// More hashtags than this produces a warning, not an error
    pub hashtag_warning: usize,
    pub allow_video: bool,
}

impl ContentConstraints {
    pub fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::Meta => Self {
                max_chars: 2200,
                max_media: 10,
                hashtag_warning: 30,
                allow_video: true,
            },
            Platform::LinkedIn => Self {
                max_chars: 3000,
                max_media: 9,
                hashtag_warning: 5,
                allow_video: true,
            },
            Platform::GoogleBusiness => Self {
                max_chars: 1500,
                max_media: 1,
                hashtag_warning: 3,
                allow_video: false,
            },
        }
    }

    /// Apply the overrides from a `[platforms.<name>]` section
    pub fn with_overrides(mut self, config: &PlatformConfig) -> Self {
        if let Some(max_chars) = config.max_chars {
            self.max_chars = max_chars;
        }
        if let Some(max_media) = config.max_media {
            self.max_media = max_media;
        }
        if let Some(hashtag_warning) = config.hashtag_warning {
            self.hashtag_warning = hashtag_warning;
        }
        self
    }
}

/// Outcome of pre-flight validation. Errors block publishing; warnings don't.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Collapse hard errors into a single `PublishError::Validation`
    pub fn into_result(self) -> Result<Vec<String>, PublishError> {
        if self.errors.is_empty() {
            Ok(self.warnings)
        } else {
            Err(PublishError::Validation(self.errors.join("; ")))
        }
    }
}

/// What a post will look like on the platform
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedContent {
    pub text: String,
    pub char_count: usize,
    pub media: Vec<MediaRef>,
    pub validation: ValidationResult,
}

/// Everything an adapter needs to publish one schedule entry
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub entry_id: String,
    pub idempotency_key: String,
    pub content: ContentItem,
    pub account_ref: String,
    pub settings: ChannelSettings,
    pub credential: SecretString,
}

impl PublishRequest {
    /// Text as it will be sent
    pub fn text(&self) -> String {
        render_text(&self.content)
    }
}

/// Identifiers of a post that exists on the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPost {
    pub external_post_id: String,
    pub external_url: Option<String>,
}

/// Classified outcome of a publish call
#[derive(Debug, Clone, PartialEq)]
pub enum PublishResult {
    Success(PublishedPost),
    /// Worth retrying: nothing was published
    Transient(PublishError),
    /// Never retried automatically
    Permanent(PublishError),
    /// The post may exist; retry only after an idempotency check
    Ambiguous(PublishError),
}

impl PublishResult {
    pub fn error(&self) -> Option<&PublishError> {
        match self {
            PublishResult::Success(_) => None,
            PublishResult::Transient(e)
            | PublishResult::Permanent(e)
            | PublishResult::Ambiguous(e) => Some(e),
        }
    }
}

impl From<Result<PublishedPost, PublishError>> for PublishResult {
    fn from(outcome: Result<PublishedPost, PublishError>) -> Self {
        match outcome {
            Ok(post) => PublishResult::Success(post),
            Err(e) if e.kind() == ErrorKind::Ambiguous => PublishResult::Ambiguous(e),
            Err(e) if e.kind().is_permanent() => PublishResult::Permanent(e),
            Err(e) => PublishResult::Transient(e),
        }
    }
}

/// A platform integration
#[async_trait]
pub trait Publisher: Send + Sync {
    fn platform(&self) -> Platform;

    fn constraints(&self) -> &ContentConstraints;

    /// Pre-flight checks against the adapter's constraints
    fn validate(&self, content: &ContentItem) -> ValidationResult {
        validate_content(content, self.constraints())
    }

    /// Pure rendering of `content` for this platform; no network access
    fn preview(&self, content: &ContentItem, _settings: &ChannelSettings) -> RenderedContent {
        let text = render_text(content);
        RenderedContent {
            char_count: text.chars().count(),
            text,
            media: content.media.clone(),
            validation: self.validate(content),
        }
    }

    /// Perform the network call and classify the outcome
    async fn publish(&self, request: &PublishRequest) -> PublishResult;

    /// Whether [`find_existing`](Publisher::find_existing) can answer
    /// "did this already post?"
    fn supports_lookup(&self) -> bool {
        false
    }

    /// Look for a post created by an earlier attempt of the same request
    async fn find_existing(
        &self,
        _request: &PublishRequest,
    ) -> Result<Option<PublishedPost>, PublishError> {
        Ok(None)
    }
}

fn normalize_tag(tag: &str) -> Option<String> {
    let tag = tag.trim().trim_start_matches('#');
    if tag.is_empty() {
        None
    } else {
        Some(format!("#{}", tag))
    }
}

/// Caption followed by the hashtags it doesn't already contain
pub fn render_text(content: &ContentItem) -> String {
    let caption = content.caption.trim_end();
    let caption_lower = caption.to_lowercase();

    let mut tags: Vec<String> = Vec::new();
    for tag in content.hashtags.iter().filter_map(|t| normalize_tag(t)) {
        let lower = tag.to_lowercase();
        let present = caption_lower
            .split_whitespace()
            .any(|word| word.trim_end_matches(|c: char| c.is_ascii_punctuation()) == lower);
        if !present && !tags.iter().any(|t| t.to_lowercase() == lower) {
            tags.push(tag);
        }
    }

    match (caption.is_empty(), tags.is_empty()) {
        (_, true) => caption.to_string(),
        (true, false) => tags.join(" "),
        (false, false) => format!("{}\n\n{}", caption, tags.join(" ")),
    }
}

fn count_hashtags(text: &str) -> usize {
    text.split_whitespace()
        .filter(|word| word.len() > 1 && word.starts_with('#'))
        .count()
}

/// Check `content` against `constraints`
pub fn validate_content(
    content: &ContentItem,
    constraints: &ContentConstraints,
) -> ValidationResult {
    let mut result = ValidationResult::default();
    let text = render_text(content);
    let char_count = text.chars().count();

    if text.trim().is_empty() && content.media.is_empty() {
        result
            .errors
            .push("Content cannot be empty (no caption and no media)".to_string());
    }

    if char_count > constraints.max_chars {
        result.errors.push(format!(
            "Content exceeds {} character limit (got {} characters)",
            constraints.max_chars, char_count
        ));
    }

    if content.media.len() > constraints.max_media {
        result.errors.push(format!(
            "Too many media items: {} (maximum {})",
            content.media.len(),
            constraints.max_media
        ));
    }

    if !constraints.allow_video && content.media.iter().any(|m| m.kind == MediaKind::Video) {
        result
            .errors
            .push("Video attachments are not supported".to_string());
    }

    let hashtags = count_hashtags(&text);
    if hashtags > constraints.hashtag_warning {
        result.warnings.push(format!(
            "{} hashtags exceeds the recommended maximum of {}",
            hashtags, constraints.hashtag_warning
        ));
    }

    result
}
