//! Core types for Polycast

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ErrorKind;

/// External platforms with a publisher adapter.
///
/// The set is closed: adapters are resolved from this enum through the
/// registry built at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub enum Platform {
    #[serde(rename = "meta")]
    Meta,
    #[serde(rename = "linkedin")]
    LinkedIn,
    #[serde(rename = "google_business")]
    GoogleBusiness,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Meta, Platform::LinkedIn, Platform::GoogleBusiness];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Meta => "meta",
            Platform::LinkedIn => "linkedin",
            Platform::GoogleBusiness => "google_business",
        }
    }

    /// Human-readable name for messages
    pub fn display_name(&self) -> &'static str {
        match self {
            Platform::Meta => "Meta",
            Platform::LinkedIn => "LinkedIn",
            Platform::GoogleBusiness => "Google Business",
        }
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "meta" | "facebook" => Ok(Platform::Meta),
            "linkedin" => Ok(Platform::LinkedIn),
            "google_business" | "google-business" | "google" => Ok(Platform::GoogleBusiness),
            _ => Err(format!(
                "Unknown platform: '{}'. Valid options: meta, linkedin, google_business",
                s
            )),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

/// Reference to media hosted by the content collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    pub kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_text: Option<String>,
}

/// Publishable payload. Never mutated by the dispatch engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub media: Vec<MediaRef>,
    #[serde(default)]
    pub hashtags: Vec<String>,
    #[serde(default = "now_timestamp")]
    pub created_at: i64,
}

impl ContentItem {
    pub fn new(caption: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: None,
            caption: caption.into(),
            media: Vec::new(),
            hashtags: Vec::new(),
            created_at: now_timestamp(),
        }
    }
}

fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub enabled: bool,
}

/// Integration-specific settings of a channel (e.g. `page_id`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelSettings(pub Map<String, Value>);

impl ChannelSettings {
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str).filter(|v| !v.is_empty())
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }
}

/// A connected external account.
///
/// The credential is opaque to the engine and stays wrapped so it cannot end
/// up in logs.
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: String,
    pub organization_id: String,
    pub platform: Platform,
    pub account_ref: String,
    pub credential: SecretString,
    pub settings: ChannelSettings,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Pending,
    Claimed,
    Publishing,
    Posted,
    Failed,
    Cancelled,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Pending => "pending",
            ScheduleStatus::Claimed => "claimed",
            ScheduleStatus::Publishing => "publishing",
            ScheduleStatus::Posted => "posted",
            ScheduleStatus::Failed => "failed",
            ScheduleStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ScheduleStatus::Pending),
            "claimed" => Some(ScheduleStatus::Claimed),
            "publishing" => Some(ScheduleStatus::Publishing),
            "posted" => Some(ScheduleStatus::Posted),
            "failed" => Some(ScheduleStatus::Failed),
            "cancelled" => Some(ScheduleStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScheduleStatus::Posted | ScheduleStatus::Failed | ScheduleStatus::Cancelled
        )
    }

    /// Whether the store accepts a move from `self` to `next`.
    ///
    /// Mirrors the `schedule_entries_forward_only` trigger.
    pub fn can_transition_to(&self, next: ScheduleStatus) -> bool {
        use ScheduleStatus::*;
        matches!(
            (self, next),
            (Pending, Claimed)
                | (Pending, Cancelled)
                | (Claimed, Publishing)
                | (Claimed, Pending)
                | (Claimed, Failed)
                | (Publishing, Posted)
                | (Publishing, Failed)
                | (Publishing, Pending)
                | (Failed, Pending)
        )
    }
}

impl std::fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScheduleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(&s.to_lowercase()).ok_or_else(|| format!("Unknown status: '{}'", s))
    }
}

/// One (content, channel, time) unit of publishing work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    pub group_id: String,
    pub content_item_id: String,
    pub channel_id: String,
    pub scheduled_for: i64,
    pub status: ScheduleStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub last_error_kind: Option<ErrorKind>,
    pub idempotency_key: String,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<i64>,
    pub not_before: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStatus {
    Live,
    Removed,
}

impl RemoteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteStatus::Live => "live",
            RemoteStatus::Removed => "removed",
        }
    }
}

/// Result of a successful publish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalReference {
    pub id: Option<i64>,
    pub schedule_entry_id: String,
    pub platform: Platform,
    pub external_post_id: String,
    pub external_url: Option<String>,
    pub posted_at: i64,
    pub likes: i64,
    pub comments: i64,
    pub shares: i64,
    pub remote_status: RemoteStatus,
    pub engagement_updated_at: Option<i64>,
}

impl ExternalReference {
    pub fn new(
        schedule_entry_id: String,
        platform: Platform,
        external_post_id: String,
        external_url: Option<String>,
        posted_at: i64,
    ) -> Self {
        Self {
            id: None,
            schedule_entry_id,
            platform,
            external_post_id,
            external_url,
            posted_at,
            likes: 0,
            comments: 0,
            shares: 0,
            remote_status: RemoteStatus::Live,
            engagement_updated_at: None,
        }
    }
}

/// Inbound platform notification as persisted
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub id: Option<i64>,
    pub platform: Platform,
    pub dedup_key: String,
    pub payload: String,
    pub signature: String,
    pub received_at: i64,
    pub processed_at: Option<i64>,
}

/// Normalized change carried by a platform webhook
#[derive(Debug, Clone, PartialEq)]
pub enum EngagementUpdate {
    /// Incremental counter change (a reaction, comment or share added/removed)
    Delta {
        external_post_id: String,
        metric: EngagementMetric,
        delta: i64,
    },
    /// Absolute counters reported by the platform
    Snapshot {
        external_post_id: String,
        likes: Option<i64>,
        comments: Option<i64>,
        shares: Option<i64>,
    },
    /// The post was deleted or hidden on the platform
    Removed { external_post_id: String },
}

impl EngagementUpdate {
    pub fn external_post_id(&self) -> &str {
        match self {
            EngagementUpdate::Delta { external_post_id, .. }
            | EngagementUpdate::Snapshot { external_post_id, .. }
            | EngagementUpdate::Removed { external_post_id } => external_post_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngagementMetric {
    Likes,
    Comments,
    Shares,
}

impl EngagementMetric {
    pub fn column(&self) -> &'static str {
        match self {
            EngagementMetric::Likes => "likes",
            EngagementMetric::Comments => "comments",
            EngagementMetric::Shares => "shares",
        }
    }
}

/// Audit row written by the store on every status change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleTransition {
    pub entry_id: String,
    pub from_status: Option<ScheduleStatus>,
    pub to_status: ScheduleStatus,
    pub worker_id: Option<String>,
    pub at: i64,
}

/// Operator-facing view returned by `get_status`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryStatus {
    pub entry_id: String,
    pub group_id: String,
    pub channel_id: String,
    pub platform: Platform,
    pub status: ScheduleStatus,
    pub scheduled_for: i64,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub last_error_kind: Option<ErrorKind>,
    pub not_before: Option<i64>,
    pub external_post_id: Option<String>,
    pub external_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_parse_and_display() {
        assert_eq!("meta".parse::<Platform>().unwrap(), Platform::Meta);
        assert_eq!("LinkedIn".parse::<Platform>().unwrap(), Platform::LinkedIn);
        assert_eq!(
            "google-business".parse::<Platform>().unwrap(),
            Platform::GoogleBusiness
        );
        assert!("myspace".parse::<Platform>().is_err());

        for platform in Platform::ALL {
            assert_eq!(platform.to_string().parse::<Platform>().unwrap(), platform);
        }
    }

    #[test]
    fn test_platform_serde_names_match_storage() {
        let json = serde_json::to_string(&Platform::GoogleBusiness).unwrap();
        assert_eq!(json, r#""google_business""#);
        let json = serde_json::to_string(&Platform::LinkedIn).unwrap();
        assert_eq!(json, r#""linkedin""#);
    }

    #[test]
    fn test_status_forward_transitions() {
        use ScheduleStatus::*;
        assert!(Pending.can_transition_to(Claimed));
        assert!(Claimed.can_transition_to(Publishing));
        assert!(Publishing.can_transition_to(Posted));
        assert!(Publishing.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Cancelled));

        // Backoff / lease release and operator requeue
        assert!(Claimed.can_transition_to(Pending));
        assert!(Publishing.can_transition_to(Pending));
        assert!(Failed.can_transition_to(Pending));
    }

    #[test]
    fn test_status_rejects_regressions() {
        use ScheduleStatus::*;
        assert!(!Posted.can_transition_to(Pending));
        assert!(!Posted.can_transition_to(Failed));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Publishing.can_transition_to(Claimed));
        assert!(!Claimed.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Posted));
        assert!(!Pending.can_transition_to(Publishing));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ScheduleStatus::Posted.is_terminal());
        assert!(ScheduleStatus::Failed.is_terminal());
        assert!(ScheduleStatus::Cancelled.is_terminal());
        assert!(!ScheduleStatus::Pending.is_terminal());
        assert!(!ScheduleStatus::Claimed.is_terminal());
        assert!(!ScheduleStatus::Publishing.is_terminal());
    }

    #[test]
    fn test_content_item_new_defaults() {
        let before = chrono::Utc::now().timestamp();
        let item = ContentItem::new("Hello");
        assert!(uuid::Uuid::parse_str(&item.id).is_ok());
        assert_eq!(item.caption, "Hello");
        assert!(item.media.is_empty());
        assert!(item.created_at >= before);
    }

    #[test]
    fn test_content_item_deserializes_with_defaults() {
        let item: ContentItem = serde_json::from_str(
            r#"{"id": "c1", "caption": "Launch day", "hashtags": ["launch"]}"#,
        )
        .unwrap();
        assert_eq!(item.id, "c1");
        assert_eq!(item.hashtags, vec!["launch".to_string()]);
        assert!(item.media.is_empty());
        assert!(item.title.is_none());
    }

    #[test]
    fn test_channel_settings_lookup() {
        let settings = ChannelSettings::default()
            .with("page_id", "12345")
            .with("empty", "");
        assert_eq!(settings.get_str("page_id"), Some("12345"));
        assert_eq!(settings.get_str("empty"), None);
        assert_eq!(settings.get_str("missing"), None);
    }

    #[test]
    fn test_channel_debug_redacts_credential() {
        let channel = Channel {
            id: "ch".into(),
            organization_id: "org".into(),
            platform: Platform::Meta,
            account_ref: "acct".into(),
            credential: SecretString::from("super-secret-token".to_string()),
            settings: ChannelSettings::default(),
            created_at: 0,
        };
        let debug = format!("{:?}", channel);
        assert!(!debug.contains("super-secret-token"));
    }
}
