//! Webhook event types
//!
//! Defines the event tags, the `{type, timestamp, data}` envelope and the
//! typed payloads sent to subscribers.

use crate::{Result, WebhookError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Webhook event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    // Page events
    #[serde(rename = "page.created")]
    PageCreated,
    #[serde(rename = "page.updated")]
    PageUpdated,
    #[serde(rename = "page.deleted")]
    PageDeleted,
    #[serde(rename = "page.published")]
    PagePublished,
    #[serde(rename = "page.unpublished")]
    PageUnpublished,

    // Media events
    #[serde(rename = "media.uploaded")]
    MediaUploaded,
    #[serde(rename = "media.updated")]
    MediaUpdated,
    #[serde(rename = "media.deleted")]
    MediaDeleted,

    // Form events
    #[serde(rename = "form.submitted")]
    FormSubmitted,

    // User events
    #[serde(rename = "user.created")]
    UserCreated,
    #[serde(rename = "user.updated")]
    UserUpdated,
    #[serde(rename = "user.deleted")]
    UserDeleted,

    // Connectivity check sent from the admin UI
    #[serde(rename = "test")]
    Test,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PageCreated => "page.created",
            Self::PageUpdated => "page.updated",
            Self::PageDeleted => "page.deleted",
            Self::PagePublished => "page.published",
            Self::PageUnpublished => "page.unpublished",
            Self::MediaUploaded => "media.uploaded",
            Self::MediaUpdated => "media.updated",
            Self::MediaDeleted => "media.deleted",
            Self::FormSubmitted => "form.submitted",
            Self::UserCreated => "user.created",
            Self::UserUpdated => "user.updated",
            Self::UserDeleted => "user.deleted",
            Self::Test => "test",
        }
    }

    /// Every event type a webhook can subscribe to
    pub fn all() -> &'static [EventType] {
        &[
            Self::PageCreated,
            Self::PageUpdated,
            Self::PageDeleted,
            Self::PagePublished,
            Self::PageUnpublished,
            Self::MediaUploaded,
            Self::MediaUpdated,
            Self::MediaDeleted,
            Self::FormSubmitted,
            Self::UserCreated,
            Self::UserUpdated,
            Self::UserDeleted,
            Self::Test,
        ]
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = WebhookError;

    fn from_str(s: &str) -> Result<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| WebhookError::UnknownEventType(s.to_string()))
    }
}

/// Identifies the entity an event is about, for coalescing.
///
/// Payloads that do not describe a single entity return `None`; the
/// debouncer then falls back to keying on the event type alone.
pub trait EntityKey {
    fn entity_id(&self) -> Option<i64>;
}

/// Webhook event envelope, serialized as the request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub data: EventData,
}

impl Event {
    pub fn new(event_type: EventType, data: EventData) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            data,
        }
    }

    /// Serialize to the wire body
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| WebhookError::Serialization(e.to_string()))
    }
}

/// Event payload; serialized as the bare payload object
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventData {
    Page(PageEventData),
    Media(MediaEventData),
    Form(FormEventData),
    User(UserEventData),
    Test(TestEventData),
    Custom(serde_json::Value),
}

impl EntityKey for EventData {
    fn entity_id(&self) -> Option<i64> {
        match self {
            Self::Page(data) => data.entity_id(),
            Self::Media(data) => data.entity_id(),
            Self::Form(data) => data.entity_id(),
            Self::User(data) => data.entity_id(),
            Self::Test(data) => data.entity_id(),
            Self::Custom(_) => None,
        }
    }
}

/// Page event data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageEventData {
    pub id: i64,
    pub title: String,
    pub slug: String,
    pub status: String,
    pub author_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

impl PageEventData {
    pub fn new(id: i64, title: &str, slug: &str, status: &str, author_id: i64) -> Self {
        Self {
            id,
            title: title.to_string(),
            slug: slug.to_string(),
            status: status.to_string(),
            author_id,
            language_code: None,
            published_at: None,
        }
    }

    pub fn with_language(mut self, language_code: &str) -> Self {
        self.language_code = Some(language_code.to_string());
        self
    }

    pub fn with_published_at(mut self, published_at: DateTime<Utc>) -> Self {
        self.published_at = Some(published_at);
        self
    }
}

impl EntityKey for PageEventData {
    fn entity_id(&self) -> Option<i64> {
        Some(self.id)
    }
}

/// Media event data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaEventData {
    pub id: i64,
    pub uuid: String,
    pub filename: String,
    pub mime_type: String,
    pub size: i64,
    pub uploader_id: i64,
}

impl EntityKey for MediaEventData {
    fn entity_id(&self) -> Option<i64> {
        Some(self.id)
    }
}

/// Form submission event data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormEventData {
    pub form_id: i64,
    pub form_name: String,
    pub form_slug: String,
    pub submission_id: i64,
    pub data: BTreeMap<String, String>,
}

impl EntityKey for FormEventData {
    // Each submission is its own entity; submissions are never merged.
    fn entity_id(&self) -> Option<i64> {
        Some(self.submission_id)
    }
}

/// User event data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEventData {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub role: String,
}

impl EntityKey for UserEventData {
    fn entity_id(&self) -> Option<i64> {
        Some(self.id)
    }
}

/// Test event data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestEventData {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_id: Option<i64>,
}

impl TestEventData {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
            webhook_id: None,
        }
    }
}

impl EntityKey for TestEventData {
    fn entity_id(&self) -> Option<i64> {
        None
    }
}
