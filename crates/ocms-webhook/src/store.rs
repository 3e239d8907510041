//! Webhook persistence port
//!
//! Subscribers and delivery records as the engine sees them, the
//! `WebhookStore` trait the engine consumes, and an in-memory adapter.

use crate::{Result, WebhookError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Webhook subscriber
#[derive(Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: i64,
    pub name: String,
    pub url: String,
    /// Shared signing secret; never logged
    pub secret: String,
    /// Subscribed event types; membership only, order and duplicates are irrelevant
    pub events: Vec<String>,
    pub is_active: bool,
    /// Custom request headers, layered over the fixed ones
    pub headers: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Webhook {
    /// Create an unsaved webhook; the store assigns the ID
    pub fn new(name: &str, url: &str, secret: &str) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: name.to_string(),
            url: url.to_string(),
            secret: secret.to_string(),
            events: Vec::new(),
            is_active: true,
            headers: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_events<S: AsRef<str>>(mut self, events: &[S]) -> Self {
        self.events = events.iter().map(|e| e.as_ref().to_string()).collect();
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.is_active = active;
        self
    }

    /// Exact membership check of an event type in the subscribed set
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.events.iter().any(|e| e == event_type)
    }
}

impl fmt::Debug for Webhook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Webhook")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("url", &self.url)
            .field("secret", &"<redacted>")
            .field("events", &self.events)
            .field("is_active", &self.is_active)
            .field("headers", &self.headers)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Delivery status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Awaiting its first attempt or a scheduled retry
    Pending,
    /// Delivered successfully
    Delivered,
    /// Legacy failure state; never written by the engine
    Failed,
    /// Retry budget exhausted or permanent failure
    Dead,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    /// Terminal records are never processed again and are eligible for cleanup
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Dead)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Webhook delivery record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: i64,
    pub webhook_id: i64,
    pub event_type: String,
    /// Serialized event body; immutable once created
    pub payload: String,
    pub attempts: u32,
    pub response_code: Option<u16>,
    /// Truncated response body of the last attempt
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for a new delivery record
#[derive(Debug, Clone)]
pub struct NewDelivery {
    pub webhook_id: i64,
    pub event_type: String,
    pub payload: String,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Outcome of one attempt, written over the record's mutable fields
#[derive(Debug, Clone)]
pub struct DeliveryUpdate {
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub response_code: Option<u16>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Persistence operations used by the dispatch engine
#[async_trait]
pub trait WebhookStore: Send + Sync {
    /// Insert (ID 0) or replace a webhook, returning the stored copy
    async fn save_webhook(&self, webhook: &Webhook) -> Result<Webhook>;

    /// Get webhook by ID
    async fn get_webhook(&self, id: i64) -> Result<Option<Webhook>>;

    /// Activate or deactivate a webhook
    async fn set_webhook_active(&self, id: i64, active: bool) -> Result<()>;

    /// Active webhooks that may subscribe to an event type.
    ///
    /// The match may be approximate (false positives allowed); callers
    /// re-check membership with [`Webhook::subscribes_to`].
    async fn list_webhooks_for_event(&self, event_type: &str) -> Result<Vec<Webhook>>;

    /// Create a delivery record in `pending` status
    async fn create_delivery(&self, delivery: NewDelivery) -> Result<Delivery>;

    /// Get delivery by ID
    async fn get_delivery(&self, id: i64) -> Result<Option<Delivery>>;

    /// Record an attempt outcome.
    ///
    /// Must not touch a record already in a terminal state. Returns whether
    /// the update was applied.
    async fn update_delivery(&self, id: i64, update: &DeliveryUpdate) -> Result<bool>;

    /// Move the retry time of a pending record. Returns whether it applied.
    async fn reschedule_delivery(&self, id: i64, next_retry_at: DateTime<Utc>) -> Result<bool>;

    /// Pending records due at `now` (a null retry time counts as due),
    /// oldest retry time first, at most `limit`
    async fn list_due_deliveries(&self, now: DateTime<Utc>, limit: usize)
        -> Result<Vec<Delivery>>;

    /// Delete delivered and dead records last updated before `cutoff`
    async fn delete_terminal_deliveries_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Delivery history for a webhook, newest first
    async fn list_deliveries_for_webhook(&self, webhook_id: i64, limit: usize)
        -> Result<Vec<Delivery>>;
}

/// In-memory webhook store
pub struct InMemoryWebhookStore {
    webhooks: DashMap<i64, Webhook>,
    deliveries: DashMap<i64, Delivery>,
    next_webhook_id: AtomicI64,
    next_delivery_id: AtomicI64,
}

impl InMemoryWebhookStore {
    pub fn new() -> Self {
        Self {
            webhooks: DashMap::new(),
            deliveries: DashMap::new(),
            next_webhook_id: AtomicI64::new(1),
            next_delivery_id: AtomicI64::new(1),
        }
    }

    /// Insert a delivery record verbatim, keeping its ID and timestamps
    pub fn insert_delivery(&self, delivery: Delivery) {
        self.next_delivery_id
            .fetch_max(delivery.id + 1, Ordering::SeqCst);
        self.deliveries.insert(delivery.id, delivery);
    }

    /// Snapshot of every delivery record, ordered by ID
    pub fn deliveries(&self) -> Vec<Delivery> {
        let mut deliveries: Vec<_> = self.deliveries.iter().map(|d| d.clone()).collect();
        deliveries.sort_by_key(|d| d.id);
        deliveries
    }
}

impl Default for InMemoryWebhookStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookStore for InMemoryWebhookStore {
    async fn save_webhook(&self, webhook: &Webhook) -> Result<Webhook> {
        let mut stored = webhook.clone();

        if stored.id == 0 {
            stored.id = self.next_webhook_id.fetch_add(1, Ordering::SeqCst);
        } else if !self.webhooks.contains_key(&stored.id) {
            return Err(WebhookError::NotFound(stored.id));
        }

        stored.updated_at = Utc::now();
        self.webhooks.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_webhook(&self, id: i64) -> Result<Option<Webhook>> {
        Ok(self.webhooks.get(&id).map(|w| w.clone()))
    }

    async fn set_webhook_active(&self, id: i64, active: bool) -> Result<()> {
        let mut webhook = self
            .webhooks
            .get_mut(&id)
            .ok_or(WebhookError::NotFound(id))?;

        webhook.is_active = active;
        webhook.updated_at = Utc::now();
        Ok(())
    }

    async fn list_webhooks_for_event(&self, event_type: &str) -> Result<Vec<Webhook>> {
        // Substring match, like a LIKE prefilter over the stored event list.
        let mut webhooks: Vec<_> = self
            .webhooks
            .iter()
            .filter(|w| w.is_active && w.events.iter().any(|e| e.contains(event_type)))
            .map(|w| w.clone())
            .collect();

        webhooks.sort_by_key(|w| w.id);
        Ok(webhooks)
    }

    async fn create_delivery(&self, delivery: NewDelivery) -> Result<Delivery> {
        let now = Utc::now();
        let record = Delivery {
            id: self.next_delivery_id.fetch_add(1, Ordering::SeqCst),
            webhook_id: delivery.webhook_id,
            event_type: delivery.event_type,
            payload: delivery.payload,
            attempts: 0,
            response_code: None,
            response_body: None,
            error_message: None,
            next_retry_at: delivery.next_retry_at,
            delivered_at: None,
            status: DeliveryStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        self.deliveries.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_delivery(&self, id: i64) -> Result<Option<Delivery>> {
        Ok(self.deliveries.get(&id).map(|d| d.clone()))
    }

    async fn update_delivery(&self, id: i64, update: &DeliveryUpdate) -> Result<bool> {
        let Some(mut delivery) = self.deliveries.get_mut(&id) else {
            return Ok(false);
        };

        if delivery.status.is_terminal() {
            return Ok(false);
        }

        delivery.status = update.status;
        delivery.attempts = update.attempts;
        delivery.response_code = update.response_code;
        delivery.response_body = update.response_body.clone();
        delivery.error_message = update.error_message.clone();
        delivery.next_retry_at = update.next_retry_at;
        delivery.delivered_at = update.delivered_at;
        delivery.updated_at = Utc::now();
        Ok(true)
    }

    async fn reschedule_delivery(&self, id: i64, next_retry_at: DateTime<Utc>) -> Result<bool> {
        let Some(mut delivery) = self.deliveries.get_mut(&id) else {
            return Ok(false);
        };

        if delivery.status != DeliveryStatus::Pending {
            return Ok(false);
        }

        delivery.next_retry_at = Some(next_retry_at);
        delivery.updated_at = Utc::now();
        Ok(true)
    }

    async fn list_due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Delivery>> {
        let mut due: Vec<_> = self
            .deliveries
            .iter()
            .filter(|d| {
                d.status == DeliveryStatus::Pending
                    && d.next_retry_at.map(|t| t <= now).unwrap_or(true)
            })
            .map(|d| d.clone())
            .collect();

        // Null sorts first: those rows have waited the longest.
        due.sort_by_key(|d| (d.next_retry_at, d.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn delete_terminal_deliveries_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let to_remove: Vec<_> = self
            .deliveries
            .iter()
            .filter(|d| d.status.is_terminal() && d.updated_at < cutoff)
            .map(|d| d.id)
            .collect();

        let mut removed = 0u64;
        for id in to_remove {
            if self.deliveries.remove(&id).is_some() {
                removed += 1;
            }
        }

        Ok(removed)
    }

    async fn list_deliveries_for_webhook(
        &self,
        webhook_id: i64,
        limit: usize,
    ) -> Result<Vec<Delivery>> {
        let mut deliveries: Vec<_> = self
            .deliveries
            .iter()
            .filter(|d| d.webhook_id == webhook_id)
            .map(|d| d.clone())
            .collect();

        deliveries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        deliveries.truncate(limit);
        Ok(deliveries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_delivery(webhook_id: i64) -> NewDelivery {
        NewDelivery {
            webhook_id,
            event_type: "page.created".to_string(),
            payload: "{}".to_string(),
            next_retry_at: None,
        }
    }

    fn update(status: DeliveryStatus, attempts: u32) -> DeliveryUpdate {
        DeliveryUpdate {
            status,
            attempts,
            response_code: Some(200),
            response_body: None,
            error_message: None,
            next_retry_at: None,
            delivered_at: Some(Utc::now()),
        }
    }

    fn aged(id: i64, status: DeliveryStatus, age: Duration) -> Delivery {
        let at = Utc::now() - age;
        Delivery {
            id,
            webhook_id: 1,
            event_type: "page.updated".to_string(),
            payload: "{}".to_string(),
            attempts: 1,
            response_code: None,
            response_body: None,
            error_message: None,
            next_retry_at: None,
            delivered_at: None,
            status,
            created_at: at,
            updated_at: at,
        }
    }

    #[tokio::test]
    async fn test_webhook_crud() {
        let store = InMemoryWebhookStore::new();

        let saved = store
            .save_webhook(&Webhook::new("A", "https://a.example.com", "s").with_events(&["page.created"]))
            .await
            .unwrap();
        assert_eq!(saved.id, 1);

        store.set_webhook_active(saved.id, false).await.unwrap();
        let fetched = store.get_webhook(saved.id).await.unwrap().unwrap();
        assert!(!fetched.is_active);

        let mut missing = saved.clone();
        missing.id = 99;
        assert!(matches!(
            store.save_webhook(&missing).await,
            Err(WebhookError::NotFound(99))
        ));
        assert!(store.set_webhook_active(99, true).await.is_err());
    }

    #[tokio::test]
    async fn test_event_prefilter_is_approximate() {
        let store = InMemoryWebhookStore::new();
        store
            .save_webhook(&Webhook::new("A", "https://a", "s").with_events(&["page.published"]))
            .await
            .unwrap();
        store
            .save_webhook(&Webhook::new("B", "https://b", "s").with_events(&["page.deleted"]))
            .await
            .unwrap();
        store
            .save_webhook(
                &Webhook::new("C", "https://c", "s")
                    .with_events(&["page.published"])
                    .with_active(false),
            )
            .await
            .unwrap();

        let matches = store.list_webhooks_for_event("page.published").await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].name, "A");

        // "page.publish" is a substring of "page.published"
        let loose = store.list_webhooks_for_event("page.publish").await.unwrap();
        assert_eq!(loose.len(), 1);
        assert!(!loose[0].subscribes_to("page.publish"));
    }

    #[tokio::test]
    async fn test_terminal_records_are_immutable() {
        let store = InMemoryWebhookStore::new();
        let delivery = store.create_delivery(new_delivery(1)).await.unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Pending);

        assert!(store
            .update_delivery(delivery.id, &update(DeliveryStatus::Delivered, 1))
            .await
            .unwrap());

        assert!(!store
            .update_delivery(delivery.id, &update(DeliveryStatus::Pending, 2))
            .await
            .unwrap());
        assert!(!store
            .reschedule_delivery(delivery.id, Utc::now())
            .await
            .unwrap());

        let stored = store.get_delivery(delivery.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Delivered);
        assert_eq!(stored.attempts, 1);
        assert!(!store.update_delivery(999, &update(DeliveryStatus::Dead, 1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_due_deliveries() {
        let store = InMemoryWebhookStore::new();
        let now = Utc::now();

        let later = store
            .create_delivery(NewDelivery {
                next_retry_at: Some(now + Duration::minutes(5)),
                ..new_delivery(1)
            })
            .await
            .unwrap();
        let older = store
            .create_delivery(NewDelivery {
                next_retry_at: Some(now - Duration::minutes(2)),
                ..new_delivery(1)
            })
            .await
            .unwrap();
        let recent = store
            .create_delivery(NewDelivery {
                next_retry_at: Some(now - Duration::minutes(1)),
                ..new_delivery(1)
            })
            .await
            .unwrap();
        let unscheduled = store.create_delivery(new_delivery(1)).await.unwrap();
        let done = store
            .create_delivery(NewDelivery {
                next_retry_at: Some(now - Duration::minutes(3)),
                ..new_delivery(1)
            })
            .await
            .unwrap();
        store
            .update_delivery(done.id, &update(DeliveryStatus::Dead, 5))
            .await
            .unwrap();

        let due = store.list_due_deliveries(now, 10).await.unwrap();
        let ids: Vec<_> = due.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![unscheduled.id, older.id, recent.id]);
        assert!(!ids.contains(&later.id));

        let limited = store.list_due_deliveries(now, 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_only_removes_old_terminal_records() {
        let store = InMemoryWebhookStore::new();
        store.insert_delivery(aged(1, DeliveryStatus::Delivered, Duration::days(60)));
        store.insert_delivery(aged(2, DeliveryStatus::Dead, Duration::days(31)));
        store.insert_delivery(aged(3, DeliveryStatus::Pending, Duration::days(90)));
        store.insert_delivery(aged(4, DeliveryStatus::Failed, Duration::days(90)));
        store.insert_delivery(aged(5, DeliveryStatus::Delivered, Duration::days(1)));

        let removed = store
            .delete_terminal_deliveries_before(Utc::now() - Duration::days(30))
            .await
            .unwrap();

        assert_eq!(removed, 2);
        let remaining: Vec<_> = store.deliveries().iter().map(|d| d.id).collect();
        assert_eq!(remaining, vec![3, 4, 5]);

        // IDs keep counting past inserted records
        let next = store.create_delivery(new_delivery(1)).await.unwrap();
        assert_eq!(next.id, 6);
    }

    #[tokio::test]
    async fn test_delivery_history() {
        let store = InMemoryWebhookStore::new();
        for _ in 0..3 {
            store.create_delivery(new_delivery(1)).await.unwrap();
        }
        store.create_delivery(new_delivery(2)).await.unwrap();

        let history = store.list_deliveries_for_webhook(1, 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|d| d.webhook_id == 1));
        assert!(history[0].id > history[1].id);
    }

    #[test]
    fn test_webhook_debug_redacts_secret() {
        let webhook = Webhook::new("A", "https://a", "do-not-log");
        let debug = format!("{:?}", webhook);

        assert!(!debug.contains("do-not-log"));
    }

    #[test]
    fn test_subscription_membership() {
        let webhook = Webhook::new("A", "https://a", "s")
            .with_events(&["page.created", "page.created", "media.deleted"]);

        assert!(webhook.subscribes_to("page.created"));
        assert!(webhook.subscribes_to("media.deleted"));
        assert!(!webhook.subscribes_to("page.updated"));
        assert!(!Webhook::new("B", "https://b", "s").subscribes_to("page.created"));
    }
}
