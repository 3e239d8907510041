//! Shared helpers for the dispatcher integration tests.

#![allow(dead_code)]

use chrono::{Duration as ChronoDuration, Utc};
use ocms_webhook::{
    Delivery, DeliveryStatus, DispatcherConfig, InMemoryWebhookStore, Webhook, WebhookDispatcher,
    WebhookStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const SECRET: &str = "integration-secret";

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Config with background scans pushed out of the way, so tests drive them
pub fn test_config() -> DispatcherConfig {
    DispatcherConfig {
        workers: 2,
        retry_scan_interval: Duration::from_secs(3600),
        cleanup_interval: Duration::from_secs(3600),
        debounce: None,
        ..Default::default()
    }
}

pub fn start_dispatcher(
    store: Arc<InMemoryWebhookStore>,
    config: DispatcherConfig,
) -> WebhookDispatcher {
    let dispatcher = WebhookDispatcher::new(store, config, CancellationToken::new())
        .expect("Failed to create dispatcher");
    dispatcher.start();
    dispatcher
}

pub async fn subscribe(
    store: &InMemoryWebhookStore,
    name: &str,
    url: &str,
    events: &[&str],
) -> Webhook {
    store
        .save_webhook(&Webhook::new(name, url, SECRET).with_events(events))
        .await
        .expect("Failed to save webhook")
}

/// Poll a delivery until `done` holds, panicking after a timeout
pub async fn wait_for<F>(store: &InMemoryWebhookStore, id: i64, done: F) -> Delivery
where
    F: Fn(&Delivery) -> bool,
{
    let deadline = tokio::time::Instant::now() + POLL_TIMEOUT;

    loop {
        let delivery = store
            .get_delivery(id)
            .await
            .unwrap()
            .expect("delivery should exist");

        if done(&delivery) {
            return delivery;
        }

        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for delivery {}: {:?}",
            id,
            delivery
        );
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

pub async fn wait_for_status(
    store: &InMemoryWebhookStore,
    id: i64,
    status: DeliveryStatus,
) -> Delivery {
    wait_for(store, id, |d| d.status == status).await
}

pub async fn wait_for_attempts(store: &InMemoryWebhookStore, id: i64, attempts: u32) -> Delivery {
    wait_for(store, id, |d| d.attempts == attempts).await
}

/// Make a pending delivery due right now
pub async fn make_due(store: &InMemoryWebhookStore, id: i64) {
    let applied = store
        .reschedule_delivery(id, Utc::now() - ChronoDuration::seconds(1))
        .await
        .unwrap();
    assert!(applied, "delivery {} should be pending", id);
}
