//! Webhook dispatch engine for oCMS
//!
//! Turns domain events (pages, media, forms, users) into signed HTTP
//! callbacks with at-least-once delivery:
//! - Fan-out of each event to every active, subscribed webhook
//! - A persisted delivery record per subscriber, worked off by a bounded
//!   queue and a fixed worker pool
//! - HMAC-SHA256 signatures over the exact body bytes
//! - Exponential backoff retries, dead-lettering and retention cleanup
//! - Optional debouncing of bursts for the same entity
//!
//! Receivers authenticate a request by recomputing `X-Webhook-Signature`
//! over the raw body, and deduplicate retried or doubly-scanned
//! deliveries with `X-Webhook-Delivery-ID`.
//!
//! # Example
//!
//! ```rust,ignore
//! use ocms_webhook::{
//!     DispatcherConfig, EventData, EventType, InMemoryWebhookStore, PageEventData,
//!     WebhookDispatcher,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let store = Arc::new(InMemoryWebhookStore::new());
//! let dispatcher =
//!     WebhookDispatcher::new(store, DispatcherConfig::default(), CancellationToken::new())?;
//! dispatcher.start();
//!
//! dispatcher
//!     .dispatch_event(
//!         EventType::PagePublished,
//!         EventData::Page(PageEventData::new(42, "Hello", "hello", "published", 1)),
//!     )
//!     .await;
//!
//! dispatcher.stop().await;
//! ```

// Module order matters due to dependencies
pub mod events;
pub mod signature;
pub mod store;
pub mod executor;
pub mod debounce;
pub mod dispatcher;

pub use events::*;
pub use signature::*;
pub use store::*;
pub use executor::*;
pub use debounce::*;
pub use dispatcher::*;

use thiserror::Error;

/// Webhook errors
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("Webhook not found: {0}")]
    NotFound(i64),

    #[error("Invalid webhook URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid webhook header: {0}")]
    InvalidHeader(String),

    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Signature verification failed: {0}")]
    SignatureVerificationFailed(String),

    #[error("Webhook dispatcher is not running")]
    NotRunning,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, WebhookError>;
