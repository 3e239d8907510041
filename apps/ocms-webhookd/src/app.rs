//! Application state and initialization

use anyhow::{Context, Result};
use std::str::FromStr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ocms_core::{AppConfig, SubscriberSeed};
use ocms_webhook::{
    DispatcherConfig, EventData, EventType, InMemoryWebhookStore, TestEventData, Webhook,
    WebhookDispatcher, WebhookStore,
};

/// Convert a configured subscriber into a webhook, rejecting unknown event names
pub fn webhook_from_seed(seed: &SubscriberSeed) -> Result<Webhook> {
    for event in &seed.events {
        EventType::from_str(event)
            .with_context(|| format!("Subscriber '{}' lists an invalid event", seed.name))?;
    }

    let mut webhook = Webhook::new(&seed.name, &seed.url, &seed.secret)
        .with_events(seed.events.as_slice())
        .with_active(seed.active);
    for (name, value) in &seed.headers {
        webhook = webhook.with_header(name, value);
    }

    Ok(webhook)
}

/// Main application
pub struct App {
    store: Arc<InMemoryWebhookStore>,
    dispatcher: WebhookDispatcher,
    shutdown: CancellationToken,
}

impl App {
    /// Build the store and dispatcher and register the configured subscribers
    pub async fn build(config: &AppConfig) -> Result<Self> {
        info!("Initializing webhook dispatcher");

        let store = Arc::new(InMemoryWebhookStore::new());
        for seed in &config.subscribers {
            let webhook = store
                .save_webhook(&webhook_from_seed(seed)?)
                .await
                .context("Failed to register subscriber")?;

            info!(
                webhook_id = webhook.id,
                name = %webhook.name,
                url = %webhook.url,
                events = ?webhook.events,
                active = webhook.is_active,
                "Registered subscriber"
            );
        }

        if config.subscribers.is_empty() {
            warn!("No subscribers configured, events will not be delivered anywhere");
        }

        let shutdown = CancellationToken::new();
        let dispatcher = WebhookDispatcher::new(
            store.clone(),
            DispatcherConfig::from(&config.webhooks),
            shutdown.clone(),
        )
        .context("Failed to create webhook dispatcher")?;

        Ok(Self {
            store,
            dispatcher,
            shutdown,
        })
    }

    pub fn store(&self) -> &Arc<InMemoryWebhookStore> {
        &self.store
    }

    /// Run the dispatcher until a shutdown signal arrives
    pub async fn run(self, send_test: bool) -> Result<()> {
        self.dispatcher.start();

        if send_test {
            self.dispatcher
                .dispatch_immediate(
                    EventType::Test,
                    EventData::Test(TestEventData::new("Test webhook from oCMS")),
                )
                .await;
        }

        shutdown_signal().await;
        info!("Shutdown signal received");

        self.dispatcher.stop().await;
        self.shutdown.cancel();

        let pending = self
            .store()
            .deliveries()
            .iter()
            .filter(|d| !d.status.is_terminal())
            .count();
        if pending > 0 {
            warn!(pending, "Undelivered webhooks are lost with the in-memory store");
        }

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
