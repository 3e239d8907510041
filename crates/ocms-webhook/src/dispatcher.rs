//! Webhook dispatcher
//!
//! Fans events out to subscribed webhooks and owns the background work:
//! the delivery worker pool, the retry scanner and the cleanup sweep.
//!
//! Every fan-out target gets a persisted `pending` delivery before anything
//! is sent. Enqueueing onto the worker channel never blocks; a delivery that
//! does not fit is found later by the retry scanner.

use crate::{
    debounce::{DebounceConfig, Debouncer, EventSink},
    events::{Event, EventData, EventType},
    executor::{AttemptResult, DeliveryExecutor, ExecutorConfig, QueuedItem},
    store::{Delivery, DeliveryStatus, DeliveryUpdate, NewDelivery, Webhook, WebhookStore},
    Result, WebhookError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ocms_core::WebhookSettings;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Retry budget and backoff schedule
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt: `initial * 2^(attempt-1)`, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        1u32.checked_shl(attempt - 1)
            .and_then(|factor| self.initial_backoff.checked_mul(factor))
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
    pub retry_scan_interval: Duration,
    pub retry_batch_size: usize,
    /// How long a freshly queued delivery is left alone by the retry scanner
    pub requeue_grace: Duration,
    pub cleanup_interval: Duration,
    /// Age after which terminal deliveries are deleted
    pub retention: Duration,
    pub executor: ExecutorConfig,
    /// `None` disables debouncing
    pub debounce: Option<DebounceConfig>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from(&WebhookSettings::default())
    }
}

impl From<&WebhookSettings> for DispatcherConfig {
    fn from(settings: &WebhookSettings) -> Self {
        Self {
            workers: settings.workers,
            queue_capacity: settings.queue_capacity,
            retry: RetryPolicy {
                max_attempts: settings.max_attempts,
                initial_backoff: settings.initial_backoff(),
                max_backoff: settings.max_backoff(),
            },
            retry_scan_interval: settings.retry_scan_interval(),
            retry_batch_size: settings.retry_batch_size,
            requeue_grace: settings.requeue_grace(),
            cleanup_interval: settings.cleanup_interval(),
            retention: settings.retention(),
            executor: ExecutorConfig {
                request_timeout: settings.request_timeout(),
                max_response_body: settings.max_response_body_bytes,
                ..Default::default()
            },
            debounce: settings.debounce.enabled.then(|| DebounceConfig {
                interval: settings.debounce.interval(),
                max_wait: settings.debounce.max_wait(),
            }),
        }
    }
}

/// Dispatcher lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Result of one retry scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Due records fetched
    pub scanned: usize,
    /// Records handed to the workers
    pub enqueued: usize,
    /// Records left for a later scan because the queue was full
    pub deferred: usize,
    /// Records dead-lettered without an attempt
    pub dead_lettered: usize,
}

/// Debouncer status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceStats {
    pub pending: usize,
    pub enabled: bool,
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(now)
}

/// State shared by the dispatcher handle and its background tasks
struct Core {
    store: Arc<dyn WebhookStore>,
    executor: DeliveryExecutor,
    config: DispatcherConfig,
    shutdown: CancellationToken,
    state: Mutex<DispatcherState>,
    sender: RwLock<Option<mpsc::Sender<QueuedItem>>>,
    run_token: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    debouncer: RwLock<Option<Arc<Debouncer>>>,
}

impl Core {
    /// `None` once stopped or once the shutdown token fired
    fn sender(&self) -> Option<mpsc::Sender<QueuedItem>> {
        if self.shutdown.is_cancelled() {
            return None;
        }
        self.sender.read().clone()
    }

    fn state(&self) -> DispatcherState {
        let state = *self.state.lock();
        if state == DispatcherState::Running && self.shutdown.is_cancelled() {
            DispatcherState::Stopping
        } else {
            state
        }
    }

    fn start(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            warn!("Shutdown already requested, not starting webhook dispatcher");
            return;
        }

        {
            let mut state = self.state.lock();
            if *state != DispatcherState::Stopped {
                debug!(state = ?*state, "Webhook dispatcher already started");
                return;
            }
            *state = DispatcherState::Starting;
        }

        let config = &self.config;
        let workers = config.workers.max(1);
        let cancel = self.shutdown.child_token();
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        *self.sender.write() = Some(sender);
        *self.debouncer.write() = config.debounce.clone().map(|debounce| {
            let sink: Arc<dyn EventSink> = Arc::new(CoreSink(Arc::downgrade(self)));
            Arc::new(Debouncer::new(debounce, sink))
        });

        let mut tasks = Vec::with_capacity(workers + 2);
        for worker_id in 0..workers {
            tasks.push(tokio::spawn(worker_loop(
                Arc::clone(self),
                Arc::clone(&receiver),
                cancel.clone(),
                worker_id,
            )));
        }
        tasks.push(tokio::spawn(retry_loop(Arc::clone(self), cancel.clone())));
        tasks.push(tokio::spawn(cleanup_loop(Arc::clone(self), cancel.clone())));

        *self.tasks.lock() = tasks;
        *self.run_token.lock() = Some(cancel.clone());
        *self.state.lock() = DispatcherState::Running;

        // Not tracked in `tasks`: it may itself run `stop`.
        tokio::spawn(supervise(Arc::clone(self), cancel));

        info!(
            workers,
            queue_capacity = config.queue_capacity,
            debounce = config.debounce.is_some(),
            "Webhook dispatcher started"
        );
    }

    async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state != DispatcherState::Running {
                debug!(state = ?*state, "Webhook dispatcher not running");
                return;
            }
            *state = DispatcherState::Stopping;
        }

        info!("Stopping webhook dispatcher");

        // Flushed events still reach the queue: the sender is dropped afterwards.
        let debouncer = self.debouncer.write().take();
        if let Some(debouncer) = debouncer {
            debouncer.stop().await;
        }

        self.sender.write().take();
        if let Some(cancel) = self.run_token.lock().take() {
            cancel.cancel();
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(error = %e, "Webhook background task panicked");
                }
            }
        }

        *self.state.lock() = DispatcherState::Stopped;
        info!("Webhook dispatcher stopped");
    }

    fn queued_item(delivery: &Delivery, payload: Arc<str>, webhook: &Webhook) -> QueuedItem {
        QueuedItem {
            delivery_id: delivery.id,
            webhook_id: webhook.id,
            event_type: delivery.event_type.clone(),
            payload,
            attempts: delivery.attempts,
            url: webhook.url.clone(),
            secret: webhook.secret.clone(),
            headers: webhook.headers.clone(),
        }
    }

    /// Create one delivery per subscribed webhook and queue them
    async fn fan_out(&self, event: &Event) -> Result<usize> {
        let event_type = event.event_type.as_str();

        let Some(sender) = self.sender() else {
            if self.state() == DispatcherState::Stopping {
                error!(event_type, "Webhook dispatcher is shutting down, event lost");
            } else {
                warn!(event_type, "Webhook dispatcher is not running, dropping event");
            }
            return Ok(0);
        };

        let webhooks = self.store.list_webhooks_for_event(event_type).await?;

        // The store prefilter may over-match; membership is decided here.
        let targets: Vec<Webhook> = webhooks
            .into_iter()
            .filter(|w| w.is_active && w.subscribes_to(event_type))
            .collect();

        if targets.is_empty() {
            debug!(event_type, "No active webhooks subscribed to event");
            return Ok(0);
        }

        let payload: Arc<str> = Arc::from(event.to_json()?);
        let next_retry_at = after(Utc::now(), self.config.requeue_grace);
        let mut created = 0;

        for webhook in &targets {
            let delivery = match self
                .store
                .create_delivery(NewDelivery {
                    webhook_id: webhook.id,
                    event_type: event_type.to_string(),
                    payload: payload.to_string(),
                    next_retry_at: Some(next_retry_at),
                })
                .await
            {
                Ok(delivery) => delivery,
                Err(e) => {
                    error!(
                        webhook_id = webhook.id,
                        event_type,
                        error = %e,
                        "Failed to create webhook delivery, subscriber will miss this event"
                    );
                    continue;
                }
            };
            created += 1;

            let item = Self::queued_item(&delivery, Arc::clone(&payload), webhook);
            match sender.try_send(item) {
                Ok(()) => debug!(
                    delivery_id = delivery.id,
                    webhook_id = webhook.id,
                    event_type,
                    "Queued webhook delivery"
                ),
                Err(TrySendError::Full(_)) => debug!(
                    delivery_id = delivery.id,
                    webhook_id = webhook.id,
                    event_type,
                    "Delivery queue full, leaving delivery to the retry scanner"
                ),
                Err(TrySendError::Closed(_)) => debug!(
                    delivery_id = delivery.id,
                    webhook_id = webhook.id,
                    event_type,
                    "Delivery queue closed, leaving delivery to the retry scanner"
                ),
            }
        }

        info!(
            event_type,
            subscribers = targets.len(),
            deliveries = created,
            "Dispatched webhook event"
        );

        Ok(created)
    }

    async fn process(&self, item: QueuedItem) {
        let attempt = item.attempts + 1;
        let result = self.executor.execute(&item).await;
        self.record_outcome(&item, attempt, result).await;
    }

    async fn record_outcome(&self, item: &QueuedItem, attempt: u32, result: AttemptResult) {
        let now = Utc::now();
        let status_code = result.status_code;

        let update = if result.success {
            info!(
                delivery_id = item.delivery_id,
                webhook_id = item.webhook_id,
                event_type = %item.event_type,
                attempt,
                status_code,
                duration_ms = result.duration.as_millis() as u64,
                "Webhook delivered"
            );

            DeliveryUpdate {
                status: DeliveryStatus::Delivered,
                attempts: attempt,
                response_code: status_code,
                response_body: result.response_body,
                error_message: None,
                next_retry_at: None,
                delivered_at: Some(now),
            }
        } else if !result.should_retry || self.config.retry.is_exhausted(attempt) {
            error!(
                delivery_id = item.delivery_id,
                webhook_id = item.webhook_id,
                event_type = %item.event_type,
                attempt,
                status_code,
                error = result.error.as_deref().unwrap_or_default(),
                retryable = result.should_retry,
                "Webhook delivery dead-lettered"
            );

            DeliveryUpdate {
                status: DeliveryStatus::Dead,
                attempts: attempt,
                response_code: status_code,
                response_body: result.response_body,
                error_message: result.error,
                next_retry_at: None,
                delivered_at: None,
            }
        } else {
            let backoff = self.config.retry.backoff(attempt);
            let next_retry_at = after(now, backoff);

            warn!(
                delivery_id = item.delivery_id,
                webhook_id = item.webhook_id,
                event_type = %item.event_type,
                attempt,
                status_code,
                error = result.error.as_deref().unwrap_or_default(),
                backoff_secs = backoff.as_secs(),
                next_retry_at = %next_retry_at,
                "Webhook delivery failed, retry scheduled"
            );

            DeliveryUpdate {
                status: DeliveryStatus::Pending,
                attempts: attempt,
                response_code: status_code,
                response_body: result.response_body,
                error_message: result.error,
                next_retry_at: Some(next_retry_at),
                delivered_at: None,
            }
        };

        match self.store.update_delivery(item.delivery_id, &update).await {
            Ok(true) => {}
            Ok(false) => debug!(
                delivery_id = item.delivery_id,
                "Delivery already finished or removed, outcome discarded"
            ),
            Err(e) => error!(
                delivery_id = item.delivery_id,
                webhook_id = item.webhook_id,
                error = %e,
                "Failed to record webhook delivery outcome"
            ),
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> bool {
        let update = DeliveryUpdate {
            status: DeliveryStatus::Dead,
            attempts: delivery.attempts,
            response_code: delivery.response_code,
            response_body: delivery.response_body.clone(),
            error_message: Some(reason.to_string()),
            next_retry_at: None,
            delivered_at: None,
        };

        match self.store.update_delivery(delivery.id, &update).await {
            Ok(applied) => {
                if applied {
                    warn!(
                        delivery_id = delivery.id,
                        webhook_id = delivery.webhook_id,
                        event_type = %delivery.event_type,
                        attempts = delivery.attempts,
                        reason,
                        "Webhook delivery dead-lettered"
                    );
                }
                applied
            }
            Err(e) => {
                error!(delivery_id = delivery.id, error = %e, "Failed to dead-letter webhook delivery");
                false
            }
        }
    }

    async fn retry_due(&self) -> Result<ScanReport> {
        let sender = self.sender().ok_or(WebhookError::NotRunning)?;
        let now = Utc::now();
        let due = self
            .store
            .list_due_deliveries(now, self.config.retry_batch_size)
            .await?;

        let mut report = ScanReport {
            scanned: due.len(),
            ..Default::default()
        };

        for delivery in due {
            if delivery.status != DeliveryStatus::Pending {
                continue;
            }

            let webhook = match self.store.get_webhook(delivery.webhook_id).await {
                Ok(webhook) => webhook,
                Err(e) => {
                    error!(
                        delivery_id = delivery.id,
                        webhook_id = delivery.webhook_id,
                        error = %e,
                        "Failed to load webhook for retry"
                    );
                    continue;
                }
            };

            let webhook = match webhook {
                None => {
                    if self.dead_letter(&delivery, "webhook not found").await {
                        report.dead_lettered += 1;
                    }
                    continue;
                }
                Some(webhook) if !webhook.is_active => {
                    if self.dead_letter(&delivery, "webhook disabled").await {
                        report.dead_lettered += 1;
                    }
                    continue;
                }
                Some(_) if self.config.retry.is_exhausted(delivery.attempts) => {
                    if self.dead_letter(&delivery, "retry budget exhausted").await {
                        report.dead_lettered += 1;
                    }
                    continue;
                }
                Some(webhook) => webhook,
            };

            let permit = match sender.try_reserve() {
                Ok(permit) => permit,
                Err(_) => {
                    report.deferred += 1;
                    continue;
                }
            };

            // Lease the row so the next scan does not queue it a second time.
            match self
                .store
                .reschedule_delivery(delivery.id, after(now, self.config.requeue_grace))
                .await
            {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    error!(delivery_id = delivery.id, error = %e, "Failed to lease delivery for retry");
                    continue;
                }
            }

            debug!(
                delivery_id = delivery.id,
                webhook_id = webhook.id,
                event_type = %delivery.event_type,
                attempts = delivery.attempts,
                "Re-queued webhook delivery"
            );
            let payload: Arc<str> = Arc::from(delivery.payload.as_str());
            permit.send(Self::queued_item(&delivery, payload, &webhook));
            report.enqueued += 1;
        }

        Ok(report)
    }

    async fn cleanup(&self) -> Result<u64> {
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(self.config.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let removed = self.store.delete_terminal_deliveries_before(cutoff).await?;

        if removed > 0 {
            info!(removed, cutoff = %cutoff, "Cleaned up old webhook deliveries");
        }

        Ok(removed)
    }
}

#[async_trait]
impl EventSink for Core {
    async fn dispatch(&self, event: Event) {
        if let Err(e) = self.fan_out(&event).await {
            error!(event_type = %event.event_type, error = %e, "Failed to dispatch webhook event");
        }
    }
}

/// Debouncer output; weak so buffered timers do not keep the dispatcher alive
struct CoreSink(Weak<Core>);

#[async_trait]
impl EventSink for CoreSink {
    async fn dispatch(&self, event: Event) {
        match self.0.upgrade() {
            Some(core) => EventSink::dispatch(core.as_ref(), event).await,
            None => error!(
                event_type = %event.event_type,
                "Webhook dispatcher dropped, debounced event lost"
            ),
        }
    }
}

/// Stops the dispatcher when the construction-time shutdown token fires
async fn supervise(core: Arc<Core>, run_token: CancellationToken) {
    // The run token is a child of `shutdown`, so check the parent first.
    tokio::select! {
        biased;
        _ = core.shutdown.cancelled() => {
            info!("Shutdown requested");
            core.stop().await;
        }
        // Regular `stop` or the dispatcher was dropped
        _ = run_token.cancelled() => {}
    }
}

async fn worker_loop(
    core: Arc<Core>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<QueuedItem>>>,
    cancel: CancellationToken,
    worker_id: usize,
) {
    debug!(worker_id, "Webhook worker started");

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = async { receiver.lock().await.recv().await } => item,
        };

        match item {
            // In-flight requests run to completion; only the wait is cancellable.
            Some(item) => core.process(item).await,
            None => break,
        }
    }

    debug!(worker_id, "Webhook worker stopped");
}

async fn retry_loop(core: Arc<Core>, cancel: CancellationToken) {
    let period = core.config.retry_scan_interval.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => match core.retry_due().await {
                Ok(report) if report.scanned > 0 => debug!(
                    scanned = report.scanned,
                    enqueued = report.enqueued,
                    deferred = report.deferred,
                    dead_lettered = report.dead_lettered,
                    "Retry scan finished"
                ),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Retry scan failed"),
            },
        }
    }

    debug!("Retry scanner stopped");
}

async fn cleanup_loop(core: Arc<Core>, cancel: CancellationToken) {
    // First tick completes immediately: sweep once on start.
    let mut ticker = interval(core.config.cleanup_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = core.cleanup().await {
                    error!(error = %e, "Webhook delivery cleanup failed");
                }
            }
        }
    }

    debug!("Cleanup sweep stopped");
}

/// Webhook dispatcher
pub struct WebhookDispatcher {
    core: Arc<Core>,
}

impl WebhookDispatcher {
    /// Create a stopped dispatcher.
    ///
    /// Cancelling `shutdown` stops this instance the way `stop` does, except
    /// that debounced events still buffered are dropped with a log line.
    pub fn new(
        store: Arc<dyn WebhookStore>,
        config: DispatcherConfig,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let executor = DeliveryExecutor::new(config.executor.clone())?;

        Ok(Self {
            core: Arc::new(Core {
                store,
                executor,
                config,
                shutdown,
                state: Mutex::new(DispatcherState::Stopped),
                sender: RwLock::new(None),
                run_token: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                debouncer: RwLock::new(None),
            }),
        })
    }

    pub fn state(&self) -> DispatcherState {
        self.core.state()
    }

    /// Spawn the workers, the retry scanner and the cleanup sweep.
    ///
    /// Must be called within a tokio runtime. No-op unless stopped, and
    /// refused once the shutdown token has fired.
    pub fn start(&self) {
        self.core.start();
    }

    /// Flush debounced events, stop all loops and wait for them. No-op unless running.
    pub async fn stop(&self) {
        self.core.stop().await;
    }

    /// Fan an event out to every subscribed webhook, bypassing the debouncer.
    ///
    /// Returns the number of delivery records created; zero when stopped.
    pub async fn dispatch(&self, event: Event) -> Result<usize> {
        self.core.fan_out(&event).await
    }

    /// Build and dispatch an event, through the debouncer when enabled
    pub async fn dispatch_event(&self, event_type: EventType, data: EventData) {
        let event = Event::new(event_type, data);

        let debouncer = self.core.debouncer.read().clone();
        let event = match debouncer {
            Some(debouncer) => match debouncer.try_submit(event) {
                Ok(()) => return,
                // Stopped under us by a concurrent `stop`
                Err(event) => event,
            },
            None => event,
        };

        EventSink::dispatch(self.core.as_ref(), event).await;
    }

    /// Build and dispatch an event that must never be coalesced (e.g. deletions)
    pub async fn dispatch_immediate(&self, event_type: EventType, data: EventData) {
        EventSink::dispatch(self.core.as_ref(), Event::new(event_type, data)).await;
    }

    pub fn debounce_stats(&self) -> DebounceStats {
        DebounceStats {
            pending: self
                .core
                .debouncer
                .read()
                .as_ref()
                .map(|d| d.pending_count())
                .unwrap_or(0),
            enabled: self.core.config.debounce.is_some(),
        }
    }

    /// Run one retry scan now
    pub async fn retry_due(&self) -> Result<ScanReport> {
        self.core.retry_due().await
    }

    /// Run one cleanup sweep now, returning the number of deleted records
    pub async fn cleanup(&self) -> Result<u64> {
        self.core.cleanup().await
    }
}

impl Drop for WebhookDispatcher {
    fn drop(&mut self) {
        if let Some(cancel) = self.core.run_token.lock().take() {
            cancel.cancel();
        }
    }
}
