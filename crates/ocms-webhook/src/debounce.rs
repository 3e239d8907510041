//! Event debouncing
//!
//! Bursts of events about the same entity (autosave, bulk edits) are
//! merged into one delivery. Events are keyed by `(event type, entity id)`;
//! the last event of a burst wins. A key is flushed once it has been quiet
//! for `interval`, and never later than `max_wait` after its first event.

use crate::events::{EntityKey, Event, EventType};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Receives events once they leave the debouncer
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn dispatch(&self, event: Event);
}

/// Debounce timing
#[derive(Debug, Clone)]
pub struct DebounceConfig {
    /// Quiet period after the latest event before a key is flushed
    pub interval: Duration,
    /// Upper bound on how long a key may be held back
    pub max_wait: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_wait: Duration::from_secs(5),
        }
    }
}

/// Coalescing key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DebounceKey {
    pub event_type: EventType,
    pub entity_id: Option<i64>,
}

impl DebounceKey {
    pub fn for_event(event: &Event) -> Self {
        Self {
            event_type: event.event_type,
            entity_id: event.data.entity_id(),
        }
    }

    /// True when the payload carries no entity and all events of the type share one key
    pub fn is_type_only(&self) -> bool {
        self.entity_id.is_none()
    }
}

struct PendingEvent {
    event: Event,
    first_seen: Instant,
    generation: u64,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    pending: HashMap<DebounceKey, PendingEvent>,
    stopped: bool,
}

struct Inner {
    sink: Arc<dyn EventSink>,
    config: DebounceConfig,
    state: Mutex<State>,
    generation: AtomicU64,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Inner {
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed)
    }

    fn schedule(self: &Arc<Self>, key: DebounceKey, generation: u64, deadline: Instant) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => inner.fire(key, generation),
                _ = inner.cancel.cancelled() => {}
            }
        })
    }

    fn fire(&self, key: DebounceKey, generation: u64) {
        let entry = {
            let mut state = self.state.lock();
            match state.pending.get(&key) {
                Some(entry) if entry.generation == generation => state.pending.remove(&key),
                // Superseded by a newer event for the same key
                _ => None,
            }
        };

        if let Some(entry) = entry {
            debug!(
                event_type = %key.event_type,
                entity_id = ?key.entity_id,
                "Debounce interval elapsed, flushing event"
            );
            self.spawn_dispatch(entry.event);
        }
    }

    fn spawn_dispatch(&self, event: Event) {
        let sink = Arc::clone(&self.sink);
        self.tracker.spawn(async move {
            sink.dispatch(event).await;
        });
    }
}

/// Coalesces rapid events for the same entity
pub struct Debouncer {
    inner: Arc<Inner>,
}

impl Debouncer {
    pub fn new(config: DebounceConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                config,
                state: Mutex::new(State::default()),
                generation: AtomicU64::new(0),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Buffer an event, replacing any buffered event with the same key.
    ///
    /// After `stop` the event is dispatched on a detached task instead.
    pub fn submit(&self, event: Event) {
        if let Err(event) = self.try_submit(event) {
            let sink = Arc::clone(&self.inner.sink);
            tokio::spawn(async move { sink.dispatch(event).await });
        }
    }

    /// Like `submit`, but hands the event back once the debouncer is stopped
    pub fn try_submit(&self, event: Event) -> std::result::Result<(), Event> {
        let key = DebounceKey::for_event(&event);
        if key.is_type_only() {
            debug!(
                event_type = %key.event_type,
                "Event carries no entity id, coalescing by event type only"
            );
        }

        let now = Instant::now();
        let config = &self.inner.config;
        let mut state = self.inner.state.lock();

        if state.stopped {
            return Err(event);
        }

        if let Some(entry) = state.pending.get_mut(&key) {
            if now.duration_since(entry.first_seen) >= config.max_wait {
                if let Some(stale) = state.pending.remove(&key) {
                    stale.timer.abort();
                }
                drop(state);

                debug!(
                    event_type = %key.event_type,
                    entity_id = ?key.entity_id,
                    "Debounce max wait reached, flushing immediately"
                );
                self.inner.spawn_dispatch(event);
                return Ok(());
            }

            let generation = self.inner.next_generation();
            let deadline = (now + config.interval).min(entry.first_seen + config.max_wait);
            entry.timer.abort();
            entry.event = event;
            entry.generation = generation;
            entry.timer = self.inner.schedule(key, generation, deadline);
            return Ok(());
        }

        let generation = self.inner.next_generation();
        let deadline = now + config.interval.min(config.max_wait);
        let timer = self.inner.schedule(key, generation, deadline);
        state.pending.insert(
            key,
            PendingEvent {
                event,
                first_seen: now,
                generation,
                timer,
            },
        );
        Ok(())
    }

    /// Dispatch every buffered event now, oldest burst first
    pub async fn flush(&self) {
        let mut drained: Vec<PendingEvent> = {
            let mut state = self.inner.state.lock();
            state.pending.drain().map(|(_, entry)| entry).collect()
        };
        drained.sort_by_key(|entry| entry.first_seen);

        for entry in drained {
            entry.timer.abort();
            self.inner.sink.dispatch(entry.event).await;
        }
    }

    /// Flush, then wait for in-flight dispatches. Later submissions bypass buffering.
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
        }

        self.flush().await;
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    /// Number of keys currently buffered
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }
}
