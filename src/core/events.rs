// src/core/events.rs - Type-keyed publish/subscribe channel for Gambit v0.3

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use chrono::{DateTime, Utc};
use colored::*;
use serde::{Deserialize, Serialize};

use crate::core::state::{AgentAction, GameState};

/// Immutable event envelope. Created once by the publisher, never mutated;
/// handlers only ever see a shared reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: &str, payload: EventPayload) -> Self {
        Self {
            source: source.to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// Closed set of event payloads. Handlers pattern-match on these instead of
/// downcasting, so an incompatible subscriber cannot exist in the first place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    StateChanged {
        snapshot: GameState,
    },
    TrainingProgress {
        component: String,
        progress: f32,
        message: String,
    },
    ServiceStatus {
        service: String,
        running: bool,
    },
    ActionExecuted {
        action: AgentAction,
        success: bool,
    },
    ConfigChanged {
        interval_ms: u64,
        confidence_threshold: f32,
        learning_enabled: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    StateChanged,
    TrainingProgress,
    ServiceStatus,
    ActionExecuted,
    ConfigChanged,
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::StateChanged { .. } => EventKind::StateChanged,
            EventPayload::TrainingProgress { .. } => EventKind::TrainingProgress,
            EventPayload::ServiceStatus { .. } => EventKind::ServiceStatus,
            EventPayload::ActionExecuted { .. } => EventKind::ActionExecuted,
            EventPayload::ConfigChanged { .. } => EventKind::ConfigChanged,
        }
    }
}

pub type SubscriptionId = u64;

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Coordinator {
    tx: Sender<Event>,
    thread_id: ThreadId,
}

/// Process-wide pub/sub bus, constructed once and handed to every consumer.
///
/// Delivery is synchronous against a snapshot of the subscriber list: the
/// bucket lock is held only while copying, so a handler may subscribe or
/// unsubscribe mid-delivery without deadlocking or corrupting the in-flight
/// publish.
pub struct EventChannel {
    buckets: Mutex<HashMap<EventKind, Vec<(SubscriptionId, Handler)>>>,
    next_id: AtomicU64,
    coordinator: Mutex<Option<Coordinator>>,
}

impl EventChannel {
    pub fn new() -> Arc<Self> {
        let channel = Arc::new(Self {
            buckets: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            coordinator: Mutex::new(None),
        });

        // The coordinator thread drains marshalled publishes in FIFO order.
        // It holds a Weak so the channel can be dropped without joining.
        let weak = Arc::downgrade(&channel);
        let (tx, rx) = mpsc::channel::<Event>();
        let handle = thread::spawn(move || {
            while let Ok(event) = rx.recv() {
                match weak.upgrade() {
                    Some(ch) => ch.publish(&event),
                    None => break,
                }
            }
        });
        let thread_id = handle.thread().id();
        *lock_ignore_poison(&channel.coordinator) = Some(Coordinator { tx, thread_id });

        channel
    }

    /// Registers a handler for one event kind. Handlers for the same kind are
    /// invoked in registration order. The returned id is the only way to
    /// unsubscribe.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut buckets = lock_ignore_poison(&self.buckets);
        buckets
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Removes a subscription; no-op when the id is unknown. The bucket is
    /// freed once its last handler is gone.
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) {
        let mut buckets = lock_ignore_poison(&self.buckets);
        if let Some(list) = buckets.get_mut(&kind) {
            list.retain(|(sid, _)| *sid != id);
            if list.is_empty() {
                buckets.remove(&kind);
            }
        }
    }

    /// Delivers the event to every handler registered for its kind at the
    /// moment the snapshot is taken. A panicking handler is isolated: the
    /// panic is caught, reported, and delivery continues with the next one.
    pub fn publish(&self, event: &Event) {
        let snapshot: Vec<(SubscriptionId, Handler)> = {
            let buckets = lock_ignore_poison(&self.buckets);
            buckets.get(&event.kind()).cloned().unwrap_or_default()
        };

        for (id, handler) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                eprintln!(
                    "{} subscriber #{} panicked on {:?}; continuing delivery",
                    "⚠️".yellow(),
                    id,
                    event.kind()
                );
            }
        }
    }

    /// Fire-and-forget publish marshalled onto the coordinator thread. Calls
    /// already running on the coordinator deliver inline; everything else is
    /// queued FIFO and returns immediately.
    pub fn publish_on_coordinator(&self, event: Event) {
        let tx = {
            let guard = lock_ignore_poison(&self.coordinator);
            match guard.as_ref() {
                Some(coord) if coord.thread_id != thread::current().id() => coord.tx.clone(),
                Some(_) => {
                    drop(guard);
                    self.publish(&event);
                    return;
                }
                None => {
                    drop(guard);
                    self.publish(&event);
                    return;
                }
            }
        };
        // Receiver gone only during teardown; losing the event then is fine.
        let _ = tx.send(event);
    }

    /// Drops every subscription. Full-shutdown path only.
    pub fn clear(&self) {
        lock_ignore_poison(&self.buckets).clear();
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        lock_ignore_poison(&self.buckets)
            .get(&kind)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

/// A poisoned mutex here only means some handler panicked while we held the
/// lock elsewhere; the protected maps are still structurally valid.
fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn status_event(service: &str, running: bool) -> Event {
        Event::new(
            "test",
            EventPayload::ServiceStatus {
                service: service.to_string(),
                running,
            },
        )
    }

    #[test]
    fn delivers_in_registration_order() {
        let channel = EventChannel::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let log = log.clone();
            channel.subscribe(EventKind::ServiceStatus, move |_| {
                log.lock().unwrap().push(tag);
            });
        }

        channel.publish(&status_event("pipeline", true));
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn panicking_handler_does_not_block_later_handlers() {
        let channel = EventChannel::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        channel.subscribe(EventKind::ServiceStatus, |_| {
            panic!("broken subscriber");
        });
        let d = delivered.clone();
        channel.subscribe(EventKind::ServiceStatus, move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });

        channel.publish(&status_event("pipeline", true));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_registered_during_publish_misses_current_event() {
        let channel = EventChannel::new();
        let late_hits = Arc::new(AtomicUsize::new(0));

        let ch = channel.clone();
        let hits = late_hits.clone();
        channel.subscribe(EventKind::ServiceStatus, move |_| {
            let hits = hits.clone();
            ch.subscribe(EventKind::ServiceStatus, move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        });

        channel.publish(&status_event("pipeline", true));
        assert_eq!(late_hits.load(Ordering::SeqCst), 0);

        channel.publish(&status_event("pipeline", false));
        assert_eq!(late_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_publishers_with_subscription_churn_lose_nothing() {
        let channel = EventChannel::new();
        let stable_hits = Arc::new(AtomicUsize::new(0));

        let h = stable_hits.clone();
        channel.subscribe(EventKind::ServiceStatus, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let mut workers = Vec::new();
        for p in 0..4 {
            let ch = channel.clone();
            workers.push(thread::spawn(move || {
                for i in 0..50 {
                    ch.publish(&status_event(&format!("svc-{}-{}", p, i), true));
                }
            }));
        }
        // Churn the same bucket while the publishers run.
        let ch = channel.clone();
        workers.push(thread::spawn(move || {
            for _ in 0..200 {
                let id = ch.subscribe(EventKind::ServiceStatus, |_| {});
                ch.unsubscribe(EventKind::ServiceStatus, id);
            }
        }));
        for w in workers {
            w.join().unwrap();
        }

        // The stable handler predates every publish, so it sees each one
        // exactly once no matter how the churn interleaves.
        assert_eq!(stable_hits.load(Ordering::SeqCst), 200);
        assert_eq!(channel.subscriber_count(EventKind::ServiceStatus), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery_and_frees_bucket() {
        let channel = EventChannel::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let id = channel.subscribe(EventKind::StateChanged, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        channel.unsubscribe(EventKind::StateChanged, id);

        channel.publish(&Event::new(
            "test",
            EventPayload::StateChanged {
                snapshot: GameState::default(),
            },
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(channel.subscriber_count(EventKind::StateChanged), 0);
    }

    #[test]
    fn coordinator_publish_is_fifo_and_non_blocking() {
        let channel = EventChannel::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let l = log.clone();
        channel.subscribe(EventKind::ServiceStatus, move |ev| {
            if let EventPayload::ServiceStatus { service, .. } = &ev.payload {
                l.lock().unwrap().push(service.clone());
            }
        });

        for i in 0..5 {
            channel.publish_on_coordinator(status_event(&format!("svc-{}", i), true));
        }

        // Marshalled delivery is asynchronous; give the coordinator a moment.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            if log.lock().unwrap().len() == 5 || std::time::Instant::now() > deadline {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        let seen = log.lock().unwrap().clone();
        assert_eq!(seen, vec!["svc-0", "svc-1", "svc-2", "svc-3", "svc-4"]);
    }
}
