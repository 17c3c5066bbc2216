use crate::event::{Event, EventFilter};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Bounded queue depth per subscriber; oldest events are dropped past this.
    pub subscriber_queue_depth: usize,
    /// Number of recent events retained for replay.
    pub ring_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            subscriber_queue_depth: 256,
            ring_capacity: 1000,
        }
    }
}

struct SubscriberEntry {
    filter: EventFilter,
    queue: Arc<SubscriberQueue>,
}

struct SubscriberQueue {
    events: Mutex<VecDeque<Event>>,
    notify: Notify,
    dropped: AtomicU64,
    capacity: usize,
    closed: std::sync::atomic::AtomicBool,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            capacity,
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn push(&self, event: Event) {
        {
            let mut queue = self.events.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// In-process pub/sub with a bounded replay ring.
///
/// Emission never blocks on a slow subscriber: each subscriber has its own
/// bounded queue and falls behind by dropping its oldest entries.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    config: EventBusConfig,
    subscribers: Mutex<HashMap<Uuid, SubscriberEntry>>,
    ring: Mutex<VecDeque<Event>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(HashMap::new()),
                ring: Mutex::new(VecDeque::with_capacity(config.ring_capacity)),
                config,
            }),
        }
    }

    /// Broadcast an event to every matching subscriber and record it in the ring.
    pub fn emit(&self, event: Event) {
        {
            let mut ring = self.inner.ring.lock();
            if ring.len() >= self.inner.config.ring_capacity {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }

        let subscribers = self.inner.subscribers.lock();
        for entry in subscribers.values() {
            if entry.filter.matches(&event) {
                entry.queue.push(event.clone());
            }
        }
    }

    /// Register a subscriber; events matching `filter` are queued until received.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let id = Uuid::new_v4();
        let queue = Arc::new(SubscriberQueue::new(self.inner.config.subscriber_queue_depth));
        self.inner.subscribers.lock().insert(
            id,
            SubscriberEntry {
                filter,
                queue: queue.clone(),
            },
        );
        debug!(subscription_id = %id, "Event bus subscription registered");
        Subscription {
            id,
            queue,
            bus: self.inner.clone(),
        }
    }

    /// The most recent `n` events matching `filter`, oldest first.
    pub fn recent(&self, n: usize, filter: &EventFilter) -> Vec<Event> {
        let ring = self.inner.ring.lock();
        let matching: Vec<Event> = ring.iter().filter(|e| filter.matches(e)).cloned().collect();
        let skip = matching.len().saturating_sub(n);
        matching.into_iter().skip(skip).collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

impl BusInner {
    fn unsubscribe(&self, id: Uuid) {
        if let Some(entry) = self.subscribers.lock().remove(&id) {
            entry.queue.close();
            debug!(subscription_id = %id, "Event bus subscription removed");
        }
    }
}

/// Handle to a registered subscriber. Unregisters on drop.
pub struct Subscription {
    id: Uuid,
    queue: Arc<SubscriberQueue>,
    bus: Arc<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Receive the next event, waiting if the queue is empty.
    /// Returns `None` once the subscription is closed and drained.
    pub async fn recv(&self) -> Option<Event> {
        loop {
            if let Some(event) = self.queue.events.lock().pop_front() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<Event> {
        self.queue.events.lock().pop_front()
    }

    /// Events dropped because this subscriber fell behind.
    pub fn dropped_count(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use serde_json::json;

    fn event(execution_id: Uuid, kind: EventKind) -> Event {
        Event::new(execution_id, None, kind, json!({}))
    }

    #[tokio::test]
    async fn delivers_in_fifo_order_per_execution() {
        let bus = EventBus::default();
        let execution_id = Uuid::new_v4();
        let sub = bus.subscribe(EventFilter::for_execution(execution_id));

        bus.emit(event(execution_id, EventKind::WorkflowStarted));
        bus.emit(event(execution_id, EventKind::NodeStarted));
        bus.emit(event(execution_id, EventKind::NodeCompleted));
        bus.emit(event(Uuid::new_v4(), EventKind::WorkflowStarted));

        assert_eq!(sub.recv().await.unwrap().kind, EventKind::WorkflowStarted);
        assert_eq!(sub.recv().await.unwrap().kind, EventKind::NodeStarted);
        assert_eq!(sub.recv().await.unwrap().kind, EventKind::NodeCompleted);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest() {
        let bus = EventBus::new(EventBusConfig {
            subscriber_queue_depth: 2,
            ring_capacity: 10,
        });
        let execution_id = Uuid::new_v4();
        let sub = bus.subscribe(EventFilter::default());

        bus.emit(event(execution_id, EventKind::WorkflowStarted));
        bus.emit(event(execution_id, EventKind::NodeStarted));
        bus.emit(event(execution_id, EventKind::NodeCompleted));

        assert_eq!(sub.dropped_count(), 1);
        // Oldest entry was discarded, the rest remain in order.
        assert_eq!(sub.recv().await.unwrap().kind, EventKind::NodeStarted);
        assert_eq!(sub.recv().await.unwrap().kind, EventKind::NodeCompleted);
    }

    #[tokio::test]
    async fn ring_replays_recent_events() {
        let bus = EventBus::new(EventBusConfig {
            subscriber_queue_depth: 16,
            ring_capacity: 3,
        });
        let execution_id = Uuid::new_v4();

        bus.emit(event(execution_id, EventKind::WorkflowStarted));
        bus.emit(event(execution_id, EventKind::NodeStarted));
        bus.emit(event(execution_id, EventKind::NodeCompleted));
        bus.emit(event(execution_id, EventKind::WorkflowCompleted));

        let recent = bus.recent(10, &EventFilter::for_execution(execution_id));
        // Capacity 3: the oldest event rolled off.
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].kind, EventKind::NodeStarted);
        assert_eq!(recent[2].kind, EventKind::WorkflowCompleted);

        let last_two = bus.recent(2, &EventFilter::for_execution(execution_id));
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].kind, EventKind::NodeCompleted);
    }

    #[tokio::test]
    async fn unsubscribes_on_drop() {
        let bus = EventBus::default();
        {
            let _sub = bus.subscribe(EventFilter::default());
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }
}
