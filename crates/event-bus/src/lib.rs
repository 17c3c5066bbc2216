//! In-process event bus for workflow orchestration
//!
//! Carries execution lifecycle events from the engine to subscribers
//! (WebSocket bridge, SSE streams, tests). Delivery is at-least-once and
//! FIFO per execution; a bounded replay ring lets late subscribers catch
//! up on recent history.

pub mod bus;
pub mod event;

pub use bus::{EventBus, EventBusConfig, Subscription};
pub use event::{Event, EventFilter, EventKind};

use async_trait::async_trait;

/// Anything lifecycle events can be published through.
///
/// The engine's sink appends to the durable event log before fanning out
/// on the bus; the bus alone implements the trait for consumers that only
/// need in-process delivery.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: Event) -> Event;
}

#[async_trait]
impl EventSink for EventBus {
    async fn publish(&self, event: Event) -> Event {
        self.emit(event.clone());
        event
    }
}
