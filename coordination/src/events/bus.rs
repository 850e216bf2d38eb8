//! Event bus for swarm coordination
//!
//! Broadcast pub/sub where every subscriber owns an unbounded delivery queue,
//! so a slow consumer never causes another subscriber to miss an event.
//! Events are filtered at publish time; a subscription only sees events
//! published after it was created.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::types::{Event, EventType};
use crate::error::{CoordinationError, CoordinationResult};

/// Result type alias for bus operations
pub type BusResult<T> = CoordinationResult<T>;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Event filter for selective subscription
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// Filter by event types (unset matches every type)
    pub event_types: Option<Vec<EventType>>,
    /// Filter by channel (unset matches every channel)
    pub channel: Option<String>,
}

impl EventFilter {
    /// Create a new empty filter (matches all events)
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by a single event type
    pub fn event_type(self, event_type: EventType) -> Self {
        self.types(vec![event_type])
    }

    /// Filter by any of several event types
    pub fn types(mut self, event_types: Vec<EventType>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    /// Filter by channel
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Check if an event matches this filter
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }

        if let Some(ref channel) = self.channel {
            if &event.channel != channel {
                return false;
            }
        }

        true
    }
}

struct Subscriber {
    id: u64,
    filter: EventFilter,
    sender: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
struct BusInner {
    subscribers: Vec<Subscriber>,
    next_id: u64,
    closed: bool,
}

/// In-process publish/subscribe event bus
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    /// Create a new, open event bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish an event to every matching subscriber.
    ///
    /// Returns the number of subscribers the event was delivered to.
    /// Critical events without a coordination id are rejected before they
    /// enter the bus. After [`EventBus::close`] every publish fails with
    /// [`CoordinationError::BusClosed`].
    pub fn publish(&self, event: Event) -> BusResult<usize> {
        if let Err(e) = event.validate() {
            warn!(
                event_type = %event.event_type,
                channel = %event.channel,
                sender = %event.sender,
                "Rejected event: {}",
                e
            );
            return Err(e);
        }

        let mut inner = self.lock();
        if inner.closed {
            return Err(CoordinationError::BusClosed);
        }

        let mut delivered = 0usize;
        inner.subscribers.retain(|sub| {
            if !sub.filter.matches(&event) {
                return !sub.sender.is_closed();
            }
            match sub.sender.send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    debug!(subscriber = sub.id, "Dropping closed subscription");
                    false
                }
            }
        });

        debug!(
            event_type = %event.event_type,
            channel = %event.channel,
            receivers = delivered,
            "Event published"
        );
        Ok(delivered)
    }

    /// Subscribe with a filter
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        if inner.closed {
            // Sender dropped here; the stream ends immediately.
            debug!(subscriber = id, "Subscribe on closed bus");
        } else {
            inner.subscribers.push(Subscriber {
                id,
                filter: filter.clone(),
                sender,
            });
            debug!(subscriber = id, ?filter, "New subscriber");
        }

        Subscription {
            id,
            filter,
            receiver,
        }
    }

    /// Subscribe by optional event type and optional channel
    pub fn subscribe_to(&self, event_type: Option<EventType>, channel: Option<&str>) -> Subscription {
        let mut filter = EventFilter::new();
        if let Some(event_type) = event_type {
            filter = filter.event_type(event_type);
        }
        if let Some(channel) = channel {
            filter = filter.channel(channel);
        }
        self.subscribe(filter)
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|s| !s.sender.is_closed());
        inner.subscribers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Tear the bus down: every subscription ends once it has drained the
    /// events already delivered to it
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.subscribers.clear();
        debug!("Event bus closed");
    }
}

/// Live subscription yielding matching events in publish order
pub struct Subscription {
    id: u64,
    filter: EventFilter,
    receiver: mpsc::UnboundedReceiver<Event>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    /// Receive the next matching event; `None` once the bus is closed
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// Non-blocking receive of an already delivered event
    pub fn try_recv(&mut self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.receiver.poll_recv(cx)
    }
}
