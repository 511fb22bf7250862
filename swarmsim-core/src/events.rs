//! Ordered publish/subscribe delivery with bounded per-subscriber buffers.
//!
//! Each subscriber owns a bounded channel. Publishing never blocks: a full
//! subscriber misses the event, a cancelled or lapsed subscriber is pruned.
//! Sequence numbers are assigned under the subscriber lock, so every
//! subscriber observes events in publish order.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;

use crate::node::PeerHandle;

/// One event as seen by a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery<T> {
    pub sequence: u64,
    pub event: T,
}

/// Progress notification emitted by a node after each finished transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeEvent {
    pub name: String,
    pub progress: f64,
}

/// Population change published by the node manager.
#[derive(Clone)]
pub enum ManagerEvent {
    NodeAdded {
        name: String,
        node: Arc<dyn PeerHandle>,
    },
    NodeRemoved {
        name: String,
    },
}

impl ManagerEvent {
    pub fn name(&self) -> &str {
        match self {
            ManagerEvent::NodeAdded { name, .. } | ManagerEvent::NodeRemoved { name } => name,
        }
    }
}

impl std::fmt::Debug for ManagerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagerEvent::NodeAdded { name, .. } => {
                f.debug_struct("NodeAdded").field("name", name).finish()
            }
            ManagerEvent::NodeRemoved { name } => {
                f.debug_struct("NodeRemoved").field("name", name).finish()
            }
        }
    }
}

type Lease = Arc<Mutex<Option<Instant>>>;

fn lapsed(lease: &Lease, now: Instant) -> bool {
    lease.lock().is_some_and(|expiry| expiry <= now)
}

struct Subscriber<T> {
    id: u64,
    sender: mpsc::Sender<Delivery<T>>,
    lease: Lease,
}

struct BusState<T> {
    next_sequence: u64,
    next_id: u64,
    subscribers: Vec<Subscriber<T>>,
}

/// Fan-out event bus.
pub struct EventBus<T> {
    capacity: usize,
    state: Mutex<BusState<T>>,
}

impl<T: Clone + Send + 'static> EventBus<T> {
    /// Creates a bus whose subscribers buffer at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(BusState {
                next_sequence: 0,
                next_id: 0,
                subscribers: Vec::new(),
            }),
        }
    }

    /// Registers a subscriber without a lease.
    pub fn subscribe(&self) -> Subscription<T> {
        self.register(None)
    }

    /// Registers a subscriber that stops receiving events unless renewed
    /// within `ttl`.
    pub fn subscribe_with_lease(&self, ttl: Duration) -> Subscription<T> {
        self.register(Some(Instant::now() + ttl))
    }

    fn register(&self, expiry: Option<Instant>) -> Subscription<T> {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let lease = Arc::new(Mutex::new(expiry));

        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.push(Subscriber {
            id,
            sender,
            lease: Arc::clone(&lease),
        });

        Subscription {
            id,
            receiver,
            lease,
        }
    }

    /// Delivers `event` to every live subscriber and returns its sequence number.
    pub fn publish(&self, event: T) -> u64 {
        let now = Instant::now();
        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        state.subscribers.retain(|subscriber| {
            if lapsed(&subscriber.lease, now) {
                tracing::debug!("Subscription {} lease lapsed, pruning", subscriber.id);
                return false;
            }
            let delivery = Delivery {
                sequence,
                event: event.clone(),
            };
            match subscriber.sender.try_send(delivery) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        "Subscriber {} is full, dropping event {}",
                        subscriber.id,
                        sequence
                    );
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });

        sequence
    }

    /// Number of subscribers still registered.
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}

/// Receiving end of a bus registration.
///
/// Dropping or cancelling the handle stops delivery; the bus prunes the
/// subscriber on its next publish.
pub struct Subscription<T> {
    id: u64,
    receiver: mpsc::Receiver<Delivery<T>>,
    lease: Lease,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next event.
    ///
    /// Returns `None` once the subscription is cancelled, its lease lapsed,
    /// or the bus is gone, after any already buffered events.
    pub async fn recv(&mut self) -> Option<Delivery<T>> {
        if lapsed(&self.lease, Instant::now()) {
            self.receiver.close();
        }
        self.receiver.recv().await
    }

    /// Returns a buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<Delivery<T>> {
        self.receiver.try_recv().ok()
    }

    /// Stops delivery. Buffered events can still be drained.
    pub fn cancel(&mut self) {
        self.receiver.close();
    }

    /// Extends the lease to `ttl` from now.
    ///
    /// Returns `false` when the lease already lapsed or the subscription was
    /// cancelled; a lapsed subscription cannot be revived.
    pub fn renew(&self, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut expiry = self.lease.lock();
        if self.receiver.is_closed() || expiry.is_some_and(|at| at <= now) {
            return false;
        }
        *expiry = Some(now + ttl);
        true
    }

    /// True while events can still arrive.
    pub fn is_active(&self) -> bool {
        !self.receiver.is_closed() && !lapsed(&self.lease, Instant::now())
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delivers_in_publish_order() {
        let bus = EventBus::new(16);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        for value in 0..5 {
            bus.publish(value);
        }

        for expected in 0..5 {
            let a = first.recv().await.unwrap();
            let b = second.recv().await.unwrap();
            assert_eq!(a.sequence, expected);
            assert_eq!(a.event, expected);
            assert_eq!(b, a);
        }
    }

    #[tokio::test]
    async fn test_full_subscriber_drops_events() {
        let bus = EventBus::new(2);
        let mut slow = bus.subscribe();

        for value in 0..5 {
            bus.publish(value);
        }

        assert_eq!(slow.try_recv().map(|d| d.event), Some(0));
        assert_eq!(slow.try_recv().map(|d| d.event), Some(1));
        assert_eq!(slow.try_recv(), None);
        assert_eq!(bus.subscriber_count(), 1);

        let sequence = bus.publish(9);
        assert_eq!(sequence, 5);
        assert_eq!(slow.recv().await.map(|d| d.sequence), Some(5));
    }

    #[tokio::test]
    async fn test_cancelled_subscriber_is_pruned() {
        let bus = EventBus::new(4);
        let mut cancelled = bus.subscribe();
        let _kept = bus.subscribe();

        cancelled.cancel();
        assert!(!cancelled.is_active());
        bus.publish("event");

        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(cancelled.recv().await, None);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new(4);
        drop(bus.subscribe());

        bus.publish(1u8);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_lapsed_lease_stops_delivery() {
        let bus = EventBus::new(4);
        let mut leased = bus.subscribe_with_lease(Duration::from_millis(20));

        bus.publish(1);
        tokio::time::sleep(Duration::from_millis(40)).await;
        bus.publish(2);

        assert!(!leased.is_active());
        assert!(!leased.renew(Duration::from_secs(1)));
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(leased.recv().await.map(|d| d.event), Some(1));
        assert_eq!(leased.recv().await, None);
    }

    #[tokio::test]
    async fn test_renewed_lease_keeps_delivering() {
        let bus = EventBus::new(4);
        let mut leased = bus.subscribe_with_lease(Duration::from_millis(30));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(leased.renew(Duration::from_secs(5)));
        tokio::time::sleep(Duration::from_millis(30)).await;

        bus.publish(7);
        assert!(leased.is_active());
        assert_eq!(leased.recv().await.map(|d| d.event), Some(7));
    }
}
