//! Event fan-out to any number of subscribers
//!
//! Publishing never blocks. Every subscriber reads from a bounded window of
//! the most recent events; one that falls behind loses its oldest undelivered
//! events and learns how many on its next receive. Other subscribers and the
//! publisher are unaffected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::event::Event;

/// Per-subscriber cursor. Everything published since `joined_at` is either
/// delivered, acknowledged as dropped, or still pending; pending events beyond
/// the ring capacity are already gone even if the subscriber has not noticed.
#[derive(Debug)]
struct SubscriberStats {
    joined_at: u64,
    delivered: AtomicU64,
    acknowledged_drops: AtomicU64,
}

impl SubscriberStats {
    fn dropped(&self, published: u64, capacity: usize) -> u64 {
        let acknowledged = self.acknowledged_drops.load(Ordering::Relaxed);
        let pending = published
            .saturating_sub(self.joined_at)
            .saturating_sub(self.delivered.load(Ordering::Relaxed))
            .saturating_sub(acknowledged);
        acknowledged + pending.saturating_sub(capacity as u64)
    }
}

#[derive(Debug, Default)]
struct Shared {
    next_id: AtomicU64,
    /// Guarded so a new subscriber's cursor lines up with its receiver
    published: Mutex<u64>,
    /// Drops of subscribers that have since gone away
    departed_dropped: AtomicU64,
    subscribers: Mutex<HashMap<u64, Arc<SubscriberStats>>>,
}

impl Shared {
    fn subscribers(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<SubscriberStats>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn published(&self) -> std::sync::MutexGuard<'_, u64> {
        self.published.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct EventBroadcaster {
    tx: broadcast::Sender<Arc<Event>>,
    capacity: usize,
    shared: Arc<Shared>,
}

/// One subscriber's view of the stream
#[derive(Debug)]
pub enum Received {
    Event(Arc<Event>),
    /// This many events were dropped before the next one
    Overrun(u64),
}

/// Handle returned by [`EventBroadcaster::subscribe`]; dropping it unsubscribes
pub struct Subscriber {
    id: u64,
    rx: broadcast::Receiver<Arc<Event>>,
    stats: Arc<SubscriberStats>,
    shared: Arc<Shared>,
    capacity: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriberReport {
    pub id: u64,
    pub delivered: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastReport {
    pub capacity: usize,
    pub published: u64,
    pub subscriber_count: usize,
    /// Across current and departed subscribers
    pub dropped_total: u64,
    pub subscribers: Vec<SubscriberReport>,
}

impl EventBroadcaster {
    /// The ring holds `capacity` rounded up to a power of two, as tokio does
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            capacity,
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn publish(&self, event: Event) {
        let mut published = self.shared.published();
        *published += 1;
        // an error only means nobody is listening
        let _ = self.tx.send(Arc::new(event));
    }

    pub fn subscribe(&self) -> Subscriber {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (rx, joined_at) = {
            let published = self.shared.published();
            (self.tx.subscribe(), *published)
        };
        let stats = Arc::new(SubscriberStats {
            joined_at,
            delivered: AtomicU64::new(0),
            acknowledged_drops: AtomicU64::new(0),
        });
        self.shared.subscribers().insert(id, stats.clone());
        debug!("Subscriber {} attached", id);
        Subscriber {
            id,
            rx,
            stats,
            shared: self.shared.clone(),
            capacity: self.capacity,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers().len()
    }

    /// Drop counts include events a stalled subscriber has lost but not yet
    /// been told about
    pub fn report(&self) -> BroadcastReport {
        let published = *self.shared.published();
        let subscribers: Vec<SubscriberReport> = {
            let map = self.shared.subscribers();
            let mut list: Vec<SubscriberReport> = map
                .iter()
                .map(|(id, s)| SubscriberReport {
                    id: *id,
                    delivered: s.delivered.load(Ordering::Relaxed),
                    dropped: s.dropped(published, self.capacity),
                })
                .collect();
            list.sort_by_key(|s| s.id);
            list
        };
        let current: u64 = subscribers.iter().map(|s| s.dropped).sum();

        BroadcastReport {
            capacity: self.capacity,
            published,
            subscriber_count: subscribers.len(),
            dropped_total: current + self.shared.departed_dropped.load(Ordering::Relaxed),
            subscribers,
        }
    }
}

impl Subscriber {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dropped(&self) -> u64 {
        let published = *self.shared.published();
        self.stats.dropped(published, self.capacity)
    }

    /// Next event, or how many were lost since the last one. `None` once the
    /// broadcaster is gone.
    pub async fn recv(&mut self) -> Option<Received> {
        match self.rx.recv().await {
            Ok(event) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                Some(Received::Event(event))
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                self.stats.acknowledged_drops.fetch_add(n, Ordering::Relaxed);
                debug!("Subscriber {} overran by {} events", self.id, n);
                Some(Received::Overrun(n))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Explicit detach; equivalent to dropping the handle
    pub fn unsubscribe(self) {}
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        let published = *self.shared.published();
        if let Some(stats) = self.shared.subscribers().remove(&self.id) {
            self.shared
                .departed_dropped
                .fetch_add(stats.dropped(published, self.capacity), Ordering::Relaxed);
        }
        debug!("Subscriber {} detached", self.id);
    }
}
