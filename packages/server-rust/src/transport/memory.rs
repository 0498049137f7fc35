//! In-process broker implementing both [`Transport`] and [`LockStore`].
//!
//! A single `MemoryBroker` plays the role of the shared pub/sub server:
//! every backend connected to it sees the same topics, the same subscriber
//! counts, and the same lock key space, so multi-backend behaviour (competing
//! consumers, cross-backend requests) can be exercised inside one process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use switchboard_core::topic::{self, TopicPattern};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

use crate::traits::{Delivery, LockStore, Transport};

/// Minimum spacing between sweeps of expired lock keys.
const LOCK_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Unique identifier for a broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Per-connection subscription table and delivery sender.
#[derive(Debug)]
struct ConnectionState {
    tx: mpsc::UnboundedSender<Delivery>,
    /// Exact topics map to `None`; wildcard patterns carry their compiled matcher.
    subscriptions: RwLock<HashMap<String, Option<TopicPattern>>>,
}

impl ConnectionState {
    /// Subscriptions of this connection that match `topic`.
    fn matching(&self, topic: &str) -> Vec<String> {
        self.subscriptions
            .read()
            .iter()
            .filter(|(key, pattern)| match pattern {
                Some(pattern) => pattern.matches(topic),
                None => key.as_str() == topic,
            })
            .map(|(key, _)| key.clone())
            .collect()
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    connections: DashMap<ConnectionId, Arc<ConnectionState>>,
    next_id: AtomicU64,
    /// Lock key -> expiry instant.
    locks: DashMap<String, Instant>,
    last_lock_sweep: Mutex<Option<Instant>>,
}

impl BrokerState {
    /// Drops expired lock keys, at most once per [`LOCK_SWEEP_INTERVAL`].
    fn sweep_expired_locks(&self, now: Instant) {
        {
            let mut last = self.last_lock_sweep.lock();
            if matches!(*last, Some(at) if now < at + LOCK_SWEEP_INTERVAL) {
                return;
            }
            *last = Some(now);
        }
        let before = self.locks.len();
        self.locks.retain(|_, expiry| *expiry > now);
        trace!(swept = before.saturating_sub(self.locks.len()), "expired locks swept");
    }
}

/// Shared in-memory pub/sub server.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new connection. Connection IDs start at 1.
    #[must_use]
    pub fn connect(&self) -> MemoryTransport {
        let id = ConnectionId(self.state.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(ConnectionState {
            tx,
            subscriptions: RwLock::new(HashMap::new()),
        });
        self.state.connections.insert(id, Arc::clone(&connection));
        MemoryTransport {
            id,
            broker: Arc::clone(&self.state),
            connection,
            deliveries: Mutex::new(Some(rx)),
        }
    }

    /// Returns a lock store sharing this broker's key space.
    #[must_use]
    pub fn lock_store(&self) -> MemoryLockStore {
        MemoryLockStore {
            broker: Arc::clone(&self.state),
        }
    }

    /// Number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.connections.len()
    }
}

/// One backend's connection to a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryTransport {
    id: ConnectionId,
    broker: Arc<BrokerState>,
    connection: Arc<ConnectionState>,
    deliveries: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
}

impl MemoryTransport {
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Topics and patterns this connection is subscribed to, sorted.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.connection.subscriptions.read().keys().cloned().collect();
        topics.sort();
        topics
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: String) -> anyhow::Result<()> {
        // Collect first so no DashMap guard is held while sending.
        let connections: Vec<Arc<ConnectionState>> = self
            .broker
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for connection in connections {
            for subscription in connection.matching(topic) {
                // A dropped receiver means the backend is gone; skip it.
                let _ = connection.tx.send(Delivery {
                    subscription,
                    topic: topic.to_string(),
                    payload: payload.clone(),
                });
            }
        }
        trace!(topic, "published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> anyhow::Result<()> {
        let pattern = if topic::is_wildcard(topic) {
            Some(TopicPattern::new(topic)?)
        } else {
            topic::validate(topic)?;
            None
        };
        self.connection
            .subscriptions
            .write()
            .insert(topic.to_string(), pattern);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> anyhow::Result<()> {
        self.connection.subscriptions.write().remove(topic);
        Ok(())
    }

    async fn subscriber_count(&self, topic: &str) -> anyhow::Result<usize> {
        Ok(self
            .broker
            .connections
            .iter()
            .filter(|entry| !entry.value().matching(topic).is_empty())
            .count())
    }

    fn take_deliveries(&self) -> Option<mpsc::UnboundedReceiver<Delivery>> {
        self.deliveries.lock().take()
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.connection.subscriptions.write().clear();
        self.broker.connections.remove(&self.id);
        Ok(())
    }
}

/// Lock store backed by a [`MemoryBroker`]'s shared key space.
#[derive(Debug, Clone)]
pub struct MemoryLockStore {
    broker: Arc<BrokerState>,
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> anyhow::Result<bool> {
        let now = Instant::now();
        self.broker.sweep_expired_locks(now);
        // The entry guard holds the shard lock, making test-and-set atomic.
        let acquired = match self.broker.locks.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if *held.get() <= now {
                    held.insert(now + ttl);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now + ttl);
                true
            }
        };
        Ok(acquired)
    }
}
