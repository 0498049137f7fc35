use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// One message handed from the transport to a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// The subscription that matched: the exact topic, or the wildcard pattern.
    pub subscription: String,
    /// Concrete topic the message was published on.
    pub topic: String,
    /// Raw payload, normally an encoded envelope.
    pub payload: String,
}

/// Pluggable pub/sub transport driver.
/// Implementations: in-memory broker (tests, single process), Redis-style brokers.
///
/// Topics containing `*` are pattern subscriptions; all others are exact.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a payload on a concrete topic.
    async fn publish(&self, topic: &str, payload: String) -> anyhow::Result<()>;

    /// Subscribe this connection to an exact topic or a wildcard pattern.
    async fn subscribe(&self, topic: &str) -> anyhow::Result<()>;

    /// Drop a subscription previously made with `subscribe`.
    async fn unsubscribe(&self, topic: &str) -> anyhow::Result<()>;

    /// Number of connections that would receive a publish on `topic`.
    async fn subscriber_count(&self, topic: &str) -> anyhow::Result<usize>;

    /// Hand over the inbound delivery stream. Returns `None` after the first call.
    fn take_deliveries(&self) -> Option<mpsc::UnboundedReceiver<Delivery>>;

    /// Close the connection. Subscriptions are released.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Shared key space with atomic set-if-absent-with-TTL semantics.
///
/// Must be shared by every process taking part in an exclusive group; a
/// client-side lock is not sufficient.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set `key` if it is absent or expired. Returns `true` if this call set it.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> anyhow::Result<bool>;
}
