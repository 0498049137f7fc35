use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::context::HandlerContext;

/// A message handler.
///
/// Implemented for any `Fn(HandlerContext) -> impl Future<Output =
/// anyhow::Result<()>>`, so plain async closures can be registered.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, ctx: HandlerContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn call(&self, ctx: HandlerContext) -> anyhow::Result<()> {
        (self)(ctx).await
    }
}

/// Whether a subscription answers its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Correlated request handler; always produces a response.
    Reply,
    /// Fire-and-forget signal handler; never responds.
    Slot,
}

impl HandlerKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reply => "reply",
            Self::Slot => "slot",
        }
    }
}

/// Identifier returned by registration, used for targeted removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// One registered handler on one topic.
pub struct Subscription {
    pub id: SubscriptionId,
    /// Full transport topic (namespace prefix applied), possibly a pattern.
    pub topic: String,
    pub kind: HandlerKind,
    pub handler: Arc<dyn Handler>,
    pub exclusive_group: Option<String>,
    pub execution_timeout: Duration,
    pub isolate: bool,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("kind", &self.kind)
            .field("exclusive_group", &self.exclusive_group)
            .field("execution_timeout", &self.execution_timeout)
            .field("isolate", &self.isolate)
            .finish_non_exhaustive()
    }
}
