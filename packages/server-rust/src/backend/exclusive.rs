//! Competing-consumer exclusivity.
//!
//! Every member of an exclusive group receives each call (fan-out delivery);
//! the member that sets `caller_id + group` in the shared lock store first
//! runs the handler and the rest drop the call silently. Locks are never
//! released explicitly: the TTL is the only release, so a replay of the same
//! call within the TTL window is suppressed as well.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::traits::LockStore;

/// Distributed TTL lock keyed by (caller id, group).
#[derive(Clone)]
pub struct ExclusivityCoordinator {
    store: Arc<dyn LockStore>,
    ttl: Duration,
}

impl ExclusivityCoordinator {
    #[must_use]
    pub fn new(store: Arc<dyn LockStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Lock key for one call within one group.
    #[must_use]
    pub fn lock_key(sender: &str, group: &str) -> String {
        format!("{sender}{group}")
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Attempts to claim the call for this group member.
    ///
    /// A lock-store failure counts as a lost claim: executing without the
    /// lock could run the handler twice.
    pub async fn try_acquire(&self, sender: &str, group: &str) -> bool {
        let key = Self::lock_key(sender, group);
        match self.store.try_acquire(&key, self.ttl).await {
            Ok(true) => true,
            Ok(false) => {
                metrics::counter!("switchboard_exclusive_lock_lost_total").increment(1);
                debug!(sender, group, "call already claimed by another group member");
                false
            }
            Err(err) => {
                error!(sender, group, error = %err, "exclusive lock store failed");
                false
            }
        }
    }
}
