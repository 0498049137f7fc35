//! Request/response correlation.
//!
//! Every outstanding request owns one [`PendingCall`] keyed by its caller id.
//! A call is settled by removing its entry from the table; only the remover
//! invokes the callback, so a genuine response racing the sender-side timer
//! produces exactly one callback.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use switchboard_core::codes::SENDER_TIMEOUT;
use switchboard_core::{CallerId, Reply, Value};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Callback invoked once with the outcome of a call.
pub type ResponseCallback = Box<dyn FnOnce(Reply) + Send + 'static>;

/// Hook run after a call is settled, whichever way. Used to drop the
/// transient response subscription.
pub type SettleHook = Arc<dyn Fn(&CallerId) + Send + Sync + 'static>;

struct PendingCall {
    // Taken exactly once by whoever removes the entry. The mutex keeps the
    // table `Sync` without requiring callbacks to be.
    callback: Mutex<Option<ResponseCallback>>,
    timer: Option<AbortHandle>,
    created_at: Instant,
}

/// Tracks outstanding calls and enforces sender-side timeouts.
#[derive(Clone, Default)]
pub struct Correlator {
    pending: Arc<DashMap<CallerId, PendingCall>>,
    on_settled: Option<SettleHook>,
}

impl Correlator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a correlator that runs `hook` after every settlement.
    #[must_use]
    pub fn with_settle_hook(hook: SettleHook) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            on_settled: Some(hook),
        }
    }

    /// Allocates a caller id, stores the callback, and arms the timeout.
    ///
    /// Nothing is published; the caller sends the request tagged with the
    /// returned id. Must be called inside a tokio runtime.
    pub fn issue(&self, callback: ResponseCallback, timeout: Duration) -> CallerId {
        let mut id = CallerId::generate();
        while self.pending.contains_key(&id) {
            id = CallerId::generate();
        }

        self.pending.insert(
            id.clone(),
            PendingCall {
                callback: Mutex::new(Some(callback)),
                timer: None,
                created_at: Instant::now(),
            },
        );

        let timer = {
            let correlator = self.clone();
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if correlator.settle(&id, Reply::empty(SENDER_TIMEOUT), true) {
                    metrics::counter!("switchboard_sender_timeouts_total").increment(1);
                    info!(sender = %id, timeout_ms = timeout.as_millis(), "request timed out waiting for a response");
                }
            })
            .abort_handle()
        };

        match self.pending.get_mut(&id) {
            Some(mut call) => call.timer = Some(timer),
            // Already settled between insert and arming.
            None => timer.abort(),
        }

        metrics::counter!("switchboard_requests_issued_total").increment(1);
        id
    }

    /// Settles a call with a genuine response.
    ///
    /// Returns `true` if a pending call was found and its callback invoked;
    /// unknown or already-settled ids are a silent no-op.
    pub fn resolve(&self, id: &CallerId, data: Value, code: u16) -> bool {
        self.settle(id, Reply::new(data, code), false)
    }

    fn settle(&self, id: &CallerId, reply: Reply, from_timer: bool) -> bool {
        let Some((_, call)) = self.pending.remove(id) else {
            debug!(sender = %id, "no pending call; ignoring");
            return false;
        };

        if !from_timer {
            if let Some(timer) = call.timer {
                timer.abort();
            }
        }

        debug!(
            sender = %id,
            code = reply.code,
            elapsed_ms = call.created_at.elapsed().as_millis(),
            "call settled"
        );
        if let Some(callback) = call.callback.into_inner() {
            callback(reply);
        }

        if let Some(hook) = &self.on_settled {
            hook(id);
        }
        true
    }

    /// Number of calls still awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_pending(&self, id: &CallerId) -> bool {
        self.pending.contains_key(id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;

    fn recording() -> (Arc<Mutex<Vec<Reply>>>, impl Fn() -> ResponseCallback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = Arc::clone(&log);
            move || -> ResponseCallback {
                let log = Arc::clone(&log);
                Box::new(move |reply| log.lock().push(reply))
            }
        };
        (log, make)
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_invokes_callback_once() {
        let correlator = Correlator::new();
        let (log, make) = recording();

        let id = correlator.issue(make(), Duration::from_secs(10));
        assert!(correlator.is_pending(&id));

        assert!(correlator.resolve(&id, json!("Pong!"), 200));
        assert!(!correlator.resolve(&id, json!("again"), 200));
        assert!(!correlator.is_pending(&id));

        // The cancelled timer must not fire a second outcome.
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(log.lock().clone(), vec![Reply::new(json!("Pong!"), 200)]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_yields_sender_timeout() {
        let correlator = Correlator::new();
        let (log, make) = recording();

        let id = correlator.issue(make(), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(log.lock().clone(), vec![Reply::empty(SENDER_TIMEOUT)]);
        assert!(!correlator.resolve(&id, json!("late"), 200));
        assert_eq!(log.lock().len(), 1);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn unknown_id_is_noop() {
        let correlator = Correlator::new();
        assert!(!correlator.resolve(&CallerId::from("nope"), Value::Null, 200));
    }

    #[tokio::test(start_paused = true)]
    async fn settle_hook_runs_for_both_paths() {
        let settled = Arc::new(AtomicU32::new(0));
        let hook: SettleHook = {
            let settled = Arc::clone(&settled);
            Arc::new(move |_id| {
                settled.fetch_add(1, Ordering::SeqCst);
            })
        };
        let correlator = Correlator::with_settle_hook(hook);

        let answered = correlator.issue(Box::new(|_| {}), Duration::from_secs(5));
        let _abandoned = correlator.issue(Box::new(|_| {}), Duration::from_secs(1));

        correlator.resolve(&answered, Value::Null, 200);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(settled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn ids_are_unique_across_many_issues() {
        let correlator = Correlator::new();
        let mut ids = std::collections::HashSet::new();
        for _ in 0..500 {
            ids.insert(correlator.issue(Box::new(|_| {}), Duration::from_secs(60)));
        }
        assert_eq!(ids.len(), 500);
        assert_eq!(correlator.pending_count(), 500);
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn correlator_is_shareable_across_tasks() {
        assert_send_sync::<Correlator>();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn non_sync_callback_is_accepted() {
        // `Cell` is `Send` but not `Sync`.
        let seen = std::cell::Cell::new(0u16);
        let (tx, rx) = tokio::sync::oneshot::channel();
        let correlator = Correlator::new();
        let id = correlator.issue(
            Box::new(move |reply: Reply| {
                seen.set(reply.code);
                let _ = tx.send(seen.get());
            }),
            Duration::from_secs(5),
        );

        let resolver = correlator.clone();
        tokio::spawn(async move { resolver.resolve(&id, Value::Null, 201) })
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap(), 201);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_resolvers_settle_at_most_once() {
        for _ in 0..50 {
            let correlator = Correlator::new();
            let calls = Arc::new(AtomicU32::new(0));
            let id = {
                let calls = Arc::clone(&calls);
                correlator.issue(
                    Box::new(move |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                    }),
                    Duration::from_millis(1),
                )
            };

            let mut racers = Vec::new();
            for i in 0..4 {
                let correlator = correlator.clone();
                let id = id.clone();
                racers.push(tokio::spawn(async move {
                    correlator.resolve(&id, json!(i), 200);
                }));
            }
            for racer in racers {
                racer.await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }
}
