//! Backend lifecycle with in-flight handler tracking.
//!
//! State lives in an `ArcSwap` so the dispatch loop and request paths read it
//! without locking; handler executions hold an RAII guard so `stop()` can
//! wait for them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Backend lifecycle state.
///
/// State machine: Starting -> Running -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Connected, dispatch loop not yet started.
    Starting,
    /// Dispatching deliveries and accepting registrations.
    Running,
    /// `stop()` called; new deliveries are dropped, in-flight handlers finish.
    Draining,
    /// Transport closed.
    Stopped,
}

impl LifecycleState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

/// Coordinates backend shutdown.
#[derive(Debug)]
pub struct LifecycleController {
    shutdown_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    state: ArcSwap<LifecycleState>,
}

impl LifecycleController {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            state: ArcSwap::from_pointee(LifecycleState::Starting),
        }
    }

    pub fn set_running(&self) {
        self.state.store(Arc::new(LifecycleState::Running));
    }

    /// Notified once when draining begins.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Moves to `Draining` and signals the dispatch loop.
    ///
    /// Returns `false` if draining had already begun.
    pub fn begin_drain(&self) -> bool {
        let previous = self.state.swap(Arc::new(LifecycleState::Draining));
        if matches!(*previous, LifecycleState::Draining | LifecycleState::Stopped) {
            self.state.store(previous);
            return false;
        }
        let _ = self.shutdown_signal.send(true);
        true
    }

    pub fn set_stopped(&self) {
        self.state.store(Arc::new(LifecycleState::Stopped));
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        matches!(self.state(), LifecycleState::Starting | LifecycleState::Running)
    }

    /// Tracks one handler execution until dropped.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits for in-flight handlers, up to `timeout`.
    ///
    /// Returns `true` if everything finished in time.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter on drop, including during unwinding.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_transitions() {
        let lifecycle = LifecycleController::new();
        assert_eq!(lifecycle.state(), LifecycleState::Starting);
        assert!(lifecycle.is_accepting());

        lifecycle.set_running();
        assert_eq!(lifecycle.state(), LifecycleState::Running);

        assert!(lifecycle.begin_drain());
        assert_eq!(lifecycle.state(), LifecycleState::Draining);
        assert!(!lifecycle.is_accepting());

        lifecycle.set_stopped();
        assert!(!lifecycle.begin_drain());
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }

    #[test]
    fn guards_track_in_flight() {
        let lifecycle = LifecycleController::new();
        let a = lifecycle.in_flight_guard();
        let b = lifecycle.in_flight_guard();
        assert_eq!(lifecycle.in_flight_count(), 2);
        drop(a);
        drop(b);
        assert_eq!(lifecycle.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn receiver_notified_on_drain() {
        let lifecycle = LifecycleController::new();
        let mut rx = lifecycle.shutdown_receiver();
        assert!(!*rx.borrow());

        lifecycle.begin_drain();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_guard() {
        let lifecycle = Arc::new(LifecycleController::new());
        let guard = lifecycle.in_flight_guard();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });
        assert!(lifecycle.wait_for_drain(Duration::from_secs(2)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_times_out() {
        let lifecycle = LifecycleController::new();
        let _guard = lifecycle.in_flight_guard();
        assert!(!lifecycle.wait_for_drain(Duration::from_millis(50)).await);
    }
}
