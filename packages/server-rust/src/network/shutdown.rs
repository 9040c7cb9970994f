//! Stop-and-drain coordination.
//!
//! A [`ShutdownController`] is shared by the accept loop, every connection
//! loop, and the admin opnames that can stop the server. The stop request
//! travels on a `watch` channel; the lifecycle phase lives in an `ArcSwap`
//! so `_health` can read it without locking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::info;

use super::connection::ConnectionRegistry;

/// Lifecycle phase: `Starting -> Ready -> Draining -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    Ready,
    /// Listener closed, requests still finishing.
    Draining,
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the server is going down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    /// Signal or `_shutdown`: a supervisor may restart the process.
    Normal,
    /// `_shutdownloop`: the supervisor loop should stop restarting it.
    Loop,
}

/// Shared stop flag, lifecycle phase, and pending-request count.
#[derive(Debug)]
pub struct ShutdownController {
    stop: watch::Sender<Option<ShutdownKind>>,
    pending: Arc<AtomicU64>,
    phase: ArcSwap<HealthState>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stop: watch::Sender::new(None),
            pending: Arc::new(AtomicU64::new(0)),
            phase: ArcSwap::from_pointee(HealthState::Starting),
        }
    }

    fn enter(&self, phase: HealthState) {
        self.phase.store(Arc::new(phase));
    }

    /// Called by the acceptor once it starts accepting.
    pub fn set_ready(&self) {
        self.enter(HealthState::Ready);
    }

    /// Holds `None` until a stop is requested, then the requested kind.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<Option<ShutdownKind>> {
        self.stop.subscribe()
    }

    /// Requests a stop. Later requests do not change the kind.
    pub fn trigger_shutdown(&self, kind: ShutdownKind) {
        let accepted = self.stop.send_if_modified(|slot| match slot {
            Some(_) => false,
            None => {
                *slot = Some(kind);
                true
            }
        });
        if accepted {
            self.enter(HealthState::Draining);
            info!(?kind, "shutdown requested");
        }
    }

    #[must_use]
    pub fn shutdown_kind(&self) -> Option<ShutdownKind> {
        *self.stop.borrow()
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.stop.borrow().is_some()
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.phase.load()
    }

    /// Marks one request as pending until the returned value is dropped.
    #[must_use]
    pub fn pending_request(&self) -> PendingRequest {
        self.pending.fetch_add(1, Ordering::AcqRel);
        PendingRequest {
            counter: Arc::clone(&self.pending),
        }
    }

    #[must_use]
    pub fn pending_count(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    /// Polls every `poll` until no request is pending and no connection is
    /// open, or `timeout` passes.
    ///
    /// `true` means everything finished and the phase is now `Stopped`.
    pub async fn wait_for_drain(
        &self,
        connections: &ConnectionRegistry,
        timeout: Duration,
        poll: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let (pending, open) = (self.pending_count(), connections.count());
            if pending == 0 && open == 0 {
                self.enter(HealthState::Stopped);
                return true;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            info!(pending, open, left_secs = left.as_secs_f64(), "draining");
            tokio::time::sleep(poll.min(left)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// One pending request. Dropping it, on any path, decrements the count.
#[derive(Debug)]
pub struct PendingRequest {
    counter: Arc<AtomicU64>,
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
