//! In-flight call tracking and per-opname latency statistics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rpcserve_core::Protocol;

/// Aggregate latency for one opname.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodStat {
    pub count: u64,
    pub min: Duration,
    pub max: Duration,
    pub total: Duration,
}

impl MethodStat {
    fn single(elapsed: Duration) -> Self {
        Self {
            count: 1,
            min: elapsed,
            max: elapsed,
            total: elapsed,
        }
    }

    /// Folds `other` into `self`.
    pub fn merge(&mut self, other: &MethodStat) {
        if self.count == 0 {
            *self = *other;
            return;
        }
        if other.count == 0 {
            return;
        }
        self.count += other.count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.total += other.total;
    }

    #[must_use]
    pub fn average(&self) -> Duration {
        u32::try_from(self.count)
            .ok()
            .filter(|&n| n > 0)
            .map_or(Duration::ZERO, |n| self.total / n)
    }
}

/// A call that has begun and not yet ended.
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub id: u64,
    pub opname: String,
    pub protocol: Protocol,
    pub started: Instant,
    /// Rendered input, kept for `_usage`.
    pub input: String,
}

#[derive(Debug)]
struct TrackerState {
    next_id: u64,
    pending: HashMap<u64, PendingCall>,
    stats: HashMap<String, MethodStat>,
}

/// Tracks every dispatched call from begin to end.
///
/// One short lock guards all state; it is never held across a method
/// invocation.
#[derive(Debug)]
pub struct CallTracker {
    state: Mutex<TrackerState>,
    started: Instant,
}

impl CallTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState {
                next_id: 1,
                pending: HashMap::new(),
                stats: HashMap::new(),
            }),
            started: Instant::now(),
        }
    }

    /// Records the start of a call. Dropping the guard ends it.
    pub fn begin(self: &Arc<Self>, opname: &str, protocol: Protocol, input: String) -> CallGuard {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.pending.insert(
            id,
            PendingCall {
                id,
                opname: opname.to_string(),
                protocol,
                started: Instant::now(),
                input,
            },
        );
        CallGuard {
            tracker: Arc::clone(self),
            id,
        }
    }

    fn end(&self, id: u64) {
        let (opname, elapsed) = {
            let mut state = self.state.lock();
            let Some(call) = state.pending.remove(&id) else {
                return;
            };
            let elapsed = call.started.elapsed();
            state
                .stats
                .entry(call.opname.clone())
                .or_default()
                .merge(&MethodStat::single(elapsed));
            (call.opname, elapsed)
        };

        metrics::counter!("rpc_calls_total", "opname" => opname.clone()).increment(1);
        metrics::histogram!("rpc_call_duration_seconds", "opname" => opname).record(elapsed.as_secs_f64());
    }

    /// Calls in flight, oldest first.
    #[must_use]
    pub fn pending(&self) -> Vec<PendingCall> {
        let mut calls: Vec<PendingCall> = self.state.lock().pending.values().cloned().collect();
        calls.sort_by_key(|c| c.id);
        calls
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Per-opname stats, most called first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, MethodStat)> {
        let mut stats: Vec<(String, MethodStat)> = self
            .state
            .lock()
            .stats
            .iter()
            .map(|(name, stat)| (name.clone(), *stat))
            .collect();
        stats.sort_by(|a, b| b.1.count.cmp(&a.1.count).then_with(|| a.0.cmp(&b.0)));
        stats
    }

    #[must_use]
    pub fn total_calls(&self) -> u64 {
        self.state.lock().stats.values().map(|s| s.count).sum()
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for CallTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Ends its call exactly once, when dropped.
#[derive(Debug)]
pub struct CallGuard {
    tracker: Arc<CallTracker>,
    id: u64,
}

impl CallGuard {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.tracker.end(self.id);
    }
}
