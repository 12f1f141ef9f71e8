//! Multi-instrument barrier coordination.
//!
//! Commands issued inside a `parallel { … }` block share a sync token. Each
//! participating worker acknowledges the token when the command reaches its
//! barrier point; when every expected instrument has acknowledged, the
//! barrier is complete and removed. The dispatcher then releases the token
//! by sending `SyncContinue` to each participant.
//!
//! Tokens are allocated from one daemon-wide monotonic counter, so tokens
//! from concurrently running scripts never collide, and each script's
//! release order equals its allocation order.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Barrier state for one sync token.
#[derive(Debug, Clone)]
struct SyncBarrier {
    expected: BTreeSet<String>,
    acked: BTreeSet<String>,
    #[allow(dead_code)]
    created_at: Instant,
}

#[derive(Default)]
struct CoordinatorState {
    barriers: HashMap<u64, SyncBarrier>,
    /// Tokens whose barrier completed (the record itself is removed on
    /// completion, so waiters need this to distinguish done from unknown).
    completed: HashSet<u64>,
}

/// Stateful map of sync token → barrier.
#[derive(Default)]
pub struct SyncCoordinator {
    state: Mutex<CoordinatorState>,
    completion_cv: Condvar,
    next_token: AtomicU64,
}

impl SyncCoordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CoordinatorState::default()),
            completion_cv: Condvar::new(),
            next_token: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh sync token.
    pub fn allocate_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Create a barrier expecting an ack from each named instrument.
    pub fn register_barrier<I, S>(&self, sync_token: u64, instruments: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let expected: BTreeSet<String> = instruments.into_iter().map(Into::into).collect();
        debug!(token = sync_token, instruments = expected.len(), "registered barrier");
        let mut state = self.lock();
        state.completed.remove(&sync_token);
        state.barriers.insert(
            sync_token,
            SyncBarrier {
                expected,
                acked: BTreeSet::new(),
                created_at: Instant::now(),
            },
        );
    }

    /// Record an acknowledgment. Returns `true` when this ack completes the
    /// barrier (which also removes it).
    pub fn handle_ack(&self, sync_token: u64, instrument_name: &str) -> bool {
        let mut state = self.lock();
        let Some(barrier) = state.barriers.get_mut(&sync_token) else {
            warn!(token = sync_token, instrument = instrument_name, "ack for unknown sync token");
            return false;
        };
        if !barrier.expected.contains(instrument_name) {
            warn!(
                token = sync_token,
                instrument = instrument_name,
                "ack from instrument outside the barrier's expected set"
            );
            return false;
        }

        barrier.acked.insert(instrument_name.to_string());
        debug!(
            token = sync_token,
            instrument = instrument_name,
            acked = barrier.acked.len(),
            expected = barrier.expected.len(),
            "barrier ack"
        );

        let complete = barrier.acked == barrier.expected;
        if complete {
            info!(token = sync_token, "barrier complete");
            state.barriers.remove(&sync_token);
            state.completed.insert(sync_token);
            self.completion_cv.notify_all();
        }
        complete
    }

    /// Instruments that have not acknowledged yet.
    pub fn get_waiting_instruments(&self, sync_token: u64) -> Vec<String> {
        let state = self.lock();
        match state.barriers.get(&sync_token) {
            Some(b) => b.expected.difference(&b.acked).cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn has_barrier(&self, sync_token: u64) -> bool {
        self.lock().barriers.contains_key(&sync_token)
    }

    /// Drop a barrier without completing it.
    pub fn clear_barrier(&self, sync_token: u64) {
        let mut state = self.lock();
        state.barriers.remove(&sync_token);
        state.completed.remove(&sync_token);
        debug!(token = sync_token, "cleared barrier");
    }

    pub fn active_barrier_count(&self) -> usize {
        self.lock().barriers.len()
    }

    /// Block until the barrier completes or `timeout` elapses.
    ///
    /// Returns `true` on completion and consumes the completion marker, so
    /// each completed token can be awaited once.
    pub fn wait_complete(&self, sync_token: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.completed.contains(&sync_token) {
                state.completed.remove(&sync_token);
                return true;
            }
            if !state.barriers.contains_key(&sync_token) {
                // Never registered, or cleared.
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            #[allow(clippy::unwrap_used)]
            let (guard, result) = self
                .completion_cv
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
            if result.timed_out()
                && !state.completed.contains(&sync_token)
                && state.barriers.contains_key(&sync_token)
            {
                return false;
            }
        }
    }

    #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable here
    fn lock(&self) -> std::sync::MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barrier_completes_after_all_acks() {
        let coord = SyncCoordinator::new();
        coord.register_barrier(42, ["A", "B", "C"]);

        assert!(!coord.handle_ack(42, "A"));
        assert!(!coord.handle_ack(42, "B"));
        assert!(coord.handle_ack(42, "C"));
        assert!(!coord.has_barrier(42));
    }

    #[test]
    fn unknown_token_is_ignored() {
        let coord = SyncCoordinator::new();
        assert!(!coord.handle_ack(99, "A"));
    }

    #[test]
    fn unexpected_instrument_is_ignored() {
        let coord = SyncCoordinator::new();
        coord.register_barrier(7, ["A"]);
        assert!(!coord.handle_ack(7, "B"));
        assert_eq!(coord.get_waiting_instruments(7), vec!["A".to_string()]);
    }

    #[test]
    fn waiting_set_shrinks_with_acks() {
        let coord = SyncCoordinator::new();
        coord.register_barrier(1, ["A", "B"]);
        coord.handle_ack(1, "B");
        assert_eq!(coord.get_waiting_instruments(1), vec!["A".to_string()]);
    }

    #[test]
    fn tokens_are_monotonic() {
        let coord = SyncCoordinator::new();
        let a = coord.allocate_token();
        let b = coord.allocate_token();
        assert!(b > a);
    }

    #[test]
    fn wait_complete_observes_completion_from_another_thread() {
        let coord = std::sync::Arc::new(SyncCoordinator::new());
        coord.register_barrier(5, ["A"]);

        let acker = std::sync::Arc::clone(&coord);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            acker.handle_ack(5, "A");
        });

        assert!(coord.wait_complete(5, Duration::from_secs(2)));
        handle.join().unwrap();
        // Completion marker is consumed.
        assert!(!coord.wait_complete(5, Duration::from_millis(10)));
    }

    #[test]
    fn wait_complete_times_out_without_acks() {
        let coord = SyncCoordinator::new();
        coord.register_barrier(6, ["A"]);
        let start = Instant::now();
        assert!(!coord.wait_complete(6, Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn clear_barrier_removes_state() {
        let coord = SyncCoordinator::new();
        coord.register_barrier(8, ["A", "B"]);
        assert_eq!(coord.active_barrier_count(), 1);
        coord.clear_barrier(8);
        assert_eq!(coord.active_barrier_count(), 0);
        assert!(!coord.wait_complete(8, Duration::from_millis(10)));
    }
}
