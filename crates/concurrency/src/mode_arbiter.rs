//! The mode arbiter: serializes the one-way KV -> QUERY transition across
//! concurrent operations within a single attempt.
//!
//! A public op counter tracks outstanding operations; a separate
//! in-flight counter and three condition variables (ops-drain,
//! query-node-known, in-flight-drain) coordinate the transition itself.

use parking_lot::{Condvar, Mutex};
use std::fmt;

/// Raised when an operation is attempted after the attempt has been closed
/// to new work (i.e. after `wait_and_block_ops` has run for commit/rollback).
#[derive(Debug, Clone, thiserror::Error)]
#[error("operation attempted after commit or rollback")]
pub struct AsyncOperationConflict;

/// Which transport an attempt is currently using.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptMode {
    Kv,
    Query { query_node: String },
}

impl AttemptMode {
    pub fn is_query(&self) -> bool {
        matches!(self, AttemptMode::Query { .. })
    }
}

impl fmt::Display for AttemptMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptMode::Kv => write!(f, "KV"),
            AttemptMode::Query { query_node } => write!(f, "QUERY({query_node})"),
        }
    }
}

#[derive(Debug)]
enum RawMode {
    Kv,
    Query { query_node: Option<String> },
}

struct Inner {
    count: i32,
    allow_ops: bool,
    mode: RawMode,
    in_flight: i32,
}

/// The per-attempt coordinator enforcing: (a) exactly one "begin work" call
/// per attempt, (b) no KV operation executes after the attempt has begun
/// the query transition, (c) concurrent callers hitting the transition see
/// the post-transition state.
pub struct ModeArbiter {
    inner: Mutex<Inner>,
    ops_drained: Condvar,
    query_node_known: Condvar,
    in_flight_drained: Condvar,
}

impl Default for ModeArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl ModeArbiter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                count: 0,
                allow_ops: true,
                mode: RawMode::Kv,
                in_flight: 0,
            }),
            ops_drained: Condvar::new(),
            query_node_known: Condvar::new(),
            in_flight_drained: Condvar::new(),
        }
    }

    /// Called around every public operation's start.
    pub fn increment_ops(&self) -> Result<(), AsyncOperationConflict> {
        self.change_count(1)
    }

    /// Called around every public operation's end.
    pub fn decrement_ops(&self) -> Result<(), AsyncOperationConflict> {
        self.change_count(-1)
    }

    fn change_count(&self, delta: i32) -> Result<(), AsyncOperationConflict> {
        let mut guard = self.inner.lock();
        if !guard.allow_ops {
            tracing::error!("operation attempted after commit/rollback");
            return Err(AsyncOperationConflict);
        }
        guard.count += delta;
        if delta > 0 {
            guard.in_flight += delta;
        }
        tracing::trace!(count = guard.count, in_flight = guard.in_flight, "op count changed");
        if guard.count == 0 {
            self.ops_drained.notify_all();
        }
        if guard.in_flight == 0 {
            self.in_flight_drained.notify_all();
        }
        Ok(())
    }

    /// Decrement this op's own in-flight count, without touching `count`
    /// (used by `set_query_mode` before waiting for siblings to drain).
    pub fn decrement_in_flight(&self) {
        let mut guard = self.inner.lock();
        guard.in_flight -= 1;
        debug_assert!(guard.in_flight >= 0);
        if guard.in_flight == 0 {
            self.in_flight_drained.notify_all();
        }
    }

    /// Block until all outstanding ops drain to zero, then close the
    /// attempt to further ops. Used before commit/rollback.
    pub fn wait_and_block_ops(&self) {
        let mut guard = self.inner.lock();
        while guard.count != 0 {
            self.ops_drained.wait(&mut guard);
        }
        guard.allow_ops = false;
    }

    /// Current mode. If already QUERY, blocks until the query node is known
    /// so concurrent callers pile up behind the first.
    pub fn get_mode(&self) -> AttemptMode {
        let mut guard = self.inner.lock();
        loop {
            match &guard.mode {
                RawMode::Kv => return AttemptMode::Kv,
                RawMode::Query { query_node: Some(node) } => {
                    return AttemptMode::Query { query_node: node.clone() }
                }
                RawMode::Query { query_node: None } => {
                    self.query_node_known.wait(&mut guard);
                }
            }
        }
    }

    /// Drive the one-way KV -> QUERY transition. `begin_work` is invoked
    /// exactly once across all concurrent callers (the winner); a racer
    /// instead waits for the node to be known and then runs `do_work`.
    ///
    /// On success, `set_query_node` must be called by the winner (usually
    /// from inside `begin_work`) to unblock racers and `get_mode` callers.
    pub fn set_query_mode<B, D, T>(&self, begin_work: B, do_work: D) -> T
    where
        B: FnOnce() -> T,
        D: FnOnce() -> T,
    {
        let mut guard = self.inner.lock();
        guard.in_flight -= 1;
        if let RawMode::Kv = guard.mode {
            tracing::trace!("set_query_mode: waiting for in_flight ops to drain");
            while guard.in_flight != 0 {
                self.in_flight_drained.wait(&mut guard);
            }
            if let RawMode::Kv = guard.mode {
                tracing::trace!("set_query_mode: in_flight drained, flipping to QUERY");
                guard.mode = RawMode::Query { query_node: None };
                guard.in_flight += 1;
                drop(guard);
                return begin_work();
            }
        }
        tracing::trace!("set_query_mode: already QUERY, waiting for node");
        while matches!(&guard.mode, RawMode::Query { query_node: None }) {
            self.query_node_known.wait(&mut guard);
        }
        while guard.in_flight != 0 {
            self.in_flight_drained.wait(&mut guard);
        }
        guard.in_flight += 1;
        drop(guard);
        do_work()
    }

    /// Only valid when `begin_work` itself failed: flip back to KV mode so
    /// rollback can proceed via KV, and wake anyone waiting on the node.
    pub fn reset_query_mode(&self) {
        let mut guard = self.inner.lock();
        guard.mode = RawMode::Kv;
        self.query_node_known.notify_all();
    }

    /// Record the query node once `begin_work` has chosen one, unblocking
    /// everyone waiting in `get_mode`/`set_query_mode`.
    pub fn set_query_node(&self, node: impl Into<String>) {
        let mut guard = self.inner.lock();
        debug_assert!(matches!(guard.mode, RawMode::Query { .. }));
        guard.mode = RawMode::Query { query_node: Some(node.into()) };
        self.query_node_known.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn starts_in_kv_mode() {
        let arbiter = ModeArbiter::new();
        assert_eq!(arbiter.get_mode(), AttemptMode::Kv);
    }

    #[test]
    fn ops_after_block_are_rejected() {
        let arbiter = ModeArbiter::new();
        arbiter.increment_ops().unwrap();
        arbiter.decrement_ops().unwrap();
        arbiter.wait_and_block_ops();
        assert!(arbiter.increment_ops().is_err());
    }

    #[test]
    fn set_query_mode_invokes_begin_work_once() {
        let arbiter = Arc::new(ModeArbiter::new());
        arbiter.increment_ops().unwrap();
        let result = arbiter.set_query_mode(
            || {
                arbiter.set_query_node("node-1");
                "began"
            },
            || "raced",
        );
        assert_eq!(result, "began");
        assert_eq!(
            arbiter.get_mode(),
            AttemptMode::Query { query_node: "node-1".to_string() }
        );
    }

    #[test]
    fn racer_waits_for_node_and_runs_do_work() {
        let arbiter = Arc::new(ModeArbiter::new());
        arbiter.increment_ops().unwrap();
        arbiter.increment_ops().unwrap();

        let winner = Arc::clone(&arbiter);
        let handle = thread::spawn(move || {
            winner.set_query_mode(
                || {
                    thread::sleep(Duration::from_millis(50));
                    winner.set_query_node("node-1");
                    "began"
                },
                || "raced",
            )
        });

        // Give the winner a head start so it observes KV mode first.
        thread::sleep(Duration::from_millis(10));
        let racer_result = arbiter.set_query_mode(|| "began-by-racer", || "raced");
        assert_eq!(racer_result, "raced");
        assert_eq!(handle.join().unwrap(), "began");
    }

    #[test]
    fn reset_query_mode_reverts_to_kv() {
        let arbiter = ModeArbiter::new();
        arbiter.increment_ops().unwrap();
        let _ = arbiter.set_query_mode(
            || "began",
            || "raced",
        );
        arbiter.reset_query_mode();
        assert_eq!(arbiter.get_mode(), AttemptMode::Kv);
    }
}
