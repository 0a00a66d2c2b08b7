//! Per-worker downstream connection pools.
//!
//! One `PoolEntry` per server identity (`host:port:usr:pwd:proto`),
//! owned exclusively by its worker thread — no locking anywhere here.
//! A live connection is always in exactly one place: the entry's idle
//! stack, held by a request, or closed.

use futures::channel::oneshot;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// What the pool needs to know about a pooled connection. A trait seam
/// so the accounting can be exercised without sockets.
pub trait PoolConn {
    fn identity(&self) -> &str;

    /// Epoch of the config the socket was opened under. Sockets from a
    /// previous epoch are closed on release instead of pooled.
    fn config_epoch(&self) -> u64;

    /// False while a response is partially consumed; such a socket can
    /// not be handed to another request.
    fn is_clean(&self) -> bool;
}

/// Error delivered to queued waiters when their identity goes dark
/// (every socket gone and the last connect failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitersFlushed;

pub enum AcquireOutcome<C> {
    /// Popped from the idle stack.
    Ready(C),
    /// Below the per-identity cap: the caller owns a fresh connect and
    /// must report it via `connect_succeeded`/`connect_failed`.
    MustConnect,
    /// At the cap: wait for a release to hand a socket over. Dropping
    /// the receiver (queue timeout) is safe — release skips dead
    /// waiters.
    Queued(oneshot::Receiver<Result<C, WaitersFlushed>>),
    /// Identity is blacklisted; fail fast without touching the socket
    /// layer.
    Blacklisted,
}

struct PoolEntry<C> {
    idle: Vec<C>,
    acquired: u32,
    error_count: u32,
    error_time: Option<Instant>,
    waiters: VecDeque<oneshot::Sender<Result<C, WaitersFlushed>>>,
    /// Sockets to close on release instead of pooling, set when a
    /// waiter timed out on this identity: whatever socket it was
    /// waiting for is suspect and reconnects fresh.
    pending_close: u32,
}

impl<C> Default for PoolEntry<C> {
    fn default() -> Self {
        Self {
            idle: Vec::new(),
            acquired: 0,
            error_count: 0,
            error_time: None,
            waiters: VecDeque::new(),
            pending_close: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolTuning {
    /// Per-identity socket cap; 0 = unlimited.
    pub conn_max: u32,
    /// Errors before blacklisting; 0 disables the blacklist.
    pub connect_max_errors: u32,
    /// How long a blacklisted identity stays suppressed.
    pub retry_interval: Duration,
}

pub struct DownstreamPools<C> {
    tuning: PoolTuning,
    epoch: u64,
    entries: HashMap<String, PoolEntry<C>>,
}

impl<C: PoolConn> DownstreamPools<C> {
    pub fn new(tuning: PoolTuning, epoch: u64) -> Self {
        Self { tuning, epoch, entries: HashMap::new() }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Full reconfigure: every idle socket closes, every waiter is
    /// flushed with an error, all accounting starts over.
    pub fn reset(&mut self, epoch: u64) {
        for (_, mut entry) in self.entries.drain() {
            while let Some(tx) = entry.waiters.pop_front() {
                let _ = tx.send(Err(WaitersFlushed));
            }
        }
        self.epoch = epoch;
    }

    fn blacklisted(&self, entry: &PoolEntry<C>) -> bool {
        self.tuning.connect_max_errors > 0
            && entry.error_count > self.tuning.connect_max_errors
            && entry
                .error_time
                .is_some_and(|t| t.elapsed() < self.tuning.retry_interval)
    }

    pub fn acquire(&mut self, identity: &str) -> AcquireOutcome<C> {
        let conn_max = self.tuning.conn_max;
        let entry = self.entries.entry(identity.to_string()).or_default();
        if let Some(conn) = entry.idle.pop() {
            entry.acquired += 1;
            return AcquireOutcome::Ready(conn);
        }
        // blacklist gates fresh connects only; idle reuse above is free
        if self.blacklisted(self.entries.get(identity).expect("entry just inserted")) {
            return AcquireOutcome::Blacklisted;
        }
        let entry = self.entries.get_mut(identity).expect("entry just inserted");
        if conn_max == 0 || entry.acquired < conn_max {
            entry.acquired += 1;
            return AcquireOutcome::MustConnect;
        }
        let (tx, rx) = oneshot::channel();
        entry.waiters.push_back(tx);
        AcquireOutcome::Queued(rx)
    }

    /// A `MustConnect` attempt completed.
    pub fn connect_succeeded(&mut self, identity: &str) {
        if let Some(entry) = self.entries.get_mut(identity) {
            entry.error_count = 0;
            entry.error_time = None;
        }
    }

    /// A `MustConnect` attempt failed: undo the reservation and count
    /// the error.
    pub fn connect_failed(&mut self, identity: &str) {
        if let Some(entry) = self.entries.get_mut(identity) {
            entry.acquired = entry.acquired.saturating_sub(1);
            Self::note_error(entry);
        }
    }

    /// Return a connection. `keep` only holds when the socket is clean
    /// and was opened under the current epoch; otherwise it closes.
    /// A kept socket is handed to the oldest live waiter before being
    /// stacked idle.
    pub fn release(&mut self, conn: C, keep: bool) {
        let mut keep = keep && conn.is_clean() && conn.config_epoch() == self.epoch;
        let Some(entry) = self.entries.get_mut(conn.identity()) else {
            // entry vanished in a reconfigure; the socket just closes
            return;
        };
        if keep && entry.pending_close > 0 {
            entry.pending_close -= 1;
            keep = false;
        }
        if !keep {
            entry.acquired = entry.acquired.saturating_sub(1);
            return;
        }
        let mut conn = conn;
        while let Some(tx) = entry.waiters.pop_front() {
            match tx.send(Ok(conn)) {
                // handed over: ownership moved to the waiter, acquired
                // count is unchanged
                Ok(()) => return,
                // waiter timed out and dropped its receiver; try the next
                Err(Ok(back)) => conn = back,
                Err(Err(_)) => unreachable!("only Ok values are handed to waiters"),
            }
        }
        entry.acquired = entry.acquired.saturating_sub(1);
        entry.idle.push(conn);
    }

    /// Drop a connection that failed mid-use: close it and count the
    /// error against its identity.
    pub fn fail(&mut self, conn: C) {
        let identity = conn.identity().to_string();
        drop(conn);
        if let Some(entry) = self.entries.get_mut(&identity) {
            entry.acquired = entry.acquired.saturating_sub(1);
            Self::note_error(entry);
        }
    }

    fn note_error(entry: &mut PoolEntry<C>) {
        entry.error_count += 1;
        entry.error_time = Some(Instant::now());
        if entry.acquired == 0 && entry.idle.is_empty() {
            // nobody left to release a socket: waiting requests would
            // hang until their queue timeout, so fail them now
            while let Some(tx) = entry.waiters.pop_front() {
                let _ = tx.send(Err(WaitersFlushed));
            }
        }
    }

    /// A waiter timed out on this identity: close the next released
    /// socket instead of pooling it, forcing a fresh connect.
    pub fn force_reconnect(&mut self, identity: &str) {
        if let Some(entry) = self.entries.get_mut(identity) {
            entry.pending_close += 1;
        }
    }

    pub fn idle_count(&self, identity: &str) -> usize {
        self.entries.get(identity).map(|e| e.idle.len()).unwrap_or(0)
    }

    pub fn acquired_count(&self, identity: &str) -> u32 {
        self.entries.get(identity).map(|e| e.acquired).unwrap_or(0)
    }

    pub fn waiter_count(&self, identity: &str) -> usize {
        self.entries.get(identity).map(|e| e.waiters.len()).unwrap_or(0)
    }

    pub fn error_count(&self, identity: &str) -> u32 {
        self.entries.get(identity).map(|e| e.error_count).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct FakeConn {
        identity: String,
        epoch: u64,
        clean: bool,
    }

    impl FakeConn {
        fn new(identity: &str, epoch: u64) -> Self {
            Self { identity: identity.into(), epoch, clean: true }
        }
    }

    impl PoolConn for FakeConn {
        fn identity(&self) -> &str {
            &self.identity
        }
        fn config_epoch(&self) -> u64 {
            self.epoch
        }
        fn is_clean(&self) -> bool {
            self.clean
        }
    }

    fn pools(conn_max: u32, max_errors: u32) -> DownstreamPools<FakeConn> {
        DownstreamPools::new(
            PoolTuning {
                conn_max,
                connect_max_errors: max_errors,
                retry_interval: Duration::from_secs(1000),
            },
            1,
        )
    }

    const ID: &str = "a:11211:::ascii";

    #[test]
    fn acquire_empty_pool_asks_for_connect() {
        let mut p = pools(0, 0);
        assert!(matches!(p.acquire(ID), AcquireOutcome::MustConnect));
        assert_eq!(p.acquired_count(ID), 1);
    }

    #[test]
    fn release_then_acquire_reuses_socket() {
        let mut p = pools(0, 0);
        assert!(matches!(p.acquire(ID), AcquireOutcome::MustConnect));
        p.connect_succeeded(ID);
        p.release(FakeConn::new(ID, 1), true);
        assert_eq!(p.acquired_count(ID), 0);
        assert_eq!(p.idle_count(ID), 1);

        match p.acquire(ID) {
            AcquireOutcome::Ready(conn) => assert_eq!(conn.identity, ID),
            _ => panic!("expected idle hit"),
        }
        assert_eq!(p.acquired_count(ID), 1);
        assert_eq!(p.idle_count(ID), 0);
    }

    #[test]
    fn release_without_keep_closes() {
        let mut p = pools(0, 0);
        let _ = p.acquire(ID);
        p.release(FakeConn::new(ID, 1), false);
        assert_eq!(p.acquired_count(ID), 0);
        assert_eq!(p.idle_count(ID), 0);
    }

    #[test]
    fn stale_epoch_is_closed_not_pooled() {
        let mut p = pools(0, 0);
        let _ = p.acquire(ID);
        p.release(FakeConn::new(ID, 0), true);
        assert_eq!(p.idle_count(ID), 0, "epoch 0 socket must not survive epoch 1 pool");
        assert_eq!(p.acquired_count(ID), 0);
    }

    #[test]
    fn dirty_socket_is_closed_not_pooled() {
        let mut p = pools(0, 0);
        let _ = p.acquire(ID);
        let mut conn = FakeConn::new(ID, 1);
        conn.clean = false;
        p.release(conn, true);
        assert_eq!(p.idle_count(ID), 0);
    }

    #[test]
    fn conn_max_queues_and_handoff_keeps_accounting() {
        let mut p = pools(1, 0);
        assert!(matches!(p.acquire(ID), AcquireOutcome::MustConnect));
        let mut rx = match p.acquire(ID) {
            AcquireOutcome::Queued(rx) => rx,
            _ => panic!("expected queue at conn_max=1"),
        };
        assert_eq!(p.waiter_count(ID), 1);

        // releasing hands the socket straight to the waiter
        p.release(FakeConn::new(ID, 1), true);
        assert_eq!(p.waiter_count(ID), 0);
        assert_eq!(p.idle_count(ID), 0, "handed over, not stacked");
        assert_eq!(p.acquired_count(ID), 1, "ownership transferred, count unchanged");
        let conn = rx.try_recv().unwrap().expect("waiter woken").unwrap();
        assert_eq!(conn.identity, ID);
    }

    #[test]
    fn release_skips_dead_waiters() {
        let mut p = pools(1, 0);
        let _ = p.acquire(ID);
        let rx1 = match p.acquire(ID) {
            AcquireOutcome::Queued(rx) => rx,
            _ => panic!(),
        };
        let mut rx2 = match p.acquire(ID) {
            AcquireOutcome::Queued(rx) => rx,
            _ => panic!(),
        };
        drop(rx1); // first waiter timed out

        p.release(FakeConn::new(ID, 1), true);
        assert!(rx2.try_recv().unwrap().is_some(), "second waiter gets the socket");
    }

    #[test]
    fn release_with_no_live_waiters_stacks_idle() {
        let mut p = pools(1, 0);
        let _ = p.acquire(ID);
        let rx = match p.acquire(ID) {
            AcquireOutcome::Queued(rx) => rx,
            _ => panic!(),
        };
        drop(rx);
        p.release(FakeConn::new(ID, 1), true);
        assert_eq!(p.idle_count(ID), 1);
        assert_eq!(p.acquired_count(ID), 0);
    }

    #[test]
    fn connect_failed_undoes_reservation_and_counts() {
        let mut p = pools(0, 3);
        assert!(matches!(p.acquire(ID), AcquireOutcome::MustConnect));
        p.connect_failed(ID);
        assert_eq!(p.acquired_count(ID), 0);
        assert_eq!(p.error_count(ID), 1);
    }

    #[test]
    fn blacklist_after_max_errors() {
        let mut p = pools(0, 3);
        for _ in 0..4 {
            assert!(matches!(p.acquire(ID), AcquireOutcome::MustConnect));
            p.connect_failed(ID);
        }
        // error_count (4) > connect_max_errors (3), inside retry window
        assert!(matches!(p.acquire(ID), AcquireOutcome::Blacklisted));
    }

    #[test]
    fn blacklist_expires_after_retry_interval() {
        let mut p = DownstreamPools::<FakeConn>::new(
            PoolTuning {
                conn_max: 0,
                connect_max_errors: 1,
                retry_interval: Duration::from_millis(0),
            },
            1,
        );
        for _ in 0..2 {
            let _ = p.acquire(ID);
            p.connect_failed(ID);
        }
        // zero retry interval: the window is always over
        assert!(matches!(p.acquire(ID), AcquireOutcome::MustConnect));
    }

    #[test]
    fn blacklist_disabled_when_max_errors_zero() {
        let mut p = pools(0, 0);
        for _ in 0..10 {
            let _ = p.acquire(ID);
            p.connect_failed(ID);
        }
        assert!(matches!(p.acquire(ID), AcquireOutcome::MustConnect));
    }

    #[test]
    fn connect_success_resets_error_counters() {
        let mut p = pools(0, 3);
        for _ in 0..2 {
            let _ = p.acquire(ID);
            p.connect_failed(ID);
        }
        assert_eq!(p.error_count(ID), 2);
        let _ = p.acquire(ID);
        p.connect_succeeded(ID);
        assert_eq!(p.error_count(ID), 0);
    }

    #[test]
    fn last_socket_error_flushes_waiters() {
        let mut p = pools(1, 0);
        let _ = p.acquire(ID);
        let mut rx = match p.acquire(ID) {
            AcquireOutcome::Queued(rx) => rx,
            _ => panic!(),
        };
        // the only acquired socket dies with nothing idle
        p.fail(FakeConn::new(ID, 1));
        assert_eq!(
            rx.try_recv().unwrap().expect("waiter woken"),
            Err(WaitersFlushed),
            "waiters are failed, not left to hang"
        );
    }

    #[test]
    fn error_with_idle_socket_leaves_waiters_queued() {
        let mut p = pools(2, 0);
        let _ = p.acquire(ID);
        let _ = p.acquire(ID);
        p.release(FakeConn::new(ID, 1), true); // one idle now
        let mut waiter_rx = {
            // fill to cap again, then queue one
            let _ = p.acquire(ID); // takes the idle one
            match p.acquire(ID) {
                AcquireOutcome::Queued(rx) => rx,
                _ => panic!("expected queue"),
            }
        };
        p.release(FakeConn::new(ID, 1), true); // idle available again
        // waiter got the released socket instead of a flush
        assert!(matches!(waiter_rx.try_recv(), Ok(Some(Ok(_)))));
    }

    #[test]
    fn force_reconnect_closes_next_release() {
        let mut p = pools(1, 0);
        let _ = p.acquire(ID);
        p.force_reconnect(ID);
        p.release(FakeConn::new(ID, 1), true);
        assert_eq!(p.idle_count(ID), 0, "suspect socket closes instead of pooling");
        assert_eq!(p.acquired_count(ID), 0);

        // the flag is one-shot
        let _ = p.acquire(ID);
        p.release(FakeConn::new(ID, 1), true);
        assert_eq!(p.idle_count(ID), 1);
    }

    #[test]
    fn reset_flushes_everything() {
        let mut p = pools(1, 0);
        let _ = p.acquire(ID);
        let mut rx = match p.acquire(ID) {
            AcquireOutcome::Queued(rx) => rx,
            _ => panic!(),
        };
        p.reset(2);
        assert_eq!(p.epoch(), 2);
        assert_eq!(p.idle_count(ID), 0);
        assert_eq!(p.acquired_count(ID), 0);
        assert_eq!(rx.try_recv().unwrap().unwrap(), Err(WaitersFlushed));
        // releasing a socket from the old epoch after reset is harmless
        p.release(FakeConn::new(ID, 1), true);
        assert_eq!(p.idle_count(ID), 0);
    }
}
