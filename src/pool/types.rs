// Copyright 2020 Joyent, Inc.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use derive_more::Display;
use slog::Logger;

/// The configuration options for a connection pool.
pub struct PoolOptions<D> {
    /// The driver used to establish, validate, and close connections.
    pub driver: Arc<D>,
    /// Close connections after remaining idle for this duration. If not
    /// specified, idle connections are never closed.
    pub idle_timeout: Option<Duration>,
    /// How long `get` will wait for a connection to become available. If
    /// not specified, `get` waits forever.
    pub wait_timeout: Option<Duration>,
    /// Maximum number of connections allowed in the pool (30 by default).
    pub max_conns: Option<i32>,
    /// Maximum number of dial attempts per connection (3 by default).
    pub conn_retries: Option<u32>,
    /// Time interval between dial attempts (10ms by default).
    pub retry_delay: Option<Duration>,
    /// An optional `slog` logger instance. If none is provided the logging
    /// falls back to the [`slog-stdlog`](https://docs.rs/slog-stdlog) drain.
    pub log: Option<Logger>,
}

impl<D> PoolOptions<D> {
    pub fn new(driver: Arc<D>) -> Self {
        PoolOptions {
            driver,
            idle_timeout: None,
            wait_timeout: None,
            max_conns: None,
            conn_retries: None,
            retry_delay: None,
            log: None,
        }
    }
}

impl<D> Clone for PoolOptions<D> {
    fn clone(&self) -> Self {
        PoolOptions {
            driver: Arc::clone(&self.driver),
            idle_timeout: self.idle_timeout,
            wait_timeout: self.wait_timeout,
            max_conns: self.max_conns,
            conn_retries: self.conn_retries,
            retry_delay: self.retry_delay,
            log: self.log.clone(),
        }
    }
}

/// Sum type representing the lifecycle of a connection pool. Transitions
/// are monotonic: active, then closing, then closed.
#[derive(Clone, Copy, Debug, Display, Eq, Ord, PartialEq, PartialOrd)]
pub enum PoolStatus {
    /// The pool is serving acquisition requests.
    #[display(fmt = "active")]
    Active,
    /// The pool is draining its connections and no longer accepts requests.
    #[display(fmt = "closing")]
    Closing,
    /// The pool has drained (or was force closed) and is inert.
    #[display(fmt = "closed")]
    Closed,
}

// Atomic pool status with monotonic transitions enforced by compare-and-set.
#[derive(Debug)]
pub(crate) struct StatusCell(AtomicI32);

impl StatusCell {
    pub(crate) fn new(status: PoolStatus) -> Self {
        StatusCell(AtomicI32::new(status as i32))
    }

    pub(crate) fn get(&self) -> PoolStatus {
        match self.0.load(Ordering::Acquire) {
            0 => PoolStatus::Active,
            1 => PoolStatus::Closing,
            _ => PoolStatus::Closed,
        }
    }

    // Advances the status, refusing to regress. Returns false when the
    // current status already ranks at or above the requested one.
    pub(crate) fn set(&self, status: PoolStatus) -> bool {
        let rank = status as i32;
        loop {
            let current = self.0.load(Ordering::Acquire);
            if current >= rank {
                return false;
            }
            if self
                .0
                .compare_exchange(current, rank, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub(crate) fn is(&self, status: PoolStatus) -> bool {
        self.0.load(Ordering::Acquire) >= status as i32
    }
}

// Connection counter bounded by the pool maximum. Once the count drains to
// zero during shutdown it is parked at the maximum, so a late spawner can
// never revive a pool whose collector has already declared it empty.
#[derive(Debug)]
pub(crate) struct Counter {
    count: AtomicI32,
    max: i32,
}

impl Counter {
    pub(crate) fn new(max: i32) -> Self {
        Counter {
            count: AtomicI32::new(0),
            max,
        }
    }

    pub(crate) fn fetch(&self) -> i32 {
        self.count.load(Ordering::Acquire)
    }

    // True when the count has reached zero; parks the counter at the
    // maximum as a side effect.
    pub(crate) fn zero(&self) -> bool {
        loop {
            let n = self.count.load(Ordering::Acquire);
            if n > 0 {
                return false;
            }
            if self
                .count
                .compare_exchange(n, self.max, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    // Claims a connection slot. Returns false when the maximum is reached.
    pub(crate) fn increment(&self) -> bool {
        loop {
            let n = self.count.load(Ordering::Acquire);
            if n == self.max {
                return false;
            }
            if self
                .count
                .compare_exchange(n, n + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub(crate) fn decrement(&self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

// Messages understood by the pool garbage collector on its control channel.
#[derive(Clone, Copy, Debug)]
pub(crate) enum GcControl {
    // Re-evaluate the drained condition.
    Wakeup,
    // Exit immediately, abandoning pending connections.
    Kill,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_respects_maximum() {
        let c = Counter::new(2);
        assert!(c.increment());
        assert!(c.increment());
        assert!(!c.increment());
        assert_eq!(c.fetch(), 2);
        c.decrement();
        assert_eq!(c.fetch(), 1);
        assert!(c.increment());
    }

    #[test]
    fn drained_counter_parks_at_maximum() {
        let c = Counter::new(3);
        assert!(c.increment());
        assert!(!c.zero());
        c.decrement();
        assert!(c.zero());
        // Parked: no further slot can be claimed.
        assert!(!c.increment());
        assert_eq!(c.fetch(), 3);
    }

    #[test]
    fn status_transitions_are_monotonic() {
        let s = StatusCell::new(PoolStatus::Active);
        assert_eq!(s.get(), PoolStatus::Active);
        assert!(s.set(PoolStatus::Closing));
        assert!(!s.set(PoolStatus::Closing));
        assert!(s.set(PoolStatus::Closed));
        assert!(!s.set(PoolStatus::Closing));
        assert_eq!(s.get(), PoolStatus::Closed);
    }

    #[test]
    fn status_rank_is_inclusive() {
        let s = StatusCell::new(PoolStatus::Active);
        s.set(PoolStatus::Closed);
        assert!(s.is(PoolStatus::Closing));
        assert!(s.is(PoolStatus::Closed));
    }
}
