// Copyright 2020 Joyent, Inc.

pub mod types;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{
    bounded, Receiver, RecvTimeoutError, Select, Sender, TryRecvError,
};
use slog::{debug, info, o, trace, warn, Drain, Logger};

use crate::connection::Conn;
use crate::driver::Driver;
use crate::error::Error;
use crate::metrics::{Statter, NOOP_STATTER};
use crate::pool::types::{Counter, GcControl, PoolOptions, PoolStatus, StatusCell};

/// Default maximum number of pool connections.
pub const DEFAULT_MAX_CONNS: i32 = 30;
/// Default number of dial attempts per connection.
pub const DEFAULT_CONN_RETRIES: u32 = 3;
/// Default delay between dial attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// A bounded pool of connections to a single host.
///
/// The application calls [`Pool::get`] to borrow a connection and
/// [`Pool::put`] to hand it back. [`Pool::spawn`] allocates connections in
/// the background, and the pool adapts to demand by spawning and collecting
/// connections as needed; `idle_timeout` and `max_conns` tune that behavior.
/// When done with the pool, [`Pool::close`] drains and destroys every
/// connection asynchronously, with [`Pool::force_close`] as the escape hatch
/// for drains that never finish.
///
/// `Pool` is a clonable handle; clones share the same underlying pool.
pub struct Pool<D: Driver> {
    inner: Arc<PoolInner<D>>,
}

impl<D: Driver> Clone for Pool<D> {
    fn clone(&self) -> Self {
        Pool {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PoolInner<D: Driver> {
    driver: Arc<D>,
    address: String,
    idle_timeout: Option<Duration>,
    wait_timeout: Option<Duration>,
    conn_retries: u32,
    retry_delay: Duration,
    counter: Counter,
    status: StatusCell,
    // The sender half of the idle channel. Taking it is how the collector
    // closes the channel: once every transient clone is gone the receivers
    // observe a disconnect and blocked `get` calls fail with `PoolClosed`.
    idle_tx: Mutex<Option<Sender<Conn<D>>>>,
    idle_rx: Receiver<Conn<D>>,
    // Garbage collection channel; `None` is the spawn-failure sentinel.
    gc_tx: Sender<Option<Conn<D>>>,
    control_tx: Sender<GcControl>,
    timer: Mutex<timer::Timer>,
    stats: std::sync::OnceLock<Statter>,
    log: Logger,
}

impl<D: Driver> Pool<D> {
    /// Create a new pool of connections to `address`.
    pub fn new(address: &str, options: PoolOptions<D>) -> Pool<D> {
        let max_conns = options.max_conns.unwrap_or(DEFAULT_MAX_CONNS).max(1);
        let conn_retries = options.conn_retries.unwrap_or(DEFAULT_CONN_RETRIES).max(1);
        let retry_delay = options.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY);

        let log = options
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("pool" => address.to_string()));

        let (idle_tx, idle_rx) = bounded(max_conns as usize);
        let (gc_tx, gc_rx) = bounded(max_conns as usize);
        let (control_tx, control_rx) = bounded(1);

        let inner = Arc::new(PoolInner {
            driver: options.driver,
            address: address.to_string(),
            idle_timeout: options.idle_timeout,
            wait_timeout: options.wait_timeout,
            conn_retries,
            retry_delay,
            counter: Counter::new(max_conns),
            status: StatusCell::new(PoolStatus::Active),
            idle_tx: Mutex::new(Some(idle_tx)),
            idle_rx,
            gc_tx,
            control_tx,
            timer: Mutex::new(timer::Timer::new()),
            stats: std::sync::OnceLock::new(),
            log,
        });

        let collector = Arc::clone(&inner);
        thread::spawn(move || collect(collector, gc_rx, control_rx));

        Pool { inner }
    }

    /// The address of the host this pool connects to.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// The number of connections handled by the pool thus far.
    pub fn active_conns(&self) -> i32 {
        self.inner.counter.fetch()
    }

    /// The current lifecycle status of the pool.
    pub fn status(&self) -> PoolStatus {
        self.inner.status.get()
    }

    pub(crate) fn set_stats(&self, stats: Statter) {
        let _ = self.inner.stats.set(stats);
    }

    /// Attempt to create `n` new connections in the background. Spawners
    /// that find the pool already at capacity give up silently.
    pub fn spawn(&self, n: usize) -> Result<(), Error> {
        if self.inner.status.is(PoolStatus::Closing) {
            return Err(Error::PoolClosed);
        }
        for _ in 0..n {
            let inner = Arc::clone(&self.inner);
            thread::spawn(move || new_conn(&inner));
        }
        Ok(())
    }

    /// Borrow a tested connection from the pool.
    ///
    /// Tries the idle queue optimistically, spawning a replacement and
    /// waiting up to `wait_timeout` on a miss. Connections that lost their
    /// idle-timer race or fail the borrow test fatally are skipped
    /// transparently.
    pub fn get(&self) -> Result<Conn<D>, Error> {
        let inner = &self.inner;
        loop {
            if inner.status.is(PoolStatus::Closing) {
                return Err(Error::PoolClosed);
            }

            let conn = match inner.idle_rx.try_recv() {
                Ok(c) => c,
                Err(TryRecvError::Disconnected) => return Err(Error::PoolClosed),
                Err(TryRecvError::Empty) => {
                    // Connections are running low, spawn a new one and wait.
                    self.spawn(1)?;
                    match inner.wait_timeout {
                        Some(timeout) => match inner.idle_rx.recv_timeout(timeout) {
                            Ok(c) => c,
                            Err(RecvTimeoutError::Timeout) => {
                                return Err(Error::Timeout)
                            }
                            Err(RecvTimeoutError::Disconnected) => {
                                return Err(Error::PoolClosed)
                            }
                        },
                        None => match inner.idle_rx.recv() {
                            Ok(c) => c,
                            Err(_) => return Err(Error::PoolClosed),
                        },
                    }
                }
            };

            if !conn.set_active() {
                // The idle timer expired while the connection sat in the
                // queue; it is already heading to the collector.
                trace!(inner.log, "discarding expired connection");
                continue;
            }

            if let Err(e) = inner.driver.test_on_borrow(conn.payload()) {
                if !inner.driver.temporary(&e) {
                    debug!(inner.log, "connection failed borrow test";
                           "error" => %e);
                    let _ = inner.gc_tx.send(Some(conn));
                    continue;
                }
            }

            return Ok(conn);
        }
    }

    /// Return a connection to the pool.
    ///
    /// `err` is the error state the connection ended its last operation
    /// with, if any. A fatal error (per the driver's classification) sends
    /// the connection to the garbage collector; `Ok(true)` tells the caller
    /// the connection was discarded.
    pub fn put(&self, conn: Conn<D>, err: Option<&D::Error>) -> Result<bool, Error> {
        let inner = &self.inner;
        if inner.status.is(PoolStatus::Closed) {
            return Err(Error::PoolClosed);
        }
        if let Some(e) = err {
            if !inner.driver.temporary(e) {
                inner
                    .gc_tx
                    .send(Some(conn))
                    .map_err(|_| Error::PoolClosed)?;
                return Ok(true);
            }
        }
        conn.set_idle(
            &inner.timer.lock().unwrap(),
            inner.idle_timeout,
            &inner.gc_tx,
        );
        inner.send_inbound(conn)?;
        Ok(false)
    }

    /// Close the pool, destroying all connections.
    ///
    /// The call flips the inbound route to the garbage collector, drains
    /// the idle queue, and returns; the pool reaches [`PoolStatus::Closed`]
    /// asynchronously once every spawned connection has been collected.
    /// A second close returns `PoolClosed`.
    pub fn close(&self) -> Result<(), Error> {
        let inner = &self.inner;
        if !inner.status.set(PoolStatus::Closing) {
            return Err(Error::PoolClosed);
        }
        info!(inner.log, "pool closing");
        // The collector may be asleep with nothing left to collect.
        let _ = inner.control_tx.try_send(GcControl::Wakeup);
        while let Ok(conn) = inner.idle_rx.try_recv() {
            let _ = inner.gc_tx.send(Some(conn));
        }
        Ok(())
    }

    /// Force an in-flight close to terminate immediately, abandoning any
    /// connections still pending collection. Only meaningful once `close`
    /// has begun; returns whether the forced transition happened.
    pub fn force_close(&self) -> bool {
        let inner = &self.inner;
        if !inner.status.is(PoolStatus::Closing) {
            return false;
        }
        if !inner.status.set(PoolStatus::Closed) {
            return false;
        }
        inner.idle_tx.lock().unwrap().take();
        let _ = inner.control_tx.try_send(GcControl::Kill);
        warn!(inner.log, "pool force closed");
        true
    }
}

impl<D: Driver> PoolInner<D> {
    fn stats(&self) -> &Statter {
        self.stats.get().unwrap_or(&NOOP_STATTER)
    }

    // Routes a connection to the current inbound destination: the idle
    // queue while the pool is active, the garbage collector once a close
    // has begun. The status read and the send are not atomic together, but
    // the collector drains the idle queue for the whole closing phase, so a
    // connection that slips into the idle queue after the flip is still
    // collected.
    fn send_inbound(&self, conn: Conn<D>) -> Result<(), Error> {
        if !self.status.is(PoolStatus::Closing) {
            let tx = self.idle_tx.lock().unwrap().clone();
            if let Some(tx) = tx {
                return tx.send(conn).map_err(|_| Error::PoolClosed);
            }
        }
        self.gc_tx.send(Some(conn)).map_err(|_| Error::PoolClosed)
    }

    // Closes one collected entry. Connections can reach the collector twice
    // when an idle-timer expiry races a close drain, so already-closed
    // entries are dropped without touching the counter; the first pass
    // accounted for them.
    fn collect_entry(&self, entry: Option<Conn<D>>) {
        match entry {
            Some(conn) => {
                if !conn.is_closed() {
                    conn.set_closed();
                    self.driver.close(conn.payload());
                    self.counter.decrement();
                }
            }
            None => self.counter.decrement(),
        }
    }
}

// Dials one connection, retrying with a fixed delay, and parks it in the
// pool. A spawner that cannot claim a connection slot gives up immediately;
// one that exhausts its dial attempts pushes the failure sentinel so the
// collector releases the slot.
fn new_conn<D: Driver>(inner: &Arc<PoolInner<D>>) {
    if !inner.counter.increment() {
        return;
    }
    for _ in 0..inner.conn_retries {
        match inner.driver.dial(&inner.address) {
            Ok(payload) => {
                let conn = Conn::new(payload);
                conn.set_idle(
                    &inner.timer.lock().unwrap(),
                    inner.idle_timeout,
                    &inner.gc_tx,
                );
                let _ = inner.send_inbound(conn);
                return;
            }
            Err(e) => {
                debug!(inner.log, "dial failed"; "error" => %e);
            }
        }
        thread::sleep(inner.retry_delay);
    }
    warn!(inner.log, "connection failed after retries");
    inner.stats().inc("conns.fails", 1);
    let _ = inner.gc_tx.send(None);
}

// The pool garbage collector: a dedicated single consumer that closes
// expired, failed, and discarded connections, and finalizes the pool once a
// close has drained every connection.
fn collect<D: Driver>(
    inner: Arc<PoolInner<D>>,
    gc_rx: Receiver<Option<Conn<D>>>,
    control_rx: Receiver<GcControl>,
) {
    loop {
        if inner.status.is(PoolStatus::Closed) {
            // Force closed: pending connections are abandoned by contract.
            trace!(inner.log, "collector killed");
            return;
        }
        if inner.status.is(PoolStatus::Closing) {
            // Collect stragglers that raced the inbound flip.
            while let Ok(conn) = inner.idle_rx.try_recv() {
                inner.collect_entry(Some(conn));
            }
            if inner.counter.zero() {
                inner.status.set(PoolStatus::Closed);
                inner.idle_tx.lock().unwrap().take();
                debug!(inner.log, "pool drained");
                return;
            }
        }

        let mut sel = Select::new();
        let op_control = sel.recv(&control_rx);
        let op_gc = sel.recv(&gc_rx);
        let op_idle = if inner.status.is(PoolStatus::Closing) {
            Some(sel.recv(&inner.idle_rx))
        } else {
            None
        };

        let oper = sel.select();
        let index = oper.index();
        if index == op_control {
            match oper.recv(&control_rx) {
                Ok(GcControl::Wakeup) => continue,
                Ok(GcControl::Kill) | Err(_) => return,
            }
        } else if index == op_gc {
            match oper.recv(&gc_rx) {
                Ok(entry) => inner.collect_entry(entry),
                Err(_) => return,
            }
        } else {
            debug_assert_eq!(Some(index), op_idle);
            if let Ok(conn) = oper.recv(&inner.idle_rx) {
                inner.collect_entry(Some(conn));
            }
        }
    }
}
