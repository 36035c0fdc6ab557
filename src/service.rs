// Copyright 2020 Joyent, Inc.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, never, select, tick, Receiver, Sender};
use slog::{info, o, warn, Drain, Logger};

use crate::connection::Conn;
use crate::driver::Driver;
use crate::error::Error;
use crate::host::{Host, ScoreCalculator, HOST_DOWN, SERIES_NUM};
use crate::metrics::Statter;
use crate::pool::types::PoolOptions;
use crate::pool::Pool;
use crate::strategy::{RoundRobin, Strategy};

/// Default number of connections to prespawn when a host is added.
pub const DEFAULT_PRESPAWN_CONNS: u32 = 1;
/// Default number of attempts to get a connection before giving up.
pub const DEFAULT_GET_ATTEMPTS: u32 = 3;
/// Default deadline after which a removed host's pool is force closed.
pub const DEFAULT_CLOSE_DEADLINE: Duration = Duration::from_secs(30);
/// Default time interval taken into account when scores are computed.
pub const DEFAULT_DECAY_DURATION: Duration = Duration::from_secs(60);
/// Default time interval between two successive score computations.
pub const DEFAULT_MEMOIZE_SCORE_DURATION: Duration = Duration::from_millis(100);

/// The configuration options for a service.
pub struct ServiceConfig<D> {
    /// Options applied to every per-host connection pool.
    pub pool: PoolOptions<D>,
    /// Number of connections to prespawn on host additions (1 by default).
    pub prespawn_conns: Option<u32>,
    /// Number of attempts to get a connection from the service before
    /// giving up (3 by default).
    pub get_attempts: Option<u32>,
    /// Deadline after which removed pools are forced closed (30s by
    /// default).
    pub close_deadline: Option<Duration>,
    /// The time interval taken into account when scores are computed (one
    /// minute by default). Scores are calculated using a weighted average
    /// over the course of this duration, recent feedback getting the
    /// highest weight.
    pub decay_duration: Option<Duration>,
    /// Time interval between two successive host score computations; each
    /// score is cached for this duration (100ms by default).
    pub memoize_score_duration: Option<Duration>,
    /// Optional final transform applied to computed scores.
    pub score_calculator: Option<Box<dyn ScoreCalculator>>,
    /// Multi-armed bandit strategy used for host selection (round robin by
    /// default).
    pub strategy: Option<Box<dyn Strategy<D>>>,
    /// Address and port of a statsd server collecting the service metrics
    /// (none by default).
    pub statsd_addr: Option<String>,
    /// Fraction of the time metrics are actually emitted (1.0 by default).
    pub statsd_sample_rate: Option<f32>,
    /// An optional `slog` logger instance, also inherited by the per-host
    /// pools unless they carry their own.
    pub log: Option<Logger>,
}

impl<D> ServiceConfig<D> {
    pub fn new(driver: Arc<D>) -> Self {
        ServiceConfig {
            pool: PoolOptions::new(driver),
            prespawn_conns: None,
            get_attempts: None,
            close_deadline: None,
            decay_duration: None,
            memoize_score_duration: None,
            score_calculator: None,
            strategy: None,
            statsd_addr: None,
            statsd_sample_rate: None,
            log: None,
        }
    }
}

struct ServiceInner<D: Driver> {
    name: String,
    hosts: RwLock<BTreeMap<String, Host<D>>>,
    strategy: Box<dyn Strategy<D>>,
    calculator: Option<Box<dyn ScoreCalculator>>,
    stats: Statter,
    pool_options: PoolOptions<D>,
    prespawn_conns: u32,
    get_attempts: u32,
    close_deadline: Duration,
    decay_duration: Duration,
    memoize_duration: Duration,
    log: Logger,
}

/// A set of hosts, each with its own connection pool, behind a bandit host
/// selection policy.
///
/// The service periodically recomputes host scores and learns about the
/// best alternatives according to its strategy. Hosts are added and removed
/// with [`Service::add`] and [`Service::remove`]; the application calls
/// [`Service::get_conn`] to borrow a connection and hands it back through
/// [`Conn::release`]. [`Service::close`] tears down every host and their
/// pools.
pub struct Service<D: Driver> {
    inner: Arc<ServiceInner<D>>,
    add_tx: Sender<String>,
    remove_tx: Sender<String>,
    stop_tx: Option<Sender<()>>,
    serve_thread: Option<thread::JoinHandle<()>>,
    monitor_thread: Option<thread::JoinHandle<()>>,
}

impl<D: Driver> Service<D> {
    /// Create a new service given a unique name.
    ///
    /// Fails only when a statsd sink is requested and its socket cannot be
    /// set up.
    pub fn new(name: &str, config: ServiceConfig<D>) -> Result<Service<D>, Error> {
        let stats = match &config.statsd_addr {
            Some(addr) => Statter::new(
                addr,
                format!("service.{}", name),
                config.statsd_sample_rate.unwrap_or(1.0),
            )?,
            None => Statter::NOOP,
        };

        let log = config
            .log
            .clone()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("service" => name.to_string()));

        let mut pool_options = config.pool;
        if pool_options.log.is_none() {
            pool_options.log = Some(log.clone());
        }

        let inner = Arc::new(ServiceInner {
            name: name.to_string(),
            hosts: RwLock::new(BTreeMap::new()),
            strategy: config
                .strategy
                .unwrap_or_else(|| Box::new(RoundRobin::new())),
            calculator: config.score_calculator,
            stats: stats.clone(),
            pool_options,
            prespawn_conns: config.prespawn_conns.unwrap_or(DEFAULT_PRESPAWN_CONNS),
            get_attempts: config.get_attempts.unwrap_or(DEFAULT_GET_ATTEMPTS),
            close_deadline: config.close_deadline.unwrap_or(DEFAULT_CLOSE_DEADLINE),
            decay_duration: config.decay_duration.unwrap_or(DEFAULT_DECAY_DURATION),
            memoize_duration: config
                .memoize_score_duration
                .unwrap_or(DEFAULT_MEMOIZE_SCORE_DURATION),
            log,
        });

        let (add_tx, add_rx) = bounded(0);
        let (remove_tx, remove_rx) = bounded(0);
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let serve_inner = Arc::clone(&inner);
        let serve_stop = stop_rx.clone();
        let serve_thread =
            thread::spawn(move || serve(serve_inner, add_rx, remove_rx, serve_stop));

        let monitor_thread = if stats.is_noop() {
            None
        } else {
            stats.gauge("hosts.count", 0);
            stats.gauge("conns.count", 0);
            let monitor_inner = Arc::clone(&inner);
            Some(thread::spawn(move || monitor(monitor_inner, stop_rx)))
        };

        Ok(Service {
            inner,
            add_tx,
            remove_tx,
            stop_tx: Some(stop_tx),
            serve_thread: Some(serve_thread),
            monitor_thread,
        })
    }

    /// The name of the service.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Add a host to the service. The effect of the operation may not be
    /// reflected immediately.
    pub fn add(&self, address: &str) {
        let _ = self.add_tx.send(address.to_string());
    }

    /// Remove a host from the service. The effect of the operation may not
    /// be reflected immediately.
    pub fn remove(&self, address: &str) {
        let _ = self.remove_tx.send(address.to_string());
    }

    /// Borrow a connection from the service, the serving host being chosen
    /// by the bandit strategy in place.
    ///
    /// A host whose pool fails to produce a connection is rated down and
    /// another attempt is made, up to the configured number of attempts.
    pub fn get_conn(&self) -> Result<Conn<D>, Error> {
        let inner = &self.inner;
        let start = Instant::now();
        let mut last_err = Error::NoHostAvailable;

        for _ in 0..inner.get_attempts {
            let selected = {
                let hosts = inner.hosts.read().unwrap();
                if hosts.is_empty() {
                    last_err = Error::NoHostAvailable;
                    continue;
                }
                inner.strategy.select(&hosts).cloned()
            };
            let host = match selected {
                Some(host) => host,
                None => {
                    last_err = Error::NoHostAvailable;
                    continue;
                }
            };

            match host.pool().get() {
                Ok(conn) => {
                    inner
                        .stats
                        .timing("conns.get.delay", start.elapsed().as_millis() as i64);
                    inner.stats.inc("conns.get.count", 1);
                    if inner.strategy.uses_scores() {
                        inner
                            .stats
                            .gauge("hosts.score", (host.score() * 100.0) as i64);
                    }
                    conn.bind(host);
                    return Ok(conn);
                }
                Err(e) => {
                    // Pool closed or timed out: demote the host and move on.
                    inner.stats.inc("conns.get.fails", 1);
                    host.rate(HOST_DOWN);
                    warn!(inner.log, "failed to acquire connection";
                          "address" => host.pool().address().to_string(),
                          "error" => %e);
                    last_err = Error::Service {
                        name: inner.name.clone(),
                        source: Box::new(e),
                    };
                }
            }
        }
        Err(last_err)
    }

    /// Every host address managed by the service along with the number of
    /// connections handled by its pool thus far.
    pub fn status(&self) -> BTreeMap<String, i32> {
        self.inner.status()
    }

    /// Look up a host of the service by address.
    pub fn host(&self, address: &str) -> Option<Host<D>> {
        self.inner.hosts.read().unwrap().get(address).cloned()
    }

    /// Close the service, destroying every host and their respective pool.
    /// After a call to `close` the service can not be used again.
    pub fn close(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            drop(stop);
            if let Some(handle) = self.serve_thread.take() {
                let _ = handle.join();
            }
            if let Some(handle) = self.monitor_thread.take() {
                let _ = handle.join();
            }
        }
    }
}

impl<D: Driver> Drop for Service<D> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<D: Driver> ServiceInner<D> {
    fn status(&self) -> BTreeMap<String, i32> {
        let hosts = self.hosts.read().unwrap();
        hosts
            .iter()
            .map(|(address, host)| (address.clone(), host.pool().active_conns()))
            .collect()
    }

    fn new_host(&self, address: &str) {
        let mut hosts = self.hosts.write().unwrap();
        if hosts.contains_key(address) {
            return;
        }
        let pool = Pool::new(address, self.pool_options.clone());
        pool.set_stats(self.stats.clone());
        let _ = pool.spawn(self.prespawn_conns as usize);
        hosts.insert(
            address.to_string(),
            Host::new(pool, self.stats.clone()),
        );
        info!(self.log, "host added"; "address" => address.to_string());
    }

    fn delete_host(&self, address: &str) {
        let host = self.hosts.write().unwrap().remove(address);
        let Some(host) = host else {
            return;
        };
        info!(self.log, "host removed"; "address" => address.to_string());
        // Drain the pool off the control loop; the deadline bounds how long
        // a slow drain can linger before being forced.
        let deadline = self.close_deadline;
        thread::spawn(move || {
            let _ = host.pool().close();
            thread::sleep(deadline);
            host.pool().force_close();
        });
    }

    fn decay_hosts(&self) {
        for host in self.hosts.read().unwrap().values() {
            host.decay();
        }
    }

    fn memoize_hosts(&self) {
        let calculator = self.calculator.as_deref();
        for host in self.hosts.read().unwrap().values() {
            host.compute_score(calculator);
        }
    }
}

// The service control loop. Host additions and removals, score decay, and
// score memoization are all serialized through this single task. The score
// tickers only run for strategies that consume scores.
fn serve<D: Driver>(
    inner: Arc<ServiceInner<D>>,
    add_rx: Receiver<String>,
    remove_rx: Receiver<String>,
    stop_rx: Receiver<()>,
) {
    let (decay, memoize) = if inner.strategy.uses_scores() {
        (
            tick(inner.decay_duration / SERIES_NUM as u32),
            tick(inner.memoize_duration),
        )
    } else {
        (never(), never())
    };

    loop {
        select! {
            recv(add_rx) -> msg => {
                if let Ok(address) = msg {
                    inner.new_host(&address);
                }
            }
            recv(remove_rx) -> msg => {
                if let Ok(address) = msg {
                    inner.delete_host(&address);
                }
            }
            recv(decay) -> _ => inner.decay_hosts(),
            recv(memoize) -> _ => inner.memoize_hosts(),
            recv(stop_rx) -> _ => {
                // The stop sender was dropped: tear everything down.
                let addresses: Vec<String> =
                    inner.hosts.read().unwrap().keys().cloned().collect();
                for address in addresses {
                    inner.delete_host(&address);
                }
                info!(inner.log, "service closed");
                return;
            }
        }
    }
}

// Publishes the host and connection count gauges once a second while the
// service is running.
fn monitor<D: Driver>(inner: Arc<ServiceInner<D>>, stop_rx: Receiver<()>) {
    let ticker = tick(Duration::from_secs(1));
    loop {
        select! {
            recv(ticker) -> _ => {
                let status = inner.status();
                inner.stats.gauge("hosts.count", status.len() as i64);
                let conns: i64 =
                    status.values().map(|&n| i64::from(n)).sum();
                inner.stats.gauge("conns.count", conns);
            }
            recv(stop_rx) -> _ => return,
        }
    }
}
