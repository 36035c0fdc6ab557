// Copyright 2020 Joyent, Inc.

//! A multi-host connection pool with bandit host selection
//!
//! Bankshot is a library for managing pools of reusable connections to a
//! set of replicated backend hosts, routing each acquisition to the host
//! most likely to succeed. Connection management requires an implementation
//! of the [`Driver`](driver/trait.Driver.html) trait, which defines how
//! connections to a particular kind of backend are established, validated,
//! and closed.
//!
//! ## Drivers
//!
//! A *connection* is not necessarily a TCP socket. It can be anything that
//! provides some logical notion of a connection to a service, as long as it
//! can be dialed and closed: an authenticated session, an HTTP client, a
//! database handle. The [`Driver`](driver/trait.Driver.html) trait captures
//! that behavior behind four operations (`dial`, `close`, `test_on_borrow`,
//! `temporary`), and the pool layers its lifecycle management on top. A
//! ready-made [`TcpDriver`](driver/struct.TcpDriver.html) covers the common
//! case of plain TCP streams.
//!
//! ## Pools
//!
//! Each host gets a bounded [`Pool`](pool/struct.Pool.html) of live
//! connections with background spawning, idle expiry, borrow-time
//! validation, and graceful or forced teardown. Pools can be used on their
//! own when there is only one backend to talk to.
//!
//! ## Services and strategies
//!
//! A [`Service`](service/struct.Service.html) manages several hosts, every
//! one of them backed by a pool. Callers release each borrowed connection
//! with a score between 0 and 1 describing how well it performed; the
//! service folds those scores into a per-host time series with exponential
//! age weighting and periodically memoizes an aggregate score per host. The
//! configured [`Strategy`](strategy/trait.Strategy.html) then uses those
//! scores to pick the host for each acquisition, trading exploitation of
//! the best-scoring hosts against exploration of the others. Three
//! strategies are provided: round robin, epsilon-greedy, and softmax.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use bankshot::driver::TcpDriver;
//! use bankshot::host::HOST_UP;
//! use bankshot::service::{Service, ServiceConfig};
//! use bankshot::strategy::EpsilonGreedy;
//!
//! let mut config = ServiceConfig::new(Arc::new(TcpDriver::new()));
//! config.strategy = Some(Box::new(EpsilonGreedy::new(0.1)));
//!
//! let service = Service::new("echo", config)?;
//! service.add("127.0.0.1:7357");
//! service.add("127.0.0.1:7358");
//!
//! let conn = service.get_conn()?;
//! // Do stuff with conn.payload() here.
//! conn.release(None, HOST_UP)?;
//! ```

#![allow(missing_docs)]

pub mod connection;
pub mod driver;
pub mod error;
pub mod host;
mod metrics;
pub mod pool;
pub mod service;
pub mod strategy;
