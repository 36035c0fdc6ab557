// Copyright 2020 Joyent, Inc.

use thiserror::Error as ThisError;

/// The error type returned by every fallible operation in the crate.
///
/// Driver errors never appear here directly: a fatal driver error destroys
/// the connection and demotes the owning host, while a temporary one is
/// tolerated. What callers observe from the pool and service layers is one
/// of the variants below.
#[derive(Debug, ThisError)]
pub enum Error {
    /// An argument was out of range, e.g. a release score outside [0, 1].
    #[error("invalid argument")]
    InvalidArg,
    /// The pool has been closed and can no longer serve requests.
    #[error("pool is closed")]
    PoolClosed,
    /// A connection could not be acquired within the configured wait timeout.
    #[error("operation timed out")]
    Timeout,
    /// The service has no host registered, or exhausted its acquisition
    /// attempts without finding a usable one.
    #[error("no host available")]
    NoHostAvailable,
    /// An I/O failure while setting up service infrastructure, such as the
    /// metrics socket.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A pool error annotated with the name of the service it surfaced from.
    #[error("{name}: {source}")]
    Service {
        name: String,
        #[source]
        source: Box<Error>,
    },
}
