// Copyright 2020 Joyent, Inc.

use std::error;
use std::io;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// The driver contract consumed by a connection pool.
///
/// The `Driver` trait defines how a pool establishes, validates, and tears
/// down the transport connections it manages. A *connection* here need not
/// be a TCP socket; it can be any logical notion of a connection to a remote
/// peer, as long as it can be dialed and closed. Drivers are pure in the
/// sense that they share no state with the pool: the pool hands the payload
/// back to the driver for every operation.
pub trait Driver: Send + Sync + 'static {
    /// The user payload carried by every pooled connection.
    type Conn: Send + Sync + 'static;
    /// The error type returned by `dial` and `test_on_borrow`. This is an
    /// associated type so each driver may choose the error most natural to
    /// its transport while still satisfying the standard library
    /// [`Error`](std::error::Error) trait.
    type Error: error::Error + Send + 'static;

    /// Establish a connection with the remote host at `address`.
    fn dial(&self, address: &str) -> Result<Self::Conn, Self::Error>;

    /// Close the given connection. Called exactly once per connection, from
    /// the pool's garbage collector.
    fn close(&self, conn: &Self::Conn);

    /// Test a connection as it is borrowed from the pool. A non-temporary
    /// failure sends the connection to the garbage collector and the
    /// acquisition transparently retries with another one.
    fn test_on_borrow(&self, conn: &Self::Conn) -> Result<(), Self::Error>;

    /// Classify an error as temporary or fatal for the connection that
    /// produced it. Fatal errors destroy the connection and demote the host.
    fn temporary(&self, err: &Self::Error) -> bool;
}

/// A ready-made driver for plain `TcpStream` connections.
///
/// Temporary classification follows the usual transient I/O conditions:
/// `WouldBlock`, `TimedOut`, and `Interrupted` keep the connection alive,
/// anything else is fatal.
#[derive(Clone, Debug, Default)]
pub struct TcpDriver {
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl TcpDriver {
    pub fn new() -> Self {
        TcpDriver::default()
    }

    /// Bound the time spent establishing a connection.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the per-read timeout on dialed streams.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Set the per-write timeout on dialed streams.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }
}

impl Driver for TcpDriver {
    type Conn = TcpStream;
    type Error = io::Error;

    fn dial(&self, address: &str) -> Result<TcpStream, io::Error> {
        let stream = match self.connect_timeout {
            Some(timeout) => {
                let mut last_err = None;
                let mut connected = None;
                for addr in address.to_socket_addrs()? {
                    match TcpStream::connect_timeout(&addr, timeout) {
                        Ok(s) => {
                            connected = Some(s);
                            break;
                        }
                        Err(e) => last_err = Some(e),
                    }
                }
                match connected {
                    Some(s) => s,
                    None => {
                        return Err(last_err.unwrap_or_else(|| {
                            io::Error::new(
                                io::ErrorKind::AddrNotAvailable,
                                "address did not resolve",
                            )
                        }))
                    }
                }
            }
            None => TcpStream::connect(address)?,
        };
        stream.set_read_timeout(self.read_timeout)?;
        stream.set_write_timeout(self.write_timeout)?;
        Ok(stream)
    }

    fn close(&self, conn: &TcpStream) {
        let _ = conn.shutdown(Shutdown::Both);
    }

    fn test_on_borrow(&self, _conn: &TcpStream) -> Result<(), io::Error> {
        Ok(())
    }

    fn temporary(&self, err: &io::Error) -> bool {
        matches!(
            err.kind(),
            io::ErrorKind::WouldBlock
                | io::ErrorKind::TimedOut
                | io::ErrorKind::Interrupted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_io_errors_are_temporary() {
        let driver = TcpDriver::new();
        for kind in [
            io::ErrorKind::WouldBlock,
            io::ErrorKind::TimedOut,
            io::ErrorKind::Interrupted,
        ] {
            assert!(driver.temporary(&io::Error::new(kind, "transient")));
        }
    }

    #[test]
    fn hard_io_errors_are_fatal() {
        let driver = TcpDriver::new();
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::UnexpectedEof,
        ] {
            assert!(!driver.temporary(&io::Error::new(kind, "fatal")));
        }
    }

    #[test]
    fn dial_refused_when_nothing_listens() {
        let driver = TcpDriver::new().connect_timeout(Duration::from_millis(100));
        assert!(driver.dial("127.0.0.1:1").is_err());
    }
}
