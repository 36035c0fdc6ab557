// Copyright 2020 Joyent, Inc.

#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bankshot::driver::{Driver, TcpDriver};

pub const ECHO1: &str = "localhost:7357";
pub const ECHO2: &str = "localhost:7358";
pub const ECHO3: &str = "localhost:7359";

/// A TCP echo server bound to a fixed address, torn down on drop.
pub struct EchoServer {
    address: String,
    quit: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl EchoServer {
    pub fn start(address: &str) -> EchoServer {
        let listener = TcpListener::bind(address).expect("bind echo server");
        let quit = Arc::new(AtomicBool::new(false));
        let quit_flag = Arc::clone(&quit);
        let handle = thread::spawn(move || {
            for stream in listener.incoming() {
                if quit_flag.load(Ordering::Acquire) {
                    break;
                }
                let Ok(stream) = stream else { break };
                thread::spawn(move || {
                    let mut reader = stream.try_clone().expect("clone stream");
                    let mut writer = stream;
                    let _ = io::copy(&mut reader, &mut writer);
                });
            }
        });
        EchoServer {
            address: address.to_string(),
            quit,
            handle: Some(handle),
        }
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.quit.store(true, Ordering::Release);
        // Kick the accept loop so it notices the flag.
        let _ = TcpStream::connect(&self.address);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Writes a ping and expects it echoed back.
pub fn ping(stream: &TcpStream) -> io::Result<()> {
    let mut writer = stream;
    writer.write_all(b"ping")?;
    let mut reader = stream;
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    if &buf != b"ping" {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad pong"));
    }
    Ok(())
}

/// A TCP driver that pings the connection on every borrow.
#[derive(Debug, Default)]
pub struct EchoDriver {
    inner: TcpDriver,
}

impl EchoDriver {
    pub fn new() -> Self {
        EchoDriver {
            inner: TcpDriver::new().connect_timeout(Duration::from_secs(2)),
        }
    }
}

impl Driver for EchoDriver {
    type Conn = TcpStream;
    type Error = io::Error;

    fn dial(&self, address: &str) -> io::Result<TcpStream> {
        self.inner.dial(address)
    }

    fn close(&self, conn: &TcpStream) {
        self.inner.close(conn);
    }

    fn test_on_borrow(&self, conn: &TcpStream) -> io::Result<()> {
        ping(conn)
    }

    fn temporary(&self, err: &io::Error) -> bool {
        self.inner.temporary(err)
    }
}

/// An in-memory driver handing out numbered connections, with switchable
/// failure modes for dialing and borrow testing.
#[derive(Debug, Default)]
pub struct FakeDriver {
    dials: AtomicU64,
    fail_dial: bool,
    fail_borrow: bool,
    dial_limit: Option<u64>,
}

impl FakeDriver {
    pub fn new() -> Self {
        FakeDriver::default()
    }

    /// Every dial attempt fails outright.
    pub fn failing_dial() -> Self {
        FakeDriver {
            fail_dial: true,
            ..FakeDriver::default()
        }
    }

    /// Borrow tests always fail fatally; dialing succeeds `dial_limit`
    /// times and then starts failing.
    pub fn failing_borrow(dial_limit: u64) -> Self {
        FakeDriver {
            fail_borrow: true,
            dial_limit: Some(dial_limit),
            ..FakeDriver::default()
        }
    }
}

impl Driver for FakeDriver {
    type Conn = u64;
    type Error = io::Error;

    fn dial(&self, _address: &str) -> io::Result<u64> {
        let n = self.dials.fetch_add(1, Ordering::SeqCst);
        if self.fail_dial {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "dial refused",
            ));
        }
        if let Some(limit) = self.dial_limit {
            if n >= limit {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "dial limit reached",
                ));
            }
        }
        Ok(n)
    }

    fn close(&self, _conn: &u64) {}

    fn test_on_borrow(&self, _conn: &u64) -> io::Result<()> {
        if self.fail_borrow {
            return Err(io::Error::new(io::ErrorKind::Other, "borrow failed"));
        }
        Ok(())
    }

    fn temporary(&self, err: &io::Error) -> bool {
        err.kind() == io::ErrorKind::WouldBlock
    }
}

/// A transient error according to `FakeDriver::temporary`.
pub fn temporary_error() -> io::Error {
    io::Error::new(io::ErrorKind::WouldBlock, "transient hiccup")
}

/// A fatal error according to `FakeDriver::temporary`.
pub fn fatal_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "connection reset")
}
