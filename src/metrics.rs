// Copyright 2020 Joyent, Inc.

// Minimal statsd text emitter. Lines are fire-and-forget UDP datagrams of
// the form `prefix.key:value|type[|@rate]`; send failures are ignored.

use std::io;
use std::net::UdpSocket;
use std::sync::Arc;

use rand::Rng;

#[derive(Debug)]
struct StatsdSink {
    socket: UdpSocket,
    prefix: String,
    sample_rate: f32,
}

/// Handle to an optional statsd sink. A `Statter` without a sink swallows
/// every metric, so callers never have to branch on whether metrics are
/// configured.
#[derive(Clone, Debug)]
pub(crate) struct Statter(Option<Arc<StatsdSink>>);

// Borrowable fallback for components whose sink is installed after
// construction.
pub(crate) static NOOP_STATTER: Statter = Statter(None);

impl Statter {
    pub(crate) const NOOP: Statter = Statter(None);

    pub(crate) fn new(
        addr: &str,
        prefix: String,
        sample_rate: f32,
    ) -> io::Result<Statter> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(addr)?;
        Ok(Statter(Some(Arc::new(StatsdSink {
            socket,
            prefix,
            sample_rate: sample_rate.clamp(0.0, 1.0),
        }))))
    }

    pub(crate) fn is_noop(&self) -> bool {
        self.0.is_none()
    }

    pub(crate) fn inc(&self, key: &str, value: i64) {
        self.emit(key, value, "c");
    }

    pub(crate) fn gauge(&self, key: &str, value: i64) {
        self.emit(key, value, "g");
    }

    pub(crate) fn timing(&self, key: &str, millis: i64) {
        self.emit(key, millis, "ms");
    }

    fn emit(&self, key: &str, value: i64, kind: &str) {
        let Some(sink) = &self.0 else {
            return;
        };
        if sink.sample_rate < 1.0 {
            if rand::thread_rng().gen::<f32>() > sink.sample_rate {
                return;
            }
        }
        let line = if sink.sample_rate < 1.0 {
            format!(
                "{}.{}:{}|{}|@{}",
                sink.prefix, key, value, kind, sink.sample_rate
            )
        } else {
            format!("{}.{}:{}|{}", sink.prefix, key, value, kind)
        };
        let _ = sink.socket.send(line.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn receiver() -> (UdpSocket, String) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let addr = socket.local_addr().unwrap().to_string();
        (socket, addr)
    }

    fn recv_line(socket: &UdpSocket) -> String {
        let mut buf = [0u8; 256];
        let n = socket.recv(&mut buf).unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[test]
    fn formats_counter_gauge_and_timing() {
        let (socket, addr) = receiver();
        let stats = Statter::new(&addr, "service.echo".to_string(), 1.0).unwrap();

        stats.inc("conns.get.count", 1);
        assert_eq!(recv_line(&socket), "service.echo.conns.get.count:1|c");

        stats.gauge("hosts.count", 3);
        assert_eq!(recv_line(&socket), "service.echo.hosts.count:3|g");

        stats.timing("conns.get.delay", 12);
        assert_eq!(recv_line(&socket), "service.echo.conns.get.delay:12|ms");
    }

    #[test]
    fn noop_statter_swallows_metrics() {
        let stats = Statter::NOOP;
        assert!(stats.is_noop());
        stats.inc("conns.get.count", 1);
        stats.gauge("hosts.count", 1);
        stats.timing("conns.get.delay", 1);
    }
}
