// Copyright 2020 Joyent, Inc.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;

use crate::driver::Driver;
use crate::error::Error;
use crate::host::Host;

// Idle-timer states. The timer callback and the borrower race to move the
// connection out of `ARMED`; whoever wins the compare-and-swap owns it.
const IDLE_DISARMED: u8 = 0;
const IDLE_ARMED: u8 = 1;
const IDLE_EXPIRED: u8 = 2;

struct ConnInner<D: Driver> {
    payload: D::Conn,
    closed: AtomicBool,
    idle: AtomicU8,
    timer_guard: Mutex<Option<timer::Guard>>,
    // Back-link to the owning host, set only while the connection is
    // checked out to a caller.
    host: Mutex<Option<Host<D>>>,
    checked_out_at: Mutex<Option<Instant>>,
}

/// A pooled connection wrapping a driver payload.
///
/// `Conn` is a cheaply clonable handle; clones refer to the same underlying
/// connection. A connection obtained from a service carries a link to the
/// host that served it and must be handed back through [`Conn::release`]
/// with a verdict on how well it performed.
pub struct Conn<D: Driver> {
    inner: Arc<ConnInner<D>>,
}

impl<D: Driver> Clone for Conn<D> {
    fn clone(&self) -> Self {
        Conn {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Driver> std::fmt::Debug for Conn<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn").finish_non_exhaustive()
    }
}

impl<D: Driver> Conn<D> {
    pub(crate) fn new(payload: D::Conn) -> Self {
        Conn {
            inner: Arc::new(ConnInner {
                payload,
                closed: AtomicBool::new(false),
                idle: AtomicU8::new(IDLE_DISARMED),
                timer_guard: Mutex::new(None),
                host: Mutex::new(None),
                checked_out_at: Mutex::new(None),
            }),
        }
    }

    /// Access the underlying driver payload.
    pub fn payload(&self) -> &D::Conn {
        &self.inner.payload
    }

    /// The address of the host bound to the connection, if it is currently
    /// checked out.
    pub fn address(&self) -> Option<String> {
        self.inner
            .host
            .lock()
            .unwrap()
            .as_ref()
            .map(|h| h.pool().address().to_string())
    }

    /// Release the connection back to the service it was acquired from.
    ///
    /// `err` is the error state of the operation the connection was used
    /// for, if any, and `score` is a value in [0, 1] describing how well the
    /// connection performed (e.g. inverse response time, up/down). If the
    /// error is fatal according to the driver, the score is overridden with
    /// host-down.
    pub fn release(self, err: Option<&D::Error>, score: f64) -> Result<(), Error> {
        if !(0.0..=1.0).contains(&score) {
            return Err(Error::InvalidArg);
        }
        let host = self.inner.host.lock().unwrap().take();
        match host {
            Some(h) => h.release_conn(self, err, score),
            None => Err(Error::NoHostAvailable),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    // Marks the connection closed, disarming any pending idle timer. The
    // closed flag is monotonic.
    pub(crate) fn set_closed(&self) {
        let _ = self.inner.idle.compare_exchange(
            IDLE_ARMED,
            IDLE_DISARMED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.inner.timer_guard.lock().unwrap().take();
        self.inner.closed.store(true, Ordering::Release);
    }

    // Arms the idle timer before the connection is parked in the pool. On
    // expiry the connection is pushed to the garbage collector; only the
    // callback that wins the ARMED -> EXPIRED swap gets to send it.
    pub(crate) fn set_idle(
        &self,
        timer: &timer::Timer,
        idle_timeout: Option<Duration>,
        gc: &Sender<Option<Conn<D>>>,
    ) {
        let Some(timeout) = idle_timeout else {
            return;
        };
        self.inner.idle.store(IDLE_ARMED, Ordering::Release);
        let conn = self.clone();
        let gc = gc.clone();
        let guard = timer.schedule_with_delay(
            chrono::Duration::milliseconds(timeout.as_millis() as i64),
            move || {
                let won = conn
                    .inner
                    .idle
                    .compare_exchange(
                        IDLE_ARMED,
                        IDLE_EXPIRED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok();
                if won {
                    let _ = gc.send(Some(conn.clone()));
                }
            },
        );
        *self.inner.timer_guard.lock().unwrap() = Some(guard);
    }

    // Disarms the idle timer on checkout. Returns false if the timer
    // expired first, in which case the connection is already on its way to
    // the garbage collector and the caller must pick another one.
    pub(crate) fn set_active(&self) -> bool {
        match self.inner.idle.compare_exchange(
            IDLE_ARMED,
            IDLE_DISARMED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.inner.timer_guard.lock().unwrap().take();
                true
            }
            Err(state) => state != IDLE_EXPIRED,
        }
    }

    // Binds the back-link on checkout and records the acquisition time.
    pub(crate) fn bind(&self, host: Host<D>) {
        *self.inner.checked_out_at.lock().unwrap() = Some(Instant::now());
        *self.inner.host.lock().unwrap() = Some(host);
    }

    pub(crate) fn checkout_elapsed(&self) -> Option<Duration> {
        self.inner
            .checked_out_at
            .lock()
            .unwrap()
            .map(|t| t.elapsed())
    }
}
