//! Time sources for the write monitor and the device watch loop.
//!
//! Both are injected so that tests can run the progress estimator and the
//! refresh cadence without waiting on the wall clock.
use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A clock that only moves when slept on or advanced explicitly.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += duration;
    }

    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Drives a periodic loop. `tick` blocks until the next period and returns
/// `false` once the loop should end.
pub trait Ticker: Send {
    fn tick(&mut self) -> bool;
}

/// Ticks on a fixed wall-clock interval until its [`TickerStop`] is
/// triggered or dropped.
pub struct IntervalTicker {
    period: Duration,
    stop: Receiver<()>,
}

/// Stops the paired [`IntervalTicker`] when dropped.
pub struct TickerStop {
    _tx: Sender<()>,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> (Self, TickerStop) {
        let (tx, rx) = mpsc::channel();
        (Self { period, stop: rx }, TickerStop { _tx: tx })
    }
}

impl Ticker for IntervalTicker {
    fn tick(&mut self) -> bool {
        matches!(self.stop.recv_timeout(self.period), Err(RecvTimeoutError::Timeout))
    }
}

/// Ticks once per message received; ends when the sender side is dropped.
pub struct ChannelTicker(Receiver<()>);

impl ChannelTicker {
    pub fn new() -> (Self, Sender<()>) {
        let (tx, rx) = mpsc::channel();
        (Self(rx), tx)
    }
}

impl Ticker for ChannelTicker {
    fn tick(&mut self) -> bool {
        self.0.recv().is_ok()
    }
}
