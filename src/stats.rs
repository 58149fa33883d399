//! Throughput observability and rate-limited warnings
//!
//! The pipeline tolerates overflow and correspondence failures; they are
//! counted and reported at a bounded rate instead of being logged per event,
//! so sustained overload cannot flood the log.
//!
//! # Main Types
//!
//! - [`RateCounter`] - Moving event-rate and bandwidth counter for
//!   ingress/egress observability
//! - [`WarnLimiter`] - Counter that fires once every N occurrences

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Moving event-rate counter with byte accounting
///
/// Call [`RateCounter::count`] once per event with the event's byte size;
/// once per report interval it returns a [`RateReport`] with the rate in Hz
/// and the bandwidth in kB/s since the previous report.
#[derive(Debug)]
pub struct RateCounter {
    inner: Mutex<RateWindow>,
    report_interval: Duration,
}

#[derive(Debug)]
struct RateWindow {
    window_start: Instant,
    events: u64,
    bytes: u64,
}

/// Rate snapshot produced once per report interval
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateReport {
    /// Events per second over the window
    pub rate_hz: f64,
    /// Kilobytes per second over the window
    pub bandwidth_kbps: f64,
}

impl RateCounter {
    /// Create a counter reporting once per `report_interval`
    pub fn new(report_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(RateWindow {
                window_start: Instant::now(),
                events: 0,
                bytes: 0,
            }),
            report_interval,
        }
    }

    /// Record one event of `bytes` size; returns a report when the current
    /// window has elapsed
    pub fn count(&self, bytes: usize) -> Option<RateReport> {
        let mut window = self.inner.lock().expect("rate counter lock poisoned");
        window.events += 1;
        window.bytes += bytes as u64;

        let elapsed = window.window_start.elapsed();
        if elapsed < self.report_interval {
            return None;
        }

        let secs = elapsed.as_secs_f64();
        let report = RateReport {
            rate_hz: window.events as f64 / secs,
            bandwidth_kbps: window.bytes as f64 / secs / 1024.0,
        };
        window.window_start = Instant::now();
        window.events = 0;
        window.bytes = 0;
        Some(report)
    }
}

impl Default for RateCounter {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// Occurrence counter that fires once every `report_every` increments
///
/// Used for recoverable conditions (queue overflow, correspondence failure)
/// where a warning per event would flood the log under sustained overload.
#[derive(Debug)]
pub struct WarnLimiter {
    pending: AtomicU64,
    total: AtomicU64,
    report_every: u64,
}

impl WarnLimiter {
    /// Create a limiter that fires every `report_every` occurrences
    pub fn new(report_every: u64) -> Self {
        Self {
            pending: AtomicU64::new(0),
            total: AtomicU64::new(0),
            report_every: report_every.max(1),
        }
    }

    /// Record one occurrence; returns `Some(report_every)` when the caller
    /// should emit a warning covering that many occurrences
    pub fn tick(&self) -> Option<u64> {
        self.total.fetch_add(1, Ordering::Relaxed);
        let pending = self.pending.fetch_add(1, Ordering::Relaxed) + 1;
        if pending >= self.report_every {
            self.pending.store(0, Ordering::Relaxed);
            Some(self.report_every)
        } else {
            None
        }
    }

    /// Total occurrences recorded since creation or the last reset
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Reset both the pending and total counts
    pub fn reset(&self) {
        self.pending.store(0, Ordering::Relaxed);
        self.total.store(0, Ordering::Relaxed);
    }
}
