//! Windowed throughput reporting for the transport stage.
//!
//! At most one measurement is emitted per refresh interval no matter how
//! often chunks arrive, so fast local transfers don't flood the log.

use std::time::{Duration, Instant};
use tracing::info;

/// Default refresh interval between throughput lines.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Time source, swappable for tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Byte counters owned by the transport stage for one transfer.
#[derive(Debug, Clone, Default)]
pub struct TransferMetrics {
    /// Every byte seen so far.
    pub total_bytes: u64,
    /// Bytes seen in the current report window.
    pub window_bytes: u64,
    /// End of the current report window; `None` until the first chunk.
    pub window_deadline: Option<Instant>,
    /// Measurements emitted so far.
    pub measurements: u64,
}

/// One throughput line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub window_bytes: u64,
    pub megabytes_per_sec: f64,
}

pub struct ThroughputMeter {
    interval: Duration,
    clock: Box<dyn Clock>,
    metrics: TransferMetrics,
}

impl ThroughputMeter {
    pub fn new(interval: Duration) -> Self {
        Self::with_clock(interval, SystemClock)
    }

    pub fn with_clock(interval: Duration, clock: impl Clock + 'static) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            clock: Box::new(clock),
            metrics: TransferMetrics::default(),
        }
    }

    /// Account for one chunk and emit a measurement if the window has elapsed.
    ///
    /// The first chunk opens the window, so the first report covers a full
    /// interval measured from that chunk rather than from stage start.
    pub fn record(&mut self, bytes: u64) -> Option<Measurement> {
        let now = self.clock.now();
        let interval = self.interval;
        let deadline = *self
            .metrics
            .window_deadline
            .get_or_insert_with(|| now + interval);

        self.metrics.window_bytes += bytes;
        self.metrics.total_bytes += bytes;

        if now <= deadline {
            return None;
        }

        let measurement = Measurement {
            window_bytes: self.metrics.window_bytes,
            megabytes_per_sec: self.metrics.window_bytes as f64 / 1e6 / interval.as_secs_f64(),
        };
        self.metrics.window_bytes = 0;
        self.metrics.measurements += 1;

        // Skip windows that passed without any chunk.
        let behind = now - deadline;
        let skipped = (behind.as_nanos() / interval.as_nanos()).min(u32::MAX as u128 - 1) as u32;
        self.metrics.window_deadline = Some(deadline + interval * (skipped + 1));

        info!("{:.02}MB/s", measurement.megabytes_per_sec);
        Some(measurement)
    }

    pub fn metrics(&self) -> &TransferMetrics {
        &self.metrics
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn finish(self) -> TransferMetrics {
        self.metrics
    }
}
