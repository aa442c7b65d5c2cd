//! Tick metrics for wake-latency monitoring.
//!
//! Wake latency is the distance between the target a tick was armed for and
//! the time the alarm actually fired. The ring buffer is allocated once so
//! recording stays allocation-free on the loop thread.

use serde::Serialize;

/// Per-loop tick statistics with a ring buffer of wake latencies.
#[derive(Debug)]
pub struct TickMetrics {
    /// Ring buffer of wake latencies in microseconds.
    samples: Box<[u64]>,
    /// Current write position in the ring buffer.
    write_pos: usize,
    /// Number of samples collected (saturates at buffer size).
    sample_count: usize,
    /// Total ticks delivered to the callback.
    total_ticks: u64,
    min_us: u64,
    max_us: u64,
    sum_us: u64,
    /// Grid slots passed over because an iteration ran long.
    skipped_slots: u64,
    /// Ticks whose latency exceeded `late_threshold_us`.
    late_ticks: u64,
    /// Callback invocations that returned an error.
    callback_failures: u64,
    late_threshold_us: u64,
}

impl TickMetrics {
    /// Create a new collector.
    ///
    /// # Arguments
    ///
    /// * `histogram_size` - Number of latency samples retained.
    /// * `late_threshold_us` - Wake latency above which a tick counts as late.
    #[must_use]
    pub fn new(histogram_size: usize, late_threshold_us: u64) -> Self {
        let size = histogram_size.max(1);
        Self {
            samples: vec![0u64; size].into_boxed_slice(),
            write_pos: 0,
            sample_count: 0,
            total_ticks: 0,
            min_us: u64::MAX,
            max_us: 0,
            sum_us: 0,
            skipped_slots: 0,
            late_ticks: 0,
            callback_failures: 0,
            late_threshold_us,
        }
    }

    /// Record one delivered tick.
    ///
    /// Negative latencies (a platform waking early) are clamped to zero.
    /// Returns `true` when the tick exceeded the late threshold.
    pub fn record_tick(&mut self, latency_us: i64, skipped_slots: u64) -> bool {
        let us = u64::try_from(latency_us).unwrap_or(0);

        self.samples[self.write_pos] = us;
        self.write_pos = (self.write_pos + 1) % self.samples.len();
        self.sample_count = self.sample_count.saturating_add(1).min(self.samples.len());

        self.total_ticks += 1;
        self.min_us = self.min_us.min(us);
        self.max_us = self.max_us.max(us);
        self.sum_us = self.sum_us.wrapping_add(us);
        self.skipped_slots += skipped_slots;

        let late = us > self.late_threshold_us;
        if late {
            self.late_ticks += 1;
        }
        late
    }

    /// Wake latency above which a tick counts as late.
    #[must_use]
    pub fn late_threshold_us(&self) -> u64 {
        self.late_threshold_us
    }

    /// Count a callback that returned an error.
    pub fn record_callback_failure(&mut self) {
        self.callback_failures += 1;
    }

    /// Total ticks delivered.
    #[must_use]
    pub fn total_ticks(&self) -> u64 {
        self.total_ticks
    }

    /// Minimum observed wake latency in microseconds.
    #[must_use]
    pub fn min_us(&self) -> Option<u64> {
        (self.total_ticks > 0).then_some(self.min_us)
    }

    /// Maximum observed wake latency in microseconds.
    #[must_use]
    pub fn max_us(&self) -> Option<u64> {
        (self.total_ticks > 0).then_some(self.max_us)
    }

    /// Mean wake latency in microseconds.
    #[must_use]
    pub fn mean_us(&self) -> Option<u64> {
        (self.total_ticks > 0).then(|| self.sum_us / self.total_ticks)
    }

    /// Total grid slots skipped.
    #[must_use]
    pub fn skipped_slots(&self) -> u64 {
        self.skipped_slots
    }

    /// Number of late ticks.
    #[must_use]
    pub fn late_ticks(&self) -> u64 {
        self.late_ticks
    }

    /// Number of callback failures.
    #[must_use]
    pub fn callback_failures(&self) -> u64 {
        self.callback_failures
    }

    /// Compute a latency percentile from the ring buffer.
    ///
    /// Returns `None` if no samples have been collected or if `percentile`
    /// is outside 0.0..=100.0.
    #[must_use]
    pub fn percentile(&self, percentile: f64) -> Option<u64> {
        if self.sample_count == 0 || !(0.0..=100.0).contains(&percentile) {
            return None;
        }

        let mut sorted: Vec<u64> = self.samples[..self.sample_count].to_vec();
        sorted.sort_unstable();

        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let idx = ((percentile / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        let idx = idx.min(sorted.len() - 1);

        Some(sorted[idx])
    }

    /// Get a snapshot of current metrics.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_ticks: self.total_ticks,
            min_latency_us: self.min_us(),
            max_latency_us: self.max_us(),
            mean_latency_us: self.mean_us(),
            skipped_slots: self.skipped_slots,
            late_ticks: self.late_ticks,
            callback_failures: self.callback_failures,
            p50_latency_us: self.percentile(50.0),
            p99_latency_us: self.percentile(99.0),
            sample_count: self.sample_count,
        }
    }
}

/// Immutable snapshot of metrics for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Total ticks delivered.
    pub total_ticks: u64,
    /// Minimum wake latency in microseconds.
    pub min_latency_us: Option<u64>,
    /// Maximum wake latency in microseconds.
    pub max_latency_us: Option<u64>,
    /// Mean wake latency in microseconds.
    pub mean_latency_us: Option<u64>,
    /// Grid slots skipped.
    pub skipped_slots: u64,
    /// Ticks over the late threshold.
    pub late_ticks: u64,
    /// Callback errors forwarded to the owner.
    pub callback_failures: u64,
    /// Median wake latency over the retained samples.
    pub p50_latency_us: Option<u64>,
    /// 99th percentile wake latency over the retained samples.
    pub p99_latency_us: Option<u64>,
    /// Number of samples in the histogram.
    pub sample_count: usize,
}

impl MetricsSnapshot {
    /// Jitter (max - min latency) in microseconds.
    #[must_use]
    pub fn jitter_us(&self) -> Option<u64> {
        match (self.min_latency_us, self.max_latency_us) {
            (Some(min), Some(max)) => Some(max - min),
            _ => None,
        }
    }
}
