//! Engine counters and the periodic summary
//!
//! Sources, the dispatcher, the notifier and the delivery worker bump
//! atomic counters from their own tasks; `report()` swaps out the
//! per-interval figures (dispatcher step count and latency) and logs one
//! line. Every atomic is Relaxed: the values are statistics and nothing
//! branches on them, except the debug-mode flag, which only picks a log level.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Upper edge (microseconds) of each dispatcher step latency bucket. A step
/// lands in the first bucket whose edge it does not exceed; anything slower
/// than 51.2 ms goes to the overflow bucket, reported as 102.4 ms.
const STEP_BUCKET_EDGES_US: [u64; NUM_BUCKETS] =
    [100, 200, 400, 800, 1_600, 3_200, 6_400, 12_800, 25_600, 51_200, 102_400];
const NUM_BUCKETS: usize = 11;

#[inline]
fn bucket_index(latency_us: u64) -> usize {
    STEP_BUCKET_EDGES_US[..NUM_BUCKETS - 1].partition_point(|&edge| edge < latency_us)
}

/// Per-interval dispatcher step latency: sum, max and histogram
#[derive(Default)]
struct StepLatency {
    sum_us: AtomicU64,
    max_us: AtomicU64,
    buckets: [AtomicU64; NUM_BUCKETS],
}

/// Latency figures for one reporting interval
#[derive(Debug, Clone, Copy, Default)]
struct LatencyWindow {
    sum_us: u64,
    max_us: u64,
    buckets: [u64; NUM_BUCKETS],
}

impl StepLatency {
    #[inline]
    fn record(&self, latency_us: u64) {
        self.sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.max_us.fetch_max(latency_us, Ordering::Relaxed);
    }

    /// Take the interval's figures, leaving zeros behind
    fn take(&self) -> LatencyWindow {
        LatencyWindow {
            sum_us: self.sum_us.swap(0, Ordering::Relaxed),
            max_us: self.max_us.swap(0, Ordering::Relaxed),
            buckets: std::array::from_fn(|i| self.buckets[i].swap(0, Ordering::Relaxed)),
        }
    }
}

impl LatencyWindow {
    /// Upper edge of the bucket holding the given fraction of steps
    fn percentile(&self, fraction: f64) -> u64 {
        let total: u64 = self.buckets.iter().sum();
        if total == 0 {
            return 0;
        }
        let target = ((total as f64 * fraction).ceil() as u64).max(1);
        let mut seen = 0u64;
        for (count, edge) in self.buckets.iter().zip(STEP_BUCKET_EDGES_US) {
            seen += count;
            if seen >= target {
                return edge;
            }
        }
        STEP_BUCKET_EDGES_US[NUM_BUCKETS - 1]
    }
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Dispatcher steps processed (monotonic)
    steps_total: AtomicU64,
    /// Steps since last report (reset on report)
    steps_since_report: AtomicU64,
    /// Step latency for the current interval (reset on report)
    latency: StepLatency,
    /// Sightings posted by sources (monotonic)
    sightings_received: AtomicU64,
    /// Sightings evicted from a full inbox (monotonic)
    sightings_dropped: AtomicU64,
    /// Sightings refused because the engine was not running (monotonic)
    sightings_rejected: AtomicU64,
    beacons_appeared: AtomicU64,
    beacons_updated: AtomicU64,
    beacons_disappeared: AtomicU64,
    /// Observer notifications dropped because the notifier was full
    notifications_dropped: AtomicU64,
    deliveries_succeeded: AtomicU64,
    delivery_failures: AtomicU64,
    dead_lettered: AtomicU64,
    /// Pending engagement events (gauge)
    queue_depth: AtomicU64,
    /// Detected beacons (gauge)
    detected_beacons: AtomicU64,
    debug_mode: AtomicBool,
    last_report_time: Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            steps_total: AtomicU64::new(0),
            steps_since_report: AtomicU64::new(0),
            latency: StepLatency::default(),
            sightings_received: AtomicU64::new(0),
            sightings_dropped: AtomicU64::new(0),
            sightings_rejected: AtomicU64::new(0),
            beacons_appeared: AtomicU64::new(0),
            beacons_updated: AtomicU64::new(0),
            beacons_disappeared: AtomicU64::new(0),
            notifications_dropped: AtomicU64::new(0),
            deliveries_succeeded: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            detected_beacons: AtomicU64::new(0),
            debug_mode: AtomicBool::new(false),
            last_report_time: Mutex::new(Instant::now()),
        }
    }

    /// Record a dispatcher step with given latency (lock-free)
    #[inline]
    pub fn record_step(&self, latency_us: u64) {
        self.steps_total.fetch_add(1, Ordering::Relaxed);
        self.steps_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency.record(latency_us);
    }

    #[inline]
    pub fn record_sighting_received(&self) {
        self.sightings_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sighting_dropped(&self) {
        self.sightings_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sighting_rejected(&self) {
        self.sightings_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_appeared(&self) {
        self.beacons_appeared.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_updated(&self) {
        self.beacons_updated.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_disappeared(&self, count: u64) {
        self.beacons_disappeared.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_dropped(&self) {
        self.notifications_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_delivery_succeeded(&self) {
        self.deliveries_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_delivery_failed(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_queue_depth(&self, depth: u64) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn set_detected_beacons(&self, count: u64) {
        self.detected_beacons.store(count, Ordering::Relaxed);
    }

    pub fn set_debug_mode(&self, enabled: bool) {
        self.debug_mode.store(enabled, Ordering::Relaxed);
    }

    #[inline]
    pub fn debug_mode(&self) -> bool {
        self.debug_mode.load(Ordering::Relaxed)
    }

    pub fn sightings_dropped(&self) -> u64 {
        self.sightings_dropped.load(Ordering::Relaxed)
    }

    pub fn sightings_rejected(&self) -> u64 {
        self.sightings_rejected.load(Ordering::Relaxed)
    }

    pub fn notifications_dropped(&self) -> u64 {
        self.notifications_dropped.load(Ordering::Relaxed)
    }

    pub fn deliveries_succeeded(&self) -> u64 {
        self.deliveries_succeeded.load(Ordering::Relaxed)
    }

    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::Relaxed)
    }

    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }

    /// Generate a summary report and reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let steps_count = self.steps_since_report.swap(0, Ordering::Relaxed);
        let latency = self.latency.take();

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let steps_per_sec = if elapsed.as_secs_f64() > 0.0 {
            steps_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_latency = if steps_count > 0 { latency.sum_us / steps_count } else { 0 };

        MetricsSummary {
            steps_total: self.steps_total.load(Ordering::Relaxed),
            steps_per_sec,
            avg_step_latency_us: avg_latency,
            max_step_latency_us: latency.max_us,
            lat_p50_us: latency.percentile(0.50),
            lat_p95_us: latency.percentile(0.95),
            lat_p99_us: latency.percentile(0.99),
            lat_buckets: latency.buckets,
            sightings_received: self.sightings_received.load(Ordering::Relaxed),
            sightings_dropped: self.sightings_dropped(),
            sightings_rejected: self.sightings_rejected(),
            beacons_appeared: self.beacons_appeared.load(Ordering::Relaxed),
            beacons_updated: self.beacons_updated.load(Ordering::Relaxed),
            beacons_disappeared: self.beacons_disappeared.load(Ordering::Relaxed),
            notifications_dropped: self.notifications_dropped(),
            deliveries_succeeded: self.deliveries_succeeded(),
            delivery_failures: self.delivery_failures(),
            dead_lettered: self.dead_lettered(),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            detected_beacons: self.detected_beacons.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct MetricsSummary {
    pub steps_total: u64,
    pub steps_per_sec: f64,
    pub avg_step_latency_us: u64,
    pub max_step_latency_us: u64,
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    pub sightings_received: u64,
    pub sightings_dropped: u64,
    pub sightings_rejected: u64,
    pub beacons_appeared: u64,
    pub beacons_updated: u64,
    pub beacons_disappeared: u64,
    pub notifications_dropped: u64,
    pub deliveries_succeeded: u64,
    pub delivery_failures: u64,
    pub dead_lettered: u64,
    pub queue_depth: u64,
    pub detected_beacons: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            steps_total = %self.steps_total,
            steps_per_sec = format!("{:.1}", self.steps_per_sec),
            avg_latency_us = %self.avg_step_latency_us,
            p99_us = %self.lat_p99_us,
            sightings = %self.sightings_received,
            dropped = %self.sightings_dropped,
            rejected = %self.sightings_rejected,
            beacons = %self.detected_beacons,
            delivered = %self.deliveries_succeeded,
            failures = %self.delivery_failures,
            dead_lettered = %self.dead_lettered,
            queue_depth = %self.queue_depth,
            "metrics"
        );
    }
}
