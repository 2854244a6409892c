//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! Reporting swaps the per-interval counters to get a consistent snapshot.
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only. Do NOT use them for access decisions.

use crate::domain::types::CommandType;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
pub const METRICS_NUM_BUCKETS: usize = 11;

/// Connection state values for the Prometheus gauge
pub const MQTT_STATE_DISCONNECTED: u64 = 0;
pub const MQTT_STATE_CONNECTING: u64 = 1;
pub const MQTT_STATE_CONNECTED: u64 = 2;

#[inline]
fn bucket_index(latency_us: u64) -> usize {
    METRICS_BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

fn swap_buckets(buckets: &[AtomicU64; METRICS_NUM_BUCKETS]) -> [u64; METRICS_NUM_BUCKETS] {
    let mut result = [0u64; METRICS_NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; METRICS_NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = ((total as f64 * percentile).ceil() as u64).max(1);
    let mut cumulative = 0u64;

    const BUCKET_UPPER_BOUNDS: [u64; METRICS_NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[METRICS_NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Frames received from the match source (monotonic)
    frames_received: AtomicU64,
    /// Frames dropped because a classification was already in flight (monotonic)
    frames_dropped: AtomicU64,
    /// Frames run through the decision step (monotonic)
    frames_processed: AtomicU64,
    /// Frames processed since last report (reset on report)
    frames_since_report: AtomicU64,
    /// Decision step latency histogram (reset on report)
    step_latency_buckets: [AtomicU64; METRICS_NUM_BUCKETS],
    step_latency_sum_us: AtomicU64,
    step_latency_max_us: AtomicU64,
    unlock_commands: AtomicU64,
    deny_commands: AtomicU64,
    cooldown_commands: AtomicU64,
    /// Stable votes held back by a cooldown window (monotonic)
    cooldown_suppressed: AtomicU64,
    /// Commands dropped because the command queue was full (monotonic)
    commands_dropped: AtomicU64,
    publish_ok: AtomicU64,
    publish_failed: AtomicU64,
    mqtt_reconnects: AtomicU64,
    mqtt_state: AtomicU64,
    malformed_payloads: AtomicU64,
    inbound_dropped: AtomicU64,
    motion_events: AtomicU64,
    stream_wakes: AtomicU64,
    auto_pauses: AtomicU64,
    roster_size: AtomicU64,
    roster_refresh_failures: AtomicU64,
    audit_failures: AtomicU64,
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            frames_received: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            frames_processed: AtomicU64::new(0),
            frames_since_report: AtomicU64::new(0),
            step_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            step_latency_sum_us: AtomicU64::new(0),
            step_latency_max_us: AtomicU64::new(0),
            unlock_commands: AtomicU64::new(0),
            deny_commands: AtomicU64::new(0),
            cooldown_commands: AtomicU64::new(0),
            cooldown_suppressed: AtomicU64::new(0),
            commands_dropped: AtomicU64::new(0),
            publish_ok: AtomicU64::new(0),
            publish_failed: AtomicU64::new(0),
            mqtt_reconnects: AtomicU64::new(0),
            mqtt_state: AtomicU64::new(MQTT_STATE_DISCONNECTED),
            malformed_payloads: AtomicU64::new(0),
            inbound_dropped: AtomicU64::new(0),
            motion_events: AtomicU64::new(0),
            stream_wakes: AtomicU64::new(0),
            auto_pauses: AtomicU64::new(0),
            roster_size: AtomicU64::new(0),
            roster_refresh_failures: AtomicU64::new(0),
            audit_failures: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one decision step and its latency
    #[inline]
    pub fn record_step(&self, latency_us: u64) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        self.frames_since_report.fetch_add(1, Ordering::Relaxed);
        self.step_latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.step_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        update_atomic_max(&self.step_latency_max_us, latency_us);
    }

    pub fn record_command(&self, command_type: CommandType) {
        let counter = match command_type {
            CommandType::Unlock => &self.unlock_commands,
            CommandType::Deny => &self.deny_commands,
            CommandType::Cooldown => &self.cooldown_commands,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cooldown_suppressed(&self) {
        self.cooldown_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command_dropped(&self) {
        self.commands_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish(&self, ok: bool) {
        if ok {
            self.publish_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.publish_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_mqtt_reconnect(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_mqtt_state(&self, state: u64) {
        self.mqtt_state.store(state, Ordering::Relaxed);
    }

    pub fn record_malformed_payload(&self) {
        self.malformed_payloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inbound_dropped(&self) {
        self.inbound_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_motion_event(&self) {
        self.motion_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_wake(&self) {
        self.stream_wakes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auto_pause(&self) {
        self.auto_pauses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_roster_size(&self, size: usize) {
        self.roster_size.store(size as u64, Ordering::Relaxed);
    }

    pub fn record_roster_refresh_failure(&self) {
        self.roster_refresh_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_audit_failure(&self) {
        self.audit_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Generate a report, resetting the per-interval counters
    pub fn report(&self) -> MetricsSummary {
        let now = Instant::now();
        let elapsed_secs = {
            let mut last = self.last_report_time.lock();
            let elapsed = now.duration_since(*last).as_secs_f64();
            *last = now;
            elapsed
        };

        let frames_interval = self.frames_since_report.swap(0, Ordering::Relaxed);
        let step_buckets = swap_buckets(&self.step_latency_buckets);
        let step_sum = self.step_latency_sum_us.swap(0, Ordering::Relaxed);
        let step_max = self.step_latency_max_us.swap(0, Ordering::Relaxed);

        MetricsSummary {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            frames_per_sec: if elapsed_secs > 0.0 { frames_interval as f64 / elapsed_secs } else { 0.0 },
            step_lat_buckets: step_buckets,
            step_lat_avg_us: if frames_interval > 0 { step_sum / frames_interval } else { 0 },
            step_lat_max_us: step_max,
            step_lat_p99_us: percentile_from_buckets(&step_buckets, 0.99),
            unlock_commands: self.unlock_commands.load(Ordering::Relaxed),
            deny_commands: self.deny_commands.load(Ordering::Relaxed),
            cooldown_commands: self.cooldown_commands.load(Ordering::Relaxed),
            cooldown_suppressed: self.cooldown_suppressed.load(Ordering::Relaxed),
            commands_dropped: self.commands_dropped.load(Ordering::Relaxed),
            publish_ok: self.publish_ok.load(Ordering::Relaxed),
            publish_failed: self.publish_failed.load(Ordering::Relaxed),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
            mqtt_state: self.mqtt_state.load(Ordering::Relaxed),
            malformed_payloads: self.malformed_payloads.load(Ordering::Relaxed),
            inbound_dropped: self.inbound_dropped.load(Ordering::Relaxed),
            motion_events: self.motion_events.load(Ordering::Relaxed),
            stream_wakes: self.stream_wakes.load(Ordering::Relaxed),
            auto_pauses: self.auto_pauses.load(Ordering::Relaxed),
            roster_size: self.roster_size.load(Ordering::Relaxed),
            roster_refresh_failures: self.roster_refresh_failures.load(Ordering::Relaxed),
            audit_failures: self.audit_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at report time
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub frames_processed: u64,
    pub frames_per_sec: f64,
    pub step_lat_buckets: [u64; METRICS_NUM_BUCKETS],
    pub step_lat_avg_us: u64,
    pub step_lat_max_us: u64,
    pub step_lat_p99_us: u64,
    pub unlock_commands: u64,
    pub deny_commands: u64,
    pub cooldown_commands: u64,
    pub cooldown_suppressed: u64,
    pub commands_dropped: u64,
    pub publish_ok: u64,
    pub publish_failed: u64,
    pub mqtt_reconnects: u64,
    pub mqtt_state: u64,
    pub malformed_payloads: u64,
    pub inbound_dropped: u64,
    pub motion_events: u64,
    pub stream_wakes: u64,
    pub auto_pauses: u64,
    pub roster_size: u64,
    pub roster_refresh_failures: u64,
    pub audit_failures: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            frames_processed = %self.frames_processed,
            frames_dropped = %self.frames_dropped,
            frames_per_sec = %format!("{:.1}", self.frames_per_sec),
            step_avg_us = %self.step_lat_avg_us,
            step_max_us = %self.step_lat_max_us,
            step_p99_us = %self.step_lat_p99_us,
            unlocks = %self.unlock_commands,
            denies = %self.deny_commands,
            suppressed = %self.cooldown_suppressed,
            publish_failed = %self.publish_failed,
            mqtt_reconnects = %self.mqtt_reconnects,
            roster_size = %self.roster_size,
            "metrics"
        );
    }
}
