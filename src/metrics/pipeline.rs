//! Prometheus instruments for the order pipeline.

use std::time::Duration;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::error::Result;

/// Pipeline metrics registered into an owned registry.
#[derive(Clone)]
pub struct PipelineMetrics {
    registry: Registry,
    admissions: IntCounterVec,
    fulfillments: IntCounterVec,
    dead_letters: IntCounter,
    cache_lookups: IntCounterVec,
    refresh_dropped: IntCounter,
    lock_contention: IntCounter,
    pending_entries: IntGauge,
    fulfillment_seconds: Histogram,
}

impl std::fmt::Debug for PipelineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineMetrics").finish_non_exhaustive()
    }
}

impl PipelineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let admissions = IntCounterVec::new(
            Opts::new("flashsale_admissions_total", "Admission decisions by result"),
            &["result"],
        )?;
        let fulfillments = IntCounterVec::new(
            Opts::new(
                "flashsale_fulfillments_total",
                "Fulfillment attempts by outcome",
            ),
            &["outcome"],
        )?;
        let dead_letters = IntCounter::new(
            "flashsale_dead_letters_total",
            "Entries moved to the dead-letter stream",
        )?;
        let cache_lookups = IntCounterVec::new(
            Opts::new("flashsale_cache_lookups_total", "Cache lookups by result"),
            &["strategy", "result"],
        )?;
        let refresh_dropped = IntCounter::new(
            "flashsale_cache_refresh_dropped_total",
            "Logical-expiry refreshes dropped on a full queue",
        )?;
        let lock_contention = IntCounter::new(
            "flashsale_lock_acquire_failures_total",
            "Lock acquisitions that timed out",
        )?;
        let pending_entries = IntGauge::new(
            "flashsale_pending_entries",
            "Delivered but unacknowledged queue entries",
        )?;
        let fulfillment_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "flashsale_fulfillment_duration_seconds",
                "Time to fulfill one intent",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;

        registry.register(Box::new(admissions.clone()))?;
        registry.register(Box::new(fulfillments.clone()))?;
        registry.register(Box::new(dead_letters.clone()))?;
        registry.register(Box::new(cache_lookups.clone()))?;
        registry.register(Box::new(refresh_dropped.clone()))?;
        registry.register(Box::new(lock_contention.clone()))?;
        registry.register(Box::new(pending_entries.clone()))?;
        registry.register(Box::new(fulfillment_seconds.clone()))?;

        Ok(Self {
            registry,
            admissions,
            fulfillments,
            dead_letters,
            cache_lookups,
            refresh_dropped,
            lock_contention,
            pending_entries,
            fulfillment_seconds,
        })
    }

    pub fn record_admission(&self, result: &str) {
        self.admissions.with_label_values(&[result]).inc();
    }

    pub fn record_fulfillment(&self, outcome: &str, elapsed: Duration) {
        self.fulfillments.with_label_values(&[outcome]).inc();
        self.fulfillment_seconds.observe(elapsed.as_secs_f64());
    }

    pub fn record_dead_letter(&self) {
        self.dead_letters.inc();
    }

    pub fn record_cache_lookup(&self, strategy: &str, result: &str) {
        self.cache_lookups
            .with_label_values(&[strategy, result])
            .inc();
    }

    pub fn record_refresh_dropped(&self) {
        self.refresh_dropped.inc();
    }

    pub fn record_lock_contention(&self) {
        self.lock_contention.inc();
    }

    pub fn set_pending(&self, count: usize) {
        self.pending_entries.set(count as i64);
    }

    pub fn admissions(&self, result: &str) -> u64 {
        self.admissions.with_label_values(&[result]).get()
    }

    pub fn fulfillments(&self, outcome: &str) -> u64 {
        self.fulfillments.with_label_values(&[outcome]).get()
    }

    pub fn dead_letters(&self) -> u64 {
        self.dead_letters.get()
    }

    pub fn cache_lookups(&self, strategy: &str, result: &str) -> u64 {
        self.cache_lookups
            .with_label_values(&[strategy, result])
            .get()
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
