//! Metrics collection and export module

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Instant;

/// Global metrics registry
pub struct Metrics {
    registry: Registry,

    // Submission counters
    pub submissions_total: IntCounter,
    pub submissions_accepted: IntCounter,
    pub submissions_rejected: IntCounter,
    pub submission_transport_failures: IntCounter,
    pub sequence_mismatch_retries: IntCounter,
    pub resubmissions: IntCounter,
    pub resubmissions_dropped: IntCounter,

    // Nonce-related counters
    pub reconciliations: IntCounterVec,
    pub chain_resets: IntCounter,
    pub stream_confirmations: IntCounter,

    // Stream counters
    pub stream_reconnects: IntCounter,
    pub stream_events: IntCounter,
    pub stream_stale: IntCounter,

    // Session counters
    pub sessions_created: IntCounter,
    pub sessions_evicted: IntCounter,
    pub sessions_rate_limited: IntCounter,

    // Gauges
    pub stream_connections: IntGauge,
    pub active_sessions: IntGauge,

    // Histograms
    pub submit_latency: Histogram,
    pub ledger_latency: Histogram,
}

impl Metrics {
    /// Create new metrics instance
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let submissions_total = IntCounter::with_opts(Opts::new(
            "submissions_total",
            "Total number of submissions started",
        ))?;

        let submissions_accepted = IntCounter::with_opts(Opts::new(
            "submissions_accepted",
            "Number of submissions accepted by the ledger",
        ))?;

        let submissions_rejected = IntCounter::with_opts(Opts::new(
            "submissions_rejected",
            "Number of submissions rejected by the ledger",
        ))?;

        let submission_transport_failures = IntCounter::with_opts(Opts::new(
            "submission_transport_failures",
            "Number of submissions that never reached a ledger verdict",
        ))?;

        let sequence_mismatch_retries = IntCounter::with_opts(Opts::new(
            "sequence_mismatch_retries",
            "Number of resync-and-retry cycles after a sequence mismatch",
        ))?;

        let resubmissions = IntCounter::with_opts(Opts::new(
            "resubmissions",
            "Number of pending transactions resent",
        ))?;

        let resubmissions_dropped = IntCounter::with_opts(Opts::new(
            "resubmissions_dropped",
            "Number of pending transactions abandoned",
        ))?;

        let reconciliations = IntCounterVec::new(
            Opts::new("reconciliations", "Drift reconciliations by resolution"),
            &["resolution"],
        )?;

        let chain_resets = IntCounter::with_opts(Opts::new(
            "chain_resets",
            "Number of chain resets detected during reconciliation",
        ))?;

        let stream_confirmations = IntCounter::with_opts(Opts::new(
            "stream_confirmations",
            "Number of sequences confirmed from the event stream",
        ))?;

        let stream_reconnects = IntCounter::with_opts(Opts::new(
            "stream_reconnects",
            "Number of event stream reconnect attempts",
        ))?;

        let stream_events =
            IntCounter::with_opts(Opts::new("stream_events", "Number of stream events received"))?;

        let stream_stale = IntCounter::with_opts(Opts::new(
            "stream_stale",
            "Number of connections dropped for silence",
        ))?;

        let sessions_created =
            IntCounter::with_opts(Opts::new("sessions_created", "Number of sessions created"))?;

        let sessions_evicted = IntCounter::with_opts(Opts::new(
            "sessions_evicted",
            "Number of sessions evicted for inactivity",
        ))?;

        let sessions_rate_limited = IntCounter::with_opts(Opts::new(
            "sessions_rate_limited",
            "Number of session creations refused by the rate limiter",
        ))?;

        let stream_connections = IntGauge::with_opts(Opts::new(
            "stream_connections",
            "Number of open event stream connections",
        ))?;

        let active_sessions =
            IntGauge::with_opts(Opts::new("active_sessions", "Number of live sessions"))?;

        let submit_latency = Histogram::with_opts(
            HistogramOpts::new("submit_latency_seconds", "End-to-end submission latency")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0]),
        )?;

        let ledger_latency = Histogram::with_opts(
            HistogramOpts::new("ledger_latency_seconds", "Ledger call latency")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;

        // Register all metrics
        registry.register(Box::new(submissions_total.clone()))?;
        registry.register(Box::new(submissions_accepted.clone()))?;
        registry.register(Box::new(submissions_rejected.clone()))?;
        registry.register(Box::new(submission_transport_failures.clone()))?;
        registry.register(Box::new(sequence_mismatch_retries.clone()))?;
        registry.register(Box::new(resubmissions.clone()))?;
        registry.register(Box::new(resubmissions_dropped.clone()))?;
        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(chain_resets.clone()))?;
        registry.register(Box::new(stream_confirmations.clone()))?;
        registry.register(Box::new(stream_reconnects.clone()))?;
        registry.register(Box::new(stream_events.clone()))?;
        registry.register(Box::new(stream_stale.clone()))?;
        registry.register(Box::new(sessions_created.clone()))?;
        registry.register(Box::new(sessions_evicted.clone()))?;
        registry.register(Box::new(sessions_rate_limited.clone()))?;
        registry.register(Box::new(stream_connections.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(submit_latency.clone()))?;
        registry.register(Box::new(ledger_latency.clone()))?;

        Ok(Self {
            registry,
            submissions_total,
            submissions_accepted,
            submissions_rejected,
            submission_transport_failures,
            sequence_mismatch_retries,
            resubmissions,
            resubmissions_dropped,
            reconciliations,
            chain_resets,
            stream_confirmations,
            stream_reconnects,
            stream_events,
            stream_stale,
            sessions_created,
            sessions_evicted,
            sessions_rate_limited,
            stream_connections,
            active_sessions,
            submit_latency,
            ledger_latency,
        })
    }

    /// Get the registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every registered metric in the Prometheus text format
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Global metrics instance
pub fn metrics() -> &'static Metrics {
    static METRICS: once_cell::sync::Lazy<Metrics> =
        once_cell::sync::Lazy::new(|| Metrics::new().expect("Failed to initialize metrics"));
    &METRICS
}

/// Timer helper for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe_duration(&self, histogram: &Histogram) {
        histogram.observe(self.start.elapsed().as_secs_f64());
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
