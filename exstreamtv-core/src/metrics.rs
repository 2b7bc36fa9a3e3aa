//! Prometheus metrics for the streaming runtime.
//!
//! All metrics are registered in a crate-local registry and exposed via the
//! boundary's `/metrics` endpoint in text exposition format.

use prometheus::{
    register_counter_with_registry, register_gauge_with_registry,
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_vec_with_registry, register_int_gauge_with_registry, Counter, Encoder,
    Gauge, Histogram, HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

/// Global metrics registry
pub static REGISTRY: std::sync::LazyLock<Registry> = std::sync::LazyLock::new(Registry::new);

/// Process pool metrics
pub mod pool {
    use super::{
        register_gauge_with_registry, register_int_counter_vec_with_registry,
        register_int_gauge_with_registry, Gauge, IntCounterVec, IntGauge, Opts, REGISTRY,
    };

    /// Live transcoder processes.
    pub static POOL_LIVE: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "exstreamtv_pool_live",
            "Number of live transcoder processes",
            REGISTRY.clone()
        )
        .expect("Failed to register POOL_LIVE")
    });

    /// Denied spawn attempts, labeled by guard reason.
    pub static SPAWN_DENIED_TOTAL: std::sync::LazyLock<IntCounterVec> =
        std::sync::LazyLock::new(|| {
            register_int_counter_vec_with_registry!(
                Opts::new(
                    "exstreamtv_pool_spawn_denied_total",
                    "Transcoder spawns denied by pool guards"
                ),
                &["reason"],
                REGISTRY.clone()
            )
            .expect("Failed to register SPAWN_DENIED_TOTAL")
        });

    /// Live processes over capacity, 0.0..1.0.
    pub static POOL_UTILIZATION: std::sync::LazyLock<Gauge> = std::sync::LazyLock::new(|| {
        register_gauge_with_registry!(
            "exstreamtv_pool_utilization",
            "Pool utilization ratio (live / capacity)",
            REGISTRY.clone()
        )
        .expect("Failed to register POOL_UTILIZATION")
    });

    /// Leases revoked by the long-run guard.
    pub static LONG_RUN_REVOKED_TOTAL: std::sync::LazyLock<IntCounterVec> =
        std::sync::LazyLock::new(|| {
            register_int_counter_vec_with_registry!(
                Opts::new(
                    "exstreamtv_pool_long_run_revoked_total",
                    "Leases revoked after exceeding the long-run limit"
                ),
                &["channel"],
                REGISTRY.clone()
            )
            .expect("Failed to register LONG_RUN_REVOKED_TOTAL")
        });
}

/// Restart governor and circuit breaker metrics
pub mod restart {
    use super::{
        register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry,
        IntCounterVec, IntGaugeVec, Opts, REGISTRY,
    };

    /// Restart requests, labeled by decision.
    pub static RESTART_REQUESTS_TOTAL: std::sync::LazyLock<IntCounterVec> =
        std::sync::LazyLock::new(|| {
            register_int_counter_vec_with_registry!(
                Opts::new(
                    "exstreamtv_restart_requests_total",
                    "Restart requests by governor decision"
                ),
                &["decision"],
                REGISTRY.clone()
            )
            .expect("Failed to register RESTART_REQUESTS_TOTAL")
        });

    /// Circuit breaker state per channel (0=closed, 1=open, 2=half-open).
    pub static CIRCUIT_BREAKER_STATE: std::sync::LazyLock<IntGaugeVec> =
        std::sync::LazyLock::new(|| {
            register_int_gauge_vec_with_registry!(
                Opts::new(
                    "exstreamtv_circuit_breaker_state",
                    "Circuit breaker state (0=closed, 1=open, 2=half_open)"
                ),
                &["channel"],
                REGISTRY.clone()
            )
            .expect("Failed to register CIRCUIT_BREAKER_STATE")
        });
}

/// Channel and session metrics
pub mod channel {
    use super::{
        register_counter_with_registry, register_int_counter_vec_with_registry,
        register_int_gauge_with_registry, Counter, IntCounterVec, IntGauge, Opts, REGISTRY,
    };

    /// Bytes fanned out to subscribers, per channel.
    pub static BYTES_OUT_TOTAL: std::sync::LazyLock<IntCounterVec> =
        std::sync::LazyLock::new(|| {
            register_int_counter_vec_with_registry!(
                Opts::new(
                    "exstreamtv_channel_bytes_out_total",
                    "Bytes delivered to subscribers per channel"
                ),
                &["channel"],
                REGISTRY.clone()
            )
            .expect("Failed to register BYTES_OUT_TOTAL")
        });

    /// Open client sessions across all channels.
    pub static SESSION_OPEN: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "exstreamtv_session_open",
            "Currently open client sessions",
            REGISTRY.clone()
        )
        .expect("Failed to register SESSION_OPEN")
    });

    /// Rejected session opens, labeled by reason.
    pub static SESSIONS_REJECTED_TOTAL: std::sync::LazyLock<IntCounterVec> =
        std::sync::LazyLock::new(|| {
            register_int_counter_vec_with_registry!(
                Opts::new(
                    "exstreamtv_sessions_rejected_total",
                    "Session opens rejected by the session manager"
                ),
                &["reason"],
                REGISTRY.clone()
            )
            .expect("Failed to register SESSIONS_REJECTED_TOTAL")
        });

    /// Subscribers dropped for falling behind the fan-out hub.
    pub static SLOW_SUBSCRIBERS_DROPPED_TOTAL: std::sync::LazyLock<IntCounterVec> =
        std::sync::LazyLock::new(|| {
            register_int_counter_vec_with_registry!(
                Opts::new(
                    "exstreamtv_slow_subscribers_dropped_total",
                    "Subscribers dropped after exceeding their lag budget"
                ),
                &["channel"],
                REGISTRY.clone()
            )
            .expect("Failed to register SLOW_SUBSCRIBERS_DROPPED_TOTAL")
        });

    /// Accumulated throttler wait time in seconds.
    pub static THROTTLER_WAIT_SECONDS_SUM: std::sync::LazyLock<Counter> =
        std::sync::LazyLock::new(|| {
            register_counter_with_registry!(
                "exstreamtv_throttler_wait_seconds_sum",
                "Total seconds spent waiting for throttler credit",
                REGISTRY.clone()
            )
            .expect("Failed to register THROTTLER_WAIT_SECONDS_SUM")
        });
}

/// EPG generation metrics
pub mod epg {
    use super::{
        register_histogram_with_registry, register_int_counter_vec_with_registry, Histogram,
        HistogramOpts, IntCounterVec, Opts, REGISTRY,
    };

    /// XMLTV document generation latency.
    pub static EPG_GENERATION_SECONDS: std::sync::LazyLock<Histogram> =
        std::sync::LazyLock::new(|| {
            register_histogram_with_registry!(
                HistogramOpts::new(
                    "exstreamtv_epg_generation_seconds",
                    "XMLTV generation duration in seconds"
                )
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
                REGISTRY.clone()
            )
            .expect("Failed to register EPG_GENERATION_SECONDS")
        });

    /// Programmes suppressed by XMLTV validation, labeled by violation.
    pub static EPG_VALIDATION_ERRORS_TOTAL: std::sync::LazyLock<IntCounterVec> =
        std::sync::LazyLock::new(|| {
            register_int_counter_vec_with_registry!(
                Opts::new(
                    "exstreamtv_epg_validation_errors_total",
                    "Programmes suppressed from XMLTV output by validation"
                ),
                &["violation"],
                REGISTRY.clone()
            )
            .expect("Failed to register EPG_VALIDATION_ERRORS_TOTAL")
        });

    /// Schedule gaps omitted from the guide (padding_mode = none).
    pub static EPG_GAP_OMITTED_TOTAL: std::sync::LazyLock<IntCounterVec> =
        std::sync::LazyLock::new(|| {
            register_int_counter_vec_with_registry!(
                Opts::new(
                    "exstreamtv_epg_gap_omitted_total",
                    "Dead-air gaps omitted from the programme guide"
                ),
                &["channel"],
                REGISTRY.clone()
            )
            .expect("Failed to register EPG_GAP_OMITTED_TOTAL")
        });
}

/// Expose metrics in Prometheus format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {}
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::from("# Failed to encode metrics\n");
        }
    }
    String::from_utf8(buffer).unwrap_or_else(|e| {
        tracing::error!("Metrics buffer contains invalid UTF-8: {}", e);
        String::from("# Invalid UTF-8 in metrics\n")
    })
}
