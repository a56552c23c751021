//! Prometheus metrics instrumentation for herd.
//!
//! All metrics are compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `herd_spawns_total` - Worker processes launched
//! - `herd_spawn_failures_total` - Worker launches that failed
//! - `herd_drains_total` - Graceful stops sent
//! - `herd_forced_kills_total` - Draining workers killed after the grace period
//! - `herd_rolling_restarts_total` - Rolling restarts requested
//!
//! ## Gauges
//! - `herd_workers` - Current workers by phase
#![cfg(feature = "metrics")]

use prometheus::{Counter, GaugeVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for herd metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static SPAWNS_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::with_opts(Opts::new("herd_spawns_total", "Worker processes launched"))
        .expect("herd_spawns_total metric creation failed")
});

pub static SPAWN_FAILURES_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::with_opts(Opts::new(
        "herd_spawn_failures_total",
        "Worker launches that failed",
    ))
    .expect("herd_spawn_failures_total metric creation failed")
});

pub static DRAINS_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::with_opts(Opts::new("herd_drains_total", "Graceful stops sent to workers"))
        .expect("herd_drains_total metric creation failed")
});

pub static FORCED_KILLS_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::with_opts(Opts::new(
        "herd_forced_kills_total",
        "Draining workers killed after the grace period",
    ))
    .expect("herd_forced_kills_total metric creation failed")
});

pub static ROLLING_RESTARTS_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::with_opts(Opts::new(
        "herd_rolling_restarts_total",
        "Rolling restarts requested",
    ))
    .expect("herd_rolling_restarts_total metric creation failed")
});

/// Gauge for current workers.
///
/// Labels:
/// - `phase`: starting, ready or draining
pub static WORKERS: LazyLock<GaugeVec> = LazyLock::new(|| {
    GaugeVec::new(Opts::new("herd_workers", "Current workers by phase"), &["phase"])
        .expect("herd_workers metric creation failed")
});

/// Register all metrics with the global registry.
///
/// Idempotent; repeated registration is ignored.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(SPAWNS_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(SPAWN_FAILURES_TOTAL.clone()),
        Box::new(DRAINS_TOTAL.clone()),
        Box::new(FORCED_KILLS_TOTAL.clone()),
        Box::new(ROLLING_RESTARTS_TOTAL.clone()),
        Box::new(WORKERS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_spawn() {
    SPAWNS_TOTAL.inc();
}

pub fn record_spawn_failure() {
    SPAWN_FAILURES_TOTAL.inc();
}

pub fn record_drain() {
    DRAINS_TOTAL.inc();
}

pub fn record_forced_kill() {
    FORCED_KILLS_TOTAL.inc();
}

pub fn record_rolling_restart() {
    ROLLING_RESTARTS_TOTAL.inc();
}

/// Helper to update the worker gauge for one phase.
pub fn set_workers(phase: &str, count: f64) {
    WORKERS.with_label_values(&[phase]).set(count);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
