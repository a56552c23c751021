//! Tracing and telemetry instrumentation for herd.
//!
//! Helper functions for creating tracing spans and recording worker
//! lifecycle metrics. Every function works with and without the `metrics`
//! feature; without it only the log line is emitted.
//!
//! # Example
//!
//! ```ignore
//! use herd::telemetry::{drain_span, record_worker_draining};
//!
//! let span = drain_span(id, pid);
//! let _enter = span.enter();
//! record_worker_draining(id, pid);
//! ```

use std::future::Future;

use tracing::{info_span, Instrument, Span};
use uuid::Uuid;

use crate::process::ExitReason;
use crate::runtime::worker::{WorkerId, WorkerPhase};

/// Create a tracing span around a worker launch.
#[must_use]
pub fn spawn_span(id: WorkerId) -> Span {
    info_span!("herd.spawn", worker_id = %id)
}

/// Create a tracing span around a drain or forced termination.
#[must_use]
pub fn drain_span(id: WorkerId, pid: Option<u32>) -> Span {
    info_span!("herd.drain", worker_id = %id, pid = ?pid)
}

/// Create a tracing span covering one rolling restart step.
///
/// The restart id correlates every log line of a rolling restart.
#[must_use]
pub fn restart_span(restart_id: Option<Uuid>) -> Span {
    match restart_id {
        Some(id) => info_span!("herd.restart", restart_id = %id),
        None => info_span!("herd.restart", restart_id = tracing::field::Empty),
    }
}

/// Instrument a future with a spawn span.
pub fn instrument_spawn<F>(id: WorkerId, future: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(spawn_span(id))
}

/// Record a successful worker launch.
pub fn record_worker_spawned(id: WorkerId, pid: Option<u32>) {
    tracing::info!(worker_id = %id, pid = ?pid, "worker spawned");

    #[cfg(feature = "metrics")]
    crate::metrics::record_spawn();
}

/// Record a failed worker launch.
pub fn record_spawn_failed(error: &str) {
    tracing::error!(error = %error, "worker spawn failed");

    #[cfg(feature = "metrics")]
    crate::metrics::record_spawn_failure();
}

/// Record a worker becoming ready.
pub fn record_worker_ready(id: WorkerId) {
    tracing::info!(worker_id = %id, "worker ready");
}

/// Record a graceful stop being sent.
pub fn record_worker_draining(id: WorkerId, pid: Option<u32>) {
    tracing::info!(worker_id = %id, pid = ?pid, "draining worker");

    #[cfg(feature = "metrics")]
    crate::metrics::record_drain();
}

/// Record a draining worker being killed after its grace period.
pub fn record_worker_force_killed(id: WorkerId, pid: Option<u32>) {
    tracing::warn!(worker_id = %id, pid = ?pid, "grace period expired, killing worker");

    #[cfg(feature = "metrics")]
    crate::metrics::record_forced_kill();
}

/// Record a worker process terminating.
pub fn record_worker_exited(id: WorkerId, last_phase: WorkerPhase, reason: ExitReason) {
    if last_phase == WorkerPhase::Draining || reason.is_success() {
        tracing::info!(worker_id = %id, %last_phase, %reason, "worker exited");
    } else {
        tracing::warn!(worker_id = %id, %last_phase, %reason, "worker exited unexpectedly");
    }
}

/// Record a rolling restart being requested.
pub fn record_rolling_restart(queued: usize) {
    tracing::info!(queued, "restarting all workers");

    #[cfg(feature = "metrics")]
    crate::metrics::record_rolling_restart();
}

/// Update the per-phase worker gauges.
pub fn set_worker_counts(starting: usize, ready: usize, draining: usize) {
    tracing::debug!(starting, ready, draining, "worker counts updated");

    #[cfg(feature = "metrics")]
    {
        crate::metrics::set_workers(WorkerPhase::Starting.as_str(), starting as f64);
        crate::metrics::set_workers(WorkerPhase::Ready.as_str(), ready as f64);
        crate::metrics::set_workers(WorkerPhase::Draining.as_str(), draining as f64);
    }
}
