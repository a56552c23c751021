//! Test doubles for the herd supervisor.
//!
//! [`MockLauncher`] stands in for real worker processes so supervisor
//! behaviour can be driven step by step from tests and benchmarks.

mod mock;

pub use mock::{MockLauncher, MockProcess, MOCK_PID_BASE};

use herd::{Supervisor, SupervisorConfig, WorkerCommand};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for `workers` mock workers with the given grace period.
pub fn mock_config(workers: usize, grace: Duration) -> SupervisorConfig {
    SupervisorConfig::new(WorkerCommand::new("mock-worker"))
        .with_workers(workers)
        .with_grace_period(grace)
}

/// Supervisor over a shared mock launcher.
pub fn mock_supervisor(
    config: SupervisorConfig,
    launcher: &MockLauncher,
) -> Supervisor<MockLauncher> {
    Supervisor::new(config, Arc::new(launcher.clone()))
}
