use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AdvancePolicy, SupervisorConfig};
use crate::events::LifecycleBus;
use crate::process::{CommandLauncher, WorkerLauncher};

use super::supervisor::Supervisor;

/// Builder for constructing a [`Supervisor`] with explicit dependencies.
///
/// # Example
///
/// ```ignore
/// use herd::*;
///
/// let supervisor = SupervisorBuilder::new(config)
///     .with_launcher(Arc::new(launcher))
///     .with_workers(4)
///     .build()?;
/// ```
pub struct SupervisorBuilder<L>
where
    L: WorkerLauncher + 'static,
{
    config: SupervisorConfig,
    launcher: Option<Arc<L>>,
    bus: Option<Arc<LifecycleBus>>,
}

impl<L> fmt::Debug for SupervisorBuilder<L>
where
    L: WorkerLauncher + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("SupervisorBuilder");
        debug.field("config", &self.config);
        debug.field("launcher_set", &self.launcher.is_some());
        debug.field("bus_set", &self.bus.is_some());

        if self.launcher.is_some() {
            debug.field("launcher_type", &type_name::<L>());
        }

        debug.finish()
    }
}

impl<L> SupervisorBuilder<L>
where
    L: WorkerLauncher + 'static,
{
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            launcher: None,
            bus: None,
        }
    }

    /// Set the worker launcher.
    pub fn with_launcher(mut self, launcher: Arc<L>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Publish lifecycle events on a shared bus.
    pub fn with_bus(mut self, bus: Arc<LifecycleBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.config = self.config.with_grace_period(grace);
        self
    }

    pub fn with_capacity_check_interval(mut self, interval: Duration) -> Self {
        self.config = self.config.with_capacity_check_interval(interval);
        self
    }

    pub fn with_advance_policy(mut self, policy: AdvancePolicy) -> Self {
        self.config.advance_policy = policy;
        self
    }

    /// Build the supervisor.
    ///
    /// # Errors
    ///
    /// Returns an error if no launcher was provided or the capacity check
    /// interval is zero.
    pub fn build(self) -> anyhow::Result<Supervisor<L>> {
        let launcher = self
            .launcher
            .ok_or_else(|| anyhow::anyhow!("launcher dependency missing"))?;
        if self.config.capacity_check_interval_ms == 0 {
            anyhow::bail!("capacity check interval must be greater than zero");
        }
        let bus = self.bus.unwrap_or_default();

        Ok(Supervisor::with_bus(self.config, launcher, bus))
    }
}

impl SupervisorBuilder<CommandLauncher> {
    /// Build a supervisor that runs the configured worker command.
    ///
    /// The configuration is validated in full, and a launcher set with
    /// [`with_launcher`](Self::with_launcher) takes precedence.
    pub fn build_command(mut self) -> anyhow::Result<Supervisor<CommandLauncher>> {
        self.config.validate()?;
        if self.launcher.is_none() {
            self.launcher = Some(Arc::new(CommandLauncher::from_config(&self.config)?));
        }
        self.build()
    }
}
