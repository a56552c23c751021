use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use crate::config::{SupervisorConfig, DEFAULT_CAPACITY_CHECK_INTERVAL_MS};
use crate::error::{HerdError, Result};
use crate::events::{
    event_channel, EventReceiver, EventSender, LifecycleBus, LifecycleEvent, LifecyclePayload,
    SupervisorEvent,
};
use crate::process::{ExitReason, WorkerLauncher};
use crate::telemetry;

use super::drain::{DrainController, DrainOutcome, ExpireOutcome};
use super::sequencer::{Advance, RestartSequencer};
use super::spawner::{SpawnReport, Spawner};
use super::worker::{WorkerId, WorkerPhase, WorkerSet};

/// Cloneable control surface of a running [`Supervisor`].
///
/// Requests are enqueued on the supervisor's event queue and handled in
/// arrival order on the supervisor loop.
#[derive(Clone)]
pub struct SupervisorHandle {
    events: EventSender,
    bus: Arc<LifecycleBus>,
}

impl fmt::Debug for SupervisorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisorHandle")
            .field("closed", &self.events.is_closed())
            .field("bus", &self.bus)
            .finish()
    }
}

impl SupervisorHandle {
    /// Request a rolling restart of every worker.
    pub fn reload(&self) -> Result<()> {
        self.send(SupervisorEvent::Reload)
    }

    /// Request a shutdown: drain every worker and stop spawning.
    pub fn shutdown(&self) -> Result<()> {
        self.send(SupervisorEvent::Shutdown)
    }

    /// Request an immediate capacity check.
    pub fn check_capacity(&self) -> Result<()> {
        self.send(SupervisorEvent::CapacityCheck)
    }

    /// Enqueue an arbitrary supervisor event.
    pub fn send(&self, event: SupervisorEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| HerdError::ChannelClosed)
    }

    /// Subscribe to lifecycle events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.bus.subscribe()
    }
}

/// Keeps a fixed number of worker processes alive and replaces them
/// without a capacity gap.
///
/// All supervisor state lives in this value and is only touched by the
/// task driving [`run`](Self::run). Signal listeners, worker watchers and
/// grace timers talk to it exclusively through the event queue.
pub struct Supervisor<L>
where
    L: WorkerLauncher + 'static,
{
    config: SupervisorConfig,
    launcher: Arc<L>,
    workers: WorkerSet,
    spawner: Spawner,
    drains: DrainController,
    sequencer: RestartSequencer,
    stopping: bool,
    capacity_interval: Duration,
    events_tx: EventSender,
    events_rx: EventReceiver,
    bus: Arc<LifecycleBus>,
}

impl<L> fmt::Debug for Supervisor<L>
where
    L: WorkerLauncher + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("launcher_type", &type_name::<L>())
            .field("target", &self.spawner.target())
            .field("workers", &self.workers.len())
            .field("sequencer", &self.sequencer.state())
            .field("stopping", &self.stopping)
            .finish()
    }
}

impl<L> Supervisor<L>
where
    L: WorkerLauncher + 'static,
{
    /// Create a supervisor with a fresh event queue and lifecycle bus.
    pub fn new(config: SupervisorConfig, launcher: Arc<L>) -> Self {
        Self::with_bus(config, launcher, Arc::new(LifecycleBus::default()))
    }

    /// Create a supervisor publishing on an existing lifecycle bus.
    pub fn with_bus(config: SupervisorConfig, launcher: Arc<L>, bus: Arc<LifecycleBus>) -> Self {
        let (events_tx, events_rx) = event_channel();
        let capacity_interval = match config.capacity_check_interval() {
            interval if interval.is_zero() => {
                tracing::warn!(
                    "capacity check interval is zero, using {DEFAULT_CAPACITY_CHECK_INTERVAL_MS} ms"
                );
                Duration::from_millis(DEFAULT_CAPACITY_CHECK_INTERVAL_MS)
            }
            interval => interval,
        };
        Self {
            spawner: Spawner::new(config.workers),
            drains: DrainController::new(config.grace_period()),
            sequencer: RestartSequencer::new(config.advance_policy),
            config,
            launcher,
            workers: WorkerSet::new(),
            stopping: false,
            capacity_interval,
            events_tx,
            events_rx,
            bus,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Period of the capacity check run alongside [`run`](Self::run).
    pub fn capacity_check_interval(&self) -> Duration {
        self.capacity_interval
    }

    pub fn launcher(&self) -> Arc<L> {
        Arc::clone(&self.launcher)
    }

    pub fn workers(&self) -> &WorkerSet {
        &self.workers
    }

    pub fn sequencer(&self) -> &RestartSequencer {
        &self.sequencer
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// True once shutdown was requested and every worker has exited.
    pub fn is_finished(&self) -> bool {
        self.stopping && self.workers.is_empty()
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            events: self.events_tx.clone(),
            bus: Arc::clone(&self.bus),
        }
    }

    /// Subscribe to lifecycle events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.bus.subscribe()
    }

    /// Bring the worker set up to its target size.
    ///
    /// Fails only when workers were wanted and none could be started.
    pub async fn start(&mut self) -> Result<()> {
        let report = self.ensure_capacity().await;
        let target = self.spawner.target();

        if let Some(err) = report.failure {
            if target > 0 && self.workers.count() == 0 {
                return Err(HerdError::NoCapacity {
                    target,
                    reason: err.to_string(),
                });
            }
        }

        let pid = std::process::id();
        let workers = self.workers.count();
        tracing::info!(pid, workers, target, "supervisor {pid} booted");
        self.publish(LifecyclePayload::Booted { pid, workers });
        self.report_counts();
        Ok(())
    }

    /// Process events until shutdown completes.
    ///
    /// Runs the periodic capacity check alongside. Without a shutdown
    /// request this never returns.
    pub async fn run(&mut self) -> Result<()> {
        let ticker = self.spawn_capacity_ticker();

        let result = loop {
            if self.is_finished() {
                tracing::info!("all workers exited, supervisor stopping");
                break Ok(());
            }

            match self.events_rx.recv().await {
                Some(event) => self.handle_event(event).await,
                None => break Err(HerdError::ChannelClosed),
            }
        };

        ticker.abort();
        result
    }

    /// Wait for the next event and handle it.
    pub async fn step(&mut self) -> Result<SupervisorEvent> {
        let event = self
            .events_rx
            .recv()
            .await
            .ok_or(HerdError::ChannelClosed)?;
        self.handle_event(event.clone()).await;
        Ok(event)
    }

    /// Handle every event already queued, including those enqueued while
    /// handling. Returns the number of events handled.
    pub async fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event).await;
            handled += 1;
        }
        handled
    }

    /// Route one event to the component that owns it.
    pub async fn handle_event(&mut self, event: SupervisorEvent) {
        tracing::trace!(?event, "supervisor event");

        match event {
            SupervisorEvent::Reload => self.on_reload(),
            SupervisorEvent::Shutdown => self.on_shutdown(),
            SupervisorEvent::WorkerReady(id) => self.on_ready(id),
            SupervisorEvent::WorkerExited { id, reason } => self.on_exit(id, reason).await,
            SupervisorEvent::GraceExpired(id) => self.on_grace_expired(id),
            SupervisorEvent::CapacityCheck => {
                self.ensure_capacity().await;
            }
        }

        self.report_counts();
    }

    fn on_reload(&mut self) {
        if self.stopping {
            tracing::debug!("reload ignored during shutdown");
            return;
        }

        let (restart_id, queued, step) =
            self.sequencer
                .begin(&mut self.workers, &self.drains, &self.events_tx);
        let _span = telemetry::restart_span(Some(restart_id)).entered();

        telemetry::record_rolling_restart(queued.len());
        self.publish(LifecyclePayload::RollingRestartStarted { queued });
        self.apply_advance(step, Some(restart_id));
    }

    fn on_shutdown(&mut self) {
        if self.stopping {
            tracing::debug!("shutdown already in progress");
            return;
        }

        self.stopping = true;
        self.sequencer.cancel();

        let ids = self.workers.ids();
        tracing::info!(workers = ids.len(), "stopping all workers");
        self.publish(LifecyclePayload::ShutdownStarted {
            draining: ids.len(),
        });

        for id in ids {
            if let DrainOutcome::Started { pid } =
                self.drains.drain(&mut self.workers, id, &self.events_tx)
            {
                telemetry::record_worker_draining(id, pid);
                self.publish(LifecyclePayload::Draining { id, pid });
            }
        }
    }

    fn on_ready(&mut self, id: WorkerId) {
        if !self.workers.mark_ready(id) {
            tracing::debug!(worker_id = %id, "readiness ignored");
            return;
        }

        let restart_id = self.sequencer.restart_id();
        let _span = telemetry::restart_span(restart_id).entered();

        telemetry::record_worker_ready(id);
        self.publish(LifecyclePayload::Ready { id });

        let step = self
            .sequencer
            .on_ready(id, &mut self.workers, &self.drains, &self.events_tx);
        self.apply_advance(step, restart_id);
    }

    async fn on_exit(&mut self, id: WorkerId, reason: ExitReason) {
        let Some(last_phase) = self.workers.get(id).map(|w| w.phase()) else {
            tracing::debug!(worker_id = %id, "exit of unknown worker ignored");
            return;
        };
        drop(self.workers.remove_exited(id));
        self.sequencer.on_exit(id);

        telemetry::record_worker_exited(id, last_phase, reason);
        self.publish(LifecyclePayload::Exited {
            id,
            last_phase,
            reason,
        });

        self.ensure_capacity().await;
    }

    fn on_grace_expired(&mut self, id: WorkerId) {
        match self.drains.expire(&mut self.workers, id) {
            ExpireOutcome::Killed { pid } => {
                telemetry::record_worker_force_killed(id, pid);
                self.publish(LifecyclePayload::ForceKilled { id, pid });
            }
            ExpireOutcome::Skipped | ExpireOutcome::NotFound => {
                tracing::debug!(worker_id = %id, "stale grace expiry ignored");
            }
        }
    }

    async fn ensure_capacity(&mut self) -> SpawnReport {
        let report = self
            .spawner
            .ensure_capacity(
                &mut self.workers,
                self.launcher.as_ref(),
                &self.events_tx,
                self.stopping,
            )
            .await;
        self.sequencer.on_spawned(&report.spawned);

        for &id in &report.spawned {
            let pid = self.workers.get(id).and_then(|w| w.pid());
            telemetry::record_worker_spawned(id, pid);
            self.publish(LifecyclePayload::Spawned { id, pid });
        }

        if let Some(err) = &report.failure {
            let error = err.to_string();
            telemetry::record_spawn_failed(&error);
            self.publish(LifecyclePayload::SpawnFailed { error });
        }

        report
    }

    fn apply_advance(&mut self, step: Advance, restart_id: Option<uuid::Uuid>) {
        match step {
            Advance::Draining { id, pid } => {
                telemetry::record_worker_draining(id, pid);
                self.bus.publish(LifecycleEvent::new(
                    restart_id,
                    LifecyclePayload::Draining { id, pid },
                ));
            }
            Advance::Completed => {
                tracing::info!("rolling restart complete");
                self.bus.publish(LifecycleEvent::new(
                    restart_id,
                    LifecyclePayload::RollingRestartCompleted,
                ));
            }
            Advance::Unchanged => {}
        }
    }

    fn publish(&self, payload: LifecyclePayload) {
        self.bus
            .publish(LifecycleEvent::new(self.sequencer.restart_id(), payload));
    }

    fn report_counts(&self) {
        telemetry::set_worker_counts(
            self.workers.count_in(WorkerPhase::Starting),
            self.workers.ready_count(),
            self.workers.count_in(WorkerPhase::Draining),
        );
    }

    fn spawn_capacity_ticker(&self) -> tokio::task::JoinHandle<()> {
        let events = self.events_tx.clone();
        let period = self.capacity_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if events.send(SupervisorEvent::CapacityCheck).is_err() {
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AdvancePolicy, WorkerCommand};
    use crate::process::{WorkerNotifier, WorkerProcess};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::time::timeout;

    /// Process that reports its own exit when stopped.
    struct ObedientProcess {
        notifier: WorkerNotifier,
        stops: Arc<Mutex<Vec<WorkerId>>>,
    }

    impl WorkerProcess for ObedientProcess {
        fn pid(&self) -> Option<u32> {
            Some(10_000 + self.notifier.id().0 as u32)
        }

        fn graceful_stop(&mut self) -> anyhow::Result<()> {
            self.stops.lock().unwrap().push(self.notifier.id());
            self.notifier.exited(ExitReason::Code(0));
            Ok(())
        }

        fn force_kill(&mut self) -> anyhow::Result<()> {
            self.notifier.exited(ExitReason::Signal(9));
            Ok(())
        }
    }

    /// Launcher whose workers become ready immediately.
    #[derive(Default)]
    struct EagerLauncher {
        stops: Arc<Mutex<Vec<WorkerId>>>,
        fail: bool,
    }

    #[async_trait]
    impl WorkerLauncher for EagerLauncher {
        async fn launch(
            &self,
            _id: WorkerId,
            notifier: WorkerNotifier,
        ) -> anyhow::Result<Box<dyn WorkerProcess>> {
            if self.fail {
                anyhow::bail!("launcher disabled");
            }
            notifier.ready();
            Ok(Box::new(ObedientProcess {
                notifier,
                stops: Arc::clone(&self.stops),
            }))
        }
    }

    fn config(workers: usize) -> SupervisorConfig {
        SupervisorConfig::new(WorkerCommand::new("worker")).with_workers(workers)
    }

    fn ready_ids<L: WorkerLauncher + 'static>(sup: &Supervisor<L>) -> Vec<WorkerId> {
        sup.workers()
            .iter()
            .filter(|w| w.phase() == WorkerPhase::Ready)
            .map(|w| w.id())
            .collect()
    }

    #[tokio::test]
    async fn test_start_fills_capacity() {
        let mut sup = Supervisor::new(config(3), Arc::new(EagerLauncher::default()));
        sup.start().await.unwrap();
        assert_eq!(sup.workers().count(), 3);

        sup.process_pending().await;
        assert_eq!(sup.workers().ready_count(), 3);
    }

    #[tokio::test]
    async fn test_start_without_any_worker_is_fatal() {
        let launcher = EagerLauncher {
            fail: true,
            ..Default::default()
        };
        let mut sup = Supervisor::new(config(2), Arc::new(launcher));
        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, HerdError::NoCapacity { target: 2, .. }));
    }

    #[tokio::test]
    async fn test_zero_target_starts_empty() {
        let launcher = EagerLauncher {
            fail: true,
            ..Default::default()
        };
        let mut sup = Supervisor::new(config(0), Arc::new(launcher));
        sup.start().await.unwrap();
        assert!(sup.workers().is_empty());
    }

    #[tokio::test]
    async fn test_reload_replaces_every_worker() {
        let launcher = Arc::new(EagerLauncher::default());
        let mut sup = Supervisor::new(config(2), Arc::clone(&launcher));
        sup.start().await.unwrap();
        sup.process_pending().await;
        assert_eq!(ready_ids(&sup), vec![WorkerId(1), WorkerId(2)]);

        sup.handle().reload().unwrap();
        sup.process_pending().await;

        assert_eq!(ready_ids(&sup), vec![WorkerId(3), WorkerId(4)]);
        assert_eq!(*launcher.stops.lock().unwrap(), vec![WorkerId(1), WorkerId(2)]);
        assert!(!sup.sequencer().is_active());
    }

    #[tokio::test]
    async fn test_lifecycle_events_for_reload() {
        let mut sup = Supervisor::new(config(1), Arc::new(EagerLauncher::default()));
        let mut rx = sup.subscribe();
        sup.start().await.unwrap();
        sup.process_pending().await;

        sup.handle().reload().unwrap();
        sup.process_pending().await;

        let mut payloads = Vec::new();
        while let Ok(event) = rx.try_recv() {
            payloads.push(event.payload);
        }
        assert!(payloads.contains(&LifecyclePayload::RollingRestartStarted {
            queued: vec![WorkerId(1)]
        }));
        assert!(payloads.contains(&LifecyclePayload::RollingRestartCompleted));
        assert!(payloads.contains(&LifecyclePayload::Ready { id: WorkerId(2) }));
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything_and_run_returns() {
        let launcher = Arc::new(EagerLauncher::default());
        let mut sup = Supervisor::new(config(2), Arc::clone(&launcher));
        sup.start().await.unwrap();

        let handle = sup.handle();
        handle.shutdown().unwrap();
        // A reload after shutdown is ignored.
        handle.reload().unwrap();

        timeout(Duration::from_secs(5), sup.run())
            .await
            .expect("run did not return after shutdown")
            .unwrap();

        assert!(sup.is_finished());
        assert_eq!(launcher.stops.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_handle_reports_closed_queue() {
        let sup = Supervisor::new(config(1), Arc::new(EagerLauncher::default()));
        let handle = sup.handle();
        drop(sup);
        assert!(matches!(handle.reload(), Err(HerdError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_policy_is_taken_from_config() {
        let cfg = config(1).with_advance_policy(AdvancePolicy::ReplacementReady);
        let sup = Supervisor::new(cfg, Arc::new(EagerLauncher::default()));
        assert_eq!(sup.sequencer().policy(), AdvancePolicy::ReplacementReady);
    }

    #[test]
    fn test_zero_capacity_interval_falls_back_to_default() {
        let cfg = config(1).with_capacity_check_interval(Duration::ZERO);
        let sup = Supervisor::new(cfg, Arc::new(EagerLauncher::default()));
        assert_eq!(
            sup.capacity_check_interval(),
            Duration::from_millis(DEFAULT_CAPACITY_CHECK_INTERVAL_MS)
        );

        let cfg = config(1).with_capacity_check_interval(Duration::from_millis(250));
        let sup = Supervisor::new(cfg, Arc::new(EagerLauncher::default()));
        assert_eq!(sup.capacity_check_interval(), Duration::from_millis(250));
    }
}
