use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use herd::{ExitReason, WorkerId, WorkerLauncher, WorkerNotifier, WorkerProcess};
use parking_lot::Mutex;

/// First pid handed out by [`MockLauncher`].
pub const MOCK_PID_BASE: u32 = 40_000;

/// In-memory launcher recording every launch, graceful stop and kill.
///
/// Workers never run. Tests drive them with [`report_ready`] and
/// [`report_exit`], or let the launcher do it automatically.
///
/// [`report_ready`]: MockLauncher::report_ready
/// [`report_exit`]: MockLauncher::report_exit
#[derive(Clone)]
pub struct MockLauncher {
    state: Arc<Mutex<LauncherState>>,
}

#[derive(Default)]
struct LauncherState {
    workers: BTreeMap<WorkerId, MockWorker>,
    launch_attempts: usize,
    successes_before_failure: usize,
    failures_pending: usize,
    auto_ready: bool,
    exit_on_stop: bool,
    exit_on_kill: bool,
    stop_log: Vec<WorkerId>,
    kill_log: Vec<WorkerId>,
}

struct MockWorker {
    notifier: WorkerNotifier,
    pid: u32,
    stops: usize,
    kills: usize,
}

impl MockLauncher {
    /// Launcher whose workers stay silent until told otherwise, except
    /// that a kill always ends them.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LauncherState {
                exit_on_kill: true,
                ..Default::default()
            })),
        }
    }

    /// Launcher whose workers become ready at once and exit when stopped.
    pub fn obedient() -> Self {
        Self::new().with_auto_ready(true).with_exit_on_stop(true)
    }

    pub fn with_auto_ready(self, enabled: bool) -> Self {
        self.state.lock().auto_ready = enabled;
        self
    }

    pub fn with_exit_on_stop(self, enabled: bool) -> Self {
        self.state.lock().exit_on_stop = enabled;
        self
    }

    pub fn with_exit_on_kill(self, enabled: bool) -> Self {
        self.state.lock().exit_on_kill = enabled;
        self
    }

    pub fn set_auto_ready(&self, enabled: bool) {
        self.state.lock().auto_ready = enabled;
    }

    pub fn set_exit_on_stop(&self, enabled: bool) {
        self.state.lock().exit_on_stop = enabled;
    }

    /// Make the next `count` launches fail.
    pub fn fail_next(&self, count: usize) {
        self.fail_after(0, count);
    }

    /// Let `successes` launches through, then fail the following `failures`.
    pub fn fail_after(&self, successes: usize, failures: usize) {
        let mut state = self.state.lock();
        state.successes_before_failure = successes;
        state.failures_pending = failures;
    }

    /// Announce readiness for a launched worker.
    pub fn report_ready(&self, id: WorkerId) -> bool {
        self.state
            .lock()
            .workers
            .get(&id)
            .is_some_and(|w| w.notifier.ready())
    }

    /// Report that a launched worker terminated.
    pub fn report_exit(&self, id: WorkerId, reason: ExitReason) -> bool {
        self.state
            .lock()
            .workers
            .get(&id)
            .is_some_and(|w| w.notifier.exited(reason))
    }

    /// Ids of every successful launch, in launch order.
    pub fn launched(&self) -> Vec<WorkerId> {
        self.state.lock().workers.keys().copied().collect()
    }

    pub fn launch_count(&self) -> usize {
        self.state.lock().workers.len()
    }

    /// Launches attempted, including failed ones.
    pub fn launch_attempts(&self) -> usize {
        self.state.lock().launch_attempts
    }

    pub fn pid_of(&self, id: WorkerId) -> Option<u32> {
        self.state.lock().workers.get(&id).map(|w| w.pid)
    }

    pub fn stops(&self, id: WorkerId) -> usize {
        self.state.lock().workers.get(&id).map_or(0, |w| w.stops)
    }

    pub fn kills(&self, id: WorkerId) -> usize {
        self.state.lock().workers.get(&id).map_or(0, |w| w.kills)
    }

    /// Workers sent a graceful stop, in order.
    pub fn stop_log(&self) -> Vec<WorkerId> {
        self.state.lock().stop_log.clone()
    }

    /// Workers force-killed, in order.
    pub fn kill_log(&self) -> Vec<WorkerId> {
        self.state.lock().kill_log.clone()
    }

    pub fn assert_launch_count_eq(&self, expected: usize) {
        let actual = self.launch_count();
        assert_eq!(
            actual, expected,
            "Expected {} launches, got {}",
            expected, actual
        );
    }

    pub fn assert_stopped_once(&self, id: WorkerId) {
        let stops = self.stops(id);
        assert_eq!(
            stops, 1,
            "Expected worker {} to receive one graceful stop, got {}",
            id, stops
        );
    }

    pub fn assert_no_kills(&self) {
        let kills = self.kill_log();
        assert!(kills.is_empty(), "Expected no forced kills, got {:?}", kills);
    }

    pub fn clear_logs(&self) {
        let mut state = self.state.lock();
        state.stop_log.clear();
        state.kill_log.clear();
    }
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerLauncher for MockLauncher {
    async fn launch(
        &self,
        id: WorkerId,
        notifier: WorkerNotifier,
    ) -> anyhow::Result<Box<dyn WorkerProcess>> {
        let mut state = self.state.lock();
        state.launch_attempts += 1;
        if state.failures_pending > 0 {
            if state.successes_before_failure > 0 {
                state.successes_before_failure -= 1;
            } else {
                state.failures_pending -= 1;
                anyhow::bail!("mock launch of worker {id} failed");
            }
        }

        let pid = MOCK_PID_BASE + id.0 as u32;
        if state.auto_ready {
            notifier.ready();
        }
        state.workers.insert(
            id,
            MockWorker {
                notifier,
                pid,
                stops: 0,
                kills: 0,
            },
        );

        Ok(Box::new(MockProcess {
            id,
            pid,
            state: Arc::clone(&self.state),
        }))
    }
}

/// Process handle given out by [`MockLauncher`].
pub struct MockProcess {
    id: WorkerId,
    pid: u32,
    state: Arc<Mutex<LauncherState>>,
}

impl WorkerProcess for MockProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn graceful_stop(&mut self) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.stop_log.push(self.id);
        let exit = state.exit_on_stop;
        if let Some(worker) = state.workers.get_mut(&self.id) {
            worker.stops += 1;
            if exit {
                worker.notifier.exited(ExitReason::Code(0));
            }
        }
        Ok(())
    }

    fn force_kill(&mut self) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.kill_log.push(self.id);
        let exit = state.exit_on_kill;
        if let Some(worker) = state.workers.get_mut(&self.id) {
            worker.kills += 1;
            if exit {
                worker.notifier.exited(ExitReason::Signal(9));
            }
        }
        Ok(())
    }
}
