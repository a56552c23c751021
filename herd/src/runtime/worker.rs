use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;

use crate::error::{HerdError, Result};
use crate::events::EventSender;
use crate::process::{WorkerLauncher, WorkerNotifier, WorkerProcess};
use crate::telemetry;

/// Supervisor-assigned worker identity.
///
/// Ids are handed out in strictly increasing order and never reused, so
/// ordering by id is ordering by spawn time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle phase of a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Starting,
    Ready,
    Draining,
    Exited,
}

impl WorkerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Exited => "exited",
        }
    }
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One supervised worker.
pub struct WorkerHandle {
    id: WorkerId,
    pid: Option<u32>,
    phase: WorkerPhase,
    spawned_at: DateTime<Utc>,
    process: Box<dyn WorkerProcess>,
    grace_timer: Option<AbortHandle>,
    force_killed: bool,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("phase", &self.phase)
            .field("spawned_at", &self.spawned_at)
            .field("grace_timer_armed", &self.grace_timer.is_some())
            .field("force_killed", &self.force_killed)
            .finish()
    }
}

impl WorkerHandle {
    /// Wrap a freshly launched process; the handle starts in `Starting`.
    pub fn new(id: WorkerId, process: Box<dyn WorkerProcess>) -> Self {
        Self {
            id,
            pid: process.pid(),
            phase: WorkerPhase::Starting,
            spawned_at: Utc::now(),
            process,
            grace_timer: None,
            force_killed: false,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn phase(&self) -> WorkerPhase {
        self.phase
    }

    pub fn spawned_at(&self) -> DateTime<Utc> {
        self.spawned_at
    }

    pub fn has_grace_timer(&self) -> bool {
        self.grace_timer.is_some()
    }

    pub fn is_force_killed(&self) -> bool {
        self.force_killed
    }

    pub(crate) fn set_phase(&mut self, phase: WorkerPhase) {
        self.phase = phase;
    }

    pub(crate) fn process_mut(&mut self) -> &mut dyn WorkerProcess {
        self.process.as_mut()
    }

    pub(crate) fn arm_grace_timer(&mut self, timer: AbortHandle) {
        if let Some(previous) = self.grace_timer.replace(timer) {
            previous.abort();
        }
    }

    pub(crate) fn mark_force_killed(&mut self) {
        self.force_killed = true;
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        // The grace period ends with the worker.
        if let Some(timer) = self.grace_timer.take() {
            timer.abort();
        }
    }
}

/// Live workers keyed by id.
///
/// Iteration follows id order, which is spawn order.
#[derive(Debug, Default)]
pub struct WorkerSet {
    workers: BTreeMap<WorkerId, WorkerHandle>,
    next_id: u64,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self {
            workers: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Id the next spawned worker will receive.
    pub fn peek_next_id(&self) -> WorkerId {
        WorkerId(self.next_id.max(1))
    }

    fn allocate_id(&mut self) -> WorkerId {
        let id = self.peek_next_id();
        self.next_id = id.0 + 1;
        id
    }

    /// Launch a new worker and insert it in `Starting`.
    pub async fn spawn<L>(&mut self, launcher: &L, events: &EventSender) -> Result<WorkerId>
    where
        L: WorkerLauncher + ?Sized,
    {
        let id = self.allocate_id();
        let notifier = WorkerNotifier::new(id, events.clone());
        let process = telemetry::instrument_spawn(id, launcher.launch(id, notifier))
            .await
            .map_err(|err| HerdError::Spawn(format!("{err:#}")))?;
        self.insert(WorkerHandle::new(id, process));
        Ok(id)
    }

    /// Insert a handle; an existing handle with the same id is replaced.
    pub fn insert(&mut self, handle: WorkerHandle) {
        if handle.id.0 >= self.next_id {
            self.next_id = handle.id.0 + 1;
        }
        self.workers.insert(handle.id, handle);
    }

    /// Number of workers that have not exited.
    pub fn count(&self) -> usize {
        self.workers
            .values()
            .filter(|w| w.phase != WorkerPhase::Exited)
            .count()
    }

    pub fn count_in(&self, phase: WorkerPhase) -> usize {
        self.workers.values().filter(|w| w.phase == phase).count()
    }

    pub fn ready_count(&self) -> usize {
        self.count_in(WorkerPhase::Ready)
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerHandle> {
        self.workers.get(&id)
    }

    pub fn get_mut(&mut self, id: WorkerId) -> Option<&mut WorkerHandle> {
        self.workers.get_mut(&id)
    }

    pub fn contains(&self, id: WorkerId) -> bool {
        self.workers.contains_key(&id)
    }

    /// Snapshot of all ids in enumeration order.
    pub fn ids(&self) -> Vec<WorkerId> {
        self.workers.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.workers.values()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Move a `Starting` worker to `Ready`.
    ///
    /// Returns `false` when the worker is unknown or not starting; a worker
    /// that began draining before it became ready stays draining.
    pub fn mark_ready(&mut self, id: WorkerId) -> bool {
        match self.workers.get_mut(&id) {
            Some(handle) if handle.phase == WorkerPhase::Starting => {
                handle.phase = WorkerPhase::Ready;
                true
            }
            _ => false,
        }
    }

    /// Record a worker's exit and remove it.
    ///
    /// Returns the handle, now in `Exited`, or `None` if the exit was
    /// already observed.
    pub fn remove_exited(&mut self, id: WorkerId) -> Option<WorkerHandle> {
        let mut handle = self.workers.remove(&id)?;
        if let Some(timer) = handle.grace_timer.take() {
            timer.abort();
        }
        handle.phase = WorkerPhase::Exited;
        Some(handle)
    }
}
