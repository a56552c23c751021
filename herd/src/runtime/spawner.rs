use crate::error::HerdError;
use crate::events::EventSender;
use crate::process::WorkerLauncher;

use super::worker::{WorkerId, WorkerSet};

/// Outcome of one capacity pass.
#[derive(Debug, Default)]
pub struct SpawnReport {
    /// Workers created by this pass, in spawn order.
    pub spawned: Vec<WorkerId>,
    /// The failure that ended the pass early, if any.
    pub failure: Option<HerdError>,
}

impl SpawnReport {
    pub fn is_noop(&self) -> bool {
        self.spawned.is_empty() && self.failure.is_none()
    }
}

/// Keeps the worker set at its target size.
#[derive(Clone, Copy, Debug)]
pub struct Spawner {
    target: usize,
}

impl Spawner {
    pub fn new(target: usize) -> Self {
        Self { target }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// Spawn workers until `count() == target`, unless stopping.
    ///
    /// A launch failure ends the pass; the next exit or capacity check
    /// tries again.
    pub async fn ensure_capacity<L>(
        &self,
        workers: &mut WorkerSet,
        launcher: &L,
        events: &EventSender,
        stopping: bool,
    ) -> SpawnReport
    where
        L: WorkerLauncher + ?Sized,
    {
        let mut report = SpawnReport::default();
        if stopping {
            return report;
        }

        while workers.count() < self.target {
            match workers.spawn(launcher, events).await {
                Ok(id) => report.spawned.push(id),
                Err(err) => {
                    report.failure = Some(err);
                    break;
                }
            }
        }

        report
    }
}
