use std::collections::VecDeque;

use uuid::Uuid;

use crate::config::AdvancePolicy;
use crate::events::EventSender;

use super::drain::{DrainController, DrainOutcome};
use super::worker::{WorkerId, WorkerPhase, WorkerSet};

/// Where a rolling restart stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequencerState {
    /// No drain of a rolling restart is in flight.
    Idle,
    /// `current` was released for draining and `replacement` tracks the
    /// worker that takes over its slot.
    DrainingOne {
        current: WorkerId,
        replacement: Replacement,
    },
}

/// Progress of the worker replacing the one being drained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Replacement {
    /// The drained worker is still running.
    AwaitingExit,
    /// The drained worker exited; the next spawn takes its slot.
    AwaitingSpawn,
    /// This worker took the slot and has not reported ready yet.
    Spawned(WorkerId),
}

/// What a sequencer step did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Advance {
    /// A worker was released for draining.
    Draining { id: WorkerId, pid: Option<u32> },
    /// The queue ran dry; the rolling restart is over.
    Completed,
    /// Nothing happened.
    Unchanged,
}

/// Releases the workers of a rolling restart one at a time.
///
/// Each release after the first waits for a readiness notification, so a
/// replacement comes online before capacity is reduced again.
#[derive(Debug)]
pub struct RestartSequencer {
    queue: VecDeque<WorkerId>,
    state: SequencerState,
    policy: AdvancePolicy,
    restart_id: Option<Uuid>,
}

impl RestartSequencer {
    pub fn new(policy: AdvancePolicy) -> Self {
        Self {
            queue: VecDeque::new(),
            state: SequencerState::Idle,
            policy,
            restart_id: None,
        }
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn policy(&self) -> AdvancePolicy {
        self.policy
    }

    /// Ids still waiting to be drained, front first.
    pub fn pending(&self) -> Vec<WorkerId> {
        self.queue.iter().copied().collect()
    }

    /// Correlation id of the active rolling restart.
    pub fn restart_id(&self) -> Option<Uuid> {
        self.restart_id
    }

    pub fn is_active(&self) -> bool {
        self.restart_id.is_some()
    }

    /// Start a rolling restart over the current worker set.
    ///
    /// The snapshot replaces any pending queue. Workers already draining
    /// are left to finish under their own timers and are not queued again.
    /// When a drain is still in flight the new queue waits for its
    /// readiness feedback, so two drains never overlap.
    pub fn begin(
        &mut self,
        workers: &mut WorkerSet,
        drains: &DrainController,
        events: &EventSender,
    ) -> (Uuid, Vec<WorkerId>, Advance) {
        let snapshot: Vec<WorkerId> = workers
            .iter()
            .filter(|w| matches!(w.phase(), WorkerPhase::Starting | WorkerPhase::Ready))
            .map(|w| w.id())
            .collect();

        let restart_id = Uuid::now_v7();
        self.restart_id = Some(restart_id);
        self.queue = snapshot.iter().copied().collect();

        let step = match self.state {
            SequencerState::Idle => self.advance(workers, drains, events),
            SequencerState::DrainingOne { .. } => Advance::Unchanged,
        };
        (restart_id, snapshot, step)
    }

    /// Release the next queued worker, or finish the restart.
    ///
    /// Ids that exited or started draining since the snapshot are skipped.
    pub fn advance(
        &mut self,
        workers: &mut WorkerSet,
        drains: &DrainController,
        events: &EventSender,
    ) -> Advance {
        while let Some(id) = self.queue.pop_front() {
            if let DrainOutcome::Started { pid } = drains.drain(workers, id, events) {
                self.state = SequencerState::DrainingOne {
                    current: id,
                    replacement: Replacement::AwaitingExit,
                };
                return Advance::Draining { id, pid };
            }
        }

        let was_active = self.is_active() || self.state != SequencerState::Idle;
        self.state = SequencerState::Idle;
        self.restart_id = None;
        if was_active {
            Advance::Completed
        } else {
            Advance::Unchanged
        }
    }

    /// Readiness feedback: a worker became ready.
    pub fn on_ready(
        &mut self,
        id: WorkerId,
        workers: &mut WorkerSet,
        drains: &DrainController,
        events: &EventSender,
    ) -> Advance {
        let SequencerState::DrainingOne { replacement, .. } = self.state else {
            return Advance::Unchanged;
        };

        match self.policy {
            AdvancePolicy::AnyReady => self.advance(workers, drains, events),
            AdvancePolicy::ReplacementReady if replacement == Replacement::Spawned(id) => {
                self.advance(workers, drains, events)
            }
            AdvancePolicy::ReplacementReady => Advance::Unchanged,
        }
    }

    /// A worker exited.
    ///
    /// The exit of the drained worker opens its slot. If its replacement
    /// dies before becoming ready, the slot opens again.
    pub fn on_exit(&mut self, id: WorkerId) {
        if let SequencerState::DrainingOne {
            current,
            ref mut replacement,
        } = self.state
        {
            let reopen = match *replacement {
                Replacement::AwaitingExit => id == current,
                Replacement::Spawned(r) => id == r,
                Replacement::AwaitingSpawn => false,
            };
            if reopen {
                *replacement = Replacement::AwaitingSpawn;
            }
        }
    }

    /// Workers were spawned, in spawn order.
    ///
    /// The first spawn after the drained worker's slot opened becomes its
    /// replacement.
    pub fn on_spawned(&mut self, spawned: &[WorkerId]) {
        if let SequencerState::DrainingOne {
            ref mut replacement,
            ..
        } = self.state
        {
            if let (Replacement::AwaitingSpawn, Some(&first)) = (*replacement, spawned.first()) {
                *replacement = Replacement::Spawned(first);
            }
        }
    }

    /// Abandon the rolling restart (shutdown).
    pub fn cancel(&mut self) {
        self.queue.clear();
        self.state = SequencerState::Idle;
        self.restart_id = None;
    }
}
