use std::time::Duration;

use crate::events::{EventSender, SupervisorEvent};
use crate::telemetry;

use super::worker::{WorkerId, WorkerPhase, WorkerSet};

/// Result of a [`DrainController::drain`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Graceful stop sent and grace timer armed.
    Started { pid: Option<u32> },
    /// The worker is already draining; nothing was sent.
    AlreadyDraining,
    /// No such worker.
    NotFound,
}

/// Result of a grace period expiring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpireOutcome {
    /// The worker was forcibly terminated.
    Killed { pid: Option<u32> },
    /// The worker was already force-killed or is not draining.
    Skipped,
    /// The worker exited in the meantime.
    NotFound,
}

/// Stops workers gracefully, escalating after a grace period.
#[derive(Clone, Copy, Debug)]
pub struct DrainController {
    grace: Duration,
}

impl DrainController {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace
    }

    /// Begin draining a worker.
    ///
    /// Sends exactly one graceful stop and arms exactly one timer per
    /// worker, however often it is called before the exit. The timer only
    /// enqueues [`SupervisorEvent::GraceExpired`]; escalation happens in
    /// [`expire`](Self::expire) on the supervisor loop.
    pub fn drain(&self, workers: &mut WorkerSet, id: WorkerId, events: &EventSender) -> DrainOutcome {
        let Some(handle) = workers.get_mut(id) else {
            return DrainOutcome::NotFound;
        };

        match handle.phase() {
            WorkerPhase::Draining | WorkerPhase::Exited => return DrainOutcome::AlreadyDraining,
            WorkerPhase::Starting | WorkerPhase::Ready => {}
        }

        handle.set_phase(WorkerPhase::Draining);
        let pid = handle.pid();
        let _span = telemetry::drain_span(id, pid).entered();

        if let Err(err) = handle.process_mut().graceful_stop() {
            // The timer still runs, so an unresponsive worker is killed later.
            tracing::warn!(worker_id = %id, ?pid, "graceful stop failed: {err:#}");
        }

        let grace = self.grace;
        let events = events.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = events.send(SupervisorEvent::GraceExpired(id));
        });
        handle.arm_grace_timer(timer.abort_handle());

        DrainOutcome::Started { pid }
    }

    /// Handle the grace period of `id` running out.
    pub fn expire(&self, workers: &mut WorkerSet, id: WorkerId) -> ExpireOutcome {
        let Some(handle) = workers.get_mut(id) else {
            return ExpireOutcome::NotFound;
        };

        if handle.phase() != WorkerPhase::Draining || handle.is_force_killed() {
            return ExpireOutcome::Skipped;
        }

        handle.mark_force_killed();
        let pid = handle.pid();
        let _span = telemetry::drain_span(id, pid).entered();
        if let Err(err) = handle.process_mut().force_kill() {
            tracing::error!(worker_id = %id, ?pid, "forced termination failed: {err:#}");
        }

        ExpireOutcome::Killed { pid }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{event_channel, EventReceiver};
    use crate::process::WorkerProcess;
    use crate::runtime::worker::WorkerHandle;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Calls {
        stops: AtomicUsize,
        kills: AtomicUsize,
    }

    struct RecordingProcess(Arc<Calls>);

    impl WorkerProcess for RecordingProcess {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        fn graceful_stop(&mut self) -> anyhow::Result<()> {
            self.0.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn force_kill(&mut self) -> anyhow::Result<()> {
            self.0.kills.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn setup() -> (WorkerSet, WorkerId, Arc<Calls>, EventSender, EventReceiver) {
        let (tx, rx) = event_channel();
        let calls = Arc::new(Calls::default());
        let mut set = WorkerSet::new();
        let id = WorkerId(1);
        set.insert(WorkerHandle::new(id, Box::new(RecordingProcess(calls.clone()))));
        (set, id, calls, tx, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_is_idempotent() {
        let (mut set, id, calls, tx, mut rx) = setup();
        let drains = DrainController::new(Duration::from_secs(60));

        assert_eq!(
            drains.drain(&mut set, id, &tx),
            DrainOutcome::Started { pid: Some(4242) }
        );
        assert_eq!(drains.drain(&mut set, id, &tx), DrainOutcome::AlreadyDraining);
        assert_eq!(calls.stops.load(Ordering::SeqCst), 1);
        assert_eq!(set.get(id).unwrap().phase(), WorkerPhase::Draining);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(rx.recv().await, Some(SupervisorEvent::GraceExpired(id)));
        // One timer, one expiry.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_no_earlier_than_grace() {
        let (mut set, id, _calls, tx, mut rx) = setup();
        let drains = DrainController::new(Duration::from_secs(60));
        drains.drain(&mut set, id, &tx);

        tokio::time::sleep(Duration::from_millis(59_999)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(rx.try_recv().ok(), Some(SupervisorEvent::GraceExpired(id)));
    }

    #[tokio::test]
    async fn test_drain_unknown_worker() {
        let (tx, _rx) = event_channel();
        let mut set = WorkerSet::new();
        let drains = DrainController::new(Duration::from_secs(1));
        assert_eq!(drains.drain(&mut set, WorkerId(9), &tx), DrainOutcome::NotFound);
        assert_eq!(drains.expire(&mut set, WorkerId(9)), ExpireOutcome::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_kills_once() {
        let (mut set, id, calls, tx, _rx) = setup();
        let drains = DrainController::new(Duration::from_secs(5));
        drains.drain(&mut set, id, &tx);

        assert_eq!(
            drains.expire(&mut set, id),
            ExpireOutcome::Killed { pid: Some(4242) }
        );
        assert_eq!(drains.expire(&mut set, id), ExpireOutcome::Skipped);
        assert_eq!(calls.kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expire_ignores_non_draining_worker() {
        let (mut set, id, calls, _tx, _rx) = setup();
        let drains = DrainController::new(Duration::from_secs(5));
        assert_eq!(drains.expire(&mut set, id), ExpireOutcome::Skipped);
        assert_eq!(calls.kills.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_cancels_timer() {
        let (mut set, id, _calls, tx, mut rx) = setup();
        let drains = DrainController::new(Duration::from_secs(5));
        drains.drain(&mut set, id, &tx);

        drop(set.remove_exited(id));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }
}
