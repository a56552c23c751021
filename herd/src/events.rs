use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::process::ExitReason;
use crate::runtime::worker::{WorkerId, WorkerPhase};

/// Input consumed by the supervisor loop.
///
/// Everything that can change supervisor state arrives as one of these:
/// OS signals, worker notifications, timer expiry and the periodic
/// capacity check. Producers only enqueue; the loop is the only consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// Replace every worker, one at a time.
    Reload,
    /// Drain every worker and stop spawning.
    Shutdown,
    /// A worker announced that it accepts connections.
    WorkerReady(WorkerId),
    /// A worker process terminated.
    WorkerExited { id: WorkerId, reason: ExitReason },
    /// The grace period of a draining worker ran out.
    GraceExpired(WorkerId),
    /// Periodic capacity check.
    CapacityCheck,
}

/// Sending half of the supervisor event queue.
pub type EventSender = mpsc::UnboundedSender<SupervisorEvent>;
/// Receiving half of the supervisor event queue.
pub type EventReceiver = mpsc::UnboundedReceiver<SupervisorEvent>;

/// Create the supervisor event queue.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Metadata envelope attached to every lifecycle event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    /// Rolling restart this event belongs to, if any.
    pub restart_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(restart_id: Option<Uuid>) -> Self {
        Self {
            version: 1,
            restart_id,
            timestamp: Utc::now(),
        }
    }
}

/// Observable worker lifecycle event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub meta: EventMeta,
    pub payload: LifecyclePayload,
}

impl LifecycleEvent {
    pub fn new(restart_id: Option<Uuid>, payload: LifecyclePayload) -> Self {
        Self {
            meta: EventMeta::new(restart_id),
            payload,
        }
    }
}

/// Event payload emitted for supervisor and worker transitions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum LifecyclePayload {
    /// Initial capacity was reached at startup.
    Booted { pid: u32, workers: usize },
    /// A worker process was created.
    Spawned { id: WorkerId, pid: Option<u32> },
    /// A worker could not be created.
    SpawnFailed { error: String },
    /// A worker announced readiness.
    Ready { id: WorkerId },
    /// A worker was asked to stop accepting work.
    Draining { id: WorkerId, pid: Option<u32> },
    /// A draining worker outlived its grace period and was killed.
    ForceKilled { id: WorkerId, pid: Option<u32> },
    /// A worker process terminated.
    Exited {
        id: WorkerId,
        last_phase: WorkerPhase,
        reason: ExitReason,
    },
    /// A rolling restart was requested.
    RollingRestartStarted { queued: Vec<WorkerId> },
    /// Every worker of a rolling restart has been drained and replaced.
    RollingRestartCompleted,
    /// Shutdown was requested.
    ShutdownStarted { draining: usize },
}

/// In-process lifecycle event bus using a tokio broadcast channel.
///
/// Publishing never blocks and never fails: with no subscribers the event
/// is dropped, and a subscriber that falls behind receives
/// `RecvError::Lagged` instead of slowing the supervisor down.
pub struct LifecycleBus {
    sender: broadcast::Sender<LifecycleEvent>,
    capacity: usize,
}

impl std::fmt::Debug for LifecycleBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl LifecycleBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: LifecycleEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    /// Clone of the sending half, for handles that hand out subscriptions.
    pub fn sender(&self) -> broadcast::Sender<LifecycleEvent> {
        self.sender.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LifecycleBus {
    fn default() -> Self {
        Self::new(256)
    }
}
