/// Supervisor builder.
pub mod builder;
/// Graceful stop with grace-period escalation.
pub mod drain;
/// One-at-a-time replacement of workers during a rolling restart.
pub mod sequencer;
/// Capacity maintenance.
pub mod spawner;
/// The supervisor loop and its control handle.
pub mod supervisor;
/// Worker handles and the worker set.
pub mod worker;

pub use builder::SupervisorBuilder;
pub use drain::{DrainController, DrainOutcome, ExpireOutcome};
pub use sequencer::{Advance, Replacement, RestartSequencer, SequencerState};
pub use spawner::{SpawnReport, Spawner};
pub use supervisor::{Supervisor, SupervisorHandle};
pub use worker::{WorkerHandle, WorkerId, WorkerPhase, WorkerSet};
