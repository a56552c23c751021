//! Herd - worker process supervision with zero-downtime rolling restarts.
//!
//! A supervisor keeps a fixed number of worker processes alive. On reload it
//! replaces every worker one at a time, waiting for a replacement to become
//! ready before draining the next, so serving capacity never drops by more
//! than one worker. On shutdown it drains everything at once and exits once
//! the last worker is gone.
//!
//! # Core Concepts
//!
//! - **Worker Set**: the [`WorkerSet`] of [`WorkerHandle`]s, keyed by a
//!   monotonically increasing [`WorkerId`], each in a [`WorkerPhase`].
//!
//! - **Spawner**: the [`Spawner`] refills the set to its target size after
//!   startup, on every exit and on a periodic capacity check.
//!
//! - **Drain Controller**: the [`DrainController`] sends one graceful stop per
//!   worker and force-kills it when the grace period runs out.
//!
//! - **Restart Sequencer**: the [`RestartSequencer`] releases workers for
//!   replacement one at a time, gated on readiness.
//!
//! - **Supervisor**: the [`Supervisor`] owns all of the above and consumes a
//!   single event queue. [`SupervisorHandle`] and the [`signals`] module feed it.
//!
//! - **Processes**: the [`WorkerLauncher`] trait abstracts how workers are
//!   created; [`CommandLauncher`] runs a program with `tokio::process`.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use herd::*;
//! use std::sync::Arc;
//!
//! let config = SupervisorConfig::new(WorkerCommand::new("./server")).with_workers(4);
//! let launcher = Arc::new(CommandLauncher::from_config(&config)?);
//! let mut supervisor = Supervisor::new(config, launcher);
//! signals::spawn_listener(supervisor.handle())?;
//! supervisor.start().await?;
//! supervisor.run().await?;
//! ```

/// Supervisor configuration.
///
/// [`SupervisorConfig`] is loaded from TOML, environment overrides and
/// builder-style setters; [`WorkerCommand`] describes the worker program.
pub mod config;

/// Error types.
pub mod error;

/// Supervisor input events and observable lifecycle events.
///
/// - [`SupervisorEvent`] - the supervisor's internal event queue
/// - [`LifecycleEvent`] and [`LifecyclePayload`] - published transitions
/// - [`LifecycleBus`] - in-process broadcast of lifecycle events
pub mod events;

/// Logging initialisation.
pub mod logging;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
pub mod metrics;

/// Worker process abstraction and the `tokio::process` launcher.
pub mod process;

/// Supervisor runtime: worker set, spawner, drain controller, restart
/// sequencer and the supervisor loop.
pub mod runtime;

/// OS signal routing.
pub mod signals;

/// Tracing spans and lifecycle recording helpers.
pub mod telemetry;

pub use config::*;
pub use error::{HerdError, Result};
pub use events::*;
pub use process::*;
pub use runtime::*;
