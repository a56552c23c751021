//! Worker subprocess plumbing.
//!
//! The supervisor never touches OS processes directly. It asks a
//! [`WorkerLauncher`] for a new [`WorkerProcess`] and hands it a
//! [`WorkerNotifier`]; the launcher arranges for readiness and exit to be
//! reported through the notifier, which feeds the supervisor event queue.
//!
//! [`CommandLauncher`] is the production launcher: it runs the configured
//! program with `tokio::process`, watches stdout for the readiness token,
//! forwards worker output to the log and delivers signals by pid with `nix`.

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::signal::unix::{signal as unix_signal, Signal as SignalStream, SignalKind};

use crate::config::{Readiness, SupervisorConfig, WorkerCommand};
use crate::events::{EventSender, SupervisorEvent};
use crate::runtime::worker::WorkerId;

/// Why a worker process terminated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExitReason {
    /// Normal exit with status code.
    Code(i32),
    /// Killed by the signal with this number.
    Signal(i32),
    /// The exit status could not be determined.
    Unknown,
}

impl ExitReason {
    /// Analyze an exit status.
    pub fn from_status(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        if let Some(code) = status.code() {
            Self::Code(code)
        } else if let Some(sig) = status.signal() {
            Self::Signal(sig)
        } else {
            Self::Unknown
        }
    }

    /// Check if this is a successful exit.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Code(0))
    }

    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Code(code) => format!("exited with code {code}"),
            Self::Signal(sig) => match Signal::try_from(*sig) {
                Ok(signal) => format!("killed by signal {}", signal.as_str()),
                Err(_) => format!("killed by signal {sig}"),
            },
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/// Reports a single worker's readiness and exit to the supervisor.
#[derive(Clone, Debug)]
pub struct WorkerNotifier {
    id: WorkerId,
    events: EventSender,
}

impl WorkerNotifier {
    pub fn new(id: WorkerId, events: EventSender) -> Self {
        Self { id, events }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Report that the worker accepts connections.
    ///
    /// Returns `false` if the supervisor is gone.
    pub fn ready(&self) -> bool {
        self.events.send(SupervisorEvent::WorkerReady(self.id)).is_ok()
    }

    /// Report that the worker process terminated.
    ///
    /// Returns `false` if the supervisor is gone.
    pub fn exited(&self, reason: ExitReason) -> bool {
        self.events
            .send(SupervisorEvent::WorkerExited {
                id: self.id,
                reason,
            })
            .is_ok()
    }
}

/// A running worker, exclusively owned by its worker handle.
pub trait WorkerProcess: Send {
    /// OS process id, if the process has one.
    fn pid(&self) -> Option<u32>;

    /// Ask the worker to stop accepting new work and exit once in-flight
    /// work is done.
    fn graceful_stop(&mut self) -> anyhow::Result<()>;

    /// Terminate the worker immediately.
    fn force_kill(&mut self) -> anyhow::Result<()>;
}

/// Creates worker processes.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start a new worker.
    ///
    /// The implementation must eventually call [`WorkerNotifier::exited`]
    /// exactly once, and [`WorkerNotifier::ready`] when the worker accepts
    /// connections.
    async fn launch(
        &self,
        id: WorkerId,
        notifier: WorkerNotifier,
    ) -> anyhow::Result<Box<dyn WorkerProcess>>;
}

#[async_trait]
impl<L: WorkerLauncher + ?Sized> WorkerLauncher for Arc<L> {
    async fn launch(
        &self,
        id: WorkerId,
        notifier: WorkerNotifier,
    ) -> anyhow::Result<Box<dyn WorkerProcess>> {
        (**self).launch(id, notifier).await
    }
}

/// Launches workers as child processes of the supervisor.
#[derive(Clone, Debug)]
pub struct CommandLauncher {
    command: WorkerCommand,
    readiness: Readiness,
    drain_signal: Signal,
    kill_signal: Signal,
}

impl CommandLauncher {
    pub fn new(
        command: WorkerCommand,
        readiness: Readiness,
        drain_signal: Signal,
        kill_signal: Signal,
    ) -> Self {
        Self {
            command,
            readiness,
            drain_signal,
            kill_signal,
        }
    }

    /// Build a launcher from a validated configuration.
    pub fn from_config(config: &SupervisorConfig) -> crate::Result<Self> {
        Ok(Self::new(
            config.command.clone(),
            config.readiness.clone(),
            config.drain_signal()?,
            config.kill_signal()?,
        ))
    }

    fn build_command(&self, id: WorkerId) -> Command {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args);
        cmd.envs(&self.command.env);
        cmd.env("HERD_WORKER_ID", id.to_string());
        if let Some(cwd) = &self.command.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }
}

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    async fn launch(
        &self,
        id: WorkerId,
        notifier: WorkerNotifier,
    ) -> anyhow::Result<Box<dyn WorkerProcess>> {
        // Registered before the fork so no SIGCHLD of this child is missed.
        let sigchld = unix_signal(SignalKind::child()).context("failed to watch SIGCHLD")?;
        let mut child = self
            .build_command(id)
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", self.command.program))?;

        let pid = child
            .id()
            .context("worker exited before its pid could be read")?;
        let reaped = Arc::new(Mutex::new(false));

        let ready_token = match &self.readiness {
            Readiness::Stdout { token } => Some(token.clone()),
            Readiness::Spawned => {
                notifier.ready();
                None
            }
        };

        if let Some(stdout) = child.stdout.take() {
            let notifier = notifier.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                let mut announced = false;
                while let Ok(Some(line)) = lines.next_line().await {
                    if !announced && ready_token.as_deref() == Some(line.trim()) {
                        announced = true;
                        notifier.ready();
                        continue;
                    }
                    tracing::info!(target: "herd::worker", worker_id = %id, "{line}");
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(target: "herd::worker", worker_id = %id, "{line}");
                }
            });
        }

        let watcher_reaped = Arc::clone(&reaped);
        tokio::spawn(async move {
            // The zombie keeps the pid reserved until signalling is shut off.
            if let Err(err) = wait_unreaped(pid, sigchld).await {
                tracing::debug!(worker_id = %id, "waitid failed: {err}");
            }
            *watcher_reaped.lock() = true;

            let reason = match child.wait().await {
                Ok(status) => ExitReason::from_status(status),
                Err(err) => {
                    tracing::warn!(worker_id = %id, "waiting on worker failed: {err}");
                    ExitReason::Unknown
                }
            };
            notifier.exited(reason);
        });

        Ok(Box::new(ChildProcess {
            pid,
            reaped,
            drain_signal: self.drain_signal,
            kill_signal: self.kill_signal,
        }))
    }
}

/// Wait until `pid` has exited without reaping it.
async fn wait_unreaped(pid: u32, mut sigchld: SignalStream) -> nix::Result<()> {
    let pid = Pid::from_raw(pid as i32);
    let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT | WaitPidFlag::WNOHANG;
    loop {
        match waitid(Id::Pid(pid), flags) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err),
        }
        if sigchld.recv().await.is_none() {
            return Ok(());
        }
    }
}

/// Child process started by [`CommandLauncher`].
///
/// The child itself is owned by its watcher task. Signals go by pid under
/// the `reaped` lock, and the watcher sets `reaped` before reaping, so a
/// recycled pid is never signalled.
struct ChildProcess {
    pid: u32,
    reaped: Arc<Mutex<bool>>,
    drain_signal: Signal,
    kill_signal: Signal,
}

impl ChildProcess {
    fn send(&self, sig: Signal) -> anyhow::Result<()> {
        let reaped = self.reaped.lock();
        if *reaped {
            return Ok(());
        }
        match signal::kill(Pid::from_raw(self.pid as i32), sig) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(crate::HerdError::Signal(err))
                .with_context(|| format!("failed to send {} to pid {}", sig.as_str(), self.pid)),
        }
    }
}

impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn graceful_stop(&mut self) -> anyhow::Result<()> {
        self.send(self.drain_signal)
    }

    fn force_kill(&mut self) -> anyhow::Result<()> {
        self.send(self.kill_signal)
    }
}
