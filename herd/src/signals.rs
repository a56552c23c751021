//! Maps operating system signals to supervisor requests.
//!
//! | Signal            | Request  |
//! |-------------------|----------|
//! | `SIGHUP`          | reload   |
//! | `SIGTERM`/`SIGINT`| shutdown |
//!
//! Handlers only enqueue; all work happens on the supervisor loop.

use std::io;

use nix::sys::signal::Signal;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

use crate::events::SupervisorEvent;
use crate::runtime::SupervisorHandle;

/// Supervisor request for a signal, if it has one.
pub fn route(sig: Signal) -> Option<SupervisorEvent> {
    match sig {
        Signal::SIGHUP => Some(SupervisorEvent::Reload),
        Signal::SIGTERM | Signal::SIGINT => Some(SupervisorEvent::Shutdown),
        _ => None,
    }
}

/// Install the signal handlers and forward signals to `handle`.
///
/// Handlers are registered before this returns. The listener ends when the
/// supervisor goes away.
pub fn spawn_listener(handle: SupervisorHandle) -> io::Result<JoinHandle<()>> {
    let mut hup = signal(SignalKind::hangup())?;
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        loop {
            let sig = tokio::select! {
                Some(()) = hup.recv() => Signal::SIGHUP,
                Some(()) = term.recv() => Signal::SIGTERM,
                Some(()) = int.recv() => Signal::SIGINT,
                else => break,
            };

            let Some(event) = route(sig) else { continue };
            tracing::info!(signal = %sig, "received signal");
            if handle.send(event).is_err() {
                tracing::debug!("supervisor gone, signal listener exiting");
                break;
            }
        }
    }))
}
