//! # Signal handling for pid 1.
//!
//! Every signal is bridged to the event loop through kernel signal
//! streams; handlers never touch supervisor state. Bindings:
//!
//! - **SIGCHLD** drives the reaper.
//! - **SIGTERM** halt (runlevel 0), **SIGINT** reboot (runlevel 6) —
//!   the same code path the FIFO uses.
//! - **SIGHUP** reload, **SIGUSR1** debug toggle, **SIGUSR2** emergency
//!   shell.

use std::io;

use tokio::signal::unix::{signal, Signal, SignalKind};

/// What the loop should do about a delivered signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitAction {
    ChildExited,
    Halt,
    Reboot,
    Reload,
    ToggleDebug,
    Emergency,
}

/// Owns one stream per accepted signal.
pub struct SignalHub {
    sigchld: Signal,
    sigterm: Signal,
    sigint: Signal,
    sighup: Signal,
    sigusr1: Signal,
    sigusr2: Signal,
}

impl SignalHub {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            sigchld: signal(SignalKind::child())?,
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
            sighup: signal(SignalKind::hangup())?,
            sigusr1: signal(SignalKind::user_defined1())?,
            sigusr2: signal(SignalKind::user_defined2())?,
        })
    }

    /// Completes with the action for the next delivered signal.
    pub async fn next(&mut self) -> InitAction {
        tokio::select! {
            _ = self.sigchld.recv() => InitAction::ChildExited,
            _ = self.sigterm.recv() => InitAction::Halt,
            _ = self.sigint.recv() => InitAction::Reboot,
            _ = self.sighup.recv() => InitAction::Reload,
            _ = self.sigusr1.recv() => InitAction::ToggleDebug,
            _ = self.sigusr2.recv() => InitAction::Emergency,
        }
    }
}
