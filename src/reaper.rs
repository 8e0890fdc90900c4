//! # Child reaping.
//!
//! SIGCHLD means "at least one child changed state": the reaper drains
//! every zombie non-blocking, classifies each exit, and records it on the
//! owning service record. Orphans re-parented onto pid 1 are reaped and
//! forgotten. The actual state transitions happen in the following
//! `step_all`.

use log::debug;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::launch::Spawner;
use crate::supervisor::Core;

/// Classifies one wait status into `(pid, clean exit)`.
///
/// Stops and continues are not exits and yield `None`.
pub fn classify(status: WaitStatus) -> Option<(i32, bool)> {
    match status {
        WaitStatus::Exited(pid, code) => Some((pid.as_raw(), code == 0)),
        WaitStatus::Signaled(pid, _sig, _core) => Some((pid.as_raw(), false)),
        _ => None,
    }
}

/// Drains all pending zombies. Returns `true` if any exit belonged to a
/// managed record, which is the caller's cue to `step_all`.
pub fn reap_all<S: Spawner>(core: &mut Core<S>) -> bool {
    let mut managed = false;

    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                if let Some((pid, clean)) = classify(status) {
                    debug!("reaped {pid} (clean: {clean})");
                    managed |= core.handle_exit(pid, clean);
                }
            }
            // ECHILD: nothing left to reap.
            Err(_) => break,
        }
    }

    managed
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    #[test]
    fn classify_exits() {
        assert_eq!(
            classify(WaitStatus::Exited(Pid::from_raw(7), 0)),
            Some((7, true))
        );
        assert_eq!(
            classify(WaitStatus::Exited(Pid::from_raw(7), 3)),
            Some((7, false))
        );
        assert_eq!(
            classify(WaitStatus::Signaled(Pid::from_raw(9), Signal::SIGKILL, false)),
            Some((9, false))
        );
        assert_eq!(
            classify(WaitStatus::Stopped(Pid::from_raw(9), Signal::SIGSTOP)),
            None
        );
        assert_eq!(classify(WaitStatus::StillAlive), None);
    }
}
