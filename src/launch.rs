//! # Process launching and the fork discipline.
//!
//! [`Spawner`] is the seam between the state machine and the kernel: the
//! supervisor only ever starts and signals processes through it, which is
//! what lets the whole FSM run under test without forking.
//!
//! [`ProcessLauncher`] is the real implementation. Between fork and exec
//! the child:
//!
//! 1. starts a new session (`setsid`),
//! 2. restores default signal dispositions,
//! 3. closes every descriptor above stderr,
//! 4. applies resource limits and credentials,
//! 5. chdirs to `/` and execs.
//!
//! The parent never waits on the child here; reaping happens exclusively
//! in the generic SIGCHLD path.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};

use log::{info, warn};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{Gid, Group, Pid, Uid, User};

use crate::error::InitError;
use crate::svc::{RlimitRule, RlimitScope, Svc};

/// Starts and signals managed processes.
///
/// Tests substitute a recording fake; the supervisor is generic over this
/// trait.
pub trait Spawner {
    /// Fork/exec the record's command; returns the child pid.
    fn spawn(&mut self, svc: &Svc) -> Result<i32, InitError>;

    /// Delivers `sig` to `pid`. Delivery to a dead pid is not an error.
    fn kill(&mut self, pid: i32, sig: Signal);
}

/// Credentials resolved before fork, applied after.
///
/// Name lookups allocate and may read `/etc/passwd`, so they must happen
/// in the parent; the `pre_exec` closure only performs raw syscalls.
struct Creds {
    uid: Uid,
    gid: Gid,
    groups: Vec<Gid>,
}

fn resolve_creds(svc: &Svc) -> io::Result<Option<Creds>> {
    let Some(user) = &svc.user else { return Ok(None) };

    let pw = User::from_name(user)?
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no user '{user}'")))?;

    let gid = match &svc.group {
        Some(g) => Group::from_name(g)?
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no group '{g}'")))?
            .gid,
        None => pw.gid,
    };

    Ok(Some(Creds {
        uid: pw.uid,
        gid,
        groups: vec![gid],
    }))
}

fn rlimit_values(rule: &RlimitRule) -> (u64, u64) {
    let v = rule.limit.unwrap_or(nix::sys::resource::RLIM_INFINITY);
    match rule.scope {
        RlimitScope::Soft => (v, nix::sys::resource::RLIM_INFINITY),
        RlimitScope::Hard | RlimitScope::Both => (v, v),
    }
}

/// The real fork/exec implementation.
#[derive(Default)]
pub struct ProcessLauncher;

impl Spawner for ProcessLauncher {
    fn spawn(&mut self, svc: &Svc) -> Result<i32, InitError> {
        let ident = svc.ident.to_string();
        let creds = resolve_creds(svc).map_err(|source| InitError::Launch {
            ident: ident.clone(),
            source,
        })?;
        let rlimits: Vec<(Resource, u64, u64)> = svc
            .rlimits
            .iter()
            .map(|r| {
                let (soft, hard) = rlimit_values(r);
                (r.resource, soft, hard)
            })
            .collect();

        let mut args = svc.args.clone();
        if let Some(tty) = &svc.tty {
            // Resolve @console and bare device names; refuse to spawn a
            // getty on something that is not a character device yet.
            let dev = crate::tty::canonicalize(&tty.dev)
                .filter(|d| crate::tty::usable(d))
                .ok_or_else(|| InitError::Launch {
                    ident: ident.clone(),
                    source: io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("tty '{}' not usable", tty.dev),
                    ),
                })?;
            if let Some(first) = args.first_mut() {
                *first = dev.to_string_lossy().into_owned();
            }
        }

        let mut cmd = Command::new(&svc.cmd);
        cmd.args(&args)
            .envs(svc.env.iter().cloned())
            .current_dir("/")
            .stdin(Stdio::null());

        // Only async-signal-safe syscalls below; all allocation (the
        // credential lookup, the rlimit table) happened in the parent.
        let child_setup = move || -> io::Result<()> {
            nix::unistd::setsid().map_err(io::Error::from)?;

            for sig in Signal::iterator() {
                // SIGKILL/SIGSTOP dispositions cannot be changed.
                if matches!(sig, Signal::SIGKILL | Signal::SIGSTOP) {
                    continue;
                }
                // SAFETY: resetting to SIG_DFL between fork and exec.
                let _ = unsafe {
                    nix::sys::signal::signal(sig, nix::sys::signal::SigHandler::SigDfl)
                };
            }

            for fd in 3..=255 {
                let _ = nix::unistd::close(fd);
            }

            for (res, soft, hard) in &rlimits {
                setrlimit(*res, *soft, *hard).map_err(io::Error::from)?;
            }

            if let Some(c) = &creds {
                nix::unistd::setgroups(&c.groups).map_err(io::Error::from)?;
                nix::unistd::setgid(c.gid).map_err(io::Error::from)?;
                nix::unistd::setuid(c.uid).map_err(io::Error::from)?;
            }

            Ok(())
        };
        // SAFETY: the closure is fork-safe, see above.
        unsafe {
            cmd.pre_exec(child_setup);
        }

        let child = cmd.spawn().map_err(|source| {
            // EAGAIN/ENOMEM from the clone itself means the process table
            // is in trouble, not this record.
            if matches!(
                source.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::OutOfMemory
            ) {
                InitError::Fork { source }
            } else {
                InitError::Launch {
                    ident: ident.clone(),
                    source,
                }
            }
        })?;

        Ok(child.id() as i32)
    }

    fn kill(&mut self, pid: i32, sig: Signal) {
        if pid <= 1 {
            return;
        }
        if let Err(e) = kill(Pid::from_raw(pid), sig) {
            if e != nix::errno::Errno::ESRCH {
                warn!("kill -{sig} {pid}: {e}");
            }
        }
    }
}

/// Spawns the emergency shell on the console. Never supervised: the shell
/// is reaped by the generic SIGCHLD path and may be respawned by the
/// caller. pid 1 itself never exits.
pub fn emergency_shell(shell: &Path, console: &Path) -> Result<i32, InitError> {
    let open = |p: &Path| {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(p)
            .map_err(|source| InitError::Console {
                path: p.to_path_buf(),
                source,
            })
    };
    let stdin = open(console)?;
    let stdout = stdin.try_clone().map_err(|source| InitError::Console {
        path: console.to_path_buf(),
        source,
    })?;
    let stderr = stdout.try_clone().map_err(|source| InitError::Console {
        path: console.to_path_buf(),
        source,
    })?;

    info!("starting emergency shell {}", shell.display());
    let child = Command::new(shell)
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .spawn()
        .map_err(|source| InitError::Fork { source })?;

    Ok(child.id() as i32)
}

#[cfg(test)]
pub mod testing {
    //! Recording spawner for FSM tests.

    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    pub enum SpawnCall {
        Spawn(String),
        Kill(i32, Signal),
    }

    /// Hands out sequential fake pids and records every call.
    #[derive(Default)]
    pub struct FakeSpawner {
        pub calls: Vec<SpawnCall>,
        pub next_pid: i32,
        /// Identities whose spawn should fail.
        pub fail: Vec<String>,
    }

    impl FakeSpawner {
        pub fn new() -> Self {
            Self {
                calls: Vec::new(),
                next_pid: 100,
                fail: Vec::new(),
            }
        }

        pub fn spawned(&self) -> Vec<&str> {
            self.calls
                .iter()
                .filter_map(|c| match c {
                    SpawnCall::Spawn(ident) => Some(ident.as_str()),
                    _ => None,
                })
                .collect()
        }

        pub fn killed(&self) -> Vec<(i32, Signal)> {
            self.calls
                .iter()
                .filter_map(|c| match c {
                    SpawnCall::Kill(pid, sig) => Some((*pid, *sig)),
                    _ => None,
                })
                .collect()
        }
    }

    impl Spawner for FakeSpawner {
        fn spawn(&mut self, svc: &Svc) -> Result<i32, InitError> {
            let ident = svc.ident.to_string();
            self.calls.push(SpawnCall::Spawn(ident.clone()));
            if self.fail.contains(&ident) {
                return Err(InitError::Launch {
                    ident,
                    source: io::Error::new(io::ErrorKind::NotFound, "exec failed"),
                });
            }
            self.next_pid += 1;
            Ok(self.next_pid)
        }

        fn kill(&mut self, pid: i32, sig: Signal) {
            self.calls.push(SpawnCall::Kill(pid, sig));
        }
    }
}
