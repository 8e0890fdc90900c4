//! # Service records.
//!
//! A [`Svc`] is one declarative entry describing a managed entity: a
//! long-running service, a one-shot task or run, an inetd-style listener,
//! a login terminal, or a sysv script. Records are created by the
//! configuration parser, updated in place on reload, and destroyed only
//! once removed from configuration and halted.
//!
//! Identity is `(kind, command basename, optional instance id)` and is
//! unique within the [`Registry`](crate::svc::registry::Registry).

pub mod registry;

use std::fmt;
use std::path::{Path, PathBuf};

use nix::sys::resource::Resource;

use crate::policy::{RespawnPolicy, RespawnState};

/// Runlevel used for system bootstrap, ordered after 9 in the bitmask.
pub const RUNLEVEL_S: u8 = 10;

/// Set of runlevels a record is allowed in, bits 0..=9 plus S.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Runlevels(u16);

impl Runlevels {
    /// Levels 2-5, the classic default for services.
    pub const DEFAULT: Runlevels = Runlevels(0b0011_1100);

    pub const fn empty() -> Self {
        Runlevels(0)
    }

    pub fn with(mut self, level: u8) -> Self {
        self.insert(level);
        self
    }

    pub fn insert(&mut self, level: u8) {
        if level <= RUNLEVEL_S {
            self.0 |= 1 << level;
        }
    }

    pub fn contains(&self, level: u8) -> bool {
        level <= RUNLEVEL_S && self.0 & (1 << level) != 0
    }

    /// Parses the `[2345S]` directive form (without the brackets).
    pub fn parse(s: &str) -> Option<Self> {
        let mut levels = Runlevels::empty();
        for ch in s.chars() {
            match ch {
                '0'..='9' => levels.insert(ch as u8 - b'0'),
                'S' | 's' => levels.insert(RUNLEVEL_S),
                _ => return None,
            }
        }
        Some(levels)
    }
}

impl fmt::Display for Runlevels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for lvl in 0..=9u8 {
            if self.contains(lvl) {
                write!(f, "{lvl}")?;
            }
        }
        if self.contains(RUNLEVEL_S) {
            write!(f, "S")?;
        }
        Ok(())
    }
}

/// What kind of entity a record describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SvcKind {
    /// Supervised daemon, respawned per policy.
    Service,
    /// Runs to completion once per gate-satisfying window.
    Task,
    /// Runs exactly once during its runlevel, in declaration order.
    Run,
    /// Listener held by the supervisor; children are only reaped.
    Inetd,
    /// Getty on a terminal; stopped with SIGKILL, no grace.
    Tty,
    /// SysV-style script invoked with `start`/`stop`.
    Sysv,
}

impl SvcKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SvcKind::Service => "service",
            SvcKind::Task => "task",
            SvcKind::Run => "run",
            SvcKind::Inetd => "inetd",
            SvcKind::Tty => "tty",
            SvcKind::Sysv => "sysv",
        }
    }
}

/// Unique identity of a record.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Ident {
    pub kind: SvcKind,
    pub name: String,
    pub id: Option<String>,
}

impl Ident {
    pub fn new(kind: SvcKind, cmd: &Path, id: Option<&str>) -> Self {
        let name = cmd
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| cmd.to_string_lossy().into_owned());
        Self {
            kind,
            name,
            id: id.map(str::to_string),
        }
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}:{}", self.name, id),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Per-record state machine position. Transitions fire only from
/// `step_all`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SvcState {
    /// Not running; may or may not be eligible.
    Halted,
    /// Eligible by runlevel but gated by a condition.
    Conditional,
    /// Transient: pre-start hook ran, launch is next.
    Setup,
    /// Fork/exec issued; awaiting readiness (pidfile for forking daemons).
    Starting,
    /// Process alive; readiness posted as `service/<ident>`.
    Running,
    /// SIGTERM sent; kill timer armed.
    Stopping,
    /// SIGKILL sent after timeout; awaiting reap.
    Halting,
    /// Exited abnormally; under respawn cooldown or parked.
    Crashed,
}

impl SvcState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SvcState::Halted => "halted",
            SvcState::Conditional => "conditional",
            SvcState::Setup => "setup",
            SvcState::Starting => "starting",
            SvcState::Running => "running",
            SvcState::Stopping => "stopping",
            SvcState::Halting => "halting",
            SvcState::Crashed => "crashed",
        }
    }

    /// States in which the record owns a live process at quiescence.
    pub fn has_process(&self) -> bool {
        matches!(self, SvcState::Running | SvcState::Stopping | SvcState::Halting)
    }
}

/// Reload bookkeeping for a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dirty {
    /// Attributes match the applied generation.
    Clean,
    /// Attributes changed this reconf; a transition is required.
    Changed,
    /// Not seen during the last reparse; stop and remove.
    Removed,
}

/// Scope of one resource-limit rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RlimitScope {
    Soft,
    Hard,
    Both,
}

/// One fork-time resource limit.
#[derive(Clone, Debug, PartialEq)]
pub struct RlimitRule {
    pub resource: Resource,
    pub scope: RlimitScope,
    /// `None` means unlimited.
    pub limit: Option<u64>,
}

/// Terminal settings for `tty` records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TtySettings {
    /// Device path, or `@console` for sysfs auto-detection.
    pub dev: String,
    pub baud: Option<String>,
    pub term: Option<String>,
}

/// One managed record.
#[derive(Clone, Debug)]
pub struct Svc {
    pub ident: Ident,
    pub cmd: PathBuf,
    pub args: Vec<String>,
    pub runlevels: Runlevels,
    /// Explicit pidfile; presence makes the record a forking daemon.
    pub pidfile: Option<PathBuf>,
    /// Start conditions; all must be ON for the gate to pass.
    pub conds: Vec<String>,
    pub respawn: RespawnPolicy,
    pub rlimits: Vec<RlimitRule>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub env: Vec<(String, String)>,
    pub tty: Option<TtySettings>,
    /// TCP port for inetd records.
    pub port: Option<u16>,

    // Runtime state below; never written by the parser.
    pub pid: i32,
    pub state: SvcState,
    pub dirty: Dirty,
    pub generation: u64,
    pub respawn_state: RespawnState,
    /// Stopped by an operator via initctl; excluded from the gate.
    pub blocked: bool,
    /// `run` records fire once per runlevel; this latches completion.
    pub ran_level: Option<u8>,
    /// Exit code of the last completed task/run, for `service/*` gating.
    pub last_exit_ok: bool,
    /// Set by the reaper when the process exits (`true` = clean exit);
    /// consumed by the next `step_all`.
    pub exited: Option<bool>,
}

impl Svc {
    pub fn new(ident: Ident, cmd: PathBuf, args: Vec<String>) -> Self {
        Self {
            ident,
            cmd,
            args,
            runlevels: Runlevels::DEFAULT,
            pidfile: None,
            conds: Vec::new(),
            respawn: RespawnPolicy::default(),
            rlimits: Vec::new(),
            user: None,
            group: None,
            env: Vec::new(),
            tty: None,
            port: None,
            pid: 0,
            state: SvcState::Halted,
            dirty: Dirty::Changed,
            generation: 0,
            respawn_state: RespawnState::default(),
            blocked: false,
            ran_level: None,
            last_exit_ok: false,
            exited: None,
        }
    }

    /// Forking daemons are adopted via their pidfile.
    pub fn is_forking(&self) -> bool {
        self.pidfile.is_some()
    }

    /// Synthetic condition mirroring this record's state.
    pub fn cond_name(&self) -> String {
        format!("service/{}", self.ident)
    }

    /// Condition owned by the pidfile watcher for this record.
    pub fn pid_cond_name(&self) -> String {
        format!("pid/{}", self.ident.name)
    }

    pub fn is_changed(&self) -> bool {
        self.dirty == Dirty::Changed
    }

    pub fn is_starting(&self) -> bool {
        matches!(self.state, SvcState::Setup | SvcState::Starting)
    }

    /// True for kinds driven through the one-shot path.
    pub fn is_oneshot(&self) -> bool {
        matches!(self.ident.kind, SvcKind::Task | SvcKind::Run)
    }

    /// Signal used to stop this record. TTYs get no grace period.
    pub fn stop_signal(&self) -> nix::sys::signal::Signal {
        match self.ident.kind {
            SvcKind::Tty => nix::sys::signal::Signal::SIGKILL,
            _ => nix::sys::signal::Signal::SIGTERM,
        }
    }

    /// Compares declarative attributes, ignoring runtime state.
    pub fn same_config(&self, other: &Svc) -> bool {
        self.cmd == other.cmd
            && self.args == other.args
            && self.runlevels == other.runlevels
            && self.pidfile == other.pidfile
            && self.conds == other.conds
            && self.respawn == other.respawn
            && self.rlimits == other.rlimits
            && self.user == other.user
            && self.group == other.group
            && self.env == other.env
            && self.tty == other.tty
            && self.port == other.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runlevel_parse_and_membership() {
        let levels = Runlevels::parse("2345").unwrap();
        assert!(levels.contains(2));
        assert!(levels.contains(5));
        assert!(!levels.contains(1));
        assert!(!levels.contains(RUNLEVEL_S));

        let boot = Runlevels::parse("S").unwrap();
        assert!(boot.contains(RUNLEVEL_S));
        assert!(!boot.contains(2));

        assert!(Runlevels::parse("2x").is_none());
        assert_eq!(Runlevels::parse("12S").unwrap().to_string(), "12S");
    }

    #[test]
    fn ident_display() {
        let plain = Ident::new(SvcKind::Service, Path::new("/sbin/sshd"), None);
        assert_eq!(plain.to_string(), "sshd");

        let inst = Ident::new(SvcKind::Service, Path::new("/sbin/sshd"), Some("2"));
        assert_eq!(inst.to_string(), "sshd:2");
        assert_ne!(plain, inst);
    }

    #[test]
    fn cond_names() {
        let svc = Svc::new(
            Ident::new(SvcKind::Service, Path::new("/usr/sbin/foo"), None),
            PathBuf::from("/usr/sbin/foo"),
            vec![],
        );
        assert_eq!(svc.cond_name(), "service/foo");
        assert_eq!(svc.pid_cond_name(), "pid/foo");
    }
}
