//! # Supervisor core: the per-record state machine and `step_all`.
//!
//! [`Core`] owns the registry, the condition store, the timer wheel and
//! the [`Spawner`] seam. Every input handler (signal, FIFO command,
//! plugin I/O, timer) mutates state through it and then calls
//! [`Core::step_all`], the single reconciliation point.
//!
//! # High-level architecture
//!
//! ```text
//!  signals ──┐
//!  FIFO ─────┤                     ┌──────────────┐
//!  plugins ──┼──► mutate state ──► │   step_all   │──► fixed point
//!  timers ───┘                     └──────┬───────┘
//!                                    one edge per
//!                                    record per pass
//! ```
//!
//! `step_all` iterates every record until a full pass produces no edges.
//! Each edge either advances a record around the
//! `halted → setup → starting → running → stopping → halted` cycle or is
//! a no-op, so the loop terminates; oscillation is bounded by the respawn
//! limiter and its timers.

use std::fs;
use std::path::Path;
use std::time::Instant;

use log::{debug, error, info, warn};

use crate::cond::{CondState, CondStore};
use crate::config::Config;
use crate::events::{Bus, Event, EventKind};
use crate::launch::Spawner;
use crate::plugins::HookPoint;
use crate::svc::registry::Registry;
use crate::svc::{Dirty, Ident, Svc, SvcKind, SvcState};
use crate::timers::{TimerEvent, Timers};

/// Bitmask restricting a `step_all` pass to some record kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KindMask(u8);

impl KindMask {
    pub const SERVICE: KindMask = KindMask(1 << 0);
    pub const TASK: KindMask = KindMask(1 << 1);
    pub const RUN: KindMask = KindMask(1 << 2);
    pub const INETD: KindMask = KindMask(1 << 3);
    pub const TTY: KindMask = KindMask(1 << 4);
    pub const SYSV: KindMask = KindMask(1 << 5);
    pub const RUNTASK: KindMask = KindMask(Self::TASK.0 | Self::RUN.0);
    pub const ALL: KindMask = KindMask(0x3f);

    pub fn contains(&self, kind: SvcKind) -> bool {
        let bit = match kind {
            SvcKind::Service => Self::SERVICE.0,
            SvcKind::Task => Self::TASK.0,
            SvcKind::Run => Self::RUN.0,
            SvcKind::Inetd => Self::INETD.0,
            SvcKind::Tty => Self::TTY.0,
            SvcKind::Sysv => Self::SYSV.0,
        };
        self.0 & bit != 0
    }
}

impl std::ops::BitOr for KindMask {
    type Output = KindMask;
    fn bitor(self, rhs: KindMask) -> KindMask {
        KindMask(self.0 | rhs.0)
    }
}

/// How the system goes down once every record is halted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownKind {
    Halt,
    PowerOff,
    Reboot,
}

/// Outcome of evaluating a record's gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Gate {
    /// Eligible to run.
    Pass,
    /// A condition is FLUX: block start, keep a running record paused.
    Paused,
    /// Eligible by runlevel, but a condition is OFF or undeclared.
    CondBlocked,
    /// Not eligible at all: runlevel, operator stop, or pending removal.
    Off,
}

/// Process-wide supervisor state. One per init; tests build isolated
/// instances around a fake [`Spawner`].
pub struct Core<S: Spawner> {
    pub cfg: Config,
    pub registry: Registry,
    pub conds: CondStore,
    pub timers: Timers,
    pub bus: Bus,
    pub spawner: S,
    pub runlevel: u8,
    pub prevlevel: u8,
    pub shutdown: Option<ShutdownKind>,
    /// Hook points queued by edges, drained by the plugin dispatcher.
    pub pending_hooks: Vec<(HookPoint, Option<Ident>)>,
    /// Set when a fatal launch error demands the emergency fallback.
    pub fatal: bool,
}

impl<S: Spawner> Core<S> {
    pub fn new(cfg: Config, conds: CondStore, bus: Bus, spawner: S) -> Self {
        Self {
            cfg,
            registry: Registry::new(),
            conds,
            timers: Timers::new(),
            bus,
            spawner,
            runlevel: crate::svc::RUNLEVEL_S,
            prevlevel: crate::svc::RUNLEVEL_S,
            shutdown: None,
            pending_hooks: Vec::new(),
            fatal: false,
        }
    }

    // ---- gate -----------------------------------------------------------

    fn eval_gate(&self, svc: &Svc) -> Gate {
        if svc.blocked || svc.dirty == Dirty::Removed {
            return Gate::Off;
        }
        if !svc.runlevels.contains(self.runlevel) {
            return Gate::Off;
        }

        let mut paused = false;
        for cond in &svc.conds {
            match self.conds.get(cond) {
                None | Some(CondState::Off) => return Gate::CondBlocked,
                Some(CondState::Flux) => paused = true,
                Some(CondState::On) => {}
            }
        }
        if paused {
            Gate::Paused
        } else {
            Gate::Pass
        }
    }

    /// One-shots latch after completing in the current runlevel.
    fn latched(&self, svc: &Svc) -> bool {
        svc.is_oneshot() && svc.ran_level == Some(self.runlevel)
    }

    // ---- driver ---------------------------------------------------------

    /// Advances every record matching `mask` until a full pass produces no
    /// edges. The single reconciliation point; all handlers funnel here.
    pub fn step_all(&mut self, mask: KindMask) {
        // Termination backstop; one cycle through the FSM is at most 8
        // edges so this is never reached by a well-behaved table.
        let max_passes = (self.registry.len() + 1) * 16;
        let mut passes = 0;

        loop {
            let mut edges = false;
            let mut run_gate_closed = false;

            for ident in self.registry.idents() {
                let Some(svc) = self.registry.find(&ident) else { continue };
                if !mask.contains(svc.ident.kind) {
                    continue;
                }
                // An in-flight `run` serializes later run/task records.
                if run_gate_closed && svc.is_oneshot() {
                    continue;
                }

                edges |= self.step_one(&ident);

                if let Some(svc) = self.registry.find(&ident) {
                    if svc.ident.kind == SvcKind::Run && svc.is_starting() {
                        run_gate_closed = true;
                    }
                }
            }

            self.conds.flush_pending();

            if !edges {
                break;
            }
            passes += 1;
            if passes > max_passes {
                warn!("step_all did not reach a fixed point after {passes} passes");
                break;
            }
        }
    }

    /// Computes the next state for one record and takes at most one edge.
    /// Returns `true` if an edge fired.
    fn step_one(&mut self, ident: &Ident) -> bool {
        let Some(svc) = self.registry.find(ident) else { return false };
        let state = svc.state;
        let gate = self.eval_gate(svc);

        match state {
            SvcState::Halted => self.step_halted(ident, gate),
            SvcState::Conditional => self.step_conditional(ident, gate),
            SvcState::Setup => self.step_setup(ident, gate),
            SvcState::Starting => self.step_starting(ident, gate),
            SvcState::Running => self.step_running(ident, gate),
            SvcState::Stopping | SvcState::Halting => self.step_reaped(ident),
            SvcState::Crashed => self.step_crashed(ident, gate),
        }
    }

    fn step_halted(&mut self, ident: &Ident, gate: Gate) -> bool {
        let svc = self.registry.find_mut(ident).unwrap();
        svc.exited = None;

        if self.latched(self.registry.find(ident).unwrap()) {
            // A task's once-per-window latch releases when its window
            // closes; a `run` latch holds for the whole runlevel.
            let svc = self.registry.find_mut(ident).unwrap();
            if svc.ident.kind == SvcKind::Task && gate != Gate::Pass {
                svc.ran_level = None;
            }
            return false;
        }

        match gate {
            Gate::Pass => {
                self.registry.find_mut(ident).unwrap().state = SvcState::Setup;
                true
            }
            Gate::Paused | Gate::CondBlocked => {
                self.registry.find_mut(ident).unwrap().state = SvcState::Conditional;
                true
            }
            Gate::Off => false,
        }
    }

    fn step_conditional(&mut self, ident: &Ident, gate: Gate) -> bool {
        match gate {
            Gate::Pass => {
                self.registry.find_mut(ident).unwrap().state = SvcState::Setup;
                true
            }
            Gate::Off => {
                self.registry.find_mut(ident).unwrap().state = SvcState::Halted;
                true
            }
            Gate::Paused | Gate::CondBlocked => false,
        }
    }

    fn step_setup(&mut self, ident: &Ident, gate: Gate) -> bool {
        if gate != Gate::Pass {
            // Start cancelled before fork.
            self.registry.find_mut(ident).unwrap().state = SvcState::Conditional;
            return true;
        }

        self.pending_hooks.push((HookPoint::SvcStart, Some(ident.clone())));

        let svc = self.registry.find_mut(ident).unwrap();
        svc.dirty = Dirty::Clean;

        if svc.ident.kind == SvcKind::Inetd {
            svc.state = SvcState::Running;
            let name = svc.cond_name();
            self.conds.set(&name);
            self.bus
                .publish(Event::now(EventKind::SvcRunning).with_svc(ident.to_string()));
            return true;
        }

        let snapshot = svc.clone();
        match self.spawner.spawn(&snapshot) {
            Ok(pid) => {
                self.registry.set_pid(ident, pid);
                let svc = self.registry.find_mut(ident).unwrap();
                svc.state = SvcState::Starting;
                if svc.is_forking() {
                    self.timers
                        .arm(self.cfg.pidfile_timeout, TimerEvent::PidfileTimeout(ident.clone()));
                }
                self.bus.publish(
                    Event::now(EventKind::SvcStarting)
                        .with_svc(ident.to_string())
                        .with_pid(pid),
                );
                true
            }
            Err(e) => {
                error!("{}: {e}", e.as_label());
                if e.is_fatal() {
                    self.fatal = true;
                }
                self.bus.publish(
                    Event::now(EventKind::SvcCrashed)
                        .with_svc(ident.to_string())
                        .with_error(e.to_string()),
                );
                self.enter_crashed(ident);
                true
            }
        }
    }

    fn step_starting(&mut self, ident: &Ident, gate: Gate) -> bool {
        let svc = self.registry.find(ident).unwrap();
        let forking = svc.is_forking();
        let oneshot = svc.is_oneshot();
        let kind = svc.ident.kind;
        let pid = svc.pid;

        if let Some(clean) = svc.exited {
            if forking {
                // The launcher daemonized and exited; adoption happens via
                // the pidfile condition, failure via the pidfile timer.
                self.registry.find_mut(ident).unwrap().exited = None;
                return false;
            }
            if oneshot {
                return self.finish_oneshot(ident, clean);
            }
            // Died before ever reaching running.
            self.bus.publish(
                Event::now(EventKind::SvcCrashed)
                    .with_svc(ident.to_string())
                    .with_error("exited during startup"),
            );
            self.registry.find_mut(ident).unwrap().exited = None;
            self.enter_crashed(ident);
            return true;
        }

        if matches!(gate, Gate::Off | Gate::CondBlocked) {
            if pid != 0 {
                return self.enter_stopping(ident);
            }
            self.registry.find_mut(ident).unwrap().state = SvcState::Halted;
            return true;
        }

        if forking {
            let pid_cond = svc.pid_cond_name();
            if self.conds.get(&pid_cond) == Some(CondState::On) {
                let pidfile = svc.pidfile.clone().unwrap();
                match read_pidfile(&pidfile) {
                    Some(daemon_pid) => {
                        self.registry.set_pid(ident, daemon_pid);
                        self.bus.publish(
                            Event::now(EventKind::PidAdopted)
                                .with_svc(ident.to_string())
                                .with_pid(daemon_pid),
                        );
                        return self.enter_running(ident);
                    }
                    None => {
                        debug!("{ident}: pidfile {} not readable yet", pidfile.display());
                        return false;
                    }
                }
            }
            return false;
        }

        if oneshot {
            // Runs to completion; the reaper moves it on.
            return false;
        }

        match kind {
            SvcKind::Service | SvcKind::Tty | SvcKind::Sysv => self.enter_running(ident),
            _ => false,
        }
    }

    fn step_running(&mut self, ident: &Ident, gate: Gate) -> bool {
        let svc = self.registry.find(ident).unwrap();
        let oneshot = svc.is_oneshot();

        if let Some(clean) = svc.exited {
            let name = svc.cond_name();
            self.conds.clear(&name);
            if oneshot {
                return self.finish_oneshot(ident, clean);
            }
            if matches!(gate, Gate::Off | Gate::CondBlocked) {
                // It stopped exactly when we wanted it stopped.
                let svc = self.registry.find_mut(ident).unwrap();
                svc.exited = None;
                svc.state = SvcState::Halted;
                self.bus
                    .publish(Event::now(EventKind::SvcStopped).with_svc(ident.to_string()));
                return true;
            }
            self.bus.publish(
                Event::now(EventKind::SvcCrashed)
                    .with_svc(ident.to_string())
                    .with_error(if clean { "exited" } else { "killed" }),
            );
            self.registry.find_mut(ident).unwrap().exited = None;
            self.enter_crashed(ident);
            return true;
        }

        if matches!(gate, Gate::Off | Gate::CondBlocked) {
            return self.enter_stopping(ident);
        }

        if self.registry.find(ident).unwrap().dirty == Dirty::Changed {
            // Changed this reconf: restart through the normal stop path.
            return self.enter_stopping(ident);
        }

        // Gate::Paused keeps the record exactly where it is.
        false
    }

    fn step_reaped(&mut self, ident: &Ident) -> bool {
        let svc = self.registry.find_mut(ident).unwrap();
        if svc.exited.is_some() {
            svc.exited = None;
            svc.state = SvcState::Halted;
            self.bus
                .publish(Event::now(EventKind::SvcStopped).with_svc(ident.to_string()));
            return true;
        }
        false
    }

    fn step_crashed(&mut self, ident: &Ident, gate: Gate) -> bool {
        if matches!(gate, Gate::Off | Gate::CondBlocked) {
            // Gate toggled: the record gets a fresh budget.
            let svc = self.registry.find_mut(ident).unwrap();
            svc.respawn_state.reset();
            svc.state = SvcState::Halted;
            return true;
        }
        // Timers drive cooldown and window expiry.
        false
    }

    // ---- shared edges ---------------------------------------------------

    fn enter_running(&mut self, ident: &Ident) -> bool {
        let svc = self.registry.find_mut(ident).unwrap();
        svc.state = SvcState::Running;
        let pid = svc.pid;
        let oneshot = svc.is_oneshot();
        let name = svc.cond_name();
        // Task/run readiness is posted on successful completion, not on
        // process start.
        if !oneshot {
            self.conds.set(&name);
        }
        self.bus.publish(
            Event::now(EventKind::SvcRunning)
                .with_svc(ident.to_string())
                .with_pid(pid),
        );
        true
    }

    fn enter_stopping(&mut self, ident: &Ident) -> bool {
        let svc = self.registry.find(ident).unwrap();
        let pid = svc.pid;
        let sig = svc.stop_signal();
        let name = svc.cond_name();
        let kind = svc.ident.kind;

        if kind == SvcKind::Inetd {
            // No process to signal; closing the listener is the glue's job
            // once it sees the state change.
            self.conds.clear(&name);
            let svc = self.registry.find_mut(ident).unwrap();
            svc.state = SvcState::Halted;
            self.bus
                .publish(Event::now(EventKind::SvcStopped).with_svc(ident.to_string()));
            return true;
        }

        self.conds.clear(&name);
        self.pending_hooks.push((HookPoint::SvcStop, Some(ident.clone())));

        if pid == 0 {
            let svc = self.registry.find_mut(ident).unwrap();
            svc.state = SvcState::Halted;
            return true;
        }

        if kind == SvcKind::Sysv {
            // SysV scripts get their own stop action; the pid (if any) is
            // still TERM'd below so the kill timer applies.
            let mut stop = self.registry.find(ident).unwrap().clone();
            stop.args = vec!["stop".into()];
            if let Err(e) = self.spawner.spawn(&stop) {
                warn!("{ident}: stop script: {e}");
            }
        }

        self.spawner.kill(pid, sig);
        let svc = self.registry.find_mut(ident).unwrap();
        if sig == nix::sys::signal::Signal::SIGKILL {
            svc.state = SvcState::Halting;
        } else {
            svc.state = SvcState::Stopping;
            self.timers
                .arm(self.cfg.kill_grace, TimerEvent::KillTimeout(ident.clone()));
        }
        self.bus
            .publish(Event::now(EventKind::SvcStopping).with_svc(ident.to_string()));
        true
    }

    fn enter_crashed(&mut self, ident: &Ident) {
        let now = Instant::now();
        let svc = self.registry.find_mut(ident).unwrap();
        let policy = svc.respawn;
        let count = svc.respawn_state.register_exit(&policy, now);
        svc.state = SvcState::Crashed;

        if svc.respawn_state.exhausted(&policy, now) {
            if svc.ident.kind == SvcKind::Tty {
                warn!("{ident}: getty respawning too fast, holding off");
            }
            self.timers
                .arm(policy.window, TimerEvent::CrashWindowOver(ident.clone()));
            self.bus
                .publish(Event::now(EventKind::RespawnExhausted).with_svc(ident.to_string()));
        } else {
            debug!("{ident}: exit {count}/{} in window", policy.limit);
            self.timers
                .arm(policy.cooldown, TimerEvent::RespawnDue(ident.clone()));
            self.bus.publish(
                Event::now(EventKind::RespawnScheduled)
                    .with_svc(ident.to_string())
                    .with_delay(policy.cooldown),
            );
        }
    }

    /// Completes a task/run: latch, post or clear its readiness condition.
    fn finish_oneshot(&mut self, ident: &Ident, clean: bool) -> bool {
        let level = self.runlevel;
        let svc = self.registry.find_mut(ident).unwrap();
        svc.exited = None;
        svc.state = SvcState::Halted;
        svc.ran_level = Some(level);
        svc.last_exit_ok = clean;
        let name = svc.cond_name();

        if clean {
            self.conds.set(&name);
            self.bus
                .publish(Event::now(EventKind::SvcStopped).with_svc(ident.to_string()));
        } else {
            self.conds.clear(&name);
            self.bus.publish(
                Event::now(EventKind::SvcCrashed)
                    .with_svc(ident.to_string())
                    .with_error("task failed"),
            );
        }
        true
    }

    // ---- inputs ---------------------------------------------------------

    /// Reaper entry: records the exit and lets `step_all` move the record.
    /// Returns `false` for unmanaged pids (orphans are just reaped).
    pub fn handle_exit(&mut self, pid: i32, clean: bool) -> bool {
        let Some(ident) = self.registry.ident_by_pid(pid) else {
            debug!("reaped orphan {pid}");
            return false;
        };
        self.registry.set_pid(&ident, 0);
        if let Some(svc) = self.registry.find_mut(&ident) {
            svc.exited = Some(clean);
        }
        true
    }

    /// Validates and applies one fired timer. Stale timers are no-ops.
    pub fn handle_timer(&mut self, ev: TimerEvent) {
        match ev {
            TimerEvent::KillTimeout(ident) => {
                let Some(svc) = self.registry.find(&ident) else { return };
                if svc.state == SvcState::Stopping && svc.pid != 0 {
                    info!("{ident}: stop grace expired, sending SIGKILL");
                    let pid = svc.pid;
                    self.spawner.kill(pid, nix::sys::signal::Signal::SIGKILL);
                    self.registry.find_mut(&ident).unwrap().state = SvcState::Halting;
                }
            }
            TimerEvent::RespawnDue(ident) => {
                let now = Instant::now();
                let Some(svc) = self.registry.find_mut(&ident) else { return };
                let policy = svc.respawn;
                if svc.state == SvcState::Crashed && !svc.respawn_state.exhausted(&policy, now) {
                    svc.state = SvcState::Halted;
                }
            }
            TimerEvent::CrashWindowOver(ident) => {
                let Some(svc) = self.registry.find_mut(&ident) else { return };
                if svc.state == SvcState::Crashed {
                    svc.respawn_state.reset();
                    svc.state = SvcState::Halted;
                }
            }
            TimerEvent::PidfileTimeout(ident) => {
                let Some(svc) = self.registry.find(&ident) else { return };
                let pid_cond = svc.pid_cond_name();
                if svc.state == SvcState::Starting
                    && svc.is_forking()
                    && self.conds.get(&pid_cond) != Some(CondState::On)
                {
                    warn!("{ident}: pidfile never appeared");
                    if svc.pid != 0 {
                        let pid = svc.pid;
                        self.spawner.kill(pid, nix::sys::signal::Signal::SIGTERM);
                        self.registry.set_pid(&ident, 0);
                    }
                    self.bus.publish(
                        Event::now(EventKind::SvcCrashed)
                            .with_svc(ident.to_string())
                            .with_error("pidfile timeout"),
                    );
                    self.enter_crashed(&ident);
                }
            }
            TimerEvent::Step => {}
        }
    }

    /// Fires every timer due at `now`, then reconciles.
    pub fn run_timers(&mut self, now: Instant) {
        let due = self.timers.pop_due(now);
        if due.is_empty() {
            return;
        }
        for ev in due {
            self.handle_timer(ev);
        }
        self.step_all(KindMask::ALL);
    }

    // ---- operator commands ---------------------------------------------

    pub fn op_start(&mut self, spec: &str) -> Result<(), crate::error::InitError> {
        let ident = self.ident_for(spec)?;
        let svc = self.registry.find_mut(&ident).unwrap();
        svc.blocked = false;
        svc.ran_level = None;
        self.step_all(KindMask::ALL);
        Ok(())
    }

    pub fn op_stop(&mut self, spec: &str) -> Result<(), crate::error::InitError> {
        let ident = self.ident_for(spec)?;
        self.registry.find_mut(&ident).unwrap().blocked = true;
        self.step_all(KindMask::ALL);
        Ok(())
    }

    pub fn op_restart(&mut self, spec: &str) -> Result<(), crate::error::InitError> {
        let ident = self.ident_for(spec)?;
        let svc = self.registry.find_mut(&ident).unwrap();
        svc.blocked = false;
        svc.dirty = Dirty::Changed;
        svc.ran_level = None;
        self.step_all(KindMask::ALL);
        Ok(())
    }

    fn ident_for(&self, spec: &str) -> Result<Ident, crate::error::InitError> {
        self.registry
            .find_by_name(spec)
            .map(|s| s.ident.clone())
            .ok_or_else(|| crate::error::InitError::UnknownService {
                ident: spec.to_string(),
            })
    }

    /// Changes the current runlevel. 0 halts, 6 reboots; the transition
    /// itself only moves the gate.
    pub fn runlevel_set(&mut self, level: u8) {
        if level == self.runlevel {
            return;
        }
        self.prevlevel = self.runlevel;
        self.runlevel = level;
        let down = match level {
            0 => Some(ShutdownKind::Halt),
            6 => Some(ShutdownKind::Reboot),
            _ => None,
        };
        if let Some(kind) = down {
            if self.shutdown.is_none() {
                self.bus.publish(Event::now(EventKind::ShutdownRequested));
            }
            self.shutdown = Some(kind);
        }
        info!("runlevel {} -> {}", display_level(self.prevlevel), display_level(level));
        self.bus
            .publish(Event::now(EventKind::RunlevelChanged).with_level(level));
        self.step_all(KindMask::ALL);
    }

    // ---- reload ---------------------------------------------------------

    /// Applies a successfully parsed record set. The caller parses first;
    /// a parse error must leave the previous generation untouched, so
    /// nothing here runs in that case.
    pub fn apply_records(&mut self, records: Vec<Svc>) {
        self.bus.publish(Event::now(EventKind::ReloadStarted));
        self.conds.begin_reload();
        self.registry.mark_all_dirty();
        for rec in records {
            self.registry.apply(rec);
        }
        self.registry.sweep_dirty();
        self.pending_hooks.push((HookPoint::SvcReconf, None));
    }

    /// Ends the reload cycle after SvcReconf re-asserted live conditions.
    pub fn finish_reload(&mut self) {
        self.reassert_conds();
        // Hook oneshots already fired this boot; they are not reality the
        // watchers can re-observe.
        self.conds.reassert_prefix("hook/");
        self.conds.finish_reload();
        self.bus.publish(Event::now(EventKind::ReloadDone));
        self.step_all(KindMask::ALL);
    }

    /// Re-asserts `service/<identity>` for every record currently running
    /// and not changed by this reconf, without triggering restarts.
    pub fn reassert_conds(&mut self) {
        for ident in self.registry.idents() {
            let Some(svc) = self.registry.find(&ident) else { continue };
            if svc.state != SvcState::Running || svc.is_changed() || svc.is_starting() {
                continue;
            }
            let name = svc.cond_name();
            self.conds.set(&name);
        }
    }

    // ---- status ---------------------------------------------------------

    /// Text rendered for `initctl status`.
    pub fn status_text(&self, spec: Option<&str>) -> String {
        let mut out = format!(
            "runlevel {} (prev {})\n",
            display_level(self.runlevel),
            display_level(self.prevlevel)
        );
        for svc in self.registry.iter() {
            if let Some(spec) = spec {
                if self.registry.find_by_name(spec).map(|s| &s.ident) != Some(&svc.ident) {
                    continue;
                }
            }
            out.push_str(&format!(
                "{:<7} {:<20} {:<11} {:>7} [{}] {}\n",
                svc.ident.kind.as_str(),
                svc.ident.to_string(),
                svc.state.as_str(),
                svc.pid,
                svc.runlevels,
                svc.cmd.display(),
            ));
        }
        out
    }
}

fn display_level(level: u8) -> String {
    if level == crate::svc::RUNLEVEL_S {
        "S".into()
    } else {
        level.to_string()
    }
}

/// Reads a pid from a pidfile, tolerating trailing junk.
pub fn read_pidfile(path: &Path) -> Option<i32> {
    let content = fs::read_to_string(path).ok()?;
    let pid: i32 = content.split_whitespace().next()?.parse().ok()?;
    (pid > 1).then_some(pid)
}
