//! # Namespaced tri-state condition store.
//!
//! Conditions are the sole gating mechanism between records: a service may
//! start only when all of its start conditions are [`CondState::On`], must
//! stop when any is [`CondState::Off`], and is paused without teardown
//! while any is [`CondState::Flux`].
//!
//! Names are path-like and namespaced by their producer: `pid/*` (pidfile
//! watcher), `net/*` (netlink), `hook/*` (boot hook oneshots) and
//! `service/*` (synthetic, mirrors service state).
//!
//! # Persistence
//!
//! One file per condition under a single directory, so the store survives a
//! supervisor re-exec and is observable by other processes:
//!
//! ```text
//! <dir>/pid/sshd         "1\n"  ON
//! <dir>/net/iface/eth0   "0\n"  OFF
//! <dir>/hook/basefs-up   "1\n"  ON (oneshot)
//! <dir>/.generation      reload generation counter
//! ```
//!
//! `~\n` marks FLUX; absence means not-declared. Files are written to a
//! temp name and renamed so concurrent observers never see torn content.
//!
//! # Generations and reload
//!
//! [`CondStore::begin_reload`] bumps the generation: every condition still
//! tagged with the old generation reads back as FLUX ("on-going-off") until
//! a producer re-asserts it. [`CondStore::finish_reload`] clears whatever
//! is still stale. This is what keeps an unchanged running service from
//! bouncing across `initctl reload`.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::events::{Bus, Event, EventKind};

/// Tri-state value of one condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CondState {
    /// Satisfied; gated services may run.
    On,
    /// Unsatisfied; gated services must stop.
    Off,
    /// Transitory: blocks start but does not demand stop.
    Flux,
}

impl CondState {
    fn marker(self) -> &'static str {
        match self {
            CondState::On => "1\n",
            CondState::Off => "0\n",
            CondState::Flux => "~\n",
        }
    }

    fn from_content(s: &str) -> CondState {
        match s.trim_end() {
            "1" => CondState::On,
            "0" => CondState::Off,
            // Unknown content is read conservatively as FLUX.
            _ => CondState::Flux,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    state: CondState,
    generation: u64,
}

const GEN_FILE: &str = ".generation";

/// Condition store backed by one file per condition.
///
/// All mutation happens on the loop thread. Mutating operations return
/// `true` when the effective state changed, which is the caller's cue to
/// run `step_all`.
pub struct CondStore {
    dir: PathBuf,
    generation: u64,
    entries: HashMap<String, Entry>,
    /// Conditions whose file write failed; retried from `flush_pending`.
    pending: Vec<String>,
    bus: Bus,
}

impl CondStore {
    /// Opens (or creates) the store directory and rehydrates any condition
    /// files left by a previous incarnation of the supervisor.
    pub fn open(dir: impl Into<PathBuf>, bus: Bus) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let generation = match fs::read_to_string(dir.join(GEN_FILE)) {
            Ok(s) => s.trim().parse().unwrap_or(0),
            Err(_) => 0,
        };

        let mut store = Self {
            dir,
            generation,
            entries: HashMap::new(),
            pending: Vec::new(),
            bus,
        };
        store.rehydrate();
        Ok(store)
    }

    fn rehydrate(&mut self) {
        let mut stack = vec![self.dir.clone()];
        while let Some(d) = stack.pop() {
            let Ok(rd) = fs::read_dir(&d) else { continue };
            for ent in rd.flatten() {
                let path = ent.path();
                let name = ent.file_name();
                if name.to_string_lossy().starts_with('.') {
                    continue;
                }
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(content) = fs::read_to_string(&path) {
                    if let Ok(rel) = path.strip_prefix(&self.dir) {
                        let cond = rel.to_string_lossy().into_owned();
                        self.entries.insert(
                            cond,
                            Entry {
                                state: CondState::from_content(&content),
                                generation: self.generation,
                            },
                        );
                    }
                }
            }
        }
    }

    /// Current effective state, or `None` if the condition was never
    /// declared. Referencing a condition never creates one.
    ///
    /// An ON condition tagged with an older generation reads as FLUX: it
    /// was true before the reload and nobody has re-asserted it yet.
    pub fn get(&self, name: &str) -> Option<CondState> {
        let e = self.entries.get(name)?;
        match e.state {
            CondState::On if e.generation != self.generation => Some(CondState::Flux),
            s => Some(s),
        }
    }

    /// True if the condition has ever been declared.
    pub fn exists(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Asserts `name`. Idempotent; returns `true` when the effective state
    /// changed (the cue for `step_all`).
    pub fn set(&mut self, name: &str) -> bool {
        self.transition(name, CondState::On, EventKind::CondSet)
    }

    /// Deasserts `name`. Same trigger rule as [`CondStore::set`].
    pub fn clear(&mut self, name: &str) -> bool {
        self.transition(name, CondState::Off, EventKind::CondCleared)
    }

    /// Marks `name` transitory: gated services pause but are not torn down.
    pub fn flux(&mut self, name: &str) -> bool {
        self.transition(name, CondState::Flux, EventKind::CondFlux)
    }

    /// Asserts a hook-point condition. Oneshots have no `clear`
    /// counterpart; they are swept only by generation turnover.
    pub fn set_oneshot(&mut self, name: &str) -> bool {
        self.transition(name, CondState::On, EventKind::CondSet)
    }

    fn transition(&mut self, name: &str, to: CondState, kind: EventKind) -> bool {
        if !valid_name(name) {
            warn!("invalid condition name '{name}', ignoring");
            return false;
        }

        let before = self.get(name);
        self.entries.insert(
            name.to_string(),
            Entry {
                state: to,
                generation: self.generation,
            },
        );

        if let Err(e) = self.write_file(name, to) {
            // Retried on the next step_all; fatal handling at boot is the
            // caller's call.
            warn!("cond '{name}': {e}, queueing retry");
            self.pending.push(name.to_string());
        }

        let changed = before != Some(to);
        if changed {
            debug!("cond {name}: {:?} -> {:?}", before, to);
            self.bus.publish(Event::now(kind).with_cond(name));
        }
        changed
    }

    /// Retries condition files whose write previously failed.
    pub fn flush_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending);
        for name in pending {
            if let Some(e) = self.entries.get(&name) {
                let state = e.state;
                if let Err(err) = self.write_file(&name, state) {
                    warn!("cond '{name}': {err}, still pending");
                    self.pending.push(name);
                }
            }
        }
    }

    /// Starts a reload cycle: bumps the generation so every condition
    /// asserted before now reads as FLUX until re-asserted.
    pub fn begin_reload(&mut self) {
        self.generation += 1;
        if let Err(e) = self.write_gen() {
            warn!("cond generation: {e}");
        }
        debug!("cond store generation {}", self.generation);
    }

    /// Re-tags every asserted condition under `prefix` with the current
    /// generation, without clearing or re-observing it. Used for `hook/*`
    /// oneshots, which are boot facts rather than observable reality.
    pub fn reassert_prefix(&mut self, prefix: &str) {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(name, e)| name.starts_with(prefix) && e.state == CondState::On)
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            self.set(&name);
        }
    }

    /// Ends a reload cycle: any condition still tagged with an older
    /// generation was not re-asserted by reality and is cleared.
    ///
    /// Returns `true` if anything changed.
    pub fn finish_reload(&mut self) -> bool {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.generation != self.generation && e.state != CondState::Off)
            .map(|(k, _)| k.clone())
            .collect();

        let mut changed = false;
        for name in stale {
            changed |= self.clear(&name);
        }
        changed
    }

    /// Current reload generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Absolute path of the file backing `name`.
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn write_file(&self, name: &str, state: CondState) -> io::Result<()> {
        let path = self.path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        atomic_write(&path, state.marker())
    }

    fn write_gen(&self) -> io::Result<()> {
        atomic_write(&self.dir.join(GEN_FILE), &format!("{}\n", self.generation))
    }
}

/// Write-temp + rename so concurrent readers never see torn content.
fn atomic_write(path: &Path, content: &str) -> io::Result<()> {
    let tmp = match (path.parent(), path.file_name()) {
        (Some(dir), Some(name)) => dir.join(format!(".{}.tmp", name.to_string_lossy())),
        _ => return Err(io::Error::new(io::ErrorKind::InvalidInput, "bad cond path")),
    };
    let mut f = fs::File::create(&tmp)?;
    f.write_all(content.as_bytes())?;
    fs::rename(&tmp, path)
}

/// Condition names are relative path-like strings; dot components and
/// traversal are rejected.
fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('/')
        && !name.ends_with('/')
        && name
            .split('/')
            .all(|c| !c.is_empty() && !c.starts_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, CondStore) {
        let dir = tempfile::tempdir().unwrap();
        let cs = CondStore::open(dir.path().join("cond"), Bus::new(16)).unwrap();
        (dir, cs)
    }

    #[test]
    fn set_clear_roundtrip() {
        let (_d, mut cs) = store();

        assert_eq!(cs.get("net/iface/lo"), None);
        assert!(cs.set("net/iface/lo"));
        assert_eq!(cs.get("net/iface/lo"), Some(CondState::On));
        // Idempotent.
        assert!(!cs.set("net/iface/lo"));

        assert!(cs.clear("net/iface/lo"));
        assert_eq!(cs.get("net/iface/lo"), Some(CondState::Off));
        assert!(cs.exists("net/iface/lo"));
    }

    #[test]
    fn files_follow_state() {
        let (_d, mut cs) = store();

        cs.set("pid/sshd");
        assert_eq!(fs::read_to_string(cs.path("pid/sshd")).unwrap(), "1\n");

        cs.flux("pid/sshd");
        assert_eq!(fs::read_to_string(cs.path("pid/sshd")).unwrap(), "~\n");

        cs.clear("pid/sshd");
        assert_eq!(fs::read_to_string(cs.path("pid/sshd")).unwrap(), "0\n");
    }

    #[test]
    fn reload_generation_flux_then_sweep() {
        let (_d, mut cs) = store();

        cs.set("pid/sshd");
        cs.set("net/iface/eth0");

        cs.begin_reload();
        // Not re-asserted yet: on-going-off.
        assert_eq!(cs.get("pid/sshd"), Some(CondState::Flux));
        assert_eq!(cs.get("net/iface/eth0"), Some(CondState::Flux));

        // Reality re-asserts one of them.
        assert!(cs.set("pid/sshd"));
        assert_eq!(cs.get("pid/sshd"), Some(CondState::On));

        cs.finish_reload();
        assert_eq!(cs.get("pid/sshd"), Some(CondState::On));
        assert_eq!(cs.get("net/iface/eth0"), Some(CondState::Off));
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cond");

        let mut cs = CondStore::open(&path, Bus::new(16)).unwrap();
        cs.set("hook/basefs-up");
        cs.clear("pid/crond");
        drop(cs);

        let cs = CondStore::open(&path, Bus::new(16)).unwrap();
        assert_eq!(cs.get("hook/basefs-up"), Some(CondState::On));
        assert_eq!(cs.get("pid/crond"), Some(CondState::Off));
    }

    #[test]
    fn rejects_bad_names() {
        let (_d, mut cs) = store();
        assert!(!cs.set("/abs"));
        assert!(!cs.set("a/../b"));
        assert!(!cs.set(".hidden"));
        assert!(!cs.set(""));
    }

    #[test]
    fn hook_oneshots_survive_reload_when_reasserted() {
        let (_d, mut cs) = store();
        cs.set_oneshot("hook/basefs-up");
        cs.set("net/iface/eth0");

        cs.begin_reload();
        assert_eq!(cs.get("hook/basefs-up"), Some(CondState::Flux));

        cs.reassert_prefix("hook/");
        cs.finish_reload();
        assert_eq!(cs.get("hook/basefs-up"), Some(CondState::On));
        // Observable reality that nobody re-asserted is swept.
        assert_eq!(cs.get("net/iface/eth0"), Some(CondState::Off));
    }

    #[test]
    fn off_does_not_go_flux_on_reload() {
        let (_d, mut cs) = store();
        cs.clear("pid/crond");
        cs.begin_reload();
        assert_eq!(cs.get("pid/crond"), Some(CondState::Off));
    }
}
