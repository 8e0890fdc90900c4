//! # Service registry.
//!
//! Insertion-ordered collection of [`Svc`] records with O(1) amortized
//! identity lookup; pid and pidfile indices are maintained alongside.
//! Iteration order is insertion order, which `step_all` relies on for the
//! ordered execution of `run` records.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::InitError;
use crate::svc::{Dirty, Ident, Svc, SvcState};

/// Process-wide record table. One per supervisor; tests construct their
/// own isolated instances.
#[derive(Default)]
pub struct Registry {
    svcs: Vec<Svc>,
    by_ident: HashMap<Ident, usize>,
    by_pid: HashMap<i32, Ident>,
    by_pidfile: HashMap<PathBuf, Ident>,
    generation: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Config generation applied to records touched by the last reparse.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.svcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.svcs.is_empty()
    }

    /// Adds a new record. Identity must be unique.
    pub fn add(&mut self, mut svc: Svc) -> Result<(), InitError> {
        if self.by_ident.contains_key(&svc.ident) {
            return Err(InitError::DuplicateService {
                ident: svc.ident.to_string(),
            });
        }
        svc.generation = self.generation;
        if let Some(pf) = &svc.pidfile {
            self.by_pidfile.insert(pf.clone(), svc.ident.clone());
        }
        self.by_ident.insert(svc.ident.clone(), self.svcs.len());
        self.svcs.push(svc);
        Ok(())
    }

    pub fn find(&self, ident: &Ident) -> Option<&Svc> {
        self.by_ident.get(ident).map(|&i| &self.svcs[i])
    }

    pub fn find_mut(&mut self, ident: &Ident) -> Option<&mut Svc> {
        let i = *self.by_ident.get(ident)?;
        Some(&mut self.svcs[i])
    }

    /// Looks up by the `name[:id]` form clients use, across kinds.
    pub fn find_by_name(&self, spec: &str) -> Option<&Svc> {
        let (name, id) = match spec.split_once(':') {
            Some((n, i)) => (n, Some(i)),
            None => (spec, None),
        };
        self.svcs
            .iter()
            .find(|s| s.ident.name == name && s.ident.id.as_deref() == id)
    }

    pub fn find_by_pid(&self, pid: i32) -> Option<&Svc> {
        let ident = self.by_pid.get(&pid)?;
        self.find(ident)
    }

    pub fn ident_by_pid(&self, pid: i32) -> Option<Ident> {
        self.by_pid.get(&pid).cloned()
    }

    pub fn find_by_pidfile(&self, path: &Path) -> Option<&Svc> {
        let ident = self.by_pidfile.get(path)?;
        self.find(ident)
    }

    /// All records, insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Svc> {
        self.svcs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Svc> {
        self.svcs.iter_mut()
    }

    /// Identities in insertion order; `step_all` iterates these so records
    /// may be mutated one at a time.
    pub fn idents(&self) -> Vec<Ident> {
        self.svcs.iter().map(|s| s.ident.clone()).collect()
    }

    /// Records the pid owned by a record, keeping the pid index in sync.
    /// `pid = 0` releases the previous entry.
    pub fn set_pid(&mut self, ident: &Ident, pid: i32) {
        let Some(&i) = self.by_ident.get(ident) else { return };
        let old = self.svcs[i].pid;
        if old != 0 {
            self.by_pid.remove(&old);
        }
        self.svcs[i].pid = pid;
        if pid != 0 {
            self.by_pid.insert(pid, ident.clone());
        }
    }

    /// Starts a reparse: every record is presumed removed until the parser
    /// touches it again.
    pub fn mark_all_dirty(&mut self) {
        self.generation += 1;
        for svc in &mut self.svcs {
            svc.dirty = Dirty::Removed;
        }
    }

    /// Applies one freshly parsed record: updates an existing identity in
    /// place (marking it changed only when attributes differ) or inserts a
    /// new one.
    pub fn apply(&mut self, parsed: Svc) {
        match self.by_ident.get(&parsed.ident).copied() {
            Some(i) => {
                let current = &mut self.svcs[i];
                if current.same_config(&parsed) {
                    current.dirty = Dirty::Clean;
                } else {
                    let runtime_pid = current.pid;
                    let runtime_state = current.state;
                    let respawn_state = current.respawn_state;
                    if let Some(pf) = &current.pidfile {
                        self.by_pidfile.remove(pf);
                    }
                    let mut fresh = parsed;
                    fresh.pid = runtime_pid;
                    fresh.state = runtime_state;
                    fresh.respawn_state = respawn_state;
                    fresh.dirty = Dirty::Changed;
                    fresh.generation = self.generation;
                    if let Some(pf) = &fresh.pidfile {
                        self.by_pidfile.insert(pf.clone(), fresh.ident.clone());
                    }
                    self.svcs[i] = fresh;
                }
                self.svcs[i].generation = self.generation;
            }
            None => {
                let mut fresh = parsed;
                fresh.dirty = Dirty::Changed;
                let _ = self.add(fresh);
            }
        }
    }

    /// Removes records that were not touched during the reparse and are
    /// already halted. Records still holding a process stay until the
    /// state machine drives them down; they remain `Removed` so the gate
    /// fails. Returns removed identities.
    pub fn sweep_dirty(&mut self) -> Vec<Ident> {
        let doomed: Vec<Ident> = self
            .svcs
            .iter()
            .filter(|s| s.dirty == Dirty::Removed && s.state == SvcState::Halted)
            .map(|s| s.ident.clone())
            .collect();
        for ident in &doomed {
            self.remove(ident);
        }
        doomed
    }

    fn remove(&mut self, ident: &Ident) {
        let Some(i) = self.by_ident.remove(ident) else { return };
        let svc = self.svcs.remove(i);
        if svc.pid != 0 {
            self.by_pid.remove(&svc.pid);
        }
        if let Some(pf) = &svc.pidfile {
            self.by_pidfile.remove(pf);
        }
        // Positions after the removed record shifted down by one.
        for (_, idx) in self.by_ident.iter_mut() {
            if *idx > i {
                *idx -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::SvcKind;
    use std::path::PathBuf;

    fn svc(name: &str) -> Svc {
        let cmd = PathBuf::from(format!("/bin/{name}"));
        Svc::new(Ident::new(SvcKind::Service, &cmd, None), cmd, vec![])
    }

    #[test]
    fn identity_is_unique() {
        let mut reg = Registry::new();
        reg.add(svc("a")).unwrap();
        assert!(matches!(
            reg.add(svc("a")),
            Err(InitError::DuplicateService { .. })
        ));
    }

    #[test]
    fn pid_index_follows_set_pid() {
        let mut reg = Registry::new();
        reg.add(svc("a")).unwrap();
        let ident = reg.iter().next().unwrap().ident.clone();

        reg.set_pid(&ident, 42);
        assert_eq!(reg.find_by_pid(42).unwrap().ident, ident);

        reg.set_pid(&ident, 43);
        assert!(reg.find_by_pid(42).is_none());
        assert_eq!(reg.find_by_pid(43).unwrap().ident, ident);

        reg.set_pid(&ident, 0);
        assert!(reg.find_by_pid(43).is_none());
    }

    #[test]
    fn pidfile_index() {
        let mut reg = Registry::new();
        let mut s = svc("forky");
        s.pidfile = Some(PathBuf::from("/run/forky.pid"));
        reg.add(s).unwrap();

        assert_eq!(
            reg.find_by_pidfile(Path::new("/run/forky.pid"))
                .unwrap()
                .ident
                .name,
            "forky"
        );
        assert!(reg.find_by_pidfile(Path::new("/run/other.pid")).is_none());
    }

    #[test]
    fn iteration_is_insertion_ordered() {
        let mut reg = Registry::new();
        for name in ["c", "a", "b"] {
            reg.add(svc(name)).unwrap();
        }
        let names: Vec<_> = reg.iter().map(|s| s.ident.name.clone()).collect();
        assert_eq!(names, ["c", "a", "b"]);
    }

    #[test]
    fn mark_apply_sweep_cycle() {
        let mut reg = Registry::new();
        reg.add(svc("keep")).unwrap();
        reg.add(svc("drop")).unwrap();

        reg.mark_all_dirty();
        reg.apply(svc("keep"));
        reg.apply(svc("new"));

        let removed = reg.sweep_dirty();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].name, "drop");

        let names: Vec<_> = reg.iter().map(|s| s.ident.name.clone()).collect();
        assert_eq!(names, ["keep", "new"]);
        // Unchanged record is clean, new record dirty.
        assert_eq!(reg.find_by_name("keep").unwrap().dirty, Dirty::Clean);
        assert_eq!(reg.find_by_name("new").unwrap().dirty, Dirty::Changed);
    }

    #[test]
    fn running_removed_record_survives_sweep() {
        let mut reg = Registry::new();
        reg.add(svc("busy")).unwrap();
        let ident = reg.iter().next().unwrap().ident.clone();
        reg.set_pid(&ident, 99);
        reg.find_mut(&ident).unwrap().state = SvcState::Running;

        reg.mark_all_dirty();
        assert!(reg.sweep_dirty().is_empty());
        assert_eq!(reg.find(&ident).unwrap().dirty, Dirty::Removed);
    }

    #[test]
    fn changed_config_preserves_runtime_state() {
        let mut reg = Registry::new();
        reg.add(svc("a")).unwrap();
        let ident = reg.iter().next().unwrap().ident.clone();
        reg.set_pid(&ident, 7);
        reg.find_mut(&ident).unwrap().state = SvcState::Running;

        reg.mark_all_dirty();
        let mut changed = svc("a");
        changed.args = vec!["-v".into()];
        reg.apply(changed);

        let s = reg.find(&ident).unwrap();
        assert_eq!(s.dirty, Dirty::Changed);
        assert_eq!(s.pid, 7);
        assert_eq!(s.state, SvcState::Running);
        assert_eq!(s.args, vec!["-v".to_string()]);
    }
}
