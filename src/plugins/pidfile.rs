//! # Pidfile event monitor for the condition engine.
//!
//! Watches the run directory tree with inotify, directories only, at most
//! one level deep. Names matching `*.pid` or `pid` raise or clear the
//! owning record's `pid/<name>` condition; the state machine then adopts
//! the daemonized pid from the file. New subdirectories join the watch
//! set and are rescanned so pidfiles written before the watch landed are
//! not missed.
//!
//! On SvcReconf (after `initctl reload`) the watcher re-asserts the
//! condition of every running, unchanged, non-starting record whose
//! pidfile still exists, so unchanged services do not bounce.

use std::collections::HashMap;
use std::fs;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, WatchDescriptor};

use crate::launch::Spawner;
use crate::plugins::{HookPoint, Plugin};
use crate::supervisor::{Core, KindMask};
use crate::svc::{Ident, SvcState};

const PIDFILE_EVENTS: u32 = AddWatchFlags::IN_CREATE.bits()
    | AddWatchFlags::IN_ATTRIB.bits()
    | AddWatchFlags::IN_MODIFY.bits()
    | AddWatchFlags::IN_MOVED_TO.bits()
    | AddWatchFlags::IN_DELETE.bits();

pub struct PidfilePlugin {
    run_dir: PathBuf,
    inotify: Option<Inotify>,
    watches: HashMap<WatchDescriptor, PathBuf>,
}

impl PidfilePlugin {
    pub fn new(run_dir: PathBuf) -> Self {
        let inotify = match Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC) {
            Ok(i) => Some(i),
            Err(e) => {
                warn!("pidfile: inotify unavailable: {e}");
                None
            }
        };
        Self {
            run_dir,
            inotify,
            watches: HashMap::new(),
        }
    }

    /// Adds a directory watch, enforcing the one-level-deep rule under
    /// the run directory.
    fn add_path(&mut self, path: &Path) {
        if let Ok(rel) = path.strip_prefix(&self.run_dir) {
            if rel.components().count() > 1 {
                warn!(
                    "pidfile: '{}' is deeper than one level below '{}', not watching; \
                     move the pidfile up or point the record at a shallower path",
                    path.display(),
                    self.run_dir.display()
                );
                return;
            }
        }

        let Some(inotify) = &self.inotify else { return };
        let flags = AddWatchFlags::from_bits_truncate(PIDFILE_EVENTS) | AddWatchFlags::IN_ONLYDIR;
        match inotify.add_watch(path, flags) {
            Ok(wd) => {
                debug!("pidfile: watching {}", path.display());
                self.watches.insert(wd, path.to_path_buf());
            }
            Err(e) => warn!("pidfile: cannot watch {}: {e}", path.display()),
        }
    }

    fn remove_path(&mut self, path: &Path) {
        let found = self
            .watches
            .iter()
            .find(|(_, p)| p.as_path() == path)
            .map(|(wd, _)| *wd);
        if let Some(wd) = found {
            if let Some(inotify) = &self.inotify {
                let _ = inotify.rm_watch(wd);
            }
            self.watches.remove(&wd);
        }
    }

    /// Synthesizes create events for pidfiles that already exist, e.g. in
    /// a directory created before its watch landed.
    fn scan_dir<S: Spawner>(&self, dir: &Path, core: &mut Core<S>) {
        let Ok(rd) = fs::read_dir(dir) else { return };
        for ent in rd.flatten() {
            let name = ent.file_name().to_string_lossy().into_owned();
            if is_pidfile_name(&name) && ent.path().is_file() {
                debug!("pidfile: scan found {}", ent.path().display());
                update_cond(core, &ent.path(), true);
            }
        }
    }

    fn handle_dir<S: Spawner>(&mut self, dir: &Path, name: &str, created: bool, core: &mut Core<S>) {
        let path = dir.join(name);
        if created {
            self.add_path(&path);
            self.scan_dir(&path, core);
        } else {
            self.remove_path(&path);
        }
    }

    fn reconf<S: Spawner>(&self, core: &mut Core<S>) {
        for ident in core.registry.idents() {
            let Some(svc) = core.registry.find(&ident) else { continue };
            if svc.state != SvcState::Running || svc.is_changed() || svc.is_starting() {
                continue;
            }
            let Some(pidfile) = &svc.pidfile else { continue };
            if pidfile.exists() {
                let cond = svc.pid_cond_name();
                core.conds.set(&cond);
            }
        }
        // Stepping services may unlock further records; waiting ones
        // re-assert their own conditions as they come up.
        core.step_all(KindMask::SERVICE | KindMask::RUNTASK);
    }
}

impl<S: Spawner> Plugin<S> for PidfilePlugin {
    fn name(&self) -> &'static str {
        "pidfile"
    }

    fn hooks(&self) -> &'static [HookPoint] {
        &[HookPoint::BasefsUp, HookPoint::SvcReconf]
    }

    fn hook(&mut self, point: HookPoint, _arg: Option<&Ident>, core: &mut Core<S>) {
        match point {
            HookPoint::BasefsUp => {
                let root = self
                    .run_dir
                    .canonicalize()
                    .unwrap_or_else(|_| self.run_dir.clone());
                self.run_dir = root.clone();
                self.add_path(&root);
                self.scan_dir(&root, core);
            }
            HookPoint::SvcReconf => self.reconf(core),
            _ => {}
        }
    }

    fn io_fd(&self) -> Option<RawFd> {
        self.inotify.as_ref().map(|i| i.as_fd().as_raw_fd())
    }

    fn io_ready(&mut self, core: &mut Core<S>) {
        let Some(inotify) = &self.inotify else { return };
        let events = match inotify.read_events() {
            Ok(ev) => ev,
            Err(nix::errno::Errno::EAGAIN) => return,
            Err(e) => {
                warn!("pidfile: inotify read: {e}");
                return;
            }
        };

        for ev in events {
            let Some(dir) = self.watches.get(&ev.wd).cloned() else { continue };
            let Some(name) = ev.name.as_ref().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };

            if ev.mask.contains(AddWatchFlags::IN_ISDIR) {
                let created = ev.mask.contains(AddWatchFlags::IN_CREATE);
                let deleted = ev.mask.contains(AddWatchFlags::IN_DELETE);
                if created || deleted {
                    self.handle_dir(&dir, &name, created, core);
                }
                continue;
            }

            if !is_pidfile_name(&name) {
                continue;
            }
            let path = dir.join(&name);
            if ev.mask.intersects(
                AddWatchFlags::IN_CREATE
                    | AddWatchFlags::IN_ATTRIB
                    | AddWatchFlags::IN_MODIFY
                    | AddWatchFlags::IN_MOVED_TO,
            ) {
                update_cond(core, &path, true);
            } else if ev.mask.contains(AddWatchFlags::IN_DELETE) {
                update_cond(core, &path, false);
            }
        }
    }
}

/// `*.pid` and bare `pid` files carry daemon pids.
fn is_pidfile_name(name: &str) -> bool {
    name == "pid" || name.ends_with(".pid")
}

fn update_cond<S: Spawner>(core: &mut Core<S>, path: &Path, up: bool) {
    let Some(svc) = core.registry.find_by_pidfile(path) else {
        debug!("pidfile: no record for {}", path.display());
        return;
    };
    let cond = svc.pid_cond_name();
    if up {
        core.conds.set(&cond);
    } else {
        core.conds.clear(&cond);
    }
}
