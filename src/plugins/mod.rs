//! # Plugin records, hook points and the dispatcher.
//!
//! Plugins couple external signal sources (inotify, netlink, timers) into
//! the supervisor. A plugin registers zero or more hook callbacks plus at
//! most one I/O descriptor; the dispatcher multiplexes readiness on the
//! loop and invokes hook points in plugin-load order, which is a contract.
//!
//! The set of collaborators is closed and compiled in ([`manifest`]), but
//! the record shape is the same one a dynamically loaded plugin would
//! fill in, so the extensibility contract is preserved without a runtime
//! loader. Registration is first-wins: a duplicate name is a silent
//! no-op. Dependencies are resolved opportunistically from the manifest;
//! a missing dependency is logged and the dependent still loads.

pub mod pidfile;

use std::os::fd::RawFd;
use std::task::Poll;

use log::{debug, warn};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::events::{Event, EventKind};
use crate::launch::Spawner;
use crate::supervisor::{Core, KindMask};
use crate::svc::Ident;

/// Closed set of named moments in boot and shutdown.
///
/// Callbacks at one point run in plugin-load order. From
/// [`HookPoint::BasefsUp`] onward the matching `hook/<name>` oneshot
/// condition is set after the callbacks ran.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookPoint {
    Banner,
    RootfsUp,
    BasefsUp,
    NetworkUp,
    SvcPlugin,
    SvcStart,
    SvcReconf,
    SvcStop,
    Shutdown,
}

impl HookPoint {
    pub const ALL: [HookPoint; 9] = [
        HookPoint::Banner,
        HookPoint::RootfsUp,
        HookPoint::BasefsUp,
        HookPoint::NetworkUp,
        HookPoint::SvcPlugin,
        HookPoint::SvcStart,
        HookPoint::SvcReconf,
        HookPoint::SvcStop,
        HookPoint::Shutdown,
    ];

    /// Whether the condition directory is writable at this point.
    ///
    /// `/run` is not mounted until base filesystems are up, so the two
    /// earlier points must never touch the store.
    pub fn cond_ready(self) -> bool {
        !matches!(self, HookPoint::Banner | HookPoint::RootfsUp)
    }

    /// Oneshot condition posted after this hook point ran.
    pub fn cond_name(self) -> &'static str {
        match self {
            HookPoint::Banner => "hook/banner",
            HookPoint::RootfsUp => "hook/rootfs-up",
            HookPoint::BasefsUp => "hook/basefs-up",
            HookPoint::NetworkUp => "hook/network-up",
            HookPoint::SvcPlugin => "hook/svc-plugin",
            HookPoint::SvcStart => "hook/svc-start",
            HookPoint::SvcReconf => "hook/svc-reconf",
            HookPoint::SvcStop => "hook/svc-stop",
            HookPoint::Shutdown => "hook/shutdown",
        }
    }
}

/// One compiled-in collaborator.
///
/// Plugins are process-scoped, have no state machine, and are never
/// unloaded after init.
pub trait Plugin<S: Spawner> {
    fn name(&self) -> &'static str;

    /// Names of plugins that should be loaded before this one.
    fn depends(&self) -> &'static [&'static str] {
        &[]
    }

    /// Hook points this plugin wants callbacks at.
    fn hooks(&self) -> &'static [HookPoint] {
        &[]
    }

    /// Invoked for each subscribed hook point, in load order. `arg`
    /// carries the record identity for per-service points.
    fn hook(&mut self, _point: HookPoint, _arg: Option<&Ident>, _core: &mut Core<S>) {}

    /// Descriptor to watch for readability, if any. Re-queried after
    /// every dispatch, so a callback may close and replace its fd.
    fn io_fd(&self) -> Option<RawFd> {
        None
    }

    /// Invoked when the descriptor is readable. The watcher is stopped
    /// for the duration of the call and re-armed afterwards.
    fn io_ready(&mut self, _core: &mut Core<S>) {}
}

struct Slot<S: Spawner> {
    plugin: Box<dyn Plugin<S>>,
    watcher: Option<AsyncFd<RawFd>>,
}

/// Ordered plugin table plus the I/O multiplexer.
pub struct PluginSet<S: Spawner> {
    slots: Vec<Slot<S>>,
}

impl<S: Spawner> Default for PluginSet<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Spawner> PluginSet<S> {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Registers every manifest entry, pulling dependencies forward so
    /// they load before their dependents.
    pub fn load_manifest(&mut self, plugins: Vec<Box<dyn Plugin<S>>>) {
        let mut pending: Vec<Option<Box<dyn Plugin<S>>>> =
            plugins.into_iter().map(Some).collect();
        for i in 0..pending.len() {
            self.load_with_deps(i, &mut pending);
        }
    }

    fn load_with_deps(&mut self, i: usize, pending: &mut Vec<Option<Box<dyn Plugin<S>>>>) {
        let Some(plugin) = pending[i].take() else { return };

        // First wins; later loads are silent no-ops.
        if self.position(plugin.name()).is_some() {
            debug!("plugin {} already loaded", plugin.name());
            return;
        }

        for dep in plugin.depends() {
            if self.position(dep).is_some() {
                continue;
            }
            let found = pending.iter().position(|p| {
                p.as_ref().map(|p| p.name()) == Some(dep)
            });
            match found {
                Some(j) => self.load_with_deps(j, pending),
                None => warn!(
                    "plugin {}: dependency '{dep}' not in manifest, loading anyway",
                    plugin.name()
                ),
            }
        }

        self.insert(plugin);
    }

    fn insert(&mut self, plugin: Box<dyn Plugin<S>>) {
        debug!("loaded plugin {}", plugin.name());
        let watcher = arm(plugin.as_ref());
        self.slots.push(Slot { plugin, watcher });
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|s| s.plugin.name() == name)
    }

    /// Plugin names in load order.
    pub fn names(&self) -> Vec<&'static str> {
        self.slots.iter().map(|s| s.plugin.name()).collect()
    }

    /// Invokes every callback registered at `point`, in load order, then
    /// posts the hook oneshot condition (where the store is writable) and
    /// reconciles run/task records.
    pub fn run_hook(&mut self, point: HookPoint, arg: Option<&Ident>, core: &mut Core<S>) {
        for slot in &mut self.slots {
            if slot.plugin.hooks().contains(&point) {
                slot.plugin.hook(point, arg, core);
            }
        }

        if point.cond_ready() {
            core.conds.set_oneshot(point.cond_name());
            core.bus
                .publish(Event::now(EventKind::HookFired).with_cond(point.cond_name()));
        }

        core.step_all(KindMask::RUNTASK);
    }

    /// Drains hook requests queued by state-machine edges. Hooks may queue
    /// further hooks; the loop runs until quiet, with a backstop.
    pub fn dispatch_pending(&mut self, core: &mut Core<S>) {
        let mut rounds = 0;
        while !core.pending_hooks.is_empty() {
            let batch = std::mem::take(&mut core.pending_hooks);
            for (point, ident) in batch {
                self.run_hook(point, ident.as_ref(), core);
            }
            rounds += 1;
            if rounds > 64 {
                warn!("hook dispatch did not settle, dropping remainder");
                core.pending_hooks.clear();
                break;
            }
        }
    }

    /// Resolves when some plugin descriptor is readable, yielding its
    /// slot index. Pends forever when no plugin watches I/O.
    pub async fn io_ready_index(&mut self) -> usize {
        futures::future::poll_fn(|cx| {
            for (i, slot) in self.slots.iter().enumerate() {
                if let Some(w) = &slot.watcher {
                    match w.poll_read_ready(cx) {
                        Poll::Ready(_) => return Poll::Ready(i),
                        Poll::Pending => {}
                    }
                }
            }
            Poll::Pending
        })
        .await
    }

    /// Dispatches one readable descriptor: stops the watcher (the callback
    /// may close or replace the fd), invokes the plugin, re-arms with
    /// whatever descriptor the plugin now advertises, and reconciles.
    pub fn dispatch_io(&mut self, idx: usize, core: &mut Core<S>) {
        let Some(slot) = self.slots.get_mut(idx) else { return };
        slot.watcher = None;
        slot.plugin.io_ready(core);
        slot.watcher = arm(slot.plugin.as_ref());

        core.step_all(KindMask::ALL);
        self.dispatch_pending(core);
    }
}

fn arm<S: Spawner>(plugin: &dyn Plugin<S>) -> Option<AsyncFd<RawFd>> {
    let fd = plugin.io_fd()?;
    match AsyncFd::with_interest(fd, Interest::READABLE) {
        Ok(w) => Some(w),
        Err(e) => {
            warn!("plugin {}: cannot watch fd {fd}: {e}", plugin.name());
            None
        }
    }
}

/// The compiled-in collaborator set, in load order.
pub fn manifest<S: Spawner>(run_dir: std::path::PathBuf) -> Vec<Box<dyn Plugin<S>>> {
    vec![Box::new(pidfile::PidfilePlugin::new(run_dir))]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cond::CondStore;
    use crate::config::Config;
    use crate::events::Bus;
    use crate::launch::testing::FakeSpawner;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn core() -> (tempfile::TempDir, Core<FakeSpawner>) {
        let dir = tempfile::tempdir().unwrap();
        let bus = Bus::new(64);
        let conds = CondStore::open(dir.path().join("cond"), bus.clone()).unwrap();
        (dir, Core::new(Config::default(), conds, bus, FakeSpawner::new()))
    }

    struct Probe {
        name: &'static str,
        depends: &'static [&'static str],
        log: Rc<RefCell<Vec<String>>>,
    }

    impl Plugin<FakeSpawner> for Probe {
        fn name(&self) -> &'static str {
            self.name
        }
        fn depends(&self) -> &'static [&'static str] {
            self.depends
        }
        fn hooks(&self) -> &'static [HookPoint] {
            &[HookPoint::BasefsUp, HookPoint::SvcReconf]
        }
        fn hook(&mut self, point: HookPoint, _arg: Option<&Ident>, _core: &mut Core<FakeSpawner>) {
            self.log
                .borrow_mut()
                .push(format!("{}:{:?}", self.name, point));
        }
    }

    fn probe(
        name: &'static str,
        depends: &'static [&'static str],
        log: &Rc<RefCell<Vec<String>>>,
    ) -> Box<dyn Plugin<FakeSpawner>> {
        Box::new(Probe {
            name,
            depends,
            log: log.clone(),
        })
    }

    #[test]
    fn dependencies_load_before_dependents() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut set = PluginSet::new();
        set.load_manifest(vec![
            probe("pidfile", &["netlink"], &log),
            probe("netlink", &[], &log),
        ]);
        assert_eq!(set.names(), vec!["netlink", "pidfile"]);
    }

    #[test]
    fn duplicate_registration_is_first_wins() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut set = PluginSet::new();
        set.load_manifest(vec![
            probe("one", &[], &log),
            probe("one", &[], &log),
            probe("two", &[], &log),
        ]);
        assert_eq!(set.names(), vec!["one", "two"]);
    }

    #[test]
    fn missing_dependency_still_loads_dependent() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut set = PluginSet::new();
        set.load_manifest(vec![probe("orphan", &["ghost"], &log)]);
        assert_eq!(set.names(), vec!["orphan"]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn hooks_run_in_load_order_and_post_conditions() {
        let (_d, mut core) = core();
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut set = PluginSet::new();
        set.load_manifest(vec![probe("a", &[], &log), probe("b", &[], &log)]);

        set.run_hook(HookPoint::BasefsUp, None, &mut core);

        assert_eq!(
            *log.borrow(),
            vec!["a:BasefsUp".to_string(), "b:BasefsUp".to_string()]
        );
        assert_eq!(
            core.conds.get("hook/basefs-up"),
            Some(crate::cond::CondState::On)
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn pre_basefs_hooks_do_not_touch_the_store() {
        let (_d, mut core) = core();
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut set = PluginSet::new();
        set.load_manifest(vec![probe("a", &[], &log)]);

        set.run_hook(HookPoint::Banner, None, &mut core);
        set.run_hook(HookPoint::RootfsUp, None, &mut core);

        assert!(!core.conds.exists("hook/banner"));
        assert!(!core.conds.exists("hook/rootfs-up"));
    }

    struct PipePlugin {
        read_fd: std::os::fd::OwnedFd,
        hits: Rc<RefCell<u32>>,
    }

    impl Plugin<FakeSpawner> for PipePlugin {
        fn name(&self) -> &'static str {
            "pipe"
        }
        fn io_fd(&self) -> Option<RawFd> {
            use std::os::fd::AsRawFd;
            Some(self.read_fd.as_raw_fd())
        }
        fn io_ready(&mut self, _core: &mut Core<FakeSpawner>) {
            use std::os::fd::AsRawFd;
            let mut buf = [0u8; 16];
            let _ = nix::unistd::read(self.read_fd.as_raw_fd(), &mut buf);
            *self.hits.borrow_mut() += 1;
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn io_dispatch_invokes_plugin_and_rearms() {
        use nix::fcntl::{fcntl, FcntlArg, OFlag};
        use std::os::fd::AsRawFd;

        let (_d, mut core) = core();
        let (r, w) = nix::unistd::pipe().unwrap();
        fcntl(r.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).unwrap();

        let hits = Rc::new(RefCell::new(0));
        let mut set = PluginSet::new();
        set.load_manifest(vec![Box::new(PipePlugin {
            read_fd: r,
            hits: hits.clone(),
        }) as Box<dyn Plugin<FakeSpawner>>]);

        nix::unistd::write(&w, b"x").unwrap();
        let idx = set.io_ready_index().await;
        set.dispatch_io(idx, &mut core);
        assert_eq!(*hits.borrow(), 1);

        // The watcher was re-armed: a second event dispatches again.
        nix::unistd::write(&w, b"y").unwrap();
        let idx = set.io_ready_index().await;
        set.dispatch_io(idx, &mut core);
        assert_eq!(*hits.borrow(), 2);
    }
}
