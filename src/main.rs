//! pid-1 entrypoint: boot, the event loop, and shutdown.

use std::time::{Duration, Instant};

use anyhow::Context;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use initvisor::launch::emergency_shell;
use initvisor::plugins::manifest;
use initvisor::supervisor::KindMask;
use initvisor::{
    api, reaper, Bus, Config, ControlFifo, Core, HookPoint, InetdTable, InitAction, LogWriter,
    Observer, PluginSet, ProcessLauncher, ShutdownKind, SignalHub, SvcState,
};

fn main() -> anyhow::Result<()> {
    // Full filter so the runtime debug toggle works; start at info.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace"))
        .format_timestamp_secs()
        .init();
    log::set_max_level(log::LevelFilter::Info);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    runtime.block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let cfg = Config::default();
    let bus = Bus::new(cfg.bus_capacity);

    let conds = match initvisor::CondStore::open(&cfg.cond_dir, bus.clone()) {
        Ok(store) => store,
        Err(e) => {
            // Condition store failures are fatal only at boot; without it
            // no service can ever be gated correctly.
            error!("cannot open condition store: {e}");
            let _ = emergency_shell(&cfg.shell, &cfg.console);
            return Err(e).context("condition store");
        }
    };

    let mut core = Core::new(cfg, conds, bus, ProcessLauncher);
    let token = CancellationToken::new();
    spawn_observer(&core, &token);

    info!("initvisor booting");

    let mut plugins = PluginSet::new();
    plugins.load_manifest(manifest(core.cfg.run_dir.clone()));
    plugins.run_hook(HookPoint::Banner, None, &mut core);
    plugins.run_hook(HookPoint::SvcPlugin, None, &mut core);

    // Mount helpers are external; by the time we run, root is ours.
    plugins.run_hook(HookPoint::RootfsUp, None, &mut core);
    plugins.run_hook(HookPoint::BasefsUp, None, &mut core);

    // First configuration load; a broken config boots an empty table
    // rather than no system at all.
    let boot_level = match initvisor::conf::load(&core.cfg) {
        Ok(parsed) => {
            let level = parsed.runlevel.unwrap_or(core.cfg.runlevel);
            for rec in parsed.records {
                if let Err(e) = core.registry.add(rec) {
                    warn!("{e}");
                }
            }
            level
        }
        Err(e) => {
            error!("configuration rejected ({}): {e}", e.as_label());
            core.cfg.runlevel
        }
    };

    // Bootstrap runlevel S first, then the configured target.
    core.step_all(KindMask::ALL);
    plugins.dispatch_pending(&mut core);
    core.runlevel_set(boot_level);
    plugins.dispatch_pending(&mut core);
    plugins.run_hook(HookPoint::NetworkUp, None, &mut core);

    let mut fifo = ControlFifo::open(&core.cfg.fifo_path)
        .map_err(|e| {
            warn!("{e}; continuing without control fifo");
            e
        })
        .ok();
    let mut signals = SignalHub::new().context("signal streams")?;
    let mut inetd = InetdTable::new();
    inetd.sync(&core);

    enum LoopEvent {
        Action(InitAction),
        Frame(api::Frame),
        PluginIo(usize),
        Inetd(initvisor::Ident, tokio::net::TcpStream),
        Timer,
    }

    let down = loop {
        if core.fatal {
            core.fatal = false;
            if let Err(e) = emergency_shell(&core.cfg.shell, &core.cfg.console) {
                error!("{e}");
            }
        }

        if let Some(kind) = core.shutdown {
            if all_stopped(&core) {
                break kind;
            }
        }

        let deadline = core
            .timers
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        let ev = tokio::select! {
            action = signals.next() => LoopEvent::Action(action),
            frame = next_frame(&mut fifo) => LoopEvent::Frame(frame),
            idx = plugins.io_ready_index() => LoopEvent::PluginIo(idx),
            (ident, stream) = inetd.accept() => LoopEvent::Inetd(ident, stream),
            _ = tokio::time::sleep_until(deadline.into()) => LoopEvent::Timer,
        };

        match ev {
            LoopEvent::Action(InitAction::ChildExited) => {
                if reaper::reap_all(&mut core) {
                    core.step_all(KindMask::ALL);
                }
            }
            LoopEvent::Action(InitAction::Halt) => core.runlevel_set(0),
            LoopEvent::Action(InitAction::Reboot) => core.runlevel_set(6),
            LoopEvent::Action(InitAction::Reload) => {
                api::do_reload(&mut core, &mut plugins);
            }
            LoopEvent::Action(InitAction::ToggleDebug) => {
                let frame = api::Frame::new(api::Cmd::Debug, "");
                api::dispatch(&frame, &mut core, &mut plugins);
            }
            LoopEvent::Action(InitAction::Emergency) => {
                if let Err(e) = emergency_shell(&core.cfg.shell, &core.cfg.console) {
                    error!("{e}");
                }
            }
            LoopEvent::Frame(frame) => {
                api::dispatch(&frame, &mut core, &mut plugins);
            }
            LoopEvent::PluginIo(idx) => plugins.dispatch_io(idx, &mut core),
            LoopEvent::Inetd(ident, stream) => {
                initvisor::inetd::spawn_handler(&core, &ident, stream);
            }
            LoopEvent::Timer => core.run_timers(Instant::now()),
        }

        plugins.dispatch_pending(&mut core);
        inetd.sync(&core);
    };

    plugins.run_hook(HookPoint::Shutdown, None, &mut core);
    token.cancel();
    finalize(down)
}

/// Reads the next control frame, or pends forever without a FIFO.
async fn next_frame(fifo: &mut Option<ControlFifo>) -> api::Frame {
    match fifo {
        Some(fifo) => fifo.next_frame().await,
        None => futures::future::pending().await,
    }
}

/// Forwards bus events to the log observer. Runs on the same thread as
/// the loop; observers never touch supervisor state.
fn spawn_observer(core: &Core<ProcessLauncher>, token: &CancellationToken) {
    use tokio::sync::broadcast::error::RecvError;

    let mut rx = core.bus.subscribe();
    let token = token.clone();
    tokio::spawn(async move {
        let obs = LogWriter;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                ev = rx.recv() => match ev {
                    Ok(ev) => obs.on_event(&ev).await,
                    Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(_)) => continue,
                },
            }
        }
    });
}

fn all_stopped<S: initvisor::Spawner>(core: &Core<S>) -> bool {
    core.registry
        .iter()
        .all(|s| matches!(s.state, SvcState::Halted | SvcState::Conditional | SvcState::Crashed))
}

/// Final system call. Outside a pid-1 context (development), just exit.
fn finalize(kind: ShutdownKind) -> anyhow::Result<()> {
    info!("system is going down: {kind:?}");
    nix::unistd::sync();

    if std::process::id() != 1 {
        return Ok(());
    }

    let mode = match kind {
        ShutdownKind::Halt => nix::sys::reboot::RebootMode::RB_HALT_SYSTEM,
        ShutdownKind::PowerOff => nix::sys::reboot::RebootMode::RB_POWER_OFF,
        ShutdownKind::Reboot => nix::sys::reboot::RebootMode::RB_AUTOBOOT,
    };
    nix::sys::reboot::reboot(mode).context("reboot syscall")?;
    Ok(())
}
