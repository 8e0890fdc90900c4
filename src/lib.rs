//! # initvisor
//!
//! **initvisor** is a process-1 init: the first and permanent user-space
//! process, responsible for bringing the system from kernel handoff to a
//! steady runlevel, supervising services and login terminals across
//! runlevel transitions, and orchestrating graceful shutdown.
//!
//! ## Features
//!
//! | Area              | Description                                                          | Key types / traits                 |
//! |-------------------|----------------------------------------------------------------------|------------------------------------|
//! | **Supervision**   | Per-record state machine with a fixed-point reconciliation driver.   | [`Core`], [`SvcState`]             |
//! | **Conditions**    | Namespaced tri-state flags gating service start.                     | [`CondStore`], [`CondState`]       |
//! | **Plugins**       | Hook points and I/O callbacks coupled into the loop.                 | [`Plugin`], [`PluginSet`], [`HookPoint`] |
//! | **Control**       | Bounded binary frames over a well-known FIFO.                        | [`ControlFifo`], [`Frame`], [`Cmd`] |
//! | **Records**       | Typed service/task/run/inetd/tty/sysv entries with identity.         | [`Svc`], [`Registry`], [`Ident`]   |
//! | **Policies**      | Respawn limits with sliding windows and cooldowns.                   | [`RespawnPolicy`]                  |
//! | **Observability** | Broadcast event bus consumed by observers.                           | [`Bus`], [`Event`], [`Observer`]   |
//!
//! ## Architecture
//!
//! Single-threaded cooperative event loop: signals, FIFO commands,
//! inotify events and timers land in handlers, which mutate the registry
//! or condition store and then run `step_all` — one reconciliation point
//! that advances every record until quiescence. Only the loop thread
//! touches supervisor state; signal handlers are kernel-bridged streams.
//!
//! ```no_run
//! use initvisor::{Config, Core, CondStore, Bus, ProcessLauncher, KindMask};
//!
//! # fn main() -> anyhow::Result<()> {
//! let cfg = Config::default();
//! let bus = Bus::new(cfg.bus_capacity);
//! let conds = CondStore::open(&cfg.cond_dir, bus.clone())?;
//! let mut core = Core::new(cfg, conds, bus, ProcessLauncher);
//!
//! // Records come from the configuration parser; then:
//! core.runlevel_set(2);
//! core.step_all(KindMask::ALL);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod cond;
pub mod conf;
pub mod config;
pub mod error;
pub mod events;
pub mod inetd;
pub mod launch;
pub mod observer;
pub mod plugins;
pub mod policy;
pub mod reaper;
pub mod signals;
pub mod supervisor;
pub mod svc;
pub mod timers;
pub mod tty;

// ---- Public re-exports ----

pub use api::{Cmd, ControlFifo, Frame};
pub use cond::{CondState, CondStore};
pub use config::Config;
pub use error::{ConfError, InitError};
pub use events::{Bus, Event, EventKind};
pub use inetd::InetdTable;
pub use launch::{ProcessLauncher, Spawner};
pub use observer::{LogWriter, Observer};
pub use plugins::{HookPoint, Plugin, PluginSet};
pub use policy::{RespawnPolicy, RespawnState};
pub use signals::{InitAction, SignalHub};
pub use supervisor::{Core, KindMask, ShutdownKind};
pub use svc::registry::Registry;
pub use svc::{Ident, Svc, SvcKind, SvcState};
