//! # Observer API for runtime events.
//!
//! An [`Observer`] receives every [`Event`] published on the bus. The
//! built-in [`LogWriter`] forwards events to the `log` facade; custom
//! observers (metrics, audit trails) implement the same trait.

use async_trait::async_trait;
use log::{debug, info, warn};

use crate::events::{Event, EventKind};

/// Consumes runtime events, one at a time, in publish order.
#[async_trait]
pub trait Observer {
    async fn on_event(&self, event: &Event);
}

/// Observer that forwards events to the `log` facade.
pub struct LogWriter;

#[async_trait]
impl Observer for LogWriter {
    async fn on_event(&self, e: &Event) {
        match e.kind {
            EventKind::SvcStarting => {
                debug!("starting {:?}", e.svc);
            }
            EventKind::SvcRunning => {
                info!("{} is up, pid {}", disp(&e.svc), e.pid.unwrap_or(0));
            }
            EventKind::SvcStopping => {
                debug!("stopping {:?}", e.svc);
            }
            EventKind::SvcStopped => {
                info!("{} stopped", disp(&e.svc));
            }
            EventKind::SvcCrashed => {
                warn!("{} crashed: {}", disp(&e.svc), disp(&e.error));
            }
            EventKind::RespawnScheduled => {
                info!("respawning {} in {:?}", disp(&e.svc), e.delay.unwrap_or_default());
            }
            EventKind::RespawnExhausted => {
                warn!("{} restarting too fast, parking", disp(&e.svc));
            }
            EventKind::PidAdopted => {
                debug!("{} adopted pid {}", disp(&e.svc), e.pid.unwrap_or(0));
            }
            EventKind::CondSet => {
                debug!("cond {} -> on", disp(&e.cond));
            }
            EventKind::CondCleared => {
                debug!("cond {} -> off", disp(&e.cond));
            }
            EventKind::CondFlux => {
                debug!("cond {} -> flux", disp(&e.cond));
            }
            EventKind::RunlevelChanged => {
                info!("entering runlevel {}", e.level.unwrap_or(0));
            }
            EventKind::ReloadStarted => {
                info!("reloading configuration");
            }
            EventKind::ReloadDone => {
                info!("reload done");
            }
            EventKind::HookFired => {
                debug!("hook {}", disp(&e.cond));
            }
            EventKind::ShutdownRequested => {
                info!("shutdown requested");
            }
        }
    }
}

fn disp(v: &Option<String>) -> &str {
    v.as_deref().unwrap_or("?")
}
