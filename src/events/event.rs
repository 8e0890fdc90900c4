use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SvcStarting,
    SvcRunning,
    SvcStopping,
    SvcStopped,
    SvcCrashed,
    RespawnScheduled,
    RespawnExhausted,
    PidAdopted,
    CondSet,
    CondCleared,
    CondFlux,
    RunlevelChanged,
    ReloadStarted,
    ReloadDone,
    HookFired,
    ShutdownRequested,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub at: SystemTime,
    pub svc: Option<String>,
    pub cond: Option<String>,
    pub pid: Option<i32>,
    pub level: Option<u8>,
    pub delay: Option<Duration>,
    pub error: Option<String>,
}

impl Event {
    pub fn now(kind: EventKind) -> Self {
        Self {
            kind,
            at: SystemTime::now(),
            svc: None,
            cond: None,
            pid: None,
            level: None,
            delay: None,
            error: None,
        }
    }

    pub fn with_svc(mut self, ident: impl Into<String>) -> Self {
        self.svc = Some(ident.into());
        self
    }

    pub fn with_cond(mut self, name: impl Into<String>) -> Self {
        self.cond = Some(name.into());
        self
    }

    pub fn with_pid(mut self, pid: i32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_level(mut self, level: u8) -> Self {
        self.level = Some(level);
        self
    }

    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay = Some(d);
        self
    }

    pub fn with_error(mut self, msg: impl Into<String>) -> Self {
        self.error = Some(msg.into());
        self
    }
}
