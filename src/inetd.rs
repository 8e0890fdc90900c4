//! # inetd-style listeners.
//!
//! An `inetd` record keeps its listening socket inside the supervisor.
//! On accept, the handler command is fork/exec'd with the connection as
//! stdin/stdout and is never supervised beyond reaping. The record's
//! state machine only tracks the listener: `running` means bound.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::process::{Command, Stdio};
use std::task::Poll;

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};

use crate::launch::Spawner;
use crate::supervisor::Core;
use crate::svc::{Ident, SvcKind, SvcState};

/// Listener table, kept in sync with the registry after every
/// reconciliation.
#[derive(Default)]
pub struct InetdTable {
    listeners: HashMap<Ident, TcpListener>,
}

impl InetdTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds listeners for inetd records that reached `running` and drops
    /// listeners whose record went away or stopped.
    pub fn sync<S: Spawner>(&mut self, core: &Core<S>) {
        let mut wanted: HashMap<Ident, u16> = HashMap::new();
        for svc in core.registry.iter() {
            if svc.ident.kind == SvcKind::Inetd && svc.state == SvcState::Running {
                if let Some(port) = svc.port {
                    wanted.insert(svc.ident.clone(), port);
                }
            }
        }

        self.listeners.retain(|ident, _| {
            let keep = wanted.contains_key(ident);
            if !keep {
                info!("inetd {ident}: closing listener");
            }
            keep
        });

        for (ident, port) in wanted {
            if self.listeners.contains_key(&ident) {
                continue;
            }
            match bind(port) {
                Ok(listener) => {
                    info!("inetd {ident}: listening on port {port}");
                    self.listeners.insert(ident, listener);
                }
                Err(e) => warn!("inetd {ident}: bind port {port}: {e}"),
            }
        }
    }

    /// Local address of a record's listener, for tests and status output.
    pub fn local_addr(&self, ident: &Ident) -> Option<SocketAddr> {
        self.listeners.get(ident)?.local_addr().ok()
    }

    /// Completes when some listener accepts a connection. Pends forever
    /// with no listeners bound.
    pub async fn accept(&mut self) -> (Ident, TcpStream) {
        futures::future::poll_fn(|cx| {
            for (ident, listener) in self.listeners.iter() {
                if let Poll::Ready(Ok((stream, peer))) = listener.poll_accept(cx) {
                    debug!("inetd {ident}: connection from {peer}");
                    return Poll::Ready((ident.clone(), stream));
                }
            }
            Poll::Pending
        })
        .await
    }
}

fn bind(port: u16) -> io::Result<TcpListener> {
    let std_listener = std::net::TcpListener::bind(("0.0.0.0", port))?;
    std_listener.set_nonblocking(true)?;
    TcpListener::from_std(std_listener)
}

/// Fork/execs the handler with the accepted connection on stdin/stdout/
/// stderr. The child is reaped by the generic SIGCHLD path and nothing
/// else; inetd children have no state machine.
pub fn spawn_handler<S: Spawner>(core: &Core<S>, ident: &Ident, stream: TcpStream) {
    let Some(svc) = core.registry.find(ident) else { return };

    let std_stream = match stream.into_std() {
        Ok(s) => s,
        Err(e) => {
            warn!("inetd {ident}: {e}");
            return;
        }
    };
    if let Err(e) = std_stream.set_nonblocking(false) {
        warn!("inetd {ident}: {e}");
        return;
    }

    let fd = std_stream.as_raw_fd();
    let stdio = |fd: i32| -> io::Result<Stdio> {
        let dup = nix::unistd::dup(fd)?;
        // SAFETY: dup() just handed us ownership of this descriptor.
        Ok(unsafe { Stdio::from(OwnedFd::from_raw_fd(dup)) })
    };

    let spawned = (|| -> io::Result<()> {
        let child = Command::new(&svc.cmd)
            .args(&svc.args)
            .stdin(stdio(fd)?)
            .stdout(stdio(fd)?)
            .stderr(stdio(fd)?)
            .spawn()?;
        debug!("inetd {ident}: handler pid {}", child.id());
        Ok(())
    })();

    if let Err(e) = spawned {
        warn!("inetd {ident}: handler spawn: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cond::CondStore;
    use crate::config::Config;
    use crate::events::Bus;
    use crate::launch::testing::FakeSpawner;
    use crate::supervisor::KindMask;
    use crate::svc::{Runlevels, Svc};
    use std::path::PathBuf;

    fn core_with_inetd(port: u16) -> (tempfile::TempDir, Core<FakeSpawner>) {
        let dir = tempfile::tempdir().unwrap();
        let bus = Bus::new(64);
        let conds = CondStore::open(dir.path().join("cond"), bus.clone()).unwrap();
        let mut core = Core::new(Config::default(), conds, bus, FakeSpawner::new());

        let cmd = PathBuf::from("/sbin/handler");
        let mut svc = Svc::new(Ident::new(SvcKind::Inetd, &cmd, None), cmd, vec![]);
        svc.runlevels = Runlevels::parse("2").unwrap();
        svc.port = Some(port);
        core.registry.add(svc).unwrap();
        (dir, core)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn listener_follows_record_state() {
        let (_d, mut core) = core_with_inetd(0);
        let mut table = InetdTable::new();
        let ident = core.registry.iter().next().unwrap().ident.clone();

        // Not in runlevel: no listener.
        table.sync(&core);
        assert!(table.local_addr(&ident).is_none());

        core.runlevel_set(2);
        table.sync(&core);
        let addr = table.local_addr(&ident).expect("listener bound");

        // A client connect is surfaced with the owning identity.
        let conn = tokio::net::TcpStream::connect(addr);
        let ((got, _stream), _conn) = tokio::join!(table.accept(), conn);
        assert_eq!(got, ident);

        // Stopping the record drops the listener.
        core.op_stop("handler").unwrap();
        core.step_all(KindMask::ALL);
        table.sync(&core);
        assert!(table.local_addr(&ident).is_none());
    }
}
