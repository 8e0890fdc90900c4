//! # Control FIFO protocol.
//!
//! Clients (initctl, reboot) talk to pid 1 over a well-known FIFO using
//! bounded binary frames:
//!
//! ```text
//! byte  0..4   magic      0x494e4954 ("INIT"), little-endian
//! byte  4      version    protocol version, currently 1
//! byte  5      command    Cmd discriminant
//! byte  6..8   flags      reserved, must be zero
//! byte  8..12  arg len    payload length, <= MAX_ARG
//! byte 12..16  reserved
//! payload      reply FIFO path, NUL, argument bytes
//! ```
//!
//! Every command maps to registry mutations followed by `step_all`; the
//! exit code (and any STATUS text) is written to the per-client reply
//! FIFO named in the payload. The control FIFO is held open read-write
//! and re-opened on EOF or error, so client disconnects never wedge it.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use nix::sys::stat::Mode;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;

use crate::conf;
use crate::error::InitError;
use crate::launch::{emergency_shell, Spawner};
use crate::plugins::PluginSet;
use crate::supervisor::Core;

pub const INIT_MAGIC: u32 = 0x494e_4954;
pub const PROTO_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 16;
/// Bounds the payload; anything larger is a protocol violation.
pub const MAX_ARG: usize = 368;

/// Command codes accepted on the FIFO.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Cmd {
    Stop = 1,
    Start = 2,
    Restart = 3,
    Status = 4,
    Runlevel = 5,
    Reload = 6,
    Debug = 7,
    Emergency = 8,
}

impl TryFrom<u8> for Cmd {
    type Error = u8;
    fn try_from(v: u8) -> Result<Self, u8> {
        Ok(match v {
            1 => Cmd::Stop,
            2 => Cmd::Start,
            3 => Cmd::Restart,
            4 => Cmd::Status,
            5 => Cmd::Runlevel,
            6 => Cmd::Reload,
            7 => Cmd::Debug,
            8 => Cmd::Emergency,
            other => return Err(other),
        })
    }
}

/// One decoded control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub cmd: Cmd,
    pub flags: u16,
    /// Per-client reply FIFO; empty means fire-and-forget.
    pub reply_to: Option<PathBuf>,
    pub arg: String,
}

impl Frame {
    pub fn new(cmd: Cmd, arg: &str) -> Self {
        Self {
            cmd,
            flags: 0,
            reply_to: None,
            arg: arg.to_string(),
        }
    }

    pub fn with_reply(mut self, path: impl Into<PathBuf>) -> Self {
        self.reply_to = Some(path.into());
        self
    }

    /// Serializes header + payload. What initctl puts on the wire.
    pub fn encode(&self) -> Vec<u8> {
        let reply = self
            .reply_to
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut payload = Vec::with_capacity(reply.len() + 1 + self.arg.len());
        payload.extend_from_slice(reply.as_bytes());
        payload.push(0);
        payload.extend_from_slice(self.arg.as_bytes());

        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        buf.extend_from_slice(&INIT_MAGIC.to_le_bytes());
        buf.push(PROTO_VERSION);
        buf.push(self.cmd as u8);
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&payload);
        buf
    }

    /// Decodes one frame from the front of `buf`, consuming it.
    ///
    /// `Ok(None)` means more bytes are needed; an error means the stream
    /// is unsynchronized and the caller should drop the buffer.
    pub fn decode(buf: &mut Vec<u8>) -> Result<Option<Frame>, InitError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let bad = |reason: &str| InitError::BadFrame {
            reason: reason.to_string(),
        };

        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != INIT_MAGIC {
            return Err(bad("bad magic"));
        }
        if buf[4] != PROTO_VERSION {
            return Err(bad("unsupported version"));
        }
        let cmd = Cmd::try_from(buf[5]).map_err(|c| bad(&format!("unknown command {c}")))?;
        let flags = u16::from_le_bytes(buf[6..8].try_into().unwrap());
        let arg_len = u32::from_le_bytes(buf[8..12].try_into().unwrap()) as usize;
        if arg_len > MAX_ARG {
            return Err(bad("oversized payload"));
        }
        if buf.len() < HEADER_LEN + arg_len {
            return Ok(None);
        }

        let payload = &buf[HEADER_LEN..HEADER_LEN + arg_len];
        let (reply, arg) = match payload.iter().position(|&b| b == 0) {
            Some(nul) => (&payload[..nul], &payload[nul + 1..]),
            None => (&payload[..0], payload),
        };
        let frame = Frame {
            cmd,
            flags,
            reply_to: (!reply.is_empty())
                .then(|| PathBuf::from(String::from_utf8_lossy(reply).into_owned())),
            arg: String::from_utf8_lossy(arg).into_owned(),
        };

        buf.drain(..HEADER_LEN + arg_len);
        Ok(Some(frame))
    }
}

/// The supervisor side of the control FIFO.
pub struct ControlFifo {
    path: PathBuf,
    rx: pipe::Receiver,
    buf: Vec<u8>,
}

impl ControlFifo {
    /// Creates the FIFO if needed and opens it. Held open read-write so
    /// an idle FIFO pends instead of reporting EOF.
    pub fn open(path: &Path) -> Result<Self, InitError> {
        let wrap = |source: std::io::Error| InitError::ControlFifo {
            path: path.to_path_buf(),
            source,
        };

        match nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o600)) {
            Ok(()) | Err(nix::errno::Errno::EEXIST) => {}
            Err(e) => return Err(wrap(e.into())),
        }

        let rx = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(path)
            .map_err(wrap)?;

        Ok(Self {
            path: path.to_path_buf(),
            rx,
            buf: Vec::new(),
        })
    }

    /// Waits for the next complete frame, re-opening the FIFO on EOF or
    /// read error and resynchronizing on garbage.
    pub async fn next_frame(&mut self) -> Frame {
        loop {
            match Frame::decode(&mut self.buf) {
                Ok(Some(frame)) => return frame,
                Ok(None) => {}
                Err(e) => {
                    warn!("{e}");
                    self.buf.clear();
                }
            }

            let mut chunk = [0u8; 512];
            match self.rx.read(&mut chunk).await {
                Ok(0) => self.reopen().await,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    warn!("control fifo read: {e}");
                    self.reopen().await;
                }
            }
        }
    }

    async fn reopen(&mut self) {
        debug!("re-opening control fifo");
        loop {
            match ControlFifo::open(&self.path) {
                Ok(fresh) => {
                    self.rx = fresh.rx;
                    self.buf.clear();
                    return;
                }
                Err(e) => {
                    warn!("{e}");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }
}

/// Applies one frame to the supervisor. Returns the client exit code.
pub fn dispatch<S: Spawner>(
    frame: &Frame,
    core: &mut Core<S>,
    plugins: &mut PluginSet<S>,
) -> u8 {
    let (code, text) = match frame.cmd {
        Cmd::Stop => (result_code(core.op_stop(frame.arg.trim())), None),
        Cmd::Start => (result_code(core.op_start(frame.arg.trim())), None),
        Cmd::Restart => (result_code(core.op_restart(frame.arg.trim())), None),
        Cmd::Status => {
            let spec = frame.arg.trim();
            let text = core.status_text((!spec.is_empty()).then_some(spec));
            (0, Some(text))
        }
        Cmd::Runlevel => match parse_runlevel(frame.arg.trim()) {
            Some(level) => {
                core.runlevel_set(level);
                plugins.dispatch_pending(core);
                (0, None)
            }
            None => (1, None),
        },
        Cmd::Reload => (do_reload(core, plugins), None),
        Cmd::Debug => {
            let verbose = log::max_level() < log::LevelFilter::Debug;
            log::set_max_level(if verbose {
                log::LevelFilter::Debug
            } else {
                log::LevelFilter::Info
            });
            info!("debug logging {}", if verbose { "enabled" } else { "disabled" });
            (0, None)
        }
        Cmd::Emergency => match emergency_shell(&core.cfg.shell, &core.cfg.console) {
            Ok(pid) => {
                info!("emergency shell running, pid {pid}");
                (0, None)
            }
            Err(e) => {
                warn!("{e}");
                (1, None)
            }
        },
    };

    if let Some(reply) = &frame.reply_to {
        send_reply(reply, code, text.as_deref());
    }
    code
}

/// Reparses configuration and reconciles. A parse error leaves the
/// running generation untouched and returns non-zero.
pub fn do_reload<S: Spawner>(core: &mut Core<S>, plugins: &mut PluginSet<S>) -> u8 {
    let parsed = match conf::load(&core.cfg) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("reload rejected ({}): {e}", e.as_label());
            return 1;
        }
    };

    core.apply_records(parsed.records);
    // SvcReconf (queued by apply_records) lets the pidfile watcher and
    // friends re-assert conditions for unchanged reality.
    plugins.dispatch_pending(core);
    core.finish_reload();
    plugins.dispatch_pending(core);
    0
}

fn result_code(res: Result<(), InitError>) -> u8 {
    match res {
        Ok(()) => 0,
        Err(e) => {
            warn!("{e}");
            1
        }
    }
}

/// `0`-`9` plus `s`/`S`, which maps to single-user (runlevel 1).
fn parse_runlevel(arg: &str) -> Option<u8> {
    match arg.as_bytes().first()? {
        b'0'..=b'9' => Some(arg.as_bytes()[0] - b'0'),
        b's' | b'S' => Some(1),
        _ => None,
    }
}

/// Best-effort write to the client's reply FIFO: one status line with the
/// exit code, then any payload text. The client holds the read end; a
/// vanished client must not block pid 1.
fn send_reply(path: &Path, code: u8, text: Option<&str>) {
    let opened = OpenOptions::new()
        .write(true)
        .custom_flags(nix::libc::O_NONBLOCK)
        .open(path);
    match opened {
        Ok(mut f) => {
            let _ = writeln!(f, "{code}");
            if let Some(text) = text {
                let _ = f.write_all(text.as_bytes());
            }
        }
        Err(e) => debug!("reply fifo {}: {e}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cond::CondStore;
    use crate::config::Config;
    use crate::events::Bus;
    use crate::launch::testing::FakeSpawner;
    use crate::svc::{Ident, Runlevels, Svc, SvcKind, SvcState};

    #[test]
    fn frame_roundtrip() {
        let frame = Frame::new(Cmd::Start, "sshd").with_reply("/run/initctl.42");
        let mut wire = frame.encode();
        let decoded = Frame::decode(&mut wire).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(wire.is_empty());
    }

    #[test]
    fn decode_handles_partial_and_coalesced_frames() {
        let a = Frame::new(Cmd::Stop, "one");
        let b = Frame::new(Cmd::Reload, "");

        let mut wire = a.encode();
        wire.extend(b.encode());

        // Feed byte by byte: nothing decodes until a frame is complete.
        let mut buf = Vec::new();
        let mut out = Vec::new();
        for byte in wire {
            buf.push(byte);
            while let Some(frame) = Frame::decode(&mut buf).unwrap() {
                out.push(frame);
            }
        }
        assert_eq!(out, vec![a, b]);
    }

    #[test]
    fn decode_rejects_garbage() {
        let mut buf = b"definitely not a frame".to_vec();
        assert!(Frame::decode(&mut buf).is_err());

        let mut frame = Frame::new(Cmd::Stop, "x").encode();
        frame[4] = 99; // version
        let mut buf = frame;
        assert!(Frame::decode(&mut buf).is_err());

        let mut oversized = Frame::new(Cmd::Stop, "x").encode();
        oversized[8..12].copy_from_slice(&(MAX_ARG as u32 + 1).to_le_bytes());
        let mut buf = oversized;
        assert!(Frame::decode(&mut buf).is_err());
    }

    #[test]
    fn runlevel_arg_mapping() {
        assert_eq!(parse_runlevel("3"), Some(3));
        assert_eq!(parse_runlevel("0"), Some(0));
        assert_eq!(parse_runlevel("S"), Some(1));
        assert_eq!(parse_runlevel("s"), Some(1));
        assert_eq!(parse_runlevel("x"), None);
        assert_eq!(parse_runlevel(""), None);
    }

    fn core() -> (tempfile::TempDir, Core<FakeSpawner>) {
        let dir = tempfile::tempdir().unwrap();
        let bus = Bus::new(64);
        let conds = CondStore::open(dir.path().join("cond"), bus.clone()).unwrap();
        (dir, Core::new(Config::default(), conds, bus, FakeSpawner::new()))
    }

    fn add_service(core: &mut Core<FakeSpawner>, name: &str) {
        let cmd = PathBuf::from(format!("/sbin/{name}"));
        let mut svc = Svc::new(Ident::new(SvcKind::Service, &cmd, None), cmd, vec![]);
        svc.runlevels = Runlevels::parse("2").unwrap();
        core.registry.add(svc).unwrap();
    }

    #[test]
    fn stop_start_commands_drive_the_registry() {
        let (_d, mut core) = core();
        let mut plugins = PluginSet::new();
        add_service(&mut core, "sshd");
        core.runlevel_set(2);

        let code = dispatch(&Frame::new(Cmd::Stop, "sshd"), &mut core, &mut plugins);
        assert_eq!(code, 0);
        assert_eq!(
            core.registry.find_by_name("sshd").unwrap().state,
            SvcState::Stopping
        );

        let code = dispatch(&Frame::new(Cmd::Stop, "nosuch"), &mut core, &mut plugins);
        assert_eq!(code, 1);
    }

    #[test]
    fn status_command_reports_text() {
        let (_d, mut core) = core();
        let mut plugins = PluginSet::new();
        add_service(&mut core, "sshd");
        core.runlevel_set(2);

        let dir = tempfile::tempdir().unwrap();
        let reply = dir.path().join("reply");
        nix::unistd::mkfifo(&reply, Mode::from_bits_truncate(0o600)).unwrap();
        // Hold a read end open so the non-blocking reply write succeeds.
        let rx = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(nix::libc::O_NONBLOCK)
            .open(&reply)
            .unwrap();

        let frame = Frame::new(Cmd::Status, "").with_reply(&reply);
        assert_eq!(dispatch(&frame, &mut core, &mut plugins), 0);

        use std::io::Read;
        let mut text = String::new();
        let mut rx = rx;
        let _ = rx.read_to_string(&mut text);
        assert!(text.starts_with("0\n"));
        assert!(text.contains("sshd"));
    }

    #[test]
    fn runlevel_command_transitions() {
        let (_d, mut core) = core();
        let mut plugins = PluginSet::new();
        add_service(&mut core, "sshd");

        dispatch(&Frame::new(Cmd::Runlevel, "2"), &mut core, &mut plugins);
        assert_eq!(core.runlevel, 2);
        assert_eq!(
            core.registry.find_by_name("sshd").unwrap().state,
            SvcState::Running
        );
    }

    #[test]
    fn reload_command_applies_new_config() {
        let (_d, mut core) = core();
        let mut plugins = PluginSet::new();

        let dir = tempfile::tempdir().unwrap();
        let conf_file = dir.path().join("initvisor.conf");
        std::fs::write(&conf_file, "service [2] /sbin/fresh\n").unwrap();
        core.cfg.conf_file = conf_file.clone();
        core.cfg.conf_dir = dir.path().join("none.d");
        core.runlevel_set(2);

        assert_eq!(do_reload(&mut core, &mut plugins), 0);
        assert_eq!(
            core.registry.find_by_name("fresh").unwrap().state,
            SvcState::Running
        );

        // A broken config is rejected wholesale; the record survives.
        std::fs::write(&conf_file, "garbage directive\n").unwrap();
        assert_eq!(do_reload(&mut core, &mut plugins), 1);
        assert!(core.registry.find_by_name("fresh").is_some());
    }
}
