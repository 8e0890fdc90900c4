//! # Terminal device handling for `tty` records.
//!
//! A `tty` record is a supervised service whose command is the system
//! getty. This module resolves the configured device — including the
//! `@console` alias, which asks sysfs for the active console — and
//! verifies it is a real character device before a getty is spawned on
//! it. Stopping a getty is always an immediate SIGKILL; giving a login
//! prompt TERM grace only delays the runlevel change.

use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use log::debug;

const DEV: &str = "/dev/";
const SYS_CONSOLE: &str = "/sys/class/tty/console/active";

/// Resolves a configured tty name to a device path.
///
/// `@console` is auto-detected from sysfs (embedded boards mostly); bare
/// names get the `/dev/` prefix. A device that does not exist yet is
/// still returned: USB serial adapters appear late, and the respawn
/// path retries.
pub fn canonicalize(name: &str) -> Option<PathBuf> {
    let name = if name == "@console" {
        let active = fs::read_to_string(SYS_CONSOLE).ok()?;
        let first = active.split_whitespace().next()?.to_string();
        debug!("@console resolved to {first}");
        first
    } else {
        name.to_string()
    };

    let path = if name.starts_with(DEV) {
        PathBuf::from(&name)
    } else {
        Path::new(DEV).join(&name)
    };
    Some(path)
}

/// True when the device exists and is a character device ready for a
/// getty. A missing device is "not yet", not an error.
pub fn usable(dev: &Path) -> bool {
    match fs::metadata(dev) {
        Ok(meta) => meta.file_type().is_char_device(),
        Err(_) => false,
    }
}
