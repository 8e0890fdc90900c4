//! # Error types used by the supervisor core.
//!
//! This module defines two main error enums:
//!
//! - [`InitError`] errors raised by the supervisor runtime itself.
//! - [`ConfError`] errors raised while parsing or applying configuration.
//!
//! Both types provide an `as_label` helper returning a short stable
//! snake_case name for logs. [`InitError`] additionally answers
//! `is_fatal()`: a fatal error drops pid 1 into the emergency shell,
//! everything else is handled locally and retried.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// # Errors produced by the supervisor runtime.
///
/// These represent failures in the init system itself, not in managed
/// processes. Managed-process failures surface as service state
/// (`crashed`) plus log records, never as an `InitError`.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum InitError {
    /// Forking or exec'ing a service command failed.
    #[error("failed launching '{ident}': {source}")]
    Launch {
        /// Identity of the record being launched.
        ident: String,
        source: io::Error,
    },

    /// Writing a condition file failed.
    ///
    /// Fatal only before the condition directory is first writable;
    /// afterwards the write is retried on the next `step_all`.
    #[error("condition store '{path}': {source}")]
    CondStore { path: PathBuf, source: io::Error },

    /// The control FIFO could not be created or re-opened.
    #[error("control fifo '{path}': {source}")]
    ControlFifo { path: PathBuf, source: io::Error },

    /// A client sent a malformed control frame.
    #[error("bad control frame: {reason}")]
    BadFrame { reason: String },

    /// No record matches the given identity.
    #[error("no such service '{ident}'")]
    UnknownService { ident: String },

    /// A record with this identity is already registered.
    #[error("service '{ident}' already registered")]
    DuplicateService { ident: String },

    /// The process table is exhausted or the kernel refused to fork.
    ///
    /// Always fatal: pid 1 falls back to the emergency shell.
    #[error("cannot fork: {source}")]
    Fork { source: io::Error },

    /// The system console could not be opened.
    #[error("cannot open console '{path}': {source}")]
    Console { path: PathBuf, source: io::Error },
}

impl InitError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            InitError::Launch { .. } => "launch_failed",
            InitError::CondStore { .. } => "cond_store",
            InitError::ControlFifo { .. } => "control_fifo",
            InitError::BadFrame { .. } => "bad_frame",
            InitError::UnknownService { .. } => "unknown_service",
            InitError::DuplicateService { .. } => "duplicate_service",
            InitError::Fork { .. } => "fork_failed",
            InitError::Console { .. } => "console",
        }
    }

    /// Fatal errors invoke the emergency-shell fallback; pid 1 never exits.
    pub fn is_fatal(&self) -> bool {
        matches!(self, InitError::Fork { .. } | InitError::Console { .. })
    }
}

/// # Errors produced while parsing or applying configuration.
///
/// A configuration error rejects the whole file: the previously applied
/// generation stays live and no record is half-applied.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConfError {
    /// The configuration file could not be read.
    #[error("cannot read '{path}': {source}")]
    Read { path: PathBuf, source: io::Error },

    /// A line did not parse as any known directive.
    #[error("{file}:{line}: malformed directive: {reason}")]
    Malformed {
        file: PathBuf,
        line: usize,
        reason: String,
    },

    /// An unknown service type keyword was used.
    #[error("{file}:{line}: unknown service type '{kind}'")]
    UnknownKind {
        file: PathBuf,
        line: usize,
        kind: String,
    },

    /// Start conditions form a cycle over `service/*` edges.
    ///
    /// Cycles are rejected, never resolved.
    #[error("dependency cycle: {}", chain.join(" -> "))]
    Cycle { chain: Vec<String> },

    /// An `include` file was included more than once (directly or not).
    #[error("{file}: recursive include")]
    RecursiveInclude { file: PathBuf },
}

impl ConfError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfError::Read { .. } => "conf_read",
            ConfError::Malformed { .. } => "conf_malformed",
            ConfError::UnknownKind { .. } => "conf_unknown_kind",
            ConfError::Cycle { .. } => "conf_cycle",
            ConfError::RecursiveInclude { .. } => "conf_recursive_include",
        }
    }
}
