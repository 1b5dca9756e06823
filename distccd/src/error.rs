//! The tagged error enum every component returns through, and the single place that maps a
//! `DaemonError` onto the process exit code table in [100, 255]. Per-request variants never
//! become a process exit code directly — the job server logs them and drops the connection;
//! only a handful of fatal variants ever reach `main`'s `std::process::exit`.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("general failure: {0}")]
    GeneralFailure(String),

    #[error("bad arguments: {0}")]
    BadArguments(String),

    #[error("bind failed: {0}")]
    BindFailed(#[source] std::io::Error),

    #[error("connect failed: {0}")]
    ConnectFailed(#[source] std::io::Error),

    #[error("compiler crashed: {0}")]
    CompilerCrashed(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("bad hostspec {0:?}: {1}")]
    BadHostspec(String, #[source] acl::AclError),

    #[error("io error: {0}")]
    IoError(#[source] std::io::Error),

    #[error("truncated stream: {0}")]
    Truncated(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("compiler missing: {0}")]
    CompilerMissing(String),

    #[error("distccd invoked itself recursively")]
    Recursion,

    #[error("failed to drop privileges: {0}")]
    SetuidFailed(#[source] nix::Error),

    #[error("access denied for {0}")]
    AccessDenied(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("no such file: {0}")]
    NoSuchFile(String),

    #[error("no hosts configured")]
    NoHosts,

    #[error("gone: {0}")]
    Gone(String),

    #[error("timeout: {0}")]
    Timeout(String),
}

impl DaemonError {
    /// The exit code this error maps to, per the `dcc_exitcode` table. Exhaustive by
    /// construction: every variant has an explicit arm and there is no wildcard, so a new
    /// variant that forgets to extend this match fails to compile.
    pub fn exit_code(&self) -> u8 {
        match self {
            DaemonError::GeneralFailure(_) => 100,
            DaemonError::BadArguments(_) => 101,
            DaemonError::BindFailed(_) => 102,
            DaemonError::ConnectFailed(_) => 103,
            DaemonError::CompilerCrashed(_) => 104,
            DaemonError::OutOfMemory => 105,
            DaemonError::BadHostspec(_, _) => 106,
            DaemonError::IoError(_) => 107,
            DaemonError::Truncated(_) => 108,
            DaemonError::ProtocolError(_) => 109,
            DaemonError::CompilerMissing(_) => 110,
            DaemonError::Recursion => 111,
            DaemonError::SetuidFailed(_) => 112,
            DaemonError::AccessDenied(_) => 113,
            DaemonError::Busy(_) => 114,
            DaemonError::NoSuchFile(_) => 115,
            DaemonError::NoHosts => 116,
            DaemonError::Gone(_) => 117,
            DaemonError::Timeout(_) => 118,
        }
    }

    /// True for per-request errors that must never take down the worker's accept loop, only
    /// the single connection being serviced.
    pub fn is_per_request(&self) -> bool {
        matches!(
            self,
            DaemonError::ConnectFailed(_)
                | DaemonError::AccessDenied(_)
                | DaemonError::IoError(_)
                | DaemonError::Truncated(_)
                | DaemonError::ProtocolError(_)
                | DaemonError::CompilerCrashed(_)
                | DaemonError::CompilerMissing(_)
                | DaemonError::Timeout(_)
        )
    }
}

impl From<wire::WireError> for DaemonError {
    fn from(e: wire::WireError) -> DaemonError {
        match e {
            wire::WireError::Truncated { .. } => DaemonError::Truncated(e.to_string()),
            other => DaemonError::ProtocolError(other.to_string()),
        }
    }
}

impl From<jobtree::JobTreeError> for DaemonError {
    fn from(e: jobtree::JobTreeError) -> DaemonError {
        match e {
            jobtree::JobTreeError::Io(io) => DaemonError::IoError(io),
            jobtree::JobTreeError::PathEscape(p) => DaemonError::ProtocolError(format!("path escapes job root: {p:?}")),
        }
    }
}

impl From<auth::AuthError> for DaemonError {
    fn from(e: auth::AuthError) -> DaemonError {
        match e {
            auth::AuthError::Io(io) => DaemonError::IoError(io),
            auth::AuthError::Timeout => DaemonError::Timeout("auth handshake".into()),
            auth::AuthError::Failed(msg) => DaemonError::AccessDenied(msg),
            auth::AuthError::Denied(principal) => DaemonError::AccessDenied(principal),
        }
    }
}

impl From<std::io::Error> for DaemonError {
    fn from(e: std::io::Error) -> DaemonError {
        DaemonError::IoError(e)
    }
}

/// Wraps a phase name onto an error for logging without losing the original `Display` text.
pub struct WithPhase<'a>(pub &'a str, pub &'a DaemonError);

impl fmt::Display for WithPhase<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0, self.1)
    }
}
