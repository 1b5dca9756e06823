//! Redirects file descriptors, forks and execs the real compiler in its own process group,
//! and collects its exit status with an optional I/O timeout: the classic fork/exec/waitpid
//! shape for running a child under a deadline.

use crate::error::DaemonError;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{self, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use std::ffi::CString;
use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{Duration, Instant};

/// The compiler's wait status, packed as `(signal << 8) | exit_code` so a caller can tell a
/// normal non-zero exit apart from signal death without inspecting two separate fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileStatus(u16);

impl CompileStatus {
    pub fn exited(code: u8) -> CompileStatus {
        CompileStatus(code as u16)
    }

    pub fn signaled(signal: i32) -> CompileStatus {
        CompileStatus(((signal as u16) & 0xff) << 8)
    }

    pub fn is_signal(&self) -> bool {
        (self.0 >> 8) != 0
    }

    pub fn code(&self) -> u8 {
        (self.0 & 0xff) as u8
    }

    pub fn signal(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// The value transmitted on the wire in the `STAT` frame.
    pub fn wire_value(&self) -> u32 {
        self.0 as u32
    }
}

/// Redirect fd 0/1/2 to the given paths; `None` maps to `/dev/null`. Used in the child after
/// `fork`, before `exec`.
pub fn redirect_fds(stdin_path: Option<&Path>, stdout_path: Option<&Path>, stderr_path: Option<&Path>) -> nix::Result<()> {
    redirect_one(0, stdin_path, false)?;
    redirect_one(1, stdout_path, true)?;
    redirect_one(2, stderr_path, true)?;
    Ok(())
}

fn redirect_one(target_fd: i32, path: Option<&Path>, writable: bool) -> nix::Result<()> {
    let file = match path {
        Some(p) => {
            let mut opts = OpenOptions::new();
            if writable {
                opts.write(true).create(true).truncate(true);
            } else {
                opts.read(true);
            }
            opts.open(p)
        }
        None => OpenOptions::new().read(!writable).write(writable).open("/dev/null"),
    }
    .map_err(|_| nix::Error::EIO)?;

    unistd::dup2(file.as_raw_fd(), target_fd)?;
    Ok(())
}

/// Fork and exec `argv` inside `job_root`, placing the child in its own process group and
/// resetting the signal dispositions it would otherwise inherit from the worker.
pub fn spawn_child(argv: &[String], job_root: &Path) -> Result<Pid, DaemonError> {
    spawn_child_with_stdio(argv, job_root, None, None, None)
}

/// Same as [`spawn_child`] but redirects the child's stdio to the given paths first (`None`
/// maps to `/dev/null`), matching the `redirect_fds` contract.
pub fn spawn_child_with_stdio(
    argv: &[String],
    job_root: &Path,
    stdin_path: Option<&Path>,
    stdout_path: Option<&Path>,
    stderr_path: Option<&Path>,
) -> Result<Pid, DaemonError> {
    if argv.is_empty() {
        return Err(DaemonError::BadArguments("empty argv".into()));
    }

    match unsafe { unistd::fork() }.map_err(|e| DaemonError::GeneralFailure(format!("fork failed: {e}")))? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            let _ = unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0));
            for sig in [Signal::SIGTERM, Signal::SIGINT, Signal::SIGHUP, Signal::SIGALRM, Signal::SIGPIPE] {
                unsafe {
                    let _ = signal::signal(sig, SigHandler::SigDfl);
                }
            }
            if redirect_fds(stdin_path, stdout_path, stderr_path).is_err() {
                unsafe { libc::_exit(127) };
            }
            if unistd::chdir(job_root).is_err() {
                unsafe { libc::_exit(127) };
            }

            let c_argv: Vec<CString> = argv.iter().map(|a| CString::new(a.as_str()).unwrap_or_default()).collect();
            let c_argv_refs: Vec<&std::ffi::CStr> = c_argv.iter().map(|c| c.as_c_str()).collect();

            match unistd::execvp(&c_argv[0], &c_argv_refs) {
                Ok(_) => unreachable!("execvp does not return on success"),
                Err(_) => unsafe { libc::_exit(127) },
            }
        }
    }
}

/// Wait for `pid`, killing its process group and retrying if `deadline` elapses first.
pub fn collect_child(pid: Pid, deadline: Option<Duration>) -> Result<WaitStatus, DaemonError> {
    let start = Instant::now();
    loop {
        match wait::waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if let Some(limit) = deadline {
                    if start.elapsed() >= limit {
                        kill_process_group(pid);
                        return wait_blocking(pid);
                    }
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Ok(status) => return Ok(status),
            Err(nix::Error::EINTR) => continue,
            Err(e) => return Err(DaemonError::GeneralFailure(format!("waitpid failed: {e}"))),
        }
    }
}

fn wait_blocking(pid: Pid) -> Result<WaitStatus, DaemonError> {
    loop {
        match wait::waitpid(pid, None) {
            Ok(status) => return Ok(status),
            Err(nix::Error::EINTR) => continue,
            Err(e) => return Err(DaemonError::GeneralFailure(format!("waitpid failed: {e}"))),
        }
    }
}

fn kill_process_group(pid: Pid) {
    let pgid = Pid::from_raw(-pid.as_raw());
    let _ = signal::kill(pgid, Signal::SIGTERM);
    std::thread::sleep(Duration::from_millis(200));
    let _ = signal::kill(pgid, Signal::SIGKILL);
}

/// Map a `waitpid` outcome onto a [`CompileStatus`] and, where it represents a failure the
/// job server must report upstream (rather than just a nonzero compile), the matching error.
pub fn critique_status(status: WaitStatus) -> (CompileStatus, Option<DaemonError>) {
    match status {
        WaitStatus::Exited(_, code) if code == 127 => (
            CompileStatus::exited(127),
            Some(DaemonError::CompilerMissing("exec failed: compiler not found on PATH".into())),
        ),
        WaitStatus::Exited(_, code) => (CompileStatus::exited(code as u8), None),
        WaitStatus::Signaled(_, sig, _) => (
            CompileStatus::signaled(sig as i32),
            Some(DaemonError::CompilerCrashed(format!("killed by signal {sig:?}"))),
        ),
        other => (
            CompileStatus::exited(100),
            Some(DaemonError::GeneralFailure(format!("unexpected wait status: {other:?}"))),
        ),
    }
}
