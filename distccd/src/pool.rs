//! Prefork supervisor: keeps `config.workers` children alive, reaps them via a self-pipe so
//! the `SIGCHLD` handler itself does no work, and owns the stats pipe's read side. Grounded on
//! `prefork.c`'s `dcc_preforking_parent`/`dcc_create_kids`/`dcc_preforked_child` loop shape.

use crate::config::{Config, WORKER_MAX_REQUESTS};
use crate::error::DaemonError;
use crate::job::{self, JobContext};
use crate::listener::Listener;
use crate::logging::Logger;
use crate::stats::{Event, StatsCounters, StatsReader, StatsWriter};
use nix::sys::signal::Signal;
use nix::sys::wait::{self, WaitPidFlag, WaitStatus};
use nix::unistd::{ForkResult, Pid};
use slog::{info, o, warn};
use std::io::Read;
use std::os::unix::io::{AsRawFd, IntoRawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub fn run(config: Config, log: Logger) -> Result<(), DaemonError> {
    let policy = config.load_policy()?;
    let mechanism: Option<Box<dyn auth::Mechanism>> = if config.auth_enabled {
        Some(Box::new(auth::PlaintextMechanism))
    } else {
        None
    };
    let _credentials = config.principal.as_deref().map(auth::Credentials::acquire);

    if let Some(user) = &config.drop_user {
        drop_privileges(user, &log)?;
    }

    let listener = Listener::bind(&config, &log)?;

    if let Some(path) = &config.pid_file {
        write_pid_file(path)?;
    }

    let terminate = Arc::new(AtomicBool::new(false));
    for sig in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT, signal_hook::consts::SIGHUP] {
        signal_hook::flag::register(sig, Arc::clone(&terminate)).map_err(DaemonError::IoError)?;
    }

    let (mut sigchld_read, sigchld_write) = UnixStream::pair().map_err(DaemonError::IoError)?;
    sigchld_read.set_nonblocking(true).map_err(DaemonError::IoError)?;
    signal_hook::low_level::pipe::register(signal_hook::consts::SIGCHLD, sigchld_write).map_err(DaemonError::IoError)?;

    let (stats_read_fd, stats_write_fd) = nix::unistd::pipe().map_err(|e| DaemonError::GeneralFailure(e.to_string()))?;
    let (stats_read_fd, stats_write_fd) = (stats_read_fd.into_raw_fd(), stats_write_fd.into_raw_fd());
    let mut stats_reader = StatsReader::from_fd(stats_read_fd);
    let mut counters = StatsCounters::default();

    let mut live_workers: usize = 0;

    info!(log, "supervisor started"; "workers" => config.workers, "port" => config.port);

    'supervisor: loop {
        if terminate.load(Ordering::Relaxed) {
            break 'supervisor;
        }

        while live_workers < config.workers {
            match unsafe { nix::unistd::fork() }.map_err(|e| DaemonError::GeneralFailure(format!("fork failed: {e}")))? {
                ForkResult::Parent { child } => {
                    live_workers += 1;
                    info!(log, "worker started"; "child_pid" => child.as_raw(), "live_workers" => live_workers);
                }
                ForkResult::Child => {
                    drop(sigchld_read);
                    let worker_log = log.new(o!("role" => "worker"));
                    worker_loop(&config, &listener, mechanism.as_deref(), &policy, stats_write_fd, &worker_log);
                    std::process::exit(0);
                }
            }
        }

        let mut pollfds = [
            libc::pollfd { fd: sigchld_read.as_raw_fd(), events: libc::POLLIN, revents: 0 },
            libc::pollfd { fd: stats_read_fd, events: libc::POLLIN, revents: 0 },
        ];
        let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, 1000) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                warn!(log, "supervisor poll failed"; "error" => %err);
            }
            continue;
        }

        if pollfds[0].revents & libc::POLLIN != 0 {
            drain_self_pipe(&mut sigchld_read);
            live_workers -= reap_children(&log);
        }

        if pollfds[1].revents & libc::POLLIN != 0 {
            if let Ok(n) = stats_reader.drain_into(&mut counters) {
                if n > 0 {
                    info!(log, "stats"; "tcp_accepts" => counters.tcp_accepts, "compiles" => counters.compiles,
                        "compile_failures" => counters.compile_failures, "connections_refused" => counters.connections_refused);
                }
            }
        }
    }

    info!(log, "supervisor shutting down"; "live_workers" => live_workers);
    let _ = nix::sys::signal::kill(Pid::from_raw(0), Signal::SIGTERM);
    if let Some(path) = &config.pid_file {
        let _ = std::fs::remove_file(path);
    }
    Ok(())
}

fn reap_children(log: &Logger) -> usize {
    let mut reaped = 0;
    loop {
        match wait::waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(nix::Error::ECHILD) => break,
            Ok(status) => {
                reaped += 1;
                info!(log, "worker exited"; "status" => ?status);
            }
            Err(nix::Error::EINTR) => continue,
            Err(_) => break,
        }
    }
    reaped
}

fn drain_self_pipe(pipe: &mut UnixStream) {
    let mut buf = [0u8; 64];
    loop {
        match pipe.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(_) => break,
        }
    }
}

/// One worker's accept loop: serve up to `WORKER_MAX_REQUESTS` connections or
/// `worker_lifetime_secs`, whichever exhausts last, then return so the caller exits cleanly.
fn worker_loop(
    config: &Config,
    listener: &Listener,
    mechanism: Option<&dyn auth::Mechanism>,
    policy: &auth::PrincipalPolicy,
    stats_fd: std::os::unix::io::RawFd,
    log: &Logger,
) {
    let mut stats = StatsWriter::from_fd(stats_fd);
    if let Some(n) = config.nice {
        renice(n, log);
    }

    let ctx = JobContext { config, mechanism, policy };
    let start = Instant::now();
    let mut requests = 0u32;

    while requests < WORKER_MAX_REQUESTS && start.elapsed() < Duration::from_secs(config.worker_lifetime_secs) {
        let (stream, peer) = match listener.accept_one() {
            Ok(pair) => pair,
            Err(e) => {
                warn!(log, "accept failed"; "error" => %e);
                continue;
            }
        };

        requests += 1;
        let _ = stats.record(Event::TcpAccept);

        match job::serve(stream, peer, &ctx, log) {
            Ok(()) => {
                let _ = stats.record(Event::CompileOk);
            }
            Err(DaemonError::AccessDenied(_)) => {
                let _ = stats.record(Event::AccessDenied);
            }
            Err(DaemonError::ProtocolError(_)) | Err(DaemonError::Truncated(_)) => {
                let _ = stats.record(Event::ProtocolError);
            }
            Err(e) => {
                warn!(log, "job failed"; "error" => %e);
                let _ = stats.record(Event::CompileFailed);
            }
        }
    }

    info!(log, "worker retiring"; "requests" => requests, "elapsed_secs" => start.elapsed().as_secs());
}

fn drop_privileges(username: &str, log: &Logger) -> Result<(), DaemonError> {
    let user = nix::unistd::User::from_name(username)
        .map_err(DaemonError::SetuidFailed)?
        .ok_or_else(|| DaemonError::BadArguments(format!("no such user {username:?}")))?;
    nix::unistd::setgid(user.gid).map_err(DaemonError::SetuidFailed)?;
    nix::unistd::setuid(user.uid).map_err(DaemonError::SetuidFailed)?;
    info!(log, "dropped privileges"; "user" => username, "uid" => user.uid.as_raw());
    Ok(())
}

fn renice(n: i32, log: &Logger) {
    let rc = unsafe {
        *(libc::__errno_location()) = 0;
        libc::nice(n)
    };
    if rc == -1 && std::io::Error::last_os_error().raw_os_error() != Some(0) {
        warn!(log, "renice failed, continuing at current priority"; "requested" => n);
    }
}

fn write_pid_file(path: &std::path::Path) -> Result<(), DaemonError> {
    std::fs::write(path, format!("{}\n", std::process::id())).map_err(DaemonError::IoError)
}
