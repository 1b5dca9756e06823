//! Immutable startup configuration. Built once in `main`, shared read-only by every forked
//! worker. [`Config::from_args`] is the only place CLI flags, environment variables, and
//! built-in defaults are reconciled; once a `Config` exists, nothing in it changes.

use crate::cli::RawArgs;
use crate::error::DaemonError;
use acl::AllowList;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_PORT: u16 = 3632;
pub const DEFAULT_WORKER_LIFETIME_SECS: u64 = 60;
pub const WORKER_MAX_REQUESTS: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Daemon,
    Inetd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<LogLevel, DaemonError> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(LogLevel::Critical),
            "error" => Ok(LogLevel::Error),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(DaemonError::BadArguments(format!("unknown log level {other:?}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub bind_addr: Option<String>,
    pub port: u16,
    pub allow_list: AllowList,
    pub workers: usize,
    pub nice: Option<i32>,
    pub drop_user: Option<String>,
    pub job_lifetime: Option<u64>,
    pub worker_lifetime_secs: u64,
    pub log_file: Option<PathBuf>,
    pub log_level: LogLevel,
    pub log_stderr: bool,
    pub no_detach: bool,
    pub no_fork: bool,
    pub no_fifo: bool,
    pub pid_file: Option<PathBuf>,
    pub auth_enabled: bool,
    pub blacklist_path: Option<PathBuf>,
    pub whitelist_path: Option<PathBuf>,
    pub enable_tcp_insecure: bool,
    pub tmp_root: PathBuf,
    pub compiler_path: Option<String>,
    pub principal: Option<String>,
    pub tcp_defer_accept: bool,
}

impl Config {
    pub fn from_args(args: RawArgs) -> Result<Config, DaemonError> {
        Config::from_args_with_env(args, |key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_args`] but with the environment lookup injected, so config
    /// layering (property 9: CLI overrides env overrides default) is testable without
    /// mutating real process environment variables.
    pub fn from_args_with_env(args: RawArgs, env: impl Fn(&str) -> Option<String>) -> Result<Config, DaemonError> {
        if args.daemon && args.inetd {
            return Err(DaemonError::BadArguments("--daemon and --inetd are mutually exclusive".into()));
        }
        let mode = if args.daemon {
            Mode::Daemon
        } else if args.inetd {
            Mode::Inetd
        } else {
            detect_mode()
        };

        let port = args.port.unwrap_or(DEFAULT_PORT);
        if port == 0 {
            return Err(DaemonError::BadArguments("port must be in [1, 65535]".into()));
        }

        let allow_list = if !args.allow.is_empty() {
            let mut masks = Vec::with_capacity(args.allow.len());
            for spec in &args.allow {
                let mask = acl::AddressMask::parse(spec).map_err(|e| DaemonError::BadHostspec(spec.clone(), e))?;
                masks.push(mask);
            }
            AllowList::new(masks)
        } else if args.allow_private || mode == Mode::Daemon {
            AllowList::canonical_private_networks()
        } else {
            AllowList::default()
        };

        let workers = args.jobs.unwrap_or_else(default_worker_count);

        let mut log_level = LogLevel::from_str(&args.log_level)?;
        if args.verbose && log_level < LogLevel::Debug {
            log_level = LogLevel::Debug;
        }

        let log_file = args.log_file.map(PathBuf::from);
        let log_stderr = args.log_stderr || log_file.is_none();

        let tmp_root = env("TMPDIR").map(PathBuf::from).unwrap_or_else(std::env::temp_dir);
        let compiler_path = env("DISTCCD_PATH");
        let principal = env("DISTCCD_PRINCIPAL");
        let tcp_defer_accept = match env("DISTCC_TCP_DEFER_ACCEPT") {
            Some(v) => !matches!(v.as_str(), "0" | "off" | "no" | "false"),
            None => true,
        };

        Ok(Config {
            mode,
            bind_addr: args.listen,
            port,
            allow_list,
            workers,
            nice: args.nice,
            drop_user: args.user,
            job_lifetime: args.job_lifetime,
            worker_lifetime_secs: args.lifetime.unwrap_or(DEFAULT_WORKER_LIFETIME_SECS),
            log_file,
            log_level,
            log_stderr,
            no_detach: args.no_detach,
            no_fork: args.no_fork,
            no_fifo: args.no_fifo,
            pid_file: args.pid_file.map(PathBuf::from),
            auth_enabled: args.auth,
            blacklist_path: args.blacklist.map(PathBuf::from),
            whitelist_path: args.whitelist.map(PathBuf::from),
            enable_tcp_insecure: args.enable_tcp_insecure,
            tmp_root,
            compiler_path,
            principal,
            tcp_defer_accept,
        })
    }

    /// Load the principal black/white-list named by `--blacklist`/`--whitelist`, if any.
    pub fn load_policy(&self) -> Result<auth::PrincipalPolicy, DaemonError> {
        if let Some(path) = &self.blacklist_path {
            return Ok(auth::PrincipalPolicy::blacklist(read_principal_list(path)?));
        }
        if let Some(path) = &self.whitelist_path {
            return Ok(auth::PrincipalPolicy::whitelist(read_principal_list(path)?));
        }
        Ok(auth::PrincipalPolicy::Open)
    }
}

fn read_principal_list(path: &std::path::Path) -> Result<Vec<String>, DaemonError> {
    let contents = std::fs::read_to_string(path).map_err(DaemonError::IoError)?;
    Ok(contents.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect())
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

/// Auto-detect daemon vs. inetd mode from fd 0, per §4.4: a socket means a super-server
/// handed us a connection; a tty or anything else means run as a standalone daemon.
fn detect_mode() -> Mode {
    unsafe {
        let mut st: libc::stat = std::mem::zeroed();
        if libc::fstat(0, &mut st) != 0 {
            return Mode::Daemon;
        }
        if (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK {
            Mode::Inetd
        } else {
            Mode::Daemon
        }
    }
}
