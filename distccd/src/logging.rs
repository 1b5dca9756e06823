//! Structured logging, built once at startup and cloned into every worker, using the `slog` +
//! `sloggers` pairing: a `Logger` is cheap to clone (it's reference-counted internally) and
//! every phase of the job state machine logs through it with key-value fields instead of ad
//! hoc string formatting.

use crate::config::{Config, LogLevel};
use slog::{o, Drain};
use sloggers::file::FileLoggerBuilder;
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

pub type Logger = slog::Logger;

fn severity_of(level: LogLevel) -> Severity {
    match level {
        LogLevel::Critical => Severity::Critical,
        LogLevel::Error => Severity::Error,
        LogLevel::Warning => Severity::Warning,
        LogLevel::Info => Severity::Info,
        LogLevel::Debug => Severity::Debug,
        LogLevel::Trace => Severity::Trace,
    }
}

/// Build the root logger from `--log-file` / `--log-stderr` / `--log-level`. When both a log
/// file and stderr are requested the file sink wins; `--no-fifo` has no effect here since this
/// core never creates the named-pipe aggregation sink some deployments layer on top.
pub fn build(config: &Config) -> slog::Logger {
    let severity = severity_of(config.log_level);

    let drain: Box<dyn Drain<Ok = (), Err = slog::Never> + Send> = if let Some(path) = &config.log_file {
        let mut builder = FileLoggerBuilder::new(path);
        builder.level(severity);
        match builder.build() {
            Ok(logger_drain) => Box::new(logger_drain),
            Err(e) => {
                eprintln!("distccd: failed to open log file {path:?}: {e}, falling back to stderr");
                Box::new(stderr_drain(severity))
            }
        }
    } else {
        Box::new(stderr_drain(severity))
    };

    slog::Logger::root(std::sync::Mutex::new(drain).fuse(), o!("pid" => std::process::id()))
}

fn stderr_drain(severity: Severity) -> impl Drain<Ok = (), Err = slog::Never> {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(severity);
    builder.destination(Destination::Stderr);
    builder.build().expect("terminal logger builder never fails")
}

/// Narrow the root logger to a phase of the job state machine, attaching context fields that
/// appear on every subsequent log line from the returned logger.
pub fn for_phase(log: &Logger, phase: &'static str) -> Logger {
    log.new(o!("phase" => phase))
}

pub fn for_connection(log: &Logger, phase: &'static str, peer: std::net::IpAddr) -> Logger {
    log.new(o!("phase" => phase, "peer" => peer.to_string()))
}
