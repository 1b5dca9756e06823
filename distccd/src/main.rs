//! Entry point: parse arguments, build the immutable config and root logger, then dispatch
//! into either the preforking daemon supervisor or a single inetd-handed connection. Every
//! fatal error funnels through [`DaemonError::exit_code`] so the process's exit status matches
//! the `dcc_exitcode` table regardless of which layer produced the error.

use clap::Parser;
use distccd::config::{Config, Mode};
use distccd::error::DaemonError;
use distccd::{cli, job, listener, logging, pool};
use slog::{error, info};

fn main() {
    let args = cli::RawArgs::parse();

    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("distccd: {e}");
            std::process::exit(e.exit_code() as i32);
        }
    };

    let log = logging::build(&config);

    if let Err(e) = run(config, log.clone()) {
        error!(log, "fatal"; "error" => %e, "exit_code" => e.exit_code());
        std::process::exit(e.exit_code() as i32);
    }
}

fn run(config: Config, log: logging::Logger) -> Result<(), DaemonError> {
    match config.mode {
        Mode::Daemon => pool::run(config, log),
        Mode::Inetd => run_inetd(config, log),
    }
}

/// Inetd mode: fd 0 is already a connected socket, there is no accept loop or worker pool —
/// serve the one request this process was handed and exit.
fn run_inetd(config: Config, log: logging::Logger) -> Result<(), DaemonError> {
    let policy = config.load_policy()?;
    let mechanism: Option<Box<dyn auth::Mechanism>> = if config.auth_enabled {
        Some(Box::new(auth::PlaintextMechanism))
    } else {
        None
    };

    let (stream, peer) = listener::accept_from_inetd(&log)?;
    let ctx = job::JobContext {
        config: &config,
        mechanism: mechanism.as_deref(),
        policy: &policy,
    };

    let result = job::serve(stream, peer, &ctx, &log);
    match &result {
        Ok(()) => info!(log, "inetd job done"; "peer" => %peer),
        Err(e) => error!(log, "inetd job failed"; "peer" => %peer, "error" => %e),
    }
    result
}
