//! `clap` derive surface mirroring the CLI flags from the external interface table. Parsing
//! only builds a [`RawArgs`]; validation and environment-variable layering happen in
//! [`crate::config::Config::from_args`] so the two concerns stay separately testable.

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "distccd", version, about = "Distributed compiler server")]
pub struct RawArgs {
    /// Run as a standalone daemon accepting its own TCP connections.
    #[arg(long, conflicts_with = "inetd")]
    pub daemon: bool,

    /// Run as a super-server (inetd/xinetd) job, consuming one connection from fd 0/1.
    #[arg(long)]
    pub inetd: bool,

    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub listen: Option<String>,

    /// `ADDR[/BITS]`; repeatable. Installs the canonical private-network set if omitted.
    #[arg(long = "allow")]
    pub allow: Vec<String>,

    #[arg(long)]
    pub allow_private: bool,

    #[arg(long)]
    pub jobs: Option<usize>,

    #[arg(long)]
    pub nice: Option<i32>,

    #[arg(long)]
    pub user: Option<String>,

    #[arg(long)]
    pub job_lifetime: Option<u64>,

    #[arg(long)]
    pub lifetime: Option<u64>,

    #[arg(long)]
    pub log_file: Option<String>,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[arg(long)]
    pub log_stderr: bool,

    #[arg(short, long)]
    pub verbose: bool,

    #[arg(long)]
    pub no_detach: bool,

    #[arg(long)]
    pub no_fork: bool,

    #[arg(long)]
    pub no_fifo: bool,

    #[arg(long)]
    pub pid_file: Option<String>,

    #[arg(long)]
    pub auth: bool,

    #[arg(long)]
    pub blacklist: Option<String>,

    #[arg(long)]
    pub whitelist: Option<String>,

    /// Disables the masquerade-directory precondition check.
    #[arg(long)]
    pub enable_tcp_insecure: bool,
}
