//! Library surface for the daemon binary: every module here is wired together by `main.rs`,
//! and exposed as a crate so `tests/` can drive the job state machine end to end over real
//! loopback sockets without re-implementing the wire protocol.

pub mod cli;
pub mod codec;
pub mod compiler;
pub mod config;
pub mod error;
pub mod job;
pub mod listener;
pub mod logging;
pub mod pool;
pub mod stats;
