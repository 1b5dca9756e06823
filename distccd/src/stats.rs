//! Per-event counters reported from worker to supervisor over a pipe created before fork.
//! Grounded on the upstream `stats.c` design: one fixed-size record per event, written with a
//! single `write(2)` well under `PIPE_BUF` so the kernel guarantees the record is never
//! interleaved with a write from a sibling worker. Only the write side (workers) and the
//! aggregation side (supervisor) are in scope; rendering the counters is a dashboard concern.

use serde::Serialize;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::FromRawFd;
use thiserror::Error;

const RECORD_LEN: usize = 8;
const TAG_TCP_ACCEPT: u8 = 1;
const TAG_COMPILE_OK: u8 = 2;
const TAG_COMPILE_FAILED: u8 = 3;
const TAG_ACCESS_DENIED: u8 = 4;
const TAG_PROTOCOL_ERROR: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    TcpAccept,
    CompileOk,
    CompileFailed,
    AccessDenied,
    ProtocolError,
}

impl Event {
    fn tag(self) -> u8 {
        match self {
            Event::TcpAccept => TAG_TCP_ACCEPT,
            Event::CompileOk => TAG_COMPILE_OK,
            Event::CompileFailed => TAG_COMPILE_FAILED,
            Event::AccessDenied => TAG_ACCESS_DENIED,
            Event::ProtocolError => TAG_PROTOCOL_ERROR,
        }
    }

    fn from_tag(tag: u8) -> Option<Event> {
        match tag {
            TAG_TCP_ACCEPT => Some(Event::TcpAccept),
            TAG_COMPILE_OK => Some(Event::CompileOk),
            TAG_COMPILE_FAILED => Some(Event::CompileFailed),
            TAG_ACCESS_DENIED => Some(Event::AccessDenied),
            TAG_PROTOCOL_ERROR => Some(Event::ProtocolError),
            _ => None,
        }
    }

    fn encode(self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[0] = self.tag();
        buf
    }
}

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("io error writing stats record: {0}")]
    Io(#[from] io::Error),

    #[error("short write of stats record: expected {expected} bytes, wrote {actual}")]
    ShortWrite { expected: usize, actual: usize },
}

/// Anything that can perform a single, non-retrying write syscall. `write_all` is
/// deliberately not used here: looping to complete a short write would let another worker's
/// record interleave with the tail of ours, which is exactly what staying under `PIPE_BUF`
/// is meant to prevent.
pub trait RawWrite {
    fn write_once(&mut self, buf: &[u8]) -> io::Result<usize>;
}

impl RawWrite for File {
    fn write_once(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(self, buf)
    }
}

pub struct StatsWriter<W: RawWrite = File> {
    inner: W,
}

impl StatsWriter<File> {
    pub fn from_fd(fd: std::os::unix::io::RawFd) -> StatsWriter<File> {
        StatsWriter {
            inner: unsafe { File::from_raw_fd(fd) },
        }
    }
}

impl<W: RawWrite> StatsWriter<W> {
    pub fn new(inner: W) -> StatsWriter<W> {
        StatsWriter { inner }
    }

    pub fn record(&mut self, event: Event) -> Result<(), StatsError> {
        let buf = event.encode();
        let n = self.inner.write_once(&buf)?;
        if n != buf.len() {
            return Err(StatsError::ShortWrite {
                expected: buf.len(),
                actual: n,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsCounters {
    pub tcp_accepts: u64,
    pub compiles: u64,
    pub compile_failures: u64,
    pub connections_refused: u64,
    pub protocol_errors: u64,
}

impl StatsCounters {
    pub fn apply(&mut self, event: Event) {
        match event {
            Event::TcpAccept => self.tcp_accepts += 1,
            Event::CompileOk => self.compiles += 1,
            Event::CompileFailed => self.compile_failures += 1,
            Event::AccessDenied => self.connections_refused += 1,
            Event::ProtocolError => self.protocol_errors += 1,
        }
    }

    /// Cheap snapshot a pull-based exposition endpoint would serialize; the write side never
    /// blocks on a reader taking this snapshot since it's a plain clone.
    pub fn snapshot(&self) -> StatsCounters {
        self.clone()
    }
}

/// Drains whatever whole records are available on the read end of the stats pipe, holding
/// back a partial trailing record (which cannot happen with a conforming writer, but the
/// reader doesn't trust that) until the rest arrives.
pub struct StatsReader {
    inner: File,
    pending: Vec<u8>,
}

impl StatsReader {
    pub fn from_fd(fd: std::os::unix::io::RawFd) -> StatsReader {
        StatsReader {
            inner: unsafe { File::from_raw_fd(fd) },
            pending: Vec::new(),
        }
    }

    /// Non-blocking-friendly: the caller is expected to have already learned (via `select`)
    /// that the fd is readable. Reads once, applies every complete record found, and returns
    /// how many were applied.
    pub fn drain_into(&mut self, counters: &mut StatsCounters) -> io::Result<usize> {
        let mut buf = [0u8; 4096];
        let n = self.inner.read(&mut buf)?;
        if n == 0 {
            return Ok(0);
        }
        self.pending.extend_from_slice(&buf[..n]);

        let mut applied = 0;
        let mut offset = 0;
        while self.pending.len() - offset >= RECORD_LEN {
            if let Some(event) = Event::from_tag(self.pending[offset]) {
                counters.apply(event);
                applied += 1;
            }
            offset += RECORD_LEN;
        }
        self.pending.drain(..offset);
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct MockPipe {
        responses: VecDeque<io::Result<usize>>,
    }

    impl RawWrite for MockPipe {
        fn write_once(&mut self, _buf: &[u8]) -> io::Result<usize> {
            self.responses.pop_front().unwrap()
        }
    }

    #[test]
    fn full_write_is_reported_as_success() {
        let mut writer = StatsWriter::new(MockPipe {
            responses: VecDeque::from([Ok(RECORD_LEN)]),
        });
        assert!(writer.record(Event::CompileOk).is_ok());
    }

    #[test]
    fn short_write_is_reported_not_silently_completed() {
        let mut writer = StatsWriter::new(MockPipe {
            responses: VecDeque::from([Ok(RECORD_LEN - 1)]),
        });
        let err = writer.record(Event::CompileOk).unwrap_err();
        assert!(matches!(err, StatsError::ShortWrite { .. }));
    }

    #[test]
    fn record_is_well_under_pipe_buf() {
        assert!(RECORD_LEN <= 512, "POSIX guarantees atomic writes up to PIPE_BUF (>=512)");
    }

    #[test]
    fn counters_tally_events() {
        let mut counters = StatsCounters::default();
        counters.apply(Event::TcpAccept);
        counters.apply(Event::CompileOk);
        counters.apply(Event::CompileFailed);
        counters.apply(Event::AccessDenied);
        assert_eq!(counters.tcp_accepts, 1);
        assert_eq!(counters.compiles, 1);
        assert_eq!(counters.compile_failures, 1);
        assert_eq!(counters.connections_refused, 1);
    }
}
