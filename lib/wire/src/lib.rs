//! Frame codec for the distccd wire protocol.
//!
//! Every packet on the wire is a 12-byte header — a 4-byte ASCII token followed by
//! 8 ASCII hex digits carrying either a numeric parameter or a payload length — optionally
//! followed by that many raw payload bytes. The header shape and token set must stay
//! bit-exact: existing clients parse these bytes directly.

use std::io::{self, Read, Write};
use thiserror::Error;

/// The fixed token set used by the request/response state machine (see `job` crate).
pub mod token {
    pub const DIST: &str = "DIST";
    pub const ARGC: &str = "ARGC";
    pub const ARGV: &str = "ARGV";
    pub const CDIR: &str = "CDIR";
    pub const DOTI: &str = "DOTI";
    pub const NFIL: &str = "NFIL";
    pub const NAME: &str = "NAME";
    pub const FILE: &str = "FILE";
    pub const LINK: &str = "LINK";
    pub const DONE: &str = "DONE";
    pub const STAT: &str = "STAT";
    pub const SERR: &str = "SERR";
    pub const SOUT: &str = "SOUT";
    pub const DOTO: &str = "DOTO";
    pub const TLEN: &str = "TLEN";
}

const HEADER_LEN: usize = 12;
const TOKEN_LEN: usize = 4;
const MAX_EXCERPT: usize = 200;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("token {0:?} is not exactly 4 ASCII bytes")]
    BadToken(String),

    #[error("malformed length/value field {0:?} in header")]
    MalformedHeader(String),

    #[error("protocol error: expected token {expected}, got {actual} (context: {context:?})")]
    TokenMismatch {
        expected: String,
        actual: String,
        context: String,
    },

    #[error("truncated stream: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
}

impl WireError {
    /// True for errors that should be reported to the caller as a short read, as opposed
    /// to a protocol-level mismatch.
    pub fn is_truncated(&self) -> bool {
        matches!(self, WireError::Truncated { .. })
    }
}

/// Build the printable diagnostic excerpt used whenever a mismatch is reported: up to
/// `MAX_EXCERPT` bytes, stopping at the first non-printable byte encountered.
pub fn diagnostic_excerpt(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take(MAX_EXCERPT)
        .take_while(|b| b.is_ascii_graphic() || **b == b' ')
        .map(|&b| b as char)
        .collect()
}

fn encode_header(token: &str, value: u32) -> Result<[u8; HEADER_LEN], WireError> {
    if token.len() != TOKEN_LEN || !token.is_ascii() {
        return Err(WireError::BadToken(token.to_owned()));
    }

    let mut header = [0u8; HEADER_LEN];
    header[..TOKEN_LEN].copy_from_slice(token.as_bytes());
    (&mut header[TOKEN_LEN..]).write_all(format!("{:08x}", value).as_bytes())?;
    Ok(header)
}

fn decode_header(buf: &[u8; HEADER_LEN]) -> Result<(String, u32), WireError> {
    let token = String::from_utf8_lossy(&buf[..TOKEN_LEN]).into_owned();
    let hex = std::str::from_utf8(&buf[TOKEN_LEN..])
        .map_err(|_| WireError::MalformedHeader(diagnostic_excerpt(buf)))?;
    let value = u32::from_str_radix(hex, 16)
        .map_err(|_| WireError::MalformedHeader(diagnostic_excerpt(buf)))?;
    Ok((token, value))
}

fn read_header<R: Read>(reader: &mut R) -> Result<(String, u32), WireError> {
    let mut buf = [0u8; HEADER_LEN];
    read_exact_mapped(reader, &mut buf)?;
    decode_header(&buf)
}

/// Read a fixed number of bytes, mapping a short read to `WireError::Truncated` instead of
/// the generic `UnexpectedEof` the standard library reports.
fn read_exact_mapped<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), WireError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(WireError::Truncated {
                    expected: buf.len(),
                    actual: filled,
                })
            }
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(WireError::Io(e)),
        }
    }
    Ok(())
}

/// Best-effort continuation read used only to build a diagnostic excerpt after a protocol
/// mismatch has already been detected. Errors are swallowed: the caller already knows the
/// connection is dead, this is purely for the log line.
fn read_extra_for_excerpt<R: Read>(reader: &mut R, want: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(want);
    let mut buf = [0u8; 64];
    while out.len() < want {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
        }
    }
    out
}

/// Write an integer-valued frame: `TOKEN<8 hex digits>`.
pub fn write_int<W: Write>(writer: &mut W, token: &str, value: u32) -> Result<(), WireError> {
    let header = encode_header(token, value)?;
    writer.write_all(&header)?;
    Ok(())
}

/// Write a byte-string frame: `TOKEN<8 hex digit length>` followed by the raw bytes.
pub fn write_string<W: Write>(writer: &mut W, token: &str, bytes: &[u8]) -> Result<(), WireError> {
    write_int(writer, token, bytes.len() as u32)?;
    writer.write_all(bytes)?;
    Ok(())
}

/// Read an integer-valued frame, failing unless its token is exactly `expected`.
pub fn read_int<R: Read>(reader: &mut R, expected: &str) -> Result<u32, WireError> {
    let (token, value) = read_header(reader)?;
    if token != expected {
        let context = diagnostic_excerpt(
            &[token.as_bytes(), &read_extra_for_excerpt(reader, MAX_EXCERPT - token.len())].concat(),
        );
        return Err(WireError::TokenMismatch {
            expected: expected.to_owned(),
            actual: token,
            context,
        });
    }
    Ok(value)
}

/// Read an integer-valued frame without committing to an expected token upfront. Used where
/// more than one token is legal at a given point in the state machine (e.g. `FILE`/`LINK`).
pub fn read_some_int<R: Read>(reader: &mut R) -> Result<(String, u32), WireError> {
    read_header(reader)
}

/// Read a byte-string frame, failing unless its token is exactly `expected`.
pub fn read_string<R: Read>(reader: &mut R, expected: &str) -> Result<Vec<u8>, WireError> {
    let len = read_int(reader, expected)? as usize;
    let mut bytes = vec![0u8; len];
    read_exact_mapped(reader, &mut bytes)?;
    Ok(bytes)
}
