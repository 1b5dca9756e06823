//! Optional mutual-authentication layer gating a connection before any protocol frame is
//! exchanged. The real mechanism (GSS-API) is an external collaborator with its own credential
//! store and wire format; this crate treats it as opaque behind the [`Mechanism`] trait and
//! ships [`PlaintextMechanism`] as the test double used until a real binding is wired in.

use std::io::{self, Read, Write};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("io error during authentication: {0}")]
    Io(#[from] io::Error),

    #[error("authentication handshake timed out")]
    Timeout,

    #[error("authentication failed: {0}")]
    Failed(String),

    #[error("principal {0:?} denied by policy")]
    Denied(String),
}

fn map_io(e: io::Error) -> AuthError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => AuthError::Timeout,
        _ => AuthError::Io(e),
    }
}

/// The set of security services a mechanism can grant. distccd requires all three before it
/// will trust a principal name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const MUTUAL: Flags = Flags(0b001);
    pub const REPLAY_DETECTION: Flags = Flags(0b010);
    pub const SEQUENCE_DETECTION: Flags = Flags(0b100);
    pub const REQUIRED: Flags = Flags(0b111);

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// Object-safe `Read + Write` so [`Mechanism`] can be stored as `dyn Mechanism`.
pub trait ReadWrite: Read + Write {}
impl<T: Read + Write> ReadWrite for T {}

/// A socket-like type that can have a read deadline installed. Implemented for
/// [`std::net::TcpStream`]; test doubles implement it directly.
pub trait TimedStream: Read + Write {
    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()>;
}

impl TimedStream for std::net::TcpStream {
    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        std::net::TcpStream::set_read_timeout(self, dur)
    }
}

/// The opaque mutual-authentication token exchange. A real deployment plugs in a GSS-API
/// binding here; this crate only defines the contract the job server relies on.
pub trait Mechanism: Send + Sync {
    /// Perform the server side of the token exchange and return the flags the mechanism
    /// granted along with the peer's principal name.
    fn accept(&self, stream: &mut dyn ReadWrite) -> Result<(Flags, String), AuthError>;
}

/// Reference mechanism used by tests and by deployments with no real GSS-API binding
/// available: the "token exchange" is a length-prefixed principal name. It always grants
/// [`Flags::REQUIRED`]. Never use this where the network path isn't already trusted.
pub struct PlaintextMechanism;

impl Mechanism for PlaintextMechanism {
    fn accept(&self, stream: &mut dyn ReadWrite) -> Result<(Flags, String), AuthError> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).map_err(map_io)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > 4096 {
            return Err(AuthError::Failed("principal name too long".into()));
        }
        let mut name_buf = vec![0u8; len];
        stream.read_exact(&mut name_buf).map_err(map_io)?;
        let principal = String::from_utf8(name_buf)
            .map_err(|_| AuthError::Failed("principal name is not valid utf-8".into()))?;
        Ok((Flags::REQUIRED, principal))
    }
}

impl PlaintextMechanism {
    /// Client-side counterpart, used by tests that drive both ends of the handshake.
    pub fn offer<S: Write>(stream: &mut S, principal: &str) -> io::Result<()> {
        let bytes = principal.as_bytes();
        stream.write_all(&(bytes.len() as u32).to_be_bytes())?;
        stream.write_all(bytes)
    }
}

/// Whether a configured principal string names a host-based or a user-name credential; this
/// decides which credential type is acquired at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrincipalNameType {
    HostBased,
    UserName,
}

pub fn principal_name_type(configured: &str) -> PrincipalNameType {
    if configured.contains('@') {
        PrincipalNameType::UserName
    } else {
        PrincipalNameType::HostBased
    }
}

/// Credentials acquired once at startup and released when dropped (on supervisor shutdown).
pub struct Credentials {
    pub name_type: PrincipalNameType,
}

impl Credentials {
    pub fn acquire(configured_principal: &str) -> Credentials {
        Credentials {
            name_type: principal_name_type(configured_principal),
        }
    }
}

/// Black/white-list policy evaluated against the authenticated principal.
pub enum PrincipalPolicy {
    Open,
    Blacklist(Vec<String>),
    Whitelist(Vec<String>),
}

impl PrincipalPolicy {
    pub fn blacklist(mut names: Vec<String>) -> PrincipalPolicy {
        names.sort();
        PrincipalPolicy::Blacklist(names)
    }

    pub fn whitelist(mut names: Vec<String>) -> PrincipalPolicy {
        names.sort();
        PrincipalPolicy::Whitelist(names)
    }

    pub fn is_allowed(&self, principal: &str) -> bool {
        match self {
            PrincipalPolicy::Open => true,
            PrincipalPolicy::Blacklist(list) => list.binary_search_by(|p| p.as_str().cmp(principal)).is_err(),
            PrincipalPolicy::Whitelist(list) => list.binary_search_by(|p| p.as_str().cmp(principal)).is_ok(),
        }
    }
}

/// Exists only between a successful handshake and job completion; destroyed (via normal
/// `Drop`) on every exit path, including early returns from protocol errors.
#[derive(Debug)]
pub struct SecurityContext {
    pub principal: String,
    pub flags: Flags,
}

const HANDSHAKE_BYTE: u8 = b'*';
const ACCESS_GRANTED: u8 = b'y';
const ACCESS_DENIED: u8 = b'n';
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Step 1 of §4.3: exchange the single handshake byte under a 1-second server read deadline.
pub fn handshake<S: TimedStream>(stream: &mut S) -> Result<(), AuthError> {
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf).map_err(map_io)?;
    if buf[0] != HANDSHAKE_BYTE {
        return Err(AuthError::Failed(format!(
            "expected handshake byte '*', got {:#04x}",
            buf[0]
        )));
    }
    stream.write_all(&[HANDSHAKE_BYTE])?;
    Ok(())
}

/// Runs the full server-side authentication flow: handshake, mechanism token exchange, flag
/// verification, policy check, and the final `y`/`n` status byte. On any failure the
/// connection has already been told `n` (if the exchange got that far) and no
/// `SecurityContext` is returned — the caller must still close the connection.
pub fn authenticate<S: TimedStream>(
    stream: &mut S,
    mechanism: &dyn Mechanism,
    policy: &PrincipalPolicy,
) -> Result<SecurityContext, AuthError> {
    handshake(stream)?;

    let (flags, principal) = mechanism.accept(stream as &mut dyn ReadWrite)?;

    if !flags.contains(Flags::REQUIRED) {
        return Err(AuthError::Failed(format!(
            "mechanism granted insufficient flags: {:#05b}",
            flags.0
        )));
    }

    let allowed = policy.is_allowed(&principal);

    stream.write_all(&[if allowed { ACCESS_GRANTED } else { ACCESS_DENIED }])?;

    if !allowed {
        return Err(AuthError::Denied(principal));
    }

    Ok(SecurityContext { principal, flags })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    #[test]
    fn principal_name_type_from_at_sign() {
        assert_eq!(principal_name_type("host/example.org"), PrincipalNameType::HostBased);
        assert_eq!(principal_name_type("user@REALM"), PrincipalNameType::UserName);
    }

    #[test]
    fn blacklist_hit_denies() {
        let policy = PrincipalPolicy::blacklist(vec!["bob@REALM".into(), "eve@REALM".into()]);
        assert!(!policy.is_allowed("eve@REALM"));
        assert!(policy.is_allowed("alice@REALM"));
    }

    #[test]
    fn whitelist_miss_denies() {
        let policy = PrincipalPolicy::whitelist(vec!["alice@REALM".into(), "bob@REALM".into()]);
        assert!(policy.is_allowed("alice@REALM"));
        assert!(!policy.is_allowed("eve@REALM"));
    }

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server_thread = thread::spawn(move || listener.accept().unwrap().0);
        let client = TcpStream::connect(addr).unwrap();
        let server = server_thread.join().unwrap();
        (server, client)
    }

    #[test]
    fn scenario_s6_auth_success() {
        let (mut server, mut client) = loopback_pair();

        let client_thread = thread::spawn(move || {
            client.write_all(&[HANDSHAKE_BYTE]).unwrap();
            let mut reply = [0u8; 1];
            client.read_exact(&mut reply).unwrap();
            assert_eq!(reply[0], HANDSHAKE_BYTE);
            PlaintextMechanism::offer(&mut client, "user@REALM").unwrap();
            let mut status = [0u8; 1];
            client.read_exact(&mut status).unwrap();
            status[0]
        });

        let policy = PrincipalPolicy::whitelist(vec!["user@REALM".into()]);
        let ctx = authenticate(&mut server, &PlaintextMechanism, &policy);

        let status = client_thread.join().unwrap();
        assert_eq!(status, ACCESS_GRANTED);
        let ctx = ctx.unwrap();
        assert_eq!(ctx.principal, "user@REALM");
        assert!(ctx.flags.contains(Flags::REQUIRED));
    }

    #[test]
    fn wrong_handshake_byte_fails() {
        let (mut server, mut client) = loopback_pair();
        let client_thread = thread::spawn(move || {
            client.write_all(b"?").unwrap();
        });
        let policy = PrincipalPolicy::Open;
        let err = authenticate(&mut server, &PlaintextMechanism, &policy).unwrap_err();
        assert!(matches!(err, AuthError::Failed(_)));
        client_thread.join().unwrap();
    }

    #[test]
    fn insufficient_flags_fail_even_with_correct_handshake() {
        struct WeakMechanism;
        impl Mechanism for WeakMechanism {
            fn accept(&self, _stream: &mut dyn ReadWrite) -> Result<(Flags, String), AuthError> {
                Ok((Flags::MUTUAL, "partial@REALM".into()))
            }
        }

        let (mut server, mut client) = loopback_pair();
        let client_thread = thread::spawn(move || {
            client.write_all(&[HANDSHAKE_BYTE]).unwrap();
        });
        let policy = PrincipalPolicy::Open;
        let err = authenticate(&mut server, &WeakMechanism, &policy).unwrap_err();
        assert!(matches!(err, AuthError::Failed(_)));
        client_thread.join().unwrap();
    }
}
