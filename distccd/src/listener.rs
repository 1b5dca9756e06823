//! TCP listener setup and the inetd fast path. Binds every address family the configured host
//! resolves to, continuing past a family the platform doesn't support, and multiplexes
//! `accept_one` across however many sockets that produced.

use crate::config::Config;
use crate::error::DaemonError;
use crate::logging::Logger;
use slog::{info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

const LISTEN_BACKLOG: i32 = 1024;
#[cfg(target_os = "linux")]
const TCP_DEFER_ACCEPT: libc::c_int = 9;

pub struct Listener {
    sockets: Vec<std::net::TcpListener>,
}

impl Listener {
    /// Bind according to `config.bind_addr`/`config.port`. When no address is configured,
    /// tries both the IPv4 and IPv6 wildcard addresses, logging and continuing past whichever
    /// family the platform rejects; at least one must succeed.
    pub fn bind(config: &Config, log: &Logger) -> Result<Listener, DaemonError> {
        if config.port == 0 {
            return Err(DaemonError::BadArguments("port must be in [1, 65535]".into()));
        }

        let candidates: Vec<SocketAddr> = match &config.bind_addr {
            Some(host) => (host.as_str(), config.port)
                .to_socket_addrs()
                .map_err(DaemonError::ConnectFailed)?
                .collect(),
            None => vec![
                SocketAddr::from(([0, 0, 0, 0], config.port)),
                SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 0], config.port)),
            ],
        };

        let mut sockets = Vec::new();
        let mut last_err = None;
        for addr in candidates {
            match bind_one(addr, config.tcp_defer_accept, log) {
                Ok(listener) => sockets.push(listener),
                Err(e) => {
                    warn!(log, "skipping address family"; "addr" => %addr, "error" => %e);
                    last_err = Some(e);
                }
            }
        }

        if sockets.is_empty() {
            return Err(last_err.unwrap_or(DaemonError::BindFailed(std::io::Error::new(
                std::io::ErrorKind::Other,
                "no address family bound",
            ))));
        }

        info!(log, "listening"; "sockets" => sockets.len(), "port" => config.port);
        Ok(Listener { sockets })
    }

    /// Block until a connection arrives on any bound socket, retrying on `EINTR`.
    pub fn accept_one(&self) -> Result<(TcpStream, SocketAddr), DaemonError> {
        loop {
            let mut pollfds: Vec<libc::pollfd> = self
                .sockets
                .iter()
                .map(|s| libc::pollfd {
                    fd: s.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                })
                .collect();

            let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, -1) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(DaemonError::ConnectFailed(err));
            }

            for (idx, pfd) in pollfds.iter().enumerate() {
                if pfd.revents & libc::POLLIN != 0 {
                    match self.sockets[idx].accept() {
                        Ok(pair) => return Ok(pair),
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(DaemonError::ConnectFailed(e)),
                    }
                }
            }
        }
    }
}

fn bind_one(addr: SocketAddr, tcp_defer_accept: bool, log: &Logger) -> Result<std::net::TcpListener, DaemonError> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(DaemonError::BindFailed)?;
    socket.set_reuse_address(true).map_err(DaemonError::BindFailed)?;
    if domain == Domain::IPV6 {
        let _ = socket.set_only_v6(true);
    }
    socket.bind(&addr.into()).map_err(DaemonError::BindFailed)?;
    socket.listen(LISTEN_BACKLOG).map_err(DaemonError::BindFailed)?;
    socket.set_nonblocking(false).map_err(DaemonError::BindFailed)?;

    if tcp_defer_accept {
        set_tcp_defer_accept(socket.as_raw_fd(), log);
    }

    Ok(socket.into())
}

#[cfg(target_os = "linux")]
fn set_tcp_defer_accept(fd: RawFd, log: &Logger) {
    let secs: libc::c_int = 5;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            TCP_DEFER_ACCEPT,
            &secs as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        warn!(log, "TCP_DEFER_ACCEPT unavailable"; "error" => %std::io::Error::last_os_error());
    }
}

#[cfg(not(target_os = "linux"))]
fn set_tcp_defer_accept(_fd: RawFd, _log: &Logger) {}

/// Super-server mode: fd 0 is already a connected socket handed to us by inetd/xinetd.
pub fn accept_from_inetd(log: &Logger) -> Result<(TcpStream, SocketAddr), DaemonError> {
    let peer = getpeername(0).map_err(DaemonError::ConnectFailed)?;
    let dup_fd = unsafe { libc::dup(0) };
    if dup_fd < 0 {
        return Err(DaemonError::ConnectFailed(std::io::Error::last_os_error()));
    }
    let stream = unsafe { TcpStream::from_raw_fd(dup_fd) };
    info!(log, "inetd connection"; "peer" => %peer);
    Ok((stream, peer))
}

fn getpeername(fd: RawFd) -> std::io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe { libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    sockaddr_storage_to_std(&storage)
}

fn sockaddr_storage_to_std(storage: &libc::sockaddr_storage) -> std::io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let addr: libc::sockaddr_in = unsafe { std::mem::transmute_copy(storage) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            Ok(SocketAddr::from((ip, u16::from_be(addr.sin_port))))
        }
        libc::AF_INET6 => {
            let addr: libc::sockaddr_in6 = unsafe { std::mem::transmute_copy(storage) };
            let ip = std::net::Ipv6Addr::from(addr.sin6_addr.s6_addr);
            Ok(SocketAddr::from((ip, u16::from_be(addr.sin6_port))))
        }
        _ => Err(std::io::Error::new(std::io::ErrorKind::Other, "unsupported address family")),
    }
}

