//! End-to-end coverage of the job state machine over real loopback sockets, one test per
//! scenario. `argv[0]` uses `/bin/sh` rather than a real compiler so these don't depend on one
//! being installed; `find_output_path`'s `-o <path>` heuristic still resolves correctly against
//! it since the heuristic only looks at argv shape, not at what the named program actually is.

use acl::{AddressMask, AllowList};
use auth::{PlaintextMechanism, PrincipalPolicy};
use distccd::config::{Config, LogLevel, Mode};
use distccd::job::{self, JobContext};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

fn discard_log() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

fn base_config(tmp_root: &std::path::Path) -> Config {
    Config {
        mode: Mode::Daemon,
        bind_addr: None,
        port: 3632,
        allow_list: AllowList::default(),
        workers: 1,
        nice: None,
        drop_user: None,
        job_lifetime: None,
        worker_lifetime_secs: 60,
        log_file: None,
        log_level: LogLevel::Critical,
        log_stderr: false,
        no_detach: false,
        no_fork: false,
        no_fifo: false,
        pid_file: None,
        auth_enabled: false,
        blacklist_path: None,
        whitelist_path: None,
        enable_tcp_insecure: false,
        tmp_root: tmp_root.to_path_buf(),
        compiler_path: None,
        principal: None,
        tcp_defer_accept: false,
    }
}

fn loopback_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server_thread = thread::spawn(move || listener.accept().unwrap().0);
    let client = TcpStream::connect(addr).unwrap();
    let server = server_thread.join().unwrap();
    (server, client)
}

/// Writes a compile request whose compiler is `/bin/sh`, writing `OBJDATA` to `out.o` and
/// naming it via `-o out.o` so `find_output_path` locates it the same way it would a real
/// `-o` flag.
fn write_compile_request<W: Write>(w: &mut W, version: u32) {
    let argv = ["/bin/sh", "-c", "printf OBJDATA > out.o", "-o", "out.o"];
    wire::write_int(w, wire::token::DIST, version).unwrap();
    wire::write_int(w, wire::token::ARGC, argv.len() as u32).unwrap();
    for arg in argv {
        wire::write_string(w, wire::token::ARGV, arg.as_bytes()).unwrap();
    }
    wire::write_string(w, wire::token::CDIR, b"/").unwrap();
    wire::write_int(w, wire::token::NFIL, 0).unwrap();
}

#[test]
fn scenario_s1_happy_path() {
    let tmp = tempfile::tempdir().unwrap();
    let config = base_config(tmp.path());
    let policy = PrincipalPolicy::Open;
    let ctx = JobContext {
        config: &config,
        mechanism: None,
        policy: &policy,
    };
    let (mut server, mut client) = loopback_pair();

    let client_thread = thread::spawn(move || {
        write_compile_request(&mut client, 1);

        let version = wire::read_int(&mut client, wire::token::DONE).unwrap();
        let stat = wire::read_int(&mut client, wire::token::STAT).unwrap();
        let serr = wire::read_string(&mut client, wire::token::SERR).unwrap();
        let sout = wire::read_string(&mut client, wire::token::SOUT).unwrap();
        let doto = wire::read_string(&mut client, wire::token::DOTO).unwrap();
        (version, stat, serr, sout, doto)
    });

    let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let result = job::serve(server, peer, &ctx, &discard_log());
    assert!(result.is_ok(), "{:?}", result.err());

    let (version, stat, serr, sout, doto) = client_thread.join().unwrap();
    assert_eq!(version, 1);
    assert_eq!(stat, 0);
    assert!(serr.is_empty());
    assert!(sout.is_empty());
    assert_eq!(doto, b"OBJDATA");
}

#[test]
fn scenario_s2_access_denied_closes_without_writing() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = base_config(tmp.path());
    config.allow_list = AllowList::new(vec![AddressMask::parse("10.0.0.0/8").unwrap()]);
    let policy = PrincipalPolicy::Open;
    let ctx = JobContext {
        config: &config,
        mechanism: None,
        policy: &policy,
    };
    let (server, mut client) = loopback_pair();

    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    let peer: SocketAddr = "192.168.1.5:12345".parse().unwrap();
    let result = job::serve(server, peer, &ctx, &discard_log());
    assert!(matches!(result, Err(distccd::error::DaemonError::AccessDenied(_))));

    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).unwrap(), 0, "access-denied connection must not write any bytes");
}

#[test]
fn scenario_s3_protocol_error_on_bad_first_token() {
    let tmp = tempfile::tempdir().unwrap();
    let config = base_config(tmp.path());
    let policy = PrincipalPolicy::Open;
    let ctx = JobContext {
        config: &config,
        mechanism: None,
        policy: &policy,
    };
    let (server, mut client) = loopback_pair();

    let client_thread = thread::spawn(move || {
        client.write_all(b"XXXX00000001").unwrap();
    });

    let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let result = job::serve(server, peer, &ctx, &discard_log());
    match result {
        Err(distccd::error::DaemonError::ProtocolError(msg)) => assert!(msg.contains("XXXX")),
        other => panic!("expected ProtocolError, got {other:?}"),
    }
    client_thread.join().unwrap();
}

#[test]
fn scenario_s4_compiler_missing_reports_through_stat_and_serr() {
    let tmp = tempfile::tempdir().unwrap();
    let config = base_config(tmp.path());
    let policy = PrincipalPolicy::Open;
    let ctx = JobContext {
        config: &config,
        mechanism: None,
        policy: &policy,
    };
    let (server, mut client) = loopback_pair();

    let client_thread = thread::spawn(move || {
        wire::write_int(&mut client, wire::token::DIST, 1).unwrap();
        wire::write_int(&mut client, wire::token::ARGC, 1).unwrap();
        wire::write_string(&mut client, wire::token::ARGV, b"/no/such/compiler-binary").unwrap();
        wire::write_string(&mut client, wire::token::CDIR, b"/").unwrap();
        wire::write_int(&mut client, wire::token::NFIL, 0).unwrap();

        let stat = wire::read_int(&mut client, wire::token::DONE).and_then(|_| wire::read_int(&mut client, wire::token::STAT)).unwrap();
        let serr = wire::read_string(&mut client, wire::token::SERR).unwrap();
        let sout = wire::read_string(&mut client, wire::token::SOUT).unwrap();
        let doto = wire::read_string(&mut client, wire::token::DOTO).unwrap();
        (stat, serr, sout, doto)
    });

    let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let result = job::serve(server, peer, &ctx, &discard_log());
    assert!(result.is_ok(), "compiler-missing is reported via STAT, not a dropped connection: {:?}", result.err());

    let (stat, serr, sout, doto) = client_thread.join().unwrap();
    assert_eq!(stat, 127);
    assert!(String::from_utf8_lossy(&serr).contains("compiler not found"));
    assert!(sout.is_empty());
    assert!(doto.is_empty());
}

#[test]
fn scenario_s6_auth_success_then_normal_request() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = base_config(tmp.path());
    config.auth_enabled = true;
    let mechanism = PlaintextMechanism;
    let policy = PrincipalPolicy::whitelist(vec!["user@REALM".into()]);
    let ctx = JobContext {
        config: &config,
        mechanism: Some(&mechanism),
        policy: &policy,
    };
    let (server, mut client) = loopback_pair();

    let client_thread = thread::spawn(move || {
        client.write_all(b"*").unwrap();
        let mut reply = [0u8; 1];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"*");

        PlaintextMechanism::offer(&mut client, "user@REALM").unwrap();
        let mut status = [0u8; 1];
        client.read_exact(&mut status).unwrap();
        assert_eq!(&status, b"y");

        write_compile_request(&mut client, 1);
        let stat = wire::read_int(&mut client, wire::token::DONE).and_then(|_| wire::read_int(&mut client, wire::token::STAT)).unwrap();
        wire::read_string(&mut client, wire::token::SERR).unwrap();
        wire::read_string(&mut client, wire::token::SOUT).unwrap();
        let doto = wire::read_string(&mut client, wire::token::DOTO).unwrap();
        (stat, doto)
    });

    let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let result = job::serve(server, peer, &ctx, &discard_log());
    assert!(result.is_ok(), "{:?}", result.err());

    let (stat, doto) = client_thread.join().unwrap();
    assert_eq!(stat, 0);
    assert_eq!(doto, b"OBJDATA");
}
