//! The per-connection state machine: ACCEPTED → AUTHENTICATED → REQ_HEADER → REQ_ARGV →
//! REQ_CWD → REQ_FILES → COMPILING → RESP_HEADER → RESP_STATUS → RESP_STDERR → RESP_STDOUT →
//! RESP_OBJECT [→ RESP_DEPS] → DONE. Every `?` along this function is also the cleanup path:
//! the `JobTempTree` is dropped (and everything under it removed) the moment this function
//! returns, successfully or not.

use crate::compiler;
use crate::config::Config;
use crate::error::DaemonError;
use crate::logging::{self, Logger};
use slog::{info, warn};
use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIN_PROTOCOL_VERSION: u32 = 1;
const MAX_PROTOCOL_VERSION: u32 = 3;

pub struct JobContext<'a> {
    pub config: &'a Config,
    pub mechanism: Option<&'a dyn auth::Mechanism>,
    pub policy: &'a auth::PrincipalPolicy,
}

/// Drive one connection end to end. Returns `Ok(())` for any outcome the client sees as a
/// complete, well-formed exchange (including a nonzero `STAT` from a failed compile);
/// returns `Err` for anything that drops the connection early (ACL, auth, protocol, I/O).
pub fn serve(mut stream: TcpStream, peer: SocketAddr, ctx: &JobContext, log: &Logger) -> Result<(), DaemonError> {
    let conn_log = logging::for_connection(log, "accept", peer.ip());

    let acl_log = logging::for_phase(&conn_log, "acl");
    if !ctx.config.allow_list.permits(peer.ip()) {
        warn!(acl_log, "access denied");
        return Err(DaemonError::AccessDenied(peer.ip().to_string()));
    }

    let auth_log = logging::for_phase(&conn_log, "auth");
    let _security_context = if ctx.config.auth_enabled {
        let mechanism = ctx
            .mechanism
            .ok_or_else(|| DaemonError::GeneralFailure("auth enabled with no mechanism configured".into()))?;
        let security_context = auth::authenticate(&mut stream, mechanism, ctx.policy)?;
        info!(auth_log, "authenticated"; "principal" => &security_context.principal);
        Some(security_context)
    } else {
        None
    };

    let protocol_log = logging::for_phase(&conn_log, "protocol");
    let version = wire::read_int(&mut stream, wire::token::DIST)?;
    if !(MIN_PROTOCOL_VERSION..=MAX_PROTOCOL_VERSION).contains(&version) {
        return Err(DaemonError::ProtocolError(format!(
            "unsupported protocol version {version}"
        )));
    }
    let codec = crate::codec::for_version(version)?;
    info!(protocol_log, "negotiated protocol version"; "version" => version);

    let argc = wire::read_int(&mut stream, wire::token::ARGC)?;
    let mut argv = Vec::with_capacity(argc as usize);
    for _ in 0..argc {
        let bytes = wire::read_string(&mut stream, wire::token::ARGV)?;
        argv.push(String::from_utf8_lossy(&bytes).into_owned());
    }
    if argv.is_empty() {
        return Err(DaemonError::ProtocolError("request argv must contain at least one argument".into()));
    }

    let mut tree = jobtree::JobTempTree::create(&ctx.config.tmp_root, std::process::id())?;

    let cdir_bytes = wire::read_string(&mut stream, wire::token::CDIR)?;
    let cdir = String::from_utf8_lossy(&cdir_bytes).into_owned();
    let cwd_path = tree.cwd(&cdir)?;

    let nfil = wire::read_int(&mut stream, wire::token::NFIL)?;
    for _ in 0..nfil {
        let name_bytes = wire::read_string(&mut stream, wire::token::NAME)?;
        let name = String::from_utf8_lossy(&name_bytes).into_owned();
        receive_input(&mut stream, &mut tree, &name, codec.as_ref())?;
    }

    let obj_path = find_output_path(&argv, &cwd_path);
    let stdout_path = tree.root().join(".distccd-stdout");
    let stderr_path = tree.root().join(".distccd-stderr");

    let compile_log = logging::for_phase(&conn_log, "compile");
    let job_lifetime = ctx.config.job_lifetime.map(|secs| Duration::from_secs(secs + 30));
    let pid = compiler::spawn_child_with_stdio(&argv, &cwd_path, None, Some(&stdout_path), Some(&stderr_path))?;
    let wait_status = compiler::collect_child(pid, job_lifetime)?;
    let (compile_status, compile_err) = compiler::critique_status(wait_status);

    if let Some(err) = &compile_err {
        warn!(compile_log, "compile failed"; "error" => %err);
    }

    let stdout_bytes = std::fs::read(&stdout_path).unwrap_or_default();
    let stderr_bytes = match &compile_err {
        // the child never got to run, so its redirected stderr file is empty; synthesize the
        // diagnostic from the error the exec failure produced instead.
        Some(err @ DaemonError::CompilerMissing(_)) => err.to_string().into_bytes(),
        _ => std::fs::read(&stderr_path).unwrap_or_default(),
    };
    let obj_bytes = if compile_status.code() == 0 && !compile_status.is_signal() {
        std::fs::read(&obj_path).unwrap_or_default()
    } else {
        Vec::new()
    };

    wire::write_int(&mut stream, wire::token::DONE, version)?;
    wire::write_int(&mut stream, wire::token::STAT, compile_status.wire_value())?;
    wire::write_string(&mut stream, wire::token::SERR, &stderr_bytes)?;
    wire::write_string(&mut stream, wire::token::SOUT, &stdout_bytes)?;
    wire::write_string(&mut stream, wire::token::DOTO, &codec.encode(&obj_bytes))?;

    if version == 3 {
        wire::write_string(&mut stream, wire::token::DOTI, &[])?;
    }

    let response_log = logging::for_phase(&conn_log, "response");
    info!(response_log, "job done"; "version" => version, "status" => compile_status.wire_value());

    match compile_err {
        Some(err) if !matches!(err, DaemonError::CompilerCrashed(_) | DaemonError::CompilerMissing(_)) => Err(err),
        _ => Ok(()),
    }
}

fn receive_input(stream: &mut TcpStream, tree: &mut jobtree::JobTempTree, name: &str, codec: &dyn crate::codec::Codec) -> Result<(), DaemonError> {
    let (token, len) = wire::read_some_int(stream)?;
    match token.as_str() {
        wire::token::FILE => {
            let mut bytes = vec![0u8; len as usize];
            read_exact(stream, &mut bytes)?;
            tree.write_regular_file(name, &codec.decode(&bytes))?;
        }
        wire::token::LINK => {
            let mut bytes = vec![0u8; len as usize];
            read_exact(stream, &mut bytes)?;
            let target = String::from_utf8_lossy(&bytes).into_owned();
            tree.write_symlink(name, &target)?;
        }
        other => {
            return Err(DaemonError::ProtocolError(format!(
                "expected FILE or LINK for {name:?}, got token {other:?}"
            )))
        }
    }
    Ok(())
}

fn read_exact(stream: &mut TcpStream, buf: &mut [u8]) -> Result<(), DaemonError> {
    stream.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            DaemonError::Truncated(format!("expected {} more bytes", buf.len()))
        } else {
            DaemonError::IoError(e)
        }
    })
}

/// Infer the object file the compiler will produce: an explicit `-o <path>` wins, otherwise
/// the last recognizable source argument's stem with a `.o` extension.
fn find_output_path(argv: &[String], cwd: &Path) -> PathBuf {
    if let Some(idx) = argv.iter().position(|a| a == "-o") {
        if let Some(name) = argv.get(idx + 1) {
            return cwd.join(name);
        }
    }
    const SOURCE_EXTS: [&str; 4] = [".c", ".cc", ".cpp", ".cxx"];
    let source = argv.iter().rev().find(|a| SOURCE_EXTS.iter().any(|ext| a.ends_with(ext)));
    match source {
        Some(src) => {
            let stem = Path::new(src)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "a".into());
            cwd.join(format!("{stem}.o"))
        }
        None => cwd.join("a.out"),
    }
}
