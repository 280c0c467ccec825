//! Negotiate/Request/IO stage worker bodies (spec.md §4.4-4.8, C8).
//!
//! Each `*_stage` function is the body one stage-pool task runs for a
//! single session record; the dispatcher (`crate::dispatcher`) is what
//! actually spawns them against a `StagePool` permit and wires their
//! outputs into the next stage's channel.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use proxy_auth::{AuthMethod, AuthState, Authenticator, MethodKind};
use proxy_io::{Duplex, SocksHost, TargetAddr};
use proxy_rules::{
    rules_permit, AccessBackend, Command, ConnectionState, EngineVerdict, IdentClient, LogFlags,
    Protocol, RuleBase, RuleClass, RuleDefaults, RuleInputs, SourceHostCheck, Timeouts, Version,
};
use proxy_socks::socks4::{Socks4Command, Socks4Reply, Socks4Request, Socks4Status};
use proxy_socks::types::{
    CandidateMethods, Method, Rep, Reply, Request, Selection, Status, UsernameAndPassword, BIND,
    CONNECT, UDP_ASSOCIATE,
};
use proxy_socks::udp::UdpHeader;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::config::ConfigSnapshot;
use crate::session::{IoRecord, PendingRequest, RequestRecord, SessionRecord, SessionState};

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("rule base denied the connection (rule #{rule_number})")]
    Denied { rule_number: usize },
}

/// Reads just enough of the opening bytes to tell SOCKSv4/v5 from an
/// HTTP request line without consuming them, so the rest of the parse
/// can use the normal per-version `read` implementations unmodified.
async fn peek_version(socket: &TcpStream) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    loop {
        let n = socket.peek(&mut buf).await?;
        if n == 1 {
            return Ok(buf[0]);
        }
    }
}

/// C8 negotiate stage: authenticates the client against the client-rule
/// base (spec.md §4.4 applied with `RuleClass::Client`) and, for
/// SOCKSv4(a), also consumes the request line since the two cannot be
/// told apart on the wire. A version byte that is neither 0x04 nor 0x05
/// is assumed to be the first byte of an HTTP request line (e.g. the
/// `C` of `CONNECT`) and handed to the HTTP-CONNECT negotiator instead
/// of being treated as a protocol error.
pub async fn negotiate_stage(
    record: SessionRecord,
    snapshot: &ConfigSnapshot,
    authenticator: &dyn Authenticator,
    access: &dyn AccessBackend,
    ident: &dyn IdentClient,
    source_host: &dyn SourceHostCheck,
) -> Result<RequestRecord, StageError> {
    let SessionRecord {
        mut socket,
        peer,
        local,
        state,
        ..
    } = record;
    debug_assert!(state.can_transition_to(SessionState::Negotiating { renegotiation: false }));

    let version_byte = peek_version(&socket).await?;
    match version_byte {
        0x04 => negotiate_v4(socket, peer, local, snapshot, access, ident, source_host).await,
        0x05 => {
            negotiate_v5(
                &mut socket,
                peer,
                local,
                snapshot,
                authenticator,
                access,
                ident,
                source_host,
            )
            .await?;
            Ok(RequestRecord {
                socket,
                peer,
                local,
                auth: AuthState::default(),
                version: Version::V5,
                pending: PendingRequest::ReadFromSocketV5,
                state: SessionState::Requested,
            })
        }
        _ => {
            negotiate_http(
                socket,
                peer,
                local,
                snapshot,
                authenticator,
                access,
                ident,
                source_host,
            )
            .await
        }
    }
}

async fn client_rule_lookup(
    snapshot: &ConfigSnapshot,
    src: SocksHost,
    dst: SocksHost,
    username: Option<&str>,
    access: &dyn AccessBackend,
    ident: &dyn IdentClient,
    source_host: &dyn SourceHostCheck,
) -> EngineVerdict {
    let state = ConnectionState::new(Command::Accept, Protocol::Tcp, Version::V5);
    let inputs = RuleInputs {
        src: Some(src),
        dst: Some(dst),
        state: &state,
        username,
        resolved_aliases: &[],
    };
    rules_permit(
        &snapshot.client_rules,
        RuleClass::Client,
        &inputs,
        &AuthState::default(),
        &snapshot.defaults,
        access,
        ident,
        source_host,
    )
    .await
}

async fn negotiate_v4(
    mut socket: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    snapshot: &ConfigSnapshot,
    access: &dyn AccessBackend,
    ident: &dyn IdentClient,
    source_host: &dyn SourceHostCheck,
) -> Result<RequestRecord, StageError> {
    let req = Socks4Request::read(&mut socket).await?;
    let resolved = req.target.resolve_dns().await?;
    let username = if req.userid.is_empty() {
        None
    } else {
        Some(req.userid.as_str())
    };

    let verdict = client_rule_lookup(
        snapshot,
        peer.into(),
        SocksHost::from(&resolved),
        username,
        access,
        ident,
        source_host,
    )
    .await;

    let auth = match verdict {
        EngineVerdict::Pass { method, .. } => AuthState::new(method),
        EngineVerdict::Block { rule_number, .. } => {
            Socks4Reply::new(Socks4Status::Rejected, default_bound(local))
                .write(&mut socket)
                .await?;
            return Err(StageError::Denied { rule_number });
        }
    };

    let command = match req.command {
        Socks4Command::Connect => Command::Connect,
        Socks4Command::Bind => Command::Bind,
    };

    Ok(RequestRecord {
        socket,
        peer,
        local,
        auth,
        version: Version::V4,
        pending: PendingRequest::AlreadyParsed {
            command,
            target: resolved,
        },
        state: SessionState::Requested,
    })
}

fn default_bound(local: SocketAddr) -> std::net::SocketAddrV4 {
    match local {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => std::net::SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0),
    }
}

async fn negotiate_v5(
    socket: &mut TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    snapshot: &ConfigSnapshot,
    authenticator: &dyn Authenticator,
    access: &dyn AccessBackend,
    ident: &dyn IdentClient,
    source_host: &dyn SourceHostCheck,
) -> Result<(), StageError> {
    let candidates = proxy_socks::check_valid!(CandidateMethods::read(socket).await);
    let offered: Vec<MethodKind> = candidates
        .methods
        .iter()
        .filter_map(|m| match *m {
            proxy_socks::types::NO_AUTHENTICATION_REQUIRED => Some(MethodKind::None),
            proxy_socks::types::USERNAME_AND_PASSWORD => Some(MethodKind::Uname),
            proxy_socks::types::GSSAPI => Some(MethodKind::Gssapi),
            _ => None,
        })
        .collect();

    let verdict = client_rule_lookup(
        snapshot,
        peer.into(),
        local.into(),
        None,
        access,
        ident,
        source_host,
    )
    .await;

    let allowed = match verdict {
        EngineVerdict::Pass { method, .. } => method.kind(),
        EngineVerdict::Block { rule_number, .. } => {
            Selection::new(Method::NoAcceptableMethods).write(socket).await?;
            return Err(StageError::Denied { rule_number });
        }
    };

    if !offered.contains(&allowed) && allowed != MethodKind::None {
        Selection::new(Method::NoAcceptableMethods).write(socket).await?;
        return Err(StageError::Io(io::ErrorKind::PermissionDenied.into()));
    }

    match allowed {
        MethodKind::Uname => {
            Selection::new(Method::UsernameAndPassword).write(socket).await?;
            let creds = proxy_socks::check_valid!(UsernameAndPassword::read(socket).await);
            if !authenticator.authenticate(&creds.username, &creds.password) {
                Status::new(0x01).write(socket).await?;
                return Err(StageError::Io(io::ErrorKind::PermissionDenied.into()));
            }
            Status::new(0x00).write(socket).await?;
        }
        _ => {
            Selection::new(Method::NoAuthenticationRequired).write(socket).await?;
        }
    }
    Ok(())
}

/// HTTP-CONNECT negotiation (spec.md §1 "HTTP proxying via the CONNECT
/// method", §9 open question). Unlike SOCKS, the method and the target
/// arrive on the same request line, so this folds the client-rule lookup
/// and the credential exchange into one loop: a failed `Proxy-Authorization`
/// check sends a `407` and loops for another request line on the same
/// socket rather than closing the connection, which is the
/// `Relaying -> Negotiating { renegotiation: true }` edge played out
/// before any relay has actually started.
async fn negotiate_http(
    mut socket: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    snapshot: &ConfigSnapshot,
    authenticator: &dyn Authenticator,
    access: &dyn AccessBackend,
    ident: &dyn IdentClient,
    source_host: &dyn SourceHostCheck,
) -> Result<RequestRecord, StageError> {
    const MAX_ATTEMPTS: u32 = 3;

    for attempt in 1..=MAX_ATTEMPTS {
        let request_line = read_http_line(&mut socket).await?;
        let headers = read_http_headers(&mut socket).await?;
        let Some((method, authority)) = parse_request_line(&request_line) else {
            write_http_status(&mut socket, 400, "Bad Request").await?;
            return Err(StageError::Io(io::ErrorKind::InvalidData.into()));
        };
        if !method.eq_ignore_ascii_case("CONNECT") {
            write_http_status(&mut socket, 501, "Not Implemented").await?;
            return Err(StageError::Io(io::ErrorKind::Unsupported.into()));
        }
        let target = parse_authority(&authority)?;
        let resolved = target.resolve_dns().await?;

        let verdict = client_rule_lookup(
            snapshot,
            peer.into(),
            SocksHost::from(&resolved),
            None,
            access,
            ident,
            source_host,
        )
        .await;

        let method_kind = match verdict {
            EngineVerdict::Pass { method, .. } => method.kind(),
            EngineVerdict::Block { rule_number, .. } => {
                write_http_status(&mut socket, 403, "Forbidden").await?;
                return Err(StageError::Denied { rule_number });
            }
        };

        if method_kind != MethodKind::Uname {
            return Ok(RequestRecord {
                socket,
                peer,
                local,
                auth: AuthState::default(),
                version: Version::Http11,
                pending: PendingRequest::AlreadyParsed {
                    command: Command::Connect,
                    target,
                },
                state: SessionState::Requested,
            });
        }

        let creds = headers
            .get("proxy-authorization")
            .and_then(|v| parse_basic_auth(v));
        match creds {
            Some((user, pass)) if authenticator.authenticate(&user, &pass) => {
                return Ok(RequestRecord {
                    socket,
                    peer,
                    local,
                    auth: AuthState::new(AuthMethod::Uname {
                        name: user,
                        password: pass,
                    }),
                    version: Version::Http11,
                    pending: PendingRequest::AlreadyParsed {
                        command: Command::Connect,
                        target,
                    },
                    state: SessionState::Requested,
                });
            }
            _ => {
                if attempt == MAX_ATTEMPTS {
                    write_http_status(&mut socket, 407, "Proxy Authentication Required").await?;
                    return Err(StageError::Io(io::ErrorKind::PermissionDenied.into()));
                }
                write_http_auth_challenge(&mut socket).await?;
            }
        }
    }

    unreachable!("the loop above always returns before attempt exceeds MAX_ATTEMPTS")
}

async fn read_http_line(socket: &mut TcpStream) -> io::Result<String> {
    let mut line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        socket.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            break;
        }
        line.push(byte[0]);
        if line.len() > 8192 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "http line too long"));
        }
    }
    String::from_utf8(line).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-utf8 http line"))
}

async fn read_http_headers(socket: &mut TcpStream) -> io::Result<HashMap<String, String>> {
    let mut headers = HashMap::new();
    loop {
        let line = read_http_line(socket).await?;
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Ok(headers)
}

fn parse_request_line(line: &str) -> Option<(String, String)> {
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();
    parts.next()?; // HTTP version, unused
    Some((method, target))
}

fn parse_authority(authority: &str) -> io::Result<TargetAddr> {
    let (host, port) = authority
        .rsplit_once(':')
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "CONNECT target missing a port"))?;
    let port: u16 = port
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "CONNECT target has an invalid port"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        Ok(TargetAddr::SocketAddr(SocketAddr::new(ip, port)))
    } else {
        Ok(TargetAddr::Domain(host.to_string(), port))
    }
}

fn parse_basic_auth(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ")?.trim();
    let decoded = base64::decode(encoded).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

async fn write_http_status(socket: &mut TcpStream, code: u16, reason: &str) -> io::Result<()> {
    let body = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        code, reason
    );
    socket.write_all(body.as_bytes()).await
}

async fn write_http_auth_challenge(socket: &mut TcpStream) -> io::Result<()> {
    socket
        .write_all(
            b"HTTP/1.1 407 Proxy Authentication Required\r\n\
Proxy-Authenticate: Basic realm=\"proxy\"\r\n\
Content-Length: 0\r\n\r\n",
        )
        .await
}

async fn write_http_connect_established(socket: &mut TcpStream) -> io::Result<()> {
    socket.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await
}

/// C8 request stage: reads the SOCKSv5 request (SOCKSv4 and HTTP-CONNECT
/// already have one attached), checks it against the socks-rule base, and
/// dispatches to the command-specific handler.
pub async fn request_stage(
    record: RequestRecord,
    snapshot: &ConfigSnapshot,
    access: &dyn AccessBackend,
    ident: &dyn IdentClient,
    source_host: &dyn SourceHostCheck,
) -> Result<IoRecord, StageError> {
    let RequestRecord {
        mut socket,
        peer,
        local,
        auth,
        version,
        pending,
        ..
    } = record;

    let (command, target) = match pending {
        PendingRequest::AlreadyParsed { command, target } => (command, target),
        PendingRequest::ReadFromSocketV5 => {
            let req = proxy_socks::check_valid!(Request::read(&mut socket).await);
            let Some(target) = req.target else {
                Reply::new(Rep::AddressTypeNotSupported).write(&mut socket).await?;
                return Err(StageError::Io(io::ErrorKind::InvalidInput.into()));
            };
            let command = if req.command == CONNECT {
                Command::Connect
            } else if req.command == BIND {
                Command::Bind
            } else if req.command == UDP_ASSOCIATE {
                Command::UdpAssociate
            } else {
                Reply::new(Rep::CommandNotSupported).write(&mut socket).await?;
                return Err(StageError::Io(io::ErrorKind::Unsupported.into()));
            };
            (command, target)
        }
    };

    match command {
        Command::Bind => {
            request_bind(
                socket, peer, local, version, auth, target, snapshot, access, ident, source_host,
            )
            .await
        }
        Command::UdpAssociate => {
            request_udp_associate(
                socket, peer, local, version, auth, target, snapshot, access, ident, source_host,
            )
            .await
        }
        _ => {
            request_connect(
                socket, peer, local, version, auth, command, target, snapshot, access, ident,
                source_host,
            )
            .await
        }
    }
}

fn rule_meta(base: &RuleBase, rule_number: usize) -> (LogFlags, Timeouts) {
    if rule_number == 0 {
        return (LogFlags::empty(), Timeouts::default());
    }
    base.rules()
        .get(rule_number - 1)
        .map(|rule| (rule.log_flags, rule.timeouts))
        .unwrap_or((LogFlags::empty(), Timeouts::default()))
}

/// Rewrites the dial target when the matched rule carries an `rdr_to`
/// (spec.md §3 "Rule.rdr_to", §4.2 "redirection targets must be IPv4 or
/// Domain"). A zero port in the redirection endpoint keeps the
/// original request's port, matching `rdr_from`'s role as a source
/// filter rather than a port rewrite.
fn redirection_target(
    base: &RuleBase,
    rule_number: usize,
    original: &TargetAddr,
) -> Option<TargetAddr> {
    let rule = base.rules().get(rule_number.checked_sub(1)?)?;
    let to = rule.rdr_to.as_ref()?;
    let original_port = match original {
        TargetAddr::SocketAddr(addr) => addr.port(),
        TargetAddr::Domain(_, port) => *port,
    };
    let port = if to.port.tcp == 0 {
        original_port
    } else {
        to.port.tcp
    };
    match &to.addr {
        proxy_rules::RuleAddr::Ipv4 { addr, .. } => {
            Some(TargetAddr::SocketAddr(SocketAddr::new((*addr).into(), port)))
        }
        proxy_rules::RuleAddr::Domain(domain) => Some(TargetAddr::Domain(domain.clone(), port)),
        proxy_rules::RuleAddr::NotSet | proxy_rules::RuleAddr::IfName(_) => None,
    }
}

#[allow(clippy::too_many_arguments)]
async fn request_connect(
    mut socket: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    version: Version,
    auth: AuthState,
    command: Command,
    target: TargetAddr,
    snapshot: &ConfigSnapshot,
    access: &dyn AccessBackend,
    ident: &dyn IdentClient,
    source_host: &dyn SourceHostCheck,
) -> Result<IoRecord, StageError> {
    let resolved = target.resolve_dns().await?;
    let state = ConnectionState::new(command, Protocol::Tcp, version);
    let inputs = RuleInputs {
        src: Some(peer.into()),
        dst: Some(SocksHost::from(&resolved)),
        state: &state,
        username: auth.method.username(),
        resolved_aliases: &[],
    };
    let verdict = rules_permit(
        &snapshot.socks_rules,
        RuleClass::Socks,
        &inputs,
        &auth,
        &snapshot.defaults,
        access,
        ident,
        source_host,
    )
    .await;

    let rule_number = match verdict {
        EngineVerdict::Pass { rule_number, .. } => rule_number,
        EngineVerdict::Block { rule_number, .. } => {
            deny(&mut socket, version, local).await?;
            return Err(StageError::Denied { rule_number });
        }
    };

    debug!("rule #{} permits {} -> {}", rule_number, peer, resolved);

    let redirect = redirection_target(&snapshot.socks_rules, rule_number, &resolved);
    let dial_target = redirect.as_ref().unwrap_or(&resolved);
    if let Some(to) = &redirect {
        info!("rule #{} redirects {} -> {}", rule_number, resolved, to);
    }
    let dial_addr = match dial_target.resolve_dns().await? {
        TargetAddr::SocketAddr(addr) => addr,
        TargetAddr::Domain(..) => unreachable!("resolve_dns always yields a SocketAddr"),
    };

    match TcpStream::connect(dial_addr).await {
        Ok(outbound) => {
            accept(&mut socket, version, outbound.local_addr().unwrap_or(local)).await?;
            let (log_flags, timeouts) = rule_meta(&snapshot.socks_rules, rule_number);
            Ok(IoRecord {
                src: socket,
                dst: Some(outbound),
                udp_socket: None,
                udp_client: None,
                connection: state,
                matched_rule: rule_number,
                log_flags,
                timeouts,
                state: SessionState::Relaying,
                peer,
                auth,
                socks_rules: Arc::clone(&snapshot.socks_rules),
                defaults: Arc::clone(&snapshot.defaults),
            })
        }
        Err(e) => {
            let rep = match e.kind() {
                io::ErrorKind::ConnectionRefused => Rep::ConnectionRefused,
                io::ErrorKind::HostUnreachable => Rep::HostUnreachable,
                io::ErrorKind::NetworkUnreachable => Rep::NetworkUnreachable,
                _ => Rep::GeneralSocksServerFailure,
            };
            error!("connect to {} failed: {}", resolved, e);
            match version {
                Version::V4 => {
                    Socks4Reply::new(Socks4Status::Rejected, default_bound(local))
                        .write(&mut socket)
                        .await?;
                }
                Version::V5 => {
                    Reply::new(rep).write(&mut socket).await?;
                }
                Version::Http10 | Version::Http11 => {
                    write_http_status(&mut socket, 502, "Bad Gateway").await?;
                }
            }
            Err(StageError::Io(e))
        }
    }
}

/// BIND command (spec.md §4.4 `Command::Bind`/`Command::BindReply`):
/// opens an ephemeral listener, replies once with the bound address, then
/// replies a second time once a peer connects — checking the socks-rule
/// base again for the reply direction (`RuleClass::Socks` with
/// `Command::BindReply`), since the connecting peer is not known until
/// this point.
#[allow(clippy::too_many_arguments)]
async fn request_bind(
    mut socket: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    version: Version,
    auth: AuthState,
    target: TargetAddr,
    snapshot: &ConfigSnapshot,
    access: &dyn AccessBackend,
    ident: &dyn IdentClient,
    source_host: &dyn SourceHostCheck,
) -> Result<IoRecord, StageError> {
    let resolved = target.resolve_dns().await?;
    let state = ConnectionState::new(Command::Bind, Protocol::Tcp, version);
    let inputs = RuleInputs {
        src: Some(peer.into()),
        dst: Some(SocksHost::from(&resolved)),
        state: &state,
        username: auth.method.username(),
        resolved_aliases: &[],
    };
    let verdict = rules_permit(
        &snapshot.socks_rules,
        RuleClass::Socks,
        &inputs,
        &auth,
        &snapshot.defaults,
        access,
        ident,
        source_host,
    )
    .await;
    if let EngineVerdict::Block { rule_number, .. } = verdict {
        deny(&mut socket, version, local).await?;
        return Err(StageError::Denied { rule_number });
    }

    let listener = TcpListener::bind((local.ip(), 0)).await?;
    let bound = listener.local_addr()?;
    accept(&mut socket, version, bound).await?;

    let (incoming, incoming_peer) = listener.accept().await?;

    let reply_state = ConnectionState::new(Command::BindReply, Protocol::Tcp, version);
    let reply_inputs = RuleInputs {
        src: Some(incoming_peer.into()),
        dst: Some(bound.into()),
        state: &reply_state,
        username: auth.method.username(),
        resolved_aliases: &[],
    };
    let reply_verdict = rules_permit(
        &snapshot.socks_rules,
        RuleClass::Socks,
        &reply_inputs,
        &auth,
        &snapshot.defaults,
        access,
        ident,
        source_host,
    )
    .await;
    let reply_rule_number = match reply_verdict {
        EngineVerdict::Pass { rule_number, .. } => rule_number,
        EngineVerdict::Block { rule_number, .. } => {
            deny(&mut socket, version, local).await?;
            return Err(StageError::Denied { rule_number });
        }
    };

    accept(&mut socket, version, incoming_peer).await?;

    let (log_flags, timeouts) = rule_meta(&snapshot.socks_rules, reply_rule_number);
    Ok(IoRecord {
        src: socket,
        dst: Some(incoming),
        udp_socket: None,
        udp_client: None,
        connection: reply_state,
        matched_rule: reply_rule_number,
        log_flags,
        timeouts,
        state: SessionState::Relaying,
        peer,
        auth,
        socks_rules: Arc::clone(&snapshot.socks_rules),
        defaults: Arc::clone(&snapshot.defaults),
    })
}

/// UDP ASSOCIATE (spec.md §4.5 Scenario C, §6 "the IO path must preserve
/// the SOCKSv5 UDP header structure exactly"): binds an ephemeral UDP
/// socket, replies with its address, and hands both the control TCP
/// socket (closing it tears the association down) and the UDP socket to
/// the IO stage. The client's UDP peer address is learned from the first
/// datagram received if the request did not already name a non-zero
/// source port.
#[allow(clippy::too_many_arguments)]
async fn request_udp_associate(
    mut socket: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    version: Version,
    auth: AuthState,
    target: TargetAddr,
    snapshot: &ConfigSnapshot,
    access: &dyn AccessBackend,
    ident: &dyn IdentClient,
    source_host: &dyn SourceHostCheck,
) -> Result<IoRecord, StageError> {
    let resolved = target.resolve_dns().await?;
    let state = ConnectionState::new(Command::UdpAssociate, Protocol::Udp, version);
    let inputs = RuleInputs {
        src: Some(peer.into()),
        dst: Some(SocksHost::from(&resolved)),
        state: &state,
        username: auth.method.username(),
        resolved_aliases: &[],
    };
    let verdict = rules_permit(
        &snapshot.socks_rules,
        RuleClass::Socks,
        &inputs,
        &auth,
        &snapshot.defaults,
        access,
        ident,
        source_host,
    )
    .await;
    let rule_number = match verdict {
        EngineVerdict::Pass { rule_number, .. } => rule_number,
        EngineVerdict::Block { rule_number, .. } => {
            deny(&mut socket, version, local).await?;
            return Err(StageError::Denied { rule_number });
        }
    };

    let udp_socket = UdpSocket::bind((local.ip(), 0)).await?;
    let bound = udp_socket.local_addr()?;
    accept(&mut socket, version, bound).await?;

    let udp_client = match resolved {
        TargetAddr::SocketAddr(addr) if addr.port() != 0 => Some(addr),
        _ => None,
    };

    let (log_flags, timeouts) = rule_meta(&snapshot.socks_rules, rule_number);
    Ok(IoRecord {
        src: socket,
        dst: None,
        udp_socket: Some(udp_socket),
        udp_client,
        connection: state,
        matched_rule: rule_number,
        log_flags,
        timeouts,
        state: SessionState::Relaying,
        peer,
        auth,
        socks_rules: Arc::clone(&snapshot.socks_rules),
        defaults: Arc::clone(&snapshot.defaults),
    })
}

async fn deny(socket: &mut TcpStream, version: Version, local: SocketAddr) -> io::Result<()> {
    match version {
        Version::V4 => {
            Socks4Reply::new(Socks4Status::Rejected, default_bound(local))
                .write(socket)
                .await
        }
        Version::V5 => Reply::new(Rep::ConnectionNotAllowedByRuleset).write(socket).await,
        Version::Http10 | Version::Http11 => write_http_status(socket, 403, "Forbidden").await,
    }
}

async fn accept(socket: &mut TcpStream, version: Version, bound: SocketAddr) -> io::Result<()> {
    match version {
        Version::V4 => {
            Socks4Reply::new(Socks4Status::Granted, default_bound(bound))
                .write(socket)
                .await
        }
        Version::V5 => {
            let mut reply = Reply::new(Rep::Succeeded);
            reply.target = Some(TargetAddr::SocketAddr(bound));
            reply.write(socket).await
        }
        Version::Http10 | Version::Http11 => write_http_connect_established(socket).await,
    }
}

/// C8 IO stage: relays bytes until either side closes (spec.md §4.8),
/// branching on whichever descriptors the request stage populated and
/// applying the matched rule's log flags and idle timeout.
pub async fn io_stage(
    mut record: IoRecord,
    access: &dyn AccessBackend,
    ident: &dyn IdentClient,
    source_host: &dyn SourceHostCheck,
) -> io::Result<(u64, u64)> {
    let rule_number = record.matched_rule;
    let log_flags = record.log_flags;
    if log_flags.contains(LogFlags::CONNECT) {
        info!("rule #{} relay starting", rule_number);
    }

    let result = if let Some(udp_socket) = record.udp_socket.take() {
        udp_relay_stage(
            record.src,
            udp_socket,
            record.udp_client,
            record.auth,
            record.socks_rules,
            record.defaults,
            access,
            ident,
            source_host,
        )
        .await
    } else {
        let dst = record.dst.take().expect("a tcp io record always carries a dst socket");
        match record.timeouts.io_idle_secs {
            Some(secs) => Duplex::with_idle_timeout(record.src, dst, Duration::from_secs(secs as u64)).await,
            None => Duplex::new(record.src, dst).await,
        }
    };

    if log_flags.contains(LogFlags::DISCONNECT) {
        match &result {
            Ok((a, b)) => info!("rule #{} relay closed, {} bytes up, {} bytes down", rule_number, a, b),
            Err(e) => info!("rule #{} relay ended with error: {}", rule_number, e),
        }
    }
    result
}

/// Relays SOCKSv5 UDP datagrams between the client and whichever upstream
/// hosts it targets, preserving the header on the outbound leg and
/// synthesizing one for each inbound reply (spec.md §6). The control TCP
/// socket is only watched for EOF/error — its sole purpose once
/// UDP ASSOCIATE succeeds is tearing the association down when the
/// client closes it.
///
/// Granting UDP ASSOCIATE only authorizes opening the association
/// (spec.md §4.5 Scenario C); every datagram is still checked against
/// the socks-rule base per direction — an outbound datagram against a
/// `Command::UdpAssociate` rule filtering on its actual sender and dial
/// target, an inbound reply against a `Command::UdpReply` rule
/// filtering on the replying host and the known client — rather than
/// being relayed unconditionally once the association exists.
#[allow(clippy::too_many_arguments)]
async fn udp_relay_stage(
    mut control: TcpStream,
    udp_socket: UdpSocket,
    mut client: Option<SocketAddr>,
    auth: AuthState,
    socks_rules: Arc<RuleBase>,
    defaults: Arc<RuleDefaults>,
    access: &dyn AccessBackend,
    ident: &dyn IdentClient,
    source_host: &dyn SourceHostCheck,
) -> io::Result<(u64, u64)> {
    let mut control_buf = [0u8; 1];
    let mut buf = [0u8; 65507];
    let mut up = 0u64;
    let mut down = 0u64;

    loop {
        tokio::select! {
            res = control.read(&mut control_buf) => {
                match res {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(e) => return Err(e),
                }
            }
            res = udp_socket.recv_from(&mut buf) => {
                let (n, from) = res?;
                let is_from_client = client.map_or(true, |c| c == from);
                if is_from_client {
                    client.get_or_insert(from);
                    let Ok((header, payload)) = UdpHeader::decode(&buf[..n]) else {
                        continue;
                    };
                    let Ok(resolved) = header.dst.resolve_dns().await else {
                        continue;
                    };
                    if let TargetAddr::SocketAddr(target) = resolved {
                        let state = ConnectionState::new(Command::UdpAssociate, Protocol::Udp, Version::V5);
                        let inputs = RuleInputs {
                            src: Some(from.into()),
                            dst: Some(target.into()),
                            state: &state,
                            username: auth.method.username(),
                            resolved_aliases: &[],
                        };
                        let verdict = rules_permit(
                            &socks_rules, RuleClass::Socks, &inputs, &auth, &defaults, access, ident, source_host,
                        )
                        .await;
                        if verdict.is_pass() {
                            udp_socket.send_to(payload, target).await?;
                            up += payload.len() as u64;
                        }
                    }
                } else if let Some(client_addr) = client {
                    let state = ConnectionState::new(Command::UdpReply, Protocol::Udp, Version::V5);
                    let inputs = RuleInputs {
                        src: Some(from.into()),
                        dst: Some(client_addr.into()),
                        state: &state,
                        username: auth.method.username(),
                        resolved_aliases: &[],
                    };
                    let verdict = rules_permit(
                        &socks_rules, RuleClass::Socks, &inputs, &auth, &defaults, access, ident, source_host,
                    )
                    .await;
                    if verdict.is_pass() {
                        let header = UdpHeader::new(TargetAddr::SocketAddr(from));
                        if let Ok(datagram) = header.encode(&buf[..n]) {
                            udp_socket.send_to(&datagram, client_addr).await?;
                            down += n as u64;
                        }
                    }
                }
            }
        }
    }

    debug!("udp association closed, {} bytes up, {} bytes down", up, down);
    Ok((up, down))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_connect_request_line() {
        let (method, authority) = parse_request_line("CONNECT example.com:443 HTTP/1.1").unwrap();
        assert_eq!(method, "CONNECT");
        assert_eq!(authority, "example.com:443");
    }

    #[test]
    fn rejects_a_request_line_missing_the_version_token() {
        assert!(parse_request_line("CONNECT example.com:443").is_none());
    }

    #[test]
    fn parses_a_domain_authority() {
        let target = parse_authority("example.com:8080").unwrap();
        match target {
            TargetAddr::Domain(host, port) => {
                assert_eq!(host, "example.com");
                assert_eq!(port, 8080);
            }
            _ => panic!("expected a domain target"),
        }
    }

    #[test]
    fn parses_an_ipv4_authority() {
        let target = parse_authority("127.0.0.1:22").unwrap();
        assert!(matches!(target, TargetAddr::SocketAddr(SocketAddr::V4(_))));
    }

    #[test]
    fn authority_without_a_port_is_rejected() {
        assert!(parse_authority("example.com").is_err());
    }

    #[test]
    fn decodes_a_well_formed_basic_auth_header() {
        let encoded = format!("Basic {}", base64::encode("alice:hunter2"));
        let (user, pass) = parse_basic_auth(&encoded).unwrap();
        assert_eq!(user, "alice");
        assert_eq!(pass, "hunter2");
    }

    #[test]
    fn rejects_a_non_basic_auth_header() {
        assert!(parse_basic_auth("Digest abcdef").is_none());
    }

    #[test]
    fn rule_meta_falls_back_to_defaults_for_the_synthetic_sentinel() {
        let base = RuleBase::new(RuleClass::Socks);
        let (flags, timeouts) = rule_meta(&base, 0);
        assert!(flags.is_empty());
        assert_eq!(timeouts.io_idle_secs, None);
    }
}
