// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! One intercepted CONNECT tunnel: handshake sequencing and forwarding.
//!
//! A session reads the CONNECT head, obtains a leaf certificate, answers
//! `200 Connection Established`, terminates TLS on the client leg with the
//! minted leaf, opens a verified TLS connection to the real origin, and
//! then runs one forwarding pump per direction. Pumps forward every byte
//! unmodified and feed a copy into a per-direction reassembler for
//! observation only.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use rustls::pki_types::ServerName;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::ca::{CertificateAuthority, LeafCertificate};
use crate::capture::{Direction, MessageEvent};
use crate::error::{ProxyError, Result};
use crate::reassembly::{decode_text, is_text_content_type, FeedOutcome, MessageReassembler};
use crate::rules::RuleMatcher;
use crate::scratch::ScratchDir;

pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
pub const NOT_ALLOWED: &[u8] = b"HTTP/1.1 405 Method Not Allowed\r\n\r\n";

const READ_CHUNK: usize = 64 * 1024;
const MAX_CONNECT_HEAD: usize = 8 * 1024;

static CONNECT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^CONNECT\s+([\w.-]+):(\d+)\s+HTTP/\d\.\d").expect("connect regex"));

/// Shared dependencies handed to every session.
pub struct SessionContext {
    pub ca: Arc<CertificateAuthority>,
    pub scratch: ScratchDir,
    pub matcher: Arc<RuleMatcher>,
    pub connector: TlsConnector,
    pub events: UnboundedSender<MessageEvent>,
}

/// Builds the origin-leg TLS connector with the platform trust store.
/// `extra_roots` only adds anchors; hostname and chain verification stay
/// on for every origin connection.
pub async fn build_origin_connector(extra_roots: Option<&Path>) -> anyhow::Result<TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    if !native.errors.is_empty() {
        warn!(
            errors = native.errors.len(),
            "some platform trust anchors failed to load"
        );
    }
    for cert in native.certs {
        let _ = roots.add(cert);
    }
    if let Some(path) = extra_roots {
        let pem = tokio::fs::read(path).await?;
        let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_slice())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        roots.add_parsable_certificates(certs);
    }
    if roots.is_empty() {
        anyhow::bail!("no trust anchors available for origin verification");
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

#[derive(Debug)]
struct AlwaysResolves(Arc<CertifiedKey>);

impl ResolvesServerCert for AlwaysResolves {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// Parses `CONNECT <host>:<port> HTTP/<ver>` from a request head.
pub fn parse_connect_request(head: &str) -> Result<(String, u16)> {
    let caps = CONNECT_RE.captures(head).ok_or_else(|| {
        let first_line = head.lines().next().unwrap_or_default();
        ProxyError::MalformedRequest(first_line.to_string())
    })?;
    let host = caps[1].to_string();
    let port: u16 = caps[2]
        .parse()
        .map_err(|_| ProxyError::MalformedRequest(format!("port out of range: {}", &caps[2])))?;
    Ok((host, port))
}

/// Handles one accepted client connection for its whole lifetime.
///
/// Sockets close when the streams drop; scratch credentials are removed
/// on every exit path.
pub async fn handle_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<SessionContext>,
) -> Result<()> {
    let session_id = Uuid::new_v4();

    let head = match read_connect_head(&mut stream).await {
        Ok(head) => head,
        Err(e) => {
            if matches!(e, ProxyError::MalformedRequest(_)) {
                let _ = stream.write_all(NOT_ALLOWED).await;
            }
            let _ = stream.shutdown().await;
            return Err(e);
        }
    };
    let (host, port) = match parse_connect_request(&head) {
        Ok(target) => target,
        Err(e) => {
            let _ = stream.write_all(NOT_ALLOWED).await;
            let _ = stream.shutdown().await;
            return Err(e);
        }
    };
    debug!(%peer, %host, port, %session_id, "accepted CONNECT");

    let sans = vec![host.clone()];
    let leaf = ctx.ca.get_or_issue(&host, &sans).await?;
    let creds = ctx
        .scratch
        .write_credentials(&leaf.cert_pem, &leaf.key_pem)
        .await
        .map_err(|e| ProxyError::CertificateIssue {
            host: host.clone(),
            reason: e.to_string(),
        })?;

    let result = run_tunnel(stream, session_id, &host, port, leaf, &ctx).await;
    creds.remove().await;
    result
}

async fn run_tunnel(
    mut stream: TcpStream,
    session_id: Uuid,
    host: &str,
    port: u16,
    leaf: Arc<LeafCertificate>,
    ctx: &SessionContext,
) -> Result<()> {
    stream.write_all(CONNECTION_ESTABLISHED).await?;
    stream.flush().await?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(AlwaysResolves(leaf.certified.clone())));
    let acceptor = TlsAcceptor::from(Arc::new(server_config));
    let client_tls = acceptor
        .accept(stream)
        .await
        .map_err(|e| ProxyError::Handshake {
            peer: "client".to_string(),
            reason: e.to_string(),
        })?;

    // The origin leg is a normal, fully verified TLS client connection;
    // only the client-facing leg is intercepted.
    let origin_tcp =
        TcpStream::connect((host, port))
            .await
            .map_err(|e| ProxyError::UpstreamConnect {
                origin: format!("{host}:{port}"),
                reason: e.to_string(),
            })?;
    let server_name =
        ServerName::try_from(host.to_string()).map_err(|e| ProxyError::Handshake {
            peer: format!("{host}:{port}"),
            reason: e.to_string(),
        })?;
    let origin_tls =
        ctx.connector
            .connect(server_name, origin_tcp)
            .await
            .map_err(|e| ProxyError::Handshake {
                peer: format!("{host}:{port}"),
                reason: e.to_string(),
            })?;

    debug!(%host, port, "tunnel established, forwarding");

    let (client_read, client_write) = tokio::io::split(client_tls);
    let (origin_read, origin_write) = tokio::io::split(origin_tls);

    let session = session_id.to_string();
    tokio::join!(
        pump(
            client_read,
            origin_write,
            Direction::ClientToOrigin,
            &session,
            host,
            &ctx.matcher,
            &ctx.events,
        ),
        pump(
            origin_read,
            client_write,
            Direction::OriginToClient,
            &session,
            host,
            &ctx.matcher,
            &ctx.events,
        ),
    );

    Ok(())
}

async fn read_connect_head(stream: &mut TcpStream) -> Result<String> {
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::MalformedRequest(
                "connection closed before end of request head".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > MAX_CONNECT_HEAD {
            return Err(ProxyError::MalformedRequest(
                "request head too large".to_string(),
            ));
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Forwards one direction of the tunnel.
///
/// Every chunk is written through before it is offered to the
/// reassembler; forwarding latency never depends on message framing.
/// When the source ends or a write fails, the destination is shut down
/// so the sibling pump observes end-of-stream promptly.
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    session: &str,
    host: &str,
    matcher: &RuleMatcher,
    events: &UnboundedSender<MessageEvent>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reassembler = Some(MessageReassembler::new());
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                trace!(%host, %direction, error = %e, "read ended");
                break;
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            trace!(%host, %direction, error = %e, "write ended");
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
        observe(
            &mut reassembler,
            &buf[..n],
            direction,
            session,
            host,
            matcher,
            events,
        );
    }
    let _ = writer.shutdown().await;
}

/// Feeds forwarded bytes into the direction's reassembler and emits one
/// event per completed message. A framing failure drops the reassembler
/// for the rest of the tunnel; forwarding is unaffected.
fn observe(
    slot: &mut Option<MessageReassembler>,
    chunk: &[u8],
    direction: Direction,
    session: &str,
    host: &str,
    matcher: &RuleMatcher,
    events: &UnboundedSender<MessageEvent>,
) {
    let Some(reassembler) = slot.as_mut() else {
        return;
    };
    let mut data = chunk;
    loop {
        match reassembler.feed(data) {
            Ok(FeedOutcome::Complete) => {
                emit_event(reassembler, direction, session, host, matcher, events);
                reassembler.reset();
                // Trailing bytes are already buffered; keep draining.
                data = &[];
            }
            Ok(FeedOutcome::NeedMoreData) => return,
            Err(e) => {
                warn!(%host, %direction, error = %e, "disabling reassembly for this direction");
                *slot = None;
                return;
            }
        }
    }
}

fn emit_event(
    reassembler: &MessageReassembler,
    direction: Direction,
    session: &str,
    host: &str,
    matcher: &RuleMatcher,
    events: &UnboundedSender<MessageEvent>,
) {
    let Ok(msg) = reassembler.completed_message() else {
        return;
    };
    let summary = msg.start_line();
    let body = if is_text_content_type(msg.content_type) {
        decode_text(msg.raw)
    } else {
        format!(
            "[binary content: {}, {} bytes]",
            msg.content_type,
            msg.raw.len()
        )
    };
    let matched_rule = direction == Direction::ClientToOrigin
        && matcher.matches(&request_url(host, &summary));
    let event = MessageEvent {
        session: session.to_string(),
        host: host.to_string(),
        direction,
        summary,
        content_type: msg.content_type.to_string(),
        size: msg.raw.len() as u64,
        body,
        matched_rule,
    };
    let _ = events.send(event);
}

/// Rebuilds the URL a rule list speaks about from the tunnel host and the
/// request target, e.g. `example.com` + `GET /ad.js HTTP/1.1` ->
/// `example.com/ad.js`.
fn request_url(host: &str, start_line: &str) -> String {
    let target = start_line.split_whitespace().nth(1).unwrap_or("/");
    if target.starts_with('/') {
        format!("{host}{target}")
    } else {
        target.to_string()
    }
}
