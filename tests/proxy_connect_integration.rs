// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::pki_types::{PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use uuid::Uuid;

use peek_http::ca::CertificateAuthority;
use peek_http::capture::{Direction, MessageEvent};
use peek_http::config::Config;
use peek_http::proxy::ProxyServer;

struct TestProxy {
    addr: SocketAddr,
    dir: PathBuf,
    cfg: Arc<Config>,
    events: mpsc::UnboundedReceiver<MessageEvent>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestProxy {
    fn scratch_dir(&self) -> PathBuf {
        PathBuf::from(&self.cfg.tls.scratch_dir)
    }

    fn ca_cert_path(&self) -> PathBuf {
        PathBuf::from(&self.cfg.tls.ca_cert_path)
    }

    async fn cleanup(self) {
        self.handle.abort();
        let _ = self.handle.await;
        let _ = tokio::fs::remove_dir_all(&self.dir).await;
    }
}

// Helper: bind a ProxyServer on an ephemeral port with temp CA/scratch
// paths and run it in the background.
async fn start_proxy(extra_origin_roots: Option<String>) -> anyhow::Result<TestProxy> {
    let dir = std::env::temp_dir().join(format!("peek_integ_{}", Uuid::new_v4()));
    let mut cfg = Config::default();
    cfg.general.listen = "127.0.0.1:0".to_string();
    cfg.general.grace_seconds = 1;
    cfg.tls.ca_cert_path = dir.join("ca.crt").to_string_lossy().to_string();
    cfg.tls.ca_key_path = dir.join("ca.key").to_string_lossy().to_string();
    cfg.tls.scratch_dir = dir.join("scratch").to_string_lossy().to_string();
    cfg.tls.extra_origin_roots = extra_origin_roots;
    let cfg = Arc::new(cfg);

    let (tx, rx) = mpsc::unbounded_channel();
    let server = ProxyServer::bind(cfg.clone(), tx).await?;
    let addr = server.local_addr()?;
    let handle = tokio::spawn(async move {
        let _ = server.run().await;
    });

    Ok(TestProxy {
        addr,
        dir,
        cfg,
        events: rx,
        handle,
    })
}

// Helper: send a CONNECT and read the response head.
async fn send_connect(addr: SocketAddr, host: &str, port: u16) -> anyhow::Result<(TcpStream, String)> {
    let mut stream = TcpStream::connect(addr).await?;
    let connect = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    stream.write_all(connect.as_bytes()).await?;

    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if Instant::now() > deadline {
            anyhow::bail!("timeout reading CONNECT response");
        }
        let n = match timeout(Duration::from_millis(500), stream.read(&mut tmp)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => continue,
        };
        buf.extend_from_slice(&tmp[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    Ok((stream, String::from_utf8_lossy(&buf).into_owned()))
}

// Helper: TLS-connect over an established tunnel, trusting the proxy CA.
async fn tls_over_tunnel(
    stream: TcpStream,
    host: &str,
    ca_cert_path: &Path,
) -> anyhow::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let pem = tokio::fs::read(ca_cert_path).await?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let mut roots = RootCertStore::empty();
    roots.add_parsable_certificates(certs);
    let client_cfg = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(client_cfg));
    let name = ServerName::try_from(host.to_string())?;
    Ok(connector.connect(name, stream).await?)
}

async fn wait_for_empty_dir(dir: &Path) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(e) => e,
            Err(_) => return false,
        };
        if entries.next_entry().await.ok().flatten().is_none() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn non_connect_first_line_gets_405_and_close() -> anyhow::Result<()> {
    let proxy = start_proxy(None).await?;

    let mut stream = TcpStream::connect(proxy.addr).await?;
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await?;

    let mut resp = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut resp)).await??;
    let resp = String::from_utf8_lossy(&resp);
    assert!(
        resp.starts_with("HTTP/1.1 405 Method Not Allowed"),
        "got: {resp}"
    );

    proxy.cleanup().await;
    Ok(())
}

#[tokio::test]
async fn unreachable_origin_closes_tunnel_and_cleans_scratch() -> anyhow::Result<()> {
    let proxy = start_proxy(None).await?;

    // Reserve a port, then free it so nothing listens there.
    let l = std::net::TcpListener::bind("127.0.0.1:0")?;
    let dead_port = l.local_addr()?.port();
    drop(l);

    let (stream, head) = send_connect(proxy.addr, "localhost", dead_port).await?;
    assert!(head.starts_with("HTTP/1.1 200 Connection Established"), "got: {head}");

    // The client-leg handshake succeeds; the origin connect then fails
    // and the proxy drops both sides of the tunnel.
    let mut tls = tls_over_tunnel(stream, "localhost", &proxy.ca_cert_path()).await?;
    let mut buf = [0u8; 64];
    let read = timeout(Duration::from_secs(5), tls.read(&mut buf)).await?;
    assert!(matches!(read, Ok(0) | Err(_)), "tunnel should have closed");

    // Scratch credentials for the attempt are gone.
    assert!(wait_for_empty_dir(&proxy.scratch_dir()).await);

    // The listening process survived the failed session.
    let probe = TcpStream::connect(proxy.addr).await;
    assert!(probe.is_ok());

    proxy.cleanup().await;
    Ok(())
}

#[tokio::test]
async fn malformed_connect_target_gets_405() -> anyhow::Result<()> {
    let proxy = start_proxy(None).await?;

    let mut stream = TcpStream::connect(proxy.addr).await?;
    stream
        .write_all(b"CONNECT example.com HTTP/1.1\r\n\r\n")
        .await?;
    let mut resp = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut resp)).await??;
    assert!(String::from_utf8_lossy(&resp).starts_with("HTTP/1.1 405"));

    proxy.cleanup().await;
    Ok(())
}

// Full interception round trip: a TLS origin signed by a second, in-test
// authority that the proxy is configured to trust as an extra anchor.
// The client only trusts the proxy's root, the proxy verifies the origin;
// both decrypted directions surface as observed-message events.
#[tokio::test]
async fn intercepts_and_observes_full_round_trip() -> anyhow::Result<()> {
    // In-test origin authority and a leaf for localhost.
    let origin_dir = std::env::temp_dir().join(format!("peek_origin_{}", Uuid::new_v4()));
    let origin_ca = CertificateAuthority::load_or_generate(
        &origin_dir.join("ca.crt"),
        &origin_dir.join("ca.key"),
    )
    .await?;
    let origin_leaf = origin_ca
        .get_or_issue("localhost", &["localhost".to_string()])
        .await?;

    // Origin server: one TLS connection, one fixed response.
    let origin_listener = TcpListener::bind("127.0.0.1:0").await?;
    let origin_port = origin_listener.local_addr()?.port();

    let leaf_ders: Vec<_> = rustls_pemfile::certs(&mut origin_leaf.cert_pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let keys: Vec<_> = rustls_pemfile::pkcs8_private_keys(&mut origin_leaf.key_pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let key = PrivateKeyDer::from(
        keys.into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no private keys parsed from PEM"))?,
    );
    let server_cfg = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(leaf_ders, key)?;
    let origin_acceptor = TlsAcceptor::from(Arc::new(server_cfg));

    let origin_task = tokio::spawn(async move {
        let (stream, _) = origin_listener.accept().await.expect("origin accept");
        let mut tls = origin_acceptor.accept(stream).await.expect("origin tls");
        let mut buf = Vec::new();
        let mut tmp = [0u8; 1024];
        loop {
            let n = tls.read(&mut tmp).await.expect("origin read");
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&tmp[..n]);
            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        tls.write_all(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nok",
        )
        .await
        .expect("origin write");
        tls.flush().await.expect("origin flush");
        let _ = tls.shutdown().await;
    });

    // Proxy trusts the origin authority as an extra anchor.
    let origin_ca_path = origin_dir.join("ca.crt").to_string_lossy().to_string();
    let mut proxy = start_proxy(Some(origin_ca_path)).await?;

    let (stream, head) = send_connect(proxy.addr, "localhost", origin_port).await?;
    assert!(head.starts_with("HTTP/1.1 200 Connection Established"));

    let mut tls = tls_over_tunnel(stream, "localhost", &proxy.ca_cert_path()).await?;
    tls.write_all(b"GET /hello HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\n\r\n")
        .await?;
    tls.flush().await?;

    let mut resp = Vec::new();
    timeout(Duration::from_secs(5), tls.read_to_end(&mut resp)).await??;
    let resp = String::from_utf8_lossy(&resp);
    assert!(resp.starts_with("HTTP/1.1 200 OK"), "got: {resp}");
    assert!(resp.ends_with("ok"));

    origin_task.await?;

    // Both directions were observed; ordering between directions is not
    // guaranteed.
    let mut seen = Vec::new();
    for _ in 0..2 {
        let event = timeout(Duration::from_secs(5), proxy.events.recv())
            .await?
            .expect("event");
        seen.push(event);
    }
    let request = seen
        .iter()
        .find(|e| e.direction == Direction::ClientToOrigin)
        .expect("request event");
    assert_eq!(request.summary, "GET /hello HTTP/1.1");
    assert_eq!(request.host, "localhost");
    let response = seen
        .iter()
        .find(|e| e.direction == Direction::OriginToClient)
        .expect("response event");
    assert_eq!(response.summary, "HTTP/1.1 200 OK");
    assert_eq!(response.content_type, "text/plain");
    assert!(response.body.ends_with("ok"));

    // Scratch credentials are removed once the session ends.
    assert!(wait_for_empty_dir(&proxy.scratch_dir()).await);

    proxy.cleanup().await;
    let _ = tokio::fs::remove_dir_all(&origin_dir).await;
    Ok(())
}
