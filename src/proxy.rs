// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Proxy server: startup sequence, accept loop, and lifecycle.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::ca::CertificateAuthority;
use crate::capture::MessageEvent;
use crate::config::Config;
use crate::rules::RuleMatcher;
use crate::scratch::ScratchDir;
use crate::tunnel::{self, SessionContext};

/// Accepts client connections and spawns one tunnel session per
/// connection. All initialization (root identity, scratch directory,
/// rule list, origin trust) happens in `bind`; only a root-identity
/// failure is fatal.
pub struct ProxyServer {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    grace: Duration,
}

impl ProxyServer {
    /// Runs the startup sequence and binds the listen socket.
    pub async fn bind(
        cfg: Arc<Config>,
        events: UnboundedSender<MessageEvent>,
    ) -> anyhow::Result<Self> {
        let ca = CertificateAuthority::load_or_generate(
            Path::new(&cfg.tls.ca_cert_path),
            Path::new(&cfg.tls.ca_key_path),
        )
        .await?;

        let scratch = ScratchDir::create(&cfg.tls.scratch_dir).await?;

        let matcher = match &cfg.rules.path {
            Some(path) => {
                let content = tokio::fs::read_to_string(path).await?;
                let matcher = RuleMatcher::from_rule_list(&content)?;
                info!(%path, "loaded rule list");
                matcher
            }
            None => RuleMatcher::new(),
        };

        let connector =
            tunnel::build_origin_connector(cfg.tls.extra_origin_roots.as_deref().map(Path::new))
                .await?;

        let ctx = Arc::new(SessionContext {
            ca,
            scratch,
            matcher: Arc::new(matcher),
            connector,
            events,
        });

        let addr: SocketAddr = cfg.general.listen.parse()?;
        let listener = TcpListener::bind(addr).await?;

        Ok(Self {
            listener,
            ctx,
            grace: Duration::from_secs(cfg.general.grace_seconds),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until the accept loop fails. Intended for `tokio::select!`
    /// against a shutdown signal in the binary.
    pub async fn run(self) -> anyhow::Result<()> {
        self.serve(None, None).await
    }

    /// Testable variant: accepts `n` connections, then drains and returns.
    /// Session tasks spawned for accepted connections may still be running
    /// within the grace period when this returns.
    pub async fn run_with_limit(self, n: usize) -> anyhow::Result<()> {
        self.serve(None, Some(n)).await
    }

    /// Starts serving in the background and returns a control handle.
    pub fn start(self) -> ProxyHandle {
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let addr = self.listener.local_addr().ok();
        let handle = tokio::spawn(async move {
            if let Err(e) = self.serve(Some(shutdown_rx), None).await {
                warn!(error = %e, "proxy server stopped with error");
            }
        });
        ProxyHandle {
            shutdown_tx,
            addr,
            handle,
        }
    }

    async fn serve(
        self,
        mut shutdown: Option<broadcast::Receiver<()>>,
        accept_limit: Option<usize>,
    ) -> anyhow::Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "listening");

        let mut sessions = JoinSet::new();
        let mut remaining = accept_limit;
        loop {
            if let Some(0) = remaining {
                break;
            }

            let accepted = match shutdown.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        res = self.listener.accept() => Some(res),
                        _ = rx.recv() => None,
                    }
                }
                None => Some(self.listener.accept().await),
            };
            let Some(res) = accepted else {
                info!("shutdown requested, no longer accepting");
                break;
            };
            let (stream, peer) = res?;

            if let Some(n) = remaining.as_mut() {
                *n -= 1;
            }

            // Reap finished sessions so the set does not grow unbounded.
            while sessions.try_join_next().is_some() {}

            let ctx = self.ctx.clone();
            sessions.spawn(async move {
                if let Err(e) = tunnel::handle_client(stream, peer, ctx).await {
                    debug!(%peer, error = %e, "session ended with error");
                }
            });
        }

        // Stop accepting immediately, then give in-flight tunnels a
        // bounded grace period before forcing them closed.
        drop(self.listener);
        let drain = async {
            while sessions.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.grace, drain).await.is_err() {
            warn!("grace period elapsed, aborting remaining sessions");
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }

        Ok(())
    }
}

/// Handle for controlling a proxy started in the background.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: Option<SocketAddr>,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Signals the proxy to stop accepting and drain.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}
