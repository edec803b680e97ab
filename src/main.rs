// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use peek_http::{capture, config, proxy};

#[derive(Parser, Debug)]
#[command(name = "peek-http")]
struct Args {
    /// Listen address, e.g. 127.0.0.1:8080
    #[arg(long)]
    listen: Option<String>,

    /// Path to append observed-message captures as JSONL
    #[arg(long)]
    captures: Option<String>,

    /// Optional config TOML path
    #[arg(long)]
    config: Option<String>,

    /// Optional ad-block rule list path
    #[arg(long)]
    rules: Option<String>,

    /// Root certificate path (generated if absent)
    #[arg(long)]
    ca_cert: Option<String>,

    /// Root private key path (generated if absent)
    #[arg(long)]
    ca_key: Option<String>,
}

fn apply_overrides(cfg: &mut config::Config, args: &Args) {
    if let Some(listen) = &args.listen {
        cfg.general.listen = listen.clone();
    }
    if let Some(captures) = &args.captures {
        cfg.general.captures = captures.clone();
    }
    if let Some(rules) = &args.rules {
        cfg.rules.path = Some(rules.clone());
    }
    if let Some(ca_cert) = &args.ca_cert {
        cfg.tls.ca_cert_path = ca_cert.clone();
    }
    if let Some(ca_key) = &args.ca_key {
        cfg.tls.ca_key_path = ca_key.clone();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mut cfg = if let Some(ref p) = args.config {
        config::Config::load_from_path(p).await.unwrap_or_else(|e| {
            warn!(%p, %e, "failed to load config, using defaults");
            config::Config::default()
        })
    } else {
        config::Config::default()
    };
    apply_overrides(&mut cfg, &args);
    let cfg = Arc::new(cfg);

    let capture_writer = capture::CaptureWriter::new(cfg.general.captures.clone()).await?;
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<capture::MessageEvent>();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            if let Err(e) = capture_writer.write_event(event).await {
                warn!(%e, "failed to write capture");
            }
        }
    });

    let server = proxy::ProxyServer::bind(cfg.clone(), events_tx).await?;
    info!(addr = ?server.local_addr().ok(), "proxy ready");

    tokio::select! {
        res = server.run() => {
            if let Err(e) = res {
                error!(%e, "server error");
            }
        }
        _ = signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}
