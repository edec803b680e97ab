// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Observed-message events and the JSONL capture sink.
//!
//! The tunnel core only emits `MessageEvent`s over a channel; what
//! consumes them (this JSONL writer, a console, an interactive display)
//! is outside the interception engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Which way the observed message travelled through the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ClientToOrigin,
    OriginToClient,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ClientToOrigin => write!(f, "client->origin"),
            Direction::OriginToClient => write!(f, "origin->client"),
        }
    }
}

/// One fully reassembled HTTP message observed inside a tunnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEvent {
    /// Session id of the tunnel the message was seen on.
    pub session: String,
    /// Target host of the tunnel.
    pub host: String,
    pub direction: Direction,
    /// One-line summary: the message start line.
    pub summary: String,
    pub content_type: String,
    /// Total message size in bytes (head + resolved body).
    pub size: u64,
    /// Full decoded text for text-like bodies, or a binary preview.
    pub body: String,
    /// Whether the rule matcher classified the request URL as matched.
    pub matched_rule: bool,
}

/// A `MessageEvent` as persisted to the captures file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub id: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub event: MessageEvent,
}

#[derive(Clone)]
pub struct CaptureWriter {
    file: ArcFile,
}

#[derive(Clone)]
struct ArcFile {
    inner: std::sync::Arc<Mutex<tokio::fs::File>>,
}

impl ArcFile {
    async fn new(path: &str) -> anyhow::Result<Self> {
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            inner: std::sync::Arc::new(Mutex::new(f)),
        })
    }

    async fn write_line(&self, line: &str) -> anyhow::Result<()> {
        let mut file = self.inner.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }
}

impl CaptureWriter {
    pub async fn new<P: Into<PathBuf>>(path: P) -> anyhow::Result<Self> {
        let path: PathBuf = path.into();
        let p = path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("captures path is not valid UTF-8"))?
            .to_string();
        let file = ArcFile::new(&p).await?;
        Ok(Self { file })
    }

    /// Appends one observed message as a JSONL record.
    pub async fn write_event(&self, event: MessageEvent) -> anyhow::Result<()> {
        let record = CaptureRecord {
            id: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            event,
        };
        let line = serde_json::to_string(&record)?;
        self.file.write_line(&line).await?;
        Ok(())
    }
}
