// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Scratch directory for per-session credential files.
//!
//! Each tunnel writes its leaf certificate and key as uniquely named PEM
//! files for the lifetime of the session; they are removed on every exit
//! path, including cancellation.

use std::path::{Path, PathBuf};

use tokio::fs;
use uuid::Uuid;

/// Scratch-directory handle, created explicitly during proxy startup.
#[derive(Debug, Clone)]
pub struct ScratchDir {
    dir: PathBuf,
}

impl ScratchDir {
    pub async fn create(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Writes a session's leaf certificate and key PEM files.
    pub async fn write_credentials(
        &self,
        cert_pem: &str,
        key_pem: &str,
    ) -> anyhow::Result<SessionCredentials> {
        let id = Uuid::new_v4();
        let cert_path = self.dir.join(format!("{id}.crt"));
        let key_path = self.dir.join(format!("{id}.key"));
        fs::write(&cert_path, cert_pem).await?;
        fs::write(&key_path, key_pem).await?;
        Ok(SessionCredentials {
            cert_path,
            key_path,
            removed: false,
        })
    }
}

/// Guard for a session's scratch PEM files.
///
/// `remove` deletes them eagerly; if the session unwinds or is cancelled
/// first, `Drop` deletes whatever is left.
#[derive(Debug)]
pub struct SessionCredentials {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    removed: bool,
}

impl SessionCredentials {
    pub async fn remove(mut self) {
        let _ = fs::remove_file(&self.cert_path).await;
        let _ = fs::remove_file(&self.key_path).await;
        self.removed = true;
    }
}

impl Drop for SessionCredentials {
    fn drop(&mut self) {
        if !self.removed {
            let _ = std::fs::remove_file(&self.cert_path);
            let _ = std::fs::remove_file(&self.key_path);
        }
    }
}
