// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Configuration loading.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Listen address, e.g. 127.0.0.1:8080
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path to append observed-message captures as JSONL
    #[serde(default = "default_captures")]
    pub captures: String,

    /// Grace period in seconds for draining in-flight tunnels on shutdown
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: u64,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_captures() -> String {
    "captures.jsonl".to_string()
}

fn default_grace_seconds() -> u64 {
    5
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            captures: default_captures(),
            grace_seconds: default_grace_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// Path to the PEM root certificate; generated if absent.
    #[serde(default = "default_ca_cert_path")]
    pub ca_cert_path: String,

    /// Path to the PEM root private key; generated if absent.
    #[serde(default = "default_ca_key_path")]
    pub ca_key_path: String,

    /// Directory for per-session scratch credential files.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: String,

    /// Optional PEM file with additional roots trusted on the origin leg.
    /// The platform trust store is always used; this only adds anchors.
    #[serde(default)]
    pub extra_origin_roots: Option<String>,
}

fn default_ca_cert_path() -> String {
    "certs/ca.crt".to_string()
}

fn default_ca_key_path() -> String {
    "certs/ca.key".to_string()
}

fn default_scratch_dir() -> String {
    "temp_certs".to_string()
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca_cert_path: default_ca_cert_path(),
            ca_key_path: default_ca_key_path(),
            scratch_dir: default_scratch_dir(),
            extra_origin_roots: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RulesConfig {
    /// Optional path to a newline-delimited ad-block rule list.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub rules: RulesConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub async fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let s = tokio::fs::read_to_string(path.as_ref()).await?;
        let cfg: Self = toml::from_str(&s)?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::fs;
    use uuid::Uuid;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.general.listen, "127.0.0.1:8080");
        assert_eq!(cfg.general.captures, "captures.jsonl");
        assert_eq!(cfg.general.grace_seconds, 5);
        assert_eq!(cfg.tls.ca_cert_path, "certs/ca.crt");
        assert_eq!(cfg.tls.scratch_dir, "temp_certs");
        assert!(cfg.tls.extra_origin_roots.is_none());
        assert!(cfg.rules.path.is_none());
    }

    #[tokio::test]
    async fn load_toml_file() -> anyhow::Result<()> {
        let tmp = std::env::temp_dir().join(format!("peek-http_cfg_test_{}.toml", Uuid::new_v4()));
        let toml = r#"[general]
listen = "127.0.0.1:9999"
captures = "out.jsonl"

[tls]
ca_cert_path = "x/ca.crt"
ca_key_path = "x/ca.key"
scratch_dir = "x/scratch"

[rules]
path = "easylist.txt"
"#;
        fs::write(&tmp, toml).await?;
        let cfg = Config::load_from_path(&tmp).await?;
        assert_eq!(cfg.general.listen, "127.0.0.1:9999");
        assert_eq!(cfg.general.captures, "out.jsonl");
        assert_eq!(cfg.tls.ca_cert_path, "x/ca.crt");
        assert_eq!(cfg.rules.path.as_deref(), Some("easylist.txt"));
        // untouched sections fall back to defaults
        assert_eq!(cfg.general.grace_seconds, 5);
        fs::remove_file(&tmp).await?;
        Ok(())
    }

    #[tokio::test]
    async fn load_partial_toml_uses_section_defaults() -> anyhow::Result<()> {
        let tmp = std::env::temp_dir().join(format!("peek-http_cfg_part_{}.toml", Uuid::new_v4()));
        fs::write(&tmp, "[general]\nlisten = \"0.0.0.0:3128\"\n").await?;
        let cfg = Config::load_from_path(&tmp).await?;
        assert_eq!(cfg.general.listen, "0.0.0.0:3128");
        assert_eq!(cfg.tls.ca_cert_path, "certs/ca.crt");
        fs::remove_file(&tmp).await?;
        Ok(())
    }

    #[tokio::test]
    async fn load_missing_file_errors() {
        let p = std::env::temp_dir().join("peek-http_cfg_missing_does_not_exist.toml");
        let res = Config::load_from_path(&p).await;
        assert!(res.is_err());
    }
}
