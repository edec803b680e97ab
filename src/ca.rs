// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Root certificate authority and per-host leaf issuance.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::pki_types::PrivateKeyDer;
use rustls::sign::CertifiedKey;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{ProxyError, Result};

const CA_COMMON_NAME: &str = "peek-http Root CA";
const CA_ORGANIZATION: &str = "peek-http";

/// Certificates are backdated so minor client/server clock skew does not
/// make a freshly issued leaf appear not-yet-valid.
const BACKDATE_DAYS: i64 = 2;
const CA_VALIDITY_DAYS: i64 = 10 * 365;
const LEAF_VALIDITY_DAYS: i64 = 365;

/// Leaf cache key: subject common name plus the sorted SAN list.
type LeafKey = (String, Vec<String>);

/// A leaf certificate issued for one host.
///
/// Leaves reuse the root's private key rather than carrying their own; this
/// is a deliberate trait of the tool's trust model, not a general CA
/// pattern. The key PEM here is therefore the root key.
pub struct LeafCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    pub certified: Arc<CertifiedKey>,
}

/// Owns the root identity and issues cached per-host leaf certificates.
pub struct CertificateAuthority {
    ca_cert_pem: String,
    /// The root private key, also used as every leaf's key.
    ca_key_pair: KeyPair,
    /// Issued leaves, never evicted within a process lifetime. The single
    /// lock also serializes generation so concurrent first requests for
    /// the same key produce exactly one certificate.
    cache: Mutex<HashMap<LeafKey, Arc<LeafCertificate>>>,
}

impl CertificateAuthority {
    /// Loads the root identity from the given paths, or generates and
    /// persists a fresh one if either file is missing.
    ///
    /// Existing-but-unreadable files are fatal: the proxy must not start
    /// with a broken root.
    pub async fn load_or_generate(cert_path: &Path, key_path: &Path) -> Result<Arc<Self>> {
        if cert_path.exists() && key_path.exists() {
            info!("Loading existing root identity from {:?}", cert_path);
            Self::load(cert_path, key_path).await
        } else {
            info!("Generating new root identity at {:?}", cert_path);
            Self::generate_and_save(cert_path, key_path).await
        }
    }

    async fn load(cert_path: &Path, key_path: &Path) -> Result<Arc<Self>> {
        let cert_pem = fs::read_to_string(cert_path)
            .await
            .map_err(|e| ProxyError::IdentityLoad(format!("read root cert: {e}")))?;
        let key_pem = fs::read_to_string(key_path)
            .await
            .map_err(|e| ProxyError::IdentityLoad(format!("read root key: {e}")))?;

        let parsed: Vec<_> = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ProxyError::IdentityLoad(format!("parse root cert: {e}")))?;
        if parsed.is_empty() {
            return Err(ProxyError::IdentityLoad(
                "root cert file contains no certificate".into(),
            ));
        }

        let key_pair = KeyPair::from_pem(&key_pem)
            .map_err(|e| ProxyError::IdentityLoad(format!("parse root key: {e}")))?;

        Ok(Arc::new(Self {
            ca_cert_pem: cert_pem,
            ca_key_pair: key_pair,
            cache: Mutex::new(HashMap::new()),
        }))
    }

    async fn generate_and_save(cert_path: &Path, key_path: &Path) -> Result<Arc<Self>> {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| ProxyError::IdentityLoad(format!("generate root key: {e}")))?;
        let cert = ca_params()
            .map_err(|e| ProxyError::IdentityLoad(format!("root params: {e}")))?
            .self_signed(&key_pair)
            .map_err(|e| ProxyError::IdentityLoad(format!("self-sign root: {e}")))?;
        let cert_pem = cert.pem();
        let key_pem = key_pair.serialize_pem();

        if let Some(parent) = cert_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ProxyError::IdentityLoad(format!("create cert dir: {e}")))?;
        }
        if let Some(parent) = key_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ProxyError::IdentityLoad(format!("create key dir: {e}")))?;
        }
        fs::write(cert_path, &cert_pem)
            .await
            .map_err(|e| ProxyError::IdentityLoad(format!("write root cert: {e}")))?;
        fs::write(key_path, &key_pem)
            .await
            .map_err(|e| ProxyError::IdentityLoad(format!("write root key: {e}")))?;

        Ok(Arc::new(Self {
            ca_cert_pem: cert_pem,
            ca_key_pair: key_pair,
            cache: Mutex::new(HashMap::new()),
        }))
    }

    /// Returns the cached leaf for `(host, sans)` or issues a new one.
    pub async fn get_or_issue(&self, host: &str, sans: &[String]) -> Result<Arc<LeafCertificate>> {
        let mut sorted = sans.to_vec();
        sorted.sort();
        let key = (host.to_string(), sorted);

        let mut cache = self.cache.lock().await;
        if let Some(leaf) = cache.get(&key) {
            return Ok(leaf.clone());
        }

        let leaf = self.issue(host, sans).map_err(|e| ProxyError::CertificateIssue {
            host: host.to_string(),
            reason: e.to_string(),
        })?;
        cache.insert(key, leaf.clone());
        Ok(leaf)
    }

    fn issue(&self, host: &str, sans: &[String]) -> anyhow::Result<Arc<LeafCertificate>> {
        let mut params = CertificateParams::new(sans.to_vec())?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, host);
        params.use_authority_key_identifier_extension = false;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(BACKDATE_DAYS);
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);
        params.serial_number = Some(SerialNumber::from(random_serial().to_vec()));

        // Sign over the root's own key pair: leaf key == root key.
        let issuer = Issuer::new(ca_params()?, &self.ca_key_pair);
        let cert = params.signed_by(&self.ca_key_pair, &issuer)?;
        let cert_pem = cert.pem();
        let key_pem = self.ca_key_pair.serialize_pem();

        let certs: Vec<_> =
            rustls_pemfile::certs(&mut cert_pem.as_bytes()).collect::<std::result::Result<Vec<_>, _>>()?;
        let leaf_cert = certs
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no certificates parsed from PEM"))?;

        let keys: Vec<_> = rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_bytes())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let leaf_key_bytes = keys
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no private keys parsed from PEM"))?;
        let leaf_key_der = PrivateKeyDer::from(leaf_key_bytes);

        let signer = any_supported_type(&leaf_key_der)
            .map_err(|e| anyhow::anyhow!("failed to create leaf key signer: {e}"))?;
        let certified = Arc::new(CertifiedKey::new(vec![leaf_cert], signer));

        Ok(Arc::new(LeafCertificate {
            cert_pem,
            key_pem,
            certified,
        }))
    }

    pub fn root_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }
}

fn ca_params() -> std::result::Result<CertificateParams, rcgen::Error> {
    let mut params = CertificateParams::new(vec![])?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, CA_COMMON_NAME);
    params
        .distinguished_name
        .push(DnType::OrganizationName, CA_ORGANIZATION);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(BACKDATE_DAYS);
    params.not_after = now + Duration::days(CA_VALIDITY_DAYS);
    Ok(params)
}

fn random_serial() -> [u8; 16] {
    let mut serial: [u8; 16] = rand::random();
    // Keep the DER INTEGER positive.
    serial[0] &= 0x7f;
    serial
}
