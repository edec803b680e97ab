// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Error types for the interception engine.

use thiserror::Error;

/// Errors produced by the proxy core.
///
/// Only `IdentityLoad` is fatal to the process; every other variant is
/// contained at the session or direction level.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The persisted root identity exists but cannot be loaded, or a fresh
    /// one cannot be generated. The proxy must not start without a root.
    #[error("failed to establish root identity: {0}")]
    IdentityLoad(String),

    /// The first request line was not a well-formed CONNECT.
    #[error("malformed CONNECT request: {0}")]
    MalformedRequest(String),

    /// Leaf issuance failed; the session cannot proceed.
    #[error("certificate issue failed for {host}: {reason}")]
    CertificateIssue { host: String, reason: String },

    /// A TLS handshake failed on either leg of the tunnel.
    #[error("TLS handshake with {peer} failed: {reason}")]
    Handshake { peer: String, reason: String },

    /// The TCP connection to the origin could not be established.
    #[error("could not reach origin {origin}: {reason}")]
    UpstreamConnect { origin: String, reason: String },

    /// The byte stream could not be reassembled into an HTTP message.
    /// Disables reassembly for the direction; forwarding continues.
    #[error("framing error: {0}")]
    Framing(String),

    /// No completed message is available yet.
    #[error("message is not yet complete")]
    NotReady,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
