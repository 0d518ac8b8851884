// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Domain identity exchange.
//!
//! Immediately after a tunnel stream is open both sides write their own
//! [`DomainIdentity`] and then read the peer's. There are no roles: the
//! exchange is symmetric, and the write is a single flushed frame so it
//! never waits on the peer's read.

use crate::codec::{CodecError, FrameCodec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncWrite};

/// Tunnel protocol version carried in every identity.
pub const PROTOCOL_VERSION: u16 = 1;

/// Capability key advertising the security mode a side is using.
pub const CAP_SECURITY: &str = "security";

/// Capability key advertising the forwarding policy of a side.
pub const CAP_POLICY: &str = "policy";

/// Identity of a domain, exchanged once per connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainIdentity {
    /// Domain name used for routing
    pub domain: String,

    /// Tunnel protocol version
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u16,

    /// Free-form capability metadata
    #[serde(default)]
    pub capabilities: BTreeMap<String, String>,
}

fn default_protocol_version() -> u16 {
    PROTOCOL_VERSION
}

impl DomainIdentity {
    /// Identity for `domain` with the current protocol version.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            protocol_version: PROTOCOL_VERSION,
            capabilities: BTreeMap::new(),
        }
    }

    /// Add a capability entry.
    pub fn with_capability(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.capabilities.insert(key.into(), value.into());
        self
    }

    /// Look up a capability entry.
    pub fn capability(&self, key: &str) -> Option<&str> {
        self.capabilities.get(key).map(String::as_str)
    }

    /// Check the identity is usable as a routing key.
    pub fn validate(&self) -> Result<(), HandshakeError> {
        if !is_valid_domain_name(&self.domain) {
            return Err(HandshakeError::InvalidIdentity(format!(
                "bad domain name '{}'",
                self.domain
            )));
        }
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(HandshakeError::ProtocolMismatch {
                local: PROTOCOL_VERSION,
                remote: self.protocol_version,
            });
        }
        Ok(())
    }
}

/// Domain names are non-empty and free of whitespace and `@`.
pub fn is_valid_domain_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('@') && !name.contains(char::is_whitespace)
}

/// Handshake errors.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("peer closed the stream before sending its identity")]
    PeerClosed,

    #[error("handshake I/O: {0}")]
    Codec(#[from] CodecError),

    #[error("invalid peer identity: {0}")]
    InvalidIdentity(String),

    #[error("protocol version mismatch: local {local}, remote {remote}")]
    ProtocolMismatch { local: u16, remote: u16 },

    #[error("expected domain '{expected}', peer is '{actual}'")]
    UnexpectedPeer { expected: String, actual: String },

    #[error("peer claims our own domain name '{0}'")]
    SameDomain(String),
}

/// Write `local`, then read and validate the peer's identity.
pub async fn exchange<S>(
    stream: &mut S,
    codec: &FrameCodec,
    local: &DomainIdentity,
) -> Result<DomainIdentity, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    codec.write(stream, local).await?;

    let peer: DomainIdentity = match codec.read(stream).await {
        Ok(Some(identity)) => identity,
        Ok(None) | Err(CodecError::Truncated) => return Err(HandshakeError::PeerClosed),
        Err(e) => return Err(e.into()),
    };

    peer.validate()?;
    if peer.domain == local.domain {
        return Err(HandshakeError::SameDomain(peer.domain));
    }
    Ok(peer)
}

/// Like [`exchange`], additionally requiring the peer to be `expected`.
pub async fn exchange_with<S>(
    stream: &mut S,
    codec: &FrameCodec,
    local: &DomainIdentity,
    expected: &str,
) -> Result<DomainIdentity, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let peer = exchange(stream, codec, local).await?;
    if peer.domain != expected {
        return Err(HandshakeError::UnexpectedPeer {
            expected: expected.to_string(),
            actual: peer.domain,
        });
    }
    Ok(peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn test_symmetric_exchange() {
        let codec = FrameCodec::default();
        let (mut a, mut b) = duplex(4096);
        let id_a = DomainIdentity::new("nodeA").with_capability(CAP_SECURITY, "none");
        let id_b = DomainIdentity::new("nodeB");

        let (ra, rb) = tokio::join!(
            exchange(&mut a, &codec, &id_a),
            exchange(&mut b, &codec, &id_b)
        );

        let peer_of_a = ra.unwrap();
        let peer_of_b = rb.unwrap();
        assert_eq!(peer_of_a.domain, "nodeB");
        assert_eq!(peer_of_b.domain, "nodeA");
        assert_eq!(peer_of_b.capability(CAP_SECURITY), Some("none"));
    }

    #[tokio::test]
    async fn test_peer_closes_before_identity() {
        let codec = FrameCodec::default();
        let (mut a, b) = duplex(4096);
        drop(b);

        // write may fail or succeed depending on buffering; either way no identity arrives
        let err = exchange(&mut a, &codec, &DomainIdentity::new("nodeA"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::PeerClosed | HandshakeError::Codec(CodecError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_eof_after_write_is_peer_closed() {
        let codec = FrameCodec::default();
        let (mut a, mut b) = duplex(4096);

        let peer = tokio::spawn(async move {
            let _: Option<DomainIdentity> = codec.read(&mut b).await.unwrap();
            b.shutdown().await.unwrap();
            drop(b);
        });

        let err = exchange(&mut a, &codec, &DomainIdentity::new("nodeA"))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::PeerClosed));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_unexpected_peer() {
        let codec = FrameCodec::default();
        let (mut a, mut b) = duplex(4096);

        let id_a = DomainIdentity::new("nodeA");
        let id_c = DomainIdentity::new("nodeC");
        let (ra, _) = tokio::join!(
            exchange_with(&mut a, &codec, &id_a, "nodeB"),
            exchange(&mut b, &codec, &id_c)
        );
        assert!(matches!(
            ra.unwrap_err(),
            HandshakeError::UnexpectedPeer { ref actual, .. } if actual == "nodeC"
        ));
    }

    #[tokio::test]
    async fn test_same_domain_rejected() {
        let codec = FrameCodec::default();
        let (mut a, mut b) = duplex(4096);
        let id = DomainIdentity::new("nodeA");

        let (ra, rb) = tokio::join!(exchange(&mut a, &codec, &id), exchange(&mut b, &codec, &id));
        assert!(matches!(ra.unwrap_err(), HandshakeError::SameDomain(_)));
        assert!(matches!(rb.unwrap_err(), HandshakeError::SameDomain(_)));
    }

    #[test]
    fn test_validate_identity() {
        assert!(DomainIdentity::new("nodeA").validate().is_ok());
        assert!(DomainIdentity::new("").validate().is_err());
        assert!(DomainIdentity::new("a b").validate().is_err());
        assert!(DomainIdentity::new("x@y").validate().is_err());

        let mut future = DomainIdentity::new("nodeA");
        future.protocol_version = PROTOCOL_VERSION + 1;
        assert!(matches!(
            future.validate(),
            Err(HandshakeError::ProtocolMismatch { .. })
        ));
    }
}
