// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tunnel error taxonomy.
//!
//! Every failure a tunnel can hit is a [`TunnelError`]. The lifecycle only
//! needs to know which bucket a failure falls into ([`FailureKind`]) and
//! whether another cycle is worth attempting.

use crate::codec::CodecError;
use crate::handshake::HandshakeError;
use crate::routing::RouteError;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failure buckets used for retry decisions and log classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Directory unreachable or peer domain unknown
    Resolution,
    /// TCP connect refused, unreachable or timed out
    Connect,
    /// Security negotiation failed on an open socket
    Security,
    /// Identity exchange failed
    Handshake,
    /// Stream broke while forwarding
    Forwarding,
    /// Misconfiguration that no retry can fix
    Configuration,
    /// Internal invariant violated
    Defect,
    /// Tunnel was asked to stop
    Stopped,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Resolution => "resolution",
            Self::Connect => "connect",
            Self::Security => "security",
            Self::Handshake => "handshake",
            Self::Forwarding => "forwarding",
            Self::Configuration => "configuration",
            Self::Defect => "defect",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Tunnel errors.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("cannot resolve domain '{domain}': {reason}")]
    Resolution { domain: String, reason: String },

    #[error("connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("security negotiation with {endpoint} failed: {reason}")]
    Security { endpoint: String, reason: String },

    #[error("unsupported security mode '{0}'")]
    UnsupportedSecurity(String),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("{state} timed out after {after:?}")]
    Timeout { state: String, after: Duration },

    #[error("stream failure: {0}")]
    Codec(#[from] CodecError),

    #[error("peer closed the tunnel")]
    PeerClosed,

    #[error("outbound write failed: {0}")]
    Forwarding(String),

    #[error("routing defect: {0}")]
    Route(#[from] RouteError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("tunnel stopped")]
    Stopped,
}

impl TunnelError {
    /// Taxonomy bucket of this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Resolution { .. } => FailureKind::Resolution,
            Self::Connect { .. } => FailureKind::Connect,
            Self::Security { .. } => FailureKind::Security,
            Self::UnsupportedSecurity(_) | Self::Config(_) => FailureKind::Configuration,
            Self::Handshake(_) => FailureKind::Handshake,
            Self::Timeout { state, .. } => match state.as_str() {
                "LOCATING" => FailureKind::Resolution,
                "CONNECTING" => FailureKind::Connect,
                "HANDSHAKING" => FailureKind::Handshake,
                _ => FailureKind::Forwarding,
            },
            Self::Codec(_) | Self::PeerClosed | Self::Forwarding(_) => FailureKind::Forwarding,
            Self::Route(_) => FailureKind::Defect,
            Self::Stopped => FailureKind::Stopped,
        }
    }

    /// Whether the lifecycle should back off and try again.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.kind(),
            FailureKind::Configuration | FailureKind::Defect | FailureKind::Stopped
        )
    }
}

/// Result alias for tunnel operations.
pub type Result<T> = std::result::Result<T, TunnelError>;
