// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection establishment.
//!
//! Opens (or adopts) a TCP socket, applies socket options and wraps it with
//! the requested security mode. The identity exchange runs afterwards on
//! the returned stream.

use crate::error::TunnelError;
use crate::security::{BoxedStream, SecurityContext, SecurityMode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tokio::net::TcpStream;

// ============================================================================
// Endpoint
// ============================================================================

/// Network endpoint of a peer domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Error parsing `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid endpoint '{0}' (expected host:port)")]
pub struct EndpointParseError(pub String);

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || EndpointParseError(s.to_string());

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, rest) = rest.split_once(']').ok_or_else(err)?;
            let port = rest.strip_prefix(':').ok_or_else(err)?;
            (host, port)
        } else {
            s.rsplit_once(':').ok_or_else(err)?
        };

        if host.is_empty() || (host.contains(':') && !s.starts_with('[')) {
            return Err(err());
        }
        let port: u16 = port.parse().map_err(|_| err())?;
        if port == 0 {
            return Err(err());
        }
        Ok(Self::new(host, port))
    }
}

// ============================================================================
// Establisher
// ============================================================================

/// Produces secured tunnel streams.
#[derive(Debug, Clone)]
pub struct ConnectionEstablisher {
    security: SecurityContext,
    keepalive: Option<Duration>,
}

impl ConnectionEstablisher {
    pub fn new(security: SecurityContext, keepalive: Option<Duration>) -> Self {
        Self {
            security,
            keepalive,
        }
    }

    pub fn security(&self) -> &SecurityContext {
        &self.security
    }

    /// Dial `endpoint` and wrap the socket in `mode`.
    ///
    /// An unsupported mode fails before any socket is opened.
    pub async fn connect(
        &self,
        endpoint: &Endpoint,
        mode: SecurityMode,
    ) -> Result<BoxedStream, TunnelError> {
        let authenticator = self
            .security
            .connector(mode)
            .map_err(|e| TunnelError::UnsupportedSecurity(e.0))?;

        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|source| TunnelError::Connect {
                endpoint: endpoint.to_string(),
                source,
            })?;
        self.configure(&stream);

        tracing::debug!(endpoint = %endpoint, mode = %mode, "TCP connected");

        authenticator
            .wrap_client(stream, &endpoint.host)
            .await
            .map_err(|e| TunnelError::Security {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })
    }

    /// Wrap an accepted socket in `mode` (server role).
    pub async fn accept(
        &self,
        stream: TcpStream,
        mode: SecurityMode,
    ) -> Result<BoxedStream, TunnelError> {
        let authenticator = self
            .security
            .acceptor(mode)
            .map_err(|e| TunnelError::UnsupportedSecurity(e.0))?;

        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        self.configure(&stream);

        authenticator
            .wrap_server(stream)
            .await
            .map_err(|e| TunnelError::Security {
                endpoint: peer,
                reason: e.to_string(),
            })
    }

    fn configure(&self, stream: &TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "set_nodelay failed");
        }
        if let Some(idle) = self.keepalive {
            let keepalive = socket2::TcpKeepalive::new().with_time(idle);
            if let Err(e) = socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive) {
                tracing::debug!(error = %e, "TCP keepalive not applied");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_endpoint() {
        let ep: Endpoint = "10.0.0.5:11000".parse().unwrap();
        assert_eq!(ep, Endpoint::new("10.0.0.5", 11000));
        assert_eq!(ep.to_string(), "10.0.0.5:11000");

        let ep: Endpoint = "head.example.org:22125".parse().unwrap();
        assert_eq!(ep.host, "head.example.org");

        let ep: Endpoint = "[::1]:11000".parse().unwrap();
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.to_string(), "[::1]:11000");
    }

    #[test]
    fn test_parse_endpoint_invalid() {
        for bad in ["", "nohost", ":11000", "host:", "host:0", "host:99999", "::1:11000", "[::1]11000"] {
            assert!(bad.parse::<Endpoint>().is_err(), "{} should not parse", bad);
        }
    }

    #[tokio::test]
    async fn test_connect_plain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::from(listener.local_addr().unwrap());
        let establisher =
            ConnectionEstablisher::new(SecurityContext::plain(), Some(Duration::from_secs(30)));

        let (client, accepted) = tokio::join!(
            establisher.connect(&endpoint, SecurityMode::None),
            listener.accept()
        );
        assert!(client.is_ok());
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn test_connect_refused_is_retryable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::from(listener.local_addr().unwrap());
        drop(listener);

        let establisher = ConnectionEstablisher::new(SecurityContext::plain(), None);
        let err = establisher
            .connect(&endpoint, SecurityMode::None)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), FailureKind::Connect);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unsupported_mode_is_fatal() {
        let establisher = ConnectionEstablisher::new(SecurityContext::plain(), None);
        let err = establisher
            .connect(&Endpoint::new("127.0.0.1", 1), SecurityMode::Tls)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TunnelError::UnsupportedSecurity(_)));
        assert!(!err.is_retryable());
    }
}
