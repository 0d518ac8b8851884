// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Security wrapper for tunnel sockets.
//!
//! A raw TCP socket is wrapped by an [`Authenticator`] before the identity
//! exchange. Two modes exist:
//!
//! - `none`: the socket is used as is
//! - `tls`: rustls client or server session via tokio-rustls
//!
//! # Example
//!
//! ```ignore
//! let tls = TlsAuthenticator::builder()
//!     .with_cert_file("domain.crt")?
//!     .with_key_file("domain.key")?
//!     .with_root_certs_file("ca.crt")?
//!     .build()?;
//! ```

use crate::config::TlsSettings;
use async_trait::async_trait;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

// ============================================================================
// Streams
// ============================================================================

/// Byte stream a tunnel runs over (plain TCP or a TLS session).
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelStream for T {}

/// Boxed tunnel stream.
pub type BoxedStream = Box<dyn TunnelStream>;

// ============================================================================
// Security mode
// ============================================================================

/// Security mode token as used in configuration and directory replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    /// Plain TCP
    #[default]
    None,
    /// TLS over TCP
    Tls,
}

impl SecurityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Tls => "tls",
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown security mode token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported security mode '{0}'")]
pub struct UnsupportedMode(pub String);

impl FromStr for SecurityMode {
    type Err = UnsupportedMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "plain" => Ok(Self::None),
            "tls" | "ssl" => Ok(Self::Tls),
            _ => Err(UnsupportedMode(s.to_string())),
        }
    }
}

// ============================================================================
// Authenticator
// ============================================================================

/// Wraps an open socket in the channel of one security mode.
#[async_trait]
pub trait Authenticator: Send + Sync + fmt::Debug {
    /// Mode implemented by this authenticator.
    fn mode(&self) -> SecurityMode;

    /// Wrap a socket we dialed. `server_name` is the host we dialed.
    async fn wrap_client(&self, stream: TcpStream, server_name: &str) -> io::Result<BoxedStream>;

    /// Wrap a socket we accepted.
    async fn wrap_server(&self, stream: TcpStream) -> io::Result<BoxedStream>;
}

/// The `none` mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainAuthenticator;

#[async_trait]
impl Authenticator for PlainAuthenticator {
    fn mode(&self) -> SecurityMode {
        SecurityMode::None
    }

    async fn wrap_client(&self, stream: TcpStream, _server_name: &str) -> io::Result<BoxedStream> {
        Ok(Box::new(stream))
    }

    async fn wrap_server(&self, stream: TcpStream) -> io::Result<BoxedStream> {
        Ok(Box::new(stream))
    }
}

// ============================================================================
// TLS
// ============================================================================

/// The `tls` mode.
pub struct TlsAuthenticator {
    client: Option<Arc<ClientConfig>>,
    server: Option<Arc<ServerConfig>>,
    server_name: Option<String>,
}

impl fmt::Debug for TlsAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsAuthenticator")
            .field("client", &self.client.is_some())
            .field("server", &self.server.is_some())
            .field("server_name", &self.server_name)
            .finish()
    }
}

impl TlsAuthenticator {
    pub fn builder() -> TlsAuthenticatorBuilder {
        TlsAuthenticatorBuilder::default()
    }

    /// Load PEM files named in the domain configuration.
    pub fn from_settings(settings: &TlsSettings) -> io::Result<Self> {
        let mut builder = Self::builder();
        if let Some(path) = &settings.cert_chain {
            builder = builder.with_cert_file(path)?;
        }
        if let Some(path) = &settings.private_key {
            builder = builder.with_key_file(path)?;
        }
        if let Some(path) = &settings.ca_certs {
            builder = builder.with_root_certs_file(path)?;
        }
        if settings.require_client_auth {
            builder = builder.require_client_cert();
        }
        if let Some(name) = &settings.server_name {
            builder = builder.with_server_name(name.clone());
        }
        builder.build()
    }

    pub fn can_connect(&self) -> bool {
        self.client.is_some()
    }

    pub fn can_accept(&self) -> bool {
        self.server.is_some()
    }
}

#[async_trait]
impl Authenticator for TlsAuthenticator {
    fn mode(&self) -> SecurityMode {
        SecurityMode::Tls
    }

    async fn wrap_client(&self, stream: TcpStream, server_name: &str) -> io::Result<BoxedStream> {
        let config = self.client.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no TLS trust anchors configured")
        })?;
        let name = self.server_name.as_deref().unwrap_or(server_name);
        let name = ServerName::try_from(name.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let connector = tokio_rustls::TlsConnector::from(Arc::clone(config));
        let tls = connector.connect(name, stream).await?;
        Ok(Box::new(tls))
    }

    async fn wrap_server(&self, stream: TcpStream) -> io::Result<BoxedStream> {
        let config = self.server.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no TLS certificate configured")
        })?;
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::clone(config));
        let tls = acceptor.accept(stream).await?;
        Ok(Box::new(tls))
    }
}

/// Builder for [`TlsAuthenticator`].
#[derive(Default)]
pub struct TlsAuthenticatorBuilder {
    cert_chain: Option<Vec<u8>>,
    private_key: Option<Vec<u8>>,
    root_certs: Vec<Vec<u8>>,
    require_client_cert: bool,
    server_name: Option<String>,
}

impl TlsAuthenticatorBuilder {
    /// Set certificate chain (PEM format).
    pub fn with_cert_pem(mut self, pem_data: Vec<u8>) -> Self {
        self.cert_chain = Some(pem_data);
        self
    }

    /// Load certificate chain from file.
    pub fn with_cert_file(self, path: impl AsRef<Path>) -> io::Result<Self> {
        let pem_data = std::fs::read(path)?;
        Ok(self.with_cert_pem(pem_data))
    }

    /// Set private key (PEM format).
    pub fn with_key_pem(mut self, pem_data: Vec<u8>) -> Self {
        self.private_key = Some(pem_data);
        self
    }

    /// Load private key from file.
    pub fn with_key_file(self, path: impl AsRef<Path>) -> io::Result<Self> {
        let pem_data = std::fs::read(path)?;
        Ok(self.with_key_pem(pem_data))
    }

    /// Add trust anchors (PEM format).
    pub fn with_root_cert_pem(mut self, pem_data: Vec<u8>) -> Self {
        self.root_certs.push(pem_data);
        self
    }

    /// Load trust anchors from file.
    pub fn with_root_certs_file(self, path: impl AsRef<Path>) -> io::Result<Self> {
        let pem_data = std::fs::read(path)?;
        Ok(self.with_root_cert_pem(pem_data))
    }

    /// Require accepted peers to present a certificate.
    pub fn require_client_cert(mut self) -> Self {
        self.require_client_cert = true;
        self
    }

    /// Verify this name instead of the dialed host.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Build the authenticator.
    ///
    /// A certificate and key enable the server role (and client auth when
    /// dialing); trust anchors enable the client role.
    pub fn build(self) -> io::Result<TlsAuthenticator> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let identity = match (&self.cert_chain, &self.private_key) {
            (Some(cert_pem), Some(key_pem)) => Some((parse_certs(cert_pem)?, parse_key(key_pem)?)),
            (None, None) => None,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "certificate and private key must be configured together",
                ))
            }
        };

        let roots = if self.root_certs.is_empty() {
            None
        } else {
            let mut store = RootCertStore::empty();
            for pem in &self.root_certs {
                for cert in parse_certs(pem)? {
                    store.add(cert).map_err(invalid_data)?;
                }
            }
            Some(Arc::new(store))
        };

        let server = match &identity {
            Some((certs, key)) => {
                let builder = ServerConfig::builder_with_provider(provider.clone())
                    .with_safe_default_protocol_versions()
                    .map_err(invalid_data)?;
                let builder = if self.require_client_cert {
                    let roots = roots.clone().ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "client certificate verification requires trust anchors",
                        )
                    })?;
                    let verifier = rustls::server::WebPkiClientVerifier::builder_with_provider(
                        roots,
                        provider.clone(),
                    )
                    .build()
                    .map_err(invalid_data)?;
                    builder.with_client_cert_verifier(verifier)
                } else {
                    builder.with_no_client_auth()
                };
                let config = builder
                    .with_single_cert(certs.clone(), key.clone_key())
                    .map_err(invalid_data)?;
                Some(Arc::new(config))
            }
            None => None,
        };

        let client = match roots {
            Some(roots) => {
                let builder = ClientConfig::builder_with_provider(provider)
                    .with_safe_default_protocol_versions()
                    .map_err(invalid_data)?
                    .with_root_certificates(roots);
                let config = match identity {
                    Some((certs, key)) => builder
                        .with_client_auth_cert(certs, key)
                        .map_err(invalid_data)?,
                    None => builder.with_no_client_auth(),
                };
                Some(Arc::new(config))
            }
            None => None,
        };

        Ok(TlsAuthenticator {
            client,
            server,
            server_name: self.server_name,
        })
    }
}

fn parse_certs(pem: &[u8]) -> io::Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(invalid_data)?;
    if certs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "No certificates found in PEM data",
        ));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> io::Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_slice(pem).map_err(invalid_data)
}

fn invalid_data<E: std::error::Error + Send + Sync + 'static>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

// ============================================================================
// Registry
// ============================================================================

/// Authenticators available to a domain, selected per connection by mode.
#[derive(Debug, Clone)]
pub struct SecurityContext {
    plain: Arc<PlainAuthenticator>,
    tls: Option<Arc<TlsAuthenticator>>,
}

impl Default for SecurityContext {
    fn default() -> Self {
        Self::plain()
    }
}

impl SecurityContext {
    /// Only the `none` mode.
    pub fn plain() -> Self {
        Self {
            plain: Arc::new(PlainAuthenticator),
            tls: None,
        }
    }

    pub fn with_tls(mut self, tls: TlsAuthenticator) -> Self {
        self.tls = Some(Arc::new(tls));
        self
    }

    /// Build from optional TLS settings.
    pub fn from_settings(settings: Option<&TlsSettings>) -> io::Result<Self> {
        let ctx = Self::plain();
        match settings {
            Some(settings) => Ok(ctx.with_tls(TlsAuthenticator::from_settings(settings)?)),
            None => Ok(ctx),
        }
    }

    /// Authenticator for `mode`.
    ///
    /// `Err` means the mode cannot be served by this domain at all and
    /// must not be retried.
    pub fn authenticator(&self, mode: SecurityMode) -> Result<Arc<dyn Authenticator>, UnsupportedMode> {
        match mode {
            SecurityMode::None => Ok(self.plain.clone()),
            SecurityMode::Tls => match &self.tls {
                Some(tls) => Ok(tls.clone()),
                None => Err(UnsupportedMode("tls (no TLS material configured)".into())),
            },
        }
    }

    /// Authenticator for dialing out in `mode`.
    ///
    /// TLS needs trust anchors on this side.
    pub fn connector(&self, mode: SecurityMode) -> Result<Arc<dyn Authenticator>, UnsupportedMode> {
        match (mode, &self.tls) {
            (SecurityMode::Tls, Some(tls)) if !tls.can_connect() => Err(UnsupportedMode(
                "tls (no trust anchors configured for outgoing connections)".into(),
            )),
            _ => self.authenticator(mode),
        }
    }

    /// Authenticator for accepted sockets in `mode`.
    ///
    /// TLS needs a certificate chain and private key on this side.
    pub fn acceptor(&self, mode: SecurityMode) -> Result<Arc<dyn Authenticator>, UnsupportedMode> {
        match (mode, &self.tls) {
            (SecurityMode::Tls, Some(tls)) if !tls.can_accept() => Err(UnsupportedMode(
                "tls (no certificate configured for incoming connections)".into(),
            )),
            _ => self.authenticator(mode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn self_signed() -> (Vec<u8>, Vec<u8>) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        (cert.pem().into_bytes(), key_pair.serialize_pem().into_bytes())
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!("none".parse::<SecurityMode>().unwrap(), SecurityMode::None);
        assert_eq!("TLS".parse::<SecurityMode>().unwrap(), SecurityMode::Tls);
        assert_eq!(
            "kerberos".parse::<SecurityMode>(),
            Err(UnsupportedMode("kerberos".into()))
        );
        assert_eq!(SecurityMode::Tls.to_string(), "tls");
    }

    #[test]
    fn test_context_without_tls_rejects_tls() {
        let ctx = SecurityContext::plain();
        assert!(ctx.authenticator(SecurityMode::None).is_ok());
        assert!(ctx.authenticator(SecurityMode::Tls).is_err());
    }

    #[test]
    fn test_context_checks_tls_direction() {
        let (cert, key) = self_signed();
        let server_only = TlsAuthenticator::builder()
            .with_cert_pem(cert.clone())
            .with_key_pem(key)
            .build()
            .unwrap();
        let ctx = SecurityContext::plain().with_tls(server_only);
        assert!(ctx.acceptor(SecurityMode::Tls).is_ok());
        assert!(ctx.connector(SecurityMode::Tls).is_err());
        assert!(ctx.connector(SecurityMode::None).is_ok());

        let client_only = TlsAuthenticator::builder()
            .with_root_cert_pem(cert)
            .build()
            .unwrap();
        let ctx = SecurityContext::plain().with_tls(client_only);
        assert!(ctx.connector(SecurityMode::Tls).is_ok());
        assert!(ctx.acceptor(SecurityMode::Tls).is_err());
    }

    #[test]
    fn test_builder_requires_cert_and_key_together() {
        let (cert, _) = self_signed();
        assert!(TlsAuthenticator::builder().with_cert_pem(cert).build().is_err());
    }

    #[test]
    fn test_builder_rejects_garbage_pem() {
        let result = TlsAuthenticator::builder()
            .with_root_cert_pem(b"not a certificate".to_vec())
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_tls_roundtrip_over_loopback() {
        let (cert, key) = self_signed();
        let server = TlsAuthenticator::builder()
            .with_cert_pem(cert.clone())
            .with_key_pem(key)
            .build()
            .unwrap();
        let client = TlsAuthenticator::builder()
            .with_root_cert_pem(cert)
            .with_server_name("localhost")
            .build()
            .unwrap();
        assert!(server.can_accept());
        assert!(client.can_connect());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut stream = server.wrap_server(socket).await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.flush().await.unwrap();
        });

        let socket = TcpStream::connect(addr).await.unwrap();
        let mut stream = client.wrap_client(socket, "127.0.0.1").await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();
        let mut echo = [0u8; 5];
        stream.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"hello");
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_tls_untrusted_server_fails() {
        let (cert, key) = self_signed();
        let (other_cert, _) = self_signed();
        let server = TlsAuthenticator::builder()
            .with_cert_pem(cert)
            .with_key_pem(key)
            .build()
            .unwrap();
        let client = TlsAuthenticator::builder()
            .with_root_cert_pem(other_cert)
            .with_server_name("localhost")
            .build()
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            server.wrap_server(socket).await.is_err()
        });

        let socket = TcpStream::connect(addr).await.unwrap();
        assert!(client.wrap_client(socket, "127.0.0.1").await.is_err());
        assert!(accept.await.unwrap());
    }
}
