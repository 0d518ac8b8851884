// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Domain and tunnel configuration.
//!
//! Supports both programmatic and TOML file configuration:
//!
//! ```toml
//! name = "nodeA"
//!
//! [listen]
//! address = "0.0.0.0:11000"
//! security = "none"
//!
//! [directory]
//! serve = true
//!
//! [[directory.entries]]
//! domain = "nodeB"
//! address = "10.0.0.5:11000"
//!
//! [[peers]]
//! domain = "nodeB"
//! policy = "drop"
//! ```

use crate::codec::FRAME_SIZE_LIMIT;
use crate::connect::Endpoint;
use crate::envelope::CellAddress;
use crate::handshake::is_valid_domain_name;
use crate::security::SecurityMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default directory cell name.
pub const DEFAULT_DIRECTORY_CELL: &str = "lm";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Forwarding policy
// ============================================================================

/// What the outbound path does while the tunnel is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardingPolicy {
    /// Drop and count messages submitted while down (at-most-once).
    #[default]
    Drop,

    /// Queue without bound and replay in order after the next handshake.
    Queue,
}

impl std::fmt::Display for ForwardingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Drop => write!(f, "drop"),
            Self::Queue => write!(f, "queue"),
        }
    }
}

// ============================================================================
// Timeouts
// ============================================================================

/// Per-state deadlines and retry pacing (milliseconds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelTimeouts {
    /// Wait for one directory reply
    #[serde(default = "default_locate_query_ms")]
    pub locate_query_ms: u64,

    /// Pause between unanswered directory queries
    #[serde(default = "default_locate_retry_ms")]
    pub locate_retry_ms: u64,

    /// Upper bound on the whole LOCATING state
    #[serde(default = "default_locating_ms")]
    pub locating_ms: u64,

    /// TCP connect plus security negotiation
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,

    /// Identity exchange
    #[serde(default = "default_handshake_ms")]
    pub handshake_ms: u64,

    /// One outbound envelope write
    #[serde(default = "default_write_ms")]
    pub write_ms: u64,

    /// Minimum pause after a failed cycle
    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,

    /// Target duration of one reconnect cycle
    #[serde(default = "default_reconnect_cycle_ms")]
    pub reconnect_cycle_ms: u64,
}

fn default_locate_query_ms() -> u64 {
    5_000
}

fn default_locate_retry_ms() -> u64 {
    10_000
}

fn default_locating_ms() -> u64 {
    60_000
}

fn default_connect_ms() -> u64 {
    10_000
}

fn default_handshake_ms() -> u64 {
    10_000
}

fn default_write_ms() -> u64 {
    10_000
}

fn default_min_backoff_ms() -> u64 {
    2_000
}

fn default_reconnect_cycle_ms() -> u64 {
    20_000
}

impl Default for TunnelTimeouts {
    fn default() -> Self {
        Self {
            locate_query_ms: default_locate_query_ms(),
            locate_retry_ms: default_locate_retry_ms(),
            locating_ms: default_locating_ms(),
            connect_ms: default_connect_ms(),
            handshake_ms: default_handshake_ms(),
            write_ms: default_write_ms(),
            min_backoff_ms: default_min_backoff_ms(),
            reconnect_cycle_ms: default_reconnect_cycle_ms(),
        }
    }
}

impl TunnelTimeouts {
    /// Short deadlines for tests and loopback setups.
    pub fn fast() -> Self {
        Self {
            locate_query_ms: 500,
            locate_retry_ms: 50,
            locating_ms: 5_000,
            connect_ms: 1_000,
            handshake_ms: 1_000,
            write_ms: 1_000,
            min_backoff_ms: 20,
            reconnect_cycle_ms: 100,
        }
    }

    pub fn locate_query(&self) -> Duration {
        Duration::from_millis(self.locate_query_ms)
    }

    pub fn locate_retry(&self) -> Duration {
        Duration::from_millis(self.locate_retry_ms)
    }

    pub fn locating(&self) -> Duration {
        Duration::from_millis(self.locating_ms)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }

    pub fn write(&self) -> Duration {
        Duration::from_millis(self.write_ms)
    }

    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    pub fn reconnect_cycle(&self) -> Duration {
        Duration::from_millis(self.reconnect_cycle_ms)
    }

    /// Validate the timeouts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("locate_query_ms", self.locate_query_ms),
            ("locating_ms", self.locating_ms),
            ("connect_ms", self.connect_ms),
            ("handshake_ms", self.handshake_ms),
            ("write_ms", self.write_ms),
            ("min_backoff_ms", self.min_backoff_ms),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} cannot be 0", name)));
            }
        }
        Ok(())
    }
}

// ============================================================================
// TLS material
// ============================================================================

/// PEM files for the `tls` security mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Certificate chain presented by this domain
    #[serde(default)]
    pub cert_chain: Option<PathBuf>,

    /// Private key matching `cert_chain`
    #[serde(default)]
    pub private_key: Option<PathBuf>,

    /// Trust anchors for peer certificates
    #[serde(default)]
    pub ca_certs: Option<PathBuf>,

    /// Require accepted peers to present a certificate signed by `ca_certs`
    #[serde(default)]
    pub require_client_auth: bool,

    /// Name to verify on the server certificate instead of the dialed host
    #[serde(default)]
    pub server_name: Option<String>,
}

// ============================================================================
// Tunnel configuration
// ============================================================================

/// How an active tunnel finds its peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerTarget {
    /// Fixed `host:port`; LOCATING is skipped.
    Static { address: String },

    /// Ask a directory cell (`cell` or `cell@domain`).
    Directory { cell: String },
}

/// Runtime configuration of one tunnel.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Domain this tunnel connects to (active side only)
    pub remote_domain: Option<String>,

    /// Where to find the peer (active side only)
    pub target: Option<PeerTarget>,

    /// Security mode used when no directory token overrides it
    pub security: SecurityMode,

    /// Outbound behaviour while down
    pub policy: ForwardingPolicy,

    /// Deadlines and backoff
    pub timeouts: TunnelTimeouts,

    /// Largest accepted record
    pub max_frame_size: usize,

    /// TCP keepalive idle time (None disables)
    pub keepalive: Option<Duration>,

    /// Also route domains without their own route through this tunnel
    pub default_route: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            remote_domain: None,
            target: None,
            security: SecurityMode::None,
            policy: ForwardingPolicy::Drop,
            timeouts: TunnelTimeouts::default(),
            max_frame_size: crate::codec::DEFAULT_MAX_FRAME_SIZE,
            keepalive: Some(Duration::from_secs(default_keepalive_secs())),
            default_route: false,
        }
    }
}

impl TunnelConfig {
    /// Active tunnel to `domain` located through `directory_cell`.
    pub fn via_directory(domain: impl Into<String>, directory_cell: impl Into<String>) -> Self {
        Self {
            remote_domain: Some(domain.into()),
            target: Some(PeerTarget::Directory {
                cell: directory_cell.into(),
            }),
            ..Default::default()
        }
    }

    /// Active tunnel to `domain` at a fixed address.
    pub fn to_address(domain: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            remote_domain: Some(domain.into()),
            target: Some(PeerTarget::Static {
                address: address.into(),
            }),
            ..Default::default()
        }
    }

    /// Passive tunnel for an accepted connection.
    pub fn passive() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, policy: ForwardingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_security(mut self, security: SecurityMode) -> Self {
        self.security = security;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TunnelTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

// ============================================================================
// Domain configuration (file format)
// ============================================================================

/// Listener settings for accepting peer domains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Bind address, e.g. `0.0.0.0:11000`
    pub address: String,

    /// Security mode required from connecting peers
    #[serde(default = "default_security")]
    pub security: String,

    /// Address advertised to the directory (defaults to the bound address)
    #[serde(default)]
    pub advertise: Option<String>,
}

/// Directory settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Host a directory cell in this domain
    #[serde(default)]
    pub serve: bool,

    /// Name of the hosted directory cell
    #[serde(default = "default_directory_cell")]
    pub cell: String,

    /// Directory queried by active tunnels (`cell` or `cell@domain`)
    #[serde(default = "default_directory_cell")]
    pub query: String,

    /// Announce our listener to `query` on startup
    #[serde(default = "default_true")]
    pub announce: bool,

    /// Entries seeded into the hosted directory
    #[serde(default)]
    pub entries: Vec<DirectoryEntryConfig>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            serve: false,
            cell: default_directory_cell(),
            query: default_directory_cell(),
            announce: true,
            entries: Vec::new(),
        }
    }
}

/// A pre-seeded directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntryConfig {
    pub domain: String,
    pub address: String,
    #[serde(default)]
    pub security: Option<String>,
}

/// One configured peer domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Remote domain name
    pub domain: String,

    /// Fixed address (skips the directory)
    #[serde(default)]
    pub address: Option<String>,

    /// Directory to query instead of the domain default
    #[serde(default)]
    pub directory: Option<String>,

    /// Security mode when the directory does not name one
    #[serde(default = "default_security")]
    pub security: String,

    /// Outbound behaviour while down
    #[serde(default)]
    pub policy: ForwardingPolicy,

    /// Use this peer as the default route
    #[serde(default)]
    pub default_route: bool,
}

impl PeerConfig {
    /// Peer located through the domain's directory.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            address: None,
            directory: None,
            security: default_security(),
            policy: ForwardingPolicy::Drop,
            default_route: false,
        }
    }
}

/// Configuration of one domain process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Domain name
    pub name: String,

    /// Accept peers on this address
    #[serde(default)]
    pub listen: Option<ListenConfig>,

    /// Directory hosting and lookup
    #[serde(default)]
    pub directory: DirectoryConfig,

    /// Active tunnels
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Deadlines shared by all tunnels
    #[serde(default)]
    pub timeouts: TunnelTimeouts,

    /// TLS material for the `tls` security mode
    #[serde(default)]
    pub tls: Option<TlsSettings>,

    /// Largest accepted record (bytes)
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// TCP keepalive idle time in seconds (0 disables)
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_security() -> String {
    "none".to_string()
}

fn default_directory_cell() -> String {
    DEFAULT_DIRECTORY_CELL.to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_frame_size() -> usize {
    crate::codec::DEFAULT_MAX_FRAME_SIZE
}

fn default_keepalive_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DomainConfig {
    /// Minimal configuration for a named domain.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            listen: None,
            directory: DirectoryConfig::default(),
            peers: Vec::new(),
            timeouts: TunnelTimeouts::default(),
            tls: None,
            max_frame_size: default_max_frame_size(),
            keepalive_secs: default_keepalive_secs(),
            log_level: default_log_level(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// TCP keepalive as a duration.
    pub fn keepalive(&self) -> Option<Duration> {
        (self.keepalive_secs > 0).then(|| Duration::from_secs(self.keepalive_secs))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_domain_name(&self.name) {
            return Err(ConfigError::Invalid(format!(
                "invalid domain name '{}'",
                self.name
            )));
        }
        self.timeouts.validate()?;
        if self.max_frame_size < 1024 {
            return Err(ConfigError::Invalid("max_frame_size below 1024".into()));
        }
        if self.max_frame_size > FRAME_SIZE_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "max_frame_size above {}",
                FRAME_SIZE_LIMIT
            )));
        }
        parse_cell(&self.directory.query, "directory.query")?;

        // Directions in which `tls` is used
        let mut tls_connect = false;
        let mut tls_accept = false;

        if let Some(listen) = &self.listen {
            let mode = parse_mode(&listen.security)?;
            tls_accept |= mode == SecurityMode::Tls;
            if listen.address.is_empty() {
                return Err(ConfigError::Invalid("listen.address is empty".into()));
            }
            if let Some(advertise) = &listen.advertise {
                parse_endpoint(advertise, "listen.advertise")?;
            }
        }

        for entry in &self.directory.entries {
            if !is_valid_domain_name(&entry.domain) {
                return Err(ConfigError::Invalid(format!(
                    "directory entry has invalid domain '{}'",
                    entry.domain
                )));
            }
            parse_endpoint(&entry.address, "directory entry address")?;
            if let Some(token) = &entry.security {
                parse_mode(token)?;
            }
        }

        let mut seen = std::collections::HashSet::new();
        let mut default_routes = 0;
        for peer in &self.peers {
            if !is_valid_domain_name(&peer.domain) {
                return Err(ConfigError::Invalid(format!(
                    "peer has invalid domain '{}'",
                    peer.domain
                )));
            }
            if peer.domain == self.name {
                return Err(ConfigError::Invalid(format!(
                    "domain '{}' cannot peer with itself",
                    peer.domain
                )));
            }
            if !seen.insert(peer.domain.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "peer '{}' configured twice",
                    peer.domain
                )));
            }
            if peer.default_route {
                default_routes += 1;
            }
            match (&peer.address, &peer.directory) {
                (Some(_), Some(_)) => {
                    return Err(ConfigError::Invalid(format!(
                        "peer '{}' has both address and directory",
                        peer.domain
                    )));
                }
                (Some(address), None) => {
                    parse_endpoint(address, &format!("peer '{}' address", peer.domain))?;
                }
                (None, Some(cell)) => {
                    parse_cell(cell, &format!("peer '{}' directory", peer.domain))?;
                }
                (None, None) => {}
            }
            let mode = parse_mode(&peer.security)?;
            tls_connect |= mode == SecurityMode::Tls;
        }

        if default_routes > 1 {
            return Err(ConfigError::Invalid(
                "at most one peer can be the default route".into(),
            ));
        }

        if tls_connect || tls_accept {
            let tls = self.tls.as_ref().ok_or_else(|| {
                ConfigError::Invalid("security mode 'tls' requires a [tls] section".into())
            })?;
            if tls_connect && tls.ca_certs.is_none() {
                return Err(ConfigError::Invalid(
                    "tls peers require tls.ca_certs".into(),
                ));
            }
            if tls_accept && (tls.cert_chain.is_none() || tls.private_key.is_none()) {
                return Err(ConfigError::Invalid(
                    "a tls listener requires tls.cert_chain and tls.private_key".into(),
                ));
            }
        }

        Ok(())
    }

    /// Tunnel configuration for a configured peer.
    pub fn tunnel_config(&self, peer: &PeerConfig) -> Result<TunnelConfig, ConfigError> {
        let target = match (&peer.address, &peer.directory) {
            (Some(address), _) => PeerTarget::Static {
                address: address.clone(),
            },
            (None, Some(cell)) => PeerTarget::Directory { cell: cell.clone() },
            (None, None) => PeerTarget::Directory {
                cell: self.directory.query.clone(),
            },
        };

        Ok(TunnelConfig {
            remote_domain: Some(peer.domain.clone()),
            target: Some(target),
            security: parse_mode(&peer.security)?,
            policy: peer.policy,
            timeouts: self.timeouts.clone(),
            max_frame_size: self.max_frame_size,
            keepalive: self.keepalive(),
            default_route: peer.default_route,
        })
    }

    /// Tunnel configuration for connections accepted by the listener.
    pub fn passive_tunnel_config(&self) -> Result<TunnelConfig, ConfigError> {
        let security = match &self.listen {
            Some(listen) => parse_mode(&listen.security)?,
            None => SecurityMode::None,
        };
        Ok(TunnelConfig {
            security,
            timeouts: self.timeouts.clone(),
            max_frame_size: self.max_frame_size,
            keepalive: self.keepalive(),
            ..TunnelConfig::passive()
        })
    }
}

fn parse_mode(token: &str) -> Result<SecurityMode, ConfigError> {
    token
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("unsupported security mode '{}'", token)))
}

fn parse_endpoint(value: &str, what: &str) -> Result<Endpoint, ConfigError> {
    value
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("{}: {}", what, e)))
}

fn parse_cell(value: &str, what: &str) -> Result<CellAddress, ConfigError> {
    value
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("{}: {}", what, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let t = TunnelTimeouts::default();
        assert_eq!(t.locate_query(), Duration::from_secs(5));
        assert_eq!(t.locate_retry(), Duration::from_secs(10));
        assert!(t.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let t = TunnelTimeouts {
            handshake_ms: 0,
            ..Default::default()
        };
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_domain_config_from_toml() {
        let toml_str = r#"
            name = "nodeA"

            [listen]
            address = "127.0.0.1:11000"

            [directory]
            serve = true

            [[directory.entries]]
            domain = "nodeB"
            address = "10.0.0.5:11000"

            [[peers]]
            domain = "nodeB"
            policy = "queue"

            [[peers]]
            domain = "head"
            address = "10.0.0.1:11000"

            [timeouts]
            min_backoff_ms = 500
        "#;

        let config: DomainConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.timeouts.min_backoff_ms, 500);
        assert_eq!(config.timeouts.handshake_ms, 10_000);

        let nodeb = config.tunnel_config(&config.peers[0]).unwrap();
        assert_eq!(nodeb.policy, ForwardingPolicy::Queue);
        assert_eq!(
            nodeb.target,
            Some(PeerTarget::Directory {
                cell: "lm".to_string()
            })
        );

        let head = config.tunnel_config(&config.peers[1]).unwrap();
        assert_eq!(
            head.target,
            Some(PeerTarget::Static {
                address: "10.0.0.1:11000".to_string()
            })
        );
    }

    #[test]
    fn test_unsupported_security_rejected() {
        let mut config = DomainConfig::new("nodeA");
        let mut peer = PeerConfig::new("nodeB");
        peer.security = "kerberos".into();
        config.peers.push(peer);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("kerberos"));
    }

    #[test]
    fn test_tls_requires_settings() {
        let mut config = DomainConfig::new("nodeA");
        let mut peer = PeerConfig::new("nodeB");
        peer.security = "tls".into();
        config.peers.push(peer);
        assert!(config.validate().is_err());

        config.tls = Some(TlsSettings::default());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ca_certs"), "{}", err);

        config.tls = Some(TlsSettings {
            ca_certs: Some(PathBuf::from("/etc/celltunnel/ca.crt")),
            ..TlsSettings::default()
        });
        assert!(config.validate().is_ok());

        // Accepting tls needs our own certificate
        config.listen = Some(ListenConfig {
            address: "127.0.0.1:0".into(),
            security: "tls".into(),
            advertise: None,
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cert_chain"), "{}", err);
    }

    #[test]
    fn test_unparsable_addresses_rejected() {
        let mut config = DomainConfig::new("nodeA");
        let mut peer = PeerConfig::new("nodeB");
        peer.address = Some("nowhere".into());
        config.peers.push(peer);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("peer 'nodeB' address"), "{}", err);

        config.peers[0].address = Some("127.0.0.1:11000".into());
        config.validate().unwrap();

        config.directory.entries.push(DirectoryEntryConfig {
            domain: "nodeC".into(),
            address: "no-port".into(),
            security: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_frame_size_bounds() {
        let mut config = DomainConfig::new("nodeA");
        config.max_frame_size = 512;
        assert!(config.validate().is_err());
        config.max_frame_size = FRAME_SIZE_LIMIT;
        config.validate().unwrap();
        if let Some(too_large) = FRAME_SIZE_LIMIT.checked_add(1) {
            config.max_frame_size = too_large;
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_self_peer_and_duplicates_rejected() {
        let mut config = DomainConfig::new("nodeA");
        config.peers.push(PeerConfig::new("nodeA"));
        assert!(config.validate().is_err());

        let mut config = DomainConfig::new("nodeA");
        config.peers.push(PeerConfig::new("nodeB"));
        config.peers.push(PeerConfig::new("nodeB"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("domain.toml");

        let mut config = DomainConfig::new("nodeA");
        config.peers.push(PeerConfig::new("nodeB"));
        config.to_file(&path).unwrap();

        let loaded = DomainConfig::from_file(&path).unwrap();
        assert_eq!(loaded.name, "nodeA");
        assert_eq!(loaded.peers, config.peers);
    }

    #[test]
    fn test_single_default_route() {
        let mut config = DomainConfig::new("nodeA");
        for name in ["head", "backup"] {
            let mut peer = PeerConfig::new(name);
            peer.default_route = true;
            config.peers.push(peer);
        }
        assert!(config.validate().is_err());

        config.peers[1].default_route = false;
        config.validate().unwrap();
        assert!(config.tunnel_config(&config.peers[0]).unwrap().default_route);
    }

    #[test]
    fn test_keepalive_zero_disables() {
        let mut config = DomainConfig::new("nodeA");
        config.keepalive_secs = 0;
        assert!(config.keepalive().is_none());
    }
}
