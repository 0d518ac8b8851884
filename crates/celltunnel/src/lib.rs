// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cell Tunnels
//!
//! Self-healing TCP tunnels carrying cell messages between domains.
//!
//! # Features
//!
//! - **Directory Lookup**: Locate peer domains through a directory cell
//! - **Identity Handshake**: Exchange domain identities before forwarding
//! - **Route Ownership**: One route per peer domain, removed before reconnecting
//! - **Forwarding Policies**: Drop or queue messages while a tunnel is down
//! - **Security Modes**: Plain TCP or TLS (rustls)
//!
//! # Quick Start
//!
//! ```bash
//! # Head domain hosting the directory
//! celltunnel-domain --domain head --listen 0.0.0.0:11000 --directory serve
//!
//! # Satellite reaching the head statically, everything else via the directory
//! celltunnel-domain --domain pool1 --listen 0.0.0.0:11001 \
//!     --peer head=127.0.0.1:11000 --directory lm@head
//! ```
//!
//! # Configuration File
//!
//! ```toml
//! name = "pool1"
//!
//! [listen]
//! address = "0.0.0.0:11001"
//!
//! [directory]
//! query = "lm@head"
//!
//! [[peers]]
//! domain = "head"
//! address = "127.0.0.1:11000"
//!
//! [[peers]]
//! domain = "pool2"
//! policy = "queue"
//! ```

pub mod admin;
pub mod bus;
pub mod codec;
pub mod config;
pub mod connect;
pub mod directory;
pub mod domain;
pub mod envelope;
pub mod error;
pub mod forwarding;
pub mod handshake;
pub mod listener;
pub mod locator;
pub mod routing;
pub mod security;
pub mod shutdown;
pub mod stats;
pub mod tunnel;

pub use admin::{CommandError, CommandRegistry};
pub use bus::{CellMailbox, DeliveryError, MessageBus};
pub use config::{
    ConfigError, DomainConfig, ForwardingPolicy, PeerConfig, PeerTarget, TunnelConfig, TunnelTimeouts,
};
pub use connect::{ConnectionEstablisher, Endpoint};
pub use directory::DirectoryCell;
pub use domain::{Domain, DomainError};
pub use envelope::{CellAddress, Envelope, MessageId};
pub use error::{FailureKind, TunnelError};
pub use handshake::DomainIdentity;
pub use listener::TunnelListener;
pub use locator::DomainLocator;
pub use routing::{Route, RouteKind, RoutingTable, TunnelId};
pub use security::{SecurityContext, SecurityMode, TlsAuthenticator};
pub use shutdown::StopSignal;
pub use stats::{TunnelStats, TunnelStatsSnapshot};
pub use tunnel::{Tunnel, TunnelContext, TunnelHandle, TunnelRegistry, TunnelState};
