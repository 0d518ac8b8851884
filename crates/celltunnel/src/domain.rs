// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Domain process wiring.
//!
//! A [`Domain`] owns the routing table, the message bus, an optional
//! directory cell, the listener and one active tunnel per configured peer.

use crate::admin::{register_domain_commands, CommandError, CommandRegistry};
use crate::bus::{DeliveryError, MessageBus};
use crate::config::{ConfigError, DomainConfig, PeerConfig};
use crate::connect::{ConnectionEstablisher, Endpoint};
use crate::directory::{DirectoryCell, DirectoryEntry};
use crate::envelope::CellAddress;
use crate::error::TunnelError;
use crate::handshake::DomainIdentity;
use crate::listener::TunnelListener;
use crate::routing::RoutingTable;
use crate::security::SecurityContext;
use crate::shutdown::StopSignal;
use crate::tunnel::{Tunnel, TunnelContext, TunnelHandle, TunnelRegistry};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Domain startup errors.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("tunnel: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("cell registration: {0}")]
    Cell(#[from] DeliveryError),

    #[error("admin: {0}")]
    Command(#[from] CommandError),
}

/// A running domain.
#[derive(Debug)]
pub struct Domain {
    config: DomainConfig,
    ctx: TunnelContext,
    tunnels: Arc<TunnelRegistry>,
    commands: CommandRegistry,
    directory: Option<Arc<DirectoryCell>>,
    listener: Option<TunnelListener>,
    stop: StopSignal,
    tasks: Vec<JoinHandle<()>>,
}

impl Domain {
    /// Validate `config` and start every configured component.
    ///
    /// On error, whatever was already started is stopped again.
    pub async fn start(config: DomainConfig) -> Result<Self, DomainError> {
        config.validate()?;
        Self::start_validated(config).await
    }

    async fn start_validated(config: DomainConfig) -> Result<Self, DomainError> {
        info!("Starting domain {}", config.name);

        let routes = Arc::new(RoutingTable::new(config.name.clone()));
        let bus = Arc::new(MessageBus::new(DomainIdentity::new(config.name.clone()), routes));
        let security = SecurityContext::from_settings(config.tls.as_ref())?;
        let ctx = TunnelContext::new(
            bus,
            ConnectionEstablisher::new(security, config.keepalive()),
        );

        let mut domain = Self {
            config,
            ctx,
            tunnels: Arc::new(TunnelRegistry::new()),
            commands: CommandRegistry::new(),
            directory: None,
            listener: None,
            stop: StopSignal::new(),
            tasks: Vec::new(),
        };
        if let Err(e) = domain.launch().await {
            warn!("Domain {} failed to start: {}", domain.name(), e);
            domain.shutdown().await;
            return Err(e);
        }

        info!(
            "Domain {} started ({} peers, listener={})",
            domain.name(),
            domain.config.peers.len(),
            domain
                .listen_addr()
                .map_or_else(|| "none".to_string(), |a| a.to_string())
        );
        Ok(domain)
    }

    async fn launch(&mut self) -> Result<(), DomainError> {
        let config = self.config.clone();
        let bus = self.ctx.bus.clone();

        // Directory first so the local listener can announce to it.
        if config.directory.serve {
            let cell = Arc::new(DirectoryCell::new());
            for entry in &config.directory.entries {
                let endpoint = entry
                    .address
                    .parse::<Endpoint>()
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?;
                cell.register(
                    entry.domain.clone(),
                    DirectoryEntry {
                        endpoint,
                        security: entry.security.clone(),
                    },
                );
            }
            self.tasks
                .push(cell.clone().spawn(&config.directory.cell, bus.clone(), self.stop.clone())?);
            info!(
                "Directory cell '{}' serving {} seeded entries",
                config.directory.cell,
                cell.len()
            );
            self.directory = Some(cell);
        }

        if let Some(listen) = &config.listen {
            let listener = TunnelListener::bind(
                &listen.address,
                config.passive_tunnel_config()?,
                self.ctx.clone(),
                self.tunnels.clone(),
            )
            .await?;
            let local_addr = listener.local_addr();
            let listener = self.listener.insert(listener);

            if config.directory.announce {
                let advertise = match &listen.advertise {
                    Some(address) => address
                        .parse::<Endpoint>()
                        .map_err(|e| ConfigError::Invalid(e.to_string()))?,
                    None => advertised_endpoint(local_addr),
                };
                let query = config
                    .directory
                    .query
                    .parse::<CellAddress>()
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?;
                listener
                    .announce(
                        bus.clone(),
                        query,
                        advertise,
                        config.timeouts.locate_query(),
                        config.timeouts.locate_retry(),
                    )
                    .await;
            }
        }

        register_domain_commands(&self.commands, bus, self.tunnels.clone())?;
        if let Some(cell) = &self.directory {
            let cell = cell.clone();
            self.commands.register("ls directory", "ls directory", "entries of the hosted directory", move |args| {
                if !args.is_empty() {
                    return Err(CommandError::Usage("ls directory".into()));
                }
                Ok(cell.handle("ls"))
            })?;
        }

        for peer in &config.peers {
            self.add_peer(peer)?;
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.ctx.bus
    }

    pub fn tunnels(&self) -> &Arc<TunnelRegistry> {
        &self.tunnels
    }

    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    pub fn directory(&self) -> Option<&Arc<DirectoryCell>> {
        self.directory.as_ref()
    }

    /// Address the listener is bound to.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(TunnelListener::local_addr)
    }

    /// Start an active tunnel to `peer`.
    pub fn add_peer(&mut self, peer: &PeerConfig) -> Result<Arc<TunnelHandle>, DomainError> {
        let config = self.config.tunnel_config(peer)?;
        let handle = Arc::new(Tunnel::spawn_active(
            format!("to-{}", peer.domain),
            config,
            self.ctx.clone(),
        )?);
        self.tunnels.insert(handle.clone());
        Ok(handle)
    }

    /// Run one admin command. Errors are rendered as text.
    pub fn execute(&self, line: &str) -> String {
        match self.commands.execute(line) {
            Ok(out) => out,
            Err(e) => format!("error: {}", e),
        }
    }

    /// Stop the listener, every tunnel and the hosted cells.
    pub async fn shutdown(self) {
        info!("Shutting down domain {}", self.config.name);
        if let Some(listener) = &self.listener {
            listener.stop().await;
        }
        self.tunnels.stop_all().await;
        self.stop.stop();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Endpoint announced for a listener bound to `addr`.
fn advertised_endpoint(addr: SocketAddr) -> Endpoint {
    if addr.ip().is_unspecified() {
        warn!(
            "Listener bound to {}; advertising loopback (set listen.advertise for remote peers)",
            addr
        );
        return Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST).to_string(), addr.port());
    }
    Endpoint::from(addr)
}
