// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tunnel listener (passive side).
//!
//! Accepts peer connections and spawns one passive tunnel per socket.
//! Optionally keeps the domain registered with a directory cell.

use crate::bus::{DeliveryError, MessageBus};
use crate::config::TunnelConfig;
use crate::connect::Endpoint;
use crate::directory::DirectoryRequest;
use crate::envelope::{CellAddress, Envelope};
use crate::security::SecurityMode;
use crate::shutdown::StopSignal;
use crate::tunnel::{Tunnel, TunnelContext, TunnelRegistry};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Source cell name used for directory announcements.
pub const ANNOUNCER_CELL: &str = "announcer";

/// Refresh period of a successful announcement.
const REANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);

/// Pause after a failed accept.
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Accepts tunnel connections from peer domains.
#[derive(Debug)]
pub struct TunnelListener {
    local_addr: SocketAddr,
    security: SecurityMode,
    stop: StopSignal,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl TunnelListener {
    /// Bind `addr` and start accepting.
    pub async fn bind(
        addr: &str,
        config: TunnelConfig,
        ctx: TunnelContext,
        registry: Arc<TunnelRegistry>,
    ) -> io::Result<Self> {
        // Every accepted socket would fail the same way
        ctx.establisher
            .security()
            .acceptor(config.security)
            .map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("listener cannot serve security mode {}", e.0),
                )
            })?;

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let security = config.security;
        info!("Tunnel listener on {} (security={})", local_addr, security);

        let stop = StopSignal::new();
        let accept_stop = stop.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((socket, peer_addr)) => {
                                debug!("New tunnel connection from {}", peer_addr);
                                let handle = Tunnel::spawn_passive(
                                    format!("from-{}", peer_addr),
                                    socket,
                                    config.clone(),
                                    ctx.clone(),
                                );
                                registry.prune();
                                registry.insert(Arc::new(handle));
                            }
                            Err(e) => {
                                error!("Accept error: {}", e);
                                if !accept_stop.sleep(ACCEPT_ERROR_DELAY).await {
                                    break;
                                }
                            }
                        }
                    }
                    _ = accept_stop.stopped() => {
                        debug!("Tunnel listener shutting down");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            security,
            stop,
            tasks: tokio::sync::Mutex::new(vec![task]),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn security(&self) -> SecurityMode {
        self.security
    }

    /// Keep `advertise` registered with `directory`.
    ///
    /// Retries every `retry` until the directory answers `ok`, then
    /// refreshes periodically until the listener stops.
    pub async fn announce(
        &self,
        bus: Arc<MessageBus>,
        directory: CellAddress,
        advertise: Endpoint,
        query_timeout: Duration,
        retry: Duration,
    ) {
        let request = DirectoryRequest::ListeningOn {
            domain: bus.local_domain().to_string(),
            endpoint: advertise,
            security: Some(self.security.to_string()),
        }
        .to_string();
        let stop = self.stop.clone();

        let task = tokio::spawn(async move {
            let mut announced = false;
            loop {
                let delay = match stop
                    .guard(announce_once(&bus, &directory, &request, query_timeout))
                    .await
                {
                    None => break,
                    Some(Ok(())) => {
                        if !announced {
                            info!("Registered with directory {}: {}", directory, request);
                            announced = true;
                        }
                        REANNOUNCE_INTERVAL
                    }
                    Some(Err(e)) => {
                        if announced {
                            warn!("Directory {} refresh failed: {}", directory, e);
                        } else {
                            debug!("Directory {} not reachable yet: {}", directory, e);
                        }
                        retry
                    }
                };
                if !stop.sleep(delay).await {
                    break;
                }
            }
        });
        self.tasks.lock().await.push(task);
    }

    /// Stop accepting and announcing. Existing tunnels keep running.
    pub async fn stop(&self) {
        self.stop.stop();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }
    }
}

async fn announce_once(
    bus: &MessageBus,
    directory: &CellAddress,
    request: &str,
    timeout: Duration,
) -> Result<(), String> {
    let envelope = Envelope::text(bus.address_of(ANNOUNCER_CELL), directory.clone(), request);
    let reply = bus
        .request(envelope, timeout)
        .await
        .map_err(|e: DeliveryError| e.to_string())?;
    match reply.payload_text() {
        Some("ok") => Ok(()),
        Some(other) => Err(other.to_string()),
        None => Err("non-text reply".to_string()),
    }
}
