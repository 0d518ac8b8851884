// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Local message bus of a domain.
//!
//! The bus is the boundary tunnels talk to:
//!
//! - `deliver()`: hand an envelope to a local cell, or to the tunnel that
//!   the routing table names for the destination domain
//! - `local_identity()`: this domain's identity for the handshake
//! - `attach_tunnel()` / `detach_tunnel()`: make a tunnel's outbound path
//!   reachable from routes
//!
//! Cells receive envelopes through a bounded [`CellMailbox`].

use crate::envelope::{CellAddress, Envelope, MessageId};
use crate::forwarding::{Outbound, SendOutcome};
use crate::handshake::DomainIdentity;
use crate::routing::{RoutingTable, TunnelId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Default capacity of a cell mailbox.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 1024;

/// Local delivery errors.
///
/// These never affect tunnel state; the forwarding engine only logs them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("no such cell: {0}")]
    NoSuchCell(String),

    #[error("cell '{0}' is already registered")]
    CellExists(String),

    #[error("mailbox of cell '{0}' is full")]
    MailboxFull(String),

    #[error("no route to domain '{0}'")]
    NoRoute(String),

    #[error("{0} is not attached to the bus")]
    TunnelDetached(TunnelId),

    #[error("dropped by {tunnel}: {reason}")]
    Dropped { tunnel: TunnelId, reason: String },

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("request cancelled")]
    Cancelled,
}

// ============================================================================
// Mailbox
// ============================================================================

/// Receiving end of a registered cell.
#[derive(Debug)]
pub struct CellMailbox {
    address: CellAddress,
    rx: mpsc::Receiver<Envelope>,
}

impl CellMailbox {
    /// Fully qualified address of the cell.
    pub fn address(&self) -> &CellAddress {
        &self.address
    }

    /// Wait for the next envelope. `None` once the cell is unregistered.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

// ============================================================================
// Bus
// ============================================================================

/// Message bus of one domain.
#[derive(Debug)]
pub struct MessageBus {
    identity: DomainIdentity,
    routes: Arc<RoutingTable>,
    cells: RwLock<HashMap<String, mpsc::Sender<Envelope>>>,
    tunnels: RwLock<HashMap<TunnelId, Arc<Outbound>>>,
    standby: RwLock<HashMap<String, TunnelId>>,
    pending: Mutex<HashMap<MessageId, oneshot::Sender<Envelope>>>,
    mailbox_capacity: usize,
}

impl MessageBus {
    /// Create a bus for `identity` using the shared routing table.
    pub fn new(identity: DomainIdentity, routes: Arc<RoutingTable>) -> Self {
        Self {
            identity,
            routes,
            cells: RwLock::new(HashMap::new()),
            tunnels: RwLock::new(HashMap::new()),
            standby: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }

    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity.max(1);
        self
    }

    pub fn local_identity(&self) -> DomainIdentity {
        self.identity.clone()
    }

    pub fn local_domain(&self) -> &str {
        &self.identity.domain
    }

    pub fn routes(&self) -> &Arc<RoutingTable> {
        &self.routes
    }

    /// Qualified address of a local cell.
    pub fn address_of(&self, cell: &str) -> CellAddress {
        CellAddress::new(cell, self.identity.domain.clone())
    }

    // ------------------------------------------------------------------------
    // Cells
    // ------------------------------------------------------------------------

    /// Register a local cell.
    pub fn register_cell(&self, name: &str) -> Result<CellMailbox, DeliveryError> {
        let mut cells = self.cells.write();
        if cells.get(name).is_some_and(|tx| !tx.is_closed()) {
            return Err(DeliveryError::CellExists(name.to_string()));
        }
        let (tx, rx) = mpsc::channel(self.mailbox_capacity);
        cells.insert(name.to_string(), tx);
        Ok(CellMailbox {
            address: self.address_of(name),
            rx,
        })
    }

    pub fn unregister_cell(&self, name: &str) -> bool {
        self.cells.write().remove(name).is_some()
    }

    pub fn cell_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cells.read().keys().cloned().collect();
        names.sort();
        names
    }

    // ------------------------------------------------------------------------
    // Tunnels
    // ------------------------------------------------------------------------

    /// Make `outbound` reachable for routes naming `tunnel`.
    ///
    /// `standby_for` names the domain an active tunnel is configured to
    /// reach. While that domain has no installed route, traffic for it is
    /// still handed to this tunnel so its forwarding policy (drop or queue)
    /// applies.
    pub fn attach_tunnel(&self, tunnel: TunnelId, outbound: Arc<Outbound>, standby_for: Option<String>) {
        self.tunnels.write().insert(tunnel, outbound);
        if let Some(domain) = standby_for {
            self.standby.write().insert(domain, tunnel);
        }
    }

    pub fn detach_tunnel(&self, tunnel: TunnelId) {
        self.tunnels.write().remove(&tunnel);
        self.standby.write().retain(|_, t| *t != tunnel);
    }

    /// Tunnel that traffic for `domain` is handed to.
    ///
    /// An installed domain route wins over a standby tunnel, which wins
    /// over the default route.
    pub fn tunnel_for(&self, domain: &str) -> Option<TunnelId> {
        self.routes
            .get(domain)
            .map(|route| route.tunnel)
            .or_else(|| self.standby.read().get(domain).copied())
            .or_else(|| self.routes.lookup(domain))
    }

    /// Attached tunnel ids.
    pub fn tunnel_ids(&self) -> Vec<TunnelId> {
        let mut ids: Vec<TunnelId> = self.tunnels.read().keys().copied().collect();
        ids.sort();
        ids
    }

    // ------------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------------

    /// Deliver an envelope locally or through the routed tunnel.
    pub async fn deliver(&self, mut envelope: Envelope) -> Result<(), DeliveryError> {
        if envelope.destination.is_local_to(&self.identity.domain) {
            return self.deliver_locally(envelope);
        }

        let domain = match &envelope.destination.domain {
            Some(d) => d.clone(),
            None => return self.deliver_locally(envelope),
        };
        envelope.source = envelope.source.qualified(&self.identity.domain);

        let tunnel = self
            .tunnel_for(&domain)
            .ok_or_else(|| DeliveryError::NoRoute(domain.clone()))?;
        let outbound = self
            .tunnels
            .read()
            .get(&tunnel)
            .cloned()
            .ok_or(DeliveryError::TunnelDetached(tunnel))?;

        match outbound.send(envelope).await {
            SendOutcome::Sent | SendOutcome::Queued => Ok(()),
            SendOutcome::Dropped(reason) => Err(DeliveryError::Dropped {
                tunnel,
                reason: reason.to_string(),
            }),
        }
    }

    /// Deliver to a local cell or a waiting request.
    pub fn deliver_locally(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        if let Some(request_id) = envelope.reply_to {
            if let Some(waiter) = self.pending.lock().remove(&request_id) {
                // The requester may have timed out in between.
                let _ = waiter.send(envelope);
                return Ok(());
            }
        }

        let cell = envelope.destination.cell.clone();
        let tx = self
            .cells
            .read()
            .get(&cell)
            .cloned()
            .ok_or_else(|| DeliveryError::NoSuchCell(envelope.destination.to_string()))?;

        tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::MailboxFull(cell),
            mpsc::error::TrySendError::Closed(_) => DeliveryError::NoSuchCell(cell),
        })
    }

    /// Send a request and wait for the envelope whose `reply_to` matches.
    pub async fn request(
        &self,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, DeliveryError> {
        let id = envelope.message_id;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let result = match self.deliver(envelope).await {
            Ok(()) => match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(_)) => Err(DeliveryError::Cancelled),
                Err(_) => Err(DeliveryError::Timeout(timeout)),
            },
            Err(e) => Err(e),
        };

        self.pending.lock().remove(&id);
        result
    }

    /// Number of requests waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }
}
