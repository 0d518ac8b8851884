// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tunnel lifecycle state machine.
//!
//! Active tunnels cycle until stopped:
//!
//! ```text
//! INIT -> LOCATING -> CONNECTING -> HANDSHAKING -> FORWARDING -> FAILED
//!            ^                                                    |
//!            +------------ remove route, close, backoff ----------+
//! ```
//!
//! Passive tunnels (accepted connections) start at HANDSHAKING and go to
//! CLOSING after their first failure; the peer reconnects if it was the
//! active side.
//!
//! Each tunnel runs on one task that fuses the lifecycle with the inbound
//! loop. Every blocking step is bounded by its state timeout and raced
//! against the stop signal.

use crate::bus::MessageBus;
use crate::codec::FrameCodec;
use crate::config::{PeerTarget, TunnelConfig};
use crate::connect::{ConnectionEstablisher, Endpoint};
use crate::envelope::CellAddress;
use crate::error::{FailureKind, TunnelError};
use crate::forwarding::{run_inbound, Outbound};
use crate::handshake::{self, DomainIdentity, CAP_POLICY, CAP_SECURITY};
use crate::locator::DomainLocator;
use crate::routing::{RouteManager, TunnelId};
use crate::security::{BoxedStream, SecurityMode};
use crate::shutdown::StopSignal;
use crate::stats::{TunnelStats, TunnelStatsSnapshot};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// Grace period for a clean shutdown of the write half.
const CLOSE_GRACE: Duration = Duration::from_millis(200);

// ============================================================================
// State
// ============================================================================

/// Lifecycle state of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelState {
    Init,
    Locating,
    Connecting,
    Handshaking,
    Forwarding,
    Failed,
    Closing,
}

impl TunnelState {
    /// Whether messages can currently flow.
    pub fn is_forwarding(&self) -> bool {
        matches!(self, Self::Forwarding)
    }

    /// Whether the tunnel has terminated.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closing)
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::Locating => "LOCATING",
            Self::Connecting => "CONNECTING",
            Self::Handshaking => "HANDSHAKING",
            Self::Forwarding => "FORWARDING",
            Self::Failed => "FAILED",
            Self::Closing => "CLOSING",
        };
        f.write_str(s)
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelRole {
    /// Locates and dials the peer, retries forever.
    Active,
    /// Adopted an accepted socket, terminal after one session.
    Passive,
}

/// How the tunnel task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelExit {
    /// Stop signal raised.
    Stopped,
    /// Passive session ended.
    Closed(String),
    /// Non-retryable failure.
    Fatal(String),
}

/// Pause after a failed cycle.
///
/// Rapid failures wait at least `min_backoff`; a cycle that already took
/// `target_cycle` or longer waits only `min_backoff`.
pub fn backoff_delay(min_backoff: Duration, target_cycle: Duration, elapsed: Duration) -> Duration {
    min_backoff.max(target_cycle.saturating_sub(elapsed))
}

// ============================================================================
// Shared state
// ============================================================================

#[derive(Debug)]
struct TunnelShared {
    id: TunnelId,
    name: String,
    role: TunnelRole,
    remote_domain: Option<String>,
    state: Mutex<TunnelState>,
    peer: Mutex<Option<DomainIdentity>>,
    last_error: Mutex<Option<String>>,
    stats: Arc<TunnelStats>,
    outbound: Arc<Outbound>,
    stop: StopSignal,
}

impl TunnelShared {
    fn set_state(&self, next: TunnelState) {
        let mut state = self.state.lock();
        if *state != next {
            tracing::debug!(tunnel = %self.name, from = %*state, to = %next, "State change");
            *state = next;
        }
    }

    fn state(&self) -> TunnelState {
        *self.state.lock()
    }
}

/// Services a tunnel needs from its domain.
#[derive(Debug, Clone)]
pub struct TunnelContext {
    pub bus: Arc<MessageBus>,
    pub establisher: ConnectionEstablisher,
}

impl TunnelContext {
    pub fn new(bus: Arc<MessageBus>, establisher: ConnectionEstablisher) -> Self {
        Self { bus, establisher }
    }
}

// ============================================================================
// Tunnel
// ============================================================================

/// How an active tunnel reaches its peer.
#[derive(Debug)]
enum Target {
    Static(Endpoint),
    Directory(DomainLocator),
}

/// Tunnel driver, owned by the tunnel task.
pub struct Tunnel {
    shared: Arc<TunnelShared>,
    config: TunnelConfig,
    bus: Arc<MessageBus>,
    establisher: ConnectionEstablisher,
    routes: RouteManager,
    codec: FrameCodec,
    target: Option<Target>,
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("role", &self.shared.role)
            .finish()
    }
}

impl Tunnel {
    fn new(
        name: String,
        role: TunnelRole,
        config: TunnelConfig,
        ctx: TunnelContext,
        target: Option<Target>,
    ) -> Self {
        let id = TunnelId::next();
        let stats = Arc::new(TunnelStats::new());
        let codec = FrameCodec::new(config.max_frame_size);
        let outbound = Arc::new(Outbound::new(
            id,
            ctx.bus.local_domain(),
            config.policy,
            codec,
            config.timeouts.write(),
            stats.clone(),
        ));
        let routes = RouteManager::new(ctx.bus.routes().clone(), id)
            .with_default_route(config.default_route);

        let shared = Arc::new(TunnelShared {
            id,
            name,
            role,
            remote_domain: config.remote_domain.clone(),
            state: Mutex::new(TunnelState::Init),
            peer: Mutex::new(None),
            last_error: Mutex::new(None),
            stats,
            outbound,
            stop: StopSignal::new(),
        });

        Self {
            shared,
            config,
            bus: ctx.bus,
            establisher: ctx.establisher,
            routes,
            codec,
            target,
        }
    }

    /// Start an active tunnel.
    ///
    /// Configuration errors (missing target, unusable security mode,
    /// peering with ourselves) are returned here and never retried.
    pub fn spawn_active(
        name: impl Into<String>,
        config: TunnelConfig,
        ctx: TunnelContext,
    ) -> Result<TunnelHandle, TunnelError> {
        let remote = config
            .remote_domain
            .clone()
            .ok_or_else(|| TunnelError::Config("active tunnel needs a remote domain".into()))?;
        if !handshake::is_valid_domain_name(&remote) {
            return Err(TunnelError::Config(format!("invalid remote domain '{}'", remote)));
        }
        if remote == ctx.bus.local_domain() {
            return Err(TunnelError::Config(format!(
                "domain '{}' cannot tunnel to itself",
                remote
            )));
        }
        ctx.establisher
            .security()
            .connector(config.security)
            .map_err(|e| TunnelError::UnsupportedSecurity(e.0))?;

        let target = match &config.target {
            Some(PeerTarget::Static { address }) => Target::Static(
                address
                    .parse::<Endpoint>()
                    .map_err(|e| TunnelError::Config(e.to_string()))?,
            ),
            Some(PeerTarget::Directory { cell }) => {
                let directory = cell
                    .parse::<CellAddress>()
                    .map_err(|e| TunnelError::Config(e.to_string()))?;
                Target::Directory(DomainLocator::new(
                    ctx.bus.clone(),
                    directory,
                    config.timeouts.locate_query(),
                    config.timeouts.locate_retry(),
                ))
            }
            None => return Err(TunnelError::Config("active tunnel needs a target".into())),
        };

        let tunnel = Self::new(name.into(), TunnelRole::Active, config, ctx, Some(target));
        tunnel.bus.attach_tunnel(
            tunnel.shared.id,
            tunnel.shared.outbound.clone(),
            Some(remote),
        );

        let shared = tunnel.shared.clone();
        let task = tokio::spawn(tunnel.run_active());
        Ok(TunnelHandle::new(shared, task))
    }

    /// Start a passive tunnel on an accepted socket.
    pub fn spawn_passive(
        name: impl Into<String>,
        socket: TcpStream,
        config: TunnelConfig,
        ctx: TunnelContext,
    ) -> TunnelHandle {
        let tunnel = Self::new(name.into(), TunnelRole::Passive, config, ctx, None);
        tunnel
            .bus
            .attach_tunnel(tunnel.shared.id, tunnel.shared.outbound.clone(), None);

        let shared = tunnel.shared.clone();
        let task = tokio::spawn(tunnel.run_passive(socket));
        TunnelHandle::new(shared, task)
    }

    // ------------------------------------------------------------------------
    // Drivers
    // ------------------------------------------------------------------------

    async fn run_active(mut self) -> TunnelExit {
        let shared = self.shared.clone();
        tracing::info!(tunnel = %shared.name, peer = ?shared.remote_domain, "Tunnel started");

        let exit = loop {
            let cycle_start = Instant::now();
            let result = self.active_cycle().await;
            self.teardown().await;

            let err = match result {
                Ok(()) => continue,
                Err(err) => err,
            };
            if matches!(err, TunnelError::Stopped) {
                break TunnelExit::Stopped;
            }

            shared.set_state(TunnelState::Failed);
            *shared.last_error.lock() = Some(err.to_string());

            if !err.is_retryable() {
                tracing::error!(tunnel = %shared.name, kind = %err.kind(), "Tunnel failed permanently: {}", err);
                break TunnelExit::Fatal(err.to_string());
            }
            self.log_failure(&err);

            shared.stats.record_retry();
            let delay = backoff_delay(
                self.config.timeouts.min_backoff(),
                self.config.timeouts.reconnect_cycle(),
                cycle_start.elapsed(),
            );
            tracing::debug!(tunnel = %shared.name, delay = ?delay, "Backing off");
            if !shared.stop.sleep(delay).await {
                break TunnelExit::Stopped;
            }
        };

        self.finish(exit)
    }

    async fn run_passive(mut self, socket: TcpStream) -> TunnelExit {
        let shared = self.shared.clone();
        let peer_addr = socket
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        tracing::info!(tunnel = %shared.name, from = %peer_addr, "Accepted tunnel connection");

        let result = self.passive_session(socket).await;
        self.teardown().await;

        let exit = match result {
            Err(TunnelError::Stopped) => TunnelExit::Stopped,
            Err(err) => {
                shared.set_state(TunnelState::Failed);
                *shared.last_error.lock() = Some(err.to_string());
                if err.is_retryable() {
                    self.log_failure(&err);
                    TunnelExit::Closed(err.to_string())
                } else {
                    tracing::error!(tunnel = %shared.name, kind = %err.kind(), "Tunnel failed permanently: {}", err);
                    TunnelExit::Fatal(err.to_string())
                }
            }
            Ok(()) => TunnelExit::Closed("session ended".into()),
        };

        self.finish(exit)
    }

    fn finish(self, exit: TunnelExit) -> TunnelExit {
        self.shared.set_state(TunnelState::Closing);
        self.bus.detach_tunnel(self.shared.id);
        self.routes.remove();
        tracing::info!(tunnel = %self.shared.name, exit = ?exit, "Tunnel closed");
        exit
    }

    // ------------------------------------------------------------------------
    // Cycles
    // ------------------------------------------------------------------------

    async fn active_cycle(&mut self) -> Result<(), TunnelError> {
        let shared = self.shared.clone();
        let remote = shared.remote_domain.clone().unwrap_or_default();
        let timeouts = self.config.timeouts.clone();

        let (endpoint, mode) = match &self.target {
            Some(Target::Static(endpoint)) => (endpoint.clone(), self.config.security),
            Some(Target::Directory(locator)) => {
                shared.set_state(TunnelState::Locating);
                let resolved = self
                    .guarded(TunnelState::Locating, timeouts.locating(), locator.locate(&remote, &shared.stop))
                    .await?;
                (resolved.endpoint, resolved.security.unwrap_or(self.config.security))
            }
            None => return Err(TunnelError::Config("active tunnel without target".into())),
        };

        shared.set_state(TunnelState::Connecting);
        shared.stats.record_connect_attempt();
        tracing::debug!(tunnel = %shared.name, endpoint = %endpoint, mode = %mode, "Connecting");
        let stream = self
            .guarded(
                TunnelState::Connecting,
                timeouts.connect(),
                self.establisher.connect(&endpoint, mode),
            )
            .await?;

        self.session(stream, mode, Some(&remote)).await
    }

    async fn passive_session(&mut self, socket: TcpStream) -> Result<(), TunnelError> {
        let mode = self.config.security;
        self.shared.set_state(TunnelState::Handshaking);
        let stream = self
            .guarded(
                TunnelState::Handshaking,
                self.config.timeouts.handshake(),
                self.establisher.accept(socket, mode),
            )
            .await?;
        self.session(stream, mode, None).await
    }

    /// Handshake, install the route and forward until the session breaks.
    async fn session(
        &mut self,
        mut stream: BoxedStream,
        mode: SecurityMode,
        expected: Option<&str>,
    ) -> Result<(), TunnelError> {
        let shared = self.shared.clone();
        shared.set_state(TunnelState::Handshaking);

        let local = self
            .bus
            .local_identity()
            .with_capability(CAP_SECURITY, mode.as_str())
            .with_capability(CAP_POLICY, self.config.policy.to_string());
        let codec = self.codec;
        let peer = self
            .guarded(TunnelState::Handshaking, self.config.timeouts.handshake(), async {
                let peer = match expected {
                    Some(expected) => {
                        handshake::exchange_with(&mut stream, &codec, &local, expected).await?
                    }
                    None => handshake::exchange(&mut stream, &codec, &local).await?,
                };
                Ok(peer)
            })
            .await?;

        shared.stats.record_handshake();
        *shared.peer.lock() = Some(peer.clone());
        // Writer first: anything routed to us from here on can be written.
        let (mut reader, writer) = tokio::io::split(stream);
        shared.outbound.attach(writer).await;
        self.routes.install(&peer.domain)?;
        shared.set_state(TunnelState::Forwarding);
        tracing::info!(tunnel = %shared.name, peer = %peer.domain, mode = %mode, "Tunnel established");

        let inbound = run_inbound(&mut reader, &codec, &self.bus, shared.id, &shared.stats);
        tokio::pin!(inbound);
        let err = loop {
            tokio::select! {
                biased;
                _ = shared.stop.stopped() => break TunnelError::Stopped,
                err = &mut inbound => break err,
                _ = shared.outbound.broken() => {
                    // A permit left over from an earlier session is ignored.
                    if !shared.outbound.is_usable() {
                        break TunnelError::Forwarding("outbound write failed".into());
                    }
                }
            }
        };
        Err(err)
    }

    /// Remove the route and close the stream. Safe to call repeatedly.
    async fn teardown(&mut self) {
        self.routes.remove();
        if let Some(mut writer) = self.shared.outbound.detach().await {
            let _ = tokio::time::timeout(CLOSE_GRACE, writer.shutdown()).await;
        }
        *self.shared.peer.lock() = None;
    }

    async fn guarded<T, F>(&self, state: TunnelState, limit: Duration, fut: F) -> Result<T, TunnelError>
    where
        F: Future<Output = Result<T, TunnelError>>,
    {
        match self.shared.stop.guard(tokio::time::timeout(limit, fut)).await {
            None => Err(TunnelError::Stopped),
            Some(Err(_)) => Err(TunnelError::Timeout {
                state: state.to_string(),
                after: limit,
            }),
            Some(Ok(result)) => result,
        }
    }

    fn log_failure(&self, err: &TunnelError) {
        let name = &self.shared.name;
        match err.kind() {
            FailureKind::Security => {
                tracing::warn!(
                    tunnel = %name,
                    "Security negotiation failed (check security mode and certificates): {}",
                    err
                );
            }
            kind => {
                tracing::warn!(tunnel = %name, kind = %kind, "Tunnel failure: {}", err);
            }
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Control and observation handle of a running tunnel.
#[derive(Debug)]
pub struct TunnelHandle {
    shared: Arc<TunnelShared>,
    task: tokio::sync::Mutex<Option<JoinHandle<TunnelExit>>>,
    exit: Mutex<Option<TunnelExit>>,
}

impl TunnelHandle {
    fn new(shared: Arc<TunnelShared>, task: JoinHandle<TunnelExit>) -> Self {
        Self {
            shared,
            task: tokio::sync::Mutex::new(Some(task)),
            exit: Mutex::new(None),
        }
    }

    pub fn id(&self) -> TunnelId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn role(&self) -> TunnelRole {
        self.shared.role
    }

    pub fn state(&self) -> TunnelState {
        self.shared.state()
    }

    /// Peer domain once the handshake of the current session completed.
    pub fn peer_domain(&self) -> Option<String> {
        self.shared.peer.lock().as_ref().map(|p| p.domain.clone())
    }

    /// Domain an active tunnel is configured to reach.
    pub fn remote_domain(&self) -> Option<&str> {
        self.shared.remote_domain.as_deref()
    }

    pub fn is_usable(&self) -> bool {
        self.shared.outbound.is_usable()
    }

    pub fn stats(&self) -> TunnelStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    /// Whether the tunnel task has ended.
    pub fn is_finished(&self) -> bool {
        self.shared.state().is_terminal()
    }

    /// One-line status.
    pub fn status(&self) -> String {
        let stats = self.stats();
        format!(
            "{} state={} peer={} to-tunnel={} to-domain={} dropped={} connects={} retries={}",
            self.shared.name,
            self.state(),
            self.peer_domain().unwrap_or_else(|| "unknown".to_string()),
            stats.messages_to_tunnel,
            stats.messages_to_domain,
            stats.messages_dropped,
            stats.connect_attempts,
            stats.retries,
        )
    }

    /// Wait until the tunnel reaches FORWARDING or `limit` elapses.
    pub async fn wait_forwarding(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if self.state().is_forwarding() && self.is_usable() {
                return true;
            }
            if Instant::now() >= deadline || self.is_finished() {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stop the tunnel and wait for its task. Idempotent.
    pub async fn stop(&self) -> TunnelExit {
        self.shared.stop.stop();
        self.join().await
    }

    /// Wait for the tunnel task to end on its own.
    pub async fn join(&self) -> TunnelExit {
        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            let exit = match handle.await {
                Ok(exit) => exit,
                Err(e) => TunnelExit::Fatal(format!("tunnel task failed: {}", e)),
            };
            *self.exit.lock() = Some(exit);
        }
        self.exit
            .lock()
            .clone()
            .unwrap_or(TunnelExit::Stopped)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Tunnels of one domain, active and passive.
#[derive(Debug, Default)]
pub struct TunnelRegistry {
    tunnels: parking_lot::RwLock<Vec<Arc<TunnelHandle>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: Arc<TunnelHandle>) {
        self.tunnels.write().push(handle);
    }

    /// Snapshot of all tunnels in creation order.
    pub fn list(&self) -> Vec<Arc<TunnelHandle>> {
        self.tunnels.read().clone()
    }

    /// Tunnels not currently forwarding.
    pub fn waiting(&self) -> Vec<Arc<TunnelHandle>> {
        self.tunnels
            .read()
            .iter()
            .filter(|t| !t.state().is_forwarding())
            .cloned()
            .collect()
    }

    /// Find a tunnel by name, tunnel id (`tunnel#N`) or peer domain.
    pub fn find(&self, key: &str) -> Option<Arc<TunnelHandle>> {
        let tunnels = self.tunnels.read();
        tunnels
            .iter()
            .find(|t| t.name() == key || t.id().to_string() == key)
            .or_else(|| {
                tunnels
                    .iter()
                    .find(|t| t.peer_domain().as_deref() == Some(key) || t.remote_domain() == Some(key))
            })
            .cloned()
    }

    /// Drop finished passive tunnels. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut tunnels = self.tunnels.write();
        let before = tunnels.len();
        tunnels.retain(|t| !(t.role() == TunnelRole::Passive && t.is_finished()));
        before - tunnels.len()
    }

    /// Domain-wide counters.
    pub fn totals(&self) -> TunnelStatsSnapshot {
        self.tunnels
            .read()
            .iter()
            .fold(TunnelStatsSnapshot::default(), |acc, t| acc.merge(&t.stats()))
    }

    pub fn len(&self) -> usize {
        self.tunnels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every tunnel and empty the registry.
    pub async fn stop_all(&self) {
        let tunnels: Vec<_> = std::mem::take(&mut *self.tunnels.write());
        for tunnel in tunnels {
            tunnel.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ForwardingPolicy, TunnelTimeouts};
    use crate::envelope::Envelope;
    use crate::routing::RoutingTable;
    use crate::security::{SecurityContext, TlsAuthenticator};
    use tokio::net::TcpListener;

    fn context(domain: &str) -> TunnelContext {
        let routes = Arc::new(RoutingTable::new(domain));
        let bus = Arc::new(MessageBus::new(DomainIdentity::new(domain), routes));
        TunnelContext::new(bus, ConnectionEstablisher::new(SecurityContext::plain(), None))
    }

    #[test]
    fn test_backoff_delay() {
        let min = Duration::from_secs(2);
        let cycle = Duration::from_secs(20);
        assert_eq!(backoff_delay(min, cycle, Duration::from_secs(1)), Duration::from_secs(19));
        assert_eq!(backoff_delay(min, cycle, Duration::from_secs(19)), min);
        assert_eq!(backoff_delay(min, cycle, Duration::from_secs(300)), min);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TunnelState::Handshaking.to_string(), "HANDSHAKING");
        assert!(TunnelState::Forwarding.is_forwarding());
        assert!(TunnelState::Closing.is_terminal());
    }

    #[tokio::test]
    async fn test_config_errors_are_reported_at_spawn() {
        let ctx = context("nodeA");

        let err = Tunnel::spawn_active("t", TunnelConfig::passive(), ctx.clone()).unwrap_err();
        assert!(matches!(err, TunnelError::Config(_)));

        let err = Tunnel::spawn_active("t", TunnelConfig::to_address("nodeA", "127.0.0.1:1"), ctx.clone())
            .unwrap_err();
        assert!(matches!(err, TunnelError::Config(_)));

        let err = Tunnel::spawn_active("t", TunnelConfig::to_address("nodeB", "nowhere"), ctx.clone())
            .unwrap_err();
        assert!(matches!(err, TunnelError::Config(_)));

        let config = TunnelConfig::to_address("nodeB", "127.0.0.1:1").with_security(SecurityMode::Tls);
        let err = Tunnel::spawn_active("t", config, ctx).unwrap_err();
        assert!(matches!(err, TunnelError::UnsupportedSecurity(_)));
    }

    #[tokio::test]
    async fn test_tls_without_trust_anchors_is_fatal() {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let server_only = TlsAuthenticator::builder()
            .with_cert_pem(cert.pem().into_bytes())
            .with_key_pem(key_pair.serialize_pem().into_bytes())
            .build()
            .unwrap();
        let routes = Arc::new(RoutingTable::new("nodeA"));
        let bus = Arc::new(MessageBus::new(DomainIdentity::new("nodeA"), routes));
        let ctx = TunnelContext::new(
            bus,
            ConnectionEstablisher::new(SecurityContext::plain().with_tls(server_only), None),
        );

        // A live peer: the failure must come from our side, not the network
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let config = TunnelConfig::to_address("nodeB", addr.to_string())
            .with_security(SecurityMode::Tls)
            .with_timeouts(TunnelTimeouts::fast());
        let err = Tunnel::spawn_active("to-nodeB", config, ctx.clone()).unwrap_err();
        assert!(matches!(err, TunnelError::UnsupportedSecurity(_)));
        assert!(!err.is_retryable());

        // Same answer when a directory token switches the mode at connect time
        let endpoint = Endpoint::from(addr);
        let err = ctx
            .establisher
            .connect(&endpoint, SecurityMode::Tls)
            .await
            .err()
            .expect("expected connect to fail");
        assert!(matches!(err, TunnelError::UnsupportedSecurity(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_route_is_installed_with_a_usable_writer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let ctx_a = context("nodeA");
        let config = TunnelConfig::to_address("nodeB", addr.to_string())
            .with_timeouts(TunnelTimeouts::fast())
            .with_policy(ForwardingPolicy::Drop);
        let active = Tunnel::spawn_active("to-nodeB", config, ctx_a.clone()).unwrap();

        let ctx_b = context("nodeB");
        let (socket, _) = listener.accept().await.unwrap();
        let passive = Tunnel::spawn_passive(
            "from-nodeA",
            socket,
            TunnelConfig::passive().with_timeouts(TunnelTimeouts::fast()),
            ctx_b.clone(),
        );

        // The first moment the route is visible, sends must go out
        let deadline = Instant::now() + Duration::from_secs(2);
        while ctx_a.bus.routes().get("nodeB").is_none() {
            assert!(Instant::now() < deadline, "{}", active.status());
            tokio::task::yield_now().await;
        }
        assert!(active.shared.outbound.is_usable());
        ctx_a
            .bus
            .deliver(Envelope::text(
                CellAddress::local("client"),
                CellAddress::new("cellX", "nodeB"),
                "first",
            ))
            .await
            .unwrap();
        assert_eq!(active.stats().messages_dropped, 0);
        assert_eq!(active.stats().messages_to_tunnel, 1);

        active.stop().await;
        passive.stop().await;
    }

    #[tokio::test]
    async fn test_stop_while_forwarding_clears_both_sides() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let ctx_a = context("nodeA");
        let config = TunnelConfig::to_address("nodeB", addr.to_string())
            .with_timeouts(TunnelTimeouts::fast());
        let active = Tunnel::spawn_active("to-nodeB", config, ctx_a.clone()).unwrap();

        let ctx_b = context("nodeB");
        let (socket, _) = listener.accept().await.unwrap();
        let passive = Tunnel::spawn_passive(
            "from-nodeA",
            socket,
            TunnelConfig::passive().with_timeouts(TunnelTimeouts::fast()),
            ctx_b.clone(),
        );

        assert!(active.wait_forwarding(Duration::from_secs(2)).await, "{}", active.status());
        assert!(passive.wait_forwarding(Duration::from_secs(2)).await, "{}", passive.status());
        assert_eq!(ctx_a.bus.routes().lookup("nodeB"), Some(active.id()));
        assert_eq!(ctx_b.bus.routes().lookup("nodeA"), Some(passive.id()));

        // Both inbound loops are parked in a read
        assert_eq!(active.stop().await, TunnelExit::Stopped);
        assert!(ctx_a.bus.routes().is_empty());
        assert_eq!(active.state(), TunnelState::Closing);

        let exit = tokio::time::timeout(Duration::from_secs(2), passive.join())
            .await
            .unwrap();
        assert!(matches!(exit, TunnelExit::Closed(_)));
        assert!(ctx_b.bus.routes().is_empty());
    }

    #[tokio::test]
    async fn test_refused_connect_retries_then_stops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let ctx = context("nodeA");
        let config = TunnelConfig::to_address("nodeB", addr.to_string())
            .with_timeouts(TunnelTimeouts::fast());
        let handle = Tunnel::spawn_active("to-nodeB", config, ctx.clone()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().retries < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = handle.stats();
        assert!(stats.retries >= 2);
        assert!(stats.connect_attempts >= 2);
        assert!(ctx.bus.routes().is_empty());
        assert!(handle.status().contains("peer=unknown"));

        assert_eq!(handle.stop().await, TunnelExit::Stopped);
        assert_eq!(handle.stop().await, TunnelExit::Stopped);
        assert_eq!(handle.state(), TunnelState::Closing);
    }

    #[tokio::test]
    async fn test_handshake_eof_is_retried_without_route() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Accept and hang up immediately, twice
        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let (socket, _) = listener.accept().await.unwrap();
                drop(socket);
            }
        });

        let ctx = context("nodeA");
        let config = TunnelConfig::to_address("nodeB", addr.to_string())
            .with_timeouts(TunnelTimeouts::fast());
        let handle = Tunnel::spawn_active("to-nodeB", config, ctx.clone()).unwrap();

        server.await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().retries < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(handle.stats().retries >= 2);
        assert_eq!(handle.stats().handshakes, 0);
        assert!(ctx.bus.routes().is_empty());
        assert!(handle.last_error().is_some());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_passive_peer_closing_is_terminal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut socket = TcpStream::connect(addr).await.unwrap();
            let codec = FrameCodec::default();
            let peer = handshake::exchange(&mut socket, &codec, &DomainIdentity::new("nodeB"))
                .await
                .unwrap();
            assert_eq!(peer.domain, "nodeA");
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let ctx = context("nodeA");
        let (socket, _) = listener.accept().await.unwrap();
        let config = TunnelConfig::passive()
            .with_timeouts(TunnelTimeouts::fast())
            .with_policy(ForwardingPolicy::Drop);
        let handle = Tunnel::spawn_passive("from-nodeB", socket, config, ctx.clone());

        assert!(handle.wait_forwarding(Duration::from_secs(2)).await);
        assert_eq!(handle.peer_domain().as_deref(), Some("nodeB"));
        assert_eq!(ctx.bus.routes().lookup("nodeB"), Some(handle.id()));

        client.await.unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(2), handle.join())
            .await
            .unwrap();
        assert!(matches!(exit, TunnelExit::Closed(_)));
        assert!(ctx.bus.routes().is_empty());
        assert_eq!(handle.state(), TunnelState::Closing);
    }
}
