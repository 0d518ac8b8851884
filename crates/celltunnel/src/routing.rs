// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Domain routing table and the per-tunnel route manager.
//!
//! The [`RoutingTable`] is created once per domain and handed to every
//! tunnel as an `Arc`. Each tunnel owns a [`RouteManager`] that guarantees
//! the tunnel has at most one route installed at any time and that removal
//! never deletes a route another tunnel has since taken over.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ============================================================================
// Tunnel identity
// ============================================================================

/// Identity of one tunnel object inside a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelId(pub u64);

impl TunnelId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tunnel#{}", self.0)
    }
}

// ============================================================================
// Routes
// ============================================================================

/// Kind of routing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteKind {
    /// Traffic for one named domain.
    Domain,
    /// Traffic for any domain without a `Domain` route.
    Default,
}

impl fmt::Display for RouteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Domain => write!(f, "DOMAIN"),
            Self::Default => write!(f, "DEFAULT"),
        }
    }
}

/// A routing-table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Target domain name (the peer's name for default routes)
    pub domain: String,

    /// Tunnel reaching that domain
    pub tunnel: TunnelId,

    pub kind: RouteKind,
}

impl Route {
    pub fn domain(domain: impl Into<String>, tunnel: TunnelId) -> Self {
        Self {
            domain: domain.into(),
            tunnel,
            kind: RouteKind::Domain,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            RouteKind::Domain => write!(f, "{} -> {} ({})", self.domain, self.tunnel, self.kind),
            RouteKind::Default => write!(f, "* -> {} via {} ({})", self.tunnel, self.domain, self.kind),
        }
    }
}

/// Routing errors. These indicate defects, not transient conditions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("refusing to route local domain '{0}' through a tunnel")]
    LocalDomain(String),

    #[error("invalid route target '{0}'")]
    InvalidDomain(String),
}

// ============================================================================
// Routing table
// ============================================================================

#[derive(Debug, Default)]
struct Entries {
    domains: HashMap<String, Route>,
    default: Option<Route>,
}

/// Process-wide domain routing table.
///
/// One lock protects the whole table, so install and remove are atomic
/// with respect to each other for all domain names.
#[derive(Debug)]
pub struct RoutingTable {
    local_domain: String,
    entries: RwLock<Entries>,
}

impl RoutingTable {
    pub fn new(local_domain: impl Into<String>) -> Self {
        Self {
            local_domain: local_domain.into(),
            entries: RwLock::new(Entries::default()),
        }
    }

    pub fn local_domain(&self) -> &str {
        &self.local_domain
    }

    /// Insert `route`, returning the entry it displaced.
    pub fn install(&self, route: Route) -> Result<Option<Route>, RouteError> {
        if route.domain.is_empty() || route.domain.contains(char::is_whitespace) {
            return Err(RouteError::InvalidDomain(route.domain));
        }
        if route.domain == self.local_domain {
            return Err(RouteError::LocalDomain(route.domain));
        }

        let mut entries = self.entries.write();
        let previous = match route.kind {
            RouteKind::Domain => entries.domains.insert(route.domain.clone(), route),
            RouteKind::Default => entries.default.replace(route),
        };
        Ok(previous)
    }

    /// Remove `route` only if it is still the installed entry.
    pub fn remove(&self, route: &Route) -> bool {
        let mut entries = self.entries.write();
        match route.kind {
            RouteKind::Domain => match entries.domains.get(&route.domain) {
                Some(current) if current.tunnel == route.tunnel => {
                    entries.domains.remove(&route.domain);
                    true
                }
                _ => false,
            },
            RouteKind::Default => match &entries.default {
                Some(current) if current.tunnel == route.tunnel => {
                    entries.default = None;
                    true
                }
                _ => false,
            },
        }
    }

    /// Tunnel carrying traffic for `domain`, falling back to the default route.
    pub fn lookup(&self, domain: &str) -> Option<TunnelId> {
        let entries = self.entries.read();
        entries
            .domains
            .get(domain)
            .or(entries.default.as_ref())
            .map(|r| r.tunnel)
    }

    /// Exact `Domain` entry for `domain`.
    pub fn get(&self, domain: &str) -> Option<Route> {
        self.entries.read().domains.get(domain).cloned()
    }

    /// All entries, domain routes sorted by name, default last.
    pub fn routes(&self) -> Vec<Route> {
        let entries = self.entries.read();
        let mut routes: Vec<Route> = entries.domains.values().cloned().collect();
        routes.sort_by(|a, b| a.domain.cmp(&b.domain));
        routes.extend(entries.default.clone());
        routes
    }

    /// Number of domain routes owned by `tunnel` (default route excluded).
    pub fn count_for(&self, tunnel: TunnelId) -> usize {
        self.entries
            .read()
            .domains
            .values()
            .filter(|r| r.tunnel == tunnel)
            .count()
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read();
        entries.domains.len() + usize::from(entries.default.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Route manager
// ============================================================================

/// Installs and removes the routes of one tunnel.
#[derive(Debug)]
pub struct RouteManager {
    table: Arc<RoutingTable>,
    tunnel: TunnelId,
    default_route: bool,
    installed: Mutex<Vec<Route>>,
}

impl RouteManager {
    pub fn new(table: Arc<RoutingTable>, tunnel: TunnelId) -> Self {
        Self {
            table,
            tunnel,
            default_route: false,
            installed: Mutex::new(Vec::new()),
        }
    }

    /// Also install the default route whenever a domain route is installed.
    pub fn with_default_route(mut self, enabled: bool) -> Self {
        self.default_route = enabled;
        self
    }

    pub fn tunnel(&self) -> TunnelId {
        self.tunnel
    }

    /// Route `domain` through this tunnel.
    ///
    /// Any route this tunnel installed before is removed first, so the
    /// tunnel never owns two entries.
    pub fn install(&self, domain: &str) -> Result<Route, RouteError> {
        let mut installed = self.installed.lock();
        for route in installed.drain(..) {
            self.table.remove(&route);
        }

        let route = Route::domain(domain, self.tunnel);
        if let Some(previous) = self.table.install(route.clone())? {
            if previous.tunnel != self.tunnel {
                tracing::warn!(
                    domain = %domain,
                    previous = %previous.tunnel,
                    tunnel = %self.tunnel,
                    "Replacing route owned by another tunnel"
                );
            }
        }
        installed.push(route.clone());

        if self.default_route {
            let default = Route {
                domain: domain.to_string(),
                tunnel: self.tunnel,
                kind: RouteKind::Default,
            };
            self.table.install(default.clone())?;
            installed.push(default);
        }

        tracing::debug!(route = %route, "Route installed");
        Ok(route)
    }

    /// Remove whatever this tunnel installed. Idempotent.
    pub fn remove(&self) -> Option<Route> {
        let mut installed = self.installed.lock();
        let mut removed_domain = None;
        for route in installed.drain(..) {
            if self.table.remove(&route) {
                tracing::debug!(route = %route, "Route removed");
            }
            if route.kind == RouteKind::Domain {
                removed_domain = Some(route);
            }
        }
        removed_domain
    }

    /// Domain route currently held by this tunnel.
    pub fn current(&self) -> Option<Route> {
        self.installed
            .lock()
            .iter()
            .find(|r| r.kind == RouteKind::Domain)
            .cloned()
    }
}

impl Drop for RouteManager {
    fn drop(&mut self) {
        for route in self.installed.get_mut().drain(..) {
            self.table.remove(&route);
        }
    }
}
