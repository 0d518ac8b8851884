// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-tunnel counters.
//!
//! Counters are monotonic for the lifetime of the tunnel object and survive
//! reconnect cycles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Statistics for one tunnel.
#[derive(Debug)]
pub struct TunnelStats {
    /// Envelopes written to the peer.
    pub messages_to_tunnel: AtomicU64,

    /// Envelopes received from the peer and handed to the local bus.
    pub messages_to_domain: AtomicU64,

    /// Envelopes dropped (tunnel down, ttl exhausted, loop detected).
    pub messages_dropped: AtomicU64,

    /// Inbound envelopes the local bus could not deliver.
    pub delivery_failures: AtomicU64,

    /// TCP connect attempts.
    pub connect_attempts: AtomicU64,

    /// Failed cycles followed by a retry.
    pub retries: AtomicU64,

    /// Completed identity exchanges.
    pub handshakes: AtomicU64,

    /// Tunnel creation time.
    pub created: Instant,
}

impl Default for TunnelStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelStats {
    pub fn new() -> Self {
        Self {
            messages_to_tunnel: AtomicU64::new(0),
            messages_to_domain: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
            connect_attempts: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            handshakes: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    pub fn record_to_tunnel(&self) {
        self.messages_to_tunnel.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_to_domain(&self) {
        self.messages_to_domain.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery_failure(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handshake(&self) {
        self.handshakes.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of current stats.
    pub fn snapshot(&self) -> TunnelStatsSnapshot {
        TunnelStatsSnapshot {
            messages_to_tunnel: self.messages_to_tunnel.load(Ordering::Relaxed),
            messages_to_domain: self.messages_to_domain.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            handshakes: self.handshakes.load(Ordering::Relaxed),
            uptime_secs: self.created.elapsed().as_secs(),
        }
    }
}

/// Snapshot of tunnel statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelStatsSnapshot {
    pub messages_to_tunnel: u64,
    pub messages_to_domain: u64,
    pub messages_dropped: u64,
    pub delivery_failures: u64,
    pub connect_attempts: u64,
    pub retries: u64,
    pub handshakes: u64,
    pub uptime_secs: u64,
}

impl TunnelStatsSnapshot {
    /// Aggregate two snapshots (domain-wide totals).
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            messages_to_tunnel: self.messages_to_tunnel + other.messages_to_tunnel,
            messages_to_domain: self.messages_to_domain + other.messages_to_domain,
            messages_dropped: self.messages_dropped + other.messages_dropped,
            delivery_failures: self.delivery_failures + other.delivery_failures,
            connect_attempts: self.connect_attempts + other.connect_attempts,
            retries: self.retries + other.retries,
            handshakes: self.handshakes + other.handshakes,
            uptime_secs: self.uptime_secs.max(other.uptime_secs),
        }
    }
}
