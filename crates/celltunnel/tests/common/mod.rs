// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared helpers for the loopback integration tests.

#![allow(dead_code)]

use celltunnel::config::{DirectoryEntryConfig, ListenConfig};
use celltunnel::{CellMailbox, DomainConfig, Envelope, PeerConfig, TunnelTimeouts};
use std::time::{Duration, Instant};

/// Generous upper bound for anything that should converge on loopback.
pub const CONVERGE: Duration = Duration::from_secs(10);

/// A loopback port that was free a moment ago.
pub fn reserve_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Domain configuration with short deadlines.
pub fn domain(name: &str) -> DomainConfig {
    let mut config = DomainConfig::new(name);
    config.timeouts = TunnelTimeouts::fast();
    config
}

pub fn listening(mut config: DomainConfig, address: &str) -> DomainConfig {
    config.listen = Some(ListenConfig {
        address: address.to_string(),
        security: "none".into(),
        advertise: None,
    });
    config
}

pub fn static_peer(domain: &str, address: &str) -> PeerConfig {
    let mut peer = PeerConfig::new(domain);
    peer.address = Some(address.to_string());
    peer
}

pub fn seeded_entry(domain: &str, address: &str) -> DirectoryEntryConfig {
    DirectoryEntryConfig {
        domain: domain.to_string(),
        address: address.to_string(),
        security: None,
    }
}

/// Poll `condition` every 10ms until it holds or `limit` elapses.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn recv(mailbox: &mut CellMailbox, limit: Duration) -> Option<Envelope> {
    tokio::time::timeout(limit, mailbox.recv()).await.ok().flatten()
}
