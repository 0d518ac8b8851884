// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test/bench code readability over pedantic
#![allow(clippy::missing_panics_doc)] // Tests/examples panic on failure

//! TLS security mode over loopback
//!
//! A throwaway self-signed certificate for `localhost` is minted per test
//! and trusted by both domains.

mod common;

use celltunnel::config::TlsSettings;
use celltunnel::{CellAddress, Domain, DomainConfig, Envelope, PeerConfig};
use common::*;
use std::path::Path;

fn tls_material(dir: &Path) -> TlsSettings {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.join("domain.crt");
    let key_path = dir.join("domain.key");
    std::fs::write(&cert_path, certified.cert.pem()).unwrap();
    std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

    TlsSettings {
        cert_chain: Some(cert_path.clone()),
        private_key: Some(key_path),
        ca_certs: Some(cert_path),
        require_client_auth: false,
        server_name: Some("localhost".to_string()),
    }
}

fn tls_listener(name: &str, tls: &TlsSettings) -> DomainConfig {
    let mut config = listening(domain(name), "127.0.0.1:0");
    if let Some(listen) = config.listen.as_mut() {
        listen.security = "tls".into();
    }
    config.tls = Some(tls.clone());
    config
}

#[tokio::test]
async fn test_tls_tunnel_forwards_messages() {
    let dir = tempfile::tempdir().unwrap();
    let tls = tls_material(dir.path());

    let node_b = Domain::start(tls_listener("nodeB", &tls)).await.unwrap();
    let mut cell_x = node_b.bus().register_cell("cellX").unwrap();

    let mut a = domain("nodeA");
    a.tls = Some(tls.clone());
    let mut peer = static_peer("nodeB", &node_b.listen_addr().unwrap().to_string());
    peer.security = "tls".into();
    a.peers.push(peer);
    let node_a = Domain::start(a).await.unwrap();

    let to_b = node_a.tunnels().find("to-nodeB").unwrap();
    assert!(to_b.wait_forwarding(CONVERGE).await, "{}", to_b.status());

    node_a
        .bus()
        .deliver(Envelope::text(
            CellAddress::local("client"),
            CellAddress::new("cellX", "nodeB"),
            "over tls",
        ))
        .await
        .unwrap();
    let got = recv(&mut cell_x, CONVERGE).await.unwrap();
    assert_eq!(got.payload_text(), Some("over tls"));

    node_a.shutdown().await;
    node_b.shutdown().await;
}

#[tokio::test]
async fn test_directory_security_token_selects_tls() {
    let dir = tempfile::tempdir().unwrap();
    let tls = tls_material(dir.path());

    let node_b = Domain::start(tls_listener("nodeB", &tls)).await.unwrap();
    let address = node_b.listen_addr().unwrap().to_string();

    // Peer configured as plain; the directory entry says tls
    let mut a = domain("nodeA");
    a.tls = Some(tls.clone());
    a.directory.serve = true;
    let mut entry = seeded_entry("nodeB", &address);
    entry.security = Some("tls".into());
    a.directory.entries.push(entry);
    a.peers.push(PeerConfig::new("nodeB"));
    let node_a = Domain::start(a).await.unwrap();

    let to_b = node_a.tunnels().find("to-nodeB").unwrap();
    assert!(to_b.wait_forwarding(CONVERGE).await, "{}", to_b.status());
    assert_eq!(to_b.peer_domain().as_deref(), Some("nodeB"));

    node_a.shutdown().await;
    node_b.shutdown().await;
}

#[tokio::test]
async fn test_plain_peer_never_reaches_tls_listener() {
    let dir = tempfile::tempdir().unwrap();
    let tls = tls_material(dir.path());

    let node_b = Domain::start(tls_listener("nodeB", &tls)).await.unwrap();

    let mut a = domain("nodeA");
    a.peers.push(static_peer("nodeB", &node_b.listen_addr().unwrap().to_string()));
    let node_a = Domain::start(a).await.unwrap();

    let to_b = node_a.tunnels().find("to-nodeB").unwrap();
    assert!(wait_until(CONVERGE, || to_b.stats().retries >= 2).await);
    assert_eq!(to_b.stats().handshakes, 0);
    assert!(node_a.bus().routes().is_empty());
    assert!(node_b.bus().routes().is_empty());

    node_a.shutdown().await;
    node_b.shutdown().await;
}
