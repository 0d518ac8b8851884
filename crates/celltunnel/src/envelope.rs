// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cell addresses and the routed message unit.
//!
//! An [`Envelope`] is opaque to tunnels except for the addressing fields
//! (`source`, `destination`), the correlation fields (`message_id`,
//! `reply_to`) and the loop-avoidance fields (`ttl`, `trail`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default hop budget for a freshly created envelope.
pub const DEFAULT_TTL: u8 = 16;

// ============================================================================
// Cell address
// ============================================================================

/// Logical address of a cell: `cell` or `cell@domain`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellAddress {
    /// Cell name inside its domain
    pub cell: String,

    /// Owning domain (`None` = the local domain)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

impl CellAddress {
    /// Address of a cell in the local domain.
    pub fn local(cell: impl Into<String>) -> Self {
        Self {
            cell: cell.into(),
            domain: None,
        }
    }

    /// Fully qualified address.
    pub fn new(cell: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            cell: cell.into(),
            domain: Some(domain.into()),
        }
    }

    /// Whether this address resolves to `local_domain`.
    pub fn is_local_to(&self, local_domain: &str) -> bool {
        match &self.domain {
            None => true,
            Some(d) => d == local_domain,
        }
    }

    /// Qualify an unqualified address with `domain`.
    pub fn qualified(mut self, domain: &str) -> Self {
        if self.domain.is_none() {
            self.domain = Some(domain.to_string());
        }
        self
    }
}

impl fmt::Display for CellAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.domain {
            Some(d) => write!(f, "{}@{}", self.cell, d),
            None => write!(f, "{}", self.cell),
        }
    }
}

/// Error parsing a `cell@domain` string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid cell address '{0}'")]
pub struct AddressParseError(pub String);

impl FromStr for CellAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.split_once('@') {
            Some((cell, domain)) => {
                if cell.is_empty() || domain.is_empty() || domain.contains('@') {
                    return Err(AddressParseError(s.to_string()));
                }
                Ok(Self::new(cell, domain))
            }
            None if !s.is_empty() && !s.contains(char::is_whitespace) => Ok(Self::local(s)),
            None => Err(AddressParseError(s.to_string())),
        }
    }
}

// ============================================================================
// Message id
// ============================================================================

/// Process-unique message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Allocate the next id.
    ///
    /// The counter is seeded from wall-clock time so ids from a restarted
    /// process do not collide with replies still in flight for the old one.
    pub fn next() -> Self {
        static COUNTER: OnceLock<AtomicU64> = OnceLock::new();
        let counter = COUNTER.get_or_init(|| {
            let seed = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(1);
            AtomicU64::new(seed)
        });
        Self(counter.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// A routed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending cell
    pub source: CellAddress,

    /// Receiving cell
    pub destination: CellAddress,

    /// Unique id of this message
    pub message_id: MessageId,

    /// Id of the request this envelope answers, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,

    /// Remaining tunnel hops
    #[serde(default = "default_ttl")]
    pub ttl: u8,

    /// Domains this envelope has left through a tunnel
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trail: Vec<String>,

    /// Opaque application payload
    pub payload: Vec<u8>,
}

fn default_ttl() -> u8 {
    DEFAULT_TTL
}

impl Envelope {
    /// Create a new envelope with a fresh message id.
    pub fn new(source: CellAddress, destination: CellAddress, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            source,
            destination,
            message_id: MessageId::next(),
            reply_to: None,
            ttl: DEFAULT_TTL,
            trail: Vec::new(),
            payload: payload.into(),
        }
    }

    /// Create a text message.
    pub fn text(source: CellAddress, destination: CellAddress, text: &str) -> Self {
        Self::new(source, destination, text.as_bytes().to_vec())
    }

    /// Payload as UTF-8 text, if it is valid UTF-8.
    pub fn payload_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Build the reply to this envelope, addressed back to its source.
    pub fn reply(&self, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            source: self.destination.clone(),
            destination: self.source.clone(),
            message_id: MessageId::next(),
            reply_to: Some(self.message_id),
            ttl: DEFAULT_TTL,
            trail: Vec::new(),
            payload: payload.into(),
        }
    }

    /// Whether this envelope already passed through `domain`.
    pub fn has_visited(&self, domain: &str) -> bool {
        self.trail.iter().any(|d| d == domain)
    }

    /// Account for leaving `domain` through a tunnel.
    ///
    /// Returns `false` when the hop budget is exhausted.
    pub fn mark_hop(&mut self, domain: &str) -> bool {
        if self.ttl == 0 {
            return false;
        }
        self.ttl -= 1;
        self.trail.push(domain.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_qualified_address() {
        let addr: CellAddress = "cellX@nodeB".parse().unwrap();
        assert_eq!(addr.cell, "cellX");
        assert_eq!(addr.domain.as_deref(), Some("nodeB"));
        assert_eq!(addr.to_string(), "cellX@nodeB");
    }

    #[test]
    fn test_parse_local_address() {
        let addr: CellAddress = "lm".parse().unwrap();
        assert_eq!(addr, CellAddress::local("lm"));
        assert!(addr.is_local_to("anything"));
    }

    #[test]
    fn test_parse_invalid_address() {
        assert!("".parse::<CellAddress>().is_err());
        assert!("@nodeB".parse::<CellAddress>().is_err());
        assert!("cell@".parse::<CellAddress>().is_err());
        assert!("a@b@c".parse::<CellAddress>().is_err());
        assert!("two words".parse::<CellAddress>().is_err());
    }

    #[test]
    fn test_message_ids_unique() {
        let a = MessageId::next();
        let b = MessageId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_reply_swaps_addresses() {
        let req = Envelope::text(
            CellAddress::new("locator", "nodeA"),
            CellAddress::new("lm", "nodeA"),
            "where is nodeB",
        );
        let reply = req.reply(b"location nodeB none".to_vec());
        assert_eq!(reply.destination, req.source);
        assert_eq!(reply.source, req.destination);
        assert_eq!(reply.reply_to, Some(req.message_id));
        assert_eq!(reply.payload_text(), Some("location nodeB none"));
    }

    #[test]
    fn test_mark_hop_exhausts_ttl() {
        let mut env = Envelope::text(CellAddress::local("a"), CellAddress::new("b", "x"), "hi");
        env.ttl = 1;
        assert!(env.mark_hop("nodeA"));
        assert!(env.has_visited("nodeA"));
        assert!(!env.mark_hop("nodeB"));
        assert_eq!(env.trail, vec!["nodeA".to_string()]);
    }

    #[test]
    fn test_qualified_keeps_existing_domain() {
        let addr = CellAddress::new("x", "nodeB").qualified("nodeA");
        assert_eq!(addr.domain.as_deref(), Some("nodeB"));
        let addr = CellAddress::local("x").qualified("nodeA");
        assert_eq!(addr.domain.as_deref(), Some("nodeA"));
    }
}
