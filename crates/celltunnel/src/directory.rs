// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Directory cell and its text protocol.
//!
//! ```text
//! where is <domain>                                  -> location <domain> <host:port> [security=<mode>]
//!                                                    -> location <domain> none
//! listening on <domain> <host:port> [security=<m>]   -> ok
//! forget <domain>                                    -> ok
//! ls                                                 -> one "<domain> <host:port> [security=<m>]" per line
//! ```

use crate::bus::{DeliveryError, MessageBus};
use crate::connect::Endpoint;
use crate::shutdown::StopSignal;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Malformed directory message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed directory message: {0}")]
pub struct ProtocolError(pub String);

// ============================================================================
// Requests
// ============================================================================

/// A parsed directory request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryRequest {
    WhereIs(String),
    ListeningOn {
        domain: String,
        endpoint: Endpoint,
        security: Option<String>,
    },
    Forget(String),
    List,
}

impl DirectoryRequest {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let words: Vec<&str> = text.split_whitespace().collect();
        match words.as_slice() {
            ["where", "is", domain] => Ok(Self::WhereIs(domain.to_string())),
            ["listening", "on", domain, endpoint, rest @ ..] => {
                let endpoint = endpoint
                    .parse::<Endpoint>()
                    .map_err(|e| ProtocolError(e.to_string()))?;
                Ok(Self::ListeningOn {
                    domain: domain.to_string(),
                    endpoint,
                    security: parse_security(rest)?,
                })
            }
            ["forget", domain] => Ok(Self::Forget(domain.to_string())),
            ["ls"] => Ok(Self::List),
            _ => Err(ProtocolError(text.trim().to_string())),
        }
    }
}

impl fmt::Display for DirectoryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WhereIs(domain) => write!(f, "where is {}", domain),
            Self::ListeningOn {
                domain,
                endpoint,
                security,
            } => {
                write!(f, "listening on {} {}", domain, endpoint)?;
                if let Some(mode) = security {
                    write!(f, " security={}", mode)?;
                }
                Ok(())
            }
            Self::Forget(domain) => write!(f, "forget {}", domain),
            Self::List => write!(f, "ls"),
        }
    }
}

fn parse_security(rest: &[&str]) -> Result<Option<String>, ProtocolError> {
    match rest {
        [] => Ok(None),
        [token] => token
            .strip_prefix("security=")
            .filter(|mode| !mode.is_empty())
            .map(|mode| Some(mode.to_string()))
            .ok_or_else(|| ProtocolError(format!("unexpected token '{}'", token))),
        _ => Err(ProtocolError(rest.join(" "))),
    }
}

// ============================================================================
// Location replies
// ============================================================================

/// Where a domain can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Not (yet) registered.
    Unknown,
    /// Registered listener.
    At {
        endpoint: Endpoint,
        /// Raw security token, validated by the caller
        security: Option<String>,
    },
}

/// Reply to `where is <domain>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationReply {
    pub domain: String,
    pub location: Location,
}

impl LocationReply {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let words: Vec<&str> = text.split_whitespace().collect();
        match words.as_slice() {
            ["location", domain, "none"] => Ok(Self {
                domain: domain.to_string(),
                location: Location::Unknown,
            }),
            ["location", domain, endpoint, rest @ ..] => {
                let endpoint = endpoint
                    .parse::<Endpoint>()
                    .map_err(|e| ProtocolError(e.to_string()))?;
                Ok(Self {
                    domain: domain.to_string(),
                    location: Location::At {
                        endpoint,
                        security: parse_security(rest)?,
                    },
                })
            }
            _ => Err(ProtocolError(text.trim().to_string())),
        }
    }
}

impl fmt::Display for LocationReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Location::Unknown => write!(f, "location {} none", self.domain),
            Location::At { endpoint, security } => {
                write!(f, "location {} {}", self.domain, endpoint)?;
                if let Some(mode) = security {
                    write!(f, " security={}", mode)?;
                }
                Ok(())
            }
        }
    }
}

// ============================================================================
// Directory cell
// ============================================================================

/// A registered domain listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub endpoint: Endpoint,
    pub security: Option<String>,
}

impl fmt::Display for DirectoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.endpoint)?;
        if let Some(mode) = &self.security {
            write!(f, " security={}", mode)?;
        }
        Ok(())
    }
}

/// The well-known directory actor.
#[derive(Debug, Default)]
pub struct DirectoryCell {
    entries: RwLock<BTreeMap<String, DirectoryEntry>>,
}

impl DirectoryCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or update a domain.
    pub fn register(&self, domain: impl Into<String>, entry: DirectoryEntry) {
        self.entries.write().insert(domain.into(), entry);
    }

    pub fn forget(&self, domain: &str) -> bool {
        self.entries.write().remove(domain).is_some()
    }

    pub fn lookup(&self, domain: &str) -> Location {
        match self.entries.read().get(domain) {
            Some(entry) => Location::At {
                endpoint: entry.endpoint.clone(),
                security: entry.security.clone(),
            },
            None => Location::Unknown,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Answer one text request.
    pub fn handle(&self, text: &str) -> String {
        let request = match DirectoryRequest::parse(text) {
            Ok(request) => request,
            Err(e) => return format!("error {}", e),
        };

        match request {
            DirectoryRequest::WhereIs(domain) => {
                let location = self.lookup(&domain);
                LocationReply { domain, location }.to_string()
            }
            DirectoryRequest::ListeningOn {
                domain,
                endpoint,
                security,
            } => {
                if let Some(mode) = &security {
                    if mode.parse::<crate::security::SecurityMode>().is_err() {
                        return format!("error unsupported security mode '{}'", mode);
                    }
                }
                tracing::info!(domain = %domain, endpoint = %endpoint, "Domain registered");
                self.register(domain, DirectoryEntry { endpoint, security });
                "ok".to_string()
            }
            DirectoryRequest::Forget(domain) => {
                if self.forget(&domain) {
                    tracing::info!(domain = %domain, "Domain forgotten");
                }
                "ok".to_string()
            }
            DirectoryRequest::List => self
                .entries
                .read()
                .iter()
                .map(|(domain, entry)| format!("{} {}", domain, entry))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Register as cell `name` on `bus` and answer requests until stopped.
    pub fn spawn(
        self: Arc<Self>,
        name: &str,
        bus: Arc<MessageBus>,
        stop: StopSignal,
    ) -> Result<JoinHandle<()>, DeliveryError> {
        let mut mailbox = bus.register_cell(name)?;
        let name = name.to_string();

        Ok(tokio::spawn(async move {
            tracing::debug!(cell = %name, "Directory cell started");
            while let Some(Some(request)) = stop.guard(mailbox.recv()).await {
                let answer = match request.payload_text() {
                    Some(text) => self.handle(text),
                    None => "error payload is not text".to_string(),
                };
                if let Err(e) = bus.deliver(request.reply(answer.into_bytes())).await {
                    tracing::debug!(to = %request.source, error = %e, "Directory reply not delivered");
                }
            }
            bus.unregister_cell(&name);
            tracing::debug!(cell = %name, "Directory cell stopped");
        }))
    }
}
