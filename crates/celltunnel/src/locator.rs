// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Domain locator.
//!
//! Resolves a domain name to an endpoint by asking a directory cell
//! `where is <domain>`. Unanswered queries and `location <domain> none`
//! replies are retried with a fixed delay until an answer arrives or the
//! stop signal is raised; the directory is only eventually consistent.

use crate::bus::MessageBus;
use crate::connect::Endpoint;
use crate::directory::{DirectoryRequest, Location, LocationReply};
use crate::envelope::{CellAddress, Envelope};
use crate::error::TunnelError;
use crate::security::SecurityMode;
use crate::shutdown::StopSignal;
use std::sync::Arc;
use std::time::Duration;

/// Source cell name used for directory queries.
pub const LOCATOR_CELL: &str = "locator";

/// Failed attempts between two warnings.
const WARN_EVERY: u64 = 10;

/// Resolved peer location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub endpoint: Endpoint,
    /// Mode named by the directory, if any
    pub security: Option<SecurityMode>,
}

/// Queries a directory cell for peer endpoints.
#[derive(Debug, Clone)]
pub struct DomainLocator {
    bus: Arc<MessageBus>,
    directory: CellAddress,
    query_timeout: Duration,
    retry_delay: Duration,
}

impl DomainLocator {
    pub fn new(
        bus: Arc<MessageBus>,
        directory: CellAddress,
        query_timeout: Duration,
        retry_delay: Duration,
    ) -> Self {
        Self {
            bus,
            directory,
            query_timeout,
            retry_delay,
        }
    }

    pub fn directory(&self) -> &CellAddress {
        &self.directory
    }

    /// Ask once.
    ///
    /// `Ok(None)` means the directory does not know the domain yet.
    pub async fn query(&self, domain: &str) -> Result<Option<Resolved>, TunnelError> {
        let request = Envelope::text(
            self.bus.address_of(LOCATOR_CELL),
            self.directory.clone(),
            &DirectoryRequest::WhereIs(domain.to_string()).to_string(),
        );

        let reply = self
            .bus
            .request(request, self.query_timeout)
            .await
            .map_err(|e| TunnelError::Resolution {
                domain: domain.to_string(),
                reason: format!("{}: {}", self.directory, e),
            })?;

        let text = reply.payload_text().unwrap_or_default();
        let reply = LocationReply::parse(text).map_err(|e| TunnelError::Resolution {
            domain: domain.to_string(),
            reason: e.to_string(),
        })?;
        if reply.domain != domain {
            return Err(TunnelError::Resolution {
                domain: domain.to_string(),
                reason: format!("directory answered for '{}'", reply.domain),
            });
        }

        match reply.location {
            Location::Unknown => Ok(None),
            Location::At { endpoint, security } => {
                let security = security
                    .map(|token| {
                        token
                            .parse::<SecurityMode>()
                            .map_err(|e| TunnelError::UnsupportedSecurity(e.0))
                    })
                    .transpose()?;
                Ok(Some(Resolved { endpoint, security }))
            }
        }
    }

    /// Ask until the domain is known.
    ///
    /// Only an unsupported security mode or the stop signal end the loop
    /// with an error.
    pub async fn locate(&self, domain: &str, stop: &StopSignal) -> Result<Resolved, TunnelError> {
        let mut attempts: u64 = 0;
        loop {
            attempts += 1;
            let reason = match stop.guard(self.query(domain)).await {
                None => return Err(TunnelError::Stopped),
                Some(Ok(Some(resolved))) => {
                    tracing::debug!(domain = %domain, endpoint = %resolved.endpoint, attempts, "Domain located");
                    return Ok(resolved);
                }
                Some(Ok(None)) => "address not yet known".to_string(),
                Some(Err(e)) if e.is_retryable() => e.to_string(),
                Some(Err(e)) => return Err(e),
            };

            if attempts == 1 || attempts % WARN_EVERY == 0 {
                tracing::warn!(
                    domain = %domain,
                    directory = %self.directory,
                    attempts,
                    "Cannot locate domain: {}",
                    reason
                );
            } else {
                tracing::debug!(domain = %domain, attempts, "Locate retry: {}", reason);
            }

            if !stop.sleep(self.retry_delay).await {
                return Err(TunnelError::Stopped);
            }
        }
    }
}
