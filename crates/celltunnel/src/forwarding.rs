// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Forwarding engine.
//!
//! Two paths move envelopes across a tunnel:
//!
//! - **Outbound** ([`Outbound::send`]): runs on whatever task the bus
//!   delivers on. A single async mutex guards the usable flag, the write
//!   half and the replay queue, so concurrent senders are serialized and a
//!   write never overlaps a detach.
//! - **Inbound** ([`run_inbound`]): runs on the tunnel task, reading one
//!   envelope at a time and handing it to the bus.
//!
//! A failed write marks the tunnel unusable and wakes the tunnel task
//! through [`Outbound::broken`], which tears the stream down at once.

use crate::bus::MessageBus;
use crate::codec::FrameCodec;
use crate::config::ForwardingPolicy;
use crate::envelope::Envelope;
use crate::error::TunnelError;
use crate::routing::TunnelId;
use crate::security::BoxedStream;
use crate::stats::TunnelStats;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{Mutex, Notify};

/// Write half of a tunnel stream.
pub type TunnelWriter = WriteHalf<BoxedStream>;

/// Read half of a tunnel stream.
pub type TunnelReader = ReadHalf<BoxedStream>;

/// Why an envelope was not written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Tunnel not usable and the policy is `drop`
    Down,
    /// Hop budget exhausted
    TtlExhausted,
    /// The write itself failed
    WriteFailed,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Down => write!(f, "tunnel down"),
            Self::TtlExhausted => write!(f, "ttl exhausted"),
            Self::WriteFailed => write!(f, "write failed"),
        }
    }
}

/// Result of submitting an envelope to the outbound path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Queued,
    Dropped(DropReason),
}

struct OutboundState {
    usable: bool,
    writer: Option<TunnelWriter>,
    queue: VecDeque<Envelope>,
}

/// Outbound path of one tunnel.
pub struct Outbound {
    tunnel: TunnelId,
    local_domain: String,
    policy: ForwardingPolicy,
    codec: FrameCodec,
    write_timeout: Duration,
    stats: Arc<TunnelStats>,
    state: Mutex<OutboundState>,
    usable: AtomicBool,
    broken: Notify,
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbound")
            .field("tunnel", &self.tunnel)
            .field("policy", &self.policy)
            .field("usable", &self.is_usable())
            .finish()
    }
}

impl Outbound {
    pub fn new(
        tunnel: TunnelId,
        local_domain: impl Into<String>,
        policy: ForwardingPolicy,
        codec: FrameCodec,
        write_timeout: Duration,
        stats: Arc<TunnelStats>,
    ) -> Self {
        Self {
            tunnel,
            local_domain: local_domain.into(),
            policy,
            codec,
            write_timeout,
            stats,
            state: Mutex::new(OutboundState {
                usable: false,
                writer: None,
                queue: VecDeque::new(),
            }),
            usable: AtomicBool::new(false),
            broken: Notify::new(),
        }
    }

    pub fn policy(&self) -> ForwardingPolicy {
        self.policy
    }

    /// Lock-free projection of the usable flag (status reporting only).
    pub fn is_usable(&self) -> bool {
        self.usable.load(Ordering::Acquire)
    }

    /// Envelopes waiting for the next session (queue policy).
    pub async fn queued(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Resolves after a write failure.
    pub async fn broken(&self) {
        self.broken.notified().await;
    }

    /// Submit an envelope.
    pub async fn send(&self, envelope: Envelope) -> SendOutcome {
        let mut state = self.state.lock().await;

        if !state.usable {
            return match self.policy {
                ForwardingPolicy::Drop => {
                    self.stats.record_dropped();
                    tracing::debug!(
                        tunnel = %self.tunnel,
                        destination = %envelope.destination,
                        "Tunnel down, dropping message"
                    );
                    SendOutcome::Dropped(DropReason::Down)
                }
                ForwardingPolicy::Queue => {
                    state.queue.push_back(envelope);
                    SendOutcome::Queued
                }
            };
        }

        self.write_locked(&mut state, envelope).await
    }

    /// Start a session on `writer`, replaying queued envelopes first.
    ///
    /// Returns how many queued envelopes were written.
    pub async fn attach(&self, writer: TunnelWriter) -> usize {
        let mut state = self.state.lock().await;
        state.writer = Some(writer);
        state.usable = true;
        self.usable.store(true, Ordering::Release);

        let mut replayed = 0;
        while state.usable {
            let Some(envelope) = state.queue.pop_front() else {
                break;
            };
            if self.write_locked(&mut state, envelope).await == SendOutcome::Sent {
                replayed += 1;
            }
        }
        if replayed > 0 {
            tracing::info!(tunnel = %self.tunnel, replayed, "Replayed queued messages");
        }
        replayed
    }

    /// End the current session and return the write half, if still held.
    pub async fn detach(&self) -> Option<TunnelWriter> {
        let mut state = self.state.lock().await;
        state.usable = false;
        self.usable.store(false, Ordering::Release);
        state.writer.take()
    }

    async fn write_locked(&self, state: &mut OutboundState, envelope: Envelope) -> SendOutcome {
        let original = (self.policy == ForwardingPolicy::Queue).then(|| envelope.clone());
        let mut envelope = envelope;

        if !envelope.mark_hop(&self.local_domain) {
            self.stats.record_dropped();
            tracing::warn!(
                tunnel = %self.tunnel,
                destination = %envelope.destination,
                "TTL exhausted, dropping message"
            );
            return SendOutcome::Dropped(DropReason::TtlExhausted);
        }

        let Some(writer) = state.writer.as_mut() else {
            state.usable = false;
            self.usable.store(false, Ordering::Release);
            self.stats.record_dropped();
            return SendOutcome::Dropped(DropReason::Down);
        };

        let error = match tokio::time::timeout(
            self.write_timeout,
            self.codec.write(writer, &envelope),
        )
        .await
        {
            Ok(Ok(_)) => {
                self.stats.record_to_tunnel();
                return SendOutcome::Sent;
            }
            Ok(Err(e)) if !e.is_io() => {
                // Encoding failed before any byte hit the stream.
                self.stats.record_dropped();
                tracing::warn!(tunnel = %self.tunnel, error = %e, "Cannot encode message, dropping");
                return SendOutcome::Dropped(DropReason::WriteFailed);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("write timed out after {:?}", self.write_timeout),
        };

        tracing::warn!(tunnel = %self.tunnel, error = %error, "Outbound write failed, tearing down");
        state.usable = false;
        state.writer = None;
        self.usable.store(false, Ordering::Release);
        self.broken.notify_one();

        match original {
            Some(original) => {
                state.queue.push_front(original);
                SendOutcome::Queued
            }
            None => {
                self.stats.record_dropped();
                SendOutcome::Dropped(DropReason::WriteFailed)
            }
        }
    }
}

/// Inbound loop: read envelopes and hand them to the bus.
///
/// Returns the failure that ended the session. Local delivery errors are
/// logged and counted but never end the loop.
pub async fn run_inbound(
    reader: &mut TunnelReader,
    codec: &FrameCodec,
    bus: &MessageBus,
    tunnel: TunnelId,
    stats: &TunnelStats,
) -> TunnelError {
    let local_domain = bus.local_domain().to_string();
    loop {
        let envelope: Envelope = match codec.read(reader).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return TunnelError::PeerClosed,
            Err(e) => return TunnelError::Codec(e),
        };

        if envelope.has_visited(&local_domain) {
            stats.record_dropped();
            tracing::warn!(
                tunnel = %tunnel,
                source = %envelope.source,
                destination = %envelope.destination,
                "Routing loop detected, dropping message"
            );
            continue;
        }

        stats.record_to_domain();
        let destination = envelope.destination.clone();
        if let Err(e) = bus.deliver(envelope).await {
            stats.record_delivery_failure();
            tracing::debug!(tunnel = %tunnel, destination = %destination, error = %e, "Local delivery failed");
        }
    }
}
