//! Request/response correlation across one context boundary.
//!
//! A [`RelayCore`] lives on the *requesting* side of every hop
//! (panel→coordinator, coordinator→bridge, bridge→provider). It owns that
//! side's pending-request table and nothing else; no table is shared across
//! contexts — only serialized envelopes cross a [`Wire`].
//!
//! ```text
//! send() ──► allocate correlation id ──► register pending ──► transmit
//!                                                                │
//!              resolve exactly once ◄── deliver(response) ◄──────┘
//!                      │
//!                      └── or the 30 s deadline fires first; a response
//!                          arriving after that is discarded, not delivered
//! ```
//!
//! Multi-hop requests are three independently-timed relays chained by
//! routing, not one global correlation id: each hop's deadline starts when
//! that hop's request is issued, so worst-case latency is bounded by one
//! deadline, not their sum.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::envelope::{MessageEnvelope, Op, ResponseEnvelope, error_payload};
use crate::error::RelayError;
use crate::pages::{PanelId, TargetId};

// =============================================================================
// Transport
// =============================================================================

/// Which execution context a frame came from. Transport metadata, not part
/// of the envelope: receivers use it for sender authentication (cookie and
/// session operations), never for correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderContext {
    /// A recognized operator panel instance.
    Panel(PanelId),
    /// A target page's bridge/provider pair.
    Page(TargetId),
    /// The embedding host (navigation events, internal notifications).
    Host,
}

/// One serialized frame plus its transport-level sender identity.
#[derive(Debug, Clone)]
pub struct Frame {
    pub sender: SenderContext,
    pub body: String,
}

/// One direction of a context boundary.
///
/// `transmit` hands a serialized frame to the receiving context and reports
/// only whether that context still exists; there is no acknowledgement. A
/// destroyed receiver is the one condition that surfaces as transport-level
/// loss rather than an error payload.
pub trait Wire: Send + Sync {
    fn transmit(&self, body: String) -> bool;
}

/// [`Wire`] over an in-process channel to the receiving context's inbox.
#[derive(Debug, Clone)]
pub struct ChannelWire {
    sender: SenderContext,
    tx: mpsc::UnboundedSender<Frame>,
}

impl ChannelWire {
    #[must_use]
    pub fn new(sender: SenderContext, tx: mpsc::UnboundedSender<Frame>) -> Self {
        Self { sender, tx }
    }
}

impl Wire for ChannelWire {
    fn transmit(&self, body: String) -> bool {
        self.tx
            .send(Frame {
                sender: self.sender,
                body,
            })
            .is_ok()
    }
}

/// Serialize and transmit a response envelope. Returns false on transport
/// loss (the requesting context is gone; nothing further to do).
pub fn respond(wire: &dyn Wire, correlation_id: u64, response: Value) -> bool {
    let envelope = ResponseEnvelope::new(correlation_id, response);
    match serde_json::to_string(&envelope) {
        Ok(body) => wire.transmit(body),
        Err(_) => false,
    }
}

/// Serialize and transmit a one-way notification envelope.
pub fn notify(wire: &dyn Wire, op: Op, payload: Value) -> bool {
    let envelope = MessageEnvelope::notification(op, payload);
    match serde_json::to_string(&envelope) {
        Ok(body) => wire.transmit(body),
        Err(_) => false,
    }
}

// =============================================================================
// Relay core
// =============================================================================

/// The correlation engine for one side of one hop.
#[derive(Debug)]
pub struct RelayCore {
    /// Pending requests keyed by correlation id. Exactly one of
    /// {response, timeout} removes each entry.
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    /// Monotonic id source; never reused while the relay lives, so a stale
    /// id can never match a newer request.
    next_id: AtomicU64,
    timeout: Duration,
}

impl RelayCore {
    /// Create a relay with the given per-request deadline.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            // 0 is reserved for notifications.
            next_id: AtomicU64::new(1),
            timeout,
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Value>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of requests currently awaiting a response.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending().len()
    }

    /// Send an allow-listed operation across the wire and await its result.
    ///
    /// Resolves exactly once, with the response payload, an error payload
    /// carried by the response, or `{error: "Request timeout"}` when the
    /// deadline fires first.
    pub async fn send(&self, wire: &dyn Wire, op: Op, payload: Value) -> Value {
        self.transmit_and_wait(wire, op.as_str(), payload).await
    }

    /// Send an operation by wire name, validating it against the allow-list
    /// before anything crosses the boundary. This is the sending-side half
    /// of the trust boundary; the receiving side of every hop re-validates.
    pub async fn send_raw(&self, wire: &dyn Wire, op_name: &str, payload: Value) -> Value {
        if Op::parse(op_name).is_none() {
            return error_payload(RelayError::DisallowedType(op_name.to_string()));
        }
        self.transmit_and_wait(wire, op_name, payload).await
    }

    async fn transmit_and_wait(&self, wire: &dyn Wire, op_name: &str, payload: Value) -> Value {
        let correlation_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(correlation_id, tx);

        let envelope = MessageEnvelope {
            op: op_name.to_string(),
            payload,
            correlation_id,
        };
        let Ok(body) = serde_json::to_string(&envelope) else {
            self.pending().remove(&correlation_id);
            return error_payload(RelayError::MalformedFrame);
        };

        trace!(op = op_name, correlation_id, "relay send");
        if !wire.transmit(body) {
            self.pending().remove(&correlation_id);
            return error_payload(RelayError::ReceiverGone);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                // Resolver dropped without a value; the relay is shutting down.
                self.pending().remove(&correlation_id);
                error_payload(RelayError::ReceiverGone)
            }
            Err(_) => {
                self.pending().remove(&correlation_id);
                debug!(op = op_name, correlation_id, "relay request timed out");
                error_payload(RelayError::Timeout)
            }
        }
    }

    /// Hand an inbound response envelope to its waiting request.
    ///
    /// Returns false when the correlation id matches nothing pending — the
    /// request already timed out or never existed — in which case the
    /// response is discarded.
    pub fn deliver(&self, response: ResponseEnvelope) -> bool {
        match self.pending().remove(&response.correlation_id) {
            Some(tx) => tx.send(response.response).is_ok(),
            None => {
                debug!(
                    correlation_id = response.correlation_id,
                    "discarding late or unknown response"
                );
                false
            }
        }
    }
}
