//! The bridge: the relay hop embedded in the target page.
//!
//! The bridge is the only context with both page-local messaging access
//! (the provider's inbox) and privileged messaging access (the
//! coordinator's inbox). It holds no durable state beyond its own
//! pending-request table: each inbound request gets a fresh inner
//! correlation id toward the provider, and the provider's answer is
//! re-wrapped under the outer id the coordinator is waiting on.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::envelope::{MessageEnvelope, Op, ParsedFrame, error_payload, parse_frame};
use crate::error::RelayError;
use crate::relay::{ChannelWire, Frame, RelayCore, respond};

/// One page's bridge endpoints.
pub struct Bridge {
    relay: Arc<RelayCore>,
    /// Wire to the provider inside the same page.
    provider: ChannelWire,
    /// Wire back to the coordinator.
    upstream: ChannelWire,
}

impl Bridge {
    #[must_use]
    pub fn new(relay: Arc<RelayCore>, provider: ChannelWire, upstream: ChannelWire) -> Self {
        Self {
            relay,
            provider,
            upstream,
        }
    }

    /// Spawn the bridge's event loop over its inbox.
    pub fn spawn(self, mut rx: mpsc::UnboundedReceiver<Frame>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let bridge = Arc::new(self);
            while let Some(frame) = rx.recv().await {
                match parse_frame(&frame.body) {
                    Ok(ParsedFrame::Request(env)) => bridge.clone().handle_request(env),
                    Ok(ParsedFrame::Response(resp)) => {
                        bridge.relay.deliver(resp);
                    }
                    Err(err) => {
                        debug!(%err, "bridge dropped malformed frame");
                    }
                }
            }
        })
    }

    fn handle_request(self: Arc<Self>, env: MessageEnvelope) {
        // Receiving-side validation: only page operations cross into the
        // provider, everything else dies right here.
        let op = match Op::parse(&env.op) {
            Some(op) if op.is_page_op() => op,
            _ => {
                if !env.is_notification() {
                    respond(
                        &self.upstream,
                        env.correlation_id,
                        error_payload(RelayError::DisallowedType(env.op.clone())),
                    );
                }
                return;
            }
        };

        // Forward on a task of its own so a slow provider call never blocks
        // the bridge's inbox; independent requests interleave freely.
        let is_notification = env.is_notification();
        let correlation_id = env.correlation_id;
        tokio::spawn(async move {
            let response = self.relay.send(&self.provider, op, env.payload).await;
            if !is_notification {
                respond(&self.upstream, correlation_id, response);
            }
        });
    }
}
