//! The panel-facing relay endpoint.
//!
//! A [`PanelClient`] is one operator panel instance: it owns the panel side
//! of the panel↔coordinator hop (its own relay core and pending table) and
//! receives unsolicited notifications (`TAB_NAVIGATED_AWAY`) on a separate
//! queue. The visual layer above this is out of scope; everything a panel
//! can do is a typed request through here.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::envelope::{MessageEnvelope, Op, ParsedFrame, parse_frame};
use crate::pages::{PanelId, TargetId};
use crate::relay::{ChannelWire, Frame, RelayCore, SenderContext};

/// How often a panel pings the coordinator to keep it alive, alongside the
/// coordinator's own alarm-based scheduler.
const PANEL_PING_INTERVAL: Duration = Duration::from_secs(15);

/// One operator panel instance.
pub struct PanelClient {
    panel_id: PanelId,
    relay: Arc<RelayCore>,
    wire: ChannelWire,
    notifications: tokio::sync::Mutex<mpsc::UnboundedReceiver<MessageEnvelope>>,
    _rx_task: JoinHandle<()>,
}

impl PanelClient {
    /// Wire up a panel over its inbox and the coordinator's frame channel.
    #[must_use]
    pub fn new(
        panel_id: PanelId,
        rx: mpsc::UnboundedReceiver<Frame>,
        coordinator_tx: mpsc::UnboundedSender<Frame>,
        timeout: Duration,
    ) -> Self {
        let relay = Arc::new(RelayCore::new(timeout));
        let (notif_tx, notif_rx) = mpsc::unbounded_channel();

        let rx_relay = Arc::clone(&relay);
        let rx_task = tokio::spawn(async move {
            let mut rx = rx;
            while let Some(frame) = rx.recv().await {
                match parse_frame(&frame.body) {
                    Ok(ParsedFrame::Response(resp)) => {
                        rx_relay.deliver(resp);
                    }
                    Ok(ParsedFrame::Request(env)) => {
                        trace!(panel_id, op = %env.op, "panel notification");
                        let _ = notif_tx.send(env);
                    }
                    Err(_) => {}
                }
            }
        });

        Self {
            panel_id,
            relay,
            wire: ChannelWire::new(SenderContext::Panel(panel_id), coordinator_tx),
            notifications: tokio::sync::Mutex::new(notif_rx),
            _rx_task: rx_task,
        }
    }

    #[must_use]
    pub fn panel_id(&self) -> PanelId {
        self.panel_id
    }

    /// Send one allow-listed operation and await its response payload.
    pub async fn request(&self, op: Op, payload: Value) -> Value {
        self.relay.send(&self.wire, op, payload).await
    }

    /// Send an operation by wire name. Names outside the allow-list are
    /// rejected locally, before anything crosses to the coordinator.
    pub async fn request_named(&self, op_name: &str, payload: Value) -> Value {
        self.relay.send_raw(&self.wire, op_name, payload).await
    }

    /// `ATTACH_TO_TAB`, optionally naming an explicit target.
    pub async fn attach(&self, hint: Option<TargetId>) -> Value {
        let payload = match hint {
            Some(target) => json!({"targetId": target}),
            None => Value::Null,
        };
        self.request(Op::AttachToTab, payload).await
    }

    /// `DETACH_TAB` for this panel only.
    pub async fn detach(&self) -> Value {
        self.request(Op::DetachTab, Value::Null).await
    }

    /// `GET_ATTACHED_TAB`.
    pub async fn attached_tab(&self) -> Value {
        self.request(Op::GetAttachedTab, Value::Null).await
    }

    /// One `KEEPALIVE` ping.
    pub async fn keepalive(&self) -> Value {
        self.request(Op::Keepalive, Value::Null).await
    }

    /// Spawn the panel's ambient keepalive ping loop (every 15 s).
    #[must_use]
    pub fn start_keepalive_pings(&self) -> JoinHandle<()> {
        let relay = Arc::clone(&self.relay);
        let wire = self.wire.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(PANEL_PING_INTERVAL);
            timer.tick().await;
            loop {
                timer.tick().await;
                // Fire-and-forget semantics; an inactive coordinator is fine.
                let _ = relay.send(&wire, Op::Keepalive, Value::Null).await;
            }
        })
    }

    /// Next unsolicited notification, if the coordinator pushed one.
    pub async fn next_notification(&self) -> Option<MessageEnvelope> {
        self.notifications.lock().await.recv().await
    }

    /// Non-blocking look at the notification queue.
    pub fn try_notification(&self) -> Option<MessageEnvelope> {
        self.notifications.try_lock().ok()?.try_recv().ok()
    }
}
