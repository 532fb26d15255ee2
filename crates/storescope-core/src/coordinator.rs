//! The privileged coordinator: session dispatch and request routing.
//!
//! One single-threaded event loop owns the session registry, the cookie
//! store, and the keepalive scheduler. Frames arrive from panels, pages,
//! and the host on one inbox; host lifecycle events (panel registration,
//! page closure) arrive on a control channel. Every handler runs to
//! completion within one event turn — table mutation never spans an await,
//! so no invariant is observable half-updated.
//!
//! Routing:
//!
//! * session and cookie operations are answered here, never forwarded;
//! * key/value, record-store, and response-cache operations are relayed to
//!   the bound target's bridge on this loop's own relay core, each forward
//!   running on its own task so slow pages never block the loop;
//! * `TAB_UPDATED` host notifications drive origin-change detection, which
//!   destroys the attachment and pushes `TAB_NAVIGATED_AWAY` to every bound
//!   panel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::cookies::CookieStore;
use crate::envelope::{MessageEnvelope, Op, OpFamily, ParsedFrame, error_payload, parse_frame};
use crate::error::{RelayError, SessionError};
use crate::injector::PageInjector;
use crate::keepalive::KeepaliveScheduler;
use crate::pages::{PageDirectory, PanelId, TargetId, origin_of};
use crate::relay::{ChannelWire, Frame, RelayCore, SenderContext, notify, respond};
use crate::session::SessionRegistry;

/// Host lifecycle events, outside the message protocol.
#[derive(Debug)]
pub enum Control {
    /// A new panel instance connected; frames for it go to `tx`.
    RegisterPanel {
        panel: PanelId,
        tx: mpsc::UnboundedSender<Frame>,
        /// The panel's own page in the directory, excluded from attachment.
        page: TargetId,
    },
    /// A target page was closed by the host.
    PageClosed { target: TargetId },
}

/// Channels for talking to a running coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    pub frames_tx: mpsc::UnboundedSender<Frame>,
    pub control_tx: mpsc::UnboundedSender<Control>,
    /// Keepalive fire counter, for liveness observation.
    pub keepalive_ticks: Arc<std::sync::atomic::AtomicU64>,
}

struct Coordinator {
    registry: SessionRegistry,
    cookies: CookieStore,
    keepalive: KeepaliveScheduler,
    relay: Arc<RelayCore>,
    directory: Arc<Mutex<PageDirectory>>,
    injector: PageInjector,
    panels: HashMap<PanelId, mpsc::UnboundedSender<Frame>>,
    panel_pages: HashMap<PanelId, TargetId>,
}

/// Spawn the coordinator event loop.
#[must_use]
pub fn spawn(
    cfg: CoreConfig,
    directory: Arc<Mutex<PageDirectory>>,
    cookies: CookieStore,
) -> (CoordinatorHandle, JoinHandle<()>) {
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let (control_tx, control_rx) = mpsc::unbounded_channel();

    let keepalive = KeepaliveScheduler::new(cfg.keepalive_interval());
    let keepalive_ticks = keepalive.ticks_handle();

    let coordinator = Coordinator {
        relay: Arc::new(RelayCore::new(cfg.request_timeout())),
        injector: PageInjector::new(frames_tx.clone(), cfg),
        registry: SessionRegistry::new(),
        cookies,
        keepalive,
        directory,
        panels: HashMap::new(),
        panel_pages: HashMap::new(),
    };

    let handle = CoordinatorHandle {
        frames_tx,
        control_tx,
        keepalive_ticks,
    };
    let task = tokio::spawn(coordinator.run(frames_rx, control_rx));
    (handle, task)
}

impl Coordinator {
    async fn run(
        mut self,
        mut frames_rx: mpsc::UnboundedReceiver<Frame>,
        mut control_rx: mpsc::UnboundedReceiver<Control>,
    ) {
        info!("coordinator started");
        loop {
            // Biased: host lifecycle events drain first, so a panel's
            // registration is always processed before its first request.
            tokio::select! {
                biased;
                ctrl = control_rx.recv() => match ctrl {
                    Some(ctrl) => self.handle_control(ctrl),
                    None => break,
                },
                frame = frames_rx.recv() => match frame {
                    Some(frame) => self.handle_frame(frame),
                    None => break,
                },
            }
        }
        info!("coordinator stopped");
    }

    fn directory(&self) -> MutexGuard<'_, PageDirectory> {
        self.directory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_control(&mut self, ctrl: Control) {
        match ctrl {
            Control::RegisterPanel { panel, tx, page } => {
                debug!(panel, page, "panel registered");
                self.panels.insert(panel, tx);
                self.panel_pages.insert(panel, page);
            }
            Control::PageClosed { target } => {
                if self.registry.on_target_closed(target) {
                    info!(target, "attachment destroyed: target closed");
                }
                self.keepalive.sync(self.registry.attachment_count());
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        match parse_frame(&frame.body) {
            Ok(ParsedFrame::Request(env)) => self.handle_request(env, frame.sender),
            Ok(ParsedFrame::Response(resp)) => {
                self.relay.deliver(resp);
            }
            Err(err) => {
                // Answer if a correlation id can be salvaged; otherwise the
                // frame is unroutable noise.
                if let Some(correlation_id) = salvage_correlation_id(&frame.body) {
                    self.reply(frame.sender, correlation_id, error_payload(&err));
                } else {
                    debug!(sender = ?frame.sender, "dropped malformed frame");
                }
            }
        }
    }

    fn handle_request(&mut self, env: MessageEnvelope, sender: SenderContext) {
        let Some(op) = Op::parse(&env.op) else {
            self.reply(
                sender,
                env.correlation_id,
                error_payload(RelayError::DisallowedType(env.op.clone())),
            );
            return;
        };

        match op.family() {
            OpFamily::Session => self.handle_session_op(op, env, sender),
            OpFamily::Cookie => self.handle_cookie_op(op, env, sender),
            OpFamily::Internal => self.handle_internal(op, env, sender),
            OpFamily::KeyValue | OpFamily::RecordStore | OpFamily::ResponseCache => {
                self.forward_to_target(op, env, sender);
            }
        }
    }

    // -- session operations ---------------------------------------------------

    fn handle_session_op(&mut self, op: Op, env: MessageEnvelope, sender: SenderContext) {
        // KEEPALIVE is answered for anyone; the rest need a panel identity.
        if op == Op::Keepalive {
            if self.registry.attachment_count() > 0 {
                self.keepalive.ensure_running();
            }
            self.reply(sender, env.correlation_id, json!({"success": true}));
            return;
        }

        let SenderContext::Panel(panel) = sender else {
            self.reply(
                sender,
                env.correlation_id,
                error_payload(SessionError::InvalidSender),
            );
            return;
        };

        let response = match op {
            Op::AttachToTab => self.attach_panel(panel, &env.payload),
            Op::DetachTab => {
                self.registry.detach(panel);
                self.keepalive.sync(self.registry.attachment_count());
                json!({"success": true})
            }
            Op::GetAttachedTab => {
                // Clone the handle so the guard borrows a local, leaving
                // `self.registry` free to borrow mutably.
                let directory = Arc::clone(&self.directory);
                let guard = directory.lock().unwrap_or_else(PoisonError::into_inner);
                match self.registry.attached_tab_for(panel, &guard) {
                    Some(tab) => json!({
                        "targetId": tab.target_id,
                        "origin": tab.origin,
                        "url": tab.url,
                        "title": tab.title,
                    }),
                    None => json!({"targetId": null}),
                }
            }
            _ => error_payload(RelayError::DisallowedType(env.op.clone())),
        };
        self.reply(SenderContext::Panel(panel), env.correlation_id, response);
    }

    fn attach_panel(&mut self, panel: PanelId, payload: &Value) -> Value {
        let hint = payload.get("targetId").and_then(Value::as_u64);
        let exclude: Vec<TargetId> = self.panel_pages.get(&panel).copied().into_iter().collect();

        let directory = Arc::clone(&self.directory);
        let mut guard = directory.lock().unwrap_or_else(PoisonError::into_inner);
        let result = self
            .registry
            .attach(panel, hint, &exclude, &mut guard, &mut self.injector);
        drop(guard);

        self.keepalive.sync(self.registry.attachment_count());
        match result {
            Ok(tab) => {
                info!(panel, target = tab.target_id, origin = %tab.origin, "panel attached");
                json!({
                    "success": true,
                    "targetId": tab.target_id,
                    "origin": tab.origin,
                    "url": tab.url,
                    "title": tab.title,
                })
            }
            Err(err) => {
                warn!(panel, %err, "attach failed");
                error_payload(err)
            }
        }
    }

    // -- cookie operations ----------------------------------------------------

    fn handle_cookie_op(&mut self, op: Op, env: MessageEnvelope, sender: SenderContext) {
        // The one trust check cookies get: only the recognized panel context
        // may touch the jar.
        let SenderContext::Panel(panel) = sender else {
            self.reply(
                sender,
                env.correlation_id,
                error_payload(SessionError::InvalidSender),
            );
            return;
        };

        let Some(origin) = self.registry.cookie_origin(panel) else {
            self.reply(
                sender,
                env.correlation_id,
                error_payload(SessionError::NoAttachment),
            );
            return;
        };

        let response = match op {
            Op::GetCookies => self.cookies.get_for_url(&origin),
            Op::SetCookie => self.cookies.set_from_payload(&origin, &env.payload),
            Op::RemoveCookie => self.cookies.remove_from_payload(&origin, &env.payload),
            _ => error_payload(RelayError::DisallowedType(env.op.clone())),
        };
        self.reply(sender, env.correlation_id, response);
    }

    // -- internal notifications -----------------------------------------------

    fn handle_internal(&mut self, op: Op, env: MessageEnvelope, sender: SenderContext) {
        // Not operator-invocable: only the host feeds these.
        if sender != SenderContext::Host {
            self.reply(
                sender,
                env.correlation_id,
                error_payload(SessionError::InvalidSender),
            );
            return;
        }
        if op != Op::TabUpdated {
            return;
        }

        let Some(target) = env.payload.get("targetId").and_then(Value::as_u64) else {
            return;
        };
        let url = env.payload.get("url").and_then(Value::as_str).unwrap_or("");
        let new_origin = origin_of(url).unwrap_or_default();

        if let Some(change) = self.registry.on_target_navigated(target, &new_origin) {
            info!(
                target,
                old = %change.old_origin,
                new = %change.new_origin,
                "attachment destroyed: origin changed"
            );
            let payload = json!({
                "targetId": change.target_id,
                "oldOrigin": change.old_origin,
                "newOrigin": change.new_origin,
            });
            for panel in &change.panels {
                if let Some(tx) = self.panels.get(panel) {
                    let wire = ChannelWire::new(SenderContext::Host, tx.clone());
                    notify(&wire, Op::TabNavigatedAway, payload.clone());
                }
            }
            self.keepalive.sync(self.registry.attachment_count());
        }
    }

    // -- forwarding -----------------------------------------------------------

    fn forward_to_target(&mut self, op: Op, env: MessageEnvelope, sender: SenderContext) {
        let SenderContext::Panel(panel) = sender else {
            self.reply(
                sender,
                env.correlation_id,
                error_payload(SessionError::InvalidSender),
            );
            return;
        };

        let Some(target) = self.registry.resolve_target(panel) else {
            self.reply(
                sender,
                env.correlation_id,
                error_payload(SessionError::NoAttachment),
            );
            return;
        };

        let page_wire = {
            let directory = self.directory();
            directory
                .get(target)
                .and_then(|page| page.inbox.clone())
                .map(|tx| ChannelWire::new(SenderContext::Host, tx))
        };
        let Some(page_wire) = page_wire else {
            // Attached but the page's capability code is gone (navigated
            // away, or the page vanished): transport-level loss.
            self.reply(
                sender,
                env.correlation_id,
                error_payload(RelayError::ReceiverGone),
            );
            return;
        };

        let Some(panel_tx) = self.panels.get(&panel).cloned() else {
            debug!(panel, "forward from unregistered panel dropped");
            return;
        };

        // Each forward is its own independently-timed relay; the outer
        // correlation id is re-applied when the inner hop resolves.
        let relay = Arc::clone(&self.relay);
        let outer_id = env.correlation_id;
        let payload = env.payload;
        tokio::spawn(async move {
            let response = relay.send(&page_wire, op, payload).await;
            let panel_wire = ChannelWire::new(SenderContext::Host, panel_tx);
            respond(&panel_wire, outer_id, response);
        });
    }

    fn reply(&self, sender: SenderContext, correlation_id: u64, response: Value) {
        let tx = match sender {
            SenderContext::Panel(panel) => self.panels.get(&panel).cloned(),
            SenderContext::Page(target) => {
                self.directory().get(target).and_then(|page| page.inbox.clone())
            }
            SenderContext::Host => None,
        };
        if let Some(tx) = tx {
            let wire = ChannelWire::new(SenderContext::Host, tx);
            respond(&wire, correlation_id, response);
        } else {
            debug!(?sender, "reply channel unavailable, response dropped");
        }
    }
}

/// Best-effort extraction of a correlation id from an unparseable frame, so
/// the sender's pending request can still be failed promptly.
fn salvage_correlation_id(body: &str) -> Option<u64> {
    serde_json::from_str::<Value>(body)
        .ok()?
        .get("correlationId")?
        .as_u64()
}
