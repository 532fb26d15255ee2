//! The embedding host: page lifecycle, panel lifecycle, coordinator wiring.
//!
//! [`Host`] owns the page directory, spawns the coordinator, turns page
//! navigation into `TAB_UPDATED` notifications and page closure into
//! control events, and hands out [`PanelClient`]s. The CLI and the
//! integration tests drive everything through this surface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::CoreConfig;
use crate::coordinator::{self, Control, CoordinatorHandle};
use crate::cookies::CookieStore;
use crate::envelope::Op;
use crate::pages::{PageDirectory, TargetId};
use crate::panel::PanelClient;
use crate::provider::PageState;
use crate::relay::{ChannelWire, SenderContext, notify};

/// A running relay host.
pub struct Host {
    cfg: CoreConfig,
    directory: Arc<Mutex<PageDirectory>>,
    handle: CoordinatorHandle,
    next_panel: AtomicU64,
    _coordinator: JoinHandle<()>,
}

impl Host {
    /// Start a host with an empty cookie jar.
    #[must_use]
    pub fn start(cfg: CoreConfig) -> Self {
        Self::start_with_cookies(cfg, CookieStore::new())
    }

    /// Start a host with a pre-seeded cookie jar.
    #[must_use]
    pub fn start_with_cookies(cfg: CoreConfig, cookies: CookieStore) -> Self {
        let directory = Arc::new(Mutex::new(PageDirectory::new()));
        let (handle, task) = coordinator::spawn(cfg.clone(), Arc::clone(&directory), cookies);
        Self {
            cfg,
            directory,
            handle,
            next_panel: AtomicU64::new(0),
            _coordinator: task,
        }
    }

    fn directory(&self) -> MutexGuard<'_, PageDirectory> {
        self.directory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a page with empty storage.
    pub fn open_page(&self, url: &str, title: &str) -> TargetId {
        self.directory().open(url, title)
    }

    /// Open a page with seeded storage.
    pub fn open_page_with_state(&self, url: &str, title: &str, state: PageState) -> TargetId {
        self.directory().open_with_state(url, title, state)
    }

    /// Focus a page (affects attach target selection).
    pub fn focus(&self, target: TargetId) -> bool {
        self.directory().focus(target)
    }

    /// Navigate a page. The coordinator hears about it through a
    /// `TAB_UPDATED` notification carrying `{targetId, url}`.
    pub fn navigate(&self, target: TargetId, url: &str) -> bool {
        let navigated = self.directory().navigate(target, url).is_some();
        if navigated {
            let wire = ChannelWire::new(SenderContext::Host, self.handle.frames_tx.clone());
            notify(
                &wire,
                Op::TabUpdated,
                json!({"targetId": target, "url": url}),
            );
        }
        navigated
    }

    /// Close a page.
    pub fn close_page(&self, target: TargetId) -> bool {
        let closed = self.directory().close(target);
        if closed {
            let _ = self.handle.control_tx.send(Control::PageClosed { target });
        }
        closed
    }

    /// Connect a new panel instance. The panel's own page appears in the
    /// directory under the privileged `internal:` scheme, so it can never
    /// be selected as an attachment target.
    pub fn open_panel(&self) -> PanelClient {
        let panel = self.next_panel.fetch_add(1, Ordering::Relaxed) + 1;
        let page = self.directory().open(
            &format!("internal://panel/{panel}"),
            "Storage Inspector",
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.handle.control_tx.send(Control::RegisterPanel {
            panel,
            tx,
            page,
        });
        PanelClient::new(
            panel,
            rx,
            self.handle.frames_tx.clone(),
            self.cfg.request_timeout(),
        )
    }

    /// Keepalive signals fired so far (liveness observation).
    #[must_use]
    pub fn keepalive_ticks(&self) -> u64 {
        self.handle.keepalive_ticks.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn config(&self) -> &CoreConfig {
        &self.cfg
    }

    /// Shared handle to the page directory, for host-level embedding that
    /// needs direct page access (fault injection in tests, bulk seeding).
    #[must_use]
    pub fn directory_handle(&self) -> Arc<Mutex<PageDirectory>> {
        Arc::clone(&self.directory)
    }
}
