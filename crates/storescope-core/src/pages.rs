//! The population of target pages the relay can attach to.
//!
//! [`PageDirectory`] models what the embedding host knows about its pages:
//! identity, current URL/origin/title, focus recency, and — once capability
//! code has been injected — the wire into that page's bridge. It is the
//! external collaborator the session manager queries when resolving "which
//! page should this panel operate on"; it owns no session state itself.
//!
//! Navigation mirrors real page lifecycles: any navigation destroys the
//! page's script context (injected capability code is gone until the next
//! attach), and a cross-origin navigation additionally swaps in a fresh
//! storage state, since every store is scoped to the origin.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use url::Url;

use crate::provider::PageState;
use crate::relay::Frame;

/// Identity of one target page for the lifetime of the host.
pub type TargetId = u64;

/// Identity of one operator panel instance.
pub type PanelId = u64;

/// Schemes the relay refuses to attach to: host UI surfaces and other
/// privileged contexts.
pub const PRIVILEGED_SCHEMES: &[&str] = &["internal", "devtools"];

/// Compute a URL's origin (scheme://host[:port], default ports elided).
#[must_use]
pub fn origin_of(url_str: &str) -> Option<String> {
    let parsed = Url::parse(url_str).ok()?;
    match parsed.origin() {
        origin @ url::Origin::Tuple(..) => Some(origin.ascii_serialization()),
        url::Origin::Opaque(_) => Some(format!(
            "{}://{}",
            parsed.scheme(),
            parsed.host_str().unwrap_or("")
        )),
    }
}

/// Extract a URL's scheme.
#[must_use]
pub fn scheme_of(url_str: &str) -> Option<String> {
    Url::parse(url_str).ok().map(|u| u.scheme().to_string())
}

/// Whether a URL lives under a scheme the relay must not attach to.
#[must_use]
pub fn is_privileged_url(url_str: &str) -> bool {
    scheme_of(url_str).is_some_and(|s| PRIVILEGED_SCHEMES.contains(&s.as_str()))
}

/// Descriptive identity of a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInfo {
    pub target_id: TargetId,
    pub url: String,
    pub origin: String,
    pub title: String,
    /// Monotonic focus stamp; larger = focused more recently.
    pub last_focused: u64,
}

/// One live page: identity plus runtime injection state.
#[derive(Debug)]
pub struct Page {
    pub info: PageInfo,
    /// The page's storage, owned by the page itself. The provider operates
    /// on this; nothing outside the page context touches it directly.
    pub state: Arc<Mutex<PageState>>,
    /// Wire into the page's bridge once capability code is injected.
    pub inbox: Option<mpsc::UnboundedSender<Frame>>,
    /// Re-entry guard: injection is idempotent per page generation.
    pub injected: bool,
}

impl Page {
    fn new(info: PageInfo, state: PageState) -> Self {
        Self {
            info,
            state: Arc::new(Mutex::new(state)),
            inbox: None,
            injected: false,
        }
    }

    /// Tear down the page's script context (navigation or close). Storage
    /// survives unless the caller also replaces `state`.
    fn reset_scripts(&mut self) {
        self.inbox = None;
        self.injected = false;
    }
}

/// Registry of all live pages.
#[derive(Debug, Default)]
pub struct PageDirectory {
    pages: HashMap<TargetId, Page>,
    next_target: u64,
    focus_clock: u64,
}

impl PageDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a page with empty storage. The new page is focused.
    pub fn open(&mut self, url: &str, title: &str) -> TargetId {
        self.open_with_state(url, title, PageState::default())
    }

    /// Open a page with pre-seeded storage. The new page is focused.
    pub fn open_with_state(&mut self, url: &str, title: &str, state: PageState) -> TargetId {
        self.next_target += 1;
        self.focus_clock += 1;
        let target_id = self.next_target;
        let info = PageInfo {
            target_id,
            url: url.to_string(),
            origin: origin_of(url).unwrap_or_default(),
            title: title.to_string(),
            last_focused: self.focus_clock,
        };
        self.pages.insert(target_id, Page::new(info, state));
        target_id
    }

    /// Navigate a page to a new URL.
    ///
    /// The script context is destroyed either way; a cross-origin move also
    /// replaces the page's storage with a fresh state for the new origin.
    /// Returns the new origin, or `None` for an unknown target.
    pub fn navigate(&mut self, target_id: TargetId, new_url: &str) -> Option<String> {
        let page = self.pages.get_mut(&target_id)?;
        let new_origin = origin_of(new_url).unwrap_or_default();
        if new_origin != page.info.origin {
            page.state = Arc::new(Mutex::new(PageState::default()));
        }
        page.info.url = new_url.to_string();
        page.info.origin = new_origin.clone();
        page.reset_scripts();
        Some(new_origin)
    }

    /// Mark a page as the most recently focused.
    pub fn focus(&mut self, target_id: TargetId) -> bool {
        let Some(page) = self.pages.get_mut(&target_id) else {
            return false;
        };
        self.focus_clock += 1;
        page.info.last_focused = self.focus_clock;
        true
    }

    /// Close a page. Returns whether it existed.
    pub fn close(&mut self, target_id: TargetId) -> bool {
        self.pages.remove(&target_id).is_some()
    }

    #[must_use]
    pub fn get(&self, target_id: TargetId) -> Option<&Page> {
        self.pages.get(&target_id)
    }

    pub fn get_mut(&mut self, target_id: TargetId) -> Option<&mut Page> {
        self.pages.get_mut(&target_id)
    }

    #[must_use]
    pub fn contains(&self, target_id: TargetId) -> bool {
        self.pages.contains_key(&target_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// The most recently focused page that is eligible for attachment:
    /// not privileged, not in `exclude` (the requesting panel's own page).
    #[must_use]
    pub fn most_recently_focused_eligible(&self, exclude: &[TargetId]) -> Option<TargetId> {
        self.pages
            .values()
            .filter(|p| !exclude.contains(&p.info.target_id))
            .filter(|p| !is_privileged_url(&p.info.url))
            .max_by_key(|p| p.info.last_focused)
            .map(|p| p.info.target_id)
    }
}
