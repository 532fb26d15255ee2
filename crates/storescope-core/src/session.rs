//! Session & attachment management: which target does a panel operate on.
//!
//! Per target the lifecycle is:
//!
//! ```text
//! Unattached ──► Attaching ──► Attached ──► Detached
//!                   │              │
//!                   └── inject     ├── origin-changing navigation
//!                       failed     ├── target closed
//!                       (stays     └── last bound panel detached
//!                       Unattached)
//! ```
//!
//! The registry owns the Attachment and PanelBinding tables exclusively;
//! both are mutated only inside the coordinator's event turn, and no method
//! here suspends, so a table invariant is never observable half-updated.
//!
//! Target resolution order for attach, documented behavior rather than
//! accident: an existing live binding wins; then an explicit hint; then the
//! most recently attached live attachment; then the most recently focused
//! eligible page (excluding the panel's own page and privileged schemes).
//! "Most recently attached wins" is the tie-break whenever several
//! attachments exist and no hint is given.

use std::collections::HashMap;

use chrono::serde::ts_seconds;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::injector::Injector;
use crate::pages::{PageDirectory, PanelId, TargetId};

/// One page currently eligible to receive relayed requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub target_id: TargetId,
    pub origin: String,
    pub url: String,
    /// When the attachment was created or last refreshed.
    #[serde(with = "ts_seconds")]
    pub attached_at: DateTime<Utc>,
    /// Monotonic attach stamp; the tie-break authority (second-resolution
    /// timestamps can collide, this cannot).
    pub attach_seq: u64,
}

/// Wire projection of the target a panel is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedTab {
    pub target_id: TargetId,
    pub origin: String,
    pub url: String,
    pub title: String,
}

/// Result of an origin-changing navigation: who needs to hear about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginChange {
    pub target_id: TargetId,
    pub old_origin: String,
    pub new_origin: String,
    /// Panels whose binding pointed at the destroyed attachment.
    pub panels: Vec<PanelId>,
}

/// The most recently attached live attachment, if any.
///
/// Pure tie-break over the attachment table, unit-testable without any
/// messaging plumbing.
#[must_use]
pub fn most_recent_attachment(attachments: &HashMap<TargetId, Attachment>) -> Option<TargetId> {
    attachments
        .values()
        .max_by_key(|a| a.attach_seq)
        .map(|a| a.target_id)
}

/// Owner of the Attachment and PanelBinding tables.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    attachments: HashMap<TargetId, Attachment>,
    bindings: HashMap<PanelId, TargetId>,
    attach_clock: u64,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn attachment_count(&self) -> usize {
        self.attachments.len()
    }

    #[must_use]
    pub fn attachment(&self, target: TargetId) -> Option<&Attachment> {
        self.attachments.get(&target)
    }

    #[must_use]
    pub fn binding(&self, panel: PanelId) -> Option<TargetId> {
        self.bindings.get(&panel).copied()
    }

    /// Panels currently bound to a target.
    #[must_use]
    pub fn bound_panels(&self, target: TargetId) -> Vec<PanelId> {
        let mut panels: Vec<PanelId> = self
            .bindings
            .iter()
            .filter(|(_, t)| **t == target)
            .map(|(p, _)| *p)
            .collect();
        panels.sort_unstable();
        panels
    }

    /// Bind a panel to a target, injecting capability code as needed.
    ///
    /// Attach failures are reported synchronously and never retried here;
    /// the caller decides whether to re-prompt the operator.
    pub fn attach(
        &mut self,
        panel: PanelId,
        hint: Option<TargetId>,
        exclude: &[TargetId],
        directory: &mut PageDirectory,
        injector: &mut dyn Injector,
    ) -> Result<AttachedTab, SessionError> {
        let target = self.select_attach_target(panel, hint, exclude, directory)?;

        // Idempotent at the page level: a page with live capability code
        // keeps it, so quick double-attach never double-injects.
        injector
            .inject(directory, target)
            .map_err(|err| SessionError::AttachFailed(err.to_string()))?;

        let page = directory.get(target).ok_or_else(|| {
            SessionError::AttachFailed(format!("page {target} disappeared during attach"))
        })?;

        self.attach_clock += 1;
        self.attachments.insert(
            target,
            Attachment {
                target_id: target,
                origin: page.info.origin.clone(),
                url: page.info.url.clone(),
                attached_at: Utc::now(),
                attach_seq: self.attach_clock,
            },
        );
        self.bindings.insert(panel, target);

        Ok(AttachedTab {
            target_id: target,
            origin: page.info.origin.clone(),
            url: page.info.url.clone(),
            title: page.info.title.clone(),
        })
    }

    fn select_attach_target(
        &mut self,
        panel: PanelId,
        hint: Option<TargetId>,
        exclude: &[TargetId],
        directory: &PageDirectory,
    ) -> Result<TargetId, SessionError> {
        // Existing live binding wins.
        if let Some(bound) = self.bindings.get(&panel).copied() {
            if self.attachments.contains_key(&bound) && directory.contains(bound) {
                return Ok(bound);
            }
            // Stale: the attachment or the page is gone.
            self.bindings.remove(&panel);
        }

        // An explicit hint is an operator decision: honor it or fail, never
        // silently fall back to a different page.
        if let Some(target) = hint {
            if directory.contains(target) {
                return Ok(target);
            }
            return Err(SessionError::AttachFailed(format!(
                "target page {target} not found"
            )));
        }

        if let Some(target) =
            most_recent_attachment(&self.attachments).filter(|t| directory.contains(*t))
        {
            return Ok(target);
        }

        directory
            .most_recently_focused_eligible(exclude)
            .ok_or_else(|| {
                SessionError::AttachFailed(
                    "No suitable page found. Open a target page first, then attach.".to_string(),
                )
            })
    }

    /// Remove a panel's binding; destroy the attachment when no other panel
    /// still references it. Detaching an unbound panel succeeds silently.
    ///
    /// Returns true when an attachment was destroyed.
    pub fn detach(&mut self, panel: PanelId) -> bool {
        let Some(target) = self.bindings.remove(&panel) else {
            return false;
        };
        if self.bindings.values().any(|t| *t == target) {
            return false;
        }
        self.attachments.remove(&target).is_some()
    }

    /// The target a relayed request from this panel should go to, or `None`.
    ///
    /// Never blocks. A binding whose attachment is gone is lazily cleared
    /// here; a panel with no usable binding falls back to the most recently
    /// attached live attachment (the documented tie-break).
    pub fn resolve_target(&mut self, panel: PanelId) -> Option<TargetId> {
        if let Some(bound) = self.bindings.get(&panel).copied() {
            if self.attachments.contains_key(&bound) {
                return Some(bound);
            }
            self.bindings.remove(&panel);
        }
        most_recent_attachment(&self.attachments)
    }

    /// The origin cookie operations for this panel are scoped to.
    #[must_use]
    pub fn cookie_origin(&self, panel: PanelId) -> Option<String> {
        let target = match self.bindings.get(&panel) {
            Some(t) => *t,
            None => most_recent_attachment(&self.attachments)?,
        };
        self.attachments.get(&target).map(|a| a.origin.clone())
    }

    /// `GET_ATTACHED_TAB`: the panel's current target, adopting the most
    /// recently attached one when the panel has no binding yet. Purges a
    /// stale attachment whose page no longer exists.
    pub fn attached_tab_for(
        &mut self,
        panel: PanelId,
        directory: &PageDirectory,
    ) -> Option<AttachedTab> {
        let target = match self.bindings.get(&panel).copied() {
            Some(t) => t,
            None => {
                let adopted = most_recent_attachment(&self.attachments)?;
                self.bindings.insert(panel, adopted);
                adopted
            }
        };

        let attachment = match self.attachments.get(&target) {
            Some(attachment) => attachment.clone(),
            None => {
                // Lazy clear: the binding outlived its attachment.
                self.bindings.remove(&panel);
                return None;
            }
        };
        let Some(page) = directory.get(target) else {
            // Page is gone; drop the attachment and this panel's binding.
            self.attachments.remove(&target);
            self.bindings.remove(&panel);
            return None;
        };

        Some(AttachedTab {
            target_id: target,
            origin: attachment.origin.clone(),
            url: attachment.url.clone(),
            title: page.info.title.clone(),
        })
    }

    /// A target navigated. An origin change invalidates all storage scoping,
    /// so the attachment is destroyed; bindings are cleared lazily on next
    /// use. Same-origin navigation keeps the attachment.
    pub fn on_target_navigated(
        &mut self,
        target: TargetId,
        new_origin: &str,
    ) -> Option<OriginChange> {
        let attachment = self.attachments.get(&target)?;
        if attachment.origin == new_origin {
            return None;
        }
        let old_origin = attachment.origin.clone();
        self.attachments.remove(&target);
        Some(OriginChange {
            target_id: target,
            old_origin,
            new_origin: new_origin.to_string(),
            panels: self.bound_panels(target),
        })
    }

    /// A target closed: destroy its attachment and every binding to it.
    pub fn on_target_closed(&mut self, target: TargetId) -> bool {
        self.bindings.retain(|_, t| *t != target);
        self.attachments.remove(&target).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InjectError;

    /// Injector that records calls and marks pages injected without
    /// spawning anything.
    #[derive(Default)]
    struct FakeInjector {
        calls: Vec<TargetId>,
        injections: Vec<TargetId>,
        fail_with: Option<InjectError>,
    }

    impl Injector for FakeInjector {
        fn inject(
            &mut self,
            directory: &mut PageDirectory,
            target: TargetId,
        ) -> Result<(), InjectError> {
            self.calls.push(target);
            if let Some(err) = &self.fail_with {
                return Err(err.clone());
            }
            let Some(page) = directory.get_mut(target) else {
                return Err(InjectError::Unreachable(target));
            };
            if crate::pages::is_privileged_url(&page.info.url) {
                return Err(InjectError::PrivilegedScheme {
                    scheme: crate::pages::scheme_of(&page.info.url).unwrap_or_default(),
                });
            }
            if !page.injected {
                page.injected = true;
                self.injections.push(target);
            }
            Ok(())
        }
    }

    fn setup() -> (SessionRegistry, PageDirectory, FakeInjector) {
        (
            SessionRegistry::new(),
            PageDirectory::new(),
            FakeInjector::default(),
        )
    }

    // -- attach target selection ----------------------------------------------

    #[test]
    fn attach_selects_most_recently_focused_eligible_page() {
        let (mut reg, mut dir, mut inj) = setup();
        let a = dir.open("https://a.example", "A");
        let b = dir.open("https://b.example", "B");
        dir.open("internal://panel/1", "Panel");
        dir.focus(a);

        let tab = reg.attach(1, None, &[], &mut dir, &mut inj).unwrap();
        assert_eq!(tab.target_id, a);
        assert_eq!(tab.origin, "https://a.example");
        assert_ne!(tab.target_id, b);
    }

    #[test]
    fn attach_honors_explicit_hint() {
        let (mut reg, mut dir, mut inj) = setup();
        let a = dir.open("https://a.example", "A");
        let b = dir.open("https://b.example", "B");
        dir.focus(b);

        let tab = reg.attach(1, Some(a), &[], &mut dir, &mut inj).unwrap();
        assert_eq!(tab.target_id, a);
    }

    #[test]
    fn attach_hint_to_missing_page_fails_without_fallback() {
        let (mut reg, mut dir, mut inj) = setup();
        dir.open("https://a.example", "A");

        let err = reg.attach(1, Some(99), &[], &mut dir, &mut inj).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Attach failed: target page 99 not found"
        );
        assert_eq!(reg.attachment_count(), 0);
    }

    #[test]
    fn attach_prefers_most_recent_attachment_over_focus() {
        let (mut reg, mut dir, mut inj) = setup();
        let a = dir.open("https://a.example", "A");
        let b = dir.open("https://b.example", "B");

        // Panel 1 attaches to a explicitly; page b is focused afterwards.
        reg.attach(1, Some(a), &[], &mut dir, &mut inj).unwrap();
        dir.focus(b);

        // Panel 2 with no hint adopts the live attachment, not the focus.
        let tab = reg.attach(2, None, &[], &mut dir, &mut inj).unwrap();
        assert_eq!(tab.target_id, a);
    }

    #[test]
    fn attach_with_no_eligible_page_is_descriptive() {
        let (mut reg, mut dir, mut inj) = setup();
        dir.open("internal://panel/1", "Panel");

        let err = reg.attach(1, None, &[], &mut dir, &mut inj).unwrap_err();
        assert!(err.to_string().contains("No suitable page found"));
    }

    #[test]
    fn attach_to_privileged_hint_reports_injector_error() {
        let (mut reg, mut dir, mut inj) = setup();
        let panel_page = dir.open("internal://panel/1", "Panel");

        let err = reg
            .attach(1, Some(panel_page), &[], &mut dir, &mut inj)
            .unwrap_err();
        assert!(err.to_string().contains("Cannot attach to internal:// pages"));
        assert_eq!(reg.attachment_count(), 0);
    }

    // -- idempotent re-attach -------------------------------------------------

    #[test]
    fn quick_double_attach_resolves_same_target_one_injection() {
        let (mut reg, mut dir, mut inj) = setup();
        let a = dir.open("https://a.example", "A");

        let first = reg.attach(1, None, &[], &mut dir, &mut inj).unwrap();
        let second = reg.attach(1, None, &[], &mut dir, &mut inj).unwrap();
        assert_eq!(first.target_id, a);
        assert_eq!(first.target_id, second.target_id);
        // Invoked twice, but capability code placed once.
        assert_eq!(inj.calls.len(), 2);
        assert_eq!(inj.injections, vec![a]);
        // One binding, one attachment; never duplicates.
        assert_eq!(reg.attachment_count(), 1);
        assert_eq!(reg.bound_panels(a), vec![1]);
    }

    #[test]
    fn attach_failure_leaves_tables_unattached() {
        let (mut reg, mut dir, mut inj) = setup();
        dir.open("https://a.example", "A");
        inj.fail_with = Some(InjectError::Unreachable(1));

        assert!(reg.attach(1, None, &[], &mut dir, &mut inj).is_err());
        assert_eq!(reg.attachment_count(), 0);
        assert_eq!(reg.binding(1), None);
    }

    // -- detach ---------------------------------------------------------------

    #[test]
    fn detach_of_never_attached_panel_is_silent_noop() {
        let (mut reg, _dir, _inj) = setup();
        assert!(!reg.detach(42));
        assert!(!reg.detach(42));
    }

    #[test]
    fn shared_attachment_survives_until_last_panel_detaches() {
        let (mut reg, mut dir, mut inj) = setup();
        let t = dir.open("https://a.example", "A");

        reg.attach(1, Some(t), &[], &mut dir, &mut inj).unwrap();
        reg.attach(2, Some(t), &[], &mut dir, &mut inj).unwrap();
        assert_eq!(reg.bound_panels(t), vec![1, 2]);

        // A detaches: B's binding keeps the attachment alive.
        assert!(!reg.detach(1));
        assert_eq!(reg.attachment_count(), 1);
        assert_eq!(reg.resolve_target(2), Some(t));

        // B detaches: attachment destroyed.
        assert!(reg.detach(2));
        assert_eq!(reg.attachment_count(), 0);
    }

    // -- resolution -----------------------------------------------------------

    #[test]
    fn resolve_target_lazily_clears_stale_binding() {
        let (mut reg, mut dir, mut inj) = setup();
        let t = dir.open("https://a.example", "A");
        reg.attach(1, None, &[], &mut dir, &mut inj).unwrap();

        reg.on_target_closed(t);
        assert_eq!(reg.resolve_target(1), None);
        assert_eq!(reg.binding(1), None);
    }

    #[test]
    fn resolve_target_falls_back_to_most_recent_attachment() {
        let (mut reg, mut dir, mut inj) = setup();
        let a = dir.open("https://a.example", "A");
        let b = dir.open("https://b.example", "B");
        reg.attach(1, Some(a), &[], &mut dir, &mut inj).unwrap();
        reg.attach(2, Some(b), &[], &mut dir, &mut inj).unwrap();

        // Panel 3 never attached; it routes to the most recent attachment.
        assert_eq!(reg.resolve_target(3), Some(b));
    }

    #[test]
    fn most_recent_attachment_tie_break_is_by_attach_seq() {
        let mut attachments = HashMap::new();
        for (target, seq) in [(10, 1), (20, 3), (30, 2)] {
            attachments.insert(
                target,
                Attachment {
                    target_id: target,
                    origin: "https://x.example".into(),
                    url: "https://x.example/".into(),
                    attached_at: Utc::now(),
                    attach_seq: seq,
                },
            );
        }
        assert_eq!(most_recent_attachment(&attachments), Some(20));
        assert_eq!(most_recent_attachment(&HashMap::new()), None);
    }

    #[test]
    fn attached_tab_for_adopts_most_recent_and_purges_stale() {
        let (mut reg, mut dir, mut inj) = setup();
        let t = dir.open("https://a.example", "Site A");
        reg.attach(1, None, &[], &mut dir, &mut inj).unwrap();

        // Panel 2 never attached; it adopts and gains a binding.
        let tab = reg.attached_tab_for(2, &dir).unwrap();
        assert_eq!(tab.target_id, t);
        assert_eq!(tab.title, "Site A");
        assert_eq!(reg.binding(2), Some(t));

        // Page closes behind our back: next query purges everything.
        dir.close(t);
        assert_eq!(reg.attached_tab_for(2, &dir), None);
        assert_eq!(reg.attachment_count(), 0);
        assert_eq!(reg.binding(2), None);
    }

    // -- navigation and close -------------------------------------------------

    #[test]
    fn origin_change_destroys_attachment_and_lists_bound_panels() {
        let (mut reg, mut dir, mut inj) = setup();
        let t = dir.open("https://a.example", "A");
        reg.attach(1, None, &[], &mut dir, &mut inj).unwrap();
        reg.attach(2, None, &[], &mut dir, &mut inj).unwrap();

        let change = reg
            .on_target_navigated(t, "https://evil.example")
            .unwrap();
        assert_eq!(change.old_origin, "https://a.example");
        assert_eq!(change.new_origin, "https://evil.example");
        assert_eq!(change.panels, vec![1, 2]);
        assert_eq!(reg.attachment_count(), 0);

        // Subsequent resolution finds nothing to route to.
        assert_eq!(reg.resolve_target(1), None);
    }

    #[test]
    fn same_origin_navigation_keeps_attachment() {
        let (mut reg, mut dir, mut inj) = setup();
        let t = dir.open("https://a.example/home", "A");
        reg.attach(1, None, &[], &mut dir, &mut inj).unwrap();

        assert_eq!(reg.on_target_navigated(t, "https://a.example"), None);
        assert_eq!(reg.attachment_count(), 1);
    }

    #[test]
    fn close_clears_bindings_eagerly() {
        let (mut reg, mut dir, mut inj) = setup();
        let t = dir.open("https://a.example", "A");
        reg.attach(1, None, &[], &mut dir, &mut inj).unwrap();
        reg.attach(2, None, &[], &mut dir, &mut inj).unwrap();

        assert!(reg.on_target_closed(t));
        assert_eq!(reg.binding(1), None);
        assert_eq!(reg.binding(2), None);
        assert!(!reg.on_target_closed(t));
    }

    // -- cookie scoping -------------------------------------------------------

    #[test]
    fn cookie_origin_follows_binding_then_most_recent() {
        let (mut reg, mut dir, mut inj) = setup();
        let a = dir.open("https://a.example", "A");
        let b = dir.open("https://b.example", "B");
        reg.attach(1, Some(a), &[], &mut dir, &mut inj).unwrap();
        reg.attach(2, Some(b), &[], &mut dir, &mut inj).unwrap();

        assert_eq!(reg.cookie_origin(1).as_deref(), Some("https://a.example"));
        // Unbound panel: most recent attachment's origin.
        assert_eq!(reg.cookie_origin(9).as_deref(), Some("https://b.example"));

        // Bound to a destroyed attachment: no silent fallback.
        reg.on_target_navigated(a, "https://z.example");
        assert_eq!(reg.cookie_origin(1), None);
    }
}
