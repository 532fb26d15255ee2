//! Capability injection: placing bridge and provider code into a target page.
//!
//! Injection is idempotent per page generation — a page that already has
//! live capability code keeps it, so re-attach never double-registers
//! handlers. Navigation resets the page's script context (see
//! [`crate::pages`]), after which the next attach injects fresh.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::bridge::Bridge;
use crate::config::CoreConfig;
use crate::error::InjectError;
use crate::pages::{PageDirectory, TargetId, scheme_of};
use crate::provider::{CapabilityProvider, KvLimits};
use crate::relay::{ChannelWire, Frame, RelayCore, SenderContext};

/// Places capability code into a chosen target page on demand.
///
/// A trait so session-manager tests can observe injection without spawning
/// page loops.
pub trait Injector: Send {
    fn inject(&mut self, directory: &mut PageDirectory, target: TargetId)
    -> Result<(), InjectError>;
}

/// The real injector: spawns the page's provider and bridge event loops and
/// records the bridge inbox on the page.
pub struct PageInjector {
    coordinator_tx: mpsc::UnboundedSender<Frame>,
    config: CoreConfig,
}

impl PageInjector {
    #[must_use]
    pub fn new(coordinator_tx: mpsc::UnboundedSender<Frame>, config: CoreConfig) -> Self {
        Self {
            coordinator_tx,
            config,
        }
    }
}

impl Injector for PageInjector {
    fn inject(
        &mut self,
        directory: &mut PageDirectory,
        target: TargetId,
    ) -> Result<(), InjectError> {
        let Some(page) = directory.get_mut(target) else {
            return Err(InjectError::Unreachable(target));
        };

        let scheme = scheme_of(&page.info.url).unwrap_or_default();
        if crate::pages::PRIVILEGED_SCHEMES.contains(&scheme.as_str()) {
            return Err(InjectError::PrivilegedScheme { scheme });
        }

        // Re-entry guard: live capability code stays as-is.
        if page.injected && page.inbox.is_some() {
            return Ok(());
        }

        let (bridge_tx, bridge_rx) = mpsc::unbounded_channel();
        let (provider_tx, provider_rx) = mpsc::unbounded_channel();

        // Bridge first, then provider, mirroring the page's load order; the
        // provider answers on the bridge's inbox.
        let bridge = Bridge::new(
            Arc::new(RelayCore::new(self.config.request_timeout())),
            ChannelWire::new(SenderContext::Page(target), provider_tx),
            ChannelWire::new(SenderContext::Page(target), self.coordinator_tx.clone()),
        );
        bridge.spawn(bridge_rx);

        let provider =
            CapabilityProvider::new(Arc::clone(&page.state), KvLimits::from(&self.config));
        provider.spawn(
            provider_rx,
            ChannelWire::new(SenderContext::Page(target), bridge_tx.clone()),
        );

        page.inbox = Some(bridge_tx);
        page.injected = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn injector() -> (PageInjector, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PageInjector::new(tx, CoreConfig::default()), rx)
    }

    #[tokio::test]
    async fn inject_spawns_capability_code_once() {
        let (mut injector, _rx) = injector();
        let mut dir = PageDirectory::new();
        let id = dir.open("https://site.example", "Site");

        injector.inject(&mut dir, id).unwrap();
        let first_inbox = dir.get(id).unwrap().inbox.clone().unwrap();
        assert!(dir.get(id).unwrap().injected);

        // Second injection is a no-op: same bridge, same channel.
        injector.inject(&mut dir, id).unwrap();
        let second_inbox = dir.get(id).unwrap().inbox.clone().unwrap();
        assert!(first_inbox.same_channel(&second_inbox));
    }

    #[tokio::test]
    async fn privileged_scheme_is_a_typed_error() {
        let (mut injector, _rx) = injector();
        let mut dir = PageDirectory::new();
        let id = dir.open("internal://panel/1", "Panel");

        let err = injector.inject(&mut dir, id).unwrap_err();
        assert_eq!(
            err,
            InjectError::PrivilegedScheme {
                scheme: "internal".into()
            }
        );
        assert!(!dir.get(id).unwrap().injected);
    }

    #[tokio::test]
    async fn unknown_target_is_unreachable() {
        let (mut injector, _rx) = injector();
        let mut dir = PageDirectory::new();
        let err = injector.inject(&mut dir, 404).unwrap_err();
        assert_eq!(err, InjectError::Unreachable(404));
    }

    #[tokio::test]
    async fn navigation_clears_injection_so_next_inject_respawns() {
        let (mut injector, _rx) = injector();
        let mut dir = PageDirectory::new();
        let id = dir.open("https://site.example/a", "Site");

        injector.inject(&mut dir, id).unwrap();
        let first_inbox = dir.get(id).unwrap().inbox.clone().unwrap();

        dir.navigate(id, "https://site.example/b");
        assert!(!dir.get(id).unwrap().injected);

        injector.inject(&mut dir, id).unwrap();
        let second_inbox = dir.get(id).unwrap().inbox.clone().unwrap();
        assert!(!first_inbox.same_channel(&second_inbox));
    }
}
