//! storescope-core: cross-context storage inspection relay.
//!
//! An operator panel attaches to one live target page and inspects or
//! mutates its storage — key/value areas, structured record databases,
//! response caches, cookies — from an isolated privileged context that
//! cannot touch page memory directly.
//!
//! # Architecture
//!
//! ```text
//! Panel ──► Coordinator ──► Bridge (in page) ──► Capability Provider
//!   ▲            │               │                      │
//!   └────────────┴───────────────┴──────────────────────┘
//!        three independently-correlated relay hops
//! ```
//!
//! Each context is a single-threaded event loop; only serialized JSON
//! envelopes cross a boundary. The coordinator owns the session tables
//! (which panel is bound to which target), injects capability code into
//! pages, and keeps itself alive while attachments exist.
//!
//! # Modules
//!
//! - `envelope`: wire shapes and the typed operation allow-list
//! - `relay`: per-hop correlation, pending requests, deadlines
//! - `session`: attachment/binding tables and the attach state machine
//! - `pages`: the target-page population and focus ordering
//! - `injector`: idempotent placement of bridge + provider into a page
//! - `bridge`: the in-page forwarding hop
//! - `provider`: the storage capability provider
//! - `cookies`: the coordinator-side, origin-scoped cookie jar
//! - `keepalive`: liveness signaling while attachments exist
//! - `coordinator`: the privileged event loop tying it all together
//! - `host`: page/panel lifecycle for embedding (CLI, tests)
//! - `panel`: the operator panel's relay endpoint
//! - `config`: tunables
//! - `logging`: tracing setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod bridge;
pub mod config;
pub mod cookies;
pub mod coordinator;
pub mod envelope;
pub mod error;
pub mod host;
pub mod injector;
pub mod keepalive;
pub mod logging;
pub mod pages;
pub mod panel;
pub mod provider;
pub mod relay;
pub mod session;

pub use config::CoreConfig;
pub use envelope::{MessageEnvelope, Op, OpFamily, ResponseEnvelope};
pub use error::{Error, Result};
pub use host::Host;
pub use pages::{PanelId, TargetId};
pub use panel::PanelClient;
