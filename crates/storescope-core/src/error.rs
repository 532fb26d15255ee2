//! Error types for storescope-core.
//!
//! The taxonomy mirrors the places an inspection request can die:
//!
//! * [`RelayError`] — the envelope never made it across a hop, or was
//!   rejected at a hop boundary before dispatch.
//! * [`SessionError`] — the requesting panel has no usable attachment, or
//!   is not a context we accept session operations from.
//! * [`InjectError`] — capability code could not be placed into the target
//!   page.
//! * [`ConfigError`] — the tunables file is unreadable or malformed.
//!
//! Capability failures (store not found, quota exceeded, malformed JSON in a
//! cached body) are *not* represented here: they are generated inside the
//! target page and travel back as `{error: message}` payloads inside
//! successfully delivered response envelopes, untouched by every outer hop.

use thiserror::Error;

use crate::pages::TargetId;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for storescope-core.
#[derive(Error, Debug)]
pub enum Error {
    /// Relay/transport errors
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// Session and attachment errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Capability injection errors
    #[error("Injection error: {0}")]
    Inject(#[from] InjectError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the relay core and hop boundaries.
///
/// The `Display` text of each variant is the exact string that crosses the
/// wire as `{error: ...}` — operator tooling matches on these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// No response envelope arrived within the hop deadline.
    #[error("Request timeout")]
    Timeout,

    /// The frame was not an object with a string `type` field.
    #[error("Invalid message format")]
    MalformedFrame,

    /// The envelope type is outside the fixed allow-list. Rejected at the
    /// boundary that saw it, never forwarded.
    #[error("Invalid message type: {0}")]
    DisallowedType(String),

    /// The receiving context was destroyed before it could acknowledge.
    #[error("Receiving end does not exist")]
    ReceiverGone,
}

/// Errors raised by the session & attachment manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The requesting panel has no live binding and no attachment could be
    /// adopted.
    #[error("No attached tab found")]
    NoAttachment,

    /// A session operation arrived from a context that is not a recognized
    /// panel. Rejected synchronously, never relayed.
    #[error("Invalid sender")]
    InvalidSender,

    /// Attach could not complete. The message is descriptive and surfaced
    /// verbatim to the operator; attach is never retried automatically.
    #[error("Attach failed: {0}")]
    AttachFailed(String),
}

/// Errors raised by the injector, typed so callers can distinguish a page
/// that refuses capability code from a page that is simply gone.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InjectError {
    /// The target page lives under a privileged/restricted scheme.
    #[error("Cannot attach to {scheme}:// pages")]
    PrivilegedScheme {
        /// The offending scheme (e.g. "internal").
        scheme: String,
    },

    /// The target page is not present in the page directory.
    #[error("page {0} is not reachable")]
    Unreachable(TargetId),
}

/// Errors raised while loading or parsing configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Could not read the config file.
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The file was not valid TOML for our schema.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_error_wire_texts() {
        assert_eq!(RelayError::Timeout.to_string(), "Request timeout");
        assert_eq!(
            RelayError::MalformedFrame.to_string(),
            "Invalid message format"
        );
        assert_eq!(
            RelayError::DisallowedType("EVIL_OP".into()).to_string(),
            "Invalid message type: EVIL_OP"
        );
    }

    #[test]
    fn session_error_wire_texts() {
        assert_eq!(
            SessionError::NoAttachment.to_string(),
            "No attached tab found"
        );
        assert_eq!(SessionError::InvalidSender.to_string(), "Invalid sender");
        assert_eq!(
            SessionError::AttachFailed("no eligible page".into()).to_string(),
            "Attach failed: no eligible page"
        );
    }

    #[test]
    fn inject_error_distinguishes_privileged_from_unreachable() {
        let privileged = InjectError::PrivilegedScheme {
            scheme: "internal".into(),
        };
        let unreachable = InjectError::Unreachable(7);
        assert_ne!(privileged, unreachable);
        assert!(privileged.to_string().contains("internal"));
        assert!(unreachable.to_string().contains('7'));
    }

    #[test]
    fn errors_convert_into_top_level() {
        let err: Error = RelayError::Timeout.into();
        assert!(matches!(err, Error::Relay(RelayError::Timeout)));
        let err: Error = SessionError::InvalidSender.into();
        assert!(matches!(err, Error::Session(_)));
    }
}
