//! Wire envelopes and the typed operation allow-list.
//!
//! Every context boundary carries exactly two frame shapes, serialized as
//! JSON (field names are part of the protocol and must not change):
//!
//! ```text
//! outbound:  { "type": string, "payload": object, "correlationId": integer }
//! inbound:   { "correlationId": integer, "response": { "success": true, ... }
//!                                                  | { "error": string } }
//! ```
//!
//! The [`Op`] enum is the sole authority for which operation names are
//! relayable. Dispatch everywhere is an exhaustive match over `Op`; a string
//! that does not parse into `Op` is rejected at the boundary that saw it and
//! never reaches a capability provider.
//!
//! Correlation id `0` is reserved for fire-and-forget notifications
//! (`TAB_NAVIGATED_AWAY`, `TAB_UPDATED`): relay cores allocate ids starting
//! at 1, so a zero id never matches a pending request.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::RelayError;

/// Correlation id used for one-way notification envelopes.
pub const NOTIFICATION_CORRELATION_ID: u64 = 0;

// =============================================================================
// Envelope shapes
// =============================================================================

/// An outbound request (or notification) envelope. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Operation name. Validated against [`Op`] on the receiving side of
    /// every hop; kept as a string here because invalid names must still
    /// parse far enough to be rejected with a correlated error.
    #[serde(rename = "type")]
    pub op: String,

    /// Opaque operation payload. The relay never interprets it.
    #[serde(default)]
    pub payload: Value,

    /// Correlation id, unique among pending requests of the issuing relay.
    #[serde(rename = "correlationId")]
    pub correlation_id: u64,
}

impl MessageEnvelope {
    /// Build a request envelope for an allow-listed operation.
    #[must_use]
    pub fn request(op: Op, payload: Value, correlation_id: u64) -> Self {
        Self {
            op: op.as_str().to_string(),
            payload,
            correlation_id,
        }
    }

    /// Build a one-way notification envelope (correlation id 0).
    #[must_use]
    pub fn notification(op: Op, payload: Value) -> Self {
        Self::request(op, payload, NOTIFICATION_CORRELATION_ID)
    }

    /// Whether this envelope expects no response.
    #[must_use]
    pub fn is_notification(&self) -> bool {
        self.correlation_id == NOTIFICATION_CORRELATION_ID
    }
}

/// An inbound response envelope, pairing a result with the request's
/// correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "correlationId")]
    pub correlation_id: u64,

    /// `{ success: true, ... }` on success, `{ error: string }` on failure.
    pub response: Value,
}

impl ResponseEnvelope {
    #[must_use]
    pub fn new(correlation_id: u64, response: Value) -> Self {
        Self {
            correlation_id,
            response,
        }
    }
}

/// Build an `{ error: message }` response payload.
#[must_use]
pub fn error_payload(message: impl std::fmt::Display) -> Value {
    json!({ "error": message.to_string() })
}

/// Whether a response payload carries an error.
#[must_use]
pub fn is_error_payload(payload: &Value) -> bool {
    payload.get("error").is_some()
}

// =============================================================================
// Frame parsing
// =============================================================================

/// A frame decoded from its serialized form: either a request/notification
/// or a response. The two are distinguished by shape (`type` vs `response`).
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedFrame {
    Request(MessageEnvelope),
    Response(ResponseEnvelope),
}

/// Parse a serialized frame body.
///
/// Anything that is not a JSON object with either a string `type` or a
/// `response` field is malformed; the caller answers it with
/// `{error: "Invalid message format"}` without dispatching.
pub fn parse_frame(body: &str) -> Result<ParsedFrame, RelayError> {
    let value: Value = serde_json::from_str(body).map_err(|_| RelayError::MalformedFrame)?;
    if !value.is_object() {
        return Err(RelayError::MalformedFrame);
    }
    if value.get("response").is_some() {
        return serde_json::from_value(value)
            .map(ParsedFrame::Response)
            .map_err(|_| RelayError::MalformedFrame);
    }
    if value.get("type").map(Value::is_string) == Some(true) {
        return serde_json::from_value(value)
            .map(ParsedFrame::Request)
            .map_err(|_| RelayError::MalformedFrame);
    }
    Err(RelayError::MalformedFrame)
}

// =============================================================================
// Operation allow-list
// =============================================================================

/// Which subsystem an operation belongs to, and therefore how it is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpFamily {
    /// Key/value storage areas inside the page. Relayed to the provider.
    KeyValue,
    /// Structured record databases inside the page. Relayed to the provider.
    RecordStore,
    /// HTTP response caches inside the page. Relayed to the provider.
    ResponseCache,
    /// Cookie operations, served by the coordinator against the attachment
    /// origin. Never forwarded into the page.
    Cookie,
    /// Attachment/session management, served by the coordinator.
    Session,
    /// Internal notifications; not operator-invocable.
    Internal,
}

macro_rules! ops {
    ($( $variant:ident => $name:literal : $family:ident ),* $(,)?) => {
        /// The fixed operation allow-list.
        ///
        /// Only these names are relayable; everything else is rejected with
        /// `Invalid message type` before reaching a capability provider.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Op {
            $( $variant, )*
        }

        impl Op {
            /// Every allow-listed operation.
            pub const ALL: &'static [Op] = &[ $( Op::$variant, )* ];

            /// The wire name of this operation.
            #[must_use]
            pub fn as_str(self) -> &'static str {
                match self {
                    $( Op::$variant => $name, )*
                }
            }

            /// Parse a wire name. `None` means not allow-listed.
            #[must_use]
            pub fn parse(name: &str) -> Option<Self> {
                match name {
                    $( $name => Some(Op::$variant), )*
                    _ => None,
                }
            }

            /// Routing family for this operation.
            #[must_use]
            pub fn family(self) -> OpFamily {
                match self {
                    $( Op::$variant => OpFamily::$family, )*
                }
            }
        }
    };
}

ops! {
    // Key/value storage areas
    GetLocalStorage => "GET_LOCAL_STORAGE": KeyValue,
    SetLocalStorage => "SET_LOCAL_STORAGE": KeyValue,
    RemoveLocalStorage => "REMOVE_LOCAL_STORAGE": KeyValue,
    ClearLocalStorage => "CLEAR_LOCAL_STORAGE": KeyValue,
    GetSessionStorage => "GET_SESSION_STORAGE": KeyValue,
    SetSessionStorage => "SET_SESSION_STORAGE": KeyValue,
    RemoveSessionStorage => "REMOVE_SESSION_STORAGE": KeyValue,
    ClearSessionStorage => "CLEAR_SESSION_STORAGE": KeyValue,

    // Structured record databases
    GetIndexedDbDatabases => "GET_INDEXEDDB_DATABASES": RecordStore,
    GetIndexedDbObjectStores => "GET_INDEXEDDB_OBJECT_STORES": RecordStore,
    GetIndexedDbRecords => "GET_INDEXEDDB_RECORDS": RecordStore,
    SetIndexedDbRecord => "SET_INDEXEDDB_RECORD": RecordStore,
    DeleteIndexedDbRecord => "DELETE_INDEXEDDB_RECORD": RecordStore,
    ClearIndexedDbStore => "CLEAR_INDEXEDDB_STORE": RecordStore,

    // Response caches
    GetCacheStorageNames => "GET_CACHE_STORAGE_NAMES": ResponseCache,
    GetCacheStorageEntries => "GET_CACHE_STORAGE_ENTRIES": ResponseCache,
    DeleteCacheStorageEntry => "DELETE_CACHE_STORAGE_ENTRY": ResponseCache,
    DeleteCacheStorage => "DELETE_CACHE_STORAGE": ResponseCache,
    RefetchCacheStorageEntry => "REFETCH_CACHE_STORAGE_ENTRY": ResponseCache,

    // Cookies (coordinator-level, origin-scoped)
    GetCookies => "GET_COOKIES": Cookie,
    SetCookie => "SET_COOKIE": Cookie,
    RemoveCookie => "REMOVE_COOKIE": Cookie,

    // Session management (coordinator-level)
    AttachToTab => "ATTACH_TO_TAB": Session,
    DetachTab => "DETACH_TAB": Session,
    GetAttachedTab => "GET_ATTACHED_TAB": Session,
    Keepalive => "KEEPALIVE": Session,

    // Internal notifications
    TabUpdated => "TAB_UPDATED": Internal,
    TabNavigatedAway => "TAB_NAVIGATED_AWAY": Internal,
}

impl Op {
    /// Whether the bridge forwards this operation into the page context.
    ///
    /// The bridge filters on family rather than trusting the sender:
    /// coordinator-level operations never cross into the page even if
    /// someone addresses them there.
    #[must_use]
    pub fn is_page_op(self) -> bool {
        matches!(
            self.family(),
            OpFamily::KeyValue | OpFamily::RecordStore | OpFamily::ResponseCache
        )
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
