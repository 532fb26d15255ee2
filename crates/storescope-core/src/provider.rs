//! The capability provider: storage operations inside the page context.
//!
//! Pure request→result functions over the page's own [`PageState`]; the
//! provider has no cross-context knowledge beyond the reply wire its event
//! loop answers on. Every operation returns either `{success: true, ...}`
//! or `{error: message}` — capability failures are payload, never protocol
//! faults, so they ride back unmodified through every outer hop.
//!
//! The provider enforces the full operation allow-list on its receiving
//! side: this is the innermost trust boundary, and it holds even if every
//! outer hop has been subverted.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::CoreConfig;
use crate::envelope::{Op, ParsedFrame, error_payload, parse_frame};
use crate::relay::{ChannelWire, Frame, respond};

// =============================================================================
// Page storage model
// =============================================================================

/// Everything a page owns that the panel can inspect: two key/value areas,
/// structured record databases, response caches, and the origin server the
/// page would re-fetch cache entries from.
#[derive(Debug, Default)]
pub struct PageState {
    pub local: BTreeMap<String, String>,
    pub session: BTreeMap<String, String>,
    pub databases: Vec<Database>,
    pub caches: Vec<NamedCache>,
    /// Responses the page's origin would serve, keyed by URL. This is what
    /// a cache-entry refetch reads from.
    pub origin_server: HashMap<String, StoredBody>,
}

/// One structured record database.
#[derive(Debug, Clone)]
pub struct Database {
    pub name: String,
    pub version: u32,
    pub stores: Vec<ObjectStore>,
}

/// One object store within a database.
#[derive(Debug, Clone, Default)]
pub struct ObjectStore {
    pub name: String,
    /// Inline-key path; `None` means out-of-line keys.
    pub key_path: Option<String>,
    pub auto_increment: bool,
    pub indexes: Vec<StoreIndex>,
    /// Records in cursor order.
    pub records: Vec<StoredRecord>,
}

/// Secondary index metadata (reported, not queried).
#[derive(Debug, Clone)]
pub struct StoreIndex {
    pub name: String,
    pub key_path: String,
    pub unique: bool,
    pub multi_entry: bool,
}

/// One record: key plus opaque value.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub key: Value,
    pub value: Value,
}

/// One named response cache.
#[derive(Debug, Clone, Default)]
pub struct NamedCache {
    pub name: String,
    pub entries: Vec<CacheEntry>,
}

/// One cached request/response pair.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub request: CachedRequest,
    pub response: CachedResponse,
}

#[derive(Debug, Clone)]
pub struct CachedRequest {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub status_text: String,
    /// Response classification ("basic", "cors", ...).
    pub kind: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl CachedResponse {
    fn content_type(&self) -> &str {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map_or("", |(_, v)| v.as_str())
    }
}

/// A response as served by the origin (refetch source).
#[derive(Debug, Clone)]
pub struct StoredBody {
    pub status: u16,
    pub status_text: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl PageState {
    fn find_database(&self, name: &str) -> Option<&Database> {
        self.databases.iter().find(|db| db.name == name)
    }

    fn database_index(&self, name: &str) -> Option<usize> {
        self.databases.iter().position(|db| db.name == name)
    }

    fn cache_open_or_create(&mut self, name: &str) -> &mut NamedCache {
        // The platform cache API creates on open; an unknown name is an
        // empty cache, not an error.
        let idx = match self.caches.iter().position(|c| c.name == name) {
            Some(idx) => idx,
            None => {
                self.caches.push(NamedCache {
                    name: name.to_string(),
                    entries: Vec::new(),
                });
                self.caches.len() - 1
            }
        };
        &mut self.caches[idx]
    }
}

impl Database {
    fn find_store(&self, name: &str) -> Option<&ObjectStore> {
        self.stores.iter().find(|s| s.name == name)
    }

    fn store_index(&self, name: &str) -> Option<usize> {
        self.stores.iter().position(|s| s.name == name)
    }

    fn store_names(&self) -> String {
        if self.stores.is_empty() {
            "none".to_string()
        } else {
            self.stores
                .iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        }
    }
}

// =============================================================================
// Key/value limits
// =============================================================================

/// Validation limits for key/value SET operations.
#[derive(Debug, Clone, Copy)]
pub struct KvLimits {
    pub max_key_len: usize,
    pub max_value_bytes: usize,
}

impl From<&CoreConfig> for KvLimits {
    fn from(cfg: &CoreConfig) -> Self {
        Self {
            max_key_len: cfg.max_key_len,
            max_value_bytes: cfg.max_value_bytes,
        }
    }
}

impl Default for KvLimits {
    fn default() -> Self {
        Self::from(&CoreConfig::default())
    }
}

impl KvLimits {
    fn invalid_key_message(&self) -> String {
        format!(
            "Invalid key: must be a non-empty string under {} characters",
            self.max_key_len
        )
    }

    fn invalid_value_message(&self) -> String {
        format!(
            "Invalid value: must be a string under {}MB",
            self.max_value_bytes / (1024 * 1024)
        )
    }
}

// =============================================================================
// Capability provider
// =============================================================================

/// Which key/value area an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Area {
    Local,
    Session,
}

/// The storage capability provider for one page.
#[derive(Debug)]
pub struct CapabilityProvider {
    state: Arc<Mutex<PageState>>,
    limits: KvLimits,
}

impl CapabilityProvider {
    #[must_use]
    pub fn new(state: Arc<Mutex<PageState>>, limits: KvLimits) -> Self {
        Self { state, limits }
    }

    fn state(&self) -> MutexGuard<'_, PageState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Execute one operation. `op_name` is validated here against the
    /// allow-list regardless of what outer hops already checked.
    #[must_use]
    pub fn handle(&self, op_name: &str, payload: &Value) -> Value {
        let Some(op) = Op::parse(op_name) else {
            return error_payload(format!("Invalid message type: {op_name}"));
        };
        if !op.is_page_op() {
            return error_payload(format!("Invalid message type: {op_name}"));
        }

        match op {
            Op::GetLocalStorage => self.kv_get(Area::Local),
            Op::SetLocalStorage => self.kv_set(Area::Local, payload),
            Op::RemoveLocalStorage => self.kv_remove(Area::Local, payload),
            Op::ClearLocalStorage => self.kv_clear(Area::Local),
            Op::GetSessionStorage => self.kv_get(Area::Session),
            Op::SetSessionStorage => self.kv_set(Area::Session, payload),
            Op::RemoveSessionStorage => self.kv_remove(Area::Session, payload),
            Op::ClearSessionStorage => self.kv_clear(Area::Session),

            Op::GetIndexedDbDatabases => self.db_list(),
            Op::GetIndexedDbObjectStores => self.db_object_stores(payload),
            Op::GetIndexedDbRecords => self.db_records(payload),
            Op::SetIndexedDbRecord => self.db_set_record(payload),
            Op::DeleteIndexedDbRecord => self.db_delete_record(payload),
            Op::ClearIndexedDbStore => self.db_clear_store(payload),

            Op::GetCacheStorageNames => self.cache_names(),
            Op::GetCacheStorageEntries => self.cache_entries(payload),
            Op::DeleteCacheStorageEntry => self.cache_delete_entry(payload),
            Op::DeleteCacheStorage => self.cache_delete(payload),
            Op::RefetchCacheStorageEntry => self.cache_refetch_entry(payload),

            // Not page operations; unreachable past the is_page_op gate.
            Op::GetCookies
            | Op::SetCookie
            | Op::RemoveCookie
            | Op::AttachToTab
            | Op::DetachTab
            | Op::GetAttachedTab
            | Op::Keepalive
            | Op::TabUpdated
            | Op::TabNavigatedAway => error_payload(format!("Invalid message type: {op_name}")),
        }
    }

    /// Spawn the provider's event loop for one page: drain the inbox,
    /// execute, answer on `reply`.
    pub fn spawn(self, mut rx: mpsc::UnboundedReceiver<Frame>, reply: ChannelWire) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match parse_frame(&frame.body) {
                    Ok(ParsedFrame::Request(env)) => {
                        let response = self.handle(&env.op, &env.payload);
                        if !env.is_notification() {
                            respond(&reply, env.correlation_id, response);
                        }
                    }
                    Ok(ParsedFrame::Response(_)) => {
                        // The provider awaits nothing; stray responses are noise.
                    }
                    Err(err) => {
                        // No correlation id to answer on.
                        debug!(%err, "provider dropped malformed frame");
                    }
                }
            }
        })
    }

    // -- key/value areas ------------------------------------------------------

    fn kv_get(&self, area: Area) -> Value {
        let mut state = self.state();
        let items = area_of(&mut state, area);
        json!({ "success": true, "items": items })
    }

    fn kv_set(&self, area: Area, payload: &Value) -> Value {
        let key = payload.get("key").and_then(Value::as_str);
        let value = payload.get("value").and_then(Value::as_str);

        let Some(key) = key.filter(|k| !k.is_empty() && k.len() <= self.limits.max_key_len) else {
            return error_payload(self.limits.invalid_key_message());
        };
        let Some(value) = value.filter(|v| v.len() <= self.limits.max_value_bytes) else {
            return error_payload(self.limits.invalid_value_message());
        };

        let mut state = self.state();
        area_of(&mut state, area).insert(key.to_string(), value.to_string());
        json!({ "success": true })
    }

    fn kv_remove(&self, area: Area, payload: &Value) -> Value {
        if let Some(key) = payload.get("key").and_then(Value::as_str) {
            let mut state = self.state();
            area_of(&mut state, area).remove(key);
        }
        json!({ "success": true })
    }

    fn kv_clear(&self, area: Area) -> Value {
        let mut state = self.state();
        area_of(&mut state, area).clear();
        json!({ "success": true })
    }

    // -- record databases -----------------------------------------------------

    fn db_list(&self) -> Value {
        let state = self.state();
        let databases: Vec<Value> = state
            .databases
            .iter()
            .map(|db| json!({ "name": db.name, "version": db.version }))
            .collect();
        json!({ "success": true, "databases": databases })
    }

    fn db_object_stores(&self, payload: &Value) -> Value {
        let database_name = str_field(payload, "databaseName");
        let state = self.state();
        let Some(db) = state.find_database(&database_name) else {
            return error_payload(format!("Database {database_name} not found"));
        };

        let stores: Vec<Value> = db
            .stores
            .iter()
            .map(|store| {
                let indexes: Vec<Value> = store
                    .indexes
                    .iter()
                    .map(|idx| {
                        json!({
                            "name": idx.name,
                            "keyPath": idx.key_path,
                            "unique": idx.unique,
                            "multiEntry": idx.multi_entry,
                        })
                    })
                    .collect();
                json!({
                    "name": store.name,
                    "keyPath": store.key_path,
                    "autoIncrement": store.auto_increment,
                    "indexes": indexes,
                })
            })
            .collect();
        json!({ "success": true, "stores": stores })
    }

    fn db_records(&self, payload: &Value) -> Value {
        let database_name = str_field(payload, "databaseName");
        let store_name = str_field(payload, "storeName");
        let page = usize_field(payload, "page", 0);
        let page_size = usize_field(payload, "pageSize", 50).max(1);

        let state = self.state();
        let Some(db) = state.find_database(&database_name) else {
            return error_payload(format!("Database {database_name} not found"));
        };
        let Some(store) = db.find_store(&store_name) else {
            return error_payload(store_not_found(db, &store_name, &database_name));
        };

        let total = store.records.len();
        let start = page.saturating_mul(page_size).min(total);
        let end = start.saturating_add(page_size).min(total);
        let records: Vec<Value> = store.records[start..end]
            .iter()
            .map(|r| json!({ "key": r.key, "value": r.value }))
            .collect();

        json!({
            "success": true,
            "records": records,
            "total": total,
            "hasMore": end < total,
        })
    }

    fn db_set_record(&self, payload: &Value) -> Value {
        let database_name = str_field(payload, "databaseName");
        let store_name = str_field(payload, "storeName");
        let provided_key = payload.get("key");
        let value = payload.get("value").cloned().unwrap_or(Value::Null);

        let mut state = self.state();
        let Some(db_idx) = state.database_index(&database_name) else {
            return error_payload(format!("Database {database_name} not found"));
        };
        let Some(store_idx) = state.databases[db_idx].store_index(&store_name) else {
            return error_payload(store_not_found(
                &state.databases[db_idx],
                &store_name,
                &database_name,
            ));
        };
        let store = &mut state.databases[db_idx].stores[store_idx];

        if let Some(key_path) = store.key_path.clone() {
            // Inline keys: the key lives inside the value object.
            let Value::Object(mut object) = value else {
                return error_payload("Value must be an object when store uses inline keys");
            };
            let existing = object.get(&key_path).cloned();
            let final_key = resolve_inline_key(existing.as_ref(), provided_key);
            object.insert(key_path, final_key.clone());
            upsert_record(&mut store.records, final_key, Value::Object(object));
        } else {
            // Out-of-line keys: the key rides beside the value.
            let final_key = provided_key.map_or(Value::Null, coerce_numeric_key);
            upsert_record(&mut store.records, final_key, value);
        }
        json!({ "success": true })
    }

    fn db_delete_record(&self, payload: &Value) -> Value {
        let database_name = str_field(payload, "databaseName");
        let store_name = str_field(payload, "storeName");
        let key = payload.get("key").cloned().unwrap_or(Value::Null);

        let mut state = self.state();
        let Some(db_idx) = state.database_index(&database_name) else {
            return error_payload(format!("Database {database_name} not found"));
        };
        let Some(store_idx) = state.databases[db_idx].store_index(&store_name) else {
            return error_payload(store_not_found(
                &state.databases[db_idx],
                &store_name,
                &database_name,
            ));
        };

        state.databases[db_idx].stores[store_idx]
            .records
            .retain(|r| r.key != key);
        json!({ "success": true })
    }

    fn db_clear_store(&self, payload: &Value) -> Value {
        let database_name = str_field(payload, "databaseName");
        let store_name = str_field(payload, "storeName");

        let mut state = self.state();
        let Some(db_idx) = state.database_index(&database_name) else {
            return error_payload(format!("Database {database_name} not found"));
        };
        let Some(store_idx) = state.databases[db_idx].store_index(&store_name) else {
            return error_payload(store_not_found(
                &state.databases[db_idx],
                &store_name,
                &database_name,
            ));
        };

        state.databases[db_idx].stores[store_idx].records.clear();
        json!({ "success": true })
    }

    // -- response caches ------------------------------------------------------

    fn cache_names(&self) -> Value {
        let state = self.state();
        let names: Vec<&str> = state.caches.iter().map(|c| c.name.as_str()).collect();
        json!({ "success": true, "names": names })
    }

    fn cache_entries(&self, payload: &Value) -> Value {
        let cache_name = str_field(payload, "cacheName");
        let page = usize_field(payload, "page", 0);
        let page_size = usize_field(payload, "pageSize", 50).max(1);

        let mut state = self.state();
        let cache = state.cache_open_or_create(&cache_name);

        let total = cache.entries.len();
        let start = page.saturating_mul(page_size).min(total);
        let end = start.saturating_add(page_size).min(total);
        let entries: Vec<Value> = cache.entries[start..end].iter().map(entry_json).collect();

        json!({
            "success": true,
            "entries": entries,
            "total": total,
            "hasMore": end < total,
        })
    }

    fn cache_delete_entry(&self, payload: &Value) -> Value {
        let cache_name = str_field(payload, "cacheName");
        let request_url = str_field(payload, "requestUrl");

        let mut state = self.state();
        let cache = state.cache_open_or_create(&cache_name);
        cache.entries.retain(|e| e.request.url != request_url);
        json!({ "success": true })
    }

    fn cache_delete(&self, payload: &Value) -> Value {
        let cache_name = str_field(payload, "cacheName");
        let mut state = self.state();
        state.caches.retain(|c| c.name != cache_name);
        json!({ "success": true })
    }

    fn cache_refetch_entry(&self, payload: &Value) -> Value {
        let cache_name = str_field(payload, "cacheName");
        let request_url = str_field(payload, "requestUrl");

        let mut state = self.state();
        let Some(fresh) = state.origin_server.get(&request_url).cloned() else {
            return error_payload("Failed to fetch");
        };

        let entry = CacheEntry {
            request: CachedRequest {
                url: request_url.clone(),
                method: "GET".to_string(),
                headers: BTreeMap::new(),
            },
            response: CachedResponse {
                status: fresh.status,
                status_text: fresh.status_text,
                kind: "basic".to_string(),
                headers: fresh.headers,
                body: fresh.body,
            },
        };

        let cache = state.cache_open_or_create(&cache_name);
        if let Some(existing) = cache.entries.iter_mut().find(|e| e.request.url == request_url) {
            *existing = entry;
        } else {
            cache.entries.push(entry);
        }
        json!({ "success": true })
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn area_of(state: &mut PageState, area: Area) -> &mut BTreeMap<String, String> {
    match area {
        Area::Local => &mut state.local,
        Area::Session => &mut state.session,
    }
}

fn str_field(payload: &Value, field: &str) -> String {
    payload
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn usize_field(payload: &Value, field: &str, default: usize) -> usize {
    payload
        .get(field)
        .and_then(Value::as_u64)
        .map_or(default, |v| v as usize)
}

fn store_not_found(db: &Database, store_name: &str, database_name: &str) -> String {
    format!(
        "Object store \"{store_name}\" not found in database \"{database_name}\". \
         Available stores: {}",
        db.store_names()
    )
}

/// Coerce a numeric-looking string key to a number when the text round-trips
/// exactly; everything else passes through untouched.
fn coerce_numeric_key(key: &Value) -> Value {
    let Value::String(s) = key else {
        return key.clone();
    };
    let trimmed = s.trim();
    if let Ok(n) = trimmed.parse::<i64>() {
        if trimmed == n.to_string() {
            return json!(n);
        }
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if f.is_finite() && trimmed == format!("{f}") {
            return json!(f);
        }
    }
    key.clone()
}

/// Resolve the effective inline key from the value's existing key-path field
/// and the explicitly provided key, matching the platform's type rules: an
/// existing numeric key keeps numeric typing, an existing string key wins
/// stringification, and a fresh key gets numeric coercion.
fn resolve_inline_key(existing: Option<&Value>, provided: Option<&Value>) -> Value {
    match (existing, provided) {
        (Some(existing), Some(provided)) if !provided.is_null() => {
            if existing.is_number() {
                match provided {
                    Value::String(_) => {
                        let coerced = coerce_numeric_key(provided);
                        if coerced.is_number() {
                            coerced
                        } else {
                            existing.clone()
                        }
                    }
                    other => other.clone(),
                }
            } else if existing.is_string() {
                match provided {
                    Value::String(s) => Value::String(s.clone()),
                    Value::Number(n) => Value::String(n.to_string()),
                    other => other.clone(),
                }
            } else {
                provided.clone()
            }
        }
        (Some(existing), _) => existing.clone(),
        (None, Some(provided)) => coerce_numeric_key(provided),
        (None, None) => Value::Null,
    }
}

fn upsert_record(records: &mut Vec<StoredRecord>, key: Value, value: Value) {
    if let Some(existing) = records.iter_mut().find(|r| r.key == key) {
        existing.value = value;
    } else {
        records.push(StoredRecord { key, value });
    }
}

fn entry_json(entry: &CacheEntry) -> Value {
    json!({
        "request": {
            "url": entry.request.url,
            "method": entry.request.method,
            "headers": entry.request.headers,
        },
        "response": {
            "status": entry.response.status,
            "statusText": entry.response.status_text,
            "type": entry.response.kind,
            "headers": entry.response.headers,
            "body": decode_body(&entry.response),
        },
    })
}

/// Decode a cached body by content type: JSON parsed, text as string,
/// anything else summarized.
fn decode_body(response: &CachedResponse) -> Value {
    let content_type = response.content_type().to_ascii_lowercase();
    if content_type.contains("application/json") {
        match serde_json::from_slice::<Value>(&response.body) {
            Ok(parsed) => parsed,
            Err(err) => json!({ "error": err.to_string() }),
        }
    } else if content_type.contains("text/") {
        Value::String(String::from_utf8_lossy(&response.body).into_owned())
    } else {
        json!({
            "type": response.content_type(),
            "size": response.body.len(),
            "preview": "Binary data",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> CapabilityProvider {
        CapabilityProvider::new(Arc::new(Mutex::new(PageState::default())), KvLimits::default())
    }

    fn provider_with(state: PageState) -> CapabilityProvider {
        CapabilityProvider::new(Arc::new(Mutex::new(state)), KvLimits::default())
    }

    fn users_db() -> Database {
        Database {
            name: "app".into(),
            version: 3,
            stores: vec![
                ObjectStore {
                    name: "users".into(),
                    key_path: Some("id".into()),
                    auto_increment: false,
                    indexes: vec![StoreIndex {
                        name: "by_email".into(),
                        key_path: "email".into(),
                        unique: true,
                        multi_entry: false,
                    }],
                    records: vec![
                        StoredRecord {
                            key: json!(1),
                            value: json!({"id": 1, "email": "a@example.com"}),
                        },
                        StoredRecord {
                            key: json!(2),
                            value: json!({"id": 2, "email": "b@example.com"}),
                        },
                    ],
                },
                ObjectStore {
                    name: "notes".into(),
                    key_path: None,
                    auto_increment: true,
                    indexes: vec![],
                    records: vec![],
                },
            ],
        }
    }

    // -- allow-list enforcement ----------------------------------------------

    #[test]
    fn unknown_type_rejected_at_provider() {
        let response = provider().handle("EXFILTRATE", &Value::Null);
        assert_eq!(response, json!({"error": "Invalid message type: EXFILTRATE"}));
    }

    #[test]
    fn coordinator_ops_rejected_at_provider() {
        // Even a valid allow-list name is refused here if it is not a page
        // operation; the provider trusts nothing upstream.
        let response = provider().handle("GET_COOKIES", &Value::Null);
        assert_eq!(response, json!({"error": "Invalid message type: GET_COOKIES"}));
    }

    // -- key/value ------------------------------------------------------------

    #[test]
    fn kv_set_get_remove_clear() {
        let p = provider();
        let set = p.handle("SET_LOCAL_STORAGE", &json!({"key": "theme", "value": "dark"}));
        assert_eq!(set, json!({"success": true}));

        let get = p.handle("GET_LOCAL_STORAGE", &Value::Null);
        assert_eq!(get["items"]["theme"], "dark");

        let remove = p.handle("REMOVE_LOCAL_STORAGE", &json!({"key": "theme"}));
        assert_eq!(remove, json!({"success": true}));
        let get = p.handle("GET_LOCAL_STORAGE", &Value::Null);
        assert_eq!(get["items"], json!({}));

        p.handle("SET_LOCAL_STORAGE", &json!({"key": "a", "value": "1"}));
        p.handle("SET_LOCAL_STORAGE", &json!({"key": "b", "value": "2"}));
        assert_eq!(p.handle("CLEAR_LOCAL_STORAGE", &Value::Null), json!({"success": true}));
        assert_eq!(p.handle("GET_LOCAL_STORAGE", &Value::Null)["items"], json!({}));
    }

    #[test]
    fn kv_areas_are_independent() {
        let p = provider();
        p.handle("SET_LOCAL_STORAGE", &json!({"key": "k", "value": "local"}));
        p.handle("SET_SESSION_STORAGE", &json!({"key": "k", "value": "session"}));
        assert_eq!(p.handle("GET_LOCAL_STORAGE", &Value::Null)["items"]["k"], "local");
        assert_eq!(
            p.handle("GET_SESSION_STORAGE", &Value::Null)["items"]["k"],
            "session"
        );
    }

    #[test]
    fn kv_set_rejects_empty_key_with_exact_text() {
        let response = provider().handle("SET_LOCAL_STORAGE", &json!({"key": "", "value": "v"}));
        assert_eq!(
            response,
            json!({"error": "Invalid key: must be a non-empty string under 10000 characters"})
        );
    }

    #[test]
    fn kv_set_rejects_missing_or_oversized_inputs() {
        let p = provider();
        let no_key = p.handle("SET_LOCAL_STORAGE", &json!({"value": "v"}));
        assert!(no_key["error"].as_str().unwrap().starts_with("Invalid key"));

        let long_key = "k".repeat(10_001);
        let response = p.handle("SET_LOCAL_STORAGE", &json!({"key": long_key, "value": "v"}));
        assert!(response["error"].as_str().unwrap().starts_with("Invalid key"));

        let no_value = p.handle("SET_LOCAL_STORAGE", &json!({"key": "k"}));
        assert_eq!(
            no_value,
            json!({"error": "Invalid value: must be a string under 10MB"})
        );

        let non_string = p.handle("SET_LOCAL_STORAGE", &json!({"key": "k", "value": 42}));
        assert!(non_string["error"].as_str().unwrap().starts_with("Invalid value"));
    }

    #[test]
    fn kv_remove_of_absent_key_succeeds() {
        let response = provider().handle("REMOVE_LOCAL_STORAGE", &json!({"key": "ghost"}));
        assert_eq!(response, json!({"success": true}));
    }

    // -- record databases -----------------------------------------------------

    #[test]
    fn db_list_reports_name_and_version() {
        let p = provider_with(PageState {
            databases: vec![users_db()],
            ..Default::default()
        });
        let response = p.handle("GET_INDEXEDDB_DATABASES", &Value::Null);
        assert_eq!(response["databases"], json!([{"name": "app", "version": 3}]));
    }

    #[test]
    fn db_object_stores_reports_metadata() {
        let p = provider_with(PageState {
            databases: vec![users_db()],
            ..Default::default()
        });
        let response = p.handle("GET_INDEXEDDB_OBJECT_STORES", &json!({"databaseName": "app"}));
        let stores = response["stores"].as_array().unwrap();
        assert_eq!(stores.len(), 2);
        assert_eq!(stores[0]["name"], "users");
        assert_eq!(stores[0]["keyPath"], "id");
        assert_eq!(stores[0]["indexes"][0]["name"], "by_email");
        assert_eq!(stores[0]["indexes"][0]["unique"], true);
        assert_eq!(stores[1]["keyPath"], Value::Null);
        assert_eq!(stores[1]["autoIncrement"], true);
    }

    #[test]
    fn db_unknown_database_error() {
        let response = provider().handle(
            "GET_INDEXEDDB_OBJECT_STORES",
            &json!({"databaseName": "missing"}),
        );
        assert_eq!(response, json!({"error": "Database missing not found"}));
    }

    #[test]
    fn db_unknown_store_error_lists_available_stores() {
        let p = provider_with(PageState {
            databases: vec![users_db()],
            ..Default::default()
        });
        let response = p.handle(
            "GET_INDEXEDDB_RECORDS",
            &json!({"databaseName": "app", "storeName": "orders"}),
        );
        assert_eq!(
            response["error"],
            "Object store \"orders\" not found in database \"app\". \
             Available stores: users, notes"
        );
    }

    #[test]
    fn db_records_pages_with_true_total() {
        let mut db = users_db();
        db.stores[0].records = (0..120)
            .map(|i| StoredRecord {
                key: json!(i),
                value: json!({"id": i}),
            })
            .collect();
        let p = provider_with(PageState {
            databases: vec![db],
            ..Default::default()
        });

        let page0 = p.handle(
            "GET_INDEXEDDB_RECORDS",
            &json!({"databaseName": "app", "storeName": "users"}),
        );
        assert_eq!(page0["records"].as_array().unwrap().len(), 50);
        assert_eq!(page0["total"], 120);
        assert_eq!(page0["hasMore"], true);

        let page2 = p.handle(
            "GET_INDEXEDDB_RECORDS",
            &json!({"databaseName": "app", "storeName": "users", "page": 2, "pageSize": 50}),
        );
        assert_eq!(page2["records"].as_array().unwrap().len(), 20);
        assert_eq!(page2["hasMore"], false);
        assert_eq!(page2["records"][0]["key"], 100);
    }

    #[test]
    fn db_set_record_inline_key_requires_object() {
        let p = provider_with(PageState {
            databases: vec![users_db()],
            ..Default::default()
        });
        let response = p.handle(
            "SET_INDEXEDDB_RECORD",
            &json!({"databaseName": "app", "storeName": "users", "key": 3, "value": "nope"}),
        );
        assert_eq!(
            response,
            json!({"error": "Value must be an object when store uses inline keys"})
        );
    }

    #[test]
    fn db_set_record_inline_key_coerces_numeric_string() {
        let p = provider_with(PageState {
            databases: vec![users_db()],
            ..Default::default()
        });
        // Editing record 2 with a string key "2": the existing numeric key
        // type wins, so this replaces rather than duplicating.
        let response = p.handle(
            "SET_INDEXEDDB_RECORD",
            &json!({
                "databaseName": "app", "storeName": "users",
                "key": "2", "value": {"id": 2, "email": "new@example.com"},
            }),
        );
        assert_eq!(response, json!({"success": true}));

        let records = p.handle(
            "GET_INDEXEDDB_RECORDS",
            &json!({"databaseName": "app", "storeName": "users"}),
        );
        assert_eq!(records["total"], 2);
        assert_eq!(records["records"][1]["value"]["email"], "new@example.com");
        assert_eq!(records["records"][1]["key"], 2);
    }

    #[test]
    fn db_set_record_out_of_line_inserts_and_replaces() {
        let p = provider_with(PageState {
            databases: vec![users_db()],
            ..Default::default()
        });
        p.handle(
            "SET_INDEXEDDB_RECORD",
            &json!({"databaseName": "app", "storeName": "notes", "key": "7", "value": "first"}),
        );
        p.handle(
            "SET_INDEXEDDB_RECORD",
            &json!({"databaseName": "app", "storeName": "notes", "key": 7, "value": "second"}),
        );
        let records = p.handle(
            "GET_INDEXEDDB_RECORDS",
            &json!({"databaseName": "app", "storeName": "notes"}),
        );
        // "7" coerces to 7, so the second write replaced the first.
        assert_eq!(records["total"], 1);
        assert_eq!(records["records"][0]["key"], 7);
        assert_eq!(records["records"][0]["value"], "second");
    }

    #[test]
    fn db_delete_and_clear() {
        let p = provider_with(PageState {
            databases: vec![users_db()],
            ..Default::default()
        });
        p.handle(
            "DELETE_INDEXEDDB_RECORD",
            &json!({"databaseName": "app", "storeName": "users", "key": 1}),
        );
        let records = p.handle(
            "GET_INDEXEDDB_RECORDS",
            &json!({"databaseName": "app", "storeName": "users"}),
        );
        assert_eq!(records["total"], 1);

        p.handle(
            "CLEAR_INDEXEDDB_STORE",
            &json!({"databaseName": "app", "storeName": "users"}),
        );
        let records = p.handle(
            "GET_INDEXEDDB_RECORDS",
            &json!({"databaseName": "app", "storeName": "users"}),
        );
        assert_eq!(records["total"], 0);
    }

    // -- response caches ------------------------------------------------------

    fn cached(url: &str, content_type: &str, body: &[u8]) -> CacheEntry {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), content_type.to_string());
        CacheEntry {
            request: CachedRequest {
                url: url.to_string(),
                method: "GET".to_string(),
                headers: BTreeMap::new(),
            },
            response: CachedResponse {
                status: 200,
                status_text: "OK".to_string(),
                kind: "basic".to_string(),
                headers,
                body: body.to_vec(),
            },
        }
    }

    #[test]
    fn cache_names_lists_caches() {
        let p = provider_with(PageState {
            caches: vec![
                NamedCache { name: "v1".into(), entries: vec![] },
                NamedCache { name: "assets".into(), entries: vec![] },
            ],
            ..Default::default()
        });
        let response = p.handle("GET_CACHE_STORAGE_NAMES", &Value::Null);
        assert_eq!(response["names"], json!(["v1", "assets"]));
    }

    #[test]
    fn cache_entries_decode_bodies_by_content_type() {
        let p = provider_with(PageState {
            caches: vec![NamedCache {
                name: "v1".into(),
                entries: vec![
                    cached("https://site.example/api", "application/json", br#"{"ok":true}"#),
                    cached("https://site.example/page", "text/html", b"<p>hi</p>"),
                    cached("https://site.example/img", "image/png", &[0x89, 0x50]),
                ],
            }],
            ..Default::default()
        });
        let response = p.handle("GET_CACHE_STORAGE_ENTRIES", &json!({"cacheName": "v1"}));
        let entries = response["entries"].as_array().unwrap();
        assert_eq!(entries[0]["response"]["body"], json!({"ok": true}));
        assert_eq!(entries[1]["response"]["body"], "<p>hi</p>");
        assert_eq!(
            entries[2]["response"]["body"],
            json!({"type": "image/png", "size": 2, "preview": "Binary data"})
        );
        assert_eq!(response["total"], 3);
        assert_eq!(response["hasMore"], false);
    }

    #[test]
    fn cache_entries_on_unknown_name_is_empty_success() {
        let p = provider();
        let response = p.handle("GET_CACHE_STORAGE_ENTRIES", &json!({"cacheName": "ghost"}));
        assert_eq!(response["entries"], json!([]));
        assert_eq!(response["total"], 0);
        // Opening created the cache, like the platform API.
        let names = p.handle("GET_CACHE_STORAGE_NAMES", &Value::Null);
        assert_eq!(names["names"], json!(["ghost"]));
    }

    #[test]
    fn cache_malformed_json_body_decodes_to_error_value() {
        let p = provider_with(PageState {
            caches: vec![NamedCache {
                name: "v1".into(),
                entries: vec![cached("https://site.example/api", "application/json", b"{oops")],
            }],
            ..Default::default()
        });
        let response = p.handle("GET_CACHE_STORAGE_ENTRIES", &json!({"cacheName": "v1"}));
        assert!(response["entries"][0]["response"]["body"]["error"].is_string());
        // The operation itself still succeeded.
        assert_eq!(response["success"], true);
    }

    #[test]
    fn cache_delete_entry_and_cache() {
        let p = provider_with(PageState {
            caches: vec![NamedCache {
                name: "v1".into(),
                entries: vec![
                    cached("https://site.example/a", "text/plain", b"a"),
                    cached("https://site.example/b", "text/plain", b"b"),
                ],
            }],
            ..Default::default()
        });
        p.handle(
            "DELETE_CACHE_STORAGE_ENTRY",
            &json!({"cacheName": "v1", "requestUrl": "https://site.example/a"}),
        );
        let response = p.handle("GET_CACHE_STORAGE_ENTRIES", &json!({"cacheName": "v1"}));
        assert_eq!(response["total"], 1);

        p.handle("DELETE_CACHE_STORAGE", &json!({"cacheName": "v1"}));
        let names = p.handle("GET_CACHE_STORAGE_NAMES", &Value::Null);
        assert_eq!(names["names"], json!([]));
    }

    #[test]
    fn cache_refetch_replaces_entry_from_origin() {
        let mut origin_server = HashMap::new();
        origin_server.insert(
            "https://site.example/api".to_string(),
            StoredBody {
                status: 200,
                status_text: "OK".to_string(),
                headers: BTreeMap::from([(
                    "content-type".to_string(),
                    "application/json".to_string(),
                )]),
                body: br#"{"fresh":true}"#.to_vec(),
            },
        );
        let p = provider_with(PageState {
            caches: vec![NamedCache {
                name: "v1".into(),
                entries: vec![cached(
                    "https://site.example/api",
                    "application/json",
                    br#"{"fresh":false}"#,
                )],
            }],
            origin_server,
            ..Default::default()
        });

        let response = p.handle(
            "REFETCH_CACHE_STORAGE_ENTRY",
            &json!({"cacheName": "v1", "requestUrl": "https://site.example/api"}),
        );
        assert_eq!(response, json!({"success": true}));

        let entries = p.handle("GET_CACHE_STORAGE_ENTRIES", &json!({"cacheName": "v1"}));
        assert_eq!(entries["total"], 1);
        assert_eq!(entries["entries"][0]["response"]["body"], json!({"fresh": true}));
    }

    #[test]
    fn cache_refetch_unknown_url_fails() {
        let response = provider().handle(
            "REFETCH_CACHE_STORAGE_ENTRY",
            &json!({"cacheName": "v1", "requestUrl": "https://site.example/gone"}),
        );
        assert_eq!(response, json!({"error": "Failed to fetch"}));
    }
}
