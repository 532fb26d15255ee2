//! Coordinator-side cookie store, scoped by origin.
//!
//! Cookies are a host capability, not a page capability: the coordinator
//! answers cookie operations directly against this store, scoped to the
//! requesting panel's attachment origin, and nothing cookie-shaped ever
//! crosses into the page context.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use url::Url;

use crate::envelope::error_payload;

/// One cookie, projected onto the wire with the full field set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_date: Option<f64>,
    /// True when the cookie has no expiration (lives with the session).
    pub session: bool,
    pub store_id: String,
    /// True when the cookie only matches its exact host (no domain attribute).
    pub host_only: bool,
}

/// The host's cookie jar.
#[derive(Debug, Default)]
pub struct CookieStore {
    cookies: Vec<Cookie>,
}

impl CookieStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a cookie directly (host/test setup, not an operator path).
    pub fn insert(&mut self, cookie: Cookie) {
        self.upsert(cookie);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// `GET_COOKIES` against an attachment origin.
    #[must_use]
    pub fn get_for_url(&self, origin_url: &str) -> Value {
        if origin_url.is_empty() {
            return error_payload("URL required");
        }
        let Some((host, https)) = host_of(origin_url) else {
            return error_payload("URL required");
        };
        let cookies: Vec<&Cookie> = self
            .cookies
            .iter()
            .filter(|c| domain_matches(c, &host))
            .filter(|c| https || !c.secure)
            .collect();
        json!({ "cookies": cookies })
    }

    /// `SET_COOKIE` against an attachment origin. Payload fields beyond
    /// `name` are optional and take the platform defaults.
    pub fn set_from_payload(&mut self, origin_url: &str, payload: &Value) -> Value {
        let name = payload.get("name").and_then(Value::as_str).unwrap_or("");
        if name.is_empty() || origin_url.is_empty() {
            return error_payload("Name and URL required");
        }
        let Some((host, _)) = host_of(origin_url) else {
            return error_payload("Name and URL required");
        };

        let domain = payload.get("domain").and_then(Value::as_str);
        let expiration_date = payload.get("expirationDate").and_then(Value::as_f64);
        let cookie = Cookie {
            name: name.to_string(),
            value: payload
                .get("value")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            domain: domain.unwrap_or(&host).to_string(),
            path: payload
                .get("path")
                .and_then(Value::as_str)
                .unwrap_or("/")
                .to_string(),
            secure: payload
                .get("secure")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            http_only: payload
                .get("httpOnly")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            same_site: payload
                .get("sameSite")
                .and_then(Value::as_str)
                .unwrap_or("unspecified")
                .to_string(),
            expiration_date,
            session: expiration_date.is_none(),
            store_id: "0".to_string(),
            host_only: domain.is_none(),
        };
        self.upsert(cookie);
        json!({ "success": true })
    }

    /// `REMOVE_COOKIE` against an attachment origin.
    pub fn remove_from_payload(&mut self, origin_url: &str, payload: &Value) -> Value {
        let name = payload.get("name").and_then(Value::as_str).unwrap_or("");
        if name.is_empty() || origin_url.is_empty() {
            return error_payload("Name and URL required");
        }
        let Some((host, _)) = host_of(origin_url) else {
            return error_payload("Name and URL required");
        };
        self.cookies
            .retain(|c| !(c.name == name && domain_matches(c, &host)));
        json!({ "success": true })
    }

    fn upsert(&mut self, cookie: Cookie) {
        if let Some(existing) = self.cookies.iter_mut().find(|c| {
            c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path
        }) {
            *existing = cookie;
        } else {
            self.cookies.push(cookie);
        }
    }
}

/// Extract (host, is-https) from a URL.
fn host_of(url_str: &str) -> Option<(String, bool)> {
    let parsed = Url::parse(url_str).ok()?;
    let host = parsed.host_str()?.to_string();
    Some((host, parsed.scheme() == "https"))
}

/// Standard domain-match: exact host for host-only cookies, suffix match
/// for domain cookies.
fn domain_matches(cookie: &Cookie, host: &str) -> bool {
    let domain = cookie.domain.trim_start_matches('.');
    if cookie.host_only {
        host == domain
    } else {
        host == domain || host.ends_with(&format!(".{domain}"))
    }
}

/// Convenience for tests and seeding: a plain session cookie.
#[must_use]
pub fn session_cookie(name: &str, value: &str, domain: &str) -> Cookie {
    Cookie {
        name: name.to_string(),
        value: value.to_string(),
        domain: domain.to_string(),
        path: "/".to_string(),
        secure: false,
        http_only: false,
        same_site: "unspecified".to_string(),
        expiration_date: None,
        session: true,
        store_id: "0".to_string(),
        host_only: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_roundtrip_with_wire_projection() {
        let mut store = CookieStore::new();
        let set = store.set_from_payload(
            "https://site.example",
            &json!({"name": "sid", "value": "abc", "httpOnly": true}),
        );
        assert_eq!(set, json!({"success": true}));

        let got = store.get_for_url("https://site.example");
        let cookie = &got["cookies"][0];
        assert_eq!(cookie["name"], "sid");
        assert_eq!(cookie["value"], "abc");
        assert_eq!(cookie["domain"], "site.example");
        assert_eq!(cookie["path"], "/");
        assert_eq!(cookie["httpOnly"], true);
        assert_eq!(cookie["sameSite"], "unspecified");
        assert_eq!(cookie["session"], true);
        assert_eq!(cookie["hostOnly"], true);
        assert_eq!(cookie["storeId"], "0");
        assert!(cookie.get("expirationDate").is_none());
    }

    #[test]
    fn set_requires_name() {
        let mut store = CookieStore::new();
        let response = store.set_from_payload("https://site.example", &json!({"value": "x"}));
        assert_eq!(response, json!({"error": "Name and URL required"}));
    }

    #[test]
    fn get_requires_url() {
        let store = CookieStore::new();
        assert_eq!(store.get_for_url(""), json!({"error": "URL required"}));
    }

    #[test]
    fn cookies_are_scoped_to_their_origin() {
        let mut store = CookieStore::new();
        store.insert(session_cookie("a", "1", "site.example"));
        store.insert(session_cookie("b", "2", "other.example"));

        let got = store.get_for_url("https://site.example");
        let names: Vec<&str> = got["cookies"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a"]);
    }

    #[test]
    fn domain_cookie_matches_subdomains() {
        let mut store = CookieStore::new();
        let mut cookie = session_cookie("wide", "1", ".example.com");
        cookie.host_only = false;
        store.insert(cookie);

        assert_eq!(
            store.get_for_url("https://app.example.com")["cookies"]
                .as_array()
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            store.get_for_url("https://example.com")["cookies"]
                .as_array()
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            store.get_for_url("https://notexample.com")["cookies"]
                .as_array()
                .unwrap()
                .len(),
            0
        );
    }

    #[test]
    fn secure_cookies_hidden_from_insecure_origins() {
        let mut store = CookieStore::new();
        let mut cookie = session_cookie("s", "1", "site.example");
        cookie.secure = true;
        store.insert(cookie);

        assert_eq!(
            store.get_for_url("http://site.example")["cookies"]
                .as_array()
                .unwrap()
                .len(),
            0
        );
        assert_eq!(
            store.get_for_url("https://site.example")["cookies"]
                .as_array()
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn set_replaces_same_name_domain_path() {
        let mut store = CookieStore::new();
        store.set_from_payload("https://site.example", &json!({"name": "k", "value": "1"}));
        store.set_from_payload("https://site.example", &json!({"name": "k", "value": "2"}));
        let got = store.get_for_url("https://site.example");
        assert_eq!(got["cookies"].as_array().unwrap().len(), 1);
        assert_eq!(got["cookies"][0]["value"], "2");
    }

    #[test]
    fn remove_deletes_matching_cookie() {
        let mut store = CookieStore::new();
        store.insert(session_cookie("gone", "1", "site.example"));
        store.insert(session_cookie("stays", "2", "site.example"));

        let response =
            store.remove_from_payload("https://site.example", &json!({"name": "gone"}));
        assert_eq!(response, json!({"success": true}));
        assert_eq!(store.len(), 1);

        let response = store.remove_from_payload("https://site.example", &json!({}));
        assert_eq!(response, json!({"error": "Name and URL required"}));
    }

    #[test]
    fn expiring_cookie_is_not_session() {
        let mut store = CookieStore::new();
        store.set_from_payload(
            "https://site.example",
            &json!({"name": "e", "expirationDate": 1890000000.0}),
        );
        let got = store.get_for_url("https://site.example");
        assert_eq!(got["cookies"][0]["session"], false);
        assert_eq!(got["cookies"][0]["expirationDate"], 1890000000.0);
    }
}
