//! Command-line interface for storescope.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};

use storescope_core::config::CoreConfig;
use storescope_core::cookies::{CookieStore, session_cookie};
use storescope_core::envelope::{Op, OpFamily};
use storescope_core::host::Host;
use storescope_core::provider::{
    CacheEntry, CachedRequest, CachedResponse, Database, NamedCache, ObjectStore, PageState,
    StoredBody, StoredRecord,
};

#[derive(Parser, Debug)]
#[command(
    name = "ssc",
    version,
    about = "Attach to a page and inspect its storage over the relay"
)]
pub struct Cli {
    /// Config file (defaults to the user config dir).
    #[arg(long, global = true, env = "STORESCOPE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Walk a simulated page through attach, storage edits, navigation, and
    /// detach, printing each relayed response.
    Demo,
    /// List the relayable operation allow-list.
    Ops,
    /// Print the effective configuration as TOML.
    Config,
}

/// Default config location: `<user config dir>/storescope/config.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("storescope").join("config.toml"))
}

/// Load configuration from `--config`, the default path, or defaults.
pub fn load_config(cli: &Cli) -> anyhow::Result<CoreConfig> {
    let path = cli.config.clone().or_else(default_config_path);
    match path {
        Some(path) => CoreConfig::load(&path).context("loading configuration"),
        None => Ok(CoreConfig::default()),
    }
}

/// Dispatch a parsed command line.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = load_config(&cli)?;
    match cli.command {
        Commands::Demo => run_demo(cfg).await,
        Commands::Ops => {
            run_ops();
            Ok(())
        }
        Commands::Config => run_config(&cfg),
    }
}

fn family_label(family: OpFamily) -> &'static str {
    match family {
        OpFamily::KeyValue => "key/value",
        OpFamily::RecordStore => "record store",
        OpFamily::ResponseCache => "response cache",
        OpFamily::Cookie => "cookie",
        OpFamily::Session => "session",
        OpFamily::Internal => "internal",
    }
}

fn run_ops() {
    for &op in Op::ALL {
        println!("{:<32} {}", op.as_str(), family_label(op.family()));
    }
}

fn run_config(cfg: &CoreConfig) -> anyhow::Result<()> {
    print!("{}", toml::to_string_pretty(cfg).context("serializing config")?);
    Ok(())
}

// =============================================================================
// Demo
// =============================================================================

fn demo_page_state() -> PageState {
    let mut state = PageState::default();
    state.local.insert("theme".into(), "dark".into());
    state.local.insert("locale".into(), "en-US".into());
    state.session.insert("csrf".into(), "tok_1f9a".into());

    state.databases.push(Database {
        name: "shop".into(),
        version: 2,
        stores: vec![ObjectStore {
            name: "carts".into(),
            key_path: Some("id".into()),
            auto_increment: false,
            indexes: vec![],
            records: vec![
                StoredRecord {
                    key: json!(1),
                    value: json!({"id": 1, "items": ["mug"], "total": 14.5}),
                },
                StoredRecord {
                    key: json!(2),
                    value: json!({"id": 2, "items": ["boots", "socks"], "total": 89.0}),
                },
            ],
        }],
    });

    state.caches.push(NamedCache {
        name: "api-v1".into(),
        entries: vec![CacheEntry {
            request: CachedRequest {
                url: "https://shop.example/api/products".into(),
                method: "GET".into(),
                headers: Default::default(),
            },
            response: CachedResponse {
                status: 200,
                status_text: "OK".into(),
                kind: "basic".into(),
                headers: [("content-type".to_string(), "application/json".to_string())]
                    .into_iter()
                    .collect(),
                body: br#"{"products": ["mug", "boots"], "stale": true}"#.to_vec(),
            },
        }],
    });
    state.origin_server.insert(
        "https://shop.example/api/products".into(),
        StoredBody {
            status: 200,
            status_text: "OK".into(),
            headers: [("content-type".to_string(), "application/json".to_string())]
                .into_iter()
                .collect(),
            body: br#"{"products": ["mug", "boots", "hats"], "stale": false}"#.to_vec(),
        },
    );
    state
}

fn print_step(label: &str, response: &Value) {
    println!("{label}: {response}");
}

async fn run_demo(cfg: CoreConfig) -> anyhow::Result<()> {
    let mut jar = CookieStore::new();
    jar.insert(session_cookie("sid", "9b2f1c", "shop.example"));

    tracing::info!(
        timeout_secs = cfg.request_timeout_secs,
        "starting demo host"
    );
    let host = Host::start_with_cookies(cfg, jar);
    let target = host.open_page_with_state("https://shop.example", "Example Shop", demo_page_state());
    host.open_page("https://news.example", "Unrelated News");
    host.focus(target);

    let panel = host.open_panel();
    let pings = panel.start_keepalive_pings();

    print_step("attach", &panel.attach(None).await);
    print_step("attached-tab", &panel.attached_tab().await);

    print_step(
        "local-storage",
        &panel.request(Op::GetLocalStorage, Value::Null).await,
    );
    print_step(
        "set-local",
        &panel
            .request(Op::SetLocalStorage, json!({"key": "theme", "value": "light"}))
            .await,
    );
    print_step(
        "session-storage",
        &panel.request(Op::GetSessionStorage, Value::Null).await,
    );

    print_step(
        "databases",
        &panel.request(Op::GetIndexedDbDatabases, Value::Null).await,
    );
    print_step(
        "records",
        &panel
            .request(
                Op::GetIndexedDbRecords,
                json!({"databaseName": "shop", "storeName": "carts"}),
            )
            .await,
    );
    print_step(
        "unknown-store",
        &panel
            .request(
                Op::GetIndexedDbRecords,
                json!({"databaseName": "shop", "storeName": "orders"}),
            )
            .await,
    );

    print_step(
        "cache-entries",
        &panel
            .request(Op::GetCacheStorageEntries, json!({"cacheName": "api-v1"}))
            .await,
    );
    print_step(
        "refetch",
        &panel
            .request(
                Op::RefetchCacheStorageEntry,
                json!({
                    "cacheName": "api-v1",
                    "requestUrl": "https://shop.example/api/products",
                }),
            )
            .await,
    );
    print_step(
        "cache-after-refetch",
        &panel
            .request(Op::GetCacheStorageEntries, json!({"cacheName": "api-v1"}))
            .await,
    );

    print_step("cookies", &panel.request(Op::GetCookies, Value::Null).await);

    print_step(
        "blocked-op",
        &panel.request_named("FORMAT_EVERYTHING", json!({})).await,
    );

    // Navigation to a different origin invalidates the attachment.
    host.navigate(target, "https://elsewhere.example");
    if let Some(notification) = panel.next_notification().await {
        print_step("navigated-away", &notification.payload);
    }
    print_step(
        "post-navigation",
        &panel.request(Op::GetLocalStorage, Value::Null).await,
    );

    print_step("detach", &panel.detach().await);
    pings.abort();
    Ok(())
}
