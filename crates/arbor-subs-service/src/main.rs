// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Headless subscription service over the in-process arbor store.

use anyhow::{Context, Result};
use arbor_app_core::config::ConfigService;
use arbor_app_core::config_port::ConfigPort as _;
use arbor_app_core::prefs::ServicePrefs;
use arbor_config_fs::FsConfigStore;
use arbor_query::schema::DEFAULT_DB;
use arbor_query::{Schema, Schemas, Storage};
use arbor_store::MemoryStore;
use arbor_subs::{DispatcherConfig, ManagerConfig, SubscriptionManager};
use clap::Parser;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Default)]
#[command(author, version, about = "arbor subscription service")]
struct Args {
    /// Schema file (JSON object keyed by database name). Overrides the saved preference.
    #[arg(long)]
    schema: Option<PathBuf>,
    /// Full-refresh period in seconds. Overrides the saved preference.
    #[arg(long)]
    refresh_secs: Option<u64>,
    /// Heartbeat period in seconds. Overrides the saved preference.
    #[arg(long)]
    heartbeat_secs: Option<u64>,
    /// Writes applied before serving (JSON object: database -> array of set payloads).
    #[arg(long)]
    seed: Option<PathBuf>,
    /// GetSpecs subscribed at startup (JSON array).
    #[arg(long)]
    subscribe: Option<PathBuf>,
}

impl Args {
    fn apply(&self, mut prefs: ServicePrefs) -> ServicePrefs {
        if let Some(path) = &self.schema {
            prefs.schema_path = Some(path.clone());
        }
        if let Some(secs) = self.refresh_secs {
            prefs.refresh_secs = secs;
        }
        if let Some(secs) = self.heartbeat_secs {
            prefs.heartbeat_secs = secs;
        }
        prefs
    }
}

fn manager_config(prefs: &ServicePrefs) -> ManagerConfig {
    let dispatch = &prefs.dispatch;
    ManagerConfig {
        heartbeat_interval: prefs.heartbeat(),
        eviction_timeout: prefs.eviction(),
        refresh_interval: prefs.refresh(),
        dispatcher: DispatcherConfig {
            initial_window: Duration::from_millis(dispatch.initial_window_ms),
            slow_window: Duration::from_millis(dispatch.slow_window_ms),
            busy_threshold: dispatch.busy_threshold,
            escalation_rate: dispatch.escalation_rate,
            growth: dispatch.growth,
            ceiling: Duration::from_millis(dispatch.ceiling_ms),
        },
        cache_cap: prefs.cache_cap,
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}

/// Schemas from the schema file plus an empty schema for every other configured database.
fn load_schemas(prefs: &ServicePrefs) -> Result<Schemas> {
    let mut schemas = match &prefs.schema_path {
        Some(path) => read_json::<Schemas>(path)?,
        None => Schemas::default(),
    };
    for db in &prefs.databases {
        if schemas.get(db).is_none() {
            warn!(db = %db, "no schema for database, serving it untyped");
            schemas.insert(db.clone(), Schema::default());
        }
    }
    if schemas.databases().next().is_none() {
        schemas.insert(DEFAULT_DB, Schema::default());
    }
    Ok(schemas)
}

async fn seed(store: &MemoryStore, path: &Path) -> Result<usize> {
    let writes: BTreeMap<String, Vec<Value>> = read_json(path)?;
    let mut applied = 0;
    for (db, payloads) in &writes {
        for payload in payloads {
            let id = store
                .set(db, payload)
                .await
                .with_context(|| format!("seeding {db}"))?;
            debug!(db = %db, id = %id, "seeded");
            applied += 1;
        }
    }
    Ok(applied)
}

async fn log_published(mut published: broadcast::Receiver<arbor_store::Published>) {
    loop {
        match published.recv().await {
            Ok(message) => info!(channel = %message.channel, payload = %message.payload, "published"),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "publish log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    // Config (best-effort)
    let config: Option<ConfigService<FsConfigStore>> = FsConfigStore::new().map(ConfigService::new).ok();
    let saved = config.as_ref().and_then(|c| c.load_prefs());
    let persist_defaults = saved.is_none();
    let prefs = args.apply(saved.unwrap_or_default());

    // Persist defaults once if absent
    if let (Some(cfg), true) = (&config, persist_defaults) {
        cfg.save_prefs(&prefs);
    }

    let schemas = load_schemas(&prefs)?;
    let store = Arc::new(MemoryStore::new(schemas.clone()));
    if let Some(path) = &args.seed {
        let applied = seed(&store, path).await?;
        info!(applied, "seed writes applied");
    }

    let publisher = tokio::spawn(log_published(store.published()));
    let changes = store.changes();
    let storage: Arc<dyn Storage> = store.clone();
    let manager = SubscriptionManager::new(storage, Arc::new(schemas), manager_config(&prefs));
    let (handle, mut task) = arbor_subs::spawn(manager, changes);
    info!(
        databases = ?prefs.databases,
        refresh_secs = prefs.refresh_secs,
        heartbeat_secs = prefs.heartbeat_secs,
        "subscription service running"
    );

    if let Some(path) = &args.subscribe {
        let definitions: Vec<Value> = read_json(path)?;
        for definition in definitions {
            match handle.subscribe(definition).await {
                Ok(id) => info!(id = %id, "subscribed"),
                Err(err) => warn!(error = %err, "subscription rejected"),
            }
        }
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("installing ctrl-c handler")?;
            info!("shutting down");
            task.abort();
        }
        joined = &mut task => {
            joined.context("subscription manager stopped")?;
            warn!("subscription manager exited");
        }
    }
    publisher.abort();
    Ok(())
}
