//! lingo-relay: translation request orchestration.
//! Priority dispatch queue, in-flight dedup, bounded retry and a two-tier
//! cache in front of a pluggable translator.

pub mod cancellation;
pub mod config;
pub mod dedup;
pub mod metrics;
pub mod models;
pub mod retry;
pub mod scheduler;
pub mod translate;

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

pub use config::{ConfigSource, EngineConfig, SharedConfig};
pub use scheduler::{Priority, QueueStatus, Scheduler, WorkItem};
pub use translate::service::{EngineStatus, TranslateOptions, TranslationService};
pub use translate::{TranslateError, TranslateRequest, Translator};

use translate::sqlite_cache::SqliteStore;
use translate::store::{MemoryStore, PersistentStore};

/// Log line format for `init_tracing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    /// Read `LINGO_LOG_FORMAT`; anything other than `json` means text.
    pub fn from_env() -> Self {
        Self::parse(&std::env::var("LINGO_LOG_FORMAT").unwrap_or_default())
    }

    fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

/// Install the global fmt subscriber in the format chosen by
/// `LINGO_LOG_FORMAT`. Safe to call more than once.
pub fn init_tracing() {
    init_tracing_with(LogFormat::from_env());
}

pub fn init_tracing_with(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lingo_relay=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    let _ = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

/// Shared engine state: live config plus the service built on it.
pub struct EngineContext {
    pub config: Arc<SharedConfig>,
    pub service: Arc<TranslationService>,
}

/// Wire up an engine from a JSON config file and a SQLite database.
/// A missing or broken config falls back to defaults; an unusable database
/// falls back to in-memory stores.
pub async fn open_engine(config_path: Option<&Path>, db_path: &Path, translator: Arc<dyn Translator>) -> EngineContext {
    let loaded = match config_path {
        Some(path) => EngineConfig::load_from_file(path).unwrap_or_else(|e| {
            warn!(error = %e, path = %path.display(), "config load failed, using defaults");
            EngineConfig::default()
        }),
        None => EngineConfig::default(),
    };
    let engine_config = loaded.clone().apply_env().unwrap_or_else(|e| {
        warn!(error = %e, "environment overrides ignored");
        loaded
    });
    let config = Arc::new(SharedConfig::new(engine_config));

    let (cache_store, counter_store) = open_stores(db_path);
    let service = TranslationService::new(config.clone(), translator, cache_store)
        .with_counter_store(counter_store);
    service.warm_up().await;
    info!(service = %config.snapshot().service, "translation engine ready");

    EngineContext {
        config,
        service: Arc::new(service),
    }
}

fn open_stores(db_path: &Path) -> (Arc<dyn PersistentStore>, Arc<dyn PersistentStore>) {
    let cache = SqliteStore::open(db_path);
    let counters = SqliteStore::open_table(db_path, "counters");
    match (cache, counters) {
        (Ok(cache), Ok(counters)) => (Arc::new(cache), Arc::new(counters)),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, path = %db_path.display(), "sqlite unavailable, using in-memory stores");
            (Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
        }
    }
}
