//! Engine configuration.
//! Every component reads a fresh snapshot per operation, so updates made
//! through `SharedConfig::update` take effect on the next call.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Model value meaning "use the user-supplied custom model for this service".
pub const CUSTOM_MODEL: &str = "custom";

/// Snapshot of everything the engine consumes from the outside.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Active translation service id.
    pub service: String,
    /// Selected model per service id.
    pub models: HashMap<String, String>,
    /// Custom model names, used when `models[service] == CUSTOM_MODEL`.
    pub custom_models: HashMap<String, String>,
    pub target_lang: String,
    pub style: String,
    pub use_cache: bool,
    pub max_concurrent_translations: usize,
    pub always_translate: bool,
    /// Pending-queue capacity as a multiple of `max_concurrent_translations`.
    pub queue_length_factor: usize,
    /// Entry ceiling for the persistent cache tier.
    pub cache_max_entries: usize,
    pub cache_cleanup_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            service: "microsoft".into(),
            models: HashMap::new(),
            custom_models: HashMap::new(),
            target_lang: "zh-Hans".into(),
            style: "0".into(),
            use_cache: true,
            max_concurrent_translations: 6,
            always_translate: false,
            queue_length_factor: 5,
            cache_max_entries: 2000,
            cache_cleanup_interval_secs: 24 * 3600,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
}

impl EngineConfig {
    /// Load a JSON config file. Missing fields fall back to defaults.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        info!(path = %path.display(), service = %config.service, "config loaded");
        Ok(config)
    }

    /// Overlay `LINGO_*` environment variables on top of `self`.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(v) = std::env::var("LINGO_SERVICE") {
            self.service = v;
        }
        if let Ok(v) = std::env::var("LINGO_TARGET_LANG") {
            self.target_lang = v;
        }
        if let Ok(v) = std::env::var("LINGO_STYLE") {
            self.style = v;
        }
        if let Ok(v) = std::env::var("LINGO_USE_CACHE") {
            self.use_cache = parse_env("LINGO_USE_CACHE", v)?;
        }
        if let Ok(v) = std::env::var("LINGO_ALWAYS_TRANSLATE") {
            self.always_translate = parse_env("LINGO_ALWAYS_TRANSLATE", v)?;
        }
        if let Ok(v) = std::env::var("LINGO_MAX_CONCURRENT") {
            self.max_concurrent_translations = parse_env("LINGO_MAX_CONCURRENT", v)?;
        }
        if let Ok(v) = std::env::var("LINGO_CACHE_MAX_ENTRIES") {
            self.cache_max_entries = parse_env("LINGO_CACHE_MAX_ENTRIES", v)?;
        }
        Ok(self)
    }

    /// Model identity for the active service, resolving the custom sentinel.
    pub fn active_model(&self) -> String {
        match self.models.get(&self.service) {
            Some(m) if m == CUSTOM_MODEL => self
                .custom_models
                .get(&self.service)
                .cloned()
                .unwrap_or_default(),
            Some(m) => m.clone(),
            None => String::new(),
        }
    }

    /// Concurrency ceiling; a configured zero is treated as the default of 6.
    pub fn max_concurrent(&self) -> usize {
        if self.max_concurrent_translations == 0 {
            6
        } else {
            self.max_concurrent_translations
        }
    }

    pub fn max_queue_length(&self) -> usize {
        self.max_concurrent() * self.queue_length_factor.max(1)
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| {
        warn!(var, value = %value, "invalid environment override");
        ConfigError::InvalidEnv { var, value }
    })
}

/// Read-only configuration oracle consumed by the engine.
pub trait ConfigSource: Send + Sync {
    fn snapshot(&self) -> EngineConfig;
}

/// Live, updatable configuration.
pub struct SharedConfig {
    inner: RwLock<EngineConfig>,
}

impl SharedConfig {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            inner: RwLock::new(config),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut EngineConfig)) {
        let mut guard = self.inner.write();
        f(&mut guard);
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl ConfigSource for SharedConfig {
    fn snapshot(&self) -> EngineConfig {
        self.inner.read().clone()
    }
}
