//! Two-tier translation cache.
//! L1: in-process LRU, bounded by the same ceiling as L2.
//! L2: a `PersistentStore`, pruned oldest-write-first down to the ceiling.
//! Key: style _ service _ model _ target_lang _ text, so a config change
//! naturally stops matching older entries.
//! Every public operation is a no-op while `use_cache` is off.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::store::PersistentStore;
use crate::config::{ConfigSource, EngineConfig};

pub struct CacheStore {
    memory: Mutex<LruCache<String, String>>,
    persistent: Arc<dyn PersistentStore>,
    config: Arc<dyn ConfigSource>,
    last_cleanup: Mutex<Option<Instant>>,
    /// Serializes limit enforcement so concurrent triggers don't over-delete.
    prune_lock: tokio::sync::Mutex<()>,
}

impl CacheStore {
    pub fn new(persistent: Arc<dyn PersistentStore>, config: Arc<dyn ConfigSource>) -> Self {
        let capacity = capacity_of(&config.snapshot());
        Self {
            memory: Mutex::new(LruCache::new(capacity)),
            persistent,
            config,
            last_cleanup: Mutex::new(None),
            prune_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Compute the cache key for `text` under the given configuration.
    pub fn compute_key(config: &EngineConfig, text: &str) -> String {
        [
            config.style.as_str(),
            config.service.as_str(),
            config.active_model().as_str(),
            config.target_lang.as_str(),
            text,
        ]
        .join("_")
    }

    /// Returns the config snapshot if caching is enabled.
    fn enabled(&self) -> Option<EngineConfig> {
        let config = self.config.snapshot();
        config.use_cache.then_some(config)
    }

    /// Look up `origin`. Memory tier first, then the persistent tier.
    /// A persistent hit is not promoted into memory.
    pub async fn get(&self, origin: &str) -> Option<String> {
        let config = self.enabled()?;
        let key = Self::compute_key(&config, origin);

        let hit = self.memory.lock().get(&key).cloned();
        if let Some(value) = hit {
            debug!("memory tier hit");
            return Some(value);
        }

        match self.persistent.get(&key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "persistent tier get failed, memory tier only");
                None
            }
        }
    }

    /// Copy the whole persistent tier into memory. Meant to run once at startup.
    pub async fn preload(&self) -> usize {
        if self.enabled().is_none() {
            return 0;
        }
        match self.persistent.all().await {
            Ok(entries) => {
                let mut memory = self.memory.lock();
                let loaded = entries.len();
                // Oldest first, so the most recent writes end up most recently used.
                for entry in entries {
                    memory.put(entry.key, entry.value);
                }
                info!(loaded, "cache preloaded");
                loaded
            }
            Err(e) => {
                warn!(error = %e, "cache preload failed");
                0
            }
        }
    }

    /// Store `origin -> value`. Memory is updated regardless of how the
    /// persistent write goes; limit enforcement runs as a detached task.
    pub async fn set(self: &Arc<Self>, origin: &str, value: &str) {
        let config = self.config.snapshot();
        self.set_with(&config, origin, value).await;
    }

    /// `set`, keyed under `config` rather than the current settings.
    /// Used for results of requests issued under an earlier snapshot.
    pub async fn set_with(self: &Arc<Self>, config: &EngineConfig, origin: &str, value: &str) {
        if self.enabled().is_none() {
            return;
        }
        let key = Self::compute_key(config, origin);

        self.memory.lock().put(key.clone(), value.to_string());

        if let Err(e) = self.persistent.set(&key, value).await {
            warn!(error = %e, "persistent tier set failed, kept in memory only");
        }

        let this = Arc::clone(self);
        spawn_detached(async move {
            this.enforce_limit().await;
        });
    }

    /// Store both directions: `origin -> translated` and `translated -> origin`.
    /// The two writes succeed or fail independently.
    pub async fn set_dual(self: &Arc<Self>, origin: &str, translated: &str) {
        tokio::join!(self.set(origin, translated), self.set(translated, origin));
    }

    /// Delete `origin` and its counterpart entry from both tiers.
    pub async fn remove(&self, origin: &str) {
        let Some(config) = self.enabled() else { return };
        let key = Self::compute_key(&config, origin);

        let in_memory = self.memory.lock().peek(&key).cloned();
        let counterpart = match in_memory {
            Some(v) => Some(v),
            None => self.persistent.get(&key).await.unwrap_or_else(|e| {
                warn!(error = %e, "persistent tier get failed during remove");
                None
            }),
        };
        let Some(counterpart) = counterpart else { return };
        let reverse_key = Self::compute_key(&config, &counterpart);

        {
            let mut memory = self.memory.lock();
            memory.pop(&key);
            memory.pop(&reverse_key);
        }
        for k in [&key, &reverse_key] {
            if let Err(e) = self.persistent.delete(k).await {
                warn!(error = %e, "persistent tier delete failed");
            }
        }
    }

    /// Drop every entry in both tiers.
    pub async fn clear(&self) {
        if self.enabled().is_none() {
            return;
        }
        self.memory.lock().clear();
        if let Err(e) = self.persistent.clear().await {
            warn!(error = %e, "persistent tier clear failed");
        }
        info!("cache cleared");
    }

    /// Prune the persistent tier to the configured ceiling, oldest writes first.
    /// Returns the number of entries removed.
    pub async fn enforce_limit(&self) -> usize {
        let Some(config) = self.enabled() else { return 0 };
        let _guard = self.prune_lock.lock().await;

        {
            let capacity = capacity_of(&config);
            let mut memory = self.memory.lock();
            if memory.cap() != capacity {
                memory.resize(capacity);
            }
        }

        let count = match self.persistent.count().await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "cache cleanup failed");
                return 0;
            }
        };
        if count <= config.cache_max_entries {
            return 0;
        }
        match self.persistent.prune_oldest(config.cache_max_entries).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(error = %e, "cache cleanup failed");
                0
            }
        }
    }

    /// `enforce_limit`, throttled to once per cleanup interval.
    /// Returns whether a cleanup ran.
    pub async fn scheduled_cleanup(&self) -> bool {
        let Some(config) = self.enabled() else { return false };
        let interval = Duration::from_secs(config.cache_cleanup_interval_secs);
        {
            let mut last = self.last_cleanup.lock();
            if matches!(*last, Some(at) if at.elapsed() < interval) {
                return false;
            }
            *last = Some(Instant::now());
        }
        let removed = self.enforce_limit().await;
        debug!(removed, "scheduled cache cleanup");
        true
    }

    /// Number of entries currently held in memory.
    pub fn memory_len(&self) -> usize {
        self.memory.lock().len()
    }
}

fn capacity_of(config: &EngineConfig) -> NonZeroUsize {
    NonZeroUsize::new(config.cache_max_entries).unwrap_or(NonZeroUsize::MIN)
}

/// Run `fut` without awaiting it. Callers log their own failures.
fn spawn_detached<F>(fut: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(fut);
        }
        Err(_) => debug!("no runtime, detached cache task skipped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SharedConfig;
    use crate::translate::store::MemoryStore;

    fn cache_with(
        config: EngineConfig,
    ) -> (Arc<CacheStore>, Arc<MemoryStore>, Arc<SharedConfig>) {
        let store = Arc::new(MemoryStore::new());
        let config = Arc::new(SharedConfig::new(config));
        let cache = Arc::new(CacheStore::new(
            store.clone() as Arc<dyn PersistentStore>,
            config.clone() as Arc<dyn ConfigSource>,
        ));
        (cache, store, config)
    }

    async fn wait_for_count(store: &MemoryStore, expected: usize) -> usize {
        for _ in 0..200 {
            let n = store.count().await.unwrap();
            if n == expected {
                return n;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        store.count().await.unwrap()
    }

    #[test]
    fn key_joins_style_service_model_target_and_text() {
        let mut config = EngineConfig::default();
        config.style = "1".into();
        config.service = "deepseek".into();
        config.models.insert("deepseek".into(), "deepseek-chat".into());
        config.target_lang = "en".into();
        assert_eq!(
            CacheStore::compute_key(&config, "你好"),
            "1_deepseek_deepseek-chat_en_你好"
        );
    }

    #[tokio::test]
    async fn dual_write_resolves_both_directions() {
        let (cache, _, _) = cache_with(EngineConfig::default());
        cache.set_dual("hello", "你好").await;
        assert_eq!(cache.get("hello").await.as_deref(), Some("你好"));
        assert_eq!(cache.get("你好").await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn persistent_hit_is_returned_but_not_promoted() {
        let (cache, store, config) = cache_with(EngineConfig::default());
        let key = CacheStore::compute_key(&config.snapshot(), "bonjour");
        store.set(&key, "hello").await.unwrap();

        assert_eq!(cache.get("bonjour").await.as_deref(), Some("hello"));
        assert_eq!(cache.memory_len(), 0);

        assert_eq!(cache.preload().await, 1);
        assert_eq!(cache.memory_len(), 1);
    }

    #[tokio::test]
    async fn persistent_failure_falls_back_to_memory() {
        let (cache, store, _) = cache_with(EngineConfig::default());
        store.set_failing(true);
        cache.set("hello", "你好").await;
        assert_eq!(cache.get("hello").await.as_deref(), Some("你好"));
    }

    #[tokio::test]
    async fn remove_deletes_both_directions() {
        let (cache, store, _) = cache_with(EngineConfig::default());
        cache.set_dual("hello", "你好").await;
        cache.remove("hello").await;
        assert_eq!(cache.get("hello").await, None);
        assert_eq!(cache.get("你好").await, None);
        assert_eq!(store.count().await.unwrap(), 0);

        // Absent origin is a no-op.
        cache.remove("missing").await;
    }

    #[tokio::test]
    async fn kill_switch_disables_every_operation() {
        let (cache, store, config) = cache_with(EngineConfig::default());
        cache.set("hello", "你好").await;
        config.update(|c| c.use_cache = false);

        assert_eq!(cache.get("hello").await, None);
        cache.set("other", "value").await;
        cache.clear().await;
        assert_eq!(cache.enforce_limit().await, 0);
        assert_eq!(store.count().await.unwrap(), 1);

        config.update(|c| c.use_cache = true);
        assert_eq!(cache.get("hello").await.as_deref(), Some("你好"));
        assert_eq!(cache.get("other").await, None);
    }

    #[tokio::test]
    async fn changing_target_language_misses_old_entries() {
        let (cache, _, config) = cache_with(EngineConfig::default());
        cache.set("hello", "你好").await;
        config.update(|c| c.target_lang = "ja".into());
        assert_eq!(cache.get("hello").await, None);
    }

    #[tokio::test]
    async fn write_under_earlier_snapshot_keeps_its_settings() {
        let (cache, _, config) = cache_with(EngineConfig::default());
        let issued_under = config.snapshot();
        config.update(|c| c.target_lang = "ja".into());

        cache.set_with(&issued_under, "hello", "你好").await;
        assert_eq!(cache.get("hello").await, None);

        config.update(|c| c.target_lang = issued_under.target_lang.clone());
        assert_eq!(cache.get("hello").await.as_deref(), Some("你好"));
    }

    #[tokio::test]
    async fn eviction_keeps_the_most_recent_ceiling_entries() {
        let mut config = EngineConfig::default();
        config.cache_max_entries = 10;
        let (cache, store, config) = cache_with(config);

        for i in 0..25 {
            cache.set(&format!("text-{i:02}"), "v").await;
        }
        assert_eq!(wait_for_count(&store, 10).await, 10);

        let snapshot = config.snapshot();
        let retained: Vec<String> = store.all().await.unwrap().into_iter().map(|e| e.key).collect();
        let expected: Vec<String> = (15..25)
            .map(|i| CacheStore::compute_key(&snapshot, &format!("text-{i:02}")))
            .collect();
        assert_eq!(retained, expected);
    }

    #[tokio::test]
    async fn scheduled_cleanup_is_throttled() {
        let (cache, _, _) = cache_with(EngineConfig::default());
        assert!(cache.scheduled_cleanup().await);
        assert!(!cache.scheduled_cleanup().await);
    }

    #[tokio::test]
    async fn clear_empties_both_tiers() {
        let (cache, store, _) = cache_with(EngineConfig::default());
        cache.set_dual("hello", "你好").await;
        cache.clear().await;
        assert_eq!(cache.memory_len(), 0);
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
