//! Per-service model lists.
//! Services with a registered provider fetch their list remotely and cache it
//! for an hour per API key; everything else falls back to local presets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::CUSTOM_MODEL;

const CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Fetches the model ids a service currently offers.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn fetch_models(&self, api_key: &str, base_url: Option<&str>) -> anyhow::Result<Vec<String>>;
}

struct CachedList {
    models: Vec<String>,
    fetched_at: Instant,
}

pub struct ModelRegistry {
    providers: RwLock<HashMap<String, Arc<dyn ModelProvider>>>,
    presets: HashMap<String, Vec<String>>,
    /// Keyed by (service, last 8 chars of the API key).
    cache: Mutex<HashMap<(String, String), CachedList>>,
    ttl: Duration,
}

impl ModelRegistry {
    pub fn new(presets: HashMap<String, Vec<String>>) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            presets,
            cache: Mutex::new(HashMap::new()),
            ttl: CACHE_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn register(&self, service: impl Into<String>, provider: Arc<dyn ModelProvider>) {
        self.providers.write().insert(service.into(), provider);
    }

    pub fn unregister(&self, service: &str) {
        self.providers.write().remove(service);
    }

    pub fn has_provider(&self, service: &str) -> bool {
        self.providers.read().contains_key(service)
    }

    /// Models for `service`. Provider results are narrowed to text models
    /// and get the custom-model entry appended; a missing key or a provider
    /// failure yields the presets.
    pub async fn models(&self, service: &str, api_key: Option<&str>, base_url: Option<&str>) -> Vec<String> {
        let provider = self.providers.read().get(service).cloned();
        let (Some(provider), Some(api_key)) = (provider, api_key.filter(|k| !k.is_empty())) else {
            return self.local_models(service);
        };

        let key = cache_key(service, api_key);
        let cached = self.cached(&key);
        let list = match cached {
            Some(list) => list,
            None => match provider.fetch_models(api_key, base_url).await {
                Ok(fetched) => {
                    let list = filter_text_models(fetched);
                    debug!(service, count = list.len(), "fetched model list");
                    self.cache.lock().insert(
                        key,
                        CachedList {
                            models: list.clone(),
                            fetched_at: Instant::now(),
                        },
                    );
                    list
                }
                Err(e) => {
                    warn!(service, error = %e, "model list fetch failed, using local preset");
                    return self.local_models(service);
                }
            },
        };

        let mut models = list;
        models.push(CUSTOM_MODEL.to_string());
        models
    }

    /// Drop cached lists for `service` and fetch again.
    pub async fn refresh(&self, service: &str, api_key: Option<&str>, base_url: Option<&str>) -> Vec<String> {
        self.clear_cache(service);
        self.models(service, api_key, base_url).await
    }

    pub fn clear_cache(&self, service: &str) {
        self.cache.lock().retain(|(cached_service, _), _| cached_service != service);
    }

    fn cached(&self, key: &(String, String)) -> Option<Vec<String>> {
        let cache = self.cache.lock();
        cache
            .get(key)
            .filter(|c| c.fetched_at.elapsed() < self.ttl)
            .map(|c| c.models.clone())
    }

    fn local_models(&self, service: &str) -> Vec<String> {
        match self.presets.get(service) {
            Some(preset) if !preset.is_empty() => preset.clone(),
            _ => vec![CUSTOM_MODEL.to_string()],
        }
    }
}

fn cache_key(service: &str, api_key: &str) -> (String, String) {
    let chars: Vec<char> = api_key.chars().collect();
    let suffix: String = chars[chars.len().saturating_sub(8)..].iter().collect();
    (service.to_string(), suffix)
}

/// Keep chat/text models only, sorted.
pub fn filter_text_models(ids: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut kept: Vec<String> = ids
        .into_iter()
        .filter(|id| {
            let lower = id.to_lowercase();
            !id.is_empty() && !["embedding", "reranker", "bge"].iter().any(|s| lower.contains(s))
        })
        .collect();
    kept.sort();
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ModelProvider for CountingProvider {
        async fn fetch_models(&self, _api_key: &str, _base_url: Option<&str>) -> anyhow::Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("HTTP 500: Internal Server Error");
            }
            Ok(vec!["qwen-7b".into(), "BAAI/bge-m3".into(), "glm-4".into()])
        }
    }

    fn registry() -> ModelRegistry {
        let mut presets = HashMap::new();
        presets.insert("deepseek".to_string(), vec!["deepseek-chat".to_string(), CUSTOM_MODEL.to_string()]);
        ModelRegistry::new(presets)
    }

    fn provider(fail: bool) -> Arc<CountingProvider> {
        Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    #[tokio::test]
    async fn provider_list_is_cached_per_key() {
        let reg = registry();
        let p = provider(false);
        reg.register("silicon", p.clone());

        let first = reg.models("silicon", Some("sk-aaaaaaaa12345678"), None).await;
        assert_eq!(first, vec!["glm-4", "qwen-7b", CUSTOM_MODEL]);
        reg.models("silicon", Some("sk-bbbbbbbb12345678"), None).await;
        assert_eq!(p.calls.load(Ordering::SeqCst), 1, "same key suffix shares a cache entry");

        reg.models("silicon", Some("sk-other-key"), None).await;
        assert_eq!(p.calls.load(Ordering::SeqCst), 2);

        reg.refresh("silicon", Some("sk-other-key"), None).await;
        assert_eq!(p.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn clearing_one_service_keeps_similarly_named_ones() {
        let reg = registry();
        let short = provider(false);
        let long = provider(false);
        reg.register("silicon", short.clone());
        reg.register("silicon_cn", long.clone());

        reg.models("silicon", Some("key"), None).await;
        reg.models("silicon_cn", Some("key"), None).await;
        reg.clear_cache("silicon");

        reg.models("silicon", Some("key"), None).await;
        reg.models("silicon_cn", Some("key"), None).await;
        assert_eq!(short.calls.load(Ordering::SeqCst), 2);
        assert_eq!(long.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entries_are_refetched() {
        let reg = registry().with_ttl(Duration::ZERO);
        let p = provider(false);
        reg.register("silicon", p.clone());
        reg.models("silicon", Some("key"), None).await;
        reg.models("silicon", Some("key"), None).await;
        assert_eq!(p.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn falls_back_to_presets() {
        let reg = registry();
        reg.register("deepseek", provider(true));

        let failed = reg.models("deepseek", Some("key"), None).await;
        assert_eq!(failed, vec!["deepseek-chat", CUSTOM_MODEL]);
        let no_key = reg.models("deepseek", None, None).await;
        assert_eq!(no_key, failed);
        assert_eq!(reg.models("unknown", Some("key"), None).await, vec![CUSTOM_MODEL]);

        reg.unregister("deepseek");
        assert!(!reg.has_provider("deepseek"));
    }

    #[test]
    fn filters_non_chat_models() {
        let ids = ["Qwen/Qwen2-7B", "BAAI/bge-m3", "text-embedding-3", "jina-reranker", "", "glm-4"]
            .map(String::from);
        assert_eq!(filter_text_models(ids), vec!["Qwen/Qwen2-7B", "glm-4"]);
    }
}
