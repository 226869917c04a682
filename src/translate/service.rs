//! Translation orchestrator.
//! Pipeline per request: whitespace fast path -> same-language check ->
//! cache -> dedup -> priority queue -> retry around the translator.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::cache::CacheStore;
use super::normalize::{same_language, strip_whitespace, LanguageDetector, WhatlangDetector};
use super::store::PersistentStore;
use super::{TranslateError, TranslateRequest, Translator};
use crate::config::ConfigSource;
use crate::dedup::{self, DeduplicationRegistrar};
use crate::metrics::{metric_names, MetricsRegistry, RequestCounter};
use crate::retry::{self, RetryPolicy};
use crate::scheduler::{Priority, QueueStatus, Scheduler, WorkItem};

const COUNT_PERSIST_DEBOUNCE: Duration = Duration::from_millis(800);

/// Per-call options.
#[derive(Debug, Clone)]
pub struct TranslateOptions {
    pub priority: Priority,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
    /// None follows the configured `use_cache`.
    pub use_cache: Option<bool>,
    /// Skip the same-language check.
    pub force_translate: bool,
    /// Caller-side cancellation of the queued work.
    pub cancel: Option<CancellationToken>,
}

impl Default for TranslateOptions {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            priority: Priority::Normal,
            max_retries: retry.max_retries,
            retry_delay: retry.retry_delay,
            timeout: retry.timeout,
            use_cache: None,
            force_translate: false,
            cancel: None,
        }
    }
}

impl TranslateOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn forced(mut self) -> Self {
        self.force_translate = true;
        self
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            timeout: self.timeout,
        }
    }
}

/// Queue snapshot plus the number of distinct requests in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    #[serde(flatten)]
    pub queue: QueueStatus,
    pub in_flight_requests: usize,
}

pub struct TranslationService {
    config: Arc<dyn ConfigSource>,
    translator: Arc<dyn Translator>,
    detector: Arc<dyn LanguageDetector>,
    cache: Arc<CacheStore>,
    scheduler: Arc<Scheduler>,
    dedup: DeduplicationRegistrar,
    counter: Arc<RequestCounter>,
}

impl TranslationService {
    pub fn new(
        config: Arc<dyn ConfigSource>,
        translator: Arc<dyn Translator>,
        persistent: Arc<dyn PersistentStore>,
    ) -> Self {
        let metrics = Arc::new(MetricsRegistry::new());
        Self {
            cache: Arc::new(CacheStore::new(persistent, Arc::clone(&config))),
            scheduler: Arc::new(Scheduler::new(Arc::clone(&config), metrics)),
            config,
            translator,
            detector: Arc::new(WhatlangDetector),
            dedup: DeduplicationRegistrar::new(),
            counter: Arc::new(RequestCounter::new(None, COUNT_PERSIST_DEBOUNCE)),
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn LanguageDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Persist the request count in `store`. Use a store separate from the cache's.
    pub fn with_counter_store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.counter = Arc::new(RequestCounter::new(Some(store), COUNT_PERSIST_DEBOUNCE));
        self
    }

    /// Restore persisted state (request count, memory cache tier) and run
    /// the periodic cache cleanup if it is due.
    pub async fn warm_up(&self) {
        self.counter.load().await;
        self.cache.preload().await;
        self.cache.scheduled_cleanup().await;
    }

    /// Translate `origin` into the configured target language.
    /// `context` is free-form (usually the page title) and only
    /// distinguishes otherwise identical requests.
    pub async fn translate_text(
        &self,
        origin: &str,
        context: &str,
        options: TranslateOptions,
    ) -> Result<String, TranslateError> {
        if origin.trim().is_empty() {
            return Ok(origin.to_string());
        }

        let config = self.config.snapshot();
        if !options.force_translate && !config.always_translate {
            let detected = self.detector.detect(&strip_whitespace(origin));
            if detected.is_some_and(|lang| same_language(&lang, &config.target_lang)) {
                debug!(target_lang = %config.target_lang, "already in target language");
                return Ok(origin.to_string());
            }
        }

        let use_cache = options.use_cache.unwrap_or(config.use_cache);
        if use_cache {
            if let Some(hit) = self.cache.get(origin).await {
                debug!("cache hit");
                return Ok(hit);
            }
        }

        let model = config.active_model();
        let fingerprint = dedup::fingerprint(
            &config.service,
            &model,
            &config.target_lang,
            &config.style,
            context,
            origin,
        );
        let request = TranslateRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            origin: origin.to_string(),
            context: context.to_string(),
            service: config.service.clone(),
            model,
            target_lang: config.target_lang.clone(),
            style: config.style.clone(),
        };
        let span = tracing::info_span!("translate", request_id = %request.request_id, service = %request.service);

        let shared = self.dedup.get_or_register(&fingerprint, || {
            let translator = Arc::clone(&self.translator);
            let cache = Arc::clone(&self.cache);
            let counter = Arc::clone(&self.counter);
            let metrics = Arc::clone(self.scheduler.metrics());
            let policy = options.retry_policy();
            let issued_under = config.clone();

            let mut item = WorkItem::new(options.priority, move |token| {
                async move {
                    let count = counter.increment();
                    debug!(count, "dispatching to translator");
                    let timing = metrics.span(metric_names::TRANSLATE_DONE);
                    let result = retry::run(&request.origin, policy, &token, || {
                        translator.translate(&request, &token)
                    })
                    .await;
                    timing.finish();

                    let translated = result?;
                    if use_cache && translated != request.origin {
                        cache.set_with(&issued_under, &request.origin, &translated).await;
                    }
                    Ok::<_, TranslateError>(translated)
                }
                .instrument(span)
            })
            .with_fingerprint(fingerprint.clone());
            if let Some(signal) = options.cancel.clone() {
                item = item.with_signal(signal);
            }
            self.scheduler.submit(item)
        });

        let result = shared.await;
        if let Err(e) = &result {
            if e.is_queue_rejection() {
                debug!(error = %e, "request not executed");
            } else {
                warn!(error = %e, "translation failed");
            }
        }
        result
    }

    /// Reject pending work, signal running work, and forget in-flight
    /// registrations so later requests start fresh.
    pub fn cancel_all(&self) {
        self.scheduler.cancel_all();
        let in_flight = self.dedup.len();
        self.dedup.clear();
        info!(in_flight, "translation engine reset");
    }

    /// Reject pending work only. Returns how many items were dropped.
    pub fn clear_queue(&self) -> usize {
        self.scheduler.clear_pending()
    }

    pub fn get_status(&self) -> EngineStatus {
        EngineStatus {
            queue: self.scheduler.status(),
            in_flight_requests: self.dedup.len(),
        }
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        self.scheduler.metrics()
    }

    /// Requests that actually reached the translator.
    pub fn request_count(&self) -> u64 {
        self.counter.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, SharedConfig};
    use crate::translate::store::MemoryStore;
    use crate::translate::StubTranslator;

    struct Fixed(&'static str);

    impl LanguageDetector for Fixed {
        fn detect(&self, _text: &str) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    fn service(detected: &'static str) -> TranslationService {
        let config = Arc::new(SharedConfig::new(EngineConfig::default()));
        TranslationService::new(config, Arc::new(StubTranslator), Arc::new(MemoryStore::new()))
            .with_detector(Arc::new(Fixed(detected)))
    }

    #[tokio::test]
    async fn stub_round_trip_counts_request() {
        let svc = service("en");
        let out = svc.translate_text("hello", "title", TranslateOptions::default()).await;
        assert_eq!(out.unwrap(), "[stub] hello");
        assert_eq!(svc.request_count(), 1);
        assert_eq!(svc.get_status().in_flight_requests, 0);
    }

    #[tokio::test]
    async fn target_language_input_is_returned_as_is() {
        let svc = service("zh-Hans");
        let out = svc.translate_text("你好", "", TranslateOptions::default()).await;
        assert_eq!(out.unwrap(), "你好");
        assert_eq!(svc.request_count(), 0);

        let forced = svc.translate_text("你好", "", TranslateOptions::default().forced()).await;
        assert_eq!(forced.unwrap(), "[stub] 你好");
    }

    #[tokio::test]
    async fn caller_cancel_before_submit_is_reported() {
        let svc = service("en");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let options = TranslateOptions {
            cancel: Some(cancel),
            ..TranslateOptions::default()
        };
        let out = svc.translate_text("hello", "", options).await;
        assert_eq!(out, Err(TranslateError::Cancelled));
        assert_eq!(svc.request_count(), 0);
    }
}
