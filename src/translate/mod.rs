//! Translation module: request/error types, the executor seam, and the
//! cache + orchestration layers built on top of it.

pub mod cache;
pub mod normalize;
pub mod service;
pub mod sqlite_cache;
pub mod store;

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Translation request handed to the executor.
#[derive(Debug, Clone, Serialize)]
pub struct TranslateRequest {
    pub request_id: String,
    pub origin: String,
    /// Free-form context, usually the page or document title.
    pub context: String,
    pub service: String,
    pub model: String,
    pub target_lang: String,
    pub style: String,
}

/// Translator trait (adapter for different backends).
/// Implementations should abort promptly once `cancel` fires and report it as an error.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(
        &self,
        request: &TranslateRequest,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String>;
}

/// Errors surfaced to callers of the engine.
/// Cloneable so every rider of a deduplicated request receives the same value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranslateError {
    #[error("translation queue is full")]
    QueueFull,
    #[error("evicted from the queue by higher-priority work")]
    EvictedByPriority,
    #[error("translation cancelled")]
    Cancelled,
    #[error("translation request timed out, please retry later")]
    Timeout,
    #[error("translation service authentication failed, check the key or configuration")]
    AuthFailure,
    #[error("translation service rate limited, please retry later")]
    RateLimited,
    #[error("{0}")]
    Generic(String),
}

impl TranslateError {
    /// Map an underlying failure message onto the surfaced error kind.
    pub fn classify(message: &str) -> Self {
        static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
        let [timeout, auth, rate] = PATTERNS.get_or_init(|| {
            [
                Regex::new(r"(?i)time[d]?\s?out|超时").expect("valid regex"),
                Regex::new(r"(?i)\b401\b|unauthori[sz]ed").expect("valid regex"),
                Regex::new(r"(?i)\b429\b|rate[\s_-]?limit").expect("valid regex"),
            ]
        });

        if timeout.is_match(message) {
            TranslateError::Timeout
        } else if auth.is_match(message) {
            TranslateError::AuthFailure
        } else if rate.is_match(message) {
            TranslateError::RateLimited
        } else if message.trim().is_empty() {
            TranslateError::Generic("translation failed, please retry later".into())
        } else {
            TranslateError::Generic(message.to_string())
        }
    }

    /// Errors produced by the dispatch queue itself; these are never retried.
    pub fn is_queue_rejection(&self) -> bool {
        matches!(
            self,
            TranslateError::QueueFull | TranslateError::EvictedByPriority | TranslateError::Cancelled
        )
    }
}

/// Stub translator: echoes the input with a marker prefix.
pub struct StubTranslator;

#[async_trait]
impl Translator for StubTranslator {
    async fn translate(
        &self,
        request: &TranslateRequest,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        Ok(format!("[stub] {}", request.origin))
    }
}
