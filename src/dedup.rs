//! In-flight request deduplication.
//! One shared future per fingerprint; later callers ride along on it.
//! The registration is inserted before the work starts and removed when the
//! work settles, whichever way it settles.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::scheduler::TaskResult;
use crate::translate::TranslateError;

pub type SharedResult = Shared<BoxFuture<'static, TaskResult>>;

struct Registration {
    /// Distinguishes this registration from a later one under the same fingerprint.
    token: u64,
    future: SharedResult,
}

#[derive(Default)]
pub struct DeduplicationRegistrar {
    in_flight: Arc<Mutex<HashMap<String, Registration>>>,
    next_token: AtomicU64,
}

impl DeduplicationRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the pending future for `fingerprint`, or start one with `factory`.
    /// Check-and-insert happens under one lock, so only one caller can be first.
    /// The work is driven by its own task, so it settles (and unregisters) even
    /// if every caller stops polling.
    pub fn get_or_register<F, Fut>(&self, fingerprint: &str, factory: F) -> SharedResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let mut in_flight = self.in_flight.lock();
        if let Some(existing) = in_flight.get(fingerprint) {
            debug!(fingerprint, "riding along on in-flight request");
            return existing.future.clone();
        }

        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let work = factory();
        let registry = Arc::clone(&self.in_flight);
        let key = fingerprint.to_string();

        let task = tokio::spawn(async move {
            let result = work.await;
            let mut in_flight = registry.lock();
            if in_flight.get(&key).is_some_and(|r| r.token == token) {
                in_flight.remove(&key);
            }
            result
        });

        let future = task
            .map(|joined| {
                joined.unwrap_or_else(|e| {
                    warn!(error = %e, "deduplicated task failed to complete");
                    Err(TranslateError::Generic("translation task aborted".into()))
                })
            })
            .boxed()
            .shared();

        in_flight.insert(
            fingerprint.to_string(),
            Registration {
                token,
                future: future.clone(),
            },
        );
        future
    }

    /// Number of distinct fingerprints currently in flight.
    pub fn len(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.in_flight.lock().contains_key(fingerprint)
    }

    /// Forget every registration. Work already started still settles for
    /// the callers holding its future.
    pub fn clear(&self) {
        self.in_flight.lock().clear();
    }
}

/// Stable fingerprint for logically identical requests.
pub fn fingerprint(
    service: &str,
    model: &str,
    target_lang: &str,
    style: &str,
    context: &str,
    origin: &str,
) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in [service, model, target_lang, style, context, origin] {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn same_fingerprint_runs_once_and_shares_outcome() {
        let registrar = DeduplicationRegistrar::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = CancellationToken::new();

        let make = || {
            let calls = Arc::clone(&calls);
            let gate = gate.clone();
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                gate.cancelled().await;
                Ok::<_, TranslateError>("你好".to_string())
            }
        };

        let first = registrar.get_or_register("fp", make());
        let second = registrar.get_or_register("fp", make());
        assert_eq!(registrar.len(), 1);

        gate.cancel();
        let (a, b) = tokio::join!(first, second);
        assert_eq!(a.unwrap(), "你好");
        assert_eq!(b.unwrap(), "你好");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registrar.is_empty());
    }

    #[tokio::test]
    async fn failure_is_shared_and_unregisters() {
        let registrar = DeduplicationRegistrar::new();
        let gate = CancellationToken::new();
        let g = gate.clone();
        let first = registrar.get_or_register("fp", move || async move {
            g.cancelled().await;
            Err(TranslateError::RateLimited)
        });
        let second = registrar.get_or_register("fp", || async { Ok("never".to_string()) });

        gate.cancel();
        assert_eq!(first.await, Err(TranslateError::RateLimited));
        assert_eq!(second.await, Err(TranslateError::RateLimited));
        assert!(!registrar.contains("fp"));

        let third = registrar.get_or_register("fp", || async { Ok("fresh".to_string()) });
        assert_eq!(third.await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn unpolled_work_still_unregisters() {
        let registrar = DeduplicationRegistrar::new();
        drop(registrar.get_or_register("fp", || async { Ok("x".to_string()) }));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(registrar.is_empty());
    }

    #[tokio::test]
    async fn cleared_registration_is_not_removed_by_stale_work() {
        let registrar = DeduplicationRegistrar::new();
        let gate = CancellationToken::new();
        let g = gate.clone();
        let old = registrar.get_or_register("fp", move || async move {
            g.cancelled().await;
            Ok("old".to_string())
        });
        registrar.clear();

        let second_gate = CancellationToken::new();
        let g = second_gate.clone();
        let fresh = registrar.get_or_register("fp", move || async move {
            g.cancelled().await;
            Ok("fresh".to_string())
        });
        gate.cancel();
        assert_eq!(old.await.unwrap(), "old");
        assert!(registrar.contains("fp"));
        second_gate.cancel();
        assert_eq!(fresh.await.unwrap(), "fresh");
    }

    #[test]
    fn fingerprint_separates_fields() {
        let a = fingerprint("svc", "m", "en", "0", "ab", "c");
        let b = fingerprint("svc", "m", "en", "0", "a", "bc");
        assert_ne!(a, b);
        assert_eq!(a, fingerprint("svc", "m", "en", "0", "ab", "c"));
    }

    #[test]
    fn fingerprint_depends_on_style() {
        assert_ne!(
            fingerprint("svc", "m", "en", "0", "title", "hello"),
            fingerprint("svc", "m", "en", "1", "title", "hello")
        );
    }
}
