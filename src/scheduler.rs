//! Three-tier priority dispatch queue: High, Normal, Low.
//! Strict tier order across tiers, FIFO within a tier. At most
//! `max_concurrent` items run at once; the ceiling is re-read from config
//! on every scheduling pass. Scheduling is triggered by submission and by
//! completion, there is no polling loop.
//!
//! Admission control when pending work reaches `max_queue_length`:
//! Low is rejected, High/Normal evict the oldest Low item, or are rejected
//! if there is none.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::cancellation::TaskGeneration;
use crate::config::ConfigSource;
use crate::metrics::{metric_names, MetricsRegistry};
use crate::translate::TranslateError;

pub type TaskResult = Result<String, TranslateError>;

/// The unit of work. Receives the item's cancellation token.
pub type Operation = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, TaskResult> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    fn wait_metric(self) -> &'static str {
        match self {
            Priority::High => metric_names::QUEUE_WAIT_HIGH,
            Priority::Normal => metric_names::QUEUE_WAIT_NORMAL,
            Priority::Low => metric_names::QUEUE_WAIT_LOW,
        }
    }
}

/// A submission to the queue.
pub struct WorkItem {
    priority: Priority,
    fingerprint: Option<String>,
    operation: Operation,
    signal: Option<CancellationToken>,
}

impl WorkItem {
    pub fn new<F, Fut>(priority: Priority, operation: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        Self {
            priority,
            fingerprint: None,
            operation: Box::new(move |token| operation(token).boxed()),
            signal: None,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    /// Caller-side cancellation: firing `signal` cancels this item.
    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}

struct QueuedItem {
    id: u64,
    priority: Priority,
    fingerprint: Option<String>,
    operation: Operation,
    token: CancellationToken,
    respond: oneshot::Sender<TaskResult>,
    enqueued_at: Instant,
    /// Fires `finished` when the item settles, releasing any signal watcher.
    _finished: DropGuard,
}

impl QueuedItem {
    fn settle(self, result: TaskResult) {
        let _ = self.respond.send(result);
    }
}

#[derive(Default)]
struct QueueState {
    high: VecDeque<QueuedItem>,
    normal: VecDeque<QueuedItem>,
    low: VecDeque<QueuedItem>,
    active: HashMap<u64, CancellationToken>,
}

impl QueueState {
    fn tier_mut(&mut self, priority: Priority) -> &mut VecDeque<QueuedItem> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn tiers_mut(&mut self) -> [&mut VecDeque<QueuedItem>; 3] {
        [&mut self.high, &mut self.normal, &mut self.low]
    }

    fn total_pending(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    fn pop_next(&mut self) -> Option<QueuedItem> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }
}

/// Read-only queue snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub active: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub total_pending: usize,
    pub max_concurrent: usize,
    pub max_queue_length: usize,
    pub is_full: bool,
    pub total_in_process: usize,
    /// Bumped by every `cancel_all`.
    pub generation: u64,
}

/// Resolves when the submitted item completes, fails, is cancelled or is
/// rejected by admission control.
pub struct TaskHandle {
    id: u64,
    rx: oneshot::Receiver<TaskResult>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for TaskHandle {
    type Output = TaskResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<TaskResult> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| Err(TranslateError::Generic("translation task aborted".into())))
        })
    }
}

/// Frees the concurrency slot when dropped, even if the operation panicked.
struct ActiveSlot {
    scheduler: Arc<Scheduler>,
    id: u64,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.scheduler.complete(self.id);
    }
}

pub struct Scheduler {
    state: Mutex<QueueState>,
    next_id: AtomicU64,
    generations: TaskGeneration,
    config: Arc<dyn ConfigSource>,
    metrics: Arc<MetricsRegistry>,
}

impl Scheduler {
    pub fn new(config: Arc<dyn ConfigSource>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            next_id: AtomicU64::new(0),
            generations: TaskGeneration::new(),
            config,
            metrics,
        }
    }

    /// Enqueue `item` into its tier and trigger a scheduling pass.
    /// Must be called from within a Tokio runtime.
    pub fn submit(self: &Arc<Self>, item: WorkItem) -> TaskHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (respond, rx) = oneshot::channel();
        let handle = TaskHandle { id, rx };

        if item.signal.as_ref().is_some_and(|s| s.is_cancelled()) {
            let _ = respond.send(Err(TranslateError::Cancelled));
            return handle;
        }

        let WorkItem {
            priority,
            fingerprint,
            operation,
            signal,
        } = item;
        let config = self.config.snapshot();
        let max_queue_length = config.max_queue_length();
        let finished = CancellationToken::new();

        {
            let mut state = self.state.lock();
            let (token, _) = self.generations.child_token();
            let queued = QueuedItem {
                id,
                priority,
                fingerprint,
                operation,
                token,
                respond,
                enqueued_at: Instant::now(),
                _finished: finished.clone().drop_guard(),
            };

            let total_pending = state.total_pending();
            if total_pending >= max_queue_length {
                if priority == Priority::Low {
                    warn!(id, total_pending, "queue full, low-priority item rejected");
                    queued.settle(Err(TranslateError::QueueFull));
                    return handle;
                }
                match state.low.pop_front() {
                    Some(victim) => {
                        warn!(id, evicted = victim.id, "queue full, oldest low-priority item evicted");
                        victim.token.cancel();
                        victim.settle(Err(TranslateError::EvictedByPriority));
                    }
                    None => {
                        warn!(id, ?priority, total_pending, "queue full, item rejected");
                        queued.settle(Err(TranslateError::QueueFull));
                        return handle;
                    }
                }
            }

            debug!(id, ?priority, fingerprint = ?queued.fingerprint, "work item queued");
            state.tier_mut(priority).push_back(queued);
        }

        if let Some(signal) = signal {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                tokio::select! {
                    _ = signal.cancelled() => {
                        this.cancel(id);
                    }
                    _ = finished.cancelled() => {}
                }
            });
        }

        self.pump();
        handle
    }

    /// One scheduling pass: start queued items while slots are free.
    fn pump(self: &Arc<Self>) {
        let max_concurrent = self.config.snapshot().max_concurrent();
        let mut to_start = Vec::new();
        {
            let mut state = self.state.lock();
            while state.active.len() < max_concurrent {
                let Some(item) = state.pop_next() else { break };
                if item.token.is_cancelled() {
                    debug!(id = item.id, "skipping cancelled item");
                    item.settle(Err(TranslateError::Cancelled));
                    continue;
                }
                state.active.insert(item.id, item.token.clone());
                to_start.push(item);
            }
        }
        for item in to_start {
            self.start(item);
        }
    }

    fn start(self: &Arc<Self>, item: QueuedItem) {
        let wait_us = item.enqueued_at.elapsed().as_micros() as f64;
        self.metrics.record(item.priority.wait_metric(), wait_us);

        let slot = ActiveSlot {
            scheduler: Arc::clone(self),
            id: item.id,
        };
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            let QueuedItem {
                operation,
                token,
                respond,
                _finished: finished,
                ..
            } = item;
            let span = metrics.span(metric_names::EXECUTE);
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(TranslateError::Cancelled),
                result = operation(token.clone()) => result,
            };
            span.finish();
            let _ = respond.send(result);
            drop(finished);
            drop(slot);
        });
    }

    fn complete(self: &Arc<Self>, id: u64) {
        self.state.lock().active.remove(&id);
        self.pump();
    }

    /// Cancel a pending item (rejecting it) or signal an active one.
    /// Returns whether an item with `id` was found.
    pub fn cancel(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        for tier in state.tiers_mut() {
            if let Some(pos) = tier.iter().position(|item| item.id == id) {
                if let Some(item) = tier.remove(pos) {
                    item.token.cancel();
                    item.settle(Err(TranslateError::Cancelled));
                }
                debug!(id, "pending item cancelled");
                return true;
            }
        }
        if let Some(token) = state.active.get(&id) {
            token.cancel();
            debug!(id, "active item signalled");
            return true;
        }
        false
    }

    fn drain_pending(state: &mut QueueState) -> usize {
        let mut cleared = 0;
        for tier in state.tiers_mut() {
            for item in tier.drain(..) {
                item.token.cancel();
                item.settle(Err(TranslateError::Cancelled));
                cleared += 1;
            }
        }
        cleared
    }

    /// Reject every pending item; active items keep running.
    pub fn clear_pending(&self) -> usize {
        let cleared = Self::drain_pending(&mut self.state.lock());
        if cleared > 0 {
            info!(cleared, "pending queue cleared");
        }
        cleared
    }

    /// Reject every pending item and signal every active one.
    /// Items submitted afterwards belong to a fresh generation.
    pub fn cancel_all(&self) {
        let mut state = self.state.lock();
        let cleared = Self::drain_pending(&mut state);
        let generation = self.generations.cancel_and_advance();
        info!(cleared, active = state.active.len(), generation, "all translations cancelled");
    }

    /// Whether a submission at `priority` would currently be admitted.
    pub fn can_accept(&self, priority: Priority) -> bool {
        if priority == Priority::High {
            return true;
        }
        let max_queue_length = self.config.snapshot().max_queue_length();
        self.state.lock().total_pending() < max_queue_length
    }

    pub fn status(&self) -> QueueStatus {
        let config = self.config.snapshot();
        let max_queue_length = config.max_queue_length();
        let state = self.state.lock();
        let total_pending = state.total_pending();
        QueueStatus {
            active: state.active.len(),
            high: state.high.len(),
            normal: state.normal.len(),
            low: state.low.len(),
            total_pending,
            max_concurrent: config.max_concurrent(),
            max_queue_length,
            is_full: total_pending >= max_queue_length,
            total_in_process: state.active.len() + total_pending,
            generation: self.generations.current_generation(),
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }
}
