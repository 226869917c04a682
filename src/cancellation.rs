//! Cancellation generations for queued work.
//! Every work item gets a child of the current root token; `cancel_all`
//! cancels the root and installs a fresh one, so later submissions start clean.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

pub struct TaskGeneration {
    current_token: RwLock<CancellationToken>,
    generation: AtomicU64,
}

impl TaskGeneration {
    pub fn new() -> Self {
        Self {
            current_token: RwLock::new(CancellationToken::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Cancel every token handed out so far and start a new generation.
    pub fn cancel_and_advance(&self) -> u64 {
        let mut token_guard = self.current_token.write();
        token_guard.cancel();
        *token_guard = CancellationToken::new();
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Child token for the current generation, plus the generation number.
    pub fn child_token(&self) -> (CancellationToken, u64) {
        let token_guard = self.current_token.read();
        let child = token_guard.child_token();
        let gen = self.generation.load(Ordering::SeqCst);
        (child, gen)
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

impl Default for TaskGeneration {
    fn default() -> Self {
        Self::new()
    }
}
