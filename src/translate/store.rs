//! Persistent key-value store seam used as the cold cache tier.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A stored record with its write timestamp (unix millis).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub key: String,
    pub value: String,
    pub written_at: i64,
}

/// Cold-tier storage. Writes are last-write-wins by key.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// All entries, oldest write first.
    async fn all(&self) -> Result<Vec<StoredEntry>, StoreError>;
    async fn clear(&self) -> Result<(), StoreError>;
    async fn count(&self) -> Result<usize, StoreError>;

    /// Delete oldest entries until at most `keep` remain. Returns how many were removed.
    async fn prune_oldest(&self, keep: usize) -> Result<usize, StoreError> {
        let entries = self.all().await?;
        if entries.len() <= keep {
            return Ok(0);
        }
        let excess = entries.len() - keep;
        for entry in entries.iter().take(excess) {
            self.delete(&entry.key).await?;
        }
        Ok(excess)
    }
}

struct MemoryRecord {
    value: String,
    written_at: i64,
    seq: u64,
}

/// Process-local store. Also handy as the cold tier in tests.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, MemoryRecord>>,
    seq: AtomicU64,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// Make every subsequent operation fail, simulating an unavailable backend.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store set to fail".into()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        Ok(self.entries.lock().get(key).map(|r| r.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check()?;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().insert(
            key.to_string(),
            MemoryRecord {
                value: value.to_string(),
                written_at: now_millis(),
                seq,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn all(&self) -> Result<Vec<StoredEntry>, StoreError> {
        self.check()?;
        let entries = self.entries.lock();
        let mut records: Vec<(&String, &MemoryRecord)> = entries.iter().collect();
        records.sort_by_key(|(_, r)| (r.written_at, r.seq));
        Ok(records
            .into_iter()
            .map(|(k, r)| StoredEntry {
                key: k.clone(),
                value: r.value.clone(),
                written_at: r.written_at,
            })
            .collect())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.check()?;
        self.entries.lock().clear();
        Ok(())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.check()?;
        Ok(self.entries.lock().len())
    }
}

/// Current time as unix milliseconds.
pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
