// src/collect/store.rs
//! Durable item storage. `save` either makes the item visible with an id or
//! leaves no trace of it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::collect::types::{Item, ItemRecord, StoredItem};
use crate::error::StorageError;

#[async_trait]
pub trait Store: Send + Sync {
    async fn save(&self, item: Item) -> Result<StoredItem, StorageError>;
}

// --- in-memory ---

/// Vec-backed store with optional failure injection on the n-th save.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<Vec<StoredItem>>,
    attempts: AtomicUsize,
    fail_on: Mutex<Option<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `n`-th call to `save` (1-based, counted over the store's lifetime).
    pub fn failing_on(self, n: usize) -> Self {
        *self.fail_on.lock().expect("store mutex poisoned") = Some(n);
        self
    }

    pub fn clear_failure(&self) {
        *self.fail_on.lock().expect("store mutex poisoned") = None;
    }

    pub fn items(&self) -> Vec<StoredItem> {
        self.items.lock().expect("store mutex poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("store mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save(&self, item: Item) -> Result<StoredItem, StorageError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.fail_on.lock().expect("store mutex poisoned") == Some(attempt) {
            return Err(StorageError::Connectivity(format!(
                "injected failure on save #{attempt}"
            )));
        }
        let mut items = self.items.lock().expect("store mutex poisoned");
        let stored = StoredItem {
            id: items.len() as i64 + 1,
            item,
        };
        items.push(stored.clone());
        Ok(stored)
    }
}

// --- JSON lines file ---

/// Append-only JSON lines file, one `ItemRecord` per line.
/// Ids continue from the highest id found when the file is opened.
pub struct JsonlStore {
    path: PathBuf,
    // next id to hand out; held for the whole append
    next_id: Arc<tokio::sync::Mutex<i64>>,
}

impl JsonlStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let max_id = match tokio::fs::read_to_string(&path).await {
            Ok(s) => s
                .lines()
                .filter(|l| !l.trim().is_empty())
                .filter_map(|l| serde_json::from_str::<ItemRecord>(l).ok())
                .map(|r| r.id)
                .max()
                .unwrap_or(0),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        tracing::debug!(path = %path.display(), max_id, "jsonl store opened");
        Ok(Self {
            path,
            next_id: Arc::new(tokio::sync::Mutex::new(max_id + 1)),
        })
    }

    pub async fn read_all(&self) -> Result<Vec<StoredItem>, StorageError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let rec: ItemRecord = serde_json::from_str(line)?;
            let stored = rec
                .into_stored()
                .map_err(|e| StorageError::Constraint(e.to_string()))?;
            out.push(stored);
        }
        Ok(out)
    }
}

#[async_trait]
impl Store for JsonlStore {
    async fn save(&self, item: Item) -> Result<StoredItem, StorageError> {
        let mut next_id = self.next_id.clone().lock_owned().await;
        let stored = StoredItem { id: *next_id, item };
        // a lost write leaves a gap in the ids, never a duplicate
        *next_id += 1;

        let mut line = serde_json::to_vec(&stored.to_record())?;
        line.push(b'\n');

        // The append runs detached and keeps the id lock until it is done, so a
        // caller that stops waiting cannot interrupt it between write and rollback.
        let path = self.path.clone();
        let write = tokio::spawn(async move {
            let _next_id = next_id;
            append_line(&path, &line).await
        });
        match write.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(e) => {
                return Err(StorageError::Connectivity(format!(
                    "append task failed: {e}"
                )))
            }
        }

        tracing::debug!(id = stored.id, source_ref = %stored.item.source_ref, "item stored");
        Ok(stored)
    }
}

async fn append_line(path: &Path, line: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let len_before = file.metadata().await?.len();
    let written = async {
        file.write_all(line).await?;
        file.sync_data().await
    }
    .await;
    if let Err(e) = written {
        // cut a torn line so the next append starts on a clean boundary
        if let Err(trunc) = file.set_len(len_before).await {
            tracing::error!(
                error = %trunc,
                path = %path.display(),
                "cannot roll back torn write"
            );
        }
        return Err(e);
    }
    Ok(())
}
