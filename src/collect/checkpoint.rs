// src/collect/checkpoint.rs
//! Per-channel watermark persistence.
//!
//! The stores here overwrite unconditionally. Monotonicity is the cycle's job:
//! it only ever writes `max(published_at)` of a batch that passed the strict
//! `> checkpoint` filter.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::collect::types::{format_timestamp, parse_timestamp, Channel, Timestamp};
use crate::error::CheckpointError;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// `None` on the first ever run for `channel`.
    async fn get(&self, channel: Channel) -> Result<Option<Timestamp>, CheckpointError>;

    async fn set(&self, channel: Channel, checkpoint: Timestamp) -> Result<(), CheckpointError>;
}

/// Parse a stored watermark. Garbage reads as "no checkpoint" rather than
/// wedging the channel forever.
pub(crate) fn decode_checkpoint(channel: Channel, raw: &str) -> Option<Timestamp> {
    match parse_timestamp(raw) {
        Ok(ts) => Some(ts),
        Err(e) => {
            tracing::warn!(%channel, raw, error = %e, "unparsable checkpoint, treating as absent");
            None
        }
    }
}

// --- in-memory ---

/// Process-local store. Keeps a log of every write so tests can check the
/// monotonicity of what the cycle actually wrote.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    values: Mutex<HashMap<Channel, Timestamp>>,
    writes: Mutex<Vec<(Channel, Timestamp)>>,
    fail_get: AtomicBool,
    fail_set: AtomicBool,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checkpoint(self, channel: Channel, checkpoint: Timestamp) -> Self {
        self.values
            .lock()
            .expect("checkpoint mutex poisoned")
            .insert(channel, checkpoint);
        self
    }

    pub fn peek(&self, channel: Channel) -> Option<Timestamp> {
        self.values
            .lock()
            .expect("checkpoint mutex poisoned")
            .get(&channel)
            .copied()
    }

    pub fn writes(&self) -> Vec<(Channel, Timestamp)> {
        self.writes.lock().expect("checkpoint mutex poisoned").clone()
    }

    pub fn fail_reads(&self, on: bool) {
        self.fail_get.store(on, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, on: bool) {
        self.fail_set.store(on, Ordering::SeqCst);
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, channel: Channel) -> Result<Option<Timestamp>, CheckpointError> {
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(CheckpointError::Connectivity("injected read failure".into()));
        }
        Ok(self.peek(channel))
    }

    async fn set(&self, channel: Channel, checkpoint: Timestamp) -> Result<(), CheckpointError> {
        if self.fail_set.load(Ordering::SeqCst) {
            return Err(CheckpointError::Connectivity("injected write failure".into()));
        }
        self.values
            .lock()
            .expect("checkpoint mutex poisoned")
            .insert(channel, checkpoint);
        self.writes
            .lock()
            .expect("checkpoint mutex poisoned")
            .push((channel, checkpoint));
        Ok(())
    }
}

// --- JSON file ---

/// Watermarks kept in one JSON object `{ "<channel>": "<rfc3339>" }`.
/// Writes go to a sibling temp file first and are renamed into place.
pub struct FileCheckpointStore {
    path: PathBuf,
    // read-modify-write of the shared file must not interleave
    lock: tokio::sync::Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn read_map(&self) -> Result<BTreeMap<String, String>, CheckpointError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(s) if s.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(s) => Ok(serde_json::from_str(&s)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, channel: Channel) -> Result<Option<Timestamp>, CheckpointError> {
        let _guard = self.lock.lock().await;
        let map = self.read_map().await?;
        let cp = map
            .get(channel.as_str())
            .and_then(|raw| decode_checkpoint(channel, raw));
        match &cp {
            Some(ts) => tracing::debug!(%channel, checkpoint = %ts, "checkpoint loaded"),
            None => tracing::debug!(%channel, "no checkpoint (first run)"),
        }
        Ok(cp)
    }

    async fn set(&self, channel: Channel, checkpoint: Timestamp) -> Result<(), CheckpointError> {
        let _guard = self.lock.lock().await;
        let mut map = self.read_map().await?;
        map.insert(channel.as_str().to_string(), format_timestamp(&checkpoint));

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&map)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        tracing::debug!(%channel, checkpoint = %checkpoint, "checkpoint saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> Timestamp {
        parse_timestamp(s).unwrap()
    }

    #[tokio::test]
    async fn memory_store_starts_empty_and_logs_writes() {
        let store = MemoryCheckpointStore::new();
        assert_eq!(store.get(Channel::Dummy).await.unwrap(), None);

        store
            .set(Channel::Dummy, ts("2025-11-21T10:00:00Z"))
            .await
            .unwrap();
        assert_eq!(
            store.get(Channel::Dummy).await.unwrap(),
            Some(ts("2025-11-21T10:00:00Z"))
        );
        assert_eq!(store.get(Channel::TruthSocial).await.unwrap(), None);
        assert_eq!(store.writes().len(), 1);
    }

    #[tokio::test]
    async fn memory_store_overwrites_without_enforcing_order() {
        // The store is a dumb register; going backwards is allowed here.
        let store = MemoryCheckpointStore::new()
            .with_checkpoint(Channel::Dummy, ts("2025-11-21T11:00:00Z"));
        store
            .set(Channel::Dummy, ts("2025-11-21T09:00:00Z"))
            .await
            .unwrap();
        assert_eq!(store.peek(Channel::Dummy), Some(ts("2025-11-21T09:00:00Z")));
    }

    #[tokio::test]
    async fn injected_failures_surface_as_connectivity_errors() {
        let store = MemoryCheckpointStore::new();
        store.fail_reads(true);
        assert!(matches!(
            store.get(Channel::Dummy).await,
            Err(CheckpointError::Connectivity(_))
        ));
        store.fail_writes(true);
        assert!(store
            .set(Channel::Dummy, ts("2025-11-21T10:00:00Z"))
            .await
            .is_err());
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn file_store_persists_per_channel_and_keeps_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("checkpoints.json");
        let store = FileCheckpointStore::new(&path);

        assert_eq!(store.get(Channel::TruthSocial).await.unwrap(), None);
        store
            .set(Channel::TruthSocial, ts("2025-11-23T12:00:00+09:00"))
            .await
            .unwrap();
        store
            .set(Channel::Dummy, ts("2025-11-21T11:00:00Z"))
            .await
            .unwrap();

        let reopened = FileCheckpointStore::new(&path);
        let cp = reopened.get(Channel::TruthSocial).await.unwrap().unwrap();
        assert_eq!(cp, ts("2025-11-23T03:00:00Z"));
        assert_eq!(cp.offset().local_minus_utc(), 9 * 3600);
        assert_eq!(
            reopened.get(Channel::Dummy).await.unwrap(),
            Some(ts("2025-11-21T11:00:00Z"))
        );
    }

    #[tokio::test]
    async fn file_store_keeps_nanoseconds_so_the_item_stays_behind_the_watermark() {
        use crate::collect::providers::dummy::DummyCollector;
        use crate::collect::publish::MemoryPublisher;
        use crate::collect::store::MemoryStore;
        use crate::collect::types::RawItem;
        use crate::collect::{run_channel_cycle, Collaborators, CycleTimeouts};
        use std::sync::Arc;
        use tokio_util::sync::CancellationToken;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.json");
        let at = ts("2025-11-21T10:00:00.000000500Z");

        let store = FileCheckpointStore::new(&path);
        store.set(Channel::Dummy, at).await.unwrap();
        let reread = FileCheckpointStore::new(&path).get(Channel::Dummy).await.unwrap();
        assert_eq!(reread, Some(at));
        std::fs::remove_file(&path).unwrap();

        let collector = DummyCollector::with_items(vec![RawItem {
            content: "late post".into(),
            source_ref: "dummy://late".into(),
            published_at: Some(at),
            channel: Channel::Dummy,
        }]);
        let publisher = Arc::new(MemoryPublisher::new());
        let deps = Collaborators {
            store: Arc::new(MemoryStore::new()),
            publisher: publisher.clone(),
            checkpoints: Arc::new(FileCheckpointStore::new(&path)),
        };

        for _ in 0..3 {
            run_channel_cycle(
                &collector,
                &deps,
                &CycleTimeouts::default(),
                &CancellationToken::new(),
            )
            .await;
        }
        assert_eq!(publisher.len(), 1);
    }

    #[tokio::test]
    async fn file_store_treats_garbage_value_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.json");
        std::fs::write(&path, r#"{"dummy": "yesterday"}"#).unwrap();
        let store = FileCheckpointStore::new(&path);
        assert_eq!(store.get(Channel::Dummy).await.unwrap(), None);
    }
}
