//! In-memory checkpoint manager for tests and benchmarks

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::checkpoint::{CheckpointManager, CheckpointToken, TokenPair};
use crate::device::{DeviceHandle, MemoryDevice};

#[derive(Default)]
struct IndexEntry {
    device: Arc<MemoryDevice>,
    metadata: Option<(u64, Vec<u8>)>,
}

#[derive(Default)]
struct LogEntry {
    snapshot: Arc<MemoryDevice>,
    object_snapshot: Arc<MemoryDevice>,
    metadata: Option<(u64, Vec<u8>)>,
}

#[derive(Default)]
struct Inner {
    index: HashMap<CheckpointToken, IndexEntry>,
    log: HashMap<CheckpointToken, LogEntry>,
    commit_seq: u64,
}

/// Checkpoint manager keeping everything in memory.
///
/// Committed metadata is durable the moment `commit_*` returns. Artifact devices are
/// [`MemoryDevice`]s, so [`InMemoryCheckpointManager::simulate_crash`] drops every
/// artifact byte that was never flushed.
#[derive(Default)]
pub struct InMemoryCheckpointManager {
    inner: Mutex<Inner>,
}

impl InMemoryCheckpointManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop unflushed bytes from every artifact device.
    pub fn simulate_crash(&self) {
        let inner = self.inner.lock();
        for entry in inner.index.values() {
            entry.device.simulate_crash();
        }
        for entry in inner.log.values() {
            entry.snapshot.simulate_crash();
            entry.object_snapshot.simulate_crash();
        }
    }

    /// Whether any storage (committed or not) exists for `token`
    pub fn has_artifacts(&self, token: CheckpointToken) -> bool {
        let inner = self.inner.lock();
        inner.index.contains_key(&token) || inner.log.contains_key(&token)
    }

    /// Number of tokens with storage allocated, committed or not
    pub fn allocated_tokens(&self) -> usize {
        let inner = self.inner.lock();
        inner.index.len() + inner.log.len()
    }

    fn newest(entries: impl Iterator<Item = (CheckpointToken, u64)>) -> Option<CheckpointToken> {
        entries.max_by_key(|(_, seq)| *seq).map(|(token, _)| token)
    }
}

fn not_initialized(token: CheckpointToken) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("checkpoint {token} was never initialized"),
    )
}

fn already_committed(token: CheckpointToken) -> io::Error {
    io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("checkpoint {token} is already committed"),
    )
}

impl CheckpointManager for InMemoryCheckpointManager {
    fn initialize_index_checkpoint(&self, token: CheckpointToken) -> io::Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner.index.entry(token).or_default();
        if entry.metadata.is_some() {
            return Err(already_committed(token));
        }
        Ok(())
    }

    fn initialize_log_checkpoint(&self, token: CheckpointToken) -> io::Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner.log.entry(token).or_default();
        if entry.metadata.is_some() {
            return Err(already_committed(token));
        }
        Ok(())
    }

    fn index_device(&self, token: CheckpointToken) -> io::Result<DeviceHandle> {
        let inner = self.inner.lock();
        let entry = inner.index.get(&token).ok_or_else(|| not_initialized(token))?;
        Ok(entry.device.clone())
    }

    fn snapshot_log_device(&self, token: CheckpointToken) -> io::Result<DeviceHandle> {
        let inner = self.inner.lock();
        let entry = inner.log.get(&token).ok_or_else(|| not_initialized(token))?;
        Ok(entry.snapshot.clone())
    }

    fn snapshot_object_log_device(&self, token: CheckpointToken) -> io::Result<DeviceHandle> {
        let inner = self.inner.lock();
        let entry = inner.log.get(&token).ok_or_else(|| not_initialized(token))?;
        Ok(entry.object_snapshot.clone())
    }

    fn commit_index_checkpoint(&self, token: CheckpointToken, metadata: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.lock();
        inner.commit_seq += 1;
        let seq = inner.commit_seq;
        let entry = inner
            .index
            .get_mut(&token)
            .ok_or_else(|| not_initialized(token))?;
        entry.metadata = Some((seq, metadata.to_vec()));
        Ok(())
    }

    fn commit_log_checkpoint(&self, token: CheckpointToken, metadata: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.lock();
        inner.commit_seq += 1;
        let seq = inner.commit_seq;
        let entry = inner
            .log
            .get_mut(&token)
            .ok_or_else(|| not_initialized(token))?;
        entry.metadata = Some((seq, metadata.to_vec()));
        Ok(())
    }

    fn index_commit_metadata(&self, token: CheckpointToken) -> io::Result<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        Ok(inner
            .index
            .get(&token)
            .and_then(|e| e.metadata.as_ref())
            .map(|(_, bytes)| bytes.clone()))
    }

    fn log_commit_metadata(&self, token: CheckpointToken) -> io::Result<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        Ok(inner
            .log
            .get(&token)
            .and_then(|e| e.metadata.as_ref())
            .map(|(_, bytes)| bytes.clone()))
    }

    fn latest_checkpoint(&self) -> io::Result<Option<TokenPair>> {
        let inner = self.inner.lock();
        let log = Self::newest(
            inner
                .log
                .iter()
                .filter_map(|(t, e)| e.metadata.as_ref().map(|(seq, _)| (*t, *seq))),
        );
        let index = Self::newest(
            inner
                .index
                .iter()
                .filter_map(|(t, e)| e.metadata.as_ref().map(|(seq, _)| (*t, *seq))),
        );
        Ok(log.map(|log_token| TokenPair::new(index, log_token)))
    }

    fn index_checkpoint_tokens(&self) -> io::Result<Vec<CheckpointToken>> {
        let inner = self.inner.lock();
        Ok(inner
            .index
            .iter()
            .filter(|(_, e)| e.metadata.is_some())
            .map(|(t, _)| *t)
            .collect())
    }

    fn log_checkpoint_tokens(&self) -> io::Result<Vec<CheckpointToken>> {
        let inner = self.inner.lock();
        Ok(inner
            .log
            .iter()
            .filter(|(_, e)| e.metadata.is_some())
            .map(|(t, _)| *t)
            .collect())
    }

    fn remove_index_commit_metadata(&self, token: CheckpointToken) -> io::Result<()> {
        if let Some(entry) = self.inner.lock().index.get_mut(&token) {
            entry.metadata = None;
        }
        Ok(())
    }

    fn remove_log_commit_metadata(&self, token: CheckpointToken) -> io::Result<()> {
        if let Some(entry) = self.inner.lock().log.get_mut(&token) {
            entry.metadata = None;
        }
        Ok(())
    }

    fn purge_index_artifacts(&self, token: CheckpointToken) -> io::Result<()> {
        self.inner.lock().index.remove(&token);
        Ok(())
    }

    fn purge_log_artifacts(&self, token: CheckpointToken) -> io::Result<()> {
        self.inner.lock().log.remove(&token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SyncStorageDevice;
    use uuid::Uuid;

    #[test]
    fn test_commit_get_round_trip() {
        let manager = InMemoryCheckpointManager::new();
        let index = Uuid::new_v4();
        let log = Uuid::new_v4();
        manager.initialize_index_checkpoint(index).unwrap();
        manager.initialize_log_checkpoint(log).unwrap();

        assert_eq!(manager.index_commit_metadata(index).unwrap(), None);
        manager.commit_index_checkpoint(index, b"index").unwrap();
        manager.commit_log_checkpoint(log, b"log").unwrap();

        assert_eq!(
            manager.index_commit_metadata(index).unwrap().as_deref(),
            Some(&b"index"[..])
        );
        assert_eq!(
            manager.log_commit_metadata(log).unwrap().as_deref(),
            Some(&b"log"[..])
        );
        assert_eq!(
            manager.latest_checkpoint().unwrap(),
            Some(TokenPair::new(Some(index), log))
        );
    }

    #[test]
    fn test_uncommitted_tokens_are_not_listed() {
        let manager = InMemoryCheckpointManager::new();
        let token = Uuid::new_v4();
        manager.initialize_log_checkpoint(token).unwrap();
        assert!(manager.log_checkpoint_tokens().unwrap().is_empty());
        assert_eq!(manager.latest_checkpoint().unwrap(), None);
        assert!(manager.has_artifacts(token));
    }

    #[test]
    fn test_latest_uses_commit_order() {
        let manager = InMemoryCheckpointManager::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        for token in [first, second] {
            manager.initialize_log_checkpoint(token).unwrap();
        }
        manager.commit_log_checkpoint(second, b"2").unwrap();
        manager.commit_log_checkpoint(first, b"1").unwrap();
        assert_eq!(
            manager.latest_checkpoint().unwrap(),
            Some(TokenPair::new(None, first))
        );
    }

    #[test]
    fn test_crash_drops_unflushed_artifact_bytes() {
        let manager = InMemoryCheckpointManager::new();
        let token = Uuid::new_v4();
        manager.initialize_index_checkpoint(token).unwrap();
        let device = manager.index_device(token).unwrap();
        device.write_sync(0, b"abc").unwrap();
        manager.simulate_crash();
        assert_eq!(device.size_sync().unwrap(), 0);
    }

    #[test]
    fn test_purge_removes_everything() {
        let manager = InMemoryCheckpointManager::new();
        let token = Uuid::new_v4();
        manager.initialize_log_checkpoint(token).unwrap();
        manager.commit_log_checkpoint(token, b"x").unwrap();
        manager.remove_log_commit_metadata(token).unwrap();
        assert!(manager.log_checkpoint_tokens().unwrap().is_empty());
        manager.purge_log_artifacts(token).unwrap();
        assert!(!manager.has_artifacts(token));
        assert!(manager.snapshot_log_device(token).is_err());
    }
}
