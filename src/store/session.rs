//! Sessions on a [`CprKv`]
//!
//! Each thread works through its own session. A session carries a GUID and a
//! serial number that counts completed mutations; checkpoints record the serial
//! number each session had reached at the checkpoint version, and
//! [`CprKv::continue_session`] picks up from there after recovery.

use std::sync::Arc;

use uuid::Uuid;

use crate::checkpoint::SessionState;
use crate::cpr::WorkerId;
use crate::status::Status;
use crate::store::CprKv;

/// A session bound to one worker slot of the store
pub struct Session {
    store: Arc<CprKv>,
    guid: Uuid,
    serial: u64,
    worker: WorkerId,
}

impl Session {
    pub(crate) fn new(store: Arc<CprKv>, guid: Uuid, serial: u64, worker: WorkerId) -> Self {
        Self {
            store,
            guid,
            serial,
            worker,
        }
    }

    /// Get the session GUID
    pub fn guid(&self) -> Uuid {
        self.guid
    }

    /// Serial number of the last completed mutation
    pub fn serial_num(&self) -> u64 {
        self.serial
    }

    /// Version the session currently tags mutations with
    pub fn version(&self) -> u64 {
        self.store.coordinator().workers().version(self.worker)
    }

    /// Get the session state for checkpointing
    pub fn to_session_state(&self) -> SessionState {
        SessionState::new(self.guid, self.serial)
    }

    /// Acknowledge the current checkpoint phase.
    ///
    /// Idle sessions never hold up a phase barrier, so this is only needed to pick
    /// up a new version before the next operation does.
    pub fn refresh(&mut self) -> u64 {
        self.store.refresh(self.worker)
    }

    /// Insert or replace the value of `key`.
    pub fn upsert(&mut self, key: &[u8], value: &[u8]) -> Status {
        self.store
            .mutate(self.worker, &mut self.serial, key, Some(value))
    }

    /// Delete `key`.
    ///
    /// Always appends a delete marker, even if the key is absent.
    pub fn delete(&mut self, key: &[u8]) -> Status {
        self.store.mutate(self.worker, &mut self.serial, key, None)
    }

    /// Read the current value of `key`.
    pub fn read(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, Status> {
        self.store.read(self.worker, self.serial, key)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.store.end_session(self.worker);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("guid", &self.guid)
            .field("serial", &self.serial)
            .field("worker", &self.worker)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointManager;
    use crate::config::CprConfig;
    use crate::device::MemoryDevice;

    fn open() -> Arc<CprKv> {
        let mut config = CprConfig::default();
        config.store.table_size = 64;
        config.store.page_size_bits = 12;
        Arc::new(
            CprKv::new(
                config,
                Arc::new(MemoryDevice::new()),
                Arc::new(MemoryDevice::new()),
                Arc::new(InMemoryCheckpointManager::new()),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_serial_counts_mutations_only() {
        let kv = open();
        let mut session = kv.start_session().unwrap();
        session.upsert(b"a", b"1");
        session.read(b"a").unwrap();
        session.delete(b"missing");
        assert_eq!(session.serial_num(), 2);
        assert_eq!(session.to_session_state().serial_num, 2);
    }

    #[test]
    fn test_drop_frees_worker_slot() {
        let kv = open();
        let session = kv.start_session().unwrap();
        assert_eq!(kv.coordinator().workers().active(), 1);
        drop(session);
        assert_eq!(kv.coordinator().workers().active(), 0);
    }

    #[test]
    fn test_refresh_reports_version() {
        let kv = open();
        let mut session = kv.start_session().unwrap();
        assert_eq!(session.refresh(), 1);
        assert_eq!(session.version(), 1);
    }
}
