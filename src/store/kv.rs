use std::io;
use std::sync::Arc;

use uuid::Uuid;

use crate::address::Address;
use crate::checkpoint::{CheckpointKind, CheckpointManager, SessionState};
use crate::config::CprConfig;
use crate::cpr::{
    replay_log, CheckpointCoordinator, CheckpointOutcome, CheckpointParticipant,
    CheckpointRequest, RecoveryPlanner, RecoveryReport, WorkerId,
};
use crate::device::{DeviceHandle, SyncStorageDevice};
use crate::error::{CheckpointError, RecoveryError};
use crate::index::{read_snapshot, write_snapshot, HashIndex, IndexSnapshotInfo, IndexStats, KeyHash};
use crate::log::{FlushDestination, HybridLog, PendingFlush};
use crate::status::{OperationStatus, Status};
use crate::store::session::Session;
use crate::store::CprKvConfig;

enum ChainStep {
    Next(Address),
    Found(Vec<u8>),
    Object(Vec<u8>),
    Deleted,
}

/// Concurrent key-value store with CPR checkpoints
pub struct CprKv {
    config: CprKvConfig,
    index: HashIndex,
    log: HybridLog,
    coordinator: CheckpointCoordinator,
    recovered_sessions: Vec<SessionState>,
}

fn invalid_input(status: Status, what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("{what}: {status}"))
}

impl CprKv {
    /// Create an empty store.
    ///
    /// `log_device` and `object_device` receive fold-over checkpoints; `manager`
    /// stores everything else a checkpoint produces. A manager that already holds
    /// committed checkpoints is refused with `AlreadyExists`: a fresh store would
    /// reuse their versions, and its log checkpoints could pair with an index from
    /// the earlier run. Use [`CprKv::recover`] for such a manager.
    pub fn new(
        config: CprConfig,
        log_device: DeviceHandle,
        object_device: DeviceHandle,
        manager: Arc<dyn CheckpointManager>,
    ) -> io::Result<Self> {
        let committed =
            manager.index_checkpoint_tokens()?.len() + manager.log_checkpoint_tokens()?.len();
        if committed > 0 {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("checkpoint manager already holds {committed} committed checkpoint(s)"),
            ));
        }
        let index = HashIndex::new(config.store.table_size, config.store.overflow_buckets)
            .map_err(|s| invalid_input(s, "table_size must be a power of two"))?;
        let log = HybridLog::new(config.store.log_config(), log_device, object_device)?;
        let coordinator = CheckpointCoordinator::new(manager, config.checkpoint, 1, None);
        Ok(Self {
            config: config.store,
            index,
            log,
            coordinator,
            recovered_sessions: Vec::new(),
        })
    }

    /// Rebuild a store from the newest consistent checkpoint held by `manager`.
    ///
    /// `log_device` and `object_device` must be the main devices the checkpointed
    /// store used; fold-over checkpoints are restored from them.
    pub fn recover(
        config: CprConfig,
        log_device: DeviceHandle,
        object_device: DeviceHandle,
        manager: Arc<dyn CheckpointManager>,
    ) -> Result<(Self, RecoveryReport), RecoveryError> {
        let planner = RecoveryPlanner::new(manager.as_ref());
        let mut plan = planner.plan()?;
        let log_token = plan.log.token;

        let index = match &plan.index {
            Some(meta) => manager
                .index_device(meta.token)
                .and_then(|device| {
                    read_snapshot(device.as_ref(), meta, config.store.overflow_buckets)
                })
                .map_err(|source| RecoveryError::Snapshot {
                    token: meta.token,
                    source,
                })?,
            None => HashIndex::new(config.store.table_size, config.store.overflow_buckets)
                .map_err(|s| {
                    RecoveryError::Setup(invalid_input(s, "table_size must be a power of two"))
                })?,
        };

        let log = HybridLog::new(
            config.store.log_config(),
            Arc::clone(&log_device),
            Arc::clone(&object_device),
        )
        .map_err(RecoveryError::Setup)?;

        let restored = match plan.log.kind {
            CheckpointKind::FoldOver => log
                .restore(log_device.as_ref(), plan.log.final_address, true)
                .and_then(|()| {
                    log.objects()
                        .restore_from(object_device.as_ref(), plan.log.object_log_tail, true)
                }),
            CheckpointKind::Snapshot => manager
                .snapshot_log_device(log_token)
                .and_then(|source| log.restore(source.as_ref(), plan.log.final_address, false))
                .and_then(|()| manager.snapshot_object_log_device(log_token))
                .and_then(|source| {
                    log.objects()
                        .restore_from(source.as_ref(), plan.log.object_log_tail, false)
                }),
        };
        restored.map_err(|source| RecoveryError::Snapshot {
            token: log_token,
            source,
        })?;

        let stats = replay_log(
            &index,
            &log,
            plan.replay_from,
            plan.log.final_address,
            plan.log.version,
        )?;
        if plan.log.kind == CheckpointKind::FoldOver {
            if let Some(address) = stats.first_invalidated {
                log.mark_dirty_from(address);
            }
        }

        planner.purge_orphans(&mut plan)?;

        let mut report = plan.report;
        report.replayed_records = stats.replayed;
        report.invalidated_records = stats.invalidated;

        tracing::info!(
            pair = %plan.pair,
            version = plan.log.version,
            resume_version = plan.resume_version,
            replayed = stats.replayed,
            invalidated = stats.invalidated,
            "store recovered"
        );

        let coordinator = CheckpointCoordinator::new(
            manager,
            config.checkpoint,
            plan.resume_version,
            Some(plan.pair),
        );
        let kv = Self {
            config: config.store,
            index,
            log,
            coordinator,
            recovered_sessions: plan.log.session_states,
        };
        Ok((kv, report))
    }

    /// Store configuration
    pub fn config(&self) -> &CprKvConfig {
        &self.config
    }

    /// The checkpoint coordinator
    pub fn coordinator(&self) -> &CheckpointCoordinator {
        &self.coordinator
    }

    /// Session recovery points restored by [`CprKv::recover`]
    pub fn recovered_sessions(&self) -> &[SessionState] {
        &self.recovered_sessions
    }

    /// Hash index statistics
    pub fn index_stats(&self) -> IndexStats {
        self.index.stats()
    }

    /// Open a new session with a fresh GUID.
    ///
    /// Fails with `InvalidOperation` when every worker slot is taken.
    pub fn start_session(self: &Arc<Self>) -> Result<Session, Status> {
        self.open_session(Uuid::new_v4(), 0)
    }

    /// Reopen a session that was active at the recovered checkpoint.
    ///
    /// The session continues from the serial number recorded for it; operations
    /// after that serial number were lost and must be reissued.
    pub fn continue_session(self: &Arc<Self>, guid: Uuid) -> Result<Session, Status> {
        let state = self
            .recovered_sessions
            .iter()
            .find(|s| s.guid == guid)
            .ok_or(Status::NotFound)?;
        self.open_session(guid, state.serial_num)
    }

    fn open_session(self: &Arc<Self>, guid: Uuid, serial: u64) -> Result<Session, Status> {
        let worker = self
            .coordinator
            .register_worker(guid, serial)
            .ok_or(Status::InvalidOperation)?;
        Ok(Session::new(Arc::clone(self), guid, serial, worker))
    }

    /// Run a checkpoint cycle to completion.
    pub fn checkpoint(
        &self,
        request: CheckpointRequest,
    ) -> Result<CheckpointOutcome, CheckpointError> {
        self.coordinator.begin(self, request)?.run()
    }

    /// Full checkpoint of the configured kind
    pub fn checkpoint_full(&self) -> Result<CheckpointOutcome, CheckpointError> {
        self.checkpoint(CheckpointRequest::full(self.coordinator.config().kind))
    }

    /// Log-only checkpoint of the configured kind
    pub fn checkpoint_hybrid_log(&self) -> Result<CheckpointOutcome, CheckpointError> {
        self.checkpoint(CheckpointRequest::hybrid_log(self.coordinator.config().kind))
    }

    fn try_mutate(
        &self,
        hash: KeyHash,
        key: &[u8],
        value: Option<&[u8]>,
        version: u64,
    ) -> OperationStatus {
        let guard = self.index.lock(hash);
        let mut slot = match self.index.find_or_create_entry(hash, &guard) {
            Ok(slot) => slot,
            Err(status) => return OperationStatus::Failed(status),
        };
        let head = slot.address();
        if head.is_valid() {
            if let Some(head_version) = self.log.with_record(head, |r| r.header.version) {
                if head_version > version {
                    return OperationStatus::CprShiftDetected { head_version };
                }
            }
        }
        match self.log.append(head, version, key, value) {
            Ok(address) => {
                slot.store(address);
                OperationStatus::Success
            }
            Err(status) => OperationStatus::Failed(status),
        }
    }

    /// Upsert (`Some`) or delete (`None`) `key` for `worker`; `serial` advances on
    /// success.
    pub(crate) fn mutate(
        &self,
        worker: WorkerId,
        serial: &mut u64,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Status {
        let hash = KeyHash::of(key);
        let mut version = self.coordinator.begin_op(worker);
        let status = loop {
            match self.try_mutate(hash, key, value, version) {
                OperationStatus::CprShiftDetected { head_version } => {
                    version = self.coordinator.shift_version(worker, head_version);
                }
                other => break other.to_status(),
            }
        };
        if status.is_ok() {
            *serial += 1;
        }
        self.coordinator.end_op(worker, *serial);
        status
    }

    pub(crate) fn read(
        &self,
        worker: WorkerId,
        serial: u64,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, Status> {
        self.coordinator.begin_op(worker);
        let result = self.read_chain(KeyHash::of(key), key);
        self.coordinator.end_op(worker, serial);
        result
    }

    fn read_chain(&self, hash: KeyHash, key: &[u8]) -> Result<Option<Vec<u8>>, Status> {
        let Some(entry) = self.index.find_entry(hash) else {
            return Ok(None);
        };
        let begin = self.log.begin_address();
        let mut address = entry.address();
        while address.is_valid() && address >= begin {
            let step = self
                .log
                .with_record(address, |record| {
                    let info = record.header.info;
                    if info.is_invalid() || record.key != key {
                        ChainStep::Next(info.previous_address())
                    } else if info.is_tombstone() {
                        ChainStep::Deleted
                    } else if info.is_object() {
                        ChainStep::Object(record.value.to_vec())
                    } else {
                        ChainStep::Found(record.value.to_vec())
                    }
                })
                .ok_or(Status::Corruption)?;
            match step {
                ChainStep::Next(previous) => address = previous,
                ChainStep::Found(value) => return Ok(Some(value)),
                ChainStep::Deleted => return Ok(None),
                ChainStep::Object(encoded) => {
                    return self
                        .log
                        .object_value(&encoded)
                        .map(Some)
                        .ok_or(Status::Corruption);
                }
            }
        }
        Ok(None)
    }

    pub(crate) fn refresh(&self, worker: WorkerId) -> u64 {
        self.coordinator.refresh(worker)
    }

    pub(crate) fn end_session(&self, worker: WorkerId) {
        self.coordinator.deregister_worker(worker);
    }
}

impl CheckpointParticipant for CprKv {
    fn begin_address(&self) -> Address {
        self.log.begin_address()
    }

    fn tail_address(&self) -> Address {
        self.log.tail_address()
    }

    fn flushed_until_address(&self) -> Address {
        self.log.flushed_until_address()
    }

    fn object_log_tail(&self) -> u64 {
        self.log.objects().tail()
    }

    fn uses_object_log(&self) -> bool {
        self.log.uses_object_log()
    }

    fn write_index_snapshot(&self, device: &dyn SyncStorageDevice) -> io::Result<IndexSnapshotInfo> {
        write_snapshot(&self.index, device)
    }

    fn start_log_flush(
        &self,
        target: Address,
        object_tail: u64,
        destination: FlushDestination,
    ) -> PendingFlush {
        self.log.start_flush(target, object_tail, destination)
    }
}

impl Drop for CprKv {
    fn drop(&mut self) {
        self.log.shutdown();
    }
}

impl std::fmt::Debug for CprKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CprKv")
            .field("config", &self.config)
            .field("log", &self.log)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}
