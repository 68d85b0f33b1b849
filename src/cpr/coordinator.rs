//! Checkpoint coordinator
//!
//! The coordinator owns the system state, the worker table and the latest valid
//! token pair. A cycle is started with [`CheckpointCoordinator::begin`] and driven
//! by the caller, one phase per [`CheckpointCycle::advance`]:
//!
//! | phase                  | work done before moving on                                  |
//! |------------------------|-------------------------------------------------------------|
//! | `PREP_INDEX_CHKPT`     | barrier, then record the log tail as the replay start       |
//! | `INDEX_CHKPT`          | barrier, then write the fuzzy index snapshot                |
//! | `PREPARE`              | barrier: every busy worker has moved to the new version     |
//! | `IN_PROGRESS`          | hand the covered log range to the flush worker              |
//! | `WAIT_FLUSH`           | block until the flush is durable                            |
//! | `PERSISTENCE_CALLBACK` | commit index metadata, then log metadata, then swap pair    |
//!
//! The final address and the session serial numbers are captured right after the
//! `PREPARE` barrier, when no worker can tag another mutation with the old version.

use std::fmt;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::address::Address;
use crate::checkpoint::{
    CheckpointKind, CheckpointManager, CheckpointToken, IndexCommitMetadata, LogCommitMetadata,
    SessionState, TokenPair,
};
use crate::constants::MAX_WORKERS;
use crate::cpr::gc::{collect_garbage, GcReport};
use crate::cpr::state_transitions::{Action, AtomicSystemState, Phase, SystemState};
use crate::cpr::workers::{WorkerId, WorkerTable};
use crate::cpr::CheckpointConfig;
use crate::device::SyncStorageDevice;
use crate::error::CheckpointError;
use crate::index::IndexSnapshotInfo;
use crate::log::{FlushDestination, PendingFlush};

/// The engine side of a checkpoint: what the coordinator snapshots and flushes.
pub trait CheckpointParticipant: Send + Sync {
    /// First valid log address
    fn begin_address(&self) -> Address;

    /// Current log tail
    fn tail_address(&self) -> Address;

    /// Durable prefix of the main log device
    fn flushed_until_address(&self) -> Address;

    /// Current object log tail
    fn object_log_tail(&self) -> u64;

    /// Whether any value lives in the object log
    fn uses_object_log(&self) -> bool;

    /// Write a fuzzy snapshot of the hash index to `device` and make it durable.
    fn write_index_snapshot(&self, device: &dyn SyncStorageDevice) -> io::Result<IndexSnapshotInfo>;

    /// Start making `[begin, target)` of the log and `[0, object_tail)` of the object
    /// log durable at `destination`.
    fn start_log_flush(
        &self,
        target: Address,
        object_tail: u64,
        destination: FlushDestination,
    ) -> PendingFlush;
}

/// What a checkpoint cycle should capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointRequest {
    /// Also snapshot the hash index
    pub with_index: bool,
    /// How the log range is persisted
    pub kind: CheckpointKind,
}

impl CheckpointRequest {
    /// Index and log checkpoint
    pub const fn full(kind: CheckpointKind) -> Self {
        Self {
            with_index: true,
            kind,
        }
    }

    /// Log checkpoint paired with the latest index checkpoint
    pub const fn hybrid_log(kind: CheckpointKind) -> Self {
        Self {
            with_index: false,
            kind,
        }
    }

    fn action(&self) -> Action {
        if self.with_index {
            Action::CheckpointFull
        } else {
            Action::CheckpointHybridLog
        }
    }
}

/// Result of a completed cycle
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointOutcome {
    /// The new latest valid pair
    pub pair: TokenPair,
    /// Captured version
    pub version: u64,
    /// Version the system runs at afterwards
    pub next_version: u64,
    /// Snapshot or fold-over
    pub kind: CheckpointKind,
    /// Everything before this address is covered
    pub final_address: Address,
    /// Replay start recorded in the index metadata, if the cycle took an index
    pub index_start_address: Option<Address>,
    /// Per-phase session states recorded in the log metadata
    pub session_states: Vec<SessionState>,
    /// Time spent in each phase
    pub phase_durations: Vec<(Phase, Duration)>,
    /// Garbage collected after the commit, when `keep_latest` is set
    pub gc: Option<GcReport>,
}

/// Drives checkpoint cycles and tracks the workers taking part in them
pub struct CheckpointCoordinator {
    state: AtomicSystemState,
    workers: WorkerTable,
    manager: Arc<dyn CheckpointManager>,
    latest: Mutex<Option<TokenPair>>,
    config: CheckpointConfig,
}

impl CheckpointCoordinator {
    /// Create a coordinator at REST with version `version`.
    ///
    /// `latest` is the pair the engine was recovered from, `None` on first start.
    pub fn new(
        manager: Arc<dyn CheckpointManager>,
        config: CheckpointConfig,
        version: u64,
        latest: Option<TokenPair>,
    ) -> Self {
        Self {
            state: AtomicSystemState::new(SystemState::rest(version.max(1))),
            workers: WorkerTable::new(MAX_WORKERS),
            manager,
            latest: Mutex::new(latest),
            config,
        }
    }

    /// Current system state
    pub fn system_state(&self) -> SystemState {
        self.state.load(Ordering::Acquire)
    }

    /// Latest pair committed by this coordinator, or the pair it was recovered from
    pub fn latest_pair(&self) -> Option<TokenPair> {
        *self.latest.lock()
    }

    /// Checkpoint manager the coordinator writes through
    pub fn manager(&self) -> &Arc<dyn CheckpointManager> {
        &self.manager
    }

    /// Checkpoint configuration
    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// Worker table
    pub fn workers(&self) -> &WorkerTable {
        &self.workers
    }

    /// Register a worker for session `guid` whose last completed serial is `serial`
    pub fn register_worker(&self, guid: Uuid, serial: u64) -> Option<WorkerId> {
        self.workers.register(guid, serial, &self.state)
    }

    /// Release a worker slot
    pub fn deregister_worker(&self, id: WorkerId) {
        self.workers.deregister(id);
    }

    /// Acknowledge the current phase; returns the worker's version.
    pub fn refresh(&self, id: WorkerId) -> u64 {
        self.workers.refresh(id, &self.state)
    }

    /// Enter an operation; returns the version to tag mutations with.
    pub fn begin_op(&self, id: WorkerId) -> u64 {
        self.workers.begin_op(id, &self.state)
    }

    /// Leave an operation that completed as serial number `serial`.
    pub fn end_op(&self, id: WorkerId, serial: u64) {
        self.workers.end_op(id, serial);
    }

    /// Move a worker to at least `head_version`; returns its new version.
    pub fn shift_version(&self, id: WorkerId, head_version: u64) -> u64 {
        self.workers.shift_version(id, &self.state, head_version)
    }

    /// Collect every checkpoint older than the latest pair.
    ///
    /// Returns `None` when there is no latest pair yet.
    pub fn collect_garbage(&self, pinned: &[CheckpointToken]) -> Option<GcReport> {
        let keep = self.latest_pair()?;
        Some(collect_garbage(self.manager.as_ref(), keep, pinned))
    }

    /// Start a checkpoint cycle.
    ///
    /// Tokens are minted and initialized here. Fails with `AlreadyInProgress` if
    /// another cycle is running.
    pub fn begin<'a>(
        &'a self,
        participant: &'a dyn CheckpointParticipant,
        request: CheckpointRequest,
    ) -> Result<CheckpointCycle<'a>, CheckpointError> {
        let previous = self
            .state
            .try_start_action(request.action())
            .map_err(|current| CheckpointError::AlreadyInProgress {
                action: current.action,
                phase: current.phase,
            })?;
        let version = previous.version;
        let log_token = Uuid::new_v4();
        let index_token = request.with_index.then(Uuid::new_v4);

        let initialized = index_token
            .map_or(Ok(()), |token| self.manager.initialize_index_checkpoint(token))
            .and_then(|()| self.manager.initialize_log_checkpoint(log_token));
        if let Err(source) = initialized {
            self.purge_uncommitted(index_token, log_token);
            self.state.store(SystemState::rest(version), Ordering::SeqCst);
            return Err(CheckpointError::Device {
                phase: Phase::Rest,
                source,
            });
        }

        let state = self.state.load(Ordering::SeqCst);
        tracing::info!(
            version,
            action = ?state.action,
            kind = request.kind.as_str(),
            index_token = ?index_token,
            log_token = %log_token,
            "checkpoint started"
        );

        Ok(CheckpointCycle {
            coordinator: self,
            participant,
            kind: request.kind,
            state,
            version,
            index_token,
            log_token,
            index_start: None,
            index_meta: None,
            final_address: Address::INVALID,
            object_tail: 0,
            session_states: Vec::new(),
            flush: None,
            phase_started: Instant::now(),
            durations: Vec::new(),
            finished: false,
            aborted: None,
            outcome: None,
        })
    }

    fn purge_uncommitted(&self, index_token: Option<CheckpointToken>, log_token: CheckpointToken) {
        if let Some(token) = index_token {
            if let Err(e) = self.manager.purge_index_artifacts(token) {
                tracing::warn!(token = %token, error = %e, "failed to purge index artifacts");
            }
        }
        if let Err(e) = self.manager.purge_log_artifacts(log_token) {
            tracing::warn!(token = %log_token, error = %e, "failed to purge log artifacts");
        }
    }
}

impl fmt::Debug for CheckpointCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointCoordinator")
            .field("state", &self.system_state())
            .field("workers", &self.workers)
            .field("latest", &self.latest_pair())
            .finish()
    }
}

/// One checkpoint cycle in flight.
///
/// Dropping an unfinished cycle aborts it, or completes it if it already reached
/// `PERSISTENCE_CALLBACK`.
pub struct CheckpointCycle<'a> {
    coordinator: &'a CheckpointCoordinator,
    participant: &'a dyn CheckpointParticipant,
    kind: CheckpointKind,
    state: SystemState,
    version: u64,
    index_token: Option<CheckpointToken>,
    log_token: CheckpointToken,
    index_start: Option<Address>,
    index_meta: Option<IndexCommitMetadata>,
    final_address: Address,
    object_tail: u64,
    session_states: Vec<SessionState>,
    flush: Option<PendingFlush>,
    phase_started: Instant,
    durations: Vec<(Phase, Duration)>,
    finished: bool,
    aborted: Option<(Phase, String)>,
    outcome: Option<CheckpointOutcome>,
}

impl<'a> CheckpointCycle<'a> {
    /// Phase the cycle is in
    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    /// Version being captured
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Tokens minted for this cycle
    pub fn tokens(&self) -> (Option<CheckpointToken>, CheckpointToken) {
        (self.index_token, self.log_token)
    }

    /// Outcome, once the cycle is back at REST
    pub fn outcome(&self) -> Option<&CheckpointOutcome> {
        self.outcome.as_ref()
    }

    /// Do the work of the current phase and move to the next one.
    ///
    /// Returns the phase entered. Device failures and barrier timeouts abort the
    /// cycle before returning the error.
    pub fn advance(&mut self) -> Result<Phase, CheckpointError> {
        if self.finished {
            return Err(match &self.aborted {
                Some((phase, reason)) => CheckpointError::Aborted {
                    phase: *phase,
                    reason: reason.clone(),
                },
                None => CheckpointError::Finished,
            });
        }
        match self.state.phase {
            Phase::PrepIndexChkpt => self.handle_prep_index_checkpoint()?,
            Phase::IndexChkpt => self.handle_index_checkpoint()?,
            Phase::Prepare => self.handle_prepare()?,
            Phase::InProgress => self.handle_in_progress()?,
            Phase::WaitFlush => self.handle_wait_flush()?,
            Phase::PersistenceCallback => self.handle_persistence_callback()?,
            Phase::Rest => unreachable!("unfinished cycle at REST"),
        }
        Ok(self.state.phase)
    }

    /// Drive the cycle to completion.
    pub fn run(mut self) -> Result<CheckpointOutcome, CheckpointError> {
        while !self.finished {
            self.advance()?;
        }
        self.outcome.take().ok_or(CheckpointError::Finished)
    }

    /// Abandon the cycle.
    ///
    /// Only possible before `PERSISTENCE_CALLBACK`. Minted tokens are purged and
    /// the system returns to REST at the version it had before the cycle.
    pub fn abort(&mut self, reason: impl Into<String>) -> Result<(), CheckpointError> {
        if self.finished {
            return Err(CheckpointError::Finished);
        }
        let phase = self.state.phase;
        if phase == Phase::PersistenceCallback {
            return Err(CheckpointError::NotAbortable { phase });
        }
        let reason = reason.into();
        self.rollback();
        tracing::warn!(
            version = self.version,
            phase = %phase,
            reason = %reason,
            "checkpoint aborted"
        );
        self.aborted = Some((phase, reason));
        Ok(())
    }

    fn handle_prep_index_checkpoint(&mut self) -> Result<(), CheckpointError> {
        self.barrier()?;
        self.index_start = Some(self.participant.tail_address());
        self.transition();
        Ok(())
    }

    fn handle_index_checkpoint(&mut self) -> Result<(), CheckpointError> {
        // Operations that started before the start address was read must finish
        // before their index updates can be relied on in the snapshot.
        self.barrier()?;
        let Some(token) = self.index_token else {
            unreachable!("index phase without an index token");
        };
        let info = self
            .coordinator
            .manager
            .index_device(token)
            .and_then(|device| self.participant.write_index_snapshot(device.as_ref()));
        let info = match info {
            Ok(info) => info,
            Err(source) => return Err(self.fail_device(source)),
        };
        self.index_meta = Some(IndexCommitMetadata {
            token,
            version: self.version,
            table_size: info.table_size,
            num_overflow_buckets: info.num_overflow_buckets,
            num_entries: info.num_entries,
            log_begin_address: self.participant.begin_address(),
            checkpoint_start_address: self.index_start.unwrap_or(Address::FIRST_VALID),
            snapshot_len: info.len,
            snapshot_checksum: info.checksum,
        });
        self.transition();
        Ok(())
    }

    fn handle_prepare(&mut self) -> Result<(), CheckpointError> {
        self.barrier()?;
        self.transition();
        self.final_address = self.participant.tail_address();
        self.object_tail = self.participant.object_log_tail();
        self.session_states = self.coordinator.workers.session_states(self.version);
        Ok(())
    }

    fn handle_in_progress(&mut self) -> Result<(), CheckpointError> {
        let destination = match self.kind {
            CheckpointKind::FoldOver => FlushDestination::MainDevice,
            CheckpointKind::Snapshot => {
                let manager = &self.coordinator.manager;
                let devices = manager.snapshot_log_device(self.log_token).and_then(|log| {
                    manager
                        .snapshot_object_log_device(self.log_token)
                        .map(|objects| (log, objects))
                });
                match devices {
                    Ok((log, objects)) => FlushDestination::Snapshot { log, objects },
                    Err(source) => return Err(self.fail_device(source)),
                }
            }
        };
        self.flush = Some(self.participant.start_log_flush(
            self.final_address,
            self.object_tail,
            destination,
        ));
        self.transition();
        Ok(())
    }

    fn handle_wait_flush(&mut self) -> Result<(), CheckpointError> {
        if let Some(flush) = self.flush.take() {
            if let Err(source) = flush.wait() {
                return Err(self.fail_device(source));
            }
        }
        self.transition();
        Ok(())
    }

    fn handle_persistence_callback(&mut self) -> Result<(), CheckpointError> {
        if let Err(source) = self.commit_metadata() {
            return Err(self.fail_persistence(source));
        }

        let pair = {
            let mut latest = self.coordinator.latest.lock();
            let index_token = self
                .index_token
                .or_else(|| latest.and_then(|pair| pair.index_token));
            let pair = TokenPair::new(index_token, self.log_token);
            *latest = Some(pair);
            pair
        };
        self.transition();
        self.finished = true;

        let gc = self
            .coordinator
            .config
            .keep_latest
            .then(|| collect_garbage(self.coordinator.manager.as_ref(), pair, &[]));

        tracing::info!(
            version = self.version,
            pair = %pair,
            kind = self.kind.as_str(),
            final_address = %self.final_address,
            "checkpoint completed"
        );

        self.outcome = Some(CheckpointOutcome {
            pair,
            version: self.version,
            next_version: self.version + 1,
            kind: self.kind,
            final_address: self.final_address,
            index_start_address: self.index_meta.as_ref().map(|m| m.checkpoint_start_address),
            session_states: std::mem::take(&mut self.session_states),
            phase_durations: std::mem::take(&mut self.durations),
            gc,
        });
        Ok(())
    }

    fn commit_metadata(&self) -> io::Result<()> {
        let manager = &self.coordinator.manager;
        if let Some(meta) = &self.index_meta {
            manager.commit_index_checkpoint(meta.token, &meta.encode()?)?;
        }
        let meta = LogCommitMetadata {
            token: self.log_token,
            version: self.version,
            next_version: self.version + 1,
            kind: self.kind,
            index_token: self.index_token,
            begin_address: self.participant.begin_address(),
            final_address: self.final_address,
            flushed_until_address: self.participant.flushed_until_address(),
            use_object_log: self.participant.uses_object_log(),
            object_log_tail: self.object_tail,
            session_states: self.session_states.clone(),
        };
        manager.commit_log_checkpoint(self.log_token, &meta.encode()?)
    }

    fn transition(&mut self) {
        let expected = self.state;
        let next = match self.coordinator.state.try_advance(expected) {
            Ok(next) => next,
            Err(actual) => panic!(
                "system state changed outside the checkpoint cycle: expected {expected:?}, found {actual:?}"
            ),
        };
        let now = Instant::now();
        self.durations
            .push((expected.phase, now.duration_since(self.phase_started)));
        self.phase_started = now;
        self.state = next;
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                from = %expected.phase,
                to = %next.phase,
                version = next.version,
                "checkpoint phase transition"
            );
        }
    }

    /// Wait until every worker has acknowledged the current state.
    fn barrier(&mut self) -> Result<(), CheckpointError> {
        let control = self.state.to_control();
        let timeout = Duration::from_millis(self.coordinator.config.barrier_timeout_ms);
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        loop {
            let pending = self.coordinator.workers.pending(control);
            if pending == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                let phase = self.state.phase;
                self.rollback();
                tracing::warn!(
                    version = self.version,
                    phase = %phase,
                    pending,
                    "checkpoint barrier timed out"
                );
                return Err(CheckpointError::BarrierTimeout { phase, pending });
            }
            if backoff.is_completed() {
                thread::sleep(Duration::from_micros(100));
            } else {
                backoff.snooze();
            }
        }
    }

    fn fail_device(&mut self, source: io::Error) -> CheckpointError {
        let phase = self.state.phase;
        self.rollback();
        tracing::warn!(
            version = self.version,
            phase = %phase,
            error = %source,
            "checkpoint device error"
        );
        CheckpointError::Device { phase, source }
    }

    /// Undo a cycle that has not begun committing metadata.
    fn rollback(&mut self) {
        if let Some(flush) = self.flush.take() {
            let _ = flush.wait();
        }
        self.coordinator
            .purge_uncommitted(self.index_token, self.log_token);
        self.coordinator
            .state
            .store(SystemState::rest(self.version), Ordering::SeqCst);
        self.state = SystemState::rest(self.version);
        self.finished = true;
    }

    /// Remove whatever metadata made it out; a token's artifacts are purged only
    /// once its metadata is known to be gone.
    fn fail_persistence(&mut self, source: io::Error) -> CheckpointError {
        let manager = &self.coordinator.manager;
        match manager.remove_log_commit_metadata(self.log_token) {
            Ok(()) => {
                if let Err(e) = manager.purge_log_artifacts(self.log_token) {
                    tracing::warn!(token = %self.log_token, error = %e, "failed to purge log artifacts");
                }
            }
            Err(e) => {
                tracing::warn!(token = %self.log_token, error = %e, "failed to remove log metadata")
            }
        }
        if let Some(token) = self.index_token {
            match manager.remove_index_commit_metadata(token) {
                Ok(()) => {
                    if let Err(e) = manager.purge_index_artifacts(token) {
                        tracing::warn!(token = %token, error = %e, "failed to purge index artifacts");
                    }
                }
                Err(e) => {
                    tracing::warn!(token = %token, error = %e, "failed to remove index metadata")
                }
            }
        }

        // Workers may already hold the new version; never hand it out twice.
        let next_version = self.version + 1;
        self.coordinator
            .state
            .store(SystemState::rest(next_version), Ordering::SeqCst);
        self.state = SystemState::rest(next_version);
        self.finished = true;
        tracing::warn!(
            version = self.version,
            error = %source,
            "checkpoint commit failed"
        );
        CheckpointError::PersistenceFailed { source }
    }
}

impl Drop for CheckpointCycle<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if self.state.phase == Phase::PersistenceCallback {
            let _ = self.handle_persistence_callback();
        } else {
            let _ = self.abort("checkpoint cycle dropped");
        }
    }
}

impl fmt::Debug for CheckpointCycle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointCycle")
            .field("state", &self.state)
            .field("kind", &self.kind)
            .field("index_token", &self.index_token)
            .field("log_token", &self.log_token)
            .field("finished", &self.finished)
            .finish()
    }
}
