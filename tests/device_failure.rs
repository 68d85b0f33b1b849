//! Device and manager failures during checkpoint cycles.
//!
//! A failure before metadata is committed must leave the system at REST with the
//! minted tokens gone; a failure while committing must leave nothing recoverable
//! behind for the failed cycle.

mod common;

use std::sync::Arc;

use oxicpr::checkpoint::{CheckpointKind, CheckpointManager, InMemoryCheckpointManager};
use oxicpr::cpr::{CheckpointRequest, Phase};
use oxicpr::device::{MemoryDevice, SyncStorageDevice};
use oxicpr::error::CheckpointError;
use oxicpr::status::Status;
use oxicpr::store::CprKv;

use common::{
    key, open_store, recover_store, small_config, value, Devices, FaultInjectionDevice,
    FaultInjectionManager, ManagerCall,
};

struct Harness {
    inner: Arc<InMemoryCheckpointManager>,
    faulty: Arc<FaultInjectionManager>,
    devices: Devices,
    kv: Arc<CprKv>,
}

impl Harness {
    fn new(kind: CheckpointKind) -> Self {
        let inner = Arc::new(InMemoryCheckpointManager::new());
        let faulty = Arc::new(FaultInjectionManager::new(inner.clone()));
        let devices = Devices::new();
        let kv = open_store(&small_config(kind), &devices, faulty.clone());
        let mut session = kv.start_session().unwrap();
        for i in 0..20 {
            assert_eq!(session.upsert(&key(i), &value(i, 0)), Status::Ok);
        }
        Self {
            inner,
            faulty,
            devices,
            kv,
        }
    }

    fn assert_data_intact(&self) {
        let mut session = self.kv.start_session().unwrap();
        for i in 0..20 {
            assert_eq!(session.read(&key(i)).unwrap(), Some(value(i, 0)));
        }
    }

    fn assert_nothing_committed(&self) {
        assert!(self.inner.index_checkpoint_tokens().unwrap().is_empty());
        assert!(self.inner.log_checkpoint_tokens().unwrap().is_empty());
        assert_eq!(self.kv.coordinator().latest_pair(), None);
    }
}

fn device_phase(err: CheckpointError) -> Phase {
    match err {
        CheckpointError::Device { phase, .. } => phase,
        other => panic!("expected a device error, got {other}"),
    }
}

#[test]
fn test_token_initialization_failure() {
    let h = Harness::new(CheckpointKind::Snapshot);
    h.faulty.fail(ManagerCall::InitializeLog);

    let err = h.kv.checkpoint_full().unwrap_err();
    assert_eq!(device_phase(err), Phase::Rest);
    assert_eq!(h.kv.coordinator().system_state().phase, Phase::Rest);
    assert_eq!(h.kv.coordinator().system_state().version, 1);
    assert_eq!(h.inner.allocated_tokens(), 0);

    h.faulty.heal();
    let outcome = h.kv.checkpoint_full().unwrap();
    assert_eq!(outcome.version, 1);
}

#[test]
fn test_index_snapshot_failure_aborts_cycle() {
    let h = Harness::new(CheckpointKind::Snapshot);
    h.faulty.fail(ManagerCall::IndexDevice);

    let err = h.kv.checkpoint_full().unwrap_err();
    assert_eq!(device_phase(err), Phase::IndexChkpt);
    assert_eq!(h.kv.coordinator().system_state().version, 1);
    assert_eq!(h.inner.allocated_tokens(), 0);
    h.assert_nothing_committed();
    h.assert_data_intact();

    h.faulty.heal();
    h.kv.checkpoint_full().unwrap();
}

#[test]
fn test_snapshot_flush_failure_aborts_cycle() {
    let h = Harness::new(CheckpointKind::Snapshot);
    h.faulty.fail_artifact_flushes();

    let err = h
        .kv
        .checkpoint(CheckpointRequest::hybrid_log(CheckpointKind::Snapshot))
        .unwrap_err();
    assert_eq!(device_phase(err), Phase::WaitFlush);
    assert_eq!(h.kv.coordinator().system_state().phase, Phase::Rest);
    assert_eq!(h.inner.allocated_tokens(), 0);
    h.assert_nothing_committed();
    h.assert_data_intact();
}

#[test]
fn test_snapshot_device_unavailable() {
    let h = Harness::new(CheckpointKind::Snapshot);
    h.faulty.fail(ManagerCall::SnapshotDevice);

    let err = h.kv.checkpoint_full().unwrap_err();
    assert_eq!(device_phase(err), Phase::InProgress);
    h.assert_nothing_committed();
}

#[test]
fn test_index_commit_failure() {
    let h = Harness::new(CheckpointKind::Snapshot);
    h.faulty.fail(ManagerCall::CommitIndex);

    let err = h.kv.checkpoint_full().unwrap_err();
    assert!(matches!(err, CheckpointError::PersistenceFailed { .. }));
    // The captured version was already handed to workers.
    assert_eq!(h.kv.coordinator().system_state(), oxicpr::cpr::SystemState::rest(2));
    assert_eq!(h.inner.allocated_tokens(), 0);
    h.assert_nothing_committed();

    h.faulty.heal();
    let outcome = h.kv.checkpoint_full().unwrap();
    assert_eq!(outcome.version, 2);
}

#[test]
fn test_log_commit_failure_removes_index_metadata() {
    let h = Harness::new(CheckpointKind::Snapshot);
    h.faulty.fail(ManagerCall::CommitLog);

    let err = h.kv.checkpoint_full().unwrap_err();
    assert!(matches!(err, CheckpointError::PersistenceFailed { .. }));
    h.assert_nothing_committed();
    assert_eq!(h.inner.allocated_tokens(), 0);
}

#[test]
fn test_failed_cycle_leaves_previous_pair_recoverable() {
    let h = Harness::new(CheckpointKind::Snapshot);
    let good = h.kv.checkpoint_full().unwrap();

    {
        let mut session = h.kv.start_session().unwrap();
        for i in 0..20 {
            session.upsert(&key(i), &value(i, 1));
        }
    }
    h.faulty.fail(ManagerCall::CommitLog);
    h.kv.checkpoint_full().unwrap_err();
    h.faulty.heal();
    assert_eq!(h.kv.coordinator().latest_pair(), Some(good.pair));

    let Harness {
        inner, devices, kv, ..
    } = h;
    drop(kv);
    let (kv, report) = recover_store(&small_config(CheckpointKind::Snapshot), &devices, inner);
    assert_eq!(report.chosen, Some(good.pair));
    let mut session = kv.start_session().unwrap();
    for i in 0..20 {
        assert_eq!(session.read(&key(i)).unwrap(), Some(value(i, 0)));
    }
}

#[test]
fn test_fold_over_main_device_write_error() {
    let inner = Arc::new(MemoryDevice::new());
    let log = Arc::new(FaultInjectionDevice::new(inner.clone()));
    log.inject_write_error_at(1);
    let manager = Arc::new(InMemoryCheckpointManager::new());
    let kv = Arc::new(
        CprKv::new(
            small_config(CheckpointKind::FoldOver),
            log.clone(),
            Arc::new(MemoryDevice::new()),
            manager.clone(),
        )
        .unwrap(),
    );
    let mut session = kv.start_session().unwrap();
    session.upsert(b"k", b"v");

    let err = kv.checkpoint_hybrid_log().unwrap_err();
    assert_eq!(device_phase(err), Phase::WaitFlush);
    assert!(manager.log_checkpoint_tokens().unwrap().is_empty());
    assert!(log.write_count() >= 1);

    // The next attempt rewrites the same range.
    kv.checkpoint_hybrid_log().unwrap();
    assert!(inner.size_sync().unwrap() > 0);
}
