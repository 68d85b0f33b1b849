//! Crash at every point of a checkpoint cycle and recover.
//!
//! A crash is modelled by leaking the in-flight cycle (so nothing runs on drop),
//! dropping the store, then discarding every unflushed byte of the devices and of
//! the manager's artifacts. Torn writes persist only a prefix of one write, and
//! on-disk cuts truncate the files a cycle wrote at an arbitrary byte.

mod common;

use std::path::Path;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;

use oxicpr::checkpoint::{
    CheckpointKind, CheckpointManager, InMemoryCheckpointManager, LocalCheckpointManager,
    TokenPair,
};
use oxicpr::cpr::{CheckpointRequest, Phase};
use oxicpr::device::{DeviceHandle, FileSystemFile};
use oxicpr::store::CprKv;
use oxicpr::RecoveryReport;

use common::{
    cut_written_ranges, file_len, key, open_store, recover_store, small_config, value, Devices,
    FaultInjectionDevice, FaultInjectionManager, WrittenRange,
};

fn write(kv: &Arc<CprKv>, keys: &[u64], round: u64) {
    let mut session = kv.start_session().unwrap();
    for &i in keys {
        assert!(session.upsert(&key(i), &value(i, round)).is_ok());
    }
}

fn crash_after(kind: CheckpointKind, request: CheckpointRequest, steps: usize) {
    let config = small_config(kind);
    let devices = Devices::new();
    let manager = Arc::new(InMemoryCheckpointManager::new());
    let kv = open_store(&config, &devices, manager.clone());

    let mut keys: Vec<u64> = (0..64).collect();
    keys.shuffle(&mut rand::thread_rng());
    write(&kv, &keys, 0);
    let good = kv.checkpoint_full().unwrap();
    write(&kv, &keys[..32], 1);

    let mut cycle = kv.coordinator().begin(kv.as_ref(), request).unwrap();
    for _ in 0..steps {
        if cycle.phase() == Phase::PersistenceCallback {
            break;
        }
        cycle.advance().unwrap();
    }
    std::mem::forget(cycle);
    drop(kv);
    devices.crash();
    manager.simulate_crash();

    let (kv, report) = recover_store(&config, &devices, manager.clone());
    assert_eq!(report.chosen, Some(good.pair), "crash after {steps} steps");
    let mut session = kv.start_session().unwrap();
    for i in 0..64 {
        assert_eq!(session.read(&key(i)).unwrap(), Some(value(i, 0)));
    }

    // The recovered store overwrites whatever the interrupted cycle left behind.
    write(&kv, &keys[..8], 2);
    let next = kv.checkpoint_full().unwrap();
    drop(session);
    drop(kv);
    devices.crash();
    let (kv, report) = recover_store(&config, &devices, manager);
    assert_eq!(report.chosen, Some(next.pair));
    let mut session = kv.start_session().unwrap();
    for &i in &keys[..8] {
        assert_eq!(session.read(&key(i)).unwrap(), Some(value(i, 2)));
    }
    for &i in &keys[8..] {
        assert_eq!(session.read(&key(i)).unwrap(), Some(value(i, 0)));
    }
}

#[test]
fn test_crash_at_every_phase_of_full_snapshot_cycle() {
    for steps in 0..=5 {
        crash_after(
            CheckpointKind::Snapshot,
            CheckpointRequest::full(CheckpointKind::Snapshot),
            steps,
        );
    }
}

#[test]
fn test_crash_at_every_phase_of_fold_over_cycle() {
    for steps in 0..=3 {
        crash_after(
            CheckpointKind::FoldOver,
            CheckpointRequest::hybrid_log(CheckpointKind::FoldOver),
            steps,
        );
    }
}

#[test]
fn test_flushed_bytes_beyond_final_address_are_ignored() {
    let config = small_config(CheckpointKind::FoldOver);
    let devices = Devices::new();
    let manager = Arc::new(InMemoryCheckpointManager::new());
    let kv = open_store(&config, &devices, manager.clone());

    let keys: Vec<u64> = (0..50).collect();
    write(&kv, &keys, 0);
    let good = kv.checkpoint_full().unwrap();
    let mut rng = rand::thread_rng();
    let extra: Vec<u64> = (0..30).map(|_| rng.gen_range(50..1000)).collect();
    write(&kv, &extra, 1);

    // Flush durable, then crash before committing.
    let mut cycle = kv
        .coordinator()
        .begin(
            kv.as_ref(),
            CheckpointRequest::hybrid_log(CheckpointKind::FoldOver),
        )
        .unwrap();
    while cycle.phase() != Phase::PersistenceCallback {
        cycle.advance().unwrap();
    }
    std::mem::forget(cycle);
    drop(kv);
    devices.crash();
    assert!(devices.log.durable_bytes().len() as u64 > good.final_address.control());

    let (kv, report) = recover_store(&config, &devices, manager.clone());
    assert_eq!(report.chosen, Some(good.pair));
    assert!(manager.log_checkpoint_tokens().unwrap().len() == 1);
    let mut session = kv.start_session().unwrap();
    for &i in &extra {
        assert_eq!(session.read(&key(i)).unwrap(), None);
    }
    for &i in &keys {
        assert_eq!(session.read(&key(i)).unwrap(), Some(value(i, 0)));
    }
}

/// The recovered store holds exactly one of the two checkpoints: `keys[..changed]`
/// carry round 1 when the newer one survived, everything else carries round 0.
fn assert_old_or_new(
    kv: &Arc<CprKv>,
    report: &RecoveryReport,
    keys: &[u64],
    changed: usize,
    old: TokenPair,
    new: Option<TokenPair>,
) {
    assert_eq!(report.chosen, Some(new.unwrap_or(old)));
    let round = u64::from(new.is_some());
    let mut session = kv.start_session().unwrap();
    for &i in &keys[..changed] {
        assert_eq!(session.read(&key(i)).unwrap(), Some(value(i, round)), "key {i}");
    }
    for &i in &keys[changed..] {
        assert_eq!(session.read(&key(i)).unwrap(), Some(value(i, 0)), "key {i}");
    }
}

fn torn_fold_over_flush(tear_at: u64, keep: usize) {
    let config = small_config(CheckpointKind::FoldOver);
    let devices = Devices::new();
    let manager = Arc::new(InMemoryCheckpointManager::new());
    let log = Arc::new(FaultInjectionDevice::new(devices.log.clone()));
    let kv = Arc::new(
        CprKv::new(
            config.clone(),
            log.clone(),
            devices.objects.clone(),
            manager.clone(),
        )
        .unwrap(),
    );

    let keys: Vec<u64> = (0..64).collect();
    write(&kv, &keys, 0);
    let good = kv.checkpoint_full().unwrap();
    write(&kv, &keys[..40], 1);

    log.tear_write_at(log.write_count() + tear_at, keep);
    let next = kv.checkpoint_hybrid_log().ok().map(|outcome| outcome.pair);
    drop(kv);
    devices.crash();
    manager.simulate_crash();

    let (kv, report) = recover_store(&config, &devices, manager);
    assert_old_or_new(&kv, &report, &keys, 40, good.pair, next);
}

#[test]
fn test_torn_main_log_write_during_fold_over() {
    let mut rng = rand::thread_rng();
    for tear_at in 1..=4 {
        for keep in [0, 1, rng.gen_range(2..512), rng.gen_range(512..4096)] {
            torn_fold_over_flush(tear_at, keep);
        }
    }
}

fn torn_snapshot_artifacts(tear_at: u64, keep: usize) {
    let config = small_config(CheckpointKind::Snapshot);
    let devices = Devices::new();
    let inner = Arc::new(InMemoryCheckpointManager::new());
    let manager = Arc::new(FaultInjectionManager::new(inner.clone()));
    let kv = open_store(&config, &devices, manager.clone());

    let keys: Vec<u64> = (0..64).collect();
    write(&kv, &keys, 0);
    let good = kv.checkpoint_full().unwrap();
    write(&kv, &keys[..40], 1);

    manager.tear_artifact_writes(tear_at, keep);
    let next = kv.checkpoint_full().ok().map(|outcome| outcome.pair);
    manager.heal();
    drop(kv);
    devices.crash();
    inner.simulate_crash();

    let (kv, report) = recover_store(&config, &devices, inner);
    assert_old_or_new(&kv, &report, &keys, 40, good.pair, next);
}

#[test]
fn test_torn_snapshot_artifact_write() {
    let mut rng = rand::thread_rng();
    for tear_at in 1..=4 {
        for keep in [0, rng.gen_range(1..64), rng.gen_range(64..4096)] {
            torn_snapshot_artifacts(tear_at, keep);
        }
    }
}

fn disk_devices(root: &Path) -> (DeviceHandle, DeviceHandle) {
    let log = FileSystemFile::open(root.join("hlog.dat"), true).unwrap();
    let objects = FileSystemFile::open(root.join("hlog.obj.dat"), true).unwrap();
    (Arc::new(log), Arc::new(objects))
}

/// A store on disk with one committed checkpoint and a second full checkpoint
/// written after it, along with every byte range the second one wrote, in
/// write order.
struct TwoCheckpoints {
    root: tempfile::TempDir,
    keys: Vec<u64>,
    old: TokenPair,
    new: TokenPair,
    written: Vec<WrittenRange>,
}

const CHANGED: usize = 32;

fn two_checkpoints_on_disk(kind: CheckpointKind) -> TwoCheckpoints {
    let root = tempfile::tempdir().unwrap();
    let manager =
        Arc::new(LocalCheckpointManager::new(root.path().join("checkpoints")).unwrap());
    let (log, objects) = disk_devices(root.path());
    let kv = Arc::new(CprKv::new(small_config(kind), log, objects, manager.clone()).unwrap());

    let mut keys: Vec<u64> = (0..64).collect();
    keys.shuffle(&mut rand::thread_rng());
    write(&kv, &keys, 0);
    let old = kv.checkpoint_full().unwrap().pair;
    let main_log = root.path().join("hlog.dat");
    let main_log_before = file_len(&main_log);
    write(&kv, &keys[..CHANGED], 1);
    let new = kv.checkpoint_full().unwrap().pair;
    drop(kv);

    let index_token = new.index_token.unwrap();
    let mut written = vec![WrittenRange::whole(
        manager.index_checkpoint_dir(index_token).join("ht.dat"),
    )];
    match kind {
        CheckpointKind::FoldOver => written.push(WrittenRange {
            end: file_len(&main_log),
            path: main_log,
            start: main_log_before,
        }),
        CheckpointKind::Snapshot => {
            let dir = manager.log_checkpoint_dir(new.log_token);
            written.push(WrittenRange::whole(dir.join("snapshot.dat")));
            written.push(WrittenRange::whole(dir.join("snapshot.obj.dat")));
        }
    }
    written.push(WrittenRange::whole(manager.index_metadata_path(index_token)));
    written.push(WrittenRange::whole(manager.log_metadata_path(new.log_token)));

    TwoCheckpoints {
        root,
        keys,
        old,
        new,
        written,
    }
}

fn cut_checkpoint_on_disk(kind: CheckpointKind, pick: impl Fn(u64) -> u64) {
    let run = two_checkpoints_on_disk(kind);
    let total: u64 = run.written.iter().map(WrittenRange::len).sum();
    assert!(total > 0);
    let offset = pick(total);
    cut_written_ranges(&run.written, offset).unwrap();

    let manager =
        Arc::new(LocalCheckpointManager::new(run.root.path().join("checkpoints")).unwrap());
    let (log, objects) = disk_devices(run.root.path());
    let (kv, report) = CprKv::recover(small_config(kind), log, objects, manager)
        .unwrap_or_else(|e| panic!("cut at {offset} of {total}: {e}"));
    let new = (offset == total).then_some(run.new);
    assert_old_or_new(&Arc::new(kv), &report, &run.keys, CHANGED, run.old, new);
}

fn cut_at_random_offsets(kind: CheckpointKind) {
    cut_checkpoint_on_disk(kind, |total| total);
    cut_checkpoint_on_disk(kind, |total| total - 1);
    cut_checkpoint_on_disk(kind, |_| 0);
    for _ in 0..12 {
        cut_checkpoint_on_disk(kind, |total| rand::thread_rng().gen_range(0..total));
    }
}

#[test]
fn test_snapshot_checkpoint_cut_at_random_byte() {
    cut_at_random_offsets(CheckpointKind::Snapshot);
}

#[test]
fn test_fold_over_checkpoint_cut_at_random_byte() {
    cut_at_random_offsets(CheckpointKind::FoldOver);
}
