//! Checkpoints taken while sessions keep writing from several threads.
//!
//! Every session writes its own keys in serial order, so the recovered state of a
//! session must be exactly its first `serial_num` writes.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use rand::Rng;

use oxicpr::checkpoint::{CheckpointKind, InMemoryCheckpointManager};
use oxicpr::status::Status;
use oxicpr::store::CprKv;

use common::{open_store, recover_store, small_config, Devices};

const THREADS: u64 = 4;

fn thread_key(thread: u64, n: u64) -> Vec<u8> {
    format!("t{thread}-{n:07}").into_bytes()
}

fn spawn_writers(
    kv: &Arc<CprKv>,
    stop: &Arc<AtomicBool>,
    ready: &Arc<Barrier>,
) -> Vec<thread::JoinHandle<(uuid::Uuid, u64)>> {
    (0..THREADS)
        .map(|t| {
            let kv = Arc::clone(kv);
            let stop = Arc::clone(stop);
            let ready = Arc::clone(ready);
            thread::spawn(move || {
                let mut session = kv.start_session().unwrap();
                let mut rng = rand::thread_rng();
                ready.wait();
                let mut n = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    let len = rng.gen_range(1..64);
                    let value = vec![t as u8; len];
                    assert_eq!(session.upsert(&thread_key(t, n), &value), Status::Ok);
                    n += 1;
                    if n % 256 == 0 {
                        thread::yield_now();
                    }
                }
                (session.guid(), session.serial_num())
            })
        })
        .collect()
}

fn checkpoint_under_load(kind: CheckpointKind) {
    let mut config = small_config(kind);
    config.store.table_size = 1 << 12;
    config.store.page_size_bits = 16;
    let devices = Devices::new();
    let manager = Arc::new(InMemoryCheckpointManager::new());
    let kv = open_store(&config, &devices, manager.clone());

    let stop = Arc::new(AtomicBool::new(false));
    let ready = Arc::new(Barrier::new(THREADS as usize + 1));
    let writers = spawn_writers(&kv, &stop, &ready);
    ready.wait();

    let mut rng = rand::thread_rng();
    thread::sleep(Duration::from_millis(rng.gen_range(5..20)));
    kv.checkpoint_full().unwrap();
    thread::sleep(Duration::from_millis(rng.gen_range(5..20)));
    let last = kv.checkpoint_hybrid_log().unwrap();
    thread::sleep(Duration::from_millis(5));

    stop.store(true, Ordering::Relaxed);
    let mut live = Vec::new();
    for (t, handle) in writers.into_iter().enumerate() {
        live.push((t as u64, handle.join().unwrap()));
    }
    drop(kv);
    devices.crash();
    manager.simulate_crash();

    let (kv, report) = recover_store(&config, &devices, manager);
    assert_eq!(report.chosen, Some(last.pair));
    let mut reader = kv.start_session().unwrap();
    for (t, (guid, final_serial)) in live {
        let recovered = report
            .session_states
            .iter()
            .find(|s| s.guid == guid)
            .map(|s| s.serial_num)
            .unwrap();
        assert!(recovered <= final_serial);
        for n in 0..recovered {
            assert!(
                reader.read(&thread_key(t, n)).unwrap().is_some(),
                "thread {t} lost write {n} of {recovered}"
            );
        }
        // Nothing after the recovery point survives.
        for n in recovered..(recovered + 64).min(final_serial) {
            assert_eq!(
                reader.read(&thread_key(t, n)).unwrap(),
                None,
                "thread {t} kept write {n} past {recovered}"
            );
        }
    }
}

#[test]
fn test_snapshot_checkpoint_under_load_is_prefix_consistent() {
    checkpoint_under_load(CheckpointKind::Snapshot);
}

#[test]
fn test_fold_over_checkpoint_under_load_is_prefix_consistent() {
    checkpoint_under_load(CheckpointKind::FoldOver);
}

#[test]
fn test_sessions_joining_mid_cycle() {
    let config = small_config(CheckpointKind::Snapshot);
    let kv = open_store(
        &config,
        &Devices::new(),
        Arc::new(InMemoryCheckpointManager::new()),
    );
    let stop = Arc::new(AtomicBool::new(false));

    let churn = {
        let kv = Arc::clone(&kv);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut opened = 0u64;
            loop {
                let mut session = kv.start_session().unwrap();
                session.upsert(b"churn", &opened.to_le_bytes());
                opened += 1;
                if stop.load(Ordering::Relaxed) {
                    return opened;
                }
            }
        })
    };

    for _ in 0..10 {
        kv.checkpoint_full().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    assert!(churn.join().unwrap() > 0);
    assert_eq!(kv.coordinator().system_state().version, 11);
    assert_eq!(kv.coordinator().workers().active(), 0);
}
