//! Worker table: per-worker CPR state and the phase barrier
//!
//! Each worker (a session) owns one slot. A worker brackets every operation with
//! [`WorkerTable::begin_op`] and [`WorkerTable::end_op`]. `begin_op` raises the
//! `busy` flag and then loads the system state; the coordinator stores a new
//! state and then inspects `busy`. Both sides use `SeqCst`, so either the worker
//! sees the new state before its operation runs, or the coordinator sees the
//! worker busy and waits for it to finish or to observe the new state.
//!
//! A worker acknowledges a phase by recording the packed state it last observed.
//! Acknowledgement never blocks the worker.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::checkpoint::SessionState;
use crate::cpr::state_transitions::{AtomicSystemState, SystemState};

/// Slot index of a registered worker
pub type WorkerId = usize;

#[derive(Default)]
struct WorkerSlot {
    in_use: AtomicBool,
    busy: AtomicBool,
    /// Packed system state this worker last refreshed against
    observed: AtomicU64,
    /// Version the worker tags its mutations with
    version: AtomicU64,
    /// Serial number of the last completed operation
    serial: AtomicU64,
    /// Value of `serial` when `version` last increased
    switch_serial: AtomicU64,
    guid: Mutex<Uuid>,
}

/// Fixed-capacity table of worker slots
pub struct WorkerTable {
    slots: Box<[CachePadded<WorkerSlot>]>,
}

impl WorkerTable {
    /// Create a table with room for `capacity` concurrent workers
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity)
                .map(|_| CachePadded::new(WorkerSlot::default()))
                .collect(),
        }
    }

    /// Maximum number of concurrent workers
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of registered workers
    pub fn active(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.in_use.load(Ordering::Acquire))
            .count()
    }

    fn slot(&self, id: WorkerId) -> &WorkerSlot {
        let slot = &self.slots[id];
        assert!(
            slot.in_use.load(Ordering::Relaxed),
            "worker {id} used without being registered"
        );
        slot
    }

    /// Claim a free slot for session `guid` whose last completed serial is `serial`.
    ///
    /// Returns `None` when every slot is taken.
    pub fn register(&self, guid: Uuid, serial: u64, state: &AtomicSystemState) -> Option<WorkerId> {
        let id = self.slots.iter().position(|slot| {
            slot.in_use
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
        })?;
        let slot = &self.slots[id];
        *slot.guid.lock() = guid;
        slot.serial.store(serial, Ordering::SeqCst);
        slot.switch_serial.store(serial, Ordering::SeqCst);
        let control = state.load_control(Ordering::SeqCst);
        slot.version
            .store(SystemState::from_control(control).version, Ordering::SeqCst);
        slot.observed.store(control, Ordering::SeqCst);
        Some(id)
    }

    /// Release a slot
    pub fn deregister(&self, id: WorkerId) {
        let slot = self.slot(id);
        assert!(
            !slot.busy.load(Ordering::Relaxed),
            "worker {id} deregistered inside an operation"
        );
        slot.in_use.store(false, Ordering::SeqCst);
    }

    fn observe(&self, slot: &WorkerSlot, state: &AtomicSystemState) -> u64 {
        let control = state.load_control(Ordering::SeqCst);
        if control != slot.observed.load(Ordering::Relaxed) {
            let system_version = SystemState::from_control(control).version;
            let local = slot.version.load(Ordering::Relaxed);
            if system_version > local {
                slot.switch_serial
                    .store(slot.serial.load(Ordering::Relaxed), Ordering::SeqCst);
                slot.version.store(system_version, Ordering::SeqCst);
            }
            slot.observed.store(control, Ordering::SeqCst);
        }
        slot.version.load(Ordering::Relaxed)
    }

    /// Enter an operation; returns the version to tag mutations with.
    pub fn begin_op(&self, id: WorkerId, state: &AtomicSystemState) -> u64 {
        let slot = self.slot(id);
        debug_assert!(!slot.busy.load(Ordering::Relaxed), "nested operation on worker {id}");
        slot.busy.store(true, Ordering::SeqCst);
        self.observe(slot, state)
    }

    /// Leave an operation that completed with serial number `serial`.
    pub fn end_op(&self, id: WorkerId, serial: u64) {
        let slot = self.slot(id);
        slot.serial.store(serial, Ordering::SeqCst);
        slot.busy.store(false, Ordering::SeqCst);
    }

    /// Acknowledge the current phase without running an operation.
    pub fn refresh(&self, id: WorkerId, state: &AtomicSystemState) -> u64 {
        let slot = self.slot(id);
        slot.busy.store(true, Ordering::SeqCst);
        let version = self.observe(slot, state);
        slot.busy.store(false, Ordering::SeqCst);
        version
    }

    /// Move a worker inside an operation to at least `head_version`.
    ///
    /// Called when the operation found its hash chain already carrying a newer
    /// version than its own.
    pub fn shift_version(&self, id: WorkerId, state: &AtomicSystemState, head_version: u64) -> u64 {
        let slot = self.slot(id);
        let version = self.observe(slot, state);
        if head_version > version {
            slot.switch_serial
                .store(slot.serial.load(Ordering::Relaxed), Ordering::SeqCst);
            slot.version.store(head_version, Ordering::SeqCst);
            return head_version;
        }
        version
    }

    /// Version the worker currently tags mutations with
    pub fn version(&self, id: WorkerId) -> u64 {
        self.slot(id).version.load(Ordering::Acquire)
    }

    /// Number of workers that have not acknowledged the packed state `control`.
    ///
    /// A worker acknowledges by being outside an operation or by having observed
    /// `control`. The caller must have stored `control` with `SeqCst` first.
    pub fn pending(&self, control: u64) -> usize {
        self.slots
            .iter()
            .filter(|slot| {
                slot.in_use.load(Ordering::SeqCst)
                    && slot.busy.load(Ordering::SeqCst)
                    && slot.observed.load(Ordering::SeqCst) != control
            })
            .count()
    }

    /// Serial number of the last operation each session completed at a version
    /// `<= version`.
    pub fn session_states(&self, version: u64) -> Vec<SessionState> {
        self.slots
            .iter()
            .filter(|slot| slot.in_use.load(Ordering::SeqCst))
            .map(|slot| {
                let guid = *slot.guid.lock();
                let before = slot.version.load(Ordering::SeqCst);
                let serial = if before <= version {
                    let serial = slot.serial.load(Ordering::SeqCst);
                    if slot.version.load(Ordering::SeqCst) == before {
                        serial
                    } else {
                        slot.switch_serial.load(Ordering::SeqCst)
                    }
                } else {
                    slot.switch_serial.load(Ordering::SeqCst)
                };
                SessionState::new(guid, serial)
            })
            .collect()
    }
}

impl std::fmt::Debug for WorkerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerTable")
            .field("capacity", &self.capacity())
            .field("active", &self.active())
            .finish()
    }
}
