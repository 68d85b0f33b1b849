//! System state machine for checkpoints
//!
//! The whole system moves through one sequence of phases per checkpoint cycle:
//!
//! 1. **PREP_INDEX_CHKPT**: workers reach a quiescent point for the index
//! 2. **INDEX_CHKPT**: the index is snapshotted while mutations continue
//! 3. **PREPARE**: the version is incremented; workers move to it one by one
//! 4. **IN_PROGRESS**: every worker is on the new version; the tail is the target
//! 5. **WAIT_FLUSH**: the covered log range is made durable
//! 6. **PERSISTENCE_CALLBACK**: commit metadata is written, index before log
//! 7. **REST**: no checkpoint in flight
//!
//! A hybrid-log-only checkpoint skips the two index phases. The state is packed
//! into one `u64` so workers can observe it with a single load.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::status::Status;

/// Actions the coordinator can run. Only one action can be active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[repr(u8)]
pub enum Action {
    /// No action in progress
    #[default]
    None = 0,
    /// Index and hybrid log checkpoint
    CheckpointFull = 1,
    /// Hybrid log checkpoint paired with the latest index checkpoint
    CheckpointHybridLog = 2,
}

impl From<u8> for Action {
    fn from(v: u8) -> Self {
        match v {
            1 => Action::CheckpointFull,
            2 => Action::CheckpointHybridLog,
            _ => Action::None,
        }
    }
}

/// Phases of a checkpoint cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[repr(u8)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Workers quiesce index mutations
    PrepIndexChkpt = 0,
    /// Index snapshot in progress
    IndexChkpt = 1,
    /// Version bumped; workers acknowledging
    Prepare = 2,
    /// All workers on the new version
    InProgress = 3,
    /// Waiting for the log flush
    WaitFlush = 4,
    /// Writing commit metadata
    PersistenceCallback = 5,
    /// Rest state - no checkpoint in flight
    #[default]
    Rest = 6,
}

impl Phase {
    /// Upper-case protocol name
    pub const fn as_str(&self) -> &'static str {
        match self {
            Phase::PrepIndexChkpt => "PREP_INDEX_CHKPT",
            Phase::IndexChkpt => "INDEX_CHKPT",
            Phase::Prepare => "PREPARE",
            Phase::InProgress => "IN_PROGRESS",
            Phase::WaitFlush => "WAIT_FLUSH",
            Phase::PersistenceCallback => "PERSISTENCE_CALLBACK",
            Phase::Rest => "REST",
        }
    }
}

impl From<u8> for Phase {
    fn from(v: u8) -> Self {
        match v {
            0 => Phase::PrepIndexChkpt,
            1 => Phase::IndexChkpt,
            2 => Phase::Prepare,
            3 => Phase::InProgress,
            4 => Phase::WaitFlush,
            5 => Phase::PersistenceCallback,
            _ => Phase::Rest,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// System state combining action, phase, and version.
/// Packed into 64 bits for atomic operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemState {
    /// Action being performed
    pub action: Action,
    /// Current phase of the action
    pub phase: Phase,
    /// Current version (48 bits)
    pub version: u64,
}

impl SystemState {
    const VERSION_MASK: u64 = (1 << 48) - 1;

    /// Create a new system state
    pub const fn new(action: Action, phase: Phase, version: u64) -> Self {
        Self {
            action,
            phase,
            version,
        }
    }

    /// Create a rest state
    pub const fn rest(version: u64) -> Self {
        Self::new(Action::None, Phase::Rest, version)
    }

    /// Pack into u64 for atomic operations
    #[inline]
    pub fn to_control(&self) -> u64 {
        (self.action as u64)
            | ((self.phase as u64) << 8)
            | ((self.version & Self::VERSION_MASK) << 16)
    }

    /// Unpack from u64
    #[inline]
    pub fn from_control(control: u64) -> Self {
        Self {
            action: Action::from((control & 0xFF) as u8),
            phase: Phase::from(((control >> 8) & 0xFF) as u8),
            version: (control >> 16) & Self::VERSION_MASK,
        }
    }

    /// Get the next state in the state machine
    pub fn get_next_state(&self) -> Result<SystemState, Status> {
        let next = |phase| SystemState::new(self.action, phase, self.version);
        match (self.action, self.phase) {
            (Action::None, _) => Err(Status::InvalidOperation),
            (Action::CheckpointFull, Phase::Rest) => Ok(next(Phase::PrepIndexChkpt)),
            (Action::CheckpointFull, Phase::PrepIndexChkpt) => Ok(next(Phase::IndexChkpt)),
            (Action::CheckpointFull, Phase::IndexChkpt) | (Action::CheckpointHybridLog, Phase::Rest) => {
                // Version increment happens here
                Ok(SystemState::new(self.action, Phase::Prepare, self.version + 1))
            }
            (_, Phase::Prepare) => Ok(next(Phase::InProgress)),
            (_, Phase::InProgress) => Ok(next(Phase::WaitFlush)),
            (_, Phase::WaitFlush) => Ok(next(Phase::PersistenceCallback)),
            (_, Phase::PersistenceCallback) => Ok(SystemState::rest(self.version)),
            (Action::CheckpointHybridLog, Phase::PrepIndexChkpt | Phase::IndexChkpt) => {
                Err(Status::InvalidOperation)
            }
        }
    }

    /// Check if this state is a rest state
    pub fn is_rest(&self) -> bool {
        self.phase == Phase::Rest
    }

    /// Check if a checkpoint is in progress
    pub fn is_action_in_progress(&self) -> bool {
        self.action != Action::None && self.phase != Phase::Rest
    }

    /// Whether the cycle includes an index checkpoint
    pub fn includes_index(&self) -> bool {
        self.action == Action::CheckpointFull
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::rest(1)
    }
}

/// Atomic version of SystemState for thread-safe access.
#[derive(Debug)]
pub struct AtomicSystemState {
    control: AtomicU64,
}

impl AtomicSystemState {
    /// Create a new atomic system state
    pub fn new(state: SystemState) -> Self {
        Self {
            control: AtomicU64::new(state.to_control()),
        }
    }

    /// Load the current state
    #[inline]
    pub fn load(&self, ordering: Ordering) -> SystemState {
        SystemState::from_control(self.control.load(ordering))
    }

    /// Raw packed state, used by workers to detect any change with one compare
    #[inline]
    pub fn load_control(&self, ordering: Ordering) -> u64 {
        self.control.load(ordering)
    }

    /// Store a new state
    #[inline]
    pub fn store(&self, state: SystemState, ordering: Ordering) {
        self.control.store(state.to_control(), ordering);
    }

    /// Compare and exchange
    #[inline]
    pub fn compare_exchange(
        &self,
        expected: SystemState,
        desired: SystemState,
        success: Ordering,
        failure: Ordering,
    ) -> Result<SystemState, SystemState> {
        self.control
            .compare_exchange(
                expected.to_control(),
                desired.to_control(),
                success,
                failure,
            )
            .map(SystemState::from_control)
            .map_err(SystemState::from_control)
    }

    /// Get the current phase
    #[inline]
    pub fn phase(&self) -> Phase {
        self.load(Ordering::Acquire).phase
    }

    /// Get the current version
    #[inline]
    pub fn version(&self) -> u64 {
        self.load(Ordering::Acquire).version
    }

    /// Try to start a new action from the rest state
    /// Returns Ok(previous_state) on success, Err(current_state) on failure
    pub fn try_start_action(&self, action: Action) -> Result<SystemState, SystemState> {
        let current = self.load(Ordering::Acquire);

        if !current.is_rest() {
            return Err(current);
        }

        let new_state = SystemState::new(action, Phase::Rest, current.version);

        // Get the first state in the action's sequence
        let next_state = match new_state.get_next_state() {
            Ok(s) => s,
            Err(_) => return Err(current),
        };

        self.compare_exchange(current, next_state, Ordering::SeqCst, Ordering::Acquire)
    }

    /// Advance from `expected` to its successor.
    ///
    /// Only the coordinator driving the cycle moves the state, so a mismatch means
    /// someone else changed it behind its back.
    pub fn try_advance(&self, expected: SystemState) -> Result<SystemState, SystemState> {
        let next = expected.get_next_state().map_err(|_| expected)?;
        self.compare_exchange(expected, next, Ordering::SeqCst, Ordering::Acquire)
            .map(|_| next)
    }
}

impl Default for AtomicSystemState {
    fn default() -> Self {
        Self::new(SystemState::default())
    }
}
