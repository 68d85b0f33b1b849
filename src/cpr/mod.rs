//! Concurrent prefix recovery
//!
//! This module holds the checkpoint protocol itself:
//!
//! - [`state_transitions`]: the packed system state and its phase sequence
//! - [`workers`]: per-worker acknowledgement and session serial numbers
//! - [`coordinator`]: drives a cycle through its phases and commits metadata
//! - [`recovery`]: picks the pair to restore and replays the log against it
//! - [`gc`]: deletes checkpoints superseded by the latest pair

pub mod coordinator;
pub mod gc;
pub mod recovery;
pub mod state_transitions;
pub mod workers;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointKind;

pub use coordinator::{
    CheckpointCoordinator, CheckpointCycle, CheckpointOutcome, CheckpointParticipant,
    CheckpointRequest,
};
pub use gc::{collect_garbage, GcReport};
pub use recovery::{
    replay_log, CandidateReport, RecoveryPlan, RecoveryPlanner, RecoveryReport, ReplayStats,
    TokenRole, Verdict,
};
pub use state_transitions::{Action, AtomicSystemState, Phase, SystemState};
pub use workers::{WorkerId, WorkerTable};

/// Checkpoint settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// How log checkpoints persist the covered range
    pub kind: CheckpointKind,
    /// How long a phase barrier waits for worker acknowledgements
    pub barrier_timeout_ms: u64,
    /// Root directory for [`crate::checkpoint::LocalCheckpointManager`]
    pub checkpoint_dir: Option<PathBuf>,
    /// Garbage collect older checkpoints after every successful cycle
    pub keep_latest: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            kind: CheckpointKind::Snapshot,
            barrier_timeout_ms: 10_000,
            checkpoint_dir: None,
            keep_latest: false,
        }
    }
}
