//! Error types for the checkpoint and recovery surfaces
//!
//! Data-path operations report [`crate::Status`]; device and manager calls return
//! `std::io::Result`. The enums here are what the coordinator, the metadata codec
//! and the recovery planner hand back to callers.

use std::io;

use crate::address::Address;
use crate::checkpoint::CheckpointToken;
use crate::cpr::{Action, Phase, RecoveryReport};

/// A checkpoint cycle failed or could not be started.
///
/// Every variant except `PersistenceFailed` leaves the system at REST at the version
/// it had before the cycle began, with the previous valid pair untouched.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Another action is already running.
    #[error("cannot start checkpoint: action {action:?} in phase {phase:?} already in progress")]
    AlreadyInProgress {
        /// Action currently running.
        action: Action,
        /// Phase it is in.
        phase: Phase,
    },
    /// The cycle was aborted on request.
    #[error("checkpoint aborted in phase {phase:?}: {reason}")]
    Aborted {
        /// Phase in which the abort happened.
        phase: Phase,
        /// Caller supplied reason.
        reason: String,
    },
    /// A snapshot or flush write failed; the cycle was aborted.
    #[error("device error in phase {phase:?}: {source}")]
    Device {
        /// Phase in which the write failed.
        phase: Phase,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// Workers did not acknowledge the phase within the configured timeout.
    #[error("barrier timed out in phase {phase:?} with {pending} worker(s) pending")]
    BarrierTimeout {
        /// Phase whose barrier timed out.
        phase: Phase,
        /// Number of workers that had not acknowledged.
        pending: usize,
    },
    /// Writing commit metadata failed after PERSISTENCE_CALLBACK began.
    ///
    /// The cycle is failed, not cancelled: the index metadata may already be durable
    /// and recovery treats it as an orphan.
    #[error("commit metadata write failed: {source}")]
    PersistenceFailed {
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// Abort requested after commit metadata writing began.
    #[error("checkpoint cannot be aborted in phase {phase:?}")]
    NotAbortable {
        /// Phase the cycle is in.
        phase: Phase,
    },
    /// The cycle already completed or was aborted.
    #[error("checkpoint cycle already finished")]
    Finished,
}

impl CheckpointError {
    /// Whether the live system is still at its prior version and fully operational.
    pub fn is_transient(&self) -> bool {
        !matches!(self, CheckpointError::PersistenceFailed { .. })
    }
}

/// A commit metadata blob failed validation.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// The blob is shorter than the fixed header plus checksum.
    #[error("metadata blob too short: {len} bytes")]
    TooShort {
        /// Actual length.
        len: usize,
    },
    /// The magic bytes do not match.
    #[error("bad metadata magic")]
    BadMagic,
    /// Written by an unknown format version.
    #[error("unsupported metadata format version {0}")]
    UnsupportedVersion(u16),
    /// An index blob was found where a log blob was expected, or vice versa.
    #[error("metadata kind mismatch: expected {expected}, found {found}")]
    KindMismatch {
        /// Expected kind tag.
        expected: u8,
        /// Kind tag found in the header.
        found: u8,
    },
    /// The header length disagrees with the blob length.
    #[error("metadata payload length mismatch: header says {declared}, blob holds {actual}")]
    LengthMismatch {
        /// Length recorded in the header.
        declared: usize,
        /// Length actually present.
        actual: usize,
    },
    /// The trailing checksum does not match the contents.
    #[error("metadata checksum mismatch: stored {stored:#018x}, computed {computed:#018x}")]
    ChecksumMismatch {
        /// Checksum stored in the trailer.
        stored: u64,
        /// Checksum computed over the blob.
        computed: u64,
    },
    /// The payload could not be decoded.
    #[error("metadata payload decode failed: {0}")]
    Decode(#[from] bincode::Error),
}

/// Recovery could not produce a consistent state.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// Every candidate was disqualified.
    #[error("no valid checkpoint found\n{report}")]
    NoValidCheckpoint {
        /// Every candidate tried and why it was rejected.
        report: Box<RecoveryReport>,
    },
    /// Two committed index checkpoints claim the same version.
    #[error("index checkpoints {first} and {second} both claim version {version}")]
    AmbiguousIndexVersion {
        /// Shared version.
        version: u64,
        /// First token.
        first: CheckpointToken,
        /// Second token.
        second: CheckpointToken,
    },
    /// Two committed log checkpoints claim the same version.
    #[error("log checkpoints {first} and {second} both claim version {version}")]
    AmbiguousLogVersion {
        /// Shared version.
        version: u64,
        /// First token.
        first: CheckpointToken,
        /// Second token.
        second: CheckpointToken,
    },
    /// Reading commit metadata failed with an I/O error (not a not-found).
    #[error("i/o error reading metadata for {token}: {source}")]
    Io {
        /// Token whose metadata could not be read.
        token: CheckpointToken,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The chosen pair's snapshot artifacts could not be loaded.
    #[error("failed to load snapshot for {token}: {source}")]
    Snapshot {
        /// Token whose artifacts failed to load.
        token: CheckpointToken,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// A committed token newer than the recovered pair could not be removed.
    #[error("failed to purge orphaned checkpoint {token}: {source}")]
    Purge {
        /// Token that could not be purged.
        token: CheckpointToken,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// Enumerating tokens from the manager failed.
    #[error("failed to list checkpoint tokens: {0}")]
    List(#[source] io::Error),
    /// Replay could not re-apply the index entry of a covered record.
    #[error("replay failed to index {failed} record(s), first at {first}: {status}")]
    Replay {
        /// Records whose index entry could not be created.
        failed: u64,
        /// Address of the first such record.
        first: Address,
        /// Index status for the first failure.
        status: crate::status::Status,
    },
    /// The store could not be constructed around the recovered state.
    #[error("failed to set up recovered store: {0}")]
    Setup(#[source] io::Error),
}
