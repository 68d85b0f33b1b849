//! Commit metadata for index and log checkpoints
//!
//! Metadata is written last for each token; its presence is what makes the token
//! usable for recovery. Both records are bincode encoded and sealed by
//! [`crate::format`], so a torn or corrupted blob never decodes.

use std::io;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::Address;
use crate::checkpoint::CheckpointToken;
use crate::error::MetadataError;
use crate::format::{self, BlobKind};

/// How a log checkpoint persists the covered log range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckpointKind {
    /// Copy `[begin, final)` into the token's snapshot device.
    #[default]
    Snapshot,
    /// Flush the main log device up to `final` and record only the boundary.
    FoldOver,
}

impl CheckpointKind {
    /// Human readable name
    pub const fn as_str(&self) -> &'static str {
        match self {
            CheckpointKind::Snapshot => "snapshot",
            CheckpointKind::FoldOver => "fold-over",
        }
    }
}

/// Session state persisted with a log checkpoint
///
/// `serial_num` is the serial number of the last operation the session completed
/// under a version covered by the checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Session GUID
    pub guid: Uuid,
    /// Monotonic serial number for this session
    pub serial_num: u64,
}

impl SessionState {
    /// Create a new session state
    pub fn new(guid: Uuid, serial_num: u64) -> Self {
        Self { guid, serial_num }
    }
}

/// Commit metadata of an index checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexCommitMetadata {
    /// Checkpoint token
    pub token: CheckpointToken,
    /// Version of the cycle that took this snapshot
    pub version: u64,
    /// Number of main hash buckets
    pub table_size: u64,
    /// Number of overflow buckets in the snapshot
    pub num_overflow_buckets: u64,
    /// Number of non-empty entries in the snapshot
    pub num_entries: u64,
    /// Begin address of the log when the snapshot was taken
    pub log_begin_address: Address,
    /// Log tail when the index checkpoint began; replay starts here
    pub checkpoint_start_address: Address,
    /// Length of the snapshot artifact in bytes
    pub snapshot_len: u64,
    /// xxh3 checksum of the snapshot artifact
    pub snapshot_checksum: u64,
}

impl IndexCommitMetadata {
    /// Seal into the on-device representation
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let payload =
            bincode::serialize(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(format::seal(BlobKind::Index, &payload))
    }

    /// Validate and decode a sealed blob
    pub fn decode(blob: &[u8]) -> Result<Self, MetadataError> {
        let payload = format::unseal(BlobKind::Index, blob)?;
        Ok(bincode::deserialize(payload)?)
    }
}

/// Commit metadata of a log checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCommitMetadata {
    /// Checkpoint token
    pub token: CheckpointToken,
    /// Captured version: every record tagged `<= version` is included
    pub version: u64,
    /// Version the system moved to when this cycle started
    pub next_version: u64,
    /// Snapshot or fold-over
    pub kind: CheckpointKind,
    /// Index token committed by the same cycle, if it took one
    pub index_token: Option<CheckpointToken>,
    /// Begin address of the log
    pub begin_address: Address,
    /// Everything before this address is covered by the checkpoint
    pub final_address: Address,
    /// Durable prefix of the main log device at commit time
    pub flushed_until_address: Address,
    /// Whether the object log holds any values
    pub use_object_log: bool,
    /// Object log tail covered by the checkpoint
    pub object_log_tail: u64,
    /// Per-session recovery points
    pub session_states: Vec<SessionState>,
}

impl LogCommitMetadata {
    /// Seal into the on-device representation
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let payload =
            bincode::serialize(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(format::seal(BlobKind::Log, &payload))
    }

    /// Validate and decode a sealed blob
    pub fn decode(blob: &[u8]) -> Result<Self, MetadataError> {
        let payload = format::unseal(BlobKind::Log, blob)?;
        Ok(bincode::deserialize(payload)?)
    }

    /// Serial number recorded for `guid`, if the session was active
    pub fn session_serial(&self, guid: Uuid) -> Option<u64> {
        self.session_states
            .iter()
            .find(|s| s.guid == guid)
            .map(|s| s.serial_num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_log() -> LogCommitMetadata {
        LogCommitMetadata {
            token: Uuid::new_v4(),
            version: 3,
            next_version: 4,
            kind: CheckpointKind::FoldOver,
            index_token: Some(Uuid::new_v4()),
            begin_address: Address::FIRST_VALID,
            final_address: Address::from_control(8192),
            flushed_until_address: Address::from_control(8192),
            use_object_log: true,
            object_log_tail: 4096,
            session_states: vec![SessionState::new(Uuid::new_v4(), 42)],
        }
    }

    #[test]
    fn test_log_metadata_encode_decode() {
        let meta = sample_log();
        let blob = meta.encode().unwrap();
        let decoded = LogCommitMetadata::decode(&blob).unwrap();
        assert_eq!(decoded, meta);
        assert_eq!(decoded.session_serial(meta.session_states[0].guid), Some(42));
        assert_eq!(decoded.session_serial(Uuid::new_v4()), None);
    }

    #[test]
    fn test_index_blob_is_not_a_log_blob() {
        let meta = IndexCommitMetadata {
            token: Uuid::new_v4(),
            version: 1,
            table_size: 1024,
            num_overflow_buckets: 0,
            num_entries: 10,
            log_begin_address: Address::FIRST_VALID,
            checkpoint_start_address: Address::from_control(512),
            snapshot_len: 100,
            snapshot_checksum: 7,
        };
        let blob = meta.encode().unwrap();
        assert_eq!(IndexCommitMetadata::decode(&blob).unwrap(), meta);
        assert!(matches!(
            LogCommitMetadata::decode(&blob),
            Err(MetadataError::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_corrupted_blob_fails_decode() {
        let mut blob = sample_log().encode().unwrap();
        let mid = blob.len() / 2;
        blob[mid] ^= 0x10;
        assert!(matches!(
            LogCommitMetadata::decode(&blob),
            Err(MetadataError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_kind_serde_names() {
        assert_eq!(
            serde_json::to_string(&CheckpointKind::FoldOver).unwrap(),
            "\"fold-over\""
        );
        assert_eq!(CheckpointKind::Snapshot.as_str(), "snapshot");
    }
}
