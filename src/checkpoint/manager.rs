//! The checkpoint manager capability consumed by the coordinator

use std::io;

use crate::checkpoint::{CheckpointToken, TokenPair};
use crate::device::DeviceHandle;

/// Storage for checkpoint artifacts and commit metadata, addressed by token.
///
/// Metadata getters return `Ok(None)` when nothing was committed for the token and
/// `Err` only for real I/O failures; recovery treats the two very differently.
///
/// Implementations must make `commit_*` durable before returning. Nothing is shared
/// between tokens.
pub trait CheckpointManager: Send + Sync {
    /// Allocate storage for a fresh index token.
    ///
    /// Fails with `AlreadyExists` if metadata was already committed for `token`.
    fn initialize_index_checkpoint(&self, token: CheckpointToken) -> io::Result<()>;

    /// Allocate storage for a fresh log token.
    ///
    /// Fails with `AlreadyExists` if metadata was already committed for `token`.
    fn initialize_log_checkpoint(&self, token: CheckpointToken) -> io::Result<()>;

    /// Device holding the hash index snapshot of `token`.
    fn index_device(&self, token: CheckpointToken) -> io::Result<DeviceHandle>;

    /// Device holding the log snapshot of `token`.
    fn snapshot_log_device(&self, token: CheckpointToken) -> io::Result<DeviceHandle>;

    /// Device holding the object log snapshot of `token`.
    fn snapshot_object_log_device(&self, token: CheckpointToken) -> io::Result<DeviceHandle>;

    /// Durably persist index commit metadata.
    fn commit_index_checkpoint(&self, token: CheckpointToken, metadata: &[u8]) -> io::Result<()>;

    /// Durably persist log commit metadata.
    fn commit_log_checkpoint(&self, token: CheckpointToken, metadata: &[u8]) -> io::Result<()>;

    /// Bytes previously committed for an index token.
    fn index_commit_metadata(&self, token: CheckpointToken) -> io::Result<Option<Vec<u8>>>;

    /// Bytes previously committed for a log token.
    fn log_commit_metadata(&self, token: CheckpointToken) -> io::Result<Option<Vec<u8>>>;

    /// The manager's own guess at the latest pair.
    ///
    /// This is a hint only; the recovery planner validates consistency itself.
    fn latest_checkpoint(&self) -> io::Result<Option<TokenPair>>;

    /// Every index token with committed metadata.
    fn index_checkpoint_tokens(&self) -> io::Result<Vec<CheckpointToken>>;

    /// Every log token with committed metadata.
    fn log_checkpoint_tokens(&self) -> io::Result<Vec<CheckpointToken>>;

    /// Delete committed index metadata. Missing metadata is not an error.
    fn remove_index_commit_metadata(&self, token: CheckpointToken) -> io::Result<()>;

    /// Delete committed log metadata. Missing metadata is not an error.
    fn remove_log_commit_metadata(&self, token: CheckpointToken) -> io::Result<()>;

    /// Delete every artifact of an index token. Missing artifacts are not an error.
    fn purge_index_artifacts(&self, token: CheckpointToken) -> io::Result<()>;

    /// Delete every artifact of a log token. Missing artifacts are not an error.
    fn purge_log_artifacts(&self, token: CheckpointToken) -> io::Result<()>;
}
