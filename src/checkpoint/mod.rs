//! Checkpoint tokens, commit metadata and the checkpoint manager
//!
//! A checkpoint is identified by a [`CheckpointToken`]. Index and log checkpoints
//! get independent tokens; a cycle that snapshots both produces a [`TokenPair`].
//! Every artifact of a token is reached through a [`CheckpointManager`], and a
//! token only counts as committed once its metadata blob has been written.
//!
//! # Layout of [`LocalCheckpointManager`]
//!
//! ```text
//! <root>/index-checkpoints/<token>/ht.dat        hash index snapshot
//! <root>/index-checkpoints/<token>/info.dat      sealed IndexCommitMetadata
//! <root>/cpr-checkpoints/<token>/snapshot.dat    log snapshot (snapshot kind only)
//! <root>/cpr-checkpoints/<token>/snapshot.obj.dat object log snapshot
//! <root>/cpr-checkpoints/<token>/info.dat        sealed LogCommitMetadata
//! ```

mod local_manager;
mod manager;
mod memory_manager;
mod metadata;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use local_manager::LocalCheckpointManager;
pub use manager::CheckpointManager;
pub use memory_manager::InMemoryCheckpointManager;
pub use metadata::{CheckpointKind, IndexCommitMetadata, LogCommitMetadata, SessionState};

/// Token identifying a checkpoint
pub type CheckpointToken = Uuid;

/// An (index, log) pair produced by the same cycle, or a log token paired with the
/// newest older index.
///
/// `index_token` is `None` when no index checkpoint exists yet; recovery then starts
/// from an empty index and replays the whole log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenPair {
    /// Index checkpoint token
    pub index_token: Option<CheckpointToken>,
    /// Log checkpoint token
    pub log_token: CheckpointToken,
}

impl TokenPair {
    /// Create a new pair
    pub const fn new(index_token: Option<CheckpointToken>, log_token: CheckpointToken) -> Self {
        Self {
            index_token,
            log_token,
        }
    }

    /// Whether `token` is one of the two tokens of this pair
    pub fn contains(&self, token: CheckpointToken) -> bool {
        self.log_token == token || self.index_token == Some(token)
    }
}

impl fmt::Display for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index_token {
            Some(index) => write!(f, "(index {index}, log {})", self.log_token),
            None => write!(f, "(no index, log {})", self.log_token),
        }
    }
}
