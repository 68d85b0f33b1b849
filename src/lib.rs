//! oxicpr - Concurrent prefix recovery for a log-structured key-value engine
//!
//! The crate provides the checkpoint and recovery coordinator of a FASTER style
//! store, together with a small concurrent key-value engine that exercises it:
//!
//! - **Checkpoints**: non-blocking index and log checkpoints driven through the
//!   CPR phase sequence, with fold-over and snapshot log persistence
//! - **Recovery**: picks the newest consistent (index, log) pair, replays the log
//!   against the index and reports the serial number each session reached
//! - **Garbage collection**: removes checkpoints superseded by the latest pair
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use oxicpr::prelude::*;
//!
//! let manager = Arc::new(LocalCheckpointManager::new("/var/lib/oxicpr")?);
//! let kv = Arc::new(CprKv::new(config, log_device, object_device, manager.clone())?);
//!
//! let mut session = kv.start_session()?;
//! session.upsert(b"key", b"value");
//! kv.checkpoint_full()?;
//!
//! // after a crash
//! let (kv, report) = CprKv::recover(config, log_device, object_device, manager)?;
//! ```

#![warn(missing_docs)]

pub mod address;
pub mod checkpoint;
pub mod config;
pub mod cpr;
pub mod device;
pub mod error;
pub mod format;
pub mod index;
pub mod log;
pub mod status;
pub mod store;
mod utility;

// Re-exports for convenience
pub use address::{Address, AtomicAddress};
pub use checkpoint::{CheckpointKind, CheckpointManager, CheckpointToken, TokenPair};
pub use config::{ConfigError, CprConfig};
pub use cpr::{CheckpointCoordinator, CheckpointRequest, RecoveryReport};
pub use error::{CheckpointError, RecoveryError};
pub use status::Status;
pub use store::{CprKv, Session};

/// Constants used throughout the library
pub mod constants {
    /// Size of a cache line in bytes
    pub const CACHE_LINE_BYTES: usize = 64;

    /// Maximum number of concurrently registered sessions
    pub const MAX_WORKERS: usize = 96;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::address::Address;
    pub use crate::checkpoint::{
        CheckpointKind, CheckpointManager, InMemoryCheckpointManager, LocalCheckpointManager,
        TokenPair,
    };
    pub use crate::config::CprConfig;
    pub use crate::cpr::{CheckpointOutcome, CheckpointRequest, RecoveryReport};
    pub use crate::device::{DeviceHandle, FileSystemFile, MemoryDevice};
    pub use crate::error::{CheckpointError, RecoveryError};
    pub use crate::status::Status;
    pub use crate::store::{CprKv, Session};
}
