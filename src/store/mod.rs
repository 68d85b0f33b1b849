//! CprKv key-value store
//!
//! A small concurrent key-value engine over the hash index and the hybrid log,
//! wired to the checkpoint coordinator. Each thread works through its own
//! [`Session`].

mod kv;
mod session;

use serde::{Deserialize, Serialize};

use crate::log::HybridLogConfig;

pub use kv::CprKv;
pub use session::Session;

/// Store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CprKvConfig {
    /// Number of main hash buckets (must be a power of two)
    pub table_size: u64,
    /// log2 of the hybrid log page size
    pub page_size_bits: u32,
    /// Values longer than this are stored in the object log
    pub object_log_threshold: Option<usize>,
    /// Capacity of the overflow bucket pool
    pub overflow_buckets: u64,
}

impl CprKvConfig {
    /// Create a configuration with `table_size` buckets and defaults elsewhere
    pub fn new(table_size: u64) -> Self {
        Self {
            table_size,
            ..Self::default()
        }
    }

    pub(crate) fn log_config(&self) -> HybridLogConfig {
        HybridLogConfig {
            page_size_bits: self.page_size_bits,
            object_log_threshold: self.object_log_threshold,
        }
    }
}

impl Default for CprKvConfig {
    fn default() -> Self {
        Self {
            table_size: 1 << 14,
            page_size_bits: 20,
            object_log_threshold: None,
            overflow_buckets: 1 << 12,
        }
    }
}
