//! Storage device abstraction
//!
//! Byte-addressable storage used for the main log, the object log and every
//! checkpoint artifact. A write is durable only after `flush_sync` returns.

mod file_device;
mod memory_device;
mod traits;

pub use file_device::FileSystemFile;
pub use memory_device::MemoryDevice;
pub use traits::{read_exact_at, write_all_at, DeviceHandle, SyncStorageDevice};
