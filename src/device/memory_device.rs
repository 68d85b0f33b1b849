//! In-memory storage device
//!
//! Keeps two images of the device: the *volatile* image that reads and writes see,
//! and the *durable* image captured by the last `flush_sync`. `simulate_crash` throws
//! away everything that was never flushed, which is how tests model a process kill.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::device::SyncStorageDevice;

#[derive(Default)]
struct Images {
    volatile: Vec<u8>,
    durable: Vec<u8>,
}

/// In-memory device with explicit durability
#[derive(Default)]
pub struct MemoryDevice {
    images: Mutex<Images>,
    flushes: AtomicU64,
}

impl MemoryDevice {
    /// Create an empty device
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every write that was not followed by a successful flush.
    pub fn simulate_crash(&self) {
        let mut images = self.images.lock();
        images.volatile = images.durable.clone();
    }

    /// Copy of the durable image
    pub fn durable_bytes(&self) -> Vec<u8> {
        self.images.lock().durable.clone()
    }

    /// Copy of the volatile image
    pub fn volatile_bytes(&self) -> Vec<u8> {
        self.images.lock().volatile.clone()
    }

    /// Number of successful `flush_sync` calls
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for MemoryDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let images = self.images.lock();
        f.debug_struct("MemoryDevice")
            .field("volatile_len", &images.volatile.len())
            .field("durable_len", &images.durable.len())
            .finish()
    }
}

impl SyncStorageDevice for MemoryDevice {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let images = self.images.lock();
        let data = &images.volatile;
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let end = std::cmp::min(offset + buf.len(), data.len());
        let len = end - offset;
        buf[..len].copy_from_slice(&data[offset..end]);
        Ok(len)
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let mut images = self.images.lock();
        let data = &mut images.volatile;
        let offset = offset as usize;
        if offset + buf.len() > data.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn flush_sync(&self) -> io::Result<()> {
        let mut images = self.images.lock();
        images.durable = images.volatile.clone();
        self.flushes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn truncate_sync(&self, size: u64) -> io::Result<()> {
        self.images.lock().volatile.resize(size as usize, 0);
        Ok(())
    }

    fn size_sync(&self) -> io::Result<u64> {
        Ok(self.images.lock().volatile.len() as u64)
    }
}
