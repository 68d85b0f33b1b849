//! Append-only object log for out-of-line values
//!
//! Values above the configured threshold are appended here and the record keeps
//! an [`ObjectRef`]. The object log is addressed by byte offset; its device is
//! written only by checkpoints.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::device::{read_exact_at, DeviceHandle, SyncStorageDevice};
use crate::log::flush_worker::{FlushChunk, FlushTarget};
use crate::log::record::ObjectRef;

/// In-memory object log with a durable prefix on its device
pub struct ObjectLog {
    data: RwLock<Vec<u8>>,
    flushed_until: Arc<AtomicU64>,
    device: DeviceHandle,
}

impl ObjectLog {
    /// Create an empty object log backed by `device`
    pub fn new(device: DeviceHandle) -> Self {
        Self {
            data: RwLock::new(Vec::new()),
            flushed_until: Arc::new(AtomicU64::new(0)),
            device,
        }
    }

    /// Append `value`, returning where it landed
    pub fn append(&self, value: &[u8]) -> ObjectRef {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(value);
        ObjectRef {
            offset,
            len: value.len() as u64,
        }
    }

    /// Copy of the value at `obj`, or `None` if it lies past the tail
    pub fn read(&self, obj: ObjectRef) -> Option<Vec<u8>> {
        let data = self.data.read();
        let start = usize::try_from(obj.offset).ok()?;
        let end = start.checked_add(usize::try_from(obj.len).ok()?)?;
        data.get(start..end).map(<[u8]>::to_vec)
    }

    /// Current tail offset
    pub fn tail(&self) -> u64 {
        self.data.read().len() as u64
    }

    /// Durable prefix on the main object log device
    pub fn flushed_until(&self) -> u64 {
        self.flushed_until.load(Ordering::Acquire)
    }

    pub(crate) fn flushed_until_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.flushed_until)
    }

    /// Main object log device
    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    /// Writes copying `[from, to)` to `device` at the same offsets
    pub(crate) fn flush_target(&self, device: DeviceHandle, from: u64, to: u64) -> FlushTarget {
        let data = self.data.read();
        let to = (to as usize).min(data.len());
        let from = (from as usize).min(to);
        let chunks = if from < to {
            vec![FlushChunk {
                offset: from as u64,
                bytes: data[from..to].to_vec(),
            }]
        } else {
            Vec::new()
        };
        FlushTarget { device, chunks }
    }

    /// Replace the contents with `[0, tail)` read from `source`.
    ///
    /// `durable` says whether `source` is the main object log device, in which case
    /// the restored prefix is already durable there.
    pub fn restore_from(
        &self,
        source: &dyn SyncStorageDevice,
        tail: u64,
        durable: bool,
    ) -> io::Result<()> {
        let len = usize::try_from(tail).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("object log tail {tail} too large"),
            )
        })?;
        let mut buf = vec![0u8; len];
        read_exact_at(source, 0, &mut buf)?;
        *self.data.write() = buf;
        self.flushed_until
            .store(if durable { tail } else { 0 }, Ordering::Release);
        Ok(())
    }
}

impl std::fmt::Debug for ObjectLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectLog")
            .field("tail", &self.tail())
            .field("flushed_until", &self.flushed_until())
            .finish()
    }
}
