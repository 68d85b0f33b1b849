//! Storage device traits

use std::io;
use std::sync::Arc;

/// Synchronous storage device
///
/// Implementations include file system storage and an in-memory device used by
/// tests. All methods take `&self`; implementations synchronize internally.
pub trait SyncStorageDevice: Send + Sync + 'static {
    /// Read up to `buf.len()` bytes from `offset`; returns the number of bytes read.
    ///
    /// A short read means the device ends before `offset + buf.len()`.
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Write `buf` at `offset`; returns the number of bytes written.
    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize>;

    /// Make every completed write durable
    fn flush_sync(&self) -> io::Result<()>;

    /// Truncate the device to the specified size
    fn truncate_sync(&self, size: u64) -> io::Result<()>;

    /// Get the current size
    fn size_sync(&self) -> io::Result<u64>;

    /// Get alignment requirement
    fn alignment(&self) -> usize {
        512
    }
}

/// Shared handle to a device, as handed out by a checkpoint manager
pub type DeviceHandle = Arc<dyn SyncStorageDevice>;

/// Write all of `buf` at `offset`, looping over short writes.
pub fn write_all_at(device: &dyn SyncStorageDevice, offset: u64, buf: &[u8]) -> io::Result<()> {
    let mut written = 0usize;
    while written < buf.len() {
        let n = device.write_sync(offset + written as u64, &buf[written..])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("device accepted 0 bytes at offset {}", offset + written as u64),
            ));
        }
        written += n;
    }
    Ok(())
}

/// Fill `buf` from `offset`, failing with `UnexpectedEof` if the device is too short.
pub fn read_exact_at(device: &dyn SyncStorageDevice, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    let mut read = 0usize;
    while read < buf.len() {
        let n = device.read_sync(offset + read as u64, &mut buf[read..])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "device ended at offset {} while reading {} bytes from {}",
                    offset + read as u64,
                    buf.len(),
                    offset
                ),
            ));
        }
        read += n;
    }
    Ok(())
}
