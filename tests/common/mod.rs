//! Shared test utilities for crash consistency and fault injection tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use oxicpr::checkpoint::{CheckpointKind, CheckpointManager, CheckpointToken, TokenPair};
use oxicpr::config::CprConfig;
use oxicpr::device::{write_all_at, DeviceHandle, MemoryDevice, SyncStorageDevice};
use oxicpr::store::CprKv;

/// A fault-injection wrapper around a device handle.
///
/// Allows deterministic injection of:
/// - write errors at a specific operation count
/// - torn writes: a prefix of the Nth write becomes durable, then the write fails
/// - flush errors on demand
pub struct FaultInjectionDevice {
    inner: DeviceHandle,
    /// Total number of write_sync calls observed so far.
    write_count: AtomicU64,
    /// When non-zero, the Nth write (1-based) will return an I/O error.
    fail_write_at: AtomicU64,
    /// When non-zero, the Nth write (1-based) is torn.
    tear_write_at: AtomicU64,
    /// Bytes of the torn write that reach the device.
    tear_keep: AtomicU64,
    /// When true, every flush_sync call returns an error.
    fail_flush: AtomicBool,
}

impl FaultInjectionDevice {
    /// Wrap an existing device for fault injection.
    pub fn new(inner: DeviceHandle) -> Self {
        Self {
            inner,
            write_count: AtomicU64::new(0),
            fail_write_at: AtomicU64::new(0),
            tear_write_at: AtomicU64::new(0),
            tear_keep: AtomicU64::new(0),
            fail_flush: AtomicBool::new(false),
        }
    }

    /// Persist only the first `keep` bytes of the Nth write (1-based), flush them,
    /// and fail the write, as if the process died inside it.
    pub fn tear_write_at(&self, operation_n: u64, keep: usize) {
        self.tear_keep.store(keep as u64, Ordering::SeqCst);
        self.tear_write_at.store(operation_n, Ordering::SeqCst);
    }

    /// Make the Nth write (1-based) return an error.
    pub fn inject_write_error_at(&self, operation_n: u64) {
        self.fail_write_at.store(operation_n, Ordering::SeqCst);
    }

    /// Make every `flush_sync` call fail until cleared.
    pub fn fail_flushes(&self, fail: bool) {
        self.fail_flush.store(fail, Ordering::SeqCst);
    }

    /// Return the total number of write_sync calls observed.
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::SeqCst)
    }
}

impl SyncStorageDevice for FaultInjectionDevice {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read_sync(offset, buf)
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let n = self.write_count.fetch_add(1, Ordering::SeqCst) + 1;
        let target = self.fail_write_at.load(Ordering::SeqCst);
        if target != 0 && n == target {
            return Err(io::Error::other(format!(
                "injected write error at operation {n}"
            )));
        }
        let tear = self.tear_write_at.load(Ordering::SeqCst);
        if tear != 0 && n == tear {
            let keep = (self.tear_keep.load(Ordering::SeqCst) as usize).min(buf.len());
            if keep > 0 {
                write_all_at(self.inner.as_ref(), offset, &buf[..keep])?;
            }
            self.inner.flush_sync()?;
            return Err(io::Error::other(format!(
                "torn write at operation {n}: {keep} of {} bytes persisted",
                buf.len()
            )));
        }
        self.inner.write_sync(offset, buf)
    }

    fn flush_sync(&self) -> io::Result<()> {
        if self.fail_flush.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected flush error"));
        }
        self.inner.flush_sync()
    }

    fn truncate_sync(&self, size: u64) -> io::Result<()> {
        self.inner.truncate_sync(size)
    }

    fn size_sync(&self) -> io::Result<u64> {
        self.inner.size_sync()
    }

    fn alignment(&self) -> usize {
        self.inner.alignment()
    }
}

/// Checkpoint manager calls that [`FaultInjectionManager`] can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagerCall {
    InitializeIndex,
    InitializeLog,
    IndexDevice,
    SnapshotDevice,
    CommitIndex,
    CommitLog,
    ReadIndexMetadata,
    ReadLogMetadata,
    ListTokens,
    RemoveIndexMetadata,
    RemoveLogMetadata,
    Purge,
}

/// Wraps a checkpoint manager and fails chosen calls.
///
/// Artifact devices can also be made to fail their flushes, which surfaces as a
/// failed snapshot flush in the checkpoint cycle.
pub struct FaultInjectionManager {
    inner: Arc<dyn CheckpointManager>,
    failing: Mutex<HashSet<ManagerCall>>,
    fail_artifact_flush: AtomicBool,
    tear_artifact_write: Mutex<Option<(u64, usize)>>,
}

impl FaultInjectionManager {
    pub fn new(inner: Arc<dyn CheckpointManager>) -> Self {
        Self {
            inner,
            failing: Mutex::new(HashSet::new()),
            fail_artifact_flush: AtomicBool::new(false),
            tear_artifact_write: Mutex::new(None),
        }
    }

    /// Fail every future `call` until [`FaultInjectionManager::heal`].
    pub fn fail(&self, call: ManagerCall) {
        self.failing.lock().unwrap().insert(call);
    }

    /// Make artifact devices handed out from now on fail their flushes.
    pub fn fail_artifact_flushes(&self) {
        self.fail_artifact_flush.store(true, Ordering::SeqCst);
    }

    /// Tear the Nth write (1-based) of every artifact device handed out from now
    /// on, keeping `keep` bytes of it.
    pub fn tear_artifact_writes(&self, operation_n: u64, keep: usize) {
        *self.tear_artifact_write.lock().unwrap() = Some((operation_n, keep));
    }

    /// Stop injecting faults.
    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
        self.fail_artifact_flush.store(false, Ordering::SeqCst);
        *self.tear_artifact_write.lock().unwrap() = None;
    }

    fn check(&self, call: ManagerCall) -> io::Result<()> {
        if self.failing.lock().unwrap().contains(&call) {
            return Err(io::Error::other(format!("injected {call:?} failure")));
        }
        Ok(())
    }

    fn wrap(&self, device: DeviceHandle) -> DeviceHandle {
        let fail_flush = self.fail_artifact_flush.load(Ordering::SeqCst);
        let tear = *self.tear_artifact_write.lock().unwrap();
        if !fail_flush && tear.is_none() {
            return device;
        }
        let device = FaultInjectionDevice::new(device);
        device.fail_flushes(fail_flush);
        if let Some((operation_n, keep)) = tear {
            device.tear_write_at(operation_n, keep);
        }
        Arc::new(device)
    }
}

impl CheckpointManager for FaultInjectionManager {
    fn initialize_index_checkpoint(&self, token: CheckpointToken) -> io::Result<()> {
        self.check(ManagerCall::InitializeIndex)?;
        self.inner.initialize_index_checkpoint(token)
    }

    fn initialize_log_checkpoint(&self, token: CheckpointToken) -> io::Result<()> {
        self.check(ManagerCall::InitializeLog)?;
        self.inner.initialize_log_checkpoint(token)
    }

    fn index_device(&self, token: CheckpointToken) -> io::Result<DeviceHandle> {
        self.check(ManagerCall::IndexDevice)?;
        Ok(self.wrap(self.inner.index_device(token)?))
    }

    fn snapshot_log_device(&self, token: CheckpointToken) -> io::Result<DeviceHandle> {
        self.check(ManagerCall::SnapshotDevice)?;
        Ok(self.wrap(self.inner.snapshot_log_device(token)?))
    }

    fn snapshot_object_log_device(&self, token: CheckpointToken) -> io::Result<DeviceHandle> {
        self.check(ManagerCall::SnapshotDevice)?;
        Ok(self.wrap(self.inner.snapshot_object_log_device(token)?))
    }

    fn commit_index_checkpoint(&self, token: CheckpointToken, metadata: &[u8]) -> io::Result<()> {
        self.check(ManagerCall::CommitIndex)?;
        self.inner.commit_index_checkpoint(token, metadata)
    }

    fn commit_log_checkpoint(&self, token: CheckpointToken, metadata: &[u8]) -> io::Result<()> {
        self.check(ManagerCall::CommitLog)?;
        self.inner.commit_log_checkpoint(token, metadata)
    }

    fn index_commit_metadata(&self, token: CheckpointToken) -> io::Result<Option<Vec<u8>>> {
        self.check(ManagerCall::ReadIndexMetadata)?;
        self.inner.index_commit_metadata(token)
    }

    fn log_commit_metadata(&self, token: CheckpointToken) -> io::Result<Option<Vec<u8>>> {
        self.check(ManagerCall::ReadLogMetadata)?;
        self.inner.log_commit_metadata(token)
    }

    fn latest_checkpoint(&self) -> io::Result<Option<TokenPair>> {
        self.inner.latest_checkpoint()
    }

    fn index_checkpoint_tokens(&self) -> io::Result<Vec<CheckpointToken>> {
        self.check(ManagerCall::ListTokens)?;
        self.inner.index_checkpoint_tokens()
    }

    fn log_checkpoint_tokens(&self) -> io::Result<Vec<CheckpointToken>> {
        self.check(ManagerCall::ListTokens)?;
        self.inner.log_checkpoint_tokens()
    }

    fn remove_index_commit_metadata(&self, token: CheckpointToken) -> io::Result<()> {
        self.check(ManagerCall::RemoveIndexMetadata)?;
        self.inner.remove_index_commit_metadata(token)
    }

    fn remove_log_commit_metadata(&self, token: CheckpointToken) -> io::Result<()> {
        self.check(ManagerCall::RemoveLogMetadata)?;
        self.inner.remove_log_commit_metadata(token)
    }

    fn purge_index_artifacts(&self, token: CheckpointToken) -> io::Result<()> {
        self.check(ManagerCall::Purge)?;
        self.inner.purge_index_artifacts(token)
    }

    fn purge_log_artifacts(&self, token: CheckpointToken) -> io::Result<()> {
        self.check(ManagerCall::Purge)?;
        self.inner.purge_log_artifacts(token)
    }
}

// ---------------------------------------------------------------------------
// Store helpers
// ---------------------------------------------------------------------------

/// Small store configuration: 256 buckets, 4 KiB pages.
pub fn small_config(kind: CheckpointKind) -> CprConfig {
    let mut config = CprConfig::default();
    config.store.table_size = 256;
    config.store.page_size_bits = 12;
    config.checkpoint.kind = kind;
    config.checkpoint.barrier_timeout_ms = 5_000;
    config
}

/// Main log and object log devices of a store.
#[derive(Clone)]
pub struct Devices {
    pub log: Arc<MemoryDevice>,
    pub objects: Arc<MemoryDevice>,
}

impl Devices {
    pub fn new() -> Self {
        Self {
            log: Arc::new(MemoryDevice::new()),
            objects: Arc::new(MemoryDevice::new()),
        }
    }

    /// Drop every byte that was never flushed.
    pub fn crash(&self) {
        self.log.simulate_crash();
        self.objects.simulate_crash();
    }
}

/// Open an empty store over `devices`.
pub fn open_store(
    config: &CprConfig,
    devices: &Devices,
    manager: Arc<dyn CheckpointManager>,
) -> Arc<CprKv> {
    Arc::new(
        CprKv::new(
            config.clone(),
            devices.log.clone(),
            devices.objects.clone(),
            manager,
        )
        .unwrap(),
    )
}

/// Recover a store over `devices`.
pub fn recover_store(
    config: &CprConfig,
    devices: &Devices,
    manager: Arc<dyn CheckpointManager>,
) -> (Arc<CprKv>, oxicpr::RecoveryReport) {
    let (kv, report) = CprKv::recover(
        config.clone(),
        devices.log.clone(),
        devices.objects.clone(),
        manager,
    )
    .unwrap();
    (Arc::new(kv), report)
}

pub fn key(i: u64) -> Vec<u8> {
    format!("key-{i:05}").into_bytes()
}

pub fn value(i: u64, round: u64) -> Vec<u8> {
    format!("value-{i}-{round}").into_bytes()
}

// ---------------------------------------------------------------------------
// File corruption utilities
// ---------------------------------------------------------------------------

/// Flip one bit at the given byte offset in a file.
pub fn corrupt_byte_at(path: &Path, offset: u64) -> io::Result<()> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut byte = [0u8];
    file.read_exact(&mut byte)?;
    byte[0] ^= 0x01;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&byte)?;
    file.sync_all()?;
    Ok(())
}

/// Length of a file, 0 if it does not exist.
pub fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Bytes `[start, end)` of a file, written by one step of a checkpoint.
#[derive(Debug, Clone)]
pub struct WrittenRange {
    pub path: PathBuf,
    pub start: u64,
    pub end: u64,
}

impl WrittenRange {
    /// The whole current contents of `path`.
    pub fn whole(path: PathBuf) -> Self {
        let end = file_len(&path);
        Self {
            path,
            start: 0,
            end,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }
}

/// Roll files back to a crash after the first `offset` bytes of `ranges`, which
/// were written in order: the range holding the cut is truncated there, every
/// later range is undone (files that a range created are removed).
pub fn cut_written_ranges(ranges: &[WrittenRange], offset: u64) -> io::Result<()> {
    let mut remaining = offset;
    let mut cut = false;
    for range in ranges {
        if cut {
            if range.start == 0 {
                match std::fs::remove_file(&range.path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            } else {
                truncate_to(&range.path, range.start)?;
            }
        } else if remaining < range.len() {
            truncate_to(&range.path, range.start + remaining)?;
            cut = true;
        } else {
            remaining -= range.len();
        }
    }
    Ok(())
}

/// Truncate a file to `new_len` bytes.
pub fn truncate_to(path: &Path, new_len: u64) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(new_len)?;
    file.sync_all()?;
    Ok(())
}
