//! In-memory hybrid log with checkpoint flushing
//!
//! Records are appended at the tail under a short allocation lock and never move.
//! Pages stay in memory; the main device only receives what fold-over checkpoints
//! flush, so `flushed_until` is the durable prefix of the device.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::address::{Address, AtomicAddress};
use crate::device::{read_exact_at, DeviceHandle, SyncStorageDevice};
use crate::log::flush_worker::{FlushChunk, FlushJob, FlushManager, FlushTarget, PendingFlush};
use crate::log::object_log::ObjectLog;
use crate::log::record::{record_size, ObjectRef, RecordHeader, RecordInfo, RECORD_HEADER_LEN};
use crate::status::Status;

/// Smallest supported page size (4 KiB)
pub const MIN_PAGE_SIZE_BITS: u32 = 12;
/// Largest supported page size (1 GiB)
pub const MAX_PAGE_SIZE_BITS: u32 = 30;

type Page = Arc<RwLock<Box<[u8]>>>;

/// Hybrid log settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HybridLogConfig {
    /// log2 of the page size
    pub page_size_bits: u32,
    /// Values longer than this go to the object log; `None` keeps every value inline
    pub object_log_threshold: Option<usize>,
}

impl Default for HybridLogConfig {
    fn default() -> Self {
        Self {
            page_size_bits: 20,
            object_log_threshold: None,
        }
    }
}

/// Where a checkpoint flush sends the covered log range
#[derive(Clone)]
pub enum FlushDestination {
    /// Append `[flushed_until, target)` to the main devices (fold-over).
    MainDevice,
    /// Copy `[begin, target)` and the object log to dedicated devices (snapshot).
    Snapshot {
        /// Log snapshot device
        log: DeviceHandle,
        /// Object log snapshot device
        objects: DeviceHandle,
    },
}

/// Borrowed view of one record
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    /// Decoded header
    pub header: RecordHeader,
    /// Key bytes
    pub key: &'a [u8],
    /// Inline value bytes, or the encoded [`ObjectRef`] for object records
    pub value: &'a [u8],
}

/// What [`HybridLog::for_each_record`] should do with a visited record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordAction {
    /// Leave the record as is
    Keep,
    /// Set the record's invalid bit
    Invalidate,
}

/// The hybrid log
pub struct HybridLog {
    page_size_bits: u32,
    object_log_threshold: Option<usize>,
    pages: RwLock<Vec<Page>>,
    tail: Mutex<Address>,
    tail_address: AtomicAddress,
    begin_address: Address,
    flushed_until: Arc<AtomicAddress>,
    device: DeviceHandle,
    objects: ObjectLog,
    flush: FlushManager,
}

impl HybridLog {
    /// Create an empty log over `device`, with out-of-line values on `object_device`.
    pub fn new(
        config: HybridLogConfig,
        device: DeviceHandle,
        object_device: DeviceHandle,
    ) -> io::Result<Self> {
        if !(MIN_PAGE_SIZE_BITS..=MAX_PAGE_SIZE_BITS).contains(&config.page_size_bits) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "page_size_bits must be in {MIN_PAGE_SIZE_BITS}..={MAX_PAGE_SIZE_BITS}, got {}",
                    config.page_size_bits
                ),
            ));
        }
        let begin = Address::FIRST_VALID;
        Ok(Self {
            page_size_bits: config.page_size_bits,
            object_log_threshold: config.object_log_threshold,
            pages: RwLock::new(Vec::new()),
            tail: Mutex::new(begin),
            tail_address: AtomicAddress::new(begin),
            begin_address: begin,
            flushed_until: Arc::new(AtomicAddress::new(begin)),
            device,
            objects: ObjectLog::new(object_device),
            flush: FlushManager::new()?,
        })
    }

    /// Page size in bytes
    #[inline]
    pub fn page_size(&self) -> usize {
        1 << self.page_size_bits
    }

    /// First address of the log
    #[inline]
    pub fn begin_address(&self) -> Address {
        self.begin_address
    }

    /// Address the next record will be allocated at (or past)
    #[inline]
    pub fn tail_address(&self) -> Address {
        self.tail_address.load(Ordering::Acquire)
    }

    /// Durable prefix of the main device
    #[inline]
    pub fn flushed_until_address(&self) -> Address {
        self.flushed_until.load(Ordering::Acquire)
    }

    /// The object log
    pub fn objects(&self) -> &ObjectLog {
        &self.objects
    }

    /// Whether values can be stored out of line
    pub fn uses_object_log(&self) -> bool {
        self.object_log_threshold.is_some()
    }

    /// Main log device
    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    fn page(&self, page: u64) -> Option<Page> {
        self.pages.read().get(page as usize).cloned()
    }

    fn ensure_page(&self, page: u64) -> Page {
        if let Some(existing) = self.page(page) {
            return existing;
        }
        let mut pages = self.pages.write();
        while pages.len() <= page as usize {
            pages.push(Arc::new(RwLock::new(
                vec![0u8; self.page_size()].into_boxed_slice(),
            )));
        }
        Arc::clone(&pages[page as usize])
    }

    /// Append a record and return its address.
    ///
    /// `value` of `None` writes a tombstone. Fails with `InvalidArgument` if the
    /// record cannot fit in a page and `OutOfMemory` once the address space is used up.
    pub fn append(
        &self,
        previous: Address,
        version: u64,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<Address, Status> {
        debug_assert!(version > 0);
        let object = match (value, self.object_log_threshold) {
            (Some(v), Some(threshold)) if v.len() > threshold => Some(self.objects.append(v)),
            _ => None,
        };
        let object_bytes = object.map(|o| o.to_bytes());
        let stored: &[u8] = match (&object_bytes, value) {
            (Some(bytes), _) => bytes,
            (None, Some(v)) => v,
            (None, None) => &[],
        };

        let size = record_size(key.len(), stored.len());
        if size > self.page_size() - Address::FIRST_VALID.control() as usize {
            return Err(Status::InvalidArgument);
        }
        let header = RecordHeader {
            info: RecordInfo::new(previous, value.is_none(), object.is_some()),
            version,
            key_len: key.len() as u32,
            value_len: stored.len() as u32,
        };

        let mut tail = self.tail.lock();
        let mut address = *tail;
        if address.offset(self.page_size_bits) as usize + size > self.page_size() {
            let next_page = address.page(self.page_size_bits) + 1;
            address = Address::page_start(next_page, self.page_size_bits);
        }
        if address.control() + size as u64 > Address::MAX_ADDRESS {
            return Err(Status::OutOfMemory);
        }

        let page = self.ensure_page(address.page(self.page_size_bits));
        {
            let mut bytes = page.write();
            let at = address.offset(self.page_size_bits) as usize;
            header.write_to(&mut bytes[at..at + RECORD_HEADER_LEN]);
            let key_at = at + RECORD_HEADER_LEN;
            bytes[key_at..key_at + key.len()].copy_from_slice(key);
            let value_at = key_at + key.len();
            bytes[value_at..value_at + stored.len()].copy_from_slice(stored);
        }

        *tail = address + size as u64;
        self.tail_address.store(*tail, Ordering::Release);
        Ok(address)
    }

    /// Run `f` on the record at `address`.
    ///
    /// Returns `None` if no record starts there.
    pub fn with_record<R>(
        &self,
        address: Address,
        f: impl FnOnce(RecordView<'_>) -> R,
    ) -> Option<R> {
        if address < self.begin_address || address >= self.tail_address() {
            return None;
        }
        let page = self.page(address.page(self.page_size_bits))?;
        let bytes = page.read();
        let at = address.offset(self.page_size_bits) as usize;
        let header = RecordHeader::read_from(&bytes[at..])?;
        let key_at = at + RECORD_HEADER_LEN;
        let value_at = key_at + header.key_len as usize;
        let end = value_at + header.value_len as usize;
        if end > bytes.len() {
            return None;
        }
        Some(f(RecordView {
            header,
            key: &bytes[key_at..value_at],
            value: &bytes[value_at..end],
        }))
    }

    /// Resolve the value of an object record
    pub fn object_value(&self, encoded: &[u8]) -> Option<Vec<u8>> {
        ObjectRef::from_bytes(encoded).and_then(|obj| self.objects.read(obj))
    }

    /// Visit every record in `[begin, end)` in log order.
    ///
    /// Takes page write locks; only for use while no sessions are active.
    pub fn for_each_record(
        &self,
        begin: Address,
        end: Address,
        mut f: impl FnMut(Address, &RecordHeader, &[u8]) -> RecordAction,
    ) {
        let bits = self.page_size_bits;
        let mut address = begin.max(self.begin_address);
        while address < end {
            let page_no = address.page(bits);
            let Some(page) = self.page(page_no) else {
                break;
            };
            let mut bytes = page.write();
            let mut at = address.offset(bits) as usize;
            let page_start = Address::page_start(page_no, bits);

            while let Some(header) = RecordHeader::read_from(&bytes[at..]) {
                let record_address = page_start + at as u64;
                if record_address >= end {
                    return;
                }
                let size = header.record_size();
                if at + size > bytes.len() {
                    tracing::warn!(
                        address = %record_address,
                        "record overruns its page; skipping rest of page"
                    );
                    break;
                }
                let key_at = at + RECORD_HEADER_LEN;
                let key = &bytes[key_at..key_at + header.key_len as usize];
                if f(record_address, &header, key) == RecordAction::Invalidate {
                    let info = header.info.invalidated();
                    bytes[at..at + 8].copy_from_slice(&info.control().to_le_bytes());
                }
                at += size;
            }
            address = Address::page_start(page_no + 1, bits);
        }
    }

    fn range_chunks(&self, from: Address, to: Address) -> Vec<FlushChunk> {
        let bits = self.page_size_bits;
        let mut chunks = Vec::new();
        let mut address = from;
        while address < to {
            let page_no = address.page(bits);
            let page_end = Address::page_start(page_no + 1, bits).min(to);
            if let Some(page) = self.page(page_no) {
                let bytes = page.read();
                let start = address.offset(bits) as usize;
                let len = (page_end - address) as usize;
                chunks.push(FlushChunk {
                    offset: address.control(),
                    bytes: bytes[start..start + len].to_vec(),
                });
            }
            address = page_end;
        }
        chunks
    }

    /// Start making the log durable up to `target`, with the object log up to
    /// `object_tail`.
    ///
    /// The bytes are copied before this returns; the device writes happen on the
    /// flush worker.
    pub fn start_flush(
        &self,
        target: Address,
        object_tail: u64,
        destination: FlushDestination,
    ) -> PendingFlush {
        match destination {
            FlushDestination::MainDevice => {
                let from = self.flushed_until_address();
                let log = FlushTarget {
                    device: Arc::clone(&self.device),
                    chunks: self.range_chunks(from, target),
                };
                let objects = self.objects.flush_target(
                    Arc::clone(self.objects.device()),
                    self.objects.flushed_until(),
                    object_tail,
                );
                let flushed_until = Arc::clone(&self.flushed_until);
                let objects_flushed: Arc<AtomicU64> = self.objects.flushed_until_handle();
                let job = FlushJob::new(vec![log, objects]).on_durable(move || {
                    flushed_until.advance_to(target, Ordering::AcqRel);
                    objects_flushed.fetch_max(object_tail, Ordering::AcqRel);
                });
                self.flush.submit(job)
            }
            FlushDestination::Snapshot { log, objects } => {
                let log = FlushTarget {
                    device: log,
                    chunks: self.range_chunks(self.begin_address, target),
                };
                let objects = self.objects.flush_target(objects, 0, object_tail);
                self.flush.submit(FlushJob::new(vec![log, objects]))
            }
        }
    }

    /// Load `[begin, end)` from `source` into a fresh log.
    ///
    /// `durable` says whether `source` is the main device, in which case the range is
    /// already durable there.
    pub fn restore(
        &self,
        source: &dyn SyncStorageDevice,
        end: Address,
        durable: bool,
    ) -> io::Result<()> {
        let bits = self.page_size_bits;
        let mut tail = self.tail.lock();
        let mut address = self.begin_address;
        while address < end {
            let page_no = address.page(bits);
            let page_end = Address::page_start(page_no + 1, bits).min(end);
            let page = self.ensure_page(page_no);
            let mut bytes = page.write();
            let start = address.offset(bits) as usize;
            let len = (page_end - address) as usize;
            read_exact_at(source, address.control(), &mut bytes[start..start + len])?;
            address = page_end;
        }
        let end = end.max(self.begin_address);
        *tail = end;
        self.tail_address.store(end, Ordering::Release);
        self.flushed_until.store(
            if durable { end } else { self.begin_address },
            Ordering::Release,
        );
        Ok(())
    }

    /// Force the next fold-over flush to rewrite the device from `address` on.
    pub(crate) fn mark_dirty_from(&self, address: Address) {
        if address < self.flushed_until_address() {
            self.flushed_until.store(address, Ordering::Release);
        }
    }

    /// Stop the flush worker
    pub fn shutdown(&self) {
        self.flush.stop();
    }
}

impl std::fmt::Debug for HybridLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridLog")
            .field("page_size_bits", &self.page_size_bits)
            .field("begin", &self.begin_address)
            .field("tail", &self.tail_address())
            .field("flushed_until", &self.flushed_until_address())
            .field("objects", &self.objects)
            .finish()
    }
}
