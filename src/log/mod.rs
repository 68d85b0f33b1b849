//! Hybrid log
//!
//! An append-only record log held in memory pages. Fold-over checkpoints flush
//! it to its main device; snapshot checkpoints copy the covered range to a
//! per-token device. Values above a size threshold live in a parallel
//! [`ObjectLog`].

mod flush_worker;
mod hybrid_log;
mod object_log;
mod record;

pub use flush_worker::{FlushChunk, FlushJob, FlushManager, FlushTarget, PendingFlush};
pub use hybrid_log::{
    FlushDestination, HybridLog, HybridLogConfig, RecordAction, RecordView, MAX_PAGE_SIZE_BITS,
    MIN_PAGE_SIZE_BITS,
};
pub use object_log::ObjectLog;
pub use record::{
    record_size, ObjectRef, RecordHeader, RecordInfo, OBJECT_REF_LEN, RECORD_HEADER_LEN,
};
