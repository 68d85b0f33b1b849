//! Index snapshot writer and reader
//!
//! ```text
//! +----------+----------------+--------------------+--------------+-----------------+
//! | magic 8B | table_size u64 | overflow_count u64 | main buckets | overflow buckets|
//! +----------+----------------+--------------------+--------------+-----------------+
//! ```
//!
//! Each bucket is [`HashBucket::SERIALIZED_LEN`] bytes. The snapshot is fuzzy: the
//! index keeps changing while it is copied. Main buckets are copied before the
//! overflow count is read, so every overflow link seen in a main bucket refers to a
//! bucket that is part of the snapshot; links beyond the count are cleared anyway.

use std::io;

use xxhash_rust::xxh3::xxh3_64;

use crate::checkpoint::IndexCommitMetadata;
use crate::device::{read_exact_at, write_all_at, SyncStorageDevice};
use crate::format::magic;
use crate::index::{HashBucket, HashIndex};

const HEADER_LEN: usize = 24;
const WRITE_CHUNK: usize = 1 << 20;

/// What the writer produced; recorded in [`IndexCommitMetadata`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSnapshotInfo {
    /// Number of main buckets
    pub table_size: u64,
    /// Overflow buckets in the snapshot
    pub num_overflow_buckets: u64,
    /// Entries in use
    pub num_entries: u64,
    /// Artifact length in bytes
    pub len: u64,
    /// xxh3 checksum of the whole artifact
    pub checksum: u64,
}

fn sanitize_link(bytes: &mut [u8], overflow_count: u64) {
    let at = bytes.len() - HashBucket::SERIALIZED_LEN + HashBucket::NUM_ENTRIES * 8;
    let link = u64::from_le_bytes(read_u64(&bytes[at..at + 8]));
    if link > overflow_count {
        bytes[at..at + 8].copy_from_slice(&0u64.to_le_bytes());
    }
}

fn read_u64(bytes: &[u8]) -> [u8; 8] {
    bytes.try_into().unwrap_or([0; 8])
}

fn count_entries(bytes: &[u8]) -> u64 {
    bytes
        .chunks_exact(HashBucket::SERIALIZED_LEN)
        .flat_map(|bucket| bucket[..HashBucket::NUM_ENTRIES * 8].chunks_exact(8))
        .filter(|word| u64::from_le_bytes(read_u64(word)) != 0)
        .count() as u64
}

/// Copy `index` to `device` and make it durable.
pub fn write_snapshot(
    index: &HashIndex,
    device: &dyn SyncStorageDevice,
) -> io::Result<IndexSnapshotInfo> {
    let main = index.main_buckets();
    let mut buf = Vec::with_capacity(HEADER_LEN + main.len() * HashBucket::SERIALIZED_LEN);
    buf.extend_from_slice(&magic::INDEX_SNAPSHOT);
    buf.extend_from_slice(&index.table_size().to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes());

    for bucket in main {
        bucket.serialize_into(&mut buf);
    }

    let overflow_count = index.overflow_buckets_used();
    buf[16..24].copy_from_slice(&overflow_count.to_le_bytes());
    for bucket in &index.overflow_pool()[..overflow_count as usize] {
        bucket.serialize_into(&mut buf);
    }

    for bucket in buf[HEADER_LEN..].chunks_exact_mut(HashBucket::SERIALIZED_LEN) {
        sanitize_link(bucket, overflow_count);
    }

    let num_entries = count_entries(&buf[HEADER_LEN..]);
    let checksum = xxh3_64(&buf);

    for (i, chunk) in buf.chunks(WRITE_CHUNK).enumerate() {
        write_all_at(device, (i * WRITE_CHUNK) as u64, chunk)?;
    }
    device.flush_sync()?;

    tracing::debug!(
        table_size = index.table_size(),
        overflow_count,
        num_entries,
        len = buf.len(),
        "index snapshot written"
    );

    Ok(IndexSnapshotInfo {
        table_size: index.table_size(),
        num_overflow_buckets: overflow_count,
        num_entries,
        len: buf.len() as u64,
        checksum,
    })
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Load the snapshot described by `meta` into a fresh index.
///
/// The index gets room for at least `overflow_capacity` overflow buckets, more if
/// the snapshot already uses more.
pub fn read_snapshot(
    device: &dyn SyncStorageDevice,
    meta: &IndexCommitMetadata,
    overflow_capacity: u64,
) -> io::Result<HashIndex> {
    let len = usize::try_from(meta.snapshot_len)
        .map_err(|_| invalid(format!("snapshot length {} too large", meta.snapshot_len)))?;
    if len < HEADER_LEN {
        return Err(invalid(format!("snapshot length {len} shorter than header")));
    }
    let mut buf = vec![0u8; len];
    read_exact_at(device, 0, &mut buf)?;

    let computed = xxh3_64(&buf);
    if computed != meta.snapshot_checksum {
        return Err(invalid(format!(
            "index snapshot checksum mismatch: stored {:#x}, computed {computed:#x}",
            meta.snapshot_checksum
        )));
    }
    if buf[..8] != magic::INDEX_SNAPSHOT {
        return Err(invalid("bad index snapshot magic".to_string()));
    }
    let table_size = u64::from_le_bytes(read_u64(&buf[8..16]));
    let overflow_count = u64::from_le_bytes(read_u64(&buf[16..24]));
    if table_size != meta.table_size || overflow_count != meta.num_overflow_buckets {
        return Err(invalid(format!(
            "index snapshot header ({table_size}, {overflow_count}) disagrees with metadata ({}, {})",
            meta.table_size, meta.num_overflow_buckets
        )));
    }
    let expected = HEADER_LEN as u64
        + (table_size + overflow_count) * HashBucket::SERIALIZED_LEN as u64;
    if expected != len as u64 {
        return Err(invalid(format!(
            "index snapshot is {len} bytes, header implies {expected}"
        )));
    }

    let index = HashIndex::new(table_size, overflow_capacity.max(overflow_count))
        .map_err(|status| invalid(format!("cannot build index of size {table_size}: {status}")))?;
    let mut buckets = buf[HEADER_LEN..].chunks_exact(HashBucket::SERIALIZED_LEN);
    for (bucket, bytes) in index.main_buckets().iter().zip(&mut buckets) {
        bucket.load_from(bytes);
    }
    for (bucket, bytes) in index.overflow_pool().iter().zip(buckets) {
        bucket.load_from(bytes);
    }
    index.set_overflow_used(overflow_count as usize);
    Ok(index)
}
