//! Hash index
//!
//! Maps a key hash to the address of the newest record of its hash chain in the
//! hybrid log. The index can be snapshotted while it is being mutated; see
//! [`write_snapshot`].

mod hash_bucket;
mod hash_index;
mod snapshot;

use xxhash_rust::xxh3::xxh3_64;

pub use hash_bucket::{AtomicHashBucketEntry, HashBucket, HashBucketEntry, ENTRIES_PER_BUCKET};
pub use hash_index::{EntrySlot, HashIndex, IndexStats, StripeGuard};
pub use snapshot::{read_snapshot, write_snapshot, IndexSnapshotInfo};

/// Key hash type for index operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyHash {
    hash: u64,
}

impl KeyHash {
    /// Number of bits used for the tag
    pub const TAG_BITS: u32 = HashBucketEntry::TAG_BITS;

    /// Create a new key hash
    #[inline]
    pub const fn new(hash: u64) -> Self {
        Self { hash }
    }

    /// Hash a key
    #[inline]
    pub fn of(key: &[u8]) -> Self {
        Self::new(xxh3_64(key))
    }

    /// Get the full hash value
    #[inline]
    pub const fn hash(&self) -> u64 {
        self.hash
    }

    /// Get the hash table index for a given table size
    #[inline]
    pub const fn hash_table_index(&self, size: u64) -> usize {
        (self.hash as usize) & ((size as usize) - 1)
    }

    /// Get the tag portion of the hash (14 bits)
    #[inline]
    pub const fn tag(&self) -> u16 {
        ((self.hash >> 48) & ((1 << Self::TAG_BITS) - 1)) as u16
    }
}

impl From<u64> for KeyHash {
    #[inline]
    fn from(hash: u64) -> Self {
        Self::new(hash)
    }
}
