//! Hash bucket structures for the hash index
//!
//! A bucket is one cache line: seven tagged entries plus a link to an overflow
//! bucket. Entries are never removed once created; deleting a key appends a
//! tombstone record and leaves the entry pointing at it.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::address::Address;
use crate::constants::CACHE_LINE_BYTES;

/// Entry stored in a hash bucket
///
/// Packed into 8 bytes:
/// - address (48 bits): logical address of the newest record in the chain
/// - tag (14 bits): high hash bits, to tell chains in the same bucket apart
/// - reserved (2 bits)
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct HashBucketEntry(u64);

impl HashBucketEntry {
    /// Empty entry
    pub const INVALID: Self = Self(0);

    /// Number of bits for the tag
    pub const TAG_BITS: u32 = 14;

    const ADDRESS_MASK: u64 = (1 << Address::ADDRESS_BITS) - 1;
    const TAG_SHIFT: u32 = Address::ADDRESS_BITS;
    const TAG_MASK: u64 = (1 << Self::TAG_BITS) - 1;

    /// Create a new entry
    #[inline]
    pub const fn new(address: Address, tag: u16) -> Self {
        Self(
            (address.control() & Self::ADDRESS_MASK)
                | (((tag as u64) & Self::TAG_MASK) << Self::TAG_SHIFT),
        )
    }

    /// Create an entry from raw control value
    #[inline]
    pub const fn from_control(control: u64) -> Self {
        Self(control)
    }

    /// Get the raw control value
    #[inline]
    pub const fn control(&self) -> u64 {
        self.0
    }

    /// Check if this entry is unused
    #[inline]
    pub const fn is_unused(&self) -> bool {
        self.0 == 0
    }

    /// Get the address portion
    #[inline]
    pub const fn address(&self) -> Address {
        Address::from_control(self.0 & Self::ADDRESS_MASK)
    }

    /// Get the tag portion
    #[inline]
    pub const fn tag(&self) -> u16 {
        ((self.0 >> Self::TAG_SHIFT) & Self::TAG_MASK) as u16
    }
}

impl std::fmt::Debug for HashBucketEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashBucketEntry")
            .field("address", &self.address())
            .field("tag", &self.tag())
            .finish()
    }
}

/// Atomic version of HashBucketEntry
#[repr(transparent)]
#[derive(Default)]
pub struct AtomicHashBucketEntry {
    control: AtomicU64,
}

impl AtomicHashBucketEntry {
    /// Load the entry atomically
    #[inline]
    pub fn load(&self, ordering: Ordering) -> HashBucketEntry {
        HashBucketEntry(self.control.load(ordering))
    }

    /// Store an entry atomically
    #[inline]
    pub fn store(&self, entry: HashBucketEntry, ordering: Ordering) {
        self.control.store(entry.0, ordering);
    }
}

impl std::fmt::Debug for AtomicHashBucketEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicHashBucketEntry")
            .field("entry", &self.load(Ordering::Relaxed))
            .finish()
    }
}

/// Number of entries per bucket
pub const ENTRIES_PER_BUCKET: usize = 7;

/// A hash bucket
///
/// `overflow` holds `1 + index` of the next bucket in the overflow pool, or 0.
#[repr(C, align(64))]
#[derive(Default)]
pub struct HashBucket {
    /// Tagged entries
    pub entries: [AtomicHashBucketEntry; ENTRIES_PER_BUCKET],
    /// Link to the next overflow bucket
    pub overflow: AtomicU64,
}

impl HashBucket {
    /// Number of entries per bucket
    pub const NUM_ENTRIES: usize = ENTRIES_PER_BUCKET;

    /// Serialized size in bytes
    pub const SERIALIZED_LEN: usize = (Self::NUM_ENTRIES + 1) * 8;

    /// Overflow bucket index, if linked
    #[inline]
    pub fn overflow_index(&self, ordering: Ordering) -> Option<usize> {
        match self.overflow.load(ordering) {
            0 => None,
            link => Some((link - 1) as usize),
        }
    }

    /// Link the overflow bucket at `index`
    #[inline]
    pub fn set_overflow_index(&self, index: usize, ordering: Ordering) {
        self.overflow.store(index as u64 + 1, ordering);
    }

    /// Append the serialized form of this bucket to `out`
    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        for entry in &self.entries {
            out.extend_from_slice(&entry.load(Ordering::Acquire).control().to_le_bytes());
        }
        out.extend_from_slice(&self.overflow.load(Ordering::Acquire).to_le_bytes());
    }

    /// Load from the serialized form produced by `serialize_into`
    pub fn load_from(&self, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), Self::SERIALIZED_LEN);
        let mut words = bytes
            .chunks_exact(8)
            .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap_or([0; 8])));
        for entry in &self.entries {
            let control = words.next().unwrap_or(0);
            entry.store(HashBucketEntry::from_control(control), Ordering::Relaxed);
        }
        self.overflow.store(words.next().unwrap_or(0), Ordering::Relaxed);
    }
}

const _: () = assert!(std::mem::size_of::<HashBucket>() == CACHE_LINE_BYTES);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_packing() {
        let addr = Address::from_control(0x1234_5678);
        let entry = HashBucketEntry::new(addr, 0x2ABC);
        assert_eq!(entry.address(), addr);
        assert_eq!(entry.tag(), 0x2ABC);
        assert!(!entry.is_unused());
        assert!(HashBucketEntry::INVALID.is_unused());
    }

    #[test]
    fn test_tag_is_masked() {
        let entry = HashBucketEntry::new(Address::FIRST_VALID, u16::MAX);
        assert_eq!(entry.tag(), (1 << HashBucketEntry::TAG_BITS) - 1);
        assert_eq!(entry.address(), Address::FIRST_VALID);
    }

    #[test]
    fn test_bucket_serialization() {
        let bucket = HashBucket::default();
        bucket.entries[3].store(
            HashBucketEntry::new(Address::from_control(4096), 7),
            Ordering::Relaxed,
        );
        bucket.set_overflow_index(5, Ordering::Relaxed);

        let mut bytes = Vec::new();
        bucket.serialize_into(&mut bytes);
        assert_eq!(bytes.len(), HashBucket::SERIALIZED_LEN);

        let restored = HashBucket::default();
        restored.load_from(&bytes);
        let entry = restored.entries[3].load(Ordering::Relaxed);
        assert_eq!(entry.address().control(), 4096);
        assert_eq!(entry.tag(), 7);
        assert_eq!(restored.overflow_index(Ordering::Relaxed), Some(5));
        assert!(restored.entries[0].load(Ordering::Relaxed).is_unused());
    }
}
