//! Concurrent hash index
//!
//! Lookups are lock-free. Mutations of a chain (creating an entry, linking an
//! overflow bucket, swinging the entry to a new record) happen under the stripe
//! lock covering the chain's main bucket, so a writer never loses a race on an
//! entry and no record is ever orphaned by a failed CAS.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::address::Address;
use crate::index::{AtomicHashBucketEntry, HashBucket, HashBucketEntry, KeyHash};
use crate::status::Status;
use crate::utility::is_power_of_two;

const NUM_STRIPES: usize = 256;

/// Proof that the caller holds the stripe lock for a chain
pub struct StripeGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    stripe: usize,
}

/// A located hash bucket entry, valid while the index is borrowed
pub struct EntrySlot<'a> {
    slot: &'a AtomicHashBucketEntry,
    entry: HashBucketEntry,
}

impl EntrySlot<'_> {
    /// Address currently stored in the entry
    #[inline]
    pub fn address(&self) -> Address {
        self.entry.address()
    }

    /// Point the entry at `address`, keeping its tag
    #[inline]
    pub fn store(&mut self, address: Address) {
        self.entry = HashBucketEntry::new(address, self.entry.tag());
        self.slot.store(self.entry, Ordering::Release);
    }
}

/// Distribution statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Number of main buckets
    pub table_size: u64,
    /// Entries in use
    pub used_entries: u64,
    /// Overflow buckets allocated
    pub overflow_buckets: u64,
}

/// Hash index mapping key hashes to the newest record of their chain
pub struct HashIndex {
    table_size: u64,
    buckets: Box<[HashBucket]>,
    overflow: Box<[HashBucket]>,
    overflow_used: AtomicUsize,
    stripes: Box<[Mutex<()>]>,
}

impl HashIndex {
    /// Create an empty index with `table_size` main buckets (a power of two) and a
    /// fixed pool of `overflow_capacity` overflow buckets.
    pub fn new(table_size: u64, overflow_capacity: u64) -> Result<Self, Status> {
        if table_size == 0 || !is_power_of_two(table_size) {
            return Err(Status::InvalidArgument);
        }
        let stripes = NUM_STRIPES.min(table_size as usize);
        Ok(Self {
            table_size,
            buckets: (0..table_size).map(|_| HashBucket::default()).collect(),
            overflow: (0..overflow_capacity)
                .map(|_| HashBucket::default())
                .collect(),
            overflow_used: AtomicUsize::new(0),
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
        })
    }

    /// Number of main buckets
    #[inline]
    pub fn table_size(&self) -> u64 {
        self.table_size
    }

    /// Capacity of the overflow pool
    #[inline]
    pub fn overflow_capacity(&self) -> u64 {
        self.overflow.len() as u64
    }

    /// Overflow buckets handed out so far
    #[inline]
    pub fn overflow_buckets_used(&self) -> u64 {
        self.overflow_used.load(Ordering::Acquire).min(self.overflow.len()) as u64
    }

    #[inline]
    fn bucket_index(&self, hash: KeyHash) -> usize {
        hash.hash_table_index(self.table_size)
    }

    #[inline]
    fn stripe_of(&self, hash: KeyHash) -> usize {
        self.bucket_index(hash) & (self.stripes.len() - 1)
    }

    /// Lock the chain `hash` belongs to
    pub fn lock(&self, hash: KeyHash) -> StripeGuard<'_> {
        let stripe = self.stripe_of(hash);
        StripeGuard {
            _guard: self.stripes[stripe].lock(),
            stripe,
        }
    }

    fn next_bucket(&self, bucket: &HashBucket) -> Option<&HashBucket> {
        bucket
            .overflow_index(Ordering::Acquire)
            .and_then(|idx| self.overflow.get(idx))
    }

    /// Find the entry for `hash` without locking
    pub fn find_entry(&self, hash: KeyHash) -> Option<HashBucketEntry> {
        let tag = hash.tag();
        let mut bucket = Some(&self.buckets[self.bucket_index(hash)]);
        while let Some(b) = bucket {
            for slot in &b.entries {
                let entry = slot.load(Ordering::Acquire);
                if !entry.is_unused() && entry.tag() == tag {
                    return Some(entry);
                }
            }
            bucket = self.next_bucket(b);
        }
        None
    }

    /// Find the entry for `hash`, creating an empty one if needed.
    ///
    /// A freshly created entry points at `Address::INVALID`. Fails with
    /// `OutOfMemory` when the chain is full and the overflow pool is exhausted.
    pub fn find_or_create_entry<'a>(
        &'a self,
        hash: KeyHash,
        guard: &StripeGuard<'_>,
    ) -> Result<EntrySlot<'a>, Status> {
        debug_assert_eq!(guard.stripe, self.stripe_of(hash));
        let tag = hash.tag();
        let mut free: Option<&AtomicHashBucketEntry> = None;
        let mut bucket = &self.buckets[self.bucket_index(hash)];

        loop {
            for slot in &bucket.entries {
                let entry = slot.load(Ordering::Acquire);
                if entry.is_unused() {
                    free.get_or_insert(slot);
                } else if entry.tag() == tag {
                    return Ok(EntrySlot { slot, entry });
                }
            }
            match self.next_bucket(bucket) {
                Some(next) => bucket = next,
                None => break,
            }
        }

        let entry = HashBucketEntry::new(Address::INVALID, tag);
        if let Some(slot) = free {
            slot.store(entry, Ordering::Release);
            return Ok(EntrySlot { slot, entry });
        }

        let idx = self.overflow_used.fetch_add(1, Ordering::AcqRel);
        let Some(new_bucket) = self.overflow.get(idx) else {
            return Err(Status::OutOfMemory);
        };
        let slot = &new_bucket.entries[0];
        slot.store(entry, Ordering::Release);
        bucket.set_overflow_index(idx, Ordering::Release);
        Ok(EntrySlot { slot, entry })
    }

    /// Point the entry for `hash` at `address`, creating it if needed
    pub fn set_entry(&self, hash: KeyHash, address: Address) -> Result<(), Status> {
        let guard = self.lock(hash);
        let mut slot = self.find_or_create_entry(hash, &guard)?;
        slot.store(address);
        Ok(())
    }

    /// Visit every entry slot in use
    pub(crate) fn for_each_slot(&self, mut f: impl FnMut(&AtomicHashBucketEntry)) {
        let used = self.overflow_buckets_used() as usize;
        for bucket in self.buckets.iter().chain(self.overflow[..used].iter()) {
            for slot in &bucket.entries {
                if !slot.load(Ordering::Acquire).is_unused() {
                    f(slot);
                }
            }
        }
    }

    /// Empty every chain whose head is at or beyond `limit`.
    ///
    /// Returns the number of entries cleared.
    pub fn clear_entries_from(&self, limit: Address) -> u64 {
        let mut cleared = 0;
        self.for_each_slot(|slot| {
            let entry = slot.load(Ordering::Acquire);
            if entry.address() >= limit {
                slot.store(
                    HashBucketEntry::new(Address::INVALID, entry.tag()),
                    Ordering::Release,
                );
                cleared += 1;
            }
        });
        cleared
    }

    /// Entry and bucket counts
    pub fn stats(&self) -> IndexStats {
        let mut used_entries = 0;
        self.for_each_slot(|_| used_entries += 1);
        IndexStats {
            table_size: self.table_size,
            used_entries,
            overflow_buckets: self.overflow_buckets_used(),
        }
    }

    pub(crate) fn main_buckets(&self) -> &[HashBucket] {
        &self.buckets
    }

    pub(crate) fn overflow_pool(&self) -> &[HashBucket] {
        &self.overflow
    }

    pub(crate) fn set_overflow_used(&self, used: usize) {
        self.overflow_used.store(used, Ordering::Release);
    }
}

impl std::fmt::Debug for HashIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashIndex")
            .field("table_size", &self.table_size)
            .field("overflow_capacity", &self.overflow.len())
            .field("overflow_used", &self.overflow_buckets_used())
            .finish()
    }
}
