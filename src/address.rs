//! Address types for the hybrid log
//!
//! An `Address` is a logical byte offset into the hybrid log. Only the low 48 bits
//! are significant; the upper 16 bits of a hash bucket entry are reserved for the
//! index tag, so every address must fit in `ADDRESS_BITS`.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::{Deserialize, Serialize};

/// A logical address into the hybrid log.
#[repr(transparent)]
#[derive(Clone, Copy, Default, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(u64);

impl Address {
    /// An invalid address, used when you need to initialize an address but don't have a valid
    /// value for it yet.
    ///
    /// Note: set to 1, not 0, to distinguish an unused hash bucket entry (all zeros)
    /// from a used entry whose chain ends at an invalid address.
    pub const INVALID: Self = Self(1);

    /// First address handed out by a fresh log. Everything below is reserved.
    pub const FIRST_VALID: Self = Self(64);

    /// Total number of address bits used
    pub const ADDRESS_BITS: u32 = 48;

    /// Maximum valid address value
    pub const MAX_ADDRESS: u64 = (1 << Self::ADDRESS_BITS) - 1;

    /// Create an address from a raw control value
    #[inline]
    pub const fn from_control(control: u64) -> Self {
        Self(control)
    }

    /// Get the raw control value
    #[inline]
    pub const fn control(&self) -> u64 {
        self.0
    }

    /// Page number for a log with `1 << page_size_bits` byte pages
    #[inline]
    pub const fn page(&self, page_size_bits: u32) -> u64 {
        self.0 >> page_size_bits
    }

    /// Offset within the page for a log with `1 << page_size_bits` byte pages
    #[inline]
    pub const fn offset(&self, page_size_bits: u32) -> u64 {
        self.0 & ((1 << page_size_bits) - 1)
    }

    /// Address of the first byte of `page`
    #[inline]
    pub const fn page_start(page: u64, page_size_bits: u32) -> Self {
        Self(page << page_size_bits)
    }

    /// Check if this is an invalid address
    #[inline]
    pub const fn is_invalid(&self) -> bool {
        self.0 < Self::FIRST_VALID.0
    }

    /// Check if this is a valid address (not invalid)
    #[inline]
    pub const fn is_valid(&self) -> bool {
        !self.is_invalid()
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            write!(f, "Address(INVALID:{})", self.0)
        } else {
            write!(f, "Address({})", self.0)
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl PartialEq for Address {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Address {}

impl PartialOrd for Address {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Add<u64> for Address {
    type Output = Self;

    #[inline]
    fn add(self, delta: u64) -> Self::Output {
        debug_assert!(self.0 + delta <= Self::MAX_ADDRESS);
        Self(self.0 + delta)
    }
}

impl AddAssign<u64> for Address {
    #[inline]
    fn add_assign(&mut self, delta: u64) {
        debug_assert!(self.0 + delta <= Self::MAX_ADDRESS);
        self.0 += delta;
    }
}

impl Sub for Address {
    type Output = u64;

    #[inline]
    fn sub(self, other: Self) -> Self::Output {
        self.0 - other.0
    }
}

impl From<u64> for Address {
    #[inline]
    fn from(control: u64) -> Self {
        Self(control)
    }
}

impl From<Address> for u64 {
    #[inline]
    fn from(addr: Address) -> Self {
        addr.0
    }
}

/// Atomic version of Address for thread-safe operations
#[repr(transparent)]
pub struct AtomicAddress {
    control: AtomicU64,
}

impl AtomicAddress {
    /// Create a new atomic address
    #[inline]
    pub const fn new(address: Address) -> Self {
        Self {
            control: AtomicU64::new(address.0),
        }
    }

    /// Load the address atomically
    #[inline]
    pub fn load(&self, ordering: AtomicOrdering) -> Address {
        Address(self.control.load(ordering))
    }

    /// Store an address atomically
    #[inline]
    pub fn store(&self, address: Address, ordering: AtomicOrdering) {
        self.control.store(address.0, ordering);
    }

    /// Compare and exchange the address atomically
    #[inline]
    pub fn compare_exchange(
        &self,
        current: Address,
        new: Address,
        success: AtomicOrdering,
        failure: AtomicOrdering,
    ) -> Result<Address, Address> {
        self.control
            .compare_exchange(current.0, new.0, success, failure)
            .map(Address)
            .map_err(Address)
    }

    /// Raise the stored address to `address` if it is currently lower.
    ///
    /// Returns the previous value.
    #[inline]
    pub fn advance_to(&self, address: Address, ordering: AtomicOrdering) -> Address {
        Address(self.control.fetch_max(address.0, ordering))
    }
}

impl Default for AtomicAddress {
    fn default() -> Self {
        Self::new(Address::default())
    }
}

impl fmt::Debug for AtomicAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addr = self.load(AtomicOrdering::Relaxed);
        f.debug_struct("AtomicAddress")
            .field("address", &addr)
            .finish()
    }
}
