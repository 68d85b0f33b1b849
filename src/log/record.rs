//! Record layout of the hybrid log
//!
//! ```text
//! +-----------+-------------+------------+--------------+-----+-------+---------+
//! | info u64  | version u64 | key_len u32| value_len u32| key | value | padding |
//! +-----------+-------------+------------+--------------+-----+-------+---------+
//! ```
//!
//! Records are padded to 8 bytes. A record never spans a page; the space left at
//! the end of a page is zero, and a zero version marks it as filler since live
//! versions start at 1.

use crate::address::Address;
use crate::utility::pad_alignment;

/// Size of the fixed record header
pub const RECORD_HEADER_LEN: usize = 24;

/// Size of an object log reference stored in place of the value
pub const OBJECT_REF_LEN: usize = 16;

/// Record header word: previous address plus flags.
///
/// - Previous address (48 bits): the older record of the same hash chain
/// - Invalid bit (61): the record is skipped by reads and replay
/// - Tombstone bit (62): the record deletes its key
/// - Object bit (63): the value lives in the object log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordInfo(u64);

impl RecordInfo {
    const PREV_ADDR_MASK: u64 = (1 << Address::ADDRESS_BITS) - 1;
    const INVALID_BIT: u64 = 1 << 61;
    const TOMBSTONE_BIT: u64 = 1 << 62;
    const OBJECT_BIT: u64 = 1 << 63;

    /// Create a record info
    pub const fn new(previous_address: Address, tombstone: bool, object: bool) -> Self {
        let mut control = previous_address.control() & Self::PREV_ADDR_MASK;
        if tombstone {
            control |= Self::TOMBSTONE_BIT;
        }
        if object {
            control |= Self::OBJECT_BIT;
        }
        Self(control)
    }

    /// Create a record info from raw control value
    pub const fn from_control(control: u64) -> Self {
        Self(control)
    }

    /// Raw control value
    pub const fn control(&self) -> u64 {
        self.0
    }

    /// Previous address in the hash chain
    #[inline]
    pub const fn previous_address(&self) -> Address {
        Address::from_control(self.0 & Self::PREV_ADDR_MASK)
    }

    /// Whether the record was invalidated
    #[inline]
    pub const fn is_invalid(&self) -> bool {
        self.0 & Self::INVALID_BIT != 0
    }

    /// Whether this is a delete marker
    #[inline]
    pub const fn is_tombstone(&self) -> bool {
        self.0 & Self::TOMBSTONE_BIT != 0
    }

    /// Whether the value is stored in the object log
    #[inline]
    pub const fn is_object(&self) -> bool {
        self.0 & Self::OBJECT_BIT != 0
    }

    /// Same record info with the invalid bit set
    #[inline]
    pub const fn invalidated(&self) -> Self {
        Self(self.0 | Self::INVALID_BIT)
    }
}

/// Decoded fixed header of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Chain link and flags
    pub info: RecordInfo,
    /// Version the writing session was in
    pub version: u64,
    /// Key length in bytes
    pub key_len: u32,
    /// Value length in bytes (the object reference length for object records)
    pub value_len: u32,
}

impl RecordHeader {
    /// Total padded size of the record on a page
    #[inline]
    pub const fn record_size(&self) -> usize {
        record_size(self.key_len as usize, self.value_len as usize)
    }

    /// Write the header into the first [`RECORD_HEADER_LEN`] bytes of `out`
    pub fn write_to(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.info.control().to_le_bytes());
        out[8..16].copy_from_slice(&self.version.to_le_bytes());
        out[16..20].copy_from_slice(&self.key_len.to_le_bytes());
        out[20..24].copy_from_slice(&self.value_len.to_le_bytes());
    }

    /// Read a header from the start of `bytes`.
    ///
    /// Returns `None` for filler (zero version) or if `bytes` is too short.
    pub fn read_from(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < RECORD_HEADER_LEN {
            return None;
        }
        let word = |at: usize| u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap_or([0; 8]));
        let half = |at: usize| u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap_or([0; 4]));
        let header = Self {
            info: RecordInfo::from_control(word(0)),
            version: word(8),
            key_len: half(16),
            value_len: half(20),
        };
        (header.version != 0).then_some(header)
    }
}

/// Padded size of a record with the given key and value lengths
#[inline]
pub const fn record_size(key_len: usize, value_len: usize) -> usize {
    pad_alignment(RECORD_HEADER_LEN + key_len + value_len, 8)
}

/// Location of an out-of-line value in the object log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRef {
    /// Byte offset in the object log
    pub offset: u64,
    /// Value length
    pub len: u64,
}

impl ObjectRef {
    /// Encode into the bytes stored as the record value
    pub fn to_bytes(&self) -> [u8; OBJECT_REF_LEN] {
        let mut out = [0u8; OBJECT_REF_LEN];
        out[..8].copy_from_slice(&self.offset.to_le_bytes());
        out[8..].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    /// Decode from a record value
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != OBJECT_REF_LEN {
            return None;
        }
        Some(Self {
            offset: u64::from_le_bytes(bytes[..8].try_into().ok()?),
            len: u64::from_le_bytes(bytes[8..].try_into().ok()?),
        })
    }
}
