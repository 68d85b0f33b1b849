//! Sealed framing for commit metadata blobs
//!
//! A commit metadata blob is only trusted if every byte of it checks out:
//!
//! ```text
//! +----------+-----------+------+----------+-------------+----------+-----------+
//! | magic 8B | format u16| kind | reserved | payload u32 | payload  | xxh3 u64  |
//! +----------+-----------+------+----------+-------------+----------+-----------+
//! ```
//!
//! All integers are little endian. The xxh3 trailer covers everything before it,
//! so a torn or bit-flipped blob is rejected instead of decoded.

use xxhash_rust::xxh3::xxh3_64;

use crate::error::MetadataError;

/// Magic numbers for files written by this crate
pub mod magic {
    /// Commit metadata blob
    pub const COMMIT_METADATA: [u8; 8] = *b"OXCPRMD1";
    /// Hash index snapshot artifact
    pub const INDEX_SNAPSHOT: [u8; 8] = *b"OXCPRIX1";
}

/// Current format version of sealed blobs
pub const FORMAT_VERSION: u16 = 1;

const HEADER_LEN: usize = 8 + 2 + 1 + 1 + 4;
const TRAILER_LEN: usize = 8;

/// What a sealed blob describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlobKind {
    /// Index commit metadata
    Index = 1,
    /// Log commit metadata
    Log = 2,
}

/// Frame `payload` with header and checksum.
pub fn seal(kind: BlobKind, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
    out.extend_from_slice(&magic::COMMIT_METADATA);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.push(kind as u8);
    out.push(0);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    let checksum = xxh3_64(&out);
    out.extend_from_slice(&checksum.to_le_bytes());
    out
}

/// Validate a sealed blob and return its payload.
pub fn unseal(kind: BlobKind, blob: &[u8]) -> Result<&[u8], MetadataError> {
    if blob.len() < HEADER_LEN + TRAILER_LEN {
        return Err(MetadataError::TooShort { len: blob.len() });
    }
    if blob[..8] != magic::COMMIT_METADATA {
        return Err(MetadataError::BadMagic);
    }

    let body_len = blob.len() - TRAILER_LEN;
    let stored = u64::from_le_bytes(read_array(&blob[body_len..]));
    let computed = xxh3_64(&blob[..body_len]);
    if stored != computed {
        return Err(MetadataError::ChecksumMismatch { stored, computed });
    }

    let version = u16::from_le_bytes(read_array(&blob[8..10]));
    if version != FORMAT_VERSION {
        return Err(MetadataError::UnsupportedVersion(version));
    }
    if blob[10] != kind as u8 {
        return Err(MetadataError::KindMismatch {
            expected: kind as u8,
            found: blob[10],
        });
    }

    let declared = u32::from_le_bytes(read_array(&blob[12..16])) as usize;
    let actual = body_len - HEADER_LEN;
    if declared != actual {
        return Err(MetadataError::LengthMismatch { declared, actual });
    }

    Ok(&blob[HEADER_LEN..body_len])
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}
