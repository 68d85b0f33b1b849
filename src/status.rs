//! Status codes and operation results for data-path operations
//!
//! Data-path calls (`upsert`, `read`, `delete`) report a `Status` rather than an error
//! type; the checkpoint and recovery surfaces use the richer errors in [`crate::error`].

use std::fmt;

/// Status code returned by store operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Status {
    /// Operation completed successfully
    #[default]
    Ok = 0,
    /// Key was not found
    NotFound = 2,
    /// Out of memory (log address space or overflow buckets exhausted)
    OutOfMemory = 3,
    /// I/O error occurred
    IoError = 4,
    /// Data corruption detected
    Corruption = 5,
    /// Operation was aborted
    Aborted = 6,
    /// Invalid argument provided
    InvalidArgument = 7,
    /// Invalid operation in current state
    InvalidOperation = 8,
}

impl Status {
    /// Check if the status indicates success
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Check if the key was not found
    #[inline]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Status::NotFound)
    }

    /// Check if the status indicates an error
    #[inline]
    pub const fn is_error(&self) -> bool {
        !matches!(self, Status::Ok | Status::NotFound)
    }

    /// Get the status as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "Ok",
            Status::NotFound => "NotFound",
            Status::OutOfMemory => "OutOfMemory",
            Status::IoError => "IoError",
            Status::Corruption => "Corruption",
            Status::Aborted => "Aborted",
            Status::InvalidArgument => "InvalidArgument",
            Status::InvalidOperation => "InvalidOperation",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Internal operation status used by the store's retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub(crate) enum OperationStatus {
    /// Operation succeeded
    #[default]
    Success,
    /// Key not found
    NotFound,
    /// Lost a race on the hash bucket entry; retry immediately
    RetryNow,
    /// The hash chain already holds a record from a newer version; the session must
    /// move to the new version before it may mutate this chain
    CprShiftDetected {
        /// Version of the record at the head of the chain
        head_version: u64,
    },
    /// Operation failed with the given status
    Failed(Status),
}

impl OperationStatus {
    /// Convert to external Status
    pub(crate) const fn to_status(self) -> Status {
        match self {
            OperationStatus::Success => Status::Ok,
            OperationStatus::NotFound => Status::NotFound,
            OperationStatus::RetryNow | OperationStatus::CprShiftDetected { .. } => {
                Status::Aborted
            }
            OperationStatus::Failed(status) => status,
        }
    }
}
