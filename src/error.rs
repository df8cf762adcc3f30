//! Error types for the pond and its allocator

use crate::alloc::Handle;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by pond operations.
///
/// Lookups that miss are not errors; they return `None`.
#[derive(Error, Debug)]
pub enum Error {
    /// Region signature, version or size does not match this build
    #[error("region format mismatch: {0}")]
    Format(String),

    /// The allocator could not satisfy a request. `required` is the payload
    /// size that was asked for, so callers can purge that much and retry.
    #[error("out of memory: {required} bytes required")]
    NoMemory { required: usize },

    /// Bookkeeping inconsistent with its invariants (corrupt shared state)
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Insert of a key that is already cached
    #[error("key already exists")]
    KeyExists,

    /// Update or purge of a key that is not cached
    #[error("key not found")]
    KeyNotFound,

    /// Key does not fit the table's key format
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Configuration rejected or inconsistent with the attached region
    #[error("configuration error: {0}")]
    Config(String),

    /// Write-back through the journal failed
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    /// Low-level allocator misuse
    #[error("allocator error: {0}")]
    Alloc(#[from] AllocError),

    /// I/O error from a file-backed region
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

/// Errors from freeing or verifying chunks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// Handle does not point at a chunk payload inside the region
    #[error("invalid handle {0}")]
    InvalidHandle(Handle),

    /// Handle points at a chunk that is already free
    #[error("double free of handle {0}")]
    DoubleFree(Handle),

    /// Bin or chunk bookkeeping is inconsistent
    #[error("corrupt heap: {0}")]
    Corrupt(String),

    /// A structure inside the region points past its end
    #[error("access of {len} bytes at handle {at} leaves the region")]
    OutOfRange { at: Handle, len: usize },
}

/// Errors reported by a journal collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JournalError {
    /// The journal refused or failed the append
    #[error("write failed: {0}")]
    WriteFailed(String),
}

impl Error {
    /// True for the resource-exhaustion class, which a purge can resolve.
    pub fn is_no_memory(&self) -> bool {
        matches!(self, Error::NoMemory { .. })
    }

    /// True when the shared state is corrupt rather than under pressure.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Error::Integrity(_)
                | Error::Alloc(AllocError::Corrupt(_))
                | Error::Alloc(AllocError::OutOfRange { .. })
        )
    }
}
