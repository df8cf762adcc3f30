//! Handle-based allocation inside a region.
//!
//! Nothing stored in a region holds a pointer. References are [`Handle`]s,
//! byte offsets from the region base, and are resolved to borrowed views
//! through the [`Allocator`] on demand. Resolved views are never stored.

mod heap;
pub mod layout;

pub use heap::{BinAllocator, HeapInfo};

use crate::error::AllocError;
use std::fmt;

/// Byte offset of an allocation (or any other structure) inside a region.
///
/// `Handle::INVALID` (offset 0) is the null handle; offset 0 always holds the
/// region header so no allocation can live there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Handle(u64);

impl Handle {
    pub const INVALID: Handle = Handle(0);

    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    pub const fn offset(self) -> u64 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Handle `bytes` further into the region
    pub const fn add(self, bytes: u64) -> Handle {
        Handle(self.0 + bytes)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

pub trait Allocator {
    /// Allocate `size` bytes. Returns `Handle::INVALID` when the region is
    /// exhausted or `size` exceeds the maximum allocation.
    fn malloc(&mut self, size: usize) -> Handle;

    /// Allocate `size` zeroed bytes.
    fn calloc(&mut self, size: usize) -> Handle;

    /// Resize an allocation, moving it if it cannot grow in place.
    ///
    /// On failure returns `Handle::INVALID` and leaves the old block intact.
    fn realloc(&mut self, handle: Handle, size: usize) -> Handle;

    /// Return an allocation to the heap.
    fn free(&mut self, handle: Handle) -> Result<(), AllocError>;

    /// Usable bytes behind `handle` (at least what was requested), or 0 if
    /// the handle is not a live allocation.
    fn chunk_size(&self, handle: Handle) -> usize;

    /// Usable bytes the heap would gain as one contiguous block if `handle`
    /// were freed now, counting free neighbours it would merge with.
    ///
    /// Does not modify the heap. Returns 0 for invalid handles.
    fn ask_for_destroy_size(&self, handle: Handle) -> usize;

    /// Process-local address of `handle`, null for invalid or out-of-range
    /// handles. Never persist the result.
    fn handle_to_ptr(&self, handle: Handle) -> *const u8;

    /// Inverse of `handle_to_ptr`. Pointers outside the region map to
    /// `Handle::INVALID`.
    fn ptr_to_handle(&self, ptr: *const u8) -> Handle;

    /// True if `handle` refers to a live allocation
    fn handle_is_valid(&self, handle: Handle) -> bool;

    /// Borrow `len` raw bytes at `at`, or None if the range leaves the region.
    fn bytes(&self, at: Handle, len: usize) -> Option<&[u8]>;

    /// Mutably borrow `len` raw bytes at `at`.
    fn bytes_mut(&mut self, at: Handle, len: usize) -> Option<&mut [u8]>;

    /// The usable bytes of a live allocation
    fn payload(&self, handle: Handle) -> Option<&[u8]> {
        match self.chunk_size(handle) {
            0 => None,
            len => self.bytes(handle, len),
        }
    }

    fn payload_mut(&mut self, handle: Handle) -> Option<&mut [u8]> {
        match self.chunk_size(handle) {
            0 => None,
            len => self.bytes_mut(handle, len),
        }
    }

    // Fixed-width accessors for structures laid out inside the region. An
    // out-of-range handle here means the structure itself is corrupt.

    fn load_u8(&self, at: Handle) -> Result<u8, AllocError> {
        Ok(self.load::<1>(at)?[0])
    }

    fn load_u16(&self, at: Handle) -> Result<u16, AllocError> {
        Ok(u16::from_ne_bytes(self.load(at)?))
    }

    fn load_u32(&self, at: Handle) -> Result<u32, AllocError> {
        Ok(u32::from_ne_bytes(self.load(at)?))
    }

    fn load_u64(&self, at: Handle) -> Result<u64, AllocError> {
        Ok(u64::from_ne_bytes(self.load(at)?))
    }

    fn load_handle(&self, at: Handle) -> Result<Handle, AllocError> {
        Ok(Handle::new(self.load_u64(at)?))
    }

    fn store_u8(&mut self, at: Handle, value: u8) -> Result<(), AllocError> {
        self.store(at, [value])
    }

    fn store_u16(&mut self, at: Handle, value: u16) -> Result<(), AllocError> {
        self.store(at, value.to_ne_bytes())
    }

    fn store_u32(&mut self, at: Handle, value: u32) -> Result<(), AllocError> {
        self.store(at, value.to_ne_bytes())
    }

    fn store_u64(&mut self, at: Handle, value: u64) -> Result<(), AllocError> {
        self.store(at, value.to_ne_bytes())
    }

    fn store_handle(&mut self, at: Handle, value: Handle) -> Result<(), AllocError> {
        self.store_u64(at, value.offset())
    }

    fn load<const N: usize>(&self, at: Handle) -> Result<[u8; N], AllocError> {
        let bytes = self
            .bytes(at, N)
            .ok_or(AllocError::OutOfRange { at, len: N })?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn store<const N: usize>(&mut self, at: Handle, value: [u8; N]) -> Result<(), AllocError> {
        let bytes = self
            .bytes_mut(at, N)
            .ok_or(AllocError::OutOfRange { at, len: N })?;
        bytes.copy_from_slice(&value);
        Ok(())
    }
}
