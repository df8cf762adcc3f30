//! Backing memory for a pond.
//!
//! A region is one contiguous block of bytes. Everything stored inside it
//! refers to other parts of it by byte offset, so the same bytes can be
//! mapped at a different base address by another process (or copied into a
//! fresh buffer) and still describe the same heap.

mod memory;
mod mmap;

pub use memory::*;
pub use mmap::*;

pub trait Region {
    /// The whole region as a byte slice
    fn as_bytes(&self) -> &[u8];

    /// The whole region as a mutable byte slice
    fn as_bytes_mut(&mut self) -> &mut [u8];

    /// Size of the region in bytes
    fn len(&self) -> usize {
        self.as_bytes().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Process-local base address of the region.
    ///
    /// Only meaningful for the lifetime of this mapping; never persist it.
    fn base_ptr(&self) -> *const u8 {
        self.as_bytes().as_ptr()
    }

    /// Push outstanding writes to the backing store, if there is one.
    ///
    /// Heap regions have nothing to flush.
    fn flush(&self) -> std::io::Result<()> {
        Ok(())
    }
}
