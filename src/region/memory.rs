use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::io;
use crate::region::Region;

/// Region backed by a zeroed, page-aligned heap block.
///
/// Private to this process; use [`crate::MmapRegion`] to share a region
/// between processes.
pub struct MemoryRegion {
    /// Pointer to the allocated block
    heap_ptr: *mut u8,

    /// Layout used for allocation (needed for deallocation)
    layout: Layout,
}

// SAFETY: MemoryRegion exclusively owns its block. The pointer is allocated
// once at construction and only freed in Drop, and all access goes through
// &self / &mut self borrows of the byte slice.
unsafe impl Send for MemoryRegion {}

// SAFETY: shared access only hands out `&[u8]`, which is Sync.
unsafe impl Sync for MemoryRegion {}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        // SAFETY: heap_ptr was allocated with this layout in build()
        // and has not been deallocated yet
        unsafe {
            dealloc(self.heap_ptr, self.layout);
        }
    }
}

impl Region for MemoryRegion {
    fn as_bytes(&self) -> &[u8] {
        // SAFETY: heap_ptr points at layout.size() initialized (zeroed) bytes
        // owned by self
        unsafe { std::slice::from_raw_parts(self.heap_ptr, self.layout.size()) }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access
        unsafe { std::slice::from_raw_parts_mut(self.heap_ptr, self.layout.size()) }
    }
}

impl MemoryRegion {
    /// Create a new region holding a copy of `bytes`.
    ///
    /// The copy lives at a different address than the source, which makes
    /// this the cheapest way to simulate a second process attaching to the
    /// same shared segment.
    pub fn copy_from(bytes: &[u8]) -> Result<Self, io::Error> {
        let mut region = MemoryRegionBuilder::new().size(bytes.len()).build()?;
        region.as_bytes_mut().copy_from_slice(bytes);
        Ok(region)
    }
}

pub struct MemoryRegionBuilder {
    size: usize,
}

impl Default for MemoryRegionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegionBuilder {
    pub fn new() -> Self {
        Self {
            size: 64 * 1024 * 1024,
        }
    }

    /// Set the region size in bytes (default: 64MB)
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn build(self) -> Result<MemoryRegion, io::Error> {
        if self.size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "region size must be non-zero",
            ));
        }

        // Use 2MB alignment for potential huge page support on systems that support it
        // Falls back to regular pages if huge pages are not available
        const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024; // 2MB
        const REGULAR_PAGE_SIZE: usize = 4096;

        let alignment = if self.size >= HUGE_PAGE_SIZE && self.size.is_multiple_of(HUGE_PAGE_SIZE) {
            HUGE_PAGE_SIZE
        } else {
            REGULAR_PAGE_SIZE
        };

        let layout = Layout::from_size_align(self.size, alignment)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        // Zeroed so a fresh region never carries a stale signature
        let heap_ptr = unsafe { alloc_zeroed(layout) };
        if heap_ptr.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("failed to allocate {} bytes for region", self.size),
            ));
        }

        Ok(MemoryRegion { heap_ptr, layout })
    }
}
