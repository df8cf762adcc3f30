//! Boundary-tag allocator with size-class bins.
//!
//! All allocator state lives in the region itself (header, bins, chunk
//! headers), so a `BinAllocator` is nothing more than a typed view over a
//! region. Attaching to the same bytes from another process, or from a copy
//! at a different address, yields the same heap.
//!
//! # Allocation path
//!
//! ```text
//! request -> fast bin (exact size, LIFO, chunks stay marked in use)
//!         -> small bin (exact size)
//!         -> unsorted bin (exact fit returned, the rest re-binned)
//!         -> small/large bins upward via the bitmap (best fit, split)
//!         -> top chunk
//!         -> drain fast bins and retry once
//! ```
//!
//! Freed chunks merge with free physical neighbours (or the top chunk) and
//! land in the unsorted bin. Fast-bin sized chunks skip merging until the
//! fast bins are drained.

use super::layout::*;
use super::{Allocator, Handle};
use crate::error::{AllocError, Error, Result};
use crate::region::Region;
use tracing::{debug, info, warn};

pub struct BinAllocator<R: Region> {
    region: R,
}

/// Snapshot of the region header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapInfo {
    pub version: u16,
    pub total_size: u64,
    pub user_alloc_size: u64,
    pub user_alloc_count: u64,
    pub bottom: u64,
    pub top: u64,
    pub top_size: u64,
    pub last_free_size: u64,
    pub fast_bytes: u64,
    pub integrity: bool,
}

impl<R: Region> BinAllocator<R> {
    /// Format `region` as an empty heap: header, empty bins, and a single
    /// top chunk spanning the remaining space.
    pub fn init(mut region: R) -> Result<Self> {
        let len = region.len() as u64;
        if len < MIN_REGION_SIZE {
            return Err(Error::Config(format!(
                "region of {} bytes is below the minimum of {} bytes",
                len, MIN_REGION_SIZE
            )));
        }

        region.as_bytes_mut()[..BOTTOM_OFFSET as usize].fill(0);

        let mut heap = Self { region };
        heap.wr64(HDR_MAGIC, REGION_MAGIC);
        heap.wr16(HDR_VERSION, FORMAT_VERSION);
        heap.wr16(HDR_HEAD_SIZE, HEAD_SIZE as u16);
        heap.wr64(HDR_TOTAL_SIZE, len);
        heap.wr64(HDR_BOTTOM, BOTTOM_OFFSET);
        heap.wr64(HDR_RESERVE_ZONE, RESERVE_OFFSET);
        heap.wr64(HDR_TOP, BOTTOM_OFFSET);
        heap.wr16(HDR_BIN_COUNT, NBINS as u16);
        heap.wr16(HDR_FAST_BIN_COUNT, NFASTBINS as u16);
        heap.wr32(HDR_INTEGRITY, 1);

        for idx in 0..NBINS {
            heap.list_init(Self::bin_head(idx));
        }
        heap.list_init(Self::unsorted_head());

        heap.wr32(BOTTOM_OFFSET + CHUNK_PREV_SIZE, 0);
        heap.set_head(BOTTOM_OFFSET, 0, PREV_INUSE);

        info!(size = len, version = FORMAT_VERSION, "formatted region");
        Ok(heap)
    }

    /// Attach to a region formatted earlier, possibly by another process.
    pub fn attach(region: R) -> Result<Self> {
        let version = match Self::detect_version(&region) {
            Some(version) => version,
            None => {
                return Err(Error::Format("region signature not recognized".to_string()));
            }
        };

        if !(MIN_FORMAT_VERSION..=FORMAT_VERSION).contains(&version) {
            return Err(Error::Format(format!(
                "region format version {} not supported (accepted {}..={})",
                version, MIN_FORMAT_VERSION, FORMAT_VERSION
            )));
        }

        let heap = Self { region };
        let len = heap.region.len() as u64;

        if heap.rd16(HDR_HEAD_SIZE) as u64 != HEAD_SIZE
            || heap.rd64(HDR_BOTTOM) != BOTTOM_OFFSET
            || heap.rd64(HDR_RESERVE_ZONE) != RESERVE_OFFSET
        {
            return Err(Error::Format("region header layout mismatch".to_string()));
        }

        if heap.total_size() != len {
            return Err(Error::Format(format!(
                "region header records {} bytes but mapping is {} bytes",
                heap.total_size(),
                len
            )));
        }

        let top = heap.top();
        if top < BOTTOM_OFFSET || top % MALLOC_ALIGNMENT != 0 || top + MINSIZE > len {
            return Err(Error::Integrity(format!("top chunk {:#x} out of range", top)));
        }

        info!(size = len, version, "attached region");
        Ok(heap)
    }

    /// Format version recorded in `region`, or None if it carries no
    /// recognizable signature.
    pub fn detect_version(region: &R) -> Option<u16> {
        let bytes = region.as_bytes();
        if bytes.len() < HEAD_SIZE as usize {
            return None;
        }
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[HDR_MAGIC as usize..HDR_MAGIC as usize + 8]);
        if u64::from_ne_bytes(magic) != REGION_MAGIC {
            return None;
        }
        let v = HDR_VERSION as usize;
        Some(u16::from_ne_bytes([bytes[v], bytes[v + 1]]))
    }

    pub fn region(&self) -> &R {
        &self.region
    }

    pub fn into_region(self) -> R {
        self.region
    }

    pub fn total_size(&self) -> u64 {
        self.rd64(HDR_TOTAL_SIZE)
    }

    /// Bytes (chunk headers included) currently handed out to callers
    pub fn user_alloc_size(&self) -> u64 {
        self.rd64(HDR_USER_SIZE)
    }

    /// Number of live allocations
    pub fn user_alloc_count(&self) -> u64 {
        self.rd64(HDR_USER_COUNT)
    }

    /// Offset of the top chunk (the high-water mark)
    pub fn top(&self) -> u64 {
        self.rd64(HDR_TOP)
    }

    /// Bytes remaining in the top chunk
    pub fn top_size(&self) -> u64 {
        self.total_size() - self.top()
    }

    /// Size of the merged chunk produced by the most recent free
    pub fn last_free_size(&self) -> u64 {
        self.rd64(HDR_LAST_FREE)
    }

    /// Zone of `RESERVE_SIZE` bytes set aside for the upper layer
    pub fn reserve_zone(&self) -> Handle {
        Handle::new(self.rd64(HDR_RESERVE_ZONE))
    }

    /// False while some process has the region open for writing, or after
    /// it died without closing.
    pub fn integrity(&self) -> bool {
        self.rd32(HDR_INTEGRITY) != 0
    }

    pub fn set_integrity(&mut self, clean: bool) {
        self.wr32(HDR_INTEGRITY, clean as u32);
    }

    pub fn info(&self) -> HeapInfo {
        HeapInfo {
            version: self.rd16(HDR_VERSION),
            total_size: self.total_size(),
            user_alloc_size: self.user_alloc_size(),
            user_alloc_count: self.user_alloc_count(),
            bottom: self.rd64(HDR_BOTTOM),
            top: self.top(),
            top_size: self.top_size(),
            last_free_size: self.last_free_size(),
            fast_bytes: self.rd64(HDR_FAST_BYTES),
            integrity: self.integrity(),
        }
    }

    /// Drain every fast bin, merging the chunks with their neighbours.
    pub fn free_fast(&mut self) {
        if !self.have_fast_chunks() {
            return;
        }

        let mut drained = 0u64;
        for idx in 0..NFASTBINS {
            let off = fast_bin_offset(idx);
            let mut c = self.rd64(off);
            self.wr64(off, 0);
            while c != 0 {
                let next = self.fwd(c);
                self.coalesce_and_bin(c);
                drained += 1;
                c = next;
            }
        }

        let flags = self.rd32(HDR_FLAGS) & !FLAG_FAST_CHUNKS;
        self.wr32(HDR_FLAGS, flags);
        self.wr64(HDR_FAST_BYTES, 0);
        debug!(chunks = drained, "drained fast bins");
    }

    /// Verify bin links, size classes, and the physical chunk sequence
    /// against the header counters. Reports problems, never repairs them.
    pub fn check_bins(&self) -> std::result::Result<(), AllocError> {
        let top = self.top();
        let max_steps = (self.total_size() / MINSIZE) as usize + 1;

        for idx in 0..=NBINS {
            let (head, sized) = if idx < NBINS {
                (Self::bin_head(idx), true)
            } else {
                (Self::unsorted_head(), false)
            };

            let mut prev = head;
            let mut c = self.fwd(head);
            let mut steps = 0;
            let mut last_size = 0;
            while c != head {
                steps += 1;
                if steps > max_steps {
                    return Err(AllocError::Corrupt(format!("bin {} does not terminate", idx)));
                }
                if c < BOTTOM_OFFSET || c >= top {
                    return Err(AllocError::Corrupt(format!("bin {} links chunk {:#x} outside the heap", idx, c)));
                }
                if self.bck(c) != prev {
                    return Err(AllocError::Corrupt(format!("bin {} broken back link at {:#x}", idx, c)));
                }
                let size = self.size_of(c);
                if size < MINSIZE || c + size > top {
                    return Err(AllocError::Corrupt(format!("bad chunk size {} at {:#x}", size, c)));
                }
                if self.inuse(c) {
                    return Err(AllocError::Corrupt(format!("in-use chunk {:#x} found in bin {}", c, idx)));
                }
                if sized {
                    if bin_index(size) != idx {
                        return Err(AllocError::Corrupt(format!("chunk of {} bytes in bin {}", size, idx)));
                    }
                    if !is_small(size) && size < last_size {
                        return Err(AllocError::Corrupt(format!("large bin {} not sorted", idx)));
                    }
                }
                last_size = size;
                prev = c;
                c = self.fwd(c);
            }
            if self.bck(head) != prev {
                return Err(AllocError::Corrupt(format!("bin {} tail link mismatch", idx)));
            }
        }

        let mut fast_count = 0u64;
        let mut fast_bytes = 0u64;
        for idx in 0..NFASTBINS {
            let mut c = self.rd64(fast_bin_offset(idx));
            let mut steps = 0;
            while c != 0 {
                steps += 1;
                if steps > max_steps || c < BOTTOM_OFFSET || c >= top {
                    return Err(AllocError::Corrupt(format!("fast bin {} corrupt at {:#x}", idx, c)));
                }
                let size = self.size_of(c);
                if size < MINSIZE || size > MAX_FAST_SIZE || fast_bin_index(size) != idx {
                    return Err(AllocError::Corrupt(format!("chunk of {} bytes in fast bin {}", size, idx)));
                }
                fast_count += 1;
                fast_bytes += size;
                c = self.fwd(c);
            }
        }

        let mut c = BOTTOM_OFFSET;
        let mut in_use = 0u64;
        let mut used_bytes = 0u64;
        let mut prev_free = false;
        while c < top {
            let size = self.size_of(c);
            if size < MINSIZE || c + size > top {
                return Err(AllocError::Corrupt(format!("bad chunk size {} at {:#x}", size, c)));
            }
            let used = self.inuse(c);
            if !used && prev_free {
                return Err(AllocError::Corrupt(format!("unmerged free neighbours at {:#x}", c)));
            }
            if used {
                in_use += 1;
                used_bytes += size;
            }
            prev_free = !used;
            c += size;
        }
        if c != top {
            return Err(AllocError::Corrupt(format!("chunk walk ended at {:#x}, top is {:#x}", c, top)));
        }
        if prev_free {
            return Err(AllocError::Corrupt("free chunk adjacent to top".to_string()));
        }
        if in_use != self.user_alloc_count() + fast_count {
            return Err(AllocError::Corrupt(format!(
                "{} chunks in use, header counts {} plus {} fast",
                in_use,
                self.user_alloc_count(),
                fast_count
            )));
        }
        if used_bytes != self.user_alloc_size() + fast_bytes {
            return Err(AllocError::Corrupt(format!(
                "{} bytes in use, header counts {} plus {} fast",
                used_bytes,
                self.user_alloc_size(),
                fast_bytes
            )));
        }

        Ok(())
    }

    // --- raw region access ---------------------------------------------

    fn mem(&self) -> &[u8] {
        self.region.as_bytes()
    }

    fn rd16(&self, off: u64) -> u16 {
        let o = off as usize;
        let b = &self.mem()[o..o + 2];
        u16::from_ne_bytes([b[0], b[1]])
    }

    fn wr16(&mut self, off: u64, v: u16) {
        let o = off as usize;
        self.region.as_bytes_mut()[o..o + 2].copy_from_slice(&v.to_ne_bytes());
    }

    fn rd32(&self, off: u64) -> u32 {
        let o = off as usize;
        let b = &self.mem()[o..o + 4];
        u32::from_ne_bytes([b[0], b[1], b[2], b[3]])
    }

    fn wr32(&mut self, off: u64, v: u32) {
        let o = off as usize;
        self.region.as_bytes_mut()[o..o + 4].copy_from_slice(&v.to_ne_bytes());
    }

    fn rd64(&self, off: u64) -> u64 {
        let o = off as usize;
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.mem()[o..o + 8]);
        u64::from_ne_bytes(b)
    }

    fn wr64(&mut self, off: u64, v: u64) {
        let o = off as usize;
        self.region.as_bytes_mut()[o..o + 8].copy_from_slice(&v.to_ne_bytes());
    }

    // --- header ----------------------------------------------------------

    fn set_top(&mut self, top: u64) {
        self.wr64(HDR_TOP, top);
    }

    fn have_fast_chunks(&self) -> bool {
        self.rd32(HDR_FLAGS) & FLAG_FAST_CHUNKS != 0
    }

    fn add_user(&mut self, size: u64) {
        self.wr64(HDR_USER_SIZE, self.user_alloc_size() + size);
        self.wr64(HDR_USER_COUNT, self.user_alloc_count() + 1);
    }

    fn sub_user(&mut self, size: u64) {
        self.wr64(HDR_USER_SIZE, self.user_alloc_size() - size);
        self.wr64(HDR_USER_COUNT, self.user_alloc_count() - 1);
    }

    fn grow_user_size(&mut self, delta: u64) {
        self.wr64(HDR_USER_SIZE, self.user_alloc_size() + delta);
    }

    fn shrink_user_size(&mut self, delta: u64) {
        self.wr64(HDR_USER_SIZE, self.user_alloc_size() - delta);
    }

    fn mark_bin(&mut self, idx: usize) {
        let off = HDR_BITMAP + (idx / 32) as u64 * 4;
        let word = self.rd32(off) | (1 << (idx % 32));
        self.wr32(off, word);
    }

    fn unmark_bin(&mut self, idx: usize) {
        let off = HDR_BITMAP + (idx / 32) as u64 * 4;
        let word = self.rd32(off) & !(1 << (idx % 32));
        self.wr32(off, word);
    }

    fn bin_marked(&self, idx: usize) -> bool {
        self.rd32(HDR_BITMAP + (idx / 32) as u64 * 4) & (1 << (idx % 32)) != 0
    }

    // --- chunks ----------------------------------------------------------

    fn size_field(&self, c: u64) -> u32 {
        self.rd32(c + CHUNK_SIZE)
    }

    fn size_of(&self, c: u64) -> u64 {
        (self.size_field(c) & !SIZE_BITS) as u64
    }

    fn prev_size(&self, c: u64) -> u64 {
        self.rd32(c + CHUNK_PREV_SIZE) as u64
    }

    fn prev_inuse(&self, c: u64) -> bool {
        self.size_field(c) & PREV_INUSE != 0
    }

    fn inuse(&self, c: u64) -> bool {
        self.prev_inuse(c + self.size_of(c))
    }

    fn set_head(&mut self, c: u64, size: u64, flags: u32) {
        self.wr32(c + CHUNK_SIZE, size as u32 | flags);
    }

    /// Record `size` as the previous-chunk size of the chunk after `c`
    fn set_foot(&mut self, c: u64, size: u64) {
        self.wr32(c + size + CHUNK_PREV_SIZE, size as u32);
    }

    fn set_inuse(&mut self, c: u64) {
        let next = c + self.size_of(c);
        let field = self.size_field(next) | PREV_INUSE;
        self.wr32(next + CHUNK_SIZE, field);
    }

    fn clear_prev_inuse(&mut self, c: u64) {
        let field = self.size_field(c) & !PREV_INUSE;
        self.wr32(c + CHUNK_SIZE, field);
    }

    /// Validate that `handle` is the payload of an in-use chunk and return
    /// the chunk offset.
    fn checked_chunk(&self, handle: Handle) -> std::result::Result<u64, AllocError> {
        let off = handle.offset();
        if off < BOTTOM_OFFSET + CHUNK_HEADER || off % MALLOC_ALIGNMENT != 0 {
            return Err(AllocError::InvalidHandle(handle));
        }
        let c = off - CHUNK_HEADER;
        let top = self.top();
        if c >= top {
            return Err(AllocError::InvalidHandle(handle));
        }
        let size = self.size_of(c);
        if size < MINSIZE || c + size > top {
            return Err(AllocError::InvalidHandle(handle));
        }
        if !self.prev_inuse(c + size) {
            return Err(AllocError::DoubleFree(handle));
        }
        Ok(c)
    }

    // --- bins ------------------------------------------------------------

    fn bin_head(idx: usize) -> u64 {
        bin_pseudo_chunk(bin_offset(idx))
    }

    fn unsorted_head() -> u64 {
        bin_pseudo_chunk(UNSORTED_OFFSET)
    }

    fn fwd(&self, c: u64) -> u64 {
        self.rd64(c + CHUNK_NEXT_LINK)
    }

    fn bck(&self, c: u64) -> u64 {
        self.rd64(c + CHUNK_PREV_LINK)
    }

    fn set_fwd(&mut self, c: u64, v: u64) {
        self.wr64(c + CHUNK_NEXT_LINK, v);
    }

    fn set_bck(&mut self, c: u64, v: u64) {
        self.wr64(c + CHUNK_PREV_LINK, v);
    }

    fn list_init(&mut self, head: u64) {
        self.set_fwd(head, head);
        self.set_bck(head, head);
    }

    fn list_is_empty(&self, head: u64) -> bool {
        self.fwd(head) == head
    }

    fn link_before(&mut self, pos: u64, c: u64) {
        let prev = self.bck(pos);
        self.set_fwd(c, pos);
        self.set_bck(c, prev);
        self.set_fwd(prev, c);
        self.set_bck(pos, c);
    }

    fn link_front(&mut self, head: u64, c: u64) {
        let first = self.fwd(head);
        self.link_before(first, c);
    }

    fn unlink(&mut self, c: u64) {
        let prev = self.bck(c);
        let next = self.fwd(c);
        self.set_fwd(prev, next);
        self.set_bck(next, prev);
    }

    /// File a free chunk under its size class. Large bins stay sorted by
    /// ascending size so the first fit is the best fit.
    fn link_bin(&mut self, c: u64, size: u64) {
        let idx = bin_index(size);
        let head = Self::bin_head(idx);
        if is_small(size) {
            self.link_front(head, c);
        } else {
            let mut pos = self.fwd(head);
            while pos != head && self.size_of(pos) < size {
                pos = self.fwd(pos);
            }
            self.link_before(pos, c);
        }
        self.mark_bin(idx);
    }

    fn fast_pop(&mut self, size: u64) -> Option<u64> {
        let off = fast_bin_offset(fast_bin_index(size));
        let c = self.rd64(off);
        if c == 0 {
            return None;
        }
        let next = self.fwd(c);
        self.wr64(off, next);
        let bytes = self.rd64(HDR_FAST_BYTES);
        self.wr64(HDR_FAST_BYTES, bytes - size);
        Some(c)
    }

    /// True if chunk `c` already sits in the fast bin for `size`
    fn fast_bin_contains(&self, c: u64, size: u64) -> std::result::Result<bool, AllocError> {
        let idx = fast_bin_index(size);
        let max_steps = self.total_size() / MINSIZE + 1;
        let mut cur = self.rd64(fast_bin_offset(idx));
        let mut steps = 0;
        while cur != 0 {
            if cur == c {
                return Ok(true);
            }
            steps += 1;
            if steps > max_steps || cur < BOTTOM_OFFSET || cur >= self.top() {
                return Err(AllocError::Corrupt(format!("fast bin {} corrupt at {:#x}", idx, cur)));
            }
            cur = self.fwd(cur);
        }
        Ok(false)
    }

    fn fast_push(&mut self, c: u64, size: u64) {
        let off = fast_bin_offset(fast_bin_index(size));
        let head = self.rd64(off);
        self.set_fwd(c, head);
        self.wr64(off, c);
        let bytes = self.rd64(HDR_FAST_BYTES);
        self.wr64(HDR_FAST_BYTES, bytes + size);
        let flags = self.rd32(HDR_FLAGS) | FLAG_FAST_CHUNKS;
        self.wr32(HDR_FLAGS, flags);
    }

    // --- allocation ------------------------------------------------------

    fn inter_malloc(&mut self, nb: u64) -> Option<u64> {
        if nb <= MAX_FAST_SIZE
            && let Some(c) = self.fast_pop(nb)
        {
            return Some(c);
        }

        if is_small(nb) {
            let head = Self::bin_head(small_bin_index(nb));
            if !self.list_is_empty(head) {
                let c = self.bck(head);
                self.unlink(c);
                self.set_inuse(c);
                return Some(c);
            }
        } else if self.have_fast_chunks() {
            // large requests are worth defragmenting for
            self.free_fast();
        }

        if let Some(c) = self.search(nb) {
            return Some(c);
        }

        if self.have_fast_chunks() {
            self.free_fast();
            return self.search(nb);
        }

        None
    }

    fn search(&mut self, nb: u64) -> Option<u64> {
        if let Some(c) = self.sort_unsorted(nb) {
            return Some(c);
        }
        if let Some(c) = self.best_fit(nb) {
            return Some(c);
        }
        self.top_alloc(nb)
    }

    /// Empty the unsorted bin into the sized bins, returning the first exact
    /// fit encountered.
    fn sort_unsorted(&mut self, nb: u64) -> Option<u64> {
        let head = Self::unsorted_head();
        loop {
            let c = self.bck(head);
            if c == head {
                return None;
            }
            self.unlink(c);
            let size = self.size_of(c);
            if size == nb {
                self.set_inuse(c);
                return Some(c);
            }
            self.link_bin(c, size);
        }
    }

    fn best_fit(&mut self, nb: u64) -> Option<u64> {
        for idx in bin_index(nb)..NBINS {
            if !self.bin_marked(idx) {
                continue;
            }
            let head = Self::bin_head(idx);
            if self.list_is_empty(head) {
                self.unmark_bin(idx);
                continue;
            }
            let mut c = self.fwd(head);
            while c != head {
                let size = self.size_of(c);
                if size >= nb {
                    self.unlink(c);
                    return Some(self.split(c, size, nb));
                }
                c = self.fwd(c);
            }
        }
        None
    }

    /// Carve `nb` bytes off the front of free chunk `c`. A remainder large
    /// enough to stand alone goes to the unsorted bin.
    fn split(&mut self, c: u64, size: u64, nb: u64) -> u64 {
        let rest = size - nb;
        if rest >= MINSIZE {
            let flags = self.size_field(c) & PREV_INUSE;
            self.set_head(c, nb, flags);
            let r = c + nb;
            self.set_head(r, rest, PREV_INUSE);
            self.set_foot(r, rest);
            self.link_front(Self::unsorted_head(), r);
        }
        self.set_inuse(c);
        c
    }

    fn top_alloc(&mut self, nb: u64) -> Option<u64> {
        let top = self.top();
        if self.top_size() < nb + MINSIZE {
            return None;
        }
        let flags = self.size_field(top) & PREV_INUSE;
        self.set_head(top, nb, flags);
        let new_top = top + nb;
        self.set_head(new_top, 0, PREV_INUSE);
        self.set_top(new_top);
        Some(top)
    }

    /// Merge a chunk being released with its free neighbours and file the
    /// result. Returns the size of the merged chunk (top included when the
    /// chunk merges into it).
    fn coalesce_and_bin(&mut self, c: u64) -> u64 {
        let mut c = c;
        let mut size = self.size_of(c);
        let next = c + size;

        if !self.prev_inuse(c) {
            let prev_size = self.prev_size(c);
            c -= prev_size;
            self.unlink(c);
            size += prev_size;
        }

        if next == self.top() {
            size += self.top_size();
            self.set_head(c, 0, PREV_INUSE);
            self.set_top(c);
            return size;
        }

        if !self.inuse(next) {
            let next_size = self.size_of(next);
            self.unlink(next);
            size += next_size;
        } else {
            self.clear_prev_inuse(next);
        }

        self.set_head(c, size, PREV_INUSE);
        self.set_foot(c, size);
        self.link_front(Self::unsorted_head(), c);
        size
    }

    /// Cut an in-use chunk of `size` bytes down to `nb`, releasing the tail.
    fn shrink(&mut self, c: u64, size: u64, nb: u64) {
        let rest = size - nb;
        if rest < MINSIZE {
            return;
        }
        let flags = self.size_field(c) & PREV_INUSE;
        self.set_head(c, nb, flags);
        let r = c + nb;
        // r is in use until released: its successor still has PREV_INUSE set
        self.set_head(r, rest, PREV_INUSE);
        self.shrink_user_size(rest);
        let merged = self.coalesce_and_bin(r);
        self.wr64(HDR_LAST_FREE, merged);
    }
}

impl<R: Region> Allocator for BinAllocator<R> {
    fn malloc(&mut self, size: usize) -> Handle {
        let Some(nb) = request_to_size(size) else {
            return Handle::INVALID;
        };
        match self.inter_malloc(nb) {
            Some(c) => {
                let size = self.size_of(c);
                self.add_user(size);
                Handle::new(c + CHUNK_HEADER)
            }
            None => Handle::INVALID,
        }
    }

    fn calloc(&mut self, size: usize) -> Handle {
        let handle = self.malloc(size);
        if let Some(bytes) = self.payload_mut(handle) {
            bytes.fill(0);
        }
        handle
    }

    fn realloc(&mut self, handle: Handle, size: usize) -> Handle {
        if !handle.is_valid() {
            return self.malloc(size);
        }
        if size == 0 {
            if let Err(e) = self.free(handle) {
                warn!(%handle, error = %e, "realloc to zero failed to free chunk");
            }
            return Handle::INVALID;
        }
        let Ok(c) = self.checked_chunk(handle) else {
            return Handle::INVALID;
        };
        let Some(nb) = request_to_size(size) else {
            return Handle::INVALID;
        };

        let old = self.size_of(c);
        if old >= nb {
            self.shrink(c, old, nb);
            return handle;
        }

        let next = c + old;
        let flags = self.size_field(c) & PREV_INUSE;
        if next == self.top() {
            if self.top_size() >= nb - old + MINSIZE {
                self.set_head(c, nb, flags);
                let new_top = c + nb;
                self.set_head(new_top, 0, PREV_INUSE);
                self.set_top(new_top);
                self.grow_user_size(nb - old);
                return handle;
            }
        } else if !self.inuse(next) {
            let total = old + self.size_of(next);
            if total >= nb {
                self.unlink(next);
                self.set_head(c, total, flags);
                self.set_inuse(c);
                self.grow_user_size(total - old);
                self.shrink(c, total, nb);
                return handle;
            }
        }

        let moved = self.malloc(size);
        if !moved.is_valid() {
            return Handle::INVALID;
        }
        let len = (old - CHUNK_HEADER) as usize;
        let src = handle.offset() as usize;
        let dst = moved.offset() as usize;
        self.region.as_bytes_mut().copy_within(src..src + len, dst);
        if let Err(e) = self.free(handle) {
            warn!(%handle, error = %e, "realloc failed to free the old chunk");
        }
        moved
    }

    fn free(&mut self, handle: Handle) -> std::result::Result<(), AllocError> {
        let c = self.checked_chunk(handle)?;
        let size = self.size_of(c);

        if size <= MAX_FAST_SIZE {
            if self.fast_bin_contains(c, size)? {
                return Err(AllocError::DoubleFree(handle));
            }
            self.sub_user(size);
            self.fast_push(c, size);
            self.wr64(HDR_LAST_FREE, size);
            if self.rd64(HDR_FAST_BYTES) >= FASTBIN_CONSOLIDATION_THRESHOLD {
                self.free_fast();
            }
            return Ok(());
        }

        self.sub_user(size);
        let merged = self.coalesce_and_bin(c);
        self.wr64(HDR_LAST_FREE, merged);
        if merged >= FASTBIN_CONSOLIDATION_THRESHOLD {
            self.free_fast();
        }
        Ok(())
    }

    fn chunk_size(&self, handle: Handle) -> usize {
        match self.checked_chunk(handle) {
            Ok(c) => (self.size_of(c) - CHUNK_HEADER) as usize,
            Err(_) => 0,
        }
    }

    fn ask_for_destroy_size(&self, handle: Handle) -> usize {
        let Ok(c) = self.checked_chunk(handle) else {
            return 0;
        };
        let mut size = self.size_of(c);
        if !self.prev_inuse(c) {
            size += self.prev_size(c);
        }
        let next = c + self.size_of(c);
        if next == self.top() {
            size += self.top_size();
        } else if !self.inuse(next) {
            size += self.size_of(next);
        }
        (size - CHUNK_HEADER) as usize
    }

    fn handle_to_ptr(&self, handle: Handle) -> *const u8 {
        if !handle.is_valid() || handle.offset() >= self.region.len() as u64 {
            return std::ptr::null();
        }
        self.region.base_ptr().wrapping_add(handle.offset() as usize)
    }

    fn ptr_to_handle(&self, ptr: *const u8) -> Handle {
        let base = self.region.base_ptr() as usize;
        let p = ptr as usize;
        if p < base || p >= base + self.region.len() {
            return Handle::INVALID;
        }
        Handle::new((p - base) as u64)
    }

    fn handle_is_valid(&self, handle: Handle) -> bool {
        self.checked_chunk(handle).is_ok()
    }

    fn bytes(&self, at: Handle, len: usize) -> Option<&[u8]> {
        let start = at.offset() as usize;
        self.mem().get(start..start.checked_add(len)?)
    }

    fn bytes_mut(&mut self, at: Handle, len: usize) -> Option<&mut [u8]> {
        let start = at.offset() as usize;
        let end = start.checked_add(len)?;
        self.region.as_bytes_mut().get_mut(start..end)
    }
}
