//! Region and chunk layout.
//!
//! This table is the on-region compatibility contract. Changing any offset
//! or size here requires bumping [`FORMAT_VERSION`].
//!
//! Region:
//! ```text
//! [0 .. 128)              region header (see HDR_* offsets)
//! [128 .. 2176)           NBINS regular bins, 16 bytes each (prev, next)
//! [2176 .. 2416)          NFASTBINS fast bins, 16 bytes each (unused, head)
//! [2416 .. 2432)          unsorted bin (prev, next)
//! [2432 .. 6528)          reserve zone handed to the upper layer
//! [6528 .. total_size)    chunks, ending with the top chunk
//! ```
//!
//! Chunk:
//! ```text
//! [0..4]   prev_size   size of the previous chunk, valid only while it is free
//! [4..8]   size        this chunk's size including the header, low bits are flags
//! [8..16]  prev link   free chunks only, handle of the previous chunk in its bin
//! [16..24] next link   free chunks only, handle of the next chunk in its bin
//! ```
//!
//! A handle returned to callers points at offset 8 of its chunk. Whether a
//! chunk is in use is recorded in the PREV_INUSE bit of the chunk after it.
//! All multi-byte values are native-endian.

/// "SHMPOND\x01"
pub const REGION_MAGIC: u64 = 0x0144_4E4F_504D_4853;

/// Format version written by this build
pub const FORMAT_VERSION: u16 = 4;

/// Oldest format version this build can attach to
pub const MIN_FORMAT_VERSION: u16 = 4;

// Region header offsets
pub const HDR_MAGIC: u64 = 0;
pub const HDR_VERSION: u64 = 8;
pub const HDR_HEAD_SIZE: u64 = 10;
pub const HDR_FLAGS: u64 = 12;
pub const HDR_TOTAL_SIZE: u64 = 16;
pub const HDR_USER_SIZE: u64 = 24;
pub const HDR_USER_COUNT: u64 = 32;
pub const HDR_BOTTOM: u64 = 40;
pub const HDR_RESERVE_ZONE: u64 = 48;
pub const HDR_TOP: u64 = 56;
pub const HDR_LAST_FREE: u64 = 64;
pub const HDR_BIN_COUNT: u64 = 72;
pub const HDR_FAST_BIN_COUNT: u64 = 74;
pub const HDR_INTEGRITY: u64 = 76;
pub const HDR_BITMAP: u64 = 80;
pub const HDR_FAST_BYTES: u64 = 96;
pub const HEAD_SIZE: u64 = 128;

/// Header flag: at least one fast bin may hold chunks
pub const FLAG_FAST_CHUNKS: u32 = 0x1;

pub const NBINS: usize = 128;
pub const NSMALLBINS: usize = 64;
pub const SMALLBIN_WIDTH: u64 = 8;
pub const MIN_LARGE_SIZE: u64 = 512;

pub const BINS_OFFSET: u64 = HEAD_SIZE;
pub const BIN_ENTRY_SIZE: u64 = 16;

/// Largest chunk size (header included) served from fast bins
pub const MAX_FAST_SIZE: u64 = 128;
pub const NFASTBINS: usize = fast_bin_index(MAX_FAST_SIZE) + 1;
pub const FASTBINS_OFFSET: u64 = BINS_OFFSET + NBINS as u64 * BIN_ENTRY_SIZE;

pub const UNSORTED_OFFSET: u64 = FASTBINS_OFFSET + NFASTBINS as u64 * BIN_ENTRY_SIZE;

/// Size of the zone reserved for the upper layer's application header
pub const RESERVE_SIZE: u64 = 4 * 1024;
pub const RESERVE_OFFSET: u64 = align_up(UNSORTED_OFFSET + BIN_ENTRY_SIZE);

/// Offset of the first chunk
pub const BOTTOM_OFFSET: u64 = align_up(RESERVE_OFFSET + RESERVE_SIZE);

/// Fast bins are drained once they hold this many bytes, or when a free
/// produces a merged chunk at least this large.
pub const FASTBIN_CONSOLIDATION_THRESHOLD: u64 = 64 * 1024;

// Chunk layout
pub const SIZE_SZ: u64 = 4;
pub const MALLOC_ALIGNMENT: u64 = 2 * SIZE_SZ;
pub const MALLOC_ALIGN_MASK: u64 = MALLOC_ALIGNMENT - 1;
pub const CHUNK_HEADER: u64 = 2 * SIZE_SZ;
pub const CHUNK_PREV_SIZE: u64 = 0;
pub const CHUNK_SIZE: u64 = 4;
pub const CHUNK_PREV_LINK: u64 = 8;
pub const CHUNK_NEXT_LINK: u64 = 16;

/// The smallest chunk that can hold both bin links
pub const MIN_CHUNK_SIZE: u64 = CHUNK_NEXT_LINK + 8;
pub const MINSIZE: u64 = align_up(MIN_CHUNK_SIZE);

/// Low bit of the size field: the previous chunk is in use
pub const PREV_INUSE: u32 = 0x1;
pub const SIZE_BITS: u32 = MALLOC_ALIGN_MASK as u32;

/// Largest chunk size representable in the 32-bit size field
pub const MAX_CHUNK_SIZE: u64 = (u32::MAX as u64) & !MALLOC_ALIGN_MASK;

/// Largest request `malloc` accepts
pub const MAX_ALLOC_SIZE: u64 = MAX_CHUNK_SIZE - CHUNK_HEADER;

/// Smallest region `BinAllocator::init` will format
pub const MIN_REGION_SIZE: u64 = BOTTOM_OFFSET + 4 * MINSIZE;

pub const fn align_up(size: u64) -> u64 {
    (size + MALLOC_ALIGN_MASK) & !MALLOC_ALIGN_MASK
}

/// Convert a user request to a chunk size, or None if it is too large.
pub const fn request_to_size(request: usize) -> Option<u64> {
    let request = request as u64;
    if request > MAX_ALLOC_SIZE {
        return None;
    }
    let size = align_up(request + CHUNK_HEADER);
    if size < MINSIZE { Some(MINSIZE) } else { Some(size) }
}

pub const fn fast_bin_index(size: u64) -> usize {
    ((size >> 3) - 2) as usize
}

pub const fn is_small(size: u64) -> bool {
    size < MIN_LARGE_SIZE
}

pub const fn small_bin_index(size: u64) -> usize {
    (size / SMALLBIN_WIDTH) as usize
}

/// Large bins cover geometrically growing size ranges. The mapping is
/// non-decreasing in `size`, so every chunk in a higher bin is at least as
/// large as any chunk in a lower one.
pub const fn large_bin_index(size: u64) -> usize {
    let idx = if (size >> 6) <= 32 {
        56 + (size >> 6)
    } else if (size >> 9) <= 20 {
        91 + (size >> 9)
    } else if (size >> 12) <= 10 {
        110 + (size >> 12)
    } else if (size >> 15) <= 4 {
        119 + (size >> 15)
    } else if (size >> 18) <= 2 {
        124 + (size >> 18)
    } else {
        126
    };
    idx as usize
}

pub const fn bin_index(size: u64) -> usize {
    if is_small(size) {
        small_bin_index(size)
    } else {
        large_bin_index(size)
    }
}

/// Offset of regular bin `idx`'s (prev, next) pair
pub const fn bin_offset(idx: usize) -> u64 {
    BINS_OFFSET + idx as u64 * BIN_ENTRY_SIZE
}

/// Offset of fast bin `idx`'s head link
pub const fn fast_bin_offset(idx: usize) -> u64 {
    FASTBINS_OFFSET + idx as u64 * BIN_ENTRY_SIZE + 8
}

/// A bin is addressed as a pseudo-chunk whose link fields overlay the bin's
/// (prev, next) pair, so list code never special-cases the head.
pub const fn bin_pseudo_chunk(bin_off: u64) -> u64 {
    bin_off - CHUNK_PREV_LINK
}
