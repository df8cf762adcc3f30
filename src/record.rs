//! Record payload codec.
//!
//! A record is one allocation holding a fixed header, the key, and either
//! the value bytes (flat records) or the handle of a separately allocated
//! tree blob (tree-root records). The pond only ever inspects the header
//! and key; the value and tree blob are opaque.
//!
//! Layout:
//! ```text
//! [0]       kind (1 = flat, 2 = tree root)
//! [1]       key length
//! [2..4]    reserved
//! [4..8]    row count
//! [8..12]   last modification, unix seconds
//! [12..16]  last access, unix seconds
//! [16..24]  flat: value length | tree root: tree blob handle
//! [24..]    key, then value bytes for flat records
//! ```
//!
//! A tree blob starts with its byte length as a u64, followed by the blob.
//! The allocator rounds chunk sizes up, so the length is kept explicitly.

use crate::alloc::{Allocator, Handle};
use crate::error::{AllocError, Error, Result};
use clocksource::coarse::UnixInstant;
use tracing::warn;

const REC_KIND: u64 = 0;
const REC_KEY_LEN: u64 = 1;
const REC_ROWS: u64 = 4;
const REC_MTIME: u64 = 8;
const REC_ATIME: u64 = 12;
const REC_BODY: u64 = 16;

pub const RECORD_HEADER_SIZE: usize = 24;

/// Length prefix in front of a tree blob
const TREE_HEADER_SIZE: usize = 8;

/// Maximum key length (8 bits)
pub const MAX_KEY_LEN: usize = 0xFF;

const KIND_FLAT: u8 = 1;
const KIND_TREE: u8 = 2;

/// Current time in unix seconds
pub fn now_secs() -> u32 {
    UnixInstant::now().duration_since(UnixInstant::EPOCH).as_secs()
}

/// Payload handed to [`Record::encode`]
#[derive(Debug, Clone, Copy)]
pub enum RecordBody<'a> {
    /// Value stored inline after the key
    Flat(&'a [u8]),
    /// Tree blob stored in its own allocation
    Tree(&'a [u8]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlatRecord {
    handle: Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeRootRecord {
    handle: Handle,
}

/// A stored record, viewed through its handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    Flat(FlatRecord),
    TreeRoot(TreeRootRecord),
}

fn copy_in<A: Allocator>(heap: &mut A, at: Handle, data: &[u8]) -> Result<()> {
    heap.bytes_mut(at, data.len())
        .ok_or(AllocError::OutOfRange { at, len: data.len() })?
        .copy_from_slice(data);
    Ok(())
}

fn release<A: Allocator>(heap: &mut A, handle: Handle, what: &str) {
    if let Err(e) = heap.free(handle) {
        warn!(%handle, error = %e, "failed to release {}", what);
    }
}

impl Record {
    /// Bytes needed to store a flat record
    pub fn flat_size(key_len: usize, value_len: usize) -> usize {
        RECORD_HEADER_SIZE + key_len + value_len
    }

    /// Allocate and write a new record. On exhaustion nothing stays
    /// allocated and the error carries the size that was asked for.
    pub fn encode<A: Allocator>(
        heap: &mut A,
        key: &[u8],
        body: RecordBody<'_>,
        rows: u32,
        now: u32,
    ) -> Result<Record> {
        if key.len() > MAX_KEY_LEN {
            return Err(Error::InvalidKey(format!(
                "key of {} bytes exceeds {}",
                key.len(),
                MAX_KEY_LEN
            )));
        }

        let size = match body {
            RecordBody::Flat(value) => Self::flat_size(key.len(), value.len()),
            RecordBody::Tree(_) => RECORD_HEADER_SIZE + key.len(),
        };

        let tree = match body {
            RecordBody::Tree(blob) => Self::write_tree(heap, blob)?,
            RecordBody::Flat(_) => Handle::INVALID,
        };

        let handle = heap.malloc(size);
        if !handle.is_valid() {
            if tree.is_valid() {
                release(heap, tree, "tree blob");
            }
            return Err(Error::NoMemory { required: size });
        }

        if let Err(e) = Self::write(heap, handle, key, body, tree, rows, now) {
            release(heap, handle, "record");
            if tree.is_valid() {
                release(heap, tree, "tree blob");
            }
            return Err(e);
        }
        Ok(match body {
            RecordBody::Flat(_) => Record::Flat(FlatRecord { handle }),
            RecordBody::Tree(_) => Record::TreeRoot(TreeRootRecord { handle }),
        })
    }

    fn write<A: Allocator>(
        heap: &mut A,
        handle: Handle,
        key: &[u8],
        body: RecordBody<'_>,
        tree: Handle,
        rows: u32,
        now: u32,
    ) -> Result<()> {
        let kind = match body {
            RecordBody::Flat(_) => KIND_FLAT,
            RecordBody::Tree(_) => KIND_TREE,
        };
        heap.store_u8(handle.add(REC_KIND), kind)?;
        heap.store_u8(handle.add(REC_KEY_LEN), key.len() as u8)?;
        heap.store_u16(handle.add(2), 0)?;
        heap.store_u32(handle.add(REC_ROWS), rows)?;
        heap.store_u32(handle.add(REC_MTIME), now)?;
        heap.store_u32(handle.add(REC_ATIME), now)?;
        let key_at = handle.add(RECORD_HEADER_SIZE as u64);
        copy_in(heap, key_at, key)?;

        match body {
            RecordBody::Flat(value) => {
                heap.store_u64(handle.add(REC_BODY), value.len() as u64)?;
                copy_in(heap, key_at.add(key.len() as u64), value)
            }
            RecordBody::Tree(_) => Ok(heap.store_handle(handle.add(REC_BODY), tree)?),
        }
    }

    /// Allocate a length-prefixed tree blob
    fn write_tree<A: Allocator>(heap: &mut A, blob: &[u8]) -> Result<Handle> {
        let size = TREE_HEADER_SIZE + blob.len();
        let tree = heap.malloc(size);
        if !tree.is_valid() {
            return Err(Error::NoMemory { required: size });
        }
        let written = heap
            .store_u64(tree, blob.len() as u64)
            .map_err(Error::from)
            .and_then(|()| copy_in(heap, tree.add(TREE_HEADER_SIZE as u64), blob));
        if let Err(e) = written {
            release(heap, tree, "tree blob");
            return Err(e);
        }
        Ok(tree)
    }

    /// View the record stored at `handle`, or None if no record header is
    /// recognizable there.
    pub fn open<A: Allocator>(heap: &A, handle: Handle) -> Result<Option<Record>> {
        if !heap.handle_is_valid(handle) || heap.chunk_size(handle) < RECORD_HEADER_SIZE {
            return Ok(None);
        }
        Ok(match heap.load_u8(handle.add(REC_KIND))? {
            KIND_FLAT => Some(Record::Flat(FlatRecord { handle })),
            KIND_TREE => Some(Record::TreeRoot(TreeRootRecord { handle })),
            _ => None,
        })
    }

    pub fn handle(&self) -> Handle {
        match self {
            Record::Flat(r) => r.handle,
            Record::TreeRoot(r) => r.handle,
        }
    }

    pub fn key_len<A: Allocator>(&self, heap: &A) -> Result<usize> {
        Ok(heap.load_u8(self.handle().add(REC_KEY_LEN))? as usize)
    }

    pub fn key<'h, A: Allocator>(&self, heap: &'h A) -> Result<&'h [u8]> {
        let at = self.handle().add(RECORD_HEADER_SIZE as u64);
        heap.bytes(at, self.key_len(heap)?)
            .ok_or_else(|| Error::Integrity(format!("key of record {} leaves the region", self.handle())))
    }

    /// Value bytes of a flat record, or the tree blob of a tree root
    pub fn value<'h, A: Allocator>(&self, heap: &'h A) -> Result<&'h [u8]> {
        let (at, len) = match self {
            Record::Flat(r) => {
                let at = r.handle.add((RECORD_HEADER_SIZE + self.key_len(heap)?) as u64);
                (at, heap.load_u64(r.handle.add(REC_BODY))? as usize)
            }
            Record::TreeRoot(r) => {
                let tree = heap.load_handle(r.handle.add(REC_BODY))?;
                let len = heap.load_u64(tree)? as usize;
                if len.saturating_add(TREE_HEADER_SIZE) > heap.chunk_size(tree) {
                    return Err(Error::Integrity(format!(
                        "tree blob {} claims {} bytes beyond its chunk",
                        tree, len
                    )));
                }
                (tree.add(TREE_HEADER_SIZE as u64), len)
            }
        };
        heap.bytes(at, len)
            .ok_or_else(|| Error::Integrity(format!("value of record {} leaves the region", self.handle())))
    }

    pub fn row_count<A: Allocator>(&self, heap: &A) -> Result<u32> {
        Ok(heap.load_u32(self.handle().add(REC_ROWS))?)
    }

    pub fn set_row_count<A: Allocator>(&self, heap: &mut A, rows: u32) -> Result<()> {
        Ok(heap.store_u32(self.handle().add(REC_ROWS), rows)?)
    }

    pub fn mtime<A: Allocator>(&self, heap: &A) -> Result<u32> {
        Ok(heap.load_u32(self.handle().add(REC_MTIME))?)
    }

    pub fn atime<A: Allocator>(&self, heap: &A) -> Result<u32> {
        Ok(heap.load_u32(self.handle().add(REC_ATIME))?)
    }

    pub fn touch<A: Allocator>(&self, heap: &mut A, now: u32) -> Result<()> {
        Ok(heap.store_u32(self.handle().add(REC_ATIME), now)?)
    }

    /// Bytes the allocator would reclaim by destroying this record
    pub fn footprint<A: Allocator>(&self, heap: &A) -> Result<usize> {
        Ok(match self {
            Record::Flat(r) => heap.ask_for_destroy_size(r.handle),
            Record::TreeRoot(r) => {
                let tree = heap.load_handle(r.handle.add(REC_BODY))?;
                heap.ask_for_destroy_size(r.handle) + heap.ask_for_destroy_size(tree)
            }
        })
    }

    /// Replace the value of a flat record, growing it in place or moving
    /// it. Returns the record at its (possibly new) handle; on failure the
    /// old record is left intact.
    pub fn replace_value<A: Allocator>(
        self,
        heap: &mut A,
        value: &[u8],
        rows: u32,
        now: u32,
    ) -> Result<Record> {
        let Record::Flat(flat) = self else {
            return Err(Error::InvalidKey("cannot replace the value of a tree record".to_string()));
        };

        let key_len = self.key_len(heap)?;
        let size = Self::flat_size(key_len, value.len());
        let handle = heap.realloc(flat.handle, size);
        if !handle.is_valid() {
            return Err(Error::NoMemory { required: size });
        }

        heap.store_u32(handle.add(REC_ROWS), rows)?;
        heap.store_u32(handle.add(REC_MTIME), now)?;
        heap.store_u32(handle.add(REC_ATIME), now)?;
        heap.store_u64(handle.add(REC_BODY), value.len() as u64)?;
        copy_in(heap, handle.add((RECORD_HEADER_SIZE + key_len) as u64), value)?;
        Ok(Record::Flat(FlatRecord { handle }))
    }

    /// Free the record and anything it owns
    pub fn destroy<A: Allocator>(self, heap: &mut A) -> Result<()> {
        if let Record::TreeRoot(r) = self {
            let tree = heap.load_handle(r.handle.add(REC_BODY))?;
            if tree.is_valid() {
                heap.free(tree)?;
            }
        }
        heap.free(self.handle())?;
        Ok(())
    }
}
