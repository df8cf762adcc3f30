//! Key to node-chain index.
//!
//! The table is a header plus a separately allocated bucket array of
//! NodeIDs, each the head of a chain linked through the nodes' own NEXT
//! attribute, so chains need no allocation of their own.
//!
//! Header layout:
//! ```text
//! 0   u32  bucket count   (hh_size)
//! 4   u32  empty buckets  (hh_free)
//! 8   u32  chained nodes  (hh_node)
//! 12  u16  fixed key size, 0 for variable-length keys
//! 14  u8   hash algorithm for variable-length keys
//! 15  u8   algorithm being migrated away from, 0xFF when none
//! 16  u64  bucket array handle
//! 24  u32  migration cursor (next bucket to sweep)
//! 28  u32  reserved
//! ```
//!
//! Fixed 1, 2 and 4 byte keys are used directly as integers modulo the
//! bucket count. Every other key is hashed.
//!
//! Switching the hash algorithm does not have to stop the world. During a
//! migration a chain may hold nodes placed under either algorithm: lookups
//! try the current algorithm first and fall back to the legacy one, and a
//! cursor sweeps the buckets moving legacy nodes to their new chains.

use crate::alloc::{Allocator, Handle};
use crate::error::{Error, Result};
use crate::node::{Node, NodeGroups, NodeId};
use tracing::{debug, info, warn};

const HH_SIZE: u64 = 0;
const HH_FREE: u64 = 4;
const HH_NODE: u64 = 8;
const HH_FIXED: u64 = 12;
const HH_ALGO: u64 = 14;
const HH_LEGACY: u64 = 15;
const HH_BUCKETS: u64 = 16;
const HH_CURSOR: u64 = 24;
const HEADER_SIZE: usize = 32;

const NO_LEGACY: u8 = 0xFF;

const BUCKET_SIZE: u64 = 4;

const MURMUR_SEED: u32 = 0x9747_b28c;

/// Hash used for keys that are not fixed 1/2/4-byte integers
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// ELF/PJW shift-xor hash
    Elf,
    /// MurmurHash2, 32-bit
    Murmur,
}

impl HashAlgorithm {
    fn to_u8(self) -> u8 {
        match self {
            HashAlgorithm::Elf => 0,
            HashAlgorithm::Murmur => 1,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(HashAlgorithm::Elf),
            1 => Some(HashAlgorithm::Murmur),
            _ => None,
        }
    }
}

/// ELF/PJW hash over the key bytes
pub fn elf_hash(key: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &byte in key {
        h = (h << 4).wrapping_add(byte as u32);
        let g = h & 0xF000_0000;
        if g != 0 {
            h ^= g >> 24;
            h ^= g;
        }
    }
    h
}

/// MurmurHash2 (32-bit) over the key bytes, reading blocks little-endian
pub fn murmur_hash2(key: &[u8], seed: u32) -> u32 {
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let mut h = seed ^ key.len() as u32;
    let mut blocks = key.chunks_exact(4);
    for block in &mut blocks {
        let mut k = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = blocks.remainder();
    if tail.len() >= 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// Bucket for `key` in a table of `buckets` buckets
fn compute_slot(algorithm: HashAlgorithm, key_size: u16, buckets: u32, key: &[u8]) -> u32 {
    let value = match (key_size, key.len()) {
        (1, 1) => key[0] as u32,
        (2, 2) => u16::from_ne_bytes([key[0], key[1]]) as u32,
        (4, 4) => u32::from_ne_bytes([key[0], key[1], key[2], key[3]]),
        _ => match algorithm {
            HashAlgorithm::Elf => elf_hash(key),
            HashAlgorithm::Murmur => murmur_hash2(key, MURMUR_SEED),
        },
    };
    value % buckets
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashIndex {
    header: Handle,
}

impl HashIndex {
    pub fn create<A: Allocator>(
        heap: &mut A,
        buckets: u32,
        key_size: u16,
        algorithm: HashAlgorithm,
    ) -> Result<Self> {
        if buckets == 0 {
            return Err(Error::Config("hash table needs at least one bucket".to_string()));
        }

        let header = heap.calloc(HEADER_SIZE);
        if !header.is_valid() {
            return Err(Error::NoMemory { required: HEADER_SIZE });
        }
        let array = match Self::alloc_buckets(heap, buckets) {
            Ok(array) => array,
            Err(e) => {
                if let Err(free_err) = heap.free(header) {
                    warn!(%header, error = %free_err, "failed to release hash header");
                }
                return Err(e);
            }
        };

        heap.store_u32(header.add(HH_SIZE), buckets)?;
        heap.store_u32(header.add(HH_FREE), buckets)?;
        heap.store_u32(header.add(HH_NODE), 0)?;
        heap.store_u16(header.add(HH_FIXED), key_size)?;
        heap.store_u8(header.add(HH_ALGO), algorithm.to_u8())?;
        heap.store_u8(header.add(HH_LEGACY), NO_LEGACY)?;
        heap.store_handle(header.add(HH_BUCKETS), array)?;
        heap.store_u32(header.add(HH_CURSOR), 0)?;

        info!(buckets, key_size, ?algorithm, "created hash index");
        Ok(Self { header })
    }

    /// Bind to an existing table, checking its header is sane
    pub fn attach<A: Allocator>(heap: &A, header: Handle) -> Result<Self> {
        if heap.bytes(header, HEADER_SIZE).is_none() {
            return Err(Error::Integrity(format!("hash header {} out of range", header)));
        }
        let table = Self { header };
        let buckets = table.bucket_count(heap)?;
        if buckets == 0 || table.free_buckets(heap)? > buckets {
            return Err(Error::Integrity("hash header counters corrupt".to_string()));
        }
        table.algorithm(heap)?;
        table.legacy_algorithm(heap)?;
        if table.migration_cursor(heap)? > buckets {
            return Err(Error::Integrity("hash migration cursor past the last bucket".to_string()));
        }
        let array = table.buckets(heap)?;
        if heap.bytes(array, (buckets as u64 * BUCKET_SIZE) as usize).is_none() {
            return Err(Error::Integrity(format!("bucket array {} out of range", array)));
        }
        Ok(table)
    }

    fn alloc_buckets<A: Allocator>(heap: &mut A, buckets: u32) -> Result<Handle> {
        let size = (buckets as u64 * BUCKET_SIZE) as usize;
        let array = heap.malloc(size);
        if !array.is_valid() {
            return Err(Error::NoMemory { required: size });
        }
        if let Some(bytes) = heap.bytes_mut(array, size) {
            bytes.fill(0xFF);
        }
        Ok(array)
    }

    pub fn handle(&self) -> Handle {
        self.header
    }

    fn buckets<A: Allocator>(&self, heap: &A) -> Result<Handle> {
        Ok(heap.load_handle(self.header.add(HH_BUCKETS))?)
    }

    pub fn bucket_count<A: Allocator>(&self, heap: &A) -> Result<u32> {
        Ok(heap.load_u32(self.header.add(HH_SIZE))?)
    }

    /// Buckets with an empty chain
    pub fn free_buckets<A: Allocator>(&self, heap: &A) -> Result<u32> {
        Ok(heap.load_u32(self.header.add(HH_FREE))?)
    }

    /// Nodes linked into any chain
    pub fn node_count<A: Allocator>(&self, heap: &A) -> Result<u32> {
        Ok(heap.load_u32(self.header.add(HH_NODE))?)
    }

    /// Fixed key length, or 0 for variable-length keys
    pub fn key_size<A: Allocator>(&self, heap: &A) -> Result<u16> {
        Ok(heap.load_u16(self.header.add(HH_FIXED))?)
    }

    /// Algorithm new placements use
    pub fn algorithm<A: Allocator>(&self, heap: &A) -> Result<HashAlgorithm> {
        let raw = heap.load_u8(self.header.add(HH_ALGO))?;
        HashAlgorithm::from_u8(raw).ok_or_else(|| Error::Integrity(format!("unknown hash algorithm {}", raw)))
    }

    /// Algorithm some chained nodes may still be placed under, while a
    /// migration is in progress
    pub fn legacy_algorithm<A: Allocator>(&self, heap: &A) -> Result<Option<HashAlgorithm>> {
        match heap.load_u8(self.header.add(HH_LEGACY))? {
            NO_LEGACY => Ok(None),
            raw => HashAlgorithm::from_u8(raw)
                .map(Some)
                .ok_or_else(|| Error::Integrity(format!("unknown legacy hash algorithm {}", raw))),
        }
    }

    pub fn migration_cursor<A: Allocator>(&self, heap: &A) -> Result<u32> {
        Ok(heap.load_u32(self.header.add(HH_CURSOR))?)
    }

    /// Bucket for `key` using the ELF hash for variable-length keys
    pub fn hash_slot<A: Allocator>(&self, heap: &A, key: &[u8]) -> Result<u32> {
        self.slot_with(heap, HashAlgorithm::Elf, key)
    }

    /// Bucket for `key` using MurmurHash2 for variable-length keys
    pub fn new_hash_slot<A: Allocator>(&self, heap: &A, key: &[u8]) -> Result<u32> {
        self.slot_with(heap, HashAlgorithm::Murmur, key)
    }

    fn slot_with<A: Allocator>(&self, heap: &A, algorithm: HashAlgorithm, key: &[u8]) -> Result<u32> {
        Ok(compute_slot(algorithm, self.key_size(heap)?, self.bucket_count(heap)?, key))
    }

    /// Bucket for `key` under the current algorithm
    pub fn slot<A: Allocator>(&self, heap: &A, key: &[u8]) -> Result<u32> {
        self.slot_with(heap, self.algorithm(heap)?, key)
    }

    /// Bucket `key` may still sit in from before a migration, when that
    /// differs from its current bucket
    pub fn legacy_slot<A: Allocator>(&self, heap: &A, key: &[u8]) -> Result<Option<u32>> {
        let Some(legacy) = self.legacy_algorithm(heap)? else {
            return Ok(None);
        };
        let old = self.slot_with(heap, legacy, key)?;
        Ok((old != self.slot(heap, key)?).then_some(old))
    }

    /// Cell holding the chain head of bucket `slot`
    pub fn hash_to_node<A: Allocator>(&self, heap: &A, slot: u32) -> Result<Handle> {
        let buckets = self.bucket_count(heap)?;
        if slot >= buckets {
            return Err(Error::Integrity(format!("bucket {} past the {} allocated", slot, buckets)));
        }
        Ok(self.buckets(heap)?.add(slot as u64 * BUCKET_SIZE))
    }

    pub fn head<A: Allocator>(&self, heap: &A, slot: u32) -> Result<NodeId> {
        Ok(NodeId::new(heap.load_u32(self.hash_to_node(heap, slot)?)?))
    }

    fn set_head<A: Allocator>(&self, heap: &mut A, slot: u32, id: NodeId) -> Result<()> {
        let cell = self.hash_to_node(heap, slot)?;
        Ok(heap.store_u32(cell, id.raw())?)
    }

    fn adjust(&self, heap: &mut impl Allocator, field: u64, delta: i32) -> Result<()> {
        let cell = self.header.add(field);
        let value = heap.load_u32(cell)?.wrapping_add_signed(delta);
        Ok(heap.store_u32(cell, value)?)
    }

    /// Push `node` onto the front of bucket `slot`'s chain
    pub fn link<A: Allocator>(&self, heap: &mut A, groups: &NodeGroups, slot: u32, node: Node) -> Result<()> {
        let head = self.head(heap, slot)?;
        groups.set_next_node(heap, node, head)?;
        self.set_head(heap, slot, node.id())?;
        if !head.is_valid() {
            self.adjust(heap, HH_FREE, -1)?;
        }
        self.adjust(heap, HH_NODE, 1)
    }

    /// Remove `node` from bucket `slot`'s chain. Returns false if it was not
    /// on that chain.
    pub fn unlink<A: Allocator>(&self, heap: &mut A, groups: &NodeGroups, slot: u32, node: Node) -> Result<bool> {
        let next = groups.next_node(heap, node)?;
        let head = self.head(heap, slot)?;

        if head == node.id() {
            self.set_head(heap, slot, next)?;
        } else {
            let Some(prev) = self.find_in(&*heap, groups, slot, |heap, n| {
                Ok(groups.next_node(heap, n)? == node.id())
            })?
            else {
                return Ok(false);
            };
            groups.set_next_node(heap, prev, next)?;
        }

        groups.set_next_node(heap, node, NodeId::INVALID)?;
        if !self.head(heap, slot)?.is_valid() {
            self.adjust(heap, HH_FREE, 1)?;
        }
        self.adjust(heap, HH_NODE, -1)?;
        Ok(true)
    }

    /// First node on bucket `slot`'s chain accepted by `matches`.
    ///
    /// A chain that links an invalid node or never terminates is reported
    /// as an integrity error.
    pub fn find_in<A, F>(&self, heap: &A, groups: &NodeGroups, slot: u32, mut matches: F) -> Result<Option<Node>>
    where
        A: Allocator,
        F: FnMut(&A, Node) -> Result<bool>,
    {
        let limit = self.node_count(heap)?;
        let mut cur = self.head(heap, slot)?;
        let mut steps = 0u32;
        while cur.is_valid() {
            let node = groups.node(heap, cur)?.ok_or_else(|| {
                Error::Integrity(format!("hash chain of bucket {} links invalid node {}", slot, cur))
            })?;
            if matches(heap, node)? {
                return Ok(Some(node));
            }
            steps += 1;
            if steps > limit {
                return Err(Error::Integrity(format!("hash chain of bucket {} does not terminate", slot)));
            }
            cur = groups.next_node(heap, node)?;
        }
        Ok(None)
    }

    /// Every chained node, bucket by bucket
    pub fn nodes<A: Allocator>(&self, heap: &A, groups: &NodeGroups) -> Result<Vec<Node>> {
        let limit = self.node_count(heap)? as usize;
        let mut nodes = Vec::with_capacity(limit);
        for slot in 0..self.bucket_count(heap)? {
            self.find_in(heap, groups, slot, |_, node| {
                nodes.push(node);
                if nodes.len() > limit {
                    return Err(Error::Integrity(format!(
                        "hash chains hold more than the {} recorded nodes",
                        limit
                    )));
                }
                Ok(false)
            })?;
        }
        Ok(nodes)
    }

    /// Recount chains and compare with the incremental counters
    pub fn check<A: Allocator>(&self, heap: &A, groups: &NodeGroups) -> Result<()> {
        let nodes = self.nodes(heap, groups)?;
        let mut empty = 0u32;
        for slot in 0..self.bucket_count(heap)? {
            if !self.head(heap, slot)?.is_valid() {
                empty += 1;
            }
        }
        let (recorded, free) = (self.node_count(heap)?, self.free_buckets(heap)?);
        if nodes.len() as u32 != recorded || empty != free {
            return Err(Error::Integrity(format!(
                "hash counters record {} nodes / {} empty buckets, chains hold {} / {}",
                recorded,
                free,
                nodes.len(),
                empty
            )));
        }
        Ok(())
    }

    /// Start moving variable-length keys to `algorithm` without a stop the
    /// world rehash. Returns false when the table already uses it.
    pub fn begin_migration<A: Allocator>(&self, heap: &mut A, algorithm: HashAlgorithm) -> Result<bool> {
        if self.legacy_algorithm(heap)?.is_some() {
            return Err(Error::Config("a hash migration is already in progress".to_string()));
        }
        let current = self.algorithm(heap)?;
        if current == algorithm {
            return Ok(false);
        }
        heap.store_u32(self.header.add(HH_CURSOR), 0)?;
        heap.store_u8(self.header.add(HH_LEGACY), current.to_u8())?;
        heap.store_u8(self.header.add(HH_ALGO), algorithm.to_u8())?;
        info!(from = ?current, to = ?algorithm, "hash migration started");
        Ok(true)
    }

    /// Move `node`, found under its legacy bucket, to its current bucket.
    pub fn move_to_current<A: Allocator>(
        &self,
        heap: &mut A,
        groups: &NodeGroups,
        key: &[u8],
        node: Node,
    ) -> Result<()> {
        let Some(old) = self.legacy_slot(heap, key)? else {
            return Ok(());
        };
        if !self.unlink(heap, groups, old, node)? {
            return Err(Error::Integrity(format!("node {} not on legacy bucket {}", node.id(), old)));
        }
        let slot = self.slot(heap, key)?;
        self.link(heap, groups, slot, node)
    }

    /// Sweep up to `max_buckets` buckets from the migration cursor, moving
    /// every node whose current bucket differs from the one it sits in.
    /// Returns true once no migration is pending.
    pub fn migrate_step<A, F>(&self, heap: &mut A, groups: &NodeGroups, max_buckets: u32, mut key_of: F) -> Result<bool>
    where
        A: Allocator,
        F: FnMut(&A, Node) -> Result<Vec<u8>>,
    {
        if self.legacy_algorithm(heap)?.is_none() {
            return Ok(true);
        }
        let buckets = self.bucket_count(heap)?;
        let start = self.migration_cursor(heap)?;
        let end = start.saturating_add(max_buckets).min(buckets);

        let mut moved = 0u32;
        for bucket in start..end {
            let mut misplaced = Vec::new();
            self.find_in(&*heap, groups, bucket, |heap, node| {
                let slot = self.slot(heap, &key_of(heap, node)?)?;
                if slot != bucket {
                    misplaced.push((node, slot));
                }
                Ok(false)
            })?;
            for (node, slot) in misplaced {
                if !self.unlink(heap, groups, bucket, node)? {
                    return Err(Error::Integrity(format!("node {} vanished from bucket {}", node.id(), bucket)));
                }
                self.link(heap, groups, slot, node)?;
                moved += 1;
            }
        }

        if end >= buckets {
            heap.store_u8(self.header.add(HH_LEGACY), NO_LEGACY)?;
            heap.store_u32(self.header.add(HH_CURSOR), 0)?;
            info!(moved, "hash migration finished");
            return Ok(true);
        }
        heap.store_u32(self.header.add(HH_CURSOR), end)?;
        debug!(moved, cursor = end, "hash migration step");
        Ok(false)
    }

    /// Rebuild the table with `buckets` buckets, optionally switching the
    /// variable-key hash. `key_of` returns the key stored for a node.
    /// Completes any migration in progress.
    ///
    /// All keys are gathered before anything is modified, so a failure
    /// leaves the table as it was.
    pub fn rehash<A, F>(
        &self,
        heap: &mut A,
        groups: &NodeGroups,
        buckets: u32,
        algorithm: HashAlgorithm,
        mut key_of: F,
    ) -> Result<()>
    where
        A: Allocator,
        F: FnMut(&A, Node) -> Result<Vec<u8>>,
    {
        if buckets == 0 {
            return Err(Error::Config("hash table needs at least one bucket".to_string()));
        }

        let key_size = self.key_size(heap)?;
        let mut placed = Vec::with_capacity(self.node_count(heap)? as usize);
        for node in self.nodes(heap, groups)? {
            let key = key_of(heap, node)?;
            placed.push((node, compute_slot(algorithm, key_size, buckets, &key)));
        }

        let array = Self::alloc_buckets(heap, buckets)?;
        let old = self.buckets(heap)?;
        heap.store_handle(self.header.add(HH_BUCKETS), array)?;
        heap.store_u32(self.header.add(HH_SIZE), buckets)?;
        heap.store_u8(self.header.add(HH_ALGO), algorithm.to_u8())?;
        heap.store_u8(self.header.add(HH_LEGACY), NO_LEGACY)?;
        heap.store_u32(self.header.add(HH_CURSOR), 0)?;

        let mut free = buckets;
        for (node, slot) in placed {
            let head = self.head(heap, slot)?;
            if !head.is_valid() {
                free -= 1;
            }
            groups.set_next_node(heap, node, head)?;
            self.set_head(heap, slot, node.id())?;
        }
        heap.store_u32(self.header.add(HH_FREE), free)?;
        heap.free(old)?;

        debug!(buckets, ?algorithm, nodes = self.node_count(heap)?, "rehashed");
        Ok(())
    }
}
