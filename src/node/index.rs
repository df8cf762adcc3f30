use super::NodeId;
use crate::alloc::{Allocator, Handle};
use crate::error::{Error, Result};
use tracing::debug;

const L1_ENTRIES: u64 = 256;
const L2_ENTRIES: u64 = 65536;
const ENTRY_SIZE: u64 = 8;

const L1_SIZE: usize = (L1_ENTRIES * ENTRY_SIZE) as usize;
const L2_SIZE: usize = (L2_ENTRIES * ENTRY_SIZE) as usize;

/// Two-level radix index from NodeID to the handle of the node's group.
///
/// The first level is indexed by the top byte of the id and holds handles
/// of second-level blocks, allocated on first use. The second level is
/// indexed by the next 16 bits (the group index within the block) and holds
/// group handles. Lookups are two loads, independent of the hash index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeIndex {
    root: Handle,
}

impl NodeIndex {
    pub fn create<A: Allocator>(heap: &mut A) -> Result<Self> {
        let root = heap.calloc(L1_SIZE);
        if !root.is_valid() {
            return Err(Error::NoMemory { required: L1_SIZE });
        }
        Ok(Self { root })
    }

    pub fn from_root(root: Handle) -> Self {
        Self { root }
    }

    pub fn root(&self) -> Handle {
        self.root
    }

    fn l1_cell(&self, id: NodeId) -> Handle {
        self.root.add((id.raw() >> 24) as u64 * ENTRY_SIZE)
    }

    fn l2_cell(block: Handle, id: NodeId) -> Handle {
        block.add(((id.raw() >> 8) & 0xFFFF) as u64 * ENTRY_SIZE)
    }

    /// Group handle for `id`, or None if its group was never registered
    pub fn search<A: Allocator>(&self, heap: &A, id: NodeId) -> Result<Option<Handle>> {
        let block = heap.load_handle(self.l1_cell(id))?;
        if !block.is_valid() {
            return Ok(None);
        }
        let group = heap.load_handle(Self::l2_cell(block, id))?;
        Ok(group.is_valid().then_some(group))
    }

    /// Register `group` as the owner of every id sharing `id`'s group index.
    pub fn insert<A: Allocator>(&self, heap: &mut A, id: NodeId, group: Handle) -> Result<()> {
        let block = self.ensure_block(heap, id)?;
        heap.store_handle(Self::l2_cell(block, id), group)?;
        Ok(())
    }

    /// Allocate every second-level block needed to index `expected_nodes`
    /// ids up front, so later group creation cannot fail in the index.
    pub fn pre_allocate<A: Allocator>(&self, heap: &mut A, expected_nodes: u64) -> Result<()> {
        let blocks = expected_nodes.div_ceil(L2_ENTRIES * super::NODES_PER_GROUP as u64);
        for top in 0..blocks.min(L1_ENTRIES) {
            self.ensure_block(heap, NodeId::new((top as u32) << 24))?;
        }
        debug!(blocks, "pre-allocated node index");
        Ok(())
    }

    fn ensure_block<A: Allocator>(&self, heap: &mut A, id: NodeId) -> Result<Handle> {
        let cell = self.l1_cell(id);
        let block = heap.load_handle(cell)?;
        if block.is_valid() {
            return Ok(block);
        }
        let block = heap.calloc(L2_SIZE);
        if !block.is_valid() {
            return Err(Error::NoMemory { required: L2_SIZE });
        }
        heap.store_handle(cell, block)?;
        debug!(top = id.raw() >> 24, %block, "allocated node index block");
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::BinAllocator;
    use crate::region::{MemoryRegion, MemoryRegionBuilder};

    fn create_test_heap(size: usize) -> BinAllocator<MemoryRegion> {
        let region = MemoryRegionBuilder::new().size(size).build().unwrap();
        BinAllocator::init(region).unwrap()
    }

    #[test]
    fn test_insert_and_search() {
        let mut heap = create_test_heap(2 * 1024 * 1024);
        let index = NodeIndex::create(&mut heap).unwrap();

        let id = NodeId::from_parts(3, 0);
        assert_eq!(index.search(&heap, id).unwrap(), None);

        let group = Handle::new(0x1000);
        index.insert(&mut heap, id, group).unwrap();
        assert_eq!(index.search(&heap, id).unwrap(), Some(group));
        // every slot of the group resolves to the same handle
        assert_eq!(index.search(&heap, NodeId::from_parts(3, 255)).unwrap(), Some(group));
        assert_eq!(index.search(&heap, NodeId::from_parts(4, 0)).unwrap(), None);
    }

    #[test]
    fn test_block_handle_out_of_region() {
        let mut heap = create_test_heap(2 * 1024 * 1024);
        let index = NodeIndex::create(&mut heap).unwrap();
        heap.store_handle(index.root(), Handle::new(u64::MAX - 16)).unwrap();
        let err = index.search(&heap, NodeId::new(256)).unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_second_level_is_lazy() {
        let mut heap = create_test_heap(2 * 1024 * 1024);
        let index = NodeIndex::create(&mut heap).unwrap();
        let before = heap.user_alloc_count();

        index.insert(&mut heap, NodeId::new(256), Handle::new(0x2000)).unwrap();
        index.insert(&mut heap, NodeId::new(512), Handle::new(0x3000)).unwrap();
        assert_eq!(heap.user_alloc_count(), before + 1);

        index.insert(&mut heap, NodeId::new(1 << 24), Handle::new(0x4000)).unwrap();
        assert_eq!(heap.user_alloc_count(), before + 2);
    }

    #[test]
    fn test_block_allocation_failure_reported() {
        // room for the first level but not a second-level block
        let mut heap = create_test_heap(64 * 1024);
        let index = NodeIndex::create(&mut heap).unwrap();
        let result = index.insert(&mut heap, NodeId::new(256), Handle::new(0x2000));
        assert!(matches!(result, Err(Error::NoMemory { required }) if required == L2_SIZE));
        assert_eq!(index.search(&heap, NodeId::new(256)).unwrap(), None);
    }

    #[test]
    fn test_pre_allocate() {
        let mut heap = create_test_heap(2 * 1024 * 1024);
        let index = NodeIndex::create(&mut heap).unwrap();
        index.pre_allocate(&mut heap, 1000).unwrap();
        let count = heap.user_alloc_count();
        index.insert(&mut heap, NodeId::new(768), Handle::new(0x2000)).unwrap();
        assert_eq!(heap.user_alloc_count(), count);
    }
}
