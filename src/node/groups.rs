use super::group::*;
use super::{Node, NodeId, NodeIndex, Tier, NODES_PER_GROUP, SYSTEM_GROUP_NODES};
use crate::alloc::{Allocator, Handle};
use crate::error::{Error, Result};
use crate::list::{Links, Ring};
use tracing::{debug, info, warn};

// Root record, allocated once per region
const INFO_FREE_LIST: u64 = 0;
const INFO_FULL_LIST: u64 = 16;
const INFO_USED_GROUPS: u64 = 32;
const INFO_USED_NODES: u64 = 40;
const INFO_DIRTY_NODES: u64 = 48;
const INFO_EMPTY_NODES: u64 = 56;
const INFO_USED_ROWS: u64 = 64;
const INFO_DIRTY_ROWS: u64 = 72;
const INFO_SYS_GROUP: u64 = 80;
const INFO_INDEX: u64 = 88;
const INFO_SIZE: usize = 96;

/// Group count is bounded by the 24 bits of group index in a NodeID
const MAX_GROUPS: u32 = 1 << 24;

/// Persistent counters kept next to the group lists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStat {
    UsedNodes,
    DirtyNodes,
    EmptyNodes,
    UsedRows,
    DirtyRows,
}

impl NodeStat {
    fn offset(self) -> u64 {
        match self {
            NodeStat::UsedNodes => INFO_USED_NODES,
            NodeStat::DirtyNodes => INFO_DIRTY_NODES,
            NodeStat::EmptyNodes => INFO_EMPTY_NODES,
            NodeStat::UsedRows => INFO_USED_ROWS,
            NodeStat::DirtyRows => INFO_DIRTY_ROWS,
        }
    }
}

/// How the tier heads were found when attaching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupMode {
    /// Freshly formatted
    Created,
    /// Existing region with all tier heads present
    Attached,
    /// Existing region without an empty tier head; one was created
    Upgraded,
}

/// Links of node groups in the free/full lists (the first two header words
/// of each group)
struct GroupLinks<'a, A: Allocator> {
    heap: &'a mut A,
}

impl<A: Allocator> Links for GroupLinks<'_, A> {
    type Id = Handle;

    fn next(&self, id: Handle) -> Result<Handle> {
        Ok(self.heap.load_handle(id.add(GRP_NEXT))?)
    }

    fn prev(&self, id: Handle) -> Result<Handle> {
        Ok(self.heap.load_handle(id.add(GRP_PREV))?)
    }

    fn set_next(&mut self, id: Handle, next: Handle) -> Result<()> {
        Ok(self.heap.store_handle(id.add(GRP_NEXT), next)?)
    }

    fn set_prev(&mut self, id: Handle, prev: Handle) -> Result<()> {
        Ok(self.heap.store_handle(id.add(GRP_PREV), prev)?)
    }
}

/// LRU links of nodes, resolved through the NodeID index
struct TierLinks<'a, A: Allocator> {
    heap: &'a mut A,
    index: NodeIndex,
}

impl<A: Allocator> TierLinks<'_, A> {
    fn cell(&self, id: NodeId, column: Column) -> Result<Handle> {
        lru_cell(&*self.heap, self.index, id, column)
    }
}

impl<A: Allocator> Links for TierLinks<'_, A> {
    type Id = NodeId;

    fn next(&self, id: NodeId) -> Result<NodeId> {
        Ok(NodeId::new(self.heap.load_u32(self.cell(id, Column::LRU_NEXT)?)?))
    }

    fn prev(&self, id: NodeId) -> Result<NodeId> {
        Ok(NodeId::new(self.heap.load_u32(self.cell(id, Column::LRU_PREV)?)?))
    }

    fn set_next(&mut self, id: NodeId, next: NodeId) -> Result<()> {
        let cell = self.cell(id, Column::LRU_NEXT)?;
        Ok(self.heap.store_u32(cell, next.raw())?)
    }

    fn set_prev(&mut self, id: NodeId, prev: NodeId) -> Result<()> {
        let cell = self.cell(id, Column::LRU_PREV)?;
        Ok(self.heap.store_u32(cell, prev.raw())?)
    }
}

/// LRU cell of `id`. A link to a node outside every group is corruption.
fn lru_cell<A: Allocator>(heap: &A, index: NodeIndex, id: NodeId, column: Column) -> Result<Handle> {
    match index.search(heap, id)? {
        Some(group) => Ok(column.at(group, id.slot())),
        None => Err(Error::Integrity(format!("LRU link to node {} outside any group", id))),
    }
}

/// Node slab manager.
///
/// Holds only handles into the region; every operation takes the allocator
/// explicitly, so several regions can be managed side by side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeGroups {
    info: Handle,
    index: NodeIndex,
}

impl NodeGroups {
    /// Build the root record, the NodeID index, and the system group with
    /// the three tier heads.
    pub fn create<A: Allocator>(heap: &mut A) -> Result<Self> {
        let info = heap.calloc(INFO_SIZE);
        if !info.is_valid() {
            return Err(Error::NoMemory { required: INFO_SIZE });
        }
        let index = NodeIndex::create(heap)?;
        heap.store_handle(info.add(INFO_INDEX), index.root())?;

        let groups = Self { info, index };
        groups.free_ring().init(&mut GroupLinks { heap: &mut *heap })?;
        groups.full_ring().init(&mut GroupLinks { heap: &mut *heap })?;

        let sys = groups.create_group(heap)?;
        heap.store_u16(sys.add(GRP_ISSUED), SYSTEM_GROUP_NODES as u16)?;
        heap.store_u16(sys.add(GRP_USED), SYSTEM_GROUP_NODES as u16)?;
        heap.store_handle(info.add(INFO_SYS_GROUP), sys)?;

        let mut links = groups.tier_links(heap);
        for tier in Tier::ALL {
            Ring::new(tier.head()).init(&mut links)?;
        }

        info!(%info, "created node groups");
        Ok(groups)
    }

    /// Bind to a root record and verify group bookkeeping.
    pub fn attach<A: Allocator>(heap: &mut A, info: Handle) -> Result<(Self, StartupMode)> {
        let groups = Self::open(heap, info)?;

        // regions formatted before the empty tier existed carry a zeroed head
        let mode = if groups.empty_head_missing(heap)? {
            Ring::new(NodeId::EMPTY_HEAD).init(&mut groups.tier_links(heap))?;
            StartupMode::Upgraded
        } else {
            StartupMode::Attached
        };

        info!(
            groups = groups.used_groups(heap)?,
            nodes = groups.stat(heap, NodeStat::UsedNodes)?,
            ?mode,
            "attached node groups"
        );
        Ok((groups, mode))
    }

    /// Bind to a root record and verify it without writing to the region.
    pub fn open<A: Allocator>(heap: &A, info: Handle) -> Result<Self> {
        if heap.bytes(info, INFO_SIZE).is_none() {
            return Err(Error::Integrity(format!("node group root {} out of range", info)));
        }
        let index = NodeIndex::from_root(heap.load_handle(info.add(INFO_INDEX))?);
        let groups = Self { info, index };
        groups.check(heap)?;
        Ok(groups)
    }

    fn empty_head_missing<A: Allocator>(&self, heap: &A) -> Result<bool> {
        let sys = self.system_group(heap)?;
        let next = heap.load_u32(Column::LRU_NEXT.at(sys, NodeId::EMPTY_HEAD.slot()))?;
        let prev = heap.load_u32(Column::LRU_PREV.at(sys, NodeId::EMPTY_HEAD.slot()))?;
        Ok(next == 0 && prev == 0)
    }

    pub fn handle(&self) -> Handle {
        self.info
    }

    pub fn index(&self) -> NodeIndex {
        self.index
    }

    fn free_ring(&self) -> Ring<Handle> {
        Ring::new(self.info.add(INFO_FREE_LIST))
    }

    fn full_ring(&self) -> Ring<Handle> {
        Ring::new(self.info.add(INFO_FULL_LIST))
    }

    fn system_group<A: Allocator>(&self, heap: &A) -> Result<Handle> {
        Ok(heap.load_handle(self.info.add(INFO_SYS_GROUP))?)
    }

    fn tier_ring(tier: Tier) -> Ring<NodeId> {
        Ring::new(tier.head())
    }

    fn tier_links<'a, A: Allocator>(&self, heap: &'a mut A) -> TierLinks<'a, A> {
        TierLinks {
            heap,
            index: self.index,
        }
    }

    pub fn used_groups<A: Allocator>(&self, heap: &A) -> Result<u32> {
        Ok(heap.load_u32(self.info.add(INFO_USED_GROUPS))?)
    }

    pub fn stat<A: Allocator>(&self, heap: &A, stat: NodeStat) -> Result<u64> {
        Ok(heap.load_u64(self.info.add(stat.offset()))?)
    }

    pub fn add_stat<A: Allocator>(&self, heap: &mut A, stat: NodeStat, delta: i64) -> Result<()> {
        let cell = self.info.add(stat.offset());
        let value = heap.load_u64(cell)?.wrapping_add_signed(delta);
        Ok(heap.store_u64(cell, value)?)
    }

    pub fn set_stat<A: Allocator>(&self, heap: &mut A, stat: NodeStat, value: u64) -> Result<()> {
        Ok(heap.store_u64(self.info.add(stat.offset()), value)?)
    }

    /// Lowest NodeID ever issued to a record
    pub fn min_valid_node_id(&self) -> NodeId {
        NodeId::new(SYSTEM_GROUP_NODES)
    }

    /// Highest NodeID covered by an existing group
    pub fn max_node_id<A: Allocator>(&self, heap: &A) -> Result<NodeId> {
        Ok(NodeId::new(self.used_groups(heap)? * NODES_PER_GROUP - 1))
    }

    /// Resolve `id` to a node, checking it against the valid range
    pub fn node<A: Allocator>(&self, heap: &A, id: NodeId) -> Result<Option<Node>> {
        if id < self.min_valid_node_id() || id > self.max_node_id(heap)? {
            return Ok(None);
        }
        Ok(self.index.search(heap, id)?.map(|group| Node::new(id, group)))
    }

    /// Take a slot from the first group with room, creating a group when
    /// none has any. The node's attributes come back cleared.
    pub fn allocate_node<A: Allocator>(&self, heap: &mut A) -> Result<Node> {
        let group = match self.free_ring().first(&GroupLinks { heap: &mut *heap })? {
            Some(group) => group,
            None => {
                let group = self.create_group(heap)?;
                self.free_ring().push_front(&mut GroupLinks { heap: &mut *heap }, group)?;
                group
            }
        };

        let top = heap.load_u16(group.add(GRP_FREE_TOP))?;
        let slot = if top != FREE_END {
            let next = heap.load_u32(Column::NEXT.at(group, top as u32))?;
            heap.store_u16(group.add(GRP_FREE_TOP), next as u16)?;
            let depth = heap.load_u16(group.add(GRP_FREE_COUNT))?;
            heap.store_u16(group.add(GRP_FREE_COUNT), depth.wrapping_sub(1))?;
            top as u32
        } else {
            let issued = heap.load_u16(group.add(GRP_ISSUED))?;
            if issued as u32 >= NODES_PER_GROUP {
                return Err(Error::Integrity(format!("group {} on free list has no free slot", group)));
            }
            heap.store_u16(group.add(GRP_ISSUED), issued + 1)?;
            issued as u32
        };
        if slot >= NODES_PER_GROUP {
            return Err(Error::Integrity(format!("group {} free stack points at slot {}", group, slot)));
        }

        let used = heap.load_u16(group.add(GRP_USED))?.wrapping_add(1);
        heap.store_u16(group.add(GRP_USED), used)?;
        if used as u32 == NODES_PER_GROUP {
            self.full_ring().move_to_back(&mut GroupLinks { heap: &mut *heap }, group)?;
        }

        heap.store_u32(Column::NEXT.at(group, slot), NodeId::INVALID.raw())?;
        heap.store_u32(Column::LRU_PREV.at(group, slot), NodeId::INVALID.raw())?;
        heap.store_u32(Column::LRU_NEXT.at(group, slot), NodeId::INVALID.raw())?;
        heap.store_u64(Column::DATA.at(group, slot), 0)?;
        heap.store_u8(tier_cell(group, slot), 0)?;
        self.write_dirty(heap, group, slot, false)?;

        self.add_stat(heap, NodeStat::UsedNodes, 1)?;
        let base = heap.load_u32(group.add(GRP_BASE_ID))?;
        Ok(Node::new(NodeId::new(base + slot), group))
    }

    /// Return a node's slot to its group. The node must already be
    /// unlinked from its tier and hash chain.
    pub fn release_node<A: Allocator>(&self, heap: &mut A, node: Node) -> Result<()> {
        let group = node.group();
        let slot = node.slot();
        let used = heap.load_u16(group.add(GRP_USED))?;
        let issued = heap.load_u16(group.add(GRP_ISSUED))?;
        if used == 0 || slot >= issued as u32 {
            return Err(Error::Integrity(format!("release of unissued node {}", node.id())));
        }

        heap.store_u64(Column::DATA.at(group, slot), 0)?;
        heap.store_u8(tier_cell(group, slot), 0)?;
        self.write_dirty(heap, group, slot, false)?;

        let top = heap.load_u16(group.add(GRP_FREE_TOP))?;
        heap.store_u32(Column::NEXT.at(group, slot), top as u32)?;
        heap.store_u16(group.add(GRP_FREE_TOP), slot as u16)?;
        let depth = heap.load_u16(group.add(GRP_FREE_COUNT))?;
        heap.store_u16(group.add(GRP_FREE_COUNT), depth.wrapping_add(1))?;

        heap.store_u16(group.add(GRP_USED), used - 1)?;
        if used as u32 == NODES_PER_GROUP {
            self.free_ring().move_to_back(&mut GroupLinks { heap: &mut *heap }, group)?;
        }

        self.add_stat(heap, NodeStat::UsedNodes, -1)
    }

    fn create_group<A: Allocator>(&self, heap: &mut A) -> Result<Handle> {
        let index = self.used_groups(heap)?;
        if index >= MAX_GROUPS {
            return Err(Error::NoMemory { required: GROUP_SIZE as usize });
        }

        let group = heap.calloc(GROUP_SIZE as usize);
        if !group.is_valid() {
            return Err(Error::NoMemory { required: GROUP_SIZE as usize });
        }

        let base = NodeId::from_parts(index, 0);
        let registered = heap
            .store_u16(group.add(GRP_FREE_TOP), FREE_END)
            .and_then(|()| heap.store_u32(group.add(GRP_BASE_ID), base.raw()))
            .and_then(|()| heap.store_u16(group.add(GRP_COLUMNS), COLUMN_COUNT))
            .map_err(Error::from)
            .and_then(|()| self.index.insert(heap, base, group));
        if let Err(e) = registered {
            if let Err(free_err) = heap.free(group) {
                warn!(%group, error = %free_err, "failed to release unregistered node group");
            }
            return Err(e);
        }

        heap.store_u32(self.info.add(INFO_USED_GROUPS), index + 1)?;
        debug!(index, %group, "allocated node group");
        Ok(group)
    }

    // --- attributes ------------------------------------------------------

    /// Next node in the node's hash chain
    pub fn next_node<A: Allocator>(&self, heap: &A, node: Node) -> Result<NodeId> {
        Ok(NodeId::new(heap.load_u32(Column::NEXT.at(node.group(), node.slot()))?))
    }

    pub fn set_next_node<A: Allocator>(&self, heap: &mut A, node: Node, next: NodeId) -> Result<()> {
        Ok(heap.store_u32(Column::NEXT.at(node.group(), node.slot()), next.raw())?)
    }

    /// Raw word of the data column: the payload handle of a record, the
    /// timestamp of a time marker
    pub fn data<A: Allocator>(&self, heap: &A, node: Node) -> Result<u64> {
        Ok(heap.load_u64(Column::DATA.at(node.group(), node.slot()))?)
    }

    pub fn set_data<A: Allocator>(&self, heap: &mut A, node: Node, value: u64) -> Result<()> {
        Ok(heap.store_u64(Column::DATA.at(node.group(), node.slot()), value)?)
    }

    pub fn data_handle<A: Allocator>(&self, heap: &A, node: Node) -> Result<Handle> {
        Ok(Handle::new(self.data(heap, node)?))
    }

    pub fn set_data_handle<A: Allocator>(&self, heap: &mut A, node: Node, handle: Handle) -> Result<()> {
        self.set_data(heap, node, handle.offset())
    }

    pub fn is_dirty<A: Allocator>(&self, heap: &A, node: Node) -> Result<bool> {
        let (byte, bit) = dirty_bit(node.group(), node.slot());
        Ok(heap.load_u8(byte)? & bit != 0)
    }

    fn write_dirty<A: Allocator>(&self, heap: &mut A, group: Handle, slot: u32, dirty: bool) -> Result<()> {
        let (byte, bit) = dirty_bit(group, slot);
        let value = heap.load_u8(byte)?;
        Ok(heap.store_u8(byte, if dirty { value | bit } else { value & !bit })?)
    }

    pub fn tier<A: Allocator>(&self, heap: &A, node: Node) -> Result<Option<Tier>> {
        Ok(Tier::from_u8(heap.load_u8(tier_cell(node.group(), node.slot()))?))
    }

    /// Append `node` at the newest end of `tier`, unlinking it from its
    /// current tier first.
    pub fn link_tier<A: Allocator>(&self, heap: &mut A, node: Node, tier: Tier) -> Result<()> {
        let linked = self.tier(heap, node)?.is_some();
        let ring = Self::tier_ring(tier);
        let mut links = self.tier_links(heap);
        if linked {
            ring.move_to_back(&mut links, node.id())?;
        } else {
            ring.push_back(&mut links, node.id())?;
        }
        self.mark_tier(heap, node, Some(tier))
    }

    /// Insert `node` into `tier` directly before `pos`
    pub fn link_tier_before<A: Allocator>(&self, heap: &mut A, node: Node, tier: Tier, pos: NodeId) -> Result<()> {
        if self.tier(heap, node)?.is_some() {
            return Err(Error::Integrity(format!("node {} already linked into a tier", node.id())));
        }
        Self::tier_ring(tier).insert_before(&mut self.tier_links(heap), pos, node.id())?;
        self.mark_tier(heap, node, Some(tier))
    }

    pub fn unlink_tier<A: Allocator>(&self, heap: &mut A, node: Node) -> Result<()> {
        if let Some(tier) = self.tier(heap, node)? {
            Self::tier_ring(tier).remove(&mut self.tier_links(heap), node.id())?;
            self.mark_tier(heap, node, None)?;
        }
        Ok(())
    }

    fn mark_tier<A: Allocator>(&self, heap: &mut A, node: Node, tier: Option<Tier>) -> Result<()> {
        heap.store_u8(tier_cell(node.group(), node.slot()), tier.map_or(0, Tier::to_u8))?;
        self.write_dirty(heap, node.group(), node.slot(), tier == Some(Tier::Dirty))
    }

    /// Oldest node of `tier`
    pub fn tier_first<A: Allocator>(&self, heap: &A, tier: Tier) -> Result<Option<NodeId>> {
        self.tier_step(heap, tier, tier.head(), Column::LRU_NEXT)
    }

    /// Node after `id` in `tier`, None at the newest end
    pub fn tier_next<A: Allocator>(&self, heap: &A, tier: Tier, id: NodeId) -> Result<Option<NodeId>> {
        self.tier_step(heap, tier, id, Column::LRU_NEXT)
    }

    /// Newest node of `tier`
    pub fn tier_last<A: Allocator>(&self, heap: &A, tier: Tier) -> Result<Option<NodeId>> {
        self.tier_step(heap, tier, tier.head(), Column::LRU_PREV)
    }

    /// Node before `id` in `tier`, None at the oldest end
    pub fn tier_prev<A: Allocator>(&self, heap: &A, tier: Tier, id: NodeId) -> Result<Option<NodeId>> {
        self.tier_step(heap, tier, id, Column::LRU_PREV)
    }

    fn tier_step<A: Allocator>(&self, heap: &A, tier: Tier, id: NodeId, column: Column) -> Result<Option<NodeId>> {
        let cell = lru_cell(heap, self.index, id, column)?;
        let step = NodeId::new(heap.load_u32(cell)?);
        Ok((step != tier.head()).then_some(step))
    }

    /// Every node currently linked into a tier
    pub fn linked_nodes<A: Allocator>(&self, heap: &A) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        for index in 1..self.used_groups(heap)? {
            let Some(group) = self.index.search(heap, NodeId::from_parts(index, 0))? else {
                continue;
            };
            let issued = (heap.load_u16(group.add(GRP_ISSUED))? as u32).min(NODES_PER_GROUP);
            for slot in 0..issued {
                let node = Node::new(NodeId::from_parts(index, slot), group);
                if self.tier(heap, node)?.is_some() {
                    nodes.push(node);
                }
            }
        }
        Ok(nodes)
    }

    /// Verify group lists, per-group slot accounting, and the index against
    /// the root counters.
    pub fn check<A: Allocator>(&self, heap: &A) -> Result<()> {
        let used_groups = self.used_groups(heap)?;
        if used_groups == 0 {
            return Err(Error::Integrity("no system node group".to_string()));
        }
        let sys = self.system_group(heap)?;
        if self.index.search(heap, NodeId::new(0))? != Some(sys) {
            return Err(Error::Integrity("system node group not indexed".to_string()));
        }

        let mut seen = 0u32;
        let mut used_nodes = 0u64;
        for (ring, full) in [(self.free_ring(), false), (self.full_ring(), true)] {
            let mut group = heap.load_handle(ring.head().add(GRP_NEXT))?;
            while group != ring.head() {
                seen += 1;
                if seen >= used_groups {
                    return Err(Error::Integrity(format!(
                        "group lists hold more than the {} recorded groups",
                        used_groups - 1
                    )));
                }
                used_nodes += self.check_group(heap, group, full)? as u64;
                group = heap.load_handle(group.add(GRP_NEXT))?;
            }
        }

        if seen + 1 != used_groups {
            return Err(Error::Integrity(format!(
                "{} groups linked, {} recorded",
                seen + 1,
                used_groups
            )));
        }
        let recorded = self.stat(heap, NodeStat::UsedNodes)?;
        if used_nodes != recorded {
            return Err(Error::Integrity(format!(
                "{} nodes in use across groups, {} recorded",
                used_nodes, recorded
            )));
        }
        Ok(())
    }

    fn check_group<A: Allocator>(&self, heap: &A, group: Handle, full: bool) -> Result<u32> {
        if heap.bytes(group, GROUP_SIZE as usize).is_none() {
            return Err(Error::Integrity(format!("group {} out of range", group)));
        }
        if heap.load_u16(group.add(GRP_COLUMNS))? != COLUMN_COUNT {
            return Err(Error::Integrity(format!("group {} column layout mismatch", group)));
        }
        let base = NodeId::new(heap.load_u32(group.add(GRP_BASE_ID))?);
        if base.slot() != 0 || self.index.search(heap, base)? != Some(group) {
            return Err(Error::Integrity(format!("group {} not indexed at {}", group, base)));
        }

        let issued = heap.load_u16(group.add(GRP_ISSUED))? as u32;
        let used = heap.load_u16(group.add(GRP_USED))? as u32;
        let depth = heap.load_u16(group.add(GRP_FREE_COUNT))? as u32;
        if issued > NODES_PER_GROUP || used + depth != issued {
            return Err(Error::Integrity(format!(
                "group {}: {} used + {} released != {} issued",
                group, used, depth, issued
            )));
        }
        if full != (used == NODES_PER_GROUP) {
            return Err(Error::Integrity(format!("group {} on the wrong list", group)));
        }

        let mut slot = heap.load_u16(group.add(GRP_FREE_TOP))?;
        let mut walked = 0;
        while slot != FREE_END {
            walked += 1;
            if slot as u32 >= issued || walked > depth {
                return Err(Error::Integrity(format!("group {} free stack corrupt", group)));
            }
            slot = heap.load_u32(Column::NEXT.at(group, slot as u32))? as u16;
        }
        if walked != depth {
            return Err(Error::Integrity(format!("group {} free stack short", group)));
        }
        Ok(used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::BinAllocator;
    use crate::region::{MemoryRegion, MemoryRegionBuilder};

    fn create_test_groups() -> (BinAllocator<MemoryRegion>, NodeGroups) {
        let region = MemoryRegionBuilder::new().size(4 * 1024 * 1024).build().unwrap();
        let mut heap = BinAllocator::init(region).unwrap();
        let groups = NodeGroups::create(&mut heap).unwrap();
        (heap, groups)
    }

    #[test]
    fn test_first_node_after_system_group() {
        let (mut heap, groups) = create_test_groups();
        assert_eq!(groups.used_groups(&heap).unwrap(), 1);

        let node = groups.allocate_node(&mut heap).unwrap();
        assert_eq!(node.id(), groups.min_valid_node_id());
        assert_eq!(groups.used_groups(&heap).unwrap(), 2);
        assert_eq!(groups.max_node_id(&heap).unwrap(), NodeId::new(511));
        assert_eq!(groups.stat(&heap, NodeStat::UsedNodes).unwrap(), 1);
        assert_eq!(groups.next_node(&heap, node).unwrap(), NodeId::INVALID);
        assert_eq!(groups.data_handle(&heap, node).unwrap(), Handle::INVALID);
        assert_eq!(groups.tier(&heap, node).unwrap(), None);
    }

    #[test]
    fn test_released_slot_is_reused() {
        let (mut heap, groups) = create_test_groups();
        let a = groups.allocate_node(&mut heap).unwrap();
        let b = groups.allocate_node(&mut heap).unwrap();
        groups.set_data(&mut heap, a, 42).unwrap();

        groups.release_node(&mut heap, a).unwrap();
        let c = groups.allocate_node(&mut heap).unwrap();
        assert_eq!(c.id(), a.id());
        assert_eq!(groups.data(&heap, c).unwrap(), 0);
        assert_ne!(b.id(), c.id());
        groups.check(&heap).unwrap();
    }

    #[test]
    fn test_full_group_moves_between_lists() {
        let (mut heap, groups) = create_test_groups();
        let nodes: Vec<_> = (0..NODES_PER_GROUP)
            .map(|_| groups.allocate_node(&mut heap).unwrap())
            .collect();
        groups.check(&heap).unwrap();

        // the first group is full, so the next node opens a second one
        let extra = groups.allocate_node(&mut heap).unwrap();
        assert_eq!(extra.id().group_index(), 2);
        assert_eq!(groups.used_groups(&heap).unwrap(), 3);

        groups.release_node(&mut heap, nodes[10]).unwrap();
        groups.check(&heap).unwrap();

        // the freed slot is not at the head of the free list
        let next = groups.allocate_node(&mut heap).unwrap();
        assert_eq!(next.id().group_index(), 2);
        groups.check(&heap).unwrap();
    }

    #[test]
    fn test_node_lookup_range() {
        let (mut heap, groups) = create_test_groups();
        let node = groups.allocate_node(&mut heap).unwrap();
        assert_eq!(groups.node(&heap, node.id()).unwrap(), Some(node));
        assert_eq!(groups.node(&heap, NodeId::DIRTY_HEAD).unwrap(), None);
        assert_eq!(groups.node(&heap, NodeId::new(512)).unwrap(), None);
    }

    #[test]
    fn test_tier_links() {
        let (mut heap, groups) = create_test_groups();
        let a = groups.allocate_node(&mut heap).unwrap();
        let b = groups.allocate_node(&mut heap).unwrap();

        groups.link_tier(&mut heap, a, Tier::Clean).unwrap();
        groups.link_tier(&mut heap, b, Tier::Clean).unwrap();
        assert_eq!(groups.tier_first(&heap, Tier::Clean).unwrap(), Some(a.id()));
        assert_eq!(groups.tier_next(&heap, Tier::Clean, a.id()).unwrap(), Some(b.id()));
        assert_eq!(groups.tier_next(&heap, Tier::Clean, b.id()).unwrap(), None);

        groups.link_tier(&mut heap, a, Tier::Dirty).unwrap();
        assert!(groups.is_dirty(&heap, a).unwrap());
        assert_eq!(groups.tier(&heap, a).unwrap(), Some(Tier::Dirty));
        assert_eq!(groups.tier_first(&heap, Tier::Clean).unwrap(), Some(b.id()));
        assert_eq!(groups.tier_first(&heap, Tier::Dirty).unwrap(), Some(a.id()));

        groups.unlink_tier(&mut heap, a).unwrap();
        assert!(!groups.is_dirty(&heap, a).unwrap());
        assert_eq!(groups.tier_first(&heap, Tier::Dirty).unwrap(), None);
        assert_eq!(groups.linked_nodes(&heap).unwrap(), vec![b]);
    }

    #[test]
    fn test_attach_verifies() {
        let (mut heap, groups) = create_test_groups();
        for _ in 0..300 {
            groups.allocate_node(&mut heap).unwrap();
        }
        let (attached, mode) = NodeGroups::attach(&mut heap, groups.handle()).unwrap();
        assert_eq!(attached, groups);
        assert_eq!(mode, StartupMode::Attached);

        // corrupt the node counter
        groups.add_stat(&mut heap, NodeStat::UsedNodes, 1).unwrap();
        assert!(matches!(
            NodeGroups::attach(&mut heap, groups.handle()),
            Err(Error::Integrity(_))
        ));
    }

    #[test]
    fn test_group_creation_failure_rolls_back() {
        let region = MemoryRegionBuilder::new().size(1024 * 1024).build().unwrap();
        let mut heap = BinAllocator::init(region).unwrap();
        let groups = NodeGroups::create(&mut heap).unwrap();

        // exhaust the heap so the next group cannot be allocated
        while heap.malloc(4096).is_valid() {}
        let result = groups.allocate_node(&mut heap);
        assert!(matches!(result, Err(Error::NoMemory { .. })));
        assert_eq!(groups.used_groups(&heap).unwrap(), 1);
        groups.check(&heap).unwrap();
    }

    #[test]
    fn test_dangling_lru_link_is_integrity_error() {
        let (mut heap, groups) = create_test_groups();
        let a = groups.allocate_node(&mut heap).unwrap();
        groups.link_tier(&mut heap, a, Tier::Clean).unwrap();

        // point the clean head at a node in a group that was never created
        let sys = groups.system_group(&heap).unwrap();
        let cell = Column::LRU_NEXT.at(sys, NodeId::CLEAN_HEAD.slot());
        heap.store_u32(cell, NodeId::from_parts(40, 3).raw()).unwrap();

        let first = groups.tier_first(&heap, Tier::Clean).unwrap();
        assert_eq!(first, Some(NodeId::from_parts(40, 3)));
        assert!(groups.tier_next(&heap, Tier::Clean, NodeId::from_parts(40, 3)).unwrap_err().is_integrity());
        assert!(groups.unlink_tier(&mut heap, a).unwrap_err().is_integrity());
    }
}
