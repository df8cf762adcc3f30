//! Node group layout.
//!
//! A group is one allocation holding a small header followed by one column
//! per node attribute. Attributes are stored column-wise so the LRU links
//! walked by eviction sweeps stay densely packed.
//!
//! ```text
//! offset  size   field
//! 0       8      list prev (group handle)
//! 8       8      list next (group handle)
//! 16      2      free stack top (slot, FREE_END if empty)
//! 18      2      free stack depth
//! 20      2      issued watermark (slots ever handed out)
//! 22      2      slots in use
//! 24      4      first NodeID of the group
//! 28      2      column count
//! 30      2      reserved
//! 32      1024   NEXT      u32  next node in hash chain, or free stack link
//! 1056    1024   LRU_PREV  u32  previous node in LRU tier
//! 2080    1024   LRU_NEXT  u32  next node in LRU tier
//! 3104    2048   DATA      u64  payload handle (time for time markers)
//! 5152    32     DIRTY     bit  dirty flag
//! 5184    256    TIER      u8   LRU tier (0 = unlinked)
//! 5440           end
//! ```
//!
//! This table is part of the region format; see
//! [`crate::alloc::layout::FORMAT_VERSION`].

use super::NODES_PER_GROUP;
use crate::alloc::Handle;

pub const GRP_PREV: u64 = 0;
pub const GRP_NEXT: u64 = 8;
pub const GRP_FREE_TOP: u64 = 16;
pub const GRP_FREE_COUNT: u64 = 18;
pub const GRP_ISSUED: u64 = 20;
pub const GRP_USED: u64 = 22;
pub const GRP_BASE_ID: u64 = 24;
pub const GRP_COLUMNS: u64 = 28;
pub const GRP_HEADER_SIZE: u64 = 32;

/// Free stack terminator
pub const FREE_END: u16 = u16::MAX;

/// Typed attribute column inside a group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    offset: u64,
    width: u64,
}

impl Column {
    pub const NEXT: Column = Column::new(GRP_HEADER_SIZE, 4);
    pub const LRU_PREV: Column = Column::after(Column::NEXT, 4);
    pub const LRU_NEXT: Column = Column::after(Column::LRU_PREV, 4);
    pub const DATA: Column = Column::after(Column::LRU_NEXT, 8);

    const fn new(offset: u64, width: u64) -> Self {
        Self { offset, width }
    }

    const fn after(prev: Column, width: u64) -> Self {
        Self::new(prev.end(), width)
    }

    const fn end(self) -> u64 {
        self.offset + self.width * NODES_PER_GROUP as u64
    }

    /// Handle of `slot`'s cell in this column of `group`
    pub fn at(self, group: Handle, slot: u32) -> Handle {
        debug_assert!(slot < NODES_PER_GROUP);
        group.add(self.offset + self.width * slot as u64)
    }
}

/// Dirty bitmap, one bit per slot
pub const DIRTY_OFFSET: u64 = Column::DATA.end();
pub const DIRTY_SIZE: u64 = NODES_PER_GROUP as u64 / 8;

/// Tier byte per slot
pub const TIER_OFFSET: u64 = DIRTY_OFFSET + DIRTY_SIZE;

pub const GROUP_SIZE: u64 = TIER_OFFSET + NODES_PER_GROUP as u64;

/// Columns recorded in each group header and checked on attach
pub const COLUMN_COUNT: u16 = 6;

/// Byte of the dirty bitmap holding `slot` and the bit within it
pub fn dirty_bit(group: Handle, slot: u32) -> (Handle, u8) {
    (group.add(DIRTY_OFFSET + (slot / 8) as u64), 1 << (slot % 8))
}

pub fn tier_cell(group: Handle, slot: u32) -> Handle {
    group.add(TIER_OFFSET + slot as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_table() {
        assert_eq!(Column::NEXT.at(Handle::INVALID, 0).offset(), 32);
        assert_eq!(Column::LRU_PREV.at(Handle::INVALID, 0).offset(), 1056);
        assert_eq!(Column::LRU_NEXT.at(Handle::INVALID, 0).offset(), 2080);
        assert_eq!(Column::DATA.at(Handle::INVALID, 0).offset(), 3104);
        assert_eq!(DIRTY_OFFSET, 5152);
        assert_eq!(TIER_OFFSET, 5184);
        assert_eq!(GROUP_SIZE, 5440);
        assert_eq!(Column::DATA.at(Handle::INVALID, 0).offset() % 8, 0);
    }

    #[test]
    fn test_cells_stay_inside_group() {
        let g = Handle::new(4096);
        let last = NODES_PER_GROUP - 1;
        assert!(Column::DATA.at(g, last).offset() + 8 <= DIRTY_OFFSET + g.offset());
        assert!(tier_cell(g, last).offset() < g.offset() + GROUP_SIZE);
        let (byte, bit) = dirty_bit(g, 9);
        assert_eq!(byte.offset(), g.offset() + DIRTY_OFFSET + 1);
        assert_eq!(bit, 0b10);
    }
}
