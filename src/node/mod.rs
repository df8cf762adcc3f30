//! Node slabs and the NodeID index.
//!
//! Every cache record is referenced by a [`Node`]: a dense [`NodeId`] plus
//! the handle of the group that stores its attributes. Groups hold
//! [`NODES_PER_GROUP`] slots each and are never freed once created; slots
//! are recycled through a per-group free stack.
//!
//! NodeID layout:
//! ```text
//!  31        24 23                8 7        0
//! +------------+-------------------+----------+
//! | index L1   | index L2          | slot     |
//! +------------+-------------------+----------+
//!  \___________ group index ______/
//! ```

mod group;
mod groups;
mod index;

pub use group::Column;
pub use groups::{NodeGroups, NodeStat, StartupMode};
pub use index::NodeIndex;

use crate::alloc::Handle;
use std::fmt;

pub const NODES_PER_GROUP: u32 = 256;

/// Group 0 is reserved for bookkeeping; its slots are never issued.
pub const SYSTEM_GROUP_NODES: u32 = NODES_PER_GROUP;

/// Dense node identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    /// End of a hash chain, or no node at all
    pub const INVALID: NodeId = NodeId(u32::MAX);

    /// Sentinel heads of the three LRU tiers, inside the system group
    pub const DIRTY_HEAD: NodeId = NodeId(0);
    pub const CLEAN_HEAD: NodeId = NodeId(1);
    pub const EMPTY_HEAD: NodeId = NodeId(2);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn from_parts(group: u32, slot: u32) -> Self {
        Self(group * NODES_PER_GROUP + slot)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }

    pub const fn group_index(self) -> u32 {
        self.0 / NODES_PER_GROUP
    }

    pub const fn slot(self) -> u32 {
        self.0 % NODES_PER_GROUP
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Live reference to a node slot. Owns nothing; becomes stale once the
/// slot is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node {
    id: NodeId,
    group: Handle,
}

impl Node {
    pub(crate) const fn new(id: NodeId, group: Handle) -> Self {
        Self { id, group }
    }

    pub const fn id(self) -> NodeId {
        self.id
    }

    pub const fn group(self) -> Handle {
        self.group
    }

    pub const fn slot(self) -> u32 {
        self.id.slot()
    }
}

/// LRU tier a node currently belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Dirty,
    Clean,
    Empty,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Dirty, Tier::Clean, Tier::Empty];

    pub const fn head(self) -> NodeId {
        match self {
            Tier::Dirty => NodeId::DIRTY_HEAD,
            Tier::Clean => NodeId::CLEAN_HEAD,
            Tier::Empty => NodeId::EMPTY_HEAD,
        }
    }

    pub(crate) const fn to_u8(self) -> u8 {
        match self {
            Tier::Dirty => 1,
            Tier::Clean => 2,
            Tier::Empty => 3,
        }
    }

    pub(crate) const fn from_u8(v: u8) -> Option<Tier> {
        match v {
            1 => Some(Tier::Dirty),
            2 => Some(Tier::Clean),
            3 => Some(Tier::Empty),
            _ => None,
        }
    }
}
