pub mod alloc;
mod config;
mod error;
pub mod hashtable;
mod journal;
mod list;
mod metrics;
pub mod node;
mod pond;
mod purge;
pub mod record;
pub mod region;
mod task;

// Public API exports
pub use alloc::{Allocator, BinAllocator, Handle, HeapInfo};
pub use config::PondConfig;
pub use error::{AllocError, Error, JournalError, Result};
pub use hashtable::{HashAlgorithm, HashIndex};
pub use journal::{Journal, NullJournal, VecJournal};
pub use list::{Links, Ring};
pub use metrics::{Counter, Gauge, PondMetrics};
pub use node::{Node, NodeGroups, NodeId, NodeStat, StartupMode, Tier};
pub use pond::{Pond, PondBuilder, PondStats, RecordState};
pub use purge::{FlushOutcome, PurgeOutcome};
pub use record::Record;
pub use region::{MemoryRegion, MemoryRegionBuilder, MmapRegion, MmapRegionBuilder, Region};
pub use task::{PurgeTask, spawn_purge_task};
