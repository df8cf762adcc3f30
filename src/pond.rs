//! Record cache over a single region.
//!
//! A [`Pond`] ties the allocator, the node groups, and the hash index
//! together. Every record is one node: chained into a hash bucket by key,
//! linked into exactly one LRU tier, and pointing at its payload through the
//! node's data column.
//!
//! ```text
//!   key ──hash──► bucket ──NEXT──► node ──DATA──► record payload
//!                                    │
//!                          LRU_PREV / LRU_NEXT
//!                                    ▼
//!              dirty tier | clean tier | empty tier
//! ```
//!
//! All state lives in the region, so a pond closed by one process can be
//! attached by another. Counters in [`PondMetrics`] are process-local.

use crate::alloc::{Allocator, BinAllocator, Handle};
use crate::config::PondConfig;
use crate::error::{Error, Result};
use crate::hashtable::{HashAlgorithm, HashIndex};
use crate::journal::{Journal, NullJournal};
use crate::metrics::PondMetrics;
use crate::node::{Node, NodeGroups, NodeId, NodeStat, StartupMode, Tier};
use crate::record::{MAX_KEY_LEN, Record, RecordBody, now_secs};
use crate::region::{MmapRegion, MmapRegionBuilder, Region};
use std::path::Path;
use tracing::{debug, error, info, warn};

// Application header, stored at the start of the allocator's reserve zone
const APP_SIGN: u64 = 0;
const APP_VERSION: u64 = 8;
const APP_TYPE: u64 = 12;
const APP_GROUPS: u64 = 16;
const APP_HASH: u64 = 24;
const APP_KEY_SIZE: u64 = 32;
const APP_MARKERS: u64 = 36;

const POND_SIGN: u64 = 0x444e_4f50_504d_4853;
const POND_VERSION: u32 = 1;
const POND_TYPE: u32 = 1;

/// Write mode of an inserted record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Already durable elsewhere; may be dropped without write-back
    Clean,
    /// Must go through the journal before it is evicted
    Dirty,
}

/// Snapshot of the pond's persistent counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PondStats {
    pub used_nodes: u64,
    pub dirty_nodes: u64,
    pub empty_nodes: u64,
    pub used_rows: u64,
    pub dirty_rows: u64,
    pub time_markers: u32,
    pub node_groups: u32,
    pub hash_buckets: u32,
    pub free_buckets: u32,
    pub total_size: u64,
    pub user_alloc_size: u64,
    pub user_alloc_count: u64,
    /// Seconds since the oldest dirty record was modified
    pub dirty_eldest_age: Option<u32>,
}

/// Builder for opening a [`Pond`]
pub struct PondBuilder<J: Journal = NullJournal> {
    config: PondConfig,
    journal: J,
}

impl Default for PondBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PondBuilder {
    /// Create a builder with [`PondConfig::default`] and a journal that
    /// discards updates.
    ///
    /// Defaults:
    /// - 64MB region, variable-length keys
    /// - one hash bucket per 256 bytes of region, ELF hash
    /// - empty filter disabled
    pub fn new() -> Self {
        Self {
            config: PondConfig::default(),
            journal: NullJournal::new(),
        }
    }
}

impl<J: Journal> PondBuilder<J> {
    /// Replace the whole configuration, e.g. one loaded from TOML
    pub fn config(mut self, config: PondConfig) -> Self {
        self.config = config;
        self
    }

    /// Size of a region file created by [`PondBuilder::open_file`]
    pub fn region_size(mut self, bytes: usize) -> Self {
        self.config.region_size = bytes;
        self
    }

    /// Fixed key length in bytes (default: 0, variable-length keys)
    ///
    /// Must match the key size the region was formatted with.
    pub fn key_size(mut self, bytes: u16) -> Self {
        self.config.key_size = bytes;
        self
    }

    pub fn hash_buckets(mut self, buckets: u32) -> Self {
        self.config.hash_buckets = Some(buckets);
        self
    }

    pub fn hash_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.config.hash_algorithm = algorithm;
        self
    }

    /// Keep zero-row records in their own tier (default: false)
    pub fn empty_filter(mut self, enabled: bool) -> Self {
        self.config.empty_filter = enabled;
        self
    }

    /// Most empty records kept, 0 for no bound
    pub fn empty_limit(mut self, limit: u64) -> Self {
        self.config.empty_limit = limit;
        self
    }

    /// Reformat instead of failing when the region is dirty or corrupt
    /// (default: false)
    pub fn auto_delete_dirty(mut self, enabled: bool) -> Self {
        self.config.auto_delete_dirty = enabled;
        self
    }

    pub fn expire_alert_secs(mut self, secs: u32) -> Self {
        self.config.expire_alert_secs = secs;
        self
    }

    /// Bound on nodes examined by one purge sweep (default: 2500)
    pub fn purge_scan_limit(mut self, limit: usize) -> Self {
        self.config.purge_scan_limit = limit;
        self
    }

    /// Size the NodeID index for this many nodes when formatting
    pub fn expected_nodes(mut self, nodes: u64) -> Self {
        self.config.expected_nodes = nodes;
        self
    }

    /// Write dirty records through `journal` before they are evicted
    pub fn journal<K: Journal>(self, journal: K) -> PondBuilder<K> {
        PondBuilder {
            config: self.config,
            journal,
        }
    }

    /// Format `region` as a new, empty pond
    pub fn create<R: Region>(self, region: R) -> Result<Pond<R, J>> {
        Pond::format(region, self.config, self.journal)
    }

    /// Attach to a pond formatted earlier
    pub fn attach<R: Region>(self, region: R) -> Result<Pond<R, J>> {
        Pond::bind(region, self.config, self.journal)
    }

    /// Attach without writing to the region, for inspection.
    ///
    /// The key size is taken from the region rather than the configuration,
    /// no startup reconciliation runs, and the clean-close flag is left as
    /// found, so a dirty region stays dirty. The returned pond rejects every
    /// operation that would modify the region.
    pub fn inspect<R: Region>(self, region: R) -> Result<Pond<R, J>> {
        Pond::inspect(region, self.config, self.journal)
    }

    /// Attach if `region` carries a heap signature, otherwise format it
    pub fn open<R: Region>(self, region: R) -> Result<Pond<R, J>> {
        if BinAllocator::detect_version(&region).is_some() {
            self.attach(region)
        } else {
            self.create(region)
        }
    }

    /// Open (or create) a pond in a file mapped shared into this process
    pub fn open_file(self, path: impl AsRef<Path>) -> Result<Pond<MmapRegion, J>> {
        let region = MmapRegionBuilder::new(path.as_ref())
            .size(self.config.region_size)
            .build()?;
        self.open(region)
    }
}

/// Cache of keyed records in one region
pub struct Pond<R: Region, J: Journal = NullJournal> {
    pub(crate) heap: BinAllocator<R>,
    pub(crate) groups: NodeGroups,
    pub(crate) table: HashIndex,
    pub(crate) config: PondConfig,
    pub(crate) journal: J,
    pub(crate) metrics: PondMetrics,
    mode: StartupMode,
    read_only: bool,
    pub(crate) pending_purge: usize,
}

/// Key stored in the record a hashed node points at
fn stored_key<A: Allocator>(heap: &A, groups: &NodeGroups, node: Node) -> Result<Vec<u8>> {
    let record = Record::open(heap, groups.data_handle(heap, node)?)?
        .ok_or_else(|| Error::Integrity(format!("node {} holds no record", node.id())))?;
    Ok(record.key(heap)?.to_vec())
}

impl<R: Region, J: Journal> Pond<R, J> {
    fn format(region: R, config: PondConfig, journal: J) -> Result<Self> {
        config.validate()?;
        let mut heap = BinAllocator::init(region)?;
        let groups = NodeGroups::create(&mut heap)?;
        if config.expected_nodes > 0 {
            groups.index().pre_allocate(&mut heap, config.expected_nodes)?;
        }
        let table = HashIndex::create(
            &mut heap,
            config.effective_hash_buckets(),
            config.key_size,
            config.hash_algorithm,
        )?;

        let zone = heap.reserve_zone();
        heap.store_u64(zone.add(APP_SIGN), POND_SIGN)?;
        heap.store_u32(zone.add(APP_VERSION), POND_VERSION)?;
        heap.store_u32(zone.add(APP_TYPE), POND_TYPE)?;
        heap.store_handle(zone.add(APP_GROUPS), groups.handle())?;
        heap.store_handle(zone.add(APP_HASH), table.handle())?;
        heap.store_u16(zone.add(APP_KEY_SIZE), config.key_size)?;
        heap.store_u32(zone.add(APP_MARKERS), 0)?;
        heap.set_integrity(false);

        info!(
            size = heap.total_size(),
            key_size = config.key_size,
            expected_nodes = config.expected_nodes,
            "formatted pond"
        );
        let pond = Self::assemble(heap, groups, table, config, journal, StartupMode::Created);
        pond.refresh_gauges()?;
        Ok(pond)
    }

    fn bind(region: R, config: PondConfig, journal: J) -> Result<Self> {
        config.validate()?;
        let mut heap = BinAllocator::attach(region)?;
        let loaded = if heap.integrity() {
            Self::load(&mut heap, &config)
        } else {
            Err(Error::Integrity("region was not closed cleanly".to_string()))
        };

        match loaded {
            Ok((groups, table, mode)) => {
                heap.set_integrity(false);
                let mut pond = Self::assemble(heap, groups, table, config, journal, mode);
                pond.startup()?;
                info!(
                    nodes = pond.total_used_node()?,
                    dirty = pond.total_dirty_node()?,
                    ?mode,
                    "attached pond"
                );
                Ok(pond)
            }
            Err(e) if config.auto_delete_dirty && (e.is_integrity() || matches!(e, Error::Format(_))) => {
                warn!(error = %e, "discarding corrupt shared state");
                Self::format(heap.into_region(), config, journal)
            }
            Err(e) => {
                error!(error = %e, "failed to attach pond");
                Err(e)
            }
        }
    }

    fn inspect(region: R, mut config: PondConfig, journal: J) -> Result<Self> {
        let heap = BinAllocator::attach(region)?;
        config.key_size = Self::check_header(&heap)?;
        let zone = heap.reserve_zone();
        let groups = NodeGroups::open(&heap, heap.load_handle(zone.add(APP_GROUPS))?)?;
        let table = HashIndex::attach(&heap, heap.load_handle(zone.add(APP_HASH))?)?;

        let mut pond = Self::assemble(heap, groups, table, config, journal, StartupMode::Attached);
        pond.read_only = true;
        pond.refresh_gauges()?;
        debug!(clean = pond.heap.integrity(), "attached pond for inspection");
        Ok(pond)
    }

    /// Validate the application header, returning the key size it records.
    ///
    /// A missing signature means the pond state is unusable and is reported
    /// as an integrity violation; an unknown version as a format mismatch.
    fn check_header(heap: &BinAllocator<R>) -> Result<u16> {
        let zone = heap.reserve_zone();
        if heap.load_u64(zone.add(APP_SIGN))? != POND_SIGN {
            return Err(Error::Integrity("no pond signature in region".to_string()));
        }
        let version = heap.load_u32(zone.add(APP_VERSION))?;
        if version != POND_VERSION || heap.load_u32(zone.add(APP_TYPE))? != POND_TYPE {
            return Err(Error::Format(format!("pond version {} not supported", version)));
        }
        Ok(heap.load_u16(zone.add(APP_KEY_SIZE))?)
    }

    /// Read the application header and bind the node groups and hash index
    /// it names.
    fn load(
        heap: &mut BinAllocator<R>,
        config: &PondConfig,
    ) -> Result<(NodeGroups, HashIndex, StartupMode)> {
        let key_size = Self::check_header(heap)?;
        if key_size != config.key_size {
            return Err(Error::Config(format!(
                "region holds {} byte keys, configured for {}",
                key_size, config.key_size
            )));
        }

        let zone = heap.reserve_zone();
        let info = heap.load_handle(zone.add(APP_GROUPS))?;
        let (groups, mode) = NodeGroups::attach(heap, info)?;
        let header = heap.load_handle(zone.add(APP_HASH))?;
        let table = HashIndex::attach(&*heap, header)?;
        if table.key_size(heap)? != key_size {
            return Err(Error::Integrity("hash index key size disagrees with header".to_string()));
        }

        let markers = heap.load_u32(zone.add(APP_MARKERS))? as u64;
        let used = groups.stat(heap, NodeStat::UsedNodes)?;
        let hashed = table.node_count(heap)?;
        if hashed as u64 + markers != used {
            return Err(Error::Integrity(format!(
                "{} nodes in use but {} hashed and {} time markers",
                used, hashed, markers
            )));
        }
        Ok((groups, table, mode))
    }

    fn assemble(
        heap: BinAllocator<R>,
        groups: NodeGroups,
        table: HashIndex,
        config: PondConfig,
        journal: J,
        mode: StartupMode,
    ) -> Self {
        Self {
            heap,
            groups,
            table,
            config,
            journal,
            metrics: PondMetrics::new(),
            mode,
            read_only: false,
            pending_purge: 0,
        }
    }

    /// Reconcile the empty tier with the configured filter
    fn startup(&mut self) -> Result<()> {
        if !self.config.empty_filter {
            let moved = self.shrink_empty_nodes()?;
            if moved > 0 {
                info!(moved, "empty filter disabled, merged empty tier into clean");
            }
        } else if self.config.empty_limit > 0 {
            self.prune_empty_nodes()?;
        }
        self.refresh_gauges()
    }

    /// Mark the region cleanly closed, flush it, and hand it back.
    ///
    /// A pond dropped without closing leaves the region marked dirty, which
    /// the next attach reports. A pond attached for inspection hands the
    /// region back untouched.
    pub fn close(mut self) -> Result<R> {
        if !self.read_only {
            self.heap.set_integrity(true);
            self.heap.region().flush()?;
            info!(nodes = self.total_used_node()?, "closed pond");
        }
        Ok(self.heap.into_region())
    }

    /// Push outstanding writes of a file-backed region
    pub fn flush(&self) -> Result<()> {
        self.heap.region().flush()?;
        Ok(())
    }

    pub fn startup_mode(&self) -> StartupMode {
        self.mode
    }

    /// True for a pond attached with [`PondBuilder::inspect`]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// True if the region was marked cleanly closed when it was attached
    /// for inspection, or is marked so now
    pub fn region_clean(&self) -> bool {
        self.heap.integrity()
    }

    pub(crate) fn writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::Config("pond is attached read-only".to_string()));
        }
        Ok(())
    }

    pub fn config(&self) -> &PondConfig {
        &self.config
    }

    pub fn metrics(&self) -> &PondMetrics {
        &self.metrics
    }

    pub fn journal(&self) -> &J {
        &self.journal
    }

    pub fn journal_mut(&mut self) -> &mut J {
        &mut self.journal
    }

    pub fn allocator(&self) -> &BinAllocator<R> {
        &self.heap
    }

    pub fn node_groups(&self) -> NodeGroups {
        self.groups
    }

    pub fn hash_index(&self) -> HashIndex {
        self.table
    }

    // --- lookup ----------------------------------------------------------

    fn check_key(&self, key: &[u8]) -> Result<()> {
        let fixed = self.config.key_size as usize;
        if key.is_empty() {
            return Err(Error::InvalidKey("empty key".to_string()));
        }
        if fixed != 0 && key.len() != fixed {
            return Err(Error::InvalidKey(format!(
                "key of {} bytes in a table of {} byte keys",
                key.len(),
                fixed
            )));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(Error::InvalidKey(format!(
                "key of {} bytes exceeds {}",
                key.len(),
                MAX_KEY_LEN
            )));
        }
        Ok(())
    }

    fn find_in_bucket(&self, key: &[u8], slot: u32) -> Result<Option<Node>> {
        let groups = self.groups;
        self.table.find_in(&self.heap, &groups, slot, |heap, node| {
            match Record::open(heap, groups.data_handle(heap, node)?)? {
                Some(record) => Ok(record.key(heap)? == key),
                None => Ok(false),
            }
        })
    }

    /// Node holding `key` and the bucket it is chained in. While a hash
    /// migration is pending, a key missing from its current bucket is
    /// looked up under the legacy algorithm too.
    fn locate(&self, key: &[u8]) -> Result<Option<(Node, u32)>> {
        let slot = self.table.slot(&self.heap, key)?;
        if let Some(node) = self.find_in_bucket(key, slot)? {
            return Ok(Some((node, slot)));
        }
        if let Some(old) = self.table.legacy_slot(&self.heap, key)? {
            if let Some(node) = self.find_in_bucket(key, old)? {
                return Ok(Some((node, old)));
            }
        }
        Ok(None)
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Node>> {
        Ok(self.locate(key)?.map(|(node, _)| node))
    }

    /// Like `lookup`, moving a node found under the legacy algorithm to its
    /// current bucket
    fn lookup_mut(&mut self, key: &[u8]) -> Result<Option<Node>> {
        let Some((node, slot)) = self.locate(key)? else {
            return Ok(None);
        };
        if !self.read_only && slot != self.table.slot(&self.heap, key)? {
            self.table.move_to_current(&mut self.heap, &self.groups, key, node)?;
            self.metrics.hash_migrated.increment();
        }
        Ok(Some(node))
    }

    pub(crate) fn record_of(&self, node: Node) -> Result<Record> {
        Record::open(&self.heap, self.groups.data_handle(&self.heap, node)?)?
            .ok_or_else(|| Error::Integrity(format!("node {} holds no record", node.id())))
    }

    /// Node holding `key`
    pub fn find(&self, key: &[u8]) -> Result<Option<NodeId>> {
        let found = self.lookup(key)?.map(|node| node.id());
        match found {
            Some(_) => self.metrics.find_hit.increment(),
            None => self.metrics.find_miss.increment(),
        }
        Ok(found)
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.lookup(key)?.is_some())
    }

    /// Value stored under `key`, without touching its access time
    pub fn value(&self, key: &[u8]) -> Result<Option<&[u8]>> {
        let Some(node) = self.lookup(key)? else {
            return Ok(None);
        };
        let record = self.record_of(node)?;
        Ok(Some(record.value(&self.heap)?))
    }

    /// Copy of the value stored under `key`. Counts as an access: the
    /// record's access time is refreshed and a clean or empty record moves
    /// to the newest end of its tier.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.writable()?;
        let Some(node) = self.lookup_mut(key)? else {
            self.metrics.find_miss.increment();
            return Ok(None);
        };
        self.metrics.find_hit.increment();
        let record = self.record_of(node)?;
        let value = record.value(&self.heap)?.to_vec();
        record.touch(&mut self.heap, now_secs())?;
        if let Some(tier @ (Tier::Clean | Tier::Empty)) = self.groups.tier(&self.heap, node)? {
            self.groups.link_tier(&mut self.heap, node, tier)?;
        }
        Ok(Some(value))
    }

    /// Payload handle of the record under `key`
    pub fn record_handle(&self, key: &[u8]) -> Result<Option<Handle>> {
        match self.lookup(key)? {
            Some(node) => Ok(Some(self.groups.data_handle(&self.heap, node)?)),
            None => Ok(None),
        }
    }

    pub fn tier_of(&self, key: &[u8]) -> Result<Option<Tier>> {
        match self.lookup(key)? {
            Some(node) => self.groups.tier(&self.heap, node),
            None => Ok(None),
        }
    }

    pub fn row_count(&self, key: &[u8]) -> Result<Option<u32>> {
        match self.lookup(key)? {
            Some(node) => Ok(Some(self.record_of(node)?.row_count(&self.heap)?)),
            None => Ok(None),
        }
    }

    // --- write path ------------------------------------------------------

    /// Cache a flat record. Fails with [`Error::KeyExists`] if the key is
    /// already cached and [`Error::NoMemory`] when the region is full.
    pub fn insert(
        &mut self,
        key: &[u8],
        value: &[u8],
        rows: u32,
        state: RecordState,
    ) -> Result<NodeId> {
        self.insert_body(key, RecordBody::Flat(value), rows, state)
    }

    /// Cache a record whose body is a separately allocated tree blob
    pub fn insert_tree(
        &mut self,
        key: &[u8],
        blob: &[u8],
        rows: u32,
        state: RecordState,
    ) -> Result<NodeId> {
        self.insert_body(key, RecordBody::Tree(blob), rows, state)
    }

    /// Insert, and on exhaustion purge the reported size and retry once
    pub fn insert_with_purge(
        &mut self,
        key: &[u8],
        value: &[u8],
        rows: u32,
        state: RecordState,
    ) -> Result<NodeId> {
        match self.insert(key, value, rows, state) {
            Err(Error::NoMemory { required }) => {
                let limit = self.config.purge_scan_limit;
                let outcome = self.try_purge_size(required, None, limit)?;
                debug!(
                    required,
                    freed = outcome.freed,
                    purged = outcome.purged,
                    "purged for insert"
                );
                self.insert(key, value, rows, state)
            }
            other => other,
        }
    }

    fn insert_body(
        &mut self,
        key: &[u8],
        body: RecordBody<'_>,
        rows: u32,
        state: RecordState,
    ) -> Result<NodeId> {
        self.writable()?;
        self.check_key(key)?;
        if self.lookup_mut(key)?.is_some() {
            return Err(Error::KeyExists);
        }

        let slot = self.table.slot(&self.heap, key)?;
        let record = match Record::encode(&mut self.heap, key, body, rows, now_secs()) {
            Ok(record) => record,
            Err(e) => {
                if e.is_no_memory() {
                    self.metrics.insert_no_memory.increment();
                }
                return Err(e);
            }
        };
        let node = match self.groups.allocate_node(&mut self.heap) {
            Ok(node) => node,
            Err(e) => {
                record.destroy(&mut self.heap)?;
                if e.is_no_memory() {
                    self.metrics.insert_no_memory.increment();
                }
                return Err(e);
            }
        };

        self.groups.set_data_handle(&mut self.heap, node, record.handle())?;
        self.table.link(&mut self.heap, &self.groups, slot, node)?;
        let tier = self.entry_tier(rows, state);
        self.groups.link_tier(&mut self.heap, node, tier)?;
        self.tier_stats(tier, rows, 1)?;
        self.groups.add_stat(&mut self.heap, NodeStat::UsedRows, rows as i64)?;
        self.metrics.insert.increment();

        if tier == Tier::Empty {
            self.prune_empty_nodes()?;
        }
        Ok(node.id())
    }

    /// Replace the value under `key`. The record becomes dirty and moves to
    /// the newest end of the dirty tier. On failure the old value stays.
    pub fn update(&mut self, key: &[u8], value: &[u8], rows: u32) -> Result<()> {
        self.writable()?;
        self.check_key(key)?;
        let node = self.lookup_mut(key)?.ok_or(Error::KeyNotFound)?;
        let record = self.record_of(node)?;
        let old_rows = record.row_count(&self.heap)?;
        let now = now_secs();

        let replaced = match record {
            Record::Flat(_) => record.replace_value(&mut self.heap, value, rows, now),
            Record::TreeRoot(_) => {
                Record::encode(&mut self.heap, key, RecordBody::Tree(value), rows, now)
                    .and_then(|fresh| record.destroy(&mut self.heap).map(|_| fresh))
            }
        };
        let replaced = match replaced {
            Ok(record) => record,
            Err(e) => {
                if e.is_no_memory() {
                    self.metrics.insert_no_memory.increment();
                }
                return Err(e);
            }
        };

        self.groups.set_data_handle(&mut self.heap, node, replaced.handle())?;
        if let Some(old) = self.groups.tier(&self.heap, node)? {
            self.tier_stats(old, old_rows, -1)?;
        }
        self.groups.link_tier(&mut self.heap, node, Tier::Dirty)?;
        self.tier_stats(Tier::Dirty, rows, 1)?;
        self.groups.add_stat(
            &mut self.heap,
            NodeStat::UsedRows,
            rows as i64 - old_rows as i64,
        )?;
        self.metrics.update.increment();
        Ok(())
    }

    /// Record that the dirty record under `key` was persisted externally.
    /// It moves to the clean tier (or the empty tier when it has no rows
    /// and the empty filter is on).
    pub fn mark_clean(&mut self, key: &[u8]) -> Result<()> {
        self.writable()?;
        let node = self.lookup_mut(key)?.ok_or(Error::KeyNotFound)?;
        if self.groups.tier(&self.heap, node)? == Some(Tier::Dirty) {
            let rows = self.record_of(node)?.row_count(&self.heap)?;
            self.settle_clean(node, rows)?;
        }
        Ok(())
    }

    /// Move a dirty record to the tier it belongs in once clean
    pub(crate) fn settle_clean(&mut self, node: Node, rows: u32) -> Result<()> {
        let tier = self.entry_tier(rows, RecordState::Clean);
        self.tier_stats(Tier::Dirty, rows, -1)?;
        self.groups.link_tier(&mut self.heap, node, tier)?;
        self.tier_stats(tier, rows, 1)
    }

    /// Evict the record under `key`. A dirty record is written through the
    /// journal first; if that fails the record stays cached.
    pub fn purge(&mut self, key: &[u8]) -> Result<()> {
        self.writable()?;
        let node = self.lookup(key)?.ok_or(Error::KeyNotFound)?;
        self.purge_node(node).map(|_| ())
    }

    /// Evict one record node, returning the bytes its destruction was
    /// estimated to reclaim.
    pub(crate) fn purge_node(&mut self, node: Node) -> Result<usize> {
        let record = self.record_of(node)?;
        let tier = self.groups.tier(&self.heap, node)?;
        if tier == Some(Tier::Dirty) {
            self.write_back(record)?;
        }
        self.expire_alert(record, now_secs())?;

        let freed = record.footprint(&self.heap)?;
        let rows = record.row_count(&self.heap)?;
        let key = record.key(&self.heap)?.to_vec();
        self.unlink_hashed(&key, node)?;
        if let Some(tier) = tier {
            self.tier_stats(tier, rows, -1)?;
        }
        self.groups.unlink_tier(&mut self.heap, node)?;
        self.groups.add_stat(&mut self.heap, NodeStat::UsedRows, -(rows as i64))?;
        record.destroy(&mut self.heap)?;
        self.groups.release_node(&mut self.heap, node)?;

        self.metrics.purge.increment();
        self.metrics.purge_bytes.add(freed as u64);
        match tier {
            Some(Tier::Dirty) => self.metrics.purge_dirty.increment(),
            Some(Tier::Empty) => self.metrics.purge_empty.increment(),
            _ => {}
        }
        Ok(freed)
    }

    /// Take `node` out of its hash chain, under the current algorithm or,
    /// during a migration, the legacy one
    fn unlink_hashed(&mut self, key: &[u8], node: Node) -> Result<()> {
        let slot = self.table.slot(&self.heap, key)?;
        if self.table.unlink(&mut self.heap, &self.groups, slot, node)? {
            return Ok(());
        }
        if let Some(old) = self.table.legacy_slot(&self.heap, key)? {
            if self.table.unlink(&mut self.heap, &self.groups, old, node)? {
                return Ok(());
            }
        }
        Err(Error::Integrity(format!(
            "node {} missing from hash chain {}",
            node.id(),
            slot
        )))
    }

    pub(crate) fn write_back(&mut self, record: Record) -> Result<u64> {
        let key = record.key(&self.heap)?;
        let value = record.value(&self.heap)?;
        match self.journal.write_update(key, value) {
            Ok(seq) => {
                self.metrics.journal_write.increment();
                Ok(seq)
            }
            Err(e) => {
                self.metrics.journal_write_fail.increment();
                warn!(error = %e, "journal write failed, record stays dirty");
                Err(e.into())
            }
        }
    }

    fn expire_alert(&self, record: Record, now: u32) -> Result<()> {
        let threshold = self.config.expire_alert_secs;
        if threshold == 0 {
            return Ok(());
        }
        let age = now.saturating_sub(record.mtime(&self.heap)?);
        if age < threshold {
            self.metrics.purge_alert.increment();
            warn!(
                age,
                threshold,
                key = %String::from_utf8_lossy(record.key(&self.heap)?),
                "purging recently modified record"
            );
        }
        Ok(())
    }

    fn entry_tier(&self, rows: u32, state: RecordState) -> Tier {
        match state {
            RecordState::Dirty => Tier::Dirty,
            RecordState::Clean if rows == 0 && self.config.empty_filter => Tier::Empty,
            RecordState::Clean => Tier::Clean,
        }
    }

    /// Account for a record of `rows` rows entering (`delta` 1) or leaving
    /// (`delta` -1) `tier`
    pub(crate) fn tier_stats(&mut self, tier: Tier, rows: u32, delta: i64) -> Result<()> {
        match tier {
            Tier::Dirty => {
                self.groups.add_stat(&mut self.heap, NodeStat::DirtyNodes, delta)?;
                self.groups
                    .add_stat(&mut self.heap, NodeStat::DirtyRows, rows as i64 * delta)
            }
            Tier::Empty => self.groups.add_stat(&mut self.heap, NodeStat::EmptyNodes, delta),
            Tier::Clean => Ok(()),
        }
    }

    // --- maintenance -----------------------------------------------------

    /// Rebuild the hash index with `buckets` buckets and `algorithm`,
    /// completing any migration in progress
    pub fn rehash(&mut self, buckets: u32, algorithm: HashAlgorithm) -> Result<()> {
        self.writable()?;
        let groups = self.groups;
        self.table
            .rehash(&mut self.heap, &groups, buckets, algorithm, |heap, node| {
                stored_key(heap, &groups, node)
            })?;
        self.metrics.rehash.increment();
        self.refresh_gauges()
    }

    /// Switch variable-length keys to `algorithm` incrementally. Records
    /// stay reachable throughout; they move to their new buckets when
    /// accessed and as [`Pond::migrate_hash`] sweeps the table. Returns
    /// false when the table already uses `algorithm`.
    pub fn begin_hash_migration(&mut self, algorithm: HashAlgorithm) -> Result<bool> {
        self.writable()?;
        self.table.begin_migration(&mut self.heap, algorithm)
    }

    /// Sweep up to `max_buckets` buckets of a pending hash migration.
    /// Returns true once no migration is pending.
    pub fn migrate_hash(&mut self, max_buckets: u32) -> Result<bool> {
        if !self.hash_migration_pending()? {
            return Ok(true);
        }
        self.writable()?;
        let groups = self.groups;
        let done = self
            .table
            .migrate_step(&mut self.heap, &groups, max_buckets, |heap, node| {
                stored_key(heap, &groups, node)
            })?;
        if done {
            self.metrics.rehash.increment();
        }
        Ok(done)
    }

    pub fn hash_migration_pending(&self) -> Result<bool> {
        Ok(self.table.legacy_algorithm(&self.heap)?.is_some())
    }

    /// Records cached (time markers excluded)
    pub fn total_used_node(&self) -> Result<u64> {
        let used = self.groups.stat(&self.heap, NodeStat::UsedNodes)?;
        Ok(used.saturating_sub(self.time_marker_count()? as u64))
    }

    pub fn total_dirty_node(&self) -> Result<u64> {
        self.groups.stat(&self.heap, NodeStat::DirtyNodes)
    }

    pub fn total_used_row(&self) -> Result<u64> {
        self.groups.stat(&self.heap, NodeStat::UsedRows)
    }

    pub fn total_dirty_row(&self) -> Result<u64> {
        self.groups.stat(&self.heap, NodeStat::DirtyRows)
    }

    pub fn empty_count(&self) -> Result<u64> {
        self.groups.stat(&self.heap, NodeStat::EmptyNodes)
    }

    pub fn min_valid_node_id(&self) -> NodeId {
        self.groups.min_valid_node_id()
    }

    pub fn max_node_id(&self) -> Result<NodeId> {
        self.groups.max_node_id(&self.heap)
    }

    pub(crate) fn time_marker_count(&self) -> Result<u32> {
        Ok(self.heap.load_u32(self.heap.reserve_zone().add(APP_MARKERS))?)
    }

    pub(crate) fn set_time_marker_count(&mut self, count: u32) -> Result<()> {
        let cell = self.heap.reserve_zone().add(APP_MARKERS);
        Ok(self.heap.store_u32(cell, count)?)
    }

    /// IDs of every cached record
    pub fn record_ids(&self) -> Result<Vec<NodeId>> {
        let mut ids = Vec::new();
        for node in self.groups.linked_nodes(&self.heap)? {
            if !self.node_is_marker(node)? {
                ids.push(node.id());
            }
        }
        Ok(ids)
    }

    pub fn stats(&self) -> Result<PondStats> {
        Ok(PondStats {
            used_nodes: self.total_used_node()?,
            dirty_nodes: self.total_dirty_node()?,
            empty_nodes: self.empty_count()?,
            used_rows: self.total_used_row()?,
            dirty_rows: self.total_dirty_row()?,
            time_markers: self.time_marker_count()?,
            node_groups: self.groups.used_groups(&self.heap)?,
            hash_buckets: self.table.bucket_count(&self.heap)?,
            free_buckets: self.table.free_buckets(&self.heap)?,
            total_size: self.heap.total_size(),
            user_alloc_size: self.heap.user_alloc_size(),
            user_alloc_count: self.heap.user_alloc_count(),
            dirty_eldest_age: self.dirty_eldest_age()?,
        })
    }

    /// Copy the persistent counters into the metric gauges
    pub fn refresh_gauges(&self) -> Result<()> {
        let metrics = &self.metrics;
        metrics.nodes_used.set(self.total_used_node()? as i64);
        metrics.nodes_dirty.set(self.total_dirty_node()? as i64);
        metrics.nodes_empty.set(self.empty_count()? as i64);
        metrics
            .node_groups
            .set(self.groups.used_groups(&self.heap)? as i64);
        metrics
            .buckets_free
            .set(self.table.free_buckets(&self.heap)? as i64);
        metrics.bytes_used.set(self.heap.user_alloc_size() as i64);
        Ok(())
    }

    /// Full consistency check: allocator bins, node groups, hash chains, and
    /// tier membership against the persistent counters. Every used node
    /// must sit in exactly one tier.
    pub fn verify(&self) -> Result<()> {
        self.heap.check_bins()?;
        self.groups.check(&self.heap)?;
        self.table.check(&self.heap, &self.groups)?;

        let used = self.groups.stat(&self.heap, NodeStat::UsedNodes)?;
        let (mut linked, mut dirty, mut empty, mut markers) = (0u64, 0u64, 0u64, 0u32);
        let (mut rows, mut dirty_rows) = (0u64, 0u64);
        for tier in Tier::ALL {
            let mut cur = self.groups.tier_first(&self.heap, tier)?;
            while let Some(id) = cur {
                linked += 1;
                if linked > used {
                    return Err(Error::Integrity(format!(
                        "tiers link more than the {} nodes in use",
                        used
                    )));
                }
                let node = self.groups.node(&self.heap, id)?.ok_or_else(|| {
                    Error::Integrity(format!("{:?} tier links invalid node {}", tier, id))
                })?;
                if self.groups.tier(&self.heap, node)? != Some(tier) {
                    return Err(Error::Integrity(format!(
                        "node {} linked in the {:?} tier but tagged otherwise",
                        id, tier
                    )));
                }
                if self.node_is_marker(node)? {
                    markers += 1;
                } else {
                    let count = self.record_of(node)?.row_count(&self.heap)? as u64;
                    rows += count;
                    match tier {
                        Tier::Dirty => {
                            dirty += 1;
                            dirty_rows += count;
                        }
                        Tier::Empty => empty += 1,
                        Tier::Clean => {}
                    }
                }
                cur = self.groups.tier_next(&self.heap, tier, id)?;
            }
        }

        let expected = [
            ("linked nodes", linked, used),
            ("dirty nodes", dirty, self.total_dirty_node()?),
            ("empty nodes", empty, self.empty_count()?),
            ("time markers", markers as u64, self.time_marker_count()? as u64),
            ("rows", rows, self.total_used_row()?),
            ("dirty rows", dirty_rows, self.total_dirty_row()?),
        ];
        for (what, found, recorded) in expected {
            if found != recorded {
                return Err(Error::Integrity(format!(
                    "{} found in tiers, {} recorded {}",
                    found, recorded, what
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::VecJournal;
    use crate::region::{MemoryRegion, MemoryRegionBuilder};

    fn create_test_pond() -> Pond<MemoryRegion, VecJournal> {
        let region = MemoryRegionBuilder::new().size(4 * 1024 * 1024).build().unwrap();
        PondBuilder::new()
            .journal(VecJournal::new())
            .create(region)
            .unwrap()
    }

    #[test]
    fn test_insert_and_find() {
        let mut pond = create_test_pond();
        let id = pond.insert(b"abc", b"value", 1, RecordState::Clean).unwrap();

        assert_eq!(pond.find(b"abc").unwrap(), Some(id));
        assert_eq!(pond.value(b"abc").unwrap(), Some(&b"value"[..]));
        assert_eq!(pond.tier_of(b"abc").unwrap(), Some(Tier::Clean));
        assert_eq!(pond.total_used_node().unwrap(), 1);
        assert_eq!(pond.total_used_row().unwrap(), 1);
        assert!(pond.find(b"abd").unwrap().is_none());
        assert_eq!(pond.metrics().find_hit.value(), 1);
        assert_eq!(pond.metrics().find_miss.value(), 1);
        pond.verify().unwrap();
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut pond = create_test_pond();
        pond.insert(b"k", b"1", 1, RecordState::Clean).unwrap();
        assert!(matches!(
            pond.insert(b"k", b"2", 1, RecordState::Clean),
            Err(Error::KeyExists)
        ));
        assert_eq!(pond.value(b"k").unwrap(), Some(&b"1"[..]));
    }

    #[test]
    fn test_fixed_key_size_enforced() {
        let region = MemoryRegionBuilder::new().size(1024 * 1024).build().unwrap();
        let mut pond = PondBuilder::new().key_size(4).create(region).unwrap();
        assert!(matches!(
            pond.insert(b"abc", b"", 1, RecordState::Clean),
            Err(Error::InvalidKey(_))
        ));
        pond.insert(&7u32.to_ne_bytes(), b"seven", 1, RecordState::Clean)
            .unwrap();
        assert_eq!(pond.value(&7u32.to_ne_bytes()).unwrap(), Some(&b"seven"[..]));
    }

    #[test]
    fn test_update_moves_to_dirty() {
        let mut pond = create_test_pond();
        pond.insert(b"abc", &[1u8; 64], 1, RecordState::Clean).unwrap();
        pond.update(b"abc", &[2u8; 512], 3).unwrap();

        assert_eq!(pond.tier_of(b"abc").unwrap(), Some(Tier::Dirty));
        assert_eq!(pond.value(b"abc").unwrap(), Some(&[2u8; 512][..]));
        assert_eq!(pond.total_dirty_node().unwrap(), 1);
        assert_eq!(pond.total_dirty_row().unwrap(), 3);
        assert_eq!(pond.total_used_row().unwrap(), 3);

        pond.update(b"abc", b"small", 2).unwrap();
        assert_eq!(pond.total_dirty_node().unwrap(), 1);
        assert_eq!(pond.total_dirty_row().unwrap(), 2);
        pond.verify().unwrap();

        assert!(matches!(pond.update(b"nope", b"", 0), Err(Error::KeyNotFound)));
    }

    #[test]
    fn test_purge_dirty_writes_back() {
        let mut pond = create_test_pond();
        pond.insert(b"d", b"payload", 1, RecordState::Dirty).unwrap();
        pond.purge(b"d").unwrap();

        assert!(!pond.contains(b"d").unwrap());
        assert_eq!(pond.journal().len(), 1);
        assert_eq!(pond.journal().entries()[0].1, b"d");
        assert_eq!(pond.total_dirty_node().unwrap(), 0);
        assert_eq!(pond.metrics().purge_dirty.value(), 1);
        pond.verify().unwrap();
    }

    #[test]
    fn test_failed_write_back_keeps_record() {
        let mut pond = create_test_pond();
        pond.insert(b"d", b"payload", 1, RecordState::Dirty).unwrap();
        pond.journal_mut().set_fail(true);

        assert!(matches!(pond.purge(b"d"), Err(Error::Journal(_))));
        assert_eq!(pond.tier_of(b"d").unwrap(), Some(Tier::Dirty));
        assert_eq!(pond.metrics().journal_write_fail.value(), 1);
        pond.verify().unwrap();
    }

    #[test]
    fn test_empty_filter_routes_zero_rows() {
        let region = MemoryRegionBuilder::new().size(1024 * 1024).build().unwrap();
        let mut pond = PondBuilder::new().empty_filter(true).create(region).unwrap();
        pond.insert(b"none", b"", 0, RecordState::Clean).unwrap();
        pond.insert(b"some", b"x", 1, RecordState::Clean).unwrap();

        assert_eq!(pond.tier_of(b"none").unwrap(), Some(Tier::Empty));
        assert_eq!(pond.tier_of(b"some").unwrap(), Some(Tier::Clean));
        assert_eq!(pond.empty_count().unwrap(), 1);

        pond.update(b"none", b"now", 1).unwrap();
        assert_eq!(pond.tier_of(b"none").unwrap(), Some(Tier::Dirty));
        assert_eq!(pond.empty_count().unwrap(), 0);
        pond.verify().unwrap();
    }

    #[test]
    fn test_mark_clean() {
        let mut pond = create_test_pond();
        pond.insert(b"k", b"v", 2, RecordState::Dirty).unwrap();
        pond.mark_clean(b"k").unwrap();
        assert_eq!(pond.tier_of(b"k").unwrap(), Some(Tier::Clean));
        assert_eq!(pond.total_dirty_row().unwrap(), 0);
        pond.verify().unwrap();
    }

    #[test]
    fn test_get_refreshes_lru_position() {
        let mut pond = create_test_pond();
        let a = pond.insert(b"a", b"1", 1, RecordState::Clean).unwrap();
        let b = pond.insert(b"b", b"2", 1, RecordState::Clean).unwrap();
        let groups = pond.node_groups();
        assert_eq!(groups.tier_first(pond.allocator(), Tier::Clean).unwrap(), Some(a));

        assert_eq!(pond.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(groups.tier_first(pond.allocator(), Tier::Clean).unwrap(), Some(b));
        assert_eq!(groups.tier_last(pond.allocator(), Tier::Clean).unwrap(), Some(a));
    }

    #[test]
    fn test_tree_record() {
        let mut pond = create_test_pond();
        pond.insert_tree(b"t", &[9u8; 5], 12, RecordState::Clean)
            .unwrap();
        assert_eq!(pond.get(b"t").unwrap(), Some(vec![9u8; 5]));

        pond.update(b"t", &[4u8; 40], 2).unwrap();
        assert_eq!(pond.value(b"t").unwrap(), Some(&[4u8; 40][..]));
        assert_eq!(pond.row_count(b"t").unwrap(), Some(2));
        let before = pond.allocator().user_alloc_count();
        pond.purge(b"t").unwrap();
        assert_eq!(pond.allocator().user_alloc_count(), before - 2);
        pond.verify().unwrap();
    }

    #[test]
    fn test_insert_with_purge_recovers() {
        let region = MemoryRegionBuilder::new().size(2 * 1024 * 1024).build().unwrap();
        let mut pond = PondBuilder::new().hash_buckets(127).create(region).unwrap();

        let value = vec![0u8; 4000];
        let mut inserted = 0u32;
        loop {
            let key = format!("key-{}", inserted);
            match pond.insert(key.as_bytes(), &value, 1, RecordState::Clean) {
                Ok(_) => inserted += 1,
                Err(e) => {
                    assert!(e.is_no_memory());
                    break;
                }
            }
        }
        assert!(pond.metrics().insert_no_memory.value() >= 1);

        let key = format!("key-{}", inserted);
        pond.insert_with_purge(key.as_bytes(), &value, 1, RecordState::Clean)
            .unwrap();
        assert!(pond.contains(key.as_bytes()).unwrap());
        assert!(!pond.contains(b"key-0").unwrap());
        pond.verify().unwrap();
    }

    #[test]
    fn test_rehash_keeps_records() {
        let mut pond = create_test_pond();
        for i in 0..200u32 {
            pond.insert(format!("r{}", i).as_bytes(), &i.to_le_bytes(), 1, RecordState::Clean)
                .unwrap();
        }
        pond.rehash(31, HashAlgorithm::Murmur).unwrap();
        assert_eq!(pond.hash_index().bucket_count(pond.allocator()).unwrap(), 31);
        for i in 0..200u32 {
            assert_eq!(
                pond.value(format!("r{}", i).as_bytes()).unwrap(),
                Some(&i.to_le_bytes()[..])
            );
        }
        pond.verify().unwrap();
    }

    #[test]
    fn test_close_and_attach() {
        let mut pond = create_test_pond();
        pond.insert(b"keep", b"me", 1, RecordState::Dirty).unwrap();
        let region = pond.close().unwrap();

        let pond = PondBuilder::new().attach(region).unwrap();
        assert_eq!(pond.startup_mode(), StartupMode::Attached);
        assert_eq!(pond.value(b"keep").unwrap(), Some(&b"me"[..]));
        assert_eq!(pond.total_dirty_node().unwrap(), 1);
        pond.verify().unwrap();
    }

    #[test]
    fn test_attach_dirty_region() {
        let mut pond = create_test_pond();
        pond.insert(b"k", b"v", 1, RecordState::Clean).unwrap();
        let bytes = pond.allocator().region().as_bytes().to_vec();

        let region = MemoryRegion::copy_from(&bytes).unwrap();
        let err = PondBuilder::new().attach(region).err().unwrap();
        assert!(err.is_integrity());

        let region = MemoryRegion::copy_from(&bytes).unwrap();
        let pond = PondBuilder::new()
            .auto_delete_dirty(true)
            .attach(region)
            .unwrap();
        assert_eq!(pond.startup_mode(), StartupMode::Created);
        assert_eq!(pond.total_used_node().unwrap(), 0);
    }

    #[test]
    fn test_attach_rejects_key_size_change() {
        let pond = create_test_pond();
        let region = pond.close().unwrap();
        assert!(matches!(
            PondBuilder::new().key_size(8).attach(region),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_attach_merges_empty_tier_when_filter_disabled() {
        let region = MemoryRegionBuilder::new().size(1024 * 1024).build().unwrap();
        let mut pond = PondBuilder::new().empty_filter(true).create(region).unwrap();
        pond.insert(b"e", b"", 0, RecordState::Clean).unwrap();
        let region = pond.close().unwrap();

        let pond = PondBuilder::new().attach(region).unwrap();
        assert_eq!(pond.tier_of(b"e").unwrap(), Some(Tier::Clean));
        assert_eq!(pond.empty_count().unwrap(), 0);
        pond.verify().unwrap();
    }

    #[test]
    fn test_stats_and_gauges() {
        let mut pond = create_test_pond();
        pond.insert(b"a", b"1", 4, RecordState::Dirty).unwrap();
        pond.insert(b"b", b"2", 1, RecordState::Clean).unwrap();
        pond.refresh_gauges().unwrap();

        let stats = pond.stats().unwrap();
        assert_eq!(stats.used_nodes, 2);
        assert_eq!(stats.dirty_nodes, 1);
        assert_eq!(stats.used_rows, 5);
        assert_eq!(stats.dirty_rows, 4);
        assert!(stats.dirty_eldest_age.is_some());
        assert_eq!(pond.metrics().nodes_used.value(), 2);
        assert_eq!(pond.metrics().nodes_dirty.value(), 1);
    }

    #[test]
    fn test_missing_pond_signature() {
        let pond = create_test_pond();
        let sign = pond.allocator().reserve_zone().add(APP_SIGN).offset() as usize;
        let region = pond.close().unwrap();
        let mut bytes = region.as_bytes().to_vec();
        bytes[sign..sign + 8].fill(0);

        let region = MemoryRegion::copy_from(&bytes).unwrap();
        let err = PondBuilder::new().attach(region).err().unwrap();
        assert!(err.is_integrity());

        let region = MemoryRegion::copy_from(&bytes).unwrap();
        let pond = PondBuilder::new()
            .auto_delete_dirty(true)
            .attach(region)
            .unwrap();
        assert_eq!(pond.startup_mode(), StartupMode::Created);
        pond.verify().unwrap();
    }

    #[test]
    fn test_inspect_leaves_region_untouched() {
        let region = MemoryRegionBuilder::new().size(1024 * 1024).build().unwrap();
        let mut pond = PondBuilder::new().key_size(4).create(region).unwrap();
        pond.insert(&1u32.to_ne_bytes(), b"one", 1, RecordState::Dirty)
            .unwrap();
        let bytes = pond.allocator().region().as_bytes().to_vec();

        let region = MemoryRegion::copy_from(&bytes).unwrap();
        let mut pond = PondBuilder::new().inspect(region).unwrap();
        assert!(pond.is_read_only());
        assert!(!pond.region_clean());
        assert_eq!(pond.config().key_size, 4);
        assert_eq!(pond.value(&1u32.to_ne_bytes()).unwrap(), Some(&b"one"[..]));
        assert_eq!(pond.total_dirty_node().unwrap(), 1);
        pond.verify().unwrap();

        assert!(matches!(
            pond.insert(&2u32.to_ne_bytes(), b"two", 1, RecordState::Clean),
            Err(Error::Config(_))
        ));
        assert!(matches!(pond.get(&1u32.to_ne_bytes()), Err(Error::Config(_))));
        assert!(matches!(pond.purge_by_time(u32::MAX), Err(Error::Config(_))));

        let region = pond.close().unwrap();
        assert!(region.as_bytes() == &bytes[..]);
    }

    #[test]
    fn test_expected_nodes_sizes_index() {
        let nodes_per_block = 65536 * crate::node::NODES_PER_GROUP as u64;
        let region = MemoryRegionBuilder::new().size(8 * 1024 * 1024).build().unwrap();
        let plain = PondBuilder::new().create(region).unwrap();

        let region = MemoryRegionBuilder::new().size(8 * 1024 * 1024).build().unwrap();
        let sized = PondBuilder::new()
            .expected_nodes(3 * nodes_per_block)
            .create(region)
            .unwrap();
        assert_eq!(
            sized.allocator().user_alloc_count(),
            plain.allocator().user_alloc_count() + 2
        );
        sized.verify().unwrap();
    }

    #[test]
    fn test_hash_migration_keeps_records_reachable() {
        let region = MemoryRegionBuilder::new().size(4 * 1024 * 1024).build().unwrap();
        let mut pond = PondBuilder::new().hash_buckets(97).create(region).unwrap();
        pond.insert(b"moved-key", b"m", 1, RecordState::Clean).unwrap();
        for i in 0..150u32 {
            pond.insert(format!("r{}", i).as_bytes(), &i.to_le_bytes(), 1, RecordState::Clean)
                .unwrap();
        }

        assert!(pond.begin_hash_migration(HashAlgorithm::Murmur).unwrap());
        assert!(pond.hash_migration_pending().unwrap());
        assert!(pond.begin_hash_migration(HashAlgorithm::Elf).is_err());
        for i in 0..150u32 {
            assert_eq!(
                pond.value(format!("r{}", i).as_bytes()).unwrap(),
                Some(&i.to_le_bytes()[..])
            );
        }

        assert_eq!(pond.get(b"moved-key").unwrap(), Some(b"m".to_vec()));
        assert_eq!(pond.metrics().hash_migrated.value(), 1);
        pond.insert(b"late", b"l", 1, RecordState::Clean).unwrap();
        pond.verify().unwrap();

        let mut steps = 0;
        while !pond.migrate_hash(10).unwrap() {
            steps += 1;
        }
        assert_eq!(steps, 9);
        assert!(!pond.hash_migration_pending().unwrap());
        assert_eq!(pond.hash_index().algorithm(pond.allocator()).unwrap(), HashAlgorithm::Murmur);
        for i in 0..150u32 {
            let key = format!("r{}", i);
            assert!(pond.contains(key.as_bytes()).unwrap());
        }
        pond.purge(b"moved-key").unwrap();
        pond.purge(b"r7").unwrap();
        assert_eq!(pond.total_used_node().unwrap(), 150);
        pond.verify().unwrap();
    }
}
