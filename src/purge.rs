//! Eviction sweeps, time markers, and empty-tier upkeep.
//!
//! Sweeps walk the tiers from their oldest end in a fixed order: empty,
//! clean, then dirty. Dirty records are written through the journal before
//! they are freed; a record whose write-back fails is skipped and stays
//! cached for the next sweep.
//!
//! A time marker is a node without a record, linked into the dirty tier.
//! Everything older than the marker was dirtied before it was placed, so a
//! flush that stops at the marker has a bounded amount of work.

use crate::error::{Error, Result};
use crate::journal::Journal;
use crate::node::{Node, NodeGroups, NodeId, NodeStat, Tier};
use crate::pond::Pond;
use crate::record::now_secs;
use crate::region::Region;
use tracing::{debug, info};

/// Hash-chain column value identifying a time marker
const TIME_MARKER_TAG: u32 = u32::MAX - 1;

const SWEEP_ORDER: [Tier; 3] = [Tier::Empty, Tier::Clean, Tier::Dirty];

/// Result of a purge sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeOutcome {
    /// Nodes looked at, including skipped ones
    pub examined: usize,
    pub purged: usize,
    /// Sum of the reclaim estimates of the purged records
    pub freed: usize,
    /// The requested size was reached
    pub satisfied: bool,
}

/// Result of [`Pond::flush_until_marker`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    pub flushed: usize,
    /// The sweep reached a time marker and removed it
    pub reached_marker: bool,
}

impl<R: Region, J: Journal> Pond<R, J> {
    fn resolve(&self, id: NodeId) -> Result<Node> {
        self.groups
            .node(&self.heap, id)?
            .ok_or_else(|| Error::Integrity(format!("tier links invalid node {}", id)))
    }

    /// First node of `tier`, from its oldest end, matching `pred`
    fn find_in_tier<F>(&self, tier: Tier, mut pred: F) -> Result<Option<Node>>
    where
        F: FnMut(Node) -> Result<bool>,
    {
        let mut cur = self.groups.tier_first(&self.heap, tier)?;
        while let Some(id) = cur {
            let node = self.resolve(id)?;
            if pred(node)? {
                return Ok(Some(node));
            }
            cur = self.groups.tier_next(&self.heap, tier, id)?;
        }
        Ok(None)
    }

    // --- time markers ----------------------------------------------------

    pub(crate) fn node_is_marker(&self, node: Node) -> Result<bool> {
        Ok(self.groups.next_node(&self.heap, node)?.raw() == TIME_MARKER_TAG
            && self.groups.tier(&self.heap, node)? == Some(Tier::Dirty))
    }

    pub fn is_time_marker(&self, id: NodeId) -> Result<bool> {
        match self.groups.node(&self.heap, id)? {
            Some(node) => self.node_is_marker(node),
            None => Ok(false),
        }
    }

    /// Place a marker stamped `time` at the newest end of the dirty tier
    pub fn insert_time_marker(&mut self, time: u32) -> Result<NodeId> {
        self.writable()?;
        let node = self.groups.allocate_node(&mut self.heap)?;
        self.groups
            .set_next_node(&mut self.heap, node, NodeId::new(TIME_MARKER_TAG))?;
        self.groups.set_data(&mut self.heap, node, time as u64)?;
        self.groups.link_tier(&mut self.heap, node, Tier::Dirty)?;
        let count = self.time_marker_count()?;
        self.set_time_marker_count(count + 1)?;
        debug!(id = %node.id(), time, "inserted time marker");
        Ok(node.id())
    }

    pub fn remove_time_marker(&mut self, id: NodeId) -> Result<()> {
        self.writable()?;
        let node = match self.groups.node(&self.heap, id)? {
            Some(node) if self.node_is_marker(node)? => node,
            _ => return Err(Error::KeyNotFound),
        };
        self.groups.unlink_tier(&mut self.heap, node)?;
        self.groups.release_node(&mut self.heap, node)?;
        let count = self.time_marker_count()?;
        self.set_time_marker_count(count.saturating_sub(1))?;
        debug!(%id, "removed time marker");
        Ok(())
    }

    /// Timestamp a marker was placed with
    pub fn time_marker_time(&self, id: NodeId) -> Result<Option<u32>> {
        let Some(node) = self.groups.node(&self.heap, id)? else {
            return Ok(None);
        };
        if !self.node_is_marker(node)? {
            return Ok(None);
        }
        Ok(Some(self.groups.data(&self.heap, node)? as u32))
    }

    /// Oldest marker in the dirty tier
    pub fn first_time_marker(&self) -> Result<Option<NodeId>> {
        let found = self.find_in_tier(Tier::Dirty, |node| self.node_is_marker(node))?;
        Ok(found.map(|node| node.id()))
    }

    /// Newest marker in the dirty tier
    pub fn last_time_marker(&self) -> Result<Option<NodeId>> {
        let groups: NodeGroups = self.groups;
        let mut cur = groups.tier_last(&self.heap, Tier::Dirty)?;
        while let Some(id) = cur {
            if self.is_time_marker(id)? {
                return Ok(Some(id));
            }
            cur = groups.tier_prev(&self.heap, Tier::Dirty, id)?;
        }
        Ok(None)
    }

    pub fn first_marker_time(&self) -> Result<Option<u32>> {
        match self.first_time_marker()? {
            Some(id) => self.time_marker_time(id),
            None => Ok(None),
        }
    }

    pub fn last_marker_time(&self) -> Result<Option<u32>> {
        match self.last_time_marker()? {
            Some(id) => self.time_marker_time(id),
            None => Ok(None),
        }
    }

    /// Seconds since the oldest dirty record was modified
    pub fn dirty_eldest_age(&self) -> Result<Option<u32>> {
        let now = now_secs();
        let Some(node) = self.find_in_tier(Tier::Dirty, |node| Ok(!self.node_is_marker(node)?))? else {
            return Ok(None);
        };
        let mtime = self.record_of(node)?.mtime(&self.heap)?;
        Ok(Some(now.saturating_sub(mtime)))
    }

    /// Write dirty records through the journal from the oldest end, moving
    /// them to the clean tier, until `max` are done or a time marker is
    /// reached. A reached marker is removed.
    pub fn flush_until_marker(&mut self, max: usize) -> Result<FlushOutcome> {
        self.writable()?;
        let mut outcome = FlushOutcome::default();
        while outcome.flushed < max {
            let Some(id) = self.groups.tier_first(&self.heap, Tier::Dirty)? else {
                break;
            };
            let node = self.resolve(id)?;
            if self.node_is_marker(node)? {
                self.remove_time_marker(id)?;
                outcome.reached_marker = true;
                break;
            }

            let record = self.record_of(node)?;
            self.write_back(record)?;
            let rows = record.row_count(&self.heap)?;
            self.settle_clean(node, rows)?;
            self.metrics.flush.increment();
            outcome.flushed += 1;
        }
        Ok(outcome)
    }

    // --- sweeps ----------------------------------------------------------

    /// Walk the tiers in sweep order purging records until `done` holds or
    /// `scan_limit` nodes were examined. Markers and `reserve` are skipped.
    fn sweep<F>(&mut self, reserve: Option<NodeId>, scan_limit: usize, done: F) -> Result<PurgeOutcome>
    where
        F: Fn(&PurgeOutcome) -> bool,
    {
        self.writable()?;
        let mut outcome = PurgeOutcome::default();
        'tiers: for tier in SWEEP_ORDER {
            let mut cur = self.groups.tier_first(&self.heap, tier)?;
            while let Some(id) = cur {
                if done(&outcome) || outcome.examined >= scan_limit {
                    break 'tiers;
                }
                cur = self.groups.tier_next(&self.heap, tier, id)?;
                outcome.examined += 1;

                if Some(id) == reserve {
                    continue;
                }
                let node = self.resolve(id)?;
                if self.node_is_marker(node)? {
                    continue;
                }
                match self.purge_node(node) {
                    Ok(freed) => {
                        outcome.freed += freed;
                        outcome.purged += 1;
                    }
                    Err(Error::Journal(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        self.metrics.purge_sweep.increment();
        Ok(outcome)
    }

    /// Purge least recently used records until the reclaim estimates add up
    /// to `size`, examining at most `count` nodes. `reserve` is never
    /// purged.
    pub fn try_purge_size(
        &mut self,
        size: usize,
        reserve: Option<NodeId>,
        count: usize,
    ) -> Result<PurgeOutcome> {
        let mut outcome = self.sweep(reserve, count, |o| o.freed >= size)?;
        outcome.satisfied = outcome.freed >= size;
        debug!(
            size,
            freed = outcome.freed,
            purged = outcome.purged,
            examined = outcome.examined,
            "purge by size"
        );
        self.refresh_gauges()?;
        Ok(outcome)
    }

    /// Purge up to `count` least recently used records
    pub fn pre_purge_nodes(&mut self, count: usize, reserve: Option<NodeId>) -> Result<usize> {
        let limit = self.config.purge_scan_limit;
        let outcome = self.sweep(reserve, limit, |o| o.purged >= count)?;
        Ok(outcome.purged)
    }

    /// Purge every record last touched at or before `oldest_time`.
    ///
    /// Clean and empty tiers are ordered by access, so their walk stops at
    /// the first younger record. The dirty tier is ordered by modification
    /// and stops at the first record modified after the cutoff.
    pub fn purge_by_time(&mut self, oldest_time: u32) -> Result<usize> {
        self.writable()?;
        let mut purged = 0;
        for tier in SWEEP_ORDER {
            let mut cur = self.groups.tier_first(&self.heap, tier)?;
            while let Some(id) = cur {
                cur = self.groups.tier_next(&self.heap, tier, id)?;
                let node = self.resolve(id)?;
                if self.node_is_marker(node)? {
                    continue;
                }
                let record = self.record_of(node)?;
                if tier == Tier::Dirty {
                    if record.mtime(&self.heap)? > oldest_time {
                        break;
                    }
                    if record.atime(&self.heap)? > oldest_time {
                        continue;
                    }
                } else if record.atime(&self.heap)? > oldest_time {
                    break;
                }

                match self.purge_node(node) {
                    Ok(_) => purged += 1,
                    Err(Error::Journal(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
        }

        self.metrics.purge_by_time.add(purged as u64);
        if purged > 0 {
            info!(purged, oldest_time, "purged records by age");
        }
        self.refresh_gauges()?;
        Ok(purged)
    }

    // --- delayed purge ---------------------------------------------------

    /// Ask for `count` records to be purged later, in batches, by
    /// [`Pond::run_delay_purge`]
    pub fn delay_purge_notify(&mut self, count: usize) {
        self.pending_purge = self.pending_purge.saturating_add(count);
    }

    pub fn pending_purge(&self) -> usize {
        self.pending_purge
    }

    /// Serve one batch of delayed purge requests. Requests left when
    /// nothing more can be purged are dropped.
    pub fn run_delay_purge(&mut self) -> Result<usize> {
        if self.pending_purge == 0 {
            return Ok(0);
        }
        let batch = self.pending_purge.min(self.config.delay_purge_batch.max(1));
        let purged = self.pre_purge_nodes(batch, None)?;
        self.pending_purge = if purged < batch {
            0
        } else {
            self.pending_purge - batch
        };
        self.metrics.delay_purge.add(purged as u64);
        if purged > 0 {
            self.refresh_gauges()?;
        }
        Ok(purged)
    }

    // --- empty tier ------------------------------------------------------

    /// Purge the oldest empty records beyond the configured limit
    pub fn prune_empty_nodes(&mut self) -> Result<usize> {
        let limit = self.config.empty_limit;
        if limit == 0 {
            return Ok(0);
        }
        let mut purged = 0;
        while self.empty_count()? > limit {
            let Some(id) = self.groups.tier_first(&self.heap, Tier::Empty)? else {
                break;
            };
            let node = self.resolve(id)?;
            self.purge_node(node)?;
            purged += 1;
        }
        if purged > 0 {
            debug!(purged, limit, "pruned empty records");
        }
        Ok(purged)
    }

    /// Move every empty record to the oldest end of the clean tier, keeping
    /// their order.
    pub fn shrink_empty_nodes(&mut self) -> Result<usize> {
        self.writable()?;
        let pos = self
            .groups
            .tier_first(&self.heap, Tier::Clean)?
            .unwrap_or(Tier::Clean.head());
        let mut moved = 0;
        while let Some(id) = self.groups.tier_first(&self.heap, Tier::Empty)? {
            let node = self.resolve(id)?;
            self.groups.unlink_tier(&mut self.heap, node)?;
            self.groups
                .link_tier_before(&mut self.heap, node, Tier::Clean, pos)?;
            moved += 1;
        }
        self.groups.set_stat(&mut self.heap, NodeStat::EmptyNodes, 0)?;
        Ok(moved)
    }
}
