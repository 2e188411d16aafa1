//! Pool of registered memory regions.
//!
//! The pool assigns region ids and validates descriptors against the
//! registered ranges. It is an open-addressed table whose capacity is always
//! a power of two; the slot for id `r` is `r & (capacity - 1)`.
//!
//! Ids are `region_base + num_regions + probe_offset` truncated to 32 bits,
//! where `region_base` is a high-entropy value drawn once per pool. The high
//! bits act as a tag: a stale id from a previous run will, with high
//! probability, fail the id comparison on lookup instead of silently
//! aliasing a live region. Descriptors cross trust boundaries, so this cheap
//! probabilistic use-after-free check matters.

use crate::error::{CleanqError, Result};
use crate::trace;
use crate::types::{MemRegion, RegionId};

/// Initial number of table slots.
const INIT_POOL_SIZE: usize = 16;

/// A live entry in the pool.
#[derive(Debug, Clone, Copy)]
struct RegionEntry {
    id: RegionId,
    mem: MemRegion,
}

/// Open-addressed table of registered regions.
pub struct RegionPool {
    slots: Vec<Option<RegionEntry>>,
    num_regions: usize,
    region_base: u64,
    /// Probe hint carried across insertions.
    last_offset: u64,
}

impl RegionPool {
    /// Creates an empty pool with a random id base.
    #[must_use]
    pub fn new() -> Self {
        Self::with_region_base(rand::random())
    }

    /// Creates an empty pool with a caller-chosen id base.
    ///
    /// Tests inject deterministic bases here; production code uses
    /// [`new`](Self::new).
    #[must_use]
    pub fn with_region_base(region_base: u64) -> Self {
        Self {
            slots: vec![None; INIT_POOL_SIZE],
            num_regions: 0,
            region_base,
            last_offset: 0,
        }
    }

    /// Number of live regions.
    #[must_use]
    pub fn num_regions(&self) -> usize {
        self.num_regions
    }

    #[inline]
    fn slot_index(&self, id: u32) -> usize {
        id as usize & (self.slots.len() - 1)
    }

    fn entry(&self, rid: RegionId) -> Option<&RegionEntry> {
        self.slots[self.slot_index(rid.raw())]
            .as_ref()
            .filter(|e| e.id == rid)
    }

    /// Doubles the table and rehashes every entry by `id & (new_cap - 1)`.
    ///
    /// Rehashing is collision-free: live ids occupy distinct slots modulo the
    /// old capacity, and doubling only widens the mask.
    ///
    /// # Errors
    ///
    /// [`CleanqError::MallocFail`] when the larger table cannot be
    /// allocated; the pool is left untouched.
    fn grow(&mut self) -> Result<()> {
        let new_cap = self.slots.len() * 2;
        trace::debug!(new_cap, "growing region pool");

        let mut grown: Vec<Option<RegionEntry>> = Vec::new();
        grown
            .try_reserve_exact(new_cap)
            .map_err(|_| CleanqError::MallocFail)?;
        grown.resize_with(new_cap, || None);

        for entry in self.slots.drain(..).flatten() {
            let index = entry.id.raw() as usize & (new_cap - 1);
            debug_assert!(grown[index].is_none());
            grown[index] = Some(entry);
        }

        self.slots = grown;
        self.last_offset = 0;
        Ok(())
    }

    /// Registers a region and assigns it a fresh id.
    ///
    /// # Errors
    ///
    /// [`CleanqError::InvalidRegionArgs`] when the physical range intersects
    /// a live region; [`CleanqError::MallocFail`] when the table needed to
    /// grow and the allocation failed.
    pub fn add(&mut self, mem: &MemRegion) -> Result<RegionId> {
        for entry in self.slots.iter().flatten() {
            let intersects = !(mem.paddr.saturating_add(mem.len) <= entry.mem.paddr
                || entry.mem.paddr.saturating_add(entry.mem.len) <= mem.paddr);
            if intersects {
                return Err(CleanqError::InvalidRegionArgs);
            }
        }

        if self.num_regions == self.slots.len() {
            self.grow()?;
        }

        self.num_regions += 1;

        let mut offset = self.last_offset;
        let id = loop {
            let candidate = self
                .region_base
                .wrapping_add(self.num_regions as u64)
                .wrapping_add(offset) as u32;
            if self.slots[self.slot_index(candidate)].is_none() {
                break candidate;
            }
            offset += 1;
        };
        self.last_offset = offset;

        let rid = RegionId(id);
        let index = self.slot_index(id);
        self.slots[index] = Some(RegionEntry { id: rid, mem: *mem });

        trace::trace!(rid = rid.raw(), index, len = mem.len, "region added");
        Ok(rid)
    }

    /// Registers a region under an id assigned by the peer.
    ///
    /// Used while applying an in-band registration command, so that the same
    /// id is valid on both endpoints.
    ///
    /// # Errors
    ///
    /// [`CleanqError::InvalidRegionId`] when the id's slot is occupied;
    /// [`CleanqError::MallocFail`] when the table needed to grow and the
    /// allocation failed.
    pub fn add_with_id(&mut self, mem: &MemRegion, rid: RegionId) -> Result<()> {
        if self.num_regions == self.slots.len() {
            self.grow()?;
        }

        let index = self.slot_index(rid.raw());
        if self.slots[index].is_some() {
            return Err(CleanqError::InvalidRegionId);
        }

        self.slots[index] = Some(RegionEntry { id: rid, mem: *mem });
        self.num_regions += 1;

        trace::trace!(rid = rid.raw(), index, "region mirrored from peer");
        Ok(())
    }

    /// Removes a region, returning its memory block.
    ///
    /// # Errors
    ///
    /// [`CleanqError::InvalidRegionId`] when the id is not registered.
    pub fn remove(&mut self, rid: RegionId) -> Result<MemRegion> {
        let index = self.slot_index(rid.raw());
        match self.slots[index] {
            Some(entry) if entry.id == rid => {
                self.slots[index] = None;
                self.num_regions -= 1;
                trace::trace!(rid = rid.raw(), "region removed");
                Ok(entry.mem)
            }
            _ => Err(CleanqError::InvalidRegionId),
        }
    }

    /// Looks up a region's memory block.
    #[must_use]
    pub fn get(&self, rid: RegionId) -> Option<MemRegion> {
        self.entry(rid).map(|e| e.mem)
    }

    /// Iterates over the live regions.
    pub fn iter(&self) -> impl Iterator<Item = (RegionId, MemRegion)> + '_ {
        self.slots.iter().flatten().map(|e| (e.id, e.mem))
    }

    /// Checks a descriptor's ranges against the region.
    ///
    /// Requires a known region, a non-zero length,
    /// `offset + length <= region.len` and
    /// `valid_data + valid_length <= length`, all overflow-checked.
    #[must_use]
    pub fn check_bounds(
        &self,
        rid: RegionId,
        offset: u64,
        length: u64,
        valid_data: u64,
        valid_length: u64,
    ) -> bool {
        let Some(entry) = self.entry(rid) else {
            return false;
        };

        if length == 0 {
            return false;
        }

        let buffer_ok = offset
            .checked_add(length)
            .is_some_and(|end| end <= entry.mem.len);
        let valid_ok = valid_data
            .checked_add(valid_length)
            .is_some_and(|end| end <= length);

        buffer_ok && valid_ok
    }

    /// Final teardown check.
    ///
    /// # Errors
    ///
    /// [`CleanqError::RegionDestroy`] when regions are still registered; the
    /// caller leaked them.
    pub fn destroy(&mut self) -> Result<()> {
        if self.num_regions != 0 {
            trace::warn!(leaked = self.num_regions, "destroying pool with live regions");
            return Err(CleanqError::RegionDestroy);
        }
        Ok(())
    }
}

impl Default for RegionPool {
    fn default() -> Self {
        Self::new()
    }
}
