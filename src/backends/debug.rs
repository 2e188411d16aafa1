//! Debug backend: ownership tracking layered over any other backend.
//!
//! The wrapper shadows, per region, the set of byte ranges this endpoint
//! currently owns (is free to enqueue) as a sorted list of disjoint,
//! coalesced half-open intervals. Registering a region makes the whole of it
//! owned; enqueueing a buffer subtracts its range; dequeueing one inserts
//! the range back, merging with its neighbors. Every violation of the
//! ownership protocol that is visible to one endpoint surfaces as an error
//! before it can corrupt the peer:
//!
//! - enqueue of a range not currently owned (double enqueue, out-of-region
//!   enqueue) reports [`CleanqError::InvalidBufferArgs`];
//! - dequeue of a range that overlaps owned memory (the peer returned a
//!   buffer this side never gave away) reports
//!   [`CleanqError::BufferNotInUse`];
//! - deregistration while buffers are outstanding reports
//!   [`CleanqError::RegionDestroy`].
//!
//! Regions can also become known through dequeue alone: the wrapper may sit
//! on the endpoint that never saw the registration command, so such regions
//! are created on first observation and their length grows monotonically as
//! larger offsets appear. A bounded history ring records recent operations
//! for post-mortem inspection.

use std::collections::VecDeque;

use crate::error::{CleanqError, Result};
use crate::queue::{Backend, CommandCtx, Queue};
use crate::trace;
use crate::types::{BufferDesc, MemRegion, RegionId};

/// Number of operations kept for post-mortem inspection.
const HISTORY_SIZE: usize = 128;

/// A half-open owned range `[offset, offset + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub offset: u64,
    pub length: u64,
}

impl Interval {
    #[inline]
    fn end(self) -> u64 {
        self.offset + self.length
    }

    /// Is `[offset, offset + length)` contained in this interval?
    #[inline]
    fn contains(self, offset: u64, length: u64) -> bool {
        offset >= self.offset && offset + length <= self.end()
    }
}

/// The operation kinds recorded in the history ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Enqueue,
    Dequeue,
    Register,
    Deregister,
}

/// One entry of the history ring.
#[derive(Debug, Clone, Copy)]
pub struct OpRecord {
    pub op: OpKind,
    pub rid: RegionId,
    pub offset: u64,
    pub length: u64,
}

/// Shadow ownership state of one region.
struct ShadowRegion {
    rid: RegionId,
    length: u64,
    /// Learned from dequeues rather than a local registration; `length` is
    /// a lower bound that may still grow.
    observed_only: bool,
    /// Sorted, disjoint, coalesced free intervals.
    free: Vec<Interval>,
}

/// Ownership-tracking wrapper around another backend.
pub struct DebugQueue<B: Backend> {
    inner: B,
    regions: Vec<ShadowRegion>,
    history: VecDeque<OpRecord>,
}

impl<B: Backend> DebugQueue<B> {
    /// Wraps an existing queue, carrying its region pool over.
    ///
    /// Regions already registered are seeded as fully owned, so wrapping
    /// after registration behaves like wrapping before.
    pub fn wrap(queue: Queue<B>) -> Queue<DebugQueue<B>> {
        let (pool, inner, callbacks) = queue.into_parts();

        let regions = pool
            .iter()
            .map(|(rid, mem)| ShadowRegion {
                rid,
                length: mem.len,
                observed_only: false,
                free: vec![Interval {
                    offset: 0,
                    length: mem.len,
                }],
            })
            .collect();

        let wrapped = DebugQueue {
            inner,
            regions,
            history: VecDeque::with_capacity(HISTORY_SIZE),
        };
        Queue::from_parts(pool, wrapped, callbacks)
    }

    /// The free intervals currently owned in `rid`, sorted by offset.
    #[must_use]
    pub fn free_intervals(&self, rid: RegionId) -> Option<&[Interval]> {
        self.region_index(rid)
            .map(|i| self.regions[i].free.as_slice())
    }

    /// Recent operations, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &OpRecord> {
        self.history.iter()
    }

    /// Logs the free-interval list of a region.
    pub fn dump_region(&self, rid: RegionId) {
        trace::debug!(
            rid = rid.raw(),
            intervals = ?self.free_intervals(rid),
            "region dump"
        );
    }

    fn region_index(&self, rid: RegionId) -> Option<usize> {
        self.regions.iter().position(|r| r.rid == rid)
    }

    fn record(&mut self, op: OpKind, rid: RegionId, offset: u64, length: u64) {
        if self.history.len() == HISTORY_SIZE {
            self.history.pop_front();
        }
        self.history.push_back(OpRecord {
            op,
            rid,
            offset,
            length,
        });
    }

    /// Removes `[offset, offset + length)` from the free interval at `index`.
    ///
    /// The range is contained in that interval; the four cases are exact
    /// match, trim front, trim back, and interior split.
    fn subtract(free: &mut Vec<Interval>, index: usize, offset: u64, length: u64) {
        let iv = free[index];
        debug_assert!(iv.contains(offset, length));

        if iv.offset == offset && iv.length == length {
            free.remove(index);
        } else if iv.offset == offset {
            free[index].offset += length;
            free[index].length -= length;
        } else if iv.end() == offset + length {
            free[index].length -= length;
        } else {
            let tail = Interval {
                offset: offset + length,
                length: iv.end() - (offset + length),
            };
            free[index].length = offset - iv.offset;
            free.insert(index + 1, tail);
        }
    }

    /// Inserts `[offset, offset + length)` into the sorted free list,
    /// coalescing with adjacent neighbors.
    ///
    /// # Errors
    ///
    /// [`CleanqError::BufferNotInUse`] when the range overlaps an interval
    /// already owned.
    fn insert_merge(free: &mut Vec<Interval>, offset: u64, length: u64) -> Result<()> {
        // A range that wraps the address space cannot have been handed out.
        let end = offset
            .checked_add(length)
            .ok_or(CleanqError::BufferNotInUse)?;

        let pos = free.partition_point(|iv| iv.offset < offset);

        if pos > 0 && free[pos - 1].end() > offset {
            return Err(CleanqError::BufferNotInUse);
        }
        if let Some(succ) = free.get(pos) {
            if end > succ.offset {
                return Err(CleanqError::BufferNotInUse);
            }
        }

        let merges_pred = pos > 0 && free[pos - 1].end() == offset;
        let merges_succ = free.get(pos).is_some_and(|succ| succ.offset == end);

        match (merges_pred, merges_succ) {
            (true, true) => {
                let succ_length = free[pos].length;
                free[pos - 1].length += length + succ_length;
                free.remove(pos);
            }
            (true, false) => free[pos - 1].length += length,
            (false, true) => {
                free[pos].offset = offset;
                free[pos].length += length;
            }
            (false, false) => free.insert(pos, Interval { offset, length }),
        }
        Ok(())
    }
}

impl<B: Backend> Backend for DebugQueue<B> {
    fn enqueue(&mut self, desc: &BufferDesc) -> Result<()> {
        let index = self
            .region_index(desc.rid)
            .ok_or(CleanqError::InvalidRegionId)?;

        let region = &self.regions[index];
        if region.free.is_empty() {
            return Err(CleanqError::BufferAlreadyInUse);
        }

        // The candidate is the last interval starting at or before offset.
        let pos = region.free.partition_point(|iv| iv.offset <= desc.offset);
        let owned = pos
            .checked_sub(1)
            .is_some_and(|i| region.free[i].contains(desc.offset, desc.length));
        if !owned {
            trace::warn!(
                rid = desc.rid.raw(),
                offset = desc.offset,
                length = desc.length,
                "enqueue of a buffer this endpoint does not own"
            );
            return Err(CleanqError::InvalidBufferArgs);
        }

        self.inner.enqueue(desc)?;

        Self::subtract(
            &mut self.regions[index].free,
            pos - 1,
            desc.offset,
            desc.length,
        );
        self.record(OpKind::Enqueue, desc.rid, desc.offset, desc.length);
        Ok(())
    }

    fn dequeue(&mut self, ctx: &mut CommandCtx<'_>) -> Result<BufferDesc> {
        let desc = self.inner.dequeue(ctx)?;

        let observed_end = desc.offset.saturating_add(desc.length);
        let index = match self.region_index(desc.rid) {
            Some(index) => {
                let region = &mut self.regions[index];
                if region.observed_only && observed_end > region.length {
                    region.length = observed_end;
                }
                index
            }
            None => {
                // This layer never saw the registration; the queue below
                // validated the region, so track it from observations.
                trace::debug!(
                    rid = desc.rid.raw(),
                    length = observed_end,
                    "tracking region first seen on dequeue"
                );
                self.regions.push(ShadowRegion {
                    rid: desc.rid,
                    length: observed_end,
                    observed_only: true,
                    free: Vec::new(),
                });
                self.regions.len() - 1
            }
        };

        Self::insert_merge(&mut self.regions[index].free, desc.offset, desc.length).map_err(
            |err| {
                trace::warn!(
                    rid = desc.rid.raw(),
                    offset = desc.offset,
                    length = desc.length,
                    "peer returned a buffer this endpoint still owned"
                );
                err
            },
        )?;

        self.record(OpKind::Dequeue, desc.rid, desc.offset, desc.length);
        Ok(desc)
    }

    fn register(&mut self, mem: &MemRegion, rid: RegionId) -> Result<()> {
        self.inner.register(mem, rid)?;

        self.regions.push(ShadowRegion {
            rid,
            length: mem.len,
            observed_only: false,
            free: vec![Interval {
                offset: 0,
                length: mem.len,
            }],
        });
        self.record(OpKind::Register, rid, 0, mem.len);
        Ok(())
    }

    fn deregister(&mut self, rid: RegionId) -> Result<()> {
        let index = self.region_index(rid).ok_or(CleanqError::InvalidRegionId)?;

        // Deregistration requires the whole region to be owned again.
        let region = &self.regions[index];
        let whole = Interval {
            offset: 0,
            length: region.length,
        };
        if !(region.free.len() == 1 && region.free[0] == whole) {
            trace::warn!(
                rid = rid.raw(),
                outstanding = region.free.len(),
                "deregistration with buffers still in flight"
            );
            self.dump_region(rid);
            return Err(CleanqError::RegionDestroy);
        }

        self.inner.deregister(rid)?;

        let length = self.regions.remove(index).length;
        self.record(OpKind::Deregister, rid, 0, length);
        Ok(())
    }

    fn notify(&mut self) -> Result<()> {
        self.inner.notify()
    }

    fn control(&mut self, request: u64, value: u64) -> Result<u64> {
        self.inner.control(request, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::loopback::LoopbackQueue;

    fn debug_queue(len: u64) -> (Queue<DebugQueue<LoopbackQueue>>, RegionId) {
        let mut q = DebugQueue::wrap(LoopbackQueue::create());
        let rid = q
            .register(MemRegion {
                vaddr: 0x6000_0000,
                paddr: 0x4_0000,
                len,
            })
            .unwrap();
        (q, rid)
    }

    fn intervals(q: &Queue<DebugQueue<LoopbackQueue>>, rid: RegionId) -> Vec<Interval> {
        q.backend().free_intervals(rid).unwrap().to_vec()
    }

    #[test]
    fn register_seeds_whole_region() {
        let (q, rid) = debug_queue(0x4000);
        assert_eq!(
            intervals(&q, rid),
            vec![Interval {
                offset: 0,
                length: 0x4000
            }]
        );
    }

    #[test]
    fn enqueue_trims_front() {
        let (mut q, rid) = debug_queue(0x4000);
        q.enqueue(BufferDesc::covering(rid, 0, 0x1000)).unwrap();
        assert_eq!(
            intervals(&q, rid),
            vec![Interval {
                offset: 0x1000,
                length: 0x3000
            }]
        );
    }

    #[test]
    fn enqueue_trims_back() {
        let (mut q, rid) = debug_queue(0x4000);
        q.enqueue(BufferDesc::covering(rid, 0x3000, 0x1000)).unwrap();
        assert_eq!(
            intervals(&q, rid),
            vec![Interval {
                offset: 0,
                length: 0x3000
            }]
        );
    }

    #[test]
    fn enqueue_splits_interior() {
        let (mut q, rid) = debug_queue(0x4000);
        q.enqueue(BufferDesc::covering(rid, 0x1000, 0x1000)).unwrap();
        assert_eq!(
            intervals(&q, rid),
            vec![
                Interval {
                    offset: 0,
                    length: 0x1000
                },
                Interval {
                    offset: 0x2000,
                    length: 0x2000
                },
            ]
        );
    }

    #[test]
    fn enqueue_exact_interval_removes_it() {
        let (mut q, rid) = debug_queue(0x1000);
        q.enqueue(BufferDesc::covering(rid, 0, 0x1000)).unwrap();
        assert!(intervals(&q, rid).is_empty());
    }

    #[test]
    fn double_enqueue_is_rejected_before_the_backend() {
        let (mut q, rid) = debug_queue(0x4000);
        q.enqueue(BufferDesc::covering(rid, 0, 2048)).unwrap();

        assert_eq!(
            q.enqueue(BufferDesc::covering(rid, 0, 2048)),
            Err(CleanqError::InvalidBufferArgs)
        );

        // Only the first descriptor reached the wrapped backend.
        assert_eq!(q.dequeue().unwrap().offset, 0);
        assert_eq!(q.dequeue(), Err(CleanqError::QueueEmpty));
    }

    #[test]
    fn partially_overlapping_enqueue_is_rejected() {
        let (mut q, rid) = debug_queue(0x4000);
        q.enqueue(BufferDesc::covering(rid, 0x1000, 0x1000)).unwrap();

        // Straddles the hole left by the first enqueue.
        assert_eq!(
            q.enqueue(BufferDesc::covering(rid, 0x800, 0x1000)),
            Err(CleanqError::InvalidBufferArgs)
        );
    }

    #[test]
    fn dequeue_merges_neighbors_back_together() {
        let (mut q, rid) = debug_queue(0x3000);
        for offset in [0u64, 0x1000, 0x2000] {
            q.enqueue(BufferDesc::covering(rid, offset, 0x1000)).unwrap();
        }
        assert!(intervals(&q, rid).is_empty());

        // Returning all three must coalesce back into one interval.
        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(q.dequeue().unwrap().offset);
        }
        assert_eq!(order, vec![0, 0x1000, 0x2000]);
        assert_eq!(
            intervals(&q, rid),
            vec![Interval {
                offset: 0,
                length: 0x3000
            }]
        );
    }

    #[test]
    fn interval_merge_cases() {
        let mut free = vec![
            Interval {
                offset: 0,
                length: 0x1000,
            },
            Interval {
                offset: 0x3000,
                length: 0x1000,
            },
        ];

        // Bridges both neighbors into one interval.
        DebugQueue::<LoopbackQueue>::insert_merge(&mut free, 0x1000, 0x2000).unwrap();
        assert_eq!(
            free,
            vec![Interval {
                offset: 0,
                length: 0x4000
            }]
        );

        // Merges only with the predecessor.
        DebugQueue::<LoopbackQueue>::insert_merge(&mut free, 0x4000, 0x800).unwrap();
        assert_eq!(
            free,
            vec![Interval {
                offset: 0,
                length: 0x4800
            }]
        );

        // Merges only with the successor.
        let mut free = vec![Interval {
            offset: 0x2000,
            length: 0x1000,
        }];
        DebugQueue::<LoopbackQueue>::insert_merge(&mut free, 0x1000, 0x1000).unwrap();
        assert_eq!(
            free,
            vec![Interval {
                offset: 0x1000,
                length: 0x2000
            }]
        );

        // Standalone insert keeps the list sorted.
        DebugQueue::<LoopbackQueue>::insert_merge(&mut free, 0x8000, 0x100).unwrap();
        assert_eq!(free.len(), 2);
        assert_eq!(free[1].offset, 0x8000);
    }

    #[test]
    fn overlapping_return_is_flagged() {
        let mut free = vec![Interval {
            offset: 0x1000,
            length: 0x1000,
        }];
        assert_eq!(
            DebugQueue::<LoopbackQueue>::insert_merge(&mut free, 0x1800, 0x1000),
            Err(CleanqError::BufferNotInUse)
        );
        assert_eq!(
            DebugQueue::<LoopbackQueue>::insert_merge(&mut free, 0x800, 0x1000),
            Err(CleanqError::BufferNotInUse)
        );
        assert_eq!(
            DebugQueue::<LoopbackQueue>::insert_merge(&mut free, 0x1000, 0x1000),
            Err(CleanqError::BufferNotInUse)
        );
        // The list is untouched by rejected inserts.
        assert_eq!(free.len(), 1);
    }

    #[test]
    fn deregister_requires_full_ownership() {
        let (mut q, rid) = debug_queue(0x2000);
        q.enqueue(BufferDesc::covering(rid, 0, 0x1000)).unwrap();

        // A buffer is still in flight, so the shadow refuses. The pool entry
        // is gone regardless: removal precedes the backend announcement.
        assert_eq!(q.deregister(rid), Err(CleanqError::RegionDestroy));
        assert_eq!(q.num_regions(), 0);
        // The shadow keeps tracking the region it refused to drop.
        assert!(q.backend().free_intervals(rid).is_some());
    }

    #[test]
    fn deregister_with_full_ownership_succeeds() {
        let (mut q, rid) = debug_queue(0x2000);
        q.enqueue(BufferDesc::covering(rid, 0, 0x1000)).unwrap();
        q.dequeue().unwrap();

        let mem = q.deregister(rid).unwrap();
        assert_eq!(mem.len, 0x2000);
        assert_eq!(q.num_regions(), 0);
        assert!(q.backend().free_intervals(rid).is_none());
    }

    #[test]
    fn history_records_recent_operations() {
        let (mut q, rid) = debug_queue(0x4000);
        q.enqueue(BufferDesc::covering(rid, 0, 0x1000)).unwrap();
        q.dequeue().unwrap();

        let ops: Vec<OpKind> = q.backend().history().map(|r| r.op).collect();
        assert_eq!(ops, vec![OpKind::Register, OpKind::Enqueue, OpKind::Dequeue]);
    }

    #[test]
    fn wrap_seeds_existing_regions() {
        let mut plain = LoopbackQueue::create();
        let rid = plain
            .register(MemRegion {
                vaddr: 0,
                paddr: 0x9_0000,
                len: 0x1000,
            })
            .unwrap();

        let q = DebugQueue::wrap(plain);
        assert_eq!(
            q.backend().free_intervals(rid).unwrap(),
            &[Interval {
                offset: 0,
                length: 0x1000
            }]
        );
    }
}
