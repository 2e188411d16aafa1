//! FFQ backend: cache-line message slots with per-slot empty sentinels.
//!
//! A one-directional channel is an array of cache-line-sized slots. The
//! first word of a slot doubles as the flow-control state: the all-ones
//! sentinel marks the slot empty, anything else is the first payload word of
//! a pending message. There are no head/tail indices in shared memory; each
//! side keeps its own cursor private and synchronizes purely through slot
//! contents. The price is a reserved first-word value and commands
//! multiplexed into the flags word; the payoff is a six-word message with no
//! side-band counters.
//!
//! The bidirectional queue lays two channels into one shared mapping. The
//! creator transmits on the first ring and receives on the second; the
//! joiner mirrors, so "creator TX" and "joiner RX" are the same memory.

use std::sync::atomic::{fence, AtomicU64, Ordering};

use crate::error::{CleanqError, Result};
use crate::queue::{Backend, CommandCtx, Queue};
use crate::shmem::{SharedCell, SharedMapping, SharedMemorySafe, ShmRole};
use crate::trace;
use crate::types::{BufferDesc, MemRegion, RegionId};

/// An empty slot carries this value in its first word. Region ids are
/// 32-bit, so a data frame's first word can never collide with it.
const FFQ_SLOT_EMPTY: u64 = u64::MAX;

/// Slots per direction; must be a power of two.
const FFQ_DEFAULT_SIZE: usize = 64;

/// 64-bit words per slot (one cache line).
const FFQ_MSG_WORDS: usize = 8;

/// In-band command values carried in the flags word.
const FFQ_CMD_REGISTER: u64 = 1;
const FFQ_CMD_DEREGISTER: u64 = 2;

/// Low flag bits reserved for command framing; data descriptors must keep
/// them clear.
const FFQ_CMD_MASK: u64 = 0b11;

/// One message slot. Word 0 is the publish word; words 1..=5 carry the rest
/// of the descriptor.
#[repr(C, align(64))]
pub(crate) struct FfqSlot {
    header: AtomicU64,
    body: [SharedCell<u64>; FFQ_MSG_WORDS - 1],
}

impl FfqSlot {
    #[cfg(test)]
    fn empty() -> Self {
        Self {
            header: AtomicU64::new(FFQ_SLOT_EMPTY),
            body: std::array::from_fn(|_| SharedCell::new(0)),
        }
    }
}

// SAFETY: repr(C, align(64)); an atomic plus protocol-guarded cells of plain
// words, no pointers, nothing to drop.
unsafe impl SharedMemorySafe for FfqSlot {}

/// The full bidirectional mapping: two rings back to back.
#[repr(C)]
struct FfqShared {
    slots: [FfqSlot; 2 * FFQ_DEFAULT_SIZE],
}

// SAFETY: repr(C) array of SharedMemorySafe slots.
unsafe impl SharedMemorySafe for FfqShared {}

/// One direction of the queue: a private cursor over a slot ring.
///
/// Strictly single-producer/single-consumer; the cursor lives outside the
/// shared mapping and is never observed by the peer.
pub(crate) struct FfqChannel {
    pos: usize,
}

impl FfqChannel {
    pub(crate) const fn new() -> Self {
        Self { pos: 0 }
    }

    /// Sends a six-word message. Returns `false` when the ring is full.
    ///
    /// `words[0]` must never equal the empty sentinel.
    pub(crate) fn send(&mut self, slots: &[FfqSlot], words: &[u64; 6]) -> bool {
        debug_assert!(slots.len().is_power_of_two());
        debug_assert_ne!(words[0], FFQ_SLOT_EMPTY);

        let slot = &slots[self.pos];
        if slot.header.load(Ordering::Acquire) != FFQ_SLOT_EMPTY {
            return false;
        }

        // SAFETY: the slot is empty, so the consumer is not reading it, and
        // this channel is the only producer; the body cells are exclusively
        // ours until the header store publishes them.
        unsafe {
            for (cell, word) in slot.body.iter().zip(&words[1..]) {
                cell.write(*word);
            }
        }

        fence(Ordering::SeqCst);
        slot.header.store(words[0], Ordering::Release);

        self.pos = (self.pos + 1) & (slots.len() - 1);
        true
    }

    /// Receives the next six-word message, releasing the slot back to the
    /// producer. Returns `None` when the ring is empty.
    pub(crate) fn recv(&mut self, slots: &[FfqSlot]) -> Option<[u64; 6]> {
        debug_assert!(slots.len().is_power_of_two());

        let slot = &slots[self.pos];
        let first = slot.header.load(Ordering::Acquire);
        if first == FFQ_SLOT_EMPTY {
            return None;
        }

        let mut words = [first, 0, 0, 0, 0, 0];
        // SAFETY: the header is published, so the producer finished writing
        // the body and will not touch it again until the slot is emptied;
        // this channel is the only consumer.
        unsafe {
            for (word, cell) in words[1..].iter_mut().zip(&slot.body) {
                *word = cell.read();
            }
        }

        fence(Ordering::SeqCst);
        slot.header.store(FFQ_SLOT_EMPTY, Ordering::Release);

        self.pos = (self.pos + 1) & (slots.len() - 1);
        Some(words)
    }
}

/// FFQ queue backend over a named shared mapping.
pub struct FfqQueue {
    shm: SharedMapping<FfqShared>,
    tx: FfqChannel,
    rx: FfqChannel,
    tx_base: usize,
}

impl FfqQueue {
    /// Creates or joins the FFQ pair at `path` and binds it to a queue.
    ///
    /// Whoever wins the exclusive create becomes the creator: it initializes
    /// every slot to the empty sentinel before the mapping is usable and it
    /// unlinks the name on teardown. The creator must finish before the
    /// joiner attaches.
    ///
    /// # Errors
    ///
    /// [`CleanqError::InitQueue`] when the shared mapping cannot be set up.
    pub fn create(path: &str) -> Result<Queue<Self>> {
        let shm = SharedMapping::<FfqShared>::attach(path, |ptr| {
            // SAFETY: fresh zero-filled creator memory; all-zero bit
            // patterns are valid for every field.
            let shared = unsafe { &mut *ptr };
            for slot in &mut shared.slots {
                slot.header = AtomicU64::new(FFQ_SLOT_EMPTY);
            }
        })?;

        let tx_base = match shm.role() {
            ShmRole::Creator => 0,
            ShmRole::Joiner => FFQ_DEFAULT_SIZE,
        };

        trace::debug!(path, role = ?shm.role(), "ffq queue ready");

        Ok(Queue::new(Self {
            shm,
            tx: FfqChannel::new(),
            rx: FfqChannel::new(),
            tx_base,
        }))
    }

    fn send(&mut self, words: &[u64; 6]) -> Result<()> {
        let slots = &self.shm.slots[self.tx_base..self.tx_base + FFQ_DEFAULT_SIZE];
        if self.tx.send(slots, words) {
            Ok(())
        } else {
            Err(CleanqError::QueueFull)
        }
    }
}

impl Backend for FfqQueue {
    fn enqueue(&mut self, desc: &BufferDesc) -> Result<()> {
        // The low flag bits are the command framing on this backend.
        if desc.flags & FFQ_CMD_MASK != 0 {
            return Err(CleanqError::InvalidBufferArgs);
        }

        self.send(&[
            u64::from(desc.rid.raw()),
            desc.offset,
            desc.length,
            desc.valid_data,
            desc.valid_length,
            desc.flags,
        ])
    }

    fn dequeue(&mut self, ctx: &mut CommandCtx<'_>) -> Result<BufferDesc> {
        loop {
            let rx_base = FFQ_DEFAULT_SIZE - self.tx_base;
            let slots = &self.shm.slots[rx_base..rx_base + FFQ_DEFAULT_SIZE];
            let Some(words) = self.rx.recv(slots) else {
                return Err(CleanqError::QueueEmpty);
            };

            let rid = RegionId(words[0] as u32);
            match words[5] {
                FFQ_CMD_REGISTER => {
                    let mem = MemRegion {
                        vaddr: words[1],
                        len: words[2],
                        paddr: words[3],
                    };
                    if ctx.apply_register(&mem, rid).is_err() {
                        trace::warn!(rid = rid.raw(), "peer registration not applied");
                    }
                }
                FFQ_CMD_DEREGISTER => {
                    if ctx.apply_deregister(rid).is_err() {
                        trace::warn!(rid = rid.raw(), "peer deregistration not applied");
                    }
                }
                flags => {
                    return Ok(BufferDesc {
                        rid,
                        offset: words[1],
                        length: words[2],
                        valid_data: words[3],
                        valid_length: words[4],
                        flags,
                    });
                }
            }
        }
    }

    fn register(&mut self, mem: &MemRegion, rid: RegionId) -> Result<()> {
        // The registration frame carries the region parameters in the
        // descriptor words: (offset, length, valid_data) = (vaddr, len, paddr).
        self.send(&[
            u64::from(rid.raw()),
            mem.vaddr,
            mem.len,
            mem.paddr,
            0,
            FFQ_CMD_REGISTER,
        ])
    }

    fn deregister(&mut self, rid: RegionId) -> Result<()> {
        self.send(&[u64::from(rid.raw()), 0, 0, 0, 0, FFQ_CMD_DEREGISTER])
    }

    fn notify(&mut self) -> Result<()> {
        // Signaling is implicit in the shared-memory writes.
        Ok(())
    }

    fn control(&mut self, _request: u64, _value: u64) -> Result<u64> {
        Ok(0)
    }
}
