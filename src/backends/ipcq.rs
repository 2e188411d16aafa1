//! IPCQ backend: explicit sequence numbers with cache-line-isolated acks.
//!
//! Where FFQ folds flow control into the message words, IPCQ spends a full
//! 64-byte descriptor per message and a dedicated cache line per direction
//! for the consumer's acknowledged sequence number. The producer can send
//! while `tx_seq - ack < slots`; a descriptor becomes visible when its `seq`
//! field is published. Commands travel in a dedicated field instead of
//! borrowing flag bits, so the flags word is free-form here. This backend is
//! the reference for correctness reasoning; FFQ is the footprint-optimized
//! sibling.
//!
//! Mapping layout (one channel per direction, creator transmits on the
//! first):
//!
//! ```text
//! ┌──────────────────────────────┐ 0
//! │ ack (64-byte cache line)     │   written by the consumer
//! ├──────────────────────────────┤ 64
//! │ 63 descriptors × 64 bytes    │   written by the producer
//! ├──────────────────────────────┤ chan_size
//! │ ack                          │   mirror direction
//! ├──────────────────────────────┤ chan_size + 64
//! │ 63 descriptors               │
//! └──────────────────────────────┘ 2 × chan_size
//! ```

use std::sync::atomic::{fence, AtomicU64, Ordering};

use crate::error::{CleanqError, Result};
use crate::queue::{Backend, CommandCtx, Queue};
use crate::shmem::{SharedCell, SharedMapping, SharedMemorySafe, ShmRole};
use crate::trace;
use crate::types::{BufferDesc, MemRegion, RegionId};

/// Ring size per direction; one slot is given up to the ack cache line, so
/// 63 descriptors are usable.
const IPCQ_DEFAULT_SIZE: usize = 64;

/// Usable descriptor slots per direction.
const IPCQ_SLOTS: u64 = (IPCQ_DEFAULT_SIZE - 1) as u64;

const IPCQ_CMD_NONE: u64 = 0;
const IPCQ_CMD_REGISTER: u64 = 1;
const IPCQ_CMD_DEREGISTER: u64 = 2;

/// Consumer-acknowledged sequence number, alone on its cache line so that
/// ack stores never contend with descriptor traffic.
#[repr(C, align(64))]
struct SeqAck {
    value: AtomicU64,
}

// SAFETY: repr(C, align(64)), a single atomic, no pointers, no Drop.
unsafe impl SharedMemorySafe for SeqAck {}

/// One message descriptor. `seq` is the publish word; the remaining fields
/// are exclusively the producer's until the sequence store makes them
/// visible.
#[repr(C, align(64))]
struct IpcqDesc {
    seq: AtomicU64,
    rid: SharedCell<u32>,
    offset: SharedCell<u64>,
    length: SharedCell<u64>,
    valid_data: SharedCell<u64>,
    valid_length: SharedCell<u64>,
    flags: SharedCell<u64>,
    cmd: SharedCell<u64>,
}

// SAFETY: repr(C, align(64)); an atomic plus protocol-guarded cells of
// plain integers.
unsafe impl SharedMemorySafe for IpcqDesc {}

/// One direction: the consumer's ack line followed by the descriptor ring.
#[repr(C)]
struct IpcqChanShared {
    ack: SeqAck,
    descs: [IpcqDesc; IPCQ_SLOTS as usize],
}

// SAFETY: repr(C) composition of SharedMemorySafe members.
unsafe impl SharedMemorySafe for IpcqChanShared {}

/// The full bidirectional mapping. Channel 0 is the creator's transmit
/// direction; the joiner mirrors.
#[repr(C)]
struct IpcqShared {
    chans: [IpcqChanShared; 2],
}

// SAFETY: repr(C) array of SharedMemorySafe channels.
unsafe impl SharedMemorySafe for IpcqShared {}

/// IPCQ queue backend over a named shared mapping.
pub struct IpcQueue {
    shm: SharedMapping<IpcqShared>,
    /// Index of this endpoint's transmit channel.
    tx_chan: usize,
    tx_seq: u64,
    rx_seq: u64,
}

impl IpcQueue {
    /// Creates or joins the IPCQ pair at `path` and binds it to a queue.
    ///
    /// Sequences start at 1 and the acks are initialized to match, so the
    /// first burst admits exactly the 63 usable slots. The creator must
    /// finish initialization before the joiner attaches.
    ///
    /// # Errors
    ///
    /// [`CleanqError::InitQueue`] when the shared mapping cannot be set up.
    pub fn create(path: &str) -> Result<Queue<Self>> {
        let shm = SharedMapping::<IpcqShared>::attach(path, |ptr| {
            // SAFETY: fresh zero-filled creator memory; all-zero bit
            // patterns are valid for every field.
            let shared = unsafe { &mut *ptr };
            for chan in &mut shared.chans {
                chan.ack.value = AtomicU64::new(1);
            }
        })?;

        let tx_chan = match shm.role() {
            ShmRole::Creator => 0,
            ShmRole::Joiner => 1,
        };

        trace::debug!(path, role = ?shm.role(), "ipcq queue ready");

        Ok(Queue::new(Self {
            shm,
            tx_chan,
            tx_seq: 1,
            rx_seq: 1,
        }))
    }

    fn can_send(&self) -> bool {
        let ack = self.shm.chans[self.tx_chan].ack.value.load(Ordering::Acquire);
        self.tx_seq.wrapping_sub(ack) < IPCQ_SLOTS
    }

    /// Writes one descriptor (data or command) into the transmit ring.
    fn send(&mut self, desc: &BufferDesc, cmd: u64) -> Result<()> {
        if !self.can_send() {
            return Err(CleanqError::QueueFull);
        }

        let chan = &self.shm.chans[self.tx_chan];
        let slot = &chan.descs[(self.tx_seq % IPCQ_SLOTS) as usize];

        // SAFETY: the capacity predicate shows the consumer acknowledged the
        // message that previously occupied this slot, and this endpoint is
        // the only producer on the channel; the fields stay exclusively ours
        // until the sequence store publishes them.
        unsafe {
            slot.rid.write(desc.rid.raw());
            slot.offset.write(desc.offset);
            slot.length.write(desc.length);
            slot.valid_data.write(desc.valid_data);
            slot.valid_length.write(desc.valid_length);
            slot.flags.write(desc.flags);
            slot.cmd.write(cmd);
        }

        fence(Ordering::SeqCst);
        slot.seq.store(self.tx_seq, Ordering::Release);

        self.tx_seq += 1;

        trace::trace!(tx_seq = self.tx_seq, cmd, "ipcq descriptor published");
        Ok(())
    }

    /// Sends a command descriptor, spinning for a slot if the ring is full.
    ///
    /// Commands must not reorder with later data sends from this side, so
    /// this is the one place the backend busy-waits.
    fn send_command(&mut self, desc: &BufferDesc, cmd: u64) -> Result<()> {
        loop {
            match self.send(desc, cmd) {
                Err(CleanqError::QueueFull) => std::hint::spin_loop(),
                other => return other,
            }
        }
    }
}

impl Backend for IpcQueue {
    fn enqueue(&mut self, desc: &BufferDesc) -> Result<()> {
        self.send(desc, IPCQ_CMD_NONE)
    }

    fn dequeue(&mut self, ctx: &mut CommandCtx<'_>) -> Result<BufferDesc> {
        loop {
            let chan = &self.shm.chans[1 - self.tx_chan];
            let slot = &chan.descs[(self.rx_seq % IPCQ_SLOTS) as usize];

            if slot.seq.load(Ordering::Acquire) < self.rx_seq {
                return Err(CleanqError::QueueEmpty);
            }

            // SAFETY: the sequence check acquired the producer's publish
            // store, and the producer will not reuse the slot until this
            // side's ack advances past it.
            let (desc, cmd) = unsafe {
                (
                    BufferDesc {
                        rid: RegionId(slot.rid.read()),
                        offset: slot.offset.read(),
                        length: slot.length.read(),
                        valid_data: slot.valid_data.read(),
                        valid_length: slot.valid_length.read(),
                        flags: slot.flags.read(),
                    },
                    slot.cmd.read(),
                )
            };

            fence(Ordering::SeqCst);
            self.rx_seq += 1;
            chan.ack.value.store(self.rx_seq, Ordering::Release);

            match cmd {
                IPCQ_CMD_NONE => return Ok(desc),
                IPCQ_CMD_REGISTER => {
                    let mem = MemRegion {
                        vaddr: desc.offset,
                        len: desc.length,
                        paddr: desc.valid_data,
                    };
                    if ctx.apply_register(&mem, desc.rid).is_err() {
                        trace::warn!(rid = desc.rid.raw(), "peer registration not applied");
                    }
                }
                IPCQ_CMD_DEREGISTER => {
                    if ctx.apply_deregister(desc.rid).is_err() {
                        trace::warn!(rid = desc.rid.raw(), "peer deregistration not applied");
                    }
                }
                _ => {
                    trace::warn!(rid = desc.rid.raw(), "unknown command skipped");
                }
            }
        }
    }

    fn register(&mut self, mem: &MemRegion, rid: RegionId) -> Result<()> {
        let frame = BufferDesc {
            rid,
            offset: mem.vaddr,
            length: mem.len,
            valid_data: mem.paddr,
            valid_length: 0,
            flags: 0,
        };
        self.send_command(&frame, IPCQ_CMD_REGISTER)
    }

    fn deregister(&mut self, rid: RegionId) -> Result<()> {
        let frame = BufferDesc {
            rid,
            offset: 0,
            length: 0,
            valid_data: 0,
            valid_length: 0,
            flags: 0,
        };
        self.send_command(&frame, IPCQ_CMD_DEREGISTER)
    }

    fn notify(&mut self) -> Result<()> {
        // Signaling is implicit in the shared-memory writes.
        Ok(())
    }

    fn control(&mut self, _request: u64, _value: u64) -> Result<u64> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, offset_of, size_of};

    const CACHE_LINE_SIZE: usize = 64;
    const CHAN_SIZE: usize = IPCQ_DEFAULT_SIZE * CACHE_LINE_SIZE;

    #[test]
    fn descriptor_geometry() {
        assert_eq!(size_of::<IpcqDesc>(), CACHE_LINE_SIZE);
        assert_eq!(align_of::<IpcqDesc>(), CACHE_LINE_SIZE);
        assert_eq!(size_of::<SeqAck>(), CACHE_LINE_SIZE);
    }

    #[test]
    fn channel_layout_is_mirror_image() {
        // Each direction spans exactly one channel: ack line + 63 slots.
        assert_eq!(size_of::<IpcqChanShared>(), CHAN_SIZE);
        assert_eq!(offset_of!(IpcqChanShared, ack), 0);
        assert_eq!(offset_of!(IpcqChanShared, descs), CACHE_LINE_SIZE);

        // The two directions are disjoint halves of the mapping.
        assert_eq!(size_of::<IpcqShared>(), 2 * CHAN_SIZE);
    }
}
