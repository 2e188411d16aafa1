//! Loopback backend: a single-process FIFO that reflects descriptors back
//! to the sender. Reference implementation of the queue contract and the
//! usual substrate under the debug wrapper in tests.

use crate::error::{CleanqError, Result};
use crate::queue::{Backend, CommandCtx, Queue};
use crate::types::{BufferDesc, MemRegion, RegionId};

/// Capacity of the loopback ring.
const LOOPBACK_QUEUE_SIZE: usize = 64;

/// In-process descriptor FIFO.
pub struct LoopbackQueue {
    ring: [BufferDesc; LOOPBACK_QUEUE_SIZE],
    head: usize,
    tail: usize,
    num_ele: usize,
}

impl LoopbackQueue {
    /// Creates a loopback queue endpoint.
    pub fn create() -> Queue<Self> {
        Queue::new(Self {
            ring: [BufferDesc::covering(RegionId(0), 0, 0); LOOPBACK_QUEUE_SIZE],
            head: 0,
            tail: 0,
            num_ele: 0,
        })
    }
}

impl Backend for LoopbackQueue {
    fn enqueue(&mut self, desc: &BufferDesc) -> Result<()> {
        if self.num_ele == LOOPBACK_QUEUE_SIZE {
            return Err(CleanqError::QueueFull);
        }

        self.ring[self.head] = *desc;
        self.head = (self.head + 1) % LOOPBACK_QUEUE_SIZE;
        self.num_ele += 1;
        Ok(())
    }

    fn dequeue(&mut self, _ctx: &mut CommandCtx<'_>) -> Result<BufferDesc> {
        if self.num_ele == 0 {
            return Err(CleanqError::QueueEmpty);
        }

        let desc = self.ring[self.tail];
        self.tail = (self.tail + 1) % LOOPBACK_QUEUE_SIZE;
        self.num_ele -= 1;
        Ok(desc)
    }

    fn register(&mut self, _mem: &MemRegion, _rid: RegionId) -> Result<()> {
        // Both "sides" share the endpoint's pool; nothing to announce.
        Ok(())
    }

    fn deregister(&mut self, _rid: RegionId) -> Result<()> {
        Ok(())
    }

    fn notify(&mut self) -> Result<()> {
        Ok(())
    }

    fn control(&mut self, _request: u64, _value: u64) -> Result<u64> {
        Ok(0)
    }
}
