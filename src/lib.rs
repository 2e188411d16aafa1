//! CleanQ: shared-memory descriptor queues with buffer-ownership transfer.
//!
//! Two endpoints register large memory regions, then exchange fixed-size
//! descriptors naming sub-ranges of those regions; the payload itself is
//! never copied. Enqueueing a descriptor transfers ownership of its range to
//! the peer, and the range comes back on the reverse direction of the queue.
//!
//! # Pieces
//!
//! - [`Queue`](queue::Queue): the endpoint handle with region pool, bounds
//!   checks and callbacks, bound to one of the backends.
//! - [`FfqQueue`](backends::FfqQueue): cache-line slots with per-slot empty
//!   sentinels; the smallest possible shared-memory footprint.
//! - [`IpcQueue`](backends::IpcQueue): explicit sequence numbers and
//!   cache-line-isolated acknowledgements; the correctness reference.
//! - [`LoopbackQueue`](backends::LoopbackQueue): in-process FIFO for local
//!   testing.
//! - [`DebugQueue`](backends::DebugQueue): wraps any backend and catches
//!   ownership-protocol violations (double enqueues, bogus returns,
//!   premature deregistration).
//!
//! # Example
//!
//! ```no_run
//! use cleanq::{BufferDesc, MemRegion};
//! use cleanq::backends::FfqQueue;
//!
//! let mut queue = FfqQueue::create("/my-queue")?;
//!
//! let rid = queue.register(MemRegion { vaddr: 0x7f00_0000, paddr: 0x1_0000, len: 1 << 20 })?;
//! queue.enqueue(BufferDesc::covering(rid, 0, 2048))?;
//!
//! match queue.dequeue() {
//!     Ok(desc) => println!("buffer returned at {:#x}", desc.offset),
//!     Err(cleanq::CleanqError::QueueEmpty) => {}
//!     Err(err) => panic!("queue failed: {err}"),
//! }
//! # Ok::<(), cleanq::CleanqError>(())
//! ```

pub mod backends;
pub mod error;
pub mod queue;
pub mod region;
pub mod shmem;
pub mod types;

pub(crate) mod trace;

pub use error::{CleanqError, Result};
pub use queue::{Backend, CommandCtx, DeregisterCallback, Queue, RegisterCallback};
pub use region::RegionPool;
pub use types::{BufferDesc, MemRegion, RegionId, BUF_FLAG_LAST};

pub use trace::init_tracing;
