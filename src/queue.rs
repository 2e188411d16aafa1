//! The queue contract binding a region pool to a backend.
//!
//! [`Queue<B>`] is the user-facing handle: it owns the [`RegionPool`], the
//! backend and the region callbacks, and performs the bounds checks on the
//! data path. Backends implement [`Backend`] and see descriptors only after
//! validation; descriptors arriving from the peer are validated again before
//! they are handed upward.

use crate::error::{CleanqError, Result};
use crate::region::RegionPool;
use crate::trace;
use crate::types::{BufferDesc, MemRegion, RegionId};

/// Callback invoked after a peer-originated registration has been applied.
pub type RegisterCallback = Box<dyn FnMut(&MemRegion, RegionId) -> Result<()>>;

/// Callback invoked after a peer-originated deregistration has been applied.
pub type DeregisterCallback = Box<dyn FnMut(RegionId) -> Result<()>>;

#[derive(Default)]
pub(crate) struct Callbacks {
    pub(crate) reg: Option<RegisterCallback>,
    pub(crate) dereg: Option<DeregisterCallback>,
}

/// Pool and callback access lent to a backend while it drains its receive
/// ring, so in-band register/deregister commands can be applied in place.
pub struct CommandCtx<'a> {
    pool: &'a mut RegionPool,
    callbacks: &'a mut Callbacks,
}

impl CommandCtx<'_> {
    /// Mirrors a peer-registered region into the local pool and fires the
    /// registration callback.
    pub fn apply_register(&mut self, mem: &MemRegion, rid: RegionId) -> Result<()> {
        self.pool.add_with_id(mem, rid)?;
        trace::debug!(rid = rid.raw(), len = mem.len, "peer registered region");

        if let Some(cb) = self.callbacks.reg.as_mut() {
            cb(mem, rid)?;
        }
        Ok(())
    }

    /// Removes a peer-deregistered region from the local pool and fires the
    /// deregistration callback.
    pub fn apply_deregister(&mut self, rid: RegionId) -> Result<()> {
        self.pool.remove(rid)?;
        trace::debug!(rid = rid.raw(), "peer deregistered region");

        if let Some(cb) = self.callbacks.dereg.as_mut() {
            cb(rid)?;
        }
        Ok(())
    }
}

/// The operations a queue backend provides.
///
/// All operations are synchronous and non-blocking unless documented
/// otherwise by the backend. Teardown is `Drop`.
pub trait Backend {
    /// Hands a validated descriptor to the transmit side.
    fn enqueue(&mut self, desc: &BufferDesc) -> Result<()>;

    /// Takes the next descriptor from the receive side, applying any pending
    /// in-band commands through `ctx` first.
    fn dequeue(&mut self, ctx: &mut CommandCtx<'_>) -> Result<BufferDesc>;

    /// Announces a locally registered region to the peer.
    fn register(&mut self, mem: &MemRegion, rid: RegionId) -> Result<()>;

    /// Announces a local deregistration to the peer.
    fn deregister(&mut self, rid: RegionId) -> Result<()>;

    /// Signals the peer that new descriptors are available.
    fn notify(&mut self) -> Result<()>;

    /// Backend-specific tuning requests.
    fn control(&mut self, request: u64, value: u64) -> Result<u64>;
}

/// A descriptor queue endpoint.
pub struct Queue<B: Backend> {
    pool: RegionPool,
    backend: B,
    callbacks: Callbacks,
}

impl<B: Backend> Queue<B> {
    /// Binds a backend to a fresh region pool.
    pub(crate) fn new(backend: B) -> Self {
        Self {
            pool: RegionPool::new(),
            backend,
            callbacks: Callbacks::default(),
        }
    }

    pub(crate) fn from_parts(pool: RegionPool, backend: B, callbacks: Callbacks) -> Self {
        Self {
            pool,
            backend,
            callbacks,
        }
    }

    pub(crate) fn into_parts(self) -> (RegionPool, B, Callbacks) {
        (self.pool, self.backend, self.callbacks)
    }

    /// Enqueues a buffer, transferring its ownership to the peer.
    ///
    /// # Errors
    ///
    /// [`CleanqError::InvalidBufferArgs`] when the descriptor fails the
    /// region bounds check; [`CleanqError::QueueFull`] when no slot is free
    /// (retriable, no state has changed).
    pub fn enqueue(&mut self, desc: BufferDesc) -> Result<()> {
        if !self.pool.check_bounds(
            desc.rid,
            desc.offset,
            desc.length,
            desc.valid_data,
            desc.valid_length,
        ) {
            return Err(CleanqError::InvalidBufferArgs);
        }

        self.backend.enqueue(&desc)?;
        trace::trace!(
            rid = desc.rid.raw(),
            offset = desc.offset,
            length = desc.length,
            "enqueued"
        );
        Ok(())
    }

    /// Dequeues the next buffer, taking ownership from the peer.
    ///
    /// Any in-band register/deregister commands ahead of the first data
    /// descriptor are applied transparently (their callbacks run inside this
    /// call).
    ///
    /// # Errors
    ///
    /// [`CleanqError::QueueEmpty`] when nothing is pending;
    /// [`CleanqError::InvalidBufferArgs`] when the peer delivered a
    /// descriptor that fails the bounds check; the descriptor is dropped
    /// but the ring cursor has advanced, so later messages remain readable.
    pub fn dequeue(&mut self) -> Result<BufferDesc> {
        let mut ctx = CommandCtx {
            pool: &mut self.pool,
            callbacks: &mut self.callbacks,
        };
        let desc = self.backend.dequeue(&mut ctx)?;

        if !self.pool.check_bounds(
            desc.rid,
            desc.offset,
            desc.length,
            desc.valid_data,
            desc.valid_length,
        ) {
            trace::warn!(
                rid = desc.rid.raw(),
                offset = desc.offset,
                length = desc.length,
                "peer delivered out-of-bounds descriptor"
            );
            return Err(CleanqError::InvalidBufferArgs);
        }

        trace::trace!(
            rid = desc.rid.raw(),
            offset = desc.offset,
            length = desc.length,
            "dequeued"
        );
        Ok(desc)
    }

    /// Registers a memory region, returning its id.
    ///
    /// The id is immediately valid on this endpoint; the peer applies the
    /// registration during its next dequeue pass.
    pub fn register(&mut self, mem: MemRegion) -> Result<RegionId> {
        let rid = self.pool.add(&mem)?;

        if let Err(err) = self.backend.register(&mem, rid) {
            // Roll back so a refused announcement leaves no local trace.
            let _ = self.pool.remove(rid);
            return Err(err);
        }

        trace::debug!(rid = rid.raw(), len = mem.len, "registered region");
        Ok(rid)
    }

    /// Deregisters a region, returning its memory block.
    ///
    /// The pool entry is removed first, then the backend announces the
    /// deregistration; a backend refusal (a debug wrapper seeing outstanding
    /// buffers, a full command ring) does not restore the entry.
    pub fn deregister(&mut self, rid: RegionId) -> Result<MemRegion> {
        let mem = self.pool.remove(rid)?;
        self.backend.deregister(rid)?;

        trace::debug!(rid = rid.raw(), "deregistered region");
        Ok(mem)
    }

    /// Signals the peer that new descriptors are available.
    ///
    /// Shared-memory backends return immediately: the descriptor writes are
    /// the signal.
    pub fn notify(&mut self) -> Result<()> {
        self.backend.notify()
    }

    /// Sends a backend-specific control request.
    pub fn control(&mut self, request: u64, value: u64) -> Result<u64> {
        self.backend.control(request, value)
    }

    /// Installs the callback fired after a peer registration is applied.
    pub fn set_register_callback(&mut self, cb: RegisterCallback) {
        self.callbacks.reg = Some(cb);
    }

    /// Installs the callback fired after a peer deregistration is applied.
    pub fn set_deregister_callback(&mut self, cb: DeregisterCallback) {
        self.callbacks.dereg = Some(cb);
    }

    /// Number of regions currently registered on this endpoint.
    #[must_use]
    pub fn num_regions(&self) -> usize {
        self.pool.num_regions()
    }

    /// Borrows the backend, e.g. to inspect debug-queue state.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Tears the queue down.
    ///
    /// # Errors
    ///
    /// [`CleanqError::RegionDestroy`] when regions are still registered.
    /// The backend resources are released either way.
    pub fn destroy(mut self) -> Result<()> {
        self.pool.destroy()
    }
}
