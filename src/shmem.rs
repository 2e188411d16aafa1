//! Named shared mapping over POSIX shared memory.
//!
//! A [`SharedMapping<T>`] maps a typed, fixed-size segment (`shm_open` +
//! `mmap`) into the address space of both queue endpoints. The endpoint whose
//! exclusive create succeeds becomes the [`Creator`](ShmRole::Creator): it
//! sizes the object, runs the one-time initializer, and unlinks the name on
//! drop. The other endpoint joins the existing object and only unmaps.
//!
//! # Contract
//!
//! The creator must finish initialization before the peer attaches; the
//! joiner's size check rejects an object the creator has not yet truncated,
//! but a joiner racing the initializer itself is not detected.
//!
//! # Safety model
//!
//! `unsafe` is confined to this module's POSIX calls and pointer bookkeeping.
//! The [`SharedMemorySafe`] bound on `T` pushes layout and content
//! requirements to the type level: stable `#[repr(C)]` layout, no pointers,
//! atomics (or protocol-guarded cells) for all shared mutable state.

use rustix::fs::{fstat, ftruncate, Mode};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::{io, shm};
use std::cell::UnsafeCell;
use std::mem::size_of;
use std::ops::Deref;
use std::ptr::{null_mut, NonNull};
use std::sync::atomic::*;
use thiserror::Error;

/// Result alias for shared mapping operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Contextual errors produced by [`SharedMapping`].
#[derive(Debug, Error)]
pub enum ShmError {
    /// The provided POSIX shared memory name is invalid.
    #[error("invalid shared memory path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    /// `mmap`, `shm_open`, `ftruncate`, etc. failed with an errno.
    #[error("{op} failed for `{path}`: {source}")]
    PosixError {
        op: &'static str,
        path: String,
        source: io::Errno,
    },
    /// The existing shared memory object has a different size than `T`.
    #[error("shared memory `{path}` size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: usize,
        actual: i64,
    },
}

impl ShmError {
    fn posix(op: &'static str, path: &str, err: io::Errno) -> Self {
        Self::PosixError {
            op,
            path: path.to_string(),
            source: err,
        }
    }
}

/// Types safe to place in POSIX shared memory across processes.
///
/// # Safety
///
/// Implementers must guarantee all of the following:
///
/// - **Layout**: `#[repr(C)]` or `#[repr(transparent)]`; the peers may be
///   compiled separately and the default Rust layout is unstable.
/// - **Pointers**: no heap or stack pointers, references, `Vec`, `Box`, etc.;
///   virtual addresses do not transfer across process boundaries.
/// - **Fields**: every field satisfies these requirements recursively.
/// - **Drop**: the type stays sound if `Drop` never runs (a crashed peer
///   bypasses destructors).
/// - **Concurrency**: all shared mutable state is accessed through atomics or
///   through cells whose exclusivity a cross-process protocol guarantees.
pub unsafe trait SharedMemorySafe: Send + Sync {}

macro_rules! impl_shared_memory_safe {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl SharedMemorySafe for $t {}
        )*
    };
}

impl_shared_memory_safe! {
    i8, i16, i32, i64, i128, isize,
    u8, u16, u32, u64, u128, usize,
    f32, f64,
    bool,
    AtomicBool,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
}

unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for [T; N] {}

/// Interior-mutable cell for ring-slot payload words.
///
/// The queue protocols guarantee that at any moment a slot is either being
/// written by the producer or read by the consumer, never both; the
/// release/acquire pair on the slot's publish word is the synchronization
/// edge between the two.
#[repr(transparent)]
pub struct SharedCell<T>(UnsafeCell<T>);

impl<T> SharedCell<T> {
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// Reads the cell.
    ///
    /// # Safety
    ///
    /// The caller must hold the protocol-side exclusivity for this cell: the
    /// publish word of the containing slot has been acquired and the other
    /// endpoint cannot be writing it.
    #[inline]
    pub unsafe fn read(&self) -> T
    where
        T: Copy,
    {
        unsafe { *self.0.get() }
    }

    /// Writes the cell.
    ///
    /// # Safety
    ///
    /// Same exclusivity requirement as [`read`](Self::read), for writes.
    #[inline]
    pub unsafe fn write(&self, value: T) {
        unsafe { *self.0.get() = value }
    }
}

// SAFETY: Exclusive access to a SharedCell is mediated by the ring protocol
// (release store on the publish word after writing, acquire load before
// reading), never by Rust references from two sides at once.
unsafe impl<T: Send> Sync for SharedCell<T> {}
unsafe impl<T: Send> Send for SharedCell<T> {}

// SAFETY: repr(transparent) over UnsafeCell<T>; layout and content
// requirements are exactly those of T.
unsafe impl<T: SharedMemorySafe> SharedMemorySafe for SharedCell<T> {}

/// Which side of the mapping this endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmRole {
    /// This endpoint created the object; it initialized the memory and
    /// unlinks the name on drop.
    Creator,
    /// This endpoint attached to an existing object; it only unmaps.
    Joiner,
}

const POSIX_NAME_MAX: usize = 255;

/// Validates that a path meets POSIX shm_open requirements.
fn validate_shm_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path must start with '/'",
        });
    }

    if path[1..].contains('/') {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path must not contain additional '/' characters",
        });
    }

    if path.len() > POSIX_NAME_MAX {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path length must be <= 255 bytes",
        });
    }

    Ok(())
}

/// A typed mapping of a named POSIX shared memory object.
///
/// Dereferences to `T`. Cleanup is automatic: `munmap` on drop, plus
/// `shm_unlink` when this endpoint is the creator. The kernel frees the
/// memory once the name is unlinked and every endpoint has unmapped.
pub struct SharedMapping<T: SharedMemorySafe> {
    ptr: NonNull<T>,
    path: String,
    role: ShmRole,
}

// SAFETY: the pointer targets shared memory, not thread-local data, and
// T: SharedMemorySafe already requires Send + Sync.
unsafe impl<T: SharedMemorySafe> Send for SharedMapping<T> {}
unsafe impl<T: SharedMemorySafe> Sync for SharedMapping<T> {}

impl<T: SharedMemorySafe> SharedMapping<T> {
    /// Creates or joins the named object and maps it.
    ///
    /// Tries an exclusive create first. On success this endpoint is the
    /// [`Creator`](ShmRole::Creator): the object is sized to `T` and `init`
    /// runs exactly once on the fresh (zero-filled) memory. If the object
    /// already exists this endpoint joins it: the size is verified against
    /// `T` and `init` is not run.
    ///
    /// # Errors
    ///
    /// Fails on invalid paths, on any failing POSIX call, and on joining an
    /// object whose size does not match `size_of::<T>()`.
    pub fn attach(path: &str, init: impl FnOnce(*mut T)) -> Result<Self> {
        validate_shm_path(path)?;

        match shm::open(
            path,
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        ) {
            Ok(fd) => {
                if let Err(err) = ftruncate(&fd, size_of::<T>() as u64) {
                    drop(fd);
                    let _ = shm::unlink(path);
                    return Err(ShmError::posix("ftruncate", path, err));
                }

                let ptr = match Self::map(&fd) {
                    Ok(ptr) => ptr,
                    Err(err) => {
                        drop(fd);
                        let _ = shm::unlink(path);
                        return Err(ShmError::posix("mmap", path, err));
                    }
                };

                let mapping = Self {
                    ptr,
                    path: path.to_string(),
                    role: ShmRole::Creator,
                };

                // Runs on zero-filled memory; a panic unwinds through this
                // mapping's Drop, which unmaps and unlinks.
                init(mapping.ptr.as_ptr());

                Ok(mapping)
            }
            Err(err) if err == io::Errno::EXIST => {
                let fd = shm::open(path, shm::OFlags::RDWR, Mode::empty())
                    .map_err(|err| ShmError::posix("shm_open", path, err))?;

                let stat = fstat(&fd).map_err(|err| ShmError::posix("fstat", path, err))?;
                let expected = size_of::<T>() as i64;
                if stat.st_size != expected {
                    return Err(ShmError::SizeMismatch {
                        path: path.to_string(),
                        expected: size_of::<T>(),
                        actual: stat.st_size,
                    });
                }

                let ptr = Self::map(&fd).map_err(|err| ShmError::posix("mmap", path, err))?;

                Ok(Self {
                    ptr,
                    path: path.to_string(),
                    role: ShmRole::Joiner,
                })
            }
            Err(err) => Err(ShmError::posix("shm_open", path, err)),
        }
    }

    fn map(fd: &impl rustix::fd::AsFd) -> std::result::Result<NonNull<T>, io::Errno> {
        // SAFETY: fresh mapping from the kernel that aliases no existing Rust
        // object; page alignment satisfies any T; READ|WRITE for interior
        // mutability through atomics and SharedCells.
        let ptr = unsafe {
            mmap(
                null_mut(),
                size_of::<T>(),
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                0,
            )?
        };

        // SAFETY: mmap never returns null on success.
        Ok(unsafe { NonNull::new_unchecked(ptr.cast::<T>()) })
    }

    /// Which side of the mapping this endpoint is.
    #[must_use]
    pub fn role(&self) -> ShmRole {
        self.role
    }
}

impl<T: SharedMemorySafe> Deref for SharedMapping<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: mapped at construction, stays mapped until Drop;
        // T: SharedMemorySafe covers concurrent cross-process access.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: SharedMemorySafe> Drop for SharedMapping<T> {
    fn drop(&mut self) {
        // SAFETY: ptr/size are exactly what mmap returned for this mapping.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), size_of::<T>());
        }

        if self.role == ShmRole::Creator {
            let _ = shm::unlink(&self.path);
        }
    }
}
