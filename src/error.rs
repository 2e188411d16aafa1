//! The error type shared by every queue operation.

use thiserror::Error;

use crate::shmem::ShmError;

/// Result alias for queue operations.
pub type Result<T> = std::result::Result<T, CleanqError>;

/// Errors reported by queue, pool and backend operations.
///
/// [`QueueFull`](CleanqError::QueueFull) and
/// [`QueueEmpty`](CleanqError::QueueEmpty) are expected outcomes of the
/// non-blocking data path; callers retry. The buffer/region variants signal
/// protocol violations and should be treated as bugs in the peer or caller.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CleanqError {
    /// The queue could not be initialized (shared mapping or allocation failed).
    #[error("could not initialize the queue")]
    InitQueue,
    /// Descriptor out of region bounds or valid range inconsistent.
    #[error("invalid buffer arguments")]
    InvalidBufferArgs,
    /// The buffer is already in flight.
    #[error("buffer is already in use")]
    BufferAlreadyInUse,
    /// The referenced region id is not registered.
    #[error("invalid region id")]
    InvalidRegionId,
    /// The region cannot be removed while buffers are outstanding.
    #[error("could not destroy the region")]
    RegionDestroy,
    /// The region range overlaps an already registered region.
    #[error("invalid region arguments")]
    InvalidRegionArgs,
    /// No descriptor is available to dequeue.
    #[error("queue is empty")]
    QueueEmpty,
    /// No slot is available to enqueue.
    #[error("queue is full")]
    QueueFull,
    /// The peer returned a buffer this side still believed it owned.
    #[error("buffer was not in use")]
    BufferNotInUse,
    /// Memory allocation failed.
    #[error("memory allocation failed")]
    MallocFail,
}

impl From<ShmError> for CleanqError {
    fn from(_: ShmError) -> Self {
        Self::InitQueue
    }
}
