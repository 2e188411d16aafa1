//! Queue backends: two shared-memory transports, an in-process reference,
//! and the ownership-tracking debug wrapper.

pub mod debug;
pub mod ffq;
pub mod ipcq;
pub mod loopback;

pub use debug::{DebugQueue, Interval, OpKind, OpRecord};
pub use ffq::FfqQueue;
pub use ipcq::IpcQueue;
pub use loopback::LoopbackQueue;
