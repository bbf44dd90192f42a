//! # Saiga
//!
//! A zero-copy inter-process communication core built on shared memory.
//!
//! Saiga distributes fixed-size memory chunks between processes mapping
//! the same shared region: a publisher acquires a chunk, writes its
//! payload once, and forwards the pointer; subscribers read the same
//! physical pages without any copy. The last holder returns the chunk
//! to the pool.
//!
//! ## Features
//!
//! - **Lock-free chunk pool**: acquire/release complete in a bounded
//!   number of atomic steps; a crashing peer can leak chunks but never
//!   freeze the pool
//! - **Self-describing chunks**: an inline header stores only sizes and
//!   offsets, so chunks stay navigable at different mapping addresses
//! - **Crash-safe creator election**: an OS advisory file lock decides
//!   which process initializes a named region, released by the kernel
//!   even on `SIGKILL`
//! - **Linux-optimized**: memfd-backed regions, fd passing over Unix
//!   sockets
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use saiga::prelude::*;
//!
//! // Elect the creator of the "sensor" region.
//! let _lock = FileLock::create("sensor")?;
//!
//! let region = SharedRegion::create("sensor", 1024 * 1024)?;
//! // ... carve the region with two BumpAllocators and build the pool ...
//! let chunk = pool.acquire().expect("pool not exhausted");
//! pool.release(chunk);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod fatal;
pub mod file_lock;
pub mod mempool;
pub mod region;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::fatal::{set_fatal_handler, FatalError};
    pub use crate::file_lock::{FileLock, FileLockError};
    pub use crate::mempool::{BumpAllocator, ChunkHeader, MemPool, PoolInfo, PortId};
    pub use crate::region::SharedRegion;
}

pub use error::{Error, Result};
