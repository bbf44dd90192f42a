//! Shared-memory chunk distribution core.
//!
//! This module hands fixed-size memory chunks to publishers and lets
//! them travel zero-copy to subscribers in other processes.
//!
//! # Architecture
//!
//! - [`BumpAllocator`]: carves a mapped region into aligned sub-regions
//!   at startup
//! - [`IndexQueue`]: lock-free queue of free chunk indices, shared by
//!   every process mapping the region
//! - [`MemPool`]: the pool itself, [`acquire`](MemPool::acquire) /
//!   [`release`](MemPool::release) plus usage statistics
//! - [`ChunkHeader`]: self-describing prefix making each chunk
//!   navigable across process boundaries
//!
//! # Example
//!
//! ```rust,ignore
//! use saiga::mempool::{BumpAllocator, MemPool};
//! use saiga::region::SharedRegion;
//!
//! let region = SharedRegion::create("chunks", 1024 * 1024)?;
//! // split the region: management in front, chunks behind
//! let mut management = unsafe { BumpAllocator::new(region.base_ptr(), 64 * 1024) };
//! let chunk_base = unsafe { region.base_ptr().as_ptr().add(64 * 1024) };
//! let mut chunks = unsafe {
//!     BumpAllocator::new(NonNull::new(chunk_base).unwrap(), region.size() - 64 * 1024)
//! };
//!
//! let pool = MemPool::new(4096, 128, &mut management, &mut chunks)?;
//! let chunk = pool.acquire().expect("pool not exhausted");
//! // ... write header and payload, forward the pointer ...
//! pool.release(chunk);
//! ```

mod bump;
mod chunk_header;
mod index_queue;
mod pool;

pub use bump::BumpAllocator;
pub use chunk_header::{
    ChunkHeader, PayloadOffset, PortId, CHUNK_DEFAULT_PAYLOAD_ALIGNMENT, CHUNK_HEADER_VERSION,
    CHUNK_NO_USER_HEADER_ALIGNMENT, CHUNK_NO_USER_HEADER_SIZE,
};
pub use index_queue::IndexQueue;
pub use pool::{MemPool, PoolInfo, CHUNK_ALIGNMENT};
