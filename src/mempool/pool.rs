//! Fixed-chunk-size memory pool shared across processes.

use crate::error::{Error, Result};
use crate::fatal::{fatal, FatalError};
use crate::mempool::{BumpAllocator, IndexQueue};
use std::fmt;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

/// Alignment of every chunk handed out by a pool, in bytes.
pub const CHUNK_ALIGNMENT: u64 = 32;

/// Pool state at the start of the management area.
///
/// Written once by the creator; the counters are shared statistics
/// updated by every mapping process.
#[repr(C)]
struct PoolHeader {
    chunk_size: u64,
    chunk_count: u32,
    used_chunks: AtomicU32,
    min_free: AtomicU32,
    _pad: u32,
}

const _: () = assert!(mem::size_of::<PoolHeader>() % 8 == 0);

/// Read-only snapshot of a pool's usage statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolInfo {
    /// Chunks currently held by callers.
    pub used_chunks: u32,
    /// Minimum number of free chunks ever observed since construction.
    pub min_free: u32,
    /// Total number of chunks.
    pub chunk_count: u32,
    /// Size of each chunk in bytes.
    pub chunk_size: u64,
}

impl fmt::Display for PoolInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "used: {}/{}, min free: {}, chunk size: {}",
            self.used_chunks, self.chunk_count, self.min_free, self.chunk_size
        )
    }
}

/// A bounded pool of fixed-size, aligned chunks in shared memory.
///
/// The pool owns nothing: chunk memory and management memory are carved
/// out of externally owned regions at construction and reclaimed
/// wholesale when the enclosing region goes away. `MemPool` itself is a
/// process-local handle; all shared state (free indices, usage
/// counters) lives in the management area, so any process mapping the
/// same regions can [`attach`](MemPool::attach) and operate on the same
/// pool.
///
/// [`acquire`](MemPool::acquire) and [`release`](MemPool::release) are
/// lock-free and never block. A crashing peer can leak the chunks it
/// held, but it cannot freeze the pool.
pub struct MemPool {
    /// Shared state in the management area.
    header: NonNull<PoolHeader>,
    /// Free chunk indices, also in the management area.
    free_indices: IndexQueue,
    /// Base of the chunk area, local to this mapping.
    raw_memory: NonNull<u8>,
    chunk_size: u64,
    chunk_count: u32,
}

impl MemPool {
    /// Bytes of management memory a pool of `chunk_count` chunks needs.
    pub fn required_management_size(chunk_count: u32) -> usize {
        mem::size_of::<PoolHeader>() + IndexQueue::required_index_memory_size(chunk_count)
    }

    /// Construct a pool, carving its memory out of the given allocators.
    ///
    /// Allocates `chunk_size * chunk_count` bytes from `chunk_memory`
    /// and [`required_management_size`](Self::required_management_size)
    /// bytes from `management`, then pre-loads the free queue with all
    /// indices. The allocators must carve regions that are
    /// zero-initialized (freshly mapped memfd memory is), so the first
    /// acquisition of every chunk observes zeroed memory.
    ///
    /// `chunk_size` must be a multiple of [`CHUNK_ALIGNMENT`] and
    /// `chunk_size * chunk_count` must fit into 64 bits; both are fatal
    /// violations otherwise.
    pub fn new(
        chunk_size: u64,
        chunk_count: u32,
        management: &mut BumpAllocator,
        chunk_memory: &mut BumpAllocator,
    ) -> Result<Self> {
        if chunk_size % CHUNK_ALIGNMENT != 0 {
            fatal(FatalError::UnalignedChunkSize {
                chunk_size,
                alignment: CHUNK_ALIGNMENT,
            });
        }
        let Some(total_chunk_bytes) = chunk_size.checked_mul(chunk_count as u64) else {
            fatal(FatalError::ChunkMemoryOverflow {
                chunk_size,
                chunk_count,
            });
        };
        if chunk_count == 0 {
            return Err(Error::AllocationFailed("chunk count must be at least 1".into()));
        }
        if chunk_count > u32::MAX - 2 {
            return Err(Error::AllocationFailed(
                "chunk count exceeds the supported maximum".into(),
            ));
        }

        let raw_memory =
            chunk_memory.allocate(total_chunk_bytes as usize, CHUNK_ALIGNMENT as usize)?;
        let management_memory = management.allocate(
            Self::required_management_size(chunk_count),
            CHUNK_ALIGNMENT as usize,
        )?;

        let header = management_memory.cast::<PoolHeader>();
        unsafe {
            header.as_ptr().write(PoolHeader {
                chunk_size,
                chunk_count,
                used_chunks: AtomicU32::new(0),
                min_free: AtomicU32::new(chunk_count),
                _pad: 0,
            });
        }

        let queue_memory = unsafe {
            NonNull::new_unchecked(
                management_memory
                    .as_ptr()
                    .add(mem::size_of::<PoolHeader>()),
            )
        };
        let free_indices = unsafe { IndexQueue::init(queue_memory, chunk_count) };

        Ok(Self {
            header,
            free_indices,
            raw_memory,
            chunk_size,
            chunk_count,
        })
    }

    /// Attach to a pool another process (or this one) already constructed.
    ///
    /// `management` and `chunk_memory` must be the same sub-regions the
    /// creator carved out, mapped into this process at whatever base
    /// address the mapping produced.
    ///
    /// # Safety
    ///
    /// `management` must point at a management area initialized by
    /// [`MemPool::new`], `chunk_memory` at the matching chunk area, and
    /// both mappings must outlive the returned handle.
    pub unsafe fn attach(management: NonNull<u8>, chunk_memory: NonNull<u8>) -> Self {
        let header = management.cast::<PoolHeader>();
        let (chunk_size, chunk_count) = unsafe {
            let header = header.as_ref();
            (header.chunk_size, header.chunk_count)
        };
        let queue_memory = unsafe {
            NonNull::new_unchecked(management.as_ptr().add(mem::size_of::<PoolHeader>()))
        };
        let free_indices = unsafe { IndexQueue::attach(queue_memory) };

        Self {
            header,
            free_indices,
            raw_memory: chunk_memory,
            chunk_size,
            chunk_count,
        }
    }

    fn header(&self) -> &PoolHeader {
        unsafe { self.header.as_ref() }
    }

    /// Lower `min_free` to the currently observed free count.
    fn adjust_min_free(&self) {
        let used = self.header().used_chunks.load(Ordering::Relaxed);
        // A releasing peer pushes its index before decrementing the
        // counter, so `used` can transiently exceed the chunk count;
        // the wrapped difference is huge and loses the min on purpose.
        let free = self.chunk_count.wrapping_sub(used);
        self.header().min_free.fetch_min(free, Ordering::Relaxed);
    }

    /// Hand out a free chunk, or `None` if the pool is exhausted.
    ///
    /// The returned pointer is the chunk base, aligned to
    /// [`CHUNK_ALIGNMENT`]. Exhaustion is not an error: the caller is
    /// expected to back off or drop.
    pub fn acquire(&self) -> Option<NonNull<u8>> {
        let Some(index) = self.free_indices.pop() else {
            tracing::warn!(
                chunk_size = self.chunk_size,
                chunk_count = self.chunk_count,
                used_chunks = self.header().used_chunks.load(Ordering::Relaxed),
                "memory pool has no more chunks left"
            );
            return None;
        };

        self.header().used_chunks.fetch_add(1, Ordering::Relaxed);
        self.adjust_min_free();

        Some(self.index_to_pointer(index))
    }

    /// Return a chunk obtained from [`acquire`](MemPool::acquire).
    ///
    /// Fatal if `chunk` is not a chunk base of this pool (out of range
    /// or misaligned) or if the chunk is already free — both indicate
    /// caller corruption that must not spread through the shared region.
    pub fn release(&self, chunk: NonNull<u8>) {
        let base = self.raw_memory.as_ptr() as usize;
        let address = chunk.as_ptr() as usize;
        let last_chunk = base + (self.chunk_count as usize - 1) * self.chunk_size as usize;
        if address < base || address > last_chunk {
            fatal(FatalError::ReleaseOutOfRange { pointer: address });
        }

        let index = self.pointer_to_index(chunk);
        if !self.free_indices.push(index) {
            fatal(FatalError::PossibleDoubleFree { index });
        }
        self.header().used_chunks.fetch_sub(1, Ordering::Relaxed);
    }

    /// Chunk index of a chunk base pointer.
    ///
    /// Fatal if the pointer does not sit on a chunk boundary.
    pub fn pointer_to_index(&self, chunk: NonNull<u8>) -> u32 {
        let offset = chunk.as_ptr() as usize - self.raw_memory.as_ptr() as usize;
        if offset as u64 % self.chunk_size != 0 {
            fatal(FatalError::ReleaseUnaligned {
                pointer: chunk.as_ptr() as usize,
            });
        }
        (offset as u64 / self.chunk_size) as u32
    }

    /// Chunk base pointer of a chunk index.
    pub fn index_to_pointer(&self, index: u32) -> NonNull<u8> {
        debug_assert!(index < self.chunk_count);
        let offset = index as u64 * self.chunk_size;
        unsafe { NonNull::new_unchecked(self.raw_memory.as_ptr().add(offset as usize)) }
    }

    /// Size of each chunk in bytes.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Total number of chunks.
    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    /// Chunks currently held by callers.
    pub fn used_chunks(&self) -> u32 {
        self.header().used_chunks.load(Ordering::Relaxed)
    }

    /// Minimum number of free chunks ever observed.
    pub fn min_free(&self) -> u32 {
        self.header().min_free.load(Ordering::Relaxed)
    }

    /// Snapshot of the usage statistics.
    pub fn info(&self) -> PoolInfo {
        PoolInfo {
            used_chunks: self.used_chunks(),
            min_free: self.min_free(),
            chunk_count: self.chunk_count,
            chunk_size: self.chunk_size,
        }
    }
}

// SAFETY: the handle's shared state is confined to atomics in the
// management area; the chunk base pointer is immutable after
// construction.
unsafe impl Send for MemPool {}
unsafe impl Sync for MemPool {}
