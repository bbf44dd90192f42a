//! Shared memory region backed by Linux memfd.
//!
//! A [`SharedRegion`] is the externally owned memory that the chunk
//! distribution core carves into a management area and a chunk area.
//! The creator builds it via `memfd_create` and hands the file
//! descriptor to peers over a Unix socket; every peer maps the same
//! physical pages, usually at a different base address, which is why
//! nothing stored inside a region may be an absolute pointer.

use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr::NonNull;

/// A mapped, memfd-backed shared memory region.
///
/// The kernel zero-initializes the backing pages, so a freshly created
/// region hands out all-zero memory. The mapping never moves; its base
/// pointer stays valid until drop.
///
/// # Example
///
/// ```rust,ignore
/// use saiga::region::SharedRegion;
///
/// // Creator side: a 1MB region for one pool.
/// let region = SharedRegion::create("chunk-area", 1024 * 1024)?;
///
/// // Hand region.as_raw_fd() to a peer over a Unix socket; the peer
/// // maps the same pages with SharedRegion::from_fd and attaches to
/// // the pool inside.
/// ```
pub struct SharedRegion {
    /// The memfd file descriptor.
    fd: OwnedFd,
    /// Base pointer of this process's mapping.
    base: NonNull<u8>,
    /// Size of the mapping in bytes.
    size: usize,
    /// Creator-side name (for debugging, visible in `/proc/self/fd/`).
    name: Option<String>,
}

impl SharedRegion {
    /// Create a new region of `size` bytes and map it.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is zero or if `memfd_create`,
    /// `ftruncate`, or `mmap` fails.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let cname = CString::new(name).map_err(|e| Error::InvalidRegion(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, size as u64)?;
        Self::map(fd, size, Some(name.to_string()))
    }

    /// Map a region a peer created, taking ownership of `fd`.
    ///
    /// This is the attacher side, after the descriptor arrived via
    /// `SCM_RIGHTS`.
    ///
    /// # Safety
    ///
    /// `fd` must refer to a memfd whose size is at least `size` bytes;
    /// a shorter file turns later accesses into `SIGBUS`.
    pub unsafe fn from_fd(fd: OwnedFd, size: usize) -> Result<Self> {
        Self::map(fd, size, None)
    }

    /// Map a region a peer created, from a borrowed raw descriptor.
    ///
    /// The descriptor is duplicated; the caller keeps its own.
    ///
    /// # Safety
    ///
    /// Same requirements as [`SharedRegion::from_fd`], and `fd` must
    /// stay open for the duration of the call.
    pub unsafe fn from_raw_fd(fd: RawFd, size: usize) -> Result<Self> {
        let owned = rustix::io::fcntl_dupfd_cloexec(unsafe { BorrowedFd::borrow_raw(fd) }, 0)?;
        unsafe { Self::from_fd(owned, size) }
    }

    /// Common tail of every constructor: validate, mmap, wrap.
    fn map(fd: OwnedFd, size: usize, name: Option<String>) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidRegion(
                "region size must be greater than 0".into(),
            ));
        }

        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };
        let base = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::InvalidRegion("mapping produced a null base".into()))?;

        Ok(Self {
            fd,
            base,
            size,
            name,
        })
    }

    /// Base pointer of this process's mapping.
    pub fn base_ptr(&self) -> NonNull<u8> {
        self.base
    }

    /// Size of the region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Raw file descriptor, e.g. to send to a peer over a Unix socket.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Debug name of the region; `None` on the attacher side.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), self.size);
        }
        // fd is closed when OwnedFd is dropped
    }
}

// SAFETY: the mapping is shared memory accessible from any thread and
// the fd is reference-counted by the kernel; no thread-local state.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl AsFd for SharedRegion {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::{
        ChunkHeader, PortId, CHUNK_DEFAULT_PAYLOAD_ALIGNMENT, CHUNK_NO_USER_HEADER_ALIGNMENT,
        CHUNK_NO_USER_HEADER_SIZE,
    };

    #[test]
    fn test_creator_region_has_name_and_size() {
        let region = SharedRegion::create("test-region", 4096).unwrap();
        assert_eq!(region.size(), 4096);
        assert_eq!(region.name(), Some("test-region"));
    }

    #[test]
    fn test_zero_sized_region_is_rejected_everywhere() {
        assert!(SharedRegion::create("test", 0).is_err());

        let donor = SharedRegion::create("test-donor", 4096).unwrap();
        assert!(unsafe { SharedRegion::from_raw_fd(donor.as_raw_fd(), 0) }.is_err());
    }

    #[test]
    fn test_attached_region_has_no_name() {
        let creator = SharedRegion::create("test-named", 4096).unwrap();
        let attacher =
            unsafe { SharedRegion::from_raw_fd(creator.as_raw_fd(), 4096).unwrap() };
        assert_eq!(attacher.name(), None);
        assert_eq!(attacher.size(), creator.size());
    }

    #[test]
    fn test_region_is_zero_initialized() {
        let region = SharedRegion::create("test-zeroed", 4096).unwrap();
        let bytes =
            unsafe { std::slice::from_raw_parts(region.base_ptr().as_ptr(), region.size()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    /// A chunk described through one mapping must be navigable through
    /// another mapping of the same region, offsets only.
    #[test]
    fn test_chunk_header_readable_through_second_mapping() {
        let creator = SharedRegion::create("test-chunk-region", 4096).unwrap();
        let attacher =
            unsafe { SharedRegion::from_raw_fd(creator.as_raw_fd(), creator.size()).unwrap() };
        assert_ne!(
            creator.base_ptr(),
            attacher.base_ptr(),
            "the two mappings must have distinct bases for this test to mean anything"
        );

        // publisher side describes and fills the chunk via the creator mapping
        let header = unsafe {
            ChunkHeader::init(
                creator.base_ptr(),
                256,
                5,
                CHUNK_DEFAULT_PAYLOAD_ALIGNMENT,
                CHUNK_NO_USER_HEADER_SIZE,
                CHUNK_NO_USER_HEADER_ALIGNMENT,
            )
        };
        let header = unsafe { &mut *header.as_ptr() };
        header.set_origin_id(PortId::new(3));
        header.set_sequence_number(12);
        unsafe {
            std::ptr::copy_nonoverlapping(b"chunk".as_ptr(), header.payload_mut(), 5);
        }

        // subscriber side reads the same chunk via the attacher mapping
        let peer_header = unsafe { &*attacher.base_ptr().cast::<ChunkHeader>().as_ptr() };
        assert_eq!(peer_header.origin_id(), PortId::new(3));
        assert_eq!(peer_header.sequence_number(), 12);
        assert_eq!(peer_header.payload_size(), 5);

        let payload = peer_header.payload();
        let recovered = unsafe { ChunkHeader::from_payload(payload) };
        assert_eq!(recovered, peer_header as *const ChunkHeader);
        let payload = unsafe { std::slice::from_raw_parts(payload, 5) };
        assert_eq!(payload, b"chunk");
    }
}
