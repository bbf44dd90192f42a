//! Self-describing inline metadata prefix of every chunk.
//!
//! A chunk handed out by a pool starts with a [`ChunkHeader`] that makes
//! the raw memory navigable from any process mapping the region: all
//! stored quantities are sizes or self-relative offsets, never absolute
//! addresses, so the same chunk reads identically at different mapping
//! base addresses.
//!
//! # Layout
//!
//! The header is 32 bytes, bit-exact across processes:
//!
//! | Offset | Size | Field |
//! |--------|------|----------------------------|
//! | 0      | 4    | `chunk_size` (LE)          |
//! | 4      | 1    | `chunk_header_version` = 1 |
//! | 5      | 1    | `reserved1` = 0            |
//! | 6      | 1    | `reserved2` = 0            |
//! | 7      | 1    | `reserved3` = 0            |
//! | 8      | 8    | `origin_id`                |
//! | 16     | 8    | `sequence_number`          |
//! | 24     | 4    | `payload_size`             |
//! | 28     | 4    | `payload_offset`           |
//!
//! `payload_offset` is deliberately the last field: for an adjacent
//! layout the four bytes immediately preceding the payload are the
//! header's own `payload_offset`, and for a user-header layout a
//! back-offset of the same width is written there. [`ChunkHeader::from_payload`]
//! therefore recovers the header with a single uniform read.

use crate::fatal::{fatal, FatalError};
use std::mem;
use std::ptr::{self, NonNull};

/// Format discriminator of the chunk header layout.
pub const CHUNK_HEADER_VERSION: u8 = 1;

/// User header size for chunks without a user header.
pub const CHUNK_NO_USER_HEADER_SIZE: u32 = 0;

/// User header alignment for chunks without a user header.
pub const CHUNK_NO_USER_HEADER_ALIGNMENT: u32 = 1;

/// Payload alignment when the caller has no alignment requirement.
pub const CHUNK_DEFAULT_PAYLOAD_ALIGNMENT: u32 = 1;

/// Width of the back-offset field preceding a non-adjacent payload.
pub type PayloadOffset = u32;

/// Identity of the publisher port that produced a chunk.
///
/// Opaque 64-bit value assigned by the out-of-scope discovery layer;
/// a freshly initialized header carries [`PortId::INVALID`].
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(u64);

impl PortId {
    /// The identity of no port.
    pub const INVALID: PortId = PortId(u64::MAX);

    /// Wrap a raw port identity.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw 64-bit value.
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Whether this identifies an actual port.
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl Default for PortId {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Inline header at offset 0 of every chunk.
///
/// Written by the publisher before the chunk pointer is forwarded;
/// subscribers only read it. The chunk is laid out as
///
/// ```text
/// [ ChunkHeader | user header? | padding? | back-offset? | payload ]
/// ```
///
/// with the user header and back-offset present only when a user header
/// was configured at initialization.
#[repr(C, align(32))]
pub struct ChunkHeader {
    chunk_size: u32,
    chunk_header_version: u8,
    reserved1: u8,
    reserved2: u8,
    reserved3: u8,
    origin_id: PortId,
    sequence_number: u64,
    payload_size: u32,
    payload_offset: u32,
}

const _: () = assert!(mem::size_of::<ChunkHeader>() == 32);
const _: () = assert!(mem::align_of::<ChunkHeader>() == 32);
const _: () = assert!(mem::offset_of!(ChunkHeader, chunk_size) == 0);
const _: () = assert!(mem::offset_of!(ChunkHeader, chunk_header_version) == 4);
const _: () = assert!(mem::offset_of!(ChunkHeader, reserved1) == 5);
const _: () = assert!(mem::offset_of!(ChunkHeader, reserved2) == 6);
const _: () = assert!(mem::offset_of!(ChunkHeader, reserved3) == 7);
const _: () = assert!(mem::offset_of!(ChunkHeader, origin_id) == 8);
const _: () = assert!(mem::offset_of!(ChunkHeader, sequence_number) == 16);
const _: () = assert!(mem::offset_of!(ChunkHeader, payload_size) == 24);
const _: () = assert!(mem::offset_of!(ChunkHeader, payload_offset) == 28);

fn align_up(value: u32, alignment: u32) -> u32 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

impl ChunkHeader {
    /// Compute the header for a chunk of `chunk_size` bytes carrying
    /// `payload_size` bytes of payload.
    ///
    /// With `user_header_size == 0` the payload is adjacent to the
    /// header. Otherwise the payload starts at the smallest offset past
    /// the user header and back-offset field that satisfies
    /// `payload_alignment`.
    pub fn new(
        chunk_size: u32,
        payload_size: u32,
        payload_alignment: u32,
        user_header_size: u32,
        user_header_alignment: u32,
    ) -> Self {
        debug_assert!(payload_alignment.is_power_of_two());
        debug_assert!(user_header_alignment.is_power_of_two());
        debug_assert!(
            user_header_alignment <= mem::align_of::<ChunkHeader>() as u32,
            "user header alignment beyond the header alignment is not supported"
        );

        let header_size = mem::size_of::<ChunkHeader>() as u32;
        let payload_offset = if user_header_size == CHUNK_NO_USER_HEADER_SIZE {
            header_size
        } else {
            let back_offset_size = mem::size_of::<PayloadOffset>() as u32;
            align_up(
                header_size + user_header_size + back_offset_size,
                payload_alignment.max(1),
            )
        };

        Self {
            chunk_size,
            chunk_header_version: CHUNK_HEADER_VERSION,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
            origin_id: PortId::INVALID,
            sequence_number: 0,
            payload_size,
            payload_offset,
        }
    }

    /// Write a header into the chunk starting at `chunk` and return it.
    ///
    /// For user-header layouts this also stores the back-offset in the
    /// four bytes preceding the payload, so that
    /// [`from_payload`](Self::from_payload) works regardless of padding.
    ///
    /// # Safety
    ///
    /// `chunk` must be valid for writes of `chunk_size` bytes and
    /// aligned to the chunk alignment.
    pub unsafe fn init(
        chunk: NonNull<u8>,
        chunk_size: u32,
        payload_size: u32,
        payload_alignment: u32,
        user_header_size: u32,
        user_header_alignment: u32,
    ) -> NonNull<ChunkHeader> {
        let header = Self::new(
            chunk_size,
            payload_size,
            payload_alignment,
            user_header_size,
            user_header_alignment,
        );
        let payload_offset = header.payload_offset;

        let target = chunk.cast::<ChunkHeader>();
        unsafe {
            target.as_ptr().write(header);
            if user_header_size != CHUNK_NO_USER_HEADER_SIZE {
                let back_offset_size = mem::size_of::<PayloadOffset>();
                chunk
                    .as_ptr()
                    .add(payload_offset as usize - back_offset_size)
                    .cast::<PayloadOffset>()
                    .write_unaligned(payload_offset);
            }
        }
        target
    }

    /// Pointer to the user payload of this chunk.
    ///
    /// The pointer is only dereferenceable when the header actually
    /// prefixes a chunk of at least `used_size_of_chunk` bytes.
    pub fn payload(&self) -> *const u8 {
        (self as *const ChunkHeader as *const u8).wrapping_add(self.payload_offset as usize)
    }

    /// Mutable pointer to the user payload of this chunk.
    pub fn payload_mut(&mut self) -> *mut u8 {
        (self as *mut ChunkHeader as *mut u8).wrapping_add(self.payload_offset as usize)
    }

    /// Pointer to the user header placed directly after this header.
    ///
    /// Only valid when the chunk was initialized with a nonzero user
    /// header size; with no user header configured the returned pointer
    /// aliases the payload or padding.
    pub fn user_header<T>(&self) -> *const T {
        (self as *const ChunkHeader as *const u8)
            .wrapping_add(mem::size_of::<ChunkHeader>())
            .cast()
    }

    /// Recover the header from a payload pointer.
    ///
    /// Returns null for a null `payload`.
    ///
    /// # Safety
    ///
    /// A non-null `payload` must have been obtained from
    /// [`payload`](Self::payload) of a chunk initialized through this
    /// module, and the chunk must still be mapped.
    pub unsafe fn from_payload(payload: *const u8) -> *const ChunkHeader {
        if payload.is_null() {
            return ptr::null();
        }
        let back_offset_size = mem::size_of::<PayloadOffset>();
        let offset = unsafe {
            payload
                .sub(back_offset_size)
                .cast::<PayloadOffset>()
                .read_unaligned()
        };
        payload.wrapping_sub(offset as usize).cast()
    }

    /// Mutable variant of [`from_payload`](Self::from_payload).
    ///
    /// # Safety
    ///
    /// Same requirements as [`from_payload`](Self::from_payload).
    pub unsafe fn from_payload_mut(payload: *mut u8) -> *mut ChunkHeader {
        unsafe { Self::from_payload(payload) as *mut ChunkHeader }
    }

    /// Bytes of the chunk actually in use: payload offset plus payload.
    ///
    /// Fatal if the result exceeds the chunk size; a header claiming
    /// more bytes than its chunk holds is corrupt.
    pub fn used_size_of_chunk(&self) -> u32 {
        let used = self.payload_offset as u64 + self.payload_size as u64;
        if used > self.chunk_size as u64 {
            fatal(FatalError::UsedSizeExceedsChunkSize {
                used_size: used,
                chunk_size: self.chunk_size,
            });
        }
        used as u32
    }

    /// Total bytes of the chunk.
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Version of the header format.
    pub fn version(&self) -> u8 {
        self.chunk_header_version
    }

    /// Bytes of user payload.
    pub fn payload_size(&self) -> u32 {
        self.payload_size
    }

    /// Byte offset from the header start to the payload.
    pub fn payload_offset(&self) -> u32 {
        self.payload_offset
    }

    /// Identity of the publishing port.
    pub fn origin_id(&self) -> PortId {
        self.origin_id
    }

    /// Stamp the identity of the publishing port.
    pub fn set_origin_id(&mut self, origin_id: PortId) {
        self.origin_id = origin_id;
    }

    /// Sequence number assigned by the publisher.
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Stamp the publisher sequence number.
    pub fn set_sequence_number(&mut self, sequence_number: u64) {
        self.sequence_number = sequence_number;
    }
}
