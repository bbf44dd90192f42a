//! Process-wide handling of unrecoverable pool corruption.
//!
//! Every violation that indicates shared-memory corruption is funneled
//! through [`fatal`], which reports a [`FatalError`] to an optionally
//! installed handler and then panics. Continuing after any of these
//! conditions would propagate corrupted state to every process mapping
//! the same region, so the fatal path never returns.

use std::sync::OnceLock;

use thiserror::Error;

/// Unrecoverable violations detected by the chunk distribution core.
///
/// Each variant is a distinct tag so that a handler can tell the
/// violations apart without parsing messages.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalError {
    /// Chunk size passed to pool construction is not a multiple of the
    /// chunk alignment.
    #[error("chunk size {chunk_size} is not a multiple of the chunk alignment {alignment}")]
    UnalignedChunkSize {
        /// The rejected chunk size.
        chunk_size: u64,
        /// The required alignment.
        alignment: u64,
    },

    /// `chunk_size * chunk_count` does not fit into 64 bits.
    #[error("chunk size {chunk_size} times chunk count {chunk_count} overflows u64")]
    ChunkMemoryOverflow {
        /// The requested chunk size.
        chunk_size: u64,
        /// The requested chunk count.
        chunk_count: u32,
    },

    /// A pointer outside the pool's chunk range was released.
    #[error("released pointer {pointer:#x} is outside the pool's chunk range")]
    ReleaseOutOfRange {
        /// Address of the released pointer.
        pointer: usize,
    },

    /// A pointer inside the pool's range but not on a chunk boundary was
    /// released.
    #[error("released pointer {pointer:#x} is not aligned to a chunk boundary")]
    ReleaseUnaligned {
        /// Address of the released pointer.
        pointer: usize,
    },

    /// An index was pushed onto an already-full free queue, possible
    /// double free.
    #[error("free index {index} rejected by the full free queue, possible double free")]
    PossibleDoubleFree {
        /// The rejected chunk index.
        index: u32,
    },

    /// The header plus payload of a chunk claims more bytes than the
    /// chunk holds.
    #[error("used chunk size {used_size} exceeds the chunk size {chunk_size}")]
    UsedSizeExceedsChunkSize {
        /// Bytes claimed by header layout plus payload.
        used_size: u64,
        /// Total bytes of the chunk.
        chunk_size: u32,
    },
}

/// Callback invoked with the violation before the process panics.
pub type FatalHandler = fn(&FatalError);

static FATAL_HANDLER: OnceLock<FatalHandler> = OnceLock::new();

/// Install a process-wide handler invoked on every fatal violation.
///
/// Only the first installation wins; returns `false` if a handler was
/// already installed. The handler runs before the panic and may flush
/// logs or notify a supervisor, but it cannot suppress the panic.
pub fn set_fatal_handler(handler: FatalHandler) -> bool {
    FATAL_HANDLER.set(handler).is_ok()
}

/// Report `error` and abort the current operation by panicking.
pub(crate) fn fatal(error: FatalError) -> ! {
    tracing::error!(%error, "fatal shared-memory pool violation");
    if let Some(handler) = FATAL_HANDLER.get() {
        handler(&error);
    }
    panic!("{error}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_error_messages_carry_the_violation() {
        let error = FatalError::PossibleDoubleFree { index: 3 };
        assert!(error.to_string().contains("possible double free"));

        let error = FatalError::UnalignedChunkSize {
            chunk_size: 100,
            alignment: 32,
        };
        assert!(error.to_string().contains("multiple of the chunk alignment"));
    }

    #[test]
    #[should_panic(expected = "outside the pool's chunk range")]
    fn test_fatal_panics_with_the_violation_message() {
        fatal(FatalError::ReleaseOutOfRange { pointer: 0xdead });
    }

    #[test]
    fn test_installed_handler_observes_the_violation() {
        static SEEN: AtomicBool = AtomicBool::new(false);

        fn record(error: &FatalError) {
            if matches!(error, FatalError::PossibleDoubleFree { .. }) {
                SEEN.store(true, Ordering::Relaxed);
            }
        }

        // the slot is process-wide, so a second installation must lose
        let installed = set_fatal_handler(record);
        let result =
            std::panic::catch_unwind(|| fatal(FatalError::PossibleDoubleFree { index: 1 }));
        assert!(result.is_err());
        if installed {
            assert!(SEEN.load(Ordering::Relaxed));
            assert!(!set_fatal_handler(record));
        }
    }
}
