//! Process-crash-safe exclusive lock on a named lock file.
//!
//! The lock serializes which process gets to initialize a named shared
//! resource. It is built on an OS advisory file lock instead of any
//! in-process primitive because the kernel releases the lock on process
//! death — including `SIGKILL` and segfaults — so a crashed creator can
//! never freeze its peers out. `lslocks` displays all system-wide
//! holders.

use rustix::fd::OwnedFd;
use rustix::fs::{FlockOperation, Mode, OFlags};
use rustix::io::Errno;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Suffix appended to every lock file name.
pub const LOCK_FILE_SUFFIX: &str = ".lock";

/// Default directory for lock files.
pub const LOCK_FILE_PATH_PREFIX: &str = "/var/lock";

/// Maximum length of a file name, including the suffix.
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Maximum length of a full lock file path.
pub const MAX_PATH_LENGTH: usize = 1023;

/// Everything that can go wrong while acquiring a file lock.
///
/// The set is closed so callers can handle every case exhaustively
/// instead of parsing message strings.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileLockError {
    /// The name is empty or contains path separators.
    #[error("invalid file name")]
    InvalidFileName,
    /// The directory path is not usable.
    #[error("invalid file path")]
    InvalidFilePath,
    /// The combined path exceeds the configured maximum length.
    #[error("file path too long")]
    FilePathTooLong,
    /// Another process already holds the lock.
    #[error("locked by another process")]
    LockedByOtherProcess,
    /// Missing permissions on the lock file or its directory.
    #[error("access denied")]
    AccessDenied,
    /// Disk quota or space exhausted.
    #[error("quota exhausted")]
    QuotaExhausted,
    /// The system-wide file descriptor limit is reached.
    #[error("system limit reached")]
    SystemLimit,
    /// The per-process file descriptor limit is reached.
    #[error("process limit reached")]
    ProcessLimit,
    /// The lock file directory does not exist.
    #[error("no such directory")]
    NoSuchDirectory,
    /// The path names a directory or special file.
    #[error("path is a special file")]
    SpecialFile,
    /// The lock file would exceed the file size limit.
    #[error("file too large")]
    FileTooLarge,
    /// The file is busy in a conflicting way.
    #[error("file in use")]
    FileInUse,
    /// The kernel ran out of memory.
    #[error("out of memory")]
    OutOfMemory,
    /// An I/O error occurred while touching the lock file.
    #[error("I/O error")]
    IoError,
    /// The system call is not implemented on this platform.
    #[error("not implemented")]
    NotImplemented,
    /// An error that should not occur; report it if it does.
    #[error("internal logic error")]
    Internal,
}

fn errno_to_error(errno: Errno) -> FileLockError {
    if errno == Errno::ACCESS || errno == Errno::PERM {
        FileLockError::AccessDenied
    } else if errno == Errno::DQUOT || errno == Errno::NOSPC {
        FileLockError::QuotaExhausted
    } else if errno == Errno::NFILE {
        FileLockError::SystemLimit
    } else if errno == Errno::MFILE {
        FileLockError::ProcessLimit
    } else if errno == Errno::NOENT || errno == Errno::NOTDIR {
        FileLockError::NoSuchDirectory
    } else if errno == Errno::ISDIR || errno == Errno::NXIO {
        FileLockError::SpecialFile
    } else if errno == Errno::FBIG || errno == Errno::OVERFLOW {
        FileLockError::FileTooLarge
    } else if errno == Errno::TXTBSY || errno == Errno::BUSY {
        FileLockError::FileInUse
    } else if errno == Errno::NOMEM {
        FileLockError::OutOfMemory
    } else if errno == Errno::IO || errno == Errno::INTR {
        FileLockError::IoError
    } else if errno == Errno::NOSYS {
        FileLockError::NotImplemented
    } else if errno == Errno::WOULDBLOCK || errno == Errno::AGAIN {
        FileLockError::LockedByOtherProcess
    } else if errno == Errno::NAMETOOLONG {
        FileLockError::FilePathTooLong
    } else if errno == Errno::LOOP || errno == Errno::INVAL {
        FileLockError::InvalidFilePath
    } else {
        FileLockError::Internal
    }
}

/// An exclusive advisory lock on `{directory}/{name}.lock`.
///
/// Acquired non-blocking on creation and released on drop. The kernel
/// also releases it when the process dies, so the lock can never
/// outlive its holder. Moving the value transfers ownership of the
/// descriptor; there is no way to copy it.
///
/// The lock file itself may stay on disk after release and is reused on
/// the next acquisition.
#[derive(Debug)]
pub struct FileLock {
    fd: OwnedFd,
    path: PathBuf,
}

impl FileLock {
    /// Acquire the lock named `name` under [`LOCK_FILE_PATH_PREFIX`]
    /// with owner read/write permissions.
    pub fn create(name: &str) -> Result<Self, FileLockError> {
        Self::create_in(
            name,
            Path::new(LOCK_FILE_PATH_PREFIX),
            Mode::RUSR | Mode::WUSR,
        )
    }

    /// Acquire the lock named `name` as `{directory}/{name}.lock`,
    /// creating the lock file with `permissions` if it does not exist.
    ///
    /// Returns [`FileLockError::LockedByOtherProcess`] immediately if
    /// the lock is held elsewhere; the call never blocks.
    pub fn create_in(
        name: &str,
        directory: &Path,
        permissions: Mode,
    ) -> Result<Self, FileLockError> {
        if name.is_empty() || name.contains('/') || name.contains('\\') {
            return Err(FileLockError::InvalidFileName);
        }
        let Some(directory_str) = directory.to_str() else {
            return Err(FileLockError::InvalidFilePath);
        };
        if directory_str.is_empty() || directory_str.contains('\0') {
            return Err(FileLockError::InvalidFilePath);
        }

        let name_budget = MAX_FILENAME_LENGTH
            .saturating_sub(directory_str.len())
            .saturating_sub(LOCK_FILE_SUFFIX.len())
            .saturating_sub(1);
        if name.len() > name_budget {
            return Err(FileLockError::FilePathTooLong);
        }

        let path = directory.join(format!("{name}{LOCK_FILE_SUFFIX}"));
        if path.as_os_str().len() > MAX_PATH_LENGTH {
            return Err(FileLockError::FilePathTooLong);
        }

        let fd = rustix::fs::open(
            &path,
            OFlags::CREATE | OFlags::RDWR | OFlags::CLOEXEC,
            permissions,
        )
        .map_err(errno_to_error)?;

        rustix::fs::flock(&fd, FlockOperation::NonBlockingLockExclusive)
            .map_err(errno_to_error)?;

        tracing::debug!(path = %path.display(), "acquired file lock");
        Ok(Self { fd, path })
    }

    /// Path of the lock file on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Unlock explicitly; the descriptor close below would release
        // the lock as well, as does the kernel on process death.
        if let Err(errno) = rustix::fs::flock(&self.fd, FlockOperation::Unlock) {
            tracing::warn!(
                path = %self.path.display(),
                %errno,
                "failed to unlock lock file"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn permissions() -> Mode {
        Mode::RUSR | Mode::WUSR
    }

    #[test]
    fn test_lock_is_exclusive_until_released() {
        let dir = lock_dir();

        let first = FileLock::create_in("exclusive", dir.path(), permissions()).unwrap();
        let second = FileLock::create_in("exclusive", dir.path(), permissions());
        assert_eq!(second.unwrap_err(), FileLockError::LockedByOtherProcess);

        drop(first);
        assert!(FileLock::create_in("exclusive", dir.path(), permissions()).is_ok());
    }

    #[test]
    fn test_different_names_do_not_conflict() {
        let dir = lock_dir();

        let _a = FileLock::create_in("alpha", dir.path(), permissions()).unwrap();
        let _b = FileLock::create_in("beta", dir.path(), permissions()).unwrap();
    }

    #[test]
    fn test_invalid_names_are_rejected() {
        let dir = lock_dir();

        for name in ["", "bad/name", "bad\\name", "nested/deeper/name"] {
            assert_eq!(
                FileLock::create_in(name, dir.path(), permissions()).unwrap_err(),
                FileLockError::InvalidFileName,
                "name {name:?} must be rejected"
            );
        }
    }

    #[test]
    fn test_overlong_name_is_rejected() {
        let dir = lock_dir();
        let name = "x".repeat(MAX_FILENAME_LENGTH + 1);
        assert_eq!(
            FileLock::create_in(&name, dir.path(), permissions()).unwrap_err(),
            FileLockError::FilePathTooLong
        );
    }

    #[test]
    fn test_missing_directory_is_reported() {
        let dir = lock_dir();
        let missing = dir.path().join("does-not-exist");
        assert_eq!(
            FileLock::create_in("orphan", &missing, permissions()).unwrap_err(),
            FileLockError::NoSuchDirectory
        );
    }

    #[test]
    fn test_lock_file_stays_on_disk_and_is_reused() {
        let dir = lock_dir();

        let lock = FileLock::create_in("sticky", dir.path(), permissions()).unwrap();
        let path = lock.path().to_path_buf();
        assert!(path.exists());
        drop(lock);

        assert!(path.exists());
        let again = FileLock::create_in("sticky", dir.path(), permissions()).unwrap();
        assert_eq!(again.path(), path);
    }

    #[test]
    fn test_moved_lock_keeps_holding() {
        let dir = lock_dir();

        let lock = FileLock::create_in("movable", dir.path(), permissions()).unwrap();
        let moved = lock;

        assert_eq!(
            FileLock::create_in("movable", dir.path(), permissions()).unwrap_err(),
            FileLockError::LockedByOtherProcess
        );
        drop(moved);
    }

    #[test]
    fn test_errno_mapping_covers_the_common_cases() {
        assert_eq!(
            errno_to_error(Errno::WOULDBLOCK),
            FileLockError::LockedByOtherProcess
        );
        assert_eq!(errno_to_error(Errno::ACCESS), FileLockError::AccessDenied);
        assert_eq!(errno_to_error(Errno::NOENT), FileLockError::NoSuchDirectory);
        assert_eq!(errno_to_error(Errno::MFILE), FileLockError::ProcessLimit);
        assert_eq!(errno_to_error(Errno::NFILE), FileLockError::SystemLimit);
        assert_eq!(errno_to_error(Errno::FAULT), FileLockError::Internal);
    }
}
