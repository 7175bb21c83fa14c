//! Virtual File System traits and types
//!
//! This module defines the platform-independent file abstraction the storage
//! core is written against: random-access page files, advisory locks, and the
//! shared-memory region used by the WAL index.

use std::rc::Rc;

use bitflags::bitflags;

use crate::error::{Error, ErrorCode, Result};
use crate::types::DbOffset;

// ============================================================================
// Flags and Enums
// ============================================================================

bitflags! {
    /// Flags for opening files
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const READONLY  = 0x0001;
        const READWRITE = 0x0002;
        const CREATE    = 0x0004;
        const EXCLUSIVE = 0x0008;
    }
}

bitflags! {
    /// Flags for file sync operations
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SyncFlags: u32 {
        const NORMAL   = 0x0002;
        const FULL     = 0x0003;
        const DATAONLY = 0x0010;
    }
}

bitflags! {
    /// Flags for checking file access
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const EXISTS    = 0;
        const READWRITE = 1;
    }
}

bitflags! {
    /// Flags for shared-memory lock operations. Exactly one of LOCK/UNLOCK
    /// and one of SHARED/EXCLUSIVE must be set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShmLockFlags: u32 {
        const UNLOCK    = 1;
        const LOCK      = 2;
        const SHARED    = 4;
        const EXCLUSIVE = 8;
    }
}

/// File lock levels. Shared locks coexist; Reserved signals write intent and
/// excludes other Reserved/Exclusive holders; Exclusive excludes everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(i32)]
pub enum LockLevel {
    /// No lock held
    #[default]
    None = 0,
    /// Shared (read) lock
    Shared = 1,
    /// Reserved lock (intend to write)
    Reserved = 2,
    /// Pending lock (waiting for readers to drain)
    Pending = 3,
    /// Exclusive (write) lock
    Exclusive = 4,
}

/// Size of one shared-memory region in bytes
pub const SHM_REGION_SIZE: usize = 32768;

// ============================================================================
// VFS File Trait
// ============================================================================

/// File handle abstraction
///
/// All methods take `&self`; implementations keep their mutable state behind
/// interior mutability so that handles can be shared between the pager and
/// the WAL.
pub trait VfsFile {
    /// Read up to `buf.len()` bytes at `offset`, returning the byte count.
    /// A short read past EOF is not an error; the caller zero-fills.
    fn read(&self, buf: &mut [u8], offset: DbOffset) -> Result<usize>;

    /// Write all of `buf` at `offset`, extending the file if needed
    fn write(&self, buf: &[u8], offset: DbOffset) -> Result<()>;

    /// Truncate or extend the file to `size` bytes
    fn truncate(&self, size: DbOffset) -> Result<()>;

    /// Flush file contents to stable storage
    fn sync(&self, flags: SyncFlags) -> Result<()>;

    /// Current file size in bytes
    fn file_size(&self) -> Result<DbOffset>;

    /// Upgrade the advisory file lock to `level`. Returns Busy (Retry) if
    /// another connection holds a conflicting lock.
    fn lock(&self, level: LockLevel) -> Result<()>;

    /// Downgrade the advisory file lock to `level`
    fn unlock(&self, level: LockLevel) -> Result<()>;

    /// Check whether any connection holds a Reserved or stronger lock
    fn check_reserved_lock(&self) -> Result<bool>;

    /// Map shared-memory region `region` (of SHM_REGION_SIZE bytes),
    /// creating it when `extend` is set. Returns a pointer valid until
    /// `shm_unmap`, or NotFound when the region does not exist and `extend`
    /// is false.
    fn shm_map(&self, region: usize, extend: bool) -> Result<*mut u8> {
        let _ = (region, extend);
        Err(Error::new(ErrorCode::NotSupported))
    }

    /// Lock `n` consecutive shared-memory lock slots starting at `offset`
    fn shm_lock(&self, offset: usize, n: usize, flags: ShmLockFlags) -> Result<()> {
        let _ = (offset, n, flags);
        Err(Error::new(ErrorCode::NotSupported))
    }

    /// Memory barrier between shared-memory writes
    fn shm_barrier(&self) {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }

    /// Unmap all shared-memory regions; delete the backing file if `delete`
    fn shm_unmap(&self, delete: bool) -> Result<()> {
        let _ = delete;
        Ok(())
    }
}

// ============================================================================
// VFS Trait
// ============================================================================

/// Virtual File System - platform abstraction for file management
pub trait Vfs {
    /// VFS name (e.g. "unix")
    fn name(&self) -> &str;

    /// Open a file
    fn open(&self, path: &str, flags: OpenFlags) -> Result<Rc<dyn VfsFile>>;

    /// Delete a file
    fn delete(&self, path: &str, sync_dir: bool) -> Result<()>;

    /// Check if a file exists/is accessible
    fn access(&self, path: &str, flags: AccessFlags) -> Result<bool>;

    /// Get full pathname from a relative path
    fn full_pathname(&self, path: &str) -> Result<String>;

    /// Fill buffer with random bytes, returning the count written
    fn randomness(&self, buf: &mut [u8]) -> usize;

    /// Sleep for the given number of microseconds
    fn sleep(&self, microseconds: u32);
}

/// Construct the default VFS for this platform
#[cfg(unix)]
pub fn default_vfs() -> Rc<dyn Vfs> {
    Rc::new(crate::os::unix::UnixVfs::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_level_ordering() {
        assert!(LockLevel::None < LockLevel::Shared);
        assert!(LockLevel::Shared < LockLevel::Reserved);
        assert!(LockLevel::Reserved < LockLevel::Pending);
        assert!(LockLevel::Pending < LockLevel::Exclusive);
    }

    #[test]
    fn test_shm_lock_flags() {
        let flags = ShmLockFlags::LOCK | ShmLockFlags::EXCLUSIVE;
        assert!(flags.contains(ShmLockFlags::LOCK));
        assert!(flags.contains(ShmLockFlags::EXCLUSIVE));
        assert!(!flags.contains(ShmLockFlags::SHARED));
    }

    #[test]
    fn test_open_flags() {
        let flags = OpenFlags::READWRITE | OpenFlags::CREATE;
        assert!(flags.contains(OpenFlags::READWRITE));
        assert!(!flags.contains(OpenFlags::READONLY));
    }
}
