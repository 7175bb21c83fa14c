//! Core type aliases and shared configuration enums
//!
//! This module defines the foundational types shared by the storage layers:
//! page numbering, size limits, and the sync/lock mode knobs that the pager
//! and WAL consume.

/// Page number type (1-based; 0 means "no page")
pub type Pgno = u32;

/// Database file offset
pub type DbOffset = i64;

/// Minimum supported page size
pub const MIN_PAGE_SIZE: u32 = 512;

/// Maximum supported page size
pub const MAX_PAGE_SIZE: u32 = 65536;

/// Default page size
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Maximum number of pages in a database file
pub const MAX_PAGE_COUNT: Pgno = u32::MAX - 1;

/// Minimum number of frames the page cache must hold
pub const MIN_CACHE_FRAMES: usize = 16;

/// Default page cache budget in bytes
pub const DEFAULT_CACHE_SIZE: usize = 1 << 20;

/// How aggressively the WAL and database file are synced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum SyncMode {
    /// Never fsync; durability is left to the OS
    Off = 0,
    /// Sync the WAL at commit and the database file at checkpoint
    #[default]
    Normal = 1,
    /// Sync the WAL header as well as frames at every commit
    Full = 2,
}

/// File locking behavior across transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum LockMode {
    /// Release file locks when each transaction ends
    #[default]
    Normal = 0,
    /// Keep an exclusive file lock for the lifetime of the connection
    Exclusive = 1,
}

/// User-supplied busy callback. Receives the attempt number and returns
/// true to keep retrying the blocked lock acquisition.
pub type BusyHandler = Box<dyn FnMut(u32) -> bool>;

/// Check that a page size is valid: a power of two in [512, 65536].
pub fn is_valid_page_size(page_size: u32) -> bool {
    (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) && page_size.is_power_of_two()
}
