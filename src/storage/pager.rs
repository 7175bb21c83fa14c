//! Pager: transaction lifecycle and page-level I/O
//!
//! The pager owns the database file, the WAL connection, and the page cache.
//! Every page read resolves cache → WAL → file; every page write goes into
//! the cache's dirty list and reaches the WAL at commit (or earlier, if the
//! cache spills). I/O and corruption errors are latched into `Error` mode so
//! a damaged transaction cannot half-commit; `rollback` is the only way out.

use std::cell::{Ref, RefMut};
use std::rc::Rc;

use crate::error::{Error, ErrorCode, Result};
use crate::os::vfs::{LockLevel, OpenFlags, Vfs, VfsFile};
use crate::storage::freelist;
use crate::storage::header::{self, FileHeader};
use crate::storage::pcache::{PageCache, PageRef};
use crate::storage::ptrmap;
use crate::storage::wal::Wal;
use crate::types::{
    BusyHandler, LockMode, Pgno, SyncMode, DEFAULT_CACHE_SIZE, DEFAULT_PAGE_SIZE, MAX_PAGE_COUNT,
    MIN_CACHE_FRAMES,
};

// ============================================================================
// Modes and hints
// ============================================================================

/// Pager state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum PagerMode {
    /// No transaction active
    Open = 0,
    /// Read transaction: shared lock + WAL read slot held
    Read = 1,
    /// Write transaction with no changes yet
    Write = 2,
    /// Write transaction with uncommitted changes
    Dirty = 3,
    /// A latched I/O or corruption error; only rollback is legal
    Error = 4,
}

/// What to do with a page's cache entry on release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseHint {
    /// Leave the page cached
    Keep,
    /// Drop the entry unless it is dirty (for pages unlikely to be reused)
    NoCache,
    /// Drop the entry even if dirty (for pages that no longer exist)
    Discard,
}

/// Pager construction parameters
pub struct PagerOptions {
    pub path: String,
    pub page_size: u32,
    pub cache_size_bytes: usize,
    pub sync_mode: SyncMode,
    pub lock_mode: LockMode,
    pub create_if_missing: bool,
    pub error_if_exists: bool,
    pub readonly: bool,
    pub busy_handler: Option<BusyHandler>,
}

impl Default for PagerOptions {
    fn default() -> Self {
        PagerOptions {
            path: String::new(),
            page_size: DEFAULT_PAGE_SIZE,
            cache_size_bytes: DEFAULT_CACHE_SIZE,
            sync_mode: SyncMode::default(),
            lock_mode: LockMode::default(),
            create_if_missing: true,
            error_if_exists: false,
            readonly: false,
            busy_handler: None,
        }
    }
}

// ============================================================================
// Pager
// ============================================================================

pub struct Pager {
    vfs: Rc<dyn Vfs>,
    file: Rc<dyn VfsFile>,
    wal: Wal,
    cache: PageCache,

    mode: PagerMode,
    status: Option<Error>,

    page_size: u32,
    /// Tracked database size in pages; may run ahead of the file during a
    /// write transaction
    page_count: Pgno,
    /// Database size at transaction start, restored by rollback
    orig_page_count: Pgno,
    /// Cache slot of the pinned page 1, valid while a transaction is open
    root_slot: Option<usize>,

    sync_mode: SyncMode,
    lock_mode: LockMode,
    readonly: bool,
    busy: Option<BusyHandler>,

    /// Monotonic transaction counter; handles opened under an earlier
    /// transaction are refused
    txn_id: u64,
    /// WAL header stamp of the snapshot the cache contents belong to;
    /// cached pages are dropped when another connection has committed
    last_wal_stamp: Option<(u32, [u32; 2])>,
    /// True when the database file was created by this pager and page 1 has
    /// not been initialized yet
    is_new: bool,

    n_read: u64,
    n_written: u64,
}

impl Pager {
    // ========================================================================
    // Setup
    // ========================================================================

    pub fn open(vfs: Rc<dyn Vfs>, options: PagerOptions) -> Result<Self> {
        use crate::os::vfs::AccessFlags;

        let path = vfs.full_pathname(&options.path)?;
        let exists = vfs.access(&path, AccessFlags::EXISTS)?;
        if exists && options.error_if_exists {
            return Err(Error::with_message(
                ErrorCode::InvalidArgument,
                format!("database exists: {}", path),
            ));
        }
        if !exists && !options.create_if_missing {
            return Err(Error::with_message(
                ErrorCode::InvalidArgument,
                format!("database does not exist: {}", path),
            ));
        }

        let mut flags = if options.readonly {
            OpenFlags::READONLY
        } else {
            OpenFlags::READWRITE
        };
        if !exists {
            flags |= OpenFlags::CREATE;
        }
        let file = vfs.open(&path, flags)?;

        // An existing database dictates the page size.
        let mut page_size = options.page_size;
        let file_size = file.file_size()?;
        let is_new = file_size == 0;
        if !is_new {
            let mut buf = [0u8; header::FILE_HEADER_SIZE];
            let n = file.read(&mut buf, 0)?;
            if n < header::FILE_HEADER_SIZE {
                return Err(Error::corruption("database file too small"));
            }
            page_size = FileHeader::read(&buf)?.page_size;
        }

        if options.lock_mode == LockMode::Exclusive && !options.readonly {
            file.lock(LockLevel::Shared)?;
            file.lock(LockLevel::Exclusive)?;
        }

        let wal = Wal::open(
            Rc::clone(&vfs),
            Rc::clone(&file),
            &format!("{}-wal", path),
            page_size,
        )?;
        let frames = (options.cache_size_bytes / page_size as usize).max(MIN_CACHE_FRAMES);
        let cache = PageCache::new(page_size as usize, frames);

        Ok(Pager {
            vfs,
            file,
            wal,
            cache,
            mode: PagerMode::Open,
            status: None,
            page_size,
            page_count: 0,
            orig_page_count: 0,
            root_slot: None,
            sync_mode: options.sync_mode,
            lock_mode: options.lock_mode,
            readonly: options.readonly,
            busy: options.busy_handler,
            txn_id: 0,
            last_wal_stamp: None,
            is_new,
            n_read: 0,
            n_written: 0,
        })
    }

    pub fn close(&mut self) -> Result<()> {
        if self.mode != PagerMode::Open {
            let _ = self.rollback();
        }
        self.wal.close()?;
        if self.lock_mode == LockMode::Exclusive {
            let _ = self.file.unlock(LockLevel::None);
        }
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn mode(&self) -> PagerMode {
        self.mode
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn page_count(&self) -> Pgno {
        self.page_count
    }

    pub fn txn_id(&self) -> u64 {
        self.txn_id
    }

    /// True when page 1 has never been written (a brand-new database)
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache.hits()
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache.misses()
    }

    pub fn pages_read(&self) -> u64 {
        self.n_read
    }

    pub fn pages_written(&self) -> u64 {
        self.n_written
    }

    /// The latched error, if the pager is in Error mode
    pub fn status(&self) -> Result<()> {
        match &self.status {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Latch an error. I/O and corruption faults poison the transaction;
    /// everything else passes through untouched.
    pub fn set_status(&mut self, err: &Error) {
        if self.status.is_none()
            && matches!(err.code(), ErrorCode::IoErr | ErrorCode::Corruption)
            && self.mode != PagerMode::Open
        {
            self.status = Some(err.clone());
            self.mode = PagerMode::Error;
        }
    }

    fn latch<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.set_status(err);
        }
        result
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Begin a read or write transaction, driving the busy handler while
    /// locks are contended.
    pub fn begin(&mut self, write: bool) -> Result<()> {
        self.status()?;
        if self.mode != PagerMode::Open {
            return Err(Error::with_message(
                ErrorCode::InvalidArgument,
                "transaction already open",
            ));
        }
        if write && self.readonly {
            return Err(Error::with_message(
                ErrorCode::InvalidArgument,
                "database is read-only",
            ));
        }

        let mut attempt = 0;
        loop {
            match self.try_begin(write) {
                Err(err) if err.is_retry() => {
                    attempt += 1;
                    let keep_going = match self.busy.as_mut() {
                        Some(handler) => handler(attempt),
                        None => false,
                    };
                    if !keep_going {
                        return Err(err);
                    }
                    self.vfs.sleep(1000);
                }
                other => return other,
            }
        }
    }

    fn try_begin(&mut self, write: bool) -> Result<()> {
        if self.lock_mode == LockMode::Normal {
            self.file.lock(LockLevel::Shared)?;
        }
        if let Err(err) = self.wal.begin_read() {
            self.unwind_begin();
            return Err(err);
        }
        if write {
            if self.lock_mode == LockMode::Normal {
                if let Err(err) = self.file.lock(LockLevel::Reserved) {
                    self.unwind_begin();
                    return Err(err);
                }
            }
            if let Err(err) = self.wal.begin_write() {
                self.unwind_begin();
                return Err(err);
            }
        }

        // Drop cached pages belonging to an older snapshot.
        let stamp = (self.wal.change_counter(), self.wal.salts());
        if self.last_wal_stamp != Some(stamp) {
            self.cache.purge();
            self.last_wal_stamp = Some(stamp);
        }

        let wal_pages = self.wal.db_size();
        let file_pages = match self.file.file_size() {
            Ok(size) => (size / i64::from(self.page_size)) as Pgno,
            Err(err) => {
                self.unwind_begin();
                return Err(err);
            }
        };
        self.page_count = if wal_pages > 0 { wal_pages } else { file_pages };
        self.orig_page_count = self.page_count;
        if self.is_new && self.page_count > 0 {
            // The database file is empty but the WAL carries committed
            // pages: page 1 exists after all.
            self.is_new = false;
        }
        self.mode = if write {
            PagerMode::Write
        } else {
            PagerMode::Read
        };
        self.txn_id += 1;

        // Pin page 1 for the duration of the transaction.
        let had_pages = self.page_count > 0;
        match self.acquire(1) {
            Ok(root) => {
                if had_pages {
                    let valid = FileHeader::read(&root.data());
                    if let Err(err) = valid {
                        self.release(root);
                        self.status = None;
                        self.mode = PagerMode::Open;
                        self.unwind_begin();
                        return Err(err);
                    }
                }
                // The pin is the outstanding reference; the handle itself
                // can go away.
                self.root_slot = Some(root.slot);
            }
            Err(err) => {
                // The transaction never started; nothing to latch.
                self.status = None;
                self.mode = PagerMode::Open;
                self.unwind_begin();
                return Err(err);
            }
        }
        Ok(())
    }

    fn unwind_begin(&mut self) {
        let _ = self.wal.end_write();
        let _ = self.wal.end_read();
        if self.lock_mode == LockMode::Normal {
            let _ = self.file.unlock(LockLevel::None);
        }
    }

    fn end_txn(&mut self) {
        if let Some(slot) = self.root_slot.take() {
            self.cache.unref(slot);
        }
        self.unwind_begin();
        self.mode = PagerMode::Open;
    }

    /// Commit the current transaction: write the header into page 1, append
    /// all dirty pages to the WAL with a commit frame, and release locks.
    pub fn commit(&mut self) -> Result<()> {
        self.status()?;
        match self.mode {
            PagerMode::Open => Err(Error::with_message(
                ErrorCode::InvalidArgument,
                "no transaction to commit",
            )),
            PagerMode::Error => self.status(),
            PagerMode::Read | PagerMode::Write => {
                self.end_txn();
                Ok(())
            }
            PagerMode::Dirty => {
                let result = self.do_commit();
                let result = self.latch(result);
                if result.is_ok() {
                    self.end_txn();
                }
                result
            }
        }
    }

    fn do_commit(&mut self) -> Result<()> {
        let root_slot = self.root_slot.expect("transaction holds page 1");
        self.cache.dirty_add(root_slot);
        {
            let mut data = self.cache.frame_data_mut(root_slot);
            let counter = header::get_change_counter(&data);
            header::put_change_counter(&mut data, counter.wrapping_add(1));
            header::put_page_count(&mut data, self.page_count);
        }
        self.flush_dirty(self.page_count)?;
        self.cache.clean_all();
        // The cache now matches the snapshot this commit published.
        self.last_wal_stamp = Some((self.wal.change_counter(), self.wal.salts()));
        self.is_new = false;
        Ok(())
    }

    /// Append every dirty page to the WAL in ascending page order. A
    /// nonzero `commit_size` makes the final frame a commit frame.
    fn flush_dirty(&mut self, commit_size: Pgno) -> Result<()> {
        let slots = self.cache.sorted_dirty();
        if slots.is_empty() {
            return Ok(());
        }
        let guards: Vec<(Pgno, Ref<'_, Vec<u8>>)> = slots
            .iter()
            .map(|&slot| (self.cache.frame_pgno(slot), self.cache.frame_data(slot)))
            .collect();
        let frames: Vec<(Pgno, &[u8])> = guards
            .iter()
            .map(|(pgno, data)| (*pgno, data.as_slice()))
            .collect();
        self.wal.write_frames(&frames, commit_size, self.sync_mode)?;
        self.n_written += frames.len() as u64;
        Ok(())
    }

    /// Abandon the current transaction. All page references except the
    /// pager's own pin must have been released.
    pub fn rollback(&mut self) -> Result<()> {
        match self.mode {
            PagerMode::Open => Ok(()),
            PagerMode::Read | PagerMode::Write => {
                self.end_txn();
                Ok(())
            }
            PagerMode::Dirty | PagerMode::Error => {
                let result = self.do_rollback();
                match result {
                    Ok(()) => {
                        self.status = None;
                        self.end_txn();
                        Ok(())
                    }
                    Err(err) => {
                        // Keep the latch: the only legal next call is
                        // another rollback or close.
                        self.mode = PagerMode::Error;
                        if self.status.is_none() {
                            self.status = Some(err.clone());
                        }
                        Err(err)
                    }
                }
            }
        }
    }

    fn do_rollback(&mut self) -> Result<()> {
        self.wal.undo()?;
        self.root_slot = None;
        // Cached contents are tainted by the dead transaction; drop them
        // all so re-reads resolve against the committed snapshot. Any
        // handle leaked on an error path keeps only its own buffer.
        self.cache.purge();
        self.page_count = self.orig_page_count;
        Ok(())
    }

    /// Copy committed WAL frames into the database file; with `reset`, also
    /// rewind the WAL once no reader depends on it.
    pub fn checkpoint(&mut self, reset: bool) -> Result<(u32, u32)> {
        if self.mode != PagerMode::Open {
            return Err(Error::with_message(
                ErrorCode::InvalidArgument,
                "checkpoint requires no open transaction",
            ));
        }
        let mut busy = self.busy.take();
        let mut proceed = |attempt: u32| match busy.as_mut() {
            Some(handler) => handler(attempt),
            None => false,
        };
        let result = self
            .wal
            .checkpoint(reset, self.sync_mode, &mut proceed);
        drop(proceed);
        self.busy = busy;
        result
    }

    // ========================================================================
    // Page access
    // ========================================================================

    /// Fetch a refcounted reference to page `pgno`, resolving through the
    /// cache, then the WAL snapshot, then the database file. Reading past
    /// the end of the file yields a zero-filled page and extends the
    /// tracked page count.
    pub fn acquire(&mut self, pgno: Pgno) -> Result<PageRef> {
        self.status()?;
        if self.mode == PagerMode::Open {
            return Err(Error::with_message(
                ErrorCode::InvalidArgument,
                "no transaction open",
            ));
        }
        if pgno == 0 || pgno > MAX_PAGE_COUNT {
            return Err(Error::corruption(format!("page number {} out of range", pgno)));
        }

        if let Some(slot) = self.cache.lookup(pgno) {
            self.cache.ref_page(slot);
            return Ok(self.cache.make_ref(slot));
        }

        let result = self.read_page_into_cache(pgno);
        self.latch(result)
    }

    fn read_page_into_cache(&mut self, pgno: Pgno) -> Result<PageRef> {
        let slot = self.grab_frame()?;
        self.cache.register_page(slot, pgno);
        self.cache.ref_page(slot);
        let page = self.cache.make_ref(slot);

        let in_wal = match self.wal.find_frame(pgno) {
            Ok(frame) => frame,
            Err(err) => {
                self.drop_failed_read(page, slot);
                return Err(err);
            }
        };
        let fill = if let Some(frame) = in_wal {
            let mut data = page.data_mut();
            self.wal.read_frame(frame, &mut data)
        } else {
            let offset = i64::from(pgno - 1) * i64::from(self.page_size);
            match self.file.file_size() {
                Ok(size) if offset < size => {
                    let mut data = page.data_mut();
                    match self.file.read(&mut data, offset) {
                        Ok(n) => {
                            data[n..].fill(0);
                            Ok(())
                        }
                        Err(err) => Err(err),
                    }
                }
                Ok(_) => {
                    page.data_mut().fill(0);
                    Ok(())
                }
                Err(err) => Err(err),
            }
        };
        if let Err(err) = fill {
            self.drop_failed_read(page, slot);
            return Err(err);
        }

        self.n_read += 1;
        if pgno > self.page_count {
            self.page_count = pgno;
        }
        Ok(page)
    }

    fn drop_failed_read(&mut self, page: PageRef, slot: usize) {
        drop(page);
        self.cache.unref(slot);
        self.cache.erase(slot);
    }

    /// Find or make room for a new frame. When the pool is full, the LRU
    /// victim is recycled; if everything unpinned is dirty, the dirty list
    /// is spilled to the WAL first.
    fn grab_frame(&mut self) -> Result<usize> {
        if self.cache.occupied() >= self.cache.capacity() {
            if let Some(victim) = self.cache.next_victim() {
                if self.cache.is_dirty(victim) && self.mode == PagerMode::Dirty {
                    self.flush_dirty(0)?;
                    self.cache.clean_all();
                }
            }
            if let Some(victim) = self.cache.next_victim() {
                if !self.cache.is_dirty(victim) {
                    self.cache.erase(victim);
                }
            }
        }
        Ok(self.cache.allocate())
    }

    /// Duplicate a reference to the pinned page 1
    pub fn acquire_root(&mut self) -> PageRef {
        let slot = self.root_slot.expect("transaction holds page 1");
        self.cache.ref_page(slot);
        self.cache.make_ref(slot)
    }

    /// Record that `page` is about to be modified
    pub fn mark_dirty(&mut self, page: &PageRef) -> Result<()> {
        self.status()?;
        match self.mode {
            PagerMode::Write => self.mode = PagerMode::Dirty,
            PagerMode::Dirty => {}
            _ => {
                return Err(Error::with_message(
                    ErrorCode::InvalidArgument,
                    "page write outside a write transaction",
                ))
            }
        }
        self.cache.dirty_add(page.slot);
        Ok(())
    }

    pub fn release(&mut self, page: PageRef) {
        self.release_hint(page, ReleaseHint::Keep);
    }

    pub fn release_hint(&mut self, page: PageRef, hint: ReleaseHint) {
        let slot = page.slot;
        let pgno = page.pgno;
        drop(page);
        if !self.cache.valid_slot(slot, pgno) {
            // The cache was purged since this handle was taken; there is
            // no bookkeeping left to update.
            return;
        }
        self.cache.unref(slot);
        if self.cache.ref_count(slot) > 0 {
            return;
        }
        match hint {
            ReleaseHint::Keep => {}
            ReleaseHint::NoCache => {
                if !self.cache.is_dirty(slot) {
                    self.cache.erase(slot);
                }
            }
            ReleaseHint::Discard => {
                self.cache.dirty_remove(slot);
                self.cache.erase(slot);
            }
        }
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Obtain a fresh writable page: from the freelist when possible,
    /// otherwise by extending the file (stepping over pointer-map pages).
    /// The caller must set the page's pointer-map entry.
    pub fn allocate(&mut self) -> Result<PageRef> {
        self.status()?;
        if self.mode < PagerMode::Write {
            return Err(Error::with_message(
                ErrorCode::InvalidArgument,
                "allocation outside a write transaction",
            ));
        }

        if let Some(pgno) = freelist::pop(self)? {
            let page = self.acquire(pgno)?;
            self.mark_dirty(&page)?;
            return Ok(page);
        }

        let mut pgno = self.page_count + 1;
        if ptrmap::is_map(pgno, self.page_size) {
            // Materialize the pointer-map page so its entries exist on disk.
            let map = self.acquire(pgno)?;
            self.mark_dirty(&map)?;
            self.release(map);
            pgno += 1;
        }
        if pgno > MAX_PAGE_COUNT {
            return Err(Error::with_message(ErrorCode::InvalidArgument, "database is full"));
        }
        let page = self.acquire(pgno)?;
        self.mark_dirty(&page)?;
        Ok(page)
    }

    /// Return `page` to the freelist
    pub fn destroy(&mut self, page: PageRef) -> Result<()> {
        self.status()?;
        if self.mode < PagerMode::Write {
            self.release(page);
            return Err(Error::with_message(
                ErrorCode::InvalidArgument,
                "page free outside a write transaction",
            ));
        }
        let result = freelist::push(self, page);
        self.latch(result)
    }

    /// Shrink the tracked database image (vacuum truncation)
    pub fn set_page_count(&mut self, page_count: Pgno) -> Result<()> {
        debug_assert!(page_count <= self.page_count);
        self.dirty_root()?;
        self.cache.truncate(page_count + 1);
        self.page_count = page_count;
        Ok(())
    }

    // ========================================================================
    // File header fields (cached page 1)
    // ========================================================================

    fn root_data(&self) -> Ref<'_, Vec<u8>> {
        let slot = self.root_slot.expect("transaction holds page 1");
        self.cache.frame_data(slot)
    }

    fn root_data_mut(&self) -> RefMut<'_, Vec<u8>> {
        let slot = self.root_slot.expect("transaction holds page 1");
        self.cache.frame_data_mut(slot)
    }

    fn dirty_root(&mut self) -> Result<()> {
        self.status()?;
        match self.mode {
            PagerMode::Write => self.mode = PagerMode::Dirty,
            PagerMode::Dirty => {}
            _ => {
                return Err(Error::with_message(
                    ErrorCode::InvalidArgument,
                    "header write outside a write transaction",
                ))
            }
        }
        let slot = self.root_slot.expect("transaction holds page 1");
        self.cache.dirty_add(slot);
        Ok(())
    }

    pub fn freelist_head(&self) -> Pgno {
        header::get_freelist_head(&self.root_data())
    }

    pub fn set_freelist_head(&mut self, pgno: Pgno) -> Result<()> {
        self.dirty_root()?;
        header::put_freelist_head(&mut self.root_data_mut(), pgno);
        Ok(())
    }

    pub fn freelist_count(&self) -> u32 {
        header::get_freelist_count(&self.root_data())
    }

    pub fn set_freelist_count(&mut self, count: u32) -> Result<()> {
        self.dirty_root()?;
        header::put_freelist_count(&mut self.root_data_mut(), count);
        Ok(())
    }

    pub fn schema_cookie(&self) -> u32 {
        header::get_schema_cookie(&self.root_data())
    }

    pub fn bump_schema_cookie(&mut self) -> Result<()> {
        self.dirty_root()?;
        let mut data = self.root_data_mut();
        let cookie = header::get_schema_cookie(&data);
        header::put_schema_cookie(&mut data, cookie.wrapping_add(1));
        Ok(())
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use crate::os::vfs::default_vfs;
    use crate::storage::header::FILE_HEADER_SIZE;

    const PAGE: u32 = 512;

    struct Fixture {
        path: String,
    }

    impl Fixture {
        fn new(name: &str) -> Self {
            let path = std::env::temp_dir()
                .join(format!("otterdb-pager-{}", name))
                .to_string_lossy()
                .into_owned();
            for suffix in ["", "-wal", "-shm"] {
                let _ = std::fs::remove_file(format!("{}{}", path, suffix));
            }
            Fixture { path }
        }

        fn open(&self) -> Pager {
            let options = PagerOptions {
                path: self.path.clone(),
                page_size: PAGE,
                cache_size_bytes: PAGE as usize * MIN_CACHE_FRAMES,
                ..Default::default()
            };
            Pager::open(default_vfs(), options).unwrap()
        }

        /// Open the pager and lay down a valid page 1 if this is a fresh
        /// database file.
        fn open_initialized(&self) -> Pager {
            let mut pager = self.open();
            if pager.is_new() {
                pager.begin(true).unwrap();
                let root = pager.acquire_root();
                pager.mark_dirty(&root).unwrap();
                FileHeader::new(PAGE).write(&mut root.data_mut());
                pager.release(root);
                pager.commit().unwrap();
            }
            pager
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            for suffix in ["", "-wal", "-shm"] {
                let _ = std::fs::remove_file(format!("{}{}", self.path, suffix));
            }
        }
    }

    #[test]
    fn test_new_database_initialization() {
        let fx = Fixture::new("init");
        let mut pager = fx.open();
        assert!(pager.is_new());
        assert_eq!(pager.mode(), PagerMode::Open);

        pager.begin(true).unwrap();
        assert_eq!(pager.mode(), PagerMode::Write);
        assert_eq!(pager.page_count(), 1);

        let root = pager.acquire_root();
        pager.mark_dirty(&root).unwrap();
        FileHeader::new(PAGE).write(&mut root.data_mut());
        pager.release(root);
        assert_eq!(pager.mode(), PagerMode::Dirty);
        pager.commit().unwrap();
        assert_eq!(pager.mode(), PagerMode::Open);
        pager.close().unwrap();

        // Reopen and read the committed header back.
        let mut pager = fx.open();
        assert!(!pager.is_new());
        pager.begin(false).unwrap();
        let root = pager.acquire(1).unwrap();
        let hdr = FileHeader::read(&root.data()).unwrap();
        assert_eq!(hdr.page_size, PAGE);
        assert_eq!(hdr.page_count, 1);
        pager.release(root);
        pager.rollback().unwrap();
        pager.close().unwrap();
    }

    #[test]
    fn test_write_read_roundtrip_through_wal() {
        let fx = Fixture::new("roundtrip");
        let mut pager = fx.open_initialized();

        pager.begin(true).unwrap();
        let page = pager.acquire(3).unwrap();
        pager.mark_dirty(&page).unwrap();
        page.data_mut()[FILE_HEADER_SIZE..FILE_HEADER_SIZE + 4].copy_from_slice(b"abcd");
        pager.release(page);
        assert_eq!(pager.page_count(), 3);
        pager.commit().unwrap();

        // Visible in a new transaction without any checkpoint.
        pager.begin(false).unwrap();
        let page = pager.acquire(3).unwrap();
        assert_eq!(&page.data()[FILE_HEADER_SIZE..FILE_HEADER_SIZE + 4], b"abcd");
        pager.release(page);
        pager.rollback().unwrap();
        pager.close().unwrap();
    }

    #[test]
    fn test_rollback_discards_changes() {
        let fx = Fixture::new("rollback");
        let mut pager = fx.open_initialized();

        pager.begin(true).unwrap();
        let page = pager.acquire(2).unwrap();
        pager.mark_dirty(&page).unwrap();
        page.data_mut()[0] = 0xEE;
        pager.release(page);
        pager.rollback().unwrap();

        pager.begin(false).unwrap();
        assert_eq!(pager.page_count(), 1);
        pager.rollback().unwrap();
        pager.close().unwrap();
    }

    #[test]
    fn test_allocate_extends_and_skips_ptrmap() {
        let fx = Fixture::new("alloc");
        let mut pager = fx.open_initialized();

        pager.begin(true).unwrap();
        // Page 2 is the first pointer-map page, so the first allocation
        // must yield page 3.
        let page = pager.allocate().unwrap();
        assert_eq!(page.pgno, 3);
        pager.release(page);
        assert_eq!(pager.page_count(), 3);

        let page = pager.allocate().unwrap();
        assert_eq!(page.pgno, 4);
        pager.release(page);
        pager.commit().unwrap();
        pager.close().unwrap();
    }

    #[test]
    fn test_destroy_then_allocate_reuses_page() {
        let fx = Fixture::new("freelist");
        let mut pager = fx.open_initialized();

        pager.begin(true).unwrap();
        let a = pager.allocate().unwrap();
        let b = pager.allocate().unwrap();
        let (pgno_a, pgno_b) = (a.pgno, b.pgno);
        pager.release(a);
        pager.destroy(b).unwrap();
        assert_eq!(pager.freelist_count(), 1);

        let again = pager.allocate().unwrap();
        assert_eq!(again.pgno, pgno_b);
        assert_ne!(again.pgno, pgno_a);
        assert_eq!(pager.freelist_count(), 0);
        pager.release(again);
        pager.commit().unwrap();
        pager.close().unwrap();
    }

    #[test]
    fn test_cache_spill_keeps_transaction_alive() {
        let fx = Fixture::new("spill");
        let mut pager = fx.open_initialized();

        pager.begin(true).unwrap();
        // Touch several times the cache capacity worth of pages.
        let total = (MIN_CACHE_FRAMES * 3) as Pgno;
        let mut expected = Vec::new();
        for i in 0..total {
            let page = pager.allocate().unwrap();
            pager.mark_dirty(&page).unwrap();
            let tag = (i % 251) as u8;
            page.data_mut().fill(tag);
            expected.push((page.pgno, tag));
            pager.release(page);
        }
        pager.commit().unwrap();

        pager.begin(false).unwrap();
        for (pgno, tag) in expected {
            let page = pager.acquire(pgno).unwrap();
            assert!(page.data().iter().all(|&b| b == tag), "page {}", pgno);
            pager.release(page);
        }
        pager.rollback().unwrap();
        pager.close().unwrap();
    }

    #[test]
    fn test_checkpoint_then_read_from_file() {
        let fx = Fixture::new("ckpt");
        let mut pager = fx.open_initialized();

        pager.begin(true).unwrap();
        let page = pager.acquire(2).unwrap();
        pager.mark_dirty(&page).unwrap();
        page.data_mut().fill(0x77);
        pager.release(page);
        pager.commit().unwrap();

        let (_, copied) = pager.checkpoint(true).unwrap();
        assert!(copied >= 1);

        pager.begin(false).unwrap();
        let page = pager.acquire(2).unwrap();
        assert!(page.data().iter().all(|&b| b == 0x77));
        pager.release(page);
        pager.rollback().unwrap();
        pager.close().unwrap();
    }

    #[test]
    fn test_error_latch_blocks_until_rollback() {
        let fx = Fixture::new("latch");
        let mut pager = fx.open_initialized();

        pager.begin(true).unwrap();
        let page = pager.acquire(2).unwrap();
        pager.mark_dirty(&page).unwrap();
        pager.release(page);

        pager.set_status(&Error::corruption("synthetic fault"));
        assert!(pager.acquire(2).unwrap_err().is_corruption());
        assert!(pager.commit().unwrap_err().is_corruption());

        pager.rollback().unwrap();
        assert!(pager.status().is_ok());
        pager.begin(false).unwrap();
        pager.rollback().unwrap();
        pager.close().unwrap();
    }

    #[test]
    fn test_second_connection_sees_committed_state() {
        let fx = Fixture::new("twoconn");
        let mut writer = fx.open_initialized();
        let mut reader = fx.open();

        writer.begin(true).unwrap();
        let page = writer.acquire(2).unwrap();
        writer.mark_dirty(&page).unwrap();
        page.data_mut().fill(0x42);
        writer.release(page);
        writer.commit().unwrap();

        reader.begin(false).unwrap();
        let page = reader.acquire(2).unwrap();
        assert!(page.data().iter().all(|&b| b == 0x42));
        reader.release(page);
        reader.rollback().unwrap();

        reader.close().unwrap();
        writer.close().unwrap();
    }
}
