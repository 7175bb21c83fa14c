//! Public database facade
//!
//! A thin dispatcher over the storage core: `Db` owns the pager and schema,
//! `Txn` scopes one transaction, `Bucket` and `Cursor` are handles that
//! become unusable once their transaction ends (operations return
//! InvalidArgument instead of touching freed state).

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Error, ErrorCode, Result};
use crate::schema::Schema;
use crate::storage::btree::cursor::Cursor as TreeCursor;
use crate::storage::btree::node::Node;
use crate::storage::btree::Tree;
use crate::storage::header::FileHeader;
use crate::storage::pager::{Pager, PagerMode, PagerOptions};
use crate::types::{
    is_valid_page_size, BusyHandler, LockMode, SyncMode, DEFAULT_CACHE_SIZE, DEFAULT_PAGE_SIZE,
    MIN_CACHE_FRAMES,
};

// ============================================================================
// Options
// ============================================================================

/// Database configuration
pub struct Options {
    /// Page size: a power of two in [512, 65536]. An existing database's
    /// page size always wins.
    pub page_size: u32,
    /// Page cache budget in bytes
    pub cache_size_bytes: usize,
    /// How aggressively files are synced
    pub sync_mode: SyncMode,
    /// Whether the file lock is held across transactions
    pub lock_mode: LockMode,
    pub create_if_missing: bool,
    pub error_if_exists: bool,
    pub readonly: bool,
    /// Called with an attempt counter while a lock is contended; return
    /// false to give up with Busy.
    pub busy_handler: Option<BusyHandler>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
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
// Db
// ============================================================================

/// An open database connection
pub struct Db {
    pager: Rc<RefCell<Pager>>,
    schema: Rc<RefCell<Schema>>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish()
    }
}

impl Db {
    /// Open (or create) the database at `path`
    pub fn open(path: &str, options: Options) -> Result<Db> {
        if !is_valid_page_size(options.page_size) {
            return Err(Error::with_message(
                ErrorCode::InvalidArgument,
                format!("invalid page size {}", options.page_size),
            ));
        }
        if options.cache_size_bytes < options.page_size as usize * MIN_CACHE_FRAMES {
            return Err(Error::with_message(
                ErrorCode::InvalidArgument,
                "cache size is below the minimum",
            ));
        }

        let pager_options = PagerOptions {
            path: path.to_string(),
            page_size: options.page_size,
            cache_size_bytes: options.cache_size_bytes,
            sync_mode: options.sync_mode,
            lock_mode: options.lock_mode,
            create_if_missing: options.create_if_missing,
            error_if_exists: options.error_if_exists,
            readonly: options.readonly,
            busy_handler: options.busy_handler,
        };
        let mut pager = Pager::open(crate::os::vfs::default_vfs(), pager_options)?;

        if pager.is_new() {
            if options.readonly {
                return Err(Error::with_message(
                    ErrorCode::InvalidArgument,
                    "cannot create a read-only database",
                ));
            }
            pager.begin(true)?;
            // Re-check: an empty database file whose pages all still sit
            // in the WAL is not actually new.
            if pager.is_new() {
                // Lay down page 1: file header plus the empty schema root.
                let result = (|pager: &mut Pager| -> Result<()> {
                    let root = pager.acquire_root();
                    pager.mark_dirty(&root)?;
                    FileHeader::new(pager.page_size()).write(&mut root.data_mut());
                    let node = Node::from_new_page(root, pager.page_size(), true);
                    pager.release(node.page);
                    Ok(())
                })(&mut pager);
                if let Err(err) = result {
                    let _ = pager.rollback();
                    return Err(err);
                }
                pager.commit()?;
            } else {
                pager.rollback()?;
            }
        }

        let page_size = pager.page_size();
        Ok(Db {
            pager: Rc::new(RefCell::new(pager)),
            schema: Rc::new(RefCell::new(Schema::new(page_size))),
        })
    }

    /// Begin a read or write transaction. Only one transaction may be
    /// open per connection.
    pub fn begin_txn(&self, write: bool) -> Result<Txn> {
        let mut pager = self.pager.borrow_mut();
        pager.begin(write)?;
        let txn_id = pager.txn_id();
        drop(pager);
        Ok(Txn {
            pager: Rc::clone(&self.pager),
            schema: Rc::clone(&self.schema),
            txn_id,
            write,
            finished: false,
        })
    }

    /// Run a WAL checkpoint; with `reset`, also rewind the log once no
    /// reader depends on it. Returns (frames in the log, frames copied).
    pub fn checkpoint(&self, reset: bool) -> Result<(u32, u32)> {
        self.pager.borrow_mut().checkpoint(reset)
    }

    pub fn cache_hits(&self) -> u64 {
        self.pager.borrow().cache_hits()
    }

    pub fn cache_misses(&self) -> u64 {
        self.pager.borrow().cache_misses()
    }

    /// Close the connection. Any open transaction is rolled back.
    pub fn close(self) -> Result<()> {
        self.pager.borrow_mut().close()
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        let _ = self.pager.borrow_mut().close();
    }
}

// ============================================================================
// Txn
// ============================================================================

/// A transaction on a database connection
pub struct Txn {
    pager: Rc<RefCell<Pager>>,
    schema: Rc<RefCell<Schema>>,
    txn_id: u64,
    write: bool,
    finished: bool,
}

impl std::fmt::Debug for Txn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("txn_id", &self.txn_id)
            .field("write", &self.write)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Txn {
    fn check_active(&self) -> Result<()> {
        let pager = self.pager.borrow();
        if self.finished || pager.txn_id() != self.txn_id || pager.mode() == PagerMode::Open {
            return Err(Error::with_message(
                ErrorCode::InvalidArgument,
                "transaction is no longer active",
            ));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_active()?;
        if !self.write {
            return Err(Error::with_message(
                ErrorCode::InvalidArgument,
                "transaction is read-only",
            ));
        }
        Ok(())
    }

    /// Create a bucket (opening it when it already exists)
    pub fn create_bucket(&self, name: &[u8]) -> Result<Bucket> {
        self.check_writable()?;
        let tree = self.schema.borrow_mut().create_bucket(
            &mut self.pager.borrow_mut(),
            name,
            false,
        )?;
        Ok(self.bucket_handle(tree))
    }

    /// Open an existing bucket
    pub fn open_bucket(&self, name: &[u8]) -> Result<Bucket> {
        self.check_active()?;
        let tree = self
            .schema
            .borrow_mut()
            .open_bucket(&mut self.pager.borrow_mut(), name)?;
        Ok(self.bucket_handle(tree))
    }

    /// Drop a bucket, freeing its pages (deferred while handles are open)
    pub fn drop_bucket(&self, name: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.schema
            .borrow_mut()
            .drop_bucket(&mut self.pager.borrow_mut(), name)
    }

    /// Compact the database file
    pub fn vacuum(&self) -> Result<()> {
        self.check_writable()?;
        self.schema.borrow_mut().vacuum(&mut self.pager.borrow_mut())
    }

    fn bucket_handle(&self, tree: Rc<RefCell<Tree>>) -> Bucket {
        Bucket {
            tree,
            pager: Rc::clone(&self.pager),
            schema: Rc::clone(&self.schema),
            txn_id: self.txn_id,
        }
    }

    /// Commit the transaction
    pub fn commit(mut self) -> Result<()> {
        self.check_active()?;
        let mut pager = self.pager.borrow_mut();
        let mut schema = self.schema.borrow_mut();
        if self.write {
            schema.finish_pending_drops(&mut pager)?;
        }
        schema.reset();
        let result = pager.commit();
        if result.is_err() {
            // The handle is consumed either way; don't leave the pager
            // latched with no way to clear it.
            let _ = pager.rollback();
        }
        self.finished = true;
        result
    }

    /// Abandon the transaction
    pub fn rollback(mut self) -> Result<()> {
        let mut pager = self.pager.borrow_mut();
        self.schema.borrow_mut().reset();
        let result = pager.rollback();
        self.finished = true;
        result
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        if !self.finished {
            if let Ok(mut pager) = self.pager.try_borrow_mut() {
                if pager.txn_id() == self.txn_id {
                    self.schema.borrow_mut().reset();
                    let _ = pager.rollback();
                }
            }
        }
    }
}

// ============================================================================
// Bucket
// ============================================================================

/// A handle to one named tree, valid for the lifetime of its transaction
pub struct Bucket {
    tree: Rc<RefCell<Tree>>,
    pager: Rc<RefCell<Pager>>,
    schema: Rc<RefCell<Schema>>,
    txn_id: u64,
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("txn_id", &self.txn_id)
            .finish()
    }
}

impl Bucket {
    fn check_active(&self) -> Result<()> {
        let pager = self.pager.borrow();
        if pager.txn_id() != self.txn_id || pager.mode() == PagerMode::Open {
            return Err(Error::with_message(
                ErrorCode::InvalidArgument,
                "bucket's transaction is no longer active",
            ));
        }
        Ok(())
    }

    /// Store `value` under `key`, replacing any existing record
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_active()?;
        self.tree
            .borrow_mut()
            .put(&mut self.pager.borrow_mut(), key, value)
    }

    /// Fetch the value stored under `key`
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_active()?;
        self.tree
            .borrow_mut()
            .get(&mut self.pager.borrow_mut(), key)
    }

    /// Remove the record under `key`; NotFound when absent
    pub fn erase(&self, key: &[u8]) -> Result<()> {
        self.check_active()?;
        self.tree
            .borrow_mut()
            .erase(&mut self.pager.borrow_mut(), key)
    }

    /// Open a cursor over this bucket
    pub fn new_cursor(&self) -> Cursor {
        let tree = self.tree.borrow();
        Cursor {
            inner: TreeCursor::new(tree.root_cell(), tree.epoch(), tree.page_size()),
            pager: Rc::clone(&self.pager),
            txn_id: self.txn_id,
        }
    }
}

impl Drop for Bucket {
    fn drop(&mut self) {
        // Only report the release while the owning transaction is still
        // around; afterwards the schema has already forgotten the handle.
        if let (Ok(mut pager), Ok(mut schema)) =
            (self.pager.try_borrow_mut(), self.schema.try_borrow_mut())
        {
            if pager.txn_id() == self.txn_id && pager.mode() != PagerMode::Open {
                let root = self.tree.borrow().root();
                let _ = schema.release_bucket(&mut pager, root);
            }
        }
    }
}

// ============================================================================
// Cursor
// ============================================================================

/// An ordered cursor over one bucket
pub struct Cursor {
    inner: TreeCursor,
    pager: Rc<RefCell<Pager>>,
    txn_id: u64,
}

impl Cursor {
    fn check_active(&self) -> Result<()> {
        let pager = self.pager.borrow();
        if pager.txn_id() != self.txn_id || pager.mode() == PagerMode::Open {
            return Err(Error::with_message(
                ErrorCode::InvalidArgument,
                "cursor's transaction is no longer active",
            ));
        }
        Ok(())
    }

    /// Position at the first record with key >= `key`
    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.check_active()?;
        self.inner.seek(&mut self.pager.borrow_mut(), key)
    }

    /// Position at the record with exactly `key`; NotFound when absent
    pub fn find(&mut self, key: &[u8]) -> Result<()> {
        self.check_active()?;
        self.inner.find(&mut self.pager.borrow_mut(), key)
    }

    pub fn seek_first(&mut self) -> Result<()> {
        self.check_active()?;
        self.inner.seek_first(&mut self.pager.borrow_mut())
    }

    pub fn seek_last(&mut self) -> Result<()> {
        self.check_active()?;
        self.inner.seek_last(&mut self.pager.borrow_mut())
    }

    pub fn next(&mut self) -> Result<()> {
        self.check_active()?;
        self.inner.next(&mut self.pager.borrow_mut())
    }

    pub fn previous(&mut self) -> Result<()> {
        self.check_active()?;
        self.inner.previous(&mut self.pager.borrow_mut())
    }

    /// True when positioned on a record
    pub fn is_valid(&self) -> bool {
        self.check_active().is_ok() && self.inner.is_valid()
    }

    /// The latched navigation error, if any
    pub fn status(&self) -> Result<()> {
        self.inner.status()
    }

    /// Key of the current record (requires `is_valid`)
    pub fn key(&self) -> &[u8] {
        self.inner.key()
    }

    /// Value of the current record (requires `is_valid`)
    pub fn value(&self) -> &[u8] {
        self.inner.value()
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        match self.pager.try_borrow_mut() {
            Ok(mut pager) if pager.txn_id() == self.txn_id && pager.mode() != PagerMode::Open => {
                self.inner.clear(&mut pager);
            }
            _ => self.inner.forget(),
        }
    }
}
