//! Bucket namespace
//!
//! The schema is a distinguished tree rooted at page 1 whose values are the
//! 4-byte root page numbers of user buckets. Open buckets are tracked by
//! root id so that every handle to the same bucket shares one tree object;
//! dropping a bucket with live handles defers the page reclamation until the
//! last handle goes away (or the transaction commits).
//!
//! Vacuum support: relocated roots are recorded while the file is compacted
//! and flushed here afterwards — the schema rewrites the affected name
//! entries and retargets the shared root cells, so open handles observe the
//! new root ids immediately.

use std::cell::{Cell as StdCell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{Error, ErrorCode, Result};
use crate::storage::btree::{self, cursor::Cursor, Tree};
use crate::storage::pager::Pager;
use crate::types::Pgno;
use crate::util::encoding::get_u32;

/// Longest accepted bucket name
pub const MAX_BUCKET_NAME: usize = 1024;

/// Schema tree root page
pub const SCHEMA_ROOT: Pgno = 1;

struct OpenBucket {
    tree: Rc<RefCell<Tree>>,
    refs: usize,
    /// Bucket was dropped while handles were still open
    dropped: bool,
}

pub struct Schema {
    map: Tree,
    page_size: u32,
    buckets: HashMap<Pgno, OpenBucket>,
    /// old root → new root relocations from an in-progress vacuum
    reroots: HashMap<Pgno, Pgno>,
}

fn check_name(name: &[u8]) -> Result<()> {
    if name.is_empty() || name.len() > MAX_BUCKET_NAME {
        return Err(Error::with_message(
            ErrorCode::InvalidArgument,
            "invalid bucket name",
        ));
    }
    Ok(())
}

fn decode_root(value: &[u8]) -> Result<Pgno> {
    if value.len() != 4 {
        return Err(Error::corruption("bucket root entry is corrupted"));
    }
    Ok(get_u32(value))
}

impl Schema {
    pub fn new(page_size: u32) -> Self {
        Schema {
            map: Tree::new(Rc::new(StdCell::new(SCHEMA_ROOT)), page_size),
            page_size,
            buckets: HashMap::new(),
            reroots: HashMap::new(),
        }
    }

    /// Number of buckets with open handles
    pub fn live_buckets(&self) -> usize {
        self.buckets.len()
    }

    // ========================================================================
    // Bucket lifecycle
    // ========================================================================

    /// Open an existing bucket
    pub fn open_bucket(&mut self, pager: &mut Pager, name: &[u8]) -> Result<Rc<RefCell<Tree>>> {
        check_name(name)?;
        match self.map.get(pager, name)? {
            Some(value) => {
                let root = decode_root(&value)?;
                Ok(self.acquire_handle(root))
            }
            None => Err(Error::with_message(
                ErrorCode::NotFound,
                "bucket does not exist",
            )),
        }
    }

    /// Create a bucket, or open it when it already exists (unless
    /// `error_if_exists` demands a fresh one).
    pub fn create_bucket(
        &mut self,
        pager: &mut Pager,
        name: &[u8],
        error_if_exists: bool,
    ) -> Result<Rc<RefCell<Tree>>> {
        check_name(name)?;
        let root = match self.map.get(pager, name)? {
            Some(value) => {
                if error_if_exists {
                    return Err(Error::with_message(
                        ErrorCode::InvalidArgument,
                        "bucket already exists",
                    ));
                }
                decode_root(&value)?
            }
            None => {
                let root = Tree::create(pager)?;
                self.map.put(pager, name, &root.to_le_bytes())?;
                pager.bump_schema_cookie()?;
                root
            }
        };
        Ok(self.acquire_handle(root))
    }

    /// Remove a bucket's name entry. Its pages return to the freelist now,
    /// or when the last open handle releases.
    pub fn drop_bucket(&mut self, pager: &mut Pager, name: &[u8]) -> Result<()> {
        check_name(name)?;
        let value = self.map.get(pager, name)?.ok_or_else(|| {
            Error::with_message(ErrorCode::NotFound, "bucket does not exist")
        })?;
        let root = decode_root(&value)?;
        self.map.erase(pager, name)?;
        pager.bump_schema_cookie()?;

        match self.buckets.get_mut(&root) {
            Some(bucket) if bucket.refs > 0 => {
                bucket.dropped = true;
                Ok(())
            }
            _ => {
                self.buckets.remove(&root);
                self.destroy_tree(pager, root)
            }
        }
    }

    /// A handle to the bucket rooted at `root` was closed
    pub fn release_bucket(&mut self, pager: &mut Pager, root: Pgno) -> Result<()> {
        if let Some(bucket) = self.buckets.get_mut(&root) {
            bucket.refs = bucket.refs.saturating_sub(1);
            if bucket.refs == 0 {
                let dropped = bucket.dropped;
                self.buckets.remove(&root);
                if dropped {
                    return self.destroy_tree(pager, root);
                }
            }
        }
        Ok(())
    }

    /// Reclaim the pages of buckets dropped while handles were open.
    /// Called before commit; the handles die with the transaction anyway.
    pub fn finish_pending_drops(&mut self, pager: &mut Pager) -> Result<()> {
        let pending: Vec<Pgno> = self
            .buckets
            .iter()
            .filter(|(_, b)| b.dropped)
            .map(|(&root, _)| root)
            .collect();
        for root in pending {
            self.buckets.remove(&root);
            self.destroy_tree(pager, root)?;
        }
        Ok(())
    }

    /// Forget all open-bucket state at transaction end
    pub fn reset(&mut self) {
        self.buckets.clear();
        self.reroots.clear();
    }

    fn acquire_handle(&mut self, root: Pgno) -> Rc<RefCell<Tree>> {
        let page_size = self.page_size;
        let bucket = self.buckets.entry(root).or_insert_with(|| OpenBucket {
            tree: Rc::new(RefCell::new(Tree::new(
                Rc::new(StdCell::new(root)),
                page_size,
            ))),
            refs: 0,
            dropped: false,
        });
        bucket.refs += 1;
        Rc::clone(&bucket.tree)
    }

    fn destroy_tree(&mut self, pager: &mut Pager, root: Pgno) -> Result<()> {
        let mut tree = Tree::new(Rc::new(StdCell::new(root)), self.page_size);
        tree.destroy(pager)
    }

    // ========================================================================
    // Vacuum
    // ========================================================================

    /// Compact the database file, then flush root relocations into the
    /// schema tree and the open handles.
    pub fn vacuum(&mut self, pager: &mut Pager) -> Result<()> {
        self.reroots.clear();
        btree::vacuum_db(pager, &mut self.reroots)?;
        // Pages may have moved under any open cursor.
        self.map.invalidate_cursors();
        for bucket in self.buckets.values() {
            bucket.tree.borrow().invalidate_cursors();
        }
        self.vacuum_finish(pager)
    }

    fn vacuum_finish(&mut self, pager: &mut Pager) -> Result<()> {
        if self.reroots.is_empty() {
            return Ok(());
        }

        // Rewrite every schema entry whose root moved.
        let mut renamed: Vec<(Vec<u8>, Pgno)> = Vec::new();
        {
            let mut cursor = Cursor::new(self.map.root_cell(), self.map.epoch(), self.page_size);
            cursor.seek_first(pager)?;
            while cursor.is_valid() {
                let root = decode_root(cursor.value())?;
                if let Some(&new_root) = self.reroots.get(&root) {
                    renamed.push((cursor.key().to_vec(), new_root));
                }
                cursor.next(pager)?;
            }
            cursor.clear(pager);
        }
        for (name, new_root) in renamed {
            self.map.put(pager, &name, &new_root.to_le_bytes())?;
        }

        // Retarget live handles: the shared root cell moves every open
        // tree and cursor to the new page in one store.
        for (&old_root, &new_root) in &self.reroots {
            if let Some(bucket) = self.buckets.remove(&old_root) {
                bucket.tree.borrow().root_cell().set(new_root);
                self.buckets.insert(new_root, bucket);
            }
        }
        self.reroots.clear();
        Ok(())
    }
}
