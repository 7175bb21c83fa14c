//! Cursor navigation over a tree
//!
//! A cursor pins one leaf node and an index into it, with the current
//! record's key and value copied into cursor-owned buffers. When the tree
//! is modified the cursor's node may be restructured, so every cursor
//! watches the tree's epoch counter: a stale cursor re-seeks to its saved
//! key before moving. Forward and backward steps otherwise follow the leaf
//! sibling links directly.

use crate::error::{Error, ErrorCode, Result};
use crate::storage::btree::node::Node;
use crate::storage::btree::{
    read_payload, rightmost_leaf, seek_to_leaf, RootId, TreeEpoch,
};
use crate::storage::pager::Pager;
use crate::types::Pgno;

pub struct Cursor {
    root: RootId,
    epoch: TreeEpoch,
    page_size: u32,

    node: Option<Node>,
    index: u32,
    /// Epoch the pinned position was loaded under
    seen_epoch: u64,

    key_buf: Vec<u8>,
    value_buf: Vec<u8>,
    has_payload: bool,

    /// Latched I/O or corruption error
    status: Option<Error>,
}

impl Cursor {
    pub(crate) fn new(root: RootId, epoch: TreeEpoch, page_size: u32) -> Self {
        Cursor {
            root,
            epoch,
            page_size,
            node: None,
            index: 0,
            seen_epoch: 0,
            key_buf: Vec::new(),
            value_buf: Vec::new(),
            has_payload: false,
            status: None,
        }
    }

    // ========================================================================
    // State
    // ========================================================================

    /// True when the cursor is positioned on a record
    pub fn is_valid(&self) -> bool {
        self.status.is_none() && self.has_payload
    }

    /// The latched navigation error, if any
    pub fn status(&self) -> Result<()> {
        match &self.status {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Key of the current record. Only meaningful when `is_valid`.
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.is_valid());
        &self.key_buf
    }

    /// Value of the current record. Only meaningful when `is_valid`.
    pub fn value(&self) -> &[u8] {
        debug_assert!(self.is_valid());
        &self.value_buf
    }

    /// Release the pinned node and forget the position
    pub fn clear(&mut self, pager: &mut Pager) {
        if let Some(node) = self.node.take() {
            pager.release(node.page);
        }
        self.has_payload = false;
        self.status = None;
    }

    /// Drop the pinned node without touching the pager, for cursors that
    /// outlive their transaction (the cache has been purged by then).
    pub fn forget(&mut self) {
        self.node = None;
        self.has_payload = false;
    }

    fn latch(&mut self, pager: &mut Pager, err: Error) -> Error {
        pager.set_status(&err);
        if self.status.is_none()
            && matches!(err.code(), ErrorCode::IoErr | ErrorCode::Corruption)
        {
            self.status = Some(err.clone());
        }
        self.has_payload = false;
        if let Some(node) = self.node.take() {
            pager.release(node.page);
        }
        err
    }

    /// Reaches the end of iteration: invalid position, no error
    fn settle_invalid(&mut self, pager: &mut Pager) {
        if let Some(node) = self.node.take() {
            pager.release(node.page);
        }
        self.has_payload = false;
    }

    // ========================================================================
    // Positioning
    // ========================================================================

    /// Position at the first record with key >= `key`
    pub fn seek(&mut self, pager: &mut Pager, key: &[u8]) -> Result<()> {
        self.status()?;
        match self.seek_inner(pager, key) {
            Ok(_) => Ok(()),
            Err(err) => Err(self.latch(pager, err)),
        }
    }

    /// Position at the record with exactly `key`
    pub fn find(&mut self, pager: &mut Pager, key: &[u8]) -> Result<()> {
        self.status()?;
        match self.seek_inner(pager, key) {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.settle_invalid(pager);
                Err(Error::new(ErrorCode::NotFound))
            }
            Err(err) => Err(self.latch(pager, err)),
        }
    }

    /// Position at the smallest key in the tree
    pub fn seek_first(&mut self, pager: &mut Pager) -> Result<()> {
        self.status()?;
        match self.seek_inner(pager, &[]) {
            Ok(_) => Ok(()),
            Err(err) => Err(self.latch(pager, err)),
        }
    }

    /// Position at the largest key in the tree
    pub fn seek_last(&mut self, pager: &mut Pager) -> Result<()> {
        self.status()?;
        if let Some(node) = self.node.take() {
            pager.release(node.page);
        }
        let result = (|| -> Result<()> {
            let node = rightmost_leaf(pager, self.page_size, self.root.get())?;
            if node.cell_count() == 0 {
                pager.release(node.page);
                self.has_payload = false;
                return Ok(());
            }
            self.index = node.cell_count() - 1;
            self.node = Some(node);
            self.load_payload(pager)
        })();
        match result {
            Ok(()) => Ok(()),
            Err(err) => Err(self.latch(pager, err)),
        }
    }

    /// Seek to the leaf position for `key`; returns whether the match was
    /// exact. Lands invalid at end-of-tree.
    fn seek_inner(&mut self, pager: &mut Pager, key: &[u8]) -> Result<bool> {
        if let Some(node) = self.node.take() {
            pager.release(node.page);
        }
        self.has_payload = false;

        let mut path = Vec::new();
        let (node, index, exact) =
            seek_to_leaf(pager, self.page_size, self.root.get(), key, &mut path)?;
        self.node = Some(node);
        self.index = index;
        if !self.settle_forward(pager)? {
            return Ok(false);
        }
        self.load_payload(pager)?;
        Ok(exact)
    }

    /// If the index points one past the last cell, move to the start of
    /// the right sibling. Returns false at end-of-tree.
    fn settle_forward(&mut self, pager: &mut Pager) -> Result<bool> {
        loop {
            let node = self.node.as_ref().expect("cursor holds a node");
            if self.index < node.cell_count() {
                return Ok(true);
            }
            let next: Pgno = node.next_id();
            let node = self.node.take().expect("cursor holds a node");
            pager.release(node.page);
            if next == 0 {
                self.has_payload = false;
                return Ok(false);
            }
            let page = pager.acquire(next)?;
            self.node = Some(Node::from_existing_page(page, self.page_size)?);
            self.index = 0;
        }
    }

    /// Copy the current record into the cursor buffers
    fn load_payload(&mut self, pager: &mut Pager) -> Result<()> {
        let node = self.node.as_ref().expect("cursor holds a node");
        let cell = node.read_cell(self.index)?;
        read_payload(
            pager,
            self.page_size,
            node,
            &cell,
            0,
            cell.key_size as usize,
            &mut self.key_buf,
        )?;
        read_payload(
            pager,
            self.page_size,
            node,
            &cell,
            cell.key_size as usize,
            (cell.total_pl - cell.key_size) as usize,
            &mut self.value_buf,
        )?;
        self.has_payload = true;
        self.seen_epoch = self.epoch.get();
        Ok(())
    }

    // ========================================================================
    // Iteration
    // ========================================================================

    /// Advance to the next record in key order
    pub fn next(&mut self, pager: &mut Pager) -> Result<()> {
        self.status()?;
        if !self.has_payload {
            return Err(Error::with_message(
                ErrorCode::InvalidArgument,
                "cursor is not positioned",
            ));
        }
        let result = (|| -> Result<()> {
            if self.stale() {
                // The tree changed: return to the saved key. Landing on a
                // different key means the saved one was erased and the
                // cursor already sits on its successor.
                let saved = std::mem::take(&mut self.key_buf);
                let exact = self.seek_inner(pager, &saved)?;
                if !exact {
                    return Ok(());
                }
            }
            self.index += 1;
            if !self.settle_forward(pager)? {
                return Ok(());
            }
            self.load_payload(pager)
        })();
        match result {
            Ok(()) => Ok(()),
            Err(err) => Err(self.latch(pager, err)),
        }
    }

    /// Step to the previous record in key order
    pub fn previous(&mut self, pager: &mut Pager) -> Result<()> {
        self.status()?;
        if !self.has_payload {
            return Err(Error::with_message(
                ErrorCode::InvalidArgument,
                "cursor is not positioned",
            ));
        }
        let result = (|| -> Result<()> {
            if self.stale() {
                let saved = std::mem::take(&mut self.key_buf);
                let landed = self.seek_inner(pager, &saved);
                match landed {
                    Ok(_) => {
                        if self.node.is_none() {
                            // Saved key was past the new end: the last
                            // record is its predecessor.
                            return self.seek_last_inner(pager);
                        }
                        // Positioned at saved key or its successor; the
                        // predecessor is one step back either way.
                    }
                    Err(err) => return Err(err),
                }
            }
            self.step_back(pager)
        })();
        match result {
            Ok(()) => Ok(()),
            Err(err) => Err(self.latch(pager, err)),
        }
    }

    fn seek_last_inner(&mut self, pager: &mut Pager) -> Result<()> {
        let node = rightmost_leaf(pager, self.page_size, self.root.get())?;
        if node.cell_count() == 0 {
            pager.release(node.page);
            self.has_payload = false;
            return Ok(());
        }
        self.index = node.cell_count() - 1;
        self.node = Some(node);
        self.load_payload(pager)
    }

    fn step_back(&mut self, pager: &mut Pager) -> Result<()> {
        if self.index > 0 {
            self.index -= 1;
            return self.load_payload(pager);
        }
        let node = self.node.take().expect("cursor holds a node");
        let prev: Pgno = node.prev_id();
        pager.release(node.page);
        if prev == 0 {
            self.has_payload = false;
            return Ok(());
        }
        let page = pager.acquire(prev)?;
        let node = Node::from_existing_page(page, self.page_size)?;
        if node.cell_count() == 0 {
            pager.release(node.page);
            return Err(Error::corruption("empty leaf in sibling chain"));
        }
        self.index = node.cell_count() - 1;
        self.node = Some(node);
        self.load_payload(pager)
    }

    fn stale(&self) -> bool {
        self.node.is_none() || self.seen_epoch != self.epoch.get()
    }
}
