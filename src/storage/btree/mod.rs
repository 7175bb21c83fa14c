//! B⁺-tree over pager-managed pages
//!
//! Each tree ("bucket") is identified by its root page number. Leaf cells
//! hold key/value records; internal cells hold pivot keys with left-child
//! pointers, and a node's rightmost child lives in the header's next field.
//! Large payloads spill onto overflow chains. Structural changes keep the
//! pointer map in step so vacuum can relocate any page.
//!
//! Pivots are truncated: a leaf split promotes the shortest prefix of the
//! right sibling's first key that still orders strictly after the left
//! sibling's last key. Internal-node invariant: keys in the left subtree
//! are < pivot, keys in the right subtree are >= pivot.

pub mod cursor;
pub mod node;

use std::cell::Cell as StdCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{Error, ErrorCode, Result};
use crate::storage::freelist;
use crate::storage::header::FILE_HEADER_SIZE;
use crate::storage::pager::{Pager, ReleaseHint};
use crate::storage::ptrmap::{self, Entry, PageKind};
use crate::types::Pgno;
use crate::util::encoding::{get_u32, put_u32};

use node::{build_internal_cell, build_leaf_cell, compute_local_pl_size, DetachedCell, Node};

/// Deepest tree this implementation will follow before declaring corruption
pub const MAX_TREE_DEPTH: usize = 20;

/// Shared, retargetable root page number. The schema rewrites the cell when
/// vacuum relocates a bucket's root, and every open handle observes the new
/// location immediately.
pub type RootId = Rc<StdCell<Pgno>>;

/// Shared modification counter; cursors revalidate their position when the
/// tree changes underneath them.
pub type TreeEpoch = Rc<StdCell<u64>>;

/// A cell that did not fit in its node, waiting to be resolved by splits
struct OvflCell {
    cell: DetachedCell,
    /// Node that could not hold the cell
    pgno: Pgno,
    /// Intended cell index within that node
    index: u32,
}

// ============================================================================
// Tree
// ============================================================================

pub struct Tree {
    root: RootId,
    page_size: u32,
    epoch: TreeEpoch,
    /// Defragmentation scratch page
    scratch: Vec<u8>,
    /// Pending overflow cell during structural modification
    ovfl: Option<OvflCell>,
    /// Descent path: (page id, child/cell index) per level, root first
    path: Vec<(Pgno, u32)>,
    /// Level of the node currently being rebalanced
    level: usize,
    bytes_read: u64,
    bytes_written: u64,
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("page_size", &self.page_size)
            .field("level", &self.level)
            .finish()
    }
}

impl Tree {
    pub fn new(root: RootId, page_size: u32) -> Self {
        Tree {
            root,
            page_size,
            epoch: Rc::new(StdCell::new(0)),
            scratch: Vec::new(),
            ovfl: None,
            path: Vec::new(),
            level: 0,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    /// Allocate an empty leaf root for a new tree
    pub fn create(pager: &mut Pager) -> Result<Pgno> {
        let page_size = pager.page_size();
        let page = pager.allocate()?;
        let node = Node::from_new_page(page, page_size, true);
        let pgno = node.pgno();
        pager.release(node.page);
        ptrmap::write_entry(
            pager,
            pgno,
            Entry {
                back_ptr: 0,
                kind: PageKind::TreeRoot,
            },
        )?;
        Ok(pgno)
    }

    pub fn root(&self) -> Pgno {
        self.root.get()
    }

    pub fn root_cell(&self) -> RootId {
        Rc::clone(&self.root)
    }

    pub fn epoch(&self) -> TreeEpoch {
        Rc::clone(&self.epoch)
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn bump_epoch(&self) {
        self.epoch.set(self.epoch.get() + 1);
    }

    /// Force open cursors to restore their saved position before their
    /// next movement (used after vacuum relocates pages).
    pub fn invalidate_cursors(&self) {
        self.bump_epoch();
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub fn get(&mut self, pager: &mut Pager, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if key.is_empty() {
            return Ok(None);
        }
        let (node, index, exact) =
            seek_to_leaf(pager, self.page_size, self.root.get(), key, &mut self.path)?;
        let result = if exact {
            let cell = node.read_cell(index)?;
            let mut value = Vec::new();
            read_payload(
                pager,
                self.page_size,
                &node,
                &cell,
                cell.key_size as usize,
                (cell.total_pl - cell.key_size) as usize,
                &mut value,
            )?;
            self.bytes_read += value.len() as u64;
            Some(value)
        } else {
            None
        };
        pager.release(node.page);
        Ok(result)
    }

    // ========================================================================
    // Insert
    // ========================================================================

    pub fn put(&mut self, pager: &mut Pager, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::with_message(ErrorCode::InvalidArgument, "key is empty"));
        }
        if key.len() >= u32::MAX as usize || value.len() >= u32::MAX as usize {
            return Err(Error::with_message(
                ErrorCode::InvalidArgument,
                "record is too long",
            ));
        }
        let result = self.put_impl(pager, key, value);
        if let Err(err) = &result {
            pager.set_status(err);
        }
        self.ovfl = None;
        result
    }

    fn put_impl(&mut self, pager: &mut Pager, key: &[u8], value: &[u8]) -> Result<()> {
        let (mut leaf, index, exact) =
            seek_to_leaf(pager, self.page_size, self.root.get(), key, &mut self.path)?;
        if let Err(err) = pager.mark_dirty(&leaf.page) {
            pager.release(leaf.page);
            return Err(err);
        }
        if exact {
            // Replace rather than update in place: the old cell goes away
            // first, overflow chain included.
            if let Err(err) = self.remove_cell(pager, &mut leaf, index) {
                pager.release(leaf.page);
                return Err(err);
            }
        }
        match self.emplace(pager, &mut leaf, key, value, index) {
            Ok(None) => pager.release(leaf.page),
            Ok(Some(cell)) => {
                self.ovfl = Some(OvflCell {
                    cell,
                    pgno: leaf.pgno(),
                    index,
                });
                self.level = self.path.len() - 1;
                self.resolve_overflow(pager, leaf)?;
            }
            Err(err) => {
                pager.release(leaf.page);
                return Err(err);
            }
        }
        self.bytes_written += (key.len() + value.len()) as u64;
        self.bump_epoch();
        Ok(())
    }

    /// Build the record's cell, spilling payload to an overflow chain when
    /// needed, and try to embed it. Returns the detached cell when the node
    /// has no room.
    fn emplace(
        &mut self,
        pager: &mut Pager,
        node: &mut Node,
        key: &[u8],
        value: &[u8],
        index: u32,
    ) -> Result<Option<DetachedCell>> {
        debug_assert!(node.is_leaf);
        let local_pl = compute_local_pl_size(key.len(), value.len(), self.page_size) as usize;
        let k_local = key.len().min(local_pl);
        let v_local = local_pl - k_local;

        let overflow_id = if key.len() + value.len() > local_pl {
            Some(self.write_overflow_chain(
                pager,
                node.pgno(),
                &key[k_local..],
                &value[v_local..],
            )?)
        } else {
            None
        };
        let cell = build_leaf_cell(
            key.len(),
            value.len(),
            &key[..k_local],
            &value[..v_local],
            overflow_id,
        );
        if node.insert_cell(index, &cell, &mut self.scratch)? {
            Ok(None)
        } else {
            Ok(Some(cell))
        }
    }

    /// Write `key_tail ++ value_tail` to a fresh overflow chain rooted at
    /// the owning node, returning the head page number.
    fn write_overflow_chain(
        &mut self,
        pager: &mut Pager,
        owner: Pgno,
        key_tail: &[u8],
        value_tail: &[u8],
    ) -> Result<Pgno> {
        let content = (self.page_size - 4) as usize;
        let total = key_tail.len() + value_tail.len();
        debug_assert!(total > 0);

        let mut head = 0;
        let mut prev: Option<crate::storage::pcache::PageRef> = None;
        let mut back_ptr = owner;
        let mut kind = PageKind::OverflowHead;
        let mut written = 0;

        while written < total {
            let page = pager.allocate()?;
            if let Some(prev_page) = prev.take() {
                put_u32(&mut prev_page.data_mut()[0..], page.pgno);
                pager.release_hint(prev_page, ReleaseHint::NoCache);
            } else {
                head = page.pgno;
            }
            ptrmap::write_entry(
                pager,
                page.pgno,
                Entry {
                    back_ptr,
                    kind,
                },
            )?;
            kind = PageKind::OverflowLink;
            back_ptr = page.pgno;

            {
                let mut data = page.data_mut();
                let mut off = 4;
                while off < 4 + content && written < total {
                    let (slice, slice_off) = if written < key_tail.len() {
                        (key_tail, written)
                    } else {
                        (value_tail, written - key_tail.len())
                    };
                    let n = (slice.len() - slice_off).min(4 + content - off);
                    data[off..off + n].copy_from_slice(&slice[slice_off..slice_off + n]);
                    off += n;
                    written += n;
                }
            }
            prev = Some(page);
        }
        if let Some(last) = prev {
            put_u32(&mut last.data_mut()[0..], 0);
            pager.release_hint(last, ReleaseHint::NoCache);
        }
        Ok(head)
    }

    /// Free the overflow chain rooted at `head`
    fn free_overflow(&mut self, pager: &mut Pager, head: Pgno) -> Result<()> {
        let mut pgno = head;
        let mut hops = 0;
        while pgno != 0 {
            let page = pager.acquire(pgno)?;
            let next = get_u32(&page.data()[0..]);
            pager.destroy(page)?;
            pgno = next;
            hops += 1;
            if hops > pager.page_count() {
                return Err(Error::corruption("overflow chain has a cycle"));
            }
        }
        Ok(())
    }

    /// Remove the cell at `index`, freeing its overflow chain
    fn remove_cell(&mut self, pager: &mut Pager, node: &mut Node, index: u32) -> Result<()> {
        let cell = node.read_cell(index)?;
        if cell.has_overflow() {
            let head = node.overflow_id(&cell);
            self.free_overflow(pager, head)?;
        }
        node.erase_cell(index, cell.footprint)
    }

    /// Embed a detached cell, updating the pointer map for its child and
    /// overflow head. On failure the cell becomes the pending overflow.
    fn insert_cell_in(
        &mut self,
        pager: &mut Pager,
        target: &mut Node,
        index: u32,
        cell: DetachedCell,
    ) -> Result<()> {
        if target.insert_cell(index, &cell, &mut self.scratch)? {
            if !target.is_leaf {
                ptrmap::write_entry(
                    pager,
                    cell.child_id(),
                    Entry {
                        back_ptr: target.pgno(),
                        kind: PageKind::TreeNode,
                    },
                )?;
            }
            if cell.has_overflow() {
                ptrmap::write_entry(
                    pager,
                    cell.overflow_id(),
                    Entry {
                        back_ptr: target.pgno(),
                        kind: PageKind::OverflowHead,
                    },
                )?;
            }
        } else {
            debug_assert!(self.ovfl.is_none());
            self.ovfl = Some(OvflCell {
                pgno: target.pgno(),
                index,
                cell,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Splits
    // ========================================================================

    /// Split nodes up the saved path until the pending cell finds a home
    fn resolve_overflow(&mut self, pager: &mut Pager, mut node: Node) -> Result<()> {
        let mut guard = 0;
        while self.ovfl.is_some() {
            node = if node.pgno() == self.root.get() {
                self.split_root(pager, node)?
            } else {
                self.split_nonroot(pager, node)?
            };
            guard += 1;
            if guard > MAX_TREE_DEPTH * 2 {
                pager.release(node.page);
                return Err(Error::corruption("split did not converge"));
            }
        }
        pager.release(node.page);
        Ok(())
    }

    /// Move the root's content into a fresh child; the root becomes an
    /// internal node with that single child. The pending cell moves with
    /// the content and is resolved at the child level.
    fn split_root(&mut self, pager: &mut Pager, mut root: Node) -> Result<Node> {
        let child_page = pager.allocate()?;
        let mut child = Node::from_new_page(child_page, self.page_size, root.is_leaf);
        for i in 0..root.cell_count() {
            let cell = root.read_cell(i)?;
            let detached = root.detach_cell(&cell);
            if !child.insert_cell(i, &detached, &mut self.scratch)? {
                pager.release(child.page);
                pager.release(root.page);
                return Err(Error::corruption("root content does not fit its child"));
            }
        }
        if !root.is_leaf {
            child.set_next_id(root.next_id());
        }

        pager.mark_dirty(&root.page)?;
        root.reset(false);
        root.set_next_id(child.pgno());

        ptrmap::write_entry(
            pager,
            child.pgno(),
            Entry {
                back_ptr: root.pgno(),
                kind: PageKind::TreeNode,
            },
        )?;
        self.fix_links(pager, &child)?;

        if let Some(ovfl) = self.ovfl.as_mut() {
            ovfl.pgno = child.pgno();
        }
        // The root now has exactly one child; the old root index applies
        // one level down.
        let old_index = self.path[0].1;
        self.path[0].1 = 0;
        self.path.insert(1, (child.pgno(), old_index));
        self.level = 1;
        pager.release(root.page);
        Ok(child)
    }

    fn split_nonroot(&mut self, pager: &mut Pager, mut node: Node) -> Result<Node> {
        debug_assert!(self.level > 0);
        let (parent_pgno, pivot_idx) = self.path[self.level - 1];
        let parent_page = pager.acquire(parent_pgno)?;
        let mut parent = Node::from_existing_page(parent_page, self.page_size)?;
        pager.mark_dirty(&parent.page)?;

        let ovfl_idx = self.ovfl.as_ref().expect("split with no pending cell").index;
        if ovfl_idx == node.cell_count() {
            // Rightmost overflow: sequential inserts. Start a new sibling
            // with just the new cell instead of rebalancing.
            return self.split_nonroot_fast(pager, parent, node);
        }

        let left_page = pager.allocate()?;
        let mut left = Node::from_new_page(left_page, self.page_size, node.is_leaf);
        ptrmap::write_entry(
            pager,
            left.pgno(),
            Entry {
                back_ptr: parent_pgno,
                kind: PageKind::TreeNode,
            },
        )?;
        self.redistribute_cells(pager, &mut left, &mut node, &mut parent, pivot_idx)?;

        if node.is_leaf {
            // Thread the new node in as node's left sibling.
            let prev_id = node.prev_id();
            if prev_id != 0 {
                let prev_page = pager.acquire(prev_id)?;
                pager.mark_dirty(&prev_page)?;
                let prev = Node::from_existing_page(prev_page, self.page_size)?;
                prev.set_next_id(left.pgno());
                left.set_prev_id(prev_id);
                pager.release(prev.page);
            }
            node.set_prev_id(left.pgno());
            left.set_next_id(node.pgno());
        }

        pager.release(left.page);
        pager.release(node.page);
        self.level -= 1;
        self.path.truncate(self.level + 1);
        Ok(parent)
    }

    /// Fast path for monotone inserts: `right` is fresh and receives only
    /// the pending cell; existing cells stay in place.
    fn split_nonroot_fast(
        &mut self,
        pager: &mut Pager,
        mut parent: Node,
        mut left: Node,
    ) -> Result<Node> {
        let right_page = pager.allocate()?;
        let mut right = Node::from_new_page(right_page, self.page_size, left.is_leaf);
        ptrmap::write_entry(
            pager,
            right.pgno(),
            Entry {
                back_ptr: parent.pgno(),
                kind: PageKind::TreeNode,
            },
        )?;

        let ovfl = self.ovfl.take().expect("split with no pending cell");
        debug_assert_eq!(ovfl.pgno, left.pgno());
        self.insert_cell_in(pager, &mut right, 0, ovfl.cell)?;
        debug_assert!(self.ovfl.is_none());

        let pivot = if left.is_leaf {
            let next_id = left.next_id();
            if next_id != 0 {
                let sib_page = pager.acquire(next_id)?;
                pager.mark_dirty(&sib_page)?;
                let sib = Node::from_existing_page(sib_page, self.page_size)?;
                sib.set_prev_id(right.pgno());
                right.set_next_id(next_id);
                pager.release(sib.page);
            }
            right.set_prev_id(left.pgno());
            left.set_next_id(right.pgno());

            // Promote a truncated separator from the boundary keys.
            let last = left.read_cell(left.cell_count() - 1)?;
            let left_key = extract_key(pager, self.page_size, &left, &last, usize::MAX)?;
            let first = right.read_cell(0)?;
            let right_key =
                extract_key(pager, self.page_size, &right, &first, left_key.len() + 1)?;
            let pivot_key = truncate_suffix(&left_key, &right_key);
            self.build_pivot(pager, pivot_key, parent.pgno())?
        } else {
            // Internal: the last cell of `left` moves up as the pivot; its
            // child becomes left's rightmost child.
            let count = left.cell_count();
            let cell = left.read_cell(count - 1)?;
            let mut pivot = left.detach_cell(&cell);
            pager.mark_dirty(&left.page)?;
            left.erase_cell(count - 1, cell.footprint)?;

            right.set_next_id(left.next_id());
            left.set_next_id(pivot.child_id());
            ptrmap::write_entry(
                pager,
                right.next_id(),
                Entry {
                    back_ptr: right.pgno(),
                    kind: PageKind::TreeNode,
                },
            )?;
            ptrmap::write_entry(
                pager,
                left.next_id(),
                Entry {
                    back_ptr: left.pgno(),
                    kind: PageKind::TreeNode,
                },
            )?;
            pivot.set_child_id(0);
            pivot
        };

        let (_, parent_idx) = self.path[self.level - 1];
        let mut pivot = pivot;
        pivot.set_child_id(left.pgno());
        self.insert_cell_in(pager, &mut parent, parent_idx, pivot)?;
        let inserted = self.ovfl.is_none();
        parent.set_child_id(parent_idx + inserted as u32, right.pgno());
        ptrmap::write_entry(
            pager,
            right.pgno(),
            Entry {
                back_ptr: parent.pgno(),
                kind: PageKind::TreeNode,
            },
        )?;

        pager.release(right.page);
        pager.release(left.page);
        self.level -= 1;
        self.path.truncate(self.level + 1);
        Ok(parent)
    }

    /// Build an internal pivot cell from raw key bytes, spilling to an
    /// overflow chain when the key exceeds the local maximum.
    fn build_pivot(
        &mut self,
        pager: &mut Pager,
        pivot_key: Vec<u8>,
        parent_pgno: Pgno,
    ) -> Result<DetachedCell> {
        let local = compute_local_pl_size(pivot_key.len(), 0, self.page_size) as usize;
        let overflow_id = if pivot_key.len() > local {
            Some(self.write_overflow_chain(pager, parent_pgno, &pivot_key[local..], &[])?)
        } else {
            None
        };
        Ok(build_internal_cell(
            pivot_key.len(),
            &pivot_key[..local.min(pivot_key.len())],
            overflow_id,
        ))
    }

    /// Redistribute cells between `left` and `right` through `parent`. One
    /// of the siblings is empty on entry. Handles both the split case (a
    /// pending overflow cell joins the distribution) and the rebalance
    /// case (the parent pivot at `pivot_idx` is pulled down first); in the
    /// latter case an empty `left` on exit means the nodes were merged and
    /// the caller must free `left`.
    fn redistribute_cells(
        &mut self,
        pager: &mut Pager,
        left: &mut Node,
        right: &mut Node,
        parent: &mut Node,
        pivot_idx: u32,
    ) -> Result<()> {
        pager.mark_dirty(&left.page)?;
        pager.mark_dirty(&right.page)?;

        let src_is_left = left.cell_count() > 0;
        debug_assert!(!src_is_left || right.cell_count() == 0);
        let is_split = self.ovfl.is_some();
        let is_leaf = left.is_leaf;

        // Pull every cell (in key order) out of the nonempty sibling.
        let mut cells: Vec<DetachedCell> = Vec::new();
        {
            let src: &Node = if src_is_left { &*left } else { &*right };
            for i in 0..src.cell_count() {
                let cell = src.read_cell(i)?;
                cells.push(src.detach_cell(&cell));
            }
        }

        if is_split {
            let ovfl = self.ovfl.take().expect("split with no pending cell");
            let src_pgno = if src_is_left { left.pgno() } else { right.pgno() };
            debug_assert_eq!(ovfl.pgno, src_pgno);
            debug_assert!((ovfl.index as usize) < cells.len());
            cells.insert(ovfl.index as usize, ovfl.cell);
        } else {
            // Rebalance: the parent pivot comes down. For internal nodes
            // it becomes a real cell adopting left's rightmost child; for
            // leaves the record data lives in the leaves already.
            let pivot_cell = parent.read_cell(pivot_idx)?;
            if !is_leaf {
                let mut pivot = parent.detach_cell(&pivot_cell);
                pivot.set_child_id(left.next_id());
                if src_is_left {
                    cells.push(pivot);
                } else {
                    cells.insert(0, pivot);
                }
            }
            parent.erase_cell(pivot_idx, pivot_cell.footprint)?;
        }

        // Wipe the source and restore its sibling links; the empty node
        // keeps its own header fields.
        {
            let src: &mut Node = if src_is_left { &mut *left } else { &mut *right };
            let (save_next, save_prev) = (src.next_id(), src.prev_id());
            src.reset(is_leaf);
            if is_leaf {
                src.set_next_id(save_next);
                src.set_prev_id(save_prev);
            } else if src_is_left && !is_split {
                // Internal rebalance consumed left's rightmost child via
                // the pivot; it is reassigned below.
            } else {
                src.set_next_id(save_next);
            }
        }

        // Choose the separation point: move cells to the left until the
        // two sides are roughly balanced. A total small enough to fit one
        // node leaves `sep` at -1, which merges everything into `right`.
        let mut right_accum: u32 = cells.iter().map(|c| c.footprint()).sum();
        let mut left_accum: u32 = 0;
        let mut sep: i64 = -1;
        while right_accum > left.usable_space / 2
            && right_accum > left_accum
            && (sep + 2) < cells.len() as i64
        {
            sep += 1;
            left_accum += cells[sep as usize].footprint();
            right_accum -= cells[sep as usize].footprint();
        }
        if sep == 0 {
            sep = 1;
        }

        // Right side first, back to front.
        let mut idx = cells.len() as i64 - 1;
        let mut iter_cells = cells;
        while idx > sep {
            let cell = iter_cells.pop().expect("distribution index in range");
            self.insert_cell_in(pager, right, 0, cell)?;
            debug_assert!(self.ovfl.is_none());
            idx -= 1;
        }

        if idx >= 0 && sep >= 0 {
            // Post a new pivot separating the two sides.
            let pivot = if is_leaf {
                // Boundary keys: last of left pool, first of right node.
                let left_cell = &iter_cells[idx as usize];
                let left_key =
                    detached_key_bytes(pager, self.page_size, left_cell, usize::MAX)?;
                let first = right.read_cell(0)?;
                let right_key =
                    extract_key(pager, self.page_size, right, &first, left_key.len() + 1)?;
                let pivot_key = truncate_suffix(&left_key, &right_key);
                self.build_pivot(pager, pivot_key, parent.pgno())?
            } else {
                let mut pivot = iter_cells.pop().expect("pivot index in range");
                idx -= 1;
                left.set_next_id(pivot.child_id());
                ptrmap::write_entry(
                    pager,
                    left.next_id(),
                    Entry {
                        back_ptr: left.pgno(),
                        kind: PageKind::TreeNode,
                    },
                )?;
                pivot.set_child_id(0);
                pivot
            };
            let mut pivot = pivot;
            pivot.set_child_id(left.pgno());
            self.insert_cell_in(pager, parent, pivot_idx, pivot)?;
        } else if is_leaf {
            // Merge: `left` ends empty and will be freed. Bypass it in the
            // sibling chain.
            let prev_id = left.prev_id();
            right.set_prev_id(prev_id);
            if prev_id != 0 {
                let prev_page = pager.acquire(prev_id)?;
                pager.mark_dirty(&prev_page)?;
                let prev = Node::from_existing_page(prev_page, self.page_size)?;
                prev.set_next_id(right.pgno());
                pager.release(prev.page);
            }
        }

        // Remaining cells fill the left side, back to front. Only the
        // parent is allowed to be carrying an overflow at this point.
        while idx >= 0 {
            let cell = iter_cells.pop().expect("distribution index in range");
            self.insert_cell_in(pager, left, 0, cell)?;
            idx -= 1;
        }
        debug_assert!(iter_cells.is_empty());
        Ok(())
    }

    /// Update the pointer-map back pointers of everything `node` links to
    fn fix_links(&mut self, pager: &mut Pager, node: &Node) -> Result<()> {
        for i in 0..node.cell_count() {
            let cell = node.read_cell(i)?;
            if !node.is_leaf {
                let child = get_u32(&node.data()[cell.offset..]);
                ptrmap::write_entry(
                    pager,
                    child,
                    Entry {
                        back_ptr: node.pgno(),
                        kind: PageKind::TreeNode,
                    },
                )?;
            }
            if cell.has_overflow() {
                ptrmap::write_entry(
                    pager,
                    node.overflow_id(&cell),
                    Entry {
                        back_ptr: node.pgno(),
                        kind: PageKind::OverflowHead,
                    },
                )?;
            }
        }
        if !node.is_leaf {
            ptrmap::write_entry(
                pager,
                node.next_id(),
                Entry {
                    back_ptr: node.pgno(),
                    kind: PageKind::TreeNode,
                },
            )?;
        }
        Ok(())
    }

    // ========================================================================
    // Erase
    // ========================================================================

    pub fn erase(&mut self, pager: &mut Pager, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::new(ErrorCode::NotFound));
        }
        let result = self.erase_impl(pager, key);
        if let Err(err) = &result {
            pager.set_status(err);
        }
        self.ovfl = None;
        result
    }

    fn erase_impl(&mut self, pager: &mut Pager, key: &[u8]) -> Result<()> {
        let (mut leaf, index, exact) =
            seek_to_leaf(pager, self.page_size, self.root.get(), key, &mut self.path)?;
        if !exact {
            pager.release(leaf.page);
            return Err(Error::new(ErrorCode::NotFound));
        }
        if let Err(err) = pager.mark_dirty(&leaf.page) {
            pager.release(leaf.page);
            return Err(err);
        }
        if let Err(err) = self.remove_cell(pager, &mut leaf, index) {
            pager.release(leaf.page);
            return Err(err);
        }
        self.bump_epoch();
        if leaf.cell_count() == 0 {
            self.level = self.path.len() - 1;
            self.resolve_underflow(pager, leaf)
        } else {
            pager.release(leaf.page);
            Ok(())
        }
    }

    /// Rebalance upward from an empty node
    fn resolve_underflow(&mut self, pager: &mut Pager, mut node: Node) -> Result<()> {
        loop {
            if self.ovfl.is_some() {
                // A pivot reinsertion overflowed the parent.
                return self.resolve_overflow(pager, node);
            }
            if node.cell_count() > 0 {
                pager.release(node.page);
                return Ok(());
            }
            if node.pgno() == self.root.get() {
                return self.fix_root(pager, node);
            }
            debug_assert!(self.level > 0);
            let (parent_pgno, index) = self.path[self.level - 1];
            let parent_page = pager.acquire(parent_pgno)?;
            let parent = Node::from_existing_page(parent_page, self.page_size)?;
            pager.mark_dirty(&parent.page)?;
            node = self.fix_nonroot(pager, node, parent, index)?;
            self.level -= 1;
            self.path.truncate(self.level + 1);
        }
    }

    /// Merge or redistribute an empty non-root node with a sibling.
    /// Consumes `node` and returns the parent for further rebalancing.
    fn fix_nonroot(
        &mut self,
        pager: &mut Pager,
        node: Node,
        mut parent: Node,
        index: u32,
    ) -> Result<Node> {
        let mut node = node;
        let (left, right);
        if index > 0 {
            let sib_pgno = parent.child_id(index - 1)?;
            let sib_page = pager.acquire(sib_pgno)?;
            let mut sib = Node::from_existing_page(sib_page, self.page_size)?;
            self.redistribute_cells(pager, &mut sib, &mut node, &mut parent, index - 1)?;
            left = sib;
            right = node;
        } else {
            let sib_pgno = parent.child_id(index + 1)?;
            let sib_page = pager.acquire(sib_pgno)?;
            let mut sib = Node::from_existing_page(sib_page, self.page_size)?;
            self.redistribute_cells(pager, &mut node, &mut sib, &mut parent, index)?;
            left = node;
            right = sib;
        }
        // A merge leaves the left node empty; it goes to the freelist.
        pager.release(right.page);
        if left.cell_count() == 0 {
            pager.destroy(left.page)?;
        } else {
            pager.release(left.page);
        }
        Ok(parent)
    }

    /// Collapse a root that has no cells left. A leaf root stays as the
    /// empty tree; an internal root absorbs its single child, preserving
    /// the root page number.
    fn fix_root(&mut self, pager: &mut Pager, mut root: Node) -> Result<()> {
        if root.is_leaf {
            pager.release(root.page);
            return Ok(());
        }
        let child_pgno = root.next_id();
        let child_page = pager.acquire(child_pgno)?;
        let mut child = Node::from_existing_page(child_page, self.page_size)?;

        // Page 1 loses header space to the file header; when the child is
        // too full to fit there, split the child around its median instead.
        if root.pgno() == 1 && (child.usable_space as usize) < FILE_HEADER_SIZE {
            pager.mark_dirty(&child.page)?;
            let median = child.cell_count() / 2;
            let cell = child.read_cell(median)?;
            let detached = child.detach_cell(&cell);
            child.erase_cell(median, cell.footprint)?;
            self.ovfl = Some(OvflCell {
                cell: detached,
                pgno: child.pgno(),
                index: median,
            });
            self.path = vec![(root.pgno(), 0), (child.pgno(), median)];
            self.level = 1;
            pager.release(root.page);
            return self.resolve_overflow(pager, child);
        }

        pager.mark_dirty(&root.page)?;
        root.reset(child.is_leaf);
        for i in 0..child.cell_count() {
            let cell = child.read_cell(i)?;
            let detached = child.detach_cell(&cell);
            if !root.insert_cell(i, &detached, &mut self.scratch)? {
                pager.release(child.page);
                pager.release(root.page);
                return Err(Error::corruption("child does not fit the root page"));
            }
        }
        if !child.is_leaf {
            root.set_next_id(child.next_id());
        }
        self.fix_links(pager, &root)?;
        pager.destroy(child.page)?;
        pager.release(root.page);
        Ok(())
    }

    // ========================================================================
    // Whole-tree operations
    // ========================================================================

    /// Free every page of the tree, overflow chains and root included
    pub fn destroy(&mut self, pager: &mut Pager) -> Result<()> {
        let root = self.root.get();
        self.destroy_subtree(pager, root, 0)
    }

    fn destroy_subtree(&mut self, pager: &mut Pager, pgno: Pgno, depth: usize) -> Result<()> {
        if depth > MAX_TREE_DEPTH {
            return Err(Error::corruption("tree is too deep"));
        }
        let page = pager.acquire(pgno)?;
        let node = Node::from_existing_page(page, self.page_size)?;
        let mut children = Vec::new();
        let mut chains = Vec::new();
        for i in 0..node.cell_count() {
            let cell = node.read_cell(i)?;
            if cell.has_overflow() {
                chains.push(node.overflow_id(&cell));
            }
        }
        if !node.is_leaf {
            for i in 0..=node.cell_count() {
                children.push(node.child_id(i)?);
            }
        }
        pager.destroy(node.page)?;
        for head in chains {
            self.free_overflow(pager, head)?;
        }
        for child in children {
            self.destroy_subtree(pager, child, depth + 1)?;
        }
        Ok(())
    }

    /// Check structural invariants: in-node byte accounting, ascending key
    /// order across the leaf chain, and pointer-map consistency.
    pub fn validate(&mut self, pager: &mut Pager) -> Result<()> {
        self.validate_subtree(pager, self.root.get(), 0)?;

        // Keys must ascend across the entire leaf chain.
        let mut node = leftmost_leaf(pager, self.page_size, self.root.get())?;
        let mut last_key: Option<Vec<u8>> = None;
        loop {
            for i in 0..node.cell_count() {
                let cell = node.read_cell(i)?;
                let key = extract_key(pager, self.page_size, &node, &cell, usize::MAX)?;
                if let Some(prev) = &last_key {
                    if prev.as_slice() >= key.as_slice() {
                        let msg = format!(
                            "keys out of order in leaf {}: {} then {}",
                            node.pgno(),
                            hex::encode(prev),
                            hex::encode(&key)
                        );
                        pager.release(node.page);
                        return Err(Error::corruption(msg));
                    }
                }
                last_key = Some(key);
            }
            let next = node.next_id();
            pager.release(node.page);
            if next == 0 {
                break;
            }
            let page = pager.acquire(next)?;
            node = Node::from_existing_page(page, self.page_size)?;
        }
        Ok(())
    }

    fn validate_subtree(&mut self, pager: &mut Pager, pgno: Pgno, depth: usize) -> Result<()> {
        if depth > MAX_TREE_DEPTH {
            return Err(Error::corruption("tree is too deep"));
        }
        let page = pager.acquire(pgno)?;
        let node = Node::from_existing_page(page, self.page_size)?;

        let mut children = Vec::new();
        for i in 0..node.cell_count() {
            let cell = node.read_cell(i)?;
            if cell.has_overflow() {
                // The chain head's map entry names this node as its owner.
                let head = node.overflow_id(&cell);
                let entry = ptrmap::read_entry(pager, head)?;
                if entry.kind != PageKind::OverflowHead || entry.back_ptr != node.pgno() {
                    pager.release(node.page);
                    return Err(Error::corruption(format!(
                        "overflow head {} does not point back to node {}",
                        head, pgno
                    )));
                }
            }
        }
        if !node.is_leaf {
            for i in 0..=node.cell_count() {
                children.push(node.child_id(i)?);
            }
        }
        pager.release(node.page);

        for child in children {
            let entry = ptrmap::read_entry(pager, child)?;
            if entry.kind != PageKind::TreeNode || entry.back_ptr != pgno {
                return Err(Error::corruption(format!(
                    "child {} does not point back to parent {}",
                    child, pgno
                )));
            }
            self.validate_subtree(pager, child, depth + 1)?;
        }
        Ok(())
    }
}

// ============================================================================
// Shared descent and payload helpers (used by Tree and Cursor)
// ============================================================================

/// Compare a cell's key against a query. `extracted` holds at most
/// `query.len() + 1` leading key bytes; ties on the common prefix break on
/// the full key length.
fn compare_extracted(extracted: &[u8], full_key_len: u32, query: &[u8]) -> Ordering {
    let n = extracted.len().min(query.len());
    match extracted[..n].cmp(&query[..n]) {
        Ordering::Equal => (full_key_len as usize).cmp(&query.len()),
        other => other,
    }
}

/// Binary search a node for `key`: the first index whose key is >= `key`
/// in a leaf, or the child index to descend into for an internal node.
fn search_node(
    pager: &mut Pager,
    page_size: u32,
    node: &Node,
    key: &[u8],
) -> Result<(u32, bool)> {
    let mut lo = 0;
    let mut hi = node.cell_count();
    let mut exact = false;
    while lo < hi {
        let mid = (lo + hi) / 2;
        let cell = node.read_cell(mid)?;
        let extracted = extract_key(pager, page_size, node, &cell, key.len() + 1)?;
        match compare_extracted(&extracted, cell.key_size, key) {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => {
                if node.is_leaf {
                    return Ok((mid, true));
                }
                // Pivot == key descends right of the pivot.
                lo = mid + 1;
                exact = true;
            }
        }
    }
    Ok((lo, exact))
}

/// Descend from `root` to the leaf that should contain `key`, recording
/// (page, index) pairs for every level in `path`.
fn seek_to_leaf(
    pager: &mut Pager,
    page_size: u32,
    root: Pgno,
    key: &[u8],
    path: &mut Vec<(Pgno, u32)>,
) -> Result<(Node, u32, bool)> {
    path.clear();
    let mut pgno = root;
    for _ in 0..=MAX_TREE_DEPTH {
        let page = pager.acquire(pgno)?;
        let node = Node::from_existing_page(page, page_size)?;
        let (index, exact) = match search_node(pager, page_size, &node, key) {
            Ok(found) => found,
            Err(err) => {
                pager.release(node.page);
                return Err(err);
            }
        };
        path.push((pgno, index));
        if node.is_leaf {
            return Ok((node, index, exact));
        }
        let child = node.child_id(index)?;
        pager.release(node.page);
        if child == 0 {
            return Err(Error::corruption(format!("node {} has a null child", pgno)));
        }
        pgno = child;
    }
    Err(Error::corruption("tree is too deep"))
}

/// Follow the leftmost spine down to a leaf
fn leftmost_leaf(pager: &mut Pager, page_size: u32, root: Pgno) -> Result<Node> {
    let mut pgno = root;
    for _ in 0..=MAX_TREE_DEPTH {
        let page = pager.acquire(pgno)?;
        let node = Node::from_existing_page(page, page_size)?;
        if node.is_leaf {
            return Ok(node);
        }
        let child = node.child_id(0)?;
        pager.release(node.page);
        pgno = child;
    }
    Err(Error::corruption("tree is too deep"))
}

/// Follow the rightmost spine down to a leaf
fn rightmost_leaf(pager: &mut Pager, page_size: u32, root: Pgno) -> Result<Node> {
    let mut pgno = root;
    for _ in 0..=MAX_TREE_DEPTH {
        let page = pager.acquire(pgno)?;
        let node = Node::from_existing_page(page, page_size)?;
        if node.is_leaf {
            return Ok(node);
        }
        let child = node.next_id();
        pager.release(node.page);
        pgno = child;
    }
    Err(Error::corruption("tree is too deep"))
}

/// Read `length` payload bytes starting at `offset`, following the
/// overflow chain as needed.
fn read_payload(
    pager: &mut Pager,
    page_size: u32,
    node: &Node,
    cell: &node::Cell,
    offset: usize,
    length: usize,
    out: &mut Vec<u8>,
) -> Result<()> {
    out.clear();
    let mut offset = offset;
    let mut length = length.min((cell.total_pl as usize).saturating_sub(offset));
    let local = cell.local_pl as usize;

    if offset < local {
        let n = length.min(local - offset);
        let data = node.data();
        let start = cell.key_offset + offset;
        out.extend_from_slice(&data[start..start + n]);
        length -= n;
        offset = 0;
    } else {
        offset -= local;
    }

    if length > 0 {
        if !cell.has_overflow() {
            return Err(Error::corruption("payload shorter than its header claims"));
        }
        let content = (page_size - 4) as usize;
        let mut pgno = node.overflow_id(cell);
        let mut hops = 0;
        while length > 0 && pgno != 0 {
            let page = pager.acquire(pgno)?;
            {
                let data = page.data();
                if offset >= content {
                    offset -= content;
                } else {
                    let n = (content - offset).min(length);
                    out.extend_from_slice(&data[4 + offset..4 + offset + n]);
                    offset = 0;
                    length -= n;
                }
                pgno = get_u32(&data[0..]);
            }
            pager.release_hint(page, ReleaseHint::NoCache);
            hops += 1;
            if hops > pager.page_count() {
                return Err(Error::corruption("overflow chain has a cycle"));
            }
        }
        if length > 0 {
            return Err(Error::corruption("overflow chain ended early"));
        }
    }
    Ok(())
}

/// Read up to `limit` leading key bytes of an embedded cell
fn extract_key(
    pager: &mut Pager,
    page_size: u32,
    node: &Node,
    cell: &node::Cell,
    limit: usize,
) -> Result<Vec<u8>> {
    let want = limit.min(cell.key_size as usize);
    let mut out = Vec::with_capacity(want);
    read_payload(pager, page_size, node, cell, 0, want, &mut out)?;
    Ok(out)
}

/// Read up to `limit` leading key bytes of a detached cell
fn detached_key_bytes(
    pager: &mut Pager,
    page_size: u32,
    cell: &DetachedCell,
    limit: usize,
) -> Result<Vec<u8>> {
    let want = limit.min(cell.key_size as usize);
    let mut out = Vec::with_capacity(want);
    let local = cell.local_key_len().min(want);
    out.extend_from_slice(&cell.data[cell.key_offset..cell.key_offset + local]);

    if out.len() < want {
        if !cell.has_overflow() {
            return Err(Error::corruption("key shorter than its header claims"));
        }
        let content = (page_size - 4) as usize;
        let mut pgno = cell.overflow_id();
        let mut hops = 0;
        while out.len() < want && pgno != 0 {
            let page = pager.acquire(pgno)?;
            {
                let data = page.data();
                let n = (want - out.len()).min(content);
                out.extend_from_slice(&data[4..4 + n]);
                pgno = get_u32(&data[0..]);
            }
            pager.release_hint(page, ReleaseHint::NoCache);
            hops += 1;
            if hops > pager.page_count() {
                return Err(Error::corruption("overflow chain has a cycle"));
            }
        }
        if out.len() < want {
            return Err(Error::corruption("overflow chain ended early"));
        }
    }
    Ok(out)
}

/// The shortest prefix of `right` that still orders strictly after `left`.
/// Callers guarantee `left < right`.
fn truncate_suffix(left: &[u8], right: &[u8]) -> Vec<u8> {
    debug_assert!(left < right);
    let mut n = 0;
    while n < left.len() && n < right.len() && left[n] == right[n] {
        n += 1;
    }
    // Either the keys diverge at `n` (right[n] > left[n]) or `left` is a
    // proper prefix of `right`; one more byte makes the pivot strictly
    // greater than `left`.
    right[..(n + 1).min(right.len())].to_vec()
}

// ============================================================================
// Vacuum
// ============================================================================

/// Entries a pointer-map page covers (the map page itself excluded)
fn map_entries_per_page(page_size: u32) -> u32 {
    page_size / ptrmap::ENTRY_SIZE as u32
}

/// The last page number the file should have once `free_size` freelist
/// pages and the stranded pointer-map pages are reclaimed.
fn vacuum_end_page(page_size: u32, db_size: Pgno, free_size: u32) -> Pgno {
    let entries = map_entries_per_page(page_size);
    let pm_page = ptrmap::lookup(db_size, page_size);
    let pm_size = (free_size + pm_page + entries - db_size) / entries;
    let mut end_page = db_size - free_size - pm_size;
    if ptrmap::is_map(end_page, page_size) {
        end_page -= 1;
    }
    end_page
}

/// Shrink the database file by moving every occupied page at the end into
/// a free slot below the computed end page, then truncating. Root
/// relocations are recorded in `reroots` for the schema to apply.
pub fn vacuum_db(pager: &mut Pager, reroots: &mut HashMap<Pgno, Pgno>) -> Result<()> {
    let page_size = pager.page_size();
    let mut db_size = pager.page_count();
    if db_size == 0 {
        return Ok(());
    }
    let free_size = freelist::total_size(pager)?;
    if free_size == 0 {
        return Ok(());
    }
    let end_page = vacuum_end_page(page_size, db_size, free_size);

    while db_size > end_page {
        let last_id = db_size;
        if !ptrmap::is_map(last_id, page_size) {
            let entry = ptrmap::read_entry(pager, last_id)?;
            if !entry.kind.is_freelist() {
                // Claim free pages until one lands inside the surviving
                // prefix of the file.
                loop {
                    if freelist::is_empty(pager) {
                        return Err(Error::corruption(
                            "freelist exhausted before vacuum finished",
                        ));
                    }
                    let free_page = pager.allocate()?;
                    if free_page.pgno <= end_page {
                        vacuum_step(pager, page_size, free_page, entry, last_id, reroots)?;
                        break;
                    }
                    pager.release_hint(free_page, ReleaseHint::Discard);
                }
            }
        }
        db_size -= 1;
    }

    pager.set_freelist_head(0)?;
    pager.set_freelist_count(0)?;
    pager.set_page_count(end_page)?;
    Ok(())
}

/// Move page `last_id` into `free_page`: rewrite the link that referenced
/// it (parent child pointer, owning cell's overflow id, or predecessor's
/// next pointer), move the pointer-map entries, and copy the content.
fn vacuum_step(
    pager: &mut Pager,
    page_size: u32,
    free_page: crate::storage::pcache::PageRef,
    entry: Entry,
    last_id: Pgno,
    reroots: &mut HashMap<Pgno, Pgno>,
) -> Result<()> {
    let new_id = free_page.pgno;
    debug_assert_ne!(new_id, last_id);

    match entry.kind {
        PageKind::OverflowLink => {
            // The predecessor in the chain points at this page.
            let pred = pager.acquire(entry.back_ptr)?;
            pager.mark_dirty(&pred)?;
            put_u32(&mut pred.data_mut()[0..], new_id);
            pager.release_hint(pred, ReleaseHint::NoCache);
        }
        PageKind::OverflowHead => {
            // Find the owning cell in the node the back pointer names.
            let owner_page = pager.acquire(entry.back_ptr)?;
            let owner = Node::from_existing_page(owner_page, page_size)?;
            pager.mark_dirty(&owner.page)?;
            let mut found = false;
            for i in 0..owner.cell_count() {
                let cell = owner.read_cell(i)?;
                if cell.has_overflow() && owner.overflow_id(&cell) == last_id {
                    owner.set_overflow_id(&cell, new_id);
                    found = true;
                    break;
                }
            }
            let owner_pgno = owner.pgno();
            pager.release(owner.page);
            if !found {
                pager.release(free_page);
                return Err(Error::corruption(format!(
                    "node {} does not own overflow chain {}",
                    owner_pgno, last_id
                )));
            }
        }
        PageKind::TreeRoot | PageKind::TreeNode => {
            if entry.kind == PageKind::TreeRoot {
                reroots.insert(last_id, new_id);
            } else {
                // Rewrite the parent's child pointer.
                let parent_page = pager.acquire(entry.back_ptr)?;
                let parent = Node::from_existing_page(parent_page, page_size)?;
                pager.mark_dirty(&parent.page)?;
                let mut found = false;
                for i in 0..=parent.cell_count() {
                    if parent.child_id(i)? == last_id {
                        parent.set_child_id(i, new_id);
                        found = true;
                        break;
                    }
                }
                let parent_pgno = parent.pgno();
                pager.release(parent.page);
                if !found {
                    pager.release(free_page);
                    return Err(Error::corruption(format!(
                        "node {} is not a child of {}",
                        last_id, parent_pgno
                    )));
                }
            }

            // Everything the moved node references must point back at its
            // new location.
            let moved_page = pager.acquire(last_id)?;
            let moved = Node::from_existing_page(moved_page, page_size)?;
            for i in 0..moved.cell_count() {
                let cell = moved.read_cell(i)?;
                if !moved.is_leaf {
                    let child = get_u32(&moved.data()[cell.offset..]);
                    ptrmap::write_entry(
                        pager,
                        child,
                        Entry {
                            back_ptr: new_id,
                            kind: PageKind::TreeNode,
                        },
                    )?;
                }
                if cell.has_overflow() {
                    ptrmap::write_entry(
                        pager,
                        moved.overflow_id(&cell),
                        Entry {
                            back_ptr: new_id,
                            kind: PageKind::OverflowHead,
                        },
                    )?;
                }
            }
            if !moved.is_leaf {
                ptrmap::write_entry(
                    pager,
                    moved.next_id(),
                    Entry {
                        back_ptr: new_id,
                        kind: PageKind::TreeNode,
                    },
                )?;
            } else {
                // Relink the leaf chain around the new location.
                let prev_id = moved.prev_id();
                if prev_id != 0 {
                    let prev_page = pager.acquire(prev_id)?;
                    pager.mark_dirty(&prev_page)?;
                    let prev = Node::from_existing_page(prev_page, page_size)?;
                    prev.set_next_id(new_id);
                    pager.release(prev.page);
                }
                let next_id = moved.next_id();
                if next_id != 0 {
                    let next_page = pager.acquire(next_id)?;
                    pager.mark_dirty(&next_page)?;
                    let next = Node::from_existing_page(next_page, page_size)?;
                    next.set_prev_id(new_id);
                    pager.release(next.page);
                }
            }
            pager.release(moved.page);
        }
        PageKind::Empty | PageKind::FreelistTrunk | PageKind::FreelistLeaf => {
            pager.release(free_page);
            return Err(Error::corruption(format!(
                "page {} cannot be relocated",
                last_id
            )));
        }
    }

    // Move the map entries, then the content.
    ptrmap::write_entry(
        pager,
        last_id,
        Entry {
            back_ptr: 0,
            kind: PageKind::Empty,
        },
    )?;
    ptrmap::write_entry(pager, new_id, entry)?;

    let last_page = pager.acquire(last_id)?;
    if entry.kind.is_overflow() {
        // The chain successor's back pointer tracks the move.
        let next_id = get_u32(&last_page.data()[0..]);
        if next_id != 0 {
            let mut next_entry = ptrmap::read_entry(pager, next_id)?;
            next_entry.back_ptr = new_id;
            ptrmap::write_entry(pager, next_id, next_entry)?;
        }
    }
    free_page
        .data_mut()
        .copy_from_slice(&last_page.data());
    pager.release_hint(last_page, ReleaseHint::Discard);
    pager.release(free_page);
    Ok(())
}

#[cfg(test)]
mod tests;
