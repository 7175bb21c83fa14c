//! Page cache: a bounded pool of page-sized frames
//!
//! The cache owns every page buffer in the process. Frames are handed out as
//! refcounted `PageRef` handles; a frame with refcount 0 sits on the LRU list
//! and may be recycled. Dirty frames are threaded onto an intrusive dirty
//! list that can be emitted in ascending page-number order for WAL appends.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::rc::Rc;

use bitflags::bitflags;

use crate::types::Pgno;

bitflags! {
    /// Frame state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PgFlags: u8 {
        /// Frame is present in the page-number table
        const CACHED = 0x01;
        /// Frame content differs from the last committed image
        const DIRTY  = 0x02;
    }
}

/// Number of merge buckets used when sorting the dirty list
const SORT_BUCKETS: usize = 32;

/// Refcounted handle to a cached page
///
/// The buffer is shared with the owning cache frame; the handle stays valid
/// until released back to the pager. Handles are deliberately not `Clone`:
/// duplicating a reference goes through the pager so the refcount stays
/// accurate.
#[derive(Debug)]
pub struct PageRef {
    pub pgno: Pgno,
    pub(crate) slot: usize,
    buf: Rc<RefCell<Vec<u8>>>,
}

impl PageRef {
    pub fn data(&self) -> Ref<'_, Vec<u8>> {
        self.buf.borrow()
    }

    pub fn data_mut(&self) -> RefMut<'_, Vec<u8>> {
        self.buf.borrow_mut()
    }

    /// Detached reference over a standalone buffer, for unit tests that
    /// exercise page formats without a pager.
    #[cfg(test)]
    pub(crate) fn for_tests(pgno: Pgno, buf: Rc<RefCell<Vec<u8>>>) -> PageRef {
        PageRef {
            pgno,
            slot: usize::MAX,
            buf,
        }
    }
}

struct Frame {
    pgno: Pgno,
    buf: Rc<RefCell<Vec<u8>>>,
    n_ref: u32,
    flags: PgFlags,
    lru_next: Option<usize>,
    lru_prev: Option<usize>,
    dirty_next: Option<usize>,
    dirty_prev: Option<usize>,
}

/// Bounded pool of page frames with LRU recycling
pub struct PageCache {
    frames: Vec<Frame>,
    free: Vec<usize>,
    map: HashMap<Pgno, usize>,
    /// Unpinned cached frames; head is most recently used
    lru_head: Option<usize>,
    lru_tail: Option<usize>,
    dirty_head: Option<usize>,
    page_size: usize,
    capacity: usize,
    n_ref_sum: i64,
    hits: u64,
    misses: u64,
}

impl PageCache {
    pub fn new(page_size: usize, capacity: usize) -> Self {
        PageCache {
            frames: Vec::new(),
            free: Vec::new(),
            map: HashMap::new(),
            lru_head: None,
            lru_tail: None,
            dirty_head: None,
            page_size,
            capacity: capacity.max(1),
            n_ref_sum: 0,
            hits: 0,
            misses: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn occupied(&self) -> usize {
        self.frames.len() - self.free.len()
    }

    pub fn ref_sum(&self) -> i64 {
        self.n_ref_sum
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Table lookup with no LRU movement and no accounting
    pub fn query(&self, pgno: Pgno) -> Option<usize> {
        self.map.get(&pgno).copied()
    }

    /// Table lookup; promotes an unpinned frame to the LRU head and counts
    /// the access as a hit or miss
    pub fn lookup(&mut self, pgno: Pgno) -> Option<usize> {
        match self.map.get(&pgno).copied() {
            Some(slot) => {
                self.hits += 1;
                if self.frames[slot].n_ref == 0 {
                    self.lru_remove(slot);
                    self.lru_push_head(slot);
                }
                Some(slot)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    // ========================================================================
    // Frame management
    // ========================================================================

    /// Create (or reuse) an empty frame. The frame is not yet associated
    /// with a page number.
    pub fn allocate(&mut self) -> usize {
        if let Some(slot) = self.free.pop() {
            let frame = &mut self.frames[slot];
            frame.pgno = 0;
            frame.n_ref = 0;
            frame.flags = PgFlags::empty();
            frame.buf.borrow_mut().fill(0);
            return slot;
        }
        let slot = self.frames.len();
        self.frames.push(Frame {
            pgno: 0,
            buf: Rc::new(RefCell::new(vec![0u8; self.page_size])),
            n_ref: 0,
            flags: PgFlags::empty(),
            lru_next: None,
            lru_prev: None,
            dirty_next: None,
            dirty_prev: None,
        });
        slot
    }

    /// Associate a frame with a page number
    pub fn register_page(&mut self, slot: usize, pgno: Pgno) {
        debug_assert!(!self.map.contains_key(&pgno));
        let frame = &mut self.frames[slot];
        frame.pgno = pgno;
        frame.flags.insert(PgFlags::CACHED);
        self.map.insert(pgno, slot);
    }

    /// Drop a frame's page association and recycle it. The frame must be
    /// unreferenced.
    pub fn erase(&mut self, slot: usize) {
        debug_assert_eq!(self.frames[slot].n_ref, 0);
        if self.frames[slot].flags.contains(PgFlags::DIRTY) {
            self.dirty_remove(slot);
        }
        self.lru_remove(slot);
        let pgno = self.frames[slot].pgno;
        self.map.remove(&pgno);
        self.frames[slot].flags = PgFlags::empty();
        self.frames[slot].pgno = 0;
        self.free.push(slot);
    }

    /// The least recently used unpinned frame, if any
    pub fn next_victim(&self) -> Option<usize> {
        self.lru_tail
    }

    /// Drop every cached association. Outstanding handles keep their own
    /// buffers alive but can no longer reach the cache.
    pub fn purge(&mut self) {
        self.n_ref_sum = 0;
        self.map.clear();
        self.lru_head = None;
        self.lru_tail = None;
        self.dirty_head = None;
        self.free.clear();
        for (slot, frame) in self.frames.iter_mut().enumerate() {
            frame.pgno = 0;
            frame.n_ref = 0;
            frame.flags = PgFlags::empty();
            frame.lru_next = None;
            frame.lru_prev = None;
            frame.dirty_next = None;
            frame.dirty_prev = None;
            self.free.push(slot);
        }
    }

    /// Drop cached pages with numbers >= `pgno_limit` (used when the
    /// database image shrinks). A frame still referenced — say, pinned by
    /// a cursor — is detached instead: lookups miss it, its holder's
    /// release becomes a no-op, and the slot is reclaimed at the next
    /// purge.
    pub fn truncate(&mut self, pgno_limit: Pgno) {
        let doomed: Vec<usize> = self
            .map
            .iter()
            .filter(|(&pgno, _)| pgno >= pgno_limit)
            .map(|(_, &slot)| slot)
            .collect();
        for slot in doomed {
            if self.frames[slot].n_ref == 0 {
                self.erase(slot);
            } else {
                let pgno = self.frames[slot].pgno;
                self.map.remove(&pgno);
                if self.frames[slot].flags.contains(PgFlags::DIRTY) {
                    self.dirty_remove(slot);
                }
                self.frames[slot].flags = PgFlags::empty();
            }
        }
    }

    // ========================================================================
    // Reference counting
    // ========================================================================

    pub fn ref_page(&mut self, slot: usize) {
        if self.frames[slot].n_ref == 0 {
            self.lru_remove(slot);
        }
        self.frames[slot].n_ref += 1;
        self.n_ref_sum += 1;
    }

    pub fn unref(&mut self, slot: usize) {
        debug_assert!(self.frames[slot].n_ref > 0);
        self.frames[slot].n_ref -= 1;
        self.n_ref_sum -= 1;
        if self.frames[slot].n_ref == 0 && self.frames[slot].flags.contains(PgFlags::CACHED) {
            self.lru_push_head(slot);
        }
    }

    pub fn ref_count(&self, slot: usize) -> u32 {
        self.frames[slot].n_ref
    }

    /// Build a handle for a referenced frame
    pub fn make_ref(&self, slot: usize) -> PageRef {
        debug_assert!(self.frames[slot].n_ref > 0);
        PageRef {
            pgno: self.frames[slot].pgno,
            slot,
            buf: Rc::clone(&self.frames[slot].buf),
        }
    }

    pub fn frame_pgno(&self, slot: usize) -> Pgno {
        self.frames[slot].pgno
    }

    /// Whether `slot` still holds the frame a handle for `pgno` was built
    /// from. A purge or eviction in between makes the handle stale.
    pub fn valid_slot(&self, slot: usize, pgno: Pgno) -> bool {
        slot < self.frames.len()
            && self.frames[slot].pgno == pgno
            && self.frames[slot].flags.contains(PgFlags::CACHED)
    }

    pub fn frame_data(&self, slot: usize) -> Ref<'_, Vec<u8>> {
        self.frames[slot].buf.borrow()
    }

    pub fn frame_data_mut(&self, slot: usize) -> RefMut<'_, Vec<u8>> {
        self.frames[slot].buf.borrow_mut()
    }

    // ========================================================================
    // Dirty list
    // ========================================================================

    pub fn is_dirty(&self, slot: usize) -> bool {
        self.frames[slot].flags.contains(PgFlags::DIRTY)
    }

    pub fn has_dirty(&self) -> bool {
        self.dirty_head.is_some()
    }

    pub fn dirty_add(&mut self, slot: usize) {
        let frame = &mut self.frames[slot];
        debug_assert!(frame.flags.contains(PgFlags::CACHED));
        if frame.flags.contains(PgFlags::DIRTY) {
            return;
        }
        frame.flags.insert(PgFlags::DIRTY);
        frame.dirty_prev = None;
        frame.dirty_next = self.dirty_head;
        if let Some(head) = self.dirty_head {
            self.frames[head].dirty_prev = Some(slot);
        }
        self.dirty_head = Some(slot);
    }

    pub fn dirty_remove(&mut self, slot: usize) {
        if !self.frames[slot].flags.contains(PgFlags::DIRTY) {
            return;
        }
        let (prev, next) = {
            let frame = &mut self.frames[slot];
            frame.flags.remove(PgFlags::DIRTY);
            (frame.dirty_prev.take(), frame.dirty_next.take())
        };
        match prev {
            Some(p) => self.frames[p].dirty_next = next,
            None => self.dirty_head = next,
        }
        if let Some(n) = next {
            self.frames[n].dirty_prev = prev;
        }
    }

    /// Clear the dirty flag from every frame, leaving contents intact
    pub fn clean_all(&mut self) {
        while let Some(slot) = self.dirty_head {
            self.dirty_remove(slot);
        }
    }

    /// All dirty frames in ascending page-number order. Sorting uses a
    /// bucketed bottom-up merge over the singly linked dirty chain.
    pub fn sorted_dirty(&mut self) -> Vec<usize> {
        let mut buckets: [Vec<usize>; SORT_BUCKETS] = Default::default();
        let mut cursor = self.dirty_head;
        while let Some(slot) = cursor {
            cursor = self.frames[slot].dirty_next;
            let mut carry = vec![slot];
            for bucket in buckets.iter_mut() {
                if bucket.is_empty() {
                    *bucket = carry;
                    carry = Vec::new();
                    break;
                }
                carry = self.merge_by_pgno(std::mem::take(bucket), carry);
            }
            if !carry.is_empty() {
                // Deep list: fold the overflow into the last bucket.
                let last = SORT_BUCKETS - 1;
                buckets[last] = self.merge_by_pgno(std::mem::take(&mut buckets[last]), carry);
            }
        }
        let mut result = Vec::new();
        for bucket in buckets.into_iter() {
            if !bucket.is_empty() {
                result = self.merge_by_pgno(result, bucket);
            }
        }
        result
    }

    fn merge_by_pgno(&self, a: Vec<usize>, b: Vec<usize>) -> Vec<usize> {
        let mut out = Vec::with_capacity(a.len() + b.len());
        let (mut i, mut j) = (0, 0);
        while i < a.len() && j < b.len() {
            if self.frames[a[i]].pgno <= self.frames[b[j]].pgno {
                out.push(a[i]);
                i += 1;
            } else {
                out.push(b[j]);
                j += 1;
            }
        }
        out.extend_from_slice(&a[i..]);
        out.extend_from_slice(&b[j..]);
        out
    }

    // ========================================================================
    // LRU list
    // ========================================================================

    fn lru_push_head(&mut self, slot: usize) {
        let frame = &mut self.frames[slot];
        frame.lru_prev = None;
        frame.lru_next = self.lru_head;
        if let Some(head) = self.lru_head {
            self.frames[head].lru_prev = Some(slot);
        } else {
            self.lru_tail = Some(slot);
        }
        self.lru_head = Some(slot);
    }

    fn lru_remove(&mut self, slot: usize) {
        let on_list = self.lru_head == Some(slot) || self.frames[slot].lru_prev.is_some();
        if !on_list {
            return;
        }
        let (prev, next) = {
            let frame = &mut self.frames[slot];
            (frame.lru_prev.take(), frame.lru_next.take())
        };
        match prev {
            Some(p) => self.frames[p].lru_next = next,
            None => self.lru_head = next,
        }
        match next {
            Some(n) => self.frames[n].lru_prev = prev,
            None => self.lru_tail = prev,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with_pages(pgnos: &[Pgno]) -> (PageCache, Vec<usize>) {
        let mut cache = PageCache::new(512, 8);
        let slots = pgnos
            .iter()
            .map(|&pgno| {
                let slot = cache.allocate();
                cache.register_page(slot, pgno);
                slot
            })
            .collect();
        (cache, slots)
    }

    #[test]
    fn test_query_does_not_touch_stats() {
        let (mut cache, slots) = cache_with_pages(&[1, 2]);
        assert_eq!(cache.query(1), Some(slots[0]));
        assert_eq!(cache.query(3), None);
        assert_eq!(cache.hits(), 0);
        assert_eq!(cache.misses(), 0);
        assert!(cache.lookup(1).is_some());
        assert!(cache.lookup(3).is_none());
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn test_refcount_moves_between_lists() {
        let (mut cache, slots) = cache_with_pages(&[5]);
        // Unreferenced frames are not victims until placed on the LRU list
        // by an unref transition.
        cache.ref_page(slots[0]);
        assert_eq!(cache.next_victim(), None);
        cache.unref(slots[0]);
        assert_eq!(cache.next_victim(), Some(slots[0]));
        assert_eq!(cache.ref_sum(), 0);
    }

    #[test]
    fn test_lru_order() {
        let (mut cache, slots) = cache_with_pages(&[1, 2, 3]);
        for &slot in &slots {
            cache.ref_page(slot);
            cache.unref(slot);
        }
        // Page 1 was released first, so it is the LRU tail.
        assert_eq!(cache.next_victim(), Some(slots[0]));
        // Touching page 1 promotes it; page 2 becomes the victim.
        cache.lookup(1);
        assert_eq!(cache.next_victim(), Some(slots[1]));
    }

    #[test]
    fn test_erase_recycles_frame() {
        let (mut cache, slots) = cache_with_pages(&[7]);
        cache.erase(slots[0]);
        assert_eq!(cache.query(7), None);
        let slot = cache.allocate();
        assert_eq!(slot, slots[0]);
    }

    #[test]
    fn test_dirty_implies_cached() {
        let (mut cache, slots) = cache_with_pages(&[4]);
        cache.dirty_add(slots[0]);
        assert!(cache.is_dirty(slots[0]));
        cache.dirty_remove(slots[0]);
        assert!(!cache.is_dirty(slots[0]));
        assert!(!cache.has_dirty());
    }

    #[test]
    fn test_sorted_dirty_ascending() {
        let pgnos: Vec<Pgno> = vec![9, 3, 12, 1, 7, 5, 2, 11];
        let (mut cache, slots) = cache_with_pages(&pgnos);
        for &slot in &slots {
            cache.dirty_add(slot);
        }
        let sorted = cache.sorted_dirty();
        let order: Vec<Pgno> = sorted.iter().map(|&s| cache.frame_pgno(s)).collect();
        assert_eq!(order, vec![1, 2, 3, 5, 7, 9, 11, 12]);
    }

    #[test]
    fn test_clean_all() {
        let (mut cache, slots) = cache_with_pages(&[1, 2, 3]);
        for &slot in &slots {
            cache.dirty_add(slot);
        }
        cache.clean_all();
        assert!(!cache.has_dirty());
        for &slot in &slots {
            assert!(!cache.is_dirty(slot));
        }
    }

    #[test]
    fn test_truncate_drops_high_pages() {
        let (mut cache, _slots) = cache_with_pages(&[1, 2, 3, 4, 5]);
        cache.truncate(3);
        assert!(cache.query(1).is_some());
        assert!(cache.query(2).is_some());
        assert!(cache.query(3).is_none());
        assert!(cache.query(5).is_none());
    }

    #[test]
    fn test_purge() {
        let (mut cache, _slots) = cache_with_pages(&[1, 2]);
        cache.purge();
        assert_eq!(cache.query(1), None);
        assert_eq!(cache.occupied(), 0);
    }

    #[test]
    fn test_page_ref_shares_buffer() {
        let (mut cache, slots) = cache_with_pages(&[6]);
        cache.ref_page(slots[0]);
        let page = cache.make_ref(slots[0]);
        page.data_mut()[0] = 0xAB;
        let again = cache.make_ref(slots[0]);
        assert_eq!(again.data()[0], 0xAB);
        cache.unref(slots[0]);
    }
}
