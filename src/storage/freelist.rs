//! Freelist of reusable pages
//!
//! A singly linked list of trunk pages headed by the file header's freelist
//! field. Each trunk stores a next-trunk pointer, a leaf count, and up to
//! `(page_size - 8) / 4` leaf page numbers. Pushing onto a full head trunk
//! turns the pushed page into the new head trunk; popping drains leaves
//! before consuming the trunk itself.

use crate::error::{Error, Result};
use crate::storage::pager::Pager;
use crate::storage::pcache::PageRef;
use crate::storage::ptrmap::{self, Entry, PageKind, FIRST_MAP_PAGE};
use crate::types::Pgno;
use crate::util::encoding::{get_u32, put_u32};

/// Leaf page numbers a trunk page can hold
pub fn trunk_capacity(page_size: u32) -> u32 {
    (page_size - 8) / 4
}

fn leaf_offset(index: u32) -> usize {
    (index as usize + 2) * 4
}

/// True when the freelist holds no pages
pub fn is_empty(pager: &Pager) -> bool {
    pager.freelist_head() == 0
}

/// Move `page` onto the freelist. Consumes the reference.
pub fn push(pager: &mut Pager, page: PageRef) -> Result<()> {
    let pgno = page.pgno;
    if pgno < FIRST_MAP_PAGE || pgno > pager.page_count() {
        pager.release(page);
        return Err(Error::corruption(format!(
            "cannot free page {} of {}",
            pgno,
            pager.page_count()
        )));
    }
    let free_head = pager.freelist_head();
    if free_head > pager.page_count() {
        pager.release(page);
        return Err(Error::corruption("freelist head out of range"));
    }
    let count = pager.freelist_count();

    if free_head != 0 {
        let trunk = pager.acquire(free_head)?;
        let n = get_u32(&trunk.data()[4..]);
        let capacity = trunk_capacity(pager.page_size());
        if n < capacity {
            // Room in the head trunk: record the page as a leaf.
            pager.mark_dirty(&trunk)?;
            {
                let mut data = trunk.data_mut();
                put_u32(&mut data[4..], n + 1);
                put_u32(&mut data[leaf_offset(n)..], pgno);
            }
            pager.release(trunk);
            pager.release(page);
            pager.set_freelist_count(count + 1)?;
            return ptrmap::write_entry(
                pager,
                pgno,
                Entry {
                    back_ptr: free_head,
                    kind: PageKind::FreelistLeaf,
                },
            );
        }
        pager.release(trunk);
        if n > capacity {
            pager.release(page);
            return Err(Error::corruption("freelist trunk overflowed"));
        }
        // The head trunk is full: `page` becomes the new head, so the old
        // head's back pointer must point at it.
        ptrmap::write_entry(
            pager,
            free_head,
            Entry {
                back_ptr: pgno,
                kind: PageKind::FreelistTrunk,
            },
        )?;
    }

    // Turn `page` into a blank trunk linked to the previous head.
    pager.mark_dirty(&page)?;
    {
        let mut data = page.data_mut();
        put_u32(&mut data[0..], free_head);
        put_u32(&mut data[4..], 0);
    }
    pager.release(page);
    pager.set_freelist_head(pgno)?;
    pager.set_freelist_count(count + 1)?;
    ptrmap::write_entry(
        pager,
        pgno,
        Entry {
            back_ptr: 0,
            kind: PageKind::FreelistTrunk,
        },
    )
}

/// Take a page off the freelist, or None when it is empty. The caller owns
/// the returned page number and must write its pointer-map entry once the
/// new back pointer and type are known.
pub fn pop(pager: &mut Pager) -> Result<Option<Pgno>> {
    let free_head = pager.freelist_head();
    if free_head == 0 {
        return Ok(None);
    }
    if free_head > pager.page_count() {
        return Err(Error::corruption("freelist head out of range"));
    }
    let count = pager.freelist_count();

    let trunk = pager.acquire(free_head)?;
    let n = get_u32(&trunk.data()[4..]);
    if n > trunk_capacity(pager.page_size()) {
        pager.release(trunk);
        return Err(Error::corruption("freelist trunk overflowed"));
    }

    let popped;
    if n > 0 {
        // Take the most recently pushed leaf.
        pager.mark_dirty(&trunk)?;
        {
            let mut data = trunk.data_mut();
            popped = get_u32(&data[leaf_offset(n - 1)..]);
            put_u32(&mut data[leaf_offset(n - 1)..], 0);
            put_u32(&mut data[4..], n - 1);
        }
        pager.release(trunk);
        if popped == 0 || popped > pager.page_count() {
            return Err(Error::corruption("freelist leaf out of range"));
        }
    } else {
        // Trunk is empty: promote it to the caller and advance the head.
        popped = free_head;
        let next_head = get_u32(&trunk.data()[0..]);
        pager.release(trunk);
        pager.set_freelist_head(next_head)?;
        if next_head != 0 {
            ptrmap::write_entry(
                pager,
                next_head,
                Entry {
                    back_ptr: 0,
                    kind: PageKind::FreelistTrunk,
                },
            )?;
        }
    }
    pager.set_freelist_count(count.saturating_sub(1))?;
    Ok(Some(popped))
}

/// Count the pages on the freelist by walking the trunk chain. Used by
/// vacuum, which needs the exact figure rather than the header hint.
pub fn total_size(pager: &mut Pager) -> Result<u32> {
    let mut size = 0;
    let mut head = pager.freelist_head();
    let mut hops = 0;
    while head != 0 {
        let trunk = pager.acquire(head)?;
        let (n, next) = {
            let data = trunk.data();
            (get_u32(&data[4..]), get_u32(&data[0..]))
        };
        pager.release(trunk);
        size += 1 + n;
        head = next;
        hops += 1;
        if hops > pager.page_count() {
            return Err(Error::corruption("freelist trunk chain has a cycle"));
        }
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trunk_capacity() {
        assert_eq!(trunk_capacity(512), 126);
        assert_eq!(trunk_capacity(4096), 1022);
        assert_eq!(trunk_capacity(65536), 16382);
    }

    #[test]
    fn test_leaf_offsets_fit() {
        let page_size = 512u32;
        let last = trunk_capacity(page_size) - 1;
        assert!(leaf_offset(last) + 4 <= page_size as usize);
    }
}
