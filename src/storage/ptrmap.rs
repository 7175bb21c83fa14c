//! Pointer-map pages
//!
//! Page 2 and every page a fixed stride after it is a pointer-map page. For
//! each following non-map page the map stores a 5-byte entry: a one-byte
//! page type and the 4-byte "back pointer" (tree parent, overflow
//! predecessor, or owning freelist trunk). Back pointers make parent lookup
//! O(1) and are what vacuum uses to relocate pages.

use crate::error::{Error, Result};
use crate::storage::pager::Pager;
use crate::types::Pgno;
use crate::util::encoding::{get_u32, put_u32};

/// First pointer-map page
pub const FIRST_MAP_PAGE: Pgno = 2;

/// Bytes per pointer-map entry: type (1) + back pointer (4)
pub const ENTRY_SIZE: usize = 5;

/// Page type recorded in a pointer-map entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PageKind {
    #[default]
    Empty = 0,
    TreeNode = 1,
    TreeRoot = 2,
    OverflowHead = 3,
    OverflowLink = 4,
    FreelistTrunk = 5,
    FreelistLeaf = 6,
}

impl PageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PageKind::Empty),
            1 => Some(PageKind::TreeNode),
            2 => Some(PageKind::TreeRoot),
            3 => Some(PageKind::OverflowHead),
            4 => Some(PageKind::OverflowLink),
            5 => Some(PageKind::FreelistTrunk),
            6 => Some(PageKind::FreelistLeaf),
            _ => None,
        }
    }

    pub fn is_overflow(self) -> bool {
        matches!(self, PageKind::OverflowHead | PageKind::OverflowLink)
    }

    pub fn is_freelist(self) -> bool {
        matches!(self, PageKind::FreelistTrunk | PageKind::FreelistLeaf)
    }
}

/// One pointer-map entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Entry {
    pub back_ptr: Pgno,
    pub kind: PageKind,
}

/// Pages covered by one map page, including the map page itself
fn stride(page_size: u32) -> u32 {
    page_size / ENTRY_SIZE as u32 + 1
}

/// The map page holding the entry for `pgno`, or 0 when `pgno` has no
/// entry (page 1). Returns `pgno` itself when `pgno` is a map page.
pub fn lookup(pgno: Pgno, page_size: u32) -> Pgno {
    if pgno < FIRST_MAP_PAGE {
        return 0;
    }
    let len = stride(page_size);
    let idx = (pgno - FIRST_MAP_PAGE) / len;
    idx * len + FIRST_MAP_PAGE
}

/// A page is a map page iff its own lookup resolves to itself
pub fn is_map(pgno: Pgno, page_size: u32) -> bool {
    lookup(pgno, page_size) == pgno
}

fn entry_offset(map_id: Pgno, pgno: Pgno) -> usize {
    debug_assert!(map_id < pgno);
    ((pgno - map_id - 1) as usize) * ENTRY_SIZE
}

/// Read the pointer-map entry for `pgno`
pub fn read_entry(pager: &mut Pager, pgno: Pgno) -> Result<Entry> {
    let map_id = lookup(pgno, pager.page_size());
    if map_id == 0 || pgno <= map_id {
        return Err(Error::corruption(format!(
            "page {} has no pointer-map entry",
            pgno
        )));
    }
    let offset = entry_offset(map_id, pgno);
    let map = pager.acquire(map_id)?;
    let entry = {
        let data = map.data();
        let kind = PageKind::from_u8(data[offset]);
        let back_ptr = get_u32(&data[offset + 1..]);
        kind.map(|kind| Entry { back_ptr, kind })
    };
    pager.release(map);
    entry.ok_or_else(|| Error::corruption(format!("invalid pointer-map type for page {}", pgno)))
}

/// Write the pointer-map entry for `pgno`, dirtying the map page only when
/// the entry actually changes.
pub fn write_entry(pager: &mut Pager, pgno: Pgno, entry: Entry) -> Result<()> {
    let map_id = lookup(pgno, pager.page_size());
    if map_id == 0 || pgno <= map_id {
        return Err(Error::corruption(format!(
            "page {} has no pointer-map entry",
            pgno
        )));
    }
    let offset = entry_offset(map_id, pgno);
    let map = pager.acquire(map_id)?;
    let current = {
        let data = map.data();
        (data[offset], get_u32(&data[offset + 1..]))
    };
    if current != (entry.kind as u8, entry.back_ptr) {
        pager.mark_dirty(&map)?;
        let mut data = map.data_mut();
        data[offset] = entry.kind as u8;
        put_u32(&mut data[offset + 1..], entry.back_ptr);
    }
    pager.release(map);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_page_one_has_no_entry() {
        assert_eq!(lookup(1, 4096), 0);
    }

    #[test]
    fn test_page_two_is_first_map() {
        assert!(is_map(2, 4096));
        assert_eq!(lookup(2, 4096), 2);
    }

    #[test]
    fn test_map_stride() {
        let page_size = 4096u32;
        let len = page_size / 5 + 1; // 820
        // Pages 3..=2+len-1 map to page 2.
        assert_eq!(lookup(3, page_size), 2);
        assert_eq!(lookup(2 + len - 1, page_size), 2);
        // The next map page starts a new stride.
        assert!(is_map(2 + len, page_size));
        assert_eq!(lookup(2 + len + 1, page_size), 2 + len);
    }

    #[test]
    fn test_entry_offsets_fit_in_page() {
        let page_size = 512u32;
        let len = stride(page_size); // 103
        let map = 2u32;
        let last_covered = map + len - 1;
        assert_eq!(lookup(last_covered, page_size), map);
        let offset = entry_offset(map, last_covered);
        assert!(offset + ENTRY_SIZE <= page_size as usize);
    }

    #[test]
    fn test_page_kind_codec() {
        for kind in [
            PageKind::Empty,
            PageKind::TreeNode,
            PageKind::TreeRoot,
            PageKind::OverflowHead,
            PageKind::OverflowLink,
            PageKind::FreelistTrunk,
            PageKind::FreelistLeaf,
        ] {
            assert_eq!(PageKind::from_u8(kind as u8), Some(kind));
        }
        assert_eq!(PageKind::from_u8(99), None);
        assert!(PageKind::OverflowHead.is_overflow());
        assert!(PageKind::FreelistLeaf.is_freelist());
        assert!(!PageKind::TreeNode.is_overflow());
    }
}
