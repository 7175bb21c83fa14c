//! Tree behavior tests over a real pager

#![cfg(unix)]

use std::cell::Cell as StdCell;
use std::collections::HashMap;
use std::rc::Rc;

use super::*;
use crate::storage::btree::cursor::Cursor;
use crate::storage::header::FileHeader;
use crate::storage::pager::{Pager, PagerOptions};
use crate::types::MIN_CACHE_FRAMES;

const PAGE: u32 = 512;

struct Fixture {
    path: String,
}

impl Fixture {
    fn new(name: &str) -> Self {
        let path = std::env::temp_dir()
            .join(format!("otterdb-tree-{}", name))
            .to_string_lossy()
            .into_owned();
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", path, suffix));
        }
        Fixture { path }
    }

    /// Open a pager whose page 1 is a valid file header plus an empty leaf
    /// root, mirroring what Db::open lays down.
    fn open(&self) -> Pager {
        let options = PagerOptions {
            path: self.path.clone(),
            page_size: PAGE,
            cache_size_bytes: PAGE as usize * MIN_CACHE_FRAMES * 4,
            ..Default::default()
        };
        let mut pager = Pager::open(crate::os::vfs::default_vfs(), options).unwrap();
        if pager.is_new() {
            pager.begin(true).unwrap();
            let root = pager.acquire_root();
            pager.mark_dirty(&root).unwrap();
            FileHeader::new(PAGE).write(&mut root.data_mut());
            let node = Node::from_new_page(root, PAGE, true);
            pager.release(node.page);
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

fn tree_at_root_page() -> Tree {
    Tree::new(Rc::new(StdCell::new(1)), PAGE)
}

fn key_of(i: u32) -> Vec<u8> {
    format!("key{:05}", i).into_bytes()
}

fn value_of(i: u32) -> Vec<u8> {
    format!("value-{:05}-{}", i, "x".repeat((i % 13) as usize)).into_bytes()
}

/// Collect every key via a cursor walk from the first record
fn collect_keys(pager: &mut Pager, tree: &Tree) -> Vec<Vec<u8>> {
    let mut cursor = Cursor::new(tree.root_cell(), tree.epoch(), PAGE);
    cursor.seek_first(pager).unwrap();
    let mut keys = Vec::new();
    while cursor.is_valid() {
        keys.push(cursor.key().to_vec());
        cursor.next(pager).unwrap();
    }
    cursor.clear(pager);
    keys
}

#[test]
fn test_put_get_roundtrip() {
    let fx = Fixture::new("roundtrip");
    let mut pager = fx.open();
    let mut tree = tree_at_root_page();

    pager.begin(true).unwrap();
    tree.put(&mut pager, b"hello", b"world").unwrap();
    assert_eq!(tree.get(&mut pager, b"hello").unwrap().unwrap(), b"world");
    assert_eq!(tree.get(&mut pager, b"missing").unwrap(), None);
    pager.commit().unwrap();

    pager.begin(false).unwrap();
    assert_eq!(tree.get(&mut pager, b"hello").unwrap().unwrap(), b"world");
    pager.rollback().unwrap();
    pager.close().unwrap();
}

#[test]
fn test_put_replaces_value() {
    let fx = Fixture::new("replace");
    let mut pager = fx.open();
    let mut tree = tree_at_root_page();

    pager.begin(true).unwrap();
    tree.put(&mut pager, b"k", b"first").unwrap();
    tree.put(&mut pager, b"k", b"second").unwrap();
    assert_eq!(tree.get(&mut pager, b"k").unwrap().unwrap(), b"second");
    pager.commit().unwrap();
    pager.close().unwrap();
}

#[test]
fn test_empty_key_rejected() {
    let fx = Fixture::new("emptykey");
    let mut pager = fx.open();
    let mut tree = tree_at_root_page();

    pager.begin(true).unwrap();
    let err = tree.put(&mut pager, b"", b"v").unwrap_err();
    assert_eq!(err.code(), crate::error::ErrorCode::InvalidArgument);
    pager.rollback().unwrap();
    pager.close().unwrap();
}

#[test]
fn test_erase_and_not_found() {
    let fx = Fixture::new("erase");
    let mut pager = fx.open();
    let mut tree = tree_at_root_page();

    pager.begin(true).unwrap();
    tree.put(&mut pager, b"a", b"1").unwrap();
    tree.erase(&mut pager, b"a").unwrap();
    assert_eq!(tree.get(&mut pager, b"a").unwrap(), None);
    assert!(tree.erase(&mut pager, b"a").unwrap_err().is_not_found());
    pager.commit().unwrap();
    pager.close().unwrap();
}

#[test]
fn test_sequential_inserts_split_and_stay_sorted() {
    let fx = Fixture::new("seq");
    let mut pager = fx.open();
    let mut tree = tree_at_root_page();
    let n = 500;

    pager.begin(true).unwrap();
    for i in 0..n {
        tree.put(&mut pager, &key_of(i), &value_of(i)).unwrap();
    }
    // The tree grew past one node.
    assert!(pager.page_count() > 3);
    for i in [0, 1, n / 2, n - 2, n - 1] {
        assert_eq!(
            tree.get(&mut pager, &key_of(i)).unwrap().unwrap(),
            value_of(i)
        );
    }
    tree.validate(&mut pager).unwrap();

    let keys = collect_keys(&mut pager, &tree);
    assert_eq!(keys.len(), n as usize);
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(key, &key_of(i as u32));
    }
    pager.commit().unwrap();
    pager.close().unwrap();
}

#[test]
fn test_random_order_inserts() {
    let fx = Fixture::new("random");
    let mut pager = fx.open();
    let mut tree = tree_at_root_page();
    let n = 400u32;

    pager.begin(true).unwrap();
    // 7919 is coprime with n, so this visits every index once.
    for i in 0..n {
        let j = (i * 7919) % n;
        tree.put(&mut pager, &key_of(j), &value_of(j)).unwrap();
    }
    tree.validate(&mut pager).unwrap();
    let keys = collect_keys(&mut pager, &tree);
    assert_eq!(keys.len(), n as usize);
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(key, &key_of(i as u32));
    }
    pager.commit().unwrap();
    pager.close().unwrap();
}

#[test]
fn test_large_value_overflow_chain() {
    let fx = Fixture::new("overflow");
    let mut pager = fx.open();
    let mut tree = tree_at_root_page();

    let big: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    pager.begin(true).unwrap();
    tree.put(&mut pager, b"big", &big).unwrap();
    assert_eq!(tree.get(&mut pager, b"big").unwrap().unwrap(), big);
    tree.validate(&mut pager).unwrap();
    pager.commit().unwrap();

    // Still intact after reopening the snapshot.
    pager.begin(false).unwrap();
    assert_eq!(tree.get(&mut pager, b"big").unwrap().unwrap(), big);
    pager.rollback().unwrap();
    pager.close().unwrap();
}

#[test]
fn test_long_key_overflow() {
    let fx = Fixture::new("longkey");
    let mut pager = fx.open();
    let mut tree = tree_at_root_page();

    let long_key: Vec<u8> = (0..2000u32).map(|i| b'a' + (i % 26) as u8).collect();
    pager.begin(true).unwrap();
    tree.put(&mut pager, &long_key, b"v").unwrap();
    tree.put(&mut pager, b"short", b"w").unwrap();
    assert_eq!(tree.get(&mut pager, &long_key).unwrap().unwrap(), b"v");
    assert_eq!(tree.get(&mut pager, b"short").unwrap().unwrap(), b"w");
    tree.validate(&mut pager).unwrap();
    pager.commit().unwrap();
    pager.close().unwrap();
}

#[test]
fn test_replacing_spilled_value_frees_chain() {
    let fx = Fixture::new("respill");
    let mut pager = fx.open();
    let mut tree = tree_at_root_page();

    let big = vec![0xABu8; 4000];
    pager.begin(true).unwrap();
    tree.put(&mut pager, b"k", &big).unwrap();
    let pages_before = pager.page_count();
    tree.put(&mut pager, b"k", &big).unwrap();
    // The replacement reuses the freed chain pages instead of growing the
    // file.
    assert_eq!(pager.page_count(), pages_before);
    assert_eq!(tree.get(&mut pager, b"k").unwrap().unwrap(), big);
    pager.commit().unwrap();
    pager.close().unwrap();
}

#[test]
fn test_erase_triggers_merges() {
    let fx = Fixture::new("merge");
    let mut pager = fx.open();
    let mut tree = tree_at_root_page();
    let n = 300u32;

    pager.begin(true).unwrap();
    for i in 0..n {
        tree.put(&mut pager, &key_of(i), &value_of(i)).unwrap();
    }
    // Erase from the middle out so interior nodes drain and merge.
    for i in 0..n {
        if i % 4 != 0 {
            tree.erase(&mut pager, &key_of(i)).unwrap();
        }
    }
    tree.validate(&mut pager).unwrap();

    let keys = collect_keys(&mut pager, &tree);
    let expected: Vec<Vec<u8>> = (0..n).filter(|i| i % 4 == 0).map(key_of).collect();
    assert_eq!(keys, expected);
    pager.commit().unwrap();
    pager.close().unwrap();
}

#[test]
fn test_erase_everything_leaves_empty_root() {
    let fx = Fixture::new("drain");
    let mut pager = fx.open();
    let mut tree = tree_at_root_page();
    let n = 200u32;

    pager.begin(true).unwrap();
    for i in 0..n {
        tree.put(&mut pager, &key_of(i), &value_of(i)).unwrap();
    }
    for i in 0..n {
        tree.erase(&mut pager, &key_of(i)).unwrap();
    }
    tree.validate(&mut pager).unwrap();
    assert_eq!(tree.get(&mut pager, &key_of(0)).unwrap(), None);

    let mut cursor = Cursor::new(tree.root_cell(), tree.epoch(), PAGE);
    cursor.seek_first(&mut pager).unwrap();
    assert!(!cursor.is_valid());
    cursor.clear(&mut pager);

    // All interior pages went back to the freelist.
    assert!(pager.freelist_count() > 0);
    pager.commit().unwrap();
    pager.close().unwrap();
}

#[test]
fn test_cursor_seek_and_bidirectional_iteration() {
    let fx = Fixture::new("cursor");
    let mut pager = fx.open();
    let mut tree = tree_at_root_page();

    pager.begin(true).unwrap();
    for i in (0..100u32).step_by(2) {
        tree.put(&mut pager, &key_of(i), &value_of(i)).unwrap();
    }

    let mut cursor = Cursor::new(tree.root_cell(), tree.epoch(), PAGE);
    // Seek to a missing key lands on its successor.
    cursor.seek(&mut pager, &key_of(11)).unwrap();
    assert!(cursor.is_valid());
    assert_eq!(cursor.key(), key_of(12).as_slice());
    assert_eq!(cursor.value(), value_of(12).as_slice());

    cursor.next(&mut pager).unwrap();
    assert_eq!(cursor.key(), key_of(14).as_slice());
    cursor.previous(&mut pager).unwrap();
    assert_eq!(cursor.key(), key_of(12).as_slice());

    // Walk off the front.
    cursor.seek_first(&mut pager).unwrap();
    assert_eq!(cursor.key(), key_of(0).as_slice());
    cursor.previous(&mut pager).unwrap();
    assert!(!cursor.is_valid());

    // find() is exact.
    assert!(cursor.find(&mut pager, &key_of(13)).unwrap_err().is_not_found());
    cursor.find(&mut pager, &key_of(14)).unwrap();
    assert_eq!(cursor.value(), value_of(14).as_slice());

    cursor.seek_last(&mut pager).unwrap();
    assert_eq!(cursor.key(), key_of(98).as_slice());

    cursor.clear(&mut pager);
    pager.commit().unwrap();
    pager.close().unwrap();
}

#[test]
fn test_cursor_survives_interleaved_writes() {
    let fx = Fixture::new("stale");
    let mut pager = fx.open();
    let mut tree = tree_at_root_page();

    pager.begin(true).unwrap();
    for i in 0..50u32 {
        tree.put(&mut pager, &key_of(i), b"v").unwrap();
    }

    let mut cursor = Cursor::new(tree.root_cell(), tree.epoch(), PAGE);
    cursor.find(&mut pager, &key_of(10)).unwrap();

    // Mutate the tree behind the cursor's back.
    tree.erase(&mut pager, &key_of(11)).unwrap();
    tree.put(&mut pager, &key_of(200), b"v").unwrap();

    // The stale cursor restores its position and lands on the successor
    // of the erased key.
    cursor.next(&mut pager).unwrap();
    assert_eq!(cursor.key(), key_of(12).as_slice());

    // Erasing the cursor's own key: the next step resumes at its
    // successor rather than skipping it.
    tree.erase(&mut pager, &key_of(12)).unwrap();
    cursor.next(&mut pager).unwrap();
    assert_eq!(cursor.key(), key_of(13).as_slice());

    cursor.clear(&mut pager);
    pager.commit().unwrap();
    pager.close().unwrap();
}

#[test]
fn test_tree_destroy_frees_pages() {
    let fx = Fixture::new("destroy");
    let mut pager = fx.open();

    pager.begin(true).unwrap();
    let root = Tree::create(&mut pager).unwrap();
    let mut tree = Tree::new(Rc::new(StdCell::new(root)), PAGE);
    for i in 0..100u32 {
        tree.put(&mut pager, &key_of(i), &vec![b'x'; 600]).unwrap();
    }
    let free_before = pager.freelist_count();
    tree.destroy(&mut pager).unwrap();
    assert!(pager.freelist_count() > free_before);
    pager.commit().unwrap();
    pager.close().unwrap();
}

#[test]
fn test_vacuum_shrinks_file_and_preserves_records() {
    let fx = Fixture::new("vacuum");
    let mut pager = fx.open();
    let mut tree = tree_at_root_page();
    let n = 200u32;

    pager.begin(true).unwrap();
    for i in 0..n {
        // Every third record spills to an overflow chain.
        let value = if i % 3 == 0 {
            vec![(i % 251) as u8; 1500]
        } else {
            value_of(i)
        };
        tree.put(&mut pager, &key_of(i), &value).unwrap();
    }
    for i in 0..n {
        if i % 2 == 1 {
            tree.erase(&mut pager, &key_of(i)).unwrap();
        }
    }
    let pages_before = pager.page_count();
    assert!(pager.freelist_count() > 0);

    let mut reroots = HashMap::new();
    vacuum_db(&mut pager, &mut reroots).unwrap();
    assert!(pager.page_count() < pages_before);
    assert_eq!(pager.freelist_count(), 0);

    tree.validate(&mut pager).unwrap();
    for i in 0..n {
        let got = tree.get(&mut pager, &key_of(i)).unwrap();
        if i % 2 == 1 {
            assert_eq!(got, None, "key {}", i);
        } else if i % 3 == 0 {
            assert_eq!(got.unwrap(), vec![(i % 251) as u8; 1500], "key {}", i);
        } else {
            assert_eq!(got.unwrap(), value_of(i), "key {}", i);
        }
    }
    pager.commit().unwrap();

    // The shrunken image survives commit and checkpoint.
    pager.checkpoint(true).unwrap();
    pager.begin(false).unwrap();
    assert_eq!(
        tree.get(&mut pager, &key_of(0)).unwrap().unwrap(),
        vec![0u8; 1500]
    );
    pager.rollback().unwrap();
    pager.close().unwrap();
}

#[test]
fn test_truncate_suffix_minimal_pivots() {
    assert_eq!(truncate_suffix(b"apple", b"banana"), b"b".to_vec());
    assert_eq!(truncate_suffix(b"abcd", b"abce"), b"abce".to_vec());
    assert_eq!(truncate_suffix(b"abc", b"abcdef"), b"abcd".to_vec());
    assert_eq!(truncate_suffix(b"a", b"ab"), b"ab".to_vec());
}

#[test]
fn test_boundary_payload_sizes() {
    let fx = Fixture::new("boundary");
    let mut pager = fx.open();
    let mut tree = tree_at_root_page();
    let max = node::max_local(PAGE) as usize;

    pager.begin(true).unwrap();
    // Sizes straddling the local-payload limit, plus degenerate ones.
    for (i, value_len) in [0usize, 1, max - 2, max - 1, max, max + 1, PAGE as usize, 100 * PAGE as usize]
        .iter()
        .enumerate()
    {
        let key = format!("b{:02}", i).into_bytes();
        let value = vec![(i as u8) ^ 0x5A; *value_len];
        tree.put(&mut pager, &key, &value).unwrap();
        assert_eq!(tree.get(&mut pager, &key).unwrap().unwrap(), value);
    }
    tree.validate(&mut pager).unwrap();
    pager.commit().unwrap();
    pager.close().unwrap();
}
