//! End-to-end B-tree scenarios driven through the public API.

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use corelite::os::vfs::{MemoryVfs, Vfs};
use corelite::{
    BtCursor, Btree, BtreeOpenFlags, BtreePayload, CursorFlags, CursorState, KeyInfo, RecordField,
    BTREE_BLOBKEY, BTREE_INTKEY,
};

fn memory_btree(page_size: u32) -> Btree {
    let vfs: Arc<dyn Vfs> = Arc::new(MemoryVfs::new());
    Btree::open(vfs, None, page_size, BtreeOpenFlags::MEMORY).unwrap()
}

fn int_record(value: i64) -> Vec<u8> {
    let mut record = vec![2u8];
    match value {
        0 => record.push(8),
        1 => record.push(9),
        -128..=127 => {
            record.push(1);
            record.push(value as u8);
        }
        -32768..=32767 => {
            record.push(2);
            record.extend(&(value as i16).to_be_bytes());
        }
        _ => {
            record.push(6);
            record.extend(&value.to_be_bytes());
        }
    }
    record
}

fn record_int(record: &[u8]) -> i64 {
    match corelite::storage::btree::parse_record_fields(record).first() {
        Some(RecordField::Int(v)) => *v,
        other => panic!("unexpected field {other:?}"),
    }
}

#[test]
fn integer_key_insert_and_lookup() {
    let bt = memory_btree(512);
    bt.begin_trans(true).unwrap();
    let root = bt.create_table(BTREE_INTKEY).unwrap();
    let mut cur = bt.cursor(root, CursorFlags::WRITE, None).unwrap();

    for (key, data) in [(1i64, &b"a"[..]), (2, &b"bb"[..]), (3, &b"ccc"[..])] {
        cur.insert(&BtreePayload::table(key, data.to_vec())).unwrap();
    }

    assert_eq!(cur.table_moveto(2).unwrap(), 0);
    assert_eq!(cur.payload(0, cur.payload_size().unwrap()).unwrap(), b"bb");

    assert!(!cur.next().unwrap());
    assert_eq!(cur.integer_key().unwrap(), 3);
    assert_eq!(cur.payload(0, 3).unwrap(), b"ccc");

    assert!(cur.next().unwrap());
    assert_eq!(cur.state(), CursorState::Invalid);
}

#[test]
fn overflow_payload_roundtrip_and_chain_free() {
    let bt = memory_btree(1024);
    bt.begin_trans(true).unwrap();
    let root = bt.create_table(BTREE_INTKEY).unwrap();
    let mut cur = bt.cursor(root, CursorFlags::WRITE, None).unwrap();

    let payload: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
    cur.insert(&BtreePayload::table(1, payload.clone())).unwrap();

    // At usable size 1024 a 4000-byte payload keeps one local fragment
    // and spills into a 3-page overflow chain.
    assert_eq!(cur.payload_size().unwrap(), 4000);
    assert_eq!(cur.payload(0, 4000).unwrap(), payload);
    let pages_before = bt.page_count();
    assert!(pages_before >= 5, "root + tree root + 3 overflow pages");

    let free_before = bt.free_page_count();
    assert_eq!(cur.table_moveto(1).unwrap(), 0);
    cur.delete().unwrap();
    assert_eq!(bt.free_page_count(), free_before + 3);
    assert_ne!(cur.table_moveto(1).unwrap(), 0);
}

#[test]
fn payload_at_spill_boundary() {
    let bt = memory_btree(1024);
    bt.begin_trans(true).unwrap();
    let root = bt.create_table(BTREE_INTKEY).unwrap();
    let mut cur = bt.cursor(root, CursorFlags::WRITE, None).unwrap();

    // max_leaf for usable 1024 is 1024 - 35.
    let max_local = 1024 - 35;
    cur.insert(&BtreePayload::table(1, vec![b'e'; max_local])).unwrap();
    let exactly_local_pages = bt.page_count();
    cur.insert(&BtreePayload::table(2, vec![b'f'; max_local + 1])).unwrap();
    // The boundary payload spilled nothing; one byte more allocates an
    // overflow page (and the insert may split the leaf).
    assert!(bt.page_count() > exactly_local_pages);
    assert_eq!(cur.table_moveto(1).unwrap(), 0);
    assert_eq!(cur.payload(0, max_local as u32).unwrap(), vec![b'e'; max_local]);
    assert_eq!(cur.table_moveto(2).unwrap(), 0);
    assert_eq!(
        cur.payload(0, max_local as u32 + 1).unwrap(),
        vec![b'f'; max_local + 1]
    );
}

#[test]
fn balance_cascade_monotonic_inserts() {
    let bt = memory_btree(4096);
    bt.begin_trans(true).unwrap();
    let root = bt.create_table(BTREE_INTKEY).unwrap();
    let mut cur = bt.cursor(root, CursorFlags::WRITE, None).unwrap();

    for key in 0..10_000i64 {
        cur.insert(&BtreePayload::table(key, key.to_be_bytes().to_vec()))
            .unwrap();
    }

    // No page may be left overfull once an insert returns; the checker
    // flags staged cells, ordering and depth violations.
    let report = bt.integrity_check(&[root], None);
    assert!(report.is_ok(), "{:?}", report.errors);

    // Fanout with 10-byte cells on 4096-byte pages is in the hundreds;
    // the tree must stay shallow.
    let depth = bt.tree_depth(root).unwrap();
    assert!(depth <= 3, "depth {depth}");

    let count = cur.iter().map(|r| r.unwrap()).count();
    assert_eq!(count, 10_000);
}

#[test]
fn delete_from_internal_node() {
    let bt = memory_btree(512);
    bt.begin_trans(true).unwrap();
    let root = bt.create_table(BTREE_BLOBKEY).unwrap();
    let key_info = Arc::new(KeyInfo::new(1));
    let mut cur: BtCursor = bt
        .cursor(root, CursorFlags::WRITE, Some(Arc::clone(&key_info)))
        .unwrap();

    for value in 1..=200i64 {
        cur.insert(&BtreePayload::index(int_record(value))).unwrap();
    }
    assert!(bt.tree_depth(root).unwrap() >= 2, "need interior entries");

    assert_eq!(cur.index_moveto(&int_record(100)).unwrap(), 0);
    cur.delete().unwrap();

    // 100 is gone; its neighbors meet.
    assert_ne!(cur.index_moveto(&int_record(100)).unwrap(), 0);
    assert_eq!(cur.index_moveto(&int_record(99)).unwrap(), 0);
    assert!(!cur.next().unwrap());
    assert_eq!(record_int(&cur.key().unwrap()), 101);

    let report = bt.integrity_check(&[root], Some(&key_info));
    assert!(report.is_ok(), "{:?}", report.errors);
}

#[test]
fn delete_shrinks_tree_depth() {
    let bt = memory_btree(512);
    bt.begin_trans(true).unwrap();
    let root = bt.create_table(BTREE_INTKEY).unwrap();
    let mut cur = bt.cursor(root, CursorFlags::WRITE, None).unwrap();

    for key in 0..300i64 {
        cur.insert(&BtreePayload::table(key, vec![b's'; 24])).unwrap();
    }
    let deep = bt.tree_depth(root).unwrap();
    assert!(deep >= 2);

    for key in 0..295i64 {
        assert_eq!(cur.table_moveto(key).unwrap(), 0);
        cur.delete().unwrap();
    }
    let shallow = bt.tree_depth(root).unwrap();
    assert!(shallow < deep, "depth {deep} -> {shallow}");
    let keys: Vec<i64> = cur.iter().map(|r| r.unwrap().0).collect();
    assert_eq!(keys, (295..300).collect::<Vec<_>>());
}

#[test]
fn empty_tree_next_and_previous_are_invalid() {
    let bt = memory_btree(512);
    bt.begin_trans(true).unwrap();
    let root = bt.create_table(BTREE_INTKEY).unwrap();
    let mut cur = bt.cursor(root, CursorFlags::WRITE, None).unwrap();
    assert!(cur.first().unwrap());
    assert_eq!(cur.state(), CursorState::Invalid);
    assert!(cur.next().unwrap());
    assert!(cur.previous().unwrap());
    assert!(cur.last().unwrap());
}

#[test]
fn cursor_save_restore_across_insert() {
    let bt = memory_btree(512);
    bt.begin_trans(true).unwrap();
    let root = bt.create_table(BTREE_INTKEY).unwrap();
    let mut writer = bt.cursor(root, CursorFlags::WRITE, None).unwrap();
    for key in (10..100i64).step_by(10) {
        writer
            .insert(&BtreePayload::table(key, key.to_string().into_bytes()))
            .unwrap();
    }

    let mut reader = bt.cursor(root, CursorFlags::empty(), None).unwrap();
    assert_eq!(reader.table_moveto(50).unwrap(), 0);

    writer.insert(&BtreePayload::table(49, b"49".to_vec())).unwrap();
    assert_eq!(reader.state(), CursorState::RequireSeek);

    assert!(reader.restore_position().unwrap());
    assert_eq!(reader.integer_key().unwrap(), 50);
    // Iteration proceeds from the restored position.
    assert!(!reader.next().unwrap());
    assert_eq!(reader.integer_key().unwrap(), 60);
}

#[test]
fn mixed_workload_stays_consistent() {
    let bt = memory_btree(1024);
    bt.begin_trans(true).unwrap();
    let root = bt.create_table(BTREE_INTKEY).unwrap();
    let mut cur = bt.cursor(root, CursorFlags::WRITE, None).unwrap();

    // Interleave inserts of varying payload sizes with deletes.
    for round in 0..5i64 {
        for i in 0..200i64 {
            let key = (i * 61 + round) % 1000;
            let size = ((key as usize) % 300) + 1;
            cur.insert(&BtreePayload::table(key, vec![(key % 251) as u8; size]))
                .unwrap();
        }
        for i in 0..60i64 {
            let key = (i * 17 + round * 3) % 1000;
            if cur.table_moveto(key).unwrap() == 0 {
                cur.delete().unwrap();
            }
        }
        let report = bt.integrity_check(&[root], None);
        assert!(report.is_ok(), "round {round}: {:?}", report.errors);
    }

    // Everything remaining comes back in order with intact payloads.
    let mut prev = i64::MIN;
    for row in cur.iter() {
        let (key, payload) = row.unwrap();
        assert!(key > prev);
        prev = key;
        assert_eq!(payload.len(), ((key as usize) % 300) + 1);
        assert!(payload.iter().all(|&b| b == (key % 251) as u8));
    }
}

#[test]
fn randomized_insert_delete_matches_model() {
    let bt = memory_btree(512);
    bt.begin_trans(true).unwrap();
    let root = bt.create_table(BTREE_INTKEY).unwrap();
    let mut cur = bt.cursor(root, CursorFlags::WRITE, None).unwrap();

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut model: BTreeSet<i64> = BTreeSet::new();
    for _ in 0..2_000 {
        let key = rng.gen_range(0..500i64);
        if rng.gen_bool(0.7) {
            let size = rng.gen_range(1..200usize);
            cur.insert(&BtreePayload::table(key, vec![key as u8; size]))
                .unwrap();
            model.insert(key);
        } else if cur.table_moveto(key).unwrap() == 0 {
            cur.delete().unwrap();
            model.remove(&key);
        }
    }

    let keys: Vec<i64> = cur.iter().map(|r| r.unwrap().0).collect();
    let expect: Vec<i64> = model.iter().copied().collect();
    assert_eq!(keys, expect);
    let report = bt.integrity_check(&[root], None);
    assert!(report.is_ok(), "{:?}", report.errors);
}
