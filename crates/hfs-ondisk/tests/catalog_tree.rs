//! Catalog and extents records driven through the generic B-tree.

use hfs_btree::{BTree, MemNodeStore};
use hfs_error::HfsError;
use hfs_ondisk::{
    CatalogKey, CatalogOrder, CatalogRecord, ExtentsKey, ExtentsOrder, FileFinderInfo,
    FileRecord, ForkData, ThreadRecord, extent_record_bytes, parse_extent_record,
};
use hfs_types::{Cnid, Extent, ForkKind, MacTime};
use proptest::prelude::*;

const PARENT: Cnid = Cnid(16);

fn name_for(n: u32) -> Vec<u8> {
    let stem = ["a", "Zed", "m", "file "][(n % 4) as usize];
    format!("{stem}{n}").into_bytes()
}

fn file_record(id: Cnid) -> FileRecord {
    FileRecord {
        flags: 0,
        version: 0,
        finder: FileFinderInfo {
            file_type: *b"TEXT",
            creator: *b"hfsx",
            ..FileFinderInfo::default()
        },
        id,
        data: ForkData::default(),
        resource: ForkData::default(),
        created: MacTime(100),
        modified: MacTime(100),
        backup: MacTime(0),
        ext_finder: [0; 16],
        clump_size: 0,
    }
}

fn insert_file(
    tree: &mut BTree<CatalogOrder>,
    store: &mut MemNodeStore,
    n: u32,
) -> Result<(), HfsError> {
    let id = Cnid(1000 + n);
    let name = name_for(n);
    let key = CatalogKey::new(PARENT, &name);
    tree.insert(store, &key.to_bytes(), &CatalogRecord::File(file_record(id)).to_bytes())?;
    let thread = CatalogRecord::FileThread(ThreadRecord {
        parent: PARENT,
        name,
    });
    tree.insert(store, &CatalogKey::thread(id).to_bytes(), &thread.to_bytes())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn five_hundred_names_scan_in_order_and_resolve_by_thread(
        order in Just((0..500_u32).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let mut store = MemNodeStore::new(8, 4096);
        let mut tree = BTree::<CatalogOrder>::create(&mut store).expect("create");
        for &n in &order {
            insert_file(&mut tree, &mut store, n).expect("insert");
        }
        tree.check(&mut store).expect("invariants");

        let mut expected: Vec<Vec<u8>> = (0..500).map(name_for).collect();
        expected.sort();

        let mut scanned = Vec::new();
        for entry in tree.entries(&mut store).expect("scan") {
            let key = CatalogKey::parse(&entry.key).expect("key");
            if key.parent != PARENT {
                continue;
            }
            let CatalogRecord::File(file) = CatalogRecord::parse(&entry.data).expect("record") else {
                panic!("non-file record under parent");
            };

            let thread_raw = tree
                .search(&mut store, &CatalogKey::thread(file.id).to_bytes())
                .expect("search")
                .expect("thread present");
            let CatalogRecord::FileThread(thread) = CatalogRecord::parse(&thread_raw).expect("thread") else {
                panic!("expected a file thread");
            };
            prop_assert_eq!(thread.parent, PARENT);
            prop_assert_eq!(&thread.name, &key.name);
            scanned.push(key.name);
        }
        prop_assert_eq!(scanned, expected);
    }
}

#[test]
fn duplicate_name_is_rejected_without_side_effects() {
    let mut store = MemNodeStore::new(8, 256);
    let mut tree = BTree::<CatalogOrder>::create(&mut store).expect("create");
    insert_file(&mut tree, &mut store, 1).expect("insert");
    let before = tree.len();
    let key = CatalogKey::new(PARENT, &name_for(1));
    let err = tree
        .insert(&mut store, &key.to_bytes(), &CatalogRecord::File(file_record(Cnid(77))).to_bytes())
        .expect_err("duplicate");
    assert!(matches!(err, HfsError::Exists(_)));
    assert_eq!(tree.len(), before);
}

#[test]
fn children_of_one_parent_are_contiguous() {
    let mut store = MemNodeStore::new(8, 512);
    let mut tree = BTree::<CatalogOrder>::create(&mut store).expect("create");
    for n in 0..60 {
        insert_file(&mut tree, &mut store, n).expect("insert");
    }
    // seek_ge on (parent, "") lands on the first child; walking stops at
    // the first key with a different parent.
    let mut cursor = tree
        .seek_ge(&mut store, &CatalogKey::new(PARENT, b"").to_bytes())
        .expect("seek");
    let mut count = 0;
    while let Some(entry) = cursor {
        let key = CatalogKey::parse(&entry.key).expect("key");
        if key.parent != PARENT {
            break;
        }
        count += 1;
        cursor = tree.next_after(&mut store, &entry.key).expect("next");
    }
    assert_eq!(count, 60);
}

#[test]
fn overflow_extents_are_found_by_search_le() {
    let mut store = MemNodeStore::new(8, 64);
    let mut tree = BTree::<ExtentsOrder>::create(&mut store).expect("create");
    let file = Cnid(40);
    for (fabn, start) in [(9_u16, 200_u16), (18, 300), (27, 400)] {
        let key = ExtentsKey::new(file, ForkKind::Data, fabn);
        let rec = [Extent::new(start, 3), Extent::new(start + 10, 3), Extent::new(start + 20, 3)];
        tree.insert(&mut store, &key.to_bytes(), &extent_record_bytes(&rec))
            .expect("insert");
    }
    let other = ExtentsKey::new(file, ForkKind::Resource, 0);
    tree.insert(&mut store, &other.to_bytes(), &extent_record_bytes(&[Extent::new(1, 1), Extent::EMPTY, Extent::EMPTY]))
        .expect("insert resource");

    let probe = ExtentsKey::new(file, ForkKind::Data, 20).to_bytes();
    let hit = tree.search_le(&mut store, &probe).expect("le").expect("record");
    let key = ExtentsKey::parse(&hit.key).expect("key");
    assert_eq!(key.start_block, 18);
    assert_eq!(parse_extent_record(&hit.data, 0).expect("rec")[0], Extent::new(300, 3));

    let json = serde_json::to_string(&key).expect("json");
    let back: ExtentsKey = serde_json::from_str(&json).expect("json back");
    assert_eq!(back, key);
}
