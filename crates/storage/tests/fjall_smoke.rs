#![cfg(feature = "fjall")]

use blkgraph_storage::fjall::{FjallOptions, FjallStore};
use blkgraph_storage::{Column, Durability, KeyValueStore, WriteBatch};

#[test]
fn edges_are_scanned_by_vertex_prefix() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FjallStore::open(dir.path()).expect("open fjall");

    let mut batch = WriteBatch::new();
    for (from, to) in [(1u64, 2u64), (1, 3), (2, 3)] {
        let mut key = from.to_be_bytes().to_vec();
        key.extend_from_slice(&to.to_be_bytes());
        batch.put(Column::EdgeOut, key, b"");
    }
    store.write_batch(&batch).expect("commit");

    let from_one = store
        .scan_prefix(Column::EdgeOut, &1u64.to_be_bytes())
        .expect("scan");
    let targets: Vec<u64> = from_one
        .iter()
        .map(|(key, _)| {
            let mut to = [0u8; 8];
            to.copy_from_slice(&key[8..16]);
            u64::from_be_bytes(to)
        })
        .collect();
    assert_eq!(targets, vec![2, 3]);
    assert!(store
        .scan_prefix(Column::EdgeIn, &1u64.to_be_bytes())
        .expect("scan")
        .is_empty());

    let mut visited = 0;
    let completed = store
        .for_each_prefix(Column::EdgeOut, &[], &mut |_: &[u8], _: &[u8]| {
            visited += 1;
            Ok(visited < 2)
        })
        .expect("visit");
    assert!(!completed);
    assert_eq!(visited, 2);
}

#[test]
fn deletes_in_a_batch_apply_with_puts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FjallStore::open(dir.path()).expect("open fjall");
    store.put(Column::Meta, b"next_id", b"1").expect("put");

    let mut batch = WriteBatch::with_durability(Durability::SyncData);
    batch.put(Column::Meta, b"schema", b"1");
    batch.delete(Column::Meta, b"next_id");
    store.write_batch(&batch).expect("commit");

    assert!(store.get(Column::Meta, b"next_id").expect("get").is_none());
    assert_eq!(store.get(Column::Meta, b"schema").expect("get"), Some(b"1".to_vec()));
}

#[test]
fn reopen_keeps_flushed_writes() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let options = FjallOptions {
            cache_bytes: Some(8 * 1024 * 1024),
            ..FjallOptions::default()
        };
        let store = FjallStore::open_with_options(dir.path(), options).expect("open fjall");
        store.put(Column::BlockHashIndex, &[7u8; 32], &42u64.to_be_bytes()).expect("put");
        store.flush().expect("flush");
    }
    let store = FjallStore::open(dir.path()).expect("reopen fjall");
    assert_eq!(
        store.get(Column::BlockHashIndex, &[7u8; 32]).expect("get"),
        Some(42u64.to_be_bytes().to_vec())
    );
}
