use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

type ColumnMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// Ordered in-memory store used by tests and `--backend memory` runs.
pub struct MemoryStore {
    columns: RwLock<Vec<ColumnMap>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            columns: RwLock::new(vec![ColumnMap::new(); Column::ALL.len()]),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, column: Column) -> usize {
        self.columns.read().expect("memory store lock")[column.index()].len()
    }

    pub fn is_empty(&self, column: Column) -> bool {
        self.len(column) == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let columns = self.columns.read().expect("memory store lock");
        Ok(columns[column.index()].get(key).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut columns = self.columns.write().expect("memory store lock");
        columns[column.index()].insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut columns = self.columns.write().expect("memory store lock");
        columns[column.index()].remove(key);
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let columns = self.columns.read().expect("memory store lock");
        Ok(columns[column.index()]
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<bool, StoreError> {
        // Snapshot first so the visitor may write back into the store.
        for (key, value) in self.scan_prefix(column, prefix)? {
            if !visitor(&key, &value)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut columns = self.columns.write().expect("memory store lock");
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    columns[column.index()].insert(key.as_slice().to_vec(), value.as_slice().to_vec());
                }
                WriteOp::Delete { column, key } => {
                    columns[column.index()].remove(key.as_slice());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_scan_stays_within_column() {
        let store = MemoryStore::new();
        store.put(Column::Block, b"a1", b"x").expect("put");
        store.put(Column::Block, b"a2", b"y").expect("put");
        store.put(Column::Block, b"b1", b"z").expect("put");
        store.put(Column::Transaction, b"a3", b"w").expect("put");

        let keys: Vec<Vec<u8>> = store
            .scan_prefix(Column::Block, b"a")
            .expect("scan")
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec![b"a1".to_vec(), b"a2".to_vec()]);
        assert_eq!(store.len(Column::Block), 3);
        assert!(store.is_empty(Column::Meta));
    }

    #[test]
    fn visitor_may_write_while_scanning() {
        let store = MemoryStore::new();
        for i in 0u8..10 {
            store.put(Column::Block, &[i], &[i]).expect("put");
        }
        let mut seen = 0;
        let completed = store
            .for_each_prefix(Column::Block, &[], &mut |key: &[u8], _: &[u8]| {
                seen += 1;
                store.put(Column::EdgeOut, key, b"")?;
                Ok(seen < 3)
            })
            .expect("visit");
        assert!(!completed);
        assert_eq!(seen, 3);
        assert_eq!(store.len(Column::EdgeOut), 3);
    }

    #[test]
    fn truncated_batch_drops_tail_ops() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"keep", b"1");
        let mark = batch.len();
        batch.put(Column::Meta, b"drop", b"2");
        batch.truncate(mark);
        store.write_batch(&batch).expect("commit");
        assert!(store.get(Column::Meta, b"keep").expect("get").is_some());
        assert!(store.get(Column::Meta, b"drop").expect("get").is_none());
    }
}
