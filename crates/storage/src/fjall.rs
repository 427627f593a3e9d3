use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fjall::{AbstractTree, Batch, Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::{Column, Durability, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

const SLOW_BATCH: Duration = Duration::from_millis(500);
const WARN_EVERY_SECS: u64 = 30;
/// Memtables are rotated once the write buffer reaches this share of its limit.
const ROTATE_AT_PCT: u64 = 90;
const ROTATE_CANDIDATES: usize = 3;

/// Graph columns kept in one fjall keyspace, one partition per [`Column`].
pub struct FjallStore {
    keyspace: Keyspace,
    partitions: Vec<PartitionHandle>,
    write_buffer_limit: Option<u64>,
    last_slow_warn: AtomicU64,
    last_rotate_warn: AtomicU64,
}

#[derive(Clone, Debug, Default)]
pub struct FjallTelemetrySnapshot {
    pub write_buffer_bytes: u64,
    pub journal_count: u64,
    pub flushes_completed: u64,
    pub active_compactions: u64,
    pub vertex_segments: u64,
    pub edge_segments: u64,
    pub index_segments: u64,
}

#[derive(Clone, Debug, Default)]
pub struct FjallOptions {
    /// Block cache shared by every partition.
    pub cache_bytes: Option<u64>,
    pub write_buffer_bytes: Option<u64>,
    pub journal_bytes: Option<u64>,
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_options(path, FjallOptions::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: FjallOptions) -> Result<Self, StoreError> {
        let mut config = Config::new(path);
        if let Some(bytes) = options.cache_bytes {
            config = config.cache_size(bytes);
        }
        if let Some(bytes) = options.write_buffer_bytes {
            config = config.max_write_buffer_size(bytes);
        }
        if let Some(bytes) = options.journal_bytes {
            config = config.max_journaling_size(bytes);
        }
        let keyspace = config.open().map_err(map_err)?;
        let partitions = Column::ALL
            .iter()
            .map(|column| {
                keyspace
                    .open_partition(column.as_str(), PartitionCreateOptions::default())
                    .map_err(map_err)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            keyspace,
            partitions,
            write_buffer_limit: options.write_buffer_bytes.filter(|limit| *limit > 0),
            last_slow_warn: AtomicU64::new(0),
            last_rotate_warn: AtomicU64::new(0),
        })
    }

    fn partition(&self, column: Column) -> Result<&PartitionHandle, StoreError> {
        self.partitions
            .get(column.index())
            .ok_or_else(|| StoreError::Backend(format!("missing partition {}", column.as_str())))
    }

    pub fn telemetry_snapshot(&self) -> FjallTelemetrySnapshot {
        let segments = |columns: &[Column]| -> u64 {
            columns
                .iter()
                .filter_map(|column| self.partition(*column).ok())
                .map(|partition| partition.segment_count() as u64)
                .sum()
        };
        FjallTelemetrySnapshot {
            write_buffer_bytes: self.keyspace.write_buffer_size(),
            journal_count: self.keyspace.journal_count() as u64,
            flushes_completed: self.keyspace.flushes_completed() as u64,
            active_compactions: self.keyspace.active_compactions() as u64,
            vertex_segments: segments(&[
                Column::Block,
                Column::Transaction,
                Column::InputTx,
                Column::OutputTx,
                Column::Address,
            ]),
            edge_segments: segments(&[Column::EdgeOut, Column::EdgeIn, Column::EdgeRecord]),
            index_segments: segments(&[
                Column::BlockHashIndex,
                Column::TxIdIndex,
                Column::AddressHashIndex,
            ]),
        }
    }

    /// Rotates the largest memtables so fjall starts flushing before writers stall.
    fn relieve_write_buffer(&self) {
        let Some(limit) = self.write_buffer_limit else {
            return;
        };
        let current = self.keyspace.write_buffer_size();
        if current < limit.saturating_mul(ROTATE_AT_PCT) / 100 {
            return;
        }
        let mut by_size: Vec<&PartitionHandle> = self.partitions.iter().collect();
        by_size.sort_by_key(|partition| std::cmp::Reverse(partition.tree.active_memtable_size()));
        let rotated = by_size
            .into_iter()
            .take(ROTATE_CANDIDATES)
            .filter(|partition| matches!(partition.rotate_memtable(), Ok(true)))
            .count();
        if rotated > 0 && should_warn(&self.last_rotate_warn) {
            blkgraph_log::log_warn!(
                "fjall write buffer at {current}B of {limit}B; rotated {rotated} memtable(s)"
            );
        }
    }
}

fn should_warn(last: &AtomicU64) -> bool {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let previous = last.load(Ordering::Relaxed);
    now.saturating_sub(previous) >= WARN_EVERY_SECS
        && last
            .compare_exchange(previous, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
}

impl KeyValueStore for FjallStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self.partition(column)?.get(key).map_err(map_err)?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.partition(column)?.insert(key, value).map_err(map_err)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.partition(column)?.remove(key).map_err(map_err)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.partition(column)?
            .prefix(prefix)
            .map(|entry| {
                entry
                    .map(|(key, value)| (key.to_vec(), value.to_vec()))
                    .map_err(map_err)
            })
            .collect()
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<bool, StoreError> {
        for entry in self.partition(column)?.prefix(prefix) {
            let (key, value) = entry.map_err(map_err)?;
            if !visitor(key.as_ref(), value.as_ref())? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut pending = Batch::with_capacity(self.keyspace.clone(), batch.len())
            .durability(persist_mode(batch.durability()));
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    pending.insert(self.partition(*column)?, key.as_slice(), value.as_slice());
                }
                WriteOp::Delete { column, key } => {
                    pending.remove(self.partition(*column)?, key.as_slice());
                }
            }
        }
        self.relieve_write_buffer();

        let started = Instant::now();
        pending.commit().map_err(map_err)?;
        let elapsed = started.elapsed();
        if elapsed >= SLOW_BATCH && should_warn(&self.last_slow_warn) {
            blkgraph_log::log_warn!(
                "fjall commit of {} ops took {}ms (write buffer {}B, {} journals)",
                batch.len(),
                elapsed.as_millis(),
                self.keyspace.write_buffer_size(),
                self.keyspace.journal_count()
            );
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.keyspace.persist(PersistMode::SyncAll).map_err(map_err)
    }
}

fn persist_mode(durability: Durability) -> Option<PersistMode> {
    match durability {
        Durability::None => None,
        Durability::Buffer => Some(PersistMode::Buffer),
        Durability::SyncData => Some(PersistMode::SyncData),
        Durability::SyncAll => Some(PersistMode::SyncAll),
    }
}

fn map_err(err: fjall::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}
