use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use blkgraph_storage::fjall::{FjallOptions, FjallStore, FjallTelemetrySnapshot};
use blkgraph_storage::memory::MemoryStore;
use blkgraph_storage::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch};
use fs2::FileExt;

const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }
}

pub enum Store {
    Memory(MemoryStore),
    Fjall(FjallStore),
}

impl Store {
    pub fn fjall_telemetry_snapshot(&self) -> Option<FjallTelemetrySnapshot> {
        match self {
            Store::Fjall(store) => Some(store.telemetry_snapshot()),
            Store::Memory(_) => None,
        }
    }

    fn backend(&self) -> &dyn KeyValueStore {
        match self {
            Store::Memory(store) => store,
            Store::Fjall(store) => store,
        }
    }
}

impl KeyValueStore for Store {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.backend().get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.backend().put(column, key, value)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.backend().delete(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.backend().scan_prefix(column, prefix)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<bool, StoreError> {
        self.backend().for_each_prefix(column, prefix, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.backend().write_batch(batch)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.backend().flush()
    }
}

pub fn open_store(backend: Backend, db_path: &Path, cache_mb: Option<u64>) -> Result<Store, String> {
    match backend {
        Backend::Memory => Ok(Store::Memory(MemoryStore::new())),
        Backend::Fjall => {
            fs::create_dir_all(db_path)
                .map_err(|err| format!("failed to create {}: {err}", db_path.display()))?;
            let options = FjallOptions {
                cache_bytes: cache_mb.map(|mb| mb.saturating_mul(1024 * 1024)),
                ..FjallOptions::default()
            };
            FjallStore::open_with_options(db_path, options)
                .map(Store::Fjall)
                .map_err(|err| format!("failed to open graph store {}: {err}", db_path.display()))
        }
    }
}

/// Held for as long as a command uses the data dir.
pub struct DataDirLock {
    _file: File,
}

/// Takes the exclusive `.lock` file in `data_dir`, recording our pid in it so
/// a refused second importer can say who holds the lock.
pub fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    if let Err(err) = file.try_lock_exclusive() {
        if err.kind() != std::io::ErrorKind::WouldBlock {
            return Err(format!("failed to lock {}: {err}", lock_path.display()));
        }
        let holder = fs::read_to_string(&lock_path).unwrap_or_default();
        let holder = holder.trim();
        return Err(if holder.is_empty() {
            format!("data dir {} is already locked by another process", data_dir.display())
        } else {
            format!(
                "data dir {} is already locked by another process ({holder})",
                data_dir.display()
            )
        });
    }

    let _ = file
        .set_len(0)
        .and_then(|()| file.seek(SeekFrom::Start(0)))
        .and_then(|_| writeln!(file, "pid={}", std::process::id()))
        .and_then(|()| file.flush());
    Ok(DataDirLock { _file: file })
}
