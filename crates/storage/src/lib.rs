//! Column-oriented key/value storage behind a small trait.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

pub mod memory;

#[cfg(feature = "fjall")]
pub mod fjall;

#[derive(Debug)]
pub enum StoreError {
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Logical key spaces. The fjall backend opens one partition per column.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Column {
    Block,
    Transaction,
    InputTx,
    OutputTx,
    Address,
    Import,
    BlockHashIndex,
    TxIdIndex,
    AddressHashIndex,
    EdgeOut,
    EdgeIn,
    EdgeRecord,
    Meta,
}

impl Column {
    pub const ALL: [Column; 13] = [
        Column::Block,
        Column::Transaction,
        Column::InputTx,
        Column::OutputTx,
        Column::Address,
        Column::Import,
        Column::BlockHashIndex,
        Column::TxIdIndex,
        Column::AddressHashIndex,
        Column::EdgeOut,
        Column::EdgeIn,
        Column::EdgeRecord,
        Column::Meta,
    ];

    pub const fn bit(self) -> u32 {
        match self {
            Column::Block => 1 << 0,
            Column::Transaction => 1 << 1,
            Column::InputTx => 1 << 2,
            Column::OutputTx => 1 << 3,
            Column::Address => 1 << 4,
            Column::Import => 1 << 5,
            Column::BlockHashIndex => 1 << 6,
            Column::TxIdIndex => 1 << 7,
            Column::AddressHashIndex => 1 << 8,
            Column::EdgeOut => 1 << 9,
            Column::EdgeIn => 1 << 10,
            Column::EdgeRecord => 1 << 11,
            Column::Meta => 1 << 12,
        }
    }

    pub const fn index(self) -> usize {
        self.bit().trailing_zeros() as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Column::Block => "block",
            Column::Transaction => "transaction",
            Column::InputTx => "input_tx",
            Column::OutputTx => "output_tx",
            Column::Address => "address",
            Column::Import => "import",
            Column::BlockHashIndex => "block_hash_index",
            Column::TxIdIndex => "txid_index",
            Column::AddressHashIndex => "address_hash_index",
            Column::EdgeOut => "edge_out",
            Column::EdgeIn => "edge_in",
            Column::EdgeRecord => "edge_record",
            Column::Meta => "meta",
        }
    }
}

/// How far a committed batch must reach before `write_batch` returns.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Durability {
    /// Leave persistence to the backend's background journal flushing.
    #[default]
    None,
    Buffer,
    SyncData,
    SyncAll,
}

macro_rules! inline_bytes {
    ($(#[$meta:meta])* $name:ident, $inline:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Eq, PartialEq)]
        pub struct $name(SmallVec<[u8; $inline]>);

        impl $name {
            pub fn as_slice(&self) -> &[u8] {
                &self.0
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl From<Vec<u8>> for $name {
            fn from(bytes: Vec<u8>) -> Self {
                Self(SmallVec::from_vec(bytes))
            }
        }

        impl From<&[u8]> for $name {
            fn from(bytes: &[u8]) -> Self {
                Self(SmallVec::from_slice(bytes))
            }
        }

        impl<const N: usize> From<[u8; N]> for $name {
            fn from(bytes: [u8; N]) -> Self {
                Self(SmallVec::from_slice(&bytes))
            }
        }

        impl<const N: usize> From<&[u8; N]> for $name {
            fn from(bytes: &[u8; N]) -> Self {
                Self(SmallVec::from_slice(bytes))
            }
        }
    };
}

inline_bytes!(
    /// Edge and hash index keys fit inline.
    WriteKey,
    48
);
inline_bytes!(WriteValue, 32);

#[derive(Clone, Debug)]
pub enum WriteOp {
    Put {
        column: Column,
        key: WriteKey,
        value: WriteValue,
    },
    Delete {
        column: Column,
        key: WriteKey,
    },
}

/// Ordered ops applied atomically by [`KeyValueStore::write_batch`].
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
    durability: Durability,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_durability(durability: Durability) -> Self {
        Self {
            ops: Vec::new(),
            durability,
        }
    }

    pub fn durability(&self) -> Durability {
        self.durability
    }

    pub fn set_durability(&mut self, durability: Durability) {
        self.durability = durability;
    }

    pub fn put(&mut self, column: Column, key: impl Into<WriteKey>, value: impl Into<WriteValue>) {
        self.ops.push(WriteOp::Put {
            column,
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, column: Column, key: impl Into<WriteKey>) {
        self.ops.push(WriteOp::Delete {
            column,
            key: key.into(),
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Drops every op queued after the first `len`. Used to roll back to a savepoint.
    pub fn truncate(&mut self, len: usize) {
        self.ops.truncate(len);
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }
}

pub type ScanResult = Vec<(Vec<u8>, Vec<u8>)>;
/// Returns `Ok(false)` to stop the scan early.
pub type PrefixVisitor<'a> = dyn FnMut(&[u8], &[u8]) -> Result<bool, StoreError> + 'a;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError>;
    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError>;
    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<bool, StoreError>;
    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError>;

    /// Forces everything committed so far to stable storage.
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.as_ref().get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.as_ref().put(column, key, value)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.as_ref().delete(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.as_ref().scan_prefix(column, prefix)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<bool, StoreError> {
        self.as_ref().for_each_prefix(column, prefix, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.as_ref().write_batch(batch)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.as_ref().flush()
    }
}
