//! Vertex, edge and index names. These names are the on-disk contract.

use std::fmt;

use blkgraph_storage::Column;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum VertexType {
    Block,
    Transaction,
    InputTx,
    OutputTx,
    Address,
    Import,
}

impl VertexType {
    pub const ALL: [VertexType; 6] = [
        VertexType::Block,
        VertexType::Transaction,
        VertexType::InputTx,
        VertexType::OutputTx,
        VertexType::Address,
        VertexType::Import,
    ];

    pub const fn code(self) -> u8 {
        match self {
            VertexType::Block => 1,
            VertexType::Transaction => 2,
            VertexType::InputTx => 3,
            VertexType::OutputTx => 4,
            VertexType::Address => 5,
            VertexType::Import => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VertexType::Block => "Block",
            VertexType::Transaction => "Transaction",
            VertexType::InputTx => "InputTx",
            VertexType::OutputTx => "OutputTx",
            VertexType::Address => "Address",
            VertexType::Import => "Import",
        }
    }

    pub fn column(self) -> Column {
        match self {
            VertexType::Block => Column::Block,
            VertexType::Transaction => Column::Transaction,
            VertexType::InputTx => Column::InputTx,
            VertexType::OutputTx => Column::OutputTx,
            VertexType::Address => Column::Address,
            VertexType::Import => Column::Import,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum EdgeType {
    PreviousBlock,
    HasAddress,
    BlockTx,
    Input,
    Output,
    HeadBlock,
    TailBlock,
    SafeTailBlock,
}

impl EdgeType {
    pub const ALL: [EdgeType; 8] = [
        EdgeType::PreviousBlock,
        EdgeType::HasAddress,
        EdgeType::BlockTx,
        EdgeType::Input,
        EdgeType::Output,
        EdgeType::HeadBlock,
        EdgeType::TailBlock,
        EdgeType::SafeTailBlock,
    ];

    pub const fn code(self) -> u8 {
        match self {
            EdgeType::PreviousBlock => 1,
            EdgeType::HasAddress => 2,
            EdgeType::BlockTx => 3,
            EdgeType::Input => 4,
            EdgeType::Output => 5,
            EdgeType::HeadBlock => 6,
            EdgeType::TailBlock => 7,
            EdgeType::SafeTailBlock => 8,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|edge| edge.code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EdgeType::PreviousBlock => "PreviousBlock",
            EdgeType::HasAddress => "HasAddress",
            EdgeType::BlockTx => "BlockTx",
            EdgeType::Input => "Input",
            EdgeType::Output => "Output",
            EdgeType::HeadBlock => "HeadBlock",
            EdgeType::TailBlock => "TailBlock",
            EdgeType::SafeTailBlock => "SafeTailBlock",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum UniqueIndex {
    BlockHash,
    TransactionId,
    AddressHash,
}

impl UniqueIndex {
    pub fn vertex_type(self) -> VertexType {
        match self {
            UniqueIndex::BlockHash => VertexType::Block,
            UniqueIndex::TransactionId => VertexType::Transaction,
            UniqueIndex::AddressHash => VertexType::Address,
        }
    }

    pub fn column(self) -> Column {
        match self {
            UniqueIndex::BlockHash => Column::BlockHashIndex,
            UniqueIndex::TransactionId => Column::TxIdIndex,
            UniqueIndex::AddressHash => Column::AddressHashIndex,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UniqueIndex::BlockHash => "Block.hash",
            UniqueIndex::TransactionId => "Transaction.id",
            UniqueIndex::AddressHash => "Address.hash",
        }
    }

    /// Human-readable rendering of an index key, for errors and logs.
    pub fn display_key(self, key: &[u8]) -> String {
        match self {
            UniqueIndex::AddressHash => String::from_utf8_lossy(key).into_owned(),
            UniqueIndex::BlockHash | UniqueIndex::TransactionId => {
                match <[u8; 32]>::try_from(key) {
                    Ok(hash) => blkgraph_consensus::hash256_to_hex(&hash),
                    Err(_) => key.iter().map(|byte| format!("{byte:02x}")).collect(),
                }
            }
        }
    }
}

pub const VERTEX_ID_LEN: usize = 9;

/// Identity of a stored vertex: its type plus a store-wide sequence number.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct VertexId {
    pub kind: VertexType,
    pub id: u64,
}

impl VertexId {
    pub fn new(kind: VertexType, id: u64) -> Self {
        Self { kind, id }
    }

    pub fn encode(&self) -> [u8; VERTEX_ID_LEN] {
        let mut out = [0u8; VERTEX_ID_LEN];
        out[0] = self.kind.code();
        out[1..].copy_from_slice(&self.id.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != VERTEX_ID_LEN {
            return None;
        }
        let kind = VertexType::from_code(bytes[0])?;
        let id = u64::from_be_bytes(bytes[1..].try_into().ok()?);
        Some(Self { kind, id })
    }

    pub(crate) fn row_key(&self) -> [u8; 8] {
        self.id.to_be_bytes()
    }
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.kind.as_str(), self.id)
    }
}

pub(crate) const EDGE_KEY_LEN: usize = VERTEX_ID_LEN * 2 + 1;

pub(crate) fn edge_key(
    near: VertexId,
    edge_type: EdgeType,
    far: VertexId,
) -> [u8; EDGE_KEY_LEN] {
    let mut out = [0u8; EDGE_KEY_LEN];
    out[..VERTEX_ID_LEN].copy_from_slice(&near.encode());
    out[VERTEX_ID_LEN] = edge_type.code();
    out[VERTEX_ID_LEN + 1..].copy_from_slice(&far.encode());
    out
}

pub(crate) fn edge_prefix(near: VertexId, edge_type: EdgeType) -> [u8; VERTEX_ID_LEN + 1] {
    let mut out = [0u8; VERTEX_ID_LEN + 1];
    out[..VERTEX_ID_LEN].copy_from_slice(&near.encode());
    out[VERTEX_ID_LEN] = edge_type.code();
    out
}
