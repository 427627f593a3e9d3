use std::fmt;

use blkgraph_primitives::encoding::DecodeError;
use blkgraph_storage::StoreError;

use crate::schema::{UniqueIndex, VertexId, VertexType};

#[derive(Debug)]
pub enum GraphError {
    Store(StoreError),
    Decode(DecodeError),
    Corrupt(&'static str),
    UniqueViolation {
        index: UniqueIndex,
        key: String,
        existing: VertexId,
    },
    WrongKind {
        expected: VertexType,
        found: VertexType,
    },
    MissingVertex(VertexId),
    SchemaVersion(u8),
    WriterClosed,
    Job(String),
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::Store(err) => write!(f, "{err}"),
            GraphError::Decode(err) => write!(f, "record decode failed: {err}"),
            GraphError::Corrupt(message) => write!(f, "corrupt graph data: {message}"),
            GraphError::UniqueViolation {
                index,
                key,
                existing,
            } => write!(
                f,
                "duplicate key '{key}' on index {} (already owned by {existing})",
                index.as_str()
            ),
            GraphError::WrongKind { expected, found } => write!(
                f,
                "expected {} vertex, got {}",
                expected.as_str(),
                found.as_str()
            ),
            GraphError::MissingVertex(id) => write!(f, "vertex {id} not found"),
            GraphError::SchemaVersion(version) => {
                write!(f, "unsupported graph schema version {version}")
            }
            GraphError::WriterClosed => write!(f, "async writer is closed"),
            GraphError::Job(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for GraphError {}

impl From<StoreError> for GraphError {
    fn from(err: StoreError) -> Self {
        GraphError::Store(err)
    }
}

impl From<DecodeError> for GraphError {
    fn from(err: DecodeError) -> Self {
        GraphError::Decode(err)
    }
}
