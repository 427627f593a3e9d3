//! Property graph layered over a column key/value store.
//!
//! Vertices live in one column per vertex type keyed by a big-endian id,
//! unique indexes map an attribute value to the owning vertex id, and every
//! edge is written twice (outgoing and incoming adjacency) so both directions
//! are a prefix scan away.

pub mod error;
pub mod records;
pub mod schema;
pub mod store;
pub mod writer;

pub use error::GraphError;
pub use records::{
    AddressRecord, BlockRecord, ImportRecord, InputRecord, OutputRecord, TransactionRecord,
    VertexRecord,
};
pub use schema::{EdgeType, UniqueIndex, VertexId, VertexType};
pub use store::{FlushMode, GraphOptions, GraphStore, GraphTx, Savepoint};
pub use writer::{job_fn, AsyncWriter, ErrorCallback, WriteJob, WriterOptions};
