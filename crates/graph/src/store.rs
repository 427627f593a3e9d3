use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use blkgraph_storage::{Column, Durability, KeyValueStore, WriteBatch};

use crate::error::GraphError;
use crate::records::VertexRecord;
use crate::schema::{edge_key, edge_prefix, EdgeType, UniqueIndex, VertexId, VertexType, VERTEX_ID_LEN};

const META_NEXT_ID: &[u8] = b"next_vertex_id";
const META_SCHEMA_VERSION: &[u8] = b"schema_version";
const SCHEMA_VERSION: u8 = 1;

/// How hard a commit pushes its batch towards disk when the WAL is on.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FlushMode {
    #[default]
    None,
    Data,
    Full,
}

impl FlushMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" | "no" => Some(Self::None),
            "data" | "yes" => Some(Self::Data),
            "full" => Some(Self::Full),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Data => "data",
            Self::Full => "full",
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct GraphOptions {
    pub use_wal: bool,
    pub flush: FlushMode,
}

impl GraphOptions {
    pub fn durability(&self) -> Durability {
        if !self.use_wal {
            return Durability::None;
        }
        match self.flush {
            FlushMode::None => Durability::Buffer,
            FlushMode::Data => Durability::SyncData,
            FlushMode::Full => Durability::SyncAll,
        }
    }
}

struct GraphInner<S> {
    store: S,
    next_id: AtomicU64,
    commit_lock: Mutex<()>,
    options: GraphOptions,
}

/// Shared handle to a graph. Cloning is cheap; all clones see the same
/// id sequence and serialize their commits.
pub struct GraphStore<S> {
    inner: Arc<GraphInner<S>>,
}

impl<S> Clone for GraphStore<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: KeyValueStore> GraphStore<S> {
    pub fn open(store: S, options: GraphOptions) -> Result<Self, GraphError> {
        match store.get(Column::Meta, META_SCHEMA_VERSION)? {
            Some(bytes) if bytes.as_slice() != [SCHEMA_VERSION] => {
                return Err(GraphError::SchemaVersion(
                    bytes.first().copied().unwrap_or_default(),
                ));
            }
            Some(_) => {}
            None => store.put(Column::Meta, META_SCHEMA_VERSION, &[SCHEMA_VERSION])?,
        }
        let next_id = match store.get(Column::Meta, META_NEXT_ID)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| GraphError::Corrupt("next vertex id"))?;
                u64::from_be_bytes(raw)
            }
            None => 1,
        };
        Ok(Self {
            inner: Arc::new(GraphInner {
                store,
                next_id: AtomicU64::new(next_id),
                commit_lock: Mutex::new(()),
                options,
            }),
        })
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn options(&self) -> GraphOptions {
        self.inner.options
    }

    /// Reserves a fresh identity. Ids are never reused, even across runs.
    pub fn allocate_id(&self, kind: VertexType) -> VertexId {
        VertexId::new(kind, self.inner.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn begin(&self) -> GraphTx<S> {
        GraphTx {
            graph: self.clone(),
            batch: WriteBatch::new(),
            vertices: HashMap::new(),
            unique: HashMap::new(),
            undo: Vec::new(),
        }
    }

    pub fn get_vertex<R: VertexRecord>(&self, id: VertexId) -> Result<Option<R>, GraphError> {
        check_kind::<R>(id)?;
        match self.inner.store.get(R::KIND.column(), &id.row_key())? {
            Some(bytes) => Ok(Some(R::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn lookup_unique(
        &self,
        index: UniqueIndex,
        key: &[u8],
    ) -> Result<Option<VertexId>, GraphError> {
        match self.inner.store.get(index.column(), key)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| GraphError::Corrupt("unique index entry"))?;
                Ok(Some(VertexId::new(index.vertex_type(), u64::from_be_bytes(raw))))
            }
            None => Ok(None),
        }
    }

    pub fn out_edges(&self, from: VertexId, edge_type: EdgeType) -> Result<Vec<VertexId>, GraphError> {
        self.adjacent(Column::EdgeOut, from, edge_type)
    }

    pub fn in_edges(&self, to: VertexId, edge_type: EdgeType) -> Result<Vec<VertexId>, GraphError> {
        self.adjacent(Column::EdgeIn, to, edge_type)
    }

    pub fn has_out_edge(&self, from: VertexId, edge_type: EdgeType) -> Result<bool, GraphError> {
        let prefix = edge_prefix(from, edge_type);
        let completed = self.inner.store.for_each_prefix(
            Column::EdgeOut,
            &prefix,
            &mut |_: &[u8], _: &[u8]| Ok(false),
        )?;
        Ok(!completed)
    }

    fn adjacent(
        &self,
        column: Column,
        near: VertexId,
        edge_type: EdgeType,
    ) -> Result<Vec<VertexId>, GraphError> {
        let prefix = edge_prefix(near, edge_type);
        let mut out = Vec::new();
        for (key, _) in self.inner.store.scan_prefix(column, &prefix)? {
            let far = key
                .get(VERTEX_ID_LEN + 1..)
                .and_then(VertexId::decode)
                .ok_or(GraphError::Corrupt("edge key"))?;
            out.push(far);
        }
        Ok(out)
    }

    /// Visits every vertex of type `R` in storage order. The visitor returns
    /// `Ok(false)` to stop; the result is `true` when the scan ran to the end.
    pub fn for_each_of_type<R, F>(&self, mut visitor: F) -> Result<bool, GraphError>
    where
        R: VertexRecord,
        F: FnMut(VertexId, R) -> Result<bool, GraphError>,
    {
        let mut failure = None;
        let completed = self.inner.store.for_each_prefix(
            R::KIND.column(),
            &[],
            &mut |key: &[u8], value: &[u8]| {
                let Ok(raw) = <[u8; 8]>::try_from(key) else {
                    failure = Some(GraphError::Corrupt("vertex key"));
                    return Ok(false);
                };
                let id = VertexId::new(R::KIND, u64::from_be_bytes(raw));
                let step = R::decode(value).and_then(|record| visitor(id, record));
                match step {
                    Ok(keep_going) => Ok(keep_going),
                    Err(err) => {
                        failure = Some(err);
                        Ok(false)
                    }
                }
            },
        )?;
        match failure {
            Some(err) => Err(err),
            None => Ok(completed),
        }
    }

    pub fn count_of_type(&self, kind: VertexType) -> Result<u64, GraphError> {
        let mut count = 0u64;
        self.inner.store.for_each_prefix(
            kind.column(),
            &[],
            &mut |_: &[u8], _: &[u8]| {
                count += 1;
                Ok(true)
            },
        )?;
        Ok(count)
    }

    /// Forces committed batches to stable storage.
    pub fn flush(&self) -> Result<(), GraphError> {
        self.inner.store.flush()?;
        Ok(())
    }
}

fn check_kind<R: VertexRecord>(id: VertexId) -> Result<(), GraphError> {
    if id.kind != R::KIND {
        return Err(GraphError::WrongKind {
            expected: R::KIND,
            found: id.kind,
        });
    }
    Ok(())
}

enum Undo {
    Vertex {
        id: VertexId,
        previous: Option<Vec<u8>>,
    },
    Unique {
        index: UniqueIndex,
        key: Vec<u8>,
    },
}

/// Position inside a transaction that later writes can be rolled back to.
#[derive(Clone, Copy, Debug)]
pub struct Savepoint {
    ops: usize,
    undo: usize,
}

/// Buffered unit of work. Nothing reaches the store until `commit`; reads
/// through the transaction see its own pending vertices and index entries.
pub struct GraphTx<S> {
    graph: GraphStore<S>,
    batch: WriteBatch,
    vertices: HashMap<VertexId, Vec<u8>>,
    unique: HashMap<(UniqueIndex, Vec<u8>), VertexId>,
    undo: Vec<Undo>,
}

impl<S: KeyValueStore> GraphTx<S> {
    pub fn graph(&self) -> &GraphStore<S> {
        &self.graph
    }

    pub fn pending_ops(&self) -> usize {
        self.batch.len()
    }

    pub fn create_vertex<R: VertexRecord>(&mut self, record: &R) -> Result<VertexId, GraphError> {
        let id = self.graph.allocate_id(R::KIND);
        self.save_vertex(id, record)?;
        Ok(id)
    }

    /// Writes `record` under `id`, replacing any earlier version. Fails with
    /// `UniqueViolation` when the record's unique key already belongs to
    /// another vertex, either in this transaction or in the store.
    pub fn save_vertex<R: VertexRecord>(&mut self, id: VertexId, record: &R) -> Result<(), GraphError> {
        check_kind::<R>(id)?;
        if let Some((index, key)) = record.unique_key() {
            self.claim_unique(index, key, id)?;
        }
        let bytes = record.encode();
        self.batch.put(R::KIND.column(), id.row_key(), bytes.clone());
        let previous = self.vertices.insert(id, bytes);
        self.undo.push(Undo::Vertex { id, previous });
        Ok(())
    }

    fn claim_unique(&mut self, index: UniqueIndex, key: Vec<u8>, id: VertexId) -> Result<(), GraphError> {
        if let Some(existing) = self.unique.get(&(index, key.clone())).copied() {
            if existing == id {
                return Ok(());
            }
            return Err(violation(index, &key, existing));
        }
        if let Some(existing) = self.graph.lookup_unique(index, &key)? {
            if existing == id {
                return Ok(());
            }
            return Err(violation(index, &key, existing));
        }
        self.batch.put(index.column(), key.as_slice(), id.id.to_be_bytes());
        self.unique.insert((index, key.clone()), id);
        self.undo.push(Undo::Unique { index, key });
        Ok(())
    }

    pub fn get_vertex<R: VertexRecord>(&self, id: VertexId) -> Result<Option<R>, GraphError> {
        check_kind::<R>(id)?;
        match self.vertices.get(&id) {
            Some(bytes) => Ok(Some(R::decode(bytes)?)),
            None => self.graph.get_vertex(id),
        }
    }

    pub fn lookup_unique(&self, index: UniqueIndex, key: &[u8]) -> Result<Option<VertexId>, GraphError> {
        if let Some(id) = self.unique.get(&(index, key.to_vec())) {
            return Ok(Some(*id));
        }
        self.graph.lookup_unique(index, key)
    }

    /// Adds a directed edge. Lightweight edges exist only as adjacency
    /// entries; regular edges also get an identity and an edge record.
    pub fn create_edge(
        &mut self,
        from: VertexId,
        to: VertexId,
        edge_type: EdgeType,
        lightweight: bool,
    ) -> Result<(), GraphError> {
        let out_key = edge_key(from, edge_type, to);
        let in_key = edge_key(to, edge_type, from);
        if lightweight {
            self.batch.put(Column::EdgeOut, out_key, Vec::new());
            self.batch.put(Column::EdgeIn, in_key, Vec::new());
            return Ok(());
        }
        let edge_id = self.graph.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let edge_id = edge_id.to_be_bytes();
        self.batch.put(Column::EdgeOut, out_key, edge_id);
        self.batch.put(Column::EdgeIn, in_key, edge_id);
        self.batch.put(Column::EdgeRecord, edge_id, out_key);
        Ok(())
    }

    pub fn savepoint(&self) -> Savepoint {
        Savepoint {
            ops: self.batch.len(),
            undo: self.undo.len(),
        }
    }

    pub fn rollback_to(&mut self, savepoint: Savepoint) {
        self.batch.truncate(savepoint.ops);
        while self.undo.len() > savepoint.undo {
            match self.undo.pop() {
                Some(Undo::Vertex { id, previous }) => match previous {
                    Some(bytes) => {
                        self.vertices.insert(id, bytes);
                    }
                    None => {
                        self.vertices.remove(&id);
                    }
                },
                Some(Undo::Unique { index, key }) => {
                    self.unique.remove(&(index, key));
                }
                None => break,
            }
        }
    }

    pub fn commit(mut self) -> Result<(), GraphError> {
        self.commit_and_continue()
    }

    /// Commits the pending batch and leaves the transaction open and empty.
    /// On failure the pending batch is discarded.
    pub fn commit_and_continue(&mut self) -> Result<(), GraphError> {
        let result = self.write_pending();
        self.batch.clear();
        self.vertices.clear();
        self.unique.clear();
        self.undo.clear();
        result
    }

    fn write_pending(&mut self) -> Result<(), GraphError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let inner = &self.graph.inner;
        let _guard = inner
            .commit_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for ((index, key), id) in &self.unique {
            if let Some(existing) = self.graph.lookup_unique(*index, key)? {
                if existing != *id {
                    return Err(violation(*index, key, existing));
                }
            }
        }
        let next_id = inner.next_id.load(Ordering::SeqCst);
        self.batch.put(Column::Meta, META_NEXT_ID, next_id.to_be_bytes());
        self.batch.set_durability(inner.options.durability());
        inner.store.write_batch(&self.batch)?;
        Ok(())
    }
}

fn violation(index: UniqueIndex, key: &[u8], existing: VertexId) -> GraphError {
    GraphError::UniqueViolation {
        index,
        key: index.display_key(key),
        existing,
    }
}
