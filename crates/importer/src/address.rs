use blkgraph_graph::{AddressRecord, GraphError, GraphTx, UniqueIndex, VertexId};
use blkgraph_storage::KeyValueStore;

/// Get-or-create of `Address` vertices keyed by their hash.
///
/// The lookup goes through the caller's transaction, so an address created
/// earlier in the same transaction is found again. Two transactions racing
/// on the same hash both pass the lookup; the graph's unique index rejects
/// the second commit. The flag returned alongside the id is `true` when the
/// vertex was created by this call.
#[derive(Clone, Copy, Debug, Default)]
pub struct AddressResolver;

impl AddressResolver {
    pub fn get_or_create<S: KeyValueStore>(
        &self,
        txn: &mut GraphTx<S>,
        hash: &str,
    ) -> Result<(VertexId, bool), GraphError> {
        if let Some(id) = txn.lookup_unique(UniqueIndex::AddressHash, hash.as_bytes())? {
            return Ok((id, false));
        }
        let id = txn.create_vertex(&AddressRecord {
            hash: hash.to_string(),
        })?;
        Ok((id, true))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use blkgraph_graph::{GraphOptions, GraphStore, VertexType};
    use blkgraph_storage::memory::MemoryStore;

    use super::*;

    #[test]
    fn same_hash_resolves_to_same_vertex() {
        let graph = GraphStore::open(Arc::new(MemoryStore::new()), GraphOptions::default())
            .expect("open");
        let resolver = AddressResolver;

        let mut txn = graph.begin();
        let first = resolver.get_or_create(&mut txn, "addr1").expect("first");
        let pending = resolver.get_or_create(&mut txn, "addr1").expect("pending");
        txn.commit().expect("commit");

        let mut txn = graph.begin();
        let committed = resolver.get_or_create(&mut txn, "addr1").expect("committed");
        let other = resolver.get_or_create(&mut txn, "addr2").expect("other");
        txn.commit().expect("commit");

        assert_eq!(first.0, pending.0);
        assert_eq!(first.0, committed.0);
        assert_ne!(first.0, other.0);
        assert_eq!(
            [first.1, pending.1, committed.1, other.1],
            [true, false, false, true]
        );
        assert_eq!(graph.count_of_type(VertexType::Address).expect("count"), 2);
    }
}
