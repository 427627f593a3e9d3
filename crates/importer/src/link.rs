//! Second pass: `PreviousBlock` edges from stored block vertices.
//!
//! Blocks arrive in the store in no particular order, so chain order is
//! rebuilt here by looking each block's predecessor up in the block hash
//! index. Blocks that already have the edge are skipped, which makes the
//! pass resumable and idempotent.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;

use blkgraph_consensus::{hash256_to_hex, Hash256, GENESIS_PREV_HASH};
use blkgraph_graph::{BlockRecord, EdgeType, GraphError, GraphStore, UniqueIndex, VertexId};
use blkgraph_storage::KeyValueStore;

use crate::error::ImportError;
use crate::metrics::ImportMetrics;

pub const LINK_PROGRESS_EVERY: u64 = 100_000;
const LOOKUP_BATCH: usize = 4096;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LinkSummary {
    pub scanned: u64,
    pub linked: u64,
    pub already_linked: u64,
    pub genesis: u64,
    pub missing: u64,
    pub elapsed: Duration,
}

impl LinkSummary {
    pub fn skipped(&self) -> u64 {
        self.already_linked + self.genesis
    }
}

struct Candidate {
    id: VertexId,
    hash: Hash256,
    prev_hash: Hash256,
}

pub struct LinkPass<'a, S> {
    graph: &'a GraphStore<S>,
    metrics: Arc<ImportMetrics>,
}

impl<'a, S: KeyValueStore> LinkPass<'a, S> {
    pub fn new(graph: &'a GraphStore<S>, metrics: Arc<ImportMetrics>) -> Self {
        Self { graph, metrics }
    }

    pub fn run(&self) -> Result<LinkSummary, ImportError> {
        blkgraph_log::log_info!("building the block chain");
        let started = Instant::now();
        let mut summary = LinkSummary::default();
        let mut batch: Vec<Candidate> = Vec::with_capacity(LOOKUP_BATCH);

        self.graph
            .for_each_of_type::<BlockRecord, _>(|id, block| {
                summary.scanned += 1;
                let scanned = self.metrics.record_link_scanned();
                if scanned % LINK_PROGRESS_EVERY == 0 {
                    self.log_progress("elapsed", started.elapsed(), &summary);
                }

                if self.graph.has_out_edge(id, EdgeType::PreviousBlock)? {
                    summary.already_linked += 1;
                    self.metrics.record_link_skipped();
                    return Ok(true);
                }
                if block.prev_hash == GENESIS_PREV_HASH {
                    summary.genesis += 1;
                    self.metrics.record_link_skipped();
                    return Ok(true);
                }

                batch.push(Candidate {
                    id,
                    hash: block.hash,
                    prev_hash: block.prev_hash,
                });
                if batch.len() >= LOOKUP_BATCH {
                    self.resolve(&mut batch, &mut summary)?;
                }
                Ok(true)
            })?;
        self.resolve(&mut batch, &mut summary)?;
        self.graph.flush()?;

        summary.elapsed = started.elapsed();
        self.log_progress("completed in", summary.elapsed, &summary);
        Ok(summary)
    }

    /// Looks up the predecessors of `batch` in parallel, then writes the
    /// edges that resolved in one commit.
    fn resolve(&self, batch: &mut Vec<Candidate>, summary: &mut LinkSummary) -> Result<(), GraphError> {
        if batch.is_empty() {
            return Ok(());
        }
        let graph = self.graph;
        let found = batch
            .par_iter()
            .map(|candidate| graph.lookup_unique(UniqueIndex::BlockHash, &candidate.prev_hash))
            .collect::<Result<Vec<_>, GraphError>>()?;

        let mut txn = graph.begin();
        for (candidate, predecessor) in batch.drain(..).zip(found) {
            match predecessor {
                Some(prev_id) => {
                    txn.create_edge(candidate.id, prev_id, EdgeType::PreviousBlock, true)?;
                    summary.linked += 1;
                    self.metrics.record_link_ok();
                }
                None => {
                    summary.missing += 1;
                    self.metrics
                        .record_missing_predecessor(candidate.prev_hash, candidate.hash);
                    blkgraph_log::log_warn!(
                        "block {} not found as predecessor of {}",
                        hash256_to_hex(&candidate.prev_hash),
                        hash256_to_hex(&candidate.hash)
                    );
                }
            }
        }
        txn.commit()
    }

    fn log_progress(&self, label: &str, elapsed: Duration, summary: &LinkSummary) {
        blkgraph_log::log_info!(
            "- {label} {} secs loaded: {} okLinks: {} koLinks: {} skipped: {}",
            elapsed.as_secs(),
            summary.scanned,
            summary.linked,
            summary.missing,
            summary.skipped()
        );
    }
}

/// Follows `PreviousBlock` edges from `from` for at most `max_hops` steps.
/// Returns the block reached and the number of hops taken; stops early at a
/// block without a predecessor edge.
pub fn walk_back<S: KeyValueStore>(
    graph: &GraphStore<S>,
    from: VertexId,
    max_hops: usize,
) -> Result<(VertexId, usize), GraphError> {
    let mut current = from;
    for hops in 0..max_hops {
        match graph.out_edges(current, EdgeType::PreviousBlock)?.first() {
            Some(prev) => current = *prev,
            None => return Ok((current, hops)),
        }
    }
    Ok((current, max_hops))
}

/// The block `hops` predecessors behind `tail`, or the oldest reachable one.
pub fn safe_tail<S: KeyValueStore>(
    graph: &GraphStore<S>,
    tail: VertexId,
    hops: usize,
) -> Result<VertexId, GraphError> {
    walk_back(graph, tail, hops).map(|(block, _)| block)
}
