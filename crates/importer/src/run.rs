//! One import invocation: load pass, link pass and the `Import` record that
//! documents it.
//!
//! The record is written with status `in progress` before any work starts
//! and rewritten when the run ends, whatever the outcome, so every run
//! leaves an auditable trace in the store.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use blkgraph_consensus::{hash256_to_hex, Hash256};
use blkgraph_graph::{BlockRecord, EdgeType, GraphError, GraphStore, ImportRecord, VertexId};
use blkgraph_storage::KeyValueStore;

use crate::blockfiles::RawFrame;
use crate::decode::RecordDecoder;
use crate::error::ImportError;
use crate::link::{safe_tail, LinkPass, LinkSummary};
use crate::load::{LoadPass, LoadSummary};
use crate::metrics::{ImportMetrics, MetricsSnapshot};
use crate::settings::ImportSettings;

pub const KIND_IMPORT: &str = "import";
pub const STATUS_IN_PROGRESS: &str = "in progress";
pub const STATUS_COMPLETED: &str = "completed";

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// Final status string for a run that ended with `result`.
pub fn run_status<T, E: std::fmt::Display>(result: &Result<T, E>, write_errors: u64) -> String {
    match result {
        Err(err) => format!("error: {err}"),
        Ok(_) if write_errors > 0 => {
            format!("completed with errors: {write_errors} write failures")
        }
        Ok(_) => STATUS_COMPLETED.to_string(),
    }
}

/// The persisted `Import` vertex of a run in progress.
pub(crate) struct RunRecord<S> {
    graph: GraphStore<S>,
    id: VertexId,
    record: ImportRecord,
    started: Instant,
}

impl<S: KeyValueStore> RunRecord<S> {
    pub(crate) fn start(graph: &GraphStore<S>, kind: &str) -> Result<Self, GraphError> {
        let record = ImportRecord {
            kind: kind.to_string(),
            status: STATUS_IN_PROGRESS.to_string(),
            begin_time: unix_millis(),
            ..ImportRecord::default()
        };
        let mut txn = graph.begin();
        let id = txn.create_vertex(&record)?;
        txn.commit()?;
        Ok(Self {
            graph: graph.clone(),
            id,
            record,
            started: Instant::now(),
        })
    }

    pub(crate) fn id(&self) -> VertexId {
        self.id
    }

    /// Rewrites the record with its final status and counters and adds the
    /// pointer edges.
    pub(crate) fn finish(
        mut self,
        status: String,
        metrics: &MetricsSnapshot,
        pointers: &[(EdgeType, VertexId)],
    ) -> Result<ImportRecord, GraphError> {
        let record = &mut self.record;
        record.status = status;
        record.end_time = Some(unix_millis());
        record.elapsed = Some(self.started.elapsed().as_millis() as u64);
        record.parsed_blocks = metrics.parsed_blocks;
        record.parsed_transactions = metrics.parsed_transactions;
        record.new_addresses = metrics.new_addresses;
        record.new_blocks = metrics.new_blocks;
        record.new_transactions = metrics.new_transactions;
        record.new_transaction_inputs = metrics.new_inputs;
        record.new_transaction_outputs = metrics.new_outputs;
        record.address_edges = metrics.address_edges;
        record.decode_errors = metrics.decode_errors;
        record.write_errors = metrics.write_errors;
        record.linked_blocks = metrics.link_ok;
        record.skipped_blocks = metrics.link_skipped;
        record.hash_not_found = metrics.hash_not_found;

        let mut txn = self.graph.begin();
        txn.save_vertex(self.id, &self.record)?;
        for (edge_type, target) in pointers {
            txn.create_edge(self.id, *target, *edge_type, false)?;
        }
        txn.commit()?;
        self.graph.flush()?;
        Ok(self.record)
    }
}

#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub import_id: VertexId,
    pub record: ImportRecord,
    pub load: Option<LoadSummary>,
    pub link: Option<LinkSummary>,
    pub head: Option<VertexId>,
    pub tail: Option<VertexId>,
    pub safe_tail: Option<VertexId>,
    /// `(missing predecessor, referencing block)` pairs.
    pub not_found: Vec<(Hash256, Hash256)>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.record.status == STATUS_COMPLETED
    }

    /// Unresolved predecessors followed by the pretty-printed record.
    pub fn report(&self) -> String {
        let mut out = String::new();
        if !self.not_found.is_empty() {
            out.push_str("The following blocks were not found to create the blockchain:\n");
            for (prev, block) in &self.not_found {
                let _ = writeln!(
                    out,
                    "- {} as previous block for {}",
                    hash256_to_hex(prev),
                    hash256_to_hex(block)
                );
            }
        }
        out.push_str("Import results:\n");
        out.push_str(&self.record.to_pretty_json());
        out.push('\n');
        out
    }
}

pub struct ImportRun<S> {
    graph: GraphStore<S>,
    settings: ImportSettings,
    metrics: Arc<ImportMetrics>,
}

impl<S: KeyValueStore + 'static> ImportRun<S> {
    pub fn new(graph: GraphStore<S>, settings: ImportSettings, metrics: Arc<ImportMetrics>) -> Self {
        Self {
            graph,
            settings,
            metrics,
        }
    }

    /// Runs both passes over `frames`. Pass failures end up in the record's
    /// status; only a failure to write the record itself is returned as an
    /// error.
    pub fn execute<I, D>(&self, frames: I, decoder: &D) -> Result<RunOutcome, ImportError>
    where
        I: IntoIterator<Item = RawFrame>,
        D: RecordDecoder + ?Sized,
    {
        let run = RunRecord::start(&self.graph, KIND_IMPORT)?;
        let import_id = run.id();

        let mut load = None;
        let mut link = None;
        let result = LoadPass::new(&self.graph, decoder, Arc::clone(&self.metrics), &self.settings)
            .run(frames)
            .and_then(|summary| {
                load = Some(summary);
                LinkPass::new(&self.graph, Arc::clone(&self.metrics)).run()
            })
            .map(|summary| {
                link = Some(summary);
            });
        if let Err(err) = &result {
            blkgraph_log::log_error!("import failed: {err}");
        }

        let ends = self.metrics.chain_ends();
        let head = ends.head.and_then(|block| self.stored_block(block.id, "head"));
        let tail = ends.tail.and_then(|block| self.stored_block(block.id, "tail"));
        let safe = match tail {
            Some(tail) => match safe_tail(&self.graph, tail, self.settings.safe_blocks_from_tail) {
                Ok(block) => self.stored_block(block, "safe tail"),
                Err(err) => {
                    blkgraph_log::log_warn!("cannot walk back from the tail block: {err}");
                    Some(tail)
                }
            },
            None => None,
        };

        let mut pointers = Vec::with_capacity(3);
        if let Some(head) = head {
            pointers.push((EdgeType::HeadBlock, head));
        }
        if let Some(tail) = tail {
            pointers.push((EdgeType::TailBlock, tail));
        }
        if let Some(safe) = safe {
            pointers.push((EdgeType::SafeTailBlock, safe));
        }

        let status = run_status(&result, self.metrics.write_errors());
        let record = run.finish(status, &self.metrics.snapshot(), &pointers)?;
        Ok(RunOutcome {
            import_id,
            record,
            load,
            link,
            head,
            tail,
            safe_tail: safe,
            not_found: self.metrics.not_found(),
        })
    }

    /// Keeps a chain-end pointer only if its block vertex is stored.
    fn stored_block(&self, id: VertexId, role: &str) -> Option<VertexId> {
        match self.graph.get_vertex::<BlockRecord>(id) {
            Ok(Some(_)) => Some(id),
            Ok(None) => {
                blkgraph_log::log_warn!("{role} block {id} is not stored; pointer skipped");
                None
            }
            Err(err) => {
                blkgraph_log::log_warn!("cannot read {role} block {id}: {err}; pointer skipped");
                None
            }
        }
    }
}
