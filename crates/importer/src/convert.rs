//! Turns address attributes of an attribute-mode import into `Address`
//! vertices and `HasAddress` edges.

use std::sync::Arc;
use std::time::{Duration, Instant};

use blkgraph_graph::{
    EdgeType, GraphError, GraphStore, GraphTx, ImportRecord, InputRecord, OutputRecord, VertexId,
    VertexRecord,
};
use blkgraph_storage::KeyValueStore;

use crate::address::AddressResolver;
use crate::error::ImportError;
use crate::metrics::ImportMetrics;
use crate::progress::format_conversion_status;
use crate::run::{run_status, RunRecord};

pub const KIND_ADDRESS_CONVERSION: &str = "address conversion";
pub const CONVERT_PROGRESS_EVERY: u64 = 100_000;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConversionSummary {
    pub scanned: u64,
    pub converted: u64,
    pub already_linked: u64,
    pub elapsed: Duration,
}

#[derive(Clone, Debug)]
pub struct ConversionOutcome {
    pub import_id: VertexId,
    pub record: ImportRecord,
    pub summary: Option<ConversionSummary>,
}

trait AddressHolder: VertexRecord {
    fn address(&self) -> Option<&str>;
}

impl AddressHolder for InputRecord {
    fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }
}

impl AddressHolder for OutputRecord {
    fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }
}

pub struct AddressConverter<S> {
    graph: GraphStore<S>,
    metrics: Arc<ImportMetrics>,
    commit_every: u64,
}

impl<S: KeyValueStore> AddressConverter<S> {
    pub fn new(graph: GraphStore<S>, metrics: Arc<ImportMetrics>, commit_every: usize) -> Self {
        Self {
            graph,
            metrics,
            commit_every: commit_every.max(1) as u64,
        }
    }

    /// Converts every input and output, recording the run as an `Import`
    /// vertex whatever the outcome.
    pub fn execute(&self) -> Result<ConversionOutcome, ImportError> {
        let run = RunRecord::start(&self.graph, KIND_ADDRESS_CONVERSION)?;
        let import_id = run.id();

        let result = self.convert_all();
        if let Err(err) = &result {
            blkgraph_log::log_error!("address conversion failed: {err}");
        }
        let status = run_status(&result, self.metrics.write_errors());
        let record = run.finish(status, &self.metrics.snapshot(), &[])?;
        Ok(ConversionOutcome {
            import_id,
            record,
            summary: result.ok(),
        })
    }

    fn convert_all(&self) -> Result<ConversionSummary, GraphError> {
        blkgraph_log::log_info!("converting address attributes to vertices");
        let started = Instant::now();
        let resolver = AddressResolver;
        let mut summary = ConversionSummary::default();
        let mut txn = self.graph.begin();
        let mut pending = 0u64;

        self.convert_type::<InputRecord>(&resolver, &mut txn, &mut pending, &mut summary, started)?;
        self.convert_type::<OutputRecord>(&resolver, &mut txn, &mut pending, &mut summary, started)?;
        txn.commit()?;
        self.graph.flush()?;

        summary.elapsed = started.elapsed();
        blkgraph_log::log_info!("{}", format_conversion_status(summary.converted, summary.elapsed));
        Ok(summary)
    }

    fn convert_type<R: AddressHolder>(
        &self,
        resolver: &AddressResolver,
        txn: &mut GraphTx<S>,
        pending: &mut u64,
        summary: &mut ConversionSummary,
        started: Instant,
    ) -> Result<(), GraphError> {
        self.graph.for_each_of_type::<R, _>(|id, record| {
            let Some(address) = record.address() else {
                return Ok(true);
            };
            summary.scanned += 1;
            if self.graph.has_out_edge(id, EdgeType::HasAddress)? {
                summary.already_linked += 1;
                return Ok(true);
            }

            let (address_id, created) = resolver.get_or_create(txn, address)?;
            txn.create_edge(id, address_id, EdgeType::HasAddress, true)?;
            if created {
                self.metrics.record_new_address();
            }
            self.metrics.record_address_edge();
            summary.converted += 1;
            *pending += 1;
            if *pending >= self.commit_every {
                txn.commit_and_continue()?;
                *pending = 0;
            }
            if summary.converted % CONVERT_PROGRESS_EVERY == 0 {
                blkgraph_log::log_info!(
                    "{}",
                    format_conversion_status(summary.converted, started.elapsed())
                );
            }
            Ok(true)
        })?;
        Ok(())
    }
}
