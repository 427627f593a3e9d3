//! First pass: frames to graph writes.
//!
//! A single producer decodes frames and hands each new block to a sink. In
//! attribute mode the sink is the graph's asynchronous writer and each block
//! (with all its transactions) is one job; in vertex mode it is one
//! synchronous transaction committed at block boundaries. Either way a block
//! vertex is first written with `fully_parsed = false` and rewritten with
//! `true` only after every transaction, input, output and address edge of
//! the block has been written in the same unit of work.
//!
//! A block only counts as new, and only becomes a head or tail candidate,
//! once its unit of work has committed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use blkgraph_consensus::{hash256_to_hex, Hash256};
use blkgraph_graph::{
    AsyncWriter, BlockRecord, EdgeType, ErrorCallback, GraphError, GraphStore, GraphTx,
    InputRecord, OutputRecord, TransactionRecord, UniqueIndex, VertexId, VertexType, WriteJob,
};
use blkgraph_storage::KeyValueStore;

use crate::address::AddressResolver;
use crate::blockfiles::RawFrame;
use crate::decode::{absolute_offset, DecodedBlock, RecordDecoder};
use crate::error::ImportError;
use crate::metrics::{BlockRef, BlockTally, ChainEnds, ImportMetrics};
use crate::settings::{ImportSettings, IngestStrategy};

#[derive(Clone, Debug, Default)]
pub struct LoadSummary {
    pub ends: ChainEnds,
    pub frames: u64,
    pub decoded_blocks: u64,
    pub new_blocks: u64,
    pub existing_blocks: u64,
    pub submitted_transactions: u64,
    pub stopped_by_limit: bool,
    pub elapsed: Duration,
}

pub struct LoadPass<'a, S, D: ?Sized> {
    graph: &'a GraphStore<S>,
    decoder: &'a D,
    metrics: Arc<ImportMetrics>,
    settings: &'a ImportSettings,
}

impl<'a, S, D> LoadPass<'a, S, D>
where
    S: KeyValueStore + 'static,
    D: RecordDecoder + ?Sized,
{
    pub fn new(
        graph: &'a GraphStore<S>,
        decoder: &'a D,
        metrics: Arc<ImportMetrics>,
        settings: &'a ImportSettings,
    ) -> Self {
        Self {
            graph,
            decoder,
            metrics,
            settings,
        }
    }

    /// Consumes `frames` and returns once every write it produced is
    /// committed and flushed.
    pub fn run<I>(&self, frames: I) -> Result<LoadSummary, ImportError>
    where
        I: IntoIterator<Item = RawFrame>,
    {
        blkgraph_log::log_info!(
            "parsing block files into the graph (addresses as {}, commit every {})",
            self.settings.strategy.as_str(),
            self.settings.commit_every
        );
        let started = Instant::now();
        let mut summary = match self.settings.strategy {
            IngestStrategy::Attribute => {
                let metrics = Arc::clone(&self.metrics);
                let on_error: ErrorCallback = Arc::new(move |err: GraphError| {
                    metrics.record_write_error();
                    blkgraph_log::log_error!("graph write failed: {err}");
                });
                let writer = AsyncWriter::new(
                    self.graph.clone(),
                    self.settings.writer_options(),
                    on_error,
                );
                let sink = AsyncSink {
                    writer,
                    txs: TxWriter::new(None),
                    in_flight: Arc::new(Mutex::new(HashMap::new())),
                    metrics: Arc::clone(&self.metrics),
                };
                self.drive(frames, sink)?
            }
            IngestStrategy::Vertex => {
                let sink = SyncSink {
                    graph: self.graph.clone(),
                    txn: self.graph.begin(),
                    txs: TxWriter::new(Some(AddressResolver)),
                    commit_every: self.settings.commit_every.max(1) as u64,
                    since_commit: 0,
                    pending: Vec::new(),
                    metrics: Arc::clone(&self.metrics),
                };
                self.drive(frames, sink)?
            }
        };
        summary.elapsed = started.elapsed();
        blkgraph_log::log_info!(
            "load completed in {} secs: {} new blocks, {} already present, {} decode errors",
            summary.elapsed.as_secs(),
            summary.new_blocks,
            summary.existing_blocks,
            summary.frames - summary.decoded_blocks
        );
        Ok(summary)
    }

    fn drive<I, K>(&self, frames: I, mut sink: K) -> Result<LoadSummary, ImportError>
    where
        I: IntoIterator<Item = RawFrame>,
        K: BlockSink<S>,
    {
        let settings = self.settings;
        let mut summary = LoadSummary::default();

        for frame in frames {
            summary.frames += 1;
            let block = match self.decoder.decode(&frame.payload) {
                Ok(block) => block,
                Err(err) => {
                    self.metrics.record_decode_error();
                    blkgraph_log::log_debug!(
                        "skipping undecodable frame at {}:{}: {err}",
                        frame.source_file.display(),
                        frame.byte_offset
                    );
                    continue;
                }
            };
            let seq = summary.decoded_blocks;
            summary.decoded_blocks += 1;
            self.metrics.record_parsed_block();
            blkgraph_log::log_trace!(
                "parsed block {} at {}:{}",
                hash256_to_hex(&block.hash),
                frame.source_file.display(),
                frame.byte_offset
            );

            let hash = block.hash;
            match sink.existing(&hash)? {
                Some(id) => {
                    summary.existing_blocks += 1;
                    self.metrics.record_existing_block();
                    let found = BlockRef {
                        id,
                        hash,
                        time: block.header.time,
                        seq,
                    };
                    self.metrics.observe_block(found, &block.header.prev_block);
                }
                None => {
                    let tx_count = block.transactions.len() as u64;
                    summary.submitted_transactions += tx_count;
                    self.metrics.record_parsed_transactions(tx_count);
                    let record = block_record(&block, &frame);
                    match sink.write(record, block, frame.byte_offset, seq) {
                        Ok(_) => {}
                        Err(GraphError::Store(err)) => return Err(ImportError::from(err)),
                        Err(GraphError::WriterClosed) => {
                            return Err(ImportError::Graph(GraphError::WriterClosed))
                        }
                        Err(err) => {
                            self.metrics.record_write_error();
                            blkgraph_log::log_error!(
                                "cannot write block {}: {err}",
                                hash256_to_hex(&hash)
                            );
                        }
                    }
                }
            }

            if settings.limit_transactions > 0
                && summary.submitted_transactions >= settings.limit_transactions
            {
                blkgraph_log::log_info!(
                    "reached limit of {} transactions",
                    settings.limit_transactions
                );
                summary.stopped_by_limit = true;
                break;
            }
            if settings.limit_blocks > 0 && summary.decoded_blocks >= settings.limit_blocks {
                blkgraph_log::log_info!("reached limit of {} blocks", settings.limit_blocks);
                summary.stopped_by_limit = true;
                break;
            }
        }

        sink.finish()?;
        summary.new_blocks = self.metrics.new_blocks();
        summary.ends = self.metrics.chain_ends();
        Ok(summary)
    }
}

fn block_record(block: &DecodedBlock, frame: &RawFrame) -> BlockRecord {
    let origin_file = frame
        .source_file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    BlockRecord {
        hash: block.hash,
        prev_hash: block.header.prev_block,
        merkle_root: block.header.merkle_root,
        time: block.header.time,
        difficulty_target: block.header.bits,
        nonce: block.header.nonce,
        version: block.header.version,
        tx_count: block.transactions.len() as u32,
        origin_file,
        origin_file_offset: frame.byte_offset,
        fully_parsed: false,
    }
}

/// Destination of new blocks during the load pass.
trait BlockSink<S> {
    /// Id of the block if it is stored or already accepted by this sink.
    fn existing(&mut self, hash: &Hash256) -> Result<Option<VertexId>, GraphError>;

    /// Queues or performs the writes of one new block and returns its id.
    /// `seq` is the block's position in decode order.
    fn write(
        &mut self,
        record: BlockRecord,
        block: DecodedBlock,
        frame_offset: u64,
        seq: u64,
    ) -> Result<VertexId, GraphError>;

    /// Makes every accepted write durable.
    fn finish(self) -> Result<(), GraphError>;
}

type InFlight = Arc<Mutex<HashMap<Hash256, VertexId>>>;

struct AsyncSink<S> {
    writer: AsyncWriter<S>,
    txs: TxWriter,
    /// Blocks handed to the writer and not yet committed or abandoned.
    in_flight: InFlight,
    metrics: Arc<ImportMetrics>,
}

impl<S: KeyValueStore + 'static> BlockSink<S> for AsyncSink<S> {
    fn existing(&mut self, hash: &Hash256) -> Result<Option<VertexId>, GraphError> {
        let queued = self
            .in_flight
            .lock()
            .expect("in-flight lock")
            .get(hash)
            .copied();
        match queued {
            Some(id) => Ok(Some(id)),
            None => self.writer.graph().lookup_unique(UniqueIndex::BlockHash, hash),
        }
    }

    fn write(
        &mut self,
        record: BlockRecord,
        block: DecodedBlock,
        frame_offset: u64,
        seq: u64,
    ) -> Result<VertexId, GraphError> {
        let id = self.writer.graph().allocate_id(VertexType::Block);
        let hash = block.hash;
        self.in_flight
            .lock()
            .expect("in-flight lock")
            .insert(hash, id);
        let job = BlockJob {
            id,
            seq,
            record,
            block,
            frame_offset,
            txs: self.txs,
            tally: BlockTally::default(),
            in_flight: Arc::clone(&self.in_flight),
            metrics: Arc::clone(&self.metrics),
        };
        if let Err(err) = self.writer.submit(Box::new(job)) {
            self.in_flight.lock().expect("in-flight lock").remove(&hash);
            return Err(err);
        }
        Ok(id)
    }

    fn finish(self) -> Result<(), GraphError> {
        let result = self.writer.wait_completion();
        self.writer.close();
        result
    }
}

/// One block and its transactions as a single writer job. Accounting runs
/// from the commit callbacks, so a replayed job is counted once.
struct BlockJob {
    id: VertexId,
    seq: u64,
    record: BlockRecord,
    block: DecodedBlock,
    frame_offset: u64,
    txs: TxWriter,
    tally: BlockTally,
    in_flight: InFlight,
    metrics: Arc<ImportMetrics>,
}

impl BlockJob {
    fn release(&self) {
        self.in_flight
            .lock()
            .expect("in-flight lock")
            .remove(&self.block.hash);
    }
}

impl<S: KeyValueStore> WriteJob<S> for BlockJob {
    fn apply(&mut self, txn: &mut GraphTx<S>) -> Result<(), GraphError> {
        self.tally = BlockTally::default();
        write_block(
            txn,
            &self.txs,
            self.id,
            &self.record,
            &self.block,
            self.frame_offset,
            &mut self.tally,
        )
    }

    fn committed(self: Box<Self>) {
        self.metrics.record_tally(&self.tally);
        self.metrics.record_new_block();
        let block = BlockRef {
            id: self.id,
            hash: self.block.hash,
            time: self.record.time,
            seq: self.seq,
        };
        self.metrics.observe_block(block, &self.record.prev_hash);
        self.release();
    }

    fn abandoned(self: Box<Self>, err: &GraphError) {
        blkgraph_log::log_debug!(
            "block {} was not stored: {err}",
            hash256_to_hex(&self.block.hash)
        );
        self.release();
    }
}

/// A block written to the open transaction but not committed yet.
struct PendingBlock {
    block: BlockRef,
    prev_hash: Hash256,
    tally: BlockTally,
}

struct SyncSink<S> {
    graph: GraphStore<S>,
    txn: GraphTx<S>,
    txs: TxWriter,
    commit_every: u64,
    since_commit: u64,
    pending: Vec<PendingBlock>,
    metrics: Arc<ImportMetrics>,
}

impl<S: KeyValueStore> SyncSink<S> {
    fn commit(&mut self) -> Result<(), GraphError> {
        self.since_commit = 0;
        match self.txn.commit_and_continue() {
            Ok(()) => {
                for pending in self.pending.drain(..) {
                    self.metrics.record_tally(&pending.tally);
                    self.metrics.record_new_block();
                    self.metrics.observe_block(pending.block, &pending.prev_hash);
                }
                Ok(())
            }
            Err(GraphError::Store(err)) => {
                self.pending.clear();
                Err(GraphError::Store(err))
            }
            Err(err) => {
                let dropped = self.pending.len();
                for _ in self.pending.drain(..) {
                    self.metrics.record_write_error();
                }
                blkgraph_log::log_error!("graph commit failed, {dropped} blocks dropped: {err}");
                Ok(())
            }
        }
    }
}

impl<S: KeyValueStore> BlockSink<S> for SyncSink<S> {
    fn existing(&mut self, hash: &Hash256) -> Result<Option<VertexId>, GraphError> {
        self.txn.lookup_unique(UniqueIndex::BlockHash, hash)
    }

    fn write(
        &mut self,
        record: BlockRecord,
        block: DecodedBlock,
        frame_offset: u64,
        seq: u64,
    ) -> Result<VertexId, GraphError> {
        let savepoint = self.txn.savepoint();
        let id = self.graph.allocate_id(VertexType::Block);
        let mut tally = BlockTally::default();
        let written = write_block(
            &mut self.txn,
            &self.txs,
            id,
            &record,
            &block,
            frame_offset,
            &mut tally,
        );
        if let Err(err) = written {
            self.txn.rollback_to(savepoint);
            return Err(err);
        }
        self.pending.push(PendingBlock {
            block: BlockRef {
                id,
                hash: block.hash,
                time: record.time,
                seq,
            },
            prev_hash: record.prev_hash,
            tally,
        });
        self.since_commit += block.transactions.len() as u64;
        if self.since_commit >= self.commit_every {
            self.commit()?;
        }
        Ok(id)
    }

    fn finish(mut self) -> Result<(), GraphError> {
        self.commit()?;
        self.graph.flush()
    }
}

fn write_block<S: KeyValueStore>(
    txn: &mut GraphTx<S>,
    txs: &TxWriter,
    id: VertexId,
    record: &BlockRecord,
    block: &DecodedBlock,
    frame_offset: u64,
    tally: &mut BlockTally,
) -> Result<(), GraphError> {
    txn.save_vertex(id, record)?;
    txs.write_transactions(txn, id, block, frame_offset, tally)?;
    let parsed = BlockRecord {
        fully_parsed: true,
        ..record.clone()
    };
    txn.save_vertex(id, &parsed)
}

/// Writes the transactions of one block and everything hanging off them.
#[derive(Clone, Copy, Debug)]
struct TxWriter {
    addresses: Option<AddressResolver>,
}

impl TxWriter {
    fn new(addresses: Option<AddressResolver>) -> Self {
        Self { addresses }
    }

    fn write_transactions<S: KeyValueStore>(
        &self,
        txn: &mut GraphTx<S>,
        block_id: VertexId,
        block: &DecodedBlock,
        frame_offset: u64,
        tally: &mut BlockTally,
    ) -> Result<(), GraphError> {
        let attribute_mode = self.addresses.is_none();
        for tx in &block.transactions {
            // The same txid in two blocks (pre-BIP30 coinbases) keeps one vertex.
            if let Some(existing) = txn.lookup_unique(UniqueIndex::TransactionId, &tx.txid)? {
                txn.create_edge(block_id, existing, EdgeType::BlockTx, true)?;
                tally.reused_transactions += 1;
                continue;
            }

            let tx_id = txn.create_vertex(&TransactionRecord {
                txid: tx.txid,
                wtxid: tx.wtxid,
                version: tx.version,
                lock_time: tx.lock_time,
                coinbase: tx.coinbase,
                input_count: tx.inputs.len() as u32,
                output_count: tx.outputs.len() as u32,
                origin_file_offset: absolute_offset(frame_offset, tx.offset),
            })?;
            tally.new_transactions += 1;
            txn.create_edge(block_id, tx_id, EdgeType::BlockTx, true)?;

            for input in &tx.inputs {
                let input_id = txn.create_vertex(&InputRecord {
                    index: input.index,
                    prev_txid: input.prev_txid,
                    prev_index: input.prev_index,
                    sequence: input.sequence,
                    coinbase: input.coinbase,
                    value: 0,
                    source_offset: absolute_offset(frame_offset, input.offset),
                    address: if attribute_mode {
                        input.address.clone()
                    } else {
                        None
                    },
                })?;
                txn.create_edge(tx_id, input_id, EdgeType::Input, true)?;
                tally.new_inputs += 1;
                self.link_address(txn, input_id, input.address.as_deref(), tally)?;
            }

            for output in &tx.outputs {
                let output_id = txn.create_vertex(&OutputRecord {
                    index: output.index,
                    value: output.value,
                    source_offset: absolute_offset(frame_offset, output.offset),
                    address: if attribute_mode {
                        output.address.clone()
                    } else {
                        None
                    },
                })?;
                txn.create_edge(tx_id, output_id, EdgeType::Output, true)?;
                tally.new_outputs += 1;
                self.link_address(txn, output_id, output.address.as_deref(), tally)?;
            }
        }
        Ok(())
    }

    fn link_address<S: KeyValueStore>(
        &self,
        txn: &mut GraphTx<S>,
        from: VertexId,
        address: Option<&str>,
        tally: &mut BlockTally,
    ) -> Result<(), GraphError> {
        let (Some(resolver), Some(address)) = (self.addresses.as_ref(), address) else {
            return Ok(());
        };
        let (address_id, created) = resolver.get_or_create(txn, address)?;
        txn.create_edge(from, address_id, EdgeType::HasAddress, true)?;
        if created {
            tally.new_addresses += 1;
        }
        tally.address_edges += 1;
        Ok(())
    }
}
