use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use blkgraph_consensus::{chain_params, hash256_to_hex, Hash256, Network, GENESIS_PREV_HASH};
use blkgraph_graph::{
    BlockRecord, EdgeType, GraphOptions, GraphStore, ImportRecord, OutputRecord, UniqueIndex,
    VertexId, VertexType,
};
use blkgraph_importer::blockfiles::{block_file_path, list_block_files, FrameScanner};
use blkgraph_importer::convert::AddressConverter;
use blkgraph_importer::decode::{BitcoinDecoder, RecordDecoder};
use blkgraph_importer::link::{walk_back, LinkPass};
use blkgraph_importer::metrics::ImportMetrics;
use blkgraph_importer::run::{ImportRun, RunOutcome};
use blkgraph_importer::scan::DatafileScanner;
use blkgraph_importer::settings::{ImportSettings, IngestStrategy, ScanFilters};
use blkgraph_primitives::{p2pkh_script, Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut};
use blkgraph_storage::memory::MemoryStore;
use blkgraph_storage::{
    Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp,
};

type Graph = GraphStore<Arc<MemoryStore>>;

const PAYEE: [u8; 20] = [0x11; 20];

fn magic() -> [u8; 4] {
    chain_params(Network::Mainnet).message_start
}

fn decoder() -> BitcoinDecoder {
    BitcoinDecoder::new(chain_params(Network::Mainnet))
}

/// One coinbase transaction paying `PAYEE`; `tag` keeps txids distinct.
fn block(prev: Hash256, time: u32, tag: u8) -> Vec<u8> {
    block_with_coinbase(prev, time, u32::from(tag), tag)
}

/// Like [`block`], but blocks built with the same `tx_tag` carry the same
/// coinbase transaction.
fn block_with_coinbase(prev: Hash256, time: u32, nonce: u32, tx_tag: u8) -> Vec<u8> {
    let tag = tx_tag;
    let tx = Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: vec![0x01, tag],
            sequence: u32::MAX,
            witness: Vec::new(),
            offset: 0,
        }],
        outputs: vec![TxOut {
            value: 5_000_000_000,
            script_pubkey: p2pkh_script(&PAYEE),
            offset: 0,
        }],
        lock_time: 0,
        offset: 0,
    };
    Block {
        header: BlockHeader {
            version: 1,
            prev_block: prev,
            merkle_root: tx.txid(),
            time,
            bits: 0x1d00_ffff,
            nonce,
        },
        transactions: vec![tx],
    }
    .consensus_encode()
}

fn hash_of(payload: &[u8]) -> Hash256 {
    Block::consensus_decode(payload)
        .expect("fixture block")
        .header
        .hash()
}

fn payee_address() -> String {
    let payload = block(GENESIS_PREV_HASH, 1, 0);
    decoder()
        .decode(&payload)
        .expect("decode")
        .transactions[0]
        .outputs[0]
        .address
        .clone()
        .expect("p2pkh address")
}

fn write_blocks(dir: &Path, index: u32, payloads: &[Vec<u8>]) {
    let mut bytes = Vec::new();
    for payload in payloads {
        bytes.extend_from_slice(&magic());
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(payload);
    }
    std::fs::write(block_file_path(dir, index), bytes).expect("write block file");
}

fn memory_graph() -> Graph {
    GraphStore::open(Arc::new(MemoryStore::new()), GraphOptions::default()).expect("open graph")
}

fn import(graph: &Graph, dir: &Path, settings: ImportSettings) -> RunOutcome {
    let scanner = FrameScanner::new(
        list_block_files(dir, settings.files_from),
        magic(),
        settings.frame_ceiling(),
    );
    ImportRun::new(graph.clone(), settings, Arc::new(ImportMetrics::new()))
        .execute(scanner, &decoder())
        .expect("import run")
}

fn block_id(graph: &Graph, hash: &Hash256) -> VertexId {
    graph
        .lookup_unique(UniqueIndex::BlockHash, hash)
        .expect("lookup")
        .expect("block stored")
}

fn previous(graph: &Graph, id: VertexId) -> Vec<VertexId> {
    graph.out_edges(id, EdgeType::PreviousBlock).expect("edges")
}

struct Fork {
    a: Hash256,
    b: Hash256,
    c: Hash256,
}

/// A (genesis child, t=100), B (after A, t=200), C (after A, t=150).
fn write_fork(dir: &Path) -> Fork {
    let a = block(GENESIS_PREV_HASH, 100, 1);
    let a_hash = hash_of(&a);
    let b = block(a_hash, 200, 2);
    let c = block(a_hash, 150, 3);
    let fork = Fork {
        a: a_hash,
        b: hash_of(&b),
        c: hash_of(&c),
    };
    write_blocks(dir, 0, &[a, b, c]);
    fork
}

fn assert_fork_structure(graph: &Graph, fork: &Fork, outcome: &RunOutcome) {
    let a = block_id(graph, &fork.a);
    let b = block_id(graph, &fork.b);
    let c = block_id(graph, &fork.c);

    assert!(outcome.succeeded(), "{}", outcome.record.status);
    assert_eq!(outcome.head, Some(a));
    assert_eq!(outcome.tail, Some(b));
    assert_eq!(outcome.safe_tail, Some(a));
    assert!(outcome.not_found.is_empty());

    assert_eq!(graph.count_of_type(VertexType::Block).expect("count"), 3);
    assert_eq!(graph.count_of_type(VertexType::Transaction).expect("count"), 3);
    assert_eq!(graph.count_of_type(VertexType::OutputTx).expect("count"), 3);
    assert_eq!(graph.count_of_type(VertexType::InputTx).expect("count"), 3);

    assert_eq!(previous(graph, b), vec![a]);
    assert_eq!(previous(graph, c), vec![a]);
    assert!(previous(graph, a).is_empty());

    for id in [a, b, c] {
        let record: BlockRecord = graph.get_vertex(id).expect("get").expect("block");
        assert!(record.fully_parsed);
        assert_eq!(record.origin_file, "blk00000.dat");
        assert_eq!(graph.out_edges(id, EdgeType::BlockTx).expect("txs").len(), 1);
    }
    let first: BlockRecord = graph.get_vertex(a).expect("get").expect("block");
    assert_eq!(first.origin_file_offset, 4);

    let record = &outcome.record;
    assert_eq!(record.kind, "import");
    assert_eq!(record.status, "completed");
    assert_eq!(record.parsed_blocks, 3);
    assert_eq!(record.new_blocks, 3);
    assert_eq!(record.new_transactions, 3);
    assert_eq!(record.new_transaction_outputs, 3);
    assert_eq!(record.linked_blocks, 2);
    assert_eq!(record.skipped_blocks, 1);
    assert_eq!(record.hash_not_found, 0);
    assert!(record.end_time.is_some());

    let run = outcome.import_id;
    assert_eq!(graph.out_edges(run, EdgeType::HeadBlock).expect("head"), vec![a]);
    assert_eq!(graph.out_edges(run, EdgeType::TailBlock).expect("tail"), vec![b]);
    assert_eq!(graph.out_edges(run, EdgeType::SafeTailBlock).expect("safe"), vec![a]);
}

#[test]
fn fork_in_attribute_mode_stores_addresses_on_outputs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fork = write_fork(dir.path());
    let graph = memory_graph();
    let settings = ImportSettings {
        parallel_workers: 2,
        ..ImportSettings::default()
    };
    let outcome = import(&graph, dir.path(), settings);
    assert_fork_structure(&graph, &fork, &outcome);

    let address = payee_address();
    let mut addresses = Vec::new();
    graph
        .for_each_of_type::<OutputRecord, _>(|_, output| {
            addresses.push(output.address);
            Ok(true)
        })
        .expect("scan outputs");
    assert_eq!(addresses, vec![Some(address); 3]);
    assert_eq!(graph.count_of_type(VertexType::Address).expect("count"), 0);
    assert_eq!(outcome.record.new_addresses, 0);
}

#[test]
fn fork_in_vertex_mode_shares_one_address_vertex() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fork = write_fork(dir.path());
    let graph = memory_graph();
    let settings = ImportSettings {
        strategy: IngestStrategy::Vertex,
        commit_every: 1,
        ..ImportSettings::default()
    };
    let outcome = import(&graph, dir.path(), settings);
    assert_fork_structure(&graph, &fork, &outcome);

    assert_eq!(graph.count_of_type(VertexType::Address).expect("count"), 1);
    let address = graph
        .lookup_unique(UniqueIndex::AddressHash, payee_address().as_bytes())
        .expect("lookup")
        .expect("address vertex");
    assert_eq!(graph.in_edges(address, EdgeType::HasAddress).expect("edges").len(), 3);
    assert_eq!(outcome.record.new_addresses, 1);
    assert_eq!(outcome.record.address_edges, 3);

    graph
        .for_each_of_type::<OutputRecord, _>(|_, output| {
            assert_eq!(output.address, None);
            Ok(true)
        })
        .expect("scan outputs");
}

#[test]
fn second_link_pass_links_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fork = write_fork(dir.path());
    let graph = memory_graph();
    import(&graph, dir.path(), ImportSettings::default());

    let summary = LinkPass::new(&graph, Arc::new(ImportMetrics::new()))
        .run()
        .expect("link again");
    assert_eq!(summary.scanned, 3);
    assert_eq!(summary.linked, 0);
    assert_eq!(summary.already_linked, 2);
    assert_eq!(summary.genesis, 1);
    assert_eq!(summary.missing, 0);

    let a = block_id(&graph, &fork.a);
    assert_eq!(previous(&graph, block_id(&graph, &fork.b)), vec![a]);
    assert_eq!(previous(&graph, block_id(&graph, &fork.c)), vec![a]);
}

#[test]
fn tail_walks_back_to_head_across_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut prev = GENESIS_PREV_HASH;
    let mut hashes = Vec::new();
    let mut payloads = Vec::new();
    for height in 0..8u32 {
        let payload = block(prev, 1_000 + height * 600, height as u8 + 1);
        prev = hash_of(&payload);
        hashes.push(prev);
        payloads.push(payload);
    }
    // Later blocks first, split over two files.
    write_blocks(dir.path(), 0, &payloads[4..]);
    write_blocks(dir.path(), 1, &payloads[..4]);

    let graph = memory_graph();
    let settings = ImportSettings {
        safe_blocks_from_tail: 3,
        parallel_workers: 3,
        commit_every: 2,
        ..ImportSettings::default()
    };
    let outcome = import(&graph, dir.path(), settings);
    let head = block_id(&graph, &hashes[0]);
    let tail = block_id(&graph, &hashes[7]);
    assert_eq!(outcome.head, Some(head));
    assert_eq!(outcome.tail, Some(tail));
    assert_eq!(outcome.safe_tail, Some(block_id(&graph, &hashes[4])));

    let (reached, hops) = walk_back(&graph, tail, 100).expect("walk");
    assert_eq!(reached, head);
    assert_eq!(hops, 7);
    assert_eq!(outcome.record.linked_blocks, 7);
}

#[test]
fn missing_predecessor_is_reported_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let a = block(GENESIS_PREV_HASH, 100, 1);
    let b = block(hash_of(&a), 200, 2);
    let absent = [0xabu8; 32];
    let d = block(absent, 300, 4);
    let e = block(hash_of(&d), 400, 5);
    let d_hash = hash_of(&d);
    write_blocks(dir.path(), 0, &[a, b, d, e.clone()]);

    let graph = memory_graph();
    let outcome = import(&graph, dir.path(), ImportSettings::default());
    assert!(outcome.succeeded());
    assert_eq!(outcome.not_found, vec![(absent, d_hash)]);
    assert_eq!(outcome.record.hash_not_found, 1);
    assert_eq!(outcome.record.linked_blocks, 2);
    assert!(previous(&graph, block_id(&graph, &d_hash)).is_empty());
    assert_eq!(
        previous(&graph, block_id(&graph, &hash_of(&e))),
        vec![block_id(&graph, &d_hash)]
    );

    // The tail walk stops at the gap.
    assert_eq!(outcome.safe_tail, Some(block_id(&graph, &d_hash)));

    let report = outcome.report();
    assert!(report.contains("The following blocks were not found to create the blockchain:"));
    assert!(report.contains(&format!(
        "- {} as previous block for {}",
        hash256_to_hex(&absent),
        hash256_to_hex(&d_hash)
    )));
    assert!(report.contains("\"hashNotFound\": 1"));
}

#[test]
fn shared_coinbase_in_parallel_workers_keeps_every_block() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut payloads = Vec::new();
    let mut hashes = Vec::new();
    let mut prev = GENESIS_PREV_HASH;
    for height in 0..10u32 {
        // Blocks 1 and 2 repeat one coinbase, the way pre-BIP30 blocks did.
        let tx_tag = if height == 2 { 1 } else { height as u8 };
        let payload = block_with_coinbase(prev, 100 + height, height, tx_tag);
        prev = hash_of(&payload);
        hashes.push(prev);
        payloads.push(payload);
    }
    write_blocks(dir.path(), 0, &payloads);

    let graph = memory_graph();
    let settings = ImportSettings {
        parallel_workers: 2,
        ..ImportSettings::default()
    };
    let outcome = import(&graph, dir.path(), settings);

    assert!(outcome.succeeded(), "{}", outcome.record.status);
    assert_eq!(outcome.record.new_blocks, 10);
    assert_eq!(outcome.record.new_transactions, 9);
    assert_eq!(outcome.record.write_errors, 0);
    assert_eq!(outcome.record.linked_blocks, 9);
    assert!(outcome.not_found.is_empty());
    assert_eq!(graph.count_of_type(VertexType::Block).expect("count"), 10);
    assert_eq!(graph.count_of_type(VertexType::Transaction).expect("count"), 9);

    let tail = outcome.tail.expect("tail pointer");
    assert_eq!(tail, block_id(&graph, &hashes[9]));
    assert!(graph.get_vertex::<BlockRecord>(tail).expect("get").is_some());
    assert_eq!(outcome.head, Some(block_id(&graph, &hashes[0])));

    let first = graph
        .out_edges(block_id(&graph, &hashes[1]), EdgeType::BlockTx)
        .expect("txs");
    let second = graph
        .out_edges(block_id(&graph, &hashes[2]), EdgeType::BlockTx)
        .expect("txs");
    assert_eq!(first.len(), 1);
    assert_eq!(first, second);
    for hash in &hashes {
        let record: BlockRecord = graph
            .get_vertex(block_id(&graph, hash))
            .expect("get")
            .expect("block");
        assert!(record.fully_parsed);
    }
}

/// Memory store whose batches fail once they carry a block vertex.
#[derive(Default)]
struct BlockRejectingStore {
    inner: MemoryStore,
    rejected: AtomicU64,
}

impl KeyValueStore for BlockRejectingStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.inner.put(column, key, value)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.inner.delete(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.inner.scan_prefix(column, prefix)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<bool, StoreError> {
        self.inner.for_each_prefix(column, prefix, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let writes_block = batch.iter().any(|op| {
            matches!(
                op,
                WriteOp::Put {
                    column: Column::Block,
                    ..
                }
            )
        });
        if writes_block {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(StoreError::Backend("disk full".to_string()));
        }
        self.inner.write_batch(batch)
    }
}

#[test]
fn store_failure_mid_load_is_recorded_on_the_import_vertex() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_fork(dir.path());
    let store = Arc::new(BlockRejectingStore::default());
    let graph = GraphStore::open(Arc::clone(&store), GraphOptions::default()).expect("open graph");
    let settings = ImportSettings {
        strategy: IngestStrategy::Vertex,
        commit_every: 1,
        ..ImportSettings::default()
    };
    let scanner = FrameScanner::new(
        list_block_files(dir.path(), settings.files_from),
        magic(),
        settings.frame_ceiling(),
    );
    let outcome = ImportRun::new(graph.clone(), settings, Arc::new(ImportMetrics::new()))
        .execute(scanner, &decoder())
        .expect("import run");

    assert!(!outcome.succeeded());
    assert_eq!(outcome.record.status, "error: disk full");
    assert_eq!(store.rejected.load(Ordering::Relaxed), 1);
    assert_eq!(outcome.record.new_blocks, 0);
    assert_eq!(outcome.head, None);
    assert_eq!(outcome.tail, None);

    let stored: ImportRecord = graph
        .get_vertex(outcome.import_id)
        .expect("get")
        .expect("import vertex");
    assert!(stored.status.starts_with("error: "), "{}", stored.status);
    assert!(stored.end_time.is_some());
    assert!(stored.elapsed.is_some());
    assert_eq!(graph.count_of_type(VertexType::Block).expect("count"), 0);
    assert!(graph
        .out_edges(outcome.import_id, EdgeType::HeadBlock)
        .expect("head")
        .is_empty());
}

#[test]
fn rerun_skips_blocks_already_stored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fork = write_fork(dir.path());
    let graph = memory_graph();
    import(&graph, dir.path(), ImportSettings::default());
    let again = import(&graph, dir.path(), ImportSettings::default());

    assert!(again.succeeded());
    assert_eq!(again.record.parsed_blocks, 3);
    assert_eq!(again.record.new_blocks, 0);
    assert_eq!(again.record.new_transactions, 0);
    assert_eq!(again.load.as_ref().map(|load| load.existing_blocks), Some(3));
    assert_eq!(again.record.linked_blocks, 0);
    assert_eq!(again.head, Some(block_id(&graph, &fork.a)));
    assert_eq!(again.tail, Some(block_id(&graph, &fork.b)));
    assert_eq!(graph.count_of_type(VertexType::Block).expect("count"), 3);
    assert_eq!(graph.count_of_type(VertexType::Transaction).expect("count"), 3);
    assert_eq!(graph.count_of_type(VertexType::Import).expect("count"), 2);
}

#[test]
fn undecodable_frame_is_counted_and_skipped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let a = block(GENESIS_PREV_HASH, 100, 1);
    let b = block(hash_of(&a), 200, 2);
    write_blocks(dir.path(), 0, &[a, vec![0x55; 40], b]);

    let graph = memory_graph();
    let outcome = import(&graph, dir.path(), ImportSettings::default());
    assert!(outcome.succeeded());
    assert_eq!(outcome.record.decode_errors, 1);
    assert_eq!(outcome.record.parsed_blocks, 2);
    assert_eq!(outcome.record.linked_blocks, 1);
}

#[test]
fn block_limit_stops_the_load() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_fork(dir.path());
    let graph = memory_graph();
    let settings = ImportSettings {
        limit_blocks: 2,
        ..ImportSettings::default()
    };
    let outcome = import(&graph, dir.path(), settings);
    assert_eq!(outcome.load.as_ref().map(|load| load.stopped_by_limit), Some(true));
    assert_eq!(outcome.record.parsed_blocks, 2);
    assert_eq!(graph.count_of_type(VertexType::Block).expect("count"), 2);
}

#[test]
fn conversion_adds_address_vertices_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_fork(dir.path());
    let graph = memory_graph();
    import(&graph, dir.path(), ImportSettings::default());

    let converter = AddressConverter::new(graph.clone(), Arc::new(ImportMetrics::new()), 2);
    let outcome = converter.execute().expect("convert");
    assert_eq!(outcome.record.kind, "address conversion");
    assert_eq!(outcome.record.status, "completed");
    assert_eq!(outcome.record.new_addresses, 1);
    assert_eq!(outcome.summary.as_ref().map(|summary| summary.converted), Some(3));

    let address = graph
        .lookup_unique(UniqueIndex::AddressHash, payee_address().as_bytes())
        .expect("lookup")
        .expect("address vertex");
    assert_eq!(graph.in_edges(address, EdgeType::HasAddress).expect("edges").len(), 3);

    let again = AddressConverter::new(graph.clone(), Arc::new(ImportMetrics::new()), 2)
        .execute()
        .expect("convert again");
    let summary = again.summary.expect("summary");
    assert_eq!(summary.converted, 0);
    assert_eq!(summary.already_linked, 3);
    assert_eq!(graph.count_of_type(VertexType::Address).expect("count"), 1);
}

#[test]
fn datafile_scan_prints_matching_blocks_and_transactions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fork = write_fork(dir.path());
    let decoder = decoder();

    let mut filters = ScanFilters::default();
    filters
        .parse_arg(&format!("blocks={}", hash256_to_hex(&fork.a)))
        .expect("blocks filter");
    let mut out = Vec::new();
    let summary = DatafileScanner::new(&decoder, &filters)
        .run(FrameScanner::new(list_block_files(dir.path(), 0), magic(), 5_000_000), &mut out)
        .expect("scan");
    let text = String::from_utf8(out).expect("utf8");
    assert_eq!(summary.blocks, 3);
    assert_eq!(summary.matched_blocks, 3);
    assert_eq!(summary.matched_transactions, 0);
    assert!(text.contains(&format!("block {}", hash256_to_hex(&fork.b))));
    assert!(text.contains("  transactions: 1"));

    let mut filters = ScanFilters::default();
    filters
        .parse_arg(&format!("addresses={}", payee_address()))
        .expect("addresses filter");
    let mut out = Vec::new();
    let summary = DatafileScanner::new(&decoder, &filters)
        .run(FrameScanner::new(list_block_files(dir.path(), 0), magic(), 5_000_000), &mut out)
        .expect("scan");
    assert_eq!(summary.matched_blocks, 0);
    assert_eq!(summary.matched_transactions, 3);
    let text = String::from_utf8(out).expect("utf8");
    assert!(text.contains(&format!("in block {}", hash256_to_hex(&fork.c))));
}
