//! Import run counters.
//!
//! One instance per run, shared by the producer, the writer workers and the
//! progress task. Counters are relaxed atomics. Per-block write counts are
//! gathered in a [`BlockTally`] and folded in only once the block's unit of
//! work has committed. The unresolved-predecessor ledger and the head/tail
//! candidates sit behind mutexes.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use blkgraph_consensus::{Hash256, GENESIS_PREV_HASH};
use blkgraph_graph::VertexId;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockRef {
    pub id: VertexId,
    pub hash: Hash256,
    pub time: u32,
    /// Position of the block in decode order.
    pub seq: u64,
}

/// Head and tail candidates seen so far.
///
/// Head: the genesis child decoded last. Tail: the block with the greatest
/// timestamp, the one decoded later winning ties. Blocks may be reported out
/// of decode order, so ties are settled by `seq`. Neither is checked for
/// uniqueness.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ChainEnds {
    pub head: Option<BlockRef>,
    pub tail: Option<BlockRef>,
}

impl ChainEnds {
    pub fn observe(&mut self, block: BlockRef, prev_hash: &Hash256) {
        if *prev_hash == GENESIS_PREV_HASH
            && self.head.map_or(true, |head| block.seq >= head.seq)
        {
            self.head = Some(block);
        }
        if self
            .tail
            .map_or(true, |tail| (block.time, block.seq) >= (tail.time, tail.seq))
        {
            self.tail = Some(block);
        }
    }
}

/// What one block wrote, counted while its unit of work is applied.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockTally {
    pub new_transactions: u64,
    pub reused_transactions: u64,
    pub new_inputs: u64,
    pub new_outputs: u64,
    pub new_addresses: u64,
    pub address_edges: u64,
}

#[derive(Debug, Default)]
pub struct ImportMetrics {
    parsed_blocks: AtomicU64,
    parsed_transactions: AtomicU64,
    new_blocks: AtomicU64,
    new_transactions: AtomicU64,
    new_inputs: AtomicU64,
    new_outputs: AtomicU64,
    new_addresses: AtomicU64,
    address_edges: AtomicU64,
    existing_blocks: AtomicU64,
    reused_transactions: AtomicU64,
    decode_errors: AtomicU64,
    write_errors: AtomicU64,
    link_scanned: AtomicU64,
    link_ok: AtomicU64,
    link_missing: AtomicU64,
    link_skipped: AtomicU64,
    not_found: Mutex<BTreeSet<(Hash256, Hash256)>>,
    ends: Mutex<ChainEnds>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MetricsSnapshot {
    pub parsed_blocks: u64,
    pub parsed_transactions: u64,
    pub new_blocks: u64,
    pub new_transactions: u64,
    pub new_inputs: u64,
    pub new_outputs: u64,
    pub new_addresses: u64,
    pub address_edges: u64,
    pub existing_blocks: u64,
    pub reused_transactions: u64,
    pub decode_errors: u64,
    pub write_errors: u64,
    pub link_scanned: u64,
    pub link_ok: u64,
    pub link_missing: u64,
    pub link_skipped: u64,
    pub hash_not_found: u64,
}

impl ImportMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the running total including this block.
    pub fn record_parsed_block(&self) -> u64 {
        self.parsed_blocks.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_parsed_transaction(&self) -> u64 {
        self.parsed_transactions.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_parsed_transactions(&self, count: u64) {
        self.parsed_transactions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_new_block(&self) {
        self.new_blocks.fetch_add(1, Ordering::Relaxed);
    }

    /// Folds in the writes of a committed block.
    pub fn record_tally(&self, tally: &BlockTally) {
        self.new_transactions
            .fetch_add(tally.new_transactions, Ordering::Relaxed);
        self.reused_transactions
            .fetch_add(tally.reused_transactions, Ordering::Relaxed);
        self.new_inputs.fetch_add(tally.new_inputs, Ordering::Relaxed);
        self.new_outputs.fetch_add(tally.new_outputs, Ordering::Relaxed);
        self.new_addresses
            .fetch_add(tally.new_addresses, Ordering::Relaxed);
        self.address_edges
            .fetch_add(tally.address_edges, Ordering::Relaxed);
    }

    pub fn record_new_address(&self) {
        self.new_addresses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_address_edge(&self) {
        self.address_edges.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_existing_block(&self) {
        self.existing_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_link_scanned(&self) -> u64 {
        self.link_scanned.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_link_ok(&self) {
        self.link_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_link_skipped(&self) {
        self.link_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Notes that `block`'s predecessor `prev` is not in the store.
    pub fn record_missing_predecessor(&self, prev: Hash256, block: Hash256) {
        self.link_missing.fetch_add(1, Ordering::Relaxed);
        self.not_found
            .lock()
            .expect("metrics ledger lock")
            .insert((prev, block));
    }

    pub fn observe_block(&self, block: BlockRef, prev_hash: &Hash256) {
        self.ends
            .lock()
            .expect("metrics ends lock")
            .observe(block, prev_hash);
    }

    pub fn chain_ends(&self) -> ChainEnds {
        *self.ends.lock().expect("metrics ends lock")
    }

    pub fn new_blocks(&self) -> u64 {
        self.new_blocks.load(Ordering::Relaxed)
    }

    pub fn new_transactions(&self) -> u64 {
        self.new_transactions.load(Ordering::Relaxed)
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }

    /// `(missing predecessor, block that references it)` pairs, sorted.
    pub fn not_found(&self) -> Vec<(Hash256, Hash256)> {
        self.not_found
            .lock()
            .expect("metrics ledger lock")
            .iter()
            .copied()
            .collect()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            parsed_blocks: self.parsed_blocks.load(Ordering::Relaxed),
            parsed_transactions: self.parsed_transactions.load(Ordering::Relaxed),
            new_blocks: self.new_blocks.load(Ordering::Relaxed),
            new_transactions: self.new_transactions.load(Ordering::Relaxed),
            new_inputs: self.new_inputs.load(Ordering::Relaxed),
            new_outputs: self.new_outputs.load(Ordering::Relaxed),
            new_addresses: self.new_addresses.load(Ordering::Relaxed),
            address_edges: self.address_edges.load(Ordering::Relaxed),
            existing_blocks: self.existing_blocks.load(Ordering::Relaxed),
            reused_transactions: self.reused_transactions.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            link_scanned: self.link_scanned.load(Ordering::Relaxed),
            link_ok: self.link_ok.load(Ordering::Relaxed),
            link_missing: self.link_missing.load(Ordering::Relaxed),
            link_skipped: self.link_skipped.load(Ordering::Relaxed),
            hash_not_found: self.not_found.lock().expect("metrics ledger lock").len() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_deduplicates_pairs() {
        let metrics = ImportMetrics::new();
        metrics.record_missing_predecessor([1u8; 32], [2u8; 32]);
        metrics.record_missing_predecessor([1u8; 32], [2u8; 32]);
        metrics.record_missing_predecessor([1u8; 32], [3u8; 32]);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.link_missing, 3);
        assert_eq!(snapshot.hash_not_found, 2);
        assert_eq!(metrics.not_found()[0], ([1u8; 32], [2u8; 32]));
    }

    #[test]
    fn running_totals_include_current_item() {
        let metrics = ImportMetrics::new();
        assert_eq!(metrics.record_parsed_block(), 1);
        assert_eq!(metrics.record_parsed_block(), 2);
        metrics.record_parsed_transactions(3);
        assert_eq!(metrics.record_parsed_transaction(), 4);
    }

    #[test]
    fn tallies_add_up() {
        let metrics = ImportMetrics::new();
        let tally = BlockTally {
            new_transactions: 2,
            reused_transactions: 1,
            new_inputs: 3,
            new_outputs: 4,
            new_addresses: 1,
            address_edges: 5,
        };
        metrics.record_tally(&tally);
        metrics.record_tally(&tally);
        let snapshot = metrics.snapshot();
        assert_eq!(metrics.new_transactions(), 4);
        assert_eq!(snapshot.reused_transactions, 2);
        assert_eq!(snapshot.new_inputs, 6);
        assert_eq!(snapshot.new_outputs, 8);
        assert_eq!(snapshot.new_addresses, 2);
        assert_eq!(snapshot.address_edges, 10);
    }

    fn block_ref(id: u64, time: u32) -> BlockRef {
        BlockRef {
            id: VertexId::new(blkgraph_graph::VertexType::Block, id),
            hash: [id as u8; 32],
            time,
            seq: id,
        }
    }

    #[test]
    fn head_is_last_genesis_child_and_tail_is_last_max_time() {
        let metrics = ImportMetrics::new();
        metrics.observe_block(block_ref(1, 100), &GENESIS_PREV_HASH);
        metrics.observe_block(block_ref(2, 200), &[1u8; 32]);
        metrics.observe_block(block_ref(3, 150), &[1u8; 32]);
        let ends = metrics.chain_ends();
        assert_eq!(ends.head.map(|b| b.id.id), Some(1));
        assert_eq!(ends.tail.map(|b| b.id.id), Some(2));

        metrics.observe_block(block_ref(4, 200), &GENESIS_PREV_HASH);
        let ends = metrics.chain_ends();
        assert_eq!(ends.head.map(|b| b.id.id), Some(4));
        assert_eq!(ends.tail.map(|b| b.id.id), Some(4));
    }

    #[test]
    fn late_reports_do_not_override_later_decoded_ends() {
        let mut ends = ChainEnds::default();
        ends.observe(block_ref(5, 300), &GENESIS_PREV_HASH);
        ends.observe(block_ref(3, 300), &GENESIS_PREV_HASH);
        assert_eq!(ends.head.map(|b| b.id.id), Some(5));
        assert_eq!(ends.tail.map(|b| b.id.id), Some(5));

        ends.observe(block_ref(2, 301), &[1u8; 32]);
        assert_eq!(ends.tail.map(|b| b.id.id), Some(2));
    }
}
