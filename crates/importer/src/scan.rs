//! Read-only datafile scanner for debugging block files without a store.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Instant;

use blkgraph_consensus::hash256_to_hex;
use blkgraph_log::format_unix_secs;

use crate::blockfiles::{RawFrame, ScanCounters};
use crate::decode::{DecodedBlock, DecodedTransaction, RecordDecoder};
use crate::metrics::ImportMetrics;
use crate::progress::{format_status, StatusSample};
use crate::settings::ScanFilters;

pub const SCAN_PROGRESS_EVERY: u64 = 10_000_000;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ScanSummary {
    pub frames: u64,
    pub blocks: u64,
    pub transactions: u64,
    pub decode_errors: u64,
    pub matched_blocks: u64,
    pub matched_transactions: u64,
}

pub struct DatafileScanner<'a, D: ?Sized> {
    decoder: &'a D,
    filters: &'a ScanFilters,
    counters: Option<Arc<ScanCounters>>,
    expected_total_blocks: u64,
}

impl<'a, D: RecordDecoder + ?Sized> DatafileScanner<'a, D> {
    pub fn new(decoder: &'a D, filters: &'a ScanFilters) -> Self {
        Self {
            decoder,
            filters,
            counters: None,
            expected_total_blocks: 0,
        }
    }

    /// File counters of the frame source, used for progress lines.
    pub fn with_progress(mut self, counters: Arc<ScanCounters>, expected_total_blocks: u64) -> Self {
        self.counters = Some(counters);
        self.expected_total_blocks = expected_total_blocks;
        self
    }

    /// Decodes every frame and writes the matching blocks and transactions
    /// to `out`.
    pub fn run<I, W>(&self, frames: I, out: &mut W) -> io::Result<ScanSummary>
    where
        I: IntoIterator<Item = RawFrame>,
        W: Write + ?Sized,
    {
        let started = Instant::now();
        let metrics = ImportMetrics::new();
        let mut summary = ScanSummary::default();

        for frame in frames {
            summary.frames += 1;
            let block = match self.decoder.decode(&frame.payload) {
                Ok(block) => block,
                Err(err) => {
                    summary.decode_errors += 1;
                    metrics.record_decode_error();
                    blkgraph_log::log_debug!(
                        "undecodable frame at {}:{}: {err}",
                        frame.source_file.display(),
                        frame.byte_offset
                    );
                    continue;
                }
            };
            summary.blocks += 1;
            metrics.record_parsed_block();

            if self.filters.blocks.contains(&block.hash)
                || self.filters.blocks.contains(&block.header.prev_block)
            {
                summary.matched_blocks += 1;
                write_block_summary(out, &block)?;
            }

            for tx in &block.transactions {
                summary.transactions += 1;
                let parsed = metrics.record_parsed_transaction();
                if self.filters.wants_transactions() && self.matches(tx) {
                    summary.matched_transactions += 1;
                    writeln!(out, "in block {}", hash256_to_hex(&block.hash))?;
                    write_transaction(out, tx)?;
                }
                if parsed % SCAN_PROGRESS_EVERY == 0 {
                    if let Some(counters) = &self.counters {
                        let sample = StatusSample {
                            elapsed: started.elapsed(),
                            scan: counters.snapshot(),
                            metrics: metrics.snapshot(),
                            expected_total_blocks: self.expected_total_blocks,
                        };
                        blkgraph_log::log_info!("{}", format_status("scanned", &sample));
                    }
                }
            }
        }
        out.flush()?;
        Ok(summary)
    }

    fn matches(&self, tx: &DecodedTransaction) -> bool {
        if self.filters.txs.contains(&tx.txid) {
            return true;
        }
        if self.filters.addresses.is_empty() {
            return false;
        }
        let wanted = |address: &Option<String>| {
            address
                .as_ref()
                .is_some_and(|address| self.filters.addresses.contains(address))
        };
        tx.inputs.iter().any(|input| wanted(&input.address))
            || tx.outputs.iter().any(|output| wanted(&output.address))
    }
}

/// Header fields and transaction count, without transaction detail.
pub fn write_block_summary<W: Write + ?Sized>(out: &mut W, block: &DecodedBlock) -> io::Result<()> {
    let header = &block.header;
    writeln!(out, "block {}", hash256_to_hex(&block.hash))?;
    writeln!(out, "  version: {}", header.version)?;
    writeln!(out, "  previous block: {}", hash256_to_hex(&header.prev_block))?;
    writeln!(out, "  merkle root: {}", hash256_to_hex(&header.merkle_root))?;
    writeln!(
        out,
        "  time: {} ({})",
        header.time,
        format_unix_secs(u64::from(header.time))
    )?;
    writeln!(out, "  difficulty target: {:#010x}", header.bits)?;
    writeln!(out, "  nonce: {}", header.nonce)?;
    writeln!(out, "  size: {}", block.size)?;
    writeln!(out, "  transactions: {}", block.transactions.len())
}

pub fn write_transaction<W: Write + ?Sized>(out: &mut W, tx: &DecodedTransaction) -> io::Result<()> {
    writeln!(
        out,
        "tx {}{}",
        hash256_to_hex(&tx.txid),
        if tx.coinbase { " (coinbase)" } else { "" }
    )?;
    writeln!(out, "  version: {} lock time: {}", tx.version, tx.lock_time)?;
    for input in &tx.inputs {
        if input.coinbase {
            writeln!(out, "  in  #{} coinbase", input.index)?;
            continue;
        }
        writeln!(
            out,
            "  in  #{} {}:{} {}",
            input.index,
            hash256_to_hex(&input.prev_txid),
            input.prev_index,
            input.address.as_deref().unwrap_or("-")
        )?;
    }
    for output in &tx.outputs {
        writeln!(
            out,
            "  out #{} {} {}",
            output.index,
            output.value,
            output.address.as_deref().unwrap_or("-")
        )?;
    }
    Ok(())
}
