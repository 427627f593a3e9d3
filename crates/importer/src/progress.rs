//! Human-readable progress lines.

use std::path::Path;
use std::time::Duration;

use blkgraph_consensus::hash256_to_hex;
use blkgraph_log::format_unix_secs;

use crate::blockfiles::{FileCompletion, FrameMark, ScanSnapshot};
use crate::decode::peek_header;
use crate::metrics::MetricsSnapshot;

#[derive(Clone, Copy, Debug)]
pub struct StatusSample {
    pub elapsed: Duration,
    pub scan: ScanSnapshot,
    pub metrics: MetricsSnapshot,
    pub expected_total_blocks: u64,
}

/// One status line: throughput, file position and a completion estimate
/// based on how many block files have been opened.
pub fn format_status(operation: &str, sample: &StatusSample) -> String {
    let secs = sample.elapsed.as_secs().max(1);
    let txs = sample.metrics.parsed_transactions;
    let blocks = sample.metrics.parsed_blocks;
    let files_total = sample.scan.files_total;
    let current = sample.scan.files_opened;
    let bytes = sample.scan.parsed_bytes;
    let progress = if files_total == 0 {
        0.0
    } else {
        current as f64 * 100.0 / files_total as f64
    };
    let remaining_minutes = if current == 0 {
        0
    } else {
        let estimated = secs.saturating_mul(files_total) / current;
        estimated.saturating_sub(secs) / 60 + 1
    };
    format!(
        "- {operation} {} txs ({} txs/sec) {} new addresses {} addresses links {} blocks of ~{} ({} blocks/sec) {}/{} data file parsed {} ({:.2} MB/sec) {} secs elapsed progress={:.2}% remaining {} minutes",
        group_thousands(txs),
        group_thousands(txs / secs),
        group_thousands(sample.metrics.new_addresses),
        group_thousands(sample.metrics.address_edges),
        group_thousands(blocks),
        group_thousands(sample.expected_total_blocks),
        group_thousands(blocks / secs),
        group_thousands(current),
        group_thousands(files_total),
        format_size(bytes),
        bytes as f64 / secs as f64 / 1024.0 / 1024.0,
        group_thousands(secs),
        progress,
        group_thousands(remaining_minutes),
    )
}

pub fn format_conversion_status(converted: u64, elapsed: Duration) -> String {
    let secs = elapsed.as_secs().max(1);
    format!(
        "- converted {} addresses ({}/sec) {} secs elapsed",
        group_thousands(converted),
        group_thousands(converted / secs),
        group_thousands(secs)
    )
}

/// `finished file <path> blocks <first> - <last>` for a file the scanner is
/// done with, each block shown as its hash and timestamp.
pub fn format_file_completion(path: &Path, first: Option<&FrameMark>, last: Option<&FrameMark>) -> String {
    format!(
        "- finished file {} blocks {} - {}",
        path.display(),
        describe_mark(first),
        describe_mark(last)
    )
}

/// Completion callback that logs [`format_file_completion`] lines.
pub fn file_completion_logger() -> FileCompletion {
    Box::new(|path, first, last| {
        blkgraph_log::log_info!("{}", format_file_completion(path, first, last));
    })
}

fn describe_mark(mark: Option<&FrameMark>) -> String {
    let Some(mark) = mark else {
        return "none".to_string();
    };
    match peek_header(&mark.head) {
        Some(header) => format!(
            "{} ({})",
            hash256_to_hex(&header.hash()),
            format_unix_secs(u64::from(header.time))
        ),
        None => format!("<undecodable at {}>", mark.offset),
    }
}

pub fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, ch) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes}b");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2}{}", UNITS[unit])
}
