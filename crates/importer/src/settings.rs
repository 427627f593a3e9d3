use std::collections::HashSet;

use blkgraph_consensus::{hash256_from_hex, Hash256, Network, MAX_BLOCK_SIZE, MAX_FRAME_SIZE_FACTOR};
use blkgraph_graph::WriterOptions;
use serde::Serialize;

use crate::error::ImportError;

/// How addresses referenced by inputs and outputs are stored.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStrategy {
    /// The address string is an attribute of the input/output vertex. Writes
    /// go through the asynchronous writer; there is no shared vertex to race on.
    #[default]
    Attribute,
    /// One `Address` vertex per hash, linked with `HasAddress`. Writes run in
    /// a single synchronous transaction so address upserts and their edges
    /// stay serialized.
    Vertex,
}

impl IngestStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            IngestStrategy::Attribute => "attribute",
            IngestStrategy::Vertex => "vertex",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ImportSettings {
    #[serde(serialize_with = "serialize_network")]
    pub network: Network,
    pub strategy: IngestStrategy,
    /// Jobs per writer commit, or transactions per commit in vertex mode.
    pub commit_every: usize,
    /// 0 sizes the writer pool to the available parallelism.
    pub parallel_workers: usize,
    pub queue_depth: usize,
    pub safe_blocks_from_tail: usize,
    /// Only used to estimate progress.
    pub expected_total_blocks: u64,
    /// 0 means unlimited.
    pub limit_blocks: u64,
    /// 0 means unlimited.
    pub limit_transactions: u64,
    pub files_from: u32,
    pub max_frame_size: u32,
    pub verbose: u8,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            strategy: IngestStrategy::Attribute,
            commit_every: 100,
            parallel_workers: 0,
            queue_depth: 1024,
            safe_blocks_from_tail: 6,
            expected_total_blocks: 700_000,
            limit_blocks: 0,
            limit_transactions: 0,
            files_from: 0,
            max_frame_size: MAX_BLOCK_SIZE,
            verbose: 1,
        }
    }
}

impl ImportSettings {
    /// Declared frame lengths above this are treated as corrupt.
    pub fn frame_ceiling(&self) -> u64 {
        u64::from(self.max_frame_size) * u64::from(MAX_FRAME_SIZE_FACTOR)
    }

    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            workers: self.parallel_workers,
            commit_every: self.commit_every.max(1),
            queue_depth: self.queue_depth.max(1),
        }
    }

    pub fn validate(&self) -> Result<(), ImportError> {
        if self.commit_every == 0 {
            return Err(ImportError::InvalidSetting(
                "commit-every must be at least 1".to_string(),
            ));
        }
        if self.max_frame_size == 0 {
            return Err(ImportError::InvalidSetting(
                "max-frame-size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn serialize_network<S: serde::Serializer>(network: &Network, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(network.as_str())
}

/// Positional `key=value[,value...]` filters of the datafile scanner.
#[derive(Clone, Debug, Default)]
pub struct ScanFilters {
    pub files_from: u32,
    pub blocks: HashSet<Hash256>,
    pub txs: HashSet<Hash256>,
    pub addresses: HashSet<String>,
}

impl ScanFilters {
    pub fn parse_arg(&mut self, arg: &str) -> Result<(), ImportError> {
        let Some((key, value)) = arg.split_once('=') else {
            return Err(ImportError::InvalidSetting(format!(
                "expected key=value, got '{arg}'"
            )));
        };
        let parts = value.split(',').map(str::trim).filter(|part| !part.is_empty());
        match key.trim() {
            "filesFrom" => {
                self.files_from = value.trim().parse().map_err(|_| {
                    ImportError::InvalidSetting(format!("invalid filesFrom '{value}'"))
                })?;
            }
            "blocks" => {
                for part in parts {
                    self.blocks.insert(parse_hash(part)?);
                }
            }
            "txs" => {
                for part in parts {
                    self.txs.insert(parse_hash(part)?);
                }
            }
            "addresses" => {
                self.addresses.extend(parts.map(str::to_string));
            }
            other => {
                return Err(ImportError::InvalidSetting(format!(
                    "unknown filter '{other}'"
                )))
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.txs.is_empty() && self.addresses.is_empty()
    }

    pub fn wants_transactions(&self) -> bool {
        !self.txs.is_empty() || !self.addresses.is_empty()
    }
}

fn parse_hash(raw: &str) -> Result<Hash256, ImportError> {
    hash256_from_hex(raw).map_err(|err| ImportError::InvalidSetting(format!("'{raw}': {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = ImportSettings::default();
        assert_eq!(settings.commit_every, 100);
        assert_eq!(settings.safe_blocks_from_tail, 6);
        assert_eq!(settings.expected_total_blocks, 700_000);
        assert_eq!(settings.strategy, IngestStrategy::Attribute);
        assert_eq!(settings.frame_ceiling(), 5_000_000);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn parses_scan_filters() {
        let mut filters = ScanFilters::default();
        assert!(filters.is_empty());
        filters.parse_arg("filesFrom=12").expect("filesFrom");
        filters
            .parse_arg("blocks=00000000000000000000000000000000000000000000000000000000000000ff,0x01")
            .expect("blocks");
        filters.parse_arg("addresses=1abc, 1def,").expect("addresses");
        assert_eq!(filters.files_from, 12);
        assert_eq!(filters.blocks.len(), 2);
        assert!(filters.addresses.contains("1def"));
        assert!(filters.wants_transactions());
        assert!(filters.parse_arg("colour=red").is_err());
        assert!(filters.parse_arg("blocks").is_err());
        assert!(filters.parse_arg("txs=zz").is_err());
    }
}
