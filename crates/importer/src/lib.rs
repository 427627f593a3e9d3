//! Block file importer.
//!
//! A [`blockfiles::FrameScanner`] turns `blkNNNNN.dat` files into raw frames,
//! a [`decode::RecordDecoder`] turns each frame into a flat block record, the
//! [`load::LoadPass`] writes blocks, transactions, inputs, outputs and
//! addresses into the graph, and the [`link::LinkPass`] rebuilds chain order
//! with `PreviousBlock` edges. [`run::ImportRun`] ties the passes together
//! and persists an `Import` vertex for every invocation.

pub mod address;
pub mod blockfiles;
pub mod convert;
pub mod decode;
pub mod error;
pub mod link;
pub mod load;
pub mod metrics;
pub mod progress;
pub mod run;
pub mod scan;
pub mod settings;

pub use address::AddressResolver;
pub use blockfiles::{
    block_file_path, list_block_files, FileCompletion, FrameMark, FrameScanner, RawFrame,
    ScanCounters, ScanSnapshot,
};
pub use convert::{AddressConverter, ConversionOutcome, ConversionSummary};
pub use decode::{BitcoinDecoder, DecodedBlock, DecodedTransaction, RecordDecoder};
pub use error::ImportError;
pub use link::{safe_tail, walk_back, LinkPass, LinkSummary};
pub use load::{LoadPass, LoadSummary};
pub use metrics::{BlockRef, BlockTally, ChainEnds, ImportMetrics, MetricsSnapshot};
pub use progress::{file_completion_logger, format_status, StatusSample};
pub use run::{ImportRun, RunOutcome};
pub use scan::{DatafileScanner, ScanSummary};
pub use settings::{ImportSettings, IngestStrategy, ScanFilters};
