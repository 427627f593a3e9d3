use blkgraph_log as logging;

mod store;

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use blkgraph_consensus::{chain_params, Network};
use blkgraph_graph::{FlushMode, GraphOptions, GraphStore};
use blkgraph_importer::blockfiles::{list_block_files, FrameScanner, ScanCounters};
use blkgraph_importer::convert::AddressConverter;
use blkgraph_importer::decode::BitcoinDecoder;
use blkgraph_importer::error::ImportError;
use blkgraph_importer::metrics::ImportMetrics;
use blkgraph_importer::progress::{file_completion_logger, format_status, StatusSample};
use blkgraph_importer::run::ImportRun;
use blkgraph_importer::scan::DatafileScanner;
use blkgraph_importer::settings::{ImportSettings, IngestStrategy, ScanFilters};
use blkgraph_log::{log_debug, log_info, log_warn};
use tokio::sync::watch;

use crate::store::{lock_data_dir, open_store, Backend, DataDirLock, Store};

const DEFAULT_DATA_DIR: &str = "./data";
const GRAPH_DIR_NAME: &str = "graph";
const DEFAULT_STATUS_INTERVAL_SECS: u64 = 5;

#[derive(Clone, Debug)]
enum Command {
    Import { blocks_dir: PathBuf },
    Scan { blocks_dir: PathBuf, filters: ScanFilters },
    ConvertAddresses,
}

#[derive(Clone, Debug)]
struct Config {
    command: Command,
    backend: Backend,
    data_dir: PathBuf,
    drop_existing: bool,
    graph: GraphOptions,
    settings: ImportSettings,
    status_interval: Duration,
    db_cache_mb: Option<u64>,
    log_level: logging::Level,
    log_format: logging::Format,
    log_timestamps: bool,
}

#[derive(Debug)]
enum CliAction {
    PrintHelp,
    PrintVersion,
    Run(Box<Config>),
}

pub async fn run_entry() -> Result<(), String> {
    match parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("blkgraph {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => run_with_config(*config).await,
    }
}

async fn run_with_config(config: Config) -> Result<(), String> {
    logging::init(logging::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: config.log_timestamps,
    });

    match config.command.clone() {
        Command::Import { blocks_dir } => run_import(&config, blocks_dir).await,
        Command::Scan {
            blocks_dir,
            filters,
        } => run_scan(&config, blocks_dir, filters).await,
        Command::ConvertAddresses => run_convert(&config).await,
    }
}

fn open_graph(config: &Config) -> Result<(GraphStore<Store>, Option<DataDirLock>), String> {
    let lock = match config.backend {
        Backend::Memory => None,
        Backend::Fjall => {
            fs::create_dir_all(&config.data_dir).map_err(|err| {
                format!("failed to create data dir {}: {err}", config.data_dir.display())
            })?;
            Some(lock_data_dir(&config.data_dir)?)
        }
    };
    let db_path = config.data_dir.join(GRAPH_DIR_NAME);
    if config.drop_existing && db_path.exists() {
        log_warn!("dropping existing graph at {}", db_path.display());
        fs::remove_dir_all(&db_path)
            .map_err(|err| format!("failed to remove {}: {err}", db_path.display()))?;
    }
    let store = open_store(config.backend, &db_path, config.db_cache_mb)?;
    let graph = GraphStore::open(store, config.graph).map_err(|err| err.to_string())?;
    log_info!(
        "graph store {} opened (wal {}, flush {})",
        db_path.display(),
        if config.graph.use_wal { "on" } else { "off" },
        config.graph.flush.as_str()
    );
    Ok((graph, lock))
}

async fn run_import(config: &Config, blocks_dir: PathBuf) -> Result<(), String> {
    let settings = config.settings.clone();
    settings.validate().map_err(|err| err.to_string())?;
    let files = list_block_files(&blocks_dir, settings.files_from);
    if files.is_empty() {
        return Err(ImportError::NoBlockFiles(blocks_dir).to_string());
    }
    let (graph, _lock) = open_graph(config)?;
    log_info!(
        "importing {} block files from {}",
        files.len(),
        blocks_dir.display()
    );
    match serde_json::to_string(&settings) {
        Ok(json) => log_info!("settings {json}"),
        Err(err) => log_warn!("cannot render settings: {err}"),
    }

    let params = chain_params(settings.network);
    let mut scanner = FrameScanner::new(files, params.message_start, settings.frame_ceiling());
    if settings.verbose > 1 {
        scanner = scanner.with_file_completion(file_completion_logger());
    }
    let metrics = Arc::new(ImportMetrics::new());
    let progress = ProgressTask::spawn(
        "imported",
        scanner.counters(),
        Arc::clone(&metrics),
        settings.expected_total_blocks,
        config.status_interval,
    );

    let store_graph = graph.clone();
    let run = ImportRun::new(graph, settings, metrics);
    let outcome = tokio::task::spawn_blocking(move || {
        run.execute(scanner, &BitcoinDecoder::new(params))
    })
    .await
    .map_err(|err| format!("import task failed: {err}"))?
    .map_err(|err| err.to_string())?;
    drop(progress);

    if let Some(telemetry) = store_graph.store().fjall_telemetry_snapshot() {
        log_debug!(
            "fjall write buffer {} bytes, {} journals, {} flushes completed",
            telemetry.write_buffer_bytes,
            telemetry.journal_count,
            telemetry.flushes_completed
        );
    }

    print!("{}", outcome.report());
    let _ = io::stdout().flush();
    if !outcome.succeeded() {
        return Err(format!("import finished with status: {}", outcome.record.status));
    }
    Ok(())
}

async fn run_scan(config: &Config, blocks_dir: PathBuf, filters: ScanFilters) -> Result<(), String> {
    let files = list_block_files(&blocks_dir, filters.files_from);
    if files.is_empty() {
        return Err(ImportError::NoBlockFiles(blocks_dir).to_string());
    }
    if filters.is_empty() {
        log_warn!("no blocks, txs or addresses filter given; counting only");
    }
    let settings = config.settings.clone();
    let params = chain_params(settings.network);
    let scanner = FrameScanner::new(files, params.message_start, settings.frame_ceiling());
    let counters = scanner.counters();

    let summary = tokio::task::spawn_blocking(move || {
        let decoder = BitcoinDecoder::new(params);
        let stdout = io::stdout();
        let mut out = stdout.lock();
        DatafileScanner::new(&decoder, &filters)
            .with_progress(counters, settings.expected_total_blocks)
            .run(scanner, &mut out)
    })
    .await
    .map_err(|err| format!("scan task failed: {err}"))?
    .map_err(|err| format!("scan output failed: {err}"))?;

    log_info!(
        "scanned {} frames: {} blocks, {} transactions, {} undecodable; matched {} blocks and {} transactions",
        summary.frames,
        summary.blocks,
        summary.transactions,
        summary.decode_errors,
        summary.matched_blocks,
        summary.matched_transactions
    );
    Ok(())
}

async fn run_convert(config: &Config) -> Result<(), String> {
    let (graph, _lock) = open_graph(config)?;
    let converter = AddressConverter::new(
        graph,
        Arc::new(ImportMetrics::new()),
        config.settings.commit_every,
    );
    let outcome = tokio::task::spawn_blocking(move || converter.execute())
        .await
        .map_err(|err| format!("conversion task failed: {err}"))?
        .map_err(|err| err.to_string())?;

    println!("Conversion results:");
    println!("{}", outcome.record.to_pretty_json());
    if outcome.record.status != blkgraph_importer::run::STATUS_COMPLETED {
        return Err(format!(
            "address conversion finished with status: {}",
            outcome.record.status
        ));
    }
    Ok(())
}

/// Periodic progress line for the lifetime of the guard.
struct ProgressTask {
    shutdown_tx: watch::Sender<bool>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl ProgressTask {
    fn spawn(
        operation: &'static str,
        counters: Arc<ScanCounters>,
        metrics: Arc<ImportMetrics>,
        expected_total_blocks: u64,
        interval: Duration,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let started = Instant::now();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let sample = StatusSample {
                            elapsed: started.elapsed(),
                            scan: counters.snapshot(),
                            metrics: metrics.snapshot(),
                            expected_total_blocks,
                        };
                        log_info!("{}", format_status(operation, &sample));
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        Self {
            shutdown_tx,
            handle: Some(handle),
        }
    }
}

impl Drop for ProgressTask {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

fn next_value<I>(args: &mut I, flag: &str) -> Result<String, String>
where
    I: Iterator<Item = String>,
{
    args.next()
        .ok_or_else(|| format!("missing value for {flag}\n{}", usage()))
}

fn parse_number<T: FromStr>(flag: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("invalid value '{value}' for {flag}\n{}", usage()))
}

fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut args = raw_args.into_iter().peekable();
    let command = match args.next() {
        None => return Ok(CliAction::PrintHelp),
        Some(command) => command,
    };
    match command.as_str() {
        "help" | "--help" | "-h" => return Ok(CliAction::PrintHelp),
        "version" | "--version" | "-V" => return Ok(CliAction::PrintVersion),
        "import" | "scan" | "convert-addresses" => {}
        other => return Err(format!("unknown command '{other}'\n{}", usage())),
    }

    let mut backend = Backend::Fjall;
    let mut data_dir = PathBuf::from(DEFAULT_DATA_DIR);
    let mut drop_existing = false;
    let mut graph = GraphOptions::default();
    let mut settings = ImportSettings::default();
    let mut status_interval_secs = DEFAULT_STATUS_INTERVAL_SECS;
    let mut db_cache_mb: Option<u64> = None;
    let mut log_level: Option<logging::Level> = None;
    let mut log_format = logging::Format::Text;
    let mut log_timestamps = true;
    let mut positionals: Vec<String> = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            "--backend" => {
                let value = next_value(&mut args, "--backend")?;
                backend = Backend::parse(&value)
                    .ok_or_else(|| format!("invalid backend '{value}'\n{}", usage()))?;
            }
            "--data-dir" => {
                data_dir = PathBuf::from(next_value(&mut args, "--data-dir")?);
            }
            "--network" => {
                let value = next_value(&mut args, "--network")?;
                settings.network = Network::parse(&value)
                    .ok_or_else(|| format!("invalid network '{value}'\n{}", usage()))?;
            }
            "--drop-existing" => drop_existing = true,
            "--address-as-vertex" => settings.strategy = IngestStrategy::Vertex,
            "--commit-every" => {
                let value = next_value(&mut args, "--commit-every")?;
                settings.commit_every = parse_number("--commit-every", &value)?;
            }
            "--parallel" => {
                let value = next_value(&mut args, "--parallel")?;
                settings.parallel_workers = parse_number("--parallel", &value)?;
            }
            "--queue-depth" => {
                let value = next_value(&mut args, "--queue-depth")?;
                settings.queue_depth = parse_number("--queue-depth", &value)?;
            }
            "--safe-blocks" => {
                let value = next_value(&mut args, "--safe-blocks")?;
                settings.safe_blocks_from_tail = parse_number("--safe-blocks", &value)?;
            }
            "--expected-blocks" => {
                let value = next_value(&mut args, "--expected-blocks")?;
                settings.expected_total_blocks = parse_number("--expected-blocks", &value)?;
            }
            "--limit-blocks" => {
                let value = next_value(&mut args, "--limit-blocks")?;
                settings.limit_blocks = parse_number("--limit-blocks", &value)?;
            }
            "--limit-txs" => {
                let value = next_value(&mut args, "--limit-txs")?;
                settings.limit_transactions = parse_number("--limit-txs", &value)?;
            }
            "--max-frame-size" => {
                let value = next_value(&mut args, "--max-frame-size")?;
                settings.max_frame_size = parse_number("--max-frame-size", &value)?;
            }
            "--verbose" => {
                let value = next_value(&mut args, "--verbose")?;
                settings.verbose = parse_number("--verbose", &value)?;
            }
            "--use-wal" => graph.use_wal = true,
            "--flush" => {
                let value = next_value(&mut args, "--flush")?;
                graph.flush = FlushMode::parse(&value).ok_or_else(|| {
                    format!("invalid flush mode '{value}' (expected none|data|full)\n{}", usage())
                })?;
            }
            "--status-interval" => {
                let value = next_value(&mut args, "--status-interval")?;
                status_interval_secs = parse_number("--status-interval", &value)?;
                if status_interval_secs == 0 {
                    return Err(format!("--status-interval must be at least 1\n{}", usage()));
                }
            }
            "--db-cache-mb" => {
                let value = next_value(&mut args, "--db-cache-mb")?;
                db_cache_mb = Some(parse_number("--db-cache-mb", &value)?);
            }
            "--log-level" => {
                let value = next_value(&mut args, "--log-level")?;
                log_level = Some(
                    logging::Level::parse(&value)
                        .ok_or_else(|| format!("invalid log level '{value}'\n{}", usage()))?,
                );
            }
            "--log-format" => {
                let value = next_value(&mut args, "--log-format")?;
                log_format = logging::Format::parse(&value)
                    .ok_or_else(|| format!("invalid log format '{value}'\n{}", usage()))?;
            }
            "--no-log-timestamps" => log_timestamps = false,
            other if other.starts_with("--") => {
                return Err(format!("unknown option '{other}'\n{}", usage()));
            }
            _ => positionals.push(arg),
        }
    }

    let mut positionals = positionals.into_iter();
    let command = match command.as_str() {
        "import" => {
            let blocks_dir = positionals
                .next()
                .ok_or_else(|| format!("import needs a blocks directory\n{}", usage()))?;
            for arg in positionals {
                match arg.split_once('=') {
                    Some(("filesFrom", value)) => {
                        settings.files_from = parse_number("filesFrom", value)?;
                    }
                    _ => return Err(format!("unexpected argument '{arg}'\n{}", usage())),
                }
            }
            Command::Import {
                blocks_dir: PathBuf::from(blocks_dir),
            }
        }
        "scan" => {
            let blocks_dir = positionals
                .next()
                .ok_or_else(|| format!("scan needs a blocks directory\n{}", usage()))?;
            let mut filters = ScanFilters::default();
            for arg in positionals {
                filters
                    .parse_arg(&arg)
                    .map_err(|err| format!("{err}\n{}", usage()))?;
            }
            Command::Scan {
                blocks_dir: PathBuf::from(blocks_dir),
                filters,
            }
        }
        _ => {
            if let Some(arg) = positionals.next() {
                return Err(format!("unexpected argument '{arg}'\n{}", usage()));
            }
            Command::ConvertAddresses
        }
    };

    let log_level = log_level.unwrap_or_else(|| logging::Level::from_verbosity(settings.verbose));
    Ok(CliAction::Run(Box::new(Config {
        command,
        backend,
        data_dir,
        drop_existing,
        graph,
        settings,
        status_interval: Duration::from_secs(status_interval_secs),
        db_cache_mb,
        log_level,
        log_format,
        log_timestamps,
    })))
}

fn usage() -> String {
    [
        "Usage:",
        "  blkgraph import <blocks-dir> [filesFrom=N] [options]",
        "  blkgraph scan <blocks-dir> [filesFrom=N] [blocks=H,..] [txs=H,..] [addresses=A,..] [options]",
        "  blkgraph convert-addresses [options]",
        "",
        "Commands:",
        "  import             Load blkNNNNN.dat files into the graph, then link blocks to their predecessors",
        "  scan               Decode block files without a store and print matching blocks and transactions",
        "  convert-addresses  Turn address attributes into Address vertices and HasAddress edges",
        "  help               Print this help and exit",
        "  version            Print version and exit",
        "",
        "Options:",
        "  --help, -h  Print this help and exit",
        "  --version, -V  Print version and exit",
        "  --data-dir  Directory holding the graph store (default: ./data)",
        "  --backend  Storage backend to use (fjall|memory) (default: fjall)",
        "  --network  Network of the block files (mainnet|testnet|regtest) (default: mainnet)",
        "  --drop-existing  Delete the graph store before importing",
        "  --address-as-vertex  Store addresses as Address vertices instead of attributes",
        "  --commit-every  Jobs per writer commit, or transactions per commit with --address-as-vertex (default: 100)",
        "  --parallel  Writer worker threads, 0 for available parallelism (default: 0)",
        "  --queue-depth  Writer queue capacity (default: 1024)",
        "  --safe-blocks  Hops behind the tail for the safe tail block (default: 6)",
        "  --expected-blocks  Block count used for progress estimates (default: 700000)",
        "  --limit-blocks  Stop after N blocks, 0 for no limit (default: 0)",
        "  --limit-txs  Stop after N transactions, 0 for no limit (default: 0)",
        "  --max-frame-size  Maximum block size; frames above 5x are treated as corrupt (default: 1000000)",
        "  --verbose  0 quiet, 1 progress, 2 per-file details, 3 per-block trace (default: 1)",
        "  --use-wal  Write batches through the store journal",
        "  --flush  Journal flush on commit (none|data|full) (default: none)",
        "  --status-interval  Seconds between progress lines (default: 5)",
        "  --db-cache-mb  Block cache size of the fjall backend",
        "  --log-level  Log verbosity (error|warn|info|debug|trace) (default: from --verbose)",
        "  --log-format  Log output format (text|json) (default: text)",
        "  --no-log-timestamps  Disable timestamps in text logs",
    ]
    .join("\n")
}
