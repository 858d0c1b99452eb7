//! Command-line front end: parallel partitioned loads and client bulk loads.

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use ironload::chunk_retry::{BulkLoadOptions, BulkLoader, WriterSubmitter};
use ironload::config::{CopyFormat, LoadConfig, Partitioning};
use ironload::metrics::MetricsCollector;
use ironload::orchestrator::{LoadOrchestrator, WorkerPool};
use ironload::readers::RawStreamReader;
use ironload::routing::{HashPartitionMap, PartitionMap};
use ironload::writers::{ProcessWriterConfig, ProcessWriterFactory};
use ironload::{LoadError, NodeId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ironload")]
#[command(about = "Bulk data loader for partitioned multi-node SQL databases", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load files in parallel, routing rows to the nodes owning them.
    Load(LoadArgs),
    /// Load files into one node in chunks, isolating rejected rows.
    Bulk(BulkArgs),
}

#[derive(Args)]
struct LoadArgs {
    /// Load configuration (JSON).
    #[arg(long)]
    config: PathBuf,
    /// Sink process settings with one entry per node (JSON).
    #[arg(long)]
    sinks: PathBuf,
    /// Send every row to every node.
    #[arg(long, default_value_t = false)]
    replicated: bool,
    /// Lines to skip at the start of the input.
    #[arg(long, default_value_t = 0)]
    skip_lines: u64,
    /// Write load metrics to this JSON file.
    #[arg(long)]
    metrics: Option<PathBuf>,
    /// Input files or glob patterns.
    #[arg(required = true)]
    inputs: Vec<String>,
}

#[derive(Args)]
struct BulkArgs {
    /// Sink process settings (JSON).
    #[arg(long)]
    sinks: PathBuf,
    /// Node to load into; defaults to the first configured node.
    #[arg(long)]
    node: Option<u32>,
    /// Base options (JSON); flags below override it.
    #[arg(long)]
    options: Option<PathBuf>,
    #[arg(long)]
    table: Option<String>,
    /// Target columns, comma-separated.
    #[arg(long, value_delimiter = ',')]
    columns: Vec<String>,
    #[arg(long)]
    delimiter: Option<char>,
    #[arg(long)]
    null: Option<String>,
    /// Read CSV instead of COPY text.
    #[arg(long, default_value_t = false)]
    csv: bool,
    #[arg(long, default_value_t = '"')]
    quote: char,
    /// Escape character inside quotes; defaults to the quote.
    #[arg(long)]
    escape: Option<char>,
    /// Columns whose unquoted null marker means an empty string.
    #[arg(long, value_delimiter = ',')]
    force_not_null: Vec<String>,
    /// Skip lines starting with this prefix.
    #[arg(long)]
    comment: Option<String>,
    #[arg(long)]
    start_line: Option<u64>,
    #[arg(long)]
    end_line: Option<u64>,
    /// Log progress every N rows.
    #[arg(long)]
    verbose: Option<u64>,
    #[arg(long)]
    max_errors: Option<u64>,
    /// Rows per committed chunk.
    #[arg(long)]
    commit_interval: Option<usize>,
    #[arg(long)]
    auto_reduce_rate: Option<usize>,
    #[arg(long)]
    min_commit_interval: Option<usize>,
    #[arg(long)]
    reject_file: Option<PathBuf>,
    /// Write rejected lines exactly as read.
    #[arg(long, default_value_t = false)]
    preserve_original: bool,
    /// Do not precede rejected lines with the error.
    #[arg(long, default_value_t = false)]
    no_error_comments: bool,
    /// Write bulk-load metrics to this JSON file.
    #[arg(long)]
    metrics: Option<PathBuf>,
    /// Input files or glob patterns.
    #[arg(required = true)]
    inputs: Vec<String>,
}

impl BulkArgs {
    fn to_options(&self) -> anyhow::Result<BulkLoadOptions> {
        let mut options = match &self.options {
            Some(path) => BulkLoadOptions::from_json_file(path)
                .with_context(|| format!("reading options from {}", path.display()))?,
            None => BulkLoadOptions::default(),
        };
        if let Some(table) = &self.table {
            options.table.clone_from(table);
        }
        if !self.columns.is_empty() {
            options.columns.clone_from(&self.columns);
        }
        let delimiter = self.delimiter.unwrap_or(options.format.delimiter);
        if self.csv {
            options.format = CopyFormat::csv(delimiter)
                .with_quote(self.quote, self.escape.unwrap_or(self.quote));
        } else {
            options.format.delimiter = delimiter;
        }
        if let Some(null) = &self.null {
            options.format.null_marker.clone_from(null);
        }
        if !self.force_not_null.is_empty() {
            let Some(csv) = options.format.csv.as_mut() else {
                bail!("--force-not-null requires --csv");
            };
            csv.force_not_null.clone_from(&self.force_not_null);
        }
        if self.comment.is_some() {
            options.comment_prefix.clone_from(&self.comment);
        }
        if let Some(v) = self.start_line {
            options.start_line = v;
        }
        if self.end_line.is_some() {
            options.end_line = self.end_line;
        }
        if let Some(v) = self.verbose {
            options.verbose_interval = v;
        }
        if self.max_errors.is_some() {
            options.max_errors = self.max_errors;
        }
        if let Some(v) = self.commit_interval {
            options.commit_interval = v;
        }
        if let Some(v) = self.auto_reduce_rate {
            options.auto_reduce_rate = v;
        }
        if let Some(v) = self.min_commit_interval {
            options.min_commit_interval = v;
        }
        if self.reject_file.is_some() {
            options.reject_file.clone_from(&self.reject_file);
        }
        options.preserve_original |= self.preserve_original;
        options.error_comments &= !self.no_error_comments;
        options.validate().context("invalid bulk-load options")?;
        Ok(options)
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Load(args) => run_load(&args),
        Command::Bulk(args) => run_bulk(&args),
    }
}

fn read_sinks(path: &Path) -> anyhow::Result<ProcessWriterConfig> {
    ProcessWriterConfig::from_json_file(path)
        .with_context(|| format!("reading sink settings from {}", path.display()))
}

/// Hash map over the sink nodes. Replicated tables, and loads run with
/// `--replicated`, send every row to every node.
fn partition_map(
    nodes: Vec<NodeId>,
    partitioning: &Partitioning,
    replicated: bool,
) -> anyhow::Result<Arc<dyn PartitionMap>> {
    let mut map = HashPartitionMap::for_partitioning(nodes, partitioning)?;
    if replicated {
        map = map.replicated();
    }
    Ok(Arc::new(map))
}

fn run_load(args: &LoadArgs) -> anyhow::Result<()> {
    let config = LoadConfig::from_json_file(&args.config)
        .with_context(|| format!("reading load configuration from {}", args.config.display()))?;
    let sinks = read_sinks(&args.sinks)?;
    let nodes: Vec<NodeId> = sinks.nodes.iter().map(|n| n.node).collect();
    let map = partition_map(nodes, &config.partitioning, args.replicated)?;

    let reader = RawStreamReader::open(&args.inputs)?
        .for_format(&config.format)
        .with_skip_lines(args.skip_lines);
    let pool = WorkerPool::for_processors(config.processors)?;
    let metrics = MetricsCollector::new();
    let orchestrator =
        LoadOrchestrator::new(&pool, config, map, Arc::new(ProcessWriterFactory::new(sinks)?))?
            .with_metrics(metrics.clone());
    let report = orchestrator.run(reader)?;

    for (node, rows) in &report.rows_per_node {
        info!(node = %node, rows, "node total");
    }
    if let Some(path) = &args.metrics {
        metrics.save_to_file(path)?;
    }
    if report.cancelled {
        bail!("load cancelled; nothing was committed");
    }
    println!("{} rows loaded in {:.3}s", report.rows_loaded, report.elapsed.as_secs_f64());
    Ok(())
}

fn run_bulk(args: &BulkArgs) -> anyhow::Result<()> {
    let options = args.to_options()?;
    let sinks = read_sinks(&args.sinks)?;
    let node = match args.node {
        Some(n) => NodeId::new(n),
        None => sinks
            .nodes
            .first()
            .map(|n| n.node)
            .context("sink settings list no nodes")?,
    };
    let submitter = WriterSubmitter::new(
        Arc::new(ProcessWriterFactory::new(sinks)?),
        node,
        options.sink_target(),
    );
    let metrics = MetricsCollector::new();
    let mut loader = BulkLoader::new(options, submitter)?.with_metrics(metrics.clone());
    let outcome = loader.run_inputs(&args.inputs);
    if let Some(path) = &args.metrics {
        metrics.save_to_file(path)?;
    }
    let summary = match outcome {
        Ok(summary) => summary,
        Err(LoadError::ErrorBudgetExceeded {
            lines_consumed,
            rejected_rows,
        }) => {
            warn!(lines_consumed, rejected_rows, "error budget exceeded");
            bail!(
                "aborted after {rejected_rows} rejected rows; resume with --start-line {}",
                lines_consumed + 1
            );
        }
        Err(e) => return Err(e.into()),
    };
    println!(
        "{} rows loaded, {} rejected in {} chunks ({} submissions) in {:.3}s",
        summary.rows_loaded,
        summary.rejected_rows,
        summary.chunks,
        summary.submissions,
        summary.elapsed.as_secs_f64()
    );
    if let Some(first) = &summary.first_error {
        println!("first error: {first}");
    }
    Ok(())
}
