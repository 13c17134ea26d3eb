//! bulkquery: run a warehouse query and stream its full result as NDJSON.
//!
//! The result is exported through object storage, so it is not bound by the
//! warehouse's direct-fetch size limits. Records go to stdout or a file.

use clap::Parser;
use snafu::prelude::*;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use bulkquery::error::{
    AddressParseSnafu, CliError, ConfigSnafu, DecodeSnafu, ExportSnafu, MetricsSnafu,
    MissingQuerySnafu, OutputSnafu, QueryFileSnafu, SetupSnafu,
};
use bulkquery::signal::cancel_on_signal;
use bulkquery::warehouse::QueryPriority;
use bulkquery::{Config, Export, Exporter, QueryRequest, metrics};

/// Export a warehouse query result as NDJSON.
#[derive(Parser, Debug)]
#[command(name = "bulkquery")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// SQL to run.
    #[arg(short, long, conflicts_with = "query_file")]
    query: Option<String>,

    /// File containing the SQL to run.
    #[arg(long)]
    query_file: Option<PathBuf>,

    /// Write records here instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Run the query at batch priority.
    #[arg(long)]
    batch: bool,

    /// Fail the query instead of billing more than this many bytes.
    #[arg(long)]
    maximum_bytes_billed: Option<i64>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Dry run - validate configuration and query input without exporting.
    #[arg(long)]
    dry_run: bool,
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), CliError> {
    let args = Args::parse();

    // Logs go to stderr so stdout carries only records
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    info!("bulkquery starting");

    let config = Config::from_file(&args.config).context(ConfigSnafu)?;
    let request = build_request(&args)?;

    let cancel = CancellationToken::new();

    let metrics_server = if config.metrics.enabled {
        let addr = config.metrics.address.parse().context(AddressParseSnafu)?;
        let server = metrics::init(addr, cancel.child_token())
            .await
            .context(MetricsSnafu)?;
        debug!(
            "Metrics endpoint listening on http://{}/metrics",
            server.local_addr()
        );
        Some(server)
    } else {
        None
    };

    if args.dry_run {
        info!("Dry run mode - validating configuration");
        info!("Project: {}", config.warehouse.project);
        info!("Temporary dataset: {}", config.warehouse.dataset);
        info!("Shard bucket: {}", config.storage.bucket);
        info!("Query: {}", request.sql());
        info!("Configuration is valid");
        return Ok(());
    }

    let exporter = Exporter::from_config(&config).await.context(SetupSnafu)?;
    let watcher = cancel_on_signal(cancel.clone());

    let result = run(&exporter, request, &args, &cancel).await;

    // Stops the signal watcher and the metrics server
    cancel.cancel();
    if let Err(e) = watcher.await {
        debug!("Signal watcher ended abnormally: {}", e);
    }
    if let Some(server) = metrics_server {
        server.stopped().await;
    }
    result
}

fn build_request(args: &Args) -> Result<QueryRequest, CliError> {
    let sql = match (&args.query, &args.query_file) {
        (Some(sql), _) => sql.clone(),
        (None, Some(path)) => std::fs::read_to_string(path).context(QueryFileSnafu { path })?,
        (None, None) => return MissingQuerySnafu.fail(),
    };

    let mut request = QueryRequest::new(sql);
    if args.batch {
        request = request.with_priority(QueryPriority::Batch);
    }
    if let Some(bytes) = args.maximum_bytes_billed {
        request = request.with_maximum_bytes_billed(bytes);
    }
    Ok(request.with_label("client", "bulkquery"))
}

async fn run(
    exporter: &Exporter,
    request: QueryRequest,
    args: &Args,
    cancel: &CancellationToken,
) -> Result<(), CliError> {
    let Export {
        mut records,
        reclaim,
        stats,
    } = exporter.export(request, cancel).await.context(ExportSnafu)?;

    if !reclaim.is_clean() {
        warn!(
            "{} temporary resources could not be deleted",
            reclaim.errors.len()
        );
    }

    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(File::create(path).context(OutputSnafu)?)),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };

    let mut written = 0u64;
    for record in records.by_ref() {
        if cancel.is_cancelled() {
            warn!("Cancelled after writing {} records", written);
            break;
        }
        let record = record.context(DecodeSnafu)?;
        serde_json::to_writer(&mut out, &record)
            .map_err(io::Error::from)
            .context(OutputSnafu)?;
        out.write_all(b"\n").context(OutputSnafu)?;
        written += 1;
    }
    out.flush().context(OutputSnafu)?;
    records.close().context(DecodeSnafu)?;

    info!("Export completed");
    info!("  Records written: {}", written);
    info!("  Rows reported: {}", records.total_rows());
    info!("  Shards merged: {}", stats.merge.shards);
    info!("  Bytes downloaded: {}", stats.merge.compressed_bytes);
    info!("  Duration: {:?}", stats.duration);

    Ok(())
}
