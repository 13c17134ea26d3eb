//! Error types for bulkquery using snafu.
//!
//! This module defines structured error types with context selectors for
//! all error conditions in the codebase. Every pipeline error names the
//! stage that failed and carries the collaborator's message unmodified.

use snafu::prelude::*;
use std::path::PathBuf;
use std::time::Duration;

// ============ Storage Errors ============

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },

    /// GCS configuration error.
    #[snafu(display("GCS configuration error: {source}"))]
    GcsConfig { source: object_store::Error },
}

impl StorageError {
    /// Check if this error represents a "not found" condition (404, NoSuchKey, etc.)
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::ObjectStore { source } => {
                matches!(source, object_store::Error::NotFound { .. })
            }
            _ => false,
        }
    }
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Warehouse project is empty.
    #[snafu(display("Warehouse project cannot be empty"))]
    EmptyProject,

    /// Temporary dataset is empty.
    #[snafu(display("Warehouse dataset cannot be empty"))]
    EmptyDataset,

    /// Bucket URL is empty.
    #[snafu(display("Storage bucket cannot be empty"))]
    EmptyBucket,

    /// Poll interval of zero would spin.
    #[snafu(display("export.poll_interval_ms must be greater than zero"))]
    ZeroPollInterval,

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file: {source}"))]
    ReadFile { source: std::io::Error },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder: {source}"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    /// Failed to bind the metrics listener.
    #[snafu(display("Failed to bind metrics server to {address}: {source}"))]
    MetricsBind {
        address: std::net::SocketAddr,
        source: std::io::Error,
    },
}

// ============ Warehouse Errors ============

/// Errors reported by a [`WarehouseClient`](crate::warehouse::WarehouseClient)
/// or while waiting on one of its jobs.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WarehouseError {
    /// Failed to construct the HTTP client.
    #[snafu(display("Failed to build HTTP client: {source}"))]
    ClientBuild { source: reqwest::Error },

    /// Transport-level failure talking to the warehouse.
    #[snafu(display("HTTP request failed: {source}"))]
    Http { source: reqwest::Error },

    /// The warehouse API answered with a non-success status.
    #[snafu(display("Warehouse API returned {status}: {message}"))]
    Api { status: u16, message: String },

    /// Failed to decode a warehouse API response.
    #[snafu(display("Failed to decode warehouse response: {source}"))]
    ResponseDecode { source: serde_json::Error },

    /// A job reached a terminal state other than success.
    #[snafu(display("Job {job_id} failed: {message}"))]
    JobFailed { job_id: String, message: String },

    /// The caller cancelled while waiting for a job.
    #[snafu(display("Wait for job {job_id} was cancelled"))]
    WaitCancelled { job_id: String },

    /// The job did not reach a terminal state before the deadline.
    #[snafu(display("Job {job_id} did not finish within {timeout:?}"))]
    WaitTimeout { job_id: String, timeout: Duration },

    /// The job id is unknown to the warehouse.
    #[snafu(display("Unknown job: {job_id}"))]
    UnknownJob { job_id: String },

    /// The referenced table does not exist.
    #[snafu(display("Table not found: {table}"))]
    TableNotFound { table: String },

    /// The extract destination cannot be served by this warehouse.
    #[snafu(display("Unsupported extract destination: {uri}"))]
    InvalidDestination { uri: String },

    /// The warehouse could not write extracted shards.
    #[snafu(display("Failed to write extract shard: {source}"))]
    ShardWrite { source: StorageError },
}

impl WarehouseError {
    /// True if the error stems from caller cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WarehouseError::WaitCancelled { .. })
    }
}

// ============ Merge Errors ============

/// Errors raised while assembling the local artifact from shards.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MergeError {
    /// Listing the shard prefix failed.
    #[snafu(display("Failed to list shards: {source}"))]
    ShardList { source: StorageError },

    /// Reading a shard from object storage failed.
    #[snafu(display("Failed to read shard {path}: {source}"))]
    ShardRead { path: String, source: StorageError },

    /// A shard was not valid gzip.
    #[snafu(display("Failed to decompress shard {path}: {source}"))]
    Decompress {
        path: String,
        source: std::io::Error,
    },

    /// Writing the local artifact failed.
    #[snafu(display("Failed to write local artifact {}: {source}", path.display()))]
    ArtifactWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The blocking artifact writer panicked or was aborted.
    #[snafu(display("Artifact writer task failed: {source}"))]
    WriterJoin { source: tokio::task::JoinError },

    /// The caller cancelled mid-merge.
    #[snafu(display("Merge cancelled"))]
    MergeCancelled,
}

// ============ Export Errors ============

/// Fatal pipeline errors. When one of these is returned, no record iterator
/// is produced.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ExportError {
    /// The warehouse rejected or failed the query job.
    #[snafu(display("Query execution failed: {source}"))]
    QueryExecution { source: WarehouseError },

    /// The extract job failed.
    #[snafu(display("Extraction failed: {source}"))]
    Extraction { source: WarehouseError },

    /// Assembling the local artifact failed.
    #[snafu(display("Shard merge failed for prefix {prefix}: {source}"))]
    ShardMerge { prefix: String, source: MergeError },

    /// The merged artifact could not be reopened for reading.
    #[snafu(display("Failed to open local artifact {}: {source}", path.display()))]
    ArtifactOpen {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl ExportError {
    /// True if the pipeline stopped because the caller cancelled.
    pub fn is_cancelled(&self) -> bool {
        match self {
            ExportError::QueryExecution { source } | ExportError::Extraction { source } => {
                source.is_cancelled()
            }
            ExportError::ShardMerge { source, .. } => {
                matches!(source, MergeError::MergeCancelled)
            }
            ExportError::ArtifactOpen { .. } => false,
        }
    }

    /// Short name of the stage that failed.
    pub fn stage(&self) -> &'static str {
        match self {
            ExportError::QueryExecution { .. } => "query",
            ExportError::Extraction { .. } => "extract",
            ExportError::ShardMerge { .. } | ExportError::ArtifactOpen { .. } => "merge",
        }
    }
}

// ============ Setup Errors ============

/// Errors building an exporter from configuration.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SetupError {
    /// The bucket URL or its options were rejected.
    #[snafu(display("Failed to set up storage: {source}"))]
    SetupStorage { source: StorageError },

    /// The warehouse client could not be built.
    #[snafu(display("Failed to set up warehouse client: {source}"))]
    SetupWarehouse { source: WarehouseError },
}

// ============ Reclaim Errors ============

/// Advisory errors from deleting temporary resources. The result has already
/// been delivered locally when these occur; only remote resources leak.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ReclaimError {
    /// Dropping the temporary table failed.
    #[snafu(display("Failed to delete temporary table {table}: {source}"))]
    DeleteTable {
        table: String,
        source: WarehouseError,
    },

    /// Re-listing the shard prefix failed.
    #[snafu(display("Failed to list shards under {prefix}: {source}"))]
    ReclaimList {
        prefix: String,
        source: StorageError,
    },

    /// Deleting a shard object failed.
    #[snafu(display("Failed to delete shard {path}: {source}"))]
    DeleteShard { path: String, source: StorageError },
}

// ============ Decode Errors ============

/// Errors raised by the record iterator.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DecodeError {
    /// Reading or decompressing the local artifact failed.
    #[snafu(display("Failed to read record stream: {source}"))]
    RecordRead { source: std::io::Error },

    /// A line was not valid JSON for the requested type.
    #[snafu(display("Malformed record on line {line}: {source}"))]
    RecordJson {
        line: u64,
        source: serde_json::Error,
    },

    /// The iterator was already closed.
    #[snafu(display("Record iterator is closed"))]
    IteratorClosed,

    /// Removing the local artifact failed.
    #[snafu(display("Failed to remove local artifact {}: {source}", path.display()))]
    ArtifactRemove {
        path: PathBuf,
        source: std::io::Error,
    },
}

// ============ CLI Error (top-level) ============

/// Top-level errors surfaced by the `bulkquery` binary.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CliError {
    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// Exporter setup error.
    #[snafu(display("Setup error"))]
    Setup { source: SetupError },

    /// Pipeline error.
    #[snafu(display("Export error"))]
    Export { source: ExportError },

    /// Record decoding error.
    #[snafu(display("Record error"))]
    Decode { source: DecodeError },

    /// Failed to read the query file.
    #[snafu(display("Failed to read query file {}", path.display()))]
    QueryFile {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Neither --query nor --query-file was given.
    #[snafu(display("One of --query or --query-file is required"))]
    MissingQuery,

    /// Failed to write output records.
    #[snafu(display("Failed to write output"))]
    Output { source: std::io::Error },

    /// Address parsing error.
    #[snafu(display("Failed to parse metrics address"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error"))]
    Metrics { source: MetricsError },
}
