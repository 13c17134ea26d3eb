//! bulkquery: export large warehouse query results as a stream of records.
//!
//! Direct result fetches from a warehouse are size-limited. This library
//! materializes a query into a temporary table, extracts it as sharded
//! gzip NDJSON into object storage, merges the shards into one local file
//! and hands back a lazy record iterator. All temporary resources are
//! deleted once the result is local.
//!
//! # Example
//!
//! ```ignore
//! use bulkquery::{Config, Exporter, QueryRequest};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = Config::from_file("bulkquery.yaml")?;
//! let exporter = Exporter::from_config(&config).await?;
//! let mut export = exporter
//!     .export(QueryRequest::new("SELECT id, name FROM t"), &CancellationToken::new())
//!     .await?;
//! for record in &mut export.records {
//!     println!("{}", serde_json::Value::Object(record?));
//! }
//! export.records.close()?;
//! ```

pub mod config;
pub mod error;
pub mod export;
pub mod iterator;
pub mod job;
pub mod metrics;
pub mod signal;
pub mod storage;
pub mod warehouse;

// Re-export main types
pub use config::Config;
pub use export::{Export, ExportConfig, ExportStats, Exporter, ReclaimReport};
pub use iterator::{Record, RecordIterator};
pub use storage::{StorageProvider, StorageProviderRef};
pub use warehouse::{QueryRequest, ResultSchema, WarehouseClient};
