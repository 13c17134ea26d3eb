//! Warehouse clients.
//!
//! This module provides:
//! - `WarehouseClient` trait: the surface the export pipeline consumes
//! - `BigQueryClient`: implementation over the BigQuery v2 REST API
//! - `MemoryWarehouse`: in-process implementation for tests

pub mod bigquery;
pub mod memory;
mod types;

use async_trait::async_trait;

use crate::error::WarehouseError;

pub use bigquery::{BigQueryClient, BigQueryConfig};
pub use memory::MemoryWarehouse;
pub use types::{
    ColumnMode, ColumnSchema, CreateDisposition, DestinationFormat, ExtractCompression,
    ExtractJob, JobHandle, JobState, JobStatus, QueryJob, QueryOptions, QueryPriority,
    QueryRequest, ResultSchema, TableRef, WriteDisposition,
};

/// Abstract interface for a columnar warehouse.
///
/// Submissions return as soon as the job is accepted; callers observe
/// completion through [`job_status`](WarehouseClient::job_status).
/// Implementations must be safe to share across concurrent exports.
#[async_trait]
pub trait WarehouseClient: Send + Sync + std::fmt::Debug {
    /// Submit a query that writes its result into `job.destination`.
    async fn submit_query(&self, job: &QueryJob<'_>) -> Result<JobHandle, WarehouseError>;

    /// Submit an export of a table into object storage.
    async fn submit_extract(&self, job: &ExtractJob<'_>) -> Result<JobHandle, WarehouseError>;

    /// Current status of a submitted job.
    async fn job_status(&self, handle: &JobHandle) -> Result<JobStatus, WarehouseError>;

    /// Schema and row count of a table.
    async fn table_metadata(&self, table: &TableRef) -> Result<ResultSchema, WarehouseError>;

    /// Drop a table. Deleting a table that does not exist succeeds.
    async fn delete_table(&self, table: &TableRef) -> Result<(), WarehouseError>;
}
