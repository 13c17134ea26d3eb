//! Query stage: run the SQL into a temporary table.

use snafu::prelude::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{ExportError, QueryExecutionSnafu};
use crate::job::{WaitConfig, wait_for_job};
use crate::metrics::events::JobKind;
use crate::warehouse::{
    CreateDisposition, QueryJob, QueryRequest, ResultSchema, TableRef, WarehouseClient,
    WriteDisposition,
};

/// Submits a query, waits for it and reads back the destination's metadata.
#[derive(Debug, Clone)]
pub struct QueryJobRunner {
    warehouse: Arc<dyn WarehouseClient>,
    wait: WaitConfig,
}

impl QueryJobRunner {
    pub fn new(warehouse: Arc<dyn WarehouseClient>, wait: WaitConfig) -> Self {
        Self { warehouse, wait }
    }

    /// Materialize `request` into `destination`.
    ///
    /// The destination is created if needed and truncated if it exists.
    /// Returns the schema and row count the warehouse reports for it.
    pub async fn execute(
        &self,
        request: &QueryRequest,
        destination: &TableRef,
        cancel: &CancellationToken,
    ) -> Result<ResultSchema, ExportError> {
        let job = QueryJob {
            request,
            destination,
            create_disposition: CreateDisposition::CreateIfNeeded,
            write_disposition: WriteDisposition::WriteTruncate,
        };

        let handle = self
            .warehouse
            .submit_query(&job)
            .await
            .context(QueryExecutionSnafu)?;
        debug!(job_id = %handle, "Submitted query into {}", destination);

        wait_for_job(
            self.warehouse.as_ref(),
            &handle,
            JobKind::Query,
            &self.wait,
            cancel,
        )
        .await
        .context(QueryExecutionSnafu)?;

        let schema = self
            .warehouse
            .table_metadata(destination)
            .await
            .context(QueryExecutionSnafu)?;

        info!(
            "Query materialized into {} ({} rows, {} columns)",
            destination,
            schema.total_rows,
            schema.columns.len()
        );
        Ok(schema)
    }
}
