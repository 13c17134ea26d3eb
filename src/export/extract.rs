//! Extract stage: export the temporary table as gzip NDJSON shards.

use snafu::prelude::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{ExportError, ExtractionSnafu};
use crate::job::{WaitConfig, wait_for_job};
use crate::metrics::events::JobKind;
use crate::storage::StorageProviderRef;
use crate::warehouse::{
    DestinationFormat, ExtractCompression, ExtractJob, TableRef, WarehouseClient,
};

/// Suffix of every shard object. The warehouse fills in the `*`.
pub const SHARD_PATTERN: &str = "*.json.gz";

/// Submits an extract job and waits for it.
#[derive(Debug, Clone)]
pub struct ExtractJobRunner {
    warehouse: Arc<dyn WarehouseClient>,
    storage: StorageProviderRef,
    wait: WaitConfig,
}

impl ExtractJobRunner {
    pub fn new(
        warehouse: Arc<dyn WarehouseClient>,
        storage: StorageProviderRef,
        wait: WaitConfig,
    ) -> Self {
        Self {
            warehouse,
            storage,
            wait,
        }
    }

    /// Wildcard URI the shards for `prefix` are written to.
    pub fn destination_uri(&self, prefix: &str) -> String {
        self.storage.uri_for(&format!("{prefix}/{SHARD_PATTERN}"))
    }

    /// Export `table` into shards under `prefix` and return the prefix once
    /// the warehouse reports the job done. The shards are not enumerated.
    pub async fn extract(
        &self,
        table: &TableRef,
        prefix: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ExportError> {
        let job = ExtractJob {
            source: table,
            destination_uri: self.destination_uri(prefix),
            format: DestinationFormat::NewlineDelimitedJson,
            compression: ExtractCompression::Gzip,
        };

        let handle = self
            .warehouse
            .submit_extract(&job)
            .await
            .context(ExtractionSnafu)?;
        debug!(job_id = %handle, "Submitted extract of {} to {}", table, job.destination_uri);

        wait_for_job(
            self.warehouse.as_ref(),
            &handle,
            JobKind::Extract,
            &self.wait,
            cancel,
        )
        .await
        .context(ExtractionSnafu)?;

        info!("Extracted {} to {}", table, job.destination_uri);
        Ok(prefix.to_string())
    }
}
