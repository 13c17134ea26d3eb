//! The query-to-stream export pipeline.
//!
//! An export runs strictly in order:
//! 1. `QueryJobRunner`: materialize the query into a temporary table
//! 2. `ExtractJobRunner`: export that table as gzip NDJSON shards
//! 3. `ShardMerger`: merge the shards into one local artifact
//! 4. open a `RecordIterator` over the artifact
//! 5. `ResourceReclaimer`: delete the table and the shards
//!
//! The temporary table and the shard prefix are both named by a fresh id.

mod extract;
mod id;
mod merge;
mod query;
mod reclaim;

pub use extract::{ExtractJobRunner, SHARD_PATTERN};
pub use id::generate_id;
pub use merge::{MergeStats, ShardMerger};
pub use query::QueryJobRunner;
pub use reclaim::{ReclaimReport, ResourceReclaimer};

use snafu::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use crate::config::Config;
use crate::emit;
use crate::error::{
    ArtifactOpenSnafu, ExportError, SetupError, SetupStorageSnafu, SetupWarehouseSnafu,
};
use crate::iterator::RecordIterator;
use crate::job::WaitConfig;
use crate::metrics::events::{ExportCompleted, RequestStatus};
use crate::storage::{StorageProvider, StorageProviderRef};
use crate::warehouse::{BigQueryClient, QueryRequest, TableRef, WarehouseClient};

/// Settings for one [`Exporter`].
#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// Project owning the temporary dataset.
    pub project: String,
    /// Dataset that receives temporary tables.
    pub dataset: String,
    /// Directory for local artifacts.
    pub temp_dir: PathBuf,
    pub wait: WaitConfig,
    /// Reclaim temporary resources when a stage fails.
    pub cleanup_on_failure: bool,
    /// Gzip level of the local artifact.
    pub compression_level: u32,
}

impl ExportConfig {
    pub fn new(project: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            temp_dir: std::env::temp_dir(),
            wait: WaitConfig::default(),
            cleanup_on_failure: false,
            compression_level: 6,
        }
    }
}

/// Facts about a finished export.
#[derive(Debug, Clone)]
pub struct ExportStats {
    pub id: String,
    pub table: TableRef,
    pub prefix: String,
    pub merge: MergeStats,
    pub duration: Duration,
}

/// A finished export.
#[derive(Debug)]
pub struct Export {
    /// Records of the result, read from the local artifact.
    pub records: RecordIterator,
    /// What happened to the temporary table and shards.
    pub reclaim: ReclaimReport,
    pub stats: ExportStats,
}

/// Runs exports. Cheap to clone; clones share the collaborators.
#[derive(Debug, Clone)]
pub struct Exporter {
    config: ExportConfig,
    query: QueryJobRunner,
    extract: ExtractJobRunner,
    merger: ShardMerger,
    reclaimer: ResourceReclaimer,
}

impl Exporter {
    pub fn new(
        warehouse: Arc<dyn WarehouseClient>,
        storage: StorageProviderRef,
        config: ExportConfig,
    ) -> Self {
        Self {
            query: QueryJobRunner::new(warehouse.clone(), config.wait.clone()),
            extract: ExtractJobRunner::new(
                warehouse.clone(),
                storage.clone(),
                config.wait.clone(),
            ),
            merger: ShardMerger::new(storage.clone(), config.compression_level),
            reclaimer: ResourceReclaimer::new(warehouse, storage),
            config,
        }
    }

    /// Build an exporter backed by BigQuery and the configured bucket.
    pub async fn from_config(config: &Config) -> Result<Self, SetupError> {
        let storage = StorageProvider::for_url_with_options(
            &config.storage.bucket,
            config.storage.storage_options.clone(),
        )
        .await
        .context(SetupStorageSnafu)?;
        let warehouse = BigQueryClient::new(config.bigquery()).context(SetupWarehouseSnafu)?;

        Ok(Self::new(
            Arc::new(warehouse),
            Arc::new(storage),
            config.export_config(),
        ))
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Run `request` through the whole pipeline.
    ///
    /// On success the records are local and the temporary resources have
    /// been reclaimed (see [`Export::reclaim`] for anything left behind).
    /// On failure no iterator is returned.
    pub async fn export(
        &self,
        request: QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<Export, ExportError> {
        let id = generate_id();
        let span = info_span!("export", id = %id);
        self.run(id, request, cancel).instrument(span).await
    }

    async fn run(
        &self,
        id: String,
        request: QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<Export, ExportError> {
        let start = Instant::now();
        let table = TableRef::new(&self.config.project, &self.config.dataset, &id);
        info!("Starting export into temporary table {}", table);

        let schema = match self.query.execute(&request, &table, cancel).await {
            Ok(schema) => schema,
            Err(e) => return Err(self.fail(e, &table, None, start).await),
        };

        let prefix = match self.extract.extract(&table, &id, cancel).await {
            Ok(prefix) => prefix,
            Err(e) => return Err(self.fail(e, &table, Some(&id), start).await),
        };

        let artifact = self.config.temp_dir.join(format!("{id}.json.gz"));
        let merge = match self.merger.merge(&prefix, &artifact, cancel).await {
            Ok(stats) => stats,
            Err(e) => return Err(self.fail(e, &table, Some(&prefix), start).await),
        };
        if merge.records != schema.total_rows {
            warn!(
                "Merged {} records but the warehouse reported {} rows",
                merge.records, schema.total_rows
            );
        }

        let records = match RecordIterator::open(&artifact, schema)
            .context(ArtifactOpenSnafu { path: &artifact })
        {
            Ok(records) => records,
            Err(e) => {
                if let Err(remove) = std::fs::remove_file(&artifact) {
                    warn!("Failed to remove artifact {}: {}", artifact.display(), remove);
                }
                return Err(self.fail(e, &table, Some(&prefix), start).await);
            }
        };

        let reclaim = self.reclaimer.reclaim(&table, Some(&prefix)).await;

        let duration = start.elapsed();
        emit!(ExportCompleted {
            status: RequestStatus::Success,
            stage: "done",
            duration,
        });
        info!(
            "Export finished in {:?}: {} records ready at {}",
            duration,
            merge.records,
            artifact.display()
        );

        Ok(Export {
            records,
            reclaim,
            stats: ExportStats {
                id,
                table,
                prefix,
                merge,
                duration,
            },
        })
    }

    /// Record a failed export and apply the failure cleanup policy.
    async fn fail(
        &self,
        error: ExportError,
        table: &TableRef,
        prefix: Option<&str>,
        start: Instant,
    ) -> ExportError {
        emit!(ExportCompleted {
            status: RequestStatus::Error,
            stage: error.stage(),
            duration: start.elapsed(),
        });
        warn!("Export failed during {} stage: {}", error.stage(), error);

        if self.config.cleanup_on_failure {
            let report = self.reclaimer.reclaim(table, prefix).await;
            if report.is_clean() {
                info!("Reclaimed temporary resources of failed export");
            }
        } else {
            info!("Leaving temporary resources of {} in place", table);
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::{ColumnSchema, MemoryWarehouse};
    use serde_json::json;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> ExportConfig {
        ExportConfig {
            temp_dir: dir.path().to_path_buf(),
            wait: WaitConfig {
                poll_interval: Duration::from_millis(1),
                max_poll_interval: Duration::from_millis(2),
                timeout: None,
            },
            ..ExportConfig::new("p", "tmp")
        }
    }

    #[tokio::test]
    async fn test_export_runs_every_stage_in_order() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(StorageProvider::in_memory());
        let warehouse = Arc::new(MemoryWarehouse::new("p", storage.clone()));
        warehouse.register_result(
            "SELECT id FROM t",
            vec![ColumnSchema::new("id", "INTEGER")],
            vec![json!({"id": 1})],
        );

        let exporter = Exporter::new(warehouse.clone(), storage, config(&dir));
        let export = exporter
            .export(QueryRequest::new("SELECT id FROM t"), &CancellationToken::new())
            .await
            .unwrap();

        let jobs = warehouse.submitted_jobs();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].detail, format!("memory://{}/*.json.gz", export.stats.id));
        assert_eq!(export.stats.table.table, export.stats.id);
        assert_eq!(export.stats.prefix, export.stats.id);
        assert_eq!(
            export.records.path(),
            dir.path().join(format!("{}.json.gz", export.stats.id))
        );
        assert!(export.reclaim.is_clean());
    }

    #[tokio::test]
    async fn test_exports_use_distinct_ids() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(StorageProvider::in_memory());
        let warehouse = Arc::new(MemoryWarehouse::new("p", storage.clone()));
        warehouse.register_result("SELECT 1", Vec::new(), vec![json!({"x": 1})]);

        let exporter = Exporter::new(warehouse, storage, config(&dir));
        let other = exporter.clone();
        let cancel = CancellationToken::new();
        let (a, b) = tokio::join!(
            exporter.export(QueryRequest::new("SELECT 1"), &cancel),
            other.export(QueryRequest::new("SELECT 1"), &cancel),
        );

        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.stats.id, b.stats.id);
        assert_ne!(a.records.path(), b.records.path());
    }
}
