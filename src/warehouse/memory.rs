//! In-process warehouse.
//!
//! Query results are registered up front by SQL text. Extract jobs write
//! real gzip NDJSON shards into a [`StorageProvider`], so the rest of the
//! pipeline runs unchanged against it. Faults can be injected per stage.

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use object_store::path::Path;
use serde_json::Value;
use snafu::prelude::*;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use tracing::debug;

use super::{
    ColumnSchema, ExtractJob, JobHandle, JobState, JobStatus, QueryJob, ResultSchema, TableRef,
    WarehouseClient,
};
use crate::emit;
use crate::error::{
    InvalidDestinationSnafu, ShardWriteSnafu, StorageError, TableNotFoundSnafu, UnknownJobSnafu,
    WarehouseError,
};
use crate::metrics::events::{JobKind, JobSubmitted};
use crate::storage::StorageProviderRef;

const DEFAULT_ROWS_PER_SHARD: usize = 1000;

#[derive(Debug, Clone)]
struct TableData {
    columns: Vec<ColumnSchema>,
    rows: Vec<Value>,
}

#[derive(Debug)]
struct JobRecord {
    /// Status polls left before the job reports its outcome.
    remaining_polls: u32,
    outcome: JobStatus,
}

/// A job accepted by the warehouse, in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedJob {
    pub job_id: String,
    pub kind: JobKind,
    /// SQL text for queries, destination URI for extracts.
    pub detail: String,
}

#[derive(Debug, Default)]
struct State {
    results: HashMap<String, TableData>,
    query_failures: HashMap<String, String>,
    extract_failure: Option<String>,
    delete_failure: Option<String>,
    corrupt_shards: bool,
    tables: HashMap<TableRef, TableData>,
    jobs: HashMap<String, JobRecord>,
    submitted: Vec<SubmittedJob>,
    next_job: u64,
}

/// [`WarehouseClient`] that keeps tables in memory.
#[derive(Debug)]
pub struct MemoryWarehouse {
    project: String,
    storage: StorageProviderRef,
    rows_per_shard: usize,
    pending_polls: u32,
    state: Mutex<State>,
}

impl MemoryWarehouse {
    pub fn new(project: impl Into<String>, storage: StorageProviderRef) -> Self {
        Self {
            project: project.into(),
            storage,
            rows_per_shard: DEFAULT_ROWS_PER_SHARD,
            pending_polls: 0,
            state: Mutex::new(State::default()),
        }
    }

    /// Maximum rows written to a single extract shard.
    pub fn with_rows_per_shard(mut self, rows: usize) -> Self {
        self.rows_per_shard = rows.max(1);
        self
    }

    /// Number of `Running` statuses each job reports before it finishes.
    pub fn with_pending_polls(mut self, polls: u32) -> Self {
        self.pending_polls = polls;
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register the result of `sql`. Rows are JSON objects keyed by column name.
    pub fn register_result(
        &self,
        sql: impl Into<String>,
        columns: Vec<ColumnSchema>,
        rows: Vec<Value>,
    ) {
        self.state()
            .results
            .insert(sql.into(), TableData { columns, rows });
    }

    /// Make the query job for `sql` fail with `message`.
    pub fn fail_query(&self, sql: impl Into<String>, message: impl Into<String>) {
        self.state()
            .query_failures
            .insert(sql.into(), message.into());
    }

    /// Make every subsequent extract job fail with `message`.
    pub fn fail_extracts(&self, message: impl Into<String>) {
        self.state().extract_failure = Some(message.into());
    }

    /// Make every subsequent extract write shards that are not gzip, as a
    /// truncated or foreign upload would look.
    pub fn corrupt_shards(&self) {
        self.state().corrupt_shards = true;
    }

    /// Make every subsequent table delete fail with `message`.
    pub fn fail_table_deletes(&self, message: impl Into<String>) {
        self.state().delete_failure = Some(message.into());
    }

    pub fn table_exists(&self, table: &TableRef) -> bool {
        self.state().tables.contains_key(table)
    }

    pub fn tables(&self) -> Vec<TableRef> {
        self.state().tables.keys().cloned().collect()
    }

    pub fn submitted_jobs(&self) -> Vec<SubmittedJob> {
        self.state().submitted.clone()
    }

    fn record_job(
        &self,
        state: &mut State,
        kind: JobKind,
        detail: String,
        outcome: JobStatus,
    ) -> JobHandle {
        state.next_job += 1;
        let job_id = format!("{}_job_{}", kind.as_str(), state.next_job);
        state.jobs.insert(
            job_id.clone(),
            JobRecord {
                remaining_polls: self.pending_polls,
                outcome,
            },
        );
        state.submitted.push(SubmittedJob {
            job_id: job_id.clone(),
            kind,
            detail,
        });
        emit!(JobSubmitted { kind });

        JobHandle {
            job_id,
            location: None,
        }
    }

    /// Split rows into gzip NDJSON shards. A table with no rows still
    /// produces one (empty) shard.
    fn encode_shards(&self, rows: &[Value]) -> Result<Vec<Vec<u8>>, WarehouseError> {
        let chunks: Vec<&[Value]> = if rows.is_empty() {
            vec![rows]
        } else {
            rows.chunks(self.rows_per_shard).collect()
        };

        chunks
            .into_iter()
            .map(|chunk| {
                encode_shard(chunk).map_err(|source| WarehouseError::ShardWrite {
                    source: StorageError::Io { source },
                })
            })
            .collect()
    }
}

fn encode_shard(rows: &[Value]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    for row in rows {
        serde_json::to_writer(&mut encoder, row)?;
        encoder.write_all(b"\n")?;
    }
    encoder.finish()
}

#[async_trait]
impl WarehouseClient for MemoryWarehouse {
    async fn submit_query(&self, job: &QueryJob<'_>) -> Result<JobHandle, WarehouseError> {
        let sql = job.request.sql().to_string();
        let mut state = self.state();

        let outcome = if let Some(message) = state.query_failures.get(&sql) {
            JobStatus::failed(message.clone())
        } else if let Some(result) = state.results.get(&sql).cloned() {
            state.tables.insert(job.destination.clone(), result);
            JobStatus::succeeded()
        } else {
            JobStatus::failed(format!("No result registered for query: {sql}"))
        };

        debug!("Query into {} accepted", job.destination);
        Ok(self.record_job(&mut state, JobKind::Query, sql, outcome))
    }

    async fn submit_extract(&self, job: &ExtractJob<'_>) -> Result<JobHandle, WarehouseError> {
        let pattern = self
            .storage
            .relative_path(&job.destination_uri)
            .filter(|p| p.matches('*').count() == 1)
            .context(InvalidDestinationSnafu {
                uri: job.destination_uri.clone(),
            })?
            .to_string();

        let (rows, failure, corrupt) = {
            let state = self.state();
            let rows = state.tables.get(job.source).map(|t| t.rows.clone());
            (rows, state.extract_failure.clone(), state.corrupt_shards)
        };

        let outcome = match (failure, rows) {
            (Some(message), _) => JobStatus::failed(message),
            (None, None) => JobStatus::failed(format!("Not found: Table {}", job.source)),
            (None, Some(rows)) => {
                let mut shards = self.encode_shards(&rows)?;
                if corrupt {
                    for shard in &mut shards {
                        *shard = b"{\"not\":\"gzip\"}\n".to_vec();
                    }
                }
                for (index, shard) in shards.into_iter().enumerate() {
                    let path = Path::from(pattern.replacen('*', &format!("{index:012}"), 1));
                    self.storage
                        .put(&path, shard)
                        .await
                        .context(ShardWriteSnafu)?;
                }
                JobStatus::succeeded()
            }
        };

        let mut state = self.state();
        Ok(self.record_job(
            &mut state,
            JobKind::Extract,
            job.destination_uri.clone(),
            outcome,
        ))
    }

    async fn job_status(&self, handle: &JobHandle) -> Result<JobStatus, WarehouseError> {
        let mut state = self.state();
        let job = state
            .jobs
            .get_mut(&handle.job_id)
            .context(UnknownJobSnafu {
                job_id: handle.job_id.clone(),
            })?;

        if job.remaining_polls > 0 {
            job.remaining_polls -= 1;
            return Ok(JobStatus {
                state: JobState::Running,
                error: None,
            });
        }
        Ok(job.outcome.clone())
    }

    async fn table_metadata(&self, table: &TableRef) -> Result<ResultSchema, WarehouseError> {
        let state = self.state();
        let data = state.tables.get(table).context(TableNotFoundSnafu {
            table: table.to_string(),
        })?;

        Ok(ResultSchema {
            columns: data.columns.clone(),
            total_rows: data.rows.len() as u64,
        })
    }

    async fn delete_table(&self, table: &TableRef) -> Result<(), WarehouseError> {
        let mut state = self.state();
        if let Some(message) = state.delete_failure.clone() {
            return Err(WarehouseError::Api {
                status: 403,
                message,
            });
        }
        state.tables.remove(table);
        Ok(())
    }
}
