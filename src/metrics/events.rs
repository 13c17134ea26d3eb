//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the export
//! pipeline. Events implement the `InternalEvent` trait which emits the
//! corresponding metric.

use metrics::{counter, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

// ============ Storage ============

/// Kind of storage operation.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    List,
    Get,
    Put,
    Delete,
}

impl StorageOperation {
    fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::List => "list",
            StorageOperation::Get => "get",
            StorageOperation::Put => "put",
            StorageOperation::Delete => "delete",
        }
    }
}

/// Outcome of a request against an external collaborator.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }

    /// Status for a result.
    pub fn of<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            RequestStatus::Success
        } else {
            RequestStatus::Error
        }
    }
}

/// Event emitted for each storage request.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            "Storage request"
        );
        counter!(
            "bulkquery_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

/// Event emitted with the latency of a storage request.
pub struct StorageRequestDuration {
    pub operation: StorageOperation,
    pub duration: Duration,
}

impl InternalEvent for StorageRequestDuration {
    fn emit(self) {
        histogram!(
            "bulkquery_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}

// ============ Warehouse jobs ============

/// Kind of warehouse job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Query,
    Extract,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Query => "query",
            JobKind::Extract => "extract",
        }
    }
}

/// Event emitted when a job is submitted to the warehouse.
pub struct JobSubmitted {
    pub kind: JobKind,
}

impl InternalEvent for JobSubmitted {
    fn emit(self) {
        trace!(kind = self.kind.as_str(), "Job submitted");
        counter!("bulkquery_jobs_submitted_total", "kind" => self.kind.as_str()).increment(1);
    }
}

/// Terminal outcome of waiting on a job.
#[derive(Debug, Clone, Copy)]
pub enum JobOutcome {
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl JobOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Succeeded => "succeeded",
            JobOutcome::Failed => "failed",
            JobOutcome::Cancelled => "cancelled",
            JobOutcome::TimedOut => "timed_out",
        }
    }
}

/// Event emitted when a job wait ends.
pub struct JobFinished {
    pub kind: JobKind,
    pub outcome: JobOutcome,
    pub duration: Duration,
    pub polls: u64,
}

impl InternalEvent for JobFinished {
    fn emit(self) {
        trace!(
            kind = self.kind.as_str(),
            outcome = self.outcome.as_str(),
            polls = self.polls,
            "Job finished"
        );
        counter!(
            "bulkquery_jobs_finished_total",
            "kind" => self.kind.as_str(),
            "outcome" => self.outcome.as_str()
        )
        .increment(1);
        counter!("bulkquery_job_polls_total", "kind" => self.kind.as_str()).increment(self.polls);
        histogram!("bulkquery_job_wait_seconds", "kind" => self.kind.as_str())
            .record(self.duration.as_secs_f64());
    }
}

// ============ Merge ============

/// Event emitted after a shard has been copied into the local artifact.
pub struct ShardMerged {
    pub compressed_bytes: u64,
    pub decompressed_bytes: u64,
}

impl InternalEvent for ShardMerged {
    fn emit(self) {
        trace!(
            compressed_bytes = self.compressed_bytes,
            decompressed_bytes = self.decompressed_bytes,
            "Shard merged"
        );
        counter!("bulkquery_shards_merged_total").increment(1);
        counter!("bulkquery_bytes_read_total").increment(self.compressed_bytes);
        counter!("bulkquery_bytes_decompressed_total").increment(self.decompressed_bytes);
    }
}

/// Event emitted with the total duration of a merge.
pub struct MergeDuration {
    pub duration: Duration,
}

impl InternalEvent for MergeDuration {
    fn emit(self) {
        histogram!("bulkquery_merge_duration_seconds").record(self.duration.as_secs_f64());
    }
}

// ============ Reclaim ============

/// Kind of temporary remote resource.
#[derive(Debug, Clone, Copy)]
pub enum ResourceKind {
    Table,
    Shard,
}

impl ResourceKind {
    fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Table => "table",
            ResourceKind::Shard => "shard",
        }
    }
}

/// Event emitted when temporary resources are deleted.
pub struct ResourcesReclaimed {
    pub kind: ResourceKind,
    pub count: u64,
}

impl InternalEvent for ResourcesReclaimed {
    fn emit(self) {
        trace!(kind = self.kind.as_str(), count = self.count, "Resources reclaimed");
        counter!("bulkquery_resources_reclaimed_total", "kind" => self.kind.as_str())
            .increment(self.count);
    }
}

/// Event emitted when temporary resources could not be deleted.
pub struct ResourcesLeaked {
    pub kind: ResourceKind,
    pub count: u64,
}

impl InternalEvent for ResourcesLeaked {
    fn emit(self) {
        trace!(kind = self.kind.as_str(), count = self.count, "Resources leaked");
        counter!("bulkquery_resources_leaked_total", "kind" => self.kind.as_str())
            .increment(self.count);
    }
}

// ============ Export ============

/// Event emitted when an export finishes, successfully or not.
pub struct ExportCompleted {
    pub status: RequestStatus,
    pub stage: &'static str,
    pub duration: Duration,
}

impl InternalEvent for ExportCompleted {
    fn emit(self) {
        trace!(
            status = self.status.as_str(),
            stage = self.stage,
            "Export completed"
        );
        counter!(
            "bulkquery_exports_total",
            "status" => self.status.as_str(),
            "stage" => self.stage
        )
        .increment(1);
        histogram!("bulkquery_export_duration_seconds").record(self.duration.as_secs_f64());
    }
}

/// Event emitted when records are decoded from the local artifact.
pub struct RecordsDecoded {
    pub count: u64,
}

impl InternalEvent for RecordsDecoded {
    fn emit(self) {
        counter!("bulkquery_records_decoded_total").increment(self.count);
    }
}
