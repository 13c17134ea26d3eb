//! Waiting on warehouse jobs.
//!
//! Jobs are polled until they reach a terminal state. The delay between
//! polls starts at `poll_interval` and doubles up to `max_poll_interval`.
//! Waits abort on cancellation or when the optional deadline passes; the
//! job itself keeps running on the warehouse side.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::emit;
use crate::error::WarehouseError;
use crate::metrics::events::{JobFinished, JobKind, JobOutcome};
use crate::warehouse::{JobHandle, JobStatus, WarehouseClient};

/// Poll settings for [`wait_for_job`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitConfig {
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
    /// Give up after this long. `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_poll_interval: Duration::from_secs(10),
            timeout: None,
        }
    }
}

impl WaitConfig {
    fn next_interval(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_poll_interval.max(self.poll_interval))
    }
}

/// Run `fut` to completion, or until `deadline` passes.
async fn before_deadline<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Poll `handle` until the job finishes.
///
/// Returns the final status of a successful job. A job that finishes with an
/// error becomes [`WarehouseError::JobFailed`] carrying the warehouse's
/// message unmodified.
///
/// The deadline bounds the status requests as well as the sleeps between
/// them. The last sleep is shortened so one final poll lands on the deadline.
pub async fn wait_for_job(
    warehouse: &dyn WarehouseClient,
    handle: &JobHandle,
    kind: JobKind,
    config: &WaitConfig,
    cancel: &CancellationToken,
) -> Result<JobStatus, WarehouseError> {
    let start = Instant::now();
    let deadline = config.timeout.map(|t| start + t);
    let mut interval = config.poll_interval;
    let mut polls = 0u64;

    let finish = |outcome: JobOutcome, polls: u64| {
        emit!(JobFinished {
            kind,
            outcome,
            duration: start.elapsed(),
            polls,
        });
    };
    let timed_out = |polls: u64| {
        finish(JobOutcome::TimedOut, polls);
        WarehouseError::WaitTimeout {
            job_id: handle.job_id.clone(),
            timeout: config.timeout.unwrap_or_default(),
        }
    };

    loop {
        let polled = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!(job_id = %handle.job_id, "Cancelled while waiting for {} job", kind.as_str());
                finish(JobOutcome::Cancelled, polls);
                return Err(WarehouseError::WaitCancelled { job_id: handle.job_id.clone() });
            }

            polled = before_deadline(deadline, warehouse.job_status(handle)) => polled,
        };
        let Some(status) = polled else {
            debug!(job_id = %handle.job_id, "Status request still pending at deadline");
            return Err(timed_out(polls));
        };
        let status = status?;
        polls += 1;

        if status.is_terminal() {
            return match status.error {
                Some(message) => {
                    finish(JobOutcome::Failed, polls);
                    Err(WarehouseError::JobFailed {
                        job_id: handle.job_id.clone(),
                        message,
                    })
                }
                None => {
                    debug!(job_id = %handle.job_id, polls, "{} job done", kind.as_str());
                    finish(JobOutcome::Succeeded, polls);
                    Ok(status)
                }
            };
        }

        let mut pause = interval;
        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(timed_out(polls));
            }
            pause = pause.min(remaining);
        }

        debug!(
            job_id = %handle.job_id,
            state = ?status.state,
            "Job still running, next poll in {:?}",
            pause
        );
        if cancel
            .run_until_cancelled(tokio::time::sleep(pause))
            .await
            .is_none()
        {
            finish(JobOutcome::Cancelled, polls);
            return Err(WarehouseError::WaitCancelled {
                job_id: handle.job_id.clone(),
            });
        }
        interval = config.next_interval(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageProvider;
    use crate::warehouse::{
        CreateDisposition, MemoryWarehouse, QueryJob, QueryRequest, TableRef, WriteDisposition,
    };
    use crate::warehouse::{ExtractJob, ResultSchema};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    /// Accepts jobs but never answers a status request.
    #[derive(Debug)]
    struct StalledWarehouse;

    #[async_trait]
    impl WarehouseClient for StalledWarehouse {
        async fn submit_query(&self, _: &QueryJob<'_>) -> Result<JobHandle, WarehouseError> {
            unreachable!()
        }

        async fn submit_extract(&self, _: &ExtractJob<'_>) -> Result<JobHandle, WarehouseError> {
            unreachable!()
        }

        async fn job_status(&self, _: &JobHandle) -> Result<JobStatus, WarehouseError> {
            std::future::pending().await
        }

        async fn table_metadata(&self, _: &TableRef) -> Result<ResultSchema, WarehouseError> {
            unreachable!()
        }

        async fn delete_table(&self, _: &TableRef) -> Result<(), WarehouseError> {
            unreachable!()
        }
    }

    fn fast_wait() -> WaitConfig {
        WaitConfig {
            poll_interval: Duration::from_millis(1),
            max_poll_interval: Duration::from_millis(4),
            timeout: None,
        }
    }

    async fn submit(warehouse: &MemoryWarehouse, sql: &str) -> JobHandle {
        let request = QueryRequest::new(sql);
        let table = TableRef::new("p", "tmp", "t");
        warehouse
            .submit_query(&QueryJob {
                request: &request,
                destination: &table,
                create_disposition: CreateDisposition::CreateIfNeeded,
                write_disposition: WriteDisposition::WriteTruncate,
            })
            .await
            .unwrap()
    }

    fn warehouse(pending_polls: u32) -> MemoryWarehouse {
        let warehouse = MemoryWarehouse::new("p", Arc::new(StorageProvider::in_memory()))
            .with_pending_polls(pending_polls);
        warehouse.register_result("SELECT 1", Vec::new(), vec![json!({"x": 1})]);
        warehouse
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = fast_wait();
        assert_eq!(
            config.next_interval(Duration::from_millis(1)),
            Duration::from_millis(2)
        );
        assert_eq!(
            config.next_interval(Duration::from_millis(3)),
            Duration::from_millis(4)
        );
    }

    #[tokio::test]
    async fn test_waits_until_done() {
        let warehouse = warehouse(3);
        let handle = submit(&warehouse, "SELECT 1").await;

        let status = wait_for_job(
            &warehouse,
            &handle,
            JobKind::Query,
            &fast_wait(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(status, JobStatus::succeeded());
    }

    #[tokio::test]
    async fn test_failed_job_keeps_message() {
        let warehouse = warehouse(0);
        warehouse.fail_query("SELECT broken", "Unrecognized name: broken at [1:8]");
        let handle = submit(&warehouse, "SELECT broken").await;

        let err = wait_for_job(
            &warehouse,
            &handle,
            JobKind::Query,
            &fast_wait(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        match err {
            WarehouseError::JobFailed { message, .. } => {
                assert_eq!(message, "Unrecognized name: broken at [1:8]");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_aborts_wait() {
        let warehouse = warehouse(u32::MAX);
        let handle = submit(&warehouse, "SELECT 1").await;
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_job(&warehouse, &handle, JobKind::Query, &fast_wait(), &cancel),
        )
        .await
        .expect("wait should stop promptly")
        .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_deadline() {
        let warehouse = warehouse(u32::MAX);
        let handle = submit(&warehouse, "SELECT 1").await;
        let config = WaitConfig {
            timeout: Some(Duration::from_millis(10)),
            ..fast_wait()
        };

        let err = wait_for_job(
            &warehouse,
            &handle,
            JobKind::Extract,
            &config,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WarehouseError::WaitTimeout { .. }));
    }

    #[tokio::test]
    async fn test_deadline_bounds_a_hanging_status_request() {
        let handle = JobHandle {
            job_id: "stuck".to_string(),
            location: None,
        };
        let config = WaitConfig {
            timeout: Some(Duration::from_millis(30)),
            ..fast_wait()
        };

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_job(
                &StalledWarehouse,
                &handle,
                JobKind::Query,
                &config,
                &CancellationToken::new(),
            ),
        )
        .await
        .expect("wait should end at the deadline")
        .unwrap_err();
        assert!(matches!(err, WarehouseError::WaitTimeout { .. }));
    }

    #[tokio::test]
    async fn test_last_poll_is_clamped_to_the_deadline() {
        // The poll interval is longer than the timeout, so the only chance to
        // see the job finish is a shortened sleep and a poll at the deadline
        let warehouse = warehouse(1);
        let handle = submit(&warehouse, "SELECT 1").await;
        let config = WaitConfig {
            poll_interval: Duration::from_secs(60),
            max_poll_interval: Duration::from_secs(60),
            timeout: Some(Duration::from_millis(50)),
        };

        let started = std::time::Instant::now();
        let status = wait_for_job(
            &warehouse,
            &handle,
            JobKind::Query,
            &config,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(status, JobStatus::succeeded());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
