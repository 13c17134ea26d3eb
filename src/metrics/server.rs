//! Prometheus endpoint for a running export.
//!
//! Exports can spend a long time waiting on warehouse jobs, so the binary
//! optionally serves `/metrics` and `/health` until the export finishes.

use axum::{Extension, Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{MetricsBindSnafu, MetricsError, PrometheusInitSnafu};

/// A metrics endpoint serving in the background.
#[derive(Debug)]
pub struct MetricsServer {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl MetricsServer {
    /// Address actually bound, which differs from the requested one for port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the server to stop after its shutdown token fires.
    pub async fn stopped(self) {
        if let Err(e) = self.task.await {
            error!("Metrics server task failed: {}", e);
        }
    }
}

/// Install the global Prometheus recorder and serve it on `addr`.
///
/// The listener is bound before returning, so an unusable address is an
/// error here rather than a log line later. The server stops when
/// `shutdown` is cancelled.
pub async fn init(
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<MetricsServer, MetricsError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    serve(addr, handle, shutdown).await
}

async fn serve(
    addr: SocketAddr,
    handle: PrometheusHandle,
    shutdown: CancellationToken,
) -> Result<MetricsServer, MetricsError> {
    let listener = TcpListener::bind(addr)
        .await
        .context(MetricsBindSnafu { address: addr })?;
    let local_addr = listener
        .local_addr()
        .context(MetricsBindSnafu { address: addr })?;

    let task = tokio::spawn(async move {
        let result = axum::serve(listener, router(handle))
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;
        match result {
            Ok(()) => debug!("Metrics server on {} stopped", local_addr),
            Err(e) => error!("Metrics server error: {}", e),
        }
    });

    Ok(MetricsServer { local_addr, task })
}

fn router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(Extension(handle))
}

async fn metrics_handler(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}

async fn health_handler() -> &'static str {
    "ok\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::Recorder;

    #[tokio::test]
    async fn test_serves_metrics_until_shutdown() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        recorder
            .register_counter(
                &metrics::Key::from_name("bulkquery_test_total"),
                &metrics::Metadata::new(module_path!(), metrics::Level::INFO, None),
            )
            .increment(3);

        let shutdown = CancellationToken::new();
        let server = serve("127.0.0.1:0".parse().unwrap(), handle, shutdown.clone())
            .await
            .unwrap();
        let base = format!("http://{}", server.local_addr());

        let health = reqwest::get(format!("{base}/health")).await.unwrap();
        assert_eq!(health.text().await.unwrap(), "ok\n");

        let body = reqwest::get(format!("{base}/metrics"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("bulkquery_test_total 3"));

        shutdown.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), server.stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_an_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let handle = PrometheusBuilder::new().build_recorder().handle();
        let err = serve(addr, handle, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MetricsError::MetricsBind { .. }));
    }
}
