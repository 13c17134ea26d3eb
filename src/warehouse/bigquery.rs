//! BigQuery v2 REST client.
//!
//! Jobs are inserted with a client-chosen job id, so a retried insert that
//! the server already accepted comes back as 409 and is treated as success.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{Value, json};
use snafu::prelude::*;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{
    ColumnSchema, ExtractJob, JobHandle, JobState, JobStatus, QueryJob, ResultSchema, TableRef,
    WarehouseClient,
};
use crate::emit;
use crate::error::{
    ClientBuildSnafu, HttpSnafu, ResponseDecodeSnafu, TableNotFoundSnafu, UnknownJobSnafu,
    WarehouseError,
};
use crate::metrics::events::{JobKind, JobSubmitted};

/// Connection settings for [`BigQueryClient`].
#[derive(Debug, Clone)]
pub struct BigQueryConfig {
    /// Project that runs the jobs.
    pub project: String,
    /// Processing location, forwarded on job inserts and status lookups.
    pub location: Option<String>,
    /// OAuth2 bearer token. Requests are unauthenticated without one.
    pub access_token: Option<String>,
    /// API base URL without a trailing slash.
    pub api_url: String,
    pub request_timeout: Duration,
    /// Retries for throttled or unavailable responses.
    pub max_retries: u32,
    /// Delay before the first retry, doubled per attempt.
    pub retry_delay: Duration,
}

impl Default for BigQueryConfig {
    fn default() -> Self {
        Self {
            project: String::new(),
            location: None,
            access_token: None,
            api_url: "https://bigquery.googleapis.com/bigquery/v2".to_string(),
            request_timeout: Duration::from_secs(60),
            max_retries: 5,
            retry_delay: Duration::from_millis(1000),
        }
    }
}

/// [`WarehouseClient`] backed by the BigQuery REST API.
#[derive(Debug)]
pub struct BigQueryClient {
    client: Client,
    config: BigQueryConfig,
}

impl BigQueryClient {
    pub fn new(config: BigQueryConfig) -> Result<Self, WarehouseError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("bulkquery/", env!("CARGO_PKG_VERSION")))
            .build()
            .context(ClientBuildSnafu)?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &BigQueryConfig {
        &self.config
    }

    fn jobs_url(&self) -> String {
        format!("{}/projects/{}/jobs", self.config.api_url, self.config.project)
    }

    fn job_url(&self, job_id: &str) -> String {
        format!("{}/{}", self.jobs_url(), job_id)
    }

    fn table_url(&self, table: &TableRef) -> String {
        format!(
            "{}/projects/{}/datasets/{}/tables/{}",
            self.config.api_url, table.project, table.dataset, table.table
        )
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.access_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Send a request, retrying throttled and unavailable responses with
    /// exponential backoff. Non-success responses are returned to the caller.
    async fn send(
        &self,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<Response, WarehouseError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let request = self.authorize(build());

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if is_retryable_status(status) && attempts <= self.config.max_retries {
                        warn!(
                            "Request failed with {} (attempt {}/{}), retrying...",
                            status,
                            attempts,
                            self.config.max_retries + 1
                        );
                        self.wait_for_retry(attempts).await;
                        continue;
                    }
                    return Ok(response);
                }
                Err(e) if is_retryable_error(&e) && attempts <= self.config.max_retries => {
                    warn!(
                        "Request failed with error (attempt {}/{}): {}, retrying...",
                        attempts,
                        self.config.max_retries + 1,
                        e
                    );
                    self.wait_for_retry(attempts).await;
                }
                Err(source) => return Err(WarehouseError::Http { source }),
            }
        }
    }

    async fn wait_for_retry(&self, attempt: u32) {
        let delay = self.config.retry_delay * 2u32.saturating_pow(attempt.saturating_sub(1));
        debug!("Waiting {:?} before retry", delay);
        sleep(delay).await;
    }

    async fn insert_job(
        &self,
        kind: JobKind,
        configuration: Value,
    ) -> Result<JobHandle, WarehouseError> {
        let job_id = format!("bulkquery_{}", uuid::Uuid::new_v4().simple());
        let body = job_body(
            &self.config.project,
            &job_id,
            self.config.location.as_deref(),
            configuration,
        );
        let url = self.jobs_url();

        debug!("Inserting {} job {}", kind.as_str(), job_id);
        let response = self.send(|| self.client.post(&url).json(&body)).await?;
        let status = response.status();

        if status == StatusCode::CONFLICT {
            debug!("Job {} already exists, treating insert as accepted", job_id);
        } else if !status.is_success() {
            return Err(api_error(response).await);
        }

        emit!(JobSubmitted { kind });
        Ok(JobHandle {
            job_id,
            location: self.config.location.clone(),
        })
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect()
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Extract the warehouse's own message from an error body, falling back to
/// the raw text.
fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed.error.message,
        Err(_) => body.trim().to_string(),
    }
}

async fn api_error(response: Response) -> WarehouseError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    WarehouseError::Api {
        status,
        message: error_message(&body),
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, WarehouseError> {
    let body = response.text().await.context(HttpSnafu)?;
    serde_json::from_str(&body).context(ResponseDecodeSnafu)
}

#[derive(Debug, Deserialize)]
struct JobResource {
    status: JobResourceStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResourceStatus {
    state: JobState,
    #[serde(default)]
    error_result: Option<ErrorDetail>,
}

impl From<JobResourceStatus> for JobStatus {
    fn from(status: JobResourceStatus) -> Self {
        JobStatus {
            state: status.state,
            error: status.error_result.map(|e| e.message),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableResource {
    #[serde(default)]
    schema: Option<TableSchema>,
    #[serde(default, deserialize_with = "decimal_string")]
    num_rows: u64,
}

/// Int64 fields arrive as decimal strings.
fn decimal_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let text = String::deserialize(deserializer)?;
    text.parse().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<ColumnSchema>,
}

impl From<TableResource> for ResultSchema {
    fn from(resource: TableResource) -> Self {
        ResultSchema {
            columns: resource.schema.map(|s| s.fields).unwrap_or_default(),
            total_rows: resource.num_rows,
        }
    }
}

fn job_body(project: &str, job_id: &str, location: Option<&str>, configuration: Value) -> Value {
    let mut reference = json!({ "projectId": project, "jobId": job_id });
    if let Some(location) = location {
        reference["location"] = json!(location);
    }
    json!({ "jobReference": reference, "configuration": configuration })
}

fn query_configuration(job: &QueryJob<'_>) -> Value {
    let options = job.request.options();
    let mut query = json!({
        "query": job.request.sql(),
        "useLegacySql": options.use_legacy_sql,
        "priority": options.priority,
        "destinationTable": job.destination,
        "createDisposition": job.create_disposition,
        "writeDisposition": job.write_disposition,
        "allowLargeResults": true,
    });
    if let Some(bytes) = options.maximum_bytes_billed {
        query["maximumBytesBilled"] = json!(bytes.to_string());
    }

    let mut configuration = json!({ "query": query });
    if !options.labels.is_empty() {
        configuration["labels"] = json!(options.labels);
    }
    configuration
}

fn extract_configuration(job: &ExtractJob<'_>) -> Value {
    json!({
        "extract": {
            "sourceTable": job.source,
            "destinationUris": [job.destination_uri],
            "destinationFormat": job.format,
            "compression": job.compression,
        }
    })
}

#[async_trait]
impl WarehouseClient for BigQueryClient {
    async fn submit_query(&self, job: &QueryJob<'_>) -> Result<JobHandle, WarehouseError> {
        self.insert_job(JobKind::Query, query_configuration(job))
            .await
    }

    async fn submit_extract(&self, job: &ExtractJob<'_>) -> Result<JobHandle, WarehouseError> {
        self.insert_job(JobKind::Extract, extract_configuration(job))
            .await
    }

    async fn job_status(&self, handle: &JobHandle) -> Result<JobStatus, WarehouseError> {
        let url = self.job_url(&handle.job_id);
        let response = self
            .send(|| {
                let request = self.client.get(&url);
                match &handle.location {
                    Some(location) => request.query(&[("location", location)]),
                    None => request,
                }
            })
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => UnknownJobSnafu {
                job_id: handle.job_id.clone(),
            }
            .fail(),
            status if status.is_success() => {
                let job: JobResource = decode(response).await?;
                Ok(job.status.into())
            }
            _ => Err(api_error(response).await),
        }
    }

    async fn table_metadata(&self, table: &TableRef) -> Result<ResultSchema, WarehouseError> {
        let url = self.table_url(table);
        let response = self.send(|| self.client.get(&url)).await?;

        match response.status() {
            StatusCode::NOT_FOUND => TableNotFoundSnafu {
                table: table.to_string(),
            }
            .fail(),
            status if status.is_success() => {
                let resource: TableResource = decode(response).await?;
                Ok(resource.into())
            }
            _ => Err(api_error(response).await),
        }
    }

    async fn delete_table(&self, table: &TableRef) -> Result<(), WarehouseError> {
        let url = self.table_url(table);
        let response = self.send(|| self.client.delete(&url)).await?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!("Table {} already gone", table);
                Ok(())
            }
            status if status.is_success() => Ok(()),
            _ => Err(api_error(response).await),
        }
    }
}
