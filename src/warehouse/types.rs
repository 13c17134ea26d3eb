//! Warehouse-side data types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Fully-qualified table identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRef {
    #[serde(rename = "projectId")]
    pub project: String,
    #[serde(rename = "datasetId")]
    pub dataset: String,
    #[serde(rename = "tableId")]
    pub table: String,
}

impl TableRef {
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

/// Reference to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle {
    pub job_id: String,
    pub location: Option<String>,
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{}:{}", location, self.job_id),
            None => f.write_str(&self.job_id),
        }
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Done,
}

/// Snapshot of a job's status.
///
/// A `Done` job with an `error` failed; without one it succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub state: JobState,
    pub error: Option<String>,
}

impl JobStatus {
    pub fn running() -> Self {
        Self {
            state: JobState::Running,
            error: None,
        }
    }

    pub fn succeeded() -> Self {
        Self {
            state: JobState::Done,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: JobState::Done,
            error: Some(message.into()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state == JobState::Done
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreateDisposition {
    CreateIfNeeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteDisposition {
    WriteTruncate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryPriority {
    #[default]
    Interactive,
    Batch,
}

/// Warehouse-specific execution options for a query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub use_legacy_sql: bool,
    pub priority: QueryPriority,
    /// Fail the job instead of billing more than this many bytes.
    pub maximum_bytes_billed: Option<i64>,
    pub labels: BTreeMap<String, String>,
}

/// SQL text plus execution options. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    sql: String,
    options: QueryOptions,
}

impl QueryRequest {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            options: QueryOptions::default(),
        }
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_priority(mut self, priority: QueryPriority) -> Self {
        self.options.priority = priority;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_maximum_bytes_billed(mut self, bytes: i64) -> Self {
        self.options.maximum_bytes_billed = Some(bytes);
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }
}

/// A query to run into a destination table.
#[derive(Debug, Clone)]
pub struct QueryJob<'a> {
    pub request: &'a QueryRequest,
    pub destination: &'a TableRef,
    pub create_disposition: CreateDisposition,
    pub write_disposition: WriteDisposition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DestinationFormat {
    NewlineDelimitedJson,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtractCompression {
    Gzip,
}

/// An export of a table into object storage.
#[derive(Debug, Clone)]
pub struct ExtractJob<'a> {
    pub source: &'a TableRef,
    /// Wildcard URI; the warehouse substitutes shard numbers for `*`.
    pub destination_uri: String,
    pub format: DestinationFormat,
    pub compression: ExtractCompression,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColumnMode {
    #[default]
    Nullable,
    Required,
    Repeated,
}

/// One column of a result schema. Record columns nest their children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub mode: ColumnMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<ColumnSchema>,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            mode: ColumnMode::Nullable,
            fields: Vec::new(),
        }
    }

    pub fn with_mode(mut self, mode: ColumnMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Columns and row count of a materialized result, as the warehouse reports them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSchema {
    pub columns: Vec<ColumnSchema>,
    pub total_rows: u64,
}

impl ResultSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_schema_deserializes_nested_records() {
        let json = r#"[
            {"name": "id", "type": "INTEGER", "mode": "REQUIRED"},
            {"name": "tags", "type": "STRING", "mode": "REPEATED"},
            {"name": "address", "type": "RECORD", "fields": [
                {"name": "city", "type": "STRING"}
            ]}
        ]"#;
        let columns: Vec<ColumnSchema> = serde_json::from_str(json).unwrap();

        assert_eq!(columns[0].mode, ColumnMode::Required);
        assert_eq!(columns[1].mode, ColumnMode::Repeated);
        assert_eq!(columns[2].mode, ColumnMode::Nullable);
        assert_eq!(columns[2].fields, vec![ColumnSchema::new("city", "STRING")]);
    }

    #[test]
    fn test_query_request_builder() {
        let request = QueryRequest::new("SELECT 1")
            .with_priority(QueryPriority::Batch)
            .with_label("team", "data")
            .with_maximum_bytes_billed(1 << 30);

        assert_eq!(request.sql(), "SELECT 1");
        assert_eq!(request.options().priority, QueryPriority::Batch);
        assert_eq!(request.options().labels["team"], "data");
        assert_eq!(request.options().maximum_bytes_billed, Some(1 << 30));
    }

    #[test]
    fn test_table_ref_display() {
        let table = TableRef::new("p", "tmp", "a_b_c");
        assert_eq!(table.to_string(), "p.tmp.a_b_c");
        let json = serde_json::to_value(&table).unwrap();
        assert_eq!(json["datasetId"], "tmp");
    }
}
