//! Reclaim stage: delete the temporary table and every shard.
//!
//! Runs only after the local artifact is durable. Every step is attempted
//! even when an earlier one fails; failures are collected, not returned.

use snafu::prelude::*;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::emit;
use crate::error::{DeleteShardSnafu, DeleteTableSnafu, ReclaimError, ReclaimListSnafu};
use crate::metrics::events::{ResourceKind, ResourcesLeaked, ResourcesReclaimed};
use crate::storage::{StorageProviderRef, list_objects};
use crate::warehouse::{TableRef, WarehouseClient};

/// Outcome of a reclaim. Advisory: the export result is already local.
#[derive(Debug, Default)]
pub struct ReclaimReport {
    pub table_deleted: bool,
    pub shards_deleted: usize,
    pub errors: Vec<ReclaimError>,
}

impl ReclaimReport {
    /// True if every temporary resource was removed.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Deletes the temporary resources of one export.
#[derive(Debug, Clone)]
pub struct ResourceReclaimer {
    warehouse: Arc<dyn WarehouseClient>,
    storage: StorageProviderRef,
}

impl ResourceReclaimer {
    pub fn new(warehouse: Arc<dyn WarehouseClient>, storage: StorageProviderRef) -> Self {
        Self { warehouse, storage }
    }

    /// Delete `table`, then every object under `prefix` if one is given.
    ///
    /// The prefix is listed afresh rather than reusing the merge listing.
    pub async fn reclaim(&self, table: &TableRef, prefix: Option<&str>) -> ReclaimReport {
        let mut report = ReclaimReport::default();

        match self
            .warehouse
            .delete_table(table)
            .await
            .context(DeleteTableSnafu {
                table: table.to_string(),
            }) {
            Ok(()) => {
                debug!("Deleted temporary table {}", table);
                report.table_deleted = true;
                emit!(ResourcesReclaimed {
                    kind: ResourceKind::Table,
                    count: 1,
                });
            }
            Err(error) => {
                emit!(ResourcesLeaked {
                    kind: ResourceKind::Table,
                    count: 1,
                });
                report.errors.push(error);
            }
        }

        if let Some(prefix) = prefix {
            self.reclaim_shards(prefix, &mut report).await;
        }

        if report.is_clean() {
            info!(
                "Reclaimed temporary table {} and {} shards",
                table, report.shards_deleted
            );
        } else {
            for error in &report.errors {
                warn!("Temporary resource left behind: {}", error);
            }
        }
        report
    }

    async fn reclaim_shards(&self, prefix: &str, report: &mut ReclaimReport) {
        let shards = match list_objects(&self.storage, prefix)
            .await
            .context(ReclaimListSnafu { prefix })
        {
            Ok(shards) => shards,
            Err(error) => {
                report.errors.push(error);
                return;
            }
        };

        let mut leaked = 0u64;
        for shard in shards {
            match self
                .storage
                .delete(&shard)
                .await
                .context(DeleteShardSnafu {
                    path: shard.to_string(),
                }) {
                Ok(()) => report.shards_deleted += 1,
                Err(error) => {
                    leaked += 1;
                    report.errors.push(error);
                }
            }
        }

        emit!(ResourcesReclaimed {
            kind: ResourceKind::Shard,
            count: report.shards_deleted as u64,
        });
        if leaked > 0 {
            emit!(ResourcesLeaked {
                kind: ResourceKind::Shard,
                count: leaked,
            });
        }
    }
}
