//! Retention manager: batched deletion of frames that were not kept.

use crate::config::MAX_DELETE_BATCH;
use crate::object_store::ObjectStore;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Result of a purge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PurgeReport {
    pub deleted: Vec<String>,
    /// Keys still present after the retry
    pub residual: Vec<String>,
    pub batches: usize,
    pub retried_batches: usize,
}

/// Deletes object keys in bounded batches with a single retry per batch.
pub struct RetentionManager {
    store: Arc<dyn ObjectStore>,
    batch_size: usize,
    concurrency: usize,
}

impl RetentionManager {
    pub fn new(store: Arc<dyn ObjectStore>, batch_size: usize, concurrency: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.clamp(1, MAX_DELETE_BATCH),
            concurrency: concurrency.max(1),
        }
    }

    /// Delete `keys` from `container`. Never fails; keys that could not be
    /// removed come back in [`PurgeReport::residual`].
    ///
    /// `keys` must never include a retained frame.
    #[instrument(skip(self, keys), fields(keys = keys.len()))]
    pub async fn purge(&self, container: &str, keys: &[String]) -> PurgeReport {
        if keys.is_empty() {
            return PurgeReport::default();
        }

        let batches: Vec<&[String]> = keys.chunks(self.batch_size).collect();
        let outcomes: Vec<BatchOutcome> = stream::iter(batches.iter().enumerate())
            .map(|(batch_no, batch)| self.delete_with_retry(container, batch_no, batch))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = PurgeReport {
            batches: batches.len(),
            ..Default::default()
        };
        for outcome in outcomes {
            report.deleted.extend(outcome.deleted);
            report.residual.extend(outcome.residual);
            if outcome.retried {
                report.retried_batches += 1;
            }
        }
        report.deleted.sort();
        report.residual.sort();

        metrics::counter!("vigil.frames.deleted").increment(report.deleted.len() as u64);
        if !report.residual.is_empty() {
            metrics::counter!("vigil.delete.residual").increment(report.residual.len() as u64);
            warn!(
                container,
                residual = report.residual.len(),
                keys = ?report.residual,
                "Some frames could not be deleted"
            );
        }

        info!(
            container,
            deleted = report.deleted.len(),
            residual = report.residual.len(),
            batches = report.batches,
            retried = report.retried_batches,
            "Purge finished"
        );

        report
    }

    async fn delete_with_retry(&self, container: &str, batch_no: usize, batch: &[String]) -> BatchOutcome {
        let pending = match self.store.delete_batch(container, batch).await {
            Ok(outcome) if outcome.failed.is_empty() => {
                debug!(batch = batch_no, keys = batch.len(), "Deleted batch");
                return BatchOutcome {
                    deleted: batch.to_vec(),
                    residual: Vec::new(),
                    retried: false,
                };
            }
            Ok(outcome) => {
                warn!(batch = batch_no, failed = outcome.failed.len(), "Batch partially failed, retrying failed keys");
                outcome.failed_keys().map(str::to_string).collect::<Vec<_>>()
            }
            Err(e) => {
                warn!(batch = batch_no, error = %e, "Batch delete failed, retrying");
                batch.to_vec()
            }
        };

        let residual: Vec<String> = match self.store.delete_batch(container, &pending).await {
            Ok(outcome) => outcome.failed_keys().map(str::to_string).collect(),
            Err(e) => {
                warn!(batch = batch_no, error = %e, "Batch delete retry failed");
                pending
            }
        };

        let left: HashSet<&str> = residual.iter().map(String::as_str).collect();
        let deleted = batch
            .iter()
            .filter(|key| !left.contains(key.as_str()))
            .cloned()
            .collect();

        BatchOutcome {
            deleted,
            residual,
            retried: true,
        }
    }
}

struct BatchOutcome {
    deleted: Vec<String>,
    residual: Vec<String>,
    retried: bool,
}
