//! # Retention / Cleanup
//!
//! Deletes backup artifacts older than the retention horizon in bulk
//! batches, serialized behind the object-store breaker. Scheduling is the
//! orchestrator's job: cleanup runs on startup or after a successful backup
//! and never concurrently with the pipeline.
//!
//! Dry-run mode enumerates deletion candidates and returns size totals
//! without issuing a single delete call.

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::logging::{log_info, LogCategory};
use crate::resilient_clients::ResilientObjectStore;
use crate::runtime_config::RetentionConfig;
use crate::Result;

/// Prefix every backup artifact lives under
const BACKUP_PREFIX: &str = "backups/";

/// Outcome of one cleanup pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Objects whose last-modified fell strictly before the horizon
    pub candidates: u64,
    /// Objects actually deleted (zero in dry-run)
    pub deleted: u64,
    /// Total size of the candidates
    pub bytes: u64,
    pub dry_run: bool,
    pub horizon: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Batch-deleting retention pass over the backup bucket
pub struct RetentionManager {
    store: Arc<ResilientObjectStore>,
    config: RetentionConfig,
}

impl RetentionManager {
    pub fn new(store: Arc<ResilientObjectStore>, config: RetentionConfig) -> Self {
        Self { store, config }
    }

    /// Enumerate candidates and delete them in batches
    ///
    /// An object is targeted when its `last_modified` is strictly before
    /// `now - retention_days` at the start of the run.
    pub async fn run_cleanup(&self, cancel: &CancellationToken) -> Result<CleanupReport> {
        let started = Instant::now();
        let horizon = Utc::now() - Duration::days(self.config.retention_days as i64);

        log_info(
            LogCategory::Retention,
            &format!(
                "Cleanup starting (horizon: {horizon}, dry run: {})",
                self.config.dry_run
            ),
        );

        let all = self.store.list_all(cancel, BACKUP_PREFIX).await?;
        let candidates: Vec<_> = all
            .into_iter()
            .filter(|object| object.last_modified < horizon)
            .collect();
        let candidate_count = candidates.len() as u64;
        let bytes: u64 = candidates.iter().map(|o| o.size).sum();

        let mut deleted = 0u64;
        if !self.config.dry_run {
            for batch in candidates.chunks(self.config.cleanup_batch_size) {
                if cancel.is_cancelled() {
                    // Partial batch progress is fine: deletions are idempotent
                    return Err(crate::BackupForgeError::Cancelled);
                }
                let keys: Vec<String> = batch.iter().map(|o| o.key.clone()).collect();
                self.store.delete_objects(cancel, &keys).await?;
                deleted += keys.len() as u64;
            }
        }

        let report = CleanupReport {
            candidates: candidate_count,
            deleted,
            bytes,
            dry_run: self.config.dry_run,
            horizon,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        counter!("retention_candidates_total", report.candidates);
        counter!("retention_deleted_total", report.deleted);
        histogram!("retention_duration_ms", report.duration_ms as f64);
        log_info(
            LogCategory::Retention,
            &format!(
                "Cleanup finished: {} candidates, {} deleted, {} bytes ({}ms)",
                report.candidates, report.deleted, report.bytes, report.duration_ms
            ),
        );
        Ok(report)
    }
}
