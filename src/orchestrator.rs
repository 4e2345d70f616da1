//! # Orchestrator
//!
//! Linearizes one backup run: construct resilient clients, detect the
//! cluster, load the priority policy, optionally run startup cleanup, run
//! the pipeline under a short top-level retry, optionally run post-backup
//! cleanup, and publish the completion event.
//!
//! Every external step rides its dependency's breaker. A circuit-open
//! surfacing at this envelope halts the run and is reported distinctly from
//! ordinary failures (exit code 2 vs 1); cleanup is sequenced on this task
//! so it never overlaps the pipeline.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backup_pipeline::{BackupJobSpec, BackupManifest, BackupPipeline};
use crate::cluster_detect::{ClusterDetector, ClusterIdentity};
use crate::discovery_filter::DiscoveryEngine;
use crate::integration_bridge::{EventBus, PipelineEvent};
use crate::logging::{log_error, log_info, LogCategory};
use crate::priority_engine::{PriorityEngine, PriorityPolicy};
use crate::resilience_core::{BreakerManager, RetryConfig, RetryExecutor};
use crate::resilient_clients::{
    ClusterApiBackend, ObjectStoreBackend, ResilientClusterApi, ResilientObjectStore,
};
use crate::retention::{CleanupReport, RetentionManager};
use crate::runtime_config::BackupConfig;
use crate::{BackupForgeError, Result, RunMetrics};

/// Everything a completed run produced
#[derive(Debug, Clone)]
pub struct BackupRunReport {
    pub manifest: BackupManifest,
    pub manifest_key: String,
    pub identity: ClusterIdentity,
    pub startup_cleanup: Option<CleanupReport>,
    pub post_cleanup: Option<CleanupReport>,
    pub metrics: RunMetrics,
}

/// Drives end-to-end backup runs with resilience at every seam
pub struct BackupOrchestrator {
    config: BackupConfig,
    breakers: Arc<BreakerManager>,
    api: Arc<ResilientClusterApi>,
    store: Arc<ResilientObjectStore>,
    detector: ClusterDetector,
    priorities: Arc<PriorityEngine>,
    events: Option<Arc<EventBus>>,
    cancel: CancellationToken,
    run_active: Arc<AtomicBool>,
}

impl BackupOrchestrator {
    /// Construct the orchestrator and its resilient clients
    pub async fn new(
        config: BackupConfig,
        object_store: Arc<dyn ObjectStoreBackend>,
        cluster_api: Arc<dyn ClusterApiBackend>,
    ) -> Result<Self> {
        config.validate()?;

        let breakers = Arc::new(BreakerManager::new());
        let api = Arc::new(ResilientClusterApi::new(cluster_api, &breakers));
        let store = Arc::new(ResilientObjectStore::new(
            object_store,
            &breakers,
            config.object_store.clone(),
        ));
        let detector = ClusterDetector::new(api.clone());
        let priorities = Arc::new(PriorityEngine::new(PriorityPolicy {
            max_concurrent_per_kind: config.pipeline.max_concurrent_per_kind,
            ..PriorityPolicy::default()
        }));

        Ok(Self {
            config,
            breakers,
            api,
            store,
            detector,
            priorities,
            events: None,
            cancel: CancellationToken::new(),
            run_active: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Wire the integration bridge's event bus into this orchestrator
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Replace the default priority policy
    pub fn with_priority_policy(mut self, policy: PriorityPolicy) -> Self {
        self.priorities = Arc::new(PriorityEngine::new(policy));
        self
    }

    /// Token cancelled on shutdown; cancelling it externally also stops the
    /// current run
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn breakers(&self) -> &Arc<BreakerManager> {
        &self.breakers
    }

    /// Execute one end-to-end backup run
    pub async fn run_backup(&mut self) -> Result<BackupRunReport> {
        self.run_active.store(true, Ordering::SeqCst);
        let result = self.run_backup_inner().await;
        self.run_active.store(false, Ordering::SeqCst);

        if let Err(e) = &result {
            if e.is_circuit_open() {
                log_error(
                    LogCategory::Backup,
                    &format!("Backup halted by open circuit: {e}"),
                );
            } else if !e.is_cancelled() {
                log_error(LogCategory::Backup, &format!("Backup run failed: {e}"));
            }
        }
        result
    }

    async fn run_backup_inner(&mut self) -> Result<BackupRunReport> {
        let mut metrics = RunMetrics::new();
        let job_id = Uuid::new_v4().to_string();

        // The job deadline dominates every per-dependency timeout
        let run_cancel = self.cancel.child_token();
        let deadline = Duration::from_secs(self.config.pipeline.job_deadline_secs);
        let deadline_guard = tokio::spawn({
            let run_cancel = run_cancel.clone();
            async move {
                tokio::time::sleep(deadline).await;
                run_cancel.cancel();
            }
        });

        let outcome = self
            .run_phases(&run_cancel, &job_id, &mut metrics)
            .await;
        deadline_guard.abort();

        // Deadline expiry shows up as cancellation on the child token only
        if run_cancel.is_cancelled() && !self.cancel.is_cancelled() {
            if let Err(e) = &outcome {
                if e.is_cancelled() {
                    return Err(BackupForgeError::Timeout {
                        operation: format!("backup job {job_id}"),
                        timeout_ms: deadline.as_millis() as u64,
                    });
                }
            }
        }
        outcome
    }

    async fn run_phases(
        &mut self,
        cancel: &CancellationToken,
        job_id: &str,
        metrics: &mut RunMetrics,
    ) -> Result<BackupRunReport> {
        log_info(
            LogCategory::Backup,
            &format!("Backup job {job_id} starting"),
        );

        // Object store readiness (bucket selection, auto-create, fallbacks)
        let phase = Instant::now();
        self.store.ensure_bucket(cancel).await?;
        metrics.config_load_ms = phase.elapsed().as_millis() as u64;

        // Cluster detection
        let phase = Instant::now();
        let identity = self.detector.detect(cancel, &self.config.cluster).await?;
        metrics.detection_ms = phase.elapsed().as_millis() as u64;

        self.publish(PipelineEvent::BackupStarted {
            backup_id: job_id.to_string(),
            cluster: identity.name.clone(),
        });

        // Startup cleanup, strictly before the pipeline
        let mut startup_cleanup = None;
        if self.config.retention.enable_cleanup && self.config.retention.cleanup_on_startup {
            startup_cleanup = Some(self.run_cleanup(cancel, metrics).await?);
        }

        // Discovery
        let phase = Instant::now();
        let discovery = DiscoveryEngine::new(self.api.clone(), self.priorities.clone());
        let items = discovery.discover(cancel, &self.config.scope).await?;
        metrics.discovery_ms = phase.elapsed().as_millis() as u64;

        let spec = BackupJobSpec {
            job_id: job_id.to_string(),
            cluster: identity.clone(),
            scope: self.config.scope.clone(),
            started_at: Utc::now(),
        };

        // The whole pipeline step sits inside a short top-level retry; a
        // circuit-open or cancellation passes straight through
        let pipeline = BackupPipeline::new(
            self.api.clone(),
            self.store.clone(),
            self.priorities.clone(),
            self.config.pipeline.clone(),
        );
        let top_retry = RetryExecutor::new(RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter_pct: 0.1,
        })
        .with_predicate(|e| {
            matches!(
                e,
                BackupForgeError::TransientRemote { .. }
                    | BackupForgeError::Timeout { .. }
                    | BackupForgeError::RetryExhausted { .. }
            )
        });

        let outcome = {
            let spec = spec.clone();
            let metrics_snapshot = metrics.clone();
            top_retry
                .execute(cancel, || {
                    pipeline.run(cancel, spec.clone(), items.clone(), metrics_snapshot.clone())
                })
                .await
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.publish(PipelineEvent::BackupCompleted {
                    backup_id: job_id.to_string(),
                    cluster: identity.name.clone(),
                    success: false,
                    resource_count: 0,
                    size_bytes: 0,
                    object_path: None,
                    error_message: Some(e.to_string()),
                });
                return Err(e);
            }
        };
        metrics.pipeline_ms = outcome.manifest.timings.pipeline_ms;
        metrics.bytes_uploaded = outcome.manifest.timings.bytes_uploaded;
        metrics.resources_per_second = outcome.manifest.timings.resources_per_second;
        metrics.success_rate = outcome.manifest.timings.success_rate;

        // Post-backup cleanup only after a successful pipeline
        let mut post_cleanup = None;
        if self.config.retention.enable_cleanup
            && !self.config.retention.cleanup_on_startup
            && outcome.manifest.success
        {
            post_cleanup = Some(self.run_cleanup(cancel, metrics).await?);
        }

        metrics.calculate_total();

        self.publish(PipelineEvent::BackupCompleted {
            backup_id: job_id.to_string(),
            cluster: identity.name.clone(),
            success: outcome.manifest.success,
            resource_count: outcome.manifest.resource_count,
            size_bytes: outcome.manifest.bytes_uploaded,
            object_path: Some(outcome.manifest_key.clone()),
            error_message: outcome
                .manifest
                .errors
                .first()
                .map(|e| e.message.clone()),
        });
        log_info(
            LogCategory::Backup,
            &format!(
                "Backup job {job_id} complete (success: {}, resources: {})",
                outcome.manifest.success, outcome.manifest.resource_count
            ),
        );
        crate::logging::log_audit(
            "Backup job completed",
            serde_json::json!({
                "job_id": job_id,
                "cluster": identity.name,
                "success": outcome.manifest.success,
                "resource_count": outcome.manifest.resource_count,
                "manifest": outcome.manifest_key,
            }),
        );

        Ok(BackupRunReport {
            manifest: outcome.manifest,
            manifest_key: outcome.manifest_key,
            identity,
            startup_cleanup,
            post_cleanup,
            metrics: metrics.clone(),
        })
    }

    async fn run_cleanup(
        &self,
        cancel: &CancellationToken,
        metrics: &mut RunMetrics,
    ) -> Result<CleanupReport> {
        let phase = Instant::now();
        let manager = RetentionManager::new(self.store.clone(), self.config.retention.clone());
        let report = manager.run_cleanup(cancel).await?;
        metrics.cleanup_ms += phase.elapsed().as_millis() as u64;
        Ok(report)
    }

    fn publish(&self, event: PipelineEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    /// Graceful shutdown: wait for the active run to drain within the grace
    /// period, then cancel outstanding work
    pub async fn shutdown(&self) {
        let grace = Duration::from_secs(self.config.pipeline.shutdown_grace_secs);
        log_info(
            LogCategory::System,
            &format!("Shutdown requested (grace period: {}s)", grace.as_secs()),
        );

        let waited = Instant::now();
        while self.run_active.load(Ordering::SeqCst) && waited.elapsed() < grace {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.cancel.cancel();
    }
}

/// Process exit code for a finished run
///
/// 0 = fully clean run, 1 = any item failed or a retryable failure was
/// exhausted, 2 = halted by an open circuit, 3 = configuration error.
pub fn exit_code_for(result: &Result<BackupRunReport>) -> i32 {
    match result {
        Ok(report) => {
            if report.manifest.failed > 0 {
                1
            } else {
                0
            }
        }
        Err(BackupForgeError::Configuration(_)) => 3,
        Err(BackupForgeError::CircuitOpen { .. }) => 2,
        Err(_) => 1,
    }
}
