//! # Backup Pipeline
//!
//! The parallel extraction core: a bounded worker pool drains the
//! priority-sorted work queue, lists objects page by page through the
//! resilient cluster client, applies scope predicates, normalizes each
//! object, serializes it to YAML, and uploads it under the stable key scheme
//!
//! `backups/<cluster>/<yyyy>/<mm>/<dd>/<jobId>/<namespace>/<kind>/<name>.yaml`
//!
//! with `_cluster_` in the namespace slot for cluster-scoped objects.
//!
//! Per-item failures are recorded and never abort other items; the job
//! manifest is written last and is the authoritative record. A cancelled run
//! stops draining, uploads nothing further, and does not write a manifest —
//! re-running the same job id simply overwrites keys.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cluster_detect::ClusterIdentity;
use crate::discovery_filter::WorkItem;
use crate::logging::{log_info, log_warn, LogCategory};
use crate::priority_engine::PriorityEngine;
use crate::resilience_core::{RetryConfig, RetryExecutor};
use crate::resilient_clients::{ResilientClusterApi, ResilientObjectStore};
use crate::runtime_config::{BackupScope, PipelineConfig};
use crate::{BackupForgeError, Result, RunMetrics};

/// Namespace slot used for cluster-scoped objects in storage keys
pub const CLUSTER_SCOPED_SLOT: &str = "_cluster_";

/// One end-to-end backup job against one cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJobSpec {
    pub job_id: String,
    pub cluster: ClusterIdentity,
    pub scope: BackupScope,
    pub started_at: DateTime<Utc>,
}

/// How a recorded per-item problem was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorDisposition {
    /// Dropped by policy (size gate, invalid object); not an upload failure
    Skipped,
    /// Upload or listing failed after the retry budget
    Failed,
}

/// One recorded per-item problem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemError {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub message: String,
    pub disposition: ErrorDisposition,
}

/// Authoritative per-job summary, written last to the object store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub job_id: String,
    pub cluster: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// In-scope objects seen (after label/annotation/owner predicates)
    pub objects_discovered: u64,
    /// Successfully uploaded objects
    pub resource_count: u64,
    pub skipped: u64,
    pub failed: u64,
    pub bytes_uploaded: u64,
    /// True iff no item failed
    pub success: bool,
    pub errors: Vec<ItemError>,
    pub timings: RunMetrics,
}

/// Result of a pipeline run
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub manifest: BackupManifest,
    /// Storage key the manifest was written under
    pub manifest_key: String,
}

/// Storage key for one object
pub fn object_key(
    cluster: &str,
    started_at: DateTime<Utc>,
    job_id: &str,
    namespace: Option<&str>,
    kind_plural: &str,
    name: &str,
) -> String {
    format!(
        "backups/{cluster}/{}/{job_id}/{}/{kind_plural}/{name}.yaml",
        started_at.format("%Y/%m/%d"),
        namespace.unwrap_or(CLUSTER_SCOPED_SLOT),
    )
}

/// Storage key for a job's manifest
pub fn manifest_key(cluster: &str, started_at: DateTime<Utc>, job_id: &str) -> String {
    format!(
        "backups/{cluster}/{}/{job_id}/manifest.json",
        started_at.format("%Y/%m/%d")
    )
}

/// Live counters shared by all workers
#[derive(Default)]
struct PipelineStats {
    discovered: AtomicU64,
    uploaded: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
    errors: Mutex<Vec<ItemError>>,
}

impl PipelineStats {
    fn record_error(&self, error: ItemError) {
        match error.disposition {
            ErrorDisposition::Skipped => self.skipped.fetch_add(1, Ordering::Relaxed),
            ErrorDisposition::Failed => self.failed.fetch_add(1, Ordering::Relaxed),
        };
        log_warn(
            LogCategory::Pipeline,
            &format!(
                "Item problem ({:?}) for {}/{}: {}",
                error.disposition,
                error.kind,
                error.name.as_deref().unwrap_or("?"),
                error.message
            ),
        );
        self.errors.lock().push(error);
    }
}

/// Everything a worker needs, shared behind one Arc
struct WorkerContext {
    api: Arc<ResilientClusterApi>,
    store: Arc<ResilientObjectStore>,
    priorities: Arc<PriorityEngine>,
    config: PipelineConfig,
    spec: BackupJobSpec,
    label_pairs: Vec<(String, String)>,
    annotation_pairs: Vec<(String, String)>,
    stats: PipelineStats,
    queue: tokio::sync::Mutex<VecDeque<WorkItem>>,
}

/// The parallel extraction pipeline
pub struct BackupPipeline {
    api: Arc<ResilientClusterApi>,
    store: Arc<ResilientObjectStore>,
    priorities: Arc<PriorityEngine>,
    config: PipelineConfig,
}

impl BackupPipeline {
    pub fn new(
        api: Arc<ResilientClusterApi>,
        store: Arc<ResilientObjectStore>,
        priorities: Arc<PriorityEngine>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            api,
            store,
            priorities,
            config,
        }
    }

    /// Drain the work queue and write the manifest
    ///
    /// Returns [`BackupForgeError::Cancelled`] without writing a manifest
    /// when the run is cancelled mid-flight.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        spec: BackupJobSpec,
        items: Vec<WorkItem>,
        mut timings: RunMetrics,
    ) -> Result<PipelineOutcome> {
        let started = Instant::now();
        let item_count = items.len();
        log_info(
            LogCategory::Pipeline,
            &format!(
                "Pipeline starting for job {} ({} work items, {} workers)",
                spec.job_id, item_count, self.config.workers
            ),
        );

        let label_pairs = pairs_from_selector(spec.scope.label_selector.as_deref());
        let annotation_pairs = pairs_from_selector(spec.scope.annotation_selector.as_deref());

        let context = Arc::new(WorkerContext {
            api: self.api.clone(),
            store: self.store.clone(),
            priorities: self.priorities.clone(),
            config: self.config.clone(),
            spec: spec.clone(),
            label_pairs,
            annotation_pairs,
            stats: PipelineStats::default(),
            queue: tokio::sync::Mutex::new(items.into()),
        });

        let mut workers = Vec::with_capacity(self.config.workers);
        for _ in 0..self.config.workers {
            let context = context.clone();
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                worker_loop(context, cancel).await;
            }));
        }
        futures::future::join_all(workers).await;

        if cancel.is_cancelled() {
            log_warn(
                LogCategory::Pipeline,
                &format!("Pipeline for job {} cancelled, manifest not written", spec.job_id),
            );
            return Err(BackupForgeError::Cancelled);
        }

        let stats = &context.stats;
        let uploaded = stats.uploaded.load(Ordering::Relaxed);
        let failed = stats.failed.load(Ordering::Relaxed);
        let bytes = stats.bytes.load(Ordering::Relaxed);

        timings.pipeline_ms = started.elapsed().as_millis() as u64;
        timings.bytes_uploaded = bytes;
        let discovered = stats.discovered.load(Ordering::Relaxed);
        timings.success_rate = if discovered > 0 {
            uploaded as f64 / discovered as f64 * 100.0
        } else {
            100.0
        };
        timings.resources_per_second = if timings.pipeline_ms > 0 {
            uploaded as f64 / (timings.pipeline_ms as f64 / 1000.0)
        } else {
            uploaded as f64
        };
        timings.calculate_total();

        let manifest = BackupManifest {
            job_id: spec.job_id.clone(),
            cluster: spec.cluster.name.clone(),
            started_at: spec.started_at,
            finished_at: Utc::now(),
            objects_discovered: discovered,
            resource_count: uploaded,
            skipped: stats.skipped.load(Ordering::Relaxed),
            failed,
            bytes_uploaded: bytes,
            success: failed == 0,
            errors: stats.errors.lock().clone(),
            timings,
        };

        let key = manifest_key(&spec.cluster.name, spec.started_at, &spec.job_id);
        let payload = serde_json::to_vec_pretty(&manifest).map_err(|e| {
            BackupForgeError::Validation(format!("manifest serialization: {e}"))
        })?;
        self.store
            .put_object(cancel, &key, Bytes::from(payload))
            .await?;

        counter!("pipeline_jobs_total", 1);
        counter!("pipeline_objects_uploaded_total", uploaded);
        counter!("pipeline_bytes_uploaded_total", bytes);
        histogram!("pipeline_duration_ms", manifest.timings.pipeline_ms as f64);
        crate::logging::log_performance(
            &format!("Pipeline drained for job {}", manifest.job_id),
            manifest.timings.pipeline_ms,
            serde_json::json!({
                "uploaded": manifest.resource_count,
                "skipped": manifest.skipped,
                "failed": manifest.failed,
                "bytes": bytes,
            }),
        );
        log_info(
            LogCategory::Backup,
            &format!(
                "Pipeline for job {} finished: {} uploaded, {} skipped, {} failed ({} bytes)",
                manifest.job_id, manifest.resource_count, manifest.skipped, manifest.failed, bytes
            ),
        );

        Ok(PipelineOutcome {
            manifest,
            manifest_key: key,
        })
    }
}

/// Worker: pop items until the queue drains or the run is cancelled
async fn worker_loop(context: Arc<WorkerContext>, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let item = { context.queue.lock().await.pop_front() };
        let Some(mut item) = item else { return };
        item.attempt += 1;

        if let Err(e) = process_item(&context, &cancel, &item).await {
            if e.is_cancelled() {
                return;
            }
            context.stats.record_error(ItemError {
                kind: item.kind.resource.plural.clone(),
                namespace: item.namespace.clone(),
                name: None,
                message: e.to_string(),
                disposition: ErrorDisposition::Failed,
            });
        }
    }
}

/// Process one `(kind, namespace)` item: list pages, filter, normalize,
/// upload
async fn process_item(
    context: &Arc<WorkerContext>,
    cancel: &CancellationToken,
    item: &WorkItem,
) -> Result<()> {
    let resource = &item.kind.resource;

    // The kind's semaphore caps simultaneous in-flight items for that kind
    let semaphore = context.priorities.semaphore_for_kind(&resource.plural);
    let _permit = tokio::select! {
        permit = semaphore.acquire_owned() => permit.map_err(|_| BackupForgeError::Cancelled)?,
        _ = cancel.cancelled() => return Err(BackupForgeError::Cancelled),
    };

    let retry = RetryExecutor::new(effective_retry(&item.kind.retry, &context.config));
    let mut continuation: Option<String> = None;

    loop {
        if cancel.is_cancelled() {
            return Err(BackupForgeError::Cancelled);
        }

        let page = context
            .api
            .list_page(
                &retry,
                cancel,
                resource,
                item.namespace.as_deref(),
                continuation.clone(),
                context.config.batch_size,
            )
            .await?;

        for object in &page.objects {
            if cancel.is_cancelled() {
                return Err(BackupForgeError::Cancelled);
            }
            handle_object(context, cancel, &retry, item, object).await;
        }

        match page.continuation {
            Some(next) => continuation = Some(next),
            None => break,
        }
    }

    Ok(())
}

/// Apply predicates and normalization to one object, then upload it
async fn handle_object(
    context: &Arc<WorkerContext>,
    cancel: &CancellationToken,
    retry: &RetryExecutor,
    item: &WorkItem,
    object: &Value,
) {
    let resource = &item.kind.resource;

    // Scope predicates: objects that do not match are out of scope entirely
    if !matches_pairs(object, "/metadata/labels", &context.label_pairs) {
        return;
    }
    if !matches_pairs(object, "/metadata/annotations", &context.annotation_pairs) {
        return;
    }
    if !context.config.follow_owner_references && has_owner_references(object) {
        return;
    }

    context.stats.discovered.fetch_add(1, Ordering::Relaxed);

    let name = object
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .map(|s| s.to_string());
    let Some(name) = name else {
        context.stats.record_error(ItemError {
            kind: resource.plural.clone(),
            namespace: item.namespace.clone(),
            name: None,
            message: "object has no metadata.name".to_string(),
            disposition: ErrorDisposition::Skipped,
        });
        return;
    };

    let payload = match normalize_and_serialize(object, &context.config) {
        Ok(payload) => payload,
        Err(e) => {
            let disposition = if context.config.skip_invalid_resources {
                ErrorDisposition::Skipped
            } else {
                ErrorDisposition::Failed
            };
            context.stats.record_error(ItemError {
                kind: resource.plural.clone(),
                namespace: item.namespace.clone(),
                name: Some(name),
                message: e.to_string(),
                disposition,
            });
            return;
        }
    };

    // The size gate applies to the payload actually stored, after
    // normalization; oversized objects are always skipped, never failed
    if payload.len() > context.spec.scope.max_object_bytes {
        context.stats.record_error(ItemError {
            kind: resource.plural.clone(),
            namespace: item.namespace.clone(),
            name: Some(name),
            message: format!(
                "serialized size {} exceeds limit {}",
                payload.len(),
                context.spec.scope.max_object_bytes
            ),
            disposition: ErrorDisposition::Skipped,
        });
        return;
    }

    let key = object_key(
        &context.spec.cluster.name,
        context.spec.started_at,
        &context.spec.job_id,
        item.namespace.as_deref(),
        &resource.plural,
        &name,
    );

    let size = payload.len() as u64;
    match context
        .store
        .put_object_with(retry, cancel, &key, payload)
        .await
    {
        Ok(()) => {
            context.stats.uploaded.fetch_add(1, Ordering::Relaxed);
            context.stats.bytes.fetch_add(size, Ordering::Relaxed);
            counter!("pipeline_uploads_total", 1, "kind" => resource.plural.clone());
        }
        Err(e) if e.is_cancelled() => {
            // The worker loop notices cancellation on its next check
        }
        Err(e) => {
            context.stats.record_error(ItemError {
                kind: resource.plural.clone(),
                namespace: item.namespace.clone(),
                name: Some(name),
                message: e.to_string(),
                disposition: ErrorDisposition::Failed,
            });
        }
    }
}

/// Normalization, in order: drop managedFields, drop status, serialize to
/// the cluster-native textual representation
///
/// The object is treated as an opaque map; only specific metadata fields are
/// touched. The size gate runs on the returned payload.
pub fn normalize_and_serialize(object: &Value, config: &PipelineConfig) -> Result<Bytes> {
    let mut object = object.clone();

    if !config.include_managed_fields {
        if let Some(metadata) = object
            .pointer_mut("/metadata")
            .and_then(Value::as_object_mut)
        {
            metadata.remove("managedFields");
        }
    }
    if !config.include_status {
        if let Some(map) = object.as_object_mut() {
            map.remove("status");
        }
    }

    let yaml = serde_yaml::to_string(&object)
        .map_err(|e| BackupForgeError::Validation(format!("YAML serialization: {e}")))?;

    if config.validate_yaml {
        serde_yaml::from_str::<Value>(&yaml)
            .map_err(|e| BackupForgeError::Validation(format!("YAML validation: {e}")))?;
    }

    Ok(Bytes::from(yaml))
}

/// Apply pipeline-level retry overrides on top of the kind's profile
fn effective_retry(profile: &RetryConfig, config: &PipelineConfig) -> RetryConfig {
    let mut effective = profile.clone();
    if let Some(attempts) = config.retry_attempts {
        effective.max_attempts = attempts.max(1);
    }
    if let Some(delay_ms) = config.retry_delay_ms {
        effective.initial_delay = std::time::Duration::from_millis(delay_ms);
    }
    effective
}

/// All selector pairs must be present with matching values
fn matches_pairs(object: &Value, path: &str, pairs: &[(String, String)]) -> bool {
    if pairs.is_empty() {
        return true;
    }
    let Some(map) = object.pointer(path).and_then(Value::as_object) else {
        return false;
    };
    pairs
        .iter()
        .all(|(key, value)| map.get(key).and_then(Value::as_str) == Some(value.as_str()))
}

fn has_owner_references(object: &Value) -> bool {
    object
        .pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)
        .map(|refs| !refs.is_empty())
        .unwrap_or(false)
}

fn pairs_from_selector(selector: Option<&str>) -> Vec<(String, String)> {
    selector
        .and_then(|s| crate::runtime_config::parse_selector(s).ok())
        .unwrap_or_default()
}
