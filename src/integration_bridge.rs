//! # Integration Bridge
//!
//! The cross-component orchestration seam: an in-memory component registry
//! with periodic health probes, a bounded event bus with fan-out, a webhook
//! server, and the trigger that turns a completed backup into a GitOps
//! generation request after a debounce delay.
//!
//! Delivery semantics are best-effort at-least-once within the bridge
//! process lifetime; nothing survives a restart. Duplicate suppression is by
//! `(event type, correlation id)` with a short TTL.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::logging::{log_info, log_warn, LogCategory};
use crate::resilience_core::BreakerManager;
use crate::resilient_clients::ResilientHttpClient;
use crate::runtime_config::BridgeConfig;
use crate::{BackupForgeError, Result};

/// Typed pipeline events flowing through the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    BackupStarted {
        backup_id: String,
        cluster: String,
    },
    BackupCompleted {
        backup_id: String,
        cluster: String,
        success: bool,
        resource_count: u64,
        size_bytes: u64,
        object_path: Option<String>,
        error_message: Option<String>,
    },
    GitOpsGenerationRequested {
        request_id: String,
        backup_id: String,
        cluster: String,
    },
    GitOpsGenerationCompleted {
        request_id: String,
        backup_id: Option<String>,
        status: String,
        files_generated: u64,
        files_committed: u64,
        git_commit_hash: Option<String>,
        duration_seconds: f64,
    },
    ComponentHealthChanged {
        component: String,
        from: ComponentStatus,
        to: ComponentStatus,
    },
}

impl PipelineEvent {
    /// Wire name used in envelopes and for dedup keys
    pub fn type_name(&self) -> &'static str {
        match self {
            PipelineEvent::BackupStarted { .. } => "backup.started",
            PipelineEvent::BackupCompleted { .. } => "backup.completed",
            PipelineEvent::GitOpsGenerationRequested { .. } => "gitops.generation.requested",
            PipelineEvent::GitOpsGenerationCompleted { .. } => "gitops.generation.completed",
            PipelineEvent::ComponentHealthChanged { .. } => "component.health.changed",
        }
    }

    /// Correlation id used for dedup and flow tracking
    pub fn correlation_id(&self) -> String {
        match self {
            PipelineEvent::BackupStarted { backup_id, .. } => backup_id.clone(),
            PipelineEvent::BackupCompleted { backup_id, .. } => backup_id.clone(),
            PipelineEvent::GitOpsGenerationRequested { backup_id, .. } => backup_id.clone(),
            PipelineEvent::GitOpsGenerationCompleted { request_id, .. } => request_id.clone(),
            PipelineEvent::ComponentHealthChanged { component, .. } => component.clone(),
        }
    }
}

/// JSON envelope carried by webhooks and the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl EventEnvelope {
    pub fn wrap(source: &str, event: &PipelineEvent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event.type_name().to_string(),
            source: source.to_string(),
            timestamp: Utc::now(),
            data: serde_json::to_value(event).unwrap_or(Value::Null),
        }
    }
}

/// Bounded in-memory event buffer with broadcast fan-out
///
/// When the ring is full the oldest event is dropped and counted; at steady
/// state `produced - dropped` equals the buffer occupancy, never exceeding
/// the configured size.
pub struct EventBus {
    capacity: usize,
    ring: Mutex<VecDeque<EventEnvelope>>,
    fanout: broadcast::Sender<EventEnvelope>,
    produced: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (fanout, _) = broadcast::channel(capacity.max(16));
        Self {
            capacity: capacity.max(1),
            ring: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            fanout,
            produced: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Publish a typed event; returns the envelope it was wrapped in
    pub fn publish(&self, event: PipelineEvent) -> EventEnvelope {
        let envelope = EventEnvelope::wrap("backup-forge", &event);
        self.publish_envelope(envelope.clone());
        envelope
    }

    /// Publish a pre-built envelope (webhook ingress)
    pub fn publish_envelope(&self, envelope: EventEnvelope) {
        self.produced.fetch_add(1, Ordering::Relaxed);
        {
            let mut ring = self.ring.lock();
            if ring.len() == self.capacity {
                ring.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("bridge_events_dropped_total", 1);
            }
            ring.push_back(envelope.clone());
        }
        counter!("bridge_events_published_total", 1, "type" => envelope.event_type.clone());
        let _ = self.fanout.send(envelope);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.fanout.subscribe()
    }

    /// Most recent events, newest last
    pub fn recent(&self, count: usize) -> Vec<EventEnvelope> {
        let ring = self.ring.lock();
        ring.iter().rev().take(count).rev().cloned().collect()
    }

    pub fn produced_count(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn buffered_count(&self) -> usize {
        self.ring.lock().len()
    }
}

/// Health of a registered component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// Kinds of components the bridge accepts registrations for
pub const COMPONENT_KINDS: &[&str] = &["backup", "gitops"];

/// One registered component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentRegistration {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub endpoint: String,
    pub version: String,
    pub status: ComponentStatus,
    pub last_probed_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// When the component entered its current status
    pub status_since: DateTime<Utc>,
    pub metadata: Value,
}

/// Rolling per-component request metrics
#[derive(Default)]
struct ComponentMetrics {
    requests: AtomicU64,
    errors: AtomicU64,
    latencies_ms: Mutex<VecDeque<f64>>,
}

impl ComponentMetrics {
    fn record(&self, latency_ms: f64, ok: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        let mut latencies = self.latencies_ms.lock();
        latencies.push_back(latency_ms);
        if latencies.len() > 100 {
            latencies.pop_front();
        }
    }

    fn snapshot(&self) -> Value {
        let latencies = self.latencies_ms.lock();
        let avg = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };
        json!({
            "requests": self.requests.load(Ordering::Relaxed),
            "errors": self.errors.load(Ordering::Relaxed),
            "avg_latency_ms": avg,
        })
    }
}

/// A backup awaiting its GitOps generation round-trip
#[derive(Debug, Clone)]
struct PendingFlow {
    request_id: String,
    backup_id: String,
    requested_at: Instant,
}

/// The integration bridge
pub struct IntegrationBridge {
    config: BridgeConfig,
    events: Arc<EventBus>,
    http: ResilientHttpClient,
    components: DashMap<String, ComponentRegistration>,
    component_metrics: DashMap<String, Arc<ComponentMetrics>>,
    dedup: DashMap<(String, String), Instant>,
    pending_flows: DashMap<String, PendingFlow>,
    flow_success: AtomicU64,
    flow_failure: AtomicU64,
    flow_latencies_ms: Mutex<VecDeque<f64>>,
    started_at: Instant,
    cancel: CancellationToken,
}

impl IntegrationBridge {
    pub fn new(config: BridgeConfig, breakers: Arc<BreakerManager>) -> Result<Arc<Self>> {
        let events = Arc::new(EventBus::new(config.event_buffer_size));
        let http = ResilientHttpClient::new(breakers)?;
        Ok(Arc::new(Self {
            config,
            events,
            http,
            components: DashMap::new(),
            component_metrics: DashMap::new(),
            dedup: DashMap::new(),
            pending_flows: DashMap::new(),
            flow_success: AtomicU64::new(0),
            flow_failure: AtomicU64::new(0),
            flow_latencies_ms: Mutex::new(VecDeque::with_capacity(100)),
            started_at: Instant::now(),
            cancel: CancellationToken::new(),
        }))
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn flow_success_count(&self) -> u64 {
        self.flow_success.load(Ordering::Relaxed)
    }

    /// Stop background tasks and the webhook server
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    // -- registry ----------------------------------------------------------

    /// Register a component of a known kind; returns the stored record
    pub fn register_component(
        &self,
        kind: &str,
        endpoint: &str,
        version: &str,
    ) -> Result<ComponentRegistration> {
        if !COMPONENT_KINDS.contains(&kind) {
            return Err(BackupForgeError::Validation(format!(
                "unknown component kind '{kind}'"
            )));
        }
        if endpoint.is_empty() {
            return Err(BackupForgeError::Validation(
                "component endpoint must not be empty".to_string(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        let registration = ComponentRegistration {
            name: format!("{kind}-{}", &id[..8]),
            id,
            kind: kind.to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            version: version.to_string(),
            status: ComponentStatus::Unknown,
            last_probed_at: None,
            consecutive_failures: 0,
            status_since: Utc::now(),
            metadata: Value::Null,
        };
        log_info(
            LogCategory::Bridge,
            &format!(
                "Registered {kind} component {} at {}",
                registration.id, registration.endpoint
            ),
        );
        self.components
            .insert(registration.id.clone(), registration.clone());
        self.component_metrics
            .entry(registration.id.clone())
            .or_default();
        Ok(registration)
    }

    /// Explicit deregistration
    pub fn deregister_component(&self, id: &str) -> bool {
        self.component_metrics.remove(id);
        self.components.remove(id).is_some()
    }

    pub fn components(&self) -> Vec<ComponentRegistration> {
        let mut all: Vec<_> = self.components.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    fn components_of_kind(&self, kind: &str) -> Vec<ComponentRegistration> {
        self.components
            .iter()
            .filter(|e| e.value().kind == kind)
            .map(|e| e.value().clone())
            .collect()
    }

    // -- dedup -------------------------------------------------------------

    /// True when this `(event type, correlation id)` pair was not seen within
    /// the TTL; records it as seen
    fn first_sighting(&self, event_type: &str, correlation_id: &str) -> bool {
        let ttl = Duration::from_secs(self.config.dedup_ttl_secs);
        let key = (event_type.to_string(), correlation_id.to_string());
        let now = Instant::now();

        if let Some(seen) = self.dedup.get(&key) {
            if now.duration_since(*seen) < ttl {
                counter!("bridge_events_deduplicated_total", 1);
                return false;
            }
        }
        self.dedup.insert(key, now);
        true
    }

    fn sweep_dedup(&self) {
        let ttl = Duration::from_secs(self.config.dedup_ttl_secs);
        let now = Instant::now();
        self.dedup.retain(|_, seen| now.duration_since(*seen) < ttl);
    }

    // -- event pump and gitops trigger -------------------------------------

    /// Consume the bus and react to completed backups
    pub fn start_event_pump(self: Arc<Self>) {
        let mut receiver = self.events.subscribe();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    received = receiver.recv() => match received {
                        Ok(envelope) => self.clone().on_envelope(envelope),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            log_warn(
                                LogCategory::Bridge,
                                &format!("Event pump lagged, skipped {skipped} events"),
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        });
    }

    fn on_envelope(self: Arc<Self>, envelope: EventEnvelope) {
        if envelope.event_type != "backup.completed" {
            return;
        }
        let success = envelope.data["success"].as_bool().unwrap_or(false);
        let backup_id = envelope.data["backup_id"]
            .as_str()
            .or_else(|| envelope.data["backupId"].as_str())
            .unwrap_or_default()
            .to_string();
        let cluster = envelope.data["cluster"]
            .as_str()
            .or_else(|| envelope.data["clusterName"].as_str())
            .unwrap_or_default()
            .to_string();

        if !success || backup_id.is_empty() {
            return;
        }
        if !self.first_sighting("gitops.generation.requested", &backup_id) {
            return;
        }
        self.schedule_gitops_generation(backup_id, cluster);
    }

    /// After the debounce delay, publish the generation request and deliver
    /// it to every registered GitOps generator
    fn schedule_gitops_generation(self: Arc<Self>, backup_id: String, cluster: String) {
        let bridge = self;
        let debounce = Duration::from_secs(bridge.config.debounce_secs);
        let cancel = bridge.cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(debounce) => {}
            }

            let request_id = Uuid::new_v4().to_string();
            bridge.pending_flows.insert(
                backup_id.clone(),
                PendingFlow {
                    request_id: request_id.clone(),
                    backup_id: backup_id.clone(),
                    requested_at: Instant::now(),
                },
            );

            let event = PipelineEvent::GitOpsGenerationRequested {
                request_id: request_id.clone(),
                backup_id: backup_id.clone(),
                cluster: cluster.clone(),
            };
            let envelope = bridge.events.publish(event);

            for generator in bridge.components_of_kind("gitops") {
                let url = format!("{}/webhooks/gitops/generate", generator.endpoint);
                let started = Instant::now();
                let delivered = bridge
                    .http
                    .post_json(
                        &cancel,
                        &url,
                        &serde_json::to_value(&envelope).unwrap_or(Value::Null),
                        bridge.config.auth_token.as_deref(),
                    )
                    .await;
                let latency = started.elapsed().as_secs_f64() * 1000.0;
                if let Some(metrics) = bridge.component_metrics.get(&generator.id) {
                    metrics.record(latency, delivered.is_ok());
                }
                match delivered {
                    Ok(_) => log_info(
                        LogCategory::Bridge,
                        &format!(
                            "GitOps generation request {request_id} delivered to {}",
                            generator.endpoint
                        ),
                    ),
                    Err(e) => log_warn(
                        LogCategory::Bridge,
                        &format!("GitOps generation delivery failed: {e}"),
                    ),
                }
            }
        });
    }

    /// Close the correlation opened by a generation request
    pub fn complete_gitops_flow(
        &self,
        request_id: &str,
        backup_id: Option<&str>,
        status: &str,
    ) -> bool {
        let key = self
            .pending_flows
            .iter()
            .find(|entry| {
                entry.value().request_id == request_id
                    || backup_id == Some(entry.value().backup_id.as_str())
            })
            .map(|entry| entry.key().clone());

        let Some(key) = key else { return false };
        let Some((_, flow)) = self.pending_flows.remove(&key) else {
            return false;
        };

        let latency_ms = flow.requested_at.elapsed().as_secs_f64() * 1000.0;
        {
            let mut latencies = self.flow_latencies_ms.lock();
            latencies.push_back(latency_ms);
            if latencies.len() > 100 {
                latencies.pop_front();
            }
        }
        histogram!("bridge_flow_latency_ms", latency_ms);

        let succeeded = matches!(status, "completed" | "success" | "succeeded");
        if succeeded {
            self.flow_success.fetch_add(1, Ordering::Relaxed);
            counter!("bridge_flow_success_total", 1);
        } else {
            self.flow_failure.fetch_add(1, Ordering::Relaxed);
            counter!("bridge_flow_failure_total", 1);
        }
        log_info(
            LogCategory::Bridge,
            &format!(
                "GitOps flow for backup {} closed ({status}, {latency_ms:.0}ms)",
                flow.backup_id
            ),
        );
        true
    }

    // -- health probes ------------------------------------------------------

    /// Start the periodic health probe loop
    pub fn start_probe_loop(self: Arc<Self>) {
        let bridge = self;
        let cancel = bridge.cancel.clone();
        let interval = Duration::from_secs(bridge.config.probe_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        bridge.probe_components_once().await;
                        bridge.sweep_dedup();
                    }
                }
            }
        });
    }

    /// One probe cycle; probes are serialized per component
    pub async fn probe_components_once(&self) {
        let ids: Vec<String> = self.components.iter().map(|e| e.key().clone()).collect();

        for id in ids {
            let Some(component) = self.components.get(&id).map(|e| e.value().clone()) else {
                continue;
            };

            let url = format!("{}/health", component.endpoint);
            let started = Instant::now();
            let result = self.http.get_json(&self.cancel, &url).await;
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

            if let Some(metrics) = self.component_metrics.get(&id) {
                metrics.record(latency_ms, result.is_ok());
            }

            let new_status = match &result {
                Ok(_) => ComponentStatus::Healthy,
                Err(e) if e.is_circuit_open() => ComponentStatus::Unknown,
                Err(_) => {
                    let failures = component.consecutive_failures + 1;
                    if failures >= self.config.unhealthy_after_failures {
                        ComponentStatus::Unhealthy
                    } else {
                        ComponentStatus::Degraded
                    }
                }
            };

            if let Some(mut entry) = self.components.get_mut(&id) {
                let previous = entry.status;
                entry.last_probed_at = Some(Utc::now());
                entry.consecutive_failures = if result.is_ok() {
                    0
                } else {
                    entry.consecutive_failures + 1
                };
                if previous != new_status {
                    entry.status = new_status;
                    entry.status_since = Utc::now();
                    drop(entry);
                    self.events.publish(PipelineEvent::ComponentHealthChanged {
                        component: id.clone(),
                        from: previous,
                        to: new_status,
                    });
                }
            }
        }

        // Components stuck in unknown for too long are removed
        let remove_after = Duration::from_secs(self.config.remove_unknown_after_secs);
        let stale: Vec<String> = self
            .components
            .iter()
            .filter(|e| {
                e.value().status == ComponentStatus::Unknown
                    && (Utc::now() - e.value().status_since)
                        .to_std()
                        .map(|age| age > remove_after)
                        .unwrap_or(false)
            })
            .map(|e| e.key().clone())
            .collect();
        for id in stale {
            log_warn(
                LogCategory::Bridge,
                &format!("Removing component {id} after prolonged unknown status"),
            );
            self.deregister_component(&id);
        }
    }

    // -- status reporting ---------------------------------------------------

    pub fn health_snapshot(&self) -> Value {
        json!({
            "status": "healthy",
            "uptime_seconds": self.started_at.elapsed().as_secs(),
            "components": self.components.len(),
            "memory_used_bytes": process_memory_bytes(),
        })
    }

    pub fn status_snapshot(&self) -> Value {
        let component_metrics: Value = self
            .component_metrics
            .iter()
            .map(|e| (e.key().clone(), e.value().snapshot()))
            .collect::<serde_json::Map<String, Value>>()
            .into();
        let flow_latencies = self.flow_latencies_ms.lock();
        let avg_flow = if flow_latencies.is_empty() {
            0.0
        } else {
            flow_latencies.iter().sum::<f64>() / flow_latencies.len() as f64
        };

        json!({
            "components": self.components(),
            "recent_events": self.events.recent(20),
            "metrics": {
                "per_component": component_metrics,
                "flow_success": self.flow_success.load(Ordering::Relaxed),
                "flow_failure": self.flow_failure.load(Ordering::Relaxed),
                "avg_flow_latency_ms": avg_flow,
                "events_produced": self.events.produced_count(),
                "events_dropped": self.events.dropped_count(),
            },
        })
    }

    // -- auth ---------------------------------------------------------------

    /// Bearer-token check: 401 for missing/invalid credentials, 403 for a
    /// valid viewer token on a write endpoint
    fn authorize(&self, headers: &HeaderMap, write: bool) -> std::result::Result<(), StatusCode> {
        let Some(expected) = &self.config.auth_token else {
            return Ok(());
        };

        let presented = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        match presented {
            Some(token) if token == expected => Ok(()),
            Some(token) => {
                if self.config.viewer_token.as_deref() == Some(token) {
                    if write {
                        Err(StatusCode::FORBIDDEN)
                    } else {
                        Ok(())
                    }
                } else {
                    Err(StatusCode::UNAUTHORIZED)
                }
            }
            None => Err(StatusCode::UNAUTHORIZED),
        }
    }

    // -- webhook ingress ----------------------------------------------------

    /// Handle a backup-completed webhook envelope
    pub fn ingest_backup_completed(&self, envelope: &WebhookEnvelope) -> Result<()> {
        let data: BackupCompletedData = serde_json::from_value(envelope.data.clone())
            .map_err(|e| BackupForgeError::Validation(format!("backup.completed data: {e}")))?;

        self.events.publish(PipelineEvent::BackupCompleted {
            backup_id: data.backup_id,
            cluster: data.cluster_name,
            success: data.success,
            resource_count: data.resource_count,
            size_bytes: data.size,
            object_path: data.object_path,
            error_message: data.error_message,
        });
        Ok(())
    }

    /// Handle a gitops-completed webhook envelope
    pub fn ingest_gitops_completed(&self, envelope: &WebhookEnvelope) -> Result<()> {
        let data: GitOpsCompletedData = serde_json::from_value(envelope.data.clone())
            .map_err(|e| BackupForgeError::Validation(format!("gitops.completed data: {e}")))?;

        self.complete_gitops_flow(&data.request_id, data.backup_id.as_deref(), &data.status);
        self.events.publish(PipelineEvent::GitOpsGenerationCompleted {
            request_id: data.request_id,
            backup_id: data.backup_id,
            status: data.status,
            files_generated: data.files_generated,
            files_committed: data.files_committed,
            git_commit_hash: data.git_commit_hash,
            duration_seconds: data.duration_seconds,
        });
        Ok(())
    }

    // -- server -------------------------------------------------------------

    /// Bind the webhook server and serve until shutdown
    ///
    /// Returns the bound address (useful with port 0 in tests).
    pub async fn start_server(self: Arc<Self>) -> Result<SocketAddr> {
        let address = format!("{}:{}", self.config.bind_address, self.config.bind_port);
        let listener = tokio::net::TcpListener::bind(&address).await.map_err(|e| {
            BackupForgeError::Configuration(format!("bridge bind {address}: {e}"))
        })?;
        let local = listener.local_addr().map_err(|e| {
            BackupForgeError::Configuration(format!("bridge local addr: {e}"))
        })?;

        let router = build_router(self.clone());
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await;
            if let Err(e) = served {
                log_warn(LogCategory::Bridge, &format!("Webhook server error: {e}"));
            }
        });

        log_info(
            LogCategory::Bridge,
            &format!("Webhook server listening on {local}"),
        );
        Ok(local)
    }
}

/// Used memory reported by the host, for the health snapshot
fn process_memory_bytes() -> u64 {
    use std::sync::OnceLock;

    static SYSTEM: OnceLock<std::sync::Mutex<sysinfo::System>> = OnceLock::new();

    let system = SYSTEM.get_or_init(|| {
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        std::sync::Mutex::new(system)
    });

    if let Ok(mut system) = system.lock() {
        system.refresh_memory();
        system.used_memory()
    } else {
        0
    }
}

/// Registration request body
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub endpoint: String,
    #[serde(default)]
    pub version: String,
}

/// Incoming webhook envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub data: Value,
}

/// `backup.completed` webhook payload
#[derive(Debug, Deserialize)]
struct BackupCompletedData {
    #[serde(rename = "backupId")]
    backup_id: String,
    #[serde(rename = "clusterName", default)]
    cluster_name: String,
    success: bool,
    #[serde(rename = "resourceCount", default)]
    resource_count: u64,
    #[serde(default)]
    size: u64,
    #[serde(rename = "errorMessage", default)]
    error_message: Option<String>,
    #[serde(rename = "objectPath", default)]
    object_path: Option<String>,
}

/// `gitops.completed` webhook payload
#[derive(Debug, Deserialize)]
struct GitOpsCompletedData {
    #[serde(rename = "requestId")]
    request_id: String,
    #[serde(rename = "backupId", default)]
    backup_id: Option<String>,
    status: String,
    #[serde(rename = "filesGenerated", default)]
    files_generated: u64,
    #[serde(rename = "filesCommitted", default)]
    files_committed: u64,
    #[serde(rename = "gitCommitHash", default)]
    git_commit_hash: Option<String>,
    #[serde(rename = "durationSeconds", default)]
    duration_seconds: f64,
}

fn build_router(bridge: Arc<IntegrationBridge>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/register/:kind", post(handle_register))
        .route("/webhooks/backup/completed", post(handle_backup_completed))
        .route("/webhooks/gitops/generate", post(handle_gitops_generate))
        .route("/webhooks/gitops/completed", post(handle_gitops_completed))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(bridge)
}

async fn handle_health(
    State(bridge): State<Arc<IntegrationBridge>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(status) = bridge.authorize(&headers, false) {
        return (status, Json(json!({"error": "unauthorized"})));
    }
    (StatusCode::OK, Json(bridge.health_snapshot()))
}

async fn handle_status(
    State(bridge): State<Arc<IntegrationBridge>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(status) = bridge.authorize(&headers, false) {
        return (status, Json(json!({"error": "unauthorized"})));
    }
    (StatusCode::OK, Json(bridge.status_snapshot()))
}

async fn handle_register(
    State(bridge): State<Arc<IntegrationBridge>>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    Json(request): Json<RegisterRequest>,
) -> impl IntoResponse {
    if let Err(status) = bridge.authorize(&headers, true) {
        return (status, Json(json!({"error": "unauthorized"})));
    }
    if !COMPONENT_KINDS.contains(&kind.as_str()) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("unknown component kind '{kind}'")})),
        );
    }
    match bridge.register_component(&kind, &request.endpoint, &request.version) {
        Ok(registration) => (StatusCode::CREATED, Json(json!({"id": registration.id}))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

async fn handle_backup_completed(
    State(bridge): State<Arc<IntegrationBridge>>,
    headers: HeaderMap,
    Json(envelope): Json<WebhookEnvelope>,
) -> impl IntoResponse {
    if let Err(status) = bridge.authorize(&headers, true) {
        return (status, Json(json!({"error": "unauthorized"})));
    }
    match bridge.ingest_backup_completed(&envelope) {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({"accepted": true}))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

async fn handle_gitops_generate(
    State(bridge): State<Arc<IntegrationBridge>>,
    headers: HeaderMap,
    Json(envelope): Json<WebhookEnvelope>,
) -> impl IntoResponse {
    if let Err(status) = bridge.authorize(&headers, true) {
        return (status, Json(json!({"error": "unauthorized"})));
    }

    // Manual trigger: treat like a successful completed backup
    let backup_id = envelope.data["backupId"]
        .as_str()
        .or_else(|| envelope.data["backup_id"].as_str())
        .unwrap_or_default()
        .to_string();
    if backup_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "backupId is required"})),
        );
    }
    let cluster = envelope.data["clusterName"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    if bridge.first_sighting("gitops.generation.requested", &backup_id) {
        bridge.schedule_gitops_generation(backup_id, cluster);
    }
    (StatusCode::ACCEPTED, Json(json!({"accepted": true})))
}

async fn handle_gitops_completed(
    State(bridge): State<Arc<IntegrationBridge>>,
    headers: HeaderMap,
    Json(envelope): Json<WebhookEnvelope>,
) -> impl IntoResponse {
    if let Err(status) = bridge.authorize(&headers, true) {
        return (status, Json(json!({"error": "unauthorized"})));
    }
    match bridge.ingest_gitops_completed(&envelope) {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({"accepted": true}))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge_with(config: BridgeConfig) -> Arc<IntegrationBridge> {
        IntegrationBridge::new(config, Arc::new(BreakerManager::new())).unwrap()
    }

    fn quick_bridge() -> Arc<IntegrationBridge> {
        bridge_with(BridgeConfig {
            debounce_secs: 0,
            dedup_ttl_secs: 60,
            ..BridgeConfig::default()
        })
    }

    #[test]
    fn test_event_bus_ring_accounting() {
        let bus = EventBus::new(4);
        for i in 0..10 {
            bus.publish(PipelineEvent::BackupStarted {
                backup_id: format!("b{i}"),
                cluster: "c".to_string(),
            });
        }

        assert_eq!(bus.produced_count(), 10);
        assert_eq!(bus.dropped_count(), 6);
        assert_eq!(bus.buffered_count(), 4);
        // Occupancy never exceeds the configured size
        assert!(bus.buffered_count() <= 4);

        // The ring keeps the newest events
        let recent = bus.recent(10);
        assert_eq!(recent.len(), 4);
        assert_eq!(recent.last().unwrap().data["backup_id"], "b9");
    }

    #[test]
    fn test_envelope_shape() {
        let envelope = EventEnvelope::wrap(
            "backup-forge",
            &PipelineEvent::BackupCompleted {
                backup_id: "b1".to_string(),
                cluster: "prod".to_string(),
                success: true,
                resource_count: 6,
                size_bytes: 1234,
                object_path: Some("backups/prod/m.json".to_string()),
                error_message: None,
            },
        );
        assert_eq!(envelope.event_type, "backup.completed");
        assert!(!envelope.id.is_empty());
        assert_eq!(envelope.data["backup_id"], "b1");
        assert_eq!(envelope.data["resource_count"], 6);
    }

    #[test]
    fn test_component_registration_and_kinds() {
        let bridge = quick_bridge();

        let registered = bridge
            .register_component("gitops", "http://localhost:9000", "1.0.0")
            .unwrap();
        assert_eq!(registered.status, ComponentStatus::Unknown);
        assert_eq!(bridge.components().len(), 1);

        assert!(bridge
            .register_component("dashboard", "http://x", "1.0")
            .is_err());
        assert!(bridge.register_component("backup", "", "1.0").is_err());

        assert!(bridge.deregister_component(&registered.id));
        assert!(!bridge.deregister_component(&registered.id));
    }

    #[test]
    fn test_dedup_suppresses_within_ttl() {
        let bridge = quick_bridge();
        assert!(bridge.first_sighting("gitops.generation.requested", "b1"));
        assert!(!bridge.first_sighting("gitops.generation.requested", "b1"));
        // Different correlation id is unaffected
        assert!(bridge.first_sighting("gitops.generation.requested", "b2"));
        // Different event type is tracked separately
        assert!(bridge.first_sighting("backup.completed", "b1"));
    }

    #[tokio::test]
    async fn test_backup_completed_triggers_flow_and_completion_closes_it() {
        let bridge = quick_bridge();
        bridge.clone().start_event_pump();

        bridge
            .ingest_backup_completed(&WebhookEnvelope {
                id: "e1".to_string(),
                event_type: "backup.completed".to_string(),
                source: "test".to_string(),
                timestamp: Some(Utc::now()),
                data: json!({
                    "backupId": "b1",
                    "clusterName": "prod",
                    "success": true,
                    "resourceCount": 6,
                    "size": 1000
                }),
            })
            .unwrap();

        // Zero debounce: the pending flow appears shortly after
        let mut request_id = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Some(flow) = bridge.pending_flows.get("b1") {
                request_id = Some(flow.request_id.clone());
                break;
            }
        }
        let request_id = request_id.expect("pending flow should be recorded");

        bridge
            .ingest_gitops_completed(&WebhookEnvelope {
                id: "e2".to_string(),
                event_type: "gitops.completed".to_string(),
                source: "generator".to_string(),
                timestamp: Some(Utc::now()),
                data: json!({
                    "requestId": request_id,
                    "backupId": "b1",
                    "status": "completed",
                    "filesGenerated": 12,
                    "filesCommitted": 12,
                    "gitCommitHash": "abc123",
                    "durationSeconds": 4.2
                }),
            })
            .unwrap();

        assert_eq!(bridge.flow_success_count(), 1);
        assert!(bridge.pending_flows.get("b1").is_none());
        bridge.shutdown();
    }

    #[tokio::test]
    async fn test_failed_backup_does_not_trigger_generation() {
        let bridge = quick_bridge();
        bridge.clone().start_event_pump();

        bridge
            .ingest_backup_completed(&WebhookEnvelope {
                id: "e1".to_string(),
                event_type: "backup.completed".to_string(),
                source: "test".to_string(),
                timestamp: Some(Utc::now()),
                data: json!({
                    "backupId": "b-failed",
                    "clusterName": "prod",
                    "success": false
                }),
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(bridge.pending_flows.get("b-failed").is_none());
        bridge.shutdown();
    }

    #[test]
    fn test_authorization_levels() {
        let bridge = bridge_with(BridgeConfig {
            auth_token: Some("admin-token".to_string()),
            viewer_token: Some("viewer-token".to_string()),
            ..BridgeConfig::default()
        });

        let mut headers = HeaderMap::new();
        assert_eq!(
            bridge.authorize(&headers, false),
            Err(StatusCode::UNAUTHORIZED)
        );

        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer wrong".parse().unwrap(),
        );
        assert_eq!(
            bridge.authorize(&headers, true),
            Err(StatusCode::UNAUTHORIZED)
        );

        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer viewer-token".parse().unwrap(),
        );
        assert_eq!(bridge.authorize(&headers, false), Ok(()));
        assert_eq!(bridge.authorize(&headers, true), Err(StatusCode::FORBIDDEN));

        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer admin-token".parse().unwrap(),
        );
        assert_eq!(bridge.authorize(&headers, true), Ok(()));
    }

    #[test]
    fn test_no_auth_configured_allows_all() {
        let bridge = quick_bridge();
        let headers = HeaderMap::new();
        assert_eq!(bridge.authorize(&headers, true), Ok(()));
    }
}
