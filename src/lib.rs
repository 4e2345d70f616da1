//! # Backup Forge — Cluster State Backup & GitOps Orchestration
//!
//! A production-ready system that captures the live state of one or more
//! container-orchestration clusters (resources, configuration, secrets) into an
//! S3-compatible object store, and bridges completed backups into GitOps
//! generation jobs that external reconcilers apply to a target cluster.
//!
//! ## 🚀 System Overview
//!
//! The system combines:
//! - **Parallel Extraction**: A priority-ordered worker pool that walks the
//!   cluster's type catalogue, fetches every in-scope object, normalizes it,
//!   and uploads it under a stable key scheme
//! - **Resilience Substrate**: Per-dependency circuit breakers composed with
//!   retry/backoff around every external call (object store, cluster API,
//!   Git, HTTP webhooks)
//! - **Integration Bridge**: Component registry, bounded event bus, and
//!   webhook server that turn a completed backup into a GitOps generation
//!   request and track its completion
//!
//! ## 🏗️ Architecture Overview
//!
//! A backup run moves through five stages, each timed into [`RunMetrics`]:
//!
//! ### Stage 1: Configuration (startup)
//! - Layered configuration: explicit config > environment > detected > default
//! - Validation up front; configuration errors are fatal (exit code 3)
//!
//! ### Stage 2: Cluster Detection
//! - Cluster name/domain resolved through an ordered evidence chain with a
//!   five-minute cache; vendor variant detection by capability probing
//!
//! ### Stage 3: Discovery + Filtering
//! - Preferred-resources catalogue, list-verb gating, allowlist/denylist
//!   modes, namespace expansion, priority-descending work queue
//!
//! ### Stage 4: Backup Pipeline
//! - Bounded worker pool with per-kind concurrency caps; paginated listing,
//!   label/annotation/owner-reference predicates, normalization, YAML
//!   serialization, keyed upload, per-item error capture, manifest last
//!
//! ### Stage 5: Retention + Bridge Handoff
//! - Batched retention deletes behind the object-store breaker (never
//!   concurrent with the pipeline); `BackupCompleted` published to the
//!   bridge, which schedules a debounced `GitOpsGenerationRequested`
//!
//! ## Error Handling Philosophy
//!
//! Per-item failures are captured in the job manifest and never abort other
//! items. Only configuration errors at startup and a circuit-open surfaced at
//! the orchestrator envelope cause non-zero termination (exit codes 3 and 2
//! respectively); retry exhaustion or any failed item exits 1.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use backup_forge::BackupOrchestrator;
//! use backup_forge::runtime_config::BackupConfig;
//! use backup_forge::resilient_clients::{MemoryObjectStore, ScriptedClusterApi};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BackupConfig::from_env()?;
//!     let store = Arc::new(MemoryObjectStore::new());
//!     let api = Arc::new(ScriptedClusterApi::new());
//!
//!     let mut orchestrator = BackupOrchestrator::new(config, store, api).await?;
//!     let report = orchestrator.run_backup().await?;
//!
//!     println!("backed up {} resources", report.manifest.resource_count);
//!     Ok(())
//! }
//! ```

/// Architecture version for compatibility tracking and upgrade management
pub const ARCHITECTURE_VERSION: &str = "1.4.0-streamlined";

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-run phase timings and throughput figures
///
/// Populated by the orchestrator as a run moves through its stages and
/// embedded into the job manifest for operator visibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetrics {
    pub config_load_ms: u64,
    pub detection_ms: u64,
    pub discovery_ms: u64,
    pub pipeline_ms: u64,
    pub cleanup_ms: u64,
    pub total_ms: u64,
    pub resources_per_second: f64,
    pub bytes_uploaded: u64,
    pub success_rate: f64,
}

impl RunMetrics {
    /// Create a new [`RunMetrics`] with all fields zeroed
    ///
    /// # Examples
    ///
    /// ```
    /// use backup_forge::RunMetrics;
    /// let metrics = RunMetrics::new();
    /// assert_eq!(metrics.total_ms, 0);
    /// ```
    pub fn new() -> Self {
        Self {
            config_load_ms: 0,
            detection_ms: 0,
            discovery_ms: 0,
            pipeline_ms: 0,
            cleanup_ms: 0,
            total_ms: 0,
            resources_per_second: 0.0,
            bytes_uploaded: 0,
            success_rate: 0.0,
        }
    }

    /// Sum the individual phase timings into `total_ms`
    ///
    /// ```
    /// use backup_forge::RunMetrics;
    /// let mut metrics = RunMetrics::new();
    /// metrics.detection_ms = 2;
    /// metrics.discovery_ms = 3;
    /// metrics.pipeline_ms = 40;
    /// metrics.calculate_total();
    /// assert_eq!(metrics.total_ms, 45);
    /// ```
    pub fn calculate_total(&mut self) {
        self.total_ms = self.config_load_ms
            + self.detection_ms
            + self.discovery_ms
            + self.pipeline_ms
            + self.cleanup_ms;
    }
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// Production hardening modules - operational capabilities shared by every stage
pub mod logging;            // Structured logging, audit trails, performance tracking
pub mod resilience_core;    // Circuit breakers, retry executor, breaker manager
pub mod runtime_config;     // Layered configuration, environment overrides, validation

// Core backup and orchestration modules
pub mod backup_pipeline;    // Parallel extraction, normalization, upload, manifest
pub mod cluster_detect;     // Cluster identity/domain/variant evidence chains
pub mod discovery_filter;   // Kind catalogue, include/exclude filters, work items
pub mod integration_bridge; // Component registry, event bus, webhook server
pub mod orchestrator;       // End-to-end run coordination and shutdown
pub mod priority_engine;    // Per-kind priority, retry profiles, concurrency caps
pub mod resilient_clients;  // Typed resilient wrappers for every external dependency
pub mod retention;          // Retention horizon, batched deletes, dry-run

// Re-export the orchestrator types for convenient access
pub use orchestrator::*;

/// Comprehensive error type covering all system components and failure modes
///
/// The variants realize a closed taxonomy: configuration problems are fatal at
/// startup, validation problems are per-item, transient remote causes feed the
/// retry executor, circuit-open rejections are surfaced intact (and never
/// retried), and cancellation propagates unchanged.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum BackupForgeError {
    /// Missing required field, invalid range, unparseable duration
    ///
    /// Surfaced at startup only; fatal (exit code 3).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Per-object failure to normalize, serialize, or pass the size gate
    ///
    /// Captured per-item in the job manifest; never fatal to the run.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Retryable underlying cause - network failure, 5xx, throttle, timeout
    #[error("Transient remote error from {dependency}: {message}")]
    TransientRemote { dependency: String, message: String },

    /// Non-retryable remote refusal - 4xx other than throttle
    #[error("Permanent remote error from {dependency}: {message}")]
    PermanentRemote { dependency: String, message: String },

    /// Request rejected by an open circuit breaker without invoking the call
    ///
    /// Not retried; the orchestrator reports it distinctly (exit code 2).
    #[error("Circuit breaker open for {dependency} (failures: {failure_count})")]
    CircuitOpen {
        dependency: String,
        failure_count: u64,
    },

    /// Retry budget exhausted; wraps the last underlying cause
    #[error("Retry exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: String },

    /// Operation deadline exceeded
    #[error("Timeout: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Context cancellation; propagates unchanged
    #[error("Operation cancelled")]
    Cancelled,
}

impl BackupForgeError {
    /// Whether the retry executor may re-attempt an operation that failed
    /// with this error
    ///
    /// Circuit-open rejections are deliberately non-retryable: retrying would
    /// hammer a breaker that is already shedding load.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackupForgeError::TransientRemote { .. } | BackupForgeError::Timeout { .. }
        )
    }

    /// Whether this error is a circuit-open rejection
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, BackupForgeError::CircuitOpen { .. })
    }

    /// Whether this error is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BackupForgeError::Cancelled)
    }
}

/// Result type for all backup and orchestration operations
pub type Result<T> = std::result::Result<T, BackupForgeError>;
