//! # Resilient Clients
//!
//! Typed wrappers for every external dependency — object store, cluster API,
//! Git, and HTTP — that route each call through the composition
//! retry(breaker(timeout(op))).
//!
//! The raw SDK surface is abstracted behind backend traits carrying exactly
//! the operations the core consumes, which keeps the pipeline independent of
//! any particular client library and makes the in-memory backends below
//! first-class citizens for tests and local development.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::logging::{log_info, log_warn, LogCategory};
use crate::resilience_core::{
    BreakerManager, CircuitBreaker, RetryConfig, RetryExecutor, DEP_CLUSTER_API, DEP_GIT,
    DEP_OBJECT_STORE,
};
use crate::runtime_config::ObjectStoreConfig;
use crate::{BackupForgeError, Result};

/// Metadata for one stored object
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// One page of an object-store listing
#[derive(Debug, Clone, Default)]
pub struct ObjectPage {
    pub objects: Vec<ObjectMeta>,
    pub continuation: Option<String>,
}

/// Raw S3-compatible operations the core consumes
#[async_trait]
pub trait ObjectStoreBackend: Send + Sync {
    async fn head_bucket(&self, bucket: &str) -> Result<bool>;
    async fn create_bucket(&self, bucket: &str) -> Result<()>;
    async fn put_object(&self, bucket: &str, key: &str, payload: Bytes) -> Result<()>;
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<ObjectPage>;
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<()>;
}

/// One discovery group from the cluster API
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ApiGroup {
    pub name: String,
    pub preferred_version: String,
}

/// One resource kind from the preferred-resources catalogue
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ApiResource {
    pub group: String,
    pub version: String,
    pub plural: String,
    pub namespaced: bool,
    pub verbs: Vec<String>,
}

impl ApiResource {
    /// `group/version`, or bare `version` for the core group
    pub fn group_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn supports_list(&self) -> bool {
        self.verbs.iter().any(|v| v == "list")
    }
}

/// One page of a cluster API list call
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<Value>,
    pub continuation: Option<String>,
}

/// Raw cluster API operations the core consumes
///
/// Retrieved objects are opaque JSON maps; typed access happens only for
/// specific metadata fields during filtering and normalization.
#[async_trait]
pub trait ClusterApiBackend: Send + Sync {
    async fn server_groups(&self) -> Result<Vec<ApiGroup>>;
    async fn server_preferred_resources(&self) -> Result<Vec<ApiResource>>;
    async fn list_objects(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        continuation: Option<String>,
        limit: u32,
    ) -> Result<ListPage>;
    async fn get_namespace(&self, name: &str) -> Result<Option<Value>>;
    async fn list_namespaces(&self) -> Result<Vec<Value>>;
    async fn list_nodes(&self, limit: u32) -> Result<Vec<Value>>;
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<Value>>;
    /// Fetch a cluster-scoped object by coordinates, `None` when the kind or
    /// object is absent (vendor objects are optional evidence, never a hard
    /// dependency)
    async fn get_cluster_scoped(
        &self,
        group: &str,
        version: &str,
        plural: &str,
        name: &str,
    ) -> Result<Option<Value>>;
}

/// Git operations exposed by the resilient Git client
#[async_trait]
pub trait GitBackend: Send + Sync {
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<()>;
    async fn fetch(&self, repo: &Path) -> Result<()>;
    async fn pull(&self, repo: &Path) -> Result<()>;
    async fn add_all(&self, repo: &Path) -> Result<()>;
    async fn commit(&self, repo: &Path, message: &str) -> Result<String>;
    async fn push(&self, repo: &Path) -> Result<()>;
    async fn status(&self, repo: &Path) -> Result<String>;
    async fn checkout_branch(&self, repo: &Path, branch: &str, create: bool) -> Result<()>;
    async fn tag(&self, repo: &Path, tag: &str) -> Result<()>;
}

/// Classify an HTTP status into the error taxonomy
///
/// 408, 429, and 5xx are transient (retryable); remaining 4xx are permanent.
pub fn classify_http_status(dependency: &str, status: u16, detail: &str) -> BackupForgeError {
    match status {
        408 | 429 => BackupForgeError::TransientRemote {
            dependency: dependency.to_string(),
            message: format!("status {status}: {detail}"),
        },
        s if s >= 500 => BackupForgeError::TransientRemote {
            dependency: dependency.to_string(),
            message: format!("status {status}: {detail}"),
        },
        s if s >= 400 => BackupForgeError::PermanentRemote {
            dependency: dependency.to_string(),
            message: format!("status {status}: {detail}"),
        },
        s => BackupForgeError::TransientRemote {
            dependency: dependency.to_string(),
            message: format!("unexpected status {s}: {detail}"),
        },
    }
}

/// Object store wrapper routing every call through breaker + retry
pub struct ResilientObjectStore {
    backend: Arc<dyn ObjectStoreBackend>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryExecutor,
    config: ObjectStoreConfig,
    active_bucket: RwLock<String>,
}

impl ResilientObjectStore {
    pub fn new(
        backend: Arc<dyn ObjectStoreBackend>,
        breakers: &BreakerManager,
        config: ObjectStoreConfig,
    ) -> Self {
        let active = config.bucket.clone();
        Self {
            backend,
            breaker: breakers.breaker(DEP_OBJECT_STORE),
            retry: RetryExecutor::new(RetryConfig::medium()),
            config,
            active_bucket: RwLock::new(active),
        }
    }

    /// Override the retry policy (pipeline tuning)
    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    /// The bucket all subsequent operations target
    pub fn active_bucket(&self) -> String {
        self.active_bucket.read().clone()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Verify the configured bucket is reachable, creating it or walking the
    /// fallback list as policy allows; returns the bucket selected
    pub async fn ensure_bucket(&self, cancel: &CancellationToken) -> Result<String> {
        let primary = self.config.bucket.clone();
        match self.bucket_ready(cancel, &primary).await {
            Ok(true) => {
                *self.active_bucket.write() = primary.clone();
                return Ok(primary);
            }
            Ok(false) if self.config.auto_create_bucket => {
                let backend = self.backend.clone();
                let bucket = primary.clone();
                self.retry
                    .execute(cancel, || {
                        let backend = backend.clone();
                        let bucket = bucket.clone();
                        self.breaker
                            .execute(move || async move { backend.create_bucket(&bucket).await })
                    })
                    .await?;
                log_info(
                    LogCategory::ObjectStore,
                    &format!("Created backup bucket '{primary}'"),
                );
                *self.active_bucket.write() = primary.clone();
                return Ok(primary);
            }
            Ok(false) => {}
            Err(e) => {
                if self.config.fallback_buckets.is_empty() {
                    return Err(e);
                }
                log_warn(
                    LogCategory::ObjectStore,
                    &format!("Primary bucket '{primary}' unreachable: {e}"),
                );
            }
        }

        for fallback in &self.config.fallback_buckets {
            if let Ok(true) = self.bucket_ready(cancel, fallback).await {
                log_warn(
                    LogCategory::ObjectStore,
                    &format!("Primary bucket '{primary}' unavailable, using fallback '{fallback}'"),
                );
                *self.active_bucket.write() = fallback.clone();
                return Ok(fallback.clone());
            }
        }

        Err(BackupForgeError::Configuration(format!(
            "bucket '{primary}' unavailable and no usable fallback bucket"
        )))
    }

    async fn bucket_ready(&self, cancel: &CancellationToken, bucket: &str) -> Result<bool> {
        let backend = self.backend.clone();
        let bucket = bucket.to_string();
        self.retry
            .execute(cancel, || {
                let backend = backend.clone();
                let bucket = bucket.clone();
                self.breaker
                    .execute(move || async move { backend.head_bucket(&bucket).await })
            })
            .await
    }

    /// Upload one object under the active bucket
    pub async fn put_object(
        &self,
        cancel: &CancellationToken,
        key: &str,
        payload: Bytes,
    ) -> Result<()> {
        let bucket = self.active_bucket();
        let backend = self.backend.clone();
        self.retry
            .execute(cancel, || {
                let backend = backend.clone();
                let bucket = bucket.clone();
                let key = key.to_string();
                let payload = payload.clone();
                self.breaker.execute(move || async move {
                    backend.put_object(&bucket, &key, payload).await
                })
            })
            .await
    }

    /// Upload with a caller-provided retry profile (per-kind pipeline policy)
    pub async fn put_object_with(
        &self,
        retry: &RetryExecutor,
        cancel: &CancellationToken,
        key: &str,
        payload: Bytes,
    ) -> Result<()> {
        let bucket = self.active_bucket();
        let backend = self.backend.clone();
        retry
            .execute(cancel, || {
                let backend = backend.clone();
                let bucket = bucket.clone();
                let key = key.to_string();
                let payload = payload.clone();
                self.breaker.execute(move || async move {
                    backend.put_object(&bucket, &key, payload).await
                })
            })
            .await
    }

    /// One listing page under the active bucket
    pub async fn list_objects(
        &self,
        cancel: &CancellationToken,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<ObjectPage> {
        let bucket = self.active_bucket();
        let backend = self.backend.clone();
        self.retry
            .execute(cancel, || {
                let backend = backend.clone();
                let bucket = bucket.clone();
                let prefix = prefix.to_string();
                let continuation = continuation.clone();
                self.breaker.execute(move || async move {
                    backend.list_objects(&bucket, &prefix, continuation).await
                })
            })
            .await
    }

    /// Collect every object under a prefix, following pagination
    pub async fn list_all(&self, cancel: &CancellationToken, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut all = Vec::new();
        let mut continuation = None;
        loop {
            let page = self.list_objects(cancel, prefix, continuation).await?;
            all.extend(page.objects);
            match page.continuation {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }
        Ok(all)
    }

    /// Batch delete under the active bucket
    pub async fn delete_objects(&self, cancel: &CancellationToken, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let bucket = self.active_bucket();
        let backend = self.backend.clone();
        self.retry
            .execute(cancel, || {
                let backend = backend.clone();
                let bucket = bucket.clone();
                let keys = keys.to_vec();
                self.breaker
                    .execute(move || async move { backend.delete_objects(&bucket, &keys).await })
            })
            .await
    }
}

/// Cluster API wrapper routing every call through breaker + retry
pub struct ResilientClusterApi {
    backend: Arc<dyn ClusterApiBackend>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryExecutor,
}

impl ResilientClusterApi {
    pub fn new(backend: Arc<dyn ClusterApiBackend>, breakers: &BreakerManager) -> Self {
        Self {
            backend,
            breaker: breakers.breaker(DEP_CLUSTER_API),
            retry: RetryExecutor::new(RetryConfig::medium()),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn server_groups(&self, cancel: &CancellationToken) -> Result<Vec<ApiGroup>> {
        let backend = self.backend.clone();
        self.retry
            .execute(cancel, || {
                let backend = backend.clone();
                self.breaker
                    .execute(move || async move { backend.server_groups().await })
            })
            .await
    }

    pub async fn server_preferred_resources(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<ApiResource>> {
        let backend = self.backend.clone();
        self.retry
            .execute(cancel, || {
                let backend = backend.clone();
                self.breaker
                    .execute(move || async move { backend.server_preferred_resources().await })
            })
            .await
    }

    /// One list page with a caller-provided retry profile; each page call is
    /// a single retry-wrapped cluster API invocation
    pub async fn list_page(
        &self,
        retry: &RetryExecutor,
        cancel: &CancellationToken,
        resource: &ApiResource,
        namespace: Option<&str>,
        continuation: Option<String>,
        limit: u32,
    ) -> Result<ListPage> {
        let backend = self.backend.clone();
        retry
            .execute(cancel, || {
                let backend = backend.clone();
                let resource = resource.clone();
                let namespace = namespace.map(|s| s.to_string());
                let continuation = continuation.clone();
                self.breaker.execute(move || async move {
                    backend
                        .list_objects(&resource, namespace.as_deref(), continuation, limit)
                        .await
                })
            })
            .await
    }

    pub async fn get_namespace(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<Option<Value>> {
        let backend = self.backend.clone();
        self.retry
            .execute(cancel, || {
                let backend = backend.clone();
                let name = name.to_string();
                self.breaker
                    .execute(move || async move { backend.get_namespace(&name).await })
            })
            .await
    }

    pub async fn list_namespaces(&self, cancel: &CancellationToken) -> Result<Vec<Value>> {
        let backend = self.backend.clone();
        self.retry
            .execute(cancel, || {
                let backend = backend.clone();
                self.breaker
                    .execute(move || async move { backend.list_namespaces().await })
            })
            .await
    }

    pub async fn list_nodes(&self, cancel: &CancellationToken, limit: u32) -> Result<Vec<Value>> {
        let backend = self.backend.clone();
        self.retry
            .execute(cancel, || {
                let backend = backend.clone();
                self.breaker
                    .execute(move || async move { backend.list_nodes(limit).await })
            })
            .await
    }

    pub async fn get_config_map(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Value>> {
        let backend = self.backend.clone();
        self.retry
            .execute(cancel, || {
                let backend = backend.clone();
                let namespace = namespace.to_string();
                let name = name.to_string();
                self.breaker.execute(move || async move {
                    backend.get_config_map(&namespace, &name).await
                })
            })
            .await
    }

    pub async fn get_cluster_scoped(
        &self,
        cancel: &CancellationToken,
        group: &str,
        version: &str,
        plural: &str,
        name: &str,
    ) -> Result<Option<Value>> {
        let backend = self.backend.clone();
        self.retry
            .execute(cancel, || {
                let backend = backend.clone();
                let group = group.to_string();
                let version = version.to_string();
                let plural = plural.to_string();
                let name = name.to_string();
                self.breaker.execute(move || async move {
                    backend
                        .get_cluster_scoped(&group, &version, &plural, &name)
                        .await
                })
            })
            .await
    }
}

/// Git client authentication
#[derive(Debug, Clone, Default)]
pub enum GitAuth {
    #[default]
    None,
    /// SSH private key path, wired through GIT_SSH_COMMAND
    SshKey(String),
    /// HTTPS personal-access token, wired through an auth header
    Token(String),
}

/// Git backend shelling out to the `git` binary
///
/// Command invocation details stay inside this type; everything above it sees
/// only the [`GitBackend`] operations.
pub struct ProcessGitBackend {
    auth: GitAuth,
}

impl ProcessGitBackend {
    pub fn new(auth: GitAuth) -> Self {
        Self { auth }
    }

    async fn run(&self, dir: Option<&Path>, args: &[&str]) -> Result<String> {
        let mut command = tokio::process::Command::new("git");
        if let Some(dir) = dir {
            command.current_dir(dir);
        }
        match &self.auth {
            GitAuth::SshKey(key_path) => {
                command.env(
                    "GIT_SSH_COMMAND",
                    format!("ssh -i {key_path} -o StrictHostKeyChecking=accept-new"),
                );
            }
            GitAuth::Token(token) => {
                command.args([
                    "-c",
                    &format!("http.extraheader=Authorization: Bearer {token}"),
                ]);
            }
            GitAuth::None => {}
        }
        command.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = command.output().await.map_err(|e| {
            BackupForgeError::TransientRemote {
                dependency: DEP_GIT.to_string(),
                message: format!("failed to spawn git: {e}"),
            }
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
        let transient = ["could not resolve host", "connection", "timed out", "early eof"]
            .iter()
            .any(|marker| stderr.contains(marker));
        if transient {
            Err(BackupForgeError::TransientRemote {
                dependency: DEP_GIT.to_string(),
                message: stderr.chars().take(300).collect(),
            })
        } else {
            Err(BackupForgeError::PermanentRemote {
                dependency: DEP_GIT.to_string(),
                message: stderr.chars().take(300).collect(),
            })
        }
    }
}

#[async_trait]
impl GitBackend for ProcessGitBackend {
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<()> {
        self.run(None, &["clone", url, &dest.to_string_lossy()])
            .await
            .map(|_| ())
    }

    async fn fetch(&self, repo: &Path) -> Result<()> {
        self.run(Some(repo), &["fetch", "--prune"]).await.map(|_| ())
    }

    async fn pull(&self, repo: &Path) -> Result<()> {
        self.run(Some(repo), &["pull", "--ff-only"]).await.map(|_| ())
    }

    async fn add_all(&self, repo: &Path) -> Result<()> {
        self.run(Some(repo), &["add", "--all"]).await.map(|_| ())
    }

    async fn commit(&self, repo: &Path, message: &str) -> Result<String> {
        self.run(Some(repo), &["commit", "--message", message])
            .await?;
        self.run(Some(repo), &["rev-parse", "HEAD"]).await
    }

    async fn push(&self, repo: &Path) -> Result<()> {
        self.run(Some(repo), &["push"]).await.map(|_| ())
    }

    async fn status(&self, repo: &Path) -> Result<String> {
        self.run(Some(repo), &["status", "--porcelain"]).await
    }

    async fn checkout_branch(&self, repo: &Path, branch: &str, create: bool) -> Result<()> {
        if create {
            self.run(Some(repo), &["checkout", "-b", branch]).await.map(|_| ())
        } else {
            self.run(Some(repo), &["checkout", branch]).await.map(|_| ())
        }
    }

    async fn tag(&self, repo: &Path, tag: &str) -> Result<()> {
        self.run(Some(repo), &["tag", tag]).await.map(|_| ())
    }
}

/// Git wrapper routing every operation through breaker + retry
pub struct ResilientGitClient {
    backend: Arc<dyn GitBackend>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryExecutor,
}

impl ResilientGitClient {
    pub fn new(backend: Arc<dyn GitBackend>, breakers: &BreakerManager) -> Self {
        Self {
            backend,
            breaker: breakers.breaker(DEP_GIT),
            retry: RetryExecutor::new(RetryConfig::low()),
        }
    }

    /// Override the retry policy
    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    pub async fn clone_repo(
        &self,
        cancel: &CancellationToken,
        url: &str,
        dest: &Path,
    ) -> Result<()> {
        let backend = self.backend.clone();
        self.retry
            .execute(cancel, || {
                let backend = backend.clone();
                let url = url.to_string();
                let dest = dest.to_path_buf();
                self.breaker
                    .execute(move || async move { backend.clone_repo(&url, &dest).await })
            })
            .await
    }

    pub async fn pull(&self, cancel: &CancellationToken, repo: &Path) -> Result<()> {
        let backend = self.backend.clone();
        self.retry
            .execute(cancel, || {
                let backend = backend.clone();
                let repo = repo.to_path_buf();
                self.breaker
                    .execute(move || async move { backend.pull(&repo).await })
            })
            .await
    }

    pub async fn commit_and_push(
        &self,
        cancel: &CancellationToken,
        repo: &Path,
        message: &str,
    ) -> Result<String> {
        let backend = self.backend.clone();
        let commit = self
            .retry
            .execute(cancel, || {
                let backend = backend.clone();
                let repo = repo.to_path_buf();
                let message = message.to_string();
                self.breaker.execute(move || async move {
                    backend.add_all(&repo).await?;
                    backend.commit(&repo, &message).await
                })
            })
            .await?;

        let backend = self.backend.clone();
        self.retry
            .execute(cancel, || {
                let backend = backend.clone();
                let repo = repo.to_path_buf();
                self.breaker
                    .execute(move || async move { backend.push(&repo).await })
            })
            .await?;
        Ok(commit)
    }

    pub async fn fetch(&self, cancel: &CancellationToken, repo: &Path) -> Result<()> {
        let backend = self.backend.clone();
        self.retry
            .execute(cancel, || {
                let backend = backend.clone();
                let repo = repo.to_path_buf();
                self.breaker
                    .execute(move || async move { backend.fetch(&repo).await })
            })
            .await
    }

    pub async fn push(&self, cancel: &CancellationToken, repo: &Path) -> Result<()> {
        let backend = self.backend.clone();
        self.retry
            .execute(cancel, || {
                let backend = backend.clone();
                let repo = repo.to_path_buf();
                self.breaker
                    .execute(move || async move { backend.push(&repo).await })
            })
            .await
    }

    pub async fn status(&self, cancel: &CancellationToken, repo: &Path) -> Result<String> {
        let backend = self.backend.clone();
        self.retry
            .execute(cancel, || {
                let backend = backend.clone();
                let repo = repo.to_path_buf();
                self.breaker
                    .execute(move || async move { backend.status(&repo).await })
            })
            .await
    }

    pub async fn checkout_branch(
        &self,
        cancel: &CancellationToken,
        repo: &Path,
        branch: &str,
        create: bool,
    ) -> Result<()> {
        let backend = self.backend.clone();
        self.retry
            .execute(cancel, || {
                let backend = backend.clone();
                let repo = repo.to_path_buf();
                let branch = branch.to_string();
                self.breaker.execute(move || async move {
                    backend.checkout_branch(&repo, &branch, create).await
                })
            })
            .await
    }

    pub async fn tag(&self, cancel: &CancellationToken, repo: &Path, tag: &str) -> Result<()> {
        let backend = self.backend.clone();
        self.retry
            .execute(cancel, || {
                let backend = backend.clone();
                let repo = repo.to_path_buf();
                let tag = tag.to_string();
                self.breaker
                    .execute(move || async move { backend.tag(&repo, &tag).await })
            })
            .await
    }
}

/// HTTP wrapper with per-logical-endpoint breakers and a pooled client
///
/// Used by the bridge for health probes and webhook delivery.
pub struct ResilientHttpClient {
    client: reqwest::Client,
    breakers: Arc<BreakerManager>,
    retry: RetryExecutor,
}

impl ResilientHttpClient {
    pub fn new(breakers: Arc<BreakerManager>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(8)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| BackupForgeError::Configuration(format!("http client: {e}")))?;
        Ok(Self {
            client,
            breakers,
            retry: RetryExecutor::new(RetryConfig {
                max_attempts: 3,
                initial_delay: std::time::Duration::from_millis(200),
                max_delay: std::time::Duration::from_secs(5),
                multiplier: 2.0,
                jitter_pct: 0.1,
            }),
        })
    }

    fn breaker_for(&self, url: &str) -> Arc<CircuitBreaker> {
        let host = reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_else(|| "generic".to_string());
        self.breakers.breaker(&format!("http:{host}"))
    }

    async fn send(
        &self,
        cancel: &CancellationToken,
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<Value> {
        let breaker = self.breaker_for(url);
        let url_owned = url.to_string();
        self.retry
            .execute(cancel, || {
                let request = request.try_clone();
                let url = url_owned.clone();
                breaker.execute(move || async move {
                    let request = request.ok_or_else(|| BackupForgeError::Validation(
                        "request body is not clonable for retry".to_string(),
                    ))?;
                    let response = request.send().await.map_err(|e| {
                        BackupForgeError::TransientRemote {
                            dependency: format!("http:{url}"),
                            message: e.to_string(),
                        }
                    })?;

                    let status = response.status().as_u16();
                    if !(200..300).contains(&status) {
                        let detail = response.text().await.unwrap_or_default();
                        return Err(classify_http_status(&format!("http:{url}"), status, &detail));
                    }

                    if status == 204 {
                        return Ok(Value::Null);
                    }
                    response.json::<Value>().await.or(Ok(Value::Null))
                })
            })
            .await
    }

    /// GET returning parsed JSON (health probes)
    pub async fn get_json(&self, cancel: &CancellationToken, url: &str) -> Result<Value> {
        self.send(cancel, self.client.get(url), url).await
    }

    /// POST a JSON body, optionally with a bearer token (webhook delivery)
    pub async fn post_json(
        &self,
        cancel: &CancellationToken,
        url: &str,
        body: &Value,
        bearer: Option<&str>,
    ) -> Result<Value> {
        let mut request = self.client.post(url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        self.send(cancel, request, url).await
    }
}

// ---------------------------------------------------------------------------
// In-memory backends for tests and local development
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredObject {
    payload: Bytes,
    last_modified: DateTime<Utc>,
}

/// In-memory S3-compatible backend with failure injection
///
/// Listing pages are capped at 1000 keys to mirror real stores. Failure
/// injection covers the scenarios the resilience layer must absorb: a number
/// of consecutive `put_object` failures and unreachable buckets.
pub struct MemoryObjectStore {
    buckets: DashMap<String, DashMap<String, StoredObject>>,
    failing_puts: AtomicU32,
    put_latency_ms: AtomicU64,
    unreachable_buckets: DashMap<String, ()>,
    put_calls: AtomicU64,
    delete_calls: AtomicU64,
    list_calls: AtomicU64,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
            failing_puts: AtomicU32::new(0),
            put_latency_ms: AtomicU64::new(0),
            unreachable_buckets: DashMap::new(),
            put_calls: AtomicU64::new(0),
            delete_calls: AtomicU64::new(0),
            list_calls: AtomicU64::new(0),
        }
    }

    /// Make the next `count` put_object calls fail with a transient error
    pub fn fail_next_puts(&self, count: u32) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    /// Delay every put_object call (cancellation and backpressure tests)
    pub fn set_put_latency(&self, latency: std::time::Duration) {
        self.put_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make `head_bucket` report the bucket unreachable
    pub fn set_bucket_unreachable(&self, bucket: &str) {
        self.unreachable_buckets.insert(bucket.to_string(), ());
    }

    pub fn put_call_count(&self) -> u64 {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn delete_call_count(&self) -> u64 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn list_call_count(&self) -> u64 {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// All keys currently stored in a bucket, sorted
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .buckets
            .get(bucket)
            .map(|b| b.iter().map(|e| e.key().clone()).collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Fetch a stored payload
    pub fn get(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.buckets
            .get(bucket)?
            .get(key)
            .map(|o| o.payload.clone())
    }

    /// Rewrite an object's last-modified timestamp (retention tests)
    pub fn set_last_modified(&self, bucket: &str, key: &str, timestamp: DateTime<Utc>) {
        if let Some(bucket) = self.buckets.get(bucket) {
            if let Some(mut object) = bucket.get_mut(key) {
                object.last_modified = timestamp;
            }
        }
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStoreBackend for MemoryObjectStore {
    async fn head_bucket(&self, bucket: &str) -> Result<bool> {
        if self.unreachable_buckets.contains_key(bucket) {
            return Err(BackupForgeError::TransientRemote {
                dependency: DEP_OBJECT_STORE.to_string(),
                message: format!("bucket '{bucket}' unreachable"),
            });
        }
        Ok(self.buckets.contains_key(bucket))
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        self.buckets.entry(bucket.to_string()).or_default();
        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, payload: Bytes) -> Result<()> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);

        let latency = self.put_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(latency)).await;
        }

        let should_fail = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(BackupForgeError::TransientRemote {
                dependency: DEP_OBJECT_STORE.to_string(),
                message: "injected put_object failure".to_string(),
            });
        }

        self.buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(
                key.to_string(),
                StoredObject {
                    payload,
                    last_modified: Utc::now(),
                },
            );
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<ObjectPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        let mut matching: Vec<ObjectMeta> = self
            .buckets
            .get(bucket)
            .map(|b| {
                b.iter()
                    .filter(|e| e.key().starts_with(prefix))
                    .map(|e| ObjectMeta {
                        key: e.key().clone(),
                        size: e.value().payload.len() as u64,
                        last_modified: e.value().last_modified,
                    })
                    .collect()
            })
            .unwrap_or_default();
        matching.sort_by(|a, b| a.key.cmp(&b.key));

        let offset: usize = continuation
            .as_deref()
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        let page: Vec<ObjectMeta> = matching.iter().skip(offset).take(1000).cloned().collect();
        let next = if offset + page.len() < matching.len() {
            Some((offset + page.len()).to_string())
        } else {
            None
        };

        Ok(ObjectPage {
            objects: page,
            continuation: next,
        })
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(bucket) = self.buckets.get(bucket) {
            for key in keys {
                bucket.remove(key);
            }
        }
        Ok(())
    }
}

/// Scripted cluster API backend for tests and local development
///
/// Holds a fixed catalogue plus per-(kind, namespace) object lists, with
/// pagination and transient-failure injection on list calls.
pub struct ScriptedClusterApi {
    groups: RwLock<Vec<ApiGroup>>,
    resources: RwLock<Vec<ApiResource>>,
    namespaces: RwLock<Vec<Value>>,
    nodes: RwLock<Vec<Value>>,
    /// (plural, namespace-or-empty) -> objects
    objects: DashMap<(String, String), Vec<Value>>,
    /// (namespace, name) -> config map object
    config_maps: DashMap<(String, String), Value>,
    /// (group, plural, name) -> cluster-scoped object
    cluster_scoped: DashMap<(String, String, String), Value>,
    failing_lists: AtomicU32,
    list_calls: AtomicU64,
}

impl ScriptedClusterApi {
    pub fn new() -> Self {
        Self {
            groups: RwLock::new(Vec::new()),
            resources: RwLock::new(Vec::new()),
            namespaces: RwLock::new(Vec::new()),
            nodes: RwLock::new(Vec::new()),
            objects: DashMap::new(),
            config_maps: DashMap::new(),
            cluster_scoped: DashMap::new(),
            failing_lists: AtomicU32::new(0),
            list_calls: AtomicU64::new(0),
        }
    }

    pub fn add_group(&self, name: &str, preferred_version: &str) {
        self.groups.write().push(ApiGroup {
            name: name.to_string(),
            preferred_version: preferred_version.to_string(),
        });
    }

    pub fn add_resource(&self, resource: ApiResource) {
        self.resources.write().push(resource);
    }

    /// Register a namespace object with labels
    pub fn add_namespace(&self, name: &str, labels: Value) {
        self.namespaces.write().push(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": name, "labels": labels }
        }));
    }

    pub fn add_node(&self, node: Value) {
        self.nodes.write().push(node);
    }

    /// Register the object list served for a kind in a namespace (empty
    /// namespace for cluster-scoped kinds)
    pub fn set_objects(&self, plural: &str, namespace: &str, objects: Vec<Value>) {
        self.objects
            .insert((plural.to_string(), namespace.to_string()), objects);
    }

    pub fn set_config_map(&self, namespace: &str, name: &str, value: Value) {
        self.config_maps
            .insert((namespace.to_string(), name.to_string()), value);
    }

    pub fn set_cluster_scoped(&self, group: &str, plural: &str, name: &str, value: Value) {
        self.cluster_scoped.insert(
            (group.to_string(), plural.to_string(), name.to_string()),
            value,
        );
    }

    /// Make the next `count` list calls fail with a transient error
    pub fn fail_next_lists(&self, count: u32) {
        self.failing_lists.store(count, Ordering::SeqCst);
    }

    pub fn list_call_count(&self) -> u64 {
        self.list_calls.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedClusterApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterApiBackend for ScriptedClusterApi {
    async fn server_groups(&self) -> Result<Vec<ApiGroup>> {
        Ok(self.groups.read().clone())
    }

    async fn server_preferred_resources(&self) -> Result<Vec<ApiResource>> {
        Ok(self.resources.read().clone())
    }

    async fn list_objects(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        continuation: Option<String>,
        limit: u32,
    ) -> Result<ListPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        let should_fail = self
            .failing_lists
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(BackupForgeError::TransientRemote {
                dependency: DEP_CLUSTER_API.to_string(),
                message: "injected list failure".to_string(),
            });
        }

        let key = (
            resource.plural.clone(),
            namespace.unwrap_or("").to_string(),
        );
        let all = self.objects.get(&key).map(|o| o.clone()).unwrap_or_default();

        let offset: usize = continuation
            .as_deref()
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        let limit = limit.max(1) as usize;
        let page: Vec<Value> = all.iter().skip(offset).take(limit).cloned().collect();
        let next = if offset + page.len() < all.len() {
            Some((offset + page.len()).to_string())
        } else {
            None
        };

        Ok(ListPage {
            objects: page,
            continuation: next,
        })
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Value>> {
        Ok(self
            .namespaces
            .read()
            .iter()
            .find(|ns| ns["metadata"]["name"] == name)
            .cloned())
    }

    async fn list_namespaces(&self) -> Result<Vec<Value>> {
        Ok(self.namespaces.read().clone())
    }

    async fn list_nodes(&self, limit: u32) -> Result<Vec<Value>> {
        Ok(self
            .nodes
            .read()
            .iter()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<Value>> {
        Ok(self
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .map(|v| v.clone()))
    }

    async fn get_cluster_scoped(
        &self,
        group: &str,
        _version: &str,
        plural: &str,
        name: &str,
    ) -> Result<Option<Value>> {
        Ok(self
            .cluster_scoped
            .get(&(group.to_string(), plural.to_string(), name.to_string()))
            .map(|v| v.clone()))
    }
}
