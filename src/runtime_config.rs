//! # Runtime Configuration
//!
//! Layered configuration for backup runs with the precedence
//! explicit config file > environment > detected > built-in default.
//!
//! The recognized environment variable set covers cluster identity, object
//! store credentials, scope filters, pipeline tuning, retention policy, and
//! normalization toggles. Validation happens once at startup; any problem is
//! a fatal [`BackupForgeError::Configuration`] (exit code 3).

use config::{Config, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::logging::{log_info, LogCategory};
use crate::{BackupForgeError, Result};

/// Vendor-variant handling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantMode {
    Enabled,
    Disabled,
    Auto,
}

impl Default for VariantMode {
    fn default() -> Self {
        VariantMode::Auto
    }
}

impl std::str::FromStr for VariantMode {
    type Err = BackupForgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "enabled" | "true" => Ok(VariantMode::Enabled),
            "disabled" | "false" => Ok(VariantMode::Disabled),
            "auto" => Ok(VariantMode::Auto),
            other => Err(BackupForgeError::Configuration(format!(
                "invalid OPENSHIFT_MODE '{other}' (expected enabled|disabled|auto)"
            ))),
        }
    }
}

/// Kind filter interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// Only kinds in `include_kinds` pass
    Allowlist,
    /// Kinds in `exclude_kinds` are removed
    Denylist,
}

impl Default for FilterMode {
    fn default() -> Self {
        FilterMode::Denylist
    }
}

/// Cluster identity overrides and variant handling
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Explicit cluster name (skips detection when set)
    pub name: Option<String>,
    /// Explicit cluster domain (skips detection when set)
    pub domain: Option<String>,
    /// Vendor variant handling
    pub variant_mode: VariantMode,
}

/// S3-compatible object store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub use_ssl: bool,
    /// Create the bucket when `head_bucket` reports it missing
    pub auto_create_bucket: bool,
    /// Ordered buckets tried when the primary is unreachable and
    /// auto-creation is off
    pub fallback_buckets: Vec<String>,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
            bucket: "cluster-backups".to_string(),
            use_ssl: false,
            auto_create_bucket: true,
            fallback_buckets: Vec::new(),
        }
    }
}

/// What a backup job covers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupScope {
    pub include_namespaces: Vec<String>,
    pub exclude_namespaces: Vec<String>,
    pub include_kinds: Vec<String>,
    pub exclude_kinds: Vec<String>,
    pub filter_mode: FilterMode,
    /// `key=value,key2=value2` label predicate
    pub label_selector: Option<String>,
    /// `key=value` annotation predicate
    pub annotation_selector: Option<String>,
    /// Post-normalization serialized size ceiling per object
    pub max_object_bytes: usize,
}

impl Default for BackupScope {
    fn default() -> Self {
        Self {
            include_namespaces: Vec::new(),
            exclude_namespaces: Vec::new(),
            include_kinds: Vec::new(),
            exclude_kinds: Vec::new(),
            filter_mode: FilterMode::Denylist,
            label_selector: None,
            annotation_selector: None,
            max_object_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Worker pool and normalization tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Global worker pool size
    pub workers: usize,
    /// Page size for cluster API list calls
    pub batch_size: u32,
    /// Per-kind cap on simultaneous in-flight items
    pub max_concurrent_per_kind: usize,
    /// Keep `metadata.managedFields` in stored payloads
    pub include_managed_fields: bool,
    /// Keep `status` in stored payloads
    pub include_status: bool,
    /// Back up objects owned by another in-scope object
    pub follow_owner_references: bool,
    /// Re-parse serialized YAML before upload
    pub validate_yaml: bool,
    /// Record normalization failures as skipped instead of failing the item
    pub skip_invalid_resources: bool,
    /// Overall job deadline in seconds
    pub job_deadline_secs: u64,
    /// Grace period for worker drain on shutdown, in seconds
    pub shutdown_grace_secs: u64,
    /// Retry attempts override for pipeline remote calls
    pub retry_attempts: Option<u32>,
    /// Retry initial delay override for pipeline remote calls, in milliseconds
    pub retry_delay_ms: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 100,
            max_concurrent_per_kind: 5,
            include_managed_fields: false,
            include_status: false,
            follow_owner_references: false,
            validate_yaml: false,
            skip_invalid_resources: true,
            job_deadline_secs: 30 * 60,
            shutdown_grace_secs: 30,
            retry_attempts: None,
            retry_delay_ms: None,
        }
    }
}

/// Retention and cleanup policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub enable_cleanup: bool,
    /// Objects older than this many days are deletion candidates
    pub retention_days: u32,
    /// Run cleanup before the pipeline instead of after
    pub cleanup_on_startup: bool,
    /// Bulk-delete batch size
    pub cleanup_batch_size: usize,
    /// Enumerate candidates without deleting
    pub dry_run: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enable_cleanup: false,
            retention_days: 30,
            cleanup_on_startup: false,
            cleanup_batch_size: 1000,
            dry_run: false,
        }
    }
}

/// Integration bridge server and policy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub bind_address: String,
    pub bind_port: u16,
    /// Bearer token required on webhook endpoints when set
    pub auth_token: Option<String>,
    /// Read-only token: accepted on GET endpoints, rejected (403) on writes
    pub viewer_token: Option<String>,
    /// Component health probe interval in seconds
    pub probe_interval_secs: u64,
    /// Consecutive probe failures before a component is unhealthy
    pub unhealthy_after_failures: u32,
    /// Remove a component after this long in `unknown`, in seconds
    pub remove_unknown_after_secs: u64,
    /// Delay between BackupCompleted and GitOpsGenerationRequested
    pub debounce_secs: u64,
    /// Bounded event ring size
    pub event_buffer_size: usize,
    /// Duplicate suppression TTL in seconds
    pub dedup_ttl_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            bind_port: 8080,
            auth_token: None,
            viewer_token: None,
            probe_interval_secs: 30,
            unhealthy_after_failures: 3,
            remove_unknown_after_secs: 600,
            debounce_secs: 30,
            event_buffer_size: 256,
            dedup_ttl_secs: 60,
        }
    }
}

/// Complete configuration for a backup run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub cluster: ClusterConfig,
    pub object_store: ObjectStoreConfig,
    pub scope: BackupScope,
    pub pipeline: PipelineConfig,
    pub retention: RetentionConfig,
    pub bridge: BridgeConfig,
}

impl BackupConfig {
    /// Load configuration from the environment only
    pub fn from_env() -> Result<Self> {
        Self::load(None::<&Path>)
    }

    /// Load configuration with an optional explicit config file
    ///
    /// File values take precedence over environment values; both sit above
    /// built-in defaults. Detected values (cluster identity) are resolved
    /// later by the detector only for fields still unset here.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        // .env files participate as ordinary environment
        dotenvy::dotenv().ok();

        let mut builder = Config::builder();

        // Environment enters as defaults so an explicit config file wins
        for (key, value) in recognized_env_pairs()? {
            builder = builder
                .set_default(key, value)
                .map_err(|e| BackupForgeError::Configuration(e.to_string()))?;
        }

        if let Some(path) = path {
            builder = builder.add_source(File::from(path.as_ref()));
        }

        let config: BackupConfig = builder
            .build()
            .map_err(|e| BackupForgeError::Configuration(e.to_string()))?
            .try_deserialize()
            .map_err(|e| BackupForgeError::Configuration(e.to_string()))?;

        config.validate()?;
        log_info(
            LogCategory::System,
            &format!(
                "Configuration loaded (bucket: {}, filter mode: {:?}, workers: {})",
                config.object_store.bucket, config.scope.filter_mode, config.pipeline.workers
            ),
        );
        Ok(config)
    }

    /// Reject configurations that cannot produce a meaningful run
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.workers == 0 {
            return Err(BackupForgeError::Configuration(
                "pipeline.workers must be at least 1".to_string(),
            ));
        }
        if self.pipeline.max_concurrent_per_kind == 0 {
            return Err(BackupForgeError::Configuration(
                "pipeline.max_concurrent_per_kind must be at least 1".to_string(),
            ));
        }
        if self.pipeline.batch_size == 0 {
            return Err(BackupForgeError::Configuration(
                "pipeline.batch_size must be at least 1".to_string(),
            ));
        }
        if self.scope.max_object_bytes == 0 {
            return Err(BackupForgeError::Configuration(
                "scope.max_object_bytes must be positive".to_string(),
            ));
        }
        if self.scope.filter_mode == FilterMode::Allowlist && self.scope.include_kinds.is_empty() {
            return Err(BackupForgeError::Configuration(
                "allowlist filter mode requires a non-empty include_kinds".to_string(),
            ));
        }
        if self.retention.cleanup_batch_size == 0 {
            return Err(BackupForgeError::Configuration(
                "retention.cleanup_batch_size must be at least 1".to_string(),
            ));
        }
        if self.object_store.bucket.is_empty() {
            return Err(BackupForgeError::Configuration(
                "object_store.bucket must not be empty".to_string(),
            ));
        }
        if let Some(selector) = &self.scope.label_selector {
            parse_selector(selector)?;
        }
        if let Some(selector) = &self.scope.annotation_selector {
            parse_selector(selector)?;
        }
        Ok(())
    }

}

/// Map the recognized environment variables onto typed config values
///
/// Unparseable booleans, integers, and durations fail here so the operator
/// sees the offending variable by name.
fn recognized_env_pairs() -> Result<Vec<(&'static str, config::Value)>> {
    let mut pairs: Vec<(&'static str, config::Value)> = Vec::new();

    let string_vars = [
        ("CLUSTER_NAME", "cluster.name"),
        ("CLUSTER_DOMAIN", "cluster.domain"),
        ("OBJECT_STORE_ENDPOINT", "object_store.endpoint"),
        ("OBJECT_STORE_ACCESS_KEY", "object_store.access_key"),
        ("OBJECT_STORE_SECRET_KEY", "object_store.secret_key"),
        ("OBJECT_STORE_BUCKET", "object_store.bucket"),
        ("LABEL_SELECTOR", "scope.label_selector"),
        ("ANNOTATION_SELECTOR", "scope.annotation_selector"),
    ];
    for (var, key) in string_vars {
        if let Ok(value) = env::var(var) {
            pairs.push((key, value.into()));
        }
    }

    let bool_vars = [
        ("OBJECT_STORE_USE_SSL", "object_store.use_ssl"),
        ("AUTO_CREATE_BUCKET", "object_store.auto_create_bucket"),
        ("ENABLE_CLEANUP", "retention.enable_cleanup"),
        ("CLEANUP_ON_STARTUP", "retention.cleanup_on_startup"),
        ("FOLLOW_OWNER_REFERENCES", "pipeline.follow_owner_references"),
        ("INCLUDE_MANAGED_FIELDS", "pipeline.include_managed_fields"),
        ("INCLUDE_STATUS", "pipeline.include_status"),
        ("VALIDATE_YAML", "pipeline.validate_yaml"),
        ("SKIP_INVALID_RESOURCES", "pipeline.skip_invalid_resources"),
    ];
    for (var, key) in bool_vars {
        if let Ok(value) = env::var(var) {
            pairs.push((key, parse_bool(var, &value)?.into()));
        }
    }

    let list_vars = [
        ("FALLBACK_BUCKETS", "object_store.fallback_buckets"),
        ("INCLUDE_NAMESPACES", "scope.include_namespaces"),
        ("EXCLUDE_NAMESPACES", "scope.exclude_namespaces"),
        ("INCLUDE_RESOURCES", "scope.include_kinds"),
        ("EXCLUDE_RESOURCES", "scope.exclude_kinds"),
    ];
    for (var, key) in list_vars {
        if let Ok(value) = env::var(var) {
            pairs.push((key, split_csv(&value).into()));
        }
    }

    let int_vars = [
        ("BATCH_SIZE", "pipeline.batch_size"),
        ("RETRY_ATTEMPTS", "pipeline.retry_attempts"),
        ("RETENTION_DAYS", "retention.retention_days"),
        ("MAX_RESOURCE_SIZE", "scope.max_object_bytes"),
    ];
    for (var, key) in int_vars {
        if let Ok(value) = env::var(var) {
            let parsed: i64 = value.trim().parse().map_err(|_| {
                BackupForgeError::Configuration(format!("{var} must be an integer, got '{value}'"))
            })?;
            pairs.push((key, parsed.into()));
        }
    }

    if let Ok(value) = env::var("RETRY_DELAY") {
        let duration = parse_duration("RETRY_DELAY", &value)?;
        pairs.push((
            "pipeline.retry_delay_ms",
            (duration.as_millis() as i64).into(),
        ));
    }

    if let Ok(value) = env::var("OPENSHIFT_MODE") {
        let mode: VariantMode = value.parse()?;
        let encoded = match mode {
            VariantMode::Enabled => "enabled",
            VariantMode::Disabled => "disabled",
            VariantMode::Auto => "auto",
        };
        pairs.push(("cluster.variant_mode", encoded.into()));
    }

    Ok(pairs)
}

/// Parse a boolean environment value
pub fn parse_bool(var: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(BackupForgeError::Configuration(format!(
            "{var} must be a boolean, got '{other}'"
        ))),
    }
}

/// Parse a duration value with `ms`, `s`, or `m` suffix (bare numbers are
/// milliseconds)
pub fn parse_duration(var: &str, value: &str) -> Result<Duration> {
    let value = value.trim();
    let (number, unit) = match value.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => value.split_at(idx),
        None => (value, "ms"),
    };

    let quantity: u64 = number.trim().parse().map_err(|_| {
        BackupForgeError::Configuration(format!("{var} has unparseable duration '{value}'"))
    })?;

    match unit.trim() {
        "ms" => Ok(Duration::from_millis(quantity)),
        "s" => Ok(Duration::from_secs(quantity)),
        "m" => Ok(Duration::from_secs(quantity * 60)),
        other => Err(BackupForgeError::Configuration(format!(
            "{var} has unknown duration unit '{other}'"
        ))),
    }
}

/// Split a comma-separated list, dropping empty segments
pub fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse a `key=value,key2=value2` selector into pairs
pub fn parse_selector(selector: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for segment in split_csv(selector) {
        match segment.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                pairs.push((key.trim().to_string(), value.trim().to_string()));
            }
            _ => {
                return Err(BackupForgeError::Configuration(format!(
                    "invalid selector segment '{segment}' (expected key=value)"
                )))
            }
        }
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = BackupConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pipeline.workers, 4);
        assert_eq!(config.pipeline.max_concurrent_per_kind, 5);
        assert_eq!(config.retention.cleanup_batch_size, 1000);
        assert_eq!(config.bridge.debounce_secs, 30);
        assert_eq!(config.scope.filter_mode, FilterMode::Denylist);
        assert!(!config.pipeline.include_managed_fields);
        assert!(!config.pipeline.include_status);
    }

    #[test]
    fn test_allowlist_requires_kinds() {
        let config = BackupConfig {
            scope: BackupScope {
                filter_mode: FilterMode::Allowlist,
                include_kinds: Vec::new(),
                ..BackupScope::default()
            },
            ..BackupConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(BackupForgeError::Configuration(_))
        ));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = BackupConfig {
            pipeline: PipelineConfig {
                workers: 0,
                ..PipelineConfig::default()
            },
            ..BackupConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_bool_values() {
        assert!(parse_bool("X", "true").unwrap());
        assert!(parse_bool("X", "1").unwrap());
        assert!(parse_bool("X", "Yes").unwrap());
        assert!(!parse_bool("X", "false").unwrap());
        assert!(!parse_bool("X", "0").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(
            parse_duration("X", "500").unwrap(),
            Duration::from_millis(500)
        );
        assert_eq!(
            parse_duration("X", "250ms").unwrap(),
            Duration::from_millis(250)
        );
        assert_eq!(parse_duration("X", "2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("X", "3m").unwrap(), Duration::from_secs(180));
        assert!(parse_duration("X", "abc").is_err());
        assert!(parse_duration("X", "5h").is_err());
    }

    #[test]
    fn test_parse_selector_pairs() {
        let pairs = parse_selector("app=web, tier=frontend").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("app".to_string(), "web".to_string()),
                ("tier".to_string(), "frontend".to_string())
            ]
        );
        assert!(parse_selector("nokey").is_err());
        assert!(parse_selector("=value").is_err());
    }

    #[test]
    fn test_split_csv_drops_empties() {
        assert_eq!(
            split_csv("a, b,,c"),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert!(split_csv("").is_empty());
    }

    #[test]
    fn test_env_overrides_apply() {
        env::set_var("CLUSTER_NAME", "env-cluster");
        env::set_var("BATCH_SIZE", "25");
        env::set_var("INCLUDE_NAMESPACES", "default,test-app");
        env::set_var("ENABLE_CLEANUP", "true");

        let config = BackupConfig::from_env().unwrap();
        assert_eq!(config.cluster.name.as_deref(), Some("env-cluster"));
        assert_eq!(config.pipeline.batch_size, 25);
        assert!(config.retention.enable_cleanup);

        env::remove_var("CLUSTER_NAME");
        env::remove_var("BATCH_SIZE");
        env::remove_var("INCLUDE_NAMESPACES");
        env::remove_var("ENABLE_CLEANUP");
    }

    #[test]
    fn test_invalid_env_integer_is_configuration_error() {
        env::set_var("RETENTION_DAYS", "soon");
        let result = BackupConfig::from_env();
        env::remove_var("RETENTION_DAYS");
        assert!(matches!(result, Err(BackupForgeError::Configuration(_))));
    }

    #[test]
    fn test_config_file_wins_over_environment() {
        env::set_var("OBJECT_STORE_BUCKET", "from-env");

        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(file, "[object_store]\nbucket = \"from-file\"").unwrap();

        let config = BackupConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.object_store.bucket, "from-file");

        env::remove_var("OBJECT_STORE_BUCKET");
    }
}
