//! # Cluster Detection
//!
//! Resolves the identity of the cluster being backed up from an ordered
//! evidence chain, strongest source first. Every source is optional: a
//! missing vendor object or an unreadable config map moves the chain along
//! instead of failing the run. Results are cached for five minutes.
//!
//! Name evidence order: environment override, vendor infrastructure object,
//! well-known labels on the `kube-system` namespace, the same labels on up to
//! five nodes, hostname heuristics, then the `unknown-cluster` literal.
//!
//! Domain evidence order: environment override, vendor DNS object, CoreDNS
//! config map parsing, then `cluster.local`.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::logging::{log_info, log_warn, LogCategory};
use crate::resilient_clients::ResilientClusterApi;
use crate::runtime_config::{ClusterConfig, VariantMode};
use crate::Result;

/// Label keys checked on the kube-system namespace and on nodes
pub const WELL_KNOWN_CLUSTER_LABELS: &[&str] = &[
    "cluster-name",
    "kubernetes.io/cluster-name",
    "alpha.eksctl.io/cluster-name",
    "cluster.x-k8s.io/cluster-name",
];

/// Node name suffixes recognized by the hostname heuristic
const HOSTNAME_ROLE_MARKERS: &[&str] = &["master", "control", "worker", "node", "infra"];

/// How many nodes the label scan inspects
const NODE_SCAN_LIMIT: u32 = 5;

/// Detection cache lifetime
pub const DETECTION_CACHE_TTL: Duration = Duration::from_secs(300);

/// Resolved cluster identity, immutable once built for a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterIdentity {
    pub name: String,
    pub domain: String,
    pub is_openshift_variant: bool,
    pub variant_mode: VariantMode,
}

/// Evidence-chain cluster detector with a five-minute cache
///
/// Environment overrides (`CLUSTER_NAME`, `CLUSTER_DOMAIN`) reach this type
/// already folded into [`ClusterConfig`] by the configuration layer, which
/// keeps the precedence rule in one place.
pub struct ClusterDetector {
    api: Arc<ResilientClusterApi>,
    hostname: Option<String>,
    cache: RwLock<Option<(Instant, ClusterIdentity)>>,
    cache_ttl: Duration,
}

impl ClusterDetector {
    pub fn new(api: Arc<ResilientClusterApi>) -> Self {
        Self {
            api,
            hostname: env::var("HOSTNAME").ok(),
            cache: RwLock::new(None),
            cache_ttl: DETECTION_CACHE_TTL,
        }
    }

    /// Override the cache lifetime (tests)
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Override the hostname evidence source
    pub fn with_hostname(mut self, hostname: Option<String>) -> Self {
        self.hostname = hostname;
        self
    }

    /// Resolve the cluster identity, honoring explicit configuration first
    /// and consulting the cache before touching the cluster API
    pub async fn detect(
        &self,
        cancel: &CancellationToken,
        config: &ClusterConfig,
    ) -> Result<ClusterIdentity> {
        if let Some((at, identity)) = self.cache.read().clone() {
            if at.elapsed() < self.cache_ttl {
                return Ok(identity);
            }
        }

        let name = match &config.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => self.detect_name(cancel).await,
        };
        let domain = match &config.domain {
            Some(domain) if !domain.is_empty() => domain.clone(),
            _ => self.detect_domain(cancel).await,
        };
        let is_variant = match config.variant_mode {
            VariantMode::Enabled => true,
            VariantMode::Disabled => false,
            VariantMode::Auto => self.detect_variant(cancel).await,
        };

        let identity = ClusterIdentity {
            name,
            domain,
            is_openshift_variant: is_variant,
            variant_mode: config.variant_mode,
        };
        log_info(
            LogCategory::ClusterApi,
            &format!(
                "Detected cluster '{}' (domain: {}, variant: {})",
                identity.name, identity.domain, identity.is_openshift_variant
            ),
        );

        *self.cache.write() = Some((Instant::now(), identity.clone()));
        Ok(identity)
    }

    /// Drop the cached identity
    pub fn invalidate(&self) {
        *self.cache.write() = None;
    }

    async fn detect_name(&self, cancel: &CancellationToken) -> String {
        if let Some(name) = self.name_from_infrastructure(cancel).await {
            return name;
        }
        if let Some(name) = self.name_from_namespace_labels(cancel).await {
            return name;
        }
        if let Some(name) = self.name_from_node_labels(cancel).await {
            return name;
        }
        if let Some(name) = name_from_hostname(self.hostname.as_deref()) {
            return name;
        }

        log_warn(
            LogCategory::ClusterApi,
            "No cluster name evidence found, using fallback",
        );
        "unknown-cluster".to_string()
    }

    /// Vendor infrastructure object, optional evidence
    async fn name_from_infrastructure(&self, cancel: &CancellationToken) -> Option<String> {
        let result = self
            .api
            .get_cluster_scoped(cancel, "config.openshift.io", "v1", "infrastructures", "cluster")
            .await;
        match result {
            Ok(Some(object)) => object
                .pointer("/status/infrastructureName")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string()),
            Ok(None) => None,
            Err(e) => {
                log_warn(
                    LogCategory::ClusterApi,
                    &format!("Infrastructure object lookup failed: {e}"),
                );
                None
            }
        }
    }

    async fn name_from_namespace_labels(&self, cancel: &CancellationToken) -> Option<String> {
        match self.api.get_namespace(cancel, "kube-system").await {
            Ok(Some(namespace)) => label_value(&namespace, WELL_KNOWN_CLUSTER_LABELS),
            Ok(None) => None,
            Err(e) => {
                log_warn(
                    LogCategory::ClusterApi,
                    &format!("kube-system namespace lookup failed: {e}"),
                );
                None
            }
        }
    }

    async fn name_from_node_labels(&self, cancel: &CancellationToken) -> Option<String> {
        match self.api.list_nodes(cancel, NODE_SCAN_LIMIT).await {
            Ok(nodes) => nodes
                .iter()
                .find_map(|node| label_value(node, WELL_KNOWN_CLUSTER_LABELS)),
            Err(e) => {
                log_warn(
                    LogCategory::ClusterApi,
                    &format!("Node label scan failed: {e}"),
                );
                None
            }
        }
    }

    async fn detect_domain(&self, cancel: &CancellationToken) -> String {
        // Vendor DNS object
        let dns = self
            .api
            .get_cluster_scoped(cancel, "config.openshift.io", "v1", "dnses", "cluster")
            .await;
        if let Ok(Some(object)) = dns {
            if let Some(domain) = object
                .pointer("/spec/baseDomain")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
            {
                return domain.to_string();
            }
        }

        // CoreDNS (then kube-dns) config map parsing
        for name in ["coredns", "kube-dns"] {
            if let Ok(Some(config_map)) = self.api.get_config_map(cancel, "kube-system", name).await
            {
                if let Some(domain) = config_map
                    .pointer("/data/Corefile")
                    .and_then(Value::as_str)
                    .and_then(parse_corefile_domain)
                {
                    return domain;
                }
            }
        }

        "cluster.local".to_string()
    }

    /// Variant detection by capability probing: any discovery group carrying
    /// the vendor identifier flips the variant on
    async fn detect_variant(&self, cancel: &CancellationToken) -> bool {
        match self.api.server_groups(cancel).await {
            Ok(groups) => groups.iter().any(|g| g.name.contains("openshift")),
            Err(e) => {
                log_warn(
                    LogCategory::ClusterApi,
                    &format!("Variant detection failed, assuming standard cluster: {e}"),
                );
                false
            }
        }
    }
}

/// First well-known label present on an object's `metadata.labels`
fn label_value(object: &Value, keys: &[&str]) -> Option<String> {
    let labels = object.pointer("/metadata/labels")?.as_object()?;
    keys.iter().find_map(|key| {
        labels
            .get(*key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    })
}

/// Derive a cluster name from a node-style hostname
///
/// Hostnames of the shape `<cluster>-<role>[-N]` (role in master, control,
/// worker, node, infra) yield the `<cluster>` prefix.
fn name_from_hostname(hostname: Option<&str>) -> Option<String> {
    let hostname = hostname?.trim();
    if hostname.is_empty() {
        return None;
    }

    let segments: Vec<&str> = hostname.split('-').collect();
    for (index, segment) in segments.iter().enumerate() {
        if index == 0 {
            continue;
        }
        if HOSTNAME_ROLE_MARKERS.contains(segment) {
            return Some(segments[..index].join("-"));
        }
    }
    None
}

/// Extract the cluster-local suffix from a Corefile
///
/// Looks for the `kubernetes <domain> ...` plugin directive.
fn parse_corefile_domain(corefile: &str) -> Option<String> {
    for line in corefile.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("kubernetes ") {
            let domain = rest.split_whitespace().next()?;
            if !domain.is_empty() && domain != "{" {
                return Some(domain.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience_core::BreakerManager;
    use crate::resilient_clients::ScriptedClusterApi;
    use serde_json::json;

    fn detector_for(api: Arc<ScriptedClusterApi>) -> ClusterDetector {
        let breakers = BreakerManager::new();
        ClusterDetector::new(Arc::new(ResilientClusterApi::new(api, &breakers)))
            .with_hostname(None)
    }

    #[tokio::test]
    async fn test_explicit_config_wins() {
        let api = Arc::new(ScriptedClusterApi::new());
        let detector = detector_for(api);
        let config = ClusterConfig {
            name: Some("configured".to_string()),
            domain: Some("configured.example".to_string()),
            variant_mode: VariantMode::Disabled,
        };

        let cancel = CancellationToken::new();
        let identity = detector.detect(&cancel, &config).await.unwrap();
        assert_eq!(identity.name, "configured");
        assert_eq!(identity.domain, "configured.example");
        assert!(!identity.is_openshift_variant);
    }

    #[tokio::test]
    async fn test_infrastructure_object_evidence() {
        let api = Arc::new(ScriptedClusterApi::new());
        api.set_cluster_scoped(
            "config.openshift.io",
            "infrastructures",
            "cluster",
            json!({"status": {"infrastructureName": "prod-east-x7k2"}}),
        );
        let detector = detector_for(api);

        let cancel = CancellationToken::new();
        let identity = detector
            .detect(&cancel, &ClusterConfig::default())
            .await
            .unwrap();
        assert_eq!(identity.name, "prod-east-x7k2");
    }

    #[tokio::test]
    async fn test_namespace_label_evidence() {
        let api = Arc::new(ScriptedClusterApi::new());
        api.add_namespace(
            "kube-system",
            json!({"kubernetes.io/cluster-name": "labelled-cluster"}),
        );
        let detector = detector_for(api);

        let cancel = CancellationToken::new();
        let identity = detector
            .detect(&cancel, &ClusterConfig::default())
            .await
            .unwrap();
        assert_eq!(identity.name, "labelled-cluster");
    }

    #[tokio::test]
    async fn test_node_label_evidence() {
        let api = Arc::new(ScriptedClusterApi::new());
        api.add_namespace("kube-system", json!({}));
        api.add_node(json!({
            "metadata": {
                "name": "node-1",
                "labels": {"cluster.x-k8s.io/cluster-name": "node-evidence"}
            }
        }));
        let detector = detector_for(api);

        let cancel = CancellationToken::new();
        let identity = detector
            .detect(&cancel, &ClusterConfig::default())
            .await
            .unwrap();
        assert_eq!(identity.name, "node-evidence");
    }

    #[tokio::test]
    async fn test_hostname_evidence_used_when_api_is_silent() {
        let api = Arc::new(ScriptedClusterApi::new());
        let breakers = BreakerManager::new();
        let detector = ClusterDetector::new(Arc::new(ResilientClusterApi::new(api, &breakers)))
            .with_hostname(Some("edge-site-worker-3".to_string()));

        let cancel = CancellationToken::new();
        let identity = detector
            .detect(&cancel, &ClusterConfig::default())
            .await
            .unwrap();
        assert_eq!(identity.name, "edge-site");
    }

    #[tokio::test]
    async fn test_fallback_name_and_domain() {
        let api = Arc::new(ScriptedClusterApi::new());
        let detector = detector_for(api);

        let cancel = CancellationToken::new();
        let identity = detector
            .detect(&cancel, &ClusterConfig::default())
            .await
            .unwrap();
        assert_eq!(identity.name, "unknown-cluster");
        assert_eq!(identity.domain, "cluster.local");
    }

    #[tokio::test]
    async fn test_corefile_domain_evidence() {
        let api = Arc::new(ScriptedClusterApi::new());
        api.set_config_map(
            "kube-system",
            "coredns",
            json!({"data": {"Corefile": ".:53 {\n    errors\n    kubernetes internal.example in-addr.arpa {\n      pods insecure\n    }\n}"}}),
        );
        let detector = detector_for(api);

        let cancel = CancellationToken::new();
        let identity = detector
            .detect(&cancel, &ClusterConfig::default())
            .await
            .unwrap();
        assert_eq!(identity.domain, "internal.example");
    }

    #[tokio::test]
    async fn test_variant_detection_by_group_probing() {
        let api = Arc::new(ScriptedClusterApi::new());
        api.add_group("route.openshift.io", "v1");
        let detector = detector_for(api);

        let cancel = CancellationToken::new();
        let identity = detector
            .detect(&cancel, &ClusterConfig::default())
            .await
            .unwrap();
        assert!(identity.is_openshift_variant);
    }

    #[tokio::test]
    async fn test_detection_is_cached() {
        let api = Arc::new(ScriptedClusterApi::new());
        api.add_namespace("kube-system", json!({"cluster-name": "first"}));
        let detector = detector_for(api.clone());

        let cancel = CancellationToken::new();
        let first = detector
            .detect(&cancel, &ClusterConfig::default())
            .await
            .unwrap();
        assert_eq!(first.name, "first");

        // New evidence appears, but the cache still answers
        api.set_cluster_scoped(
            "config.openshift.io",
            "infrastructures",
            "cluster",
            json!({"status": {"infrastructureName": "second"}}),
        );
        let again = detector
            .detect(&cancel, &ClusterConfig::default())
            .await
            .unwrap();
        assert_eq!(again.name, "first");

        detector.invalidate();
        let fresh = detector
            .detect(&cancel, &ClusterConfig::default())
            .await
            .unwrap();
        assert_eq!(fresh.name, "second");
    }

    #[test]
    fn test_hostname_heuristic() {
        assert_eq!(
            name_from_hostname(Some("prod-east-master-0")),
            Some("prod-east".to_string())
        );
        assert_eq!(
            name_from_hostname(Some("staging-worker-12")),
            Some("staging".to_string())
        );
        assert_eq!(name_from_hostname(Some("master-0")), None);
        assert_eq!(name_from_hostname(Some("plainhost")), None);
        assert_eq!(name_from_hostname(None), None);
    }

    #[test]
    fn test_corefile_parsing() {
        let corefile = ".:53 {\n    kubernetes cluster.local in-addr.arpa ip6.arpa {\n        pods insecure\n    }\n}";
        assert_eq!(
            parse_corefile_domain(corefile),
            Some("cluster.local".to_string())
        );
        assert_eq!(parse_corefile_domain(".:53 {\n    forward . 8.8.8.8\n}"), None);
    }
}
