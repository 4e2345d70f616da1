//! # Priority Engine
//!
//! Computes a numeric backup priority (0..=100) and a retry profile for every
//! resource kind, with namespace and label boosts layered on top of eight
//! category base tables. A global denylist removes kinds that are never worth
//! storing (events, component statuses, bindings) before priority is even
//! computed.
//!
//! Concurrency toward the cluster API is expressed as a global worker pool
//! plus a per-kind semaphore capping simultaneous in-flight items per kind.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::resilience_core::RetryConfig;

/// Priority assigned to kinds absent from every category table
pub const DEFAULT_PRIORITY: u8 = 50;

/// Kinds never backed up, enforced before priority computation
pub const DEFAULT_DENIED_KINDS: &[&str] = &["events", "componentstatuses", "bindings"];

/// Category base tables: (category, plural, base priority)
///
/// Eight categories: core, rbac, network, workload, vendor-core,
/// vendor-security, storage, custom.
static BASE_TABLES: Lazy<HashMap<&'static str, (&'static str, u8)>> = Lazy::new(|| {
    let entries: &[(&str, &str, u8)] = &[
        // core
        ("core", "namespaces", 98),
        ("core", "secrets", 95),
        ("core", "configmaps", 92),
        ("core", "serviceaccounts", 90),
        ("core", "resourcequotas", 85),
        ("core", "limitranges", 80),
        // rbac
        ("rbac", "clusterroles", 88),
        ("rbac", "clusterrolebindings", 87),
        ("rbac", "roles", 86),
        ("rbac", "rolebindings", 85),
        // network
        ("network", "services", 82),
        ("network", "ingresses", 80),
        ("network", "networkpolicies", 78),
        ("network", "endpoints", 60),
        // workload
        ("workload", "statefulsets", 76),
        ("workload", "deployments", 75),
        ("workload", "daemonsets", 74),
        ("workload", "cronjobs", 70),
        ("workload", "jobs", 58),
        ("workload", "replicasets", 45),
        ("workload", "pods", 35),
        // vendor-core
        ("vendor-core", "deploymentconfigs", 73),
        ("vendor-core", "routes", 72),
        ("vendor-core", "imagestreams", 62),
        ("vendor-core", "buildconfigs", 61),
        ("vendor-core", "templates", 55),
        // vendor-security
        ("vendor-security", "securitycontextconstraints", 89),
        ("vendor-security", "oauthclients", 81),
        // storage
        ("storage", "persistentvolumes", 91),
        ("storage", "storageclasses", 87),
        ("storage", "persistentvolumeclaims", 84),
        ("storage", "volumesnapshots", 57),
        // custom
        ("custom", "customresourcedefinitions", 93),
    ];
    entries
        .iter()
        .map(|(category, plural, base)| (*plural, (*category, *base)))
        .collect()
});

/// Priority boost applied to every kind in a namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceOverride {
    pub namespace: String,
    pub boost: i32,
}

/// Priority boost applied when an object carries a label
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelRule {
    pub key: String,
    /// When `None`, any value matches
    pub value: Option<String>,
    pub boost: i32,
}

/// Tunable policy wrapped around the static base tables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityPolicy {
    pub namespace_overrides: Vec<NamespaceOverride>,
    pub label_rules: Vec<LabelRule>,
    /// Per-kind cap on simultaneous in-flight items
    pub max_concurrent_per_kind: usize,
    pub denied_kinds: Vec<String>,
    /// Serialized size above which the first penalty tier applies
    pub large_object_threshold_bytes: usize,
}

impl Default for PriorityPolicy {
    fn default() -> Self {
        Self {
            namespace_overrides: Vec::new(),
            label_rules: Vec::new(),
            max_concurrent_per_kind: 5,
            denied_kinds: DEFAULT_DENIED_KINDS.iter().map(|s| s.to_string()).collect(),
            large_object_threshold_bytes: 1024 * 1024,
        }
    }
}

/// Priority and concurrency authority for the pipeline
pub struct PriorityEngine {
    policy: PriorityPolicy,
    semaphores: DashMap<String, Arc<Semaphore>>,
}

impl PriorityEngine {
    pub fn new(policy: PriorityPolicy) -> Self {
        Self {
            policy,
            semaphores: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &PriorityPolicy {
        &self.policy
    }

    /// Base priority for a kind from the category tables
    pub fn base_priority(plural: &str) -> u8 {
        BASE_TABLES
            .get(plural)
            .map(|(_, base)| *base)
            .unwrap_or(DEFAULT_PRIORITY)
    }

    /// Category a kind belongs to, `custom` for unknown kinds
    pub fn category_of(plural: &str) -> &'static str {
        BASE_TABLES
            .get(plural)
            .map(|(category, _)| *category)
            .unwrap_or("custom")
    }

    /// Whether a kind is globally denied
    pub fn is_denied(&self, plural: &str) -> bool {
        self.policy.denied_kinds.iter().any(|k| k == plural)
    }

    /// Full priority computation: base + namespace boosts + label boosts -
    /// large-object penalty, clamped to 0..=100
    pub fn priority_of(
        &self,
        plural: &str,
        namespace: Option<&str>,
        labels: Option<&Value>,
        size_hint: Option<usize>,
    ) -> u8 {
        let mut priority = Self::base_priority(plural) as i32;

        if let Some(namespace) = namespace {
            for over in &self.policy.namespace_overrides {
                if over.namespace == namespace {
                    priority += over.boost;
                }
            }
        }

        if let Some(labels) = labels.and_then(Value::as_object) {
            for rule in &self.policy.label_rules {
                let matched = match labels.get(&rule.key) {
                    Some(actual) => rule
                        .value
                        .as_deref()
                        .map(|expected| actual.as_str() == Some(expected))
                        .unwrap_or(true),
                    None => false,
                };
                if matched {
                    priority += rule.boost;
                }
            }
        }

        if let Some(size) = size_hint {
            priority -= large_object_penalty(size, self.policy.large_object_threshold_bytes);
        }

        priority.clamp(0, 100) as u8
    }

    /// Retry profile for a priority band
    pub fn retry_profile(&self, priority: u8) -> RetryConfig {
        RetryConfig::for_priority(priority)
    }

    /// Semaphore capping in-flight items for a kind
    ///
    /// The same Arc is returned for every caller asking about the same kind,
    /// so the cap holds across all workers.
    pub fn semaphore_for_kind(&self, plural: &str) -> Arc<Semaphore> {
        self.semaphores
            .entry(plural.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.policy.max_concurrent_per_kind)))
            .clone()
    }
}

/// Tiered penalty for oversized objects
fn large_object_penalty(size: usize, threshold: usize) -> i32 {
    if size >= threshold.saturating_mul(5) {
        10
    } else if size >= threshold {
        5
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_base_table_lookup() {
        assert_eq!(PriorityEngine::base_priority("namespaces"), 98);
        assert_eq!(PriorityEngine::base_priority("secrets"), 95);
        assert_eq!(PriorityEngine::base_priority("deployments"), 75);
        assert_eq!(PriorityEngine::base_priority("pods"), 35);
        // Unknown kinds land on the default
        assert_eq!(PriorityEngine::base_priority("widgets"), DEFAULT_PRIORITY);
    }

    #[test]
    fn test_category_lookup() {
        assert_eq!(PriorityEngine::category_of("clusterroles"), "rbac");
        assert_eq!(PriorityEngine::category_of("persistentvolumes"), "storage");
        assert_eq!(PriorityEngine::category_of("routes"), "vendor-core");
        assert_eq!(PriorityEngine::category_of("widgets"), "custom");
    }

    #[test]
    fn test_default_denylist() {
        let engine = PriorityEngine::new(PriorityPolicy::default());
        assert!(engine.is_denied("events"));
        assert!(engine.is_denied("componentstatuses"));
        assert!(engine.is_denied("bindings"));
        assert!(!engine.is_denied("deployments"));
    }

    #[test]
    fn test_namespace_boost() {
        let engine = PriorityEngine::new(PriorityPolicy {
            namespace_overrides: vec![NamespaceOverride {
                namespace: "prod".to_string(),
                boost: 10,
            }],
            ..PriorityPolicy::default()
        });

        assert_eq!(engine.priority_of("deployments", Some("prod"), None, None), 85);
        assert_eq!(engine.priority_of("deployments", Some("dev"), None, None), 75);
        assert_eq!(engine.priority_of("deployments", None, None, None), 75);
    }

    #[test]
    fn test_label_rules() {
        let engine = PriorityEngine::new(PriorityPolicy {
            label_rules: vec![
                LabelRule {
                    key: "backup-priority".to_string(),
                    value: Some("high".to_string()),
                    boost: 15,
                },
                LabelRule {
                    key: "critical".to_string(),
                    value: None,
                    boost: 5,
                },
            ],
            ..PriorityPolicy::default()
        });

        let labels = json!({"backup-priority": "high", "critical": "anything"});
        assert_eq!(
            engine.priority_of("configmaps", None, Some(&labels), None),
            100 // 92 + 15 + 5 clamped
        );

        let mismatched = json!({"backup-priority": "low"});
        assert_eq!(
            engine.priority_of("configmaps", None, Some(&mismatched), None),
            92
        );
    }

    #[test]
    fn test_large_object_penalty_tiers() {
        let engine = PriorityEngine::new(PriorityPolicy::default());

        let small = engine.priority_of("configmaps", None, None, Some(512 * 1024));
        let large = engine.priority_of("configmaps", None, None, Some(2 * 1024 * 1024));
        let huge = engine.priority_of("configmaps", None, None, Some(6 * 1024 * 1024));

        assert_eq!(small, 92);
        assert_eq!(large, 87);
        assert_eq!(huge, 82);
    }

    #[test]
    fn test_priority_clamping() {
        let engine = PriorityEngine::new(PriorityPolicy {
            namespace_overrides: vec![NamespaceOverride {
                namespace: "junk".to_string(),
                boost: -200,
            }],
            ..PriorityPolicy::default()
        });
        assert_eq!(engine.priority_of("pods", Some("junk"), None, None), 0);
    }

    #[test]
    fn test_retry_profile_band() {
        let engine = PriorityEngine::new(PriorityPolicy::default());
        assert_eq!(engine.retry_profile(98).max_attempts, 5);
        assert_eq!(engine.retry_profile(75).max_attempts, 4);
        assert_eq!(engine.retry_profile(50).max_attempts, 3);
        assert_eq!(engine.retry_profile(35).max_attempts, 2);
    }

    #[test]
    fn test_semaphore_registry_shares_instances() {
        let engine = PriorityEngine::new(PriorityPolicy {
            max_concurrent_per_kind: 2,
            ..PriorityPolicy::default()
        });

        let a = engine.semaphore_for_kind("deployments");
        let b = engine.semaphore_for_kind("deployments");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.available_permits(), 2);

        let other = engine.semaphore_for_kind("services");
        assert!(!Arc::ptr_eq(&a, &other));
    }
}
