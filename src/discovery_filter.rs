//! # Discovery + Filter
//!
//! Turns the cluster's preferred-resources catalogue into the priority-sorted
//! set of `(kind, namespace)` work items a backup job will process.
//!
//! Filtering happens in layers: kinds without a `list` verb are rejected
//! first, the engine's global denylist always applies, then the job's
//! allowlist or denylist mode decides what remains. A kind excluded by
//! policy never appears in the work queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::logging::{log_info, LogCategory};
use crate::priority_engine::PriorityEngine;
use crate::resilience_core::RetryConfig;
use crate::resilient_clients::{ApiResource, ResilientClusterApi};
use crate::runtime_config::{BackupScope, FilterMode};
use crate::Result;

/// A resource kind admitted to a job, with its backup policy attached
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceKindDescriptor {
    pub resource: ApiResource,
    pub backup_priority: u8,
    pub retry: RetryConfig,
}

/// The unit of pipeline concurrency: one kind in one namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub kind: ResourceKindDescriptor,
    /// `None` for cluster-scoped kinds
    pub namespace: Option<String>,
    pub priority: u8,
    pub attempt: u32,
    pub scheduled_at: DateTime<Utc>,
}

/// Discovery engine producing the work queue for a job
pub struct DiscoveryEngine {
    api: Arc<ResilientClusterApi>,
    priorities: Arc<PriorityEngine>,
}

impl DiscoveryEngine {
    pub fn new(api: Arc<ResilientClusterApi>, priorities: Arc<PriorityEngine>) -> Self {
        Self { api, priorities }
    }

    /// Enumerate admitted kinds and expand them into work items, sorted by
    /// descending priority (ordering within equal priority is unspecified)
    pub async fn discover(
        &self,
        cancel: &CancellationToken,
        scope: &BackupScope,
    ) -> Result<Vec<WorkItem>> {
        let catalogue = self.api.server_preferred_resources(cancel).await?;
        let admitted: Vec<ApiResource> = catalogue
            .into_iter()
            .filter(|resource| resource.supports_list())
            .filter(|resource| !self.priorities.is_denied(&resource.plural))
            .filter(|resource| match scope.filter_mode {
                FilterMode::Allowlist => scope.include_kinds.contains(&resource.plural),
                FilterMode::Denylist => !scope.exclude_kinds.contains(&resource.plural),
            })
            .collect();

        let namespaces = self.selected_namespaces(cancel, scope).await?;

        let mut items = Vec::new();
        for resource in &admitted {
            let priority_seed = self
                .priorities
                .priority_of(&resource.plural, None, None, None);
            let descriptor = ResourceKindDescriptor {
                resource: resource.clone(),
                backup_priority: priority_seed,
                retry: self.priorities.retry_profile(priority_seed),
            };

            if resource.namespaced {
                for namespace in &namespaces {
                    let priority =
                        self.priorities
                            .priority_of(&resource.plural, Some(namespace), None, None);
                    items.push(WorkItem {
                        kind: descriptor.clone(),
                        namespace: Some(namespace.clone()),
                        priority,
                        attempt: 0,
                        scheduled_at: Utc::now(),
                    });
                }
            } else {
                items.push(WorkItem {
                    kind: descriptor.clone(),
                    namespace: None,
                    priority: priority_seed,
                    attempt: 0,
                    scheduled_at: Utc::now(),
                });
            }
        }

        items.sort_by(|a, b| b.priority.cmp(&a.priority));

        log_info(
            LogCategory::ClusterApi,
            &format!(
                "Discovery admitted {} kinds across {} namespaces ({} work items)",
                admitted.len(),
                namespaces.len(),
                items.len()
            ),
        );
        Ok(items)
    }

    /// Namespace selection mirrors kind selection: include list (empty means
    /// all), then exclusions
    async fn selected_namespaces(
        &self,
        cancel: &CancellationToken,
        scope: &BackupScope,
    ) -> Result<Vec<String>> {
        let all: Vec<String> = self
            .api
            .list_namespaces(cancel)
            .await?
            .iter()
            .filter_map(|ns| {
                ns.pointer("/metadata/name")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string())
            })
            .collect();

        Ok(all
            .into_iter()
            .filter(|ns| {
                scope.include_namespaces.is_empty() || scope.include_namespaces.contains(ns)
            })
            .filter(|ns| !scope.exclude_namespaces.contains(ns))
            .collect())
    }
}
