use crate::service::Tag;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named namespace of ECS resources. Workloads of a cluster live in the Kubernetes namespace
/// `<name>-<region>`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_arn: Option<String>,
    pub cluster_name: String,
    #[serde(default)]
    pub status: ClusterStatus,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub registered_container_instances_count: i32,
    #[serde(default)]
    pub running_tasks_count: i32,
    #[serde(default)]
    pub pending_tasks_count: i32,
    #[serde(default)]
    pub active_services_count: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency token maintained by storage; never serialized to clients.
    #[serde(skip)]
    pub version: u64,
}

impl Cluster {
    /// The Kubernetes namespace holding this cluster's workloads.
    pub fn namespace(&self) -> String {
        format!("{}-{}", self.cluster_name, self.region)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    #[default]
    Active,
    Provisioning,
    Deprovisioning,
    Failed,
    Inactive,
}

serde_plain::derive_display_from_serialize!(ClusterStatus);
