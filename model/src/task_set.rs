use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A secondary replica group under a service, used for blue/green deployments. A task set refers
/// to its service by ARN only; the service is resolved through storage on demand.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSet {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_set_arn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_arn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_arn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_definition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<Scale>,
    #[serde(default)]
    pub computed_desired_count: i32,
    #[serde(default)]
    pub running_count: i32,
    #[serde(default)]
    pub pending_count: i32,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub stability_status: StabilityStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub load_balancers: Vec<crate::service::LoadBalancer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl TaskSet {
    /// The replica count this task set should run, given the owning service's desired count.
    /// PERCENT scales are rounded up so that a non-zero percentage always yields at least one
    /// replica.
    pub fn desired_replicas(&self, service_desired_count: i32) -> i32 {
        match &self.scale {
            Some(scale) => match scale.unit {
                ScaleUnit::Count => scale.value.round() as i32,
                ScaleUnit::Percent => {
                    ((f64::from(service_desired_count) * scale.value) / 100.0).ceil() as i32
                }
            },
            None => self.computed_desired_count,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scale {
    pub value: f64,
    pub unit: ScaleUnit,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScaleUnit {
    #[default]
    Percent,
    Count,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StabilityStatus {
    #[default]
    Stabilizing,
    SteadyState,
}

serde_plain::derive_display_from_serialize!(StabilityStatus);
