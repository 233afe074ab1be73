/*!

This library provides the ECS-shaped data model for the KECS control plane: the resource
types that travel over the ECS JSON-RPC surface, ARN parsing and construction, the reserved
Kubernetes label and annotation names, and the storage contract through which the control
plane persists its resources.

!*/

#![deny(
    clippy::expect_used,
    clippy::get_unwrap,
    clippy::panic,
    clippy::panic_in_result_fn,
    clippy::panicking_unwrap,
    clippy::unwrap_in_result,
    clippy::unwrap_used
)]

pub use arn::Arn;
pub use cluster::{Cluster, ClusterStatus};
pub use error::{Error, Result};
pub use lock_map::LockMap;
pub use service::{
    AssignPublicIp, AwsVpcConfiguration, DeploymentConfiguration, LaunchType, LoadBalancer,
    NetworkConfiguration, PlacementConstraint, PlacementConstraintType, PlacementStrategy,
    SchedulingStrategy, Service, ServiceDeployment, ServiceEvent, ServiceRegistry, ServiceStatus,
    Tag,
};
pub use task::{
    Attachment, Connectivity, Container, ContainerOverride, HealthStatus, NetworkBinding,
    StopCode, Task, TaskOverride, TaskStatus,
};
pub use task_definition::{
    Artifact, ChecksumType, ContainerDefinition, DockerVolumeConfiguration,
    EfsVolumeConfiguration, FsxWindowsFileServerVolumeConfiguration, HealthCheck,
    HostVolumeProperties, IpcMode, KeyValuePair, LogConfiguration, MountPoint, NetworkMode,
    PidMode, PortMapping, SecretRequirement, TaskDefinition, TaskDefinitionStatus,
    TransportProtocol, VolumeDefinition,
};
pub use task_set::{Scale, ScaleUnit, StabilityStatus, TaskSet};

mod arn;
mod cluster;
pub mod constants;
mod error;
mod lock_map;
mod service;
pub mod storage;
mod task;
mod task_definition;
mod task_set;

/// A `Failure` entry as reported in the `failures[]` array of batch ECS responses.
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Failure {
    pub fn new<S1, S2>(arn: S1, reason: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            arn: Some(arn.into()),
            reason: Some(reason.into()),
            detail: None,
        }
    }
}
