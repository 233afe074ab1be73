use crate::artifacts::ArtifactStager;
use crate::deployment_builder::{selector_labels, target_group_name};
use crate::error::Result;
use crate::pod_builder::{PodBuilder, RunTaskOverlay, SidecarInjector};
use crate::TranslatorConfig;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    PodTemplateSpec, Service as K8sService, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kecs_model::constants::{
    ANNOTATION_TARGET_GROUP_ARN, ANNOTATION_TASK_ARN, LABEL_CLUSTER,
    LABEL_ELBV2_TARGET_GROUP_NAME, LABEL_MANAGED_BY, LABEL_TASKSET,
    LABEL_TASKSET_EXTERNAL_ID, LABEL_TASKSET_SERVICE, LABEL_TASK_ID, MANAGED_BY,
};
use kecs_model::{Cluster, Service, TaskDefinition, TaskSet};
use std::collections::BTreeMap;

/// Registers task-set endpoints with the load-balancer backend. The builder itself only tags
/// objects; endpoint registration happens through this narrow collaborator when the operator
/// has wired one in.
#[async_trait]
pub trait Elbv2Integration: Send + Sync {
    async fn register_targets(&self, target_group_arn: &str, endpoints: &[String]) -> Result<()>;
    async fn deregister_targets(&self, target_group_arn: &str, endpoints: &[String])
        -> Result<()>;
}

/// The no-op integration used when no load-balancer backend is configured.
#[derive(Debug, Default)]
pub struct NoopElbv2;

#[async_trait]
impl Elbv2Integration for NoopElbv2 {
    async fn register_targets(&self, _: &str, _: &[String]) -> Result<()> {
        Ok(())
    }

    async fn deregister_targets(&self, _: &str, _: &[String]) -> Result<()> {
        Ok(())
    }
}

/// The Kubernetes objects for one task set: a secondary Deployment and, when the task
/// definition exposes ports, a companion Service.
#[derive(Clone, Debug)]
pub struct TaskSetManifests {
    pub deployment: Deployment,
    pub service: Option<K8sService>,
}

/// Builds the secondary Deployment for a task set under its owning service.
#[derive(Clone, Copy)]
pub struct TaskSetBuilder<'a> {
    pub task_set: &'a TaskSet,
    pub service: &'a Service,
    pub task_definition: &'a TaskDefinition,
    pub cluster: &'a Cluster,
    pub config: &'a TranslatorConfig,
    pub stager: &'a ArtifactStager,
    pub injector: Option<&'a dyn SidecarInjector>,
}

impl TaskSetBuilder<'_> {
    pub fn build(&self) -> Result<TaskSetManifests> {
        let name = self.deployment_name();
        let selector = self.selector();

        let mut labels = selector.clone();
        labels.insert(LABEL_CLUSTER.to_owned(), self.cluster.cluster_name.clone());
        labels.insert(LABEL_MANAGED_BY.to_owned(), MANAGED_BY.to_owned());
        if let Some(external_id) = &self.task_set.external_id {
            labels.insert(
                LABEL_TASKSET_EXTERNAL_ID.to_owned(),
                crate::pod_builder::sanitize_label(external_id),
            );
        }
        for load_balancer in &self.task_set.load_balancers {
            if let Some(tg_name) = load_balancer
                .target_group_arn
                .as_deref()
                .and_then(target_group_name)
            {
                labels.insert(LABEL_ELBV2_TARGET_GROUP_NAME.to_owned(), tg_name);
            }
        }

        let mut annotations = BTreeMap::new();
        if let Some(target_group_arn) = self
            .task_set
            .load_balancers
            .iter()
            .find_map(|lb| lb.target_group_arn.clone())
        {
            annotations.insert(ANNOTATION_TARGET_GROUP_ARN.to_owned(), target_group_arn);
        }

        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(self.cluster.namespace()),
                labels: Some(labels.clone()),
                annotations: if annotations.is_empty() {
                    None
                } else {
                    Some(annotations)
                },
                ..ObjectMeta::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(
                    self.task_set
                        .desired_replicas(self.service.desired_count),
                ),
                selector: LabelSelector {
                    match_labels: Some(selector.clone()),
                    ..LabelSelector::default()
                },
                template: self.pod_template(&selector)?,
                ..DeploymentSpec::default()
            }),
            ..Deployment::default()
        };

        Ok(TaskSetManifests {
            service: self.build_service(&name, &selector, &labels),
            deployment,
        })
    }

    fn deployment_name(&self) -> String {
        format!("{}-{}", self.service.service_name, self.task_set.id)
    }

    fn selector(&self) -> BTreeMap<String, String> {
        let mut selector = selector_labels(&self.service.service_name);
        selector.insert(LABEL_TASKSET.to_owned(), self.task_set.id.clone());
        selector.insert(
            LABEL_TASKSET_SERVICE.to_owned(),
            self.service.service_name.clone(),
        );
        selector
    }

    fn pod_template(&self, selector: &BTreeMap<String, String>) -> Result<PodTemplateSpec> {
        let overlay = RunTaskOverlay {
            network_configuration: self.service.network_configuration.clone(),
            launch_type: self.service.launch_type,
            ..RunTaskOverlay::default()
        };
        let mut pod = PodBuilder {
            task_definition: self.task_definition,
            cluster: self.cluster,
            task_id: &self.deployment_name(),
            overlay: Some(&overlay),
            config: self.config,
            stager: self.stager,
            injector: self.injector,
        }
        .build()?;

        let mut labels = pod.metadata.labels.take().unwrap_or_default();
        labels.remove(LABEL_TASK_ID);
        labels.extend(selector.clone());

        let mut annotations = pod.metadata.annotations.take().unwrap_or_default();
        annotations.remove(ANNOTATION_TASK_ARN);

        let mut spec = pod.spec.take().unwrap_or_default();
        spec.restart_policy = Some("Always".to_string());

        Ok(PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(labels),
                annotations: Some(annotations),
                ..ObjectMeta::default()
            }),
            spec: Some(spec),
        })
    }

    fn build_service(
        &self,
        name: &str,
        selector: &BTreeMap<String, String>,
        labels: &BTreeMap<String, String>,
    ) -> Option<K8sService> {
        let ports: Vec<ServicePort> = self
            .task_definition
            .container_definitions
            .iter()
            .flat_map(|c| c.port_mappings.iter())
            .filter_map(|mapping| {
                mapping.container_port.map(|port| ServicePort {
                    name: Some(format!("port-{}", port)),
                    port,
                    target_port: Some(IntOrString::Int(port)),
                    protocol: Some(mapping.protocol.unwrap_or_default().as_kubernetes().to_owned()),
                    ..ServicePort::default()
                })
            })
            .collect();
        if ports.is_empty() {
            return None;
        }
        Some(K8sService {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some(self.cluster.namespace()),
                labels: Some(labels.clone()),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(selector.clone()),
                ports: Some(ports),
                type_: Some("ClusterIP".to_string()),
                ..ServiceSpec::default()
            }),
            ..K8sService::default()
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kecs_model::{
        ClusterStatus, ContainerDefinition, PortMapping, Scale, ScaleUnit,
    };

    fn fixtures() -> (Cluster, TaskDefinition, Service) {
        let cluster = Cluster {
            cluster_arn: Some("arn:aws:ecs:us-east-1:000000000000:cluster/c1".to_string()),
            cluster_name: "c1".to_string(),
            status: ClusterStatus::Active,
            region: "us-east-1".to_string(),
            account_id: "000000000000".to_string(),
            ..Cluster::default()
        };
        let task_definition = TaskDefinition {
            task_definition_arn: Some(
                "arn:aws:ecs:us-east-1:000000000000:task-definition/web:2".to_string(),
            ),
            family: "web".to_string(),
            revision: 2,
            container_definitions: vec![ContainerDefinition {
                name: "web".to_string(),
                image: "nginx".to_string(),
                port_mappings: vec![PortMapping {
                    container_port: Some(80),
                    ..PortMapping::default()
                }],
                ..ContainerDefinition::default()
            }],
            ..TaskDefinition::default()
        };
        let service = Service {
            service_arn: Some("arn:aws:ecs:us-east-1:000000000000:service/c1/s1".to_string()),
            service_name: "s1".to_string(),
            cluster_arn: Some("arn:aws:ecs:us-east-1:000000000000:cluster/c1".to_string()),
            desired_count: 4,
            ..Service::default()
        };
        (cluster, task_definition, service)
    }

    fn build(task_set: &TaskSet) -> TaskSetManifests {
        let (cluster, task_definition, service) = fixtures();
        let config = TranslatorConfig {
            region: "us-east-1".to_string(),
            account_id: "000000000000".to_string(),
            iam_integration: false,
        };
        let stager = ArtifactStager::new("us-east-1");
        TaskSetBuilder {
            task_set,
            service: &service,
            task_definition: &task_definition,
            cluster: &cluster,
            config: &config,
            stager: &stager,
            injector: None,
        }
        .build()
        .unwrap()
    }

    #[test]
    fn percent_scale_drives_replicas() {
        let task_set = TaskSet {
            id: "ts1".to_string(),
            external_id: Some("green".to_string()),
            scale: Some(Scale {
                value: 50.0,
                unit: ScaleUnit::Percent,
            }),
            ..TaskSet::default()
        };
        let manifests = build(&task_set);
        let deployment = &manifests.deployment;
        assert_eq!(deployment.metadata.name.as_deref(), Some("s1-ts1"));
        assert_eq!(deployment.spec.as_ref().unwrap().replicas, Some(2));

        let labels = deployment.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(LABEL_TASKSET), Some(&"ts1".to_string()));
        assert_eq!(labels.get(LABEL_TASKSET_SERVICE), Some(&"s1".to_string()));
        assert_eq!(labels.get(LABEL_TASKSET_EXTERNAL_ID), Some(&"green".to_string()));
    }

    #[test]
    fn count_scale_and_companion_service() {
        let task_set = TaskSet {
            id: "ts2".to_string(),
            scale: Some(Scale {
                value: 3.0,
                unit: ScaleUnit::Count,
            }),
            ..TaskSet::default()
        };
        let manifests = build(&task_set);
        assert_eq!(manifests.deployment.spec.as_ref().unwrap().replicas, Some(3));
        let service = manifests.service.as_ref().unwrap();
        assert_eq!(service.metadata.name.as_deref(), Some("s1-ts2"));
        let ports = service.spec.as_ref().unwrap().ports.as_ref().unwrap();
        assert_eq!(ports[0].port, 80);
    }

    #[test]
    fn target_group_annotation() {
        let task_set = TaskSet {
            id: "ts3".to_string(),
            load_balancers: vec![kecs_model::LoadBalancer {
                target_group_arn: Some(
                    "arn:aws:elasticloadbalancing:us-east-1:000000000000:targetgroup/tg-green/abc"
                        .to_string(),
                ),
                container_port: Some(80),
                ..kecs_model::LoadBalancer::default()
            }],
            ..TaskSet::default()
        };
        let manifests = build(&task_set);
        let deployment = &manifests.deployment;
        assert_eq!(
            deployment
                .metadata
                .annotations
                .as_ref()
                .unwrap()
                .get(ANNOTATION_TARGET_GROUP_ARN),
            Some(
                &"arn:aws:elasticloadbalancing:us-east-1:000000000000:targetgroup/tg-green/abc"
                    .to_string()
            )
        );
        assert_eq!(
            deployment
                .metadata
                .labels
                .as_ref()
                .unwrap()
                .get(LABEL_ELBV2_TARGET_GROUP_NAME),
            Some(&"tg-green".to_string())
        );
    }
}
