use crate::artifacts::ArtifactStager;
use crate::error::Result;
use crate::pod_builder::{PodBuilder, RunTaskOverlay, SidecarInjector};
use crate::TranslatorConfig;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment};
use k8s_openapi::api::core::v1::{
    PodAffinityTerm, PodAntiAffinity, PodTemplateSpec, Service as K8sService, ServicePort,
    ServiceSpec, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kecs_model::constants::{
    ANNOTATION_TASK_ARN, LABEL_CLUSTER, LABEL_ELBV2_TARGET_GROUP_NAME,
    LABEL_ELBV2_TARGET_GROUP_NAMES, LABEL_MANAGED_BY, LABEL_SERVICE, LABEL_TASK_ID, MANAGED_BY,
};
use kecs_model::{Arn, Cluster, SchedulingStrategy, Service, TaskDefinition};
use log::warn;
use maplit::btreemap;
use std::collections::BTreeMap;

/// The Kubernetes objects produced for one ECS service: always a Deployment, plus a Service
/// when the ECS service fronts container ports with a load balancer.
#[derive(Clone, Debug)]
pub struct ServiceManifests {
    pub deployment: Deployment,
    pub service: Option<K8sService>,
}

/// Builds the Deployment (and companion Service) for an ECS service.
#[derive(Clone, Copy)]
pub struct DeploymentBuilder<'a> {
    pub service: &'a Service,
    pub task_definition: &'a TaskDefinition,
    pub cluster: &'a Cluster,
    pub config: &'a TranslatorConfig,
    pub stager: &'a ArtifactStager,
    pub injector: Option<&'a dyn SidecarInjector>,
}

impl DeploymentBuilder<'_> {
    pub fn build(&self) -> Result<ServiceManifests> {
        let name = &self.service.service_name;
        let selector = selector_labels(name);
        let template = self.pod_template(&selector)?;

        let mut labels = selector.clone();
        labels.insert(LABEL_CLUSTER.to_owned(), self.cluster.cluster_name.clone());
        labels.insert(LABEL_MANAGED_BY.to_owned(), MANAGED_BY.to_owned());
        self.add_target_group_labels(&mut labels);

        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(self.cluster.namespace()),
                labels: Some(labels.clone()),
                ..ObjectMeta::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(self.service.desired_count),
                selector: LabelSelector {
                    match_labels: Some(selector.clone()),
                    ..LabelSelector::default()
                },
                template,
                strategy: Some(self.strategy()),
                ..DeploymentSpec::default()
            }),
            ..Deployment::default()
        };

        Ok(ServiceManifests {
            deployment,
            service: self.build_service(&selector, &labels),
        })
    }

    /// The pod template is the same pod a RunTask would get, with the per-task identity removed and
    /// `restartPolicy` forced back to `Always` (a supervised service replaces its pods).
    fn pod_template(&self, selector: &BTreeMap<String, String>) -> Result<PodTemplateSpec> {
        let overlay = RunTaskOverlay {
            network_configuration: self.service.network_configuration.clone(),
            placement_constraints: self.service.placement_constraints.clone(),
            tags: self.service.tags.clone(),
            launch_type: self.service.launch_type,
            ..RunTaskOverlay::default()
        };
        let mut pod = PodBuilder {
            task_definition: self.task_definition,
            cluster: self.cluster,
            task_id: &self.service.service_name,
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
        if self.service.scheduling_strategy == SchedulingStrategy::Daemon {
            spread_across_nodes(&mut spec, selector);
        }

        Ok(PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(labels),
                annotations: Some(annotations),
                ..ObjectMeta::default()
            }),
            spec: Some(spec),
        })
    }

    fn strategy(&self) -> DeploymentStrategy {
        let rolling_update = match self.service.scheduling_strategy {
            SchedulingStrategy::Replica => RollingUpdateDeployment {
                max_unavailable: Some(IntOrString::String("25%".to_string())),
                max_surge: Some(IntOrString::String("25%".to_string())),
            },
            // DAEMON must not surge; there is at most one task per node.
            SchedulingStrategy::Daemon => RollingUpdateDeployment {
                max_unavailable: Some(IntOrString::String("25%".to_string())),
                max_surge: Some(IntOrString::Int(0)),
            },
        };
        DeploymentStrategy {
            type_: Some("RollingUpdate".to_string()),
            rolling_update: Some(rolling_update),
        }
    }

    fn add_target_group_labels(&self, labels: &mut BTreeMap<String, String>) {
        let names: Vec<String> = self
            .service
            .load_balancers
            .iter()
            .filter_map(|lb| lb.target_group_arn.as_deref())
            .filter_map(target_group_name)
            .collect();
        match names.as_slice() {
            [] => {}
            [single] => {
                labels.insert(LABEL_ELBV2_TARGET_GROUP_NAME.to_owned(), single.clone());
            }
            many => {
                labels.insert(LABEL_ELBV2_TARGET_GROUP_NAMES.to_owned(), many.join("."));
            }
        }
    }

    fn build_service(
        &self,
        selector: &BTreeMap<String, String>,
        labels: &BTreeMap<String, String>,
    ) -> Option<K8sService> {
        if self.service.load_balancers.is_empty() {
            return None;
        }

        let mut ports = Vec::new();
        let mut lb_backend = false;
        for load_balancer in &self.service.load_balancers {
            let port = match load_balancer.container_port {
                Some(port) => port,
                None => continue,
            };
            if !self.task_definition.exposes_port(port) {
                warn!(
                    "service '{}' declares a load balancer on port {} which task definition \
                     '{}' does not expose; suppressing the Kubernetes Service for it",
                    self.service.service_name,
                    port,
                    self.task_definition.family_revision(),
                );
                continue;
            }
            if load_balancer.target_group_arn.is_some()
                || load_balancer.load_balancer_name.is_some()
            {
                lb_backend = true;
            }
            ports.push(ServicePort {
                name: Some(format!("port-{}", port)),
                port,
                target_port: Some(IntOrString::Int(port)),
                protocol: Some(self.port_protocol(port)),
                ..ServicePort::default()
            });
        }
        if ports.is_empty() {
            return None;
        }

        Some(K8sService {
            metadata: ObjectMeta {
                name: Some(self.service.service_name.clone()),
                namespace: Some(self.cluster.namespace()),
                labels: Some(labels.clone()),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(selector.clone()),
                ports: Some(ports),
                type_: Some(if lb_backend { "LoadBalancer" } else { "ClusterIP" }.to_string()),
                ..ServiceSpec::default()
            }),
            ..K8sService::default()
        })
    }

    fn port_protocol(&self, port: i32) -> String {
        self.task_definition
            .container_definitions
            .iter()
            .flat_map(|c| c.port_mappings.iter())
            .find(|mapping| mapping.container_port == Some(port))
            .map(|mapping| mapping.protocol.unwrap_or_default().as_kubernetes())
            .unwrap_or("TCP")
            .to_owned()
    }
}

pub(crate) fn selector_labels(service_name: &str) -> BTreeMap<String, String> {
    btreemap! {
        "app".to_string() => service_name.to_string(),
        LABEL_SERVICE.to_string() => service_name.to_string(),
    }
}

/// Extract `tg1` from `arn:…:targetgroup/tg1/abc`.
pub(crate) fn target_group_name(arn: &str) -> Option<String> {
    Arn::parse(arn)
        .ok()
        .filter(|parsed| parsed.resource_type.as_deref() == Some("targetgroup"))
        .and_then(|parsed| {
            parsed
                .resource_path
                .split('/')
                .next()
                .map(str::to_owned)
        })
}

/// A preferred anti-affinity that pushes DAEMON pods onto distinct nodes.
fn spread_across_nodes(spec: &mut k8s_openapi::api::core::v1::PodSpec, selector: &BTreeMap<String, String>) {
    let affinity = spec.affinity.get_or_insert_with(Default::default);
    let anti = affinity.pod_anti_affinity.get_or_insert_with(PodAntiAffinity::default);
    anti.preferred_during_scheduling_ignored_during_execution
        .get_or_insert_with(Vec::new)
        .push(WeightedPodAffinityTerm {
            weight: 100,
            pod_affinity_term: PodAffinityTerm {
                label_selector: Some(LabelSelector {
                    match_labels: Some(selector.clone()),
                    ..LabelSelector::default()
                }),
                topology_key: "kubernetes.io/hostname".to_string(),
                ..PodAffinityTerm::default()
            },
        });
}

#[cfg(test)]
mod test {
    use super::*;
    use kecs_model::{
        ClusterStatus, ContainerDefinition, LoadBalancer, PortMapping, ServiceStatus,
    };

    fn cluster() -> Cluster {
        Cluster {
            cluster_arn: Some("arn:aws:ecs:us-east-1:000000000000:cluster/c1".to_string()),
            cluster_name: "c1".to_string(),
            status: ClusterStatus::Active,
            region: "us-east-1".to_string(),
            account_id: "000000000000".to_string(),
            ..Cluster::default()
        }
    }

    fn web_task_definition() -> TaskDefinition {
        TaskDefinition {
            task_definition_arn: Some(
                "arn:aws:ecs:us-east-1:000000000000:task-definition/web:1".to_string(),
            ),
            family: "web".to_string(),
            revision: 1,
            container_definitions: vec![ContainerDefinition {
                name: "web".to_string(),
                image: "nginx".to_string(),
                port_mappings: vec![PortMapping {
                    container_port: Some(80),
                    ..PortMapping::default()
                }],
                memory: Some(256),
                ..ContainerDefinition::default()
            }],
            ..TaskDefinition::default()
        }
    }

    fn ecs_service(load_balancers: Vec<LoadBalancer>) -> Service {
        Service {
            service_arn: Some("arn:aws:ecs:us-east-1:000000000000:service/c1/s1".to_string()),
            service_name: "s1".to_string(),
            cluster_arn: Some("arn:aws:ecs:us-east-1:000000000000:cluster/c1".to_string()),
            task_definition: Some(
                "arn:aws:ecs:us-east-1:000000000000:task-definition/web:1".to_string(),
            ),
            desired_count: 2,
            status: ServiceStatus::Pending,
            load_balancers,
            ..Service::default()
        }
    }

    fn build(service: &Service) -> ServiceManifests {
        let cluster = cluster();
        let task_definition = web_task_definition();
        let config = TranslatorConfig {
            region: "us-east-1".to_string(),
            account_id: "000000000000".to_string(),
            iam_integration: false,
        };
        let stager = ArtifactStager::new("us-east-1");
        DeploymentBuilder {
            service,
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
    fn service_with_load_balancer() {
        let manifests = build(&ecs_service(vec![LoadBalancer {
            target_group_arn: Some(
                "arn:aws:elasticloadbalancing:us-east-1:000000000000:targetgroup/tg1/abc"
                    .to_string(),
            ),
            container_port: Some(80),
            container_name: Some("web".to_string()),
            ..LoadBalancer::default()
        }]));

        let deployment = &manifests.deployment;
        assert_eq!(deployment.metadata.name.as_deref(), Some("s1"));
        assert_eq!(deployment.metadata.namespace.as_deref(), Some("c1-us-east-1"));
        let spec = deployment.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(2));
        assert_eq!(
            spec.selector.match_labels.as_ref().unwrap().get("app"),
            Some(&"s1".to_string())
        );
        assert_eq!(
            deployment
                .metadata
                .labels
                .as_ref()
                .unwrap()
                .get(LABEL_ELBV2_TARGET_GROUP_NAME),
            Some(&"tg1".to_string())
        );

        let template_spec = spec.template.spec.as_ref().unwrap();
        assert_eq!(template_spec.restart_policy.as_deref(), Some("Always"));
        let template_labels = spec.template.metadata.as_ref().unwrap().labels.as_ref().unwrap();
        assert!(template_labels.get(LABEL_TASK_ID).is_none());
        assert_eq!(template_labels.get(LABEL_SERVICE), Some(&"s1".to_string()));

        let service = manifests.service.as_ref().unwrap();
        let service_spec = service.spec.as_ref().unwrap();
        assert_eq!(service_spec.type_.as_deref(), Some("LoadBalancer"));
        let port = &service_spec.ports.as_ref().unwrap()[0];
        assert_eq!(port.port, 80);
        assert_eq!(port.target_port, Some(IntOrString::Int(80)));
        assert_eq!(port.protocol.as_deref(), Some("TCP"));
    }

    #[test]
    fn rolling_update_strategy_defaults() {
        let manifests = build(&ecs_service(Vec::new()));
        let strategy = manifests
            .deployment
            .spec
            .as_ref()
            .unwrap()
            .strategy
            .as_ref()
            .unwrap();
        let rolling = strategy.rolling_update.as_ref().unwrap();
        assert_eq!(rolling.max_surge, Some(IntOrString::String("25%".to_string())));
        assert_eq!(
            rolling.max_unavailable,
            Some(IntOrString::String("25%".to_string()))
        );
        assert!(manifests.service.is_none());
    }

    #[test]
    fn daemon_strategy_never_surges() {
        let mut service = ecs_service(Vec::new());
        service.scheduling_strategy = SchedulingStrategy::Daemon;
        let manifests = build(&service);
        let spec = manifests.deployment.spec.as_ref().unwrap();
        let rolling = spec
            .strategy
            .as_ref()
            .unwrap()
            .rolling_update
            .as_ref()
            .unwrap();
        assert_eq!(rolling.max_surge, Some(IntOrString::Int(0)));
        // DAEMON pods prefer distinct nodes.
        let anti = spec
            .template
            .spec
            .as_ref()
            .unwrap()
            .affinity
            .as_ref()
            .unwrap()
            .pod_anti_affinity
            .as_ref()
            .unwrap();
        assert!(anti
            .preferred_during_scheduling_ignored_during_execution
            .is_some());
    }

    #[test]
    fn unexposed_port_suppresses_service() {
        let manifests = build(&ecs_service(vec![LoadBalancer {
            target_group_arn: Some(
                "arn:aws:elasticloadbalancing:us-east-1:000000000000:targetgroup/tg1/abc"
                    .to_string(),
            ),
            container_port: Some(9999),
            ..LoadBalancer::default()
        }]));
        assert!(manifests.service.is_none());
    }

    #[test]
    fn target_group_name_extraction() {
        assert_eq!(
            target_group_name(
                "arn:aws:elasticloadbalancing:us-east-1:000000000000:targetgroup/tg1/abc"
            ),
            Some("tg1".to_string())
        );
        assert_eq!(target_group_name("not-an-arn"), None);
    }
}
