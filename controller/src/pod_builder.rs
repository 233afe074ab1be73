use crate::artifacts::{ArtifactPlan, ArtifactStager};
use crate::error::{self, Result};
use crate::placement::translate_constraints;
use crate::secrets::resolve_secret_arn;
use crate::TranslatorConfig;
use k8s_openapi::api::core::v1::{
    AWSElasticBlockStoreVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar,
    EnvVarSource, ExecAction, HTTPGetAction, HostPathVolumeSource, NFSVolumeSource,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, Pod,
    PodSpec, Probe, ResourceRequirements, SecretKeySelector, SecurityContext, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kecs_model::constants::{
    ANNOTATION_ASSIGN_PUBLIC_IP, ANNOTATION_CLOUDWATCH_LOGS_ENABLED, ANNOTATION_CONTAINER_PREFIX,
    ANNOTATION_EXECUTION_ROLE_ARN, ANNOTATION_NETWORK_MODE, ANNOTATION_SECRET_COUNT,
    ANNOTATION_SECRET_PREFIX, ANNOTATION_SECURITY_GROUPS, ANNOTATION_SUBNETS,
    ANNOTATION_TASK_ARN, ANNOTATION_TASK_DEFINITION_ARN, ANNOTATION_TASK_ROLE_ARN,
    ANNOTATION_VOLUME_PREFIX, EMULATOR_CREDENTIAL, ENV_AWS_ACCESS_KEY_ID,
    ENV_AWS_DEFAULT_REGION, ENV_AWS_SECRET_ACCESS_KEY, LABEL_CLUSTER, LABEL_LAUNCH_TYPE,
    LABEL_MANAGED_BY, LABEL_TASK_FAMILY, LABEL_TASK_ID, LABEL_TASK_REVISION,
    LABEL_TASK_ROLE_NAME, MANAGED_BY, TAG_LABEL_PREFIX,
};
use kecs_model::{
    Arn, Cluster, ContainerDefinition, HealthCheck, LaunchType, NetworkConfiguration,
    NetworkMode, PidMode, PlacementConstraint, Tag, TaskDefinition, TaskOverride,
    VolumeDefinition,
};
use snafu::{ensure, OptionExt};
use std::collections::BTreeMap;

// Probe timing defaults when the health check leaves them unset.
const DEFAULT_PROBE_PERIOD: i32 = 30;
const DEFAULT_PROBE_TIMEOUT: i32 = 5;
const DEFAULT_PROBE_FAILURES: i32 = 3;
const DEFAULT_PROBE_INITIAL_DELAY: i32 = 30;
/// Readiness probes begin early so that a service pod takes traffic as soon as it can.
const MAX_READINESS_INITIAL_DELAY: i32 = 10;

/// A hook the ingress proxy uses to attach itself to every task pod, either by adding a sidecar
/// container or by rewriting container environments. The builder consults it after the pod is
/// otherwise complete.
pub trait SidecarInjector: Send + Sync {
    fn should_inject(&self, task_definition: &TaskDefinition) -> bool;
    fn inject(&self, pod: &mut Pod);
}

/// Per-call inputs of `RunTask` that overlay the task definition.
#[derive(Clone, Debug, Default)]
pub struct RunTaskOverlay {
    pub overrides: Option<TaskOverride>,
    pub network_configuration: Option<NetworkConfiguration>,
    pub placement_constraints: Vec<PlacementConstraint>,
    pub tags: Vec<Tag>,
    pub launch_type: Option<LaunchType>,
    pub group: Option<String>,
}

/// Builds the fully specified Pod for one task.
#[derive(Clone, Copy)]
pub struct PodBuilder<'a> {
    pub task_definition: &'a TaskDefinition,
    pub cluster: &'a Cluster,
    pub task_id: &'a str,
    pub overlay: Option<&'a RunTaskOverlay>,
    pub config: &'a TranslatorConfig,
    pub stager: &'a ArtifactStager,
    pub injector: Option<&'a dyn SidecarInjector>,
}

impl PodBuilder<'_> {
    pub fn build(&self) -> Result<Pod> {
        let task_definition = self.effective_task_definition();
        ensure!(
            !task_definition.container_definitions.is_empty(),
            error::InvalidTaskDefinitionSnafu {
                reason: "no container definitions",
            }
        );
        for definition in &task_definition.container_definitions {
            ensure!(
                !definition.name.is_empty() && !definition.image.is_empty(),
                error::InvalidTaskDefinitionSnafu {
                    reason: "container definitions require a name and an image",
                }
            );
        }

        let mut annotations = self.annotations(&task_definition)?;
        let labels = self.labels(&task_definition)?;

        let mut containers = Vec::with_capacity(task_definition.container_definitions.len());
        let mut init_containers = Vec::new();
        let mut volumes = Vec::new();

        for definition in &task_definition.container_definitions {
            let mut container = self.convert_container(definition)?;
            if let Some(ArtifactPlan {
                init_container,
                volume,
                mount,
            }) = self.stager.plan(definition)?
            {
                container
                    .volume_mounts
                    .get_or_insert_with(Vec::new)
                    .push(mount);
                init_containers.push(init_container);
                volumes.push(volume);
            }
            containers.push(container);
        }

        apply_task_resources(
            &mut containers,
            parse_task_quantity(task_definition.cpu.as_deref())?,
            parse_task_quantity(task_definition.memory.as_deref())?,
        );
        for container in &mut containers {
            inject_emulator_credentials(container, &self.config.region);
        }

        for volume in &task_definition.volumes {
            volumes.push(self.convert_volume(volume, &mut annotations));
        }

        let constraints = self.placement_constraints();
        let placement = translate_constraints(&constraints, &task_definition.family)?;

        let service_account_name = self.service_account(&task_definition)?;

        let pod_spec = PodSpec {
            containers,
            init_containers: if init_containers.is_empty() {
                None
            } else {
                Some(init_containers)
            },
            volumes: if volumes.is_empty() {
                None
            } else {
                Some(volumes)
            },
            // ECS tasks do not restart; a replacement task is a new task.
            restart_policy: Some("Never".to_string()),
            host_network: (task_definition.network_mode == NetworkMode::Host).then_some(true),
            host_pid: (task_definition.pid_mode == Some(PidMode::Host)).then_some(true),
            host_ipc: matches!(task_definition.ipc_mode, Some(kecs_model::IpcMode::Host))
                .then_some(true),
            node_selector: if placement.node_selector.is_empty() {
                None
            } else {
                Some(placement.node_selector)
            },
            affinity: placement.affinity,
            service_account_name,
            ..PodSpec::default()
        };

        let mut pod = Pod {
            metadata: ObjectMeta {
                name: Some(self.task_id.to_string()),
                namespace: Some(self.cluster.namespace()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..ObjectMeta::default()
            },
            spec: Some(pod_spec),
            ..Pod::default()
        };

        if let Some(injector) = self.injector {
            if injector.should_inject(&task_definition) {
                injector.inject(&mut pod);
            }
        }

        Ok(pod)
    }

    /// The task definition with `RunTask` overrides folded in.
    fn effective_task_definition(&self) -> TaskDefinition {
        let mut task_definition = self.task_definition.clone();
        let overrides = match self.overlay.and_then(|o| o.overrides.as_ref()) {
            Some(overrides) => overrides,
            None => return task_definition,
        };
        for container_override in &overrides.container_overrides {
            if let Some(definition) = task_definition
                .container_definitions
                .iter_mut()
                .find(|c| c.name == container_override.name)
            {
                if !container_override.command.is_empty() {
                    definition.command = container_override.command.clone();
                }
                for pair in &container_override.environment {
                    match definition
                        .environment
                        .iter_mut()
                        .find(|existing| existing.name == pair.name)
                    {
                        Some(existing) => existing.value = pair.value.clone(),
                        None => definition.environment.push(pair.clone()),
                    }
                }
                if container_override.cpu.is_some() {
                    definition.cpu = container_override.cpu;
                }
                if container_override.memory.is_some() {
                    definition.memory = container_override.memory;
                }
                if container_override.memory_reservation.is_some() {
                    definition.memory_reservation = container_override.memory_reservation;
                }
            }
        }
        if overrides.task_role_arn.is_some() {
            task_definition.task_role_arn = overrides.task_role_arn.clone();
        }
        if overrides.execution_role_arn.is_some() {
            task_definition.execution_role_arn = overrides.execution_role_arn.clone();
        }
        if overrides.cpu.is_some() {
            task_definition.cpu = overrides.cpu.clone();
        }
        if overrides.memory.is_some() {
            task_definition.memory = overrides.memory.clone();
        }
        task_definition
    }

    fn placement_constraints(&self) -> Vec<PlacementConstraint> {
        self.overlay
            .map(|overlay| overlay.placement_constraints.clone())
            .unwrap_or_default()
    }

    fn launch_type(&self) -> LaunchType {
        self.overlay
            .and_then(|overlay| overlay.launch_type)
            .unwrap_or_default()
    }

    fn labels(&self, task_definition: &TaskDefinition) -> Result<BTreeMap<String, String>> {
        let mut labels: BTreeMap<String, String> = [
            (LABEL_CLUSTER, self.cluster.cluster_name.as_str()),
            (LABEL_TASK_ID, self.task_id),
            (LABEL_TASK_FAMILY, task_definition.family.as_str()),
            (LABEL_MANAGED_BY, MANAGED_BY),
        ]
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
        labels.insert(
            LABEL_TASK_REVISION.to_owned(),
            task_definition.revision.to_string(),
        );
        labels.insert(
            LABEL_LAUNCH_TYPE.to_owned(),
            self.launch_type().to_string(),
        );

        if self.config.iam_integration {
            if let Some(role_arn) = &task_definition.task_role_arn {
                labels.insert(
                    LABEL_TASK_ROLE_NAME.to_owned(),
                    self.role_name(role_arn)?,
                );
            }
        }

        for tag in task_definition
            .tags
            .iter()
            .chain(self.overlay.iter().flat_map(|o| o.tags.iter()))
        {
            labels.insert(
                sanitize_label(&format!("{}{}", TAG_LABEL_PREFIX, tag.key)),
                sanitize_label(&tag.value),
            );
        }
        Ok(labels)
    }

    fn annotations(&self, task_definition: &TaskDefinition) -> Result<BTreeMap<String, String>> {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            ANNOTATION_TASK_ARN.to_owned(),
            Arn::ecs_task(
                &self.config.region,
                &self.config.account_id,
                &self.cluster.cluster_name,
                self.task_id,
            ),
        );
        annotations.insert(
            ANNOTATION_TASK_DEFINITION_ARN.to_owned(),
            task_definition
                .task_definition_arn
                .clone()
                .unwrap_or_else(|| {
                    Arn::ecs_task_definition(
                        &self.config.region,
                        &self.config.account_id,
                        &task_definition.family,
                        task_definition.revision,
                    )
                }),
        );

        if let Some(role_arn) = &task_definition.execution_role_arn {
            annotations.insert(ANNOTATION_EXECUTION_ROLE_ARN.to_owned(), role_arn.clone());
        }
        if let Some(role_arn) = &task_definition.task_role_arn {
            annotations.insert(ANNOTATION_TASK_ROLE_ARN.to_owned(), role_arn.clone());
        }

        self.network_annotations(task_definition, &mut annotations);
        self.log_annotations(task_definition, &mut annotations);
        self.secret_annotations(task_definition, &mut annotations);
        Ok(annotations)
    }

    fn network_annotations(
        &self,
        task_definition: &TaskDefinition,
        annotations: &mut BTreeMap<String, String>,
    ) {
        let network_configuration = self.overlay.and_then(|o| o.network_configuration.as_ref());
        if task_definition.network_mode == NetworkMode::Awsvpc || network_configuration.is_some() {
            annotations.insert(
                ANNOTATION_NETWORK_MODE.to_owned(),
                task_definition.network_mode.to_string(),
            );
        }
        if let Some(awsvpc) = network_configuration.and_then(|nc| nc.awsvpc_configuration.as_ref())
        {
            if !awsvpc.subnets.is_empty() {
                annotations.insert(ANNOTATION_SUBNETS.to_owned(), awsvpc.subnets.join(","));
            }
            if !awsvpc.security_groups.is_empty() {
                annotations.insert(
                    ANNOTATION_SECURITY_GROUPS.to_owned(),
                    awsvpc.security_groups.join(","),
                );
            }
            if let Some(assign) = awsvpc.assign_public_ip {
                annotations.insert(ANNOTATION_ASSIGN_PUBLIC_IP.to_owned(), assign.to_string());
            }
        }
    }

    /// Log annotations are read by the log-collector DaemonSet; the core never writes logs.
    fn log_annotations(
        &self,
        task_definition: &TaskDefinition,
        annotations: &mut BTreeMap<String, String>,
    ) {
        let mut any = false;
        for definition in &task_definition.container_definitions {
            let log_configuration = match &definition.log_configuration {
                Some(lc) if lc.log_driver == "awslogs" => lc,
                _ => continue,
            };
            any = true;
            let prefix = format!("{}{}-logs", ANNOTATION_CONTAINER_PREFIX, definition.name);
            annotations.insert(format!("{}-driver", prefix), "awslogs".to_owned());
            for (option, value) in &log_configuration.options {
                let suffix = option.strip_prefix("awslogs-").unwrap_or(option.as_str());
                annotations.insert(format!("{}-{}", prefix, suffix), value.clone());
            }
        }
        if any {
            annotations.insert(
                ANNOTATION_CLOUDWATCH_LOGS_ENABLED.to_owned(),
                "true".to_owned(),
            );
        }
    }

    fn secret_annotations(
        &self,
        task_definition: &TaskDefinition,
        annotations: &mut BTreeMap<String, String>,
    ) {
        let mut index = 0;
        for definition in &task_definition.container_definitions {
            for secret in &definition.secrets {
                annotations.insert(
                    format!("{}{}-arn", ANNOTATION_SECRET_PREFIX, index),
                    format!("{}:{}:{}", definition.name, secret.name, secret.value_from),
                );
                index += 1;
            }
        }
        if index > 0 {
            annotations.insert(ANNOTATION_SECRET_COUNT.to_owned(), index.to_string());
        }
    }

    fn service_account(&self, task_definition: &TaskDefinition) -> Result<Option<String>> {
        if !self.config.iam_integration {
            return Ok(None);
        }
        match &task_definition.task_role_arn {
            Some(role_arn) => Ok(Some(format!("{}-sa", self.role_name(role_arn)?))),
            None => Ok(None),
        }
    }

    fn role_name(&self, role_arn: &str) -> Result<String> {
        Arn::parse(role_arn)
            .ok()
            .as_ref()
            .and_then(Arn::iam_role_name)
            .map(str::to_owned)
            .context(error::InvalidTaskDefinitionSnafu {
                reason: format!("'{}' is not an IAM role ARN", role_arn),
            })
    }

    fn convert_container(&self, definition: &ContainerDefinition) -> Result<Container> {
        let (command, args) = convert_command(definition);
        let (liveness_probe, readiness_probe) = match &definition.health_check {
            Some(health_check) => match build_probes(health_check)? {
                Some((liveness, readiness)) => (Some(liveness), Some(readiness)),
                None => (None, None),
            },
            None => (None, None),
        };

        let mut env = Vec::new();
        for pair in &definition.environment {
            env.push(EnvVar {
                name: pair.name.clone(),
                value: Some(pair.value.clone()),
                value_from: None,
            });
        }
        for secret in &definition.secrets {
            let resolved = resolve_secret_arn(&secret.value_from)?;
            env.push(EnvVar {
                name: secret.name.clone(),
                value: None,
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: Some(resolved.local_name),
                        key: resolved.key,
                        optional: None,
                    }),
                    ..EnvVarSource::default()
                }),
            });
        }

        let ports: Vec<ContainerPort> = definition
            .port_mappings
            .iter()
            .filter_map(|mapping| {
                mapping.container_port.map(|container_port| ContainerPort {
                    container_port,
                    host_port: mapping.host_port,
                    protocol: Some(
                        mapping
                            .protocol
                            .unwrap_or_default()
                            .as_kubernetes()
                            .to_owned(),
                    ),
                    name: mapping.name.clone(),
                    ..ContainerPort::default()
                })
            })
            .collect();

        let volume_mounts: Vec<VolumeMount> = definition
            .mount_points
            .iter()
            .map(|mount| VolumeMount {
                name: mount.source_volume.clone(),
                mount_path: mount.container_path.clone(),
                read_only: mount.read_only,
                ..VolumeMount::default()
            })
            .collect();

        Ok(Container {
            name: definition.name.clone(),
            image: Some(definition.image.clone()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            command,
            args,
            env: if env.is_empty() { None } else { Some(env) },
            ports: if ports.is_empty() { None } else { Some(ports) },
            resources: container_resources(definition),
            volume_mounts: if volume_mounts.is_empty() {
                None
            } else {
                Some(volume_mounts)
            },
            liveness_probe,
            readiness_probe,
            working_dir: definition.working_directory.clone(),
            security_context: security_context(definition)?,
            ..Container::default()
        })
    }

    fn convert_volume(
        &self,
        volume: &VolumeDefinition,
        annotations: &mut BTreeMap<String, String>,
    ) -> Volume {
        let name = volume.name.clone();
        let annotate = |annotations: &mut BTreeMap<String, String>, field: &str, value: String| {
            annotations.insert(
                format!("{}{}-{}", ANNOTATION_VOLUME_PREFIX, volume.name, field),
                value,
            );
        };

        if let Some(source_path) = volume.host.as_ref().and_then(|h| h.source_path.clone()) {
            annotate(annotations, "type", "host".to_owned());
            return Volume {
                name,
                host_path: Some(HostPathVolumeSource {
                    path: source_path,
                    ..HostPathVolumeSource::default()
                }),
                ..Volume::default()
            };
        }

        if let Some(efs) = &volume.efs_volume_configuration {
            annotate(annotations, "type", "efs".to_owned());
            annotate(annotations, "file-system-id", efs.file_system_id.clone());
            return Volume {
                name,
                nfs: Some(NFSVolumeSource {
                    server: format!(
                        "{}.efs.{}.amazonaws.com",
                        efs.file_system_id, self.config.region
                    ),
                    path: efs
                        .root_directory
                        .clone()
                        .filter(|dir| !dir.is_empty())
                        .unwrap_or_else(|| "/".to_string()),
                    ..NFSVolumeSource::default()
                }),
                ..Volume::default()
            };
        }

        if let Some(docker) = &volume.docker_volume_configuration {
            annotate(annotations, "type", "docker".to_owned());
            match docker.driver.as_deref() {
                Some("rexray/ebs") => {
                    if let Some(volume_id) = docker.driver_opts.get("volumeID") {
                        return Volume {
                            name,
                            aws_elastic_block_store: Some(AWSElasticBlockStoreVolumeSource {
                                volume_id: volume_id.clone(),
                                fs_type: Some("ext4".to_string()),
                                ..AWSElasticBlockStoreVolumeSource::default()
                            }),
                            ..Volume::default()
                        };
                    }
                }
                Some("nfs") => {
                    if let Some(server) = docker.driver_opts.get("server") {
                        return Volume {
                            name,
                            nfs: Some(NFSVolumeSource {
                                server: server.clone(),
                                path: docker
                                    .driver_opts
                                    .get("path")
                                    .cloned()
                                    .unwrap_or_else(|| "/".to_string()),
                                ..NFSVolumeSource::default()
                            }),
                            ..Volume::default()
                        };
                    }
                }
                Some("local") | None => {
                    if docker.scope.as_deref() == Some("shared") {
                        return Volume {
                            name: name.clone(),
                            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                claim_name: format!("kecs-volume-{}", sanitize_name(&name)),
                                ..PersistentVolumeClaimVolumeSource::default()
                            }),
                            ..Volume::default()
                        };
                    }
                }
                Some(_) => {}
            }
            return empty_dir_volume(name);
        }

        if let Some(fsx) = &volume.fsx_windows_file_server_volume_configuration {
            // FSx for Windows has no Linux-side volume plugin; fall back to an emptyDir and
            // leave enough detail behind for an operator to see what was asked for.
            annotate(annotations, "type", "fsx-windows".to_owned());
            annotate(annotations, "file-system-id", fsx.file_system_id.clone());
            if let Some(root_directory) = &fsx.root_directory {
                annotate(annotations, "root-directory", root_directory.clone());
            }
            return empty_dir_volume(name);
        }

        annotate(annotations, "type", "emptyDir".to_owned());
        empty_dir_volume(name)
    }
}

fn empty_dir_volume(name: String) -> Volume {
    Volume {
        name,
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Volume::default()
    }
}

/// The PersistentVolumeClaims a task definition's shared docker volumes refer to. The claims
/// are applied before the workload; an existing claim is never modified.
pub fn shared_volume_claims(
    task_definition: &TaskDefinition,
    namespace: &str,
) -> Vec<PersistentVolumeClaim> {
    task_definition
        .volumes
        .iter()
        .filter(|volume| {
            volume
                .docker_volume_configuration
                .as_ref()
                .map(|docker| {
                    matches!(docker.driver.as_deref(), Some("local") | None)
                        && docker.scope.as_deref() == Some("shared")
                })
                .unwrap_or(false)
        })
        .map(|volume| PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(format!("kecs-volume-{}", sanitize_name(&volume.name))),
                namespace: Some(namespace.to_owned()),
                labels: Some(
                    [(LABEL_MANAGED_BY.to_owned(), MANAGED_BY.to_owned())]
                        .into_iter()
                        .collect(),
                ),
                ..ObjectMeta::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(ResourceRequirements {
                    requests: Some(
                        [("storage".to_string(), Quantity("1Gi".to_string()))]
                            .into_iter()
                            .collect(),
                    ),
                    ..ResourceRequirements::default()
                }),
                ..PersistentVolumeClaimSpec::default()
            }),
            ..PersistentVolumeClaim::default()
        })
        .collect()
}

/// ECS `entryPoint`/`command` map onto Kubernetes `command`/`args`: an entry point replaces the
/// image ENTRYPOINT, a bare command only replaces the image CMD.
fn convert_command(definition: &ContainerDefinition) -> (Option<Vec<String>>, Option<Vec<String>>) {
    if !definition.entry_point.is_empty() {
        (
            Some(definition.entry_point.clone()),
            if definition.command.is_empty() {
                None
            } else {
                Some(definition.command.clone())
            },
        )
    } else if !definition.command.is_empty() {
        (None, Some(definition.command.clone()))
    } else {
        (None, None)
    }
}

/// Convert a Docker-style health check into liveness and readiness probes. The readiness probe
/// copies the liveness probe but caps the initial delay.
fn build_probes(health_check: &HealthCheck) -> Result<Option<(Probe, Probe)>> {
    let kind = match health_check.command.first() {
        Some(kind) => kind.as_str(),
        None => return Ok(None),
    };

    let mut probe = Probe {
        period_seconds: Some(health_check.interval.unwrap_or(DEFAULT_PROBE_PERIOD)),
        timeout_seconds: Some(health_check.timeout.unwrap_or(DEFAULT_PROBE_TIMEOUT)),
        failure_threshold: Some(health_check.retries.unwrap_or(DEFAULT_PROBE_FAILURES)),
        initial_delay_seconds: Some(
            health_check
                .start_period
                .unwrap_or(DEFAULT_PROBE_INITIAL_DELAY),
        ),
        success_threshold: Some(1),
        ..Probe::default()
    };

    match kind {
        "CMD-SHELL" => {
            let shell_command = health_check.command.get(1).context(
                error::InvalidTaskDefinitionSnafu {
                    reason: "CMD-SHELL health check requires a command",
                },
            )?;
            probe.exec = Some(ExecAction {
                command: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    shell_command.clone(),
                ]),
            });
        }
        "CMD" => {
            ensure!(
                health_check.command.len() > 1,
                error::InvalidTaskDefinitionSnafu {
                    reason: "CMD health check requires a command",
                }
            );
            probe.exec = Some(ExecAction {
                command: Some(health_check.command[1..].to_vec()),
            });
        }
        "HTTP" => {
            let path = health_check.command.get(1).cloned().context(
                error::InvalidTaskDefinitionSnafu {
                    reason: "HTTP health check requires a path",
                },
            )?;
            let port = health_check
                .command
                .get(2)
                .and_then(|p| p.parse::<i32>().ok())
                .unwrap_or(80);
            probe.http_get = Some(HTTPGetAction {
                path: Some(path),
                port: IntOrString::Int(port),
                ..HTTPGetAction::default()
            });
        }
        other => {
            return error::InvalidTaskDefinitionSnafu {
                reason: format!("unknown health check kind '{}'", other),
            }
            .fail();
        }
    }

    let mut readiness = probe.clone();
    readiness.initial_delay_seconds = probe
        .initial_delay_seconds
        .map(|delay| delay.min(MAX_READINESS_INITIAL_DELAY));
    Ok(Some((probe, readiness)))
}

/// Per-container resources: CPU units become millicores with requests == limits; a hard memory
/// limit sets both, a bare reservation sets the request only.
fn container_resources(definition: &ContainerDefinition) -> Option<ResourceRequirements> {
    let mut requests = BTreeMap::new();
    let mut limits = BTreeMap::new();

    if let Some(cpu) = definition.cpu.filter(|cpu| *cpu > 0) {
        let quantity = Quantity(format!("{}m", cpu_units_to_millicores(cpu)));
        requests.insert("cpu".to_string(), quantity.clone());
        limits.insert("cpu".to_string(), quantity);
    }
    if let Some(memory) = definition.memory {
        let quantity = Quantity(format!("{}Mi", memory));
        requests.insert("memory".to_string(), quantity.clone());
        limits.insert("memory".to_string(), quantity);
    } else if let Some(reservation) = definition.memory_reservation {
        requests.insert("memory".to_string(), Quantity(format!("{}Mi", reservation)));
    }

    if requests.is_empty() && limits.is_empty() {
        return None;
    }
    Some(ResourceRequirements {
        requests: if requests.is_empty() {
            None
        } else {
            Some(requests)
        },
        limits: if limits.is_empty() { None } else { Some(limits) },
    })
}

fn cpu_units_to_millicores(units: i64) -> i64 {
    ((units * 1000) as f64 / 1024.0).round() as i64
}

fn security_context(definition: &ContainerDefinition) -> Result<Option<SecurityContext>> {
    let mut context = SecurityContext::default();
    let mut any = false;

    if let Some(user) = &definition.user {
        let mut parts = user.splitn(2, ':');
        let uid = parts
            .next()
            .and_then(|uid| uid.parse::<i64>().ok())
            .context(error::InvalidTaskDefinitionSnafu {
                reason: format!("user '{}' is not of the form uid[:gid]", user),
            })?;
        context.run_as_user = Some(uid);
        if let Some(gid) = parts.next() {
            context.run_as_group =
                Some(
                    gid.parse::<i64>()
                        .ok()
                        .context(error::InvalidTaskDefinitionSnafu {
                            reason: format!("user '{}' is not of the form uid[:gid]", user),
                        })?,
                );
        }
        any = true;
    }
    if let Some(privileged) = definition.privileged {
        context.privileged = Some(privileged);
        any = true;
    }
    if let Some(read_only) = definition.readonly_root_filesystem {
        context.read_only_root_filesystem = Some(read_only);
        any = true;
    }

    Ok(any.then_some(context))
}

/// Distribute task-level CPU and memory over the containers. Containers without their own
/// request split the task total evenly; when every container already has a request, the
/// requests are scaled proportionally so that their sum fits the task total.
fn apply_task_resources(
    containers: &mut [Container],
    task_cpu_units: Option<i64>,
    task_memory_mib: Option<i64>,
) {
    if let Some(units) = task_cpu_units {
        distribute(
            containers,
            "cpu",
            cpu_units_to_millicores(units),
            |millis| format!("{}m", millis),
            |value| value.trim_end_matches('m').parse().ok(),
        );
    }
    if let Some(memory) = task_memory_mib {
        distribute(
            containers,
            "memory",
            memory,
            |mib| format!("{}Mi", mib),
            |value| value.trim_end_matches("Mi").parse().ok(),
        );
    }
}

fn distribute(
    containers: &mut [Container],
    resource: &str,
    total: i64,
    format: impl Fn(i64) -> String,
    parse: impl Fn(&str) -> Option<i64>,
) {
    let current: Vec<Option<i64>> = containers
        .iter()
        .map(|container| {
            container
                .resources
                .as_ref()
                .and_then(|r| r.requests.as_ref())
                .and_then(|requests| requests.get(resource))
                .and_then(|quantity| parse(&quantity.0))
        })
        .collect();

    let unset: Vec<usize> = current
        .iter()
        .enumerate()
        .filter(|(_, value)| value.is_none())
        .map(|(index, _)| index)
        .collect();

    if !unset.is_empty() {
        let share = total / unset.len() as i64;
        for index in unset {
            set_resource(&mut containers[index], resource, &format(share));
        }
        return;
    }

    // Every container already asks for some; scale proportionally to fit the task total.
    let sum: i64 = current.iter().flatten().sum();
    if sum == 0 || sum == total {
        return;
    }
    for (index, value) in current.iter().enumerate() {
        if let Some(value) = value {
            let scaled = value * total / sum;
            set_resource(&mut containers[index], resource, &format(scaled));
        }
    }
}

fn set_resource(container: &mut Container, resource: &str, value: &str) {
    let resources = container.resources.get_or_insert_with(ResourceRequirements::default);
    resources
        .requests
        .get_or_insert_with(BTreeMap::new)
        .insert(resource.to_string(), Quantity(value.to_string()));
    resources
        .limits
        .get_or_insert_with(BTreeMap::new)
        .insert(resource.to_string(), Quantity(value.to_string()));
}

/// Every task container talks to the emulator with static test credentials; existing variables
/// are never overwritten.
fn inject_emulator_credentials(container: &mut Container, region: &str) {
    let env = container.env.get_or_insert_with(Vec::new);
    for (name, value) in [
        (ENV_AWS_ACCESS_KEY_ID, EMULATOR_CREDENTIAL),
        (ENV_AWS_SECRET_ACCESS_KEY, EMULATOR_CREDENTIAL),
        (ENV_AWS_DEFAULT_REGION, region),
    ] {
        if !env.iter().any(|existing| existing.name == name) {
            env.push(EnvVar {
                name: name.to_owned(),
                value: Some(value.to_owned()),
                value_from: None,
            });
        }
    }
}

/// Sanitize arbitrary text into the Kubernetes label-value grammar: lowercase alphanumerics
/// plus `-`, `_` and `.`, at most 63 characters, alphanumeric at both ends.
pub(crate) fn sanitize_label(value: &str) -> String {
    let mut sanitized: String = value
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    sanitized.truncate(63);
    sanitized
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_owned()
}

/// Sanitize a name into DNS-1123 form for object names.
pub(crate) fn sanitize_name(value: &str) -> String {
    let mut sanitized: String = value
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    sanitized.truncate(63);
    sanitized.trim_matches('-').to_owned()
}

fn parse_task_quantity(value: Option<&str>) -> Result<Option<i64>> {
    match value {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .ok()
            .filter(|parsed| *parsed > 0)
            .map(Some)
            .context(error::InvalidTaskDefinitionSnafu {
                reason: format!("'{}' is not a positive integer", raw),
            }),
    }
}
