use super::{page_from, resolve_cluster, resolve_task_definition, validate_name};
use crate::error::{EcsError, Result};
use crate::state::AppState;
use chrono::Utc;
use kecs_controller::DeploymentBuilder;
use kecs_model::storage::ServiceFilter;
use kecs_model::{
    Arn, Cluster, DeploymentConfiguration, Failure, LaunchType, LoadBalancer,
    NetworkConfiguration, PlacementConstraint, PlacementStrategy, SchedulingStrategy, Service,
    ServiceDeployment, ServiceRegistry, ServiceStatus, Tag, TaskDefinition,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct CreateServiceRequest {
    pub cluster: Option<String>,
    pub service_name: String,
    pub task_definition: String,
    pub desired_count: Option<i32>,
    pub launch_type: Option<LaunchType>,
    pub scheduling_strategy: Option<SchedulingStrategy>,
    pub load_balancers: Vec<LoadBalancer>,
    pub service_registries: Vec<ServiceRegistry>,
    pub network_configuration: Option<NetworkConfiguration>,
    pub deployment_configuration: Option<DeploymentConfiguration>,
    pub placement_constraints: Vec<PlacementConstraint>,
    pub placement_strategy: Vec<PlacementStrategy>,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ServiceResponse {
    pub service: Service,
}

pub(crate) async fn create_service(
    state: Arc<AppState>,
    request: CreateServiceRequest,
) -> Result<ServiceResponse> {
    validate_name("service", &request.service_name)?;
    let cluster = resolve_cluster(&state, request.cluster.as_deref()).await?;
    let task_definition = resolve_task_definition(&state, &request.task_definition).await?;
    let desired_count = request.desired_count.unwrap_or(0);
    if desired_count < 0 {
        return Err(EcsError::invalid_parameter("desiredCount must be >= 0"));
    }

    let cluster_arn = cluster.cluster_arn.clone().unwrap_or_default();
    let lock_key = service_lock_key(&cluster_arn, &request.service_name);
    let _guard = state.locks.lock(&lock_key).await;

    match state.services.get(&cluster_arn, &request.service_name).await? {
        Some(existing) if existing.status != ServiceStatus::Inactive => {
            return Err(EcsError::ResourceInUse {
                message: format!(
                    "Creation of service was not idempotent: '{}' already exists.",
                    request.service_name
                ),
            });
        }
        Some(_) => {
            // A dead service of the same name makes way for the new one.
            state
                .services
                .delete(&cluster_arn, &request.service_name)
                .await?;
        }
        None => {}
    }

    let now = Utc::now();
    let task_definition_arn = task_definition.task_definition_arn.clone();
    let service = Service {
        service_arn: Some(Arn::ecs_service(
            &state.config.region,
            &state.config.account_id,
            &cluster.cluster_name,
            &request.service_name,
        )),
        service_name: request.service_name.clone(),
        cluster_arn: Some(cluster_arn.clone()),
        task_definition: task_definition_arn.clone(),
        desired_count,
        status: ServiceStatus::Pending,
        scheduling_strategy: request.scheduling_strategy.unwrap_or_default(),
        launch_type: request.launch_type,
        load_balancers: request.load_balancers,
        service_registries: request.service_registries,
        network_configuration: request.network_configuration,
        deployment_configuration: request.deployment_configuration,
        placement_constraints: request.placement_constraints,
        placement_strategy: request.placement_strategy,
        deployments: vec![new_primary_deployment(
            task_definition_arn.as_deref().unwrap_or_default(),
            desired_count,
        )],
        tags: request.tags,
        created_at: Some(now),
        updated_at: Some(now),
        ..Service::default()
    };

    // Intent goes to storage first so a crash-restart projector can find its way back.
    let service = state.services.create(service).await?;
    if let Err(apply_error) =
        apply_service_manifests(&state, &cluster, &service, &task_definition).await
    {
        mark_service_failed(&state, &cluster_arn, &request.service_name).await;
        return Err(apply_error);
    }

    info!(
        "created service '{}' in cluster '{}' (desired {})",
        request.service_name, cluster.cluster_name, desired_count
    );
    Ok(ServiceResponse { service })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct UpdateServiceRequest {
    pub cluster: Option<String>,
    pub service: String,
    pub task_definition: Option<String>,
    pub desired_count: Option<i32>,
    pub deployment_configuration: Option<DeploymentConfiguration>,
    pub force_new_deployment: bool,
}

pub(crate) async fn update_service(
    state: Arc<AppState>,
    request: UpdateServiceRequest,
) -> Result<ServiceResponse> {
    let cluster = resolve_cluster(&state, request.cluster.as_deref()).await?;
    let cluster_arn = cluster.cluster_arn.clone().unwrap_or_default();
    if let Some(desired) = request.desired_count {
        if desired < 0 {
            return Err(EcsError::invalid_parameter("desiredCount must be >= 0"));
        }
    }
    let new_task_definition = match &request.task_definition {
        Some(reference) => Some(resolve_task_definition(&state, reference).await?),
        None => None,
    };

    let lock_key = service_lock_key(&cluster_arn, &request.service);
    let _guard = state.locks.lock(&lock_key).await;

    let mut updated = None;
    for attempt in 0..2 {
        let service = state
            .services
            .get(&cluster_arn, &request.service)
            .await?
            .ok_or(EcsError::ServiceNotFound)?;
        if service.status == ServiceStatus::Inactive {
            return Err(EcsError::ServiceNotActive);
        }

        let mut service = service;
        let now = Utc::now();
        if let Some(desired) = request.desired_count {
            service.desired_count = desired;
            if let Some(primary) = service.primary_deployment_mut() {
                primary.desired_count = desired;
            }
        }
        if let Some(configuration) = &request.deployment_configuration {
            service.deployment_configuration = Some(configuration.clone());
        }
        let desired_count = service.desired_count;
        if let Some(definition) = &new_task_definition {
            service.task_definition = definition.task_definition_arn.clone();
            rotate_primary_deployment(
                &mut service,
                definition.task_definition_arn.as_deref().unwrap_or_default(),
                desired_count,
            );
        } else if request.force_new_deployment {
            let task_definition_arn = service.task_definition.clone().unwrap_or_default();
            rotate_primary_deployment(&mut service, &task_definition_arn, desired_count);
        }
        service.status = ServiceStatus::Pending;
        service.updated_at = Some(now);

        match state.services.update(service).await {
            Ok(service) => {
                updated = Some(service);
                break;
            }
            Err(storage_error) if storage_error.is_version_conflict() && attempt == 0 => continue,
            Err(storage_error) => return Err(storage_error.into()),
        }
    }
    let service = updated.ok_or_else(|| EcsError::server("service update did not converge"))?;

    let effective_definition = match new_task_definition {
        Some(definition) => definition,
        None => {
            resolve_task_definition(
                &state,
                service.task_definition.as_deref().unwrap_or_default(),
            )
            .await?
        }
    };
    if let Err(apply_error) =
        apply_service_manifests(&state, &cluster, &service, &effective_definition).await
    {
        mark_service_failed(&state, &cluster_arn, &request.service).await;
        return Err(apply_error);
    }

    info!("updated service '{}'", request.service);
    Ok(ServiceResponse { service })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct DeleteServiceRequest {
    pub cluster: Option<String>,
    pub service: String,
    pub force: Option<bool>,
}

pub(crate) async fn delete_service(
    state: Arc<AppState>,
    request: DeleteServiceRequest,
) -> Result<ServiceResponse> {
    let cluster = resolve_cluster(&state, request.cluster.as_deref()).await?;
    let cluster_arn = cluster.cluster_arn.clone().unwrap_or_default();
    let force = request.force.unwrap_or(false);

    let lock_key = service_lock_key(&cluster_arn, &request.service);
    let _guard = state.locks.lock(&lock_key).await;

    let service = state
        .services
        .get(&cluster_arn, &request.service)
        .await?
        .ok_or(EcsError::ServiceNotFound)?;

    // Deleting a service that is already going away is idempotent.
    if service.status == ServiceStatus::Draining {
        return Ok(ServiceResponse { service });
    }

    if service.desired_count > 0 && !force {
        return Err(EcsError::invalid_parameter(
            "The service cannot be deleted while the desired count is greater than 0. \
             Scale the service down to 0 or use force=true.",
        ));
    }

    let mut service = service;
    service.desired_count = 0;
    service.status = ServiceStatus::Draining;
    service.updated_at = Some(Utc::now());
    let service = state.services.update(service).await?;

    let namespace = cluster.namespace();
    state
        .orchestrator
        .delete_deployment(&namespace, &request.service)
        .await?;
    if !service.load_balancers.is_empty() {
        state
            .orchestrator
            .delete_service(&namespace, &request.service)
            .await?;
    }

    info!("deleting service '{}' (now DRAINING)", request.service);
    Ok(ServiceResponse { service })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct DescribeServicesRequest {
    pub cluster: Option<String>,
    pub services: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DescribeServicesResponse {
    pub services: Vec<Service>,
    pub failures: Vec<Failure>,
}

pub(crate) async fn describe_services(
    state: Arc<AppState>,
    request: DescribeServicesRequest,
) -> Result<DescribeServicesResponse> {
    let cluster = resolve_cluster(&state, request.cluster.as_deref()).await?;
    let cluster_arn = cluster.cluster_arn.clone().unwrap_or_default();

    let mut services = Vec::new();
    let mut failures = Vec::new();
    for reference in &request.services {
        let name = reference.rsplit('/').next().unwrap_or(reference);
        match state.services.get(&cluster_arn, name).await? {
            Some(service) => services.push(service),
            None => failures.push(Failure::new(
                Arn::ecs_service(
                    &state.config.region,
                    &state.config.account_id,
                    &cluster.cluster_name,
                    name,
                ),
                "MISSING",
            )),
        }
    }
    Ok(DescribeServicesResponse { services, failures })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct ListServicesRequest {
    pub cluster: Option<String>,
    pub launch_type: Option<LaunchType>,
    pub next_token: Option<String>,
    pub max_results: Option<i32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ListServicesResponse {
    pub service_arns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

pub(crate) async fn list_services(
    state: Arc<AppState>,
    request: ListServicesRequest,
) -> Result<ListServicesResponse> {
    let cluster = resolve_cluster(&state, request.cluster.as_deref()).await?;
    let filter = ServiceFilter {
        cluster_arn: cluster.cluster_arn.clone(),
        launch_type: request.launch_type,
    };
    let page = state
        .services
        .list(&filter, &page_from(request.next_token, request.max_results))
        .await?;
    Ok(ListServicesResponse {
        service_arns: page
            .items
            .into_iter()
            .filter_map(|service| service.service_arn)
            .collect(),
        next_token: page.next_token,
    })
}

pub(crate) fn service_lock_key(cluster_arn: &str, service_name: &str) -> String {
    format!("{}|{}", cluster_arn, service_name)
}

pub(crate) fn new_primary_deployment(
    task_definition_arn: &str,
    desired_count: i32,
) -> ServiceDeployment {
    let now = Utc::now();
    ServiceDeployment {
        id: format!("ecs-svc/{}", Uuid::new_v4().simple()),
        status: "PRIMARY".to_string(),
        task_definition: Some(task_definition_arn.to_owned()),
        desired_count,
        created_at: Some(now),
        updated_at: Some(now),
        ..ServiceDeployment::default()
    }
}

fn rotate_primary_deployment(service: &mut Service, task_definition_arn: &str, desired: i32) {
    let now = Utc::now();
    for deployment in &mut service.deployments {
        if deployment.status == "PRIMARY" {
            deployment.status = "ACTIVE".to_string();
            deployment.updated_at = Some(now);
        }
    }
    service
        .deployments
        .insert(0, new_primary_deployment(task_definition_arn, desired));
}

pub(crate) async fn apply_service_manifests(
    state: &AppState,
    cluster: &Cluster,
    service: &Service,
    task_definition: &TaskDefinition,
) -> Result<()> {
    let manifests = DeploymentBuilder {
        service,
        task_definition,
        cluster,
        config: &state.config,
        stager: &state.stager,
        injector: state.injector_ref(),
    }
    .build()?;

    let namespace = cluster.namespace();
    state.orchestrator.ensure_namespace(&namespace).await?;
    for claim in kecs_controller::shared_volume_claims(task_definition, &namespace) {
        state.orchestrator.apply_pvc(&namespace, claim).await?;
    }
    state
        .orchestrator
        .apply_deployment(&namespace, manifests.deployment)
        .await?;
    if let Some(k8s_service) = manifests.service {
        if let Err(apply_error) = state.orchestrator.apply_service(&namespace, k8s_service).await
        {
            // Unwind the half-applied rollout before surfacing the failure.
            if let Err(rollback_error) = state
                .orchestrator
                .delete_deployment(&namespace, &service.service_name)
                .await
            {
                warn!(
                    "rollback of deployment '{}' failed: {}",
                    service.service_name, rollback_error
                );
            }
            return Err(apply_error.into());
        }
    }
    Ok(())
}

pub(crate) async fn mark_service_failed(state: &AppState, cluster_arn: &str, name: &str) {
    for attempt in 0..2 {
        let service = match state.services.get(cluster_arn, name).await {
            Ok(Some(service)) => service,
            Ok(None) => return,
            Err(storage_error) => {
                warn!("unable to read service '{}': {}", name, storage_error);
                return;
            }
        };
        let mut service = service;
        service.status = ServiceStatus::Failed;
        match state.services.update(service).await {
            Ok(_) => return,
            Err(storage_error) if storage_error.is_version_conflict() && attempt == 0 => continue,
            Err(storage_error) => {
                warn!("unable to mark service '{}' FAILED: {}", name, storage_error);
                return;
            }
        }
    }
}
