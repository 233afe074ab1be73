use super::{resolve_cluster, resolve_task_definition};
use crate::error::{EcsError, Result};
use crate::ops::services::service_lock_key;
use crate::state::AppState;
use chrono::Utc;
use kecs_controller::TaskSetBuilder;
use kecs_model::{Arn, LoadBalancer, Scale, ServiceStatus, TaskSet};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct CreateTaskSetRequest {
    pub cluster: Option<String>,
    pub service: String,
    pub task_definition: String,
    pub external_id: Option<String>,
    pub scale: Option<Scale>,
    pub load_balancers: Vec<LoadBalancer>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TaskSetResponse {
    pub task_set: TaskSet,
}

pub(crate) async fn create_task_set(
    state: Arc<AppState>,
    request: CreateTaskSetRequest,
) -> Result<TaskSetResponse> {
    let cluster = resolve_cluster(&state, request.cluster.as_deref()).await?;
    let cluster_arn = cluster.cluster_arn.clone().unwrap_or_default();
    let task_definition = resolve_task_definition(&state, &request.task_definition).await?;

    let lock_key = service_lock_key(&cluster_arn, &request.service);
    let _guard = state.locks.lock(&lock_key).await;

    let service = state
        .services
        .get(&cluster_arn, &request.service)
        .await?
        .ok_or(EcsError::ServiceNotFound)?;
    if service.status == ServiceStatus::Inactive {
        return Err(EcsError::ServiceNotActive);
    }

    let id = format!("ts-{}", &Uuid::new_v4().simple().to_string()[..8]);
    let now = Utc::now();
    let mut task_set = TaskSet {
        id: id.clone(),
        task_set_arn: Some(Arn::ecs_task_set(
            &state.config.region,
            &state.config.account_id,
            &cluster.cluster_name,
            &request.service,
            &id,
        )),
        service_arn: service.service_arn.clone(),
        cluster_arn: Some(cluster_arn.clone()),
        external_id: request.external_id,
        task_definition: task_definition.task_definition_arn.clone(),
        scale: request.scale.or(Some(Scale {
            value: 100.0,
            unit: kecs_model::ScaleUnit::Percent,
        })),
        status: "ACTIVE".to_string(),
        load_balancers: request.load_balancers,
        created_at: Some(now),
        updated_at: Some(now),
        ..TaskSet::default()
    };
    task_set.computed_desired_count = task_set.desired_replicas(service.desired_count);

    // Record the task set under its service before applying anything.
    let mut updated_service = service;
    updated_service.task_sets.push(task_set.clone());
    let updated_service = state.services.update(updated_service).await?;

    let manifests = TaskSetBuilder {
        task_set: &task_set,
        service: &updated_service,
        task_definition: &task_definition,
        cluster: &cluster,
        config: &state.config,
        stager: &state.stager,
        injector: state.injector_ref(),
    }
    .build()?;

    let namespace = cluster.namespace();
    let deployment_name = format!("{}-{}", request.service, id);
    state.orchestrator.ensure_namespace(&namespace).await?;
    state
        .orchestrator
        .apply_deployment(&namespace, manifests.deployment)
        .await?;
    if let Some(k8s_service) = manifests.service {
        state
            .orchestrator
            .apply_service(&namespace, k8s_service)
            .await?;
        // The companion Service fronts the task set; hand its in-cluster name to the
        // load-balancer integration when a target group is declared.
        for target_group_arn in task_set
            .load_balancers
            .iter()
            .filter_map(|lb| lb.target_group_arn.as_deref())
        {
            let endpoint = format!("{}.{}.svc.cluster.local", deployment_name, namespace);
            if let Err(elbv2_error) = state
                .elbv2
                .register_targets(target_group_arn, &[endpoint])
                .await
            {
                warn!(
                    "unable to register task set '{}' with '{}': {}",
                    id, target_group_arn, elbv2_error
                );
            }
        }
    }

    info!("created task set '{}' under service '{}'", id, request.service);
    Ok(TaskSetResponse { task_set })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct DescribeTaskSetsRequest {
    pub cluster: Option<String>,
    pub service: String,
    pub task_sets: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DescribeTaskSetsResponse {
    pub task_sets: Vec<TaskSet>,
}

pub(crate) async fn describe_task_sets(
    state: Arc<AppState>,
    request: DescribeTaskSetsRequest,
) -> Result<DescribeTaskSetsResponse> {
    let cluster = resolve_cluster(&state, request.cluster.as_deref()).await?;
    let cluster_arn = cluster.cluster_arn.clone().unwrap_or_default();
    let service = state
        .services
        .get(&cluster_arn, &request.service)
        .await?
        .ok_or(EcsError::ServiceNotFound)?;

    let task_sets = if request.task_sets.is_empty() {
        service.task_sets
    } else {
        service
            .task_sets
            .into_iter()
            .filter(|task_set| {
                request.task_sets.iter().any(|reference| {
                    reference == &task_set.id
                        || task_set.task_set_arn.as_deref() == Some(reference.as_str())
                })
            })
            .collect()
    };
    Ok(DescribeTaskSetsResponse { task_sets })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct DeleteTaskSetRequest {
    pub cluster: Option<String>,
    pub service: String,
    pub task_set: String,
}

pub(crate) async fn delete_task_set(
    state: Arc<AppState>,
    request: DeleteTaskSetRequest,
) -> Result<TaskSetResponse> {
    let cluster = resolve_cluster(&state, request.cluster.as_deref()).await?;
    let cluster_arn = cluster.cluster_arn.clone().unwrap_or_default();

    let lock_key = service_lock_key(&cluster_arn, &request.service);
    let _guard = state.locks.lock(&lock_key).await;

    let service = state
        .services
        .get(&cluster_arn, &request.service)
        .await?
        .ok_or(EcsError::ServiceNotFound)?;

    let mut service = service;
    let position = service
        .task_sets
        .iter()
        .position(|task_set| {
            task_set.id == request.task_set
                || task_set.task_set_arn.as_deref() == Some(request.task_set.as_str())
        })
        .ok_or(EcsError::TaskSetNotFound)?;
    let mut removed = service.task_sets.remove(position);
    state.services.update(service).await?;

    let namespace = cluster.namespace();
    let deployment_name = format!("{}-{}", request.service, removed.id);
    state
        .orchestrator
        .delete_deployment(&namespace, &deployment_name)
        .await?;
    state
        .orchestrator
        .delete_service(&namespace, &deployment_name)
        .await?;
    for target_group_arn in removed
        .load_balancers
        .iter()
        .filter_map(|lb| lb.target_group_arn.as_deref())
    {
        let endpoint = format!("{}.{}.svc.cluster.local", deployment_name, namespace);
        if let Err(elbv2_error) = state
            .elbv2
            .deregister_targets(target_group_arn, &[endpoint])
            .await
        {
            warn!(
                "unable to deregister task set '{}' from '{}': {}",
                removed.id, target_group_arn, elbv2_error
            );
        }
    }

    info!("deleted task set '{}'", removed.id);
    removed.status = "DRAINING".to_string();
    Ok(TaskSetResponse { task_set: removed })
}
