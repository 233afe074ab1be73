use super::{page_from, resolve_cluster, resolve_task_definition};
use crate::error::{EcsError, Result};
use crate::state::AppState;
use chrono::Utc;
use kecs_controller::{PodBuilder, RunTaskOverlay};
use kecs_model::storage::TaskFilter;
use kecs_model::{
    Arn, Failure, LaunchType, NetworkConfiguration, PlacementConstraint, StopCode, Tag, Task,
    TaskOverride, TaskStatus,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// RunTask caps `count` the way ECS does.
const MAX_RUN_TASK_COUNT: i32 = 10;

/// Platform versions the emulated Fargate runtime admits.
const KNOWN_PLATFORM_VERSIONS: &[&str] = &["LATEST", "1.4.0", "1.3.0"];

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct RunTaskRequest {
    pub cluster: Option<String>,
    pub task_definition: String,
    pub count: Option<i32>,
    pub overrides: Option<TaskOverride>,
    pub network_configuration: Option<NetworkConfiguration>,
    pub placement_constraints: Vec<PlacementConstraint>,
    pub launch_type: Option<LaunchType>,
    pub platform_version: Option<String>,
    pub group: Option<String>,
    pub started_by: Option<String>,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RunTaskResponse {
    pub tasks: Vec<Task>,
    pub failures: Vec<Failure>,
}

pub(crate) async fn run_task(
    state: Arc<AppState>,
    request: RunTaskRequest,
) -> Result<RunTaskResponse> {
    if let Some(platform_version) = request
        .platform_version
        .as_deref()
        .filter(|version| !KNOWN_PLATFORM_VERSIONS.contains(version))
    {
        return Err(EcsError::PlatformUnknown {
            platform_version: platform_version.to_owned(),
        });
    }
    let count = request.count.unwrap_or(1);
    if !(1..=MAX_RUN_TASK_COUNT).contains(&count) {
        return Err(EcsError::invalid_parameter(format!(
            "count must be between 1 and {}",
            MAX_RUN_TASK_COUNT
        )));
    }

    let cluster = resolve_cluster(&state, request.cluster.as_deref()).await?;
    let task_definition = resolve_task_definition(&state, &request.task_definition).await?;
    let cluster_arn = cluster.cluster_arn.clone().unwrap_or_default();
    let namespace = cluster.namespace();
    state.orchestrator.ensure_namespace(&namespace).await?;
    for claim in kecs_controller::shared_volume_claims(&task_definition, &namespace) {
        state.orchestrator.apply_pvc(&namespace, claim).await?;
    }

    let overlay = RunTaskOverlay {
        overrides: request.overrides.clone(),
        network_configuration: request.network_configuration.clone(),
        placement_constraints: request.placement_constraints.clone(),
        tags: request.tags.clone(),
        launch_type: request.launch_type,
        group: request.group.clone(),
    };

    let mut tasks = Vec::new();
    let mut failures = Vec::new();
    for _ in 0..count {
        let task_id = Uuid::new_v4().simple().to_string();
        let task_arn = Arn::ecs_task(
            &state.config.region,
            &state.config.account_id,
            &cluster.cluster_name,
            &task_id,
        );

        // Translation failures are input errors and fail the call before anything is stored.
        let pod = PodBuilder {
            task_definition: &task_definition,
            cluster: &cluster,
            task_id: &task_id,
            overlay: Some(&overlay),
            config: &state.config,
            stager: &state.stager,
            injector: state.injector_ref(),
        }
        .build()?;

        let task = Task {
            task_arn: Some(task_arn.clone()),
            cluster_arn: Some(cluster_arn.clone()),
            task_definition_arn: task_definition.task_definition_arn.clone(),
            last_status: TaskStatus::Provisioning,
            desired_status: TaskStatus::Running,
            launch_type: request.launch_type,
            group: request
                .group
                .clone()
                .or_else(|| Some(format!("family:{}", task_definition.family))),
            started_by: request.started_by.clone(),
            created_at: Some(Utc::now()),
            overrides: request
                .overrides
                .as_ref()
                .map(|overrides| overrides.container_overrides.clone())
                .unwrap_or_default(),
            tags: request.tags.clone(),
            ..Task::default()
        };

        // Intent to storage before the apply, so the projector can reconcile a crash.
        let task = state.tasks.create(task).await?;
        match state.orchestrator.apply_pod(&namespace, pod).await {
            Ok(_) => tasks.push(task),
            Err(apply_error) => {
                warn!("unable to start task '{}': {}", task_id, apply_error);
                fail_task(&state, &cluster_arn, &task_arn, &apply_error.to_string()).await;
                failures.push(Failure::new(task_arn, apply_error.to_string()));
            }
        }
    }

    info!(
        "ran {} task(s) of '{}' in cluster '{}'",
        tasks.len(),
        task_definition.family_revision(),
        cluster.cluster_name
    );
    Ok(RunTaskResponse { tasks, failures })
}

/// Compensation for a failed apply: the stored task becomes STOPPED with the failure reason.
async fn fail_task(state: &AppState, cluster_arn: &str, task_arn: &str, reason: &str) {
    let _guard = state.locks.lock(task_arn).await;
    for attempt in 0..2 {
        let task = match state.tasks.get(cluster_arn, task_arn).await {
            Ok(Some(task)) => task,
            Ok(None) => return,
            Err(storage_error) => {
                warn!("unable to read task '{}': {}", task_arn, storage_error);
                return;
            }
        };
        let mut task = task;
        task.last_status = TaskStatus::Stopped;
        task.desired_status = TaskStatus::Stopped;
        task.stop_code = Some(StopCode::TaskFailedToStart);
        task.stopped_reason = Some(reason.to_owned());
        task.record_stopped_at(Utc::now());
        match state.tasks.update(task).await {
            Ok(_) => return,
            Err(storage_error) if storage_error.is_version_conflict() && attempt == 0 => continue,
            Err(storage_error) => {
                warn!("unable to mark task '{}' STOPPED: {}", task_arn, storage_error);
                return;
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct StopTaskRequest {
    pub cluster: Option<String>,
    pub task: String,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StopTaskResponse {
    pub task: Task,
}

pub(crate) async fn stop_task(
    state: Arc<AppState>,
    request: StopTaskRequest,
) -> Result<StopTaskResponse> {
    let cluster = resolve_cluster(&state, request.cluster.as_deref()).await?;
    let cluster_arn = cluster.cluster_arn.clone().unwrap_or_default();

    let existing = state
        .tasks
        .get(&cluster_arn, &request.task)
        .await?
        .ok_or_else(|| EcsError::invalid_parameter("The referenced task was not found."))?;
    let task_arn = existing.task_arn.clone().unwrap_or_default();

    let _guard = state.locks.lock(&task_arn).await;
    let mut stopped = existing;
    for attempt in 0..2 {
        stopped.desired_status = TaskStatus::Stopped;
        stopped.stopping_at.get_or_insert_with(Utc::now);
        stopped.stop_code = Some(StopCode::UserInitiated);
        stopped.stopped_reason = Some(
            request
                .reason
                .clone()
                .unwrap_or_else(|| "Task stopped by user".to_owned()),
        );
        match state.tasks.update(stopped.clone()).await {
            Ok(task) => {
                stopped = task;
                break;
            }
            Err(storage_error) if storage_error.is_version_conflict() && attempt == 0 => {
                stopped = state
                    .tasks
                    .get(&cluster_arn, &request.task)
                    .await?
                    .ok_or_else(|| {
                        EcsError::invalid_parameter("The referenced task was not found.")
                    })?;
            }
            Err(storage_error) => return Err(storage_error.into()),
        }
    }

    if let Some(task_id) = stopped.id() {
        state
            .orchestrator
            .delete_pod(&cluster.namespace(), task_id)
            .await?;
    }

    info!("stopping task '{}'", request.task);
    Ok(StopTaskResponse { task: stopped })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct DescribeTasksRequest {
    pub cluster: Option<String>,
    pub tasks: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DescribeTasksResponse {
    pub tasks: Vec<Task>,
    pub failures: Vec<Failure>,
}

pub(crate) async fn describe_tasks(
    state: Arc<AppState>,
    request: DescribeTasksRequest,
) -> Result<DescribeTasksResponse> {
    let cluster = resolve_cluster(&state, request.cluster.as_deref()).await?;
    let cluster_arn = cluster.cluster_arn.clone().unwrap_or_default();

    let mut tasks = Vec::new();
    let mut failures = Vec::new();
    for reference in &request.tasks {
        match state.tasks.get(&cluster_arn, reference).await? {
            Some(task) => tasks.push(task),
            None => {
                let arn = if reference.contains('/') {
                    reference.clone()
                } else {
                    Arn::ecs_task(
                        &state.config.region,
                        &state.config.account_id,
                        &cluster.cluster_name,
                        reference,
                    )
                };
                failures.push(Failure::new(arn, "MISSING"));
            }
        }
    }
    Ok(DescribeTasksResponse { tasks, failures })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct ListTasksRequest {
    pub cluster: Option<String>,
    pub family: Option<String>,
    pub service_name: Option<String>,
    pub started_by: Option<String>,
    pub desired_status: Option<TaskStatus>,
    pub next_token: Option<String>,
    pub max_results: Option<i32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ListTasksResponse {
    pub task_arns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

pub(crate) async fn list_tasks(
    state: Arc<AppState>,
    request: ListTasksRequest,
) -> Result<ListTasksResponse> {
    let cluster = resolve_cluster(&state, request.cluster.as_deref()).await?;
    let filter = TaskFilter {
        cluster_arn: cluster.cluster_arn.clone(),
        family: request.family,
        service_name: request.service_name,
        started_by: request.started_by,
        desired_status: request.desired_status,
    };
    let page = state
        .tasks
        .list(&filter, &page_from(request.next_token, request.max_results))
        .await?;
    Ok(ListTasksResponse {
        task_arns: page
            .items
            .into_iter()
            .filter_map(|task| task.task_arn)
            .collect(),
        next_token: page.next_token,
    })
}
