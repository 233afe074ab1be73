use super::{page_from, resolve_task_definition, validate_name};
use crate::error::{EcsError, Result};
use crate::state::AppState;
use chrono::Utc;
use kecs_controller::resolve_secret_arn;
use kecs_model::storage::TaskDefinitionFilter;
use kecs_model::{
    ContainerDefinition, IpcMode, NetworkMode, PidMode, Tag, TaskDefinition,
    TaskDefinitionStatus, VolumeDefinition,
};
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct RegisterTaskDefinitionRequest {
    pub family: String,
    pub container_definitions: Vec<ContainerDefinition>,
    pub volumes: Vec<VolumeDefinition>,
    pub network_mode: Option<NetworkMode>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub task_role_arn: Option<String>,
    pub execution_role_arn: Option<String>,
    pub pid_mode: Option<PidMode>,
    pub ipc_mode: Option<IpcMode>,
    pub requires_compatibilities: Vec<String>,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TaskDefinitionResponse {
    pub task_definition: TaskDefinition,
}

pub(crate) async fn register_task_definition(
    state: Arc<AppState>,
    request: RegisterTaskDefinitionRequest,
) -> Result<TaskDefinitionResponse> {
    validate_name("task definition family", &request.family)?;
    if request.container_definitions.is_empty() {
        return Err(EcsError::invalid_parameter(
            "containerDefinitions cannot be empty",
        ));
    }
    for definition in &request.container_definitions {
        if definition.name.is_empty() || definition.image.is_empty() {
            return Err(EcsError::invalid_parameter(
                "container definitions require a name and an image",
            ));
        }
        // Surface bad secret ARNs and artifact declarations at registration time, not when
        // the first task runs.
        for secret in &definition.secrets {
            resolve_secret_arn(&secret.value_from)?;
        }
        state.stager.plan(definition)?;
    }
    for quantity in [request.cpu.as_deref(), request.memory.as_deref()]
        .into_iter()
        .flatten()
    {
        if quantity.parse::<i64>().map(|n| n <= 0).unwrap_or(true) {
            return Err(EcsError::invalid_parameter(format!(
                "'{}' is not a valid task-level resource quantity",
                quantity
            )));
        }
    }

    let definition = TaskDefinition {
        family: request.family.clone(),
        container_definitions: request.container_definitions,
        volumes: request.volumes,
        network_mode: request.network_mode.unwrap_or_default(),
        cpu: request.cpu,
        memory: request.memory,
        task_role_arn: request.task_role_arn,
        execution_role_arn: request.execution_role_arn,
        pid_mode: request.pid_mode,
        ipc_mode: request.ipc_mode,
        requires_compatibilities: request.requires_compatibilities,
        tags: request.tags,
        registered_at: Some(Utc::now()),
        ..TaskDefinition::default()
    };
    let registered = state.task_definitions.register(definition).await?;
    info!(
        "registered task definition '{}'",
        registered.family_revision()
    );
    Ok(TaskDefinitionResponse {
        task_definition: registered,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct DescribeTaskDefinitionRequest {
    pub task_definition: String,
}

pub(crate) async fn describe_task_definition(
    state: Arc<AppState>,
    request: DescribeTaskDefinitionRequest,
) -> Result<TaskDefinitionResponse> {
    let task_definition = resolve_task_definition(&state, &request.task_definition).await?;
    Ok(TaskDefinitionResponse { task_definition })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct ListTaskDefinitionsRequest {
    pub family_prefix: Option<String>,
    pub status: Option<TaskDefinitionStatus>,
    pub next_token: Option<String>,
    pub max_results: Option<i32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ListTaskDefinitionsResponse {
    pub task_definition_arns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

pub(crate) async fn list_task_definitions(
    state: Arc<AppState>,
    request: ListTaskDefinitionsRequest,
) -> Result<ListTaskDefinitionsResponse> {
    let filter = TaskDefinitionFilter {
        family_prefix: request.family_prefix,
        status: request.status,
    };
    let page = state
        .task_definitions
        .list(&filter, &page_from(request.next_token, request.max_results))
        .await?;
    Ok(ListTaskDefinitionsResponse {
        task_definition_arns: page
            .items
            .into_iter()
            .filter_map(|definition| definition.task_definition_arn)
            .collect(),
        next_token: page.next_token,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct ListTaskDefinitionFamiliesRequest {
    pub family_prefix: Option<String>,
    pub next_token: Option<String>,
    pub max_results: Option<i32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ListTaskDefinitionFamiliesResponse {
    pub families: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

pub(crate) async fn list_task_definition_families(
    state: Arc<AppState>,
    request: ListTaskDefinitionFamiliesRequest,
) -> Result<ListTaskDefinitionFamiliesResponse> {
    let page = state
        .task_definitions
        .list_families(
            request.family_prefix.as_deref(),
            &page_from(request.next_token, request.max_results),
        )
        .await?;
    Ok(ListTaskDefinitionFamiliesResponse {
        families: page.items,
        next_token: page.next_token,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct DeregisterTaskDefinitionRequest {
    pub task_definition: String,
}

pub(crate) async fn deregister_task_definition(
    state: Arc<AppState>,
    request: DeregisterTaskDefinitionRequest,
) -> Result<TaskDefinitionResponse> {
    let spec = request
        .task_definition
        .rsplit('/')
        .next()
        .unwrap_or(&request.task_definition);
    let (family, revision) = spec
        .rsplit_once(':')
        .and_then(|(family, revision)| revision.parse::<i64>().ok().map(|r| (family, r)))
        .ok_or_else(|| {
            EcsError::invalid_parameter(
                "taskDefinition must include a revision (family:revision)",
            )
        })?;
    let deregistered = match state.task_definitions.deregister(family, revision).await {
        Ok(definition) => definition,
        Err(kecs_model::storage::Error::NotFound { .. }) => {
            return Err(EcsError::TaskDefinitionNotFound)
        }
        Err(other) => return Err(other.into()),
    };
    info!(
        "deregistered task definition '{}'",
        deregistered.family_revision()
    );
    Ok(TaskDefinitionResponse {
        task_definition: deregistered,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ops::testing::test_state;

    fn simple_request(family: &str) -> RegisterTaskDefinitionRequest {
        RegisterTaskDefinitionRequest {
            family: family.to_string(),
            container_definitions: vec![ContainerDefinition {
                name: "main".to_string(),
                image: "busybox".to_string(),
                ..ContainerDefinition::default()
            }],
            ..RegisterTaskDefinitionRequest::default()
        }
    }

    #[tokio::test]
    async fn register_allocates_increasing_revisions() {
        let (state, _) = test_state();
        let first = register_task_definition(state.clone(), simple_request("web"))
            .await
            .unwrap();
        let second = register_task_definition(state, simple_request("web"))
            .await
            .unwrap();
        assert_eq!(first.task_definition.revision, 1);
        assert_eq!(second.task_definition.revision, 2);
        assert_eq!(
            second.task_definition.task_definition_arn.as_deref(),
            Some("arn:aws:ecs:us-east-1:000000000000:task-definition/web:2")
        );
    }

    #[tokio::test]
    async fn register_rejects_bad_secret_arn() {
        let (state, _) = test_state();
        let mut request = simple_request("web");
        request.container_definitions[0].secrets = vec![kecs_model::SecretRequirement {
            name: "TOKEN".to_string(),
            value_from: "arn:aws:kms:us-east-1:1:key/abc".to_string(),
        }];
        let error = register_task_definition(state, request).await.unwrap_err();
        assert!(matches!(error, EcsError::UnsupportedSecretService { .. }));
    }

    #[tokio::test]
    async fn describe_resolves_latest_and_exact() {
        let (state, _) = test_state();
        register_task_definition(state.clone(), simple_request("web"))
            .await
            .unwrap();
        register_task_definition(state.clone(), simple_request("web"))
            .await
            .unwrap();

        let latest = describe_task_definition(
            state.clone(),
            DescribeTaskDefinitionRequest {
                task_definition: "web".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(latest.task_definition.revision, 2);

        let exact = describe_task_definition(
            state.clone(),
            DescribeTaskDefinitionRequest {
                task_definition: "web:1".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(exact.task_definition.revision, 1);

        let error = describe_task_definition(
            state,
            DescribeTaskDefinitionRequest {
                task_definition: "ghost".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(error, EcsError::TaskDefinitionNotFound));
    }

    #[tokio::test]
    async fn deregister_requires_a_revision() {
        let (state, _) = test_state();
        register_task_definition(state.clone(), simple_request("web"))
            .await
            .unwrap();

        let error = deregister_task_definition(
            state.clone(),
            DeregisterTaskDefinitionRequest {
                task_definition: "web".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(error, EcsError::InvalidParameter { .. }));

        let deregistered = deregister_task_definition(
            state.clone(),
            DeregisterTaskDefinitionRequest {
                task_definition: "web:1".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            deregistered.task_definition.status,
            TaskDefinitionStatus::Inactive
        );

        // The deregistered revision no longer resolves as latest.
        let error = describe_task_definition(
            state,
            DescribeTaskDefinitionRequest {
                task_definition: "web".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(error, EcsError::TaskDefinitionNotFound));
    }

    #[tokio::test]
    async fn families_listing() {
        let (state, _) = test_state();
        for family in ["api", "web", "worker"] {
            register_task_definition(state.clone(), simple_request(family))
                .await
                .unwrap();
        }
        let families = list_task_definition_families(
            state,
            ListTaskDefinitionFamiliesRequest {
                family_prefix: Some("w".to_string()),
                ..ListTaskDefinitionFamiliesRequest::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(families.families, vec!["web", "worker"]);
    }
}
