use super::{page_from, resolve_cluster, validate_name};
use crate::error::{EcsError, Result};
use crate::state::AppState;
use chrono::Utc;
use kecs_model::storage::{ServiceFilter, TaskFilter};
use kecs_model::{Arn, Cluster, ClusterStatus, Failure, ServiceStatus, Tag, TaskStatus};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct CreateClusterRequest {
    pub cluster_name: Option<String>,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ClusterResponse {
    pub cluster: Cluster,
}

pub(crate) async fn create_cluster(
    state: Arc<AppState>,
    request: CreateClusterRequest,
) -> Result<ClusterResponse> {
    let name = request.cluster_name.as_deref().unwrap_or("default");
    validate_name("cluster", name)?;

    // CreateCluster is idempotent: an existing cluster is simply returned.
    if let Some(existing) = state.clusters.get(name).await? {
        return Ok(ClusterResponse { cluster: existing });
    }

    let cluster = Cluster {
        cluster_arn: Some(Arn::ecs_cluster(
            &state.config.region,
            &state.config.account_id,
            name,
        )),
        cluster_name: name.to_owned(),
        status: ClusterStatus::Active,
        region: state.config.region.clone(),
        account_id: state.config.account_id.clone(),
        tags: request.tags,
        created_at: Some(Utc::now()),
        ..Cluster::default()
    };

    // Intent goes to storage before anything touches Kubernetes.
    let mut cluster = state.clusters.create(cluster).await?;
    if let Err(apply_error) = state.orchestrator.ensure_namespace(&cluster.namespace()).await {
        warn!(
            "namespace creation for cluster '{}' failed: {}",
            name, apply_error
        );
        cluster.status = ClusterStatus::Failed;
        if let Err(update_error) = state.clusters.update(cluster).await {
            warn!("unable to mark cluster '{}' FAILED: {}", name, update_error);
        }
        return Err(apply_error.into());
    }

    info!("created cluster '{}'", name);
    Ok(ClusterResponse { cluster })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct DescribeClustersRequest {
    pub clusters: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DescribeClustersResponse {
    pub clusters: Vec<Cluster>,
    pub failures: Vec<Failure>,
}

pub(crate) async fn describe_clusters(
    state: Arc<AppState>,
    request: DescribeClustersRequest,
) -> Result<DescribeClustersResponse> {
    let references = if request.clusters.is_empty() {
        vec!["default".to_owned()]
    } else {
        request.clusters
    };

    let mut clusters = Vec::new();
    let mut failures = Vec::new();
    for reference in references {
        let name = reference.rsplit('/').next().unwrap_or(&reference);
        match state.clusters.get(name).await? {
            Some(cluster) => clusters.push(cluster),
            None => failures.push(Failure::new(
                Arn::ecs_cluster(&state.config.region, &state.config.account_id, name),
                "MISSING",
            )),
        }
    }
    Ok(DescribeClustersResponse { clusters, failures })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct ListClustersRequest {
    pub next_token: Option<String>,
    pub max_results: Option<i32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ListClustersResponse {
    pub cluster_arns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

pub(crate) async fn list_clusters(
    state: Arc<AppState>,
    request: ListClustersRequest,
) -> Result<ListClustersResponse> {
    let page = state
        .clusters
        .list(&page_from(request.next_token, request.max_results))
        .await?;
    Ok(ListClustersResponse {
        cluster_arns: page
            .items
            .into_iter()
            .filter_map(|cluster| cluster.cluster_arn)
            .collect(),
        next_token: page.next_token,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct DeleteClusterRequest {
    pub cluster: Option<String>,
}

pub(crate) async fn delete_cluster(
    state: Arc<AppState>,
    request: DeleteClusterRequest,
) -> Result<ClusterResponse> {
    let mut cluster = resolve_cluster(&state, request.cluster.as_deref()).await?;
    let cluster_arn = cluster.cluster_arn.clone().unwrap_or_default();

    let services = state
        .services
        .list(
            &ServiceFilter {
                cluster_arn: Some(cluster_arn.clone()),
                ..ServiceFilter::default()
            },
            &Default::default(),
        )
        .await?;
    if services
        .items
        .iter()
        .any(|service| service.status != ServiceStatus::Inactive)
    {
        return Err(EcsError::ResourceInUse {
            message: format!(
                "The cluster '{}' contains services and cannot be deleted.",
                cluster.cluster_name
            ),
        });
    }

    let tasks = state
        .tasks
        .list(
            &TaskFilter {
                cluster_arn: Some(cluster_arn),
                ..TaskFilter::default()
            },
            &Default::default(),
        )
        .await?;
    if tasks
        .items
        .iter()
        .any(|task| task.last_status != TaskStatus::Stopped)
    {
        return Err(EcsError::ResourceInUse {
            message: format!(
                "The cluster '{}' contains tasks and cannot be deleted.",
                cluster.cluster_name
            ),
        });
    }

    state.clusters.delete(&cluster.cluster_name).await?;
    info!("deleted cluster '{}'", cluster.cluster_name);
    cluster.status = ClusterStatus::Inactive;
    Ok(ClusterResponse { cluster })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ops::testing::test_state;

    #[tokio::test]
    async fn create_is_idempotent_and_makes_the_namespace() {
        let (state, orchestrator) = test_state();
        let first = create_cluster(
            state.clone(),
            CreateClusterRequest {
                cluster_name: Some("c1".to_string()),
                ..CreateClusterRequest::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(
            first.cluster.cluster_arn.as_deref(),
            Some("arn:aws:ecs:us-east-1:000000000000:cluster/c1")
        );

        let second = create_cluster(
            state,
            CreateClusterRequest {
                cluster_name: Some("c1".to_string()),
                ..CreateClusterRequest::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(second.cluster.cluster_name, "c1");
        assert_eq!(
            orchestrator.recorded.lock().unwrap().namespaces,
            vec!["c1-us-east-1"]
        );
    }

    #[tokio::test]
    async fn describe_reports_missing_clusters_as_failures() {
        let (state, _) = test_state();
        create_cluster(
            state.clone(),
            CreateClusterRequest {
                cluster_name: Some("c1".to_string()),
                ..CreateClusterRequest::default()
            },
        )
        .await
        .unwrap();

        let described = describe_clusters(
            state,
            DescribeClustersRequest {
                clusters: vec!["c1".to_string(), "ghost".to_string()],
            },
        )
        .await
        .unwrap();
        assert_eq!(described.clusters.len(), 1);
        assert_eq!(described.failures.len(), 1);
        assert_eq!(described.failures[0].reason.as_deref(), Some("MISSING"));
    }

    #[tokio::test]
    async fn delete_refuses_while_services_remain() {
        let (state, _) = test_state();
        create_cluster(
            state.clone(),
            CreateClusterRequest {
                cluster_name: Some("c1".to_string()),
                ..CreateClusterRequest::default()
            },
        )
        .await
        .unwrap();
        state
            .services
            .create(kecs_model::Service {
                service_name: "web".to_string(),
                cluster_arn: Some("arn:aws:ecs:us-east-1:000000000000:cluster/c1".to_string()),
                status: ServiceStatus::Active,
                ..kecs_model::Service::default()
            })
            .await
            .unwrap();

        let error = delete_cluster(
            state,
            DeleteClusterRequest {
                cluster: Some("c1".to_string()),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(error, EcsError::ResourceInUse { .. }));
    }

    #[tokio::test]
    async fn missing_cluster_is_not_found() {
        let (state, _) = test_state();
        let error = delete_cluster(
            state,
            DeleteClusterRequest {
                cluster: Some("ghost".to_string()),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(error, EcsError::ClusterNotFound));
    }
}
