use crate::apply::ManifestApplier;
use crate::error::{self, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kecs_model::constants::{
    ANNOTATION_TASK_ARN, LABEL_CLUSTER, LABEL_SERVICE, LABEL_TASKSET, MANAGED_BY_SELECTOR,
};
use kecs_model::storage::{ServiceStore, TaskStore};
use kecs_model::Arn;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use log::{info, warn};
use snafu::ResultExt;
use std::sync::Arc;

/// Startup garbage collection: delete Kubernetes objects we own whose ECS resource no longer
/// exists in storage. The API surface records intent to storage before applying, so anything
/// labeled ours but unknown to storage is an orphan from a crashed write path.
pub async fn sweep_orphans(
    client: Client,
    services: Arc<dyn ServiceStore>,
    tasks: Arc<dyn TaskStore>,
    region: &str,
    account_id: &str,
) -> Result<()> {
    let applier = ManifestApplier::new(client.clone());
    let params = ListParams::default().labels(MANAGED_BY_SELECTOR);

    let pod_api: Api<Pod> = Api::all(client.clone());
    let pods = pod_api
        .list(&params)
        .await
        .context(error::KubeApiCallSnafu {
            method: "list",
            what: "pods",
        })?;
    for pod in pods {
        let task_arn = match pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(ANNOTATION_TASK_ARN))
        {
            Some(task_arn) => task_arn.clone(),
            None => continue,
        };
        let cluster_arn = match cluster_arn_of(&task_arn) {
            Some(cluster_arn) => cluster_arn,
            None => continue,
        };
        match tasks.get(&cluster_arn, &task_arn).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                info!(
                    "sweeping orphaned pod '{}' (task '{}' is gone)",
                    pod.name_any(),
                    task_arn
                );
                if let Err(sweep_error) = applier
                    .delete_pod(&pod.namespace().unwrap_or_default(), &pod.name_any())
                    .await
                {
                    warn!("unable to sweep pod '{}': {}", pod.name_any(), sweep_error);
                }
            }
            Err(storage_error) => {
                warn!("skipping sweep of pod '{}': {}", pod.name_any(), storage_error);
            }
        }
    }

    let deployment_api: Api<Deployment> = Api::all(client);
    let deployments = deployment_api
        .list(&params)
        .await
        .context(error::KubeApiCallSnafu {
            method: "list",
            what: "deployments",
        })?;
    for deployment in deployments {
        let labels = match &deployment.metadata.labels {
            Some(labels) => labels,
            None => continue,
        };
        let (cluster, service_name) = match (labels.get(LABEL_CLUSTER), labels.get(LABEL_SERVICE))
        {
            (Some(cluster), Some(service_name)) => (cluster, service_name),
            _ => continue,
        };
        let cluster_arn = Arn::ecs_cluster(region, account_id, cluster);
        let orphaned = match services.get(&cluster_arn, service_name).await {
            Ok(None) => true,
            Ok(Some(service)) => match labels.get(LABEL_TASKSET) {
                Some(task_set_id) => !service
                    .task_sets
                    .iter()
                    .any(|task_set| &task_set.id == task_set_id),
                None => false,
            },
            Err(storage_error) => {
                warn!(
                    "skipping sweep of deployment '{}': {}",
                    deployment.name_any(),
                    storage_error
                );
                false
            }
        };
        if orphaned {
            info!(
                "sweeping orphaned deployment '{}' (service '{}')",
                deployment.name_any(),
                service_name
            );
            if let Err(sweep_error) = applier
                .delete_deployment(
                    &deployment.namespace().unwrap_or_default(),
                    &deployment.name_any(),
                )
                .await
            {
                warn!(
                    "unable to sweep deployment '{}': {}",
                    deployment.name_any(),
                    sweep_error
                );
            }
        }
    }

    Ok(())
}

fn cluster_arn_of(task_arn: &str) -> Option<String> {
    let parsed = Arn::parse(task_arn).ok()?;
    let cluster = parsed.resource_path.split('/').next()?;
    Some(Arn::ecs_cluster(
        &parsed.region,
        &parsed.account_id,
        cluster,
    ))
}
