use k8s_openapi::api::apps::v1::Deployment;
use kecs_model::{Service, ServiceStatus, StabilityStatus};
use log::trace;

/// Fold an observed Deployment into the stored service. Returns `true` when anything changed.
/// The fold never touches `desired_count`; that field belongs to the API surface.
pub(crate) fn project_deployment(deployment: &Deployment, service: &mut Service) -> bool {
    let before = serde_json::to_value(&service).unwrap_or_default();

    let status = deployment.status.as_ref();
    let replicas = status.and_then(|s| s.replicas).unwrap_or(0);
    let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);

    service.running_count = ready;
    service.pending_count = (replicas - ready).max(0);
    if let Some(primary) = service.primary_deployment_mut() {
        primary.running_count = ready;
        primary.pending_count = (replicas - ready).max(0);
    }

    let replica_failure = status
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default()
        .iter()
        .any(|condition| condition.type_ == "ReplicaFailure" && condition.status == "True");

    let rollout_complete = {
        let updated = status.and_then(|s| s.updated_replicas).unwrap_or(0);
        replicas == service.desired_count && updated == replicas && ready == replicas
    };

    service.status = if replica_failure {
        ServiceStatus::Failed
    } else if service.status == ServiceStatus::Draining {
        if replicas == 0 {
            ServiceStatus::Inactive
        } else {
            ServiceStatus::Draining
        }
    } else if service.desired_count == 0 && replicas > 0 {
        ServiceStatus::Draining
    } else if ready > 0 || rollout_complete {
        ServiceStatus::Active
    } else {
        ServiceStatus::Pending
    };

    let changed = serde_json::to_value(&service).unwrap_or_default() != before;
    if changed {
        trace!(
            "service '{}' projected to {} ({} running / {} pending)",
            service.service_name,
            service.status,
            service.running_count,
            service.pending_count
        );
    }
    changed
}

/// Fold an observed task-set Deployment into its record under the owning service.
pub(crate) fn project_task_set_deployment(
    deployment: &Deployment,
    task_set_id: &str,
    service: &mut Service,
) -> bool {
    let status = deployment.status.as_ref();
    let replicas = status.and_then(|s| s.replicas).unwrap_or(0);
    let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);

    let task_set = match service
        .task_sets
        .iter_mut()
        .find(|task_set| task_set.id == task_set_id)
    {
        Some(task_set) => task_set,
        None => return false,
    };

    let before = (
        task_set.running_count,
        task_set.pending_count,
        task_set.stability_status,
    );
    task_set.running_count = ready;
    task_set.pending_count = (replicas - ready).max(0);
    task_set.stability_status = if ready == task_set.computed_desired_count && replicas == ready {
        StabilityStatus::SteadyState
    } else {
        StabilityStatus::Stabilizing
    };
    before
        != (
            task_set.running_count,
            task_set.pending_count,
            task_set.stability_status,
        )
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentStatus};
    use kecs_model::{ServiceDeployment, TaskSet};

    fn deployment_with(replicas: i32, ready: i32, updated: i32) -> Deployment {
        Deployment {
            status: Some(DeploymentStatus {
                replicas: Some(replicas),
                ready_replicas: Some(ready),
                updated_replicas: Some(updated),
                ..DeploymentStatus::default()
            }),
            ..Deployment::default()
        }
    }

    fn pending_service(desired: i32) -> Service {
        Service {
            service_name: "s1".to_string(),
            desired_count: desired,
            status: ServiceStatus::Pending,
            deployments: vec![ServiceDeployment {
                id: "ecs-svc/1".to_string(),
                status: "PRIMARY".to_string(),
                desired_count: desired,
                ..ServiceDeployment::default()
            }],
            ..Service::default()
        }
    }

    #[test]
    fn counts_from_deployment_status() {
        let mut service = pending_service(3);
        project_deployment(&deployment_with(3, 1, 3), &mut service);
        assert_eq!(service.running_count, 1);
        assert_eq!(service.pending_count, 2);
        assert_eq!(service.status, ServiceStatus::Active);
        assert_eq!(service.deployments[0].running_count, 1);
    }

    #[test]
    fn pending_until_first_ready_replica() {
        let mut service = pending_service(2);
        project_deployment(&deployment_with(2, 0, 1), &mut service);
        assert_eq!(service.status, ServiceStatus::Pending);

        project_deployment(&deployment_with(2, 2, 2), &mut service);
        assert_eq!(service.status, ServiceStatus::Active);
    }

    #[test]
    fn draining_when_desired_zero_with_pods_left() {
        let mut service = pending_service(0);
        service.status = ServiceStatus::Active;
        project_deployment(&deployment_with(2, 2, 2), &mut service);
        assert_eq!(service.status, ServiceStatus::Draining);

        project_deployment(&deployment_with(0, 0, 0), &mut service);
        assert_eq!(service.status, ServiceStatus::Inactive);
    }

    #[test]
    fn replica_failure_marks_failed() {
        let mut service = pending_service(1);
        let mut deployment = deployment_with(1, 0, 1);
        deployment
            .status
            .as_mut()
            .unwrap()
            .conditions = Some(vec![DeploymentCondition {
            type_: "ReplicaFailure".to_string(),
            status: "True".to_string(),
            ..DeploymentCondition::default()
        }]);
        project_deployment(&deployment, &mut service);
        assert_eq!(service.status, ServiceStatus::Failed);
    }

    #[test]
    fn noop_projection_reports_unchanged() {
        let mut service = pending_service(1);
        let deployment = deployment_with(1, 1, 1);
        assert!(project_deployment(&deployment, &mut service));
        assert!(!project_deployment(&deployment, &mut service));
    }

    #[test]
    fn task_set_counts() {
        let mut service = pending_service(4);
        service.task_sets = vec![TaskSet {
            id: "ts1".to_string(),
            computed_desired_count: 2,
            ..TaskSet::default()
        }];
        assert!(project_task_set_deployment(
            &deployment_with(2, 2, 2),
            "ts1",
            &mut service
        ));
        assert_eq!(service.task_sets[0].running_count, 2);
        assert_eq!(
            service.task_sets[0].stability_status,
            StabilityStatus::SteadyState
        );
        assert!(!project_task_set_deployment(
            &deployment_with(2, 2, 2),
            "ts1",
            &mut service
        ));
    }
}
