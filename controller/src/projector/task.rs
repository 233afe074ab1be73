use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kecs_model::{Attachment, Connectivity, Container, HealthStatus, KeyValuePair, Task, TaskStatus};
use log::trace;

/// Fold one observed Pod into the stored task. Returns `true` when anything changed, so the
/// caller can drop no-op writes. The fold never touches `desired_status`; that field belongs
/// to the API surface.
pub(crate) fn project_pod(pod: &Pod, task: &mut Task) -> bool {
    let before = serde_json::to_value(&task).unwrap_or_default();

    let status = task_status_for(pod);
    if status > task.last_status {
        task.last_status = status;
    }

    if let Some(pod_status) = &pod.status {
        if let Some(start_time) = &pod_status.start_time {
            task.record_started_at(start_time.0);
        }
        if let Some(finished) = latest_finish_time(pod_status.container_statuses.as_deref()) {
            task.record_stopped_at(finished);
        }

        task.containers = pod_status
            .container_statuses
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|container_status| project_container(container_status, task))
            .collect();
        task.health_status = Some(aggregate_health(
            pod_status.container_statuses.as_deref(),
            task.last_status,
        ));

        if let Some(pod_ip) = &pod_status.pod_ip {
            task.connectivity = Some(Connectivity::Connected);
            let uid = pod.metadata.uid.as_deref().unwrap_or_default();
            let mut details = vec![KeyValuePair::new("privateIPv4Address", pod_ip.clone())];
            if let Some(ipv6) = pod_status
                .pod_ips
                .as_deref()
                .unwrap_or_default()
                .iter()
                .filter_map(|pod_ip| pod_ip.ip.as_deref())
                .find(|ip| ip.contains(':'))
            {
                details.push(KeyValuePair::new("ipv6Address", ipv6));
            }
            let attachment = Attachment {
                id: format!("eni-attach-{}", uid),
                attachment_type: "ElasticNetworkInterface".to_string(),
                status: "ATTACHED".to_string(),
                details,
            };
            match task.attachments.first_mut() {
                Some(primary) => *primary = attachment,
                None => task.attachments.push(attachment),
            }
        }
    }

    if task.last_status == TaskStatus::Stopped && task.stopped_reason.is_none() {
        task.stopped_reason = stop_reason(pod);
    }

    let changed = serde_json::to_value(&task).unwrap_or_default() != before;
    if changed {
        trace!(
            "task '{}' projected to {}",
            task.task_arn.as_deref().unwrap_or("?"),
            task.last_status
        );
    }
    changed
}

/// The ECS task-lifecycle status implied by a pod's phase and container readiness.
fn task_status_for(pod: &Pod) -> TaskStatus {
    let deleting = pod.metadata.deletion_timestamp.is_some();
    let status = pod.status.as_ref();
    let phase = status.and_then(|s| s.phase.as_deref()).unwrap_or("");
    let container_statuses = status
        .and_then(|s| s.container_statuses.as_deref())
        .unwrap_or_default();
    let any_ready = container_statuses.iter().any(|c| c.ready);
    let all_ready = !container_statuses.is_empty() && container_statuses.iter().all(|c| c.ready);

    match phase {
        "Succeeded" | "Failed" => TaskStatus::Stopped,
        "Running" => {
            if deleting {
                TaskStatus::Deactivating
            } else if all_ready {
                TaskStatus::Running
            } else {
                TaskStatus::Activating
            }
        }
        "Pending" => {
            if deleting {
                TaskStatus::Stopping
            } else if container_statuses.is_empty() {
                TaskStatus::Provisioning
            } else if any_ready {
                TaskStatus::Activating
            } else {
                TaskStatus::Pending
            }
        }
        _ => {
            if deleting {
                TaskStatus::Stopping
            } else {
                TaskStatus::Provisioning
            }
        }
    }
}

fn project_container(container_status: &ContainerStatus, task: &Task) -> Container {
    let (last_status, exit_code, reason) = match &container_status.state {
        Some(state) => {
            if let Some(terminated) = &state.terminated {
                (
                    "STOPPED".to_string(),
                    Some(terminated.exit_code),
                    terminated.reason.clone(),
                )
            } else if state.running.is_some() {
                ("RUNNING".to_string(), None, None)
            } else if let Some(waiting) = &state.waiting {
                ("PENDING".to_string(), None, waiting.reason.clone())
            } else {
                ("PENDING".to_string(), None, None)
            }
        }
        None => ("PENDING".to_string(), None, None),
    };

    Container {
        name: container_status.name.clone(),
        task_arn: task.task_arn.clone(),
        image: Some(container_status.image.clone()),
        runtime_id: container_status.container_id.clone(),
        last_status,
        exit_code,
        reason,
        health_status: Some(if container_status.ready {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unknown
        }),
        ..Container::default()
    }
}

fn latest_finish_time(container_statuses: Option<&[ContainerStatus]>) -> Option<DateTime<Utc>> {
    container_statuses?
        .iter()
        .filter_map(|status| {
            status
                .state
                .as_ref()
                .and_then(|state| state.terminated.as_ref())
                .and_then(|terminated| terminated.finished_at.as_ref())
                .map(|time| time.0)
        })
        .max()
}

fn aggregate_health(
    container_statuses: Option<&[ContainerStatus]>,
    task_status: TaskStatus,
) -> HealthStatus {
    let container_statuses = match container_statuses {
        Some(statuses) if !statuses.is_empty() => statuses,
        _ => return HealthStatus::Unknown,
    };
    if container_statuses.iter().all(|status| status.ready) {
        HealthStatus::Healthy
    } else if task_status == TaskStatus::Running {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Unknown
    }
}

fn stop_reason(pod: &Pod) -> Option<String> {
    pod.status.as_ref().and_then(|status| {
        status
            .container_statuses
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(|container_status| {
                container_status
                    .state
                    .as_ref()
                    .and_then(|state| state.terminated.as_ref())
                    .and_then(|terminated| terminated.reason.clone())
            })
            .next()
            .or_else(|| status.reason.clone())
    })
}
