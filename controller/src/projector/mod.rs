/*!

The state projector: long-lived watch loops that observe the Pods, Deployments and Events this
control plane owns (label selector `kecs.dev/managed-by=kecs`) and fold what they see back into
the stored ECS resources.

Projector writes are serialized per resource key through the shared [`LockMap`], use a
read-modify-write with the storage version token, and never overwrite the user-owned fields
(`desired_status`, `desired_count`). Bursts are coalesced with a 500ms per-resource debounce;
the projector never fails the call path, it logs and keeps watching.

!*/

mod events;
mod service;
mod task;

use crate::projector::events::{push_service_event, service_event_from, EventDeduper};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Event, Pod};
use kecs_model::constants::{
    ANNOTATION_TASK_ARN, LABEL_CLUSTER, LABEL_SERVICE, LABEL_TASKSET, MANAGED_BY_SELECTOR,
};
use kecs_model::storage::{ServiceStore, TaskStore};
use kecs_model::{Arn, LockMap, Service, Task, TaskStatus};
use kube::runtime::watcher;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, ResourceExt};
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The per-resource debounce window; at most one storage write per resource per tick.
const COALESCE_INTERVAL: Duration = Duration::from_millis(500);
/// Identical `(object, reason, message)` events within this window are dropped.
const EVENT_DEDUP_WINDOW: Duration = Duration::from_secs(1);
/// Backoff after a watch stream error before the stream is polled again.
const WATCH_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// What the event loop needs to know about a deployment it is tracking.
#[derive(Clone, Debug)]
struct TrackedDeployment {
    cluster_arn: String,
    service_name: String,
    task_set_id: Option<String>,
}

pub struct Projector {
    client: Client,
    services: Arc<dyn ServiceStore>,
    tasks: Arc<dyn TaskStore>,
    locks: Arc<LockMap>,
    region: String,
    account_id: String,
    shutdown: CancellationToken,
    /// (namespace, pod name) -> task ARN, for correlating events with tasks.
    tracked_pods: Mutex<HashMap<(String, String), String>>,
    /// (namespace, deployment name) -> owning service, for correlating events.
    tracked_deployments: Mutex<HashMap<(String, String), TrackedDeployment>>,
}

impl Projector {
    pub fn new(
        client: Client,
        services: Arc<dyn ServiceStore>,
        tasks: Arc<dyn TaskStore>,
        locks: Arc<LockMap>,
        region: impl Into<String>,
        account_id: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client,
            services,
            tasks,
            locks,
            region: region.into(),
            account_id: account_id.into(),
            shutdown,
            tracked_pods: Mutex::new(HashMap::new()),
            tracked_deployments: Mutex::new(HashMap::new()),
        }
    }

    /// Run all watch loops until the shutdown token fires.
    pub async fn run(&self) {
        futures::join!(self.watch_pods(), self.watch_deployments(), self.watch_events());
        debug!("projector stopped");
    }

    async fn watch_pods(&self) {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = WatcherConfig::default().labels(MANAGED_BY_SELECTOR);
        let mut stream = watcher(api, params).boxed();
        let mut pending: HashMap<String, Pod> = HashMap::new();
        let mut tick = tokio::time::interval(COALESCE_INTERVAL);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => {
                    for (_, pod) in pending.drain() {
                        self.project_pod_update(&pod).await;
                    }
                }
                event = stream.next() => match event {
                    Some(Ok(watcher::Event::Applied(pod))) => {
                        self.track_pod(&pod);
                        pending.insert(pod_key(&pod), pod);
                    }
                    Some(Ok(watcher::Event::Restarted(pods))) => {
                        for pod in pods {
                            self.track_pod(&pod);
                            pending.insert(pod_key(&pod), pod);
                        }
                    }
                    Some(Ok(watcher::Event::Deleted(pod))) => {
                        pending.remove(&pod_key(&pod));
                        self.untrack_pod(&pod);
                        self.finalize_deleted_pod(&pod).await;
                    }
                    Some(Err(error)) => {
                        warn!("pod watch error: {}", error);
                        tokio::time::sleep(WATCH_ERROR_BACKOFF).await;
                    }
                    None => break,
                },
            }
        }
    }

    async fn watch_deployments(&self) {
        let api: Api<Deployment> = Api::all(self.client.clone());
        let params = WatcherConfig::default().labels(MANAGED_BY_SELECTOR);
        let mut stream = watcher(api, params).boxed();
        let mut pending: HashMap<String, Deployment> = HashMap::new();
        let mut tick = tokio::time::interval(COALESCE_INTERVAL);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => {
                    for (_, deployment) in pending.drain() {
                        self.project_deployment_update(&deployment).await;
                    }
                }
                event = stream.next() => match event {
                    Some(Ok(watcher::Event::Applied(deployment))) => {
                        self.track_deployment(&deployment);
                        pending.insert(deployment_key(&deployment), deployment);
                    }
                    Some(Ok(watcher::Event::Restarted(deployments))) => {
                        for deployment in deployments {
                            self.track_deployment(&deployment);
                            pending.insert(deployment_key(&deployment), deployment);
                        }
                    }
                    Some(Ok(watcher::Event::Deleted(deployment))) => {
                        pending.remove(&deployment_key(&deployment));
                        self.untrack_deployment(&deployment);
                    }
                    Some(Err(error)) => {
                        warn!("deployment watch error: {}", error);
                        tokio::time::sleep(WATCH_ERROR_BACKOFF).await;
                    }
                    None => break,
                },
            }
        }
    }

    async fn watch_events(&self) {
        let api: Api<Event> = Api::all(self.client.clone());
        let mut stream = watcher(api, WatcherConfig::default()).boxed();
        let mut deduper = EventDeduper::new(EVENT_DEDUP_WINDOW);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = stream.next() => match event {
                    Some(Ok(watcher::Event::Applied(event))) => {
                        self.handle_event(&event, &mut deduper).await;
                    }
                    Some(Ok(watcher::Event::Restarted(_))) => {
                        // Historic events are not replayed into service history.
                    }
                    Some(Ok(watcher::Event::Deleted(_))) => {}
                    Some(Err(error)) => {
                        warn!("event watch error: {}", error);
                        tokio::time::sleep(WATCH_ERROR_BACKOFF).await;
                    }
                    None => break,
                },
            }
        }
    }

    fn track_pod(&self, pod: &Pod) {
        if let Some(task_arn) = pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(ANNOTATION_TASK_ARN))
        {
            if let Ok(mut tracked) = self.tracked_pods.lock() {
                tracked.insert(
                    (pod.namespace().unwrap_or_default(), pod.name_any()),
                    task_arn.clone(),
                );
            }
        }
    }

    fn untrack_pod(&self, pod: &Pod) {
        if let Ok(mut tracked) = self.tracked_pods.lock() {
            tracked.remove(&(pod.namespace().unwrap_or_default(), pod.name_any()));
        }
    }

    fn track_deployment(&self, deployment: &Deployment) {
        let labels = match &deployment.metadata.labels {
            Some(labels) => labels,
            None => return,
        };
        let (cluster, service_name) = match (labels.get(LABEL_CLUSTER), labels.get(LABEL_SERVICE))
        {
            (Some(cluster), Some(service)) => (cluster, service),
            _ => return,
        };
        if let Ok(mut tracked) = self.tracked_deployments.lock() {
            tracked.insert(
                (
                    deployment.namespace().unwrap_or_default(),
                    deployment.name_any(),
                ),
                TrackedDeployment {
                    cluster_arn: Arn::ecs_cluster(&self.region, &self.account_id, cluster),
                    service_name: service_name.clone(),
                    task_set_id: labels.get(LABEL_TASKSET).cloned(),
                },
            );
        }
    }

    fn untrack_deployment(&self, deployment: &Deployment) {
        if let Ok(mut tracked) = self.tracked_deployments.lock() {
            tracked.remove(&(
                deployment.namespace().unwrap_or_default(),
                deployment.name_any(),
            ));
        }
    }

    async fn project_pod_update(&self, pod: &Pod) {
        let task_arn = match pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(ANNOTATION_TASK_ARN))
        {
            Some(task_arn) => task_arn.clone(),
            // Deployment-managed pods have no task record of their own.
            None => return,
        };
        let cluster_arn = match cluster_arn_of_task(&task_arn) {
            Some(cluster_arn) => cluster_arn,
            None => {
                warn!("pod '{}' carries unparseable task ARN '{}'", pod.name_any(), task_arn);
                return;
            }
        };
        self.update_task(&cluster_arn, &task_arn, |task| task::project_pod(pod, task))
            .await;
    }

    async fn finalize_deleted_pod(&self, pod: &Pod) {
        let task_arn = match pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(ANNOTATION_TASK_ARN))
        {
            Some(task_arn) => task_arn.clone(),
            None => return,
        };
        let cluster_arn = match cluster_arn_of_task(&task_arn) {
            Some(cluster_arn) => cluster_arn,
            None => return,
        };
        self.update_task(&cluster_arn, &task_arn, |task| {
            let mut changed = task::project_pod(pod, task);
            if task.last_status != TaskStatus::Stopped {
                task.last_status = TaskStatus::Stopped;
                changed = true;
            }
            if task.stopped_at.is_none() {
                task.record_stopped_at(chrono::Utc::now());
                changed = true;
            }
            changed
        })
        .await;
    }

    async fn project_deployment_update(&self, deployment: &Deployment) {
        let tracked = {
            let key = (
                deployment.namespace().unwrap_or_default(),
                deployment.name_any(),
            );
            match self.tracked_deployments.lock() {
                Ok(tracked) => tracked.get(&key).cloned(),
                Err(_) => None,
            }
        };
        let tracked = match tracked {
            Some(tracked) => tracked,
            None => return,
        };
        self.update_service(&tracked, |service| match &tracked.task_set_id {
            Some(task_set_id) => {
                service::project_task_set_deployment(deployment, task_set_id, service)
            }
            None => service::project_deployment(deployment, service),
        })
        .await;
    }

    async fn handle_event(&self, event: &Event, deduper: &mut EventDeduper) {
        let involved_kind = event.involved_object.kind.as_deref().unwrap_or_default();
        let involved_name = event.involved_object.name.clone().unwrap_or_default();
        let involved_namespace = event
            .involved_object
            .namespace
            .clone()
            .unwrap_or_default();
        let reason = event.reason.as_deref().unwrap_or_default();
        let message = event.message.as_deref().unwrap_or_default();

        if !deduper.accept(
            &format!("{}/{}/{}", involved_namespace, involved_kind, involved_name),
            reason,
            message,
        ) {
            return;
        }

        match involved_kind {
            "Pod" => {
                let task_arn = match self.tracked_pods.lock() {
                    Ok(tracked) => tracked
                        .get(&(involved_namespace, involved_name))
                        .cloned(),
                    Err(_) => None,
                };
                let task_arn = match task_arn {
                    Some(task_arn) => task_arn,
                    None => return,
                };
                let timestamp = event
                    .last_timestamp
                    .as_ref()
                    .or(event.first_timestamp.as_ref())
                    .map(|time| time.0)
                    .unwrap_or_else(chrono::Utc::now);
                let cluster_arn = match cluster_arn_of_task(&task_arn) {
                    Some(cluster_arn) => cluster_arn,
                    None => return,
                };
                match reason {
                    "Pulling" => {
                        self.update_task(&cluster_arn, &task_arn, |task| {
                            let had = task.pull_started_at.is_some();
                            task.record_pull_started_at(timestamp);
                            !had
                        })
                        .await;
                    }
                    "Pulled" => {
                        self.update_task(&cluster_arn, &task_arn, |task| {
                            // The last pull wins; multi-container tasks pull repeatedly.
                            let changed = task.pull_stopped_at.map(|at| at < timestamp).unwrap_or(true);
                            if changed {
                                task.pull_stopped_at = Some(timestamp);
                            }
                            changed
                        })
                        .await;
                    }
                    _ => {}
                }
            }
            "Deployment" => {
                let tracked = match self.tracked_deployments.lock() {
                    Ok(tracked) => tracked
                        .get(&(involved_namespace, involved_name))
                        .cloned(),
                    Err(_) => None,
                };
                let tracked = match tracked {
                    Some(tracked) => tracked,
                    None => return,
                };
                let service_event = service_event_from(&tracked.service_name, event);
                self.update_service(&tracked, |service| {
                    push_service_event(&mut service.events, service_event.clone());
                    true
                })
                .await;
            }
            _ => {}
        }
    }

    /// Read-modify-write of a task under its lock. `mutate` returns whether anything changed;
    /// no-op diffs are dropped. A single retry covers a version conflict with the API surface.
    async fn update_task<F>(&self, cluster_arn: &str, task_arn: &str, mutate: F)
    where
        F: Fn(&mut Task) -> bool,
    {
        let _guard = self.locks.lock(task_arn).await;
        for attempt in 0..2 {
            let task = match self.tasks.get(cluster_arn, task_arn).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    trace!("no stored task for '{}'", task_arn);
                    return;
                }
                Err(error) => {
                    warn!("unable to read task '{}': {}", task_arn, error);
                    return;
                }
            };
            let mut updated = task;
            if !mutate(&mut updated) {
                return;
            }
            match self.tasks.update(updated).await {
                Ok(_) => return,
                Err(error) if error.is_version_conflict() && attempt == 0 => continue,
                Err(error) => {
                    warn!("unable to update task '{}': {}", task_arn, error);
                    return;
                }
            }
        }
    }

    /// Read-modify-write of a service under its lock, with one version-conflict retry.
    async fn update_service<F>(&self, tracked: &TrackedDeployment, mutate: F)
    where
        F: Fn(&mut Service) -> bool,
    {
        let lock_key = format!("{}|{}", tracked.cluster_arn, tracked.service_name);
        let _guard = self.locks.lock(&lock_key).await;
        for attempt in 0..2 {
            let service = match self
                .services
                .get(&tracked.cluster_arn, &tracked.service_name)
                .await
            {
                Ok(Some(service)) => service,
                Ok(None) => {
                    trace!("no stored service for '{}'", tracked.service_name);
                    return;
                }
                Err(error) => {
                    warn!(
                        "unable to read service '{}': {}",
                        tracked.service_name, error
                    );
                    return;
                }
            };
            let mut updated = service;
            if !mutate(&mut updated) {
                return;
            }
            match self.services.update(updated).await {
                Ok(_) => return,
                Err(error) if error.is_version_conflict() && attempt == 0 => continue,
                Err(error) => {
                    warn!(
                        "unable to update service '{}': {}",
                        tracked.service_name, error
                    );
                    return;
                }
            }
        }
    }
}

fn pod_key(pod: &Pod) -> String {
    format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any())
}

fn deployment_key(deployment: &Deployment) -> String {
    format!(
        "{}/{}",
        deployment.namespace().unwrap_or_default(),
        deployment.name_any()
    )
}

/// Derive the owning cluster's ARN from a task ARN of the form
/// `arn:aws:ecs:REGION:ACCT:task/CLUSTER/ID`.
fn cluster_arn_of_task(task_arn: &str) -> Option<String> {
    let parsed = Arn::parse(task_arn).ok()?;
    let cluster = parsed.resource_path.split('/').next()?;
    if cluster.is_empty() {
        return None;
    }
    Some(Arn::ecs_cluster(
        &parsed.region,
        &parsed.account_id,
        cluster,
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cluster_arn_derivation() {
        assert_eq!(
            cluster_arn_of_task("arn:aws:ecs:us-east-1:000000000000:task/c1/abc123").as_deref(),
            Some("arn:aws:ecs:us-east-1:000000000000:cluster/c1")
        );
        assert_eq!(cluster_arn_of_task("nonsense"), None);
    }
}
