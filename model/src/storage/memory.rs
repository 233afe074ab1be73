use super::error::{self, Result};
use super::{
    encode_token, ClusterStore, Page, PageOf, ServiceFilter, ServiceStore, TaskDefinitionFilter,
    TaskDefinitionStore, TaskFilter, TaskStore,
};
use crate::arn::Arn;
use crate::{Cluster, Service, Task, TaskDefinition, TaskDefinitionStatus};
use async_trait::async_trait;
use chrono::Utc;
use snafu::OptionExt;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// The in-memory reference implementation of the storage contract. Backs tests and single-node
/// runs. Every map is ordered by its pagination key so that opaque page tokens are stable
/// across interleaved writes.
#[derive(Debug)]
pub struct MemoryStore {
    region: String,
    account_id: String,
    clusters: RwLock<BTreeMap<String, Cluster>>,
    /// family -> revision -> definition
    task_definitions: RwLock<BTreeMap<String, BTreeMap<i64, TaskDefinition>>>,
    /// (cluster arn, service name) -> service
    services: RwLock<BTreeMap<(String, String), Service>>,
    /// task arn -> task
    tasks: RwLock<BTreeMap<String, Task>>,
}

impl MemoryStore {
    pub fn new<S1, S2>(region: S1, account_id: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            region: region.into(),
            account_id: account_id.into(),
            clusters: RwLock::new(BTreeMap::new()),
            task_definitions: RwLock::new(BTreeMap::new()),
            services: RwLock::new(BTreeMap::new()),
            tasks: RwLock::new(BTreeMap::new()),
        }
    }
}

/// Slice a key-sorted result set into one page. `items` must be sorted by key ascending.
fn paginate<T>(items: Vec<(String, T)>, page: &Page) -> Result<PageOf<T>> {
    let after = page.after()?;
    let mut remaining: Vec<(String, T)> = items
        .into_iter()
        .filter(|(key, _)| match &after {
            Some(bound) => key.as_str() > bound.as_str(),
            None => true,
        })
        .collect();
    let mut next_token = None;
    if let Some(limit) = page.limit {
        if limit > 0 && remaining.len() > limit {
            next_token = Some(encode_token(&remaining[limit - 1].0));
            remaining.truncate(limit);
        }
    }
    Ok(PageOf {
        items: remaining.into_iter().map(|(_, item)| item).collect(),
        next_token,
    })
}

/// Pagination key for a task-definition revision; revisions are zero-padded so the string
/// order matches the numeric order.
fn revision_key(family: &str, revision: i64) -> String {
    format!("{}:{:010}", family, revision)
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn create(&self, cluster: Cluster) -> Result<Cluster> {
        let mut clusters = self.clusters.write().await;
        if clusters.contains_key(&cluster.cluster_name) {
            return error::AlreadyExistsSnafu {
                kind: "cluster",
                name: cluster.cluster_name,
            }
            .fail();
        }
        let mut cluster = cluster;
        cluster.version = 1;
        clusters.insert(cluster.cluster_name.clone(), cluster.clone());
        Ok(cluster)
    }

    async fn get(&self, name: &str) -> Result<Option<Cluster>> {
        Ok(self.clusters.read().await.get(name).cloned())
    }

    async fn get_by_arn(&self, arn: &str) -> Result<Option<Cluster>> {
        Ok(self
            .clusters
            .read()
            .await
            .values()
            .find(|c| c.cluster_arn.as_deref() == Some(arn))
            .cloned())
    }

    async fn update(&self, cluster: Cluster) -> Result<Cluster> {
        let mut clusters = self.clusters.write().await;
        let stored = clusters
            .get_mut(&cluster.cluster_name)
            .context(error::NotFoundSnafu {
                kind: "cluster",
                name: &cluster.cluster_name,
            })?;
        if stored.version != cluster.version {
            return error::VersionConflictSnafu {
                kind: "cluster",
                name: cluster.cluster_name,
                expected: stored.version,
            }
            .fail();
        }
        let mut cluster = cluster;
        cluster.version += 1;
        *stored = cluster.clone();
        Ok(cluster)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.clusters
            .write()
            .await
            .remove(name)
            .map(|_| ())
            .context(error::NotFoundSnafu {
                kind: "cluster",
                name,
            })
    }

    async fn list(&self, page: &Page) -> Result<PageOf<Cluster>> {
        let clusters = self.clusters.read().await;
        paginate(
            clusters
                .iter()
                .map(|(name, cluster)| (name.clone(), cluster.clone()))
                .collect(),
            page,
        )
    }
}

#[async_trait]
impl TaskDefinitionStore for MemoryStore {
    async fn register(&self, definition: TaskDefinition) -> Result<TaskDefinition> {
        let mut families = self.task_definitions.write().await;
        let revisions = families.entry(definition.family.clone()).or_default();
        let next_revision = revisions.keys().next_back().copied().unwrap_or(0) + 1;
        let mut definition = definition;
        definition.revision = next_revision;
        definition.status = TaskDefinitionStatus::Active;
        definition.task_definition_arn = Some(Arn::ecs_task_definition(
            &self.region,
            &self.account_id,
            &definition.family,
            next_revision,
        ));
        if definition.registered_at.is_none() {
            definition.registered_at = Some(Utc::now());
        }
        revisions.insert(next_revision, definition.clone());
        Ok(definition)
    }

    async fn get(&self, family: &str, revision: i64) -> Result<Option<TaskDefinition>> {
        Ok(self
            .task_definitions
            .read()
            .await
            .get(family)
            .and_then(|revisions| revisions.get(&revision))
            .cloned())
    }

    async fn get_latest(&self, family: &str) -> Result<Option<TaskDefinition>> {
        Ok(self
            .task_definitions
            .read()
            .await
            .get(family)
            .and_then(|revisions| {
                revisions
                    .values()
                    .rev()
                    .find(|d| d.status == TaskDefinitionStatus::Active)
            })
            .cloned())
    }

    async fn get_by_arn(&self, arn: &str) -> Result<Option<TaskDefinition>> {
        let families = self.task_definitions.read().await;
        Ok(families
            .values()
            .flat_map(|revisions| revisions.values())
            .find(|d| d.task_definition_arn.as_deref() == Some(arn))
            .cloned())
    }

    async fn deregister(&self, family: &str, revision: i64) -> Result<TaskDefinition> {
        let mut families = self.task_definitions.write().await;
        let definition = families
            .get_mut(family)
            .and_then(|revisions| revisions.get_mut(&revision))
            .context(error::NotFoundSnafu {
                kind: "task definition",
                name: format!("{}:{}", family, revision),
            })?;
        definition.status = TaskDefinitionStatus::Inactive;
        definition.deregistered_at = Some(Utc::now());
        Ok(definition.clone())
    }

    async fn list(
        &self,
        filter: &TaskDefinitionFilter,
        page: &Page,
    ) -> Result<PageOf<TaskDefinition>> {
        let families = self.task_definitions.read().await;
        let items = families
            .iter()
            .filter(|(family, _)| match &filter.family_prefix {
                Some(prefix) => family.starts_with(prefix.as_str()),
                None => true,
            })
            .flat_map(|(family, revisions)| {
                revisions
                    .values()
                    .filter(|d| filter.status.map(|s| d.status == s).unwrap_or(true))
                    .map(|d| (revision_key(family, d.revision), d.clone()))
            })
            .collect();
        paginate(items, page)
    }

    async fn list_families(&self, prefix: Option<&str>, page: &Page) -> Result<PageOf<String>> {
        let families = self.task_definitions.read().await;
        let items = families
            .iter()
            .filter(|(family, revisions)| {
                prefix.map(|p| family.starts_with(p)).unwrap_or(true) && !revisions.is_empty()
            })
            .map(|(family, _)| (family.clone(), family.clone()))
            .collect();
        paginate(items, page)
    }
}

fn service_key(cluster_arn: &str, name: &str) -> String {
    format!("{}|{}", cluster_arn, name)
}

#[async_trait]
impl ServiceStore for MemoryStore {
    async fn create(&self, service: Service) -> Result<Service> {
        let cluster_arn = service.cluster_arn.clone().unwrap_or_default();
        let mut services = self.services.write().await;
        let key = (cluster_arn, service.service_name.clone());
        if services.contains_key(&key) {
            return error::AlreadyExistsSnafu {
                kind: "service",
                name: service.service_name,
            }
            .fail();
        }
        let mut service = service;
        service.version = 1;
        services.insert(key, service.clone());
        Ok(service)
    }

    async fn get(&self, cluster_arn: &str, name: &str) -> Result<Option<Service>> {
        Ok(self
            .services
            .read()
            .await
            .get(&(cluster_arn.to_owned(), name.to_owned()))
            .cloned())
    }

    async fn get_by_arn(&self, arn: &str) -> Result<Option<Service>> {
        Ok(self
            .services
            .read()
            .await
            .values()
            .find(|s| s.service_arn.as_deref() == Some(arn))
            .cloned())
    }

    async fn update(&self, service: Service) -> Result<Service> {
        let cluster_arn = service.cluster_arn.clone().unwrap_or_default();
        let mut services = self.services.write().await;
        let key = (cluster_arn, service.service_name.clone());
        let stored = services.get_mut(&key).context(error::NotFoundSnafu {
            kind: "service",
            name: &service.service_name,
        })?;
        if stored.version != service.version {
            return error::VersionConflictSnafu {
                kind: "service",
                name: service.service_name,
                expected: stored.version,
            }
            .fail();
        }
        let mut service = service;
        service.version += 1;
        *stored = service.clone();
        Ok(service)
    }

    async fn delete(&self, cluster_arn: &str, name: &str) -> Result<()> {
        self.services
            .write()
            .await
            .remove(&(cluster_arn.to_owned(), name.to_owned()))
            .map(|_| ())
            .context(error::NotFoundSnafu {
                kind: "service",
                name,
            })
    }

    async fn list(&self, filter: &ServiceFilter, page: &Page) -> Result<PageOf<Service>> {
        let services = self.services.read().await;
        let items = services
            .iter()
            .filter(|((cluster_arn, _), service)| {
                filter
                    .cluster_arn
                    .as_deref()
                    .map(|want| cluster_arn == want)
                    .unwrap_or(true)
                    && filter
                        .launch_type
                        .map(|want| service.launch_type == Some(want))
                        .unwrap_or(true)
            })
            .map(|((cluster_arn, name), service)| {
                (service_key(cluster_arn, name), service.clone())
            })
            .collect();
        paginate(items, page)
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create(&self, task: Task) -> Result<Task> {
        let arn = task.task_arn.clone().unwrap_or_default();
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&arn) {
            return error::AlreadyExistsSnafu {
                kind: "task",
                name: arn,
            }
            .fail();
        }
        let mut task = task;
        task.version = 1;
        tasks.insert(arn, task.clone());
        Ok(task)
    }

    async fn get(&self, cluster_arn: &str, id_or_arn: &str) -> Result<Option<Task>> {
        let tasks = self.tasks.read().await;
        let found = if id_or_arn.contains('/') {
            tasks.get(id_or_arn)
        } else {
            tasks
                .values()
                .find(|t| t.id() == Some(id_or_arn))
                .filter(|t| t.cluster_arn.as_deref() == Some(cluster_arn))
        };
        Ok(found
            .filter(|t| t.cluster_arn.as_deref() == Some(cluster_arn))
            .cloned())
    }

    async fn update(&self, task: Task) -> Result<Task> {
        let arn = task.task_arn.clone().unwrap_or_default();
        let mut tasks = self.tasks.write().await;
        let stored = tasks.get_mut(&arn).context(error::NotFoundSnafu {
            kind: "task",
            name: &arn,
        })?;
        if stored.version != task.version {
            return error::VersionConflictSnafu {
                kind: "task",
                name: arn,
                expected: stored.version,
            }
            .fail();
        }
        let mut task = task;
        task.version += 1;
        *stored = task.clone();
        Ok(task)
    }

    async fn delete(&self, arn: &str) -> Result<()> {
        self.tasks
            .write()
            .await
            .remove(arn)
            .map(|_| ())
            .context(error::NotFoundSnafu {
                kind: "task",
                name: arn,
            })
    }

    async fn list(&self, filter: &TaskFilter, page: &Page) -> Result<PageOf<Task>> {
        let tasks = self.tasks.read().await;
        let items = tasks
            .iter()
            .filter(|(_, task)| task_matches(task, filter))
            .map(|(arn, task)| (arn.clone(), task.clone()))
            .collect();
        paginate(items, page)
    }
}

fn task_matches(task: &Task, filter: &TaskFilter) -> bool {
    if let Some(cluster_arn) = &filter.cluster_arn {
        if task.cluster_arn.as_deref() != Some(cluster_arn) {
            return false;
        }
    }
    if let Some(family) = &filter.family {
        let marker = format!("task-definition/{}:", family);
        if !task
            .task_definition_arn
            .as_deref()
            .map(|arn| arn.contains(&marker))
            .unwrap_or(false)
        {
            return false;
        }
    }
    if let Some(service_name) = &filter.service_name {
        if task.group.as_deref() != Some(&format!("service:{}", service_name)) {
            return false;
        }
    }
    if let Some(started_by) = &filter.started_by {
        if task.started_by.as_deref() != Some(started_by) {
            return false;
        }
    }
    if let Some(desired) = filter.desired_status {
        if task.desired_status != desired {
            return false;
        }
    }
    true
}
