/*!

The storage contract of the control plane: four narrow async interfaces over whatever
persistence backs the deployment. The core does not prescribe a schema; any implementation
satisfying the per-row version-token semantics is acceptable. An in-memory reference
implementation backs tests and single-node runs.

The API surface must record its intent through these interfaces *before* applying objects to
Kubernetes, so that a crash-restart projector can reconcile orphans by label sweep.

!*/

pub use error::{Error, Result};
pub use memory::MemoryStore;

mod error;
mod memory;

use crate::{
    Cluster, LaunchType, Service, Task, TaskDefinition, TaskDefinitionStatus, TaskStatus,
};
use async_trait::async_trait;
use snafu::OptionExt;

/// A pagination request: an opaque token from a previous response plus a page size.
#[derive(Clone, Debug, Default)]
pub struct Page {
    pub token: Option<String>,
    pub limit: Option<usize>,
}

impl Page {
    pub fn all() -> Self {
        Self::default()
    }

    /// Decode the opaque token into the exclusive lower bound of the page.
    pub fn after(&self) -> Result<Option<String>> {
        self.token.as_deref().map(decode_token).transpose()
    }
}

/// One page of results. `next_token` is present when more items remain.
#[derive(Clone, Debug)]
pub struct PageOf<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
}

pub(crate) fn encode_token(last_key: &str) -> String {
    base64::encode(last_key)
}

pub(crate) fn decode_token(token: &str) -> Result<String> {
    let bytes = base64::decode(token)
        .ok()
        .context(error::BadPageTokenSnafu { token })?;
    String::from_utf8(bytes)
        .ok()
        .context(error::BadPageTokenSnafu { token })
}

#[derive(Clone, Debug, Default)]
pub struct ServiceFilter {
    pub cluster_arn: Option<String>,
    pub launch_type: Option<LaunchType>,
}

#[derive(Clone, Debug, Default)]
pub struct TaskFilter {
    pub cluster_arn: Option<String>,
    pub family: Option<String>,
    pub service_name: Option<String>,
    pub started_by: Option<String>,
    pub desired_status: Option<TaskStatus>,
}

#[derive(Clone, Debug, Default)]
pub struct TaskDefinitionFilter {
    pub family_prefix: Option<String>,
    pub status: Option<TaskDefinitionStatus>,
}

#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn create(&self, cluster: Cluster) -> Result<Cluster>;
    async fn get(&self, name: &str) -> Result<Option<Cluster>>;
    async fn get_by_arn(&self, arn: &str) -> Result<Option<Cluster>>;
    /// Read-modify-write with a version check; fails with `VersionConflict` when the stored
    /// version differs from `cluster.version`.
    async fn update(&self, cluster: Cluster) -> Result<Cluster>;
    async fn delete(&self, name: &str) -> Result<()>;
    async fn list(&self, page: &Page) -> Result<PageOf<Cluster>>;
}

#[async_trait]
pub trait TaskDefinitionStore: Send + Sync {
    /// Register a new revision of `definition.family`. The store allocates the next revision
    /// number atomically per family and fills in `revision` and `task_definition_arn`.
    async fn register(&self, definition: TaskDefinition) -> Result<TaskDefinition>;
    async fn get(&self, family: &str, revision: i64) -> Result<Option<TaskDefinition>>;
    async fn get_latest(&self, family: &str) -> Result<Option<TaskDefinition>>;
    async fn get_by_arn(&self, arn: &str) -> Result<Option<TaskDefinition>>;
    /// Mark a revision INACTIVE. Existing tasks and services keep running; the revision can no
    /// longer be used for new ones.
    async fn deregister(&self, family: &str, revision: i64) -> Result<TaskDefinition>;
    async fn list(&self, filter: &TaskDefinitionFilter, page: &Page)
        -> Result<PageOf<TaskDefinition>>;
    async fn list_families(&self, prefix: Option<&str>, page: &Page) -> Result<PageOf<String>>;
}

#[async_trait]
pub trait ServiceStore: Send + Sync {
    async fn create(&self, service: Service) -> Result<Service>;
    async fn get(&self, cluster_arn: &str, name: &str) -> Result<Option<Service>>;
    async fn get_by_arn(&self, arn: &str) -> Result<Option<Service>>;
    /// Read-modify-write with a version check; fails with `VersionConflict` when the stored
    /// version differs from `service.version`.
    async fn update(&self, service: Service) -> Result<Service>;
    async fn delete(&self, cluster_arn: &str, name: &str) -> Result<()>;
    async fn list(&self, filter: &ServiceFilter, page: &Page) -> Result<PageOf<Service>>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, task: Task) -> Result<Task>;
    /// `id_or_arn` may be a bare task id or a full task ARN.
    async fn get(&self, cluster_arn: &str, id_or_arn: &str) -> Result<Option<Task>>;
    /// Read-modify-write with a version check; fails with `VersionConflict` when the stored
    /// version differs from `task.version`.
    async fn update(&self, task: Task) -> Result<Task>;
    async fn delete(&self, arn: &str) -> Result<()>;
    async fn list(&self, filter: &TaskFilter, page: &Page) -> Result<PageOf<Task>>;
}
