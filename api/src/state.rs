use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service as K8sService};
use kecs_controller::{
    ArtifactStager, Elbv2Integration, ManifestApplier, SidecarInjector, TranslatorConfig,
};
use kecs_model::storage::{ClusterStore, ServiceStore, TaskDefinitionStore, TaskStore};
use kecs_model::LockMap;
use std::sync::Arc;

/// The slice of the manifest applier the API surface drives. A seam so that operation handlers
/// can be exercised against a recording fake without a Kubernetes cluster behind them.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn ensure_namespace(&self, name: &str) -> kecs_controller::Result<()>;
    async fn apply_pod(&self, namespace: &str, pod: Pod) -> kecs_controller::Result<Pod>;
    async fn apply_deployment(
        &self,
        namespace: &str,
        deployment: Deployment,
    ) -> kecs_controller::Result<Deployment>;
    async fn apply_service(
        &self,
        namespace: &str,
        service: K8sService,
    ) -> kecs_controller::Result<K8sService>;
    async fn apply_pvc(
        &self,
        namespace: &str,
        claim: PersistentVolumeClaim,
    ) -> kecs_controller::Result<PersistentVolumeClaim>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> kecs_controller::Result<()>;
    async fn delete_deployment(&self, namespace: &str, name: &str) -> kecs_controller::Result<()>;
    async fn delete_service(&self, namespace: &str, name: &str) -> kecs_controller::Result<()>;
}

#[async_trait]
impl Orchestrator for ManifestApplier {
    async fn ensure_namespace(&self, name: &str) -> kecs_controller::Result<()> {
        ManifestApplier::ensure_namespace(self, name).await
    }

    async fn apply_pod(&self, namespace: &str, pod: Pod) -> kecs_controller::Result<Pod> {
        ManifestApplier::apply_pod(self, namespace, pod).await
    }

    async fn apply_deployment(
        &self,
        namespace: &str,
        deployment: Deployment,
    ) -> kecs_controller::Result<Deployment> {
        ManifestApplier::apply_deployment(self, namespace, deployment).await
    }

    async fn apply_service(
        &self,
        namespace: &str,
        service: K8sService,
    ) -> kecs_controller::Result<K8sService> {
        ManifestApplier::apply_service(self, namespace, service).await
    }

    async fn apply_pvc(
        &self,
        namespace: &str,
        claim: PersistentVolumeClaim,
    ) -> kecs_controller::Result<PersistentVolumeClaim> {
        ManifestApplier::apply_pvc(self, namespace, claim).await
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> kecs_controller::Result<()> {
        ManifestApplier::delete_pod(self, namespace, name).await
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> kecs_controller::Result<()> {
        ManifestApplier::delete_deployment(self, namespace, name).await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> kecs_controller::Result<()> {
        ManifestApplier::delete_service(self, namespace, name).await
    }
}

/// Everything an operation handler needs. Shared behind an `Arc` by the HTTP layer.
pub struct AppState {
    pub config: TranslatorConfig,
    pub clusters: Arc<dyn ClusterStore>,
    pub task_definitions: Arc<dyn TaskDefinitionStore>,
    pub services: Arc<dyn ServiceStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub stager: ArtifactStager,
    pub injector: Option<Arc<dyn SidecarInjector>>,
    pub elbv2: Arc<dyn Elbv2Integration>,
    pub locks: Arc<LockMap>,
}

impl AppState {
    pub fn injector_ref(&self) -> Option<&dyn SidecarInjector> {
        self.injector.as_deref()
    }
}
