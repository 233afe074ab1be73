use crate::error::{self, Result};
use crate::retry::with_backoff;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    Namespace, PersistentVolumeClaim, Pod, Service as K8sService,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, DynamicObject, PostParams};
use kube::core::ApiResource;
use kube::{Api, Client, Resource};
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt};
use std::fmt::Debug;
use std::path::Path;

/// Idempotent create-or-update against the Kubernetes API for the typed objects the
/// translators produce and for unstructured objects from kustomization files.
#[derive(Clone)]
pub struct ManifestApplier {
    client: Client,
}

impl ManifestApplier {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Make sure the cluster namespace exists before anything is applied into it.
    pub async fn ensure_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let existing = self.get_opt(&api, name, "namespace").await?;
        if existing.is_none() {
            let namespace = Namespace {
                metadata: ObjectMeta {
                    name: Some(name.to_owned()),
                    ..ObjectMeta::default()
                },
                ..Namespace::default()
            };
            self.create(&api, &namespace, "namespace").await?;
            info!("created namespace '{}'", name);
        }
        Ok(())
    }

    pub async fn apply_pod(&self, namespace: &str, pod: Pod) -> Result<Pod> {
        let api = Api::namespaced(self.client.clone(), namespace);
        self.create_or_update(&api, pod, "pod", merge_metadata)
            .await
    }

    pub async fn apply_deployment(
        &self,
        namespace: &str,
        deployment: Deployment,
    ) -> Result<Deployment> {
        let api = Api::namespaced(self.client.clone(), namespace);
        self.create_or_update(&api, deployment, "deployment", merge_metadata)
            .await
    }

    /// Services keep their allocated ClusterIP and NodePorts across updates; replacing them
    /// would churn every established connection.
    pub async fn apply_service(
        &self,
        namespace: &str,
        service: K8sService,
    ) -> Result<K8sService> {
        let api = Api::namespaced(self.client.clone(), namespace);
        self.create_or_update(&api, service, "service", merge_service)
            .await
    }

    /// PersistentVolumeClaims are immutable after creation; an existing claim is left alone.
    pub async fn apply_pvc(
        &self,
        namespace: &str,
        claim: PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let name = object_name(&claim);
        match self.get_opt(&api, &name, "persistentvolumeclaim").await? {
            Some(existing) => {
                debug!("persistentvolumeclaim '{}' already exists, leaving it alone", name);
                Ok(existing)
            }
            None => self.create(&api, &claim, "persistentvolumeclaim").await,
        }
    }

    pub async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        self.delete(&api, name, "pod").await
    }

    pub async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        self.delete(&api, name, "deployment").await
    }

    pub async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<K8sService> = Api::namespaced(self.client.clone(), namespace);
        self.delete(&api, name, "service").await
    }

    /// Apply an unstructured object through the dynamic client. Known CRD kinds use the static
    /// pluralization table; anything else falls back to `<kind>s`.
    pub async fn apply_dynamic(
        &self,
        namespace: &str,
        object: DynamicObject,
    ) -> Result<DynamicObject> {
        let types = object
            .types
            .clone()
            .context(error::IncompleteManifestSnafu {
                path: object_name(&object),
            })?;
        let (group, version) = match types.api_version.split_once('/') {
            Some((group, version)) => (group.to_owned(), version.to_owned()),
            None => (String::new(), types.api_version.clone()),
        };
        let resource = ApiResource {
            group,
            version,
            api_version: types.api_version.clone(),
            kind: types.kind.clone(),
            plural: plural_for(&types.kind),
        };
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);
        let kind = types.kind.to_lowercase();
        let name = object_name(&object);
        match self.get_opt(&api, &name, &kind).await? {
            Some(existing) => {
                let merged = merge_metadata(&existing, object);
                with_backoff(&format!("replace {} '{}'", kind, name), || {
                    let api = api.clone();
                    let name = name.clone();
                    let merged = merged.clone();
                    async move { api.replace(&name, &PostParams::default(), &merged).await }
                })
                .await
                .context(error::KubeApiCallSnafu {
                    method: "replace",
                    what: kind,
                })
            }
            None => self.create(&api, &object, "object").await,
        }
    }

    /// Expand a kustomization file (a flat `resources:` list with an optional namespace) by
    /// applying each listed file in order.
    pub async fn apply_kustomization(&self, dir: &Path, default_namespace: &str) -> Result<()> {
        let path = dir.join("kustomization.yaml");
        let text = tokio::fs::read_to_string(&path)
            .await
            .context(error::ReadManifestSnafu {
                path: path.display().to_string(),
            })?;
        let kustomization: Kustomization =
            serde_yaml::from_str(&text).context(error::ParseManifestSnafu {
                path: path.display().to_string(),
            })?;
        let namespace = kustomization
            .namespace
            .as_deref()
            .unwrap_or(default_namespace);

        for resource in &kustomization.resources {
            let resource_path = dir.join(resource);
            let content = tokio::fs::read_to_string(&resource_path).await.context(
                error::ReadManifestSnafu {
                    path: resource_path.display().to_string(),
                },
            )?;
            for document in split_documents(&content) {
                let mut object: DynamicObject =
                    serde_yaml::from_str(document).context(error::ParseManifestSnafu {
                        path: resource_path.display().to_string(),
                    })?;
                if object.metadata.namespace.is_none() {
                    object.metadata.namespace = Some(namespace.to_owned());
                }
                let target_namespace = object
                    .metadata
                    .namespace
                    .clone()
                    .unwrap_or_else(|| namespace.to_owned());
                self.apply_dynamic(&target_namespace, object).await?;
            }
        }
        Ok(())
    }

    async fn get_opt<K>(&self, api: &Api<K>, name: &str, what: &str) -> Result<Option<K>>
    where
        K: Resource + Clone + DeserializeOwned + Debug,
    {
        with_backoff(&format!("get {} '{}'", what, name), || {
            let api = api.clone();
            let name = name.to_owned();
            async move { api.get_opt(&name).await }
        })
        .await
        .context(error::KubeApiCallSnafu {
            method: "get",
            what,
        })
    }

    async fn create<K>(&self, api: &Api<K>, object: &K, what: &str) -> Result<K>
    where
        K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    {
        with_backoff(&format!("create {} '{}'", what, object_name(object)), || {
            let api = api.clone();
            let object = object.clone();
            async move { api.create(&PostParams::default(), &object).await }
        })
        .await
        .context(error::KubeApiCallSnafu {
            method: "create",
            what,
        })
    }

    async fn delete<K>(&self, api: &Api<K>, name: &str, what: &str) -> Result<()>
    where
        K: Resource + Clone + DeserializeOwned + Debug,
    {
        let result = with_backoff(&format!("delete {} '{}'", what, name), || {
            let api = api.clone();
            let name = name.to_owned();
            async move { api.delete(&name, &DeleteParams::default()).await }
        })
        .await;
        match result {
            Ok(_) => Ok(()),
            // Deleting something already gone is a success for our purposes.
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(source) => Err(source).context(error::KubeApiCallSnafu {
                method: "delete",
                what,
            }),
        }
    }

    async fn create_or_update<K, F>(
        &self,
        api: &Api<K>,
        desired: K,
        what: &str,
        merge: F,
    ) -> Result<K>
    where
        K: Resource + Clone + DeserializeOwned + Serialize + Debug,
        F: FnOnce(&K, K) -> K,
    {
        let name = object_name(&desired);
        match self.get_opt(api, &name, what).await? {
            None => self.create(api, &desired, what).await,
            Some(existing) => {
                let merged = merge(&existing, desired);
                with_backoff(&format!("replace {} '{}'", what, name), || {
                    let api = api.clone();
                    let name = name.clone();
                    let merged = merged.clone();
                    async move { api.replace(&name, &PostParams::default(), &merged).await }
                })
                .await
                .context(error::KubeApiCallSnafu {
                    method: "replace",
                    what,
                })
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct Kustomization {
    #[serde(default)]
    resources: Vec<String>,
    namespace: Option<String>,
}

fn object_name<K: Resource>(object: &K) -> String {
    object.meta().name.clone().unwrap_or_default()
}

/// Carry the fields the server owns over to the desired object, and merge labels and
/// annotations so an update never drops keys someone else added.
fn merge_metadata<K: Resource>(existing: &K, mut desired: K) -> K {
    desired.meta_mut().resource_version = existing.meta().resource_version.clone();
    desired.meta_mut().uid = existing.meta().uid.clone();

    if let Some(existing_labels) = &existing.meta().labels {
        let labels = desired.meta_mut().labels.get_or_insert_with(Default::default);
        for (key, value) in existing_labels {
            labels.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    if let Some(existing_annotations) = &existing.meta().annotations {
        let annotations = desired
            .meta_mut()
            .annotations
            .get_or_insert_with(Default::default);
        for (key, value) in existing_annotations {
            annotations
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
    desired
}

fn merge_service(existing: &K8sService, desired: K8sService) -> K8sService {
    let mut desired = merge_metadata(existing, desired);
    if let (Some(existing_spec), Some(spec)) = (&existing.spec, desired.spec.as_mut()) {
        spec.cluster_ip = existing_spec.cluster_ip.clone();
        spec.cluster_ips = existing_spec.cluster_ips.clone();
        if let Some(ports) = spec.ports.as_mut() {
            for port in ports {
                if port.node_port.is_none() {
                    port.node_port = existing_spec
                        .ports
                        .iter()
                        .flatten()
                        .find(|existing_port| existing_port.port == port.port)
                        .and_then(|existing_port| existing_port.node_port);
                }
            }
        }
    }
    desired
}

/// Plural names for the CRDs we apply dynamically. Everything else gets `<kind>s`, which is
/// right for the common cases and wrong in the same way `kubectl` would be without discovery.
fn plural_for(kind: &str) -> String {
    match kind {
        "IngressRoute" => "ingressroutes".to_string(),
        "IngressRouteTCP" => "ingressroutetcps".to_string(),
        "IngressRouteUDP" => "ingressrouteudps".to_string(),
        "Middleware" => "middlewares".to_string(),
        "TraefikService" => "traefikservices".to_string(),
        "ServersTransport" => "serverstransports".to_string(),
        other => format!("{}s", other.to_lowercase()),
    }
}

/// Split a YAML stream on `---` document separators.
fn split_documents(content: &str) -> Vec<&str> {
    content
        .split("\n---")
        .map(str::trim)
        .filter(|document| !document.is_empty())
        .collect()
}
