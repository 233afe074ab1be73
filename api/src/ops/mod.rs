pub(crate) mod clusters;
pub(crate) mod services;
pub(crate) mod task_definitions;
pub(crate) mod task_sets;
pub(crate) mod tasks;

use crate::error::{EcsError, Result};
use crate::state::AppState;
use kecs_model::storage::Page;
use kecs_model::{Cluster, TaskDefinition};

/// Resolve a cluster reference (name, ARN, or absent meaning `default`).
pub(crate) async fn resolve_cluster(
    state: &AppState,
    cluster: Option<&str>,
) -> Result<Cluster> {
    let reference = cluster.filter(|c| !c.is_empty()).unwrap_or("default");
    let name = reference.rsplit('/').next().unwrap_or(reference);
    state
        .clusters
        .get(name)
        .await?
        .ok_or(EcsError::ClusterNotFound)
}

/// Resolve a task definition reference: a full ARN, `family:revision`, or a bare family
/// (meaning the latest ACTIVE revision).
pub(crate) async fn resolve_task_definition(
    state: &AppState,
    reference: &str,
) -> Result<TaskDefinition> {
    if reference.is_empty() {
        return Err(EcsError::invalid_parameter(
            "taskDefinition must be specified",
        ));
    }
    let spec = reference.rsplit('/').next().unwrap_or(reference);
    let found = match spec.rsplit_once(':') {
        Some((family, revision)) => match revision.parse::<i64>() {
            Ok(revision) => state.task_definitions.get(family, revision).await?,
            Err(_) => state.task_definitions.get_latest(spec).await?,
        },
        None => state.task_definitions.get_latest(spec).await?,
    };
    found.ok_or(EcsError::TaskDefinitionNotFound)
}

pub(crate) fn page_from(next_token: Option<String>, max_results: Option<i32>) -> Page {
    Page {
        token: next_token,
        limit: max_results.filter(|n| *n > 0).map(|n| n as usize),
    }
}

/// ECS resource names: 1-255 letters, digits, hyphens and underscores.
pub(crate) fn validate_name(kind: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 255
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(EcsError::invalid_parameter(format!(
            "'{}' is not a valid {} name",
            name, kind
        )))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::state::{AppState, Orchestrator};
    use async_trait::async_trait;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service as K8sService};
    use kecs_controller::{ArtifactStager, NoopElbv2, TranslatorConfig};
    use kecs_model::storage::MemoryStore;
    use kecs_model::LockMap;
    use std::sync::{Arc, Mutex};

    /// What the fake orchestrator saw, for assertions.
    #[derive(Debug, Default)]
    pub(crate) struct Recorded {
        pub namespaces: Vec<String>,
        pub pods: Vec<(String, Pod)>,
        pub deployments: Vec<(String, Deployment)>,
        pub services: Vec<(String, K8sService)>,
        pub claims: Vec<(String, PersistentVolumeClaim)>,
        pub deleted_pods: Vec<(String, String)>,
        pub deleted_deployments: Vec<(String, String)>,
        pub deleted_services: Vec<(String, String)>,
    }

    /// An [`Orchestrator`] that records every call instead of talking to a cluster. Set
    /// `fail_applies` to exercise the compensation paths.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingOrchestrator {
        pub recorded: Mutex<Recorded>,
        pub fail_applies: bool,
    }

    impl RecordingOrchestrator {
        fn fail<T>(&self) -> kecs_controller::Result<T> {
            Err(kecs_controller_error_stub())
        }
    }

    fn kecs_controller_error_stub() -> kecs_controller::Error {
        // A representative downstream failure for compensation tests.
        match serde_json::from_str::<serde_json::Value>("not json") {
            Err(source) => kecs_controller::Error::SerializeManifest {
                what: "test".to_string(),
                source,
            },
            Ok(_) => unreachable!(),
        }
    }

    #[async_trait]
    impl Orchestrator for RecordingOrchestrator {
        async fn ensure_namespace(&self, name: &str) -> kecs_controller::Result<()> {
            self.recorded.lock().unwrap().namespaces.push(name.to_owned());
            Ok(())
        }

        async fn apply_pod(&self, namespace: &str, pod: Pod) -> kecs_controller::Result<Pod> {
            if self.fail_applies {
                return self.fail();
            }
            self.recorded
                .lock()
                .unwrap()
                .pods
                .push((namespace.to_owned(), pod.clone()));
            Ok(pod)
        }

        async fn apply_deployment(
            &self,
            namespace: &str,
            deployment: Deployment,
        ) -> kecs_controller::Result<Deployment> {
            if self.fail_applies {
                return self.fail();
            }
            self.recorded
                .lock()
                .unwrap()
                .deployments
                .push((namespace.to_owned(), deployment.clone()));
            Ok(deployment)
        }

        async fn apply_service(
            &self,
            namespace: &str,
            service: K8sService,
        ) -> kecs_controller::Result<K8sService> {
            if self.fail_applies {
                return self.fail();
            }
            self.recorded
                .lock()
                .unwrap()
                .services
                .push((namespace.to_owned(), service.clone()));
            Ok(service)
        }

        async fn apply_pvc(
            &self,
            namespace: &str,
            claim: PersistentVolumeClaim,
        ) -> kecs_controller::Result<PersistentVolumeClaim> {
            if self.fail_applies {
                return self.fail();
            }
            self.recorded
                .lock()
                .unwrap()
                .claims
                .push((namespace.to_owned(), claim.clone()));
            Ok(claim)
        }

        async fn delete_pod(&self, namespace: &str, name: &str) -> kecs_controller::Result<()> {
            self.recorded
                .lock()
                .unwrap()
                .deleted_pods
                .push((namespace.to_owned(), name.to_owned()));
            Ok(())
        }

        async fn delete_deployment(
            &self,
            namespace: &str,
            name: &str,
        ) -> kecs_controller::Result<()> {
            self.recorded
                .lock()
                .unwrap()
                .deleted_deployments
                .push((namespace.to_owned(), name.to_owned()));
            Ok(())
        }

        async fn delete_service(&self, namespace: &str, name: &str) -> kecs_controller::Result<()> {
            self.recorded
                .lock()
                .unwrap()
                .deleted_services
                .push((namespace.to_owned(), name.to_owned()));
            Ok(())
        }
    }

    pub(crate) fn test_state() -> (Arc<AppState>, Arc<RecordingOrchestrator>) {
        test_state_with(RecordingOrchestrator::default())
    }

    pub(crate) fn test_state_with(
        orchestrator: RecordingOrchestrator,
    ) -> (Arc<AppState>, Arc<RecordingOrchestrator>) {
        let store = Arc::new(MemoryStore::new("us-east-1", "000000000000"));
        let orchestrator = Arc::new(orchestrator);
        let state = Arc::new(AppState {
            config: TranslatorConfig::new("us-east-1", "000000000000"),
            clusters: store.clone(),
            task_definitions: store.clone(),
            services: store.clone(),
            tasks: store,
            orchestrator: orchestrator.clone(),
            stager: ArtifactStager::new("us-east-1"),
            injector: None,
            elbv2: Arc::new(NoopElbv2),
            locks: Arc::new(LockMap::new()),
        });
        (state, orchestrator)
    }
}
