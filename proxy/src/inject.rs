use k8s_openapi::api::core::v1::{Container, ContainerPort, EnvVar, Pod};
use kecs_controller::SidecarInjector;
use kecs_model::constants::{
    EMULATOR_CREDENTIAL, ENV_AWS_ACCESS_KEY_ID, ENV_AWS_DEFAULT_REGION, ENV_AWS_ENDPOINT_URL,
    ENV_AWS_SECRET_ACCESS_KEY,
};
use kecs_model::TaskDefinition;
use serde::Deserialize;

/// How the proxy attaches itself to task pods.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// Rewrite every container's environment so AWS SDKs resolve against the shared in-cluster
    /// proxy service.
    #[default]
    Environment,
    /// Run a per-pod loopback proxy sidecar and point the SDKs at it.
    Sidecar,
}

/// The environment-injection mode: point `AWS_ENDPOINT_URL` (and credentials) at the shared
/// proxy service.
#[derive(Clone, Debug)]
pub struct EnvironmentInjector {
    proxy_endpoint: String,
    region: String,
}

impl EnvironmentInjector {
    pub fn new<S1, S2>(proxy_endpoint: S1, region: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            proxy_endpoint: proxy_endpoint.into(),
            region: region.into(),
        }
    }
}

impl SidecarInjector for EnvironmentInjector {
    fn should_inject(&self, _task_definition: &TaskDefinition) -> bool {
        true
    }

    fn inject(&self, pod: &mut Pod) {
        let spec = match pod.spec.as_mut() {
            Some(spec) => spec,
            None => return,
        };
        for container in spec
            .containers
            .iter_mut()
            .chain(spec.init_containers.iter_mut().flatten())
        {
            point_at_endpoint(container, &self.proxy_endpoint, &self.region);
        }
    }
}

/// The sidecar mode: a loopback proxy container per pod. The sidecar terminates AWS traffic on
/// localhost so nothing leaves the pod unobserved.
#[derive(Clone, Debug)]
pub struct SidecarProxyInjector {
    image: String,
    port: u16,
    region: String,
}

impl SidecarProxyInjector {
    pub fn new<S1, S2>(image: S1, port: u16, region: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            image: image.into(),
            port,
            region: region.into(),
        }
    }
}

pub const SIDECAR_CONTAINER_NAME: &str = "kecs-aws-proxy";

impl SidecarInjector for SidecarProxyInjector {
    fn should_inject(&self, task_definition: &TaskDefinition) -> bool {
        !task_definition.container_definitions.is_empty()
    }

    fn inject(&self, pod: &mut Pod) {
        let spec = match pod.spec.as_mut() {
            Some(spec) => spec,
            None => return,
        };
        if spec
            .containers
            .iter()
            .any(|container| container.name == SIDECAR_CONTAINER_NAME)
        {
            return;
        }

        let endpoint = format!("http://127.0.0.1:{}", self.port);
        for container in spec
            .containers
            .iter_mut()
            .chain(spec.init_containers.iter_mut().flatten())
        {
            point_at_endpoint(container, &endpoint, &self.region);
        }

        spec.containers.push(Container {
            name: SIDECAR_CONTAINER_NAME.to_string(),
            image: Some(self.image.clone()),
            args: Some(vec![
                "proxy".to_string(),
                "--port".to_string(),
                self.port.to_string(),
            ]),
            ports: Some(vec![ContainerPort {
                container_port: i32::from(self.port),
                protocol: Some("TCP".to_string()),
                ..ContainerPort::default()
            }]),
            ..Container::default()
        });
    }
}

fn point_at_endpoint(container: &mut Container, endpoint: &str, region: &str) {
    let env = container.env.get_or_insert_with(Vec::new);
    for (name, value) in [
        (ENV_AWS_ENDPOINT_URL, endpoint),
        (ENV_AWS_ACCESS_KEY_ID, EMULATOR_CREDENTIAL),
        (ENV_AWS_SECRET_ACCESS_KEY, EMULATOR_CREDENTIAL),
        (ENV_AWS_DEFAULT_REGION, region),
    ] {
        match env.iter_mut().find(|existing| existing.name == name) {
            // The endpoint always reflects the configured mode, credentials stay untouched.
            Some(existing) if name == ENV_AWS_ENDPOINT_URL => {
                existing.value = Some(value.to_owned());
            }
            Some(_) => {}
            None => env.push(EnvVar {
                name: name.to_owned(),
                value: Some(value.to_owned()),
                value_from: None,
            }),
        }
    }
}
