/*!

The ECS↔Kubernetes reconciliation core: translators from ECS task definitions, services and
task sets to Kubernetes objects, an idempotent manifest applier, the state projector that folds
Kubernetes observations back into stored ECS resources, and the secret/artifact staging
helpers the translators consult.

Everything here is constructor-injected: the region, account id and emulator endpoints arrive
through [`TranslatorConfig`] and the builders' collaborators, never through process globals.

!*/

#![deny(
    clippy::expect_used,
    clippy::get_unwrap,
    clippy::panic,
    clippy::panic_in_result_fn,
    clippy::panicking_unwrap,
    clippy::unwrap_in_result,
    clippy::unwrap_used
)]

pub use apply::ManifestApplier;
pub use artifacts::{ArtifactPlan, ArtifactStager};
pub use deployment_builder::{DeploymentBuilder, ServiceManifests};
pub use error::{Error, Result};
pub use pod_builder::{shared_volume_claims, PodBuilder, RunTaskOverlay, SidecarInjector};
pub use projector::Projector;
pub use secrets::{resolve_secret_arn, ResolvedSecret, SecretSource};
pub use sweep::sweep_orphans;
pub use task_set_builder::{Elbv2Integration, NoopElbv2, TaskSetBuilder, TaskSetManifests};

mod apply;
mod artifacts;
mod deployment_builder;
mod error;
mod placement;
mod pod_builder;
mod projector;
mod retry;
mod secrets;
mod sweep;
mod task_set_builder;

/// Identity and feature switches shared by every translator. Constructor-injected so that no
/// process-wide globals leak into the API surface.
#[derive(Clone, Debug)]
pub struct TranslatorConfig {
    pub region: String,
    pub account_id: String,
    /// When enabled, `taskRoleArn` maps onto a `<role>-sa` ServiceAccount.
    pub iam_integration: bool,
}

impl TranslatorConfig {
    pub fn new<S1, S2>(region: S1, account_id: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            region: region.into(),
            account_id: account_id.into(),
            iam_integration: false,
        }
    }

    pub fn with_iam_integration(mut self, enabled: bool) -> Self {
        self.iam_integration = enabled;
        self
    }
}
