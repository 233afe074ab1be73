/*!

The `kecs` server binary: an ECS-compatible control plane over a Kubernetes cluster. It hosts
the ECS RPC surface, the AWS-ingress proxy, and the state projector, with an in-memory store
behind the storage contract.

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

use clap::Parser;
use env_logger::Builder;
use kecs_api::AppState;
use kecs_controller::{
    ArtifactStager, ManifestApplier, NoopElbv2, Projector, SidecarInjector, TranslatorConfig,
};
use kecs_model::constants::DEFAULT_PROXY_PORT;
use kecs_model::storage::MemoryStore;
use kecs_model::LockMap;
use kecs_proxy::{EnvironmentInjector, ProxyConfig, SidecarProxyInjector};
use log::{error, info, warn, LevelFilter};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[clap(name = "kecs", about = "ECS-compatible control plane on Kubernetes")]
struct Args {
    /// Port of the ECS RPC surface.
    #[clap(long, env = "KECS_PORT", default_value = "8080")]
    port: u16,

    /// Port of the AWS-ingress proxy.
    #[clap(long, env = "KECS_PROXY_PORT", default_value_t = DEFAULT_PROXY_PORT)]
    proxy_port: u16,

    /// Endpoint of the AWS emulator the proxy forwards to.
    #[clap(
        long,
        env = "LOCALSTACK_ENDPOINT",
        default_value = "http://localhost:4566"
    )]
    emulator_endpoint: String,

    /// The in-cluster URL task containers use to reach the proxy. Defaults to the
    /// `kecs-proxy` service on the proxy port.
    #[clap(long, env = "KECS_PROXY_SERVICE_ENDPOINT")]
    proxy_service_endpoint: Option<String>,

    /// How the proxy attaches to task pods: `environment` or `sidecar`.
    #[clap(long, env = "KECS_PROXY_MODE", default_value = "environment")]
    proxy_mode: String,

    /// Image of the loopback proxy sidecar (sidecar mode only).
    #[clap(long, env = "KECS_SIDECAR_IMAGE", default_value = "kecs/proxy:latest")]
    sidecar_image: String,

    #[clap(long, env = "AWS_DEFAULT_REGION", default_value = "us-east-1")]
    region: String,

    #[clap(long, env = "KECS_ACCOUNT_ID", default_value = "000000000000")]
    account_id: String,

    /// Map task IAM roles onto Kubernetes ServiceAccounts.
    #[clap(long)]
    iam_integration: bool,
}

#[tokio::main]
async fn main() {
    init_logger();
    let args = Args::parse();
    info!("starting kecs (region {})", args.region);

    // Initialize the k8s client from in-cluster variables or KUBECONFIG.
    let client = match kube::Client::try_default().await {
        Ok(client) => client,
        Err(client_error) => {
            error!("Unable to create k8s client: {}", client_error);
            std::process::exit(1);
        }
    };

    let proxy_endpoint = args
        .proxy_service_endpoint
        .clone()
        .unwrap_or_else(|| format!("http://kecs-proxy:{}", args.proxy_port));

    let injector: Option<Arc<dyn SidecarInjector>> = match args.proxy_mode.as_str() {
        "environment" => Some(Arc::new(EnvironmentInjector::new(
            proxy_endpoint.clone(),
            args.region.clone(),
        ))),
        "sidecar" => Some(Arc::new(SidecarProxyInjector::new(
            args.sidecar_image.clone(),
            args.proxy_port,
            args.region.clone(),
        ))),
        other => {
            error!(
                "Unknown proxy mode '{}', expected 'environment' or 'sidecar'",
                other
            );
            std::process::exit(1);
        }
    };

    let store = Arc::new(MemoryStore::new(
        args.region.clone(),
        args.account_id.clone(),
    ));
    let locks = Arc::new(LockMap::new());
    let state = Arc::new(AppState {
        config: TranslatorConfig::new(args.region.clone(), args.account_id.clone())
            .with_iam_integration(args.iam_integration),
        clusters: store.clone(),
        task_definitions: store.clone(),
        services: store.clone(),
        tasks: store.clone(),
        orchestrator: Arc::new(ManifestApplier::new(client.clone())),
        stager: ArtifactStager::new(args.region.clone()).with_s3_endpoint(proxy_endpoint),
        injector,
        elbv2: Arc::new(NoopElbv2),
        locks: locks.clone(),
    });

    if let Err(sweep_error) = kecs_controller::sweep_orphans(
        client.clone(),
        store.clone(),
        store.clone(),
        &args.region,
        &args.account_id,
    )
    .await
    {
        warn!("startup orphan sweep failed: {}", sweep_error);
    }

    let shutdown = CancellationToken::new();

    let projector = Projector::new(
        client,
        store.clone(),
        store,
        locks,
        args.region.clone(),
        args.account_id.clone(),
        shutdown.clone(),
    );
    let projector_handle = tokio::spawn(async move { projector.run().await });

    let proxy_config = ProxyConfig {
        listen_port: args.proxy_port,
        emulator_endpoint: args.emulator_endpoint.clone(),
    };
    let proxy_shutdown = shutdown.clone();
    let proxy_handle = tokio::spawn(async move {
        if let Err(proxy_error) = kecs_proxy::run_proxy(proxy_config, proxy_shutdown).await {
            error!("proxy server failed: {}", proxy_error);
        }
    });

    let api_shutdown = shutdown.clone();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            signal_shutdown.cancel();
        }
    });

    if let Err(api_error) = kecs_api::run_api(state, args.port, api_shutdown).await {
        error!("API server failed: {}", api_error);
        shutdown.cancel();
    }

    let _ = tokio::join!(projector_handle, proxy_handle);
}

/// The log level used when the `RUST_LOG` environment variable does not exist.
const DEFAULT_LEVEL_FILTER: LevelFilter = LevelFilter::Info;

/// Extract the value of `RUST_LOG` if it exists, otherwise log our crates at
/// `DEFAULT_LEVEL_FILTER`.
fn init_logger() {
    match std::env::var(env_logger::DEFAULT_FILTER_ENV).ok() {
        Some(_) => {
            // RUST_LOG exists; env_logger will use it.
            Builder::from_default_env().init();
        }
        None => {
            Builder::new()
                .filter(Some(env!("CARGO_CRATE_NAME")), DEFAULT_LEVEL_FILTER)
                .filter(Some("kecs_api"), DEFAULT_LEVEL_FILTER)
                .filter(Some("kecs_controller"), DEFAULT_LEVEL_FILTER)
                .filter(Some("kecs_model"), DEFAULT_LEVEL_FILTER)
                .filter(Some("kecs_proxy"), DEFAULT_LEVEL_FILTER)
                .init();
        }
    }
}
