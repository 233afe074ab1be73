/*!

The AWS-ingress proxy: a reverse proxy that intercepts AWS API traffic from task containers
and forwards it to the in-cluster emulator, attributing every request to an AWS service along
the way. The pod-side attachment (environment rewriting or a loopback sidecar) lives in
[`inject`] and plugs into the pod translator through its injector interface.

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

pub use infer::infer_service;
pub use inject::{
    DeploymentMode, EnvironmentInjector, SidecarProxyInjector, SIDECAR_CONTAINER_NAME,
};

mod infer;
mod inject;

use axum::body::{boxed, Body};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use http::{Request, StatusCode, Uri};
use hyper::client::HttpConnector;
use log::{debug, info, warn};
use serde_json::json;
use snafu::{ResultExt, Snafu};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long the health endpoint waits for the emulator before reporting unhealthy.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Proxy server error: {}", source))]
    Serve { source: hyper::Error },
}

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub listen_port: u16,
    /// The emulator endpoint, e.g. `http://localstack:4566`.
    pub emulator_endpoint: String,
}

struct ProxyState {
    emulator_endpoint: String,
    http: hyper::Client<HttpConnector>,
}

/// Serve the proxy until the shutdown token fires.
pub async fn run_proxy(config: ProxyConfig, shutdown: CancellationToken) -> Result<()> {
    let state = Arc::new(ProxyState {
        emulator_endpoint: config.emulator_endpoint.trim_end_matches('/').to_owned(),
        http: hyper::Client::new(),
    });
    let router = Router::new()
        .route("/health", get(health))
        .fallback(forward)
        .with_state(state);

    let address = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    info!(
        "AWS-ingress proxy listening on {} (emulator {})",
        address, config.emulator_endpoint
    );
    axum::Server::bind(&address)
        .serve(router.into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context(ServeSnafu)
}

/// Reverse-proxy everything to the emulator, preserving method, path and body. Only the `Host`
/// header is rewritten. Upstream failures surface as 502; the proxy never fabricates an AWS
/// success response.
async fn forward(State(state): State<Arc<ProxyState>>, request: Request<Body>) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let service = infer_service(request.headers()).unwrap_or_else(|| "unknown".to_owned());
    debug!("proxying {} {} (service '{}')", method, path, service);

    match forward_inner(&state, request).await {
        Ok(response) => response,
        Err(message) => {
            warn!(
                "upstream failure proxying {} {} (service '{}'): {}",
                method, path, service, message
            );
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "message": message })),
            )
                .into_response()
        }
    }
}

async fn forward_inner(
    state: &ProxyState,
    mut request: Request<Body>,
) -> std::result::Result<Response, String> {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    let uri: Uri = format!("{}{}", state.emulator_endpoint, path_and_query)
        .parse()
        .map_err(|parse_error| format!("bad upstream URI: {}", parse_error))?;
    *request.uri_mut() = uri;
    // hyper derives the outgoing Host header from the URI.
    request.headers_mut().remove(http::header::HOST);

    let response = state
        .http
        .request(request)
        .await
        .map_err(|request_error| request_error.to_string())?;
    Ok(response.map(boxed))
}

/// Local health: probe the emulator's own health endpoint and report our verdict.
async fn health(State(state): State<Arc<ProxyState>>) -> Response {
    let healthy = match format!("{}/_localstack/health", state.emulator_endpoint).parse::<Uri>() {
        Ok(uri) => matches!(
            tokio::time::timeout(HEALTH_TIMEOUT, state.http.get(uri)).await,
            Ok(Ok(response)) if response.status().is_success()
        ),
        Err(_) => false,
    };

    if healthy {
        (
            StatusCode::OK,
            Json(json!({ "status": "healthy", "emulator": state.emulator_endpoint })),
        )
            .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unhealthy", "emulator": state.emulator_endpoint })),
        )
            .into_response()
    }
}
