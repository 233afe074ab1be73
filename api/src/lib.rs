/*!

The ECS RPC surface: AWS JSON-1.1 over HTTP POST, dispatched on the `X-Amz-Target` header,
orchestrating the translators, applier and storage in response to each operation. Errors
serialize into the `{"__type", "message"}` envelope the AWS SDKs expect.

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

pub use error::EcsError;
pub use state::{AppState, Orchestrator};

mod dispatch;
mod error;
mod ops;
mod state;

use axum::routing::post;
use axum::Router;
use log::info;
use snafu::{ResultExt, Snafu};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Snafu)]
pub enum ServeError {
    #[snafu(display("API server error: {}", source))]
    Serve { source: hyper::Error },
}

/// The router for the ECS RPC surface.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", post(dispatch::dispatch))
        .with_state(state)
}

/// Serve the ECS RPC surface until the shutdown token fires.
pub async fn run_api(
    state: Arc<AppState>,
    port: u16,
    shutdown: CancellationToken,
) -> std::result::Result<(), ServeError> {
    let address = SocketAddr::from(([0, 0, 0, 0], port));
    info!("ECS API listening on {}", address);
    axum::Server::bind(&address)
        .serve(router(state).into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context(ServeSnafu)
}
