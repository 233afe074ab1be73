use crate::error::{EcsError, Result};
use crate::ops;
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use http::HeaderMap;
use kecs_model::constants::ECS_TARGET_PREFIX;
use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// The single HTTP entrypoint of the ECS surface: an AWS JSON-1.1 POST dispatched on the
/// `X-Amz-Target` header.
pub(crate) async fn dispatch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let operation = match operation_from(&headers) {
        Ok(operation) => operation,
        Err(error) => return error.into_response(),
    };
    debug!("dispatching {}", operation);
    match route(state, &operation, &body).await {
        Ok(value) => Json(value).into_response(),
        Err(error) => error.into_response(),
    }
}

fn operation_from(headers: &HeaderMap) -> Result<String> {
    let target = headers
        .get("x-amz-target")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| EcsError::invalid_parameter("Missing X-Amz-Target header"))?;
    match target.split_once('.') {
        Some((prefix, operation)) if prefix == ECS_TARGET_PREFIX && !operation.is_empty() => {
            Ok(operation.to_owned())
        }
        _ => Err(EcsError::invalid_parameter(format!(
            "Unsupported X-Amz-Target '{}'",
            target
        ))),
    }
}

async fn route(state: Arc<AppState>, operation: &str, body: &[u8]) -> Result<Value> {
    match operation {
        "CreateCluster" => call(state, body, ops::clusters::create_cluster).await,
        "DescribeClusters" => call(state, body, ops::clusters::describe_clusters).await,
        "ListClusters" => call(state, body, ops::clusters::list_clusters).await,
        "DeleteCluster" => call(state, body, ops::clusters::delete_cluster).await,

        "RegisterTaskDefinition" => {
            call(state, body, ops::task_definitions::register_task_definition).await
        }
        "DescribeTaskDefinition" => {
            call(state, body, ops::task_definitions::describe_task_definition).await
        }
        "ListTaskDefinitions" => {
            call(state, body, ops::task_definitions::list_task_definitions).await
        }
        "ListTaskDefinitionFamilies" => {
            call(
                state,
                body,
                ops::task_definitions::list_task_definition_families,
            )
            .await
        }
        "DeregisterTaskDefinition" => {
            call(
                state,
                body,
                ops::task_definitions::deregister_task_definition,
            )
            .await
        }

        "CreateService" => call(state, body, ops::services::create_service).await,
        "UpdateService" => call(state, body, ops::services::update_service).await,
        "DeleteService" => call(state, body, ops::services::delete_service).await,
        "DescribeServices" => call(state, body, ops::services::describe_services).await,
        "ListServices" => call(state, body, ops::services::list_services).await,

        "RunTask" => call(state, body, ops::tasks::run_task).await,
        "StopTask" => call(state, body, ops::tasks::stop_task).await,
        "DescribeTasks" => call(state, body, ops::tasks::describe_tasks).await,
        "ListTasks" => call(state, body, ops::tasks::list_tasks).await,

        "CreateTaskSet" => call(state, body, ops::task_sets::create_task_set).await,
        "DescribeTaskSets" => call(state, body, ops::task_sets::describe_task_sets).await,
        "DeleteTaskSet" => call(state, body, ops::task_sets::delete_task_set).await,

        unknown => Err(EcsError::invalid_parameter(format!(
            "Unknown operation '{}'",
            unknown
        ))),
    }
}

/// Deserialize the request (an empty body means `{}`; unknown fields are ignored), run the
/// handler, and serialize its response.
async fn call<Request, Reply, Handler, Fut>(
    state: Arc<AppState>,
    body: &[u8],
    handler: Handler,
) -> Result<Value>
where
    Request: DeserializeOwned + Default,
    Reply: Serialize,
    Handler: FnOnce(Arc<AppState>, Request) -> Fut,
    Fut: Future<Output = Result<Reply>>,
{
    let request: Request = if body.is_empty() {
        Request::default()
    } else {
        serde_json::from_slice(body)
            .map_err(|parse_error| EcsError::invalid_parameter(parse_error.to_string()))?
    };
    let reply = handler(state, request).await?;
    serde_json::to_value(reply).map_err(|serialize_error| EcsError::server(serialize_error.to_string()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ops::testing::test_state;

    #[test]
    fn operation_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-amz-target",
            "AmazonEC2ContainerServiceV20141113.RunTask".parse().unwrap(),
        );
        assert_eq!(operation_from(&headers).unwrap(), "RunTask");

        headers.insert("x-amz-target", "SomethingElse.RunTask".parse().unwrap());
        assert!(operation_from(&headers).is_err());
    }

    #[tokio::test]
    async fn end_to_end_dispatch() {
        let (state, _) = test_state();
        let created = route(
            state.clone(),
            "CreateCluster",
            br#"{"clusterName": "c1", "ignoredField": true}"#,
        )
        .await
        .unwrap();
        assert_eq!(
            created["cluster"]["clusterArn"],
            "arn:aws:ecs:us-east-1:000000000000:cluster/c1"
        );

        // An empty body lists the default page.
        let listed = route(state.clone(), "ListClusters", b"").await.unwrap();
        assert_eq!(listed["clusterArns"].as_array().unwrap().len(), 1);

        let error = route(state, "MakeCoffee", b"{}").await.unwrap_err();
        assert!(matches!(error, EcsError::InvalidParameter { .. }));
    }

    #[tokio::test]
    async fn error_envelope_shape() {
        let (state, _) = test_state();
        let error = route(
            state,
            "DescribeServices",
            br#"{"cluster": "ghost", "services": ["s1"]}"#,
        )
        .await
        .unwrap_err();
        let response = error.into_response();
        assert_eq!(response.status(), http::StatusCode::BAD_REQUEST);
    }
}
