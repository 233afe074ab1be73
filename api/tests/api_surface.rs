//! Drives the ECS RPC surface end-to-end through the HTTP router: AWS JSON-1.1 requests in,
//! ECS-shaped JSON (or the error envelope) out, with a fake orchestrator standing in for the
//! Kubernetes cluster.

use async_trait::async_trait;
use axum::body::Body;
use axum::Router;
use http::{Request, StatusCode};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service as K8sService};
use kecs_api::{AppState, Orchestrator};
use kecs_controller::{ArtifactStager, NoopElbv2, TranslatorConfig};
use kecs_model::storage::MemoryStore;
use kecs_model::LockMap;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

/// A cluster that accepts everything and remembers the applied objects.
#[derive(Debug, Default)]
struct FakeCluster {
    deployments: Mutex<Vec<Deployment>>,
    pods: Mutex<Vec<Pod>>,
}

#[async_trait]
impl Orchestrator for FakeCluster {
    async fn ensure_namespace(&self, _name: &str) -> kecs_controller::Result<()> {
        Ok(())
    }

    async fn apply_pod(&self, _namespace: &str, pod: Pod) -> kecs_controller::Result<Pod> {
        self.pods.lock().unwrap().push(pod.clone());
        Ok(pod)
    }

    async fn apply_deployment(
        &self,
        _namespace: &str,
        deployment: Deployment,
    ) -> kecs_controller::Result<Deployment> {
        self.deployments.lock().unwrap().push(deployment.clone());
        Ok(deployment)
    }

    async fn apply_service(
        &self,
        _namespace: &str,
        service: K8sService,
    ) -> kecs_controller::Result<K8sService> {
        Ok(service)
    }

    async fn apply_pvc(
        &self,
        _namespace: &str,
        claim: PersistentVolumeClaim,
    ) -> kecs_controller::Result<PersistentVolumeClaim> {
        Ok(claim)
    }

    async fn delete_pod(&self, _namespace: &str, _name: &str) -> kecs_controller::Result<()> {
        Ok(())
    }

    async fn delete_deployment(
        &self,
        _namespace: &str,
        _name: &str,
    ) -> kecs_controller::Result<()> {
        Ok(())
    }

    async fn delete_service(&self, _namespace: &str, _name: &str) -> kecs_controller::Result<()> {
        Ok(())
    }
}

fn test_router() -> (Router, Arc<FakeCluster>) {
    let store = Arc::new(MemoryStore::new("us-east-1", "000000000000"));
    let fake = Arc::new(FakeCluster::default());
    let state = Arc::new(AppState {
        config: TranslatorConfig::new("us-east-1", "000000000000"),
        clusters: store.clone(),
        task_definitions: store.clone(),
        services: store.clone(),
        tasks: store,
        orchestrator: fake.clone(),
        stager: ArtifactStager::new("us-east-1"),
        injector: None,
        elbv2: Arc::new(NoopElbv2),
        locks: Arc::new(LockMap::new()),
    });
    (kecs_api::router(state), fake)
}

async fn call(router: &Router, operation: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/")
        .header("content-type", "application/x-amz-json-1.1")
        .header(
            "x-amz-target",
            format!("AmazonEC2ContainerServiceV20141113.{}", operation),
        )
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn run_simple_task() {
    let (router, fake) = test_router();

    let (status, _) = call(&router, "CreateCluster", json!({ "clusterName": "c1" })).await;
    assert_eq!(status, StatusCode::OK);

    let (status, registered) = call(
        &router,
        "RegisterTaskDefinition",
        json!({
            "family": "t1",
            "containerDefinitions": [{
                "name": "main",
                "image": "busybox",
                "command": ["echo", "hi"],
                "memory": 128
            }]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(registered["taskDefinition"]["revision"], 1);

    let (status, ran) = call(
        &router,
        "RunTask",
        json!({ "cluster": "c1", "taskDefinition": "t1", "count": 1 }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ran["tasks"].as_array().unwrap().len(), 1);
    assert_eq!(ran["tasks"][0]["lastStatus"], "PROVISIONING");
    assert_eq!(ran["tasks"][0]["desiredStatus"], "RUNNING");

    // The pod landed in the cluster namespace with a Never restart policy.
    let pods = fake.pods.lock().unwrap();
    assert_eq!(pods.len(), 1);
    assert_eq!(pods[0].metadata.namespace.as_deref(), Some("c1-us-east-1"));
    assert_eq!(
        pods[0].spec.as_ref().unwrap().restart_policy.as_deref(),
        Some("Never")
    );
    drop(pods);

    let task_arn = ran["tasks"][0]["taskArn"].as_str().unwrap().to_owned();
    let (status, described) = call(
        &router,
        "DescribeTasks",
        json!({ "cluster": "c1", "tasks": [task_arn] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(described["tasks"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn service_with_load_balancer() {
    let (router, fake) = test_router();
    call(&router, "CreateCluster", json!({ "clusterName": "c1" })).await;
    call(
        &router,
        "RegisterTaskDefinition",
        json!({
            "family": "web",
            "containerDefinitions": [{
                "name": "web",
                "image": "nginx",
                "portMappings": [{ "containerPort": 80, "protocol": "tcp" }]
            }]
        }),
    )
    .await;

    let (status, created) = call(
        &router,
        "CreateService",
        json!({
            "cluster": "c1",
            "serviceName": "s1",
            "taskDefinition": "web",
            "desiredCount": 2,
            "loadBalancers": [{
                "targetGroupArn":
                    "arn:aws:elasticloadbalancing:us-east-1:000000000000:targetgroup/tg1/abc",
                "containerName": "web",
                "containerPort": 80
            }]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["service"]["status"], "PENDING");
    assert_eq!(created["service"]["desiredCount"], 2);

    let deployments = fake.deployments.lock().unwrap();
    assert_eq!(deployments.len(), 1);
    assert_eq!(deployments[0].spec.as_ref().unwrap().replicas, Some(2));
    assert_eq!(
        deployments[0]
            .metadata
            .labels
            .as_ref()
            .unwrap()
            .get("kecs.io/elbv2-target-group-name"),
        Some(&"tg1".to_string())
    );
    drop(deployments);

    let (status, listed) = call(&router, "ListServices", json!({ "cluster": "c1" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        listed["serviceArns"][0],
        "arn:aws:ecs:us-east-1:000000000000:service/c1/s1"
    );
}

#[tokio::test]
async fn error_envelope() {
    let (router, _) = test_router();

    let (status, body) = call(
        &router,
        "DescribeServices",
        json!({ "cluster": "ghost", "services": ["s1"] }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["__type"], "ClusterNotFoundException");
    assert!(body["message"].as_str().unwrap().contains("not found"));

    let (status, body) = call(
        &router,
        "RunTask",
        json!({ "taskDefinition": "missing" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    // The default cluster does not exist until someone creates it.
    assert_eq!(body["__type"], "ClusterNotFoundException");
}

#[tokio::test]
async fn delete_service_guard_over_http() {
    let (router, _) = test_router();
    call(&router, "CreateCluster", json!({ "clusterName": "c1" })).await;
    call(
        &router,
        "RegisterTaskDefinition",
        json!({
            "family": "web",
            "containerDefinitions": [{ "name": "web", "image": "nginx" }]
        }),
    )
    .await;
    call(
        &router,
        "CreateService",
        json!({
            "cluster": "c1",
            "serviceName": "s1",
            "taskDefinition": "web",
            "desiredCount": 1
        }),
    )
    .await;

    let (status, body) = call(
        &router,
        "DeleteService",
        json!({ "cluster": "c1", "service": "s1" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["__type"], "InvalidParameterException");

    let (status, body) = call(
        &router,
        "DeleteService",
        json!({ "cluster": "c1", "service": "s1", "force": true }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"]["status"], "DRAINING");
    assert_eq!(body["service"]["desiredCount"], 0);
}
