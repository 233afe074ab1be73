/// Helper macro to avoid retyping the base domain-like name of our system when creating further
/// string constants from it. When given no parameters, this returns the base domain-like name of
/// the system. When given a string literal parameter it adds `/parameter` to the end.
macro_rules! kecs_dev {
    () => {
        "kecs.dev"
    };
    ($s:literal) => {
        concat!(kecs_dev!(), "/", $s)
    };
}

/// Same as [`kecs_dev!`] for the `kecs.io` label domain used by the load-balancer integration.
macro_rules! kecs_io {
    () => {
        "kecs.io"
    };
    ($s:literal) => {
        concat!(kecs_io!(), "/", $s)
    };
}

// Label keys owned by the control plane. Nothing outside the core may write these.
pub const LABEL_CLUSTER: &str = kecs_dev!("cluster");
pub const LABEL_SERVICE: &str = kecs_dev!("service");
pub const LABEL_TASK_ID: &str = kecs_dev!("task-id");
pub const LABEL_TASK_FAMILY: &str = kecs_dev!("task-family");
pub const LABEL_TASK_REVISION: &str = kecs_dev!("task-revision");
pub const LABEL_TASK_ROLE_ARN: &str = kecs_dev!("task-role-arn");
pub const LABEL_TASK_ROLE_NAME: &str = kecs_dev!("task-role-name");
pub const LABEL_LAUNCH_TYPE: &str = kecs_dev!("launch-type");
pub const LABEL_MANAGED_BY: &str = kecs_dev!("managed-by");
pub const MANAGED_BY: &str = "kecs";

// Load-balancer integration labels.
pub const LABEL_ELBV2_TARGET_GROUP_NAME: &str = kecs_io!("elbv2-target-group-name");
pub const LABEL_ELBV2_TARGET_GROUP_NAMES: &str = kecs_io!("elbv2-target-group-names");
pub const LABEL_TASKSET: &str = kecs_io!("taskset");
pub const LABEL_TASKSET_SERVICE: &str = kecs_io!("service");
pub const LABEL_TASKSET_EXTERNAL_ID: &str = kecs_io!("taskset-external-id");

// The label selector with which the projector and the startup sweep find our objects.
pub const MANAGED_BY_SELECTOR: &str = concat!(kecs_dev!("managed-by"), "=", "kecs");

// Annotation keys.
pub const ANNOTATION_TASK_ARN: &str = kecs_dev!("task-arn");
pub const ANNOTATION_TASK_DEFINITION_ARN: &str = kecs_dev!("task-definition-arn");
pub const ANNOTATION_EXECUTION_ROLE_ARN: &str = kecs_dev!("execution-role-arn");
pub const ANNOTATION_TASK_ROLE_ARN: &str = kecs_dev!("task-role-arn");
pub const ANNOTATION_CLOUDWATCH_LOGS_ENABLED: &str = kecs_dev!("cloudwatch-logs-enabled");
pub const ANNOTATION_SECRET_COUNT: &str = kecs_dev!("secret-count");
pub const ANNOTATION_TARGET_GROUP_ARN: &str = kecs_io!("target-group-arn");

/// Prefix for per-secret annotations; the full key is `kecs.dev/secret-<index>-arn`.
pub const ANNOTATION_SECRET_PREFIX: &str = kecs_dev!("secret-");
/// Prefix for per-container log annotations; the full key is
/// `kecs.dev/container-<name>-logs-<field>`.
pub const ANNOTATION_CONTAINER_PREFIX: &str = kecs_dev!("container-");
/// Prefix for per-volume annotations; the full key is `kecs.dev/volume-<name>-<field>`.
pub const ANNOTATION_VOLUME_PREFIX: &str = kecs_dev!("volume-");

// Annotations in the `ecs.amazonaws.com` domain carry awsvpc networking intent.
pub const ANNOTATION_NETWORK_MODE: &str = "ecs.amazonaws.com/network-mode";
pub const ANNOTATION_SUBNETS: &str = "ecs.amazonaws.com/subnets";
pub const ANNOTATION_SECURITY_GROUPS: &str = "ecs.amazonaws.com/security-groups";
pub const ANNOTATION_ASSIGN_PUBLIC_IP: &str = "ecs.amazonaws.com/assign-public-ip";

// Prefix under which ECS resource tags are projected onto Kubernetes labels.
pub const TAG_LABEL_PREFIX: &str = "tag.";

// Environment variables injected into task containers so that AWS SDKs inside the task
// resolve against the in-cluster emulator.
pub const ENV_AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const ENV_AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const ENV_AWS_DEFAULT_REGION: &str = "AWS_DEFAULT_REGION";
pub const ENV_AWS_ENDPOINT_URL: &str = "AWS_ENDPOINT_URL";
pub const ENV_AWS_ENDPOINT_URL_S3: &str = "AWS_ENDPOINT_URL_S3";
pub const EMULATOR_CREDENTIAL: &str = "test";

// Defaults for the process-wide identity of the emulated control plane.
pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_ACCOUNT_ID: &str = "000000000000";
pub const DEFAULT_PROXY_PORT: u16 = 4566;

// The `X-Amz-Target` prefix of every ECS operation.
pub const ECS_TARGET_PREFIX: &str = "AmazonEC2ContainerServiceV20141113";

#[test]
fn kecs_constants_macro_test() {
    assert_eq!("kecs.dev", kecs_dev!());
    assert_eq!("kecs.dev/cluster", LABEL_CLUSTER);
    assert_eq!("kecs.io/taskset", LABEL_TASKSET);
    assert_eq!("kecs.dev/managed-by=kecs", MANAGED_BY_SELECTOR);
}
