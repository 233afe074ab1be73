use snafu::Snafu;

/// The `Result` type returned by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The public error type of the controller crate. The API surface matches on these variants to
/// produce the ECS error taxonomy; keep variants specific to their failure class.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display(
        "Secret ARN '{}' refers to service '{}'; only secretsmanager and ssm are supported",
        arn,
        service
    ))]
    UnsupportedSecretService { arn: String, service: String },

    #[snafu(display("Invalid secret ARN '{}': {}", arn, reason))]
    InvalidSecretArn { arn: String, reason: String },

    #[snafu(display("Invalid artifact permissions '{}': not an octal file mode", permissions))]
    InvalidPermissions { permissions: String },

    #[snafu(display("Artifact URL '{}' has an unsupported scheme", url))]
    UnsupportedArtifactUrl { url: String },

    #[snafu(display("Invalid task definition: {}", reason))]
    InvalidTaskDefinition { reason: String },

    #[snafu(display("Invalid placement expression '{}': {}", expression, reason))]
    InvalidPlacementExpression { expression: String, reason: String },

    #[snafu(display("Unable to {} {}: {}", method, what, source))]
    KubeApiCall {
        method: &'static str,
        what: String,
        source: kube::Error,
    },

    #[snafu(display("Error serializing {}: {}", what, source))]
    SerializeManifest {
        what: String,
        source: serde_json::Error,
    },

    #[snafu(display("Error parsing manifest '{}': {}", path, source))]
    ParseManifest {
        path: String,
        source: serde_yaml::Error,
    },

    #[snafu(display("Unable to read manifest '{}': {}", path, source))]
    ReadManifest {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("Manifest '{}' has no kind/apiVersion", path))]
    IncompleteManifest { path: String },
}
