use axum::response::{IntoResponse, Response};
use axum::Json;
use http::StatusCode;
use serde_json::json;
use snafu::Snafu;

pub type Result<T> = std::result::Result<T, EcsError>;

/// The ECS-visible error taxonomy. Every variant serializes into the AWS JSON-1.1 error
/// envelope `{"__type": "<Type>", "message": "<human>"}`.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EcsError {
    #[snafu(display("Cluster not found."))]
    ClusterNotFound,

    #[snafu(display("Service not found."))]
    ServiceNotFound,

    #[snafu(display("Service was not ACTIVE."))]
    ServiceNotActive,

    #[snafu(display("Unable to describe task definition."))]
    TaskDefinitionNotFound,

    #[snafu(display("The specified task set was not found."))]
    TaskSetNotFound,

    #[snafu(display("{}", message))]
    InvalidParameter { message: String },

    #[snafu(display("{}", message))]
    ResourceInUse { message: String },

    #[snafu(display("The platform version '{}' does not exist.", platform_version))]
    PlatformUnknown { platform_version: String },

    #[snafu(display("Artifact checksum verification failed: {}", message))]
    ChecksumMismatch { message: String },

    #[snafu(display("{}", message))]
    UnsupportedSecretService { message: String },

    #[snafu(display("Internal error: {}", message))]
    Server { message: String },
}

impl EcsError {
    pub fn invalid_parameter<S: Into<String>>(message: S) -> Self {
        EcsError::InvalidParameter {
            message: message.into(),
        }
    }

    pub fn server<S: Into<String>>(message: S) -> Self {
        EcsError::Server {
            message: message.into(),
        }
    }

    /// The `__type` field of the error envelope.
    pub fn type_name(&self) -> &'static str {
        match self {
            EcsError::ClusterNotFound => "ClusterNotFoundException",
            EcsError::ServiceNotFound => "ServiceNotFoundException",
            EcsError::ServiceNotActive => "ServiceNotActiveException",
            EcsError::TaskDefinitionNotFound => "TaskDefinitionNotFoundException",
            EcsError::TaskSetNotFound => "TaskSetNotFoundException",
            EcsError::InvalidParameter { .. } => "InvalidParameterException",
            EcsError::ResourceInUse { .. } => "ResourceInUse",
            EcsError::PlatformUnknown { .. } => "PlatformUnknownException",
            EcsError::ChecksumMismatch { .. } => "ChecksumMismatch",
            EcsError::UnsupportedSecretService { .. } => "UnsupportedSecretService",
            EcsError::Server { .. } => "ServerException",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            EcsError::Server { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for EcsError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(json!({
                "__type": self.type_name(),
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}

impl From<kecs_model::storage::Error> for EcsError {
    fn from(error: kecs_model::storage::Error) -> Self {
        use kecs_model::storage::Error as StorageError;
        match error {
            StorageError::NotFound { kind, .. } => match kind {
                "cluster" => EcsError::ClusterNotFound,
                "service" => EcsError::ServiceNotFound,
                "task definition" => EcsError::TaskDefinitionNotFound,
                _ => EcsError::server(format!("{} disappeared during the call", kind)),
            },
            StorageError::AlreadyExists { kind, name } => EcsError::ResourceInUse {
                message: format!(
                    "The {} '{}' already exists and cannot be created again.",
                    kind, name
                ),
            },
            other => EcsError::server(other.to_string()),
        }
    }
}

impl From<kecs_controller::Error> for EcsError {
    fn from(error: kecs_controller::Error) -> Self {
        use kecs_controller::Error as ControllerError;
        match &error {
            ControllerError::UnsupportedSecretService { .. } => EcsError::UnsupportedSecretService {
                message: error.to_string(),
            },
            ControllerError::InvalidSecretArn { .. }
            | ControllerError::InvalidPermissions { .. }
            | ControllerError::UnsupportedArtifactUrl { .. }
            | ControllerError::InvalidTaskDefinition { .. }
            | ControllerError::InvalidPlacementExpression { .. } => EcsError::InvalidParameter {
                message: error.to_string(),
            },
            _ => EcsError::server(error.to_string()),
        }
    }
}

impl From<kecs_model::Error> for EcsError {
    fn from(error: kecs_model::Error) -> Self {
        EcsError::InvalidParameter {
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_envelope() {
        let error = EcsError::ClusterNotFound;
        assert_eq!(error.type_name(), "ClusterNotFoundException");
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);

        let error = EcsError::server("boom");
        assert_eq!(error.type_name(), "ServerException");
        assert_eq!(error.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn storage_not_found_mapping() {
        let storage_error = kecs_model::storage::Error::NotFound {
            kind: "service",
            name: "web".to_string(),
        };
        assert!(matches!(
            EcsError::from(storage_error),
            EcsError::ServiceNotFound
        ));
    }
}
