use crate::error::{self, Result};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, Volume, VolumeMount,
};
use kecs_model::constants::{
    EMULATOR_CREDENTIAL, ENV_AWS_ACCESS_KEY_ID, ENV_AWS_DEFAULT_REGION, ENV_AWS_ENDPOINT_URL_S3,
    ENV_AWS_SECRET_ACCESS_KEY,
};
use kecs_model::{Artifact, ChecksumType, ContainerDefinition};
use snafu::ensure;

/// The image running artifact-download init containers. It carries both the AWS CLI (for
/// `s3://` URLs) and curl (for `http(s)://` URLs).
const DOWNLOADER_IMAGE: &str = "amazon/aws-cli:2.13.33";

/// Where the artifact volume is mounted, in both the init container and the target container.
const ARTIFACTS_MOUNT_PATH: &str = "/artifacts";

/// The staging plan for one container: an init container that downloads the artifacts, the
/// emptyDir volume it downloads into, and the read-only mount the target container gets.
#[derive(Clone, Debug, PartialEq)]
pub struct ArtifactPlan {
    pub init_container: Container,
    pub volume: Volume,
    pub mount: VolumeMount,
}

/// Plans init containers that fetch artifacts from HTTP(S) or object-store URLs into a
/// per-container volume before the task container starts.
#[derive(Clone, Debug, Default)]
pub struct ArtifactStager {
    region: String,
    s3_endpoint: Option<String>,
}

impl ArtifactStager {
    pub fn new<S: Into<String>>(region: S) -> Self {
        Self {
            region: region.into(),
            s3_endpoint: None,
        }
    }

    /// Point `s3://` downloads at the in-cluster emulator proxy instead of real S3.
    pub fn with_s3_endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.s3_endpoint = Some(endpoint.into());
        self
    }

    /// Plan the staging for one container definition. Returns `None` when the container has no
    /// artifacts. The plan is a pure function of the container definition and the stager
    /// configuration, so re-planning an unchanged definition yields identical script text.
    pub fn plan(&self, container: &ContainerDefinition) -> Result<Option<ArtifactPlan>> {
        if container.artifacts.is_empty() {
            return Ok(None);
        }

        let volume_name = format!("artifacts-{}", container.name);
        let script = self.script(&container.artifacts)?;

        let mut env = vec![
            env_var(ENV_AWS_ACCESS_KEY_ID, EMULATOR_CREDENTIAL),
            env_var(ENV_AWS_SECRET_ACCESS_KEY, EMULATOR_CREDENTIAL),
            env_var(ENV_AWS_DEFAULT_REGION, &self.region),
        ];
        if let Some(endpoint) = &self.s3_endpoint {
            env.push(env_var(ENV_AWS_ENDPOINT_URL_S3, endpoint));
        }

        let init_container = Container {
            name: format!("artifact-downloader-{}", container.name),
            image: Some(DOWNLOADER_IMAGE.to_string()),
            command: Some(vec!["sh".to_string(), "-c".to_string(), script]),
            env: Some(env),
            volume_mounts: Some(vec![VolumeMount {
                name: volume_name.clone(),
                mount_path: ARTIFACTS_MOUNT_PATH.to_string(),
                ..VolumeMount::default()
            }]),
            ..Container::default()
        };

        Ok(Some(ArtifactPlan {
            init_container,
            volume: Volume {
                name: volume_name.clone(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Volume::default()
            },
            mount: VolumeMount {
                name: volume_name,
                mount_path: ARTIFACTS_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..VolumeMount::default()
            },
        }))
    }

    /// The shell script the init container runs. Artifacts are fetched in declaration order.
    /// Checksummed artifacts are downloaded to a sibling temp file, verified, and renamed into
    /// place so that a partially written file is never observed at the target path.
    fn script(&self, artifacts: &[Artifact]) -> Result<String> {
        let mut lines = vec!["set -e".to_string()];
        for artifact in artifacts {
            if let Some(permissions) = &artifact.permissions {
                ensure!(
                    u32::from_str_radix(permissions, 8).is_ok(),
                    error::InvalidPermissionsSnafu { permissions }
                );
            }

            let target = format!(
                "{}/{}",
                ARTIFACTS_MOUNT_PATH,
                artifact.target_path.trim_start_matches('/')
            );
            lines.push(format!("mkdir -p \"$(dirname \"{}\")\"", target));

            match &artifact.checksum {
                Some(checksum) => {
                    let temp = format!("{}.download", target);
                    lines.push(fetch_command(&artifact.url, &temp)?);
                    let tool = match artifact.checksum_type {
                        Some(ChecksumType::Md5) => "md5sum",
                        _ => "sha256sum",
                    };
                    lines.push(format!(
                        "echo \"{}  {}\" | {} -c - || {{ echo \"checksum mismatch for {}\" >&2; exit 1; }}",
                        checksum, temp, tool, artifact.url
                    ));
                    lines.push(format!("mv \"{}\" \"{}\"", temp, target));
                }
                None => lines.push(fetch_command(&artifact.url, &target)?),
            }

            if let Some(permissions) = &artifact.permissions {
                lines.push(format!("chmod {} \"{}\"", permissions, target));
            }
        }
        Ok(lines.join("\n"))
    }
}

fn fetch_command(url: &str, target: &str) -> Result<String> {
    if url.starts_with("s3://") {
        Ok(format!("aws s3 cp \"{}\" \"{}\"", url, target))
    } else if url.starts_with("http://") || url.starts_with("https://") {
        Ok(format!("curl -sL \"{}\" -o \"{}\"", url, target))
    } else {
        error::UnsupportedArtifactUrlSnafu { url }.fail()
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_owned(),
        value: Some(value.to_owned()),
        value_from: None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn container_with(artifacts: Vec<Artifact>) -> ContainerDefinition {
        ContainerDefinition {
            name: "app".to_string(),
            image: "busybox".to_string(),
            artifacts,
            ..ContainerDefinition::default()
        }
    }

    #[test]
    fn no_artifacts_no_plan() {
        let stager = ArtifactStager::new("us-east-1");
        assert_eq!(stager.plan(&container_with(Vec::new())).unwrap(), None);
    }

    #[test]
    fn plan_shapes() {
        let stager = ArtifactStager::new("us-east-1").with_s3_endpoint("http://kecs-proxy:4566");
        let plan = stager
            .plan(&container_with(vec![Artifact {
                url: "s3://bucket/config.json".to_string(),
                target_path: "config/config.json".to_string(),
                ..Artifact::default()
            }]))
            .unwrap()
            .unwrap();

        assert_eq!(plan.init_container.name, "artifact-downloader-app");
        assert_eq!(plan.volume.name, "artifacts-app");
        assert!(plan.volume.empty_dir.is_some());
        assert_eq!(plan.mount.mount_path, "/artifacts");
        assert_eq!(plan.mount.read_only, Some(true));

        let script = &plan.init_container.command.as_ref().unwrap()[2];
        assert!(script.contains("aws s3 cp \"s3://bucket/config.json\" \"/artifacts/config/config.json\""));
        let env = plan.init_container.env.as_ref().unwrap();
        assert!(env
            .iter()
            .any(|e| e.name == "AWS_ENDPOINT_URL_S3"
                && e.value.as_deref() == Some("http://kecs-proxy:4566")));
    }

    #[test]
    fn checksum_uses_temp_file_then_rename() {
        let stager = ArtifactStager::new("us-east-1");
        let plan = stager
            .plan(&container_with(vec![Artifact {
                url: "https://example.com/tool".to_string(),
                target_path: "bin/tool".to_string(),
                permissions: Some("0755".to_string()),
                checksum: Some("abc123".to_string()),
                checksum_type: Some(ChecksumType::Sha256),
                ..Artifact::default()
            }]))
            .unwrap()
            .unwrap();
        let script = &plan.init_container.command.as_ref().unwrap()[2];
        assert!(script.contains("curl -sL \"https://example.com/tool\" -o \"/artifacts/bin/tool.download\""));
        assert!(script.contains("sha256sum -c -"));
        assert!(script.contains("mv \"/artifacts/bin/tool.download\" \"/artifacts/bin/tool\""));
        assert!(script.contains("chmod 0755 \"/artifacts/bin/tool\""));
        // chmod happens after the rename
        assert!(script.find("mv ").unwrap() < script.find("chmod").unwrap());
    }

    #[test]
    fn replanning_is_byte_identical() {
        let stager = ArtifactStager::new("us-east-1");
        let container = container_with(vec![
            Artifact {
                url: "https://example.com/a".to_string(),
                target_path: "a".to_string(),
                ..Artifact::default()
            },
            Artifact {
                url: "s3://bucket/b".to_string(),
                target_path: "b".to_string(),
                ..Artifact::default()
            },
        ]);
        let first = stager.plan(&container).unwrap().unwrap();
        let second = stager.plan(&container).unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn bad_permissions() {
        let stager = ArtifactStager::new("us-east-1");
        let err = stager
            .plan(&container_with(vec![Artifact {
                url: "https://example.com/a".to_string(),
                target_path: "a".to_string(),
                permissions: Some("rwxr-xr-x".to_string()),
                ..Artifact::default()
            }]))
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::InvalidPermissions { .. }));
    }

    #[test]
    fn unsupported_scheme() {
        let stager = ArtifactStager::new("us-east-1");
        let err = stager
            .plan(&container_with(vec![Artifact {
                url: "ftp://example.com/a".to_string(),
                target_path: "a".to_string(),
                ..Artifact::default()
            }]))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::UnsupportedArtifactUrl { .. }
        ));
    }
}
