use crate::error::{self, Error, Result};
use serde::{Deserialize, Serialize};
use snafu::ensure;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// The AWS services whose ARNs this control plane understands. Anything else is rejected as
/// invalid so that a typo in a request fails loudly instead of producing a half-translated
/// Kubernetes object.
const KNOWN_SERVICES: &[&str] = &[
    "ecs",
    "elasticloadbalancing",
    "iam",
    "logs",
    "s3",
    "secretsmanager",
    "ssm",
];

/// A parsed Amazon Resource Name.
///
/// The resource portion of an ARN is service-specific: most services separate the resource type
/// from its path with `/`, while Secrets Manager uses `:`. `Arn` remembers the parsed pieces and
/// re-joins them with the separator its service uses, so `parse` followed by `to_string` is
/// lossless for every service in [`KNOWN_SERVICES`].
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Arn {
    pub partition: String,
    pub service: String,
    pub region: String,
    pub account_id: String,
    pub resource_type: Option<String>,
    pub resource_path: String,
}

impl Arn {
    /// Parse an ARN of the form `arn:partition:service:region:account-id:resource`.
    pub fn parse(s: &str) -> Result<Arn> {
        let parts: Vec<&str> = s.splitn(6, ':').collect();
        ensure!(
            parts.len() == 6,
            error::InvalidArnSnafu {
                arn: s,
                reason: "fewer than six colon-separated fields",
            }
        );
        ensure!(
            parts[0] == "arn",
            error::InvalidArnSnafu {
                arn: s,
                reason: "does not start with 'arn'",
            }
        );
        let service = parts[2];
        ensure!(
            KNOWN_SERVICES.contains(&service),
            error::UnknownArnServiceSnafu { arn: s, service }
        );
        ensure!(
            !parts[5].is_empty(),
            error::InvalidArnSnafu {
                arn: s,
                reason: "empty resource field",
            }
        );

        let (resource_type, resource_path) = split_resource(parts[5]);
        Ok(Arn {
            partition: parts[1].to_owned(),
            service: service.to_owned(),
            region: parts[3].to_owned(),
            account_id: parts[4].to_owned(),
            resource_type,
            resource_path,
        })
    }

    /// The final `/`-delimited segment of the resource path. For
    /// `arn:aws:ecs:…:service/default/web` this is `web`.
    pub fn resource_name(&self) -> &str {
        self.resource_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.resource_path)
    }

    /// The role name of an IAM role ARN, if this is one.
    pub fn iam_role_name(&self) -> Option<&str> {
        if self.service == "iam" && self.resource_type.as_deref() == Some("role") {
            Some(self.resource_name())
        } else {
            None
        }
    }

    /// The separator between the resource type and path for this ARN's service.
    fn separator(&self) -> char {
        if self.service == "secretsmanager" {
            ':'
        } else {
            '/'
        }
    }

    pub fn ecs_cluster(region: &str, account_id: &str, name: &str) -> String {
        format!("arn:aws:ecs:{}:{}:cluster/{}", region, account_id, name)
    }

    pub fn ecs_service(region: &str, account_id: &str, cluster: &str, service: &str) -> String {
        format!(
            "arn:aws:ecs:{}:{}:service/{}/{}",
            region, account_id, cluster, service
        )
    }

    pub fn ecs_task(region: &str, account_id: &str, cluster: &str, task_id: &str) -> String {
        format!(
            "arn:aws:ecs:{}:{}:task/{}/{}",
            region, account_id, cluster, task_id
        )
    }

    pub fn ecs_task_definition(
        region: &str,
        account_id: &str,
        family: &str,
        revision: i64,
    ) -> String {
        format!(
            "arn:aws:ecs:{}:{}:task-definition/{}:{}",
            region, account_id, family, revision
        )
    }

    pub fn ecs_task_set(
        region: &str,
        account_id: &str,
        cluster: &str,
        service: &str,
        id: &str,
    ) -> String {
        format!(
            "arn:aws:ecs:{}:{}:task-set/{}/{}/{}",
            region, account_id, cluster, service, id
        )
    }
}

/// Split the resource field at the first `/` or `:`, whichever comes first. Resources without
/// either separator have no resource type.
fn split_resource(resource: &str) -> (Option<String>, String) {
    match resource.find(|c| c == '/' || c == ':') {
        Some(idx) => (
            Some(resource[..idx].to_owned()),
            resource[idx + 1..].to_owned(),
        ),
        None => (None, resource.to_owned()),
    }
}

impl Display for Arn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "arn:{}:{}:{}:{}:",
            self.partition, self.service, self.region, self.account_id
        )?;
        match &self.resource_type {
            Some(resource_type) => write!(
                f,
                "{}{}{}",
                resource_type,
                self.separator(),
                self.resource_path
            ),
            None => write!(f, "{}", self.resource_path),
        }
    }
}

impl FromStr for Arn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Arn::parse(s)
    }
}
