use crate::error::{self, Result};
use regex::Regex;
use snafu::ensure;

lazy_static::lazy_static! {
    /// The random six-character suffix Secrets Manager appends to secret names.
    static ref SM_SUFFIX: Regex = {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"-[A-Za-z0-9]{6}$").unwrap()
    };
}

/// Which AWS service a resolved secret comes from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SecretSource {
    SecretsManager,
    Ssm,
}

/// A `secrets[*].valueFrom` ARN resolved to a cluster-local Kubernetes Secret reference.
///
/// Secrets are always projected as cluster-level `Secret` objects regardless of their
/// sensitivity; a Parameter Store plain-text parameter does not become a ConfigMap.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolvedSecret {
    pub source: SecretSource,
    /// The name of the secret in its source service, e.g. `db-password-AbCdEf` or `app/config`.
    pub secret_name: String,
    /// The key within the Kubernetes Secret's data. A Secrets Manager JSON key when one was
    /// requested, the literal `value` otherwise.
    pub key: String,
    /// The name of the Kubernetes Secret holding the value.
    pub local_name: String,
}

/// Resolve a Secrets Manager or Parameter Store ARN from a container's `secrets` list.
///
/// Secrets Manager ARNs look like
/// `arn:aws:secretsmanager:REGION:ACCT:secret:NAME-XXXXXX[:JSONKEY::]`; Parameter Store ARNs
/// look like `arn:aws:ssm:REGION:ACCT:parameter/PATH`.
pub fn resolve_secret_arn(value_from: &str) -> Result<ResolvedSecret> {
    let parts: Vec<&str> = value_from.splitn(6, ':').collect();
    ensure!(
        parts.len() == 6 && parts[0] == "arn",
        error::InvalidSecretArnSnafu {
            arn: value_from,
            reason: "fewer than six colon-separated fields",
        }
    );

    match parts[2] {
        "secretsmanager" => resolve_secretsmanager(value_from, parts[5]),
        "ssm" => resolve_ssm(value_from, parts[5]),
        service => error::UnsupportedSecretServiceSnafu {
            arn: value_from,
            service,
        }
        .fail(),
    }
}

fn resolve_secretsmanager(arn: &str, resource: &str) -> Result<ResolvedSecret> {
    // resource is `secret:NAME-XXXXXX[:JSONKEY[:VERSION-STAGE[:VERSION-ID]]]`
    let mut fields = resource.split(':');
    ensure!(
        fields.next() == Some("secret"),
        error::InvalidSecretArnSnafu {
            arn,
            reason: "expected a 'secret' resource",
        }
    );
    let secret_name = fields.next().unwrap_or_default();
    ensure!(
        !secret_name.is_empty(),
        error::InvalidSecretArnSnafu {
            arn,
            reason: "missing secret name",
        }
    );
    let key = match fields.next() {
        Some(json_key) if !json_key.is_empty() && json_key != "*" => json_key.to_owned(),
        _ => "value".to_owned(),
    };
    Ok(ResolvedSecret {
        source: SecretSource::SecretsManager,
        secret_name: secret_name.to_owned(),
        key,
        local_name: local_name("sm", &SM_SUFFIX.replace(secret_name, "")),
    })
}

fn resolve_ssm(arn: &str, resource: &str) -> Result<ResolvedSecret> {
    // resource is `parameter/PATH`
    let path = resource
        .strip_prefix("parameter/")
        .or_else(|| resource.strip_prefix("parameter"))
        .unwrap_or_default()
        .trim_start_matches('/');
    ensure!(
        !path.is_empty(),
        error::InvalidSecretArnSnafu {
            arn,
            reason: "missing parameter path",
        }
    );
    Ok(ResolvedSecret {
        source: SecretSource::Ssm,
        secret_name: path.to_owned(),
        key: "value".to_owned(),
        local_name: local_name("ssm", path),
    })
}

/// Cluster-local Secret name: lowercase, `/` and `_` become `-`, prefixed by the source.
fn local_name(prefix: &str, name: &str) -> String {
    format!("{}-{}", prefix, name.to_lowercase().replace(['/', '_'], "-"))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::Error;

    #[test]
    fn secretsmanager_without_json_key() {
        let resolved =
            resolve_secret_arn("arn:aws:secretsmanager:us-east-1:1:secret:db-password-AbCdEf")
                .unwrap();
        assert_eq!(resolved.source, SecretSource::SecretsManager);
        assert_eq!(resolved.secret_name, "db-password-AbCdEf");
        assert_eq!(resolved.key, "value");
        assert_eq!(resolved.local_name, "sm-db-password");
    }

    #[test]
    fn secretsmanager_with_json_key() {
        let resolved =
            resolve_secret_arn("arn:aws:secretsmanager:us-east-1:1:secret:api-keys-XyZ123:api_key::")
                .unwrap();
        assert_eq!(resolved.secret_name, "api-keys-XyZ123");
        assert_eq!(resolved.key, "api_key");
        assert_eq!(resolved.local_name, "sm-api-keys");
    }

    #[test]
    fn secretsmanager_wildcard_key_means_whole_value() {
        let resolved =
            resolve_secret_arn("arn:aws:secretsmanager:us-east-1:1:secret:api-keys-XyZ123:*::")
                .unwrap();
        assert_eq!(resolved.key, "value");
    }

    #[test]
    fn ssm_parameter_path() {
        let resolved = resolve_secret_arn("arn:aws:ssm:us-east-1:1:parameter/app/config").unwrap();
        assert_eq!(resolved.source, SecretSource::Ssm);
        assert_eq!(resolved.secret_name, "app/config");
        assert_eq!(resolved.key, "value");
        assert_eq!(resolved.local_name, "ssm-app-config");
    }

    #[test]
    fn underscores_become_dashes() {
        let resolved =
            resolve_secret_arn("arn:aws:ssm:us-east-1:1:parameter/app_env/db_url").unwrap();
        assert_eq!(resolved.local_name, "ssm-app-env-db-url");
    }

    #[test]
    fn unsupported_service() {
        let err = resolve_secret_arn("arn:aws:kms:us-east-1:1:key/abc").unwrap_err();
        assert!(matches!(err, Error::UnsupportedSecretService { .. }));
    }

    #[test]
    fn malformed_arn() {
        let err = resolve_secret_arn("not-an-arn").unwrap_err();
        assert!(matches!(err, Error::InvalidSecretArn { .. }));
    }
}
