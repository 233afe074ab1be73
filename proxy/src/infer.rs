use http::header::{AUTHORIZATION, HOST, USER_AGENT};
use http::HeaderMap;

/// User-Agent prefixes that identify an AWS SDK or CLI.
const SDK_SIGNATURES: &[&str] = &["aws-sdk-", "aws-cli", "Boto3", "aws-chalice"];

/// Attribute a request to an AWS service, for metrics and routing. First hit wins:
///
/// 1. the SigV4 credential scope in `Authorization`,
/// 2. the first dotted label of `Host` (unless it is `localhost`/`localstack`),
/// 3. the first dotted label of `X-Amz-Target`, lowercased,
/// 4. the last token of an SDK-shaped `User-Agent`.
pub fn infer_service(headers: &HeaderMap) -> Option<String> {
    from_authorization(headers)
        .or_else(|| from_host(headers))
        .or_else(|| from_target(headers))
        .or_else(|| from_user_agent(headers))
}

/// `Authorization: AWS4-HMAC-SHA256 Credential=KEY/DATE/REGION/SERVICE/aws4_request, …`
fn from_authorization(headers: &HeaderMap) -> Option<String> {
    let authorization = headers.get(AUTHORIZATION)?.to_str().ok()?;
    if !authorization.starts_with("AWS4-HMAC-SHA256") {
        return None;
    }
    let credential = authorization
        .split_once("Credential=")?
        .1
        .split(',')
        .next()?;
    let scope: Vec<&str> = credential.split('/').collect();
    match scope.as_slice() {
        [_key, _date, _region, service, "aws4_request", ..] if !service.is_empty() => {
            Some((*service).to_owned())
        }
        _ => None,
    }
}

fn from_host(headers: &HeaderMap) -> Option<String> {
    let host = headers.get(HOST)?.to_str().ok()?;
    let host = host.split(':').next()?;
    if !host.contains('.') {
        return None;
    }
    let label = host.split('.').next()?;
    if label.is_empty() || label == "localhost" || label == "localstack" {
        return None;
    }
    Some(label.to_owned())
}

/// `X-Amz-Target: DynamoDB_20120810.ListTables` attributes to `dynamodb_20120810`.
fn from_target(headers: &HeaderMap) -> Option<String> {
    let target = headers.get("x-amz-target")?.to_str().ok()?;
    let label = target.split('.').next()?;
    if label.is_empty() {
        return None;
    }
    Some(label.to_lowercase())
}

fn from_user_agent(headers: &HeaderMap) -> Option<String> {
    let user_agent = headers.get(USER_AGENT)?.to_str().ok()?;
    if !SDK_SIGNATURES
        .iter()
        .any(|signature| user_agent.starts_with(signature))
    {
        return None;
    }
    let token = user_agent.split_whitespace().last()?;
    if token.is_empty() || token.contains('/') {
        return None;
    }
    Some(token.to_owned())
}

#[cfg(test)]
mod test {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn sigv4_credential_scope_wins() {
        let map = headers(&[
            (
                "authorization",
                "AWS4-HMAC-SHA256 Credential=test/20230101/us-east-1/s3/aws4_request, \
                 SignedHeaders=host, Signature=abc",
            ),
            ("host", "dynamodb.localhost.localstack.cloud:4566"),
        ]);
        assert_eq!(infer_service(&map).as_deref(), Some("s3"));
    }

    #[test]
    fn host_label() {
        let map = headers(&[("host", "dynamodb.localhost.localstack.cloud:4566")]);
        assert_eq!(infer_service(&map).as_deref(), Some("dynamodb"));
    }

    #[test]
    fn bare_localhost_is_not_a_service() {
        assert_eq!(infer_service(&headers(&[("host", "localhost:4566")])), None);
        assert_eq!(
            infer_service(&headers(&[("host", "localstack.cloud")])),
            None
        );
    }

    #[test]
    fn amz_target_label() {
        let map = headers(&[
            ("host", "localhost:4566"),
            ("x-amz-target", "DynamoDB_20120810.ListTables"),
        ]);
        assert_eq!(infer_service(&map).as_deref(), Some("dynamodb_20120810"));
    }

    #[test]
    fn user_agent_last_token() {
        let map = headers(&[(
            "user-agent",
            "aws-sdk-rust/0.55.3 os/linux lang/rust/1.70.0 sqs",
        )]);
        assert_eq!(infer_service(&map).as_deref(), Some("sqs"));
    }

    #[test]
    fn path_like_user_agent_token_is_rejected() {
        let map = headers(&[("user-agent", "aws-sdk-rust/0.55.3 os/linux lang/rust/1.70.0")]);
        assert_eq!(infer_service(&map), None);
    }

    #[test]
    fn non_sdk_user_agent_is_ignored() {
        let map = headers(&[("user-agent", "curl/8.0.1 sqs")]);
        assert_eq!(infer_service(&map), None);
    }
}
