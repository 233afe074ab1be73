use log::warn;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY_MS: u64 = 200;

/// Whether a Kubernetes API error is worth retrying. Server-side 5xx responses and transport
/// failures are transient; everything else (4xx, serialization) is not.
pub(crate) fn is_transient(error: &kube::Error) -> bool {
    match error {
        kube::Error::Api(response) => response.code >= 500,
        kube::Error::HyperError(_) | kube::Error::Service(_) => true,
        _ => false,
    }
}

/// Run `operation` with jittered exponential backoff, up to three attempts for transient
/// failures. Non-transient errors surface immediately.
pub(crate) async fn with_backoff<T, F, Fut>(
    description: &str,
    mut operation: F,
) -> std::result::Result<T, kube::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, kube::Error>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < MAX_ATTEMPTS && is_transient(&error) => {
                let jitter = rand::thread_rng().gen_range(0..100);
                let delay =
                    Duration::from_millis(BASE_DELAY_MS * 2u64.pow(attempt - 1) + jitter);
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    description, attempt, MAX_ATTEMPTS, delay, error
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn service_unavailable() -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "unavailable".to_string(),
            reason: "ServiceUnavailable".to_string(),
            code: 503,
        })
    }

    fn not_found() -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors() {
        let attempts = AtomicU32::new(0);
        let result = with_backoff("test op", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(service_unavailable())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_client_errors() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), kube::Error> = with_backoff("test op", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(not_found()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_three_attempts() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), kube::Error> = with_backoff("test op", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(service_unavailable()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
