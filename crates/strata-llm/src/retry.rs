use std::future::Future;
use std::time::Duration;

use crate::error::LlmError;

const BASE_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 30;

/// Parse the `Retry-After` header value as seconds, falling back to capped exponential backoff.
pub(crate) fn retry_delay(response: &reqwest::Response, attempt: u32) -> Duration {
    if let Some(val) = response.headers().get("retry-after")
        && let Ok(s) = val.to_str()
        && let Ok(secs) = s.parse::<u64>()
    {
        return Duration::from_secs(secs.min(MAX_BACKOFF_SECS));
    }
    backoff(attempt)
}

fn backoff(attempt: u32) -> Duration {
    let secs = BASE_BACKOFF_SECS
        .checked_shl(attempt)
        .unwrap_or(MAX_BACKOFF_SECS)
        .min(MAX_BACKOFF_SECS);
    Duration::from_secs(secs)
}

/// Send an embedding request, retrying up to `max_retries` times on 429 responses.
///
/// `f` builds and sends a fresh request on every attempt. Any non-429 response is
/// handed back to the caller untouched so it can map the status itself.
///
/// # Errors
///
/// Returns `LlmError::RateLimited` if all attempts are exhausted, or the underlying
/// `reqwest::Error` wrapped as `LlmError::Http` for transport failures.
pub(crate) async fn send_with_retry<F, Fut>(
    provider_name: &str,
    max_retries: u32,
    mut f: F,
) -> Result<reqwest::Response, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    for attempt in 0..=max_retries {
        let response = f().await.map_err(LlmError::Http)?;

        if response.status() != reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Ok(response);
        }
        if attempt == max_retries {
            break;
        }

        let delay = retry_delay(&response, attempt);
        tracing::warn!(
            provider = provider_name,
            attempt = attempt + 1,
            max_retries,
            delay_secs = delay.as_secs(),
            "embedding provider rate limited, retrying"
        );
        tokio::time::sleep(delay).await;
    }

    Err(LlmError::RateLimited)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spawn_mock_server;

    #[test]
    fn backoff_doubles_until_cap() {
        assert_eq!(backoff(0), Duration::from_secs(1));
        assert_eq!(backoff(1), Duration::from_secs(2));
        assert_eq!(backoff(4), Duration::from_secs(16));
        assert_eq!(backoff(5), Duration::from_secs(MAX_BACKOFF_SECS));
        assert_eq!(backoff(200), Duration::from_secs(MAX_BACKOFF_SECS));
    }

    #[tokio::test]
    async fn passes_through_first_non_429_response() {
        let ok_response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok";
        let (port, _handle) = spawn_mock_server(vec![ok_response.to_owned()]).await;

        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{port}/embeddings");

        let result = send_with_retry("test", 3, || client.get(&url).send()).await;

        assert_eq!(result.unwrap().status(), 200);
    }

    #[tokio::test]
    async fn server_errors_are_not_retried() {
        let error_response = "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
        let (port, _handle) = spawn_mock_server(vec![error_response.to_owned()]).await;

        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{port}/embeddings");

        let result = send_with_retry("test", 3, || client.get(&url).send()).await;

        assert_eq!(result.unwrap().status(), 500);
    }

    #[tokio::test]
    async fn exhausted_retries_return_rate_limited() {
        let rate_limited =
            "HTTP/1.1 429 Too Many Requests\r\nRetry-After: 0\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
        let (port, _handle) =
            spawn_mock_server(vec![rate_limited.to_owned(), rate_limited.to_owned()]).await;

        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{port}/embeddings");

        // attempt 0 gets 429 and retries, attempt 1 gets 429 and gives up
        let result = send_with_retry("test", 1, || client.get(&url).send()).await;

        assert!(
            matches!(result, Err(LlmError::RateLimited)),
            "expected RateLimited, got: {result:?}"
        );
    }

    #[tokio::test]
    async fn recovers_after_single_429() {
        let rate_limited =
            "HTTP/1.1 429 Too Many Requests\r\nRetry-After: 0\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
        let ok_response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok";
        let (port, _handle) =
            spawn_mock_server(vec![rate_limited.to_owned(), ok_response.to_owned()]).await;

        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{port}/embeddings");

        let result = send_with_retry("test", 2, || client.get(&url).send()).await;

        assert_eq!(result.unwrap().status(), 200);
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn backoff_never_exceeds_cap(attempt in 0u32..1000) {
            let delay = backoff(attempt);
            prop_assert!(delay.as_secs() >= BASE_BACKOFF_SECS);
            prop_assert!(delay.as_secs() <= MAX_BACKOFF_SECS);
        }
    }
}
