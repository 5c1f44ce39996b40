//! Shared HTTP client construction for embedding providers.

use std::time::Duration;

/// Build the HTTP client used by remote embedding providers.
///
/// Config: 30s connect timeout, `request_timeout` per request, rustls TLS,
/// `strata/{version}` user-agent, redirect limit 10.
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialised.
pub fn embedding_client(request_timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .timeout(request_timeout)
        .user_agent(concat!("strata/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
}
