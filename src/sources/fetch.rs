use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

/// Outcome of a single failed download attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// 404; retrying cannot help.
    #[error("not found")]
    NotFound,
    /// Connect errors, timeouts, 429 and 5xx.
    #[error("{0}")]
    Transient(String),
    /// Any other rejection from the remote end.
    #[error("{0}")]
    Fatal(String),
}

/// Single-attempt download. Retries are the resolver's job.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(attempt_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("pandemic/", env!("CARGO_PKG_VERSION")))
            .timeout(attempt_timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        debug!(url = %url, "Downloading");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound);
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(FetchError::Transient(format!("server returned {status}")));
        }
        if !status.is_success() {
            return Err(FetchError::Fatal(format!("server returned {status}")));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transient(format!("failed to read body: {e}")))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_error_is_a_std_error() {
        let err: Box<dyn std::error::Error> = Box::new(FetchError::Fatal("server returned 403".into()));
        assert_eq!(err.to_string(), "server returned 403");
        assert_eq!(FetchError::NotFound.to_string(), "not found");
    }
}
