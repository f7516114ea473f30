//! HTTP implementations of the outbound traits.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use coldchain_core::http::HttpBoundsTarget;
//! use coldchain_core::{BoundsSynchronizer, RetryPolicy};
//!
//! # fn example() -> coldchain_core::Result<()> {
//! let target = HttpBoundsTarget::new(
//!     "http://control.local/api/update-climate-settings",
//!     Duration::from_secs(10),
//! )?;
//! let sync = BoundsSynchronizer::new(Arc::new(target), RetryPolicy::default());
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use coldchain_types::BoundsPayload;

use crate::alert::Alert;
use crate::error::{Error, PushError, Result};
use crate::traits::{AlertChannel, BoundsTarget};

fn validate_url(url: &str) -> Result<String> {
    let url = url.trim().trim_end_matches('/');
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(Error::invalid_config(format!(
            "URL must start with http:// or https://, got: {}",
            url
        )));
    }
    Ok(url.to_string())
}

fn build_client(timeout: Duration) -> Result<Client> {
    Ok(Client::builder().timeout(timeout).build()?)
}

/// Map a transport failure to a [`PushError`].
///
/// Connect failures and timeouts mean the endpoint could not be reached and
/// are retryable; anything else is terminal.
fn classify(error: reqwest::Error) -> PushError {
    if error.is_connect() || error.is_timeout() {
        PushError::Unreachable(error.to_string())
    } else {
        PushError::Request(error.to_string())
    }
}

fn check_status(response: &reqwest::Response) -> std::result::Result<(), PushError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(PushError::Status(status.as_u16()))
    }
}

/// Sends bounds updates with `PUT` and a JSON body.
#[derive(Debug, Clone)]
pub struct HttpBoundsTarget {
    client: Client,
    endpoint: String,
}

impl HttpBoundsTarget {
    /// Create a target for `endpoint` with a per-request timeout.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            endpoint: validate_url(endpoint)?,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl BoundsTarget for HttpBoundsTarget {
    async fn put_bounds(&self, payload: &BoundsPayload) -> std::result::Result<(), PushError> {
        debug!("PUT {}", self.endpoint);
        let response = self
            .client
            .put(&self.endpoint)
            .json(payload)
            .send()
            .await
            .map_err(classify)?;
        check_status(&response)
    }
}

/// Posts alerts to `{base_url}/api/alerts`.
#[derive(Debug, Clone)]
pub struct HttpAlertChannel {
    client: Client,
    url: String,
}

impl HttpAlertChannel {
    /// Create a channel for the API rooted at `base_url`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = validate_url(base_url)?;
        Ok(Self {
            client: build_client(timeout)?,
            url: format!("{}/api/alerts", base),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl AlertChannel for HttpAlertChannel {
    async fn send_alert(&self, alert: &Alert) -> std::result::Result<(), PushError> {
        debug!("POST {}", self.url);
        let response = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(classify)?;
        check_status(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_http_urls() {
        let result = HttpBoundsTarget::new("ftp://example.com", Duration::from_secs(1));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));

        let result = HttpAlertChannel::new("example.com", Duration::from_secs(1));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_alert_url_joins_base() {
        let channel = HttpAlertChannel::new("http://api.local:3000/", Duration::from_secs(1)).unwrap();
        assert_eq!(channel.url(), "http://api.local:3000/api/alerts");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_retryable() {
        // Port 9 on loopback has no listener in test environments.
        let target =
            HttpBoundsTarget::new("http://127.0.0.1:9/bounds", Duration::from_secs(2)).unwrap();
        let payload = BoundsPayload {
            min_temp: "1".into(),
            max_temp: "2".into(),
            min_humidity: "3".into(),
            max_humidity: "4".into(),
        };
        let err = target.put_bounds(&payload).await.unwrap_err();
        assert!(matches!(err, PushError::Unreachable(_)), "got {err:?}");
    }
}
