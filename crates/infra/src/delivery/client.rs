//! Outbound HTTP delivery.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use hookrelay_core::FailureReason;

/// Issues the single POST of a delivery attempt.
///
/// `Ok` means the endpoint accepted the request. 4xx and 5xx responses come
/// back as [`DeliveryError::Status`].
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    async fn post(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: String,
    ) -> Result<u16, DeliveryError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    /// The endpoint answered with a 4xx or 5xx status.
    #[error("endpoint responded {code}: {message}")]
    Status { code: u16, message: String },
    /// Connection, TLS, DNS or read failure, including client-side timeouts.
    #[error("transport error: {0}")]
    Transport(String),
    /// Anything else, such as a request that could not be built.
    #[error("delivery error: {0}")]
    Other(String),
}

impl DeliveryError {
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            DeliveryError::Status { code, .. } if (400..500).contains(code) => {
                FailureReason::ClientError
            }
            DeliveryError::Status { .. } | DeliveryError::Transport(_) => {
                FailureReason::ExternalServiceUnavailable
            }
            DeliveryError::Other(_) => FailureReason::Unknown,
        }
    }
}

/// `reqwest`-backed delivery client.
#[derive(Debug, Clone)]
pub struct ReqwestDeliveryClient {
    client: reqwest::Client,
}

impl ReqwestDeliveryClient {
    /// `timeout` bounds the whole request, connect through body.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeliveryClient for ReqwestDeliveryClient {
    async fn post(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: String,
    ) -> Result<u16, DeliveryError> {
        let mut request = self.client.post(url);
        if !headers.keys().any(|name| name.eq_ignore_ascii_case(CONTENT_TYPE.as_str())) {
            request = request.header(CONTENT_TYPE, "application/json");
        }
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.body(body).send().await.map_err(classify_reqwest)?;
        let status = response.status();
        debug!(url, status = status.as_u16(), "delivery response");

        if status.is_client_error() || status.is_server_error() {
            let message = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(512)
                .collect::<String>();
            let message = if message.is_empty() {
                status.canonical_reason().unwrap_or("error").to_string()
            } else {
                message
            };
            return Err(DeliveryError::Status {
                code: status.as_u16(),
                message,
            });
        }

        Ok(status.as_u16())
    }
}

fn classify_reqwest(err: reqwest::Error) -> DeliveryError {
    if err.is_builder() {
        DeliveryError::Other(err.to_string())
    } else {
        DeliveryError::Transport(err.to_string())
    }
}
