use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("forwarding to {endpoint} timed out")]
    Timeout { endpoint: String },

    #[error("forwarding transport error: {0}")]
    Transport(String),

    #[error("forwarding endpoint returned status {status}")]
    Status { status: u16, body: String },
}

impl ForwardError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Transport(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForwardResponse {
    pub status: u16,
    pub body: String,
}

/// Delivery port for handing collected messages to the downstream system.
#[async_trait]
pub trait ForwardPort: Send + Sync {
    async fn send_mail_data(
        &self,
        endpoint: &str,
        payload: &serde_json::Value,
    ) -> Result<ForwardResponse, ForwardError>;
}

pub struct HttpForwardClient {
    client: Client,
}

impl HttpForwardClient {
    pub fn new(timeout: Duration) -> Result<Self, ForwardError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ForwardError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ForwardPort for HttpForwardClient {
    async fn send_mail_data(
        &self,
        endpoint: &str,
        payload: &serde_json::Value,
    ) -> Result<ForwardResponse, ForwardError> {
        let response = self
            .client
            .post(endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ForwardError::Timeout {
                        endpoint: endpoint.to_string(),
                    }
                } else {
                    ForwardError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ForwardError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(ForwardError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(ForwardResponse {
            status: status.as_u16(),
            body,
        })
    }
}
