use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

use crate::config::Config;

const REQUEST_TIMEOUT: StdDuration = StdDuration::from_secs(30);
const MAX_RATE_LIMIT_RETRIES: usize = 5;
const REDACTED_BODY_MAX_LEN: usize = 200;

pub const MESSAGE_SELECT_FIELDS: &str = concat!(
    "id,internetMessageId,subject,from,toRecipients,ccRecipients,bccRecipients,",
    "bodyPreview,body,importance,isRead,hasAttachments,receivedDateTime,",
    "sentDateTime,categories"
);

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph request timed out")]
    Timeout,

    #[error("graph transport error: {0}")]
    Transport(String),

    #[error("graph rate limit exhausted after {retries} retries")]
    RateLimited { retries: usize },

    #[error("graph request failed: status={status} body={body}")]
    Status { status: u16, body: String },

    #[error("failed to decode graph response: {0}")]
    Decode(String),

    #[error("invalid graph URL: {0}")]
    InvalidUrl(String),
}

impl GraphError {
    /// Timeouts, transport faults, and 5xx responses are worth retrying;
    /// 4xx rejections are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Transport(_) | Self::RateLimited { .. } => true,
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphRecipient {
    #[serde(rename = "emailAddress")]
    pub email_address: Option<GraphEmailAddress>,
}

impl GraphRecipient {
    pub fn address(&self) -> Option<&str> {
        self.email_address
            .as_ref()
            .and_then(|email| email.address.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn name(&self) -> Option<&str> {
        self.email_address
            .as_ref()
            .and_then(|email| email.name.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphEmailAddress {
    pub name: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphBody {
    #[serde(rename = "contentType")]
    pub content_type: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphMessage {
    pub id: Option<String>,
    #[serde(rename = "internetMessageId")]
    pub internet_message_id: Option<String>,
    pub subject: Option<String>,
    pub from: Option<GraphRecipient>,
    #[serde(rename = "toRecipients")]
    pub to_recipients: Option<Vec<GraphRecipient>>,
    #[serde(rename = "ccRecipients")]
    pub cc_recipients: Option<Vec<GraphRecipient>>,
    #[serde(rename = "bccRecipients")]
    pub bcc_recipients: Option<Vec<GraphRecipient>>,
    #[serde(rename = "bodyPreview")]
    pub body_preview: Option<String>,
    pub body: Option<GraphBody>,
    pub importance: Option<String>,
    #[serde(rename = "isRead")]
    pub is_read: Option<bool>,
    #[serde(rename = "hasAttachments")]
    pub has_attachments: Option<bool>,
    #[serde(rename = "receivedDateTime")]
    pub received_date_time: Option<String>,
    #[serde(rename = "sentDateTime")]
    pub sent_date_time: Option<String>,
    pub categories: Option<Vec<String>>,
    #[serde(rename = "@removed")]
    pub removed: Option<GraphRemoved>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphRemoved {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphMessagesPage {
    #[serde(default)]
    pub value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphDeltaPage {
    #[serde(default)]
    pub value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    pub delta_link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphSubscription {
    pub id: String,
    pub resource: Option<String>,
    #[serde(rename = "expirationDateTime")]
    pub expiration_date_time: String,
    #[serde(rename = "clientState")]
    pub client_state: Option<String>,
}

/// Outgoing sendMail payload.
#[derive(Debug, Clone, Serialize)]
pub struct SendMailPayload {
    pub message: SendMailMessage,
    #[serde(rename = "saveToSentItems")]
    pub save_to_sent_items: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendMailMessage {
    pub subject: String,
    pub body: SendMailBody,
    #[serde(rename = "toRecipients")]
    pub to_recipients: Vec<SendMailRecipient>,
    #[serde(rename = "ccRecipients", skip_serializing_if = "Vec::is_empty")]
    pub cc_recipients: Vec<SendMailRecipient>,
    #[serde(rename = "bccRecipients", skip_serializing_if = "Vec::is_empty")]
    pub bcc_recipients: Vec<SendMailRecipient>,
    pub importance: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendMailBody {
    #[serde(rename = "contentType")]
    pub content_type: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendMailRecipient {
    #[serde(rename = "emailAddress")]
    pub email_address: SendMailAddress,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendMailAddress {
    pub address: String,
}

impl SendMailRecipient {
    pub fn new(address: &str) -> Self {
        Self {
            email_address: SendMailAddress {
                address: address.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub resource: String,
    pub notification_url: String,
    pub change_types: Vec<String>,
    pub client_state: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait GraphPort: Send + Sync {
    async fn get_messages(
        &self,
        access_token: &str,
        user_id: &str,
        folder: &str,
        filter: Option<&str>,
        search: Option<&str>,
        top: Option<u32>,
    ) -> Result<GraphMessagesPage, GraphError>;

    /// First delta page for (user, folder). With a stored delta token the
    /// provider returns changes since that token; without one it starts a
    /// full baseline enumeration.
    async fn get_delta_messages(
        &self,
        access_token: &str,
        user_id: &str,
        folder: &str,
        delta_token: Option<&str>,
    ) -> Result<GraphDeltaPage, GraphError>;

    /// Follow an opaque nextLink from a prior delta page.
    async fn get_delta_page(
        &self,
        access_token: &str,
        next_link: &str,
    ) -> Result<GraphDeltaPage, GraphError>;

    /// sendMail returns 202 with an empty body; there is no message id to
    /// hand back.
    async fn send_message(
        &self,
        access_token: &str,
        user_id: &str,
        payload: &SendMailPayload,
    ) -> Result<Option<String>, GraphError>;

    async fn create_subscription(
        &self,
        access_token: &str,
        request: &SubscriptionRequest,
    ) -> Result<GraphSubscription, GraphError>;

    async fn renew_subscription(
        &self,
        access_token: &str,
        subscription_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<GraphSubscription, GraphError>;

    async fn delete_subscription(
        &self,
        access_token: &str,
        subscription_id: &str,
    ) -> Result<(), GraphError>;
}

/// Microsoft Graph implementation of the mail provider port.
pub struct MicrosoftGraphClient {
    client: Client,
    base_url: String,
}

impl MicrosoftGraphClient {
    pub fn new(config: &Config) -> Result<Self, GraphError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| GraphError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.graph_base.trim_end_matches('/').to_string(),
        })
    }

    fn messages_url(&self, user_id: &str, folder: &str) -> String {
        format!(
            "{}/users/{}/mailFolders/{}/messages",
            self.base_url, user_id, folder
        )
    }

    /// Issue a request, retrying on 429 with the provider's Retry-After
    /// hint (exponential fallback when absent).
    async fn request_with_retry(
        &self,
        method: Method,
        url: &str,
        access_token: &str,
        json_body: Option<&serde_json::Value>,
    ) -> Result<(StatusCode, String), GraphError> {
        let mut backoff_seconds = 1u64;

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let mut request = self
                .client
                .request(method.clone(), url)
                .bearer_auth(access_token)
                .header("accept", "application/json");
            if let Some(body) = json_body {
                request = request.json(body);
            }

            let response = request.send().await.map_err(map_transport_error)?;

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if attempt == MAX_RATE_LIMIT_RETRIES {
                    return Err(GraphError::RateLimited {
                        retries: MAX_RATE_LIMIT_RETRIES,
                    });
                }

                let retry_after_seconds = response
                    .headers()
                    .get("retry-after")
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(backoff_seconds);

                warn!(url, retry_after_seconds, "graph rate limited, backing off");
                sleep(StdDuration::from_secs(retry_after_seconds)).await;
                backoff_seconds = (backoff_seconds * 2).min(32);
                continue;
            }

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| GraphError::Decode(e.to_string()))?;

            if !status.is_success() {
                return Err(GraphError::Status {
                    status: status.as_u16(),
                    body: redact_body(&body),
                });
            }

            return Ok((status, body));
        }

        Err(GraphError::RateLimited {
            retries: MAX_RATE_LIMIT_RETRIES,
        })
    }
}

fn map_transport_error(error: reqwest::Error) -> GraphError {
    if error.is_timeout() {
        GraphError::Timeout
    } else {
        GraphError::Transport(error.to_string())
    }
}

fn redact_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= REDACTED_BODY_MAX_LEN {
        trimmed.to_string()
    } else {
        format!(
            "{}…[truncated {} bytes]",
            &trimmed[..REDACTED_BODY_MAX_LEN],
            trimmed.len()
        )
    }
}

/// Pull the `$deltatoken` value out of an opaque deltaLink URL.
pub fn extract_delta_token(delta_link: &str) -> Option<String> {
    let url = Url::parse(delta_link).ok()?;
    url.query_pairs()
        .find(|(key, _)| key == "$deltatoken")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

#[async_trait]
impl GraphPort for MicrosoftGraphClient {
    async fn get_messages(
        &self,
        access_token: &str,
        user_id: &str,
        folder: &str,
        filter: Option<&str>,
        search: Option<&str>,
        top: Option<u32>,
    ) -> Result<GraphMessagesPage, GraphError> {
        let endpoint = self.messages_url(user_id, folder);
        let mut url = Url::parse(&endpoint).map_err(|e| GraphError::InvalidUrl(e.to_string()))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("$select", MESSAGE_SELECT_FIELDS);
            if let Some(filter) = filter {
                pairs.append_pair("$filter", filter);
            }
            if let Some(search) = search {
                pairs.append_pair("$search", &format!("\"{search}\""));
            }
            if let Some(top) = top {
                pairs.append_pair("$top", &top.to_string());
            }
            // $search and $orderby are mutually exclusive in Graph.
            if search.is_none() {
                pairs.append_pair("$orderby", "receivedDateTime desc");
            }
        }

        let (_, body) = self
            .request_with_retry(Method::GET, url.as_str(), access_token, None)
            .await?;
        serde_json::from_str(&body).map_err(|e| GraphError::Decode(e.to_string()))
    }

    async fn get_delta_messages(
        &self,
        access_token: &str,
        user_id: &str,
        folder: &str,
        delta_token: Option<&str>,
    ) -> Result<GraphDeltaPage, GraphError> {
        let endpoint = format!("{}/delta", self.messages_url(user_id, folder));
        let mut url = Url::parse(&endpoint).map_err(|e| GraphError::InvalidUrl(e.to_string()))?;
        {
            let mut pairs = url.query_pairs_mut();
            match delta_token {
                Some(token) => {
                    pairs.append_pair("$deltatoken", token);
                }
                None => {
                    pairs.append_pair("$select", MESSAGE_SELECT_FIELDS);
                }
            }
        }

        let (_, body) = self
            .request_with_retry(Method::GET, url.as_str(), access_token, None)
            .await?;
        serde_json::from_str(&body).map_err(|e| GraphError::Decode(e.to_string()))
    }

    async fn get_delta_page(
        &self,
        access_token: &str,
        next_link: &str,
    ) -> Result<GraphDeltaPage, GraphError> {
        let (_, body) = self
            .request_with_retry(Method::GET, next_link, access_token, None)
            .await?;
        serde_json::from_str(&body).map_err(|e| GraphError::Decode(e.to_string()))
    }

    async fn send_message(
        &self,
        access_token: &str,
        user_id: &str,
        payload: &SendMailPayload,
    ) -> Result<Option<String>, GraphError> {
        let url = format!("{}/users/{}/sendMail", self.base_url, user_id);
        let body =
            serde_json::to_value(payload).map_err(|e| GraphError::Decode(e.to_string()))?;

        self.request_with_retry(Method::POST, &url, access_token, Some(&body))
            .await?;
        Ok(None)
    }

    async fn create_subscription(
        &self,
        access_token: &str,
        request: &SubscriptionRequest,
    ) -> Result<GraphSubscription, GraphError> {
        let url = format!("{}/subscriptions", self.base_url);
        let body = serde_json::json!({
            "changeType": request.change_types.join(","),
            "notificationUrl": request.notification_url,
            "resource": request.resource,
            "expirationDateTime": request.expires_at.to_rfc3339(),
            "clientState": request.client_state,
        });

        let (_, response_body) = self
            .request_with_retry(Method::POST, &url, access_token, Some(&body))
            .await?;
        serde_json::from_str(&response_body).map_err(|e| GraphError::Decode(e.to_string()))
    }

    async fn renew_subscription(
        &self,
        access_token: &str,
        subscription_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<GraphSubscription, GraphError> {
        let url = format!("{}/subscriptions/{}", self.base_url, subscription_id);
        let body = serde_json::json!({
            "expirationDateTime": expires_at.to_rfc3339(),
        });

        let (_, response_body) = self
            .request_with_retry(Method::PATCH, &url, access_token, Some(&body))
            .await?;
        serde_json::from_str(&response_body).map_err(|e| GraphError::Decode(e.to_string()))
    }

    async fn delete_subscription(
        &self,
        access_token: &str,
        subscription_id: &str,
    ) -> Result<(), GraphError> {
        let url = format!("{}/subscriptions/{}", self.base_url, subscription_id);
        self.request_with_retry(Method::DELETE, &url, access_token, None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        extract_delta_token, GraphDeltaPage, GraphError, GraphMessage, SendMailMessage,
        SendMailBody, SendMailPayload, SendMailRecipient,
    };

    #[test]
    fn delta_token_is_extracted_from_delta_link() {
        let link = "https://graph.microsoft.com/v1.0/me/mailFolders('Inbox')/messages/delta?$deltatoken=abc123xyz";
        assert_eq!(extract_delta_token(link).as_deref(), Some("abc123xyz"));

        let with_more = "https://graph.microsoft.com/v1.0/me/messages/delta?$deltatoken=tok-1&$select=id";
        assert_eq!(extract_delta_token(with_more).as_deref(), Some("tok-1"));

        assert!(extract_delta_token("https://graph.microsoft.com/v1.0/me/messages").is_none());
        assert!(extract_delta_token("not a url").is_none());
    }

    #[test]
    fn delta_page_deserializes_odata_fields() {
        let payload = json!({
            "value": [
                { "id": "msg-1", "subject": "Hello", "receivedDateTime": "2026-03-01T09:00:00Z" },
                { "id": "msg-2", "@removed": { "reason": "deleted" } }
            ],
            "@odata.deltaLink": "https://graph.microsoft.com/v1.0/me/messages/delta?$deltatoken=next-token"
        });

        let page: GraphDeltaPage = serde_json::from_value(payload).expect("decode delta page");
        assert_eq!(page.value.len(), 2);
        assert!(page.next_link.is_none());
        assert!(page.value[1].removed.is_some());
        assert_eq!(
            page.delta_link
                .as_deref()
                .and_then(extract_delta_token)
                .as_deref(),
            Some("next-token")
        );
    }

    #[test]
    fn graph_message_recipient_accessors_trim_and_filter() {
        let payload = json!({
            "id": "msg-1",
            "from": { "emailAddress": { "name": "  Alex  ", "address": " alex@example.com " } },
            "toRecipients": [
                { "emailAddress": { "address": "team@example.com" } },
                { "emailAddress": { "address": "  " } }
            ]
        });

        let message: GraphMessage = serde_json::from_value(payload).expect("decode message");
        let from = message.from.expect("from present");
        assert_eq!(from.address(), Some("alex@example.com"));
        assert_eq!(from.name(), Some("Alex"));

        let recipients = message.to_recipients.expect("recipients present");
        let addresses: Vec<_> = recipients.iter().filter_map(|r| r.address()).collect();
        assert_eq!(addresses, vec!["team@example.com"]);
    }

    #[test]
    fn send_payload_serializes_to_graph_shape() {
        let payload = SendMailPayload {
            message: SendMailMessage {
                subject: "Status".to_string(),
                body: SendMailBody {
                    content_type: "html".to_string(),
                    content: "<p>Done</p>".to_string(),
                },
                to_recipients: vec![SendMailRecipient::new("to@example.com")],
                cc_recipients: vec![],
                bcc_recipients: vec![SendMailRecipient::new("bcc@example.com")],
                importance: "normal".to_string(),
            },
            save_to_sent_items: true,
        };

        let value = serde_json::to_value(&payload).expect("serialize payload");
        assert_eq!(value["saveToSentItems"], json!(true));
        assert_eq!(
            value["message"]["toRecipients"][0]["emailAddress"]["address"],
            json!("to@example.com")
        );
        assert_eq!(value["message"]["body"]["contentType"], json!("html"));
        // Empty cc list is omitted entirely.
        assert!(value["message"].get("ccRecipients").is_none());
        assert!(value["message"].get("bccRecipients").is_some());
    }

    #[test]
    fn retryability_follows_error_class() {
        assert!(GraphError::Timeout.is_retryable());
        assert!(GraphError::RateLimited { retries: 5 }.is_retryable());
        assert!(GraphError::Status {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!GraphError::Status {
            status: 403,
            body: String::new()
        }
        .is_retryable());
        assert!(!GraphError::Decode("bad json".to_string()).is_retryable());
    }
}
