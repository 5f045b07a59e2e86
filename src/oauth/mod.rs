use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use reqwest::{Client, StatusCode, Url};
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::models::{Account, AuthCodeAccount};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const STATE_BYTES: usize = 24;
const VERIFIER_BYTES: usize = 32;
const REDACTED_BODY_MAX_LEN: usize = 200;

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("identity provider request timed out")]
    Timeout,

    #[error("identity provider transport error: {0}")]
    Transport(String),

    #[error("identity provider rejected request: {error_code}: {description}")]
    Provider {
        status: u16,
        error_code: String,
        description: String,
    },

    #[error("device authorization failed: {error_code}: {description}")]
    DeviceAuthorizationFailed {
        error_code: String,
        description: String,
    },

    #[error("failed to decode identity provider response: {0}")]
    Decode(String),

    #[error("invalid endpoint URL: {0}")]
    InvalidUrl(String),

    #[error("failed to generate random material")]
    Rng,
}

impl OAuthError {
    /// Timeouts and transport faults may succeed on retry; provider
    /// rejections will not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transport(_))
    }
}

/// Raw token material returned by a successful exchange, poll, or refresh.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expires_in: i64,
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Response from the device-code initiation endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: i64,
    pub interval: Option<i64>,
}

/// Outcome of one device-token poll. Pending and slow-down are expected
/// workflow states, not errors; callers branch on the variant.
#[derive(Debug, Clone)]
pub enum DevicePoll {
    Pending,
    SlowDown,
    Authorized(TokenGrant),
}

/// Authorization URL plus the per-attempt correlation material the caller
/// must persist until the callback arrives.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
    pub code_verifier: String,
}

#[async_trait]
pub trait OAuthPort: Send + Sync {
    /// Build the authorization URL for the code flow, generating a fresh
    /// state token and PKCE verifier per attempt. No network I/O.
    fn build_authorization_url(
        &self,
        account: &Account,
        auth: &AuthCodeAccount,
    ) -> Result<AuthorizationRequest, OAuthError>;

    async fn exchange_code(
        &self,
        account: &Account,
        auth: &AuthCodeAccount,
        code: &str,
        code_verifier: &str,
    ) -> Result<TokenGrant, OAuthError>;

    async fn begin_device_flow(&self, account: &Account)
        -> Result<DeviceAuthorization, OAuthError>;

    async fn poll_device_code(
        &self,
        account: &Account,
        device_code: &str,
    ) -> Result<DevicePoll, OAuthError>;

    async fn refresh(
        &self,
        account: &Account,
        client_secret: Option<&str>,
        refresh_token: &str,
        scopes: &[String],
    ) -> Result<TokenGrant, OAuthError>;

    /// Best-effort upstream revocation. Returns whether the provider
    /// confirmed the revocation.
    async fn revoke(&self, access_token: &str) -> Result<bool, OAuthError>;
}

/// Microsoft identity platform implementation of the OAuth port.
pub struct MicrosoftOAuthClient {
    client: Client,
    authority: String,
    graph_base: String,
    rng: SystemRandom,
}

#[derive(Debug, Deserialize)]
struct ProviderError {
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RevokeResponse {
    value: Option<bool>,
}

impl MicrosoftOAuthClient {
    pub fn new(config: &Config) -> Result<Self, OAuthError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| OAuthError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            authority: config.authority.trim_end_matches('/').to_string(),
            graph_base: config.graph_base.trim_end_matches('/').to_string(),
            rng: SystemRandom::new(),
        })
    }

    fn authorize_endpoint(&self, tenant_id: &str) -> String {
        format!("{}/{}/oauth2/v2.0/authorize", self.authority, tenant_id)
    }

    fn token_endpoint(&self, tenant_id: &str) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.authority, tenant_id)
    }

    fn device_code_endpoint(&self, tenant_id: &str) -> String {
        format!("{}/{}/oauth2/v2.0/devicecode", self.authority, tenant_id)
    }

    fn random_urlsafe(&self, bytes: usize) -> Result<String, OAuthError> {
        let mut buffer = vec![0u8; bytes];
        self.rng.fill(&mut buffer).map_err(|_| OAuthError::Rng)?;
        Ok(URL_SAFE_NO_PAD.encode(buffer))
    }

    async fn post_token_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<TokenGrant, OAuthError> {
        let response = self
            .client
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| OAuthError::Decode(e.to_string()))?;

        if !status.is_success() {
            return Err(provider_error(status, &body));
        }

        serde_json::from_str(&body).map_err(|e| OAuthError::Decode(e.to_string()))
    }
}

fn map_transport_error(error: reqwest::Error) -> OAuthError {
    if error.is_timeout() {
        OAuthError::Timeout
    } else {
        OAuthError::Transport(error.to_string())
    }
}

fn provider_error(status: StatusCode, body: &str) -> OAuthError {
    let parsed: Option<ProviderError> = serde_json::from_str(body).ok();
    let (error_code, description) = match parsed {
        Some(err) => (
            err.error.unwrap_or_else(|| "unknown_error".to_string()),
            err.error_description
                .unwrap_or_else(|| redact_body(body)),
        ),
        None => ("unknown_error".to_string(), redact_body(body)),
    };
    OAuthError::Provider {
        status: status.as_u16(),
        error_code,
        description,
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

/// S256 code challenge for a PKCE verifier.
fn pkce_challenge(verifier: &str) -> String {
    let hash = digest::digest(&digest::SHA256, verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash.as_ref())
}

#[async_trait]
impl OAuthPort for MicrosoftOAuthClient {
    fn build_authorization_url(
        &self,
        account: &Account,
        auth: &AuthCodeAccount,
    ) -> Result<AuthorizationRequest, OAuthError> {
        let state = self.random_urlsafe(STATE_BYTES)?;
        let code_verifier = self.random_urlsafe(VERIFIER_BYTES)?;
        let code_challenge = pkce_challenge(&code_verifier);
        let scope = account.scopes.join(" ");

        let endpoint = self.authorize_endpoint(&account.tenant_id);
        let mut url =
            Url::parse(&endpoint).map_err(|e| OAuthError::InvalidUrl(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("client_id", &account.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", &auth.redirect_uri)
            .append_pair("scope", &scope)
            .append_pair("state", &state)
            .append_pair("code_challenge", &code_challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("response_mode", "query");

        info!(
            account_id = %account.id,
            client_id = %account.client_id,
            "generated authorization URL"
        );

        Ok(AuthorizationRequest {
            url: url.to_string(),
            state,
            code_verifier,
        })
    }

    async fn exchange_code(
        &self,
        account: &Account,
        auth: &AuthCodeAccount,
        code: &str,
        code_verifier: &str,
    ) -> Result<TokenGrant, OAuthError> {
        let scope = account.scopes.join(" ");
        let token_url = self.token_endpoint(&account.tenant_id);

        let grant = self
            .post_token_form(
                &token_url,
                &[
                    ("client_id", account.client_id.as_str()),
                    ("client_secret", auth.client_secret.as_str()),
                    ("code", code),
                    ("redirect_uri", auth.redirect_uri.as_str()),
                    ("grant_type", "authorization_code"),
                    ("code_verifier", code_verifier),
                    ("scope", scope.as_str()),
                ],
            )
            .await?;

        info!(
            account_id = %account.id,
            has_refresh_token = grant.refresh_token.is_some(),
            "exchanged authorization code for token"
        );
        Ok(grant)
    }

    async fn begin_device_flow(
        &self,
        account: &Account,
    ) -> Result<DeviceAuthorization, OAuthError> {
        let scope = account.scopes.join(" ");
        let url = self.device_code_endpoint(&account.tenant_id);

        let response = self
            .client
            .post(&url)
            .form(&[
                ("client_id", account.client_id.as_str()),
                ("scope", scope.as_str()),
            ])
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| OAuthError::Decode(e.to_string()))?;
        if !status.is_success() {
            return Err(provider_error(status, &body));
        }

        let authorization: DeviceAuthorization =
            serde_json::from_str(&body).map_err(|e| OAuthError::Decode(e.to_string()))?;

        info!(
            account_id = %account.id,
            user_code = %authorization.user_code,
            verification_uri = %authorization.verification_uri,
            "initiated device code flow"
        );
        Ok(authorization)
    }

    async fn poll_device_code(
        &self,
        account: &Account,
        device_code: &str,
    ) -> Result<DevicePoll, OAuthError> {
        let token_url = self.token_endpoint(&account.tenant_id);

        let response = self
            .client
            .post(&token_url)
            .form(&[
                ("client_id", account.client_id.as_str()),
                ("grant_type", DEVICE_CODE_GRANT),
                ("device_code", device_code),
            ])
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| OAuthError::Decode(e.to_string()))?;

        if status.is_success() {
            let grant: TokenGrant =
                serde_json::from_str(&body).map_err(|e| OAuthError::Decode(e.to_string()))?;
            info!(account_id = %account.id, "device authorization completed");
            return Ok(DevicePoll::Authorized(grant));
        }

        if status == StatusCode::BAD_REQUEST {
            let parsed: ProviderError =
                serde_json::from_str(&body).map_err(|e| OAuthError::Decode(e.to_string()))?;
            let error_code = parsed.error.unwrap_or_else(|| "unknown_error".to_string());
            let description = parsed.error_description.unwrap_or_default();

            return match error_code.as_str() {
                "authorization_pending" => Ok(DevicePoll::Pending),
                "slow_down" => {
                    warn!(account_id = %account.id, "device polling rate limited");
                    Ok(DevicePoll::SlowDown)
                }
                // Terminal states; the flow cannot continue with this
                // device code.
                "authorization_declined" | "bad_verification_code" | "expired_token" => {
                    Err(OAuthError::DeviceAuthorizationFailed {
                        error_code,
                        description,
                    })
                }
                _ => Err(OAuthError::Provider {
                    status: status.as_u16(),
                    error_code,
                    description,
                }),
            };
        }

        Err(provider_error(status, &body))
    }

    async fn refresh(
        &self,
        account: &Account,
        client_secret: Option<&str>,
        refresh_token: &str,
        scopes: &[String],
    ) -> Result<TokenGrant, OAuthError> {
        let scope = scopes.join(" ");
        let token_url = self.token_endpoint(&account.tenant_id);

        let mut form: Vec<(&str, &str)> = vec![
            ("client_id", account.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("scope", scope.as_str()),
        ];
        if let Some(secret) = client_secret {
            form.push(("client_secret", secret));
        }

        let grant = self.post_token_form(&token_url, &form).await?;
        info!(
            account_id = %account.id,
            rotated_refresh_token = grant.refresh_token.is_some(),
            "refreshed access token"
        );
        Ok(grant)
    }

    async fn revoke(&self, access_token: &str) -> Result<bool, OAuthError> {
        // Microsoft has no token revocation endpoint; revoking sign-in
        // sessions invalidates the refresh tokens for the user.
        let url = format!("{}/me/revokeSignInSessions", self.graph_base);

        let response = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| OAuthError::Decode(e.to_string()))?;

        if !status.is_success() {
            warn!(status = %status, "upstream session revocation failed");
            return Ok(false);
        }

        let parsed: RevokeResponse =
            serde_json::from_str(&body).map_err(|e| OAuthError::Decode(e.to_string()))?;
        Ok(parsed.value.unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{pkce_challenge, MicrosoftOAuthClient, OAuthError, OAuthPort};
    use crate::config::{Config, SchedulerConfig};
    use crate::db::models::{Account, AccountStatus, AuthCodeAccount, AuthenticationFlow};

    fn test_config() -> Config {
        Config {
            database_path: std::env::temp_dir().join("mailgate-oauth-test.db"),
            tenant_id: "tenant-a".to_string(),
            client_id: "client-a".to_string(),
            client_secret: "secret-a".to_string(),
            redirect_uri: "http://localhost:8000/auth/callback".to_string(),
            authority: "https://login.microsoftonline.com".to_string(),
            graph_base: "https://graph.microsoft.com/v1.0".to_string(),
            scopes: vec!["offline_access".to_string(), "Mail.Read".to_string()],
            encryption_key: "key".to_string(),
            encryption_salt: "salt".to_string(),
            forward_url: None,
            forward_timeout: std::time::Duration::from_secs(30),
            max_forward_retries: 3,
            scheduler: SchedulerConfig::default(),
        }
    }

    fn account() -> Account {
        Account {
            id: "acc-1".to_string(),
            email: "owner@example.com".to_string(),
            user_id: "user-1".to_string(),
            tenant_id: "tenant-a".to_string(),
            client_id: "client-a".to_string(),
            authentication_flow: AuthenticationFlow::AuthorizationCode,
            status: AccountStatus::Active,
            scopes: vec!["offline_access".to_string(), "Mail.Read".to_string()],
            created_at: Utc::now(),
            updated_at: None,
            last_authenticated_at: None,
        }
    }

    fn auth_account() -> AuthCodeAccount {
        AuthCodeAccount {
            account_id: "acc-1".to_string(),
            client_secret: "secret-a".to_string(),
            redirect_uri: "http://localhost:8000/auth/callback".to_string(),
            authority: "https://login.microsoftonline.com/tenant-a".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn authorization_url_carries_client_id_state_and_challenge() {
        let client = MicrosoftOAuthClient::new(&test_config()).expect("build client");
        let request = client
            .build_authorization_url(&account(), &auth_account())
            .expect("build authorization url");

        assert!(request
            .url
            .starts_with("https://login.microsoftonline.com/tenant-a/oauth2/v2.0/authorize?"));
        assert!(request.url.contains("client_id=client-a"));
        assert!(request.url.contains(&format!("state={}", request.state)));
        assert!(request.url.contains("code_challenge_method=S256"));
        assert!(request.url.contains("response_type=code"));
        // The raw verifier must never appear in the URL.
        assert!(!request.url.contains(&request.code_verifier));
    }

    #[test]
    fn each_attempt_gets_fresh_state_and_verifier() {
        let client = MicrosoftOAuthClient::new(&test_config()).expect("build client");
        let first = client
            .build_authorization_url(&account(), &auth_account())
            .expect("first attempt");
        let second = client
            .build_authorization_url(&account(), &auth_account())
            .expect("second attempt");

        assert_ne!(first.state, second.state);
        assert_ne!(first.code_verifier, second.code_verifier);
    }

    #[test]
    fn pkce_challenge_matches_rfc7636_test_vector() {
        // Test vector from RFC 7636 appendix B.
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            pkce_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn token_grant_deserializes_with_default_token_type() {
        let payload = r#"{"access_token":"at","expires_in":3600}"#;
        let grant: super::TokenGrant = serde_json::from_str(payload).expect("decode grant");
        assert_eq!(grant.token_type, "Bearer");
        assert!(grant.refresh_token.is_none());
    }

    #[tokio::test]
    async fn poll_against_unreachable_endpoint_is_transport_error() {
        let mut config = test_config();
        // Nothing listens on the discard port; the connection is refused
        // immediately rather than timing out.
        config.authority = "http://127.0.0.1:9".to_string();
        let client = MicrosoftOAuthClient::new(&config).expect("build client");

        let result = client.poll_device_code(&account(), "device-code").await;
        match result {
            Err(OAuthError::Timeout) | Err(OAuthError::Transport(_)) => {}
            other => panic!("expected transport-class error, got {other:?}"),
        }
    }
}
