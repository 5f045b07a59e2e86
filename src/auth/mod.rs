use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::models::{
    Account, AccountStatus, AuthCodeAccount, AuthEventKind, AuthenticationFlow, AuthenticationLog,
    DeviceCodeAccount, PendingAuthorization, Token, TokenStatus,
};
use crate::db::{AuthLogFilters, Store, StoreError};
use crate::oauth::{DevicePoll, OAuthError, OAuthPort, TokenGrant};

const DEFAULT_DEVICE_POLL_INTERVAL_SECS: i64 = 5;
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("account already exists for email: {email}")]
    DuplicateAccount { email: String },

    #[error("account not found: {account_id}")]
    AccountNotFound { account_id: String },

    #[error("invalid {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    #[error("no {expected} data for account {account_id}")]
    FlowDataMissing {
        account_id: String,
        expected: AuthenticationFlow,
    },

    #[error("unknown or already-used authorization state")]
    InvalidState,

    #[error("device flow not started for account {account_id}")]
    DeviceFlowNotStarted { account_id: String },

    #[error("no refresh token available for account {account_id}")]
    NoRefreshToken { account_id: String },

    #[error("authentication failed: {error_code}: {description}")]
    AuthenticationFailed {
        error_code: String,
        description: String,
    },

    #[error("device authorization failed: {error_code}: {description}")]
    DeviceAuthorizationFailed {
        error_code: String,
        description: String,
    },

    #[error(transparent)]
    OAuth(#[from] OAuthError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What the caller must do next after starting authentication.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BeginAuth {
    /// Authorization-code flow: send the user to the authorization URL.
    Redirect {
        authorization_url: String,
        state: String,
    },
    /// Device-code flow: show the user code and verification URI.
    DeviceCode {
        user_code: String,
        verification_uri: String,
        expires_in: i64,
        interval: i64,
    },
}

/// Outcome of one device-code poll. Pending states are results, not
/// errors; terminal failures surface as [`AuthError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePollOutcome {
    Pending,
    /// Still pending, and the provider asked for a longer poll interval.
    SlowDown,
    Authorized,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountInfo {
    pub account: Account,
    pub token_status: String,
    pub token_expires_in: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RefreshSweep {
    pub refreshed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AuthCleanup {
    pub tokens_purged: usize,
    pub logs_purged: usize,
    pub pending_authorizations_purged: usize,
}

/// Owns the account authentication state machine: registration,
/// authorization-URL issuance, code exchange, device-code polling, token
/// refresh, and revocation. Every completed auth event leaves exactly one
/// audit log row.
pub struct AuthService {
    store: Arc<Store>,
    oauth: Arc<dyn OAuthPort>,
    config: Config,
}

impl AuthService {
    pub fn new(store: Arc<Store>, oauth: Arc<dyn OAuthPort>, config: Config) -> Self {
        Self {
            store,
            oauth,
            config,
        }
    }

    pub async fn register(
        &self,
        email: &str,
        user_id: &str,
        flow: AuthenticationFlow,
        scopes: Vec<String>,
    ) -> Result<String, AuthError> {
        let email = email.trim().to_ascii_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(AuthError::InvalidInput {
                field: "email",
                reason: format!("not a valid email address: {email}"),
            });
        }

        if let Some(existing) = self.store.get_account_by_email(&email)? {
            self.log_auth_event(
                &existing.id,
                AuthEventKind::Registration,
                flow,
                false,
                Some("duplicate_account"),
                Some(&format!("account already exists for email {email}")),
            );
            return Err(AuthError::DuplicateAccount { email });
        }

        let scopes = if scopes.is_empty() {
            self.config.scopes.clone()
        } else {
            scopes
        };

        let account = Account {
            id: Uuid::new_v4().to_string(),
            email: email.clone(),
            user_id: user_id.to_string(),
            tenant_id: self.config.tenant_id.clone(),
            client_id: self.config.client_id.clone(),
            authentication_flow: flow,
            status: AccountStatus::Active,
            scopes,
            created_at: Utc::now(),
            updated_at: None,
            last_authenticated_at: None,
        };
        self.store.create_account(&account)?;

        match flow {
            AuthenticationFlow::AuthorizationCode => {
                self.store.insert_auth_code_account(&AuthCodeAccount {
                    account_id: account.id.clone(),
                    client_secret: self.config.client_secret.clone(),
                    redirect_uri: self.config.redirect_uri.clone(),
                    authority: format!(
                        "{}/{}",
                        self.config.authority.trim_end_matches('/'),
                        self.config.tenant_id
                    ),
                    created_at: Utc::now(),
                })?;
            }
            AuthenticationFlow::DeviceCode => {
                self.store.insert_device_code_account(&DeviceCodeAccount {
                    account_id: account.id.clone(),
                    device_code: None,
                    user_code: None,
                    verification_uri: None,
                    expires_in: None,
                    interval: None,
                    created_at: Utc::now(),
                    updated_at: None,
                })?;
            }
        }

        self.log_auth_event(&account.id, AuthEventKind::Registration, flow, true, None, None);
        info!(account_id = %account.id, %email, %flow, "account registered");

        Ok(account.id)
    }

    /// Start authentication for an account. Both flows return a
    /// user-action prompt; the exchange completes later via
    /// [`complete_authorization_code`](Self::complete_authorization_code)
    /// or [`poll_device_code`](Self::poll_device_code).
    pub async fn begin_authentication(&self, account_id: &str) -> Result<BeginAuth, AuthError> {
        let account = self.require_account(account_id)?;

        let result = match account.authentication_flow {
            AuthenticationFlow::AuthorizationCode => self.begin_authorization_code(&account).await,
            AuthenticationFlow::DeviceCode => self.begin_device_code(&account).await,
        };

        if let Err(error) = &result {
            self.log_auth_event(
                account_id,
                AuthEventKind::Authentication,
                account.authentication_flow,
                false,
                None,
                Some(&error.to_string()),
            );
        }
        result
    }

    async fn begin_authorization_code(&self, account: &Account) -> Result<BeginAuth, AuthError> {
        let auth_data = self.store.get_auth_code_account(&account.id)?.ok_or_else(|| {
            AuthError::FlowDataMissing {
                account_id: account.id.clone(),
                expected: AuthenticationFlow::AuthorizationCode,
            }
        })?;

        let request = self.oauth.build_authorization_url(account, &auth_data)?;

        // The callback only carries (code, state); the verifier has to be
        // retrievable by state when the exchange happens.
        self.store.put_pending_authorization(&PendingAuthorization {
            state: request.state.clone(),
            account_id: account.id.clone(),
            code_verifier: request.code_verifier,
            created_at: Utc::now(),
        })?;

        Ok(BeginAuth::Redirect {
            authorization_url: request.url,
            state: request.state,
        })
    }

    async fn begin_device_code(&self, account: &Account) -> Result<BeginAuth, AuthError> {
        let mut device_data = self
            .store
            .get_device_code_account(&account.id)?
            .ok_or_else(|| AuthError::FlowDataMissing {
                account_id: account.id.clone(),
                expected: AuthenticationFlow::DeviceCode,
            })?;

        let authorization = self.oauth.begin_device_flow(account).await?;
        let interval = authorization
            .interval
            .unwrap_or(DEFAULT_DEVICE_POLL_INTERVAL_SECS);

        device_data.device_code = Some(authorization.device_code);
        device_data.user_code = Some(authorization.user_code.clone());
        device_data.verification_uri = Some(authorization.verification_uri.clone());
        device_data.expires_in = Some(authorization.expires_in);
        device_data.interval = Some(interval);
        self.store.update_device_code_account(&device_data)?;

        Ok(BeginAuth::DeviceCode {
            user_code: authorization.user_code,
            verification_uri: authorization.verification_uri,
            expires_in: authorization.expires_in,
            interval,
        })
    }

    /// Exchange the callback's (code, state) for a token. The state must
    /// match a pending authorization issued by
    /// [`begin_authentication`](Self::begin_authentication); each state is
    /// single-use.
    pub async fn complete_authorization_code(
        &self,
        account_id: &str,
        code: &str,
        state: &str,
    ) -> Result<(), AuthError> {
        let account = self.require_account(account_id)?;

        let result = self.exchange_and_store(&account, code, state).await;
        match &result {
            Ok(()) => {
                self.log_auth_event(
                    account_id,
                    AuthEventKind::Authentication,
                    account.authentication_flow,
                    true,
                    None,
                    None,
                );
                info!(account_id, "authorization code exchange completed");
            }
            Err(error) => {
                let (code, message) = error_code_and_message(error);
                self.log_auth_event(
                    account_id,
                    AuthEventKind::Authentication,
                    account.authentication_flow,
                    false,
                    Some(&code),
                    Some(&message),
                );
                error!(account_id, %error, "authorization code exchange failed");
            }
        }
        result
    }

    async fn exchange_and_store(
        &self,
        account: &Account,
        code: &str,
        state: &str,
    ) -> Result<(), AuthError> {
        let auth_data = self.store.get_auth_code_account(&account.id)?.ok_or_else(|| {
            AuthError::FlowDataMissing {
                account_id: account.id.clone(),
                expected: AuthenticationFlow::AuthorizationCode,
            }
        })?;

        let pending = self
            .store
            .take_pending_authorization(state)?
            .filter(|pending| pending.account_id == account.id)
            .ok_or(AuthError::InvalidState)?;

        let grant = self
            .oauth
            .exchange_code(account, &auth_data, code, &pending.code_verifier)
            .await
            .map_err(map_provider_error)?;

        self.store_grant(account, grant, None)?;
        Ok(())
    }

    /// Poll the device-token endpoint once. Pending and slow-down are
    /// expected results the caller should retry on; declined, expired, and
    /// bad-code are terminal.
    pub async fn poll_device_code(&self, account_id: &str) -> Result<DevicePollOutcome, AuthError> {
        let account = self.require_account(account_id)?;

        let device_data = self
            .store
            .get_device_code_account(account_id)?
            .ok_or_else(|| AuthError::FlowDataMissing {
                account_id: account_id.to_string(),
                expected: AuthenticationFlow::DeviceCode,
            })?;

        let Some(device_code) = device_data.device_code.clone() else {
            return Err(AuthError::DeviceFlowNotStarted {
                account_id: account_id.to_string(),
            });
        };

        match self.oauth.poll_device_code(&account, &device_code).await {
            Ok(DevicePoll::Pending) => Ok(DevicePollOutcome::Pending),
            Ok(DevicePoll::SlowDown) => Ok(DevicePollOutcome::SlowDown),
            Ok(DevicePoll::Authorized(grant)) => {
                self.store_grant(&account, grant, None)?;
                self.log_auth_event(
                    account_id,
                    AuthEventKind::Authentication,
                    account.authentication_flow,
                    true,
                    None,
                    None,
                );
                info!(account_id, "device authorization completed");
                Ok(DevicePollOutcome::Authorized)
            }
            Err(OAuthError::DeviceAuthorizationFailed {
                error_code,
                description,
            }) => {
                self.log_auth_event(
                    account_id,
                    AuthEventKind::Authentication,
                    account.authentication_flow,
                    false,
                    Some(&error_code),
                    Some(&description),
                );
                Err(AuthError::DeviceAuthorizationFailed {
                    error_code,
                    description,
                })
            }
            Err(error) => {
                self.log_auth_event(
                    account_id,
                    AuthEventKind::Authentication,
                    account.authentication_flow,
                    false,
                    None,
                    Some(&error.to_string()),
                );
                Err(error.into())
            }
        }
    }

    /// Refresh the account's access token. On upstream failure the stored
    /// token is marked invalid but kept for diagnosis.
    pub async fn refresh_token(&self, account_id: &str) -> Result<(), AuthError> {
        let account = self.require_account(account_id)?;

        let token = self.store.get_token(account_id)?;
        let Some(token) = token else {
            self.log_refresh_failure(&account, "no_refresh_token", "no token stored");
            return Err(AuthError::NoRefreshToken {
                account_id: account_id.to_string(),
            });
        };
        let Some(refresh_token) = token.refresh_token.clone() else {
            self.log_refresh_failure(&account, "no_refresh_token", "token has no refresh token");
            return Err(AuthError::NoRefreshToken {
                account_id: account_id.to_string(),
            });
        };

        let client_secret = match account.authentication_flow {
            AuthenticationFlow::AuthorizationCode => self
                .store
                .get_auth_code_account(account_id)?
                .map(|data| data.client_secret),
            AuthenticationFlow::DeviceCode => None,
        };

        match self
            .oauth
            .refresh(
                &account,
                client_secret.as_deref(),
                &refresh_token,
                &token.scopes,
            )
            .await
        {
            Ok(grant) => {
                // The provider may omit a rotated refresh token; keep the
                // old one in that case.
                self.store_grant(&account, grant, Some(refresh_token))?;
                self.log_auth_event(
                    account_id,
                    AuthEventKind::TokenRefresh,
                    account.authentication_flow,
                    true,
                    None,
                    None,
                );
                info!(account_id, "token refreshed");
                Ok(())
            }
            Err(error) => {
                self.store.mark_token_invalid(account_id)?;
                let mapped = map_provider_error(error);
                let (code, message) = error_code_and_message(&mapped);
                self.log_auth_event(
                    account_id,
                    AuthEventKind::TokenRefresh,
                    account.authentication_flow,
                    false,
                    Some(&code),
                    Some(&message),
                );
                error!(account_id, error = %mapped, "token refresh failed");
                Err(mapped)
            }
        }
    }

    /// Revoke upstream sessions (best effort) and delete the local token.
    /// Local deletion always happens: the user asked for the token to be
    /// dead, and local state must agree.
    pub async fn revoke(&self, account_id: &str) -> Result<(), AuthError> {
        let account = self.require_account(account_id)?;

        if let Some(token) = self.store.get_token(account_id)? {
            match self.oauth.revoke(&token.access_token).await {
                Ok(true) => info!(account_id, "upstream sessions revoked"),
                Ok(false) => warn!(account_id, "upstream revocation not confirmed"),
                Err(error) => {
                    warn!(account_id, %error, "upstream revocation call failed");
                }
            }
            self.store.delete_token(account_id)?;
        }

        self.log_auth_event(
            account_id,
            AuthEventKind::Logout,
            account.authentication_flow,
            true,
            None,
            None,
        );
        info!(account_id, "token revoked");
        Ok(())
    }

    pub fn account_info(&self, account_id: &str) -> Result<AccountInfo, AuthError> {
        let account = self.require_account(account_id)?;
        self.describe_account(account)
    }

    pub fn account_info_by_email(&self, email: &str) -> Result<Option<AccountInfo>, AuthError> {
        self.store
            .get_account_by_email(email)?
            .map(|account| self.describe_account(account))
            .transpose()
    }

    pub fn list_accounts(&self) -> Result<Vec<AccountInfo>, AuthError> {
        self.store
            .list_accounts()?
            .into_iter()
            .map(|account| self.describe_account(account))
            .collect()
    }

    pub fn update_status(
        &self,
        account_id: &str,
        status: AccountStatus,
    ) -> Result<(), AuthError> {
        let mut account = self.require_account(account_id)?;
        account.status = status;
        self.store.update_account(&account)?;
        info!(account_id, %status, "account status updated");
        Ok(())
    }

    /// Delete the account aggregate: the account row and everything that
    /// hangs off it, in one transaction.
    pub fn delete_account(&self, account_id: &str) -> Result<bool, AuthError> {
        Ok(self.store.delete_account(account_id)?)
    }

    pub fn auth_logs(
        &self,
        filters: AuthLogFilters,
    ) -> Result<Vec<AuthenticationLog>, AuthError> {
        Ok(self.store.list_auth_logs(filters)?)
    }

    /// Refresh every valid token expiring within the window. Per-token
    /// failures are logged and do not stop the sweep.
    pub async fn refresh_expiring(&self, window_secs: i64) -> Result<RefreshSweep, AuthError> {
        let expiring = self.store.tokens_expiring_within(window_secs)?;
        let mut sweep = RefreshSweep::default();

        for token in expiring {
            match self.refresh_token(&token.account_id).await {
                Ok(()) => sweep.refreshed += 1,
                Err(error) => {
                    sweep.failed += 1;
                    warn!(
                        account_id = %token.account_id,
                        %error,
                        "token refresh failed during sweep"
                    );
                }
            }
        }

        Ok(sweep)
    }

    /// Age out expired tokens, old audit logs, and stale pending
    /// authorizations.
    pub fn cleanup(
        &self,
        token_retention_days: i64,
        log_retention_days: i64,
    ) -> Result<AuthCleanup, AuthError> {
        let now = Utc::now();
        Ok(AuthCleanup {
            tokens_purged: self
                .store
                .purge_tokens_expired_before(now - Duration::days(token_retention_days))?,
            logs_purged: self
                .store
                .purge_auth_logs_before(now - Duration::days(log_retention_days))?,
            pending_authorizations_purged: self
                .store
                .purge_pending_authorizations_before(now - Duration::days(1))?,
        })
    }

    fn require_account(&self, account_id: &str) -> Result<Account, AuthError> {
        self.store
            .get_account(account_id)?
            .ok_or_else(|| AuthError::AccountNotFound {
                account_id: account_id.to_string(),
            })
    }

    fn describe_account(&self, account: Account) -> Result<AccountInfo, AuthError> {
        let token = self.store.get_token(&account.id)?;
        let (token_status, token_expires_in) = match &token {
            None => ("none".to_string(), None),
            Some(token) if token.status != TokenStatus::Valid => {
                (token.status.to_string(), None)
            }
            Some(token) if token.is_expired() => ("expired".to_string(), Some(0)),
            Some(token) => ("valid".to_string(), Some(token.expires_in_seconds())),
        };

        Ok(AccountInfo {
            account,
            token_status,
            token_expires_in,
        })
    }

    fn store_grant(
        &self,
        account: &Account,
        grant: TokenGrant,
        previous_refresh_token: Option<String>,
    ) -> Result<(), AuthError> {
        let expires_in = if grant.expires_in > 0 {
            grant.expires_in
        } else {
            DEFAULT_TOKEN_LIFETIME_SECS
        };
        let scopes = grant
            .scope
            .as_deref()
            .map(|scope| scope.split_whitespace().map(str::to_string).collect())
            .filter(|scopes: &Vec<String>| !scopes.is_empty())
            .unwrap_or_else(|| account.scopes.clone());

        let token = Token {
            account_id: account.id.clone(),
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.or(previous_refresh_token),
            token_type: grant.token_type,
            expires_at: Utc::now() + Duration::seconds(expires_in),
            scopes,
            status: TokenStatus::Valid,
            created_at: Utc::now(),
            updated_at: None,
        };
        self.store.save_token(&token)?;

        let mut updated = account.clone();
        updated.last_authenticated_at = Some(Utc::now());
        self.store.update_account(&updated)?;
        Ok(())
    }

    fn log_refresh_failure(&self, account: &Account, code: &str, message: &str) {
        self.log_auth_event(
            &account.id,
            AuthEventKind::TokenRefresh,
            account.authentication_flow,
            false,
            Some(code),
            Some(message),
        );
    }

    /// Append one audit row. Failing to write the audit log must not fail
    /// the operation being audited; it is reported and dropped.
    fn log_auth_event(
        &self,
        account_id: &str,
        event_kind: AuthEventKind,
        authentication_flow: AuthenticationFlow,
        success: bool,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) {
        let log = AuthenticationLog {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            event_kind,
            authentication_flow,
            success,
            error_code: error_code.map(str::to_string),
            error_message: error_message.map(str::to_string),
            logged_at: Utc::now(),
        };

        if let Err(error) = self.store.append_auth_log(&log) {
            error!(account_id, %event_kind, %error, "failed to append auth log");
        }
    }
}

fn map_provider_error(error: OAuthError) -> AuthError {
    match error {
        OAuthError::Provider {
            error_code,
            description,
            ..
        } => AuthError::AuthenticationFailed {
            error_code,
            description,
        },
        other => AuthError::OAuth(other),
    }
}

fn error_code_and_message(error: &AuthError) -> (String, String) {
    match error {
        AuthError::AuthenticationFailed {
            error_code,
            description,
        }
        | AuthError::DeviceAuthorizationFailed {
            error_code,
            description,
        } => (error_code.clone(), description.clone()),
        AuthError::InvalidState => ("invalid_state".to_string(), error.to_string()),
        AuthError::NoRefreshToken { .. } => ("no_refresh_token".to_string(), error.to_string()),
        other => ("error".to_string(), other.to_string()),
    }
}
