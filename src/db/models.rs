use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{Result as SqlResult, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationFlow {
    AuthorizationCode,
    DeviceCode,
}

impl Display for AuthenticationFlow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AuthorizationCode => write!(f, "authorization_code"),
            Self::DeviceCode => write!(f, "device_code"),
        }
    }
}

impl FromStr for AuthenticationFlow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "authorization_code" | "auth_code" => Ok(Self::AuthorizationCode),
            "device_code" => Ok(Self::DeviceCode),
            other => Err(format!("invalid authentication flow: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Inactive,
    Suspended,
}

impl Display for AccountStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
            Self::Suspended => write!(f, "suspended"),
        }
    }
}

impl FromStr for AccountStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "suspended" => Ok(Self::Suspended),
            other => Err(format!("invalid account status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenStatus {
    Valid,
    Expired,
    Revoked,
    Invalid,
}

impl Display for TokenStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Valid => write!(f, "valid"),
            Self::Expired => write!(f, "expired"),
            Self::Revoked => write!(f, "revoked"),
            Self::Invalid => write!(f, "invalid"),
        }
    }
}

impl FromStr for TokenStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "valid" => Ok(Self::Valid),
            "expired" => Ok(Self::Expired),
            "revoked" => Ok(Self::Revoked),
            "invalid" => Ok(Self::Invalid),
            other => Err(format!("invalid token status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MailImportance {
    Low,
    Normal,
    High,
}

impl Display for MailImportance {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
        }
    }
}

impl FromStr for MailImportance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(format!("invalid importance: {other}")),
        }
    }
}

/// Kind of authentication event recorded in the audit trail.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthEventKind {
    Registration,
    Authentication,
    TokenRefresh,
    Logout,
}

impl Display for AuthEventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registration => write!(f, "registration"),
            Self::Authentication => write!(f, "authentication"),
            Self::TokenRefresh => write!(f, "token_refresh"),
            Self::Logout => write!(f, "logout"),
        }
    }
}

impl FromStr for AuthEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "registration" => Ok(Self::Registration),
            "authentication" => Ok(Self::Authentication),
            "token_refresh" => Ok(Self::TokenRefresh),
            "logout" => Ok(Self::Logout),
            other => Err(format!("invalid auth event kind: {other}")),
        }
    }
}

/// Aggregate root: one registered mailbox. Deleting an account cascades
/// every dependent row (tokens, flow data, messages, history, delta links,
/// webhooks, logs).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub user_id: String,
    pub tenant_id: String,
    pub client_id: String,
    pub authentication_flow: AuthenticationFlow,
    pub status: AccountStatus,
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_authenticated_at: Option<DateTime<Utc>>,
}

/// Authorization-code flow data, 1:1 with its account. The secret fields
/// are immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthCodeAccount {
    pub account_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub authority: String,
    pub created_at: DateTime<Utc>,
}

/// Device-code flow data, 1:1 with its account; mutated as the device flow
/// progresses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceCodeAccount {
    pub account_id: String,
    pub device_code: Option<String>,
    pub user_code: Option<String>,
    pub verification_uri: Option<String>,
    pub expires_in: Option<i64>,
    pub interval: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// At most one token row exists per account; every successful exchange or
/// refresh replaces it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Token {
    pub account_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
    pub status: TokenStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Token {
    /// `expires_at` is authoritative; expiry is always derived, never stored.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn expires_in_seconds(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }

    /// A token is usable only when marked valid and not yet expired.
    pub fn is_usable(&self) -> bool {
        self.status == TokenStatus::Valid && !self.is_expired()
    }
}

/// One collected message, deduplicated on (account_id, message_id).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MailMessage {
    pub id: String,
    /// Upstream provider message ID; unique per mailbox but re-seen across
    /// manual queries and delta syncs.
    pub message_id: String,
    pub internet_message_id: Option<String>,
    pub account_id: String,
    pub subject: String,
    pub sender_email: String,
    pub sender_name: Option<String>,
    pub to_recipients: Vec<String>,
    pub cc_recipients: Vec<String>,
    pub bcc_recipients: Vec<String>,
    pub body_preview: Option<String>,
    pub body_content: Option<String>,
    pub body_content_type: String,
    pub importance: MailImportance,
    pub is_read: bool,
    pub has_attachments: bool,
    pub received_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub folder: Option<String>,
    pub categories: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Append-only record of one mail query invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MailQueryHistory {
    pub id: String,
    pub account_id: String,
    /// "manual", "delta", or "webhook".
    pub query_type: String,
    pub parameters: serde_json::Value,
    pub messages_found: i64,
    pub new_messages: i64,
    pub queried_at: DateTime<Utc>,
    pub execution_time_ms: Option<i64>,
    pub success: bool,
    pub error_message: Option<String>,
}

/// Incremental-sync cursor. At most one active link exists per
/// (account_id, folder_id); saving a new one deactivates its predecessor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeltaLink {
    pub id: String,
    pub account_id: String,
    pub folder_id: String,
    pub delta_token: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

/// Local mirror of an upstream webhook subscription. Deactivated rows are
/// retained for a grace period rather than removed immediately.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookSubscription {
    pub subscription_id: String,
    pub account_id: String,
    pub resource: String,
    pub change_types: Vec<String>,
    pub notification_url: String,
    pub client_state: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
}

/// Append-only audit trail of authentication events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthenticationLog {
    pub id: String,
    pub account_id: String,
    pub event_kind: AuthEventKind,
    pub authentication_flow: AuthenticationFlow,
    pub success: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub logged_at: DateTime<Utc>,
}

/// One delivery attempt of a collected message to the downstream endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalApiCall {
    pub id: i64,
    pub message_id: String,
    pub endpoint: String,
    pub payload: serde_json::Value,
    pub response_status: Option<i64>,
    pub response_body: Option<String>,
    pub success: bool,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// PKCE verifier parked between authorization-URL issuance and the code
/// exchange callback, keyed by the per-attempt state token.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAuthorization {
    pub state: String,
    pub account_id: String,
    pub code_verifier: String,
    pub created_at: DateTime<Utc>,
}

pub(crate) fn parse_json_array(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str::<Vec<String>>(&s).ok())
        .unwrap_or_default()
}

pub(crate) fn parse_json_value(raw: Option<String>) -> serde_json::Value {
    raw.and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
        .unwrap_or(serde_json::Value::Null)
}

fn conversion_error(raw: &str, error: impl std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        raw.len(),
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            error.to_string(),
        )),
    )
}

pub(crate) fn parse_datetime(raw: String) -> SqlResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(&raw, e))
}

pub(crate) fn parse_opt_datetime(raw: Option<String>) -> SqlResult<Option<DateTime<Utc>>> {
    raw.map(parse_datetime).transpose()
}

fn parse_enum<T: FromStr<Err = String>>(raw: String) -> SqlResult<T> {
    raw.parse::<T>().map_err(|e| conversion_error(&raw, e))
}

impl Account {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            email: row.get("email")?,
            user_id: row.get("user_id")?,
            tenant_id: row.get("tenant_id")?,
            client_id: row.get("client_id")?,
            authentication_flow: parse_enum(row.get("authentication_flow")?)?,
            status: parse_enum(row.get("status")?)?,
            scopes: parse_json_array(row.get("scopes")?),
            created_at: parse_datetime(row.get("created_at")?)?,
            updated_at: parse_opt_datetime(row.get("updated_at")?)?,
            last_authenticated_at: parse_opt_datetime(row.get("last_authenticated_at")?)?,
        })
    }
}

impl AuthCodeAccount {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            account_id: row.get("account_id")?,
            client_secret: row.get("client_secret")?,
            redirect_uri: row.get("redirect_uri")?,
            authority: row.get("authority")?,
            created_at: parse_datetime(row.get("created_at")?)?,
        })
    }
}

impl DeviceCodeAccount {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            account_id: row.get("account_id")?,
            device_code: row.get("device_code")?,
            user_code: row.get("user_code")?,
            verification_uri: row.get("verification_uri")?,
            expires_in: row.get("expires_in")?,
            interval: row.get("interval")?,
            created_at: parse_datetime(row.get("created_at")?)?,
            updated_at: parse_opt_datetime(row.get("updated_at")?)?,
        })
    }
}

impl Token {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            account_id: row.get("account_id")?,
            access_token: row.get("access_token")?,
            refresh_token: row.get("refresh_token")?,
            token_type: row.get("token_type")?,
            expires_at: parse_datetime(row.get("expires_at")?)?,
            scopes: parse_json_array(row.get("scopes")?),
            status: parse_enum(row.get("status")?)?,
            created_at: parse_datetime(row.get("created_at")?)?,
            updated_at: parse_opt_datetime(row.get("updated_at")?)?,
        })
    }
}

impl MailMessage {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            message_id: row.get("message_id")?,
            internet_message_id: row.get("internet_message_id")?,
            account_id: row.get("account_id")?,
            subject: row.get("subject")?,
            sender_email: row.get("sender_email")?,
            sender_name: row.get("sender_name")?,
            to_recipients: parse_json_array(row.get("to_recipients")?),
            cc_recipients: parse_json_array(row.get("cc_recipients")?),
            bcc_recipients: parse_json_array(row.get("bcc_recipients")?),
            body_preview: row.get("body_preview")?,
            body_content: row.get("body_content")?,
            body_content_type: row.get("body_content_type")?,
            importance: parse_enum(row.get("importance")?)?,
            is_read: row.get("is_read")?,
            has_attachments: row.get("has_attachments")?,
            received_at: parse_datetime(row.get("received_at")?)?,
            sent_at: parse_opt_datetime(row.get("sent_at")?)?,
            folder: row.get("folder")?,
            categories: parse_json_array(row.get("categories")?),
            created_at: parse_datetime(row.get("created_at")?)?,
        })
    }
}

impl MailQueryHistory {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            account_id: row.get("account_id")?,
            query_type: row.get("query_type")?,
            parameters: parse_json_value(row.get("parameters")?),
            messages_found: row.get("messages_found")?,
            new_messages: row.get("new_messages")?,
            queried_at: parse_datetime(row.get("queried_at")?)?,
            execution_time_ms: row.get("execution_time_ms")?,
            success: row.get("success")?,
            error_message: row.get("error_message")?,
        })
    }
}

impl DeltaLink {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            account_id: row.get("account_id")?,
            folder_id: row.get("folder_id")?,
            delta_token: row.get("delta_token")?,
            created_at: parse_datetime(row.get("created_at")?)?,
            last_used_at: parse_opt_datetime(row.get("last_used_at")?)?,
            is_active: row.get("is_active")?,
        })
    }
}

impl WebhookSubscription {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            subscription_id: row.get("subscription_id")?,
            account_id: row.get("account_id")?,
            resource: row.get("resource")?,
            change_types: parse_json_array(row.get("change_types")?),
            notification_url: row.get("notification_url")?,
            client_state: row.get("client_state")?,
            expires_at: parse_datetime(row.get("expires_at")?)?,
            created_at: parse_datetime(row.get("created_at")?)?,
            is_active: row.get("is_active")?,
        })
    }
}

impl AuthenticationLog {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            account_id: row.get("account_id")?,
            event_kind: parse_enum(row.get("event_kind")?)?,
            authentication_flow: parse_enum(row.get("authentication_flow")?)?,
            success: row.get("success")?,
            error_code: row.get("error_code")?,
            error_message: row.get("error_message")?,
            logged_at: parse_datetime(row.get("logged_at")?)?,
        })
    }
}

impl ExternalApiCall {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            message_id: row.get("message_id")?,
            endpoint: row.get("endpoint")?,
            payload: parse_json_value(row.get("payload")?),
            response_status: row.get("response_status")?,
            response_body: row.get("response_body")?,
            success: row.get("success")?,
            retry_count: row.get("retry_count")?,
            created_at: parse_datetime(row.get("created_at")?)?,
            completed_at: parse_opt_datetime(row.get("completed_at")?)?,
        })
    }
}

impl PendingAuthorization {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            state: row.get("state")?,
            account_id: row.get("account_id")?,
            code_verifier: row.get("code_verifier")?,
            created_at: parse_datetime(row.get("created_at")?)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Account, AccountStatus, AuthEventKind, AuthenticationFlow, MailImportance, Token,
        TokenStatus,
    };
    use chrono::{Duration, Utc};

    #[test]
    fn enum_display_and_parse_round_trip() {
        assert_eq!(
            AuthenticationFlow::AuthorizationCode.to_string(),
            "authorization_code"
        );
        assert_eq!(
            "device_code".parse::<AuthenticationFlow>().expect("parse"),
            AuthenticationFlow::DeviceCode
        );
        assert_eq!(
            "suspended".parse::<AccountStatus>().expect("parse"),
            AccountStatus::Suspended
        );
        assert_eq!(
            "token_refresh".parse::<AuthEventKind>().expect("parse"),
            AuthEventKind::TokenRefresh
        );
        assert_eq!(
            "HIGH".parse::<MailImportance>().expect("parse"),
            MailImportance::High
        );
        assert!("bogus".parse::<TokenStatus>().is_err());
    }

    #[test]
    fn token_expiry_is_derived_from_expires_at() {
        let mut token = Token {
            account_id: "acc-1".to_string(),
            access_token: "at".to_string(),
            refresh_token: Some("rt".to_string()),
            token_type: "Bearer".to_string(),
            expires_at: Utc::now() + Duration::minutes(10),
            scopes: vec!["Mail.Read".to_string()],
            status: TokenStatus::Valid,
            created_at: Utc::now(),
            updated_at: None,
        };
        assert!(!token.is_expired());
        assert!(token.is_usable());
        assert!(token.expires_in_seconds() > 0);

        token.expires_at = Utc::now() - Duration::minutes(1);
        assert!(token.is_expired());
        assert!(!token.is_usable());
        assert_eq!(token.expires_in_seconds(), 0);

        token.expires_at = Utc::now() + Duration::minutes(10);
        token.status = TokenStatus::Invalid;
        assert!(!token.is_usable());
    }

    #[test]
    fn serde_round_trip_account() {
        let account = Account {
            id: "acc-1".to_string(),
            email: "person@example.com".to_string(),
            user_id: "user-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            client_id: "client-1".to_string(),
            authentication_flow: AuthenticationFlow::AuthorizationCode,
            status: AccountStatus::Active,
            scopes: vec!["Mail.Read".to_string()],
            created_at: Utc::now(),
            updated_at: None,
            last_authenticated_at: None,
        };

        let json = serde_json::to_string(&account).expect("serialize account");
        assert!(json.contains("\"authorization_code\""));
        let _: Account = serde_json::from_str(&json).expect("deserialize account");
    }
}
