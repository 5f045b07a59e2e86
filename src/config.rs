use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:8000/auth/callback";
pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";
pub const DEFAULT_GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";
pub const DEFAULT_SCOPES: &str = "offline_access Mail.Read Mail.Send";
pub const DEFAULT_FORWARD_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_FORWARD_RETRIES: i64 = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),

    #[error("invalid value for {var}: {reason}")]
    InvalidVar { var: &'static str, reason: String },

    #[error("failed to determine home directory for default database path")]
    NoHomeDir,
}

/// Process-wide configuration, constructed once at startup and passed by
/// reference into each component. Components never read the environment
/// themselves.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub authority: String,
    pub graph_base: String,
    pub scopes: Vec<String>,
    pub encryption_key: String,
    pub encryption_salt: String,
    /// Forwarding target for newly collected messages. Forwarding is
    /// disabled entirely when unset.
    pub forward_url: Option<String>,
    pub forward_timeout: Duration,
    pub max_forward_retries: i64,
    pub scheduler: SchedulerConfig,
}

/// Sweep periods and lookahead windows for the background scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub token_refresh_interval: Duration,
    pub webhook_renewal_interval: Duration,
    pub forward_retry_interval: Duration,
    pub cleanup_interval: Duration,
    /// Refresh tokens expiring within this window.
    pub token_refresh_lookahead_secs: i64,
    /// Renew webhook subscriptions expiring within this window.
    pub webhook_renewal_lookahead_secs: i64,
    pub token_retention_days: i64,
    pub log_retention_days: i64,
    pub webhook_retention_days: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            token_refresh_interval: Duration::from_secs(60),
            webhook_renewal_interval: Duration::from_secs(300),
            forward_retry_interval: Duration::from_secs(120),
            cleanup_interval: Duration::from_secs(3600),
            token_refresh_lookahead_secs: 300,
            webhook_renewal_lookahead_secs: 1800,
            token_retention_days: 30,
            log_retention_days: 90,
            webhook_retention_days: 7,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_path = match env_string("MAILGATE_DB") {
            Some(path) => PathBuf::from(path),
            None => Self::default_db_path()?,
        };

        Ok(Self {
            database_path,
            tenant_id: require("MAILGATE_TENANT_ID")?,
            client_id: require("MAILGATE_CLIENT_ID")?,
            client_secret: require("MAILGATE_CLIENT_SECRET")?,
            redirect_uri: env_string("MAILGATE_REDIRECT_URI")
                .unwrap_or_else(|| DEFAULT_REDIRECT_URI.to_string()),
            authority: env_string("MAILGATE_AUTHORITY")
                .unwrap_or_else(|| DEFAULT_AUTHORITY.to_string()),
            graph_base: env_string("MAILGATE_GRAPH_BASE")
                .unwrap_or_else(|| DEFAULT_GRAPH_BASE.to_string()),
            scopes: parse_scopes(
                &env_string("MAILGATE_SCOPES").unwrap_or_else(|| DEFAULT_SCOPES.to_string()),
            ),
            encryption_key: require("MAILGATE_ENCRYPTION_KEY")?,
            encryption_salt: require("MAILGATE_ENCRYPTION_SALT")?,
            forward_url: env_string("MAILGATE_FORWARD_URL"),
            forward_timeout: Duration::from_secs(
                env_parsed("MAILGATE_FORWARD_TIMEOUT_SECS")?
                    .unwrap_or(DEFAULT_FORWARD_TIMEOUT_SECS),
            ),
            max_forward_retries: env_parsed("MAILGATE_MAX_FORWARD_RETRIES")?
                .unwrap_or(DEFAULT_MAX_FORWARD_RETRIES),
            scheduler: SchedulerConfig::default(),
        })
    }

    pub fn default_db_path() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(home.join(".mailgate").join("mailgate.db"))
    }
}

fn env_string(var: &'static str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn require(var: &'static str) -> Result<String, ConfigError> {
    env_string(var).ok_or(ConfigError::MissingVar(var))
}

fn env_parsed<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    env_string(var)
        .map(|value| {
            value.parse::<T>().map_err(|e| ConfigError::InvalidVar {
                var,
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn parse_scopes(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::parse_scopes;

    #[test]
    fn scopes_split_on_whitespace() {
        let scopes = parse_scopes("offline_access  Mail.Read Mail.Send");
        assert_eq!(scopes, vec!["offline_access", "Mail.Read", "Mail.Send"]);
    }

    #[test]
    fn empty_scope_string_yields_no_scopes() {
        assert!(parse_scopes("   ").is_empty());
    }
}
