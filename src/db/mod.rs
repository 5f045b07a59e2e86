use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use thiserror::Error;

use crate::crypto::{CryptoError, TokenCipher};

use self::models::{
    Account, AuthCodeAccount, AuthenticationLog, DeltaLink, DeviceCodeAccount, ExternalApiCall,
    MailMessage, MailQueryHistory, PendingAuthorization, Token, TokenStatus, WebhookSubscription,
};

pub mod migrations;
pub mod models;
pub mod schema;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("json serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("{0}")]
    Config(String),
}

#[derive(Debug, Clone, Default)]
pub struct AuthLogFilters {
    pub account_id: Option<String>,
    pub success: Option<bool>,
    pub limit: usize,
}

#[derive(Debug, Clone, Default)]
pub struct QueryHistoryFilters {
    pub account_id: Option<String>,
    pub query_type: Option<String>,
    pub limit: usize,
}

/// SQLite-backed persistence for every gateway entity.
///
/// The connection sits behind a mutex acquired once per logical operation,
/// which doubles as the serialization point for the two atomicity-sensitive
/// writes: the per-account token upsert and the delta-link rotation.
/// Secrets (tokens, client secrets, device codes, PKCE verifiers) pass
/// through the token cipher on their way in and out; nothing sensitive is
/// stored in the clear.
pub struct Store {
    conn: Mutex<Connection>,
    cipher: TokenCipher,
    path: PathBuf,
}

impl Store {
    pub fn open(path: &Path, cipher: TokenCipher) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        migrations::migrate(&conn)
            .map_err(|e| StoreError::Config(format!("migration failed: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock means a panic mid-statement; the connection
        // itself is still consistent, so keep serving.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ---- accounts ----

    pub fn create_account(&self, account: &Account) -> Result<(), StoreError> {
        let scopes = serde_json::to_string(&account.scopes)?;
        self.conn().execute(
            r#"
            INSERT INTO accounts (
                id, email, user_id, tenant_id, client_id, authentication_flow,
                status, scopes, created_at, updated_at, last_authenticated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                account.id,
                account.email,
                account.user_id,
                account.tenant_id,
                account.client_id,
                account.authentication_flow.to_string(),
                account.status.to_string(),
                scopes,
                account.created_at.to_rfc3339(),
                account.updated_at.map(|dt| dt.to_rfc3339()),
                account.last_authenticated_at.map(|dt| dt.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get_account(&self, account_id: &str) -> Result<Option<Account>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM accounts WHERE id = ? LIMIT 1",
        )?;
        let account = stmt
            .query_row([account_id], Account::from_row)
            .optional()?;
        Ok(account)
    }

    pub fn get_account_by_email(&self, email: &str) -> Result<Option<Account>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM accounts WHERE email = ? LIMIT 1",
        )?;
        let account = stmt.query_row([email], Account::from_row).optional()?;
        Ok(account)
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM accounts ORDER BY email ASC")?;
        let accounts = stmt
            .query_map([], Account::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(accounts)
    }

    pub fn update_account(&self, account: &Account) -> Result<(), StoreError> {
        let scopes = serde_json::to_string(&account.scopes)?;
        self.conn().execute(
            r#"
            UPDATE accounts SET
                status = ?, scopes = ?, updated_at = ?, last_authenticated_at = ?
            WHERE id = ?
            "#,
            params![
                account.status.to_string(),
                scopes,
                Utc::now().to_rfc3339(),
                account.last_authenticated_at.map(|dt| dt.to_rfc3339()),
                account.id,
            ],
        )?;
        Ok(())
    }

    /// Delete an account and everything it owns in one transaction. The
    /// cascade is spelled out here so the aggregate boundary lives in code
    /// rather than in schema annotations.
    pub fn delete_account(&self, account_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            DELETE FROM external_api_calls WHERE message_id IN (
                SELECT message_id FROM mail_messages WHERE account_id = ?
            )
            "#,
            [account_id],
        )?;
        tx.execute("DELETE FROM mail_messages WHERE account_id = ?", [account_id])?;
        tx.execute(
            "DELETE FROM mail_query_history WHERE account_id = ?",
            [account_id],
        )?;
        tx.execute("DELETE FROM delta_links WHERE account_id = ?", [account_id])?;
        tx.execute(
            "DELETE FROM webhook_subscriptions WHERE account_id = ?",
            [account_id],
        )?;
        tx.execute("DELETE FROM auth_logs WHERE account_id = ?", [account_id])?;
        tx.execute(
            "DELETE FROM pending_authorizations WHERE account_id = ?",
            [account_id],
        )?;
        tx.execute("DELETE FROM tokens WHERE account_id = ?", [account_id])?;
        tx.execute(
            "DELETE FROM auth_code_accounts WHERE account_id = ?",
            [account_id],
        )?;
        tx.execute(
            "DELETE FROM device_code_accounts WHERE account_id = ?",
            [account_id],
        )?;
        let deleted = tx.execute("DELETE FROM accounts WHERE id = ?", [account_id])?;

        tx.commit()?;
        Ok(deleted > 0)
    }

    // ---- flow-specific account data ----

    pub fn insert_auth_code_account(&self, data: &AuthCodeAccount) -> Result<(), StoreError> {
        let client_secret = self.cipher.encrypt(&data.client_secret)?;
        self.conn().execute(
            r#"
            INSERT INTO auth_code_accounts (account_id, client_secret, redirect_uri, authority, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
            params![
                data.account_id,
                client_secret,
                data.redirect_uri,
                data.authority,
                data.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_auth_code_account(
        &self,
        account_id: &str,
    ) -> Result<Option<AuthCodeAccount>, StoreError> {
        let row = {
            let conn = self.conn();
            let mut stmt =
                conn.prepare("SELECT * FROM auth_code_accounts WHERE account_id = ? LIMIT 1")?;
            stmt.query_row([account_id], AuthCodeAccount::from_row)
                .optional()?
        };

        row.map(|mut data| {
            data.client_secret = self.cipher.decrypt(&data.client_secret)?;
            Ok(data)
        })
        .transpose()
    }

    pub fn insert_device_code_account(&self, data: &DeviceCodeAccount) -> Result<(), StoreError> {
        let device_code = data
            .device_code
            .as_deref()
            .map(|code| self.cipher.encrypt(code))
            .transpose()?;
        self.conn().execute(
            r#"
            INSERT INTO device_code_accounts (
                account_id, device_code, user_code, verification_uri,
                expires_in, interval, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                data.account_id,
                device_code,
                data.user_code,
                data.verification_uri,
                data.expires_in,
                data.interval,
                data.created_at.to_rfc3339(),
                data.updated_at.map(|dt| dt.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get_device_code_account(
        &self,
        account_id: &str,
    ) -> Result<Option<DeviceCodeAccount>, StoreError> {
        let row = {
            let conn = self.conn();
            let mut stmt =
                conn.prepare("SELECT * FROM device_code_accounts WHERE account_id = ? LIMIT 1")?;
            stmt.query_row([account_id], DeviceCodeAccount::from_row)
                .optional()?
        };

        row.map(|mut data| {
            data.device_code = data
                .device_code
                .as_deref()
                .map(|code| self.cipher.decrypt(code))
                .transpose()?;
            Ok(data)
        })
        .transpose()
    }

    pub fn update_device_code_account(&self, data: &DeviceCodeAccount) -> Result<(), StoreError> {
        let device_code = data
            .device_code
            .as_deref()
            .map(|code| self.cipher.encrypt(code))
            .transpose()?;
        self.conn().execute(
            r#"
            UPDATE device_code_accounts SET
                device_code = ?, user_code = ?, verification_uri = ?,
                expires_in = ?, interval = ?, updated_at = ?
            WHERE account_id = ?
            "#,
            params![
                device_code,
                data.user_code,
                data.verification_uri,
                data.expires_in,
                data.interval,
                Utc::now().to_rfc3339(),
                data.account_id,
            ],
        )?;
        Ok(())
    }

    // ---- tokens ----

    /// Save (replace) the single token row for an account. The upsert is a
    /// single statement, so concurrent refreshes for the same account
    /// cannot interleave into duplicate rows.
    pub fn save_token(&self, token: &Token) -> Result<(), StoreError> {
        let access_token = self.cipher.encrypt(&token.access_token)?;
        let refresh_token = token
            .refresh_token
            .as_deref()
            .map(|rt| self.cipher.encrypt(rt))
            .transpose()?;
        let scopes = serde_json::to_string(&token.scopes)?;

        self.conn().execute(
            r#"
            INSERT INTO tokens (
                account_id, access_token, refresh_token, token_type,
                expires_at, scopes, status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL)
            ON CONFLICT(account_id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                token_type = excluded.token_type,
                expires_at = excluded.expires_at,
                scopes = excluded.scopes,
                status = excluded.status,
                updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
            "#,
            params![
                token.account_id,
                access_token,
                refresh_token,
                token.token_type,
                token.expires_at.to_rfc3339(),
                scopes,
                token.status.to_string(),
                token.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_token(&self, account_id: &str) -> Result<Option<Token>, StoreError> {
        let row = {
            let conn = self.conn();
            let mut stmt = conn.prepare("SELECT * FROM tokens WHERE account_id = ? LIMIT 1")?;
            stmt.query_row([account_id], Token::from_row).optional()?
        };

        row.map(|token| self.decrypt_token(token)).transpose()
    }

    pub fn delete_token(&self, account_id: &str) -> Result<bool, StoreError> {
        let deleted = self
            .conn()
            .execute("DELETE FROM tokens WHERE account_id = ?", [account_id])?;
        Ok(deleted > 0)
    }

    pub fn mark_token_invalid(&self, account_id: &str) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            UPDATE tokens SET status = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
            WHERE account_id = ?
            "#,
            params![TokenStatus::Invalid.to_string(), account_id],
        )?;
        Ok(())
    }

    /// Valid tokens that expire within the given window, for the refresh
    /// sweep. Only tokens carrying a refresh token are candidates.
    pub fn tokens_expiring_within(&self, window_secs: i64) -> Result<Vec<Token>, StoreError> {
        let horizon = (Utc::now() + Duration::seconds(window_secs)).to_rfc3339();
        let rows = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                r#"
                SELECT * FROM tokens
                WHERE status = 'valid' AND refresh_token IS NOT NULL AND expires_at <= ?
                ORDER BY expires_at ASC
                "#,
            )?;
            let rows = stmt.query_map([horizon], Token::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        rows.into_iter()
            .map(|token| self.decrypt_token(token))
            .collect()
    }

    pub fn purge_tokens_expired_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let purged = self.conn().execute(
            "DELETE FROM tokens WHERE expires_at < ?",
            [cutoff.to_rfc3339()],
        )?;
        Ok(purged)
    }

    fn decrypt_token(&self, mut token: Token) -> Result<Token, StoreError> {
        token.access_token = self.cipher.decrypt(&token.access_token)?;
        token.refresh_token = token
            .refresh_token
            .as_deref()
            .map(|rt| self.cipher.decrypt(rt))
            .transpose()?;
        Ok(token)
    }

    // ---- mail messages ----

    /// Insert a message unless (account_id, message_id) already exists.
    /// Check and insert are one statement, so two sync paths racing on the
    /// same message cannot both insert.
    pub fn insert_mail_if_absent(&self, message: &MailMessage) -> Result<bool, StoreError> {
        let to_recipients = serde_json::to_string(&message.to_recipients)?;
        let cc_recipients = serde_json::to_string(&message.cc_recipients)?;
        let bcc_recipients = serde_json::to_string(&message.bcc_recipients)?;
        let categories = serde_json::to_string(&message.categories)?;

        let inserted = self.conn().execute(
            r#"
            INSERT OR IGNORE INTO mail_messages (
                id, message_id, internet_message_id, account_id, subject,
                sender_email, sender_name, to_recipients, cc_recipients, bcc_recipients,
                body_preview, body_content, body_content_type, importance,
                is_read, has_attachments, received_at, sent_at, folder, categories, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                message.id,
                message.message_id,
                message.internet_message_id,
                message.account_id,
                message.subject,
                message.sender_email,
                message.sender_name,
                to_recipients,
                cc_recipients,
                bcc_recipients,
                message.body_preview,
                message.body_content,
                message.body_content_type,
                message.importance.to_string(),
                message.is_read,
                message.has_attachments,
                message.received_at.to_rfc3339(),
                message.sent_at.map(|dt| dt.to_rfc3339()),
                message.folder,
                categories,
                message.created_at.to_rfc3339(),
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn get_mail(
        &self,
        account_id: &str,
        message_id: &str,
    ) -> Result<Option<MailMessage>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM mail_messages WHERE account_id = ? AND message_id = ? LIMIT 1",
        )?;
        let message = stmt
            .query_row([account_id, message_id], MailMessage::from_row)
            .optional()?;
        Ok(message)
    }

    pub fn list_mails(&self, account_id: &str, limit: usize) -> Result<Vec<MailMessage>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM mail_messages
            WHERE account_id = ?
            ORDER BY received_at DESC
            LIMIT ?
            "#,
        )?;
        let messages = stmt
            .query_map(params![account_id, limit as i64], MailMessage::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    /// Stored messages are immutable apart from read state and categories,
    /// which upstream may legitimately change between syncs.
    pub fn refresh_mail_flags(
        &self,
        account_id: &str,
        message_id: &str,
        is_read: bool,
        categories: &[String],
    ) -> Result<(), StoreError> {
        let categories = serde_json::to_string(categories)?;
        self.conn().execute(
            r#"
            UPDATE mail_messages SET is_read = ?, categories = ?
            WHERE account_id = ? AND message_id = ?
            "#,
            params![is_read, categories, account_id, message_id],
        )?;
        Ok(())
    }

    pub fn count_mails(&self, account_id: &str) -> Result<i64, StoreError> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM mail_messages WHERE account_id = ?",
            [account_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ---- query history ----

    pub fn append_query_history(&self, history: &MailQueryHistory) -> Result<(), StoreError> {
        let parameters = serde_json::to_string(&history.parameters)?;
        self.conn().execute(
            r#"
            INSERT INTO mail_query_history (
                id, account_id, query_type, parameters, messages_found,
                new_messages, queried_at, execution_time_ms, success, error_message
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                history.id,
                history.account_id,
                history.query_type,
                parameters,
                history.messages_found,
                history.new_messages,
                history.queried_at.to_rfc3339(),
                history.execution_time_ms,
                history.success,
                history.error_message,
            ],
        )?;
        Ok(())
    }

    pub fn list_query_history(
        &self,
        mut filters: QueryHistoryFilters,
    ) -> Result<Vec<MailQueryHistory>, StoreError> {
        if filters.limit == 0 {
            filters.limit = 50;
        }

        let mut sql = String::from("SELECT * FROM mail_query_history WHERE 1 = 1");
        let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(account_id) = filters.account_id {
            sql.push_str(" AND account_id = ?");
            params_vec.push(Box::new(account_id));
        }
        if let Some(query_type) = filters.query_type {
            sql.push_str(" AND query_type = ?");
            params_vec.push(Box::new(query_type));
        }
        sql.push_str(" ORDER BY queried_at DESC LIMIT ?");
        params_vec.push(Box::new(filters.limit as i64));

        let params_refs: Vec<&dyn ToSql> = params_vec.iter().map(|v| v.as_ref()).collect();
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let history = stmt
            .query_map(params_refs.as_slice(), MailQueryHistory::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(history)
    }

    pub fn purge_query_history_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let purged = self.conn().execute(
            "DELETE FROM mail_query_history WHERE queried_at < ?",
            [cutoff.to_rfc3339()],
        )?;
        Ok(purged)
    }

    // ---- delta links ----

    pub fn active_delta_link(
        &self,
        account_id: &str,
        folder_id: &str,
    ) -> Result<Option<DeltaLink>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM delta_links
            WHERE account_id = ? AND folder_id = ? AND is_active = 1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )?;
        let link = stmt
            .query_row([account_id, folder_id], DeltaLink::from_row)
            .optional()?;
        Ok(link)
    }

    /// Persist a new cursor for (account, folder), deactivating the prior
    /// active one in the same transaction. Never more than one active
    /// cursor per folder.
    pub fn save_delta_link(&self, link: &DeltaLink) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            UPDATE delta_links SET is_active = 0
            WHERE account_id = ? AND folder_id = ? AND is_active = 1
            "#,
            params![link.account_id, link.folder_id],
        )?;
        tx.execute(
            r#"
            INSERT INTO delta_links (
                id, account_id, folder_id, delta_token, created_at, last_used_at, is_active
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                link.id,
                link.account_id,
                link.folder_id,
                link.delta_token,
                link.created_at.to_rfc3339(),
                link.last_used_at.map(|dt| dt.to_rfc3339()),
                link.is_active,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn count_delta_links(
        &self,
        account_id: &str,
        folder_id: &str,
        active_only: bool,
    ) -> Result<i64, StoreError> {
        let sql = if active_only {
            "SELECT COUNT(*) FROM delta_links WHERE account_id = ? AND folder_id = ? AND is_active = 1"
        } else {
            "SELECT COUNT(*) FROM delta_links WHERE account_id = ? AND folder_id = ?"
        };
        let count = self
            .conn()
            .query_row(sql, [account_id, folder_id], |row| row.get(0))?;
        Ok(count)
    }

    // ---- webhook subscriptions ----

    pub fn save_webhook(&self, subscription: &WebhookSubscription) -> Result<(), StoreError> {
        let change_types = serde_json::to_string(&subscription.change_types)?;
        self.conn().execute(
            r#"
            INSERT INTO webhook_subscriptions (
                subscription_id, account_id, resource, change_types,
                notification_url, client_state, expires_at, created_at, is_active
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(subscription_id) DO UPDATE SET
                expires_at = excluded.expires_at,
                client_state = excluded.client_state,
                is_active = excluded.is_active
            "#,
            params![
                subscription.subscription_id,
                subscription.account_id,
                subscription.resource,
                change_types,
                subscription.notification_url,
                subscription.client_state,
                subscription.expires_at.to_rfc3339(),
                subscription.created_at.to_rfc3339(),
                subscription.is_active,
            ],
        )?;
        Ok(())
    }

    pub fn get_webhook(
        &self,
        subscription_id: &str,
    ) -> Result<Option<WebhookSubscription>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT * FROM webhook_subscriptions WHERE subscription_id = ? LIMIT 1")?;
        let subscription = stmt
            .query_row([subscription_id], WebhookSubscription::from_row)
            .optional()?;
        Ok(subscription)
    }

    pub fn webhooks_for_account(
        &self,
        account_id: &str,
    ) -> Result<Vec<WebhookSubscription>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM webhook_subscriptions WHERE account_id = ? AND is_active = 1",
        )?;
        let subscriptions = stmt
            .query_map([account_id], WebhookSubscription::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(subscriptions)
    }

    /// Active subscriptions that expire within the given window, for the
    /// renewal sweep.
    pub fn webhooks_expiring_within(
        &self,
        window_secs: i64,
    ) -> Result<Vec<WebhookSubscription>, StoreError> {
        let horizon = (Utc::now() + Duration::seconds(window_secs)).to_rfc3339();
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM webhook_subscriptions
            WHERE is_active = 1 AND expires_at <= ?
            ORDER BY expires_at ASC
            "#,
        )?;
        let subscriptions = stmt
            .query_map([horizon], WebhookSubscription::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(subscriptions)
    }

    pub fn update_webhook_expiry(
        &self,
        subscription_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE webhook_subscriptions SET expires_at = ? WHERE subscription_id = ?",
            params![expires_at.to_rfc3339(), subscription_id],
        )?;
        Ok(())
    }

    /// Deactivated subscriptions stay on disk for the audit grace period;
    /// the cleanup sweep removes them later.
    pub fn deactivate_webhook(&self, subscription_id: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE webhook_subscriptions SET is_active = 0 WHERE subscription_id = ?",
            [subscription_id],
        )?;
        Ok(())
    }

    pub fn purge_webhooks_inactive_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let purged = self.conn().execute(
            "DELETE FROM webhook_subscriptions WHERE is_active = 0 AND expires_at < ?",
            [cutoff.to_rfc3339()],
        )?;
        Ok(purged)
    }

    // ---- auth logs ----

    pub fn append_auth_log(&self, log: &AuthenticationLog) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            INSERT INTO auth_logs (
                id, account_id, event_kind, authentication_flow,
                success, error_code, error_message, logged_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                log.id,
                log.account_id,
                log.event_kind.to_string(),
                log.authentication_flow.to_string(),
                log.success,
                log.error_code,
                log.error_message,
                log.logged_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn list_auth_logs(
        &self,
        mut filters: AuthLogFilters,
    ) -> Result<Vec<AuthenticationLog>, StoreError> {
        if filters.limit == 0 {
            filters.limit = 50;
        }

        let mut sql = String::from("SELECT * FROM auth_logs WHERE 1 = 1");
        let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(account_id) = filters.account_id {
            sql.push_str(" AND account_id = ?");
            params_vec.push(Box::new(account_id));
        }
        if let Some(success) = filters.success {
            sql.push_str(" AND success = ?");
            params_vec.push(Box::new(success));
        }
        sql.push_str(" ORDER BY logged_at DESC LIMIT ?");
        params_vec.push(Box::new(filters.limit as i64));

        let params_refs: Vec<&dyn ToSql> = params_vec.iter().map(|v| v.as_ref()).collect();
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let logs = stmt
            .query_map(params_refs.as_slice(), AuthenticationLog::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(logs)
    }

    pub fn purge_auth_logs_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let purged = self.conn().execute(
            "DELETE FROM auth_logs WHERE logged_at < ?",
            [cutoff.to_rfc3339()],
        )?;
        Ok(purged)
    }

    // ---- external API calls ----

    /// Record a delivery attempt before dispatch; returns the row id used
    /// to complete it afterwards.
    pub fn record_api_call(&self, call: &ExternalApiCall) -> Result<i64, StoreError> {
        let payload = serde_json::to_string(&call.payload)?;
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO external_api_calls (
                message_id, endpoint, payload, response_status, response_body,
                success, retry_count, created_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                call.message_id,
                call.endpoint,
                payload,
                call.response_status,
                call.response_body,
                call.success,
                call.retry_count,
                call.created_at.to_rfc3339(),
                call.completed_at.map(|dt| dt.to_rfc3339()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn complete_api_call(
        &self,
        id: i64,
        response_status: Option<i64>,
        response_body: Option<&str>,
        success: bool,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            UPDATE external_api_calls SET
                response_status = ?, response_body = ?, success = ?,
                completed_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
            WHERE id = ?
            "#,
            params![response_status, response_body, success, id],
        )?;
        Ok(())
    }

    pub fn bump_api_call_retry(&self, id: i64) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE external_api_calls SET retry_count = retry_count + 1 WHERE id = ?",
            [id],
        )?;
        Ok(())
    }

    pub fn get_api_call(&self, id: i64) -> Result<Option<ExternalApiCall>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM external_api_calls WHERE id = ? LIMIT 1")?;
        let call = stmt.query_row([id], ExternalApiCall::from_row).optional()?;
        Ok(call)
    }

    /// Failed, completed calls still under the retry ceiling.
    pub fn retryable_api_calls(
        &self,
        max_retries: i64,
    ) -> Result<Vec<ExternalApiCall>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM external_api_calls
            WHERE success = 0 AND completed_at IS NOT NULL AND retry_count < ?
            ORDER BY created_at ASC
            "#,
        )?;
        let calls = stmt
            .query_map([max_retries], ExternalApiCall::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(calls)
    }

    /// Failed calls at or past the ceiling. Skipped permanently, never
    /// deleted by the retry sweep.
    pub fn count_exhausted_api_calls(&self, max_retries: i64) -> Result<i64, StoreError> {
        let count = self.conn().query_row(
            r#"
            SELECT COUNT(*) FROM external_api_calls
            WHERE success = 0 AND completed_at IS NOT NULL AND retry_count >= ?
            "#,
            [max_retries],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ---- pending authorizations ----

    pub fn put_pending_authorization(
        &self,
        pending: &PendingAuthorization,
    ) -> Result<(), StoreError> {
        let code_verifier = self.cipher.encrypt(&pending.code_verifier)?;
        self.conn().execute(
            r#"
            INSERT INTO pending_authorizations (state, account_id, code_verifier, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(state) DO UPDATE SET
                account_id = excluded.account_id,
                code_verifier = excluded.code_verifier,
                created_at = excluded.created_at
            "#,
            params![
                pending.state,
                pending.account_id,
                code_verifier,
                pending.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Load and consume the pending authorization for a state token. Each
    /// state is single-use: the row is gone after a successful take.
    pub fn take_pending_authorization(
        &self,
        state: &str,
    ) -> Result<Option<PendingAuthorization>, StoreError> {
        let row = {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            let row = {
                let mut stmt =
                    tx.prepare("SELECT * FROM pending_authorizations WHERE state = ? LIMIT 1")?;
                stmt.query_row([state], PendingAuthorization::from_row)
                    .optional()?
            };
            if row.is_some() {
                tx.execute("DELETE FROM pending_authorizations WHERE state = ?", [state])?;
            }
            tx.commit()?;
            row
        };

        row.map(|mut pending| {
            pending.code_verifier = self.cipher.decrypt(&pending.code_verifier)?;
            Ok(pending)
        })
        .transpose()
    }

    pub fn purge_pending_authorizations_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let purged = self.conn().execute(
            "DELETE FROM pending_authorizations WHERE created_at < ?",
            [cutoff.to_rfc3339()],
        )?;
        Ok(purged)
    }
}
