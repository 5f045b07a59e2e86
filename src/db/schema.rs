use anyhow::Result;
use rusqlite::Connection;

pub fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            user_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            client_id TEXT NOT NULL,
            authentication_flow TEXT NOT NULL CHECK(authentication_flow IN ('authorization_code', 'device_code')),
            status TEXT NOT NULL CHECK(status IN ('active', 'inactive', 'suspended')),
            scopes TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            last_authenticated_at TEXT
        );

        CREATE TABLE IF NOT EXISTS auth_code_accounts (
            account_id TEXT PRIMARY KEY REFERENCES accounts(id) ON DELETE CASCADE,
            client_secret TEXT NOT NULL,
            redirect_uri TEXT NOT NULL,
            authority TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS device_code_accounts (
            account_id TEXT PRIMARY KEY REFERENCES accounts(id) ON DELETE CASCADE,
            device_code TEXT,
            user_code TEXT,
            verification_uri TEXT,
            expires_in INTEGER,
            interval INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT
        );

        CREATE TABLE IF NOT EXISTS tokens (
            account_id TEXT PRIMARY KEY REFERENCES accounts(id) ON DELETE CASCADE,
            access_token TEXT NOT NULL,
            refresh_token TEXT,
            token_type TEXT NOT NULL DEFAULT 'Bearer',
            expires_at TEXT NOT NULL,
            scopes TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('valid', 'expired', 'revoked', 'invalid')),
            created_at TEXT NOT NULL,
            updated_at TEXT
        );

        CREATE TABLE IF NOT EXISTS mail_messages (
            id TEXT PRIMARY KEY,
            message_id TEXT NOT NULL,
            internet_message_id TEXT,
            account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            subject TEXT NOT NULL,
            sender_email TEXT NOT NULL,
            sender_name TEXT,
            to_recipients TEXT NOT NULL,
            cc_recipients TEXT NOT NULL,
            bcc_recipients TEXT NOT NULL,
            body_preview TEXT,
            body_content TEXT,
            body_content_type TEXT NOT NULL DEFAULT 'html',
            importance TEXT NOT NULL CHECK(importance IN ('low', 'normal', 'high')),
            is_read BOOLEAN NOT NULL DEFAULT false,
            has_attachments BOOLEAN NOT NULL DEFAULT false,
            received_at TEXT NOT NULL,
            sent_at TEXT,
            folder TEXT,
            categories TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(account_id, message_id)
        );

        CREATE TABLE IF NOT EXISTS mail_query_history (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            query_type TEXT NOT NULL,
            parameters TEXT,
            messages_found INTEGER NOT NULL DEFAULT 0,
            new_messages INTEGER NOT NULL DEFAULT 0,
            queried_at TEXT NOT NULL,
            execution_time_ms INTEGER,
            success BOOLEAN NOT NULL DEFAULT true,
            error_message TEXT
        );

        CREATE TABLE IF NOT EXISTS delta_links (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            folder_id TEXT NOT NULL,
            delta_token TEXT NOT NULL,
            created_at TEXT NOT NULL,
            last_used_at TEXT,
            is_active BOOLEAN NOT NULL DEFAULT true
        );

        CREATE TABLE IF NOT EXISTS webhook_subscriptions (
            subscription_id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            resource TEXT NOT NULL,
            change_types TEXT NOT NULL,
            notification_url TEXT NOT NULL,
            client_state TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            is_active BOOLEAN NOT NULL DEFAULT true
        );

        CREATE TABLE IF NOT EXISTS auth_logs (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            event_kind TEXT NOT NULL,
            authentication_flow TEXT NOT NULL,
            success BOOLEAN NOT NULL,
            error_code TEXT,
            error_message TEXT,
            logged_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS external_api_calls (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            payload TEXT,
            response_status INTEGER,
            response_body TEXT,
            success BOOLEAN NOT NULL DEFAULT false,
            retry_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            completed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS pending_authorizations (
            state TEXT PRIMARY KEY,
            account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            code_verifier TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_mail_messages_account_id ON mail_messages(account_id);
        CREATE INDEX IF NOT EXISTS idx_mail_messages_received_at ON mail_messages(received_at);
        CREATE INDEX IF NOT EXISTS idx_query_history_account_id ON mail_query_history(account_id);
        CREATE INDEX IF NOT EXISTS idx_delta_links_lookup ON delta_links(account_id, folder_id, is_active);
        CREATE INDEX IF NOT EXISTS idx_webhooks_account_id ON webhook_subscriptions(account_id);
        CREATE INDEX IF NOT EXISTS idx_webhooks_expires_at ON webhook_subscriptions(expires_at);
        CREATE INDEX IF NOT EXISTS idx_auth_logs_account_id ON auth_logs(account_id);
        CREATE INDEX IF NOT EXISTS idx_api_calls_retry ON external_api_calls(success, retry_count);
        CREATE INDEX IF NOT EXISTS idx_tokens_expires_at ON tokens(expires_at);
        "#,
    )?;

    Ok(())
}
