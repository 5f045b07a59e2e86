use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::models::{
    Account, AccountStatus, DeltaLink, ExternalApiCall, MailImportance, MailMessage,
    MailQueryHistory, Token, WebhookSubscription,
};
use crate::db::{QueryHistoryFilters, Store, StoreError};
use crate::forward::ForwardPort;
use crate::graph::{
    extract_delta_token, GraphError, GraphMessage, GraphPort, SendMailBody, SendMailMessage,
    SendMailPayload, SendMailRecipient, SubscriptionRequest,
};

/// Graph's maximum subscription lifetime for mailbox resources.
const WEBHOOK_EXPIRATION_MINUTES: i64 = 4230;
const DEFAULT_WEBHOOK_RESOURCE: &str = "/me/mailFolders('Inbox')/messages";
const DEFAULT_FOLDER: &str = "Inbox";

#[derive(Debug, Error)]
pub enum MailError {
    #[error("account not found: {account_id}")]
    AccountNotFound { account_id: String },

    /// The caller's remediation is reauthentication, not retry; surfaced
    /// as its own kind for that reason.
    #[error("no valid token for account {account_id}; reauthentication required")]
    NoValidToken { account_id: String },

    #[error("webhook subscription not found: {subscription_id}")]
    SubscriptionNotFound { subscription_id: String },

    #[error("webhook notification rejected for subscription {subscription_id}")]
    InvalidWebhookNotification { subscription_id: String },

    #[error("delta link expired for account {account_id} folder {folder}")]
    DeltaLinkExpired { account_id: String, folder: String },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Filters for a manual mail query.
#[derive(Debug, Clone)]
pub struct MailQuery {
    /// Target account, or every active account when `None`.
    pub account_id: Option<String>,
    pub folder: String,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub sender_email: Option<String>,
    pub is_read: Option<bool>,
    pub importance: Option<MailImportance>,
    pub search: Option<String>,
    pub top: Option<u32>,
}

impl Default for MailQuery {
    fn default() -> Self {
        Self {
            account_id: None,
            folder: DEFAULT_FOLDER.to_string(),
            date_from: None,
            date_to: None,
            sender_email: None,
            is_read: None,
            importance: None,
            search: None,
            top: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryOutcome {
    pub messages: Vec<MailMessage>,
    pub total_found: usize,
    pub new_count: usize,
    pub accounts_queried: usize,
    pub skipped_accounts: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub account_id: String,
    pub to_recipients: Vec<String>,
    pub cc_recipients: Vec<String>,
    pub bcc_recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    pub body_type: String,
    pub importance: MailImportance,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendOutcome {
    /// The provider does not return an id from sendMail; present only if
    /// it ever does.
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeltaSyncOutcome {
    pub accounts_synced: usize,
    pub new_messages: usize,
    pub updated_messages: usize,
    pub deleted_messages: usize,
    pub skipped_accounts: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookOutcome {
    pub subscription_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RetrySweep {
    pub retried: usize,
    pub failed: usize,
    /// Calls at the retry ceiling, skipped permanently.
    pub exhausted: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RenewalSweep {
    pub renewed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MailCleanup {
    pub history_purged: usize,
    pub webhooks_purged: usize,
}

/// Incoming webhook change entry. The notification is only a trigger; the
/// delta endpoint is the sole data source, so everything here beyond the
/// count is informational.
#[derive(Debug, Clone)]
pub struct NotificationChange {
    pub change_type: Option<String>,
    pub resource: Option<String>,
}

/// Owns mail collection: manual queries, incremental delta sync, send,
/// webhook lifecycle, and forwarding of newly seen messages downstream.
pub struct MailService {
    store: Arc<Store>,
    graph: Arc<dyn GraphPort>,
    forward: Arc<dyn ForwardPort>,
    config: Config,
}

impl MailService {
    pub fn new(
        store: Arc<Store>,
        graph: Arc<dyn GraphPort>,
        forward: Arc<dyn ForwardPort>,
        config: Config,
    ) -> Self {
        Self {
            store,
            graph,
            forward,
            config,
        }
    }

    /// Query mail for one account or all active accounts. In batch mode an
    /// account with a missing or stale token is skipped with a warning; it
    /// never aborts the batch.
    pub async fn query(&self, query: &MailQuery) -> Result<QueryOutcome, MailError> {
        let explicit = query.account_id.is_some();
        let accounts = self.resolve_accounts(query.account_id.as_deref())?;
        let filter = build_filter(query);

        let mut outcome = QueryOutcome {
            accounts_queried: accounts.len(),
            ..QueryOutcome::default()
        };

        for account in &accounts {
            let started = Instant::now();

            let token = match self.usable_token(&account.id)? {
                Some(token) => token,
                None => {
                    if explicit {
                        return Err(MailError::NoValidToken {
                            account_id: account.id.clone(),
                        });
                    }
                    warn!(
                        account_id = %account.id,
                        email = %account.email,
                        "skipping account without valid token"
                    );
                    outcome.skipped_accounts.push(account.id.clone());
                    continue;
                }
            };

            let parameters = serde_json::json!({
                "folder": query.folder,
                "filter": filter,
                "search": query.search,
                "top": query.top,
            });

            let page = match self
                .graph
                .get_messages(
                    &token.access_token,
                    &account.user_id,
                    &query.folder,
                    filter.as_deref(),
                    query.search.as_deref(),
                    query.top,
                )
                .await
            {
                Ok(page) => page,
                Err(graph_error) => {
                    self.log_query_history(
                        &account.id,
                        "manual",
                        parameters,
                        0,
                        0,
                        Some(elapsed_ms(started)),
                        false,
                        Some(&graph_error.to_string()),
                    );
                    if explicit {
                        return Err(graph_error.into());
                    }
                    warn!(
                        account_id = %account.id,
                        error = %graph_error,
                        "mail query failed for account, continuing batch"
                    );
                    outcome.skipped_accounts.push(account.id.clone());
                    continue;
                }
            };

            let mut new_for_account = 0usize;
            outcome.total_found += page.value.len();

            for raw in &page.value {
                if raw.removed.is_some() {
                    continue;
                }
                let Some(message) = map_graph_message(raw, &account.id, &query.folder) else {
                    warn!(account_id = %account.id, "skipping graph message without id");
                    continue;
                };

                if self.store.insert_mail_if_absent(&message)? {
                    new_for_account += 1;
                    self.forward_message(&message).await;
                    outcome.messages.push(message);
                } else if let Some(existing) =
                    self.store.get_mail(&account.id, &message.message_id)?
                {
                    outcome.messages.push(existing);
                }
            }

            outcome.new_count += new_for_account;
            self.log_query_history(
                &account.id,
                "manual",
                serde_json::json!({
                    "folder": query.folder,
                    "filter": filter,
                    "search": query.search,
                    "top": query.top,
                }),
                page.value.len() as i64,
                new_for_account as i64,
                Some(elapsed_ms(started)),
                true,
                None,
            );
        }

        info!(
            accounts_queried = outcome.accounts_queried,
            total_found = outcome.total_found,
            new_count = outcome.new_count,
            "mail query completed"
        );
        Ok(outcome)
    }

    /// Send a message through the provider. Requires a fresh token; an
    /// expired one is a reauthentication condition, not a send failure.
    pub async fn send(&self, request: &SendRequest) -> Result<SendOutcome, MailError> {
        let account = self.require_account(&request.account_id)?;
        let token = self
            .usable_token(&account.id)?
            .ok_or_else(|| MailError::NoValidToken {
                account_id: account.id.clone(),
            })?;

        let payload = SendMailPayload {
            message: SendMailMessage {
                subject: request.subject.clone(),
                body: SendMailBody {
                    content_type: request.body_type.clone(),
                    content: request.body.clone(),
                },
                to_recipients: request
                    .to_recipients
                    .iter()
                    .map(|address| SendMailRecipient::new(address))
                    .collect(),
                cc_recipients: request
                    .cc_recipients
                    .iter()
                    .map(|address| SendMailRecipient::new(address))
                    .collect(),
                bcc_recipients: request
                    .bcc_recipients
                    .iter()
                    .map(|address| SendMailRecipient::new(address))
                    .collect(),
                importance: request.importance.to_string(),
            },
            save_to_sent_items: true,
        };

        let message_id = self
            .graph
            .send_message(&token.access_token, &account.user_id, &payload)
            .await?;

        info!(
            account_id = %account.id,
            subject = %request.subject,
            recipients = request.to_recipients.len(),
            "mail sent"
        );
        Ok(SendOutcome { message_id })
    }

    /// Incremental sync via delta links for one account or all active
    /// accounts. The first sync of a (account, folder) pair seeds the
    /// cursor with a baseline delta enumeration.
    pub async fn delta_sync(
        &self,
        account_id: Option<&str>,
        folder: &str,
    ) -> Result<DeltaSyncOutcome, MailError> {
        let explicit = account_id.is_some();
        let accounts = self.resolve_accounts(account_id)?;

        let mut outcome = DeltaSyncOutcome::default();

        for account in &accounts {
            let token = match self.usable_token(&account.id)? {
                Some(token) => token,
                None => {
                    if explicit {
                        return Err(MailError::NoValidToken {
                            account_id: account.id.clone(),
                        });
                    }
                    warn!(
                        account_id = %account.id,
                        "skipping delta sync for account without valid token"
                    );
                    outcome.skipped_accounts.push(account.id.clone());
                    continue;
                }
            };

            match self.delta_sync_account(account, &token, folder).await {
                Ok((new, updated, deleted)) => {
                    outcome.accounts_synced += 1;
                    outcome.new_messages += new;
                    outcome.updated_messages += updated;
                    outcome.deleted_messages += deleted;
                }
                Err(error) => {
                    if explicit {
                        return Err(error);
                    }
                    warn!(
                        account_id = %account.id,
                        %error,
                        "delta sync failed for account, continuing batch"
                    );
                    outcome.skipped_accounts.push(account.id.clone());
                }
            }
        }

        info!(
            accounts_synced = outcome.accounts_synced,
            new_messages = outcome.new_messages,
            "delta sync completed"
        );
        Ok(outcome)
    }

    async fn delta_sync_account(
        &self,
        account: &Account,
        token: &Token,
        folder: &str,
    ) -> Result<(usize, usize, usize), MailError> {
        let started = Instant::now();

        let previous_link = self.store.active_delta_link(&account.id, folder)?;
        let previous_token = previous_link.map(|link| link.delta_token);

        let parameters = serde_json::json!({
            "folder": folder,
            "delta_token": previous_token,
        });

        let result = self
            .delta_pages(account, token, folder, previous_token.as_deref())
            .await;

        match result {
            Ok((new, updated, deleted, found)) => {
                self.log_query_history(
                    &account.id,
                    "delta",
                    parameters,
                    found as i64,
                    new as i64,
                    Some(elapsed_ms(started)),
                    true,
                    None,
                );
                Ok((new, updated, deleted))
            }
            Err(error) => {
                self.log_query_history(
                    &account.id,
                    "delta",
                    parameters,
                    0,
                    0,
                    Some(elapsed_ms(started)),
                    false,
                    Some(&error.to_string()),
                );
                Err(error)
            }
        }
    }

    async fn delta_pages(
        &self,
        account: &Account,
        token: &Token,
        folder: &str,
        delta_token: Option<&str>,
    ) -> Result<(usize, usize, usize, usize), MailError> {
        let mut page = self
            .graph
            .get_delta_messages(&token.access_token, &account.user_id, folder, delta_token)
            .await
            .map_err(|e| map_delta_error(e, account, folder))?;

        let mut new = 0usize;
        let mut updated = 0usize;
        let mut deleted = 0usize;
        let mut found = 0usize;
        let mut newest_delta_link: Option<String> = None;

        loop {
            found += page.value.len();
            for raw in &page.value {
                if raw.removed.is_some() {
                    // Removals are counted but the stored copy is kept;
                    // this is a collection record, not a mirror.
                    deleted += 1;
                    continue;
                }
                let Some(message) = map_graph_message(raw, &account.id, folder) else {
                    warn!(account_id = %account.id, "skipping delta message without id");
                    continue;
                };

                if self.store.insert_mail_if_absent(&message)? {
                    new += 1;
                    self.forward_message(&message).await;
                } else {
                    self.store.refresh_mail_flags(
                        &account.id,
                        &message.message_id,
                        message.is_read,
                        &message.categories,
                    )?;
                    updated += 1;
                }
            }

            if let Some(delta_link) = page.delta_link.take() {
                newest_delta_link = Some(delta_link);
            }

            match page.next_link.take() {
                Some(next) => {
                    page = self
                        .graph
                        .get_delta_page(&token.access_token, &next)
                        .await
                        .map_err(|e| map_delta_error(e, account, folder))?;
                }
                None => break,
            }
        }

        // Rotate the cursor: the new link becomes the single active one
        // for this (account, folder) pair.
        if let Some(delta_link) = newest_delta_link {
            if let Some(delta_token) = extract_delta_token(&delta_link) {
                self.store.save_delta_link(&DeltaLink {
                    id: Uuid::new_v4().to_string(),
                    account_id: account.id.clone(),
                    folder_id: folder.to_string(),
                    delta_token,
                    created_at: Utc::now(),
                    last_used_at: Some(Utc::now()),
                    is_active: true,
                })?;
            } else {
                warn!(
                    account_id = %account.id,
                    folder,
                    "delta response carried no extractable delta token"
                );
            }
        }

        Ok((new, updated, deleted, found))
    }

    /// Create an upstream webhook subscription and mirror it locally with
    /// a fresh per-subscription client_state.
    pub async fn setup_webhook(
        &self,
        account_id: &str,
        notification_url: &str,
        resource: Option<&str>,
        change_types: Option<Vec<String>>,
    ) -> Result<WebhookOutcome, MailError> {
        let account = self.require_account(account_id)?;
        let token = self
            .usable_token(account_id)?
            .ok_or_else(|| MailError::NoValidToken {
                account_id: account_id.to_string(),
            })?;

        let resource = resource.unwrap_or(DEFAULT_WEBHOOK_RESOURCE).to_string();
        let change_types =
            change_types.unwrap_or_else(|| vec!["created".to_string(), "updated".to_string()]);
        let client_state = Uuid::new_v4().to_string();
        let requested_expiry = Utc::now() + Duration::minutes(WEBHOOK_EXPIRATION_MINUTES);

        let created = self
            .graph
            .create_subscription(
                &token.access_token,
                &SubscriptionRequest {
                    resource: resource.clone(),
                    notification_url: notification_url.to_string(),
                    change_types: change_types.clone(),
                    client_state: client_state.clone(),
                    expires_at: requested_expiry,
                },
            )
            .await?;

        let expires_at = DateTime::parse_from_rfc3339(&created.expiration_date_time)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(requested_expiry);

        self.store.save_webhook(&WebhookSubscription {
            subscription_id: created.id.clone(),
            account_id: account.id.clone(),
            resource,
            change_types,
            notification_url: notification_url.to_string(),
            client_state,
            expires_at,
            created_at: Utc::now(),
            is_active: true,
        })?;

        info!(
            account_id = %account.id,
            subscription_id = %created.id,
            "webhook subscription created"
        );
        Ok(WebhookOutcome {
            subscription_id: created.id,
            expires_at,
        })
    }

    /// Extend an active subscription before it lapses.
    pub async fn renew_webhook(&self, subscription_id: &str) -> Result<WebhookOutcome, MailError> {
        let subscription = self
            .store
            .get_webhook(subscription_id)?
            .filter(|sub| sub.is_active)
            .ok_or_else(|| MailError::SubscriptionNotFound {
                subscription_id: subscription_id.to_string(),
            })?;

        let token = self
            .usable_token(&subscription.account_id)?
            .ok_or_else(|| MailError::NoValidToken {
                account_id: subscription.account_id.clone(),
            })?;

        let expires_at = Utc::now() + Duration::minutes(WEBHOOK_EXPIRATION_MINUTES);
        self.graph
            .renew_subscription(&token.access_token, subscription_id, expires_at)
            .await?;
        self.store.update_webhook_expiry(subscription_id, expires_at)?;

        info!(subscription_id, "webhook subscription renewed");
        Ok(WebhookOutcome {
            subscription_id: subscription_id.to_string(),
            expires_at,
        })
    }

    /// Remove the upstream subscription (best effort) and deactivate the
    /// local mirror. The row stays for the audit grace period.
    pub async fn delete_webhook(&self, subscription_id: &str) -> Result<(), MailError> {
        let subscription = self.store.get_webhook(subscription_id)?.ok_or_else(|| {
            MailError::SubscriptionNotFound {
                subscription_id: subscription_id.to_string(),
            }
        })?;

        match self.usable_token(&subscription.account_id)? {
            Some(token) => {
                if let Err(graph_error) = self
                    .graph
                    .delete_subscription(&token.access_token, subscription_id)
                    .await
                {
                    warn!(
                        subscription_id,
                        error = %graph_error,
                        "upstream webhook deletion failed; deactivating locally"
                    );
                }
            }
            None => warn!(
                subscription_id,
                "no valid token for upstream webhook deletion; deactivating locally"
            ),
        }

        self.store.deactivate_webhook(subscription_id)?;
        info!(subscription_id, "webhook subscription deactivated");
        Ok(())
    }

    /// Validate an inbound notification and trigger a delta sync for the
    /// owning account. The notification payload itself is never ingested:
    /// only the delta endpoint returns dedup-safe state.
    pub async fn handle_notification(
        &self,
        subscription_id: &str,
        client_state: &str,
        changes: &[NotificationChange],
    ) -> Result<DeltaSyncOutcome, MailError> {
        let subscription = self
            .store
            .get_webhook(subscription_id)?
            .filter(|sub| sub.is_active)
            .ok_or_else(|| MailError::SubscriptionNotFound {
                subscription_id: subscription_id.to_string(),
            })?;

        // Fail closed: a notification that cannot prove it came from our
        // subscription triggers nothing.
        if subscription.client_state != client_state {
            warn!(
                subscription_id,
                "webhook notification rejected: client_state mismatch"
            );
            return Err(MailError::InvalidWebhookNotification {
                subscription_id: subscription_id.to_string(),
            });
        }

        let folder = folder_from_resource(&subscription.resource);
        info!(
            subscription_id,
            account_id = %subscription.account_id,
            changes = changes.len(),
            %folder,
            "webhook notification accepted; triggering delta sync"
        );

        self.delta_sync(Some(&subscription.account_id), &folder)
            .await
    }

    pub fn list_webhooks(&self, account_id: &str) -> Result<Vec<WebhookSubscription>, MailError> {
        Ok(self.store.webhooks_for_account(account_id)?)
    }

    pub fn query_history(
        &self,
        filters: QueryHistoryFilters,
    ) -> Result<Vec<MailQueryHistory>, MailError> {
        Ok(self.store.list_query_history(filters)?)
    }

    /// Forward a newly stored message downstream. The delivery attempt is
    /// recorded before dispatch and completed after; failure never rolls
    /// back the stored message, it only leaves a retryable call record.
    async fn forward_message(&self, message: &MailMessage) {
        let Some(endpoint) = self.config.forward_url.clone() else {
            return;
        };

        let payload = forward_payload(message);
        let call_id = match self.store.record_api_call(&ExternalApiCall {
            id: 0,
            message_id: message.message_id.clone(),
            endpoint: endpoint.clone(),
            payload: payload.clone(),
            response_status: None,
            response_body: None,
            success: false,
            retry_count: 0,
            created_at: Utc::now(),
            completed_at: None,
        }) {
            Ok(id) => id,
            Err(store_error) => {
                error!(
                    message_id = %message.message_id,
                    error = %store_error,
                    "failed to record external API call"
                );
                return;
            }
        };

        self.dispatch_api_call(call_id, &endpoint, &payload).await;
    }

    async fn dispatch_api_call(&self, call_id: i64, endpoint: &str, payload: &serde_json::Value) {
        let completion = match self.forward.send_mail_data(endpoint, payload).await {
            Ok(response) => {
                (Some(response.status as i64), Some(response.body), true)
            }
            Err(forward_error) => {
                warn!(
                    endpoint,
                    error = %forward_error,
                    "external API forwarding failed"
                );
                (
                    forward_error.status().map(i64::from),
                    Some(forward_error.to_string()),
                    false,
                )
            }
        };

        if let Err(store_error) = self.store.complete_api_call(
            call_id,
            completion.0,
            completion.1.as_deref(),
            completion.2,
        ) {
            error!(call_id, error = %store_error, "failed to complete external API call record");
        }
    }

    /// Retry failed deliveries still under the retry ceiling. Exhausted
    /// rows are skipped permanently, never deleted.
    pub async fn retry_failed_calls(&self) -> Result<RetrySweep, MailError> {
        let max_retries = self.config.max_forward_retries;
        let candidates = self.store.retryable_api_calls(max_retries)?;

        let mut sweep = RetrySweep {
            exhausted: self.store.count_exhausted_api_calls(max_retries)?,
            ..RetrySweep::default()
        };

        for call in candidates {
            self.store.bump_api_call_retry(call.id)?;
            self.dispatch_api_call(call.id, &call.endpoint, &call.payload).await;

            match self.store.get_api_call(call.id)? {
                Some(updated) if updated.success => sweep.retried += 1,
                _ => sweep.failed += 1,
            }
        }

        Ok(sweep)
    }

    /// Renew every active subscription expiring within the window.
    /// Per-subscription failures are logged and the sweep continues.
    pub async fn renew_expiring_webhooks(
        &self,
        window_secs: i64,
    ) -> Result<RenewalSweep, MailError> {
        let expiring = self.store.webhooks_expiring_within(window_secs)?;
        let mut sweep = RenewalSweep::default();

        for subscription in expiring {
            match self.renew_webhook(&subscription.subscription_id).await {
                Ok(_) => sweep.renewed += 1,
                Err(error) => {
                    sweep.failed += 1;
                    warn!(
                        subscription_id = %subscription.subscription_id,
                        %error,
                        "webhook renewal failed during sweep"
                    );
                }
            }
        }

        Ok(sweep)
    }

    pub fn cleanup(
        &self,
        history_retention_days: i64,
        webhook_retention_days: i64,
    ) -> Result<MailCleanup, MailError> {
        let now = Utc::now();
        Ok(MailCleanup {
            history_purged: self
                .store
                .purge_query_history_before(now - Duration::days(history_retention_days))?,
            webhooks_purged: self
                .store
                .purge_webhooks_inactive_before(now - Duration::days(webhook_retention_days))?,
        })
    }

    fn require_account(&self, account_id: &str) -> Result<Account, MailError> {
        self.store
            .get_account(account_id)?
            .ok_or_else(|| MailError::AccountNotFound {
                account_id: account_id.to_string(),
            })
    }

    fn resolve_accounts(&self, account_id: Option<&str>) -> Result<Vec<Account>, MailError> {
        match account_id {
            Some(account_id) => Ok(vec![self.require_account(account_id)?]),
            None => Ok(self
                .store
                .list_accounts()?
                .into_iter()
                .filter(|account| account.status == AccountStatus::Active)
                .collect()),
        }
    }

    fn usable_token(&self, account_id: &str) -> Result<Option<Token>, MailError> {
        Ok(self
            .store
            .get_token(account_id)?
            .filter(|token| token.is_usable()))
    }

    /// Append one history row. Like audit logging, a history write failure
    /// is reported but never fails the operation it describes.
    #[allow(clippy::too_many_arguments)]
    fn log_query_history(
        &self,
        account_id: &str,
        query_type: &str,
        parameters: serde_json::Value,
        messages_found: i64,
        new_messages: i64,
        execution_time_ms: Option<i64>,
        success: bool,
        error_message: Option<&str>,
    ) {
        let history = MailQueryHistory {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            query_type: query_type.to_string(),
            parameters,
            messages_found,
            new_messages,
            queried_at: Utc::now(),
            execution_time_ms,
            success,
            error_message: error_message.map(str::to_string),
        };

        if let Err(store_error) = self.store.append_query_history(&history) {
            error!(
                account_id,
                query_type,
                error = %store_error,
                "failed to append query history"
            );
        }
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    started.elapsed().as_millis() as i64
}

fn map_delta_error(error: GraphError, account: &Account, folder: &str) -> MailError {
    // Graph answers 410 Gone when a delta token is too old to resume.
    if let GraphError::Status { status: 410, .. } = error {
        return MailError::DeltaLinkExpired {
            account_id: account.id.clone(),
            folder: folder.to_string(),
        };
    }
    error.into()
}

/// Build an OData filter expression from the query's structured filters.
pub(crate) fn build_filter(query: &MailQuery) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();

    if let Some(date_from) = query.date_from {
        parts.push(format!(
            "receivedDateTime ge {}",
            date_from.format("%Y-%m-%dT%H:%M:%SZ")
        ));
    }
    if let Some(date_to) = query.date_to {
        parts.push(format!(
            "receivedDateTime lt {}",
            date_to.format("%Y-%m-%dT%H:%M:%SZ")
        ));
    }
    if let Some(sender) = query
        .sender_email
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        parts.push(format!("from/emailAddress/address eq '{sender}'"));
    }
    if let Some(is_read) = query.is_read {
        parts.push(format!("isRead eq {is_read}"));
    }
    if let Some(importance) = query.importance {
        parts.push(format!("importance eq '{importance}'"));
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" and "))
    }
}

/// Map a raw Graph message onto the stored entity. Messages without an id
/// cannot be deduplicated and are dropped by the caller.
pub(crate) fn map_graph_message(
    raw: &GraphMessage,
    account_id: &str,
    folder: &str,
) -> Option<MailMessage> {
    let message_id = raw.id.clone()?;

    let (sender_name, sender_email) = raw
        .from
        .as_ref()
        .map(|from| {
            (
                from.name().map(str::to_string),
                from.address().unwrap_or_default().to_string(),
            )
        })
        .unwrap_or((None, String::new()));

    let importance = raw
        .importance
        .as_deref()
        .and_then(|value| value.parse::<MailImportance>().ok())
        .unwrap_or(MailImportance::Normal);

    let received_at = raw
        .received_date_time
        .as_deref()
        .and_then(parse_graph_datetime)
        .unwrap_or_else(Utc::now);
    let sent_at = raw.sent_date_time.as_deref().and_then(parse_graph_datetime);

    let (body_content, body_content_type) = match &raw.body {
        Some(body) => (
            body.content.clone(),
            body.content_type
                .clone()
                .unwrap_or_else(|| "html".to_string())
                .to_ascii_lowercase(),
        ),
        None => (None, "html".to_string()),
    };

    Some(MailMessage {
        id: Uuid::new_v4().to_string(),
        message_id,
        internet_message_id: raw.internet_message_id.clone(),
        account_id: account_id.to_string(),
        subject: raw.subject.clone().unwrap_or_default(),
        sender_email,
        sender_name,
        to_recipients: recipient_addresses(raw.to_recipients.as_deref()),
        cc_recipients: recipient_addresses(raw.cc_recipients.as_deref()),
        bcc_recipients: recipient_addresses(raw.bcc_recipients.as_deref()),
        body_preview: raw.body_preview.clone(),
        body_content,
        body_content_type,
        importance,
        is_read: raw.is_read.unwrap_or(false),
        has_attachments: raw.has_attachments.unwrap_or(false),
        received_at,
        sent_at,
        folder: Some(folder.to_string()),
        categories: raw.categories.clone().unwrap_or_default(),
        created_at: Utc::now(),
    })
}

fn recipient_addresses(recipients: Option<&[crate::graph::GraphRecipient]>) -> Vec<String> {
    recipients
        .unwrap_or_default()
        .iter()
        .filter_map(|recipient| recipient.address())
        .map(str::to_string)
        .collect()
}

fn parse_graph_datetime(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn forward_payload(message: &MailMessage) -> serde_json::Value {
    serde_json::json!({
        "message_id": message.message_id,
        "subject": message.subject,
        "sender_email": message.sender_email,
        "sender_name": message.sender_name,
        "body_content": message.body_content,
        "body_preview": message.body_preview,
        "received_datetime": message.received_at.to_rfc3339(),
        "importance": message.importance.to_string(),
        "folder": message.folder,
    })
}

/// Pull the folder name out of a subscription resource such as
/// `/me/mailFolders('Inbox')/messages`.
pub(crate) fn folder_from_resource(resource: &str) -> String {
    resource
        .split_once("mailFolders('")
        .and_then(|(_, rest)| rest.split_once("')"))
        .map(|(folder, _)| folder.to_string())
        .filter(|folder| !folder.is_empty())
        .unwrap_or_else(|| DEFAULT_FOLDER.to_string())
}
