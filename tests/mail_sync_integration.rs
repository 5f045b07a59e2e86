use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use mailgate::config::{Config, SchedulerConfig};
use mailgate::crypto::TokenCipher;
use mailgate::db::models::{
    Account, AccountStatus, AuthenticationFlow, MailImportance, Token, TokenStatus,
};
use mailgate::db::{QueryHistoryFilters, Store};
use mailgate::forward::{ForwardError, ForwardPort, ForwardResponse};
use mailgate::graph::{
    GraphDeltaPage, GraphError, GraphMessagesPage, GraphPort, GraphSubscription, SendMailPayload,
    SubscriptionRequest,
};
use mailgate::sync::{MailError, MailQuery, MailService, NotificationChange, SendRequest};

fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("mailgate-sync-it-{}.db", Uuid::new_v4()))
}

fn test_config(db_path: &Path, forward_url: Option<String>) -> Config {
    Config {
        database_path: db_path.to_path_buf(),
        tenant_id: "tenant-a".to_string(),
        client_id: "client-a".to_string(),
        client_secret: "secret-a".to_string(),
        redirect_uri: "http://localhost:8000/auth/callback".to_string(),
        authority: "https://login.microsoftonline.com".to_string(),
        graph_base: "https://graph.microsoft.com/v1.0".to_string(),
        scopes: vec!["offline_access".to_string(), "Mail.Read".to_string()],
        encryption_key: "integration-test-key".to_string(),
        encryption_salt: "integration-test-salt".to_string(),
        forward_url,
        forward_timeout: StdDuration::from_secs(30),
        max_forward_retries: 3,
        scheduler: SchedulerConfig::default(),
    }
}

fn message_json(id: &str, subject: &str) -> serde_json::Value {
    json!({
        "id": id,
        "internetMessageId": format!("<{id}@example.com>"),
        "subject": subject,
        "from": { "emailAddress": { "name": "Sender", "address": "sender@example.com" } },
        "toRecipients": [{ "emailAddress": { "address": "owner@example.com" } }],
        "bodyPreview": "preview",
        "body": { "contentType": "html", "content": "<p>body</p>" },
        "importance": "normal",
        "isRead": false,
        "hasAttachments": false,
        "receivedDateTime": "2026-03-02T09:30:00Z",
        "sentDateTime": "2026-03-02T09:29:00Z",
        "categories": []
    })
}

fn messages_page(messages: Vec<serde_json::Value>) -> GraphMessagesPage {
    serde_json::from_value(json!({ "value": messages })).expect("build messages page")
}

fn delta_page(
    messages: Vec<serde_json::Value>,
    next_link: Option<&str>,
    delta_token: Option<&str>,
) -> GraphDeltaPage {
    let mut page = json!({ "value": messages });
    if let Some(next) = next_link {
        page["@odata.nextLink"] = json!(next);
    }
    if let Some(token) = delta_token {
        page["@odata.deltaLink"] = json!(format!(
            "https://graph.microsoft.com/v1.0/me/messages/delta?$deltatoken={token}"
        ));
    }
    serde_json::from_value(page).expect("build delta page")
}

/// Scripted Graph port: queued responses per operation, with call
/// recording for assertions.
#[derive(Default)]
struct ScriptedGraph {
    messages_pages: Mutex<VecDeque<Result<GraphMessagesPage, GraphError>>>,
    delta_pages: Mutex<VecDeque<Result<GraphDeltaPage, GraphError>>>,
    next_pages: Mutex<VecDeque<Result<GraphDeltaPage, GraphError>>>,
    delta_tokens_seen: Mutex<Vec<Option<String>>>,
    delta_calls: AtomicUsize,
    send_calls: AtomicUsize,
    subscription_counter: AtomicUsize,
    renew_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl ScriptedGraph {
    fn queue_messages(&self, page: Result<GraphMessagesPage, GraphError>) {
        self.messages_pages.lock().expect("lock").push_back(page);
    }

    fn queue_delta(&self, page: Result<GraphDeltaPage, GraphError>) {
        self.delta_pages.lock().expect("lock").push_back(page);
    }

    fn queue_next_page(&self, page: Result<GraphDeltaPage, GraphError>) {
        self.next_pages.lock().expect("lock").push_back(page);
    }
}

#[async_trait]
impl GraphPort for ScriptedGraph {
    async fn get_messages(
        &self,
        _access_token: &str,
        _user_id: &str,
        _folder: &str,
        _filter: Option<&str>,
        _search: Option<&str>,
        _top: Option<u32>,
    ) -> Result<GraphMessagesPage, GraphError> {
        self.messages_pages
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| Ok(messages_page(vec![])))
    }

    async fn get_delta_messages(
        &self,
        _access_token: &str,
        _user_id: &str,
        _folder: &str,
        delta_token: Option<&str>,
    ) -> Result<GraphDeltaPage, GraphError> {
        self.delta_calls.fetch_add(1, Ordering::SeqCst);
        self.delta_tokens_seen
            .lock()
            .expect("lock")
            .push(delta_token.map(str::to_string));
        self.delta_pages
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| Ok(delta_page(vec![], None, None)))
    }

    async fn get_delta_page(
        &self,
        _access_token: &str,
        _next_link: &str,
    ) -> Result<GraphDeltaPage, GraphError> {
        self.next_pages
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| Ok(delta_page(vec![], None, None)))
    }

    async fn send_message(
        &self,
        _access_token: &str,
        _user_id: &str,
        _payload: &SendMailPayload,
    ) -> Result<Option<String>, GraphError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        // Graph's sendMail answers 202 with no body.
        Ok(None)
    }

    async fn create_subscription(
        &self,
        _access_token: &str,
        request: &SubscriptionRequest,
    ) -> Result<GraphSubscription, GraphError> {
        let n = self.subscription_counter.fetch_add(1, Ordering::SeqCst);
        Ok(GraphSubscription {
            id: format!("sub-{n}"),
            resource: Some(request.resource.clone()),
            expiration_date_time: request.expires_at.to_rfc3339(),
            client_state: Some(request.client_state.clone()),
        })
    }

    async fn renew_subscription(
        &self,
        _access_token: &str,
        subscription_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<GraphSubscription, GraphError> {
        self.renew_calls.fetch_add(1, Ordering::SeqCst);
        Ok(GraphSubscription {
            id: subscription_id.to_string(),
            resource: None,
            expiration_date_time: expires_at.to_rfc3339(),
            client_state: None,
        })
    }

    async fn delete_subscription(
        &self,
        _access_token: &str,
        _subscription_id: &str,
    ) -> Result<(), GraphError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct ScriptedForward {
    responses: Mutex<VecDeque<Result<ForwardResponse, ForwardError>>>,
    calls: Mutex<Vec<(String, serde_json::Value)>>,
}

impl ScriptedForward {
    fn queue(&self, response: Result<ForwardResponse, ForwardError>) {
        self.responses.lock().expect("lock").push_back(response);
    }

    fn call_count(&self) -> usize {
        self.calls.lock().expect("lock").len()
    }
}

#[async_trait]
impl ForwardPort for ScriptedForward {
    async fn send_mail_data(
        &self,
        endpoint: &str,
        payload: &serde_json::Value,
    ) -> Result<ForwardResponse, ForwardError> {
        self.calls
            .lock()
            .expect("lock")
            .push((endpoint.to_string(), payload.clone()));
        self.responses
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| {
                Ok(ForwardResponse {
                    status: 200,
                    body: "ok".to_string(),
                })
            })
    }
}

struct Fixture {
    service: MailService,
    store: Arc<Store>,
    graph: Arc<ScriptedGraph>,
    forward: Arc<ScriptedForward>,
    db_path: PathBuf,
}

impl Fixture {
    fn new(forward_url: Option<String>) -> Self {
        let db_path = temp_db_path();
        let config = test_config(&db_path, forward_url);
        let cipher = TokenCipher::new(&config.encryption_key, &config.encryption_salt)
            .expect("build cipher");
        let store = Arc::new(Store::open(&config.database_path, cipher).expect("open store"));
        let graph = Arc::new(ScriptedGraph::default());
        let forward = Arc::new(ScriptedForward::default());
        let service = MailService::new(
            Arc::clone(&store),
            Arc::clone(&graph) as Arc<dyn GraphPort>,
            Arc::clone(&forward) as Arc<dyn ForwardPort>,
            config,
        );
        Self {
            service,
            store,
            graph,
            forward,
            db_path,
        }
    }

    fn add_account(&self, id: &str, email: &str) {
        self.store
            .create_account(&Account {
                id: id.to_string(),
                email: email.to_string(),
                user_id: format!("user-{id}"),
                tenant_id: "tenant-a".to_string(),
                client_id: "client-a".to_string(),
                authentication_flow: AuthenticationFlow::AuthorizationCode,
                status: AccountStatus::Active,
                scopes: vec!["Mail.Read".to_string()],
                created_at: Utc::now(),
                updated_at: None,
                last_authenticated_at: None,
            })
            .expect("create account");
    }

    fn add_token(&self, account_id: &str, expires_in_minutes: i64) {
        self.store
            .save_token(&Token {
                account_id: account_id.to_string(),
                access_token: format!("access-{account_id}"),
                refresh_token: Some(format!("refresh-{account_id}")),
                token_type: "Bearer".to_string(),
                expires_at: Utc::now() + Duration::minutes(expires_in_minutes),
                scopes: vec!["Mail.Read".to_string()],
                status: TokenStatus::Valid,
                created_at: Utc::now(),
                updated_at: None,
            })
            .expect("save token");
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.db_path);
    }
}

#[tokio::test]
async fn batch_query_skips_accounts_with_expired_tokens() {
    let fixture = Fixture::new(None);
    fixture.add_account("acc-valid", "valid@example.com");
    fixture.add_token("acc-valid", 60);
    fixture.add_account("acc-stale", "stale@example.com");
    fixture.add_token("acc-stale", -5);

    fixture
        .graph
        .queue_messages(Ok(messages_page(vec![message_json("msg-1", "Hello")])));

    let outcome = fixture
        .service
        .query(&MailQuery::default())
        .await
        .expect("batch query must not fail on a stale account");

    assert_eq!(outcome.accounts_queried, 2);
    assert_eq!(outcome.messages.len(), 1);
    assert_eq!(outcome.new_count, 1);
    assert_eq!(outcome.skipped_accounts, vec!["acc-stale"]);

    // History is written for the account that was actually queried.
    let history = fixture
        .service
        .query_history(QueryHistoryFilters::default())
        .expect("list history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].account_id, "acc-valid");
    assert_eq!(history[0].query_type, "manual");
    assert!(history[0].success);
    assert!(history[0].execution_time_ms.is_some());
}

#[tokio::test]
async fn explicit_query_with_stale_token_requires_reauthentication() {
    let fixture = Fixture::new(None);
    fixture.add_account("acc-stale", "stale@example.com");
    fixture.add_token("acc-stale", -5);

    let query = MailQuery {
        account_id: Some("acc-stale".to_string()),
        ..MailQuery::default()
    };
    let error = fixture
        .service
        .query(&query)
        .await
        .expect_err("explicit stale account must fail");
    assert!(matches!(error, MailError::NoValidToken { .. }));
}

#[tokio::test]
async fn repeated_queries_do_not_duplicate_messages() {
    let fixture = Fixture::new(None);
    fixture.add_account("acc-1", "owner@example.com");
    fixture.add_token("acc-1", 60);

    fixture
        .graph
        .queue_messages(Ok(messages_page(vec![message_json("msg-1", "Hello")])));
    fixture
        .graph
        .queue_messages(Ok(messages_page(vec![message_json("msg-1", "Hello")])));

    let first = fixture
        .service
        .query(&MailQuery::default())
        .await
        .expect("first query");
    assert_eq!(first.new_count, 1);

    let second = fixture
        .service
        .query(&MailQuery::default())
        .await
        .expect("second query");
    // The message comes back in results but is not re-inserted.
    assert_eq!(second.new_count, 0);
    assert_eq!(second.messages.len(), 1);

    assert_eq!(fixture.store.count_mails("acc-1").expect("count"), 1);
}

#[tokio::test]
async fn dedup_holds_across_manual_query_and_delta_sync() {
    let fixture = Fixture::new(None);
    fixture.add_account("acc-1", "owner@example.com");
    fixture.add_token("acc-1", 60);

    fixture
        .graph
        .queue_messages(Ok(messages_page(vec![message_json("msg-1", "Hello")])));
    fixture.graph.queue_delta(Ok(delta_page(
        vec![message_json("msg-1", "Hello"), message_json("msg-2", "New")],
        None,
        Some("token-one"),
    )));

    fixture
        .service
        .query(&MailQuery::default())
        .await
        .expect("manual query");
    let outcome = fixture
        .service
        .delta_sync(Some("acc-1"), "Inbox")
        .await
        .expect("delta sync");

    assert_eq!(outcome.new_messages, 1);
    assert_eq!(outcome.updated_messages, 1);
    assert_eq!(fixture.store.count_mails("acc-1").expect("count"), 2);
}

#[tokio::test]
async fn delta_sync_rotates_the_cursor_atomically() {
    let fixture = Fixture::new(None);
    fixture.add_account("acc-1", "owner@example.com");
    fixture.add_token("acc-1", 60);

    fixture.graph.queue_delta(Ok(delta_page(
        vec![message_json("msg-1", "First")],
        None,
        Some("token-one"),
    )));
    fixture.graph.queue_delta(Ok(delta_page(
        vec![message_json("msg-2", "Second")],
        None,
        Some("token-two"),
    )));

    fixture
        .service
        .delta_sync(Some("acc-1"), "Inbox")
        .await
        .expect("first delta sync");
    fixture
        .service
        .delta_sync(Some("acc-1"), "Inbox")
        .await
        .expect("second delta sync");

    // The second call resumed from the first call's token.
    let tokens_seen = fixture.graph.delta_tokens_seen.lock().expect("lock");
    assert_eq!(
        tokens_seen.as_slice(),
        [None, Some("token-one".to_string())]
    );
    drop(tokens_seen);

    let active = fixture
        .store
        .active_delta_link("acc-1", "Inbox")
        .expect("load active link")
        .expect("active link exists");
    assert_eq!(active.delta_token, "token-two");
    assert_eq!(
        fixture
            .store
            .count_delta_links("acc-1", "Inbox", true)
            .expect("count active"),
        1
    );
    assert_eq!(
        fixture
            .store
            .count_delta_links("acc-1", "Inbox", false)
            .expect("count all"),
        2
    );

    // Each delta call logged a history row.
    let history = fixture
        .service
        .query_history(QueryHistoryFilters {
            query_type: Some("delta".to_string()),
            ..QueryHistoryFilters::default()
        })
        .expect("list history");
    assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn delta_sync_follows_next_links_before_saving_the_cursor() {
    let fixture = Fixture::new(None);
    fixture.add_account("acc-1", "owner@example.com");
    fixture.add_token("acc-1", 60);

    fixture.graph.queue_delta(Ok(delta_page(
        vec![message_json("msg-1", "Page one")],
        Some("https://graph.microsoft.com/v1.0/next-page"),
        None,
    )));
    fixture.graph.queue_next_page(Ok(delta_page(
        vec![message_json("msg-2", "Page two")],
        None,
        Some("token-final"),
    )));

    let outcome = fixture
        .service
        .delta_sync(Some("acc-1"), "Inbox")
        .await
        .expect("paged delta sync");

    assert_eq!(outcome.new_messages, 2);
    let active = fixture
        .store
        .active_delta_link("acc-1", "Inbox")
        .expect("load link")
        .expect("link saved");
    assert_eq!(active.delta_token, "token-final");
}

#[tokio::test]
async fn removed_delta_entries_are_counted_but_not_collected() {
    let fixture = Fixture::new(None);
    fixture.add_account("acc-1", "owner@example.com");
    fixture.add_token("acc-1", 60);

    fixture.graph.queue_delta(Ok(delta_page(
        vec![
            message_json("msg-1", "Kept"),
            json!({ "id": "msg-gone", "@removed": { "reason": "deleted" } }),
        ],
        None,
        Some("token-one"),
    )));

    let outcome = fixture
        .service
        .delta_sync(Some("acc-1"), "Inbox")
        .await
        .expect("delta sync");

    assert_eq!(outcome.new_messages, 1);
    assert_eq!(outcome.deleted_messages, 1);
    assert_eq!(fixture.store.count_mails("acc-1").expect("count"), 1);
}

#[tokio::test]
async fn webhook_notification_with_wrong_client_state_triggers_nothing() {
    let fixture = Fixture::new(None);
    fixture.add_account("acc-1", "owner@example.com");
    fixture.add_token("acc-1", 60);

    let webhook = fixture
        .service
        .setup_webhook("acc-1", "https://callback.example.com/hook", None, None)
        .await
        .expect("setup webhook");

    let changes = [NotificationChange {
        change_type: Some("created".to_string()),
        resource: None,
    }];
    let error = fixture
        .service
        .handle_notification(&webhook.subscription_id, "forged-client-state", &changes)
        .await
        .expect_err("forged client_state must be rejected");
    assert!(matches!(
        error,
        MailError::InvalidWebhookNotification { .. }
    ));

    // Fail closed: no delta sync happened.
    assert_eq!(fixture.graph.delta_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn webhook_notification_with_matching_client_state_triggers_delta_sync() {
    let fixture = Fixture::new(None);
    fixture.add_account("acc-1", "owner@example.com");
    fixture.add_token("acc-1", 60);

    let webhook = fixture
        .service
        .setup_webhook("acc-1", "https://callback.example.com/hook", None, None)
        .await
        .expect("setup webhook");

    let stored = fixture
        .store
        .get_webhook(&webhook.subscription_id)
        .expect("get webhook")
        .expect("webhook stored");

    fixture.graph.queue_delta(Ok(delta_page(
        vec![message_json("msg-1", "Pushed")],
        None,
        Some("token-one"),
    )));

    let changes = [NotificationChange {
        change_type: Some("created".to_string()),
        resource: Some(stored.resource.clone()),
    }];
    let outcome = fixture
        .service
        .handle_notification(&webhook.subscription_id, &stored.client_state, &changes)
        .await
        .expect("valid notification triggers sync");

    assert_eq!(outcome.new_messages, 1);
    assert_eq!(fixture.graph.delta_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_subscription_notification_is_rejected() {
    let fixture = Fixture::new(None);

    let error = fixture
        .service
        .handle_notification("sub-unknown", "any-state", &[])
        .await
        .expect_err("unknown subscription must be rejected");
    assert!(matches!(error, MailError::SubscriptionNotFound { .. }));
}

#[tokio::test]
async fn forwarding_failure_keeps_message_and_is_retried_later() {
    let fixture = Fixture::new(Some("https://downstream.example.com/mail".to_string()));
    fixture.add_account("acc-1", "owner@example.com");
    fixture.add_token("acc-1", 60);

    fixture
        .graph
        .queue_messages(Ok(messages_page(vec![message_json("msg-1", "Invoice")])));
    fixture.forward.queue(Err(ForwardError::Status {
        status: 503,
        body: "unavailable".to_string(),
    }));

    let outcome = fixture
        .service
        .query(&MailQuery::default())
        .await
        .expect("query succeeds despite forwarding failure");
    assert_eq!(outcome.new_count, 1);
    // Mail storage is independent of forwarding.
    assert_eq!(fixture.store.count_mails("acc-1").expect("count"), 1);

    let failed = fixture
        .store
        .retryable_api_calls(3)
        .expect("retryable calls");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].response_status, Some(503));
    assert!(!failed[0].success);

    // The retry sweep re-dispatches and records the success.
    fixture.forward.queue(Ok(ForwardResponse {
        status: 200,
        body: "ok".to_string(),
    }));
    let sweep = fixture
        .service
        .retry_failed_calls()
        .await
        .expect("retry sweep");
    assert_eq!(sweep.retried, 1);
    assert_eq!(sweep.failed, 0);

    let call = fixture
        .store
        .get_api_call(failed[0].id)
        .expect("get call")
        .expect("call exists");
    assert!(call.success);
    assert_eq!(call.retry_count, 1);
    assert_eq!(fixture.forward.call_count(), 2);
}

#[tokio::test]
async fn exhausted_forward_calls_are_skipped_not_deleted() {
    let fixture = Fixture::new(Some("https://downstream.example.com/mail".to_string()));
    fixture.add_account("acc-1", "owner@example.com");
    fixture.add_token("acc-1", 60);

    fixture
        .graph
        .queue_messages(Ok(messages_page(vec![message_json("msg-1", "Invoice")])));
    // Initial dispatch plus three retries all fail.
    for _ in 0..4 {
        fixture.forward.queue(Err(ForwardError::Status {
            status: 500,
            body: "boom".to_string(),
        }));
    }

    fixture
        .service
        .query(&MailQuery::default())
        .await
        .expect("query");
    for _ in 0..3 {
        fixture
            .service
            .retry_failed_calls()
            .await
            .expect("retry sweep");
    }

    let sweep = fixture
        .service
        .retry_failed_calls()
        .await
        .expect("final sweep");
    assert_eq!(sweep.retried, 0);
    assert_eq!(sweep.failed, 0);
    assert_eq!(sweep.exhausted, 1);
    // Four dispatch attempts total; the exhausted row is never retried again.
    assert_eq!(fixture.forward.call_count(), 4);
}

#[tokio::test]
async fn no_forwarding_happens_without_a_configured_endpoint() {
    let fixture = Fixture::new(None);
    fixture.add_account("acc-1", "owner@example.com");
    fixture.add_token("acc-1", 60);

    fixture
        .graph
        .queue_messages(Ok(messages_page(vec![message_json("msg-1", "Hello")])));

    fixture
        .service
        .query(&MailQuery::default())
        .await
        .expect("query");
    assert_eq!(fixture.forward.call_count(), 0);
}

#[tokio::test]
async fn send_requires_a_fresh_token_and_tolerates_missing_message_id() {
    let fixture = Fixture::new(None);
    fixture.add_account("acc-1", "owner@example.com");

    let request = SendRequest {
        account_id: "acc-1".to_string(),
        to_recipients: vec!["to@example.com".to_string()],
        cc_recipients: vec![],
        bcc_recipients: vec![],
        subject: "Status".to_string(),
        body: "<p>Done</p>".to_string(),
        body_type: "html".to_string(),
        importance: MailImportance::Normal,
    };

    let error = fixture
        .service
        .send(&request)
        .await
        .expect_err("send without token must fail");
    assert!(matches!(error, MailError::NoValidToken { .. }));

    fixture.add_token("acc-1", 60);
    let outcome = fixture.service.send(&request).await.expect("send");
    assert!(outcome.message_id.is_none());
    assert_eq!(fixture.graph.send_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn webhook_renewal_sweep_extends_expiring_subscriptions() {
    let fixture = Fixture::new(None);
    fixture.add_account("acc-1", "owner@example.com");
    fixture.add_token("acc-1", 60);

    let webhook = fixture
        .service
        .setup_webhook("acc-1", "https://callback.example.com/hook", None, None)
        .await
        .expect("setup webhook");

    // Pull the stored expiry into the renewal window.
    fixture
        .store
        .update_webhook_expiry(&webhook.subscription_id, Utc::now() + Duration::minutes(10))
        .expect("shrink expiry");

    let sweep = fixture
        .service
        .renew_expiring_webhooks(1800)
        .await
        .expect("renewal sweep");
    assert_eq!(sweep.renewed, 1);
    assert_eq!(sweep.failed, 0);
    assert_eq!(fixture.graph.renew_calls.load(Ordering::SeqCst), 1);

    let renewed = fixture
        .store
        .get_webhook(&webhook.subscription_id)
        .expect("get webhook")
        .expect("webhook exists");
    assert!(renewed.expires_at > Utc::now() + Duration::hours(24));
}

#[tokio::test]
async fn deleted_webhook_is_deactivated_but_retained() {
    let fixture = Fixture::new(None);
    fixture.add_account("acc-1", "owner@example.com");
    fixture.add_token("acc-1", 60);

    let webhook = fixture
        .service
        .setup_webhook("acc-1", "https://callback.example.com/hook", None, None)
        .await
        .expect("setup webhook");

    fixture
        .service
        .delete_webhook(&webhook.subscription_id)
        .await
        .expect("delete webhook");
    assert_eq!(fixture.graph.delete_calls.load(Ordering::SeqCst), 1);

    let stored = fixture
        .store
        .get_webhook(&webhook.subscription_id)
        .expect("get webhook")
        .expect("row retained for auditing");
    assert!(!stored.is_active);

    // A deactivated subscription no longer accepts notifications.
    let error = fixture
        .service
        .handle_notification(&webhook.subscription_id, &stored.client_state, &[])
        .await
        .expect_err("deactivated subscription rejects notifications");
    assert!(matches!(error, MailError::SubscriptionNotFound { .. }));
}
