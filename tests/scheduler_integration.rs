use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use mailgate::auth::AuthService;
use mailgate::config::{Config, SchedulerConfig};
use mailgate::crypto::TokenCipher;
use mailgate::db::models::{
    Account, AccountStatus, AuthCodeAccount, AuthenticationFlow, Token, TokenStatus,
};
use mailgate::db::Store;
use mailgate::forward::{ForwardPort, ForwardResponse};
use mailgate::graph::{
    GraphDeltaPage, GraphError, GraphMessagesPage, GraphPort, GraphSubscription, SendMailPayload,
    SubscriptionRequest,
};
use mailgate::oauth::{
    AuthorizationRequest, DeviceAuthorization, DevicePoll, OAuthError, OAuthPort, TokenGrant,
};
use mailgate::scheduler::Scheduler;
use mailgate::sync::MailService;

fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("mailgate-sched-it-{}.db", Uuid::new_v4()))
}

fn test_config(db_path: &Path) -> Config {
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
        forward_url: None,
        forward_timeout: StdDuration::from_secs(30),
        max_forward_retries: 3,
        scheduler: SchedulerConfig {
            token_refresh_interval: StdDuration::from_millis(50),
            webhook_renewal_interval: StdDuration::from_millis(50),
            forward_retry_interval: StdDuration::from_millis(50),
            cleanup_interval: StdDuration::from_millis(50),
            ..SchedulerConfig::default()
        },
    }
}

/// OAuth port that always refreshes successfully.
struct AlwaysRefreshOAuth;

#[async_trait]
impl OAuthPort for AlwaysRefreshOAuth {
    fn build_authorization_url(
        &self,
        _account: &Account,
        _auth: &AuthCodeAccount,
    ) -> Result<AuthorizationRequest, OAuthError> {
        Ok(AuthorizationRequest {
            url: "https://login.microsoftonline.com/authorize".to_string(),
            state: "state".to_string(),
            code_verifier: "verifier".to_string(),
        })
    }

    async fn exchange_code(
        &self,
        _account: &Account,
        _auth: &AuthCodeAccount,
        _code: &str,
        _code_verifier: &str,
    ) -> Result<TokenGrant, OAuthError> {
        Err(OAuthError::Transport("not scripted".to_string()))
    }

    async fn begin_device_flow(
        &self,
        _account: &Account,
    ) -> Result<DeviceAuthorization, OAuthError> {
        Err(OAuthError::Transport("not scripted".to_string()))
    }

    async fn poll_device_code(
        &self,
        _account: &Account,
        _device_code: &str,
    ) -> Result<DevicePoll, OAuthError> {
        Ok(DevicePoll::Pending)
    }

    async fn refresh(
        &self,
        _account: &Account,
        _client_secret: Option<&str>,
        _refresh_token: &str,
        _scopes: &[String],
    ) -> Result<TokenGrant, OAuthError> {
        Ok(serde_json::from_value(json!({
            "access_token": "swept-access",
            "refresh_token": "swept-refresh",
            "token_type": "Bearer",
            "expires_in": 3600,
        }))
        .expect("build grant"))
    }

    async fn revoke(&self, _access_token: &str) -> Result<bool, OAuthError> {
        Ok(true)
    }
}

/// Graph port with nothing to report; sweeps see empty upstream state.
struct QuietGraph;

#[async_trait]
impl GraphPort for QuietGraph {
    async fn get_messages(
        &self,
        _access_token: &str,
        _user_id: &str,
        _folder: &str,
        _filter: Option<&str>,
        _search: Option<&str>,
        _top: Option<u32>,
    ) -> Result<GraphMessagesPage, GraphError> {
        Ok(serde_json::from_value(json!({ "value": [] })).expect("empty page"))
    }

    async fn get_delta_messages(
        &self,
        _access_token: &str,
        _user_id: &str,
        _folder: &str,
        _delta_token: Option<&str>,
    ) -> Result<GraphDeltaPage, GraphError> {
        Ok(serde_json::from_value(json!({ "value": [] })).expect("empty page"))
    }

    async fn get_delta_page(
        &self,
        _access_token: &str,
        _next_link: &str,
    ) -> Result<GraphDeltaPage, GraphError> {
        Ok(serde_json::from_value(json!({ "value": [] })).expect("empty page"))
    }

    async fn send_message(
        &self,
        _access_token: &str,
        _user_id: &str,
        _payload: &SendMailPayload,
    ) -> Result<Option<String>, GraphError> {
        Ok(None)
    }

    async fn create_subscription(
        &self,
        _access_token: &str,
        request: &SubscriptionRequest,
    ) -> Result<GraphSubscription, GraphError> {
        Ok(GraphSubscription {
            id: "sub-1".to_string(),
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
        Ok(())
    }
}

struct QuietForward;

#[async_trait]
impl ForwardPort for QuietForward {
    async fn send_mail_data(
        &self,
        _endpoint: &str,
        _payload: &serde_json::Value,
    ) -> Result<ForwardResponse, mailgate::forward::ForwardError> {
        Ok(ForwardResponse {
            status: 200,
            body: "ok".to_string(),
        })
    }
}

struct Fixture {
    scheduler: Scheduler,
    store: Arc<Store>,
    db_path: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let db_path = temp_db_path();
        let config = test_config(&db_path);
        let cipher = TokenCipher::new(&config.encryption_key, &config.encryption_salt)
            .expect("build cipher");
        let store = Arc::new(Store::open(&config.database_path, cipher).expect("open store"));

        let auth = Arc::new(AuthService::new(
            Arc::clone(&store),
            Arc::new(AlwaysRefreshOAuth),
            config.clone(),
        ));
        let mail = Arc::new(MailService::new(
            Arc::clone(&store),
            Arc::new(QuietGraph),
            Arc::new(QuietForward),
            config.clone(),
        ));
        let scheduler = Scheduler::new(auth, mail, config.scheduler.clone());

        Self {
            scheduler,
            store,
            db_path,
        }
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.db_path);
    }
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let fixture = Fixture::new();

    assert!(!fixture.scheduler.is_running());
    assert!(fixture.scheduler.start());
    assert!(fixture.scheduler.is_running());
    // Second start is a warned no-op.
    assert!(!fixture.scheduler.start());

    fixture.scheduler.stop().await;
    assert!(!fixture.scheduler.is_running());
    // Stopping again is a no-op too.
    fixture.scheduler.stop().await;

    // The scheduler can be started again after a full stop.
    assert!(fixture.scheduler.start());
    fixture.scheduler.stop().await;
}

#[tokio::test]
async fn token_refresh_sweep_refreshes_expiring_tokens() {
    let fixture = Fixture::new();

    fixture
        .store
        .create_account(&Account {
            id: "acc-1".to_string(),
            email: "owner@example.com".to_string(),
            user_id: "user-1".to_string(),
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
    fixture
        .store
        .insert_auth_code_account(&AuthCodeAccount {
            account_id: "acc-1".to_string(),
            client_secret: "secret-a".to_string(),
            redirect_uri: "http://localhost:8000/auth/callback".to_string(),
            authority: "https://login.microsoftonline.com/tenant-a".to_string(),
            created_at: Utc::now(),
        })
        .expect("create flow data");
    fixture
        .store
        .save_token(&Token {
            account_id: "acc-1".to_string(),
            access_token: "expiring-access".to_string(),
            refresh_token: Some("expiring-refresh".to_string()),
            token_type: "Bearer".to_string(),
            expires_at: Utc::now() + Duration::minutes(2),
            scopes: vec!["Mail.Read".to_string()],
            status: TokenStatus::Valid,
            created_at: Utc::now(),
            updated_at: None,
        })
        .expect("seed expiring token");

    fixture.scheduler.start();
    tokio::time::sleep(StdDuration::from_millis(300)).await;
    fixture.scheduler.stop().await;

    let token = fixture
        .store
        .get_token("acc-1")
        .expect("get token")
        .expect("token exists");
    assert_eq!(token.access_token, "swept-access");
    assert_eq!(token.status, TokenStatus::Valid);

    let status = fixture.scheduler.status();
    assert_eq!(status.len(), 4);
    for snapshot in &status {
        assert!(snapshot.runs > 0, "task {} never ran", snapshot.name);
        assert_eq!(snapshot.failures, 0, "task {} failed", snapshot.name);
    }
}

#[tokio::test]
async fn stopped_scheduler_performs_no_further_writes() {
    let fixture = Fixture::new();

    fixture.scheduler.start();
    tokio::time::sleep(StdDuration::from_millis(150)).await;
    fixture.scheduler.stop().await;

    let runs_at_stop: u64 = fixture
        .scheduler
        .status()
        .iter()
        .map(|snapshot| snapshot.runs)
        .sum();

    tokio::time::sleep(StdDuration::from_millis(200)).await;
    let runs_after_wait: u64 = fixture
        .scheduler
        .status()
        .iter()
        .map(|snapshot| snapshot.runs)
        .sum();

    assert_eq!(runs_at_stop, runs_after_wait);
}
