use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FlowArg {
    AuthorizationCode,
    DeviceCode,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Active,
    Inactive,
    Suspended,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ImportanceArg {
    Low,
    Normal,
    High,
}

#[derive(Debug, Parser)]
#[command(name = "mailgate", version, about = "Multi-tenant Microsoft Graph mail collection gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage registered accounts
    Accounts {
        #[command(subcommand)]
        command: AccountCommands,
    },
    /// Drive account authentication flows
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },
    /// Query, sync, and send mail
    Mail {
        #[command(subcommand)]
        command: MailCommands,
    },
    /// Manage webhook subscriptions
    Webhook {
        #[command(subcommand)]
        command: WebhookCommands,
    },
    /// Show mail query history
    History(HistoryArgs),
    /// Run the gateway with background sweeps until interrupted
    Run,
}

#[derive(Debug, Subcommand)]
enum AccountCommands {
    /// Register a new account
    Register {
        email: String,
        user_id: String,
        #[arg(long, value_enum, default_value = "authorization-code")]
        flow: FlowArg,
        /// Requested scopes (space-separated); configured defaults when omitted
        #[arg(long)]
        scopes: Option<String>,
    },
    /// List accounts with token status
    List,
    /// Show one account by ID
    Show { account_id: String },
    /// Delete an account and everything it owns
    Remove { account_id: String },
    /// Update account status
    SetStatus {
        account_id: String,
        #[arg(value_enum)]
        status: StatusArg,
    },
}

#[derive(Debug, Subcommand)]
enum AuthCommands {
    /// Start authentication (authorization URL or device code)
    Begin { account_id: String },
    /// Complete the authorization-code flow with the callback values
    Complete {
        account_id: String,
        #[arg(long)]
        code: String,
        #[arg(long)]
        state: String,
    },
    /// Poll the device-code flow once
    Poll { account_id: String },
    /// Refresh the access token
    Refresh { account_id: String },
    /// Revoke tokens and log the account out
    Revoke { account_id: String },
    /// Show authentication audit logs
    Logs {
        #[arg(long)]
        account: Option<String>,
        #[arg(long)]
        failures_only: bool,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[derive(Debug, Subcommand)]
enum MailCommands {
    /// Query mail from the provider (all accounts unless --account)
    Query(QueryArgs),
    /// Incremental delta sync (all accounts unless --account)
    DeltaSync {
        #[arg(long)]
        account: Option<String>,
        #[arg(long, default_value = "Inbox")]
        folder: String,
    },
    /// Send a message
    Send(SendArgs),
    /// List collected messages for an account
    List {
        account_id: String,
        #[arg(long, default_value_t = 25)]
        limit: usize,
    },
}

#[derive(Debug, Args)]
struct QueryArgs {
    #[arg(long)]
    account: Option<String>,
    #[arg(long, default_value = "Inbox")]
    folder: String,
    /// Only messages received on/after this date (YYYY-MM-DD)
    #[arg(long)]
    since: Option<String>,
    /// Only messages received before this date (YYYY-MM-DD)
    #[arg(long)]
    until: Option<String>,
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    unread_only: bool,
    #[arg(long, value_enum)]
    importance: Option<ImportanceArg>,
    /// Free-text search
    #[arg(long)]
    search: Option<String>,
    #[arg(long, default_value_t = 50)]
    top: u32,
}

#[derive(Debug, Args)]
struct SendArgs {
    account_id: String,
    #[arg(long, required = true)]
    to: Vec<String>,
    #[arg(long)]
    cc: Vec<String>,
    #[arg(long)]
    bcc: Vec<String>,
    #[arg(long)]
    subject: String,
    #[arg(long)]
    body: String,
    #[arg(long, default_value = "html")]
    body_type: String,
    #[arg(long, value_enum, default_value = "normal")]
    importance: ImportanceArg,
}

#[derive(Debug, Subcommand)]
enum WebhookCommands {
    /// Create a subscription for an account
    Setup {
        account_id: String,
        #[arg(long)]
        notification_url: String,
        #[arg(long)]
        resource: Option<String>,
    },
    /// Renew a subscription
    Renew { subscription_id: String },
    /// Delete a subscription (deactivates the local mirror)
    Delete { subscription_id: String },
    /// List active subscriptions for an account
    List { account_id: String },
}

#[derive(Debug, Args)]
struct HistoryArgs {
    #[arg(long)]
    account: Option<String>,
    /// Filter by query type (manual, delta)
    #[arg(long)]
    query_type: Option<String>,
    #[arg(long, default_value_t = 50)]
    limit: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use std::sync::Arc;

    use anyhow::{Context, Result};
    use chrono::{DateTime, NaiveDate, Utc};

    use mailgate::auth::AuthService;
    use mailgate::config::Config;
    use mailgate::crypto::TokenCipher;
    use mailgate::db::models::{AccountStatus, AuthenticationFlow, MailImportance};
    use mailgate::db::{AuthLogFilters, QueryHistoryFilters, Store};
    use mailgate::forward::HttpForwardClient;
    use mailgate::graph::MicrosoftGraphClient;
    use mailgate::oauth::MicrosoftOAuthClient;
    use mailgate::scheduler::Scheduler;
    use mailgate::sync::{MailQuery, MailService, SendRequest};

    use super::{
        AccountCommands, AuthCommands, Cli, Commands, FlowArg, HistoryArgs, ImportanceArg,
        MailCommands, QueryArgs, SendArgs, StatusArg, WebhookCommands,
    };

    struct Services {
        store: Arc<Store>,
        auth: Arc<AuthService>,
        mail: Arc<MailService>,
        config: Config,
    }

    fn build_services() -> Result<Services> {
        let config = Config::from_env().context("load mailgate configuration")?;
        let cipher = TokenCipher::new(&config.encryption_key, &config.encryption_salt)
            .context("initialize token cipher")?;
        let store = Arc::new(
            Store::open(&config.database_path, cipher).with_context(|| {
                format!("open mailgate database at {}", config.database_path.display())
            })?,
        );

        let oauth =
            Arc::new(MicrosoftOAuthClient::new(&config).context("build OAuth client")?);
        let graph =
            Arc::new(MicrosoftGraphClient::new(&config).context("build Graph client")?);
        let forward = Arc::new(
            HttpForwardClient::new(config.forward_timeout).context("build forwarding client")?,
        );

        let auth = Arc::new(AuthService::new(
            Arc::clone(&store),
            oauth,
            config.clone(),
        ));
        let mail = Arc::new(MailService::new(
            Arc::clone(&store),
            graph,
            forward,
            config.clone(),
        ));

        Ok(Services {
            store,
            auth,
            mail,
            config,
        })
    }

    pub async fn dispatch(cli: Cli) -> Result<()> {
        match cli.command {
            Commands::Accounts { command } => handle_accounts(command, cli.json).await,
            Commands::Auth { command } => handle_auth(command, cli.json).await,
            Commands::Mail { command } => handle_mail(command, cli.json).await,
            Commands::Webhook { command } => handle_webhook(command, cli.json).await,
            Commands::History(args) => handle_history(args, cli.json).await,
            Commands::Run => handle_run().await,
        }
    }

    async fn handle_accounts(command: AccountCommands, json: bool) -> Result<()> {
        let services = build_services()?;

        match command {
            AccountCommands::Register {
                email,
                user_id,
                flow,
                scopes,
            } => {
                let scopes = scopes
                    .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default();
                let account_id = services
                    .auth
                    .register(&email, &user_id, map_flow(flow), scopes)
                    .await?;
                if json {
                    println!("{}", serde_json::json!({ "account_id": account_id }));
                } else {
                    println!("Registered account: {account_id}");
                }
            }
            AccountCommands::List => {
                let accounts = services.auth.list_accounts()?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&accounts)?);
                } else if accounts.is_empty() {
                    println!("No accounts registered.");
                } else {
                    for info in accounts {
                        println!(
                            "{}  {}  {}  token={}",
                            info.account.id,
                            info.account.email,
                            info.account.authentication_flow,
                            info.token_status
                        );
                    }
                }
            }
            AccountCommands::Show { account_id } => {
                let info = services.auth.account_info(&account_id)?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&info)?);
                } else {
                    println!("Account: {}", info.account.id);
                    println!("Email: {}", info.account.email);
                    println!("Flow: {}", info.account.authentication_flow);
                    println!("Status: {}", info.account.status);
                    println!("Token: {}", info.token_status);
                    if let Some(expires_in) = info.token_expires_in {
                        println!("Token expires in: {expires_in}s");
                    }
                }
            }
            AccountCommands::Remove { account_id } => {
                if services.auth.delete_account(&account_id)? {
                    println!("Removed account: {account_id}");
                } else {
                    println!("No account found: {account_id}");
                }
            }
            AccountCommands::SetStatus { account_id, status } => {
                services.auth.update_status(&account_id, map_status(status))?;
                println!("Updated account status: {account_id}");
            }
        }
        Ok(())
    }

    async fn handle_auth(command: AuthCommands, json: bool) -> Result<()> {
        let services = build_services()?;

        match command {
            AuthCommands::Begin { account_id } => {
                let begin = services.auth.begin_authentication(&account_id).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&begin)?);
                } else {
                    match begin {
                        mailgate::auth::BeginAuth::Redirect {
                            authorization_url,
                            state,
                        } => {
                            println!("Visit the authorization URL to continue:");
                            println!("{authorization_url}");
                            println!("State: {state}");
                        }
                        mailgate::auth::BeginAuth::DeviceCode {
                            user_code,
                            verification_uri,
                            expires_in,
                            interval,
                        } => {
                            println!("Visit {verification_uri} and enter code: {user_code}");
                            println!("Code expires in {expires_in}s; poll every {interval}s.");
                        }
                    }
                }
            }
            AuthCommands::Complete {
                account_id,
                code,
                state,
            } => {
                services
                    .auth
                    .complete_authorization_code(&account_id, &code, &state)
                    .await?;
                println!("Authentication completed for account: {account_id}");
            }
            AuthCommands::Poll { account_id } => {
                let outcome = services.auth.poll_device_code(&account_id).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                } else {
                    match outcome {
                        mailgate::auth::DevicePollOutcome::Pending => {
                            println!("Authorization pending; try again shortly.");
                        }
                        mailgate::auth::DevicePollOutcome::SlowDown => {
                            println!("Authorization pending; slow down polling.");
                        }
                        mailgate::auth::DevicePollOutcome::Authorized => {
                            println!("Authentication completed for account: {account_id}");
                        }
                    }
                }
            }
            AuthCommands::Refresh { account_id } => {
                services.auth.refresh_token(&account_id).await?;
                println!("Token refreshed for account: {account_id}");
            }
            AuthCommands::Revoke { account_id } => {
                services.auth.revoke(&account_id).await?;
                println!("Token revoked for account: {account_id}");
            }
            AuthCommands::Logs {
                account,
                failures_only,
                limit,
            } => {
                let logs = services.auth.auth_logs(AuthLogFilters {
                    account_id: account,
                    success: if failures_only { Some(false) } else { None },
                    limit,
                })?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&logs)?);
                } else if logs.is_empty() {
                    println!("No authentication logs.");
                } else {
                    for log in logs {
                        println!(
                            "{}  {}  {}  success={}{}",
                            log.logged_at.format("%Y-%m-%d %H:%M:%S"),
                            log.account_id,
                            log.event_kind,
                            log.success,
                            log.error_code
                                .map(|code| format!("  error={code}"))
                                .unwrap_or_default()
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_mail(command: MailCommands, json: bool) -> Result<()> {
        let services = build_services()?;

        match command {
            MailCommands::Query(args) => {
                let query = MailQuery {
                    account_id: args.account,
                    folder: args.folder,
                    date_from: parse_date_arg("since", args.since)?,
                    date_to: parse_date_arg("until", args.until)?,
                    sender_email: args.from,
                    is_read: if args.unread_only { Some(false) } else { None },
                    importance: args.importance.map(map_importance),
                    search: args.search,
                    top: Some(args.top),
                };
                let outcome = services.mail.query(&query).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                } else {
                    println!(
                        "Queried {} account(s): {} found, {} new, {} skipped",
                        outcome.accounts_queried,
                        outcome.total_found,
                        outcome.new_count,
                        outcome.skipped_accounts.len()
                    );
                    for message in outcome.messages.iter().take(25) {
                        println!(
                            "{}  {}  {}",
                            message.received_at.format("%Y-%m-%d %H:%M"),
                            message.sender_email,
                            message.subject
                        );
                    }
                }
            }
            MailCommands::DeltaSync { account, folder } => {
                let outcome = services.mail.delta_sync(account.as_deref(), &folder).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                } else {
                    println!(
                        "Delta sync: {} account(s), new={} updated={} deleted={} skipped={}",
                        outcome.accounts_synced,
                        outcome.new_messages,
                        outcome.updated_messages,
                        outcome.deleted_messages,
                        outcome.skipped_accounts.len()
                    );
                }
            }
            MailCommands::Send(args) => {
                let outcome = services
                    .mail
                    .send(&SendRequest {
                        account_id: args.account_id,
                        to_recipients: args.to,
                        cc_recipients: args.cc,
                        bcc_recipients: args.bcc,
                        subject: args.subject,
                        body: args.body,
                        body_type: args.body_type,
                        importance: map_importance(args.importance),
                    })
                    .await?;
                match outcome.message_id {
                    Some(message_id) => println!("Mail sent: {message_id}"),
                    None => println!("Mail sent."),
                }
            }
            MailCommands::List { account_id, limit } => {
                let messages = services.store.list_mails(&account_id, limit)?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&messages)?);
                } else if messages.is_empty() {
                    println!("No messages collected for {account_id}.");
                } else {
                    for message in messages {
                        println!(
                            "{}  {}  {}",
                            message.received_at.format("%Y-%m-%d %H:%M"),
                            message.sender_email,
                            message.subject
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_webhook(command: WebhookCommands, json: bool) -> Result<()> {
        let services = build_services()?;

        match command {
            WebhookCommands::Setup {
                account_id,
                notification_url,
                resource,
            } => {
                let outcome = services
                    .mail
                    .setup_webhook(&account_id, &notification_url, resource.as_deref(), None)
                    .await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                } else {
                    println!(
                        "Webhook created: {} (expires {})",
                        outcome.subscription_id,
                        outcome.expires_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
            WebhookCommands::Renew { subscription_id } => {
                let outcome = services.mail.renew_webhook(&subscription_id).await?;
                println!(
                    "Webhook renewed: {} (expires {})",
                    outcome.subscription_id,
                    outcome.expires_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            WebhookCommands::Delete { subscription_id } => {
                services.mail.delete_webhook(&subscription_id).await?;
                println!("Webhook deactivated: {subscription_id}");
            }
            WebhookCommands::List { account_id } => {
                let subscriptions = services.mail.list_webhooks(&account_id)?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&subscriptions)?);
                } else if subscriptions.is_empty() {
                    println!("No active webhooks for {account_id}.");
                } else {
                    for subscription in subscriptions {
                        println!(
                            "{}  {}  expires {}",
                            subscription.subscription_id,
                            subscription.resource,
                            subscription.expires_at.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_history(args: HistoryArgs, json: bool) -> Result<()> {
        let services = build_services()?;

        let history = services.mail.query_history(QueryHistoryFilters {
            account_id: args.account,
            query_type: args.query_type,
            limit: args.limit,
        })?;

        if json {
            println!("{}", serde_json::to_string_pretty(&history)?);
        } else if history.is_empty() {
            println!("No query history.");
        } else {
            for entry in history {
                println!(
                    "{}  {}  {}  found={} new={} success={}",
                    entry.queried_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.account_id,
                    entry.query_type,
                    entry.messages_found,
                    entry.new_messages,
                    entry.success
                );
            }
        }
        Ok(())
    }

    async fn handle_run() -> Result<()> {
        let services = build_services()?;
        let scheduler = Scheduler::new(
            Arc::clone(&services.auth),
            Arc::clone(&services.mail),
            services.config.scheduler.clone(),
        );

        scheduler.start();
        println!("mailgate running; press ctrl-c to stop");

        tokio::signal::ctrl_c()
            .await
            .context("wait for shutdown signal")?;

        println!("stopping background tasks…");
        scheduler.stop().await;

        for snapshot in scheduler.status() {
            println!(
                "{}: runs={} failures={}",
                snapshot.name, snapshot.runs, snapshot.failures
            );
        }
        Ok(())
    }

    fn map_flow(flow: FlowArg) -> AuthenticationFlow {
        match flow {
            FlowArg::AuthorizationCode => AuthenticationFlow::AuthorizationCode,
            FlowArg::DeviceCode => AuthenticationFlow::DeviceCode,
        }
    }

    fn map_status(status: StatusArg) -> AccountStatus {
        match status {
            StatusArg::Active => AccountStatus::Active,
            StatusArg::Inactive => AccountStatus::Inactive,
            StatusArg::Suspended => AccountStatus::Suspended,
        }
    }

    fn map_importance(importance: ImportanceArg) -> MailImportance {
        match importance {
            ImportanceArg::Low => MailImportance::Low,
            ImportanceArg::Normal => MailImportance::Normal,
            ImportanceArg::High => MailImportance::High,
        }
    }

    fn parse_date_arg(label: &str, raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
        raw.map(|value| {
            NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
                .map(|date| date.and_time(chrono::NaiveTime::MIN).and_utc())
                .with_context(|| format!("invalid --{label} date '{value}', expected YYYY-MM-DD"))
        })
        .transpose()
    }
}
