use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::auth::AuthService;
use crate::config::SchedulerConfig;
use crate::sync::MailService;

pub const TASK_TOKEN_REFRESH: &str = "token_refresh";
pub const TASK_WEBHOOK_RENEWAL: &str = "webhook_renewal";
pub const TASK_FORWARD_RETRY: &str = "forward_retry";
pub const TASK_CLEANUP: &str = "cleanup";

/// Read-only view of one periodic task's counters.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub name: &'static str,
    pub runs: u64,
    pub failures: u64,
    pub last_error: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Clone)]
struct TaskState {
    runs: u64,
    failures: u64,
    last_error: Option<String>,
    last_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct StatusBoard {
    tasks: Mutex<BTreeMap<&'static str, TaskState>>,
}

impl StatusBoard {
    fn record(&self, name: &'static str, outcome: Result<String, String>) {
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let state = tasks.entry(name).or_default();
        state.runs += 1;
        state.last_run_at = Some(Utc::now());
        match outcome {
            Ok(summary) => {
                state.last_error = None;
                info!(task = name, %summary, "scheduler sweep completed");
            }
            Err(error) => {
                state.failures += 1;
                state.last_error = Some(error.clone());
                warn!(task = name, %error, "scheduler sweep failed");
            }
        }
    }

    fn snapshot(&self) -> Vec<TaskSnapshot> {
        let tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks
            .iter()
            .map(|(name, state)| TaskSnapshot {
                name,
                runs: state.runs,
                failures: state.failures,
                last_error: state.last_error.clone(),
                last_run_at: state.last_run_at,
            })
            .collect()
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// Supervisor for the four periodic sweeps: token refresh, webhook
/// renewal, forward retry, and cleanup. Each sweep runs on its own task
/// with its own cadence; a failing iteration is recorded and the loop
/// continues. Start and stop are idempotent, and stop waits for every
/// loop to finish before returning.
pub struct Scheduler {
    auth: Arc<AuthService>,
    mail: Arc<MailService>,
    config: SchedulerConfig,
    board: Arc<StatusBoard>,
    running: Mutex<Option<Running>>,
}

impl Scheduler {
    pub fn new(auth: Arc<AuthService>, mail: Arc<MailService>, config: SchedulerConfig) -> Self {
        Self {
            auth,
            mail,
            config,
            board: Arc::new(StatusBoard::default()),
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    /// Spawn the sweep loops. Calling start on a running scheduler warns
    /// and changes nothing.
    pub fn start(&self) -> bool {
        let mut running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if running.is_some() {
            warn!("scheduler already running");
            return false;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(4);

        {
            let auth = Arc::clone(&self.auth);
            let lookahead = self.config.token_refresh_lookahead_secs;
            handles.push(spawn_sweep(
                TASK_TOKEN_REFRESH,
                self.config.token_refresh_interval,
                shutdown_rx.clone(),
                Arc::clone(&self.board),
                move || {
                    let auth = Arc::clone(&auth);
                    async move {
                        auth.refresh_expiring(lookahead)
                            .await
                            .map(|sweep| {
                                format!("refreshed={} failed={}", sweep.refreshed, sweep.failed)
                            })
                            .map_err(|error| error.to_string())
                    }
                },
            ));
        }

        {
            let mail = Arc::clone(&self.mail);
            let lookahead = self.config.webhook_renewal_lookahead_secs;
            handles.push(spawn_sweep(
                TASK_WEBHOOK_RENEWAL,
                self.config.webhook_renewal_interval,
                shutdown_rx.clone(),
                Arc::clone(&self.board),
                move || {
                    let mail = Arc::clone(&mail);
                    async move {
                        mail.renew_expiring_webhooks(lookahead)
                            .await
                            .map(|sweep| {
                                format!("renewed={} failed={}", sweep.renewed, sweep.failed)
                            })
                            .map_err(|error| error.to_string())
                    }
                },
            ));
        }

        {
            let mail = Arc::clone(&self.mail);
            handles.push(spawn_sweep(
                TASK_FORWARD_RETRY,
                self.config.forward_retry_interval,
                shutdown_rx.clone(),
                Arc::clone(&self.board),
                move || {
                    let mail = Arc::clone(&mail);
                    async move {
                        mail.retry_failed_calls()
                            .await
                            .map(|sweep| {
                                format!(
                                    "retried={} failed={} exhausted={}",
                                    sweep.retried, sweep.failed, sweep.exhausted
                                )
                            })
                            .map_err(|error| error.to_string())
                    }
                },
            ));
        }

        {
            let auth = Arc::clone(&self.auth);
            let mail = Arc::clone(&self.mail);
            let config = self.config.clone();
            handles.push(spawn_sweep(
                TASK_CLEANUP,
                self.config.cleanup_interval,
                shutdown_rx,
                Arc::clone(&self.board),
                move || {
                    let auth = Arc::clone(&auth);
                    let mail = Arc::clone(&mail);
                    let config = config.clone();
                    async move {
                        let auth_cleanup = auth
                            .cleanup(config.token_retention_days, config.log_retention_days)
                            .map_err(|error| error.to_string())?;
                        let mail_cleanup = mail
                            .cleanup(config.log_retention_days, config.webhook_retention_days)
                            .map_err(|error| error.to_string())?;
                        Ok(format!(
                            "tokens={} logs={} pending={} history={} webhooks={}",
                            auth_cleanup.tokens_purged,
                            auth_cleanup.logs_purged,
                            auth_cleanup.pending_authorizations_purged,
                            mail_cleanup.history_purged,
                            mail_cleanup.webhooks_purged
                        ))
                    }
                },
            ));
        }

        *running = Some(Running {
            shutdown: shutdown_tx,
            handles,
        });
        info!("scheduler started with 4 periodic tasks");
        true
    }

    /// Signal every loop to stop and wait for in-flight iterations to
    /// finish. After stop returns, no further background writes occur.
    pub async fn stop(&self) {
        let running = {
            let mut guard = self
                .running
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.take()
        };

        let Some(running) = running else {
            warn!("scheduler not running");
            return;
        };

        let _ = running.shutdown.send(true);
        for handle in running.handles {
            let _ = handle.await;
        }
        info!("scheduler stopped");
    }

    pub fn status(&self) -> Vec<TaskSnapshot> {
        self.board.snapshot()
    }
}

/// One periodic loop: run the sweep on every tick, stop when the shutdown
/// signal flips. The first tick fires immediately, so every sweep runs
/// once at startup.
fn spawn_sweep<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    board: Arc<StatusBoard>,
    sweep: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = sweep().await;
                    board.record(name, outcome);
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::StatusBoard;

    #[test]
    fn status_board_tracks_runs_and_failures() {
        let board = StatusBoard::default();

        board.record("token_refresh", Ok("refreshed=1 failed=0".to_string()));
        board.record("token_refresh", Err("store unavailable".to_string()));
        board.record("cleanup", Ok("tokens=0".to_string()));

        let snapshots = board.snapshot();
        assert_eq!(snapshots.len(), 2);

        let refresh = snapshots
            .iter()
            .find(|snapshot| snapshot.name == "token_refresh")
            .expect("token_refresh tracked");
        assert_eq!(refresh.runs, 2);
        assert_eq!(refresh.failures, 1);
        assert_eq!(refresh.last_error.as_deref(), Some("store unavailable"));

        let cleanup = snapshots
            .iter()
            .find(|snapshot| snapshot.name == "cleanup")
            .expect("cleanup tracked");
        assert_eq!(cleanup.runs, 1);
        assert_eq!(cleanup.failures, 0);
        assert!(cleanup.last_error.is_none());
    }

    #[test]
    fn successful_run_clears_previous_error() {
        let board = StatusBoard::default();
        board.record("forward_retry", Err("downstream 502".to_string()));
        board.record("forward_retry", Ok("retried=1".to_string()));

        let snapshots = board.snapshot();
        assert_eq!(snapshots[0].failures, 1);
        assert!(snapshots[0].last_error.is_none());
    }
}
