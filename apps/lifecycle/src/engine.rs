use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Context;
use futures::FutureExt;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::Config;
use crate::db::LifecycleDb;
use crate::error::LifecycleError;
use crate::ledger::TokenLedger;
use crate::ledger::types::{BalanceView, ExpiringTokensSummary};
use crate::notify::{NotificationSender, Notifier};
use crate::recovery::{RecoveryReport, TaskRecovery, default_strategies};
use crate::scheduler::types::{RunOutcome, TaskStatusView};
use crate::scheduler::{TaskScheduler, TaskSpec, handler_fn};
use crate::store::{self, LifecycleStore};
use crate::subscription::SubscriptionService;
use crate::subscription::types::SweepReport;

pub const TASK_SUBSCRIPTION_EXPIRATION: &str = "subscription-expiration";
pub const TASK_TOKEN_EXPIRATION: &str = "token-expiration";
pub const TASK_MONTHLY_ALLOCATION: &str = "monthly-token-allocation";

/// Wires the store, services and scheduler for one process.
#[derive(Clone)]
pub struct LifecycleEngine {
    config: Config,
    store: Arc<dyn LifecycleStore>,
    clock: Arc<dyn Clock>,
    ledger: TokenLedger,
    subscriptions: SubscriptionService,
    scheduler: TaskScheduler,
    recovery: Arc<Mutex<Option<JoinHandle<Option<RecoveryReport>>>>>,
}

impl LifecycleEngine {
    /// Postgres when a database URL is configured, memory otherwise.
    pub async fn connect(
        config: Config,
        clock: Arc<dyn Clock>,
        sender: Arc<dyn NotificationSender>,
    ) -> anyhow::Result<Self> {
        let store = match config.db_url.as_deref() {
            Some(url) => {
                let db = LifecycleDb::connect(url).await?;
                db.migrate().await?;
                store::postgres(Arc::new(db))
            }
            None => {
                tracing::warn!("no database configured; lifecycle state is in memory only");
                store::memory()
            }
        };
        Ok(Self::new(config, store, clock, sender))
    }

    pub fn new(
        config: Config,
        store: Arc<dyn LifecycleStore>,
        clock: Arc<dyn Clock>,
        sender: Arc<dyn NotificationSender>,
    ) -> Self {
        let ledger = TokenLedger::new(store.clone(), clock.clone());
        let subscriptions = SubscriptionService::new(
            store.clone(),
            clock.clone(),
            Notifier::new(sender),
            config.policy.clone(),
        );
        let scheduler = TaskScheduler::new(store.clone(), clock.clone(), config.scheduler.clone());
        Self {
            config,
            store,
            clock,
            ledger,
            subscriptions,
            scheduler,
            recovery: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ledger(&self) -> &TokenLedger {
        &self.ledger
    }

    pub fn subscriptions(&self) -> &SubscriptionService {
        &self.subscriptions
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Seeds the free plan and registers the lifecycle jobs.
    pub async fn prepare(&self) -> anyhow::Result<()> {
        self.subscriptions
            .ensure_free_plan()
            .await
            .context("seed free plan")?;
        self.register_jobs().await.context("register lifecycle jobs")?;
        Ok(())
    }

    /// [`Self::prepare`], then writes the start marker and schedules recovery.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.prepare().await?;
        let previous_start = self
            .scheduler
            .record_service_start()
            .await
            .context("record service start")?;

        if self.config.recovery.enabled {
            let recovery = TaskRecovery::new(
                self.scheduler.clone(),
                self.clock.clone(),
                default_strategies(self.store.clone(), TASK_SUBSCRIPTION_EXPIRATION),
            );
            let handle = recovery.spawn(
                StdDuration::from_secs(self.config.recovery.delay_seconds),
                previous_start,
            );
            *self.recovery.lock().await = Some(handle);
        } else {
            tracing::info!("task recovery disabled");
        }

        tracing::info!(
            service = %self.config.service_name,
            instance_id = %self.config.scheduler.instance_id,
            previous_start = ?previous_start,
            "lifecycle engine started"
        );
        Ok(())
    }

    /// Waits for the startup recovery pass, if one was scheduled.
    pub async fn wait_for_recovery(&self) -> Option<RecoveryReport> {
        let handle = self.recovery.lock().await.take()?;
        match handle.await {
            Ok(report) => report,
            Err(error) => {
                if !error.is_cancelled() {
                    tracing::warn!(reason = %error, "recovery task ended abnormally");
                }
                None
            }
        }
    }

    /// Stops timers, drops a recovery pass that has not begun and waits for
    /// in-flight runs.
    pub async fn stop(&self) {
        if let Some(handle) = self.recovery.lock().await.take()
            && !handle.is_finished()
        {
            handle.abort();
        }
        self.scheduler.stop().await;
    }

    pub async fn get_task_status(&self, task_id: &str) -> Result<TaskStatusView, LifecycleError> {
        self.scheduler.get_task_status(task_id).await
    }

    pub async fn list_tasks(&self) -> Result<Vec<TaskStatusView>, LifecycleError> {
        self.scheduler.list_tasks().await
    }

    pub async fn trigger_task(&self, task_id: &str) -> Result<RunOutcome, LifecycleError> {
        self.scheduler.trigger(task_id).await
    }

    pub async fn process_expired_subscriptions(&self) -> Result<SweepReport, LifecycleError> {
        self.subscriptions.process_expired_subscriptions().await
    }

    pub async fn get_user_balance(&self, user_id: &str) -> Result<BalanceView, LifecycleError> {
        self.ledger.get_balance(user_id).await
    }

    pub async fn get_expiring_tokens_summary(
        &self,
        days: i64,
    ) -> Result<ExpiringTokensSummary, LifecycleError> {
        self.ledger.get_expiring_tokens_summary(days).await
    }

    async fn register_jobs(&self) -> Result<(), LifecycleError> {
        let schedules = &self.config.schedules;

        let subscriptions = self.subscriptions.clone();
        self.scheduler
            .register(
                TaskSpec::new(
                    TASK_SUBSCRIPTION_EXPIRATION,
                    schedules.expiration_cron.as_str(),
                    schedules.timezone,
                )
                .description("expire due subscriptions and apply the free fallback"),
                handler_fn(move |_context| {
                    let subscriptions = subscriptions.clone();
                    async move {
                        let report = subscriptions.process_expired_subscriptions().await?;
                        let failed: Vec<&str> = report
                            .results
                            .iter()
                            .filter(|item| item.error.is_some())
                            .map(|item| item.subscription_id.as_str())
                            .collect();
                        Ok(json!({
                            "processed": report.results.len(),
                            "expired": report.expired_count(),
                            "errors": report.error_count(),
                            "failed_subscriptions": failed,
                        }))
                    }
                    .boxed()
                }),
            )
            .await?;

        let ledger = self.ledger.clone();
        self.scheduler
            .register(
                TaskSpec::new(
                    TASK_TOKEN_EXPIRATION,
                    schedules.token_expiration_cron.as_str(),
                    schedules.timezone,
                )
                .description("compensate expired subscription credits"),
                handler_fn(move |_context| {
                    let ledger = ledger.clone();
                    async move {
                        let summary = ledger.sweep_expired().await?;
                        Ok(json!({
                            "scanned": summary.scanned,
                            "compensated": summary.compensated,
                            "compensated_tokens": summary.compensated_tokens,
                            "failures": summary.failures.len(),
                        }))
                    }
                    .boxed()
                }),
            )
            .await?;

        let subscriptions = self.subscriptions.clone();
        self.scheduler
            .register(
                TaskSpec::new(
                    TASK_MONTHLY_ALLOCATION,
                    schedules.monthly_allocation_cron.as_str(),
                    schedules.timezone,
                )
                .description("grant due monthly tokens to long subscriptions"),
                handler_fn(move |_context| {
                    let subscriptions = subscriptions.clone();
                    async move {
                        let report = subscriptions.allocate_monthly_tokens().await?;
                        Ok(json!({
                            "allocated": report.allocated,
                            "allocated_tokens": report.allocated_tokens,
                            "skipped": report.skipped,
                            "failures": report.failures.len(),
                        }))
                    }
                    .boxed()
                }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::{Result, anyhow};
    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;
    use crate::notify::testing::RecordingSender;
    use crate::scheduler::types::{SERVICE_TASK_ID, TaskExecutionRecord, TaskRunStatus};
    use crate::store::new_record_id;
    use crate::subscription::types::{
        ActivateSubscriptionRequest, SubscriptionProvider, SubscriptionStatus,
    };
    use crate::testing::{at, plan};

    fn engine_at(start: &str, recovery_enabled: bool) -> (LifecycleEngine, ManualClock) {
        let clock = ManualClock::new(at(start));
        let mut config = Config::default();
        config.recovery.enabled = recovery_enabled;
        config.recovery.delay_seconds = 0;
        let engine = LifecycleEngine::new(
            config,
            store::memory(),
            Arc::new(clock.clone()),
            Arc::new(RecordingSender::default()),
        );
        (engine, clock)
    }

    #[tokio::test]
    async fn start_registers_the_three_jobs_and_writes_a_start_marker() -> Result<()> {
        let (engine, _clock) = engine_at("2024-01-11T02:00:00Z", false);
        engine.start().await?;

        let ids: Vec<String> = engine
            .list_tasks()
            .await?
            .into_iter()
            .map(|task| task.task_id)
            .collect();
        assert_eq!(
            ids,
            vec![
                TASK_MONTHLY_ALLOCATION.to_string(),
                TASK_SUBSCRIPTION_EXPIRATION.to_string(),
                TASK_TOKEN_EXPIRATION.to_string(),
            ]
        );
        let markers = engine.store.list_task_records(SERVICE_TASK_ID, 10).await?;
        assert_eq!(markers.len(), 1);
        assert!(engine.wait_for_recovery().await.is_none());

        engine.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn manual_trigger_runs_the_expiration_sweep() -> Result<()> {
        let (engine, clock) = engine_at("2024-01-01T00:00:00Z", false);
        engine.start().await?;
        engine.subscriptions().upsert_plan(plan("pro", 10_000, 30)).await?;
        let paid = engine
            .subscriptions()
            .activate(ActivateSubscriptionRequest {
                user_id: "user-1".to_string(),
                plan_id: "pro".to_string(),
                provider: SubscriptionProvider::Stripe,
                duration_days: None,
                metadata: json!({}),
            })
            .await?;

        clock.advance(Duration::days(31));
        let outcome = engine.trigger_task(TASK_SUBSCRIPTION_EXPIRATION).await?;
        let RunOutcome::Completed { summary, .. } = outcome else {
            return Err(anyhow!("expected a completed run, got {outcome:?}"));
        };
        assert_eq!(summary["expired"], 1);
        assert_eq!(summary["errors"], 0);

        let expired = engine
            .subscriptions()
            .get_subscription(&paid.subscription.subscription_id)
            .await?;
        assert_eq!(expired.status, SubscriptionStatus::Expired);
        assert_eq!(engine.get_user_balance("user-1").await?.total, 1_000);

        let status = engine.get_task_status(TASK_SUBSCRIPTION_EXPIRATION).await?;
        let last = status
            .last_record
            .ok_or_else(|| anyhow!("expected an audit record"))?;
        assert_eq!(last.status, TaskRunStatus::Completed);

        engine.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn startup_recovery_catches_up_missed_sweeps() -> Result<()> {
        let (engine, _clock) = engine_at("2024-01-11T02:00:00Z", true);
        for task_id in [TASK_SUBSCRIPTION_EXPIRATION, TASK_TOKEN_EXPIRATION] {
            engine
                .store
                .append_task_record(TaskExecutionRecord {
                    record_id: new_record_id("task"),
                    task_id: task_id.to_string(),
                    run_id: new_record_id("run"),
                    status: TaskRunStatus::Completed,
                    at: at("2024-01-09T00:00:00Z"),
                    duration_ms: Some(5),
                    error_message: None,
                    details: json!({}),
                })
                .await?;
        }

        engine.start().await?;
        let report = engine
            .wait_for_recovery()
            .await
            .ok_or_else(|| anyhow!("recovery produced no report"))?;
        // Monthly allocation has no history, so midnight keeps it quiet.
        assert_eq!(report.recovered_count(), 2);

        engine.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn prepare_alone_leaves_no_start_marker() -> Result<()> {
        let (engine, _clock) = engine_at("2024-01-01T00:00:00Z", true);
        engine.prepare().await?;
        assert_eq!(engine.list_tasks().await?.len(), 3);
        assert!(
            engine
                .store
                .list_task_records(SERVICE_TASK_ID, 10)
                .await?
                .is_empty()
        );
        assert!(matches!(
            engine.trigger_task("nightly-report").await,
            Err(LifecycleError::RecordNotFound(_))
        ));
        assert!(matches!(
            engine.get_expiring_tokens_summary(0).await,
            Err(LifecycleError::InvalidRequest(_))
        ));
        engine.stop().await;
        Ok(())
    }
}
