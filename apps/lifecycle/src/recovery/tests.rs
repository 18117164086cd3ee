use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, FixedOffset, Offset, Utc};
use futures::FutureExt;
use serde_json::json;

use crate::clock::ManualClock;
use crate::recovery::service::{RecoveryAction, TaskRecovery};
use crate::recovery::strategy::{
    STRATEGY_LAST_AUDIT_RECORD, STRATEGY_MIDNIGHT_DEFAULT, STRATEGY_OLDEST_OVERDUE_SUBSCRIPTION,
    STRATEGY_SERVICE_START, default_strategies, last_midnight,
};
use crate::scheduler::types::{TaskExecutionRecord, TaskRunStatus};
use crate::scheduler::{SchedulerConfig, TaskScheduler, TaskSpec, handler_fn};
use crate::store::{self, ActivationInput, LifecycleStore, new_record_id};
use crate::subscription::service::new_subscription_row;
use crate::subscription::types::SubscriptionProvider;
use crate::testing::{at, plan};

const DAILY: &str = "daily-sweep";

struct Harness {
    store: Arc<dyn LifecycleStore>,
    scheduler: TaskScheduler,
    recovery: TaskRecovery,
    runs: Arc<AtomicU32>,
}

async fn harness(now: &str) -> Result<Harness> {
    let store = store::memory();
    let clock = ManualClock::new(at(now));
    let scheduler = TaskScheduler::new(
        store.clone(),
        Arc::new(clock.clone()),
        SchedulerConfig::default(),
    );
    let runs = Arc::new(AtomicU32::new(0));
    let counter = runs.clone();
    scheduler
        .register(
            TaskSpec::new(DAILY, "0 0 * * *", Utc.fix()),
            handler_fn(move |_context| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({ "expired": 0 }))
                }
                .boxed()
            }),
        )
        .await?;
    let recovery = TaskRecovery::new(
        scheduler.clone(),
        Arc::new(clock.clone()),
        default_strategies(store.clone(), DAILY),
    );
    Ok(Harness {
        store,
        scheduler,
        recovery,
        runs,
    })
}

async fn completed_at(store: &Arc<dyn LifecycleStore>, task_id: &str, at: DateTime<Utc>) -> Result<()> {
    store
        .append_task_record(TaskExecutionRecord {
            record_id: new_record_id("task"),
            task_id: task_id.to_string(),
            run_id: new_record_id("run"),
            status: TaskRunStatus::Completed,
            at,
            duration_ms: Some(12),
            error_message: None,
            details: json!({}),
        })
        .await?;
    Ok(())
}

#[tokio::test]
async fn recent_audit_record_means_no_catch_up() -> Result<()> {
    let harness = harness("2024-01-11T02:00:00Z").await?;
    completed_at(&harness.store, DAILY, at("2024-01-11T00:00:00Z")).await?;

    let report = harness.recovery.run(None).await?;
    let task = &report.tasks[0];
    assert_eq!(task.action, RecoveryAction::UpToDate);
    assert_eq!(task.strategy.as_deref(), Some(STRATEGY_LAST_AUDIT_RECORD));
    assert_eq!(task.gap_seconds, Some(7_200));
    assert_eq!(task.threshold_seconds, Some(86_400));
    assert_eq!(harness.runs.load(Ordering::SeqCst), 0);
    assert_eq!(harness.store.list_task_records(DAILY, 10).await?.len(), 1);

    harness.scheduler.stop().await;
    Ok(())
}

#[tokio::test]
async fn stale_audit_record_runs_the_handler_exactly_once() -> Result<()> {
    let harness = harness("2024-01-11T02:00:00Z").await?;
    completed_at(&harness.store, DAILY, at("2024-01-09T20:00:00Z")).await?;

    let report = harness.recovery.run(None).await?;
    assert_eq!(report.recovered_count(), 1);
    assert_eq!(report.tasks[0].gap_seconds, Some(108_000));
    assert_eq!(harness.runs.load(Ordering::SeqCst), 1);

    let records = harness.store.list_task_records(DAILY, 10).await?;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].status, TaskRunStatus::Recovered);
    assert_eq!(records[0].details["gap_seconds"], 108_000);
    assert_eq!(records[0].details["strategy"], STRATEGY_LAST_AUDIT_RECORD);
    let recovered = records
        .iter()
        .filter(|record| record.status == TaskRunStatus::Recovered)
        .count();
    assert_eq!(recovered, 1);

    // The recovered record now counts as the last run.
    let again = harness.recovery.run(None).await?;
    assert_eq!(again.tasks[0].action, RecoveryAction::UpToDate);
    assert_eq!(harness.runs.load(Ordering::SeqCst), 1);

    harness.scheduler.stop().await;
    Ok(())
}

#[tokio::test]
async fn previous_service_start_is_the_first_fallback() -> Result<()> {
    let harness = harness("2024-01-11T02:00:00Z").await?;

    let report = harness
        .recovery
        .run(Some(at("2024-01-09T10:00:00Z")))
        .await?;
    let task = &report.tasks[0];
    assert_eq!(task.strategy.as_deref(), Some(STRATEGY_SERVICE_START));
    assert_eq!(task.action, RecoveryAction::Recovered);
    assert_eq!(harness.runs.load(Ordering::SeqCst), 1);

    harness.scheduler.stop().await;
    Ok(())
}

#[tokio::test]
async fn overdue_subscription_estimates_the_expiration_sweep() -> Result<()> {
    let harness = harness("2024-01-11T02:00:00Z").await?;
    let pro = plan("pro", 100, 30);
    let row = new_subscription_row(
        "user-1",
        &pro,
        SubscriptionProvider::Stripe,
        at("2023-12-08T00:00:00Z"),
        30,
        30,
        json!({}),
    )?;
    harness
        .store
        .activate_subscription(ActivationInput {
            subscription: row,
            initial_grant: 0,
            grant_source: String::new(),
            supersede: None,
            now: at("2023-12-08T00:00:00Z"),
        })
        .await?;

    let report = harness.recovery.run(None).await?;
    let task = &report.tasks[0];
    assert_eq!(
        task.strategy.as_deref(),
        Some(STRATEGY_OLDEST_OVERDUE_SUBSCRIPTION)
    );
    assert_eq!(task.estimated_last_run, Some(at("2024-01-06T00:00:00Z")));
    assert_eq!(task.action, RecoveryAction::Recovered);

    harness.scheduler.stop().await;
    Ok(())
}

#[tokio::test]
async fn midnight_default_keeps_a_fresh_install_quiet() -> Result<()> {
    let harness = harness("2024-01-11T02:00:00Z").await?;

    let report = harness.recovery.run(None).await?;
    let task = &report.tasks[0];
    assert_eq!(task.strategy.as_deref(), Some(STRATEGY_MIDNIGHT_DEFAULT));
    assert_eq!(task.estimated_last_run, Some(at("2024-01-11T00:00:00Z")));
    assert_eq!(task.action, RecoveryAction::UpToDate);
    assert_eq!(harness.runs.load(Ordering::SeqCst), 0);

    harness.scheduler.stop().await;
    Ok(())
}

#[tokio::test]
async fn disabled_tasks_are_not_caught_up() -> Result<()> {
    let harness = harness("2024-01-11T02:00:00Z").await?;
    completed_at(&harness.store, DAILY, at("2024-01-01T00:00:00Z")).await?;
    harness.scheduler.disable(DAILY).await?;

    let report = harness.recovery.run(None).await?;
    assert_eq!(report.tasks[0].action, RecoveryAction::Disabled);
    assert_eq!(harness.runs.load(Ordering::SeqCst), 0);

    harness.scheduler.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn spawned_recovery_waits_for_its_delay() -> Result<()> {
    let harness = harness("2024-01-11T02:00:00Z").await?;
    completed_at(&harness.store, DAILY, at("2024-01-09T20:00:00Z")).await?;

    let handle = harness
        .recovery
        .clone()
        .spawn(std::time::Duration::from_secs(5), None);
    tokio::time::sleep(std::time::Duration::from_secs(4)).await;
    assert_eq!(harness.runs.load(Ordering::SeqCst), 0);

    let report = handle.await?.ok_or_else(|| anyhow!("recovery produced no report"))?;
    assert_eq!(report.recovered_count(), 1);
    assert_eq!(harness.runs.load(Ordering::SeqCst), 1);

    harness.scheduler.stop().await;
    Ok(())
}

#[test]
fn last_midnight_respects_the_offset() -> Result<()> {
    let now = at("2024-01-11T02:00:00Z");
    let utc8 = FixedOffset::east_opt(8 * 3600).ok_or_else(|| anyhow!("invalid offset"))?;
    assert_eq!(
        last_midnight(now, utc8),
        Some(at("2024-01-10T16:00:00Z"))
    );
    let minus5 = FixedOffset::west_opt(5 * 3600).ok_or_else(|| anyhow!("invalid offset"))?;
    assert_eq!(
        last_midnight(now, minus5),
        Some(at("2024-01-10T05:00:00Z"))
    );
    assert_eq!(
        last_midnight(now, Utc.fix()).map(|value| now - value),
        Some(Duration::hours(2))
    );
    Ok(())
}
