use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use tokio::sync::{Mutex, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::clock::Clock;
use crate::error::{LifecycleError, map_store_error};
use crate::scheduler::cron::{CronSchedule, format_timezone};
use crate::scheduler::types::{
    RunOutcome, SERVICE_TASK_ID, TaskExecutionRecord, TaskRunStatus, TaskStatusView, TriggerKind,
};
use crate::store::{LifecycleStore, new_record_id};

/// What a handler learns about the run it serves.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub run_id: String,
    pub trigger: TriggerKind,
    pub scheduled_for: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, context: TaskContext) -> anyhow::Result<Value>;
}

struct FnTaskHandler<F>(F);

#[async_trait]
impl<F> TaskHandler for FnTaskHandler<F>
where
    F: Fn(TaskContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync,
{
    async fn run(&self, context: TaskContext) -> anyhow::Result<Value> {
        (self.0)(context).await
    }
}

/// Wraps a closure returning a boxed future as a [`TaskHandler`].
pub fn handler_fn<F>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(TaskContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync + 'static,
{
    Arc::new(FnTaskHandler(f))
}

#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub id: String,
    pub description: String,
    pub cron: String,
    pub timezone: FixedOffset,
    pub enabled: bool,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, cron: impl Into<String>, timezone: FixedOffset) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            cron: cron.into(),
            timezone,
            enabled: true,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Lease owner name when the storage lease is on.
    pub instance_id: String,
    pub lease_enabled: bool,
    pub lease_ttl_seconds: i64,
    pub history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_id: "lifecycle-local".to_string(),
            lease_enabled: false,
            lease_ttl_seconds: 15 * 60,
            history_limit: 20,
        }
    }
}

/// Snapshot of a registered task used by recovery.
#[derive(Debug, Clone)]
pub struct RegisteredTaskInfo {
    pub id: String,
    pub schedule: CronSchedule,
    pub timezone: FixedOffset,
    pub enabled: bool,
}

/// How a run is audited.
#[derive(Debug, Clone)]
enum RunMode {
    /// `started` then `completed` or `error`.
    Normal,
    /// Only a `recovered` (or `error`) record carrying these details.
    Recovery { details: Value },
}

struct RegisteredTask {
    id: String,
    description: String,
    schedule: CronSchedule,
    timezone: FixedOffset,
    handler: Arc<dyn TaskHandler>,
    enabled: AtomicBool,
    running: AtomicBool,
    next_run_at: Mutex<Option<DateTime<Utc>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Clears the running flag however the run ends.
struct RunningGuard {
    task: Arc<RegisteredTask>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.task.running.store(false, Ordering::Release);
    }
}

struct SchedulerInner {
    store: Arc<dyn LifecycleStore>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    tasks: Mutex<BTreeMap<String, Arc<RegisteredTask>>>,
    executions: Mutex<JoinSet<()>>,
    stop_tx: watch::Sender<bool>,
}

/// Cron-driven job runner. Each task has its own timer; runs of the same task
/// never overlap inside one process.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    pub fn new(
        store: Arc<dyn LifecycleStore>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                clock,
                config,
                tasks: Mutex::new(BTreeMap::new()),
                executions: Mutex::new(JoinSet::new()),
                stop_tx,
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub async fn register(
        &self,
        spec: TaskSpec,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), LifecycleError> {
        let id = spec.id.trim().to_string();
        if id.is_empty() || id == SERVICE_TASK_ID {
            return Err(LifecycleError::InvalidRequest(format!(
                "invalid task id {:?}",
                spec.id
            )));
        }
        let schedule = CronSchedule::parse(&spec.cron)
            .map_err(|error| LifecycleError::InvalidRequest(format!("{id}: {error}")))?;

        let task = Arc::new(RegisteredTask {
            id: id.clone(),
            description: spec.description,
            schedule,
            timezone: spec.timezone,
            handler,
            enabled: AtomicBool::new(spec.enabled),
            running: AtomicBool::new(false),
            next_run_at: Mutex::new(None),
            timer: Mutex::new(None),
        });

        {
            let mut tasks = self.inner.tasks.lock().await;
            if tasks.contains_key(&id) {
                return Err(LifecycleError::Conflict(format!(
                    "task {id} is already registered"
                )));
            }
            tasks.insert(id.clone(), task.clone());
        }

        tracing::info!(
            task_id = %id,
            cron = %task.schedule,
            timezone = %format_timezone(task.timezone),
            enabled = spec.enabled,
            "task registered"
        );
        if spec.enabled {
            self.start_timer(task).await;
        }
        Ok(())
    }

    /// Runs the task now through the normal audit path and waits for it.
    pub async fn trigger(&self, task_id: &str) -> Result<RunOutcome, LifecycleError> {
        let task = self.task(task_id).await?;
        Ok(run_task(&self.inner, task, TriggerKind::Manual, None, RunMode::Normal).await)
    }

    /// Runs the task's handler once on behalf of recovery. Writes a single
    /// `recovered` record with `details` on success.
    pub async fn execute_recovery(
        &self,
        task_id: &str,
        details: Value,
    ) -> Result<RunOutcome, LifecycleError> {
        let task = self.task(task_id).await?;
        Ok(run_task(
            &self.inner,
            task,
            TriggerKind::Recovery,
            None,
            RunMode::Recovery { details },
        )
        .await)
    }

    pub async fn enable(&self, task_id: &str) -> Result<(), LifecycleError> {
        let task = self.task(task_id).await?;
        if !task.enabled.swap(true, Ordering::AcqRel) {
            tracing::info!(task_id = %task.id, "task enabled");
        }
        self.start_timer(task).await;
        Ok(())
    }

    pub async fn disable(&self, task_id: &str) -> Result<(), LifecycleError> {
        let task = self.task(task_id).await?;
        task.enabled.store(false, Ordering::Release);
        if let Some(handle) = task.timer.lock().await.take() {
            handle.abort();
        }
        *task.next_run_at.lock().await = None;
        tracing::info!(task_id = %task.id, "task disabled");
        Ok(())
    }

    /// Halts every timer and waits for in-flight scheduled runs to finish.
    pub async fn stop(&self) {
        self.inner.stop_tx.send_replace(true);

        let tasks: Vec<Arc<RegisteredTask>> =
            self.inner.tasks.lock().await.values().cloned().collect();
        for task in tasks {
            let handle = task.timer.lock().await.take();
            if let Some(handle) = handle
                && let Err(error) = handle.await
                && !error.is_cancelled()
            {
                tracing::warn!(task_id = %task.id, reason = %error, "task timer ended abnormally");
            }
            *task.next_run_at.lock().await = None;
        }

        let mut executions = std::mem::take(&mut *self.inner.executions.lock().await);
        while let Some(joined) = executions.join_next().await {
            if let Err(error) = joined {
                tracing::warn!(reason = %error, "scheduled run ended abnormally");
            }
        }
        tracing::info!("scheduler stopped");
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.stop_tx.borrow()
    }

    pub async fn get_task_status(&self, task_id: &str) -> Result<TaskStatusView, LifecycleError> {
        let task = self.task(task_id).await?;
        self.status_view(&task).await
    }

    pub async fn list_tasks(&self) -> Result<Vec<TaskStatusView>, LifecycleError> {
        let tasks: Vec<Arc<RegisteredTask>> =
            self.inner.tasks.lock().await.values().cloned().collect();
        let mut views = Vec::with_capacity(tasks.len());
        for task in tasks {
            views.push(self.status_view(&task).await?);
        }
        Ok(views)
    }

    pub async fn registered_tasks(&self) -> Vec<RegisteredTaskInfo> {
        self.inner
            .tasks
            .lock()
            .await
            .values()
            .map(|task| RegisteredTaskInfo {
                id: task.id.clone(),
                schedule: task.schedule.clone(),
                timezone: task.timezone,
                enabled: task.enabled.load(Ordering::Acquire),
            })
            .collect()
    }

    /// Writes the process start marker recovery falls back to and returns the
    /// time of the previous marker, if any.
    pub async fn record_service_start(&self) -> Result<Option<DateTime<Utc>>, LifecycleError> {
        let previous = self
            .inner
            .store
            .latest_task_record(SERVICE_TASK_ID, &[TaskRunStatus::ServiceStarted])
            .await
            .map_err(map_store_error)?
            .map(|record| record.at);
        let now = self.inner.clock.now();
        self.inner
            .store
            .append_task_record(TaskExecutionRecord {
                record_id: new_record_id("task"),
                task_id: SERVICE_TASK_ID.to_string(),
                run_id: new_record_id("run"),
                status: TaskRunStatus::ServiceStarted,
                at: now,
                duration_ms: None,
                error_message: None,
                details: json!({
                    "instance_id": self.inner.config.instance_id,
                    "previous_start": previous,
                }),
            })
            .await
            .map_err(map_store_error)?;
        Ok(previous)
    }

    async fn task(&self, task_id: &str) -> Result<Arc<RegisteredTask>, LifecycleError> {
        self.inner
            .tasks
            .lock()
            .await
            .get(task_id.trim())
            .cloned()
            .ok_or_else(|| LifecycleError::RecordNotFound(format!("task {task_id}")))
    }

    async fn status_view(&self, task: &RegisteredTask) -> Result<TaskStatusView, LifecycleError> {
        let history = self
            .inner
            .store
            .list_task_records(&task.id, self.inner.config.history_limit)
            .await
            .map_err(map_store_error)?;
        Ok(TaskStatusView {
            task_id: task.id.clone(),
            description: task.description.clone(),
            cron: task.schedule.expression().to_string(),
            timezone: format_timezone(task.timezone),
            enabled: task.enabled.load(Ordering::Acquire),
            running: task.running.load(Ordering::Acquire),
            next_run_at: *task.next_run_at.lock().await,
            last_record: history.first().cloned(),
            history,
        })
    }

    async fn start_timer(&self, task: Arc<RegisteredTask>) {
        if self.is_stopped() {
            return;
        }
        let mut timer = task.timer.lock().await;
        if timer.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let inner = self.inner.clone();
        let stop = self.inner.stop_tx.subscribe();
        *timer = Some(tokio::spawn(timer_loop(inner, task.clone(), stop)));
    }
}

async fn timer_loop(
    inner: Arc<SchedulerInner>,
    task: Arc<RegisteredTask>,
    mut stop: watch::Receiver<bool>,
) {
    // Never fire the same occurrence twice, even if the clock lags the timer.
    let mut last_fired: Option<DateTime<Utc>> = None;
    loop {
        if *stop.borrow() || !task.enabled.load(Ordering::Acquire) {
            break;
        }
        let now = inner.clock.now();
        let base = last_fired.map_or(now, |fired| fired.max(now));
        let Some(next) = task.schedule.next_after(base, task.timezone) else {
            tracing::warn!(task_id = %task.id, cron = %task.schedule, "cron schedule has no next occurrence");
            break;
        };
        *task.next_run_at.lock().await = Some(next);

        let wait = (next - now).to_std().unwrap_or_default();
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
                continue;
            }
        }
        last_fired = Some(next);

        if !task.enabled.load(Ordering::Acquire) {
            break;
        }
        let run_inner = inner.clone();
        let run_task_handle = task.clone();
        let mut executions = inner.executions.lock().await;
        while executions.try_join_next().is_some() {}
        executions.spawn(async move {
            run_task(
                &run_inner,
                run_task_handle,
                TriggerKind::Schedule,
                Some(next),
                RunMode::Normal,
            )
            .await;
        });
    }
    *task.next_run_at.lock().await = None;
}

async fn run_task(
    inner: &SchedulerInner,
    task: Arc<RegisteredTask>,
    trigger: TriggerKind,
    scheduled_for: Option<DateTime<Utc>>,
    mode: RunMode,
) -> RunOutcome {
    if task.running.swap(true, Ordering::AcqRel) {
        tracing::warn!(
            task_id = %task.id,
            trigger = trigger.as_str(),
            "previous run still in flight, skipping"
        );
        return RunOutcome::SkippedOverlap;
    }
    let _running = RunningGuard { task: task.clone() };

    let lease_owner = if inner.config.lease_enabled {
        let now = inner.clock.now();
        let expires_at = now + Duration::seconds(inner.config.lease_ttl_seconds.max(1));
        match inner
            .store
            .try_acquire_task_lease(&task.id, &inner.config.instance_id, now, expires_at)
            .await
        {
            Ok(true) => Some(inner.config.instance_id.clone()),
            Ok(false) => {
                tracing::info!(
                    task_id = %task.id,
                    instance_id = %inner.config.instance_id,
                    "task lease held by another instance, skipping"
                );
                return RunOutcome::SkippedLeaseHeld;
            }
            Err(error) => {
                let run_id = new_record_id("run");
                let message = error.to_string();
                tracing::error!(
                    task_id = %task.id,
                    run_id = %run_id,
                    reason = %message,
                    "task lease acquisition failed, skipping"
                );
                append_record(
                    inner,
                    TaskExecutionRecord {
                        record_id: new_record_id("task"),
                        task_id: task.id.clone(),
                        run_id: run_id.clone(),
                        status: TaskRunStatus::Error,
                        at: now,
                        duration_ms: None,
                        error_message: Some(message.clone()),
                        details: json!({
                            "trigger": trigger.as_str(),
                            "stage": "lease",
                            "instance_id": inner.config.instance_id,
                        }),
                    },
                )
                .await;
                return RunOutcome::LeaseUnavailable {
                    run_id,
                    error: message,
                };
            }
        }
    } else {
        None
    };

    let run_id = new_record_id("run");
    let started_at = inner.clock.now();
    let started = Instant::now();

    if matches!(mode, RunMode::Normal) {
        append_record(
            inner,
            TaskExecutionRecord {
                record_id: new_record_id("task"),
                task_id: task.id.clone(),
                run_id: run_id.clone(),
                status: TaskRunStatus::Started,
                at: started_at,
                duration_ms: None,
                error_message: None,
                details: json!({
                    "trigger": trigger.as_str(),
                    "scheduled_for": scheduled_for,
                    "instance_id": inner.config.instance_id,
                }),
            },
        )
        .await;
    }

    let context = TaskContext {
        task_id: task.id.clone(),
        run_id: run_id.clone(),
        trigger,
        scheduled_for,
    };
    let result = match AssertUnwindSafe(task.handler.run(context))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!("handler panicked: {}", panic_message(&*panic))),
    };
    let duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
    let finished_at = inner.clock.now();

    let outcome = match result {
        Ok(summary) => {
            let (status, details) = match &mode {
                RunMode::Normal => (
                    TaskRunStatus::Completed,
                    json!({ "trigger": trigger.as_str(), "summary": summary }),
                ),
                RunMode::Recovery { details } => {
                    let mut details = details.clone();
                    if let Some(object) = details.as_object_mut() {
                        object.insert("summary".to_string(), summary.clone());
                    }
                    (TaskRunStatus::Recovered, details)
                }
            };
            append_record(
                inner,
                TaskExecutionRecord {
                    record_id: new_record_id("task"),
                    task_id: task.id.clone(),
                    run_id: run_id.clone(),
                    status,
                    at: finished_at,
                    duration_ms: Some(duration_ms),
                    error_message: None,
                    details,
                },
            )
            .await;
            tracing::info!(
                task_id = %task.id,
                run_id = %run_id,
                trigger = trigger.as_str(),
                duration_ms,
                "task run completed"
            );
            RunOutcome::Completed {
                run_id,
                duration_ms,
                summary,
            }
        }
        Err(error) => {
            let message = format!("{error:#}");
            let details = match &mode {
                RunMode::Normal => json!({ "trigger": trigger.as_str() }),
                RunMode::Recovery { details } => details.clone(),
            };
            append_record(
                inner,
                TaskExecutionRecord {
                    record_id: new_record_id("task"),
                    task_id: task.id.clone(),
                    run_id: run_id.clone(),
                    status: TaskRunStatus::Error,
                    at: finished_at,
                    duration_ms: Some(duration_ms),
                    error_message: Some(message.clone()),
                    details,
                },
            )
            .await;
            tracing::error!(
                task_id = %task.id,
                run_id = %run_id,
                trigger = trigger.as_str(),
                duration_ms,
                reason = %message,
                "task run failed"
            );
            RunOutcome::Failed {
                run_id,
                duration_ms,
                error: message,
            }
        }
    };

    if let Some(owner) = lease_owner
        && let Err(error) = inner.store.release_task_lease(&task.id, &owner).await
    {
        tracing::warn!(task_id = %task.id, reason = %error, "task lease release failed");
    }
    outcome
}

async fn append_record(inner: &SchedulerInner, record: TaskExecutionRecord) {
    let task_id = record.task_id.clone();
    let status = record.status;
    if let Err(error) = inner.store.append_task_record(record).await {
        tracing::error!(
            task_id = %task_id,
            status = status.as_str(),
            reason = %error,
            "task audit record write failed"
        );
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
