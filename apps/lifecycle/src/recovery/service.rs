use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::error::LifecycleError;
use crate::recovery::strategy::{LastRunStrategy, RecoveryContext};
use crate::scheduler::TaskScheduler;
use crate::scheduler::types::RunOutcome;

pub const RECOVERY_REPORT_SCHEMA_V1: &str = "lifecycle.recovery.report.v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    UpToDate,
    Recovered,
    Failed,
    Disabled,
    /// The schedule has no usable period or no strategy produced an estimate.
    NoEstimate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecoveryResult {
    pub task_id: String,
    pub action: RecoveryAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_last_run: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gap_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub schema: String,
    pub checked_at: DateTime<Utc>,
    pub tasks: Vec<TaskRecoveryResult>,
}

impl RecoveryReport {
    pub fn recovered_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|task| task.action == RecoveryAction::Recovered)
            .count()
    }
}

/// Startup catch-up for runs missed while the process was down.
///
/// For each enabled task the strategies are tried in order until one yields a
/// last-run estimate. If the gap to now exceeds the task's cron period, the
/// handler runs once through [`TaskScheduler::execute_recovery`].
#[derive(Clone)]
pub struct TaskRecovery {
    scheduler: TaskScheduler,
    clock: Arc<dyn Clock>,
    strategies: Vec<Arc<dyn LastRunStrategy>>,
}

impl TaskRecovery {
    pub fn new(
        scheduler: TaskScheduler,
        clock: Arc<dyn Clock>,
        strategies: Vec<Arc<dyn LastRunStrategy>>,
    ) -> Self {
        Self {
            scheduler,
            clock,
            strategies,
        }
    }

    pub async fn run(
        &self,
        previous_service_start: Option<DateTime<Utc>>,
    ) -> Result<RecoveryReport, LifecycleError> {
        let now = self.clock.now();
        let mut tasks = self.scheduler.registered_tasks().await;
        tasks.sort_by(|a, b| a.id.cmp(&b.id));

        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            let mut result = TaskRecoveryResult {
                task_id: task.id.clone(),
                action: RecoveryAction::NoEstimate,
                strategy: None,
                estimated_last_run: None,
                gap_seconds: None,
                threshold_seconds: None,
                outcome: None,
            };
            if !task.enabled {
                result.action = RecoveryAction::Disabled;
                results.push(result);
                continue;
            }
            let Some(threshold) = task.schedule.period_hint(now, task.timezone) else {
                results.push(result);
                continue;
            };
            result.threshold_seconds = Some(threshold.num_seconds());

            let context = RecoveryContext {
                task_id: task.id.clone(),
                timezone: task.timezone,
                now,
                previous_service_start,
            };
            let Some((strategy, estimate)) = self.estimate(&context).await else {
                tracing::warn!(task_id = %task.id, "no last-run estimate for task");
                results.push(result);
                continue;
            };
            let gap = now - estimate;
            result.strategy = Some(strategy.to_string());
            result.estimated_last_run = Some(estimate);
            result.gap_seconds = Some(gap.num_seconds());

            if gap <= threshold {
                tracing::debug!(
                    task_id = %task.id,
                    strategy,
                    gap_seconds = gap.num_seconds(),
                    "task is up to date"
                );
                result.action = RecoveryAction::UpToDate;
                results.push(result);
                continue;
            }

            tracing::warn!(
                task_id = %task.id,
                strategy,
                estimated_last_run = %estimate,
                gap_seconds = gap.num_seconds(),
                threshold_seconds = threshold.num_seconds(),
                "missed run detected; running catch-up"
            );
            let details = json!({
                "gap_seconds": gap.num_seconds(),
                "threshold_seconds": threshold.num_seconds(),
                "estimated_last_run": estimate,
                "strategy": strategy,
            });
            match self.scheduler.execute_recovery(&task.id, details).await {
                Ok(outcome) => {
                    result.action = if outcome.is_completed() {
                        RecoveryAction::Recovered
                    } else {
                        RecoveryAction::Failed
                    };
                    result.outcome = Some(outcome);
                }
                Err(error) => {
                    tracing::warn!(
                        task_id = %task.id,
                        reason = %error,
                        "catch-up run could not start"
                    );
                    result.action = RecoveryAction::Failed;
                }
            }
            results.push(result);
        }

        let report = RecoveryReport {
            schema: RECOVERY_REPORT_SCHEMA_V1.to_string(),
            checked_at: now,
            tasks: results,
        };
        tracing::info!(
            tasks = report.tasks.len(),
            recovered = report.recovered_count(),
            "task recovery finished"
        );
        Ok(report)
    }

    /// Runs [`Self::run`] after `delay` on its own task so startup never waits
    /// for it.
    pub fn spawn(
        self,
        delay: std::time::Duration,
        previous_service_start: Option<DateTime<Utc>>,
    ) -> JoinHandle<Option<RecoveryReport>> {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if self.scheduler.is_stopped() {
                tracing::info!("scheduler stopped before recovery; skipping");
                return None;
            }
            match self.run(previous_service_start).await {
                Ok(report) => Some(report),
                Err(error) => {
                    tracing::warn!(reason = %error, "task recovery failed");
                    None
                }
            }
        })
    }

    async fn estimate(&self, context: &RecoveryContext) -> Option<(&'static str, DateTime<Utc>)> {
        for strategy in &self.strategies {
            match strategy.estimate(context).await {
                Ok(Some(at)) => return Some((strategy.name(), at)),
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(
                        task_id = %context.task_id,
                        strategy = strategy.name(),
                        reason = %error,
                        "recovery strategy failed; trying next"
                    );
                }
            }
        }
        None
    }
}
