use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, NaiveTime, TimeZone, Utc};

use crate::error::{LifecycleError, map_store_error};
use crate::scheduler::types::TaskRunStatus;
use crate::store::LifecycleStore;

pub const STRATEGY_LAST_AUDIT_RECORD: &str = "last_audit_record";
pub const STRATEGY_SERVICE_START: &str = "service_start";
pub const STRATEGY_OLDEST_OVERDUE_SUBSCRIPTION: &str = "oldest_overdue_subscription";
pub const STRATEGY_MIDNIGHT_DEFAULT: &str = "midnight_default";

/// Inputs shared by every strategy for one task.
#[derive(Debug, Clone)]
pub struct RecoveryContext {
    pub task_id: String,
    pub timezone: FixedOffset,
    pub now: DateTime<Utc>,
    /// Start marker written by the previous process, if any.
    pub previous_service_start: Option<DateTime<Utc>>,
}

/// One way of guessing when a task last ran. `None` means "no opinion" and
/// hands over to the next strategy.
#[async_trait]
pub trait LastRunStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn estimate(
        &self,
        context: &RecoveryContext,
    ) -> Result<Option<DateTime<Utc>>, LifecycleError>;
}

/// Newest `started`, `completed` or `recovered` record for the task.
pub struct LastAuditRecord {
    store: Arc<dyn LifecycleStore>,
}

impl LastAuditRecord {
    pub fn new(store: Arc<dyn LifecycleStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl LastRunStrategy for LastAuditRecord {
    fn name(&self) -> &'static str {
        STRATEGY_LAST_AUDIT_RECORD
    }

    async fn estimate(
        &self,
        context: &RecoveryContext,
    ) -> Result<Option<DateTime<Utc>>, LifecycleError> {
        let record = self
            .store
            .latest_task_record(
                &context.task_id,
                &[
                    TaskRunStatus::Started,
                    TaskRunStatus::Completed,
                    TaskRunStatus::Recovered,
                ],
            )
            .await
            .map_err(map_store_error)?;
        Ok(record.map(|record| record.at))
    }
}

pub struct ServiceStart;

#[async_trait]
impl LastRunStrategy for ServiceStart {
    fn name(&self) -> &'static str {
        STRATEGY_SERVICE_START
    }

    async fn estimate(
        &self,
        context: &RecoveryContext,
    ) -> Result<Option<DateTime<Utc>>, LifecycleError> {
        Ok(context.previous_service_start)
    }
}

/// Worst case for the expiration sweep: the last real check happened one day
/// before the oldest subscription that is still ACTIVE past its period end.
pub struct OldestOverdueSubscription {
    store: Arc<dyn LifecycleStore>,
    task_id: String,
}

impl OldestOverdueSubscription {
    pub fn new(store: Arc<dyn LifecycleStore>, task_id: impl Into<String>) -> Self {
        Self {
            store,
            task_id: task_id.into(),
        }
    }
}

#[async_trait]
impl LastRunStrategy for OldestOverdueSubscription {
    fn name(&self) -> &'static str {
        STRATEGY_OLDEST_OVERDUE_SUBSCRIPTION
    }

    async fn estimate(
        &self,
        context: &RecoveryContext,
    ) -> Result<Option<DateTime<Utc>>, LifecycleError> {
        if context.task_id != self.task_id {
            return Ok(None);
        }
        let oldest = self
            .store
            .oldest_due_period_end(context.now)
            .await
            .map_err(map_store_error)?;
        Ok(oldest.map(|period_end| period_end - Duration::days(1)))
    }
}

/// Last local midnight. Always has an answer, so it belongs at the end.
pub struct MidnightDefault;

#[async_trait]
impl LastRunStrategy for MidnightDefault {
    fn name(&self) -> &'static str {
        STRATEGY_MIDNIGHT_DEFAULT
    }

    async fn estimate(
        &self,
        context: &RecoveryContext,
    ) -> Result<Option<DateTime<Utc>>, LifecycleError> {
        Ok(last_midnight(context.now, context.timezone))
    }
}

pub(crate) fn last_midnight(now: DateTime<Utc>, timezone: FixedOffset) -> Option<DateTime<Utc>> {
    let local_date = now.with_timezone(&timezone).date_naive();
    timezone
        .from_local_datetime(&local_date.and_time(NaiveTime::MIN))
        .single()
        .map(|midnight| midnight.with_timezone(&Utc))
}

/// Audit record, previous service start, overdue subscriptions (expiration
/// sweep only), then midnight.
pub fn default_strategies(
    store: Arc<dyn LifecycleStore>,
    expiration_task_id: &str,
) -> Vec<Arc<dyn LastRunStrategy>> {
    vec![
        Arc::new(LastAuditRecord::new(store.clone())),
        Arc::new(ServiceStart),
        Arc::new(OldestOverdueSubscription::new(store, expiration_task_id)),
        Arc::new(MidnightDefault),
    ]
}
