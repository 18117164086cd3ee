use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::db::LifecycleDb;
use crate::invitation::types::QueuedRewardRow;
use crate::ledger::types::{LedgerEntryRow, TokenType};
use crate::scheduler::types::{TaskExecutionRecord, TaskRunStatus};
use crate::subscription::types::{ActivityRecord, PlanRow, SubscriptionRow, SubscriptionStatus};

mod memory;
mod postgres;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance { available: i64, requested: i64 },
    #[error("db error: {0}")]
    Db(String),
}

/// One ledger mutation. Positive `amount` credits, negative debits.
///
/// The repository rejects any append that would take the cached balance below
/// zero, and writes the entry and the balance in one transaction.
#[derive(Debug, Clone)]
pub struct LedgerAppendInput {
    pub user_id: String,
    pub token_type: TokenType,
    pub amount: i64,
    pub source: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub subscription_ref: Option<String>,
    pub metadata: Value,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ClearTokensInput {
    pub user_id: String,
    pub subscription_id: String,
    pub source: String,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TransitionInput {
    pub subscription_id: String,
    pub to: SubscriptionStatus,
    /// Compensate the subscription's tokens inside the same transaction.
    pub clear_tokens: bool,
    pub source: String,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TransitionResult {
    pub subscription: SubscriptionRow,
    pub compensation: Option<LedgerEntryRow>,
}

impl TransitionResult {
    pub fn cleared_tokens(&self) -> i64 {
        self.compensation
            .as_ref()
            .map_or(0, |entry| entry.amount.saturating_neg())
    }
}

#[derive(Debug, Clone)]
pub struct ActivationInput {
    pub subscription: SubscriptionRow,
    /// Tokens credited as SUBSCRIPTION, expiring at the period end.
    pub initial_grant: i64,
    pub grant_source: String,
    /// ACTIVE subscription to cancel (with token clear) before inserting.
    pub supersede: Option<String>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ActivationResult {
    pub subscription: SubscriptionRow,
    pub grant_entry: Option<LedgerEntryRow>,
    pub superseded: Option<TransitionResult>,
}

#[derive(Debug, Clone)]
pub struct ConsumeRewardsInput {
    pub user_id: String,
    pub reward_ids: Vec<String>,
    pub activation: ActivationInput,
}

#[derive(Debug, Clone)]
pub struct AllocationInput {
    pub subscription_id: String,
    pub amount: i64,
    /// Optimistic guard: the bookkeeping value the caller read.
    pub expected_next_allocation_at: DateTime<Utc>,
    pub next_allocation_at: Option<DateTime<Utc>>,
    pub source: String,
    pub now: DateTime<Utc>,
}

#[async_trait]
pub trait LifecycleStore: Send + Sync {
    async fn upsert_plan(&self, plan: PlanRow) -> Result<PlanRow, StoreError>;

    async fn get_plan(&self, plan_id: &str) -> Result<Option<PlanRow>, StoreError>;

    async fn activate_subscription(
        &self,
        input: ActivationInput,
    ) -> Result<ActivationResult, StoreError>;

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<SubscriptionRow>, StoreError>;

    async fn list_user_subscriptions(
        &self,
        user_id: &str,
    ) -> Result<Vec<SubscriptionRow>, StoreError>;

    /// ACTIVE subscriptions with `period_end > now`.
    async fn list_active_subscriptions(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<SubscriptionRow>, StoreError>;

    /// ACTIVE subscriptions with `period_end <= now`, oldest period end first.
    async fn list_due_subscriptions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SubscriptionRow>, StoreError>;

    async fn oldest_due_period_end(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Moves an ACTIVE subscription to a terminal status. Returns `None` when the
    /// subscription already left ACTIVE, which makes repeated sweeps no-ops.
    async fn transition_subscription(
        &self,
        input: TransitionInput,
    ) -> Result<Option<TransitionResult>, StoreError>;

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionRow, StoreError>;

    async fn list_allocation_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SubscriptionRow>, StoreError>;

    /// Credits one allocation period and advances the bookkeeping. Returns `None`
    /// if the bookkeeping moved since the caller read it.
    async fn apply_monthly_allocation(
        &self,
        input: AllocationInput,
    ) -> Result<Option<LedgerEntryRow>, StoreError>;

    async fn append_ledger_entry(
        &self,
        input: LedgerAppendInput,
    ) -> Result<LedgerEntryRow, StoreError>;

    /// Appends one debit covering every uncompensated SUBSCRIPTION credit tagged
    /// with the subscription. Returns `None` when nothing is left to clear.
    async fn clear_subscription_tokens(
        &self,
        input: ClearTokensInput,
    ) -> Result<Option<LedgerEntryRow>, StoreError>;

    async fn get_cached_balance(&self, user_id: &str) -> Result<i64, StoreError>;

    /// All entries for a user in creation order.
    async fn list_ledger_entries(&self, user_id: &str) -> Result<Vec<LedgerEntryRow>, StoreError>;

    async fn list_expired_uncompensated(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LedgerEntryRow>, StoreError>;

    /// Returns `None` if the entry was already compensated.
    async fn compensate_expired_entry(
        &self,
        entry_id: &str,
        source: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LedgerEntryRow>, StoreError>;

    /// Uncompensated SUBSCRIPTION credits with `from < expires_at <= until`.
    async fn list_expiring_entries(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntryRow>, StoreError>;

    /// Idempotent on `(user_id, invitation_id)`. The flag is true on insert.
    async fn create_or_get_queued_reward(
        &self,
        reward: QueuedRewardRow,
    ) -> Result<(QueuedRewardRow, bool), StoreError>;

    async fn list_pending_rewards(&self, user_id: &str)
    -> Result<Vec<QueuedRewardRow>, StoreError>;

    async fn list_user_rewards(&self, user_id: &str) -> Result<Vec<QueuedRewardRow>, StoreError>;

    /// Marks every listed reward PROCESSED and activates the merged subscription
    /// in one transaction. Fails with `Conflict` if any reward is not PENDING.
    async fn consume_pending_rewards(
        &self,
        input: ConsumeRewardsInput,
    ) -> Result<ActivationResult, StoreError>;

    async fn append_task_record(&self, record: TaskExecutionRecord) -> Result<(), StoreError>;

    async fn latest_task_record(
        &self,
        task_id: &str,
        statuses: &[TaskRunStatus],
    ) -> Result<Option<TaskExecutionRecord>, StoreError>;

    /// Newest first.
    async fn list_task_records(
        &self,
        task_id: &str,
        limit: usize,
    ) -> Result<Vec<TaskExecutionRecord>, StoreError>;

    async fn try_acquire_task_lease(
        &self,
        task_id: &str,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn release_task_lease(&self, task_id: &str, owner: &str) -> Result<(), StoreError>;

    async fn append_activity(&self, record: ActivityRecord) -> Result<(), StoreError>;

    async fn list_activity(&self, user_id: &str) -> Result<Vec<ActivityRecord>, StoreError>;
}

pub fn memory() -> Arc<dyn LifecycleStore> {
    Arc::new(memory::MemoryLifecycleStore::default())
}

/// In-memory store whose task lease acquisition always fails.
#[cfg(test)]
pub(crate) fn memory_without_leases() -> Arc<dyn LifecycleStore> {
    let store = memory::MemoryLifecycleStore::default();
    store.fail_lease_acquisition();
    Arc::new(store)
}

pub fn postgres(db: Arc<LifecycleDb>) -> Arc<dyn LifecycleStore> {
    Arc::new(postgres::PostgresLifecycleStore::new(db))
}

pub fn new_record_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::now_v7().simple())
}

/// Amount a compensating debit may take without driving the balance negative.
pub(crate) fn clamp_compensation(outstanding: i64, balance: i64) -> i64 {
    outstanding.min(balance.max(0)).max(0)
}
