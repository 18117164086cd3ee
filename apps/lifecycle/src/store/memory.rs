use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Mutex;

use crate::invitation::types::{QueuedRewardRow, QueuedRewardStatus};
use crate::ledger::types::{LedgerEntryRow, SOURCE_SUBSCRIPTION_GRANT, TokenType};
use crate::scheduler::types::{TaskExecutionRecord, TaskRunStatus};
use crate::store::{
    ActivationInput, ActivationResult, AllocationInput, ClearTokensInput, ConsumeRewardsInput,
    LedgerAppendInput, LifecycleStore, StoreError, TransitionInput, TransitionResult,
    clamp_compensation, new_record_id,
};
use crate::subscription::types::{ActivityRecord, PlanRow, SubscriptionRow, SubscriptionStatus};

#[derive(Default)]
pub(super) struct MemoryLifecycleStore {
    inner: Mutex<MemoryLifecycleInner>,
    #[cfg(test)]
    lease_outage: std::sync::atomic::AtomicBool,
}

impl MemoryLifecycleStore {
    /// Makes every lease acquisition fail as if the lease table were unreachable.
    #[cfg(test)]
    pub(super) fn fail_lease_acquisition(&self) {
        self.lease_outage
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn lease_available(&self) -> Result<(), StoreError> {
        if self.lease_outage.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StoreError::Db("task lease table unavailable".to_string()));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn lease_available(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Default)]
struct MemoryLifecycleInner {
    plans: HashMap<String, PlanRow>,
    subscriptions: HashMap<String, SubscriptionRow>,
    subscription_order: Vec<String>,
    balances: HashMap<String, (i64, i64)>,
    entries: Vec<LedgerEntryRow>,
    compensated: HashMap<String, String>,
    rewards: Vec<QueuedRewardRow>,
    task_records: Vec<TaskExecutionRecord>,
    leases: HashMap<String, (String, DateTime<Utc>)>,
    activity: Vec<ActivityRecord>,
}

impl MemoryLifecycleInner {
    fn append_entry(
        &mut self,
        input: LedgerAppendInput,
        compensates: Vec<String>,
    ) -> Result<LedgerEntryRow, StoreError> {
        if input.amount == 0 {
            return Err(StoreError::Conflict(
                "ledger entries must move a non-zero amount".to_string(),
            ));
        }
        let (balance, last_seq) = self
            .balances
            .get(&input.user_id)
            .copied()
            .unwrap_or((0, 0));
        let balance_after = balance
            .checked_add(input.amount)
            .ok_or_else(|| StoreError::Conflict("balance overflow".to_string()))?;
        if balance_after < 0 {
            return Err(StoreError::InsufficientBalance {
                available: balance,
                requested: input.amount.saturating_neg(),
            });
        }

        let entry = LedgerEntryRow {
            entry_id: new_record_id("led"),
            user_id: input.user_id.clone(),
            seq: last_seq + 1,
            token_type: input.token_type,
            amount: input.amount,
            balance_before: balance,
            balance_after,
            source: input.source,
            expires_at: input.expires_at,
            subscription_ref: input.subscription_ref,
            compensates,
            metadata: input.metadata,
            created_at: input.now,
        };
        for compensated_id in &entry.compensates {
            self.compensated
                .insert(compensated_id.clone(), entry.entry_id.clone());
        }
        self.balances
            .insert(input.user_id, (balance_after, entry.seq));
        self.entries.push(entry.clone());
        Ok(entry)
    }

    fn balance_of(&self, user_id: &str) -> i64 {
        self.balances.get(user_id).map_or(0, |(balance, _)| *balance)
    }

    fn clear_tokens(&mut self, input: ClearTokensInput) -> Result<Option<LedgerEntryRow>, StoreError> {
        let outstanding: Vec<(String, i64)> = self
            .entries
            .iter()
            .filter(|entry| {
                entry.user_id == input.user_id
                    && entry.token_type == TokenType::Subscription
                    && entry.amount > 0
                    && entry.subscription_ref.as_deref() == Some(input.subscription_id.as_str())
                    && !self.compensated.contains_key(&entry.entry_id)
            })
            .map(|entry| (entry.entry_id.clone(), entry.amount))
            .collect();
        if outstanding.is_empty() {
            return Ok(None);
        }

        let total: i64 = outstanding.iter().map(|(_, amount)| *amount).sum();
        let debit = clamp_compensation(total, self.balance_of(&input.user_id));
        let compensates: Vec<String> = outstanding.into_iter().map(|(id, _)| id).collect();
        if debit == 0 {
            // Nothing left to take back; still retire the credits.
            for id in compensates {
                self.compensated.insert(id, String::new());
            }
            return Ok(None);
        }

        let entry = self.append_entry(
            LedgerAppendInput {
                user_id: input.user_id,
                token_type: TokenType::Debit,
                amount: -debit,
                source: input.source,
                expires_at: None,
                subscription_ref: Some(input.subscription_id),
                metadata: json!({ "outstanding_tokens": total }),
                now: input.now,
            },
            compensates,
        )?;
        Ok(Some(entry))
    }

    fn transition(
        &mut self,
        input: TransitionInput,
    ) -> Result<Option<TransitionResult>, StoreError> {
        let Some(existing) = self.subscriptions.get(&input.subscription_id).cloned() else {
            return Err(StoreError::NotFound("subscription".to_string()));
        };
        if existing.status != SubscriptionStatus::Active {
            return Ok(None);
        }
        if input.to == SubscriptionStatus::Active {
            return Err(StoreError::Conflict(
                "transition target must be terminal".to_string(),
            ));
        }

        let mut updated = existing;
        updated.status = input.to;
        updated.next_allocation_at = None;
        updated.updated_at = input.now;
        self.subscriptions
            .insert(updated.subscription_id.clone(), updated.clone());

        let compensation = if input.clear_tokens {
            self.clear_tokens(ClearTokensInput {
                user_id: updated.user_id.clone(),
                subscription_id: updated.subscription_id.clone(),
                source: input.source,
                now: input.now,
            })?
        } else {
            None
        };

        Ok(Some(TransitionResult {
            subscription: updated,
            compensation,
        }))
    }

    fn activate(&mut self, input: ActivationInput) -> Result<ActivationResult, StoreError> {
        if self
            .subscriptions
            .contains_key(&input.subscription.subscription_id)
        {
            return Err(StoreError::Conflict(
                "subscription_id already exists".to_string(),
            ));
        }
        // Clearing a superseded grant only lowers the balance, so checking
        // against the current balance rejects every overflow before any write.
        if input.initial_grant > 0
            && self
                .balance_of(&input.subscription.user_id)
                .checked_add(input.initial_grant)
                .is_none()
        {
            return Err(StoreError::Conflict("balance overflow".to_string()));
        }

        let superseded = match input.supersede {
            Some(subscription_id) => self.transition(TransitionInput {
                subscription_id,
                to: SubscriptionStatus::Canceled,
                clear_tokens: true,
                source: "subscription_superseded".to_string(),
                now: input.now,
            })?,
            None => None,
        };

        let subscription = input.subscription;
        self.subscription_order
            .push(subscription.subscription_id.clone());
        self.subscriptions
            .insert(subscription.subscription_id.clone(), subscription.clone());

        let grant_entry = if input.initial_grant > 0 {
            Some(self.append_entry(
                LedgerAppendInput {
                    user_id: subscription.user_id.clone(),
                    token_type: TokenType::Subscription,
                    amount: input.initial_grant,
                    source: if input.grant_source.is_empty() {
                        SOURCE_SUBSCRIPTION_GRANT.to_string()
                    } else {
                        input.grant_source
                    },
                    expires_at: Some(subscription.period_end),
                    subscription_ref: Some(subscription.subscription_id.clone()),
                    metadata: json!({ "plan_id": subscription.plan_id }),
                    now: input.now,
                },
                Vec::new(),
            )?)
        } else {
            None
        };

        Ok(ActivationResult {
            subscription,
            grant_entry,
            superseded,
        })
    }
}

#[async_trait]
impl LifecycleStore for MemoryLifecycleStore {
    async fn upsert_plan(&self, plan: PlanRow) -> Result<PlanRow, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.plans.insert(plan.plan_id.clone(), plan.clone());
        Ok(plan)
    }

    async fn get_plan(&self, plan_id: &str) -> Result<Option<PlanRow>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.plans.get(plan_id).cloned())
    }

    async fn activate_subscription(
        &self,
        input: ActivationInput,
    ) -> Result<ActivationResult, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.activate(input)
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<SubscriptionRow>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.subscriptions.get(subscription_id).cloned())
    }

    async fn list_user_subscriptions(
        &self,
        user_id: &str,
    ) -> Result<Vec<SubscriptionRow>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .subscription_order
            .iter()
            .filter_map(|id| inner.subscriptions.get(id))
            .filter(|row| row.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_active_subscriptions(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<SubscriptionRow>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .subscription_order
            .iter()
            .filter_map(|id| inner.subscriptions.get(id))
            .filter(|row| row.user_id == user_id && row.is_active_at(now))
            .cloned()
            .collect())
    }

    async fn list_due_subscriptions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SubscriptionRow>, StoreError> {
        let inner = self.inner.lock().await;
        let mut due: Vec<SubscriptionRow> = inner
            .subscriptions
            .values()
            .filter(|row| row.is_due_at(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.period_end
                .cmp(&b.period_end)
                .then_with(|| a.subscription_id.cmp(&b.subscription_id))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn oldest_due_period_end(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .subscriptions
            .values()
            .filter(|row| row.is_due_at(now))
            .map(|row| row.period_end)
            .min())
    }

    async fn transition_subscription(
        &self,
        input: TransitionInput,
    ) -> Result<Option<TransitionResult>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.transition(input)
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionRow, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(row) = inner.subscriptions.get_mut(subscription_id) else {
            return Err(StoreError::NotFound("subscription".to_string()));
        };
        if row.status != SubscriptionStatus::Active {
            return Err(StoreError::Conflict("subscription is not active".to_string()));
        }
        row.cancel_at_period_end = cancel_at_period_end;
        row.updated_at = now;
        Ok(row.clone())
    }

    async fn list_allocation_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SubscriptionRow>, StoreError> {
        let inner = self.inner.lock().await;
        let mut due: Vec<SubscriptionRow> = inner
            .subscriptions
            .values()
            .filter(|row| {
                row.is_active_at(now)
                    && row
                        .next_allocation_at
                        .is_some_and(|next_allocation_at| next_allocation_at <= now)
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.next_allocation_at
                .cmp(&b.next_allocation_at)
                .then_with(|| a.subscription_id.cmp(&b.subscription_id))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn apply_monthly_allocation(
        &self,
        input: AllocationInput,
    ) -> Result<Option<LedgerEntryRow>, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(row) = inner.subscriptions.get(&input.subscription_id).cloned() else {
            return Err(StoreError::NotFound("subscription".to_string()));
        };
        if row.status != SubscriptionStatus::Active
            || row.next_allocation_at != Some(input.expected_next_allocation_at)
        {
            return Ok(None);
        }

        let entry = if input.amount > 0 {
            Some(inner.append_entry(
                LedgerAppendInput {
                    user_id: row.user_id.clone(),
                    token_type: TokenType::Subscription,
                    amount: input.amount,
                    source: input.source,
                    expires_at: Some(row.period_end),
                    subscription_ref: Some(row.subscription_id.clone()),
                    metadata: json!({
                        "plan_id": row.plan_id,
                        "allocation_index": row.allocations_granted + 1,
                    }),
                    now: input.now,
                },
                Vec::new(),
            )?)
        } else {
            None
        };

        let mut updated = row;
        updated.next_allocation_at = input.next_allocation_at;
        updated.allocations_granted += 1;
        updated.updated_at = input.now;
        inner
            .subscriptions
            .insert(updated.subscription_id.clone(), updated);
        Ok(entry)
    }

    async fn append_ledger_entry(
        &self,
        input: LedgerAppendInput,
    ) -> Result<LedgerEntryRow, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.append_entry(input, Vec::new())
    }

    async fn clear_subscription_tokens(
        &self,
        input: ClearTokensInput,
    ) -> Result<Option<LedgerEntryRow>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.clear_tokens(input)
    }

    async fn get_cached_balance(&self, user_id: &str) -> Result<i64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.balance_of(user_id))
    }

    async fn list_ledger_entries(&self, user_id: &str) -> Result<Vec<LedgerEntryRow>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .entries
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_expired_uncompensated(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LedgerEntryRow>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .entries
            .iter()
            .filter(|entry| {
                entry.token_type == TokenType::Subscription
                    && entry.amount > 0
                    && entry.expires_at.is_some_and(|expires_at| expires_at <= now)
                    && !inner.compensated.contains_key(&entry.entry_id)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn compensate_expired_entry(
        &self,
        entry_id: &str,
        source: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LedgerEntryRow>, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.compensated.contains_key(entry_id) {
            return Ok(None);
        }
        let Some(entry) = inner
            .entries
            .iter()
            .find(|entry| entry.entry_id == entry_id)
            .cloned()
        else {
            return Err(StoreError::NotFound("ledger entry".to_string()));
        };

        let debit = clamp_compensation(entry.amount, inner.balance_of(&entry.user_id));
        if debit == 0 {
            inner.compensated.insert(entry.entry_id, String::new());
            return Ok(None);
        }
        let compensation = inner.append_entry(
            LedgerAppendInput {
                user_id: entry.user_id.clone(),
                token_type: TokenType::Debit,
                amount: -debit,
                source: source.to_string(),
                expires_at: None,
                subscription_ref: entry.subscription_ref.clone(),
                metadata: json!({ "expired_entry_id": entry.entry_id }),
                now,
            },
            vec![entry.entry_id],
        )?;
        Ok(Some(compensation))
    }

    async fn list_expiring_entries(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntryRow>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .entries
            .iter()
            .filter(|entry| {
                entry.token_type == TokenType::Subscription
                    && entry.amount > 0
                    && entry
                        .expires_at
                        .is_some_and(|expires_at| expires_at > from && expires_at <= until)
                    && !inner.compensated.contains_key(&entry.entry_id)
            })
            .cloned()
            .collect())
    }

    async fn create_or_get_queued_reward(
        &self,
        reward: QueuedRewardRow,
    ) -> Result<(QueuedRewardRow, bool), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.rewards.iter().find(|row| {
            row.user_id == reward.user_id && row.invitation_id == reward.invitation_id
        }) {
            return Ok((existing.clone(), false));
        }
        inner.rewards.push(reward.clone());
        Ok((reward, true))
    }

    async fn list_pending_rewards(
        &self,
        user_id: &str,
    ) -> Result<Vec<QueuedRewardRow>, StoreError> {
        let inner = self.inner.lock().await;
        let mut pending: Vec<QueuedRewardRow> = inner
            .rewards
            .iter()
            .filter(|row| row.user_id == user_id && row.status == QueuedRewardStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.reward_id.cmp(&b.reward_id))
        });
        Ok(pending)
    }

    async fn list_user_rewards(&self, user_id: &str) -> Result<Vec<QueuedRewardRow>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rewards
            .iter()
            .filter(|row| row.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn consume_pending_rewards(
        &self,
        input: ConsumeRewardsInput,
    ) -> Result<ActivationResult, StoreError> {
        let mut inner = self.inner.lock().await;
        let wanted: HashSet<&str> = input.reward_ids.iter().map(String::as_str).collect();
        let pending_matches = inner
            .rewards
            .iter()
            .filter(|row| {
                wanted.contains(row.reward_id.as_str())
                    && row.user_id == input.user_id
                    && row.status == QueuedRewardStatus::Pending
            })
            .count();
        if pending_matches != wanted.len() {
            return Err(StoreError::Conflict(
                "queued rewards are no longer pending".to_string(),
            ));
        }

        let now = input.activation.now;
        let result = inner.activate(input.activation)?;
        let subscription_id = result.subscription.subscription_id.clone();
        for row in inner
            .rewards
            .iter_mut()
            .filter(|row| wanted.contains(row.reward_id.as_str()))
        {
            row.status = QueuedRewardStatus::Processed;
            row.processed_at = Some(now);
            row.subscription_id = Some(subscription_id.clone());
        }
        Ok(result)
    }

    async fn append_task_record(&self, record: TaskExecutionRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.task_records.push(record);
        Ok(())
    }

    async fn latest_task_record(
        &self,
        task_id: &str,
        statuses: &[TaskRunStatus],
    ) -> Result<Option<TaskExecutionRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .task_records
            .iter()
            .filter(|record| record.task_id == task_id && statuses.contains(&record.status))
            .max_by_key(|record| record.at)
            .cloned())
    }

    async fn list_task_records(
        &self,
        task_id: &str,
        limit: usize,
    ) -> Result<Vec<TaskExecutionRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .task_records
            .iter()
            .rev()
            .filter(|record| record.task_id == task_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn try_acquire_task_lease(
        &self,
        task_id: &str,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.lease_available()?;
        let mut inner = self.inner.lock().await;
        if let Some((holder, held_until)) = inner.leases.get(task_id)
            && holder != owner
            && *held_until > now
        {
            return Ok(false);
        }
        inner
            .leases
            .insert(task_id.to_string(), (owner.to_string(), expires_at));
        Ok(true)
    }

    async fn release_task_lease(&self, task_id: &str, owner: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner
            .leases
            .get(task_id)
            .is_some_and(|(holder, _)| holder == owner)
        {
            inner.leases.remove(task_id);
        }
        Ok(())
    }

    async fn append_activity(&self, record: ActivityRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.activity.push(record);
        Ok(())
    }

    async fn list_activity(&self, user_id: &str) -> Result<Vec<ActivityRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .activity
            .iter()
            .filter(|record| record.user_id == user_id)
            .cloned()
            .collect())
    }
}
