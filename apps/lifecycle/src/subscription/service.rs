use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};

use crate::clock::Clock;
use crate::config::LifecyclePolicyConfig;
use crate::error::{LifecycleError, map_store_error, required};
use crate::invitation::InvitationRewardQueue;
use crate::ledger::types::{SOURCE_MONTHLY_ALLOCATION, SOURCE_SUBSCRIPTION_CLEAR, SOURCE_SUBSCRIPTION_GRANT};
use crate::notify::{
    NotificationPriority, Notifier, TEMPLATE_DOWNGRADED_TO_FREE, TEMPLATE_SUBSCRIPTION_CANCELED,
    TEMPLATE_SUBSCRIPTION_EXPIRED,
};
use crate::store::{
    ActivationInput, AllocationInput, LifecycleStore, StoreError, TransitionInput, new_record_id,
};
use crate::subscription::types::{
    ACTIVITY_CANCEL_SCHEDULED, ACTIVITY_DOWNGRADED_TO_FREE, ACTIVITY_MONTHLY_ALLOCATION,
    ACTIVITY_SUBSCRIPTION_ACTIVATED, ACTIVITY_SUBSCRIPTION_CANCELED, ACTIVITY_SUBSCRIPTION_EXPIRED,
    ActivateSubscriptionRequest, ActivatedSubscription, ActivityRecord, AllocationFailure,
    FallbackAction, MONTHLY_ALLOCATION_REPORT_SCHEMA_V1, MonthlyAllocationReport, PlanRow,
    SUBSCRIPTION_SWEEP_REPORT_SCHEMA_V1, SubscriptionProvider, SubscriptionRow,
    SubscriptionStatus, SweepItemOutcome, SweepItemResult, SweepReport,
};

/// Active subscriptions of one user split by plan kind. A subscription whose
/// plan row is missing counts as paid.
#[derive(Debug, Clone, Default)]
pub(crate) struct ActiveSubscriptions {
    pub paid: Vec<SubscriptionRow>,
    pub free: Option<SubscriptionRow>,
}

pub(crate) async fn load_active_subscriptions(
    store: &dyn LifecycleStore,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<ActiveSubscriptions, StoreError> {
    let mut active = ActiveSubscriptions::default();
    for row in store.list_active_subscriptions(user_id, now).await? {
        let is_free = store
            .get_plan(&row.plan_id)
            .await?
            .is_some_and(|plan| plan.is_free);
        if is_free {
            if active.free.is_none() {
                active.free = Some(row);
            }
        } else {
            active.paid.push(row);
        }
    }
    Ok(active)
}

/// Longest period a single subscription may cover.
pub(crate) const MAX_DURATION_DAYS: i64 = 36_500;

pub(crate) fn validate_duration_days(days: i64) -> Result<i64, LifecycleError> {
    if !(1..=MAX_DURATION_DAYS).contains(&days) {
        return Err(LifecycleError::InvalidRequest(format!(
            "duration_days must be between 1 and {MAX_DURATION_DAYS}, got {days}"
        )));
    }
    Ok(days)
}

fn add_days(start: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>, LifecycleError> {
    Duration::try_days(days)
        .and_then(|delta| start.checked_add_signed(delta))
        .ok_or_else(|| {
            LifecycleError::InvalidRequest(format!("{days} days from {start} is out of range"))
        })
}

/// Builds an ACTIVE row for `plan`. Paid periods longer than one allocation
/// window get their next allocation scheduled; the first one is the initial grant.
pub(crate) fn new_subscription_row(
    user_id: &str,
    plan: &PlanRow,
    provider: SubscriptionProvider,
    start: DateTime<Utc>,
    days: i64,
    allocation_period_days: i64,
    metadata: Value,
) -> Result<SubscriptionRow, LifecycleError> {
    let period_end = add_days(start, validate_duration_days(days)?)?;
    let next_allocation_at = if !plan.is_free && days > allocation_period_days {
        Some(add_days(start, allocation_period_days)?)
    } else {
        None
    };
    Ok(SubscriptionRow {
        subscription_id: new_record_id("sub"),
        user_id: user_id.to_string(),
        plan_id: plan.plan_id.clone(),
        status: SubscriptionStatus::Active,
        period_start: start,
        period_end,
        provider,
        cancel_at_period_end: false,
        next_allocation_at,
        allocations_granted: 1,
        metadata,
        created_at: start,
        updated_at: start,
    })
}

/// Appends an activity row. Failures are logged and never fail the caller.
pub(crate) async fn record_activity(
    store: &dyn LifecycleStore,
    user_id: &str,
    kind: &str,
    subscription_id: Option<&str>,
    details: Value,
    now: DateTime<Utc>,
) {
    let record = ActivityRecord {
        activity_id: new_record_id("act"),
        user_id: user_id.to_string(),
        kind: kind.to_string(),
        subscription_id: subscription_id.map(str::to_string),
        details,
        created_at: now,
    };
    if let Err(error) = store.append_activity(record).await {
        tracing::warn!(
            user_id,
            kind,
            reason = %error,
            "activity record append failed"
        );
    }
}

#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn LifecycleStore>,
    clock: Arc<dyn Clock>,
    notifier: Notifier,
    rewards: InvitationRewardQueue,
    policy: LifecyclePolicyConfig,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn LifecycleStore>,
        clock: Arc<dyn Clock>,
        notifier: Notifier,
        policy: LifecyclePolicyConfig,
    ) -> Self {
        let rewards = InvitationRewardQueue::new(
            store.clone(),
            clock.clone(),
            notifier.clone(),
            policy.clone(),
        );
        Self {
            store,
            clock,
            notifier,
            rewards,
            policy,
        }
    }

    pub fn rewards(&self) -> &InvitationRewardQueue {
        &self.rewards
    }

    pub fn policy(&self) -> &LifecyclePolicyConfig {
        &self.policy
    }

    pub async fn upsert_plan(&self, plan: PlanRow) -> Result<PlanRow, LifecycleError> {
        let plan_id = required("plan_id", &plan.plan_id)?;
        if plan.monthly_tokens < 0 {
            return Err(LifecycleError::InvalidRequest(
                "monthly_tokens must not be negative".to_string(),
            ));
        }
        validate_duration_days(plan.duration_days)?;
        self.store
            .upsert_plan(PlanRow { plan_id, ..plan })
            .await
            .map_err(map_store_error)
    }

    /// Seeds the configured free plan if it does not exist yet.
    pub async fn ensure_free_plan(&self) -> Result<PlanRow, LifecycleError> {
        let plan_id = self.policy.free_plan_id.as_str();
        if let Some(existing) = self.store.get_plan(plan_id).await.map_err(map_store_error)? {
            if !existing.is_free {
                return Err(LifecycleError::Conflict(format!(
                    "plan {plan_id} exists but is not a free plan"
                )));
            }
            return Ok(existing);
        }

        let plan = self
            .upsert_plan(PlanRow {
                plan_id: plan_id.to_string(),
                name: "Free".to_string(),
                monthly_tokens: self.policy.free_plan_tokens,
                duration_days: self.policy.free_plan_validity_days,
                is_free: true,
                created_at: self.clock.now(),
            })
            .await?;
        tracing::info!(
            plan_id = %plan.plan_id,
            monthly_tokens = plan.monthly_tokens,
            "free plan seeded"
        );
        Ok(plan)
    }

    /// Starts a subscription and credits the first allocation in the same
    /// transaction. A paid plan replaces an active free subscription; a second
    /// paid subscription is rejected.
    pub async fn activate(
        &self,
        request: ActivateSubscriptionRequest,
    ) -> Result<ActivatedSubscription, LifecycleError> {
        let user_id = required("user_id", &request.user_id)?;
        let plan_id = required("plan_id", &request.plan_id)?;
        let plan = self.load_plan(&plan_id).await?;
        let days = validate_duration_days(request.duration_days.unwrap_or(plan.duration_days))?;

        let now = self.clock.now();
        let active = load_active_subscriptions(self.store.as_ref(), &user_id, now)
            .await
            .map_err(map_store_error)?;
        if !active.paid.is_empty() || (plan.is_free && active.free.is_some()) {
            return Err(LifecycleError::Conflict(format!(
                "user {user_id} already has an active subscription"
            )));
        }

        let subscription = new_subscription_row(
            &user_id,
            &plan,
            request.provider,
            now,
            days,
            self.policy.allocation_period_days,
            request.metadata,
        )?;
        let result = self
            .store
            .activate_subscription(ActivationInput {
                subscription,
                initial_grant: plan.monthly_tokens,
                grant_source: SOURCE_SUBSCRIPTION_GRANT.to_string(),
                supersede: active.free.map(|row| row.subscription_id),
                now,
            })
            .await
            .map_err(map_store_error)?;

        let granted_tokens = result.grant_entry.as_ref().map_or(0, |entry| entry.amount);
        let superseded_subscription_id = result
            .superseded
            .as_ref()
            .map(|transition| transition.subscription.subscription_id.clone());
        let subscription = result.subscription;

        record_activity(
            self.store.as_ref(),
            &user_id,
            ACTIVITY_SUBSCRIPTION_ACTIVATED,
            Some(&subscription.subscription_id),
            json!({
                "plan_id": plan.plan_id,
                "provider": subscription.provider.as_str(),
                "period_end": subscription.period_end,
                "granted_tokens": granted_tokens,
                "superseded_subscription_id": superseded_subscription_id,
            }),
            now,
        )
        .await;
        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.subscription_id,
            plan_id = %plan.plan_id,
            provider = subscription.provider.as_str(),
            granted_tokens,
            "subscription activated"
        );

        Ok(ActivatedSubscription {
            subscription,
            granted_tokens,
            superseded_subscription_id,
        })
    }

    /// Immediate cancellation ends the subscription now and clears its tokens.
    /// Otherwise the subscription is flagged and the sweep cancels it at period end.
    pub async fn cancel(
        &self,
        subscription_id: &str,
        immediate: bool,
    ) -> Result<SubscriptionRow, LifecycleError> {
        let subscription_id = required("subscription_id", subscription_id)?;
        let existing = self
            .store
            .get_subscription(&subscription_id)
            .await
            .map_err(map_store_error)?
            .ok_or_else(|| {
                LifecycleError::RecordNotFound(format!("subscription {subscription_id}"))
            })?;
        if existing.status != SubscriptionStatus::Active {
            return Err(LifecycleError::Conflict(format!(
                "subscription {subscription_id} is {}",
                existing.status.as_str()
            )));
        }
        let now = self.clock.now();

        if !immediate {
            let updated = self
                .store
                .set_cancel_at_period_end(&subscription_id, true, now)
                .await
                .map_err(map_store_error)?;
            record_activity(
                self.store.as_ref(),
                &updated.user_id,
                ACTIVITY_CANCEL_SCHEDULED,
                Some(&subscription_id),
                json!({ "period_end": updated.period_end }),
                now,
            )
            .await;
            tracing::info!(
                user_id = %updated.user_id,
                subscription_id = %subscription_id,
                period_end = %updated.period_end,
                "subscription cancellation scheduled"
            );
            return Ok(updated);
        }

        let plan = self
            .store
            .get_plan(&existing.plan_id)
            .await
            .map_err(map_store_error)?;
        let transition = self
            .store
            .transition_subscription(TransitionInput {
                subscription_id: subscription_id.clone(),
                to: SubscriptionStatus::Canceled,
                clear_tokens: true,
                source: SOURCE_SUBSCRIPTION_CLEAR.to_string(),
                now,
            })
            .await
            .map_err(map_store_error)?
            .ok_or_else(|| {
                LifecycleError::Conflict(format!("subscription {subscription_id} already ended"))
            })?;
        let tokens_cleared = transition.cleared_tokens();
        let canceled = transition.subscription;

        record_activity(
            self.store.as_ref(),
            &canceled.user_id,
            ACTIVITY_SUBSCRIPTION_CANCELED,
            Some(&subscription_id),
            json!({ "immediate": true, "tokens_cleared": tokens_cleared }),
            now,
        )
        .await;
        self.notifier.notify(
            &canceled.user_id,
            TEMPLATE_SUBSCRIPTION_CANCELED,
            json!({
                "subscription_id": subscription_id,
                "plan_id": canceled.plan_id,
                "tokens_cleared": tokens_cleared,
            }),
            NotificationPriority::High,
        );
        tracing::info!(
            user_id = %canceled.user_id,
            subscription_id = %subscription_id,
            tokens_cleared,
            "subscription canceled"
        );

        // Dropping the free plan itself does not trigger another free fallback.
        if !plan.is_some_and(|plan| plan.is_free) {
            let (fallback, fallback_subscription_id) =
                self.settle_zero_active(&canceled.user_id).await?;
            tracing::info!(
                user_id = %canceled.user_id,
                fallback = ?fallback,
                fallback_subscription_id = ?fallback_subscription_id,
                "post-cancel fallback settled"
            );
        }
        Ok(canceled)
    }

    /// Moves every ACTIVE subscription whose period ended to EXPIRED (or
    /// CANCELED when flagged), clears its tokens and arranges the fallback.
    /// Items fail independently and the batch always completes.
    pub async fn process_expired_subscriptions(&self) -> Result<SweepReport, LifecycleError> {
        let now = self.clock.now();
        let batch_size = self.policy.sweep_batch_size.max(1);
        let mut results = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        loop {
            let page = self
                .store
                .list_due_subscriptions(now, batch_size)
                .await
                .map_err(map_store_error)?;
            let page_len = page.len();
            let fresh: Vec<SubscriptionRow> = page
                .into_iter()
                .filter(|row| seen.insert(row.subscription_id.clone()))
                .collect();
            if fresh.is_empty() {
                break;
            }

            for subscription in fresh {
                if let Some(result) = self.expire_one(&subscription, now).await {
                    results.push(result);
                }
            }
            if page_len < batch_size {
                break;
            }
        }

        let report = SweepReport {
            schema: SUBSCRIPTION_SWEEP_REPORT_SCHEMA_V1.to_string(),
            ran_at: now,
            results,
        };
        tracing::info!(
            processed = report.results.len(),
            expired = report.expired_count(),
            errors = report.error_count(),
            "subscription expiration sweep finished"
        );
        Ok(report)
    }

    async fn expire_one(
        &self,
        subscription: &SubscriptionRow,
        now: DateTime<Utc>,
    ) -> Option<SweepItemResult> {
        let mut result = SweepItemResult {
            subscription_id: subscription.subscription_id.clone(),
            user_id: subscription.user_id.clone(),
            outcome: SweepItemOutcome::ExpiredAndDowngraded,
            final_status: None,
            tokens_cleared: 0,
            fallback: None,
            fallback_subscription_id: None,
            error: None,
        };

        match self.transition_due(subscription, now).await {
            Ok(Some((status, tokens_cleared))) => {
                result.final_status = Some(status);
                result.tokens_cleared = tokens_cleared;
            }
            Ok(None) => return None,
            Err(error) => {
                tracing::warn!(
                    subscription_id = %subscription.subscription_id,
                    user_id = %subscription.user_id,
                    reason = %error,
                    "subscription expiration failed"
                );
                result.outcome = SweepItemOutcome::Error;
                result.error = Some(error.to_string());
                return Some(result);
            }
        }

        match self.settle_zero_active(&subscription.user_id).await {
            Ok((fallback, fallback_subscription_id)) => {
                result.fallback = Some(fallback);
                result.fallback_subscription_id = fallback_subscription_id;
            }
            Err(error) => {
                tracing::error!(
                    subscription_id = %subscription.subscription_id,
                    user_id = %subscription.user_id,
                    reason = %error,
                    "fallback after expiration failed"
                );
                result.outcome = SweepItemOutcome::Error;
                result.error = Some(error.to_string());
            }
        }
        Some(result)
    }

    /// Returns `None` when the row already left ACTIVE.
    async fn transition_due(
        &self,
        subscription: &SubscriptionRow,
        now: DateTime<Utc>,
    ) -> Result<Option<(SubscriptionStatus, i64)>, LifecycleError> {
        let plan = self.load_plan(&subscription.plan_id).await?;
        let to = if subscription.cancel_at_period_end {
            SubscriptionStatus::Canceled
        } else {
            SubscriptionStatus::Expired
        };
        let Some(transition) = self
            .store
            .transition_subscription(TransitionInput {
                subscription_id: subscription.subscription_id.clone(),
                to,
                clear_tokens: true,
                source: SOURCE_SUBSCRIPTION_CLEAR.to_string(),
                now,
            })
            .await
            .map_err(map_store_error)?
        else {
            return Ok(None);
        };
        let tokens_cleared = transition.cleared_tokens();

        let (kind, template) = match to {
            SubscriptionStatus::Canceled => {
                (ACTIVITY_SUBSCRIPTION_CANCELED, TEMPLATE_SUBSCRIPTION_CANCELED)
            }
            _ => (ACTIVITY_SUBSCRIPTION_EXPIRED, TEMPLATE_SUBSCRIPTION_EXPIRED),
        };
        record_activity(
            self.store.as_ref(),
            &subscription.user_id,
            kind,
            Some(&subscription.subscription_id),
            json!({
                "plan_id": plan.plan_id,
                "period_end": subscription.period_end,
                "tokens_cleared": tokens_cleared,
            }),
            now,
        )
        .await;
        self.notifier.notify(
            &subscription.user_id,
            template,
            json!({
                "subscription_id": subscription.subscription_id,
                "plan_id": plan.plan_id,
                "plan_name": plan.name,
                "period_end": subscription.period_end,
                "tokens_cleared": tokens_cleared,
            }),
            NotificationPriority::High,
        );
        tracing::info!(
            user_id = %subscription.user_id,
            subscription_id = %subscription.subscription_id,
            status = to.as_str(),
            tokens_cleared,
            "subscription ended"
        );
        Ok(Some((to, tokens_cleared)))
    }

    /// Runs after a subscription ends. Queued invitation rewards take priority
    /// over the free plan; nothing happens while a paid subscription remains.
    async fn settle_zero_active(
        &self,
        user_id: &str,
    ) -> Result<(FallbackAction, Option<String>), LifecycleError> {
        let now = self.clock.now();
        let active = load_active_subscriptions(self.store.as_ref(), user_id, now)
            .await
            .map_err(map_store_error)?;
        if !active.paid.is_empty() {
            return Ok((FallbackAction::None, None));
        }

        if let Some(reconciled) = self.rewards.reconcile(user_id).await? {
            return Ok((
                FallbackAction::InvitationRewardActivated,
                Some(reconciled.subscription.subscription_id),
            ));
        }

        if let Some(free) = active.free {
            tracing::info!(
                user_id,
                subscription_id = %free.subscription_id,
                "free plan already active"
            );
            return Ok((FallbackAction::FreePlanReused, Some(free.subscription_id)));
        }

        let plan = self.ensure_free_plan().await?;
        let subscription = new_subscription_row(
            user_id,
            &plan,
            SubscriptionProvider::System,
            now,
            self.policy.free_plan_validity_days,
            self.policy.allocation_period_days,
            json!({ "fallback": true }),
        )?;
        let result = self
            .store
            .activate_subscription(ActivationInput {
                subscription,
                initial_grant: plan.monthly_tokens,
                grant_source: SOURCE_SUBSCRIPTION_GRANT.to_string(),
                supersede: None,
                now,
            })
            .await
            .map_err(map_store_error)?;
        let granted_tokens = result.grant_entry.as_ref().map_or(0, |entry| entry.amount);
        let subscription = result.subscription;

        record_activity(
            self.store.as_ref(),
            user_id,
            ACTIVITY_DOWNGRADED_TO_FREE,
            Some(&subscription.subscription_id),
            json!({ "plan_id": plan.plan_id, "granted_tokens": granted_tokens }),
            now,
        )
        .await;
        self.notifier.notify(
            user_id,
            TEMPLATE_DOWNGRADED_TO_FREE,
            json!({
                "subscription_id": subscription.subscription_id,
                "plan_name": plan.name,
                "granted_tokens": granted_tokens,
            }),
            NotificationPriority::Normal,
        );
        tracing::info!(
            user_id,
            subscription_id = %subscription.subscription_id,
            granted_tokens,
            "user downgraded to free plan"
        );
        Ok((
            FallbackAction::FreePlanCreated,
            Some(subscription.subscription_id),
        ))
    }

    /// Credits one allocation period to each active subscription whose next
    /// allocation is due. Per-subscription failures are collected.
    pub async fn allocate_monthly_tokens(
        &self,
    ) -> Result<MonthlyAllocationReport, LifecycleError> {
        let now = self.clock.now();
        let batch_size = self.policy.sweep_batch_size.max(1);
        let period = Duration::days(self.policy.allocation_period_days);
        let mut report = MonthlyAllocationReport {
            schema: MONTHLY_ALLOCATION_REPORT_SCHEMA_V1.to_string(),
            ran_at: now,
            allocated: 0,
            allocated_tokens: 0,
            skipped: 0,
            failures: Vec::new(),
        };
        let mut seen: HashSet<String> = HashSet::new();

        loop {
            let page = self
                .store
                .list_allocation_due(now, batch_size)
                .await
                .map_err(map_store_error)?;
            let page_len = page.len();
            let fresh: Vec<SubscriptionRow> = page
                .into_iter()
                .filter(|row| seen.insert(row.subscription_id.clone()))
                .collect();
            if fresh.is_empty() {
                break;
            }

            for subscription in fresh {
                let Some(expected) = subscription.next_allocation_at else {
                    report.skipped += 1;
                    continue;
                };
                match self.allocate_one(&subscription, expected, period, now).await {
                    Ok(Some(amount)) => {
                        report.allocated += 1;
                        report.allocated_tokens = report.allocated_tokens.saturating_add(amount);
                    }
                    Ok(None) => report.skipped += 1,
                    Err(error) => {
                        tracing::warn!(
                            subscription_id = %subscription.subscription_id,
                            user_id = %subscription.user_id,
                            reason = %error,
                            "monthly token allocation failed"
                        );
                        report.failures.push(AllocationFailure {
                            subscription_id: subscription.subscription_id,
                            error: error.to_string(),
                        });
                    }
                }
            }
            if page_len < batch_size {
                break;
            }
        }

        tracing::info!(
            allocated = report.allocated,
            allocated_tokens = report.allocated_tokens,
            skipped = report.skipped,
            failures = report.failures.len(),
            "monthly token allocation finished"
        );
        Ok(report)
    }

    async fn allocate_one(
        &self,
        subscription: &SubscriptionRow,
        expected: DateTime<Utc>,
        period: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, LifecycleError> {
        let plan = self.load_plan(&subscription.plan_id).await?;
        let following = expected + period;
        let next_allocation_at = (following < subscription.period_end).then_some(following);
        let entry = self
            .store
            .apply_monthly_allocation(AllocationInput {
                subscription_id: subscription.subscription_id.clone(),
                amount: plan.monthly_tokens,
                expected_next_allocation_at: expected,
                next_allocation_at,
                source: SOURCE_MONTHLY_ALLOCATION.to_string(),
                now,
            })
            .await
            .map_err(map_store_error)?;
        let Some(entry) = entry else {
            return Ok(None);
        };

        record_activity(
            self.store.as_ref(),
            &subscription.user_id,
            ACTIVITY_MONTHLY_ALLOCATION,
            Some(&subscription.subscription_id),
            json!({
                "plan_id": plan.plan_id,
                "amount": entry.amount,
                "next_allocation_at": next_allocation_at,
            }),
            now,
        )
        .await;
        Ok(Some(entry.amount))
    }

    pub async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<SubscriptionRow, LifecycleError> {
        self.store
            .get_subscription(subscription_id)
            .await
            .map_err(map_store_error)?
            .ok_or_else(|| LifecycleError::RecordNotFound(format!("subscription {subscription_id}")))
    }

    pub async fn list_user_subscriptions(
        &self,
        user_id: &str,
    ) -> Result<Vec<SubscriptionRow>, LifecycleError> {
        let user_id = required("user_id", user_id)?;
        self.store
            .list_user_subscriptions(&user_id)
            .await
            .map_err(map_store_error)
    }

    pub async fn list_activity(&self, user_id: &str) -> Result<Vec<ActivityRecord>, LifecycleError> {
        let user_id = required("user_id", user_id)?;
        self.store.list_activity(&user_id).await.map_err(map_store_error)
    }

    async fn load_plan(&self, plan_id: &str) -> Result<PlanRow, LifecycleError> {
        self.store
            .get_plan(plan_id)
            .await
            .map_err(map_store_error)?
            .ok_or_else(|| LifecycleError::RecordNotFound(format!("plan {plan_id}")))
    }
}
