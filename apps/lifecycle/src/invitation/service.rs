use std::sync::Arc;

use serde_json::{Value, json};

use crate::clock::Clock;
use crate::config::LifecyclePolicyConfig;
use crate::error::{LifecycleError, map_store_error, required};
use crate::invitation::types::{
    ACTIVITY_REWARD_GRANTED, ACTIVITY_REWARD_QUEUED, ACTIVITY_REWARDS_RECONCILED, EnqueueOutcome,
    QueuedRewardRow, QueuedRewardStatus, ReconciledRewards,
};
use crate::ledger::types::SOURCE_SUBSCRIPTION_GRANT;
use crate::notify::{
    NotificationPriority, Notifier, TEMPLATE_REWARD_ACTIVATED, TEMPLATE_REWARD_QUEUED,
};
use crate::store::{ActivationInput, ConsumeRewardsInput, LifecycleStore, new_record_id};
use crate::subscription::service::{
    load_active_subscriptions, new_subscription_row, record_activity,
};
use crate::subscription::types::{PlanRow, SubscriptionProvider};

/// Deferred subscription grants for invitation recipients who already pay.
#[derive(Clone)]
pub struct InvitationRewardQueue {
    store: Arc<dyn LifecycleStore>,
    clock: Arc<dyn Clock>,
    notifier: Notifier,
    policy: LifecyclePolicyConfig,
}

impl InvitationRewardQueue {
    pub fn new(
        store: Arc<dyn LifecycleStore>,
        clock: Arc<dyn Clock>,
        notifier: Notifier,
        policy: LifecyclePolicyConfig,
    ) -> Self {
        Self {
            store,
            clock,
            notifier,
            policy,
        }
    }

    /// Grants the reward right away when the user has no active paid
    /// subscription, otherwise parks it as a PENDING reward. Repeated calls for
    /// the same invitation return the earlier outcome.
    pub async fn enqueue_or_grant(
        &self,
        user_id: &str,
        plan_id: &str,
        invitation_id: &str,
    ) -> Result<EnqueueOutcome, LifecycleError> {
        let user_id = required("user_id", user_id)?;
        let plan_id = required("plan_id", plan_id)?;
        let invitation_id = required("invitation_id", invitation_id)?;
        let plan = self.load_plan(&plan_id).await?;

        if let Some(previous) = self.previous_outcome(&user_id, &invitation_id).await? {
            tracing::info!(
                user_id = %user_id,
                invitation_id = %invitation_id,
                outcome = previous.as_str(),
                "invitation reward already handled"
            );
            return Ok(previous);
        }

        let now = self.clock.now();
        let active = load_active_subscriptions(self.store.as_ref(), &user_id, now)
            .await
            .map_err(map_store_error)?;

        if active.paid.is_empty() {
            let subscription = new_subscription_row(
                &user_id,
                &plan,
                SubscriptionProvider::Invitation,
                now,
                self.policy.invitation_reward_days,
                self.policy.allocation_period_days,
                json!({ "invitation_id": invitation_id }),
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
            let subscription = result.subscription;

            record_activity(
                self.store.as_ref(),
                &user_id,
                ACTIVITY_REWARD_GRANTED,
                Some(&subscription.subscription_id),
                json!({
                    "invitation_id": invitation_id,
                    "plan_id": plan.plan_id,
                    "days": self.policy.invitation_reward_days,
                    "granted_tokens": plan.monthly_tokens,
                }),
                now,
            )
            .await;
            self.notifier.notify(
                &user_id,
                TEMPLATE_REWARD_ACTIVATED,
                json!({
                    "subscription_id": subscription.subscription_id,
                    "plan_id": plan.plan_id,
                    "plan_name": plan.name,
                    "period_end": subscription.period_end,
                }),
                NotificationPriority::Normal,
            );
            tracing::info!(
                user_id = %user_id,
                invitation_id = %invitation_id,
                subscription_id = %subscription.subscription_id,
                "invitation reward granted immediately"
            );
            return Ok(EnqueueOutcome::Granted { subscription });
        }

        let (reward, inserted) = self
            .store
            .create_or_get_queued_reward(QueuedRewardRow {
                reward_id: new_record_id("rwd"),
                user_id: user_id.clone(),
                plan_id: plan.plan_id.clone(),
                invitation_id: invitation_id.clone(),
                days_to_add: self.policy.invitation_reward_days,
                status: QueuedRewardStatus::Pending,
                created_at: now,
                processed_at: None,
                subscription_id: None,
            })
            .await
            .map_err(map_store_error)?;

        if inserted {
            record_activity(
                self.store.as_ref(),
                &user_id,
                ACTIVITY_REWARD_QUEUED,
                None,
                json!({
                    "reward_id": reward.reward_id,
                    "invitation_id": invitation_id,
                    "plan_id": plan.plan_id,
                    "days_to_add": reward.days_to_add,
                }),
                now,
            )
            .await;
            self.notifier.notify(
                &user_id,
                TEMPLATE_REWARD_QUEUED,
                json!({
                    "reward_id": reward.reward_id,
                    "plan_name": plan.name,
                    "days_to_add": reward.days_to_add,
                }),
                NotificationPriority::Low,
            );
            tracing::info!(
                user_id = %user_id,
                invitation_id = %invitation_id,
                reward_id = %reward.reward_id,
                active_paid = active.paid.len(),
                "invitation reward queued behind active subscription"
            );
        }
        Ok(EnqueueOutcome::Queued { reward })
    }

    /// Merges every PENDING reward into one subscription. Callers invoke this
    /// when the user's last active paid subscription ends; it does nothing while
    /// a paid subscription is still active or when nothing is pending.
    pub async fn reconcile(
        &self,
        user_id: &str,
    ) -> Result<Option<ReconciledRewards>, LifecycleError> {
        let user_id = required("user_id", user_id)?;
        let pending = self
            .store
            .list_pending_rewards(&user_id)
            .await
            .map_err(map_store_error)?;
        let Some(first) = pending.first() else {
            return Ok(None);
        };

        let now = self.clock.now();
        let active = load_active_subscriptions(self.store.as_ref(), &user_id, now)
            .await
            .map_err(map_store_error)?;
        if !active.paid.is_empty() {
            tracing::debug!(
                user_id = %user_id,
                pending = pending.len(),
                "queued rewards wait for the active subscription to end"
            );
            return Ok(None);
        }

        let plan = self.load_plan(&first.plan_id).await?;
        let total_days = pending
            .iter()
            .fold(0_i64, |total, reward| total.saturating_add(reward.days_to_add));
        if total_days <= 0 {
            return Err(LifecycleError::InvalidRequest(
                "queued rewards add no days".to_string(),
            ));
        }
        let reward_ids: Vec<String> = pending.iter().map(|row| row.reward_id.clone()).collect();
        let invitation_ids: Vec<&str> = pending
            .iter()
            .map(|row| row.invitation_id.as_str())
            .collect();

        let subscription = new_subscription_row(
            &user_id,
            &plan,
            SubscriptionProvider::Invitation,
            now,
            total_days,
            self.policy.allocation_period_days,
            json!({
                "reward_ids": reward_ids,
                "invitation_ids": invitation_ids,
            }),
        )?;
        let result = self
            .store
            .consume_pending_rewards(ConsumeRewardsInput {
                user_id: user_id.clone(),
                reward_ids: reward_ids.clone(),
                activation: ActivationInput {
                    subscription,
                    initial_grant: plan.monthly_tokens,
                    grant_source: SOURCE_SUBSCRIPTION_GRANT.to_string(),
                    supersede: active.free.map(|row| row.subscription_id),
                    now,
                },
            })
            .await
            .map_err(map_store_error)?;
        let granted_tokens = result
            .grant_entry
            .as_ref()
            .map_or(0, |entry| entry.amount);
        let subscription = result.subscription;

        record_activity(
            self.store.as_ref(),
            &user_id,
            ACTIVITY_REWARDS_RECONCILED,
            Some(&subscription.subscription_id),
            json!({
                "reward_ids": reward_ids,
                "total_days": total_days,
                "plan_id": plan.plan_id,
                "granted_tokens": granted_tokens,
            }),
            now,
        )
        .await;
        self.notifier.notify(
            &user_id,
            TEMPLATE_REWARD_ACTIVATED,
            json!({
                "subscription_id": subscription.subscription_id,
                "plan_id": plan.plan_id,
                "plan_name": plan.name,
                "period_end": subscription.period_end,
                "merged_rewards": reward_ids.len(),
            }),
            NotificationPriority::Normal,
        );
        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.subscription_id,
            rewards = reward_ids.len(),
            total_days,
            "queued invitation rewards reconciled"
        );

        Ok(Some(ReconciledRewards {
            subscription,
            reward_ids,
            total_days,
            granted_tokens,
        }))
    }

    pub async fn list_rewards(&self, user_id: &str) -> Result<Vec<QueuedRewardRow>, LifecycleError> {
        let user_id = required("user_id", user_id)?;
        self.store
            .list_user_rewards(&user_id)
            .await
            .map_err(map_store_error)
    }

    async fn load_plan(&self, plan_id: &str) -> Result<PlanRow, LifecycleError> {
        self.store
            .get_plan(plan_id)
            .await
            .map_err(map_store_error)?
            .ok_or_else(|| LifecycleError::RecordNotFound(format!("plan {plan_id}")))
    }

    async fn previous_outcome(
        &self,
        user_id: &str,
        invitation_id: &str,
    ) -> Result<Option<EnqueueOutcome>, LifecycleError> {
        let queued = self
            .store
            .list_user_rewards(user_id)
            .await
            .map_err(map_store_error)?
            .into_iter()
            .find(|reward| reward.invitation_id == invitation_id);
        if let Some(reward) = queued {
            return Ok(Some(EnqueueOutcome::Queued { reward }));
        }

        let granted = self
            .store
            .list_user_subscriptions(user_id)
            .await
            .map_err(map_store_error)?
            .into_iter()
            .find(|row| {
                row.provider == SubscriptionProvider::Invitation
                    && row.metadata.get("invitation_id").and_then(Value::as_str)
                        == Some(invitation_id)
            });
        Ok(granted.map(|subscription| EnqueueOutcome::Granted { subscription }))
    }
}
