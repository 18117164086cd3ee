use anyhow::{Result, anyhow};
use chrono::Duration;
use serde_json::json;

use crate::error::LifecycleError;
use crate::invitation::types::{EnqueueOutcome, QueuedRewardStatus};
use crate::ledger::types::TokenType;
use crate::notify::testing::drain;
use crate::notify::{TEMPLATE_DOWNGRADED_TO_FREE, TEMPLATE_SUBSCRIPTION_EXPIRED};
use crate::store::ActivationInput;
use crate::subscription::service::new_subscription_row;
use crate::subscription::types::{
    ACTIVITY_DOWNGRADED_TO_FREE, ACTIVITY_SUBSCRIPTION_EXPIRED, FallbackAction,
    SubscriptionProvider, SubscriptionStatus, SweepItemOutcome,
};
use crate::testing::{Fixture, at, plan};

#[tokio::test]
async fn expired_subscription_clears_tokens_and_falls_back_to_free() -> Result<()> {
    let fixture = Fixture::new("2023-12-11T00:00:00Z").await?;
    let pro = fixture.activate("user-u", "pro", Some(30)).await?;
    assert_eq!(pro.subscription.period_end, at("2024-01-10T00:00:00Z"));
    assert_eq!(pro.granted_tokens, 10_000);
    assert_eq!(fixture.balance("user-u").await?, 10_000);

    fixture.clock.set(at("2024-01-11T00:00:00Z"));
    let report = fixture.subscriptions.process_expired_subscriptions().await?;
    drain().await;

    assert_eq!(report.results.len(), 1);
    let item = &report.results[0];
    assert_eq!(item.subscription_id, pro.subscription.subscription_id);
    assert_eq!(item.outcome, SweepItemOutcome::ExpiredAndDowngraded);
    assert_eq!(item.final_status, Some(SubscriptionStatus::Expired));
    assert_eq!(item.tokens_cleared, 10_000);
    assert_eq!(item.fallback, Some(FallbackAction::FreePlanCreated));

    let expired = fixture
        .subscriptions
        .get_subscription(&pro.subscription.subscription_id)
        .await?;
    assert_eq!(expired.status, SubscriptionStatus::Expired);

    let free_id = item
        .fallback_subscription_id
        .clone()
        .ok_or_else(|| anyhow!("free fallback id missing"))?;
    let free = fixture.subscriptions.get_subscription(&free_id).await?;
    assert_eq!(free.plan_id, "free");
    assert_eq!(free.status, SubscriptionStatus::Active);
    assert_eq!(free.provider, SubscriptionProvider::System);
    assert_eq!(free.period_end, at("2024-01-11T00:00:00Z") + Duration::days(36_500));

    let balance = fixture.ledger.get_balance("user-u").await?;
    assert_eq!(balance.total, 1_000);
    assert_eq!(balance.breakdown.subscription, 1_000);
    let chain = fixture.ledger.verify_chain("user-u").await?;
    assert!(chain.consistent);
    assert_eq!(chain.entry_count, 3);

    let templates = fixture.sender.templates();
    assert!(templates.contains(&TEMPLATE_SUBSCRIPTION_EXPIRED.to_string()));
    assert!(templates.contains(&TEMPLATE_DOWNGRADED_TO_FREE.to_string()));
    let kinds: Vec<String> = fixture
        .subscriptions
        .list_activity("user-u")
        .await?
        .into_iter()
        .map(|record| record.kind)
        .collect();
    assert!(kinds.contains(&ACTIVITY_SUBSCRIPTION_EXPIRED.to_string()));
    assert!(kinds.contains(&ACTIVITY_DOWNGRADED_TO_FREE.to_string()));
    Ok(())
}

#[tokio::test]
async fn pending_invitation_reward_takes_over_after_expiry() -> Result<()> {
    let fixture = Fixture::new("2023-12-11T00:00:00Z").await?;
    fixture.activate("user-u", "pro", Some(30)).await?;
    let queued = fixture
        .subscriptions
        .rewards()
        .enqueue_or_grant("user-u", "pro", "inv-1")
        .await?;
    assert!(matches!(queued, EnqueueOutcome::Queued { .. }));

    fixture.clock.set(at("2024-01-11T00:00:00Z"));
    let report = fixture.subscriptions.process_expired_subscriptions().await?;
    let item = &report.results[0];
    assert_eq!(item.tokens_cleared, 10_000);
    assert_eq!(item.fallback, Some(FallbackAction::InvitationRewardActivated));

    let reward_sub_id = item
        .fallback_subscription_id
        .clone()
        .ok_or_else(|| anyhow!("reward subscription id missing"))?;
    let reward_sub = fixture.subscriptions.get_subscription(&reward_sub_id).await?;
    assert_eq!(reward_sub.provider, SubscriptionProvider::Invitation);
    assert_eq!(reward_sub.period_end, at("2024-02-10T00:00:00Z"));
    assert_eq!(fixture.balance("user-u").await?, 10_000);

    let rewards = fixture.subscriptions.rewards().list_rewards("user-u").await?;
    assert_eq!(rewards.len(), 1);
    assert_eq!(rewards[0].status, QueuedRewardStatus::Processed);
    assert_eq!(rewards[0].subscription_id.as_deref(), Some(reward_sub_id.as_str()));

    // No free plan was created next to the reward subscription.
    let subscriptions = fixture.subscriptions.list_user_subscriptions("user-u").await?;
    assert_eq!(subscriptions.len(), 2);
    assert!(subscriptions.iter().all(|row| row.plan_id != "free"));
    Ok(())
}

#[tokio::test]
async fn second_sweep_with_same_clock_is_a_no_op() -> Result<()> {
    let fixture = Fixture::new("2023-12-11T00:00:00Z").await?;
    fixture.activate("user-a", "pro", Some(30)).await?;
    fixture.activate("user-b", "pro", Some(30)).await?;

    fixture.clock.set(at("2024-01-11T00:00:00Z"));
    let first = fixture.subscriptions.process_expired_subscriptions().await?;
    assert_eq!(first.expired_count(), 2);
    let entries_after_first = fixture.store.list_ledger_entries("user-a").await?.len();

    let second = fixture.subscriptions.process_expired_subscriptions().await?;
    assert!(second.results.is_empty());
    assert_eq!(
        fixture.store.list_ledger_entries("user-a").await?.len(),
        entries_after_first
    );

    let swept = fixture.ledger.sweep_expired().await?;
    assert_eq!(swept.compensated, 0);
    Ok(())
}

#[tokio::test]
async fn one_bad_row_does_not_abort_the_batch() -> Result<()> {
    let fixture = Fixture::new("2023-12-11T00:00:00Z").await?;
    fixture.activate("user-a", "pro", Some(30)).await?;

    let ghost_plan = plan("ghost", 100, 30);
    let ghost = new_subscription_row(
        "user-b",
        &ghost_plan,
        SubscriptionProvider::Trial,
        at("2023-12-01T00:00:00Z"),
        30,
        30,
        json!({}),
    )?;
    let ghost_id = ghost.subscription_id.clone();
    fixture
        .store
        .activate_subscription(ActivationInput {
            subscription: ghost,
            initial_grant: 0,
            grant_source: String::new(),
            supersede: None,
            now: at("2023-12-01T00:00:00Z"),
        })
        .await?;

    fixture.clock.set(at("2024-01-11T00:00:00Z"));
    let report = fixture.subscriptions.process_expired_subscriptions().await?;
    assert_eq!(report.results.len(), 2);
    assert_eq!(report.expired_count(), 1);
    assert_eq!(report.error_count(), 1);

    let failed = report
        .results
        .iter()
        .find(|item| item.subscription_id == ghost_id)
        .ok_or_else(|| anyhow!("ghost subscription missing from report"))?;
    assert_eq!(failed.outcome, SweepItemOutcome::Error);
    assert!(failed.error.as_deref().is_some_and(|error| error.contains("ghost")));
    let still_active = fixture.subscriptions.get_subscription(&ghost_id).await?;
    assert_eq!(still_active.status, SubscriptionStatus::Active);
    Ok(())
}

#[tokio::test]
async fn clear_never_drives_the_balance_negative() -> Result<()> {
    let fixture = Fixture::new("2023-12-11T00:00:00Z").await?;
    fixture.activate("user-u", "pro", Some(30)).await?;
    fixture
        .ledger
        .debit("user-u", 9_500, "usage", json!({}))
        .await?;

    fixture.clock.set(at("2024-01-11T00:00:00Z"));
    let report = fixture.subscriptions.process_expired_subscriptions().await?;
    assert_eq!(report.results[0].tokens_cleared, 500);
    assert_eq!(fixture.balance("user-u").await?, 1_000);
    assert!(fixture.ledger.verify_chain("user-u").await?.consistent);
    Ok(())
}

#[tokio::test]
async fn cancel_at_period_end_ends_as_canceled() -> Result<()> {
    let fixture = Fixture::new("2023-12-11T00:00:00Z").await?;
    let pro = fixture.activate("user-u", "pro", Some(30)).await?;
    let id = pro.subscription.subscription_id;

    let flagged = fixture.subscriptions.cancel(&id, false).await?;
    assert!(flagged.cancel_at_period_end);
    assert_eq!(flagged.status, SubscriptionStatus::Active);
    assert_eq!(fixture.balance("user-u").await?, 10_000);

    fixture.clock.set(at("2024-01-11T00:00:00Z"));
    let report = fixture.subscriptions.process_expired_subscriptions().await?;
    assert_eq!(report.results[0].final_status, Some(SubscriptionStatus::Canceled));
    assert_eq!(
        fixture.subscriptions.get_subscription(&id).await?.status,
        SubscriptionStatus::Canceled
    );
    Ok(())
}

#[tokio::test]
async fn immediate_cancel_clears_tokens_and_rejects_repeat() -> Result<()> {
    let fixture = Fixture::new("2023-12-11T00:00:00Z").await?;
    let pro = fixture.activate("user-u", "pro", Some(30)).await?;
    let id = pro.subscription.subscription_id;

    let canceled = fixture.subscriptions.cancel(&id, true).await?;
    assert_eq!(canceled.status, SubscriptionStatus::Canceled);
    // Pro tokens are gone and the free plan took over.
    assert_eq!(fixture.balance("user-u").await?, 1_000);

    match fixture.subscriptions.cancel(&id, true).await {
        Err(LifecycleError::Conflict(_)) => {}
        other => return Err(anyhow!("expected conflict, got {other:?}")),
    }
    match fixture.subscriptions.cancel("sub_missing", false).await {
        Err(LifecycleError::RecordNotFound(_)) => {}
        other => return Err(anyhow!("expected not found, got {other:?}")),
    }
    Ok(())
}

#[tokio::test]
async fn paid_activation_supersedes_free_and_rejects_second_paid() -> Result<()> {
    let fixture = Fixture::new("2024-01-01T00:00:00Z").await?;
    let free = fixture.activate("user-u", "free", None).await?;
    assert_eq!(fixture.balance("user-u").await?, 1_000);

    let pro = fixture.activate("user-u", "pro", None).await?;
    assert_eq!(
        pro.superseded_subscription_id.as_deref(),
        Some(free.subscription.subscription_id.as_str())
    );
    assert_eq!(
        fixture
            .subscriptions
            .get_subscription(&free.subscription.subscription_id)
            .await?
            .status,
        SubscriptionStatus::Canceled
    );
    assert_eq!(fixture.balance("user-u").await?, 10_000);

    match fixture.activate("user-u", "annual", None).await {
        Err(error) => match error.downcast_ref::<LifecycleError>() {
            Some(LifecycleError::Conflict(_)) => {}
            other => return Err(anyhow!("expected conflict, got {other:?}")),
        },
        Ok(_) => return Err(anyhow!("second paid subscription was accepted")),
    }
    Ok(())
}

#[tokio::test]
async fn long_subscriptions_receive_monthly_allocations() -> Result<()> {
    let fixture = Fixture::new("2024-01-01T00:00:00Z").await?;
    let annual = fixture.activate("user-u", "annual", None).await?;
    assert_eq!(
        annual.subscription.next_allocation_at,
        Some(at("2024-01-31T00:00:00Z"))
    );
    assert_eq!(fixture.balance("user-u").await?, 5_000);

    let early = fixture.subscriptions.allocate_monthly_tokens().await?;
    assert_eq!(early.allocated, 0);

    fixture.clock.set(at("2024-01-31T00:00:00Z"));
    let report = fixture.subscriptions.allocate_monthly_tokens().await?;
    assert_eq!(report.allocated, 1);
    assert_eq!(report.allocated_tokens, 5_000);
    assert!(report.failures.is_empty());
    assert_eq!(fixture.balance("user-u").await?, 10_000);

    let repeat = fixture.subscriptions.allocate_monthly_tokens().await?;
    assert_eq!(repeat.allocated, 0);

    let row = fixture
        .subscriptions
        .get_subscription(&annual.subscription.subscription_id)
        .await?;
    assert_eq!(row.allocations_granted, 2);
    assert_eq!(row.next_allocation_at, Some(at("2024-03-01T00:00:00Z")));

    // Every allocation is tied to the subscription and cleared with it.
    let canceled = fixture
        .subscriptions
        .cancel(&annual.subscription.subscription_id, true)
        .await?;
    assert_eq!(canceled.status, SubscriptionStatus::Canceled);
    assert_eq!(fixture.balance("user-u").await?, 1_000);
    Ok(())
}

#[tokio::test]
async fn simultaneous_expiries_reconcile_rewards_once() -> Result<()> {
    let fixture = Fixture::new("2023-12-11T00:00:00Z").await?;
    let pro = plan("pro", 10_000, 30);
    for start in ["2023-12-01T00:00:00Z", "2023-12-05T00:00:00Z"] {
        let row = new_subscription_row(
            "user-m",
            &pro,
            SubscriptionProvider::Stripe,
            at(start),
            30,
            30,
            json!({}),
        )?;
        fixture
            .store
            .activate_subscription(ActivationInput {
                subscription: row,
                initial_grant: 100,
                grant_source: "subscription_grant".to_string(),
                supersede: None,
                now: at(start),
            })
            .await?;
    }
    let queued = fixture
        .subscriptions
        .rewards()
        .enqueue_or_grant("user-m", "pro", "inv-9")
        .await?;
    assert!(matches!(queued, EnqueueOutcome::Queued { .. }));

    fixture.clock.set(at("2024-01-11T00:00:00Z"));
    let report = fixture.subscriptions.process_expired_subscriptions().await?;
    assert_eq!(report.results.len(), 2);
    assert_eq!(report.expired_count(), 2);
    let activated = report
        .results
        .iter()
        .filter(|item| item.fallback == Some(FallbackAction::InvitationRewardActivated))
        .count();
    let untouched = report
        .results
        .iter()
        .filter(|item| item.fallback == Some(FallbackAction::None))
        .count();
    assert_eq!(activated, 1);
    assert_eq!(untouched, 1);

    let subscriptions = fixture.subscriptions.list_user_subscriptions("user-m").await?;
    let reward_subscriptions = subscriptions
        .iter()
        .filter(|row| row.provider == SubscriptionProvider::Invitation)
        .count();
    assert_eq!(reward_subscriptions, 1);
    assert!(subscriptions.iter().all(|row| row.plan_id != "free"));

    let rewards = fixture.subscriptions.rewards().list_rewards("user-m").await?;
    assert_eq!(rewards.len(), 1);
    assert_eq!(rewards[0].status, QueuedRewardStatus::Processed);
    Ok(())
}

#[tokio::test]
async fn out_of_range_durations_are_rejected() -> Result<()> {
    let fixture = Fixture::new("2024-01-01T00:00:00Z").await?;
    for days in [1_000_000_000_000, 36_501, 0] {
        match fixture.activate("user-x", "pro", Some(days)).await {
            Err(error) => match error.downcast_ref::<LifecycleError>() {
                Some(LifecycleError::InvalidRequest(message)) => {
                    assert!(message.contains("duration_days"));
                }
                other => return Err(anyhow!("expected invalid request, got {other:?}")),
            },
            Ok(activated) => return Err(anyhow!("activation accepted {days} days: {activated:?}")),
        }
    }
    assert!(
        fixture
            .subscriptions
            .list_user_subscriptions("user-x")
            .await?
            .is_empty()
    );

    assert!(matches!(
        fixture
            .subscriptions
            .upsert_plan(plan("forever", 100, 1_000_000_000_000))
            .await,
        Err(LifecycleError::InvalidRequest(_))
    ));
    let longest = fixture
        .activate("user-x", "pro", Some(36_500))
        .await?;
    assert_eq!(
        longest.subscription.period_end - longest.subscription.period_start,
        Duration::days(36_500)
    );
    Ok(())
}

#[tokio::test]
async fn overflowing_grant_leaves_the_superseded_plan_untouched() -> Result<()> {
    let fixture = Fixture::new("2024-01-01T00:00:00Z").await?;
    let free = fixture.activate("user-o", "free", None).await?;
    fixture
        .ledger
        .credit("user-o", i64::MAX - 1_000, TokenType::Purchased, None, json!({}))
        .await?;
    assert_eq!(fixture.balance("user-o").await?, i64::MAX);

    match fixture.activate("user-o", "pro", None).await {
        Err(error) => match error.downcast_ref::<LifecycleError>() {
            Some(LifecycleError::Conflict(message)) => assert!(message.contains("overflow")),
            other => return Err(anyhow!("expected overflow conflict, got {other:?}")),
        },
        Ok(activated) => return Err(anyhow!("overflowing grant was accepted: {activated:?}")),
    }

    let subscriptions = fixture.store.list_user_subscriptions("user-o").await?;
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(
        subscriptions[0].subscription_id,
        free.subscription.subscription_id
    );
    assert_eq!(subscriptions[0].status, SubscriptionStatus::Active);

    let chain = fixture.ledger.verify_chain("user-o").await?;
    assert!(chain.consistent);
    assert_eq!(chain.entry_count, 2);
    assert_eq!(fixture.balance("user-o").await?, i64::MAX);
    Ok(())
}
