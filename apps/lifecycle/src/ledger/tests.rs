use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::Duration;
use serde_json::json;

use crate::clock::ManualClock;
use crate::error::LifecycleError;
use crate::ledger::TokenLedger;
use crate::ledger::types::{SOURCE_SUBSCRIPTION_CLEAR, SOURCE_TOKEN_EXPIRY, TokenType};
use crate::store;
use crate::testing::{Fixture, at};

fn ledger_at(start: &str) -> (TokenLedger, ManualClock) {
    let clock = ManualClock::new(at(start));
    (
        TokenLedger::new(store::memory(), Arc::new(clock.clone())),
        clock,
    )
}

#[tokio::test]
async fn credits_and_debits_chain_balances() -> Result<()> {
    let (ledger, _clock) = ledger_at("2024-01-01T00:00:00Z");
    ledger
        .credit("user-1", 300, TokenType::Purchased, None, json!({ "source": "checkout" }))
        .await?;
    ledger
        .credit("user-1", 50, TokenType::Referral, None, json!({}))
        .await?;
    let debit = ledger.debit("user-1", 120, "usage", json!({ "job": "j-1" })).await?;
    assert_eq!(debit.amount, -120);
    assert_eq!(debit.balance_before, 350);
    assert_eq!(debit.balance_after, 230);
    assert_eq!(debit.token_type, TokenType::Debit);

    let entries = ledger.verify_chain("user-1").await?;
    assert!(entries.consistent);
    assert_eq!(entries.entry_count, 3);
    assert_eq!(entries.replayed_balance, 230);
    assert_eq!(entries.cached_balance, 230);

    let balance = ledger.get_balance("user-1").await?;
    assert_eq!(balance.total, 230);
    assert_eq!(balance.breakdown.purchased, 300);
    assert_eq!(balance.breakdown.referral, 50);
    assert_eq!(balance.breakdown.subscription, 0);
    Ok(())
}

#[tokio::test]
async fn credit_records_source_and_leaves_non_subscription_tokens_open_ended() -> Result<()> {
    let (ledger, _clock) = ledger_at("2024-01-01T00:00:00Z");
    let entry = ledger
        .credit("user-1", 40, TokenType::Bonus, None, json!({ "source": "promo" }))
        .await?;
    assert_eq!(entry.source, "promo");
    assert!(entry.expires_at.is_none());
    assert!(entry.subscription_ref.is_none());

    let defaulted = ledger
        .credit("user-1", 10, TokenType::Activity, None, json!({}))
        .await?;
    assert_eq!(defaulted.source, "credit");
    Ok(())
}

#[tokio::test]
async fn insufficient_balance_leaves_ledger_untouched() -> Result<()> {
    let (ledger, _clock) = ledger_at("2024-01-01T00:00:00Z");
    ledger
        .credit("user-1", 50, TokenType::Purchased, None, json!({}))
        .await?;

    match ledger.debit("user-1", 100, "usage", json!({})).await {
        Err(LifecycleError::InsufficientBalance {
            available,
            requested,
        }) => {
            assert_eq!(available, 50);
            assert_eq!(requested, 100);
        }
        other => return Err(anyhow!("expected insufficient balance, got {other:?}")),
    }

    let chain = ledger.verify_chain("user-1").await?;
    assert_eq!(chain.entry_count, 1);
    assert_eq!(chain.cached_balance, 50);
    assert!(chain.consistent);
    Ok(())
}

#[tokio::test]
async fn invalid_amounts_are_rejected() -> Result<()> {
    let (ledger, _clock) = ledger_at("2024-01-01T00:00:00Z");
    assert!(matches!(
        ledger
            .credit("user-1", 0, TokenType::Purchased, None, json!({}))
            .await,
        Err(LifecycleError::InvalidRequest(_))
    ));
    assert!(matches!(
        ledger
            .credit("user-1", 10, TokenType::Debit, None, json!({}))
            .await,
        Err(LifecycleError::InvalidRequest(_))
    ));
    assert!(matches!(
        ledger.debit("user-1", -5, "usage", json!({})).await,
        Err(LifecycleError::InvalidRequest(_))
    ));
    assert!(matches!(
        ledger.debit("", 5, "usage", json!({})).await,
        Err(LifecycleError::InvalidRequest(_))
    ));
    Ok(())
}

#[tokio::test]
async fn subscription_credits_inherit_the_active_period_end() -> Result<()> {
    let fixture = Fixture::new("2024-01-01T00:00:00Z").await?;
    let pro = fixture.activate("user-1", "pro", None).await?;

    let bonus = fixture
        .ledger
        .credit("user-1", 500, TokenType::Subscription, None, json!({}))
        .await?;
    assert_eq!(bonus.expires_at, Some(pro.subscription.period_end));
    assert_eq!(
        bonus.subscription_ref.as_deref(),
        Some(pro.subscription.subscription_id.as_str())
    );

    let explicit_expiry = at("2024-01-15T00:00:00Z");
    let explicit = fixture
        .ledger
        .credit(
            "user-1",
            200,
            TokenType::Subscription,
            Some(explicit_expiry),
            json!({}),
        )
        .await?;
    assert_eq!(explicit.expires_at, Some(explicit_expiry));

    // Clearing the subscription takes back every tagged credit in one entry.
    let cleared = fixture
        .ledger
        .clear_subscription_tokens("user-1", &pro.subscription.subscription_id)
        .await?
        .ok_or_else(|| anyhow!("expected a compensating entry"))?;
    assert_eq!(cleared.amount, -10_700);
    assert_eq!(cleared.source, SOURCE_SUBSCRIPTION_CLEAR);
    assert_eq!(cleared.compensates.len(), 3);
    assert_eq!(fixture.balance("user-1").await?, 0);

    let again = fixture
        .ledger
        .clear_subscription_tokens("user-1", &pro.subscription.subscription_id)
        .await?;
    assert!(again.is_none());
    Ok(())
}

#[tokio::test]
async fn expiry_sweep_compensates_each_credit_once() -> Result<()> {
    let (ledger, clock) = ledger_at("2024-01-01T00:00:00Z");
    ledger
        .credit("user-1", 100, TokenType::Purchased, None, json!({}))
        .await?;
    ledger
        .credit(
            "user-1",
            60,
            TokenType::Subscription,
            Some(at("2024-01-05T00:00:00Z")),
            json!({}),
        )
        .await?;
    ledger
        .credit(
            "user-2",
            80,
            TokenType::Subscription,
            Some(at("2024-02-01T00:00:00Z")),
            json!({}),
        )
        .await?;

    clock.set(at("2024-01-10T00:00:00Z"));
    let first = ledger.sweep_expired().await?;
    assert_eq!(first.scanned, 1);
    assert_eq!(first.compensated, 1);
    assert_eq!(first.compensated_tokens, 60);
    assert!(first.failures.is_empty());

    let second = ledger.sweep_expired().await?;
    assert_eq!(second.scanned, 0);
    assert_eq!(second.compensated, 0);

    let balance = ledger.get_balance("user-1").await?;
    assert_eq!(balance.total, 100);
    assert_eq!(balance.breakdown.subscription, 0);
    let entries = ledger.verify_chain("user-1").await?;
    assert!(entries.consistent);
    assert_eq!(entries.entry_count, 3);
    assert_eq!(ledger.get_balance("user-2").await?.total, 80);
    Ok(())
}

#[tokio::test]
async fn expiry_compensation_is_capped_by_the_pooled_balance() -> Result<()> {
    let (ledger, clock) = ledger_at("2024-01-01T00:00:00Z");
    ledger
        .credit(
            "user-1",
            60,
            TokenType::Subscription,
            Some(at("2024-01-05T00:00:00Z")),
            json!({}),
        )
        .await?;
    ledger.debit("user-1", 45, "usage", json!({})).await?;

    clock.set(at("2024-01-06T00:00:00Z"));
    let summary = ledger.sweep_expired().await?;
    assert_eq!(summary.compensated_tokens, 15);
    let balance = ledger.get_balance("user-1").await?;
    assert_eq!(balance.total, 0);

    assert!(ledger.verify_chain("user-1").await?.consistent);
    let entries = ledger.list_entries("user-1").await?;
    let last = entries.last().ok_or_else(|| anyhow!("ledger is empty"))?;
    assert_eq!(last.source, SOURCE_TOKEN_EXPIRY);
    assert_eq!(last.balance_after, 0);
    Ok(())
}

#[tokio::test]
async fn expiring_summary_groups_by_user_within_window() -> Result<()> {
    let (ledger, _clock) = ledger_at("2024-01-01T00:00:00Z");
    for (user, amount, expires) in [
        ("user-1", 100, "2024-01-03T00:00:00Z"),
        ("user-1", 50, "2024-01-06T00:00:00Z"),
        ("user-2", 70, "2024-01-04T00:00:00Z"),
        ("user-3", 90, "2024-03-01T00:00:00Z"),
    ] {
        ledger
            .credit(user, amount, TokenType::Subscription, Some(at(expires)), json!({}))
            .await?;
    }
    ledger
        .credit("user-4", 10, TokenType::Purchased, None, json!({}))
        .await?;

    let summary = ledger.get_expiring_tokens_summary(7).await?;
    assert_eq!(summary.window_days, 7);
    assert_eq!(summary.until - summary.from, Duration::days(7));
    assert_eq!(summary.entry_count, 3);
    assert_eq!(summary.user_count, 2);
    assert_eq!(summary.total_tokens, 220);
    assert_eq!(summary.users[0].user_id, "user-1");
    assert_eq!(summary.users[0].tokens, 150);
    assert_eq!(
        summary.users[0].earliest_expires_at,
        at("2024-01-03T00:00:00Z")
    );

    for days in [0, 367, -3] {
        assert!(matches!(
            ledger.get_expiring_tokens_summary(days).await,
            Err(LifecycleError::InvalidRequest(_))
        ));
    }
    Ok(())
}

#[tokio::test]
async fn non_subscription_credits_refuse_an_expiry() -> Result<()> {
    let (ledger, _clock) = ledger_at("2024-01-01T00:00:00Z");
    for token_type in [
        TokenType::Purchased,
        TokenType::Referral,
        TokenType::Bonus,
        TokenType::Activity,
    ] {
        match ledger
            .credit(
                "user-1",
                25,
                token_type,
                Some(at("2024-02-01T00:00:00Z")),
                json!({}),
            )
            .await
        {
            Err(LifecycleError::InvalidRequest(message)) => {
                assert!(message.contains(token_type.as_str()), "{message}");
            }
            other => return Err(anyhow!("expected rejection for {token_type:?}, got {other:?}")),
        }
    }

    let chain = ledger.verify_chain("user-1").await?;
    assert_eq!(chain.entry_count, 0);
    assert_eq!(ledger.get_balance("user-1").await?.total, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_debits_and_credits_keep_the_chain_consistent() -> Result<()> {
    let (ledger, _clock) = ledger_at("2024-01-01T00:00:00Z");
    ledger
        .credit("user-c", 1000, TokenType::Purchased, None, json!({}))
        .await?;

    let mut tasks = tokio::task::JoinSet::new();
    for index in 0..200 {
        let ledger = ledger.clone();
        tasks.spawn(async move {
            ledger
                .debit("user-c", 7, "usage", json!({ "job": index }))
                .await
                .map(|entry| entry.amount)
        });
    }
    for _ in 0..20 {
        let ledger = ledger.clone();
        tasks.spawn(async move {
            ledger
                .credit("user-c", 5, TokenType::Bonus, None, json!({}))
                .await
                .map(|entry| entry.amount)
        });
    }

    let mut expected = 1000_i64;
    let mut debits = 0_u64;
    let mut rejected = 0_u64;
    while let Some(joined) = tasks.join_next().await {
        match joined? {
            Ok(amount) => {
                expected += amount;
                if amount < 0 {
                    debits += 1;
                }
            }
            Err(LifecycleError::InsufficientBalance { .. }) => rejected += 1,
            Err(other) => return Err(anyhow!("unexpected ledger error: {other}")),
        }
    }

    assert_eq!(debits + rejected, 200);
    // 1000 covers 142 debits up front; the 100 bonus tokens can cover 15 more.
    assert!((142..=157).contains(&debits), "{debits} debits succeeded");
    assert!(expected >= 0);

    let chain = ledger.verify_chain("user-c").await?;
    assert!(chain.consistent);
    assert_eq!(chain.entry_count, 1 + 20 + debits);
    assert_eq!(chain.replayed_balance, expected);
    assert_eq!(chain.cached_balance, expected);
    assert_eq!(ledger.get_balance("user-c").await?.total, expected);
    Ok(())
}
