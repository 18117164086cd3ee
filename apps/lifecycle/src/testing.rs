use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::clock::ManualClock;
use crate::config::LifecyclePolicyConfig;
use crate::ledger::TokenLedger;
use crate::notify::Notifier;
use crate::notify::testing::RecordingSender;
use crate::store::{self, LifecycleStore};
use crate::subscription::SubscriptionService;
use crate::subscription::types::{
    ActivateSubscriptionRequest, ActivatedSubscription, PlanRow, SubscriptionProvider,
};

/// Parses an RFC 3339 literal. Panics on a malformed literal so a typo fails
/// the test that wrote it.
pub(crate) fn at(raw: &str) -> DateTime<Utc> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(value) => value.with_timezone(&Utc),
        Err(error) => panic!("invalid timestamp literal {raw:?}: {error}"),
    }
}

pub(crate) fn plan(plan_id: &str, monthly_tokens: i64, duration_days: i64) -> PlanRow {
    PlanRow {
        plan_id: plan_id.to_string(),
        name: plan_id.to_uppercase(),
        monthly_tokens,
        duration_days,
        is_free: false,
        created_at: at("2023-01-01T00:00:00Z"),
    }
}

/// Memory-backed services sharing one manual clock. Seeds the free plan, a
/// 30-day `pro` plan (10,000 tokens) and a 365-day `annual` plan (5,000 tokens
/// per allocation period).
pub(crate) struct Fixture {
    pub store: Arc<dyn LifecycleStore>,
    pub clock: ManualClock,
    pub sender: Arc<RecordingSender>,
    pub ledger: TokenLedger,
    pub subscriptions: SubscriptionService,
}

impl Fixture {
    pub(crate) async fn new(start: &str) -> Result<Self> {
        let store = store::memory();
        let clock = ManualClock::new(at(start));
        let sender = Arc::new(RecordingSender::default());
        let notifier = Notifier::new(sender.clone());
        let ledger = TokenLedger::new(store.clone(), Arc::new(clock.clone()));
        let subscriptions = SubscriptionService::new(
            store.clone(),
            Arc::new(clock.clone()),
            notifier,
            LifecyclePolicyConfig::default(),
        );

        subscriptions.ensure_free_plan().await?;
        subscriptions.upsert_plan(plan("pro", 10_000, 30)).await?;
        subscriptions.upsert_plan(plan("annual", 5_000, 365)).await?;

        Ok(Self {
            store,
            clock,
            sender,
            ledger,
            subscriptions,
        })
    }

    pub(crate) async fn activate(
        &self,
        user_id: &str,
        plan_id: &str,
        duration_days: Option<i64>,
    ) -> Result<ActivatedSubscription> {
        Ok(self
            .subscriptions
            .activate(ActivateSubscriptionRequest {
                user_id: user_id.to_string(),
                plan_id: plan_id.to_string(),
                provider: SubscriptionProvider::Stripe,
                duration_days,
                metadata: json!({}),
            })
            .await?)
    }

    pub(crate) async fn balance(&self, user_id: &str) -> Result<i64> {
        Ok(self.ledger.get_balance(user_id).await?.total)
    }
}
