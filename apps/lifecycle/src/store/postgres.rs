use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio_postgres::Transaction;

use crate::db::LifecycleDb;
use crate::invitation::types::{QueuedRewardRow, QueuedRewardStatus};
use crate::ledger::types::{LedgerEntryRow, SOURCE_SUBSCRIPTION_GRANT, TokenType};
use crate::scheduler::types::{TaskExecutionRecord, TaskRunStatus};
use crate::store::{
    ActivationInput, ActivationResult, AllocationInput, ClearTokensInput, ConsumeRewardsInput,
    LedgerAppendInput, LifecycleStore, StoreError, TransitionInput, TransitionResult,
    clamp_compensation, new_record_id,
};
use crate::subscription::types::{
    ActivityRecord, PlanRow, SubscriptionProvider, SubscriptionRow, SubscriptionStatus,
};

pub(super) struct PostgresLifecycleStore {
    db: Arc<LifecycleDb>,
}

impl PostgresLifecycleStore {
    pub(super) fn new(db: Arc<LifecycleDb>) -> Self {
        Self { db }
    }
}

fn db_error(error: tokio_postgres::Error) -> StoreError {
    StoreError::Db(error.to_string())
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Ensures the balance row exists and locks it for the rest of the transaction.
async fn lock_balance(
    tx: &Transaction<'_>,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<(i64, i64), StoreError> {
    tx.execute(
        r#"
        INSERT INTO lifecycle.account_balances (user_id, balance, last_seq, updated_at)
        VALUES ($1, 0, 0, $2)
        ON CONFLICT (user_id) DO NOTHING
        "#,
        &[&user_id, &now],
    )
    .await
    .map_err(db_error)?;

    let row = tx
        .query_one(
            r#"
            SELECT balance, last_seq
              FROM lifecycle.account_balances
             WHERE user_id = $1
               FOR UPDATE
            "#,
            &[&user_id],
        )
        .await
        .map_err(db_error)?;
    Ok((row.get("balance"), row.get("last_seq")))
}

async fn insert_entry(
    tx: &Transaction<'_>,
    input: LedgerAppendInput,
    compensates: Vec<String>,
) -> Result<LedgerEntryRow, StoreError> {
    if input.amount == 0 {
        return Err(StoreError::Conflict(
            "ledger entries must move a non-zero amount".to_string(),
        ));
    }
    let (balance, last_seq) = lock_balance(tx, &input.user_id, input.now).await?;
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
        user_id: input.user_id,
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

    tx.execute(
        r#"
        INSERT INTO lifecycle.ledger_entries (
            entry_id, user_id, seq, token_type, amount, balance_before, balance_after,
            source, expires_at, subscription_ref, compensates, metadata, created_at
        ) VALUES (
            $1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13
        )
        "#,
        &[
            &entry.entry_id,
            &entry.user_id,
            &entry.seq,
            &entry.token_type.as_str(),
            &entry.amount,
            &entry.balance_before,
            &entry.balance_after,
            &entry.source,
            &entry.expires_at,
            &entry.subscription_ref,
            &entry.compensates,
            &entry.metadata,
            &entry.created_at,
        ],
    )
    .await
    .map_err(db_error)?;

    if !entry.compensates.is_empty() {
        tx.execute(
            r#"
            INSERT INTO lifecycle.ledger_compensations (entry_id, compensation_entry_id, compensated_at)
            SELECT UNNEST($1::TEXT[]), $2, $3
            "#,
            &[&entry.compensates, &entry.entry_id, &entry.created_at],
        )
        .await
        .map_err(db_error)?;
    }

    tx.execute(
        r#"
        UPDATE lifecycle.account_balances
           SET balance = $2, last_seq = $3, updated_at = $4
         WHERE user_id = $1
        "#,
        &[&entry.user_id, &entry.balance_after, &entry.seq, &entry.created_at],
    )
    .await
    .map_err(db_error)?;

    Ok(entry)
}

async fn retire_without_debit(
    tx: &Transaction<'_>,
    entry_ids: &[String],
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    tx.execute(
        r#"
        INSERT INTO lifecycle.ledger_compensations (entry_id, compensation_entry_id, compensated_at)
        SELECT UNNEST($1::TEXT[]), NULL, $2
        "#,
        &[&entry_ids, &now],
    )
    .await
    .map_err(db_error)?;
    Ok(())
}

async fn clear_tokens_tx(
    tx: &Transaction<'_>,
    input: ClearTokensInput,
) -> Result<Option<LedgerEntryRow>, StoreError> {
    let (balance, _) = lock_balance(tx, &input.user_id, input.now).await?;
    let rows = tx
        .query(
            r#"
            SELECT e.entry_id, e.amount
              FROM lifecycle.ledger_entries e
             WHERE e.user_id = $1
               AND e.subscription_ref = $2
               AND e.token_type = 'SUBSCRIPTION'
               AND e.amount > 0
               AND NOT EXISTS (
                   SELECT 1 FROM lifecycle.ledger_compensations c
                    WHERE c.entry_id = e.entry_id
               )
             ORDER BY e.seq
            "#,
            &[&input.user_id, &input.subscription_id],
        )
        .await
        .map_err(db_error)?;
    if rows.is_empty() {
        return Ok(None);
    }

    let mut compensates = Vec::with_capacity(rows.len());
    let mut total = 0_i64;
    for row in &rows {
        let entry_id: String = row.get("entry_id");
        let amount: i64 = row.get("amount");
        compensates.push(entry_id);
        total = total.saturating_add(amount);
    }

    let debit = clamp_compensation(total, balance);
    if debit == 0 {
        retire_without_debit(tx, &compensates, input.now).await?;
        return Ok(None);
    }

    let entry = insert_entry(
        tx,
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
    )
    .await?;
    Ok(Some(entry))
}

async fn transition_tx(
    tx: &Transaction<'_>,
    input: TransitionInput,
) -> Result<Option<TransitionResult>, StoreError> {
    if input.to == SubscriptionStatus::Active {
        return Err(StoreError::Conflict(
            "transition target must be terminal".to_string(),
        ));
    }

    let row = tx
        .query_opt(
            r#"
            SELECT status
              FROM lifecycle.subscriptions
             WHERE subscription_id = $1
               FOR UPDATE
            "#,
            &[&input.subscription_id],
        )
        .await
        .map_err(db_error)?;
    let Some(row) = row else {
        return Err(StoreError::NotFound("subscription".to_string()));
    };
    let status: String = row.get("status");
    if SubscriptionStatus::parse(&status) != Some(SubscriptionStatus::Active) {
        return Ok(None);
    }

    let updated = tx
        .query_one(
            r#"
            UPDATE lifecycle.subscriptions
               SET status = $2, next_allocation_at = NULL, updated_at = $3
             WHERE subscription_id = $1
            RETURNING subscription_id, user_id, plan_id, status, period_start, period_end,
                      provider, cancel_at_period_end, next_allocation_at, allocations_granted,
                      metadata, created_at, updated_at
            "#,
            &[&input.subscription_id, &input.to.as_str(), &input.now],
        )
        .await
        .map_err(db_error)?;
    let subscription = map_subscription_row(&updated).map_err(StoreError::Db)?;

    let compensation = if input.clear_tokens {
        clear_tokens_tx(
            tx,
            ClearTokensInput {
                user_id: subscription.user_id.clone(),
                subscription_id: subscription.subscription_id.clone(),
                source: input.source,
                now: input.now,
            },
        )
        .await?
    } else {
        None
    };

    Ok(Some(TransitionResult {
        subscription,
        compensation,
    }))
}

async fn activate_tx(
    tx: &Transaction<'_>,
    input: ActivationInput,
) -> Result<ActivationResult, StoreError> {
    let existing = tx
        .query_opt(
            "SELECT 1 FROM lifecycle.subscriptions WHERE subscription_id = $1",
            &[&input.subscription.subscription_id],
        )
        .await
        .map_err(db_error)?;
    if existing.is_some() {
        return Err(StoreError::Conflict(
            "subscription_id already exists".to_string(),
        ));
    }

    let superseded = match input.supersede {
        Some(subscription_id) => {
            transition_tx(
                tx,
                TransitionInput {
                    subscription_id,
                    to: SubscriptionStatus::Canceled,
                    clear_tokens: true,
                    source: "subscription_superseded".to_string(),
                    now: input.now,
                },
            )
            .await?
        }
        None => None,
    };

    let subscription = input.subscription;
    tx.execute(
        r#"
        INSERT INTO lifecycle.subscriptions (
            subscription_id, user_id, plan_id, status, period_start, period_end, provider,
            cancel_at_period_end, next_allocation_at, allocations_granted, metadata,
            created_at, updated_at
        ) VALUES (
            $1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13
        )
        "#,
        &[
            &subscription.subscription_id,
            &subscription.user_id,
            &subscription.plan_id,
            &subscription.status.as_str(),
            &subscription.period_start,
            &subscription.period_end,
            &subscription.provider.as_str(),
            &subscription.cancel_at_period_end,
            &subscription.next_allocation_at,
            &subscription.allocations_granted,
            &subscription.metadata,
            &subscription.created_at,
            &subscription.updated_at,
        ],
    )
    .await
    .map_err(db_error)?;

    let grant_entry = if input.initial_grant > 0 {
        let source = if input.grant_source.is_empty() {
            SOURCE_SUBSCRIPTION_GRANT.to_string()
        } else {
            input.grant_source
        };
        Some(
            insert_entry(
                tx,
                LedgerAppendInput {
                    user_id: subscription.user_id.clone(),
                    token_type: TokenType::Subscription,
                    amount: input.initial_grant,
                    source,
                    expires_at: Some(subscription.period_end),
                    subscription_ref: Some(subscription.subscription_id.clone()),
                    metadata: json!({ "plan_id": subscription.plan_id }),
                    now: input.now,
                },
                Vec::new(),
            )
            .await?,
        )
    } else {
        None
    };

    Ok(ActivationResult {
        subscription,
        grant_entry,
        superseded,
    })
}

#[async_trait]
impl LifecycleStore for PostgresLifecycleStore {
    async fn upsert_plan(&self, plan: PlanRow) -> Result<PlanRow, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO lifecycle.plans (
                    plan_id, name, monthly_tokens, duration_days, is_free, created_at
                ) VALUES ($1,$2,$3,$4,$5,$6)
                ON CONFLICT (plan_id) DO UPDATE
                   SET name = EXCLUDED.name,
                       monthly_tokens = EXCLUDED.monthly_tokens,
                       duration_days = EXCLUDED.duration_days,
                       is_free = EXCLUDED.is_free
                "#,
                &[
                    &plan.plan_id,
                    &plan.name,
                    &plan.monthly_tokens,
                    &plan.duration_days,
                    &plan.is_free,
                    &plan.created_at,
                ],
            )
            .await
            .map_err(db_error)?;
        Ok(plan)
    }

    async fn get_plan(&self, plan_id: &str) -> Result<Option<PlanRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT plan_id, name, monthly_tokens, duration_days, is_free, created_at
                  FROM lifecycle.plans
                 WHERE plan_id = $1
                "#,
                &[&plan_id],
            )
            .await
            .map_err(db_error)?;
        row.as_ref()
            .map(map_plan_row)
            .transpose()
            .map_err(StoreError::Db)
    }

    async fn activate_subscription(
        &self,
        input: ActivationInput,
    ) -> Result<ActivationResult, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_error)?;
        let result = activate_tx(&tx, input).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(result)
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<SubscriptionRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT subscription_id, user_id, plan_id, status, period_start, period_end,
                       provider, cancel_at_period_end, next_allocation_at, allocations_granted,
                       metadata, created_at, updated_at
                  FROM lifecycle.subscriptions
                 WHERE subscription_id = $1
                "#,
                &[&subscription_id],
            )
            .await
            .map_err(db_error)?;
        row.as_ref()
            .map(map_subscription_row)
            .transpose()
            .map_err(StoreError::Db)
    }

    async fn list_user_subscriptions(
        &self,
        user_id: &str,
    ) -> Result<Vec<SubscriptionRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT subscription_id, user_id, plan_id, status, period_start, period_end,
                       provider, cancel_at_period_end, next_allocation_at, allocations_granted,
                       metadata, created_at, updated_at
                  FROM lifecycle.subscriptions
                 WHERE user_id = $1
                 ORDER BY created_at, subscription_id
                "#,
                &[&user_id],
            )
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(map_subscription_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::Db)
    }

    async fn list_active_subscriptions(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<SubscriptionRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT subscription_id, user_id, plan_id, status, period_start, period_end,
                       provider, cancel_at_period_end, next_allocation_at, allocations_granted,
                       metadata, created_at, updated_at
                  FROM lifecycle.subscriptions
                 WHERE user_id = $1
                   AND status = 'ACTIVE'
                   AND period_end > $2
                 ORDER BY created_at, subscription_id
                "#,
                &[&user_id, &now],
            )
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(map_subscription_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::Db)
    }

    async fn list_due_subscriptions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SubscriptionRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT subscription_id, user_id, plan_id, status, period_start, period_end,
                       provider, cancel_at_period_end, next_allocation_at, allocations_granted,
                       metadata, created_at, updated_at
                  FROM lifecycle.subscriptions
                 WHERE status = 'ACTIVE'
                   AND period_end <= $1
                 ORDER BY period_end, subscription_id
                 LIMIT $2
                "#,
                &[&now, &limit_param(limit)],
            )
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(map_subscription_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::Db)
    }

    async fn oldest_due_period_end(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                r#"
                SELECT MIN(period_end) AS oldest
                  FROM lifecycle.subscriptions
                 WHERE status = 'ACTIVE'
                   AND period_end <= $1
                "#,
                &[&now],
            )
            .await
            .map_err(db_error)?;
        row.try_get("oldest")
            .map_err(|error| StoreError::Db(error.to_string()))
    }

    async fn transition_subscription(
        &self,
        input: TransitionInput,
    ) -> Result<Option<TransitionResult>, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_error)?;
        let result = transition_tx(&tx, input).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(result)
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionRow, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                UPDATE lifecycle.subscriptions
                   SET cancel_at_period_end = $2, updated_at = $3
                 WHERE subscription_id = $1
                   AND status = 'ACTIVE'
                RETURNING subscription_id, user_id, plan_id, status, period_start, period_end,
                          provider, cancel_at_period_end, next_allocation_at, allocations_granted,
                          metadata, created_at, updated_at
                "#,
                &[&subscription_id, &cancel_at_period_end, &now],
            )
            .await
            .map_err(db_error)?;
        if let Some(row) = row {
            return map_subscription_row(&row).map_err(StoreError::Db);
        }

        let exists = client
            .query_opt(
                "SELECT 1 FROM lifecycle.subscriptions WHERE subscription_id = $1",
                &[&subscription_id],
            )
            .await
            .map_err(db_error)?;
        if exists.is_some() {
            Err(StoreError::Conflict("subscription is not active".to_string()))
        } else {
            Err(StoreError::NotFound("subscription".to_string()))
        }
    }

    async fn list_allocation_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SubscriptionRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT subscription_id, user_id, plan_id, status, period_start, period_end,
                       provider, cancel_at_period_end, next_allocation_at, allocations_granted,
                       metadata, created_at, updated_at
                  FROM lifecycle.subscriptions
                 WHERE status = 'ACTIVE'
                   AND period_end > $1
                   AND next_allocation_at IS NOT NULL
                   AND next_allocation_at <= $1
                 ORDER BY next_allocation_at, subscription_id
                 LIMIT $2
                "#,
                &[&now, &limit_param(limit)],
            )
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(map_subscription_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::Db)
    }

    async fn apply_monthly_allocation(
        &self,
        input: AllocationInput,
    ) -> Result<Option<LedgerEntryRow>, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_error)?;

        let row = tx
            .query_opt(
                r#"
                SELECT subscription_id, user_id, plan_id, status, period_start, period_end,
                       provider, cancel_at_period_end, next_allocation_at, allocations_granted,
                       metadata, created_at, updated_at
                  FROM lifecycle.subscriptions
                 WHERE subscription_id = $1
                   FOR UPDATE
                "#,
                &[&input.subscription_id],
            )
            .await
            .map_err(db_error)?;
        let Some(row) = row else {
            return Err(StoreError::NotFound("subscription".to_string()));
        };
        let subscription = map_subscription_row(&row).map_err(StoreError::Db)?;
        if subscription.status != SubscriptionStatus::Active
            || subscription.next_allocation_at != Some(input.expected_next_allocation_at)
        {
            tx.commit().await.map_err(db_error)?;
            return Ok(None);
        }

        let entry = if input.amount > 0 {
            Some(
                insert_entry(
                    &tx,
                    LedgerAppendInput {
                        user_id: subscription.user_id.clone(),
                        token_type: TokenType::Subscription,
                        amount: input.amount,
                        source: input.source,
                        expires_at: Some(subscription.period_end),
                        subscription_ref: Some(subscription.subscription_id.clone()),
                        metadata: json!({
                            "plan_id": subscription.plan_id,
                            "allocation_index": subscription.allocations_granted + 1,
                        }),
                        now: input.now,
                    },
                    Vec::new(),
                )
                .await?,
            )
        } else {
            None
        };

        tx.execute(
            r#"
            UPDATE lifecycle.subscriptions
               SET next_allocation_at = $2,
                   allocations_granted = allocations_granted + 1,
                   updated_at = $3
             WHERE subscription_id = $1
            "#,
            &[&input.subscription_id, &input.next_allocation_at, &input.now],
        )
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(entry)
    }

    async fn append_ledger_entry(
        &self,
        input: LedgerAppendInput,
    ) -> Result<LedgerEntryRow, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_error)?;
        let entry = insert_entry(&tx, input, Vec::new()).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(entry)
    }

    async fn clear_subscription_tokens(
        &self,
        input: ClearTokensInput,
    ) -> Result<Option<LedgerEntryRow>, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_error)?;
        let entry = clear_tokens_tx(&tx, input).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(entry)
    }

    async fn get_cached_balance(&self, user_id: &str) -> Result<i64, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                "SELECT balance FROM lifecycle.account_balances WHERE user_id = $1",
                &[&user_id],
            )
            .await
            .map_err(db_error)?;
        Ok(row.map_or(0, |row| row.get("balance")))
    }

    async fn list_ledger_entries(&self, user_id: &str) -> Result<Vec<LedgerEntryRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT entry_id, user_id, seq, token_type, amount, balance_before, balance_after,
                       source, expires_at, subscription_ref, compensates, metadata, created_at
                  FROM lifecycle.ledger_entries
                 WHERE user_id = $1
                 ORDER BY seq
                "#,
                &[&user_id],
            )
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(map_entry_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::Db)
    }

    async fn list_expired_uncompensated(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LedgerEntryRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT e.entry_id, e.user_id, e.seq, e.token_type, e.amount, e.balance_before,
                       e.balance_after, e.source, e.expires_at, e.subscription_ref,
                       e.compensates, e.metadata, e.created_at
                  FROM lifecycle.ledger_entries e
                 WHERE e.token_type = 'SUBSCRIPTION'
                   AND e.amount > 0
                   AND e.expires_at IS NOT NULL
                   AND e.expires_at <= $1
                   AND NOT EXISTS (
                       SELECT 1 FROM lifecycle.ledger_compensations c
                        WHERE c.entry_id = e.entry_id
                   )
                 ORDER BY e.expires_at, e.entry_id
                 LIMIT $2
                "#,
                &[&now, &limit_param(limit)],
            )
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(map_entry_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::Db)
    }

    async fn compensate_expired_entry(
        &self,
        entry_id: &str,
        source: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LedgerEntryRow>, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_error)?;

        let row = tx
            .query_opt(
                r#"
                SELECT entry_id, user_id, seq, token_type, amount, balance_before, balance_after,
                       source, expires_at, subscription_ref, compensates, metadata, created_at
                  FROM lifecycle.ledger_entries
                 WHERE entry_id = $1
                "#,
                &[&entry_id],
            )
            .await
            .map_err(db_error)?;
        let Some(row) = row else {
            return Err(StoreError::NotFound("ledger entry".to_string()));
        };
        let entry = map_entry_row(&row).map_err(StoreError::Db)?;

        // Lock first so a concurrent clear cannot retire the same credit twice.
        let (balance, _) = lock_balance(&tx, &entry.user_id, now).await?;
        let already = tx
            .query_opt(
                "SELECT 1 FROM lifecycle.ledger_compensations WHERE entry_id = $1",
                &[&entry_id],
            )
            .await
            .map_err(db_error)?;
        if already.is_some() {
            tx.commit().await.map_err(db_error)?;
            return Ok(None);
        }

        let debit = clamp_compensation(entry.amount, balance);
        let compensation = if debit == 0 {
            retire_without_debit(&tx, std::slice::from_ref(&entry.entry_id), now).await?;
            None
        } else {
            Some(
                insert_entry(
                    &tx,
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
                    vec![entry.entry_id.clone()],
                )
                .await?,
            )
        };

        tx.commit().await.map_err(db_error)?;
        Ok(compensation)
    }

    async fn list_expiring_entries(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntryRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT e.entry_id, e.user_id, e.seq, e.token_type, e.amount, e.balance_before,
                       e.balance_after, e.source, e.expires_at, e.subscription_ref,
                       e.compensates, e.metadata, e.created_at
                  FROM lifecycle.ledger_entries e
                 WHERE e.token_type = 'SUBSCRIPTION'
                   AND e.amount > 0
                   AND e.expires_at > $1
                   AND e.expires_at <= $2
                   AND NOT EXISTS (
                       SELECT 1 FROM lifecycle.ledger_compensations c
                        WHERE c.entry_id = e.entry_id
                   )
                 ORDER BY e.user_id, e.expires_at
                "#,
                &[&from, &until],
            )
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(map_entry_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::Db)
    }

    async fn create_or_get_queued_reward(
        &self,
        reward: QueuedRewardRow,
    ) -> Result<(QueuedRewardRow, bool), StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_error)?;

        let inserted = tx
            .execute(
                r#"
                INSERT INTO lifecycle.queued_invitation_rewards (
                    reward_id, user_id, plan_id, invitation_id, days_to_add, status,
                    created_at, processed_at, subscription_id
                ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
                ON CONFLICT (user_id, invitation_id) DO NOTHING
                "#,
                &[
                    &reward.reward_id,
                    &reward.user_id,
                    &reward.plan_id,
                    &reward.invitation_id,
                    &reward.days_to_add,
                    &reward.status.as_str(),
                    &reward.created_at,
                    &reward.processed_at,
                    &reward.subscription_id,
                ],
            )
            .await
            .map_err(db_error)?;

        if inserted == 1 {
            tx.commit().await.map_err(db_error)?;
            return Ok((reward, true));
        }

        let row = tx
            .query_one(
                r#"
                SELECT reward_id, user_id, plan_id, invitation_id, days_to_add, status,
                       created_at, processed_at, subscription_id
                  FROM lifecycle.queued_invitation_rewards
                 WHERE user_id = $1 AND invitation_id = $2
                "#,
                &[&reward.user_id, &reward.invitation_id],
            )
            .await
            .map_err(db_error)?;
        let existing = map_reward_row(&row).map_err(StoreError::Db)?;
        tx.commit().await.map_err(db_error)?;
        Ok((existing, false))
    }

    async fn list_pending_rewards(
        &self,
        user_id: &str,
    ) -> Result<Vec<QueuedRewardRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT reward_id, user_id, plan_id, invitation_id, days_to_add, status,
                       created_at, processed_at, subscription_id
                  FROM lifecycle.queued_invitation_rewards
                 WHERE user_id = $1 AND status = 'PENDING'
                 ORDER BY created_at, reward_id
                "#,
                &[&user_id],
            )
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(map_reward_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::Db)
    }

    async fn list_user_rewards(&self, user_id: &str) -> Result<Vec<QueuedRewardRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT reward_id, user_id, plan_id, invitation_id, days_to_add, status,
                       created_at, processed_at, subscription_id
                  FROM lifecycle.queued_invitation_rewards
                 WHERE user_id = $1
                 ORDER BY created_at, reward_id
                "#,
                &[&user_id],
            )
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(map_reward_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::Db)
    }

    async fn consume_pending_rewards(
        &self,
        input: ConsumeRewardsInput,
    ) -> Result<ActivationResult, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_error)?;

        let locked = tx
            .query(
                r#"
                SELECT reward_id
                  FROM lifecycle.queued_invitation_rewards
                 WHERE reward_id = ANY($1)
                   AND user_id = $2
                   AND status = 'PENDING'
                   FOR UPDATE
                "#,
                &[&input.reward_ids, &input.user_id],
            )
            .await
            .map_err(db_error)?;
        if locked.len() != input.reward_ids.len() {
            return Err(StoreError::Conflict(
                "queued rewards are no longer pending".to_string(),
            ));
        }

        let now = input.activation.now;
        let result = activate_tx(&tx, input.activation).await?;

        tx.execute(
            r#"
            UPDATE lifecycle.queued_invitation_rewards
               SET status = 'PROCESSED', processed_at = $2, subscription_id = $3
             WHERE reward_id = ANY($1)
            "#,
            &[
                &input.reward_ids,
                &now,
                &result.subscription.subscription_id,
            ],
        )
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(result)
    }

    async fn append_task_record(&self, record: TaskExecutionRecord) -> Result<(), StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO lifecycle.task_execution_records (
                    record_id, task_id, run_id, status, at, duration_ms, error_message, details
                ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
                "#,
                &[
                    &record.record_id,
                    &record.task_id,
                    &record.run_id,
                    &record.status.as_str(),
                    &record.at,
                    &record.duration_ms,
                    &record.error_message,
                    &record.details,
                ],
            )
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn latest_task_record(
        &self,
        task_id: &str,
        statuses: &[TaskRunStatus],
    ) -> Result<Option<TaskExecutionRecord>, StoreError> {
        let statuses: Vec<&str> = statuses.iter().map(|status| status.as_str()).collect();
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT record_id, task_id, run_id, status, at, duration_ms, error_message, details
                  FROM lifecycle.task_execution_records
                 WHERE task_id = $1
                   AND status = ANY($2)
                 ORDER BY at DESC, record_id DESC
                 LIMIT 1
                "#,
                &[&task_id, &statuses],
            )
            .await
            .map_err(db_error)?;
        row.as_ref()
            .map(map_task_record_row)
            .transpose()
            .map_err(StoreError::Db)
    }

    async fn list_task_records(
        &self,
        task_id: &str,
        limit: usize,
    ) -> Result<Vec<TaskExecutionRecord>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT record_id, task_id, run_id, status, at, duration_ms, error_message, details
                  FROM lifecycle.task_execution_records
                 WHERE task_id = $1
                 ORDER BY at DESC, record_id DESC
                 LIMIT $2
                "#,
                &[&task_id, &limit_param(limit)],
            )
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(map_task_record_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::Db)
    }

    async fn try_acquire_task_lease(
        &self,
        task_id: &str,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let updated = client
            .execute(
                r#"
                INSERT INTO lifecycle.task_leases (task_id, owner, expires_at)
                VALUES ($1, $2, $4)
                ON CONFLICT (task_id) DO UPDATE
                   SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at
                 WHERE lifecycle.task_leases.owner = EXCLUDED.owner
                    OR lifecycle.task_leases.expires_at <= $3
                "#,
                &[&task_id, &owner, &now, &expires_at],
            )
            .await
            .map_err(db_error)?;
        Ok(updated == 1)
    }

    async fn release_task_lease(&self, task_id: &str, owner: &str) -> Result<(), StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                "DELETE FROM lifecycle.task_leases WHERE task_id = $1 AND owner = $2",
                &[&task_id, &owner],
            )
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn append_activity(&self, record: ActivityRecord) -> Result<(), StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO lifecycle.activity_log (
                    activity_id, user_id, kind, subscription_id, details, created_at
                ) VALUES ($1,$2,$3,$4,$5,$6)
                "#,
                &[
                    &record.activity_id,
                    &record.user_id,
                    &record.kind,
                    &record.subscription_id,
                    &record.details,
                    &record.created_at,
                ],
            )
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn list_activity(&self, user_id: &str) -> Result<Vec<ActivityRecord>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT activity_id, user_id, kind, subscription_id, details, created_at
                  FROM lifecycle.activity_log
                 WHERE user_id = $1
                 ORDER BY created_at, activity_id
                "#,
                &[&user_id],
            )
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(|row| {
                Ok(ActivityRecord {
                    activity_id: row.try_get("activity_id").map_err(|e| e.to_string())?,
                    user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
                    kind: row.try_get("kind").map_err(|e| e.to_string())?,
                    subscription_id: row.try_get("subscription_id").map_err(|e| e.to_string())?,
                    details: row.try_get("details").map_err(|e| e.to_string())?,
                    created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
                })
            })
            .collect::<Result<Vec<_>, String>>()
            .map_err(StoreError::Db)
    }
}

fn map_plan_row(row: &tokio_postgres::Row) -> Result<PlanRow, String> {
    Ok(PlanRow {
        plan_id: row.try_get("plan_id").map_err(|e| e.to_string())?,
        name: row.try_get("name").map_err(|e| e.to_string())?,
        monthly_tokens: row.try_get("monthly_tokens").map_err(|e| e.to_string())?,
        duration_days: row.try_get("duration_days").map_err(|e| e.to_string())?,
        is_free: row.try_get("is_free").map_err(|e| e.to_string())?,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
    })
}

fn map_subscription_row(row: &tokio_postgres::Row) -> Result<SubscriptionRow, String> {
    let status: String = row.try_get("status").map_err(|e| e.to_string())?;
    let provider: String = row.try_get("provider").map_err(|e| e.to_string())?;
    Ok(SubscriptionRow {
        subscription_id: row.try_get("subscription_id").map_err(|e| e.to_string())?,
        user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
        plan_id: row.try_get("plan_id").map_err(|e| e.to_string())?,
        status: SubscriptionStatus::parse(&status)
            .ok_or_else(|| format!("unknown subscription status: {status}"))?,
        period_start: row.try_get("period_start").map_err(|e| e.to_string())?,
        period_end: row.try_get("period_end").map_err(|e| e.to_string())?,
        provider: SubscriptionProvider::parse(&provider)
            .ok_or_else(|| format!("unknown subscription provider: {provider}"))?,
        cancel_at_period_end: row
            .try_get("cancel_at_period_end")
            .map_err(|e| e.to_string())?,
        next_allocation_at: row
            .try_get("next_allocation_at")
            .map_err(|e| e.to_string())?,
        allocations_granted: row
            .try_get("allocations_granted")
            .map_err(|e| e.to_string())?,
        metadata: row.try_get("metadata").map_err(|e| e.to_string())?,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
        updated_at: row.try_get("updated_at").map_err(|e| e.to_string())?,
    })
}

fn map_entry_row(row: &tokio_postgres::Row) -> Result<LedgerEntryRow, String> {
    let token_type: String = row.try_get("token_type").map_err(|e| e.to_string())?;
    Ok(LedgerEntryRow {
        entry_id: row.try_get("entry_id").map_err(|e| e.to_string())?,
        user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
        seq: row.try_get("seq").map_err(|e| e.to_string())?,
        token_type: TokenType::parse(&token_type)
            .ok_or_else(|| format!("unknown token type: {token_type}"))?,
        amount: row.try_get("amount").map_err(|e| e.to_string())?,
        balance_before: row.try_get("balance_before").map_err(|e| e.to_string())?,
        balance_after: row.try_get("balance_after").map_err(|e| e.to_string())?,
        source: row.try_get("source").map_err(|e| e.to_string())?,
        expires_at: row.try_get("expires_at").map_err(|e| e.to_string())?,
        subscription_ref: row.try_get("subscription_ref").map_err(|e| e.to_string())?,
        compensates: row.try_get("compensates").map_err(|e| e.to_string())?,
        metadata: row.try_get("metadata").map_err(|e| e.to_string())?,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
    })
}

fn map_reward_row(row: &tokio_postgres::Row) -> Result<QueuedRewardRow, String> {
    let status: String = row.try_get("status").map_err(|e| e.to_string())?;
    Ok(QueuedRewardRow {
        reward_id: row.try_get("reward_id").map_err(|e| e.to_string())?,
        user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
        plan_id: row.try_get("plan_id").map_err(|e| e.to_string())?,
        invitation_id: row.try_get("invitation_id").map_err(|e| e.to_string())?,
        days_to_add: row.try_get("days_to_add").map_err(|e| e.to_string())?,
        status: QueuedRewardStatus::parse(&status)
            .ok_or_else(|| format!("unknown reward status: {status}"))?,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
        processed_at: row.try_get("processed_at").map_err(|e| e.to_string())?,
        subscription_id: row.try_get("subscription_id").map_err(|e| e.to_string())?,
    })
}

fn map_task_record_row(row: &tokio_postgres::Row) -> Result<TaskExecutionRecord, String> {
    let status: String = row.try_get("status").map_err(|e| e.to_string())?;
    Ok(TaskExecutionRecord {
        record_id: row.try_get("record_id").map_err(|e| e.to_string())?,
        task_id: row.try_get("task_id").map_err(|e| e.to_string())?,
        run_id: row.try_get("run_id").map_err(|e| e.to_string())?,
        status: TaskRunStatus::parse(&status)
            .ok_or_else(|| format!("unknown task status: {status}"))?,
        at: row.try_get("at").map_err(|e| e.to_string())?,
        duration_ms: row.try_get("duration_ms").map_err(|e| e.to_string())?,
        error_message: row.try_get("error_message").map_err(|e| e.to_string())?,
        details: row.try_get("details").map_err(|e| e.to_string())?,
    })
}
