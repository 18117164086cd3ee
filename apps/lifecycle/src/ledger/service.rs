use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::clock::Clock;
use crate::error::{LifecycleError, map_store_error, required};
use crate::ledger::types::{
    BalanceView, ChainVerification, ExpiredTokenSweepFailure, ExpiredTokenSweepSummary,
    ExpiringTokensSummary, LEDGER_BALANCE_SCHEMA_V1, LEDGER_EXPIRING_SUMMARY_SCHEMA_V1,
    LedgerEntryRow, SOURCE_SUBSCRIPTION_CLEAR, SOURCE_TOKEN_EXPIRY, TokenBreakdown, TokenType,
    UserExpiringTokens,
};
use crate::store::{ClearTokensInput, LedgerAppendInput, LifecycleStore};

const EXPIRY_SWEEP_PAGE_SIZE: usize = 500;
const MAX_EXPIRING_WINDOW_DAYS: i64 = 366;

/// Append-only token ledger with a cached per-user balance.
#[derive(Clone)]
pub struct TokenLedger {
    store: Arc<dyn LifecycleStore>,
    clock: Arc<dyn Clock>,
}

impl TokenLedger {
    pub fn new(store: Arc<dyn LifecycleStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Credits `amount` tokens. SUBSCRIPTION credits without an explicit expiry
    /// inherit the period end of the user's current active subscription and are
    /// tagged with it so a later clear can find them. Other credit types never
    /// expire, so passing an expiry for them is rejected.
    pub async fn credit(
        &self,
        user_id: &str,
        amount: i64,
        token_type: TokenType,
        expires_at: Option<DateTime<Utc>>,
        metadata: Value,
    ) -> Result<LedgerEntryRow, LifecycleError> {
        let user_id = required("user_id", user_id)?;
        if amount <= 0 {
            return Err(LifecycleError::InvalidRequest(
                "credit amount must be positive".to_string(),
            ));
        }
        if token_type == TokenType::Debit {
            return Err(LifecycleError::InvalidRequest(
                "DEBIT is not a credit type".to_string(),
            ));
        }
        if expires_at.is_some() && !token_type.expires_with_subscription() {
            return Err(LifecycleError::InvalidRequest(format!(
                "{} tokens do not expire",
                token_type.as_str()
            )));
        }

        let now = self.clock.now();
        let (expires_at, subscription_ref) = if token_type.expires_with_subscription() {
            let current = self
                .store
                .list_active_subscriptions(&user_id, now)
                .await
                .map_err(map_store_error)?
                .into_iter()
                .max_by_key(|subscription| subscription.period_end);
            match current {
                Some(subscription) => (
                    expires_at.or(Some(subscription.period_end)),
                    Some(subscription.subscription_id),
                ),
                None => {
                    tracing::warn!(
                        user_id = %user_id,
                        amount,
                        "subscription tokens credited without an active subscription"
                    );
                    (expires_at, None)
                }
            }
        } else {
            (None, None)
        };

        let entry = self
            .store
            .append_ledger_entry(LedgerAppendInput {
                user_id,
                token_type,
                amount,
                source: source_from_metadata(&metadata, "credit"),
                expires_at,
                subscription_ref,
                metadata,
                now,
            })
            .await
            .map_err(map_store_error)?;

        tracing::info!(
            user_id = %entry.user_id,
            token_type = token_type.as_str(),
            amount,
            balance_after = entry.balance_after,
            "ledger credit appended"
        );
        Ok(entry)
    }

    /// Debits `amount` tokens from the pooled balance. Nothing is written when
    /// the balance cannot cover it.
    pub async fn debit(
        &self,
        user_id: &str,
        amount: i64,
        source: &str,
        metadata: Value,
    ) -> Result<LedgerEntryRow, LifecycleError> {
        let user_id = required("user_id", user_id)?;
        if amount <= 0 {
            return Err(LifecycleError::InvalidRequest(
                "debit amount must be positive".to_string(),
            ));
        }
        let source = source.trim();
        if source.is_empty() {
            return Err(LifecycleError::InvalidRequest(
                "debit source is required".to_string(),
            ));
        }

        let entry = self
            .store
            .append_ledger_entry(LedgerAppendInput {
                user_id,
                token_type: TokenType::Debit,
                amount: -amount,
                source: source.to_string(),
                expires_at: None,
                subscription_ref: None,
                metadata,
                now: self.clock.now(),
            })
            .await
            .map_err(map_store_error)?;

        tracing::info!(
            user_id = %entry.user_id,
            amount,
            source = %entry.source,
            balance_after = entry.balance_after,
            "ledger debit appended"
        );
        Ok(entry)
    }

    pub async fn get_balance(&self, user_id: &str) -> Result<BalanceView, LifecycleError> {
        let user_id = required("user_id", user_id)?;
        let total = self
            .store
            .get_cached_balance(&user_id)
            .await
            .map_err(map_store_error)?;
        let entries = self
            .store
            .list_ledger_entries(&user_id)
            .await
            .map_err(map_store_error)?;

        let retired: HashSet<&str> = entries
            .iter()
            .flat_map(|entry| entry.compensates.iter().map(String::as_str))
            .collect();
        let mut breakdown = TokenBreakdown::default();
        for entry in entries
            .iter()
            .filter(|entry| entry.is_credit() && !retired.contains(entry.entry_id.as_str()))
        {
            breakdown.add(entry.token_type, entry.amount);
        }

        Ok(BalanceView {
            schema: LEDGER_BALANCE_SCHEMA_V1.to_string(),
            user_id,
            total,
            breakdown,
            computed_at: self.clock.now(),
        })
    }

    /// Entries in creation order.
    pub async fn list_entries(&self, user_id: &str) -> Result<Vec<LedgerEntryRow>, LifecycleError> {
        let user_id = required("user_id", user_id)?;
        self.store
            .list_ledger_entries(&user_id)
            .await
            .map_err(map_store_error)
    }

    /// Standalone clear for callers outside a status transition. Status
    /// transitions clear inside their own transaction instead.
    pub async fn clear_subscription_tokens(
        &self,
        user_id: &str,
        subscription_id: &str,
    ) -> Result<Option<LedgerEntryRow>, LifecycleError> {
        let user_id = required("user_id", user_id)?;
        let cleared = self
            .store
            .clear_subscription_tokens(ClearTokensInput {
                user_id,
                subscription_id: subscription_id.to_string(),
                source: SOURCE_SUBSCRIPTION_CLEAR.to_string(),
                now: self.clock.now(),
            })
            .await
            .map_err(map_store_error)?;

        if let Some(entry) = cleared.as_ref() {
            tracing::info!(
                user_id = %entry.user_id,
                subscription_id,
                cleared = entry.amount.saturating_neg(),
                "subscription tokens cleared"
            );
        }
        Ok(cleared)
    }

    /// Safety net for SUBSCRIPTION credits whose expiry passed without their
    /// subscription being cleared. Each credit is compensated at most once.
    pub async fn sweep_expired(&self) -> Result<ExpiredTokenSweepSummary, LifecycleError> {
        let now = self.clock.now();
        let mut summary = ExpiredTokenSweepSummary {
            swept_at: now,
            scanned: 0,
            compensated: 0,
            compensated_tokens: 0,
            failures: Vec::new(),
        };
        let mut seen: HashSet<String> = HashSet::new();

        loop {
            let page = self
                .store
                .list_expired_uncompensated(now, EXPIRY_SWEEP_PAGE_SIZE)
                .await
                .map_err(map_store_error)?;
            let page_len = page.len();
            let fresh: Vec<LedgerEntryRow> = page
                .into_iter()
                .filter(|entry| seen.insert(entry.entry_id.clone()))
                .collect();
            if fresh.is_empty() {
                break;
            }

            for entry in fresh {
                summary.scanned += 1;
                match self
                    .store
                    .compensate_expired_entry(&entry.entry_id, SOURCE_TOKEN_EXPIRY, now)
                    .await
                {
                    Ok(Some(compensation)) => {
                        summary.compensated += 1;
                        summary.compensated_tokens = summary
                            .compensated_tokens
                            .saturating_add(compensation.amount.saturating_neg());
                    }
                    Ok(None) => {}
                    Err(error) => {
                        tracing::warn!(
                            entry_id = %entry.entry_id,
                            user_id = %entry.user_id,
                            reason = %error,
                            "expired token compensation failed"
                        );
                        summary.failures.push(ExpiredTokenSweepFailure {
                            entry_id: entry.entry_id,
                            user_id: entry.user_id,
                            error: error.to_string(),
                        });
                    }
                }
            }

            if page_len < EXPIRY_SWEEP_PAGE_SIZE {
                break;
            }
        }

        tracing::info!(
            scanned = summary.scanned,
            compensated = summary.compensated,
            compensated_tokens = summary.compensated_tokens,
            failures = summary.failures.len(),
            "expired token sweep finished"
        );
        Ok(summary)
    }

    pub async fn get_expiring_tokens_summary(
        &self,
        days: i64,
    ) -> Result<ExpiringTokensSummary, LifecycleError> {
        if !(1..=MAX_EXPIRING_WINDOW_DAYS).contains(&days) {
            return Err(LifecycleError::InvalidRequest(format!(
                "days must be between 1 and {MAX_EXPIRING_WINDOW_DAYS}"
            )));
        }
        let from = self.clock.now();
        let until = from + Duration::days(days);
        let entries = self
            .store
            .list_expiring_entries(from, until)
            .await
            .map_err(map_store_error)?;

        let mut per_user: BTreeMap<String, UserExpiringTokens> = BTreeMap::new();
        let mut total_tokens = 0_i64;
        for entry in &entries {
            let Some(expires_at) = entry.expires_at else {
                continue;
            };
            total_tokens = total_tokens.saturating_add(entry.amount);
            per_user
                .entry(entry.user_id.clone())
                .and_modify(|user| {
                    user.tokens = user.tokens.saturating_add(entry.amount);
                    user.earliest_expires_at = user.earliest_expires_at.min(expires_at);
                })
                .or_insert_with(|| UserExpiringTokens {
                    user_id: entry.user_id.clone(),
                    tokens: entry.amount,
                    earliest_expires_at: expires_at,
                });
        }

        Ok(ExpiringTokensSummary {
            schema: LEDGER_EXPIRING_SUMMARY_SCHEMA_V1.to_string(),
            window_days: days,
            from,
            until,
            entry_count: entries.len() as u64,
            user_count: per_user.len() as u64,
            total_tokens,
            users: per_user.into_values().collect(),
        })
    }

    /// Replays the user's entries from zero and compares against the cache.
    pub async fn verify_chain(&self, user_id: &str) -> Result<ChainVerification, LifecycleError> {
        let user_id = required("user_id", user_id)?;
        let entries = self
            .store
            .list_ledger_entries(&user_id)
            .await
            .map_err(map_store_error)?;
        let cached_balance = self
            .store
            .get_cached_balance(&user_id)
            .await
            .map_err(map_store_error)?;

        let mut running = 0_i64;
        let mut last_seq = 0_i64;
        let mut first_break_entry_id = None;
        for entry in &entries {
            let chained = entry.balance_before == running
                && entry.balance_after == entry.balance_before.saturating_add(entry.amount)
                && entry.balance_after >= 0
                && entry.seq > last_seq;
            if !chained && first_break_entry_id.is_none() {
                first_break_entry_id = Some(entry.entry_id.clone());
            }
            running = running.saturating_add(entry.amount);
            last_seq = entry.seq;
        }

        let consistent = first_break_entry_id.is_none() && running == cached_balance;
        if !consistent {
            tracing::error!(
                user_id = %user_id,
                replayed_balance = running,
                cached_balance,
                "ledger chain verification failed"
            );
        }
        Ok(ChainVerification {
            user_id,
            entry_count: entries.len() as u64,
            replayed_balance: running,
            cached_balance,
            consistent,
            first_break_entry_id,
        })
    }
}

fn source_from_metadata(metadata: &Value, fallback: &str) -> String {
    metadata
        .get("source")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(fallback)
        .to_string()
}
