use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const LEDGER_BALANCE_SCHEMA_V1: &str = "lifecycle.ledger.balance.v1";
pub const LEDGER_EXPIRING_SUMMARY_SCHEMA_V1: &str = "lifecycle.ledger.expiring_summary.v1";

pub const SOURCE_SUBSCRIPTION_CLEAR: &str = "subscription_clear";
pub const SOURCE_TOKEN_EXPIRY: &str = "token_expiry";
pub const SOURCE_SUBSCRIPTION_GRANT: &str = "subscription_grant";
pub const SOURCE_MONTHLY_ALLOCATION: &str = "monthly_allocation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenType {
    Subscription,
    Purchased,
    Activity,
    Referral,
    Bonus,
    Debit,
}

impl TokenType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Subscription => "SUBSCRIPTION",
            Self::Purchased => "PURCHASED",
            Self::Activity => "ACTIVITY",
            Self::Referral => "REFERRAL",
            Self::Bonus => "BONUS",
            Self::Debit => "DEBIT",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "SUBSCRIPTION" => Some(Self::Subscription),
            "PURCHASED" => Some(Self::Purchased),
            "ACTIVITY" => Some(Self::Activity),
            "REFERRAL" => Some(Self::Referral),
            "BONUS" => Some(Self::Bonus),
            "DEBIT" => Some(Self::Debit),
            _ => None,
        }
    }

    /// Only subscription-bound tokens carry an implicit expiration.
    pub fn expires_with_subscription(self) -> bool {
        matches!(self, Self::Subscription)
    }
}

/// Immutable ledger row. `balance_after == balance_before + amount` always holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntryRow {
    pub entry_id: String,
    pub user_id: String,
    /// Per-user sequence number, strictly increasing in creation order.
    pub seq: i64,
    pub token_type: TokenType,
    pub amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub source: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub subscription_ref: Option<String>,
    /// Entries this row compensates (debits written by clears and expiry sweeps).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compensates: Vec<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntryRow {
    pub fn is_credit(&self) -> bool {
        self.amount > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBreakdown {
    pub subscription: i64,
    pub purchased: i64,
    pub activity: i64,
    pub referral: i64,
    pub bonus: i64,
}

impl TokenBreakdown {
    pub fn add(&mut self, token_type: TokenType, amount: i64) {
        let slot = match token_type {
            TokenType::Subscription => &mut self.subscription,
            TokenType::Purchased => &mut self.purchased,
            TokenType::Activity => &mut self.activity,
            TokenType::Referral => &mut self.referral,
            TokenType::Bonus => &mut self.bonus,
            TokenType::Debit => return,
        };
        *slot = slot.saturating_add(amount);
    }
}

/// Reporting view of a user's tokens.
///
/// `total` is the cached pooled balance. `breakdown` aggregates positive,
/// uncompensated credits per type and is not an authoritative sub-balance:
/// debits are never attributed to a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceView {
    pub schema: String,
    pub user_id: String,
    pub total: i64,
    pub breakdown: TokenBreakdown,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserExpiringTokens {
    pub user_id: String,
    pub tokens: i64,
    pub earliest_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiringTokensSummary {
    pub schema: String,
    pub window_days: i64,
    pub from: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub entry_count: u64,
    pub user_count: u64,
    pub total_tokens: i64,
    pub users: Vec<UserExpiringTokens>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiredTokenSweepSummary {
    pub swept_at: DateTime<Utc>,
    pub scanned: u64,
    pub compensated: u64,
    pub compensated_tokens: i64,
    pub failures: Vec<ExpiredTokenSweepFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiredTokenSweepFailure {
    pub entry_id: String,
    pub user_id: String,
    pub error: String,
}

/// Result of replaying a user's ledger from zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub user_id: String,
    pub entry_count: u64,
    pub replayed_balance: i64,
    pub cached_balance: i64,
    pub consistent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_break_entry_id: Option<String>,
}
