use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SUBSCRIPTION_SWEEP_REPORT_SCHEMA_V1: &str = "lifecycle.subscription.sweep_report.v1";
pub const MONTHLY_ALLOCATION_REPORT_SCHEMA_V1: &str = "lifecycle.subscription.allocation_report.v1";

pub const ACTIVITY_SUBSCRIPTION_ACTIVATED: &str = "subscription_activated";
pub const ACTIVITY_SUBSCRIPTION_EXPIRED: &str = "subscription_expired";
pub const ACTIVITY_SUBSCRIPTION_CANCELED: &str = "subscription_canceled";
pub const ACTIVITY_CANCEL_SCHEDULED: &str = "subscription_cancel_scheduled";
pub const ACTIVITY_DOWNGRADED_TO_FREE: &str = "downgraded_to_free";
pub const ACTIVITY_MONTHLY_ALLOCATION: &str = "monthly_allocation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Active,
    Expired,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Expired => "EXPIRED",
            Self::Canceled => "CANCELED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => Some(Self::Active),
            "EXPIRED" => Some(Self::Expired),
            "CANCELED" | "CANCELLED" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionProvider {
    System,
    Trial,
    Invitation,
    Stripe,
}

impl SubscriptionProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Trial => "trial",
            Self::Invitation => "invitation",
            Self::Stripe => "stripe",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "system" => Some(Self::System),
            "trial" => Some(Self::Trial),
            "invitation" => Some(Self::Invitation),
            "stripe" => Some(Self::Stripe),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRow {
    pub plan_id: String,
    pub name: String,
    /// Tokens granted per allocation period.
    pub monthly_tokens: i64,
    /// Default length of a purchased period.
    pub duration_days: i64,
    pub is_free: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRow {
    pub subscription_id: String,
    pub user_id: String,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub provider: SubscriptionProvider,
    pub cancel_at_period_end: bool,
    /// Next monthly allocation for periods longer than one allocation window.
    pub next_allocation_at: Option<DateTime<Utc>>,
    pub allocations_granted: i32,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionRow {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active && self.period_end > now
    }

    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active && self.period_end <= now
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub activity_id: String,
    pub user_id: String,
    pub kind: String,
    pub subscription_id: Option<String>,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepItemOutcome {
    ExpiredAndDowngraded,
    Error,
}

impl SweepItemOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExpiredAndDowngraded => "expired_and_downgraded",
            Self::Error => "error",
        }
    }
}

/// What the sweep did after the subscription left ACTIVE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackAction {
    /// Another active paid subscription remains.
    None,
    FreePlanCreated,
    FreePlanReused,
    InvitationRewardActivated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepItemResult {
    pub subscription_id: String,
    pub user_id: String,
    pub outcome: SweepItemOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_status: Option<SubscriptionStatus>,
    pub tokens_cleared: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_subscription_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub schema: String,
    pub ran_at: DateTime<Utc>,
    pub results: Vec<SweepItemResult>,
}

impl SweepReport {
    pub fn expired_count(&self) -> usize {
        self.results
            .iter()
            .filter(|item| item.outcome == SweepItemOutcome::ExpiredAndDowngraded)
            .count()
    }

    pub fn error_count(&self) -> usize {
        self.results
            .iter()
            .filter(|item| item.outcome == SweepItemOutcome::Error)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyAllocationReport {
    pub schema: String,
    pub ran_at: DateTime<Utc>,
    pub allocated: u64,
    pub allocated_tokens: i64,
    pub skipped: u64,
    pub failures: Vec<AllocationFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationFailure {
    pub subscription_id: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct ActivateSubscriptionRequest {
    pub user_id: String,
    pub plan_id: String,
    pub provider: SubscriptionProvider,
    /// Overrides the plan's default duration.
    pub duration_days: Option<i64>,
    pub metadata: Value,
}

#[derive(Debug, Clone)]
pub struct ActivatedSubscription {
    pub subscription: SubscriptionRow,
    pub granted_tokens: i64,
    pub superseded_subscription_id: Option<String>,
}
