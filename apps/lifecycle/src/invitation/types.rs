use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::subscription::types::SubscriptionRow;

pub const ACTIVITY_REWARD_QUEUED: &str = "invitation_reward_queued";
pub const ACTIVITY_REWARD_GRANTED: &str = "invitation_reward_granted";
pub const ACTIVITY_REWARDS_RECONCILED: &str = "invitation_rewards_reconciled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueuedRewardStatus {
    Pending,
    Processed,
}

impl QueuedRewardStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processed => "PROCESSED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "PROCESSED" => Some(Self::Processed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedRewardRow {
    pub reward_id: String,
    pub user_id: String,
    pub plan_id: String,
    pub invitation_id: String,
    pub days_to_add: i64,
    pub status: QueuedRewardStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Subscription the reward was merged into once processed.
    pub subscription_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    Granted { subscription: SubscriptionRow },
    Queued { reward: QueuedRewardRow },
}

impl EnqueueOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Granted { .. } => "granted",
            Self::Queued { .. } => "queued",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconciledRewards {
    pub subscription: SubscriptionRow,
    pub reward_ids: Vec<String>,
    pub total_days: i64,
    pub granted_tokens: i64,
}
