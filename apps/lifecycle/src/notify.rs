use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TEMPLATE_SUBSCRIPTION_EXPIRED: &str = "subscription_expired";
pub const TEMPLATE_SUBSCRIPTION_CANCELED: &str = "subscription_canceled";
pub const TEMPLATE_DOWNGRADED_TO_FREE: &str = "downgraded_to_free";
pub const TEMPLATE_REWARD_QUEUED: &str = "invitation_reward_queued";
pub const TEMPLATE_REWARD_ACTIVATED: &str = "invitation_reward_activated";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Normal,
    High,
}

impl NotificationPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(
        &self,
        user_id: &str,
        template: &str,
        data: Value,
        priority: NotificationPriority,
    ) -> anyhow::Result<()>;
}

/// Writes notifications to the log. Default sender when no delivery channel is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotificationSender;

#[async_trait]
impl NotificationSender for TracingNotificationSender {
    async fn send(
        &self,
        user_id: &str,
        template: &str,
        data: Value,
        priority: NotificationPriority,
    ) -> anyhow::Result<()> {
        tracing::info!(
            user_id,
            template,
            priority = priority.as_str(),
            data = %data,
            "notification"
        );
        Ok(())
    }
}

pub fn tracing_sender() -> Arc<dyn NotificationSender> {
    Arc::new(TracingNotificationSender)
}

/// Fire-and-forget front for a [`NotificationSender`]. Delivery runs on its own
/// task and failures are only logged.
#[derive(Clone)]
pub struct Notifier {
    sender: Arc<dyn NotificationSender>,
}

impl Notifier {
    pub fn new(sender: Arc<dyn NotificationSender>) -> Self {
        Self { sender }
    }

    pub fn notify(
        &self,
        user_id: &str,
        template: &'static str,
        data: Value,
        priority: NotificationPriority,
    ) {
        let sender = self.sender.clone();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            if let Err(error) = sender.send(&user_id, template, data, priority).await {
                tracing::warn!(
                    user_id = %user_id,
                    template,
                    reason = %error,
                    "notification delivery failed"
                );
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct SentNotification {
        pub user_id: String,
        pub template: String,
        pub data: Value,
        pub priority: NotificationPriority,
    }

    #[derive(Default)]
    pub(crate) struct RecordingSender {
        pub sent: Mutex<Vec<SentNotification>>,
        pub fail: bool,
    }

    impl RecordingSender {
        pub(crate) fn templates(&self) -> Vec<String> {
            self.sent
                .lock()
                .map(|sent| sent.iter().map(|item| item.template.clone()).collect())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl NotificationSender for RecordingSender {
        async fn send(
            &self,
            user_id: &str,
            template: &str,
            data: Value,
            priority: NotificationPriority,
        ) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("mailer offline");
            }
            if let Ok(mut sent) = self.sent.lock() {
                sent.push(SentNotification {
                    user_id: user_id.to_string(),
                    template: template.to_string(),
                    data,
                    priority,
                });
            }
            Ok(())
        }
    }

    /// Lets spawned deliveries run on the current-thread test runtime.
    pub(crate) async fn drain() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }
}
