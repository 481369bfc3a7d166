use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::error::DomainError;
use crate::jobs::now_ms;
use crate::ports::gatherings::GatheringRepository;
use crate::ports::notifications::NotificationSender;
use crate::util::uuid_v7_without_dashes;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Invitation,
    Reminder,
    Results,
}

impl FromStr for NotificationType {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "invitation" => Ok(Self::Invitation),
            "reminder" => Ok(Self::Reminder),
            "results" => Ok(Self::Results),
            _ => Err(DomainError::Validation("invalid notification type".into())),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    #[default]
    Email,
    Sms,
}

impl FromStr for NotificationChannel {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "" | "email" => Ok(Self::Email),
            "sms" => Ok(Self::Sms),
            _ => Err(DomainError::Validation("invalid notification channel".into())),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub notification_id: String,
    pub gathering_id: String,
    pub owner_id: i64,
    pub notification_type: NotificationType,
    pub channel: NotificationChannel,
    pub sent_at_ms: i64,
}

#[derive(Clone)]
pub struct NotificationService {
    gatherings: Arc<dyn GatheringRepository>,
    sender: Arc<dyn NotificationSender>,
}

impl NotificationService {
    pub fn new(gatherings: Arc<dyn GatheringRepository>, sender: Arc<dyn NotificationSender>) -> Self {
        Self { gatherings, sender }
    }

    /// Sends one notification per owner. Delivery failures are dropped; the
    /// returned list holds what went out.
    pub async fn send(
        &self,
        association_id: i64,
        gathering_id: &str,
        notification_type: NotificationType,
        channel: NotificationChannel,
        owner_ids: &[i64],
    ) -> DomainResult<Vec<Notification>> {
        self.gatherings
            .get(association_id, gathering_id)
            .await?
            .ok_or(DomainError::NotFound)?;

        let mut sent = Vec::with_capacity(owner_ids.len());
        for &owner_id in owner_ids {
            let notification = Notification {
                notification_id: uuid_v7_without_dashes(),
                gathering_id: gathering_id.to_string(),
                owner_id,
                notification_type,
                channel,
                sent_at_ms: now_ms(),
            };
            match self.sender.send(&notification).await {
                Ok(()) => sent.push(notification),
                Err(err) => {
                    tracing::debug!(gathering_id, owner_id, error = %err, "notification dropped");
                }
            }
        }
        Ok(sent)
    }
}
