use crate::DomainResult;
use crate::notifications::Notification;

use super::BoxFuture;

pub trait NotificationSender: Send + Sync {
    fn send(&self, notification: &Notification) -> BoxFuture<'_, DomainResult<()>>;
}
