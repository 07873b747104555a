//! User notifications about campaign status changes

use async_trait::async_trait;
use mailcast_common::types::{CampaignId, UserId};
use mailcast_common::Result;
use mailcast_storage::models::{CampaignStatus, NewNotification, NotificationKind};
use mailcast_storage::repository::NotificationRepository;
use std::sync::Arc;
use tracing::info;

/// Notification emitter
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: UserId, title: &str, message: &str, link: &str) -> Result<()>;
}

/// Persists campaign notifications for the owning user
pub struct StoreNotifier {
    notifications: Arc<dyn NotificationRepository>,
}

impl StoreNotifier {
    pub fn new(notifications: Arc<dyn NotificationRepository>) -> Self {
        Self { notifications }
    }
}

#[async_trait]
impl Notifier for StoreNotifier {
    async fn notify(&self, user_id: UserId, title: &str, message: &str, link: &str) -> Result<()> {
        self.notifications
            .create(NewNotification {
                user_id,
                title: title.to_string(),
                message: message.to_string(),
                kind: NotificationKind::Campaign,
                link: Some(link.to_string()),
            })
            .await?;
        Ok(())
    }
}

/// Writes notifications to the log only
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user_id: UserId, title: &str, message: &str, link: &str) -> Result<()> {
        info!(user_id = %user_id, title, message, link, "notification");
        Ok(())
    }
}

/// Title and message announcing that a campaign entered `status`
pub fn status_message(campaign_name: &str, status: CampaignStatus) -> (&'static str, String) {
    match status {
        CampaignStatus::Sent => (
            "Campaign Sent",
            format!(
                "Your campaign \"{}\" has been sent and is now being delivered.",
                campaign_name
            ),
        ),
        CampaignStatus::Completed => (
            "Campaign Completed",
            format!(
                "Your campaign \"{}\" has been successfully completed.",
                campaign_name
            ),
        ),
        CampaignStatus::Failed => (
            "Campaign Failed",
            format!(
                "There was an issue with your campaign \"{}\". Please check the campaign details.",
                campaign_name
            ),
        ),
        CampaignStatus::Cancelled => (
            "Campaign Cancelled",
            format!("Your campaign \"{}\" has been cancelled.", campaign_name),
        ),
        CampaignStatus::Sending => (
            "Campaign In Progress",
            format!("Your campaign \"{}\" is now in progress.", campaign_name),
        ),
        other => (
            "Campaign Status Updated",
            format!(
                "Your campaign \"{}\" status has been updated to {}.",
                campaign_name, other
            ),
        ),
    }
}

pub fn campaign_link(campaign_id: CampaignId) -> String {
    format!("/campaigns/{}", campaign_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailcast_storage::repository::InMemoryNotificationRepository;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    #[test]
    fn test_status_titles() {
        assert_eq!(status_message("Launch", CampaignStatus::Sent).0, "Campaign Sent");
        assert_eq!(
            status_message("Launch", CampaignStatus::Sending).0,
            "Campaign In Progress"
        );
        let (title, message) = status_message("Launch", CampaignStatus::Ongoing);
        assert_eq!(title, "Campaign Status Updated");
        assert!(message.ends_with("updated to ongoing."));
    }

    #[tokio::test]
    async fn test_store_notifier_persists_campaign_notification() {
        let repo = Arc::new(InMemoryNotificationRepository::new());
        let notifier = StoreNotifier::new(repo.clone());
        let user = Uuid::new_v4();
        let campaign = Uuid::new_v4();

        notifier
            .notify(user, "Campaign Sent", "sent", &campaign_link(campaign))
            .await
            .unwrap();

        let stored = repo.all().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].kind, "campaign");
        assert_eq!(stored[0].link, Some(format!("/campaigns/{}", campaign)));
        assert!(!stored[0].read);
    }
}
