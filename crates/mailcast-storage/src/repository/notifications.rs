//! Notification repository

use async_trait::async_trait;
use chrono::Utc;
use mailcast_common::types::UserId;
use mailcast_common::Result;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::{db_err, DatabasePool};
use crate::models::{NewNotification, Notification};

/// Notification repository trait
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn create(&self, input: NewNotification) -> Result<Notification>;

    /// Most recent notifications first
    async fn list_by_user(&self, user_id: UserId, limit: i64) -> Result<Vec<Notification>>;
}

/// Database notification repository
pub struct DbNotificationRepository {
    pool: DatabasePool,
}

impl DbNotificationRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationRepository for DbNotificationRepository {
    async fn create(&self, input: NewNotification) -> Result<Notification> {
        sqlx::query_as::<_, Notification>(
            r#"
            INSERT INTO notifications (id, user_id, title, message, kind, link)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.user_id)
        .bind(&input.title)
        .bind(&input.message)
        .bind(input.kind.to_string())
        .bind(&input.link)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn list_by_user(&self, user_id: UserId, limit: i64) -> Result<Vec<Notification>> {
        sqlx::query_as::<_, Notification>(
            "SELECT * FROM notifications WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }
}

/// In-memory notification repository
#[derive(Default)]
pub struct InMemoryNotificationRepository {
    notifications: RwLock<Vec<Notification>>,
}

impl InMemoryNotificationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored notification in creation order
    pub async fn all(&self) -> Vec<Notification> {
        self.notifications.read().await.clone()
    }
}

#[async_trait]
impl NotificationRepository for InMemoryNotificationRepository {
    async fn create(&self, input: NewNotification) -> Result<Notification> {
        let notification = Notification {
            id: Uuid::now_v7(),
            user_id: input.user_id,
            title: input.title,
            message: input.message,
            kind: input.kind.to_string(),
            link: input.link,
            read: false,
            created_at: Utc::now(),
        };
        self.notifications.write().await.push(notification.clone());
        Ok(notification)
    }

    async fn list_by_user(&self, user_id: UserId, limit: i64) -> Result<Vec<Notification>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .notifications
            .read()
            .await
            .iter()
            .rev()
            .filter(|n| n.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NotificationKind;

    #[tokio::test]
    async fn test_list_by_user_newest_first() {
        let repo = InMemoryNotificationRepository::new();
        let user = Uuid::new_v4();
        let other = Uuid::new_v4();

        for (owner, title) in [(user, "first"), (other, "noise"), (user, "second")] {
            repo.create(NewNotification {
                user_id: owner,
                title: title.to_string(),
                message: String::new(),
                kind: NotificationKind::Campaign,
                link: None,
            })
            .await
            .unwrap();
        }

        let listed = repo.list_by_user(user, 10).await.unwrap();
        let titles: Vec<_> = listed.iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec!["second", "first"]);
        assert_eq!(listed[0].kind, "campaign");
        assert!(!listed[0].read);

        assert_eq!(repo.list_by_user(user, 1).await.unwrap().len(), 1);
    }
}
