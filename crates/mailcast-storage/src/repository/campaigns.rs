//! Campaign repository

use async_trait::async_trait;
use chrono::Utc;
use mailcast_common::types::CampaignId;
use mailcast_common::{Error, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::{db_err, DatabasePool};
use crate::models::{
    Campaign, CampaignMetrics, CampaignStatus, MetricKind, NewCampaign, StatusChange,
};

/// Campaign repository trait
#[async_trait]
pub trait CampaignRepository: Send + Sync {
    async fn create(&self, input: NewCampaign) -> Result<Campaign>;

    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>>;

    async fn list_by_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>>;

    /// Atomically move the campaign to `to` if its current status is one of
    /// `from`. Returns `None` when the campaign is missing or not in an
    /// allowed source status.
    async fn transition_status(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<Option<StatusChange>>;

    /// Atomically add one to a counter. Campaigns whose metrics are frozen
    /// are left untouched; returns whether the increment was applied.
    async fn increment_metric(&self, id: CampaignId, kind: MetricKind) -> Result<bool>;
}

fn frozen_statuses() -> Vec<String> {
    CampaignStatus::ALL
        .into_iter()
        .filter(|s| s.metrics_frozen())
        .map(|s| s.to_string())
        .collect()
}

/// Timestamps written alongside a status change
fn transition_timestamps(
    to: CampaignStatus,
) -> (Option<chrono::DateTime<Utc>>, Option<chrono::DateTime<Utc>>) {
    let now = Utc::now();
    let sent_at = (to == CampaignStatus::Sent).then_some(now);
    let completed_at = matches!(
        to,
        CampaignStatus::Completed | CampaignStatus::Failed | CampaignStatus::Cancelled
    )
    .then_some(now);
    (sent_at, completed_at)
}

/// Database campaign repository
pub struct DbCampaignRepository {
    pool: DatabasePool,
}

impl DbCampaignRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CampaignRepository for DbCampaignRepository {
    async fn create(&self, input: NewCampaign) -> Result<Campaign> {
        let id = Uuid::now_v7();
        let status = input.status.unwrap_or(CampaignStatus::Draft);

        sqlx::query_as::<_, Campaign>(
            r#"
            INSERT INTO campaigns (
                id, user_id, name, subject, from_address, segment_id, segment_name,
                recipient_count, text_body, html_body, attachments, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(input.user_id)
        .bind(&input.name)
        .bind(&input.subject)
        .bind(&input.from_address)
        .bind(&input.segment_id)
        .bind(&input.segment_name)
        .bind(input.recipient_count)
        .bind(&input.text_body)
        .bind(&input.html_body)
        .bind(&input.attachments)
        .bind(status.to_string())
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn list_by_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            "SELECT * FROM campaigns WHERE status = $1 ORDER BY created_at ASC",
        )
        .bind(status.to_string())
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn transition_status(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<Option<StatusChange>> {
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM campaigns WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;

        let Some((current,)) = current else {
            return Ok(None);
        };
        let previous: CampaignStatus = current.parse().map_err(Error::Internal)?;
        if !from.contains(&previous) {
            return Ok(None);
        }

        let (sent_at, completed_at) = transition_timestamps(to);
        let campaign = sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE campaigns SET
                status = $2,
                sent_at = COALESCE($3, sent_at),
                completed_at = COALESCE($4, completed_at),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(to.to_string())
        .bind(sent_at)
        .bind(completed_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        Ok(Some(StatusChange { previous, campaign }))
    }

    async fn increment_metric(&self, id: CampaignId, kind: MetricKind) -> Result<bool> {
        // Column names come from a closed enum, never from input.
        let sql = format!(
            "UPDATE campaigns SET {col} = {col} + 1, updated_at = NOW() \
             WHERE id = $1 AND status <> ALL($2)",
            col = kind.column()
        );

        let result = sqlx::query(&sql)
            .bind(id)
            .bind(frozen_statuses())
            .execute(self.pool.pool())
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }
}

/// In-memory campaign repository
#[derive(Default)]
pub struct InMemoryCampaignRepository {
    campaigns: RwLock<HashMap<CampaignId, Campaign>>,
}

impl InMemoryCampaignRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CampaignRepository for InMemoryCampaignRepository {
    async fn create(&self, input: NewCampaign) -> Result<Campaign> {
        let now = Utc::now();
        let campaign = Campaign {
            id: Uuid::now_v7(),
            user_id: input.user_id,
            name: input.name,
            subject: input.subject,
            from_address: input.from_address,
            segment_id: input.segment_id,
            segment_name: input.segment_name,
            recipient_count: input.recipient_count,
            text_body: input.text_body,
            html_body: input.html_body,
            attachments: input.attachments,
            status: input.status.unwrap_or(CampaignStatus::Draft).to_string(),
            metrics: CampaignMetrics::default(),
            created_at: now,
            updated_at: now,
            sent_at: None,
            completed_at: None,
        };

        self.campaigns
            .write()
            .await
            .insert(campaign.id, campaign.clone());
        Ok(campaign)
    }

    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        Ok(self.campaigns.read().await.get(&id).cloned())
    }

    async fn list_by_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>> {
        let mut found: Vec<Campaign> = self
            .campaigns
            .read()
            .await
            .values()
            .filter(|c| c.is(status))
            .cloned()
            .collect();
        found.sort_by_key(|c| c.created_at);
        Ok(found)
    }

    async fn transition_status(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<Option<StatusChange>> {
        let mut campaigns = self.campaigns.write().await;
        let Some(campaign) = campaigns.get_mut(&id) else {
            return Ok(None);
        };

        let previous = campaign.status_enum().ok_or_else(|| {
            Error::Internal(format!("Invalid campaign status: {}", campaign.status))
        })?;
        if !from.contains(&previous) {
            return Ok(None);
        }

        let (sent_at, completed_at) = transition_timestamps(to);
        campaign.status = to.to_string();
        campaign.sent_at = sent_at.or(campaign.sent_at);
        campaign.completed_at = completed_at.or(campaign.completed_at);
        campaign.updated_at = Utc::now();

        Ok(Some(StatusChange {
            previous,
            campaign: campaign.clone(),
        }))
    }

    async fn increment_metric(&self, id: CampaignId, kind: MetricKind) -> Result<bool> {
        let mut campaigns = self.campaigns.write().await;
        match campaigns.get_mut(&id) {
            Some(campaign)
                if !campaign
                    .status_enum()
                    .map(CampaignStatus::metrics_frozen)
                    .unwrap_or(true) =>
            {
                campaign.metrics.increment(kind);
                campaign.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
