//! Email job repository
//!
//! Jobs are persisted when enqueued and removed once they reach a terminal
//! outcome, so the rows left in `email_jobs` are exactly the outstanding work
//! to reload after a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailcast_common::types::{CampaignId, JobId, UserId};
use mailcast_common::{Error, Result};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use crate::db::{db_err, DatabasePool};
use crate::models::{EmailJob, PreparedAttachment};

/// Job repository trait
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Persist a batch of jobs. Either every job is stored or none is.
    async fn insert_batch(&self, jobs: &[EmailJob]) -> Result<()>;

    /// Record a failed attempt and when the job is due again
    async fn record_attempt(
        &self,
        id: JobId,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<()>;

    async fn delete(&self, id: JobId) -> Result<()>;

    /// Remove every outstanding job of a campaign, returning how many went
    async fn delete_by_campaign(&self, campaign_id: CampaignId) -> Result<u64>;

    /// All outstanding jobs, oldest first
    async fn list_pending(&self) -> Result<Vec<EmailJob>>;
}

#[derive(FromRow)]
struct JobRow {
    id: JobId,
    campaign_id: CampaignId,
    user_id: UserId,
    to_address: String,
    from_address: String,
    subject: String,
    text_body: String,
    html_body: Option<String>,
    attachments: Json<Vec<PreparedAttachment>>,
    custom_args: Json<BTreeMap<String, String>>,
    attempts: i32,
    max_attempts: i32,
    next_attempt_at: DateTime<Utc>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<JobRow> for EmailJob {
    fn from(row: JobRow) -> Self {
        Self {
            id: row.id,
            campaign_id: row.campaign_id,
            user_id: row.user_id,
            to_address: row.to_address,
            from_address: row.from_address,
            subject: row.subject,
            text_body: row.text_body,
            html_body: row.html_body,
            attachments: row.attachments.0,
            custom_args: row.custom_args.0,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            next_attempt_at: row.next_attempt_at,
            last_error: row.last_error,
            created_at: row.created_at,
        }
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Database job repository
pub struct DbJobRepository {
    pool: DatabasePool,
}

impl DbJobRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for DbJobRepository {
    async fn insert_batch(&self, jobs: &[EmailJob]) -> Result<()> {
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        for job in jobs {
            sqlx::query(
                r#"
                INSERT INTO email_jobs (
                    id, campaign_id, user_id, to_address, from_address, subject,
                    text_body, html_body, attachments, custom_args, attempts,
                    max_attempts, next_attempt_at, last_error, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                "#,
            )
            .bind(job.id)
            .bind(job.campaign_id)
            .bind(job.user_id)
            .bind(&job.to_address)
            .bind(&job.from_address)
            .bind(&job.subject)
            .bind(&job.text_body)
            .bind(&job.html_body)
            .bind(Json(&job.attachments))
            .bind(Json(&job.custom_args))
            .bind(to_i32(job.attempts))
            .bind(to_i32(job.max_attempts))
            .bind(job.next_attempt_at)
            .bind(&job.last_error)
            .bind(job.created_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn record_attempt(
        &self,
        id: JobId,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE email_jobs SET attempts = $2, next_attempt_at = $3, last_error = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(to_i32(attempts))
        .bind(next_attempt_at)
        .bind(last_error)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete(&self, id: JobId) -> Result<()> {
        sqlx::query("DELETE FROM email_jobs WHERE id = $1")
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn delete_by_campaign(&self, campaign_id: CampaignId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM email_jobs WHERE campaign_id = $1")
            .bind(campaign_id)
            .execute(self.pool.pool())
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn list_pending(&self) -> Result<Vec<EmailJob>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM email_jobs ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(EmailJob::from).collect())
    }
}

/// In-memory job repository
#[derive(Default)]
pub struct InMemoryJobRepository {
    jobs: RwLock<HashMap<JobId, EmailJob>>,
    fail_writes: AtomicBool,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent inserts and attempt updates fail, simulating an
    /// unreachable store
    pub fn set_unavailable(&self, unavailable: bool) {
        self.fail_writes.store(unavailable, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    pub async fn get(&self, id: JobId) -> Option<EmailJob> {
        self.jobs.read().await.get(&id).cloned()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn insert_batch(&self, jobs: &[EmailJob]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Database("job store unavailable".to_string()));
        }

        let mut stored = self.jobs.write().await;
        if let Some(dup) = jobs.iter().find(|j| stored.contains_key(&j.id)) {
            return Err(Error::Database(format!("duplicate job id {}", dup.id)));
        }
        for job in jobs {
            stored.insert(job.id, job.clone());
        }
        Ok(())
    }

    async fn record_attempt(
        &self,
        id: JobId,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Database("job store unavailable".to_string()));
        }
        if let Some(job) = self.jobs.write().await.get_mut(&id) {
            job.attempts = attempts;
            job.next_attempt_at = next_attempt_at;
            job.last_error = Some(last_error.to_string());
        }
        Ok(())
    }

    async fn delete(&self, id: JobId) -> Result<()> {
        self.jobs.write().await.remove(&id);
        Ok(())
    }

    async fn delete_by_campaign(&self, campaign_id: CampaignId) -> Result<u64> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| job.campaign_id != campaign_id);
        Ok((before - jobs.len()) as u64)
    }

    async fn list_pending(&self) -> Result<Vec<EmailJob>> {
        let mut jobs: Vec<EmailJob> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CAMPAIGN_ID_ARG;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn job(campaign_id: CampaignId, to: &str) -> EmailJob {
        let now = Utc::now();
        EmailJob {
            id: Uuid::now_v7(),
            campaign_id,
            user_id: Uuid::new_v4(),
            to_address: to.to_string(),
            from_address: "news@example.com".to_string(),
            subject: "Hello".to_string(),
            text_body: "Hi".to_string(),
            html_body: None,
            attachments: Vec::new(),
            custom_args: BTreeMap::from([(CAMPAIGN_ID_ARG.to_string(), campaign_id.to_string())]),
            attempts: 0,
            max_attempts: 3,
            next_attempt_at: now,
            last_error: None,
            created_at: now,
        }
    }

    #[tokio::test]
    async fn test_insert_batch_is_all_or_nothing() {
        let repo = InMemoryJobRepository::new();
        let campaign = Uuid::new_v4();
        let first = job(campaign, "a@example.com");
        repo.insert_batch(&[first.clone()]).await.unwrap();

        // Second batch collides on one id and must not store the other job
        let second = vec![job(campaign, "b@example.com"), first.clone()];
        assert!(repo.insert_batch(&second).await.is_err());
        assert_eq!(repo.len().await, 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_rejects_inserts() {
        let repo = InMemoryJobRepository::new();
        repo.set_unavailable(true);
        let err = repo
            .insert_batch(&[job(Uuid::new_v4(), "a@example.com")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Database(_)));
        assert!(repo.is_empty().await);
    }

    #[tokio::test]
    async fn test_record_attempt_and_delete() {
        let repo = InMemoryJobRepository::new();
        let j = job(Uuid::new_v4(), "a@example.com");
        repo.insert_batch(&[j.clone()]).await.unwrap();

        let due = Utc::now() + chrono::Duration::seconds(5);
        repo.record_attempt(j.id, 1, due, "503 Service Unavailable")
            .await
            .unwrap();
        let stored = repo.get(j.id).await.unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.next_attempt_at, due);
        assert_eq!(stored.last_error.as_deref(), Some("503 Service Unavailable"));

        repo.delete(j.id).await.unwrap();
        assert!(repo.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_by_campaign() {
        let repo = InMemoryJobRepository::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        repo.insert_batch(&[job(a, "1@example.com"), job(a, "2@example.com"), job(b, "3@example.com")])
            .await
            .unwrap();

        assert_eq!(repo.delete_by_campaign(a).await.unwrap(), 2);
        let pending = repo.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].campaign_id, b);
    }
}
