//! Shared fixtures for unit tests

use async_trait::async_trait;
use chrono::Utc;
use mailcast_common::types::CampaignId;
use mailcast_common::Result;
use mailcast_storage::models::{
    Campaign, CampaignStatus, EmailJob, MetricKind, NewCampaign, StatusChange, CAMPAIGN_ID_ARG,
};
use mailcast_storage::repository::{CampaignRepository, InMemoryCampaignRepository};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::delivery::{Mailer, OutboundEmail, SendError, SendReceipt};

pub fn job_for(campaign_id: CampaignId, to: &str) -> EmailJob {
    let now = Utc::now();
    EmailJob {
        id: Uuid::now_v7(),
        campaign_id,
        user_id: Uuid::nil(),
        to_address: to.to_string(),
        from_address: "news@example.com".to_string(),
        subject: "Hello".to_string(),
        text_body: "Hi there".to_string(),
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

pub fn new_campaign(status: CampaignStatus, recipient_count: i32) -> NewCampaign {
    NewCampaign {
        user_id: Uuid::new_v4(),
        name: "Spring launch".to_string(),
        subject: "Hello".to_string(),
        from_address: "news@example.com".to_string(),
        segment_id: None,
        segment_name: None,
        recipient_count,
        text_body: "Hi there".to_string(),
        html_body: None,
        attachments: Vec::new(),
        status: Some(status),
    }
}

/// Mailer that records every attempt and fails on request
#[derive(Default)]
pub struct ScriptedMailer {
    attempts: Mutex<Vec<(Instant, String)>>,
    delivered: Mutex<Vec<OutboundEmail>>,
    fail_next: Mutex<HashMap<String, VecDeque<SendError>>>,
    fail_always: Mutex<HashMap<String, SendError>>,
}

impl ScriptedMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, to: &str, error: SendError) {
        self.fail_next
            .lock()
            .unwrap()
            .entry(to.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn fail_always(&self, to: &str, error: SendError) {
        self.fail_always
            .lock()
            .unwrap()
            .insert(to.to_string(), error);
    }

    /// Start instants of every attempt, in order
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    pub fn attempts_to(&self, to: &str) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, r)| r == to)
            .count()
    }

    pub fn delivered(&self) -> Vec<OutboundEmail> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for ScriptedMailer {
    async fn send(&self, email: &OutboundEmail) -> std::result::Result<SendReceipt, SendError> {
        self.attempts
            .lock()
            .unwrap()
            .push((Instant::now(), email.to.clone()));

        if let Some(error) = self
            .fail_next
            .lock()
            .unwrap()
            .get_mut(&email.to)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        if let Some(error) = self.fail_always.lock().unwrap().get(&email.to) {
            return Err(error.clone());
        }

        self.delivered.lock().unwrap().push(email.clone());
        Ok(SendReceipt {
            message_id: Some(Uuid::new_v4().to_string()),
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Campaign store whose counter writes take `delay`
pub struct SlowCampaigns {
    inner: InMemoryCampaignRepository,
    delay: Duration,
}

impl SlowCampaigns {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: InMemoryCampaignRepository::new(),
            delay,
        }
    }
}

#[async_trait]
impl CampaignRepository for SlowCampaigns {
    async fn create(&self, input: NewCampaign) -> Result<Campaign> {
        self.inner.create(input).await
    }

    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        self.inner.get(id).await
    }

    async fn list_by_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>> {
        self.inner.list_by_status(status).await
    }

    async fn transition_status(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<Option<StatusChange>> {
        self.inner.transition_status(id, from, to).await
    }

    async fn increment_metric(&self, id: CampaignId, kind: MetricKind) -> Result<bool> {
        tokio::time::sleep(self.delay).await;
        self.inner.increment_metric(id, kind).await
    }
}
