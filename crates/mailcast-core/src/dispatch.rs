//! Campaign dispatch
//!
//! Turns a campaign and its resolved recipient list into queued jobs, one
//! per recipient, and moves the campaign into `sending`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use mailcast_common::types::CampaignId;
use mailcast_common::Error;
use mailcast_storage::models::{
    Campaign, CampaignStatus, EmailJob, NewCampaign, PreparedAttachment, CAMPAIGN_ID_ARG,
};
use mailcast_storage::repository::CampaignRepository;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::lifecycle::{CampaignLifecycle, LifecycleError};
use crate::queue::{QueueError, QueueService};

/// Dispatch errors
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("recipient list is empty")]
    NoRecipients,

    #[error("too many recipients: {0}")]
    TooManyRecipients(usize),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("failed to queue campaign emails: {0}")]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] Error),
}

impl From<DispatchError> for Error {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::NoRecipients | DispatchError::TooManyRecipients(_) => {
                Error::Validation(e.to_string())
            }
            DispatchError::Lifecycle(inner) => inner.into(),
            DispatchError::Queue(inner) => inner.into(),
            DispatchError::Store(inner) => inner,
        }
    }
}

/// Message content shared by every recipient of a dispatch
#[derive(Debug, Clone, Default)]
pub struct EmailTemplate {
    pub subject: String,
    pub from: String,
    pub text: String,
    pub html: Option<String>,
    pub attachments: Vec<PreparedAttachment>,
}

impl EmailTemplate {
    pub fn from_campaign(campaign: &Campaign, attachments: Vec<PreparedAttachment>) -> Self {
        Self {
            subject: campaign.subject.clone(),
            from: campaign.from_address.clone(),
            text: campaign.text_body.clone(),
            html: campaign.html_body.clone(),
            attachments,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReceipt {
    pub campaign_id: CampaignId,
    pub jobs_queued: usize,
}

pub struct Dispatcher {
    campaigns: Arc<dyn CampaignRepository>,
    queue: Arc<QueueService>,
    lifecycle: Arc<CampaignLifecycle>,
    max_attempts: u32,
}

impl Dispatcher {
    pub fn new(
        campaigns: Arc<dyn CampaignRepository>,
        queue: Arc<QueueService>,
        lifecycle: Arc<CampaignLifecycle>,
        max_attempts: u32,
    ) -> Self {
        Self {
            campaigns,
            queue,
            lifecycle,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Queue one job per recipient and move the campaign to `sending`.
    ///
    /// If the jobs cannot be stored the campaign is marked `failed` and the
    /// error is returned; recipients are never dropped silently.
    pub async fn dispatch_campaign(
        &self,
        campaign_id: CampaignId,
        recipients: Vec<String>,
        template: EmailTemplate,
    ) -> Result<DispatchReceipt, DispatchError> {
        if recipients.is_empty() {
            return Err(DispatchError::NoRecipients);
        }

        let campaign = self
            .campaigns
            .get(campaign_id)
            .await?
            .ok_or(LifecycleError::NotFound(campaign_id))?;

        // Drain checks must not see the campaign as finished before its
        // jobs are visible.
        self.queue.hold(campaign_id).await;
        let result = self.enqueue(&campaign, recipients, template).await;
        self.queue.release(campaign_id).await;

        let jobs_queued = result?;

        // Every job may already have finished while the hold was in place
        if let Err(e) = self.lifecycle.mark_sent_if_drained(campaign_id).await {
            warn!(campaign_id = %campaign_id, error = %e, "drain check after dispatch failed");
        }

        info!(campaign_id = %campaign_id, jobs_queued, "campaign dispatched");
        Ok(DispatchReceipt {
            campaign_id,
            jobs_queued,
        })
    }

    /// Create a campaign for `recipients` and dispatch it.
    ///
    /// Attachment paths that cannot be read are logged and left out.
    pub async fn launch(
        &self,
        mut input: NewCampaign,
        recipients: Vec<String>,
    ) -> Result<(Campaign, DispatchReceipt), DispatchError> {
        if recipients.is_empty() {
            return Err(DispatchError::NoRecipients);
        }
        input.recipient_count = i32::try_from(recipients.len())
            .map_err(|_| DispatchError::TooManyRecipients(recipients.len()))?;
        input.status = Some(CampaignStatus::Ongoing);

        let attachments = prepare_attachments(&input.attachments).await;
        let campaign = self.campaigns.create(input).await?;
        info!(
            campaign_id = %campaign.id,
            user_id = %campaign.user_id,
            recipients = recipients.len(),
            attachments = attachments.len(),
            "campaign created"
        );

        let template = EmailTemplate::from_campaign(&campaign, attachments);
        let receipt = self
            .dispatch_campaign(campaign.id, recipients, template)
            .await?;
        Ok((campaign, receipt))
    }

    async fn enqueue(
        &self,
        campaign: &Campaign,
        recipients: Vec<String>,
        template: EmailTemplate,
    ) -> Result<usize, DispatchError> {
        self.lifecycle.begin_sending(campaign.id).await?;

        let jobs = self.build_jobs(campaign, recipients, &template);
        match self.queue.enqueue_bulk(jobs).await {
            Ok(count) => Ok(count),
            Err(e) => {
                error!(campaign_id = %campaign.id, error = %e, "failed to queue campaign emails");
                if let Err(mark_err) = self.lifecycle.mark_failed(campaign.id).await {
                    warn!(campaign_id = %campaign.id, error = %mark_err, "failed to mark campaign as failed");
                }
                Err(e.into())
            }
        }
    }

    fn build_jobs(
        &self,
        campaign: &Campaign,
        recipients: Vec<String>,
        template: &EmailTemplate,
    ) -> Vec<EmailJob> {
        let now = Utc::now();
        let custom_args =
            BTreeMap::from([(CAMPAIGN_ID_ARG.to_string(), campaign.id.to_string())]);

        recipients
            .into_iter()
            .map(|to| EmailJob {
                id: Uuid::now_v7(),
                campaign_id: campaign.id,
                user_id: campaign.user_id,
                to_address: to.trim().to_string(),
                from_address: template.from.clone(),
                subject: template.subject.clone(),
                text_body: template.text.clone(),
                html_body: template.html.clone(),
                attachments: template.attachments.clone(),
                custom_args: custom_args.clone(),
                attempts: 0,
                max_attempts: self.max_attempts,
                next_attempt_at: now,
                last_error: None,
                created_at: now,
            })
            .collect()
    }
}

/// Read attachment files into provider-ready, base64-encoded attachments
pub async fn prepare_attachments(paths: &[String]) -> Vec<PreparedAttachment> {
    let mut prepared = Vec::with_capacity(paths.len());

    for path in paths {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let filename = Path::new(path)
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or("attachment")
                    .to_string();
                prepared.push(PreparedAttachment {
                    content: STANDARD.encode(bytes),
                    filename,
                    content_type: "application/octet-stream".to_string(),
                    disposition: "attachment".to_string(),
                });
            }
            Err(e) => warn!(path = %path, error = %e, "skipping unreadable attachment"),
        }
    }

    prepared
}
