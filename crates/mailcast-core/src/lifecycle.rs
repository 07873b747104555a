//! Campaign status state machine
//!
//! Status only moves forward:
//!
//! ```text
//! draft -> ongoing -> sending -> sent -> completed
//!    \________\_________\______> failed | cancelled
//! ```
//!
//! Every change is a compare-and-set against the store, so concurrent
//! callers perform a given transition at most once.

use mailcast_common::types::CampaignId;
use mailcast_common::Error;
use mailcast_storage::models::{Campaign, CampaignStatus};
use mailcast_storage::repository::CampaignRepository;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::JobOutcome;
use crate::notify::{campaign_link, status_message, Notifier};
use crate::queue::QueueService;

const ACTIVE: [CampaignStatus; 3] = [
    CampaignStatus::Draft,
    CampaignStatus::Ongoing,
    CampaignStatus::Sending,
];

/// Lifecycle errors
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("campaign {0} not found")]
    NotFound(CampaignId),

    #[error("campaign {campaign_id} cannot move from {from} to {to}")]
    InvalidTransition {
        campaign_id: CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
    },

    #[error(transparent)]
    Store(#[from] Error),
}

impl From<LifecycleError> for Error {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::NotFound(_) => Error::NotFound(e.to_string()),
            LifecycleError::InvalidTransition { .. } => Error::Conflict(e.to_string()),
            LifecycleError::Store(inner) => inner,
        }
    }
}

/// Result of a lifecycle operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Changed {
        from: CampaignStatus,
        to: CampaignStatus,
    },
    /// Nothing to do; carries the status the campaign is in
    Unchanged(CampaignStatus),
}

impl Transition {
    pub fn is_changed(&self) -> bool {
        matches!(self, Transition::Changed { .. })
    }
}

/// Owner of every campaign status change made by the pipeline
pub struct CampaignLifecycle {
    campaigns: Arc<dyn CampaignRepository>,
    queue: Arc<QueueService>,
    notifier: Arc<dyn Notifier>,
}

impl CampaignLifecycle {
    pub fn new(
        campaigns: Arc<dyn CampaignRepository>,
        queue: Arc<QueueService>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            campaigns,
            queue,
            notifier,
        }
    }

    /// `{draft, ongoing} -> sending`
    pub async fn begin_sending(&self, id: CampaignId) -> Result<Transition, LifecycleError> {
        let to = CampaignStatus::Sending;
        let current = self.status_of(id).await?;
        if !matches!(current, CampaignStatus::Draft | CampaignStatus::Ongoing) {
            return Err(invalid(id, current, to));
        }

        match self
            .apply(id, &[CampaignStatus::Draft, CampaignStatus::Ongoing], to)
            .await?
        {
            Some(previous) => Ok(Transition::Changed { from: previous, to }),
            // Lost a race with another dispatch or an administrative action
            None => Err(invalid(id, self.status_of(id).await?, to)),
        }
    }

    /// `sending -> sent`, only once no job of the campaign is left
    pub async fn mark_sent_if_drained(&self, id: CampaignId) -> Result<Transition, LifecycleError> {
        let current = self.status_of(id).await?;
        if current != CampaignStatus::Sending || !self.queue.drained(id).await {
            return Ok(Transition::Unchanged(current));
        }

        let to = CampaignStatus::Sent;
        match self.apply(id, &[CampaignStatus::Sending], to).await? {
            Some(previous) => Ok(Transition::Changed { from: previous, to }),
            None => Ok(Transition::Unchanged(self.status_of(id).await?)),
        }
    }

    /// `{sent, ongoing} -> completed`; a no-op for campaigns already
    /// completed, cancelled or failed.
    pub async fn mark_completed(&self, id: CampaignId) -> Result<Transition, LifecycleError> {
        let to = CampaignStatus::Completed;
        let allowed = [CampaignStatus::Sent, CampaignStatus::Ongoing];

        let current = self.status_of(id).await?;
        if is_closed(current) {
            return Ok(Transition::Unchanged(current));
        }
        if !allowed.contains(&current) {
            return Err(invalid(id, current, to));
        }

        match self.apply(id, &allowed, to).await? {
            Some(previous) => Ok(Transition::Changed { from: previous, to }),
            None => {
                let current = self.status_of(id).await?;
                if is_closed(current) {
                    Ok(Transition::Unchanged(current))
                } else {
                    Err(invalid(id, current, to))
                }
            }
        }
    }

    /// Any non-terminal status -> `cancelled`. Jobs still waiting in the
    /// queue are dropped; attempts already in flight complete.
    pub async fn cancel(&self, id: CampaignId) -> Result<Transition, LifecycleError> {
        self.terminate(id, CampaignStatus::Cancelled).await
    }

    /// Any non-terminal status -> `failed`
    pub async fn mark_failed(&self, id: CampaignId) -> Result<Transition, LifecycleError> {
        self.terminate(id, CampaignStatus::Failed).await
    }

    /// Re-check every campaign in `sending`. Returns how many became `sent`.
    pub async fn sweep(&self) -> Result<usize, LifecycleError> {
        let sending = self.campaigns.list_by_status(CampaignStatus::Sending).await?;
        let mut sent = 0;
        for campaign in sending {
            match self.mark_sent_if_drained(campaign.id).await {
                Ok(t) if t.is_changed() => sent += 1,
                Ok(_) => {}
                Err(e) => warn!(campaign_id = %campaign.id, error = %e, "drain check failed"),
            }
        }
        if sent > 0 {
            debug!(sent, "sweep marked campaigns as sent");
        }
        Ok(sent)
    }

    async fn terminate(
        &self,
        id: CampaignId,
        to: CampaignStatus,
    ) -> Result<Transition, LifecycleError> {
        let current = self.status_of(id).await?;
        if current == to {
            return Ok(Transition::Unchanged(current));
        }
        if !ACTIVE.contains(&current) {
            return Err(invalid(id, current, to));
        }

        if to == CampaignStatus::Cancelled {
            self.queue.cancel_campaign(id).await;
        }

        match self.apply(id, &ACTIVE, to).await? {
            Some(previous) => {
                if to == CampaignStatus::Cancelled {
                    // Jobs enqueued by a dispatch racing with the status change
                    self.queue.cancel_campaign(id).await;
                }
                Ok(Transition::Changed { from: previous, to })
            }
            None => {
                let current = self.status_of(id).await?;
                if current == to {
                    Ok(Transition::Unchanged(current))
                } else {
                    Err(invalid(id, current, to))
                }
            }
        }
    }

    async fn load(&self, id: CampaignId) -> Result<Campaign, LifecycleError> {
        self.campaigns
            .get(id)
            .await?
            .ok_or(LifecycleError::NotFound(id))
    }

    async fn status_of(&self, id: CampaignId) -> Result<CampaignStatus, LifecycleError> {
        let campaign = self.load(id).await?;
        campaign.status_enum().ok_or_else(|| {
            LifecycleError::Store(Error::Internal(format!(
                "campaign {} has invalid status {}",
                id, campaign.status
            )))
        })
    }

    /// Compare-and-set, then notify the owner. Returns the previous status
    /// when this call performed the change.
    async fn apply(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<Option<CampaignStatus>, LifecycleError> {
        let Some(change) = self.campaigns.transition_status(id, from, to).await? else {
            return Ok(None);
        };

        info!(
            campaign_id = %id,
            from = %change.previous,
            to = %to,
            "campaign status changed"
        );

        let campaign = &change.campaign;
        let (title, message) = status_message(&campaign.name, to);
        if let Err(e) = self
            .notifier
            .notify(campaign.user_id, title, &message, &campaign_link(id))
            .await
        {
            warn!(campaign_id = %id, error = %e, "failed to send status notification");
        }

        Ok(Some(change.previous))
    }
}

fn is_closed(status: CampaignStatus) -> bool {
    matches!(
        status,
        CampaignStatus::Completed | CampaignStatus::Cancelled | CampaignStatus::Failed
    )
}

fn invalid(campaign_id: CampaignId, from: CampaignStatus, to: CampaignStatus) -> LifecycleError {
    LifecycleError::InvalidTransition {
        campaign_id,
        from,
        to,
    }
}

/// Drives `sending -> sent` from job outcomes.
///
/// Terminal outcomes re-check their own campaign; a globally idle queue, or
/// a lagged receiver, re-checks every campaign in `sending`.
pub struct LifecycleSubscriber;

impl LifecycleSubscriber {
    pub fn spawn(
        lifecycle: Arc<CampaignLifecycle>,
        mut outcomes: broadcast::Receiver<JobOutcome>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    received = outcomes.recv() => received,
                };
                if !Self::handle(&lifecycle, received).await {
                    break;
                }
            }

            // Outcomes published before shutdown still settle their campaigns
            loop {
                let received = match outcomes.try_recv() {
                    Ok(outcome) => Ok(outcome),
                    Err(TryRecvError::Lagged(skipped)) => Err(RecvError::Lagged(skipped)),
                    Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                };
                Self::handle(&lifecycle, received).await;
            }
            debug!("lifecycle subscriber stopped");
        })
    }

    /// Returns false once the bus is closed
    async fn handle(
        lifecycle: &CampaignLifecycle,
        received: Result<JobOutcome, RecvError>,
    ) -> bool {
        match received {
            Ok(outcome) if outcome.is_terminal() => {
                if let Some(campaign_id) = outcome.campaign_id() {
                    if let Err(e) = lifecycle.mark_sent_if_drained(campaign_id).await {
                        warn!(campaign_id = %campaign_id, error = %e, "drain check failed");
                    }
                }
            }
            Ok(JobOutcome::QueueIdle) => {
                if let Err(e) = lifecycle.sweep().await {
                    warn!(error = %e, "campaign sweep failed");
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "lifecycle subscriber lagged, sweeping all campaigns");
                if let Err(e) = lifecycle.sweep().await {
                    warn!(error = %e, "campaign sweep failed");
                }
            }
            Err(RecvError::Closed) => return false,
        }
        true
    }
}
