//! Job outcome bus
//!
//! The worker pool and the queue publish what happened to each job; the
//! campaign lifecycle and the bounce recorder subscribe independently.

use mailcast_common::types::{CampaignId, JobId};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::trace;

/// What happened to a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The provider accepted the message
    Delivered {
        job_id: JobId,
        campaign_id: CampaignId,
        attempts: u32,
    },
    /// The attempt failed and the job is parked until its backoff elapses
    RetryScheduled {
        job_id: JobId,
        campaign_id: CampaignId,
        attempt: u32,
        delay: Duration,
    },
    /// The job failed for good
    Exhausted {
        job_id: JobId,
        campaign_id: CampaignId,
        attempts: u32,
        reason: String,
    },
    /// The job was dropped because its campaign was cancelled
    Cancelled {
        job_id: JobId,
        campaign_id: CampaignId,
    },
    /// No job is ready, delayed or in flight anywhere in the queue
    QueueIdle,
}

impl JobOutcome {
    pub fn campaign_id(&self) -> Option<CampaignId> {
        match self {
            JobOutcome::Delivered { campaign_id, .. }
            | JobOutcome::RetryScheduled { campaign_id, .. }
            | JobOutcome::Exhausted { campaign_id, .. }
            | JobOutcome::Cancelled { campaign_id, .. } => Some(*campaign_id),
            JobOutcome::QueueIdle => None,
        }
    }

    /// Whether the job this outcome refers to is gone from the queue
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobOutcome::Delivered { .. } | JobOutcome::Exhausted { .. } | JobOutcome::Cancelled { .. }
        )
    }
}

/// Multicast channel carrying [`JobOutcome`]s
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JobOutcome>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an outcome. Having no subscribers is not an error.
    pub fn publish(&self, outcome: JobOutcome) {
        trace!(?outcome, "publishing job outcome");
        let _ = self.sender.send(outcome);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobOutcome> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
