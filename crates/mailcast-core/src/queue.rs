//! Campaign job queue
//!
//! Scheduling happens in memory: a FIFO of ready jobs plus a min-heap of
//! jobs parked until their retry instant. Every job is written to the job
//! store before it becomes visible and removed from it once it reaches a
//! terminal outcome, so [`QueueService::recover`] can rebuild the queue
//! after a restart.

use chrono::Utc;
use mailcast_common::types::{CampaignId, JobId};
use mailcast_common::Error;
use mailcast_storage::models::EmailJob;
use mailcast_storage::repository::JobRepository;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::events::{EventBus, JobOutcome};

/// Queue errors
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("cannot enqueue an empty batch")]
    EmptyBatch,

    #[error("queue is closed")]
    Closed,

    #[error("job store unavailable: {0}")]
    Store(#[source] Error),
}

impl From<QueueError> for Error {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::EmptyBatch => Error::Validation(e.to_string()),
            QueueError::Closed | QueueError::Store(_) => Error::Queue(e.to_string()),
        }
    }
}

/// Point-in-time queue counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub delayed: usize,
    pub in_flight: usize,
}

impl QueueStats {
    pub fn depth(&self) -> usize {
        self.ready + self.delayed + self.in_flight
    }
}

struct Delayed {
    due: Instant,
    seq: u64,
    job: EmailJob,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<EmailJob>,
    delayed: BinaryHeap<Reverse<Delayed>>,
    in_flight: HashMap<JobId, CampaignId>,
    /// Ready + delayed + in-flight jobs per campaign
    outstanding: HashMap<CampaignId, usize>,
    cancelled: HashSet<CampaignId>,
    closed: bool,
    seq: u64,
}

impl QueueState {
    fn admit(&mut self, job: EmailJob, now: Instant) {
        *self.outstanding.entry(job.campaign_id).or_default() += 1;
        let due = match (job.next_attempt_at - Utc::now()).to_std() {
            Ok(wait) => now + wait,
            Err(_) => now,
        };
        self.park(job, due, now);
    }

    fn park(&mut self, job: EmailJob, due: Instant, now: Instant) {
        if due <= now {
            self.ready.push_back(job);
        } else {
            self.seq += 1;
            self.delayed.push(Reverse(Delayed {
                due,
                seq: self.seq,
                job,
            }));
        }
    }

    fn promote_due(&mut self, now: Instant) {
        while self.delayed.peek().is_some_and(|Reverse(d)| d.due <= now) {
            if let Some(Reverse(d)) = self.delayed.pop() {
                self.ready.push_back(d.job);
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.peek().map(|Reverse(d)| d.due)
    }

    fn release(&mut self, campaign_id: CampaignId, count: usize) {
        if let Some(outstanding) = self.outstanding.get_mut(&campaign_id) {
            *outstanding = outstanding.saturating_sub(count);
            if *outstanding == 0 {
                self.outstanding.remove(&campaign_id);
            }
        }
        if !self.outstanding.contains_key(&campaign_id) {
            // Nothing left to drop for this campaign
            self.cancelled.remove(&campaign_id);
        }
    }

    fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.delayed.is_empty() && self.in_flight.is_empty()
    }
}

/// Shared job queue
pub struct QueueService {
    store: Arc<dyn JobRepository>,
    events: EventBus,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl QueueService {
    pub fn new(store: Arc<dyn JobRepository>, events: EventBus) -> Self {
        Self {
            store,
            events,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Persist a batch of jobs and make them visible to workers.
    ///
    /// Nothing becomes visible unless the whole batch was stored.
    pub async fn enqueue_bulk(&self, jobs: Vec<EmailJob>) -> Result<usize, QueueError> {
        if jobs.is_empty() {
            return Err(QueueError::EmptyBatch);
        }
        if self.state.lock().await.closed {
            return Err(QueueError::Closed);
        }

        self.store
            .insert_batch(&jobs)
            .await
            .map_err(QueueError::Store)?;

        let count = jobs.len();
        {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            for job in jobs {
                state.admit(job, now);
            }
        }
        self.notify.notify_waiters();

        debug!(count, "jobs enqueued");
        Ok(count)
    }

    /// Wait for the next ready job. Returns `None` once the queue is closed.
    ///
    /// The returned job counts as in flight until it is passed to
    /// [`finish`](Self::finish) or [`retry_later`](Self::retry_later).
    pub async fn next(&self) -> Option<EmailJob> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.state.lock().await;
                if state.closed {
                    return None;
                }
                state.promote_due(Instant::now());
                if let Some(job) = state.ready.pop_front() {
                    state.in_flight.insert(job.id, job.campaign_id);
                    return Some(job);
                }
                state.next_due()
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Persist a failed attempt and the instant of the next one. Must
    /// succeed before the job is handed to [`retry_later`](Self::retry_later),
    /// otherwise a restart would reload a stale attempt count.
    pub async fn record_retry(&self, job: &mut EmailJob, delay: Duration) -> Result<(), QueueError> {
        job.next_attempt_at =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        self.store
            .record_attempt(
                job.id,
                job.attempts,
                job.next_attempt_at,
                job.last_error.as_deref().unwrap_or_default(),
            )
            .await
            .map_err(QueueError::Store)
    }

    /// Park an in-flight job until `delay` has elapsed. Returns `false` when
    /// the job was dropped instead because its campaign has been cancelled.
    pub async fn retry_later(&self, job: EmailJob, delay: Duration) -> bool {
        let job_id = job.id;
        let parked = {
            let mut state = self.state.lock().await;
            state.in_flight.remove(&job.id);
            if state.cancelled.contains(&job.campaign_id) {
                state.release(job.campaign_id, 1);
                false
            } else {
                let now = Instant::now();
                state.park(job, now + delay, now);
                true
            }
        };

        if parked {
            self.notify.notify_waiters();
        } else {
            self.delete_row(job_id).await;
            self.publish_if_idle().await;
        }
        parked
    }

    /// Terminal outcome for an in-flight job
    pub async fn finish(&self, job: &EmailJob) {
        self.delete_row(job.id).await;

        let idle = {
            let mut state = self.state.lock().await;
            let removed = state.in_flight.remove(&job.id).is_some();
            if removed {
                state.release(job.campaign_id, 1);
            }
            removed && state.is_idle()
        };

        if idle {
            self.events.publish(JobOutcome::QueueIdle);
        }
    }

    /// Stop admitting attempts for a campaign. Ready and delayed jobs are
    /// dropped; in-flight attempts run to completion.
    pub async fn cancel_campaign(&self, campaign_id: CampaignId) -> usize {
        let (removed, idle) = {
            let mut state = self.state.lock().await;
            state.cancelled.insert(campaign_id);

            let before = state.ready.len() + state.delayed.len();
            state.ready.retain(|j| j.campaign_id != campaign_id);
            state.delayed.retain(|Reverse(d)| d.job.campaign_id != campaign_id);
            let removed = before - (state.ready.len() + state.delayed.len());

            state.release(campaign_id, removed);
            if !state.outstanding.contains_key(&campaign_id) {
                state.cancelled.remove(&campaign_id);
            }
            (removed, removed > 0 && state.is_idle())
        };

        if let Err(e) = self.store.delete_by_campaign(campaign_id).await {
            warn!(campaign_id = %campaign_id, error = %e, "failed to delete cancelled jobs");
        }

        info!(campaign_id = %campaign_id, removed, "campaign jobs cancelled");

        if idle {
            self.events.publish(JobOutcome::QueueIdle);
        }
        removed
    }

    /// Keep `drained(campaign_id)` false until [`release`](Self::release)
    /// is called, covering the gap between a status change and the enqueue
    /// of the campaign's jobs.
    pub async fn hold(&self, campaign_id: CampaignId) {
        *self
            .state
            .lock()
            .await
            .outstanding
            .entry(campaign_id)
            .or_default() += 1;
    }

    pub async fn release(&self, campaign_id: CampaignId) {
        self.state.lock().await.release(campaign_id, 1);
    }

    pub async fn is_cancelled(&self, campaign_id: CampaignId) -> bool {
        self.state.lock().await.cancelled.contains(&campaign_id)
    }

    /// Whether no job of the campaign is ready, delayed or in flight
    pub async fn drained(&self, campaign_id: CampaignId) -> bool {
        !self.state.lock().await.outstanding.contains_key(&campaign_id)
    }

    pub async fn is_idle(&self) -> bool {
        self.state.lock().await.is_idle()
    }

    /// Reload persisted jobs, each due at its recorded next attempt
    pub async fn recover(&self) -> Result<usize, QueueError> {
        let jobs = self.store.list_pending().await.map_err(QueueError::Store)?;
        let count = jobs.len();

        if count > 0 {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            for job in jobs {
                state.admit(job, now);
            }
        }
        self.notify.notify_waiters();

        info!(count, "recovered pending jobs");
        Ok(count)
    }

    /// Stop handing out jobs; pending `next` calls return `None`
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
        info!("queue closed");
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            ready: state.ready.len(),
            delayed: state.delayed.len(),
            in_flight: state.in_flight.len(),
        }
    }

    async fn delete_row(&self, job_id: JobId) {
        if let Err(e) = self.store.delete(job_id).await {
            warn!(job_id = %job_id, error = %e, "failed to delete finished job");
        }
    }

    async fn publish_if_idle(&self) {
        if self.is_idle().await {
            self.events.publish(JobOutcome::QueueIdle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::job_for;
    use mailcast_storage::repository::InMemoryJobRepository;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn queue() -> (Arc<QueueService>, Arc<InMemoryJobRepository>, EventBus) {
        let store = Arc::new(InMemoryJobRepository::new());
        let events = EventBus::new(64);
        let queue = Arc::new(QueueService::new(store.clone(), events.clone()));
        (queue, store, events)
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let (queue, _, _) = queue();
        assert!(matches!(
            queue.enqueue_bulk(Vec::new()).await,
            Err(QueueError::EmptyBatch)
        ));
    }

    #[tokio::test]
    async fn test_store_failure_leaves_nothing_visible() {
        let (queue, store, _) = queue();
        store.set_unavailable(true);
        let campaign = Uuid::new_v4();

        let err = queue
            .enqueue_bulk(vec![job_for(campaign, "a@example.com")])
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Store(_)));
        assert_eq!(queue.stats().await, QueueStats::default());
        assert!(queue.drained(campaign).await);
    }

    #[tokio::test]
    async fn test_job_lifecycle_and_idle_event() {
        let (queue, store, events) = queue();
        let mut rx = events.subscribe();
        let campaign = Uuid::new_v4();

        queue
            .enqueue_bulk(vec![job_for(campaign, "a@example.com")])
            .await
            .unwrap();
        assert_eq!(store.len().await, 1);
        assert!(!queue.drained(campaign).await);

        let job = queue.next().await.unwrap();
        assert_eq!(queue.stats().await.in_flight, 1);
        assert!(!queue.drained(campaign).await);

        queue.finish(&job).await;
        assert!(queue.drained(campaign).await);
        assert!(queue.is_idle().await);
        assert!(store.is_empty().await);
        assert_eq!(rx.recv().await.unwrap(), JobOutcome::QueueIdle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_parks_job_without_blocking() {
        let (queue, store, _) = queue();
        let campaign = Uuid::new_v4();
        queue
            .enqueue_bulk(vec![job_for(campaign, "a@example.com")])
            .await
            .unwrap();

        let mut job = queue.next().await.unwrap();
        job.attempts = 1;
        job.last_error = Some("503".to_string());

        let start = Instant::now();
        queue
            .record_retry(&mut job, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(queue.retry_later(job.clone(), Duration::from_secs(5)).await);

        let stats = queue.stats().await;
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.in_flight, 0);
        assert!(!queue.drained(campaign).await);

        let persisted = store.get(job.id).await.unwrap();
        assert_eq!(persisted.attempts, 1);
        assert_eq!(persisted.last_error.as_deref(), Some("503"));

        let again = queue.next().await.unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(again.attempts, 1);
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_drained_is_per_campaign() {
        let (queue, _, _) = queue();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        queue
            .enqueue_bulk(vec![job_for(a, "a@example.com"), job_for(b, "b@example.com")])
            .await
            .unwrap();

        let first = queue.next().await.unwrap();
        assert_eq!(first.campaign_id, a);
        queue.finish(&first).await;

        assert!(queue.drained(a).await);
        assert!(!queue.drained(b).await);
        assert!(!queue.is_idle().await);
    }

    #[tokio::test]
    async fn test_hold_keeps_campaign_undrained() {
        let (queue, _, _) = queue();
        let campaign = Uuid::new_v4();

        queue.hold(campaign).await;
        assert!(!queue.drained(campaign).await);
        assert!(queue.is_idle().await);

        queue
            .enqueue_bulk(vec![job_for(campaign, "a@example.com")])
            .await
            .unwrap();
        let job = queue.next().await.unwrap();
        queue.finish(&job).await;
        assert!(!queue.drained(campaign).await);

        queue.release(campaign).await;
        assert!(queue.drained(campaign).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_waiting_jobs_but_not_in_flight() {
        let (queue, store, _) = queue();
        let campaign = Uuid::new_v4();
        let other = Uuid::new_v4();
        queue
            .enqueue_bulk(vec![
                job_for(campaign, "1@example.com"),
                job_for(campaign, "2@example.com"),
                job_for(campaign, "3@example.com"),
                job_for(other, "4@example.com"),
            ])
            .await
            .unwrap();

        let in_flight = queue.next().await.unwrap();
        assert_eq!(in_flight.campaign_id, campaign);

        assert_eq!(queue.cancel_campaign(campaign).await, 2);
        assert!(queue.is_cancelled(campaign).await);
        assert!(!queue.drained(campaign).await);

        // A failing in-flight attempt of a cancelled campaign is not parked
        assert!(!queue.retry_later(in_flight, Duration::from_secs(5)).await);
        assert!(queue.drained(campaign).await);
        assert!(!queue.is_cancelled(campaign).await);

        let next = queue.next().await.unwrap();
        assert_eq!(next.campaign_id, other);
        queue.finish(&next).await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_cancel_marker_cleared_once_campaign_is_empty() {
        let (queue, _, _) = queue();
        let idle = Uuid::new_v4();
        assert_eq!(queue.cancel_campaign(idle).await, 0);
        assert!(!queue.is_cancelled(idle).await);

        let campaign = Uuid::new_v4();
        queue
            .enqueue_bulk(vec![
                job_for(campaign, "1@example.com"),
                job_for(campaign, "2@example.com"),
            ])
            .await
            .unwrap();
        let in_flight = queue.next().await.unwrap();

        assert_eq!(queue.cancel_campaign(campaign).await, 1);
        assert!(queue.is_cancelled(campaign).await);

        queue.finish(&in_flight).await;
        assert!(!queue.is_cancelled(campaign).await);
        assert!(queue.drained(campaign).await);
    }

    #[tokio::test]
    async fn test_record_retry_surfaces_store_failure() {
        let (queue, store, _) = queue();
        let campaign = Uuid::new_v4();
        queue
            .enqueue_bulk(vec![job_for(campaign, "a@example.com")])
            .await
            .unwrap();

        let mut job = queue.next().await.unwrap();
        job.attempts = 1;
        store.set_unavailable(true);

        let err = queue
            .record_retry(&mut job, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Store(_)));
        // Still in flight; the caller decides what happens to it
        assert_eq!(queue.stats().await.in_flight, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_reloads_persisted_jobs() {
        let store = Arc::new(InMemoryJobRepository::new());
        let campaign = Uuid::new_v4();
        let mut late = job_for(campaign, "late@example.com");
        late.attempts = 1;
        late.next_attempt_at = Utc::now() + chrono::Duration::seconds(10);
        store
            .insert_batch(&[job_for(campaign, "now@example.com"), late])
            .await
            .unwrap();

        let queue = QueueService::new(store.clone(), EventBus::new(8));
        assert_eq!(queue.recover().await.unwrap(), 2);

        let stats = queue.stats().await;
        assert_eq!(stats.ready, 1);
        assert_eq!(stats.delayed, 1);
        assert!(!queue.drained(campaign).await);

        let first = queue.next().await.unwrap();
        assert_eq!(first.to_address, "now@example.com");
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_consumers() {
        let (queue, _, _) = queue();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;

        queue.close().await;
        assert!(waiter.await.unwrap().is_none());
        assert!(matches!(
            queue
                .enqueue_bulk(vec![job_for(Uuid::new_v4(), "a@example.com")])
                .await,
            Err(QueueError::Closed)
        ));
    }
}
