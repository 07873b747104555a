//! Delivery worker pool
//!
//! Each worker pulls a job, waits for a rate-limit permit, sends the message
//! and reports the outcome. Failed attempts are parked in the queue for
//! their backoff delay, so a worker never sleeps through a retry.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use mailcast_storage::models::EmailJob;
use mailcast_storage::repository::CampaignRepository;

use super::mailer::{Mailer, OutboundEmail, SendError};
use super::rate_limiter::RateLimiter;
use super::retry::{RetryDecision, RetryPolicy};
use crate::events::JobOutcome;
use crate::metrics::record_bounce;
use crate::queue::QueueService;
use crate::telemetry::Telemetry;

/// Worker pool errors
#[derive(Debug, Error)]
pub enum WorkerPoolError {
    #[error("worker shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    #[error("{0} worker(s) panicked")]
    WorkerPanic(usize),
}

/// Everything a worker needs, shared by all workers of a pool
pub struct DeliveryContext {
    pub queue: Arc<QueueService>,
    /// Bounces are counted here before an exhausted job leaves the queue
    pub campaigns: Arc<dyn CampaignRepository>,
    pub limiter: Arc<RateLimiter>,
    pub mailer: Arc<dyn Mailer>,
    pub retry: RetryPolicy,
    pub telemetry: Arc<Telemetry>,
}

struct DeliveryWorker {
    id: usize,
    ctx: Arc<DeliveryContext>,
    cancel: CancellationToken,
}

impl DeliveryWorker {
    async fn run(self) {
        debug!(worker_id = self.id, "delivery worker starting");

        loop {
            let job = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                job = self.ctx.queue.next() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            self.process(job).await;
        }

        debug!(worker_id = self.id, "delivery worker stopped");
    }

    async fn process(&self, mut job: EmailJob) {
        let queue = &self.ctx.queue;

        if queue.is_cancelled(job.campaign_id).await {
            self.drop_cancelled(&job).await;
            return;
        }

        if !self.ctx.limiter.try_acquire().await {
            trace!(worker_id = self.id, job_id = %job.id, "waiting for rate limit permit");
            tokio::select! {
                biased;
                // Job stays persisted and is picked up again after restart
                _ = self.cancel.cancelled() => return,
                _ = self.ctx.limiter.acquire() => {}
            }
        }

        // The campaign may have been cancelled while waiting for a permit
        if queue.is_cancelled(job.campaign_id).await {
            self.drop_cancelled(&job).await;
            return;
        }

        let attempt = job.next_attempt();
        let email = OutboundEmail::from(&job);

        match self.ctx.mailer.send(&email).await {
            Ok(receipt) => {
                job.attempts = attempt;
                queue.finish(&job).await;
                self.ctx.telemetry.emails_sent.inc();

                debug!(
                    worker_id = self.id,
                    job_id = %job.id,
                    campaign_id = %job.campaign_id,
                    attempt,
                    message_id = receipt.message_id.as_deref().unwrap_or("-"),
                    "email delivered"
                );

                queue.events().publish(JobOutcome::Delivered {
                    job_id: job.id,
                    campaign_id: job.campaign_id,
                    attempts: attempt,
                });
            }
            Err(send_error) => {
                job.attempts = attempt;
                job.last_error = Some(send_error.to_string());

                let policy = RetryPolicy {
                    max_attempts: if job.max_attempts > 0 {
                        job.max_attempts
                    } else {
                        self.ctx.retry.max_attempts
                    },
                    ..self.ctx.retry
                };

                match policy.decide(attempt, &send_error) {
                    RetryDecision::Retry { delay } => {
                        self.retry(job, attempt, delay, &send_error).await
                    }
                    RetryDecision::GiveUp { reason } => self.give_up(job, attempt, reason).await,
                }
            }
        }
    }

    async fn retry(&self, mut job: EmailJob, attempt: u32, delay: Duration, send_error: &SendError) {
        let queue = &self.ctx.queue;

        if let Err(e) = queue.record_retry(&mut job, delay).await {
            // An unrecorded attempt would be repeated after a restart
            let reason = format!("retry could not be persisted: {}", e);
            self.give_up(job, attempt, reason).await;
            return;
        }

        warn!(
            worker_id = self.id,
            job_id = %job.id,
            campaign_id = %job.campaign_id,
            attempt,
            retry_in_ms = delay.as_millis() as u64,
            error = %send_error,
            "send failed, retry scheduled"
        );

        let (job_id, campaign_id) = (job.id, job.campaign_id);
        if queue.retry_later(job, delay).await {
            self.ctx.telemetry.email_retries.inc();
            queue.events().publish(JobOutcome::RetryScheduled {
                job_id,
                campaign_id,
                attempt,
                delay,
            });
        } else {
            queue.events().publish(JobOutcome::Cancelled {
                job_id,
                campaign_id,
            });
        }
    }

    /// The bounce is stored before `finish`, so an idle queue implies every
    /// exhausted job has been counted.
    async fn give_up(&self, job: EmailJob, attempt: u32, reason: String) {
        error!(
            worker_id = self.id,
            job_id = %job.id,
            campaign_id = %job.campaign_id,
            attempts = attempt,
            reason = %reason,
            "email delivery failed permanently"
        );

        record_bounce(self.ctx.campaigns.as_ref(), job.campaign_id).await;
        self.ctx.queue.finish(&job).await;
        self.ctx.telemetry.emails_failed.inc();
        self.ctx.queue.events().publish(JobOutcome::Exhausted {
            job_id: job.id,
            campaign_id: job.campaign_id,
            attempts: attempt,
            reason,
        });
    }

    async fn drop_cancelled(&self, job: &EmailJob) {
        debug!(job_id = %job.id, campaign_id = %job.campaign_id, "skipping job of cancelled campaign");
        self.ctx.queue.finish(job).await;
        self.ctx.queue.events().publish(JobOutcome::Cancelled {
            job_id: job.id,
            campaign_id: job.campaign_id,
        });
    }
}

/// Supervised set of delivery workers
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Spawn `worker_count` workers consuming from the context's queue
    pub fn spawn(worker_count: usize, ctx: DeliveryContext) -> Self {
        let ctx = Arc::new(ctx);
        let cancel = CancellationToken::new();
        let worker_count = worker_count.max(1);

        let handles = (0..worker_count)
            .map(|id| {
                let worker = DeliveryWorker {
                    id,
                    ctx: ctx.clone(),
                    cancel: cancel.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(
            worker_count,
            transport = ctx.mailer.name(),
            rate_limit = ctx.limiter.max_permits(),
            "delivery workers started"
        );

        Self { handles, cancel }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    pub fn has_active_workers(&self) -> bool {
        self.handles.iter().any(|h| !h.is_finished())
    }

    /// Stop taking new jobs and wait for in-flight sends to finish
    pub async fn shutdown(mut self, timeout: Duration) -> Result<(), WorkerPoolError> {
        info!(
            worker_count = self.handles.len(),
            timeout_secs = timeout.as_secs(),
            "shutting down delivery workers"
        );
        self.cancel.cancel();

        let handles = std::mem::take(&mut self.handles);
        let join_all = async {
            let mut panicked = 0;
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "delivery worker panicked");
                    panicked += 1;
                }
            }
            panicked
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(0) => {
                info!("delivery workers stopped");
                Ok(())
            }
            Ok(panicked) => Err(WorkerPoolError::WorkerPanic(panicked)),
            Err(_) => {
                error!(timeout_secs = timeout.as_secs(), "worker shutdown timed out");
                Err(WorkerPoolError::ShutdownTimeout(timeout))
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.has_active_workers() {
            warn!("worker pool dropped without shutdown, cancelling workers");
            self.cancel.cancel();
        }
    }
}
