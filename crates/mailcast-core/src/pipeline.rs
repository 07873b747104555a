//! Wiring of the delivery pipeline
//!
//! Owns the queue, the worker pool and the outcome subscribers, and stops
//! them in order on shutdown.

use mailcast_common::{Config, Result};
use mailcast_storage::repository::{
    CampaignRepository, DbCampaignRepository, DbJobRepository, DbNotificationRepository,
    InMemoryCampaignRepository, InMemoryJobRepository, InMemoryNotificationRepository,
    JobRepository, NotificationRepository,
};
use mailcast_storage::DatabasePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::delivery::{DeliveryContext, Mailer, RateLimiter, RetryPolicy, WorkerPool};
use crate::dispatch::Dispatcher;
use crate::events::EventBus;
use crate::lifecycle::{CampaignLifecycle, LifecycleSubscriber};
use crate::notify::StoreNotifier;
use crate::queue::QueueService;
use crate::telemetry::Telemetry;
use crate::webhook::WebhookProcessor;

/// Repositories the pipeline runs on
#[derive(Clone)]
pub struct Stores {
    pub campaigns: Arc<dyn CampaignRepository>,
    pub jobs: Arc<dyn JobRepository>,
    pub notifications: Arc<dyn NotificationRepository>,
    /// Present when running on Postgres
    pub database: Option<DatabasePool>,
}

impl Stores {
    pub fn database(pool: DatabasePool) -> Self {
        Self {
            campaigns: Arc::new(DbCampaignRepository::new(pool.clone())),
            jobs: Arc::new(DbJobRepository::new(pool.clone())),
            notifications: Arc::new(DbNotificationRepository::new(pool.clone())),
            database: Some(pool),
        }
    }

    /// Process-local stores; nothing survives a restart
    pub fn in_memory() -> Self {
        Self {
            campaigns: Arc::new(InMemoryCampaignRepository::new()),
            jobs: Arc::new(InMemoryJobRepository::new()),
            notifications: Arc::new(InMemoryNotificationRepository::new()),
            database: None,
        }
    }

    pub async fn health_check(&self) -> Result<()> {
        match &self.database {
            Some(pool) => pool.health_check().await,
            None => Ok(()),
        }
    }
}

/// Running delivery pipeline
pub struct Pipeline {
    pub stores: Stores,
    pub queue: Arc<QueueService>,
    pub lifecycle: Arc<CampaignLifecycle>,
    pub dispatcher: Arc<Dispatcher>,
    pub webhooks: Arc<WebhookProcessor>,
    pub telemetry: Arc<Telemetry>,
    workers: WorkerPool,
    subscribers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    shutdown_timeout: Duration,
}

impl Pipeline {
    /// Build every component, reload persisted jobs and start the workers
    pub async fn start(config: &Config, stores: Stores, mailer: Arc<dyn Mailer>) -> Result<Self> {
        let telemetry = Arc::new(Telemetry::new()?);
        let events = EventBus::new(config.queue.event_buffer);
        let queue = Arc::new(QueueService::new(stores.jobs.clone(), events.clone()));

        let lifecycle = Arc::new(CampaignLifecycle::new(
            stores.campaigns.clone(),
            queue.clone(),
            Arc::new(StoreNotifier::new(stores.notifications.clone())),
        ));
        let retry = RetryPolicy::from_config(&config.retry);
        let dispatcher = Arc::new(Dispatcher::new(
            stores.campaigns.clone(),
            queue.clone(),
            lifecycle.clone(),
            retry.max_attempts,
        ));
        let webhooks = Arc::new(WebhookProcessor::new(
            stores.campaigns.clone(),
            telemetry.clone(),
        ));

        // Subscribe before any job can run so no outcome is missed
        let cancel = CancellationToken::new();
        let subscribers = vec![LifecycleSubscriber::spawn(
            lifecycle.clone(),
            events.subscribe(),
            cancel.clone(),
        )];

        queue.recover().await?;
        // Campaigns whose last jobs finished just before a restart
        lifecycle.sweep().await?;

        let workers = WorkerPool::spawn(
            config.queue.worker_count,
            DeliveryContext {
                queue: queue.clone(),
                campaigns: stores.campaigns.clone(),
                limiter: Arc::new(RateLimiter::from_config(&config.queue)),
                mailer,
                retry,
                telemetry: telemetry.clone(),
            },
        );

        info!(
            workers = workers.worker_count(),
            max_attempts = retry.max_attempts,
            persistent = stores.database.is_some(),
            "delivery pipeline started"
        );

        Ok(Self {
            stores,
            queue,
            lifecycle,
            dispatcher,
            webhooks,
            telemetry,
            workers,
            subscribers,
            cancel,
            shutdown_timeout: config.queue.shutdown_timeout(),
        })
    }

    /// Stop the workers, let in-flight sends finish, then stop subscribers.
    /// Subscribers drain outcomes already published before they exit.
    pub async fn shutdown(self) -> Result<()> {
        let workers = self.workers.shutdown(self.shutdown_timeout).await;
        self.queue.close().await;

        self.cancel.cancel();
        for handle in self.subscribers {
            if let Err(e) = handle.await {
                warn!(error = %e, "outcome subscriber panicked");
            }
        }

        workers.map_err(|e| mailcast_common::Error::Internal(e.to_string()))?;
        info!("delivery pipeline stopped");
        Ok(())
    }
}
