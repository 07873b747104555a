//! Shared handler state

use mailcast_core::{
    CampaignLifecycle, Dispatcher, Pipeline, QueueService, Stores, Telemetry, WebhookProcessor,
};
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub stores: Stores,
    pub queue: Arc<QueueService>,
    pub lifecycle: Arc<CampaignLifecycle>,
    pub dispatcher: Arc<Dispatcher>,
    pub webhooks: Arc<WebhookProcessor>,
    pub telemetry: Arc<Telemetry>,
}

impl AppState {
    pub fn from_pipeline(pipeline: &Pipeline) -> Self {
        Self {
            stores: pipeline.stores.clone(),
            queue: pipeline.queue.clone(),
            lifecycle: pipeline.lifecycle.clone(),
            dispatcher: pipeline.dispatcher.clone(),
            webhooks: pipeline.webhooks.clone(),
            telemetry: pipeline.telemetry.clone(),
        }
    }
}
