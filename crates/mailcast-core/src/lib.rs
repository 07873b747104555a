//! Mailcast Core - Campaign delivery and event tracking
//!
//! This crate provides the delivery pipeline for Mailcast: the job queue,
//! the rate-limited worker pool, the campaign state machine, provider
//! webhook processing and engagement metrics.

pub mod delivery;
pub mod dispatch;
pub mod events;
pub mod lifecycle;
pub mod metrics;
pub mod notify;
pub mod pipeline;
pub mod queue;
pub mod telemetry;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;

pub use delivery::{
    build_mailer, DeliveryContext, LogMailer, Mailer, OutboundEmail, RateLimiter, RetryDecision,
    RetryPolicy, SendError, SendGridMailer, SendReceipt, SmtpMailer, WorkerPool,
};
pub use dispatch::{DispatchError, DispatchReceipt, Dispatcher, EmailTemplate};
pub use events::{EventBus, JobOutcome};
pub use lifecycle::{CampaignLifecycle, LifecycleError, LifecycleSubscriber, Transition};
pub use metrics::CampaignReport;
pub use notify::{LogNotifier, Notifier, StoreNotifier};
pub use pipeline::{Pipeline, Stores};
pub use queue::{QueueError, QueueService, QueueStats};
pub use telemetry::Telemetry;
pub use webhook::{BatchReport, DeliveryEvent, WebhookProcessor};
