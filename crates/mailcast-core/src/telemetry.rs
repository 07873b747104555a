//! Prometheus metrics for the delivery pipeline

use mailcast_common::{Error, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::queue::QueueStats;

/// Process-wide delivery metrics
#[derive(Clone)]
pub struct Telemetry {
    registry: Registry,
    pub emails_sent: IntCounter,
    pub emails_failed: IntCounter,
    pub email_retries: IntCounter,
    pub webhook_events: IntCounterVec,
    pub queue_depth: IntGauge,
}

fn metric_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registry: {}", e))
}

impl Telemetry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let emails_sent = IntCounter::new(
            "mailcast_emails_sent_total",
            "Emails accepted by the mail provider",
        )
        .map_err(metric_err)?;
        let emails_failed = IntCounter::new(
            "mailcast_emails_failed_total",
            "Emails that exhausted their attempts",
        )
        .map_err(metric_err)?;
        let email_retries = IntCounter::new(
            "mailcast_email_retries_total",
            "Failed send attempts scheduled for retry",
        )
        .map_err(metric_err)?;
        let webhook_events = IntCounterVec::new(
            Opts::new(
                "mailcast_webhook_events_total",
                "Provider webhook events by processing result",
            ),
            &["kind"],
        )
        .map_err(metric_err)?;
        let queue_depth = IntGauge::new(
            "mailcast_queue_depth",
            "Jobs ready, delayed or in flight",
        )
        .map_err(metric_err)?;

        registry
            .register(Box::new(emails_sent.clone()))
            .map_err(metric_err)?;
        registry
            .register(Box::new(emails_failed.clone()))
            .map_err(metric_err)?;
        registry
            .register(Box::new(email_retries.clone()))
            .map_err(metric_err)?;
        registry
            .register(Box::new(webhook_events.clone()))
            .map_err(metric_err)?;
        registry
            .register(Box::new(queue_depth.clone()))
            .map_err(metric_err)?;

        Ok(Self {
            registry,
            emails_sent,
            emails_failed,
            email_retries,
            webhook_events,
            queue_depth,
        })
    }

    pub fn observe_queue(&self, stats: QueueStats) {
        self.queue_depth
            .set(i64::try_from(stats.depth()).unwrap_or(i64::MAX));
    }

    pub fn record_webhook_event(&self, kind: &str) {
        self.webhook_events.with_label_values(&[kind]).inc();
    }

    /// Render every metric in the Prometheus text format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metric_err)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}
