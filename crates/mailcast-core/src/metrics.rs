//! Campaign engagement reporting
//!
//! Rates are derived at read time from the stored counters and never
//! persisted. Counters are written only by the webhook processor and by
//! delivery workers giving up on a job.

use mailcast_common::types::CampaignId;
use mailcast_storage::models::{Campaign, CampaignMetrics, MetricKind};
use mailcast_storage::repository::CampaignRepository;
use serde::Serialize;
use tracing::{debug, warn};

/// Share of clicks assumed to convert. A placeholder estimate, not a
/// measured value.
pub const CONVERSION_FACTOR: f64 = 0.1;

/// Derived campaign metrics, percentages rounded to two decimals
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignReport {
    pub recipient_count: i64,
    pub opens: i64,
    pub clicks: i64,
    pub bounces: i64,
    pub unsubscribes: i64,
    pub open_rate: f64,
    pub click_through_rate: f64,
    pub bounce_rate: f64,
    pub unsubscribe_rate: f64,
    pub conversions: i64,
    pub conversion_rate: f64,
}

impl CampaignReport {
    pub fn new(recipient_count: i64, metrics: &CampaignMetrics) -> Self {
        let conversions = (metrics.clicks as f64 * CONVERSION_FACTOR).round() as i64;

        Self {
            recipient_count,
            opens: metrics.opens,
            clicks: metrics.clicks,
            bounces: metrics.bounces,
            unsubscribes: metrics.unsubscribes,
            open_rate: percentage(metrics.opens, recipient_count),
            click_through_rate: percentage(metrics.clicks, metrics.opens),
            bounce_rate: percentage(metrics.bounces, recipient_count),
            unsubscribe_rate: percentage(metrics.unsubscribes, recipient_count),
            conversions,
            conversion_rate: percentage(conversions, metrics.clicks),
        }
    }

    pub fn from_campaign(campaign: &Campaign) -> Self {
        Self::new(i64::from(campaign.recipient_count), &campaign.metrics)
    }
}

/// `part / whole` as a percentage with two decimals; zero when `whole` is
fn percentage(part: i64, whole: i64) -> f64 {
    if whole <= 0 {
        return 0.0;
    }
    let value = part as f64 / whole as f64 * 100.0;
    (value * 100.0).round() / 100.0
}

/// Counts a bounce for a job that exhausted its attempts. Failures are
/// logged; a lost bounce never blocks the job from leaving the queue.
pub(crate) async fn record_bounce(campaigns: &dyn CampaignRepository, campaign_id: CampaignId) {
    match campaigns.increment_metric(campaign_id, MetricKind::Bounces).await {
        Ok(true) => debug!(campaign_id = %campaign_id, "bounce recorded"),
        Ok(false) => debug!(campaign_id = %campaign_id, "campaign metrics frozen, bounce not recorded"),
        Err(e) => warn!(campaign_id = %campaign_id, error = %e, "failed to record bounce"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{DeliveryContext, RateLimiter, RetryPolicy, SendError, WorkerPool};
    use crate::events::{EventBus, JobOutcome};
    use crate::queue::QueueService;
    use crate::telemetry::Telemetry;
    use crate::testing::{job_for, new_campaign, ScriptedMailer};
    use mailcast_storage::models::CampaignStatus;
    use mailcast_storage::repository::{InMemoryCampaignRepository, InMemoryJobRepository};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    fn metrics(opens: i64, clicks: i64, bounces: i64, unsubscribes: i64) -> CampaignMetrics {
        CampaignMetrics {
            opens,
            clicks,
            bounces,
            unsubscribes,
        }
    }

    #[test]
    fn test_rates() {
        let report = CampaignReport::new(100, &metrics(25, 5, 0, 0));
        assert_eq!(report.open_rate, 25.0);
        assert_eq!(report.click_through_rate, 20.0);
        assert_eq!(report.bounce_rate, 0.0);
        assert_eq!(report.unsubscribe_rate, 0.0);
        assert_eq!(report.conversions, 1);
        assert_eq!(report.conversion_rate, 20.0);
    }

    #[test]
    fn test_rounding_to_two_decimals() {
        let report = CampaignReport::new(3, &metrics(1, 0, 2, 0));
        assert_eq!(report.open_rate, 33.33);
        assert_eq!(report.bounce_rate, 66.67);
    }

    #[test]
    fn test_zero_denominators() {
        let report = CampaignReport::new(0, &metrics(4, 3, 1, 1));
        assert_eq!(report.open_rate, 0.0);
        assert_eq!(report.bounce_rate, 0.0);
        assert_eq!(report.click_through_rate, 75.0);

        let report = CampaignReport::new(10, &metrics(0, 0, 0, 0));
        assert_eq!(report.click_through_rate, 0.0);
        assert_eq!(report.conversion_rate, 0.0);
        assert_eq!(report.conversions, 0);
    }

    #[test]
    fn test_serializes_camel_case() {
        let value = serde_json::to_value(CampaignReport::new(100, &metrics(25, 5, 0, 0))).unwrap();
        assert_eq!(value["openRate"], 25.0);
        assert_eq!(value["clickThroughRate"], 20.0);
        assert_eq!(value["recipientCount"], 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_job_bounces_once() {
        let campaigns = Arc::new(InMemoryCampaignRepository::new());
        let campaign = campaigns
            .create(new_campaign(CampaignStatus::Sending, 1))
            .await
            .unwrap();

        let events = EventBus::new(64);
        let mut outcomes = events.subscribe();
        let queue = Arc::new(QueueService::new(
            Arc::new(InMemoryJobRepository::new()),
            events,
        ));

        let mailer = Arc::new(ScriptedMailer::new());
        mailer.fail_always("gone@example.com", SendError::from_status(503, "unavailable"));
        let pool = WorkerPool::spawn(
            1,
            DeliveryContext {
                queue: queue.clone(),
                campaigns: campaigns.clone(),
                limiter: Arc::new(RateLimiter::default()),
                mailer: mailer.clone(),
                retry: RetryPolicy::default(),
                telemetry: Arc::new(Telemetry::new().unwrap()),
            },
        );

        queue
            .enqueue_bulk(vec![job_for(campaign.id, "gone@example.com")])
            .await
            .unwrap();

        loop {
            if let JobOutcome::Exhausted { attempts, .. } = outcomes.recv().await.unwrap() {
                assert_eq!(attempts, 3);
                break;
            }
        }
        pool.shutdown(Duration::from_secs(1)).await.unwrap();

        let stored = campaigns.get(campaign.id).await.unwrap().unwrap();
        assert_eq!(stored.metrics.bounces, 1);
        assert_eq!(mailer.attempts_to("gone@example.com"), 3);
    }

    #[tokio::test]
    async fn test_bounce_skipped_once_metrics_frozen() {
        let campaigns = InMemoryCampaignRepository::new();
        let live = campaigns
            .create(new_campaign(CampaignStatus::Sending, 1))
            .await
            .unwrap();
        let frozen = campaigns
            .create(new_campaign(CampaignStatus::Cancelled, 1))
            .await
            .unwrap();

        record_bounce(&campaigns, live.id).await;
        record_bounce(&campaigns, frozen.id).await;
        record_bounce(&campaigns, uuid::Uuid::new_v4()).await;

        let live = campaigns.get(live.id).await.unwrap().unwrap();
        let frozen = campaigns.get(frozen.id).await.unwrap().unwrap();
        assert_eq!(live.metrics.bounces, 1);
        assert_eq!(frozen.metrics.bounces, 0);
    }
}
