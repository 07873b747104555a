//! Provider delivery-event processing
//!
//! Events arrive in batches. Each event is resolved to its campaign and
//! turned into at most one atomic counter increment; a bad event never
//! aborts the rest of the batch.

use chrono::Utc;
use mailcast_common::types::CampaignId;
use mailcast_storage::models::{CampaignStatus, MetricKind, CAMPAIGN_ID_ARG};
use mailcast_storage::repository::CampaignRepository;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::telemetry::Telemetry;

/// Message id given to synthesized click events
pub const SYNTHETIC_MESSAGE_ID: &str = "custom";

/// One provider event. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub event: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub sg_message_id: Option<String>,
    #[serde(default)]
    pub sg_event_id: Option<String>,
    #[serde(default, rename = "campaignId")]
    pub campaign_id: Option<String>,
    #[serde(default, rename = "customArgs")]
    pub custom_args: Option<HashMap<String, Value>>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub useragent: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl DeliveryEvent {
    /// Campaign id from the event itself or from its custom args
    pub fn campaign_ref(&self) -> Option<&str> {
        self.campaign_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .or_else(|| {
                self.custom_args
                    .as_ref()?
                    .get(CAMPAIGN_ID_ARG)?
                    .as_str()
                    .filter(|id| !id.is_empty())
            })
    }
}

/// Effect of an event type on campaign counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventEffect {
    Increment(MetricKind),
    Informational,
    Ignored,
}

impl EventEffect {
    pub fn of(event_type: &str) -> Self {
        match event_type {
            "open" => EventEffect::Increment(MetricKind::Opens),
            "click" => EventEffect::Increment(MetricKind::Clicks),
            "bounce" | "dropped" | "deferred" => EventEffect::Increment(MetricKind::Bounces),
            "spamreport" | "unsubscribe" => EventEffect::Increment(MetricKind::Unsubscribes),
            "delivered" => EventEffect::Informational,
            _ => EventEffect::Ignored,
        }
    }
}

/// How a single event was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventResult {
    Applied,
    Informational,
    Duplicate,
    MissingCampaign,
    UnknownCampaign,
    Frozen,
    Ignored,
    Malformed,
    Failed,
}

impl EventResult {
    pub fn as_str(self) -> &'static str {
        match self {
            EventResult::Applied => "applied",
            EventResult::Informational => "informational",
            EventResult::Duplicate => "duplicate",
            EventResult::MissingCampaign => "missing_campaign",
            EventResult::UnknownCampaign => "unknown_campaign",
            EventResult::Frozen => "frozen",
            EventResult::Ignored => "ignored",
            EventResult::Malformed => "malformed",
            EventResult::Failed => "failed",
        }
    }
}

/// Per-batch tally
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub received: usize,
    pub applied: usize,
    pub informational: usize,
    pub duplicates: usize,
    pub missing_campaign: usize,
    pub unknown_campaign: usize,
    pub frozen: usize,
    pub ignored: usize,
    pub malformed: usize,
    pub failed: usize,
}

impl BatchReport {
    fn record(&mut self, result: EventResult) {
        self.received += 1;
        match result {
            EventResult::Applied => self.applied += 1,
            EventResult::Informational => self.informational += 1,
            EventResult::Duplicate => self.duplicates += 1,
            EventResult::MissingCampaign => self.missing_campaign += 1,
            EventResult::UnknownCampaign => self.unknown_campaign += 1,
            EventResult::Frozen => self.frozen += 1,
            EventResult::Ignored => self.ignored += 1,
            EventResult::Malformed => self.malformed += 1,
            EventResult::Failed => self.failed += 1,
        }
    }
}

/// Applies provider events to campaign counters
pub struct WebhookProcessor {
    campaigns: Arc<dyn CampaignRepository>,
    telemetry: Arc<Telemetry>,
}

impl WebhookProcessor {
    pub fn new(campaigns: Arc<dyn CampaignRepository>, telemetry: Arc<Telemetry>) -> Self {
        Self {
            campaigns,
            telemetry,
        }
    }

    /// Process one webhook delivery.
    ///
    /// Message ids are deduplicated within this batch only; a redelivered
    /// batch is counted again.
    pub async fn process_batch(&self, events: Vec<Value>) -> BatchReport {
        let mut report = BatchReport::default();
        let mut seen = HashSet::new();

        for value in events {
            let result = match serde_json::from_value::<DeliveryEvent>(value) {
                Ok(event) => self.process_event(&event, &mut seen).await,
                Err(e) => {
                    debug!(error = %e, "skipping malformed webhook event");
                    EventResult::Malformed
                }
            };
            self.telemetry.record_webhook_event(result.as_str());
            report.record(result);
        }

        info!(
            received = report.received,
            applied = report.applied,
            duplicates = report.duplicates,
            skipped = report.received - report.applied - report.informational,
            "webhook batch processed"
        );
        report
    }

    /// Count a click on a tracked link
    pub async fn record_click(&self, campaign_id: &str) -> BatchReport {
        let event = DeliveryEvent {
            event: "click".to_string(),
            email: Some("unknown@example.com".to_string()),
            timestamp: Some(Utc::now().timestamp()),
            sg_message_id: Some(SYNTHETIC_MESSAGE_ID.to_string()),
            campaign_id: Some(campaign_id.to_string()),
            ..DeliveryEvent::default()
        };

        match serde_json::to_value(event) {
            Ok(value) => self.process_batch(vec![value]).await,
            Err(e) => {
                warn!(error = %e, "failed to build click event");
                BatchReport::default()
            }
        }
    }

    async fn process_event(&self, event: &DeliveryEvent, seen: &mut HashSet<String>) -> EventResult {
        let Some(campaign_ref) = event.campaign_ref() else {
            debug!(event = %event.event, "event without campaign id");
            return EventResult::MissingCampaign;
        };

        if let Some(message_id) = &event.sg_message_id {
            if !seen.insert(message_id.clone()) {
                debug!(message_id = %message_id, "duplicate message id in batch");
                return EventResult::Duplicate;
            }
        }

        let Ok(campaign_id) = Uuid::parse_str(campaign_ref) else {
            debug!(campaign_ref, "event references an invalid campaign id");
            return EventResult::UnknownCampaign;
        };

        let campaign = match self.campaigns.get(campaign_id).await {
            Ok(Some(campaign)) => campaign,
            Ok(None) => {
                debug!(campaign_id = %campaign_id, "event for unknown campaign");
                return EventResult::UnknownCampaign;
            }
            Err(e) => {
                warn!(campaign_id = %campaign_id, error = %e, "campaign lookup failed");
                return EventResult::Failed;
            }
        };

        if campaign
            .status_enum()
            .map_or(true, CampaignStatus::metrics_frozen)
        {
            debug!(
                campaign_id = %campaign_id,
                status = %campaign.status,
                "metrics frozen, skipping event"
            );
            return EventResult::Frozen;
        }

        match EventEffect::of(&event.event) {
            EventEffect::Increment(kind) => self.increment(campaign_id, kind).await,
            EventEffect::Informational => {
                debug!(
                    campaign_id = %campaign_id,
                    email = event.email.as_deref().unwrap_or("-"),
                    "delivery confirmed"
                );
                EventResult::Informational
            }
            EventEffect::Ignored => EventResult::Ignored,
        }
    }

    async fn increment(&self, campaign_id: CampaignId, kind: MetricKind) -> EventResult {
        match self.campaigns.increment_metric(campaign_id, kind).await {
            Ok(true) => {
                debug!(campaign_id = %campaign_id, metric = %kind, "campaign metric incremented");
                EventResult::Applied
            }
            // Frozen between the lookup and the increment
            Ok(false) => EventResult::Frozen,
            Err(e) => {
                warn!(campaign_id = %campaign_id, metric = %kind, error = %e, "metric update failed");
                EventResult::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::new_campaign;
    use mailcast_storage::repository::InMemoryCampaignRepository;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Fixture {
        campaigns: Arc<InMemoryCampaignRepository>,
        telemetry: Arc<Telemetry>,
        processor: WebhookProcessor,
    }

    fn fixture() -> Fixture {
        let campaigns = Arc::new(InMemoryCampaignRepository::new());
        let telemetry = Arc::new(Telemetry::new().unwrap());
        let processor = WebhookProcessor::new(campaigns.clone(), telemetry.clone());
        Fixture {
            campaigns,
            telemetry,
            processor,
        }
    }

    async fn campaign(f: &Fixture, status: CampaignStatus) -> CampaignId {
        f.campaigns.create(new_campaign(status, 100)).await.unwrap().id
    }

    async fn metrics(f: &Fixture, id: CampaignId) -> mailcast_storage::models::CampaignMetrics {
        f.campaigns.get(id).await.unwrap().unwrap().metrics
    }

    #[tokio::test]
    async fn test_duplicate_message_ids_counted_once() {
        let f = fixture();
        let id = campaign(&f, CampaignStatus::Sending).await;

        let report = f
            .processor
            .process_batch(vec![
                json!({"event": "open", "sg_message_id": "A", "campaignId": id.to_string()}),
                json!({"event": "click", "sg_message_id": "A", "campaignId": id.to_string()}),
                json!({"event": "open", "sg_message_id": "B", "campaignId": id.to_string()}),
            ])
            .await;

        assert_eq!(report.received, 3);
        assert_eq!(report.applied, 2);
        assert_eq!(report.duplicates, 1);

        let m = metrics(&f, id).await;
        assert_eq!(m.opens, 2);
        assert_eq!(m.clicks, 0);
    }

    #[tokio::test]
    async fn test_events_without_message_id_are_not_deduplicated() {
        let f = fixture();
        let id = campaign(&f, CampaignStatus::Sent).await;
        let event = json!({"event": "open", "campaignId": id.to_string()});

        let report = f.processor.process_batch(vec![event.clone(), event]).await;
        assert_eq!(report.applied, 2);
        assert_eq!(metrics(&f, id).await.opens, 2);
    }

    #[tokio::test]
    async fn test_event_type_mapping() {
        let f = fixture();
        let id = campaign(&f, CampaignStatus::Sending).await;
        let events = [
            "open", "click", "bounce", "dropped", "deferred", "spamreport", "unsubscribe",
            "delivered", "processed",
        ]
        .iter()
        .enumerate()
        .map(|(i, event)| {
            json!({"event": event, "sg_message_id": format!("m{}", i), "campaignId": id.to_string()})
        })
        .collect();

        let report = f.processor.process_batch(events).await;
        assert_eq!(report.applied, 7);
        assert_eq!(report.informational, 1);
        assert_eq!(report.ignored, 1);

        let m = metrics(&f, id).await;
        assert_eq!((m.opens, m.clicks, m.bounces, m.unsubscribes), (1, 1, 3, 2));
    }

    #[tokio::test]
    async fn test_frozen_campaigns_are_never_mutated() {
        let f = fixture();
        let frozen = campaign(&f, CampaignStatus::Draft).await;
        let active = campaign(&f, CampaignStatus::Sending).await;

        let report = f
            .processor
            .process_batch(vec![
                json!({"event": "open", "sg_message_id": "1", "campaignId": frozen.to_string()}),
                json!({"event": "open", "sg_message_id": "2", "campaignId": active.to_string()}),
            ])
            .await;

        assert_eq!(report.frozen, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(metrics(&f, frozen).await, Default::default());
        assert_eq!(metrics(&f, active).await.opens, 1);
    }

    #[tokio::test]
    async fn test_bad_events_do_not_abort_batch() {
        let f = fixture();
        let id = campaign(&f, CampaignStatus::Sending).await;

        let report = f
            .processor
            .process_batch(vec![
                json!("not an object"),
                json!({"email": "no-event@example.com"}),
                json!({"event": "open", "email": "example@test.com"}),
                json!({"event": "open", "campaignId": "not-a-uuid"}),
                json!({"event": "open", "campaignId": Uuid::new_v4().to_string()}),
                json!({"event": "click", "campaignId": id.to_string()}),
            ])
            .await;

        assert_eq!(report.received, 6);
        assert_eq!(report.malformed, 2);
        assert_eq!(report.missing_campaign, 1);
        assert_eq!(report.unknown_campaign, 2);
        assert_eq!(report.applied, 1);
        assert_eq!(metrics(&f, id).await.clicks, 1);
    }

    #[tokio::test]
    async fn test_campaign_id_from_custom_args() {
        let f = fixture();
        let id = campaign(&f, CampaignStatus::Sending).await;

        let report = f
            .processor
            .process_batch(vec![json!({
                "event": "unsubscribe",
                "customArgs": {"campaignId": id.to_string()},
                "unexpected": {"nested": true}
            })])
            .await;

        assert_eq!(report.applied, 1);
        assert_eq!(metrics(&f, id).await.unsubscribes, 1);
        assert_eq!(
            f.telemetry
                .webhook_events
                .with_label_values(&["applied"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_record_click() {
        let f = fixture();
        let id = campaign(&f, CampaignStatus::Sent).await;

        assert_eq!(f.processor.record_click(&id.to_string()).await.applied, 1);
        assert_eq!(f.processor.record_click(&id.to_string()).await.applied, 1);
        assert_eq!(metrics(&f, id).await.clicks, 2);
    }

    #[test]
    fn test_campaign_ref_prefers_direct_field() {
        let event: DeliveryEvent = serde_json::from_value(json!({
            "event": "open",
            "campaignId": "direct",
            "customArgs": {"campaignId": "nested"}
        }))
        .unwrap();
        assert_eq!(event.campaign_ref(), Some("direct"));

        let event: DeliveryEvent = serde_json::from_value(json!({
            "event": "open",
            "campaignId": "",
            "customArgs": {"campaignId": "nested"}
        }))
        .unwrap();
        assert_eq!(event.campaign_ref(), Some("nested"));
    }
}
