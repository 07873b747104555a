//! Mail provider webhook handlers

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::state::AppState;

/// Webhook acknowledgement
#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub success: bool,
    pub processed: usize,
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

/// Receive a batch of delivery events
///
/// POST /webhooks/provider
///
/// Answers 200 even when individual events fail so the provider does not
/// redeliver the batch; only an unusable body is rejected.
pub async fn receive_events(State(state): State<AppState>, body: Bytes) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, bytes = body.len(), "invalid JSON in webhook payload");
            return bad_request("Invalid JSON in webhook payload");
        }
    };

    let Value::Array(events) = payload else {
        warn!("webhook payload is not an array");
        return bad_request("Invalid webhook payload format");
    };

    let processed = events.len();
    debug!(processed, "received webhook batch");
    let report = state.webhooks.process_batch(events).await;
    if report.failed > 0 {
        warn!(failed = report.failed, "some webhook events could not be applied");
    }

    Json(WebhookResponse {
        success: true,
        processed,
    })
    .into_response()
}

/// Availability probe for provider configuration
///
/// GET /webhooks/provider
pub async fn probe() -> Json<Value> {
    Json(json!({
        "status": "OK",
        "message": "Webhook endpoint is available. POST requests will be processed.",
        "info": "Configure this URL as the event webhook in the mail provider dashboard."
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickQuery {
    pub campaign_id: Option<String>,
    pub redirect_url: Option<String>,
}

/// Count a tracked link click, then redirect to the link target
///
/// GET /webhooks/click?campaignId=&redirectUrl=
pub async fn track_click(
    State(state): State<AppState>,
    Query(query): Query<ClickQuery>,
) -> Response {
    let Some(redirect_url) = query.redirect_url.filter(|url| !url.is_empty()) else {
        return bad_request("Missing redirect URL");
    };

    if let Some(campaign_id) = query.campaign_id.as_deref().filter(|id| !id.is_empty()) {
        let report = state.webhooks.record_click(campaign_id).await;
        info!(campaign_id, counted = report.applied == 1, "link click tracked");
    }

    (StatusCode::FOUND, [(header::LOCATION, redirect_url)]).into_response()
}
