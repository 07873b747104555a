//! Campaign handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use mailcast_common::types::EmailAddress;
use mailcast_common::Error;
use mailcast_core::dispatch::prepare_attachments;
use mailcast_core::{CampaignReport, EmailTemplate, Transition};
use mailcast_storage::models::{Campaign, NewCampaign};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

/// Request body for creating and dispatching a campaign
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchCampaignRequest {
    pub user_id: Uuid,
    pub name: String,
    pub subject: String,
    pub from_address: String,
    pub segment_id: Option<String>,
    pub segment_name: Option<String>,
    #[serde(default)]
    pub text_body: String,
    pub html_body: Option<String>,
    /// Paths of files to attach
    #[serde(default)]
    pub attachments: Vec<String>,
    pub recipients: Vec<String>,
}

/// Request body for dispatching an existing campaign
#[derive(Debug, Deserialize)]
pub struct DispatchRequest {
    pub recipients: Vec<String>,
}

/// Campaign with its derived metrics
#[derive(Debug, Serialize)]
pub struct CampaignResponse {
    #[serde(flatten)]
    pub campaign: Campaign,
    pub report: CampaignReport,
}

impl From<Campaign> for CampaignResponse {
    fn from(campaign: Campaign) -> Self {
        let report = CampaignReport::from_campaign(&campaign);
        Self { campaign, report }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchResponse {
    pub campaign: CampaignResponse,
    pub jobs_queued: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResponse {
    pub campaign_id: Uuid,
    pub jobs_queued: usize,
}

/// Result of a status action
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub id: Uuid,
    pub status: String,
    pub changed: bool,
}

impl StatusResponse {
    fn new(id: Uuid, transition: Transition) -> Self {
        let (status, changed) = match transition {
            Transition::Changed { to, .. } => (to, true),
            Transition::Unchanged(current) => (current, false),
        };
        Self {
            id,
            status: status.to_string(),
            changed,
        }
    }
}

fn validate(input: &LaunchCampaignRequest) -> Result<(), Error> {
    if input.name.trim().is_empty() {
        return Err(Error::Validation("Campaign name is required".to_string()));
    }
    if input.subject.trim().is_empty() {
        return Err(Error::Validation("Subject is required".to_string()));
    }
    if EmailAddress::parse(&input.from_address).is_none() {
        return Err(Error::Validation(format!(
            "Invalid sender address: {}",
            input.from_address
        )));
    }
    if input.text_body.is_empty() && input.html_body.is_none() {
        return Err(Error::Validation(
            "Either htmlBody or textBody is required".to_string(),
        ));
    }
    Ok(())
}

async fn load(state: &AppState, id: Uuid) -> ApiResult<Campaign> {
    Ok(state
        .stores
        .campaigns
        .get(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("campaign {}", id)))?)
}

/// Create a campaign and queue it for every recipient
///
/// POST /api/v1/campaigns
pub async fn launch_campaign(
    State(state): State<AppState>,
    Json(input): Json<LaunchCampaignRequest>,
) -> ApiResult<(StatusCode, Json<LaunchResponse>)> {
    validate(&input)?;

    let new_campaign = NewCampaign {
        user_id: input.user_id,
        name: input.name,
        subject: input.subject,
        from_address: input.from_address,
        segment_id: input.segment_id,
        segment_name: input.segment_name,
        recipient_count: 0,
        text_body: input.text_body,
        html_body: input.html_body,
        attachments: input.attachments,
        status: None,
    };

    let (campaign, receipt) = state
        .dispatcher
        .launch(new_campaign, input.recipients)
        .await?;
    info!(campaign_id = %campaign.id, jobs_queued = receipt.jobs_queued, "campaign launched");

    // Re-read so the response shows the status after dispatch
    let campaign = load(&state, campaign.id).await?;

    Ok((
        StatusCode::CREATED,
        Json(LaunchResponse {
            campaign: campaign.into(),
            jobs_queued: receipt.jobs_queued,
        }),
    ))
}

/// Queue an existing campaign for the given recipients
///
/// POST /api/v1/campaigns/:campaign_id/dispatch
pub async fn dispatch_campaign(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
    Json(input): Json<DispatchRequest>,
) -> ApiResult<(StatusCode, Json<DispatchResponse>)> {
    let campaign = load(&state, campaign_id).await?;
    let attachments = prepare_attachments(&campaign.attachments).await;

    let receipt = state
        .dispatcher
        .dispatch_campaign(
            campaign_id,
            input.recipients,
            EmailTemplate::from_campaign(&campaign, attachments),
        )
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(DispatchResponse {
            campaign_id,
            jobs_queued: receipt.jobs_queued,
        }),
    ))
}

/// GET /api/v1/campaigns/:campaign_id
pub async fn get_campaign(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
) -> ApiResult<Json<CampaignResponse>> {
    Ok(Json(load(&state, campaign_id).await?.into()))
}

/// GET /api/v1/campaigns/:campaign_id/metrics
pub async fn get_campaign_metrics(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
) -> ApiResult<Json<CampaignReport>> {
    let campaign = load(&state, campaign_id).await?;
    Ok(Json(CampaignReport::from_campaign(&campaign)))
}

/// POST /api/v1/campaigns/:campaign_id/complete
pub async fn complete_campaign(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
) -> ApiResult<Json<StatusResponse>> {
    let transition = state.lifecycle.mark_completed(campaign_id).await?;
    Ok(Json(StatusResponse::new(campaign_id, transition)))
}

/// POST /api/v1/campaigns/:campaign_id/cancel
pub async fn cancel_campaign(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
) -> ApiResult<Json<StatusResponse>> {
    let transition = state.lifecycle.cancel(campaign_id).await?;
    Ok(Json(StatusResponse::new(campaign_id, transition)))
}
