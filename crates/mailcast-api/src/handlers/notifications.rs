//! Notification handlers

use axum::{
    extract::{Path, Query, State},
    Json,
};
use mailcast_storage::models::Notification;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 200;

#[derive(Debug, Deserialize)]
pub struct ListNotificationsQuery {
    pub limit: Option<i64>,
}

/// Campaign status notifications for a user, newest first
///
/// GET /api/v1/users/:user_id/notifications
pub async fn list_notifications(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<ListNotificationsQuery>,
) -> ApiResult<Json<Vec<Notification>>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let notifications = state
        .stores
        .notifications
        .list_by_user(user_id, limit)
        .await?;
    Ok(Json(notifications))
}
