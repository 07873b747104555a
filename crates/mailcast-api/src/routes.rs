//! API routes

use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::handlers::{campaigns, health, notifications, webhooks};
use crate::state::AppState;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let health_routes = Router::new()
        .route("/", get(health::health))
        .route("/live", get(health::liveness))
        .route("/ready", get(health::readiness));

    // Called by the mail provider and by recipients' mail clients
    let webhook_routes = Router::new()
        .route(
            "/provider",
            post(webhooks::receive_events).get(webhooks::probe),
        )
        .route("/click", get(webhooks::track_click));

    let campaign_routes = Router::new()
        .route("/", post(campaigns::launch_campaign))
        .route("/:campaign_id", get(campaigns::get_campaign))
        .route("/:campaign_id/metrics", get(campaigns::get_campaign_metrics))
        .route("/:campaign_id/dispatch", post(campaigns::dispatch_campaign))
        .route("/:campaign_id/complete", post(campaigns::complete_campaign))
        .route("/:campaign_id/cancel", post(campaigns::cancel_campaign));

    Router::new()
        .nest("/health", health_routes)
        .nest("/webhooks", webhook_routes)
        .nest("/api/v1/campaigns", campaign_routes)
        .route(
            "/api/v1/users/:user_id/notifications",
            get(notifications::list_notifications),
        )
        .route("/metrics", get(health::metrics))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
