pub mod admin;
pub mod auth;
pub mod stripe;
pub mod subscriptions;
#[cfg(test)]
pub(crate) mod test_support;

use axum::{
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};

use crate::{
    state::AppState,
    utils::{access_guard::enforce_access, entitlement::AccessDecision},
};

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Protected probe: echoes the decision the access guard attached.
pub async fn entitlement(Extension(decision): Extension<AccessDecision>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": decision.status.as_str(),
        "access": decision.access,
        "days_left": decision.days_left,
    }))
}

/// Every route with the access guard applied. Transport layers (CORS,
/// rate limiting, tracing) are added by the binary.
pub fn api_router(state: AppState) -> Router {
    let subscription_routes = Router::new()
        .route("/status", get(subscriptions::subscription_status))
        .route("/start-trial", post(subscriptions::start_trial))
        .route("/checkout", post(subscriptions::create_checkout))
        .route("/cancel", post(subscriptions::cancel_subscription))
        .route("/reactivate", post(subscriptions::reactivate_subscription))
        .route("/portal", post(subscriptions::billing_portal));

    let admin_routes = Router::new().route("/webhook-events", get(admin::list_webhook_events));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/billing", post(stripe::webhook))
        .route("/api/entitlement", get(entitlement))
        .route("/subscriptions/status", get(subscriptions::subscription_status))
        .nest("/api/subscriptions", subscription_routes)
        .nest("/api/admin", admin_routes)
        .layer(middleware::from_fn_with_state(state.clone(), enforce_access))
        .with_state(state)
}
