use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, warn};

use crate::models::webhook_event::ProcessingStatus;
use crate::{responses::JsonResponse, routes::auth::session::AuthSession, state::AppState};

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

#[derive(Debug, Deserialize)]
pub struct WebhookEventsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

pub async fn list_webhook_events(
    State(app_state): State<AppState>,
    AuthSession(claims): AuthSession,
    Query(query): Query<WebhookEventsQuery>,
) -> Response {
    let Some(account_id) = claims.account_id() else {
        return JsonResponse::unauthorized("Invalid session").into_response();
    };
    // Admin flag comes from the store, never from the token.
    match app_state.db.find_account_by_id(account_id).await {
        Ok(Some(account)) if account.is_admin => {}
        Ok(_) => {
            warn!(%account_id, "non-admin requested webhook ledger");
            return JsonResponse::forbidden("Admin only").into_response();
        }
        Err(err) => {
            error!(?err, %account_id, "admin check failed");
            return JsonResponse::server_error("Failed to verify account").into_response();
        }
    }

    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        None => None,
        Some(raw) => match raw.parse::<ProcessingStatus>() {
            Ok(status) => Some(status),
            Err(msg) => return JsonResponse::bad_request(&msg).into_response(),
        },
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    match app_state.webhook_events.list_recent(status, limit).await {
        Ok(events) => Json(json!({ "success": true, "events": events })).into_response(),
        Err(err) => {
            error!(?err, "failed to list webhook events");
            JsonResponse::server_error("Failed to list webhook events").into_response()
        }
    }
}
