use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct JsonResponse {
    pub status: String,
    pub success: bool,
    pub message: String,
    pub code: Option<String>,
}

fn envelope(status: StatusCode, msg: &str, code: Option<&str>) -> (StatusCode, Json<JsonResponse>) {
    let success = status.is_success();
    (
        status,
        Json(JsonResponse {
            status: if success { "success" } else { "error" }.to_string(),
            success,
            message: msg.to_string(),
            code: code.map(str::to_string),
        }),
    )
}

impl JsonResponse {
    pub fn success(msg: &str) -> impl IntoResponse {
        envelope(StatusCode::OK, msg, None)
    }

    pub fn not_found(msg: &str) -> impl IntoResponse {
        envelope(StatusCode::NOT_FOUND, msg, None)
    }

    pub fn conflict(msg: &str) -> impl IntoResponse {
        envelope(StatusCode::CONFLICT, msg, None)
    }

    pub fn server_error(msg: &str) -> impl IntoResponse {
        envelope(StatusCode::INTERNAL_SERVER_ERROR, msg, None)
    }

    pub fn bad_gateway(msg: &str) -> impl IntoResponse {
        envelope(StatusCode::BAD_GATEWAY, msg, None)
    }

    pub fn unauthorized(msg: &str) -> impl IntoResponse {
        envelope(StatusCode::UNAUTHORIZED, msg, None)
    }

    pub fn bad_request(msg: &str) -> impl IntoResponse {
        envelope(StatusCode::BAD_REQUEST, msg, None)
    }

    pub fn too_many_requests(msg: &str) -> impl IntoResponse {
        envelope(StatusCode::TOO_MANY_REQUESTS, msg, None)
    }

    pub fn forbidden(msg: &str) -> impl IntoResponse {
        envelope(StatusCode::FORBIDDEN, msg, None)
    }

    pub fn forbidden_with_code(msg: &str, code: &str) -> impl IntoResponse {
        envelope(StatusCode::FORBIDDEN, msg, Some(code))
    }
}

/// Body of a 402 answer from the access guard.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct PaymentRequired {
    pub detail: String,
    pub trial_expired: bool,
    pub subscription_required: bool,
    pub redirect_to: String,
}

impl PaymentRequired {
    pub fn new(detail: impl Into<String>, trial_expired: bool) -> Self {
        Self {
            detail: detail.into(),
            trial_expired,
            subscription_required: true,
            redirect_to: "/pricing".to_string(),
        }
    }
}

impl IntoResponse for PaymentRequired {
    fn into_response(self) -> Response {
        (StatusCode::PAYMENT_REQUIRED, Json(self)).into_response()
    }
}
