use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::{error, warn};

use crate::{services::billing_webhooks::ProcessingResult, state::AppState};

fn signature_header(headers: &HeaderMap) -> Option<&str> {
    ["X-Signature", "Stripe-Signature"]
        .iter()
        .find_map(|name| headers.get(*name).and_then(|h| h.to_str().ok()))
}

pub async fn webhook(State(app_state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let sig = signature_header(&headers).unwrap_or_default();

    let result = app_state.webhooks.handle_event(&body, sig).await;
    let status = match &result {
        ProcessingResult::Processed { .. } | ProcessingResult::Skipped { .. } => StatusCode::OK,
        ProcessingResult::Rejected { reason } => {
            warn!(?reason, "billing webhook rejected");
            StatusCode::BAD_REQUEST
        }
        ProcessingResult::RetryableError { event_id, message } => {
            error!(?event_id, %message, "billing webhook failed; provider will retry");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(result)).into_response()
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request, http::StatusCode};
    use chrono::{Duration, Utc};
    use serde_json::json;
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::models::account::{Account, SubscriptionStatus};
    use crate::routes::{
        api_router,
        test_support::{body_json, test_app, WEBHOOK_SECRET},
    };
    use crate::services::stripe::signature::sign_payload;

    fn deliver(payload: &[u8], header: &'static str, sig: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/webhooks/billing")
            .header(header, sig)
            .header("content-type", "application/json")
            .body(Body::from(payload.to_vec()))
            .unwrap()
    }

    fn deletion(account: &Account, event_id: &str) -> Vec<u8> {
        let now = Utc::now();
        serde_json::to_vec(&json!({
            "id": event_id,
            "type": "customer.subscription.deleted",
            "created": now.timestamp(),
            "data": { "object": {
                "id": "sub_1",
                "customer": account.billing_customer_ref,
                "status": "canceled",
                "current_period_end": (now + Duration::days(10)).timestamp(),
            }}
        }))
        .unwrap()
    }

    fn subscriber() -> Account {
        Account {
            account_id: Uuid::new_v4(),
            billing_customer_ref: Some("cus_router".into()),
            subscription_ref: Some("sub_1".into()),
            subscription_status: SubscriptionStatus::Active,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn signed_event_is_processed_then_skipped() {
        let acct = subscriber();
        let id = acct.account_id;
        let app = test_app(vec![acct.clone()]);
        let payload = deletion(&acct, "evt_router_1");
        let sig = sign_payload(&payload, WEBHOOK_SECRET, Utc::now().timestamp());
        let router = api_router(app.state.clone());

        let resp = router
            .clone()
            .oneshot(deliver(&payload, "X-Signature", sig.clone()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["result"], "processed");
        assert_eq!(
            app.db.account(id).unwrap().subscription_status,
            SubscriptionStatus::Canceled
        );

        let resp = router
            .oneshot(deliver(&payload, "Stripe-Signature", sig))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["result"], "skipped");
        assert_eq!(body["reason"], "duplicate");
    }

    #[tokio::test]
    async fn bad_signature_is_rejected() {
        let acct = subscriber();
        let app = test_app(vec![acct.clone()]);
        let payload = deletion(&acct, "evt_router_2");
        let sig = sign_payload(&payload, "whsec_wrong", Utc::now().timestamp());

        let resp = api_router(app.state.clone())
            .oneshot(deliver(&payload, "X-Signature", sig))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(app.ledger.len(), 0);
    }

    #[tokio::test]
    async fn missing_signature_is_rejected() {
        let app = test_app(vec![]);
        let resp = api_router(app.state.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks/billing")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn handler_failure_answers_500() {
        let acct = subscriber();
        let app = test_app(vec![acct.clone()]);
        *app.db.fail_updates.lock().unwrap() = true;
        let payload = deletion(&acct, "evt_router_3");
        let sig = sign_payload(&payload, WEBHOOK_SECRET, Utc::now().timestamp());

        let resp = api_router(app.state.clone())
            .oneshot(deliver(&payload, "X-Signature", sig))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(resp).await["result"], "retryable_error");
    }
}
