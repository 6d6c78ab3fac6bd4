//! Request-level entitlement gate.
//!
//! Every request outside the bypass list is authenticated, the account is
//! re-read from the store, and `evaluate_access` decides. Anything that stops
//! the evaluation from producing an answer denies.

use std::panic::{catch_unwind, AssertUnwindSafe};

use axum::{
    extract::{OriginalUri, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use tracing::{error, warn};

use crate::{
    models::account::{Account, SubscriptionStatus},
    responses::{JsonResponse, PaymentRequired},
    state::AppState,
    utils::{
        entitlement::{evaluate_access, AccessDecision, AccessStatus},
        jwt::{decode_jwt, token_from_headers},
    },
};

/// Paths a denied caller still needs: login, billing management, public pages.
pub const BYPASS_PREFIXES: &[&str] = &[
    "/api/auth",
    "/api/subscriptions",
    "/subscriptions/status",
    "/webhooks/billing",
    "/health",
    "/docs",
    "/openapi.json",
    "/pricing",
];

fn matches_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

pub fn is_bypassed(path: &str, extra: &[String]) -> bool {
    BYPASS_PREFIXES.iter().any(|p| matches_prefix(path, p))
        || extra.iter().any(|p| matches_prefix(path, p))
}

fn denial_message(account: Option<&Account>, decision: &AccessDecision) -> PaymentRequired {
    let status = account.map(|a| &a.subscription_status);
    match (decision.status, status) {
        (AccessStatus::Expired, Some(SubscriptionStatus::Trial)) => PaymentRequired::new(
            "Your free trial has ended. Subscribe to keep using the product.",
            true,
        ),
        (AccessStatus::Expired, Some(SubscriptionStatus::Canceled)) => PaymentRequired::new(
            "Your subscription has ended. Resubscribe to restore access.",
            false,
        ),
        _ => PaymentRequired::new("An active subscription is required to continue.", false),
    }
}

pub async fn enforce_access(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let path = req
        .extensions()
        .get::<OriginalUri>()
        .map(|uri| uri.path().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    if is_bypassed(&path, &state.config.access_bypass_paths) {
        return next.run(req).await;
    }

    let Some(token) = token_from_headers(req.headers()) else {
        return JsonResponse::unauthorized("Authentication required").into_response();
    };
    let claims = match decode_jwt(
        &token,
        &state.jwt_keys,
        &state.config.jwt_issuer,
        &state.config.jwt_audience,
    ) {
        Ok(data) => data.claims,
        Err(_) => return JsonResponse::unauthorized("Invalid or expired session").into_response(),
    };
    let Some(account_id) = claims.account_id() else {
        return JsonResponse::unauthorized("Invalid or expired session").into_response();
    };

    // Always the current row: the admin flag must never come from the token.
    let account = match state.db.find_account_by_id(account_id).await {
        Ok(Some(account)) => account,
        Ok(None) => {
            warn!(%account_id, "session refers to a missing account; denying");
            return denial_message(None, &AccessDecision::fail_closed()).into_response();
        }
        Err(err) => {
            error!(%account_id, ?err, "account lookup failed; denying");
            return denial_message(None, &AccessDecision::fail_closed()).into_response();
        }
    };

    let now = Utc::now();
    let decision = catch_unwind(AssertUnwindSafe(|| evaluate_access(&account, now)))
        .unwrap_or_else(|_| {
            error!(%account_id, "access evaluation panicked; denying");
            AccessDecision::fail_closed()
        });

    if decision.is_allowed() {
        req.extensions_mut().insert(decision);
        return next.run(req).await;
    }

    if decision.status.is_integrity_failure() {
        warn!(
            %account_id,
            status = decision.status.as_str(),
            stored_status = %account.subscription_status,
            trial_end = ?account.trial_end,
            "account data failed integrity check; access denied"
        );
    }
    denial_message(Some(&account), &decision).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::{
        api_router,
        test_support::{authed, body_json, test_app, test_app_with, test_config, token_for},
    };
    use crate::services::stripe::MockStripeService;
    use axum::{body::Body, http::Request, http::StatusCode};
    use chrono::Duration;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn account(status: SubscriptionStatus) -> Account {
        Account {
            account_id: Uuid::new_v4(),
            subscription_status: status,
            ..Default::default()
        }
    }

    #[test]
    fn bypass_matches_whole_segments() {
        assert!(is_bypassed("/health", &[]));
        assert!(is_bypassed("/api/subscriptions/status", &[]));
        assert!(is_bypassed("/subscriptions/status", &[]));
        assert!(!is_bypassed("/subscriptions/other", &[]));
        assert!(is_bypassed("/webhooks/billing", &[]));
        assert!(!is_bypassed("/healthz", &[]));
        assert!(!is_bypassed("/api/entitlement", &[]));
        assert!(is_bypassed("/status/live", &["/status".to_string()]));
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let app = test_app(vec![]);
        let resp = api_router(app.state.clone())
            .oneshot(
                Request::builder()
                    .uri("/api/entitlement")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn active_trial_passes_and_exposes_decision() {
        let now = Utc::now();
        let mut acct = account(SubscriptionStatus::Trial);
        acct.trial_start = Some(now - Duration::days(1));
        acct.trial_end = Some(now + Duration::days(6) + Duration::hours(1));
        let id = acct.account_id;
        let app = test_app(vec![acct]);
        let token = token_for(&app.state, id);

        let resp = api_router(app.state.clone())
            .oneshot(authed("GET", "/api/entitlement", &token, ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "trial");
        assert_eq!(body["days_left"], 6);
    }

    #[tokio::test]
    async fn expired_trial_gets_payment_required() {
        let now = Utc::now();
        let mut acct = account(SubscriptionStatus::Trial);
        acct.trial_start = Some(now - Duration::days(8));
        acct.trial_end = Some(now - Duration::days(1));
        let id = acct.account_id;
        let app = test_app(vec![acct]);
        let token = token_for(&app.state, id);

        let resp = api_router(app.state.clone())
            .oneshot(authed("GET", "/api/entitlement", &token, ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
        let body = body_json(resp).await;
        assert_eq!(body["trial_expired"], true);
        assert_eq!(body["subscription_required"], true);
        assert_eq!(body["redirect_to"], "/pricing");
    }

    #[tokio::test]
    async fn corrupt_trial_and_unknown_status_deny() {
        let corrupt = account(SubscriptionStatus::Trial);
        let unknown = account(SubscriptionStatus::Unrecognized("paused".into()));
        let ids = [corrupt.account_id, unknown.account_id];
        let app = test_app(vec![corrupt, unknown]);

        for id in ids {
            let token = token_for(&app.state, id);
            let resp = api_router(app.state.clone())
                .oneshot(authed("GET", "/api/entitlement", &token, ""))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
            let body = body_json(resp).await;
            assert_eq!(body["trial_expired"], false);
        }
    }

    #[tokio::test]
    async fn admin_flag_is_read_from_store_each_request() {
        let mut acct = account(SubscriptionStatus::None);
        acct.is_admin = true;
        let id = acct.account_id;
        let app = test_app(vec![acct.clone()]);
        let token = token_for(&app.state, id);
        let router = api_router(app.state.clone());

        let resp = router
            .clone()
            .oneshot(authed("GET", "/api/entitlement", &token, ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        acct.is_admin = false;
        app.db.upsert(acct);
        let resp = router
            .oneshot(authed("GET", "/api/entitlement", &token, ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(*app.db.lookups.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn store_failure_fails_closed() {
        let acct = account(SubscriptionStatus::Active);
        let id = acct.account_id;
        let mut app = test_app(vec![]);
        let failing = crate::db::mock_db::MockDb {
            should_fail: true,
            ..Default::default()
        };
        app.state.db = std::sync::Arc::new(failing);
        let token = token_for(&app.state, id);

        let resp = api_router(app.state.clone())
            .oneshot(authed("GET", "/api/entitlement", &token, ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[tokio::test]
    async fn configured_bypass_skips_the_gate() {
        let app = test_app_with(
            vec![],
            MockStripeService::new(),
            test_config(&[("ACCESS_BYPASS_PATHS", "/api/entitlement")]),
        );
        let resp = api_router(app.state.clone())
            .oneshot(
                Request::builder()
                    .uri("/api/entitlement")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        // No decision was attached, so the handler itself refuses.
        assert_ne!(resp.status(), StatusCode::PAYMENT_REQUIRED);
        assert_ne!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
