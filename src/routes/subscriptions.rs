use std::collections::BTreeMap;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::{
    models::{
        account::{Account, SubscriptionStatus},
        subscription_action::SubscriptionActionKind,
    },
    responses::JsonResponse,
    routes::auth::{claims::Claims, session::AuthSession},
    services::{
        abuse::AbuseAction,
        stripe::{CreateBillingPortalSessionRequest, CreateCheckoutSessionRequest},
    },
    state::AppState,
    utils::{
        entitlement::{evaluate_access, trial_window},
        time::from_unix,
    },
};

/// Optional client-side context for account actions.
#[derive(Debug, Default, Deserialize)]
pub struct ActionBody {
    /// Stable fingerprint of the payment instrument, when the client knows it.
    pub payment_fingerprint: Option<String>,
}

async fn load_account(app_state: &AppState, claims: &Claims) -> Result<Account, Response> {
    let Some(account_id) = claims.account_id() else {
        return Err(JsonResponse::unauthorized("Invalid session").into_response());
    };
    match app_state.db.find_account_by_id(account_id).await {
        Ok(Some(account)) => Ok(account),
        Ok(None) => Err(JsonResponse::not_found("Account not found").into_response()),
        Err(err) => {
            error!(?err, %account_id, "failed to load account");
            Err(JsonResponse::server_error("Failed to load account").into_response())
        }
    }
}

/// Runs the abuse check for `action` and records the attempt. `Err` carries
/// the 403 for a blocked action.
async fn screen_action(
    app_state: &AppState,
    account: &Account,
    action: SubscriptionActionKind,
    payment_fingerprint: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), Response> {
    let verdict = app_state
        .abuse
        .assess(account, action, payment_fingerprint, now)
        .await;
    app_state
        .abuse
        .record(account, action, payment_fingerprint, &verdict, now)
        .await;

    match verdict.action {
        AbuseAction::Block => {
            warn!(
                account_id = %account.account_id,
                action = %action,
                risk_score = verdict.risk_score,
                indicators = ?verdict.indicators,
                "subscription action blocked"
            );
            Err(JsonResponse::forbidden_with_code(
                "This action is temporarily unavailable for your account. Please contact support.",
                "subscription_action_blocked",
            )
            .into_response())
        }
        AbuseAction::Flag => {
            warn!(
                account_id = %account.account_id,
                action = %action,
                risk_score = verdict.risk_score,
                indicators = ?verdict.indicators,
                "subscription action flagged for review"
            );
            Ok(())
        }
        AbuseAction::Warn | AbuseAction::Allow => Ok(()),
    }
}

pub async fn subscription_status(
    State(app_state): State<AppState>,
    AuthSession(claims): AuthSession,
) -> Response {
    let account = match load_account(&app_state, &claims).await {
        Ok(account) => account,
        Err(resp) => return resp,
    };

    let decision = evaluate_access(&account, Utc::now());
    if decision.status.is_integrity_failure() {
        warn!(
            account_id = %account.account_id,
            status = decision.status.as_str(),
            "account data failed integrity check"
        );
    }

    Json(json!({
        "subscription_status": decision.status.as_str(),
        "days_left": decision.days_left,
        "is_superuser": account.is_admin,
        "access_allowed": decision.is_allowed(),
        "trial_end": account.trial_end,
        "subscription_end": account.subscription_end,
    }))
    .into_response()
}

pub async fn start_trial(
    State(app_state): State<AppState>,
    AuthSession(claims): AuthSession,
) -> Response {
    let account = match load_account(&app_state, &claims).await {
        Ok(account) => account,
        Err(resp) => return resp,
    };

    let (trial_start, trial_end) = trial_window(Utc::now(), app_state.config.trial_duration_days);
    match app_state
        .db
        .start_trial(account.account_id, trial_start, trial_end)
        .await
    {
        Ok(true) => {
            info!(account_id = %account.account_id, %trial_end, "trial started");
            Json(json!({
                "success": true,
                "trial_start": trial_start,
                "trial_end": trial_end,
            }))
            .into_response()
        }
        Ok(false) => JsonResponse::conflict("A trial is only available once per account")
            .into_response(),
        Err(err) => {
            error!(?err, account_id = %account.account_id, "failed to start trial");
            JsonResponse::server_error("Failed to start trial").into_response()
        }
    }
}

pub async fn create_checkout(
    State(app_state): State<AppState>,
    AuthSession(claims): AuthSession,
    Json(body): Json<ActionBody>,
) -> Response {
    let account = match load_account(&app_state, &claims).await {
        Ok(account) => account,
        Err(resp) => return resp,
    };
    if account.subscription_status == SubscriptionStatus::Active {
        return JsonResponse::conflict("Subscription is already active").into_response();
    }

    let now = Utc::now();
    if let Err(resp) = screen_action(
        &app_state,
        &account,
        SubscriptionActionKind::Create,
        body.payment_fingerprint.as_deref(),
        now,
    )
    .await
    {
        return resp;
    }

    let account_id = account.account_id.to_string();
    let customer = match account.billing_customer_ref.clone() {
        Some(customer) => customer,
        None => {
            let email = account.email.as_deref().unwrap_or(&claims.email);
            let customer = match app_state.stripe.create_customer(email, &account_id).await {
                Ok(id) => id,
                Err(err) => {
                    error!(?err, %account_id, "failed to create billing customer");
                    return JsonResponse::bad_gateway("Billing provider unavailable")
                        .into_response();
                }
            };
            if let Err(err) = app_state
                .db
                .set_billing_customer_ref(account.account_id, &customer)
                .await
            {
                error!(?err, %account_id, "failed to store billing customer");
                return JsonResponse::server_error("Failed to start checkout").into_response();
            }
            customer
        }
    };

    let mut metadata = BTreeMap::new();
    metadata.insert("account_id".to_string(), account_id.clone());
    let request = CreateCheckoutSessionRequest {
        success_url: app_state.config.checkout_success_url(),
        cancel_url: app_state.config.checkout_cancel_url(),
        price: app_state.config.stripe.price_id.clone(),
        client_reference_id: Some(account_id.clone()),
        customer: Some(customer),
        metadata: Some(metadata),
    };

    match app_state.stripe.create_checkout_session(request).await {
        Ok(session) => {
            info!(%account_id, session_id = %session.id, "checkout session created");
            Json(json!({
                "success": true,
                "session_id": session.id,
                "checkout_url": session.url,
            }))
            .into_response()
        }
        Err(err) => {
            error!(?err, %account_id, "failed to create checkout session");
            JsonResponse::bad_gateway("Billing provider unavailable").into_response()
        }
    }
}

pub async fn cancel_subscription(
    State(app_state): State<AppState>,
    AuthSession(claims): AuthSession,
    Json(body): Json<ActionBody>,
) -> Response {
    let account = match load_account(&app_state, &claims).await {
        Ok(account) => account,
        Err(resp) => return resp,
    };
    let subscription_ref = match (&account.subscription_status, &account.subscription_ref) {
        (SubscriptionStatus::Active, Some(sub)) => sub.clone(),
        _ => {
            return JsonResponse::conflict("No active subscription to cancel").into_response();
        }
    };

    if let Err(resp) = screen_action(
        &app_state,
        &account,
        SubscriptionActionKind::Cancel,
        body.payment_fingerprint.as_deref(),
        Utc::now(),
    )
    .await
    {
        return resp;
    }

    match app_state
        .stripe
        .set_subscription_cancel_at_period_end(&subscription_ref, true)
        .await
    {
        Ok(sub) => {
            let cancel_at = sub
                .cancel_at
                .or(Some(sub.current_period_end))
                .and_then(from_unix);
            info!(account_id = %account.account_id, %subscription_ref, ?cancel_at, "cancellation scheduled");
            Json(json!({
                "success": true,
                "cancel_at": cancel_at,
            }))
            .into_response()
        }
        Err(err) => {
            error!(?err, account_id = %account.account_id, "failed to schedule cancellation");
            JsonResponse::bad_gateway("Billing provider unavailable").into_response()
        }
    }
}

pub async fn reactivate_subscription(
    State(app_state): State<AppState>,
    AuthSession(claims): AuthSession,
    Json(body): Json<ActionBody>,
) -> Response {
    let account = match load_account(&app_state, &claims).await {
        Ok(account) => account,
        Err(resp) => return resp,
    };
    let now = Utc::now();
    let still_paid = account.subscription_end.is_some_and(|end| now < end);
    let subscription_ref = match (&account.subscription_status, &account.subscription_ref) {
        (SubscriptionStatus::Canceled, Some(sub)) if still_paid => sub.clone(),
        (SubscriptionStatus::Canceled, Some(_)) => {
            return JsonResponse::conflict("Subscription has ended. Start a new checkout instead.")
                .into_response();
        }
        _ => {
            return JsonResponse::conflict("No scheduled cancellation to undo").into_response();
        }
    };

    if let Err(resp) = screen_action(
        &app_state,
        &account,
        SubscriptionActionKind::Reactivate,
        body.payment_fingerprint.as_deref(),
        now,
    )
    .await
    {
        return resp;
    }

    match app_state
        .stripe
        .set_subscription_cancel_at_period_end(&subscription_ref, false)
        .await
    {
        Ok(_) => {
            info!(account_id = %account.account_id, %subscription_ref, "scheduled cancellation removed");
            (StatusCode::OK, Json(json!({ "success": true }))).into_response()
        }
        Err(err) => {
            error!(?err, account_id = %account.account_id, "failed to reactivate subscription");
            JsonResponse::bad_gateway("Billing provider unavailable").into_response()
        }
    }
}

/// Sends the caller to the provider's hosted billing page, where a denied
/// subscriber can fix a failed payment or change plans.
pub async fn billing_portal(
    State(app_state): State<AppState>,
    AuthSession(claims): AuthSession,
) -> Response {
    let account = match load_account(&app_state, &claims).await {
        Ok(account) => account,
        Err(resp) => return resp,
    };
    let Some(customer) = account.billing_customer_ref.clone() else {
        return JsonResponse::conflict("No billing account yet. Start a checkout first.")
            .into_response();
    };

    let request = CreateBillingPortalSessionRequest {
        customer,
        return_url: app_state.config.billing_portal_return_url(),
    };
    match app_state.stripe.create_billing_portal_session(request).await {
        Ok(url) => {
            info!(account_id = %account.account_id, "billing portal session created");
            Json(json!({ "success": true, "portal_url": url })).into_response()
        }
        Err(err) => {
            error!(?err, account_id = %account.account_id, "failed to create billing portal session");
            JsonResponse::bad_gateway("Billing provider unavailable").into_response()
        }
    }
}
